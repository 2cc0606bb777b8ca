use relaycore::admin;
use relaycore::groups::GroupRatioRegistry;
use relaycore::ratelimit::RateLimiter;
use relaycore::storage::{self, ChannelStatus, CreateChannel};

fn temp_db_path() -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("relaycore-test-{}.sqlite", uuid::Uuid::new_v4()));
    p
}

async fn seed_channel(db_path: std::path::PathBuf) -> i64 {
    storage::create_channel(
        db_path,
        CreateChannel {
            name: "c".to_string(),
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: "k".to_string(),
            group_names: "default".to_string(),
            models: "m1".to_string(),
            priority: 0,
            weight: 0,
            status: ChannelStatus::Enabled,
        },
    )
    .await
    .expect("create channel")
    .id
}

#[tokio::test]
async fn channel_settings_round_trip_and_upsert() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let channel_id = seed_channel(db_path.clone()).await;

    storage::set_channel_settings(db_path.clone(), channel_id, true, 30)
        .await
        .expect("set settings");
    let first = storage::get_channel_settings(db_path.clone(), channel_id)
        .await
        .expect("get settings")
        .expect("settings exist");
    assert!(first.auto_enable);
    assert_eq!(first.max_rpm, 30);

    // 再次写入走更新而不是新建，行 id 不变
    storage::set_channel_settings(db_path.clone(), channel_id, false, 60)
        .await
        .expect("set settings again");
    let second = storage::get_channel_settings(db_path.clone(), channel_id)
        .await
        .expect("get settings")
        .expect("settings exist");
    assert_eq!(second.id, first.id);
    assert!(!second.auto_enable);
    assert_eq!(second.max_rpm, 60);
}

#[tokio::test]
async fn set_auto_enable_is_idempotent_and_preserves_max_rpm() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let channel_id = seed_channel(db_path.clone()).await;

    storage::set_channel_max_rpm(db_path.clone(), channel_id, 42)
        .await
        .expect("set max rpm");

    storage::set_channel_auto_enable(db_path.clone(), channel_id, true)
        .await
        .expect("set auto enable");
    storage::set_channel_auto_enable(db_path.clone(), channel_id, true)
        .await
        .expect("set auto enable twice");

    let settings = storage::get_channel_settings(db_path.clone(), channel_id)
        .await
        .expect("get settings")
        .expect("settings exist");
    assert!(settings.auto_enable);
    assert_eq!(settings.max_rpm, 42);

    let ids = storage::get_all_auto_enable_channel_ids(db_path.clone())
        .await
        .expect("list ids");
    assert_eq!(ids, vec![channel_id]);
}

#[tokio::test]
async fn negative_max_rpm_is_coerced_to_zero() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let channel_id = seed_channel(db_path.clone()).await;

    let limiter = RateLimiter::new(db_path.clone());
    let resp = admin::set_channel_max_rpm(db_path.clone(), channel_id, -5).await;
    assert!(resp.success);

    let view = admin::get_channel_max_rpm(db_path.clone(), &limiter, channel_id)
        .await
        .data
        .expect("view");
    assert_eq!(view.max_rpm, 0);
}

#[tokio::test]
async fn admin_rejects_missing_channel_and_empty_batches() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    let resp = admin::set_channel_settings(db_path.clone(), 9999, true, 10).await;
    assert!(!resp.success);
    assert_eq!(resp.message, "渠道不存在");

    let resp = admin::batch_set_channel_auto_enable(db_path.clone(), vec![], true).await;
    assert!(!resp.success);
    assert!(resp.message.contains("不能为空"));
}

#[tokio::test]
async fn admin_returns_defaults_for_unconfigured_channel() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let channel_id = seed_channel(db_path.clone()).await;

    let limiter = RateLimiter::new(db_path.clone());
    let resp = admin::get_channel_settings(db_path.clone(), &limiter, channel_id).await;
    assert!(resp.success);
    let view = resp.data.expect("view");
    assert!(!view.auto_enable);
    assert_eq!(view.max_rpm, 0);
    assert_eq!(view.current_rpm, 0);
}

#[tokio::test]
async fn batch_set_reports_per_channel_success() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let id1 = seed_channel(db_path.clone()).await;
    let id2 = seed_channel(db_path.clone()).await;

    let resp = admin::batch_set_channel_auto_enable(db_path.clone(), vec![id1, id2], true).await;
    assert!(resp.success);
    let result = resp.data.expect("result");
    assert_eq!(result.total, 2);
    assert_eq!(result.success, 2);

    let map = admin::batch_get_channel_auto_enable(db_path.clone(), vec![id1, id2])
        .await
        .data
        .expect("map");
    assert_eq!(map.get(&id1), Some(&true));
    assert_eq!(map.get(&id2), Some(&true));
}

#[test]
fn group_ratio_json_round_trip_is_identity() {
    let registry = GroupRatioRegistry::new();
    registry
        .update_ratios_from_json(r#"{"default":1.0,"vip":0.8,"batch":0.5}"#)
        .unwrap();

    let json = registry.ratios_json();
    let other = GroupRatioRegistry::new();
    other.update_ratios_from_json(&json).unwrap();

    assert_eq!(other.ratio("vip"), 0.8);
    assert_eq!(other.ratio("batch"), 0.5);
    assert_eq!(other.ratios_json().len(), json.len());
}

#[test]
fn sorted_group_names_respects_configured_order() {
    let registry = GroupRatioRegistry::new();
    registry
        .update_ratios_from_json(r#"{"alpha":1.0,"beta":1.0,"zeta":1.0,"prio":2.0}"#)
        .unwrap();
    registry
        .update_order_from_json(r#"["prio","zeta"]"#)
        .unwrap();

    // 配置过排序的在前，其余按字母序
    assert_eq!(
        registry.sorted_group_names(),
        vec!["prio", "zeta", "alpha", "beta"]
    );

    registry.update_order_from_json("").unwrap();
    assert_eq!(
        registry.sorted_group_names(),
        vec!["alpha", "beta", "prio", "zeta"]
    );
}

#[test]
fn group_group_ratio_lookup() {
    let registry = GroupRatioRegistry::new();
    registry
        .update_group_group_ratios_from_json(r#"{"vip":{"default":0.9}}"#)
        .unwrap();

    assert_eq!(registry.group_group_ratio("vip", "default"), Some(0.9));
    assert_eq!(registry.group_group_ratio("vip", "other"), None);
    assert_eq!(registry.group_group_ratio("svip", "default"), None);

    let err = registry
        .update_group_group_ratios_from_json(r#"{"vip":{"default":-0.1}}"#)
        .unwrap_err();
    assert!(err.to_string().contains("not less than 0"));
}

#[tokio::test]
async fn gateway_settings_round_trip_with_clamped_accessors() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    let settings = storage::get_gateway_settings(db_path.clone())
        .await
        .expect("defaults");
    assert_eq!(settings.auto_enable_interval(), 30);
    assert_eq!(settings.auto_enable_threshold(), 50);
    assert_eq!(settings.max_retry(), 2);

    let settings = storage::update_gateway_settings(
        db_path.clone(),
        storage::GatewaySettingsPatch {
            auto_enable_enabled: Some(true),
            auto_enable_success_rate_threshold: Some(150),
            auto_enable_interval_minutes: Some(-3),
            max_retry_per_group: Some(0),
            model_priorities: Some("gpt-a:90".to_string()),
            ..Default::default()
        },
    )
    .await
    .expect("update");

    assert!(settings.auto_enable_enabled);
    // 越界值读取时被钳制
    assert_eq!(settings.auto_enable_threshold(), 100);
    assert_eq!(settings.auto_enable_interval(), 30);
    assert_eq!(settings.max_retry(), 2);
    assert_eq!(settings.model_priorities, "gpt-a:90");

    // 重新加载后保持
    let reloaded = storage::get_gateway_settings(db_path.clone())
        .await
        .expect("reload");
    assert!(reloaded.auto_enable_enabled);
    assert_eq!(reloaded.auto_enable_success_rate_threshold, 150);
}
