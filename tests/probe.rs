use axum::{Router, http::StatusCode, routing::get};

use relaycore::probe::{ChannelTester, HttpChannelTester};
use relaycore::storage::{Channel, ChannelStatus};

async fn spawn_upstream(status: StatusCode, body: &'static str) -> String {
    let app = Router::new().route(
        "/v1/models",
        get(move || async move {
            (
                status,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                body,
            )
        }),
    );

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    format!("http://127.0.0.1:{}", addr.port())
}

fn make_channel(base_url: String) -> Channel {
    Channel {
        id: 1,
        name: "probe-target".to_string(),
        base_url,
        api_key: "sk-test".to_string(),
        group_names: "default".to_string(),
        models: "m1".to_string(),
        status: ChannelStatus::AutoDisabled,
        priority: 0,
        weight: 0,
        response_time_ms: 0,
        test_time_ms: 0,
        created_at_ms: 0,
        updated_at_ms: 0,
    }
}

#[tokio::test]
async fn http_tester_reports_success_on_2xx() {
    let base = spawn_upstream(StatusCode::OK, r#"{"data":[]}"#).await;
    let tester = HttpChannelTester::new();
    let channel = make_channel(base);

    let ok = tester.test(&channel, "m1").await.expect("probe");
    assert!(ok);
}

#[tokio::test]
async fn http_tester_reports_failure_on_5xx() {
    let base = spawn_upstream(StatusCode::INTERNAL_SERVER_ERROR, r#"{"err":true}"#).await;
    let tester = HttpChannelTester::new();
    let channel = make_channel(base);

    let ok = tester.test(&channel, "m1").await.expect("probe");
    assert!(!ok);
}

#[tokio::test]
async fn http_tester_errors_on_unreachable_upstream() {
    let tester = HttpChannelTester::new();
    let channel = make_channel("http://127.0.0.1:1".to_string());

    assert!(tester.test(&channel, "m1").await.is_err());
}
