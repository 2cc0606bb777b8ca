use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// 移除规则的 token 前缀
const REMOVE_PREFIX: &str = "-:";

/// 分组倍率注册表：分组 -> 计费倍率，外加展示排序与分组间倍率等辅助映射。
///
/// 进程内共享，读多写少；所有修改接口都走 JSON 串，便于与配置存储对接。
pub struct GroupRatioRegistry {
    ratios: RwLock<HashMap<String, f64>>,
    /// 分组展示排序（可为空）
    order: RwLock<Vec<String>>,
    /// user_group -> { using_group -> ratio }
    group_group_ratios: RwLock<HashMap<String, HashMap<String, f64>>>,
    /// user_group -> { token -> special_group }，token 带 "-:" 前缀表示移除
    special_usable_groups: RwLock<HashMap<String, HashMap<String, String>>>,
    /// "auto" 分组展开出的分组链
    auto_groups: RwLock<Vec<String>>,
}

fn default_ratios() -> HashMap<String, f64> {
    HashMap::from([
        ("default".to_string(), 1.0),
        ("vip".to_string(), 1.0),
        ("svip".to_string(), 1.0),
    ])
}

impl Default for GroupRatioRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRatioRegistry {
    pub fn new() -> Self {
        Self {
            ratios: RwLock::new(default_ratios()),
            order: RwLock::new(Vec::new()),
            group_group_ratios: RwLock::new(HashMap::new()),
            special_usable_groups: RwLock::new(HashMap::new()),
            auto_groups: RwLock::new(Vec::new()),
        }
    }

    pub fn clear(&self) {
        *self.ratios.write().unwrap() = default_ratios();
        self.order.write().unwrap().clear();
        self.group_group_ratios.write().unwrap().clear();
        self.special_usable_groups.write().unwrap().clear();
        self.auto_groups.write().unwrap().clear();
    }

    /// 未配置的分组按 1.0 计并记录一条日志。
    pub fn ratio(&self, name: &str) -> f64 {
        match self.ratios.read().unwrap().get(name) {
            Some(v) => *v,
            None => {
                tracing::info!(group = name, "group ratio not found, fallback to 1.0");
                1.0
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ratios.read().unwrap().contains_key(name)
    }

    pub fn ratios_json(&self) -> String {
        serde_json::to_string(&*self.ratios.read().unwrap()).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn update_ratios_from_json(&self, json_str: &str) -> anyhow::Result<()> {
        let parsed = check_ratios_json(json_str)?;
        *self.ratios.write().unwrap() = parsed;
        Ok(())
    }

    pub fn group_group_ratio(&self, user_group: &str, using_group: &str) -> Option<f64> {
        self.group_group_ratios
            .read()
            .unwrap()
            .get(user_group)?
            .get(using_group)
            .copied()
    }

    pub fn group_group_ratios_json(&self) -> String {
        serde_json::to_string(&*self.group_group_ratios.read().unwrap())
            .unwrap_or_else(|_| "{}".to_string())
    }

    pub fn update_group_group_ratios_from_json(&self, json_str: &str) -> anyhow::Result<()> {
        let parsed: HashMap<String, HashMap<String, f64>> = serde_json::from_str(json_str)?;
        for (user_group, inner) in &parsed {
            for (using_group, ratio) in inner {
                if *ratio < 0.0 {
                    anyhow::bail!("group ratio must be not less than 0: {user_group}/{using_group}");
                }
            }
        }
        *self.group_group_ratios.write().unwrap() = parsed;
        Ok(())
    }

    pub fn special_usable_groups_json(&self) -> String {
        serde_json::to_string(&*self.special_usable_groups.read().unwrap())
            .unwrap_or_else(|_| "{}".to_string())
    }

    pub fn update_special_usable_groups_from_json(&self, json_str: &str) -> anyhow::Result<()> {
        let parsed: HashMap<String, HashMap<String, String>> = serde_json::from_str(json_str)?;
        *self.special_usable_groups.write().unwrap() = parsed;
        Ok(())
    }

    pub fn order(&self) -> Vec<String> {
        self.order.read().unwrap().clone()
    }

    pub fn order_json(&self) -> String {
        serde_json::to_string(&*self.order.read().unwrap()).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn update_order_from_json(&self, json_str: &str) -> anyhow::Result<()> {
        if json_str.is_empty() {
            self.order.write().unwrap().clear();
            return Ok(());
        }
        let parsed: Vec<String> = serde_json::from_str(json_str)?;
        *self.order.write().unwrap() = parsed;
        Ok(())
    }

    /// 先按配置的排序返回，未配置排序的分组按字母序排在后面。
    pub fn sorted_group_names(&self) -> Vec<String> {
        let mut all: Vec<String> = self.ratios.read().unwrap().keys().cloned().collect();
        let order = self.order.read().unwrap().clone();

        if order.is_empty() {
            all.sort();
            return all;
        }

        let order_index: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        all.sort_by(|a, b| {
            match (order_index.get(a.as_str()), order_index.get(b.as_str())) {
                (Some(ia), Some(ib)) => ia.cmp(ib),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.cmp(b),
            }
        });

        all
    }

    pub fn set_auto_groups(&self, groups: Vec<String>) {
        *self.auto_groups.write().unwrap() = groups;
    }

    pub fn auto_groups(&self) -> Vec<String> {
        self.auto_groups.read().unwrap().clone()
    }

    /// 按用户分组的特殊规则展开 auto 分组链：
    /// "-:" 前缀的规则把目标分组从链里移除，其余规则把目标分组追加到链尾。
    pub fn user_auto_groups(&self, user_group: &str) -> Vec<String> {
        let mut chain = self.auto_groups.read().unwrap().clone();

        let special = self.special_usable_groups.read().unwrap();
        let Some(rules) = special.get(user_group) else {
            return chain;
        };

        for (token, group) in rules {
            if token.starts_with(REMOVE_PREFIX) {
                chain.retain(|g| g != group);
            } else if !chain.contains(group) {
                chain.push(group.clone());
            }
        }
        chain
    }
}

pub fn check_ratios_json(json_str: &str) -> anyhow::Result<HashMap<String, f64>> {
    let parsed: HashMap<String, f64> = serde_json::from_str(json_str)?;
    for (name, ratio) in &parsed {
        if *ratio < 0.0 {
            anyhow::bail!("group ratio must be not less than 0: {name}");
        }
    }
    Ok(parsed)
}

/// 方便序列化整组配置时使用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRatioSnapshot {
    pub group_ratio: HashMap<String, f64>,
    pub group_group_ratio: HashMap<String, HashMap<String, f64>>,
    pub group_special_usable_group: HashMap<String, HashMap<String, String>>,
}

impl GroupRatioRegistry {
    pub fn snapshot(&self) -> GroupRatioSnapshot {
        GroupRatioSnapshot {
            group_ratio: self.ratios.read().unwrap().clone(),
            group_group_ratio: self.group_group_ratios.read().unwrap().clone(),
            group_special_usable_group: self.special_usable_groups.read().unwrap().clone(),
        }
    }
}
