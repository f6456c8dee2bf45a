//! 在线状态缓存
//!
//! 记录 `presence.online` 推送，按用户保留最新状态。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 用户在线状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    #[serde(alias = "uid", alias = "id")]
    pub user_id: String,
    #[serde(default)]
    pub online: bool,
    /// 最后在线时间（UTC毫秒时间戳）
    #[serde(default, alias = "lastOnline")]
    pub last_seen: Option<i64>,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Default)]
pub struct PresenceCache {
    entries: HashMap<String, PresenceInfo>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入最新状态，返回状态是否真的变化
    pub fn update(&mut self, info: PresenceInfo) -> bool {
        match self.entries.get(&info.user_id) {
            Some(existing) if existing == &info => false,
            _ => {
                self.entries.insert(info.user_id.clone(), info);
                true
            }
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceInfo> {
        self.entries.get(user_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.entries.get(user_id).map(|p| p.online).unwrap_or(false)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .entries
            .values()
            .filter(|p| p.online)
            .map(|p| p.user_id.clone())
            .collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_reports_changes() {
        let mut cache = PresenceCache::new();
        let online: PresenceInfo =
            serde_json::from_value(serde_json::json!({"userId": "u2", "online": true})).unwrap();
        assert!(cache.update(online.clone()));
        assert!(!cache.update(online));
        assert!(cache.is_online("u2"));

        let offline: PresenceInfo =
            serde_json::from_value(serde_json::json!({"uid": "u2", "online": false, "lastOnline": 99}))
                .unwrap();
        assert!(cache.update(offline));
        assert!(!cache.is_online("u2"));
        assert_eq!(cache.get("u2").unwrap().last_seen, Some(99));
        assert!(cache.online_users().is_empty());
    }
}
