use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::CacheConfig;

/// 入站帧去重
///
/// 在保留窗口内记录已处理的帧 ID，服务端重投的推送只处理一次。
pub struct DeduplicationManager {
    /// 帧 ID -> 首次处理时间
    processed: HashMap<String, Instant>,
    retention: Duration,
    max_size: usize,
    /// 超过此数量时触发清理
    cleanup_threshold: usize,
}

impl DeduplicationManager {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_config(
            Duration::from_secs(config.dedup_retention_secs),
            config.dedup_capacity,
        )
    }

    pub fn with_config(retention: Duration, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            processed: HashMap::new(),
            retention,
            max_size,
            cleanup_threshold: max_size * 4 / 5, // 80% 阈值
        }
    }

    /// 检查并标记。返回 true 表示窗口内已经处理过（重复）
    pub fn check_and_mark(&mut self, id: &str) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.processed.get(id) {
            if now.duration_since(*seen_at) <= self.retention {
                debug!("🔄 检测到重复帧: id={}", id);
                return true;
            }
        }
        self.processed.insert(id.to_string(), now);

        if self.processed.len() > self.cleanup_threshold {
            self.cleanup_expired();
        }
        while self.processed.len() > self.max_size {
            self.evict_oldest();
        }
        false
    }

    pub fn cleanup_expired(&mut self) {
        let now = Instant::now();
        let initial = self.processed.len();
        let retention = self.retention;
        self.processed
            .retain(|_, seen_at| now.duration_since(*seen_at) <= retention);

        let removed = initial - self.processed.len();
        if removed > 0 {
            info!("🧹 清理过期去重记录: 移除 {} 条，剩余 {} 条", removed, self.processed.len());
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .processed
            .iter()
            .min_by_key(|(_, seen_at)| **seen_at)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.processed.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window() {
        let mut dedup = DeduplicationManager::with_config(Duration::from_secs(60), 100);
        assert!(!dedup.check_and_mark("f1"));
        assert!(dedup.check_and_mark("f1"));
        assert!(!dedup.check_and_mark("f2"));

        tokio::time::advance(Duration::from_secs(61)).await;
        // 窗口外的重投重新计为新帧
        assert!(!dedup.check_and_mark("f1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_is_bounded() {
        let mut dedup = DeduplicationManager::with_config(Duration::from_secs(600), 5);
        for i in 0..10 {
            dedup.check_and_mark(&format!("f{}", i));
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(dedup.len(), 5);
        // 最早的记录被淘汰
        assert!(!dedup.check_and_mark("f0"));
        assert!(dedup.check_and_mark("f9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let mut dedup = DeduplicationManager::with_config(Duration::from_secs(1), 100);
        dedup.check_and_mark("a");
        dedup.check_and_mark("b");
        tokio::time::advance(Duration::from_secs(2)).await;
        dedup.cleanup_expired();
        assert!(dedup.is_empty());
    }
}
