use std::time::Duration;

use tracing::debug;

use crate::config::{QueueConfig, ReconnectConfig};

/// 重连退避策略
///
/// 第 n 次重连（从 1 开始）的延迟 = base × factor^(n-1)，不超过 max_delay；
/// n 超过 max_attempts 时不再调度。
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// 计算第 `attempt` 次重连的延迟，超出次数上限时返回 None
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_attempts {
            return None;
        }

        let base = self.config.base_delay_ms as f64;
        let exponent = (attempt - 1) as i32;
        let capped = (base * self.config.backoff_factor.powi(exponent))
            .min(self.config.max_delay_ms as f64);

        // 添加随机抖动
        let jitter = if self.config.jitter_factor > 0.0 {
            capped * self.config.jitter_factor * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };
        let final_delay = (capped + jitter).max(0.0);

        debug!("重连第 {} 次，退避 {}ms", attempt, final_delay as u64);
        Some(Duration::from_millis(final_delay as u64))
    }
}

/// 写失败重试策略
#[derive(Debug, Clone)]
pub struct SendRetryPolicy {
    max_retries: u32,
    retry_delay: Duration,
}

impl SendRetryPolicy {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_send_retries,
            retry_delay: Duration::from_millis(config.send_retry_delay_ms),
        }
    }

    /// 已重试 `retry_count` 次后是否还能再试
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let policy = ReconnectPolicy::new(ReconnectConfig::default());
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| policy.delay_for(attempt).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![3000, 4500, 6750, 10125, 15187]);

        // 第 6 次被拒绝
        assert!(policy.delay_for(6).is_none());
        assert!(policy.delay_for(0).is_none());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            max_delay_ms: 5000,
            max_attempts: 10,
            ..ReconnectConfig::default()
        });
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(4500)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(5000)));
        assert_eq!(policy.delay_for(10), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            jitter_factor: 0.2,
            ..ReconnectConfig::default()
        });
        for _ in 0..50 {
            let ms = policy.delay_for(1).unwrap().as_millis() as u64;
            assert!((2700..=3300).contains(&ms), "delay {} out of band", ms);
        }
    }

    #[test]
    fn test_send_retry_budget() {
        let policy = SendRetryPolicy::new(&QueueConfig::default());
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.retry_delay(), Duration::from_millis(1000));
    }
}
