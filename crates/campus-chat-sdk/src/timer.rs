//! 客户端定时器
//!
//! 心跳、心跳超时、重连退避、发送重试、ACK 超时全部挂在同一个
//! [`DelayQueue`] 上，由事件循环统一轮询。同一种定时器同时最多一个，
//! 重复调度会重置到期时间；取消已触发或不存在的定时器是空操作。

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::warn;

/// 单个定时器的最长延迟。`DelayQueue` 的时间轮大约只能覆盖两年
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    HeartbeatTick,
    HeartbeatTimeout,
    Reconnect,
    SendRetry,
    /// 按帧 ID 的 ACK 超时
    AckTimeout(String),
}

#[derive(Default)]
pub struct TimerWheel {
    queue: DelayQueue<TimerKind>,
    keys: HashMap<TimerKind, Key>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调度定时器；已存在同类定时器时重置到期时间。超过 [`MAX_DELAY`] 的延迟按上限处理
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        let delay = if delay > MAX_DELAY {
            warn!("⏱️ 定时器 {:?} 延迟 {:?} 超过上限，按 {:?} 处理", kind, delay, MAX_DELAY);
            MAX_DELAY
        } else {
            delay
        };
        match self.keys.get(&kind) {
            Some(key) => self.queue.reset(key, delay),
            None => {
                let key = self.queue.insert(kind.clone(), delay);
                self.keys.insert(kind, key);
            }
        }
    }

    /// 取消定时器，返回是否真的取消了一个未触发的定时器
    pub fn cancel(&mut self, kind: &TimerKind) -> bool {
        match self.keys.remove(kind) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    /// 当前存活的定时器数量
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.keys.clear();
    }

    /// 等待下一个到期的定时器；队列为空时立即返回 `None`
    pub async fn next_expired(&mut self) -> Option<TimerKind> {
        let expired = self.queue.next().await?;
        let kind = expired.into_inner();
        // 先摘掉 key，之后的 cancel 都是空操作
        self.keys.remove(&kind);
        Some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(TimerKind::Reconnect, Duration::from_millis(300));
        wheel.schedule(TimerKind::HeartbeatTick, Duration::from_millis(100));
        wheel.schedule(TimerKind::AckTimeout("a".into()), Duration::from_millis(200));
        assert_eq!(wheel.len(), 3);

        let start = Instant::now();
        assert_eq!(wheel.next_expired().await, Some(TimerKind::HeartbeatTick));
        assert_eq!(wheel.next_expired().await, Some(TimerKind::AckTimeout("a".into())));
        assert_eq!(wheel.next_expired().await, Some(TimerKind::Reconnect));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(wheel.is_empty());
        assert_eq!(wheel.next_expired().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(TimerKind::HeartbeatTimeout, Duration::from_millis(10));
        assert!(wheel.cancel(&TimerKind::HeartbeatTimeout));
        assert!(!wheel.cancel(&TimerKind::HeartbeatTimeout));

        wheel.schedule(TimerKind::SendRetry, Duration::from_millis(10));
        assert_eq!(wheel.next_expired().await, Some(TimerKind::SendRetry));
        // 已触发后再取消
        assert!(!wheel.cancel(&TimerKind::SendRetry));
        assert_eq!(wheel.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_resets_deadline() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(TimerKind::HeartbeatTick, Duration::from_millis(100));
        wheel.schedule(TimerKind::HeartbeatTick, Duration::from_millis(500));
        assert_eq!(wheel.len(), 1);

        let start = Instant::now();
        assert_eq!(wheel.next_expired().await, Some(TimerKind::HeartbeatTick));
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_delay_is_capped() {
        let mut wheel = TimerWheel::new();
        let ten_years = Duration::from_secs(10 * 365 * 24 * 60 * 60);
        wheel.schedule(TimerKind::AckTimeout("slow".into()), ten_years);
        wheel.schedule(TimerKind::Reconnect, Duration::MAX);
        assert_eq!(wheel.len(), 2);

        let start = Instant::now();
        assert!(wheel.next_expired().await.is_some());
        assert!(wheel.next_expired().await.is_some());
        assert!(start.elapsed() >= MAX_DELAY);
        assert!(start.elapsed() < ten_years);
    }
}
