//! 发送队列
//!
//! 断线期间按到达顺序缓冲帧，重连后恰好补发一次。写失败的帧放回队首，
//! 超过重试上限后永久失败；缓冲超过最大时长的帧不再补发。
//! 需要 ACK 的帧在入队时就已登记到 [`PendingRequests`]，队列里只保留帧本身。

pub mod pending;

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

pub use pending::{Completion, MessageRef, PendingRequest, PendingRequests};

use crate::codec::Frame;
use crate::config::{OverflowPolicy, QueueConfig};
use crate::retry_policy::SendRetryPolicy;

#[derive(Debug)]
pub struct QueuedMessage {
    pub frame: Frame,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    /// 不需要 ACK 的帧写出后即完成；需要 ACK 的帧此处为 None
    pub completion: Option<Completion>,
}

impl QueuedMessage {
    pub fn new(frame: Frame, completion: Option<Completion>) -> Self {
        Self {
            frame,
            enqueued_at: Instant::now(),
            retry_count: 0,
            completion,
        }
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// 入队结果
#[derive(Debug)]
pub enum Admission {
    Accepted,
    /// 队列已满，挤掉了最早的帧
    Evicted(QueuedMessage),
    /// 队列已满，新帧被拒绝
    Rejected(QueuedMessage),
}

pub struct OutboundQueue {
    buffer: VecDeque<QueuedMessage>,
    capacity: usize,
    overflow_policy: OverflowPolicy,
    max_age: Duration,
    retry: SendRetryPolicy,
}

impl OutboundQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            buffer: VecDeque::new(),
            capacity: config.capacity,
            overflow_policy: config.overflow_policy,
            max_age: Duration::from_millis(config.max_age_ms),
            retry: SendRetryPolicy::new(config),
        }
    }

    pub fn push(&mut self, message: QueuedMessage) -> Admission {
        if self.buffer.len() < self.capacity {
            debug!("📥 帧入队: id={} method={}", message.frame.id, message.frame.method);
            self.buffer.push_back(message);
            return Admission::Accepted;
        }
        match self.overflow_policy {
            OverflowPolicy::RejectNewest => {
                warn!("发送队列已满({})，拒绝新帧 {}", self.capacity, message.frame.id);
                Admission::Rejected(message)
            }
            OverflowPolicy::DropOldest => match self.buffer.pop_front() {
                Some(oldest) => {
                    warn!("发送队列已满({})，丢弃最早的帧 {}", self.capacity, oldest.frame.id);
                    self.buffer.push_back(message);
                    Admission::Evicted(oldest)
                }
                None => Admission::Rejected(message),
            },
        }
    }

    /// 移除所有缓冲过久的帧
    pub fn drain_expired(&mut self) -> Vec<QueuedMessage> {
        let max_age = self.max_age;
        let (expired, fresh): (VecDeque<_>, VecDeque<_>) =
            self.buffer.drain(..).partition(|m| m.age() > max_age);
        self.buffer = fresh;
        if !expired.is_empty() {
            warn!("⏰ {} 个帧缓冲超过 {}ms，不再补发", expired.len(), max_age.as_millis());
        }
        expired.into_iter().collect()
    }

    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.buffer.pop_front()
    }

    /// 写失败后放回队首。超过重试上限时原样返回，由调用方判定永久失败
    pub fn requeue_front(&mut self, mut message: QueuedMessage) -> Result<(), QueuedMessage> {
        if !self.retry.should_retry(message.retry_count) {
            return Err(message);
        }
        message.retry_count += 1;
        debug!("帧 {} 写失败，第 {} 次重试", message.frame.id, message.retry_count);
        self.buffer.push_front(message);
        Ok(())
    }

    /// 按帧 ID 移除还在缓冲中的帧（例如 ACK 已超时）
    pub fn remove(&mut self, id: &str) -> Option<QueuedMessage> {
        let index = self.buffer.iter().position(|m| m.frame.id == id)?;
        self.buffer.remove(index)
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry.retry_delay()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.buffer.drain(..).collect()
    }
}
