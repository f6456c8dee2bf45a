//! SDK 配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::timer::MAX_DELAY;

/// 聊天客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// 单次建立连接（含认证握手）的超时时间（毫秒）
    pub connect_timeout_ms: u64,
    /// 心跳配置
    pub heartbeat: HeartbeatConfig,
    /// 重连配置
    pub reconnect: ReconnectConfig,
    /// 发送队列配置
    pub queue: QueueConfig,
    /// 本地缓存配置
    pub cache: CacheConfig,
    /// 事件配置
    pub event: EventConfig,
    /// 调试模式（打印每一帧）
    pub debug_mode: bool,
}

/// 心跳配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// 心跳间隔（毫秒）
    pub interval_ms: u64,
    /// 等待回包的超时（毫秒）
    pub timeout_ms: u64,
}

/// 重连配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 最大重连次数，超过后视为连接丢失
    pub max_attempts: u32,
    /// 随机抖动因子 (0.0-1.0)，默认不抖动
    pub jitter_factor: f64,
}

/// 队列溢出策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// 丢弃最早的缓冲帧
    DropOldest,
    /// 拒绝新帧
    RejectNewest,
}

/// 发送队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 断线缓冲的最大帧数
    pub capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// 缓冲超过此时长（毫秒）的帧在重连后不再补发
    pub max_age_ms: u64,
    /// 默认 ACK 超时（毫秒）
    pub ack_timeout_ms: u64,
    /// 写失败后的最大重试次数
    pub max_send_retries: u32,
    /// 写失败后再次 flush 的延迟（毫秒）
    pub send_retry_delay_ms: u64,
}

/// 本地缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 每个会话缓存的消息条数上限
    pub messages_per_conversation: usize,
    /// 入站帧去重的保留时间（秒）
    pub dedup_retention_secs: u64,
    /// 去重缓存的最大条数
    pub dedup_capacity: usize,
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// 广播通道缓冲区大小
    pub buffer_size: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            event: EventConfig::default(),
            debug_mode: false,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 10_000,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 3_000,
            backoff_factor: 1.5,
            max_delay_ms: 60_000,
            max_attempts: 5,
            jitter_factor: 0.0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            overflow_policy: OverflowPolicy::DropOldest,
            max_age_ms: 5 * 60 * 1000,
            ack_timeout_ms: 15_000,
            max_send_retries: 3,
            send_retry_delay_ms: 1_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            messages_per_conversation: 500,
            dedup_retention_secs: 600,
            dedup_capacity: 10_000,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

impl ChatConfig {
    pub fn builder() -> ChatConfigBuilder {
        ChatConfigBuilder::new()
    }

    /// 从宿主应用提供的 JSON 读取配置，缺省字段取默认值
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ChatConfig =
            serde_json::from_str(json).map_err(|e| ChatError::Config(format!("解析配置失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(ChatError::Config("连接超时不能为0".to_string()));
        }
        if self.heartbeat.enabled {
            if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms == 0 {
                return Err(ChatError::Config("心跳间隔和超时不能为0".to_string()));
            }
        }
        let reconnect = &self.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(ChatError::Config("重连基础延迟不能为0".to_string()));
        }
        if reconnect.backoff_factor < 1.0 {
            return Err(ChatError::Config("退避因子不能小于1.0".to_string()));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(ChatError::Config("最大延迟不能小于基础延迟".to_string()));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter_factor) {
            return Err(ChatError::Config("抖动因子必须在 0.0-1.0 之间".to_string()));
        }
        if self.queue.capacity == 0 {
            return Err(ChatError::Config("发送队列容量不能为0".to_string()));
        }
        if self.queue.ack_timeout_ms == 0 {
            return Err(ChatError::Config("ACK 超时不能为0".to_string()));
        }
        if self.cache.messages_per_conversation == 0 {
            return Err(ChatError::Config("会话消息缓存上限不能为0".to_string()));
        }
        if self.event.buffer_size == 0 {
            return Err(ChatError::Config("事件缓冲区不能为0".to_string()));
        }

        let max_ms = MAX_DELAY.as_millis() as u64;
        let delays = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("heartbeat.interval_ms", self.heartbeat.interval_ms),
            ("heartbeat.timeout_ms", self.heartbeat.timeout_ms),
            ("reconnect.max_delay_ms", reconnect.max_delay_ms),
            ("queue.ack_timeout_ms", self.queue.ack_timeout_ms),
            ("queue.send_retry_delay_ms", self.queue.send_retry_delay_ms),
        ];
        if let Some((name, _)) = delays.iter().find(|(_, ms)| *ms > max_ms) {
            return Err(ChatError::Config(format!("{} 不能超过 {}ms", name, max_ms)));
        }
        Ok(())
    }
}

/// 配置构建器
pub struct ChatConfigBuilder {
    config: ChatConfig,
}

impl ChatConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ChatConfig::default(),
        }
    }

    pub fn connect_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.connect_timeout_ms = timeout;
        self
    }

    /// 设置心跳间隔与超时（毫秒）
    pub fn heartbeat(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.config.heartbeat.interval_ms = interval_ms;
        self.config.heartbeat.timeout_ms = timeout_ms;
        self
    }

    pub fn disable_heartbeat(mut self) -> Self {
        self.config.heartbeat.enabled = false;
        self
    }

    pub fn reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect = config;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.config.queue = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event = config;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> ChatConfig {
        self.config
    }
}

impl Default for ChatConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
