//! 心跳监测
//!
//! 纯状态机，不持有定时器：事件循环在 tick / 回包 / 超时时调用对应方法，
//! 再根据返回值调度 [`TimerKind::HeartbeatTimeout`](crate::timer::TimerKind)。
//! 同一时刻最多一个未回复的探测。

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::Frame;
use crate::config::HeartbeatConfig;

#[derive(Debug)]
pub enum TickOutcome {
    /// 发送这个探测帧并启动超时
    Probe(Frame),
    /// 上一个探测还没回复，本次跳过
    Suppressed,
    Disabled,
}

#[derive(Debug)]
struct Outstanding {
    id: String,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    outstanding: Option<Outstanding>,
    last_rtt: Option<Duration>,
    suppressed_ticks: u64,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            outstanding: None,
            last_rtt: None,
            suppressed_ticks: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    pub fn on_tick(&mut self) -> TickOutcome {
        if !self.config.enabled {
            return TickOutcome::Disabled;
        }
        if let Some(pending) = &self.outstanding {
            self.suppressed_ticks += 1;
            debug!("💓 心跳 {} 尚未回复，跳过本次探测", pending.id);
            return TickOutcome::Suppressed;
        }
        let probe = Frame::heartbeat();
        self.outstanding = Some(Outstanding {
            id: probe.id.clone(),
            sent_at: Instant::now(),
        });
        TickOutcome::Probe(probe)
    }

    /// 处理心跳回包；ID 为空的回包视为对当前探测的回复。
    /// 返回 true 表示匹配上了未回复的探测，应取消超时。
    pub fn on_response(&mut self, id: &str) -> bool {
        let matched = match &self.outstanding {
            Some(pending) => id.is_empty() || pending.id == id,
            None => false,
        };
        if matched {
            if let Some(pending) = self.outstanding.take() {
                let rtt = pending.sent_at.elapsed();
                self.last_rtt = Some(rtt);
                debug!("💓 心跳回复 rtt={}ms", rtt.as_millis());
            }
        } else {
            debug!("忽略不匹配的心跳回包: {}", id);
        }
        matched
    }

    /// 超时到期。返回 true 表示确实存在未回复的探测，连接应判定为死亡。
    pub fn on_timeout(&mut self) -> bool {
        match self.outstanding.take() {
            Some(pending) => {
                warn!(
                    "💔 心跳超时: probe={} 等待 {}ms 无回复",
                    pending.id,
                    pending.sent_at.elapsed().as_millis()
                );
                true
            }
            None => false,
        }
    }

    pub fn is_probe_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn suppressed_ticks(&self) -> u64 {
        self.suppressed_ticks
    }

    /// 连接断开或替换时清空探测状态
    pub fn reset(&mut self) {
        self.outstanding = None;
    }
}
