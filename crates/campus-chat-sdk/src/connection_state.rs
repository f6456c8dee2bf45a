//! 连接状态快照
//!
//! 事件循环在每次状态变化或流量统计更新后写入，外部通过
//! [`ChatClient::connection_state`](crate::client::ChatClient::connection_state) 读取。

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 连接中（含认证握手）
    Connecting,
    /// 已连接
    Connected,
    /// 等待重连退避
    Reconnecting,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
            ConnectionStatus::Reconnecting => write!(f, "重连中"),
        }
    }
}

/// 流量统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// 解码失败被丢弃的帧
    pub frames_dropped: u64,
    /// 成功重连次数
    pub reconnects: u64,
    /// 最近一次心跳往返耗时（毫秒）
    pub last_rtt_ms: Option<u64>,
}

/// 连接状态（完整信息）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// 当前连接代数，每次建立新连接递增
    pub generation: u64,
    /// 当前重连次数（连接成功后清零）
    pub reconnect_attempt: u32,
    pub user_id: Option<String>,
    /// 连接建立时间（UTC毫秒时间戳）
    pub connected_at: Option<i64>,
    pub last_error: Option<String>,
    pub stats: TrafficStats,
    pub sdk_version: String,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            generation: 0,
            reconnect_attempt: 0,
            user_id: None,
            connected_at: None,
            last_error: None,
            stats: TrafficStats::default(),
            sdk_version: crate::version::SDK_VERSION.to_string(),
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// 获取连接持续时间（秒）
    pub fn connection_duration_secs(&self) -> Option<i64> {
        self.connected_at
            .map(|connected_at| (Utc::now().timestamp_millis() - connected_at) / 1000)
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        let duration = match self.connection_duration_secs() {
            Some(secs) if secs >= 60 => format!("{}分{}秒", secs / 60, secs % 60),
            Some(secs) => format!("{}秒", secs),
            None => "未连接".to_string(),
        };
        format!(
            "【连接状态】状态: {} | 用户: {} | 已连接: {} | 重连次数: {} | 收发帧: {}/{} | RTT: {}",
            self.status,
            self.user_id.as_deref().unwrap_or("-"),
            duration,
            self.reconnect_attempt,
            self.stats.frames_received,
            self.stats.frames_sent,
            self.stats
                .last_rtt_ms
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_else(|| "-".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot() {
        let state = ConnectionState::default();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(!state.is_connected());
        assert_eq!(state.sdk_version, crate::version::SDK_VERSION);
        assert!(state.summary().contains("未连接"));
    }

    #[test]
    fn test_summary_reports_traffic() {
        let state = ConnectionState {
            status: ConnectionStatus::Connected,
            user_id: Some("u1".into()),
            connected_at: Some(Utc::now().timestamp_millis()),
            stats: TrafficStats {
                frames_sent: 3,
                frames_received: 2,
                last_rtt_ms: Some(12),
                ..TrafficStats::default()
            },
            ..ConnectionState::default()
        };
        let summary = state.summary();
        assert!(summary.contains("已连接"));
        assert!(summary.contains("u1"));
        assert!(summary.contains("2/3"));
        assert!(summary.contains("12ms"));
    }
}
