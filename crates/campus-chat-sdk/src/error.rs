use crate::codec::DecodeError;

/// SDK 统一错误类型
///
/// 需要 `Clone`：错误会随 [`ChatEvent::Error`](crate::events::ChatEvent) 一起广播。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatError {
    /// 传输层错误（断线、异常关闭、写失败）→ 触发重连
    #[error("Transport error: {0}")]
    Transport(String),
    /// 协议错误（帧格式错误）→ 记录日志并丢弃，连接不受影响
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// 认证失败 → 终止，不再自动重连，直到更换凭证
    #[error("Authentication error: {0}")]
    Auth(String),
    /// 等待 ACK 超时，只通知对应调用方
    #[error("Ack timeout: frame {id} got no reply within {timeout_ms}ms")]
    AckTimeout { id: String, timeout_ms: u64 },
    /// 发送队列已满
    #[error("Queue is full: {0}")]
    QueueOverflow(String),
    /// 缓冲太久，重连后不再补发
    #[error("Frame {id} expired after {age_ms}ms in queue")]
    Expired { id: String, age_ms: u64 },
    /// 多次写失败后放弃
    #[error("Send failed for frame {id} after {attempts} attempts: {reason}")]
    SendFailed {
        id: String,
        attempts: u32,
        reason: String,
    },
    /// 重连次数耗尽（致命）
    #[error("Connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
    #[error("Not connected")]
    NotConnected,
    /// 调用方主动关闭连接
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("Shutting down")]
    ShuttingDown,
    /// 服务端以 ERROR 帧回复请求
    #[error("Server error [{code}]: {message}")]
    Server { code: i64, message: String },
    #[error("Invalid message status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl From<DecodeError> for ChatError {
    fn from(error: DecodeError) -> Self {
        ChatError::Protocol(error.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(error: serde_json::Error) -> Self {
        ChatError::Protocol(error.to_string())
    }
}

impl ChatError {
    /// 对客户端致命的错误：认证失败、重连耗尽
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChatError::Auth(_) | ChatError::ConnectionLost { .. })
    }

    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Transport(_) | ChatError::NotConnected | ChatError::AckTimeout { .. } => true,
            ChatError::Server { code, .. } => *code >= 500 && *code < 600,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ChatError::Auth("bad token".into()).is_fatal());
        assert!(ChatError::ConnectionLost { attempts: 5 }.is_fatal());
        assert!(!ChatError::Transport("reset".into()).is_fatal());

        assert!(ChatError::Transport("reset".into()).is_retryable());
        assert!(ChatError::Server { code: 503, message: "busy".into() }.is_retryable());
        assert!(!ChatError::Server { code: 403, message: "forbidden".into() }.is_retryable());
        assert!(!ChatError::QueueOverflow("full".into()).is_retryable());
    }

    #[test]
    fn test_decode_error_maps_to_protocol() {
        let err: ChatError = DecodeError::MissingMethod.into();
        assert!(matches!(err, ChatError::Protocol(_)));
    }
}
