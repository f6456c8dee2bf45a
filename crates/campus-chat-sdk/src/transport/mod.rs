//! 传输层抽象
//!
//! 客户端只依赖这两个 trait：[`Transport`] 负责建立连接并完成认证握手，
//! 返回的 [`TransportLink`] 提供写端和入站事件流。认证只发生在建立连接时。

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// 正常关闭码
pub const CLOSE_NORMAL: u16 = 1000;
/// 异常断开（无关闭帧）
pub const CLOSE_ABNORMAL: u16 = 1006;

/// 认证凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub token: String,
}

impl Credential {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

/// 入站传输事件
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// 收到一帧原始数据
    Message(Bytes),
    /// 连接被关闭
    Closed { code: u16, reason: String },
    /// 传输错误，按异常关闭处理
    Error(String),
}

impl TransportEvent {
    /// 是否为正常关闭
    pub fn is_normal_close(&self) -> bool {
        matches!(self, TransportEvent::Closed { code, .. } if *code == CLOSE_NORMAL)
    }
}

/// 连接写端
#[async_trait]
pub trait TransportSink: Send + Sync {
    /// 写出一帧，失败返回 `ChatError::Transport`
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// 主动关闭连接
    async fn close(&self, code: u16, reason: &str);
}

/// 一条已认证的连接
pub struct TransportLink {
    pub sink: Box<dyn TransportSink>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// 传输工厂
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立连接并以 `credential` 认证。
    /// 认证被拒返回 `ChatError::Auth`，其它失败返回 `ChatError::Transport`。
    async fn open(&self, credential: &Credential) -> Result<TransportLink>;
}
