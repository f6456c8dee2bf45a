//! 待回复请求表
//!
//! 按帧 ID 关联回复。每个等待 ACK 的帧恰好一条记录，
//! 收到回复、超时或放弃发送时移除。

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec::Method;
use crate::error::Result;

/// 乐观发送的消息引用，结果出来后更新消息状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub conversation_id: String,
    pub message_id: String,
}

/// 请求完成时的通知方式
#[derive(Debug, Default)]
pub struct Completion {
    reply: Option<oneshot::Sender<Result<Value>>>,
    message: Option<MessageRef>,
}

impl Completion {
    /// 不通知任何人
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn reply(reply: oneshot::Sender<Result<Value>>) -> Self {
        Self {
            reply: Some(reply),
            message: None,
        }
    }

    /// 关联一条本地消息
    pub fn with_message(mut self, message: MessageRef) -> Self {
        self.message = Some(message);
        self
    }

    pub fn message(&self) -> Option<&MessageRef> {
        self.message.as_ref()
    }

    /// 通知调用方；调用方已放弃等待时静默忽略
    pub fn resolve(self, result: Result<Value>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub method: Method,
    pub completion: Completion,
    pub timeout: Duration,
    pub registered_at: Instant,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记请求。帧 ID 在飞行中的请求里必须唯一，重复时返回原请求
    pub fn register(&mut self, request: PendingRequest) -> std::result::Result<(), PendingRequest> {
        if self.entries.contains_key(&request.id) {
            return Err(request);
        }
        self.entries.insert(request.id.clone(), request);
        Ok(())
    }

    pub fn take(&mut self, id: &str) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.entries.drain().map(|(_, request)| request).collect()
    }
}
