//! Campus Chat SDK - 校园二手交易平台的即时通讯客户端
//!
//! 本 SDK 提供：
//! - 🔗 长连接管理：单连接、指数退避重连、心跳判死
//! - 📤 发送队列：断线缓冲、按序补发、确认超时、写失败重试
//! - 📥 入站分发：请求应答关联、去重、按方法路由
//! - 💬 会话缓存：最新消息、未读数、消息状态、撤回
//! - ⚙️ 事件系统：同步监听器和异步广播两种订阅方式
//!
//! 传输层通过 [`Transport`] trait 注入，测试和演示可以用
//! [`transport::memory::MemoryTransport`]。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use campus_chat_sdk::{ChatClient, ChatConfig, ChatEvent, Credential, EventKind};
//! use campus_chat_sdk::transport::memory::MemoryTransport;
//!
//! #[tokio::main]
//! async fn main() -> campus_chat_sdk::Result<()> {
//!     let config = ChatConfig::builder().heartbeat(30_000, 10_000).build();
//!     let client = ChatClient::new(config, Arc::new(MemoryTransport::new()))?;
//!
//!     client.on(EventKind::MessageReceived, |event| {
//!         if let ChatEvent::MessageReceived(message) = event {
//!             println!("收到消息: {}", message.preview());
//!         }
//!     });
//!
//!     client.connect(Credential::new("10086", "token")).await?;
//!     let outgoing = client.send_text("private_9", "这本教材还在吗").await?;
//!     outgoing.confirmed().await?;
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod connection_state;
pub mod conversation;
pub mod deduplication;
pub mod dispatcher;
pub mod error;
pub mod events;
mod event_loop;
pub mod heartbeat;
pub mod presence;
pub mod queue;
pub mod retry_policy;
pub mod timer;
pub mod transport;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use client::{ChatClient, OutgoingMessage};
pub use codec::{Frame, FrameType, Method};
pub use config::{
    CacheConfig, ChatConfig, ChatConfigBuilder, EventConfig, HeartbeatConfig, OverflowPolicy,
    QueueConfig, ReconnectConfig,
};
pub use connection_state::{ConnectionState, ConnectionStatus, TrafficStats};
pub use conversation::{
    CachedMessage, ChatMessageType, Conversation, ConversationType, MessageStatus, UnreadChange,
};
pub use event_loop::ClientStats;
pub use error::{ChatError, Result};
pub use events::{ChatEvent, EventKind, ListenerHandle, NoticeKind, TypingEvent};
pub use presence::PresenceInfo;
pub use transport::{Credential, Transport, TransportEvent, TransportLink, TransportSink};
pub use version::SDK_VERSION;
