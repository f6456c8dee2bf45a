//! 聊天客户端
//!
//! [`ChatClient`] 只是一个可克隆的句柄：写操作以命令形式发给后台事件循环，
//! 读操作直接读取共享的会话缓存和连接状态快照。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, instrument};

use crate::codec::{Frame, Method};
use crate::config::ChatConfig;
use crate::connection_state::{ConnectionState, ConnectionStatus};
use crate::conversation::{CachedMessage, ChatMessageType, Conversation, ConversationStore, MessageStatus};
use crate::event_loop::{ClientCore, ClientStats, Command, OutgoingParts};
use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, EventKind, ListenerHandle, ListenerRegistry};
use crate::presence::PresenceInfo;
use crate::queue::Completion;
use crate::transport::{Credential, Transport};

/// 乐观发送的消息：`message` 立即可以显示，`confirmed` 等待服务端确认
#[derive(Debug)]
pub struct OutgoingMessage {
    pub message: CachedMessage,
    confirmation: oneshot::Receiver<Result<Value>>,
}

impl OutgoingMessage {
    fn from_parts(parts: OutgoingParts) -> Self {
        Self {
            message: parts.message,
            confirmation: parts.confirmation,
        }
    }

    /// 等待服务端确认。成功时消息已变为 `sent`，失败时变为 `failed`
    pub async fn confirmed(self) -> Result<Value> {
        self.confirmation.await.unwrap_or(Err(ChatError::ShuttingDown))
    }
}

/// 聊天客户端句柄
#[derive(Clone)]
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    store: Arc<RwLock<ConversationStore>>,
    state: Arc<RwLock<ConnectionState>>,
    listeners: ListenerRegistry,
    config: Arc<ChatConfig>,
}

impl ChatClient {
    /// 创建客户端并启动后台事件循环，必须在 tokio 运行时内调用
    pub fn new(config: ChatConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        info!("🚀 创建聊天客户端 {}", crate::version::version_string());

        let store = Arc::new(RwLock::new(ConversationStore::new(
            config.cache.messages_per_conversation,
        )));
        let state = Arc::new(RwLock::new(ConnectionState::default()));
        let listeners = ListenerRegistry::new(config.event.buffer_size);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let core = ClientCore::new(
            config.clone(),
            transport,
            store.clone(),
            state.clone(),
            listeners.clone(),
            command_rx,
        );
        tokio::spawn(core.run());

        Ok(Self {
            commands,
            store,
            state,
            listeners,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::ShuttingDown)
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.submit(build(tx))?;
        rx.await.map_err(|_| ChatError::ShuttingDown)
    }

    // ========== 连接 ==========

    /// 建立连接。已连接时立即返回，连接中时等待同一次尝试的结果
    #[instrument(skip(self, credential), fields(user = %credential.user_id))]
    pub async fn connect(&self, credential: Credential) -> Result<()> {
        self.call(|reply| Command::Connect { credential, reply })
            .await?
    }

    /// 主动断开，不会自动重连。缓冲的帧保留到下次连接
    pub async fn disconnect(&self) -> Result<()> {
        self.call(|reply| Command::Disconnect { reply }).await
    }

    /// 关闭客户端：取消所有定时器，未完成的请求以 `ShuttingDown` 失败
    pub async fn shutdown(&self) -> Result<ClientStats> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub async fn stats(&self) -> Result<ClientStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    // ========== 发送 ==========

    /// 发送请求并等待回复。`timeout` 缺省时使用配置的确认超时
    pub async fn request(&self, method: Method, data: Value, timeout: Option<Duration>) -> Result<Value> {
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_millis(self.config.queue.ack_timeout_ms));
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Send {
            frame: Frame::request(method, data),
            ack_timeout: Some(timeout),
            completion: Completion::reply(tx),
        })?;
        rx.await.unwrap_or(Err(ChatError::ShuttingDown))
    }

    /// 发送不需要回复的通知，写出后返回
    pub async fn notify(&self, method: Method, data: Value) -> Result<()> {
        self.send_frame(Frame::notify(method, data)).await
    }

    /// 发送任意帧，不等回复
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Send {
            frame,
            ack_timeout: None,
            completion: Completion::reply(tx),
        })?;
        rx.await.unwrap_or(Err(ChatError::ShuttingDown)).map(|_| ())
    }

    // ========== 消息 ==========

    /// 乐观发送：消息以 `sending` 状态立即写入本地缓存
    pub async fn send_message(
        &self,
        conversation_id: &str,
        message_type: ChatMessageType,
        content: impl Into<String>,
    ) -> Result<OutgoingMessage> {
        let conversation_id = conversation_id.to_string();
        let content = content.into();
        self.call(|reply| Command::SendMessage {
            conversation_id,
            message_type,
            content,
            reply,
        })
        .await?
        .map(OutgoingMessage::from_parts)
    }

    pub async fn send_text(&self, conversation_id: &str, text: impl Into<String>) -> Result<OutgoingMessage> {
        self.send_message(conversation_id, ChatMessageType::Text, text).await
    }

    /// 重发一条 `failed` 状态的消息
    pub async fn resend_message(&self, conversation_id: &str, message_id: &str) -> Result<OutgoingMessage> {
        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();
        self.call(|reply| Command::Resend {
            conversation_id,
            message_id,
            reply,
        })
        .await?
        .map(OutgoingMessage::from_parts)
    }

    /// 撤回自己发出的消息。服务端确认后才修改本地状态
    pub async fn recall_message(&self, conversation_id: &str, message_id: &str) -> Result<CachedMessage> {
        let message = self
            .store
            .read()
            .message(conversation_id, message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        if !message.is_from_self {
            return Err(ChatError::InvalidArgument("only own messages can be recalled".to_string()));
        }
        if !message.status.can_transition_to(MessageStatus::Recalled) {
            return Err(ChatError::InvalidTransition {
                from: message.status.to_string(),
                to: MessageStatus::Recalled.to_string(),
            });
        }

        self.request(
            Method::ConversationRecall,
            json!({ "conversationId": conversation_id, "messageId": message_id }),
            None,
        )
        .await?;

        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();
        self.call(|reply| Command::ApplyRecall {
            conversation_id,
            message_id,
            reply,
        })
        .await?
    }

    /// 正在输入。未连接时直接丢弃
    pub fn send_typing(&self, conversation_id: &str, typing: bool) -> Result<()> {
        self.submit(Command::Typing {
            conversation_id: conversation_id.to_string(),
            typing,
        })
    }

    /// 清零本地未读数并通知服务端
    pub async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        self.call(|reply| Command::MarkRead {
            conversation_id,
            reply,
        })
        .await?
    }

    /// 设置当前打开的会话。该会话未读数立即清零，之后收到的消息不再计入未读
    pub async fn set_active_conversation(&self, conversation_id: Option<&str>) -> Result<()> {
        let conversation_id = conversation_id.map(str::to_string);
        self.call(|reply| Command::SetActive {
            conversation_id,
            reply,
        })
        .await
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.store.read().active().map(str::to_string)
    }

    // ========== 会话 ==========

    /// 写入从服务端拉取的会话信息
    pub async fn upsert_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        self.call(|reply| Command::Upsert {
            conversation,
            reply,
        })
        .await
    }

    pub async fn remove_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conversation_id = conversation_id.to_string();
        self.call(|reply| Command::Remove {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn set_muted(&self, conversation_id: &str, muted: bool) -> Result<Conversation> {
        let conversation_id = conversation_id.to_string();
        self.call(|reply| Command::SetMuted {
            conversation_id,
            muted,
            reply,
        })
        .await?
    }

    pub async fn set_sticky(&self, conversation_id: &str, sticky: bool) -> Result<Conversation> {
        let conversation_id = conversation_id.to_string();
        self.call(|reply| Command::SetSticky {
            conversation_id,
            sticky,
            reply,
        })
        .await?
    }

    /// 合并拉取到的历史消息，返回新增条数
    pub async fn merge_history(&self, conversation_id: &str, messages: Vec<CachedMessage>) -> Result<usize> {
        let conversation_id = conversation_id.to_string();
        self.call(|reply| Command::MergeHistory {
            conversation_id,
            messages,
            reply,
        })
        .await
    }

    /// 会话列表（置顶优先，按更新时间倒序）
    pub fn conversations(&self) -> Vec<Conversation> {
        self.store.read().conversations()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.store.read().conversation(conversation_id)
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<CachedMessage> {
        self.store.read().messages(conversation_id)
    }

    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        self.store.read().unread_count(conversation_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.store.read().total_unread()
    }

    pub fn presence(&self, user_id: &str) -> Option<PresenceInfo> {
        self.store.read().presence().get(user_id).cloned()
    }

    pub fn online_users(&self) -> Vec<String> {
        self.store.read().presence().online_users()
    }

    // ========== 事件 ==========

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerHandle
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.listeners.on(kind, listener)
    }

    pub fn on_any<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.listeners.on_any(listener)
    }

    pub fn off(&self, handle: ListenerHandle) -> bool {
        self.listeners.off(handle)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.listeners.subscribe()
    }
}
