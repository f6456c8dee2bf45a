//! 客户端事件循环
//!
//! 一个 tokio 任务独占全部可变状态，每次处理一条命令、一个传输事件或一个
//! 到期定时器，处理完再取下一个。状态机本身不做 I/O，副作用都在这里执行。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{decode_frame, encode_frame, next_frame_id, Frame, Method};
use crate::config::ChatConfig;
use crate::connection::{CloseOutcome, ConnectDecision, ConnectionManager, OpenOutcome};
use crate::connection_state::{ConnectionState, ConnectionStatus};
use crate::conversation::{
    parse_conversation_id, CachedMessage, ChatMessageType, Conversation, ConversationStore,
    MessageStatus, UnreadChange,
};
use crate::dispatcher::{self, Dispatch, InboundDispatcher, Route};
use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, ListenerRegistry};
use crate::heartbeat::{HeartbeatMonitor, TickOutcome};
use crate::queue::{
    Admission, Completion, MessageRef, OutboundQueue, PendingRequest, PendingRequests, QueuedMessage,
};
use crate::retry_policy::ReconnectPolicy;
use crate::timer::{TimerKind, TimerWheel};
use crate::transport::{
    Credential, Transport, TransportEvent, TransportLink, TransportSink, CLOSE_ABNORMAL, CLOSE_NORMAL,
};
use crate::utils::now_millis;

/// 心跳判死时使用的关闭码
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// 事件循环运行统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub status: ConnectionStatus,
    pub live_timers: usize,
    pub pending_requests: usize,
    pub queued_frames: usize,
    pub conversations: usize,
    pub listeners: usize,
    pub dedup_entries: usize,
}

/// 新发出的消息
#[derive(Debug)]
pub struct OutgoingParts {
    pub message: CachedMessage,
    pub confirmation: oneshot::Receiver<Result<Value>>,
}

pub(crate) enum Command {
    Connect {
        credential: Credential,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<ClientStats>,
    },
    Send {
        frame: Frame,
        ack_timeout: Option<Duration>,
        completion: Completion,
    },
    SendMessage {
        conversation_id: String,
        message_type: ChatMessageType,
        content: String,
        reply: oneshot::Sender<Result<OutgoingParts>>,
    },
    Resend {
        conversation_id: String,
        message_id: String,
        reply: oneshot::Sender<Result<OutgoingParts>>,
    },
    ApplyRecall {
        conversation_id: String,
        message_id: String,
        reply: oneshot::Sender<Result<CachedMessage>>,
    },
    Typing {
        conversation_id: String,
        typing: bool,
    },
    MarkRead {
        conversation_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetActive {
        conversation_id: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Upsert {
        conversation: Conversation,
        reply: oneshot::Sender<Conversation>,
    },
    Remove {
        conversation_id: String,
        reply: oneshot::Sender<Option<Conversation>>,
    },
    SetMuted {
        conversation_id: String,
        muted: bool,
        reply: oneshot::Sender<Result<Conversation>>,
    },
    SetSticky {
        conversation_id: String,
        sticky: bool,
        reply: oneshot::Sender<Result<Conversation>>,
    },
    MergeHistory {
        conversation_id: String,
        messages: Vec<CachedMessage>,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<ClientStats>,
    },
}

enum Internal {
    Opened {
        generation: u64,
        result: Result<TransportLink>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
}

pub(crate) struct ClientCore {
    config: ChatConfig,
    transport: Arc<dyn Transport>,
    connection: ConnectionManager,
    heartbeat: HeartbeatMonitor,
    queue: OutboundQueue,
    pending: PendingRequests,
    dispatcher: InboundDispatcher,
    timers: TimerWheel,
    sink: Option<Box<dyn TransportSink>>,
    forwarder: Option<JoinHandle<()>>,
    open_task: Option<JoinHandle<()>>,
    store: Arc<RwLock<ConversationStore>>,
    state: Arc<RwLock<ConnectionState>>,
    listeners: ListenerRegistry,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl ClientCore {
    pub(crate) fn new(
        config: ChatConfig,
        transport: Arc<dyn Transport>,
        store: Arc<RwLock<ConversationStore>>,
        state: Arc<RwLock<ConnectionState>>,
        listeners: ListenerRegistry,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            connection: ConnectionManager::new(ReconnectPolicy::new(config.reconnect.clone())),
            heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
            queue: OutboundQueue::new(&config.queue),
            pending: PendingRequests::new(),
            dispatcher: InboundDispatcher::new(&config.cache),
            timers: TimerWheel::new(),
            sink: None,
            forwarder: None,
            open_task: None,
            config,
            transport,
            store,
            state,
            listeners,
            commands,
            internal_tx,
            internal_rx,
        }
    }

    /// 事件循环。所有句柄被丢弃或收到 Shutdown 时退出
    #[instrument(name = "chat_core", skip_all)]
    pub(crate) async fn run(mut self) {
        info!("🚀 事件循环启动 {}", crate::version::version_string());
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let stats = self.shutdown().await;
                        let _ = reply.send(stats);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("所有客户端句柄已释放");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                Some(timer) = self.timers.next_expired(), if !self.timers.is_empty() => {
                    self.handle_timer(timer).await
                }
            }
        }
        info!("🛑 事件循环退出");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { credential, reply } => self.handle_connect(credential, reply),
            Command::Disconnect { reply } => {
                self.handle_disconnect().await;
                let _ = reply.send(());
            }
            // run() 里已经处理
            Command::Shutdown { reply } => {
                let stats = self.stats();
                let _ = reply.send(stats);
            }
            Command::Send {
                frame,
                ack_timeout,
                completion,
            } => self.enqueue(frame, ack_timeout, completion).await,
            Command::SendMessage {
                conversation_id,
                message_type,
                content,
                reply,
            } => {
                let result = self.send_message(conversation_id, message_type, content).await;
                let _ = reply.send(result);
            }
            Command::Resend {
                conversation_id,
                message_id,
                reply,
            } => {
                let result = self.resend_message(&conversation_id, &message_id).await;
                let _ = reply.send(result);
            }
            Command::ApplyRecall {
                conversation_id,
                message_id,
                reply,
            } => {
                let result = self.store.write().recall(&conversation_id, &message_id);
                if result.is_ok() {
                    self.listeners.emit(ChatEvent::MessageRecalled {
                        conversation_id: conversation_id.clone(),
                        message_id,
                    });
                    self.emit_conversation(&conversation_id);
                }
                let _ = reply.send(result);
            }
            Command::Typing {
                conversation_id,
                typing,
            } => {
                // 输入状态过期就没有意义，断线时不缓冲
                if self.connection.is_connected() {
                    let frame = Frame::notify(
                        Method::ConversationTyping,
                        json!({ "conversationId": conversation_id, "typing": typing }),
                    );
                    self.enqueue(frame, None, Completion::silent()).await;
                }
            }
            Command::MarkRead {
                conversation_id,
                reply,
            } => {
                let result = self.store.write().mark_read_local(&conversation_id);
                match result {
                    Ok(change) => {
                        if let Some(change) = change {
                            self.listeners.emit(ChatEvent::UnreadCountChanged(change));
                            self.emit_conversation(&conversation_id);
                        }
                        self.notify_read(&conversation_id).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::SetActive {
                conversation_id,
                reply,
            } => {
                let change = self.store.write().set_active(conversation_id.as_deref());
                if let Some(change) = change {
                    let id = change.conversation_id.clone();
                    self.listeners.emit(ChatEvent::UnreadCountChanged(change));
                    self.emit_conversation(&id);
                    self.notify_read(&id).await;
                }
                let _ = reply.send(());
            }
            Command::Upsert {
                conversation,
                reply,
            } => {
                let (merged, total_before, total_after) = {
                    let mut store = self.store.write();
                    let before = store.total_unread();
                    let merged = store.upsert(conversation);
                    (merged, before, store.total_unread())
                };
                self.listeners.emit(ChatEvent::ConversationUpdated(merged.clone()));
                if total_before != total_after {
                    self.listeners.emit(ChatEvent::UnreadCountChanged(
                        UnreadChange {
                            conversation_id: merged.id.clone(),
                            unread: merged.unread_count,
                            total: total_after,
                        },
                    ));
                }
                let _ = reply.send(merged);
            }
            Command::Remove {
                conversation_id,
                reply,
            } => {
                let (removed, total) = {
                    let mut store = self.store.write();
                    let removed = store.remove(&conversation_id);
                    (removed, store.total_unread())
                };
                if let Some(conversation) = &removed {
                    self.listeners.emit(ChatEvent::ConversationRemoved {
                        conversation_id: conversation.id.clone(),
                    });
                    if conversation.unread_count > 0 {
                        self.listeners.emit(ChatEvent::UnreadCountChanged(
                            UnreadChange {
                                conversation_id: conversation.id.clone(),
                                unread: 0,
                                total,
                            },
                        ));
                    }
                }
                let _ = reply.send(removed);
            }
            Command::SetMuted {
                conversation_id,
                muted,
                reply,
            } => {
                let result = self.store.write().set_muted(&conversation_id, muted);
                if let Ok(conversation) = &result {
                    self.listeners.emit(ChatEvent::ConversationUpdated(conversation.clone()));
                }
                let _ = reply.send(result);
            }
            Command::SetSticky {
                conversation_id,
                sticky,
                reply,
            } => {
                let result = self.store.write().set_sticky(&conversation_id, sticky);
                if let Ok(conversation) = &result {
                    self.listeners.emit(ChatEvent::ConversationUpdated(conversation.clone()));
                }
                let _ = reply.send(result);
            }
            Command::MergeHistory {
                conversation_id,
                messages,
                reply,
            } => {
                let inserted = self.store.write().merge_history(&conversation_id, messages);
                if inserted > 0 {
                    self.emit_conversation(&conversation_id);
                }
                let _ = reply.send(inserted);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    // ========== 连接 ==========

    fn handle_connect(&mut self, credential: Credential, reply: oneshot::Sender<Result<()>>) {
        let old = self.connection.status();
        match self.connection.begin_connect(credential, reply) {
            ConnectDecision::AlreadyConnected => debug!("已连接，忽略重复 connect"),
            ConnectDecision::Joined => debug!("加入进行中的连接尝试"),
            ConnectDecision::Start { generation } => {
                self.timers.cancel(&TimerKind::Reconnect);
                self.start_open(generation);
            }
        }
        self.publish_status(old);
    }

    fn start_open(&mut self, generation: u64) {
        let Some(credential) = self.connection.credential().cloned() else {
            warn!("没有凭证，无法建立连接");
            return;
        };
        self.store.write().set_self_user(credential.user_id.clone());

        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        let timeout = self.config.connect_timeout();
        info!("🔌 建立连接 generation={} user={}", generation, credential.user_id);

        self.open_task = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.open(&credential)).await {
                Ok(result) => result,
                Err(_) => Err(ChatError::Transport(format!(
                    "connect timeout after {}ms",
                    timeout.as_millis()
                ))),
            };
            let _ = tx.send(Internal::Opened { generation, result });
        }));
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Opened { generation, result } => self.handle_opened(generation, result).await,
            Internal::Transport { generation, event } => {
                if generation != self.connection.generation() {
                    debug!("丢弃旧连接 generation={} 的事件", generation);
                    return;
                }
                match event {
                    TransportEvent::Message(payload) => self.handle_payload(&payload).await,
                    TransportEvent::Closed { code, reason } => {
                        info!("连接关闭 code={} reason={}", code, reason);
                        self.handle_link_down(generation, code, &reason).await;
                    }
                    TransportEvent::Error(reason) => {
                        warn!("传输错误: {}", reason);
                        self.handle_link_down(generation, CLOSE_ABNORMAL, &reason).await;
                    }
                }
            }
        }
    }

    async fn handle_opened(&mut self, generation: u64, result: Result<TransportLink>) {
        let old = self.connection.status();
        let (link, outcome) = match result {
            Ok(link) => (Some(link), self.connection.on_open_result(generation, Ok(()))),
            Err(e) => (None, self.connection.on_open_result(generation, Err(e))),
        };
        self.open_task = None;

        match outcome {
            OpenOutcome::Stale => {
                if let Some(link) = link {
                    debug!("关闭过期的连接 generation={}", generation);
                    link.sink.close(CLOSE_NORMAL, "superseded").await;
                }
            }
            OpenOutcome::Connected { reconnected } => {
                if let Some(link) = link {
                    self.attach(generation, link);
                }
                {
                    let mut state = self.state.write();
                    state.connected_at = Some(now_millis());
                    state.last_error = None;
                    if reconnected {
                        state.stats.reconnects += 1;
                    }
                }
                if self.heartbeat.enabled() {
                    self.timers
                        .schedule(TimerKind::HeartbeatTick, self.heartbeat.interval());
                }
                self.publish_status(old);
                self.flush().await;
                return;
            }
            OpenOutcome::Failed(err) => {
                self.state.write().last_error = Some(err.to_string());
                self.listeners.emit(ChatEvent::Error {
                    error: err,
                    fatal: false,
                });
            }
            OpenOutcome::Retry { attempt, delay } => {
                info!("⏳ 第 {} 次重连将在 {}ms 后进行", attempt, delay.as_millis());
                self.timers.schedule(TimerKind::Reconnect, delay);
            }
            OpenOutcome::Fatal(err) => self.on_fatal(err),
        }
        self.publish_status(old);
    }

    fn attach(&mut self, generation: u64, link: TransportLink) {
        let TransportLink { sink, mut events } = link;
        self.sink = Some(sink);

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        let tx = self.internal_tx.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = !matches!(event, TransportEvent::Message(_));
                if tx.send(Internal::Transport { generation, event }).is_err() || terminal {
                    return;
                }
            }
            let _ = tx.send(Internal::Transport {
                generation,
                event: TransportEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "event stream ended".to_string(),
                },
            });
        }));
    }

    /// 释放当前连接和与连接绑定的定时器
    async fn detach(&mut self, code: u16, reason: &str) {
        self.timers.cancel(&TimerKind::HeartbeatTick);
        self.timers.cancel(&TimerKind::HeartbeatTimeout);
        self.timers.cancel(&TimerKind::SendRetry);
        self.heartbeat.reset();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(sink) = self.sink.take() {
            sink.close(code, reason).await;
        }
        self.state.write().connected_at = None;
    }

    /// 连接失效。`code` 为 1000 时不重连，同时作为关闭码写给服务端
    async fn handle_link_down(&mut self, generation: u64, code: u16, reason: &str) {
        let old = self.connection.status();
        let normal = code == CLOSE_NORMAL;
        let outcome = self.connection.on_closed(generation, normal);
        if outcome == CloseOutcome::Ignored {
            return;
        }
        self.detach(code, reason).await;
        if !normal {
            self.state.write().last_error = Some(reason.to_string());
        }

        match outcome {
            CloseOutcome::Reconnect { attempt, delay } => {
                info!("⏳ 第 {} 次重连将在 {}ms 后进行", attempt, delay.as_millis());
                self.timers.schedule(TimerKind::Reconnect, delay);
            }
            CloseOutcome::Fatal(err) => self.on_fatal(err),
            CloseOutcome::Stopped | CloseOutcome::Ignored => {}
        }
        self.publish_status(old);
    }

    fn on_fatal(&mut self, err: ChatError) {
        error!("💀 连接不可恢复: {}", err);
        self.timers.cancel(&TimerKind::Reconnect);
        self.state.write().last_error = Some(err.to_string());
        self.listeners.emit(ChatEvent::Error {
            error: err,
            fatal: true,
        });
    }

    async fn handle_disconnect(&mut self) {
        let old = self.connection.status();
        self.connection.explicit_close();
        self.timers.cancel(&TimerKind::Reconnect);
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        self.detach(CLOSE_NORMAL, "client disconnect").await;
        self.publish_status(old);
    }

    async fn shutdown(&mut self) -> ClientStats {
        info!("关闭客户端");
        let old = self.connection.status();
        self.connection.fail_waiters(ChatError::ShuttingDown);
        self.connection.explicit_close();
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        self.detach(CLOSE_NORMAL, "shutdown").await;

        for request in self.pending.drain() {
            self.complete(request.completion, Err(ChatError::ShuttingDown));
        }
        for message in self.queue.drain() {
            if let Some(completion) = message.completion {
                self.complete(completion, Err(ChatError::ShuttingDown));
            }
        }
        self.timers.clear();
        self.publish_status(old);
        self.stats()
    }

    /// 同步状态快照，状态变化时发布事件
    fn publish_status(&mut self, old: ConnectionStatus) {
        let new = self.connection.status();
        {
            let mut state = self.state.write();
            state.status = new;
            state.generation = self.connection.generation();
            state.reconnect_attempt = self.connection.attempt();
            state.user_id = self.connection.credential().map(|c| c.user_id.clone());
            state.stats.last_rtt_ms = self.heartbeat.last_rtt().map(|rtt| rtt.as_millis() as u64);
        }
        if old != new {
            info!("🔄 连接状态: {} -> {}", old, new);
            self.listeners
                .emit(ChatEvent::ConnectionStateChanged { old, new });
        }
    }

    // ========== 定时器 ==========

    async fn handle_timer(&mut self, timer: TimerKind) {
        match timer {
            TimerKind::HeartbeatTick => self.on_heartbeat_tick().await,
            TimerKind::HeartbeatTimeout => {
                if self.heartbeat.on_timeout() && self.connection.is_connected() {
                    let generation = self.connection.generation();
                    self.handle_link_down(generation, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout")
                        .await;
                }
            }
            TimerKind::Reconnect => {
                let old = self.connection.status();
                if let Some(generation) = self.connection.on_reconnect_timer() {
                    self.start_open(generation);
                }
                self.publish_status(old);
            }
            TimerKind::SendRetry => self.flush().await,
            TimerKind::AckTimeout(id) => {
                if let Some(request) = self.pending.take(&id) {
                    // 还在缓冲区里就不再发送
                    self.queue.remove(&id);
                    let timeout_ms = request.timeout.as_millis() as u64;
                    warn!("⏰ 请求 {} ({}) 等待回复超时 {}ms", id, request.method, timeout_ms);
                    self.complete(request.completion, Err(ChatError::AckTimeout { id, timeout_ms }));
                }
            }
        }
    }

    async fn on_heartbeat_tick(&mut self) {
        if !self.connection.is_connected() {
            return;
        }
        match self.heartbeat.on_tick() {
            TickOutcome::Probe(probe) => {
                if let Err(e) = self.write_frame(&probe).await {
                    let generation = self.connection.generation();
                    self.handle_link_down(generation, CLOSE_ABNORMAL, &e.to_string()).await;
                    return;
                }
                self.timers
                    .schedule(TimerKind::HeartbeatTimeout, self.heartbeat.timeout());
            }
            TickOutcome::Suppressed => {}
            TickOutcome::Disabled => return,
        }
        self.timers
            .schedule(TimerKind::HeartbeatTick, self.heartbeat.interval());
    }

    // ========== 发送 ==========

    async fn enqueue(&mut self, frame: Frame, ack_timeout: Option<Duration>, completion: Completion) {
        let queued_completion = match ack_timeout {
            Some(timeout) => {
                let id = frame.id.clone();
                let request = PendingRequest {
                    id: id.clone(),
                    method: frame.method.clone(),
                    completion,
                    timeout,
                    registered_at: tokio::time::Instant::now(),
                };
                if let Err(duplicate) = self.pending.register(request) {
                    self.complete(
                        duplicate.completion,
                        Err(ChatError::InvalidArgument(format!("frame id {} already in flight", id))),
                    );
                    return;
                }
                self.timers.schedule(TimerKind::AckTimeout(id), timeout);
                None
            }
            None => Some(completion),
        };

        match self.queue.push(QueuedMessage::new(frame, queued_completion)) {
            Admission::Accepted => {}
            Admission::Evicted(message) | Admission::Rejected(message) => {
                let err = ChatError::QueueOverflow(format!(
                    "frame {} dropped, capacity {}",
                    message.frame.id, self.config.queue.capacity
                ));
                self.fail_queued(message, err);
            }
        }
        self.flush().await;
    }

    /// 按顺序写出缓冲帧。写失败时放回队首并稍后重试
    async fn flush(&mut self) {
        if !self.connection.is_connected() || self.sink.is_none() {
            return;
        }
        for message in self.queue.drain_expired() {
            let err = ChatError::Expired {
                id: message.frame.id.clone(),
                age_ms: message.age().as_millis() as u64,
            };
            self.fail_queued(message, err);
        }

        while let Some(message) = self.queue.pop_front() {
            match self.write_frame(&message.frame).await {
                Ok(()) => {
                    if let Some(completion) = message.completion {
                        self.complete(completion, Ok(json!({})));
                    }
                }
                Err(err) => {
                    if let Err(message) = self.queue.requeue_front(message) {
                        let failed = ChatError::SendFailed {
                            id: message.frame.id.clone(),
                            attempts: message.retry_count + 1,
                            reason: err.to_string(),
                        };
                        error!("❌ {}", failed);
                        self.fail_queued(message, failed);
                    }
                    if !self.queue.is_empty() {
                        self.timers
                            .schedule(TimerKind::SendRetry, self.queue.retry_delay());
                    }
                    break;
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let sink = self.sink.as_ref().ok_or(ChatError::NotConnected)?;
        let payload = encode_frame(frame)?;
        let size = payload.len() as u64;
        if self.config.debug_mode {
            debug!("⬆️ {} {:?} {}", frame.method, frame.frame_type, frame.id);
        }
        sink.send(payload).await?;
        let mut state = self.state.write();
        state.stats.frames_sent += 1;
        state.stats.bytes_sent += size;
        Ok(())
    }

    /// 帧在发送前就失败了：通知调用方，并清掉对应的待回复请求
    fn fail_queued(&mut self, message: QueuedMessage, err: ChatError) {
        if let Some(completion) = message.completion {
            self.complete(completion, Err(err.clone()));
        }
        if let Some(request) = self.pending.take(&message.frame.id) {
            self.timers
                .cancel(&TimerKind::AckTimeout(message.frame.id.clone()));
            self.complete(request.completion, Err(err));
        }
    }

    fn complete(&mut self, completion: Completion, result: Result<Value>) {
        if let Some(message) = completion.message() {
            let status = if result.is_ok() {
                MessageStatus::Sent
            } else {
                MessageStatus::Failed
            };
            let updated =
                self.store
                    .write()
                    .update_status(&message.conversation_id, &message.message_id, status);
            match updated {
                Ok(Some(message)) => self.listeners.emit(ChatEvent::MessageStatusChanged(message)),
                Ok(None) => {}
                Err(e) => debug!("更新消息状态失败: {}", e),
            }
        }
        completion.resolve(result);
    }

    async fn send_message(
        &mut self,
        conversation_id: String,
        message_type: ChatMessageType,
        content: String,
    ) -> Result<OutgoingParts> {
        if parse_conversation_id(&conversation_id).is_none()
            && self.store.read().conversation(&conversation_id).is_none()
        {
            return Err(ChatError::InvalidArgument(format!(
                "unknown conversation {}",
                conversation_id
            )));
        }
        let sender_id = self
            .connection
            .credential()
            .map(|c| c.user_id.clone())
            .unwrap_or_default();
        let message = CachedMessage {
            id: next_frame_id(),
            conversation_id,
            sender_id,
            message_type,
            content,
            timestamp: now_millis(),
            status: MessageStatus::Sending,
            is_from_self: true,
        };
        let conversation = self.store.write().append_outbound(message.clone());
        self.listeners
            .emit(ChatEvent::MessageStatusChanged(message.clone()));
        self.listeners
            .emit(ChatEvent::ConversationUpdated(conversation));

        let confirmation = self.enqueue_message(&message).await;
        Ok(OutgoingParts {
            message,
            confirmation,
        })
    }

    async fn resend_message(&mut self, conversation_id: &str, message_id: &str) -> Result<OutgoingParts> {
        let updated = self
            .store
            .write()
            .update_status(conversation_id, message_id, MessageStatus::Sending)?;
        let message = updated.ok_or_else(|| {
            ChatError::InvalidArgument(format!("message {} is already sending", message_id))
        })?;
        info!("🔁 重发消息 {}", message_id);
        self.listeners
            .emit(ChatEvent::MessageStatusChanged(message.clone()));
        let confirmation = self.enqueue_message(&message).await;
        Ok(OutgoingParts {
            message,
            confirmation,
        })
    }

    async fn enqueue_message(&mut self, message: &CachedMessage) -> oneshot::Receiver<Result<Value>> {
        let (conversation_type, target_id) = parse_conversation_id(&message.conversation_id)
            .map(|(t, target)| (Some(t.as_str()), Some(target)))
            .unwrap_or((None, None));
        let frame = Frame::request(
            Method::ConversationChat,
            json!({
                "conversationId": message.conversation_id,
                "conversationType": conversation_type,
                "targetId": target_id,
                "messageId": message.id,
                "senderId": message.sender_id,
                "messageType": message.message_type.as_str(),
                "content": message.content,
                "timestamp": message.timestamp,
            }),
        );
        let (tx, rx) = oneshot::channel();
        let completion = Completion::reply(tx).with_message(MessageRef {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
        });
        let timeout = Duration::from_millis(self.config.queue.ack_timeout_ms);
        self.enqueue(frame, Some(timeout), completion).await;
        rx
    }

    async fn notify_read(&mut self, conversation_id: &str) {
        if !self.connection.is_connected() {
            return;
        }
        let frame = Frame::notify(
            Method::ConversationRead,
            json!({ "conversationId": conversation_id, "upTo": now_millis() }),
        );
        self.enqueue(frame, None, Completion::silent()).await;
    }

    // ========== 接收 ==========

    async fn handle_payload(&mut self, payload: &[u8]) {
        {
            let mut state = self.state.write();
            state.stats.frames_received += 1;
            state.stats.bytes_received += payload.len() as u64;
        }
        let frame = match decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("⚠️ 丢弃无法解码的帧: {}", e);
                self.state.write().stats.frames_dropped += 1;
                return;
            }
        };
        if self.config.debug_mode {
            debug!("⬇️ {} {:?} {}", frame.method, frame.frame_type, frame.id);
        }

        match self.dispatcher.classify(frame, &self.pending) {
            Dispatch::Heartbeat { id } => {
                if self.heartbeat.on_response(&id) {
                    self.timers.cancel(&TimerKind::HeartbeatTimeout);
                    self.state.write().stats.last_rtt_ms =
                        self.heartbeat.last_rtt().map(|rtt| rtt.as_millis() as u64);
                }
            }
            Dispatch::Reply {
                id,
                result,
                broadcast,
            } => {
                if let Some(request) = self.pending.take(&id) {
                    self.timers.cancel(&TimerKind::AckTimeout(id));
                    self.complete(request.completion, result);
                }
                if let Some((route, frame)) = broadcast {
                    self.route(route, &frame);
                }
            }
            Dispatch::Routed(route, frame) => self.route(route, &frame),
            Dispatch::Duplicate { id } => debug!("🔄 重复投递的帧 {} 已忽略", id),
            Dispatch::Dropped { reason } => debug!("丢弃帧: {}", reason),
        }
    }

    fn route(&mut self, route: Route, frame: &Frame) {
        let result = {
            let mut store = self.store.write();
            dispatcher::apply(route, frame, &mut store)
        };
        match result {
            Ok(events) => {
                for event in events {
                    self.listeners.emit(event);
                }
            }
            Err(e) => warn!("处理 {} 帧 {} 失败: {}", frame.method, frame.id, e),
        }
    }

    fn emit_conversation(&self, conversation_id: &str) {
        let conversation = self.store.read().conversation(conversation_id);
        if let Some(conversation) = conversation {
            self.listeners
                .emit(ChatEvent::ConversationUpdated(conversation));
        }
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            status: self.connection.status(),
            live_timers: self.timers.len(),
            pending_requests: self.pending.len(),
            queued_frames: self.queue.len(),
            conversations: self.store.read().len(),
            listeners: self.listeners.listener_count(),
            dedup_entries: self.dispatcher.dedup_len(),
        }
    }
}
