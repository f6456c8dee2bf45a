//! 事件系统 - SDK 与 UI 层之间的订阅边界
//!
//! 两种订阅方式：
//! - 同步监听器：按注册顺序同步调用，某个监听器 panic 会被捕获并记录，
//!   不影响后面的监听器；通过返回的 [`ListenerHandle`] O(1) 取消
//! - 异步广播：[`ListenerRegistry::subscribe`] 返回 `broadcast::Receiver`

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::connection_state::ConnectionStatus;
use crate::conversation::{CachedMessage, Conversation, UnreadChange};
use crate::error::ChatError;
use crate::presence::PresenceInfo;

/// 正在输入
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub conversation_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

/// 好友 / 群组通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoticeKind {
    FriendRequest,
    FriendAccepted,
    GroupRequest,
    GroupAccepted,
}

/// SDK 事件
#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConnectionStateChanged {
        old: ConnectionStatus,
        new: ConnectionStatus,
    },
    MessageReceived(CachedMessage),
    MessageStatusChanged(CachedMessage),
    MessageRecalled {
        conversation_id: String,
        message_id: String,
    },
    /// 对方已读到 `up_to`（毫秒时间戳）
    ReadReceipt {
        conversation_id: String,
        reader_id: String,
        up_to: i64,
    },
    ConversationUpdated(Conversation),
    ConversationRemoved {
        conversation_id: String,
    },
    UnreadCountChanged(UnreadChange),
    TypingIndicator(TypingEvent),
    PresenceChanged(PresenceInfo),
    Notice {
        kind: NoticeKind,
        data: Value,
    },
    Error {
        error: ChatError,
        fatal: bool,
    },
}

/// 监听器订阅类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionState,
    MessageReceived,
    /// 状态变化、撤回、已读回执
    MessageStatus,
    /// 会话更新、删除、未读数
    Conversation,
    Typing,
    Presence,
    Notice,
    Error,
}

impl ChatEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChatEvent::ConnectionStateChanged { .. } => EventKind::ConnectionState,
            ChatEvent::MessageReceived(_) => EventKind::MessageReceived,
            ChatEvent::MessageStatusChanged(_)
            | ChatEvent::MessageRecalled { .. }
            | ChatEvent::ReadReceipt { .. } => EventKind::MessageStatus,
            ChatEvent::ConversationUpdated(_)
            | ChatEvent::ConversationRemoved { .. }
            | ChatEvent::UnreadCountChanged(_) => EventKind::Conversation,
            ChatEvent::TypingIndicator(_) => EventKind::Typing,
            ChatEvent::PresenceChanged(_) => EventKind::Presence,
            ChatEvent::Notice { .. } => EventKind::Notice,
            ChatEvent::Error { .. } => EventKind::Error,
        }
    }

    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            ChatEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            ChatEvent::MessageReceived(_) => "message_received",
            ChatEvent::MessageStatusChanged(_) => "message_status_changed",
            ChatEvent::MessageRecalled { .. } => "message_recalled",
            ChatEvent::ReadReceipt { .. } => "read_receipt",
            ChatEvent::ConversationUpdated(_) => "conversation_updated",
            ChatEvent::ConversationRemoved { .. } => "conversation_removed",
            ChatEvent::UnreadCountChanged(_) => "unread_count_changed",
            ChatEvent::TypingIndicator(_) => "typing_indicator",
            ChatEvent::PresenceChanged(_) => "presence_changed",
            ChatEvent::Notice { .. } => "notice",
            ChatEvent::Error { .. } => "error",
        }
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

/// 注册监听器时返回，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct Slot {
    id: u64,
    /// None 表示订阅全部事件
    kind: Option<EventKind>,
    listener: EventListener,
}

#[derive(Default)]
struct Slots {
    next_id: u64,
    /// 注册顺序；取消订阅留下空位，空位过多时压缩
    entries: Vec<Option<Slot>>,
    index: HashMap<u64, usize>,
    vacant: usize,
}

impl Slots {
    fn compact(&mut self) {
        self.entries.retain(Option::is_some);
        self.index.clear();
        for (position, slot) in self.entries.iter().enumerate() {
            if let Some(slot) = slot {
                self.index.insert(slot.id, position);
            }
        }
        self.vacant = 0;
    }
}

/// 监听器注册表
#[derive(Clone)]
pub struct ListenerRegistry {
    slots: Arc<Mutex<Slots>>,
    sender: broadcast::Sender<ChatEvent>,
}

impl ListenerRegistry {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            slots: Arc::new(Mutex::new(Slots::default())),
            sender,
        }
    }

    /// 订阅某一类事件
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerHandle
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// 订阅全部事件
    pub fn on_any<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, kind: Option<EventKind>, listener: EventListener) -> ListenerHandle {
        let mut slots = self.slots.lock();
        slots.next_id += 1;
        let id = slots.next_id;
        let position = slots.entries.len();
        slots.entries.push(Some(Slot { id, kind, listener }));
        slots.index.insert(id, position);
        debug!("添加监听器 #{} kind={:?}", id, kind);
        ListenerHandle(id)
    }

    /// 取消订阅，返回监听器是否存在
    pub fn off(&self, handle: ListenerHandle) -> bool {
        let mut slots = self.slots.lock();
        let Some(position) = slots.index.remove(&handle.0) else {
            return false;
        };
        slots.entries[position] = None;
        slots.vacant += 1;
        if slots.vacant > 16 && slots.vacant * 2 > slots.entries.len() {
            slots.compact();
        }
        true
    }

    pub fn listener_count(&self) -> usize {
        self.slots.lock().index.len()
    }

    /// 异步订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    /// 发布事件。监听器在锁外调用，可以在回调里增删监听器
    pub fn emit(&self, event: ChatEvent) {
        let kind = event.kind();
        let listeners: Vec<(u64, EventListener)> = {
            let slots = self.slots.lock();
            slots
                .entries
                .iter()
                .flatten()
                .filter(|slot| slot.kind.map_or(true, |k| k == kind))
                .map(|slot| (slot.id, slot.listener.clone()))
                .collect()
        };

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!("💥 监听器 #{} 处理 {} 时 panic，已忽略", id, event.event_type());
            }
        }

        // 无订阅者时 send 会失败，属正常场景
        if self.sender.send(event).is_err() {
            debug!("no active event receivers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connected() -> ChatEvent {
        ChatEvent::ConnectionStateChanged {
            old: ConnectionStatus::Connecting,
            new: ConnectionStatus::Connected,
        }
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let registry = ListenerRegistry::new(16);
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b", "c"] {
            let log = log.clone();
            registry.on(EventKind::ConnectionState, move |_| log.lock().push(name));
        }
        let any_log = log.clone();
        registry.on_any(move |_| any_log.lock().push("any"));
        let err_log = log.clone();
        registry.on(EventKind::Error, move |_| err_log.lock().push("error"));

        registry.emit(connected());
        assert_eq!(*log.lock(), vec!["a", "b", "c", "any"]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = ListenerRegistry::new(16);
        let hits = Arc::new(AtomicUsize::new(0));

        registry.on(EventKind::ConnectionState, |_| panic!("listener bug"));
        let counter = hits.clone();
        registry.on(EventKind::ConnectionState, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(connected());
        registry.emit(connected());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = ListenerRegistry::new(16);
        let hits = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..40 {
            let counter = hits.clone();
            handles.push(registry.on_any(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let keep = handles.pop().unwrap();
        for handle in &handles {
            assert!(registry.off(*handle));
        }
        assert!(!registry.off(handles[0]));
        assert_eq!(registry.listener_count(), 1);

        registry.emit(connected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.off(keep));
        registry.emit(connected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let registry = ListenerRegistry::new(16);
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

        let inner_registry = registry.clone();
        let inner_slot = slot.clone();
        let counter = hits.clone();
        let handle = registry.on_any(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = inner_slot.lock().take() {
                inner_registry.off(handle);
            }
        });
        *slot.lock() = Some(handle);

        registry.emit(connected());
        registry.emit(connected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_stream() {
        let registry = ListenerRegistry::new(16);
        let mut rx = registry.subscribe();
        registry.emit(ChatEvent::Error {
            error: ChatError::NotConnected,
            fatal: false,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Error);
        assert_eq!(event.event_type(), "error");
    }
}
