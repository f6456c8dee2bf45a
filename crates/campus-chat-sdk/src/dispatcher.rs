//! 入站分发
//!
//! 每个解码后的帧先尝试关联待回复请求，关联不上再按方法路由到唯一的处理函数。
//! 路由是对封闭 [`Method`] 枚举的穷尽匹配。处理函数只修改会话状态并返回要发布的事件，
//! 单个帧处理失败只记录日志，不影响后续帧。

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::{next_frame_id, Frame, FrameType, Method};
use crate::config::CacheConfig;
use crate::conversation::{
    conversation_id, parse_conversation_id, CachedMessage, ChatMessageType, ConversationStore,
    ConversationType, MessageStatus,
};
use crate::deduplication::DeduplicationManager;
use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, NoticeKind, TypingEvent};
use crate::presence::PresenceInfo;
use crate::queue::PendingRequests;
use crate::utils::now_millis;

/// 路由目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ChatMessage,
    ReadReceipt,
    Presence,
    Typing,
    Recall,
    Error,
    Notice(NoticeKind),
    /// 记录日志后丢弃
    Fallback,
}

/// 方法到路由的映射
pub fn route_for(method: &Method) -> Route {
    match method {
        Method::ConversationChat => Route::ChatMessage,
        Method::ConversationRead => Route::ReadReceipt,
        Method::PresenceOnline => Route::Presence,
        Method::ConversationTyping => Route::Typing,
        Method::ConversationRecall => Route::Recall,
        Method::Error => Route::Error,
        Method::FriendRequest => Route::Notice(NoticeKind::FriendRequest),
        Method::FriendAccepted => Route::Notice(NoticeKind::FriendAccepted),
        Method::GroupRequest => Route::Notice(NoticeKind::GroupRequest),
        Method::GroupAccepted => Route::Notice(NoticeKind::GroupAccepted),
        Method::Heartbeat | Method::Other(_) => Route::Fallback,
    }
}

/// 分类结果
#[derive(Debug)]
pub enum Dispatch {
    /// 心跳回包，交给心跳监测
    Heartbeat { id: String },
    /// 关联上了待回复请求；`broadcast` 为 Some 时还需要路由
    Reply {
        id: String,
        result: Result<Value>,
        broadcast: Option<(Route, Frame)>,
    },
    Routed(Route, Frame),
    /// 保留窗口内重复投递
    Duplicate { id: String },
    Dropped { reason: String },
}

pub struct InboundDispatcher {
    dedup: DeduplicationManager,
}

impl InboundDispatcher {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            dedup: DeduplicationManager::new(config),
        }
    }

    pub fn classify(&mut self, frame: Frame, pending: &PendingRequests) -> Dispatch {
        if frame.frame_type == FrameType::Heartbeat {
            return Dispatch::Heartbeat { id: frame.id };
        }

        if !frame.id.is_empty() && pending.contains(&frame.id) {
            let id = frame.id.clone();
            if frame.frame_type == FrameType::Error {
                return Dispatch::Reply {
                    id,
                    result: Err(server_error(&frame.data)),
                    broadcast: None,
                };
            }
            if frame.frame_type == FrameType::Data && frame.method.is_reply_and_broadcast() {
                let route = route_for(&frame.method);
                return Dispatch::Reply {
                    id,
                    result: Ok(frame.data.clone()),
                    broadcast: Some((route, frame)),
                };
            }
            return Dispatch::Reply {
                id,
                result: Ok(frame.data),
                broadcast: None,
            };
        }

        match frame.frame_type {
            FrameType::Ack => Dispatch::Dropped {
                reason: format!("ack {} has no pending request", frame.id),
            },
            FrameType::Error => Dispatch::Routed(Route::Error, frame),
            _ => {
                if !frame.id.is_empty() && self.dedup.check_and_mark(&frame.id) {
                    return Dispatch::Duplicate { id: frame.id };
                }
                Dispatch::Routed(route_for(&frame.method), frame)
            }
        }
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }
}

/// 把服务端 ERROR 帧的 data 转成错误
pub fn server_error(data: &Value) -> ChatError {
    let code = data.get("code").and_then(Value::as_i64).unwrap_or(-1);
    let message = data
        .get("message")
        .or_else(|| data.get("msg"))
        .and_then(Value::as_str)
        .unwrap_or("unknown server error")
        .to_string();
    ChatError::Server { code, message }
}

/// 执行路由，返回要发布的事件
pub fn apply(route: Route, frame: &Frame, store: &mut ConversationStore) -> Result<Vec<ChatEvent>> {
    match route {
        Route::ChatMessage => handle_chat(frame, store),
        Route::ReadReceipt => handle_read_receipt(frame, store),
        Route::Presence => handle_presence(frame, store),
        Route::Typing => handle_typing(frame, store),
        Route::Recall => handle_recall(frame, store),
        Route::Error => {
            let error = server_error(&frame.data);
            warn!("服务端推送错误: {}", error);
            Ok(vec![ChatEvent::Error { error, fatal: false }])
        }
        Route::Notice(kind) => Ok(vec![ChatEvent::Notice {
            kind,
            data: frame.data.clone(),
        }]),
        Route::Fallback => {
            debug!("未注册的方法 {}，丢弃帧 {}", frame.method, frame.id);
            Ok(Vec::new())
        }
    }
}

/// 入站载荷里定位会话的字段
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConversationRef {
    #[serde(alias = "conversation_id", alias = "chatId")]
    conversation_id: Option<String>,
    #[serde(alias = "chatType")]
    conversation_type: Option<Value>,
    #[serde(alias = "toId")]
    target_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChatPayload {
    #[serde(flatten)]
    conversation: ConversationRef,
    #[serde(alias = "fromId", alias = "from", alias = "userId")]
    sender_id: Option<Value>,
    #[serde(alias = "msgId", alias = "id")]
    message_id: Option<Value>,
    content: Option<Value>,
    #[serde(alias = "msgType", alias = "type")]
    message_type: Option<Value>,
    #[serde(alias = "time", alias = "createTime")]
    timestamp: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReadPayload {
    #[serde(flatten)]
    conversation: ConversationRef,
    #[serde(alias = "userId", alias = "fromId")]
    reader_id: Option<Value>,
    #[serde(alias = "timestamp", alias = "readTime")]
    up_to: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TypingPayload {
    #[serde(flatten)]
    conversation: ConversationRef,
    #[serde(alias = "senderId", alias = "fromId")]
    user_id: Option<Value>,
    #[serde(alias = "isTyping")]
    typing: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RecallPayload {
    #[serde(flatten)]
    conversation: ConversationRef,
    #[serde(alias = "senderId", alias = "fromId")]
    user_id: Option<Value>,
    #[serde(alias = "msgId", alias = "id")]
    message_id: Option<Value>,
}

fn id_string(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// 确定会话 ID：显式 ID 优先，否则由类型和对端推导。
/// 单聊的对端是"另一个人"：对方发来时取发送者，自己发出时取目标
fn resolve_conversation(
    reference: &ConversationRef,
    peer_hint: Option<&str>,
    store: &ConversationStore,
) -> Result<String> {
    if let Some(id) = reference.conversation_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    let conversation_type = match &reference.conversation_type {
        Some(Value::String(s)) => ConversationType::parse(s),
        Some(Value::Number(n)) => ConversationType::parse(&n.to_string()),
        _ => None,
    }
    .unwrap_or(ConversationType::Private);

    let target = id_string(&reference.target_id);
    let peer = match conversation_type {
        ConversationType::Group => target,
        ConversationType::Private => match peer_hint {
            Some(peer) if !store.is_self(peer) => Some(peer.to_string()),
            _ => target,
        },
    };
    peer.map(|peer| conversation_id(conversation_type, &peer))
        .ok_or_else(|| ChatError::Protocol("cannot resolve conversation from payload".to_string()))
}

fn content_string(content: Option<Value>) -> String {
    match content {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn handle_chat(frame: &Frame, store: &mut ConversationStore) -> Result<Vec<ChatEvent>> {
    let payload: ChatPayload = serde_json::from_value(frame.data.clone())?;
    let sender = id_string(&payload.sender_id);
    let conversation_id = resolve_conversation(&payload.conversation, sender.as_deref(), store)?;

    // 缺发送者时，单聊取对端
    let sender_id = sender.unwrap_or_else(|| {
        match parse_conversation_id(&conversation_id) {
            Some((ConversationType::Private, peer)) => peer,
            _ => String::new(),
        }
    });
    let message_id = id_string(&payload.message_id)
        .or_else(|| (!frame.id.is_empty()).then(|| frame.id.clone()))
        .unwrap_or_else(next_frame_id);
    let is_from_self = store.is_self(&sender_id);

    let message = CachedMessage {
        id: message_id,
        conversation_id,
        sender_id,
        message_type: payload
            .message_type
            .as_ref()
            .map(ChatMessageType::from_value)
            .unwrap_or_default(),
        content: content_string(payload.content),
        timestamp: payload.timestamp.unwrap_or_else(now_millis),
        status: if is_from_self {
            MessageStatus::Sent
        } else {
            MessageStatus::Delivered
        },
        is_from_self,
    };

    let outcome = store.ingest_inbound(message);
    debug!(
        "💬 消息 {} -> 会话 {} new={} unread={}",
        outcome.message.id, outcome.conversation.id, outcome.is_new, outcome.conversation.unread_count
    );

    let mut events = Vec::with_capacity(3);
    if outcome.is_new {
        events.push(ChatEvent::MessageReceived(outcome.message));
    } else if outcome.message.is_from_self {
        events.push(ChatEvent::MessageStatusChanged(outcome.message));
    }
    events.push(ChatEvent::ConversationUpdated(outcome.conversation));
    if let Some(change) = outcome.unread {
        events.push(ChatEvent::UnreadCountChanged(change));
    }
    Ok(events)
}

fn handle_read_receipt(frame: &Frame, store: &mut ConversationStore) -> Result<Vec<ChatEvent>> {
    let payload: ReadPayload = serde_json::from_value(frame.data.clone())?;
    let reader = id_string(&payload.reader_id);
    if reader.as_deref().map_or(false, |r| store.is_self(r)) {
        debug!("忽略自己的已读回执");
        return Ok(Vec::new());
    }
    let conversation_id = resolve_conversation(&payload.conversation, reader.as_deref(), store)?;
    let up_to = payload.up_to.unwrap_or_else(now_millis);

    let changed = store.apply_read_receipt(&conversation_id, up_to, MessageStatus::Read);
    let mut events: Vec<ChatEvent> = changed
        .into_iter()
        .map(ChatEvent::MessageStatusChanged)
        .collect();
    events.push(ChatEvent::ReadReceipt {
        conversation_id,
        reader_id: reader.unwrap_or_default(),
        up_to,
    });
    Ok(events)
}

fn handle_presence(frame: &Frame, store: &mut ConversationStore) -> Result<Vec<ChatEvent>> {
    let info: PresenceInfo = serde_json::from_value(frame.data.clone())?;
    if store.presence_mut().update(info.clone()) {
        Ok(vec![ChatEvent::PresenceChanged(info)])
    } else {
        Ok(Vec::new())
    }
}

fn handle_typing(frame: &Frame, store: &mut ConversationStore) -> Result<Vec<ChatEvent>> {
    let payload: TypingPayload = serde_json::from_value(frame.data.clone())?;
    let user_id = id_string(&payload.user_id).unwrap_or_default();
    if store.is_self(&user_id) {
        return Ok(Vec::new());
    }
    let peer = (!user_id.is_empty()).then_some(user_id.as_str());
    let conversation_id = resolve_conversation(&payload.conversation, peer, store)?;
    Ok(vec![ChatEvent::TypingIndicator(TypingEvent {
        conversation_id,
        user_id,
        is_typing: payload.typing.unwrap_or(true),
    })])
}

fn handle_recall(frame: &Frame, store: &mut ConversationStore) -> Result<Vec<ChatEvent>> {
    let payload: RecallPayload = serde_json::from_value(frame.data.clone())?;
    let message_id = id_string(&payload.message_id)
        .ok_or_else(|| ChatError::Protocol("recall without message id".to_string()))?;
    let user = id_string(&payload.user_id);
    let conversation_id = resolve_conversation(&payload.conversation, user.as_deref(), store)?;

    let mut events = Vec::with_capacity(2);
    match store.recall(&conversation_id, &message_id) {
        Ok(_) => {
            if let Some(conversation) = store.conversation(&conversation_id) {
                events.push(ChatEvent::ConversationUpdated(conversation));
            }
        }
        // 本地没有缓存这条消息，UI 仍然可能在显示
        Err(ChatError::NotFound(_)) => debug!("撤回的消息 {} 不在本地缓存", message_id),
        Err(e) => return Err(e),
    }
    events.insert(
        0,
        ChatEvent::MessageRecalled {
            conversation_id,
            message_id,
        },
    );
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_frame, Frame};
    use crate::queue::{Completion, PendingRequest};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    fn dispatcher() -> InboundDispatcher {
        InboundDispatcher::new(&CacheConfig::default())
    }

    fn store() -> ConversationStore {
        let mut store = ConversationStore::new(100);
        store.set_self_user("me");
        store
    }

    fn pending_with(id: &str) -> PendingRequests {
        let mut pending = PendingRequests::new();
        pending
            .register(PendingRequest {
                id: id.to_string(),
                method: Method::ConversationChat,
                completion: Completion::silent(),
                timeout: Duration::from_secs(15),
                registered_at: Instant::now(),
            })
            .unwrap();
        pending
    }

    #[test]
    fn test_routing_table_is_total() {
        assert_eq!(route_for(&Method::ConversationChat), Route::ChatMessage);
        assert_eq!(route_for(&Method::parse("conversation.markChat")), Route::ReadReceipt);
        assert_eq!(route_for(&Method::parse("conversation.read")), Route::ReadReceipt);
        assert_eq!(
            route_for(&Method::GroupAccepted),
            Route::Notice(NoticeKind::GroupAccepted)
        );
        assert_eq!(route_for(&Method::Other("shop.order".into())), Route::Fallback);
    }

    #[test]
    fn test_correlated_reply_resolves() {
        let mut d = dispatcher();
        let pending = pending_with("r1");

        let ack = Frame::ack("r1", Method::Other(String::new()), json!({"ok": true}));
        match d.classify(ack, &pending) {
            Dispatch::Reply { id, result, broadcast } => {
                assert_eq!(id, "r1");
                assert_eq!(result.unwrap(), json!({"ok": true}));
                assert!(broadcast.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = Frame::error_reply("r1", 403, "forbidden");
        match d.classify(err, &pending) {
            Dispatch::Reply { result, .. } => assert_eq!(
                result.unwrap_err(),
                ChatError::Server {
                    code: 403,
                    message: "forbidden".into()
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_chat_reply_is_also_broadcast() {
        let mut d = dispatcher();
        let pending = pending_with("r2");
        let frame = Frame::new(
            FrameType::Data,
            "r2",
            Method::ConversationChat,
            json!({"conversationId": "private_9", "content": "hi"}),
        );
        match d.classify(frame, &pending) {
            Dispatch::Reply {
                broadcast: Some((Route::ChatMessage, _)),
                ..
            } => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_uncorrelated_frames() {
        let mut d = dispatcher();
        let pending = PendingRequests::new();

        let late = Frame::ack("gone", Method::Other(String::new()), json!({}));
        assert!(matches!(d.classify(late, &pending), Dispatch::Dropped { .. }));

        let hb = Frame::heartbeat();
        assert!(matches!(d.classify(hb, &pending), Dispatch::Heartbeat { .. }));

        let push = Frame::request(Method::FriendRequest, json!({"fromId": 7}));
        assert!(matches!(
            d.classify(push.clone(), &pending),
            Dispatch::Routed(Route::Notice(NoticeKind::FriendRequest), _)
        ));
        assert!(matches!(d.classify(push, &pending), Dispatch::Duplicate { .. }));
    }

    #[test]
    fn test_chat_push_creates_conversation() {
        let mut store = store();
        store.set_active(Some("private_1"));
        let frame = decode_frame(
            br#"{"method":"conversation.chat","data":{"conversationId":"private_9","content":"hi"}}"#,
        )
        .unwrap();

        let events = apply(Route::ChatMessage, &frame, &mut store).unwrap();
        assert_eq!(events.len(), 3);
        match &events[0] {
            ChatEvent::MessageReceived(message) => {
                assert_eq!(message.conversation_id, "private_9");
                assert_eq!(message.sender_id, "9");
                assert_eq!(message.content, "hi");
                assert!(!message.is_from_self);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.unread_count("private_9"), 1);
        assert_eq!(store.total_unread(), 1);
    }

    #[test]
    fn test_chat_resolves_from_type_and_sender() {
        let mut store = store();
        let incoming = Frame::request(
            Method::ConversationChat,
            json!({"conversationType": "private", "targetId": "me", "senderId": 42, "content": "在吗", "messageId": "m1", "timestamp": 1000}),
        );
        apply(Route::ChatMessage, &incoming, &mut store).unwrap();
        assert_eq!(store.unread_count("private_42"), 1);

        let group = Frame::request(
            Method::ConversationChat,
            json!({"conversationType": 2, "targetId": "3", "senderId": "42", "content": "hello", "messageType": "image"}),
        );
        apply(Route::ChatMessage, &group, &mut store).unwrap();
        let messages = store.messages("group_3");
        assert_eq!(messages[0].message_type, ChatMessageType::Image);

        let unresolvable = Frame::request(
            Method::ConversationChat,
            json!({"conversationType": "group", "content": "?"}),
        );
        assert!(matches!(
            apply(Route::ChatMessage, &unresolvable, &mut store),
            Err(ChatError::Protocol(_))
        ));
    }

    #[test]
    fn test_read_receipt_and_recall() {
        let mut store = store();
        store.append_outbound(CachedMessage {
            id: "o1".into(),
            conversation_id: "private_9".into(),
            sender_id: "me".into(),
            message_type: ChatMessageType::Text,
            content: "hi".into(),
            timestamp: 100,
            status: MessageStatus::Sending,
            is_from_self: true,
        });
        store.update_status("private_9", "o1", MessageStatus::Sent).unwrap();

        let receipt = Frame::notify(
            Method::ConversationRead,
            json!({"readerId": "9", "upTo": 150}),
        );
        let events = apply(Route::ReadReceipt, &receipt, &mut store).unwrap();
        assert!(matches!(&events[0], ChatEvent::MessageStatusChanged(m) if m.status == MessageStatus::Read));
        assert!(matches!(&events[1], ChatEvent::ReadReceipt { up_to: 150, .. }));

        let recall = Frame::notify(
            Method::ConversationRecall,
            json!({"conversationId": "private_9", "messageId": "o1"}),
        );
        let events = apply(Route::Recall, &recall, &mut store).unwrap();
        assert!(matches!(&events[0], ChatEvent::MessageRecalled { message_id, .. } if message_id == "o1"));
        assert_eq!(
            store.message("private_9", "o1").unwrap().status,
            MessageStatus::Recalled
        );

        // 不在缓存里的撤回仍然通知
        let unknown = Frame::notify(
            Method::ConversationRecall,
            json!({"conversationId": "private_9", "messageId": "old"}),
        );
        assert_eq!(apply(Route::Recall, &unknown, &mut store).unwrap().len(), 1);
    }

    #[test]
    fn test_presence_typing_and_error_routes() {
        let mut store = store();
        let presence = Frame::notify(Method::PresenceOnline, json!({"userId": "9", "online": true}));
        assert_eq!(apply(Route::Presence, &presence, &mut store).unwrap().len(), 1);
        assert!(apply(Route::Presence, &presence, &mut store).unwrap().is_empty());
        assert!(store.presence().is_online("9"));

        let typing = Frame::notify(Method::ConversationTyping, json!({"userId": "9"}));
        match apply(Route::Typing, &typing, &mut store).unwrap().as_slice() {
            [ChatEvent::TypingIndicator(t)] => {
                assert_eq!(t.conversation_id, "private_9");
                assert!(t.is_typing);
            }
            other => panic!("unexpected {:?}", other),
        }

        let error = Frame::notify(Method::Error, json!({"code": 500, "msg": "boom"}));
        match apply(Route::Error, &error, &mut store).unwrap().as_slice() {
            [ChatEvent::Error { error, fatal: false }] => {
                assert_eq!(error, &ChatError::Server { code: 500, message: "boom".into() })
            }
            other => panic!("unexpected {:?}", other),
        }

        let broken = Frame::notify(Method::PresenceOnline, json!({"online": "yes"}));
        assert!(apply(Route::Presence, &broken, &mut store).is_err());
    }
}
