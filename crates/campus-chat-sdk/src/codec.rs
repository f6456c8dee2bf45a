//! 帧编解码
//!
//! 线上格式为 JSON 文本：`{"frameType":0,"id":"...","method":"...","data":{...}}`。
//! 服务端推送还有一种嵌套格式，`method` 与 `data` 放在外层 `data` 里：
//! `{"frameType":0,"id":"...","data":{"method":"...","data":{...}}}`，
//! 解码时统一规整为 [`Frame`]。

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// 解码错误
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("unknown frame type: {0}")]
    UnknownFrameType(i64),
    #[error("frame id must be a string or number")]
    InvalidId,
    #[error("data frame without method")]
    MissingMethod,
    #[error("ack frame without id")]
    MissingId,
}

/// 帧类型（线上取值 0..9，其余保留）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// 业务数据，可能需要回复
    Data,
    /// 心跳探测 / 心跳回复
    Heartbeat,
    /// 对某个请求的确认回复
    Ack,
    /// 单向通知，不需要回复
    NoAck,
    /// 错误回复
    Error,
}

impl FrameType {
    pub fn as_wire(self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::Heartbeat => 1,
            FrameType::Ack => 2,
            FrameType::NoAck => 3,
            FrameType::Error => 4,
        }
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(FrameType::Data),
            1 => Some(FrameType::Heartbeat),
            2 => Some(FrameType::Ack),
            3 => Some(FrameType::NoAck),
            4 => Some(FrameType::Error),
            _ => None,
        }
    }
}

/// 协议方法（封闭枚举，未知方法落到 `Other`）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    PresenceOnline,
    ConversationChat,
    /// `conversation.markChat` 与 `conversation.read` 两种写法
    ConversationRead,
    ConversationTyping,
    ConversationRecall,
    FriendRequest,
    FriendAccepted,
    GroupRequest,
    GroupAccepted,
    Heartbeat,
    Error,
    /// 未注册的方法；空字符串表示纯回复帧
    Other(String),
}

impl Method {
    pub fn parse(method: &str) -> Self {
        match method {
            "presence.online" => Method::PresenceOnline,
            "conversation.chat" => Method::ConversationChat,
            "conversation.markChat" | "conversation.read" => Method::ConversationRead,
            "conversation.typing" => Method::ConversationTyping,
            "conversation.recall" => Method::ConversationRecall,
            "friend.request" => Method::FriendRequest,
            "friend.accepted" => Method::FriendAccepted,
            "group.request" => Method::GroupRequest,
            "group.accepted" => Method::GroupAccepted,
            "heartbeat" => Method::Heartbeat,
            "error" => Method::Error,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::PresenceOnline => "presence.online",
            Method::ConversationChat => "conversation.chat",
            Method::ConversationRead => "conversation.markChat",
            Method::ConversationTyping => "conversation.typing",
            Method::ConversationRecall => "conversation.recall",
            Method::FriendRequest => "friend.request",
            Method::FriendAccepted => "friend.accepted",
            Method::GroupRequest => "group.request",
            Method::GroupAccepted => "group.accepted",
            Method::Heartbeat => "heartbeat",
            Method::Error => "error",
            Method::Other(other) => other,
        }
    }

    /// 该方法的数据帧既是请求的回复，也是需要分发的广播
    pub fn is_reply_and_broadcast(&self) -> bool {
        matches!(self, Method::ConversationChat)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 规范化后的帧
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub id: String,
    pub method: Method,
    pub data: Value,
}

impl Frame {
    pub fn new(frame_type: FrameType, id: impl Into<String>, method: Method, data: Value) -> Self {
        Self {
            frame_type,
            id: id.into(),
            method,
            data: normalize_data(data),
        }
    }

    /// 需要回复的数据帧，自动分配帧 ID
    pub fn request(method: Method, data: Value) -> Self {
        Self::new(FrameType::Data, next_frame_id(), method, data)
    }

    /// 单向通知帧
    pub fn notify(method: Method, data: Value) -> Self {
        Self::new(FrameType::NoAck, next_frame_id(), method, data)
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, next_frame_id(), Method::Heartbeat, Value::Null)
    }

    /// 构造对 `id` 的确认回复（服务端视角，测试与模拟用）
    pub fn ack(id: impl Into<String>, method: Method, data: Value) -> Self {
        Self::new(FrameType::Ack, id, method, data)
    }

    /// 构造对 `id` 的错误回复
    pub fn error_reply(id: impl Into<String>, code: i64, message: &str) -> Self {
        Self::new(
            FrameType::Error,
            id,
            Method::Error,
            serde_json::json!({ "code": code, "message": message }),
        )
    }

    /// 数据帧是否期待回复
    pub fn expects_reply(&self) -> bool {
        self.frame_type == FrameType::Data
    }
}

/// 生成帧 ID
pub fn next_frame_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame<'a> {
    frame_type: u8,
    id: &'a str,
    method: &'a str,
    data: &'a Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawFrame {
    frame_type: Option<i64>,
    id: Option<Value>,
    method: Option<String>,
    data: Option<Value>,
}

/// 编码为线上格式
pub fn encode_frame(frame: &Frame) -> Result<Bytes> {
    let wire = WireFrame {
        frame_type: frame.frame_type.as_wire(),
        id: &frame.id,
        method: frame.method.as_str(),
        data: &frame.data,
    };
    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .map_err(|e| ChatError::Protocol(format!("encode frame {} failed: {}", frame.id, e)))
}

/// 解码线上数据，两种入站格式都规整为规范帧
pub fn decode_frame(payload: &[u8]) -> std::result::Result<Frame, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let raw: RawFrame = serde_json::from_value(value)?;

    let frame_type = match raw.frame_type {
        None => FrameType::Data,
        Some(v) => FrameType::from_wire(v).ok_or(DecodeError::UnknownFrameType(v))?,
    };
    let mut id = id_to_string(raw.id)?;
    let mut data = raw.data.unwrap_or(Value::Null);
    let mut method = raw.method.filter(|m| !m.is_empty());

    // 推送格式：method/data 在外层 data 里
    if method.is_none() {
        if let Some((inner_method, inner_id, inner_data)) = lift_push(&mut data) {
            method = Some(inner_method);
            if id.is_empty() {
                id = inner_id;
            }
            data = inner_data;
        }
    }

    let method = match method {
        Some(m) => Method::parse(&m),
        None => match frame_type {
            FrameType::Heartbeat => Method::Heartbeat,
            FrameType::Error => Method::Error,
            FrameType::Ack => Method::Other(String::new()),
            FrameType::Data | FrameType::NoAck => return Err(DecodeError::MissingMethod),
        },
    };

    if frame_type == FrameType::Ack && id.is_empty() {
        return Err(DecodeError::MissingId);
    }

    Ok(Frame {
        frame_type,
        id,
        method,
        data: normalize_data(data),
    })
}

fn id_to_string(id: Option<Value>) -> std::result::Result<String, DecodeError> {
    match id {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(DecodeError::InvalidId),
    }
}

fn lift_push(data: &mut Value) -> Option<(String, String, Value)> {
    let obj = data.as_object_mut()?;
    let method = obj.get("method")?.as_str()?.to_string();
    let inner_id = match obj.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let inner = obj.remove("data").unwrap_or(Value::Null);
    Some((method, inner_id, inner))
}

fn normalize_data(data: Value) -> Value {
    match data {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}
