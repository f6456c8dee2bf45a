use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message_state::MessageStatus;

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    /// 单聊
    Private,
    /// 群聊
    Group,
}

impl ConversationType {
    /// 宽松解析：`private` / `single` / `1` 为单聊，`group` / `2` 为群聊
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "private" | "single" | "1" => Some(ConversationType::Private),
            "group" | "2" => Some(ConversationType::Group),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Private => "private",
            ConversationType::Group => "group",
        }
    }
}

/// 会话 ID 由类型和对端 ID 拼成，例如 `private_9`、`group_3`
pub fn conversation_id(conversation_type: ConversationType, target_id: &str) -> String {
    format!("{}_{}", conversation_type.as_str(), target_id)
}

/// 从会话 ID 拆出类型和对端 ID
pub fn parse_conversation_id(id: &str) -> Option<(ConversationType, String)> {
    let (prefix, target) = id.split_once('_')?;
    if target.is_empty() {
        return None;
    }
    Some((ConversationType::parse(prefix)?, target.to_string()))
}

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageType {
    Text,
    Image,
    Voice,
    Video,
    File,
    Location,
    /// 商品、帖子等卡片
    Card,
    System,
}

impl ChatMessageType {
    /// 服务端可能给字符串也可能给数字
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "image" | "img" => ChatMessageType::Image,
                "voice" | "audio" => ChatMessageType::Voice,
                "video" => ChatMessageType::Video,
                "file" => ChatMessageType::File,
                "location" => ChatMessageType::Location,
                "card" | "goods" | "product" => ChatMessageType::Card,
                "system" => ChatMessageType::System,
                _ => ChatMessageType::Text,
            },
            Value::Number(n) => match n.as_i64() {
                Some(2) => ChatMessageType::Image,
                Some(3) => ChatMessageType::Voice,
                Some(4) => ChatMessageType::Video,
                Some(5) => ChatMessageType::File,
                Some(6) => ChatMessageType::Location,
                Some(7) => ChatMessageType::Card,
                Some(10) => ChatMessageType::System,
                _ => ChatMessageType::Text,
            },
            _ => ChatMessageType::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMessageType::Text => "text",
            ChatMessageType::Image => "image",
            ChatMessageType::Voice => "voice",
            ChatMessageType::Video => "video",
            ChatMessageType::File => "file",
            ChatMessageType::Location => "location",
            ChatMessageType::Card => "card",
            ChatMessageType::System => "system",
        }
    }

    /// 会话列表里的摘要文字
    pub fn preview(&self, content: &str) -> String {
        match self {
            ChatMessageType::Text | ChatMessageType::System => content.to_string(),
            ChatMessageType::Image => "[图片]".to_string(),
            ChatMessageType::Voice => "[语音]".to_string(),
            ChatMessageType::Video => "[视频]".to_string(),
            ChatMessageType::File => "[文件]".to_string(),
            ChatMessageType::Location => "[位置]".to_string(),
            ChatMessageType::Card => "[卡片]".to_string(),
        }
    }
}

impl Default for ChatMessageType {
    fn default() -> Self {
        ChatMessageType::Text
    }
}

/// 本地缓存的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub message_type: ChatMessageType,
    pub content: String,
    /// 消息时间（UTC毫秒时间戳）
    pub timestamp: i64,
    pub status: MessageStatus,
    pub is_from_self: bool,
}

impl CachedMessage {
    pub fn preview(&self) -> String {
        if self.status == MessageStatus::Recalled {
            return "[消息已撤回]".to_string();
        }
        self.message_type.preview(&self.content)
    }
}

/// 会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub target_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub last_message: Option<CachedMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_sticky: bool,
    /// 最后更新时间（UTC毫秒时间戳）
    #[serde(default)]
    pub update_time: i64,
}

impl Conversation {
    pub fn new(conversation_type: ConversationType, target_id: impl Into<String>) -> Self {
        let target_id = target_id.into();
        Self {
            id: conversation_id(conversation_type, &target_id),
            conversation_type,
            target_id,
            title: None,
            avatar: None,
            last_message: None,
            unread_count: 0,
            is_muted: false,
            is_sticky: false,
            update_time: 0,
        }
    }

    /// 从会话 ID 创建；ID 无法解析时当作单聊，对端 ID 取整个 ID
    pub fn from_id(id: &str) -> Self {
        match parse_conversation_id(id) {
            Some((conversation_type, target_id)) => Self::new(conversation_type, target_id),
            None => Self {
                id: id.to_string(),
                ..Self::new(ConversationType::Private, id)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conversation_id_round_trip() {
        assert_eq!(conversation_id(ConversationType::Private, "9"), "private_9");
        assert_eq!(
            parse_conversation_id("group_3"),
            Some((ConversationType::Group, "3".to_string()))
        );
        assert_eq!(
            parse_conversation_id("private_user_1"),
            Some((ConversationType::Private, "user_1".to_string()))
        );
        assert_eq!(parse_conversation_id("nonsense"), None);
        assert_eq!(parse_conversation_id("private_"), None);

        let conv = Conversation::from_id("weird-id");
        assert_eq!(conv.id, "weird-id");
        assert_eq!(conv.conversation_type, ConversationType::Private);
    }

    #[test]
    fn test_message_type_parsing() {
        assert_eq!(ChatMessageType::from_value(&json!("image")), ChatMessageType::Image);
        assert_eq!(ChatMessageType::from_value(&json!(3)), ChatMessageType::Voice);
        assert_eq!(ChatMessageType::from_value(&json!(null)), ChatMessageType::Text);
        assert_eq!(ChatMessageType::Image.preview("http://x"), "[图片]");
    }

    #[test]
    fn test_conversation_deserializes_from_api_shape() {
        let conv: Conversation = serde_json::from_value(json!({
            "id": "group_3",
            "type": "group",
            "targetId": "3",
            "title": "二手书交流群",
            "isSticky": true
        }))
        .unwrap();
        assert_eq!(conv.conversation_type, ConversationType::Group);
        assert!(conv.is_sticky);
        assert_eq!(conv.unread_count, 0);
    }
}
