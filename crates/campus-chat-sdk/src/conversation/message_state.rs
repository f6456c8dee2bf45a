use serde::{Deserialize, Serialize};

/// 消息状态
///
/// 状态转换规则：
/// - Sending -> Sent -> Delivered -> Read（只能前进，可以跳过中间状态）
/// - Sending -> Failed；Failed 可手动重发回到 Sending
/// - Recalled 可以从 Sent/Delivered/Read 转换而来，之后不再变化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    Recalled,
}

impl MessageStatus {
    /// 检查是否可以从当前状态转换到目标状态
    pub fn can_transition_to(&self, target: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, target),
            (Sending, Sent)
                | (Sending, Failed)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Delivered, Read)
                | (Failed, Sending)
                | (Sent, Recalled)
                | (Delivered, Recalled)
                | (Read, Recalled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
            MessageStatus::Recalled => "recalled",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
