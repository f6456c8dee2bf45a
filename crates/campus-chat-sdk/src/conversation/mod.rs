//! 会话聚合
//!
//! 根据分发后的事件维护会话列表、未读数、最后一条消息和本地消息缓存。
//! 只在事件循环里修改；外部通过 `Arc<RwLock<ConversationStore>>` 读取，
//! 读到的数据最多落后一个事件。

pub mod entities;
pub mod message_state;

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};

pub use entities::{
    conversation_id, parse_conversation_id, CachedMessage, ChatMessageType, Conversation,
    ConversationType,
};
pub use message_state::MessageStatus;

use crate::error::{ChatError, Result};
use crate::presence::PresenceCache;

/// 未读数变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadChange {
    pub conversation_id: String,
    pub unread: u32,
    pub total: u32,
}

/// 入站消息的处理结果
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub message: CachedMessage,
    pub conversation: Conversation,
    /// false 表示重复投递（只更新了缓存里的副本）或消息早于缓存窗口
    pub is_new: bool,
    pub unread: Option<UnreadChange>,
}

struct ConversationEntry {
    conversation: Conversation,
    /// 按时间戳升序
    messages: VecDeque<CachedMessage>,
}

impl ConversationEntry {
    fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: VecDeque::new(),
        }
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    /// 按时间戳有序插入，超过上限时淘汰最早的。返回新消息是否留在缓存里
    fn insert_sorted(&mut self, message: CachedMessage, limit: usize) -> bool {
        let index = self
            .messages
            .iter()
            .rposition(|m| m.timestamp <= message.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.messages.insert(index, message);
        let evicted = self.messages.len().saturating_sub(limit);
        self.messages.drain(..evicted);
        index >= evicted
    }

    /// lastMessage 只向前推进
    fn touch_last_message(&mut self, message: &CachedMessage) {
        let newer = match &self.conversation.last_message {
            Some(last) => message.timestamp >= last.timestamp || last.id == message.id,
            None => true,
        };
        if newer {
            self.conversation.last_message = Some(message.clone());
        }
        self.conversation.update_time = self.conversation.update_time.max(message.timestamp);
    }

    fn refresh_last_message_copy(&mut self, message: &CachedMessage) {
        if let Some(last) = &mut self.conversation.last_message {
            if last.id == message.id {
                *last = message.clone();
            }
        }
    }
}

pub struct ConversationStore {
    entries: HashMap<String, ConversationEntry>,
    active: Option<String>,
    total_unread: u32,
    message_limit: usize,
    self_user_id: Option<String>,
    presence: PresenceCache,
}

impl ConversationStore {
    pub fn new(message_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            active: None,
            total_unread: 0,
            message_limit: message_limit.max(1),
            self_user_id: None,
            presence: PresenceCache::new(),
        }
    }

    pub fn set_self_user(&mut self, user_id: impl Into<String>) {
        self.self_user_id = Some(user_id.into());
    }

    pub fn self_user_id(&self) -> Option<&str> {
        self.self_user_id.as_deref()
    }

    pub fn is_self(&self, user_id: &str) -> bool {
        self.self_user_id.as_deref() == Some(user_id)
    }

    fn entry_mut(&mut self, id: &str) -> (&mut ConversationEntry, bool) {
        let created = !self.entries.contains_key(id);
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| ConversationEntry::new(Conversation::from_id(id)));
        if created {
            debug!("🆕 创建会话: {}", id);
        }
        (entry, created)
    }

    /// 写入一条入站消息，会话不存在时惰性创建
    pub fn ingest_inbound(&mut self, message: CachedMessage) -> IngestOutcome {
        let limit = self.message_limit;
        let is_active = self.active.as_deref() == Some(message.conversation_id.as_str());
        let conversation_id = message.conversation_id.clone();
        let (entry, _) = self.entry_mut(&conversation_id);

        let is_new = match entry.position(&message.id) {
            Some(index) => {
                // 重投或自己消息的回显：合并到已有副本，时间戳不回退
                let existing = &entry.messages[index];
                let status = if existing.status.can_transition_to(message.status) {
                    message.status
                } else {
                    existing.status
                };
                let timestamp = existing.timestamp.max(message.timestamp);
                let moved = timestamp != existing.timestamp;
                let merged = CachedMessage {
                    status,
                    timestamp,
                    ..message.clone()
                };
                if moved {
                    entry.messages.remove(index);
                    entry.insert_sorted(merged.clone(), limit);
                } else {
                    entry.messages[index] = merged.clone();
                }
                entry.touch_last_message(&merged);
                false
            }
            None => {
                let retained = entry.insert_sorted(message.clone(), limit);
                if retained {
                    entry.touch_last_message(&message);
                } else {
                    debug!("消息 {} 早于缓存窗口，不计入会话", message.id);
                }
                retained
            }
        };

        let bump = is_new && !message.is_from_self && !is_active;
        if bump {
            entry.conversation.unread_count += 1;
        }
        let conversation = entry.conversation.clone();
        let stored = entry
            .position(&message.id)
            .map(|i| entry.messages[i].clone())
            .unwrap_or(message);

        let unread = if bump {
            self.total_unread += 1;
            Some(UnreadChange {
                conversation_id: conversation.id.clone(),
                unread: conversation.unread_count,
                total: self.total_unread,
            })
        } else {
            None
        };

        IngestOutcome {
            message: stored,
            conversation,
            is_new,
            unread,
        }
    }

    /// 写入一条自己发出的消息（乐观显示）
    pub fn append_outbound(&mut self, message: CachedMessage) -> Conversation {
        let limit = self.message_limit;
        let (entry, _) = self.entry_mut(&message.conversation_id);
        match entry.position(&message.id) {
            Some(index) => entry.messages[index] = message.clone(),
            None => {
                entry.insert_sorted(message.clone(), limit);
            }
        }
        entry.touch_last_message(&message);
        entry.conversation.clone()
    }

    /// 更新消息状态。状态相同返回 `Ok(None)`，不允许的转换返回错误
    pub fn update_status(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<Option<CachedMessage>> {
        let entry = self
            .entries
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        let index = entry
            .position(message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;

        let current = entry.messages[index].status;
        if current == status {
            return Ok(None);
        }
        if !current.can_transition_to(status) {
            return Err(ChatError::InvalidTransition {
                from: current.to_string(),
                to: status.to_string(),
            });
        }
        entry.messages[index].status = status;
        let updated = entry.messages[index].clone();
        entry.refresh_last_message_copy(&updated);
        debug!("消息 {} 状态 {} -> {}", message_id, current, status);
        Ok(Some(updated))
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<CachedMessage> {
        let entry = self.entries.get(conversation_id)?;
        entry.position(message_id).map(|i| entry.messages[i].clone())
    }

    /// 切换当前打开的会话，清零其未读
    pub fn set_active(&mut self, conversation_id: Option<&str>) -> Option<UnreadChange> {
        self.active = conversation_id.map(str::to_string);
        let id = conversation_id?;
        self.clear_unread(id)
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// 本地标记已读
    pub fn mark_read_local(&mut self, conversation_id: &str) -> Result<Option<UnreadChange>> {
        if !self.entries.contains_key(conversation_id) {
            return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
        }
        Ok(self.clear_unread(conversation_id))
    }

    fn clear_unread(&mut self, conversation_id: &str) -> Option<UnreadChange> {
        let entry = self.entries.get_mut(conversation_id)?;
        let cleared = entry.conversation.unread_count;
        if cleared == 0 {
            return None;
        }
        entry.conversation.unread_count = 0;
        self.total_unread = self.total_unread.saturating_sub(cleared);
        info!("📖 会话 {} 清零未读 {}，总未读 {}", conversation_id, cleared, self.total_unread);
        Some(UnreadChange {
            conversation_id: conversation_id.to_string(),
            unread: 0,
            total: self.total_unread,
        })
    }

    /// 对方已读回执：把不晚于 `up_to` 的自己的消息推进到 `status`
    pub fn apply_read_receipt(
        &mut self,
        conversation_id: &str,
        up_to: i64,
        status: MessageStatus,
    ) -> Vec<CachedMessage> {
        let Some(entry) = self.entries.get_mut(conversation_id) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for message in entry.messages.iter_mut() {
            if message.is_from_self
                && message.timestamp <= up_to
                && message.status.can_transition_to(status)
            {
                message.status = status;
                changed.push(message.clone());
            }
        }
        for message in &changed {
            entry.refresh_last_message_copy(message);
        }
        changed
    }

    /// 撤回消息
    pub fn recall(&mut self, conversation_id: &str, message_id: &str) -> Result<CachedMessage> {
        match self.update_status(conversation_id, message_id, MessageStatus::Recalled)? {
            Some(message) => Ok(message),
            // 已经是撤回状态
            None => self
                .message(conversation_id, message_id)
                .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id))),
        }
    }

    /// 合并接口查到的会话信息。本地未读不被覆盖
    pub fn upsert(&mut self, conversation: Conversation) -> Conversation {
        let is_active = self.active.as_deref() == Some(conversation.id.as_str());
        match self.entries.get_mut(&conversation.id) {
            Some(entry) => {
                let local = &mut entry.conversation;
                local.conversation_type = conversation.conversation_type;
                local.target_id = conversation.target_id;
                if conversation.title.is_some() {
                    local.title = conversation.title;
                }
                if conversation.avatar.is_some() {
                    local.avatar = conversation.avatar;
                }
                local.is_muted = conversation.is_muted;
                local.is_sticky = conversation.is_sticky;
                local.update_time = local.update_time.max(conversation.update_time);
                if let Some(remote_last) = conversation.last_message {
                    let newer = local
                        .last_message
                        .as_ref()
                        .map_or(true, |last| remote_last.timestamp > last.timestamp);
                    if newer {
                        local.last_message = Some(remote_last);
                    }
                }
                local.clone()
            }
            None => {
                let mut conversation = conversation;
                if is_active {
                    conversation.unread_count = 0;
                }
                self.total_unread += conversation.unread_count;
                self.entries
                    .insert(conversation.id.clone(), ConversationEntry::new(conversation.clone()));
                conversation
            }
        }
    }

    pub fn remove(&mut self, conversation_id: &str) -> Option<Conversation> {
        let entry = self.entries.remove(conversation_id)?;
        self.total_unread = self
            .total_unread
            .saturating_sub(entry.conversation.unread_count);
        if self.active.as_deref() == Some(conversation_id) {
            self.active = None;
        }
        info!("🗑️ 删除会话: {}", conversation_id);
        Some(entry.conversation)
    }

    pub fn set_muted(&mut self, conversation_id: &str, muted: bool) -> Result<Conversation> {
        self.modify(conversation_id, |c| c.is_muted = muted)
    }

    pub fn set_sticky(&mut self, conversation_id: &str, sticky: bool) -> Result<Conversation> {
        self.modify(conversation_id, |c| c.is_sticky = sticky)
    }

    fn modify(
        &mut self,
        conversation_id: &str,
        f: impl FnOnce(&mut Conversation),
    ) -> Result<Conversation> {
        let entry = self
            .entries
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        f(&mut entry.conversation);
        Ok(entry.conversation.clone())
    }

    /// 合并历史消息：按 ID 去重、按时间排序，不影响未读。返回新增条数
    pub fn merge_history(&mut self, conversation_id: &str, history: Vec<CachedMessage>) -> usize {
        let limit = self.message_limit;
        let (entry, _) = self.entry_mut(conversation_id);
        let mut inserted = 0;
        for mut message in history {
            message.conversation_id = conversation_id.to_string();
            if entry.position(&message.id).is_some() {
                continue;
            }
            if entry.insert_sorted(message.clone(), limit) {
                entry.touch_last_message(&message);
                inserted += 1;
            }
        }
        debug!("📜 会话 {} 合并历史 {} 条", conversation_id, inserted);
        inserted
    }

    /// 显示顺序：置顶优先，然后按更新时间倒序
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .entries
            .values()
            .map(|e| e.conversation.clone())
            .collect();
        list.sort_by(|a, b| {
            b.is_sticky
                .cmp(&a.is_sticky)
                .then(b.update_time.cmp(&a.update_time))
                .then(a.id.cmp(&b.id))
        });
        list
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.entries
            .get(conversation_id)
            .map(|e| e.conversation.clone())
    }

    /// 会话的缓存消息，按时间升序
    pub fn messages(&self, conversation_id: &str) -> Vec<CachedMessage> {
        self.entries
            .get(conversation_id)
            .map(|e| e.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        self.entries
            .get(conversation_id)
            .map(|e| e.conversation.unread_count)
            .unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.total_unread
    }

    pub fn presence(&self) -> &PresenceCache {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceCache {
        &mut self.presence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
