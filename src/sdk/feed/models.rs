//! 聊天消息模型定义

use crate::sdk::types::Identity;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// 快照缺少作者名时使用的占位名
pub const ANONYMOUS_AUTHOR: &str = "Anonymous";

/// 聊天消息（创建后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub author_id: String,
    pub author_name: String,
    pub author_avatar_ref: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub is_from_current_identity: bool,
}

/// 服务端消息文档
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDocument {
    /// 文档 ID（由服务端分配，新建时可为空）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "userName", default)]
    pub user_name: Option<String>,
    #[serde(rename = "userID", default)]
    pub user_id: Option<String>,
    #[serde(rename = "userPhotoURL", default)]
    pub user_photo_url: Option<String>,
    /// 发送时间（毫秒时间戳）
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl MessageDocument {
    /// 转为聊天消息；缺少 ID 或时间戳的文档无法排序，直接丢弃
    pub fn into_message(self, current: Option<&Identity>) -> Option<ChatMessage> {
        let id = self.id.filter(|id| !id.is_empty())?;
        let sent_at = Utc.timestamp_millis_opt(self.timestamp?).single()?;
        let author_id = self.user_id.unwrap_or_default();
        let is_from_current_identity = current.is_some_and(|c| c.as_str() == author_id);
        Some(ChatMessage {
            id,
            text: self.text.unwrap_or_default(),
            author_name: self
                .user_name
                .unwrap_or_else(|| ANONYMOUS_AUTHOR.to_string()),
            author_avatar_ref: self.user_photo_url.filter(|u| !u.is_empty()),
            author_id,
            sent_at,
            is_from_current_identity,
        })
    }
}
