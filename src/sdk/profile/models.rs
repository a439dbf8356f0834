//! 个人资料模型定义

use crate::sdk::types::{ContentId, Identity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 快照缺少 name 字段时使用的占位名
pub const PLACEHOLDER_NAME: &str = "Default Name";

/// 社交登录没有提供显示名时使用的默认名
pub const SOCIAL_FALLBACK_NAME: &str = "User";

/// 内存中的用户资料（会话期间由 Profile Sync Engine 独占）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Identity,
    pub name: String,
    pub avatar_ref: Option<String>,
    pub bio: Option<String>,
    pub points: u64,
    pub completed: BTreeSet<ContentId>,
}

impl UserProfile {
    /// 新建一个空白资料
    pub fn blank(id: Identity, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            avatar_ref: None,
            bio: Some(String::new()),
            points: 0,
            completed: BTreeSet::new(),
        }
    }

    /// 完成集合的字符串形式（用于服务端写入和本地缓存）
    pub fn completed_as_strings(&self) -> Vec<String> {
        self.completed.iter().map(|c| c.as_str().to_string()).collect()
    }
}

/// 服务端资料文档（字段均可能缺失）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "profileImageURL", default, skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<i64>,
    #[serde(rename = "completedContent", default, skip_serializing_if = "Option::is_none")]
    pub completed_content: Option<Vec<String>>,
}

impl ProfileDocument {
    /// 新账号的初始文档
    pub fn initial(name: impl Into<String>, avatar: Option<String>) -> Self {
        Self {
            name: Some(name.into()),
            profile_image_url: avatar,
            bio: Some(String::new()),
            points: Some(0),
            completed_content: Some(Vec::new()),
        }
    }

    /// 逐字段宽松解析快照
    ///
    /// 类型不符的字段按缺失处理，由 [`ProfileDocument::into_profile`] 补默认值。
    pub fn from_value_lenient(value: &serde_json::Value) -> Self {
        let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let points = value
            .get("points")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));
        let completed_content = value.get("completedContent").and_then(|v| v.as_array()).map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        });
        Self {
            name: text("name"),
            profile_image_url: text("profileImageURL"),
            bio: text("bio"),
            points,
            completed_content,
        }
    }

    /// 转为内存资料，缺失字段使用默认值而不是让整个快照失败
    pub fn into_profile(self, id: Identity) -> UserProfile {
        UserProfile {
            id,
            name: self.name.unwrap_or_else(|| PLACEHOLDER_NAME.to_string()),
            avatar_ref: self.profile_image_url.filter(|u| !u.is_empty()),
            bio: Some(self.bio.unwrap_or_default()),
            points: self.points.unwrap_or(0).max(0) as u64,
            completed: self
                .completed_content
                .unwrap_or_default()
                .into_iter()
                .map(ContentId::new)
                .collect(),
        }
    }

    /// 合并写入：只填充当前缺失的字段，已有字段保持不变
    pub fn merge_missing(&mut self, incoming: &ProfileDocument) {
        if self.name.is_none() {
            self.name = incoming.name.clone();
        }
        if self.profile_image_url.is_none() {
            self.profile_image_url = incoming.profile_image_url.clone();
        }
        if self.bio.is_none() {
            self.bio = incoming.bio.clone();
        }
        if self.points.is_none() {
            self.points = incoming.points;
        }
        if self.completed_content.is_none() {
            self.completed_content = incoming.completed_content.clone();
        }
    }

    /// 应用字段级更新
    pub fn apply_patch(&mut self, patch: &ProfilePatch) {
        if let Some(name) = &patch.name {
            self.name = Some(name.clone());
        }
        if let Some(bio) = &patch.bio {
            self.bio = Some(bio.clone());
        }
        if let Some(url) = &patch.profile_image_url {
            self.profile_image_url = Some(url.clone());
        }
        if let Some(completed) = &patch.completed_content {
            self.completed_content = Some(completed.clone());
        }
    }
}

/// 字段级更新请求（只携带变化的字段）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(rename = "profileImageURL", default, skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
    #[serde(rename = "completedContent", default, skip_serializing_if = "Option::is_none")]
    pub completed_content: Option<Vec<String>>,
}

impl ProfilePatch {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn bio(bio: impl Into<String>) -> Self {
        Self {
            bio: Some(bio.into()),
            ..Default::default()
        }
    }

    pub fn avatar(url: impl Into<String>) -> Self {
        Self {
            profile_image_url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn completed(ids: Vec<String>) -> Self {
        Self {
            completed_content: Some(ids),
            ..Default::default()
        }
    }
}

/// 可编辑的文本字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    Name,
    Bio,
}
