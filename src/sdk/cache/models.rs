//! 本地缓存记录定义

use crate::sdk::profile::models::UserProfile;
use crate::sdk::types::{ContentId, Identity};
use serde::{Deserialize, Serialize};

/// 缓存中的资料快照
///
/// 完成集合以原始字符串列表保存，不依赖内存中的富类型表示。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProfile {
    pub id: String,
    pub name: String,
    #[serde(rename = "profileImageURL", default)]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub points: u64,
    #[serde(rename = "completedContent", default)]
    pub completed_content: Vec<String>,
}

impl From<&UserProfile> for CachedProfile {
    fn from(p: &UserProfile) -> Self {
        Self {
            id: p.id.as_str().to_string(),
            name: p.name.clone(),
            profile_image_url: p.avatar_ref.clone(),
            bio: p.bio.clone(),
            points: p.points,
            completed_content: p.completed_as_strings(),
        }
    }
}

impl From<CachedProfile> for UserProfile {
    fn from(c: CachedProfile) -> Self {
        Self {
            id: Identity::new(c.id),
            name: c.name,
            avatar_ref: c.profile_image_url,
            bio: c.bio,
            points: c.points,
            completed: c.completed_content.into_iter().map(ContentId::new).collect(),
        }
    }
}
