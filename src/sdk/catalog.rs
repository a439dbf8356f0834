//! 内容目录（静态、不可变，进程启动时加载，不参与同步）

use crate::sdk::types::ContentId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// 目录条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: ContentId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub is_mandatory: bool,
}

impl ContentItem {
    pub fn new(id: &str, title: &str, category: &str, is_mandatory: bool) -> Self {
        Self {
            id: ContentId::new(id),
            title: title.to_string(),
            category: category.to_string(),
            is_mandatory,
        }
    }
}

/// 不可变目录，克隆只复制指针
#[derive(Debug, Clone)]
pub struct Catalog {
    items: Arc<[ContentItem]>,
    mandatory: Arc<BTreeSet<ContentId>>,
}

impl Catalog {
    pub fn new(items: Vec<ContentItem>) -> Self {
        let mandatory = items
            .iter()
            .filter(|i| i.is_mandatory)
            .map(|i| i.id.clone())
            .collect();
        Self {
            items: items.into(),
            mandatory: Arc::new(mandatory),
        }
    }

    /// 从 JSON 数组文件加载目录
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("读取目录文件失败: {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let items: Vec<ContentItem> = serde_json::from_str(raw).context("解析目录 JSON 失败")?;
        Ok(Self::new(items))
    }

    /// 内置目录：两个必修模块加若干选修内容
    pub fn builtin() -> Self {
        Self::new(vec![
            ContentItem::new("mission-and-values", "Mission and Values", "Module", true),
            ContentItem::new("sustainable-market", "Understanding the Sustainable Market", "Module", true),
            ContentItem::new("urban-gardens", "Urban Gardens and Permaculture", "Course", false),
            ContentItem::new("circular-economy", "Recycling and Circular Economy", "Course", false),
            ContentItem::new("renewable-energy", "Renewable Energies of the Future", "Course", false),
            ContentItem::new("home-composting", "Home Composting Guide", "Ebook", false),
            ContentItem::new("zero-waste-manual", "Complete Zero Waste Manual", "Ebook", false),
            ContentItem::new("healthier-planet", "5 Habits for a Healthier Planet", "Article", false),
            ContentItem::new("vertical-garden", "Building a Vertical Garden", "Video", false),
        ])
    }

    pub fn get(&self, id: &ContentId) -> Option<&ContentItem> {
        self.items.iter().find(|i| &i.id == id)
    }

    /// 必修内容 ID 集合
    pub fn mandatory_ids(&self) -> &BTreeSet<ContentId> {
        &self.mandatory
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
