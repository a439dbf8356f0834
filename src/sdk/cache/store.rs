//! 本地资料缓存
//!
//! 进程级、跨会话存活，是首次网络往返完成前唯一可用的数据来源。
//! 可以在事件循环之外调用（例如冷启动时），不参与事件循环的串行化。

use crate::sdk::cache::dao::KvCacheDao;
use crate::sdk::cache::models::CachedProfile;
use crate::sdk::db::create_sqlite_pool_with_migration;
use crate::sdk::profile::models::UserProfile;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 固定的、带版本号的缓存键
pub const PROFILE_CACHE_KEY: &str = "profile_cache_v1";

/// 本地资料缓存接口
///
/// 所有操作对调用方来说都是"完成即返回"；任何失败都只记录日志。
/// 反序列化失败视为缓存未命中。
#[async_trait]
pub trait ProfileCache: Send + Sync {
    /// 持久化资料快照，覆盖旧值
    async fn save(&self, profile: &UserProfile);

    /// 读取最近一次保存的快照
    async fn load(&self) -> Option<UserProfile>;

    /// 删除快照
    async fn clear(&self);
}

fn encode(profile: &UserProfile) -> Option<String> {
    match serde_json::to_string(&CachedProfile::from(profile)) {
        Ok(json) => Some(json),
        Err(e) => {
            error!("[Cache] 序列化资料失败: {}", e);
            None
        }
    }
}

fn decode(raw: &str) -> Option<UserProfile> {
    match serde_json::from_str::<CachedProfile>(raw) {
        Ok(cached) => Some(cached.into()),
        Err(e) => {
            warn!("[Cache] 缓存内容无法解析，按未命中处理: {}", e);
            None
        }
    }
}

/// 基于 SQLite 的资料缓存
pub struct SqliteProfileCache {
    dao: KvCacheDao,
    key: String,
}

impl SqliteProfileCache {
    /// 打开（必要时创建）缓存数据库
    pub async fn open(db_url: &str) -> Result<Self> {
        info!("[Cache] 打开本地缓存: {}", db_url);
        let pool = create_sqlite_pool_with_migration(db_url).await?;
        Ok(Self::with_dao(KvCacheDao::new(pool)))
    }

    pub fn with_dao(dao: KvCacheDao) -> Self {
        Self {
            dao,
            key: PROFILE_CACHE_KEY.to_string(),
        }
    }
}

#[async_trait]
impl ProfileCache for SqliteProfileCache {
    async fn save(&self, profile: &UserProfile) {
        let Some(json) = encode(profile) else { return };
        if let Err(e) = self.dao.put(&self.key, &json).await {
            error!("[Cache] 保存资料缓存失败: {:#}", e);
        } else {
            debug!("[Cache] 已缓存资料 id={}, points={}", profile.id, profile.points);
        }
    }

    async fn load(&self) -> Option<UserProfile> {
        match self.dao.get(&self.key).await {
            Ok(Some(raw)) => decode(&raw),
            Ok(None) => None,
            Err(e) => {
                error!("[Cache] 读取资料缓存失败: {:#}", e);
                None
            }
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.dao.delete(&self.key).await {
            error!("[Cache] 清除资料缓存失败: {:#}", e);
        }
    }
}

/// 纯内存缓存（测试或无持久化需求时使用）
#[derive(Default)]
pub struct MemoryProfileCache {
    slot: Mutex<Option<String>>,
}

impl MemoryProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入原始内容（可用于模拟损坏的缓存）
    pub fn put_raw(&self, raw: impl Into<String>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(raw.into());
        }
    }
}

#[async_trait]
impl ProfileCache for MemoryProfileCache {
    async fn save(&self, profile: &UserProfile) {
        if let Some(json) = encode(profile) {
            self.put_raw(json);
        }
    }

    async fn load(&self) -> Option<UserProfile> {
        let raw = self.slot.lock().ok()?.clone()?;
        decode(&raw)
    }

    async fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}
