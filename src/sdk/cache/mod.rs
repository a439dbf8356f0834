//! 本地缓存模块
//!
//! 保存最近一次已知的用户资料（含完成集合），进程重启、离线启动后仍可用

pub mod dao;
pub mod models;
pub mod store;

pub use dao::KvCacheDao;
pub use models::CachedProfile;
pub use store::{MemoryProfileCache, ProfileCache, SqliteProfileCache, PROFILE_CACHE_KEY};
