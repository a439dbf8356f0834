//! 客户端配置

use crate::sdk::writer::WritePolicy;

/// 聊天窗口默认保留的消息条数
pub const DEFAULT_FEED_WINDOW: usize = 50;

/// 本地缓存数据库默认 URL
pub const DEFAULT_CACHE_DB_URL: &str = "sqlite://leafy_cache.db?mode=rwc";

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// HTTP API 基础地址（文档写入、头像上传）
    pub api_base_url: String,
    /// WebSocket 实时监听地址
    pub ws_url: String,
    /// 压缩方式，例如 "gzip" 或空字符串表示不压缩
    pub compression: String,
    /// 本地缓存使用的 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://leafy_cache.db?mode=rwc`
    pub cache_db_url: String,
    /// 聊天订阅窗口大小（只保留最近 N 条）
    pub feed_window: usize,
    /// 远端写入策略
    pub write_policy: WritePolicy,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ws_url: "ws://localhost:10001".to_string(),
            compression: "gzip".to_string(),
            cache_db_url: DEFAULT_CACHE_DB_URL.to_string(),
            feed_window: DEFAULT_FEED_WINDOW,
            write_policy: WritePolicy::best_effort(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://localhost:10002")
    }
}
