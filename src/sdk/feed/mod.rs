//! 聊天模块

pub mod models;
pub mod service;

pub use models::{ChatMessage, MessageDocument, ANONYMOUS_AUTHOR};
pub use service::{normalize_window, FeedSyncEngine};
