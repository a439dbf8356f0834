pub mod auth;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub(crate) mod event;
pub mod feed;
pub mod gating;
pub mod ledger;
pub mod listener;
pub mod profile;
pub mod remote;
pub mod serialization;
pub mod session;
pub mod state;
pub mod types;
pub mod writer;

// 重新导出会话核心相关类型
pub use session::{SyncClient, SyncHandle};
pub use state::{AppState, Mutation};
