//! 个人资料模块

pub mod models;
pub mod service;

pub use models::{ProfileDocument, ProfileField, ProfilePatch, UserProfile, PLACEHOLDER_NAME};
pub use service::ProfileSyncEngine;
