//! 核心事件队列中的事件类型
//!
//! 身份变化、资料快照、聊天快照和用户操作全部进入同一个队列，逐个处理。

use crate::sdk::auth::AuthState;
use crate::sdk::feed::models::MessageDocument;
use crate::sdk::profile::models::{ProfileDocument, ProfileField};
use crate::sdk::remote::{ListenerHandle, SubscriptionId};
use crate::sdk::types::{ContentId, Identity};
use anyhow::Result;
use tokio::sync::oneshot;

/// 用户发起的操作
#[derive(Debug)]
pub(crate) enum Command {
    UpdateField(ProfileField, String),
    ToggleCompletion(ContentId),
    AwardPoints(u64),
    UploadAvatar(Vec<u8>),
    SendMessage(String),
    CreateProfile(String),
}

pub(crate) enum CoreEvent {
    /// 认证协作方报告的状态变化
    Auth {
        state: AuthState,
        ack: Option<oneshot::Sender<()>>,
    },
    /// 后台建立的资料订阅结果
    ProfileAttached {
        sub: SubscriptionId,
        result: Result<ListenerHandle, String>,
    },
    FeedAttached {
        sub: SubscriptionId,
        result: Result<ListenerHandle, String>,
    },
    ProfileSnapshot {
        sub: SubscriptionId,
        result: Result<Option<ProfileDocument>, String>,
    },
    FeedSnapshot {
        sub: SubscriptionId,
        result: Result<Vec<MessageDocument>, String>,
    },
    /// 头像上传及引用写入都已确认
    AvatarStored { identity: Identity, url: String },
    Command {
        cmd: Command,
        ack: oneshot::Sender<Result<()>>,
    },
    /// 队列屏障：之前入队的事件全部处理完后应答
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

impl CoreEvent {
    pub(crate) fn profile_snapshot(
        sub: SubscriptionId,
        result: Result<Option<ProfileDocument>, String>,
    ) -> Self {
        CoreEvent::ProfileSnapshot { sub, result }
    }

    pub(crate) fn feed_snapshot(sub: SubscriptionId, result: Result<Vec<MessageDocument>, String>) -> Self {
        CoreEvent::FeedSnapshot { sub, result }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            CoreEvent::Auth { .. } => "auth",
            CoreEvent::ProfileAttached { .. } => "profile_attached",
            CoreEvent::FeedAttached { .. } => "feed_attached",
            CoreEvent::ProfileSnapshot { .. } => "profile_snapshot",
            CoreEvent::FeedSnapshot { .. } => "feed_snapshot",
            CoreEvent::AvatarStored { .. } => "avatar_stored",
            CoreEvent::Command { .. } => "command",
            CoreEvent::Barrier(_) => "barrier",
            CoreEvent::Shutdown(_) => "shutdown",
        }
    }
}
