//! 对外发布的应用状态
//!
//! 状态是不可变快照，只能通过 [`reduce`] 处理具名的 [`Mutation`] 产生新快照，
//! 再由 [`StateStore`] 经 `watch` 通道发布。外部只订阅快照，不直接修改字段。

use crate::sdk::catalog::Catalog;
use crate::sdk::feed::models::ChatMessage;
use crate::sdk::gating::{self, Screen};
use crate::sdk::profile::models::UserProfile;
use crate::sdk::types::{ContentId, Identity};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;

/// 未登录时展示的名字
pub const VISITOR_NAME: &str = "Visitor";

/// 某一时刻的完整应用状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    /// 当前登录身份
    pub identity: Option<Identity>,
    pub profile: Option<UserProfile>,
    /// 已完成的内容；只要有身份就可以切换，不依赖资料文档是否就绪
    pub completed: BTreeSet<ContentId>,
    /// 按发送时间升序
    pub chat_messages: Vec<ChatMessage>,
    pub admitted: bool,
    /// 主界面闩锁
    pub main_app_unlocked: bool,
}

impl AppState {
    pub fn display_name(&self) -> &str {
        self.profile
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or(VISITOR_NAME)
    }

    pub fn points(&self) -> u64 {
        self.profile.as_ref().map(|p| p.points).unwrap_or(0)
    }

    pub fn completion_set(&self) -> BTreeSet<ContentId> {
        self.completed.clone()
    }

    pub fn is_completed(&self, id: &ContentId) -> bool {
        self.completed.contains(id)
    }

    pub fn screen(&self) -> Screen {
        Screen::resolve(self.identity.as_ref(), self.main_app_unlocked)
    }
}

/// 具名状态变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// 冷启动时载入本地缓存
    HydrateFromCache(UserProfile),
    /// 身份出现；属于其他身份的资料会被丢弃
    SignedIn(Identity),
    /// 服务端快照整体替换资料
    ApplyServerProfile(UserProfile),
    SetName(String),
    SetBio(String),
    /// 头像引用已被服务端确认
    SetAvatar(String),
    ToggleCompletion(ContentId),
    AddPoints(u64),
    ReplaceFeed(Vec<ChatMessage>),
    /// 恢复访客默认值
    Reset,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::HydrateFromCache(_) => "HydrateFromCache",
            Mutation::SignedIn(_) => "SignedIn",
            Mutation::ApplyServerProfile(_) => "ApplyServerProfile",
            Mutation::SetName(_) => "SetName",
            Mutation::SetBio(_) => "SetBio",
            Mutation::SetAvatar(_) => "SetAvatar",
            Mutation::ToggleCompletion(_) => "ToggleCompletion",
            Mutation::AddPoints(_) => "AddPoints",
            Mutation::ReplaceFeed(_) => "ReplaceFeed",
            Mutation::Reset => "Reset",
        }
    }
}

/// 由旧状态和一次变更计算新状态，门禁和闩锁在此一并重算
pub fn reduce(prev: &AppState, mutation: Mutation, catalog: &Catalog) -> AppState {
    let mut next = prev.clone();
    match mutation {
        Mutation::HydrateFromCache(profile) => {
            let belongs = next.identity.as_ref().map_or(true, |id| *id == profile.id);
            if belongs {
                next.completed = profile.completed.clone();
                next.profile = Some(profile);
            }
        }
        Mutation::SignedIn(identity) => {
            if next.profile.as_ref().is_some_and(|p| p.id != identity) {
                next.profile = None;
                next.completed.clear();
            }
            next.identity = Some(identity);
        }
        Mutation::ApplyServerProfile(profile) => {
            next.completed = profile.completed.clone();
            next.profile = Some(profile);
        }
        Mutation::SetName(name) => {
            if let Some(p) = next.profile.as_mut() {
                p.name = name;
            }
        }
        Mutation::SetBio(bio) => {
            if let Some(p) = next.profile.as_mut() {
                p.bio = Some(bio);
            }
        }
        Mutation::SetAvatar(url) => {
            if let Some(p) = next.profile.as_mut() {
                p.avatar_ref = Some(url);
            }
        }
        Mutation::ToggleCompletion(id) => {
            if next.identity.is_some() {
                if !next.completed.remove(&id) {
                    next.completed.insert(id);
                }
                if let Some(p) = next.profile.as_mut() {
                    p.completed = next.completed.clone();
                }
            }
        }
        Mutation::AddPoints(amount) => {
            if let Some(p) = next.profile.as_mut() {
                p.points = p.points.saturating_add(amount);
            }
        }
        Mutation::ReplaceFeed(messages) => next.chat_messages = messages,
        Mutation::Reset => return AppState::default(),
    }

    next.admitted = gating::admitted(&next.completed, catalog);
    next.main_app_unlocked =
        gating::next_latch(next.main_app_unlocked, next.admitted, next.identity.is_some());
    next
}

/// 状态发布者：持有最新快照，变更后通知所有订阅者
pub struct StateStore {
    tx: watch::Sender<Arc<AppState>>,
    catalog: Catalog,
}

impl StateStore {
    pub fn new(catalog: Catalog) -> Self {
        let (tx, _) = watch::channel(Arc::new(AppState::default()));
        Self { tx, catalog }
    }

    pub fn current(&self) -> Arc<AppState> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AppState>> {
        self.tx.subscribe()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// 应用变更并发布；返回 (旧快照, 新快照)
    pub fn apply(&self, mutation: Mutation) -> (Arc<AppState>, Arc<AppState>) {
        let prev = self.current();
        let next = Arc::new(reduce(&prev, mutation, &self.catalog));
        if *next != *prev {
            self.tx.send_replace(next.clone());
        }
        (prev, next)
    }
}
