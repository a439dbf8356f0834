//! 个人资料同步服务
//!
//! 负责单文档实时订阅和乐观写入：
//! 1. 本地变更先发布、写入缓存，再派发服务端写入（只写变化的字段）
//! 2. 服务端快照到达后整体替换内存资料并写穿缓存
//! 3. 文档缺失时用认证方提供的元数据做一次合并补建

use crate::sdk::auth::{AuthUser, ValidationError};
use crate::sdk::cache::ProfileCache;
use crate::sdk::event::CoreEvent;
use crate::sdk::profile::models::{ProfileDocument, ProfileField, ProfilePatch, UserProfile, SOCIAL_FALLBACK_NAME};
use crate::sdk::remote::{ListenerHandle, Listening, ProfileSink, RemoteStore, SubscriptionId};
use crate::sdk::state::{Mutation, StateStore};
use crate::sdk::types::{ContentId, Identity};
use crate::sdk::writer::{run_with_policy, WriteDispatcher};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// 头像在 blob 存储中的路径
pub fn avatar_blob_path(identity: &Identity) -> String {
    format!("profileImages/{}.jpg", identity)
}

pub const AVATAR_CONTENT_TYPE: &str = "image/jpeg";

/// 补建资料时使用的初始文档
pub fn recovery_document(user: &AuthUser) -> ProfileDocument {
    let name = user
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(SOCIAL_FALLBACK_NAME);
    ProfileDocument::initial(name, user.avatar_ref.clone())
}

struct ActiveProfile {
    user: AuthUser,
    sub: SubscriptionId,
    /// 订阅出错后关闭，身份仍然保留供写入使用
    listening: Listening,
    recovery_attempted: bool,
}

/// 个人资料同步引擎（只在核心事件循环内使用）
pub struct ProfileSyncEngine {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<dyn ProfileCache>,
    writer: WriteDispatcher,
    active: Option<ActiveProfile>,
}

impl ProfileSyncEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, cache: Arc<dyn ProfileCache>, writer: WriteDispatcher) -> Self {
        Self {
            remote,
            cache,
            writer,
            active: None,
        }
    }

    /// 为身份打开订阅；任何旧订阅都会先关闭
    ///
    /// 连接在后台建立，结果以 [`CoreEvent::ProfileAttached`] 送回，事件循环不等待。
    /// 建立失败只记录日志，身份仍被记下，本地操作和写入照常进行。
    pub fn subscribe(&mut self, user: AuthUser, sink: ProfileSink, events: UnboundedSender<CoreEvent>) {
        self.unsubscribe();
        let sub = sink.id();
        let identity = user.identity.clone();
        let remote = self.remote.clone();
        tokio::spawn(async move {
            let result = remote
                .listen_profile(&identity, sink)
                .await
                .map_err(|e| format!("{:#}", e));
            // 核心已停止时句柄随事件一起释放
            let _ = events.send(CoreEvent::ProfileAttached { sub, result });
        });
        self.active = Some(ActiveProfile {
            user,
            sub,
            listening: Listening::Pending,
            recovery_attempted: false,
        });
    }

    /// 后台订阅建立完成；属于旧订阅的句柄直接释放
    pub fn on_attached(&mut self, sub: SubscriptionId, result: Result<ListenerHandle, String>) {
        let Some(active) = self.active.as_mut().filter(|a| a.sub == sub) else {
            debug!("[ProfileSync] 释放过期订阅的句柄 ({})", sub);
            return;
        };
        match result {
            Ok(handle) => {
                if active.listening.attach(handle) {
                    info!("[ProfileSync] 📡 资料订阅已打开: {} ({})", active.user.identity, sub);
                } else {
                    debug!("[ProfileSync] 订阅已关闭，释放迟到的句柄 ({})", sub);
                }
            }
            Err(e) => {
                error!("[ProfileSync] ❌ 资料订阅建立失败: {}", e);
                active.listening.close();
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(active) = self.active.take() {
            info!("[ProfileSync] 🔌 关闭资料订阅: {} ({})", active.user.identity, active.sub);
        }
    }

    pub fn is_current(&self, sub: SubscriptionId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.sub == sub && !a.listening.is_closed())
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.active.as_ref().map(|a| &a.user.identity)
    }

    /// 处理订阅推送
    pub async fn on_snapshot(
        &mut self,
        store: &StateStore,
        sub: SubscriptionId,
        result: Result<Option<ProfileDocument>, String>,
    ) {
        if !self.is_current(sub) {
            debug!("[ProfileSync] 丢弃过期订阅的快照 ({})", sub);
            return;
        }
        match result {
            Ok(Some(doc)) => {
                let Some(identity) = self.identity().cloned() else {
                    return;
                };
                let profile = doc.into_profile(identity);
                debug!("[ProfileSync] 资料快照: points={}, 完成 {} 项", profile.points, profile.completed.len());
                store.apply(Mutation::ApplyServerProfile(profile.clone()));
                self.cache.save(&profile).await;
            }
            Ok(None) => self.recover_missing_document(),
            Err(e) => {
                warn!("[ProfileSync] ❌ 资料订阅出错，订阅保持关闭: {}", e);
                if let Some(active) = self.active.as_mut() {
                    active.listening.close();
                }
            }
        }
    }

    /// 文档缺失：每次会话最多补建一次
    fn recover_missing_document(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.recovery_attempted {
            debug!("[ProfileSync] 资料文档仍缺失，已尝试过补建");
            return;
        }
        active.recovery_attempted = true;
        warn!("[ProfileSync] ⚠️ 资料文档不存在，按合并语义补建: {}", active.user.identity);
        let user = active.user.clone();
        self.dispatch_merge(&user);
    }

    /// 新社交账号：立即补建资料文档
    pub fn ensure_social_profile(&mut self, user: &AuthUser) {
        if let Some(active) = self.active.as_mut() {
            if active.user.identity == user.identity {
                active.recovery_attempted = true;
            }
        }
        info!("[ProfileSync] 🆕 新社交账号，补建资料文档: {}", user.identity);
        self.dispatch_merge(user);
    }

    fn dispatch_merge(&self, user: &AuthUser) {
        let doc = recovery_document(user);
        let identity = user.identity.clone();
        let remote = self.remote.clone();
        self.writer.dispatch("merge_profile", move || {
            let remote = remote.clone();
            let identity = identity.clone();
            let doc = doc.clone();
            async move { remote.merge_profile(&identity, &doc).await }
        });
    }

    /// 邮箱注册后创建完整的初始资料文档
    pub async fn create_profile(&mut self, store: &StateStore, name: &str) -> Result<(), ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let Some(identity) = self.identity().cloned() else {
            warn!("[ProfileSync] 未登录，忽略创建资料");
            return Ok(());
        };
        let current = store.current();
        if current.profile.is_none() {
            let mut profile = UserProfile::blank(identity.clone(), name);
            profile.completed = current.completed.clone();
            store.apply(Mutation::ApplyServerProfile(profile.clone()));
            self.cache.save(&profile).await;
        }
        if let Some(active) = self.active.as_mut() {
            active.recovery_attempted = true;
        }
        let doc = ProfileDocument::initial(name, None);
        let remote = self.remote.clone();
        self.writer.dispatch("set_profile", move || {
            let remote = remote.clone();
            let identity = identity.clone();
            let doc = doc.clone();
            async move { remote.set_profile(&identity, &doc).await }
        });
        Ok(())
    }

    /// 更新名字或简介
    pub async fn update_field(&self, store: &StateStore, field: ProfileField, value: String) -> Result<(), ValidationError> {
        let (mutation, patch) = match field {
            ProfileField::Name => {
                let name = value.trim().to_string();
                if name.is_empty() {
                    return Err(ValidationError::EmptyName);
                }
                (Mutation::SetName(name.clone()), ProfilePatch::name(name))
            }
            ProfileField::Bio => (Mutation::SetBio(value.clone()), ProfilePatch::bio(value)),
        };
        if self.apply_local(store, mutation).await {
            self.dispatch_update("update_profile_field", patch);
        }
        Ok(())
    }

    /// 切换完成状态，并把完整集合推送到服务端
    ///
    /// 只要求已登录；资料尚未到达时集合照样切换，资料就绪后才写入缓存。
    pub async fn toggle_completion(&self, store: &StateStore, id: ContentId) {
        if self.active.is_none() {
            warn!("[ProfileSync] 未登录，忽略 ToggleCompletion");
            return;
        }
        let (_, next) = store.apply(Mutation::ToggleCompletion(id));
        if let Some(profile) = next.profile.as_ref() {
            self.cache.save(profile).await;
        }
        let completed = next.completed.iter().map(|c| c.as_str().to_string()).collect();
        self.dispatch_update("update_completed_content", ProfilePatch::completed(completed));
    }

    /// 上传头像：先上传 blob，再写入引用；两步都成功后通知核心
    pub(crate) fn upload_avatar(&self, bytes: Vec<u8>, events: UnboundedSender<CoreEvent>) {
        let Some(identity) = self.identity().cloned() else {
            warn!("[ProfileSync] 未登录，忽略头像上传");
            return;
        };
        let remote = self.remote.clone();
        let policy = self.writer.policy();
        tokio::spawn(async move {
            let path = avatar_blob_path(&identity);
            let url = match remote.upload_blob(&path, bytes, AVATAR_CONTENT_TYPE).await {
                Ok(url) => url,
                Err(e) => {
                    error!("[ProfileSync] ❌ 头像上传失败: {:#}", e);
                    return;
                }
            };
            let patch = ProfilePatch::avatar(url.clone());
            let stored = run_with_policy(policy, "update_avatar", || {
                let remote = remote.clone();
                let identity = identity.clone();
                let patch = patch.clone();
                async move { remote.update_profile(&identity, &patch).await }
            })
            .await;
            if stored {
                let _ = events.send(CoreEvent::AvatarStored { identity, url });
            }
        });
    }

    /// 头像引用已确认；身份已变化时忽略
    pub async fn on_avatar_stored(&self, store: &StateStore, identity: &Identity, url: String) {
        if self.identity() != Some(identity) {
            debug!("[ProfileSync] 头像确认属于旧会话，忽略");
            return;
        }
        self.apply_local(store, Mutation::SetAvatar(url)).await;
    }

    /// 发布本地变更并写入缓存；没有资料时返回 false
    pub(crate) async fn apply_local(&self, store: &StateStore, mutation: Mutation) -> bool {
        if self.active.is_none() {
            warn!("[ProfileSync] 未登录，忽略 {}", mutation.name());
            return false;
        }
        let (_, next) = store.apply(mutation);
        match next.profile.as_ref() {
            Some(profile) => {
                self.cache.save(profile).await;
                true
            }
            None => {
                warn!("[ProfileSync] 资料尚未就绪，本地变更未生效");
                false
            }
        }
    }

    fn dispatch_update(&self, label: &'static str, patch: ProfilePatch) {
        let Some(identity) = self.identity().cloned() else {
            return;
        };
        let remote = self.remote.clone();
        self.writer.dispatch(label, move || {
            let remote = remote.clone();
            let identity = identity.clone();
            let patch = patch.clone();
            async move { remote.update_profile(&identity, &patch).await }
        });
    }
}
