//! 会话控制器与核心事件循环
//!
//! 所有输入（身份变化、资料快照、聊天快照、用户操作）进入同一个无界队列，由单个任务逐个处理，
//! 处理函数之间不会并发执行。拆除在处理身份变化时同步完成；订阅在后台建立，句柄带着订阅 ID
//! 回到队列，属于旧会话的句柄和快照一样按 ID 丢弃。

use crate::sdk::auth::{validate_email, AuthProvider, AuthState, AuthUser};
use crate::sdk::cache::ProfileCache;
use crate::sdk::catalog::Catalog;
use crate::sdk::config::ClientConfig;
use crate::sdk::event::{Command, CoreEvent};
use crate::sdk::feed::FeedSyncEngine;
use crate::sdk::ledger::{validate_award, PointsLedger};
use crate::sdk::listener::{EmptyStateListener, StateListener};
use crate::sdk::profile::{ProfileField, ProfileSyncEngine};
use crate::sdk::remote::{RemoteStore, SnapshotSink, SubscriptionId};
use crate::sdk::state::{AppState, Mutation, StateStore};
use crate::sdk::types::{ContentId, Identity};
use crate::sdk::writer::WriteDispatcher;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 同步核心的装配入口
pub struct SyncClient {
    config: ClientConfig,
    catalog: Catalog,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<dyn ProfileCache>,
    auth: Arc<dyn AuthProvider>,
    listener: Arc<dyn StateListener>,
}

impl SyncClient {
    pub fn new(
        config: ClientConfig,
        catalog: Catalog,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn ProfileCache>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            config,
            catalog,
            remote,
            cache,
            auth,
            listener: Arc::new(EmptyStateListener),
        }
    }

    /// 设置状态监听器
    pub fn set_state_listener(&mut self, listener: Arc<dyn StateListener>) {
        self.listener = listener;
    }

    /// 启动事件循环
    ///
    /// 先从本地缓存载入资料并发布，再开始接收认证方的身份变化。
    pub async fn start(self) -> SyncHandle {
        let store = StateStore::new(self.catalog);
        if let Some(cached) = self.cache.load().await {
            info!("[Session] 💾 冷启动载入缓存资料: {}", cached.id);
            store.apply(Mutation::HydrateFromCache(cached));
        }
        let state_rx = store.subscribe();

        let (tx, rx) = mpsc::unbounded_channel();

        // 当前认证状态同步入队，保证它排在任何后续事件之前
        let (initial, auth_rx) = self.auth.auth_states();
        let _ = tx.send(CoreEvent::Auth {
            state: initial,
            ack: None,
        });
        let forwarder = tokio::spawn(forward_auth_states(auth_rx, tx.downgrade()));

        let writer = WriteDispatcher::new(self.config.write_policy);
        let controller = SessionController {
            last_notified: store.current(),
            store,
            cache: self.cache.clone(),
            auth: self.auth.clone(),
            profile: ProfileSyncEngine::new(self.remote.clone(), self.cache.clone(), writer.clone()),
            feed: FeedSyncEngine::new(self.remote.clone(), writer.clone(), self.config.feed_window),
            ledger: PointsLedger::new(self.remote.clone(), writer),
            listener: self.listener,
            events: tx.downgrade(),
            current: None,
            next_sub: 0,
            pending_setups: 0,
            waiting_barriers: Vec::new(),
            forwarder,
        };
        tokio::spawn(controller.run(rx));

        SyncHandle {
            tx,
            state: state_rx,
            auth: self.auth,
        }
    }
}

/// 逐个转发认证状态；A→未登录→A 这样的往返不会被合并
async fn forward_auth_states(mut rx: UnboundedReceiver<AuthState>, events: WeakUnboundedSender<CoreEvent>) {
    while let Some(state) = rx.recv().await {
        let Some(tx) = events.upgrade() else {
            break;
        };
        if tx.send(CoreEvent::Auth { state, ack: None }).is_err() {
            break;
        }
    }
    debug!("[Session] 认证状态转发结束");
}

/// 对外句柄，可以克隆后分发给各个调用方
#[derive(Clone)]
pub struct SyncHandle {
    tx: UnboundedSender<CoreEvent>,
    state: watch::Receiver<Arc<AppState>>,
    auth: Arc<dyn AuthProvider>,
}

impl SyncHandle {
    /// 当前状态快照
    pub fn state(&self) -> Arc<AppState> {
        self.state.borrow().clone()
    }

    /// 订阅状态快照变化
    pub fn subscribe_state(&self) -> watch::Receiver<Arc<AppState>> {
        self.state.clone()
    }

    /// 直接注入一次身份变化，处理完成后返回；`None` 表示已确认未登录
    pub async fn auth_changed(&self, user: Option<AuthUser>) -> Result<()> {
        self.auth_state_changed(AuthState::from(user)).await
    }

    pub async fn auth_state_changed(&self, state: AuthState) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(CoreEvent::Auth { state, ack: Some(ack) })?;
        done.await.map_err(|_| stopped())
    }

    pub async fn update_name(&self, name: &str) -> Result<()> {
        self.command(Command::UpdateField(ProfileField::Name, name.to_string()))
            .await
    }

    pub async fn update_bio(&self, bio: &str) -> Result<()> {
        self.command(Command::UpdateField(ProfileField::Bio, bio.to_string()))
            .await
    }

    pub async fn toggle_completion(&self, id: impl Into<ContentId>) -> Result<()> {
        self.command(Command::ToggleCompletion(id.into())).await
    }

    /// 发放积分，数额必须为正
    pub async fn award_points(&self, amount: i64) -> Result<()> {
        let amount = validate_award(amount)?;
        self.command(Command::AwardPoints(amount)).await
    }

    /// 上传头像；引用写入确认后才会出现在状态中
    pub async fn upload_avatar(&self, bytes: Vec<u8>) -> Result<()> {
        self.command(Command::UploadAvatar(bytes)).await
    }

    /// 发送聊天消息；空白文本或未登录时不做任何事
    pub async fn send_message(&self, text: &str) -> Result<()> {
        self.command(Command::SendMessage(text.to_string())).await
    }

    /// 邮箱注册成功后创建资料文档
    pub async fn create_profile(&self, name: &str) -> Result<()> {
        self.command(Command::CreateProfile(name.to_string())).await
    }

    /// 通过认证方登出，拆除由随后的身份变化触发
    pub async fn sign_out(&self) -> Result<()> {
        self.auth.sign_out().await
    }

    pub async fn send_password_reset(&self, email: &str) -> Result<()> {
        let email = validate_email(email)?;
        self.auth.send_password_reset(&email).await
    }

    /// 等待此前入队的事件全部处理完毕，并等到在建的订阅都有了结果
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(CoreEvent::Barrier(ack))?;
        done.await.map_err(|_| stopped())
    }

    /// 关闭所有订阅并停止事件循环；本地缓存保留
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(CoreEvent::Shutdown(ack))?;
        done.await.map_err(|_| stopped())
    }

    async fn command(&self, cmd: Command) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(CoreEvent::Command { cmd, ack })?;
        done.await.map_err(|_| stopped())?
    }

    fn send(&self, event: CoreEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| stopped())
    }
}

fn stopped() -> anyhow::Error {
    anyhow!("同步核心已停止")
}

/// 会话控制器：事件循环内的唯一状态持有者
struct SessionController {
    store: StateStore,
    cache: Arc<dyn ProfileCache>,
    auth: Arc<dyn AuthProvider>,
    profile: ProfileSyncEngine,
    feed: FeedSyncEngine,
    ledger: PointsLedger,
    listener: Arc<dyn StateListener>,
    events: WeakUnboundedSender<CoreEvent>,
    current: Option<Identity>,
    next_sub: u64,
    /// 已发起但句柄尚未回到队列的订阅数
    pending_setups: usize,
    waiting_barriers: Vec<oneshot::Sender<()>>,
    last_notified: Arc<AppState>,
    forwarder: JoinHandle<()>,
}

impl SessionController {
    async fn run(mut self, mut rx: UnboundedReceiver<CoreEvent>) {
        info!("[Session] 🚀 核心事件循环启动");
        while let Some(event) = rx.recv().await {
            debug!("[Session] 处理事件: {}", event.name());
            match event {
                CoreEvent::Auth { state, ack } => {
                    self.on_auth(state).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                CoreEvent::ProfileSnapshot { sub, result } => {
                    self.profile.on_snapshot(&self.store, sub, result).await;
                }
                CoreEvent::FeedSnapshot { sub, result } => {
                    self.feed.on_snapshot(&self.store, sub, result);
                }
                CoreEvent::ProfileAttached { sub, result } => {
                    self.profile.on_attached(sub, result);
                    self.setup_finished();
                }
                CoreEvent::FeedAttached { sub, result } => {
                    self.feed.on_attached(sub, result);
                    self.setup_finished();
                }
                CoreEvent::AvatarStored { identity, url } => {
                    self.profile.on_avatar_stored(&self.store, &identity, url).await;
                }
                CoreEvent::Command { cmd, ack } => {
                    let result = self.on_command(cmd).await;
                    let _ = ack.send(result);
                }
                CoreEvent::Barrier(ack) => {
                    if self.pending_setups == 0 {
                        let _ = ack.send(());
                    } else {
                        self.waiting_barriers.push(ack);
                    }
                }
                CoreEvent::Shutdown(ack) => {
                    self.profile.unsubscribe();
                    self.feed.unsubscribe();
                    self.forwarder.abort();
                    self.release_barriers();
                    info!("[Session] 👋 核心事件循环停止");
                    let _ = ack.send(());
                    return;
                }
            }
            self.notify_listener().await;
        }
        self.forwarder.abort();
        info!("[Session] 事件队列已关闭，核心事件循环停止");
    }

    fn setup_finished(&mut self) {
        self.pending_setups = self.pending_setups.saturating_sub(1);
        if self.pending_setups == 0 {
            self.release_barriers();
        }
    }

    fn release_barriers(&mut self) {
        for ack in self.waiting_barriers.drain(..) {
            let _ = ack.send(());
        }
    }

    async fn on_auth(&mut self, state: AuthState) {
        match state {
            AuthState::Restoring => {
                // 认证方还没给出结论，冷启动缓存继续展示
                debug!("[Session] 认证方正在恢复会话");
            }
            AuthState::SignedOut => {
                if let Some(prev) = self.current.clone() {
                    info!("[Session] 🔄 已登出，拆除会话: {}", prev);
                    self.teardown().await;
                } else if self.store.current().profile.is_some() {
                    info!("[Session] 🧹 确认未登录，丢弃冷启动缓存资料");
                    self.cache.clear().await;
                    self.store.apply(Mutation::Reset);
                }
            }
            AuthState::SignedIn(user) => {
                if self.current.as_ref() == Some(&user.identity) {
                    // 同一身份的元数据更新
                    return;
                }
                if let Some(prev) = self.current.clone() {
                    info!("[Session] 🔄 身份变化，拆除旧会话: {}", prev);
                    self.teardown().await;
                }
                self.establish(user).await;
            }
        }
    }

    /// 按顺序：关闭订阅、清空缓存、重置状态
    async fn teardown(&mut self) {
        self.profile.unsubscribe();
        self.feed.unsubscribe();
        self.cache.clear().await;
        self.store.apply(Mutation::Reset);
        self.current = None;
        info!("[Session] 🧹 会话已拆除");
    }

    async fn establish(&mut self, user: AuthUser) {
        let identity = user.identity.clone();
        info!("[Session] 🔐 建立会话: {}", identity);
        self.current = Some(identity.clone());

        let foreign_cache = self
            .store
            .current()
            .profile
            .as_ref()
            .is_some_and(|p| p.id != identity);
        if foreign_cache {
            warn!("[Session] 缓存资料属于其他身份，已丢弃");
            self.cache.clear().await;
        }
        self.store.apply(Mutation::SignedIn(identity));

        let Some(tx) = self.events.upgrade() else {
            warn!("[Session] 所有句柄已释放，跳过订阅");
            return;
        };
        let profile_sink = SnapshotSink::new(self.allocate_sub(), tx.clone(), CoreEvent::profile_snapshot);
        self.profile.subscribe(user.clone(), profile_sink, tx.clone());
        if user.is_new_account {
            self.profile.ensure_social_profile(&user);
        }
        let feed_sink = SnapshotSink::new(self.allocate_sub(), tx.clone(), CoreEvent::feed_snapshot);
        self.feed.subscribe(feed_sink, tx);
        self.pending_setups += 2;
    }

    fn allocate_sub(&mut self) -> SubscriptionId {
        self.next_sub += 1;
        SubscriptionId(self.next_sub)
    }

    async fn on_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::UpdateField(field, value) => {
                self.profile
                    .update_field(&self.store, field, value.clone())
                    .await?;
                if field == ProfileField::Name && self.current.is_some() {
                    self.propagate_display_name(value.trim().to_string());
                }
            }
            Command::ToggleCompletion(id) => {
                self.profile.toggle_completion(&self.store, id).await;
            }
            Command::AwardPoints(amount) => {
                self.ledger.award(&self.profile, &self.store, amount).await;
            }
            Command::UploadAvatar(bytes) => {
                if let Some(tx) = self.events.upgrade() {
                    self.profile.upload_avatar(bytes, tx);
                }
            }
            Command::SendMessage(text) => {
                self.feed.send(&self.store, &text);
            }
            Command::CreateProfile(name) => {
                self.profile.create_profile(&self.store, &name).await?;
            }
        }
        Ok(())
    }

    fn propagate_display_name(&self, name: String) {
        let auth = self.auth.clone();
        tokio::spawn(async move {
            if let Err(e) = auth.update_display_name(&name).await {
                warn!("[Session] 同步认证方显示名失败: {:#}", e);
            }
        });
    }

    /// 按变化的部分回调监听器
    async fn notify_listener(&mut self) {
        let next = self.store.current();
        let prev = std::mem::replace(&mut self.last_notified, next.clone());
        if Arc::ptr_eq(&prev, &next) {
            return;
        }
        if prev.profile != next.profile {
            match serde_json::to_string(&next.profile) {
                Ok(json) => self.listener.on_profile_changed(json).await,
                Err(e) => error!("[Session] 序列化资料失败: {}", e),
            }
        }
        if prev.chat_messages != next.chat_messages {
            match serde_json::to_string(&next.chat_messages) {
                Ok(json) => self.listener.on_chat_messages_changed(json).await,
                Err(e) => error!("[Session] 序列化聊天消息失败: {}", e),
            }
        }
        if prev.admitted != next.admitted {
            self.listener.on_admitted_changed(next.admitted).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::auth::{ManualAuthProvider, ValidationError};
    use crate::sdk::cache::MemoryProfileCache;
    use crate::sdk::feed::MessageDocument;
    use crate::sdk::gating::Screen;
    use crate::sdk::profile::{ProfileDocument, ProfilePatch, UserProfile};
    use crate::sdk::remote::{FeedSink, ListenerHandle, MemoryRemoteStore, ProfileSink, WriteRecord};
    use async_trait::async_trait;
    use std::sync::{Mutex, Once};
    use std::time::Duration;

    static INIT: Once = Once::new();

    fn init_logging() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter("debug")
                .with_test_writer()
                .try_init();
        });
    }

    struct Harness {
        handle: SyncHandle,
        remote: MemoryRemoteStore,
        cache: Arc<MemoryProfileCache>,
        auth: Arc<ManualAuthProvider>,
    }

    async fn start_with(remote: MemoryRemoteStore, cache: Arc<MemoryProfileCache>) -> Harness {
        init_logging();
        let auth = Arc::new(ManualAuthProvider::new());
        let client = SyncClient::new(
            ClientConfig::default(),
            Catalog::builtin(),
            Arc::new(remote.clone()),
            cache.clone(),
            auth.clone(),
        );
        Harness {
            handle: client.start().await,
            remote,
            cache,
            auth,
        }
    }

    async fn start() -> Harness {
        start_with(MemoryRemoteStore::new(), Arc::new(MemoryProfileCache::new())).await
    }

    fn user(id: &str) -> AuthUser {
        AuthUser::new(Identity::new(id))
    }

    fn server_doc(name: &str, points: i64, completed: &[&str]) -> ProfileDocument {
        ProfileDocument {
            name: Some(name.to_string()),
            profile_image_url: None,
            bio: Some(String::new()),
            points: Some(points),
            completed_content: Some(completed.iter().map(|s| s.to_string()).collect()),
        }
    }

    async fn wait_for_writes(remote: &MemoryRemoteStore, n: usize) -> Vec<WriteRecord> {
        tokio::time::timeout(Duration::from_secs(2), remote.wait_for_writes(n))
            .await
            .expect("writes not observed in time")
    }

    async fn wait_state(handle: &SyncHandle, pred: impl FnMut(&Arc<AppState>) -> bool) -> Arc<AppState> {
        let mut rx = handle.subscribe_state();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
        state.clone()
    }

    #[tokio::test]
    async fn server_snapshot_overrides_cached_points_and_updates_cache() -> Result<()> {
        let cache = Arc::new(MemoryProfileCache::new());
        let mut cached = UserProfile::blank(Identity::new("u1"), "Ana");
        cached.points = 40;
        cache.save(&cached).await;

        let remote = MemoryRemoteStore::new();
        remote.server_put_profile(&Identity::new("u1"), server_doc("Ana", 55, &[]));

        let h = start_with(remote, cache).await;
        assert_eq!(h.handle.state().points(), 40);
        assert_eq!(h.handle.state().screen(), Screen::Visitor);

        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;

        assert_eq!(h.handle.state().points(), 55);
        assert_eq!(h.cache.load().await.map(|p| p.points), Some(55));
        Ok(())
    }

    #[tokio::test]
    async fn sign_out_clears_state_cache_and_listeners() -> Result<()> {
        let h = start().await;
        let id = Identity::new("u1");
        h.remote.server_put_profile(&id, server_doc("Ana", 5, &["mission-and-values"]));
        h.remote.server_add_message(MessageDocument {
            text: Some("hello".into()),
            user_id: Some("u2".into()),
            timestamp: Some(1),
            ..Default::default()
        });

        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;
        let state = h.handle.state();
        assert_eq!(state.chat_messages.len(), 1);
        assert!(state.profile.is_some());
        assert_eq!(h.remote.active_listeners(), 2);

        h.handle.auth_changed(None).await?;
        let state = h.handle.state();
        assert!(state.profile.is_none());
        assert!(state.completion_set().is_empty());
        assert!(state.chat_messages.is_empty());
        assert_eq!(state.display_name(), crate::sdk::state::VISITOR_NAME);
        assert!(h.cache.load().await.is_none());
        assert_eq!(h.remote.active_listeners(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn blank_messages_are_not_sent() -> Result<()> {
        let h = start().await;
        h.remote.server_put_profile(&Identity::new("u1"), server_doc("Ana", 0, &[]));
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;
        let before = h.handle.state().chat_messages.len();

        h.handle.send_message("").await?;
        h.handle.send_message("   ").await?;
        h.handle.flush().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.handle.state().chat_messages.len(), before);
        assert!(h.remote.writes().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn sent_message_appears_only_through_the_subscription() -> Result<()> {
        let h = start().await;
        h.remote.server_put_profile(&Identity::new("u1"), server_doc("Ana", 0, &[]));
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;

        h.handle.send_message(" hi there ").await?;
        let writes = wait_for_writes(&h.remote, 1).await;
        match &writes[0] {
            WriteRecord::AddMessage(doc) => {
                assert_eq!(doc.text.as_deref(), Some("hi there"));
                assert_eq!(doc.user_name.as_deref(), Some("Ana"));
            }
            other => panic!("unexpected write: {:?}", other),
        }
        let state = wait_state(&h.handle, |s| !s.chat_messages.is_empty()).await;
        assert!(state.chat_messages[0].is_from_current_identity);
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_toggles_converge_to_server_set() -> Result<()> {
        let h = start().await;
        let id = Identity::new("u1");
        h.remote.server_put_profile(&id, server_doc("Ana", 0, &[]));
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;

        h.handle.toggle_completion("A").await?;
        h.handle.toggle_completion("A").await?;
        wait_for_writes(&h.remote, 2).await;
        h.remote.server_put_profile(&id, server_doc("Ana", 0, &["A"]));
        h.handle.flush().await?;

        let expected: std::collections::BTreeSet<ContentId> = [ContentId::from("A")].into_iter().collect();
        assert_eq!(h.handle.state().completion_set(), expected);
        Ok(())
    }

    #[tokio::test]
    async fn failed_writes_keep_optimistic_toggles() -> Result<()> {
        let h = start().await;
        h.remote.server_put_profile(&Identity::new("u1"), server_doc("Ana", 0, &[]));
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;
        h.remote.set_fail_writes(true);

        for n in 1..=5 {
            h.handle.toggle_completion("quiz-1").await?;
            assert_eq!(
                h.handle.state().is_completed(&ContentId::from("quiz-1")),
                n % 2 == 1,
                "after {} toggles",
                n
            );
        }
        let writes = wait_for_writes(&h.remote, 5).await;
        assert!(writes
            .iter()
            .all(|w| matches!(w, WriteRecord::UpdateProfile(_, p) if p.completed_content.is_some())));
        assert!(h.handle.state().is_completed(&ContentId::from("quiz-1")));
        Ok(())
    }

    #[tokio::test]
    async fn main_app_latch_survives_untoggling() -> Result<()> {
        let h = start().await;
        h.remote.server_put_profile(&Identity::new("u1"), server_doc("Ana", 0, &[]));
        h.remote.set_fail_writes(true);
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;
        assert_eq!(h.handle.state().screen(), Screen::Onboarding);

        h.handle.toggle_completion("mission-and-values").await?;
        assert!(!h.handle.state().admitted);
        h.handle.toggle_completion("sustainable-market").await?;
        assert!(h.handle.state().admitted);
        assert_eq!(h.handle.state().screen(), Screen::MainApp);

        h.handle.toggle_completion("sustainable-market").await?;
        assert!(!h.handle.state().admitted);
        assert_eq!(h.handle.state().screen(), Screen::MainApp);
        Ok(())
    }

    #[tokio::test]
    async fn points_award_is_optimistic_and_keyed_off_previous_value() -> Result<()> {
        let h = start().await;
        let id = Identity::new("u1");
        h.remote.server_put_profile(&id, server_doc("Ana", 10, &[]));
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;

        h.handle.award_points(5).await?;
        assert_eq!(h.handle.state().points(), 15);
        let writes = wait_for_writes(&h.remote, 1).await;
        assert_eq!(
            writes[0],
            WriteRecord::IncrementPoints {
                identity: id.clone(),
                previous: 10,
                amount: 5
            }
        );

        let err = h.handle.award_points(0).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::NonPositiveAward)
        );
        h.handle.flush().await?;
        assert_eq!(h.remote.profile(&id).and_then(|d| d.points), Some(15));
        Ok(())
    }

    #[tokio::test]
    async fn missing_profile_document_is_recovered_once_with_merge() -> Result<()> {
        let h = start().await;
        let mut bea = user("u1");
        bea.display_name = Some("Bea".into());
        h.handle.auth_changed(Some(bea)).await?;

        let writes = wait_for_writes(&h.remote, 1).await;
        match &writes[0] {
            WriteRecord::MergeProfile(id, doc) => {
                assert_eq!(id.as_str(), "u1");
                assert_eq!(doc.name.as_deref(), Some("Bea"));
            }
            other => panic!("unexpected write: {:?}", other),
        }
        let state = wait_state(&h.handle, |s| s.profile.is_some()).await;
        assert_eq!(state.display_name(), "Bea");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.remote.writes().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn recovery_merge_never_overwrites_existing_fields() -> Result<()> {
        let remote = MemoryRemoteStore::new();
        let id = Identity::new("u1");
        let h = start_with(remote.clone(), Arc::new(MemoryProfileCache::new())).await;
        let mut social = user("u1");
        social.is_new_account = true;
        social.display_name = Some("Bea".into());
        // 另一台设备抢先写入了部分字段
        remote.server_put_profile(
            &id,
            ProfileDocument {
                points: Some(30),
                ..Default::default()
            },
        );
        h.handle.auth_changed(Some(social)).await?;
        wait_for_writes(&remote, 1).await;
        h.handle.flush().await?;

        let doc = remote.profile(&id).expect("profile document");
        assert_eq!(doc.points, Some(30));
        assert_eq!(doc.name.as_deref(), Some("Bea"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(remote.writes().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn create_profile_writes_full_document() -> Result<()> {
        let h = start().await;
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;
        h.handle.create_profile("  Cai ").await?;

        // 文档缺失时的补建合并与注册写入都会发出，最终以完整文档为准
        let writes = wait_for_writes(&h.remote, 2).await;
        h.handle.flush().await?;
        assert_eq!(h.handle.state().display_name(), "Cai");
        let set = writes
            .iter()
            .find_map(|w| match w {
                WriteRecord::SetProfile(_, doc) => Some(doc.clone()),
                _ => None,
            })
            .expect("set_profile issued");
        assert_eq!(set, ProfileDocument::initial("Cai", None));

        let err = h.handle.create_profile(" ").await.unwrap_err();
        assert_eq!(err.downcast_ref::<ValidationError>(), Some(&ValidationError::EmptyName));
        Ok(())
    }

    #[tokio::test]
    async fn name_update_is_optimistic_and_reaches_auth_provider() -> Result<()> {
        let h = start().await;
        h.remote.server_put_profile(&Identity::new("u1"), server_doc("Ana", 0, &[]));
        h.auth.sign_in(user("u1"));
        wait_state(&h.handle, |s| s.profile.is_some()).await;

        h.handle.update_name("Dora").await?;
        assert_eq!(h.handle.state().display_name(), "Dora");
        assert_eq!(h.cache.load().await.map(|p| p.name), Some("Dora".to_string()));
        let writes = wait_for_writes(&h.remote, 1).await;
        assert_eq!(
            writes[0],
            WriteRecord::UpdateProfile(Identity::new("u1"), ProfilePatch::name("Dora"))
        );
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.auth.current().and_then(|u| u.display_name).as_deref() != Some("Dora") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("display name propagated");

        assert!(h.handle.update_name("   ").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn avatar_reference_is_set_only_after_confirmation() -> Result<()> {
        let h = start().await;
        let id = Identity::new("u1");
        h.remote.server_put_profile(&id, server_doc("Ana", 0, &[]));
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;

        h.handle.upload_avatar(vec![1, 2, 3]).await?;
        let state = wait_state(&h.handle, |s| {
            s.profile.as_ref().is_some_and(|p| p.avatar_ref.is_some())
        })
        .await;
        assert_eq!(
            state.profile.as_ref().and_then(|p| p.avatar_ref.as_deref()),
            Some("memory://profileImages/u1.jpg")
        );
        assert_eq!(h.remote.blob("profileImages/u1.jpg"), Some(vec![1, 2, 3]));
        Ok(())
    }

    #[tokio::test]
    async fn failed_avatar_upload_sets_nothing() -> Result<()> {
        let h = start().await;
        h.remote.server_put_profile(&Identity::new("u1"), server_doc("Ana", 0, &[]));
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;
        h.remote.set_fail_writes(true);

        h.handle.upload_avatar(vec![9]).await?;
        wait_for_writes(&h.remote, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.handle.flush().await?;
        assert!(h.handle.state().profile.as_ref().is_some_and(|p| p.avatar_ref.is_none()));
        assert_eq!(h.remote.writes().len(), 1);
        Ok(())
    }

    /// 扣住旧身份的资料投递端，模拟在途快照晚于重新订阅到达；
    /// 设置了 `gate` 时资料订阅要等到放行才建立
    struct HoldingRemote {
        inner: MemoryRemoteStore,
        held: Mutex<Vec<(Identity, ProfileSink)>>,
        gate: Option<tokio::sync::Semaphore>,
    }

    impl HoldingRemote {
        fn new(inner: MemoryRemoteStore) -> Self {
            Self {
                inner,
                held: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn gated(inner: MemoryRemoteStore) -> Self {
            Self {
                gate: Some(tokio::sync::Semaphore::new(0)),
                ..Self::new(inner)
            }
        }
    }

    async fn start_holding(remote: Arc<HoldingRemote>, cache: Arc<MemoryProfileCache>) -> SyncHandle {
        init_logging();
        SyncClient::new(
            ClientConfig::default(),
            Catalog::builtin(),
            remote,
            cache,
            Arc::new(ManualAuthProvider::new()),
        )
        .start()
        .await
    }

    #[async_trait]
    impl RemoteStore for HoldingRemote {
        async fn listen_profile(&self, identity: &Identity, sink: ProfileSink) -> Result<ListenerHandle> {
            let _permit = match &self.gate {
                Some(gate) => Some(gate.acquire().await?),
                None => None,
            };
            self.held
                .lock()
                .unwrap()
                .push((identity.clone(), sink.clone()));
            self.inner.listen_profile(identity, sink).await
        }
        async fn listen_feed(&self, window: usize, sink: FeedSink) -> Result<ListenerHandle> {
            self.inner.listen_feed(window, sink).await
        }
        async fn set_profile(&self, identity: &Identity, doc: &ProfileDocument) -> Result<()> {
            self.inner.set_profile(identity, doc).await
        }
        async fn merge_profile(&self, identity: &Identity, doc: &ProfileDocument) -> Result<()> {
            self.inner.merge_profile(identity, doc).await
        }
        async fn update_profile(&self, identity: &Identity, patch: &ProfilePatch) -> Result<()> {
            self.inner.update_profile(identity, patch).await
        }
        async fn increment_points(&self, identity: &Identity, previous: u64, amount: u64) -> Result<()> {
            self.inner.increment_points(identity, previous, amount).await
        }
        async fn add_message(&self, doc: &MessageDocument) -> Result<()> {
            self.inner.add_message(doc).await
        }
        async fn upload_blob(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
            self.inner.upload_blob(path, bytes, content_type).await
        }
    }

    #[tokio::test]
    async fn stale_snapshot_from_previous_identity_is_discarded() -> Result<()> {
        let inner = MemoryRemoteStore::new();
        inner.server_put_profile(&Identity::new("old"), server_doc("Old", 99, &[]));
        inner.server_put_profile(&Identity::new("new"), server_doc("New", 1, &[]));
        let remote = Arc::new(HoldingRemote::new(inner.clone()));
        let cache = Arc::new(MemoryProfileCache::new());
        let handle = start_holding(remote.clone(), cache.clone()).await;

        handle.auth_changed(Some(user("old"))).await?;
        handle.flush().await?;
        assert_eq!(handle.state().display_name(), "Old");

        handle.auth_changed(Some(user("new"))).await?;
        // 旧订阅的快照在重新订阅之后才到达
        let (old_id, old_sink) = remote.held.lock().unwrap()[0].clone();
        assert_eq!(old_id.as_str(), "old");
        old_sink.deliver(Some(server_doc("Old", 99, &[])));
        handle.flush().await?;

        let state = handle.state();
        assert_eq!(state.identity, Some(Identity::new("new")));
        assert_eq!(state.display_name(), "New");
        assert_eq!(state.points(), 1);
        assert_eq!(cache.load().await.map(|p| p.id), Some(Identity::new("new")));
        Ok(())
    }

    #[tokio::test]
    async fn snapshots_after_a_subscription_error_are_ignored() -> Result<()> {
        let inner = MemoryRemoteStore::new();
        inner.server_put_profile(&Identity::new("u1"), server_doc("Ana", 3, &[]));
        let remote = Arc::new(HoldingRemote::new(inner));
        let handle = start_holding(remote.clone(), Arc::new(MemoryProfileCache::new())).await;

        handle.auth_changed(Some(user("u1"))).await?;
        handle.flush().await?;
        assert_eq!(handle.state().display_name(), "Ana");

        let (_, sink) = remote.held.lock().unwrap()[0].clone();
        sink.fail("permission denied");
        handle.flush().await?;
        sink.deliver(Some(server_doc("Mallory", 99, &["A"])));
        handle.flush().await?;

        let state = handle.state();
        assert_eq!(state.display_name(), "Ana");
        assert_eq!(state.points(), 3);
        assert!(state.completion_set().is_empty());
        // 出错后不自动重新订阅
        assert_eq!(remote.held.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn late_subscription_from_previous_identity_is_released() -> Result<()> {
        let inner = MemoryRemoteStore::new();
        inner.server_put_profile(&Identity::new("old"), server_doc("Old", 99, &[]));
        inner.server_put_profile(&Identity::new("new"), server_doc("New", 1, &[]));
        let remote = Arc::new(HoldingRemote::gated(inner.clone()));
        let handle = start_holding(remote.clone(), Arc::new(MemoryProfileCache::new())).await;

        // 两次身份变化都不用等待订阅建立
        handle.auth_changed(Some(user("old"))).await?;
        handle.auth_changed(Some(user("new"))).await?;
        assert_eq!(handle.state().identity, Some(Identity::new("new")));

        if let Some(gate) = &remote.gate {
            gate.add_permits(2);
        }
        handle.flush().await?;

        let state = handle.state();
        assert_eq!(state.display_name(), "New");
        assert_eq!(state.points(), 1);
        // 只剩新身份的资料订阅和聊天订阅
        assert_eq!(inner.active_listeners(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn toggles_before_the_profile_document_exists_are_kept_and_pushed() -> Result<()> {
        let h = start().await;
        h.remote.set_fail_writes(true);
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;
        assert!(h.handle.state().profile.is_none());

        h.handle.toggle_completion("mission-and-values").await?;
        h.handle.toggle_completion("sustainable-market").await?;
        let state = h.handle.state();
        assert!(state.is_completed(&ContentId::from("mission-and-values")));
        assert!(state.is_completed(&ContentId::from("sustainable-market")));
        assert!(state.admitted);
        assert_eq!(state.screen(), Screen::MainApp);

        // 补建合并加两次完成集合写入
        let writes = wait_for_writes(&h.remote, 3).await;
        assert!(writes.iter().any(|w| matches!(
            w,
            WriteRecord::UpdateProfile(_, p) if p.completed_content.as_ref().is_some_and(|c| c.len() == 2)
        )));
        Ok(())
    }

    #[tokio::test]
    async fn confirmed_sign_out_drops_the_cold_start_profile() -> Result<()> {
        let cache = Arc::new(MemoryProfileCache::new());
        cache.save(&UserProfile::blank(Identity::new("u1"), "Ana")).await;
        let h = start_with(MemoryRemoteStore::new(), cache).await;

        // 认证方仍在恢复会话时缓存照常展示
        h.handle.flush().await?;
        assert_eq!(h.handle.state().display_name(), "Ana");

        h.handle.auth_changed(None).await?;
        let state = h.handle.state();
        assert!(state.profile.is_none());
        assert_eq!(state.display_name(), crate::sdk::state::VISITOR_NAME);
        assert!(h.cache.load().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn sign_out_and_back_in_is_not_coalesced() -> Result<()> {
        init_logging();
        let inner = MemoryRemoteStore::new();
        inner.server_put_profile(&Identity::new("u1"), server_doc("Ana", 0, &[]));
        let remote = Arc::new(HoldingRemote::new(inner.clone()));
        let auth = Arc::new(ManualAuthProvider::new());
        let handle = SyncClient::new(
            ClientConfig::default(),
            Catalog::builtin(),
            remote.clone(),
            Arc::new(MemoryProfileCache::new()),
            auth.clone(),
        )
        .start()
        .await;

        auth.sign_in(user("u1"));
        wait_state(&handle, |s| s.profile.is_some()).await;

        // 连续两次变化，中间不等待
        auth.sign_out().await?;
        auth.sign_in(user("u1"));
        tokio::time::timeout(Duration::from_secs(2), async {
            while remote.held.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("profile subscription reopened after sign-out");
        handle.flush().await?;

        assert_eq!(handle.state().display_name(), "Ana");
        assert_eq!(inner.active_listeners(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn cached_profile_of_another_identity_is_discarded_on_sign_in() -> Result<()> {
        let cache = Arc::new(MemoryProfileCache::new());
        cache.save(&UserProfile::blank(Identity::new("someone-else"), "Eve")).await;
        let h = start_with(MemoryRemoteStore::new(), cache).await;
        assert_eq!(h.handle.state().display_name(), "Eve");

        h.handle.auth_changed(Some(user("u1"))).await?;
        let state = h.handle.state();
        assert!(state.profile.as_ref().map_or(true, |p| p.id.as_str() == "u1"));
        assert!(h.cache.load().await.map_or(true, |p| p.id.as_str() == "u1"));
        Ok(())
    }

    #[derive(Default)]
    struct RecordingListener {
        admitted: Mutex<Vec<bool>>,
        profiles: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StateListener for RecordingListener {
        async fn on_profile_changed(&self, profile_json: String) {
            self.profiles.lock().unwrap().push(profile_json);
        }
        async fn on_chat_messages_changed(&self, _messages_json: String) {}
        async fn on_admitted_changed(&self, admitted: bool) {
            self.admitted.lock().unwrap().push(admitted);
        }
    }

    #[tokio::test]
    async fn listener_receives_profile_and_admission_changes() -> Result<()> {
        init_logging();
        let remote = MemoryRemoteStore::new();
        remote.server_put_profile(
            &Identity::new("u1"),
            server_doc("Ana", 0, &["mission-and-values", "sustainable-market"]),
        );
        let recorder = Arc::new(RecordingListener::default());
        let mut client = SyncClient::new(
            ClientConfig::default(),
            Catalog::builtin(),
            Arc::new(remote),
            Arc::new(MemoryProfileCache::new()),
            Arc::new(ManualAuthProvider::new()),
        );
        client.set_state_listener(recorder.clone());
        let handle = client.start().await;

        handle.auth_changed(Some(user("u1"))).await?;
        handle.flush().await?;
        handle.auth_changed(None).await?;
        handle.flush().await?;

        assert_eq!(*recorder.admitted.lock().unwrap(), vec![true, false]);
        let profiles = recorder.profiles.lock().unwrap();
        assert!(profiles.first().is_some_and(|j| j.contains("\"name\":\"Ana\"")));
        assert_eq!(profiles.last().map(String::as_str), Some("null"));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_closes_subscriptions_and_rejects_further_calls() -> Result<()> {
        let h = start().await;
        h.remote.server_put_profile(&Identity::new("u1"), server_doc("Ana", 0, &[]));
        h.handle.auth_changed(Some(user("u1"))).await?;
        h.handle.flush().await?;
        assert_eq!(h.remote.active_listeners(), 2);
        h.handle.shutdown().await?;
        assert_eq!(h.remote.active_listeners(), 0);
        assert!(h.handle.send_message("late").await.is_err());
        // 缓存跨进程保留
        assert!(h.cache.load().await.is_some());
        Ok(())
    }
}
