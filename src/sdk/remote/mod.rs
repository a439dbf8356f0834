//! 远端文档存储
//!
//! 定义核心与远端之间的契约：单文档实时监听、有界集合实时监听、字段级写入、
//! 合并写入、积分增量、消息追加和二进制上传。

pub mod api;
pub mod listen;
pub mod memory;

use crate::sdk::event::CoreEvent;
use crate::sdk::feed::models::MessageDocument;
use crate::sdk::profile::models::{ProfileDocument, ProfilePatch};
use crate::sdk::types::Identity;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

pub use api::HttpRemoteStore;
pub use memory::{MemoryRemoteStore, WriteRecord};

/// 订阅实例编号，每次打开订阅都会分配新的编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// 快照投递端：把远端推送打上订阅编号后送入核心事件队列
///
/// 核心会丢弃编号已过期的投递，因此关闭订阅后即使还有在途快照也不会被应用。
pub struct SnapshotSink<T> {
    id: SubscriptionId,
    tx: UnboundedSender<CoreEvent>,
    wrap: fn(SubscriptionId, Result<T, String>) -> CoreEvent,
}

impl<T> Clone for SnapshotSink<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            wrap: self.wrap,
        }
    }
}

impl<T> SnapshotSink<T> {
    pub(crate) fn new(
        id: SubscriptionId,
        tx: UnboundedSender<CoreEvent>,
        wrap: fn(SubscriptionId, Result<T, String>) -> CoreEvent,
    ) -> Self {
        Self { id, tx, wrap }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// 投递一个快照；核心已停止时返回 false
    pub fn deliver(&self, snapshot: T) -> bool {
        self.tx.send((self.wrap)(self.id, Ok(snapshot))).is_ok()
    }

    /// 投递一个订阅错误
    pub fn fail(&self, err: impl fmt::Display) -> bool {
        self.tx.send((self.wrap)(self.id, Err(err.to_string()))).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 单文档快照：`None` 表示文档不存在
pub type ProfileSink = SnapshotSink<Option<ProfileDocument>>;

/// 集合快照：窗口内的全部文档
pub type FeedSink = SnapshotSink<Vec<MessageDocument>>;

/// 监听句柄，释放（dispose / drop）即取消监听
pub struct ListenerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn dispose(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// 一次订阅的建立进度
///
/// 订阅在后台建立，句柄稍后才送回核心；在此之前到达的快照照常处理。
#[derive(Debug, Default)]
pub enum Listening {
    #[default]
    Pending,
    Open(ListenerHandle),
    /// 建立失败或出错后保持关闭，不自动重连
    Closed,
}

impl Listening {
    pub fn is_closed(&self) -> bool {
        matches!(self, Listening::Closed)
    }

    /// 句柄到达；订阅已关闭时返回 false，句柄随即释放
    pub fn attach(&mut self, handle: ListenerHandle) -> bool {
        match self {
            Listening::Pending => {
                *self = Listening::Open(handle);
                true
            }
            _ => false,
        }
    }

    /// 关闭订阅并释放已有的句柄
    pub fn close(&mut self) {
        *self = Listening::Closed;
    }
}

/// 远端文档存储契约
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 监听 `users/{identity}` 文档
    async fn listen_profile(&self, identity: &Identity, sink: ProfileSink) -> Result<ListenerHandle>;

    /// 监听聊天集合，按发送时间升序，只保留最后 `window` 条
    async fn listen_feed(&self, window: usize, sink: FeedSink) -> Result<ListenerHandle>;

    /// 整文档写入（新账号注册）
    async fn set_profile(&self, identity: &Identity, doc: &ProfileDocument) -> Result<()>;

    /// 幂等合并写入：只填充服务端缺失的字段
    async fn merge_profile(&self, identity: &Identity, doc: &ProfileDocument) -> Result<()>;

    /// 字段级更新
    async fn update_profile(&self, identity: &Identity, patch: &ProfilePatch) -> Result<()>;

    /// 积分增量，附带客户端已知的旧值
    async fn increment_points(&self, identity: &Identity, previous: u64, amount: u64) -> Result<()>;

    /// 追加一条聊天消息
    async fn add_message(&self, doc: &MessageDocument) -> Result<()>;

    /// 上传二进制内容，返回可访问的 URL
    async fn upload_blob(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}
