//! 内存版远端存储
//!
//! 行为与真实服务端一致：写入后向所有活跃监听推送最新快照。
//! 用于离线模式，也作为测试替身（记录每一次写入调用）。

use crate::sdk::feed::models::MessageDocument;
use crate::sdk::profile::models::{ProfileDocument, ProfilePatch};
use crate::sdk::remote::{FeedSink, ListenerHandle, ProfileSink, RemoteStore};
use crate::sdk::types::Identity;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

/// 一次写入调用的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRecord {
    SetProfile(Identity, ProfileDocument),
    MergeProfile(Identity, ProfileDocument),
    UpdateProfile(Identity, ProfilePatch),
    IncrementPoints {
        identity: Identity,
        previous: u64,
        amount: u64,
    },
    AddMessage(MessageDocument),
    UploadBlob {
        path: String,
        len: usize,
    },
}

struct ProfileListener {
    identity: Identity,
    sink: ProfileSink,
    active: Arc<AtomicBool>,
}

struct FeedListener {
    window: usize,
    sink: FeedSink,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    profiles: HashMap<Identity, ProfileDocument>,
    messages: Vec<MessageDocument>,
    blobs: HashMap<String, Vec<u8>>,
    profile_listeners: Vec<ProfileListener>,
    feed_listeners: Vec<FeedListener>,
    writes: Vec<WriteRecord>,
    next_message_id: u64,
}

impl Inner {
    fn feed_window(&self, window: usize) -> Vec<MessageDocument> {
        let mut docs = self.messages.clone();
        docs.sort_by_key(|d| d.timestamp.unwrap_or(i64::MIN));
        let skip = docs.len().saturating_sub(window);
        docs.split_off(skip)
    }

    fn push_profile(&mut self, identity: &Identity) {
        self.profile_listeners
            .retain(|l| l.active.load(Ordering::SeqCst));
        let snapshot = self.profiles.get(identity).cloned();
        for l in self.profile_listeners.iter().filter(|l| &l.identity == identity) {
            l.sink.deliver(snapshot.clone());
        }
    }

    fn push_feed(&mut self) {
        self.feed_listeners.retain(|l| l.active.load(Ordering::SeqCst));
        for l in &self.feed_listeners {
            l.sink.deliver(self.feed_window(l.window));
        }
    }
}

/// 内存版远端存储
#[derive(Clone)]
pub struct MemoryRemoteStore {
    inner: Arc<Mutex<Inner>>,
    fail_writes: Arc<AtomicBool>,
    write_count: Arc<watch::Sender<usize>>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        let (write_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            write_count: Arc::new(write_count),
        }
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // 持锁期间不会 panic，中毒时直接沿用内部数据
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, inner: &mut Inner, record: WriteRecord) -> Result<()> {
        inner.writes.push(record);
        self.write_count.send_replace(inner.writes.len());
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("模拟的网络错误"));
        }
        Ok(())
    }

    /// 让之后的写入全部失败（模拟断网）
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 以"另一台设备"的身份直接写服务端文档，并推送给监听者
    pub fn server_put_profile(&self, identity: &Identity, doc: ProfileDocument) {
        let mut inner = self.lock();
        inner.profiles.insert(identity.clone(), doc);
        inner.push_profile(identity);
    }

    /// 以"另一台设备"的身份追加消息
    pub fn server_add_message(&self, mut doc: MessageDocument) {
        let mut inner = self.lock();
        if doc.id.is_none() {
            inner.next_message_id += 1;
            doc.id = Some(format!("msg-{}", inner.next_message_id));
        }
        inner.messages.push(doc);
        inner.push_feed();
    }

    pub fn profile(&self, identity: &Identity) -> Option<ProfileDocument> {
        self.lock().profiles.get(identity).cloned()
    }

    pub fn messages(&self) -> Vec<MessageDocument> {
        self.lock().messages.clone()
    }

    pub fn blob(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(path).cloned()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// 当前仍处于活跃状态的监听数量（资料 + 聊天）
    pub fn active_listeners(&self) -> usize {
        let inner = self.lock();
        inner
            .profile_listeners
            .iter()
            .map(|l| &l.active)
            .chain(inner.feed_listeners.iter().map(|l| &l.active))
            .filter(|a| a.load(Ordering::SeqCst))
            .count()
    }

    /// 等待写入调用次数达到 `n`，返回全部写入记录
    pub async fn wait_for_writes(&self, n: usize) -> Vec<WriteRecord> {
        let mut rx = self.write_count.subscribe();
        // 发送端由自身持有，不会关闭
        let _ = rx.wait_for(|count| *count >= n).await;
        self.writes()
    }
}

fn handle_for(active: Arc<AtomicBool>) -> ListenerHandle {
    ListenerHandle::new(move || active.store(false, Ordering::SeqCst))
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn listen_profile(&self, identity: &Identity, sink: ProfileSink) -> Result<ListenerHandle> {
        let active = Arc::new(AtomicBool::new(true));
        let mut inner = self.lock();
        // 首个快照立即推送
        sink.deliver(inner.profiles.get(identity).cloned());
        inner.profile_listeners.push(ProfileListener {
            identity: identity.clone(),
            sink,
            active: active.clone(),
        });
        debug!("[MemoryRemote] 开始监听资料: {}", identity);
        Ok(handle_for(active))
    }

    async fn listen_feed(&self, window: usize, sink: FeedSink) -> Result<ListenerHandle> {
        let active = Arc::new(AtomicBool::new(true));
        let mut inner = self.lock();
        sink.deliver(inner.feed_window(window));
        inner.feed_listeners.push(FeedListener {
            window,
            sink,
            active: active.clone(),
        });
        debug!("[MemoryRemote] 开始监听聊天，窗口: {}", window);
        Ok(handle_for(active))
    }

    async fn set_profile(&self, identity: &Identity, doc: &ProfileDocument) -> Result<()> {
        let mut inner = self.lock();
        self.record(&mut inner, WriteRecord::SetProfile(identity.clone(), doc.clone()))?;
        inner.profiles.insert(identity.clone(), doc.clone());
        inner.push_profile(identity);
        Ok(())
    }

    async fn merge_profile(&self, identity: &Identity, doc: &ProfileDocument) -> Result<()> {
        let mut inner = self.lock();
        self.record(&mut inner, WriteRecord::MergeProfile(identity.clone(), doc.clone()))?;
        inner
            .profiles
            .entry(identity.clone())
            .or_default()
            .merge_missing(doc);
        inner.push_profile(identity);
        Ok(())
    }

    async fn update_profile(&self, identity: &Identity, patch: &ProfilePatch) -> Result<()> {
        let mut inner = self.lock();
        self.record(&mut inner, WriteRecord::UpdateProfile(identity.clone(), patch.clone()))?;
        let Some(doc) = inner.profiles.get_mut(identity) else {
            return Err(anyhow::anyhow!("文档不存在: users/{}", identity));
        };
        doc.apply_patch(patch);
        inner.push_profile(identity);
        Ok(())
    }

    async fn increment_points(&self, identity: &Identity, previous: u64, amount: u64) -> Result<()> {
        let mut inner = self.lock();
        self.record(
            &mut inner,
            WriteRecord::IncrementPoints {
                identity: identity.clone(),
                previous,
                amount,
            },
        )?;
        let Some(doc) = inner.profiles.get_mut(identity) else {
            return Err(anyhow::anyhow!("文档不存在: users/{}", identity));
        };
        let current = doc.points.unwrap_or(0).max(0) as u64;
        if current != previous {
            debug!(
                "[MemoryRemote] 积分基线不一致（客户端 {}，服务端 {}），按增量累加",
                previous, current
            );
        }
        doc.points = Some(current.saturating_add(amount) as i64);
        inner.push_profile(identity);
        Ok(())
    }

    async fn add_message(&self, doc: &MessageDocument) -> Result<()> {
        let mut inner = self.lock();
        self.record(&mut inner, WriteRecord::AddMessage(doc.clone()))?;
        inner.next_message_id += 1;
        let mut stored = doc.clone();
        stored.id = Some(format!("msg-{}", inner.next_message_id));
        inner.messages.push(stored);
        inner.push_feed();
        Ok(())
    }

    async fn upload_blob(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        let mut inner = self.lock();
        self.record(
            &mut inner,
            WriteRecord::UploadBlob {
                path: path.to_string(),
                len: bytes.len(),
            },
        )?;
        inner.blobs.insert(path.to_string(), bytes);
        Ok(format!("memory://{}", path))
    }
}
