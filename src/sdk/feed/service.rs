//! 聊天同步服务
//!
//! 订阅消息集合的最近 N 条，快照整理为按时间升序、去重、限长的窗口。
//! 发送不做本地回显，消息经订阅往返后才出现。

use crate::sdk::feed::models::{ChatMessage, MessageDocument};
use crate::sdk::profile::models::PLACEHOLDER_NAME;
use crate::sdk::event::CoreEvent;
use crate::sdk::remote::{FeedSink, ListenerHandle, Listening, RemoteStore, SubscriptionId};
use crate::sdk::state::{AppState, Mutation, StateStore};
use crate::sdk::types::Identity;
use crate::sdk::writer::WriteDispatcher;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// 把快照文档整理为消息窗口
///
/// 丢弃缺少 ID 或时间戳的文档，同一 ID 只保留首次出现，按发送时间升序，只保留最后 `window` 条。
pub fn normalize_window(
    docs: Vec<MessageDocument>,
    current: Option<&Identity>,
    window: usize,
) -> Vec<ChatMessage> {
    let mut seen = HashSet::new();
    let mut messages: Vec<ChatMessage> = docs
        .into_iter()
        .filter_map(|doc| doc.into_message(current))
        .filter(|m| seen.insert(m.id.clone()))
        .collect();
    messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
    if messages.len() > window {
        messages.drain(..messages.len() - window);
    }
    messages
}

/// 由当前状态构造一条待发送的消息文档；文本为空或未登录时返回 `None`
pub fn compose_message(state: &AppState, text: &str, now_millis: i64) -> Option<MessageDocument> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let identity = state.identity.as_ref()?;
    let profile = state.profile.as_ref();
    Some(MessageDocument {
        id: None,
        text: Some(text.to_string()),
        user_name: Some(
            profile
                .map(|p| p.name.clone())
                .unwrap_or_else(|| PLACEHOLDER_NAME.to_string()),
        ),
        user_id: Some(identity.as_str().to_string()),
        user_photo_url: profile.and_then(|p| p.avatar_ref.clone()),
        timestamp: Some(now_millis),
    })
}

struct ActiveFeed {
    sub: SubscriptionId,
    listening: Listening,
}

/// 聊天同步引擎（只在核心事件循环内使用）
pub struct FeedSyncEngine {
    remote: Arc<dyn RemoteStore>,
    writer: WriteDispatcher,
    window: usize,
    active: Option<ActiveFeed>,
}

impl FeedSyncEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, writer: WriteDispatcher, window: usize) -> Self {
        Self {
            remote,
            writer,
            window: window.max(1),
            active: None,
        }
    }

    /// 打开订阅；已有订阅会先关闭。连接在后台建立，结果以 [`CoreEvent::FeedAttached`] 送回
    pub fn subscribe(&mut self, sink: FeedSink, events: UnboundedSender<CoreEvent>) {
        self.unsubscribe();
        let sub = sink.id();
        let remote = self.remote.clone();
        let window = self.window;
        tokio::spawn(async move {
            let result = remote
                .listen_feed(window, sink)
                .await
                .map_err(|e| format!("{:#}", e));
            let _ = events.send(CoreEvent::FeedAttached { sub, result });
        });
        self.active = Some(ActiveFeed {
            sub,
            listening: Listening::Pending,
        });
    }

    /// 后台订阅建立完成；属于旧订阅的句柄直接释放
    pub fn on_attached(&mut self, sub: SubscriptionId, result: Result<ListenerHandle, String>) {
        let Some(active) = self.active.as_mut().filter(|a| a.sub == sub) else {
            debug!("[FeedSync] 释放过期订阅的句柄 ({})", sub);
            return;
        };
        match result {
            Ok(handle) => {
                if active.listening.attach(handle) {
                    info!("[FeedSync] 📡 聊天订阅已打开 ({}, 窗口 {})", sub, self.window);
                }
            }
            Err(e) => {
                error!("[FeedSync] ❌ 聊天订阅建立失败: {}", e);
                active.listening.close();
            }
        }
    }

    /// 关闭订阅，之后该订阅的在途快照都会被丢弃
    pub fn unsubscribe(&mut self) {
        if let Some(active) = self.active.take() {
            info!("[FeedSync] 🔌 关闭聊天订阅 ({})", active.sub);
        }
    }

    pub fn is_current(&self, sub: SubscriptionId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.sub == sub && !a.listening.is_closed())
    }

    /// 处理订阅推送
    pub fn on_snapshot(&mut self, store: &StateStore, sub: SubscriptionId, result: Result<Vec<MessageDocument>, String>) {
        if !self.is_current(sub) {
            debug!("[FeedSync] 丢弃过期订阅的快照 ({})", sub);
            return;
        }
        match result {
            Ok(docs) => {
                let current = store.current();
                let messages = normalize_window(docs, current.identity.as_ref(), self.window);
                debug!("[FeedSync] 聊天快照: {} 条", messages.len());
                store.apply(Mutation::ReplaceFeed(messages));
            }
            Err(e) => {
                warn!("[FeedSync] ❌ 聊天订阅出错，订阅保持关闭: {}", e);
                if let Some(active) = self.active.as_mut() {
                    active.listening.close();
                }
            }
        }
    }

    /// 发送消息；被拒绝（空文本、未登录）时返回 false
    pub fn send(&self, store: &StateStore, text: &str) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        let Some(doc) = compose_message(&store.current(), text, now) else {
            debug!("[FeedSync] 忽略空消息或未登录时的发送");
            return false;
        };
        let remote = self.remote.clone();
        self.writer.dispatch("add_message", move || {
            let remote = remote.clone();
            let doc = doc.clone();
            async move { remote.add_message(&doc).await }
        });
        true
    }
}
