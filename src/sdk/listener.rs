//! 状态监听器回调接口

use async_trait::async_trait;

/// 状态变化回调，在每次发布后按变化的部分调用
#[async_trait]
pub trait StateListener: Send + Sync {
    /// 个人资料发生变更，参数为 JSON 对象字符串（访客状态为 `null`）
    async fn on_profile_changed(&self, profile_json: String);

    /// 聊天窗口发生变更，参数为 JSON 数组字符串
    async fn on_chat_messages_changed(&self, messages_json: String);

    /// 门禁结果发生变更
    async fn on_admitted_changed(&self, admitted: bool);
}

/// 默认空实现（无操作）
pub struct EmptyStateListener;

#[async_trait]
impl StateListener for EmptyStateListener {
    async fn on_profile_changed(&self, _profile_json: String) {}

    async fn on_chat_messages_changed(&self, _messages_json: String) {}

    async fn on_admitted_changed(&self, _admitted: bool) {}
}
