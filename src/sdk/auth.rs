//! 认证协作方
//!
//! 核心只消费认证状态变化（恢复中 / 已登出 / 已登录），登录方式本身由外部实现。
//! 这里提供输入校验、契约定义、一个基于 HTTP 的实现和一个手动驱动的实现。

use crate::sdk::types::{handle_http_response, Identity};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 密码最小长度
pub const MIN_PASSWORD_LEN: usize = 6;

/// 用户输入校验失败（在任何网络请求之前同步返回）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("email is required")]
    EmptyEmail,
    #[error("email address is malformed")]
    MalformedEmail,
    #[error("password is required")]
    EmptyPassword,
    #[error("password must be at least 6 characters")]
    ShortPassword,
    #[error("name is required")]
    EmptyName,
    #[error("point award must be positive")]
    NonPositiveAward,
}

/// 去除首尾空白并转小写
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// 校验邮箱，返回规范化后的邮箱
pub fn validate_email(email: &str) -> Result<String, ValidationError> {
    let email = normalize_email(email);
    if email.is_empty() {
        return Err(ValidationError::EmptyEmail);
    }
    if !email.contains('@') {
        return Err(ValidationError::MalformedEmail);
    }
    Ok(email)
}

/// 登录校验：邮箱和密码都不能为空
pub fn validate_sign_in(email: &str, password: &str) -> Result<(String, String), ValidationError> {
    let email = normalize_email(email);
    let password = password.trim();
    if email.is_empty() {
        return Err(ValidationError::EmptyEmail);
    }
    if password.is_empty() {
        return Err(ValidationError::EmptyPassword);
    }
    Ok((email, password.to_string()))
}

/// 注册校验：姓名非空、邮箱合法、密码足够长
pub fn validate_sign_up(
    name: &str,
    email: &str,
    password: &str,
) -> Result<(String, String, String), ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let email = validate_email(email)?;
    let password = password.trim();
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::ShortPassword);
    }
    Ok((name.to_string(), email, password.to_string()))
}

/// 已认证用户及认证方提供的尽力而为的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub identity: Identity,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    /// 本次登录是否新建了账号（社交登录）
    #[serde(default)]
    pub is_new_account: bool,
}

impl AuthUser {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            display_name: None,
            avatar_ref: None,
            is_new_account: false,
        }
    }
}

/// 认证状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// 认证方仍在恢复上次的会话，结果未知
    Restoring,
    /// 确定未登录
    SignedOut,
    SignedIn(AuthUser),
}

impl AuthState {
    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            AuthState::SignedIn(user) => Some(user),
            _ => None,
        }
    }
}

impl From<Option<AuthUser>> for AuthState {
    fn from(user: Option<AuthUser>) -> Self {
        user.map_or(AuthState::SignedOut, AuthState::SignedIn)
    }
}

struct FeedInner {
    current: AuthState,
    subscribers: Vec<UnboundedSender<AuthState>>,
}

/// 认证状态广播
///
/// 每个订阅者按顺序收到每一次变化，快速的 登出→登入 不会被合并。
pub struct AuthStateFeed {
    inner: Mutex<FeedInner>,
}

impl AuthStateFeed {
    pub fn new(initial: AuthState) -> Self {
        Self {
            inner: Mutex::new(FeedInner {
                current: initial,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> AuthState {
        self.lock().current.clone()
    }

    /// 发布新状态
    pub fn publish(&self, state: AuthState) {
        self.modify(|current| *current = state);
    }

    /// 原地修改当前状态并发布；已关闭的订阅者顺带移除
    pub fn modify(&self, f: impl FnOnce(&mut AuthState)) {
        let mut inner = self.lock();
        f(&mut inner.current);
        let state = inner.current.clone();
        inner.subscribers.retain(|tx| tx.send(state.clone()).is_ok());
    }

    /// 返回当前状态以及之后每一次变化
    pub fn subscribe(&self) -> (AuthState, UnboundedReceiver<AuthState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.subscribers.push(tx);
        (inner.current.clone(), rx)
    }
}

/// 社交登录提供方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocialProvider {
    Google,
    Github,
}

/// 认证协作方契约
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// 当前认证状态以及之后的每一次变化（按发生顺序，不合并）
    fn auth_states(&self) -> (AuthState, UnboundedReceiver<AuthState>);

    async fn sign_out(&self) -> Result<()>;

    /// 发送重置密码邮件；邮箱不合法时直接返回错误
    async fn send_password_reset(&self, email: &str) -> Result<()>;

    /// 同步更新认证方保存的显示名
    async fn update_display_name(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct EmailLoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct EmailRegisterRequest<'a> {
    email: &'a str,
    password: &'a str,
    #[serde(rename = "displayName")]
    display_name: &'a str,
}

#[derive(Debug, Serialize)]
struct OAuthLoginRequest<'a> {
    provider: SocialProvider,
    #[serde(rename = "idToken")]
    id_token: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginData {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub token: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "photoURL", default)]
    pub photo_url: Option<String>,
    #[serde(rename = "isNewUser", default)]
    pub is_new_user: bool,
}

impl LoginData {
    fn to_user(&self) -> AuthUser {
        AuthUser {
            identity: Identity::new(self.user_id.clone()),
            display_name: self.display_name.clone().filter(|n| !n.is_empty()),
            avatar_ref: self.photo_url.clone().filter(|u| !u.is_empty()),
            is_new_account: self.is_new_user,
        }
    }
}

/// 基于 HTTP 的认证客户端
pub struct HttpAuthClient {
    client: reqwest::Client,
    api_base_url: String,
    token: Mutex<Option<String>>,
    states: AuthStateFeed,
}

impl HttpAuthClient {
    /// 不持久化会话，创建时即为已登出
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base_url: api_base_url.into(),
            token: Mutex::new(None),
            states: AuthStateFeed::new(AuthState::SignedOut),
        }
    }

    /// 当前会话 token（登录后可用）
    pub fn token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B, operation: &str) -> Result<Option<LoginData>> {
        let url = format!("{}{}", self.api_base_url, path);
        let operation_id = Uuid::new_v4().to_string();
        debug!("[Auth] {} URL: {}, OperationID: {}", operation, url, operation_id);

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .json(body);
        if let Some(token) = self.token() {
            req = req.header("token", token);
        }
        let response = req.send().await.context("请求失败")?;
        let api_resp = handle_http_response::<LoginData>(response, operation).await?;
        Ok(api_resp.data)
    }

    fn accept_login(&self, data: LoginData) -> AuthUser {
        let user = data.to_user();
        if let Ok(mut token) = self.token.lock() {
            *token = Some(data.token);
        }
        info!("[Auth] ✅ 登录成功，用户ID: {}", user.identity);
        self.states.publish(AuthState::SignedIn(user.clone()));
        user
    }

    /// 邮箱密码登录
    pub async fn sign_in_with_email(&self, email: &str, password: &str) -> Result<AuthUser> {
        let (email, password) = validate_sign_in(email, password)?;
        info!("[Auth] 🔐 正在登录...");
        let data = self
            .post(
                "/account/login",
                &EmailLoginRequest {
                    email: &email,
                    password: &password,
                },
                "登录",
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("登录失败：服务器返回数据为空"))?;
        Ok(self.accept_login(data))
    }

    /// 邮箱注册；返回的用户需要随后创建资料文档
    pub async fn sign_up_with_email(&self, name: &str, email: &str, password: &str) -> Result<AuthUser> {
        let (name, email, password) = validate_sign_up(name, email, password)?;
        info!("[Auth] 📝 正在注册...");
        let data = self
            .post(
                "/account/register",
                &EmailRegisterRequest {
                    email: &email,
                    password: &password,
                    display_name: &name,
                },
                "注册",
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("注册失败：服务器返回数据为空"))?;
        Ok(self.accept_login(data))
    }

    /// 用外部 OAuth 流程拿到的 id token 换取会话
    pub async fn sign_in_with_provider(&self, provider: SocialProvider, id_token: &str) -> Result<AuthUser> {
        info!("[Auth] 🔐 正在使用 {:?} 登录...", provider);
        let data = self
            .post(
                "/account/oauth_login",
                &OAuthLoginRequest { provider, id_token },
                "社交登录",
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("社交登录失败：服务器返回数据为空"))?;
        Ok(self.accept_login(data))
    }
}

#[async_trait]
impl AuthProvider for HttpAuthClient {
    fn auth_states(&self) -> (AuthState, UnboundedReceiver<AuthState>) {
        self.states.subscribe()
    }

    async fn sign_out(&self) -> Result<()> {
        if let Err(e) = self
            .post("/account/logout", &serde_json::json!({}), "登出")
            .await
        {
            // 本地登出不依赖服务端结果
            warn!("[Auth] 服务端登出失败: {:#}", e);
        }
        if let Ok(mut token) = self.token.lock() {
            *token = None;
        }
        self.states.publish(AuthState::SignedOut);
        info!("[Auth] 👋 已登出");
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<()> {
        let email = validate_email(email)?;
        self.post(
            "/account/password_reset",
            &serde_json::json!({ "email": email }),
            "重置密码",
        )
        .await?;
        info!("[Auth] 📧 重置密码邮件已发送");
        Ok(())
    }

    async fn update_display_name(&self, name: &str) -> Result<()> {
        self.post(
            "/account/update_display_name",
            &serde_json::json!({ "displayName": name }),
            "更新显示名",
        )
        .await?;
        Ok(())
    }
}

/// 手动驱动的认证方（离线模式、测试）
pub struct ManualAuthProvider {
    states: AuthStateFeed,
}

impl ManualAuthProvider {
    /// 初始为恢复中，冷启动缓存保持可见直到调用方给出结果
    pub fn new() -> Self {
        Self {
            states: AuthStateFeed::new(AuthState::Restoring),
        }
    }

    pub fn sign_in(&self, user: AuthUser) {
        self.states.publish(AuthState::SignedIn(user));
    }

    pub fn current(&self) -> Option<AuthUser> {
        self.states.current().user().cloned()
    }
}

impl Default for ManualAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for ManualAuthProvider {
    fn auth_states(&self) -> (AuthState, UnboundedReceiver<AuthState>) {
        self.states.subscribe()
    }

    async fn sign_out(&self) -> Result<()> {
        self.states.publish(AuthState::SignedOut);
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<()> {
        let email = validate_email(email)?;
        info!("[Auth] 离线模式，跳过重置密码邮件: {}", email);
        Ok(())
    }

    async fn update_display_name(&self, name: &str) -> Result<()> {
        self.states.modify(|state| {
            if let AuthState::SignedIn(user) = state {
                user.display_name = Some(name.to_string());
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_trimmed_and_lowercased() {
        assert_eq!(validate_email("  Ana@Leafy.IO ").unwrap(), "ana@leafy.io");
    }

    #[test]
    fn malformed_inputs_are_rejected_before_any_request() {
        assert_eq!(validate_email("   "), Err(ValidationError::EmptyEmail));
        assert_eq!(validate_email("ana.leafy.io"), Err(ValidationError::MalformedEmail));
        assert_eq!(validate_sign_in("a@b", " "), Err(ValidationError::EmptyPassword));
        assert_eq!(
            validate_sign_up("Ana", "a@b", "12345"),
            Err(ValidationError::ShortPassword)
        );
        assert_eq!(
            validate_sign_up("  ", "a@b", "123456"),
            Err(ValidationError::EmptyName)
        );
        assert!(validate_sign_up("Ana", "a@b", "123456").is_ok());
    }

    #[tokio::test]
    async fn password_reset_validates_locally() {
        // 未启动任何服务端：校验失败必须在发请求之前返回
        let client = HttpAuthClient::new("http://127.0.0.1:9");
        let err = client.send_password_reset("no-at-sign").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::MalformedEmail)
        );
    }

    #[tokio::test]
    async fn manual_provider_emits_every_change_in_order() {
        let auth = ManualAuthProvider::new();
        let (initial, mut rx) = auth.auth_states();
        assert_eq!(initial, AuthState::Restoring);

        let u1 = AuthUser::new(Identity::new("u1"));
        auth.sign_in(u1.clone());
        auth.sign_out().await.unwrap();
        auth.sign_in(u1.clone());

        // 登出后立即以同一身份登入，中间的登出不会被合并掉
        assert_eq!(rx.recv().await, Some(AuthState::SignedIn(u1.clone())));
        assert_eq!(rx.recv().await, Some(AuthState::SignedOut));
        assert_eq!(rx.recv().await, Some(AuthState::SignedIn(u1)));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = AuthStateFeed::new(AuthState::SignedOut);
        let (_, rx) = feed.subscribe();
        drop(rx);
        feed.publish(AuthState::Restoring);
        assert_eq!(feed.lock().subscribers.len(), 0);
        assert_eq!(feed.current(), AuthState::Restoring);
    }

    #[test]
    fn login_payload_maps_to_auth_user() {
        let data: LoginData = serde_json::from_str(
            r#"{"userID":"u9","token":"t","displayName":"","photoURL":"https://p","isNewUser":true}"#,
        )
        .unwrap();
        let user = data.to_user();
        assert_eq!(user.identity, Identity::new("u9"));
        assert!(user.display_name.is_none());
        assert_eq!(user.avatar_ref.as_deref(), Some("https://p"));
        assert!(user.is_new_account);
    }
}
