//! 远端文档存储 HTTP 客户端
//!
//! 写入走 HTTP，实时监听走 WebSocket（见 `listen` 模块）。

use crate::sdk::config::ClientConfig;
use crate::sdk::feed::models::MessageDocument;
use crate::sdk::profile::models::{ProfileDocument, ProfilePatch};
use crate::sdk::remote::listen::{spawn_listener, ListenEndpoint};
use crate::sdk::remote::{FeedSink, ListenerHandle, ProfileSink, RemoteStore};
use crate::sdk::types::{handle_http_response, req_type, Identity, ListenReq, ListenResp};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// 用户资料集合
pub const USERS_COLLECTION: &str = "users";

/// 聊天消息集合
pub const MESSAGES_COLLECTION: &str = "messages";

#[derive(Debug, Deserialize)]
struct UploadResp {
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadReq<'a> {
    path: &'a str,
    content_type: &'a str,
    /// base64 编码的内容
    data: String,
}

/// 基于 HTTP + WebSocket 的远端存储
pub struct HttpRemoteStore {
    client: reqwest::Client,
    api_base_url: String,
    endpoint: ListenEndpoint,
}

impl HttpRemoteStore {
    /// 创建远端存储客户端，所有请求携带会话 token
    pub fn new(config: &ClientConfig, token: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "token",
            reqwest::header::HeaderValue::from_str(token).context("token 含有非法字符")?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            client,
            api_base_url: config.api_base_url.clone(),
            endpoint: ListenEndpoint {
                ws_url: config.ws_url.clone(),
                token: token.to_string(),
                compression: config.compression.clone(),
            },
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
        operation: &str,
    ) -> Result<Option<T>> {
        let operation_id = Uuid::new_v4().to_string();
        let url = format!("{}{}", self.api_base_url, path);
        debug!("[RemoteAPI] {} URL: {}, 操作ID: {}", operation, url, operation_id);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .json(&body)
            .send()
            .await
            .context("请求失败")?;
        let api_resp = handle_http_response::<T>(response, operation).await?;
        Ok(api_resp.data)
    }

    fn listen_req(path: String, order_by: Option<&str>, limit_to_last: Option<usize>) -> ListenReq {
        ListenReq {
            req_identifier: if limit_to_last.is_some() {
                req_type::WS_LISTEN_QUERY
            } else {
                req_type::WS_LISTEN_DOC
            },
            operation_id: Uuid::new_v4().to_string(),
            path,
            order_by: order_by.map(str::to_string),
            limit_to_last,
        }
    }
}

fn decode_profile_frame(resp: &ListenResp) -> Result<Option<Option<ProfileDocument>>> {
    if resp.req_identifier != req_type::WS_PUSH_DOC {
        return Ok(None);
    }
    if !resp.exists {
        return Ok(Some(None));
    }
    let value = serde_json::from_slice::<serde_json::Value>(&resp.data).context("资料文档解析失败")?;
    Ok(Some(Some(ProfileDocument::from_value_lenient(&value))))
}

fn decode_feed_frame(resp: &ListenResp) -> Result<Option<Vec<MessageDocument>>> {
    if resp.req_identifier != req_type::WS_PUSH_QUERY {
        return Ok(None);
    }
    if resp.data.is_empty() {
        return Ok(Some(Vec::new()));
    }
    let values = serde_json::from_slice::<Vec<serde_json::Value>>(&resp.data).context("消息列表解析失败")?;
    let total = values.len();
    // 单条消息格式错误只丢弃该条
    let docs: Vec<MessageDocument> = values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();
    if docs.len() < total {
        debug!("[RemoteAPI] 丢弃 {} 条格式错误的消息", total - docs.len());
    }
    Ok(Some(docs))
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn listen_profile(&self, identity: &Identity, sink: ProfileSink) -> Result<ListenerHandle> {
        let req = Self::listen_req(format!("{}/{}", USERS_COLLECTION, identity), None, None);
        spawn_listener(&self.endpoint, req, sink, decode_profile_frame).await
    }

    async fn listen_feed(&self, window: usize, sink: FeedSink) -> Result<ListenerHandle> {
        let req = Self::listen_req(MESSAGES_COLLECTION.to_string(), Some("timestamp"), Some(window));
        spawn_listener(&self.endpoint, req, sink, decode_feed_frame).await
    }

    async fn set_profile(&self, identity: &Identity, doc: &ProfileDocument) -> Result<()> {
        info!("[RemoteAPI] 📝 写入资料文档: {}", identity);
        self.post::<serde_json::Value>(
            "/profile/set",
            serde_json::json!({ "userID": identity, "doc": doc }),
            "写入资料",
        )
        .await?;
        Ok(())
    }

    async fn merge_profile(&self, identity: &Identity, doc: &ProfileDocument) -> Result<()> {
        info!("[RemoteAPI] 🔧 合并资料文档: {}", identity);
        self.post::<serde_json::Value>(
            "/profile/merge",
            serde_json::json!({ "userID": identity, "doc": doc, "onlyMissing": true }),
            "合并资料",
        )
        .await?;
        Ok(())
    }

    async fn update_profile(&self, identity: &Identity, patch: &ProfilePatch) -> Result<()> {
        self.post::<serde_json::Value>(
            "/profile/update",
            serde_json::json!({ "userID": identity, "patch": patch }),
            "更新资料",
        )
        .await?;
        Ok(())
    }

    async fn increment_points(&self, identity: &Identity, previous: u64, amount: u64) -> Result<()> {
        self.post::<serde_json::Value>(
            "/profile/increment_points",
            serde_json::json!({ "userID": identity, "previous": previous, "amount": amount }),
            "增加积分",
        )
        .await?;
        Ok(())
    }

    async fn add_message(&self, doc: &MessageDocument) -> Result<()> {
        self.post::<serde_json::Value>(
            "/feed/add_message",
            serde_json::json!({ "doc": doc }),
            "发送消息",
        )
        .await?;
        Ok(())
    }

    async fn upload_blob(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        info!("[RemoteAPI] ⬆️ 上传文件: {} ({} 字节)", path, bytes.len());
        let req = UploadReq {
            path,
            content_type,
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };
        let resp = self
            .post::<UploadResp>("/blob/upload", serde_json::to_value(&req)?, "上传文件")
            .await?
            .ok_or_else(|| anyhow::anyhow!("上传失败：服务器返回数据为空"))?;
        Ok(resp.url)
    }
}
