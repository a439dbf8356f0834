//! 共享的基础类型：身份、内容 ID 以及远端接口的线上格式

use serde::{Deserialize, Serialize};
use std::fmt;

/// 实时监听通道的请求 / 推送类型标识符
pub mod req_type {
    pub const WS_LISTEN_DOC: i32 = 4001;
    pub const WS_LISTEN_QUERY: i32 = 4002;
    pub const WS_UNLISTEN: i32 = 4003;
    pub const WS_PUSH_DOC: i32 = 5001;
    pub const WS_PUSH_QUERY: i32 = 5002;
    pub const WS_LISTEN_ERROR: i32 = 5003;
}

/// 用户身份（服务端签发的不透明句柄）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 内容 ID（目录条目的稳定标识）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 实时监听请求（文本帧，JSON）
#[derive(Debug, Serialize, Deserialize)]
pub struct ListenReq {
    #[serde(rename = "reqIdentifier")]
    pub req_identifier: i32,
    #[serde(rename = "operationID")]
    pub operation_id: String,
    /// 文档路径（如 `users/{id}`）或集合路径（如 `chatMessages`）
    pub path: String,
    /// 查询排序字段（仅集合监听）
    #[serde(rename = "orderBy", default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// 只保留最后 N 条（仅集合监听）
    #[serde(rename = "limitToLast", default, skip_serializing_if = "Option::is_none")]
    pub limit_to_last: Option<usize>,
}

/// 实时推送响应（二进制帧，可能经过 gzip 压缩）
#[derive(Debug, Deserialize, Serialize)]
pub struct ListenResp {
    #[serde(rename = "reqIdentifier")]
    pub req_identifier: i32,
    #[serde(rename = "operationID", default)]
    pub operation_id: String,
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    /// 文档是否存在（仅文档推送）
    #[serde(default)]
    pub exists: bool,
    #[serde(
        default,
        deserialize_with = "crate::sdk::serialization::deserialize_base64"
    )]
    pub data: Vec<u8>,
}

/// HTTP 接口的统一响应包装；`data` 可能为 null 或缺失
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    pub data: Option<T>,
}

/// 校验 HTTP 状态和 `errCode` 后返回响应包装
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation: &str,
) -> anyhow::Result<ApiResponse<T>> {
    use anyhow::{anyhow, Context};
    use tracing::{debug, error};

    let status = response.status();
    let body = response
        .bytes()
        .await
        .with_context(|| format!("{} 读取响应失败", operation))?;
    let text = String::from_utf8_lossy(&body);
    debug!("[HTTP] {} <- {}", operation, text);

    if !status.is_success() {
        error!("[HTTP] ❌ {} HTTP {}: {}", operation, status, text);
        return Err(anyhow!("HTTP 错误 {}: {}", status, text));
    }

    let resp: ApiResponse<T> = serde_json::from_slice(&body)
        .with_context(|| format!("{} 响应解析失败: {}", operation, text))?;
    if resp.err_code != 0 {
        error!(
            "[HTTP] ❌ {} 服务端错误 {}: {}",
            operation, resp.err_code, resp.err_msg
        );
        return Err(anyhow!("服务器错误 {}: {}", resp.err_code, resp.err_msg));
    }
    Ok(resp)
}
