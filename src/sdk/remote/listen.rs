//! WebSocket 实时监听
//!
//! 每个监听独占一条连接：连接建立后发送一帧 `ListenReq`，之后服务端以二进制帧
//! （可选 gzip）推送 `ListenResp`。连接断开或服务端报错都视为订阅错误，不自动重连。

use crate::sdk::remote::{ListenerHandle, SnapshotSink};
use crate::sdk::serialization::maybe_decompress;
use crate::sdk::types::{req_type, ListenReq, ListenResp};
use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 心跳间隔
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// 握手超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 连接参数
#[derive(Clone, Debug)]
pub struct ListenEndpoint {
    pub ws_url: String,
    pub token: String,
    pub compression: String,
}

impl ListenEndpoint {
    /// 构建 WebSocket 连接 URL
    fn build_url(&self, operation_id: &str) -> String {
        let compression_param = if self.compression.is_empty() {
            String::new()
        } else {
            format!("&compression={}", self.compression)
        };
        format!(
            "{}/listen?token={}&operationID={}{}",
            self.ws_url, self.token, operation_id, compression_param
        )
    }
}

/// 解码一帧推送；返回 `Ok(None)` 表示忽略该帧
pub type FrameDecoder<T> = fn(&ListenResp) -> Result<Option<T>>;

/// 建立连接、发送监听请求并在后台转发推送
pub async fn spawn_listener<T: Send + 'static>(
    endpoint: &ListenEndpoint,
    req: ListenReq,
    sink: SnapshotSink<T>,
    decode: FrameDecoder<T>,
) -> Result<ListenerHandle> {
    let url = endpoint.build_url(&req.operation_id);
    let path = req.path.clone();
    info!("[Listen] 🔗 建立监听连接: {} ({})", path, sink.id());

    let (ws_stream, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
        .await
        .map_err(|_| anyhow::anyhow!("WebSocket 连接超时 ({:?}): {}", CONNECT_TIMEOUT, path))?
        .with_context(|| format!("WebSocket 连接失败: {}", path))?;
    debug!("[Listen] WebSocket 连接成功, 状态: {}", response.status());

    let (mut write, read) = ws_stream.split();
    let frame = serde_json::to_string(&req)?;
    write
        .send(WsMessage::Text(frame))
        .await
        .context("发送监听请求失败")?;
    let writer = Arc::new(Mutex::new(write));

    let heartbeat_writer = writer.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let mut w = heartbeat_writer.lock().await;
            if w.send(WsMessage::Ping(vec![])).await.is_err() {
                break;
            }
        }
    });

    let unlisten = ListenReq {
        req_identifier: req_type::WS_UNLISTEN,
        operation_id: req.operation_id.clone(),
        path: path.clone(),
        order_by: None,
        limit_to_last: None,
    };
    let reader = tokio::spawn(async move {
        read_loop(read, &path, &sink, decode).await;
    });

    Ok(ListenerHandle::new(move || {
        reader.abort();
        heartbeat.abort();
        // 尽力通知服务端取消监听并关闭连接
        tokio::spawn(async move {
            let mut w = writer.lock().await;
            if let Ok(frame) = serde_json::to_string(&unlisten) {
                let _ = w.send(WsMessage::Text(frame)).await;
            }
            let _ = w.send(WsMessage::Close(None)).await;
        });
    }))
}

/// 处理接收消息（事件循环）
async fn read_loop<T>(mut read: WsReader, path: &str, sink: &SnapshotSink<T>, decode: FrameDecoder<T>) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(WsMessage::Binary(data)) => {
                let resp = match parse_frame(data) {
                    Ok(resp) => resp,
                    Err(e) => {
                        error!("[Listen] {} 推送帧解析失败: {:#}", path, e);
                        continue;
                    }
                };
                if resp.err_code != 0 || resp.req_identifier == req_type::WS_LISTEN_ERROR {
                    error!(
                        "[Listen] ❌ {} 监听被服务端拒绝，错误码: {}, 错误信息: {}",
                        path, resp.err_code, resp.err_msg
                    );
                    sink.fail(format!("服务器错误 {}: {}", resp.err_code, resp.err_msg));
                    return;
                }
                match decode(&resp) {
                    Ok(Some(snapshot)) => {
                        if !sink.deliver(snapshot) {
                            debug!("[Listen] {} 核心已停止，结束监听", path);
                            return;
                        }
                    }
                    Ok(None) => debug!("[Listen] {} 忽略推送类型: {}", path, resp.req_identifier),
                    Err(e) => error!("[Listen] {} 快照解码失败: {:#}", path, e),
                }
            }
            Ok(WsMessage::Text(text)) => {
                debug!("[Listen] {} 文本响应: {}", path, text);
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                warn!("[Listen] 👋 {} 连接关闭: {:?}", path, frame);
                sink.fail("连接已关闭");
                return;
            }
            Err(e) => {
                error!("[Listen] {} WebSocket 错误: {}", path, e);
                sink.fail(e);
                return;
            }
            _ => {}
        }
    }
    sink.fail("连接已结束");
}

/// 解压并解析一帧推送
pub fn parse_frame(data: Vec<u8>) -> Result<ListenResp> {
    let decompressed = maybe_decompress(data).context("解压失败")?;
    serde_json::from_slice::<ListenResp>(&decompressed).map_err(|e| {
        anyhow::anyhow!(
            "JSON 解析失败: {}, 原始数据: {}",
            e,
            String::from_utf8_lossy(&decompressed)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::serialization::compress_gzip;
    use base64::Engine;

    #[test]
    fn gzip_push_frame_is_decoded() {
        let payload = base64::engine::general_purpose::STANDARD.encode(br#"{"name":"Ana"}"#);
        let raw = format!(
            r#"{{"reqIdentifier":{},"errCode":0,"errMsg":"","exists":true,"data":"{}"}}"#,
            req_type::WS_PUSH_DOC,
            payload
        );
        let resp = parse_frame(compress_gzip(raw.as_bytes()).unwrap()).unwrap();
        assert_eq!(resp.req_identifier, req_type::WS_PUSH_DOC);
        assert!(resp.exists);
        assert_eq!(resp.data, br#"{"name":"Ana"}"#);
    }

    #[test]
    fn url_carries_token_and_compression() {
        let ep = ListenEndpoint {
            ws_url: "ws://h:1".to_string(),
            token: "tk".to_string(),
            compression: "gzip".to_string(),
        };
        assert_eq!(
            ep.build_url("op1"),
            "ws://h:1/listen?token=tk&operationID=op1&compression=gzip"
        );
    }
}
