//! Leafy 同步核心 CLI（测试版）
//!
//! 非交互式 CLI：登录后启动同步核心，只展示状态变化。
//! `--offline` 使用内存版远端存储，不需要服务端。

use anyhow::{Context, Result};
use clap::Parser;
use leafy_sdk_core_rust::sdk::cache::SqliteProfileCache;
use leafy_sdk_core_rust::sdk::gating::missing_mandatory;
use leafy_sdk_core_rust::{
    AuthProvider, AuthUser, Catalog, ClientConfig, HttpAuthClient, HttpRemoteStore, Identity,
    ManualAuthProvider, MemoryRemoteStore, RemoteStore, StateListener, SyncClient, WritePolicy,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Leafy CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "leafy-cli")]
#[command(about = "Leafy CLI 客户端 - 用于测试和展示会话同步核心", long_about = None)]
struct Args {
    /// 登录邮箱
    #[arg(short, long, default_value = "demo@leafy.app")]
    email: String,

    /// 登录密码
    #[arg(short, long, default_value = "leafy-demo")]
    password: String,

    /// HTTP API 地址
    #[arg(long, default_value = "http://localhost:10002")]
    api_url: String,

    /// WebSocket 监听地址
    #[arg(long, default_value = "ws://localhost:10001")]
    ws_url: String,

    /// 本地缓存数据库 URL
    #[arg(long, default_value = "sqlite://leafy_cache.db?mode=rwc")]
    cache_db: String,

    /// 内容目录 JSON 文件（缺省使用内置目录）
    #[arg(long)]
    catalog: Option<String>,

    /// 写入失败后的最大尝试次数（1 表示不重试）
    #[arg(long, default_value = "1")]
    write_attempts: u32,

    /// 离线模式：使用内存版远端存储
    #[arg(long)]
    offline: bool,

    /// 启动后发送一条聊天消息
    #[arg(long)]
    send: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,leafy_sdk_core_rust=debug）
    #[arg(long, default_value = "info,leafy_sdk_core_rust=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("leafy-debug.log")
        .context("无法创建日志文件 leafy-debug.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: leafy-debug.log");
    Ok(())
}

/// 输出所有状态变化
struct CliStateListener;

#[async_trait::async_trait]
impl StateListener for CliStateListener {
    async fn on_profile_changed(&self, profile_json: String) {
        info!("[CLI/Profile] 👤 资料变更: {}", profile_json);
    }

    async fn on_chat_messages_changed(&self, messages_json: String) {
        info!("[CLI/Feed] 💬 聊天窗口变更: {}", messages_json);
    }

    async fn on_admitted_changed(&self, admitted: bool) {
        if admitted {
            info!("[CLI/Gating] ✅ 必修内容已全部完成");
        } else {
            warn!("[CLI/Gating] 🔒 仍有必修内容未完成");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 Leafy CLI 客户端（测试模式）");
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let mut config = ClientConfig::new(args.api_url.clone());
    config.ws_url = args.ws_url.clone();
    config.cache_db_url = args.cache_db.clone();
    if args.write_attempts > 1 {
        config.write_policy = WritePolicy::with_retry(args.write_attempts, Duration::from_millis(500));
    }

    let catalog = match &args.catalog {
        Some(path) => Catalog::from_json_file(path)?,
        None => Catalog::builtin(),
    };
    if catalog.is_empty() {
        anyhow::bail!("内容目录为空: {}", args.catalog.as_deref().unwrap_or("builtin"));
    }
    info!("[CLI] 📚 内容目录: {} 项，必修 {} 项", catalog.len(), catalog.mandatory_ids().len());

    let cache = Arc::new(SqliteProfileCache::open(&config.cache_db_url).await?);

    let (remote, auth): (Arc<dyn RemoteStore>, Arc<dyn AuthProvider>) = if args.offline {
        info!("[CLI] 📴 离线模式，使用内存版远端存储");
        let auth = ManualAuthProvider::new();
        let mut user = AuthUser::new(Identity::new("offline-user"));
        user.display_name = Some("Offline".to_string());
        auth.sign_in(user);
        (Arc::new(MemoryRemoteStore::new()), Arc::new(auth))
    } else {
        let auth = HttpAuthClient::new(args.api_url.clone());
        auth.sign_in_with_email(&args.email, &args.password)
            .await
            .map_err(|e| anyhow::anyhow!("登录失败: {:#}", e))?;
        let token = auth
            .token()
            .ok_or_else(|| anyhow::anyhow!("登录失败：没有拿到 token"))?;
        (Arc::new(HttpRemoteStore::new(&config, &token)?), Arc::new(auth))
    };

    let mut client = SyncClient::new(config, catalog.clone(), remote, cache, auth);
    client.set_state_listener(Arc::new(CliStateListener));
    let handle = client.start().await;
    handle.flush().await?;

    let state = handle.state();
    info!(
        "[CLI] 📋 当前用户: {} | 积分: {} | 界面: {:?}",
        state.display_name(),
        state.points(),
        state.screen()
    );

    let missing = missing_mandatory(&state.completion_set(), &catalog);
    if !missing.is_empty() {
        let titles: Vec<&str> = missing
            .iter()
            .filter_map(|id| catalog.get(id).map(|item| item.title.as_str()))
            .collect();
        info!("[CLI] 📖 未完成的必修内容: {}", titles.join(", "));
    }

    if let Some(text) = &args.send {
        handle.send_message(text).await?;
        info!("[CLI] 📤 已发送消息: {}", text);
    }

    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await.context("等待 Ctrl+C 失败")?;
    }

    handle.shutdown().await?;
    info!("[CLI] 👋 程序退出");
    Ok(())
}
