//! 闲鱼签名接口命令行工具。
//!
//! 职责：
//! - `token`：获取长连接 accessToken（含重试与重新登录）
//! - `item`：查询商品详情
//! - `decode`：解码长连接推送中的消息体
//! - `watch`：按周期刷新 token，Cookie 失效时以非零状态退出
//!
//! 凭据：
//! - Cookie 通过 `--cookies` 或环境变量 `COOKIES_STR` 提供；两者都没有时读取 `--env-file` 中的 `COOKIES_STR`
//! - Cookie 变更会写回 `--env-file` 指定的 `.env`（默认 `.env`）
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

mod env_file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xianyu_core::api::{ApiClient, ItemInfo};
use xianyu_core::config::ClientConfig;
use xianyu_core::cookies::CookieStore;
use xianyu_core::decode::decode;
use xianyu_core::error::ApiError;
use xianyu_core::ids::generate_device_id;

use crate::env_file::EnvFileHook;

/// 命令行参数。
#[derive(Debug, Parser)]
#[command(name = "xianyu-cli", version)]
struct Cli {
    /// 完整 Cookie 字符串（`name=value; name=value`）。
    #[arg(long, env = "COOKIES_STR", hide_env_values = true)]
    cookies: Option<String>,

    /// 客户端配置 JSON（可选，缺省使用内置默认值）。
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 获取长连接 accessToken。
    Token,
    /// 查询商品详情。
    Item { item_id: String },
    /// 解码推送消息体（Base64），以 JSON 输出结果。
    Decode { payload: String },
    /// 周期刷新 token，直到 Ctrl-C 或 Cookie 失效。
    Watch {
        #[arg(long, default_value_t = 3600)]
        refresh_secs: u64,

        #[arg(long, default_value_t = 300)]
        retry_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Token => token(&cli).await,
        Commands::Item { item_id } => item(&cli, item_id).await,
        Commands::Decode { payload } => decode_payload(payload),
        Commands::Watch {
            refresh_secs,
            retry_secs,
        } => {
            watch(
                &cli,
                Duration::from_secs(*refresh_secs),
                Duration::from_secs(*retry_secs),
            )
            .await
        }
    }
}

/// 读取配置文件（未指定时使用默认值）并校验。
fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config = match path {
        Some(path) => ClientConfig::from_json_file(path)
            .with_context(|| format!("读取配置失败: {}", path.display()))?,
        None => ClientConfig::default(),
    };
    config.validate().context("配置校验失败")?;
    Ok(config)
}

/// 会话上下文：客户端 + 设备 ID。
struct Session {
    client: ApiClient,
    device_id: String,
}

/// 按命令行参数创建会话。
///
/// 异常处理：
/// - 未提供 Cookie、Cookie 中缺少 `unb` 时返回错误
/// - `.env` 无法读取/解析、配置文件读取/校验失败、HTTP 客户端初始化失败时返回错误
fn open_session(cli: &Cli) -> Result<Session> {
    let raw = match cli.cookies.clone().filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw,
        None => env_file::load_cookies(&cli.env_file)
            .with_context(|| format!("读取 {} 失败", cli.env_file.display()))?
            .ok_or_else(|| anyhow!("缺少 Cookie：请通过 --cookies、COOKIES_STR 或 .env 提供"))?,
    };
    let cookies = CookieStore::from_cookie_str(&raw).with_hook(EnvFileHook::new(&cli.env_file));
    let user_id = cookies.get("unb").context("Cookie 中缺少 unb")?.to_string();
    let device_id = generate_device_id(&user_id);
    info!(cookies = cookies.len(), "已加载 Cookie");

    let config = load_config(cli.config.as_deref())?;
    let client = ApiClient::with_reqwest(cookies, config).context("初始化 HTTP 客户端失败")?;
    Ok(Session { client, device_id })
}

async fn token(cli: &Cli) -> Result<()> {
    let mut session = open_session(cli)?;
    let token = session
        .client
        .fetch_access_token(&session.device_id)
        .await
        .context("获取 token 失败")?;
    println!("{token}");
    Ok(())
}

async fn item(cli: &Cli, item_id: &str) -> Result<()> {
    let mut session = open_session(cli)?;
    let body = session
        .client
        .fetch_item(item_id)
        .await
        .with_context(|| format!("获取商品信息失败: {item_id}"))?;
    match ItemInfo::from_response(&body) {
        Some(info) => {
            println!("{}", info.title);
            println!("{}", info.describe());
        }
        None => {
            warn!(item_id, "响应中没有 itemDO，输出原始结果");
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}

fn decode_payload(payload: &str) -> Result<()> {
    let decoded = decode(payload);
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

/// 周期刷新 token。
///
/// 行为：
/// - 成功后等待 `refresh`，非致命失败后等待 `retry`
/// - Ctrl-C 立即取消进行中的请求与等待，正常退出
/// - Cookie 失效（致命）时返回错误，进程以非零状态退出
async fn watch(cli: &Cli, refresh: Duration, retry: Duration) -> Result<()> {
    let session = open_session(cli)?;
    let cancel = CancellationToken::new();
    let mut client = session.client.with_cancellation(cancel.clone());

    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl-C，停止刷新");
        }
        signal.cancel();
    });

    loop {
        let wait = match client.fetch_access_token(&session.device_id).await {
            Ok(token) => {
                info!(token_len = token.len(), "token 刷新成功");
                refresh
            }
            Err(ApiError::Cancelled) => break,
            Err(err) if err.is_fatal() => {
                error!(error = %err, "Cookie 已失效，停止刷新");
                return Err(err).context("请更新 COOKIES_STR 后重试");
            }
            Err(err) => {
                warn!(error = %err, retry_secs = retry.as_secs(), "token 刷新失败，稍后重试");
                retry
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!("已停止");
    Ok(())
}
