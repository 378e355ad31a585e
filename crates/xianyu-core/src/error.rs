//! 错误类型。
//!
//! 分类：
//! - [`TransportError`]：网络/超时，可重试
//! - [`ProtocolError`]：响应不是 JSON 对象或缺少成功标记，可重试（可能触发 Cookie 刷新）
//! - [`ApiError::AuthExpired`]：令牌接口重试耗尽，进入重新登录流程
//! - [`ApiError::CredentialsInvalid`]：重新登录也失败，致命，所属会话必须停止
//!
//! 解码失败不在此列：解码管线总是返回带标签的降级结果（见 `decode` 模块）。
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

use thiserror::Error;

/// 传输层错误。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("请求超时")]
    Timeout,
    #[error("网络请求失败: {0}")]
    Request(String),
    #[error("读取响应失败: {0}")]
    Body(String),
}

/// 协议层错误（平台返回了响应，但不是成功结果）。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("响应不是合法 JSON: {0}")]
    InvalidJson(String),
    #[error("响应不是 JSON 对象")]
    NotAnObject,
    #[error("接口调用失败: {ret:?}")]
    Failed { ret: Vec<String> },
    #[error("响应缺少字段: {0}")]
    MissingField(String),
}

/// 接口客户端对外暴露的错误。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// 重试预算耗尽（非致命，调用方可稍后再试）。
    #[error("{api} 重试 {attempts} 次后仍失败: {last}")]
    RetriesExhausted {
        api: String,
        attempts: u32,
        last: Box<ApiError>,
    },
    /// 令牌获取重试耗尽，需要重新登录。
    #[error("获取 token 失败，需要重新登录")]
    AuthExpired,
    /// 重新登录失败：凭据永久失效，需要外部提供新的 Cookie。
    #[error("Cookie 已失效，请更新 COOKIES_STR 后重启")]
    CredentialsInvalid,
    #[error("请求已取消")]
    Cancelled,
}

impl ApiError {
    /// 是否为致命错误（会话必须停止，不得继续使用旧凭据）。
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::CredentialsInvalid)
    }

    /// 单次尝试失败后是否值得在预算内重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Protocol(_))
    }
}

/// 配置错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("解析配置 JSON 失败: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("配置项不合法: {0}")]
    Invalid(String),
}
