//! 客户端配置。
//!
//! 约定：
//! - 所有字段都有默认值（`#[serde(default)]`），配置文件只需写要覆盖的项
//! - 重试次数与退避时间是对平台行为的经验值，因此暴露为配置而不是常量
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// mtop 网关默认地址。
pub const DEFAULT_H5_BASE_URL: &str = "https://h5api.m.goofish.com";
/// 登录态检查默认地址。
pub const DEFAULT_PASSPORT_BASE_URL: &str = "https://passport.goofish.com";

/// 重试策略。
///
/// 字段说明：
/// - `max_attempts`：总尝试次数（含首次），最小为 1
/// - `backoff_ms`：两次尝试之间的固定等待
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// 创建重试策略（`max_attempts` 为总尝试次数，`backoff_ms` 为两次尝试之间的固定等待）。
    pub const fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    /// 实际尝试次数（至少 1 次）。
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// 两次尝试之间的等待时长。
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 500)
    }
}

/// 签名客户端配置。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// mtop 网关地址（测试时可指向本地 mock）。
    pub h5_base_url: String,
    /// 登录态检查地址。
    pub passport_base_url: String,
    /// 单次 HTTP 请求上限（与 query 中的 `timeout=20000` 对应）。
    pub request_timeout_ms: u64,
    /// 商品等普通接口的重试策略。
    pub api_retry: RetryPolicy,
    /// token 接口的重试策略（耗尽后进入重新登录）。
    pub token_retry: RetryPolicy,
    /// 重新登录握手的重试策略（耗尽即致命）。
    pub reauth_retry: RetryPolicy,
    /// 一次 token 获取中允许的重新登录轮数。
    pub max_reauth_cycles: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            h5_base_url: DEFAULT_H5_BASE_URL.to_string(),
            passport_base_url: DEFAULT_PASSPORT_BASE_URL.to_string(),
            request_timeout_ms: 20_000,
            api_retry: RetryPolicy::new(3, 500),
            token_retry: RetryPolicy::new(3, 500),
            reauth_retry: RetryPolicy::new(2, 500),
            max_reauth_cycles: 1,
        }
    }
}

impl ClientConfig {
    /// 读取 JSON 配置文件。
    ///
    /// 异常处理：
    /// - 文件读取失败：`ConfigError::Io`
    /// - JSON 解析失败：`ConfigError::Parse`
    /// - 地址为空或超时为 0：`ConfigError::Invalid`
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        let config: ClientConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置：地址非空、请求超时大于 0。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.h5_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("h5_base_url 为空".into()));
        }
        if self.passport_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("passport_base_url 为空".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms 必须大于 0".into()));
        }
        Ok(())
    }

    /// 单次请求超时。
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{ "api_retry": { "max_attempts": 5, "backoff_ms": 10 } }"#).unwrap();
        assert_eq!(config.api_retry, RetryPolicy::new(5, 10));
        assert_eq!(config.token_retry, RetryPolicy::new(3, 500));
        assert_eq!(config.reauth_retry, RetryPolicy::new(2, 500));
        assert_eq!(config.h5_base_url, DEFAULT_H5_BASE_URL);
        assert_eq!(config.request_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, 0).attempts(), 1);
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let config = ClientConfig {
            request_timeout_ms: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
