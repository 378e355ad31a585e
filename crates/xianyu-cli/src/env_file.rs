//! `.env` 文件中的 Cookie 持久化。
//!
//! 说明：
//! - 只改写 `COOKIES_STR=` 所在的那一行，其余内容与换行保持原样
//! - 值写成单引号形式（Cookie 串含空格，未加引号时 dotenvy 无法解析）
//! - 文件或键不存在时仅告警，不新建文件也不追加键
//! - 启动时可从同一文件读回 `COOKIES_STR`（[`load_cookies`]），不修改进程环境变量
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use xianyu_core::cookies::CookieHook;

/// 被改写的环境变量名。
pub const COOKIES_KEY: &str = "COOKIES_STR";

/// 把 Cookie 变更写回 `.env` 的钩子。
#[derive(Debug, Clone)]
pub struct EnvFileHook {
    path: PathBuf,
}

impl EnvFileHook {
    /// 指向给定 `.env` 路径的钩子。
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 目标文件路径。
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, cookies: &str) -> std::io::Result<bool> {
        let content = std::fs::read_to_string(&self.path)?;
        let Some(updated) = rewrite_cookies_line(&content, cookies) else {
            return Ok(false);
        };
        std::fs::write(&self.path, updated)?;
        Ok(true)
    }
}

impl CookieHook for EnvFileHook {
    fn on_cookie_change(&self, serialized: &str) {
        if !self.path.exists() {
            warn!(path = %self.path.display(), "未找到 .env 文件，跳过 Cookie 持久化");
            return;
        }
        match self.persist(serialized) {
            Ok(true) => debug!(path = %self.path.display(), "已更新 .env 中的 COOKIES_STR"),
            Ok(false) => warn!(path = %self.path.display(), "未找到 COOKIES_STR 项，跳过 Cookie 持久化"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "写入 .env 失败"),
        }
    }
}

/// 从 `.env` 读取 `COOKIES_STR`。
///
/// 返回值：
/// - 文件不存在：`Ok(None)`
/// - 文件存在但没有该键或值为空：`Ok(None)`
///
/// 异常处理：
/// - 文件无法读取或某行无法解析时返回 dotenvy 的错误
pub fn load_cookies(path: &Path) -> Result<Option<String>, dotenvy::Error> {
    if !path.exists() {
        return Ok(None);
    }
    let mut first_error = None;
    for item in dotenvy::from_path_iter(path)? {
        match item {
            Ok((key, value)) if key == COOKIES_KEY => {
                return Ok(Some(value).filter(|v| !v.trim().is_empty()));
            }
            Ok(_) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    // 没找到键时，若有解析失败的行（可能正是 COOKIES_STR），报告第一处错误
    first_error.map_or(Ok(None), Err)
}

/// 按 dotenvy 的规则给值加引号：优先单引号（原样），值里有 `'` 时改用转义后的双引号。
fn quote_value(value: &str) -> String {
    if !value.contains('\'') {
        return format!("'{value}'");
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// 替换 `COOKIES_STR=` 行（值加引号）；没有该行时返回 `None`。
pub fn rewrite_cookies_line(content: &str, cookies: &str) -> Option<String> {
    let prefix = format!("{COOKIES_KEY}=");
    let quoted = quote_value(cookies);
    let mut found = false;
    let lines: Vec<String> = content
        .split('\n')
        .map(|line| {
            if line.trim_start().starts_with(&prefix) {
                found = true;
                let ending = if line.ends_with('\r') { "\r" } else { "" };
                format!("{prefix}{quoted}{ending}")
            } else {
                line.to_string()
            }
        })
        .collect();
    found.then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{prefix}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn rewrites_only_the_cookie_line() {
        let content = "API_KEY=abc\nCOOKIES_STR=old=1; x=2\nMODEL=qwen\n";
        let updated = rewrite_cookies_line(content, "new=2").unwrap();
        assert_eq!(updated, "API_KEY=abc\nCOOKIES_STR='new=2'\nMODEL=qwen\n");
    }

    #[test]
    fn keeps_crlf_line_endings() {
        let updated = rewrite_cookies_line("COOKIES_STR=a\r\nX=1\r\n", "b=2").unwrap();
        assert_eq!(updated, "COOKIES_STR='b=2'\r\nX=1\r\n");
    }

    #[test]
    fn value_with_single_quote_uses_escaped_double_quotes() {
        assert_eq!(quote_value("a=1; b=2"), "'a=1; b=2'");
        assert_eq!(quote_value(r#"a='x'; b="$y""#), r#""a='x'; b=\"\$y\"""#);
    }

    #[test]
    fn missing_key_yields_none() {
        assert!(rewrite_cookies_line("API_KEY=abc\n", "a=1").is_none());
        assert!(rewrite_cookies_line("MY_COOKIES_STR=1\n", "a=1").is_none());
    }

    #[test]
    fn hook_updates_env_file_in_place() {
        let dir = unique_temp_dir("xianyu-cli-env");
        let path = dir.join(".env");
        std::fs::write(&path, "COOKIES_STR=a=1\nOTHER=1\n").unwrap();

        EnvFileHook::new(&path).on_cookie_change("a=2; b=3");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "COOKIES_STR='a=2; b=3'\nOTHER=1\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_cookies_reads_back_what_the_hook_wrote() {
        let dir = unique_temp_dir("xianyu-cli-env-load");
        let path = dir.join(".env");
        assert_eq!(load_cookies(&path).unwrap(), None);

        std::fs::write(&path, "API_KEY=abc\nCOOKIES_STR=old=1\n").unwrap();
        EnvFileHook::new(&path).on_cookie_change("unb=1; _m_h5_tk=NEW_2");
        assert_eq!(
            load_cookies(&path).unwrap().as_deref(),
            Some("unb=1; _m_h5_tk=NEW_2")
        );

        std::fs::write(&path, "API_KEY=abc\n").unwrap();
        assert_eq!(load_cookies(&path).unwrap(), None);

        // 未加引号且含空格的旧写法无法解析，报错而不是当作缺失
        std::fs::write(&path, "COOKIES_STR=a=1; b=2\n").unwrap();
        assert!(load_cookies(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn hook_leaves_missing_file_and_missing_key_alone() {
        let dir = unique_temp_dir("xianyu-cli-env-missing");
        let path = dir.join(".env");

        EnvFileHook::new(&path).on_cookie_change("a=1");
        assert!(!path.exists());

        std::fs::write(&path, "OTHER=1\n").unwrap();
        EnvFileHook::new(&path).on_cookie_change("a=1");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "OTHER=1\n");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
