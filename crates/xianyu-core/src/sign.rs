//! mtop 接口签名。
//!
//! 签名串格式：`{token}&{t}&{appKey}&{data}`，对 UTF-8 字节做 MD5，输出小写十六进制。
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

/// 签名用 appKey（平台常量，同时作为请求 query 中的 `appKey`）。
pub const SIGN_APP_KEY: &str = "34839810";

/// 计算请求签名。
///
/// 参数：
/// - `timestamp`：毫秒时间戳（与 query 中的 `t` 完全一致）
/// - `token`：`_m_h5_tk` 的前缀部分，可为空串
/// - `payload`：表单 `data` 字段的原始 JSON 文本
///
/// 返回值：
/// - 32 位小写十六进制摘要；纯函数，相同输入恒得相同输出
pub fn sign(timestamp: &str, token: &str, payload: &str) -> String {
    let msg = format!("{token}&{timestamp}&{SIGN_APP_KEY}&{payload}");
    format!("{:x}", md5::compute(msg.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_matches_md5_of_joined_fields() {
        let expected = format!("{:x}", md5::compute(b"tok&1700000000000&34839810&{}"));
        assert_eq!(sign("1700000000000", "tok", "{}"), expected);
    }

    #[test]
    fn sign_is_deterministic() {
        let a = sign("1", "token", r#"{"itemId":"1"}"#);
        let b = sign("1", "token", r#"{"itemId":"1"}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn every_input_changes_the_digest() {
        let base = sign("1700000000000", "ABCDEF", r#"{"itemId":"42"}"#);
        assert_ne!(base, sign("1700000000001", "ABCDEF", r#"{"itemId":"42"}"#));
        assert_ne!(base, sign("1700000000000", "ABCDEG", r#"{"itemId":"42"}"#));
        assert_ne!(base, sign("1700000000000", "ABCDEF", r#"{"itemId":"43"}"#));
    }

    #[test]
    fn empty_token_still_signs() {
        let expected = format!("{:x}", md5::compute(b"&1&34839810&x"));
        assert_eq!(sign("1", "", "x"), expected);
    }
}
