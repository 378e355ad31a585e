//! HTTP 传输层抽象。
//!
//! 说明：
//! - [`Transport`] 只负责“把一个表单 POST 发出去并带回原始响应”，不做任何业务判断
//! - Cookie 由调用方通过 `HttpRequest::cookie` 显式传入，响应中的 `Set-Cookie` 原样带回，
//!   由会话存储决定如何合并
//! - 平台会拒绝缺少浏览器指纹的请求，[`ReqwestTransport`] 默认附带一组固定的浏览器请求头
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, SET_COOKIE};
use tracing::debug;

use crate::error::TransportError;

/// 浏览器 User-Agent（与 `sec-ch-ua` 保持同一版本）。
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";

/// 固定的浏览器请求头。
const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept", "application/json"),
    ("accept-language", "zh-CN,zh;q=0.9"),
    ("cache-control", "no-cache"),
    ("origin", "https://www.goofish.com"),
    ("pragma", "no-cache"),
    ("priority", "u=1, i"),
    ("referer", "https://www.goofish.com/"),
    (
        "sec-ch-ua",
        "\"Not(A:Brand\";v=\"99\", \"Google Chrome\";v=\"133\", \"Chromium\";v=\"133\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"Windows\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-site"),
    ("user-agent", USER_AGENT),
];

/// 一次表单 POST 请求。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    /// 完整地址（不含 query）。
    pub url: String,
    /// query 参数（按顺序拼接）。
    pub query: Vec<(String, String)>,
    /// `application/x-www-form-urlencoded` 表单字段。
    pub form: Vec<(String, String)>,
    /// `Cookie` 请求头；为空则不发送。
    pub cookie: String,
}

impl HttpRequest {
    /// 读取某个 query 参数（测试与日志用）。
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 读取某个表单字段。
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// 原始响应。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// 所有 `Set-Cookie` 头的值（保持到达顺序）。
    pub set_cookies: Vec<String>,
    pub body: String,
}

/// 传输层接口。
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_form(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// 基于 reqwest 的默认实现。
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// 创建传输层。
    ///
    /// 参数：
    /// - `timeout`：单次请求上限，超时会映射为 [`TransportError::Timeout`]
    ///
    /// 异常处理：
    /// - reqwest 客户端初始化失败（TLS 后端不可用等）返回 `TransportError::Request`
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .default_headers(browser_headers())
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_form(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .query(&request.query)
            .form(&request.form);
        if !request.cookie.is_empty() {
            builder = builder.header(COOKIE, request.cookie.as_str());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let set_cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;

        debug!(
            url = %request.url,
            status,
            set_cookies = set_cookies.len(),
            body_len = body.len(),
            "收到响应"
        );
        Ok(HttpResponse {
            status,
            set_cookies,
            body,
        })
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(BROWSER_HEADERS.len());
    for &(name, value) in BROWSER_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    headers
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request(server: &MockServer) -> HttpRequest {
        HttpRequest {
            url: format!("{}/h5/mtop.test/1.0/", server.uri()),
            query: vec![("api".into(), "mtop.test".into()), ("t".into(), "1".into())],
            form: vec![("data".into(), r#"{"itemId":"1"}"#.into())],
            cookie: "unb=42".into(),
        }
    }

    #[tokio::test]
    async fn sends_browser_headers_cookie_and_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/h5/mtop.test/1.0/"))
            .and(query_param("api", "mtop.test"))
            .and(header("origin", "https://www.goofish.com"))
            .and(header("referer", "https://www.goofish.com/"))
            .and(header("cookie", "unb=42"))
            .and(body_string_contains("data=%7B%22itemId%22%3A%221%22%7D"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("set-cookie", "_m_h5_tk=NEW_1; Path=/")
                    .append_header("set-cookie", "cna=xyz")
                    .set_body_string(r#"{"ret":["SUCCESS::调用成功"]}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport.post_form(request(&server)).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.set_cookies, vec!["_m_h5_tk=NEW_1; Path=/", "cna=xyz"]);
        assert!(response.body.contains("SUCCESS"));
    }

    #[tokio::test]
    async fn slow_response_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_millis(50)).unwrap();
        let err = transport.post_form(request(&server)).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout);
    }

    #[test]
    fn browser_headers_are_complete() {
        let headers = browser_headers();
        assert_eq!(headers.len(), BROWSER_HEADERS.len());
        assert_eq!(headers["user-agent"], USER_AGENT);
    }
}
