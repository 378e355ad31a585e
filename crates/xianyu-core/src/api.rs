//! mtop 签名接口客户端。
//!
//! 单次调用的状态机：
//! - BUILDING：拼 query（含毫秒时间戳 `t`）、读取当前 token、计算签名
//! - SENT：发出表单 POST；网络错误/超时计为一次可重试失败
//! - SUCCESS：`ret` 中包含 `SUCCESS::调用成功`，返回原始 JSON
//! - RETRYABLE_FAILURE：其他结果；若响应带 `Set-Cookie` 则先去重 Cookie，再等待固定退避后回到 BUILDING
//! - REAUTH_REQUIRED：仅 token 接口，重试预算耗尽后做一次登录态检查（hasLogin）
//! - FATAL：登录态检查也耗尽，返回 [`ApiError::CredentialsInvalid`]
//!
//! 并发约定：
//! - 一个客户端只属于一个会话，方法均为 `&mut self`，调用天然串行
//! - 每次发送与退避等待都与取消令牌竞争，取消后立即返回 [`ApiError::Cancelled`]
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, RetryPolicy};
use crate::cookies::CookieStore;
use crate::error::{ApiError, ProtocolError, TransportError};
use crate::ids::now_millis;
use crate::sign::{sign, SIGN_APP_KEY};
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

/// 成功标记（`ret` 中任一条包含即视为成功）。
pub const SUCCESS_MARKER: &str = "SUCCESS::调用成功";
/// IM 应用 appKey（写在 token 接口的载荷中，不参与签名）。
pub const IM_APP_KEY: &str = "444e9908a51d1cb236a27862abc769c9";
/// 获取长连接 token 的接口。
pub const TOKEN_API: &str = "mtop.taobao.idlemessage.pc.login.token";
/// 商品详情接口。
pub const ITEM_API: &str = "mtop.taobao.idle.pc.detail";

const JSV: &str = "2.7.2";
const SPM_CNT: &str = "a21ybx.im.0.0";
const PLATFORM_TIMEOUT: &str = "20000";

/// 登录态处理方式（query 中的 `sessionOption`）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionOption {
    #[default]
    AutoLoginOnly,
}

impl SessionOption {
    /// query 中使用的取值。
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOption::AutoLoginOnly => "AutoLoginOnly",
        }
    }
}

/// 一次签名调用的描述。
///
/// 字段说明：
/// - `api`：接口名（同时出现在 URL 路径与 query 中）
/// - `version`：接口版本（`v`）
/// - `data`：表单 `data` 字段的 JSON 文本，签名按此文本原样计算
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub api: String,
    pub version: String,
    pub data: String,
    pub session_option: SessionOption,
}

impl ApiRequest {
    /// 以 JSON 载荷创建请求（版本固定为 `1.0`）。
    pub fn new(api: impl Into<String>, payload: &Value) -> Self {
        Self {
            api: api.into(),
            version: "1.0".to_string(),
            data: payload.to_string(),
            session_option: SessionOption::default(),
        }
    }

    /// 长连接 token 请求。
    pub fn token(device_id: &str) -> Self {
        Self::new(TOKEN_API, &json!({ "appKey": IM_APP_KEY, "deviceId": device_id }))
    }

    /// 商品详情请求。
    pub fn item(item_id: &str) -> Self {
        Self::new(ITEM_API, &json!({ "itemId": item_id }))
    }

    /// 拼接 query 参数（顺序与网页端一致）。
    pub fn query(&self, t: &str, signature: &str) -> Vec<(String, String)> {
        [
            ("jsv", JSV),
            ("appKey", SIGN_APP_KEY),
            ("t", t),
            ("sign", signature),
            ("v", self.version.as_str()),
            ("type", "originaljson"),
            ("accountSite", "xianyu"),
            ("dataType", "json"),
            ("timeout", PLATFORM_TIMEOUT),
            ("api", self.api.as_str()),
            ("sessionOption", self.session_option.as_str()),
            ("spm_cnt", SPM_CNT),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn url(&self, base: &str) -> String {
        format!("{}/h5/{}/{}/", base.trim_end_matches('/'), self.api, self.version)
    }
}

/// 接口返回的通用外壳：`ret` 状态串 + 可选 `data`。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResult {
    #[serde(default)]
    pub ret: Vec<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ApiResult {
    /// 从响应 JSON 提取（`ret` 中的非字符串元素被忽略）。
    pub fn from_body(body: &Value) -> Self {
        let ret = body
            .get("ret")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            ret,
            data: body.get("data").cloned(),
        }
    }

    /// 状态串列表。
    pub fn ret(&self) -> &[String] {
        &self.ret
    }

    /// 业务数据（可能缺失）。
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// 任一状态串包含成功标记即为成功。
    pub fn is_success(&self) -> bool {
        self.ret.iter().any(|r| r.contains(SUCCESS_MARKER))
    }
}

/// 解释响应体：只有 JSON 对象且带成功标记才算成功。
pub fn interpret(body: &str) -> Result<Value, ProtocolError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    let result = ApiResult::from_body(&value);
    if result.is_success() {
        Ok(value)
    } else {
        Err(ProtocolError::Failed { ret: result.ret })
    }
}

/// 从 token 接口响应中取 `data.accessToken`。
pub fn access_token(body: &Value) -> Option<&str> {
    body.get("data")?.get("accessToken")?.as_str()
}

/// 商品信息摘要（来自 `data.itemDO`）。
#[derive(Debug, Clone, PartialEq)]
pub struct ItemInfo {
    pub title: String,
    pub desc: String,
    /// 售价原样转成文本（平台有时给字符串，有时给数字）。
    pub sold_price: String,
    /// 完整的 `itemDO`，供上层缓存。
    pub raw: Value,
}

impl ItemInfo {
    /// 从商品详情响应中提取；缺少 `data.itemDO` 时返回 `None`。
    pub fn from_response(body: &Value) -> Option<Self> {
        let item = body.get("data")?.get("itemDO")?;
        if !item.is_object() {
            return None;
        }
        let text = |key: &str| match item.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Some(Self {
            title: text("title"),
            desc: text("desc"),
            sold_price: text("soldPrice"),
            raw: item.clone(),
        })
    }

    /// 给回复生成方使用的商品描述。
    pub fn describe(&self) -> String {
        format!("{};当前商品售卖价格为:{}", self.desc, self.sold_price)
    }
}

/// 签名接口客户端（一个会话一个实例）。
pub struct ApiClient<T = ReqwestTransport> {
    transport: T,
    cookies: CookieStore,
    config: ClientConfig,
    cancel: CancellationToken,
}

impl ApiClient<ReqwestTransport> {
    /// 用 reqwest 传输层创建客户端。
    ///
    /// 异常处理：
    /// - HTTP 客户端初始化失败时返回 [`TransportError`]
    pub fn with_reqwest(cookies: CookieStore, config: ClientConfig) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Ok(Self::new(transport, cookies, config))
    }
}

impl<T: Transport> ApiClient<T> {
    /// 用指定传输层创建客户端（自带一个独立的取消令牌）。
    pub fn new(transport: T, cookies: CookieStore, config: ClientConfig) -> Self {
        Self {
            transport,
            cookies,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// 绑定外部取消令牌（通常是会话任务的令牌）。
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 当前取消令牌的克隆，取消后进行中的请求与退避立即返回。
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 会话 Cookie（只读）。
    pub fn cookies(&self) -> &CookieStore {
        &self.cookies
    }

    /// 会话 Cookie（可写）。
    pub fn cookies_mut(&mut self) -> &mut CookieStore {
        &mut self.cookies
    }

    /// 客户端配置。
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 通用签名调用，按 `policy` 在预算内重试。
    ///
    /// 返回值：
    /// - 成功：完整响应 JSON
    /// - 预算耗尽：[`ApiError::RetriesExhausted`]，`last` 为最后一次失败原因
    /// - 取消：[`ApiError::Cancelled`]
    pub async fn call(&mut self, request: &ApiRequest, policy: RetryPolicy) -> Result<Value, ApiError> {
        let attempts = policy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(request).await {
                Ok(body) => {
                    debug!(api = %request.api, attempt, "接口调用成功");
                    return Ok(body);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= attempts => {
                    error!(api = %request.api, attempts, error = %err, "接口调用失败，重试次数过多");
                    return Err(ApiError::RetriesExhausted {
                        api: request.api.clone(),
                        attempts,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    warn!(api = %request.api, attempt, error = %err, "接口调用失败，稍后重试");
                    self.backoff(policy.backoff()).await?;
                }
            }
        }
    }

    /// 获取长连接 token（原始响应）。
    ///
    /// 异常处理：
    /// - 重试耗尽后进入登录态检查；检查通过则从第 0 次重新获取
    /// - 登录态检查耗尽：[`ApiError::CredentialsInvalid`]（致命）
    /// - 重新登录轮数用完仍拿不到 token：[`ApiError::AuthExpired`]
    pub async fn fetch_token(&mut self, device_id: &str) -> Result<Value, ApiError> {
        let request = ApiRequest::token(device_id);
        let mut cycles = 0;
        loop {
            match self.call(&request, self.config.token_retry).await {
                Ok(body) => return Ok(body),
                Err(ApiError::RetriesExhausted { attempts, last, .. }) => {
                    if cycles >= self.config.max_reauth_cycles {
                        error!(attempts, cycles, last = %last, "获取 token 失败，重新登录次数已用完");
                        return Err(ApiError::AuthExpired);
                    }
                    cycles += 1;
                    warn!(attempts, last = %last, "获取 token 失败，尝试重新登录");
                    self.reauthenticate().await?;
                    info!("重新登录成功，重新获取 token");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// 获取长连接 token 文本（`data.accessToken`）。
    pub async fn fetch_access_token(&mut self, device_id: &str) -> Result<String, ApiError> {
        let body = self.fetch_token(device_id).await?;
        access_token(&body)
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::MissingField("data.accessToken".into()).into())
    }

    /// 获取商品详情（原始响应）。不做重新登录，耗尽后返回非致命错误。
    pub async fn fetch_item(&mut self, item_id: &str) -> Result<Value, ApiError> {
        let request = ApiRequest::item(item_id);
        self.call(&request, self.config.api_retry).await
    }

    /// 登录态检查（hasLogin），在 `reauth_retry` 预算内重试。
    ///
    /// 返回值：
    /// - 通过：`Ok(())`，并对 Cookie 去重（触发持久化回调）
    /// - 预算耗尽：[`ApiError::CredentialsInvalid`]
    pub async fn reauthenticate(&mut self) -> Result<(), ApiError> {
        let policy = self.config.reauth_retry;
        let attempts = policy.attempts();
        for attempt in 1..=attempts {
            match self.login_attempt().await {
                Ok(true) => {
                    info!(attempt, "登录态有效");
                    self.cookies.dedupe();
                    return Ok(());
                }
                Ok(false) => warn!(attempt, "登录态检查未通过"),
                Err(ApiError::Cancelled) => return Err(ApiError::Cancelled),
                Err(err) => warn!(attempt, error = %err, "登录态检查请求失败"),
            }
            if attempt < attempts {
                self.backoff(policy.backoff()).await?;
            }
        }
        error!("重新登录失败，Cookie 已失效");
        Err(ApiError::CredentialsInvalid)
    }

    /// 单次签名请求：构造 → 签名 → 发送 → 解释。
    async fn attempt(&mut self, request: &ApiRequest) -> Result<Value, ApiError> {
        let t = now_millis().to_string();
        let token = self.cookies.current_token();
        let signature = sign(&t, &token, &request.data);
        let http = HttpRequest {
            url: request.url(&self.config.h5_base_url),
            query: request.query(&t, &signature),
            form: vec![("data".to_string(), request.data.clone())],
            cookie: self.cookies.snapshot_string(),
        };
        debug!(api = %request.api, token_len = token.len(), "发送签名请求");

        let response = self.send(http).await?;
        let refreshed = self.absorb_cookies(&response);
        match interpret(&response.body) {
            Ok(body) => Ok(body),
            Err(err) => {
                if refreshed {
                    info!(api = %request.api, "检测到 Set-Cookie，刷新 Cookie");
                    self.cookies.dedupe();
                }
                Err(err.into())
            }
        }
    }

    async fn login_attempt(&mut self) -> Result<bool, ApiError> {
        let cookie = |name: &str| self.cookies.get(name).unwrap_or_default().to_string();
        let form: Vec<(String, String)> = [
            ("hid", cookie("unb")),
            ("ltl", "true".into()),
            ("appName", "xianyu".into()),
            ("appEntrance", "web".into()),
            ("_csrf_token", cookie("XSRF-TOKEN")),
            ("umidToken", String::new()),
            ("hsiz", cookie("cookie2")),
            ("bizParams", "taobaoBizLoginFrom=web".into()),
            ("mainPage", "false".into()),
            ("isMobile", "false".into()),
            ("lang", "zh_CN".into()),
            ("returnUrl", String::new()),
            ("fromSite", "77".into()),
            ("isIframe", "true".into()),
            ("documentReferer", "https://www.goofish.com/".into()),
            ("defaultView", "hasLogin".into()),
            ("umidTag", "SERVER".into()),
            ("deviceId", cookie("cna")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let http = HttpRequest {
            url: format!(
                "{}/newlogin/hasLogin.do",
                self.config.passport_base_url.trim_end_matches('/')
            ),
            query: vec![
                ("appName".to_string(), "xianyu".to_string()),
                ("fromSite".to_string(), "77".to_string()),
            ],
            form,
            cookie: self.cookies.snapshot_string(),
        };

        let response = self.send(http).await?;
        self.absorb_cookies(&response);
        let body: Value = serde_json::from_str(&response.body)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Ok(body
            .get("content")
            .and_then(|c| c.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// 合并响应 Cookie，返回响应是否携带了 `Set-Cookie`。
    fn absorb_cookies(&mut self, response: &HttpResponse) -> bool {
        if response.set_cookies.is_empty() {
            return false;
        }
        self.cookies.ingest(&response.set_cookies);
        true
    }

    /// 发送请求：受请求超时约束，并可被取消。
    async fn send(&self, http: HttpRequest) -> Result<HttpResponse, ApiError> {
        let timeout = self.config.request_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ApiError::Cancelled),
            result = tokio::time::timeout(timeout, self.transport.post_form(http)) => match result {
                Ok(response) => response.map_err(ApiError::from),
                Err(_) => Err(TransportError::Timeout.into()),
            },
        }
    }

    async fn backoff(&self, delay: Duration) -> Result<(), ApiError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ApiError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpret_requires_success_marker() {
        let ok = interpret(r#"{"ret":["SUCCESS::调用成功"],"data":{"x":1}}"#).unwrap();
        assert_eq!(ok["data"]["x"], 1);

        let failed = interpret(r#"{"ret":["FAIL_SYS_TOKEN_EXOIRED::令牌过期"]}"#).unwrap_err();
        assert_eq!(
            failed,
            ProtocolError::Failed {
                ret: vec!["FAIL_SYS_TOKEN_EXOIRED::令牌过期".to_string()]
            }
        );

        assert_eq!(interpret("[1,2]").unwrap_err(), ProtocolError::NotAnObject);
        assert!(matches!(interpret("<html>"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(interpret("{}"), Err(ProtocolError::Failed { .. })));
    }

    #[test]
    fn success_marker_may_appear_in_any_ret_entry() {
        let result = ApiResult::from_body(&json!({"ret": [1, "x", "SUCCESS::调用成功 extra"]}));
        assert_eq!(result.ret(), ["x", "SUCCESS::调用成功 extra"]);
        assert!(result.data().is_none());
        assert!(result.is_success());
    }

    #[test]
    fn token_request_payload_and_query() {
        let request = ApiRequest::token("DEV-1");
        assert_eq!(
            request.data,
            r#"{"appKey":"444e9908a51d1cb236a27862abc769c9","deviceId":"DEV-1"}"#
        );
        let query = request.query("1700000000000", "abc");
        let keys: Vec<&str> = query.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            [
                "jsv", "appKey", "t", "sign", "v", "type", "accountSite", "dataType", "timeout", "api",
                "sessionOption", "spm_cnt"
            ]
        );
        assert!(query.contains(&("appKey".to_string(), "34839810".to_string())));
        assert!(query.contains(&("api".to_string(), TOKEN_API.to_string())));
        assert!(query.contains(&("sessionOption".to_string(), "AutoLoginOnly".to_string())));
        assert_eq!(
            request.url("https://h5api.m.goofish.com/"),
            "https://h5api.m.goofish.com/h5/mtop.taobao.idlemessage.pc.login.token/1.0/"
        );
    }

    #[test]
    fn item_request_payload() {
        assert_eq!(ApiRequest::item("123").data, r#"{"itemId":"123"}"#);
    }

    #[test]
    fn access_token_and_item_info_extraction() {
        let body = json!({"data": {"accessToken": "tok"}});
        assert_eq!(access_token(&body), Some("tok"));
        assert_eq!(access_token(&json!({"data": {}})), None);

        let body = json!({"data": {"itemDO": {"title": "相机", "desc": "九成新", "soldPrice": 1200}}});
        let info = ItemInfo::from_response(&body).unwrap();
        assert_eq!(info.sold_price, "1200");
        assert_eq!(info.describe(), "九成新;当前商品售卖价格为:1200");
        assert!(ItemInfo::from_response(&json!({"data": {}})).is_none());
    }
}
