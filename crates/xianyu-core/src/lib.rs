//! 闲鱼私有接口签名协议层（核心库，无 UI/存储依赖）。
//!
//! 功能：
//! - 请求签名（`_m_h5_tk` 令牌 + 时间戳 + appKey + 载荷 的 MD5 摘要）
//! - Cookie 会话存储：去重、令牌投影、变更回调
//! - 签名接口客户端：重试/重新登录状态机，可取消
//! - 二进制载荷解码：Base64 → MessagePack → 文本 → 十六进制 逐级降级
//! - 长连接（LWP）帧构造与推送消息分类
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

pub mod api;
pub mod config;
pub mod cookies;
pub mod decode;
pub mod error;
pub mod ids;
pub mod lwp;
pub mod sign;
pub mod transport;

pub use api::{ApiClient, ApiRequest, ApiResult, ItemInfo};
pub use config::{ClientConfig, RetryPolicy};
pub use cookies::{CookieHook, CookieStore};
pub use decode::{decode, DecodedPayload};
pub use error::{ApiError, ProtocolError, TransportError};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
