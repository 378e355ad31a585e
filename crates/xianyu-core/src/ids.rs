//! 标识生成：设备 ID、消息 mid、消息 uuid、毫秒时间戳。
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

use rand::Rng;
use time::OffsetDateTime;
use uuid::Uuid;

/// 当前 UTC 毫秒时间戳。
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// 设备 ID：大写 UUID v4 + `-` + 用户 ID（`unb`）。
pub fn generate_device_id(user_id: &str) -> String {
    format!("{}-{user_id}", Uuid::new_v4().to_string().to_uppercase())
}

/// 长连接消息 mid：`{0..1000 随机数}{毫秒时间戳} 0`。
pub fn generate_mid() -> String {
    let random_part: u32 = rand::thread_rng().gen_range(0..1000);
    format!("{random_part}{} 0", now_millis())
}

/// 发送消息用的 uuid：`-{毫秒时间戳}1`。
pub fn generate_uuid() -> String {
    format!("-{}1", now_millis())
}
