//! IM 长连接（LWP）帧构造与推送消息分类。
//!
//! 说明：
//! - 这里只负责“帧长什么样”和“收到的东西是什么”，不持有连接、不做重连
//! - 推送中的消息体通过 [`decode_sync_data`] 解码：先尝试明文 Base64 JSON，再走二进制解码管线
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::api::IM_APP_KEY;
use crate::decode::{decode, DecodedPayload};
use crate::ids::{generate_mid, generate_uuid};

/// 长连接地址。
pub const WS_URL: &str = "wss://wss-goofish.dingtalk.com/";

/// 注册帧中的 `ua`。
pub const WS_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 DingTalk(2.1.5) OS(Windows/10) Browser(Chrome/133.0.0.0) DingWeb/2.1.5 IMPaaS DingWeb/2.1.5";

const ACK_DIFF_MID: &str = "5701741704675979 0";

/// 注册帧（`/reg`），连接建立后第一帧。
pub fn registration_frame(token: &str, device_id: &str) -> Value {
    json!({
        "lwp": "/reg",
        "headers": {
            "cache-header": "app-key token ua wv",
            "app-key": IM_APP_KEY,
            "token": token,
            "ua": WS_USER_AGENT,
            "dt": "j",
            "wv": "im:3,au:3,sy:6",
            "sync": "0,0;0;0;",
            "did": device_id,
            "mid": generate_mid(),
        }
    })
}

/// 同步位点确认帧，注册完成后发送。
pub fn ack_diff_frame(now_ms: i64) -> Value {
    json!({
        "lwp": "/r/SyncStatus/ackDiff",
        "headers": { "mid": ACK_DIFF_MID },
        "body": [{
            "pipeline": "sync",
            "tooLong2Tag": "PNM,1",
            "channel": "sync",
            "topic": "sync",
            "highPts": 0,
            "pts": now_ms * 1000,
            "seq": 0,
            "timestamp": now_ms,
        }]
    })
}

/// 心跳帧，返回 `(mid, frame)`。
pub fn heartbeat_frame() -> (String, Value) {
    let mid = generate_mid();
    let frame = json!({ "lwp": "/!", "headers": { "mid": mid } });
    (mid, frame)
}

/// 针对收到的帧构造 ACK。
///
/// 返回值：
/// - 帧不带 `headers`：`None`
/// - 否则回显 `mid`（缺失时新生成）、`sid`（缺失时为空串），以及存在的 `app-key`/`ua`/`dt`
pub fn ack_frame(incoming: &Value) -> Option<Value> {
    let headers = incoming.get("headers")?.as_object()?;
    let mut ack = Map::new();
    ack.insert(
        "mid".into(),
        headers
            .get("mid")
            .cloned()
            .unwrap_or_else(|| Value::String(generate_mid())),
    );
    ack.insert(
        "sid".into(),
        headers
            .get("sid")
            .cloned()
            .unwrap_or_else(|| Value::String(String::new())),
    );
    for key in ["app-key", "ua", "dt"] {
        if let Some(v) = headers.get(key) {
            ack.insert(key.into(), v.clone());
        }
    }
    Some(json!({ "code": 200, "headers": ack }))
}

/// 文本消息发送帧。
///
/// 参数：
/// - `chat_id`：会话 ID（不带 `@goofish`）
/// - `to_id`：接收方用户 ID
/// - `my_id`：自己的用户 ID（`unb`）
pub fn send_text_frame(chat_id: &str, to_id: &str, my_id: &str, text: &str) -> Value {
    let content = json!({ "contentType": 1, "text": { "text": text } });
    let encoded = STANDARD.encode(content.to_string());
    json!({
        "lwp": "/r/MessageSend/sendByReceiverScope",
        "headers": { "mid": generate_mid() },
        "body": [
            {
                "uuid": generate_uuid(),
                "cid": format!("{chat_id}@goofish"),
                "conversationType": 1,
                "content": {
                    "contentType": 101,
                    "custom": { "type": 1, "data": encoded }
                },
                "redPointPolicy": 0,
                "extension": { "extJson": "{}" },
                "ctx": { "appVersion": "1.0", "platform": "web" },
                "mtags": {},
                "msgReadStatusSetting": 1
            },
            {
                "actualReceivers": [format!("{to_id}@goofish"), format!("{my_id}@goofish")]
            }
        ]
    })
}

/// 心跳响应：带 `headers.mid` 且 `code == 200`。
pub fn is_heartbeat_response(frame: &Value) -> bool {
    frame.get("headers").and_then(|h| h.get("mid")).is_some()
        && frame.get("code").and_then(Value::as_i64) == Some(200)
}

/// 取出同步包中第一条消息的 `data` 字段。
pub fn sync_data(frame: &Value) -> Option<&str> {
    frame
        .get("body")?
        .get("syncPushPackage")?
        .get("data")?
        .as_array()?
        .first()?
        .get("data")?
        .as_str()
}

/// 同步包消息体的解码结果。
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPayload {
    /// 明文 Base64 JSON（一般是系统通知，无需进一步处理）。
    Plain(Value),
    /// 经二进制解码管线得到的结果。
    Decoded(DecodedPayload),
}

/// 解码同步包消息体：先按明文 Base64 JSON 解析，失败再走解码管线。
pub fn decode_sync_data(data: &str) -> SyncPayload {
    let plain = STANDARD
        .decode(data)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|text| serde_json::from_str::<Value>(&text).ok());
    match plain {
        Some(value) => SyncPayload::Plain(value),
        None => SyncPayload::Decoded(decode(data)),
    }
}

/// 订单状态提醒。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// 等待买家付款。
    AwaitingPayment,
    /// 交易关闭。
    Closed,
    /// 等待卖家发货。
    AwaitingShipment,
}

impl OrderStatus {
    fn from_reminder(reminder: &str) -> Option<Self> {
        match reminder {
            "等待买家付款" => Some(OrderStatus::AwaitingPayment),
            "交易关闭" => Some(OrderStatus::Closed),
            "等待卖家发货" => Some(OrderStatus::AwaitingShipment),
            _ => None,
        }
    }
}

/// 归一化后的聊天消息（交给回复生成方）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub item_id: Option<String>,
    pub content: String,
    /// 消息创建时间（毫秒）。
    pub create_time: i64,
}

impl ChatMessage {
    /// 是否超过 `max_age_ms`（默认策略为 5 分钟）。
    pub fn is_expired(&self, now_ms: i64, max_age_ms: i64) -> bool {
        now_ms.saturating_sub(self.create_time) > max_age_ms
    }
}

/// 解码后的推送事件。
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Chat(ChatMessage),
    Order { status: OrderStatus, user_id: String },
    Typing,
    System,
    Other,
}

/// 对解码后的消息分类。
///
/// 判定顺序：订单提醒 → 输入状态 → 聊天（`needPush == "false"` 的聊天视为系统消息）→ 其他
pub fn classify(message: &Value) -> PushEvent {
    if let Some(event) = order_event(message) {
        return event;
    }
    if is_typing(message) {
        return PushEvent::Typing;
    }
    match chat_message(message) {
        Some(_) if is_system(message) => PushEvent::System,
        Some(chat) => PushEvent::Chat(chat),
        None => PushEvent::Other,
    }
}

fn order_event(message: &Value) -> Option<PushEvent> {
    let reminder = message.get("3")?.get("redReminder")?.as_str()?;
    let status = OrderStatus::from_reminder(reminder)?;
    let user_id = message
        .get("1")
        .and_then(Value::as_str)
        .and_then(|s| s.split('@').next())
        .unwrap_or_default()
        .to_string();
    Some(PushEvent::Order { status, user_id })
}

fn is_typing(message: &Value) -> bool {
    message
        .get("1")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|first| first.get("1"))
        .and_then(Value::as_str)
        .is_some_and(|s| s.contains("@goofish"))
}

fn is_system(message: &Value) -> bool {
    message
        .get("3")
        .and_then(|m| m.get("needPush"))
        .and_then(Value::as_str)
        == Some("false")
}

fn chat_message(message: &Value) -> Option<ChatMessage> {
    let body = message.get("1")?.as_object()?;
    let reminder = body.get("10")?.as_object()?;
    let content = reminder.get("reminderContent")?.as_str()?.to_string();
    let text = |v: Option<&Value>| match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let create_time = match body.get("5") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    };
    let item_id = reminder
        .get("reminderUrl")
        .and_then(Value::as_str)
        .and_then(|url| url.split_once("itemId="))
        .and_then(|(_, rest)| rest.split('&').next())
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let chat_id = text(body.get("2"))
        .split('@')
        .next()
        .unwrap_or_default()
        .to_string();

    Some(ChatMessage {
        chat_id,
        sender_id: text(reminder.get("senderUserId")),
        sender_name: text(reminder.get("reminderTitle")),
        item_id,
        content,
        create_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_json(need_push: &str) -> Value {
        json!({
            "1": {
                "2": "55667788@goofish",
                "5": 1700000000000i64,
                "10": {
                    "reminderContent": "还在吗？",
                    "reminderTitle": "买家小王",
                    "senderUserId": "1001",
                    "reminderUrl": "fleamarket://message_chat?itemId=889900&peerUserId=1001"
                }
            },
            "3": { "needPush": need_push }
        })
    }

    #[test]
    fn classifies_chat_message() {
        match classify(&chat_json("true")) {
            PushEvent::Chat(chat) => {
                assert_eq!(chat.chat_id, "55667788");
                assert_eq!(chat.sender_id, "1001");
                assert_eq!(chat.sender_name, "买家小王");
                assert_eq!(chat.item_id.as_deref(), Some("889900"));
                assert_eq!(chat.content, "还在吗？");
                assert_eq!(chat.create_time, 1_700_000_000_000);
                assert!(!chat.is_expired(1_700_000_100_000, 300_000));
                assert!(chat.is_expired(1_700_000_400_000, 300_000));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn extreme_create_time_does_not_overflow_expiry_check() {
        let mut message = chat_json("true");
        message["1"]["5"] = json!("-9223372036854775808");
        let PushEvent::Chat(chat) = classify(&message) else {
            panic!("expected chat");
        };
        assert_eq!(chat.create_time, i64::MIN);
        assert!(chat.is_expired(1_700_000_000_000, 300_000));

        let future = ChatMessage {
            create_time: i64::MAX,
            ..chat
        };
        assert!(!future.is_expired(i64::MIN, 300_000));
    }

    #[test]
    fn chat_with_need_push_false_is_system() {
        assert_eq!(classify(&chat_json("false")), PushEvent::System);
    }

    #[test]
    fn classifies_order_and_typing() {
        let order = json!({"1": "1001@goofish", "3": {"redReminder": "等待卖家发货"}});
        assert_eq!(
            classify(&order),
            PushEvent::Order {
                status: OrderStatus::AwaitingShipment,
                user_id: "1001".into()
            }
        );

        let typing = json!({"1": [{"1": "1001@goofish"}]});
        assert_eq!(classify(&typing), PushEvent::Typing);
        assert_eq!(classify(&json!({"foo": 1})), PushEvent::Other);
    }

    #[test]
    fn ack_echoes_known_headers() {
        let incoming = json!({"headers": {"mid": "m1", "app-key": "k", "dt": "j", "x": 1}});
        let ack = ack_frame(&incoming).unwrap();
        assert_eq!(ack["code"], 200);
        assert_eq!(ack["headers"], json!({"mid": "m1", "sid": "", "app-key": "k", "dt": "j"}));
        assert!(ack_frame(&json!({"code": 200})).is_none());
    }

    #[test]
    fn heartbeat_response_detection() {
        assert!(is_heartbeat_response(&json!({"code": 200, "headers": {"mid": "1"}})));
        assert!(!is_heartbeat_response(&json!({"code": 500, "headers": {"mid": "1"}})));
        assert!(!is_heartbeat_response(&json!({"code": 200})));
    }

    #[test]
    fn send_frame_carries_base64_text() {
        let frame = send_text_frame("c1", "u2", "me", "你好");
        let data = frame["body"][0]["content"]["custom"]["data"].as_str().unwrap();
        let decoded: Value = serde_json::from_slice(&STANDARD.decode(data).unwrap()).unwrap();
        assert_eq!(decoded, json!({"contentType": 1, "text": {"text": "你好"}}));
        assert_eq!(frame["body"][0]["cid"], "c1@goofish");
        assert_eq!(frame["body"][1]["actualReceivers"], json!(["u2@goofish", "me@goofish"]));
    }

    #[test]
    fn registration_frame_uses_im_app_key() {
        let frame = registration_frame("tok", "DEV");
        assert_eq!(frame["headers"]["app-key"], IM_APP_KEY);
        assert_eq!(frame["headers"]["token"], "tok");
        assert_eq!(frame["headers"]["did"], "DEV");
        assert_eq!(ack_diff_frame(5)["body"][0]["pts"], 5000);
    }

    #[test]
    fn sync_data_prefers_plain_json() {
        let frame = json!({"body": {"syncPushPackage": {"data": [{"data": "eyJhIjoxfQ=="}]}}});
        let data = sync_data(&frame).unwrap();
        assert_eq!(decode_sync_data(data), SyncPayload::Plain(json!({"a": 1})));

        // fixmap {"a": 1}
        let packed = STANDARD.encode([0x81, 0xa1, b'a', 0x01]);
        assert_eq!(
            decode_sync_data(&packed),
            SyncPayload::Decoded(DecodedPayload::Structured { value: json!({"a": 1}) })
        );
    }
}
