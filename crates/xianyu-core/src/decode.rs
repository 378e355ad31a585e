//! 推送消息载荷解码管线。
//!
//! 平台下发的消息体是一段“看起来像 Base64”的字符串，实际内容可能是：
//! - MessagePack 编码的结构化数据（最常见）
//! - 直接的 UTF-8 文本
//! - 无法识别的原始字节
//!
//! 解码按固定顺序逐级降级，每一级都是纯函数，可单独测试：
//! 1) [`sanitize`]：去掉 Base64 字母表之外的字符并补齐 `=`
//! 2) [`decode_base64`]：失败即返回 [`DecodedPayload::Error`]
//! 3) [`unpack`]：MessagePack 解码（严格越界检查，必须恰好消费完整个缓冲区）
//! 4) [`normalize`]：转换为 JSON 兼容树
//! 5) UTF-8 文本 → [`DecodedPayload::Text`]
//! 6) 十六进制 → [`DecodedPayload::Hex`]
//!
//! [`decode`] 永不失败：任何错误都会变成带标签的降级结果，避免一条坏消息拖垮长连接循环。
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// 宽松的 Base64 引擎：允许末尾多余比特，不强制补齐规则。
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// 最大嵌套深度，防止恶意载荷耗尽栈空间。
const MAX_DEPTH: usize = 256;

/// 解码结果。
///
/// 序列化格式：
/// - 使用 `#[serde(tag = "kind")]`，例如 `{"kind":"text","value":"..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedPayload {
    /// MessagePack 解码成功。
    Structured { value: Value },
    /// 不是 MessagePack，但字节是合法 UTF-8。
    Text { value: String },
    /// 既不是 MessagePack 也不是 UTF-8，以小写十六进制返回原始字节。
    Hex { value: String, detail: String },
    /// Base64 解码失败，原样带回输入。
    Error { detail: String, raw_data: String },
}

impl DecodedPayload {
    /// 结构化结果的引用（其他分支返回 `None`）。
    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            DecodedPayload::Structured { value } => Some(value),
            _ => None,
        }
    }

    /// 取出结构化结果（其他分支返回 `None`）。
    pub fn into_structured(self) -> Option<Value> {
        match self {
            DecodedPayload::Structured { value } => Some(value),
            _ => None,
        }
    }

    /// 结果种类，与序列化时的 `kind` 字段一致。
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedPayload::Structured { .. } => "structured",
            DecodedPayload::Text { .. } => "text",
            DecodedPayload::Hex { .. } => "hex",
            DecodedPayload::Error { .. } => "error",
        }
    }
}

/// 单级解码错误（只在管线内部流转，最终会被折叠为降级结果）。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Base64 解码失败: {0}")]
    Base64(String),
    #[error("数据意外结束: 偏移 {offset} 处需要 {needed} 字节，剩余 {remaining} 字节")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("未知的格式字节: 0x{0:02x}")]
    UnknownTag(u8),
    #[error("字符串不是合法 UTF-8")]
    InvalidUtf8,
    #[error("解码完成后仍有 {0} 字节未消费")]
    TrailingBytes(usize),
    #[error("嵌套层级超过上限")]
    TooDeep,
}

/// MessagePack 解码出的中间值（保留 bin 与非字符串键，留给 [`normalize`] 处理）。
#[derive(Debug, Clone, PartialEq)]
pub enum Packed {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Packed>),
    Map(Vec<(Packed, Packed)>),
}

/// 解码入口，总是返回结果。
pub fn decode(opaque: &str) -> DecodedPayload {
    let cleaned = sanitize(opaque);
    let bytes = match decode_base64(&cleaned) {
        Ok(bytes) => bytes,
        Err(e) => {
            return DecodedPayload::Error {
                detail: e.to_string(),
                raw_data: opaque.to_string(),
            }
        }
    };

    let err = match unpack(&bytes) {
        Ok(packed) => {
            return DecodedPayload::Structured {
                value: normalize(packed),
            }
        }
        Err(e) => e,
    };

    match String::from_utf8(bytes) {
        Ok(text) => DecodedPayload::Text { value: text },
        Err(e) => DecodedPayload::Hex {
            value: hex::encode(e.as_bytes()),
            detail: err.to_string(),
        },
    }
}

/// 只保留 `A-Z a-z 0-9 + / =`，并用 `=` 补齐到 4 的倍数。
pub fn sanitize(raw: &str) -> String {
    let mut cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect();
    while cleaned.len() % 4 != 0 {
        cleaned.push('=');
    }
    cleaned
}

/// 标准字母表 Base64 解码（宽松模式）。
pub fn decode_base64(cleaned: &str) -> Result<Vec<u8>, DecodeError> {
    LENIENT
        .decode(cleaned.as_bytes())
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

/// 将整个缓冲区解码为一个 MessagePack 值。
///
/// 异常处理：
/// - 任何读取越界返回 `UnexpectedEof`（不会静默截断）
/// - 未知格式字节返回 `UnknownTag`
/// - 解码完一个值后仍有剩余字节返回 `TrailingBytes`
pub fn unpack(bytes: &[u8]) -> Result<Packed, DecodeError> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let value = reader.value(0)?;
    let rest = reader.remaining();
    if rest > 0 {
        return Err(DecodeError::TrailingBytes(rest));
    }
    Ok(value)
}

/// 转换为 JSON 兼容树。
///
/// 规则：
/// - bin：合法 UTF-8 则转文本，否则转 Base64
/// - map 键：字符串原样；其余类型转成文本
/// - NaN/无穷大等无法用 JSON 数字表示的浮点数转成文本
pub fn normalize(packed: Packed) -> Value {
    match packed {
        Packed::Nil => Value::Null,
        Packed::Bool(b) => Value::Bool(b),
        Packed::Int(i) => Value::from(i),
        Packed::UInt(u) => Value::from(u),
        Packed::Float(f) => Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        Packed::Str(s) => Value::String(s),
        Packed::Bin(bytes) => Value::String(bin_to_text(bytes)),
        Packed::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Packed::Map(pairs) => {
            let mut map = Map::with_capacity(pairs.len());
            for (k, v) in pairs {
                map.insert(key_to_string(k), normalize(v));
            }
            Value::Object(map)
        }
    }
}

fn bin_to_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => STANDARD.encode(e.as_bytes()),
    }
}

fn key_to_string(key: Packed) -> String {
    match key {
        Packed::Str(s) => s,
        Packed::Int(i) => i.to_string(),
        Packed::UInt(u) => u.to_string(),
        Packed::Bool(b) => b.to_string(),
        Packed::Nil => "null".to_string(),
        Packed::Float(f) => f.to_string(),
        Packed::Bin(bytes) => bin_to_text(bytes),
        other => normalize(other).to_string(),
    }
}

/// 带游标的只读缓冲区。
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        if needed > self.remaining() {
            return Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.fixed::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.fixed()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.fixed()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.fixed()?))
    }

    fn str(&mut self, len: usize) -> Result<Packed, DecodeError> {
        let bytes = self.take(len)?;
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(Packed::Str(text.to_string()))
    }

    fn bin(&mut self, len: usize) -> Result<Packed, DecodeError> {
        Ok(Packed::Bin(self.take(len)?.to_vec()))
    }

    fn array(&mut self, count: usize, depth: usize) -> Result<Packed, DecodeError> {
        // 每个元素至少占 1 字节，按剩余长度限制预分配
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(self.value(depth + 1)?);
        }
        Ok(Packed::Array(items))
    }

    fn map(&mut self, count: usize, depth: usize) -> Result<Packed, DecodeError> {
        let mut pairs = Vec::with_capacity(count.min(self.remaining() / 2));
        for _ in 0..count {
            let key = self.value(depth + 1)?;
            let value = self.value(depth + 1)?;
            pairs.push((key, value));
        }
        Ok(Packed::Map(pairs))
    }

    fn value(&mut self, depth: usize) -> Result<Packed, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }
        let tag = self.u8()?;
        match tag {
            0x00..=0x7f => Ok(Packed::Int(i64::from(tag))),
            0x80..=0x8f => self.map(usize::from(tag & 0x0f), depth),
            0x90..=0x9f => self.array(usize::from(tag & 0x0f), depth),
            0xa0..=0xbf => self.str(usize::from(tag & 0x1f)),
            0xc0 => Ok(Packed::Nil),
            0xc2 => Ok(Packed::Bool(false)),
            0xc3 => Ok(Packed::Bool(true)),
            0xc4 => {
                let len = self.u8()?;
                self.bin(usize::from(len))
            }
            0xc5 => {
                let len = self.u16()?;
                self.bin(usize::from(len))
            }
            0xc6 => {
                let len = self.u32()?;
                self.bin(len as usize)
            }
            0xca => Ok(Packed::Float(f64::from(f32::from_be_bytes(self.fixed()?)))),
            0xcb => Ok(Packed::Float(f64::from_be_bytes(self.fixed()?))),
            0xcc => Ok(Packed::UInt(u64::from(self.u8()?))),
            0xcd => Ok(Packed::UInt(u64::from(self.u16()?))),
            0xce => Ok(Packed::UInt(u64::from(self.u32()?))),
            0xcf => Ok(Packed::UInt(self.u64()?)),
            0xd0 => Ok(Packed::Int(i64::from(i8::from_be_bytes(self.fixed()?)))),
            0xd1 => Ok(Packed::Int(i64::from(i16::from_be_bytes(self.fixed()?)))),
            0xd2 => Ok(Packed::Int(i64::from(i32::from_be_bytes(self.fixed()?)))),
            0xd3 => Ok(Packed::Int(i64::from_be_bytes(self.fixed()?))),
            0xd9 => {
                let len = self.u8()?;
                self.str(usize::from(len))
            }
            0xda => {
                let len = self.u16()?;
                self.str(usize::from(len))
            }
            0xdb => {
                let len = self.u32()?;
                self.str(len as usize)
            }
            0xdc => {
                let count = self.u16()?;
                self.array(usize::from(count), depth)
            }
            0xdd => {
                let count = self.u32()?;
                self.array(count as usize, depth)
            }
            0xde => {
                let count = self.u16()?;
                self.map(usize::from(count), depth)
            }
            0xdf => {
                let count = self.u32()?;
                self.map(count as usize, depth)
            }
            0xe0..=0xff => Ok(Packed::Int(i64::from(tag) - 256)),
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}
