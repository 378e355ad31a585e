//! Cookie 会话存储。
//!
//! 约定：
//! - 以 `Vec` 保存条目，下标即“最近出现顺序”（越靠后越新），不依赖哈希表的偶然迭代顺序
//! - `from_cookie_str` 与 `ingest` 都保证同名只留一条（最新值胜出）；`push_raw` 原样追加，可能产生同名重复
//! - `dedupe` 修复同名重复，并通过 [`CookieHook`] 通知外部持久化（本模块不做任何 IO）
//!
//! 作者：闲鱼助手项目组
//! 创建时间：2026-10-16
//! 修改时间：2026-10-16

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, info};

/// 携带签名令牌的 Cookie 名称。
pub const TOKEN_COOKIE: &str = "_m_h5_tk";

/// Cookie 变更回调（外部持久化钩子）。
///
/// 说明：
/// - 每次 [`CookieStore::dedupe`] 之后调用，参数为 [`CookieStore::snapshot_string`] 的结果
/// - 实现方自行决定写 `.env`、配置中心或直接忽略
pub trait CookieHook: Send + Sync {
    fn on_cookie_change(&self, serialized: &str);
}

impl<F> CookieHook for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_cookie_change(&self, serialized: &str) {
        self(serialized)
    }
}

/// 单个 Cookie 条目。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieEntry {
    pub name: String,
    pub value: String,
}

/// 一个会话独占的 Cookie 集合。
#[derive(Default)]
pub struct CookieStore {
    entries: Vec<CookieEntry>,
    hook: Option<Box<dyn CookieHook>>,
}

impl fmt::Debug for CookieStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 只输出名称，避免值进入日志
        let names: Vec<&str> = self.entries.iter().map(|e| e.name.as_str()).collect();
        f.debug_struct("CookieStore")
            .field("names", &names)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl CookieStore {
    /// 创建空存储（无钩子）。
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 `name=value; name=value` 形式的字符串创建。
    ///
    /// 说明：
    /// - 同名条目只保留最后出现的值，位置按其最后一次出现计算
    /// - 此时尚未设置钩子，不会触发持久化
    pub fn from_cookie_str(raw: &str) -> Self {
        let mut store = Self::new();
        for (name, value) in parse_cookie_str(raw) {
            store.push_raw(name, value);
        }
        store.collapse();
        store
    }

    /// 设置持久化钩子（替换已有钩子）。
    pub fn set_hook(&mut self, hook: impl CookieHook + 'static) {
        self.hook = Some(Box::new(hook));
    }

    /// 链式设置持久化钩子。
    pub fn with_hook(mut self, hook: impl CookieHook + 'static) -> Self {
        self.set_hook(hook);
        self
    }

    /// 原样追加条目（不去重），模拟传输层可能暴露的同名重复。
    pub fn push_raw(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(CookieEntry {
            name: name.into(),
            value: value.into(),
        });
    }

    /// 合并响应中的 `Set-Cookie` 头。
    ///
    /// 参数：
    /// - `headers`：每个元素为一条完整的 `Set-Cookie` 值
    ///
    /// 返回值：
    /// - 实际写入的条目数
    ///
    /// 异常处理：
    /// - 无法解析出 `name=value` 的条目直接跳过，不报错
    pub fn ingest<I, S>(&mut self, headers: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut written = 0;
        for header in headers {
            let Some((name, value)) = parse_set_cookie(header.as_ref()) else {
                debug!("忽略无法解析的 Set-Cookie");
                continue;
            };
            self.upsert(name, value);
            written += 1;
        }
        written
    }

    /// 同名覆盖：移除旧条目并把新值放到末尾。
    pub fn upsert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|e| e.name != name);
        self.entries.push(CookieEntry {
            name,
            value: value.into(),
        });
    }

    /// 修复同名重复：从最新往最旧遍历，每个名称只保留第一次遇到的条目。
    ///
    /// 说明：
    /// - 保留下来的条目维持其原有相对顺序
    /// - 无论是否真的删除了条目，都会调用持久化钩子
    ///
    /// 返回值：
    /// - 被移除的重复条目数
    pub fn dedupe(&mut self) -> usize {
        let removed = self.collapse();
        if removed > 0 {
            info!(removed, remaining = self.entries.len(), "已清理重复 Cookie");
        }
        if let Some(hook) = &self.hook {
            hook.on_cookie_change(&self.snapshot_string());
        }
        removed
    }

    /// 同名只保留最新条目，不触发钩子，返回移除数。
    fn collapse(&mut self) -> usize {
        let before = self.entries.len();
        let mut seen = HashSet::new();
        let mut kept: Vec<CookieEntry> = Vec::with_capacity(before);
        for entry in self.entries.drain(..).rev() {
            if seen.insert(entry.name.clone()) {
                kept.push(entry);
            }
        }
        kept.reverse();
        self.entries = kept;
        before - self.entries.len()
    }

    /// 读取某个 Cookie 的最新值。
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// 当前签名令牌：`_m_h5_tk` 值中第一个 `_` 之前的部分；缺失时为空串。
    pub fn current_token(&self) -> String {
        self.get(TOKEN_COOKIE)
            .and_then(|v| v.split('_').next())
            .unwrap_or_default()
            .to_string()
    }

    /// 序列化为 `name=value; name=value`（按当前顺序）。
    pub fn snapshot_string(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}={}", e.name, e.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// 当前全部条目（按出现顺序）。
    pub fn entries(&self) -> &[CookieEntry] {
        &self.entries
    }

    /// 条目数。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否没有任何条目。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 解析 `name=value; name=value` 字符串。
///
/// 说明：
/// - 以 `"; "` 分段，每段按第一个 `=` 切分；不含 `=` 的段被跳过
/// - 同名条目按出现顺序全部返回
pub fn parse_cookie_str(raw: &str) -> Vec<(String, String)> {
    raw.split("; ")
        .filter_map(|piece| piece.split_once('='))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// 取出单条 `Set-Cookie` 的 `name=value` 部分，忽略 Path/Domain/Expires 等属性。
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}
