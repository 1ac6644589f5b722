//! # options 模块说明
//!
//! ## 意图（Why）
//! - 各驱动的选项表共享同一套“名字匹配 / 布尔解析 / 列表渲染”规则，集中于此避免语义漂移。
//!
//! ## 契约（What）
//! - [`match_option`]：`-name` 形式，允许前缀缩写（至少一个字母），按候选顺序取首个命中；
//! - [`parse_boolean`]：接受整数与 `true/false/yes/no/on/off` 的唯一前缀，大小写不敏感；
//! - [`OptionValue`]：单值或列表，`Display` 输出解释器列表语法。

use std::fmt;

use crate::error::ChannelError;

/// 选项查询的上下文，由解释器状态计算得到。
#[derive(Clone, Copy, Debug)]
pub struct OptionContext {
    /// 为 `false` 时地址一律以数字形式呈现。
    pub reverse_dns: bool,
}

impl Default for OptionContext {
    fn default() -> Self {
        Self { reverse_dns: true }
    }
}

/// 选项值。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionValue {
    Text(String),
    List(Vec<String>),
}

impl OptionValue {
    pub fn flag(value: bool) -> Self {
        OptionValue::Text(if value { "1" } else { "0" }.to_owned())
    }

    pub fn empty() -> Self {
        OptionValue::Text(String::new())
    }

    /// 作为列表查看；单值视为单元素列表，空文本视为空列表。
    pub fn as_list(&self) -> Vec<&str> {
        match self {
            OptionValue::Text(text) if text.is_empty() => Vec::new(),
            OptionValue::Text(text) => vec![text.as_str()],
            OptionValue::List(items) => items.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Text(text) => f.write_str(text),
            OptionValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(|item| list_element(item)).collect();
                f.write_str(&rendered.join(" "))
            }
        }
    }
}

/// `(选项名, 值)` 的有序列表。
pub type OptionListing = Vec<(String, OptionValue)>;

/// 将完整选项表渲染为扁平的 `name value ...` 列表。
pub fn render_listing(listing: &[(String, OptionValue)]) -> String {
    listing
        .iter()
        .flat_map(|(name, value)| [list_element(name), list_element(&value.to_string())])
        .collect::<Vec<_>>()
        .join(" ")
}

/// 按列表语法转义单个元素。
pub fn list_element(text: &str) -> String {
    let needs_braces = text.is_empty()
        || text
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | '"' | ';' | '$' | '[' | ']' | '\\'));
    if needs_braces {
        format!("{{{text}}}")
    } else {
        text.to_owned()
    }
}

/// 在 `candidates`（不带 `-`）中查找 `name` 命中的选项。
pub fn match_option(name: &str, candidates: &[&'static str]) -> Option<&'static str> {
    let stem = name.strip_prefix('-')?;
    if stem.is_empty() {
        return None;
    }
    candidates
        .iter()
        .copied()
        .find(|candidate| candidate.starts_with(stem))
}

/// 解析解释器布尔值。
pub fn parse_boolean(text: &str) -> Result<bool, ChannelError> {
    let trimmed = text.trim();
    if let Ok(number) = trimmed.parse::<i64>() {
        return Ok(number != 0);
    }
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.is_empty() {
        return Err(ChannelError::InvalidBoolean(text.to_owned()));
    }
    const WORDS: [(&str, bool); 6] = [
        ("true", true),
        ("yes", true),
        ("on", true),
        ("false", false),
        ("no", false),
        ("off", false),
    ];
    let mut matches = WORDS.iter().filter(|(word, _)| word.starts_with(lowered.as_str()));
    match (matches.next(), matches.next()) {
        (Some((_, value)), None) => Ok(*value),
        _ => Err(ChannelError::InvalidBoolean(text.to_owned())),
    }
}
