//! # ChannelRegistry：解释器级通道表
//!
//! ## 核心意图（Why）
//! - 命令层只通过名字（如 `sock55d0c1a0`）引用通道；注册表负责名字到句柄的解析，
//!   并以引用计数决定通道何时真正关闭。
//!
//! ## 行为契约（What）
//! - `register`：同名重复注册是空操作；每次新注册为通道增加一个引用；
//! - `unregister`：移除条目并释放引用，引用归零时关闭通道；
//! - `lookup`：未命中返回 [`ChannelError::UnknownChannel`]；
//! - `names`：支持 `*`、`?` 通配的名字列表，按字典序返回。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` guard 不会跨越通道关闭调用，避免关闭回调再次访问注册表时死锁。

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::channel::Channel;
use crate::error::{ChannelError, CoreError};

/// 每个解释器一张的通道表。
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: DashMap<Arc<str>, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册通道。
    pub fn register(&self, channel: &Channel) {
        let name: Arc<str> = Arc::from(channel.name());
        match self.channels.entry(name) {
            Entry::Occupied(_) => {}
            Entry::Vacant(vacant) => {
                channel.retain();
                vacant.insert(channel.clone());
            }
        }
    }

    /// 注销通道并释放引用。
    pub fn unregister(&self, name: &str) -> Result<(), CoreError> {
        let removed = self.channels.remove(name).map(|(_, channel)| channel);
        match removed {
            Some(channel) => channel.release(),
            None => Err(ChannelError::UnknownChannel(name.to_owned()).into()),
        }
    }

    /// 按名字查找通道。
    pub fn lookup(&self, name: &str) -> Result<Channel, CoreError> {
        self.channels
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ChannelError::UnknownChannel(name.to_owned()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// 列出匹配 `pattern` 的通道名。
    pub fn names(&self, pattern: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .iter()
            .map(|entry| entry.key().to_string())
            .filter(|name| pattern.is_none_or(|pattern| glob_match(pattern, name)))
            .collect();
        names.sort();
        names
    }

    /// 注销全部通道，用于解释器销毁。返回首个关闭错误之外的全部条目都会被处理。
    pub fn release_all(&self) -> Result<(), CoreError> {
        let names: Vec<Arc<str>> = self.channels.iter().map(|entry| entry.key().clone()).collect();
        let mut first_error = None;
        for name in names {
            if let Err(err) = self.unregister(&name)
                && first_error.is_none()
            {
                first_error = Some(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// `*` 匹配任意串、`?` 匹配单字符的通配匹配。
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_handles_star_and_question_mark() {
        assert!(glob_match("sock*", "sock5f3a"));
        assert!(glob_match("s?ck*", "sock"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("sock?", "sock"));
        assert!(!glob_match("file*", "sock1"));
    }
}
