//! # host 模块说明
//!
//! 进程级主机名缓存：首次访问时由系统调用计算一次，此后只读。
//!
//! - **意图 (Why)**：主机名查询可能触发 DNS，不应在每次调用时重复；同时避免可变全局量，
//!   由调用方显式持有 [`HostNameCache`] 句柄（通常是 [`HostNameCache::process`]）。
//! - **逻辑 (How)**：`uname` 节点名；若不含 `.`，尝试解析其规范名，规范名含 `.` 时采用；
//!   非 UTF-8 字节按有损方式转换。
//! - **契约 (What)**：计算失败时返回空串，不会重复尝试。

use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::sys;

/// 主机名缓存。
#[derive(Debug, Default)]
pub struct HostNameCache {
    name: OnceLock<String>,
}

static PROCESS_HOST_NAME: OnceLock<Arc<HostNameCache>> = OnceLock::new();

impl HostNameCache {
    pub const fn new() -> Self {
        Self {
            name: OnceLock::new(),
        }
    }

    /// 预置名字的缓存，便于测试与嵌入方覆盖。
    pub fn with_name(name: impl Into<String>) -> Self {
        let cache = Self::new();
        let _ = cache.name.set(name.into());
        cache
    }

    /// 进程级实例；每次返回同一个句柄。
    pub fn process() -> Arc<HostNameCache> {
        Arc::clone(PROCESS_HOST_NAME.get_or_init(|| Arc::new(HostNameCache::new())))
    }

    pub fn get(&self) -> &str {
        self.name.get_or_init(compute_host_name)
    }

    pub fn is_initialized(&self) -> bool {
        self.name.get().is_some()
    }
}

fn compute_host_name() -> String {
    let Some(node) = sys::node_name() else {
        return String::new();
    };
    let name = if node.contains('.') {
        node
    } else {
        match sys::canonical_name(&node) {
            Some(canonical) if canonical.contains('.') => canonical,
            _ => node,
        }
    };
    debug!(host = %name, "host name cached");
    name
}
