//! # interp 模块说明
//!
//! ## 意图（Why）
//! - 通道层需要的解释器能力很少：一张通道表、几个变量（如反向 DNS 开关）、后台错误队列，
//!   以及“解释器先于监听器销毁”时的清理钩子。[`Interp`] 只建模这些。
//! - 监听器的接受回调记录对解释器是弱引用：解释器销毁时由 [`Interp::delete`] 主动遍历
//!   本解释器登记的全部 [`AcceptRecord`] 并清空其解释器字段，而不是依赖析构顺序。
//!
//! ## 契约（What）
//! - [`AcceptRecord::accept`]：解释器仍在时把新通道注册到其通道表并调用脚本回调，
//!   回调失败记入后台错误并注销通道；解释器已不在时直接关闭新通道。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::CoreError;
use crate::options::OptionContext;
use crate::registry::ChannelRegistry;

/// 存在即关闭反向 DNS 查询的变量名。
pub const NO_REVERSE_DNS_VAR: &str = "::tcl::unsupported::noReverseDNS";

static NEXT_INTERP_ID: AtomicU64 = AtomicU64::new(1);

/// 解释器标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterpId(u64);

/// 解释器上下文。
#[derive(Debug)]
pub struct Interp {
    id: InterpId,
    channels: ChannelRegistry,
    vars: DashMap<String, String>,
    background_errors: Mutex<Vec<CoreError>>,
    accept_records: Mutex<Vec<Weak<AcceptRecord>>>,
    deleted: AtomicBool,
}

impl Interp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: InterpId(NEXT_INTERP_ID.fetch_add(1, Ordering::Relaxed)),
            channels: ChannelRegistry::new(),
            vars: DashMap::new(),
            background_errors: Mutex::new(Vec::new()),
            accept_records: Mutex::new(Vec::new()),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> InterpId {
        self.id
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn set_var(&self, name: &str, value: impl Into<String>) {
        self.vars.insert(name.to_owned(), value.into());
    }

    pub fn unset_var(&self, name: &str) {
        self.vars.remove(name);
    }

    pub fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).map(|entry| entry.value().clone())
    }

    /// 根据当前变量计算选项查询上下文。
    pub fn option_context(&self) -> OptionContext {
        OptionContext {
            reverse_dns: !self.vars.contains_key(NO_REVERSE_DNS_VAR),
        }
    }

    /// 记录无法同步返回给调用方的错误。
    pub fn background_error(&self, error: CoreError) {
        warn!(interp = self.id.0, error = %error, "background error");
        self.background_errors.lock().push(error);
    }

    pub fn take_background_errors(&self) -> Vec<CoreError> {
        std::mem::take(&mut *self.background_errors.lock())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn track_accept_record(&self, record: &Arc<AcceptRecord>) {
        let mut records = self.accept_records.lock();
        records.retain(|weak| weak.strong_count() > 0);
        records.push(Arc::downgrade(record));
    }

    /// 当前仍存活的接受回调记录数。
    pub fn live_accept_records(&self) -> usize {
        self.accept_records
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// 销毁解释器：清空接受回调记录的解释器引用，并释放全部已注册通道。
    pub fn delete(&self) -> Result<(), CoreError> {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let records = std::mem::take(&mut *self.accept_records.lock());
        for record in records.iter().filter_map(Weak::upgrade) {
            record.detach();
        }
        debug!(interp = self.id.0, "interpreter deleted");
        self.channels.release_all()
    }
}

/// 脚本层接受回调：参数为解释器、新通道、对端主机与端口。
pub type AcceptScript =
    Box<dyn FnMut(&Arc<Interp>, &Channel, &str, u16) -> Result<(), CoreError> + Send>;

/// 监听器持有的通用接受回调。
pub type AcceptHandler = Box<dyn FnMut(Channel, String, u16) + Send>;

/// 一个监听器与登记它的解释器之间的关联。
pub struct AcceptRecord {
    interp: Mutex<Option<Weak<Interp>>>,
    script: Mutex<AcceptScript>,
}

impl std::fmt::Debug for AcceptRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptRecord")
            .field("attached", &self.interp().is_some())
            .finish()
    }
}

impl AcceptRecord {
    /// 创建记录并登记到解释器的清理表。
    pub fn new(interp: &Arc<Interp>, script: AcceptScript) -> Arc<Self> {
        let record = Arc::new(Self {
            interp: Mutex::new(Some(Arc::downgrade(interp))),
            script: Mutex::new(script),
        });
        interp.track_accept_record(&record);
        record
    }

    /// 仍然存活且未被销毁的解释器。
    pub fn interp(&self) -> Option<Arc<Interp>> {
        self.interp
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|interp| !interp.is_deleted())
    }

    /// 清空解释器引用。
    pub fn detach(&self) {
        self.interp.lock().take();
    }

    /// 处理一次新连接。
    pub fn accept(&self, channel: Channel, host: &str, port: u16) {
        let Some(interp) = self.interp() else {
            debug!(channel = channel.name(), "interpreter gone, closing accepted channel");
            if let Err(err) = channel.close() {
                warn!(channel = channel.name(), error = %err, "close of orphaned channel failed");
            }
            return;
        };
        interp.channels().register(&channel);
        let outcome = {
            let mut script = self.script.lock();
            (*script)(&interp, &channel, host, port)
        };
        if let Err(err) = outcome {
            interp.background_error(err);
            if let Err(err) = interp.channels().unregister(channel.name()) {
                warn!(channel = channel.name(), error = %err, "unregister after failed accept script");
            }
        }
    }

    /// 转换为监听器可直接持有的回调。
    pub fn into_handler(self: Arc<Self>) -> AcceptHandler {
        Box::new(move |channel, host, port| self.accept(channel, &host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn reverse_dns_follows_variable_presence() {
        let interp = Interp::new();
        assert!(interp.option_context().reverse_dns);
        interp.set_var(NO_REVERSE_DNS_VAR, "1");
        assert!(!interp.option_context().reverse_dns, "变量存在即关闭反向解析");
        interp.unset_var(NO_REVERSE_DNS_VAR);
        assert!(interp.option_context().reverse_dns);
    }

    #[test]
    #[traced_test]
    fn delete_detaches_every_accept_record() {
        let interp = Interp::new();
        let first = AcceptRecord::new(&interp, Box::new(|_, _, _, _| Ok(())));
        let second = AcceptRecord::new(&interp, Box::new(|_, _, _, _| Ok(())));
        assert_eq!(interp.live_accept_records(), 2);

        interp.delete().expect("delete");
        assert!(first.interp().is_none());
        assert!(second.interp().is_none());
        assert!(logs_contain("interpreter deleted"));
    }

    #[test]
    fn dropped_records_are_pruned() {
        let interp = Interp::new();
        let record = AcceptRecord::new(&interp, Box::new(|_, _, _, _| Ok(())));
        drop(record);
        assert_eq!(interp.live_accept_records(), 0);
    }
}
