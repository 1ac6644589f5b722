//! # event 模块说明
//!
//! ## 意图（Why）
//! - 通道层不拥有事件循环，只通过 `create_file_handler` / `delete_file_handler` 两个入口登记兴趣；
//!   [`Notifier`] 即这条接缝，线程交接时驱动据此把登记从一个循环搬到另一个循环。
//! - [`EventLoop`] 是基于 `poll(2)` 的参考实现：水平触发，与 `select` 语义一致，
//!   每轮对每个就绪描述符至多派发一次。
//!
//! ## 契约（What）
//! - 处理器在派发期间可以删除或重新登记自身；派发前会重新核对登记代次，
//!   已删除或被替换的处理器不会再被调用。
//! - [`wait_for_fd`]：阻塞等待单个描述符就绪，`None` 表示无限期。

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{CoreError, codes};
use crate::sys;

/// 事件兴趣/就绪掩码。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(1 << 1);
    pub const EXCEPTION: Interest = Interest(1 << 2);

    pub const fn from_bits(bits: u8) -> Self {
        Interest(bits & 0b111)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `other` 的所有位均已置位。
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }

    fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.intersects(Interest::READABLE) {
            events |= libc::POLLIN;
        }
        if self.intersects(Interest::WRITABLE) {
            events |= libc::POLLOUT;
        }
        if self.intersects(Interest::EXCEPTION) {
            events |= libc::POLLPRI;
        }
        events
    }

    /// 错误与挂断条件同时视作可读与可写，和 `select` 的报告方式一致。
    fn from_poll_events(revents: libc::c_short) -> Self {
        let mut mask = Interest::NONE;
        let failure = revents & (libc::POLLERR | libc::POLLHUP) != 0;
        if revents & libc::POLLIN != 0 || failure {
            mask |= Interest::READABLE;
        }
        if revents & libc::POLLOUT != 0 || failure {
            mask |= Interest::WRITABLE;
        }
        if revents & libc::POLLPRI != 0 {
            mask |= Interest::EXCEPTION;
        }
        mask
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self::Output {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, rhs: Self) -> Self::Output {
        Interest(self.0 & rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.intersects(Interest::READABLE) {
            parts.push("READABLE");
        }
        if self.intersects(Interest::WRITABLE) {
            parts.push("WRITABLE");
        }
        if self.intersects(Interest::EXCEPTION) {
            parts.push("EXCEPTION");
        }
        if parts.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&parts.join("|"))
        }
    }
}

/// 描述符就绪回调，参数为实际就绪且已登记的掩码。
pub type FileHandler = Box<dyn FnMut(Interest) + Send>;

/// 事件循环登记接口。
///
/// # 教案式说明
/// - **意图 (Why)**：驱动只依赖这两个操作，便于在测试中替换为记录型实现，
///   也让线程交接只需换一个 `Arc<dyn Notifier>`。
/// - **契约 (What)**：对同一 `fd` 重复创建会替换旧处理器；删除不存在的登记是空操作。
pub trait Notifier: Send + Sync {
    fn create_file_handler(&self, fd: RawFd, mask: Interest, handler: FileHandler);

    fn delete_file_handler(&self, fd: RawFd);
}

struct Registration {
    mask: Interest,
    generation: u64,
    handler: Option<FileHandler>,
}

#[derive(Default)]
struct LoopTable {
    next_generation: u64,
    entries: HashMap<RawFd, Registration>,
}

/// 基于 `poll(2)` 的单线程就绪事件循环。
#[derive(Default)]
pub struct EventLoop {
    table: Mutex<LoopTable>,
}

impl EventLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 当前为 `fd` 登记的掩码。
    pub fn registered(&self, fd: RawFd) -> Option<Interest> {
        self.table.lock().entries.get(&fd).map(|entry| entry.mask)
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().entries.is_empty()
    }

    /// 执行一轮等待与派发，返回实际调用的处理器个数。
    ///
    /// # 执行逻辑（How）
    /// 1. 快照当前登记（fd、掩码、代次），无登记时直接返回 0，避免无限期阻塞；
    /// 2. `poll` 等待，`EINTR` 视为空轮；
    /// 3. 逐个就绪描述符：核对代次后取出处理器，释放表锁再调用，
    ///    调用结束后仅当登记未被删除或替换时放回。
    pub fn do_one_event(&self, timeout: Option<Duration>) -> Result<usize, CoreError> {
        let snapshot: Vec<(RawFd, Interest, u64)> = {
            let table = self.table.lock();
            table
                .entries
                .iter()
                .filter(|(_, entry)| !entry.mask.is_empty())
                .map(|(fd, entry)| (*fd, entry.mask, entry.generation))
                .collect()
        };
        if snapshot.is_empty() {
            return Ok(0);
        }

        let mut fds: Vec<libc::pollfd> = snapshot
            .iter()
            .map(|(fd, mask, _)| sys::pollfd(*fd, mask.to_poll_events()))
            .collect();
        match sys::poll_fds(&mut fds, timeout_millis(timeout)) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(CoreError::from_io(codes::EVENT_LOOP, "poll failed", err)),
        }

        let mut dispatched = 0;
        for (polled, (fd, mask, generation)) in fds.iter().zip(snapshot) {
            let ready = Interest::from_poll_events(polled.revents) & mask;
            if ready.is_empty() {
                continue;
            }
            let handler = {
                let mut table = self.table.lock();
                match table.entries.get_mut(&fd) {
                    Some(entry) if entry.generation == generation => entry.handler.take(),
                    _ => None,
                }
            };
            let Some(mut handler) = handler else {
                continue;
            };
            trace!(fd, ?ready, "dispatching file handler");
            handler(ready);
            dispatched += 1;

            let mut table = self.table.lock();
            if let Some(entry) = table.entries.get_mut(&fd)
                && entry.generation == generation
                && entry.handler.is_none()
            {
                entry.handler = Some(handler);
            }
        }
        Ok(dispatched)
    }
}

impl Notifier for EventLoop {
    fn create_file_handler(&self, fd: RawFd, mask: Interest, handler: FileHandler) {
        let mut table = self.table.lock();
        table.next_generation += 1;
        let generation = table.next_generation;
        trace!(fd, ?mask, generation, "create file handler");
        table.entries.insert(
            fd,
            Registration {
                mask,
                generation,
                handler: Some(handler),
            },
        );
    }

    fn delete_file_handler(&self, fd: RawFd) {
        if self.table.lock().entries.remove(&fd).is_some() {
            trace!(fd, "delete file handler");
        }
    }
}

fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(duration) => i32::try_from(duration.as_millis()).unwrap_or(i32::MAX),
    }
}

/// 阻塞等待单个描述符满足 `mask`，返回就绪掩码；超时返回空掩码。
pub fn wait_for_fd(fd: RawFd, mask: Interest, timeout: Option<Duration>) -> io::Result<Interest> {
    let mut fds = [sys::pollfd(fd, mask.to_poll_events())];
    loop {
        match sys::poll_fds(&mut fds, timeout_millis(timeout)) {
            Ok(0) => return Ok(Interest::NONE),
            Ok(_) => return Ok(Interest::from_poll_events(fds[0].revents) & mask),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn readable_handler_fires_once_per_pass() {
        let (mut left, right) = UnixStream::pair().expect("socketpair");
        let event_loop = EventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        event_loop.create_file_handler(
            right.as_raw_fd(),
            Interest::READABLE,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        left.write_all(b"x").expect("write");

        let dispatched = event_loop
            .do_one_event(Some(Duration::from_secs(1)))
            .expect("poll");
        assert_eq!(dispatched, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "每轮至多派发一次");
        // 水平触发：数据未读走时下一轮仍然就绪。
        event_loop
            .do_one_event(Some(Duration::from_secs(1)))
            .expect("poll");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn level_triggered_handler_refires_while_ready() {
        let (left, _right) = UnixStream::pair().expect("socketpair");
        let event_loop = EventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        event_loop.create_file_handler(
            left.as_raw_fd(),
            Interest::WRITABLE,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // 处理器什么也不做，描述符一直可写，每一轮都应再次派发。
        for pass in 1..=3 {
            event_loop
                .do_one_event(Some(Duration::from_secs(1)))
                .expect("poll");
            assert_eq!(hits.load(Ordering::SeqCst), pass);
        }
    }

    #[test]
    fn handler_may_delete_itself() {
        let (mut left, right) = UnixStream::pair().expect("socketpair");
        let event_loop = EventLoop::new();
        let fd = right.as_raw_fd();
        let weak = Arc::downgrade(&event_loop);
        event_loop.create_file_handler(
            fd,
            Interest::READABLE,
            Box::new(move |_| {
                if let Some(owner) = weak.upgrade() {
                    owner.delete_file_handler(fd);
                }
            }),
        );
        left.write_all(b"x").expect("write");
        event_loop
            .do_one_event(Some(Duration::from_secs(1)))
            .expect("poll");
        assert!(event_loop.registered(fd).is_none(), "自删除后不应被放回");
        assert_eq!(
            event_loop
                .do_one_event(Some(Duration::from_millis(10)))
                .expect("poll"),
            0
        );
    }

    #[test]
    fn wait_for_fd_reports_writable_socket() {
        let (left, _right) = UnixStream::pair().expect("socketpair");
        let ready = wait_for_fd(
            left.as_raw_fd(),
            Interest::WRITABLE,
            Some(Duration::from_secs(1)),
        )
        .expect("poll");
        assert!(ready.contains(Interest::WRITABLE));
    }
}
