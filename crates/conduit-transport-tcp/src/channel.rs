//! # channel 模块说明
//!
//! ## 意图（Why）
//! - [`TcpDriver`] 是 TCP 通道的驱动实现：客户端连接、服务端监听以及异步建连期间的
//!   全部特殊语义（缓存阻塞模式与事件兴趣、失败后伪造 `ENOTCONN`、测试模式）都收敛在这里，
//!   通用的缓冲与回调逻辑留给 [`Channel`]。
//!
//! ## 逻辑（How）
//! - 驱动状态 [`TcpState`] 放在 `Arc<Mutex<_>>` 中，由驱动与事件循环里的文件回调共享；
//!   文件回调只持有弱引用与登记时的纪元号，纪元不符（线程交接或已关闭）即丢弃；
//! - 需要向通道转发的事件先记在状态里，释放状态锁之后再派发，避免与通道锁交叉；
//! - 异步建连的推进统一走 [`TcpState::continue_connect`]，事件循环回调与读写前的
//!   “等待连接”共用同一路径。
//!
//! ## 契约（What）
//! - 通道名为 `sock<十六进制地址>`；
//! - 读取时 `ECONNRESET` 视为 EOF；
//! - 异步连接最终失败后，读写返回 `ENOTCONN`，真实原因可从 `-error` 读取一次；
//! - 服务端通道忽略 `watch`，其监听套接字只服务于接受回调。

use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use conduit_core::channel::{ChannelDriver, ChannelNotifier, Direction, ThreadAction};
use conduit_core::errno;
use conduit_core::error::{CoreError, DriverError};
use conduit_core::event::{self, FileHandler, Interest, Notifier};
use conduit_core::interp::AcceptHandler;
use conduit_core::options::{OptionContext, OptionListing};
use conduit_core::{Channel, ChannelMode};
use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, trace, warn};

use crate::backend::{self, SystemSockets};
use crate::connect::{ConnectAttempt, ConnectOutcome, SOCKET_BUFFER_SIZE};
use crate::options;

/// 驱动类型名。
pub const TCP_TYPE_NAME: &str = "tcp";

/// TCP 状态位。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TcpFlags(u8);

impl TcpFlags {
    /// 通道处于非阻塞模式。
    pub const NONBLOCKING: TcpFlags = TcpFlags(1);
    /// 异步建连尚未得出结论。
    pub const ASYNC_CONNECT: TcpFlags = TcpFlags(1 << 1);
    /// 建连回调已登记，等待重入。
    pub const ASYNC_PENDING: TcpFlags = TcpFlags(1 << 2);
    /// 异步建连最终失败。
    pub const ASYNC_FAILED: TcpFlags = TcpFlags(1 << 3);
    /// 测试模式：不在读写路径上自动推进建连。
    pub const TEST_MODE: TcpFlags = TcpFlags(1 << 4);

    pub fn has(self, flag: TcpFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn set(&mut self, flag: TcpFlags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: TcpFlags) {
        self.0 &= !flag.0;
    }

    pub fn assign(&mut self, flag: TcpFlags, on: bool) {
        if on {
            self.set(flag);
        } else {
            self.clear(flag);
        }
    }
}

/// 驱动状态。
pub(crate) struct TcpState {
    me: Weak<Mutex<TcpState>>,
    pub(crate) flags: TcpFlags,
    /// 客户端：已结束建连的唯一套接字；服务端：全部监听套接字。
    pub(crate) sockets: Vec<Socket>,
    pub(crate) attempt: Option<ConnectAttempt<SystemSockets>>,
    server: bool,
    interest: Interest,
    cached_watch: Interest,
    cached_blocking: bool,
    pub(crate) connect_error: Option<io::Error>,
    notifier: Arc<dyn Notifier>,
    channel: ChannelNotifier,
    epoch: u64,
    registered: Vec<RawFd>,
    accept: Option<Arc<Mutex<AcceptHandler>>>,
    forward: Interest,
}

impl TcpState {
    fn new(me: &Weak<Mutex<TcpState>>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            me: me.clone(),
            flags: TcpFlags::default(),
            sockets: Vec::new(),
            attempt: None,
            server: false,
            interest: Interest::NONE,
            cached_watch: Interest::NONE,
            cached_blocking: true,
            connect_error: None,
            notifier,
            channel: ChannelNotifier::detached(),
            epoch: 0,
            registered: Vec::new(),
            accept: None,
            forward: Interest::NONE,
        }
    }

    pub(crate) fn is_server(&self) -> bool {
        self.server
    }

    /// 客户端当前使用的套接字：建连中为在途套接字。
    pub(crate) fn client_socket(&self) -> Option<&Socket> {
        self.attempt
            .as_ref()
            .and_then(ConnectAttempt::socket)
            .or_else(|| self.sockets.first())
    }

    /// 读写与选项使用的主描述符。
    pub(crate) fn primary_fd(&self) -> Option<RawFd> {
        self.client_socket().map(AsRawFd::as_raw_fd)
    }

    fn register(&mut self, fd: RawFd, mask: Interest, handler: FileHandler) {
        self.notifier.create_file_handler(fd, mask, handler);
        if !self.registered.contains(&fd) {
            self.registered.push(fd);
        }
    }

    fn unregister(&mut self, fd: RawFd) {
        if let Some(index) = self.registered.iter().position(|entry| *entry == fd) {
            self.registered.swap_remove(index);
            self.notifier.delete_file_handler(fd);
        }
    }

    fn unregister_all(&mut self) {
        for fd in std::mem::take(&mut self.registered) {
            self.notifier.delete_file_handler(fd);
        }
    }

    /// 为在途套接字登记建连回调。
    fn register_connect_handler(&mut self) {
        let Some(fd) = self.primary_fd() else {
            return;
        };
        let handler = connect_handler(self.me.clone(), self.epoch);
        self.register(fd, Interest::WRITABLE | Interest::EXCEPTION, handler);
        self.flags.set(TcpFlags::ASYNC_PENDING);
    }

    /// 为全部监听套接字登记接受回调。
    fn register_accept_handlers(&mut self) {
        let fds: Vec<RawFd> = self.sockets.iter().map(AsRawFd::as_raw_fd).collect();
        for (index, fd) in fds.into_iter().enumerate() {
            let handler = accept_handler(self.me.clone(), self.epoch, index);
            self.register(fd, Interest::READABLE, handler);
        }
    }

    /// 登记通道兴趣；服务端忽略，建连中仅缓存。
    pub(crate) fn watch(&mut self, mask: Interest) {
        if self.server {
            return;
        }
        if self.flags.has(TcpFlags::ASYNC_PENDING) {
            self.cached_watch = mask;
            return;
        }
        let Some(fd) = self.primary_fd() else {
            return;
        };
        if mask.is_empty() {
            self.interest = Interest::NONE;
            self.unregister(fd);
        } else {
            self.interest = mask;
            let handler = notify_handler(self.me.clone(), self.epoch);
            // 只关心可写时也需监听可读，才能察觉对端关闭或出错。
            self.register(fd, mask | Interest::READABLE, handler);
        }
    }

    /// 建连回调重入：读取在途结果，必要时推进到下一候选。
    pub(crate) fn continue_connect(&mut self) {
        if !self.flags.has(TcpFlags::ASYNC_PENDING) {
            return;
        }
        self.flags.clear(TcpFlags::ASYNC_PENDING);
        if let Some(fd) = self.primary_fd() {
            self.unregister(fd);
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        match attempt.resume(&SystemSockets) {
            ConnectOutcome::Pending => self.register_connect_handler(),
            ConnectOutcome::Connected => self.finish_connect(None),
            ConnectOutcome::Failed(error) => self.finish_connect(Some(error)),
        }
    }

    /// 异步建连得出结论：恢复缓存的兴趣与阻塞模式，必要时转发可写事件。
    fn finish_connect(&mut self, error: Option<io::Error>) {
        if let Some(mut attempt) = self.attempt.take()
            && let Some(socket) = attempt.take_socket()
        {
            self.sockets = vec![socket];
        }
        self.flags.clear(TcpFlags::ASYNC_CONNECT);
        let cached_watch = self.cached_watch;
        self.watch(cached_watch);
        if let Some(socket) = self.sockets.first()
            && let Err(err) = socket.set_nonblocking(!self.cached_blocking)
        {
            warn!(error = %err, "restoring blocking mode after connect failed");
        }
        match &error {
            Some(err) => {
                debug!(error = %err, "async connect failed");
                self.flags.set(TcpFlags::ASYNC_FAILED);
            }
            None => debug!("async connect completed"),
        }
        self.connect_error = error;
        if !self.cached_blocking {
            self.forward |= Interest::WRITABLE;
        }
    }

    /// 检查异步建连进度。
    ///
    /// # 契约说明（What）
    /// - `report == true`：读写路径调用；失败返回 `ENOTCONN`，仍在进行返回 `EAGAIN`；
    ///   阻塞模式下一直等到得出结论；
    /// - `report == false`：后台查询调用，只做一次零超时探测，不报告错误。
    pub(crate) fn wait_for_connect(&mut self, report: bool) -> io::Result<()> {
        if report && self.flags.has(TcpFlags::ASYNC_FAILED) {
            return Err(errno::errno_error(libc::ENOTCONN));
        }
        if !self.flags.has(TcpFlags::ASYNC_PENDING) {
            return Ok(());
        }
        let blocking_wait = report && !self.flags.has(TcpFlags::NONBLOCKING);
        if self.flags.has(TcpFlags::TEST_MODE) && !blocking_wait {
            return Err(errno::errno_error(libc::EWOULDBLOCK));
        }
        let timeout = if blocking_wait {
            None
        } else {
            Some(Duration::ZERO)
        };
        loop {
            let Some(fd) = self.primary_fd() else {
                break;
            };
            match event::wait_for_fd(fd, Interest::WRITABLE | Interest::EXCEPTION, timeout) {
                Ok(ready) if !ready.is_empty() => self.continue_connect(),
                Ok(_) => {}
                Err(err) => {
                    trace!(fd, error = %err, "wait for connect failed");
                    break;
                }
            }
            if !blocking_wait || !self.flags.has(TcpFlags::ASYNC_CONNECT) {
                break;
            }
        }
        if report {
            if self.flags.has(TcpFlags::ASYNC_PENDING) {
                return Err(errno::errno_error(libc::EAGAIN));
            }
            if self.connect_error.is_some() {
                return Err(errno::errno_error(libc::ENOTCONN));
            }
        }
        Ok(())
    }

    /// 线程交接：`Remove` 拆除本线程登记，`Insert` 以新通知器重建。
    fn thread_action(&mut self, action: ThreadAction) {
        match action {
            ThreadAction::Remove => {
                self.unregister_all();
                self.epoch += 1;
                if self.flags.has(TcpFlags::ASYNC_CONNECT) {
                    self.flags.clear(TcpFlags::ASYNC_PENDING);
                }
                trace!(epoch = self.epoch, "tcp state detached from event loop");
            }
            ThreadAction::Insert(notifier) => {
                self.notifier = notifier;
                if self.server {
                    self.register_accept_handlers();
                } else if self.flags.has(TcpFlags::ASYNC_CONNECT) {
                    self.register_connect_handler();
                }
                trace!(epoch = self.epoch, "tcp state attached to event loop");
            }
        }
    }

    fn close(&mut self) {
        self.unregister_all();
        self.epoch += 1;
        self.attempt = None;
        self.sockets.clear();
        self.accept = None;
        self.flags = TcpFlags::default();
    }

    fn take_forward(&mut self) -> Option<(ChannelNotifier, Interest)> {
        let forward = std::mem::replace(&mut self.forward, Interest::NONE);
        (!forward.is_empty()).then(|| (self.channel.clone(), forward))
    }
}

/// 在状态锁内执行 `f`，释放锁后派发期间产生的转发事件。
pub(crate) fn with_state<R>(state: &Mutex<TcpState>, f: impl FnOnce(&mut TcpState) -> R) -> R {
    let (result, forward) = {
        let mut guard = state.lock();
        let result = f(&mut guard);
        (result, guard.take_forward())
    };
    if let Some((channel, mask)) = forward {
        channel.notify(mask);
    }
    result
}

fn connect_handler(state: Weak<Mutex<TcpState>>, epoch: u64) -> FileHandler {
    Box::new(move |_ready| {
        let Some(state) = state.upgrade() else {
            return;
        };
        with_state(&state, |state| {
            if state.epoch != epoch {
                trace!(epoch, current = state.epoch, "stale connect callback ignored");
                return;
            }
            state.continue_connect();
        });
    })
}

fn notify_handler(state: Weak<Mutex<TcpState>>, epoch: u64) -> FileHandler {
    Box::new(move |ready| {
        let Some(state) = state.upgrade() else {
            return;
        };
        let (channel, mask) = {
            let guard = state.lock();
            if guard.epoch != epoch {
                return;
            }
            let mut mask = ready & guard.interest;
            if mask.is_empty() {
                // 只登记了可写却报告可读：窥探一次，EOF 或错误按可写上报。
                let Some(socket) = guard.client_socket() else {
                    return;
                };
                if !peer_closed(socket) {
                    return;
                }
                mask = Interest::WRITABLE;
            }
            (guard.channel.clone(), mask)
        };
        channel.notify(mask);
    })
}

/// 非阻塞地窥探一个字节：对端已关闭或套接字出错时为真。
fn peer_closed(socket: &Socket) -> bool {
    let mut byte = [MaybeUninit::<u8>::uninit(); 1];
    match socket.recv_with_flags(&mut byte, libc::MSG_PEEK | libc::MSG_DONTWAIT) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => err.kind() != io::ErrorKind::WouldBlock,
    }
}

fn accept_handler(state: Weak<Mutex<TcpState>>, epoch: u64, index: usize) -> FileHandler {
    Box::new(move |_ready| {
        let Some(state) = state.upgrade() else {
            return;
        };
        let accepted = {
            let guard = state.lock();
            if guard.epoch != epoch {
                return;
            }
            let Some(listener) = guard.sockets.get(index) else {
                return;
            };
            match listener.accept() {
                Ok((socket, peer)) => Some((
                    socket,
                    peer,
                    Arc::clone(&guard.notifier),
                    guard.accept.clone(),
                )),
                Err(err) => {
                    trace!(error = %err, "accept returned no connection");
                    None
                }
            }
        };
        let Some((socket, peer, notifier, handler)) = accepted else {
            return;
        };
        let peer = match backend::socket_addr(&peer) {
            Ok(peer) => peer,
            Err(err) => {
                warn!(error = %err, "accepted connection with unsupported address");
                return;
            }
        };
        if let Err(err) = socket.set_nonblocking(false) {
            warn!(%peer, error = %err, "accepted socket left non-blocking");
        }
        let channel = client_channel(socket, notifier, ChannelMode::READ_WRITE);
        debug!(channel = channel.name(), %peer, "connection accepted");
        match handler {
            Some(handler) => {
                let mut guard = handler.lock();
                let callback: &mut AcceptHandler = &mut guard;
                callback(channel, peer.ip().to_string(), peer.port());
            }
            None => {
                if let Err(err) = channel.close() {
                    warn!(channel = channel.name(), error = %err, "closing unclaimed connection failed");
                }
            }
        }
    })
}

/// 形如 `sock55d0c8a4b2f0` 的通道名。
fn channel_name(state: &Arc<Mutex<TcpState>>) -> String {
    format!("sock{:x}", Arc::as_ptr(state).addr())
}

pub(crate) fn new_state(notifier: Arc<dyn Notifier>) -> Arc<Mutex<TcpState>> {
    Arc::new_cyclic(|me| Mutex::new(TcpState::new(me, notifier)))
}

/// 把已连接的套接字包装为通道。
pub(crate) fn client_channel(socket: Socket, notifier: Arc<dyn Notifier>, mode: ChannelMode) -> Channel {
    backend::set_minimum_buffers(&socket, SOCKET_BUFFER_SIZE);
    let state = new_state(notifier);
    state.lock().sockets.push(socket);
    let name = channel_name(&state);
    Channel::new(name, mode, Box::new(TcpDriver { state }))
}

/// 以建连状态创建客户端通道。
///
/// `outcome` 为首次推进的结果；`Pending` 时登记建连回调并缓存阻塞模式。
pub(crate) fn connecting_channel(
    mut attempt: ConnectAttempt<SystemSockets>,
    outcome: ConnectOutcome,
    notifier: Arc<dyn Notifier>,
    test_mode: bool,
) -> Result<Channel, io::Error> {
    let state = new_state(notifier);
    {
        let mut guard = state.lock();
        guard.flags.assign(TcpFlags::TEST_MODE, test_mode);
        match outcome {
            ConnectOutcome::Connected => {
                let socket = attempt
                    .take_socket()
                    .ok_or_else(|| errno::errno_error(libc::ENOTCONN))?;
                socket.set_nonblocking(false)?;
                guard.sockets.push(socket);
            }
            ConnectOutcome::Pending => {
                guard.flags.set(TcpFlags::ASYNC_CONNECT);
                guard.attempt = Some(attempt);
                guard.register_connect_handler();
            }
            ConnectOutcome::Failed(error) => return Err(error),
        }
    }
    let name = channel_name(&state);
    Ok(Channel::new(name, ChannelMode::READ_WRITE, Box::new(TcpDriver { state })))
}

/// 以监听套接字创建服务端通道。
pub(crate) fn server_channel(
    listeners: Vec<Socket>,
    notifier: Arc<dyn Notifier>,
    accept: AcceptHandler,
) -> Channel {
    let state = new_state(notifier);
    {
        let mut guard = state.lock();
        guard.server = true;
        guard.sockets = listeners;
        guard.accept = Some(Arc::new(Mutex::new(accept)));
        guard.register_accept_handlers();
    }
    let name = channel_name(&state);
    Channel::new(name, ChannelMode::NONE, Box::new(TcpDriver { state }))
}

/// TCP 通道驱动。
pub struct TcpDriver {
    state: Arc<Mutex<TcpState>>,
}

impl std::fmt::Debug for TcpDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TcpDriver")
            .field("server", &state.server)
            .field("flags", &state.flags)
            .field("sockets", &state.sockets.len())
            .finish()
    }
}

impl ChannelDriver for TcpDriver {
    fn type_name(&self) -> &'static str {
        TCP_TYPE_NAME
    }

    fn attach(&mut self, notifier: ChannelNotifier) {
        self.state.lock().channel = notifier;
    }

    fn input(&mut self, buf: &mut [u8]) -> Result<usize, DriverError> {
        with_state(&self.state, |state| {
            state.wait_for_connect(true)?;
            let socket = state
                .sockets
                .first()
                .ok_or_else(|| errno::errno_error(libc::ENOTCONN))?;
            let mut socket: &Socket = socket;
            match socket.read(buf) {
                Ok(n) => Ok(n),
                Err(err) if err.raw_os_error() == Some(libc::ECONNRESET) => {
                    trace!("connection reset treated as eof");
                    Ok(0)
                }
                Err(err) => Err(DriverError::io(err)),
            }
        })
    }

    fn output(&mut self, buf: &[u8]) -> Result<usize, DriverError> {
        with_state(&self.state, |state| {
            state.wait_for_connect(true)?;
            let socket = state
                .sockets
                .first()
                .ok_or_else(|| errno::errno_error(libc::ENOTCONN))?;
            let mut socket: &Socket = socket;
            socket.write(buf).map_err(DriverError::io)
        })
    }

    fn close(&mut self) -> io::Result<()> {
        with_state(&self.state, |state| {
            state.close();
            Ok(())
        })
    }

    fn close_half(&mut self, direction: Direction) -> io::Result<()> {
        let how = match direction {
            Direction::Read => Shutdown::Read,
            Direction::Write => Shutdown::Write,
        };
        with_state(&self.state, |state| {
            let socket = state
                .client_socket()
                .ok_or_else(|| errno::errno_error(libc::ENOTCONN))?;
            socket.shutdown(how)
        })
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        with_state(&self.state, |state| {
            state.flags.assign(TcpFlags::NONBLOCKING, !blocking);
            if state.flags.has(TcpFlags::ASYNC_PENDING) {
                state.cached_blocking = blocking;
                return Ok(());
            }
            if state.server {
                return Ok(());
            }
            match state.client_socket() {
                Some(socket) => socket.set_nonblocking(!blocking),
                None => Ok(()),
            }
        })
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<(), CoreError> {
        with_state(&self.state, |state| options::set_option(state, name, value))
    }

    fn get_option(
        &mut self,
        ctx: &OptionContext,
        name: Option<&str>,
    ) -> Result<OptionListing, CoreError> {
        with_state(&self.state, |state| options::get_option(state, ctx, name))
    }

    fn watch(&mut self, mask: Interest) {
        with_state(&self.state, |state| state.watch(mask));
    }

    fn handle(&self, _direction: Direction) -> Option<RawFd> {
        let state = self.state.lock();
        if state.server {
            state.sockets.first().map(AsRawFd::as_raw_fd)
        } else {
            state.primary_fd()
        }
    }

    fn thread_action(&mut self, action: ThreadAction) {
        with_state(&self.state, |state| state.thread_action(action));
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    use tracing_test::traced_test;

    use super::*;

    fn connected_pair() -> (TcpStream, Socket) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("临时监听");
        let client = TcpStream::connect(listener.local_addr().expect("本地地址")).expect("建连");
        let (accepted, _) = listener.accept().expect("接受");
        (client, Socket::from(accepted))
    }

    #[test]
    fn flags_toggle_independently() {
        let mut flags = TcpFlags::default();
        flags.set(TcpFlags::ASYNC_CONNECT);
        flags.set(TcpFlags::ASYNC_PENDING);
        flags.clear(TcpFlags::ASYNC_PENDING);
        assert!(flags.has(TcpFlags::ASYNC_CONNECT));
        assert!(!flags.has(TcpFlags::ASYNC_PENDING));
        flags.assign(TcpFlags::NONBLOCKING, true);
        assert!(flags.has(TcpFlags::NONBLOCKING));
        flags.assign(TcpFlags::NONBLOCKING, false);
        assert!(!flags.has(TcpFlags::NONBLOCKING));
    }

    #[test]
    fn channel_name_is_hex_address() {
        let state = new_state(conduit_core::EventLoop::new());
        let name = channel_name(&state);
        let digits = name.strip_prefix("sock").expect("应以 sock 开头");
        assert!(!digits.is_empty());
        assert!(digits.chars().all(|c| c.is_ascii_hexdigit()), "名字应为十六进制：{name}");
    }

    #[test]
    fn server_state_ignores_watch() {
        let event_loop = conduit_core::EventLoop::new();
        let state = new_state(event_loop.clone());
        with_state(&state, |state| {
            state.server = true;
            state.watch(Interest::READABLE);
        });
        assert!(event_loop.is_empty(), "服务端不应登记通道兴趣");
    }

    #[test]
    fn pending_connect_caches_watch_mask() {
        let event_loop = conduit_core::EventLoop::new();
        let state = new_state(event_loop.clone());
        with_state(&state, |state| {
            state.flags.set(TcpFlags::ASYNC_CONNECT);
            state.flags.set(TcpFlags::ASYNC_PENDING);
            state.watch(Interest::READABLE | Interest::WRITABLE);
            assert_eq!(state.cached_watch, Interest::READABLE | Interest::WRITABLE);
            assert_eq!(state.interest, Interest::NONE);
        });
        assert!(event_loop.is_empty());
    }

    #[test]
    fn failed_connect_reports_not_connected() {
        let state = new_state(conduit_core::EventLoop::new());
        with_state(&state, |state| {
            state.flags.set(TcpFlags::ASYNC_FAILED);
            let err = state.wait_for_connect(true).expect_err("应报告未连接");
            assert_eq!(err.raw_os_error(), Some(libc::ENOTCONN));
            assert!(state.wait_for_connect(false).is_ok(), "后台查询不报告错误");
        });
    }

    #[test]
    fn test_mode_refuses_to_progress_without_blocking_read() {
        let state = new_state(conduit_core::EventLoop::new());
        with_state(&state, |state| {
            state.flags.set(TcpFlags::ASYNC_CONNECT);
            state.flags.set(TcpFlags::ASYNC_PENDING);
            state.flags.set(TcpFlags::TEST_MODE);
            state.flags.set(TcpFlags::NONBLOCKING);
            let err = state.wait_for_connect(true).expect_err("测试模式应返回会阻塞");
            assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        });
    }

    #[test]
    fn peek_tells_idle_peer_from_closed_peer() {
        let (client, accepted) = connected_pair();
        assert!(!peer_closed(&accepted), "空闲连接不应判为关闭");

        drop(client);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !peer_closed(&accepted) {
            assert!(Instant::now() < deadline, "对端关闭后窥探应报告 EOF");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn peek_leaves_pending_bytes_unread() {
        let (mut client, accepted) = connected_pair();
        client.write_all(b"x").expect("写入");
        accepted
            .peek(&mut [MaybeUninit::uninit(); 1])
            .expect("等待数据到达");
        drop(client);
        assert!(!peer_closed(&accepted), "未读数据在前时不应判为关闭");
        let mut buf = [0u8; 4];
        let n = (&accepted).read(&mut buf).expect("读取");
        assert_eq!(&buf[..n], b"x", "窥探不得消费数据");
    }

    #[test]
    #[traced_test]
    fn unclaimed_connection_is_closed_after_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("临时监听");
        let addr = listener.local_addr().expect("本地地址");
        let state = new_state(conduit_core::EventLoop::new());
        with_state(&state, |state| {
            state.server = true;
            state.sockets.push(Socket::from(listener));
        });

        let mut client = TcpStream::connect(addr).expect("建连");
        let mut handler = accept_handler(Arc::downgrade(&state), 0, 0);
        handler(Interest::READABLE);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("设置读取超时");
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).expect("读取 EOF"), 0, "无人认领的连接应被关闭");
        assert!(logs_contain("connection accepted"));
        assert!(!logs_contain("closing unclaimed connection failed"));
    }
}
