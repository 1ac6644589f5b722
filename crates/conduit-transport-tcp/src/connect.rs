//! # connect 模块说明
//!
//! ## 意图（Why）
//! - 一个主机名可能解析出多个地址（双栈），异步建连需要在后台逐个尝试；
//!   这里把“远端 × 本地”的双层循环显式化为游标与阶段枚举，挂起时保存游标，
//!   恢复时从下一组合继续，已尝试过的组合不会重复。
//!
//! ## 逻辑（How）
//! - 外层遍历远端候选，内层遍历本地候选，地址族不一致的组合直接跳过；
//! - 每个组合：关闭上一个套接字，打开新套接字，异步时设为非阻塞，尽力开启
//!   `SO_REUSEADDR`，绑定本地地址，发起连接；
//! - 异步且 `EINPROGRESS`：进入 [`ConnectPhase::WaitingWritable`] 并返回
//!   [`ConnectOutcome::Pending`]；其余失败记录错误后推进游标；
//! - [`ConnectAttempt::resume`] 读取在途套接字的 `SO_ERROR` 决定成功或继续。
//!
//! ## 契约（What）
//! - 任一时刻最多一个在途套接字；
//! - 全部组合失败时报告最后记录的错误，从未真正尝试时为 `EHOSTUNREACH`；
//! - 失败后最后一个套接字仍保留，供 `-sockname` 等查询使用。

use std::io;
use std::net::SocketAddr;

use conduit_core::error::CoreError;
use conduit_core::errno;
use tracing::{debug, trace};

use crate::backend::{SocketBackend, clone_error, in_progress};
use crate::config::TcpClientConfig;
use crate::resolver::{AddressResolver, Purpose};

/// 内核缓冲下限。
pub(crate) const SOCKET_BUFFER_SIZE: usize = 4096;

/// 建连阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectPhase {
    /// 候选已就绪，尚未开始尝试。
    Idle,
    /// 正在产生候选列表。
    Resolving,
    /// 正在同步地逐个尝试组合。
    Attempting,
    /// 异步连接已发起，等待套接字可写。
    WaitingWritable,
    Connected,
    Failed,
}

/// 一次推进的结果。
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected,
    Pending,
    Failed(io::Error),
}

/// 建连状态。
pub struct ConnectAttempt<B: SocketBackend> {
    remote: Vec<SocketAddr>,
    local: Vec<SocketAddr>,
    remote_cursor: usize,
    local_cursor: usize,
    socket: Option<B::Socket>,
    current: Option<SocketAddr>,
    last_error: io::Error,
    phase: ConnectPhase,
    asynchronous: bool,
    attempts: usize,
}

impl<B: SocketBackend> std::fmt::Debug for ConnectAttempt<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectAttempt")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("remote_cursor", &self.remote_cursor)
            .field("local_cursor", &self.local_cursor)
            .field("phase", &self.phase)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl<B: SocketBackend> ConnectAttempt<B> {
    pub fn new(remote: Vec<SocketAddr>, local: Vec<SocketAddr>, asynchronous: bool) -> Self {
        Self {
            remote,
            local,
            remote_cursor: 0,
            local_cursor: 0,
            socket: None,
            current: None,
            last_error: errno::errno_error(libc::EHOSTUNREACH),
            phase: ConnectPhase::Idle,
            asynchronous,
            attempts: 0,
        }
    }

    /// 按客户端配置解析远端与本地候选。
    pub fn resolve(resolver: &AddressResolver, config: &TcpClientConfig) -> Result<Self, CoreError> {
        let mut attempt = Self::new(Vec::new(), Vec::new(), config.is_async());
        attempt.phase = ConnectPhase::Resolving;
        attempt.remote = resolver.resolve_port(Some(config.host()), config.port(), Purpose::Connect)?;
        attempt.local =
            resolver.resolve_port(config.my_addr(), config.my_port(), Purpose::ClientBind)?;
        attempt.phase = ConnectPhase::Idle;
        trace!(
            remote = attempt.remote.len(),
            local = attempt.local.len(),
            "connect candidates prepared"
        );
        Ok(attempt)
    }

    pub fn phase(&self) -> ConnectPhase {
        self.phase
    }

    pub fn is_async(&self) -> bool {
        self.asynchronous
    }

    /// 已执行的组合尝试次数（含被挂起的那次）。
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn last_error(&self) -> &io::Error {
        &self.last_error
    }

    /// 当前或最后一次尝试的远端地址。
    pub fn current_remote(&self) -> Option<SocketAddr> {
        self.current
    }

    pub fn socket(&self) -> Option<&B::Socket> {
        self.socket.as_ref()
    }

    /// 取走在途或最终的套接字。
    pub fn take_socket(&mut self) -> Option<B::Socket> {
        self.socket.take()
    }

    /// 从头开始尝试。
    pub fn begin(&mut self, backend: &B) -> ConnectOutcome {
        self.remote_cursor = 0;
        self.local_cursor = 0;
        self.run(backend)
    }

    /// 在途套接字就绪后继续；非等待状态下只返回当前结果。
    pub fn resume(&mut self, backend: &B) -> ConnectOutcome {
        if self.phase != ConnectPhase::WaitingWritable {
            return self.outcome();
        }
        let status = match self.socket.as_ref() {
            Some(socket) => backend.take_error(socket),
            None => Ok(Some(errno::errno_error(libc::ENOTCONN))),
        };
        match status {
            Ok(None) => {
                debug!(remote = ?self.current, attempt = self.attempts, "async connect established");
                self.phase = ConnectPhase::Connected;
                ConnectOutcome::Connected
            }
            Ok(Some(error)) | Err(error) => {
                trace!(remote = ?self.current, %error, "async connect attempt failed");
                self.last_error = error;
                self.run(backend)
            }
        }
    }

    fn outcome(&self) -> ConnectOutcome {
        match self.phase {
            ConnectPhase::Connected => ConnectOutcome::Connected,
            ConnectPhase::Failed => ConnectOutcome::Failed(clone_error(&self.last_error)),
            _ => ConnectOutcome::Pending,
        }
    }

    fn run(&mut self, backend: &B) -> ConnectOutcome {
        self.phase = ConnectPhase::Attempting;
        while self.remote_cursor < self.remote.len() {
            let remote = self.remote[self.remote_cursor];
            while self.local_cursor < self.local.len() {
                let local = self.local[self.local_cursor];
                self.local_cursor += 1;
                if local.is_ipv4() != remote.is_ipv4() {
                    continue;
                }
                self.attempts += 1;
                self.current = Some(remote);
                match self.try_pair(backend, &remote, &local) {
                    Ok(()) => {
                        debug!(%remote, %local, attempt = self.attempts, "connected");
                        self.phase = ConnectPhase::Connected;
                        return ConnectOutcome::Connected;
                    }
                    Err(error) if self.asynchronous && in_progress(&error) => {
                        trace!(%remote, attempt = self.attempts, "connect in progress");
                        self.phase = ConnectPhase::WaitingWritable;
                        return ConnectOutcome::Pending;
                    }
                    Err(error) => {
                        trace!(%remote, %local, %error, attempt = self.attempts, "connect attempt failed");
                        self.last_error = error;
                    }
                }
            }
            self.local_cursor = 0;
            self.remote_cursor += 1;
        }
        debug!(attempts = self.attempts, error = %self.last_error, "connect candidates exhausted");
        self.phase = ConnectPhase::Failed;
        ConnectOutcome::Failed(clone_error(&self.last_error))
    }

    fn try_pair(&mut self, backend: &B, remote: &SocketAddr, local: &SocketAddr) -> io::Result<()> {
        self.socket = None;
        let socket = backend.open(remote)?;
        backend.set_minimum_buffers(&socket, SOCKET_BUFFER_SIZE);
        if self.asynchronous {
            backend.set_nonblocking(&socket, true)?;
        }
        let _ = backend.set_reuse_address(&socket, true);
        let socket = self.socket.insert(socket);
        backend.bind(socket, local)?;
        backend.connect(socket, remote)
    }
}
