//! # listener 模块说明
//!
//! ## 意图（Why）
//! - 服务端通道可能同时监听多个本地地址（例如 IPv4 与 IPv6 通配），需要逐个候选打开、
//!   配置、绑定与监听，并在请求端口为 0 时让所有监听共享同一个临时端口。
//!
//! ## 逻辑（How）
//! - 第一个绑定成功的候选决定端口，后续候选原样复用；
//! - 复用端口时若遇到 `EADDRINUSE`，拆除本轮全部套接字从头重试，最多 10 轮；
//! - 失败按阶段 `Lookup < Socket < Bind < Listen` 记录，只保留到达最远阶段的首个错误。
//!
//! ## 契约（What）
//! - 至少一个候选成功即返回；全部失败时消息为 `couldn't open socket: <平台文案>`；
//! - 请求 `SO_REUSEPORT` 而平台不支持时立即失败，不再尝试其它候选。
//!
//! ## 风险与考量（Trade-offs）
//! - 重试轮次复用第一次解析出的候选列表，不再重新解析主机名。

use std::io;
use std::net::SocketAddr;

use conduit_core::error::{ChannelError, CoreError};
use conduit_core::errno;
use tracing::{debug, trace};

use crate::backend::SocketBackend;
use crate::connect::SOCKET_BUFFER_SIZE;
use crate::error::{self, REUSEPORT_UNSUPPORTED, map_io_error};
use crate::sys;

/// 临时端口冲突时的最大轮次。
pub const MAX_PORT_RETRIES: usize = 10;

/// 监听参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerOptions {
    /// 负数表示平台默认值。
    pub backlog: i32,
    pub reuse_addr: bool,
    pub reuse_port: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            backlog: -1,
            reuse_addr: true,
            reuse_port: false,
        }
    }
}

impl ListenerOptions {
    /// 实际传给 `listen` 的队列长度。
    pub fn effective_backlog(&self) -> i32 {
        if self.backlog < 0 {
            sys::default_backlog()
        } else {
            self.backlog
        }
    }
}

/// 一个已进入监听状态的套接字。
#[derive(Debug)]
pub struct Listening<S> {
    pub socket: S,
    pub addr: SocketAddr,
}

/// 失败阶段，越靠后越“远”。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Stage {
    Lookup,
    Socket,
    Bind,
    Listen,
}

#[derive(Debug)]
struct FarthestError {
    stage: Stage,
    error: Option<io::Error>,
}

impl FarthestError {
    fn record(&mut self, stage: Stage, error: io::Error) {
        if self.error.is_none() || stage > self.stage {
            trace!(?stage, %error, "listener stage failed");
            self.stage = stage;
            self.error = Some(error);
        }
    }
}

enum Round<S> {
    Done(Vec<Listening<S>>),
    Collision,
}

/// 为全部候选打开监听套接字。
pub fn open_listeners<B: SocketBackend>(
    backend: &B,
    candidates: &[SocketAddr],
    options: &ListenerOptions,
) -> Result<Vec<Listening<B::Socket>>, CoreError> {
    let ephemeral = candidates.first().is_some_and(|addr| addr.port() == 0);
    let backlog = options.effective_backlog();
    let mut failure = FarthestError {
        stage: Stage::Lookup,
        error: None,
    };

    for round in 1..=MAX_PORT_RETRIES {
        match open_round(backend, candidates, options, backlog, ephemeral, &mut failure)? {
            Round::Done(listeners) if !listeners.is_empty() => {
                debug!(
                    listeners = listeners.len(),
                    round,
                    "listening sockets ready"
                );
                return Ok(listeners);
            }
            Round::Done(_) => break,
            Round::Collision => {
                debug!(round, "ephemeral port taken on another family, retrying");
            }
        }
    }

    let error = failure
        .error
        .unwrap_or_else(|| errno::errno_error(libc::EADDRNOTAVAIL));
    Err(map_io_error(error::OPEN, error))
}

fn open_round<B: SocketBackend>(
    backend: &B,
    candidates: &[SocketAddr],
    options: &ListenerOptions,
    backlog: i32,
    ephemeral: bool,
    failure: &mut FarthestError,
) -> Result<Round<B::Socket>, CoreError> {
    let mut chosen_port: Option<u16> = None;
    let mut listeners = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let mut addr = *candidate;
        if ephemeral && let Some(port) = chosen_port {
            addr.set_port(port);
        }

        let socket = match backend.open(&addr) {
            Ok(socket) => socket,
            Err(err) => {
                failure.record(Stage::Socket, err);
                continue;
            }
        };
        backend.set_minimum_buffers(&socket, SOCKET_BUFFER_SIZE);
        if options.reuse_addr {
            let _ = backend.set_reuse_address(&socket, true);
        }
        if options.reuse_port
            && let Err(err) = backend.set_reuse_port(&socket, true)
            && err.kind() == io::ErrorKind::Unsupported
        {
            return Err(ChannelError::UnsupportedOption(REUSEPORT_UNSUPPORTED).into());
        }
        if addr.is_ipv6() {
            let _ = backend.set_only_v6(&socket, true);
        }

        if let Err(err) = backend.bind(&socket, &addr) {
            let collision = ephemeral && err.raw_os_error() == Some(libc::EADDRINUSE);
            failure.record(Stage::Bind, err);
            if collision {
                return Ok(Round::Collision);
            }
            continue;
        }
        if ephemeral && chosen_port.is_none() {
            chosen_port = backend.local_addr(&socket).ok().map(|bound| bound.port());
        }

        if let Err(err) = backend.listen(&socket, backlog) {
            let collision = ephemeral && err.raw_os_error() == Some(libc::EADDRINUSE);
            failure.record(Stage::Listen, err);
            if collision {
                return Ok(Round::Collision);
            }
            continue;
        }
        let _ = backend.set_nonblocking(&socket, true);
        let bound = backend.local_addr(&socket).unwrap_or(addr);
        trace!(addr = %bound, "listening");
        listeners.push(Listening {
            socket,
            addr: bound,
        });
    }
    Ok(Round::Done(listeners))
}
