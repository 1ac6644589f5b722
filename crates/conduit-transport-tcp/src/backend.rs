//! 套接字系统调用接缝。
//!
//! 建连状态机与监听管理器只通过 [`SocketBackend`] 触达操作系统，
//! 单元测试以脚本化的假后端驱动它们；[`SystemSockets`] 是基于 `socket2` 的真实实现。

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// 建连与监听所需的最小系统调用集合。
///
/// # 契约说明（What）
/// - `connect` 在非阻塞套接字上以 `EINPROGRESS` 表示“已发起、待完成”；
/// - `take_error` 读取并清除 `SO_ERROR`，`Ok(None)` 表示连接成功；
/// - `set_reuse_port` 在平台缺失该选项时返回 `ErrorKind::Unsupported`。
pub trait SocketBackend {
    type Socket: Send;

    /// 打开与 `addr` 同族的流式套接字（带 close-on-exec）。
    fn open(&self, addr: &SocketAddr) -> io::Result<Self::Socket>;

    fn set_nonblocking(&self, socket: &Self::Socket, nonblocking: bool) -> io::Result<()>;

    fn set_reuse_address(&self, socket: &Self::Socket, reuse: bool) -> io::Result<()>;

    fn set_reuse_port(&self, socket: &Self::Socket, reuse: bool) -> io::Result<()>;

    fn set_only_v6(&self, socket: &Self::Socket, only_v6: bool) -> io::Result<()>;

    /// 设置最小收发缓冲，失败忽略。
    fn set_minimum_buffers(&self, _socket: &Self::Socket, _size: usize) {}

    fn bind(&self, socket: &Self::Socket, addr: &SocketAddr) -> io::Result<()>;

    fn connect(&self, socket: &Self::Socket, addr: &SocketAddr) -> io::Result<()>;

    fn take_error(&self, socket: &Self::Socket) -> io::Result<Option<io::Error>>;

    fn listen(&self, socket: &Self::Socket, backlog: i32) -> io::Result<()>;

    fn local_addr(&self, socket: &Self::Socket) -> io::Result<SocketAddr>;
}

/// 基于 `socket2` 的系统后端。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSockets;

impl SocketBackend for SystemSockets {
    type Socket = Socket;

    fn open(&self, addr: &SocketAddr) -> io::Result<Socket> {
        Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
    }

    fn set_nonblocking(&self, socket: &Socket, nonblocking: bool) -> io::Result<()> {
        socket.set_nonblocking(nonblocking)
    }

    fn set_reuse_address(&self, socket: &Socket, reuse: bool) -> io::Result<()> {
        socket.set_reuse_address(reuse)
    }

    fn set_reuse_port(&self, socket: &Socket, reuse: bool) -> io::Result<()> {
        reuse_port(socket, reuse)
    }

    fn set_only_v6(&self, socket: &Socket, only_v6: bool) -> io::Result<()> {
        socket.set_only_v6(only_v6)
    }

    fn set_minimum_buffers(&self, socket: &Socket, size: usize) {
        set_minimum_buffers(socket, size);
    }

    fn bind(&self, socket: &Socket, addr: &SocketAddr) -> io::Result<()> {
        socket.bind(&SockAddr::from(*addr))
    }

    fn connect(&self, socket: &Socket, addr: &SocketAddr) -> io::Result<()> {
        socket.connect(&SockAddr::from(*addr))
    }

    fn take_error(&self, socket: &Socket) -> io::Result<Option<io::Error>> {
        socket.take_error()
    }

    fn listen(&self, socket: &Socket, backlog: i32) -> io::Result<()> {
        socket.listen(backlog)
    }

    fn local_addr(&self, socket: &Socket) -> io::Result<SocketAddr> {
        socket_addr(&socket.local_addr()?)
    }
}

#[cfg(not(any(
    target_os = "solaris",
    target_os = "illumos",
    target_os = "cygwin",
    target_os = "nuttx",
    target_os = "wasi"
)))]
fn reuse_port(socket: &Socket, reuse: bool) -> io::Result<()> {
    socket.set_reuse_port(reuse)
}

/// `socket2` 在这些平台上不提供 `SO_REUSEPORT`。
#[cfg(any(
    target_os = "solaris",
    target_os = "illumos",
    target_os = "cygwin",
    target_os = "nuttx",
    target_os = "wasi"
))]
fn reuse_port(_socket: &Socket, _reuse: bool) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// 把收发缓冲提升到至少 `size` 字节。
pub(crate) fn set_minimum_buffers(socket: &Socket, size: usize) {
    if socket.send_buffer_size().is_ok_and(|current| current < size) {
        let _ = socket.set_send_buffer_size(size);
    }
    if socket.recv_buffer_size().is_ok_and(|current| current < size) {
        let _ = socket.set_recv_buffer_size(size);
    }
}

/// `SockAddr` 转 `SocketAddr`；非 IP 地址族视为不支持。
pub(crate) fn socket_addr(addr: &SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Unsupported, "address family not supported")
    })
}

/// `EINPROGRESS`：非阻塞建连已发起。
pub(crate) fn in_progress(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::EINPROGRESS)
}

/// 复制一个 `io::Error`，保留 errno。
pub(crate) fn clone_error(error: &io::Error) -> io::Error {
    match error.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(error.kind(), error.to_string()),
    }
}
