//! TCP 通道选项的读取与设置。
//!
//! # 教案式说明
//! - **意图 (Why)**：选项值按需从套接字实时计算，只有读取即清除的 `SO_ERROR`
//!   被缓存在驱动状态中，避免第二次查询悄悄丢失错误；
//! - **逻辑 (How)**：每次查询前做一次不报告错误的建连探测，使 `-connecting`
//!   与地址类选项反映最新结论；建连未完成时地址类选项返回空值；
//! - **契约 (What)**：
//!   - 读取：`-error`、`-connecting`、`-peername`、`-sockname`、`-keepalive`、`-nodelay`；
//!     不带名字时列出 `-peername`、`-sockname`、`-keepalive`、`-nodelay`；
//!   - 单独读取 `-keepalive`/`-nodelay` 失败时报 `couldn't get socket option: <原因>`，
//!     列出全部选项时读不到的开关记为 `0`；
//!   - 设置：`-keepalive`、`-nodelay`；
//!   - 未知名字返回 `BadOption`，列出对应方向的合法名字。

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use conduit_core::errno;
use conduit_core::error::{ChannelError, CoreError};
use conduit_core::options::{self as generic, OptionContext, OptionListing, OptionValue};
use socket2::Socket;

use crate::backend;
use crate::channel::{TcpFlags, TcpState};
use crate::error::{self, map_io_error};
use crate::sys;

/// 可读取的选项；`error` 不出现在错误提示中。
const GET_OPTIONS: [&str; 6] = [
    "error",
    "connecting",
    "peername",
    "sockname",
    "keepalive",
    "nodelay",
];

/// `BadOption` 中列出的可读取选项。
pub const GET_OPTION_NAMES: [&str; 5] = ["connecting", "keepalive", "nodelay", "peername", "sockname"];

/// 可设置的选项。
pub const SET_OPTION_NAMES: [&str; 2] = ["keepalive", "nodelay"];

pub(crate) fn get_option(
    state: &mut TcpState,
    ctx: &OptionContext,
    name: Option<&str>,
) -> Result<OptionListing, CoreError> {
    let Some(name) = name else {
        return all_options(state, ctx);
    };
    let Some(option) = generic::match_option(name, &GET_OPTIONS) else {
        return Err(ChannelError::BadOption {
            name: name.to_owned(),
            valid: GET_OPTION_NAMES.to_vec(),
        }
        .into());
    };
    let _ = state.wait_for_connect(false);
    let value = match option {
        "error" => error_value(state),
        "connecting" => OptionValue::flag(state.flags.has(TcpFlags::ASYNC_CONNECT)),
        "peername" => {
            if connecting(state) {
                OptionValue::empty()
            } else {
                peer_triple(state, ctx)?
            }
        }
        "sockname" => sock_triples(state, ctx)?,
        "keepalive" => OptionValue::flag(read_flag(state, Socket::keepalive)?),
        _ => OptionValue::flag(read_flag(state, Socket::tcp_nodelay)?),
    };
    Ok(vec![(format!("-{option}"), value)])
}

fn all_options(state: &mut TcpState, ctx: &OptionContext) -> Result<OptionListing, CoreError> {
    let _ = state.wait_for_connect(false);
    let mut listing = Vec::with_capacity(4);
    if connecting(state) {
        listing.push(("-peername".to_owned(), OptionValue::empty()));
    } else if let Ok(peer) = peer_triple(state, ctx) {
        // 服务端没有对端，取不到时静默略过。
        listing.push(("-peername".to_owned(), peer));
    }
    listing.push(("-sockname".to_owned(), sock_triples(state, ctx)?));
    // 列表中读不到的开关记为关闭，不让整个列表失败。
    listing.push((
        "-keepalive".to_owned(),
        OptionValue::flag(read_flag(state, Socket::keepalive).unwrap_or(false)),
    ));
    listing.push((
        "-nodelay".to_owned(),
        OptionValue::flag(read_flag(state, Socket::tcp_nodelay).unwrap_or(false)),
    ));
    Ok(listing)
}

pub(crate) fn set_option(state: &mut TcpState, name: &str, value: &str) -> Result<(), CoreError> {
    let Some(option) = generic::match_option(name, &SET_OPTION_NAMES) else {
        return Err(ChannelError::BadOption {
            name: name.to_owned(),
            valid: SET_OPTION_NAMES.to_vec(),
        }
        .into());
    };
    let on = generic::parse_boolean(value)?;
    let socket = option_socket(state).ok_or_else(|| {
        map_io_error(error::SET_OPTION, errno::errno_error(libc::ENOTCONN))
    })?;
    let result = match option {
        "keepalive" => socket.set_keepalive(on),
        _ => socket.set_tcp_nodelay(on),
    };
    result.map_err(|err| map_io_error(error::SET_OPTION, err))
}

fn connecting(state: &TcpState) -> bool {
    state.flags.has(TcpFlags::ASYNC_CONNECT)
}

/// `-error`：建连中为空；否则先取缓存的建连错误（读取即清除），再取实时 `SO_ERROR`。
fn error_value(state: &mut TcpState) -> OptionValue {
    if connecting(state) {
        return OptionValue::empty();
    }
    if let Some(err) = state.connect_error.take() {
        return OptionValue::Text(errno::posix_message(&err));
    }
    let live = state.client_socket().map(Socket::take_error);
    match live {
        Some(Ok(Some(err))) | Some(Err(err)) => OptionValue::Text(errno::posix_message(&err)),
        _ => OptionValue::empty(),
    }
}

/// 开关类选项作用的套接字：服务端取第一个监听套接字。
fn option_socket(state: &TcpState) -> Option<&Socket> {
    if state.is_server() {
        state.sockets.first()
    } else {
        state.client_socket()
    }
}

fn read_flag(
    state: &TcpState,
    query: impl FnOnce(&Socket) -> io::Result<bool>,
) -> Result<bool, CoreError> {
    let socket = option_socket(state).ok_or_else(|| {
        map_io_error(error::GET_OPTION, errno::errno_error(libc::ENOTCONN))
    })?;
    query(socket).map_err(|err| map_io_error(error::GET_OPTION, err))
}

fn peer_triple(state: &TcpState, ctx: &OptionContext) -> Result<OptionValue, CoreError> {
    let socket = state
        .client_socket()
        .filter(|_| !state.is_server())
        .ok_or_else(|| map_io_error(error::PEERNAME, errno::errno_error(libc::ENOTCONN)))?;
    let peer = socket
        .peer_addr()
        .and_then(|addr| backend::socket_addr(&addr))
        .map_err(|err| map_io_error(error::PEERNAME, err))?;
    Ok(OptionValue::List(host_port_list(&peer, ctx).to_vec()))
}

fn sock_triples(state: &TcpState, ctx: &OptionContext) -> Result<OptionValue, CoreError> {
    if connecting(state) {
        return Ok(OptionValue::empty());
    }
    let sockets: Vec<&Socket> = if state.is_server() {
        state.sockets.iter().collect()
    } else {
        state.client_socket().into_iter().collect()
    };
    let mut values = Vec::with_capacity(sockets.len() * 3);
    let mut last_error = None;
    for socket in sockets {
        match socket
            .local_addr()
            .and_then(|addr| backend::socket_addr(&addr))
        {
            Ok(local) => values.extend(host_port_list(&local, ctx)),
            Err(err) => last_error = Some(err),
        }
    }
    if values.is_empty() {
        let err = last_error.unwrap_or_else(|| errno::errno_error(libc::ENOTCONN));
        return Err(map_io_error(error::SOCKNAME, err));
    }
    Ok(OptionValue::List(values))
}

/// 一个地址的三元组：数字地址、主机名（或数字地址）、端口。
pub(crate) fn host_port_list(addr: &SocketAddr, ctx: &OptionContext) -> [String; 3] {
    let numeric = addr.ip().to_string();
    let name = if needs_numeric_rendering(&addr.ip()) || !ctx.reverse_dns {
        numeric.clone()
    } else {
        sys::name_info(addr).unwrap_or_else(|| numeric.clone())
    };
    [numeric, name, addr.port().to_string()]
}

/// 通配地址（含映射到 IPv6 的 IPv4 通配）从不反查。
fn needs_numeric_rendering(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => {
            v6.is_unspecified() || v6.to_ipv4_mapped() == Some(Ipv4Addr::UNSPECIFIED)
        }
    }
}
