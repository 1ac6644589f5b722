//! `socket2` 未覆盖的名字服务调用（`getnameinfo`、`getservbyname`）；本 crate 唯一允许 `unsafe` 的位置。
#![allow(unsafe_code)]

use std::ffi::{CStr, CString};
use std::mem::{size_of, zeroed};
use std::net::SocketAddr;

/// 平台的默认监听队列长度，至少 100。
pub(crate) fn default_backlog() -> i32 {
    libc::SOMAXCONN.max(100)
}

fn with_sockaddr<R>(addr: &SocketAddr, f: impl FnOnce(*const libc::sockaddr, libc::socklen_t) -> R) -> R {
    match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: sockaddr_in 为纯 C 结构体，全零合法。
            let mut raw: libc::sockaddr_in = unsafe { zeroed() };
            raw.sin_family = libc::AF_INET as libc::sa_family_t;
            raw.sin_port = v4.port().to_be();
            raw.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            f(
                (&raw as *const libc::sockaddr_in).cast(),
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            // SAFETY: 同上。
            let mut raw: libc::sockaddr_in6 = unsafe { zeroed() };
            raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            raw.sin6_port = v6.port().to_be();
            raw.sin6_flowinfo = v6.flowinfo();
            raw.sin6_scope_id = v6.scope_id();
            raw.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            f(
                (&raw as *const libc::sockaddr_in6).cast(),
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// 反向解析主机名；失败返回 `None`。
pub(crate) fn name_info(addr: &SocketAddr) -> Option<String> {
    let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];
    let rc = with_sockaddr(addr, |ptr, len| {
        // SAFETY: ptr/len 指向栈上有效的 sockaddr；host 缓冲长度如实传入。
        unsafe {
            libc::getnameinfo(
                ptr,
                len,
                host.as_mut_ptr(),
                host.len() as libc::socklen_t,
                std::ptr::null_mut(),
                0,
                libc::NI_NAMEREQD,
            )
        }
    });
    if rc != 0 {
        return None;
    }
    // SAFETY: getnameinfo 成功后写入以 NUL 结尾的字符串。
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

/// 在服务数据库中查找 TCP 服务端口。
pub(crate) fn service_port(name: &str) -> Option<u16> {
    let c_name = CString::new(name).ok()?;
    // SAFETY: 两个参数均为有效 C 字符串；返回值指向静态存储，仅读取端口字段。
    let entry = unsafe { libc::getservbyname(c_name.as_ptr(), c"tcp".as_ptr()) };
    if entry.is_null() {
        return None;
    }
    // SAFETY: entry 非空。
    let port = unsafe { (*entry).s_port };
    Some(u16::from_be(port as u16))
}
