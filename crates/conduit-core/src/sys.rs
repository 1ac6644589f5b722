//! 平台系统调用的薄封装；本 crate 唯一允许 `unsafe` 的位置。
#![allow(unsafe_code)]

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::RawFd;
use std::ptr;

/// `poll(2)`，返回就绪描述符数量。
pub(crate) fn poll_fds(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    // SAFETY: 指针与长度来自同一个可变切片，调用期间独占借用。
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

pub(crate) fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// `uname(2)` 的节点名。
pub(crate) fn node_name() -> Option<String> {
    // SAFETY: utsname 为纯 C 结构体，全零是合法初值。
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: 传入有效的可写指针。
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    // SAFETY: uname 成功后 nodename 以 NUL 结尾。
    let raw = unsafe { CStr::from_ptr(uts.nodename.as_ptr()) };
    Some(raw.to_string_lossy().into_owned())
}

/// 通过 `getaddrinfo(AI_CANONNAME)` 求主机的规范名。
pub(crate) fn canonical_name(host: &str) -> Option<String> {
    let c_host = CString::new(host).ok()?;
    // SAFETY: addrinfo 全零即“无提示”。
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_flags = libc::AI_CANONNAME;
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    let mut result: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: 所有指针有效；成功时 result 由 freeaddrinfo 释放。
    let rc = unsafe { libc::getaddrinfo(c_host.as_ptr(), ptr::null(), &hints, &mut result) };
    if rc != 0 || result.is_null() {
        return None;
    }
    // SAFETY: result 非空且由 getaddrinfo 分配。
    let name = unsafe {
        let canon = (*result).ai_canonname;
        if canon.is_null() {
            None
        } else {
            Some(CStr::from_ptr(canon).to_string_lossy().into_owned())
        }
    };
    // SAFETY: 与上面的 getaddrinfo 成对调用。
    unsafe { libc::freeaddrinfo(result) };
    name
}
