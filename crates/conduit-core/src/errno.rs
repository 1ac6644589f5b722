//! # errno 模块说明
//!
//! ## 意图（Why）
//! - 解释器层的错误码以 `POSIX <符号名> <文案>` 三段令牌呈现，文案需要稳定的小写描述，
//!   不能直接复用 `io::Error` 的 `Display`（会附带 `(os error N)` 后缀且大小写随平台变化）。
//!
//! ## 契约（What）
//! - [`posix_name`]：返回 errno 的符号名，未登记时返回 `"EUNKNOWN"`；
//! - [`posix_message`]：返回面向脚本的小写文案，未登记时回退为 `io::Error` 的描述。

use std::io;

/// errno → (符号名, 文案) 对照表。
static ERRNO_TABLE: &[(i32, &str, &str)] = &[
    (libc::EPERM, "EPERM", "not owner"),
    (libc::ENOENT, "ENOENT", "no such file or directory"),
    (libc::EINTR, "EINTR", "interrupted system call"),
    (libc::EIO, "EIO", "I/O error"),
    (libc::EBADF, "EBADF", "bad file number"),
    (libc::EAGAIN, "EAGAIN", "resource temporarily unavailable"),
    (libc::ENOMEM, "ENOMEM", "not enough memory"),
    (libc::EACCES, "EACCES", "permission denied"),
    (libc::EBUSY, "EBUSY", "file busy"),
    (libc::EEXIST, "EEXIST", "file already exists"),
    (libc::EINVAL, "EINVAL", "invalid argument"),
    (libc::EMFILE, "EMFILE", "too many open files"),
    (libc::ENOSPC, "ENOSPC", "no space left on device"),
    (libc::EPIPE, "EPIPE", "broken pipe"),
    (libc::EINPROGRESS, "EINPROGRESS", "operation now in progress"),
    (libc::EALREADY, "EALREADY", "operation already in progress"),
    (libc::ENOTSOCK, "ENOTSOCK", "socket operation on non-socket"),
    (libc::ENOPROTOOPT, "ENOPROTOOPT", "protocol not available"),
    (libc::EPROTONOSUPPORT, "EPROTONOSUPPORT", "protocol not supported"),
    (libc::EOPNOTSUPP, "EOPNOTSUPP", "operation not supported on socket"),
    (libc::EAFNOSUPPORT, "EAFNOSUPPORT", "address family not supported by protocol family"),
    (libc::EADDRINUSE, "EADDRINUSE", "address already in use"),
    (libc::EADDRNOTAVAIL, "EADDRNOTAVAIL", "can't assign requested address"),
    (libc::ENETDOWN, "ENETDOWN", "network is down"),
    (libc::ENETUNREACH, "ENETUNREACH", "network is unreachable"),
    (libc::ECONNABORTED, "ECONNABORTED", "software caused connection abort"),
    (libc::ECONNRESET, "ECONNRESET", "connection reset by peer"),
    (libc::ENOBUFS, "ENOBUFS", "no buffer space available"),
    (libc::EISCONN, "EISCONN", "socket is already connected"),
    (libc::ENOTCONN, "ENOTCONN", "socket is not connected"),
    (libc::ETIMEDOUT, "ETIMEDOUT", "connection timed out"),
    (libc::ECONNREFUSED, "ECONNREFUSED", "connection refused"),
    (libc::EHOSTDOWN, "EHOSTDOWN", "host is down"),
    (libc::EHOSTUNREACH, "EHOSTUNREACH", "host is unreachable"),
];

fn lookup(errno: i32) -> Option<&'static (i32, &'static str, &'static str)> {
    ERRNO_TABLE.iter().find(|(code, _, _)| *code == errno)
}

/// 返回 errno 的符号名。
pub fn posix_name(errno: i32) -> &'static str {
    lookup(errno).map(|(_, name, _)| *name).unwrap_or("EUNKNOWN")
}

/// 将 `io::Error` 渲染为脚本层可见的小写文案。
///
/// 带 errno 的错误查表；纯 `ErrorKind` 构造的错误回退为其描述文本，去掉 `(os error N)` 后缀。
pub fn posix_message(error: &io::Error) -> String {
    if let Some((_, _, message)) = error.raw_os_error().and_then(lookup) {
        return (*message).to_owned();
    }
    let rendered = error.to_string();
    let trimmed = match rendered.find(" (os error") {
        Some(index) => &rendered[..index],
        None => rendered.as_str(),
    };
    lowercase_first(trimmed)
}

/// 以 errno 构造 `io::Error`，供驱动在无系统调用时合成错误。
pub fn errno_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
