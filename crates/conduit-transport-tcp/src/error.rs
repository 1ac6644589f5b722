//! TCP 驱动的稳定错误码与文案表。

use std::io;

use conduit_core::error::{CoreError, ErrorCategory};
use thiserror::Error;

/// `SO_REUSEPORT` 缺失时的文案。
pub(crate) const REUSEPORT_UNSUPPORTED: &str = "SO_REUSEPORT isn't supported by this platform";

/// 描述一次底层操作对应的稳定错误码与默认文案前缀。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const OPEN: OperationKind = OperationKind {
    code: "conduit.transport.tcp.open_failed",
    message: "couldn't open socket",
};
pub(crate) const SET_OPTION: OperationKind = OperationKind {
    code: "conduit.transport.tcp.set_option_failed",
    message: "couldn't set socket option",
};
pub(crate) const PEERNAME: OperationKind = OperationKind {
    code: "conduit.transport.tcp.peername_failed",
    message: "can't get peername",
};
pub(crate) const SOCKNAME: OperationKind = OperationKind {
    code: "conduit.transport.tcp.sockname_failed",
    message: "can't get sockname",
};
pub(crate) const GET_OPTION: OperationKind = OperationKind {
    code: "conduit.transport.tcp.get_option_failed",
    message: "couldn't get socket option",
};

pub(crate) const RESOLVE_CODE: &str = "conduit.transport.tcp.resolve_failed";

/// 将 IO 错误映射为 `CoreError`，文案为 `<前缀>: <平台文案>`。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    CoreError::from_io(kind.code, kind.message, error)
}

/// TCP 层在系统调用之前即可判定的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：命令层的参数组合错误与平台能力缺失需要与 syscall 失败区分，
///   以便调用方直接提示用户而非重试；
/// - **契约 (What)**：`Display` 即脚本可见消息，经 `From` 转为 [`CoreError`] 时分类为
///   `InvalidInput`。平台不支持的具名选项走通用的
///   [`ChannelError::UnsupportedOption`](conduit_core::ChannelError::UnsupportedOption)。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TcpError {
    #[error("couldn't open socket: port number too high")]
    PortTooHigh,

    #[error("expected integer but got \"{0}\"")]
    InvalidService(String),

    #[error("cannot set -async option for server sockets")]
    AsyncServer,

    #[error("option -myport is not valid for servers")]
    MyPortOnServer,

    #[error("options -backlog, -reuseaddr, and -reuseport are only valid for servers")]
    ServerOnlyOptions,

    #[error("no host given for client socket")]
    MissingHost,

    #[error("no argument given for -server option")]
    MissingServerCommand,
}

impl From<TcpError> for CoreError {
    fn from(value: TcpError) -> Self {
        let (code, category) = match &value {
            TcpError::PortTooHigh | TcpError::InvalidService(_) => (
                "conduit.transport.tcp.invalid_port",
                ErrorCategory::InvalidInput,
            ),
            TcpError::AsyncServer
            | TcpError::MyPortOnServer
            | TcpError::ServerOnlyOptions
            | TcpError::MissingHost
            | TcpError::MissingServerCommand => (
                "conduit.transport.tcp.invalid_request",
                ErrorCategory::InvalidInput,
            ),
        };
        let message = value.to_string();
        CoreError::new(code, message)
            .with_category(category)
            .with_cause(value)
    }
}
