//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 通道层所有失败最终都要以“人类可读消息 + 分层错误码令牌”的形式落到调用方的解释器上下文；
//! - 驱动层错误与上层拼装的通用消息可能同时存在，必须有一个显式的合并点保证“驱动错误优先”。
//!
//! ## 设计要求（What）
//! - [`CoreError`]：稳定错误码 + 消息 + 可选底层原因，`code` 遵循 `conduit.<域>.<语义>`；
//! - [`ChannelError`]：通道通用语义错误（半关闭误用、未知选项等），经 `From` 转为 `CoreError`；
//! - [`DriverError`]：驱动输入/输出返回的错误，携带 `io::Error` 与可选的驱动细节，
//!   由 [`DriverError::merge`] 在边界处与通用消息合并。

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::io;

use thiserror::Error as ThisError;

use crate::errno;

/// 底层原因的装箱形式。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// `CoreError` 是通道层跨模块共享的错误形态。
///
/// # 教案式说明
/// - **意图 (Why)**：解释器需要同时拿到可读消息与机读错误码；平台 errno 必须原样保留，
///   以便脚本层据 `POSIX ECONNREFUSED ...` 之类的令牌分支处理。
/// - **契约 (What)**：
///   - `code`：稳定字符串，参见 [`codes`]；
///   - `message`：最终呈现给脚本的文本，包含最底层的平台诊断；
///   - `errno`：若错误源自系统调用则记录，驱动 [`error_code_tokens`](Self::error_code_tokens)。
/// - **执行逻辑 (How)**：Builder 风格叠加分类与原因；`from_io` 一次性完成 errno 提取与文案拼装。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
    errno: Option<i32>,
}

impl CoreError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
            errno: None,
        }
    }

    /// 以 `context: <平台文案>` 的形式包装一次系统调用失败。
    ///
    /// # 契约说明（What）
    /// - `context`：调用方的前缀，例如 `couldn't open socket`；
    /// - 返回的错误记录 errno（若存在）、按 `io::ErrorKind` 推导的分类，并把原始错误挂为 `cause`。
    pub fn from_io(code: &'static str, context: impl fmt::Display, error: io::Error) -> Self {
        let message = format!("{}: {}", context, errno::posix_message(&error));
        let category = categorize_io_error(&error);
        let errno = error.raw_os_error();
        let mut core = Self::new(code, message).with_category(category);
        core.errno = errno;
        core.with_cause(error)
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 为错误标记结构化分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 显式记录 errno，供非 `io::Error` 来源（如 `getaddrinfo`）沿用 POSIX 令牌。
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// 获取结构化分类，未显式设置时为 [`ErrorCategory::NonRetryable`]。
    pub fn category(&self) -> ErrorCategory {
        self.category.unwrap_or(ErrorCategory::NonRetryable)
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 若错误源自系统调用，返回其 errno。
    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    /// 生成解释器可见的分层错误码令牌。
    ///
    /// # 执行逻辑（How）
    /// 1. 有 errno 时输出 `["POSIX", <符号名>, <文案>]`；
    /// 2. 否则将 `code` 按 `.` 切分并转为大写，如 `conduit.channel.bad_option` →
    ///    `["CONDUIT", "CHANNEL", "BAD_OPTION"]`。
    pub fn error_code_tokens(&self) -> Vec<String> {
        match self.errno {
            Some(errno) => vec![
                "POSIX".to_owned(),
                errno::posix_name(errno).to_owned(),
                errno::posix_message(&io::Error::from_raw_os_error(errno)),
            ],
            None => self
                .code
                .split('.')
                .map(|segment| segment.to_ascii_uppercase())
                .collect(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}

/// 错误分类，供调用方决定是否重试。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// 暂时性失败（对端拒绝、地址占用、会阻塞等），调用方可自行重试。
    Retryable,
    NonRetryable,
    /// 调用方输入或配置不合法。
    InvalidInput,
    Timeout,
    Cancelled,
}

/// 将 IO 错误归类。
pub fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => ErrorCategory::Retryable,
        ErrorKind::InvalidInput => ErrorCategory::InvalidInput,
        _ => ErrorCategory::NonRetryable,
    }
}

/// 稳定错误码集合。
///
/// 命名遵循 `conduit.<域>.<语义>`，在日志与 `error_code_tokens` 中保持一致。
pub mod codes {
    pub const CHANNEL_IO: &str = "conduit.channel.io";
    pub const CHANNEL_HALF_CLOSE: &str = "conduit.channel.half_close";
    pub const CHANNEL_BAD_OPTION: &str = "conduit.channel.bad_option";
    pub const CHANNEL_UNSUPPORTED_OPTION: &str = "conduit.channel.unsupported_option";
    pub const CHANNEL_NOT_OPENED: &str = "conduit.channel.not_opened";
    pub const CHANNEL_UNKNOWN: &str = "conduit.channel.unknown";
    pub const CHANNEL_BUSY: &str = "conduit.channel.busy";
    pub const CHANNEL_CLOSED: &str = "conduit.channel.closed";
    pub const CHANNEL_SEEK: &str = "conduit.channel.seek";
    pub const VALUE_BOOLEAN: &str = "conduit.value.boolean";
    pub const VALUE_INTEGER: &str = "conduit.value.integer";
    pub const COPY_READ: &str = "conduit.copy.read";
    pub const COPY_WRITE: &str = "conduit.copy.write";
    pub const EXEC_OUTPUT: &str = "conduit.exec.output";
    pub const EVENT_LOOP: &str = "conduit.event.poll";
}

/// 通道层通用语义错误。
///
/// # 教案式说明
/// - **意图 (Why)**：这些错误在任何系统调用之前就能判定，需与 syscall 失败明确区分；
/// - **契约 (What)**：`Display` 文案即脚本可见消息；`From<ChannelError> for CoreError`
///   选取稳定错误码并保持文案不变。
#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum ChannelError {
    /// 半关闭的方向从未打开或已关闭。
    #[error("Half-close of {side}-side not possible, side not opened or already closed")]
    HalfCloseNotOpened { side: &'static str },

    /// 未知选项名；`valid` 为该驱动支持的选项（不带 `-` 前缀）。
    #[error("bad option \"{name}\": should be one of {}", render_option_names(.valid))]
    BadOption {
        name: String,
        valid: Vec<&'static str>,
    },

    /// 平台不支持的具名选项。
    #[error("{0}")]
    UnsupportedOption(&'static str),

    /// 通道未以所需方向打开。
    #[error("channel \"{channel}\" wasn't opened for {direction}")]
    NotOpenedFor {
        channel: String,
        direction: &'static str,
    },

    /// 注册表中不存在该通道。
    #[error("can not find channel named \"{0}\"")]
    UnknownChannel(String),

    /// 通道正处于后台拷贝。
    #[error("channel \"{0}\" is busy")]
    Busy(String),

    /// 通道已关闭，句柄不可再用。
    #[error("channel \"{0}\" is closed")]
    Closed(String),

    #[error("expected boolean value but got \"{0}\"")]
    InvalidBoolean(String),

    #[error("expected integer but got \"{0}\"")]
    InvalidInteger(String),
}

impl ChannelError {
    /// `BadOption` 中列出的合法选项名，便于测试与上层提示。
    pub fn valid_option_names(&self) -> Option<&[&'static str]> {
        match self {
            ChannelError::BadOption { valid, .. } => Some(valid),
            _ => None,
        }
    }
}

/// 渲染 `-a, -b, or -c` 形式的选项枚举。
fn render_option_names(valid: &[&'static str]) -> String {
    match valid {
        [] => String::new(),
        [only] => format!("-{only}"),
        [init @ .., last] => {
            let head: Vec<String> = init.iter().map(|name| format!("-{name}")).collect();
            format!("{}, or -{}", head.join(", "), last)
        }
    }
}

impl From<ChannelError> for CoreError {
    fn from(value: ChannelError) -> Self {
        let code = match &value {
            ChannelError::HalfCloseNotOpened { .. } => codes::CHANNEL_HALF_CLOSE,
            ChannelError::BadOption { .. } => codes::CHANNEL_BAD_OPTION,
            ChannelError::UnsupportedOption(_) => codes::CHANNEL_UNSUPPORTED_OPTION,
            ChannelError::NotOpenedFor { .. } => codes::CHANNEL_NOT_OPENED,
            ChannelError::UnknownChannel(_) => codes::CHANNEL_UNKNOWN,
            ChannelError::Busy(_) => codes::CHANNEL_BUSY,
            ChannelError::Closed(_) => codes::CHANNEL_CLOSED,
            ChannelError::InvalidBoolean(_) => codes::VALUE_BOOLEAN,
            ChannelError::InvalidInteger(_) => codes::VALUE_INTEGER,
        };
        let message = value.to_string();
        CoreError::new(code, message)
            .with_category(ErrorCategory::InvalidInput)
            .with_cause(value)
    }
}

/// 驱动输入/输出返回的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：驱动在失败点最清楚真实原因（例如“连接被拒绝”），而上层只能拼装
///   `error reading "sock1": ...` 之类的通用消息；两者同时存在时驱动细节必须胜出。
/// - **契约 (What)**：
///   - `io`：总是存在，用于判断 `WouldBlock`、EOF 语义及生成通用文案；
///   - `detail`：驱动捕获的带外细节（原 “bypass” 槽位），存在时优先；
/// - **执行逻辑 (How)**：[`merge`](Self::merge) 是唯一的合并点，上层只提供通用消息的构造闭包。
#[derive(Debug)]
pub struct DriverError {
    io: io::Error,
    detail: Option<CoreError>,
}

impl DriverError {
    /// 仅携带系统错误。
    pub fn io(error: io::Error) -> Self {
        Self {
            io: error,
            detail: None,
        }
    }

    /// 携带驱动细节；`io` 仍用于分类与回退文案。
    pub fn with_detail(error: io::Error, detail: CoreError) -> Self {
        Self {
            io: error,
            detail: Some(detail),
        }
    }

    pub fn would_block() -> Self {
        Self::io(io::Error::from(io::ErrorKind::WouldBlock))
    }

    pub fn is_would_block(&self) -> bool {
        self.io.kind() == io::ErrorKind::WouldBlock
    }

    pub fn io_error(&self) -> &io::Error {
        &self.io
    }

    pub fn detail(&self) -> Option<&CoreError> {
        self.detail.as_ref()
    }

    /// 合并驱动细节与通用消息：驱动细节存在则原样返回，否则调用 `generic` 构造。
    pub fn merge(self, generic: impl FnOnce(io::Error) -> CoreError) -> CoreError {
        match self.detail {
            Some(detail) => detail,
            None => generic(self.io),
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(value: io::Error) -> Self {
        Self::io(value)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{detail}"),
            None => f.write_str(&errno::posix_message(&self.io)),
        }
    }
}

impl Error for DriverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.io)
    }
}
