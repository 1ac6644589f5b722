//! # channel 模块说明
//!
//! ## 意图（Why）
//! - 解释器命令面对的是统一的“通道”：读写、半关闭、阻塞切换、选项表、事件兴趣登记，
//!   与底层驱动（TCP 或其它）无关；驱动只需实现 [`ChannelDriver`] 这一能力集合。
//!
//! ## 逻辑（How）
//! - [`Channel`] 是 `Arc` 句柄，内部分两把锁：`io`（驱动、缓冲、方向位）与 `handlers`（事件回调），
//!   固定按 `io → handlers` 顺序获取；
//! - 驱动在持有 `io` 的调用链上触发的通知（例如阻塞等待中完成了异步连接）无法立即派发，
//!   先记入 `deferred` 位图，待本次 `io` 区段结束后统一派发；
//! - 非阻塞写剩余的数据留在输出缓冲，并自动登记 WRITABLE 兴趣在后台冲刷。
//!
//! ## 契约（What）
//! - 方向检查（未以读/写方式打开、半关闭误用）发生在任何系统调用之前；
//! - 关闭最后一个仍打开的方向等价于完整关闭；
//! - 驱动错误经 [`DriverError::merge`] 与通用消息合并，驱动细节优先。

use std::io::SeekFrom;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::errno;
use crate::error::{ChannelError, CoreError, DriverError, codes};
use crate::event::{Interest, Notifier};
use crate::options::{self, OptionContext, OptionListing, OptionValue};

/// 默认通道缓冲大小。
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// `-buffersize` 的上限。
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

const GENERIC_OPTIONS: [&str; 2] = ["blocking", "buffersize"];

/// 驱动报告的未知选项补上通用选项名，通用名排在驱动名之前。
fn with_generic_names(err: CoreError) -> CoreError {
    let rebuilt = match err
        .cause()
        .and_then(|cause| cause.downcast_ref::<ChannelError>())
    {
        Some(ChannelError::BadOption { name, valid }) => ChannelError::BadOption {
            name: name.clone(),
            valid: GENERIC_OPTIONS.iter().chain(valid).copied().collect(),
        },
        _ => return err,
    };
    rebuilt.into()
}

/// 通道打开方向位。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelMode(u8);

impl ChannelMode {
    pub const NONE: ChannelMode = ChannelMode(0);
    pub const READABLE: ChannelMode = ChannelMode(1);
    pub const WRITABLE: ChannelMode = ChannelMode(1 << 1);
    pub const READ_WRITE: ChannelMode = ChannelMode(0b11);

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn has(self, direction: Direction) -> bool {
        self.0 & direction.mode().0 != 0
    }

    const fn without(self, direction: Direction) -> Self {
        ChannelMode(self.0 & !direction.mode().0)
    }
}

/// 半关闭方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub const fn side(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }

    const fn mode(self) -> ChannelMode {
        match self {
            Direction::Read => ChannelMode::READABLE,
            Direction::Write => ChannelMode::WRITABLE,
        }
    }
}

/// 线程交接动作。
pub enum ThreadAction {
    /// 在源线程上拆除全部事件登记。
    Remove,
    /// 在目标线程上以新的通知器重建登记。
    Insert(Arc<dyn Notifier>),
}

/// 通道驱动能力集合。
///
/// # 教案式说明
/// - **意图 (Why)**：把“类型结构体 + 函数指针”的驱动表表达为 trait，新增驱动无需改动 [`Channel`]；
/// - **契约 (What)**：
///   - `input`：返回 `Ok(0)` 表示 EOF；非阻塞无数据返回 `WouldBlock`；
///   - `output`：返回写出的字节数；
///   - `watch`：以通道当前的兴趣集合覆盖驱动登记，空集合表示撤销；
///   - `close`：撤销所有登记并关闭全部描述符，调用后驱动不再被使用；
///   - 默认实现对可选能力返回“不支持”。
pub trait ChannelDriver: Send {
    /// 驱动类型名，例如 `tcp`。
    fn type_name(&self) -> &'static str;

    /// 通道创建后注入通知句柄，驱动用它向通道转发就绪事件。
    fn attach(&mut self, _notifier: ChannelNotifier) {}

    fn input(&mut self, buf: &mut [u8]) -> Result<usize, DriverError>;

    fn output(&mut self, buf: &[u8]) -> Result<usize, DriverError>;

    fn seek(&mut self, _position: SeekFrom) -> Result<u64, DriverError> {
        Err(DriverError::io(errno::errno_error(libc::EINVAL)))
    }

    fn close(&mut self) -> std::io::Result<()>;

    fn close_half(&mut self, _direction: Direction) -> std::io::Result<()> {
        Err(errno::errno_error(libc::EINVAL))
    }

    fn set_blocking(&mut self, blocking: bool) -> std::io::Result<()>;

    fn set_option(&mut self, name: &str, _value: &str) -> Result<(), CoreError> {
        Err(ChannelError::BadOption {
            name: name.to_owned(),
            valid: Vec::new(),
        }
        .into())
    }

    /// `name` 为 `None` 时返回驱动的全部选项，否则返回命中的单个选项。
    fn get_option(
        &mut self,
        _ctx: &OptionContext,
        name: Option<&str>,
    ) -> Result<OptionListing, CoreError> {
        match name {
            None => Ok(Vec::new()),
            Some(name) => Err(ChannelError::BadOption {
                name: name.to_owned(),
                valid: Vec::new(),
            }
            .into()),
        }
    }

    fn watch(&mut self, mask: Interest);

    fn handle(&self, direction: Direction) -> Option<RawFd>;

    fn thread_action(&mut self, _action: ThreadAction) {}
}

/// 驱动持有的通知句柄；通道释放后通知自动失效。
#[derive(Clone, Default)]
pub struct ChannelNotifier {
    inner: Weak<ChannelInner>,
}

impl ChannelNotifier {
    /// 未绑定任何通道的空句柄。
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn notify(&self, mask: Interest) {
        if let Some(inner) = self.inner.upgrade() {
            Channel { inner }.notify(mask);
        }
    }
}

/// 通道构造参数。
#[derive(Clone, Copy, Debug)]
pub struct ChannelConfig {
    buffer_size: usize,
    blocking: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            blocking: true,
        }
    }
}

impl ChannelConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.clamp(1, MAX_BUFFER_SIZE);
        self
    }

    /// 初始阻塞模式只影响通道层记录，驱动需自行以一致的模式打开描述符。
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
}

/// 事件回调。
pub type EventCallback = Arc<dyn Fn(&Channel, Interest) + Send + Sync>;

/// 事件回调登记标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct HandlerTable {
    next_id: u64,
    entries: Vec<(HandlerId, Interest, EventCallback)>,
}

impl HandlerTable {
    fn mask(&self) -> Interest {
        self.entries
            .iter()
            .fold(Interest::NONE, |acc, (_, mask, _)| acc | *mask)
    }
}

struct ChannelIo {
    driver: Option<Box<dyn ChannelDriver>>,
    mode: ChannelMode,
    blocking: bool,
    eof: bool,
    blocked: bool,
    input: BytesMut,
    output: BytesMut,
    buffer_size: usize,
    watch: Interest,
    flush_pending: bool,
    unreported: Option<DriverError>,
    close_handlers: Vec<Box<dyn FnOnce() + Send>>,
}

struct ChannelInner {
    name: String,
    type_name: &'static str,
    io: Mutex<ChannelIo>,
    handlers: Mutex<HandlerTable>,
    deferred: AtomicU8,
    refs: AtomicUsize,
    copying: AtomicBool,
}

enum IoFailure {
    Usage(CoreError),
    Driver(DriverError),
}

enum HalfClose {
    Done,
    FullClose,
}

/// 通道句柄。克隆共享同一个通道。
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("type", &self.inner.type_name)
            .finish()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Channel {
    /// 以默认配置创建通道。
    pub fn new(name: impl Into<String>, mode: ChannelMode, driver: Box<dyn ChannelDriver>) -> Self {
        Self::with_config(name, mode, driver, ChannelConfig::default())
    }

    /// 创建通道并向驱动注入通知句柄。
    pub fn with_config(
        name: impl Into<String>,
        mode: ChannelMode,
        driver: Box<dyn ChannelDriver>,
        config: ChannelConfig,
    ) -> Self {
        let type_name = driver.type_name();
        let inner = Arc::new(ChannelInner {
            name: name.into(),
            type_name,
            io: Mutex::new(ChannelIo {
                driver: Some(driver),
                mode,
                blocking: config.blocking,
                eof: false,
                blocked: false,
                input: BytesMut::new(),
                output: BytesMut::new(),
                buffer_size: config.buffer_size,
                watch: Interest::NONE,
                flush_pending: false,
                unreported: None,
                close_handlers: Vec::new(),
            }),
            handlers: Mutex::new(HandlerTable::default()),
            deferred: AtomicU8::new(0),
            refs: AtomicUsize::new(0),
            copying: AtomicBool::new(false),
        });
        let notifier = ChannelNotifier {
            inner: Arc::downgrade(&inner),
        };
        if let Some(driver) = inner.io.lock().driver.as_mut() {
            driver.attach(notifier);
        }
        debug!(channel = %inner.name, kind = type_name, "channel created");
        Channel { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    pub fn mode(&self) -> ChannelMode {
        self.inner.io.lock().mode
    }

    pub fn is_closed(&self) -> bool {
        self.inner.io.lock().driver.is_none()
    }

    pub fn is_blocking(&self) -> bool {
        self.inner.io.lock().blocking
    }

    /// 最近一次读取是否遇到 EOF。
    pub fn eof(&self) -> bool {
        self.inner.io.lock().eof
    }

    /// 最近一次读取是否因非阻塞无数据而返回。
    pub fn input_blocked(&self) -> bool {
        self.inner.io.lock().blocked
    }

    pub fn pending_input(&self) -> usize {
        self.inner.io.lock().input.len()
    }

    pub fn pending_output(&self) -> usize {
        self.inner.io.lock().output.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.io.lock().buffer_size
    }

    /// 暴露底层描述符，供外部事件循环集成。
    pub fn handle(&self, direction: Direction) -> Option<RawFd> {
        let io = self.inner.io.lock();
        io.driver.as_ref().and_then(|driver| driver.handle(direction))
    }

    /// 切换阻塞模式。
    pub fn set_blocking(&self, blocking: bool) -> Result<(), CoreError> {
        self.with_io(|channel, io| channel.set_blocking_locked(io, blocking))
    }

    fn set_blocking_locked(&self, io: &mut ChannelIo, blocking: bool) -> Result<(), CoreError> {
        let driver = io
            .driver
            .as_mut()
            .ok_or_else(|| CoreError::from(ChannelError::Closed(self.inner.name.clone())))?;
        driver.set_blocking(blocking).map_err(|err| {
            CoreError::from_io(
                codes::CHANNEL_IO,
                format!("error setting blocking mode on \"{}\"", self.inner.name),
                err,
            )
        })?;
        io.blocking = blocking;
        if blocking {
            io.flush_pending = false;
        }
        self.apply_watch(io);
        Ok(())
    }

    /// 读取数据。
    ///
    /// # 契约说明（What）
    /// - 返回 `Ok(0)` 时需结合 [`eof`](Self::eof) 与 [`input_blocked`](Self::input_blocked)
    ///   区分“对端关闭”与“非阻塞暂无数据”；
    /// - 驱动失败时消息为 `error reading "<name>": <平台文案>`，驱动细节存在则以其为准。
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        self.read_inner(buf).map_err(|failure| match failure {
            IoFailure::Usage(err) => err,
            IoFailure::Driver(err) => err.merge(|io| {
                CoreError::from_io(
                    codes::CHANNEL_IO,
                    format!("error reading \"{}\"", self.inner.name),
                    io,
                )
            }),
        })
    }

    /// 与 [`read`](Self::read) 相同，但驱动错误原样交给调用方合并。
    pub(crate) fn read_driver(&self, buf: &mut [u8]) -> Result<usize, Result<DriverError, CoreError>> {
        self.read_inner(buf).map_err(|failure| match failure {
            IoFailure::Usage(err) => Err(err),
            IoFailure::Driver(err) => Ok(err),
        })
    }

    fn read_inner(&self, buf: &mut [u8]) -> Result<usize, IoFailure> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.with_io(|channel, io| {
            if io.driver.is_none() {
                return Err(IoFailure::Usage(
                    ChannelError::Closed(channel.inner.name.clone()).into(),
                ));
            }
            if !io.mode.is_readable() {
                return Err(IoFailure::Usage(
                    ChannelError::NotOpenedFor {
                        channel: channel.inner.name.clone(),
                        direction: "reading",
                    }
                    .into(),
                ));
            }
            if !io.input.is_empty() {
                let n = buf.len().min(io.input.len());
                buf[..n].copy_from_slice(&io.input[..n]);
                io.input.advance(n);
                return Ok(n);
            }

            io.blocked = false;
            let buffer_size = io.buffer_size;
            let Some(driver) = io.driver.as_mut() else {
                return Ok(0);
            };
            let outcome = if buf.len() >= buffer_size {
                driver.input(buf)
            } else {
                let mut chunk = vec![0u8; buffer_size];
                driver.input(&mut chunk).map(|n| {
                    let take = n.min(buf.len());
                    buf[..take].copy_from_slice(&chunk[..take]);
                    io.input.extend_from_slice(&chunk[take..n]);
                    take
                })
            };
            match outcome {
                Ok(0) => {
                    io.eof = true;
                    Ok(0)
                }
                Ok(n) => {
                    io.eof = false;
                    Ok(n)
                }
                Err(err) if err.is_would_block() => {
                    io.blocked = true;
                    Ok(0)
                }
                Err(err) => Err(IoFailure::Driver(err)),
            }
        })
    }

    /// 写入数据，缓冲满时立即冲刷。
    pub fn write(&self, data: &[u8]) -> Result<usize, CoreError> {
        self.write_inner(data, false)
            .map_err(|failure| self.merge_write_failure(failure))
    }

    /// 将输出缓冲冲刷到驱动；非阻塞模式下剩余数据转入后台冲刷。
    pub fn flush(&self) -> Result<(), CoreError> {
        self.write_inner(&[], true)
            .map(|_| ())
            .map_err(|failure| self.merge_write_failure(failure))
    }

    pub(crate) fn write_driver(
        &self,
        data: &[u8],
        flush: bool,
    ) -> Result<usize, Result<DriverError, CoreError>> {
        self.write_inner(data, flush).map_err(|failure| match failure {
            IoFailure::Usage(err) => Err(err),
            IoFailure::Driver(err) => Ok(err),
        })
    }

    fn merge_write_failure(&self, failure: IoFailure) -> CoreError {
        match failure {
            IoFailure::Usage(err) => err,
            IoFailure::Driver(err) => err.merge(|io| {
                CoreError::from_io(
                    codes::CHANNEL_IO,
                    format!("error writing \"{}\"", self.inner.name),
                    io,
                )
            }),
        }
    }

    fn write_inner(&self, data: &[u8], force_flush: bool) -> Result<usize, IoFailure> {
        self.with_io(|channel, io| {
            if io.driver.is_none() {
                return Err(IoFailure::Usage(
                    ChannelError::Closed(channel.inner.name.clone()).into(),
                ));
            }
            if !io.mode.is_writable() {
                return Err(IoFailure::Usage(
                    ChannelError::NotOpenedFor {
                        channel: channel.inner.name.clone(),
                        direction: "writing",
                    }
                    .into(),
                ));
            }
            if let Some(err) = io.unreported.take() {
                return Err(IoFailure::Driver(err));
            }
            io.output.extend_from_slice(data);
            if force_flush || io.output.len() >= io.buffer_size {
                channel.flush_locked(io).map_err(IoFailure::Driver)?;
            }
            Ok(data.len())
        })
    }

    /// 在持有 `io` 的前提下尽力写出输出缓冲。
    fn flush_locked(&self, io: &mut ChannelIo) -> Result<(), DriverError> {
        let Some(driver) = io.driver.as_mut() else {
            return Ok(());
        };
        let mut failure = None;
        while !io.output.is_empty() {
            match driver.output(&io.output[..]) {
                Ok(0) => break,
                Ok(n) => io.output.advance(n),
                Err(err) if err.is_would_block() && !io.blocking => break,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if failure.is_some() {
            io.output.clear();
        }
        let want_background = !io.output.is_empty() && !io.blocking;
        if want_background != io.flush_pending {
            io.flush_pending = want_background;
            trace!(channel = %self.inner.name, pending = io.output.len(), "background flush toggled");
            self.apply_watch(io);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// 定位；TCP 等流式驱动返回 `invalid argument`。
    pub fn seek(&self, position: SeekFrom) -> Result<u64, CoreError> {
        self.with_io(|channel, io| {
            let name = channel.inner.name.clone();
            if !io.output.is_empty() {
                channel.flush_locked(io).map_err(|err| {
                    err.merge(|e| {
                        CoreError::from_io(codes::CHANNEL_SEEK, format!("error during seek on \"{name}\""), e)
                    })
                })?;
            }
            let driver = io
                .driver
                .as_mut()
                .ok_or_else(|| CoreError::from(ChannelError::Closed(name.clone())))?;
            let position = driver.seek(position).map_err(|err| {
                err.merge(|e| {
                    CoreError::from_io(codes::CHANNEL_SEEK, format!("error during seek on \"{name}\""), e)
                })
            })?;
            io.input.clear();
            io.eof = false;
            Ok(position)
        })
    }

    /// 当前读写位置；不可定位的通道返回 `None`。
    pub fn tell(&self) -> Option<u64> {
        self.with_io(|_, io| {
            let pending_in = io.input.len() as u64;
            let pending_out = io.output.len() as u64;
            let driver = io.driver.as_mut()?;
            let position = driver.seek(SeekFrom::Current(0)).ok()?;
            Some(position.saturating_sub(pending_in) + pending_out)
        })
    }

    /// 完整关闭通道。
    ///
    /// # 执行逻辑（How）
    /// 1. 取出并执行关闭回调（不持锁，回调可访问注册表）；
    /// 2. 尽力冲刷输出，撤销驱动事件登记，调用驱动 `close`；
    /// 3. 清空事件回调表。重复关闭是空操作。
    pub fn close(&self) -> Result<(), CoreError> {
        let close_handlers = {
            let mut io = self.inner.io.lock();
            if io.driver.is_none() {
                return Ok(());
            }
            std::mem::take(&mut io.close_handlers)
        };
        for handler in close_handlers {
            handler();
        }

        let result = self.with_io(|channel, io| {
            if io.driver.is_none() {
                return Ok(());
            }
            if !io.output.is_empty()
                && let Err(err) = channel.flush_locked(io)
            {
                warn!(channel = %channel.inner.name, error = %err, "discarding output on close");
            }
            io.mode = ChannelMode::NONE;
            io.input.clear();
            io.output.clear();
            io.flush_pending = false;
            io.watch = Interest::NONE;
            let Some(mut driver) = io.driver.take() else {
                return Ok(());
            };
            driver.watch(Interest::NONE);
            driver.close()
        });
        self.inner.handlers.lock().entries.clear();
        debug!(channel = %self.inner.name, "channel closed");
        result.map_err(|err| CoreError::from_io(codes::CHANNEL_IO, "error closing channel", err))
    }

    /// 半关闭一个方向。
    pub fn close_half(&self, direction: Direction) -> Result<(), CoreError> {
        let outcome = self.with_io(|channel, io| -> Result<HalfClose, CoreError> {
            if io.driver.is_none() {
                return Err(ChannelError::Closed(channel.inner.name.clone()).into());
            }
            if !io.mode.has(direction) {
                return Err(ChannelError::HalfCloseNotOpened {
                    side: direction.side(),
                }
                .into());
            }
            if io.mode.without(direction) == ChannelMode::NONE {
                return Ok(HalfClose::FullClose);
            }
            if direction == Direction::Write {
                channel
                    .flush_locked(io)
                    .map_err(|err| channel.merge_write_failure(IoFailure::Driver(err)))?;
            }
            if let Some(driver) = io.driver.as_mut() {
                driver.close_half(direction).map_err(|err| {
                    CoreError::from_io(
                        codes::CHANNEL_IO,
                        format!(
                            "error closing {} side of \"{}\"",
                            direction.side(),
                            channel.inner.name
                        ),
                        err,
                    )
                })?;
            }
            io.mode = io.mode.without(direction);
            if direction == Direction::Read {
                io.input.clear();
                io.eof = true;
            }
            channel.apply_watch(io);
            Ok(HalfClose::Done)
        })?;
        match outcome {
            HalfClose::Done => Ok(()),
            HalfClose::FullClose => self.close(),
        }
    }

    /// 登记事件回调，返回可用于撤销的标识。
    pub fn create_handler(
        &self,
        mask: Interest,
        callback: impl Fn(&Channel, Interest) + Send + Sync + 'static,
    ) -> HandlerId {
        self.with_io(|channel, io| {
            let id = {
                let mut handlers = channel.inner.handlers.lock();
                handlers.next_id += 1;
                let id = HandlerId(handlers.next_id);
                handlers.entries.push((id, mask, Arc::new(callback)));
                id
            };
            channel.apply_watch(io);
            id
        })
    }

    pub fn delete_handler(&self, id: HandlerId) {
        self.with_io(|channel, io| {
            channel
                .inner
                .handlers
                .lock()
                .entries
                .retain(|(entry, _, _)| *entry != id);
            channel.apply_watch(io);
        });
    }

    /// 登记关闭回调，按登记顺序在关闭时执行。
    pub fn add_close_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.inner.io.lock().close_handlers.push(Box::new(handler));
    }

    /// 驱动或外部循环报告就绪事件。
    ///
    /// 通道忙（`io` 被占用）时事件记入延迟位图，由占用方在区段结束后派发。
    pub fn notify(&self, mask: Interest) {
        {
            let Some(mut io) = self.inner.io.try_lock() else {
                self.inner.deferred.fetch_or(mask.bits(), Ordering::SeqCst);
                return;
            };
            if mask.intersects(Interest::WRITABLE)
                && io.flush_pending
                && let Err(err) = self.flush_locked(&mut io)
            {
                debug!(channel = %self.inner.name, error = %err, "background flush failed");
                io.unreported = Some(err);
            }
        }
        let targets: Vec<(Interest, EventCallback)> = self
            .inner
            .handlers
            .lock()
            .entries
            .iter()
            .filter(|(_, interest, _)| interest.intersects(mask))
            .map(|(_, interest, callback)| (*interest & mask, Arc::clone(callback)))
            .collect();
        for (ready, callback) in targets {
            callback(self, ready);
        }
    }

    /// 读取单个选项；先匹配通用选项，再交给驱动。
    pub fn get_option(&self, ctx: &OptionContext, name: &str) -> Result<OptionValue, CoreError> {
        self.with_io(|channel, io| {
            match options::match_option(name, &GENERIC_OPTIONS) {
                Some("blocking") => return Ok(OptionValue::flag(io.blocking)),
                Some(_) => return Ok(OptionValue::Text(io.buffer_size.to_string())),
                None => {}
            }
            let driver = io
                .driver
                .as_mut()
                .ok_or_else(|| CoreError::from(ChannelError::Closed(channel.inner.name.clone())))?;
            let listing = driver.get_option(ctx, Some(name)).map_err(with_generic_names)?;
            Ok(listing
                .into_iter()
                .next()
                .map(|(_, value)| value)
                .unwrap_or_else(OptionValue::empty))
        })
    }

    /// 读取全部选项：通用选项在前，驱动选项在后。
    pub fn get_options(&self, ctx: &OptionContext) -> Result<OptionListing, CoreError> {
        self.with_io(|channel, io| {
            let mut listing = vec![
                ("-blocking".to_owned(), OptionValue::flag(io.blocking)),
                (
                    "-buffersize".to_owned(),
                    OptionValue::Text(io.buffer_size.to_string()),
                ),
            ];
            let driver = io
                .driver
                .as_mut()
                .ok_or_else(|| CoreError::from(ChannelError::Closed(channel.inner.name.clone())))?;
            listing.extend(driver.get_option(ctx, None)?);
            Ok(listing)
        })
    }

    /// 设置选项。
    pub fn set_option(&self, name: &str, value: &str) -> Result<(), CoreError> {
        self.with_io(|channel, io| match options::match_option(name, &GENERIC_OPTIONS) {
            Some("blocking") => {
                let blocking = options::parse_boolean(value)?;
                channel.set_blocking_locked(io, blocking)
            }
            Some(_) => {
                let size: i64 = value
                    .trim()
                    .parse()
                    .map_err(|_| ChannelError::InvalidInteger(value.to_owned()))?;
                io.buffer_size = usize::try_from(size.max(1))
                    .unwrap_or(MAX_BUFFER_SIZE)
                    .min(MAX_BUFFER_SIZE);
                Ok(())
            }
            None => {
                let driver = io.driver.as_mut().ok_or_else(|| {
                    CoreError::from(ChannelError::Closed(channel.inner.name.clone()))
                })?;
                driver.set_option(name, value).map_err(with_generic_names)
            }
        })
    }

    /// 线程交接第一步：在源线程拆除驱动的事件登记。
    pub fn cut(&self) {
        self.with_io(|channel, io| {
            if let Some(driver) = io.driver.as_mut() {
                driver.thread_action(ThreadAction::Remove);
                trace!(channel = %channel.inner.name, "channel cut from event loop");
            }
        });
    }

    /// 线程交接第二步：在目标线程以新的通知器重建登记并恢复兴趣。
    pub fn splice(&self, notifier: Arc<dyn Notifier>) {
        self.with_io(|channel, io| {
            let watch = io.watch;
            if let Some(driver) = io.driver.as_mut() {
                driver.thread_action(ThreadAction::Insert(notifier));
                driver.watch(watch);
                trace!(channel = %channel.inner.name, ?watch, "channel spliced into event loop");
            }
        });
    }

    pub(crate) fn retain(&self) {
        self.inner.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// 释放一次登记引用，归零时关闭通道。
    pub(crate) fn release(&self) -> Result<(), CoreError> {
        let previous = self
            .inner
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| {
                Some(refs.saturating_sub(1))
            })
            .unwrap_or(0);
        if previous <= 1 {
            self.close()
        } else {
            Ok(())
        }
    }

    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_copy(&self) -> Result<(), CoreError> {
        if self.inner.copying.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::Busy(self.inner.name.clone()).into());
        }
        Ok(())
    }

    pub(crate) fn end_copy(&self) {
        self.inner.copying.store(false, Ordering::SeqCst);
    }

    pub fn is_copying(&self) -> bool {
        self.inner.copying.load(Ordering::SeqCst)
    }

    fn apply_watch(&self, io: &mut ChannelIo) {
        let mut mask = self.inner.handlers.lock().mask();
        if io.flush_pending {
            mask |= Interest::WRITABLE;
        }
        if mask == io.watch {
            return;
        }
        io.watch = mask;
        if let Some(driver) = io.driver.as_mut() {
            driver.watch(mask);
        }
    }

    /// 独占 `io` 执行 `f`，结束后派发期间被延迟的通知。
    fn with_io<R>(&self, f: impl FnOnce(&Channel, &mut ChannelIo) -> R) -> R {
        let result = {
            let mut io = self.inner.io.lock();
            f(self, &mut io)
        };
        let deferred = self.inner.deferred.swap(0, Ordering::SeqCst);
        if deferred != 0 {
            self.notify(Interest::from_bits(deferred));
        }
        result
    }
}
