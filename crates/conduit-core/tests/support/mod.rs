//! 集成测试共用的内存驱动。
//!
//! - `MemoryDriver` 的输入来自共享队列，`finished` 之前队列为空时报告“会阻塞”；
//! - 输出写入共享 `sink`，可用 `write_capacity` 模拟对端窗口，为 0 时报告“会阻塞”；
//! - 所有副作用（watch 掩码、半关闭、关闭）都记录在 [`MemoryState`] 中供断言。

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use conduit_core::error::codes;
use conduit_core::{
    Channel, ChannelDriver, ChannelMode, ChannelNotifier, CoreError, Direction, DriverError,
    Interest,
};
use parking_lot::Mutex;

#[derive(Default)]
pub struct MemoryState {
    pub source: VecDeque<u8>,
    pub finished: bool,
    pub sink: Vec<u8>,
    pub write_capacity: Option<usize>,
    pub read_failure: Option<(i32, Option<&'static str>)>,
    pub notify_on_read: Option<Interest>,
    pub watch: Interest,
    pub blocking: bool,
    pub half_closed: Vec<Direction>,
    pub closed: bool,
}

#[derive(Clone, Default)]
pub struct MemoryHandle(pub Arc<Mutex<MemoryState>>);

impl MemoryHandle {
    pub fn with_source(data: &[u8], finished: bool) -> Self {
        let handle = Self::default();
        {
            let mut state = handle.0.lock();
            state.source.extend(data.iter().copied());
            state.finished = finished;
            state.blocking = true;
        }
        handle
    }

    pub fn push(&self, data: &[u8]) {
        self.0.lock().source.extend(data.iter().copied());
    }

    pub fn finish(&self) {
        self.0.lock().finished = true;
    }

    pub fn sink(&self) -> Vec<u8> {
        self.0.lock().sink.clone()
    }

    pub fn watch(&self) -> Interest {
        self.0.lock().watch
    }
}

pub struct MemoryDriver {
    state: MemoryHandle,
    notifier: ChannelNotifier,
}

impl ChannelDriver for MemoryDriver {
    fn type_name(&self) -> &'static str {
        "memory"
    }

    fn attach(&mut self, notifier: ChannelNotifier) {
        self.notifier = notifier;
    }

    fn input(&mut self, buf: &mut [u8]) -> Result<usize, DriverError> {
        let (result, notify) = {
            let mut state = self.state.0.lock();
            let notify = state.notify_on_read.take();
            let result = if let Some((errno, detail)) = state.read_failure {
                let io = io::Error::from_raw_os_error(errno);
                Err(match detail {
                    Some(text) => DriverError::with_detail(io, CoreError::new(codes::CHANNEL_IO, text)),
                    None => DriverError::io(io),
                })
            } else if state.source.is_empty() {
                if state.finished {
                    Ok(0)
                } else {
                    Err(DriverError::would_block())
                }
            } else {
                let n = buf.len().min(state.source.len());
                for (slot, byte) in buf.iter_mut().zip(state.source.drain(..n)) {
                    *slot = byte;
                }
                Ok(n)
            };
            (result, notify)
        };
        if let Some(mask) = notify {
            self.notifier.notify(mask);
        }
        result
    }

    fn output(&mut self, buf: &[u8]) -> Result<usize, DriverError> {
        let mut state = self.state.0.lock();
        let n = match state.write_capacity {
            Some(0) => return Err(DriverError::would_block()),
            Some(capacity) => {
                let n = capacity.min(buf.len());
                state.write_capacity = Some(capacity - n);
                n
            }
            None => buf.len(),
        };
        state.sink.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.0.lock().closed = true;
        Ok(())
    }

    fn close_half(&mut self, direction: Direction) -> io::Result<()> {
        self.state.0.lock().half_closed.push(direction);
        Ok(())
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.state.0.lock().blocking = blocking;
        Ok(())
    }

    fn watch(&mut self, mask: Interest) {
        self.state.0.lock().watch = mask;
    }

    fn handle(&self, _direction: Direction) -> Option<RawFd> {
        None
    }
}

pub fn memory_channel(name: &str, mode: ChannelMode, handle: &MemoryHandle) -> Channel {
    Channel::new(
        name,
        mode,
        Box::new(MemoryDriver {
            state: handle.clone(),
            notifier: ChannelNotifier::detached(),
        }),
    )
}
