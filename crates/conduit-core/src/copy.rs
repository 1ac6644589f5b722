//! # copy 模块说明
//!
//! ## 意图（Why）
//! - 在两个通道之间搬运字节而不阻塞调用方：同步形式直接返回拷贝字节数，
//!   异步形式每个就绪事件只搬一个块，完成后调用回调；
//! - exec 的错误输出采集同样是“读到 EOF”，复用同一套错误合并规则。
//!
//! ## 逻辑（How）
//! - 同步：临时把两端切到阻塞模式，循环读写直到上限、EOF 或错误，结束后恢复原模式；
//! - 异步：两端切到非阻塞，状态放在共享的 [`CopyState`] 中；源端登记 READABLE、
//!   目的端在有积压输出时登记 WRITABLE，回调里推进一步；完成时撤销回调、恢复阻塞模式；
//! - 回调以 `try_lock` 进入状态机，推进过程中被延迟派发的通知直接跳过（水平触发会再来）。
//!
//! ## 契约（What）
//! - `limit` 为 `None` 表示拷贝到 EOF；给定上限时恰好停在上限；
//! - 读写失败优先采用驱动细节，否则为 `error reading "<src>": ...` / `error writing "<dst>": ...`；
//! - 同一通道同时只能参与一个后台拷贝，否则 `channel "<name>" is busy`。

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, HandlerId};
use crate::error::{ChannelError, CoreError, DriverError, codes};
use crate::event::Interest;

/// 异步拷贝完成回调：已拷贝字节数与可选错误。
pub type CopyCallback = Box<dyn FnOnce(u64, Option<CoreError>) + Send>;

/// 命令层的 `-size` 语义：负数表示不限。
pub fn limit_from_size(size: i64) -> Option<u64> {
    u64::try_from(size).ok()
}

/// 同步拷贝，返回拷贝的字节数。
pub fn copy(src: &Channel, dst: &Channel, limit: Option<u64>) -> Result<u64, CoreError> {
    check_directions(src, dst)?;
    begin(src, dst)?;
    let saved = (src.is_blocking(), dst.is_blocking());
    let result = set_modes(src, dst, (true, true)).and_then(|_| copy_blocking(src, dst, limit));
    if let Err(err) = set_modes(src, dst, saved) {
        warn!(error = %err, "restoring blocking modes after copy failed");
    }
    end(src, dst);
    result
}

fn copy_blocking(src: &Channel, dst: &Channel, limit: Option<u64>) -> Result<u64, CoreError> {
    let mut buffer = vec![0u8; src.buffer_size().max(1)];
    let mut total: u64 = 0;
    loop {
        let want = chunk_len(buffer.len(), limit, total);
        if want == 0 {
            break;
        }
        let n = src
            .read_driver(&mut buffer[..want])
            .map_err(|failure| read_failure(src, failure))?;
        if n == 0 {
            // 阻塞模式下只有 EOF 或测试注入的“会阻塞”会读到 0。
            break;
        }
        dst.write_driver(&buffer[..n], false)
            .map_err(|failure| write_failure(dst, failure))?;
        total += n as u64;
    }
    dst.write_driver(&[], true)
        .map_err(|failure| write_failure(dst, failure))?;
    debug!(src = src.name(), dst = dst.name(), total, "copy finished");
    Ok(total)
}

/// 启动异步拷贝。
///
/// # 契约说明（What）
/// - 立即推进第一步；若数据已就绪且满足结束条件，回调可能在本函数返回前被调用；
/// - 预检失败（方向、忙碌、模式切换）同步返回错误，不调用回调。
pub fn copy_background(
    src: &Channel,
    dst: &Channel,
    limit: Option<u64>,
    on_done: CopyCallback,
) -> Result<(), CoreError> {
    check_directions(src, dst)?;
    begin(src, dst)?;
    let saved = (src.is_blocking(), dst.is_blocking());
    if let Err(err) = set_modes(src, dst, (false, false)) {
        let _ = set_modes(src, dst, saved);
        end(src, dst);
        return Err(err);
    }
    let state = Arc::new(Mutex::new(CopyState {
        src: src.clone(),
        dst: dst.clone(),
        limit,
        total: 0,
        buffer: vec![0u8; src.buffer_size().max(1)],
        src_handler: None,
        dst_handler: None,
        saved,
        on_done: Some(on_done),
        finished: false,
    }));
    trace!(src = src.name(), dst = dst.name(), ?limit, "background copy started");
    advance(&state);
    Ok(())
}

/// 读取通道直到 EOF，返回全部内容（exec 错误输出采集）。
pub fn capture_output(channel: &Channel) -> Result<Vec<u8>, CoreError> {
    let mut output = Vec::new();
    let mut buffer = vec![0u8; channel.buffer_size().max(1)];
    loop {
        match channel.read_driver(&mut buffer) {
            Ok(0) => break,
            Ok(n) => output.extend_from_slice(&buffer[..n]),
            Err(Ok(driver)) => {
                return Err(driver.merge(|io| {
                    CoreError::from_io(codes::EXEC_OUTPUT, "error reading output from command", io)
                }));
            }
            Err(Err(usage)) => return Err(usage),
        }
    }
    Ok(output)
}

/// 异步拷贝的共享状态。
struct CopyState {
    src: Channel,
    dst: Channel,
    limit: Option<u64>,
    total: u64,
    buffer: Vec<u8>,
    src_handler: Option<HandlerId>,
    dst_handler: Option<HandlerId>,
    saved: (bool, bool),
    on_done: Option<CopyCallback>,
    finished: bool,
}

type Completion = (CopyCallback, u64, Option<CoreError>);

enum Step {
    WaitReadable,
    WaitWritable,
    Done(Option<CoreError>),
}

/// 推进一步；完成回调在释放状态锁之后调用。
fn advance(state: &Arc<Mutex<CopyState>>) {
    let completion = {
        let Some(mut guard) = state.try_lock() else {
            return;
        };
        if guard.finished {
            return;
        }
        match step(&mut guard) {
            Step::WaitReadable => {
                wait_for(&mut guard, state, Interest::READABLE);
                None
            }
            Step::WaitWritable => {
                wait_for(&mut guard, state, Interest::WRITABLE);
                None
            }
            Step::Done(error) => finish(&mut guard, error),
        }
    };
    if let Some((callback, total, error)) = completion {
        callback(total, error);
    }
}

fn step(state: &mut CopyState) -> Step {
    if state.dst.pending_output() > 0 {
        if let Err(failure) = state.dst.write_driver(&[], true) {
            return Step::Done(Some(write_failure(&state.dst, failure)));
        }
        if state.dst.pending_output() > 0 {
            return Step::WaitWritable;
        }
    }
    let want = chunk_len(state.buffer.len(), state.limit, state.total);
    if want == 0 {
        return Step::Done(None);
    }
    let n = match state.src.read_driver(&mut state.buffer[..want]) {
        Ok(n) => n,
        Err(failure) => return Step::Done(Some(read_failure(&state.src, failure))),
    };
    if n == 0 {
        if state.src.eof() {
            return Step::Done(None);
        }
        return Step::WaitReadable;
    }
    if let Err(failure) = state.dst.write_driver(&state.buffer[..n], true) {
        return Step::Done(Some(write_failure(&state.dst, failure)));
    }
    state.total += n as u64;
    trace!(src = state.src.name(), chunk = n, total = state.total, "copy chunk");
    if state.dst.pending_output() > 0 {
        Step::WaitWritable
    } else if chunk_len(state.buffer.len(), state.limit, state.total) == 0 {
        Step::Done(None)
    } else {
        Step::WaitReadable
    }
}

fn wait_for(state: &mut CopyState, shared: &Arc<Mutex<CopyState>>, interest: Interest) {
    let (wanted, other) = if interest == Interest::READABLE {
        (&mut state.src_handler, &mut state.dst_handler)
    } else {
        (&mut state.dst_handler, &mut state.src_handler)
    };
    if let Some(id) = other.take() {
        let channel = if interest == Interest::READABLE {
            &state.dst
        } else {
            &state.src
        };
        channel.delete_handler(id);
    }
    if wanted.is_none() {
        let channel = if interest == Interest::READABLE {
            &state.src
        } else {
            &state.dst
        };
        let shared = Arc::clone(shared);
        *wanted = Some(channel.create_handler(interest, move |_, _| advance(&shared)));
    }
}

fn finish(state: &mut CopyState, error: Option<CoreError>) -> Option<Completion> {
    state.finished = true;
    if let Some(id) = state.src_handler.take() {
        state.src.delete_handler(id);
    }
    if let Some(id) = state.dst_handler.take() {
        state.dst.delete_handler(id);
    }
    if let Err(err) = set_modes(&state.src, &state.dst, state.saved) {
        warn!(error = %err, "restoring blocking modes after background copy failed");
    }
    end(&state.src, &state.dst);
    debug!(
        src = state.src.name(),
        dst = state.dst.name(),
        total = state.total,
        failed = error.is_some(),
        "background copy finished"
    );
    state
        .on_done
        .take()
        .map(|callback| (callback, state.total, error))
}

fn chunk_len(buffer: usize, limit: Option<u64>, total: u64) -> usize {
    match limit {
        None => buffer,
        Some(limit) => {
            let remaining = limit.saturating_sub(total);
            usize::try_from(remaining).map_or(buffer, |remaining| remaining.min(buffer))
        }
    }
}

fn check_directions(src: &Channel, dst: &Channel) -> Result<(), CoreError> {
    if !src.mode().is_readable() {
        return Err(ChannelError::NotOpenedFor {
            channel: src.name().to_owned(),
            direction: "reading",
        }
        .into());
    }
    if !dst.mode().is_writable() {
        return Err(ChannelError::NotOpenedFor {
            channel: dst.name().to_owned(),
            direction: "writing",
        }
        .into());
    }
    Ok(())
}

fn begin(src: &Channel, dst: &Channel) -> Result<(), CoreError> {
    src.begin_copy()?;
    if src != dst
        && let Err(err) = dst.begin_copy()
    {
        src.end_copy();
        return Err(err);
    }
    Ok(())
}

fn end(src: &Channel, dst: &Channel) {
    src.end_copy();
    dst.end_copy();
}

fn set_modes(src: &Channel, dst: &Channel, modes: (bool, bool)) -> Result<(), CoreError> {
    if src.is_blocking() != modes.0 {
        src.set_blocking(modes.0)?;
    }
    if src != dst && dst.is_blocking() != modes.1 {
        dst.set_blocking(modes.1)?;
    }
    Ok(())
}

fn read_failure(src: &Channel, failure: Result<DriverError, CoreError>) -> CoreError {
    match failure {
        Ok(driver) => driver.merge(|io| {
            CoreError::from_io(
                codes::COPY_READ,
                format!("error reading \"{}\"", src.name()),
                io,
            )
        }),
        Err(usage) => usage,
    }
}

fn write_failure(dst: &Channel, failure: Result<DriverError, CoreError>) -> CoreError {
    match failure {
        Ok(driver) => driver.merge(|io| {
            CoreError::from_io(
                codes::COPY_WRITE,
                format!("error writing \"{}\"", dst.name()),
                io,
            )
        }),
        Err(usage) => usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_size_means_unlimited() {
        assert_eq!(limit_from_size(-1), None);
        assert_eq!(limit_from_size(0), Some(0));
        assert_eq!(limit_from_size(10), Some(10));
    }

    #[test]
    fn chunk_never_exceeds_remaining_limit() {
        assert_eq!(chunk_len(4096, Some(10), 0), 10);
        assert_eq!(chunk_len(4096, Some(10), 10), 0);
        assert_eq!(chunk_len(4, Some(10), 3), 4);
        assert_eq!(chunk_len(4096, None, 1 << 40), 4096);
    }
}
