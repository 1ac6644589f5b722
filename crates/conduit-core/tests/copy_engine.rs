//! `copy_engine` 集成测试：后台拷贝的上限、EOF、忙碌与错误合并语义。
//!
//! # 结构安排（How）
//! - 同步形式直接断言返回的字节数；
//! - 异步形式没有真实描述符，测试以 `Channel::notify` 充当事件循环逐步推进。

mod support;

use std::sync::Arc;

use conduit_core::copy::{capture_output, copy, copy_background};
use conduit_core::{ChannelMode, CoreError, Interest};
use parking_lot::Mutex;
use proptest::prelude::*;
use support::{MemoryHandle, memory_channel};

type Outcome = Arc<Mutex<Option<(u64, Option<CoreError>)>>>;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn copy_stops_exactly_at_limit() {
    let data = payload(10_000);
    let src_mem = MemoryHandle::with_source(&data, true);
    let dst_mem = MemoryHandle::with_source(b"", false);
    let src = memory_channel("src", ChannelMode::READ_WRITE, &src_mem);
    let dst = memory_channel("dst", ChannelMode::READ_WRITE, &dst_mem);

    let copied = copy(&src, &dst, Some(1_000)).expect("copy");
    assert_eq!(copied, 1_000);
    assert_eq!(dst_mem.sink(), &data[..1_000], "不得多拷贝一个字节");
    assert!(!src.is_copying() && !dst.is_copying());
}

proptest! {
    #[test]
    fn copy_never_exceeds_limit_or_source(len in 0usize..20_000, limit in 0u64..25_000) {
        let data = payload(len);
        let src_mem = MemoryHandle::with_source(&data, true);
        let dst_mem = MemoryHandle::with_source(b"", false);
        let src = memory_channel("src", ChannelMode::READ_WRITE, &src_mem);
        let dst = memory_channel("dst", ChannelMode::READ_WRITE, &dst_mem);

        let copied = copy(&src, &dst, Some(limit)).expect("copy");
        let expected = limit.min(len as u64);
        prop_assert_eq!(copied, expected);
        prop_assert_eq!(dst_mem.sink(), &data[..expected as usize]);
    }
}

#[test]
fn unlimited_copy_runs_to_eof() {
    let data = payload(9_000);
    let src_mem = MemoryHandle::with_source(&data, true);
    let dst_mem = MemoryHandle::with_source(b"", false);
    let src = memory_channel("src", ChannelMode::READ_WRITE, &src_mem);
    let dst = memory_channel("dst", ChannelMode::READ_WRITE, &dst_mem);

    assert_eq!(copy(&src, &dst, None).expect("copy"), 9_000);
    assert_eq!(dst_mem.sink(), data);
}

#[test]
fn background_copy_yields_between_chunks_and_honours_limit() {
    let data = payload(20_000);
    let src_mem = MemoryHandle::with_source(&data, true);
    let dst_mem = MemoryHandle::with_source(b"", false);
    let src = memory_channel("src", ChannelMode::READ_WRITE, &src_mem);
    let dst = memory_channel("dst", ChannelMode::READ_WRITE, &dst_mem);

    let outcome: Outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    copy_background(
        &src,
        &dst,
        Some(10_000),
        Box::new(move |total, err| *slot.lock() = Some((total, err))),
    )
    .expect("start");

    assert!(outcome.lock().is_none(), "首步只搬一个块");
    assert!(src_mem.watch().contains(Interest::READABLE));
    assert!(!src.is_blocking(), "拷贝期间两端为非阻塞");

    for _ in 0..16 {
        if outcome.lock().is_some() {
            break;
        }
        src.notify(Interest::READABLE);
    }
    let (total, err) = outcome.lock().take().expect("copy finished");
    assert_eq!(total, 10_000);
    assert!(err.is_none());
    assert_eq!(dst_mem.sink(), &data[..10_000]);
    assert!(src.is_blocking() && dst.is_blocking(), "完成后恢复原阻塞模式");
    assert_eq!(src_mem.watch(), Interest::NONE, "完成后撤销事件登记");
}

#[test]
fn background_copy_waits_for_writability() {
    let src_mem = MemoryHandle::with_source(b"abcdef", true);
    let dst_mem = MemoryHandle::with_source(b"", false);
    dst_mem.0.lock().write_capacity = Some(2);
    let src = memory_channel("src", ChannelMode::READ_WRITE, &src_mem);
    let dst = memory_channel("dst", ChannelMode::READ_WRITE, &dst_mem);

    let outcome: Outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    copy_background(
        &src,
        &dst,
        None,
        Box::new(move |total, err| *slot.lock() = Some((total, err))),
    )
    .expect("start");
    assert!(dst_mem.watch().contains(Interest::WRITABLE));
    assert!(outcome.lock().is_none());

    dst_mem.0.lock().write_capacity = None;
    for _ in 0..8 {
        if outcome.lock().is_some() {
            break;
        }
        dst.notify(Interest::WRITABLE);
        src.notify(Interest::READABLE);
    }
    let (total, err) = outcome.lock().take().expect("copy finished");
    assert_eq!(total, 6);
    assert!(err.is_none());
    assert_eq!(dst_mem.sink(), b"abcdef");
}

#[test]
fn channel_in_background_copy_is_busy() {
    let src_mem = MemoryHandle::with_source(b"", false);
    let dst_mem = MemoryHandle::with_source(b"", false);
    let src = memory_channel("src", ChannelMode::READ_WRITE, &src_mem);
    let dst = memory_channel("dst", ChannelMode::READ_WRITE, &dst_mem);
    copy_background(&src, &dst, None, Box::new(|_, _| {})).expect("start");

    let other_mem = MemoryHandle::with_source(b"", false);
    let other = memory_channel("other", ChannelMode::READ_WRITE, &other_mem);
    let err = copy(&src, &other, None).expect_err("busy");
    assert_eq!(err.message(), "channel \"src\" is busy");
}

#[test]
fn copy_checks_directions_first() {
    let src_mem = MemoryHandle::with_source(b"x", true);
    let dst_mem = MemoryHandle::with_source(b"", false);
    let src = memory_channel("src", ChannelMode::READ_WRITE, &src_mem);
    let dst = memory_channel("ro", ChannelMode::READABLE, &dst_mem);
    let err = copy(&src, &dst, None).expect_err("read-only destination");
    assert_eq!(err.message(), "channel \"ro\" wasn't opened for writing");
}

#[test]
fn copy_errors_prefer_driver_detail() {
    let src_mem = MemoryHandle::with_source(b"", false);
    src_mem.0.lock().read_failure = Some((libc::EIO, Some("decoder lost sync")));
    let dst_mem = MemoryHandle::with_source(b"", false);
    let src = memory_channel("src", ChannelMode::READ_WRITE, &src_mem);
    let dst = memory_channel("dst", ChannelMode::READ_WRITE, &dst_mem);

    let outcome: Outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    copy_background(
        &src,
        &dst,
        None,
        Box::new(move |total, err| *slot.lock() = Some((total, err))),
    )
    .expect("start");
    let (total, err) = outcome.lock().take().expect("fails on first step");
    assert_eq!(total, 0);
    assert_eq!(err.expect("error").message(), "decoder lost sync");

    src_mem.0.lock().read_failure = Some((libc::EIO, None));
    let err = copy(&src, &dst, None).expect_err("sync copy fails");
    assert_eq!(err.message(), "error reading \"src\": I/O error");
}

#[test]
fn capture_output_prefers_driver_detail() {
    let mem = MemoryHandle::with_source(b"partial", true);
    let channel = memory_channel("pipe", ChannelMode::READABLE, &mem);
    assert_eq!(capture_output(&channel).expect("capture"), b"partial");

    mem.0.lock().read_failure = Some((libc::EIO, None));
    let err = capture_output(&channel).expect_err("generic");
    assert_eq!(err.message(), "error reading output from command: I/O error");

    mem.0.lock().read_failure = Some((libc::EIO, Some("child killed: SIGPIPE")));
    let err = capture_output(&channel).expect_err("detail");
    assert_eq!(err.message(), "child killed: SIGPIPE");
}
