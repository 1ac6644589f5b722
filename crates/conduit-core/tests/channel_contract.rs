//! `channel_contract` 集成测试：以内存驱动验证通道层的通用契约。
//!
//! # 测试目标（Why）
//! - 半关闭误用必须在任何驱动调用之前被拒绝，依次关闭两侧等价于完整关闭；
//! - 非阻塞读写的“会阻塞”语义、输出积压的后台冲刷、事件兴趣与驱动 watch 的同步；
//! - 驱动在通道忙时发出的通知不会死锁，而是在区段结束后派发。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use conduit_core::error::codes;
use conduit_core::{ChannelMode, Direction, Interest, OptionContext, OptionValue};
use parking_lot::Mutex;
use support::{MemoryHandle, memory_channel};

#[test]
fn closing_read_side_twice_is_rejected() {
    let handle = MemoryHandle::with_source(b"", true);
    let channel = memory_channel("mem1", ChannelMode::READ_WRITE, &handle);

    channel.close_half(Direction::Read).expect("first half-close");
    let err = channel
        .close_half(Direction::Read)
        .expect_err("第二次关闭读侧必须失败");
    assert_eq!(
        err.message(),
        "Half-close of read-side not possible, side not opened or already closed"
    );
    assert_eq!(err.code(), codes::CHANNEL_HALF_CLOSE);
    assert_eq!(handle.0.lock().half_closed, vec![Direction::Read], "误用不得触达驱动");
}

#[test]
fn closing_both_sides_equals_full_close() {
    let handle = MemoryHandle::with_source(b"", true);
    let channel = memory_channel("mem2", ChannelMode::READ_WRITE, &handle);

    channel.close_half(Direction::Read).expect("read side");
    assert!(!channel.is_closed());
    channel.close_half(Direction::Write).expect("write side");

    assert!(channel.is_closed(), "关闭最后一个方向即完整关闭");
    let state = handle.0.lock();
    assert!(state.closed);
    assert_eq!(state.half_closed, vec![Direction::Read]);
}

#[test]
fn write_only_channel_rejects_reads() {
    let handle = MemoryHandle::with_source(b"data", true);
    let channel = memory_channel("mem3", ChannelMode::WRITABLE, &handle);
    let mut buf = [0u8; 8];
    let err = channel.read(&mut buf).expect_err("未以读方式打开");
    assert_eq!(err.message(), "channel \"mem3\" wasn't opened for reading");
    let err = channel
        .close_half(Direction::Read)
        .expect_err("未打开的方向不能半关闭");
    assert_eq!(err.code(), codes::CHANNEL_HALF_CLOSE);
}

#[test]
fn nonblocking_read_without_data_reports_blocked() {
    let handle = MemoryHandle::with_source(b"", false);
    let channel = memory_channel("mem4", ChannelMode::READ_WRITE, &handle);
    channel.set_blocking(false).expect("nonblocking");

    let mut buf = [0u8; 16];
    assert_eq!(channel.read(&mut buf).expect("read"), 0);
    assert!(channel.input_blocked());
    assert!(!channel.eof());

    handle.finish();
    assert_eq!(channel.read(&mut buf).expect("read"), 0);
    assert!(channel.eof());
    assert!(!channel.input_blocked());
}

#[test]
fn short_reads_are_served_from_the_input_buffer() {
    let handle = MemoryHandle::with_source(b"0123456789", true);
    let channel = memory_channel("mem5", ChannelMode::READ_WRITE, &handle);

    let mut buf = [0u8; 4];
    assert_eq!(channel.read(&mut buf).expect("read"), 4);
    assert_eq!(&buf, b"0123");
    assert_eq!(channel.pending_input(), 6);
    assert_eq!(channel.read(&mut buf).expect("read"), 4);
    assert_eq!(&buf, b"4567");
}

#[test]
fn nonblocking_leftovers_flush_in_background() {
    let handle = MemoryHandle::with_source(b"", false);
    handle.0.lock().write_capacity = Some(3);
    let channel = memory_channel("mem6", ChannelMode::READ_WRITE, &handle);
    channel.set_blocking(false).expect("nonblocking");

    channel.write(b"0123456789").expect("write");
    channel.flush().expect("flush");
    assert_eq!(channel.pending_output(), 7);
    assert!(handle.watch().contains(Interest::WRITABLE), "积压时需登记可写");

    handle.0.lock().write_capacity = None;
    channel.notify(Interest::WRITABLE);
    assert_eq!(channel.pending_output(), 0);
    assert_eq!(handle.sink(), b"0123456789");
    assert_eq!(handle.watch(), Interest::NONE, "冲刷完成后撤销可写兴趣");
}

#[test]
fn event_handlers_drive_the_driver_watch() {
    let handle = MemoryHandle::with_source(b"", false);
    let channel = memory_channel("mem7", ChannelMode::READ_WRITE, &handle);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let id = channel.create_handler(Interest::READABLE, move |_, mask| sink.lock().push(mask));
    assert_eq!(handle.watch(), Interest::READABLE);

    channel.notify(Interest::READABLE | Interest::WRITABLE);
    assert_eq!(*seen.lock(), vec![Interest::READABLE], "只派发登记过的兴趣");

    channel.delete_handler(id);
    assert_eq!(handle.watch(), Interest::NONE);
}

#[test]
fn notifications_raised_inside_driver_calls_are_deferred() {
    let handle = MemoryHandle::with_source(b"abc", true);
    handle.0.lock().notify_on_read = Some(Interest::WRITABLE);
    let channel = memory_channel("mem8", ChannelMode::READ_WRITE, &handle);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    channel.create_handler(Interest::WRITABLE, move |chan, _| {
        // 回调内再次访问通道不得死锁。
        let _ = chan.pending_output();
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut buf = [0u8; 8];
    assert_eq!(channel.read(&mut buf).expect("read"), 3);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "延迟通知应在读取结束后派发");
}

#[test]
fn driver_detail_wins_over_generic_read_error() {
    let handle = MemoryHandle::with_source(b"", false);
    handle.0.lock().read_failure = Some((libc::EIO, Some("child process exited abnormally")));
    let channel = memory_channel("mem9", ChannelMode::READ_WRITE, &handle);
    let mut buf = [0u8; 8];
    let err = channel.read(&mut buf).expect_err("read fails");
    assert_eq!(err.message(), "child process exited abnormally");

    handle.0.lock().read_failure = Some((libc::EIO, None));
    let err = channel.read(&mut buf).expect_err("read fails");
    assert_eq!(err.message(), "error reading \"mem9\": I/O error");
    assert_eq!(err.error_code_tokens()[..2], ["POSIX", "EIO"]);
}

#[test]
fn generic_options_are_handled_by_the_channel() {
    let handle = MemoryHandle::with_source(b"", false);
    let channel = memory_channel("mem10", ChannelMode::READ_WRITE, &handle);
    let ctx = OptionContext::default();

    assert_eq!(
        channel.get_option(&ctx, "-blocking").expect("get"),
        OptionValue::flag(true)
    );
    channel.set_option("-blocking", "off").expect("set");
    assert!(!handle.0.lock().blocking, "阻塞模式需下发到驱动");
    channel.set_option("-buffersize", "8").expect("set");
    assert_eq!(channel.buffer_size(), 8);

    let listing = channel.get_options(&ctx).expect("listing");
    let names: Vec<&str> = listing.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["-blocking", "-buffersize"]);

    let err = channel.set_option("-bogus", "1").expect_err("unknown option");
    assert_eq!(err.code(), codes::CHANNEL_BAD_OPTION);
    assert_eq!(
        err.message(),
        "bad option \"-bogus\": should be one of -blocking, or -buffersize",
        "未知选项提示应包含通用选项名"
    );
    let err = channel.get_option(&ctx, "-bogus").expect_err("unknown option");
    assert_eq!(err.code(), codes::CHANNEL_BAD_OPTION);
    assert!(err.message().ends_with("-blocking, or -buffersize"), "读取提示不符：{}", err.message());
}

#[test]
fn close_runs_close_handlers_once() {
    let handle = MemoryHandle::with_source(b"", true);
    let channel = memory_channel("mem11", ChannelMode::READ_WRITE, &handle);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    channel.add_close_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    channel.write(b"tail").expect("buffered write");

    channel.close().expect("close");
    channel.close().expect("重复关闭是空操作");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(handle.sink(), b"tail", "关闭前冲刷缓冲");
    let mut buf = [0u8; 4];
    assert_eq!(
        channel.read(&mut buf).expect_err("closed").code(),
        codes::CHANNEL_CLOSED
    );
}
