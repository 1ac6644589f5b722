//! `interp_registry` 集成测试：通道注册表引用计数与接受回调记录的生命周期。

mod support;

use std::sync::Arc;

use conduit_core::error::codes;
use conduit_core::{AcceptRecord, ChannelMode, CoreError, Interp};
use parking_lot::Mutex;
use support::{MemoryHandle, memory_channel};

#[test]
fn unregister_closes_channel_when_last_reference_goes() {
    let first = Interp::new();
    let second = Interp::new();
    let mem = MemoryHandle::with_source(b"", true);
    let channel = memory_channel("sockfeed", ChannelMode::READ_WRITE, &mem);

    first.channels().register(&channel);
    first.channels().register(&channel);
    second.channels().register(&channel);
    assert_eq!(channel.ref_count(), 2, "同一解释器重复注册不增加引用");

    first.channels().unregister("sockfeed").expect("unregister");
    assert!(!channel.is_closed(), "仍被另一个解释器持有");
    second.channels().unregister("sockfeed").expect("unregister");
    assert!(mem.0.lock().closed);

    let err = second
        .channels()
        .unregister("sockfeed")
        .expect_err("already gone");
    assert_eq!(err.code(), codes::CHANNEL_UNKNOWN);
}

#[test]
fn names_filter_by_pattern() {
    let interp = Interp::new();
    for name in ["sock1", "sock2", "file7"] {
        let mem = MemoryHandle::with_source(b"", true);
        interp
            .channels()
            .register(&memory_channel(name, ChannelMode::READ_WRITE, &mem));
    }
    assert_eq!(interp.channels().names(Some("sock*")), ["sock1", "sock2"]);
    assert_eq!(interp.channels().names(None).len(), 3);
    assert!(interp.channels().lookup("file7").is_ok());
}

#[test]
fn accept_registers_channel_and_runs_script() {
    let interp = Interp::new();
    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    let record = AcceptRecord::new(
        &interp,
        Box::new(move |_, channel, host, port| {
            *slot.lock() = Some((channel.name().to_owned(), host.to_owned(), port));
            Ok(())
        }),
    );
    let mem = MemoryHandle::with_source(b"", true);
    let mut handler = record.into_handler();
    handler(
        memory_channel("sockabc", ChannelMode::READ_WRITE, &mem),
        "127.0.0.1".to_owned(),
        40000,
    );

    assert_eq!(
        *seen.lock(),
        Some(("sockabc".to_owned(), "127.0.0.1".to_owned(), 40000))
    );
    assert!(interp.channels().contains("sockabc"));
}

#[test]
fn failing_script_becomes_background_error_and_drops_channel() {
    let interp = Interp::new();
    let record = AcceptRecord::new(
        &interp,
        Box::new(|_, _, _, _| Err(CoreError::new("conduit.script.error", "invalid command name \"onAccept\""))),
    );
    let mem = MemoryHandle::with_source(b"", true);
    record.accept(
        memory_channel("sockbad", ChannelMode::READ_WRITE, &mem),
        "::1",
        5000,
    );

    let errors = interp.take_background_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message(), "invalid command name \"onAccept\"");
    assert!(!interp.channels().contains("sockbad"));
    assert!(mem.0.lock().closed);
}

#[test]
fn deleted_interpreter_closes_new_connections() {
    let interp = Interp::new();
    let called = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&called);
    let record = AcceptRecord::new(
        &interp,
        Box::new(move |_, _, _, _| {
            *flag.lock() = true;
            Ok(())
        }),
    );
    let registered = MemoryHandle::with_source(b"", true);
    interp
        .channels()
        .register(&memory_channel("sockold", ChannelMode::READ_WRITE, &registered));

    interp.delete().expect("delete");
    assert!(registered.0.lock().closed, "销毁解释器释放其全部通道");

    let mem = MemoryHandle::with_source(b"", true);
    record.accept(
        memory_channel("socknew", ChannelMode::READ_WRITE, &mem),
        "10.0.0.1",
        1,
    );
    assert!(!*called.lock(), "解释器已销毁，不得调用脚本");
    assert!(mem.0.lock().closed);
}
