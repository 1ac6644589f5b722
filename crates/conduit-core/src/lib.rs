#![deny(unsafe_code)]
#![doc = "conduit-core: 事件驱动、非阻塞通道层的核心契约。"]
#![doc = ""]
#![doc = "== 模块地图 =="]
#![doc = "- `channel`：通道句柄与驱动能力集合（读写、半关闭、阻塞切换、选项、线程交接）；"]
#![doc = "- `registry` / `interp`：解释器级通道表、变量与接受回调清理钩子；"]
#![doc = "- `event`：就绪事件循环接缝与基于 `poll(2)` 的参考实现；"]
#![doc = "- `copy`：通道间后台拷贝与命令输出采集；"]
#![doc = "- `error` / `errno`：错误码、POSIX 令牌与驱动错误合并规则；"]
#![doc = "- `host`：进程级主机名缓存。"]

pub mod channel;
pub mod copy;
pub mod errno;
pub mod error;
pub mod event;
pub mod host;
pub mod interp;
pub mod options;
pub mod registry;
mod sys;

pub use channel::{
    Channel, ChannelConfig, ChannelDriver, ChannelMode, ChannelNotifier, Direction, HandlerId,
    ThreadAction,
};
pub use error::{ChannelError, CoreError, DriverError, ErrorCategory};
pub use event::{EventLoop, FileHandler, Interest, Notifier};
pub use host::HostNameCache;
pub use interp::{AcceptHandler, AcceptRecord, AcceptScript, Interp};
pub use options::{OptionContext, OptionListing, OptionValue};
pub use registry::ChannelRegistry;
