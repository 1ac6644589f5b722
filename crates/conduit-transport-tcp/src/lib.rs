#![deny(unsafe_code)]
#![doc = r#"
# conduit-transport-tcp

## 设计动机（Why）
- **定位**：在 `conduit-core` 的通道契约之上提供 TCP 客户端与服务端通道，
  覆盖双栈地址解析、逐对尝试的异步建连、多地址监听与接受回调。
- **架构角色**：驱动层实现。通道层只通过 [`ChannelDriver`](conduit_core::ChannelDriver)
  与本 crate 交互，事件循环只看到文件描述符与就绪掩码。

## 核心契约（What）
- **客户端**：按“远端 × 本地”顺序尝试候选地址对，首个成功者胜出；
  异步模式下首个 `EINPROGRESS` 即返回，后续由可写事件、阻塞读写或选项查询推进；
  全部失败时保留最后一个套接字与其错误，`-error` 读取一次后清除；
- **服务端**：对每个解析出的地址各开一个监听套接字，通配端口时所有套接字
  共享首个内核分配的端口；每个新连接以 `(通道, 数字主机, 端口)` 交给接受回调；
- **选项**：`-error`、`-connecting`、`-peername`、`-sockname`、`-keepalive`、`-nodelay`。

## 实现策略（How）
- 套接字创建与系统调用经 [`backend::SocketBackend`] 接缝，默认实现基于 `socket2`，
  测试以脚本化后端驱动状态机；
- `socket2` 没有对应接口的名字服务调用（`getnameinfo` 反查、`getservbyname` 服务名查询）
  收拢在私有 `sys` 模块，是本 crate 唯一允许 `unsafe` 的位置。

## 风险与考量（Trade-offs）
- 名字解析是同步的，会阻塞调用线程；
- 通配端口协调在端口冲突时整轮重启，最多十轮。
"#]

pub mod backend;
pub mod channel;
pub mod config;
pub mod connect;
pub mod error;
pub mod listener;
pub mod options;
pub mod resolver;
mod sys;
pub mod transport;

pub use channel::{TCP_TYPE_NAME, TcpDriver};
pub use config::{SocketPlan, SocketRequest, TcpClientConfig, TcpServerConfig};
pub use connect::{ConnectAttempt, ConnectOutcome, ConnectPhase};
pub use error::TcpError;
pub use listener::ListenerOptions;
pub use resolver::{AddressResolver, NameService, Purpose, SystemNameService};
pub use transport::TcpTransport;
