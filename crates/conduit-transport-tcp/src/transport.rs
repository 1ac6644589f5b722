//! # transport 模块说明
//!
//! ## 意图（Why）
//! - [`TcpTransport`] 是本 crate 的入口：持有事件循环通知器与地址解析器，
//!   把“解析 → 建连/监听 → 包装为通道”串成一次调用；
//! - [`TcpTransport::open_socket`] 对应解释器的套接字命令：校验参数、打开通道、
//!   建立接受回调记录并注册到解释器的通道表。
//!
//! ## 契约（What）
//! - 同步建连失败、异步建连在进入后台前失败：返回 `couldn't open socket: <平台文案>`，
//!   不创建通道；
//! - 服务端通道关闭时与解释器解除关联，之后不再执行接受脚本。

use std::sync::Arc;

use conduit_core::channel::Channel;
use conduit_core::error::CoreError;
use conduit_core::event::Notifier;
use conduit_core::interp::{AcceptHandler, AcceptRecord, AcceptScript, Interp};
use conduit_core::ChannelMode;
use socket2::Socket;
use tracing::{debug, info};

use crate::backend::SystemSockets;
use crate::channel::{client_channel, connecting_channel, server_channel};
use crate::config::{SocketPlan, SocketRequest, TcpClientConfig, TcpServerConfig};
use crate::connect::ConnectAttempt;
use crate::error::{self, TcpError, map_io_error};
use crate::listener::open_listeners;
use crate::resolver::{AddressResolver, Purpose};

/// TCP 通道工厂。
#[derive(Clone)]
pub struct TcpTransport {
    notifier: Arc<dyn Notifier>,
    resolver: AddressResolver,
    test_mode: bool,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("resolver", &self.resolver)
            .field("test_mode", &self.test_mode)
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// 使用系统解析器与进程级主机名缓存。
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_resolver(notifier, AddressResolver::default())
    }

    pub fn with_resolver(notifier: Arc<dyn Notifier>, resolver: AddressResolver) -> Self {
        Self {
            notifier,
            resolver,
            test_mode: false,
        }
    }

    /// 异步建连测试模式：读写路径不再自动推进连接，
    /// 仅阻塞读写或事件循环回调会推进。
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    /// 打开客户端通道。
    pub fn open_client(&self, config: &TcpClientConfig) -> Result<Channel, CoreError> {
        let mut attempt = ConnectAttempt::<SystemSockets>::resolve(&self.resolver, config)?;
        let outcome = attempt.begin(&SystemSockets);
        let channel = connecting_channel(
            attempt,
            outcome,
            Arc::clone(&self.notifier),
            self.test_mode,
        )
        .map_err(|err| map_io_error(error::OPEN, err))?;
        debug!(
            channel = channel.name(),
            host = config.host(),
            port = config.port(),
            asynchronous = config.is_async(),
            "client channel opened"
        );
        Ok(channel)
    }

    /// 打开服务端通道；每个新连接以 `(通道, 数字主机, 端口)` 调用 `accept`。
    pub fn open_server(
        &self,
        config: &TcpServerConfig,
        accept: AcceptHandler,
    ) -> Result<Channel, CoreError> {
        let candidates = self
            .resolver
            .resolve(config.host(), config.service(), Purpose::Listen)?;
        let listeners = open_listeners(&SystemSockets, &candidates, config.listener_options())?;
        let addrs: Vec<String> = listeners.iter().map(|l| l.addr.to_string()).collect();
        let sockets: Vec<Socket> = listeners.into_iter().map(|l| l.socket).collect();
        let channel = server_channel(sockets, Arc::clone(&self.notifier), accept);
        info!(channel = channel.name(), addrs = ?addrs, "server channel listening");
        Ok(channel)
    }

    /// 包装一个外部已连接的套接字。
    pub fn make_client_channel(&self, socket: Socket, mode: ChannelMode) -> Channel {
        client_channel(socket, Arc::clone(&self.notifier), mode)
    }

    /// 套接字命令：校验参数并在解释器中注册新通道。
    ///
    /// # 执行逻辑（How）
    /// 1. [`SocketRequest::validate`] 校验组合；
    /// 2. 客户端直接打开；服务端创建 [`AcceptRecord`]（登记到解释器的清理表），
    ///    并在通道关闭时解除记录与解释器的关联；
    /// 3. 把通道注册到解释器通道表。
    pub fn open_socket(
        &self,
        interp: &Arc<Interp>,
        request: SocketRequest,
        accept_script: Option<AcceptScript>,
    ) -> Result<Channel, CoreError> {
        let channel = match request.validate()? {
            SocketPlan::Client(config) => self.open_client(&config)?,
            SocketPlan::Server(config) => {
                let script = accept_script.ok_or(TcpError::MissingServerCommand)?;
                let record = AcceptRecord::new(interp, script);
                let channel = self.open_server(&config, Arc::clone(&record).into_handler())?;
                channel.add_close_handler(move || record.detach());
                channel
            }
        };
        interp.channels().register(&channel);
        Ok(channel)
    }
}
