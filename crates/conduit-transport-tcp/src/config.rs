//! 客户端与服务端的打开参数。
//!
//! # 教案式说明
//! - **意图 (Why)**：把“套接字命令”的参数组合校验与真正的系统调用分离，
//!   组合错误在任何 syscall 之前以固定文案返回；
//! - **逻辑 (How)**：[`SocketRequest`] 承载命令层收集到的原始文本，
//!   [`SocketRequest::validate`] 校验组合并解析端口，产出 [`SocketPlan`]；
//! - **契约 (What)**：服务端缺省 `reuseaddr` 开、`reuseport` 关、`backlog` 为 -1（平台默认）。

use conduit_core::error::CoreError;

use crate::error::TcpError;
use crate::listener::ListenerOptions;
use crate::resolver::parse_service;

/// 客户端建连参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpClientConfig {
    host: String,
    port: u16,
    my_addr: Option<String>,
    my_port: u16,
    async_connect: bool,
}

impl TcpClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            my_addr: None,
            my_port: 0,
            async_connect: false,
        }
    }

    /// 本地绑定地址；缺省为通配。
    pub fn with_my_addr(mut self, addr: impl Into<String>) -> Self {
        self.my_addr = Some(addr.into());
        self
    }

    pub fn with_my_port(mut self, port: u16) -> Self {
        self.my_port = port;
        self
    }

    /// 异步建连：立即返回通道，连接在后台完成。
    pub fn with_async(mut self, async_connect: bool) -> Self {
        self.async_connect = async_connect;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn my_addr(&self) -> Option<&str> {
        self.my_addr.as_deref()
    }

    pub fn my_port(&self) -> u16 {
        self.my_port
    }

    pub fn is_async(&self) -> bool {
        self.async_connect
    }
}

/// 服务端监听参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpServerConfig {
    service: String,
    host: Option<String>,
    listener: ListenerOptions,
}

impl TcpServerConfig {
    /// `service` 为端口号或服务名，`"0"` 表示由系统选择。
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            host: None,
            listener: ListenerOptions::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.listener.backlog = backlog;
        self
    }

    pub fn with_reuse_addr(mut self, reuse: bool) -> Self {
        self.listener.reuse_addr = reuse;
        self
    }

    pub fn with_reuse_port(mut self, reuse: bool) -> Self {
        self.listener.reuse_port = reuse;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn listener_options(&self) -> &ListenerOptions {
        &self.listener
    }
}

/// 命令层收集到的原始参数。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketRequest {
    pub server: bool,
    pub host: Option<String>,
    pub service: String,
    pub my_addr: Option<String>,
    pub my_port: Option<String>,
    pub async_connect: bool,
    pub reuse_addr: Option<bool>,
    pub reuse_port: Option<bool>,
    pub backlog: Option<i32>,
}

/// 校验后的打开计划。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketPlan {
    Client(TcpClientConfig),
    Server(TcpServerConfig),
}

impl SocketRequest {
    /// 校验参数组合。
    ///
    /// 顺序：`-async` 与服务端互斥；`-myport` 解析后对服务端必须为 0；
    /// 客户端必须给出主机且不得携带服务端专属选项；最后解析客户端端口。
    pub fn validate(self) -> Result<SocketPlan, CoreError> {
        if self.server && self.async_connect {
            return Err(TcpError::AsyncServer.into());
        }
        let my_port = match self.my_port.as_deref() {
            Some(text) => parse_service(text)?,
            None => 0,
        };

        if self.server {
            if my_port != 0 {
                return Err(TcpError::MyPortOnServer.into());
            }
            let mut config = TcpServerConfig::new(self.service);
            if let Some(host) = self.my_addr {
                config = config.with_host(host);
            }
            if let Some(reuse) = self.reuse_addr {
                config = config.with_reuse_addr(reuse);
            }
            if let Some(reuse) = self.reuse_port {
                config = config.with_reuse_port(reuse);
            }
            if let Some(backlog) = self.backlog {
                config = config.with_backlog(backlog);
            }
            return Ok(SocketPlan::Server(config));
        }

        let Some(host) = self.host.filter(|host| !host.is_empty()) else {
            return Err(TcpError::MissingHost.into());
        };
        if self.reuse_addr.is_some() || self.reuse_port.is_some() || self.backlog.is_some() {
            return Err(TcpError::ServerOnlyOptions.into());
        }
        let port = parse_service(&self.service)?;
        let mut config = TcpClientConfig::new(host, port)
            .with_my_port(my_port)
            .with_async(self.async_connect);
        if let Some(addr) = self.my_addr {
            config = config.with_my_addr(addr);
        }
        Ok(SocketPlan::Client(config))
    }
}
