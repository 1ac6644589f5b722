//! # resolver 模块说明
//!
//! ## 意图（Why）
//! - 把“主机 + 服务”翻译为有序的候选地址列表，供建连状态机与监听管理器逐个尝试；
//!   名字服务抽象为 [`NameService`]，测试可注入确定性的结果。
//!
//! ## 逻辑（How）
//! - 服务：十进制端口直接解析，否则查询服务数据库（`tcp` 协议）；
//! - 主机缺省：`Connect` 用途报错，绑定类用途展开为 IPv4 与 IPv6 两个通配地址；
//! - 数字字面量不经过名字服务；具名主机按系统解析顺序返回并去重；
//! - 绑定类用途把 IPv4 地址稳定地排在 IPv6 之前，保持 `-sockname` 输出稳定。
//!
//! ## 契约（What）
//! - 返回的列表非空；解析失败的消息携带调用方给出的原始主机文本。

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use conduit_core::HostNameCache;
use conduit_core::error::{CoreError, ErrorCategory, categorize_io_error};
use tracing::trace;

use crate::error::{RESOLVE_CODE, TcpError};
use crate::sys;

/// 地址用途。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
    /// 客户端的远端地址，主机必填。
    Connect,
    /// 客户端的本地绑定地址，缺省为通配。
    ClientBind,
    /// 服务端监听地址，缺省为通配。
    Listen,
}

impl Purpose {
    const fn will_bind(self) -> bool {
        !matches!(self, Purpose::Connect)
    }
}

/// 名字服务接缝。
pub trait NameService: Send + Sync {
    fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// 基于系统解析器的名字服务。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemNameService;

impl NameService for SystemNameService {
    fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        (host, port).to_socket_addrs().map(Iterator::collect)
    }
}

/// 地址解析器。
#[derive(Clone)]
pub struct AddressResolver {
    names: Arc<dyn NameService>,
    host_names: Arc<HostNameCache>,
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressResolver")
            .field("host_names", &self.host_names)
            .finish_non_exhaustive()
    }
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self::new(HostNameCache::process())
    }
}

impl AddressResolver {
    pub fn new(host_names: Arc<HostNameCache>) -> Self {
        Self::with_name_service(Arc::new(SystemNameService), host_names)
    }

    pub fn with_name_service(names: Arc<dyn NameService>, host_names: Arc<HostNameCache>) -> Self {
        Self { names, host_names }
    }

    /// 本机主机名，首次调用时计算。
    pub fn local_host_name(&self) -> &str {
        self.host_names.get()
    }

    /// 解析主机与服务文本。
    pub fn resolve(
        &self,
        host: Option<&str>,
        service: &str,
        purpose: Purpose,
    ) -> Result<Vec<SocketAddr>, CoreError> {
        let port = parse_service(service)?;
        self.resolve_port(host, port, purpose)
    }

    /// 以已解析的端口展开候选地址。
    pub fn resolve_port(
        &self,
        host: Option<&str>,
        port: u16,
        purpose: Purpose,
    ) -> Result<Vec<SocketAddr>, CoreError> {
        let host = host.filter(|host| !host.is_empty());
        let Some(host) = host else {
            if !purpose.will_bind() {
                return Err(TcpError::MissingHost.into());
            }
            return Ok(vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            ]);
        };

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let mut candidates = Vec::new();
        let found = self
            .names
            .lookup(host, port)
            .map_err(|err| resolve_error(host, err))?;
        for addr in found {
            if !candidates.contains(&addr) {
                candidates.push(addr);
            }
        }
        if candidates.is_empty() {
            return Err(resolve_error(
                host,
                io::Error::new(io::ErrorKind::NotFound, "no address associated with name"),
            ));
        }
        if purpose.will_bind() {
            candidates.sort_by_key(SocketAddr::is_ipv6);
        }
        trace!(host, port, candidates = candidates.len(), ?purpose, "host resolved");
        Ok(candidates)
    }
}

/// 解析服务文本：十进制端口或服务数据库中的名字。
pub fn parse_service(service: &str) -> Result<u16, CoreError> {
    let text = service.trim();
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return match text.parse::<u32>() {
            Ok(port) => u16::try_from(port).map_err(|_| TcpError::PortTooHigh.into()),
            Err(_) => Err(TcpError::PortTooHigh.into()),
        };
    }
    sys::service_port(text).ok_or_else(|| TcpError::InvalidService(service.to_owned()).into())
}

fn resolve_error(host: &str, error: io::Error) -> CoreError {
    let category = match categorize_io_error(&error) {
        ErrorCategory::Retryable => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    };
    CoreError::new(
        RESOLVE_CODE,
        format!("couldn't open socket: cannot resolve \"{host}\": {error}"),
    )
    .with_category(category)
    .with_cause(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedNames(Vec<SocketAddr>);

    impl NameService for FixedNames {
        fn lookup(&self, _host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
            Ok(self
                .0
                .iter()
                .map(|addr| SocketAddr::new(addr.ip(), port))
                .collect())
        }
    }

    struct FailingNames;

    impl NameService for FailingNames {
        fn lookup(&self, _host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
            Err(io::Error::other("Name or service not known"))
        }
    }

    fn resolver(names: impl NameService + 'static) -> AddressResolver {
        AddressResolver::with_name_service(
            Arc::new(names),
            Arc::new(HostNameCache::with_name("unit.example.org")),
        )
    }

    fn addr(text: &str) -> SocketAddr {
        text.parse().expect("测试地址应合法")
    }

    #[test]
    fn wildcard_listen_yields_ipv4_then_ipv6() {
        let resolver = resolver(FixedNames(Vec::new()));
        let list = resolver
            .resolve(None, "8080", Purpose::Listen)
            .expect("通配地址应成功");
        assert_eq!(list, vec![addr("0.0.0.0:8080"), addr("[::]:8080")]);
    }

    #[test]
    fn connect_requires_host() {
        let resolver = resolver(FixedNames(Vec::new()));
        let err = resolver
            .resolve(None, "80", Purpose::Connect)
            .expect_err("缺少主机应失败");
        assert_eq!(err.category(), ErrorCategory::InvalidInput);
    }

    #[test]
    fn numeric_literal_skips_name_service() {
        let resolver = resolver(FailingNames);
        let list = resolver
            .resolve(Some("::1"), "7", Purpose::Connect)
            .expect("字面量不应查询名字服务");
        assert_eq!(list, vec![addr("[::1]:7")]);
    }

    #[test]
    fn named_host_keeps_order_and_dedups() {
        let resolver = resolver(FixedNames(vec![
            addr("[::1]:0"),
            addr("127.0.0.1:0"),
            addr("[::1]:0"),
        ]));
        let connect = resolver
            .resolve(Some("dual.test"), "9", Purpose::Connect)
            .expect("解析应成功");
        assert_eq!(connect, vec![addr("[::1]:9"), addr("127.0.0.1:9")]);

        let listen = resolver
            .resolve(Some("dual.test"), "9", Purpose::Listen)
            .expect("解析应成功");
        assert_eq!(listen, vec![addr("127.0.0.1:9"), addr("[::1]:9")]);
    }

    #[test]
    fn resolution_failure_names_the_host() {
        let resolver = resolver(FailingNames);
        let err = resolver
            .resolve(Some("no-such-host.invalid"), "80", Purpose::Connect)
            .expect_err("解析应失败");
        assert!(
            err.message()
                .starts_with("couldn't open socket: cannot resolve \"no-such-host.invalid\""),
            "消息应包含原始主机文本：{}",
            err.message()
        );
        assert_eq!(err.code(), RESOLVE_CODE);
    }

    #[test]
    fn service_parsing_rules() {
        assert_eq!(parse_service("0").expect("0 合法"), 0);
        assert_eq!(parse_service("65535").expect("上限合法"), 65535);
        assert_eq!(
            parse_service("65536").expect_err("超限").message(),
            "couldn't open socket: port number too high"
        );
        assert_eq!(
            parse_service("-1").expect_err("负数").message(),
            "expected integer but got \"-1\""
        );
        assert_eq!(
            parse_service("no-such-service-xyz").expect_err("未知服务").message(),
            "expected integer but got \"no-such-service-xyz\""
        );
    }

    #[test]
    fn local_host_name_comes_from_cache() {
        let resolver = resolver(FixedNames(Vec::new()));
        assert_eq!(resolver.local_host_name(), "unit.example.org");
    }
}
