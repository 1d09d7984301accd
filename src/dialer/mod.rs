mod quic;
mod tls;

pub use quic::QuicDialer;
pub(crate) use quic::{client_endpoint_for, quinn_config_from_tls};
pub use tls::TlsDialer;

use crate::config::ListenerSpec;
use crate::error::{PhantomError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// apex 默认端口
pub const DEFAULT_APEX_PORT: u16 = 443;

/// 远端连接抽象
///
/// 统一封装不同传输方式（TLS、QUIC）打开的逻辑连接
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Pin<Box<dyn Transport>>;

/// 解析后的 apex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedApex {
    pub host: String,
    pub port: u16,
}

impl ParsedApex {
    /// 解析 `host` 或 `host:port`，缺省端口为 443
    pub fn parse(apex: &str) -> Result<Self> {
        let apex = apex.trim();
        let (host, port) = match apex.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    PhantomError::resolve(format!("error parsing port number {:?}: {}", port, e))
                })?;
                (host, port)
            }
            None => (apex, DEFAULT_APEX_PORT),
        };

        if host.is_empty() {
            return Err(PhantomError::resolve(format!("missing host in apex {:?}", apex)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// 解析出第一个可用的 socket 地址
    pub async fn lookup(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| PhantomError::dial(self.to_string(), e))?
            .next()
            .ok_or_else(|| PhantomError::dial(self.to_string(), "no address resolved"))
    }
}

impl FromStr for ParsedApex {
    type Err = PhantomError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ParsedApex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP + TLS
    Tls,
    /// QUIC
    Quic,
}

impl TransportKind {
    pub fn for_listener(spec: &ListenerSpec) -> Self {
        if spec.use_tcp {
            TransportKind::Tls
        } else {
            TransportKind::Quic
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tls => write!(f, "tls"),
            TransportKind::Quic => write!(f, "quic"),
        }
    }
}

/// 打开拨号器所需的参数
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// 日志 span，拨号器内部的日志都挂在它下面
    pub span: tracing::Span,
    pub parsed: ParsedApex,
    pub insecure_skip_verify: bool,
    /// 底层持久连接断开后不再重建
    pub no_reconnection: bool,
}

/// 一次逻辑连接的拨号函数
#[async_trait]
pub trait DialFn: Send + Sync {
    /// 建立一条新的逻辑连接；`cancel` 触发时尽快返回
    async fn dial(&self, cancel: &CancellationToken) -> Result<BoxedStream>;

    /// 远端地址
    fn remote(&self) -> SocketAddr;
}

/// `open` 的结果
#[derive(Clone)]
pub struct DialHandle {
    pub remote: SocketAddr,
    pub dial: Arc<dyn DialFn>,
}

impl std::fmt::Debug for DialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialHandle")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// 拨号器接口，任何传输只要实现它就能被 forwarder 使用
#[async_trait]
pub trait Dialer: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn resolve(&self, apex: &str) -> Result<ParsedApex> {
        ParsedApex::parse(apex)
    }

    /// 完成首次握手并返回拨号函数；`cancel` 限定底层连接的生命周期
    async fn open(&self, cancel: CancellationToken, config: DialerConfig) -> Result<DialHandle>;
}

/// 按监听配置选择拨号器
#[derive(Clone)]
pub struct Dialers {
    tls: Arc<dyn Dialer>,
    quic: Arc<dyn Dialer>,
}

impl Dialers {
    pub fn new(tls: Arc<dyn Dialer>, quic: Arc<dyn Dialer>) -> Self {
        Self { tls, quic }
    }

    /// 两种传输都使用同一个拨号器
    pub fn uniform(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            tls: dialer.clone(),
            quic: dialer,
        }
    }

    pub fn select(&self, kind: TransportKind) -> Arc<dyn Dialer> {
        match kind {
            TransportKind::Tls => self.tls.clone(),
            TransportKind::Quic => self.quic.clone(),
        }
    }
}

impl Default for Dialers {
    fn default() -> Self {
        Self::new(Arc::new(TlsDialer::new()), Arc::new(QuicDialer::new()))
    }
}
