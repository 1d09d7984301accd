use super::{BoxedStream, DialFn, DialHandle, Dialer, DialerConfig, TransportKind};
use crate::config::get_dial_timeout;
use crate::error::{PhantomError, Result};
use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// QUIC 心跳间隔
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(3);
/// QUIC 空闲超时
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// QUIC 拨号器：维持一条持久连接，每次拨号打开一个双向流
#[derive(Debug, Default)]
pub struct QuicDialer;

impl QuicDialer {
    pub fn new() -> Self {
        Self
    }
}

/// 构建 quinn 客户端配置
pub(crate) fn quinn_client_config(
    insecure_skip_verify: bool,
    alpn: &[&str],
) -> Result<quinn::ClientConfig> {
    quinn_config_from_tls(crate::tls::client_config(insecure_skip_verify, alpn)?)
}

/// 用现成的 rustls 配置构建 quinn 客户端配置，附带心跳和空闲超时
pub(crate) fn quinn_config_from_tls(
    tls_config: Arc<rustls::ClientConfig>,
) -> Result<quinn::ClientConfig> {
    let crypto = QuicClientConfig::try_from((*tls_config).clone())
        .map_err(|e| PhantomError::config(format!("invalid QUIC TLS config: {}", e)))?;

    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    if let Ok(idle) = MAX_IDLE_TIMEOUT.try_into() {
        transport.max_idle_timeout(Some(idle));
    }
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

/// 绑定一个与远端地址族匹配的客户端 endpoint
pub(crate) fn client_endpoint(remote: SocketAddr, config: quinn::ClientConfig) -> Result<Endpoint> {
    client_endpoint_for(remote.is_ipv6(), config)
}

pub(crate) fn client_endpoint_for(ipv6: bool, config: quinn::ClientConfig) -> Result<Endpoint> {
    let bind: SocketAddr = if ipv6 {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    };
    let mut endpoint = Endpoint::client(bind)?;
    endpoint.set_default_client_config(config);
    Ok(endpoint)
}

#[async_trait]
impl Dialer for QuicDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    async fn open(&self, cancel: CancellationToken, config: DialerConfig) -> Result<DialHandle> {
        let span = config.span.clone();
        open_quic(cancel, config).instrument(span).await
    }
}

async fn open_quic(cancel: CancellationToken, config: DialerConfig) -> Result<DialHandle> {
    let target = config.parsed.to_string();
    let remote = config.parsed.lookup().await?;

    let client_config = quinn_client_config(config.insecure_skip_verify, &[crate::tls::TCP_ALPN])?;
    let endpoint = client_endpoint(remote, client_config)?;

    let dial = Arc::new(QuicDial {
        target,
        remote,
        server_name: config.parsed.host.clone(),
        handshake_timeout: Duration::from_secs(get_dial_timeout()),
        no_reconnection: config.no_reconnection,
        endpoint,
        connection: Mutex::new(None),
    });

    let connection = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(PhantomError::dial(&dial.target, "cancelled"));
        }
        result = dial.connect() => result?,
    };
    *dial.connection.lock().await = Some(connection);

    info!("QUIC dialer connected to {} ({})", dial.target, remote);

    // 作用域取消时关闭底层连接
    let closer = dial.clone();
    tokio::spawn(
        async move {
            cancel.cancelled().await;
            if let Some(conn) = closer.connection.lock().await.take() {
                conn.close(0u32.into(), b"forwarder stopped");
            }
            closer.endpoint.close(0u32.into(), b"forwarder stopped");
            debug!("QUIC dialer for {} closed", closer.target);
        }
        .in_current_span(),
    );

    Ok(DialHandle { remote, dial })
}

struct QuicDial {
    target: String,
    remote: SocketAddr,
    server_name: String,
    handshake_timeout: Duration,
    no_reconnection: bool,
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
}

impl QuicDial {
    async fn connect(&self) -> Result<Connection> {
        let connecting = self
            .endpoint
            .connect(self.remote, &self.server_name)
            .map_err(|e| PhantomError::dial(&self.target, e))?;

        match timeout(self.handshake_timeout, connecting).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(PhantomError::dial(&self.target, e)),
            Err(_) => Err(PhantomError::dial(
                &self.target,
                format!("handshake timeout after {:?}", self.handshake_timeout),
            )),
        }
    }

    /// 取得可用的连接，必要时重连
    async fn live_connection(&self) -> Result<Connection> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            if self.no_reconnection {
                return Err(PhantomError::dial(&self.target, "connection closed"));
            }
            warn!("QUIC connection to {} lost, reconnecting", self.target);
        } else if self.no_reconnection {
            return Err(PhantomError::dial(&self.target, "dialer closed"));
        }

        let conn = self.connect().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl DialFn for QuicDial {
    async fn dial(&self, cancel: &CancellationToken) -> Result<BoxedStream> {
        let open = async {
            let conn = self.live_connection().await?;
            let (send, recv) = conn
                .open_bi()
                .await
                .map_err(|e| PhantomError::dial(&self.target, e))?;
            Ok::<BoxedStream, PhantomError>(Box::pin(QuicStream { send, recv }))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PhantomError::dial(&self.target, "cancelled")),
            result = open => result,
        }
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }
}

/// 双向流，读写分别委托给 quinn 的收发流
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}
