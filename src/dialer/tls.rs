use super::{BoxedStream, DialFn, DialHandle, Dialer, DialerConfig, TransportKind};
use crate::config::get_dial_timeout;
use crate::error::{PhantomError, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

/// TLS over TCP 拨号器：每次拨号建立一条新的 TLS 连接
#[derive(Debug, Default)]
pub struct TlsDialer;

impl TlsDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    async fn open(&self, cancel: CancellationToken, config: DialerConfig) -> Result<DialHandle> {
        let span = config.span.clone();
        open_tls(cancel, config).instrument(span).await
    }
}

async fn open_tls(cancel: CancellationToken, config: DialerConfig) -> Result<DialHandle> {
    let target = config.parsed.to_string();
    let remote = config.parsed.lookup().await?;

    let server_name = ServerName::try_from(config.parsed.host.clone())
        .map_err(|e| PhantomError::resolve(format!("invalid server name: {}", e)))?;

    let tls_config =
        crate::tls::client_config(config.insecure_skip_verify, &[crate::tls::TCP_ALPN])?;

    let dial = Arc::new(TlsDial {
        target,
        remote,
        server_name,
        connector: TlsConnector::from(tls_config),
        handshake_timeout: Duration::from_secs(get_dial_timeout()),
    });

    // 首次握手，确认远端可达
    let first = dial.dial(&cancel).await?;
    drop(first);

    info!("TLS dialer ready for {} ({})", dial.target, remote);

    Ok(DialHandle { remote, dial })
}

struct TlsDial {
    target: String,
    remote: SocketAddr,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    handshake_timeout: Duration,
}

impl TlsDial {
    async fn connect(&self) -> Result<BoxedStream> {
        let tcp_stream = TcpStream::connect(self.remote)
            .await
            .map_err(|e| PhantomError::dial(&self.target, e))?;
        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), tcp_stream)
            .await
            .map_err(|e| PhantomError::dial(&self.target, format!("TLS handshake failed: {}", e)))?;

        Ok(Box::pin(tls_stream))
    }
}

#[async_trait]
impl DialFn for TlsDial {
    async fn dial(&self, cancel: &CancellationToken) -> Result<BoxedStream> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PhantomError::dial(&self.target, "cancelled")),
            result = timeout(self.handshake_timeout, self.connect()) => match result {
                Ok(stream) => stream,
                Err(_) => Err(PhantomError::dial(
                    &self.target,
                    format!("handshake timeout after {:?}", self.handshake_timeout),
                )),
            },
        }
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }
}
