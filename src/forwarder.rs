use crate::config::{get_idle_timeout, ListenerSpec};
use crate::dialer::{BoxedStream, DialHandle, Dialer, DialerConfig, TransportKind};
use crate::error::{PhantomError, Result};
use crate::events::{Event, EventBus};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// 数据复制缓冲区大小（64KB 适合高吞吐）
const COPY_BUFFER_SIZE: usize = 65536;

/// forwarder 流量统计（线程安全）
#[derive(Debug, Default)]
pub struct ForwarderStats {
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ForwarderStats {
    fn connection_started(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_ended(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// 一个运行中的 forwarder：本地监听 + 远端拨号器
///
/// 停止后即丢弃，不能重新启动。
pub struct Forwarder {
    spec: ListenerSpec,
    local_addr: SocketAddr,
    remote: SocketAddr,
    cancel: CancellationToken,
    stats: Arc<ForwarderStats>,
    events: EventBus,
    accept_task: JoinHandle<()>,
}

impl Forwarder {
    /// 启动 forwarder
    ///
    /// 依次解析 apex、绑定本地地址、打开远端拨号器；任何一步失败都不会留下
    /// 正在运行的任务，已绑定的监听器随之释放。
    pub async fn start(
        spec: ListenerSpec,
        dialer: Arc<dyn Dialer>,
        parent: &CancellationToken,
        events: EventBus,
    ) -> Result<Self> {
        let span = info_span!(
            "forwarder",
            listen = %spec.listen,
            via = %spec.hostname,
            insecure = spec.insecure,
            tcp = spec.use_tcp,
        );

        let parsed = dialer.resolve(&spec.hostname)?;

        let listener = TcpListener::bind(&spec.listen)
            .await
            .map_err(|e| PhantomError::bind(&spec.listen, e))?;
        let local_addr = listener.local_addr()?;

        let cancel = parent.child_token();
        let handle = dialer
            .open(
                cancel.clone(),
                DialerConfig {
                    span: span.clone(),
                    parsed,
                    insecure_skip_verify: spec.insecure,
                    no_reconnection: false,
                },
            )
            .await
            .inspect_err(|_| cancel.cancel())?;

        let stats = Arc::new(ForwarderStats::default());
        let remote = handle.remote;

        {
            let _enter = span.enter();
            info!(
                "Forwarder listening on {} via {} ({})",
                local_addr,
                remote,
                TransportKind::for_listener(&spec)
            );
        }

        let accept_task = tokio::spawn(
            accept_loop(listener, handle, cancel.clone(), stats.clone()).instrument(span),
        );

        events.emit(Event::ForwarderStarted(spec.listen.clone()));

        Ok(Self {
            spec,
            local_addr,
            remote,
            cancel,
            stats,
            events,
            accept_task,
        })
    }

    /// 关闭监听器并取消作用域内的拨号与转发任务
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept_task.await {
            warn!(listen = %self.spec.listen, "Accept loop ended abnormally: {}", e);
        }
        info!(listen = %self.spec.listen, "Forwarder stopped");
        self.events.emit(Event::ForwarderStopped(self.spec.listen.clone()));
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.spec.label = label.into();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handle: DialHandle,
    cancel: CancellationToken,
    stats: Arc<ForwarderStats>,
) {
    let idle_timeout = Duration::from_secs(get_idle_timeout());

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (local, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        debug!("Accepted connection from {}", peer);

        let handle = handle.clone();
        let cancel = cancel.clone();
        let stats = stats.clone();
        tokio::spawn(
            async move {
                stats.connection_started();
                if let Err(e) = serve_connection(local, &handle, &cancel, &stats, idle_timeout).await
                {
                    debug!("Connection from {} closed: {}", peer, e);
                }
                stats.connection_ended();
            }
            .in_current_span(),
        );
    }

    debug!("Accept loop stopped");
}

async fn serve_connection(
    local: TcpStream,
    handle: &DialHandle,
    cancel: &CancellationToken,
    stats: &ForwarderStats,
    idle_timeout: Duration,
) -> Result<()> {
    if let Err(e) = local.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let remote = handle.dial.dial(cancel).await?;

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = relay(local, remote, stats, idle_timeout) => result.map_err(PhantomError::from),
    }
}

/// 双向转发，直到两个方向都结束
async fn relay(
    local: TcpStream,
    remote: BoxedStream,
    stats: &ForwarderStats,
    idle_timeout: Duration,
) -> std::io::Result<()> {
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let upstream = async {
        let result = copy_with_stats(&mut local_read, &mut remote_write, idle_timeout, |n| {
            stats.add_bytes_sent(n)
        })
        .await;
        let _ = remote_write.shutdown().await;
        result
    };
    let downstream = async {
        let result = copy_with_stats(&mut remote_read, &mut local_write, idle_timeout, |n| {
            stats.add_bytes_received(n)
        })
        .await;
        let _ = local_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(upstream, downstream);
    debug!(
        "Relay finished: {} bytes sent, {} bytes received",
        sent.as_ref().copied().unwrap_or_default(),
        received.as_ref().copied().unwrap_or_default()
    );
    sent?;
    received?;
    Ok(())
}

/// 带空闲超时的数据复制，每次写入后立即更新统计
async fn copy_with_stats<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Duration,
    record: impl Fn(u64),
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Connection idle timeout",
                ))
            }
        };
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        record(n as u64);
    }

    writer.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[tokio::test]
    async fn test_copy_with_stats_counts_bytes() {
        let mut reader: &[u8] = b"hello phantom";
        let mut writer = Vec::new();
        let counted = AtomicU64::new(0);

        let total = copy_with_stats(&mut reader, &mut writer, Duration::from_secs(1), |n| {
            counted.fetch_add(n, Ordering::Relaxed);
        })
        .await
        .unwrap();

        assert_eq!(total, 13);
        assert_eq!(counted.load(Ordering::Relaxed), 13);
        assert_eq!(writer, b"hello phantom");
    }

    #[tokio::test]
    async fn test_copy_with_stats_idle_timeout() {
        let (mut client, _server) = tokio::io::duplex(64);
        let mut writer = Vec::new();

        let err = copy_with_stats(&mut client, &mut writer, Duration::from_millis(20), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = ForwarderStats::default();
        stats.connection_started();
        stats.connection_started();
        stats.connection_ended();
        stats.add_bytes_sent(10);
        stats.add_bytes_received(7);

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                active_connections: 1,
                total_connections: 2,
                bytes_sent: 10,
                bytes_received: 7,
            }
        );
    }
}
