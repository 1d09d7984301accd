//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use phantom::config::{ApexConfig, ListenerSpec, Tunnel};
use phantom::dialer::{BoxedStream, DialFn, DialHandle, Dialer, DialerConfig, TransportKind};
use phantom::error::{PhantomError, Result};
use phantom::tunnel::{
    Node, OverlayConfig, OverlayTransport, TunnelBackend, TunnelClient, TunnelClientConfig,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

pub fn listen_addr() -> String {
    format!("127.0.0.1:{}", get_available_port())
}

pub fn listener(listen: &str, hostname: &str) -> ListenerSpec {
    ListenerSpec {
        label: String::new(),
        listen: listen.to_string(),
        hostname: hostname.to_string(),
        insecure: true,
        use_tcp: true,
    }
}

/// Self-signed certificate for localhost
pub fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("Failed to generate test certificate");
    let cert = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.signing_key.serialize_der());
    (vec![cert], PrivateKeyDer::Pkcs8(key))
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, handle)
}

/// Send a payload through `addr` and expect it echoed back
pub async fn assert_echo(addr: &str, payload: &[u8]) {
    let mut stream = timeout(Duration::from_secs(5), TcpStream::connect(addr))
        .await
        .expect("connect timeout")
        .expect("connect failed");
    stream.write_all(payload).await.expect("write failed");

    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("read timeout")
        .expect("read failed");
    assert_eq!(buf, payload);
}

/// Plain TCP dialer that connects every logical dial to `target`.
///
/// Hosts ending in `.invalid` are treated as unreachable.
pub struct DirectDialer {
    target: SocketAddr,
    pub opened: AtomicUsize,
    parked: AtomicUsize,
    gate: Option<Notify>,
}

impl DirectDialer {
    pub fn new(target: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            target,
            opened: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            gate: None,
        })
    }

    /// `open` waits for `open_gate` before answering
    pub fn gated(target: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            target,
            opened: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            gate: Some(Notify::new()),
        })
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub async fn wait_parked(&self) {
        for _ in 0..200 {
            if self.parked.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("open never reached the dialer");
    }
}

struct DirectDial {
    target: SocketAddr,
}

#[async_trait]
impl DialFn for DirectDial {
    async fn dial(&self, cancel: &CancellationToken) -> Result<BoxedStream> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PhantomError::dial(self.target.to_string(), "cancelled")),
            stream = TcpStream::connect(self.target) => {
                let stream = stream.map_err(|e| PhantomError::dial(self.target.to_string(), e))?;
                Ok(Box::pin(stream) as BoxedStream)
            }
        }
    }

    fn remote(&self) -> SocketAddr {
        self.target
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    async fn open(&self, _cancel: CancellationToken, config: DialerConfig) -> Result<DialHandle> {
        if let Some(gate) = &self.gate {
            self.parked.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
        }
        if config.parsed.host.ends_with(".invalid") {
            return Err(PhantomError::dial(config.parsed.to_string(), "unreachable"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(DialHandle {
            remote: self.target,
            dial: Arc::new(DirectDial {
                target: self.target,
            }),
        })
    }
}

/// Step at which the fake tunnel client fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Never,
    Register,
    Initialize,
    Start,
}

#[derive(Default)]
pub struct Calls {
    pub transports: AtomicUsize,
    pub transport_stops: AtomicUsize,
    pub registers: AtomicUsize,
    pub initializes: AtomicUsize,
    pub starts: AtomicUsize,
    pub closes: AtomicUsize,
    pub syncs: AtomicUsize,
    pub parked: AtomicUsize,
    pub order: Mutex<Vec<&'static str>>,
}

impl Calls {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn push(&self, step: &'static str) {
        self.order.lock().unwrap().push(step);
    }
}

pub struct FakeBackend {
    pub calls: Arc<Calls>,
    pub fail_at: FailAt,
    pub rejected: bool,
    /// `register` waits for this before answering
    pub gate: Option<Arc<Notify>>,
}

impl FakeBackend {
    pub fn new(fail_at: FailAt) -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(Calls::default()),
            fail_at,
            rejected: false,
            gate: None,
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(Calls::default()),
            fail_at: FailAt::Never,
            rejected: true,
            gate: None,
        })
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(Calls::default()),
            fail_at: FailAt::Never,
            rejected: false,
            gate: Some(Arc::new(Notify::new())),
        })
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    /// Wait until a connect attempt is parked in `register`
    pub async fn wait_parked(&self) {
        for _ in 0..200 {
            if Calls::count(&self.calls.parked) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connect attempt never reached register");
    }
}

struct FakeTransport {
    identity: String,
    calls: Arc<Calls>,
}

#[async_trait]
impl OverlayTransport for FakeTransport {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn connected_nodes(&self) -> Vec<Node> {
        Vec::new()
    }

    async fn stop(&self) {
        self.calls.transport_stops.fetch_add(1, Ordering::SeqCst);
        self.calls.push("transport.stop");
    }
}

#[async_trait]
impl TunnelBackend for FakeBackend {
    fn transport(&self, config: OverlayConfig) -> Result<Arc<dyn OverlayTransport>> {
        self.calls.transports.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeTransport {
            identity: config.identity,
            calls: self.calls.clone(),
        }))
    }

    async fn client(&self, config: TunnelClientConfig) -> Result<Arc<dyn TunnelClient>> {
        let node = Node {
            id: "node-1".to_string(),
            address: "10.0.0.1:443".to_string(),
        };
        config
            .recorder
            .record(&node.measurement_key(), Duration::from_millis(12));

        Ok(Arc::new(FakeClient {
            calls: self.calls.clone(),
            fail_at: self.fail_at,
            rejected: self.rejected,
            gate: self.gate.clone(),
            config: Mutex::new(config.configuration),
            node,
        }))
    }
}

struct FakeClient {
    calls: Arc<Calls>,
    fail_at: FailAt,
    rejected: bool,
    gate: Option<Arc<Notify>>,
    config: Mutex<ApexConfig>,
    node: Node,
}

impl FakeClient {
    fn step(&self, step: FailAt, counter: &AtomicUsize, name: &'static str) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        self.calls.push(name);
        if self.fail_at == step {
            return Err(PhantomError::dial("apex", format!("{} failed", name)));
        }
        Ok(())
    }

    fn reject(&self) -> Result<()> {
        if self.rejected {
            return Err(PhantomError::remote_rejection("tunnel is locked"));
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelClient for FakeClient {
    async fn register(&self, _cancel: &CancellationToken) -> Result<()> {
        if let Some(gate) = &self.gate {
            self.calls.parked.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
        }
        self.step(FailAt::Register, &self.calls.registers, "register")
    }

    async fn initialize(&self, _cancel: &CancellationToken) -> Result<()> {
        self.step(FailAt::Initialize, &self.calls.initializes, "initialize")
    }

    async fn start(&self, _cancel: &CancellationToken) -> Result<()> {
        self.step(FailAt::Start, &self.calls.starts, "start")
    }

    async fn close(&self) {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        self.calls.push("client.close");
    }

    fn current_config(&self) -> ApexConfig {
        self.config.lock().unwrap().clone()
    }

    async fn rebuild_tunnels(&self, tunnels: Vec<Tunnel>) -> Result<()> {
        self.config.lock().unwrap().tunnels = tunnels;
        Ok(())
    }

    async fn sync_config_tunnels(&self, _cancel: &CancellationToken) -> Result<()> {
        self.calls.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_apex(&self, apex: String) -> Result<()> {
        self.config.lock().unwrap().apex = apex;
        Ok(())
    }

    async fn unpublish_tunnel(&self, tunnel: &Tunnel) -> Result<()> {
        self.reject()?;
        let mut config = self.config.lock().unwrap();
        if let Some(t) = config.tunnels.iter_mut().find(|t| t.target == tunnel.target) {
            t.hostname = None;
        }
        Ok(())
    }

    async fn release_tunnel(&self, tunnel: &Tunnel) -> Result<()> {
        self.reject()?;
        self.config
            .lock()
            .unwrap()
            .tunnels
            .retain(|t| t.target != tunnel.target);
        Ok(())
    }

    fn connected_nodes(&self) -> Vec<Node> {
        vec![self.node.clone()]
    }
}
