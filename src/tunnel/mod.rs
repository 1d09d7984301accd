/// 隧道客户端的能力接口
///
/// 注册协议和隧道定义的协商由嵌入方实现的 `TunnelClient` 负责，这里只定义
/// 控制器需要调用的能力，以及默认的 QUIC overlay 传输。
mod controller;
mod overlay;

pub use controller::{ClientController, ConnectAttempt, PendingConnect, Session};
pub use overlay::QuicOverlay;

use crate::config::{ApexConfig, Tunnel};
use crate::error::Result;
use crate::rtt::{MeasurementKey, RttRecorder, Statistics};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 远端节点
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Node {
    pub id: String,
    pub address: String,
}

impl Node {
    pub fn measurement_key(&self) -> MeasurementKey {
        MeasurementKey::new(format!("{}@{}", self.id, self.address))
    }
}

/// 节点及其 RTT 统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub rtt: Option<Statistics>,
}

/// overlay 传输：与远端节点之间的连接层
#[async_trait]
pub trait OverlayTransport: Send + Sync {
    /// 本地客户端身份
    fn identity(&self) -> &str;

    /// 当前有连接的节点
    fn connected_nodes(&self) -> Vec<Node>;

    async fn stop(&self);
}

/// 已注册的隧道客户端会话
#[async_trait]
pub trait TunnelClient: Send + Sync {
    async fn register(&self, cancel: &CancellationToken) -> Result<()>;

    async fn initialize(&self, cancel: &CancellationToken) -> Result<()>;

    /// 启动后台处理，立即返回
    async fn start(&self, cancel: &CancellationToken) -> Result<()>;

    async fn close(&self);

    fn current_config(&self) -> ApexConfig;

    async fn rebuild_tunnels(&self, tunnels: Vec<Tunnel>) -> Result<()>;

    /// 按持久化配置同步远端隧道定义
    async fn sync_config_tunnels(&self, cancel: &CancellationToken) -> Result<()>;

    async fn update_apex(&self, apex: String) -> Result<()>;

    async fn unpublish_tunnel(&self, tunnel: &Tunnel) -> Result<()>;

    async fn release_tunnel(&self, tunnel: &Tunnel) -> Result<()>;

    fn connected_nodes(&self) -> Vec<Node>;
}

/// 构建 overlay 所需的参数
pub struct OverlayConfig {
    pub identity: String,
    pub client_tls: Arc<rustls::ClientConfig>,
    pub recorder: Arc<RttRecorder>,
}

/// 构建客户端所需的参数
pub struct TunnelClientConfig {
    pub configuration: ApexConfig,
    pub transport: Arc<dyn OverlayTransport>,
    pub recorder: Arc<RttRecorder>,
    pub disable_target_tls: bool,
    pub cancel: CancellationToken,
}

/// 隧道客户端工厂
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// 默认使用 quinn 实现的 overlay
    fn transport(&self, config: OverlayConfig) -> Result<Arc<dyn OverlayTransport>> {
        Ok(Arc::new(QuicOverlay::new(config)?))
    }

    async fn client(&self, config: TunnelClientConfig) -> Result<Arc<dyn TunnelClient>>;
}
