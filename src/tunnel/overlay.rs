use super::{Node, OverlayConfig, OverlayTransport};
use crate::dialer::{client_endpoint_for, quinn_config_from_tls};
use crate::error::{PhantomError, Result};
use crate::rtt::RttRecorder;
use async_trait::async_trait;
use parking_lot::Mutex;
use quinn::{Connection, Endpoint};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// RTT 采样间隔
const RTT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// 基于 quinn 的 overlay 传输
///
/// 每个远端节点最多一条连接，连接建立后在后台周期性采样 RTT。
pub struct QuicOverlay {
    identity: String,
    endpoint: Endpoint,
    recorder: Arc<RttRecorder>,
    connections: Mutex<HashMap<Node, Connection>>,
    cancel: CancellationToken,
}

impl QuicOverlay {
    pub fn new(config: OverlayConfig) -> Result<Self> {
        let client_config = quinn_config_from_tls(config.client_tls)?;
        let endpoint = client_endpoint_for(false, client_config)?;

        Ok(Self {
            identity: config.identity,
            endpoint,
            recorder: config.recorder,
            connections: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// 取得到节点的连接，没有可用连接时新建
    pub async fn connect(
        &self,
        node: &Node,
        remote: SocketAddr,
        server_name: &str,
    ) -> Result<Connection> {
        let cached = self
            .connections
            .lock()
            .get(node)
            .filter(|conn| conn.close_reason().is_none())
            .cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let connecting = self
            .endpoint
            .connect(remote, server_name)
            .map_err(|e| PhantomError::dial(&node.address, e))?;
        let conn = tokio::select! {
            _ = self.cancel.cancelled() => return Err(PhantomError::dial(&node.address, "transport stopped")),
            result = connecting => result.map_err(|e| PhantomError::dial(&node.address, e))?,
        };

        info!(node = %node.id, address = %node.address, "Overlay connected");
        self.spawn_rtt_sampler(node.clone(), conn.clone());
        self.connections.lock().insert(node.clone(), conn.clone());
        Ok(conn)
    }

    fn spawn_rtt_sampler(&self, node: Node, conn: Connection) {
        let recorder = self.recorder.clone();
        let cancel = self.cancel.clone();
        let key = node.measurement_key();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RTT_SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = conn.closed() => break,
                    _ = ticker.tick() => recorder.record(&key, conn.rtt()),
                }
            }
            debug!(node = %node.id, "RTT sampler stopped");
        });
    }
}

#[async_trait]
impl OverlayTransport for QuicOverlay {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn connected_nodes(&self) -> Vec<Node> {
        self.connections
            .lock()
            .iter()
            .filter(|(_, conn)| conn.close_reason().is_none())
            .map(|(node, _)| node.clone())
            .collect()
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let connections: Vec<_> = self.connections.lock().drain().collect();
        for (node, conn) in connections {
            conn.close(0u32.into(), b"transport stopped");
            self.recorder.forget(&node.measurement_key());
        }
        self.endpoint.close(0u32.into(), b"transport stopped");
        self.endpoint.wait_idle().await;
        info!(identity = %self.identity, "Overlay transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_overlay_has_no_nodes() {
        let overlay = QuicOverlay::new(OverlayConfig {
            identity: "client-1".to_string(),
            client_tls: crate::tls::client_config(true, &[crate::tls::TUNNEL_ALPN]).unwrap(),
            recorder: Arc::new(RttRecorder::new(20)),
        })
        .unwrap();

        assert_eq!(overlay.identity(), "client-1");
        assert!(overlay.connected_nodes().is_empty());
        overlay.stop().await;
    }
}
