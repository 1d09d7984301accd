use super::{
    NodeView, OverlayConfig, OverlayTransport, TunnelBackend, TunnelClient, TunnelClientConfig,
};
use crate::config::{ApexConfig, Tunnel};
use crate::dialer::ParsedApex;
use crate::error::{PhantomError, Result};
use crate::events::{Event, EventBus};
use crate::rtt::RttRecorder;
use crate::tls::{client_config, TUNNEL_ALPN};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// RTT 样本环大小
const RTT_SAMPLES: usize = 20;
/// 节点 RTT 统计窗口
const RTT_WINDOW: Duration = Duration::from_secs(10);

/// 一次已建立的客户端会话
pub struct Session {
    client: Arc<dyn TunnelClient>,
    transport: Arc<dyn OverlayTransport>,
    recorder: Arc<RttRecorder>,
    cancel: CancellationToken,
}

impl Session {
    /// 先关客户端，再停传输，最后取消作用域
    async fn teardown(self) {
        self.client.close().await;
        self.transport.stop().await;
        self.cancel.cancel();
    }
}

/// 已通过校验、尚未握手的连接请求
///
/// `establish` 不依赖控制器本身，调用方可以在释放锁之后再执行它。
pub struct PendingConnect {
    id: u64,
    backend: Arc<dyn TunnelBackend>,
    configuration: ApexConfig,
    specter_insecure: bool,
    target_insecure: bool,
    cancel: CancellationToken,
}

/// 一次连接尝试的结果，交回 `ClientController::finish_connect` 登记
pub struct ConnectAttempt {
    id: u64,
    result: Result<Session>,
}

impl PendingConnect {
    /// 创建传输和客户端，再依次注册、初始化、启动
    ///
    /// 任何一步失败都会拆掉已经建好的部分。
    pub async fn establish(self) -> ConnectAttempt {
        let result = self.build().await;
        if result.is_err() {
            self.cancel.cancel();
        }
        ConnectAttempt {
            id: self.id,
            result,
        }
    }

    async fn build(&self) -> Result<Session> {
        let client_tls = client_config(self.specter_insecure, &[TUNNEL_ALPN])?;
        let recorder = Arc::new(RttRecorder::new(RTT_SAMPLES));
        let transport = self.backend.transport(OverlayConfig {
            identity: self.configuration.client_id.clone(),
            client_tls,
            recorder: recorder.clone(),
        })?;

        let client = self
            .backend
            .client(TunnelClientConfig {
                configuration: self.configuration.clone(),
                transport: transport.clone(),
                recorder: recorder.clone(),
                disable_target_tls: self.target_insecure,
                cancel: self.cancel.clone(),
            })
            .await;
        let client = match client {
            Ok(client) => client,
            Err(e) => {
                transport.stop().await;
                return Err(e);
            }
        };

        let session = Session {
            client,
            transport,
            recorder,
            cancel: self.cancel.clone(),
        };
        if let Err(e) = establish(&session).await {
            session.teardown().await;
            return Err(e);
        }
        Ok(session)
    }
}

/// 隧道客户端控制器
///
/// 断开时本地 `ApexConfig` 是隧道定义的权威来源；连接后由远端客户端负责。
pub struct ClientController {
    apex: ApexConfig,
    backend: Option<Arc<dyn TunnelBackend>>,
    session: Option<Session>,
    /// 正在进行的连接尝试及其作用域
    connecting: Option<(u64, CancellationToken)>,
    attempts: u64,
    events: EventBus,
    cancel: CancellationToken,
}

impl ClientController {
    pub fn new(
        apex: ApexConfig,
        backend: Option<Arc<dyn TunnelBackend>>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            apex,
            backend,
            session: None,
            connecting: None,
            attempts: 0,
            events,
            cancel,
        }
    }

    pub fn connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn connecting(&self) -> bool {
        self.connecting.is_some()
    }

    /// 建立会话；已连接时直接返回
    pub async fn connect(&mut self, specter_insecure: bool, target_insecure: bool) -> Result<()> {
        let Some(pending) = self.begin_connect(specter_insecure, target_insecure)? else {
            return Ok(());
        };
        let attempt = pending.establish().await;
        self.finish_connect(attempt).await
    }

    /// 校验配置并登记一次连接尝试
    ///
    /// 已连接或已有尝试在进行时返回 `None`。发出 "connecting" 后的任何失败都会
    /// 补发 "disconnected"。
    pub fn begin_connect(
        &mut self,
        specter_insecure: bool,
        target_insecure: bool,
    ) -> Result<Option<PendingConnect>> {
        if self.session.is_some() || self.connecting.is_some() {
            return Ok(None);
        }

        self.events.emit(Event::ClientConnecting);
        let backend = match self.check_connectable() {
            Ok(backend) => backend,
            Err(e) => return Err(self.connect_failed(e)),
        };

        self.attempts += 1;
        let cancel = self.cancel.child_token();
        self.connecting = Some((self.attempts, cancel.clone()));

        Ok(Some(PendingConnect {
            id: self.attempts,
            backend,
            configuration: self.apex.clone(),
            specter_insecure,
            target_insecure,
            cancel,
        }))
    }

    fn check_connectable(&self) -> Result<Arc<dyn TunnelBackend>> {
        if self.apex.apex.is_empty() {
            return Err(PhantomError::config("apex cannot be empty"));
        }
        let parsed = ParsedApex::parse(&self.apex.apex)?;

        let backend = self
            .backend
            .clone()
            .ok_or_else(|| PhantomError::config("no tunnel client backend available"))?;

        info!(apex = %parsed, "Connecting specter client");
        Ok(backend)
    }

    /// 登记连接结果
    ///
    /// 尝试期间调用过 `disconnect` 的，建好的会话会被拆掉。
    pub async fn finish_connect(&mut self, attempt: ConnectAttempt) -> Result<()> {
        let current = matches!(&self.connecting, Some((id, _)) if *id == attempt.id);
        if !current {
            if let Ok(session) = attempt.result {
                session.teardown().await;
            }
            return Err(PhantomError::dial(&self.apex.apex, "connection aborted"));
        }

        self.connecting = None;
        match attempt.result {
            Ok(session) => {
                self.session = Some(session);
                info!("Specter client connected");
                self.events.emit(Event::ClientConnected);
                Ok(())
            }
            Err(e) => Err(self.connect_failed(e)),
        }
    }

    fn connect_failed(&self, e: PhantomError) -> PhantomError {
        error!("Fail to start specter client: {}", e);
        self.events.emit(Event::ClientDisconnected);
        e
    }

    /// 断开会话；连接尝试进行中时放弃该尝试
    pub async fn disconnect(&mut self) {
        if let Some((_, cancel)) = self.connecting.take() {
            info!("Abandoning pending specter connection");
            cancel.cancel();
            self.events.emit(Event::ClientDisconnected);
        }

        let Some(session) = self.session.take() else {
            return;
        };

        info!("Shutting down specter client");
        session.teardown().await;
        self.events.emit(Event::ClientDisconnected);
    }

    /// 断开时返回本地配置，连接时返回客户端当前视图
    pub fn current_config(&self) -> ApexConfig {
        match &self.session {
            Some(session) => session.client.current_config(),
            None => self.apex.clone(),
        }
    }

    pub async fn rebuild_tunnels(&mut self, tunnels: Vec<Tunnel>) -> Result<()> {
        match &self.session {
            Some(session) => session.client.rebuild_tunnels(tunnels).await,
            None => {
                self.apex.tunnels = tunnels;
                self.apex.persist()
            }
        }
    }

    pub async fn update_apex(&mut self, apex: String) -> Result<()> {
        match &self.session {
            Some(session) => session.client.update_apex(apex).await,
            None => {
                self.apex.apex = apex;
                self.apex.persist()
            }
        }
    }

    pub async fn synchronize(&self) -> Result<()> {
        match &self.session {
            Some(session) => session.client.sync_config_tunnels(&session.cancel).await,
            None => Ok(()),
        }
    }

    fn tunnel_at(&self, index: usize) -> Result<Tunnel> {
        let tunnels = match &self.session {
            Some(session) => session.client.current_config().tunnels,
            None => self.apex.tunnels.clone(),
        };
        let len = tunnels.len();
        tunnels
            .into_iter()
            .nth(index)
            .ok_or_else(|| PhantomError::index(index, len))
    }

    /// 撤销发布：连接时交给客户端，断开时清除本地记录的主机名
    pub async fn unpublish(&mut self, index: usize) -> Result<()> {
        let tunnel = self.tunnel_at(index)?;
        match &self.session {
            Some(session) => session.client.unpublish_tunnel(&tunnel).await,
            None => {
                self.apex.tunnels[index].hostname = None;
                self.apex.persist()
            }
        }
    }

    /// 释放隧道：连接时交给客户端，断开时删除本地定义
    pub async fn release(&mut self, index: usize) -> Result<()> {
        let tunnel = self.tunnel_at(index)?;
        match &self.session {
            Some(session) => session.client.release_tunnel(&tunnel).await,
            None => {
                self.apex.tunnels.remove(index);
                self.apex.persist()
            }
        }
    }

    pub fn connected_nodes(&self) -> Vec<NodeView> {
        let Some(session) = &self.session else {
            return Vec::new();
        };

        session
            .client
            .connected_nodes()
            .into_iter()
            .map(|node| {
                let rtt = session.recorder.snapshot(&node.measurement_key(), RTT_WINDOW);
                NodeView { node, rtt }
            })
            .collect()
    }
}

async fn establish(session: &Session) -> Result<()> {
    session.client.register(&session.cancel).await?;
    session.client.initialize(&session.cancel).await?;
    session.client.start(&session.cancel).await
}
