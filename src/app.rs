/// 应用外观层
///
/// 所有对配置、forwarder 注册表和隧道客户端的访问都经过同一把读写锁，
/// 锁内只做状态登记和写盘；拨号、握手在锁外完成。forwarder 的修改操作
/// 另外由 `forwarder_ops` 串行化，批量启动不会与增删交错。
use crate::config::{ApexConfig, ListenerSpec, PhantomConfig, PhantomStore, Tunnel};
use crate::dialer::Dialers;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::helper::{self, FilePaths};
use crate::orchestrator::{ForwarderOrchestrator, ForwarderView};
use crate::paths::Paths;
use crate::tunnel::{ClientController, NodeView, TunnelBackend};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct AppState {
    forwarders: ForwarderOrchestrator,
    client: ClientController,
}

/// 构建 `Application` 时可替换的组件
#[derive(Default)]
pub struct AppOptions {
    pub dialers: Dialers,
    pub backend: Option<Arc<dyn TunnelBackend>>,
}

pub struct Application {
    paths: Paths,
    events: EventBus,
    state: RwLock<AppState>,
    forwarder_ops: Mutex<()>,
    cancel: CancellationToken,
}

impl Application {
    /// 启动：创建目录并加载两个配置文件；任何失败都应当终止进程
    pub fn startup(paths: Paths, options: AppOptions) -> anyhow::Result<Arc<Self>> {
        paths.ensure_config_dir()?;
        paths.ensure_log_dir()?;

        let apex = ApexConfig::load_or_init(&paths.specter_config)
            .context("loading specter config")?;
        let store = PhantomStore::open(&paths.phantom_config).context("loading phantom config")?;

        let events = EventBus::new();
        let cancel = CancellationToken::new();

        let forwarders =
            ForwarderOrchestrator::new(store, options.dialers, events.clone(), cancel.clone());
        let client = ClientController::new(apex, options.backend, events.clone(), cancel.clone());

        info!(config_dir = %paths.config_dir.display(), "Application started");

        Ok(Arc::new(Self {
            paths,
            events,
            state: RwLock::new(AppState { forwarders, client }),
            forwarder_ops: Mutex::new(()),
            cancel,
        }))
    }

    /// 界面就绪后调用：按配置自动连接和启动 forwarder
    ///
    /// 后台任务的失败只记录日志；返回的句柄仅用于等待任务结束。
    pub async fn on_ready(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let config = self.state.read().await.forwarders.config().clone();
        let mut tasks = Vec::new();

        if config.connect_on_start {
            let app = self.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = app.start_client().await {
                    error!("Fail to start specter client: {}", e);
                }
            }));
        }

        if config.listen_on_start {
            let app = self.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = app.start_all_forwarders().await {
                    error!("Fail to start forwarders: {}", e);
                }
            }));
        }

        tasks
    }

    pub async fn on_shutdown(&self) {
        self.stop_client().await;
        self.stop_all_forwarders().await;
        self.cancel.cancel();
        info!("Application shut down");
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn file_paths(&self) -> FilePaths {
        helper::file_paths(&self.paths)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // 本地配置

    pub async fn phantom_config(&self) -> PhantomConfig {
        self.state.read().await.forwarders.config().clone()
    }

    /// 替换整个配置；不在新列表中的 forwarder 会被停止
    pub async fn update_phantom_config(&self, config: PhantomConfig) -> Result<()> {
        let _ops = self.forwarder_ops.lock().await;
        self.state.write().await.forwarders.update_config(config).await
    }

    // 隧道客户端

    pub async fn connected(&self) -> bool {
        self.state.read().await.client.connected()
    }

    pub async fn current_apex_config(&self) -> ApexConfig {
        self.state.read().await.client.current_config()
    }

    /// 连接隧道客户端；已连接或正在连接时直接返回
    pub async fn start_client(&self) -> Result<()> {
        let pending = {
            let mut state = self.state.write().await;
            let config = state.forwarders.config();
            let (specter_insecure, target_insecure) = (
                config.specter_insecure_skip_verify,
                config.target_insecure_skip_verify,
            );
            match state.client.begin_connect(specter_insecure, target_insecure)? {
                Some(pending) => pending,
                None => return Ok(()),
            }
        };

        let attempt = pending.establish().await;
        self.state.write().await.client.finish_connect(attempt).await
    }

    pub async fn stop_client(&self) {
        self.state.write().await.client.disconnect().await
    }

    pub async fn rebuild_tunnels(&self, tunnels: Vec<Tunnel>) -> Result<()> {
        self.state.write().await.client.rebuild_tunnels(tunnels).await
    }

    pub async fn synchronize(&self) -> Result<()> {
        self.state.write().await.client.synchronize().await
    }

    pub async fn update_apex(&self, apex: String) -> Result<()> {
        self.state.write().await.client.update_apex(apex).await
    }

    pub async fn unpublish_tunnel(&self, index: usize) -> Result<()> {
        self.state.write().await.client.unpublish(index).await
    }

    pub async fn release_tunnel(&self, index: usize) -> Result<()> {
        self.state.write().await.client.release(index).await
    }

    pub async fn connected_nodes(&self) -> Vec<NodeView> {
        self.state.read().await.client.connected_nodes()
    }

    // forwarder

    pub async fn start_all_forwarders(&self) -> Result<()> {
        let _ops = self.forwarder_ops.lock().await;
        let (launcher, pending) = {
            let state = self.state.read().await;
            (state.forwarders.launcher(), state.forwarders.begin_start_all())
        };
        if pending.is_empty() {
            return Ok(());
        }

        let results = launcher.start_batch(pending).await;
        self.state.write().await.forwarders.finish_start_all(results)
    }

    pub async fn stop_all_forwarders(&self) {
        let _ops = self.forwarder_ops.lock().await;
        self.state.write().await.forwarders.stop_all().await
    }

    pub async fn all_forwarders_started(&self) -> bool {
        self.state.read().await.forwarders.all_running()
    }

    pub async fn forwarder_started(&self, listen: &str) -> bool {
        self.state.read().await.forwarders.is_running(listen)
    }

    pub async fn add_forwarder(&self, spec: ListenerSpec) -> Result<()> {
        let _ops = self.forwarder_ops.lock().await;
        let launcher = {
            let state = self.state.read().await;
            state.forwarders.check_new(&spec)?;
            state.forwarders.launcher()
        };

        let forwarder = launcher.start(spec).await?;
        self.state.write().await.forwarders.commit_add(forwarder)
    }

    pub async fn relabel_forwarder(&self, index: usize, label: String) -> Result<()> {
        let _ops = self.forwarder_ops.lock().await;
        self.state.write().await.forwarders.relabel(index, label)
    }

    pub async fn remove_forwarder(&self, index: usize) -> Result<()> {
        let _ops = self.forwarder_ops.lock().await;
        self.state.write().await.forwarders.remove_forwarder(index).await
    }

    pub async fn start_forwarder(&self, index: usize) -> Result<()> {
        let _ops = self.forwarder_ops.lock().await;
        let (launcher, spec) = {
            let state = self.state.read().await;
            (state.forwarders.launcher(), state.forwarders.pending_at(index)?)
        };

        let forwarder = launcher.start(spec).await?;
        self.state.write().await.forwarders.commit_start(forwarder);
        Ok(())
    }

    pub async fn stop_forwarder(&self, index: usize) -> Result<()> {
        let _ops = self.forwarder_ops.lock().await;
        self.state.write().await.forwarders.stop_forwarder(index).await
    }

    pub async fn connected_forwarder_nodes(&self) -> Vec<ForwarderView> {
        self.state.read().await.forwarders.connected_nodes_view()
    }
}
