/// Forwarder 编排
///
/// 持有持久化的监听列表和运行中的 forwarder 注册表（以监听地址为键）。
/// 所有方法都要求调用方已经持有外观层的写锁（查询方法持有读锁即可）。
use crate::batch;
use crate::config::{ListenerSpec, PhantomConfig, PhantomStore};
use crate::dialer::{Dialers, TransportKind};
use crate::error::{PhantomError, Result};
use crate::events::{Event, EventBus};
use crate::forwarder::{Forwarder, StatsSnapshot};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 运行中 forwarder 的只读视图
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwarderView {
    pub label: String,
    pub listen: String,
    /// 远端地址
    pub via: String,
    pub stats: StatsSnapshot,
}

/// 启动 forwarder 所需的依赖
///
/// 可以从编排器中取出单独使用，拨号和握手因此不必在外观层的锁内进行。
#[derive(Clone)]
pub struct Launcher {
    dialers: Dialers,
    events: EventBus,
    cancel: CancellationToken,
}

impl Launcher {
    pub async fn start(&self, spec: ListenerSpec) -> Result<Forwarder> {
        let dialer = self.dialers.select(TransportKind::for_listener(&spec));
        Forwarder::start(spec, dialer, &self.cancel, self.events.clone()).await
    }

    /// 并发启动一批监听，结果与输入顺序一致
    pub async fn start_batch(&self, specs: Vec<ListenerSpec>) -> Vec<Result<Forwarder>> {
        let jobs: Vec<_> = specs
            .into_iter()
            .map(|spec| {
                let launcher = self.clone();
                async move { launcher.start(spec).await }
            })
            .collect();
        batch::all(&self.cancel, jobs).await
    }
}

pub struct ForwarderOrchestrator {
    store: PhantomStore,
    registry: HashMap<String, Forwarder>,
    launcher: Launcher,
}

impl ForwarderOrchestrator {
    pub fn new(
        store: PhantomStore,
        dialers: Dialers,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry: HashMap::new(),
            launcher: Launcher {
                dialers,
                events,
                cancel,
            },
        }
    }

    pub fn launcher(&self) -> Launcher {
        self.launcher.clone()
    }

    fn events(&self) -> &EventBus {
        &self.launcher.events
    }

    pub fn config(&self) -> &PhantomConfig {
        self.store.config()
    }

    pub fn listeners(&self) -> &[ListenerSpec] {
        &self.store.config().listeners
    }

    /// 先写盘再替换内存配置
    ///
    /// 监听地址不再出现在新列表中的 forwarder 会被停止。
    pub async fn update_config(&mut self, config: PhantomConfig) -> Result<()> {
        let mut seen = HashSet::new();
        if let Some(dup) = config.listeners.iter().find(|l| !seen.insert(l.listen.as_str())) {
            return Err(PhantomError::duplicate(&dup.listen));
        }

        self.store.replace(config)?;

        let orphans: Vec<String> = self
            .registry
            .keys()
            .filter(|listen| self.store.config().position(listen).is_none())
            .cloned()
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }

        for listen in orphans {
            if let Some(forwarder) = self.registry.remove(&listen) {
                forwarder.stop().await;
            }
        }
        if self.registry.is_empty() {
            self.events().emit(Event::ForwardersStopped);
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        let len = self.listeners().len();
        if index < len {
            Ok(())
        } else {
            Err(PhantomError::index(index, len))
        }
    }

    /// 监听地址已经在配置中或正在运行时返回 `Duplicate`
    pub fn check_new(&self, spec: &ListenerSpec) -> Result<()> {
        if self.registry.contains_key(&spec.listen)
            || self.store.config().position(&spec.listen).is_some()
        {
            return Err(PhantomError::duplicate(&spec.listen));
        }
        Ok(())
    }

    /// 登记已启动的新监听并写盘
    pub fn commit_add(&mut self, forwarder: Forwarder) -> Result<()> {
        let spec = forwarder.spec().clone();
        self.registry.insert(spec.listen.clone(), forwarder);

        info!(listen = %spec.listen, via = %spec.hostname, "Forwarder added");
        self.store.config_mut().listeners.push(spec);
        self.store.persist()
    }

    /// 启动并添加新的监听；启动失败时不写入配置
    pub async fn add_forwarder(&mut self, spec: ListenerSpec) -> Result<()> {
        self.check_new(&spec)?;
        let forwarder = self.launcher.start(spec).await?;
        self.commit_add(forwarder)
    }

    /// 删除指定下标的监听，运行中的先停止
    pub async fn remove_forwarder(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;

        let listen = self.listeners()[index].listen.clone();
        if let Some(forwarder) = self.registry.remove(&listen) {
            forwarder.stop().await;
        }

        self.store.config_mut().listeners.remove(index);
        info!(listen = %listen, "Forwarder removed");
        let persisted = self.store.persist();

        if self.listeners().is_empty() {
            self.events().emit(Event::ForwardersStopped);
        }
        persisted
    }

    /// 取出待启动的监听；已经在运行时返回 `Duplicate`
    pub fn pending_at(&self, index: usize) -> Result<ListenerSpec> {
        self.check_index(index)?;

        let spec = self.listeners()[index].clone();
        if self.registry.contains_key(&spec.listen) {
            return Err(PhantomError::duplicate(&spec.listen));
        }
        Ok(spec)
    }

    pub fn commit_start(&mut self, forwarder: Forwarder) {
        self.registry
            .insert(forwarder.spec().listen.clone(), forwarder);

        if self.all_running() {
            self.events().emit(Event::ForwardersStarted);
        }
    }

    pub async fn start_forwarder(&mut self, index: usize) -> Result<()> {
        let spec = self.pending_at(index)?;
        let forwarder = self.launcher.start(spec).await?;
        self.commit_start(forwarder);
        Ok(())
    }

    /// 停止指定下标的 forwarder；未运行时什么也不做
    pub async fn stop_forwarder(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;

        let listen = self.listeners()[index].listen.clone();
        if let Some(forwarder) = self.registry.remove(&listen) {
            forwarder.stop().await;
            if self.registry.is_empty() {
                self.events().emit(Event::ForwardersStopped);
            }
        }
        Ok(())
    }

    /// 列出所有未运行的监听；非空时发出 "starting" 事件
    pub fn begin_start_all(&self) -> Vec<ListenerSpec> {
        let mut seen = HashSet::new();
        let pending: Vec<ListenerSpec> = self
            .listeners()
            .iter()
            .filter(|spec| !self.registry.contains_key(&spec.listen))
            .filter(|spec| seen.insert(spec.listen.clone()))
            .cloned()
            .collect();

        if !pending.is_empty() {
            self.events().emit(Event::ForwardersStarting);
            info!("Starting {} forwarder(s)", pending.len());
        }
        pending
    }

    /// 登记一批启动结果
    ///
    /// 成功的保持运行；有失败时返回下标最小的那个错误。
    pub fn finish_start_all(&mut self, results: Vec<Result<Forwarder>>) -> Result<()> {
        let mut first_error = None;
        for result in results {
            match result {
                Ok(forwarder) => {
                    self.registry
                        .insert(forwarder.spec().listen.clone(), forwarder);
                }
                Err(e) => {
                    warn!("Failed to start forwarder: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                self.events().emit(Event::ForwardersStopped);
                Err(e)
            }
            None => {
                self.events().emit(Event::ForwardersStarted);
                Ok(())
            }
        }
    }

    /// 并发启动所有未运行的监听
    pub async fn start_all(&mut self) -> Result<()> {
        let pending = self.begin_start_all();
        if pending.is_empty() {
            return Ok(());
        }
        let results = self.launcher.start_batch(pending).await;
        self.finish_start_all(results)
    }

    pub async fn stop_all(&mut self) {
        for (_, forwarder) in self.registry.drain() {
            forwarder.stop().await;
        }
        self.events().emit(Event::ForwardersStopped);
    }

    pub fn relabel(&mut self, index: usize, label: impl Into<String>) -> Result<()> {
        self.check_index(index)?;

        let label = label.into();
        let spec = &mut self.store.config_mut().listeners[index];
        spec.label = label.clone();
        let listen = spec.listen.clone();

        if let Some(forwarder) = self.registry.get_mut(&listen) {
            forwarder.set_label(label);
        }
        self.store.persist()
    }

    pub fn is_running(&self, listen: &str) -> bool {
        self.registry.contains_key(listen)
    }

    pub fn all_running(&self) -> bool {
        self.registry.len() == self.listeners().len()
    }

    pub fn running_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connected_nodes_view(&self) -> Vec<ForwarderView> {
        self.registry
            .values()
            .map(|forwarder| ForwarderView {
                label: forwarder.spec().label.clone(),
                listen: forwarder.spec().listen.clone(),
                via: forwarder.remote().to_string(),
                stats: forwarder.stats(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::{DialHandle, Dialer, DialerConfig};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        fn kind(&self) -> TransportKind {
            TransportKind::Tls
        }

        async fn open(&self, _cancel: CancellationToken, config: DialerConfig) -> Result<DialHandle> {
            Err(PhantomError::dial(config.parsed.to_string(), "refused"))
        }
    }

    fn orchestrator(dir: &std::path::Path, listeners: Vec<ListenerSpec>) -> ForwarderOrchestrator {
        let config = PhantomConfig {
            listeners,
            ..Default::default()
        };
        ForwarderOrchestrator::new(
            PhantomStore::new(dir.join("phantom.json"), config),
            Dialers::uniform(Arc::new(RefusingDialer)),
            EventBus::new(),
            CancellationToken::new(),
        )
    }

    fn spec(listen: &str) -> ListenerSpec {
        ListenerSpec {
            listen: listen.to_string(),
            hostname: "example.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_index_equal_to_length_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), vec![spec("127.0.0.1:0")]);

        assert!(orch.remove_forwarder(1).await.unwrap_err().is_index_error());
        assert!(orch.start_forwarder(1).await.unwrap_err().is_index_error());
        assert!(orch.stop_forwarder(1).await.unwrap_err().is_index_error());
        assert!(orch.relabel(1, "x").unwrap_err().is_index_error());
    }

    #[tokio::test]
    async fn test_stop_not_running_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), vec![spec("127.0.0.1:0")]);
        let mut events = orch.events().subscribe();

        orch.stop_forwarder(0).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_add_leaves_list_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), Vec::new());

        let err = orch.add_forwarder(spec("127.0.0.1:0")).await.unwrap_err();
        assert!(err.is_dial_error());
        assert!(orch.listeners().is_empty());
        assert!(!dir.path().join("phantom.json").exists());
    }

    #[tokio::test]
    async fn test_add_configured_listen_address_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), vec![spec("127.0.0.1:0")]);

        let err = orch.add_forwarder(spec("127.0.0.1:0")).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(orch.listeners().len(), 1);
    }

    #[tokio::test]
    async fn test_update_config_with_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), vec![spec("127.0.0.1:0")]);
        let mut events = orch.events().subscribe();

        orch.update_config(PhantomConfig::default()).await.unwrap();
        assert!(orch.listeners().is_empty());
        assert!(events.try_recv().is_err());

        let repeated = PhantomConfig {
            listeners: vec![spec("127.0.0.1:1"), spec("127.0.0.1:1")],
            ..Default::default()
        };
        assert!(orch.update_config(repeated).await.unwrap_err().is_duplicate());
        assert!(orch.listeners().is_empty());
    }

    #[tokio::test]
    async fn test_start_all_with_nothing_pending_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), Vec::new());
        let mut events = orch.events().subscribe();

        orch.start_all().await.unwrap();
        assert!(events.try_recv().is_err());
        assert!(orch.all_running());
    }

    #[tokio::test]
    async fn test_relabel_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), vec![spec("127.0.0.1:0")]);

        orch.relabel(0, "database").unwrap();
        let reloaded = PhantomConfig::load_or_init(&dir.path().join("phantom.json")).unwrap();
        assert_eq!(reloaded.listeners[0].label, "database");
    }
}
