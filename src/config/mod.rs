// 配置管理模块

mod apex;
mod store;

pub use apex::{ApexConfig, Tunnel};
pub use store::write_atomic;

use crate::error::{PhantomError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "PHANTOM_";

/// 转发连接空闲超时（秒）- 可通过环境变量 PHANTOM_IDLE_TIMEOUT_SECS 覆盖
pub const IDLE_TIMEOUT_SECS: u64 = 300;
/// 拨号握手超时（秒）- 可通过环境变量 PHANTOM_DIAL_TIMEOUT_SECS 覆盖
pub const DIAL_TIMEOUT_SECS: u64 = 10;

pub fn get_idle_timeout() -> u64 {
    std::env::var(format!("{}IDLE_TIMEOUT_SECS", ENV_PREFIX))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(IDLE_TIMEOUT_SECS)
}

pub fn get_dial_timeout() -> u64 {
    std::env::var(format!("{}DIAL_TIMEOUT_SECS", ENV_PREFIX))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DIAL_TIMEOUT_SECS)
}

/// 本地监听配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSpec {
    /// 显示名称
    #[serde(default)]
    pub label: String,
    /// 本地监听地址 (host:port)，同时作为唯一键
    #[serde(default)]
    pub listen: String,
    /// 远端 apex (host[:port])
    #[serde(default)]
    pub hostname: String,
    /// 是否跳过证书验证
    #[serde(default)]
    pub insecure: bool,
    /// 使用 TLS over TCP 而不是 QUIC
    #[serde(default, rename = "tcp")]
    pub use_tcp: bool,
}

/// 本地 forwarder 配置文件（phantom.json）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhantomConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,
    #[serde(default)]
    pub listen_on_start: bool,
    #[serde(default)]
    pub connect_on_start: bool,
    /// 连接 apex 时跳过证书验证
    #[serde(default, rename = "specterInsecure")]
    pub specter_insecure_skip_verify: bool,
    /// 隧道目标不使用 TLS 校验
    #[serde(default, rename = "targetInsecure")]
    pub target_insecure_skip_verify: bool,
}

impl PhantomConfig {
    /// 读取配置；文件不存在时写入 `{}` 并返回默认值
    pub fn load_or_init(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if !path.exists() {
            std::fs::write(path, "{}")
                .with_context(|| format!("creating phantom config file {:?}", path))?;
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phantom config {:?}", path))?;
        let config: PhantomConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse phantom config {:?}", path))?;
        Ok(config)
    }

    /// 完整重写配置文件
    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| PhantomError::persist(path, std::io::Error::other(e)))?;
        write_atomic(path, &json)
    }

    /// 按监听地址查找
    pub fn position(&self, listen: &str) -> Option<usize> {
        self.listeners.iter().position(|l| l.listen == listen)
    }
}

/// 持有配置及其文件路径
#[derive(Debug, Clone)]
pub struct PhantomStore {
    path: PathBuf,
    config: PhantomConfig,
}

impl PhantomStore {
    pub fn new(path: impl Into<PathBuf>, config: PhantomConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let config = PhantomConfig::load_or_init(&path)?;
        Ok(Self { path, config })
    }

    pub fn config(&self) -> &PhantomConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut PhantomConfig {
        &mut self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persist(&self) -> Result<()> {
        self.config.persist(&self.path)
    }

    /// 先写盘，成功后再替换内存中的配置
    pub fn replace(&mut self, config: PhantomConfig) -> Result<()> {
        config.persist(&self.path)?;
        self.config = config;
        Ok(())
    }
}
