use super::write_atomic;
use crate::error::{PhantomError, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 远端发布的隧道定义
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    /// 本地服务地址，例如 `tcp://127.0.0.1:22`
    pub target: String,
    /// 远端分配的主机名（未发布时为空）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// apex 端点配置（specter.toml）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApexConfig {
    /// 远端 apex (host[:port])
    #[serde(default)]
    pub apex: String,
    /// 稳定的客户端身份
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
    #[serde(skip)]
    path: PathBuf,
}

impl ApexConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// 读取配置；文件不存在时创建，缺少 client_id 时生成并写回
    pub fn load_or_init(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            std::fs::write(path, "apex = \"\"\n")
                .with_context(|| format!("creating specter config file {:?}", path))?;
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read specter config {:?}", path))?;
        let mut config: ApexConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse specter config {:?}", path))?;
        config.path = path.to_path_buf();

        if config.client_id.is_empty() {
            config.client_id = uuid::Uuid::new_v4().to_string();
            config.persist()?;
        }

        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persist(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PhantomError::persist(&self.path, std::io::Error::other(e)))?;
        write_atomic(&self.path, content.as_bytes())
    }
}
