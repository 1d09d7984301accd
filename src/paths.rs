/// 文件路径管理
///
/// 启动时根据构建模式计算一次，之后以引用方式传给各个组件。
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// 目录名（生产环境）
const APP_DIR: &str = "phantom";
/// 目录名（开发环境）
const APP_DIR_DEV: &str = "phantom-dev";

const PHANTOM_CONFIG_FILE: &str = "phantom.json";
const SPECTER_CONFIG_FILE: &str = "specter.toml";
const LOG_DIR: &str = "logs";

/// 构建模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    #[default]
    Production,
    Dev,
}

impl BuildMode {
    /// 当前二进制的构建模式（debug 构建视为开发模式）
    pub fn current() -> Self {
        if cfg!(debug_assertions) {
            BuildMode::Dev
        } else {
            BuildMode::Production
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, BuildMode::Production)
    }
}

/// 进程使用的全部文件路径
#[derive(Debug, Clone, Serialize)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub phantom_config: PathBuf,
    pub specter_config: PathBuf,
    pub log_file: PathBuf,
}

impl Paths {
    /// 使用系统本地配置目录
    pub fn for_mode(mode: BuildMode) -> Result<Self> {
        let base = dirs::config_dir().context("No local configuration directory available")?;
        let dir = match mode {
            BuildMode::Production => APP_DIR,
            BuildMode::Dev => APP_DIR_DEV,
        };
        Ok(Self::with_root(base.join(dir)))
    }

    /// 使用指定的根目录（`~` 会被展开）
    pub fn from_arg(root: &str) -> Result<Self> {
        let expanded = shellexpand::full(root)
            .with_context(|| format!("Failed to expand configuration path {}", root))?;
        Ok(Self::with_root(PathBuf::from(expanded.as_ref())))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self::with_root_at(root, Local::now())
    }

    fn with_root_at(root: impl Into<PathBuf>, started: DateTime<Local>) -> Self {
        let config_dir = root.into();
        let log_dir = config_dir.join(LOG_DIR);
        let log_file = log_dir.join(log_file_name(started));
        Self {
            phantom_config: config_dir.join(PHANTOM_CONFIG_FILE),
            specter_config: config_dir.join(SPECTER_CONFIG_FILE),
            config_dir,
            log_dir,
            log_file,
        }
    }

    /// 创建配置目录
    pub fn ensure_config_dir(&self) -> Result<()> {
        make_path(&self.config_dir).context("creating config directory")
    }

    /// 创建日志目录，必须在写第一行日志之前完成
    pub fn ensure_log_dir(&self) -> Result<()> {
        make_path(&self.log_dir).context("creating logs directory")
    }
}

fn make_path(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// 日志文件名由进程启动时间确定，空格和冒号会被替换
fn log_file_name(started: DateTime<Local>) -> String {
    normalize_filename(&format!(
        "specter-{}.log",
        started.format("%Y-%m-%d %H:%M:%S")
    ))
}

fn normalize_filename(name: &str) -> String {
    name.replace(' ', "_").replace(':', "-")
}
