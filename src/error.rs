/// 自定义错误类型
///
/// 每一种失败都对应一个变体，调用方（Application 外观层）可以按类型区分处理，
/// 例如把 `Index` 显示为界面错误、把 `Persist` 显示为警告。
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Phantom 的主要错误类型
#[derive(Error, Debug)]
pub enum PhantomError {
    /// 配置错误（缺少必填字段，例如 apex 为空）
    #[error("Configuration error: {0}")]
    Config(String),

    /// 本地监听地址不可用
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// apex 字符串格式错误
    #[error("Failed to resolve apex: {0}")]
    Resolve(String),

    /// 远端握手或连接失败
    #[error("Failed to dial {target}: {reason}")]
    Dial { target: String, reason: String },

    /// 监听地址已经有正在运行的 forwarder
    #[error("Listener with address {0} already exists")]
    Duplicate(String),

    /// 下标越界
    #[error("Index {index} out of bound (length {len})")]
    Index { index: usize, len: usize },

    /// 配置文件写入失败
    #[error("Failed to persist {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 远端拒绝了隧道操作
    #[error("Remote rejected the request: {0}")]
    RemoteRejection(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, PhantomError>;

impl PhantomError {
    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建监听失败错误
    pub fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }

    /// 创建 apex 解析错误
    pub fn resolve(msg: impl Into<String>) -> Self {
        Self::Resolve(msg.into())
    }

    /// 创建拨号失败错误
    pub fn dial(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Dial {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// 创建重复监听错误
    pub fn duplicate(listen: impl Into<String>) -> Self {
        Self::Duplicate(listen.into())
    }

    /// 创建下标越界错误
    pub fn index(index: usize, len: usize) -> Self {
        Self::Index { index, len }
    }

    /// 创建持久化失败错误
    pub fn persist(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Persist {
            path: path.into(),
            source,
        }
    }

    /// 创建远端拒绝错误
    pub fn remote_rejection(msg: impl Into<String>) -> Self {
        Self::RemoteRejection(msg.into())
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_bind_error(&self) -> bool {
        matches!(self, Self::Bind { .. })
    }

    pub fn is_resolve_error(&self) -> bool {
        matches!(self, Self::Resolve(_))
    }

    pub fn is_dial_error(&self) -> bool {
        matches!(self, Self::Dial { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    pub fn is_index_error(&self) -> bool {
        matches!(self, Self::Index { .. })
    }

    pub fn is_persist_error(&self) -> bool {
        matches!(self, Self::Persist { .. })
    }

    pub fn is_remote_rejection(&self) -> bool {
        matches!(self, Self::RemoteRejection(_))
    }
}
