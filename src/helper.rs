/// 界面辅助函数：隧道目标校验与解析、文件路径
use crate::paths::Paths;
use serde::Serialize;
use url::Url;

const NAMED_PIPE_PREFIX: &str = r"\\.\pipe";

/// 解析后的隧道目标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Target {
    pub protocol: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Target {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

fn is_named_pipe(target: &str) -> bool {
    target.to_lowercase().starts_with(NAMED_PIPE_PREFIX)
}

/// 校验隧道目标
///
/// 支持 `http`、`https`、`tcp`、`unix`（非 Windows）以及 Windows 命名管道。
pub fn validate_target(target: &str) -> Result<(), String> {
    if is_named_pipe(target) {
        if !cfg!(windows) {
            return Err("named pipe is only supported on Windows".to_string());
        }
        return Ok(());
    }

    let url = Url::parse(&target.to_lowercase())
        .map_err(|e| format!("unable to parse target: {}", e))?;

    match url.scheme() {
        "http" | "https" | "tcp" => {
            if url.host_str().map_or(true, str::is_empty) {
                return Err("missing host in target".to_string());
            }
            Ok(())
        }
        "unix" => {
            if cfg!(windows) {
                return Err("unix pipe is not supported on Windows".to_string());
            }
            if url.host_str().is_some_and(|h| !h.is_empty()) || url.path().is_empty() {
                return Err("not a valid unix pipe target".to_string());
            }
            Ok(())
        }
        other => Err(format!(
            "unsupported scheme. valid schemes: http, https, tcp, unix; got {}",
            other
        )),
    }
}

/// 拆分出协议和目的地址，失败时把原因放在 `error`
pub fn parse_target(target: &str) -> Target {
    if is_named_pipe(target) {
        return Target {
            protocol: "winio".to_string(),
            destination: target.to_string(),
            error: None,
        };
    }

    let url = match Url::parse(target) {
        Ok(url) => url,
        Err(e) => return Target::failed(e.to_string()),
    };

    match url.scheme() {
        "unix" => Target {
            protocol: "unix".to_string(),
            destination: url.path().to_string(),
            error: None,
        },
        scheme @ ("http" | "https" | "tcp") => {
            let host = url.host_str().unwrap_or_default();
            let destination = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            Target {
                protocol: scheme.to_string(),
                destination,
                error: None,
            }
        }
        other => Target::failed(format!(
            "unsupported scheme. valid schemes: http, https, tcp, unix; got {}",
            other
        )),
    }
}

/// 配置与日志文件路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilePaths {
    pub phantom: String,
    pub specter: String,
    pub log: String,
}

pub fn file_paths(paths: &Paths) -> FilePaths {
    FilePaths {
        phantom: paths.phantom_config.display().to_string(),
        specter: paths.specter_config.display().to_string(),
        log: paths.log_file.display().to_string(),
    }
}
