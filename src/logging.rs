use crate::paths::{BuildMode, Paths};
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// 根据构建模式选择默认日志级别，`RUST_LOG` 优先
fn default_level(mode: BuildMode, verbose: u8) -> &'static str {
    match (mode.is_production(), verbose) {
        (_, v) if v >= 2 => "trace",
        (true, 0) => "info",
        _ => "debug",
    }
}

/// 初始化日志：控制台 + 进程日志文件（追加写入）
///
/// 调用前日志目录必须已经存在。
pub fn init(paths: &Paths, mode: BuildMode, verbose: u8) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)
        .with_context(|| format!("Failed to open log file {:?}", paths.log_file))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(mode, verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level() {
        assert_eq!(default_level(BuildMode::Production, 0), "info");
        assert_eq!(default_level(BuildMode::Dev, 0), "debug");
        assert_eq!(default_level(BuildMode::Production, 1), "debug");
        assert_eq!(default_level(BuildMode::Production, 3), "trace");
    }
}
