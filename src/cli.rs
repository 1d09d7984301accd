use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "phantom")]
#[command(author, version, about = "Local TCP forwarders and tunnel client for specter", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 使用开发环境目录（phantom-dev）
    #[arg(long, global = true)]
    pub dev: bool,

    /// 配置目录（覆盖默认位置，支持 `~`）
    #[arg(long, value_name = "DIR", global = true)]
    pub config_dir: Option<String>,

    /// 提高日志级别 (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 启动并运行，直到收到 Ctrl-C
    Run,
    /// 列出配置的监听
    List,
    /// 添加监听（只修改配置，不启动）
    Add {
        /// 本地监听地址 (host:port)
        #[arg(short, long)]
        listen: String,

        /// 远端 apex (host[:port])
        #[arg(long)]
        hostname: String,

        /// 显示名称
        #[arg(long, default_value = "")]
        label: String,

        /// 跳过证书验证
        #[arg(long)]
        insecure: bool,

        /// 使用 TLS over TCP 而不是 QUIC
        #[arg(long)]
        tcp: bool,
    },
    /// 按下标删除监听
    Remove { index: usize },
    /// 修改监听的显示名称
    Relabel { index: usize, label: String },
    /// 显示配置和日志文件路径
    Paths,
    /// 检查隧道目标格式
    CheckTarget { target: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add() {
        let cli = Cli::parse_from([
            "phantom",
            "-vv",
            "--config-dir",
            "~/phantom",
            "add",
            "--listen",
            "127.0.0.1:9001",
            "--hostname",
            "example.com",
            "--tcp",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config_dir.as_deref(), Some("~/phantom"));
        match cli.command {
            Commands::Add { listen, tcp, insecure, .. } => {
                assert_eq!(listen, "127.0.0.1:9001");
                assert!(tcp);
                assert!(!insecure);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
