/// Phantom 库入口
///
/// 本地 TCP forwarder 编排与 specter 隧道客户端控制，供界面层或命令行使用
pub mod app;
pub mod batch;
pub mod config;
pub mod dialer;
pub mod error;
pub mod events;
pub mod forwarder;
pub mod helper;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod rtt;
pub mod tls;
pub mod tunnel;

// 重新导出常用类型
pub use app::{AppOptions, Application};
pub use config::{ApexConfig, ListenerSpec, PhantomConfig, Tunnel};
pub use error::{PhantomError, Result};
pub use events::{Event, EventBus};
