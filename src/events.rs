/// 对外通知
///
/// 事件是尽力而为的广播，没有订阅者时直接丢弃，发送方从不等待确认。
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// 单个 forwarder 已启动（携带监听地址）
    ForwarderStarted(String),
    /// 单个 forwarder 已停止（携带监听地址）
    ForwarderStopped(String),
    ForwardersStarting,
    ForwardersStarted,
    ForwardersStopped,
    ClientConnecting,
    ClientConnected,
    ClientDisconnected,
}

impl Event {
    /// 事件名称，例如 `forwarder:Started`、`specter:Connecting`
    pub fn name(&self) -> &'static str {
        match self {
            Event::ForwarderStarted(_) => "forwarder:Started",
            Event::ForwarderStopped(_) => "forwarder:Stopped",
            Event::ForwardersStarting => "forwarders:Starting",
            Event::ForwardersStarted => "forwarders:Started",
            Event::ForwardersStopped => "forwarders:Stopped",
            Event::ClientConnecting => "specter:Connecting",
            Event::ClientConnected => "specter:Connected",
            Event::ClientDisconnected => "specter:Disconnected",
        }
    }

    pub fn listen(&self) -> Option<&str> {
        match self {
            Event::ForwarderStarted(listen) | Event::ForwarderStopped(listen) => Some(listen),
            _ => None,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.listen() {
            Some(listen) => write!(f, "{} {}", self.name(), listen),
            None => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        trace!(event = %event, "emit");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(Event::ClientConnecting.name(), "specter:Connecting");
        assert_eq!(
            Event::ForwarderStarted("127.0.0.1:9001".into()).to_string(),
            "forwarder:Started 127.0.0.1:9001"
        );
        assert_eq!(Event::ForwardersStopped.to_string(), "forwarders:Stopped");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(Event::ForwardersStarting);

        let mut rx = bus.subscribe();
        bus.emit(Event::ClientConnected);
        assert_eq!(rx.recv().await.unwrap(), Event::ClientConnected);
    }
}
