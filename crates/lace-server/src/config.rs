use std::str::FromStr;
use std::time::Duration;

use crate::manager::ManagerConfig;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    /// Frames buffered per connection before it is considered too slow.
    pub send_queue: usize,
    pub replay_buffer: usize,
    pub heartbeat: Duration,
    /// Reconnect delay suggested to browsers via the SSE `retry:` field.
    pub retry_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 31337,
            max_connections: 1000,
            send_queue: 256,
            replay_buffer: 500,
            heartbeat: Duration::from_secs(30),
            retry_ms: 3000,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `LACE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Values that fail to parse
    /// are ignored with a warning.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("LACE_HOST").filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }
        if let Some(port) = parse_var(&lookup, "LACE_PORT") {
            self.port = port;
        }
        if let Some(max) = parse_var(&lookup, "LACE_MAX_CONNECTIONS") {
            self.max_connections = max;
        }
        if let Some(queue) = parse_var(&lookup, "LACE_SEND_QUEUE") {
            self.send_queue = queue;
        }
        if let Some(replay) = parse_var(&lookup, "LACE_REPLAY_BUFFER") {
            self.replay_buffer = replay;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LACE_HEARTBEAT_SECS") {
            self.heartbeat = Duration::from_secs(secs.max(1));
        }
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Channel capacity for one connection: the live send queue plus room for
    /// the confirmation and a full replay, which are written before the
    /// response body starts draining.
    pub fn connection_queue(&self) -> usize {
        self.send_queue
            .saturating_add(self.replay_buffer)
            .saturating_add(1)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_connections: self.max_connections,
            replay_buffer: self.replay_buffer,
            retry_ms: self.retry_ms,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
