use std::str::FromStr;
use std::time::Duration;

use crate::error::DispatchError;

pub const DEFAULT_PORT: u16 = 3355;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// How often the reaper sweeps for zombie tasks.
    pub reap_interval: Duration,
    /// A running task whose last heartbeat is at least this many seconds old
    /// is considered abandoned and forcibly finished.
    pub heartbeat_timeout_secs: i64,
    /// `list` is refused outright above this many live tasks; it is a
    /// small-scale debugging aid, not a cluster inspection tool.
    pub max_list_tasks: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            reap_interval: Duration::from_secs(5),
            heartbeat_timeout_secs: 60,
            max_list_tasks: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between heartbeats while a task is running. Must stay well
    /// under the server's heartbeat timeout.
    pub heartbeat_interval: Duration,
    /// Poll back-off bounds when the server has no work for us.
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            min_poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(60),
        }
    }
}

/// A `host` or `host:port` connection string; the port defaults to 3355.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 2 || parts[0].is_empty() {
            return Err(DispatchError::InvalidAddress(s.to_string()));
        }
        let port = match parts.get(1) {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| DispatchError::InvalidAddress(s.to_string()))?,
            None => DEFAULT_PORT,
        };
        Ok(Self {
            host: parts[0].to_string(),
            port,
        })
    }
}

/// Split a resource-tag list on space, comma, and semicolon, discarding
/// empty tokens.
pub fn parse_resource_tags(list: &str) -> Vec<String> {
    list.split([' ', ',', ';'])
        .filter(|tag| !tag.is_empty())
        .map(|tag| tag.to_string())
        .collect()
}
