use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings of the HTTP/WebSocket server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Directory of static UI files served as the fallback route.
    pub ui_dir: PathBuf,
    /// How long a session outlives its connection for export.
    pub retention: Duration,
    /// How often detached sessions are checked for eviction.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            ui_dir: PathBuf::from("ui"),
            retention: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Sweep at least once per retention window, and never busier than once a second.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self.sweep_interval = retention.clamp(Duration::from_secs(1), Duration::from_secs(60));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_follows_retention() {
        let c = ServerConfig::default().with_retention(Duration::from_secs(10));
        assert_eq!(c.sweep_interval, Duration::from_secs(10));
        let c = ServerConfig::default().with_retention(Duration::ZERO);
        assert_eq!(c.sweep_interval, Duration::from_secs(1));
        let c = ServerConfig::default().with_retention(Duration::from_secs(3600));
        assert_eq!(c.sweep_interval, Duration::from_secs(60));
    }
}
