use std::env;
use std::net::SocketAddr;

use cmind_broker::{DEFAULT_DIRECTORY_POLL_SECS, DEFAULT_STREAM_BACKOFF_SECS};
use cmind_proto::Location;

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_addr: SocketAddr,
    pub location: Location,
    pub directory_poll_secs: u64,
    pub stream_backoff_secs: u64,
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let gateway_addr = env::var("CMIND_GATEWAY_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:6789".to_string())
            .parse()
            .map_err(|e| format!("CMIND_GATEWAY_ADDR is not a host:port pair: {e}"))?;

        let config = Self {
            gateway_addr,
            location: env_or_default("CMIND_LOCATION", "Cocó".to_string()),
            directory_poll_secs: env_or_default(
                "CMIND_DIRECTORY_POLL_SECS",
                DEFAULT_DIRECTORY_POLL_SECS,
            ),
            stream_backoff_secs: env_or_default(
                "CMIND_STREAM_BACKOFF_SECS",
                DEFAULT_STREAM_BACKOFF_SECS,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.location.is_empty() {
            return Err("CMIND_LOCATION must not be empty".into());
        }
        if self.directory_poll_secs == 0 {
            return Err("CMIND_DIRECTORY_POLL_SECS must be > 0".into());
        }
        if self.stream_backoff_secs == 0 {
            return Err("CMIND_STREAM_BACKOFF_SECS must be > 0".into());
        }
        Ok(())
    }
}
