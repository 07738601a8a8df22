/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SERVER_PORT: u16 = 17082;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Messenger API server address
    pub server_addr: SocketAddr,

    /// Roster endpoint (GET)
    pub roster_path: String,

    /// Server-sent events endpoint (GET)
    pub events_path: String,

    /// Prefix of the per-peer "seen" endpoint (POST `<prefix><peer>/seen`)
    pub seen_path_prefix: String,

    /// Timeout for connecting and receiving response headers
    pub request_timeout: Duration,

    /// Capacity of the engine's command queue
    pub queue_capacity: usize,

    /// First retry delay for failed fetches and dropped subscriptions
    pub retry_base_ms: u64,

    /// Upper bound for retry delays
    pub retry_max_ms: u64,

    /// Attempts per roster load, including the first
    pub max_fetch_attempts: u32,

    /// Fetch the roster again when a live event names an unknown peer
    pub backfill_unknown_peers: bool,

    /// Directory for the roster cache; caching is disabled when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVER_PORT)),
            roster_path: "/api/contacts".to_string(),
            events_path: "/events".to_string(),
            seen_path_prefix: "/api/conversations/".to_string(),
            request_timeout: Duration::from_secs(10),
            queue_capacity: 256,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            max_fetch_attempts: 5,
            backfill_unknown_peers: true,
            data_dir: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();
        let mut no_cache = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--timeout-ms" => {
                    let ms = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--timeout-ms requires a value".to_string())
                    })?;
                    let ms = ms.parse::<u64>().map_err(|_| {
                        SyncError::Config("--timeout-ms must be a number of milliseconds".to_string())
                    })?;
                    config.request_timeout = Duration::from_millis(ms);
                    i += 2;
                }
                "--no-cache" => {
                    no_cache = true;
                    i += 1;
                }
                "--no-backfill" => {
                    config.backfill_unknown_peers = false;
                    i += 1;
                }
                other if other.starts_with("--") => {
                    return Err(SyncError::Config(format!("Unknown option: {}", other)));
                }
                other => {
                    config.server_addr = parse_server_addr(other)?;
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(addr) = std::env::var("RIPPLE_SERVER") {
            config.server_addr = parse_server_addr(&addr)?;
        }
        if let Ok(dir) = std::env::var("RIPPLE_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }
        if std::env::var("RIPPLE_NO_CACHE").is_ok() {
            no_cache = true;
        }
        if no_cache {
            config.data_dir = None;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(SyncError::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.max_fetch_attempts == 0 {
            return Err(SyncError::Config(
                "max_fetch_attempts must be at least 1".to_string(),
            ));
        }
        for (name, path) in [
            ("roster_path", &self.roster_path),
            ("events_path", &self.events_path),
            ("seen_path_prefix", &self.seen_path_prefix),
        ] {
            if !path.starts_with('/') {
                return Err(SyncError::Config(format!("{} must start with '/'", name)));
            }
        }
        Ok(())
    }
}

/// Accepts `host:port` or a bare port on localhost
fn parse_server_addr(s: &str) -> Result<SocketAddr> {
    if let Ok(port) = s.parse::<u16>() {
        return Ok(SocketAddr::from(([127, 0, 0, 1], port)));
    }
    s.parse::<SocketAddr>()
        .map_err(|_| SyncError::Config(format!("Invalid server address: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("ripple")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server_addr.port(), DEFAULT_SERVER_PORT);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_parse_server_and_flags() {
        let config = Config::from_args(&args(&[
            "10.0.0.2:9000",
            "--timeout-ms",
            "2500",
            "--no-backfill",
        ]))
        .unwrap();
        assert_eq!(config.server_addr, "10.0.0.2:9000".parse().unwrap());
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert!(!config.backfill_unknown_peers);
    }

    #[test]
    fn test_bare_port_means_localhost() {
        assert_eq!(
            parse_server_addr("18000").unwrap(),
            "127.0.0.1:18000".parse().unwrap()
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Config::from_args(&args(&["--timeout-ms"])).is_err());
        assert!(Config::from_args(&args(&["--timeout-ms", "soon"])).is_err());
        assert!(Config::from_args(&args(&["--bogus"])).is_err());
        assert!(Config::from_args(&args(&["not-an-address"])).is_err());
    }

    #[test]
    fn test_validate_paths() {
        let config = Config {
            roster_path: "api/contacts".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
