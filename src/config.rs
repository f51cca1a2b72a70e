//! Runtime configuration.
//!
//! One [`Config`] per process. Install it explicitly before the runtime
//! starts, or let the defaults materialize on first read. The layout
//! round-trips through YAML:
//!
//! ```yaml
//! fiber:
//!   stack_size: 1048576
//! tcp:
//!   connect_timeout_ms: 5000
//! tcp_server:
//!   read_timeout_ms: 120000
//! ```

use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

/// Process-wide runtime knobs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fiber: FiberConfig,
    pub tcp: TcpConfig,
    pub tcp_server: TcpServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberConfig {
    /// Stack size for a work fiber, in bytes.
    pub stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        FiberConfig {
            stack_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Default timeout for a cooperative connect, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpServerConfig {
    /// Receive timeout applied to every accepted connection, in
    /// milliseconds.
    pub read_timeout_ms: u64,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        TcpServerConfig {
            read_timeout_ms: 120_000,
        }
    }
}

static CONFIG: OnceCell<Config> = OnceCell::new();

/// Install the process-wide configuration.
///
/// Returns `false` if a configuration is already in place, including the
/// defaults materialized by an earlier [`get`].
pub fn install(config: Config) -> bool {
    CONFIG.set(config).is_ok()
}

/// The process-wide configuration.
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

/// Parse a configuration from a YAML document.
pub fn from_yaml(text: &str) -> crate::Result<Config> {
    Ok(serde_yaml::from_str(text)?)
}

/// Read and parse a YAML configuration file.
pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Config> {
    let text = std::fs::read_to_string(path)?;
    from_yaml(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.fiber.stack_size, 1024 * 1024);
        assert_eq!(config.tcp.connect_timeout_ms, 5000);
        assert_eq!(config.tcp_server.read_timeout_ms, 120_000);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = from_yaml("fiber:\n  stack_size: 65536\n").unwrap();
        assert_eq!(config.fiber.stack_size, 65536);
        assert_eq!(config.tcp.connect_timeout_ms, 5000);
    }

    #[test]
    fn full_yaml_round_trip() {
        let config = Config {
            fiber: FiberConfig { stack_size: 131072 },
            tcp: TcpConfig {
                connect_timeout_ms: 250,
            },
            tcp_server: TcpServerConfig {
                read_timeout_ms: 1000,
            },
        };
        let text = serde_yaml::to_string(&config).unwrap();
        assert_eq!(from_yaml(&text).unwrap(), config);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(from_yaml("fiber: [not, a, map]").is_err());
    }
}
