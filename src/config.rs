//! Configuration for the IndriyaIO daemon
//!
//! Loads configuration from a TOML file with the minimal parameters needed
//! to select a backend and size the client channels.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub backend: BackendConfig,
    pub channel: ChannelConfig,
    pub logging: LoggingConfig,
}

/// Backend selection and connection policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Backend variant: "hardware" or "simulated"
    pub kind: String,

    /// Unix socket path of the hardware backend process
    ///
    /// Only used by the hardware variant.
    pub socket_path: String,

    /// Connect/reconnect attempts before reporting a fault
    pub connect_retries: u32,

    /// Delay between connect attempts, in milliseconds
    pub retry_delay_ms: u64,

    /// Simulated-backend tuning; ignored by the hardware variant
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Simulated backend tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Sample generation interval when no configuration was applied yet, ms
    pub default_interval_ms: u64,

    /// Seed for the sample noise generator (0 = random each run)
    pub random_seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 200,
            random_seed: 0,
        }
    }
}

/// Per-client data channel sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Send buffer capacity of the broker-side endpoint, in sample records
    pub send_buffer_samples: usize,

    /// Receive buffer of the client-facing direction, in bytes
    pub recv_buffer_bytes: usize,

    /// Hard cap on simultaneously open client channels
    pub max_clients: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log output (stdout, stderr, or file path)
    pub output: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration: simulated backend, standalone-friendly.
    ///
    /// Suitable for development and testing. Production deployments point
    /// `backend.kind` at "hardware" with the driver's socket path.
    pub fn defaults() -> Self {
        Self {
            backend: BackendConfig {
                kind: "simulated".to_string(),
                socket_path: "/run/indriyaio/backend.sock".to_string(),
                connect_retries: 25,
                retry_delay_ms: 200,
                simulation: SimulationConfig::default(),
            },
            channel: ChannelConfig {
                send_buffer_samples: 100,
                recv_buffer_bytes: 2048,
                max_clients: 256,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                output: "stdout".to_string(),
            },
        }
    }

    fn validate(&self) -> Result<()> {
        match self.backend.kind.as_str() {
            "hardware" | "simulated" => {}
            other => {
                return Err(Error::Config(format!("unknown backend kind: {other}")));
            }
        }
        if self.backend.connect_retries == 0 {
            return Err(Error::Config(
                "backend.connect_retries must be at least 1".to_string(),
            ));
        }
        if self.channel.send_buffer_samples == 0 || self.channel.max_clients == 0 {
            return Err(Error::Config(
                "channel sizing values must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}
