//! Client configuration

use crate::codec::{CLIENT_PORT, SERVER_PORT};
use crate::manager::DEFAULT_RENEWAL_FRACTION;
use crate::retry::{INITIAL_RETRY_DELAY, MAX_TRANSMISSIONS, RetrySchedule};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// NAT-PMP client configuration
///
/// Stored as JSON; missing fields take their defaults.
///
/// # Example
/// ```rust,no_run
/// use natpmp::ClientConfig;
///
/// // Returns defaults if the file doesn't exist
/// let config = ClientConfig::load("natpmp.json").expect("Failed to load");
/// println!("Gateway: {:?}", config.gateway);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Gateway address; discovered from the routing table when `None`
    pub gateway: Option<Ipv4Addr>,
    /// Local UDP port to bind (0 picks an ephemeral port)
    pub client_port: u16,
    /// Gateway NAT-PMP port
    pub server_port: u16,
    /// Delay before the first retransmission in milliseconds
    pub initial_retry_delay_ms: u64,
    /// Transmissions (including the first) before a request times out
    pub max_transmissions: u32,
    /// Fraction of the granted lifetime after which a mapping is renewed
    pub renewal_fraction: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway: None,
            client_port: CLIENT_PORT,
            server_port: SERVER_PORT,
            initial_retry_delay_ms: INITIAL_RETRY_DELAY.as_millis() as u64,
            max_transmissions: MAX_TRANSMISSIONS,
            renewal_fraction: DEFAULT_RENEWAL_FRACTION,
        }
    }
}

impl ClientConfig {
    /// Default configuration talking to a known gateway
    pub fn with_gateway(gateway: Ipv4Addr) -> Self {
        Self {
            gateway: Some(gateway),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    ///
    /// Returns the defaults if the file doesn't exist or is empty.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.server_port == 0 {
            return Err(Error::Config("server_port must be non-zero".to_string()));
        }
        if self.initial_retry_delay_ms == 0 {
            return Err(Error::Config(
                "initial_retry_delay_ms must be non-zero".to_string(),
            ));
        }
        if self.max_transmissions == 0 {
            return Err(Error::Config(
                "max_transmissions must be at least 1".to_string(),
            ));
        }
        if !(self.renewal_fraction > 0.0 && self.renewal_fraction < 1.0) {
            return Err(Error::Config(format!(
                "renewal_fraction must be between 0 and 1, got {}",
                self.renewal_fraction
            )));
        }
        Ok(())
    }

    /// Backoff ladder described by this configuration
    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule::new(
            Duration::from_millis(self.initial_retry_delay_ms),
            self.max_transmissions,
        )
    }
}
