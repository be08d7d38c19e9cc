//! Connection configuration, built once before `Connection::new` and immutable
//! for the connection's lifetime.

use num::rational::Ratio;
use num::BigUint;

pub const DEFAULT_MAX_REMOTE_STREAMS: u64 = 10;
pub const DEFAULT_CONNECTION_BUFFER_SIZE: u64 = 65534;
pub const DEFAULT_MIN_EXCHANGE_RATE_PRECISION: usize = 3;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub slippage: Ratio<BigUint>,
    pub enable_padding: bool,
    pub connection_tag: Option<String>,
    pub max_remote_streams: u64,
    pub connection_buffer_size: u64,
    pub min_exchange_rate_precision: usize,
    pub idle_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            slippage: Ratio::new(BigUint::from(1u32), BigUint::from(100u32)),
            enable_padding: false,
            connection_tag: None,
            max_remote_streams: DEFAULT_MAX_REMOTE_STREAMS,
            connection_buffer_size: DEFAULT_CONNECTION_BUFFER_SIZE,
            min_exchange_rate_precision: DEFAULT_MIN_EXCHANGE_RATE_PRECISION,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn slippage(mut self, slippage: Ratio<BigUint>) -> Self {
        self.config.slippage = slippage;
        self
    }

    pub fn enable_padding(mut self, enable: bool) -> Self {
        self.config.enable_padding = enable;
        self
    }

    pub fn connection_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.connection_tag = Some(tag.into());
        self
    }

    pub fn max_remote_streams(mut self, max: u64) -> Self {
        self.config.max_remote_streams = max;
        self
    }

    pub fn connection_buffer_size(mut self, size: u64) -> Self {
        self.config.connection_buffer_size = size;
        self
    }

    pub fn min_exchange_rate_precision(mut self, precision: usize) -> Self {
        self.config.min_exchange_rate_precision = precision;
        self
    }

    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.idle_timeout_ms = ms;
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_remote_streams, DEFAULT_MAX_REMOTE_STREAMS);
        assert_eq!(
            config.connection_buffer_size,
            DEFAULT_CONNECTION_BUFFER_SIZE
        );
        assert_eq!(
            config.min_exchange_rate_precision,
            DEFAULT_MIN_EXCHANGE_RATE_PRECISION
        );
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert!(!config.enable_padding);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = ConnectionConfig::builder()
            .idle_timeout_ms(0)
            .enable_padding(true)
            .connection_tag("abc")
            .max_remote_streams(4)
            .build();
        assert_eq!(config.idle_timeout_ms, 0);
        assert!(config.enable_padding);
        assert_eq!(config.connection_tag.as_deref(), Some("abc"));
        assert_eq!(config.max_remote_streams, 4);
    }
}
