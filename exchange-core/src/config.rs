use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::Result;
use crate::error::Error;

const ENV_EXCHANGE_CONFIG: &str = "EXCHANGE_CONFIG";

const DEFAULT_MAX_ATTEMPT_TIMES: u16 = 3;
const DEFAULT_RETRY_INTERVAL_MILLIS: u64 = 0;
const DEFAULT_MAX_BYTES_PER_QUERY: u64 = 64 * 1024 * 1024;

/// Sink handle related configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkHandleConfig {
    /// Attempts made to deliver a new data block or end of data block event, first one included.
    pub max_attempt_times: u16,
    /// Pause between two delivery attempts.
    pub retry_interval: Duration,
}

impl Default for SinkHandleConfig {
    fn default() -> Self {
        SinkHandleConfig {
            max_attempt_times: DEFAULT_MAX_ATTEMPT_TIMES,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MILLIS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPoolConfig {
    pub max_bytes_per_query: u64,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        MemoryPoolConfig {
            max_bytes_per_query: DEFAULT_MAX_BYTES_PER_QUERY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeConfig {
    pub sink: SinkHandleConfig,
    pub memory: MemoryPoolConfig,
}

/// JSON shape of [ExchangeConfig], every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ExchangeSpec {
    max_attempt_times: Option<u16>,
    retry_interval_ms: Option<u64>,
    max_bytes_per_query: Option<u64>,
}

impl ExchangeConfig {
    /// Loads the configuration from [ENV_EXCHANGE_CONFIG] (a base64 encoded JSON object), the
    /// defaults are used if it is not set.
    pub fn load() -> Result<Self> {
        Self::from_env_value(env::var(ENV_EXCHANGE_CONFIG).ok())
    }

    fn from_env_value(value: Option<String>) -> Result<Self> {
        match value {
            Some(encoded) => Self::from_encoded(&encoded),
            None => Ok(Self::default()),
        }
    }

    /// Parses a base64 encoded JSON configuration.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("Failed to decode exchange config: {e}")))?;
        let spec: ExchangeSpec = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse exchange config: {e}")))?;

        let mut config = ExchangeConfig::default();
        if let Some(max_attempt_times) = spec.max_attempt_times {
            if max_attempt_times == 0 {
                return Err(Error::Config(
                    "maxAttemptTimes should be greater than zero".to_string(),
                ));
            }
            config.sink.max_attempt_times = max_attempt_times;
        }
        if let Some(retry_interval_ms) = spec.retry_interval_ms {
            config.sink.retry_interval = Duration::from_millis(retry_interval_ms);
        }
        if let Some(max_bytes_per_query) = spec.max_bytes_per_query {
            if max_bytes_per_query == 0 {
                return Err(Error::Config(
                    "maxBytesPerQuery should be greater than zero".to_string(),
                ));
            }
            config.memory.max_bytes_per_query = max_bytes_per_query;
        }
        Ok(config)
    }
}

/// Process wide configuration, loaded once.
pub fn config() -> &'static ExchangeConfig {
    static CONF: OnceLock<ExchangeConfig> = OnceLock::new();
    CONF.get_or_init(|| match ExchangeConfig::load() {
        Ok(v) => v,
        Err(e) => {
            panic!("Failed to load configuration: {:?}", e);
        }
    })
}
