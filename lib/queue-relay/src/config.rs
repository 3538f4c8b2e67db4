// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Relay configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file from the `RELAY_CONFIG_PATH` environment variable
//! 3. Environment variables (`RELAY_<SECTION>_<FIELD>`)

use std::time::Duration;

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Inbound poll engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_retriever_backoff"))]
#[serde(default)]
pub struct RetrieverConfig {
    /// Number of independent poll workers per queue.
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,

    /// Maximum number of items requested per dequeue call.
    #[validate(range(min = 1, max = 32))]
    pub batch_size: usize,

    /// How long a dequeued item stays invisible to other pollers.
    #[validate(range(min = 1))]
    pub visibility_timeout_ms: u64,

    #[validate(range(min = 1))]
    pub backoff_initial_ms: u64,

    #[validate(range(min = 1))]
    pub backoff_max_ms: u64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            batch_size: 16,
            visibility_timeout_ms: 30_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

impl RetrieverConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

fn validate_retriever_backoff(config: &RetrieverConfig) -> Result<(), ValidationError> {
    if config.backoff_initial_ms > config.backoff_max_ms {
        return Err(ValidationError::new("backoff_initial_ms exceeds backoff_max_ms"));
    }
    Ok(())
}

/// Outbound sender pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SenderConfig {
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,

    /// Period of the supervisor that wakes the pool when work is queued.
    #[validate(range(min = 1))]
    pub supervisor_interval_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            supervisor_interval_ms: 100,
        }
    }
}

impl SenderConfig {
    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }
}

/// Reliable-send settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SendConfig {
    /// Deadline after which an unacknowledged enqueue is completed as lost.
    #[validate(range(min = 1))]
    pub callback_timeout_ms: u64,

    /// Period of the sweep that enforces the deadline.
    #[validate(range(min = 1))]
    pub sweep_interval_ms: u64,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            callback_timeout_ms: 300_000,
            sweep_interval_ms: 180_000,
        }
    }
}

impl SendConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Credit-based prefetch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Number of credits; bounds cached plus in-flight items.
    #[validate(range(min = 1))]
    pub cache_capacity: usize,

    /// Maximum concurrent backend fetches.
    #[validate(range(min = 1))]
    pub max_outstanding: usize,

    /// Delay before re-polling after a fetch found nothing.
    #[validate(range(min = 1))]
    pub empty_retry_ms: u64,

    /// How many recently admitted dedup tokens are remembered.
    #[validate(range(min = 1))]
    pub dedup_window: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 64,
            max_outstanding: 16,
            empty_retry_ms: 200,
            dedup_window: 4096,
        }
    }
}

impl PrefetchConfig {
    pub fn empty_retry(&self) -> Duration {
        Duration::from_millis(self.empty_retry_ms)
    }
}

/// Durable persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PersistConfig {
    #[validate(range(min = 1))]
    pub flush_interval_ms: u64,

    /// Responses per table batch; the table service caps batches at 100.
    #[validate(range(min = 1, max = 100))]
    pub flush_batch_size: usize,

    #[validate(range(min = 1))]
    pub request_check_interval_ms: u64,

    /// Largest payload kept inline in a queue item or table entity.
    #[validate(range(min = 1))]
    pub inline_threshold: usize,

    /// Prefix of every derived queue/table/container name.
    #[validate(length(min = 1, max = 16))]
    pub name_prefix: String,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
            flush_batch_size: 50,
            request_check_interval_ms: 5_000,
            inline_threshold: 48 * 1024,
            name_prefix: "relay".to_string(),
        }
    }
}

impl PersistConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_check_interval(&self) -> Duration {
        Duration::from_millis(self.request_check_interval_ms)
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RelayConfig {
    #[validate(nested)]
    #[serde(default)]
    pub retriever: RetrieverConfig,

    #[validate(nested)]
    #[serde(default)]
    pub sender: SenderConfig,

    #[validate(nested)]
    #[serde(default)]
    pub send: SendConfig,

    #[validate(nested)]
    #[serde(default)]
    pub prefetch: PrefetchConfig,

    #[validate(nested)]
    #[serde(default)]
    pub persist: PersistConfig,
}

impl RelayConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var("RELAY_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::file(&config_path))
            // RELAY_RETRIEVER_CONCURRENCY, RELAY_RETRIEVER_BATCH_SIZE, ...
            .merge(
                Env::prefixed("RELAY_RETRIEVER_")
                    .map(|k| format!("retriever.{}", k.as_str().to_lowercase()).into()),
            )
            .merge(
                Env::prefixed("RELAY_SENDER_")
                    .map(|k| format!("sender.{}", k.as_str().to_lowercase()).into()),
            )
            // RELAY_SEND_CALLBACK_TIMEOUT_MS, RELAY_SEND_SWEEP_INTERVAL_MS
            .merge(
                Env::prefixed("RELAY_SEND_")
                    .map(|k| format!("send.{}", k.as_str().to_lowercase()).into()),
            )
            .merge(
                Env::prefixed("RELAY_PREFETCH_")
                    .map(|k| format!("prefetch.{}", k.as_str().to_lowercase()).into()),
            )
            .merge(
                Env::prefixed("RELAY_PERSIST_")
                    .map(|k| format!("persist.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = RelayConfig::extract_from(
    ///     RelayConfig::figment().merge(("retriever.concurrency", 4usize)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }
}

impl Provider for RelayConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("RelayConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELAY_VARS: [&str; 6] = [
        "RELAY_CONFIG_PATH",
        "RELAY_RETRIEVER_CONCURRENCY",
        "RELAY_RETRIEVER_BATCH_SIZE",
        "RELAY_SEND_CALLBACK_TIMEOUT_MS",
        "RELAY_PREFETCH_CACHE_CAPACITY",
        "RELAY_PERSIST_NAME_PREFIX",
    ];

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.retriever.concurrency, 8);
        assert_eq!(config.retriever.backoff_initial(), Duration::from_millis(100));
        assert_eq!(config.retriever.backoff_max(), Duration::from_secs(5));
        assert_eq!(config.send.callback_timeout(), Duration::from_secs(300));
        assert_eq!(config.send.sweep_interval(), Duration::from_secs(180));
        assert_eq!(config.persist.flush_interval(), Duration::from_millis(500));
        assert_eq!(config.persist.flush_batch_size, 50);
        assert_eq!(config.persist.inline_threshold, 49_152);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(RELAY_VARS.to_vec(), || {
            let config = RelayConfig::from_env().unwrap();
            assert_eq!(config, RelayConfig::default());
        });
    }

    #[test]
    fn test_env_override() {
        temp_env::with_vars(
            vec![
                ("RELAY_RETRIEVER_CONCURRENCY", Some("12")),
                ("RELAY_SEND_CALLBACK_TIMEOUT_MS", Some("1000")),
                ("RELAY_PERSIST_NAME_PREFIX", Some("hpc")),
            ],
            || {
                let config = RelayConfig::from_env().unwrap();
                assert_eq!(config.retriever.concurrency, 12);
                assert_eq!(config.send.callback_timeout(), Duration::from_secs(1));
                assert_eq!(config.persist.name_prefix, "hpc");
                // untouched sections keep their defaults
                assert_eq!(config.prefetch, PrefetchConfig::default());
            },
        );
    }

    #[test]
    fn test_env_out_of_range_fails_validation() {
        temp_env::with_vars(vec![("RELAY_RETRIEVER_BATCH_SIZE", Some("64"))], || {
            let err = RelayConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)), "{err}");
        });
    }

    #[test]
    fn test_extract_from_with_tuple_override() {
        temp_env::with_vars_unset(RELAY_VARS.to_vec(), || {
            let figment = RelayConfig::figment_with(("prefetch.cache_capacity", 4usize))
                .merge(("prefetch.max_outstanding", 2usize));
            let config = RelayConfig::extract_from(figment).unwrap();
            assert_eq!(config.prefetch.cache_capacity, 4);
            assert_eq!(config.prefetch.max_outstanding, 2);
        });
    }

    #[test]
    fn test_backoff_schema_validation() {
        let config = RelayConfig {
            retriever: RetrieverConfig {
                backoff_initial_ms: 10_000,
                backoff_max_ms: 5_000,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_type_is_extraction_error() {
        temp_env::with_vars(vec![("RELAY_RETRIEVER_CONCURRENCY", Some("many"))], || {
            let err = RelayConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::Extraction(_)), "{err}");
        });
    }

    #[test]
    fn test_config_as_provider() {
        let original = RelayConfig {
            sender: SenderConfig {
                concurrency: 3,
                supervisor_interval_ms: 25,
            },
            ..Default::default()
        };

        let extracted = RelayConfig::extract_from(Figment::from(&original)).unwrap();
        assert_eq!(extracted, original);
    }
}
