// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Relay logging.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `RELAY_LOGGING_CONFIG_PATH` environment variable.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `RELAY_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters can be configured using the `RELAY_LOG` environment variable or by setting the
//! `log_filters` key in the TOML configuration file. The default log level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "queue_relay::registry" = "debug"
//! ```

use std::collections::BTreeMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::Directive, fmt};

/// ENV used to set the log level
const FILTER_ENV: &str = "RELAY_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "RELAY_LOGGING_CONFIG_PATH";

const JSONL_ENV: &str = "RELAY_LOGGING_JSONL";
const DISABLE_ANSI_ENV: &str = "RELAY_DISABLE_ANSI_LOGGING";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: BTreeMap::new(),
        }
    }
}

/// Initialize the process-wide subscriber. Safe to call more than once.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    // The generics mean we have to repeat everything. Each builder method returns a
    // specialized type.
    let result = if env_is_truthy(JSONL_ENV) {
        let l = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    } else {
        let l = fmt::layer()
            .with_ansi(!env_is_truthy(DISABLE_ANSI_ENV))
            .event_format(fmt::format().compact())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    };

    if let Err(e) = result {
        eprintln!("queue-relay logging was not installed: {e}");
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| tracing::level_filters::LevelFilter::INFO.into());

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(config_path));

    match figment.extract() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid logging configuration, using defaults: {e}");
            LoggingConfig::default()
        }
    }
}

fn env_is_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_defaults() {
        temp_env::with_var_unset(CONFIG_PATH_ENV, || {
            let config = load_config();
            assert_eq!(config, LoggingConfig::default());
        });
    }

    #[test]
    fn test_module_filters_are_applied() {
        let config = LoggingConfig {
            log_level: "warn".to_string(),
            log_filters: BTreeMap::from([
                ("queue_relay::registry".to_string(), "debug".to_string()),
                ("queue_relay::prefetch".to_string(), "not-a-level".to_string()),
            ]),
        };
        temp_env::with_var_unset(FILTER_ENV, || {
            let rendered = filters(config).to_string();
            assert!(rendered.contains("queue_relay::registry=debug"), "{rendered}");
            assert!(!rendered.contains("queue_relay::prefetch"), "{rendered}");
            assert!(rendered.contains("warn"), "{rendered}");
        });
    }

    #[test]
    fn test_env_is_truthy() {
        temp_env::with_vars(
            vec![(JSONL_ENV, Some("TRUE")), (DISABLE_ANSI_ENV, Some("0"))],
            || {
                assert!(env_is_truthy(JSONL_ENV));
                assert!(!env_is_truthy(DISABLE_ANSI_ENV));
            },
        );
        temp_env::with_var_unset(JSONL_ENV, || assert!(!env_is_truthy(JSONL_ENV)));
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!("logging initialized");
    }
}
