// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Filter configuration is loaded from, in priority order: the `PSBUS_LOG`
//! environment variable, a TOML file pointed to by `PSBUS_LOGGING_CONFIG_PATH`,
//! then defaults. Output is human-readable by default; set `PSBUS_LOG_JSONL=1`
//! for JSON lines.
//!
//! ```toml
//! log_level = "error"
//!
//! [log_filters]
//! "psbus_runtime" = "info"
//! "psbus_runtime::queue" = "trace"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter directly.
const FILTER_ENV: &str = "PSBUS_LOG";

/// ENV used to point at the TOML configuration file.
const CONFIG_PATH_ENV: &str = "PSBUS_LOGGING_CONFIG_PATH";

const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

fn load_config() -> LoggingConfig {
    let mut figment = Figment::from(Serialized::defaults(LoggingConfig::default()));
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        figment = figment.merge(Toml::file(path));
    }
    figment.extract().unwrap_or_default()
}

fn build_filter() -> EnvFilter {
    if let Ok(directives) = std::env::var(FILTER_ENV) {
        return EnvFilter::new(directives);
    }
    let config = load_config();
    let mut directives = vec![config.log_level.clone()];
    for (target, level) in &config.log_filters {
        directives.push(format!("{target}={level}"));
    }
    EnvFilter::new(directives.join(","))
}

/// Install the global subscriber. Safe to call more than once; only the first
/// call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = build_filter();
        let jsonl = std::env::var("PSBUS_LOG_JSONL").map(|v| v == "1").unwrap_or(false);
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);
        let result = if jsonl {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if result.is_err() {
            // a subscriber was installed by the embedding process; keep it
            tracing::debug!("logging already initialized, skipping");
        }
    });
}
