// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// filters when set.
pub fn setup_logger(cfg: &LogConfig) {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) => EnvFilter::new(env),
        Err(_) => EnvFilter::new(cfg.to_filter_string()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
