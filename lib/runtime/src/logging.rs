// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lattice logging.
//!
//! Logging takes two forms: `READABLE` or `JSONL`. The default is `READABLE`;
//! `JSONL` can be enabled by setting `LAT_LOG_JSONL=1`. Filters are configured
//! with the `LAT_LOG` environment variable using the usual `EnvFilter` syntax
//! (`info`, `lattice_runtime=debug`, ...). The default level is `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter
const FILTER_ENV: &str = "LAT_LOG";

/// ENV used to switch to JSONL output
const JSONL_ENV: &str = "LAT_LOG_JSONL";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

/// Initialize the process-wide subscriber. Safe to call more than once; only
/// the first call installs anything.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

        let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);

        if jsonl {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}
