// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Optional logging setup for binaries and tests.
//!
//! The engine itself only emits `tracing` events; installing a subscriber
//! is the embedding application's business. This helper covers the common
//! case: console output, an optional log file, and a debug toggle. Calling
//! it is entirely optional, and a second call simply fails because a
//! subscriber is already installed.

use crate::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Where and how verbosely to log.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// File the log output is written to, if any. Recreated on every run.
    pub file: Option<PathBuf>,

    /// Whether to log to the console.
    pub console: bool,

    /// Log at debug level instead of info.
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            console: true,
            debug: false,
        }
    }
}

/// Installs the global tracing subscriber described by `config`.
///
/// # Errors
///
/// Fails with [`Error::TelemetryInit`] if the log file cannot be created or
/// a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Error> {
    let level = if config.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let console_layer = config
        .console
        .then(|| tracing_subscriber::fmt::layer().with_target(false));

    let file_layer = match &config.file {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(|e| Error::TelemetryInit {
                message: e.to_string(),
            })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(level)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::TelemetryInit {
            message: e.to_string(),
        })
}
