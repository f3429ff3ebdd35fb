use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE: &str = "pika_inbound.log";

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once. `RUST_LOG` wins over the `info` default.
///
/// With a data dir, logs are also appended to `pika_inbound.log` there so they
/// survive the process being reaped in the background.
pub fn init_logging(data_dir: Option<&Path>) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let stderr_layer = fmt::layer().with_writer(std::io::stderr);
        let file_layer = data_dir
            .and_then(|dir| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(LOG_FILE))
                    .ok()
            })
            .map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));

        // Another subscriber may already be installed by the host; keep theirs.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .try_init();
        tracing::info!(file_logging = data_dir.is_some(), "logging initialized");
    });
}
