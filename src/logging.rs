use crate::result::Result;
use anyhow::{anyhow, Context};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::span::EnteredSpan;
use tracing_subscriber::EnvFilter;

/// Default filter, overridden by RUST_LOG.
const DEFAULT_FILTER: &str = "info,cifar10_inception=debug";

/// The path of the log file, `log_dir` defaults to the working directory.
pub fn log_path(log_file: &Path, log_dir: Option<&Path>) -> PathBuf {
    match log_dir {
        Some(dir) => dir.join(log_file),
        None => log_file.to_path_buf(),
    }
}

/// Installs the global subscriber.
///
/// Logs to stderr, or to `log_file` in `log_dir` when provided (the directory is created if it
/// does not exist). Returns the span of the worker, messages are emitted inside it while it is
/// held, ie `node{rank=0}: Epoch[0] Time cost=42.000`.
///
/// **Errors**
/// Fails if the file can't be created or a global subscriber is already set.
pub fn init(log_file: Option<&Path>, log_dir: Option<&Path>, rank: usize) -> Result<EnteredSpan> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if let Some(log_file) = log_file {
        if let Some(log_dir) = log_dir {
            fs::create_dir_all(log_dir)
                .with_context(|| format!("Failed to create log dir {log_dir:?}"))?;
        }
        let path = log_path(log_file, log_dir);
        let file =
            File::create(&path).with_context(|| format!("Failed to create log file {path:?}"))?;
        builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .map_err(|e| anyhow!("{e}"))?;
    } else {
        builder.try_init().map_err(|e| anyhow!("{e}"))?;
    }
    Ok(tracing::info_span!("node", rank).entered())
}
