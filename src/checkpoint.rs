/*!
Saving and loading of the network.

A checkpoint with prefix `model` at epoch 3 consists of:
- `model-symbol.json`: the [`InceptionConfig`] and the node list of the network.
- `model-0003.mpk`: the parameters, in full precision, via [`NamedMpkFileRecorder`].
*/
use crate::{
    error::Error,
    fit::EpochEndCallback,
    network::{Inception, InceptionConfig, Node},
    result::Result,
};
use anyhow::Context;
use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

/// Appends the rank of the worker to `model_prefix`.
pub fn rank_prefix(model_prefix: &str, rank: usize) -> String {
    format!("{model_prefix}-{rank}")
}

fn symbol_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}-symbol.json"))
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::new()
}

fn params_path(prefix: &str, epoch: usize) -> PathBuf {
    PathBuf::from(format!("{prefix}-{epoch:04}"))
}

#[derive(Serialize)]
struct SymbolRef<'a> {
    config: &'a InceptionConfig,
    nodes: Vec<Node>,
}

#[derive(Deserialize)]
struct Symbol {
    config: InceptionConfig,
}

/// Saves the network at `epoch`.
pub fn save<B: Backend>(
    prefix: &str,
    epoch: usize,
    config: &InceptionConfig,
    model: &Inception<B>,
) -> Result<()> {
    let symbol_path = symbol_path(prefix);
    if let Some(parent) = symbol_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let symbol = SymbolRef {
        config,
        nodes: config.symbol(),
    };
    fs::write(&symbol_path, serde_json::to_string_pretty(&symbol)?)
        .with_context(|| format!("Failed to write {symbol_path:?}"))?;
    let params_path = params_path(prefix, epoch);
    recorder()
        .record(model.clone().into_record(), params_path.clone())
        .map_err(|e| Error::Checkpoint(format!("{params_path:?}: {e}")))?;
    tracing::info!("Saved checkpoint to \"{}\"", params_path.display());
    Ok(())
}

/// Loads the network saved at `epoch`.
///
/// **Errors**
/// Returns [`Error::Checkpoint`] if the files are missing or invalid.
pub fn load<B: Backend>(
    prefix: &str,
    epoch: usize,
    device: &B::Device,
) -> Result<(InceptionConfig, Inception<B>)> {
    let symbol_path = symbol_path(prefix);
    let json = fs::read_to_string(&symbol_path)
        .map_err(|e| Error::Checkpoint(format!("{symbol_path:?}: {e}")))?;
    let Symbol { config } = serde_json::from_str(&json)
        .map_err(|e| Error::Checkpoint(format!("{symbol_path:?}: {e}")))?;
    let params_path = params_path(prefix, epoch);
    let record = recorder()
        .load(params_path.clone(), device)
        .map_err(|e| Error::Checkpoint(format!("{params_path:?}: {e}")))?;
    let model = config.init::<B>(device).load_record(record);
    tracing::info!("Loaded checkpoint from \"{}\"", params_path.display());
    Ok((config, model))
}

/// Loads the network to resume training at `load_epoch`.
///
/// **Errors**
/// [`Error::MissingModelPrefix`] if `model_prefix` is None.
pub fn resume<B: Backend>(
    model_prefix: Option<&str>,
    load_epoch: usize,
    device: &B::Device,
) -> Result<(InceptionConfig, Inception<B>)> {
    let prefix = model_prefix.ok_or(Error::MissingModelPrefix)?;
    load(prefix, load_epoch, device)
}

/// Saves a checkpoint at the end of every epoch.
#[derive(Debug, Clone)]
pub struct DoCheckpoint {
    prefix: String,
    config: InceptionConfig,
}

impl DoCheckpoint {
    /// Saves to `prefix`.
    pub fn new(prefix: impl Into<String>, config: InceptionConfig) -> Self {
        Self {
            prefix: prefix.into(),
            config,
        }
    }
}

impl<B: Backend> EpochEndCallback<B> for DoCheckpoint {
    fn call(&mut self, epoch: usize, model: &Inception<B>) -> Result<()> {
        save(&self.prefix, epoch + 1, &self.config, model)
    }
}
