use thiserror::Error;

/// Errors produced by this crate.
///
/// Functions return [`Result`](crate::result::Result) (ie [`anyhow::Error`]), these can be
/// recovered with [`anyhow::Error::downcast_ref`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// `--load-epoch` was given without a model prefix.
    #[error("loading an epoch requires a model prefix")]
    MissingModelPrefix,
    /// The kvstore type was not recognized.
    #[error("invalid kvstore {0:?}, expected one of local, device, dist_sync, dist_async")]
    InvalidKvStore(String),
    /// The kvstore type requires multiple machines.
    #[error("kvstore {0:?} requires a parameter server, only local and device are supported")]
    UnsupportedKvStore(String),
    /// The gpu list could not be parsed.
    #[error("invalid gpu list {0:?}, expected comma separated indices ie \"0,1,2,3\"")]
    InvalidGpus(String),
    /// Streaming data from a url is not supported.
    #[error("remote data directory {0:?} is not supported")]
    RemoteDataDir(String),
    /// The dataset files were malformed.
    #[error("dataset: {0}")]
    Dataset(String),
    /// The server responded with an error status.
    #[error("downloading {url} failed with status {status}")]
    Download {
        /// The url.
        url: String,
        /// The http status.
        status: u32,
    },
    /// A checkpoint could not be saved or loaded.
    #[error("checkpoint: {0}")]
    Checkpoint(String),
    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    Config(String),
}
