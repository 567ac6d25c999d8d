/*!
Gradient synchronization between devices.

Only single machine stores are supported, `local` and `device` both sum the per device gradients onto the first device.
*/
use crate::{error::Error, result::Result};
use burn::{
    module::AutodiffModule,
    optim::{GradientsAccumulator, GradientsParams},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    str::FromStr,
};

/// The kind of store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvStoreKind {
    /// Aggregate on the host.
    Local,
    /// Aggregate on the device.
    Device,
    /// Synchronous multi machine.
    DistSync,
    /// Asynchronous multi machine.
    DistAsync,
}

impl KvStoreKind {
    /// Whether the store spans multiple machines.
    pub fn is_dist(&self) -> bool {
        matches!(self, Self::DistSync | Self::DistAsync)
    }
    fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Device => "device",
            Self::DistSync => "dist_sync",
            Self::DistAsync => "dist_async",
        }
    }
}

impl FromStr for KvStoreKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "local" => Ok(Self::Local),
            "device" => Ok(Self::Device),
            "dist_sync" => Ok(Self::DistSync),
            "dist_async" => Ok(Self::DistAsync),
            _ => Err(Error::InvalidKvStore(s.to_string())),
        }
    }
}

impl Display for KvStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key value store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvStore {
    kind: KvStoreKind,
    rank: usize,
    num_workers: usize,
}

impl KvStore {
    /// Creates a store from its name, ie "local".
    ///
    /// **Errors**
    /// - [`Error::InvalidKvStore`] if `name` is not a known store.
    /// - [`Error::UnsupportedKvStore`] for distributed stores.
    pub fn create(name: &str) -> Result<Self, Error> {
        let kind: KvStoreKind = name.parse()?;
        if kind.is_dist() {
            return Err(Error::UnsupportedKvStore(name.to_string()));
        }
        Ok(Self {
            kind,
            rank: 0,
            num_workers: 1,
        })
    }
    /// The kind of store.
    pub fn kind(&self) -> KvStoreKind {
        self.kind
    }
    /// The rank of this worker.
    pub fn rank(&self) -> usize {
        self.rank
    }
    /// The number of workers.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }
    /// Whether the store is required to train on `devices` devices.
    ///
    /// A `local` store is not needed for a single device.
    pub fn is_needed(&self, devices: usize) -> bool {
        !(self.kind == KvStoreKind::Local && devices <= 1)
    }
    /// Sums the gradients computed on each device.
    ///
    /// The result is moved to `device`, which must be the device of `model`.
    pub fn aggregate<B, M>(
        &self,
        model: &M,
        grads: impl IntoIterator<Item = GradientsParams>,
        device: &B::Device,
    ) -> GradientsParams
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let mut accumulator = GradientsAccumulator::<M>::new();
        for grads in grads {
            accumulator.accumulate(model, grads.to_device(device, model));
        }
        accumulator.grads()
    }
}
