/*!
# cifar10-inception
Trains a small Inception style convolutional network on [CIFAR-10](<https://www.cs.toronto.edu/~kriz/cifar.html>).

The numerical work (convolution, autodiff, optimizers, device execution) is done by [burn](https://docs.rs/burn).
This crate provides:
- Downloading and decoding of the dataset ([`dataset::cifar10`]).
- An image iterator with cropping, mirroring, mean subtraction and partitioning ([`dataset::iter`]).
- The network, composed from layer factories ([`network`]).
- Training orchestration: [`fit`], [`metric`], [`lr_scheduler`], [`checkpoint`] and [`kvstore`].

# Example
```no_run
# use cifar10_inception::{result::Result, dataset::cifar10::Cifar10};
# fn main() -> Result<()> {
let cifar10 = Cifar10::builder()
    .path("cifar10".as_ref())
    .download(true)
    .verbose(true)
    .build()?;
assert_eq!(cifar10.train_images().shape(), &[50_000, 3, 32, 32]);
# Ok(())
# }
```
*/
#![warn(missing_docs)]
#![deny(unsafe_code)]

/// Checkpointing.
pub mod checkpoint;
/// Datasets.
pub mod dataset;
/// Errors.
pub mod error;
/// Training.
pub mod fit;
/// Parameter aggregation across devices.
pub mod kvstore;
/// Logging setup.
pub mod logging;
/// Learning rate schedules.
pub mod lr_scheduler;
/// Evaluation metrics.
pub mod metric;
/// The Inception network.
pub mod network;

/// Result.
pub mod result {
    /// Result with [`anyhow::Error`] as the default error.
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub use burn;
