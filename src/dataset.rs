/// The CIFAR-10 dataset.
pub mod cifar10;
/// Batched image iteration with augmentation.
pub mod iter;
