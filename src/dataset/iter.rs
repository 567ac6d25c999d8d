use crate::{error::Error, result::Result};
use anyhow::{bail, ensure, Context};
use ndarray::{s, ArcArray, ArcArray1, Array3, Array4, ArrayView4, Axis, Ix4, Zip};
use rand::{seq::SliceRandom, Rng};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// ImageIter builder.
pub mod builders {
    use super::*;

    /// ImageIter builder.
    #[derive(Debug)]
    pub struct ImageIterBuilder {
        pub(super) images: ArcArray<u8, Ix4>,
        pub(super) classes: ArcArray1<u8>,
        pub(super) data_shape: [usize; 3],
        pub(super) batch_size: usize,
        pub(super) rand_crop: bool,
        pub(super) rand_mirror: bool,
        pub(super) shuffle: bool,
        pub(super) mean_img: Option<PathBuf>,
        pub(super) num_parts: usize,
        pub(super) part_index: usize,
    }

    impl ImageIterBuilder {
        /// The shape of each produced image, \[channels, height, width\].
        ///
        /// Defaults to the shape of the input images.
        pub fn data_shape(self, data_shape: [usize; 3]) -> Self {
            Self { data_shape, ..self }
        }
        /// The batch size. Defaults to 128.
        pub fn batch_size(self, batch_size: usize) -> Self {
            Self { batch_size, ..self }
        }
        /// Crop at a random position instead of the center. Defaults to false.
        pub fn rand_crop(self, rand_crop: bool) -> Self {
            Self { rand_crop, ..self }
        }
        /// Flip images horizontally with probability 0.5. Defaults to false.
        pub fn rand_mirror(self, rand_mirror: bool) -> Self {
            Self {
                rand_mirror,
                ..self
            }
        }
        /// Shuffle the order of the images each epoch. Defaults to false.
        pub fn shuffle(self, shuffle: bool) -> Self {
            Self { shuffle, ..self }
        }
        /// Subtract the mean image stored at `path`.
        ///
        /// If the file does not exist, the mean is computed from the (partitioned) images and
        /// saved to `path`. Use the same file for the training and validation iterators.
        pub fn mean_img(self, path: impl Into<PathBuf>) -> Self {
            Self {
                mean_img: Some(path.into()),
                ..self
            }
        }
        /// Split the images into `num_parts` contiguous parts. Defaults to 1.
        pub fn num_parts(self, num_parts: usize) -> Self {
            Self { num_parts, ..self }
        }
        /// The part to iterate over. Defaults to 0.
        pub fn part_index(self, part_index: usize) -> Self {
            Self { part_index, ..self }
        }
        /// Builds the iterator.
        ///
        /// **Errors**
        /// - The number of images and classes differ.
        /// - The batch size is 0.
        /// - `part_index` is not less than `num_parts`.
        /// - The data shape does not fit within the images.
        /// - The mean image could not be loaded / saved.
        pub fn build(self) -> Result<ImageIter> {
            ImageIter::build(self)
        }
    }
}
use builders::ImageIterBuilder;

/// A batch of images and their classes.
#[derive(Clone, Debug)]
pub struct Batch {
    /// The images, \[batch_size, channels, height, width\].
    pub images: Array4<f32>,
    /// The classes.
    pub classes: Vec<u8>,
}

impl Batch {
    /// The number of images.
    pub fn len(&self) -> usize {
        self.classes.len()
    }
    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Iterates over batches of images, with optional cropping, mirroring and mean subtraction.
#[derive(Clone, Debug)]
pub struct ImageIter {
    images: ArcArray<u8, Ix4>,
    classes: ArcArray1<u8>,
    data_shape: [usize; 3],
    batch_size: usize,
    rand_crop: bool,
    rand_mirror: bool,
    shuffle: bool,
    mean: Option<Array3<f32>>,
}

impl ImageIter {
    /// Returns a builder for iterating over `images` and `classes`.
    ///
    /// The images are \[samples, channels, height, width\].
    pub fn builder(images: ArcArray<u8, Ix4>, classes: ArcArray1<u8>) -> ImageIterBuilder {
        let (_, c, h, w) = images.dim();
        ImageIterBuilder {
            images,
            classes,
            data_shape: [c, h, w],
            batch_size: 128,
            rand_crop: false,
            rand_mirror: false,
            shuffle: false,
            mean_img: None,
            num_parts: 1,
            part_index: 0,
        }
    }
    fn build(builder: ImageIterBuilder) -> Result<Self> {
        let ImageIterBuilder {
            images,
            classes,
            data_shape,
            batch_size,
            rand_crop,
            rand_mirror,
            shuffle,
            mean_img,
            num_parts,
            part_index,
        } = builder;
        let samples = images.len_of(Axis(0));
        ensure!(
            samples == classes.len(),
            Error::Dataset(format!(
                "{samples} images but {} classes",
                classes.len()
            ))
        );
        if batch_size == 0 {
            bail!(Error::Config("batch_size must be positive".into()));
        }
        if part_index >= num_parts {
            bail!(Error::Config(format!(
                "part_index {part_index} out of range for {num_parts} parts"
            )));
        }
        let (_, c, h, w) = images.dim();
        let [dc, dh, dw] = data_shape;
        if dc != c || dh == 0 || dw == 0 || dh > h || dw > w {
            bail!(Error::Config(format!(
                "data_shape {data_shape:?} does not fit images {:?}",
                [c, h, w]
            )));
        }
        let range = partition(samples, num_parts, part_index);
        let images = images.slice_move(s![range.clone(), .., .., ..]);
        let classes = classes.slice_move(s![range]);
        let mean = if let Some(path) = mean_img {
            Some(load_or_compute_mean(&path, images.view(), data_shape)?)
        } else {
            None
        };
        Ok(Self {
            images,
            classes,
            data_shape,
            batch_size,
            rand_crop,
            rand_mirror,
            shuffle,
            mean,
        })
    }
    /// The number of batches per epoch.
    pub fn len(&self) -> usize {
        self.samples().div_ceil(self.batch_size)
    }
    /// Whether there are no batches.
    pub fn is_empty(&self) -> bool {
        self.samples() == 0
    }
    /// The number of images, after partitioning.
    pub fn samples(&self) -> usize {
        self.classes.len()
    }
    /// The batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
    /// The shape of the produced images.
    pub fn data_shape(&self) -> [usize; 3] {
        self.data_shape
    }
    /// The mean image, if any.
    pub fn mean(&self) -> Option<&Array3<f32>> {
        self.mean.as_ref()
    }
    /// Returns an iterator over the batches of one epoch.
    ///
    /// Shuffling, crop positions and mirroring are drawn from `rng`. The final batch may be
    /// smaller than the batch size.
    pub fn batches<R: Rng>(&self, rng: &mut R) -> Batches<'_> {
        let samples = self.samples();
        let mut indices: Vec<usize> = (0..samples).collect();
        if self.shuffle {
            indices.shuffle(rng);
        }
        let (_, _, h, w) = self.images.dim();
        let [_, dh, dw] = self.data_shape;
        let crops = indices
            .into_iter()
            .map(|index| {
                let (y, x) = if self.rand_crop {
                    (rng.gen_range(0..=h - dh), rng.gen_range(0..=w - dw))
                } else {
                    ((h - dh) / 2, (w - dw) / 2)
                };
                let mirror = self.rand_mirror && rng.gen_bool(0.5);
                Crop {
                    index,
                    y,
                    x,
                    mirror,
                }
            })
            .collect();
        Batches {
            iter: self,
            crops,
            offset: 0,
        }
    }
    fn batch(&self, crops: &[Crop]) -> Batch {
        let [c, h, w] = self.data_shape;
        let mut images = Array4::zeros([crops.len(), c, h, w]);
        images
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(crops.par_iter())
            .for_each(|(mut output, crop)| {
                let image = self.images.index_axis(Axis(0), crop.index);
                let image = image.slice(s![.., crop.y..crop.y + h, crop.x..crop.x + w]);
                let image = if crop.mirror {
                    image.slice_move(s![.., .., ..;-1])
                } else {
                    image
                };
                Zip::from(&mut output)
                    .and(&image)
                    .for_each(|y, x| *y = f32::from(*x));
                if let Some(mean) = self.mean.as_ref() {
                    output -= mean;
                }
            });
        let classes = crops.iter().map(|crop| self.classes[crop.index]).collect();
        Batch { images, classes }
    }
}

#[derive(Clone, Copy, Debug)]
struct Crop {
    index: usize,
    y: usize,
    x: usize,
    mirror: bool,
}

/// Batches of an [`ImageIter`].
///
/// See [`ImageIter::batches()`].
pub struct Batches<'a> {
    iter: &'a ImageIter,
    crops: Vec<Crop>,
    offset: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;
    fn next(&mut self) -> Option<Batch> {
        if self.offset >= self.crops.len() {
            return None;
        }
        let end = (self.offset + self.iter.batch_size).min(self.crops.len());
        let batch = self.iter.batch(&self.crops[self.offset..end]);
        self.offset = end;
        Some(batch)
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = (self.crops.len() - self.offset).div_ceil(self.iter.batch_size);
        (len, Some(len))
    }
}

impl ExactSizeIterator for Batches<'_> {}

/// The range of samples in part `part_index` of `num_parts`.
fn partition(samples: usize, num_parts: usize, part_index: usize) -> std::ops::Range<usize> {
    let start = samples * part_index / num_parts;
    let end = samples * (part_index + 1) / num_parts;
    start..end
}

fn load_or_compute_mean(
    path: &Path,
    images: ArrayView4<u8>,
    data_shape: [usize; 3],
) -> Result<Array3<f32>> {
    let [c, h, w] = data_shape;
    if path.exists() {
        let bytes = fs::read(path).with_context(|| format!("Unable to read {path:?}!"))?;
        let mut data = vec![0f32; c * h * w];
        ensure!(
            bytes.len() == data.len() * std::mem::size_of::<f32>(),
            Error::Dataset(format!(
                "mean image {path:?} has {} bytes, expected {} for {data_shape:?}",
                bytes.len(),
                data.len() * std::mem::size_of::<f32>()
            ))
        );
        bytemuck::cast_slice_mut::<f32, u8>(&mut data).copy_from_slice(&bytes);
        tracing::info!("Load mean image from {path:?}");
        return Ok(Array3::from_shape_vec([c, h, w], data)?);
    }
    tracing::info!("Compute mean image, saving to {path:?}");
    let mean = compute_mean(images, data_shape)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let data: Vec<f32> = mean.iter().copied().collect();
    fs::write(path, bytemuck::cast_slice::<f32, u8>(&data))
        .with_context(|| format!("Unable to write {path:?}!"))?;
    Ok(mean)
}

/// The mean of the center crops of `images`.
fn compute_mean(images: ArrayView4<u8>, data_shape: [usize; 3]) -> Result<Array3<f32>> {
    let (samples, _, ih, iw) = images.dim();
    ensure!(
        samples > 0,
        Error::Dataset("unable to compute the mean of 0 images".into())
    );
    let [c, h, w] = data_shape;
    let (y, x) = ((ih - h) / 2, (iw - w) / 2);
    let crops = images.slice(s![.., ..c, y..y + h, x..x + w]);
    let sum = crops
        .axis_iter(Axis(0))
        .into_par_iter()
        .fold(
            || Array3::<f64>::zeros([c, h, w]),
            |mut sum, image| {
                Zip::from(&mut sum)
                    .and(&image)
                    .for_each(|sum, x| *sum += f64::from(*x));
                sum
            },
        )
        .reduce(|| Array3::zeros([c, h, w]), |a, b| a + b);
    Ok(sum.mapv(|x| (x / samples as f64) as f32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array;
    use rand::{rngs::StdRng, SeedableRng};

    fn images(samples: usize) -> (ArcArray<u8, Ix4>, ArcArray1<u8>) {
        let images = Array::from_shape_fn([samples, 3, 4, 4], |(n, c, y, x)| {
            (n * 64 + c * 16 + y * 4 + x) as u8
        });
        let classes = Array::from_shape_fn(samples, |n| (n % 10) as u8);
        (images.into_shared(), classes.into_shared())
    }

    #[test]
    fn partition_covers_samples() {
        let parts: Vec<_> = (0..3).map(|i| partition(10, 3, i)).collect();
        assert_eq!(parts, [0..3, 3..6, 6..10]);
        assert_eq!(partition(10, 1, 0), 0..10);
    }

    #[test]
    fn batches_with_remainder() -> Result<()> {
        let (images, classes) = images(5);
        let iter = ImageIter::builder(images, classes).batch_size(2).build()?;
        assert_eq!(iter.len(), 3);
        let mut rng = StdRng::seed_from_u64(0);
        let batches: Vec<_> = iter.batches(&mut rng).collect();
        let lens: Vec<_> = batches.iter().map(Batch::len).collect();
        assert_eq!(lens, [2, 2, 1]);
        assert_eq!(batches[2].classes, [4]);
        assert_eq!(batches[0].images.dim(), (2, 3, 4, 4));
        Ok(())
    }

    #[test]
    fn center_crop() -> Result<()> {
        let (images, classes) = images(1);
        let iter = ImageIter::builder(images, classes)
            .data_shape([3, 2, 2])
            .build()?;
        let batch = iter.batches(&mut StdRng::seed_from_u64(0)).next().unwrap();
        // rows 1..3, cols 1..3 of the first channel
        let expected = [[5., 6.], [9., 10.]];
        for (y, row) in expected.iter().enumerate() {
            for (x, value) in row.iter().enumerate() {
                assert_eq!(batch.images[[0, 0, y, x]], *value);
            }
        }
        Ok(())
    }

    #[test]
    fn rand_crop_and_mirror_stay_in_bounds() -> Result<()> {
        let (images, classes) = images(8);
        let iter = ImageIter::builder(images.clone(), classes)
            .data_shape([3, 3, 3])
            .rand_crop(true)
            .rand_mirror(true)
            .shuffle(true)
            .batch_size(8)
            .build()?;
        let batch = iter.batches(&mut StdRng::seed_from_u64(7)).next().unwrap();
        let mut classes = batch.classes.clone();
        classes.sort_unstable();
        assert_eq!(classes, [0, 1, 2, 3, 4, 5, 6, 7]);
        for (image, class) in batch.images.outer_iter().zip(batch.classes.iter()) {
            let source = images.index_axis(Axis(0), *class as usize);
            assert!(image
                .iter()
                .all(|x| source.iter().any(|s| f32::from(*s) == *x)));
        }
        Ok(())
    }

    #[test]
    fn mean_image_is_saved_and_reloaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mean.bin");
        let (images, classes) = images(4);
        let train = ImageIter::builder(images.clone(), classes.clone())
            .mean_img(&path)
            .build()?;
        assert!(path.exists());
        let mean = train.mean().unwrap();
        // pixel (0, 0, 0) is n * 64 for n in 0..4
        assert_relative_eq!(mean[[0, 0, 0]], 96.);
        let val = ImageIter::builder(images, classes)
            .mean_img(&path)
            .build()?;
        assert_eq!(val.mean(), train.mean());
        let batch = val.batches(&mut StdRng::seed_from_u64(0)).next().unwrap();
        assert_relative_eq!(batch.images[[0, 0, 0, 0]], -96.);
        Ok(())
    }

    #[test]
    fn mean_image_wrong_shape() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mean.bin");
        fs::write(&path, [0u8; 12])?;
        let (images, classes) = images(2);
        let err = ImageIter::builder(images, classes)
            .mean_img(&path)
            .build()
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Dataset(_))));
        Ok(())
    }

    #[test]
    fn invalid_part_index() {
        let (images, classes) = images(2);
        let err = ImageIter::builder(images, classes)
            .num_parts(2)
            .part_index(2)
            .build()
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    }

    #[test]
    fn partitioned_parts() -> Result<()> {
        let (images, classes) = images(5);
        let iter = ImageIter::builder(images, classes)
            .num_parts(2)
            .part_index(1)
            .build()?;
        assert_eq!(iter.samples(), 3);
        let batch = iter.batches(&mut StdRng::seed_from_u64(0)).next().unwrap();
        assert_eq!(batch.classes, [2, 3, 4]);
        Ok(())
    }
}
