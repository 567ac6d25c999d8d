//! [CIFAR-10](<https://www.cs.toronto.edu/~kriz/cifar.html>) consists of 60_000 32x32 colour
//! images in 10 classes, with 6_000 images per class. There are 50_000 training images and
//! 10_000 test images.
//!
//! The "binary version" of the dataset is used. Each file is a sequence of 3_073 byte records,
//! the first byte is the class and the remaining 3_072 bytes are the red, green and blue
//! channels of the image in row major order.
use crate::{error::Error, result::Result};
use anyhow::{ensure, Context};
use curl::easy::Easy;
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{ArcArray, ArcArray1, Ix4};
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

const URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
const ARCHIVE: &str = "cifar-10-binary.tar.gz";
const TRAIN_BATCHES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_BATCH: &str = "test_batch.bin";
const BATCH_LEN: usize = 10_000;
const IMAGE_LEN: usize = 3 * 32 * 32;
const RECORD_LEN: usize = 1 + IMAGE_LEN;

/// The class names, indexed by class.
pub const CLASS_NAMES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// Cifar10 builder.
pub mod builders {
    use super::{Cifar10, Result};
    use std::path::Path;

    /// Cifar10 builder.
    #[derive(Debug)]
    pub struct Cifar10Builder<'a> {
        pub(super) path: Option<&'a Path>,
        pub(super) download: bool,
        pub(super) verbose: bool,
    }

    impl Default for Cifar10Builder<'_> {
        fn default() -> Self {
            Self {
                path: None,
                download: false,
                verbose: false,
            }
        }
    }

    impl Cifar10Builder<'_> {
        /// The path to load the dataset from.
        ///
        /// This is the folder the files will be downloaded to / loaded from. If not specified, uses
        /// the OS specific "Downloads" directory or the "Temp" directory.
        pub fn path(self, path: &Path) -> Cifar10Builder<'_> {
            Cifar10Builder {
                path: Some(path),
                download: self.download,
                verbose: self.verbose,
            }
        }
        /// Whether to download the data if it is not found. Defaults to false.
        pub fn download(self, download: bool) -> Self {
            Self { download, ..self }
        }
        /// Show a progress bar while downloading. Defaults to false.
        pub fn verbose(self, verbose: bool) -> Self {
            Self { verbose, ..self }
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        /// - The path is a url.
        /// - The download failed.
        /// - The files were not found.
        /// - Unpacking / loading the data failed.
        pub fn build(&self) -> Result<Cifar10> {
            Cifar10::build(self)
        }
    }
}
use builders::Cifar10Builder;

/// The CIFAR-10 dataset.
#[derive(Clone, Debug)]
pub struct Cifar10 {
    train_images: ArcArray<u8, Ix4>,
    train_classes: ArcArray1<u8>,
    test_images: ArcArray<u8, Ix4>,
    test_classes: ArcArray1<u8>,
}

impl Cifar10 {
    /// Returns a [`Cifar10Builder`] used to specify options.
    pub fn builder() -> Cifar10Builder<'static> {
        Cifar10Builder::default()
    }
    fn build(builder: &Cifar10Builder) -> Result<Self> {
        let path = match builder.path {
            Some(path) => {
                if let Some(url) = path.to_str().filter(|path| path.contains("://")) {
                    return Err(Error::RemoteDataDir(url.to_string()).into());
                }
                path.to_owned()
            }
            None => dirs::download_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("cifar10"),
        };
        let missing = TRAIN_BATCHES
            .iter()
            .chain([&TEST_BATCH])
            .any(|name| !path.join(name).exists());
        if missing && builder.download {
            fs::create_dir_all(&path)?;
            let archive = path.join(ARCHIVE);
            download(URL, &archive, builder.verbose)?;
            unpack(&archive, &path)?;
            fs::remove_file(&archive)?;
        }
        let mut train_images = Vec::with_capacity(TRAIN_BATCHES.len() * BATCH_LEN * IMAGE_LEN);
        let mut train_classes = Vec::with_capacity(TRAIN_BATCHES.len() * BATCH_LEN);
        for name in TRAIN_BATCHES.iter() {
            read_batch(
                &path.join(name),
                BATCH_LEN,
                &mut train_images,
                &mut train_classes,
            )?;
        }
        let mut test_images = Vec::with_capacity(BATCH_LEN * IMAGE_LEN);
        let mut test_classes = Vec::with_capacity(BATCH_LEN);
        read_batch(
            &path.join(TEST_BATCH),
            BATCH_LEN,
            &mut test_images,
            &mut test_classes,
        )?;
        let train_len = train_classes.len();
        let test_len = test_classes.len();
        Ok(Self {
            train_images: ArcArray::from_shape_vec([train_len, 3, 32, 32], train_images)?,
            train_classes: ArcArray::from_shape_vec(train_len, train_classes)?,
            test_images: ArcArray::from_shape_vec([test_len, 3, 32, 32], test_images)?,
            test_classes: ArcArray::from_shape_vec(test_len, test_classes)?,
        })
    }
    /// The training images.
    ///
    /// Shape = \[50_000, 3, 32, 32\].
    pub fn train_images(&self) -> &ArcArray<u8, Ix4> {
        &self.train_images
    }
    /// The training classes.
    ///
    /// Shape = \[50_000\].
    ///
    /// The classes range from 0 to 9 inclusive, see [`CLASS_NAMES`].
    pub fn train_classes(&self) -> &ArcArray1<u8> {
        &self.train_classes
    }
    /// The test images.
    ///
    /// Shape = \[10_000, 3, 32, 32\].
    pub fn test_images(&self) -> &ArcArray<u8, Ix4> {
        &self.test_images
    }
    /// The test classes.
    ///
    /// Shape = \[10_000\].
    pub fn test_classes(&self) -> &ArcArray1<u8> {
        &self.test_classes
    }
}

fn download(url: &str, path: &Path, verbose: bool) -> Result<()> {
    let mut file = File::create(path)?;
    let bar = if verbose {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta})",
            )?
            .progress_chars("=> "),
        );
        bar.set_message(format!("Downloading {url}"));
        bar
    } else {
        ProgressBar::hidden()
    };
    let mut easy = Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.progress(true)?;
    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| {
            // Returning a short count aborts the transfer.
            Ok(file.write_all(data).map_or(0, |_| data.len()))
        })?;
        transfer.progress_function(|total, done, _, _| {
            if total > 0. {
                bar.set_length(total as u64);
            }
            bar.set_position(done as u64);
            true
        })?;
        transfer
            .perform()
            .with_context(|| format!("Downloading {url} failed!"))?;
    }
    bar.finish();
    let status = easy.response_code()?;
    if !(200..300).contains(&status) {
        std::mem::drop(file);
        fs::remove_file(path).ok();
        return Err(Error::Download {
            url: url.to_string(),
            status,
        }
        .into());
    }
    file.flush()?;
    Ok(())
}

/// Extracts the batch files from the archive into `dir`.
///
/// The archive stores them under "cifar-10-batches-bin/", they are moved up into `dir`.
fn unpack(archive: &Path, dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name: Option<PathBuf> = entry.path()?.file_name().map(Into::into);
        if let Some(name) = name {
            if entry.header().entry_type().is_file() {
                entry.unpack(dir.join(name))?;
            }
        }
    }
    Ok(())
}

fn read_batch(path: &Path, len: usize, images: &mut Vec<u8>, classes: &mut Vec<u8>) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("Unable to read {path:?}!"))?;
    ensure!(
        data.len() == len * RECORD_LEN,
        Error::Dataset(format!(
            "{path:?} has {} bytes, expected {}",
            data.len(),
            len * RECORD_LEN
        ))
    );
    for record in data.chunks_exact(RECORD_LEN) {
        let class = record[0];
        ensure!(
            (class as usize) < CLASS_NAMES.len(),
            Error::Dataset(format!("{path:?} has invalid class {class}"))
        );
        classes.push(class);
        images.extend_from_slice(&record[1..]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_records(path: &Path, classes: &[u8]) {
        let mut data = Vec::new();
        for (i, class) in classes.iter().copied().enumerate() {
            data.push(class);
            data.extend(std::iter::repeat(i as u8).take(IMAGE_LEN));
        }
        fs::write(path, data).unwrap();
    }

    #[test]
    fn read_batch_records() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("batch.bin");
        write_records(&path, &[3, 9, 0]);
        let mut images = Vec::new();
        let mut classes = Vec::new();
        read_batch(&path, 3, &mut images, &mut classes)?;
        assert_eq!(classes, [3, 9, 0]);
        assert_eq!(images.len(), 3 * IMAGE_LEN);
        assert!(images[IMAGE_LEN..2 * IMAGE_LEN].iter().all(|x| *x == 1));
        Ok(())
    }

    #[test]
    fn read_batch_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.bin");
        write_records(&path, &[1, 2]);
        let err = read_batch(&path, 3, &mut Vec::new(), &mut Vec::new()).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Dataset(_))));
    }

    #[test]
    fn read_batch_invalid_class() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.bin");
        write_records(&path, &[10]);
        let err = read_batch(&path, 1, &mut Vec::new(), &mut Vec::new()).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Dataset(_))));
    }

    #[test]
    fn remote_data_dir() {
        let err = Cifar10::builder()
            .path("s3://bucket/cifar10/".as_ref())
            .build()
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::RemoteDataDir(_))));
    }

    #[test]
    fn missing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Cifar10::builder().path(dir.path()).build().is_err());
    }

    #[test]
    fn unpack_moves_batches_up() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join(ARCHIVE);
        {
            let encoder = flate2::write::GzEncoder::new(
                File::create(&archive)?,
                flate2::Compression::fast(),
            );
            let mut builder = tar::Builder::new(encoder);
            let data = [7u8; RECORD_LEN];
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append_data(
                &mut header,
                "cifar-10-batches-bin/test_batch.bin",
                data.as_ref(),
            )?;
            builder.into_inner()?.finish()?;
        }
        unpack(&archive, dir.path())?;
        let mut images = Vec::new();
        let mut classes = Vec::new();
        read_batch(&dir.path().join(TEST_BATCH), 1, &mut images, &mut classes)?;
        assert_eq!(classes, [7]);
        Ok(())
    }
}
