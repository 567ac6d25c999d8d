#[cfg(not(all(feature = "ndarray", feature = "wgpu")))]
use anyhow::bail;
#[cfg(feature = "ndarray")]
use burn::backend::{ndarray::NdArrayDevice, NdArray};
#[cfg(feature = "wgpu")]
use burn::backend::{wgpu::WgpuDevice, Wgpu};
#[cfg(any(feature = "ndarray", feature = "wgpu"))]
use burn::backend::Autodiff;
use burn::tensor::backend::AutodiffBackend;
use cifar10_inception::{
    checkpoint::{self, DoCheckpoint},
    dataset::{
        cifar10::{Cifar10, CLASS_NAMES},
        iter::ImageIter,
    },
    error::Error,
    fit::{FitConfig, Summary, Trainer},
    kvstore::KvStore,
    logging,
    lr_scheduler::FactorScheduler,
    metric::Speedometer,
    network::{InceptionConfig, IMAGE_SIZE},
    result::Result,
};
use clap::Parser;
use ndarray::{ArcArray, ArcArray1, Ix4};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};

/// Train an Inception network on CIFAR-10.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// The input data directory.
    #[arg(long, default_value = "cifar10/")]
    data_dir: String,
    /// The gpus to be used, ie "0,2,5". Trains on the cpu if not given.
    #[arg(long)]
    gpus: Option<String>,
    /// The number of training examples.
    #[arg(long, default_value_t = 60_000)]
    num_examples: usize,
    /// The batch size.
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    /// The initial learning rate.
    #[arg(long, default_value_t = 0.05)]
    lr: f64,
    /// Times the lr with a factor for every lr-factor-epoch epoch.
    #[arg(long, default_value_t = 1.)]
    lr_factor: f64,
    /// The number of epochs to factor the lr, could be .5.
    #[arg(long, default_value_t = 1.)]
    lr_factor_epoch: f64,
    /// The prefix of the model to load.
    #[arg(long)]
    model_prefix: Option<String>,
    /// The prefix of the model to save, defaults to the model prefix.
    #[arg(long)]
    save_model_prefix: Option<String>,
    /// The number of training epochs.
    #[arg(long, default_value_t = 20)]
    num_epochs: usize,
    /// Load the model on an epoch using the model prefix.
    #[arg(long)]
    load_epoch: Option<usize>,
    /// The kvstore type.
    #[arg(long, default_value = "local")]
    kv_store: String,
    /// Clip gradients to [-clip_gradient, clip_gradient].
    #[arg(long)]
    clip_gradient: Option<f32>,
    /// Log to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// The directory of the log file.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Seeds shuffling, augmentation and initialization.
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_gpus(gpus: &str) -> Result<Vec<usize>, Error> {
    gpus.split(',')
        .map(|gpu| {
            gpu.trim()
                .parse()
                .map_err(|_| Error::InvalidGpus(gpus.to_string()))
        })
        .collect()
}

/// The training iterator crops and mirrors at random, validation takes the center crop.
///
/// Images are read in order, neither iterator shuffles.
fn iterator(
    images: ArcArray<u8, Ix4>,
    classes: ArcArray1<u8>,
    train: bool,
    args: &Args,
    kv: &KvStore,
    mean_img: &Path,
) -> Result<ImageIter> {
    ImageIter::builder(images, classes)
        .data_shape([3, IMAGE_SIZE, IMAGE_SIZE])
        .batch_size(args.batch_size)
        .mean_img(mean_img)
        .rand_crop(train)
        .rand_mirror(train)
        .num_parts(kv.num_workers())
        .part_index(kv.rank())
        .build()
}

fn iterators(args: &Args, kv: &KvStore) -> Result<(ImageIter, ImageIter)> {
    let data_dir = Path::new(&args.data_dir);
    let cifar10 = Cifar10::builder()
        .path(data_dir)
        .download(true)
        .verbose(true)
        .build()?;
    let mean_img = data_dir.join("mean.bin");
    let train = iterator(
        cifar10.train_images().clone(),
        cifar10.train_classes().clone(),
        true,
        args,
        kv,
        &mean_img,
    )?;
    let val = iterator(
        cifar10.test_images().clone(),
        cifar10.test_classes().clone(),
        false,
        args,
        kv,
        &mean_img,
    )?;
    Ok((train, val))
}

/// A resumed network must predict every class of the dataset.
fn check_num_classes(config: &InceptionConfig) -> Result<(), Error> {
    if config.num_classes != CLASS_NAMES.len() {
        return Err(Error::Checkpoint(format!(
            "the network has {} classes, CIFAR-10 has {}",
            config.num_classes,
            CLASS_NAMES.len()
        )));
    }
    Ok(())
}

fn fit<B: AutodiffBackend>(args: &Args, kv: KvStore, devices: Vec<B::Device>) -> Result<Summary> {
    let (train, val) = iterators(args, &kv)?;
    let epoch_size = args.num_examples / args.batch_size.max(1);
    let lr_scheduler = FactorScheduler::from_epochs(args.lr_factor, args.lr_factor_epoch, epoch_size)?;
    let model_prefix = args
        .model_prefix
        .as_deref()
        .map(|prefix| checkpoint::rank_prefix(prefix, kv.rank()));
    let (config, model) = if let Some(load_epoch) = args.load_epoch {
        checkpoint::resume::<B>(model_prefix.as_deref(), load_epoch, &devices[0])?
    } else {
        let config = InceptionConfig::new();
        let model = config.init::<B>(&devices[0]);
        (config, model)
    };
    check_num_classes(&config)?;
    for node in config.symbol() {
        tracing::debug!("{node}");
    }
    let save_model_prefix = args.save_model_prefix.clone().or(model_prefix);
    let fit_config = FitConfig::new(args.num_epochs)
        .with_learning_rate(args.lr)
        .with_clip_gradient(args.clip_gradient)
        .with_begin_epoch(args.load_epoch.unwrap_or(0))
        .with_lr_scheduler(lr_scheduler)
        .with_seed(args.seed);
    let kvstore = if kv.is_needed(devices.len()) {
        Some(kv)
    } else {
        None
    };
    let mut trainer = Trainer::<B>::new(fit_config, devices)?
        .with_network(config.clone())
        .with_kvstore(kvstore)
        .with_batch_end_callback(Speedometer::new(args.batch_size, 50));
    if let Some(prefix) = save_model_prefix {
        trainer = trainer.with_epoch_end_callback(DoCheckpoint::new(prefix, config));
    }
    trainer.fit(model, &train, Some(&val))?;
    Ok(trainer.summary().clone())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let kv = KvStore::create(&args.kv_store)?;
    let _span = logging::init(args.log_file.as_deref(), args.log_dir.as_deref(), kv.rank())?;
    tracing::info!("start with arguments {args:?}");
    let start = Instant::now();
    let summary = if let Some(gpus) = args.gpus.as_deref() {
        let gpus = parse_gpus(gpus)?;
        #[cfg(feature = "wgpu")]
        {
            let devices = gpus.into_iter().map(WgpuDevice::DiscreteGpu).collect();
            fit::<Autodiff<Wgpu>>(&args, kv, devices)?
        }
        #[cfg(not(feature = "wgpu"))]
        {
            bail!("training on gpus {gpus:?} requires the wgpu feature");
        }
    } else {
        #[cfg(feature = "ndarray")]
        {
            fit::<Autodiff<NdArray>>(&args, kv, vec![NdArrayDevice::Cpu])?
        }
        #[cfg(not(feature = "ndarray"))]
        {
            bail!("training on the cpu requires the ndarray feature");
        }
    };
    tracing::debug!("{summary:#?}");
    println!("Training time: {:.4}", start.elapsed().as_secs_f64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn verify_args() {
        Args::command().debug_assert();
    }

    #[test]
    fn default_args() {
        let args = Args::parse_from(["cifar10-inception"]);
        assert_eq!(args.data_dir, "cifar10/");
        assert!(args.gpus.is_none());
        assert_eq!(args.num_examples, 60_000);
        assert_eq!(args.batch_size, 128);
        assert_eq!(args.lr, 0.05);
        assert_eq!(args.lr_factor, 1.);
        assert_eq!(args.lr_factor_epoch, 1.);
        assert_eq!(args.num_epochs, 20);
        assert!(args.load_epoch.is_none());
        assert_eq!(args.kv_store, "local");
        assert!(args.clip_gradient.is_none());
    }

    #[test]
    fn num_classes() {
        assert!(check_num_classes(&InceptionConfig::new()).is_ok());
        assert!(matches!(
            check_num_classes(&InceptionConfig::new().with_num_classes(4)),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn iterators_keep_order() {
        let dir = tempfile::tempdir().unwrap();
        let mean_img = dir.path().join("mean.bin");
        let args = Args::parse_from(["cifar10-inception", "--batch-size", "4"]);
        let kv = KvStore::create("local").unwrap();
        let images = ArcArray::from_shape_fn([10, 3, 32, 32], |(n, c, h, w)| (n + c + h + w) as u8);
        let classes: ArcArray1<u8> = (0..10u8).collect();
        let mut rng = StdRng::seed_from_u64(0);
        for train in [true, false] {
            let iter = iterator(
                images.clone(),
                classes.clone(),
                train,
                &args,
                &kv,
                &mean_img,
            )
            .unwrap();
            assert_eq!(iter.len(), 3);
            assert_eq!(iter.data_shape(), [3, IMAGE_SIZE, IMAGE_SIZE]);
            let order: Vec<u8> = iter
                .batches(&mut rng)
                .flat_map(|batch| batch.classes)
                .collect();
            assert_eq!(order, classes.to_vec());
        }
        assert!(mean_img.exists());
    }

    #[test]
    fn gpus() {
        assert_eq!(parse_gpus("0").unwrap(), [0]);
        assert_eq!(parse_gpus("0, 2,5").unwrap(), [0, 2, 5]);
        assert!(matches!(parse_gpus("0,x"), Err(Error::InvalidGpus(_))));
    }
}
