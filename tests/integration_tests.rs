use burn::tensor::{backend::AutodiffBackend, Tensor};
use cifar10_inception::{
    checkpoint::{self, DoCheckpoint},
    dataset::iter::ImageIter,
    fit::{FitConfig, Trainer},
    kvstore::KvStore,
    metric::{BatchEndCallback, BatchEndParam},
    network::{InceptionConfig, IMAGE_SIZE},
    result::Result,
};
use libtest_mimic::{Arguments, Trial};
use ndarray::{Array1, Array4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cell::Cell;

fn main() {
    let args = Arguments::from_args();
    let mut tests = Vec::new();
    #[cfg(feature = "ndarray")]
    {
        use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
        tests.extend(backend_tests::<Autodiff<NdArray>>(
            "ndarray",
            vec![NdArrayDevice::Cpu, NdArrayDevice::Cpu],
        ));
    }
    #[cfg(feature = "wgpu")]
    {
        use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
        // Requires an adapter, opt in with CIFAR10_INCEPTION_WGPU=1.
        let enabled = std::env::var("CIFAR10_INCEPTION_WGPU").is_ok();
        tests.extend(
            backend_tests::<Autodiff<Wgpu>>("wgpu", vec![WgpuDevice::default()])
                .into_iter()
                .map(|trial| trial.with_ignored_flag(!enabled)),
        );
    }
    libtest_mimic::run(&args, tests).exit()
}

fn backend_test<B: AutodiffBackend>(
    backend: &str,
    name: &str,
    devices: &[B::Device],
    f: fn(Vec<B::Device>) -> Result<()>,
) -> Trial
where
    B::Device: 'static,
{
    let devices = devices.to_vec();
    Trial::test(format!("{name}_{backend}"), move || {
        f(devices).map_err(|e| format!("{e:?}").into())
    })
}

fn backend_tests<B: AutodiffBackend>(backend: &str, devices: Vec<B::Device>) -> Vec<Trial>
where
    B::Device: 'static,
{
    let mut tests = vec![
        backend_test::<B>(backend, "network_forward", &devices[..1], network_forward::<B>),
        backend_test::<B>(backend, "fit_synthetic", &devices[..1], fit_synthetic::<B>),
        backend_test::<B>(
            backend,
            "checkpoint_resume",
            &devices[..1],
            checkpoint_resume::<B>,
        ),
    ];
    if devices.len() > 1 {
        tests.push(backend_test::<B>(
            backend,
            "fit_multi_device",
            &devices,
            fit_multi_device::<B>,
        ));
    }
    tests
}

fn synthetic(
    samples: usize,
    num_classes: usize,
    batch_size: usize,
    train: bool,
) -> Result<ImageIter> {
    let mut rng = StdRng::seed_from_u64(samples as u64);
    let images = Array4::from_shape_simple_fn([samples, 3, 32, 32], || rng.gen::<u8>());
    let classes = Array1::from_shape_fn(samples, |i| (i % num_classes) as u8);
    ImageIter::builder(images.into_shared(), classes.into_shared())
        .data_shape([3, IMAGE_SIZE, IMAGE_SIZE])
        .batch_size(batch_size)
        .rand_crop(train)
        .rand_mirror(train)
        .shuffle(train)
        .build()
}

fn network_forward<B: AutodiffBackend>(devices: Vec<B::Device>) -> Result<()> {
    let device = &devices[0];
    let model = InceptionConfig::new().init::<B>(device);
    let x = Tensor::<B, 4>::ones([3, 3, IMAGE_SIZE, IMAGE_SIZE], device);
    let y = model.forward(x);
    assert_eq!(y.dims(), [3, 10]);
    Ok(())
}

struct CountBatches<'a>(&'a Cell<usize>);

impl BatchEndCallback for CountBatches<'_> {
    fn call(&mut self, param: &BatchEndParam) {
        assert!(param.nbatch >= 1);
        self.0.set(self.0.get() + 1);
    }
}

fn fit_synthetic<B: AutodiffBackend>(devices: Vec<B::Device>) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let prefix = checkpoint::rank_prefix(&dir.path().join("model").to_string_lossy(), 0);
    let train = synthetic(20, 10, 8, true)?;
    let val = synthetic(10, 10, 8, false)?;
    let config = InceptionConfig::new();
    let model = config.init::<B>(&devices[0]);
    let batches = Cell::new(0);
    let mut trainer = Trainer::<B>::new(
        FitConfig::new(2)
            .with_learning_rate(0.01)
            .with_clip_gradient(Some(10.))
            .with_seed(Some(0)),
        devices,
    )?
    .with_batch_end_callback(CountBatches(&batches))
    .with_epoch_end_callback(DoCheckpoint::new(prefix.clone(), config));
    trainer.fit(model, &train, Some(&val))?;
    let summary = trainer.summary().clone();
    drop(trainer);
    assert_eq!(batches.get(), 2 * 3);
    assert_eq!(summary.epoch(), 2);
    assert_eq!(summary.train().count(), 20);
    assert!(summary.train().loss().unwrap().is_finite());
    let val = summary.val().unwrap();
    assert_eq!(val.count(), 10);
    let accuracy = val.metric("accuracy").unwrap();
    assert!((0. ..=1.).contains(&accuracy));
    assert_eq!(val.metric("top_k_accuracy_20"), Some(1.));
    assert!(dir.path().join("model-0-symbol.json").exists());
    assert!(dir.path().join("model-0-0001.mpk").exists());
    assert!(dir.path().join("model-0-0002.mpk").exists());
    Ok(())
}

fn checkpoint_resume<B: AutodiffBackend>(devices: Vec<B::Device>) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let prefix = checkpoint::rank_prefix(&dir.path().join("model").to_string_lossy(), 0);
    let config = InceptionConfig::new().with_num_classes(4);
    let model = config.init::<B>(&devices[0]);
    checkpoint::save(&prefix, 1, &config, &model)?;
    let (config, model) = checkpoint::resume::<B>(Some(&prefix), 1, &devices[0])?;
    assert_eq!(config.num_classes, 4);
    let train = synthetic(8, 4, 8, true)?;
    let mut trainer = Trainer::<B>::new(
        FitConfig::new(2).with_begin_epoch(1).with_seed(Some(1)),
        devices,
    )?
    .with_network(config.clone())
    .with_epoch_end_callback(DoCheckpoint::new(prefix.clone(), config));
    trainer.fit(model, &train, None)?;
    assert_eq!(trainer.summary().epoch(), 2);
    assert!(trainer.summary().val().is_none());
    assert!(dir.path().join("model-0-0002.mpk").exists());
    Ok(())
}

fn fit_multi_device<B: AutodiffBackend>(devices: Vec<B::Device>) -> Result<()> {
    let train = synthetic(12, 10, 6, true)?;
    let model = InceptionConfig::new().init::<B>(&devices[0]);
    let mut trainer = Trainer::<B>::new(FitConfig::new(1).with_seed(Some(2)), devices)?
        .with_kvstore(Some(KvStore::create("local")?));
    trainer.fit(model, &train, None)?;
    assert_eq!(trainer.summary().train().count(), 12);
    assert!(trainer.summary().train().loss().unwrap().is_finite());
    Ok(())
}
