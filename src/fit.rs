use crate::{
    dataset::iter::{Batch, ImageIter},
    error::Error,
    kvstore::KvStore,
    lr_scheduler::FactorScheduler,
    metric::{BatchEndCallback, BatchEndParam, CompositeEvalMetric},
    network::{Inception, InceptionConfig},
    result::Result,
};
use anyhow::anyhow;
use burn::{
    grad_clipping::GradientClippingConfig,
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig,
    },
    prelude::*,
    tensor::{activation::softmax, backend::AutodiffBackend, ElementConversion, TensorData},
};
use ndarray::{s, Array2, ArrayView4, Axis};
use num_format::{Locale, ToFormattedString};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Training configuration.
#[derive(Config, Debug)]
pub struct FitConfig {
    /// The number of epochs, training stops when the epoch reaches this value.
    pub num_epochs: usize,
    /// The initial learning rate.
    #[config(default = 0.05)]
    pub learning_rate: f64,
    /// SGD momentum.
    #[config(default = 0.9)]
    pub momentum: f64,
    /// L2 regularization.
    #[config(default = 1e-5)]
    pub weight_decay: f32,
    /// Clip gradients to \[-clip_gradient, clip_gradient\].
    pub clip_gradient: Option<f32>,
    /// The first epoch, when resuming from a checkpoint.
    #[config(default = 0)]
    pub begin_epoch: usize,
    /// Optional learning rate schedule.
    pub lr_scheduler: Option<FactorScheduler>,
    /// Seeds shuffling, augmentation and initialization.
    pub seed: Option<u64>,
}

impl FitConfig {
    fn optimizer(&self) -> SgdConfig {
        SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(self.momentum)
                    .with_dampening(0.),
            ))
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay)))
            .with_gradient_clipping(self.clip_gradient.map(GradientClippingConfig::Value))
    }
    /// The learning rate schedule and the number of updates before `begin_epoch`.
    ///
    /// The count continues from the updates of the previous epochs, so a resumed run picks up
    /// the decayed rate.
    fn scheduler(&self, batches_per_epoch: usize) -> (Option<FactorScheduler>, usize) {
        let scheduler = self
            .lr_scheduler
            .clone()
            .map(|scheduler| scheduler.with_base_lr(self.learning_rate));
        (scheduler, self.begin_epoch * batches_per_epoch)
    }
}

/// Called at the end of every epoch, ie to save a checkpoint.
pub trait EpochEndCallback<B: Backend> {
    /// Invokes the callback with the index of the epoch that finished.
    fn call(&mut self, epoch: usize, model: &Inception<B>) -> Result<()>;
}

/// Training / validation statistics.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    loss: Option<f32>,
    metrics: Vec<(String, f64)>,
}

impl Stats {
    /// The number of samples.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The mean loss, if computed.
    pub fn loss(&self) -> Option<f32> {
        self.loss
    }
    /// The metric values, by name.
    pub fn metrics(&self) -> &[(String, f64)] {
        &self.metrics
    }
    /// The value of the metric `name`.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| *value)
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    train: Stats,
    val: Option<Stats>,
}

impl Summary {
    /// The number of completed epochs, including those before resuming.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// The time of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// The total time of the epochs run by this trainer.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// The training stats of the last epoch.
    pub fn train(&self) -> &Stats {
        &self.train
    }
    /// The validation stats of the last epoch.
    pub fn val(&self) -> Option<&Stats> {
        self.val.as_ref()
    }
    fn push_epoch(&mut self, epoch_time: Duration, train: Stats, val: Option<Stats>) {
        self.epoch_time = epoch_time;
        self.total_time += epoch_time;
        self.epoch += 1;
        self.train = train;
        self.val = val;
    }
}

/// Trains an [`Inception`] network with SGD.
pub struct Trainer<'a, B: AutodiffBackend> {
    config: FitConfig,
    network: InceptionConfig,
    devices: Vec<B::Device>,
    kvstore: Option<KvStore>,
    eval_metric: CompositeEvalMetric,
    batch_end_callbacks: Vec<Box<dyn BatchEndCallback + 'a>>,
    epoch_end_callbacks: Vec<Box<dyn EpochEndCallback<B> + 'a>>,
    summary: Summary,
}

impl<'a, B: AutodiffBackend> Trainer<'a, B> {
    /// Creates a trainer on `devices`.
    ///
    /// Batches are split evenly across the devices, the first device holds the model.
    ///
    /// **Errors**
    /// Returns [`Error::Config`] if `devices` is empty.
    pub fn new(config: FitConfig, devices: Vec<B::Device>) -> Result<Self, Error> {
        if devices.is_empty() {
            return Err(Error::Config("at least one device is required".into()));
        }
        let summary = Summary {
            epoch: config.begin_epoch,
            ..Summary::default()
        };
        Ok(Self {
            config,
            network: InceptionConfig::new(),
            devices,
            kvstore: None,
            eval_metric: CompositeEvalMetric::default_set(),
            batch_end_callbacks: Vec::new(),
            epoch_end_callbacks: Vec::new(),
            summary,
        })
    }
    /// The config of the trained network, used to replicate it on the other devices.
    ///
    /// Defaults to [`InceptionConfig::new()`].
    pub fn with_network(mut self, network: InceptionConfig) -> Self {
        self.network = network;
        self
    }
    /// Aggregates gradients with `kvstore` when training on multiple devices.
    ///
    /// Without a store, only the first device is used.
    pub fn with_kvstore(mut self, kvstore: Option<KvStore>) -> Self {
        self.kvstore = kvstore;
        self
    }
    /// Replaces the metrics, defaults to [`CompositeEvalMetric::default_set()`].
    pub fn with_eval_metric(mut self, eval_metric: CompositeEvalMetric) -> Self {
        self.eval_metric = eval_metric;
        self
    }
    /// Adds a callback invoked after every batch.
    pub fn with_batch_end_callback(mut self, callback: impl BatchEndCallback + 'a) -> Self {
        self.batch_end_callbacks.push(Box::new(callback));
        self
    }
    /// Adds a callback invoked after every epoch.
    pub fn with_epoch_end_callback(mut self, callback: impl EpochEndCallback<B> + 'a) -> Self {
        self.epoch_end_callbacks.push(Box::new(callback));
        self
    }
    /// The summary of training so far.
    pub fn summary(&self) -> &Summary {
        &self.summary
    }
    fn devices(&self) -> &[B::Device] {
        match self.kvstore.as_ref() {
            Some(kvstore) if kvstore.is_needed(self.devices.len()) => &self.devices,
            _ => &self.devices[..1],
        }
    }
    /// Trains `model` from `begin_epoch` to `num_epochs`, evaluating on `val` after each epoch.
    ///
    /// Returns the trained model.
    pub fn fit(
        &mut self,
        model: Inception<B>,
        train: &ImageIter,
        val: Option<&ImageIter>,
    ) -> Result<Inception<B>> {
        let device = self.devices[0].clone();
        let mut rng = match self.config.seed {
            Some(seed) => {
                B::seed(seed);
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_entropy(),
        };
        let mut model = model.fork(&device);
        tracing::info!(
            "Training {} parameters on {} device(s)",
            model.num_params().to_formatted_string(&Locale::en),
            self.devices().len(),
        );
        let mut optim = self.config.optimizer().init::<B, Inception<B>>();
        let (mut scheduler, mut num_update) = self.config.scheduler(train.len());
        for epoch in self.config.begin_epoch..self.config.num_epochs {
            let start = Instant::now();
            self.eval_metric.reset();
            let mut count = 0;
            let mut total_loss = 0f32;
            for (nbatch, batch) in train.batches(&mut rng).enumerate() {
                num_update += 1;
                let lr = match scheduler.as_mut() {
                    Some(scheduler) => scheduler.call(num_update),
                    None => self.config.learning_rate,
                };
                let (grads, probabilities, loss) = self.forward_backward(&model, &batch)?;
                model = optim.step(lr, model, grads);
                self.eval_metric
                    .update(&batch.classes, probabilities.view());
                count += batch.len();
                total_loss += loss * batch.len() as f32;
                let param = BatchEndParam {
                    epoch,
                    nbatch: nbatch + 1,
                    eval_metric: &self.eval_metric,
                };
                for callback in self.batch_end_callbacks.iter_mut() {
                    callback.call(&param);
                }
            }
            let train_stats = Stats {
                count,
                loss: (count > 0).then(|| total_loss / count as f32),
                metrics: self.eval_metric.get_name_value(),
            };
            for (name, value) in train_stats.metrics.iter() {
                tracing::info!("Epoch[{epoch}] Train-{name}={value:.6}");
            }
            let epoch_time = start.elapsed();
            tracing::info!("Epoch[{epoch}] Time cost={:.3}", epoch_time.as_secs_f64());
            let val_stats = if let Some(val) = val {
                let stats = evaluate(&model.valid(), val, &device, &mut rng)?;
                for (name, value) in stats.metrics.iter() {
                    tracing::info!("Epoch[{epoch}] Validation-{name}={value:.6}");
                }
                Some(stats)
            } else {
                None
            };
            self.summary.push_epoch(epoch_time, train_stats, val_stats);
            for callback in self.epoch_end_callbacks.iter_mut() {
                callback.call(epoch, &model)?;
            }
        }
        Ok(model)
    }
    /// Returns the gradients, the probabilities and the mean loss of `batch`.
    fn forward_backward(
        &self,
        model: &Inception<B>,
        batch: &Batch,
    ) -> Result<(GradientsParams, Array2<f32>, f32)> {
        let devices = self.devices();
        let Some(kvstore) = self.kvstore.as_ref().filter(|_| devices.len() > 1) else {
            return shard_forward_backward(
                model,
                &devices[0],
                batch.images.view(),
                &batch.classes,
                1.,
            );
        };
        let batch_size = batch.len();
        let shards: Vec<_> = split_input_slice(batch_size, devices.len())
            .into_iter()
            .zip(devices)
            .filter(|(range, _)| !range.is_empty())
            .enumerate()
            .map(|(i, (range, device))| {
                // Clones share the batch norm running state, replicas must not.
                let model = if i == 0 {
                    model.clone()
                } else {
                    self.network
                        .init::<B>(device)
                        .load_record(model.clone().into_record())
                };
                (range, device.clone(), model)
            })
            .collect();
        let outputs = shards
            .into_par_iter()
            .map(|(range, device, model)| {
                let weight = range.len() as f32 / batch_size as f32;
                let images = batch.images.slice(s![range.clone(), .., .., ..]);
                let (grads, probabilities, loss) =
                    shard_forward_backward(&model, &device, images, &batch.classes[range], weight)?;
                Ok((grads, probabilities, loss * weight))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut probabilities = Vec::with_capacity(outputs.len());
        let mut grads = Vec::with_capacity(outputs.len());
        let mut loss = 0.;
        for (g, p, l) in outputs {
            grads.push(g);
            probabilities.push(p);
            loss += l;
        }
        let grads = kvstore.aggregate(model, grads, &devices[0]);
        let views: Vec<_> = probabilities.iter().map(|p| p.view()).collect();
        let probabilities = ndarray::concatenate(Axis(0), &views)?;
        Ok((grads, probabilities, loss))
    }
}

/// Splits `batch_size` into `num_slices` contiguous ranges of near equal size.
fn split_input_slice(batch_size: usize, num_slices: usize) -> Vec<std::ops::Range<usize>> {
    let step = batch_size.div_ceil(num_slices);
    (0..num_slices)
        .map(|i| (i * step).min(batch_size)..((i + 1) * step).min(batch_size))
        .collect()
}

fn images_to_tensor<B: Backend>(images: ArrayView4<f32>, device: &B::Device) -> Tensor<B, 4> {
    let shape = images.shape().to_vec();
    let data: Vec<f32> = images.iter().copied().collect();
    Tensor::from_data(TensorData::new(data, shape), device)
}

fn classes_to_tensor<B: Backend>(classes: &[u8], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = classes.iter().map(|&c| i64::from(c)).collect();
    Tensor::from_data(TensorData::new(data, [classes.len()]), device)
}

fn probabilities_to_host<B: Backend>(logits: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [batch_size, num_classes] = logits.dims();
    let data = softmax(logits, 1)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("{e:?}"))?;
    Ok(Array2::from_shape_vec([batch_size, num_classes], data)?)
}

/// Forward and backward on a single device.
///
/// The loss is scaled by `weight` before the backward pass, so that the sum of the gradients of
/// all shards is the gradient of the mean loss over the batch. Returns the unscaled loss.
fn shard_forward_backward<B: AutodiffBackend>(
    model: &Inception<B>,
    device: &B::Device,
    images: ArrayView4<f32>,
    classes: &[u8],
    weight: f32,
) -> Result<(GradientsParams, Array2<f32>, f32)> {
    let x = images_to_tensor::<B>(images, device);
    let t = classes_to_tensor::<B>(classes, device);
    let logits = model.forward(x);
    let loss = CrossEntropyLossConfig::new()
        .init(device)
        .forward(logits.clone(), t);
    let loss_value = loss.clone().into_scalar().elem::<f32>();
    let grads = loss.mul_scalar(weight).backward();
    let grads = GradientsParams::from_grads(grads, model);
    let probabilities = probabilities_to_host(logits.detach())?;
    Ok((grads, probabilities, loss_value))
}

/// Evaluates `model` on `iter` with [`CompositeEvalMetric::default_set()`].
pub fn evaluate<B: Backend, R: Rng>(
    model: &Inception<B>,
    iter: &ImageIter,
    device: &B::Device,
    rng: &mut R,
) -> Result<Stats> {
    let mut eval_metric = CompositeEvalMetric::default_set();
    let mut count = 0;
    let mut total_loss = 0f32;
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    for batch in iter.batches(rng) {
        let x = images_to_tensor::<B>(batch.images.view(), device);
        let t = classes_to_tensor::<B>(&batch.classes, device);
        let logits = model.forward(x);
        let loss = loss_fn
            .forward(logits.clone(), t)
            .into_scalar()
            .elem::<f32>();
        let probabilities = probabilities_to_host(logits)?;
        eval_metric.update(&batch.classes, probabilities.view());
        count += batch.len();
        total_loss += loss * batch.len() as f32;
    }
    Ok(Stats {
        count,
        loss: (count > 0).then(|| total_loss / count as f32),
        metrics: eval_metric.get_name_value(),
    })
}
