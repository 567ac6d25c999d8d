/*!
Evaluation metrics and batch callbacks.

Metrics are computed on the host from the predicted probabilities, with shape \[batch_size, num_classes\].
*/
use crate::{error::Error, result::Result};
use ndarray::{ArrayView1, ArrayView2, Axis};
use std::time::Instant;

/// A metric accumulated over batches.
pub trait EvalMetric: Send {
    /// The name of the metric.
    fn name(&self) -> String;
    /// Accumulates a batch.
    fn update(&mut self, labels: &[u8], probabilities: ArrayView2<f32>);
    /// Clears the accumulated state.
    fn reset(&mut self);
    /// Returns the name and the value, or NaN if no samples have been seen.
    fn get(&self) -> (String, f64);
}

#[derive(Default, Clone, Copy, Debug)]
struct Counter {
    correct: usize,
    count: usize,
}

impl Counter {
    fn value(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.correct as f64 / self.count as f64
        }
    }
}

fn argmax(probabilities: ArrayView1<f32>) -> usize {
    probabilities
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(i, max), (j, &p)| {
            if p > max {
                (j, p)
            } else {
                (i, max)
            }
        })
        .0
}

/// The fraction of samples where the most probable class is the label.
#[derive(Default, Clone, Debug)]
pub struct Accuracy {
    counter: Counter,
}

impl EvalMetric for Accuracy {
    fn name(&self) -> String {
        "accuracy".into()
    }
    fn update(&mut self, labels: &[u8], probabilities: ArrayView2<f32>) {
        debug_assert_eq!(labels.len(), probabilities.nrows());
        self.counter.correct += labels
            .iter()
            .zip(probabilities.axis_iter(Axis(0)))
            .filter(|(label, p)| argmax(p.view()) == **label as usize)
            .count();
        self.counter.count += labels.len();
    }
    fn reset(&mut self) {
        self.counter = Counter::default();
    }
    fn get(&self) -> (String, f64) {
        (self.name(), self.counter.value())
    }
}

/// The fraction of samples where the label is one of the `top_k` most probable classes.
#[derive(Clone, Debug)]
pub struct TopKAccuracy {
    top_k: usize,
    counter: Counter,
}

impl TopKAccuracy {
    /// Creates a new metric.
    ///
    /// **Errors**
    /// `top_k` must be greater than 1, use [`Accuracy`] for 1.
    pub fn new(top_k: usize) -> Result<Self, Error> {
        if top_k <= 1 {
            return Err(Error::Config(format!(
                "top_k_accuracy requires top_k > 1, found {top_k}"
            )));
        }
        Ok(Self {
            top_k,
            counter: Counter::default(),
        })
    }
    /// The number of classes considered.
    pub fn top_k(&self) -> usize {
        self.top_k
    }
}

impl EvalMetric for TopKAccuracy {
    fn name(&self) -> String {
        format!("top_k_accuracy_{}", self.top_k)
    }
    fn update(&mut self, labels: &[u8], probabilities: ArrayView2<f32>) {
        debug_assert_eq!(labels.len(), probabilities.nrows());
        let top_k = self.top_k;
        self.counter.correct += labels
            .iter()
            .zip(probabilities.axis_iter(Axis(0)))
            .filter(|(label, p)| {
                // labels without a prediction are never correct
                let Some(target) = p.get(**label as usize) else {
                    return false;
                };
                // rank of the label, k >= num_classes always succeeds
                p.iter().filter(|x| *x > target).count() < top_k
            })
            .count();
        self.counter.count += labels.len();
    }
    fn reset(&mut self) {
        self.counter = Counter::default();
    }
    fn get(&self) -> (String, f64) {
        (self.name(), self.counter.value())
    }
}

/// A collection of metrics updated together.
#[derive(Default)]
pub struct CompositeEvalMetric {
    metrics: Vec<Box<dyn EvalMetric>>,
}

impl CompositeEvalMetric {
    /// Creates an empty composite.
    pub fn new() -> Self {
        Self::default()
    }
    /// `accuracy`, `top_k_accuracy_5`, `top_k_accuracy_10` and `top_k_accuracy_20`.
    pub fn default_set() -> Self {
        let mut composite = Self::new().with(Accuracy::default());
        for top_k in [5, 10, 20] {
            // top_k > 1
            composite.add(TopKAccuracy {
                top_k,
                counter: Counter::default(),
            });
        }
        composite
    }
    /// Adds a metric.
    pub fn add(&mut self, metric: impl EvalMetric + 'static) {
        self.metrics.push(Box::new(metric));
    }
    /// Adds a metric.
    pub fn with(mut self, metric: impl EvalMetric + 'static) -> Self {
        self.add(metric);
        self
    }
    /// Updates every metric.
    pub fn update(&mut self, labels: &[u8], probabilities: ArrayView2<f32>) {
        for metric in self.metrics.iter_mut() {
            metric.update(labels, probabilities.view());
        }
    }
    /// Resets every metric.
    pub fn reset(&mut self) {
        for metric in self.metrics.iter_mut() {
            metric.reset();
        }
    }
    /// The names and values of every metric.
    pub fn get_name_value(&self) -> Vec<(String, f64)> {
        self.metrics.iter().map(|metric| metric.get()).collect()
    }
}

/// Passed to [`BatchEndCallback`]s.
pub struct BatchEndParam<'a> {
    /// The epoch.
    pub epoch: usize,
    /// The number of batches processed in this epoch.
    pub nbatch: usize,
    /// The training metrics.
    pub eval_metric: &'a CompositeEvalMetric,
}

/// Called after every training batch.
pub trait BatchEndCallback {
    /// Invokes the callback.
    fn call(&mut self, param: &BatchEndParam);
}

/// Logs the training speed and metrics every `frequent` batches.
#[derive(Debug)]
pub struct Speedometer {
    batch_size: usize,
    frequent: usize,
    start: Option<Instant>,
    last_count: usize,
}

impl Speedometer {
    /// Creates a new speedometer.
    pub fn new(batch_size: usize, frequent: usize) -> Self {
        Self {
            batch_size,
            frequent: frequent.max(1),
            start: None,
            last_count: 0,
        }
    }
}

impl BatchEndCallback for Speedometer {
    fn call(&mut self, param: &BatchEndParam) {
        let count = param.nbatch;
        if self.last_count > count {
            // new epoch
            self.start = None;
        }
        self.last_count = count;
        let Some(start) = self.start else {
            self.start.replace(Instant::now());
            return;
        };
        if count % self.frequent == 0 {
            let speed =
                (self.frequent * self.batch_size) as f64 / start.elapsed().as_secs_f64();
            for (name, value) in param.eval_metric.get_name_value() {
                tracing::info!(
                    "Epoch[{}] Batch [{count}]\tSpeed: {speed:.2} samples/sec\tTrain-{name}={value:.6}",
                    param.epoch,
                );
            }
            self.start.replace(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn accuracy() {
        let mut metric = Accuracy::default();
        assert!(metric.get().1.is_nan());
        let probabilities = array![[0.1f32, 0.7, 0.2], [0.5, 0.3, 0.2], [0.2, 0.2, 0.6]];
        metric.update(&[1, 1, 2], probabilities.view());
        let (name, value) = metric.get();
        assert_eq!(name, "accuracy");
        assert_relative_eq!(value, 2. / 3.);
        metric.reset();
        assert!(metric.get().1.is_nan());
    }

    #[test]
    fn top_k_accuracy() {
        assert!(TopKAccuracy::new(1).is_err());
        let mut metric = TopKAccuracy::new(2).unwrap();
        assert_eq!(metric.name(), "top_k_accuracy_2");
        let probabilities = array![
            [0.1f32, 0.6, 0.2, 0.1],
            [0.4, 0.3, 0.2, 0.1],
            [0.1, 0.2, 0.3, 0.4]
        ];
        metric.update(&[2, 1, 0], probabilities.view());
        assert_relative_eq!(metric.get().1, 2. / 3.);
    }

    #[test]
    fn top_k_larger_than_classes() {
        let mut metric = TopKAccuracy::new(20).unwrap();
        let probabilities = array![[0.9f32, 0.1], [0.8, 0.2]];
        metric.update(&[1, 1], probabilities.view());
        assert_relative_eq!(metric.get().1, 1.);
    }

    #[test]
    fn label_out_of_range() {
        let probabilities = array![[0.6f32, 0.4], [0.3, 0.7]];
        let mut composite = CompositeEvalMetric::default_set();
        composite.update(&[0, 9], probabilities.view());
        for (_, value) in composite.get_name_value() {
            assert_relative_eq!(value, 0.5);
        }
    }

    #[test]
    fn composite() {
        let mut composite = CompositeEvalMetric::default_set();
        let names: Vec<_> = composite
            .get_name_value()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            [
                "accuracy",
                "top_k_accuracy_5",
                "top_k_accuracy_10",
                "top_k_accuracy_20"
            ]
        );
        composite.update(&[0], array![[0.5f32, 0.5]].view());
        for (_, value) in composite.get_name_value() {
            assert_relative_eq!(value, 1.);
        }
    }

    #[test]
    fn speedometer_restarts_each_epoch() {
        let metric = CompositeEvalMetric::default_set();
        let mut speedometer = Speedometer::new(8, 2);
        for nbatch in 1..=4 {
            speedometer.call(&BatchEndParam {
                epoch: 0,
                nbatch,
                eval_metric: &metric,
            });
            assert!(speedometer.start.is_some());
        }
        speedometer.call(&BatchEndParam {
            epoch: 1,
            nbatch: 1,
            eval_metric: &metric,
        });
        assert_eq!(speedometer.last_count, 1);
    }
}
