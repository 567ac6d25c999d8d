use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Magnitude of the Xavier ("in") initialization, weights are drawn from
/// U(-a, a) with a = sqrt(3 * magnitude / fan_in).
pub const XAVIER_MAGNITUDE: f64 = 2.34;

pub(crate) fn xavier() -> Initializer {
    Initializer::KaimingUniform {
        gain: XAVIER_MAGNITUDE.sqrt(),
        fan_out_only: false,
    }
}

/// Convolution + BatchNorm + ReLU.
#[derive(Module, Debug)]
pub struct ConvFactory<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    activation: Relu,
}

/// [`ConvFactory`] config.
#[derive(Config, Debug)]
pub struct ConvFactoryConfig {
    /// \[inputs, num_filter\].
    pub channels: [usize; 2],
    /// The kernel size.
    pub kernel: [usize; 2],
    /// The stride.
    #[config(default = "[1, 1]")]
    pub stride: [usize; 2],
    /// Zero padding on each side.
    #[config(default = "[0, 0]")]
    pub pad: [usize; 2],
    /// Keep the BatchNorm scale fixed at 1.
    #[config(default = true)]
    pub fix_gamma: bool,
}

impl ConvFactoryConfig {
    /// The number of output channels.
    pub fn outputs(&self) -> usize {
        self.channels[1]
    }
    /// Initializes the layer on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvFactory<B> {
        // The convolution bias is redundant with the BatchNorm shift.
        let conv = Conv2dConfig::new(self.channels, self.kernel)
            .with_stride(self.stride)
            .with_padding(PaddingConfig2d::Explicit(self.pad[0], self.pad[1]))
            .with_bias(false)
            .with_initializer(xavier())
            .init(device);
        let mut bn: BatchNorm<B, 2> = BatchNormConfig::new(self.outputs())
            .with_epsilon(1e-3)
            .with_momentum(0.1)
            .init(device);
        if self.fix_gamma {
            bn.gamma = bn.gamma.set_require_grad(false);
        }
        ConvFactory {
            conv,
            bn,
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> ConvFactory<B> {
    /// \[batch, inputs, h, w\] -> \[batch, num_filter, h', w'\].
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.bn.forward(x);
        self.activation.forward(x)
    }
}

/// Concatenation of a 1x1 and a 3x3 [`ConvFactory`].
#[derive(Module, Debug)]
pub struct SimpleFactory<B: Backend> {
    conv1x1: ConvFactory<B>,
    conv3x3: ConvFactory<B>,
}

/// [`SimpleFactory`] config.
#[derive(Config, Debug)]
pub struct SimpleFactoryConfig {
    /// Input channels.
    pub inputs: usize,
    /// Filters of the 1x1 branch.
    pub ch_1x1: usize,
    /// Filters of the 3x3 branch.
    pub ch_3x3: usize,
}

impl SimpleFactoryConfig {
    /// The number of output channels, `ch_1x1 + ch_3x3`.
    pub fn outputs(&self) -> usize {
        self.ch_1x1 + self.ch_3x3
    }
    /// Initializes the layer on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SimpleFactory<B> {
        SimpleFactory {
            conv1x1: ConvFactoryConfig::new([self.inputs, self.ch_1x1], [1, 1]).init(device),
            conv3x3: ConvFactoryConfig::new([self.inputs, self.ch_3x3], [3, 3])
                .with_pad([1, 1])
                .init(device),
        }
    }
}

impl<B: Backend> SimpleFactory<B> {
    /// Preserves the spatial size.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let conv1x1 = self.conv1x1.forward(input.clone());
        let conv3x3 = self.conv3x3.forward(input);
        Tensor::cat(vec![conv1x1, conv3x3], 1)
    }
}

/// Concatenation of a strided 3x3 [`ConvFactory`] and a strided 3x3 max pool.
#[derive(Module, Debug)]
pub struct DownsampleFactory<B: Backend> {
    conv: ConvFactory<B>,
    pool: MaxPool2d,
}

/// [`DownsampleFactory`] config.
#[derive(Config, Debug)]
pub struct DownsampleFactoryConfig {
    /// Input channels.
    pub inputs: usize,
    /// Filters of the convolution.
    pub ch_3x3: usize,
}

impl DownsampleFactoryConfig {
    /// The number of output channels, `ch_3x3 + inputs`.
    pub fn outputs(&self) -> usize {
        self.ch_3x3 + self.inputs
    }
    /// Initializes the layer on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DownsampleFactory<B> {
        let conv = ConvFactoryConfig::new([self.inputs, self.ch_3x3], [3, 3])
            .with_stride([2, 2])
            .with_pad([1, 1])
            .init(device);
        // Padding matches the output size of the convolution, ie ceil((h - 3) / 2) + 1.
        let pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();
        DownsampleFactory { conv, pool }
    }
}

impl<B: Backend> DownsampleFactory<B> {
    /// Halves the spatial size (rounding up).
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let conv = self.conv.forward(input.clone());
        let pool = self.pool.forward(input);
        Tensor::cat(vec![conv, pool], 1)
    }
}
