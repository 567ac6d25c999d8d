/*!
The network is composed of three layer factories:
- [`ConvFactory`]: Convolution + BatchNorm + ReLU.
- [`SimpleFactory`]: a 1x1 and a 3x3 [`ConvFactory`], concatenated along the channels.
- [`DownsampleFactory`]: a strided 3x3 [`ConvFactory`] and a strided max pool, concatenated.

```text
data         3 x 28 x 28
conv1       96 x 28 x 28   ConvFactory 3x3
in3a        64             SimpleFactory(32, 32)
in3b        80             SimpleFactory(32, 48)
in3c       160 x 14 x 14   DownsampleFactory(80)
in4a       160             SimpleFactory(112, 48)
in4b       160             SimpleFactory(96, 64)
in4c       160             SimpleFactory(80, 80)
in4d       144             SimpleFactory(48, 96)
in4e       240 x  7 x  7   DownsampleFactory(96)
in5a       336             SimpleFactory(176, 160)
in5b       336             SimpleFactory(176, 160)
global_pool 336 x 1 x 1    7x7 average pool
flatten1   336
fc1         10
softmax     10
```
*/
use burn::{
    module::Param,
    nn::{
        pool::{AvgPool2d, AvgPool2dConfig},
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::softmax,
};
use serde::Serialize;
use std::fmt::{self, Display};

mod factory;
pub use factory::{
    ConvFactory, ConvFactoryConfig, DownsampleFactory, DownsampleFactoryConfig, SimpleFactory,
    SimpleFactoryConfig, XAVIER_MAGNITUDE,
};

/// The height and width of the network input.
pub const IMAGE_SIZE: usize = 28;

/// The operation of a [`Node`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Op {
    /// The input.
    Variable,
    /// See [`ConvFactory`].
    ConvFactory {
        /// The kernel size.
        kernel: [usize; 2],
        /// The stride.
        stride: [usize; 2],
        /// The padding.
        pad: [usize; 2],
    },
    /// See [`SimpleFactory`].
    SimpleFactory {
        /// Filters of the 1x1 branch.
        ch_1x1: usize,
        /// Filters of the 3x3 branch.
        ch_3x3: usize,
    },
    /// See [`DownsampleFactory`].
    DownsampleFactory {
        /// Filters of the convolution.
        ch_3x3: usize,
    },
    /// Average pooling.
    AvgPool {
        /// The kernel size.
        kernel: [usize; 2],
    },
    /// Flattens to 2 dimensions.
    Flatten,
    /// Dense / fully connected layer.
    FullyConnected,
    /// Softmax, trained with the cross entropy loss.
    SoftmaxOutput,
}

/// A named node of the network, in order of evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Node {
    /// The name.
    pub name: &'static str,
    /// The operation.
    pub op: Op,
    /// The number of output channels (or features).
    pub channels: usize,
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:<12} {:>4} {:?}", self.name, self.channels, self.op)
    }
}

/// The Inception network.
#[derive(Module, Debug)]
pub struct Inception<B: Backend> {
    conv1: ConvFactory<B>,
    in3a: SimpleFactory<B>,
    in3b: SimpleFactory<B>,
    in3c: DownsampleFactory<B>,
    in4a: SimpleFactory<B>,
    in4b: SimpleFactory<B>,
    in4c: SimpleFactory<B>,
    in4d: SimpleFactory<B>,
    in4e: DownsampleFactory<B>,
    in5a: SimpleFactory<B>,
    in5b: SimpleFactory<B>,
    global_pool: AvgPool2d,
    fc1: Linear<B>,
}

/// [`Inception`] config.
///
/// Saved alongside checkpoints so that the network can be reconstructed.
#[derive(Config, Debug)]
pub struct InceptionConfig {
    /// The number of classes.
    #[config(default = 10)]
    pub num_classes: usize,
    /// The number of input channels.
    #[config(default = 3)]
    pub channels: usize,
}

struct Stages {
    conv1: ConvFactoryConfig,
    in3a: SimpleFactoryConfig,
    in3b: SimpleFactoryConfig,
    in3c: DownsampleFactoryConfig,
    in4a: SimpleFactoryConfig,
    in4b: SimpleFactoryConfig,
    in4c: SimpleFactoryConfig,
    in4d: SimpleFactoryConfig,
    in4e: DownsampleFactoryConfig,
    in5a: SimpleFactoryConfig,
    in5b: SimpleFactoryConfig,
    fc1: LinearConfig,
}

impl InceptionConfig {
    fn stages(&self) -> Stages {
        let conv1 = ConvFactoryConfig::new([self.channels, 96], [3, 3]).with_pad([1, 1]);
        let in3a = SimpleFactoryConfig::new(conv1.outputs(), 32, 32);
        let in3b = SimpleFactoryConfig::new(in3a.outputs(), 32, 48);
        let in3c = DownsampleFactoryConfig::new(in3b.outputs(), 80);
        let in4a = SimpleFactoryConfig::new(in3c.outputs(), 112, 48);
        let in4b = SimpleFactoryConfig::new(in4a.outputs(), 96, 64);
        let in4c = SimpleFactoryConfig::new(in4b.outputs(), 80, 80);
        let in4d = SimpleFactoryConfig::new(in4c.outputs(), 48, 96);
        let in4e = DownsampleFactoryConfig::new(in4d.outputs(), 96);
        let in5a = SimpleFactoryConfig::new(in4e.outputs(), 176, 160);
        let in5b = SimpleFactoryConfig::new(in5a.outputs(), 176, 160);
        let fc1 = LinearConfig::new(in5b.outputs(), self.num_classes)
            .with_initializer(factory::xavier());
        Stages {
            conv1,
            in3a,
            in3b,
            in3c,
            in4a,
            in4b,
            in4c,
            in4d,
            in4e,
            in5a,
            in5b,
            fc1,
        }
    }
    /// Initializes the network on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Inception<B> {
        let stages = self.stages();
        let mut fc1 = stages.fc1.init(device);
        // xavier applies to the weights, biases start at 0
        fc1.bias = Some(Param::from_tensor(Tensor::zeros(
            [self.num_classes],
            device,
        )));
        Inception {
            conv1: stages.conv1.init(device),
            in3a: stages.in3a.init(device),
            in3b: stages.in3b.init(device),
            in3c: stages.in3c.init(device),
            in4a: stages.in4a.init(device),
            in4b: stages.in4b.init(device),
            in4c: stages.in4c.init(device),
            in4d: stages.in4d.init(device),
            in4e: stages.in4e.init(device),
            in5a: stages.in5a.init(device),
            in5b: stages.in5b.init(device),
            global_pool: AvgPool2dConfig::new([IMAGE_SIZE / 4; 2]).init(),
            fc1,
        }
    }
    /// Describes the network as a sequence of named nodes.
    pub fn symbol(&self) -> Vec<Node> {
        let stages = self.stages();
        fn simple(name: &'static str, config: &SimpleFactoryConfig) -> Node {
            Node {
                name,
                op: Op::SimpleFactory {
                    ch_1x1: config.ch_1x1,
                    ch_3x3: config.ch_3x3,
                },
                channels: config.outputs(),
            }
        }
        fn downsample(name: &'static str, config: &DownsampleFactoryConfig) -> Node {
            Node {
                name,
                op: Op::DownsampleFactory {
                    ch_3x3: config.ch_3x3,
                },
                channels: config.outputs(),
            }
        }
        let features = stages.in5b.outputs();
        vec![
            Node {
                name: "data",
                op: Op::Variable,
                channels: self.channels,
            },
            Node {
                name: "conv1",
                op: Op::ConvFactory {
                    kernel: stages.conv1.kernel,
                    stride: stages.conv1.stride,
                    pad: stages.conv1.pad,
                },
                channels: stages.conv1.outputs(),
            },
            simple("in3a", &stages.in3a),
            simple("in3b", &stages.in3b),
            downsample("in3c", &stages.in3c),
            simple("in4a", &stages.in4a),
            simple("in4b", &stages.in4b),
            simple("in4c", &stages.in4c),
            simple("in4d", &stages.in4d),
            downsample("in4e", &stages.in4e),
            simple("in5a", &stages.in5a),
            simple("in5b", &stages.in5b),
            Node {
                name: "global_pool",
                op: Op::AvgPool {
                    kernel: [IMAGE_SIZE / 4; 2],
                },
                channels: features,
            },
            Node {
                name: "flatten1",
                op: Op::Flatten,
                channels: features,
            },
            Node {
                name: "fc1",
                op: Op::FullyConnected,
                channels: self.num_classes,
            },
            Node {
                name: "softmax",
                op: Op::SoftmaxOutput,
                channels: self.num_classes,
            },
        ]
    }
}

impl<B: Backend> Inception<B> {
    /// The output of the last inception block.
    ///
    /// \[batch, channels, 28, 28\] -> \[batch, 336, 7, 7\].
    pub fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(images);
        let x = self.in3a.forward(x);
        let x = self.in3b.forward(x);
        let x = self.in3c.forward(x);
        let x = self.in4a.forward(x);
        let x = self.in4b.forward(x);
        let x = self.in4c.forward(x);
        let x = self.in4d.forward(x);
        let x = self.in4e.forward(x);
        let x = self.in5a.forward(x);
        self.in5b.forward(x)
    }
    /// Computes the logits.
    ///
    /// \[batch, channels, 28, 28\] -> \[batch, num_classes\].
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.forward_features(images);
        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);
        self.fc1.forward(x)
    }
    /// Computes the class probabilities.
    pub fn infer(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }
}
