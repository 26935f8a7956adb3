//! The frozen, pretrained network and its view as an ordered sequence of
//! named feature stages.

use crate::Error;
use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};
use std::path::Path;

/// VGG19 `features` layout, `None` marks a 2x2 max pool
const VGG19_CONFIG: &[Option<usize>] = &[
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
];

/// A single stage of a source network, in the order it is applied.
///
/// Only the first four kinds are feature producing, the rest can appear in a
/// full classifier and are rejected when the network is used for style
/// transfer.
#[derive(Clone, Debug)]
pub enum Layer {
    Conv2d(Conv2d),
    /// `inplace` is carried over from the source network but is never honored,
    /// activations are always computed into a fresh tensor
    Relu {
        inplace: bool,
    },
    MaxPool2d {
        kernel: usize,
        stride: usize,
    },
    BatchNorm2d(BatchNorm),
    AdaptiveAvgPool2d {
        output: usize,
    },
    Flatten,
    Dropout {
        p: f32,
    },
    Linear(Linear),
}

impl Layer {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Conv2d(_) => "Conv2d",
            Self::Relu { .. } => "ReLU",
            Self::MaxPool2d { .. } => "MaxPool2d",
            Self::BatchNorm2d(_) => "BatchNorm2d",
            Self::AdaptiveAvgPool2d { .. } => "AdaptiveAvgPool2d",
            Self::Flatten => "Flatten",
            Self::Dropout { .. } => "Dropout",
            Self::Linear(_) => "Linear",
        }
    }
}

/// The classification of a feature stage
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StageKind {
    Convolution,
    Activation,
    Pooling,
    BatchNorm,
}

impl StageKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Convolution => "conv",
            Self::Activation => "relu",
            Self::Pooling => "pool",
            Self::BatchNorm => "bn",
        }
    }
}

#[derive(Clone, Debug)]
enum StageOp {
    Conv(Conv2d),
    Relu,
    MaxPool { kernel: usize, stride: usize },
    BatchNorm(BatchNorm),
}

fn classify(layer: &Layer) -> Result<(StageKind, StageOp), Error> {
    let classified = match layer {
        Layer::Conv2d(conv) => (StageKind::Convolution, StageOp::Conv(conv.clone())),
        // Always materialized as out-of-place
        Layer::Relu { .. } => (StageKind::Activation, StageOp::Relu),
        Layer::MaxPool2d { kernel, stride } => (
            StageKind::Pooling,
            StageOp::MaxPool {
                kernel: *kernel,
                stride: *stride,
            },
        ),
        Layer::BatchNorm2d(bn) => (StageKind::BatchNorm, StageOp::BatchNorm(bn.clone())),
        other => return Err(Error::UnsupportedLayer(other.type_name().to_owned())),
    };

    Ok(classified)
}

/// A classified, named stage of the network, ready to be placed in a
/// pipeline.
#[derive(Clone, Debug)]
pub struct FeatureStage {
    name: String,
    ordinal: usize,
    kind: StageKind,
    op: StageOp,
}

impl FeatureStage {
    /// The name is `<kind>_<n>`, where `n` is the ordinal of the most recent
    /// convolution, eg. `conv_3` is followed by `relu_3`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordinal of the convolution this stage belongs to
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor, Error> {
        let ys = match &self.op {
            StageOp::Conv(conv) => conv.forward(xs)?,
            StageOp::Relu => xs.relu()?,
            StageOp::MaxPool { kernel, stride } => xs.max_pool2d_with_stride(*kernel, *stride)?,
            StageOp::BatchNorm(bn) => bn.forward_t(xs, false)?,
        };

        Ok(ys)
    }
}

/// A pretrained network, treated as an immutable sequence of layers.
#[derive(Clone, Debug)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    pub fn from_layers(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// Builds the convolutional part of VGG19 from weights laid out the way
    /// torchvision names them, ie. `features.{index}.weight`
    pub fn vgg19(vb: VarBuilder<'_>) -> Result<Self, Error> {
        Self::vgg(vb, false)
    }

    /// Same as [`Network::vgg19`], but with a batch norm after every
    /// convolution
    pub fn vgg19_bn(vb: VarBuilder<'_>) -> Result<Self, Error> {
        Self::vgg(vb, true)
    }

    fn vgg(vb: VarBuilder<'_>, batch_norm: bool) -> Result<Self, Error> {
        let vb = vb.pp("features");
        let mut layers = Vec::new();
        let mut in_channels = 3;

        for block in VGG19_CONFIG {
            match *block {
                None => layers.push(Layer::MaxPool2d {
                    kernel: 2,
                    stride: 2,
                }),
                Some(out_channels) => {
                    let cfg = Conv2dConfig {
                        padding: 1,
                        ..Default::default()
                    };
                    let conv =
                        candle_nn::conv2d(in_channels, out_channels, 3, cfg, vb.pp(layers.len()))?;
                    layers.push(Layer::Conv2d(conv));

                    if batch_norm {
                        let bn = candle_nn::batch_norm(out_channels, 1e-5, vb.pp(layers.len()))?;
                        layers.push(Layer::BatchNorm2d(bn));
                    }

                    layers.push(Layer::Relu { inplace: true });
                    in_channels = out_channels;
                }
            }
        }

        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Classifies and names every layer, failing on the first one that isn't
    /// a feature stage.
    pub fn feature_stages(&self) -> Result<Vec<FeatureStage>, Error> {
        let mut stages = Vec::with_capacity(self.layers.len());
        let mut conv_index = 0;

        for layer in &self.layers {
            let (kind, op) = classify(layer)?;
            if kind == StageKind::Convolution {
                conv_index += 1;
            }

            stages.push(FeatureStage {
                name: format!("{}_{}", kind.prefix(), conv_index),
                ordinal: conv_index,
                kind,
                op,
            });
        }

        Ok(stages)
    }
}

/// Per-channel normalization applied before the first network stage
#[derive(Clone, Debug)]
pub struct Normalization {
    mean: Tensor,
    std: Tensor,
}

impl Normalization {
    /// Creates a normalization from 1-D mean and standard deviation tensors
    pub fn new(mean: &Tensor, std: &Tensor) -> Result<Self, Error> {
        let channels = mean.elem_count();

        Ok(Self {
            mean: mean.reshape((channels, 1, 1))?,
            std: std.reshape((std.elem_count(), 1, 1))?,
        })
    }

    /// The ImageNet statistics the torchvision models were trained with
    pub fn imagenet(device: &Device) -> Result<Self, Error> {
        let mean = Tensor::new(&[0.485f32, 0.456, 0.406], device)?;
        let std = Tensor::new(&[0.229f32, 0.224, 0.225], device)?;
        Self::new(&mean, &std)
    }

    pub fn forward(&self, img: &Tensor) -> Result<Tensor, Error> {
        Ok(img.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?)
    }
}

/// Everything that is loaded once per process and shared by every transfer.
#[derive(Clone, Debug)]
pub struct StyleModel {
    pub network: Network,
    pub normalization: Normalization,
    pub device: Device,
}

impl StyleModel {
    pub fn new(network: Network, normalization: Normalization, device: Device) -> Self {
        Self {
            network,
            normalization,
            device,
        }
    }

    /// Loads VGG19 (or VGG19 with batch norm, detected from the weights) from
    /// a safetensors file, using the ImageNet normalization
    pub fn load<P: AsRef<Path>>(weights: P, device: &Device) -> Result<Self, Error> {
        let weights = weights.as_ref();
        tracing::info!("loading network weights from {}", weights.display());

        // SAFETY: the weights file is memory mapped and must not be modified
        // while the model is alive
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        Self::from_var_builder(vb, device)
    }

    /// Builds VGG19 from torchvision `features.{index}` weights, with batch
    /// norm if the weights have running statistics after the first conv
    pub fn from_var_builder(vb: VarBuilder<'_>, device: &Device) -> Result<Self, Error> {
        let network = if vb.contains_tensor("features.1.running_mean") {
            tracing::info!("weights contain batch norm statistics, using VGG19-BN");
            Network::vgg19_bn(vb)?
        } else {
            Network::vgg19(vb)?
        };

        Ok(Self::new(
            network,
            Normalization::imagenet(device)?,
            device.clone(),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn conv(device: &Device, in_c: usize, out_c: usize) -> Layer {
        let weight = Tensor::randn(0f32, 0.2, (out_c, in_c, 3, 3), device).unwrap();
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Layer::Conv2d(Conv2d::new(weight, None, cfg))
    }

    #[test]
    fn names_follow_conv_ordinal() {
        let dev = Device::Cpu;
        let net = Network::from_layers(vec![
            conv(&dev, 3, 4),
            Layer::Relu { inplace: true },
            conv(&dev, 4, 4),
            Layer::Relu { inplace: true },
            Layer::MaxPool2d {
                kernel: 2,
                stride: 2,
            },
            conv(&dev, 4, 8),
        ]);

        let stages = net.feature_stages().unwrap();
        let names: Vec<_> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            ["conv_1", "relu_1", "conv_2", "relu_2", "pool_2", "conv_3"]
        );
        assert_eq!(stages[4].kind(), StageKind::Pooling);
    }

    #[test]
    fn rejects_classifier_layers() {
        let dev = Device::Cpu;
        let linear = Linear::new(
            Tensor::zeros((10, 4), DType::F32, &dev).unwrap(),
            Some(Tensor::zeros(10, DType::F32, &dev).unwrap()),
        );

        for (layer, expected) in vec![
            (Layer::AdaptiveAvgPool2d { output: 7 }, "AdaptiveAvgPool2d"),
            (Layer::Flatten, "Flatten"),
            (Layer::Dropout { p: 0.5 }, "Dropout"),
            (Layer::Linear(linear), "Linear"),
        ] {
            let net = Network::from_layers(vec![
                conv(&dev, 3, 4),
                Layer::Relu { inplace: false },
                layer,
            ]);

            match net.feature_stages() {
                Err(Error::UnsupportedLayer(name)) => assert_eq!(name, expected),
                other => panic!("expected unsupported layer, got {:?}", other.map(|s| s.len())),
            }
        }
    }

    /// Zeroed weights under the torchvision VGG19 `features` key names
    fn torchvision_weights(batch_norm: bool) -> HashMap<String, Tensor> {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        let mut index = 0;
        let mut in_c = 3;

        for block in VGG19_CONFIG {
            match *block {
                None => index += 1,
                Some(out_c) => {
                    let zeros = |shape: &[usize]| Tensor::zeros(shape, DType::F32, &dev).unwrap();

                    tensors.insert(
                        format!("features.{}.weight", index),
                        zeros(&[out_c, in_c, 3, 3]),
                    );
                    tensors.insert(format!("features.{}.bias", index), zeros(&[out_c]));
                    index += 1;

                    if batch_norm {
                        for name in &["weight", "bias", "running_mean", "running_var"] {
                            tensors.insert(format!("features.{}.{}", index, name), zeros(&[out_c]));
                        }
                        index += 1;
                    }

                    // relu
                    index += 1;
                    in_c = out_c;
                }
            }
        }

        tensors
    }

    #[test]
    fn loads_torchvision_vgg19() {
        let dev = Device::Cpu;
        let vb = VarBuilder::from_tensors(torchvision_weights(false), DType::F32, &dev);
        let model = StyleModel::from_var_builder(vb, &dev).unwrap();

        // 16 convs, each followed by a relu, and 5 pools
        assert_eq!(model.network.layers().len(), 37);
        assert!(!model
            .network
            .layers()
            .iter()
            .any(|l| matches!(l, Layer::BatchNorm2d(_))));

        let stages = model.network.feature_stages().unwrap();
        let names: Vec<_> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(
            &names[..6],
            ["conv_1", "relu_1", "conv_2", "relu_2", "pool_2", "conv_3"]
        );
        assert_eq!(names[names.len() - 1], "pool_16");

        let convs: Vec<_> = stages
            .iter()
            .filter(|s| s.kind() == StageKind::Convolution)
            .map(|s| s.name().to_owned())
            .collect();
        let expected: Vec<_> = (1..=16).map(|i| format!("conv_{}", i)).collect();
        assert_eq!(convs, expected);
    }

    #[test]
    fn detects_batch_norm_weights() {
        let dev = Device::Cpu;
        let vb = VarBuilder::from_tensors(torchvision_weights(true), DType::F32, &dev);
        let model = StyleModel::from_var_builder(vb, &dev).unwrap();

        let layers = model.network.layers();
        assert_eq!(layers.len(), 53);
        assert!(matches!(layers[1], Layer::BatchNorm2d(_)));

        let stages = model.network.feature_stages().unwrap();
        let names: Vec<_> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(
            &names[..7],
            ["conv_1", "bn_1", "relu_1", "conv_2", "bn_2", "relu_2", "pool_2"]
        );
        assert_eq!(
            stages
                .iter()
                .filter(|s| s.kind() == StageKind::BatchNorm)
                .count(),
            16
        );
    }

    #[test]
    fn relu_does_not_touch_input() {
        let dev = Device::Cpu;
        let net = Network::from_layers(vec![Layer::Relu { inplace: true }]);
        let stages = net.feature_stages().unwrap();

        let input = Tensor::new(&[-1f32, 2.0, 3.0, -4.0], &dev)
            .unwrap()
            .reshape((1, 1, 2, 2))
            .unwrap();
        let output = stages[0].forward(&input).unwrap();

        assert_eq!(
            input.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            [-1.0, 2.0, 3.0, -4.0]
        );
        assert_eq!(
            output.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            [0.0, 2.0, 3.0, 0.0]
        );
    }

    #[test]
    fn imagenet_normalization() {
        let dev = Device::Cpu;
        let norm = Normalization::imagenet(&dev).unwrap();
        let img = Tensor::ones((1, 3, 2, 2), DType::F32, &dev).unwrap();
        let normed = norm.forward(&img).unwrap();

        assert_eq!(normed.dims(), [1, 3, 2, 2]);
        let vals = normed.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((vals[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((vals[11] - (1.0 - 0.406) / 0.225).abs() < 1e-5);
    }
}
