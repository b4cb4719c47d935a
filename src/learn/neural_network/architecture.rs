use super::layer::{
    AvgPool2, BatchNorm, Conv2, Dense, Dropout, Flatten, Layer, MaxPool2, Relu, Residual,
    Sequential,
};
use crate::{error::BenchError, result::Result};
use anyhow::{ensure, Context};
use log::debug;
use num_format::{Locale, ToFormattedString};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    str::FromStr,
};

/// Residual network depth used when the name is just `"resnet"`.
pub const DEFAULT_RESNET_DEPTH: usize = 32;

/// A network architecture.
///
/// Parsed from `"vgg"`, `"resnet"` or `"resnet<depth>"`, ie `"resnet56"`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Architecture {
    /// CIFAR residual network.
    Resnet {
        /// The number of weighted layers, `(depth - 2) % 6 == 0`.
        depth: usize,
    },
    /// VGG16 with batch norm and dropout.
    Vgg,
}

impl Default for Architecture {
    fn default() -> Self {
        Self::Vgg
    }
}

impl FromStr for Architecture {
    type Err = BenchError;
    fn from_str(name: &str) -> Result<Self, BenchError> {
        let lower = name.trim().to_ascii_lowercase();
        if lower == "vgg" {
            return Ok(Self::Vgg);
        }
        if let Some(depth) = lower.strip_prefix("resnet") {
            if depth.is_empty() {
                return Ok(Self::Resnet {
                    depth: DEFAULT_RESNET_DEPTH,
                });
            }
            if let Ok(depth) = depth.parse() {
                return Ok(Self::Resnet { depth });
            }
        }
        Err(BenchError::UnsupportedArchitecture(name.to_string()))
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Resnet { depth } => write!(f, "resnet{depth}"),
            Self::Vgg => f.write_str("vgg"),
        }
    }
}

impl Architecture {
    /// Checks the parameters of the architecture.
    ///
    /// **Errors**
    ///
    /// [`BenchError::InvalidDepth`] if a residual depth does not satisfy `(depth - 2) % 6 == 0`.
    pub fn validate(&self) -> Result<(), BenchError> {
        match *self {
            Self::Resnet { depth } if depth < 8 || (depth - 2) % 6 != 0 => {
                Err(BenchError::InvalidDepth { depth })
            }
            _ => Ok(()),
        }
    }
    /// The number of basic blocks per stage of a residual network.
    pub fn blocks_per_stage(&self) -> Option<usize> {
        match *self {
            Self::Resnet { depth } if self.validate().is_ok() => Some((depth - 2) / 6),
            _ => None,
        }
    }
    /// Builds the feature graph for an input of shape `[c, h, w]`.
    ///
    /// **Errors**
    /// - [`BenchError::InvalidDepth`] (via [`anyhow`]) for an invalid residual depth.
    /// - The spatial size does not survive the pooling chain.
    pub fn build<R: Rng>(&self, input_shape: [usize; 3], rng: &mut R) -> Result<FeatureGraph> {
        self.validate()?;
        ensure!(
            input_shape.iter().all(|x| *x > 0),
            "Input shape {input_shape:?} must be positive!"
        );
        let mut graph = GraphBuilder::new(&input_shape);
        let built = match *self {
            Self::Resnet { depth } => resnet(&mut graph, (depth - 2) / 6, rng),
            Self::Vgg => vgg(&mut graph, rng),
        };
        built.with_context(|| format!("Failed to build {self} for input {input_shape:?}!"))?;
        let graph = graph.finish();
        debug!(
            "built {self}: {} layers, {} parameters, {} features",
            graph.layers.len(),
            graph.layers.parameter_count().to_formatted_string(&Locale::en),
            graph.features()
        );
        Ok(graph)
    }
}

/// A stack of layers producing a feature tensor.
#[derive(Debug)]
pub struct FeatureGraph {
    layers: Sequential,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl FeatureGraph {
    /// The layers.
    pub fn layers(&self) -> &Sequential {
        &self.layers
    }
    /// The layers, mutably.
    pub fn layers_mut(&mut self) -> &mut Sequential {
        &mut self.layers
    }
    /// The input shape of one example.
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }
    /// The output shape of one example.
    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }
    /// The number of output features of one example.
    pub fn features(&self) -> usize {
        self.output_shape.iter().product()
    }
    /// The number of [`Residual`] blocks.
    pub fn residual_blocks(&self) -> usize {
        self.layers
            .layers()
            .filter(|layer| layer.name() == "Residual")
            .count()
    }
}

/// Appends layers and tracks the output shape.
struct GraphBuilder {
    layers: Sequential,
    input_shape: Vec<usize>,
    shape: Vec<usize>,
}

impl GraphBuilder {
    fn new(input_shape: &[usize]) -> Self {
        Self {
            layers: Sequential::default(),
            input_shape: input_shape.to_vec(),
            shape: input_shape.to_vec(),
        }
    }
    fn channels(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }
    fn push<L: Layer + 'static>(&mut self, layer: L) -> Result<()> {
        self.shape = layer.output_shape(&self.shape)?;
        self.layers.push(layer);
        Ok(())
    }
    fn finish(self) -> FeatureGraph {
        FeatureGraph {
            layers: self.layers,
            input_shape: self.input_shape,
            output_shape: self.shape,
        }
    }
}

fn conv3x3<R: Rng>(
    inputs: usize,
    outputs: usize,
    strides: usize,
    bias: bool,
    rng: &mut R,
) -> Result<Conv2> {
    Conv2::builder()
        .inputs(inputs)
        .outputs(outputs)
        .filter([3, 3])
        .strides(strides)
        .padding(1)
        .bias(bias)
        .build(rng)
}

fn basic_block<R: Rng>(
    inputs: usize,
    outputs: usize,
    strides: usize,
    rng: &mut R,
) -> Result<Residual> {
    let mut body = Sequential::default();
    body.push(conv3x3(inputs, outputs, strides, false, rng)?);
    body.push(BatchNorm::new(outputs));
    body.push(Relu::default());
    body.push(conv3x3(outputs, outputs, 1, true, rng)?);
    body.push(BatchNorm::new(outputs));
    let shortcut = if inputs != outputs || strides != 1 {
        let mut shortcut = Sequential::default();
        shortcut.push(
            Conv2::builder()
                .inputs(inputs)
                .outputs(outputs)
                .filter([1, 1])
                .strides(strides)
                .build(rng)?,
        );
        shortcut.push(BatchNorm::new(outputs));
        Some(shortcut)
    } else {
        None
    };
    Ok(Residual::new(body, shortcut))
}

fn resnet<R: Rng>(graph: &mut GraphBuilder, blocks: usize, rng: &mut R) -> Result<()> {
    graph.push(conv3x3(graph.channels(), 16, 1, false, rng)?)?;
    graph.push(BatchNorm::new(16))?;
    graph.push(Relu::default())?;
    for (outputs, strides) in [(16, 1), (32, 2), (64, 2)] {
        for block in 0..blocks {
            let strides = if block == 0 { strides } else { 1 };
            graph.push(basic_block(graph.channels(), outputs, strides, rng)?)?;
        }
    }
    graph.push(AvgPool2::new([8, 8], [1, 1])?)
}

fn vgg<R: Rng>(graph: &mut GraphBuilder, rng: &mut R) -> Result<()> {
    const GROUPS: [(usize, &[f32]); 5] = [
        (64, &[0.3, 0.]),
        (128, &[0.4, 0.]),
        (256, &[0.4, 0.4, 0.]),
        (512, &[0.4, 0.4, 0.]),
        (512, &[0.4, 0.4, 0.]),
    ];
    for (outputs, dropouts) in GROUPS {
        for &dropout in dropouts {
            graph.push(conv3x3(graph.channels(), outputs, 1, true, rng)?)?;
            graph.push(BatchNorm::new(outputs))?;
            graph.push(Relu::default())?;
            if dropout > 0. {
                graph.push(Dropout::new(dropout, rng)?)?;
            }
        }
        graph.push(MaxPool2::new([2, 2], [2, 2])?)?;
    }
    graph.push(Flatten::default())?;
    graph.push(Dropout::new(0.5, rng)?)?;
    let features = graph.shape.iter().product();
    graph.push(Dense::builder().inputs(features).outputs(512).bias(true).build(rng)?)?;
    graph.push(BatchNorm::new(512))?;
    graph.push(Relu::default())?;
    graph.push(Dropout::new(0.5, rng)?)?;
    graph.push(Dense::builder().inputs(512).outputs(512).bias(true).build(rng)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn parse() {
        assert_eq!("vgg".parse::<Architecture>().unwrap(), Architecture::Vgg);
        assert_eq!(
            "resnet".parse::<Architecture>().unwrap(),
            Architecture::Resnet { depth: 32 }
        );
        assert_eq!(
            "ResNet56".parse::<Architecture>().unwrap(),
            Architecture::Resnet { depth: 56 }
        );
        let error = "alexnet".parse::<Architecture>().unwrap_err();
        assert!(
            matches!(error, BenchError::UnsupportedArchitecture(ref name) if name == "alexnet")
        );
        assert_eq!(error.to_string(), "alexnet network is not supported");
        assert!("resnetx".parse::<Architecture>().is_err());
        assert_eq!(Architecture::Resnet { depth: 20 }.to_string(), "resnet20");
    }

    #[test]
    fn invalid_depth() {
        let mut rng = StdRng::seed_from_u64(0);
        for depth in [0, 2, 30, 33] {
            let architecture = Architecture::Resnet { depth };
            assert!(matches!(
                architecture.validate(),
                Err(BenchError::InvalidDepth { depth: d }) if d == depth
            ));
            let error = architecture.build([3, 32, 32], &mut rng).unwrap_err();
            assert!(matches!(
                error.downcast_ref::<BenchError>(),
                Some(BenchError::InvalidDepth { .. })
            ));
        }
    }

    #[test]
    fn resnet32() -> Result<()> {
        let architecture = Architecture::Resnet { depth: 32 };
        assert_eq!(architecture.blocks_per_stage(), Some(5));
        let graph = architecture.build([3, 32, 32], &mut StdRng::seed_from_u64(0))?;
        assert_eq!(graph.residual_blocks(), 15);
        assert_eq!(graph.output_shape(), &[64, 1, 1]);
        assert_eq!(graph.features(), 64);
        assert_eq!(graph.input_shape(), &[3, 32, 32]);
        Ok(())
    }

    #[test]
    fn vgg() -> Result<()> {
        let graph = Architecture::Vgg.build([3, 32, 32], &mut StdRng::seed_from_u64(0))?;
        assert_eq!(graph.output_shape(), &[512]);
        let convs = graph
            .layers()
            .layers()
            .filter(|layer| layer.name() == "Conv2")
            .count();
        assert_eq!(convs, 13);
        Ok(())
    }

    #[test]
    fn too_small_input() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Architecture::Vgg.build([3, 16, 16], &mut rng).is_err());
        assert!(Architecture::Resnet { depth: 8 }
            .build([3, 16, 16], &mut rng)
            .is_err());
        assert!(Architecture::Resnet { depth: 8 }
            .build([3, 0, 32], &mut rng)
            .is_err());
    }
}
