use super::Parameter;
use crate::result::Result;
use anyhow::{anyhow, bail, ensure};
use ndarray::{
    parallel::prelude::*, Array, Array1, Array2, Array3, Array4, ArrayD, ArrayView2, ArrayView4,
    Axis, Ix1, Ix2, Ix4, IxDyn, Zip,
};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    Rng, SeedableRng,
};
use std::fmt::{self, Debug};

/// A trait for the forward and backward pass.
///
/// Inputs and outputs are batches, with the batch as the first axis. The forward pass caches
/// whatever the backward pass needs when the layer is training. The backward pass consumes that
/// cache, sets the gradients of the parameters, and returns the gradient of the input.
pub trait Forward {
    /// Computes the forward pass.
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>>;
    /// Computes the backward pass.
    ///
    /// **Errors**
    ///
    /// Returns an error if there was no training forward pass since the last backward pass.
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>>;
}

/// A trait for layers.
///
/// [`Layer`] provides shape inference and utility methods.
pub trait Layer: Forward + Send {
    /// The name of the layer.
    fn name(&self) -> &'static str;
    /// Computes the output shape of one example given the input shape of one example.
    ///
    /// **Errors**
    ///
    /// The input shape is not supported by the layer.
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>>;
    /// Sets the layer to training or inference mode.
    ///
    /// Training caches for the backward pass and enables dropout and batch statistics.
    fn set_training(&mut self, training: bool) -> Result<()> {
        let _ = training;
        Ok(())
    }
    /// The number of trainable elements, including child layers.
    fn parameter_count(&self) -> usize {
        0
    }
    /// Enumerates mutable references to the parameters of the layer, including child layers.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }
}

fn missing_cache(name: &str) -> anyhow::Error {
    anyhow!("{name}.backward() called without a training forward pass!")
}

fn standard(x: ArrayD<f32>) -> ArrayD<f32> {
    if x.is_standard_layout() {
        x
    } else {
        x.as_standard_layout().into_owned()
    }
}

fn xavier(inputs: usize, outputs: usize) -> Uniform<f32> {
    let a = (6. / (inputs + outputs).max(1) as f32).sqrt();
    Uniform::new_inclusive(-a, a)
}

fn he_uniform(inputs: usize) -> Uniform<f32> {
    let a = (6. / inputs.max(1) as f32).sqrt();
    Uniform::new_inclusive(-a, a)
}

fn sample_array<R: Rng>(shape: &[usize], distribution: Uniform<f32>, rng: &mut R) -> ArrayD<f32> {
    Array::from_shape_simple_fn(IxDyn(shape), || distribution.sample(rng))
}

/// Layer builders.
pub mod builders {
    use super::*;

    /// Builder for creating a [`Conv2`].
    #[derive(Clone, Debug)]
    pub struct Conv2Builder {
        inputs: usize,
        outputs: usize,
        filter: [usize; 2],
        strides: usize,
        padding: usize,
        bias: bool,
    }

    impl Conv2Builder {
        pub(super) fn new() -> Self {
            Self {
                inputs: 0,
                outputs: 0,
                filter: [3, 3],
                strides: 1,
                padding: 0,
                bias: false,
            }
        }
        /// The number of input channels.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// The number of output channels.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// The filter size. Default is 3 x 3.
        pub fn filter(self, filter: [usize; 2]) -> Self {
            Self { filter, ..self }
        }
        /// The strides. Default is 1.
        pub fn strides(self, strides: usize) -> Self {
            Self { strides, ..self }
        }
        /// Zero padding applied to each side. Default is 0.
        pub fn padding(self, padding: usize) -> Self {
            Self { padding, ..self }
        }
        /// Whether to add a bias. Default is false.
        pub fn bias(self, bias: bool) -> Self {
            Self { bias, ..self }
        }
        /// Builds the layer.
        ///
        /// The weight is sampled uniformly from (-a, a) where a = sqrt(6 / fan_in). The bias
        /// is zero.
        ///
        /// **Errors**
        ///
        /// Any of the inputs, outputs, filter or strides are 0.
        pub fn build<R: Rng>(self, rng: &mut R) -> Result<Conv2> {
            let Self {
                inputs,
                outputs,
                filter,
                strides,
                padding,
                bias,
            } = self;
            ensure!(
                inputs > 0 && outputs > 0,
                "Conv2 inputs and outputs must be set!"
            );
            ensure!(
                filter.iter().all(|x| *x > 0) && strides > 0,
                "Conv2 filter and strides must be positive!"
            );
            let [fh, fw] = filter;
            let weight = sample_array(
                &[outputs, inputs, fh, fw],
                he_uniform(inputs * fh * fw),
                rng,
            );
            let bias = bias.then(|| Parameter::new(ArrayD::zeros(IxDyn(&[outputs]))));
            Ok(Conv2 {
                inputs,
                outputs,
                filter,
                strides,
                padding,
                weight: Parameter::new(weight),
                bias,
                training: false,
                input: None,
            })
        }
    }

    /// Builder for creating a [`Dense`].
    #[derive(Clone, Debug)]
    pub struct DenseBuilder {
        inputs: usize,
        outputs: usize,
        bias: bool,
    }

    impl DenseBuilder {
        pub(super) fn new() -> Self {
            Self {
                inputs: 0,
                outputs: 0,
                bias: false,
            }
        }
        /// The number of inputs.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// The number of outputs.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// Whether to add a bias. Default is false.
        pub fn bias(self, bias: bool) -> Self {
            Self { bias, ..self }
        }
        /// Builds the layer.
        ///
        /// The weight is sampled uniformly from (-a, a) where a = sqrt(6 / (inputs + outputs)).
        ///
        /// **Errors**
        ///
        /// The inputs or outputs are 0.
        pub fn build<R: Rng>(self, rng: &mut R) -> Result<Dense> {
            let Self {
                inputs,
                outputs,
                bias,
            } = self;
            ensure!(
                inputs > 0 && outputs > 0,
                "Dense inputs and outputs must be set!"
            );
            let weight = sample_array(&[outputs, inputs], xavier(inputs, outputs), rng);
            let bias = bias.then(|| Parameter::new(ArrayD::zeros(IxDyn(&[outputs]))));
            Ok(Dense {
                inputs,
                outputs,
                weight: Parameter::new(weight),
                bias,
                training: false,
                input: None,
            })
        }
    }
}
use builders::*;

/// Output size of a sliding window.
fn window_output(input: usize, size: usize, strides: usize, padding: usize) -> Result<usize> {
    let padded = input + 2 * padding;
    ensure!(
        padded >= size,
        "Window of size {size} does not fit input of size {input} with padding {padding}!"
    );
    Ok((padded - size) / strides + 1)
}

#[derive(Clone, Copy, Debug)]
struct ConvGeometry {
    filter: [usize; 2],
    strides: usize,
    padding: usize,
    output: [usize; 2],
}

impl ConvGeometry {
    /// Maps an output position and filter offset to an input position, None if it falls in the
    /// padding.
    #[inline]
    fn source(&self, o: usize, k: usize, len: usize) -> Option<usize> {
        let i = (o * self.strides + k).checked_sub(self.padding)?;
        (i < len).then_some(i)
    }
}

/// Unrolls the patches of `x` into rows.
///
/// Output shape = \[batch_size * oh * ow, channels * fh * fw\].
fn im2col(x: ArrayView4<f32>, geometry: &ConvGeometry) -> Array2<f32> {
    let (n, c, h, w) = x.dim();
    let [fh, fw] = geometry.filter;
    let [oh, ow] = geometry.output;
    let mut cols = Array2::zeros([n * oh * ow, c * fh * fw]);
    if cols.is_empty() {
        return cols;
    }
    cols.axis_chunks_iter_mut(Axis(0), oh * ow)
        .into_par_iter()
        .zip(x.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut cols, x)| {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut row = cols.row_mut(oy * ow + ox);
                    for ci in 0..c {
                        for ky in 0..fh {
                            let Some(iy) = geometry.source(oy, ky, h) else {
                                continue;
                            };
                            for kx in 0..fw {
                                if let Some(ix) = geometry.source(ox, kx, w) {
                                    row[(ci * fh + ky) * fw + kx] = x[[ci, iy, ix]];
                                }
                            }
                        }
                    }
                }
            }
        });
    cols
}

/// Folds rows of patches back into an image batch, summing overlaps. Inverse of [`im2col`].
fn col2im(cols: ArrayView2<f32>, dim: [usize; 4], geometry: &ConvGeometry) -> Array4<f32> {
    let [n, c, h, w] = dim;
    let [fh, fw] = geometry.filter;
    let [oh, ow] = geometry.output;
    let mut x = Array4::zeros([n, c, h, w]);
    if cols.is_empty() {
        return x;
    }
    x.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(cols.axis_chunks_iter(Axis(0), oh * ow).into_par_iter())
        .for_each(|(mut x, cols)| {
            for oy in 0..oh {
                for ox in 0..ow {
                    let row = cols.row(oy * ow + ox);
                    for ci in 0..c {
                        for ky in 0..fh {
                            let Some(iy) = geometry.source(oy, ky, h) else {
                                continue;
                            };
                            for kx in 0..fw {
                                if let Some(ix) = geometry.source(ox, kx, w) {
                                    x[[ci, iy, ix]] += row[(ci * fh + ky) * fw + kx];
                                }
                            }
                        }
                    }
                }
            }
        });
    x
}

/// Convolutional layer.
///
/// Input shape = \[batch_size, inputs, h, w\], output shape = \[batch_size, outputs, oh, ow\].
pub struct Conv2 {
    inputs: usize,
    outputs: usize,
    filter: [usize; 2],
    strides: usize,
    padding: usize,
    weight: Parameter,
    bias: Option<Parameter>,
    training: bool,
    input: Option<Array4<f32>>,
}

impl Conv2 {
    /// Returns a builder for creating a [`Conv2`].
    pub fn builder() -> Conv2Builder {
        Conv2Builder::new()
    }
    /// The weight, shape = \[outputs, inputs, fh, fw\].
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }
    /// The bias, shape = \[outputs\].
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }
    fn geometry(&self, h: usize, w: usize) -> Result<ConvGeometry> {
        let [fh, fw] = self.filter;
        let oh = window_output(h, fh, self.strides, self.padding)?;
        let ow = window_output(w, fw, self.strides, self.padding)?;
        Ok(ConvGeometry {
            filter: self.filter,
            strides: self.strides,
            padding: self.padding,
            output: [oh, ow],
        })
    }
    fn weight_matrix(&self) -> Result<ArrayView2<f32>> {
        let [fh, fw] = self.filter;
        Ok(self
            .weight
            .value
            .view()
            .into_shape([self.outputs, self.inputs * fh * fw])?)
    }
}

impl Debug for Conv2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Conv2")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("filter", &self.filter)
            .field("strides", &self.strides)
            .field("padding", &self.padding)
            .field("bias", &self.bias.is_some())
            .finish()
    }
}

impl Forward for Conv2 {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = standard(input).into_dimensionality::<Ix4>()?;
        let (n, c, h, w) = x.dim();
        ensure!(
            c == self.inputs,
            "Conv2 expected {} input channels, found {c}!",
            self.inputs
        );
        let geometry = self.geometry(h, w)?;
        let [oh, ow] = geometry.output;
        let cols = im2col(x.view(), &geometry);
        let mut y = cols.dot(&self.weight_matrix()?.t());
        if let Some(bias) = self.bias.as_ref() {
            y += &bias.value.view().into_dimensionality::<Ix1>()?;
        }
        let y = y
            .into_shape([n, oh, ow, self.outputs])?
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();
        if self.training {
            self.input.replace(x);
        }
        Ok(y.into_dyn())
    }
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = self.input.take().ok_or_else(|| missing_cache("Conv2"))?;
        let dy = output_grad.into_dimensionality::<Ix4>()?;
        let (n, c, h, w) = x.dim();
        let geometry = self.geometry(h, w)?;
        let [oh, ow] = geometry.output;
        ensure!(
            dy.dim() == (n, self.outputs, oh, ow),
            "Conv2 expected output gradient {:?}, found {:?}!",
            (n, self.outputs, oh, ow),
            dy.dim()
        );
        let dy = dy
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape([n * oh * ow, self.outputs])?;
        let cols = im2col(x.view(), &geometry);
        let weight_grad = dy.t().dot(&cols);
        let dx = col2im(dy.dot(&self.weight_matrix()?).view(), [n, c, h, w], &geometry);
        let weight_dim = self.weight.value.raw_dim();
        self.weight.set_grad(weight_grad.into_shape(weight_dim)?)?;
        if let Some(bias) = self.bias.as_mut() {
            bias.set_grad(dy.sum_axis(Axis(0)).into_dyn())?;
        }
        Ok(dx.into_dyn())
    }
}

impl Layer for Conv2 {
    fn name(&self) -> &'static str {
        "Conv2"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let &[c, h, w] = input_shape else {
            bail!("Conv2 expected [c, h, w] input, found {input_shape:?}!");
        };
        ensure!(
            c == self.inputs,
            "Conv2 expected {} input channels, found {c}!",
            self.inputs
        );
        let [oh, ow] = self.geometry(h, w)?.output;
        Ok(vec![self.outputs, oh, ow])
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if !training {
            self.input = None;
        }
        Ok(())
    }
    fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, Parameter::len)
    }
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        std::iter::once(&mut self.weight)
            .chain(self.bias.as_mut())
            .collect()
    }
}

/// Fully connected layer.
///
/// Input shape = \[batch_size, inputs\], output shape = \[batch_size, outputs\].
pub struct Dense {
    inputs: usize,
    outputs: usize,
    weight: Parameter,
    bias: Option<Parameter>,
    training: bool,
    input: Option<Array2<f32>>,
}

impl Dense {
    /// Returns a builder for creating a [`Dense`].
    pub fn builder() -> DenseBuilder {
        DenseBuilder::new()
    }
    /// The weight, shape = \[outputs, inputs\].
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }
    /// The bias, shape = \[outputs\].
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }
    fn weight_matrix(&self) -> Result<ArrayView2<f32>> {
        Ok(self.weight.value.view().into_dimensionality::<Ix2>()?)
    }
}

impl Debug for Dense {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dense")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("bias", &self.bias.is_some())
            .finish()
    }
}

impl Forward for Dense {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = input.into_dimensionality::<Ix2>()?;
        ensure!(
            x.ncols() == self.inputs,
            "Dense expected {} inputs, found {}!",
            self.inputs,
            x.ncols()
        );
        let mut y = x.dot(&self.weight_matrix()?.t());
        if let Some(bias) = self.bias.as_ref() {
            y += &bias.value.view().into_dimensionality::<Ix1>()?;
        }
        if self.training {
            self.input.replace(x);
        }
        Ok(y.into_dyn())
    }
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = self.input.take().ok_or_else(|| missing_cache("Dense"))?;
        let dy = output_grad.into_dimensionality::<Ix2>()?;
        ensure!(
            dy.dim() == (x.nrows(), self.outputs),
            "Dense expected output gradient {:?}, found {:?}!",
            (x.nrows(), self.outputs),
            dy.dim()
        );
        let dx = dy.dot(&self.weight_matrix()?);
        self.weight.set_grad(dy.t().dot(&x).into_dyn())?;
        if let Some(bias) = self.bias.as_mut() {
            bias.set_grad(dy.sum_axis(Axis(0)).into_dyn())?;
        }
        Ok(dx.into_dyn())
    }
}

impl Layer for Dense {
    fn name(&self) -> &'static str {
        "Dense"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        ensure!(
            input_shape == [self.inputs],
            "Dense expected [{}] input, found {input_shape:?}!",
            self.inputs
        );
        Ok(vec![self.outputs])
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if !training {
            self.input = None;
        }
        Ok(())
    }
    fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, Parameter::len)
    }
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        std::iter::once(&mut self.weight)
            .chain(self.bias.as_mut())
            .collect()
    }
}

struct BatchNormCache {
    x_hat: Array3<f32>,
    inv_std: Array1<f32>,
    shape: IxDyn,
}

/// Batch normalization over the channel axis (axis 1).
///
/// Normalizes with batch statistics when training and running statistics otherwise, then
/// applies a per channel scale and shift. Works for both \[n, c\] and \[n, c, h, w\] inputs.
pub struct BatchNorm {
    channels: usize,
    momentum: f32,
    epsilon: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    training: bool,
    cache: Option<BatchNormCache>,
}

impl BatchNorm {
    /// Creates a batch norm for `channels`, with momentum 0.9 and epsilon 1e-5.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            momentum: 0.9,
            epsilon: 1e-5,
            gamma: Parameter::new(ArrayD::ones(IxDyn(&[channels]))),
            beta: Parameter::new(ArrayD::zeros(IxDyn(&[channels]))),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            training: false,
            cache: None,
        }
    }
    /// The running mean.
    pub fn running_mean(&self) -> &Array1<f32> {
        &self.running_mean
    }
    /// The running variance.
    pub fn running_var(&self) -> &Array1<f32> {
        &self.running_var
    }
    fn split(&self, input: ArrayD<f32>) -> Result<(Array3<f32>, IxDyn)> {
        let shape = input.raw_dim();
        ensure!(
            input.ndim() >= 2 && input.shape()[1] == self.channels,
            "BatchNorm expected {} channels, found shape {:?}!",
            self.channels,
            input.shape()
        );
        let n = input.shape()[0];
        let m = input.shape()[2..].iter().product::<usize>();
        let x = standard(input).into_shape([n, self.channels, m])?;
        Ok((x, shape))
    }
}

impl Debug for BatchNorm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BatchNorm")
            .field("channels", &self.channels)
            .field("momentum", &self.momentum)
            .field("epsilon", &self.epsilon)
            .finish()
    }
}

impl Forward for BatchNorm {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (x, shape) = self.split(input)?;
        let (n, c, m) = x.dim();
        let (mean, var) = if self.training {
            let count = (n * m).max(1) as f32;
            let mut mean = Array1::zeros(c);
            let mut var = Array1::zeros(c);
            for (ci, x) in x.axis_iter(Axis(1)).enumerate() {
                let mu = x.sum() / count;
                mean[ci] = mu;
                var[ci] = x.fold(0., |acc, x| acc + (x - mu) * (x - mu)) / count;
            }
            let momentum = self.momentum;
            Zip::from(&mut self.running_mean)
                .and(&mean)
                .for_each(|r, &x| *r = momentum * *r + (1. - momentum) * x);
            Zip::from(&mut self.running_var)
                .and(&var)
                .for_each(|r, &x| *r = momentum * *r + (1. - momentum) * x);
            (mean, var)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };
        let epsilon = self.epsilon;
        let inv_std = var.mapv(|v| (v + epsilon).sqrt().recip());
        let gamma = self.gamma.value.view().into_dimensionality::<Ix1>()?;
        let beta = self.beta.value.view().into_dimensionality::<Ix1>()?;
        let mut x_hat = x;
        let mut y = Array3::zeros(x_hat.raw_dim());
        for ci in 0..c {
            let (mu, s, g, b) = (mean[ci], inv_std[ci], gamma[ci], beta[ci]);
            Zip::from(x_hat.index_axis_mut(Axis(1), ci))
                .and(y.index_axis_mut(Axis(1), ci))
                .for_each(|x, y| {
                    *x = (*x - mu) * s;
                    *y = g * *x + b;
                });
        }
        if self.training {
            self.cache.replace(BatchNormCache {
                x_hat,
                inv_std,
                shape: shape.clone(),
            });
        }
        Ok(y.into_shape(shape)?)
    }
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let BatchNormCache {
            x_hat,
            inv_std,
            shape,
        } = self.cache.take().ok_or_else(|| missing_cache("BatchNorm"))?;
        ensure!(
            output_grad.raw_dim() == shape,
            "BatchNorm expected output gradient {:?}, found {:?}!",
            shape,
            output_grad.raw_dim()
        );
        let (dy, _) = self.split(output_grad)?;
        let (n, c, m) = dy.dim();
        let count = (n * m).max(1) as f32;
        let gamma = self.gamma.value.view().into_dimensionality::<Ix1>()?;
        let mut dgamma = Array1::zeros(c);
        let mut dbeta = Array1::zeros(c);
        let mut dx = Array3::zeros([n, c, m]);
        for ci in 0..c {
            let dy = dy.index_axis(Axis(1), ci);
            let x_hat = x_hat.index_axis(Axis(1), ci);
            let sum_dy = dy.sum();
            let sum_dy_x_hat = Zip::from(&dy)
                .and(&x_hat)
                .fold(0., |acc, dy, x| acc + dy * x);
            dbeta[ci] = sum_dy;
            dgamma[ci] = sum_dy_x_hat;
            let scale = gamma[ci] * inv_std[ci] / count;
            Zip::from(dx.index_axis_mut(Axis(1), ci))
                .and(&dy)
                .and(&x_hat)
                .for_each(|dx, &dy, &x| {
                    *dx = scale * (count * dy - sum_dy - x * sum_dy_x_hat);
                });
        }
        self.gamma.set_grad(dgamma.into_dyn())?;
        self.beta.set_grad(dbeta.into_dyn())?;
        Ok(dx.into_shape(shape)?)
    }
}

impl Layer for BatchNorm {
    fn name(&self) -> &'static str {
        "BatchNorm"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        ensure!(
            input_shape.first() == Some(&self.channels),
            "BatchNorm expected {} channels, found {input_shape:?}!",
            self.channels
        );
        Ok(input_shape.to_vec())
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if !training {
            self.cache = None;
        }
        Ok(())
    }
    fn parameter_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

/// Rectified linear unit.
#[derive(Default, Debug)]
pub struct Relu {
    training: bool,
    output: Option<ArrayD<f32>>,
}

impl Forward for Relu {
    fn forward(&mut self, mut input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        input.mapv_inplace(|x| x.max(0.));
        if self.training {
            self.output.replace(input.clone());
        }
        Ok(input)
    }
    fn backward(&mut self, mut output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let y = self.output.take().ok_or_else(|| missing_cache("Relu"))?;
        ensure!(
            y.shape() == output_grad.shape(),
            "Relu expected output gradient {:?}, found {:?}!",
            y.shape(),
            output_grad.shape()
        );
        Zip::from(&mut output_grad).and(&y).for_each(|dy, &y| {
            if y <= 0. {
                *dy = 0.;
            }
        });
        Ok(output_grad)
    }
}

impl Layer for Relu {
    fn name(&self) -> &'static str {
        "Relu"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        Ok(input_shape.to_vec())
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if !training {
            self.output = None;
        }
        Ok(())
    }
}

/// Inverted dropout.
///
/// When training, zeroes each element with `probability` and scales the rest by
/// 1 / (1 - probability). Identity otherwise, or when the probability is 0.
pub struct Dropout {
    probability: f32,
    rng: StdRng,
    training: bool,
    mask: Option<ArrayD<f32>>,
}

impl Dropout {
    /// Creates a dropout layer, seeding its mask generator from `rng`.
    ///
    /// **Errors**
    ///
    /// `probability` is not in \[0, 1).
    pub fn new<R: Rng>(probability: f32, rng: &mut R) -> Result<Self> {
        ensure!(
            (0. ..1.).contains(&probability),
            "Dropout probability must be in [0, 1), found {probability}!"
        );
        Ok(Self {
            probability,
            rng: StdRng::seed_from_u64(rng.gen()),
            training: false,
            mask: None,
        })
    }
    /// The dropout probability.
    pub fn probability(&self) -> f32 {
        self.probability
    }
}

impl Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .finish()
    }
}

impl Forward for Dropout {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if !self.training || self.probability == 0. {
            return Ok(input);
        }
        let keep = 1. - self.probability;
        let scale = keep.recip();
        let rng = &mut self.rng;
        let mask = input.map(|_| if rng.gen::<f32>() < keep { scale } else { 0. });
        let y = &input * &mask;
        self.mask.replace(mask);
        Ok(y)
    }
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if self.probability == 0. {
            return Ok(output_grad);
        }
        let mask = self.mask.take().ok_or_else(|| missing_cache("Dropout"))?;
        ensure!(
            mask.shape() == output_grad.shape(),
            "Dropout expected output gradient {:?}, found {:?}!",
            mask.shape(),
            output_grad.shape()
        );
        Ok(output_grad * mask)
    }
}

impl Layer for Dropout {
    fn name(&self) -> &'static str {
        "Dropout"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        Ok(input_shape.to_vec())
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if !training {
            self.mask = None;
        }
        Ok(())
    }
}

/// Max pooling.
#[derive(Debug)]
pub struct MaxPool2 {
    size: [usize; 2],
    strides: [usize; 2],
    training: bool,
    cache: Option<(Array4<usize>, [usize; 4])>,
}

impl MaxPool2 {
    /// Creates a max pool with `size` and `strides`.
    pub fn new(size: [usize; 2], strides: [usize; 2]) -> Result<Self> {
        ensure!(
            size.iter().chain(strides.iter()).all(|x| *x > 0),
            "MaxPool2 size and strides must be positive!"
        );
        Ok(Self {
            size,
            strides,
            training: false,
            cache: None,
        })
    }
    fn output_hw(&self, h: usize, w: usize) -> Result<[usize; 2]> {
        Ok([
            window_output(h, self.size[0], self.strides[0], 0)?,
            window_output(w, self.size[1], self.strides[1], 0)?,
        ])
    }
}

impl Forward for MaxPool2 {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = input.into_dimensionality::<Ix4>()?;
        let (n, c, h, w) = x.dim();
        let [oh, ow] = self.output_hw(h, w)?;
        let [ph, pw] = self.size;
        let [sh, sw] = self.strides;
        let mut y = Array4::zeros([n, c, oh, ow]);
        let mut indices = Array4::zeros([n, c, oh, ow]);
        Zip::from(y.outer_iter_mut())
            .and(indices.outer_iter_mut())
            .and(x.outer_iter())
            .par_for_each(|mut y, mut indices, x| {
                for ((ci, oy, ox), y) in y.indexed_iter_mut() {
                    let mut max = f32::NEG_INFINITY;
                    let mut argmax = 0;
                    for ky in 0..ph {
                        for kx in 0..pw {
                            let (iy, ix) = (oy * sh + ky, ox * sw + kx);
                            let v = x[[ci, iy, ix]];
                            if v > max {
                                max = v;
                                argmax = iy * w + ix;
                            }
                        }
                    }
                    *y = max;
                    indices[[ci, oy, ox]] = argmax;
                }
            });
        if self.training {
            self.cache.replace((indices, [n, c, h, w]));
        }
        Ok(y.into_dyn())
    }
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (indices, [n, c, h, w]) = self.cache.take().ok_or_else(|| missing_cache("MaxPool2"))?;
        let dy = output_grad.into_dimensionality::<Ix4>()?;
        ensure!(
            dy.dim() == indices.dim(),
            "MaxPool2 expected output gradient {:?}, found {:?}!",
            indices.dim(),
            dy.dim()
        );
        let mut dx = Array3::<f32>::zeros([n, c, h * w]);
        Zip::from(dx.outer_iter_mut())
            .and(dy.outer_iter())
            .and(indices.outer_iter())
            .par_for_each(|mut dx, dy, indices| {
                for ((ci, oy, ox), &index) in indices.indexed_iter() {
                    dx[[ci, index]] += dy[[ci, oy, ox]];
                }
            });
        Ok(dx.into_shape([n, c, h, w])?.into_dyn())
    }
}

impl Layer for MaxPool2 {
    fn name(&self) -> &'static str {
        "MaxPool2"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let &[c, h, w] = input_shape else {
            bail!("MaxPool2 expected [c, h, w] input, found {input_shape:?}!");
        };
        let [oh, ow] = self.output_hw(h, w)?;
        Ok(vec![c, oh, ow])
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if !training {
            self.cache = None;
        }
        Ok(())
    }
}

/// Average pooling.
#[derive(Debug)]
pub struct AvgPool2 {
    size: [usize; 2],
    strides: [usize; 2],
    training: bool,
    input_dim: Option<[usize; 4]>,
}

impl AvgPool2 {
    /// Creates an average pool with `size` and `strides`.
    pub fn new(size: [usize; 2], strides: [usize; 2]) -> Result<Self> {
        ensure!(
            size.iter().chain(strides.iter()).all(|x| *x > 0),
            "AvgPool2 size and strides must be positive!"
        );
        Ok(Self {
            size,
            strides,
            training: false,
            input_dim: None,
        })
    }
    fn output_hw(&self, h: usize, w: usize) -> Result<[usize; 2]> {
        Ok([
            window_output(h, self.size[0], self.strides[0], 0)?,
            window_output(w, self.size[1], self.strides[1], 0)?,
        ])
    }
}

impl Forward for AvgPool2 {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = input.into_dimensionality::<Ix4>()?;
        let (n, c, h, w) = x.dim();
        let [oh, ow] = self.output_hw(h, w)?;
        let [ph, pw] = self.size;
        let [sh, sw] = self.strides;
        let area = (ph * pw) as f32;
        let mut y = Array4::zeros([n, c, oh, ow]);
        Zip::from(y.outer_iter_mut())
            .and(x.outer_iter())
            .par_for_each(|mut y, x| {
                for ((ci, oy, ox), y) in y.indexed_iter_mut() {
                    let mut sum = 0.;
                    for ky in 0..ph {
                        for kx in 0..pw {
                            sum += x[[ci, oy * sh + ky, ox * sw + kx]];
                        }
                    }
                    *y = sum / area;
                }
            });
        if self.training {
            self.input_dim.replace([n, c, h, w]);
        }
        Ok(y.into_dyn())
    }
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let [n, c, h, w] = self.input_dim.take().ok_or_else(|| missing_cache("AvgPool2"))?;
        let dy = output_grad.into_dimensionality::<Ix4>()?;
        let [oh, ow] = self.output_hw(h, w)?;
        ensure!(
            dy.dim() == (n, c, oh, ow),
            "AvgPool2 expected output gradient {:?}, found {:?}!",
            (n, c, oh, ow),
            dy.dim()
        );
        let [ph, pw] = self.size;
        let [sh, sw] = self.strides;
        let area = (ph * pw) as f32;
        let mut dx = Array4::zeros([n, c, h, w]);
        Zip::from(dx.outer_iter_mut())
            .and(dy.outer_iter())
            .par_for_each(|mut dx, dy| {
                for ((ci, oy, ox), &dy) in dy.indexed_iter() {
                    for ky in 0..ph {
                        for kx in 0..pw {
                            dx[[ci, oy * sh + ky, ox * sw + kx]] += dy / area;
                        }
                    }
                }
            });
        Ok(dx.into_dyn())
    }
}

impl Layer for AvgPool2 {
    fn name(&self) -> &'static str {
        "AvgPool2"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let &[c, h, w] = input_shape else {
            bail!("AvgPool2 expected [c, h, w] input, found {input_shape:?}!");
        };
        let [oh, ow] = self.output_hw(h, w)?;
        Ok(vec![c, oh, ow])
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if !training {
            self.input_dim = None;
        }
        Ok(())
    }
}

/// Flattens all but the batch axis.
#[derive(Default, Debug)]
pub struct Flatten {
    training: bool,
    input_dim: Option<IxDyn>,
}

impl Forward for Flatten {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let dim = input.raw_dim();
        let n = input.shape().first().copied().unwrap_or(0);
        let features = input.shape().iter().skip(1).product::<usize>();
        let y = standard(input).into_shape(IxDyn(&[n, features]))?;
        if self.training {
            self.input_dim.replace(dim);
        }
        Ok(y)
    }
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let dim = self.input_dim.take().ok_or_else(|| missing_cache("Flatten"))?;
        Ok(standard(output_grad).into_shape(dim)?)
    }
}

impl Layer for Flatten {
    fn name(&self) -> &'static str {
        "Flatten"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        Ok(vec![input_shape.iter().product()])
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if !training {
            self.input_dim = None;
        }
        Ok(())
    }
}

/// A stack of layers applied in order.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    /// Appends `layer`.
    pub fn push<L: Layer + 'static>(&mut self, layer: L) {
        self.layers.push(Box::new(layer));
    }
    /// The layers.
    pub fn layers(&self) -> impl Iterator<Item = &dyn Layer> + '_ {
        self.layers.iter().map(|layer| &**layer)
    }
    /// The number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }
    /// Whether there are no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Debug for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|x| x.name()))
            .finish()
    }
}

impl Forward for Sequential {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.layers
            .iter_mut()
            .try_fold(input, |x, layer| layer.forward(x))
    }
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.layers
            .iter_mut()
            .rev()
            .try_fold(output_grad, |dy, layer| layer.backward(dy))
    }
}

impl Layer for Sequential {
    fn name(&self) -> &'static str {
        "Sequential"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.layers
            .iter()
            .try_fold(input_shape.to_vec(), |shape, layer| layer.output_shape(&shape))
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.layers
            .iter_mut()
            .try_for_each(|layer| layer.set_training(training))
    }
    fn parameter_count(&self) -> usize {
        self.layers.iter().map(|x| x.parameter_count()).sum()
    }
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers
            .iter_mut()
            .flat_map(|x| x.parameters_mut())
            .collect()
    }
}

/// A residual block.
///
/// Computes relu(body(x) + shortcut(x)), where the shortcut is the identity when it is `None`.
pub struct Residual {
    body: Sequential,
    shortcut: Option<Sequential>,
    relu: Relu,
}

impl Residual {
    /// Creates a residual block.
    pub fn new(body: Sequential, shortcut: Option<Sequential>) -> Self {
        Self {
            body,
            shortcut,
            relu: Relu::default(),
        }
    }
    /// Whether the shortcut is a projection.
    pub fn is_projection(&self) -> bool {
        self.shortcut.is_some()
    }
}

impl Debug for Residual {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Residual")
            .field("body", &self.body)
            .field("shortcut", &self.shortcut)
            .finish()
    }
}

impl Forward for Residual {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let short = match self.shortcut.as_mut() {
            Some(shortcut) => shortcut.forward(input.clone())?,
            None => input.clone(),
        };
        let y = self.body.forward(input)?;
        ensure!(
            y.shape() == short.shape(),
            "Residual body output {:?} does not match shortcut {:?}!",
            y.shape(),
            short.shape()
        );
        self.relu.forward(y + short)
    }
    fn backward(&mut self, output_grad: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let dy = self.relu.backward(output_grad)?;
        let dx_short = match self.shortcut.as_mut() {
            Some(shortcut) => shortcut.backward(dy.clone())?,
            None => dy.clone(),
        };
        let dx = self.body.backward(dy)?;
        Ok(dx + dx_short)
    }
}

impl Layer for Residual {
    fn name(&self) -> &'static str {
        "Residual"
    }
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let body = self.body.output_shape(input_shape)?;
        let short = match self.shortcut.as_ref() {
            Some(shortcut) => shortcut.output_shape(input_shape)?,
            None => input_shape.to_vec(),
        };
        ensure!(
            body == short,
            "Residual body output {body:?} does not match shortcut {short:?}!"
        );
        Ok(body)
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.body.set_training(training)?;
        if let Some(shortcut) = self.shortcut.as_mut() {
            shortcut.set_training(training)?;
        }
        self.relu.set_training(training)
    }
    fn parameter_count(&self) -> usize {
        self.body.parameter_count() + self.shortcut.as_ref().map_or(0, |x| x.parameter_count())
    }
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut parameters = self.body.parameters_mut();
        if let Some(shortcut) = self.shortcut.as_mut() {
            parameters.extend(shortcut.parameters_mut());
        }
        parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn random(shape: &[usize], rng: &mut StdRng) -> ArrayD<f32> {
        sample_array(shape, Uniform::new(-1., 1.), rng)
    }

    /// Sum of output * weights, so d(objective)/d(output) = weights.
    fn objective<L: Layer>(layer: &mut L, x: &ArrayD<f32>, weights: &ArrayD<f32>) -> f32 {
        let y = layer.forward(x.clone()).unwrap();
        (&y * weights).sum()
    }

    /// Checks the input gradient of `layer` against central differences.
    fn check_input_grad<L: Layer>(mut layer: L, input_shape: &[usize]) {
        let mut rng = rng();
        let x = random(input_shape, &mut rng);
        layer.set_training(true).unwrap();
        let y = layer.forward(x.clone()).unwrap();
        let weights = random(y.shape(), &mut rng);
        let dx = layer.backward(weights.clone()).unwrap();
        assert_eq!(dx.shape(), x.shape());
        let h = 1e-2;
        for index in [0, x.len() / 3, x.len() / 2, x.len() - 1] {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus.as_slice_mut().unwrap()[index] += h;
            minus.as_slice_mut().unwrap()[index] -= h;
            let numeric =
                (objective(&mut layer, &plus, &weights) - objective(&mut layer, &minus, &weights))
                    / (2. * h);
            let analytic = dx.as_slice().unwrap()[index];
            assert_relative_eq!(analytic, numeric, epsilon = 1e-2, max_relative = 1e-2);
        }
    }

    #[test]
    fn im2col_col2im_adjoint() {
        // <im2col(x), c> == <x, col2im(c)>
        let mut rng = rng();
        let geometry = ConvGeometry {
            filter: [3, 3],
            strides: 2,
            padding: 1,
            output: [3, 3],
        };
        let x = random(&[2, 2, 5, 5], &mut rng)
            .into_dimensionality::<Ix4>()
            .unwrap();
        let cols = im2col(x.view(), &geometry);
        assert_eq!(cols.dim(), (2 * 9, 2 * 9));
        let c = random(&[18, 18], &mut rng)
            .into_dimensionality::<Ix2>()
            .unwrap();
        let folded = col2im(c.view(), [2, 2, 5, 5], &geometry);
        assert_relative_eq!((&cols * &c).sum(), (&x * &folded).sum(), max_relative = 1e-4);
    }

    #[test]
    fn conv2_known_output() -> Result<()> {
        let mut conv = Conv2::builder()
            .inputs(1)
            .outputs(1)
            .filter([2, 2])
            .bias(true)
            .build(&mut rng())?;
        conv.weight.value.fill(1.);
        conv.bias.as_mut().unwrap().value.fill(0.5);
        let x = Array::from_shape_vec([1, 1, 3, 3], (0..9).map(|x| x as f32).collect())?;
        let y = conv.forward(x.into_dyn())?;
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y.as_slice().unwrap(), &[8.5, 12.5, 20.5, 24.5]);
        Ok(())
    }

    #[test]
    fn conv2_output_shape() -> Result<()> {
        let conv = Conv2::builder()
            .inputs(3)
            .outputs(16)
            .strides(2)
            .padding(1)
            .build(&mut rng())?;
        assert_eq!(conv.output_shape(&[3, 32, 32])?, vec![16, 16, 16]);
        assert!(conv.output_shape(&[4, 32, 32]).is_err());
        assert!(Conv2::builder().inputs(3).build(&mut rng()).is_err());
        Ok(())
    }

    #[test]
    fn conv2_input_grad() -> Result<()> {
        let conv = Conv2::builder()
            .inputs(2)
            .outputs(3)
            .strides(2)
            .padding(1)
            .bias(true)
            .build(&mut rng())?;
        check_input_grad(conv, &[2, 2, 5, 5]);
        Ok(())
    }

    #[test]
    fn conv2_weight_grad() -> Result<()> {
        let mut rng = rng();
        let mut conv = Conv2::builder()
            .inputs(2)
            .outputs(2)
            .padding(1)
            .build(&mut rng)?;
        let x = random(&[2, 2, 4, 4], &mut rng);
        conv.set_training(true)?;
        let y = conv.forward(x.clone())?;
        let weights = random(y.shape(), &mut rng);
        conv.backward(weights.clone())?;
        let grad = conv.weight.grad().unwrap().to_owned();
        conv.set_training(false)?;
        let h = 1e-2;
        for index in [0, 7, 35] {
            conv.weight.value.as_slice_mut().unwrap()[index] += h;
            let plus = objective(&mut conv, &x, &weights);
            conv.weight.value.as_slice_mut().unwrap()[index] -= 2. * h;
            let minus = objective(&mut conv, &x, &weights);
            conv.weight.value.as_slice_mut().unwrap()[index] += h;
            let numeric = (plus - minus) / (2. * h);
            assert_relative_eq!(
                grad.as_slice().unwrap()[index],
                numeric,
                epsilon = 1e-2,
                max_relative = 1e-2
            );
        }
        Ok(())
    }

    #[test]
    fn dense_input_grad() -> Result<()> {
        let dense = Dense::builder()
            .inputs(6)
            .outputs(4)
            .bias(true)
            .build(&mut rng())?;
        check_input_grad(dense, &[3, 6]);
        Ok(())
    }

    #[test]
    fn dense_bias_grad() -> Result<()> {
        let mut dense = Dense::builder()
            .inputs(2)
            .outputs(3)
            .bias(true)
            .build(&mut rng())?;
        dense.set_training(true)?;
        dense.forward(ArrayD::ones(IxDyn(&[4, 2])))?;
        dense.backward(ArrayD::ones(IxDyn(&[4, 3])))?;
        let grad = dense.bias().unwrap().grad().unwrap();
        assert_eq!(grad.as_slice().unwrap(), &[4., 4., 4.]);
        Ok(())
    }

    #[test]
    fn batch_norm_normalizes() -> Result<()> {
        let mut bn = BatchNorm::new(2);
        bn.set_training(true)?;
        let x = random(&[8, 2, 3, 3], &mut rng()).mapv(|x| 3. * x + 5.);
        let y = bn.forward(x)?;
        for channel in y.axis_iter(Axis(1)) {
            let mean = channel.mean().unwrap();
            let var = channel.mapv(|x| (x - mean) * (x - mean)).mean().unwrap();
            assert_relative_eq!(mean, 0., epsilon = 1e-4);
            assert_relative_eq!(var, 1., epsilon = 1e-2);
        }
        assert!(bn.running_mean().iter().all(|x| *x > 0.));
        Ok(())
    }

    #[test]
    fn batch_norm_input_grad() {
        check_input_grad(BatchNorm::new(3), &[4, 3, 2, 2]);
    }

    #[test]
    fn batch_norm_2d_input_grad() {
        check_input_grad(BatchNorm::new(5), &[6, 5]);
    }

    #[test]
    fn relu_backward_masks() -> Result<()> {
        let mut relu = Relu::default();
        relu.set_training(true)?;
        let x = Array::from_vec(vec![-1., 0.5, 2., -3.]).into_dyn();
        let y = relu.forward(x)?;
        assert_eq!(y.as_slice().unwrap(), &[0., 0.5, 2., 0.]);
        let dx = relu.backward(ArrayD::ones(IxDyn(&[4])))?;
        assert_eq!(dx.as_slice().unwrap(), &[0., 1., 1., 0.]);
        Ok(())
    }

    #[test]
    fn backward_requires_forward() {
        let mut relu = Relu::default();
        assert!(relu.backward(ArrayD::ones(IxDyn(&[1]))).is_err());
        let mut pool = MaxPool2::new([2, 2], [2, 2]).unwrap();
        assert!(pool.backward(ArrayD::ones(IxDyn(&[1, 1, 1, 1]))).is_err());
    }

    #[test]
    fn dropout_scales_kept() -> Result<()> {
        let mut dropout = Dropout::new(0.5, &mut rng())?;
        dropout.set_training(true)?;
        let y = dropout.forward(ArrayD::ones(IxDyn(&[1000])))?;
        assert!(y.iter().all(|x| *x == 0. || *x == 2.));
        let kept = y.iter().filter(|x| **x > 0.).count();
        assert!((350..650).contains(&kept), "{kept}");
        let dx = dropout.backward(ArrayD::ones(IxDyn(&[1000])))?;
        assert_eq!(dx, y);
        dropout.set_training(false)?;
        let y = dropout.forward(ArrayD::ones(IxDyn(&[10])))?;
        assert!(y.iter().all(|x| *x == 1.));
        assert!(Dropout::new(1., &mut rng()).is_err());
        Ok(())
    }

    #[test]
    fn max_pool_routes_grad() -> Result<()> {
        let mut pool = MaxPool2::new([2, 2], [2, 2])?;
        pool.set_training(true)?;
        let x = Array::from_shape_vec([1, 1, 2, 4], vec![1., 5., 2., 0., 3., 4., 7., 6.])?;
        let y = pool.forward(x.into_dyn())?;
        assert_eq!(y.as_slice().unwrap(), &[5., 7.]);
        let dx = pool.backward(Array::from_shape_vec([1, 1, 1, 2], vec![1., 2.])?.into_dyn())?;
        assert_eq!(
            dx.as_slice().unwrap(),
            &[0., 1., 0., 0., 0., 0., 2., 0.]
        );
        Ok(())
    }

    #[test]
    fn avg_pool_input_grad() -> Result<()> {
        check_input_grad(AvgPool2::new([2, 2], [1, 1])?, &[2, 3, 3, 3]);
        Ok(())
    }

    #[test]
    fn flatten_round_trip() -> Result<()> {
        let mut flatten = Flatten::default();
        flatten.set_training(true)?;
        let y = flatten.forward(ArrayD::zeros(IxDyn(&[2, 3, 4, 5])))?;
        assert_eq!(y.shape(), &[2, 60]);
        let dx = flatten.backward(y)?;
        assert_eq!(dx.shape(), &[2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn residual_identity() -> Result<()> {
        // relu(x + x) with an empty body
        let mut block = Residual::new(Sequential::default(), None);
        assert!(!block.is_projection());
        block.set_training(true)?;
        let x = Array::from_vec(vec![-1., 0.5, 2.]).into_dyn();
        let y = block.forward(x)?;
        assert_eq!(y.as_slice().unwrap(), &[0., 1., 4.]);
        let dx = block.backward(ArrayD::ones(IxDyn(&[3])))?;
        assert_eq!(dx.as_slice().unwrap(), &[0., 2., 2.]);
        Ok(())
    }

    #[test]
    fn residual_projection_shape() -> Result<()> {
        let mut rng = rng();
        let mut body = Sequential::default();
        body.push(
            Conv2::builder()
                .inputs(2)
                .outputs(4)
                .strides(2)
                .padding(1)
                .build(&mut rng)?,
        );
        let mut shortcut = Sequential::default();
        shortcut.push(
            Conv2::builder()
                .inputs(2)
                .outputs(4)
                .filter([1, 1])
                .strides(2)
                .build(&mut rng)?,
        );
        let block = Residual::new(body, Some(shortcut));
        assert_eq!(block.output_shape(&[2, 8, 8])?, vec![4, 4, 4]);
        let mismatched = Residual::new(
            {
                let mut body = Sequential::default();
                body.push(MaxPool2::new([2, 2], [2, 2])?);
                body
            },
            None,
        );
        assert!(mismatched.output_shape(&[2, 8, 8]).is_err());
        Ok(())
    }
}
