/*!
Host neural networks.

Networks are stacks of [`Layer`](layer::Layer)'s that compute a forward pass on
[`ArrayD<f32>`](ndarray::ArrayD) activations, cache what the backward pass needs, and write
gradients into their [`Parameter`]'s. An [`Optimizer`](optimizer::Optimizer) then updates the
parameters in place.

# Example
```no_run
# use convbench::{result::Result, learn::neural_network::{
#     architecture::Architecture, optimizer::Adam, Classifier,
# }};
# use ndarray::{Array1, Array4};
# use rand::{rngs::StdRng, SeedableRng};
# fn main() -> Result<()> {
let mut rng = StdRng::seed_from_u64(0);
let features = Architecture::Resnet { depth: 8 }.build([3, 32, 32], &mut rng)?;
let mut classifier = Classifier::new(features, 10, &mut rng)?;
let images = Array4::<f32>::zeros([4, 3, 32, 32]);
let classes = Array1::<u8>::zeros(4);
let output = classifier.train_step(images, classes.view(), &Adam::default(), 0.001)?;
println!("loss: {}", output.loss);
# Ok(())
# }
```
*/
use self::{
    architecture::FeatureGraph,
    layer::{Dense, Flatten, Forward, Layer},
    optimizer::{Optimizer, State},
};
use crate::{
    learn::criterion::{Accuracy, Criterion, CrossEntropyLoss},
    result::Result,
};
use anyhow::{bail, ensure};
use ndarray::{Array4, ArrayD, ArrayView1, ArrayViewD, Ix2};
use rand::Rng;
use serde::Serialize;

/// Network builders.
pub mod architecture;
/// Layers.
pub mod layer;
/// Optimizers.
pub mod optimizer;

/// A trainable tensor.
///
/// Stores the value, the gradient computed by the last backward pass, and the optimizer
/// [`State`].
#[derive(Debug)]
pub struct Parameter {
    value: ArrayD<f32>,
    grad: Option<ArrayD<f32>>,
    optimizer_state: Option<State>,
}

impl Parameter {
    /// Creates a parameter with `value`.
    pub fn new(value: ArrayD<f32>) -> Self {
        Self {
            value,
            grad: None,
            optimizer_state: None,
        }
    }
    /// The value.
    pub fn value(&self) -> ArrayViewD<f32> {
        self.value.view()
    }
    /// The value, mutably.
    pub fn value_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.value
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }
    /// Whether the parameter has no elements.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
    /// The gradient, if any.
    pub fn grad(&self) -> Option<ArrayViewD<f32>> {
        self.grad.as_ref().map(ArrayD::view)
    }
    /// Sets the gradient.
    ///
    /// **Errors**
    ///
    /// The shape of `grad` does not match the value.
    pub fn set_grad(&mut self, grad: ArrayD<f32>) -> Result<()> {
        ensure!(
            grad.shape() == self.value.shape(),
            "Expected gradient shape {:?}, found {:?}!",
            self.value.shape(),
            grad.shape()
        );
        self.grad.replace(grad);
        Ok(())
    }
    /// Removes the gradient.
    pub fn take_grad(&mut self) -> Option<ArrayD<f32>> {
        self.grad.take()
    }
    /// The optimizer state.
    pub fn optimizer_state(&self) -> Option<&State> {
        self.optimizer_state.as_ref()
    }
    pub(crate) fn init_optimizer_state(&mut self, state: State) {
        self.optimizer_state.replace(state);
    }
    /// The value, the gradient and the optimizer state, borrowed together.
    pub(crate) fn value_grad_state_mut(
        &mut self,
    ) -> (&mut ArrayD<f32>, Option<&ArrayD<f32>>, Option<&mut State>) {
        (
            &mut self.value,
            self.grad.as_ref(),
            self.optimizer_state.as_mut(),
        )
    }
}

/// Output of a training step.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StepOutput {
    /// The number of examples in the batch.
    pub batch_size: usize,
    /// The mean cross entropy loss.
    pub loss: f32,
    /// Top 1 accuracy in \[0, 1\].
    pub accuracy: f32,
}

/// A classifier.
///
/// Attaches a dense softmax head with `num_classes` outputs to a [`FeatureGraph`].
pub struct Classifier {
    features: FeatureGraph,
    flatten: Flatten,
    dense: Dense,
    num_classes: usize,
}

impl Classifier {
    /// Creates a classifier over `features` with `num_classes` outputs.
    ///
    /// **Errors**
    ///
    /// `num_classes` is 0 or greater than 256 (classes are `u8`).
    pub fn new<R: Rng>(features: FeatureGraph, num_classes: usize, rng: &mut R) -> Result<Self> {
        ensure!(
            (1..=256).contains(&num_classes),
            "num_classes must be in 1..=256, found {num_classes}!"
        );
        let dense = Dense::builder()
            .inputs(features.features())
            .outputs(num_classes)
            .bias(true)
            .build(rng)?;
        Ok(Self {
            features,
            flatten: Flatten::default(),
            dense,
            num_classes,
        })
    }
    /// The feature graph.
    pub fn features(&self) -> &FeatureGraph {
        &self.features
    }
    /// The number of classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
    /// The number of trainable elements.
    pub fn parameter_count(&self) -> usize {
        self.features.layers().parameter_count() + self.dense.parameter_count()
    }
    /// All parameters, feature graph first.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut parameters = self.features.layers_mut().parameters_mut();
        parameters.extend(self.dense.parameters_mut());
        parameters
    }
    /// Computes the logits for `images` without caching for backward.
    pub fn infer(&mut self, images: Array4<f32>) -> Result<ArrayD<f32>> {
        self.set_training(false)?;
        let x = self.features.layers_mut().forward(images.into_dyn())?;
        let x = self.flatten.forward(x)?;
        self.dense.forward(x)
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.features.layers_mut().set_training(training)?;
        self.flatten.set_training(training)?;
        self.dense.set_training(training)
    }
    /// Trains on one batch.
    ///
    /// Computes the forward pass, the softmax cross entropy loss against `classes`, the
    /// backward pass, and updates every parameter with `optimizer`.
    ///
    /// **Errors**
    /// - The images do not have the shape the feature graph was built for.
    /// - The number of classes does not match the number of images.
    /// - A class is not less than `num_classes`.
    pub fn train_step<O: Optimizer>(
        &mut self,
        images: Array4<f32>,
        classes: ArrayView1<u8>,
        optimizer: &O,
        learning_rate: f32,
    ) -> Result<StepOutput> {
        let batch_size = images.shape()[0];
        if batch_size != classes.len() {
            bail!(
                "Batch has {batch_size} images but {} classes!",
                classes.len()
            );
        }
        if let Some(class) = classes
            .iter()
            .copied()
            .find(|x| *x as usize >= self.num_classes)
        {
            bail!("Class {class} out of range for {} classes!", self.num_classes);
        }
        ensure!(
            images.shape()[1..] == *self.features.input_shape(),
            "Expected images with shape [_, {:?}], found {:?}!",
            self.features.input_shape(),
            images.shape()
        );
        self.set_training(true)?;
        let x = self.features.layers_mut().forward(images.into_dyn())?;
        let x = self.flatten.forward(x)?;
        let logits = self.dense.forward(x)?.into_dimensionality::<Ix2>()?;
        let correct = Accuracy.eval(logits.view(), classes)?;
        let loss = CrossEntropyLoss.eval(logits.view(), classes)?;
        let dx = self.dense.backward(loss.input_grad.into_dyn())?;
        let dx = self.flatten.backward(dx)?;
        self.features.layers_mut().backward(dx)?;
        for parameter in self.parameters_mut() {
            optimizer.update(learning_rate, parameter)?;
        }
        Ok(StepOutput {
            batch_size,
            loss: loss.value,
            accuracy: correct as f32 / batch_size.max(1) as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{architecture::Architecture, optimizer::Adam, *};
    use ndarray::{Array, Array1};
    use rand::{rngs::StdRng, SeedableRng};

    fn tiny_batch(rng: &mut StdRng) -> (Array4<f32>, Array1<u8>) {
        let images = Array::from_shape_fn([4, 3, 32, 32], |_| rng.gen::<f32>());
        let classes = Array1::from(vec![0, 1, 2, 3]);
        (images, classes)
    }

    #[test]
    fn parameter_grad_shape() {
        let mut parameter = Parameter::new(ArrayD::zeros(vec![2, 3]));
        parameter.value_mut().fill(2.);
        assert_eq!(parameter.value().sum(), 12.);
        assert!(parameter.set_grad(ArrayD::zeros(vec![3, 2])).is_err());
        parameter.set_grad(ArrayD::ones(vec![2, 3])).unwrap();
        assert_eq!(parameter.grad().unwrap().sum(), 6.);
        assert!(parameter.take_grad().is_some());
        assert!(parameter.grad().is_none());
    }

    #[test]
    fn resnet_loss_decreases() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let features = Architecture::Resnet { depth: 8 }.build([3, 32, 32], &mut rng)?;
        let mut classifier = Classifier::new(features, 10, &mut rng)?;
        let (images, classes) = tiny_batch(&mut rng);
        let optimizer = Adam::default();
        let first = classifier.train_step(images.clone(), classes.view(), &optimizer, 0.01)?;
        assert_eq!(first.batch_size, 4);
        assert!(first.loss.is_finite());
        let mut last = first;
        for _ in 0..10 {
            last = classifier.train_step(images.clone(), classes.view(), &optimizer, 0.01)?;
        }
        assert!(last.loss < first.loss, "{} >= {}", last.loss, first.loss);
        Ok(())
    }

    #[test]
    fn rejects_bad_batches() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let features = Architecture::Resnet { depth: 8 }.build([3, 32, 32], &mut rng)?;
        let mut classifier = Classifier::new(features, 10, &mut rng)?;
        let optimizer = Adam::default();
        let images = Array4::zeros([2, 3, 32, 32]);
        let out_of_range = Array1::from(vec![0, 10]);
        assert!(classifier
            .train_step(images.clone(), out_of_range.view(), &optimizer, 0.001)
            .is_err());
        let too_few = Array1::from(vec![0]);
        assert!(classifier
            .train_step(images, too_few.view(), &optimizer, 0.001)
            .is_err());
        let wrong_shape = Array4::zeros([2, 1, 32, 32]);
        let classes = Array1::from(vec![0, 1]);
        assert!(classifier
            .train_step(wrong_shape, classes.view(), &optimizer, 0.001)
            .is_err());
        Ok(())
    }

    #[test]
    fn infer_shape() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let features = Architecture::Resnet { depth: 8 }.build([3, 32, 32], &mut rng)?;
        let mut classifier = Classifier::new(features, 10, &mut rng)?;
        let logits = classifier.infer(Array4::zeros([3, 3, 32, 32]))?;
        assert_eq!(logits.shape(), &[3, 10]);
        Ok(())
    }
}
