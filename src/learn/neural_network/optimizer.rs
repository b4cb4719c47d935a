use super::Parameter;
use crate::result::Result;
use anyhow::{bail, ensure};
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating an [`Adam`].
    #[derive(Debug)]
    pub struct AdamBuilder {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    }

    impl AdamBuilder {
        pub(super) fn new() -> Self {
            Self {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            }
        }
        /// Decay of the first moment. Default is 0.9.
        pub fn beta1(self, beta1: f32) -> Self {
            Self { beta1, ..self }
        }
        /// Decay of the second moment. Default is 0.999.
        pub fn beta2(self, beta2: f32) -> Self {
            Self { beta2, ..self }
        }
        /// Added to the denominator. Default is 1e-8.
        pub fn epsilon(self, epsilon: f32) -> Self {
            Self { epsilon, ..self }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        ///
        /// The betas are not in \[0, 1) or epsilon is not positive.
        pub fn build(self) -> Result<Adam> {
            let Self {
                beta1,
                beta2,
                epsilon,
            } = self;
            ensure!(
                (0. ..1.).contains(&beta1) && (0. ..1.).contains(&beta2),
                "Adam betas must be in [0, 1), found {beta1} and {beta2}!"
            );
            ensure!(epsilon > 0., "Adam epsilon must be positive, found {epsilon}!");
            Ok(Adam {
                beta1,
                beta2,
                epsilon,
            })
        }
    }
}
use builder::*;

/// Optimizer State.
///
/// Stores per parameter training progress: the number of updates and named moment tensors with
/// the shape of the parameter.
#[derive(Debug, Serialize, Deserialize)]
pub struct State {
    name: String,
    step: u64,
    key_values: Vec<(String, ArrayD<f32>)>,
}

impl State {
    pub(crate) fn new(name: impl Into<String>, key_values: Vec<(String, ArrayD<f32>)>) -> Self {
        Self {
            name: name.into(),
            step: 0,
            key_values,
        }
    }
    /// Name of the [`Optimizer`].
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The number of updates applied.
    pub fn step(&self) -> u64 {
        self.step
    }
    /// Iterator over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.key_values
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }
    fn matches(&self, name: &str, shape: &[usize]) -> bool {
        self.name == name && self.key_values.iter().all(|(_, x)| x.shape() == shape)
    }
}

/// Optimizer.
pub trait Optimizer {
    /// Performs the optimization, updating the parameter with `learning_rate`.
    ///
    /// Parameters without a gradient are left unchanged. The gradient is consumed.
    fn update(&self, learning_rate: f32, parameter: &mut Parameter) -> Result<()>;
}

/// Adam.
///
/// Keeps exponential moving averages of the gradient and its square, with bias correction.
/// See [Adam: A Method for Stochastic Optimization](https://arxiv.org/abs/1412.6980).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl Adam {
    /// An Adam builder.
    pub fn builder() -> AdamBuilder {
        AdamBuilder::new()
    }
    fn init_state(&self, parameter: &mut Parameter) {
        if let Some(state) = parameter.optimizer_state() {
            if state.matches("Adam", parameter.shape()) {
                return;
            }
        }
        let zeros = || ArrayD::zeros(parameter.value().raw_dim());
        let key_values = vec![
            ("moment1".to_string(), zeros()),
            ("moment2".to_string(), zeros()),
        ];
        parameter.init_optimizer_state(State::new("Adam", key_values));
    }
}

impl Optimizer for Adam {
    fn update(&self, learning_rate: f32, parameter: &mut Parameter) -> Result<()> {
        if parameter.grad().is_none() {
            return Ok(());
        }
        self.init_state(parameter);
        let Self {
            beta1,
            beta2,
            epsilon,
        } = *self;
        let (value, grad, state) = parameter.value_grad_state_mut();
        let (Some(grad), Some(state)) = (grad, state) else {
            return Ok(());
        };
        state.step += 1;
        let step = state.step.min(i32::MAX as u64) as i32;
        let correction1 = 1. - beta1.powi(step);
        let correction2 = 1. - beta2.powi(step);
        let step_size = learning_rate * correction2.sqrt() / correction1;
        let [(_, moment1), (_, moment2)] = state.key_values.as_mut_slice() else {
            bail!("Expected Adam state with 2 moments!");
        };
        Zip::from(value)
            .and(grad)
            .and(moment1)
            .and(moment2)
            .for_each(|value, &grad, moment1, moment2| {
                *moment1 = beta1 * *moment1 + (1. - beta1) * grad;
                *moment2 = beta2 * *moment2 + (1. - beta2) * grad * grad;
                *value -= step_size * *moment1 / (moment2.sqrt() + epsilon);
            });
        parameter.take_grad();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::IxDyn;

    #[test]
    fn adam_descends() -> Result<()> {
        let mut parameter = Parameter::new(ArrayD::from_elem(IxDyn(&[3]), 1.));
        let grad = ndarray::arr1(&[1., -1., 0.]).into_dyn();
        parameter.set_grad(grad)?;
        Adam::default().update(0.1, &mut parameter)?;
        let value: Vec<f32> = parameter.value().iter().copied().collect();
        // first step moves by the learning rate in the direction of -sign(grad)
        assert_relative_eq!(value[0], 0.9, epsilon = 1e-5);
        assert_relative_eq!(value[1], 1.1, epsilon = 1e-5);
        assert_relative_eq!(value[2], 1., epsilon = 1e-5);
        let state = parameter.optimizer_state().unwrap();
        assert_eq!(state.name(), "Adam");
        assert_eq!(state.step(), 1);
        assert_eq!(state.iter().count(), 2);
        assert!(parameter.grad().is_none());
        Ok(())
    }

    #[test]
    fn adam_skips_without_grad() -> Result<()> {
        let mut parameter = Parameter::new(ArrayD::from_elem(IxDyn(&[2]), 1.));
        Adam::default().update(0.1, &mut parameter)?;
        assert!(parameter.optimizer_state().is_none());
        assert_eq!(parameter.value().sum(), 2.);
        Ok(())
    }

    #[test]
    fn adam_minimizes_quadratic() -> Result<()> {
        let optimizer = Adam::builder().beta1(0.8).build()?;
        let mut parameter = Parameter::new(ArrayD::from_elem(IxDyn(&[1]), 3.));
        for _ in 0..500 {
            let grad = parameter.value().mapv(|x| 2. * x);
            parameter.set_grad(grad)?;
            optimizer.update(0.05, &mut parameter)?;
        }
        assert_relative_eq!(parameter.value().sum(), 0., epsilon = 5e-2);
        Ok(())
    }

    #[test]
    fn adam_builder_validates() {
        assert!(Adam::builder().beta1(1.).build().is_err());
        assert!(Adam::builder().epsilon(0.).build().is_err());
    }
}
