use crate::result::Result;
use anyhow::{bail, ensure};
use ndarray::{Array2, ArrayBase, ArrayView1, ArrayView2, Data, Ix1, Ix2};

/// Evaluates an output against a target.
pub trait Criterion<X, T> {
    /// The output.
    type Output;
    /// Evaluates `input` against `target`.
    ///
    /// **Errors**
    ///
    /// The input and target do not match.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

fn check_batch(input: ArrayView2<f32>, target: ArrayView1<u8>) -> Result<()> {
    ensure!(
        input.nrows() == target.len(),
        "Expected {} targets, found {}!",
        input.nrows(),
        target.len()
    );
    if let Some(class) = target.iter().find(|x| **x as usize >= input.ncols()) {
        bail!("Target {class} out of range for {} classes!", input.ncols());
    }
    Ok(())
}

/// Accuracy.
///
/// Counts the rows where the index of the maximum equals the target class.
#[derive(Default, Debug)]
pub struct Accuracy;

impl<S1: Data<Elem = f32>, S2: Data<Elem = u8>> Criterion<ArrayBase<S1, Ix2>, ArrayBase<S2, Ix1>>
    for Accuracy
{
    type Output = usize;
    fn eval(&self, input: ArrayBase<S1, Ix2>, target: ArrayBase<S2, Ix1>) -> Result<Self::Output> {
        check_batch(input.view(), target.view())?;
        Ok(accuracy_host(input.view(), target.view()))
    }
}

fn accuracy_host(input: ArrayView2<f32>, target: ArrayView1<u8>) -> usize {
    input
        .outer_iter()
        .zip(target.iter().map(|x| *x as usize))
        .filter(|(input, class)| {
            let mut max = input[0];
            let mut max_index = 0;
            for (i, x) in input.iter().copied().enumerate() {
                if x > max {
                    max = x;
                    max_index = i;
                }
            }
            max_index == *class
        })
        .count()
}

/// Row wise softmax.
pub fn softmax(input: ArrayView2<f32>) -> Array2<f32> {
    let mut y = input.to_owned();
    for mut y in y.outer_iter_mut() {
        let m = y.fold(f32::NEG_INFINITY, |m, x| m.max(*x));
        y.mapv_inplace(|x| (x - m).exp());
        let s = y.sum();
        y.mapv_inplace(|x| x / s);
    }
    y
}

/// Output of [`CrossEntropyLoss`].
#[derive(Debug)]
pub struct Loss {
    /// The mean loss over the batch.
    pub value: f32,
    /// Gradient of the mean loss with respect to the logits.
    pub input_grad: Array2<f32>,
}

/// Softmax cross entropy loss.
///
/// The input is logits, the target is class indices. The loss is averaged over the batch.
#[derive(Default, Debug)]
pub struct CrossEntropyLoss;

impl<S1: Data<Elem = f32>, S2: Data<Elem = u8>> Criterion<ArrayBase<S1, Ix2>, ArrayBase<S2, Ix1>>
    for CrossEntropyLoss
{
    type Output = Loss;
    fn eval(&self, input: ArrayBase<S1, Ix2>, target: ArrayBase<S2, Ix1>) -> Result<Self::Output> {
        check_batch(input.view(), target.view())?;
        Ok(cross_entropy_loss_host(input.view(), target.view()))
    }
}

fn cross_entropy_loss_host(input: ArrayView2<f32>, target: ArrayView1<u8>) -> Loss {
    let n = input.nrows();
    let mut sum = 0.;
    let mut input_grad = Array2::zeros(input.raw_dim());
    for ((x, t), mut dx) in input
        .outer_iter()
        .zip(target.iter().map(|x| *x as usize))
        .zip(input_grad.outer_iter_mut())
    {
        let m = x.fold(f32::NEG_INFINITY, |m, x| m.max(*x));
        let s = x.iter().map(|x| (x - m).exp()).sum::<f32>();
        sum += s.ln() - (x[t] - m);
        for (i, (dx, x)) in dx.iter_mut().zip(x.iter()).enumerate() {
            let p = (x - m).exp() / s;
            *dx = (p - if i == t { 1. } else { 0. }) / n as f32;
        }
    }
    Loss {
        value: if n > 0 { sum / n as f32 } else { 0. },
        input_grad,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn accuracy() -> Result<()> {
        let input = arr2(&[[0.1, 0.9, 0.], [0.8, 0.1, 0.1], [0., 0., 1.]]);
        let target = arr1(&[1u8, 0, 0]);
        assert_eq!(Accuracy.eval(input.view(), target.view())?, 2);
        assert!(Accuracy.eval(input.view(), arr1(&[3u8, 0, 0]).view()).is_err());
        Ok(())
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let y = softmax(arr2(&[[1., 2., 3.], [1000., 1000., 1000.]]).view());
        for row in y.outer_iter() {
            assert_relative_eq!(row.sum(), 1., epsilon = 1e-6);
        }
        assert_relative_eq!(y[[1, 0]], 1. / 3., epsilon = 1e-6);
    }

    #[test]
    fn cross_entropy_uniform() -> Result<()> {
        let input = Array2::<f32>::zeros([2, 4]);
        let loss = CrossEntropyLoss.eval(input.view(), arr1(&[0u8, 3]).view())?;
        assert_relative_eq!(loss.value, 4f32.ln(), epsilon = 1e-6);
        assert_relative_eq!(loss.input_grad[[0, 0]], (0.25 - 1.) / 2., epsilon = 1e-6);
        assert_relative_eq!(loss.input_grad[[0, 1]], 0.25 / 2., epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn cross_entropy_grad_is_softmax_minus_onehot() -> Result<()> {
        let input = arr2(&[[0.5, -1., 2.]]);
        let loss = CrossEntropyLoss.eval(input.view(), arr1(&[2u8]).view())?;
        let p = softmax(input.view());
        assert_relative_eq!(loss.value, -p[[0, 2]].ln(), epsilon = 1e-5);
        assert_relative_eq!(loss.input_grad[[0, 0]], p[[0, 0]], epsilon = 1e-6);
        assert_relative_eq!(loss.input_grad[[0, 2]], p[[0, 2]] - 1., epsilon = 1e-6);
        Ok(())
    }
}
