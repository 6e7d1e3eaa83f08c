use ndarray::{ArrayView, ArrayViewMut, Axis, Dimension, Zip};

use super::Tensor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    ReLU,
    /// Normalizes the last axis into a probability distribution
    Softmax,
    Linear,
}

impl Activation {
    /// Apply the activation to the linear output of a layer
    pub fn forward(&self, mut z: Tensor) -> Tensor {
        match self {
            Activation::ReLU => z.mapv_inplace(|x| x.max(0.0)),
            Activation::Softmax => {
                let last = Axis(z.ndim() - 1);
                for lane in z.lanes_mut(last) {
                    softmax(lane);
                }
            }
            Activation::Linear => {}
        }

        z
    }

    /// Map the gradient WRT the activated output back to the gradient WRT the linear output
    pub fn backward(&self, output: &Tensor, mut grad: Tensor) -> Tensor {
        match self {
            Activation::ReLU => {
                Zip::from(&mut grad).and(output).for_each(|g, &y| {
                    if y <= 0.0 {
                        *g = 0.0;
                    }
                });
            }
            Activation::Softmax => {
                let last = Axis(output.ndim() - 1);
                for (g, p) in grad.lanes_mut(last).into_iter().zip(output.lanes(last)) {
                    softmax_backward(g, p);
                }
            }
            Activation::Linear => {}
        }

        grad
    }
}

/// Softmax function - Convert scores into a probability distribution, in place
pub fn softmax<D: Dimension>(mut scores: ArrayViewMut<f32, D>) {
    // Shift by the max so exp never overflows
    let max = scores.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    scores.mapv_inplace(|x| (x - max).exp());
    let sum = scores.sum();
    scores.mapv_inplace(|x| x / sum);
}

// Jacobian-vector product of softmax: p * (g - <p, g>)
fn softmax_backward<D: Dimension>(mut grad: ArrayViewMut<f32, D>, probs: ArrayView<f32, D>) {
    let dot: f32 = grad.iter().zip(probs.iter()).map(|(g, p)| g * p).sum();
    Zip::from(&mut grad)
        .and(&probs)
        .for_each(|g, &p| *g = p * (*g - dot));
}
