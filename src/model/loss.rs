use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};

/// Predictions are clipped to [EPSILON, 1 - EPSILON] before taking the log
pub const EPSILON: f32 = 1e-7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Loss {
    /// -sum(y * ln(p)) over classes, averaged over the batch
    CategoricalCrossEntropy,
}

impl Loss {
    /// Calculate the loss on a given batch
    pub fn compute(&self, predictions: ArrayView2<f32>, target: ArrayView2<f32>) -> f32 {
        match self {
            Loss::CategoricalCrossEntropy => {
                let total: f32 = predictions
                    .axis_iter(Axis(0))
                    .zip(target.axis_iter(Axis(0)))
                    .map(|(actual_row, target_row)| target_row.dot(&actual_row.mapv(|p| clip(p).ln())))
                    .sum();

                -total / predictions.nrows() as f32
            }
        }
    }

    /// Gradient of the batch loss WRT the predictions
    pub fn gradient(&self, predictions: ArrayView2<f32>, target: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Loss::CategoricalCrossEntropy => {
                let n = predictions.nrows() as f32;
                let mut grad = Array2::zeros(predictions.raw_dim());
                Zip::from(&mut grad)
                    .and(&predictions)
                    .and(&target)
                    .for_each(|g, &p, &y| *g = -y / (clip(p) * n));
                grad
            }
        }
    }

    /// Gradient of the batch loss WRT the logits of a softmax output layer.
    /// Cross-entropy through softmax collapses to `(p - y) / n`, which keeps its
    /// full size where the true class probability underflows the clip.
    pub fn softmax_gradient(&self, predictions: ArrayView2<f32>, target: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Loss::CategoricalCrossEntropy => {
                let n = predictions.nrows() as f32;
                (&predictions - &target) / n
            }
        }
    }
}

fn clip(p: f32) -> f32 {
    p.clamp(EPSILON, 1.0 - EPSILON)
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map_or(0, |(i, _)| i)
}

/// Number of rows whose most probable class is the labelled one
pub fn correct_predictions(predictions: ArrayView2<f32>, target: ArrayView2<f32>) -> usize {
    predictions
        .axis_iter(Axis(0))
        .zip(target.axis_iter(Axis(0)))
        .filter(|(prediction, target_row)| argmax(prediction.view()) == argmax(target_row.view()))
        .count()
}

/// Fraction of rows whose most probable class is the labelled one
pub fn accuracy(predictions: ArrayView2<f32>, target: ArrayView2<f32>) -> f32 {
    if predictions.nrows() == 0 {
        return 0.0;
    }
    correct_predictions(predictions, target) as f32 / predictions.nrows() as f32
}
