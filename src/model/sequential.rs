use log::{debug, info};
use ndarray::{concatenate, Array2, ArrayD, ArrayView2, ArrayView4, Axis, Ix2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::activation::Activation;
use super::layers::{Layer, LayerSpec, Phase};
use super::loss::{correct_predictions, Loss};
use super::optimizer::{Adam, AdamConfig};
use super::{EpochStats, Evaluation, History, Model, Tensor};
use crate::error::{Error, Result};
use crate::parsing::preprocess::{format_shape, ImageTensor, LabelTensor};

/// Samples per forward pass when evaluating or predicting
const INFERENCE_BATCH_SIZE: usize = 500;

/// Everything bound to the layer stack at compile time
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompileSpec {
    pub loss: Loss,
    pub optimizer: AdamConfig,
}

/// Collects layer descriptors in order until [`SequentialBuilder::compile`] turns them into a model
#[derive(Clone, Debug)]
pub struct SequentialBuilder {
    input_shape: Vec<usize>,
    specs: Vec<LayerSpec>,
}

impl SequentialBuilder {
    pub fn layer(mut self, spec: LayerSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Resolve shapes, initialize every parameter and bind the loss and optimizer.
    /// Without a seed the random state comes from the OS.
    pub fn compile(self, compile: CompileSpec, seed: Option<u64>) -> Result<Sequential> {
        if self.specs.is_empty() {
            return Err(Error::InvalidLayer("a model needs at least one layer".to_string()));
        }

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut layers = Vec::with_capacity(self.specs.len());
        let mut shape = self.input_shape.clone();
        for spec in &self.specs {
            let layer = spec.build(&shape, &mut rng)?;
            shape = layer.output_shape().to_vec();
            layers.push(layer);
        }

        if shape.len() != 1 {
            return Err(Error::InvalidLayer(format!(
                "the last layer must produce one score per class, got per-sample shape {:?}",
                shape
            )));
        }

        Ok(Sequential {
            input_shape: self.input_shape,
            layers,
            loss: compile.loss,
            optimizer: compile.optimizer.init(),
            rng,
        })
    }
}

/// A compiled stack of layers applied in order
pub struct Sequential {
    input_shape: Vec<usize>,
    layers: Vec<Box<dyn Layer>>,
    loss: Loss,
    optimizer: Adam,
    rng: StdRng,
}

impl Sequential {
    /// Start declaring a model whose samples have the given shape
    pub fn builder(input_shape: &[usize]) -> SequentialBuilder {
        SequentialBuilder {
            input_shape: input_shape.to_vec(),
            specs: Vec::new(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.layers
            .last()
            .map_or(0, |layer| layer.output_shape()[0])
    }

    /// Copy of every learnable parameter, in layer order
    pub fn parameters(&self) -> Vec<ArrayD<f32>> {
        self.layers
            .iter()
            .flat_map(|layer| layer.params())
            .map(|param| param.to_owned())
            .collect()
    }

    pub fn param_count(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|layer| layer.params())
            .map(|param| param.len())
            .sum()
    }

    /// Number of optimizer updates applied so far
    pub fn steps(&self) -> usize {
        self.optimizer.steps()
    }

    /// A table of the layers with their output shapes and parameter counts
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("{:<12} {:<20} {:>10}", "layer", "output shape", "params")];
        lines.push(format!("{:<12} {:<20} {:>10}", "input", format_shape(&self.input_shape), 0));

        for layer in &self.layers {
            let params: usize = layer.params().iter().map(|p| p.len()).sum();
            lines.push(format!(
                "{:<12} {:<20} {:>10}",
                layer.name(),
                format_shape(layer.output_shape()),
                params
            ));
        }
        lines.push(format!("total params: {}", self.param_count()));

        lines.join("\n")
    }

    // Perform a forward pass of the network on a batch.
    // Returns the class probabilities of every sample.
    fn forward(&mut self, input: Tensor, phase: Phase) -> Result<Array2<f32>> {
        let mut x = input;

        for layer in self.layers.iter_mut() {
            x = layer.forward(x, phase)?;
        }

        Ok(x.into_dimensionality::<Ix2>()?)
    }

    /// Backpropagate the loss of a batch through every layer
    fn backward(&mut self, predictions: ArrayView2<f32>, target: ArrayView2<f32>) -> Result<()> {
        let loss = self.loss;
        let mut layers = self.layers.iter_mut().rev();

        let mut grad = match layers.next() {
            Some(output) if output.activation() == Activation::Softmax => {
                output.backward_linear(loss.softmax_gradient(predictions, target).into_dyn())?
            }
            Some(output) => output.backward(loss.gradient(predictions, target).into_dyn())?,
            None => return Ok(()),
        };

        for layer in layers {
            grad = layer.backward(grad)?;
        }

        Ok(())
    }

    /// One optimizer update on a mini-batch. Returns the batch loss and the number of correct predictions.
    fn train_batch(&mut self, input: Tensor, target: ArrayView2<f32>) -> Result<(f32, usize)> {
        let predictions = self.forward(input, Phase::Train)?;
        let loss = self.loss.compute(predictions.view(), target);
        let correct = correct_predictions(predictions.view(), target);

        self.backward(predictions.view(), target)?;
        self.optimizer
            .step(self.layers.iter_mut().flat_map(|layer| layer.params_mut()).collect());

        Ok((loss, correct))
    }

    fn check_dataset(&self, images: usize, labels: &LabelTensor) -> Result<()> {
        if images != labels.len() {
            return Err(Error::CountMismatch {
                images,
                labels: labels.len(),
            });
        }
        if images == 0 {
            return Err(Error::EmptyDataset);
        }

        let (_, classes) = labels.view().dim();
        if classes != self.num_classes() {
            return Err(Error::ShapeMismatch {
                expected: vec![labels.len(), self.num_classes()],
                got: vec![labels.len(), classes],
            });
        }

        Ok(())
    }
}

impl Model for Sequential {
    /// Fit the model to the dataset
    /// Return the loss and accuracy of every epoch
    fn fit(
        &mut self,
        images: &ImageTensor,
        labels: &LabelTensor,
        num_epochs: usize,
        batch_size: usize,
    ) -> Result<History> {
        if batch_size == 0 {
            return Err(Error::ZeroBatchSize);
        }
        self.check_dataset(images.len(), labels)?;

        let num_samples = images.len();
        let mut order: Vec<usize> = (0..num_samples).collect();
        let mut history = History::default();

        for epoch in 1..=num_epochs {
            order.shuffle(&mut self.rng);

            let mut total_loss = 0.0;
            let mut correct = 0;

            // Get a batch of instances and their targets
            for batch in order.chunks(batch_size) {
                let input = images.view().select(Axis(0), batch).into_dyn();
                let target = labels.view().select(Axis(0), batch);
                let (loss, batch_correct) = self.train_batch(input, target.view())?;

                total_loss += loss * batch.len() as f32;
                correct += batch_correct;
            }

            let stats = EpochStats {
                epoch,
                loss: total_loss / num_samples as f32,
                accuracy: correct as f32 / num_samples as f32,
            };
            info!(
                "epoch {}/{}: loss {:.4}, accuracy {:.4}",
                epoch, num_epochs, stats.loss, stats.accuracy
            );
            debug!("{} optimizer steps so far", self.steps());
            history.epochs.push(stats);
        }

        Ok(history)
    }

    fn evaluate(&mut self, images: &ImageTensor, labels: &LabelTensor) -> Result<Evaluation> {
        self.check_dataset(images.len(), labels)?;

        let mut total_loss = 0.0;
        let mut correct = 0;

        for (input, target) in images
            .view()
            .axis_chunks_iter(Axis(0), INFERENCE_BATCH_SIZE)
            .zip(labels.view().axis_chunks_iter(Axis(0), INFERENCE_BATCH_SIZE))
        {
            let predictions = self.forward(input.to_owned().into_dyn(), Phase::Infer)?;
            total_loss += self.loss.compute(predictions.view(), target) * target.nrows() as f32;
            correct += correct_predictions(predictions.view(), target);
        }

        let samples = images.len();
        let evaluation = Evaluation {
            loss: total_loss / samples as f32,
            accuracy: correct as f32 / samples as f32,
            mistakes: samples - correct,
            samples,
        };
        info!(
            "evaluated {} samples: loss {:.4}, {} mistakes",
            samples, evaluation.loss, evaluation.mistakes
        );

        Ok(evaluation)
    }

    /// Predict the probabilities for a set of images
    fn predict(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        if images.is_empty() {
            return Err(Error::EmptyDataset);
        }

        let mut batches = Vec::new();
        for input in images.axis_chunks_iter(Axis(0), INFERENCE_BATCH_SIZE) {
            batches.push(self.forward(input.to_owned().into_dyn(), Phase::Infer)?);
        }

        let views: Vec<ArrayView2<f32>> = batches.iter().map(|b| b.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::initializer::Initializer;
    use crate::model::layers::Padding;
    use crate::model::loss::EPSILON;
    use crate::parsing::preprocess::{normalize, one_hot, reshape_images};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array3, IxDyn};

    fn compile_spec(learning_rate: f32) -> CompileSpec {
        CompileSpec {
            loss: Loss::CategoricalCrossEntropy,
            optimizer: AdamConfig {
                learning_rate,
                ..AdamConfig::default()
            },
        }
    }

    /// 28x28 images lit on the top half (class 0) or the bottom half (class 1)
    fn halves(count: usize) -> (ImageTensor, LabelTensor) {
        let raw = Array3::from_shape_fn((count, 28, 28), |(n, r, _)| {
            let top = n % 2 == 0;
            if (r < 14) == top {
                200 + (n % 50) as u8
            } else {
                (n % 30) as u8
            }
        });
        let labels = Array1::from_shape_fn(count, |n| (n % 2) as u8);

        (
            normalize(reshape_images(&raw).unwrap()),
            one_hot(&labels, 2).unwrap(),
        )
    }

    fn pooled_classifier(seed: u64) -> Sequential {
        Sequential::builder(&[1, 28, 28])
            .layer(LayerSpec::MaxPool2d {
                pool_size: 4,
                padding: Padding::Valid,
            })
            .layer(LayerSpec::Flatten)
            .layer(LayerSpec::Dense {
                units: 2,
                activation: Activation::Softmax,
                initializer: Initializer::GlorotUniform,
            })
            .compile(compile_spec(0.01), Some(seed))
            .unwrap()
    }

    fn small_convnet() -> Sequential {
        Sequential::builder(&[1, 4, 4])
            .layer(LayerSpec::Conv2d {
                filters: 2,
                kernel_size: 3,
                padding: Padding::Same,
                activation: Activation::Linear,
                initializer: Initializer::GlorotUniform,
            })
            .layer(LayerSpec::Flatten)
            .layer(LayerSpec::Dense {
                units: 3,
                activation: Activation::Softmax,
                initializer: Initializer::Normal {
                    mean: 0.0,
                    std_dev: 0.3,
                },
            })
            .compile(compile_spec(0.001), Some(3))
            .unwrap()
    }

    fn batch_loss(model: &mut Sequential, input: &Tensor, target: &Array2<f32>) -> f32 {
        let predictions = model.forward(input.clone(), Phase::Infer).unwrap();
        model.loss.compute(predictions.view(), target.view())
    }

    fn nudge(model: &mut Sequential, layer: usize, param: usize, index: usize, delta: f32) {
        let mut params = model.layers[layer].params_mut();
        params[param].value.as_slice_mut().unwrap()[index] += delta;
    }

    #[test]
    fn backprop_matches_finite_differences() {
        let mut model = small_convnet();
        let input = Tensor::from_shape_fn(IxDyn(&[2, 1, 4, 4]), |i| {
            ((i[0] * 16 + i[2] * 4 + i[3]) as f32 * 0.37).sin()
        });
        let target = ndarray::arr2(&[[0.0f32, 1.0, 0.0], [0.0, 0.0, 1.0]]);

        let predictions = model.forward(input.clone(), Phase::Train).unwrap();
        model.backward(predictions.view(), target.view()).unwrap();

        // (layer, param, flat index): conv kernel, conv bias, dense kernel, dense bias
        let probes = [(0, 0, 0), (0, 0, 13), (0, 1, 1), (2, 0, 5), (2, 0, 30), (2, 1, 2)];
        let h = 1e-2;
        for &(layer, param, index) in &probes {
            let analytic = model.layers[layer].params_mut()[param].grad.as_slice().unwrap()[index];

            nudge(&mut model, layer, param, index, h);
            let plus = batch_loss(&mut model, &input, &target);
            nudge(&mut model, layer, param, index, -2.0 * h);
            let minus = batch_loss(&mut model, &input, &target);
            nudge(&mut model, layer, param, index, h);

            let numeric = (plus - minus) / (2.0 * h);
            assert_abs_diff_eq!(analytic, numeric, epsilon = 2e-3);
        }
    }

    #[test]
    fn confidently_wrong_softmax_output_still_learns() {
        let mut model = Sequential::builder(&[1])
            .layer(LayerSpec::Dense {
                units: 2,
                activation: Activation::Softmax,
                initializer: Initializer::Zeros,
            })
            .compile(compile_spec(0.001), Some(0))
            .unwrap();
        model.layers[0].params_mut()[1]
            .value
            .assign(&ndarray::arr1(&[20.0f32, -20.0]).into_dyn());

        let input = Tensor::ones(IxDyn(&[1, 1]));
        let target = ndarray::arr2(&[[0.0f32, 1.0]]);
        let predictions = model.forward(input, Phase::Train).unwrap();
        assert!(predictions[[0, 1]] < EPSILON);

        model.backward(predictions.view(), target.view()).unwrap();
        let bias_grad: Vec<f32> = model.layers[0].params_mut()[1].grad.iter().cloned().collect();
        assert_abs_diff_eq!(bias_grad[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(bias_grad[1], -1.0, epsilon = 1e-5);
    }

    #[test]
    fn compile_rejects_empty_and_unflattened_stacks() {
        let empty = Sequential::builder(&[1, 28, 28]).compile(compile_spec(0.001), Some(0));
        assert!(matches!(empty, Err(Error::InvalidLayer(_))));

        let spatial = Sequential::builder(&[1, 28, 28])
            .layer(LayerSpec::MaxPool2d {
                pool_size: 2,
                padding: Padding::Same,
            })
            .compile(compile_spec(0.001), Some(0));
        assert!(matches!(spatial, Err(Error::InvalidLayer(_))));
    }

    #[test]
    fn same_seed_gives_same_parameters() {
        assert_eq!(pooled_classifier(5).parameters(), pooled_classifier(5).parameters());
        assert_ne!(pooled_classifier(5).parameters(), pooled_classifier(6).parameters());
    }

    #[test]
    fn zero_epochs_leave_parameters_untouched() {
        let (images, labels) = halves(10);
        let mut model = pooled_classifier(1);
        let before = model.parameters();

        let history = model.fit(&images, &labels, 0, 4).unwrap();
        assert!(history.epochs.is_empty());
        assert_eq!(model.parameters(), before);
        assert_eq!(model.steps(), 0);

        let evaluation = model.evaluate(&images, &labels).unwrap();
        assert!(evaluation.loss.is_finite());
        assert!((0.0..=1.0).contains(&evaluation.accuracy));
        assert_eq!(evaluation.samples, 10);
    }

    #[test]
    fn batches_partition_every_epoch() {
        let (images, labels) = halves(10);
        let mut model = pooled_classifier(1);

        model.fit(&images, &labels, 2, 4).unwrap();
        // 4 + 4 + 2 per epoch
        assert_eq!(model.steps(), 6);
    }

    #[test]
    fn oversized_batch_becomes_one_batch() {
        let (images, labels) = halves(6);
        let mut model = pooled_classifier(1);

        let history = model.fit(&images, &labels, 3, 150).unwrap();
        assert_eq!(history.epochs.len(), 3);
        assert_eq!(model.steps(), 3);
    }

    #[test]
    fn rejects_bad_training_input() {
        let (images, labels) = halves(6);
        let (_, fewer_labels) = halves(4);
        let mut model = pooled_classifier(1);

        assert!(matches!(
            model.fit(&images, &labels, 1, 0),
            Err(Error::ZeroBatchSize)
        ));
        assert!(matches!(
            model.fit(&images, &fewer_labels, 1, 2),
            Err(Error::CountMismatch { images: 6, labels: 4 })
        ));

        let ten_classes = one_hot(&Array1::from(vec![0u8; 6]), 10).unwrap();
        assert!(matches!(
            model.evaluate(&images, &ten_classes),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn learns_a_separable_problem() {
        let (images, labels) = halves(40);
        let mut model = pooled_classifier(9);

        let history = model.fit(&images, &labels, 40, 8).unwrap();
        let first = history.epochs.first().unwrap().loss;
        let last = history.epochs.last().unwrap().loss;
        assert!(last < first, "loss went from {} to {}", first, last);

        let evaluation = model.evaluate(&images, &labels).unwrap();
        assert_eq!(evaluation.mistakes, 0);
        assert_abs_diff_eq!(evaluation.accuracy, 1.0);
    }

    #[test]
    fn predictions_are_probabilities() {
        let (images, _) = halves(7);
        let mut model = pooled_classifier(2);
        let predictions = model.predict(images.view()).unwrap();

        assert_eq!(predictions.dim(), (7, 2));
        for row in predictions.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn summary_lists_every_layer() {
        let model = pooled_classifier(0);
        let summary = model.summary();

        assert!(summary.contains("max_pool2d"));
        assert!(summary.contains("(1, 7, 7)"));
        assert!(summary.contains("(49)"));
        assert!(summary.ends_with("total params: 100"));
    }
}
