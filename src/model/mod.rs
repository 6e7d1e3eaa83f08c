use ndarray::{Array2, ArrayD, ArrayView4};
use serde::Serialize;

use crate::error::Result;
use crate::parsing::mnist::{HEIGHT, WIDTH};
use crate::parsing::preprocess::{ImageTensor, LabelTensor, NUM_CLASSES};

pub mod activation;
pub mod initializer;
pub mod layers;
pub mod loss;
pub mod optimizer;
pub mod sequential;

use activation::Activation;
use initializer::Initializer;
use layers::{LayerSpec, Padding};
use loss::Loss;
use optimizer::AdamConfig;
use sequential::{CompileSpec, Sequential};

/// Type alias for n-dimensional arrays flowing between layers
pub type Tensor = ArrayD<f32>;

pub trait Model {
    fn fit(
        &mut self,
        images: &ImageTensor,
        labels: &LabelTensor,
        num_epochs: usize,
        batch_size: usize,
    ) -> Result<History>;
    fn evaluate(&mut self, images: &ImageTensor, labels: &LabelTensor) -> Result<Evaluation>;
    fn predict(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>>;
}

/// Training metrics of one epoch
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct History {
    pub epochs: Vec<EpochStats>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
    pub mistakes: usize,
    pub samples: usize,
}

impl Evaluation {
    /// Console line reporting the test accuracy
    pub fn accuracy_line(&self) -> String {
        format!("We got {:.1}% accuracy in our testing set.", percent(self.accuracy))
    }

    /// Console line reporting the test loss, formatted as a percentage
    pub fn error_rate_line(&self) -> String {
        format!("Our error rate was {:.1}%.", percent(self.loss))
    }
}

// Scale in f64 so rounding to one decimal matches the stored value
fn percent(fraction: f32) -> f64 {
    f64::from(fraction) * 100.0
}

pub const NUM_EPOCHS: usize = 9;
pub const BATCH_SIZE: usize = 150;

const FILTERS: usize = 32;
const KERNEL_SIZE: usize = 5;
const POOL_SIZE: usize = 2;
const DROPOUT_RATE: f64 = 0.25;
const HIDDEN_UNITS: usize = 128;
const HIDDEN_INITIALIZER: Initializer = Initializer::Normal {
    mean: 0.0,
    std_dev: 0.05,
};

/// The digit classifier: conv(32, 5x5) -> max pool -> dropout -> flatten -> dense(128) -> dense(10)
pub fn digit_classifier(seed: Option<u64>) -> Result<Sequential> {
    Sequential::builder(&[1, HEIGHT, WIDTH])
        .layer(LayerSpec::Conv2d {
            filters: FILTERS,
            kernel_size: KERNEL_SIZE,
            padding: Padding::Same,
            activation: Activation::ReLU,
            initializer: Initializer::GlorotUniform,
        })
        .layer(LayerSpec::MaxPool2d {
            pool_size: POOL_SIZE,
            padding: Padding::Same,
        })
        .layer(LayerSpec::Dropout { rate: DROPOUT_RATE })
        .layer(LayerSpec::Flatten)
        .layer(LayerSpec::Dense {
            units: HIDDEN_UNITS,
            activation: Activation::ReLU,
            initializer: HIDDEN_INITIALIZER,
        })
        .layer(LayerSpec::Dense {
            units: NUM_CLASSES,
            activation: Activation::Softmax,
            initializer: Initializer::GlorotUniform,
        })
        .compile(
            CompileSpec {
                loss: Loss::CategoricalCrossEntropy,
                optimizer: AdamConfig::default(),
            },
            seed,
        )
}
