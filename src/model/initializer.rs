use ndarray::{Array, Dimension, ShapeBuilder};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::Normal;

use crate::error::{Error, Result};

/// Weight initialization method
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Initializer {
    /// Samples from N(mean, std_dev^2)
    Normal { mean: f32, std_dev: f32 },
    /// Uniform in [-limit, limit] with limit = sqrt(6 / (fan_in + fan_out))
    GlorotUniform,
    Zeros,
}

impl Initializer {
    /// Draw a new parameter array of the given shape
    pub fn init<D, Sh, R>(&self, shape: Sh, fan_in: usize, fan_out: usize, rng: &mut R) -> Result<Array<f32, D>>
    where
        D: Dimension,
        Sh: ShapeBuilder<Dim = D>,
        R: Rng + ?Sized,
    {
        match *self {
            Initializer::Normal { mean, std_dev } => {
                if !(std_dev >= 0.0 && std_dev.is_finite()) {
                    return Err(Error::InvalidInitializer(format!(
                        "normal({}, {}): standard deviation must be finite and non-negative",
                        mean, std_dev
                    )));
                }
                let distribution = Normal::new(mean, std_dev)
                    .map_err(|e| Error::InvalidInitializer(format!("normal({}, {}): {}", mean, std_dev, e)))?;
                Ok(Array::from_shape_simple_fn(shape, || distribution.sample(&mut *rng)))
            }
            Initializer::GlorotUniform => {
                if fan_in + fan_out == 0 {
                    return Err(Error::InvalidInitializer(
                        "glorot uniform needs a non-zero fan".to_string(),
                    ));
                }
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                let distribution = Uniform::new_inclusive(-limit, limit);
                Ok(Array::from_shape_simple_fn(shape, || distribution.sample(&mut *rng)))
            }
            Initializer::Zeros => Ok(Array::zeros(shape)),
        }
    }
}
