use ndarray::{ArrayD, Zip};

use super::layers::ParamMut;

/// Adam configuration. Defaults follow the paper, with epsilon 1e-7.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta_1: f32,
    pub beta_2: f32,
    /// A value required for numerical stability
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            learning_rate: 0.001,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
        }
    }
}

impl AdamConfig {
    pub fn init(&self) -> Adam {
        Adam {
            config: *self,
            time: 0,
            moments: Vec::new(),
        }
    }
}

struct AdaptiveMomentum {
    moment_1: ArrayD<f32>,
    moment_2: ArrayD<f32>,
}

/// Adam optimizer as described in [Adam: A Method for Stochastic Optimization](https://arxiv.org/abs/1412.6980).
///
/// Moment estimates are kept per parameter, matched by position, so the parameters
/// must be handed to [`Adam::step`] in the same order on every call.
pub struct Adam {
    config: AdamConfig,
    time: i32,
    moments: Vec<AdaptiveMomentum>,
}

impl Adam {
    /// Number of updates applied so far
    pub fn steps(&self) -> usize {
        self.time as usize
    }

    pub fn step(&mut self, params: Vec<ParamMut<'_>>) {
        self.time += 1;

        let AdamConfig {
            learning_rate,
            beta_1,
            beta_2,
            epsilon,
        } = self.config;
        // bias correction folded into the step size
        let lr = learning_rate * (1.0 - beta_2.powi(self.time)).sqrt() / (1.0 - beta_1.powi(self.time));

        for (i, mut param) in params.into_iter().enumerate() {
            if i == self.moments.len() {
                self.moments.push(AdaptiveMomentum {
                    moment_1: ArrayD::zeros(param.value.raw_dim()),
                    moment_2: ArrayD::zeros(param.value.raw_dim()),
                });
            }
            let state = &mut self.moments[i];

            Zip::from(&mut param.value)
                .and(&mut state.moment_1)
                .and(&mut state.moment_2)
                .and(&param.grad)
                .for_each(|w, m, v, &g| {
                    *m = beta_1 * *m + (1.0 - beta_1) * g;
                    *v = beta_2 * *v + (1.0 - beta_2) * g * g;
                    *w -= lr * *m / (v.sqrt() + epsilon);
                });
        }
    }
}
