//! Optimizers with inspectable state and explicit gradient accumulation.
//!
//! `tch::nn::Optimizer` hides its moment buffers, which makes optimizer
//! snapshots impossible. `Adam` keeps per-parameter state the way torch does
//! (created lazily on the first gradient) so it can be saved and restored.

use crate::{Result, TppoError};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

/// Hyperparameters of an Adam/AdamW param group
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    /// AdamW: decay the parameters directly instead of adding to the gradient
    pub decoupled_weight_decay: bool,
}

impl AdamConfig {
    pub fn adam(lr: f64, eps: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps,
            weight_decay: 0.0,
            decoupled_weight_decay: false,
        }
    }

    pub fn adamw(lr: f64, eps: f64, weight_decay: f64) -> Self {
        Self {
            weight_decay,
            decoupled_weight_decay: true,
            ..Self::adam(lr, eps)
        }
    }
}

/// Moment buffers of a single parameter
pub struct ParamState {
    pub step: i64,
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
}

impl ParamState {
    fn zeros_like(var: &Tensor) -> Self {
        Self {
            step: 0,
            exp_avg: var.zeros_like(),
            exp_avg_sq: var.zeros_like(),
        }
    }

    pub fn deep_copy(&self) -> Self {
        Self {
            step: self.step,
            exp_avg: self.exp_avg.detach().copy(),
            exp_avg_sq: self.exp_avg_sq.detach().copy(),
        }
    }
}

/// Internal state of an `Adam` instance, one slot per managed variable.
/// `None` marks a parameter that has never received a gradient.
pub struct AdamState {
    pub params: Vec<Option<ParamState>>,
}

impl AdamState {
    /// Number of parameters with materialized moment buffers
    pub fn num_initialized(&self) -> usize {
        self.params.iter().filter(|p| p.is_some()).count()
    }

    /// Largest step count over all parameters
    pub fn max_step(&self) -> i64 {
        self.params
            .iter()
            .flatten()
            .map(|p| p.step)
            .max()
            .unwrap_or(0)
    }
}

/// Adam / AdamW over a fixed list of variables
pub struct Adam {
    config: AdamConfig,
    variables: Vec<Tensor>,
    state: Vec<Option<ParamState>>,
}

impl Adam {
    pub fn new(variables: Vec<Tensor>, config: AdamConfig) -> Self {
        let state = variables.iter().map(|_| None).collect();
        Self {
            config,
            variables,
            state,
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Replace the param group hyperparameters, keeping moment buffers
    pub fn set_config(&mut self, config: AdamConfig) {
        self.config = config;
    }

    pub fn variables(&self) -> &[Tensor] {
        &self.variables
    }

    /// Apply one update. Parameters whose gradient is `None` are skipped and
    /// keep their state untouched.
    pub fn step(&mut self, grads: &[Option<Tensor>]) -> Result<()> {
        if grads.len() != self.variables.len() {
            return Err(TppoError::ShapeMismatch {
                expected: vec![self.variables.len()],
                actual: vec![grads.len()],
            });
        }

        let Self {
            config,
            variables,
            state,
        } = self;

        tch::no_grad(|| -> Result<()> {
            for ((var, grad), slot) in variables.iter().zip(grads).zip(state.iter_mut()) {
                let Some(grad) = grad else { continue };
                let state = slot.get_or_insert_with(|| ParamState::zeros_like(var));
                state.step += 1;

                let mut param = var.shallow_clone();
                let grad = if config.weight_decay != 0.0 && !config.decoupled_weight_decay {
                    grad + &param * config.weight_decay
                } else {
                    grad.shallow_clone()
                };
                if config.weight_decay != 0.0 && config.decoupled_weight_decay {
                    param.f_mul_scalar_(1.0 - config.lr * config.weight_decay)?;
                }

                state.exp_avg.f_mul_scalar_(config.beta1)?;
                state.exp_avg.f_add_(&(&grad * (1.0 - config.beta1)))?;
                state.exp_avg_sq.f_mul_scalar_(config.beta2)?;
                state
                    .exp_avg_sq
                    .f_add_(&(&grad * &grad * (1.0 - config.beta2)))?;

                let bias_correction1 = 1.0 - config.beta1.powf(state.step as f64);
                let bias_correction2 = 1.0 - config.beta2.powf(state.step as f64);
                let step_size = config.lr / bias_correction1;

                let denom = state.exp_avg_sq.sqrt() / bias_correction2.sqrt() + config.eps;
                let update = &state.exp_avg / &denom * step_size;
                param.f_sub_(&update)?;
            }
            Ok(())
        })
    }

    /// Deep copy of the internal state
    pub fn state(&self) -> AdamState {
        AdamState {
            params: self
                .state
                .iter()
                .map(|s| s.as_ref().map(ParamState::deep_copy))
                .collect(),
        }
    }

    /// Restore state captured by `state()`, moving buffers onto the device of
    /// the matching variable
    pub fn load_state(&mut self, state: AdamState) -> Result<()> {
        let prepared = self.prepare_state(state)?;
        self.commit_state(prepared);
        Ok(())
    }

    /// Check `state` against the managed variables and move its buffers onto
    /// their devices without touching the live state
    pub fn prepare_state(&self, state: AdamState) -> Result<PreparedState> {
        if state.params.len() != self.variables.len() {
            return Err(TppoError::Checkpoint(format!(
                "optimizer manages {} parameters, snapshot has {}",
                self.variables.len(),
                state.params.len()
            )));
        }

        let mut restored = Vec::with_capacity(state.params.len());
        for (idx, (var, param)) in self.variables.iter().zip(state.params).enumerate() {
            let param = match param {
                None => None,
                Some(p) => {
                    for buffer in [&p.exp_avg, &p.exp_avg_sq] {
                        if buffer.size() != var.size() {
                            return Err(TppoError::Checkpoint(format!(
                                "parameter {} has shape {:?}, snapshot buffer has {:?}",
                                idx,
                                var.size(),
                                buffer.size()
                            )));
                        }
                    }
                    Some(ParamState {
                        step: p.step,
                        exp_avg: p.exp_avg.to_device(var.device()).to_kind(var.kind()),
                        exp_avg_sq: p.exp_avg_sq.to_device(var.device()).to_kind(var.kind()),
                    })
                }
            };
            restored.push(param);
        }
        Ok(PreparedState(restored))
    }

    /// Replace the live state with one produced by `prepare_state`
    pub fn commit_state(&mut self, prepared: PreparedState) {
        self.state = prepared.0;
    }
}

/// State validated against one `Adam` instance by `Adam::prepare_state`
pub struct PreparedState(Vec<Option<ParamState>>);

/// Sum of gradients over sequential backward passes.
///
/// After every chunk's `backward`, `fold` moves the freshly computed `.grad`
/// of each variable into the accumulator and zeroes it, so the accumulator is
/// the only place gradients live between chunks.
pub struct GradAccumulator {
    variables: Vec<Tensor>,
    sums: Vec<Option<Tensor>>,
}

impl GradAccumulator {
    /// Start an empty accumulator, clearing any stale `.grad` on `variables`
    pub fn new(variables: &[Tensor]) -> Self {
        let variables: Vec<Tensor> = variables.iter().map(Tensor::shallow_clone).collect();
        for var in &variables {
            var.shallow_clone().zero_grad();
        }
        let sums = variables.iter().map(|_| None).collect();
        Self { variables, sums }
    }

    pub fn fold(&mut self) -> Result<()> {
        tch::no_grad(|| -> Result<()> {
            for (var, sum) in self.variables.iter().zip(self.sums.iter_mut()) {
                let mut grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                match sum {
                    Some(acc) => {
                        acc.f_add_(&grad)?;
                    }
                    None => *sum = Some(grad.detach().copy()),
                }
                grad.f_zero_()?;
            }
            Ok(())
        })
    }

    /// L2 norm over all accumulated gradients
    pub fn total_norm(&self) -> Result<f64> {
        let mut total = 0.0f64;
        for grad in self.sums.iter().flatten() {
            total += grad
                .pow_tensor_scalar(2.0)
                .sum(Kind::Float)
                .f_double_value(&[])?;
        }
        Ok(total.sqrt())
    }

    /// Rescale the accumulated gradients to `max_norm` if they exceed it.
    /// Returns the norm measured before clipping.
    pub fn clip_norm(&mut self, max_norm: f64) -> Result<f64> {
        let norm = self.total_norm()?;
        if norm > max_norm {
            let clip_coef = max_norm / (norm + 1e-6);
            for grad in self.sums.iter_mut().flatten() {
                grad.f_mul_scalar_(clip_coef)?;
            }
        }
        Ok(norm)
    }

    pub fn grads(&self) -> &[Option<Tensor>] {
        &self.sums
    }
}
