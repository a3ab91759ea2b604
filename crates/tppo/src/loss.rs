//! Token-level PPO losses.
//!
//! Every reduction here is a masked mean over real (non-pad) action tokens.
//! The denominator is clamped to one, so a chunk whose mask is entirely
//! padding contributes an exact zero instead of NaN.

use crate::config::TrainerConfig;
use ndarray::{Array, Dimension};
use tch::{Kind, Tensor};

/// 1 where a token is a real action token, 0 where it is padding.
/// The result has the shape of `action_tokens` and kind `Int`.
pub fn cal_token_mask(action_tokens: &Tensor, pad_token_id: i64) -> Tensor {
    action_tokens.ne(pad_token_id).to_kind(Kind::Int)
}

/// `sum(values * mask) / max(sum(mask), 1)`
pub fn masked_mean(values: &Tensor, mask: &Tensor) -> Tensor {
    let mask = mask.to_kind(Kind::Float);
    (values * &mask).sum(Kind::Float) / mask.sum(Kind::Float).clamp_min(1.0)
}

/// Log-probability of each taken token under `logits`
pub fn gather_log_probs(logits: &Tensor, tokens: &Tensor) -> Tensor {
    logits
        .log_softmax(-1, Kind::Float)
        .gather(-1, &tokens.to_kind(Kind::Int64).unsqueeze(-1), false)
        .squeeze_dim(-1)
}

/// Entropy of the categorical distribution over the last dimension
pub fn categorical_entropy(logits: &Tensor) -> Tensor {
    let log_probs = logits.log_softmax(-1, Kind::Float);
    -(log_probs.exp() * &log_probs).sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)
}

/// Clipped token-level policy loss.
///
/// Returns `(policy_loss, approx_kl, entropy)`, each a masked mean.
/// The approximate KL is `(r - 1) - log r`, which is never negative.
pub fn cal_policy_loss(
    log_prob_infer: &Tensor,
    log_prob_old: &Tensor,
    advantages: &Tensor,
    entropy: &Tensor,
    token_mask: &Tensor,
    clip_param: f64,
    entropy_coef: f64,
) -> (Tensor, Tensor, Tensor) {
    let log_ratio = log_prob_infer - log_prob_old;
    let ratio = log_ratio.exp();
    let approx_kl = (&ratio - 1.0) - &log_ratio;

    let surr1 = -ratio.clamp(1.0 - clip_param, 1.0 + clip_param) * advantages;
    let surr2 = -&ratio * advantages;
    let per_token = surr1.max_other(&surr2) - entropy * entropy_coef;

    (
        masked_mean(&per_token, token_mask),
        masked_mean(&approx_kl, token_mask),
        masked_mean(entropy, token_mask),
    )
}

/// Per-element error penalty used by the value loss
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueError {
    Huber { delta: f64 },
    Squared,
}

impl ValueError {
    pub fn apply(&self, error: &Tensor) -> Tensor {
        match *self {
            ValueError::Huber { delta } => huber_loss(error, delta),
            ValueError::Squared => mse_loss(error),
        }
    }
}

/// Settings of the value loss, taken from the trainer config
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValueLossParams {
    pub clip_param: f64,
    pub value_loss_coef: f64,
    pub error: ValueError,
    pub clipped: bool,
}

impl From<&TrainerConfig> for ValueLossParams {
    fn from(config: &TrainerConfig) -> Self {
        Self {
            clip_param: config.clip_param,
            value_loss_coef: config.value_loss_coef,
            error: if config.use_huber_loss {
                ValueError::Huber {
                    delta: config.huber_delta,
                }
            } else {
                ValueError::Squared
            },
            clipped: config.use_clipped_value_loss,
        }
    }
}

/// Token-level value loss, scaled by `value_loss_coef`.
///
/// With clipping enabled the per-token loss is the larger of the clipped and
/// unclipped errors.
pub fn cal_value_loss(
    values_infer: &Tensor,
    value_preds_old: &Tensor,
    returns: &Tensor,
    token_mask: &Tensor,
    params: &ValueLossParams,
) -> Tensor {
    let unclipped = params.error.apply(&(returns - values_infer));

    let per_token = if params.clipped {
        let clipped_pred = value_preds_old
            + (values_infer - value_preds_old).clamp(-params.clip_param, params.clip_param);
        let clipped = params.error.apply(&(returns - clipped_pred));
        clipped.max_other(&unclipped)
    } else {
        unclipped
    };

    masked_mean(&per_token, token_mask) * params.value_loss_coef
}

/// Quadratic inside `delta`, linear outside
pub fn huber_loss(error: &Tensor, delta: f64) -> Tensor {
    let abs = error.abs();
    let inside = abs.le(delta).to_kind(Kind::Float);
    let outside = abs.gt(delta).to_kind(Kind::Float);
    inside * error.pow_tensor_scalar(2.0) / 2.0 + outside * delta * (abs - delta / 2.0)
}

pub fn mse_loss(error: &Tensor) -> Tensor {
    error.pow_tensor_scalar(2.0) / 2.0
}

/// Normalize advantages with statistics that ignore exact zeros.
///
/// Zero advantages mark padded or inactive decision points, so they are left
/// out of the mean and (population) standard deviation, as are NaN entries.
/// Every entry, zeros included, is then mapped through
/// `(a - mean) / (std + 1e-8)`; a NaN entry stays NaN without affecting the
/// others.
///
/// When no entry is usable there are no statistics to apply; the input is
/// returned unchanged rather than filled with NaN.
pub fn normalize_advantages<D: Dimension>(advantages: &Array<f32, D>) -> Array<f32, D> {
    let (count, sum) = advantages
        .iter()
        .filter(|&&a| a != 0.0 && !a.is_nan())
        .fold((0usize, 0.0f64), |(n, s), &a| (n + 1, s + a as f64));

    if count == 0 {
        tracing::warn!("No non-zero advantages; skipping normalization");
        return advantages.clone();
    }

    let mean = sum / count as f64;
    let var = advantages
        .iter()
        .filter(|&&a| a != 0.0 && !a.is_nan())
        .map(|&a| (a as f64 - mean).powi(2))
        .sum::<f64>()
        / count as f64;
    let std = var.sqrt();

    advantages.mapv(|a| ((a as f64 - mean) / (std + 1e-8)) as f32)
}
