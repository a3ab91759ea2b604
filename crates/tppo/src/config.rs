//! Trainer configuration.

use crate::{Result, TppoError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::Device;

/// Hyperparameters for the token-level PPO trainer
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    // Schedule
    /// Global steps during which only the critic is updated
    pub warmup_steps: u64,
    /// Steps per agent rotation (0 trains all agents jointly)
    pub agent_iteration_interval: u64,
    /// Number of passes over the buffer per `train` call
    pub ppo_epoch: usize,
    /// Number of minibatches drawn from the buffer per pass
    pub num_mini_batch: usize,
    /// Number of sequential accumulation chunks per minibatch
    pub gradient_cp_steps: usize,

    // PPO hyperparameters
    /// Clipping range for importance ratios and value predictions
    pub clip_param: f64,
    /// Scale applied to the value loss
    pub value_loss_coef: f64,
    /// Entropy bonus coefficient
    pub entropy_coef: f64,
    /// Huber loss threshold
    pub huber_delta: f64,
    /// Maximum gradient norm
    pub max_grad_norm: f64,
    /// Clip gradients to `max_grad_norm` (otherwise only measure)
    pub use_max_grad_norm: bool,
    /// Use the pessimistic clipped value loss
    pub use_clipped_value_loss: bool,
    /// Huber instead of squared error for the value loss
    pub use_huber_loss: bool,
    /// Approximate KL above which the policy step is discarded
    pub kl_threshold: f64,

    // Optimization
    /// Policy learning rate
    pub lr: f64,
    /// Critic learning rate
    pub critic_lr: f64,
    /// Optimizer epsilon
    pub opti_eps: f64,
    /// Decoupled weight decay for the policy optimizers
    pub weight_decay: f64,

    // Checkpointing
    /// Directory holding a previous `optimizers.pt`
    pub load_path: Option<PathBuf>,

    /// Device tensors are moved to before the update
    #[serde(skip, default = "default_device")]
    pub device: Device,
}

fn default_device() -> Device {
    Device::Cpu
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            warmup_steps: 0,
            agent_iteration_interval: 0,
            ppo_epoch: 1,
            num_mini_batch: 1,
            gradient_cp_steps: 1,

            clip_param: 0.2,
            value_loss_coef: 1.0,
            entropy_coef: 0.01,
            huber_delta: 10.0,
            max_grad_norm: 0.5,
            use_max_grad_norm: true,
            use_clipped_value_loss: true,
            use_huber_loss: true,
            kl_threshold: 1.7e-6,

            lr: 1e-6,
            critic_lr: 5e-5,
            opti_eps: 1e-5,
            weight_decay: 0.0,

            load_path: None,
            device: Device::Cpu,
        }
    }
}

impl TrainerConfig {
    /// Read a JSON config; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Create config for CUDA device
    pub fn cuda(mut self) -> Self {
        self.device = Device::Cuda(0);
        self
    }

    /// Set the policy learning rate
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    /// Set the critic learning rate
    pub fn with_critic_lr(mut self, lr: f64) -> Self {
        self.critic_lr = lr;
        self
    }

    /// Set the KL rejection threshold
    pub fn with_kl_threshold(mut self, threshold: f64) -> Self {
        self.kl_threshold = threshold;
        self
    }

    /// Set the number of accumulation chunks
    pub fn with_gradient_cp_steps(mut self, steps: usize) -> Self {
        self.gradient_cp_steps = steps;
        self
    }

    /// Set warmup steps
    pub fn with_warmup_steps(mut self, steps: u64) -> Self {
        self.warmup_steps = steps;
        self
    }

    /// Set the agent rotation interval
    pub fn with_agent_iteration_interval(mut self, interval: u64) -> Self {
        self.agent_iteration_interval = interval;
        self
    }

    /// Resume optimizer state from a checkpoint directory
    pub fn with_load_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.load_path = Some(path.into());
        self
    }

    /// Reject settings the update protocol cannot run with.
    ///
    /// `gradient_cp_steps` is not checked here: degenerate values degrade
    /// to a single chunk or one-row chunks at update time.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(TppoError::InvalidConfig(msg));

        if self.ppo_epoch == 0 {
            return fail("ppo_epoch must be at least 1".into());
        }
        if self.num_mini_batch == 0 {
            return fail("num_mini_batch must be at least 1".into());
        }
        if !(self.lr > 0.0) || !(self.critic_lr > 0.0) {
            return fail(format!(
                "learning rates must be positive (lr={}, critic_lr={})",
                self.lr, self.critic_lr
            ));
        }
        if !(self.opti_eps > 0.0) {
            return fail(format!("opti_eps must be positive, got {}", self.opti_eps));
        }
        if !(self.clip_param >= 0.0) {
            return fail(format!("clip_param must be >= 0, got {}", self.clip_param));
        }
        if self.use_huber_loss && !(self.huber_delta > 0.0) {
            return fail(format!("huber_delta must be positive, got {}", self.huber_delta));
        }
        if !(self.max_grad_norm > 0.0) {
            return fail(format!(
                "max_grad_norm must be positive, got {}",
                self.max_grad_norm
            ));
        }
        if self.kl_threshold.is_nan() || self.kl_threshold < 0.0 {
            return fail(format!(
                "kl_threshold must be >= 0, got {}",
                self.kl_threshold
            ));
        }
        if !(self.weight_decay >= 0.0) {
            return fail(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.kl_threshold, 1.7e-6);
        assert_eq!(config.agent_iteration_interval, 0);
        assert!(config.load_path.is_none());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let zero_epochs = TrainerConfig {
            ppo_epoch: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_epochs.validate(),
            Err(TppoError::InvalidConfig(_))
        ));

        let bad_lr = TrainerConfig::default().with_lr(0.0);
        assert!(bad_lr.validate().is_err());

        let nan_kl = TrainerConfig::default().with_kl_threshold(f64::NAN);
        assert!(nan_kl.validate().is_err());
    }

    #[test]
    fn test_degenerate_cp_steps_still_valid() {
        let config = TrainerConfig::default().with_gradient_cp_steps(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_partial_config() {
        let json = r#"{ "clip_param": 0.1, "ppo_epoch": 3, "load_path": "runs/a" }"#;
        let config: TrainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.clip_param, 0.1);
        assert_eq!(config.ppo_epoch, 3);
        assert_eq!(config.load_path, Some(PathBuf::from("runs/a")));
        assert_eq!(config.num_mini_batch, 1);
        assert_eq!(config.device, Device::Cpu);
    }
}
