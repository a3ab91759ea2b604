//! # TPPO
//!
//! Token-level PPO optimization for multi-agent systems of sequential token
//! generators that share a critic.
//!
//! ## Overview
//!
//! TPPO provides:
//! - Token-masked clipped policy and value losses (`loss`)
//! - Gradient-checkpointed minibatch accumulation with explicit gradient folds
//! - KL-gated policy updates with round-robin or joint agent scheduling
//! - Role-keyed optimizer registry with on-disk optimizer snapshots
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tppo::prelude::*;
//! use tppo::mas::toy::{ToyMasConfig, ToyTokenMas};
//!
//! let mas = ToyTokenMas::new(ToyMasConfig::default())?;
//! let sample = mas.synthetic_rollout(16, 8, &mut rng)?;
//! let mut buffer = RolloutTokenBuffer::new(sample, seed)?;
//! let mut trainer = TppoTrainer::new(mas, TrainerConfig::default())?;
//!
//! trainer.prep_training();
//! let info = trainer.train(&mut buffer, global_steps)?;
//! trainer.save_optimizers("checkpoints", global_steps)?;
//! ```

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod loss;
pub mod mas;
pub mod optim;
pub mod registry;
pub mod schedule;
pub mod trainer;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::buffer::{RolloutTokenBuffer, TokenBuffer, TokenSample};
    pub use crate::checkpoint::OptimizerSnapshot;
    pub use crate::config::TrainerConfig;
    pub use crate::mas::{AgentRole, AgentSelection, MultiAgentSystem, TokenAgent, Trainable};
    pub use crate::optim::{Adam, AdamConfig, GradAccumulator};
    pub use crate::registry::OptimizerRegistry;
    pub use crate::trainer::{TppoTrainer, TrainInfo, UpdateStats};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum TppoError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid agent role: {0:?}")]
    InvalidRole(String),

    #[error("Unknown agent role: {0}")]
    UnknownRole(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, TppoError>;
