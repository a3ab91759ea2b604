//! Multi-agent system contract consumed by the trainer.
//!
//! The trainer never builds models itself. It needs:
//! - agents that expose trainable variables and a role key
//! - a shared critic scoring every action token
//! - joint token logits, optionally restricted to a single agent
//! - the tokenizer's pad id, used to mask padded action tokens

pub mod toy;

use crate::{Result, TppoError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tch::{nn, Tensor};

/// Validated key naming an agent role.
///
/// Roles are used as optimizer keys and as checkpoint tensor name segments,
/// so they are restricted to ASCII alphanumerics, `_` and `-`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentRole(String);

impl AgentRole {
    pub fn new(role: impl Into<String>) -> Result<Self> {
        let role = role.into();
        let valid = !role.is_empty()
            && role
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(role))
        } else {
            Err(TppoError::InvalidRole(role))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AgentRole {
    type Error = TppoError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AgentRole> for String {
    fn from(role: AgentRole) -> Self {
        role.0
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which agents a policy step updates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentSelection {
    /// Every agent is updated from the same minibatch
    Joint,
    /// Only the agent at this index is updated
    Single(usize),
}

impl AgentSelection {
    /// Number of agent slots present in logits produced for this selection
    pub fn width(&self, num_agents: usize) -> usize {
        match self {
            AgentSelection::Joint => num_agents,
            AgentSelection::Single(_) => 1,
        }
    }
}

/// A model whose parameters the trainer optimizes
pub trait Trainable {
    /// Variable store holding the model parameters
    fn var_store(&self) -> &nn::VarStore;

    /// Switch between training (dropout active) and inference execution
    fn set_train_mode(&mut self, train: bool);

    /// Variables that receive gradients
    fn trainable_variables(&self) -> Vec<Tensor> {
        self.var_store().trainable_variables()
    }
}

/// One token-generating agent of the system
pub trait TokenAgent: Trainable {
    fn role(&self) -> &AgentRole;
}

/// The multi-agent system driven by the trainer
pub trait MultiAgentSystem {
    /// Observation type fed to the forward passes (e.g. prompt text)
    type Obs: Clone;
    type Agent: TokenAgent;
    type Critic: Trainable;

    fn agents(&self) -> &[Self::Agent];

    fn agents_mut(&mut self) -> &mut [Self::Agent];

    fn critic(&self) -> &Self::Critic;

    fn critic_mut(&mut self) -> &mut Self::Critic;

    /// Token id marking padding in action token tensors
    fn pad_token_id(&self) -> i64;

    fn num_agents(&self) -> usize {
        self.agents().len()
    }

    /// Per-token value estimates, `[batch, agents, tokens, 1]`
    fn get_token_values(
        &self,
        observations: &[Self::Obs],
        action_tokens: &Tensor,
        train: bool,
    ) -> Result<Tensor>;

    /// Per-token logits, `[batch, agents_or_1, tokens, vocab]`, plus an
    /// auxiliary output the trainer ignores
    fn get_token_logits(
        &self,
        observations: &[Self::Obs],
        action_tokens: &Tensor,
        selection: AgentSelection,
    ) -> Result<(Tensor, Tensor)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_validation() {
        assert!(AgentRole::new("planner").is_ok());
        assert!(AgentRole::new("agent_0-b").is_ok());
        assert!(matches!(
            AgentRole::new(""),
            Err(TppoError::InvalidRole(_))
        ));
        assert!(AgentRole::new("a.b").is_err());
        assert!(AgentRole::new("a/b").is_err());
    }

    #[test]
    fn test_role_serde_rejects_invalid() {
        let role: AgentRole = serde_json::from_str("\"solver\"").unwrap();
        assert_eq!(role.as_str(), "solver");
        assert!(serde_json::from_str::<AgentRole>("\"bad role\"").is_err());
    }

    #[test]
    fn test_selection_width() {
        assert_eq!(AgentSelection::Joint.width(3), 3);
        assert_eq!(AgentSelection::Single(2).width(3), 1);
    }
}
