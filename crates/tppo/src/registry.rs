//! Role-keyed optimizer registry.

use crate::checkpoint::{OptimizerSnapshot, ParamGroups};
use crate::config::TrainerConfig;
use crate::mas::{AgentRole, MultiAgentSystem, TokenAgent, Trainable};
use crate::optim::{Adam, AdamConfig};
use crate::{Result, TppoError};
use std::collections::BTreeMap;

/// One AdamW optimizer per distinct agent role plus an Adam optimizer for the
/// shared critic.
///
/// The set of roles is fixed when the registry is built. Agents sharing a
/// role share the optimizer created from the first of them.
pub struct OptimizerRegistry {
    policy: BTreeMap<AgentRole, Adam>,
    critic: Adam,
    /// Role of every agent, by agent index
    agent_roles: Vec<AgentRole>,
}

impl OptimizerRegistry {
    pub fn build<M: MultiAgentSystem>(mas: &M, config: &TrainerConfig) -> Self {
        let mut policy = BTreeMap::new();
        let mut agent_roles = Vec::with_capacity(mas.num_agents());

        for (idx, agent) in mas.agents().iter().enumerate() {
            let role = agent.role().clone();
            if policy.contains_key(&role) {
                tracing::debug!(agent = idx, %role, "Agent shares an existing role optimizer");
            } else {
                let vars = agent.trainable_variables();
                tracing::debug!(agent = idx, %role, num_vars = vars.len(), "Creating policy optimizer");
                policy.insert(
                    role.clone(),
                    Adam::new(
                        vars,
                        AdamConfig::adamw(config.lr, config.opti_eps, config.weight_decay),
                    ),
                );
            }
            agent_roles.push(role);
        }

        let critic = Adam::new(
            mas.critic().trainable_variables(),
            AdamConfig::adam(config.critic_lr, config.opti_eps),
        );

        Self {
            policy,
            critic,
            agent_roles,
        }
    }

    pub fn roles(&self) -> impl Iterator<Item = &AgentRole> {
        self.policy.keys()
    }

    /// Role of the agent at `agent_idx`
    pub fn role_of(&self, agent_idx: usize) -> Option<&AgentRole> {
        self.agent_roles.get(agent_idx)
    }

    pub fn policy(&self, role: &AgentRole) -> Option<&Adam> {
        self.policy.get(role)
    }

    pub fn policy_mut(&mut self, role: &AgentRole) -> Result<&mut Adam> {
        self.policy
            .get_mut(role)
            .ok_or_else(|| TppoError::UnknownRole(role.to_string()))
    }

    pub fn critic(&self) -> &Adam {
        &self.critic
    }

    pub fn critic_mut(&mut self) -> &mut Adam {
        &mut self.critic
    }

    /// Deep copy of every optimizer's state and hyperparameters
    pub fn snapshot(&self) -> OptimizerSnapshot {
        OptimizerSnapshot {
            policy_opt_states: self
                .policy
                .iter()
                .map(|(role, opt)| (role.clone(), opt.state()))
                .collect(),
            critic_opt_state: self.critic.state(),
            param_groups: Some(ParamGroups {
                policy: self
                    .policy
                    .iter()
                    .map(|(role, opt)| (role.clone(), opt.config().clone()))
                    .collect(),
                critic: self.critic.config().clone(),
                version: crate::VERSION.to_string(),
            }),
        }
    }

    /// Restore every optimizer in place.
    ///
    /// Every role in the snapshot must already be registered and every state
    /// must match its optimizer's parameters; the registry is left untouched
    /// when either check fails. Registered roles missing from the snapshot
    /// keep their current state.
    pub fn restore(&mut self, snapshot: OptimizerSnapshot) -> Result<()> {
        let OptimizerSnapshot {
            policy_opt_states,
            critic_opt_state,
            param_groups,
        } = snapshot;

        let group_roles = param_groups.iter().flat_map(|g| g.policy.keys());
        if let Some(role) = policy_opt_states
            .keys()
            .chain(group_roles)
            .find(|role| !self.policy.contains_key(*role))
        {
            return Err(TppoError::UnknownRole(role.to_string()));
        }

        let mut prepared = Vec::with_capacity(policy_opt_states.len());
        for (role, state) in policy_opt_states {
            let opt = self
                .policy(&role)
                .ok_or_else(|| TppoError::UnknownRole(role.to_string()))?;
            let state = opt.prepare_state(state)?;
            prepared.push((role, state));
        }
        let critic_state = self.critic.prepare_state(critic_opt_state)?;

        for (role, state) in prepared {
            self.policy_mut(&role)?.commit_state(state);
        }
        self.critic.commit_state(critic_state);

        if let Some(groups) = param_groups {
            for (role, config) in groups.policy {
                self.policy_mut(&role)?.set_config(config);
            }
            self.critic.set_config(groups.critic);
        }
        Ok(())
    }
}
