//! Token-level multi-agent PPO trainer.
//!
//! One `ppo_update` call:
//! 1. picks the agent to train from the rotation schedule
//! 2. normalizes advantages and builds the token mask
//! 3. accumulates critic gradients chunk by chunk and steps the critic
//! 4. returns early during warmup
//! 5. accumulates policy gradients chunk by chunk
//! 6. discards the policy step when the approximate KL is too large
//! 7. otherwise steps the optimizer of every trained role

use crate::buffer::{TokenBuffer, TokenSample};
use crate::checkpoint::{self, OptimizerSnapshot, OPTIMIZERS_FILE};
use crate::config::TrainerConfig;
use crate::loss::{
    cal_policy_loss, cal_token_mask, cal_value_loss, categorical_entropy, gather_log_probs,
    normalize_advantages, ValueLossParams,
};
use crate::mas::{AgentRole, AgentSelection, MultiAgentSystem, Trainable};
use crate::optim::GradAccumulator;
use crate::registry::OptimizerRegistry;
use crate::schedule::{agent_to_train, gradient_chunks};
use crate::utils::array_to_tensor;
use crate::{Result, TppoError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

/// Diagnostics of a single `ppo_update`.
///
/// Policy-side fields are zero when the policy step did not run; `approx_kl`
/// and `entropy` are still reported when the KL gate rejected the step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct UpdateStats {
    pub value_loss: f64,
    pub critic_grad_norm: f64,
    pub policy_loss: f64,
    pub policy_grad_norm: f64,
    pub approx_kl: f64,
    pub entropy: f64,
}

/// Diagnostics averaged over every update of a `train` call
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TrainInfo {
    pub value_loss: f64,
    pub critic_grad_norm: f64,
    pub policy_loss: f64,
    pub policy_grad_norm: f64,
    pub entropy: f64,
    pub approx_kl: f64,
    /// Number of `ppo_update` calls averaged over
    pub updates: usize,
}

impl TrainInfo {
    fn accumulate(&mut self, stats: &UpdateStats) {
        self.value_loss += stats.value_loss;
        self.critic_grad_norm += stats.critic_grad_norm;
        self.policy_loss += stats.policy_loss;
        self.policy_grad_norm += stats.policy_grad_norm;
        self.entropy += stats.entropy;
        self.approx_kl += stats.approx_kl;
        self.updates += 1;
    }

    fn average(mut self) -> Self {
        if self.updates > 0 {
            let n = self.updates as f64;
            self.value_loss /= n;
            self.critic_grad_norm /= n;
            self.policy_loss /= n;
            self.policy_grad_norm /= n;
            self.entropy /= n;
            self.approx_kl /= n;
        }
        self
    }

    /// Diagnostics keyed by their reporting names
    pub fn to_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("value_loss", self.value_loss),
            ("value_grad_norm", self.critic_grad_norm),
            ("policy_loss", self.policy_loss),
            ("policy_grad_norm", self.policy_grad_norm),
            ("entropy", self.entropy),
            ("approx_kl", self.approx_kl),
        ])
    }
}

/// Token-level PPO trainer owning a multi-agent system and its optimizers
pub struct TppoTrainer<M: MultiAgentSystem> {
    mas: M,
    config: TrainerConfig,
    registry: OptimizerRegistry,
}

impl<M: MultiAgentSystem> TppoTrainer<M> {
    /// Build the optimizer registry and, when `load_path` is set, restore
    /// `<load_path>/optimizers.pt` into it
    pub fn new(mas: M, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        if mas.num_agents() == 0 {
            return Err(TppoError::InvalidConfig(
                "multi-agent system has no agents".into(),
            ));
        }

        let registry = OptimizerRegistry::build(&mas, &config);
        tracing::info!(
            agents = mas.num_agents(),
            roles = registry.roles().count(),
            "Trainer initialized"
        );

        let mut trainer = Self {
            mas,
            config,
            registry,
        };
        if let Some(dir) = trainer.config.load_path.clone() {
            trainer.load_optimizers(dir.join(OPTIMIZERS_FILE), trainer.config.device)?;
        }
        Ok(trainer)
    }

    pub fn mas(&self) -> &M {
        &self.mas
    }

    pub fn mas_mut(&mut self) -> &mut M {
        &mut self.mas
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn registry(&self) -> &OptimizerRegistry {
        &self.registry
    }

    /// Gradient norm of `grads`, clipped to `max_grad_norm` when enabled
    fn clip_or_measure(&self, grads: &mut GradAccumulator) -> Result<f64> {
        if self.config.use_max_grad_norm {
            grads.clip_norm(self.config.max_grad_norm)
        } else {
            grads.total_norm()
        }
    }

    /// Distinct roles updated for `selection`, in agent order
    fn selected_roles(&self, selection: AgentSelection) -> Result<Vec<AgentRole>> {
        let indices: Vec<usize> = match selection {
            AgentSelection::Joint => (0..self.mas.num_agents()).collect(),
            AgentSelection::Single(idx) => vec![idx],
        };
        let mut roles: Vec<AgentRole> = Vec::new();
        for idx in indices {
            let role = self.registry.role_of(idx).ok_or_else(|| {
                TppoError::InvalidConfig(format!("no agent at index {}", idx))
            })?;
            if !roles.contains(role) {
                roles.push(role.clone());
            }
        }
        Ok(roles)
    }

    /// Run one gradient step on a minibatch
    pub fn ppo_update(
        &mut self,
        sample: &TokenSample<M::Obs>,
        global_steps: u64,
    ) -> Result<UpdateStats> {
        sample.validate()?;
        let num_agents = self.mas.num_agents();
        let [batch_size, sample_agents, max_tokens] = sample.token_shape();
        if sample_agents != num_agents {
            return Err(TppoError::ShapeMismatch {
                expected: vec![batch_size, num_agents, max_tokens],
                actual: vec![batch_size, sample_agents, max_tokens],
            });
        }

        let selection = agent_to_train(
            global_steps,
            self.config.agent_iteration_interval,
            num_agents,
        );
        let device = self.config.device;

        let advantages = array_to_tensor(&normalize_advantages(&sample.advantages), device);
        let action_tokens = array_to_tensor(&sample.action_tokens, device);
        let log_probs_old = array_to_tensor(&sample.log_probs, device);
        let value_preds = array_to_tensor(&sample.value_preds, device);
        let returns = array_to_tensor(&sample.returns, device);
        let token_mask = cal_token_mask(&action_tokens, self.mas.pad_token_id());

        if token_mask.sum(Kind::Int64).f_int64_value(&[])? == 0 {
            tracing::warn!(batch_size, "Minibatch contains only padding, skipping update");
            return Ok(UpdateStats::default());
        }

        let chunks = gradient_chunks(batch_size, self.config.gradient_cp_steps);
        let observations = &sample.rollout_observations;

        // Critic
        let value_params = ValueLossParams::from(&self.config);
        let mut critic_grads = GradAccumulator::new(self.registry.critic().variables());
        let mut value_loss = 0.0;
        for chunk in &chunks {
            let (start, len) = (chunk.start as i64, chunk.len as i64);
            let values_infer = self
                .mas
                .get_token_values(
                    &observations[chunk.start..chunk.start + chunk.len],
                    &action_tokens.narrow(0, start, len),
                    true,
                )?
                .squeeze_dim(-1);
            let loss = cal_value_loss(
                &values_infer,
                &value_preds.narrow(0, start, len),
                &returns.narrow(0, start, len),
                &token_mask.narrow(0, start, len),
                &value_params,
            ) * chunk.weight;
            loss.f_backward()?;
            critic_grads.fold()?;
            value_loss += loss.f_double_value(&[])?;
        }
        let critic_grad_norm = self.clip_or_measure(&mut critic_grads)?;
        self.registry.critic_mut().step(critic_grads.grads())?;

        let mut stats = UpdateStats {
            value_loss,
            critic_grad_norm,
            ..Default::default()
        };

        if global_steps < self.config.warmup_steps {
            tracing::debug!(
                global_steps,
                warmup_steps = self.config.warmup_steps,
                "Warmup, critic only"
            );
            return Ok(stats);
        }

        // Policy
        let select_agent = |t: &Tensor| match selection {
            AgentSelection::Joint => t.shallow_clone(),
            AgentSelection::Single(idx) => t.narrow(1, idx as i64, 1),
        };
        let policy_tokens = select_agent(&action_tokens);
        let policy_log_probs_old = select_agent(&log_probs_old);
        let policy_advantages = select_agent(&advantages);
        let policy_mask = select_agent(&token_mask);

        if policy_mask.sum(Kind::Int64).f_int64_value(&[])? == 0 {
            tracing::warn!(?selection, "Trained agent has no action tokens, skipping policy step");
            return Ok(stats);
        }

        let roles = self.selected_roles(selection)?;
        let mut policy_grads: Vec<(AgentRole, GradAccumulator)> = roles
            .into_iter()
            .map(|role| {
                let vars = self
                    .registry
                    .policy(&role)
                    .map(|opt| opt.variables())
                    .unwrap_or_default();
                let grads = GradAccumulator::new(vars);
                (role, grads)
            })
            .collect();

        let width = selection.width(num_agents) as i64;
        let mut policy_loss = 0.0;
        let mut approx_kl = 0.0;
        let mut entropy = 0.0;
        for chunk in &chunks {
            let (start, len) = (chunk.start as i64, chunk.len as i64);
            let (logits, _) = self.mas.get_token_logits(
                &observations[chunk.start..chunk.start + chunk.len],
                &action_tokens.narrow(0, start, len),
                selection,
            )?;
            let size = logits.size();
            if size.len() != 4 || size[..3] != [len, width, max_tokens as i64] {
                return Err(TppoError::ShapeMismatch {
                    expected: vec![chunk.len, width as usize, max_tokens],
                    actual: size.iter().map(|&d| d as usize).collect(),
                });
            }

            let log_prob_infer = gather_log_probs(&logits, &policy_tokens.narrow(0, start, len));
            let token_entropy = categorical_entropy(&logits);
            let (loss, kl, chunk_entropy) = cal_policy_loss(
                &log_prob_infer,
                &policy_log_probs_old.narrow(0, start, len),
                &policy_advantages.narrow(0, start, len),
                &token_entropy,
                &policy_mask.narrow(0, start, len),
                self.config.clip_param,
                self.config.entropy_coef,
            );
            approx_kl += kl.f_double_value(&[])? * chunk.weight;
            entropy += chunk_entropy.f_double_value(&[])? * chunk.weight;

            let loss = loss * chunk.weight;
            loss.f_backward()?;
            for (_, grads) in policy_grads.iter_mut() {
                grads.fold()?;
            }
            policy_loss += loss.f_double_value(&[])?;
            tracing::debug!(start = chunk.start, len = chunk.len, "Policy chunk accumulated");
        }

        stats.approx_kl = approx_kl;
        stats.entropy = entropy;

        if approx_kl > self.config.kl_threshold {
            tracing::info!(
                kl = approx_kl,
                threshold = self.config.kl_threshold,
                ?selection,
                "Policy step rejected due to high KL divergence"
            );
            return Ok(stats);
        }

        let mut policy_grad_norm = 0.0;
        for (role, grads) in policy_grads.iter_mut() {
            let norm = self.clip_or_measure(grads)?;
            self.registry.policy_mut(role)?.step(grads.grads())?;
            tracing::debug!(%role, grad_norm = norm, "Policy step applied");
            policy_grad_norm += norm;
        }

        stats.policy_loss = policy_loss;
        stats.policy_grad_norm = policy_grad_norm;
        Ok(stats)
    }

    /// Run `ppo_epoch` passes of `num_mini_batch` updates over `buffer` and
    /// average the diagnostics
    pub fn train<B>(&mut self, buffer: &mut B, global_steps: u64) -> Result<TrainInfo>
    where
        B: TokenBuffer<M::Obs> + ?Sized,
    {
        let mut info = TrainInfo::default();
        for epoch in 0..self.config.ppo_epoch {
            for sample in buffer.sample(self.config.num_mini_batch) {
                let stats = self.ppo_update(&sample, global_steps)?;
                tracing::debug!(epoch, ?stats, "Minibatch update");
                info.accumulate(&stats);
            }
        }

        let info = info.average();
        if info.updates == 0 {
            tracing::warn!("Buffer yielded no minibatches");
        }
        tracing::info!(
            global_steps,
            updates = info.updates,
            value_loss = info.value_loss,
            policy_loss = info.policy_loss,
            approx_kl = info.approx_kl,
            "Training pass finished"
        );
        Ok(info)
    }

    /// Put every agent and the critic in training mode
    pub fn prep_training(&mut self) {
        for agent in self.mas.agents_mut() {
            agent.set_train_mode(true);
        }
        self.mas.critic_mut().set_train_mode(true);
    }

    /// Put every agent and the critic in inference mode
    pub fn prep_rollout(&mut self) {
        for agent in self.mas.agents_mut() {
            agent.set_train_mode(false);
        }
        self.mas.critic_mut().set_train_mode(false);
    }

    /// Save every optimizer under `<save_dir>/steps_<NNNN>/`, returning the
    /// path of the written `optimizers.pt`
    pub fn save_optimizers(&self, save_dir: impl AsRef<Path>, steps: u64) -> Result<PathBuf> {
        let dir = checkpoint::steps_dir(save_dir, steps);
        let path = self.registry.snapshot().save(&dir)?;
        tracing::info!(path = %path.display(), steps, "Optimizers saved");
        Ok(path)
    }

    /// Restore every optimizer from an `optimizers.pt` file
    pub fn load_optimizers(&mut self, path: impl AsRef<Path>, device: Device) -> Result<()> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "Loading optimizers");
        let snapshot = OptimizerSnapshot::load(path, device)?;
        self.registry.restore(snapshot)?;
        Ok(())
    }
}
