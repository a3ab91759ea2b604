//! A small tch-backed multi-agent system.
//!
//! Each distinct role owns one policy network (agents sharing a role share
//! it); every policy predicts the next action token from a hashed prompt
//! embedding and the previous token. A separate critic scores every action
//! token. Both apply dropout in training mode.

use super::{AgentRole, AgentSelection, MultiAgentSystem, TokenAgent, Trainable};
use crate::buffer::TokenSample;
use crate::loss::gather_log_probs;
use crate::utils::tensor_to_array3;
use crate::{Result, TppoError};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::Rng;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tch::{nn, nn::Module, Device, Kind, Tensor};

pub const PAD_TOKEN_ID: i64 = 0;

/// Maximum prompt bytes fed to the prompt embedding
const MAX_PROMPT_BYTES: usize = 64;

#[derive(Clone, Debug)]
pub struct ToyMasConfig {
    /// Role of each agent, in agent order
    pub roles: Vec<String>,
    pub vocab_size: i64,
    pub hidden_size: i64,
    pub dropout: f64,
    pub device: Device,
}

impl Default for ToyMasConfig {
    fn default() -> Self {
        Self {
            roles: vec!["planner".into(), "solver".into()],
            vocab_size: 32,
            hidden_size: 16,
            dropout: 0.1,
            device: Device::Cpu,
        }
    }
}

/// Map prompt bytes onto non-pad token ids
fn encode_prompt(text: &str, vocab_size: i64) -> Vec<i64> {
    let ids: Vec<i64> = text
        .bytes()
        .take(MAX_PROMPT_BYTES)
        .map(|b| 1 + b as i64 % (vocab_size - 1))
        .collect();
    if ids.is_empty() {
        vec![PAD_TOKEN_ID]
    } else {
        ids
    }
}

/// Mean prompt embedding per observation, `[batch, hidden]`
fn embed_prompts(embedding: &nn::Embedding, observations: &[String], vocab_size: i64) -> Tensor {
    let device = embedding.ws.device();
    let rows: Vec<Tensor> = observations
        .iter()
        .map(|obs| {
            let ids = Tensor::from_slice(&encode_prompt(obs, vocab_size)).to_device(device);
            embedding
                .forward(&ids)
                .mean_dim(Some([0i64].as_slice()), false, Kind::Float)
        })
        .collect();
    Tensor::stack(&rows, 0)
}

/// Token ids shifted right by one position, pad id in front
fn previous_tokens(tokens: &Tensor) -> Tensor {
    let len = *tokens.size().last().unwrap_or(&0);
    let start = tokens.narrow(-1, 0, len.min(1)).full_like(PAD_TOKEN_ID);
    Tensor::cat(&[start, tokens.narrow(-1, 0, (len - 1).max(0))], -1)
}

/// Policy network of one role
pub struct ToyPolicy {
    vs: nn::VarStore,
    prompt: nn::Embedding,
    token: nn::Embedding,
    head: nn::Linear,
    vocab_size: i64,
    dropout: f64,
    training: Cell<bool>,
}

impl ToyPolicy {
    fn new(config: &ToyMasConfig) -> Self {
        let vs = nn::VarStore::new(config.device);
        let root = vs.root();
        let prompt = nn::embedding(
            &root / "prompt",
            config.vocab_size,
            config.hidden_size,
            Default::default(),
        );
        let token = nn::embedding(
            &root / "token",
            config.vocab_size,
            config.hidden_size,
            Default::default(),
        );
        let head = nn::linear(
            &root / "head",
            config.hidden_size,
            config.vocab_size,
            Default::default(),
        );
        Self {
            vs,
            prompt,
            token,
            head,
            vocab_size: config.vocab_size,
            dropout: config.dropout,
            training: Cell::new(true),
        }
    }

    /// Next-token logits for `tokens: [batch, tokens]`, `[batch, tokens, vocab]`
    fn logits(&self, observations: &[String], tokens: &Tensor) -> Tensor {
        let prompt = embed_prompts(&self.prompt, observations, self.vocab_size);
        let hidden = (self.token.forward(&previous_tokens(tokens)) + prompt.unsqueeze(1)).tanh();
        hidden
            .dropout(self.dropout, self.training.get())
            .apply(&self.head)
    }
}

/// An agent: a role bound to its role's policy network
pub struct ToyAgent {
    role: AgentRole,
    policy: Rc<ToyPolicy>,
}

impl Trainable for ToyAgent {
    fn var_store(&self) -> &nn::VarStore {
        &self.policy.vs
    }

    fn set_train_mode(&mut self, train: bool) {
        self.policy.training.set(train);
    }
}

impl TokenAgent for ToyAgent {
    fn role(&self) -> &AgentRole {
        &self.role
    }
}

impl ToyAgent {
    pub fn is_training(&self) -> bool {
        self.policy.training.get()
    }
}

/// Shared token critic
pub struct ToyCritic {
    vs: nn::VarStore,
    prompt: nn::Embedding,
    token: nn::Embedding,
    agent: nn::Embedding,
    hidden: nn::Linear,
    value: nn::Linear,
    vocab_size: i64,
    dropout: f64,
    training: bool,
}

impl ToyCritic {
    fn new(config: &ToyMasConfig, num_agents: i64) -> Self {
        let vs = nn::VarStore::new(config.device);
        let root = vs.root();
        let h = config.hidden_size;
        let prompt = nn::embedding(&root / "prompt", config.vocab_size, h, Default::default());
        let token = nn::embedding(&root / "token", config.vocab_size, h, Default::default());
        let agent = nn::embedding(&root / "agent", num_agents.max(1), h, Default::default());
        let hidden = nn::linear(&root / "hidden", h, h, Default::default());
        let value = nn::linear(&root / "value", h, 1, Default::default());
        Self {
            vs,
            prompt,
            token,
            agent,
            hidden,
            value,
            vocab_size: config.vocab_size,
            dropout: config.dropout,
            training: true,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// `[batch, agents, tokens, 1]`
    fn values(&self, observations: &[String], action_tokens: &Tensor) -> Tensor {
        let num_agents = action_tokens.size()[1];
        let device = self.vs.device();
        let prompt = embed_prompts(&self.prompt, observations, self.vocab_size);
        let agents = self
            .agent
            .forward(&Tensor::arange(num_agents, (Kind::Int64, device)));

        let x = self.token.forward(action_tokens)
            + prompt.unsqueeze(1).unsqueeze(1)
            + agents.unsqueeze(0).unsqueeze(2);
        x.tanh()
            .apply(&self.hidden)
            .relu()
            .dropout(self.dropout, self.training)
            .apply(&self.value)
    }
}

impl Trainable for ToyCritic {
    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn set_train_mode(&mut self, train: bool) {
        self.training = train;
    }
}

/// Multi-agent system over text observations
pub struct ToyTokenMas {
    agents: Vec<ToyAgent>,
    critic: ToyCritic,
    config: ToyMasConfig,
}

impl ToyTokenMas {
    pub fn new(config: ToyMasConfig) -> Result<Self> {
        if config.roles.is_empty() {
            return Err(TppoError::InvalidConfig("at least one agent role is required".into()));
        }
        if config.vocab_size < 2 || config.hidden_size < 1 {
            return Err(TppoError::InvalidConfig(format!(
                "vocab_size must be >= 2 and hidden_size >= 1 (got {}, {})",
                config.vocab_size, config.hidden_size
            )));
        }

        let mut policies: BTreeMap<AgentRole, Rc<ToyPolicy>> = BTreeMap::new();
        let mut agents = Vec::with_capacity(config.roles.len());
        for role in &config.roles {
            let role = AgentRole::new(role.as_str())?;
            let policy = policies
                .entry(role.clone())
                .or_insert_with(|| Rc::new(ToyPolicy::new(&config)))
                .clone();
            agents.push(ToyAgent { role, policy });
        }

        let critic = ToyCritic::new(&config, agents.len() as i64);
        Ok(Self {
            agents,
            critic,
            config,
        })
    }

    pub fn config(&self) -> &ToyMasConfig {
        &self.config
    }

    /// Generate one synthetic rollout of `batch` prompts.
    ///
    /// Action tokens have random lengths in `1..=max_tokens` per agent and are
    /// padded afterwards. Old log-probabilities and values come from the
    /// current networks, returns are values plus noise and advantages are
    /// `returns - values`, exactly zero on padding.
    pub fn synthetic_rollout(
        &self,
        batch: usize,
        max_tokens: usize,
        rng: &mut StdRng,
    ) -> Result<TokenSample<String>> {
        let num_agents = self.agents.len();
        let max_tokens = max_tokens.max(1);
        let device = self.config.device;

        let observations: Vec<String> = (0..batch)
            .map(|i| format!("task {} seed {}", i, rng.gen::<u32>()))
            .collect();

        let mut action_tokens =
            Array3::<i64>::from_elem((batch, num_agents, max_tokens), PAD_TOKEN_ID);
        for b in 0..batch {
            for a in 0..num_agents {
                let len = rng.gen_range(1..=max_tokens);
                for t in 0..len {
                    action_tokens[[b, a, t]] = rng.gen_range(1..self.config.vocab_size);
                }
            }
        }

        let actions = (0..batch)
            .map(|b| {
                (0..num_agents)
                    .map(|a| {
                        action_tokens
                            .slice(ndarray::s![b, a, ..])
                            .iter()
                            .filter(|&&t| t != PAD_TOKEN_ID)
                            .map(|t| format!("t{}", t))
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .collect()
            })
            .collect();

        let tokens = crate::utils::array_to_tensor(&action_tokens, device);
        let mask = tokens.ne(PAD_TOKEN_ID).to_kind(Kind::Float);
        let (log_probs, values) = tch::no_grad(|| -> Result<(Tensor, Tensor)> {
            let (logits, _) = self.get_token_logits(&observations, &tokens, AgentSelection::Joint)?;
            let values = self.get_token_values(&observations, &tokens, false)?;
            Ok((
                gather_log_probs(&logits, &tokens) * &mask,
                values.squeeze_dim(-1) * &mask,
            ))
        })?;

        let log_probs = tensor_to_array3(&log_probs)?;
        let value_preds = tensor_to_array3(&values)?;
        let mut returns = value_preds.clone();
        let mut advantages = Array3::<f32>::zeros(value_preds.raw_dim());
        for ((idx, ret), &token) in returns.indexed_iter_mut().zip(action_tokens.iter()) {
            if token == PAD_TOKEN_ID {
                *ret = 0.0;
                continue;
            }
            let noise: f32 = rng.gen_range(-1.0..1.0);
            *ret += noise;
            advantages[idx] = noise;
        }

        Ok(TokenSample {
            rollout_observations: observations.clone(),
            observations,
            actions,
            log_probs,
            value_preds,
            returns,
            advantages,
            action_tokens,
        })
    }
}

impl MultiAgentSystem for ToyTokenMas {
    type Obs = String;
    type Agent = ToyAgent;
    type Critic = ToyCritic;

    fn agents(&self) -> &[ToyAgent] {
        &self.agents
    }

    fn agents_mut(&mut self) -> &mut [ToyAgent] {
        &mut self.agents
    }

    fn critic(&self) -> &ToyCritic {
        &self.critic
    }

    fn critic_mut(&mut self) -> &mut ToyCritic {
        &mut self.critic
    }

    fn pad_token_id(&self) -> i64 {
        PAD_TOKEN_ID
    }

    fn get_token_values(
        &self,
        observations: &[String],
        action_tokens: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        check_tokens(action_tokens, observations.len(), self.agents.len())?;
        if train {
            Ok(self.critic.values(observations, action_tokens))
        } else {
            Ok(tch::no_grad(|| self.critic.values(observations, action_tokens)))
        }
    }

    fn get_token_logits(
        &self,
        observations: &[String],
        action_tokens: &Tensor,
        selection: AgentSelection,
    ) -> Result<(Tensor, Tensor)> {
        check_tokens(action_tokens, observations.len(), self.agents.len())?;
        let logits = match selection {
            AgentSelection::Joint => {
                let per_agent: Vec<Tensor> = self
                    .agents
                    .iter()
                    .enumerate()
                    .map(|(a, agent)| {
                        agent
                            .policy
                            .logits(observations, &action_tokens.select(1, a as i64))
                    })
                    .collect();
                Tensor::stack(&per_agent, 1)
            }
            AgentSelection::Single(a) => {
                let agent = self.agents.get(a).ok_or_else(|| {
                    TppoError::InvalidConfig(format!(
                        "agent index {} out of range for {} agents",
                        a,
                        self.agents.len()
                    ))
                })?;
                agent
                    .policy
                    .logits(observations, &action_tokens.select(1, a as i64))
                    .unsqueeze(1)
            }
        };
        let aux = Tensor::zeros([0], (Kind::Float, self.config.device));
        Ok((logits, aux))
    }
}

fn check_tokens(action_tokens: &Tensor, batch: usize, num_agents: usize) -> Result<()> {
    let size = action_tokens.size();
    if size.len() != 3 || size[0] != batch as i64 || size[1] != num_agents as i64 {
        return Err(TppoError::ShapeMismatch {
            expected: vec![batch, num_agents],
            actual: size.iter().map(|&d| d as usize).collect(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn mas(dropout: f64) -> ToyTokenMas {
        tch::manual_seed(0);
        ToyTokenMas::new(ToyMasConfig {
            dropout,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_output_shapes() {
        let mas = mas(0.0);
        let obs = vec!["a".to_string(), "bc".to_string(), String::new()];
        let tokens = Tensor::ones([3, 2, 5], (Kind::Int64, Device::Cpu));

        let values = mas.get_token_values(&obs, &tokens, true).unwrap();
        assert_eq!(values.size(), vec![3, 2, 5, 1]);

        let (joint, _) = mas.get_token_logits(&obs, &tokens, AgentSelection::Joint).unwrap();
        assert_eq!(joint.size(), vec![3, 2, 5, 32]);

        let (single, _) = mas
            .get_token_logits(&obs, &tokens, AgentSelection::Single(1))
            .unwrap();
        assert_eq!(single.size(), vec![3, 1, 5, 32]);
        assert!(single.squeeze_dim(1).allclose(&joint.select(1, 1), 1e-6, 1e-6, false));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let mas = mas(0.0);
        let obs = vec!["a".to_string()];
        let tokens = Tensor::ones([1, 3, 2], (Kind::Int64, Device::Cpu));
        assert!(mas.get_token_values(&obs, &tokens, true).is_err());

        let tokens = Tensor::ones([1, 2, 2], (Kind::Int64, Device::Cpu));
        assert!(mas
            .get_token_logits(&obs, &tokens, AgentSelection::Single(5))
            .is_err());
        assert!(ToyTokenMas::new(ToyMasConfig {
            roles: vec![],
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_shared_roles_share_parameters() {
        let mas = ToyTokenMas::new(ToyMasConfig {
            roles: vec!["worker".into(), "worker".into(), "judge".into()],
            ..Default::default()
        })
        .unwrap();
        let vars = |i: usize| mas.agents()[i].trainable_variables();
        assert!(vars(0)[0].equal(&vars(1)[0]));
        assert_eq!(mas.agents()[0].role(), mas.agents()[1].role());
        assert_ne!(mas.agents()[0].role(), mas.agents()[2].role());
    }

    #[test]
    fn test_eval_mode_is_deterministic() {
        let mut mas = mas(0.5);
        let obs = vec!["prompt".to_string(); 4];
        let tokens = Tensor::ones([4, 2, 6], (Kind::Int64, Device::Cpu));

        for agent in mas.agents_mut() {
            agent.set_train_mode(false);
        }
        mas.critic_mut().set_train_mode(false);
        let a = mas.get_token_values(&obs, &tokens, false).unwrap();
        let b = mas.get_token_values(&obs, &tokens, false).unwrap();
        assert!(a.equal(&b));
        assert!(!mas.critic().is_training());
        assert!(!mas.agents()[0].is_training());
    }

    #[test]
    fn test_synthetic_rollout() {
        let mas = mas(0.0);
        let mut rng = StdRng::seed_from_u64(3);
        let sample = mas.synthetic_rollout(6, 4, &mut rng).unwrap();
        assert!(sample.validate().is_ok());
        assert_eq!(sample.token_shape(), [6, 2, 4]);

        for ((&token, &adv), &lp) in sample
            .action_tokens
            .iter()
            .zip(sample.advantages.iter())
            .zip(sample.log_probs.iter())
        {
            if token == PAD_TOKEN_ID {
                assert_eq!(adv, 0.0);
                assert_eq!(lp, 0.0);
            } else {
                assert!(lp < 0.0);
            }
        }
        // every agent emits at least one token
        assert!(sample
            .action_tokens
            .slice(ndarray::s![.., .., 0])
            .iter()
            .all(|&t| t != PAD_TOKEN_ID));
    }
}
