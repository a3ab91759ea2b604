//! Optimizer snapshots on disk.
//!
//! Layout:
//! - `<save_dir>/steps_<NNNN>/optimizers.pt` holds every moment buffer and
//!   step count as named tensors
//! - `<save_dir>/steps_<NNNN>/optimizers.json` describes the param groups
//!
//! Tensor names follow `policy_opt_states.<role>.<param>.<field>` and
//! `critic_opt_state.<param>.<field>`, with `<field>` one of `step`,
//! `exp_avg`, `exp_avg_sq`. A `num_params` entry per optimizer records how
//! many variables it manages, including those without state yet.

use crate::mas::AgentRole;
use crate::optim::{AdamConfig, AdamState, ParamState};
use crate::{Result, TppoError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

/// File holding the optimizer tensors inside a steps directory
pub const OPTIMIZERS_FILE: &str = "optimizers.pt";
/// Sidecar describing param groups
pub const PARAM_GROUPS_FILE: &str = "optimizers.json";

const POLICY_PREFIX: &str = "policy_opt_states";
const CRITIC_PREFIX: &str = "critic_opt_state";

/// `<save_dir>/steps_<4-digit steps>`
pub fn steps_dir(save_dir: impl AsRef<Path>, steps: u64) -> PathBuf {
    save_dir.as_ref().join(format!("steps_{:04}", steps))
}

/// Hyperparameters of every optimizer, stored next to the tensors
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamGroups {
    pub policy: BTreeMap<AgentRole, AdamConfig>,
    pub critic: AdamConfig,
    pub version: String,
}

/// Internal state of every optimizer owned by the trainer
pub struct OptimizerSnapshot {
    pub policy_opt_states: BTreeMap<AgentRole, AdamState>,
    pub critic_opt_state: AdamState,
    /// Absent when a snapshot was written without its sidecar
    pub param_groups: Option<ParamGroups>,
}

impl OptimizerSnapshot {
    /// Write `optimizers.pt` (and the sidecar when param groups are set)
    /// into `dir`, creating it if needed
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut named: Vec<(String, Tensor)> = Vec::new();
        for (role, state) in &self.policy_opt_states {
            push_state(&mut named, &format!("{}.{}", POLICY_PREFIX, role), state);
        }
        push_state(&mut named, CRITIC_PREFIX, &self.critic_opt_state);

        let path = dir.join(OPTIMIZERS_FILE);
        Tensor::save_multi(&named, &path)?;

        if let Some(groups) = &self.param_groups {
            let file = std::fs::File::create(dir.join(PARAM_GROUPS_FILE))?;
            serde_json::to_writer_pretty(file, groups)?;
        }

        Ok(path)
    }

    /// Read a snapshot from an `optimizers.pt` path, placing tensors on
    /// `device`. The sidecar is read from the same directory when present.
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let path = path.as_ref();
        let named = Tensor::load_multi_with_device(path, device)?;

        let mut policy: BTreeMap<AgentRole, StateBuilder> = BTreeMap::new();
        let mut critic = StateBuilder::default();

        for (name, tensor) in named {
            let parts: Vec<&str> = name.split('.').collect();
            match parts.as_slice() {
                [POLICY_PREFIX, role, rest @ ..] => {
                    let role = AgentRole::new(*role)?;
                    policy.entry(role).or_default().insert(&name, rest, tensor)?;
                }
                [CRITIC_PREFIX, rest @ ..] => critic.insert(&name, rest, tensor)?,
                _ => {
                    return Err(TppoError::Checkpoint(format!(
                        "unexpected tensor {:?} in {}",
                        name,
                        path.display()
                    )))
                }
            }
        }

        let policy_opt_states = policy
            .into_iter()
            .map(|(role, builder)| {
                let state = builder.finish(&format!("{}.{}", POLICY_PREFIX, role))?;
                Ok((role, state))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        let critic_opt_state = critic.finish(CRITIC_PREFIX)?;

        let groups_path = path.with_file_name(PARAM_GROUPS_FILE);
        let param_groups = if groups_path.exists() {
            let file = std::fs::File::open(&groups_path)?;
            Some(serde_json::from_reader(file)?)
        } else {
            tracing::warn!(
                path = %groups_path.display(),
                "No param group sidecar found, keeping current hyperparameters"
            );
            None
        };

        Ok(Self {
            policy_opt_states,
            critic_opt_state,
            param_groups,
        })
    }
}

fn push_state(named: &mut Vec<(String, Tensor)>, prefix: &str, state: &AdamState) {
    named.push((
        format!("{}.num_params", prefix),
        Tensor::from(state.params.len() as i64),
    ));
    for (idx, param) in state.params.iter().enumerate() {
        let Some(param) = param else { continue };
        named.push((format!("{}.{}.step", prefix, idx), Tensor::from(param.step)));
        named.push((
            format!("{}.{}.exp_avg", prefix, idx),
            param.exp_avg.shallow_clone(),
        ));
        named.push((
            format!("{}.{}.exp_avg_sq", prefix, idx),
            param.exp_avg_sq.shallow_clone(),
        ));
    }
}

#[derive(Default)]
struct PartialParam {
    step: Option<i64>,
    exp_avg: Option<Tensor>,
    exp_avg_sq: Option<Tensor>,
}

#[derive(Default)]
struct StateBuilder {
    num_params: Option<usize>,
    params: BTreeMap<usize, PartialParam>,
}

impl StateBuilder {
    fn insert(&mut self, name: &str, rest: &[&str], tensor: Tensor) -> Result<()> {
        let bad_name = || TppoError::Checkpoint(format!("malformed tensor name {:?}", name));
        match rest {
            ["num_params"] => {
                self.num_params = Some(tensor.to_kind(Kind::Int64).f_int64_value(&[])? as usize);
            }
            [idx, field] => {
                let idx: usize = idx.parse().map_err(|_| bad_name())?;
                let entry = self.params.entry(idx).or_default();
                match *field {
                    "step" => entry.step = Some(tensor.to_kind(Kind::Int64).f_int64_value(&[])?),
                    "exp_avg" => entry.exp_avg = Some(tensor),
                    "exp_avg_sq" => entry.exp_avg_sq = Some(tensor),
                    _ => return Err(bad_name()),
                }
            }
            _ => return Err(bad_name()),
        }
        Ok(())
    }

    fn finish(self, prefix: &str) -> Result<AdamState> {
        let num_params = self.num_params.ok_or_else(|| {
            TppoError::Checkpoint(format!("{}.num_params missing", prefix))
        })?;

        let mut params: Vec<Option<ParamState>> = (0..num_params).map(|_| None).collect();
        for (idx, partial) in self.params {
            if idx >= num_params {
                return Err(TppoError::Checkpoint(format!(
                    "{}.{} is out of range for {} parameters",
                    prefix, idx, num_params
                )));
            }
            match (partial.step, partial.exp_avg, partial.exp_avg_sq) {
                (Some(step), Some(exp_avg), Some(exp_avg_sq)) => {
                    params[idx] = Some(ParamState {
                        step,
                        exp_avg,
                        exp_avg_sq,
                    });
                }
                _ => {
                    return Err(TppoError::Checkpoint(format!(
                        "{}.{} is missing step or moment buffers",
                        prefix, idx
                    )))
                }
            }
        }
        Ok(AdamState { params })
    }
}
