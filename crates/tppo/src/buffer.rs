//! Token-level rollout samples and minibatch sources.

use crate::{Result, TppoError};
use ndarray::{Array3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// One minibatch of token-level experience.
///
/// Per-token arrays are `[batch, num_agents, max_tokens]`; `action_tokens`
/// is padded with the tokenizer's pad id past each action's end.
pub struct TokenSample<O> {
    pub observations: Vec<O>,
    /// Decoded action text per row and agent
    pub actions: Vec<Vec<String>>,
    /// Observations the token forward passes are conditioned on
    pub rollout_observations: Vec<O>,
    /// Log-probabilities of the taken tokens under the rollout policy
    pub log_probs: Array3<f32>,
    /// Critic values recorded during the rollout
    pub value_preds: Array3<f32>,
    pub returns: Array3<f32>,
    pub advantages: Array3<f32>,
    pub action_tokens: Array3<i64>,
}

impl<O> TokenSample<O> {
    pub fn batch_size(&self) -> usize {
        self.action_tokens.len_of(Axis(0))
    }

    /// `[batch, num_agents, max_tokens]`
    pub fn token_shape(&self) -> [usize; 3] {
        let dim = self.action_tokens.dim();
        [dim.0, dim.1, dim.2]
    }

    /// Check that every array shares the batch dimension and every per-token
    /// array shares the shape of `action_tokens`
    pub fn validate(&self) -> Result<()> {
        let expected = self.action_tokens.shape().to_vec();
        for array in [
            &self.log_probs,
            &self.value_preds,
            &self.returns,
            &self.advantages,
        ] {
            if array.shape() != expected.as_slice() {
                return Err(TppoError::ShapeMismatch {
                    expected,
                    actual: array.shape().to_vec(),
                });
            }
        }

        let batch = self.batch_size();
        for len in [
            self.observations.len(),
            self.actions.len(),
            self.rollout_observations.len(),
        ] {
            if len != batch {
                return Err(TppoError::ShapeMismatch {
                    expected: vec![batch],
                    actual: vec![len],
                });
            }
        }
        Ok(())
    }
}

impl<O: Clone> TokenSample<O> {
    /// Rows at `indices`, in that order
    pub fn select(&self, indices: &[usize]) -> Self {
        let pick = |v: &[O]| indices.iter().map(|&i| v[i].clone()).collect::<Vec<_>>();
        Self {
            observations: pick(self.observations.as_slice()),
            actions: indices.iter().map(|&i| self.actions[i].clone()).collect(),
            rollout_observations: pick(self.rollout_observations.as_slice()),
            log_probs: self.log_probs.select(Axis(0), indices),
            value_preds: self.value_preds.select(Axis(0), indices),
            returns: self.returns.select(Axis(0), indices),
            advantages: self.advantages.select(Axis(0), indices),
            action_tokens: self.action_tokens.select(Axis(0), indices),
        }
    }
}

/// Source of minibatches for the epoch driver
pub trait TokenBuffer<O> {
    /// Lazily yield the minibatches of one pass. Each call starts a new pass.
    fn sample(&mut self, num_mini_batch: usize) -> Box<dyn Iterator<Item = TokenSample<O>> + '_>;
}

/// In-memory buffer holding one rollout
pub struct RolloutTokenBuffer<O> {
    data: TokenSample<O>,
    rng: StdRng,
}

impl<O: Clone> RolloutTokenBuffer<O> {
    pub fn new(data: TokenSample<O>, seed: u64) -> Result<Self> {
        data.validate()?;
        Ok(Self {
            data,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.data.batch_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &TokenSample<O> {
        &self.data
    }
}

impl<O: Clone> TokenBuffer<O> for RolloutTokenBuffer<O> {
    /// Shuffle the rollout and yield `num_mini_batch` disjoint minibatches of
    /// `len / num_mini_batch` rows; leftover rows are not visited this pass.
    fn sample(&mut self, num_mini_batch: usize) -> Box<dyn Iterator<Item = TokenSample<O>> + '_> {
        let batch_size = self.data.batch_size();
        let mini_batch_size = if num_mini_batch == 0 {
            0
        } else {
            batch_size / num_mini_batch
        };
        if mini_batch_size == 0 {
            tracing::warn!(
                batch_size,
                num_mini_batch,
                "Buffer too small for the requested minibatches"
            );
            return Box::new(std::iter::empty());
        }

        let mut perm: Vec<usize> = (0..batch_size).collect();
        perm.shuffle(&mut self.rng);

        let data = &self.data;
        Box::new((0..num_mini_batch).map(move |i| {
            data.select(&perm[i * mini_batch_size..(i + 1) * mini_batch_size])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(batch: usize) -> TokenSample<String> {
        let shape = (batch, 2, 3);
        TokenSample {
            observations: (0..batch).map(|i| format!("obs {}", i)).collect(),
            actions: (0..batch).map(|i| vec![format!("a{}", i); 2]).collect(),
            rollout_observations: (0..batch).map(|i| format!("obs {}", i)).collect(),
            log_probs: Array3::from_shape_fn(shape, |(b, _, _)| b as f32),
            value_preds: Array3::zeros(shape),
            returns: Array3::zeros(shape),
            advantages: Array3::zeros(shape),
            action_tokens: Array3::from_elem(shape, 1),
        }
    }

    #[test]
    fn test_validate_shapes() {
        let mut s = sample(4);
        assert!(s.validate().is_ok());
        assert_eq!(s.token_shape(), [4, 2, 3]);

        s.returns = Array3::zeros((4, 2, 2));
        assert!(matches!(
            s.validate(),
            Err(TppoError::ShapeMismatch { .. })
        ));

        let mut s = sample(4);
        s.rollout_observations.pop();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_select_keeps_rows_aligned() {
        let s = sample(5);
        let picked = s.select(&[3, 1]);
        assert_eq!(picked.batch_size(), 2);
        assert_eq!(picked.rollout_observations, vec!["obs 3", "obs 1"]);
        assert_eq!(picked.log_probs[[0, 1, 2]], 3.0);
        assert_eq!(picked.log_probs[[1, 0, 0]], 1.0);
    }

    #[test]
    fn test_sample_yields_disjoint_minibatches() {
        let mut buffer = RolloutTokenBuffer::new(sample(10), 7).unwrap();
        let batches: Vec<_> = buffer.sample(3).collect();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.batch_size() == 3));

        let mut rows: Vec<f32> = batches
            .iter()
            .flat_map(|b| b.log_probs.index_axis(Axis(1), 0).index_axis(Axis(1), 0).to_vec())
            .collect();
        rows.sort_by(|a, b| a.partial_cmp(b).unwrap());
        rows.dedup();
        assert_eq!(rows.len(), 9);
    }

    #[test]
    fn test_sample_is_restartable() {
        let mut buffer = RolloutTokenBuffer::new(sample(4), 0).unwrap();
        assert_eq!(buffer.sample(2).count(), 2);
        assert_eq!(buffer.sample(2).count(), 2);
    }

    #[test]
    fn test_sample_too_small() {
        let mut buffer = RolloutTokenBuffer::new(sample(2), 0).unwrap();
        assert_eq!(buffer.sample(4).count(), 0);
    }
}
