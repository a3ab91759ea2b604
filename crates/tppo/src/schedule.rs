//! Agent rotation and gradient-checkpoint chunking.

use crate::mas::AgentSelection;

/// Agent trained at `global_steps`.
///
/// With a positive `interval` the schedule walks round-robin over agent
/// indices, moving every `interval` steps and starting at index 1:
/// steps in `[k * interval, (k + 1) * interval)` train agent `(k + 1) % num_agents`.
/// An interval of 0 trains all agents jointly.
pub fn agent_to_train(global_steps: u64, interval: u64, num_agents: usize) -> AgentSelection {
    if interval == 0 || num_agents == 0 {
        return AgentSelection::Joint;
    }
    let time_slice = global_steps / interval;
    AgentSelection::Single(((time_slice + 1) % num_agents as u64) as usize)
}

/// A contiguous slice of the minibatch processed in one forward/backward pass
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradientChunk {
    pub start: usize,
    pub len: usize,
    /// `len / batch_size`; scales the chunk loss so accumulated gradients
    /// equal the gradient of the full-batch loss
    pub weight: f64,
}

/// Split `batch_size` rows into `gradient_cp_steps` contiguous chunks.
///
/// The last chunk absorbs the remainder. When `gradient_cp_steps` exceeds the
/// batch the chunk size is floored to one row; a value of 0 processes the
/// batch in a single chunk. Chunk weights always sum to 1.
pub fn gradient_chunks(batch_size: usize, gradient_cp_steps: usize) -> Vec<GradientChunk> {
    if batch_size == 0 {
        return Vec::new();
    }

    let steps = if gradient_cp_steps == 0 {
        tracing::warn!("gradient_cp_steps is 0, processing the batch in one chunk");
        1
    } else if gradient_cp_steps > batch_size {
        tracing::warn!(
            gradient_cp_steps,
            batch_size,
            "gradient_cp_steps > batch_size, set cp_batch_size = 1"
        );
        batch_size
    } else {
        gradient_cp_steps
    };

    let cp_batch_size = batch_size / steps;
    (0..steps)
        .map(|i| {
            let start = i * cp_batch_size;
            let end = if i + 1 == steps {
                batch_size
            } else {
                start + cp_batch_size
            };
            GradientChunk {
                start,
                len: end - start,
                weight: (end - start) as f64 / batch_size as f64,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_schedule() {
        let interval = 5;
        let num_agents = 3;
        for k in 0..10u64 {
            for step in k * interval..(k + 1) * interval {
                assert_eq!(
                    agent_to_train(step, interval, num_agents),
                    AgentSelection::Single(((k + 1) % num_agents as u64) as usize)
                );
            }
        }
    }

    #[test]
    fn test_rotation_disabled() {
        for step in [0, 1, 17, 1_000_000] {
            assert_eq!(agent_to_train(step, 0, 4), AgentSelection::Joint);
        }
    }

    #[test]
    fn test_chunks_even_split() {
        let chunks = gradient_chunks(8, 4);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len == 2 && (c.weight - 0.25).abs() < 1e-12));
        assert_eq!(chunks[3].start, 6);
    }

    #[test]
    fn test_last_chunk_absorbs_remainder() {
        let chunks = gradient_chunks(10, 3);
        let lens: Vec<usize> = chunks.iter().map(|c| c.len).collect();
        assert_eq!(lens, vec![3, 3, 4]);
        let total: f64 = chunks.iter().map(|c| c.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cp_steps_exceeding_batch() {
        let chunks = gradient_chunks(3, 8);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len == 1));
        let total: f64 = chunks.iter().map(|c| c.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_cp_steps_single_chunk() {
        let chunks = gradient_chunks(5, 0);
        assert_eq!(
            chunks,
            vec![GradientChunk {
                start: 0,
                len: 5,
                weight: 1.0
            }]
        );
        assert!(gradient_chunks(0, 4).is_empty());
    }
}
