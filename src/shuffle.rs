//! Permutation generation for the inference engine.
//!
//! A `Shuffler` is a restartable, finite, deterministic sequence of unique
//! permutations of `0..n`. Shuffle 0 is always the identity (the observed
//! ordering); later shuffles are drawn without replacement from a seeded
//! generator. When exchangeability blocks are given, indices move freely
//! within a block and never across blocks, and the number of reachable
//! permutations shrinks to the product of per-block factorials — asking
//! for more than that orbit is refused up front rather than looping
//! forever.

use ahash::AHashSet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShuffleError {
    #[error(
        "requested {requested} permutations but the exchangeability structure \
         only admits {available}"
    )]
    InsufficientPermutations { requested: usize, available: usize },
    #[error("exchangeability blocks cover {found} subjects, expected {expected}")]
    BlockLengthMismatch { found: usize, expected: usize },
}

/// One permutation of subject indices, tagged with its sequence position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shuffle {
    pub index: usize,
    pub order: Vec<usize>,
}

impl Shuffle {
    pub fn is_identity(&self) -> bool {
        self.order.iter().enumerate().all(|(i, &j)| i == j)
    }
}

/// Deterministic generator of unique permutations under block constraints.
#[derive(Debug)]
pub struct Shuffler {
    n_subjects: usize,
    n_permutations: usize,
    /// Subject positions grouped by block, in block-label order of first
    /// appearance. A single implicit block when no constraints are given.
    block_positions: Vec<Vec<usize>>,
    seed: u64,
    rng: StdRng,
    seen: AHashSet<Vec<usize>>,
    emitted: usize,
}

impl Shuffler {
    /// `n_permutations` counts the identity, matching the convention that
    /// the observed statistic is shuffle 0 of the null sequence.
    pub fn new(
        n_subjects: usize,
        n_permutations: usize,
        exchangeability_blocks: Option<&[usize]>,
        seed: u64,
    ) -> Result<Self, ShuffleError> {
        let block_positions = match exchangeability_blocks {
            Some(blocks) => {
                if blocks.len() != n_subjects {
                    return Err(ShuffleError::BlockLengthMismatch {
                        found: blocks.len(),
                        expected: n_subjects,
                    });
                }
                let mut order: Vec<usize> = Vec::new();
                let mut positions: Vec<Vec<usize>> = Vec::new();
                for (position, &label) in blocks.iter().enumerate() {
                    match order.iter().position(|&seen| seen == label) {
                        Some(slot) => positions[slot].push(position),
                        None => {
                            order.push(label);
                            positions.push(vec![position]);
                        }
                    }
                }
                positions
            }
            None => vec![(0..n_subjects).collect()],
        };

        let available = orbit_size(&block_positions);
        if n_permutations as f64 > available {
            return Err(ShuffleError::InsufficientPermutations {
                requested: n_permutations,
                available: available as usize,
            });
        }

        Ok(Shuffler {
            n_subjects,
            n_permutations,
            block_positions,
            seed,
            rng: StdRng::seed_from_u64(seed),
            seen: AHashSet::new(),
            emitted: 0,
        })
    }

    /// Number of shuffles the iterator will emit, identity included.
    pub fn len(&self) -> usize {
        self.n_permutations
    }

    pub fn is_empty(&self) -> bool {
        self.n_permutations == 0
    }

    /// Rewinds to the identity; the same seed replays the same sequence.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.seen.clear();
        self.emitted = 0;
    }

    fn draw_candidate(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.n_subjects).collect();
        for positions in &self.block_positions {
            let mut values: Vec<usize> = positions.iter().map(|&p| order[p]).collect();
            values.shuffle(&mut self.rng);
            for (&p, &v) in positions.iter().zip(values.iter()) {
                order[p] = v;
            }
        }
        order
    }
}

/// Number of permutations reachable under the block structure, Π |b|!,
/// saturating once it exceeds anything a caller could request.
fn orbit_size(block_positions: &[Vec<usize>]) -> f64 {
    let mut total = 1.0_f64;
    for positions in block_positions {
        for k in 2..=positions.len() {
            total *= k as f64;
            if total > 1e18 {
                return 1e18;
            }
        }
    }
    total
}

impl Iterator for Shuffler {
    type Item = Shuffle;

    fn next(&mut self) -> Option<Shuffle> {
        if self.emitted >= self.n_permutations {
            return None;
        }
        let order = if self.emitted == 0 {
            let identity: Vec<usize> = (0..self.n_subjects).collect();
            self.seen.insert(identity.clone());
            identity
        } else {
            loop {
                let candidate = self.draw_candidate();
                if self.seen.insert(candidate.clone()) {
                    break candidate;
                }
            }
        };
        let shuffle = Shuffle {
            index: self.emitted,
            order,
        };
        self.emitted += 1;
        Some(shuffle)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.n_permutations - self.emitted;
        (remaining, Some(remaining))
    }
}
