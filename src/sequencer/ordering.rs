/// Step ordering policies - which step index plays next
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SequencerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayMode {
    #[default]
    Sequential,
    Shuffled,
    FullyRandom,
}

impl PlayMode {
    pub const ALL: [PlayMode; 3] = [PlayMode::Sequential, PlayMode::Shuffled, PlayMode::FullyRandom];
}

impl fmt::Display for PlayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayMode::Sequential => "sequential",
            PlayMode::Shuffled => "shuffled",
            PlayMode::FullyRandom => "random",
        };
        f.write_str(name)
    }
}

impl FromStr for PlayMode {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Ok(PlayMode::Sequential),
            "shuffled" | "shuffle" => Ok(PlayMode::Shuffled),
            "random" | "fully-random" => Ok(PlayMode::FullyRandom),
            other => Err(SequencerError::Config(format!("unknown play mode: {}", other))),
        }
    }
}

pub struct StepOrdering {
    mode: PlayMode,
    order: Vec<usize>,
    rng: StdRng,
}

impl StepOrdering {
    pub fn new(total_steps: usize) -> Self {
        Self::with_rng(total_steps, StdRng::from_entropy())
    }

    /// Deterministic ordering for reproducible runs.
    pub fn with_seed(total_steps: usize, seed: u64) -> Self {
        Self::with_rng(total_steps, StdRng::seed_from_u64(seed))
    }

    fn with_rng(total_steps: usize, rng: StdRng) -> Self {
        Self {
            mode: PlayMode::Sequential,
            order: (0..total_steps).collect(),
            rng,
        }
    }

    pub fn mode(&self) -> PlayMode {
        self.mode
    }

    /// The visiting order. Identity unless in `Shuffled` mode.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Entering `Shuffled` always draws a fresh permutation, even when
    /// already shuffled. Leaving it restores the identity order.
    pub fn set_mode(&mut self, mode: PlayMode, total_steps: usize) {
        match mode {
            PlayMode::Shuffled => {
                self.order = (0..total_steps).collect();
                self.order.shuffle(&mut self.rng);
            }
            PlayMode::Sequential | PlayMode::FullyRandom => {
                if self.mode != mode || self.order.len() != total_steps {
                    self.order = (0..total_steps).collect();
                }
            }
        }
        self.mode = mode;
    }

    /// Index played when starting from a stopped transport.
    pub fn first_index(&self) -> usize {
        match self.mode {
            PlayMode::Shuffled => self.order.first().copied().unwrap_or(0),
            PlayMode::Sequential | PlayMode::FullyRandom => 0,
        }
    }

    /// Next index after `current`. The result is not bounds-checked against
    /// `total_steps` in `Shuffled` mode; the caller validates it.
    pub fn next_index(&mut self, current: usize, total_steps: usize) -> Option<usize> {
        if total_steps == 0 {
            return None;
        }
        match self.mode {
            PlayMode::Sequential => Some((current + 1) % total_steps),
            PlayMode::Shuffled => {
                let first = *self.order.first()?;
                match self.order.iter().position(|&i| i == current) {
                    Some(pos) => Some(self.order[(pos + 1) % self.order.len()]),
                    None => Some(first),
                }
            }
            PlayMode::FullyRandom => Some(self.rng.gen_range(0..total_steps)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_mode_parse() {
        assert_eq!("Shuffle".parse::<PlayMode>().unwrap(), PlayMode::Shuffled);
        assert_eq!("random".parse::<PlayMode>().unwrap(), PlayMode::FullyRandom);
        assert!("backwards".parse::<PlayMode>().is_err());
    }

    #[test]
    fn test_sequential_wraps() {
        let mut ordering = StepOrdering::new(4);
        let mut current = ordering.first_index();
        let mut visited = vec![current];
        for _ in 0..4 {
            current = ordering.next_index(current, 4).unwrap();
            visited.push(current);
        }
        assert_eq!(visited, vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_shuffled_is_permutation() {
        let mut ordering = StepOrdering::with_seed(4, 7);
        ordering.set_mode(PlayMode::Shuffled, 4);

        let mut current = ordering.first_index();
        let mut visited = vec![current];
        for _ in 0..3 {
            current = ordering.next_index(current, 4).unwrap();
            visited.push(current);
        }
        visited.sort();
        assert_eq!(visited, vec![0, 1, 2, 3]);

        // wraps back to the start of the permutation
        let next = ordering.next_index(current, 4).unwrap();
        assert_eq!(next, ordering.first_index());
    }

    #[test]
    fn test_shuffled_unknown_index_falls_back_to_first() {
        let mut ordering = StepOrdering::with_seed(4, 1);
        ordering.set_mode(PlayMode::Shuffled, 4);
        assert_eq!(ordering.next_index(42, 4), Some(ordering.order()[0]));
    }

    #[test]
    fn test_leaving_shuffled_restores_identity() {
        let mut ordering = StepOrdering::with_seed(16, 3);
        ordering.set_mode(PlayMode::Shuffled, 16);
        ordering.set_mode(PlayMode::FullyRandom, 16);
        assert_eq!(ordering.order(), (0..16).collect::<Vec<_>>().as_slice());
        ordering.set_mode(PlayMode::Sequential, 16);
        assert_eq!(ordering.next_index(5, 16), Some(6));
    }

    #[test]
    fn test_reentering_shuffled_regenerates() {
        let mut ordering = StepOrdering::with_seed(32, 11);
        ordering.set_mode(PlayMode::Shuffled, 32);
        let first = ordering.order().to_vec();
        ordering.set_mode(PlayMode::Shuffled, 32);
        let mut second = ordering.order().to_vec();
        // 32! permutations; a repeat would mean the RNG was not advanced
        assert_ne!(first, second);
        second.sort();
        assert_eq!(second, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_fully_random_stays_in_range() {
        let mut ordering = StepOrdering::with_seed(8, 5);
        ordering.set_mode(PlayMode::FullyRandom, 8);
        for _ in 0..500 {
            let next = ordering.next_index(0, 8).unwrap();
            assert!(next < 8);
        }
    }
}
