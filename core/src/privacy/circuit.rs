// Path Selection: random mix cascades for every packet
//
// Paths are sampled without replacement from the active mixes, in random
// order, and end at the terminal node: the recipient's provider for
// messages and loop cover, a random mix for drop cover.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use super::sphinx::MAX_HOPS;
use crate::descriptor::{ParticipantDescriptor, Path};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Not enough mixes: need {needed}, have {available}")]
    InsufficientMixes { needed: usize, available: usize },
    #[error("Path of {0} nodes exceeds the packet format maximum of {MAX_HOPS}")]
    PathTooLong(usize),
}

/// Builds fresh paths from a generator it owns
pub struct PathSelector {
    rng: StdRng,
}

impl PathSelector {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng }
    }

    /// `hop_count` distinct mixes in random order, then `final_provider`
    pub fn select_path(
        &mut self,
        active_mixes: &[ParticipantDescriptor],
        hop_count: usize,
        final_provider: &ParticipantDescriptor,
    ) -> Result<Path, PathError> {
        check_length(hop_count)?;
        if active_mixes.len() < hop_count {
            return Err(PathError::InsufficientMixes {
                needed: hop_count,
                available: active_mixes.len(),
            });
        }

        let mut hops: Vec<ParticipantDescriptor> = active_mixes
            .choose_multiple(&mut self.rng, hop_count)
            .cloned()
            .collect();
        // choose_multiple does not guarantee a uniformly random order
        hops.shuffle(&mut self.rng);
        hops.push(final_provider.clone());
        Ok(Path::new(hops))
    }

    /// Path for drop cover: `hop_count` distinct mixes, then a different random mix
    pub fn select_drop_path(
        &mut self,
        active_mixes: &[ParticipantDescriptor],
        hop_count: usize,
    ) -> Result<Path, PathError> {
        check_length(hop_count)?;
        if active_mixes.len() < hop_count + 1 {
            return Err(PathError::InsufficientMixes {
                needed: hop_count + 1,
                available: active_mixes.len(),
            });
        }

        let last = self.rng.gen_range(0..active_mixes.len());
        let remaining: Vec<&ParticipantDescriptor> = active_mixes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != last)
            .map(|(_, d)| d)
            .collect();

        let mut hops: Vec<ParticipantDescriptor> = remaining
            .choose_multiple(&mut self.rng, hop_count)
            .map(|d| (*d).clone())
            .collect();
        hops.shuffle(&mut self.rng);
        hops.push(active_mixes[last].clone());
        Ok(Path::new(hops))
    }
}

impl Default for PathSelector {
    fn default() -> Self {
        Self::new()
    }
}

fn check_length(hop_count: usize) -> Result<(), PathError> {
    if hop_count + 1 > MAX_HOPS {
        return Err(PathError::PathTooLong(hop_count + 1));
    }
    Ok(())
}
