use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crucible_core::{BanditConfig, BanditPolicy};
use crucible_types::BanditArm;

use crate::SelectionError;

#[derive(Debug, Default)]
struct ArmState {
    pulls: u64,
    reward_sum: f64,
    // Selections handed out but not yet rewarded.
    in_flight: u64,
}

/// Multi-armed bandit over string arm ids.
///
/// Each arm has its own lock, so reward updates never contend with one
/// another. Selection itself is serialized so that in-flight pulls are
/// visible to the next caller and concurrent tasks fan out across arms that
/// are still in their cold-start phase.
pub struct BanditSelector {
    config: BanditConfig,
    arms: RwLock<HashMap<String, Arc<Mutex<ArmState>>>>,
    select_lock: Mutex<SmallRng>,
}

impl BanditSelector {
    pub fn new(config: BanditConfig) -> Self {
        Self::with_rng(config, SmallRng::from_entropy())
    }

    pub fn with_seed(config: BanditConfig, seed: u64) -> Self {
        Self::with_rng(config, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(config: BanditConfig, rng: SmallRng) -> Self {
        Self {
            config,
            arms: RwLock::new(HashMap::new()),
            select_lock: Mutex::new(rng),
        }
    }

    fn arm(&self, arm_id: &str) -> Arc<Mutex<ArmState>> {
        if let Some(arm) = self.arms.read().get(arm_id) {
            return arm.clone();
        }
        self.arms
            .write()
            .entry(arm_id.to_string())
            .or_default()
            .clone()
    }

    pub fn select_arm(&self, candidates: &[String]) -> Result<String, SelectionError> {
        let mut ids = Vec::with_capacity(candidates.len());
        for id in candidates {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        if ids.is_empty() {
            return Err(SelectionError::NoCandidates);
        }

        let mut rng = self.select_lock.lock();
        let arms = ids.iter().map(|id| self.arm(id)).collect::<Vec<_>>();
        let stats = arms
            .iter()
            .map(|arm| {
                let state = arm.lock();
                (state.pulls, state.reward_sum, state.in_flight)
            })
            .collect::<Vec<_>>();

        let cold = stats
            .iter()
            .enumerate()
            .filter(|(_, (pulls, _, in_flight))| pulls + in_flight < self.config.cold_start_pulls)
            .map(|(idx, (pulls, _, in_flight))| (idx, pulls + in_flight))
            .collect::<Vec<_>>();

        let chosen = if let Some(least) = cold.iter().map(|(_, load)| *load).min() {
            let tied = cold
                .iter()
                .filter(|(_, load)| *load == least)
                .map(|(idx, _)| *idx)
                .collect::<Vec<_>>();
            pick(&mut *rng, &tied)
        } else {
            match self.config.policy {
                BanditPolicy::EpsilonGreedy => {
                    if rng.gen_bool(self.config.epsilon.clamp(0.0, 1.0)) {
                        rng.gen_range(0..ids.len())
                    } else {
                        let scores = stats.iter().map(|s| mean_of(s.0, s.1)).collect::<Vec<_>>();
                        best(&mut *rng, &scores)
                    }
                }
                BanditPolicy::Ucb1 => {
                    let total = stats.iter().map(|s| s.0 + s.2).sum::<u64>().max(1) as f64;
                    let scores = stats
                        .iter()
                        .map(|(pulls, reward_sum, in_flight)| {
                            let n = (pulls + in_flight).max(1) as f64;
                            mean_of(*pulls, *reward_sum)
                                + self.config.exploration * (total.ln() / n).sqrt()
                        })
                        .collect::<Vec<_>>();
                    best(&mut *rng, &scores)
                }
            }
        };

        arms[chosen].lock().in_flight += 1;
        Ok(ids.swap_remove(chosen))
    }

    /// Records one pull. Non-finite rewards count as zero.
    pub fn record_reward(&self, arm_id: &str, reward: f64) {
        let reward = if reward.is_finite() {
            reward
        } else {
            tracing::warn!(arm = %arm_id, reward, "non-finite reward recorded as 0");
            0.0
        };
        let arm = self.arm(arm_id);
        let mut state = arm.lock();
        state.pulls += 1;
        state.reward_sum += reward;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Returns a selection that will never be rewarded (e.g. cancelled work).
    pub fn release(&self, arm_id: &str) {
        if let Some(arm) = self.arms.read().get(arm_id) {
            let mut state = arm.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }

    /// Operator reset. Returns false when the arm was unknown.
    pub fn reset(&self, arm_id: &str) -> bool {
        let Some(arm) = self.arms.read().get(arm_id).cloned() else {
            return false;
        };
        let mut state = arm.lock();
        state.pulls = 0;
        state.reward_sum = 0.0;
        tracing::info!(arm = %arm_id, "bandit arm reset");
        true
    }

    pub fn arm_stats(&self, arm_id: &str) -> Option<BanditArm> {
        let arm = self.arms.read().get(arm_id).cloned()?;
        let state = arm.lock();
        Some(BanditArm {
            id: arm_id.to_string(),
            pulls: state.pulls,
            reward_sum: state.reward_sum,
        })
    }

    pub fn mean(&self, arm_id: &str) -> Option<f64> {
        self.arm_stats(arm_id).and_then(|arm| arm.mean())
    }

    pub fn snapshot(&self) -> Vec<BanditArm> {
        let mut arms = self
            .arms
            .read()
            .iter()
            .map(|(id, arm)| {
                let state = arm.lock();
                BanditArm {
                    id: id.clone(),
                    pulls: state.pulls,
                    reward_sum: state.reward_sum,
                }
            })
            .collect::<Vec<_>>();
        arms.sort_by(|a, b| a.id.cmp(&b.id));
        arms
    }
}

fn mean_of(pulls: u64, reward_sum: f64) -> f64 {
    if pulls == 0 {
        0.0
    } else {
        reward_sum / pulls as f64
    }
}

fn pick(rng: &mut SmallRng, indices: &[usize]) -> usize {
    indices.choose(rng).copied().unwrap_or(0)
}

fn best(rng: &mut SmallRng, scores: &[f64]) -> usize {
    let top = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let tied = scores
        .iter()
        .enumerate()
        .filter(|(_, score)| (**score - top).abs() < 1e-12)
        .map(|(idx, _)| idx)
        .collect::<Vec<_>>();
    pick(rng, &tied)
}
