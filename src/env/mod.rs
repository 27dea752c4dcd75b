//! Task environment abstractions and concrete implementations.
//!
//! Every environment implements the [`Environment`] trait so that the pool
//! can drive it uniformly.
//!
//! Included environments:
//! - **Kitchen** ([`kitchen`]) -- household tasks over a discrete skill
//!   inventory (find, pick up, slice, heat, ...).
//! - **Tabletop** ([`tabletop`]) -- manipulation tasks driven by 7-DoF
//!   discrete gripper poses.
//!
//! Each environment module also exposes a `Scripted*Sim` backend that replays
//! canned episodes, making it possible to test the full pool without a
//! simulator server.

pub mod catalog;
pub mod kitchen;
pub mod observation;
pub mod parse;
pub mod tabletop;
pub mod traits;

// Re-export the core trait and observation types at the module level.
pub use observation::{EpisodeInfo, Observation, StepInfo, StepOutcome};
pub use traits::Environment;

/// Reward granted per step when the response carries a well-formed action.
pub const FORMAT_BONUS: f64 = 1.0;

/// Reward granted on the step that completes the task.
pub const SUCCESS_BONUS: f64 = 20.0;

/// How many episodes each evaluation set holds.
const EPISODES_PER_SET: u64 = 100;

/// Map a seed onto an (evaluation set, episode index) pair.
///
/// Seeds partition into blocks of [`EPISODES_PER_SET`]: block `k` selects the
/// `k`-th entry of `eval_sets` and the remainder picks the episode inside it.
/// The same seed always lands on the same episode.
pub fn seed_to_selection(eval_sets: &[&'static str], seed: u64) -> anyhow::Result<(&'static str, u64)> {
    let block = (seed / EPISODES_PER_SET) as usize;
    match eval_sets.get(block) {
        Some(eval_set) => Ok((eval_set, seed % EPISODES_PER_SET)),
        None => anyhow::bail!(
            "seed {seed} is out of range, {} eval sets cover seeds 0..{}",
            eval_sets.len(),
            eval_sets.len() as u64 * EPISODES_PER_SET
        ),
    }
}

// ---------------------------------------------------------------------------
// TaskEnv: enum dispatch wrapper for dynamic environment selection
// ---------------------------------------------------------------------------

/// An enum wrapper around all concrete environment types, enabling runtime
/// environment selection without `dyn`.
#[derive(Debug)]
pub enum TaskEnv {
    Kitchen(kitchen::KitchenEnv),
    Tabletop(tabletop::TabletopEnv),
}

impl TaskEnv {
    /// Validate the configuration and build the matching environment.
    pub fn build(config: &crate::config::EnvConfig) -> anyhow::Result<Self> {
        config.validate()?;
        match config {
            crate::config::EnvConfig::Kitchen(c) => {
                Ok(Self::Kitchen(kitchen::KitchenEnv::new(c.clone())?))
            }
            crate::config::EnvConfig::Tabletop(c) => {
                Ok(Self::Tabletop(tabletop::TabletopEnv::new(c.clone())?))
            }
        }
    }

    /// Short label for the environment kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kitchen(_) => "kitchen",
            Self::Tabletop(_) => "tabletop",
        }
    }
}

impl Environment for TaskEnv {
    fn reset(&mut self, seed: u64) -> anyhow::Result<(Observation, EpisodeInfo)> {
        match self {
            Self::Kitchen(e) => e.reset(seed),
            Self::Tabletop(e) => e.reset(seed),
        }
    }

    fn step(&mut self, raw_response: &str) -> anyhow::Result<StepOutcome> {
        match self {
            Self::Kitchen(e) => e.step(raw_response),
            Self::Tabletop(e) => e.step(raw_response),
        }
    }

    fn compute_reward(&self) -> f64 {
        match self {
            Self::Kitchen(e) => e.compute_reward(),
            Self::Tabletop(e) => e.compute_reward(),
        }
    }

    fn system_prompt(&self) -> anyhow::Result<String> {
        match self {
            Self::Kitchen(e) => e.system_prompt(),
            Self::Tabletop(e) => e.system_prompt(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Kitchen(e) => e.close(),
            Self::Tabletop(e) => e.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfig, KitchenEnvConfig, TabletopEnvConfig};

    #[test]
    fn seed_maps_to_eval_set_blocks() {
        let sets = ["base", "spatial", "common_sense"];
        assert_eq!(seed_to_selection(&sets, 0).unwrap(), ("base", 0));
        assert_eq!(seed_to_selection(&sets, 99).unwrap(), ("base", 99));
        assert_eq!(seed_to_selection(&sets, 100).unwrap(), ("spatial", 0));
        assert_eq!(seed_to_selection(&sets, 257).unwrap(), ("common_sense", 57));
    }

    #[test]
    fn seed_beyond_the_last_set_errors() {
        let sets = ["base"];
        let err = seed_to_selection(&sets, 100).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn build_dispatches_on_config_kind() {
        let kitchen = TaskEnv::build(&EnvConfig::Kitchen(KitchenEnvConfig::default())).unwrap();
        assert_eq!(kitchen.kind(), "kitchen");

        let tabletop = TaskEnv::build(&EnvConfig::Tabletop(TabletopEnvConfig::default())).unwrap();
        assert_eq!(tabletop.kind(), "tabletop");
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = EnvConfig::Kitchen(KitchenEnvConfig {
            gamma: -1.0,
            ..Default::default()
        });
        assert!(TaskEnv::build(&config).is_err());
    }

    #[test]
    fn task_env_dispatches_to_the_wrapped_env() {
        let mut env = TaskEnv::build(&EnvConfig::Tabletop(TabletopEnvConfig::default())).unwrap();
        let (obs, info) = env.reset(0).unwrap();
        assert_eq!(info.eval_set, "base");
        assert!(!obs.text.is_empty());
        assert!(env.system_prompt().unwrap().contains("Franka Panda"));
        env.close();
        assert!(env.reset(0).is_err());
    }
}
