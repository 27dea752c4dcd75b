//! Core environment and simulator traits.
//!
//! [`Environment`] is the uniform surface the pool drives; [`Simulator`] is
//! the seam behind which the actual embodied simulator lives (an HTTP-hosted
//! process, or a scripted in-memory stand-in).

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::observation::{EpisodeInfo, Observation, StepOutcome};

/// Bookkeeping every simulator reports with a transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimInfo {
    /// Step counter within the episode, starting at 1.
    pub env_step: u64,
    /// Natural-language feedback describing the action outcome.
    pub env_feedback: String,
    /// Whether the task has been fully accomplished.
    pub task_success: bool,
    /// Fraction of subgoals accomplished so far.
    pub task_progress: f64,
}

/// One simulator transition: the new frame plus scalar feedback.
#[derive(Debug, Clone)]
pub struct SimTransition {
    pub frame: RgbImage,
    /// The simulator's own reward signal. The environment wrapper computes
    /// its reward from format compliance and task success instead.
    pub reward: f64,
    pub done: bool,
    pub info: SimInfo,
}

/// One backing simulator instance (one embodied scene).
///
/// Calls are coarse-blocking and may take seconds; the pool runs each on a
/// dedicated blocking thread.
pub trait Simulator: Send {
    /// The decoded action representation this simulator accepts.
    type Action;

    /// Load the episode selected by eval set and index, returning the first
    /// rendered frame.
    fn reset(&mut self, eval_set: &str, episode_index: u64) -> Result<RgbImage>;

    /// Advance one transition.
    fn step(&mut self, action: &Self::Action) -> Result<SimTransition>;

    /// The language instruction for the currently loaded episode.
    fn instruction(&self) -> &str;

    /// Release any held resources. Idempotent.
    fn close(&mut self);
}

/// The uniform environment interface the pool drives.
///
/// All methods are synchronous; concurrency happens one level up, in the
/// pool's worker dispatch.
pub trait Environment: Send {
    /// Start the episode selected by `seed`, clearing all per-episode state.
    fn reset(&mut self, seed: u64) -> Result<(Observation, EpisodeInfo)>;

    /// Apply one raw policy response and advance the episode.
    fn step(&mut self, raw_response: &str) -> Result<StepOutcome>;

    /// The discounted return accumulated since the last reset.
    fn compute_reward(&self) -> f64;

    /// The system prompt for the current episode.
    fn system_prompt(&self) -> Result<String>;

    /// Release the backing simulator. Valid in any state, and terminal:
    /// later resets and steps fail.
    fn close(&mut self);
}
