//! Observation and per-step bookkeeping types shared by every environment
//! kind.

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Token environments embed in observation text where a frame belongs.
pub const IMAGE_PLACEHOLDER: &str = "<image>";

/// An observation produced by `reset` or `step`.
///
/// `text` contains one placeholder occurrence per entry of `images`, in
/// order. Frames stay as raw RGB in memory; anything crossing the service
/// boundary goes through [`crate::serial::serialize_observation`] first.
#[derive(Debug, Clone)]
pub struct Observation {
    /// The rendered prompt text shown to the policy.
    pub text: String,
    /// The placeholder token marking frame positions inside `text`.
    pub image_placeholder: &'static str,
    /// Frames referenced by the placeholder.
    pub images: Vec<RgbImage>,
}

/// One transition recorded in the episode's interaction history.
///
/// History entries are rendered as pretty JSON into the next user prompt, so
/// the field names here are part of the prompt format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The simulator's step counter for this transition.
    pub step_id: u64,
    /// Text the policy produced inside the think block.
    pub thinking: String,
    /// Canonical rendering of the action block.
    pub action: String,
    /// The simulator's feedback describing the action outcome.
    pub env_feedback: String,
}

/// Metrics for the transition that just happened.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TurnMetrics {
    /// Fraction of subgoals accomplished so far.
    pub task_progress: f64,
    /// Whether the task was accomplished on this step.
    pub task_success: bool,
}

/// Metrics describing the whole trajectory so far.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrajMetrics {
    pub task_success: bool,
}

/// The metrics bundle carried in [`StepInfo`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    pub turn_metrics: TurnMetrics,
    pub traj_metrics: TrajMetrics,
}

/// Extra information returned alongside each step result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub metrics: StepMetrics,
    /// The unparsed policy output that produced this step.
    pub llm_raw_response: String,
}

/// Information returned by `reset` describing the fresh episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeInfo {
    /// Evaluation subset the seed selected.
    pub eval_set: String,
    /// Episode index within the subset.
    pub episode_index: u64,
    /// The episode's natural-language instruction.
    pub instruction: String,
}

/// The full result of one environment step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

/// Compose the user-visible prompt from the instruction and the accumulated
/// interaction history.
pub fn compose_user_prompt(instruction: &str, history: &[HistoryEntry]) -> Result<String> {
    let rendered = if history.is_empty() {
        "interaction_history: []\n".to_string()
    } else {
        let json = serde_json::to_string_pretty(history)?;
        format!("interaction_history: {json} \n ")
    };
    Ok(format!(
        "{IMAGE_PLACEHOLDER}\n instruction: {instruction} \n {rendered}\
         Based on the above information, please provide the action for the \
         next step to complete the task. Think, then act."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_with_empty_history() {
        let prompt = compose_user_prompt("Put the apple in the fridge.", &[]).unwrap();
        assert!(prompt.starts_with("<image>\n instruction: Put the apple in the fridge."));
        assert!(prompt.contains("interaction_history: []"));
        assert!(prompt.ends_with("Think, then act."));
    }

    #[test]
    fn prompt_embeds_history_as_json() {
        let history = vec![HistoryEntry {
            step_id: 1,
            thinking: "look for the apple".into(),
            action: "[2, find a CounterTop]".into(),
            env_feedback: "Last action executed successfully.".into(),
        }];
        let prompt = compose_user_prompt("Put the apple in the fridge.", &history).unwrap();
        assert!(prompt.contains("\"step_id\": 1"));
        assert!(prompt.contains("\"thinking\": \"look for the apple\""));
        assert!(prompt.contains("\"action\": \"[2, find a CounterTop]\""));
        assert!(prompt.contains("\"env_feedback\": \"Last action executed successfully.\""));
    }
}
