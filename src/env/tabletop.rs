//! Tabletop manipulation environment.
//!
//! The policy controls a parallel-gripper arm through 7-DoF discrete pose
//! actions `[X, Y, Z, Roll, Pitch, Yaw, Gripper]` written inside the action
//! delimiters. Backends mirror the kitchen module: an HTTP connector
//! ([`HttpTabletopSim`]) and a canned in-process script
//! ([`ScriptedTabletopSim`]).

use anyhow::{Context, Result};
use image::RgbImage;
use serde::Deserialize;

use super::observation::{
    compose_user_prompt, EpisodeInfo, HistoryEntry, Observation, StepInfo, StepMetrics,
    StepOutcome, TrajMetrics, TurnMetrics, IMAGE_PLACEHOLDER,
};
use super::parse::parse_tabletop_response;
use super::traits::{Environment, SimInfo, SimTransition, Simulator};
use super::{seed_to_selection, FORMAT_BONUS, SUCCESS_BONUS};
use crate::config::{SimBackend, TabletopEnvConfig};
use crate::serial::{decode_frame, EncodedFrame};

/// Evaluation subsets, in seed order: seeds 0-99 select `base`, 100-199
/// `common_sense`, and so on.
pub const TABLETOP_EVAL_SETS: [&str; 5] = ["base", "common_sense", "complex", "spatial", "visual"];

/// The tabletop system prompt is fixed: the action space is the same 7-DoF
/// pose grammar in every episode.
const TABLETOP_SYSTEM_PROMPT: &str = r#"## You are a Franka Panda robot with a parallel gripper. You can perform various tasks and output a sequence of gripper actions to accomplish a given task with images of your status. The input space, output action space and color space are defined as follows:

** Input Space **
- Each input object is represented as a 3D discrete position in the following format: [X, Y, Z].
- There is a red XYZ coordinate frame located in the top-left corner of the table. The X-Y plane is the table surface.
- The allowed range of X, Y, Z is [0, 100].
- Objects are ordered by Y in ascending order.

** Output Action Space **
- Each output action is represented as a 7D discrete gripper action in the following format: [X, Y, Z, Roll, Pitch, Yaw, Gripper state].
- X, Y, Z are the 3D discrete position of the gripper in the environment. It follows the same coordinate system as the input object coordinates.
- The allowed range of X, Y, Z is [0, 100].
- Roll, Pitch, Yaw are the 3D discrete orientation of the gripper in the environment, represented as discrete Euler Angles.
- The allowed range of Roll, Pitch, Yaw is [0, 120] and each unit represents 3 degrees.
- Gripper state is 0 for close and 1 for open.

** Color space **
- Each object can be described using one of the colors below:
  ["red", "maroon", "lime", "green", "blue", "navy", "yellow", "cyan", "magenta", "silver", "gray", "olive", "purple", "teal", "azure", "violet", "rose", "black", "white"],

** Generation Guide **
- Include the thinking process between <|think_start|> and <|think_end|>
- Include only the target action in <|action_start|> and <|action_end|>, i.e. the content inside <|action_start|> and <|action_end|> should be nothing more than the 7-DoF vector. Do not include any other thing, such as '"'.
"#;

// ---------------------------------------------------------------------------
// Environment wrapper
// ---------------------------------------------------------------------------

/// A tabletop environment: one simulator instance plus episode bookkeeping.
#[derive(Debug)]
pub struct TabletopEnv {
    sim: TabletopSim,
    /// Per-step discount applied to the episode return.
    gamma: f64,
    /// Selection made by the latest reset; `None` until the first reset.
    selection: Option<(&'static str, u64)>,
    instruction: String,
    history: Vec<HistoryEntry>,
    total_reward: f64,
    step_count: u32,
    closed: bool,
}

impl TabletopEnv {
    /// Build the environment and its simulator backend from configuration.
    pub fn new(config: TabletopEnvConfig) -> Result<Self> {
        let sim = match &config.backend {
            SimBackend::Http { base_url } => TabletopSim::Http(HttpTabletopSim::new(base_url)),
            SimBackend::Scripted => {
                TabletopSim::Scripted(ScriptedTabletopSim::new(config.resolution))
            }
        };
        Ok(Self {
            sim,
            gamma: config.gamma,
            selection: None,
            instruction: String::new(),
            history: Vec::new(),
            total_reward: 0.0,
            step_count: 0,
            closed: false,
        })
    }
}

impl Environment for TabletopEnv {
    fn reset(&mut self, seed: u64) -> Result<(Observation, EpisodeInfo)> {
        if self.closed {
            anyhow::bail!("environment is closed");
        }

        let (eval_set, episode_index) = seed_to_selection(&TABLETOP_EVAL_SETS, seed)?;
        let frame = self.sim.reset(eval_set, episode_index)?;

        self.selection = Some((eval_set, episode_index));
        self.instruction = self.sim.instruction().to_string();
        self.history.clear();
        self.total_reward = 0.0;
        self.step_count = 0;

        tracing::debug!(eval_set, episode_index, "tabletop environment reset");

        let text = compose_user_prompt(&self.instruction, &self.history)?;
        let observation = Observation {
            text,
            image_placeholder: IMAGE_PLACEHOLDER,
            images: vec![frame],
        };
        let info = EpisodeInfo {
            eval_set: eval_set.to_string(),
            episode_index,
            instruction: self.instruction.clone(),
        };
        Ok((observation, info))
    }

    fn step(&mut self, raw_response: &str) -> Result<StepOutcome> {
        if self.closed {
            anyhow::bail!("environment is closed");
        }
        if self.selection.is_none() {
            anyhow::bail!("cannot step an environment that was never reset");
        }

        let (pose, parsed) = parse_tabletop_response(raw_response);
        let transition = self.sim.step(&pose)?;

        let mut reward = 0.0;
        if parsed.format_correct {
            reward += FORMAT_BONUS;
        }
        if transition.info.task_success {
            reward += SUCCESS_BONUS;
        }
        self.total_reward += reward * self.gamma.powi(self.step_count as i32);
        self.step_count += 1;

        self.history.push(HistoryEntry {
            step_id: transition.info.env_step,
            thinking: parsed.thinking,
            action: parsed.action,
            env_feedback: transition.info.env_feedback.clone(),
        });

        let text = compose_user_prompt(&self.instruction, &self.history)?;
        let observation = Observation {
            text,
            image_placeholder: IMAGE_PLACEHOLDER,
            images: vec![transition.frame],
        };
        let info = StepInfo {
            metrics: StepMetrics {
                turn_metrics: TurnMetrics {
                    task_progress: transition.info.task_progress,
                    task_success: transition.info.task_success,
                },
                traj_metrics: TrajMetrics {
                    task_success: transition.info.task_success,
                },
            },
            llm_raw_response: raw_response.to_string(),
        };
        Ok(StepOutcome {
            observation,
            reward,
            done: transition.done,
            info,
        })
    }

    fn compute_reward(&self) -> f64 {
        self.total_reward
    }

    fn system_prompt(&self) -> Result<String> {
        Ok(TABLETOP_SYSTEM_PROMPT.to_string())
    }

    fn close(&mut self) {
        if !self.closed {
            self.sim.close();
            self.closed = true;
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator backends
// ---------------------------------------------------------------------------

/// Enum dispatch over the tabletop simulator backends.
#[derive(Debug)]
pub enum TabletopSim {
    Http(HttpTabletopSim),
    Scripted(ScriptedTabletopSim),
}

impl Simulator for TabletopSim {
    type Action = Vec<i64>;

    fn reset(&mut self, eval_set: &str, episode_index: u64) -> Result<RgbImage> {
        match self {
            Self::Http(sim) => sim.reset(eval_set, episode_index),
            Self::Scripted(sim) => sim.reset(eval_set, episode_index),
        }
    }

    fn step(&mut self, action: &Vec<i64>) -> Result<SimTransition> {
        match self {
            Self::Http(sim) => sim.step(action),
            Self::Scripted(sim) => sim.step(action),
        }
    }

    fn instruction(&self) -> &str {
        match self {
            Self::Http(sim) => sim.instruction(),
            Self::Scripted(sim) => sim.instruction(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Http(sim) => sim.close(),
            Self::Scripted(sim) => sim.close(),
        }
    }
}

/// A tabletop simulator hosted in a separate server process.
///
/// Speaks the same endpoint shapes as the kitchen connector, with the action
/// body carrying the pose vector: `{"action": [X, Y, Z, Roll, Pitch, Yaw, G]}`.
#[derive(Debug)]
pub struct HttpTabletopSim {
    base_url: String,
    http: reqwest::blocking::Client,
    instruction: String,
}

/// The JSON shape a simulator server returns from `/reset`.
#[derive(Debug, Deserialize)]
struct ServerReset {
    frame: EncodedFrame,
    instruction: String,
}

/// The JSON shape a simulator server returns from `/step`.
#[derive(Debug, Deserialize)]
struct ServerStep {
    frame: EncodedFrame,
    #[serde(default)]
    reward: f64,
    #[serde(default)]
    done: bool,
    info: SimInfo,
}

impl HttpTabletopSim {
    /// Create a simulator connector pointing at the given server.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::blocking::Client::new(),
            instruction: String::new(),
        }
    }
}

impl Simulator for HttpTabletopSim {
    type Action = Vec<i64>;

    fn reset(&mut self, eval_set: &str, episode_index: u64) -> Result<RgbImage> {
        let body = serde_json::json!({ "eval_set": eval_set, "episode_index": episode_index });
        let resp: ServerReset = self
            .http
            .post(format!("{}/reset", self.base_url))
            .json(&body)
            .send()
            .context("failed to reach tabletop simulator on reset")?
            .json()
            .context("failed to parse tabletop simulator reset response")?;

        self.instruction = resp.instruction;
        decode_frame(&resp.frame)
    }

    fn step(&mut self, action: &Vec<i64>) -> Result<SimTransition> {
        let body = serde_json::json!({ "action": action });
        let resp: ServerStep = self
            .http
            .post(format!("{}/step", self.base_url))
            .json(&body)
            .send()
            .context("failed to reach tabletop simulator on step")?
            .json()
            .context("failed to parse tabletop simulator step response")?;

        Ok(SimTransition {
            frame: decode_frame(&resp.frame)?,
            reward: resp.reward,
            done: resp.done,
            info: resp.info,
        })
    }

    fn instruction(&self) -> &str {
        &self.instruction
    }

    fn close(&mut self) {
        if let Err(err) = self.http.post(format!("{}/close", self.base_url)).send() {
            tracing::warn!(error = %err, "tabletop simulator close request failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted simulator for tests and offline runs
// ---------------------------------------------------------------------------

/// A scripted tabletop simulator.
///
/// Valid poses advance the canned script; invalid poses (wrong arity or out
/// of range) burn a step without advancing it, the way the real arm rejects
/// unreachable commands.
#[derive(Debug, Clone)]
pub struct ScriptedTabletopSim {
    episodes: Vec<ScriptedEpisode>,
    resolution: u32,
    active: usize,
    instruction: String,
    /// Counts every step call; reported as `env_step`.
    step_count: u64,
    /// Position within the canned script; advanced only by valid poses.
    script_pos: usize,
    last_progress: f64,
    done: bool,
    closed: bool,
}

/// A single canned episode.
#[derive(Debug, Clone)]
struct ScriptedEpisode {
    instruction: String,
    steps: Vec<ScriptedStep>,
}

#[derive(Debug, Clone)]
struct ScriptedStep {
    env_feedback: String,
    task_progress: f64,
    task_success: bool,
    done: bool,
}

impl ScriptedTabletopSim {
    pub fn new(resolution: u32) -> Self {
        Self {
            episodes: Self::default_episodes(),
            resolution,
            active: 0,
            instruction: String::new(),
            step_count: 0,
            script_pos: 0,
            last_progress: 0.0,
            done: false,
            closed: false,
        }
    }

    fn default_episodes() -> Vec<ScriptedEpisode> {
        vec![
            // 1. Stacking task (success).
            ScriptedEpisode {
                instruction: "Stack the maroon block on top of the navy block.".into(),
                steps: vec![
                    ScriptedStep {
                        env_feedback: "Gripper moved above the maroon block.".into(),
                        task_progress: 0.25,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "Gripper closed on the maroon block.".into(),
                        task_progress: 0.5,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "Gripper moved above the navy block.".into(),
                        task_progress: 0.75,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback:
                            "Gripper opened. The maroon block rests on the navy block. Task completed."
                                .into(),
                        task_progress: 1.0,
                        task_success: true,
                        done: true,
                    },
                ],
            },
            // 2. Insertion task (failure: the object slips).
            ScriptedEpisode {
                instruction: "Place the teal cylinder inside the rose container.".into(),
                steps: vec![
                    ScriptedStep {
                        env_feedback: "Gripper moved above the teal cylinder.".into(),
                        task_progress: 0.33,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "Gripper closed on the teal cylinder.".into(),
                        task_progress: 0.67,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "The teal cylinder slipped from the gripper.".into(),
                        task_progress: 0.33,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "Nothing happens.".into(),
                        task_progress: 0.33,
                        task_success: false,
                        done: true,
                    },
                ],
            },
        ]
    }

    fn render_frame(&self) -> RgbImage {
        // Flat deterministic frame: hue keyed by episode, brightness by step.
        let r = 60 + (self.active as u8) * 60;
        let b = (80 + (self.script_pos % 16) * 10) as u8;
        RgbImage::from_pixel(self.resolution, self.resolution, image::Rgb([r, 70, b]))
    }
}

/// Whether a pose is a well-formed 7-DoF gripper command.
fn pose_is_valid(pose: &[i64]) -> bool {
    if pose.len() != 7 {
        return false;
    }
    let xyz_ok = pose[..3].iter().all(|v| (0..=100).contains(v));
    let rpy_ok = pose[3..6].iter().all(|v| (0..=120).contains(v));
    let grip_ok = pose[6] == 0 || pose[6] == 1;
    xyz_ok && rpy_ok && grip_ok
}

impl Simulator for ScriptedTabletopSim {
    type Action = Vec<i64>;

    fn reset(&mut self, _eval_set: &str, episode_index: u64) -> Result<RgbImage> {
        if self.closed {
            anyhow::bail!("simulator is closed");
        }

        self.active = (episode_index as usize) % self.episodes.len();
        self.instruction = self.episodes[self.active].instruction.clone();
        self.step_count = 0;
        self.script_pos = 0;
        self.last_progress = 0.0;
        self.done = false;

        Ok(self.render_frame())
    }

    fn step(&mut self, action: &Vec<i64>) -> Result<SimTransition> {
        if self.closed {
            anyhow::bail!("simulator is closed");
        }
        if self.done {
            anyhow::bail!("cannot step a finished episode");
        }

        self.step_count += 1;

        let (feedback, progress, success, done) = if !pose_is_valid(action) {
            (
                "Last action is invalid. A 7-DoF gripper action within range is required."
                    .to_string(),
                self.last_progress,
                false,
                false,
            )
        } else {
            self.script_pos += 1;
            match self.episodes[self.active].steps.get(self.script_pos - 1) {
                Some(step) => (
                    step.env_feedback.clone(),
                    step.task_progress,
                    step.task_success,
                    step.done,
                ),
                // The script is exhausted; nothing more can happen.
                None => ("Nothing happens.".to_string(), self.last_progress, false, true),
            }
        };
        self.last_progress = progress;
        self.done = done;

        Ok(SimTransition {
            frame: self.render_frame(),
            reward: if success { 1.0 } else { 0.0 },
            done,
            info: SimInfo {
                env_step: self.step_count,
                env_feedback: feedback,
                task_success: success,
                task_progress: progress,
            },
        })
    }

    fn instruction(&self) -> &str {
        &self.instruction
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
