//! Kitchen household-task environment (ALFRED-style).
//!
//! The policy sees an egocentric frame plus an instruction and picks one
//! discrete skill per step, written as `[action_id, action_name]` inside the
//! action delimiters. This module provides two simulator backends:
//! - [`HttpKitchenSim`] drives a simulator hosted in a separate server
//!   process.
//! - [`ScriptedKitchenSim`] replays canned episodes for tests and offline
//!   runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use image::RgbImage;
use serde::Deserialize;

use super::catalog::{self, ActionCatalog};
use super::observation::{
    compose_user_prompt, EpisodeInfo, HistoryEntry, Observation, StepInfo, StepMetrics,
    StepOutcome, TrajMetrics, TurnMetrics, IMAGE_PLACEHOLDER,
};
use super::parse::parse_kitchen_response;
use super::traits::{Environment, SimInfo, SimTransition, Simulator};
use super::{seed_to_selection, FORMAT_BONUS, SUCCESS_BONUS};
use crate::config::{KitchenEnvConfig, SimBackend};
use crate::serial::{decode_frame, EncodedFrame};

/// Evaluation subsets, in seed order: seeds 0-99 select `base`, 100-199
/// `spatial`, and so on.
pub const KITCHEN_EVAL_SETS: [&str; 6] = [
    "base",
    "spatial",
    "common_sense",
    "complex_instruction",
    "visual_appearance",
    "long_horizon",
];

// ---------------------------------------------------------------------------
// Environment wrapper
// ---------------------------------------------------------------------------

/// A kitchen environment: one simulator instance plus episode bookkeeping.
#[derive(Debug)]
pub struct KitchenEnv {
    sim: KitchenSim,
    /// Per-step discount applied to the episode return.
    gamma: f64,
    catalog: Arc<ActionCatalog>,
    /// Selection made by the latest reset; `None` until the first reset.
    selection: Option<(&'static str, u64)>,
    instruction: String,
    history: Vec<HistoryEntry>,
    total_reward: f64,
    step_count: u32,
    closed: bool,
}

impl KitchenEnv {
    /// Build the environment and its simulator backend from configuration.
    pub fn new(config: KitchenEnvConfig) -> Result<Self> {
        let catalog = match &config.catalog_dir {
            Some(dir) => catalog::shared(dir)?,
            None => Arc::new(ActionCatalog::builtin()),
        };
        let sim = match &config.backend {
            SimBackend::Http { base_url } => KitchenSim::Http(HttpKitchenSim::new(base_url)),
            SimBackend::Scripted => {
                KitchenSim::Scripted(ScriptedKitchenSim::new(config.resolution))
            }
        };
        Ok(Self {
            sim,
            gamma: config.gamma,
            catalog,
            selection: None,
            instruction: String::new(),
            history: Vec::new(),
            total_reward: 0.0,
            step_count: 0,
            closed: false,
        })
    }
}

impl Environment for KitchenEnv {
    fn reset(&mut self, seed: u64) -> Result<(Observation, EpisodeInfo)> {
        if self.closed {
            anyhow::bail!("environment is closed");
        }

        let (eval_set, episode_index) = seed_to_selection(&KITCHEN_EVAL_SETS, seed)?;
        let frame = self.sim.reset(eval_set, episode_index)?;

        self.selection = Some((eval_set, episode_index));
        self.instruction = self.sim.instruction().to_string();
        self.history.clear();
        self.total_reward = 0.0;
        self.step_count = 0;

        tracing::debug!(eval_set, episode_index, "kitchen environment reset");

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

        let (action_index, parsed) = parse_kitchen_response(raw_response);
        let transition = self.sim.step(&action_index)?;

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
        let Some((eval_set, episode_index)) = self.selection else {
            anyhow::bail!("environment was never reset, no episode selected");
        };
        let actions = self.catalog.actions(eval_set, episode_index)?;
        Ok(kitchen_system_prompt(actions))
    }

    fn close(&mut self) {
        if !self.closed {
            self.sim.close();
            self.closed = true;
        }
    }
}

/// Render the kitchen system prompt around one episode's action inventory.
fn kitchen_system_prompt(actions: &[String]) -> String {
    let quoted: Vec<String> = actions.iter().map(|a| format!("'{a}'")).collect();
    let inventory = format!("[{}]", quoted.join(", "));
    let max_id = actions.len().saturating_sub(1);
    format!(
        r#"## You are a robot operating in a home. Given a task, you must accomplish the task using a defined set of actions to achieve the desired outcome.

## Action Descriptions and Validity Rules
• Find: Parameterized by the name of the receptacle to navigate to. So long as the object is present in the scene, this skill is always valid
• Pick up: Parameterized by the name of the object to pick. Only valid if the robot is close to the object, not holding another object, and the object is not inside a closed receptacle.
• Put down: Parameterized by the name of the object to put down to a nearby receptacle. Only valid if the robot is holding an object.
• Drop: Parameterized by the name of the object to put down. It is different from Put down action, as this does not guarantee the held object will be put into a specified receptacle.
• Open: Parameterized by the name of the receptacle to open. Only valid if the receptacle is closed and the robot is close to the receptacle.
• Close: Parameterized by the name of the receptacle to close. Only valid if the receptacle is open and the robot is close to the receptacle.
• Turn on: Parameterized by the name of the object to turn on. Only valid if the object is turned off and the robot is close to the object.
• Turn off: Parameterized by the name of the object to turn off. Only valid if the object is turned on and the robot is close to the object.
• Slice: Parameterized by the name of the object to slice. Only valid if the object is sliceable and the robot is close to the object.

## The available action id (0 ~ {max_id}) and action names are: {inventory}.

## Guidelines
1. **Output Plan**: Avoid generating empty plan. Each plan should include no more than 20 actions.
2. **Visibility**: Always locate a visible object by the 'find' action before interacting with it.
3. **Action Guidelines**: Make sure match the action name and its corresponding action id in the output. Avoid performing actions that do not meet the defined validity criteria. For instance, if you want to put object in a receptacle, use 'put down' rather than 'drop' actions.
4. **Prevent Repeating Action Sequences**: Do not repeatedly execute the same action or sequence of actions. Try to modify the action sequence because previous actions do not lead to success.
5. **Multiple Instances**: There may be multiple instances of the same object, distinguished by an index following their names, e.g., Cabinet_2, Cabinet_3. You can explore these instances if you do not find the desired object in the current receptacle.
6. **Reflection on History and Feedback**: Use interaction history and feedback from the environment to refine and improve your current plan. If the last action is invalid, reflect on the reason, such as not adhering to action rules or missing preliminary actions, and adjust your plan accordingly.

** Generation Guide **
- Include the thinking process between <|think_start|> and <|think_end|>
- Include only the target action in <|action_start|> and <|action_end|>, i.e. the content inside <|action_start|> and <|action_end|> should be nothing more than [action_id, 'action_name'], where the action id is an integer and the action name is the corresponding name. Do not include any other thing, such as '"'.
"#
    )
}

// ---------------------------------------------------------------------------
// Simulator backends
// ---------------------------------------------------------------------------

/// Enum dispatch over the kitchen simulator backends.
#[derive(Debug)]
pub enum KitchenSim {
    Http(HttpKitchenSim),
    Scripted(ScriptedKitchenSim),
}

impl Simulator for KitchenSim {
    type Action = u32;

    fn reset(&mut self, eval_set: &str, episode_index: u64) -> Result<RgbImage> {
        match self {
            Self::Http(sim) => sim.reset(eval_set, episode_index),
            Self::Scripted(sim) => sim.reset(eval_set, episode_index),
        }
    }

    fn step(&mut self, action: &u32) -> Result<SimTransition> {
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

/// A kitchen simulator hosted in a separate server process.
///
/// The server is expected to expose three endpoints:
/// - `POST {base_url}/reset` -- body: `{"eval_set": "...", "episode_index": N}`
/// - `POST {base_url}/step`  -- body: `{"action": <action id>}`
/// - `POST {base_url}/close` -- empty body
///
/// Reset and step return JSON matching [`ServerReset`] and [`ServerStep`].
#[derive(Debug)]
pub struct HttpKitchenSim {
    /// Base URL of the simulator server (e.g. `http://localhost:5000`).
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

impl HttpKitchenSim {
    /// Create a simulator connector pointing at the given server.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::blocking::Client::new(),
            instruction: String::new(),
        }
    }
}

impl Simulator for HttpKitchenSim {
    type Action = u32;

    fn reset(&mut self, eval_set: &str, episode_index: u64) -> Result<RgbImage> {
        let body = serde_json::json!({ "eval_set": eval_set, "episode_index": episode_index });
        let resp: ServerReset = self
            .http
            .post(format!("{}/reset", self.base_url))
            .json(&body)
            .send()
            .context("failed to reach kitchen simulator on reset")?
            .json()
            .context("failed to parse kitchen simulator reset response")?;

        self.instruction = resp.instruction;
        decode_frame(&resp.frame)
    }

    fn step(&mut self, action: &u32) -> Result<SimTransition> {
        let body = serde_json::json!({ "action": action });
        let resp: ServerStep = self
            .http
            .post(format!("{}/step", self.base_url))
            .json(&body)
            .send()
            .context("failed to reach kitchen simulator on step")?
            .json()
            .context("failed to parse kitchen simulator step response")?;

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
            tracing::warn!(error = %err, "kitchen simulator close request failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted simulator for tests and offline runs
// ---------------------------------------------------------------------------

/// A scripted kitchen simulator that replays canned episodes.
///
/// The episode index selects a script (modulo the script count); actions are
/// acknowledged but do not influence the canned feedback.
#[derive(Debug, Clone)]
pub struct ScriptedKitchenSim {
    episodes: Vec<ScriptedEpisode>,
    resolution: u32,
    active: usize,
    instruction: String,
    step_index: usize,
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

impl ScriptedKitchenSim {
    pub fn new(resolution: u32) -> Self {
        Self {
            episodes: Self::default_episodes(),
            resolution,
            active: 0,
            instruction: String::new(),
            step_index: 0,
            last_progress: 0.0,
            done: false,
            closed: false,
        }
    }

    fn default_episodes() -> Vec<ScriptedEpisode> {
        vec![
            // 1. Slice-and-place task (success).
            ScriptedEpisode {
                instruction: "Put a sliced apple on the countertop.".into(),
                steps: vec![
                    ScriptedStep {
                        env_feedback: "You find the Apple on the CounterTop.".into(),
                        task_progress: 0.25,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "You pick up the Apple.".into(),
                        task_progress: 0.5,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "You slice the Apple.".into(),
                        task_progress: 0.75,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "You put down the Apple on the CounterTop. Task completed."
                            .into(),
                        task_progress: 1.0,
                        task_success: true,
                        done: true,
                    },
                ],
            },
            // 2. Heat task (success).
            ScriptedEpisode {
                instruction: "Heat the potato and put it in the fridge.".into(),
                steps: vec![
                    ScriptedStep {
                        env_feedback: "You find the Potato on the CounterTop.".into(),
                        task_progress: 0.2,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "You pick up the Potato.".into(),
                        task_progress: 0.4,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "You open the Microwave.".into(),
                        task_progress: 0.6,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "You heat the Potato in the Microwave.".into(),
                        task_progress: 0.8,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "You put down the Potato in the Fridge. Task completed."
                            .into(),
                        task_progress: 1.0,
                        task_success: true,
                        done: true,
                    },
                ],
            },
            // 3. Rinse task (failure: the robot never reaches the sink).
            ScriptedEpisode {
                instruction: "Rinse the mug and place it on the shelf.".into(),
                steps: vec![
                    ScriptedStep {
                        env_feedback: "You find the Mug on the CounterTop.".into(),
                        task_progress: 0.25,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "You pick up the Mug.".into(),
                        task_progress: 0.5,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "Last action is invalid. The robot is not close to the SinkBasin."
                            .into(),
                        task_progress: 0.5,
                        task_success: false,
                        done: false,
                    },
                    ScriptedStep {
                        env_feedback: "Nothing happens.".into(),
                        task_progress: 0.5,
                        task_success: false,
                        done: true,
                    },
                ],
            },
        ]
    }

    fn render_frame(&self) -> RgbImage {
        // Flat deterministic frame: hue keyed by episode, brightness by step.
        let r = 40 + (self.active as u8) * 50;
        let g = (90 + (self.step_index % 16) * 10) as u8;
        RgbImage::from_pixel(self.resolution, self.resolution, image::Rgb([r, g, 70]))
    }
}

impl Simulator for ScriptedKitchenSim {
    type Action = u32;

    fn reset(&mut self, _eval_set: &str, episode_index: u64) -> Result<RgbImage> {
        if self.closed {
            anyhow::bail!("simulator is closed");
        }

        self.active = (episode_index as usize) % self.episodes.len();
        self.instruction = self.episodes[self.active].instruction.clone();
        self.step_index = 0;
        self.last_progress = 0.0;
        self.done = false;

        Ok(self.render_frame())
    }

    fn step(&mut self, _action: &u32) -> Result<SimTransition> {
        if self.closed {
            anyhow::bail!("simulator is closed");
        }
        if self.done {
            anyhow::bail!("cannot step a finished episode");
        }

        self.step_index += 1;
        let (feedback, progress, success, done) =
            match self.episodes[self.active].steps.get(self.step_index - 1) {
                Some(step) => (
                    step.env_feedback.clone(),
                    step.task_progress,
                    step.task_success,
                    step.done,
                ),
                // The script is exhausted; nothing more can happen.
                None => ("Nothing happens.".to_string(), self.last_progress, false, true),
            };
        self.last_progress = progress;
        self.done = done;

        Ok(SimTransition {
            frame: self.render_frame(),
            reward: if success { 1.0 } else { 0.0 },
            done,
            info: SimInfo {
                env_step: self.step_index as u64,
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
