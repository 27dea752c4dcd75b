//! Tidepool: batched environment pool for embodied-agent RL.
//!
//! Provides subcommands for exercising a pool of task environments:
//!
//! - `rollout` -- Drive a batch of environments through reset/step cycles
//! - `prompts` -- Print the system prompts selected by a batch of seeds

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tidepool::config::{
    EnvConfig, KitchenEnvConfig, PoolConfig, SimBackend, TabletopEnvConfig,
};
use tidepool::service::EnvPool;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Tidepool: batched environment pool for embodied-agent RL.
#[derive(Parser)]
#[command(name = "tidepool", version, about)]
struct Cli {
    /// Path to a JSON pool configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Which environment kind to run.
    #[arg(long, global = true, default_value = "kitchen")]
    env: EnvChoice,

    /// Attach live HTTP simulators instead of the scripted backend.
    #[arg(long, global = true)]
    live: bool,

    /// Base URL of the simulator server (only used with --live).
    #[arg(long, global = true, default_value = "http://localhost:5000")]
    base_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum EnvChoice {
    Kitchen,
    Tabletop,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a batch of environments through reset/step cycles and report
    /// per-environment returns.
    Rollout {
        /// Number of environments in the batch.
        #[arg(long, default_value_t = 4)]
        envs: usize,

        /// Maximum steps to run per environment.
        #[arg(long, default_value_t = 4)]
        steps: usize,

        /// Seed for the first environment; the rest count up from here.
        #[arg(long, default_value_t = 0)]
        base_seed: u64,
    },

    /// Print the system prompts selected by a batch of seeds.
    Prompts {
        /// Comma-separated seeds to build prompts for.
        #[arg(long, value_delimiter = ',', default_value = "0")]
        seeds: Vec<u64>,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load or create the pool configuration.
    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<PoolConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => PoolConfig::default(),
    };

    match cli.command {
        Commands::Rollout {
            envs,
            steps,
            base_seed,
        } => cmd_rollout(&config, &cli.env, cli.live, &cli.base_url, envs, steps, base_seed).await,
        Commands::Prompts { seeds } => {
            cmd_prompts(&config, &cli.env, cli.live, &cli.base_url, seeds).await
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_rollout(
    config: &PoolConfig,
    env_choice: &EnvChoice,
    live: bool,
    base_url: &str,
    envs: usize,
    steps: usize,
    base_seed: u64,
) -> Result<()> {
    tracing::info!(envs, steps, base_seed, "Starting rollout");

    let mut pool = EnvPool::new(config.clone());

    let mut requests = HashMap::new();
    let mut seeds = HashMap::new();
    for i in 0..envs {
        let id = format!("env-{}", Uuid::new_v4());
        seeds.insert(id.clone(), base_seed + i as u64);
        requests.insert(id, env_template(env_choice, live, base_url));
    }

    let created = pool.create_batch(requests).await;
    tracing::info!(created = created.len(), "Environments created");

    let resets = pool.reset_batch(seeds).await;
    for (id, (_, info)) in &resets {
        tracing::info!(
            env_id = %id,
            eval_set = %info.eval_set,
            episode = info.episode_index,
            instruction = %info.instruction,
            "Episode selected"
        );
    }

    // Ids still running an episode; failures and finished episodes drop out.
    let mut running: Vec<String> = resets.keys().cloned().collect();
    running.sort();

    for step in 0..steps {
        if running.is_empty() {
            break;
        }
        let actions: HashMap<String, String> = running
            .iter()
            .map(|id| (id.clone(), demo_response(env_choice)))
            .collect();
        let results = pool.step_batch(actions).await;

        let mut finished = Vec::new();
        for (id, result) in &results {
            tracing::debug!(env_id = %id, reward = result.reward, done = result.done, "Step result");
            if result.done {
                finished.push(id.clone());
            }
        }
        running.retain(|id| results.contains_key(id) && !finished.contains(id));
        tracing::info!(
            step,
            stepped = results.len(),
            remaining = running.len(),
            "Batch step complete"
        );
    }

    let rewards = pool.compute_reward_batch(pool.live_ids()).await;

    println!("Episode returns:");
    let mut ids: Vec<String> = rewards.keys().cloned().collect();
    ids.sort();
    for id in &ids {
        println!("  {id}: {:.3}", rewards[id]);
    }

    pool.close_batch(None).await;
    tracing::info!("Rollout finished");
    Ok(())
}

async fn cmd_prompts(
    config: &PoolConfig,
    env_choice: &EnvChoice,
    live: bool,
    base_url: &str,
    seeds: Vec<u64>,
) -> Result<()> {
    let mut pool = EnvPool::new(config.clone());

    let mut requests = HashMap::new();
    let mut seed_map = HashMap::new();
    for seed in seeds {
        let id = format!("env-{}", Uuid::new_v4());
        seed_map.insert(id.clone(), seed);
        requests.insert(id, env_template(env_choice, live, base_url));
    }

    pool.create_batch(requests).await;
    let resets = pool.reset_batch(seed_map.clone()).await;
    let prompts = pool
        .system_prompts_batch(resets.keys().cloned().collect())
        .await;

    let mut ids: Vec<String> = prompts.keys().cloned().collect();
    ids.sort_by_key(|id| seed_map[id]);
    for id in &ids {
        let info = &resets[id].1;
        println!(
            "=== seed {} -> {} / episode {} ===",
            seed_map[id], info.eval_set, info.episode_index
        );
        println!("{}", prompts[id]);
        println!();
    }

    pool.close_batch(None).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Environment construction
// ---------------------------------------------------------------------------

fn env_template(choice: &EnvChoice, live: bool, base_url: &str) -> EnvConfig {
    let backend = if live {
        SimBackend::Http {
            base_url: base_url.to_string(),
        }
    } else {
        SimBackend::Scripted
    };
    match choice {
        EnvChoice::Kitchen => EnvConfig::Kitchen(KitchenEnvConfig {
            backend,
            ..Default::default()
        }),
        EnvChoice::Tabletop => EnvConfig::Tabletop(TabletopEnvConfig {
            backend,
            ..Default::default()
        }),
    }
}

/// A canned model response matching each environment's action grammar, used
/// to drive scripted rollouts.
fn demo_response(choice: &EnvChoice) -> String {
    match choice {
        EnvChoice::Kitchen => "<|think_start|>I should first locate the target object.<|think_end|>\
             <|action_start|>[0, find a Cabinet]<|action_end|>"
            .to_string(),
        EnvChoice::Tabletop => "<|think_start|>Move the gripper above the object.<|think_end|>\
             <|action_start|>[50, 50, 30, 0, 60, 0, 1]<|action_end|>"
            .to_string(),
    }
}
