//! Batched environment pool.
//!
//! [`EnvPool`] owns a map from environment id to one live [`TaskEnv`] and
//! exposes batch variants of every environment operation. Each batch fans out
//! one task per id onto the blocking thread pool, bounded by a shared
//! semaphore sized from [`PoolConfig::max_workers`], and fans results back in
//! as they complete.
//!
//! Failure isolation: an id whose operation fails is logged and omitted from
//! the result map; sibling ids are unaffected. Callers must treat a missing
//! id as "this instance failed for this call".

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{EnvConfig, PoolConfig};
use crate::env::{Environment, EpisodeInfo, StepInfo, TaskEnv};
use crate::serial::{serialize_observation, SerializedObservation};

/// One id's outcome from a batch step call, in wire form.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub observation: SerializedObservation,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

/// A pool of simulator-backed environments with batched operations.
///
/// Each slot's environment sits behind its own mutex, so at most one
/// operation is in flight per id; overlapping batch calls naming the same id
/// serialize against each other rather than racing the simulator.
pub struct EnvPool {
    envs: HashMap<String, Arc<Mutex<TaskEnv>>>,
    /// Bounds concurrent simulator calls across all batches.
    workers: Arc<Semaphore>,
}

impl EnvPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            envs: HashMap::new(),
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
        }
    }

    /// Ids of all live environments, sorted for stable output.
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.envs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    // -----------------------------------------------------------------------
    // Batch operations
    // -----------------------------------------------------------------------

    /// Reconcile the pool to exactly the requested id set, then build every
    /// requested environment.
    ///
    /// Every live environment is closed first, including re-requested ids:
    /// the request carries a fresh configuration, so the old instance must
    /// release its simulator before a new one takes the slot. Construction
    /// failures are logged and leave the id absent from both the pool and the
    /// returned map, which carries a config summary per created id.
    pub async fn create_batch(
        &mut self,
        requests: HashMap<String, EnvConfig>,
    ) -> HashMap<String, String> {
        let live: Vec<String> = self.envs.keys().cloned().collect();
        if !live.is_empty() {
            tracing::info!(count = live.len(), "closing live environments before create");
            self.close_ids(live).await;
        }

        let mut join_set = JoinSet::new();
        for (id, config) in requests {
            let workers = Arc::clone(&self.workers);
            join_set.spawn(async move {
                // The semaphore is never closed, so acquisition cannot fail.
                let _permit = workers.acquire_owned().await.ok();
                let config_id = config.config_id();
                let built = tokio::task::spawn_blocking(move || TaskEnv::build(&config))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|r| r);
                (id, config_id, built)
            });
        }

        let mut created = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, config_id, Ok(env))) => {
                    tracing::info!(env_id = %id, kind = env.kind(), config = %config_id, "environment created");
                    self.envs.insert(id.clone(), Arc::new(Mutex::new(env)));
                    created.insert(id, config_id);
                }
                Ok((id, config_id, Err(err))) => {
                    tracing::warn!(env_id = %id, config = %config_id, error = %err, "environment construction failed");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "environment construction task failed");
                }
            }
        }
        created
    }

    /// Reset each id with its seed. Returns the serialized first observation
    /// and the episode selection per id.
    pub async fn reset_batch(
        &self,
        seeds: HashMap<String, u64>,
    ) -> HashMap<String, (SerializedObservation, EpisodeInfo)> {
        self.run_batch(seeds.into_iter().collect(), |env, seed| {
            let (observation, info) = env.reset(seed)?;
            Ok((serialize_observation(&observation)?, info))
        })
        .await
    }

    /// Step each id with its raw model response.
    pub async fn step_batch(
        &self,
        actions: HashMap<String, String>,
    ) -> HashMap<String, StepResult> {
        self.run_batch(actions.into_iter().collect(), |env, raw| {
            let outcome = env.step(&raw)?;
            Ok(StepResult {
                observation: serialize_observation(&outcome.observation)?,
                reward: outcome.reward,
                done: outcome.done,
                info: outcome.info,
            })
        })
        .await
    }

    /// Fetch each id's running episode return.
    pub async fn compute_reward_batch(&self, ids: Vec<String>) -> HashMap<String, f64> {
        let requests = ids.into_iter().map(|id| (id, ())).collect();
        self.run_batch(requests, |env, ()| Ok(env.compute_reward()))
            .await
    }

    /// Fetch each id's system prompt.
    pub async fn system_prompts_batch(&self, ids: Vec<String>) -> HashMap<String, String> {
        let requests = ids.into_iter().map(|id| (id, ())).collect();
        self.run_batch(requests, |env, ()| env.system_prompt()).await
    }

    /// Close environments and evict them from the pool.
    ///
    /// `None` or an empty list closes every live environment.
    pub async fn close_batch(&mut self, ids: Option<Vec<String>>) {
        let ids = match ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => self.envs.keys().cloned().collect(),
        };
        self.close_ids(ids).await;
    }

    // -----------------------------------------------------------------------
    // Dispatch internals
    // -----------------------------------------------------------------------

    /// Fan one operation out over the requested ids and collect the
    /// successes.
    ///
    /// One task per id: take a worker permit, run the operation on the
    /// blocking pool under the slot's mutex, and report `(id, result)`.
    /// Results are gathered in completion order. Unknown ids and failed
    /// operations are logged and omitted; a panic inside one operation is
    /// contained by the task boundary and omitted the same way.
    async fn run_batch<A, T, F>(&self, requests: Vec<(String, A)>, op: F) -> HashMap<String, T>
    where
        A: Send + 'static,
        T: Send + 'static,
        F: Fn(&mut TaskEnv, A) -> Result<T> + Clone + Send + 'static,
    {
        let mut join_set = JoinSet::new();
        for (id, input) in requests {
            let Some(env) = self.envs.get(&id).cloned() else {
                tracing::warn!(env_id = %id, "operation requested for unknown environment id");
                continue;
            };
            let workers = Arc::clone(&self.workers);
            let op = op.clone();
            join_set.spawn(async move {
                // The semaphore is never closed, so acquisition cannot fail.
                let _permit = workers.acquire_owned().await.ok();
                let result = tokio::task::spawn_blocking(move || {
                    let mut env = env.lock().unwrap_or_else(PoisonError::into_inner);
                    op(&mut env, input)
                })
                .await
                .map_err(anyhow::Error::from)
                .and_then(|r| r);
                (id, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, Ok(value))) => {
                    results.insert(id, value);
                }
                Ok((id, Err(err))) => {
                    tracing::warn!(env_id = %id, error = %err, "environment operation failed");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "environment worker task failed");
                }
            }
        }
        results
    }

    /// Close the named slots. Each slot is removed from the map before its
    /// environment is closed, so no later batch can reach a closing instance.
    async fn close_ids(&mut self, ids: Vec<String>) {
        let mut join_set = JoinSet::new();
        for id in ids {
            let Some(env) = self.envs.remove(&id) else {
                tracing::warn!(env_id = %id, "close requested for unknown environment id");
                continue;
            };
            let workers = Arc::clone(&self.workers);
            join_set.spawn(async move {
                // The semaphore is never closed, so acquisition cannot fail.
                let _permit = workers.acquire_owned().await.ok();
                let joined = tokio::task::spawn_blocking(move || {
                    let mut env = env.lock().unwrap_or_else(PoisonError::into_inner);
                    env.close();
                })
                .await;
                match joined {
                    Ok(()) => tracing::debug!(env_id = %id, "environment closed"),
                    Err(err) => {
                        tracing::warn!(env_id = %id, error = %err, "environment close failed")
                    }
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KitchenEnvConfig, TabletopEnvConfig};
    use crate::env::parse::{ACTION_END, ACTION_START, THINK_END, THINK_START};
    use crate::env::FORMAT_BONUS;

    fn kitchen() -> EnvConfig {
        EnvConfig::Kitchen(KitchenEnvConfig::default())
    }

    fn tabletop() -> EnvConfig {
        EnvConfig::Tabletop(TabletopEnvConfig::default())
    }

    fn well_formed_kitchen_action() -> String {
        format!(
            "{THINK_START}locating the target{THINK_END}{ACTION_START}[0, find a CounterTop]{ACTION_END}"
        )
    }

    async fn pool_with(configs: Vec<(&str, EnvConfig)>) -> EnvPool {
        let mut pool = EnvPool::new(PoolConfig::default());
        let requests = configs
            .into_iter()
            .map(|(id, config)| (id.to_string(), config))
            .collect();
        pool.create_batch(requests).await;
        pool
    }

    #[tokio::test]
    async fn create_reconciles_to_requested_set() {
        let mut pool = pool_with(vec![("a", kitchen()), ("b", kitchen()), ("c", tabletop())]).await;
        assert_eq!(pool.live_ids(), vec!["a", "b", "c"]);

        let second = pool
            .create_batch(HashMap::from([
                ("b".to_string(), kitchen()),
                ("d".to_string(), tabletop()),
            ]))
            .await;

        assert_eq!(pool.live_ids(), vec!["b", "d"]);
        let mut created: Vec<_> = second.keys().cloned().collect();
        created.sort();
        assert_eq!(created, vec!["b", "d"]);
    }

    #[tokio::test]
    async fn invalid_config_is_absent_from_pool_and_result() {
        let bad = EnvConfig::Kitchen(KitchenEnvConfig {
            gamma: -1.0,
            ..Default::default()
        });
        let mut pool = EnvPool::new(PoolConfig::default());
        let created = pool
            .create_batch(HashMap::from([
                ("good".to_string(), kitchen()),
                ("bad".to_string(), bad),
            ]))
            .await;

        assert!(created.contains_key("good"));
        assert!(!created.contains_key("bad"));
        assert_eq!(pool.live_ids(), vec!["good"]);
    }

    #[tokio::test]
    async fn unknown_ids_are_omitted() {
        let pool = pool_with(vec![("a", kitchen())]).await;
        let results = pool
            .reset_batch(HashMap::from([("ghost".to_string(), 0)]))
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn end_to_end_kitchen_episode() {
        let pool = pool_with(vec![("a", kitchen())]).await;

        let resets = pool.reset_batch(HashMap::from([("a".to_string(), 0)])).await;
        let (observation, info) = &resets["a"];
        assert_eq!(info.eval_set, "base");
        assert_eq!(info.episode_index, 0);
        assert_eq!(observation.images.len(), 1);
        assert!(observation.text.contains("interaction_history: []"));

        let steps = pool
            .step_batch(HashMap::from([(
                "a".to_string(),
                well_formed_kitchen_action(),
            )]))
            .await;
        let step = &steps["a"];
        assert!(step.reward.is_finite());
        assert!(step.reward >= FORMAT_BONUS);
        assert!(!step.done);

        // An empty response earns no format bonus but still advances the
        // simulator.
        let steps = pool
            .step_batch(HashMap::from([("a".to_string(), String::new())]))
            .await;
        assert!(steps["a"].reward < FORMAT_BONUS);

        let rewards = pool.compute_reward_batch(vec!["a".to_string()]).await;
        assert!((rewards["a"] - FORMAT_BONUS).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn one_failing_id_leaves_siblings_unaffected() {
        let pool = pool_with(vec![("ok", kitchen()), ("broken", kitchen())]).await;

        // Only one environment is reset; stepping the other must fail.
        pool.reset_batch(HashMap::from([("ok".to_string(), 0)])).await;

        let steps = pool
            .step_batch(HashMap::from([
                ("ok".to_string(), well_formed_kitchen_action()),
                ("broken".to_string(), well_formed_kitchen_action()),
            ]))
            .await;

        assert!(steps.contains_key("ok"));
        assert!(!steps.contains_key("broken"));
        assert_eq!(steps.len(), 1);
    }

    #[tokio::test]
    async fn rewards_are_keyed_by_id() {
        let pool = pool_with(vec![("idle", kitchen()), ("busy", kitchen())]).await;
        pool.reset_batch(HashMap::from([
            ("idle".to_string(), 0),
            ("busy".to_string(), 0),
        ]))
        .await;
        pool.step_batch(HashMap::from([(
            "busy".to_string(),
            well_formed_kitchen_action(),
        )]))
        .await;

        let rewards = pool
            .compute_reward_batch(vec!["idle".to_string(), "busy".to_string()])
            .await;
        assert!(rewards["idle"].abs() < f64::EPSILON);
        assert!(rewards["busy"] >= FORMAT_BONUS);
    }

    #[tokio::test]
    async fn system_prompts_follow_environment_kind() {
        let pool = pool_with(vec![("k", kitchen()), ("t", tabletop())]).await;
        pool.reset_batch(HashMap::from([("k".to_string(), 0), ("t".to_string(), 0)]))
            .await;

        let prompts = pool
            .system_prompts_batch(vec!["k".to_string(), "t".to_string()])
            .await;
        assert!(prompts["k"].contains("The available action id"));
        assert!(prompts["t"].contains("Franka Panda"));
    }

    #[tokio::test]
    async fn closing_with_empty_list_closes_all() {
        let mut pool = pool_with(vec![("a", kitchen()), ("b", tabletop()), ("c", kitchen())]).await;
        assert_eq!(pool.len(), 3);

        pool.close_batch(Some(Vec::new())).await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn closing_named_ids_keeps_the_rest() {
        let mut pool = pool_with(vec![("a", kitchen()), ("b", tabletop())]).await;
        pool.close_batch(Some(vec!["a".to_string()])).await;
        assert_eq!(pool.live_ids(), vec!["b"]);

        pool.close_batch(None).await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn single_worker_pool_still_completes_batches() {
        let mut pool = EnvPool::new(PoolConfig { max_workers: 1 });
        pool.create_batch(HashMap::from([
            ("a".to_string(), kitchen()),
            ("b".to_string(), kitchen()),
            ("c".to_string(), tabletop()),
        ]))
        .await;

        let resets = pool
            .reset_batch(HashMap::from([
                ("a".to_string(), 0),
                ("b".to_string(), 100),
                ("c".to_string(), 0),
            ]))
            .await;
        assert_eq!(resets.len(), 3);
    }
}
