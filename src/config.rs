use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Runtime configuration for the environment pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of simulator calls in flight at once (default: 4).
    ///
    /// Simulators are often single-threaded or GPU-bound, so a small bound
    /// usually beats one worker per environment.
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// Which simulator backend an environment attaches to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SimBackend {
    /// Drive a simulator hosted in a separate server process.
    Http {
        /// Base URL of the simulator server (e.g. `http://localhost:5000`).
        base_url: String,
    },
    /// Replay canned episodes in-process. Used by tests and offline runs.
    Scripted,
}

/// Configuration for one environment instance, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "env_name", rename_all = "snake_case")]
pub enum EnvConfig {
    Kitchen(KitchenEnvConfig),
    Tabletop(TabletopEnvConfig),
}

impl EnvConfig {
    /// Short label for the environment kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kitchen(_) => "kitchen",
            Self::Tabletop(_) => "tabletop",
        }
    }

    /// Check value ranges before an environment is constructed from this
    /// configuration.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Kitchen(c) => c.validate(),
            Self::Tabletop(c) => c.validate(),
        }
    }

    /// One-line summary of the configuration, used in logs.
    pub fn config_id(&self) -> String {
        match self {
            Self::Kitchen(c) => format!(
                "KitchenEnvConfig(resolution={},gamma={})",
                c.resolution, c.gamma
            ),
            Self::Tabletop(c) => format!(
                "TabletopEnvConfig(resolution={},gamma={})",
                c.resolution, c.gamma
            ),
        }
    }
}

/// Kitchen (household-task) environment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KitchenEnvConfig {
    /// Camera resolution of rendered frames, in pixels (default: 300).
    pub resolution: u32,
    /// Per-step discount applied to the episode return (default: 1.0).
    pub gamma: f64,
    /// Directory holding `action_spaces_{eval_set}.json` files. When unset,
    /// the built-in action inventory is used.
    pub catalog_dir: Option<PathBuf>,
    /// Which simulator backend to attach (default: scripted).
    pub backend: SimBackend,
}

impl Default for KitchenEnvConfig {
    fn default() -> Self {
        Self {
            resolution: 300,
            gamma: 1.0,
            catalog_dir: None,
            backend: SimBackend::Scripted,
        }
    }
}

impl KitchenEnvConfig {
    pub fn validate(&self) -> Result<()> {
        validate_common("kitchen", self.resolution, self.gamma, &self.backend)
    }
}

/// Tabletop (manipulation) environment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletopEnvConfig {
    /// Camera resolution of rendered frames, in pixels (default: 500).
    pub resolution: u32,
    /// Per-step discount applied to the episode return (default: 0.9).
    pub gamma: f64,
    /// Which simulator backend to attach (default: scripted).
    pub backend: SimBackend,
}

impl Default for TabletopEnvConfig {
    fn default() -> Self {
        Self {
            resolution: 500,
            gamma: 0.9,
            backend: SimBackend::Scripted,
        }
    }
}

impl TabletopEnvConfig {
    pub fn validate(&self) -> Result<()> {
        validate_common("tabletop", self.resolution, self.gamma, &self.backend)
    }
}

fn validate_common(kind: &str, resolution: u32, gamma: f64, backend: &SimBackend) -> Result<()> {
    if resolution == 0 {
        anyhow::bail!("{kind} resolution must be positive");
    }
    if !(gamma > 0.0 && gamma <= 1.0) {
        anyhow::bail!("{kind} gamma must be in (0, 1], got {gamma}");
    }
    if let SimBackend::Http { base_url } = backend {
        if base_url.trim().is_empty() {
            anyhow::bail!("{kind} http backend requires a base_url");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_workers, 4);
    }

    #[test]
    fn kitchen_defaults_validate() {
        let config = EnvConfig::Kitchen(KitchenEnvConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.kind(), "kitchen");
        assert_eq!(config.config_id(), "KitchenEnvConfig(resolution=300,gamma=1)");
    }

    #[test]
    fn tabletop_defaults_validate() {
        let config = TabletopEnvConfig::default();
        assert_eq!(config.resolution, 500);
        assert!((config.gamma - 0.9).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_gamma() {
        let config = KitchenEnvConfig {
            gamma: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = KitchenEnvConfig {
            gamma: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_resolution() {
        let config = TabletopEnvConfig {
            resolution: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_http_base_url() {
        let config = KitchenEnvConfig {
            backend: SimBackend::Http {
                base_url: "  ".into(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_config_json_is_tagged_by_env_name() {
        let parsed: EnvConfig =
            serde_json::from_str(r#"{"env_name": "kitchen", "gamma": 0.95}"#).unwrap();
        match &parsed {
            EnvConfig::Kitchen(c) => {
                assert!((c.gamma - 0.95).abs() < f64::EPSILON);
                assert_eq!(c.resolution, 300);
            }
            EnvConfig::Tabletop(_) => panic!("expected kitchen config"),
        }

        let json = serde_json::to_value(&parsed).unwrap();
        assert_eq!(json["env_name"], "kitchen");
    }
}
