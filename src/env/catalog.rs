//! Action-space catalog for kitchen episodes.
//!
//! Each eval set ships a JSON file `action_spaces_{eval_set}.json` mapping
//! 1-based episode numbers to the action descriptors legal in that episode.
//! The catalog backs the kitchen system prompt, which spells out the action
//! inventory the policy may pick from.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::{Context, Result};

use super::kitchen::KITCHEN_EVAL_SETS;

/// Per-episode action inventories, keyed by eval set.
#[derive(Debug)]
pub struct ActionCatalog {
    /// eval set -> episode number (1-based, as written in the files) -> actions.
    spaces: HashMap<String, HashMap<String, Vec<String>>>,
    /// Inventory served when no file-backed entry exists. Set by
    /// [`ActionCatalog::builtin`], absent for file-backed catalogs.
    fallback: Option<Vec<String>>,
}

impl ActionCatalog {
    /// Load `action_spaces_{eval_set}.json` for every kitchen eval set from
    /// `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut spaces = HashMap::new();
        for eval_set in KITCHEN_EVAL_SETS {
            let path = dir.join(format!("action_spaces_{eval_set}.json"));
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read action space file {}", path.display()))?;
            let space: HashMap<String, Vec<String>> = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse action space file {}", path.display()))?;
            spaces.insert(eval_set.to_string(), space);
        }
        tracing::info!(
            eval_sets = spaces.len(),
            dir = %dir.display(),
            "loaded action-space catalog"
        );
        Ok(Self {
            spaces,
            fallback: None,
        })
    }

    /// A catalog serving the built-in inventory for every episode. Used by
    /// scripted simulators, which share one action space.
    pub fn builtin() -> Self {
        Self {
            spaces: HashMap::new(),
            fallback: Some(builtin_inventory()),
        }
    }

    /// Legal action descriptors for one episode.
    ///
    /// Episode keys in the catalog files are 1-based, hence the +1.
    pub fn actions(&self, eval_set: &str, episode_index: u64) -> Result<&[String]> {
        if let Some(space) = self.spaces.get(eval_set) {
            let key = (episode_index + 1).to_string();
            let actions = space.get(&key).with_context(|| {
                format!("no action space for episode {episode_index} in eval set '{eval_set}'")
            })?;
            return Ok(actions);
        }
        match &self.fallback {
            Some(inventory) => Ok(inventory),
            None => anyhow::bail!("no action space for eval set '{eval_set}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide shared catalog
// ---------------------------------------------------------------------------

static SHARED: OnceLock<Arc<ActionCatalog>> = OnceLock::new();
static SHARED_INIT: Mutex<()> = Mutex::new(());

/// The process-wide catalog, loaded from `dir` on first call.
///
/// Creation batches construct many kitchen environments concurrently; exactly
/// one of them loads the files, the rest reuse the result. Later callers get
/// the already-loaded catalog regardless of the directory they pass.
pub fn shared(dir: &Path) -> Result<Arc<ActionCatalog>> {
    if let Some(catalog) = SHARED.get() {
        return Ok(Arc::clone(catalog));
    }

    let _guard = SHARED_INIT
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(catalog) = SHARED.get() {
        return Ok(Arc::clone(catalog));
    }

    let catalog = Arc::new(ActionCatalog::load_dir(dir)?);
    Ok(Arc::clone(SHARED.get_or_init(|| catalog)))
}

/// The action inventory scripted kitchen episodes draw from.
fn builtin_inventory() -> Vec<String> {
    [
        "find a Cabinet",
        "find a CounterTop",
        "find a Fridge",
        "find a Microwave",
        "find a SinkBasin",
        "find a Shelf",
        "find an Apple",
        "find a Mug",
        "find a Potato",
        "pick up the Apple",
        "pick up the Mug",
        "pick up the Potato",
        "put down the object in hand",
        "drop the object in hand",
        "open the Fridge",
        "close the Fridge",
        "open the Microwave",
        "close the Microwave",
        "turn on the Microwave",
        "turn off the Microwave",
        "turn on the Faucet",
        "turn off the Faucet",
        "slice the Apple",
        "slice the Potato",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_catalog_files(dir: &Path, body: &str) {
        for eval_set in KITCHEN_EVAL_SETS {
            std::fs::write(dir.join(format!("action_spaces_{eval_set}.json")), body).unwrap();
        }
    }

    #[test]
    fn builtin_serves_every_selection() {
        let catalog = ActionCatalog::builtin();
        let base = catalog.actions("base", 0).unwrap();
        assert!(!base.is_empty());
        let long_horizon = catalog.actions("long_horizon", 99).unwrap();
        assert_eq!(base, long_horizon);
    }

    #[test]
    fn load_dir_reads_all_eval_sets() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog_files(dir.path(), r#"{"1": ["find a Mug", "pick up the Mug"]}"#);

        let catalog = ActionCatalog::load_dir(dir.path()).unwrap();
        let actions = catalog.actions("spatial", 0).unwrap();
        assert_eq!(actions, ["find a Mug", "pick up the Mug"]);
    }

    #[test]
    fn episode_keys_are_one_based() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog_files(dir.path(), r#"{"3": ["open the Fridge"]}"#);

        let catalog = ActionCatalog::load_dir(dir.path()).unwrap();
        // Episode index 2 maps to file key "3".
        assert!(catalog.actions("base", 2).is_ok());
        assert!(catalog.actions("base", 0).is_err());
    }

    #[test]
    fn load_dir_names_the_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ActionCatalog::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("action_spaces_base.json"));
    }

    #[test]
    fn shared_catalog_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog_files(dir.path(), r#"{"1": ["find a Mug"]}"#);

        let first = shared(dir.path()).unwrap();
        // A second call with a different (even invalid) directory returns the
        // same instance.
        let second = shared(Path::new("/nonexistent")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
