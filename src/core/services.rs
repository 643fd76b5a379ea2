//! Process-wide services: the shutdown flag and the random-number service.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::lock;
use crate::config::RandomNumberConfig;
use crate::error::FrameworkError;

/// Cooperative cancellation flag polled once per loop iteration
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Seed and position of one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub seed: u64,

    /// Number of values drawn since seeding
    pub draws: u64,
}

#[derive(Debug)]
struct EngineState {
    seed: u64,
    draws: u64,
    rng: StdRng,
}

impl EngineState {
    fn seeded(seed: u64) -> Self {
        Self {
            seed,
            draws: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn restored(snapshot: EngineSnapshot) -> Self {
        let mut state = Self::seeded(snapshot.seed);
        for _ in 0..snapshot.draws {
            state.rng.next_u64();
        }
        state.draws = snapshot.draws;
        state
    }
}

/// Handle on a module's engine
#[derive(Debug, Clone)]
pub struct RandomEngine {
    label: String,
    state: Arc<Mutex<EngineState>>,
}

impl RandomEngine {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn next_u64(&self) -> u64 {
        let mut state = lock(&self.state);
        state.draws += 1;
        state.rng.next_u64()
    }

    /// Uniform value in [0, 1)
    pub fn flat(&self) -> f64 {
        let mut state = lock(&self.state);
        state.draws += 1;
        state.rng.gen::<f64>()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = lock(&self.state);
        EngineSnapshot {
            seed: state.seed,
            draws: state.draws,
        }
    }
}

/// Owns one engine per module label and can save or restore all of them
#[derive(Debug, Default)]
pub struct RandomNumberService {
    engines: Mutex<BTreeMap<String, Arc<Mutex<EngineState>>>>,
    restored: BTreeMap<String, EngineSnapshot>,
    save_to: Option<PathBuf>,
}

impl RandomNumberService {
    pub fn new(config: &RandomNumberConfig) -> Result<Self, FrameworkError> {
        let restored = match &config.restore_from {
            Some(path) => load_snapshot(path)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            engines: Mutex::new(BTreeMap::new()),
            restored,
            save_to: config.save_to.clone(),
        })
    }

    /// Create the engine for `label`; a restored snapshot takes precedence over `seed`
    pub fn create_engine(&self, label: &str, seed: u64) -> Result<RandomEngine, FrameworkError> {
        let mut engines = lock(&self.engines);
        if engines.contains_key(label) {
            return Err(FrameworkError::configuration(format!(
                "A random number engine for '{}' was already created",
                label
            )));
        }
        let state = match self.restored.get(label) {
            Some(snapshot) => {
                debug!(engine = label, draws = snapshot.draws, "Restoring engine");
                EngineState::restored(*snapshot)
            }
            None => EngineState::seeded(seed),
        };
        let state = Arc::new(Mutex::new(state));
        engines.insert(label.to_string(), Arc::clone(&state));
        Ok(RandomEngine {
            label: label.to_string(),
            state,
        })
    }

    pub fn snapshot(&self) -> BTreeMap<String, EngineSnapshot> {
        lock(&self.engines)
            .iter()
            .map(|(label, state)| {
                let state = lock(state);
                (
                    label.clone(),
                    EngineSnapshot {
                        seed: state.seed,
                        draws: state.draws,
                    },
                )
            })
            .collect()
    }

    /// Write the snapshot to the configured file, if any
    pub fn save_snapshot(&self) -> Result<Option<PathBuf>, FrameworkError> {
        let Some(path) = &self.save_to else {
            return Ok(None);
        };
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), "Saved random number engine states");
        Ok(Some(path.clone()))
    }
}

fn load_snapshot(path: &Path) -> Result<BTreeMap<String, EngineSnapshot>, FrameworkError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        FrameworkError::configuration(format!(
            "Cannot read random number snapshot {}: {}",
            path.display(),
            e
        ))
    })?;
    let snapshot: BTreeMap<String, EngineSnapshot> = serde_json::from_str(&text)?;
    if snapshot.is_empty() {
        warn!(path = %path.display(), "Random number snapshot contains no engines");
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shutdown_flag_is_shared() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_requested());
        clone.request();
        assert!(flag.is_requested());
        flag.reset();
        assert!(!clone.is_requested());
    }

    #[test]
    fn test_engines_are_unique_per_label() {
        let service = RandomNumberService::default();
        service.create_engine("gen", 1).unwrap();
        assert!(service.create_engine("gen", 2).is_err());
    }

    #[test]
    fn test_snapshot_round_trip_resumes_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rng.json");

        let service = RandomNumberService::new(&RandomNumberConfig {
            save_to: Some(path.clone()),
            restore_from: None,
        })
        .unwrap();
        let engine = service.create_engine("gen", 42).unwrap();
        engine.next_u64();
        engine.next_u64();
        let saved = service.save_snapshot().unwrap();
        assert_eq!(saved.as_deref(), Some(path.as_path()));
        let expected_next = engine.next_u64();

        let restored = RandomNumberService::new(&RandomNumberConfig {
            save_to: None,
            restore_from: Some(path),
        })
        .unwrap();
        let engine = restored.create_engine("gen", 0).unwrap();
        assert_eq!(engine.snapshot(), EngineSnapshot { seed: 42, draws: 2 });
        assert_eq!(engine.next_u64(), expected_next);
    }
}
