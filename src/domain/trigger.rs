//! Path results recorded for every event.

use serde::{Deserialize, Serialize};

/// Friendly class name under which trigger results are stored
pub const TRIGGER_RESULTS_CLASS: &str = "art::TriggerResults";

/// Module label under which trigger results are stored
pub const TRIGGER_RESULTS_LABEL: &str = "TriggerResults";

/// Outcome of one path for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HltState {
    Ready,
    Pass,
    Fail,
    Exception,
}

/// One bit per trigger path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResults {
    pub path_names: Vec<String>,
    pub states: Vec<HltState>,
}

impl TriggerResults {
    pub fn new(path_names: Vec<String>) -> Self {
        let states = vec![HltState::Ready; path_names.len()];
        Self { path_names, states }
    }

    pub fn set(&mut self, bit: usize, state: HltState) {
        if let Some(slot) = self.states.get_mut(bit) {
            *slot = state;
        }
    }

    pub fn state(&self, bit: usize) -> HltState {
        self.states.get(bit).copied().unwrap_or(HltState::Ready)
    }

    pub fn state_of(&self, path: &str) -> Option<HltState> {
        self.path_names
            .iter()
            .position(|p| p == path)
            .map(|bit| self.state(bit))
    }

    /// True if no path was configured or any path passed
    pub fn accept(&self) -> bool {
        self.states.is_empty() || self.states.iter().any(|s| *s == HltState::Pass)
    }

    pub fn any_error(&self) -> bool {
        self.states.iter().any(|s| *s == HltState::Exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_semantics() {
        let mut tr = TriggerResults::new(vec!["p1".into(), "p2".into()]);
        assert!(!tr.accept());
        tr.set(0, HltState::Fail);
        tr.set(1, HltState::Pass);
        assert!(tr.accept());
        assert_eq!(tr.state_of("p1"), Some(HltState::Fail));
        assert_eq!(tr.state_of("p3"), None);
        assert!(TriggerResults::new(vec![]).accept());
    }
}
