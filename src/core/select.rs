//! Event selection for end-path modules.
//!
//! `SelectEvents: [p1, "reco*", "!noisy"]` accepts an event when any plain
//! pattern matches a trigger path that passed, or any `!` pattern matches a
//! trigger path that failed. An empty list accepts everything.

use glob::Pattern;

use crate::domain::{HltState, TriggerResults};
use crate::error::FrameworkError;

#[derive(Debug, Clone)]
struct Criterion {
    pattern: Pattern,
    negated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EventSelector {
    criteria: Vec<Criterion>,
}

impl EventSelector {
    pub fn new(patterns: &[String], trigger_paths: &[String]) -> Result<Self, FrameworkError> {
        let mut criteria = Vec::new();
        for raw in patterns {
            let (negated, text) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw.as_str()),
            };
            let pattern = Pattern::new(text).map_err(|e| {
                FrameworkError::configuration(format!("Bad SelectEvents pattern '{}': {}", raw, e))
            })?;
            if !trigger_paths.iter().any(|p| pattern.matches(p)) {
                return Err(FrameworkError::configuration(format!(
                    "SelectEvents pattern '{}' matches no trigger path",
                    raw
                )));
            }
            criteria.push(Criterion { pattern, negated });
        }
        Ok(Self { criteria })
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn wants(&self, results: &TriggerResults) -> bool {
        if self.criteria.is_empty() {
            return true;
        }
        self.criteria.iter().any(|c| {
            let wanted = if c.negated { HltState::Fail } else { HltState::Pass };
            results
                .path_names
                .iter()
                .enumerate()
                .any(|(bit, name)| c.pattern.matches(name) && results.state(bit) == wanted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(states: &[(&str, HltState)]) -> TriggerResults {
        let mut tr = TriggerResults::new(states.iter().map(|(n, _)| n.to_string()).collect());
        for (bit, (_, s)) in states.iter().enumerate() {
            tr.set(bit, *s);
        }
        tr
    }

    #[test]
    fn test_positive_and_negated_patterns() {
        let paths = vec!["reco_a".to_string(), "reco_b".to_string(), "noisy".to_string()];
        let selector = EventSelector::new(&["reco_*".into(), "!noisy".into()], &paths).unwrap();

        let tr = results(&[("reco_a", HltState::Fail), ("reco_b", HltState::Pass), ("noisy", HltState::Pass)]);
        assert!(selector.wants(&tr));

        let tr = results(&[("reco_a", HltState::Fail), ("reco_b", HltState::Fail), ("noisy", HltState::Pass)]);
        assert!(!selector.wants(&tr));

        let tr = results(&[("reco_a", HltState::Fail), ("reco_b", HltState::Fail), ("noisy", HltState::Fail)]);
        assert!(selector.wants(&tr));
    }

    #[test]
    fn test_unknown_path_rejected() {
        let paths = vec!["p1".to_string()];
        assert!(EventSelector::new(&["p2".into()], &paths).is_err());
        assert!(EventSelector::new(&[], &paths).unwrap().is_empty());
    }
}
