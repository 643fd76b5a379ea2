//! Cache of the run and subrun principals being processed, plus the current
//! event.
//!
//! At most one run and one subrun are live (begun and not yet ended) at a
//! time. Ended occurrences may stay cached until they are written; they are
//! always written and deleted lowest number first.

use std::collections::BTreeMap;

use tracing::trace;

use crate::domain::{EventId, EventPrincipal, RunId, RunPrincipal, SubRunId, SubRunPrincipal};
use crate::error::{FrameworkError, OpenOccurrence};

#[derive(Debug)]
struct Entry<P> {
    principal: P,
    begun: bool,
    ended: bool,
}

impl<P> Entry<P> {
    fn new(principal: P) -> Self {
        Self {
            principal,
            begun: false,
            ended: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct PrincipalCache {
    runs: BTreeMap<RunId, Entry<RunPrincipal>>,
    subruns: BTreeMap<SubRunId, Entry<SubRunPrincipal>>,
    current_run: Option<RunId>,
    current_subrun: Option<SubRunId>,
    event: Option<EventPrincipal>,
}

impl PrincipalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a run, merging it into an existing fragment with the same number
    pub fn insert_run(&mut self, principal: RunPrincipal) -> Result<RunId, FrameworkError> {
        let id = principal.id();
        if let Some(live) = self.live_run() {
            if live != id {
                return Err(FrameworkError::logic(format!(
                    "Cannot start {} while {} is still being processed",
                    id, live
                )));
            }
        }
        match self.runs.get_mut(&id) {
            Some(entry) => {
                trace!(run = %id, "Merging run fragment");
                entry.principal.merge(principal)?;
                entry.ended = false;
            }
            None => {
                self.runs.insert(id, Entry::new(principal));
            }
        }
        self.current_run = Some(id);
        Ok(id)
    }

    pub fn insert_subrun(&mut self, principal: SubRunPrincipal) -> Result<SubRunId, FrameworkError> {
        let id = principal.id();
        if let Some(live) = self.live_subrun() {
            if live != id {
                return Err(FrameworkError::logic(format!(
                    "Cannot start {} while {} is still being processed",
                    id, live
                )));
            }
        }
        match self.subruns.get_mut(&id) {
            Some(entry) => {
                trace!(subrun = %id, "Merging subrun fragment");
                entry.principal.merge(principal)?;
                entry.ended = false;
            }
            None => {
                self.subruns.insert(id, Entry::new(principal));
            }
        }
        self.current_subrun = Some(id);
        Ok(id)
    }

    fn live_run(&self) -> Option<RunId> {
        self.current_run
            .filter(|id| self.runs.get(id).map_or(false, |e| e.begun && !e.ended))
    }

    fn live_subrun(&self) -> Option<SubRunId> {
        self.current_subrun
            .filter(|id| self.subruns.get(id).map_or(false, |e| e.begun && !e.ended))
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.current_run
    }

    pub fn current_subrun(&self) -> Option<SubRunId> {
        self.current_subrun
    }

    pub fn run_mut(&mut self, id: RunId) -> Result<&mut RunPrincipal, FrameworkError> {
        self.runs
            .get_mut(&id)
            .map(|e| &mut e.principal)
            .ok_or_else(|| FrameworkError::logic(format!("{} is not in the principal cache", id)))
    }

    pub fn run(&self, id: RunId) -> Option<&RunPrincipal> {
        self.runs.get(&id).map(|e| &e.principal)
    }

    pub fn subrun_mut(&mut self, id: SubRunId) -> Result<&mut SubRunPrincipal, FrameworkError> {
        self.subruns
            .get_mut(&id)
            .map(|e| &mut e.principal)
            .ok_or_else(|| FrameworkError::logic(format!("{} is not in the principal cache", id)))
    }

    pub fn subrun(&self, id: SubRunId) -> Option<&SubRunPrincipal> {
        self.subruns.get(&id).map(|e| &e.principal)
    }

    pub fn run_begun(&self, id: RunId) -> bool {
        self.runs.get(&id).map_or(false, |e| e.begun)
    }

    pub fn subrun_begun(&self, id: SubRunId) -> bool {
        self.subruns.get(&id).map_or(false, |e| e.begun)
    }

    pub fn run_ended(&self, id: RunId) -> bool {
        self.runs.get(&id).map_or(false, |e| e.ended)
    }

    pub fn subrun_ended(&self, id: SubRunId) -> bool {
        self.subruns.get(&id).map_or(false, |e| e.ended)
    }

    pub fn mark_run_begun(&mut self, id: RunId) {
        if let Some(e) = self.runs.get_mut(&id) {
            e.begun = true;
        }
    }

    pub fn mark_run_ended(&mut self, id: RunId) {
        if let Some(e) = self.runs.get_mut(&id) {
            e.ended = true;
        }
    }

    pub fn mark_subrun_begun(&mut self, id: SubRunId) {
        if let Some(e) = self.subruns.get_mut(&id) {
            e.begun = true;
        }
    }

    pub fn mark_subrun_ended(&mut self, id: SubRunId) {
        if let Some(e) = self.subruns.get_mut(&id) {
            e.ended = true;
        }
    }

    /// Lowest-numbered run that has ended and awaits writing
    pub fn lowest_ended_run(&self) -> Option<RunId> {
        self.runs.iter().find(|(_, e)| e.ended).map(|(id, _)| *id)
    }

    pub fn lowest_ended_subrun(&self) -> Option<SubRunId> {
        self.subruns.iter().find(|(_, e)| e.ended).map(|(id, _)| *id)
    }

    pub fn delete_run(&mut self, id: RunId) -> Option<RunPrincipal> {
        if self.current_run == Some(id) {
            self.current_run = None;
        }
        self.runs.remove(&id).map(|e| e.principal)
    }

    pub fn delete_subrun(&mut self, id: SubRunId) -> Option<SubRunPrincipal> {
        if self.current_subrun == Some(id) {
            self.current_subrun = None;
        }
        self.subruns.remove(&id).map(|e| e.principal)
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn subrun_count(&self) -> usize {
        self.subruns.len()
    }

    pub fn set_event(&mut self, event: EventPrincipal) {
        self.event = Some(event);
    }

    pub fn event_mut(&mut self) -> Option<&mut EventPrincipal> {
        self.event.as_mut()
    }

    pub fn take_event(&mut self) -> Option<EventPrincipal> {
        self.event.take()
    }

    pub fn current_event(&self) -> Option<EventId> {
        self.event.as_ref().map(|e| e.id())
    }

    /// Occurrences still open, outermost first
    pub fn open_occurrences(&self) -> Vec<OpenOccurrence> {
        let mut open = Vec::new();
        if let Some(run) = self.current_run {
            open.push(OpenOccurrence::Run(run));
        }
        if let Some(subrun) = self.current_subrun {
            open.push(OpenOccurrence::SubRun(subrun));
        }
        if let Some(event) = self.current_event() {
            open.push(OpenOccurrence::Event(event));
        }
        open
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProcessHistory;

    fn run(n: u32) -> RunPrincipal {
        RunPrincipal::new(RunId::new(n), ProcessHistory::default())
    }

    #[test]
    fn test_lowest_first_and_delete() {
        let mut cache = PrincipalCache::new();
        for n in [3, 1] {
            cache.insert_run(run(n)).unwrap();
            cache.mark_run_begun(RunId::new(n));
            cache.mark_run_ended(RunId::new(n));
        }
        assert_eq!(cache.lowest_ended_run(), Some(RunId::new(1)));
        cache.delete_run(RunId::new(1));
        assert_eq!(cache.lowest_ended_run(), Some(RunId::new(3)));
        cache.delete_run(RunId::new(3));
        assert_eq!(cache.run_count(), 0);
        assert_eq!(cache.current_run(), None);
    }

    #[test]
    fn test_only_one_live_run() {
        let mut cache = PrincipalCache::new();
        cache.insert_run(run(1)).unwrap();
        cache.mark_run_begun(RunId::new(1));
        assert!(matches!(cache.insert_run(run(2)), Err(FrameworkError::Logic(_))));

        // a fragment of the live run merges
        cache.insert_run(run(1)).unwrap();
        assert_eq!(cache.run_count(), 1);

        cache.mark_run_ended(RunId::new(1));
        cache.insert_run(run(2)).unwrap();
        assert_eq!(cache.current_run(), Some(RunId::new(2)));
    }

    #[test]
    fn test_open_occurrences_outermost_first() {
        let mut cache = PrincipalCache::new();
        cache.insert_run(run(4)).unwrap();
        cache
            .insert_subrun(SubRunPrincipal::new(SubRunId::new(4, 1), ProcessHistory::default()))
            .unwrap();
        cache.set_event(EventPrincipal::new(EventId::new(4, 1, 9), ProcessHistory::default()));
        assert_eq!(
            cache.open_occurrences(),
            vec![
                OpenOccurrence::Run(RunId::new(4)),
                OpenOccurrence::SubRun(SubRunId::new(4, 1)),
                OpenOccurrence::Event(EventId::new(4, 1, 9)),
            ]
        );
    }
}
