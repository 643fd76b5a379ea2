//! Hierarchical state machine driving file, run, subrun and event handling.
//!
//! States nest as
//!
//! ```text
//! Starting
//! HandleFiles { NewInputFile | HandleRuns { NewRun | PauseRun |
//!     HandleSubRuns { NewSubRun | PauseSubRun |
//!         HandleEvents { NewEvent | ProcessEvent | PauseEvent } } } }
//! Error -> Stopping -> Terminated
//! ```
//!
//! Each level is a plain struct owning its substate, so leaving a level is
//! dropping a value. Levels have two ways out:
//!
//! - `exit`: the normal path, which finalizes the occurrence and lets
//!   errors propagate. It does nothing while the processor is already
//!   handling an error;
//! - `cleanup`: the teardown path used after a failure. It finalizes
//!   whatever the normal path did not reach and swallows errors, recording
//!   them as cleanup messages.
//!
//! A level whose own callback failed (begin or end of its occurrence) is
//! never finalized again.
//!
//! Pausing (for output file switches) suspends the innermost level; a
//! following `SwitchOutputFiles` swaps outputs and resumes exactly where the
//! machine was, without repeating any begin callbacks.

use std::collections::VecDeque;

use tracing::{debug, error, trace};

use crate::config::FileMode;
use crate::domain::{RunId, SubRunId};
use crate::error::FrameworkError;

/// Callbacks the machine makes into the event processor
pub trait ProcessorActions {
    fn read_file(&mut self) -> Result<(), FrameworkError>;
    fn close_input_file(&mut self) -> Result<(), FrameworkError>;
    fn open_output_files(&mut self) -> Result<(), FrameworkError>;
    fn close_output_files(&mut self) -> Result<(), FrameworkError>;
    fn respond_to_open_input_file(&mut self) -> Result<(), FrameworkError>;
    fn respond_to_close_input_file(&mut self) -> Result<(), FrameworkError>;
    fn respond_to_open_output_files(&mut self) -> Result<(), FrameworkError>;
    fn respond_to_close_output_files(&mut self) -> Result<(), FrameworkError>;
    fn close_some_output_files(&mut self) -> Result<(), FrameworkError>;
    fn open_some_output_files(&mut self) -> Result<(), FrameworkError>;

    fn end_of_loop(&mut self) -> Result<(), FrameworkError>;
    fn write_run_cache(&mut self) -> Result<(), FrameworkError>;
    fn write_subrun_cache(&mut self) -> Result<(), FrameworkError>;
    fn should_we_close_output(&self) -> bool;
    fn do_error_stuff(&mut self);

    fn read_and_cache_run(&mut self) -> Result<RunId, FrameworkError>;
    fn read_and_cache_subrun(&mut self) -> Result<SubRunId, FrameworkError>;
    fn begin_run(&mut self, run: RunId) -> Result<(), FrameworkError>;
    fn end_run(&mut self, run: RunId) -> Result<(), FrameworkError>;
    fn begin_subrun(&mut self, subrun: SubRunId) -> Result<(), FrameworkError>;
    fn end_subrun(&mut self, subrun: SubRunId) -> Result<(), FrameworkError>;
    fn write_run(&mut self, run: RunId) -> Result<(), FrameworkError>;
    fn delete_run_from_cache(&mut self, run: RunId) -> Result<(), FrameworkError>;
    fn write_subrun(&mut self, subrun: SubRunId) -> Result<(), FrameworkError>;
    fn delete_subrun_from_cache(&mut self, subrun: SubRunId) -> Result<(), FrameworkError>;

    fn read_event(&mut self) -> Result<(), FrameworkError>;
    fn process_event(&mut self) -> Result<(), FrameworkError>;
    fn should_we_stop(&self) -> bool;

    /// Finish events that were read but are still in flight. Called before
    /// every transition other than a new event, so an event failure
    /// surfaces while the enclosing run and subrun are still intact.
    fn finish_pending_events(&mut self) -> Result<(), FrameworkError> {
        Ok(())
    }

    fn set_exception_message_files(&mut self, message: String);
    fn set_exception_message_runs(&mut self, message: String);
    fn set_exception_message_subruns(&mut self, message: String);
    fn already_handling_exception(&self) -> bool;
}

/// Events understood by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    InputFile,
    Run(RunId),
    SubRun(SubRunId),
    Event,
    Pause,
    SwitchOutputFiles,
    Stop,
}

/// Fixed behavior options
#[derive(Debug, Clone, Copy)]
pub struct MachineOptions {
    pub file_mode: FileMode,
    pub handle_empty_runs: bool,
    pub handle_empty_subruns: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            file_mode: FileMode::FullMerge,
            handle_empty_runs: true,
            handle_empty_subruns: true,
        }
    }
}

#[derive(Debug)]
enum State {
    Starting,
    HandleFiles(FilesState),
    Error,
    Terminated,
}

/// What an inner level made of an event
enum Reaction {
    Handled,
    /// Handled, and the processor asked to stop afterwards
    HandledThenStop,
    /// Not legal in the current state
    Unexpected,
}

#[derive(Debug, Default)]
struct FilesState {
    exit_called: bool,
    runs: Option<RunsState>,
}

#[derive(Debug)]
struct RunsState {
    run: RunId,
    begin_called: bool,
    exception: bool,
    exit_called: bool,
    phase: RunPhase,
}

#[derive(Debug)]
enum RunPhase {
    NewRun,
    PauseRun,
    SubRuns(SubRunsState),
}

#[derive(Debug)]
struct SubRunsState {
    subrun: SubRunId,
    begin_called: bool,
    exception: bool,
    exit_called: bool,
    phase: SubRunPhase,
}

#[derive(Debug)]
enum SubRunPhase {
    NewSubRun,
    PauseSubRun,
    Events(EventPhase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventPhase {
    NewEvent,
    ProcessEvent,
    PauseEvent,
}

fn cleanup_message(what: &str, err: &FrameworkError) -> String {
    format!(
        "Another error occurred while cleaning up {} after the primary failure; no further cleanup of {} is attempted. The additional error was: {}",
        what, what, err
    )
}

impl FilesState {
    fn react<A: ProcessorActions + ?Sized>(
        &mut self,
        event: MachineEvent,
        opts: &MachineOptions,
        a: &mut A,
    ) -> Result<Reaction, FrameworkError> {
        match event {
            MachineEvent::InputFile => {
                self.next_input_file(opts, a)?;
                Ok(Reaction::Handled)
            }
            MachineEvent::Run(id) => {
                self.handle_run(id, opts, a)?;
                Ok(Reaction::Handled)
            }
            MachineEvent::SubRun(id) => match self.runs.as_mut() {
                Some(runs) => runs.handle_subrun(id, opts, a),
                None => Ok(Reaction::Unexpected),
            },
            MachineEvent::Event => match self.runs.as_mut() {
                Some(runs) => runs.handle_event(opts, a),
                None => Ok(Reaction::Unexpected),
            },
            MachineEvent::Pause => {
                if let Some(runs) = self.runs.as_mut() {
                    runs.pause();
                }
                Ok(Reaction::Handled)
            }
            MachineEvent::SwitchOutputFiles => {
                let resumable = match self.runs.as_mut() {
                    Some(runs) => runs.resume_from_pause(),
                    // between input files outputs may always be switched
                    None => true,
                };
                if !resumable {
                    return Ok(Reaction::Unexpected);
                }
                a.close_some_output_files()?;
                a.open_some_output_files()?;
                Ok(Reaction::Handled)
            }
            MachineEvent::Stop => Ok(Reaction::HandledThenStop),
        }
    }

    fn open_files<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) -> Result<(), FrameworkError> {
        a.read_file()?;
        a.respond_to_open_input_file()?;
        a.open_output_files()?;
        a.respond_to_open_output_files()
    }

    fn close_files<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) -> Result<(), FrameworkError> {
        a.respond_to_close_input_file()?;
        a.close_input_file()?;
        a.write_subrun_cache()?;
        a.write_run_cache()?;
        a.respond_to_close_output_files()?;
        a.close_output_files()
    }

    fn close_all_files<A: ProcessorActions + ?Sized>(
        &mut self,
        opts: &MachineOptions,
        a: &mut A,
    ) -> Result<(), FrameworkError> {
        if a.already_handling_exception() {
            return Ok(());
        }
        if let Some(runs) = self.runs.as_mut() {
            runs.exit(opts, a)?;
        }
        self.runs = None;
        self.exit_called = true;
        self.close_files(a)
    }

    fn next_input_file<A: ProcessorActions + ?Sized>(
        &mut self,
        opts: &MachineOptions,
        a: &mut A,
    ) -> Result<(), FrameworkError> {
        if a.should_we_close_output() {
            self.close_all_files(opts, a)?;
            *self = FilesState::default();
            return self.open_files(a);
        }

        let merging = opts.file_mode.merges_across_files();
        if !merging {
            if let Some(runs) = self.runs.as_mut() {
                runs.exit(opts, a)?;
            }
            self.runs = None;
        }
        a.respond_to_close_input_file()?;
        a.close_input_file()?;
        if !merging {
            a.write_subrun_cache()?;
            a.write_run_cache()?;
        }
        a.read_file()?;
        a.respond_to_open_input_file()
    }

    fn handle_run<A: ProcessorActions + ?Sized>(
        &mut self,
        id: RunId,
        opts: &MachineOptions,
        a: &mut A,
    ) -> Result<(), FrameworkError> {
        if let Some(runs) = self.runs.as_mut() {
            if runs.run == id && opts.file_mode.merges_across_files() {
                return runs.merge_fragment(a);
            }
            runs.exit(opts, a)?;
        }
        self.runs = Some(RunsState::new(id));
        match self.runs.as_mut() {
            Some(runs) => runs.setup(opts, a),
            None => Ok(()),
        }
    }

    fn cleanup<A: ProcessorActions + ?Sized>(&mut self, opts: &MachineOptions, a: &mut A) {
        if let Some(runs) = self.runs.as_mut() {
            runs.cleanup(opts, a);
        }
        if !self.exit_called {
            self.exit_called = true;
            if let Err(e) = self.close_files(a) {
                a.set_exception_message_files(cleanup_message("files", &e));
            }
        }
    }
}

impl RunsState {
    fn new(run: RunId) -> Self {
        Self {
            run,
            begin_called: false,
            exception: false,
            exit_called: false,
            phase: RunPhase::NewRun,
        }
    }

    fn setup<A: ProcessorActions + ?Sized>(&mut self, opts: &MachineOptions, a: &mut A) -> Result<(), FrameworkError> {
        self.exception = true;
        let cached = a.read_and_cache_run()?;
        if cached != self.run {
            return Err(FrameworkError::logic(format!(
                "Announced {} but the source delivered {}",
                self.run, cached
            )));
        }
        self.exception = false;
        if opts.handle_empty_runs {
            self.begin_run(a)?;
        }
        Ok(())
    }

    fn merge_fragment<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) -> Result<(), FrameworkError> {
        self.exception = true;
        a.read_and_cache_run()?;
        self.exception = false;
        debug!(run = %self.run, "Merged run fragment");
        Ok(())
    }

    fn begin_run<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) -> Result<(), FrameworkError> {
        self.exception = true;
        a.begin_run(self.run)?;
        self.exception = false;
        self.begin_called = true;
        Ok(())
    }

    fn begin_run_if_not_done_already<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) -> Result<(), FrameworkError> {
        if !self.begin_called {
            self.begin_run(a)?;
        }
        Ok(())
    }

    fn finalize<A: ProcessorActions + ?Sized>(&mut self, opts: &MachineOptions, a: &mut A) -> Result<(), FrameworkError> {
        if self.exception {
            return Ok(());
        }
        self.exception = true;
        if self.begin_called {
            a.end_run(self.run)?;
            if opts.file_mode == FileMode::FullLumiMerge {
                a.write_subrun_cache()?;
            }
            if opts.file_mode == FileMode::NoMerge {
                a.write_run(self.run)?;
                a.delete_run_from_cache(self.run)?;
            }
        } else {
            a.delete_run_from_cache(self.run)?;
        }
        self.exception = false;
        Ok(())
    }

    fn exit<A: ProcessorActions + ?Sized>(&mut self, opts: &MachineOptions, a: &mut A) -> Result<(), FrameworkError> {
        if a.already_handling_exception() {
            return Ok(());
        }
        if let RunPhase::SubRuns(subruns) = &mut self.phase {
            subruns.exit(opts, a)?;
        }
        self.phase = RunPhase::NewRun;
        self.exit_called = true;
        self.finalize(opts, a)
    }

    fn cleanup<A: ProcessorActions + ?Sized>(&mut self, opts: &MachineOptions, a: &mut A) {
        if let RunPhase::SubRuns(subruns) = &mut self.phase {
            subruns.cleanup(opts, a);
        }
        if !self.exit_called {
            self.exit_called = true;
            if let Err(e) = self.finalize(opts, a) {
                a.set_exception_message_runs(cleanup_message("runs", &e));
            }
        }
    }

    fn handle_subrun<A: ProcessorActions + ?Sized>(
        &mut self,
        id: SubRunId,
        opts: &MachineOptions,
        a: &mut A,
    ) -> Result<Reaction, FrameworkError> {
        if let RunPhase::SubRuns(subruns) = &mut self.phase {
            if subruns.subrun == id && opts.file_mode.merges_across_files() {
                subruns.merge_fragment(a)?;
                return Ok(Reaction::Handled);
            }
            subruns.exit(opts, a)?;
        }
        self.phase = RunPhase::NewRun;
        self.begin_run_if_not_done_already(a)?;
        self.phase = RunPhase::SubRuns(SubRunsState::new(id));
        if let RunPhase::SubRuns(subruns) = &mut self.phase {
            subruns.setup(opts, a)?;
        }
        Ok(Reaction::Handled)
    }

    fn handle_event<A: ProcessorActions + ?Sized>(
        &mut self,
        opts: &MachineOptions,
        a: &mut A,
    ) -> Result<Reaction, FrameworkError> {
        match &mut self.phase {
            RunPhase::SubRuns(subruns) => subruns.handle_event(opts, a),
            RunPhase::NewRun | RunPhase::PauseRun => Ok(Reaction::Unexpected),
        }
    }

    fn pause(&mut self) {
        match &mut self.phase {
            RunPhase::NewRun => self.phase = RunPhase::PauseRun,
            RunPhase::SubRuns(subruns) => subruns.pause(),
            RunPhase::PauseRun => {}
        }
    }

    /// Leave the innermost pause, returning false if nothing was paused
    fn resume_from_pause(&mut self) -> bool {
        match &mut self.phase {
            RunPhase::PauseRun => {
                self.phase = RunPhase::NewRun;
                true
            }
            RunPhase::SubRuns(subruns) => subruns.resume_from_pause(),
            RunPhase::NewRun => false,
        }
    }
}

impl SubRunsState {
    fn new(subrun: SubRunId) -> Self {
        Self {
            subrun,
            begin_called: false,
            exception: false,
            exit_called: false,
            phase: SubRunPhase::NewSubRun,
        }
    }

    fn setup<A: ProcessorActions + ?Sized>(&mut self, opts: &MachineOptions, a: &mut A) -> Result<(), FrameworkError> {
        self.exception = true;
        let cached = a.read_and_cache_subrun()?;
        if cached != self.subrun {
            return Err(FrameworkError::logic(format!(
                "Announced {} but the source delivered {}",
                self.subrun, cached
            )));
        }
        self.exception = false;
        if opts.handle_empty_subruns {
            self.begin_subrun(a)?;
        }
        Ok(())
    }

    fn merge_fragment<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) -> Result<(), FrameworkError> {
        self.exception = true;
        a.read_and_cache_subrun()?;
        self.exception = false;
        debug!(subrun = %self.subrun, "Merged subrun fragment");
        Ok(())
    }

    fn begin_subrun<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) -> Result<(), FrameworkError> {
        self.exception = true;
        a.begin_subrun(self.subrun)?;
        self.exception = false;
        self.begin_called = true;
        Ok(())
    }

    fn finalize<A: ProcessorActions + ?Sized>(&mut self, opts: &MachineOptions, a: &mut A) -> Result<(), FrameworkError> {
        if self.exception {
            return Ok(());
        }
        self.exception = true;
        if self.begin_called {
            a.end_subrun(self.subrun)?;
            if opts.file_mode != FileMode::FullLumiMerge {
                a.write_subrun(self.subrun)?;
                a.delete_subrun_from_cache(self.subrun)?;
            }
        } else {
            a.delete_subrun_from_cache(self.subrun)?;
        }
        self.exception = false;
        Ok(())
    }

    fn exit<A: ProcessorActions + ?Sized>(&mut self, opts: &MachineOptions, a: &mut A) -> Result<(), FrameworkError> {
        if a.already_handling_exception() {
            return Ok(());
        }
        self.exit_called = true;
        self.finalize(opts, a)
    }

    fn cleanup<A: ProcessorActions + ?Sized>(&mut self, opts: &MachineOptions, a: &mut A) {
        if !self.exit_called {
            self.exit_called = true;
            if let Err(e) = self.finalize(opts, a) {
                a.set_exception_message_subruns(cleanup_message("subruns", &e));
            }
        }
    }

    fn handle_event<A: ProcessorActions + ?Sized>(
        &mut self,
        opts: &MachineOptions,
        a: &mut A,
    ) -> Result<Reaction, FrameworkError> {
        if !self.begin_called && !opts.handle_empty_subruns {
            self.begin_subrun(a)?;
        }
        self.phase = SubRunPhase::Events(EventPhase::NewEvent);
        a.read_event()?;
        a.process_event()?;
        self.phase = SubRunPhase::Events(EventPhase::ProcessEvent);
        if a.should_we_stop() {
            return Ok(Reaction::HandledThenStop);
        }
        Ok(Reaction::Handled)
    }

    fn pause(&mut self) {
        match self.phase {
            SubRunPhase::NewSubRun => self.phase = SubRunPhase::PauseSubRun,
            SubRunPhase::Events(EventPhase::NewEvent | EventPhase::ProcessEvent) => {
                self.phase = SubRunPhase::Events(EventPhase::PauseEvent)
            }
            _ => {}
        }
    }

    fn resume_from_pause(&mut self) -> bool {
        match self.phase {
            SubRunPhase::PauseSubRun => {
                self.phase = SubRunPhase::NewSubRun;
                true
            }
            SubRunPhase::Events(EventPhase::PauseEvent) => {
                self.phase = SubRunPhase::Events(EventPhase::ProcessEvent);
                true
            }
            _ => false,
        }
    }
}

/// The event-processing state machine
#[derive(Debug)]
pub struct Machine {
    options: MachineOptions,
    state: State,
    queue: VecDeque<MachineEvent>,
    was_in_error: bool,
}

impl Machine {
    pub fn new(options: MachineOptions) -> Self {
        Self {
            options,
            state: State::Starting,
            queue: VecDeque::new(),
            was_in_error: false,
        }
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, State::Terminated)
    }

    /// True once the machine has passed through its Error state
    pub fn was_in_error(&self) -> bool {
        self.was_in_error
    }

    /// Name of the innermost active state
    pub fn state_name(&self) -> &'static str {
        match &self.state {
            State::Starting => "Starting",
            State::Error => "Error",
            State::Terminated => "Terminated",
            State::HandleFiles(files) => match &files.runs {
                None => "NewInputFile",
                Some(runs) => match &runs.phase {
                    RunPhase::NewRun => "NewRun",
                    RunPhase::PauseRun => "PauseRun",
                    RunPhase::SubRuns(subruns) => match subruns.phase {
                        SubRunPhase::NewSubRun => "NewSubRun",
                        SubRunPhase::PauseSubRun => "PauseSubRun",
                        SubRunPhase::Events(EventPhase::NewEvent) => "NewEvent",
                        SubRunPhase::Events(EventPhase::ProcessEvent) => "ProcessEvent",
                        SubRunPhase::Events(EventPhase::PauseEvent) => "PauseEvent",
                    },
                },
            },
        }
    }

    /// Deliver one event, plus any the machine posts to itself
    pub fn process_event<A: ProcessorActions + ?Sized>(
        &mut self,
        event: MachineEvent,
        actions: &mut A,
    ) -> Result<(), FrameworkError> {
        self.queue.push_back(event);
        while let Some(next) = self.queue.pop_front() {
            if let Err(e) = self.dispatch(next, actions) {
                self.queue.clear();
                return Err(e);
            }
        }
        Ok(())
    }

    fn dispatch<A: ProcessorActions + ?Sized>(
        &mut self,
        event: MachineEvent,
        a: &mut A,
    ) -> Result<(), FrameworkError> {
        trace!(?event, state = self.state_name(), "Machine event");
        let reaction = match &mut self.state {
            State::Terminated => {
                debug!(?event, "Event ignored by terminated state machine");
                return Ok(());
            }
            State::Error => match event {
                MachineEvent::Stop => return self.stop(a),
                _ => return Ok(()),
            },
            State::Starting => match event {
                MachineEvent::InputFile => {
                    self.state = State::HandleFiles(FilesState::default());
                    if let State::HandleFiles(files) = &mut self.state {
                        files.open_files(a)?;
                    }
                    return Ok(());
                }
                MachineEvent::Stop => return self.stop(a),
                MachineEvent::Pause => return Ok(()),
                _ => Reaction::Unexpected,
            },
            State::HandleFiles(files) => {
                if event != MachineEvent::Event {
                    a.finish_pending_events()?;
                }
                files.react(event, &self.options, a)?
            }
        };

        match reaction {
            Reaction::Handled => Ok(()),
            Reaction::HandledThenStop => {
                if event == MachineEvent::Stop {
                    if let State::HandleFiles(files) = &mut self.state {
                        files.close_all_files(&self.options, a)?;
                    }
                    self.stop(a)
                } else {
                    self.queue.push_front(MachineEvent::Stop);
                    Ok(())
                }
            }
            Reaction::Unexpected => {
                error!(?event, state = self.state_name(), "Unexpected event for the current state");
                if let State::HandleFiles(files) = &mut self.state {
                    files.close_all_files(&self.options, a)?;
                }
                self.enter_error(a);
                Ok(())
            }
        }
    }

    fn enter_error<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) {
        self.state = State::Error;
        self.was_in_error = true;
        a.do_error_stuff();
        self.queue.push_front(MachineEvent::Stop);
    }

    fn stop<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) -> Result<(), FrameworkError> {
        self.state = State::Terminated;
        a.end_of_loop()
    }

    /// Tear down after a failure, finalizing what is still open and
    /// recording every secondary error as a cleanup message
    pub fn terminate<A: ProcessorActions + ?Sized>(&mut self, a: &mut A) {
        if let State::HandleFiles(files) = &mut self.state {
            files.cleanup(&self.options, a);
        }
        self.state = State::Terminated;
        self.queue.clear();
    }
}
