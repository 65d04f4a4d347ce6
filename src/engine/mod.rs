//! The execution engine
//!
//! One thread owns all engine state. Helper threads (stream readers,
//! process waiters, the signal thread) only post [`Event`]s on a channel.
//! Work scheduled for "the next tick" goes to a task queue that is always
//! drained before the next channel event, so a completion callback never
//! runs inside the call that registered it.
//!
//! [`Engine::wait`] spins the loop until one hub completes; it is re-entrant,
//! which is what lets command substitution run in the middle of translating
//! a command.

mod lifecycle;

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use serde_json::Value;
use slab::Slab;
use tracing::debug;

use crate::command::CommandSpec;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{pipeline, runner::Runner, Context};
use crate::hub::{Hub, HubId};
use crate::job::{JobEntry, JobId, JobState, Mode, Stream, Variant};
use crate::jobs::{format_listing, JobInfo, JobTable};
use crate::services::RuntimeServices;
use crate::syntax::Script;
use crate::terminal::{Console, TerminalControl};
use crate::vars::VarStores;

pub(crate) use lifecycle::JobSetup;

/// Change in one process of a native job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessChange {
    /// Exit code, or 128 + signal number
    Exited(i32),
    Stopped,
    Continued,
}

#[derive(Debug)]
pub enum Event {
    Output {
        job: JobId,
        stream: Stream,
        data: Vec<u8>,
    },
    Closed {
        job: JobId,
        stream: Stream,
    },
    Process {
        job: JobId,
        index: usize,
        change: ProcessChange,
    },
    /// SIGINT for the foreground job
    Interrupt,
}

pub(crate) enum Task {
    Run(Box<dyn FnOnce(&mut Engine)>),
    /// Deliver a completed hub's late subscribers
    Flush(HubId),
    /// Run a script job whose input is complete
    Script(JobId),
    /// Settle a job that could not spawn anything
    Fail(JobId),
}

/// Private output buffers of a substitution
#[derive(Debug, Default)]
pub(crate) struct Capture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) hubs: Slab<Hub>,
    pub(crate) jobs: HashMap<JobId, JobEntry>,
    next_job: u64,
    pub(crate) table: JobTable,
    pub(crate) vars: VarStores,
    pub(crate) captures: Slab<Capture>,
    pub(crate) services: Box<dyn RuntimeServices>,
    pub(crate) console: Box<dyn Console>,
    pub(crate) terminal: TerminalControl,
    pub(crate) tasks: VecDeque<Task>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    /// Native jobs with helper threads still reporting
    pub(crate) live_native: usize,
    /// Job currently holding the terminal
    pub(crate) terminal_owner: Option<JobId>,
}

impl Engine {
    pub fn new<S, C>(config: EngineConfig, services: S, console: C) -> Self
    where
        S: RuntimeServices + 'static,
        C: Console + 'static,
    {
        let terminal = if config.job_control {
            TerminalControl::new()
        } else {
            TerminalControl::detached()
        };
        Self::with_terminal(config, services, console, terminal)
    }

    pub fn with_terminal<S, C>(
        config: EngineConfig,
        services: S,
        console: C,
        terminal: TerminalControl,
    ) -> Self
    where
        S: RuntimeServices + 'static,
        C: Console + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            config,
            hubs: Slab::new(),
            jobs: HashMap::new(),
            next_job: 1,
            table: JobTable::new(),
            vars: VarStores::new(),
            captures: Slab::new(),
            services: Box::new(services),
            console: Box::new(console),
            terminal,
            tasks: VecDeque::new(),
            events_tx,
            events_rx,
            live_native: 0,
            terminal_owner: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn services(&self) -> &dyn RuntimeServices {
        self.services.as_ref()
    }

    /// Sender for posting events from other threads (signal handling)
    pub fn event_sender(&self) -> Sender<Event> {
        self.events_tx.clone()
    }

    /// Persisted variable of the top-level store
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.vars.get(self.vars.root(), name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        let root = self.vars.root();
        self.vars.set(root, name, value);
    }

    pub fn root_context(&self) -> Context {
        Context::new(self.vars.root())
    }

    /// Run a script to completion and return its status
    pub fn run(&mut self, script: &Script) -> Result<i32> {
        let hub = self.spawn(script);
        self.wait(hub)
    }

    /// Start a script without waiting for it
    pub fn spawn(&mut self, script: &Script) -> HubId {
        let ctx = self.root_context();
        let hub = Runner::spawn_items(self, script.items.clone(), ctx, None);
        self.retain(hub);
        hub
    }

    /// Run ready-made descriptors one after the other
    pub fn run_commands(&mut self, specs: Vec<CommandSpec>) -> Result<i32> {
        let ctx = self.root_context();
        let hub = Runner::spawn_specs(self, specs, ctx, None);
        self.retain(hub);
        self.wait(hub)
    }

    /// Run descriptors as one foreground pipeline
    pub fn run_pipeline(&mut self, specs: Vec<CommandSpec>, negated: bool) -> Result<i32> {
        let ctx = self.root_context();
        let hub = pipeline::spawn(self, specs, &ctx, None, negated).hub;
        self.retain(hub);
        self.wait(hub)
    }

    /// Drive the loop until `hub` completed; returns its status
    pub fn wait(&mut self, hub: HubId) -> Result<i32> {
        loop {
            match self.hubs.get(hub.0) {
                None => return Err(EngineError::Hub(hub.0)),
                Some(h) => {
                    if let Some(status) = h.status() {
                        self.release(hub);
                        return Ok(status);
                    }
                }
            }
            self.turn(true)?;
        }
    }

    /// Process everything that is ready without blocking
    pub fn poll(&mut self) -> Result<()> {
        while self.turn(false)? {}
        Ok(())
    }

    /// Run until no deferred work and no live native job remain
    pub fn drain(&mut self) -> Result<()> {
        while !self.tasks.is_empty() || self.live_native > 0 {
            self.turn(true)?;
        }
        self.poll()
    }

    /// One step of the loop: a deferred task if any, else one event.
    /// Returns false when nothing was ready (non-blocking mode only).
    pub fn turn(&mut self, block: bool) -> Result<bool> {
        if let Some(task) = self.tasks.pop_front() {
            self.run_task(task);
            return Ok(true);
        }

        let event = match self.events_rx.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Empty) if block => {
                if self.live_native == 0 {
                    return Err(EngineError::Stalled);
                }
                self.events_rx.recv().map_err(|_| EngineError::Stalled)?
            }
            Err(_) => return Ok(false),
        };
        self.dispatch(event);
        Ok(true)
    }

    pub(crate) fn defer<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Engine) + 'static,
    {
        self.tasks.push_back(Task::Run(Box::new(f)));
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Run(f) => f(self),
            Task::Flush(hub) => self.flush(hub),
            Task::Script(job) => self.run_script_job(job),
            Task::Fail(job) => {
                let status = self.config.failed_status;
                self.finish_job(job, JobState::Failed, status);
            }
        }
    }

    pub(crate) fn next_job_id(&mut self) -> JobId {
        let id = JobId(self.next_job);
        self.next_job += 1;
        id
    }

    /// Send SIGINT to the foreground job, if there is one
    pub fn interrupt(&mut self) {
        let Some(job) = self.table.foreground().and_then(|id| self.table.job_of(id)) else {
            debug!("interrupt with no foreground job");
            return;
        };
        debug!(job = %job, "interrupting foreground job");
        if let Some(Variant::Native(native)) = self.jobs.get_mut(&job).map(|e| &mut e.variant) {
            native.interrupt();
        }
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.table.list()
    }

    pub fn job_table(&self) -> &JobTable {
        &self.table
    }

    /// `jobs` output with +/- markers
    pub fn jobs_listing(&self) -> String {
        format_listing(&self.table)
    }

    /// Continue a job in the foreground and give it the terminal
    pub fn fg(&mut self, id: usize) -> Result<()> {
        let job = self.table.job_of(id).ok_or(EngineError::UnknownJob(id))?;
        let entry = self.jobs.get_mut(&job).ok_or(EngineError::UnknownJob(id))?;
        debug!(job = %job, id, "fg");

        entry.mode = Mode::Foreground;
        if entry.stdout == crate::job::Sink::Console {
            entry.stdout = crate::job::Sink::Terminal;
        }
        if entry.stderr == crate::job::Sink::Console {
            entry.stderr = crate::job::Sink::Terminal;
        }
        self.console.pause();
        self.terminal_owner = Some(job);
        self.table.set_foreground(Some(id));
        if let Variant::Native(native) = &mut entry.variant {
            native.set_mode(Mode::Foreground, &self.terminal);
        }
        Ok(())
    }

    /// Continue a stopped job in the background
    pub fn bg(&mut self, id: usize) -> Result<()> {
        let job = self.table.job_of(id).ok_or(EngineError::UnknownJob(id))?;
        let entry = self.jobs.get_mut(&job).ok_or(EngineError::UnknownJob(id))?;
        debug!(job = %job, id, "bg");

        entry.mode = Mode::Background;
        if let Variant::Native(native) = &mut entry.variant {
            native.set_mode(Mode::Background, &self.terminal);
        }
        Ok(())
    }

    /// Show a translation or engine error the way a shell would
    pub(crate) fn report(&mut self, err: &EngineError) {
        tracing::warn!(error = %err, "step failed");
        let line = format!("jsh: {err}\n");
        self.console.err(line.as_bytes());
    }
}
