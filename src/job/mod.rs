//! Job handles
//!
//! A job is one spawned unit: a chain of OS processes ([`native`]) or a
//! chain of in-process commands ([`script`]). Both sit behind the same
//! add/start/write/close contract and report back to the engine, which owns
//! every job in its arena.

pub mod native;
pub mod script;

use std::fmt;

use bitflags::bitflags;
use serde_json::Value;

use crate::command::{render, Assignments, CommandSpec, Redirection};
use crate::hub::HubId;
use crate::services::RuntimeServices;
use crate::vars::StoreId;

use native::NativeJob;
use script::{ScriptCommand, ScriptJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Unstarted,
    Running,
    Stopped,
    Terminated,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Unstarted => "Unstarted",
            JobState::Running => "Running",
            JobState::Stopped => "Stopped",
            JobState::Terminated => "Done",
            JobState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Terminated | JobState::Failed)
    }

    pub fn is_stopped(&self) -> bool {
        *self == JobState::Stopped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Foreground,
    Background,
}

bitflags! {
    /// Streams routed through the engine instead of inherited
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dup: u8 {
        const STDIN = 0b001;
        const STDOUT = 0b010;
        const STDERR = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Destination of a job's output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Console `out`/`err`
    Terminal,
    /// Console `log`/`error` (background output)
    Console,
    /// Input of the next pipeline segment
    Forward(JobId),
    /// Private buffer of a substitution
    Capture(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Native,
    Script,
}

/// Launch parameters of one command inside a job
#[derive(Debug, Clone)]
pub struct Launch {
    pub name: String,
    pub argv: Vec<String>,
    pub env: Assignments,
    pub redirections: Vec<Redirection>,
    pub script: Option<ScriptCommand>,
}

impl Launch {
    /// Resolve a descriptor: expand globs and look up the in-process command
    pub fn resolve(spec: &CommandSpec, kind: JobKind, services: &dyn RuntimeServices) -> Self {
        let script = match kind {
            JobKind::Script => services.script_command(&spec.name),
            JobKind::Native => None,
        };
        Self {
            name: spec.name.clone(),
            argv: spec.argv(services),
            env: spec.assignments.clone(),
            redirections: spec.redirections.clone(),
            script,
        }
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or(&[])
    }

    /// Environment overrides in the text form a process receives
    pub fn rendered_env(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.env.iter().map(|(k, v)| (k.as_str(), render(v)))
    }

    /// Process environment with the overrides on top, as script commands see it
    pub fn script_env(&self) -> Assignments {
        let mut env: Assignments = std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        for (name, value) in &self.env {
            env.insert(name.clone(), value.clone());
        }
        env
    }
}

pub(crate) enum Variant {
    Native(NativeJob),
    Script(ScriptJob),
}

/// A job as the engine's arena holds it
pub(crate) struct JobEntry {
    pub variant: Variant,
    pub state: JobState,
    pub status: Option<i32>,
    pub mode: Mode,
    pub hub: HubId,
    pub store: StoreId,
    pub stdout: Sink,
    pub stderr: Sink,
    /// Segment feeding this job, if any
    pub upstream: Option<JobId>,
    pub table_id: Option<usize>,
    pub command: String,
    /// Counted as a live native job by the engine loop
    pub live: bool,
}

impl JobEntry {
    pub(crate) fn sink(&self, stream: Stream) -> Sink {
        match stream {
            Stream::Stdout => self.stdout,
            Stream::Stderr => self.stderr,
        }
    }
}
