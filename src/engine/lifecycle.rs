//! Job lifecycle: creation, start, output routing and completion

use tracing::{debug, warn};

use super::{Engine, Event, ProcessChange, Task};
use crate::command::CommandSpec;
use crate::hub::HubId;
use crate::job::native::{NativeJob, StartEnv};
use crate::job::script::ScriptJob;
use crate::job::{Dup, JobEntry, JobId, JobKind, JobState, Launch, Mode, Sink, Stream, Variant};
use crate::jobs::{JobInfo, TableChange};
use crate::vars::StoreId;

/// Where a new job hangs in the engine
pub(crate) struct JobSetup {
    pub parent: Option<HubId>,
    pub store: StoreId,
    pub stdout: Sink,
    pub stderr: Sink,
    /// Register in the job table; the flag marks it foreground
    pub table: Option<bool>,
    /// Command text shown in the table instead of the job's own
    pub title: Option<String>,
}

impl Engine {
    /// Native unless the name resolves to an in-process command
    pub(crate) fn kind_of(&self, name: &str) -> JobKind {
        if self.services.script_command(name).is_some() {
            JobKind::Script
        } else {
            JobKind::Native
        }
    }

    pub(crate) fn create_job(
        &mut self,
        kind: JobKind,
        specs: &[CommandSpec],
        setup: JobSetup,
    ) -> JobId {
        let launches: Vec<Launch> = specs
            .iter()
            .map(|spec| Launch::resolve(spec, kind, self.services.as_ref()))
            .collect();
        let command = specs
            .iter()
            .map(CommandSpec::command_line)
            .collect::<Vec<_>>()
            .join(" | ");

        let id = self.next_job_id();
        let hub = self.create_hub("job", setup.parent);
        let variant = match kind {
            JobKind::Native => Variant::Native(NativeJob::new(launches)),
            JobKind::Script => Variant::Script(ScriptJob::new(launches)),
        };
        let title = setup.title.unwrap_or_else(|| command.clone());
        let table_id = setup
            .table
            .map(|foreground| self.table.add(id, title, foreground));

        debug!(job = %id, ?kind, command = %command, "job created");
        self.jobs.insert(
            id,
            JobEntry {
                variant,
                state: JobState::Unstarted,
                status: None,
                mode: Mode::Background,
                hub,
                store: setup.store,
                stdout: setup.stdout,
                stderr: setup.stderr,
                upstream: None,
                table_id,
                command,
                live: false,
            },
        );
        id
    }

    pub(crate) fn job_hub(&self, job: JobId) -> Option<HubId> {
        self.jobs.get(&job).map(|entry| entry.hub)
    }

    /// Feed `job`'s stdout into `next`
    pub(crate) fn connect(&mut self, job: JobId, next: JobId) {
        if let Some(entry) = self.jobs.get_mut(&job) {
            entry.stdout = Sink::Forward(next);
        }
        if let Some(entry) = self.jobs.get_mut(&next) {
            entry.upstream = Some(job);
        }
    }

    /// Start a job. Returns false when nothing could be launched; the job
    /// then settles as Failed on the next turn.
    pub(crate) fn start_job(&mut self, job: JobId, mode: Mode, dup: Dup) -> bool {
        let Some(entry) = self.jobs.get_mut(&job) else {
            return false;
        };
        entry.mode = mode;
        entry.state = JobState::Running;
        let table_id = entry.table_id;

        if mode == Mode::Foreground {
            self.console.pause();
            self.terminal_owner = Some(job);
            if table_id.is_some() {
                self.table.set_foreground(table_id);
            }
        }
        if let Some(id) = table_id {
            self.table.update(id, JobState::Running, None);
        }
        debug!(job = %job, ?mode, ?dup, "job starting");

        let Some(entry) = self.jobs.get_mut(&job) else {
            return false;
        };
        match &mut entry.variant {
            Variant::Native(native) => {
                let started = native.start(&StartEnv {
                    job,
                    events: &self.events_tx,
                    terminal: &self.terminal,
                    mode,
                    dup,
                });
                let launched = started.spawned > 0 && !native.failed();
                if started.spawned > 0 {
                    entry.live = true;
                    self.live_native += 1;
                } else {
                    self.tasks.push_back(Task::Fail(job));
                }
                if let Some(diagnostic) = started.diagnostic {
                    warn!(job = %job, "{}", diagnostic.trim_end());
                    self.route(job, Stream::Stderr, diagnostic.as_bytes());
                }
                launched
            }
            Variant::Script(script) => {
                if script.start(dup) {
                    self.tasks.push_back(Task::Script(job));
                }
                true
            }
        }
    }

    /// Deliver output of `job` to its sink
    pub(crate) fn route(&mut self, job: JobId, stream: Stream, data: &[u8]) {
        let Some(sink) = self.jobs.get(&job).map(|entry| entry.sink(stream)) else {
            return;
        };
        match (sink, stream) {
            (Sink::Terminal, Stream::Stdout) => self.console.out(data),
            (Sink::Terminal, Stream::Stderr) => self.console.err(data),
            (Sink::Console, Stream::Stdout) => self.console.log(data),
            (Sink::Console, Stream::Stderr) => self.console.error(data),
            (Sink::Forward(next), _) => self.write_job(next, data),
            (Sink::Capture(key), Stream::Stdout) => {
                if let Some(capture) = self.captures.get_mut(key) {
                    capture.stdout.extend_from_slice(data);
                }
            }
            (Sink::Capture(key), Stream::Stderr) => {
                if let Some(capture) = self.captures.get_mut(key) {
                    capture.stderr.extend_from_slice(data);
                }
            }
        }
    }

    pub(crate) fn write_job(&mut self, job: JobId, data: &[u8]) {
        match self.jobs.get_mut(&job).map(|entry| &mut entry.variant) {
            Some(Variant::Native(native)) => native.write(data),
            Some(Variant::Script(script)) => script.write(data),
            None => {}
        }
    }

    /// End of input for `job`
    pub(crate) fn close_job(&mut self, job: JobId) {
        match self.jobs.get_mut(&job).map(|entry| &mut entry.variant) {
            Some(Variant::Native(native)) => native.close(),
            Some(Variant::Script(script)) => {
                if script.close() {
                    self.tasks.push_back(Task::Script(job));
                }
            }
            None => {}
        }
    }

    pub(super) fn dispatch(&mut self, event: Event) {
        match event {
            Event::Output { job, stream, data } => self.route(job, stream, &data),
            Event::Closed { job, stream } => {
                debug!(job = %job, ?stream, "stream closed");
                if let Some(native) = self.native_mut(job) {
                    native.stream_closed();
                }
                self.check_native(job);
            }
            Event::Process { job, index, change } => {
                let Some(native) = self.native_mut(job) else {
                    return;
                };
                native.process_changed(index, change);
                let all_stopped = native.all_stopped();
                match change {
                    ProcessChange::Exited(_) => self.check_native(job),
                    ProcessChange::Stopped if all_stopped => self.job_stopped(job),
                    ProcessChange::Stopped => {}
                    ProcessChange::Continued => self.job_continued(job),
                }
            }
            Event::Interrupt => self.interrupt(),
        }
    }

    fn native_mut(&mut self, job: JobId) -> Option<&mut NativeJob> {
        match self.jobs.get_mut(&job).map(|entry| &mut entry.variant) {
            Some(Variant::Native(native)) => Some(native),
            _ => None,
        }
    }

    fn check_native(&mut self, job: JobId) {
        let Some(entry) = self.jobs.get(&job) else {
            return;
        };
        let Variant::Native(native) = &entry.variant else {
            return;
        };
        if entry.state.is_terminal() || !native.is_finished() {
            return;
        }
        let state = if native.failed() {
            JobState::Failed
        } else {
            JobState::Terminated
        };
        let status = native.exit_status(self.config.failed_status);
        self.finish_job(job, state, status);
    }

    /// Settle a job: close downstream input, hand back the terminal, update
    /// the table, then complete its hub. Repeated calls are ignored.
    pub(crate) fn finish_job(&mut self, job: JobId, state: JobState, status: i32) {
        let Some(entry) = self.jobs.get_mut(&job) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }
        entry.state = state;
        entry.status = Some(status);
        let hub = entry.hub;
        let table_id = entry.table_id;
        let upstream = entry.upstream;
        let command = entry.command.clone();
        let was_live = entry.live;
        let downstream = match entry.stdout {
            Sink::Forward(next) => Some(next),
            _ => None,
        };
        debug!(job = %job, state = state.as_str(), status, "job finished");

        if was_live {
            self.live_native = self.live_native.saturating_sub(1);
        }
        if let Some(next) = downstream {
            self.close_job(next);
        }
        if let Some(up) = upstream {
            if let Some(native) = self.native_mut(up) {
                native.broken_pipe();
            }
        }
        let owned_terminal = self.terminal_owner == Some(job);
        if owned_terminal {
            self.terminal_owner = None;
            if let Err(err) = self.terminal.reclaim_terminal() {
                debug!(error = %err, "terminal reclaim failed");
            }
        }
        if let Some(id) = table_id {
            let foreground = self.table.foreground() == Some(id);
            self.table.update(id, state, Some(status));
            self.console.job_changed(&JobInfo {
                id,
                command,
                state,
                status: Some(status),
                foreground,
            });
        }
        // input comes back only once the final state is out
        if owned_terminal {
            self.console.resume();
        }

        self.jobs.remove(&job);
        self.notify(hub, status);
    }

    fn job_stopped(&mut self, job: JobId) {
        let Some(entry) = self.jobs.get_mut(&job) else {
            return;
        };
        if entry.state != JobState::Running {
            return;
        }
        entry.state = JobState::Stopped;
        let table_id = entry.table_id;
        let command = entry.command.clone();
        debug!(job = %job, "job stopped");

        let mut release = self.terminal_owner == Some(job);
        if let Some(id) = table_id {
            release |= self.table.update(id, JobState::Stopped, None) == TableChange::ForegroundStopped;
        }
        if release {
            self.terminal_owner = None;
            if let Err(err) = self.terminal.reclaim_terminal() {
                debug!(error = %err, "terminal reclaim failed");
            }
            self.console.restore_terminal();
        }
        if let Some(id) = table_id {
            self.console.job_changed(&JobInfo {
                id,
                command,
                state: JobState::Stopped,
                status: None,
                foreground: false,
            });
        }
        if release {
            self.console.resume();
        }
    }

    fn job_continued(&mut self, job: JobId) {
        let Some(entry) = self.jobs.get_mut(&job) else {
            return;
        };
        if entry.state != JobState::Stopped {
            return;
        }
        entry.state = JobState::Running;
        let table_id = entry.table_id;
        let command = entry.command.clone();
        let foreground = entry.mode == Mode::Foreground;
        debug!(job = %job, "job continued");

        if let Some(id) = table_id {
            self.table.update(id, JobState::Running, None);
            self.console.job_changed(&JobInfo {
                id,
                command,
                state: JobState::Running,
                status: None,
                foreground,
            });
        }
    }

    /// Run a script job now that its input is complete
    pub(crate) fn run_script_job(&mut self, job: JobId) {
        let failed_status = self.config.failed_status;
        let Some(entry) = self.jobs.get_mut(&job) else {
            return;
        };
        let Variant::Script(script) = &mut entry.variant else {
            return;
        };
        let outcome = script.run(failed_status);
        let store = entry.store;
        debug!(job = %job, status = outcome.status, "script job ran");

        for (name, value) in outcome.escapes {
            self.vars.escape(store, name, value);
        }
        if !outcome.stdout.is_empty() {
            self.route(job, Stream::Stdout, &outcome.stdout);
        }
        if !outcome.stderr.is_empty() {
            self.route(job, Stream::Stderr, &outcome.stderr);
        }
        self.finish_job(job, JobState::Terminated, outcome.status);

        if let Some(pending) = outcome.finalizers {
            self.defer(move |eng| {
                let (io, escapes) = pending.run();
                for (name, value) in escapes {
                    eng.vars.escape(store, name, value);
                }
                let (out, err) = io.into_parts();
                if !out.is_empty() {
                    eng.console.log(&out);
                }
                if !err.is_empty() {
                    eng.console.error(&err);
                }
            });
        }
    }
}
