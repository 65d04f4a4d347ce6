//! OS process jobs
//!
//! One process per command, connected with OS pipes and gathered in one
//! process group. Helper threads read the routed streams, feed stdin and
//! wait on each process; all of them only post [`Event`]s back to the
//! engine.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use os_pipe::{PipeReader, PipeWriter};
use tracing::{debug, warn};

use crate::command::RedirectTarget;
use crate::engine::{Event, ProcessChange};
use crate::signal::reset_job_control_signals;
use crate::syntax::RedirectOp;
use crate::terminal::TerminalControl;

use super::{Dup, JobId, Launch, Mode, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcState {
    Running,
    Stopped,
    Exited(i32),
}

#[derive(Debug)]
struct Proc {
    pid: Pid,
    state: ProcState,
}

pub(crate) struct StartEnv<'a> {
    pub job: JobId,
    pub events: &'a Sender<Event>,
    pub terminal: &'a TerminalControl,
    pub mode: Mode,
    pub dup: Dup,
}

/// What happened while spawning
pub(crate) struct Started {
    pub spawned: usize,
    pub diagnostic: Option<String>,
}

pub(crate) struct NativeJob {
    launches: Vec<Launch>,
    pgid: Option<Pid>,
    procs: Vec<Proc>,
    stdin: Option<Sender<Vec<u8>>>,
    open_streams: usize,
    failed: bool,
}

impl NativeJob {
    pub(crate) fn new(launches: Vec<Launch>) -> Self {
        Self {
            launches,
            pgid: None,
            procs: Vec::new(),
            stdin: None,
            open_streams: 0,
            failed: false,
        }
    }

    pub(crate) fn pgid(&self) -> Option<Pid> {
        self.pgid
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed
    }

    /// Spawn every process, then start one waiter per process. On the first
    /// failure the processes already spawned are killed; they are still
    /// reaped through the waiters.
    pub(crate) fn start(&mut self, env: &StartEnv<'_>) -> Started {
        let count = self.launches.len();
        let mut diagnostic = None;
        let mut upstream: Option<PipeReader> = None;
        let mut stderr_pipe: Option<(PipeReader, PipeWriter)> = None;

        if env.dup.contains(Dup::STDERR) {
            match os_pipe::pipe() {
                Ok(pipe) => stderr_pipe = Some(pipe),
                Err(err) => warn!(job = %env.job, error = %err, "stderr pipe unavailable, inheriting"),
            }
        }

        for index in 0..count {
            let launch = &self.launches[index];
            let last = index + 1 == count;
            let shared_stderr = stderr_pipe.as_ref().map(|(_, w)| w);

            let (streams, wiring) =
                match Streams::prepare(launch, index, last, env.dup, upstream.take(), shared_stderr) {
                    Ok(prepared) => prepared,
                    Err(err) => {
                        diagnostic = Some(format!("{}: {}\n", launch.name, err));
                        self.failed = true;
                        break;
                    }
                };

            let mut cmd = Command::new(&launch.argv[0]);
            cmd.args(&launch.argv[1..])
                .envs(launch.rendered_env())
                .stdin(streams.stdin.into_stdio())
                .stdout(streams.stdout.into_stdio())
                .stderr(streams.stderr.into_stdio())
                .process_group(self.pgid.map_or(0, Pid::as_raw));
            unsafe {
                cmd.pre_exec(reset_job_control_signals);
            }

            match cmd.spawn() {
                Ok(child) => {
                    let pid = Pid::from_raw(child.id() as i32);
                    debug!(job = %env.job, pid = pid.as_raw(), command = %launch.name, "spawned");

                    if self.pgid.is_none() {
                        self.pgid = Some(pid);
                        if env.mode == Mode::Foreground {
                            if let Err(err) = env.terminal.give_terminal_to(pid) {
                                debug!(job = %env.job, error = %err, "terminal handoff failed");
                            }
                        }
                    }

                    if let Some(writer) = wiring.stdin_writer {
                        self.stdin = Some(spawn_writer(writer));
                    }
                    if let Some(reader) = wiring.stdout_reader {
                        spawn_reader(env.job, Stream::Stdout, reader, env.events.clone());
                        self.open_streams += 1;
                    }
                    upstream = wiring.next_upstream;

                    self.procs.push(Proc {
                        pid,
                        state: ProcState::Running,
                    });
                }
                Err(err) => {
                    diagnostic = Some(describe_failure(&launch.name, &err));
                    self.failed = true;
                    break;
                }
            }
        }

        if let Some((reader, writer)) = stderr_pipe {
            drop(writer);
            if !self.procs.is_empty() {
                spawn_reader(env.job, Stream::Stderr, reader, env.events.clone());
                self.open_streams += 1;
            }
        }

        if self.failed {
            self.stdin = None;
            self.signal(Signal::SIGKILL);
        }

        // An unreaped leader keeps the group joinable; wait only once every
        // member is in it.
        for (index, proc) in self.procs.iter().enumerate() {
            spawn_waiter(env.job, index, proc.pid, env.events.clone());
        }

        Started {
            spawned: self.procs.len(),
            diagnostic,
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) {
        if let Some(stdin) = &self.stdin {
            let _ = stdin.send(data.to_vec());
        }
    }

    /// End of input: dropping the sender lets the writer thread close the pipe
    pub(crate) fn close(&mut self) {
        self.stdin = None;
    }

    pub(crate) fn stream_closed(&mut self) {
        self.open_streams = self.open_streams.saturating_sub(1);
    }

    pub(crate) fn process_changed(&mut self, index: usize, change: ProcessChange) {
        let Some(proc) = self.procs.get_mut(index) else {
            return;
        };
        proc.state = match change {
            ProcessChange::Exited(code) => ProcState::Exited(code),
            ProcessChange::Stopped => ProcState::Stopped,
            ProcessChange::Continued => ProcState::Running,
        };
    }

    /// Every process reaped and every routed stream at EOF
    pub(crate) fn is_finished(&self) -> bool {
        self.open_streams == 0
            && self
                .procs
                .iter()
                .all(|p| matches!(p.state, ProcState::Exited(_)))
    }

    pub(crate) fn all_stopped(&self) -> bool {
        let mut any_stopped = false;
        for proc in &self.procs {
            match proc.state {
                ProcState::Running => return false,
                ProcState::Stopped => any_stopped = true,
                ProcState::Exited(_) => {}
            }
        }
        any_stopped
    }

    /// Status of the last process
    pub(crate) fn exit_status(&self, failed_status: i32) -> i32 {
        if self.failed {
            return failed_status;
        }
        match self.procs.last().map(|p| p.state) {
            Some(ProcState::Exited(code)) => code,
            _ => failed_status,
        }
    }

    /// Continue the job, handing it the terminal when it goes foreground
    pub(crate) fn set_mode(&mut self, mode: Mode, terminal: &TerminalControl) {
        if mode == Mode::Foreground {
            if let Some(pgid) = self.pgid {
                if let Err(err) = terminal.give_terminal_to(pgid) {
                    debug!(pgid = pgid.as_raw(), error = %err, "terminal handoff failed");
                }
            }
        }
        self.signal(Signal::SIGCONT);
    }

    pub(crate) fn interrupt(&mut self) {
        self.signal(Signal::SIGINT);
    }

    /// The downstream segment is gone
    pub(crate) fn broken_pipe(&mut self) {
        self.stdin = None;
        if !self.is_finished() {
            self.signal(Signal::SIGPIPE);
        }
    }

    fn signal(&self, signal: Signal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        if let Err(err) = killpg(pgid, signal) {
            if err != Errno::ESRCH {
                debug!(pgid = pgid.as_raw(), ?signal, error = %err, "killpg failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pids(&self) -> Vec<Pid> {
        self.procs.iter().map(|p| p.pid).collect()
    }
}

fn describe_failure(name: &str, err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => format!("{name}: command not found\n"),
        io::ErrorKind::PermissionDenied => format!("{name}: permission denied\n"),
        _ => format!("{name}: {err}\n"),
    }
}

/// One end of a child's standard stream
enum Source {
    Inherit,
    Null,
    Read(PipeReader),
    Write(PipeWriter),
    File(File),
}

impl Source {
    fn try_clone(&self) -> io::Result<Source> {
        Ok(match self {
            Source::Inherit => Source::Inherit,
            Source::Null => Source::Null,
            Source::Read(r) => Source::Read(r.try_clone()?),
            Source::Write(w) => Source::Write(w.try_clone()?),
            Source::File(f) => Source::File(f.try_clone()?),
        })
    }

    /// Copy of the stream behind `fd`. An inherited stream is the shell's
    /// own descriptor `fd`, so it is duplicated here rather than left to the
    /// slot it gets copied into.
    fn duplicate(&self, fd: i32) -> io::Result<Source> {
        let shell = match (self, fd) {
            (Source::Inherit, 0) => io::stdin().as_fd().try_clone_to_owned()?,
            (Source::Inherit, 1) => io::stdout().as_fd().try_clone_to_owned()?,
            (Source::Inherit, 2) => io::stderr().as_fd().try_clone_to_owned()?,
            _ => return self.try_clone(),
        };
        Ok(Source::File(File::from(shell)))
    }

    fn into_stdio(self) -> Stdio {
        match self {
            Source::Inherit => Stdio::inherit(),
            Source::Null => Stdio::null(),
            Source::Read(r) => Stdio::from(r),
            Source::Write(w) => Stdio::from(w),
            Source::File(f) => Stdio::from(f),
        }
    }
}

struct Streams {
    stdin: Source,
    stdout: Source,
    stderr: Source,
}

/// Engine-side pipe ends created for one process
#[derive(Default)]
struct Wiring {
    stdin_writer: Option<PipeWriter>,
    stdout_reader: Option<PipeReader>,
    next_upstream: Option<PipeReader>,
}

impl Streams {
    fn prepare(
        launch: &Launch,
        index: usize,
        last: bool,
        dup: Dup,
        upstream: Option<PipeReader>,
        shared_stderr: Option<&PipeWriter>,
    ) -> io::Result<(Streams, Wiring)> {
        let mut wiring = Wiring::default();

        let stdin = match upstream {
            Some(reader) => Source::Read(reader),
            None if index == 0 && dup.contains(Dup::STDIN) => {
                let (reader, writer) = os_pipe::pipe()?;
                wiring.stdin_writer = Some(writer);
                Source::Read(reader)
            }
            None => Source::Inherit,
        };

        let stdout = if !last {
            let (reader, writer) = os_pipe::pipe()?;
            wiring.next_upstream = Some(reader);
            Source::Write(writer)
        } else if dup.contains(Dup::STDOUT) {
            let (reader, writer) = os_pipe::pipe()?;
            wiring.stdout_reader = Some(reader);
            Source::Write(writer)
        } else {
            Source::Inherit
        };

        let stderr = match shared_stderr {
            Some(writer) => Source::Write(writer.try_clone()?),
            None => Source::Inherit,
        };

        let mut streams = Streams {
            stdin,
            stdout,
            stderr,
        };
        streams.redirect(launch)?;
        Ok((streams, wiring))
    }

    fn slot(&mut self, fd: i32) -> io::Result<&mut Source> {
        match fd {
            0 => Ok(&mut self.stdin),
            1 => Ok(&mut self.stdout),
            2 => Ok(&mut self.stderr),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{fd}: unsupported file descriptor"),
            )),
        }
    }

    /// Apply redirections left to right
    fn redirect(&mut self, launch: &Launch) -> io::Result<()> {
        for redirection in &launch.redirections {
            let source = match (redirection.op, &redirection.target) {
                (_, RedirectTarget::Close) => Source::Null,
                (_, RedirectTarget::Fd(fd)) => self.slot(*fd)?.duplicate(*fd)?,
                (op, RedirectTarget::File(path)) => {
                    let opened = match op {
                        RedirectOp::Input | RedirectOp::DupInput => File::open(path),
                        RedirectOp::Append => OpenOptions::new().append(true).create(true).open(path),
                        RedirectOp::Output | RedirectOp::DupOutput => File::create(path),
                    };
                    let file = opened
                        .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))?;
                    Source::File(file)
                }
            };
            *self.slot(redirection.fd)? = source;
        }
        Ok(())
    }
}

fn spawn_writer(mut pipe: PipeWriter) -> Sender<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::spawn(move || {
        for chunk in rx {
            if let Err(err) = pipe.write_all(&chunk) {
                if err.kind() != io::ErrorKind::BrokenPipe {
                    debug!(error = %err, "stdin writer stopped");
                }
                break;
            }
        }
    });
    tx
}

fn spawn_reader(job: JobId, stream: Stream, mut pipe: PipeReader, events: Sender<Event>) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let event = Event::Output {
                        job,
                        stream,
                        data: buf[..n].to_vec(),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = events.send(Event::Closed { job, stream });
    });
}

fn spawn_waiter(job: JobId, index: usize, pid: Pid, events: Sender<Event>) {
    thread::spawn(move || loop {
        let flags = WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        let change = match waitpid(pid, Some(flags)) {
            Ok(WaitStatus::Exited(_, code)) => ProcessChange::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => ProcessChange::Exited(128 + signal as i32),
            Ok(WaitStatus::Stopped(_, _)) => ProcessChange::Stopped,
            Ok(WaitStatus::Continued(_)) => ProcessChange::Continued,
            Ok(_) | Err(Errno::EINTR) => continue,
            // reaped by someone else; nothing more will be reported
            Err(_) => ProcessChange::Exited(0),
        };
        let exited = matches!(change, ProcessChange::Exited(_));
        if events.send(Event::Process { job, index, change }).is_err() || exited {
            break;
        }
    });
}
