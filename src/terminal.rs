use std::cell::RefCell;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use nix::libc;
use nix::unistd::{getpgrp, setpgid, Pid};

use crate::jobs::JobInfo;

/// Terminal control for managing foreground process groups
#[derive(Debug, Clone)]
pub struct TerminalControl {
    shell_pgid: Pid,
    terminal_fd: RawFd,
    is_interactive: bool,
}

impl TerminalControl {
    /// Create a terminal control instance bound to stdin
    pub fn new() -> Self {
        let terminal_fd = 0;
        let shell_pgid = getpgrp();

        // Interactive only when stdin is a tty and we own its foreground group
        let is_interactive = unsafe { libc::isatty(terminal_fd) } == 1
            && Self::tcgetpgrp_raw(terminal_fd)
                .map(|fg_pgid| fg_pgid == shell_pgid.as_raw())
                .unwrap_or(false);

        Self {
            shell_pgid,
            terminal_fd,
            is_interactive,
        }
    }

    /// A control that never touches the terminal (embedding, tests, scripts)
    pub fn detached() -> Self {
        Self {
            shell_pgid: getpgrp(),
            terminal_fd: 0,
            is_interactive: false,
        }
    }

    /// Put the shell in its own process group and take the terminal.
    /// Only meaningful when stdin is a tty.
    pub fn take_control() -> Result<Self> {
        let pid = Pid::this();
        if getpgrp() != pid {
            setpgid(pid, pid).map_err(|e| anyhow!("setpgid failed: {}", e))?;
        }
        if unsafe { libc::isatty(0) } == 1 {
            Self::tcsetpgrp_raw(0, pid.as_raw())?;
        }
        Ok(Self::new())
    }

    fn tcgetpgrp_raw(fd: RawFd) -> Result<i32> {
        let pgid = unsafe { libc::tcgetpgrp(fd) };
        if pgid < 0 {
            Err(anyhow!("tcgetpgrp failed"))
        } else {
            Ok(pgid)
        }
    }

    fn tcsetpgrp_raw(fd: RawFd, pgid: i32) -> Result<()> {
        let result = unsafe { libc::tcsetpgrp(fd, pgid) };
        if result != 0 {
            Err(anyhow!("tcsetpgrp failed"))
        } else {
            Ok(())
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.is_interactive
    }

    /// Give terminal control to the specified process group
    pub fn give_terminal_to(&self, pgid: Pid) -> Result<()> {
        if !self.is_interactive {
            return Ok(());
        }

        Self::tcsetpgrp_raw(self.terminal_fd, pgid.as_raw()).map_err(|e| {
            anyhow!(
                "Failed to give terminal control to process group {}: {}",
                pgid,
                e
            )
        })
    }

    /// Reclaim terminal control for the shell
    pub fn reclaim_terminal(&self) -> Result<()> {
        if !self.is_interactive {
            return Ok(());
        }

        Self::tcsetpgrp_raw(self.terminal_fd, self.shell_pgid.as_raw())
            .map_err(|e| anyhow!("Failed to reclaim terminal control: {}", e))
    }
}

impl Default for TerminalControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the engine sends output and terminal ownership changes.
///
/// `out`/`err` carry foreground output, `log`/`error` background output.
/// `pause` is called before a foreground job starts and `resume` once it
/// terminated or stopped, so a line editor can get out of the way.
pub trait Console {
    fn out(&mut self, data: &[u8]);
    fn err(&mut self, data: &[u8]);

    fn log(&mut self, data: &[u8]) {
        self.out(data);
    }

    fn error(&mut self, data: &[u8]) {
        self.err(data);
    }

    fn pause(&mut self) {}
    fn resume(&mut self) {}

    /// Terminal modes may have been changed by a job that gave it back
    fn restore_terminal(&mut self) {}

    fn job_changed(&mut self, _job: &JobInfo) {}
}

/// Console writing straight to the process's stdout and stderr
#[derive(Debug, Default)]
pub struct StdConsole;

impl StdConsole {
    pub fn new() -> Self {
        Self
    }
}

impl Console for StdConsole {
    fn out(&mut self, data: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(data);
        let _ = stdout.flush();
    }

    fn err(&mut self, data: &[u8]) {
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(data);
        let _ = stderr.flush();
    }

    fn job_changed(&mut self, job: &JobInfo) {
        if job.foreground && !job.state.is_stopped() {
            return;
        }
        let line = format!("[{}]  {}\t{}\n", job.id, job.state.as_str(), job.command);
        self.err(line.as_bytes());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
    Out(String),
    Err(String),
    Log(String),
    Error(String),
    Pause,
    Resume,
    RestoreTerminal,
    Job(JobInfo),
}

/// Console that records everything in memory.
///
/// Clones share one transcript, so a caller can keep a handle while the
/// engine owns the console.
#[derive(Debug, Clone, Default)]
pub struct MemoryConsole {
    events: Rc<RefCell<Vec<ConsoleEvent>>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ConsoleEvent> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    /// Concatenated foreground stdout
    pub fn stdout(&self) -> String {
        self.collect(|e| match e {
            ConsoleEvent::Out(s) => Some(s),
            _ => None,
        })
    }

    pub fn stderr(&self) -> String {
        self.collect(|e| match e {
            ConsoleEvent::Err(s) => Some(s),
            _ => None,
        })
    }

    /// Concatenated background output (both streams)
    pub fn background(&self) -> String {
        self.collect(|e| match e {
            ConsoleEvent::Log(s) | ConsoleEvent::Error(s) => Some(s),
            _ => None,
        })
    }

    fn collect<F>(&self, pick: F) -> String
    where
        F: Fn(&ConsoleEvent) -> Option<&String>,
    {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| pick(e).cloned())
            .collect()
    }

    fn record(&self, event: ConsoleEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl Console for MemoryConsole {
    fn out(&mut self, data: &[u8]) {
        self.record(ConsoleEvent::Out(String::from_utf8_lossy(data).into_owned()));
    }

    fn err(&mut self, data: &[u8]) {
        self.record(ConsoleEvent::Err(String::from_utf8_lossy(data).into_owned()));
    }

    fn log(&mut self, data: &[u8]) {
        self.record(ConsoleEvent::Log(String::from_utf8_lossy(data).into_owned()));
    }

    fn error(&mut self, data: &[u8]) {
        self.record(ConsoleEvent::Error(String::from_utf8_lossy(data).into_owned()));
    }

    fn pause(&mut self) {
        self.record(ConsoleEvent::Pause);
    }

    fn resume(&mut self) {
        self.record(ConsoleEvent::Resume);
    }

    fn restore_terminal(&mut self) {
        self.record(ConsoleEvent::RestoreTerminal);
    }

    fn job_changed(&mut self, job: &JobInfo) {
        self.record(ConsoleEvent::Job(job.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_is_not_interactive() {
        let terminal = TerminalControl::detached();
        assert!(!terminal.is_interactive());
        assert!(terminal.reclaim_terminal().is_ok());
        assert!(terminal.give_terminal_to(Pid::from_raw(1)).is_ok());
    }

    #[test]
    fn test_terminal_control_clone() {
        let terminal = TerminalControl::new();
        let terminal2 = terminal.clone();
        assert_eq!(terminal.is_interactive(), terminal2.is_interactive());
    }

    #[test]
    fn test_memory_console_shares_transcript() {
        let console = MemoryConsole::new();
        let mut handle = console.clone();
        handle.out(b"a");
        handle.pause();
        handle.log(b"bg");
        handle.out(b"b");
        handle.err(b"oops");

        assert_eq!(console.stdout(), "ab");
        assert_eq!(console.stderr(), "oops");
        assert_eq!(console.background(), "bg");
        assert_eq!(console.events()[1], ConsoleEvent::Pause);

        console.clear();
        assert!(handle.events().is_empty());
    }
}
