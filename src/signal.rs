use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use nix::sys::signal::{self as nix_signal, SigHandler, Signal};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::debug;

use crate::engine::Event;

/// The terminating signal that was received (0 if none)
static SIGNAL_NUMBER: AtomicI32 = AtomicI32::new(0);

/// Routes signals into the engine.
///
/// SIGINT never stops the shell itself: it becomes an [`Event::Interrupt`]
/// that the engine forwards to the foreground job. SIGTERM and SIGHUP
/// request shutdown.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the signal thread, posting interrupts on `events`
    pub fn setup(&self, events: Sender<Event>) -> Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let shutdown_flag = Arc::clone(&self.shutdown_flag);

        thread::spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGINT => {
                        debug!("SIGINT received, interrupting foreground job");
                        if events.send(Event::Interrupt).is_err() {
                            break;
                        }
                    }
                    SIGTERM | SIGHUP => {
                        SIGNAL_NUMBER.store(sig, Ordering::SeqCst);
                        shutdown_flag.store(true, Ordering::SeqCst);
                        let _ = events.send(Event::Interrupt);
                    }
                    _ => {}
                }
            }
        });

        Ok(())
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    pub fn signal_number(&self) -> i32 {
        SIGNAL_NUMBER.load(Ordering::SeqCst)
    }

    /// Exit code for the terminating signal
    pub fn exit_code(&self) -> i32 {
        match self.signal_number() {
            SIGINT => 130,
            SIGTERM => 143,
            SIGHUP => 129,
            _ => 1,
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

const JOB_CONTROL_SIGNALS: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGCHLD,
];

/// Keep an interactive shell from being stopped by its own terminal
pub fn ignore_job_control_signals() -> Result<()> {
    for signal in [Signal::SIGTSTP, Signal::SIGTTIN, Signal::SIGTTOU] {
        unsafe { nix_signal::signal(signal, SigHandler::SigIgn) }?;
    }
    Ok(())
}

/// Runs in the forked child before exec: jobs get default dispositions
/// whatever the shell ignores.
pub fn reset_job_control_signals() -> io::Result<()> {
    for signal in JOB_CONTROL_SIGNALS {
        unsafe { nix_signal::signal(signal, SigHandler::SigDfl) }
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    }
    Ok(())
}
