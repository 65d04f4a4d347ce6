use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, warn};

use jsh::config::EngineConfig;
use jsh::engine::Engine;
use jsh::logging::{init_logging, LogLevel};
use jsh::services::ShellServices;
use jsh::signal::{ignore_job_control_signals, SignalHandler};
use jsh::syntax::Script;
use jsh::terminal::{StdConsole, TerminalControl};

/// Run a JSON-encoded command tree
#[derive(Debug, Parser)]
#[command(name = "jsh", version, about)]
struct Cli {
    /// Configuration file (defaults to ~/.jshrc)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level; overrides JSH_LOG
    #[arg(long, value_enum, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Command tree given inline
    #[arg(short = 'c', value_name = "JSON", conflicts_with = "file")]
    command: Option<String>,

    /// File holding the command tree; stdin when neither this nor -c is given
    file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(status) => std::process::exit(status),
        Err(err) => {
            eprintln!("jsh: {err:#}");
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    };
    init_logging(cli.log_level, config.log_level.as_deref())?;

    let source = match (&cli.command, &cli.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        (None, None) => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("cannot read command tree from stdin")?;
            text
        }
    };
    let script = Script::from_json(&source).context("invalid command tree")?;

    // stdin is free for jobs only when the tree came from elsewhere
    let interactive = (cli.command.is_some() || cli.file.is_some()) && io::stdin().is_terminal();
    let terminal = if interactive {
        match TerminalControl::take_control() {
            Ok(terminal) => {
                ignore_job_control_signals()?;
                config.job_control = true;
                terminal
            }
            Err(err) => {
                warn!("job control disabled: {err}");
                TerminalControl::detached()
            }
        }
    } else {
        TerminalControl::detached()
    };
    debug!(interactive, ?config, "starting engine");

    let mut engine = Engine::with_terminal(config, ShellServices::new(), StdConsole::new(), terminal);
    let signals = SignalHandler::new();
    signals.setup(engine.event_sender())?;

    let status = engine.run(&script)?;
    if signals.should_shutdown() {
        return Ok(signals.exit_code());
    }
    // background jobs still write through this process
    engine.drain()?;
    Ok(status)
}
