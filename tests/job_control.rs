//! Job table, terminal hand-off and console pause/resume ordering

use jsh::config::EngineConfig;
use jsh::engine::Engine;
use jsh::job::JobState;
use jsh::services::ShellServices;
use jsh::syntax::{ListItem, Script, SimpleCommand};
use jsh::terminal::{ConsoleEvent, MemoryConsole};

fn engine() -> (Engine, MemoryConsole) {
    let console = MemoryConsole::new();
    let config = EngineConfig {
        inherit_terminal: false,
        ..EngineConfig::default()
    };
    (Engine::new(config, ShellServices::new(), console.clone()), console)
}

fn sh(script: &str) -> SimpleCommand {
    SimpleCommand::new("sh").args(["-c", script])
}

/// Pause, resume and foreground job notices, in the order they happened
fn foreground_trace(console: &MemoryConsole) -> Vec<String> {
    console
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ConsoleEvent::Pause => Some("pause".to_string()),
            ConsoleEvent::Resume => Some("resume".to_string()),
            ConsoleEvent::Job(info) if info.foreground => {
                Some(format!("{} {}", info.command, info.state.as_str()))
            }
            _ => None,
        })
        .collect()
}

#[test]
fn test_resume_follows_each_foreground_termination() {
    let (mut eng, console) = engine();
    let status = eng
        .run(&Script::new(vec![
            ListItem::background(sh("sleep 0.05; echo bg")),
            sh("sleep 0.2; echo fg").into(),
            SimpleCommand::new("echo").arg("done").into(),
        ]))
        .unwrap();
    eng.drain().unwrap();

    assert_eq!(status, 0);
    assert_eq!(console.stdout(), "fg\ndone\n");
    assert_eq!(console.background(), "bg\n");

    let trace = foreground_trace(&console);
    assert_eq!(trace.len(), 6, "unexpected trace: {trace:?}");
    assert_eq!(trace[0], "pause");
    assert!(trace[1].ends_with("Done"), "{trace:?}");
    assert_eq!(trace[2], "resume");
    assert_eq!(trace[3], "pause");
    assert_eq!(trace[4], "echo done Done");
    assert_eq!(trace[5], "resume");
}

#[test]
fn test_failed_launch_resumes_after_notice() {
    let (mut eng, console) = engine();
    let status = eng
        .run(&Script::new(vec![SimpleCommand::new("jsh-no-such-tool").into()]))
        .unwrap();
    assert_eq!(status, 127);
    assert_eq!(
        foreground_trace(&console),
        vec!["pause", "jsh-no-such-tool Failed", "resume"]
    );
}

#[test]
fn test_background_job_listed_until_done() {
    let (mut eng, console) = engine();
    let status = eng
        .run(&Script::new(vec![ListItem::background(sh("sleep 0.3"))]))
        .unwrap();
    assert_eq!(status, 0);

    let jobs = eng.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, 1);
    assert_eq!(jobs[0].state, JobState::Running);
    assert!(!jobs[0].foreground);

    eng.run(&Script::new(vec![SimpleCommand::new("jobs").into()]))
        .unwrap();
    let listing = console.stdout();
    assert!(listing.starts_with("[1]+  Running\t"), "{listing}");
    assert!(listing.ends_with(" &\n"), "{listing}");

    eng.drain().unwrap();
    assert!(eng.jobs().is_empty());
}

#[test]
fn test_fg_hands_the_console_to_the_job() {
    let (mut eng, console) = engine();
    eng.run(&Script::new(vec![ListItem::background(sh("sleep 0.3; echo later"))]))
        .unwrap();
    console.clear();

    let status = eng
        .run(&Script::new(vec![SimpleCommand::new("fg").arg("%1").into()]))
        .unwrap();
    assert_eq!(status, 0);
    assert_eq!(eng.job_table().foreground(), Some(1));

    eng.drain().unwrap();
    assert_eq!(console.stdout(), "later\n");
    let trace = foreground_trace(&console);
    assert_eq!(trace.first().map(String::as_str), Some("pause"));
    assert_eq!(trace.last().map(String::as_str), Some("resume"));
    assert!(trace[trace.len() - 2].ends_with("Done"), "{trace:?}");
    assert_eq!(eng.job_table().foreground(), None);
}

#[test]
fn test_bg_keeps_job_in_background() {
    let (mut eng, console) = engine();
    eng.run(&Script::new(vec![ListItem::background(sh("sleep 0.1"))]))
        .unwrap();

    let status = eng
        .run(&Script::new(vec![SimpleCommand::new("bg").into()]))
        .unwrap();
    assert_eq!(status, 0);
    assert_eq!(eng.job_table().foreground(), None);
    eng.drain().unwrap();
    assert!(console.stderr().is_empty());
}

#[test]
fn test_job_control_errors() {
    let (mut eng, console) = engine();
    let status = eng
        .run(&Script::new(vec![
            SimpleCommand::new("fg").arg("%3").into(),
            SimpleCommand::new("bg").arg("%nothing").into(),
        ]))
        .unwrap();
    assert_eq!(status, 1);
    let stderr = console.stderr();
    assert!(stderr.contains("fg: 3: no such job"), "{stderr}");
    assert!(stderr.contains("bg: %nothing: invalid job specification"), "{stderr}");
}

#[test]
fn test_interrupt_reaches_foreground_job() {
    let (mut eng, _) = engine();
    let hub = eng.spawn(&Script::new(vec![SimpleCommand::new("sleep").arg("5").into()]));
    eng.poll().unwrap();
    assert_eq!(eng.job_table().foreground(), Some(1));

    eng.interrupt();
    assert_eq!(eng.wait(hub).unwrap(), 130);
}

#[test]
fn test_stopped_foreground_job_gives_the_console_back() {
    let (mut eng, console) = engine();
    let hub = eng.spawn(&Script::new(vec![sh("kill -STOP $$; echo resumed").into()]));
    while eng.jobs().first().map(|job| job.state) != Some(JobState::Stopped) {
        eng.turn(true).unwrap();
    }

    let trace: Vec<ConsoleEvent> = console
        .events()
        .into_iter()
        .filter(|event| !matches!(event, ConsoleEvent::Out(_) | ConsoleEvent::Err(_)))
        .collect();
    assert_eq!(trace.len(), 4, "unexpected trace: {trace:?}");
    assert_eq!(trace[0], ConsoleEvent::Pause);
    assert_eq!(trace[1], ConsoleEvent::RestoreTerminal);
    match &trace[2] {
        ConsoleEvent::Job(info) => {
            assert_eq!(info.id, 1);
            assert_eq!(info.state, JobState::Stopped);
            assert!(!info.foreground);
        }
        other => panic!("expected a job notice, got {other:?}"),
    }
    assert_eq!(trace[3], ConsoleEvent::Resume);
    assert_eq!(eng.job_table().foreground(), None);
    assert!(console.stdout().is_empty());

    eng.bg(1).unwrap();
    assert_eq!(eng.wait(hub).unwrap(), 0);
    eng.drain().unwrap();
    assert_eq!(console.stdout(), "resumed\n");
    assert!(eng.jobs().is_empty());
}
