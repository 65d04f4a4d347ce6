//! The `jsh` binary with inherited standard streams

use std::process::{Command, Output, Stdio};

use jsh::syntax::{ListItem, Node, RedirectOp, Script, SimpleCommand};

fn jsh(script: &Script) -> Output {
    let rc = tempfile::NamedTempFile::new().unwrap();
    let tree = serde_json::to_string(script).unwrap();
    Command::new(env!("CARGO_BIN_EXE_jsh"))
        .arg("--config")
        .arg(rc.path())
        .arg("-c")
        .arg(tree)
        .env_remove("JSH_INHERIT_TERMINAL")
        .env_remove("JSH_FAILED_STATUS")
        .env_remove("JSH_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .unwrap()
}

fn sh(script: &str) -> SimpleCommand {
    SimpleCommand::new("sh").args(["-c", script])
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[test]
fn test_streams_stay_apart() {
    let out = jsh(&Script::new(vec![
        SimpleCommand::new("echo").arg("to out").into(),
        sh("echo to err >&2").into(),
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(text(&out.stdout), "to out\n");
    assert_eq!(text(&out.stderr), "to err\n");
}

#[test]
fn test_stdout_copied_onto_stderr() {
    let out = jsh(&Script::new(vec![
        sh("echo moved").redirect(RedirectOp::DupOutput, None, "2").into(),
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert!(out.stdout.is_empty(), "{}", text(&out.stdout));
    assert_eq!(text(&out.stderr), "moved\n");
}

#[test]
fn test_stderr_copied_onto_stdout() {
    let out = jsh(&Script::new(vec![
        sh("echo joined >&2").redirect(RedirectOp::DupOutput, Some(2), "1").into(),
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(text(&out.stdout), "joined\n");
    assert!(out.stderr.is_empty(), "{}", text(&out.stderr));
}

#[test]
fn test_native_output_feeds_script_command() {
    let out = jsh(&Script::new(vec![ListItem::foreground(Node::pipeline(vec![
        sh("echo a; echo b"),
        SimpleCommand::new("cat"),
    ]))]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(text(&out.stdout), "a\nb\n");
    assert!(out.stderr.is_empty(), "{}", text(&out.stderr));
}

#[test]
fn test_exit_status_is_last_status() {
    let out = jsh(&Script::new(vec![sh("exit 4").into()]));
    assert_eq!(out.status.code(), Some(4));
}
