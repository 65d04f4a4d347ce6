//! Builtin commands
//!
//! Most builtins are ordinary script commands registered with the
//! [`CommandRegistry`], so they pipe and redirect like anything else. The
//! job-control commands in [`jobs`] need the engine itself and run as
//! intrinsics of the sequential executor.

mod cat;
pub mod jobs;

use std::env;
use std::path::PathBuf;

use anyhow::Result;

use crate::command::coerce;
use crate::job::script::{Invocation, ScriptError, ScriptValue};
use crate::services::CommandRegistry;

/// Register every builtin script command
pub fn register(registry: &mut CommandRegistry) {
    registry.register("echo", builtin_echo);
    registry.register("true", |_| Ok(ScriptValue::Status(0)));
    registry.register("false", |_| Ok(ScriptValue::Status(1)));
    registry.register("pwd", builtin_pwd);
    registry.register("cd", builtin_cd);
    registry.register("cat", cat::builtin_cat);
    registry.register("escape", builtin_escape);
}

fn builtin_echo(inv: &mut Invocation<'_>) -> Result<ScriptValue> {
    let (newline, words) = match inv.args.first().map(String::as_str) {
        Some("-n") => (false, &inv.args[1..]),
        _ => (true, inv.args),
    };
    let mut output = words.join(" ");
    if newline {
        output.push('\n');
    }
    Ok(output.into())
}

fn builtin_pwd(_inv: &mut Invocation<'_>) -> Result<ScriptValue> {
    let cwd = env::current_dir()?;
    Ok(format!("{}\n", cwd.display()).into())
}

fn builtin_cd(inv: &mut Invocation<'_>) -> Result<ScriptValue> {
    let home = || {
        dirs::home_dir().ok_or_else(|| ScriptError::with_status("cd: could not determine home directory", 1))
    };
    let target = match inv.args.first().map(String::as_str) {
        None | Some("~") => home()?,
        Some(path) if path.starts_with("~/") => home()?.join(&path[2..]),
        Some(path) => PathBuf::from(path),
    };

    if !target.exists() {
        return Err(ScriptError::with_status(
            format!("cd: no such file or directory: {}", target.display()),
            1,
        )
        .into());
    }
    if !target.is_dir() {
        return Err(ScriptError::with_status(
            format!("cd: not a directory: {}", target.display()),
            1,
        )
        .into());
    }
    env::set_current_dir(&target)?;
    Ok(ScriptValue::Status(0))
}

/// `escape NAME=VALUE...`: persist variables in the enclosing store
fn builtin_escape(inv: &mut Invocation<'_>) -> Result<ScriptValue> {
    if inv.args.is_empty() {
        return Err(ScriptError::with_status("escape: usage: escape NAME=VALUE...", 2).into());
    }
    let mut pairs = Vec::with_capacity(inv.args.len());
    for arg in inv.args {
        match arg.split_once('=') {
            Some((name, value)) if !name.is_empty() => pairs.push((name.to_string(), coerce(value))),
            _ => {
                return Err(ScriptError::with_status(
                    format!("escape: not an assignment: {arg}"),
                    2,
                )
                .into())
            }
        }
    }
    for (name, value) in pairs {
        inv.escape(name, value);
    }
    Ok(ScriptValue::Status(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Assignments;
    use crate::job::script::{interpret, ScriptIo};
    use serde_json::{json, Value};

    fn call(name: &str, args: &[&str], input: &str) -> (i32, String, String, Vec<(String, Value)>) {
        let mut registry = CommandRegistry::new();
        register(&mut registry);
        let command = registry.find(name).expect("builtin registered").clone();

        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let env = Assignments::new();
        let mut io = ScriptIo::with_input(input.as_bytes().to_vec());
        let mut escapes = Vec::new();
        let result = {
            let mut inv = Invocation::new(name, &args, &env, &mut io, &mut escapes);
            command.invoke(&mut inv)
        };
        let status = interpret(result, &mut io);
        let (out, err) = io.into_parts();
        (
            status,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
            escapes,
        )
    }

    #[test]
    fn test_echo() {
        assert_eq!(call("echo", &["a", "b"], "").1, "a b\n");
        assert_eq!(call("echo", &["-n", "a"], "").1, "a");
        assert_eq!(call("echo", &[], "").1, "\n");
    }

    #[test]
    fn test_true_false() {
        assert_eq!(call("true", &[], "").0, 0);
        assert_eq!(call("false", &[], "").0, 1);
    }

    #[test]
    fn test_cd_errors() {
        let (status, _, err, _) = call("cd", &["/definitely/not/here"], "");
        assert_eq!(status, 1);
        assert!(err.starts_with("cd: no such file or directory"));

        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let (status, _, err, _) = call("cd", &[&path], "");
        assert_eq!(status, 1);
        assert!(err.starts_with("cd: not a directory"));
    }

    #[test]
    fn test_escape() {
        let (status, _, _, escapes) = call("escape", &["A=1", "B=text"], "");
        assert_eq!(status, 0);
        assert_eq!(
            escapes,
            vec![("A".to_string(), json!(1)), ("B".to_string(), json!("text"))]
        );

        let (status, _, err, escapes) = call("escape", &["nope"], "");
        assert_eq!(status, 2);
        assert!(err.contains("not an assignment"));
        assert!(escapes.is_empty());
    }
}
