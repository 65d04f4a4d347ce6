//! In-process commands
//!
//! A script command is a registered closure that receives an
//! [`Invocation`] (arguments, environment, buffered I/O) and returns a
//! [`ScriptValue`]. Several script commands in one pipeline segment run as a
//! single job and are chained in memory.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::Value;
use thiserror::Error;

use crate::command::{Assignments, RedirectTarget};
use crate::syntax::RedirectOp;

use super::{Dup, Launch};

type Body = Rc<dyn Fn(&mut Invocation<'_>) -> anyhow::Result<ScriptValue>>;

/// What a script command hands back
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// Exit status, nothing written
    Status(i32),
    /// Written to stdout, status 0
    Text(String),
    /// Serialized to stdout; status from an embedded `status` field
    Structured(Value),
    Unit,
}

impl From<i32> for ScriptValue {
    fn from(status: i32) -> Self {
        ScriptValue::Status(status)
    }
}

impl From<String> for ScriptValue {
    fn from(text: String) -> Self {
        ScriptValue::Text(text)
    }
}

impl From<&str> for ScriptValue {
    fn from(text: &str) -> Self {
        ScriptValue::Text(text.to_string())
    }
}

impl From<Value> for ScriptValue {
    fn from(value: Value) -> Self {
        ScriptValue::Structured(value)
    }
}

impl From<()> for ScriptValue {
    fn from(_: ()) -> Self {
        ScriptValue::Unit
    }
}

/// Error a script command can return to pick its exit status
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ScriptError {
    message: String,
    status: Option<i32>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: i32) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn status(&self) -> Option<i32> {
        self.status
    }
}

/// Buffered standard streams of one invocation
#[derive(Debug, Default)]
pub struct ScriptIo {
    stdin: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ScriptIo {
    pub fn with_input(stdin: Vec<u8>) -> Self {
        Self {
            stdin,
            ..Self::default()
        }
    }

    pub fn stdin(&self) -> &[u8] {
        &self.stdin
    }

    pub fn stdin_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdin)
    }

    pub fn write(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    pub fn write_err(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }

    pub fn print(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    pub fn eprint(&mut self, text: &str) {
        self.write_err(text.as_bytes());
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout, self.stderr)
    }
}

/// The record a script command is called with
pub struct Invocation<'a> {
    pub name: &'a str,
    pub args: &'a [String],
    /// Process environment with the command's overrides applied
    pub env: &'a Assignments,
    pub io: &'a mut ScriptIo,
    escapes: &'a mut Vec<(String, Value)>,
}

impl<'a> Invocation<'a> {
    pub fn new(
        name: &'a str,
        args: &'a [String],
        env: &'a Assignments,
        io: &'a mut ScriptIo,
        escapes: &'a mut Vec<(String, Value)>,
    ) -> Self {
        Self {
            name,
            args,
            env,
            io,
            escapes,
        }
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.env.get(name)
    }

    /// Persist a variable in the store enclosing the current one. This is
    /// the only way a command run inside a subshell changes its parent.
    pub fn escape(&mut self, name: impl Into<String>, value: Value) {
        self.escapes.push((name.into(), value));
    }
}

/// Cleanup hook run after the job holding the command terminated
#[derive(Clone)]
pub struct Finalizer(Rc<dyn Fn(&mut Invocation<'_>)>);

impl Finalizer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) + 'static,
    {
        Self(Rc::new(f))
    }

    pub fn call(&self, invocation: &mut Invocation<'_>) {
        (self.0)(invocation)
    }
}

#[derive(Clone)]
pub struct ScriptCommand {
    body: Body,
    pub finalizers: Vec<Finalizer>,
}

impl ScriptCommand {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) -> anyhow::Result<ScriptValue> + 'static,
    {
        Self {
            body: Rc::new(body),
            finalizers: Vec::new(),
        }
    }

    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizers.push(finalizer);
        self
    }

    pub fn invoke(&self, invocation: &mut Invocation<'_>) -> anyhow::Result<ScriptValue> {
        (self.body)(invocation)
    }
}

impl fmt::Debug for ScriptCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptCommand")
            .field("finalizers", &self.finalizers.len())
            .finish()
    }
}

/// Finalizers collected from a finished job, with the invocation they get
pub struct PendingFinalizers {
    pub finalizers: Vec<Finalizer>,
    pub name: String,
    pub args: Vec<String>,
    pub env: Assignments,
}

impl PendingFinalizers {
    /// Run every finalizer in registration order; returns what they wrote
    /// and the variables they escaped.
    pub fn run(&self) -> (ScriptIo, Vec<(String, Value)>) {
        let mut io = ScriptIo::default();
        let mut escapes = Vec::new();
        for finalizer in &self.finalizers {
            let mut invocation =
                Invocation::new(&self.name, &self.args, &self.env, &mut io, &mut escapes);
            finalizer.call(&mut invocation);
        }
        (io, escapes)
    }
}

/// Result of running a script job to completion
pub struct ScriptOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: i32,
    pub escapes: Vec<(String, Value)>,
    pub finalizers: Option<PendingFinalizers>,
}

pub(crate) struct ScriptJob {
    launches: Vec<Launch>,
    input: Vec<u8>,
    input_closed: bool,
    started: bool,
    queued: bool,
}

impl ScriptJob {
    pub(crate) fn new(launches: Vec<Launch>) -> Self {
        Self {
            launches,
            input: Vec::new(),
            input_closed: false,
            started: false,
            queued: false,
        }
    }

    /// Returns true when the job can run right away. A job fed by an
    /// upstream segment waits until its input is closed.
    pub(crate) fn start(&mut self, dup: Dup) -> bool {
        self.started = true;
        if !dup.contains(Dup::STDIN) {
            self.input_closed = true;
        }
        self.take_ready()
    }

    pub(crate) fn write(&mut self, data: &[u8]) {
        if !self.input_closed {
            self.input.extend_from_slice(data);
        }
    }

    /// Returns true when closing the input made the job runnable
    pub(crate) fn close(&mut self) -> bool {
        self.input_closed = true;
        self.take_ready()
    }

    fn take_ready(&mut self) -> bool {
        if self.started && self.input_closed && !self.queued {
            self.queued = true;
            true
        } else {
            false
        }
    }

    /// Run every command of the job, chaining stdout into the next stdin
    pub(crate) fn run(&mut self, failed_status: i32) -> ScriptOutcome {
        let launches = std::mem::take(&mut self.launches);
        let mut input = std::mem::take(&mut self.input);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut escapes = Vec::new();
        let mut status = 0;
        let mut finalizers = Vec::new();
        let mut last_call = None;

        for (index, launch) in launches.iter().enumerate() {
            let last = index + 1 == launches.len();
            let mut routes = match Routes::plan(launch) {
                Ok(routes) => routes,
                Err(message) => {
                    stderr.extend_from_slice(format!("{}: {}\n", launch.name, message).as_bytes());
                    status = 1;
                    input.clear();
                    continue;
                }
            };

            let stdin = match routes.input.take() {
                Some(data) => data,
                None => std::mem::take(&mut input),
            };
            let mut io = ScriptIo::with_input(stdin);
            let env = launch.script_env();

            status = match &launch.script {
                Some(command) => {
                    let mut invocation =
                        Invocation::new(&launch.name, launch.args(), &env, &mut io, &mut escapes);
                    let result = command.invoke(&mut invocation);
                    finalizers.extend(command.finalizers.iter().cloned());
                    interpret(result, &mut io)
                }
                None => {
                    io.eprint(&format!("{}: command not found\n", launch.name));
                    failed_status
                }
            };

            let (out, err) = io.into_parts();
            let (out, err) = match routes.deliver(out, err) {
                Ok(routed) => routed,
                Err(message) => {
                    status = 1;
                    (Vec::new(), format!("{}: {}\n", launch.name, message).into_bytes())
                }
            };
            stderr.extend(err);
            if last {
                stdout = out;
            } else {
                input = out;
            }
            last_call = Some((launch.name.clone(), launch.args().to_vec(), env));
        }

        let finalizers = match last_call {
            Some((name, args, env)) if !finalizers.is_empty() => Some(PendingFinalizers {
                finalizers,
                name,
                args,
                env,
            }),
            _ => None,
        };

        ScriptOutcome {
            stdout,
            stderr,
            status,
            escapes,
            finalizers,
        }
    }
}

/// Turn a command's return value into an exit status
pub fn interpret(result: anyhow::Result<ScriptValue>, io: &mut ScriptIo) -> i32 {
    match result {
        Ok(ScriptValue::Status(status)) => status,
        Ok(ScriptValue::Text(text)) => {
            io.print(&text);
            0
        }
        Ok(ScriptValue::Structured(value)) => {
            io.print(&value.to_string());
            io.print("\n");
            value
                .get("status")
                .and_then(Value::as_i64)
                .map(|s| s as i32)
                .unwrap_or(0)
        }
        Ok(ScriptValue::Unit) => 0,
        Err(err) => {
            io.eprint(&format!("{err}\n"));
            err.downcast_ref::<ScriptError>()
                .and_then(ScriptError::status)
                .unwrap_or(0)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Dest {
    Out,
    Err,
    File { path: PathBuf, append: bool },
    Closed,
}

/// Where a script command's buffered streams end up after redirections
struct Routes {
    input: Option<Vec<u8>>,
    stdout: Dest,
    stderr: Dest,
}

impl Routes {
    fn plan(launch: &Launch) -> Result<Self, String> {
        let mut routes = Routes {
            input: None,
            stdout: Dest::Out,
            stderr: Dest::Err,
        };

        for redirection in &launch.redirections {
            match (redirection.op, &redirection.target) {
                (RedirectOp::Input, RedirectTarget::File(path)) => {
                    let data = std::fs::read(path)
                        .map_err(|e| format!("{}: {}", path.display(), e))?;
                    routes.input = Some(data);
                }
                (RedirectOp::Output | RedirectOp::Append, RedirectTarget::File(path)) => {
                    let dest = Dest::File {
                        path: path.clone(),
                        append: redirection.op == RedirectOp::Append,
                    };
                    routes.set(redirection.fd, dest);
                }
                (RedirectOp::DupOutput, RedirectTarget::Fd(source)) => {
                    let dest = match source {
                        1 => routes.stdout.clone(),
                        2 => routes.stderr.clone(),
                        other => return Err(format!("{other}: bad file descriptor")),
                    };
                    routes.set(redirection.fd, dest);
                }
                (_, RedirectTarget::Close) => routes.set(redirection.fd, Dest::Closed),
                _ => {}
            }
        }

        Ok(routes)
    }

    fn set(&mut self, fd: i32, dest: Dest) {
        match fd {
            1 => self.stdout = dest,
            2 => self.stderr = dest,
            _ => {}
        }
    }

    /// Write file-bound output and return what stays routed as (stdout, stderr)
    fn deliver(&self, out: Vec<u8>, err: Vec<u8>) -> Result<(Vec<u8>, Vec<u8>), String> {
        let mut routed_out = Vec::new();
        let mut routed_err = Vec::new();
        let mut files: HashMap<PathBuf, File> = HashMap::new();

        for (dest, data) in [(&self.stdout, out), (&self.stderr, err)] {
            match dest {
                Dest::Out => routed_out.extend(data),
                Dest::Err => routed_err.extend(data),
                Dest::Closed => {}
                Dest::File { path, append } => {
                    if !files.contains_key(path) {
                        let file = OpenOptions::new()
                            .write(true)
                            .create(true)
                            .append(*append)
                            .truncate(!*append)
                            .open(path)
                            .map_err(|e| format!("{}: {}", path.display(), e))?;
                        files.insert(path.clone(), file);
                    }
                    if let Some(file) = files.get_mut(path) {
                        file.write_all(&data)
                            .map_err(|e| format!("{}: {}", path.display(), e))?;
                    }
                }
            }
        }

        Ok((routed_out, routed_err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandSpec, Redirection};
    use crate::job::JobKind;
    use crate::services::{CommandRegistry, ShellServices};
    use serde_json::json;
    use std::cell::RefCell;

    fn services() -> ShellServices {
        let mut registry = CommandRegistry::new();
        registry.register("upper", |inv| Ok(inv.io.stdin_text().to_uppercase().into()));
        registry.register("say", |inv| Ok(format!("{}\n", inv.args.join(" ")).into()));
        registry.register("code", |inv| {
            Ok(ScriptValue::Status(inv.args[0].parse().unwrap_or(0)))
        });
        registry.register("report", |_| Ok(json!({"status": 3, "ok": false}).into()));
        registry.register("boom", |_| Err(anyhow::anyhow!("it broke")));
        registry.register("fatal", |_| Err(ScriptError::with_status("fatal", 9).into()));
        registry.register("lift", |inv| {
            inv.escape("LIFTED", json!("yes"));
            Ok(().into())
        });
        ShellServices::with_registry(registry)
    }

    fn job(specs: &[CommandSpec]) -> ScriptJob {
        let services = services();
        ScriptJob::new(
            specs
                .iter()
                .map(|s| Launch::resolve(s, JobKind::Script, &services))
                .collect(),
        )
    }

    #[test]
    fn test_interpret_values() {
        let mut io = ScriptIo::default();
        assert_eq!(interpret(Ok(ScriptValue::Status(4)), &mut io), 4);
        assert_eq!(interpret(Ok("text".into()), &mut io), 0);
        assert_eq!(interpret(Ok(json!({"status": 2}).into()), &mut io), 2);
        assert_eq!(interpret(Ok(json!([1]).into()), &mut io), 0);
        let (out, _) = io.into_parts();
        assert_eq!(String::from_utf8(out).unwrap(), "text{\"status\":2}\n[1]\n");
    }

    #[test]
    fn test_interpret_errors() {
        let mut io = ScriptIo::default();
        assert_eq!(interpret(Err(anyhow::anyhow!("plain")), &mut io), 0);
        assert_eq!(
            interpret(Err(ScriptError::with_status("bad", 5).into()), &mut io),
            5
        );
        let (_, err) = io.into_parts();
        assert_eq!(String::from_utf8(err).unwrap(), "plain\nbad\n");
    }

    #[test]
    fn test_runs_only_after_start_and_close() {
        let mut job = job(&[CommandSpec::new("upper")]);
        job.write(b"early ");
        assert!(!job.start(Dup::STDIN | Dup::STDOUT));
        job.write(b"words");
        assert!(job.close());
        // a second close does not queue it twice
        assert!(!job.close());

        let outcome = job.run(127);
        assert_eq!(outcome.stdout, b"EARLY WORDS");
        assert_eq!(outcome.status, 0);
    }

    #[test]
    fn test_unchained_job_is_ready_at_start() {
        let mut job = job(&[CommandSpec::new("say").arg("hi")]);
        assert!(job.start(Dup::STDOUT));
        job.write(b"ignored");
        let outcome = job.run(127);
        assert_eq!(outcome.stdout, b"hi\n");
    }

    #[test]
    fn test_chained_in_process() {
        let mut job = job(&[
            CommandSpec::new("say").args(["a", "b"]),
            CommandSpec::new("upper"),
        ]);
        job.start(Dup::STDOUT);
        let outcome = job.run(127);
        assert_eq!(outcome.stdout, b"A B\n");
    }

    #[test]
    fn test_status_of_last_command() {
        let mut job = job(&[CommandSpec::new("code").arg("4"), CommandSpec::new("report")]);
        job.start(Dup::empty());
        let outcome = job.run(127);
        assert_eq!(outcome.status, 3);
        assert_eq!(outcome.stdout, b"{\"ok\":false,\"status\":3}\n");
    }

    #[test]
    fn test_errors_go_to_stderr() {
        let mut job = job(&[CommandSpec::new("boom")]);
        job.start(Dup::empty());
        let outcome = job.run(127);
        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.stderr, b"it broke\n");

        let mut job = self::job(&[CommandSpec::new("fatal")]);
        job.start(Dup::empty());
        assert_eq!(job.run(127).status, 9);
    }

    #[test]
    fn test_missing_command_fails() {
        let mut job = job(&[CommandSpec::new("not-registered")]);
        job.start(Dup::empty());
        let outcome = job.run(126);
        assert_eq!(outcome.status, 126);
        assert_eq!(outcome.stderr, b"not-registered: command not found\n");
    }

    #[test]
    fn test_escapes_collected() {
        let mut job = job(&[CommandSpec::new("lift")]);
        job.start(Dup::empty());
        let outcome = job.run(127);
        assert_eq!(outcome.escapes, vec![("LIFTED".to_string(), json!("yes"))]);
    }

    #[test]
    fn test_finalizers_in_registration_order() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut registry = CommandRegistry::new();
        let (a, b) = (Rc::clone(&calls), Rc::clone(&calls));
        registry.add(
            "tidy",
            ScriptCommand::new(|_| Ok(().into()))
                .with_finalizer(Finalizer::new(move |inv| a.borrow_mut().push(format!("first {}", inv.name))))
                .with_finalizer(Finalizer::new(move |_| b.borrow_mut().push("second".to_string()))),
        );
        let services = ShellServices::with_registry(registry);
        let launch = Launch::resolve(&CommandSpec::new("tidy"), JobKind::Script, &services);
        let mut job = ScriptJob::new(vec![launch]);
        job.start(Dup::empty());

        let pending = job.run(127).finalizers.expect("finalizers");
        assert!(calls.borrow().is_empty());
        pending.run();
        assert_eq!(*calls.borrow(), vec!["first tidy", "second"]);
    }

    #[test]
    fn test_output_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let spec = CommandSpec::new("say")
            .arg("to file")
            .redirect(Redirection::file(RedirectOp::Output, 1, &out));
        let mut job = job(&[spec]);
        job.start(Dup::STDOUT);
        let outcome = job.run(127);
        assert!(outcome.stdout.is_empty());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "to file\n");
    }

    #[test]
    fn test_stderr_joins_stdout() {
        let spec = CommandSpec::new("boom")
            .redirect(Redirection::from_target(RedirectOp::DupOutput, 2, "1"));
        let mut job = job(&[spec]);
        job.start(Dup::STDOUT);
        let outcome = job.run(127);
        assert_eq!(outcome.stdout, b"it broke\n");
        assert!(outcome.stderr.is_empty());
    }

    #[test]
    fn test_input_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "from file").unwrap();
        let spec = CommandSpec::new("upper").redirect(Redirection::file(RedirectOp::Input, 0, &input));
        let mut job = job(&[spec]);
        job.start(Dup::STDOUT);
        assert_eq!(job.run(127).stdout, b"FROM FILE");

        let output = dir.path().join("out.txt");
        let spec = CommandSpec::new("upper")
            .redirect(Redirection::file(RedirectOp::Input, 0, &input))
            .redirect(Redirection::file(RedirectOp::Output, 1, &output));
        let mut job = self::job(&[spec]);
        job.start(Dup::STDOUT);
        let outcome = job.run(127);
        assert_eq!(outcome.status, 0);
        assert!(outcome.stdout.is_empty());
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "FROM FILE");

        let spec = CommandSpec::new("upper")
            .redirect(Redirection::file(RedirectOp::Input, 0, dir.path().join("missing")));
        let mut job = self::job(&[spec]);
        job.start(Dup::STDOUT);
        let outcome = job.run(127);
        assert_eq!(outcome.status, 1);
        assert!(String::from_utf8_lossy(&outcome.stderr).starts_with("upper: "));
    }
}
