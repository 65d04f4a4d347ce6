//! Command descriptors: everything needed to launch one invocable unit
//!
//! A [`CommandSpec`] is built by the translator, owned by the executor that
//! runs it and never mutated after it has been handed to a job.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::services::RuntimeServices;
use crate::syntax::RedirectOp;

/// Ordered variable overrides (a flattened scope)
pub type Assignments = BTreeMap<String, Value>;

/// Coerce assignment text into a value.
///
/// Numbers become numbers, text opening with `{` or `[` that parses as JSON
/// becomes structured JSON, anything else stays a string.
pub fn coerce(text: &str) -> Value {
    if text.is_empty() || text.trim() != text {
        return Value::String(text.to_string());
    }
    let first = text.as_bytes()[0];
    let candidate = first == b'{' || first == b'[' || first == b'-' || first.is_ascii_digit();
    if candidate {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Number(n)) => return integral(&n).unwrap_or(Value::Number(n)),
            Ok(value @ (Value::Object(_) | Value::Array(_))) => return value,
            _ => {}
        }
    }
    Value::String(text.to_string())
}

// `1e3` is a whole number and should print as one
fn integral(n: &serde_json::Number) -> Option<Value> {
    let f = n.as_f64().filter(|_| n.is_f64())?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

/// Text form of a value as a process sees it in its environment
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A glob pattern whose expansion is deferred to the runtime services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobToken {
    pub pattern: String,
}

impl GlobToken {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Text(String),
    Glob(GlobToken),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    File(PathBuf),
    Fd(i32),
    /// `>&-`
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub op: RedirectOp,
    pub fd: i32,
    pub target: RedirectTarget,
}

impl Redirection {
    pub fn file(op: RedirectOp, fd: i32, path: impl Into<PathBuf>) -> Self {
        Self {
            op,
            fd,
            target: RedirectTarget::File(path.into()),
        }
    }

    /// Interpret the evaluated target word of a redirect
    pub fn from_target(op: RedirectOp, fd: i32, target: &str) -> Self {
        let target = match op {
            RedirectOp::DupOutput | RedirectOp::DupInput => match target {
                "-" => RedirectTarget::Close,
                _ => match target.parse::<i32>() {
                    Ok(n) => RedirectTarget::Fd(n),
                    Err(_) => RedirectTarget::File(PathBuf::from(target)),
                },
            },
            _ => RedirectTarget::File(PathBuf::from(target)),
        };
        Self { op, fd, target }
    }

    fn display(&self) -> String {
        let target = match &self.target {
            RedirectTarget::File(path) => path.display().to_string(),
            RedirectTarget::Fd(n) => n.to_string(),
            RedirectTarget::Close => "-".to_string(),
        };
        if self.fd == self.op.default_fd() {
            format!("{}{}", self.op.as_str(), target)
        } else {
            format!("{}{}{}", self.fd, self.op.as_str(), target)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    /// Empty for assignment-only commands
    pub name: String,
    pub args: Vec<Arg>,
    pub redirections: Vec<Redirection>,
    /// Environment overrides. For assignment-only commands these are the
    /// variables to persist instead.
    pub assignments: Assignments,
    pub background: bool,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn assignment_only(assignments: Assignments) -> Self {
        Self {
            assignments,
            ..Self::default()
        }
    }

    pub fn arg(mut self, text: impl Into<String>) -> Self {
        self.args.push(Arg::Text(text.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|a| Arg::Text(a.into())));
        self
    }

    pub fn glob(mut self, pattern: impl Into<String>) -> Self {
        self.args.push(Arg::Glob(GlobToken::new(pattern)));
        self
    }

    pub fn redirect(mut self, redirection: Redirection) -> Self {
        self.redirections.push(redirection);
        self
    }

    pub fn assign(mut self, name: impl Into<String>, value: Value) -> Self {
        self.assignments.insert(name.into(), value);
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn is_assignment_only(&self) -> bool {
        self.name.is_empty()
    }

    /// Argument vector with globs expanded; a pattern without matches is
    /// passed through literally.
    pub fn argv(&self, services: &dyn RuntimeServices) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.name.clone());
        for arg in &self.args {
            match arg {
                Arg::Text(text) => argv.push(text.clone()),
                Arg::Glob(token) => {
                    let matches = services.glob(&token.pattern);
                    if matches.is_empty() {
                        argv.push(token.pattern.clone());
                    } else {
                        argv.extend(matches);
                    }
                }
            }
        }
        argv
    }

    /// Human readable command line for the job table
    pub fn command_line(&self) -> String {
        let mut parts = Vec::new();
        if self.is_assignment_only() {
            for (name, value) in &self.assignments {
                parts.push(format!("{name}={}", render(value)));
            }
        } else {
            parts.push(self.name.clone());
        }
        for arg in &self.args {
            match arg {
                Arg::Text(text) => parts.push(text.clone()),
                Arg::Glob(token) => parts.push(token.pattern.clone()),
            }
        }
        for redirection in &self.redirections {
            parts.push(redirection.display());
        }
        let mut line = parts.join(" ");
        if self.background {
            line.push_str(" &");
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ShellServices;
    use serde_json::json;

    #[test]
    fn test_coerce_numbers() {
        assert_eq!(coerce("42"), json!(42));
        assert_eq!(coerce("-1.5"), json!(-1.5));
        assert_eq!(coerce("1e3"), json!(1000));
        assert_eq!(render(&coerce("1e3")), "1000");
        assert_eq!(render(&coerce("-2.0")), "-2");
        assert_eq!(render(&coerce("2.5e-1")), "0.25");
        // leading zeros are not JSON numbers
        assert_eq!(coerce("007"), json!("007"));
        assert_eq!(coerce(" 1"), json!(" 1"));
    }

    #[test]
    fn test_coerce_structured() {
        assert_eq!(coerce("[1,2]"), json!([1, 2]));
        assert_eq!(coerce(r#"{"a":"b"}"#), json!({"a": "b"}));
        assert_eq!(coerce("[not json"), json!("[not json"));
        assert_eq!(coerce("true"), json!("true"));
        assert_eq!(coerce(""), json!(""));
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&json!("plain")), "plain");
        assert_eq!(render(&json!(3)), "3");
        assert_eq!(render(&json!(["a", 1])), r#"["a",1]"#);
        assert_eq!(render(&Value::Null), "");
    }

    #[test]
    fn test_redirection_targets() {
        let r = Redirection::from_target(RedirectOp::DupOutput, 2, "1");
        assert_eq!(r.target, RedirectTarget::Fd(1));
        let r = Redirection::from_target(RedirectOp::DupOutput, 1, "-");
        assert_eq!(r.target, RedirectTarget::Close);
        let r = Redirection::from_target(RedirectOp::Output, 1, "3");
        assert_eq!(r.target, RedirectTarget::File(PathBuf::from("3")));
    }

    #[test]
    fn test_command_line() {
        let spec = CommandSpec::new("grep")
            .arg("-n")
            .glob("*.rs")
            .redirect(Redirection::file(RedirectOp::Output, 1, "out.txt"))
            .redirect(Redirection::from_target(RedirectOp::DupOutput, 2, "1"))
            .background();
        assert_eq!(spec.command_line(), "grep -n *.rs >out.txt 2>&1 &");

        let assign = CommandSpec::assignment_only(
            [("A".to_string(), json!(1))].into_iter().collect(),
        );
        assert!(assign.is_assignment_only());
        assert_eq!(assign.command_line(), "A=1");
    }

    #[test]
    fn test_argv_passes_unmatched_glob_through() {
        let services = ShellServices::new();
        let spec = CommandSpec::new("ls").glob("/definitely/not/here/*.nothing");
        assert_eq!(
            spec.argv(&services),
            vec!["ls".to_string(), "/definitely/not/here/*.nothing".to_string()]
        );
    }

    #[test]
    fn test_argv_expands_glob() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        let pattern = format!("{}/*.txt", dir.path().display());
        let spec = CommandSpec::new("cat").glob(pattern);
        let argv = spec.argv(&ShellServices::new());
        assert_eq!(argv.len(), 3);
        assert!(argv[1].ends_with("a.txt"));
        assert!(argv[2].ends_with("b.txt"));
    }
}
