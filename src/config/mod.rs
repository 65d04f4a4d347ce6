//! Engine configuration from .jshrc
//!
//! Recognised keys:
//! - JSH_FAILED_STATUS (status of a job that could not be launched, default 127)
//! - JSH_IFS (field separators for `for` word splitting, default space/tab/newline)
//! - JSH_INHERIT_TERMINAL (native foreground jobs write straight to the tty)
//! - JSH_LOG (default log level)
//!
//! Environment variables with the same names override the file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DEFAULT_FAILED_STATUS;

pub const DEFAULT_IFS: &str = " \t\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Exit status reported by a job whose launch failed
    pub failed_status: i32,
    /// Field separators used when splitting `for` words
    pub ifs: String,
    /// When false, native foreground output is routed through the console
    pub inherit_terminal: bool,
    /// Hand the terminal's foreground group to foreground native jobs
    pub job_control: bool,
    pub log_level: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failed_status: DEFAULT_FAILED_STATUS,
            ifs: DEFAULT_IFS.to_string(),
            inherit_terminal: true,
            job_control: false,
            log_level: None,
        }
    }
}

impl EngineConfig {
    /// Load ~/.jshrc (if any) and apply environment overrides
    pub fn load() -> Self {
        Self::load_from(&Self::rc_path())
    }

    pub fn load_from(path: &Path) -> Self {
        Self::from_file(path)
            .unwrap_or_default()
            .with_overrides(|key| std::env::var(key).ok())
    }

    /// Get the path to .jshrc
    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".jshrc")
    }

    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = EngineConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = parse_assignment(line) {
                config.apply(&key, &unquote(&value));
            }
        }

        config
    }

    /// Apply overrides from a lookup such as the process environment
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in ["JSH_FAILED_STATUS", "JSH_IFS", "JSH_INHERIT_TERMINAL", "JSH_LOG"] {
            if let Some(value) = lookup(key) {
                self.apply(key, &value);
            }
        }
        self
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "JSH_FAILED_STATUS" => {
                if let Ok(status) = value.trim().parse::<i32>() {
                    self.failed_status = status;
                }
            }
            "JSH_IFS" => self.ifs = unescape(value),
            "JSH_INHERIT_TERMINAL" => {
                if let Some(flag) = parse_flag(value) {
                    self.inherit_terminal = flag;
                }
            }
            "JSH_LOG" => {
                let value = value.trim();
                if !value.is_empty() {
                    self.log_level = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return s[1..s.len() - 1].to_string();
    }
    s.to_string()
}

// JSH_IFS=" \t\n" is written with escapes in rc files
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_empty() {
        let config = EngineConfig::parse("");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.failed_status, 127);
        assert_eq!(config.ifs, " \t\n");
    }

    #[test]
    fn test_parse_values() {
        let content = r#"
# engine settings
JSH_FAILED_STATUS=126
export JSH_IFS=":"
JSH_INHERIT_TERMINAL='off'
JSH_LOG="debug"
"#;
        let config = EngineConfig::parse(content);
        assert_eq!(config.failed_status, 126);
        assert_eq!(config.ifs, ":");
        assert!(!config.inherit_terminal);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_parse_ignores_garbage() {
        let config = EngineConfig::parse("JSH_FAILED_STATUS=lots\nnot an assignment\n=1\n");
        assert_eq!(config.failed_status, 127);
    }

    #[test]
    fn test_ifs_escapes() {
        let config = EngineConfig::parse(r#"JSH_IFS=" \t""#);
        assert_eq!(config.ifs, " \t");
    }

    #[test]
    fn test_overrides_win_over_file() {
        let env: HashMap<&str, &str> = [("JSH_FAILED_STATUS", "42"), ("JSH_LOG", "trace")]
            .into_iter()
            .collect();
        let config = EngineConfig::parse("JSH_FAILED_STATUS=1\nJSH_LOG=info\n")
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.failed_status, 42);
        assert_eq!(config.log_level.as_deref(), Some("trace"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".jshrc");
        fs::write(&path, "JSH_INHERIT_TERMINAL=false\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert!(!config.inherit_terminal);
        assert!(EngineConfig::from_file(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
