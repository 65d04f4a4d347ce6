//! Runtime services the engine consumes
//!
//! Environment and alias lookup, glob expansion, pattern matching and the
//! registry of in-process commands. [`ShellServices`] is the default
//! implementation used by the binary.

use std::collections::HashMap;
use std::path::Path;

use glob::{glob_with, MatchOptions, Pattern};

use crate::builtins;
use crate::job::script::{Finalizer, Invocation, ScriptCommand, ScriptValue};

pub trait RuntimeServices {
    fn env_var(&self, name: &str) -> Option<String>;

    fn alias(&self, name: &str) -> Option<String>;

    /// Expand a glob pattern. An empty result means no match.
    fn glob(&self, pattern: &str) -> Vec<String>;

    fn script_command(&self, name: &str) -> Option<ScriptCommand>;

    /// Shell pattern match used by `case`
    fn matches(&self, pattern: &str, text: &str) -> bool {
        match Pattern::new(pattern) {
            Ok(p) => p.matches(text),
            Err(_) => pattern == text,
        }
    }
}

/// Named in-process commands
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, ScriptCommand>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, command: ScriptCommand) {
        self.commands.insert(name.into(), command);
    }

    /// Register a closure as a command
    pub fn register<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(&mut Invocation<'_>) -> anyhow::Result<ScriptValue> + 'static,
    {
        self.add(name, ScriptCommand::new(body));
    }

    /// Attach a finalizer to an already registered command
    pub fn finalize(&mut self, name: &str, finalizer: Finalizer) -> bool {
        match self.commands.get_mut(name) {
            Some(command) => {
                command.finalizers.push(finalizer);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ScriptCommand> {
        self.commands.remove(name)
    }

    pub fn find(&self, name: &str) -> Option<&ScriptCommand> {
        self.commands.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct ShellServices {
    aliases: HashMap<String, String>,
    registry: CommandRegistry,
}

impl Default for ShellServices {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellServices {
    /// Services with the builtin script commands registered
    pub fn new() -> Self {
        let mut registry = CommandRegistry::new();
        builtins::register(&mut registry);
        Self::with_registry(registry)
    }

    pub fn with_registry(registry: CommandRegistry) -> Self {
        Self {
            aliases: HashMap::new(),
            registry,
        }
    }

    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.registry
    }

    pub fn set_alias(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.aliases.insert(name.into(), value.into());
    }

    pub fn remove_alias(&mut self, name: &str) -> Option<String> {
        self.aliases.remove(name)
    }
}

impl RuntimeServices for ShellServices {
    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn alias(&self, name: &str) -> Option<String> {
        self.aliases.get(name).cloned()
    }

    fn glob(&self, pattern: &str) -> Vec<String> {
        let cwd = std::env::current_dir().unwrap_or_default();
        expand_glob(pattern, &cwd)
    }

    fn script_command(&self, name: &str) -> Option<ScriptCommand> {
        self.registry.find(name).cloned()
    }
}

/// Expand `pattern` relative to `cwd`, sorted. Dotfiles only match when the
/// pattern asks for them.
pub fn expand_glob(pattern: &str, cwd: &Path) -> Vec<String> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: !pattern.starts_with('.'),
    };

    let absolute = if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        cwd.join(pattern).to_string_lossy().to_string()
    };

    let Ok(paths) = glob_with(&absolute, options) else {
        return Vec::new();
    };
    let mut matches: Vec<_> = paths.filter_map(Result::ok).collect();
    matches.sort();

    matches
        .into_iter()
        .map(|path| match path.strip_prefix(cwd) {
            Ok(relative) if !pattern.starts_with('/') => relative.to_string_lossy().to_string(),
            _ => path.to_string_lossy().to_string(),
        })
        .collect()
}
