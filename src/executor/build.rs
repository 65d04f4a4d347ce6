//! Translation of syntax nodes into command descriptors
//!
//! Words are evaluated here: parameters are resolved through the scope
//! stack, the variable store and the environment; `$(...)` parts run a
//! substitution on the spot; glob parts become glob arguments that are
//! expanded when the job launches.

use glob::Pattern;
use serde_json::Value;

use super::expander::substitute_items;
use super::Context;
use crate::command::{coerce, render, Arg, CommandSpec, GlobToken, Redirection};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::scope::Frame;
use crate::syntax::{SimpleCommand, Word, WordPart};

/// Build the descriptor for one simple command.
///
/// Assignment words are evaluated left to right in a frame of their own,
/// so later words (and the arguments) see earlier ones.
pub fn command(eng: &mut Engine, ctx: &Context, sc: &SimpleCommand) -> Result<CommandSpec> {
    let mut local = ctx.clone();
    local.scope.push(Frame::new());

    for word in &sc.assignments {
        let text = word_text(eng, &local, word)?;
        let (name, value) = split_assignment(&text)?;
        local.scope.set(name, coerce(value));
    }

    let Some(name_word) = &sc.name else {
        let inline = local.scope.pop().unwrap_or_default();
        return Ok(CommandSpec::assignment_only(inline));
    };

    let mut name = word_text(eng, &local, name_word)?;
    let mut args = Vec::new();
    if let Some(alias) = eng.services.alias(&name) {
        let mut words = alias.split_whitespace().map(str::to_string);
        if let Some(first) = words.next() {
            name = first;
            args.extend(words.map(Arg::Text));
        }
    }
    if name.is_empty() {
        return Err(EngineError::malformed("empty command name"));
    }

    for word in &sc.args {
        let arg = if word.has_glob() {
            Arg::Glob(GlobToken::new(glob_pattern(eng, &local, word)?))
        } else {
            Arg::Text(word_text(eng, &local, word)?)
        };
        args.push(arg);
    }

    let mut redirections = Vec::with_capacity(sc.redirects.len());
    for redirect in &sc.redirects {
        let target = word_text(eng, &local, &redirect.target)?;
        if target.is_empty() {
            return Err(EngineError::malformed(format!(
                "missing target for redirection {}",
                redirect.op.as_str()
            )));
        }
        let fd = redirect.fd.unwrap_or_else(|| redirect.op.default_fd());
        redirections.push(Redirection::from_target(redirect.op, fd, &target));
    }

    Ok(CommandSpec {
        name,
        args,
        redirections,
        assignments: local.scope.flatten(),
        background: false,
    })
}

pub fn pipeline(
    eng: &mut Engine,
    ctx: &Context,
    commands: &[SimpleCommand],
) -> Result<Vec<CommandSpec>> {
    commands.iter().map(|sc| command(eng, ctx, sc)).collect()
}

/// Value of a parameter: scope, then variable store, then environment.
/// Unset parameters are the empty string.
pub fn resolve(eng: &Engine, ctx: &Context, name: &str) -> Value {
    if let Some(value) = ctx.scope.lookup(name) {
        return value.clone();
    }
    if let Some(value) = eng.vars.get(ctx.store, name) {
        return value.clone();
    }
    Value::String(eng.services.env_var(name).unwrap_or_default())
}

/// Evaluate a word to plain text. Glob parts are kept raw.
pub fn word_text(eng: &mut Engine, ctx: &Context, word: &Word) -> Result<String> {
    let mut text = String::new();
    for part in &word.parts {
        match part {
            WordPart::Literal(s) | WordPart::Glob(s) => text.push_str(s),
            WordPart::Param(name) => text.push_str(&render(&resolve(eng, ctx, name))),
            WordPart::CommandSubst(items) => {
                let captured = substitute_items(eng, items, ctx)?;
                text.push_str(captured.value());
            }
        }
    }
    Ok(text)
}

/// Evaluate a word to a glob pattern: only glob parts keep their special
/// meaning, everything else matches literally.
pub fn glob_pattern(eng: &mut Engine, ctx: &Context, word: &Word) -> Result<String> {
    let mut pattern = String::new();
    for part in &word.parts {
        match part {
            WordPart::Glob(raw) => pattern.push_str(raw),
            WordPart::Literal(s) => pattern.push_str(&Pattern::escape(s)),
            WordPart::Param(name) => {
                pattern.push_str(&Pattern::escape(&render(&resolve(eng, ctx, name))))
            }
            WordPart::CommandSubst(items) => {
                let captured = substitute_items(eng, items, ctx)?;
                pattern.push_str(&Pattern::escape(captured.value()));
            }
        }
    }
    Ok(pattern)
}

/// Items a `for` loop iterates over. A word that is a single parameter
/// holding an array contributes its elements; glob words expand to their
/// matches (or themselves when nothing matches); text is split on IFS.
pub fn loop_items(eng: &mut Engine, ctx: &Context, words: &[Word]) -> Result<Vec<Value>> {
    let ifs = eng.config.ifs.clone();
    let mut items = Vec::new();

    for word in words {
        if let [WordPart::Param(name)] = word.parts.as_slice() {
            match resolve(eng, ctx, name) {
                Value::Array(values) => items.extend(values),
                Value::String(text) => items.extend(split_fields(&text, &ifs)),
                other => items.push(other),
            }
        } else if word.has_glob() {
            let pattern = glob_pattern(eng, ctx, word)?;
            let matches = eng.services.glob(&pattern);
            if matches.is_empty() {
                items.push(Value::String(pattern));
            } else {
                items.extend(matches.into_iter().map(Value::String));
            }
        } else {
            let text = word_text(eng, ctx, word)?;
            items.extend(split_fields(&text, &ifs));
        }
    }
    Ok(items)
}

fn split_fields(text: &str, ifs: &str) -> Vec<Value> {
    text.split(|c: char| ifs.contains(c))
        .filter(|field| !field.is_empty())
        .map(|field| Value::String(field.to_string()))
        .collect()
}

fn split_assignment(text: &str) -> Result<(&str, &str)> {
    let Some((name, value)) = text.split_once('=') else {
        return Err(EngineError::malformed(format!("not an assignment: {text}")));
    };
    if !is_name(name) {
        return Err(EngineError::malformed(format!(
            "invalid variable name: '{name}'"
        )));
    }
    Ok((name, value))
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
