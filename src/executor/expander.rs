//! Command substitution
//!
//! Runs a command or a pipeline with its output captured into private
//! buffers and spins the engine until it is done. The loop is re-entrant,
//! so a substitution may itself contain substitutions.

use tracing::debug;

use super::{build, pipeline, Context, Route};
use crate::command::CommandSpec;
use crate::engine::{Capture, Engine};
use crate::error::{EngineError, Result};
use crate::scope::ScopeStack;
use crate::syntax::{ListItem, Node};
use crate::vars::StoreId;

/// Output and status of a substitution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Captured {
    /// The substituted text: stdout without trailing newlines
    pub fn value(&self) -> &str {
        self.stdout.trim_end_matches('\n')
    }
}

impl Engine {
    /// Run one descriptor and capture its output
    pub fn substitute(&mut self, spec: CommandSpec) -> Result<Captured> {
        let store = self.vars.root();
        self.capture(vec![spec], store, false)
    }

    /// Run a whole pipeline and capture the last segment's output
    pub fn substitute_pipeline(&mut self, specs: Vec<CommandSpec>) -> Result<Captured> {
        let store = self.vars.root();
        self.capture(specs, store, false)
    }

    pub(crate) fn capture(
        &mut self,
        specs: Vec<CommandSpec>,
        store: StoreId,
        negated: bool,
    ) -> Result<Captured> {
        let key = self.captures.insert(Capture::default());
        let ctx = Context {
            scope: ScopeStack::new(),
            store,
            route: Route::Capture(key),
        };
        let spawned = pipeline::spawn(self, specs, &ctx, None, negated);
        self.retain(spawned.hub);
        debug!(hub = spawned.hub.0, capture = key, "substitution started");

        let status = self.wait(spawned.hub);
        let capture = self.captures.try_remove(key).unwrap_or_default();
        let status = status?;
        Ok(Captured {
            stdout: String::from_utf8_lossy(&capture.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&capture.stderr).into_owned(),
            status,
        })
    }
}

/// Evaluate the body of a `$(...)` word part
pub(crate) fn substitute_items(
    eng: &mut Engine,
    items: &[ListItem],
    ctx: &Context,
) -> Result<Captured> {
    let [item] = items else {
        return Err(EngineError::malformed(format!(
            "command substitution takes exactly one command, got {}",
            items.len()
        )));
    };
    match &item.node {
        Node::Command(command) => {
            let spec = build::command(eng, ctx, command)?;
            eng.capture(vec![spec], ctx.store, false)
        }
        Node::Pipeline(pipeline) => {
            let specs = build::pipeline(eng, ctx, &pipeline.commands)?;
            eng.capture(specs, ctx.store, pipeline.negated)
        }
        _ => Err(EngineError::malformed(
            "command substitution takes a command or a pipeline",
        )),
    }
}
