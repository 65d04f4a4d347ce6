//! Control-flow composites
//!
//! Each composite owns a hub and reacts to the completion of its children:
//! the left side of `&&`/`||`, the condition of `if`, one loop iteration at
//! a time, the chosen `case` arm, the body of a subshell.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::debug;

use super::runner::Runner;
use super::{build, Context};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::hub::HubId;
use crate::scope::Frame;
use crate::syntax::{CaseClause, ForLoop, IfClause, ListItem, Logical, LogicalOp, Node};

/// Start a compound node under `parent`
pub(crate) fn spawn(eng: &mut Engine, node: Node, ctx: Context, parent: Option<HubId>) -> HubId {
    match node {
        Node::Logical(logical) => spawn_logical(eng, logical, ctx, parent),
        Node::If(clause) => spawn_if(eng, clause, ctx, parent),
        Node::For(for_loop) => spawn_for(eng, for_loop, ctx, parent),
        Node::Case(clause) => spawn_case(eng, clause, ctx, parent),
        Node::Subshell(body) => spawn_subshell(eng, body, ctx, parent),
        node @ (Node::Command(_) | Node::Pipeline(_)) => Runner::spawn_node(eng, node, ctx, parent),
    }
}

/// Subscribe `f` to `child`; if that is impossible, `owner` fails instead
fn on_done<F>(eng: &mut Engine, owner: HubId, child: HubId, f: F)
where
    F: FnOnce(&mut Engine, i32) + 'static,
{
    if let Err(err) = eng.subscribe(child, f) {
        fail(eng, owner, err);
    }
}

fn fail(eng: &mut Engine, hub: HubId, err: EngineError) {
    eng.report(&err);
    let status = err.status(eng.config.failed_status);
    eng.notify(hub, status);
}

fn spawn_logical(
    eng: &mut Engine,
    logical: Logical,
    ctx: Context,
    parent: Option<HubId>,
) -> HubId {
    let hub = eng.create_hub("logical", parent);
    let Logical { op, left, right } = logical;

    let left = Runner::spawn_node(eng, *left, ctx.clone(), Some(hub));
    on_done(eng, hub, left, move |eng, status| {
        let run_right = match op {
            LogicalOp::And => status == 0,
            LogicalOp::Or => status != 0,
        };
        debug!(hub = hub.0, ?op, status, run_right, "left side done");
        if run_right {
            Runner::spawn_node(eng, *right, ctx, Some(hub));
            eng.seal(hub);
        } else {
            eng.notify(hub, status);
        }
    });
    hub
}

fn spawn_if(eng: &mut Engine, clause: IfClause, ctx: Context, parent: Option<HubId>) -> HubId {
    let hub = eng.create_hub("if", parent);
    let IfClause {
        condition,
        then_branch,
        else_branch,
    } = clause;

    let condition = Runner::spawn_items(eng, condition, ctx.clone(), Some(hub));
    on_done(eng, hub, condition, move |eng, status| {
        let branch = if status == 0 { then_branch } else { else_branch };
        debug!(hub = hub.0, status, taken = branch.is_some(), "condition done");
        match branch {
            Some(items) => {
                Runner::spawn_items(eng, items, ctx, Some(hub));
                eng.seal(hub);
            }
            None => eng.notify(hub, 0),
        }
    });
    hub
}

/// Remaining iterations of a `for` loop
struct Iterations {
    hub: HubId,
    variable: String,
    values: VecDeque<Value>,
    body: Vec<ListItem>,
    ctx: Context,
    status: i32,
}

impl Iterations {
    fn next(mut self, eng: &mut Engine) {
        let Some(value) = self.values.pop_front() else {
            eng.notify(self.hub, self.status);
            return;
        };

        let mut ctx = self.ctx.clone();
        let mut frame = Frame::new();
        frame.insert(self.variable.clone(), value);
        ctx.scope.push(frame);

        let hub = self.hub;
        let body = Runner::spawn_items(eng, self.body.clone(), ctx, Some(hub));
        on_done(eng, hub, body, move |eng, status| {
            self.status = status;
            self.next(eng);
        });
    }
}

fn spawn_for(eng: &mut Engine, for_loop: ForLoop, ctx: Context, parent: Option<HubId>) -> HubId {
    let hub = eng.create_hub("for", parent);
    eng.defer(move |eng| {
        let ForLoop {
            variable,
            words,
            body,
        } = for_loop;
        let values = match build::loop_items(eng, &ctx, &words) {
            Ok(values) => values,
            Err(err) => return fail(eng, hub, err),
        };
        debug!(hub = hub.0, variable = %variable, count = values.len(), "loop starting");
        Iterations {
            hub,
            variable,
            values: values.into(),
            body,
            ctx,
            status: 0,
        }
        .next(eng);
    });
    hub
}

fn spawn_case(eng: &mut Engine, clause: CaseClause, ctx: Context, parent: Option<HubId>) -> HubId {
    let hub = eng.create_hub("case", parent);
    eng.defer(move |eng| match select_arm(eng, &ctx, clause) {
        Ok(Some(body)) => {
            Runner::spawn_items(eng, body, ctx, Some(hub));
            eng.seal(hub);
        }
        Ok(None) => eng.notify(hub, 0),
        Err(err) => fail(eng, hub, err),
    });
    hub
}

/// Body of the first arm with a matching pattern
fn select_arm(
    eng: &mut Engine,
    ctx: &Context,
    clause: CaseClause,
) -> crate::error::Result<Option<Vec<ListItem>>> {
    let subject = build::word_text(eng, ctx, &clause.subject)?;
    for arm in clause.arms {
        for pattern in &arm.patterns {
            let pattern = build::glob_pattern(eng, ctx, pattern)?;
            if eng.services.matches(&pattern, &subject) {
                debug!(subject = %subject, pattern = %pattern, "case arm selected");
                return Ok(Some(arm.body));
            }
        }
    }
    Ok(None)
}

fn spawn_subshell(
    eng: &mut Engine,
    body: Vec<ListItem>,
    ctx: Context,
    parent: Option<HubId>,
) -> HubId {
    let hub = eng.create_hub("subshell", parent);
    let store = eng.vars.fork(ctx.store);
    let inner = Context {
        scope: ctx.scope,
        store,
        route: ctx.route,
    };

    let child = Runner::spawn_items(eng, body, inner, Some(hub));
    on_done(eng, hub, child, move |eng, status| {
        eng.vars.release(store);
        eng.notify(hub, status);
    });
    hub
}
