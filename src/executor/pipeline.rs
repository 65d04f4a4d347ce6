//! Pipeline executor
//!
//! Adjacent commands of the same kind share one job: native commands are
//! connected with OS pipes inside their job, script commands are chained in
//! process. Between segments the engine forwards output explicitly, and a
//! segment's input is closed when the segment before it terminates.
//!
//! The pipeline's hub waits for every segment, but its status is always the
//! last segment's.

use tracing::{debug, warn};

use super::Context;
use crate::command::CommandSpec;
use crate::engine::{Engine, JobSetup};
use crate::hub::HubId;
use crate::job::{Dup, JobKind, Mode};

/// A started pipeline
#[derive(Debug, Clone, Copy)]
pub struct Spawned {
    pub hub: HubId,
    /// Whether the last segment launched
    pub launched: bool,
}

/// Start `specs` as one pipeline under `parent`
pub(crate) fn spawn(
    eng: &mut Engine,
    specs: Vec<CommandSpec>,
    ctx: &Context,
    parent: Option<HubId>,
    negated: bool,
) -> Spawned {
    let hub = eng.create_hub("pipeline", parent);
    let specs: Vec<CommandSpec> = specs
        .into_iter()
        .filter(|spec| !spec.is_assignment_only())
        .collect();

    if specs.is_empty() {
        eng.defer(move |eng| eng.notify(hub, 0));
        return Spawned {
            hub,
            launched: true,
        };
    }

    let title = specs
        .iter()
        .map(CommandSpec::command_line)
        .collect::<Vec<_>>()
        .join(" | ");
    let segments = partition(eng, specs);
    let count = segments.len();
    let route = ctx.route;
    let sink = route.sink();
    let last_dup = route.dup(eng.config.inherit_terminal);

    let mut jobs = Vec::with_capacity(count);
    for (index, (kind, group)) in segments.into_iter().enumerate() {
        let last = index + 1 == count;
        let setup = JobSetup {
            parent: Some(hub),
            store: ctx.store,
            stdout: sink,
            stderr: sink,
            table: if last { route.table() } else { None },
            title: last.then(|| title.clone()),
        };
        jobs.push(eng.create_job(kind, &group, setup));
    }
    for pair in jobs.windows(2) {
        eng.connect(pair[0], pair[1]);
    }
    debug!(hub = hub.0, segments = count, ?route, negated, command = %title, "pipeline starting");

    // downstream first, so no output is forwarded to a job that is not running
    let mut launched = true;
    for (index, &job) in jobs.iter().enumerate().rev() {
        let last = index + 1 == count;
        let mut dup = if last {
            last_dup
        } else {
            Dup::STDOUT | (last_dup & Dup::STDERR)
        };
        if index > 0 {
            dup |= Dup::STDIN;
        }
        let mode = if last { route.mode() } else { Mode::Background };
        let started = eng.start_job(job, mode, dup);
        if last {
            launched = started;
        }
    }

    let last_job = jobs[count - 1];
    match eng.job_hub(last_job) {
        Some(last_hub) if negated => {
            let subscribed = eng.subscribe(last_hub, move |eng, status| {
                eng.notify(hub, invert(status));
            });
            if let Err(err) = subscribed {
                warn!(hub = hub.0, error = %err, "negated pipeline lost its last segment");
                eng.seal(hub);
            }
        }
        _ => eng.seal(hub),
    }

    Spawned { hub, launched }
}

/// `!` status: success becomes 1, any failure becomes 0
fn invert(status: i32) -> i32 {
    if status == 0 {
        1
    } else {
        0
    }
}

/// Group adjacent descriptors of the same job kind
fn partition(eng: &Engine, specs: Vec<CommandSpec>) -> Vec<(JobKind, Vec<CommandSpec>)> {
    let mut segments: Vec<(JobKind, Vec<CommandSpec>)> = Vec::new();
    for spec in specs {
        let kind = eng.kind_of(&spec.name);
        match segments.last_mut() {
            Some((last, group)) if *last == kind => group.push(spec),
            _ => segments.push((kind, vec![spec])),
        }
    }
    segments
}
