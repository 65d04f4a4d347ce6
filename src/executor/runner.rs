//! Sequential executor
//!
//! Runs a list of steps one after the other. Tree nodes are translated only
//! when their turn comes, so assignments and escapes of earlier steps are
//! visible to later ones. A foreground step is waited for through its hub;
//! a background step is started and left alone.

use std::collections::VecDeque;

use serde_json::json;
use tracing::debug;

use super::{build, control, pipeline, Context};
use crate::builtins::jobs::run_intrinsic;
use crate::command::CommandSpec;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::hub::HubId;
use crate::syntax::{ListItem, Node};
use crate::vars::STATUS_VAR;

pub(crate) enum Step {
    /// A ready descriptor
    Command(CommandSpec),
    /// A node translated when reached
    Item(ListItem),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Advancing,
    Done,
}

/// What starting a step left behind
enum Next {
    Wait(HubId),
    Done(i32),
    Background(i32),
}

pub struct Runner {
    hub: HubId,
    steps: VecDeque<Step>,
    ctx: Context,
    phase: Phase,
    foreground: Option<i32>,
    background: Option<i32>,
}

impl Runner {
    pub(crate) fn spawn_items(
        eng: &mut Engine,
        items: Vec<ListItem>,
        ctx: Context,
        parent: Option<HubId>,
    ) -> HubId {
        Self::spawn(eng, items.into_iter().map(Step::Item).collect(), ctx, parent)
    }

    pub(crate) fn spawn_specs(
        eng: &mut Engine,
        specs: Vec<CommandSpec>,
        ctx: Context,
        parent: Option<HubId>,
    ) -> HubId {
        Self::spawn(eng, specs.into_iter().map(Step::Command).collect(), ctx, parent)
    }

    /// A runner for a single node
    pub(crate) fn spawn_node(
        eng: &mut Engine,
        node: Node,
        ctx: Context,
        parent: Option<HubId>,
    ) -> HubId {
        Self::spawn_items(eng, vec![ListItem::foreground(node)], ctx, parent)
    }

    fn spawn(
        eng: &mut Engine,
        steps: VecDeque<Step>,
        ctx: Context,
        parent: Option<HubId>,
    ) -> HubId {
        let hub = eng.create_hub("runner", parent);
        let runner = Runner {
            hub,
            steps,
            ctx,
            phase: Phase::Pending,
            foreground: None,
            background: None,
        };
        debug!(hub = hub.0, steps = runner.steps.len(), "runner created");
        eng.defer(move |eng| runner.advance(eng));
        hub
    }

    fn advance(mut self, eng: &mut Engine) {
        self.phase = Phase::Advancing;

        while let Some(step) = self.steps.pop_front() {
            let next = match step {
                Step::Command(spec) => self.command(eng, spec),
                Step::Item(item) => self.item(eng, item),
            };
            match next {
                Next::Done(status) => self.record(eng, status),
                Next::Background(status) => self.background = Some(status),
                Next::Wait(child) => {
                    self.phase = Phase::Running;
                    let hub = self.hub;
                    let subscribed = eng.subscribe(child, move |eng, status| {
                        self.record(eng, status);
                        self.advance(eng);
                    });
                    if let Err(err) = subscribed {
                        eng.report(&err);
                        let status = err.status(eng.config.failed_status);
                        eng.notify(hub, status);
                    }
                    return;
                }
            }
        }

        self.phase = Phase::Done;
        let status = self.foreground.or(self.background).unwrap_or(0);
        debug!(hub = self.hub.0, phase = ?self.phase, status, "runner finished");
        eng.notify(self.hub, status);
    }

    fn record(&mut self, eng: &mut Engine, status: i32) {
        self.foreground = Some(status);
        eng.vars.set(self.ctx.store, STATUS_VAR, json!(status));
    }

    fn item(&mut self, eng: &mut Engine, item: ListItem) -> Next {
        let background = item.background;
        match item.node {
            Node::Command(sc) => match build::command(eng, &self.ctx, &sc) {
                Ok(mut spec) => {
                    spec.background = background;
                    self.command(eng, spec)
                }
                Err(err) => self.malformed(eng, err),
            },
            Node::Pipeline(p) => match build::pipeline(eng, &self.ctx, &p.commands) {
                Ok(specs) => self.pipeline(eng, specs, background, p.negated),
                Err(err) => self.malformed(eng, err),
            },
            node if background => {
                control::spawn(eng, node, self.ctx.background(), None);
                Next::Background(0)
            }
            node => Next::Wait(control::spawn(eng, node, self.ctx.clone(), Some(self.hub))),
        }
    }

    fn command(&mut self, eng: &mut Engine, spec: CommandSpec) -> Next {
        if spec.is_assignment_only() {
            debug!(count = spec.assignments.len(), "persisting assignments");
            for (name, value) in spec.assignments {
                eng.vars.set(self.ctx.store, name, value);
            }
            return Next::Done(0);
        }
        if let Some(status) = run_intrinsic(eng, &spec, self.ctx.route) {
            return Next::Done(status);
        }
        let background = spec.background;
        self.pipeline(eng, vec![spec], background, false)
    }

    fn pipeline(
        &mut self,
        eng: &mut Engine,
        specs: Vec<CommandSpec>,
        background: bool,
        negated: bool,
    ) -> Next {
        if background {
            let ctx = self.ctx.background();
            let spawned = pipeline::spawn(eng, specs, &ctx, None, negated);
            let status = if spawned.launched {
                0
            } else {
                eng.config.failed_status
            };
            return Next::Background(status);
        }
        let spawned = pipeline::spawn(eng, specs, &self.ctx, Some(self.hub), negated);
        Next::Wait(spawned.hub)
    }

    /// A step that could not be translated: report it and move on
    fn malformed(&mut self, eng: &mut Engine, err: EngineError) -> Next {
        eng.report(&err);
        Next::Done(err.status(eng.config.failed_status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::services::ShellServices;
    use crate::syntax::{Script, SimpleCommand};
    use crate::terminal::MemoryConsole;

    fn engine() -> (Engine, MemoryConsole) {
        let console = MemoryConsole::new();
        let config = EngineConfig {
            inherit_terminal: false,
            ..EngineConfig::default()
        };
        (Engine::new(config, ShellServices::new(), console.clone()), console)
    }

    fn script(items: Vec<ListItem>) -> Script {
        Script::new(items)
    }

    #[test]
    fn test_status_of_last_foreground_step() {
        let (mut eng, _) = engine();
        let status = eng
            .run(&script(vec![
                SimpleCommand::new("true").into(),
                SimpleCommand::new("false").into(),
            ]))
            .unwrap();
        assert_eq!(status, 1);
    }

    #[test]
    fn test_trailing_background_step_keeps_previous_status() {
        let (mut eng, _) = engine();
        let status = eng
            .run(&script(vec![
                SimpleCommand::new("false").into(),
                ListItem::background(SimpleCommand::new("true")),
            ]))
            .unwrap();
        assert_eq!(status, 1);
        eng.drain().unwrap();
    }

    #[test]
    fn test_single_background_step_is_zero() {
        let (mut eng, _) = engine();
        let status = eng
            .run(&script(vec![ListItem::background(SimpleCommand::new("false"))]))
            .unwrap();
        assert_eq!(status, 0);
        eng.drain().unwrap();
    }

    #[test]
    fn test_empty_script() {
        let (mut eng, _) = engine();
        assert_eq!(eng.run(&Script::default()).unwrap(), 0);
    }

    #[test]
    fn test_assignment_persists_for_later_steps() {
        let (mut eng, console) = engine();
        let status = eng
            .run(&script(vec![
                SimpleCommand::assignment(vec!["GREETING=hello".into()]).into(),
                SimpleCommand::new("echo")
                    .arg(crate::syntax::Word::param("GREETING"))
                    .into(),
            ]))
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(console.stdout(), "hello\n");
        assert_eq!(eng.variable("GREETING"), Some(&json!("hello")));
    }

    #[test]
    fn test_status_variable() {
        let (mut eng, console) = engine();
        eng.run(&script(vec![
            SimpleCommand::new("false").into(),
            SimpleCommand::new("echo")
                .arg(crate::syntax::Word::param("?"))
                .into(),
        ]))
        .unwrap();
        assert_eq!(console.stdout(), "1\n");
    }

    #[test]
    fn test_malformed_step_continues() {
        let (mut eng, console) = engine();
        let status = eng
            .run(&script(vec![
                SimpleCommand::assignment(vec!["oops".into()]).into(),
                SimpleCommand::new("echo").arg("after").into(),
            ]))
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(console.stdout(), "after\n");
        assert!(console.stderr().contains("not an assignment"));

        let status = eng
            .run(&script(vec![SimpleCommand::assignment(vec!["oops".into()]).into()]))
            .unwrap();
        assert_eq!(status, 2);
    }

    #[test]
    fn test_failed_launch_continues() {
        let (mut eng, console) = engine();
        let status = eng
            .run(&script(vec![
                SimpleCommand::new("no-such-command-for-jsh").into(),
                SimpleCommand::new("echo").arg("next").into(),
            ]))
            .unwrap();
        assert_eq!(status, 0);
        assert!(console.stderr().contains("no-such-command-for-jsh: command not found"));
        assert_eq!(console.stdout(), "next\n");
    }

    #[test]
    fn test_ready_descriptors() {
        let (mut eng, console) = engine();
        let status = eng
            .run_commands(vec![
                CommandSpec::new("echo").arg("one"),
                CommandSpec::new("sh").args(["-c", "echo two; exit 5"]),
            ])
            .unwrap();
        assert_eq!(status, 5);
        assert_eq!(console.stdout(), "one\ntwo\n");
    }
}
