//! Composite executors
//!
//! Each executor owns a hub in the engine and drives its children through
//! completion callbacks:
//!
//! - [`runner`]: a list of steps run one after the other
//! - [`pipeline`]: segments chained stdout to stdin
//! - [`expander`]: command substitution into private buffers
//! - [`control`]: `&&`/`||`, `if`, `for`, `case` and subshells
//!
//! [`build`] turns syntax nodes into command descriptors, evaluating words
//! on the way.

pub mod build;
pub mod control;
pub mod expander;
pub mod pipeline;
pub mod runner;

use crate::job::{Dup, Mode, Sink};
use crate::scope::ScopeStack;
use crate::vars::StoreId;

pub use expander::Captured;

/// Where the output of the jobs started under a context goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Foreground: the console's `out`/`err`, or the inherited terminal
    Terminal,
    /// Background: the console's `log`/`error`
    Console,
    /// A substitution's private buffers
    Capture(usize),
}

impl Route {
    pub(crate) fn mode(self) -> Mode {
        match self {
            Route::Terminal => Mode::Foreground,
            Route::Console | Route::Capture(_) => Mode::Background,
        }
    }

    pub(crate) fn sink(self) -> Sink {
        match self {
            Route::Terminal => Sink::Terminal,
            Route::Console => Sink::Console,
            Route::Capture(key) => Sink::Capture(key),
        }
    }

    /// Streams of the final segment read by the engine instead of inherited
    pub(crate) fn dup(self, inherit_terminal: bool) -> Dup {
        match self {
            Route::Terminal if inherit_terminal => Dup::empty(),
            _ => Dup::STDOUT | Dup::STDERR,
        }
    }

    /// Job table registration: `Some(foreground)`, or none for captures
    pub(crate) fn table(self) -> Option<bool> {
        match self {
            Route::Terminal => Some(true),
            Route::Console => Some(false),
            Route::Capture(_) => None,
        }
    }
}

/// Evaluation state an executor carries into its children
#[derive(Debug, Clone)]
pub struct Context {
    pub scope: ScopeStack,
    pub store: StoreId,
    pub route: Route,
}

impl Context {
    pub fn new(store: StoreId) -> Self {
        Self {
            scope: ScopeStack::new(),
            store,
            route: Route::Terminal,
        }
    }

    pub fn with_route(&self, route: Route) -> Self {
        Self {
            scope: self.scope.clone(),
            store: self.store,
            route,
        }
    }

    /// Context for an item terminated by `&`
    pub fn background(&self) -> Self {
        self.with_route(Route::Console)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::VarStores;

    #[test]
    fn test_route_policies() {
        assert_eq!(Route::Terminal.mode(), Mode::Foreground);
        assert_eq!(Route::Capture(0).mode(), Mode::Background);
        assert!(Route::Terminal.dup(true).is_empty());
        assert_eq!(Route::Terminal.dup(false), Dup::STDOUT | Dup::STDERR);
        assert_eq!(Route::Console.table(), Some(false));
        assert_eq!(Route::Capture(3).table(), None);
        assert_eq!(Route::Capture(3).sink(), Sink::Capture(3));
    }

    #[test]
    fn test_background_context_keeps_scope() {
        let stores = VarStores::new();
        let mut ctx = Context::new(stores.root());
        ctx.scope.set("x", serde_json::json!(1));
        let bg = ctx.background();
        assert_eq!(bg.route, Route::Console);
        assert_eq!(bg.scope.lookup("x"), Some(&serde_json::json!(1)));
    }
}
