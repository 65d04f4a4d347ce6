// Library interface for the jsh execution engine
// The binary and the integration tests drive everything through here

pub mod builtins;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hub;
pub mod job;
pub mod jobs;
pub mod logging;
pub mod scope;
pub mod services;
pub mod signal;
pub mod syntax;
pub mod terminal;
pub mod vars;

pub use engine::Engine;
pub use error::{EngineError, Result};
