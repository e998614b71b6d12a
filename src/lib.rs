//! Execution engine for the rill service DSL.
//!
//! A rill program describes services — HTTP routes, WebSocket handlers,
//! cron tasks, event handlers, queue workers and CLI commands. This crate
//! takes the already-parsed AST of such a program and executes it directly:
//! lexically-scoped environments, a recursive expression evaluator with the
//! language's numeric-coercion policy, a structural type system with
//! generics, a pattern-matching engine, and a future-based async model with
//! one task per `async` block.
//!
//! Parsing, transports, storage backends and process wiring live outside;
//! they hand ASTs and opaque handler capabilities in through [`Runtime`].

pub mod ast;
pub mod capability;
pub mod config;
pub mod env;
pub mod error;
pub mod eval;
pub mod future;
pub mod pattern;
pub mod runtime;
pub mod type_checker;
pub mod value;

// Re-exports
pub use capability::Capability;
pub use config::EngineConfig;
pub use env::Environment;
pub use error::{Error, EvalError, EvalResult, LoadError, RuntimeResult};
pub use future::FutureValue;
pub use runtime::{Runtime, RouteRequest, RouteResponse};
pub use value::Value;
