pub mod builtins;
pub mod context;
pub mod expression;
pub mod statement;

pub use context::ExecutionContext;
pub use expression::ExpressionEvaluator;
pub use statement::{ControlFlow, StatementExecutor, StatementResult};
