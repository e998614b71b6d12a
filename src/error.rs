use std::time::Duration;

use thiserror::Error;

use crate::env::EnvError;
use crate::type_checker::TypeCheckError;

/// Failures raised while evaluating expressions or executing statements.
///
/// Clone is required: a rejected future hands the same error to every
/// awaiter. `Return` is never represented here; control transfer uses the
/// dedicated statement outcome type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    TypeCheck(#[from] TypeCheckError),
    #[error("division by zero")]
    DivisionByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("integer overflow in {0}")]
    IntegerOverflow(String),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("array index out of bounds: {index} (length: {len})")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("key '{0}' not found in object")]
    KeyNotFound(String),
    #[error("field {0} not found on object")]
    FieldNotFound(String),
    #[error("cannot access field {field} on {target}")]
    InvalidFieldAccess { field: String, target: String },
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("not a function: {0}")]
    NotCallable(String),
    #[error("{name} expects {expected} arguments, got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("await requires a future, got {0}")]
    AwaitTarget(String),
    #[error("future timed out after {0:?}")]
    AwaitTimeout(Duration),
    #[error("evaluation depth exceeded: {0}")]
    DepthExceeded(usize),
    #[error("method {0} is not allowed on injected handlers")]
    MethodNotAllowed(String),
    #[error("handler error: {0}")]
    Capability(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    Eval(String),
}

impl EvalError {
    /// Validation failures are client-facing (bad request) rather than
    /// internal faults; dispatchers branch on this.
    pub fn is_validation(&self) -> bool {
        matches!(self, EvalError::Validation(_))
    }
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Failures raised while registering a module's items.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("duplicate {kind} definition: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("error evaluating constant {name}: {source}")]
    Const { name: String, source: EvalError },
    #[error("constant {name}: {source}")]
    ConstType {
        name: String,
        source: TypeCheckError,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("eval error: {0}")]
    Eval(#[from] EvalError),
    #[error("load error: {0}")]
    Load(#[from] LoadError),
    #[error("missing required argument: {0}")]
    MissingArgument(String),
    #[error("no {kind} handler registered for {name}")]
    UnknownUnit { kind: &'static str, name: String },
}

impl Error {
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Eval(e) if e.is_validation())
    }
}

pub type RuntimeResult<T> = Result<T, Error>;
