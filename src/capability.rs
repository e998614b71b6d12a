use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;

use crate::error::EvalResult;
use crate::value::Value;

/// An injected host object (database, cache) reachable from DSL programs.
///
/// The engine never inspects a handler's internals: programs touch it only
/// through `table` sub-handles (field access like `db.users`) and through
/// `call`, and the engine refuses any method name outside
/// [`method_allowed`]. That allow-list is the whole sandboxing story — there
/// is deliberately no open-ended dispatch.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Named sub-handle, e.g. a database table or cache namespace. `None`
    /// when the handler has no such concept.
    fn table(&self, _name: &str) -> Option<Arc<dyn Capability>> {
        None
    }

    /// Invoke a method on the handler. Callers have already checked the
    /// allow-list; implementations only need to handle their own surface.
    async fn call(&self, method: &str, args: Vec<Value>) -> EvalResult<Value>;
}

lazy_static! {
    static ref ALLOWED_METHODS: HashSet<&'static str> = [
        // database tables
        "find", "findOne", "insert", "update", "delete", "count",
        // cache / key-value handlers
        "get", "set", "del", "exists", "expire", "incr", "decr",
        // queue-ish handlers
        "push", "pop", "publish",
    ]
    .iter()
    .copied()
    .collect();
}

pub fn method_allowed(name: &str) -> bool {
    ALLOWED_METHODS.contains(name)
}
