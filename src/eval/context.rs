use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::ast::Type;
use crate::config::EngineConfig;
use crate::error::{EvalError, EvalResult};
use crate::type_checker::{TypeChecker, TypeScope};
use crate::value::Value;

/// State shared by everything evaluating on behalf of one dispatch.
///
/// The checker and config are shared with the runtime; the depth counter is
/// shared with every async block spawned by this execution (it must stay
/// coherent across tasks); the generic type scope is per-context so that
/// concurrent tasks never interleave push/pop pairs.
pub struct ExecutionContext {
    pub checker: Arc<TypeChecker>,
    pub config: EngineConfig,
    depth: Arc<AtomicUsize>,
    type_scope: Mutex<TypeScope>,
}

impl ExecutionContext {
    pub fn new(checker: Arc<TypeChecker>, config: EngineConfig) -> Self {
        Self {
            checker,
            config,
            depth: Arc::new(AtomicUsize::new(0)),
            type_scope: Mutex::new(TypeScope::new()),
        }
    }

    /// Context for an async block: same registries and depth counter, own
    /// snapshot of the generic scope as of the spawn point.
    pub fn fork(&self) -> Self {
        Self {
            checker: self.checker.clone(),
            config: self.config.clone(),
            depth: self.depth.clone(),
            type_scope: Mutex::new(self.type_scope.lock().unwrap().clone()),
        }
    }

    /// Counts one level of nested evaluation; the guard releases it on every
    /// exit path. Atomic because async blocks on other tasks share the
    /// counter.
    pub fn enter_depth(&self) -> EvalResult<DepthGuard> {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > self.config.max_eval_depth {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(EvalError::DepthExceeded(self.config.max_eval_depth));
        }
        Ok(DepthGuard {
            depth: self.depth.clone(),
        })
    }

    pub fn push_type_scope(&self, bindings: HashMap<String, Type>) {
        self.type_scope.lock().unwrap().push(bindings);
    }

    pub fn pop_type_scope(&self) {
        self.type_scope.lock().unwrap().pop();
    }

    pub fn with_type_scope<R>(&self, f: impl FnOnce(&TypeScope) -> R) -> R {
        f(&self.type_scope.lock().unwrap())
    }

    /// Validates a value against an annotation, resolving generic parameters
    /// through the active scope.
    pub fn check_type(&self, value: &Value, expected: &Type) -> EvalResult<()> {
        self.with_type_scope(|scope| self.checker.check_type(value, expected, scope))
            .map_err(EvalError::from)
    }
}

pub struct DepthGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with_depth(max: usize) -> ExecutionContext {
        ExecutionContext::new(
            Arc::new(TypeChecker::new()),
            EngineConfig {
                max_eval_depth: max,
            },
        )
    }

    #[test]
    fn test_depth_guard_releases() {
        let ctx = context_with_depth(2);
        {
            let _a = ctx.enter_depth().unwrap();
            let _b = ctx.enter_depth().unwrap();
            assert!(matches!(
                ctx.enter_depth(),
                Err(EvalError::DepthExceeded(2))
            ));
        }
        // Both guards dropped; the budget is back.
        let _c = ctx.enter_depth().unwrap();
    }

    #[test]
    fn test_fork_shares_depth_counter() {
        let ctx = context_with_depth(2);
        let fork = ctx.fork();

        let _a = ctx.enter_depth().unwrap();
        let _b = fork.enter_depth().unwrap();
        assert!(ctx.enter_depth().is_err());
        assert!(fork.enter_depth().is_err());
    }

    #[test]
    fn test_fork_snapshots_type_scope() {
        let ctx = context_with_depth(8);
        ctx.push_type_scope(HashMap::from([("T".to_string(), Type::Int)]));

        let fork = ctx.fork();
        ctx.pop_type_scope();

        // The fork kept the snapshot taken at spawn time.
        assert_eq!(fork.with_type_scope(|s| s.lookup("T").cloned()), Some(Type::Int));
        assert_eq!(ctx.with_type_scope(|s| s.lookup("T").cloned()), None);
    }

    #[test]
    fn test_concurrent_depth_updates() {
        use std::thread;

        let ctx = Arc::new(context_with_depth(10_000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = ctx.enter_depth().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // Every guard released: a full chain is available again.
        let guards: Vec<_> = (0..10_000).map(|_| ctx.enter_depth().unwrap()).collect();
        assert_eq!(guards.len(), 10_000);
    }
}
