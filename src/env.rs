use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::value::Value;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvError {
    #[error("undefined variable: {0}")]
    Undefined(String),
    #[error("cannot redeclare variable in the same scope: {0}")]
    Redeclared(String),
}

/// A lexical scope frame chained to its parent. Frames are shared by `Arc`
/// because async blocks running on other tasks keep the enclosing scope
/// alive and observe its mutations.
#[derive(Debug, Default)]
pub struct Environment {
    vars: RwLock<HashMap<String, Value>>,
    parent: Option<Arc<Environment>>,
}

impl Environment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn child(parent: &Arc<Environment>) -> Arc<Self> {
        Arc::new(Self {
            vars: RwLock::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    /// Binds a name in this frame. Rebinding a name already present in the
    /// same frame is an error; shadowing a parent binding is allowed.
    pub fn define(&self, name: &str, value: Value) -> Result<(), EnvError> {
        let mut vars = self.vars.write().unwrap();
        if vars.contains_key(name) {
            return Err(EnvError::Redeclared(name.to_string()));
        }
        vars.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Value, EnvError> {
        if let Some(value) = self.vars.read().unwrap().get(name) {
            return Ok(value.clone());
        }
        match &self.parent {
            Some(parent) => parent.get(name),
            None => Err(EnvError::Undefined(name.to_string())),
        }
    }

    /// Updates the nearest frame that already defines `name`, never
    /// introducing a new binding.
    pub fn set(&self, name: &str, value: Value) -> Result<(), EnvError> {
        {
            let mut vars = self.vars.write().unwrap();
            if let Some(slot) = vars.get_mut(name) {
                *slot = value;
                return Ok(());
            }
        }
        match &self.parent {
            Some(parent) => parent.set(name, value),
            None => Err(EnvError::Undefined(name.to_string())),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.has_local(name) || self.parent.as_ref().is_some_and(|p| p.has(name))
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.vars.read().unwrap().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_get() {
        let env = Environment::new();
        env.define("x", Value::Int(42)).unwrap();
        assert_eq!(env.get("x").unwrap(), Value::Int(42));

        assert_eq!(
            env.get("missing"),
            Err(EnvError::Undefined("missing".to_string()))
        );
    }

    #[test]
    fn test_redeclare_in_same_frame_fails() {
        let env = Environment::new();
        env.define("x", Value::Int(1)).unwrap();
        assert_eq!(
            env.define("x", Value::Int(2)),
            Err(EnvError::Redeclared("x".to_string()))
        );
        // The original binding is untouched.
        assert_eq!(env.get("x").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_child_shadowing_leaves_parent_alone() {
        let parent = Environment::new();
        parent.define("x", Value::Int(1)).unwrap();

        let child = Environment::child(&parent);
        child.define("x", Value::Int(2)).unwrap();

        assert_eq!(child.get("x").unwrap(), Value::Int(2));
        assert_eq!(parent.get("x").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_set_mutates_nearest_defining_frame() {
        let parent = Environment::new();
        parent.define("counter", Value::Int(0)).unwrap();

        let child = Environment::child(&parent);
        child.set("counter", Value::Int(10)).unwrap();

        // Visible from the parent after the child scope is gone.
        drop(child);
        assert_eq!(parent.get("counter").unwrap(), Value::Int(10));
    }

    #[test]
    fn test_set_requires_existing_binding() {
        let env = Environment::new();
        assert_eq!(
            env.set("ghost", Value::Nil),
            Err(EnvError::Undefined("ghost".to_string()))
        );
    }

    #[test]
    fn test_has_and_has_local() {
        let parent = Environment::new();
        parent.define("a", Value::Bool(true)).unwrap();
        let child = Environment::child(&parent);
        child.define("b", Value::Bool(false)).unwrap();

        assert!(child.has("a"));
        assert!(child.has("b"));
        assert!(!child.has_local("a"));
        assert!(child.has_local("b"));
        assert!(!parent.has("b"));
    }
}
