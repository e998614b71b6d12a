use core::fmt;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::ast::{Field, Statement};
use crate::capability::Capability;
use crate::env::Environment;
use crate::future::FutureValue;

/// Runtime value of the DSL. Arrays and objects are reference-like: cloning
/// a `Value` clones the handle, and mutation through one alias is visible
/// through every other.
#[derive(Clone, Default)]
pub enum Value {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Array(Arc<RwLock<Vec<Value>>>),
    Object(Arc<RwLock<HashMap<String, Value>>>),
    Function(Arc<crate::ast::Function>),
    Closure(Arc<Closure>),
    Future(FutureValue),
    Handler(Arc<dyn Capability>),
    Ok(Box<Value>),
    Err(Box<Value>),
    #[default]
    Nil,
}

/// A lambda together with the environment it closed over.
#[derive(Debug)]
pub struct Closure {
    pub params: Vec<Field>,
    pub body: Vec<Statement>,
    pub env: Arc<Environment>,
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn object(entries: HashMap<String, Value>) -> Self {
        Value::Object(Arc::new(RwLock::new(entries)))
    }

    pub fn object_from(entries: Vec<(&str, Value)>) -> Self {
        Value::object(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn string(s: &str) -> Self {
        Value::String(s.to_string())
    }

    /// The name used in error messages, matching the type annotation
    /// vocabulary where one exists.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bool(_) => "bool",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Closure(_) => "closure",
            Value::Future(_) => "future",
            Value::Handler(_) => "handler",
            Value::Ok(_) | Value::Err(_) => "result",
            Value::Nil => "nil",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Strict structural equality. Aggregates compare by contents through
    /// their locks; futures and handlers compare by identity; Int never
    /// equals Float here.
    pub fn deep_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.read().unwrap();
                let b = b.read().unwrap();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_equals(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.read().unwrap();
                let b = b.read().unwrap();
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.deep_equals(w)))
            }
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Future(a), Value::Future(b)) => a.same_future(b),
            (Value::Handler(a), Value::Handler(b)) => Arc::ptr_eq(a, b),
            (Value::Ok(a), Value::Ok(b)) => a.deep_equals(b),
            (Value::Err(a), Value::Err(b)) => a.deep_equals(b),
            (Value::Nil, Value::Nil) => true,
            _ => false,
        }
    }

    /// The coercion-tolerant equality used by `==`, switch cases and literal
    /// patterns: Int 5 equals Float 5.0. Aggregates recurse with the same
    /// rule; everything else falls back to strict equality.
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Array(a), Value::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.read().unwrap();
                let b = b.read().unwrap();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.loose_equals(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.read().unwrap();
                let b = b.read().unwrap();
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.loose_equals(w)))
            }
            _ => self.deep_equals(other),
        }
    }

    /// Converts a value into JSON for the dispatch boundary. Functions,
    /// closures, futures and handlers have no JSON form and become null;
    /// Ok unwraps to its payload, Err becomes an error object.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Array(items) => serde_json::Value::Array(
                items.read().unwrap().iter().map(Value::to_json).collect(),
            ),
            Value::Object(entries) => serde_json::Value::Object(
                entries
                    .read()
                    .unwrap()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Ok(inner) => inner.to_json(),
            Value::Err(inner) => {
                let mut map = serde_json::Map::new();
                map.insert("error".to_string(), inner.to_json());
                serde_json::Value::Object(map)
            }
            Value::Function(_)
            | Value::Closure(_)
            | Value::Future(_)
            | Value::Handler(_)
            | Value::Nil => serde_json::Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_equals(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Array(items) => write!(f, "Array({:?})", items.read().unwrap()),
            Value::Object(entries) => write!(f, "Object({:?})", entries.read().unwrap()),
            Value::Function(func) => write!(f, "Function({})", func.name),
            Value::Closure(_) => write!(f, "Closure"),
            Value::Future(future) => write!(f, "Future({})", future.state_name()),
            Value::Handler(_) => write!(f, "Handler"),
            Value::Ok(inner) => write!(f, "Ok({:?})", inner),
            Value::Err(inner) => write!(f, "Err({:?})", inner),
            Value::Nil => write!(f, "Nil"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Nil => write!(f, "nil"),
            Value::Array(items) => {
                let items = items.read().unwrap();
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Ok(inner) => write!(f, "Ok({})", inner),
            Value::Err(inner) => write!(f, "Err({})", inner),
            other => write!(f, "{:?}", other),
        }
    }
}
