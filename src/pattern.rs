use std::sync::Arc;

use crate::ast::{Literal, Pattern};
use crate::env::Environment;
use crate::error::EvalResult;
use crate::value::Value;

impl From<&Literal> for Value {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::String(s.clone()),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Null => Value::Nil,
        }
    }
}

/// Matches a value against a structural pattern, binding sub-values into
/// `env` (the fresh environment of the match case being tried).
///
/// Returns Ok(false) for an ordinary non-match; a type mismatch is a
/// non-match, not an error. Guards are evaluated by the caller in the same
/// binding environment.
pub fn match_pattern(
    pattern: &Pattern,
    value: &Value,
    env: &Arc<Environment>,
) -> EvalResult<bool> {
    match pattern {
        Pattern::Literal(lit) => Ok(Value::from(lit).loose_equals(value)),
        Pattern::Variable(name) => {
            env.define(name, value.clone())?;
            Ok(true)
        }
        Pattern::Wildcard => Ok(true),
        Pattern::Object(fields) => match_object(fields, value, env),
        Pattern::Array { elements, rest } => match_array(elements, rest.as_deref(), value, env),
    }
}

fn match_object(
    fields: &[crate::ast::ObjectPatternField],
    value: &Value,
    env: &Arc<Environment>,
) -> EvalResult<bool> {
    let Value::Object(entries) = value else {
        return Ok(false);
    };

    for field in fields {
        // Clone out of the lock before recursing; nested patterns may bind
        // (and a guard later may read) without holding it.
        let field_value = match entries.read().unwrap().get(&field.key) {
            Some(v) => v.clone(),
            None => return Ok(false),
        };

        match &field.pattern {
            Some(nested) => {
                if !match_pattern(nested, &field_value, env)? {
                    return Ok(false);
                }
            }
            None => env.define(&field.key, field_value)?,
        }
    }

    Ok(true)
}

fn match_array(
    elements: &[Pattern],
    rest: Option<&str>,
    value: &Value,
    env: &Arc<Environment>,
) -> EvalResult<bool> {
    let Value::Array(items) = value else {
        return Ok(false);
    };
    let items = items.read().unwrap().clone();

    match rest {
        Some(_) if items.len() < elements.len() => return Ok(false),
        None if items.len() != elements.len() => return Ok(false),
        _ => {}
    }

    for (pattern, item) in elements.iter().zip(items.iter()) {
        if !match_pattern(pattern, item, env)? {
            return Ok(false);
        }
    }

    if let Some(rest_name) = rest {
        let tail: Vec<Value> = items[elements.len()..].to_vec();
        env.define(rest_name, Value::array(tail))?;
    }

    Ok(true)
}
