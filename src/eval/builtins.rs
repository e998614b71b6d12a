use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use strum_macros::EnumString;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::expression::ExpressionEvaluator;
use crate::ast::CallExpr;
use crate::env::Environment;
use crate::error::{EvalError, EvalResult};
use crate::value::Value;

/// The builtin function registry. Call names resolve here before any
/// user-defined lookup; an unparseable name simply is not a builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
pub enum Builtin {
    #[strum(serialize = "time.now")]
    TimeNow,
    #[strum(serialize = "now")]
    Now,
    #[strum(serialize = "Ok")]
    OkWrap,
    #[strum(serialize = "Err")]
    ErrWrap,
    #[strum(serialize = "upper")]
    Upper,
    #[strum(serialize = "lower")]
    Lower,
    #[strum(serialize = "trim")]
    Trim,
    #[strum(serialize = "split")]
    Split,
    #[strum(serialize = "join")]
    Join,
    #[strum(serialize = "contains")]
    Contains,
    #[strum(serialize = "replace")]
    Replace,
    #[strum(serialize = "substring")]
    Substring,
    #[strum(serialize = "length")]
    Length,
    #[strum(serialize = "startsWith")]
    StartsWith,
    #[strum(serialize = "endsWith")]
    EndsWith,
    #[strum(serialize = "indexOf")]
    IndexOf,
    #[strum(serialize = "charAt")]
    CharAt,
    #[strum(serialize = "parseInt")]
    ParseInt,
    #[strum(serialize = "parseFloat")]
    ParseFloat,
    #[strum(serialize = "toString")]
    ToString,
    #[strum(serialize = "abs")]
    Abs,
    #[strum(serialize = "min")]
    Min,
    #[strum(serialize = "max")]
    Max,
    #[strum(serialize = "randomInt")]
    RandomInt,
    #[strum(serialize = "generateId")]
    GenerateId,
    #[strum(serialize = "append")]
    Append,
    #[strum(serialize = "set")]
    SetKey,
    #[strum(serialize = "remove")]
    RemoveKey,
    #[strum(serialize = "keys")]
    Keys,
    #[strum(serialize = "map")]
    Map,
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "reduce")]
    Reduce,
    #[strum(serialize = "find")]
    Find,
    #[strum(serialize = "some")]
    Some,
    #[strum(serialize = "every")]
    Every,
    #[strum(serialize = "sort")]
    Sort,
    #[strum(serialize = "reverse")]
    Reverse,
    #[strum(serialize = "flat")]
    Flat,
    #[strum(serialize = "slice")]
    Slice,
}

fn expect_arity(name: &str, args: &[Value], expected: usize) -> EvalResult<()> {
    if args.len() != expected {
        return Err(EvalError::Arity {
            name: name.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn as_string<'a>(name: &str, position: &str, value: &'a Value) -> EvalResult<&'a str> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(EvalError::InvalidOperation(format!(
            "{}() expects {} to be a string, got {}",
            name,
            position,
            other.type_name()
        ))),
    }
}

fn as_array(name: &str, value: &Value) -> EvalResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items.read().unwrap().clone()),
        other => Err(EvalError::InvalidOperation(format!(
            "{}() expects an array argument, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn as_int(name: &str, position: &str, value: &Value) -> EvalResult<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(EvalError::InvalidOperation(format!(
            "{}() expects {} to be an integer, got {}",
            name,
            position,
            other.type_name()
        ))),
    }
}

impl ExpressionEvaluator {
    pub(super) async fn eval_builtin(
        &self,
        builtin: Builtin,
        call: &CallExpr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let name = &call.name;
        let args = self.eval_args(&call.args, env, ctx).await?;

        match builtin {
            Builtin::TimeNow | Builtin::Now => {
                expect_arity(name, &args, 0)?;
                Ok(Value::Int(Utc::now().timestamp()))
            }
            Builtin::OkWrap => {
                expect_arity(name, &args, 1)?;
                Ok(Value::Ok(Box::new(args.into_iter().next().unwrap())))
            }
            Builtin::ErrWrap => {
                expect_arity(name, &args, 1)?;
                Ok(Value::Err(Box::new(args.into_iter().next().unwrap())))
            }
            Builtin::Upper => {
                expect_arity(name, &args, 1)?;
                Ok(Value::String(as_string(name, "its argument", &args[0])?.to_uppercase()))
            }
            Builtin::Lower => {
                expect_arity(name, &args, 1)?;
                Ok(Value::String(as_string(name, "its argument", &args[0])?.to_lowercase()))
            }
            Builtin::Trim => {
                expect_arity(name, &args, 1)?;
                Ok(Value::String(
                    as_string(name, "its argument", &args[0])?.trim().to_string(),
                ))
            }
            Builtin::Split => {
                expect_arity(name, &args, 2)?;
                let input = as_string(name, "first argument", &args[0])?;
                let delim = as_string(name, "second argument", &args[1])?;
                let parts: Vec<Value> = if delim.is_empty() {
                    input.chars().map(|c| Value::String(c.to_string())).collect()
                } else {
                    input.split(delim).map(Value::string).collect()
                };
                Ok(Value::array(parts))
            }
            Builtin::Join => {
                expect_arity(name, &args, 2)?;
                let items = as_array(name, &args[0])?;
                let delim = as_string(name, "second argument", &args[1])?;
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                Ok(Value::String(parts.join(delim)))
            }
            Builtin::Contains => {
                expect_arity(name, &args, 2)?;
                let input = as_string(name, "first argument", &args[0])?;
                let needle = as_string(name, "second argument", &args[1])?;
                Ok(Value::Bool(input.contains(needle)))
            }
            Builtin::Replace => {
                expect_arity(name, &args, 3)?;
                let input = as_string(name, "first argument", &args[0])?;
                let from = as_string(name, "second argument", &args[1])?;
                let to = as_string(name, "third argument", &args[2])?;
                Ok(Value::String(input.replace(from, to)))
            }
            Builtin::Substring => {
                expect_arity(name, &args, 3)?;
                let input = as_string(name, "first argument", &args[0])?;
                let start = as_int(name, "second argument", &args[1])?;
                let end = as_int(name, "third argument", &args[2])?;
                if start < 0 || end < 0 {
                    return Err(EvalError::InvalidOperation(
                        "substring() indices must be non-negative".to_string(),
                    ));
                }
                if start > end {
                    return Err(EvalError::InvalidOperation(
                        "substring() start index must be less than or equal to end index"
                            .to_string(),
                    ));
                }
                let chars: Vec<char> = input.chars().collect();
                let start = (start as usize).min(chars.len());
                let end = (end as usize).min(chars.len());
                Ok(Value::String(chars[start..end].iter().collect()))
            }
            Builtin::Length => {
                expect_arity(name, &args, 1)?;
                match &args[0] {
                    Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                    Value::Array(items) => Ok(Value::Int(items.read().unwrap().len() as i64)),
                    Value::Object(entries) => Ok(Value::Int(entries.read().unwrap().len() as i64)),
                    other => Err(EvalError::InvalidOperation(format!(
                        "length() expects a string, array or object argument, got {}",
                        other.type_name()
                    ))),
                }
            }
            Builtin::StartsWith => {
                expect_arity(name, &args, 2)?;
                let input = as_string(name, "first argument", &args[0])?;
                let prefix = as_string(name, "second argument", &args[1])?;
                Ok(Value::Bool(input.starts_with(prefix)))
            }
            Builtin::EndsWith => {
                expect_arity(name, &args, 2)?;
                let input = as_string(name, "first argument", &args[0])?;
                let suffix = as_string(name, "second argument", &args[1])?;
                Ok(Value::Bool(input.ends_with(suffix)))
            }
            Builtin::IndexOf => {
                expect_arity(name, &args, 2)?;
                let input = as_string(name, "first argument", &args[0])?;
                let needle = as_string(name, "second argument", &args[1])?;
                let index = input
                    .find(needle)
                    .map(|byte| input[..byte].chars().count() as i64)
                    .unwrap_or(-1);
                Ok(Value::Int(index))
            }
            Builtin::CharAt => {
                expect_arity(name, &args, 2)?;
                let input = as_string(name, "first argument", &args[0])?;
                let index = as_int(name, "second argument", &args[1])?;
                let c = (index >= 0)
                    .then(|| input.chars().nth(index as usize))
                    .flatten()
                    .ok_or_else(|| {
                        EvalError::InvalidOperation(format!(
                            "charAt() index out of bounds: {}",
                            index
                        ))
                    })?;
                Ok(Value::String(c.to_string()))
            }
            Builtin::ParseInt => {
                expect_arity(name, &args, 1)?;
                let input = as_string(name, "its argument", &args[0])?.trim();
                input.parse::<i64>().map(Value::Int).map_err(|e| {
                    EvalError::InvalidOperation(format!(
                        "parseInt() failed to parse '{}': {}",
                        input, e
                    ))
                })
            }
            Builtin::ParseFloat => {
                expect_arity(name, &args, 1)?;
                let input = as_string(name, "its argument", &args[0])?.trim();
                input.parse::<f64>().map(Value::Float).map_err(|e| {
                    EvalError::InvalidOperation(format!(
                        "parseFloat() failed to parse '{}': {}",
                        input, e
                    ))
                })
            }
            Builtin::ToString => {
                expect_arity(name, &args, 1)?;
                Ok(Value::String(args[0].to_string()))
            }
            Builtin::Abs => {
                expect_arity(name, &args, 1)?;
                match &args[0] {
                    // abs of the minimum representable integer is a reported
                    // error rather than silent overflow.
                    Value::Int(i) => i
                        .checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| EvalError::IntegerOverflow("abs".to_string())),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    other => Err(EvalError::InvalidOperation(format!(
                        "abs() expects a numeric argument, got {}",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Min | Builtin::Max => {
                expect_arity(name, &args, 2)?;
                let take_min = builtin == Builtin::Min;
                match (&args[0], &args[1]) {
                    (Value::Int(l), Value::Int(r)) => {
                        Ok(Value::Int(if take_min { *l.min(r) } else { *l.max(r) }))
                    }
                    (Value::Float(l), Value::Float(r)) => Ok(Value::Float(if take_min {
                        l.min(*r)
                    } else {
                        l.max(*r)
                    })),
                    _ => Err(EvalError::InvalidOperation(format!(
                        "{}() arguments must be the same numeric type",
                        name
                    ))),
                }
            }
            Builtin::RandomInt => {
                expect_arity(name, &args, 2)?;
                let min = as_int(name, "first argument", &args[0])?;
                let max = as_int(name, "second argument", &args[1])?;
                if min > max {
                    return Err(EvalError::InvalidOperation(format!(
                        "randomInt() min {} is greater than max {}",
                        min, max
                    )));
                }
                Ok(Value::Int(rand::thread_rng().gen_range(min..=max)))
            }
            Builtin::GenerateId => {
                expect_arity(name, &args, 0)?;
                Ok(Value::String(Uuid::new_v4().to_string()))
            }
            Builtin::Append => {
                expect_arity(name, &args, 2)?;
                let mut items = as_array(name, &args[0])?;
                items.push(args[1].clone());
                Ok(Value::array(items))
            }
            Builtin::SetKey => {
                expect_arity(name, &args, 3)?;
                let Value::Object(entries) = &args[0] else {
                    return Err(EvalError::InvalidOperation(format!(
                        "set() expects first argument to be an object, got {}",
                        args[0].type_name()
                    )));
                };
                let key = as_string(name, "second argument", &args[1])?;
                entries
                    .write()
                    .unwrap()
                    .insert(key.to_string(), args[2].clone());
                Ok(args[0].clone())
            }
            Builtin::RemoveKey => {
                expect_arity(name, &args, 2)?;
                let Value::Object(entries) = &args[0] else {
                    return Err(EvalError::InvalidOperation(format!(
                        "remove() expects first argument to be an object, got {}",
                        args[0].type_name()
                    )));
                };
                let key = as_string(name, "second argument", &args[1])?;
                entries.write().unwrap().remove(key);
                Ok(args[0].clone())
            }
            Builtin::Keys => {
                expect_arity(name, &args, 1)?;
                let Value::Object(entries) = &args[0] else {
                    return Err(EvalError::InvalidOperation(format!(
                        "keys() expects an object argument, got {}",
                        args[0].type_name()
                    )));
                };
                let mut keys: Vec<String> = entries.read().unwrap().keys().cloned().collect();
                keys.sort();
                Ok(Value::array(keys.into_iter().map(Value::String).collect()))
            }
            Builtin::Map => {
                expect_arity(name, &args, 2)?;
                let items = as_array(name, &args[0])?;
                let mut result = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let mapped = self
                        .call_value(&args[1], vec![item], env, ctx)
                        .await
                        .map_err(|e| callback_error(name, index, e))?;
                    result.push(mapped);
                }
                Ok(Value::array(result))
            }
            Builtin::Filter => {
                expect_arity(name, &args, 2)?;
                let items = as_array(name, &args[0])?;
                let mut result = Vec::new();
                for (index, item) in items.into_iter().enumerate() {
                    let keep = self
                        .call_value(&args[1], vec![item.clone()], env, ctx)
                        .await
                        .map_err(|e| callback_error(name, index, e))?;
                    match keep {
                        Value::Bool(true) => result.push(item),
                        Value::Bool(false) => {}
                        other => {
                            return Err(EvalError::InvalidOperation(format!(
                                "filter() callback must return a boolean, got {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                Ok(Value::array(result))
            }
            Builtin::Reduce => {
                expect_arity(name, &args, 3)?;
                let items = as_array(name, &args[0])?;
                let mut acc = args[2].clone();
                for (index, item) in items.into_iter().enumerate() {
                    acc = self
                        .call_value(&args[1], vec![acc, item], env, ctx)
                        .await
                        .map_err(|e| callback_error(name, index, e))?;
                }
                Ok(acc)
            }
            Builtin::Find => {
                expect_arity(name, &args, 2)?;
                let items = as_array(name, &args[0])?;
                for (index, item) in items.into_iter().enumerate() {
                    let matched = self
                        .call_value(&args[1], vec![item.clone()], env, ctx)
                        .await
                        .map_err(|e| callback_error(name, index, e))?;
                    if matches!(matched, Value::Bool(true)) {
                        return Ok(item);
                    }
                }
                Ok(Value::Nil)
            }
            Builtin::Some | Builtin::Every => {
                expect_arity(name, &args, 2)?;
                let want_all = builtin == Builtin::Every;
                let items = as_array(name, &args[0])?;
                for (index, item) in items.into_iter().enumerate() {
                    let matched = self
                        .call_value(&args[1], vec![item], env, ctx)
                        .await
                        .map_err(|e| callback_error(name, index, e))?;
                    match (matched, want_all) {
                        (Value::Bool(true), false) => return Ok(Value::Bool(true)),
                        (Value::Bool(false), true) => return Ok(Value::Bool(false)),
                        (Value::Bool(_), _) => {}
                        (other, _) => {
                            return Err(EvalError::InvalidOperation(format!(
                                "{}() callback must return a boolean, got {}",
                                name,
                                other.type_name()
                            )));
                        }
                    }
                }
                Ok(Value::Bool(want_all))
            }
            Builtin::Sort => {
                if args.len() == 1 {
                    let mut items = as_array(name, &args[0])?;
                    let mut failure = None;
                    items.sort_by(|a, b| default_ordering(a, b, &mut failure));
                    match failure {
                        Some(error) => Err(error),
                        None => Ok(Value::array(items)),
                    }
                } else {
                    expect_arity(name, &args, 2)?;
                    let items = as_array(name, &args[0])?;
                    self.sort_with_comparator(items, &args[1], env, ctx).await
                }
            }
            Builtin::Reverse => {
                expect_arity(name, &args, 1)?;
                let mut items = as_array(name, &args[0])?;
                items.reverse();
                Ok(Value::array(items))
            }
            Builtin::Flat => {
                expect_arity(name, &args, 1)?;
                let items = as_array(name, &args[0])?;
                let mut result = Vec::new();
                for item in items {
                    match item {
                        Value::Array(inner) => result.extend(inner.read().unwrap().iter().cloned()),
                        other => result.push(other),
                    }
                }
                Ok(Value::array(result))
            }
            Builtin::Slice => {
                expect_arity(name, &args, 3)?;
                let items = as_array(name, &args[0])?;
                let start = as_int(name, "second argument", &args[1])?.max(0) as usize;
                let end = (as_int(name, "third argument", &args[2])?.max(0) as usize)
                    .min(items.len());
                if start >= end {
                    return Ok(Value::array(vec![]));
                }
                Ok(Value::array(items[start..end].to_vec()))
            }
        }
    }

    /// Stable insertion sort driven by an async comparator: a negative
    /// number or `true` means "less than".
    async fn sort_with_comparator(
        &self,
        items: Vec<Value>,
        comparator: &Value,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let mut sorted: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            let mut insert_at = sorted.len();
            for (position, existing) in sorted.iter().enumerate() {
                let verdict = self
                    .call_value(comparator, vec![item.clone(), existing.clone()], env, ctx)
                    .await?;
                let is_less = match verdict {
                    Value::Int(i) => i < 0,
                    Value::Float(f) => f < 0.0,
                    Value::Bool(b) => b,
                    other => {
                        return Err(EvalError::InvalidOperation(format!(
                            "sort() comparator must return a number or boolean, got {}",
                            other.type_name()
                        )));
                    }
                };
                if is_less {
                    insert_at = position;
                    break;
                }
            }
            sorted.insert(insert_at, item);
        }
        Ok(Value::array(sorted))
    }
}

fn callback_error(name: &str, index: usize, error: EvalError) -> EvalError {
    EvalError::Eval(format!(
        "{}() callback error at index {}: {}",
        name, index, error
    ))
}

fn default_ordering(
    a: &Value,
    b: &Value,
    failure: &mut Option<EvalError>,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    if failure.is_some() {
        return Ordering::Equal;
    }
    match (a, b) {
        (Value::Int(l), Value::Int(r)) => l.cmp(r),
        (Value::Float(l), Value::Float(r)) => l.partial_cmp(r).unwrap_or(Ordering::Equal),
        (Value::Int(l), Value::Float(r)) => {
            (*l as f64).partial_cmp(r).unwrap_or(Ordering::Equal)
        }
        (Value::Float(l), Value::Int(r)) => {
            l.partial_cmp(&(*r as f64)).unwrap_or(Ordering::Equal)
        }
        (Value::String(l), Value::String(r)) => l.cmp(r),
        _ => {
            *failure = Some(EvalError::InvalidOperation(format!(
                "sort() cannot compare {} and {}",
                a.type_name(),
                b.type_name()
            )));
            Ordering::Equal
        }
    }
}
