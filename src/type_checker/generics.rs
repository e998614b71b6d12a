use std::collections::HashMap;

use crate::ast::{Field, Function, Type};
use crate::value::Value;

use super::{TypeCheckError, TypeCheckResult, TypeChecker};

/// Stack of generic-parameter bindings active during a call.
///
/// A frame is pushed when a generic call is resolved and popped on return
/// (on every exit path), so nested generic calls resolve their parameter
/// names without any global mutable state. Async blocks receive a snapshot
/// of the stack at the point they are spawned.
#[derive(Debug, Clone, Default)]
pub struct TypeScope {
    frames: Vec<HashMap<String, Type>>,
}

impl TypeScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bindings: HashMap<String, Type>) {
        self.frames.push(bindings);
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// Innermost binding for a type-parameter name.
    pub fn lookup(&self, name: &str) -> Option<&Type> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Substitutes type parameters through `ty` using explicit bindings first,
/// then the enclosing scope. Unbound parameters stay as they are.
pub fn substitute(ty: &Type, bindings: &HashMap<String, Type>, scope: &TypeScope) -> Type {
    match ty {
        Type::TypeParam(name) => bindings
            .get(name)
            .or_else(|| scope.lookup(name))
            .cloned()
            .unwrap_or_else(|| ty.clone()),
        Type::Array(Some(elem)) => Type::Array(Some(Box::new(substitute(elem, bindings, scope)))),
        Type::Optional(inner) => Type::Optional(Box::new(substitute(inner, bindings, scope))),
        Type::Union(members) => Type::Union(
            members
                .iter()
                .map(|m| substitute(m, bindings, scope))
                .collect(),
        ),
        Type::Function {
            params,
            return_type,
        } => Type::Function {
            params: params
                .iter()
                .map(|p| substitute(p, bindings, scope))
                .collect(),
            return_type: Box::new(substitute(return_type, bindings, scope)),
        },
        other => other.clone(),
    }
}

/// Resolves a type against the active scope only (no call-site bindings).
pub fn resolve(ty: &Type, scope: &TypeScope) -> Type {
    substitute(ty, &HashMap::new(), scope)
}

/// Infers type arguments for a generic function from its runtime argument
/// values by walking each declared parameter type. Two arguments implying
/// different bindings for one parameter is an inference error, as is a
/// parameter that no argument binds.
pub fn infer_type_arguments(func: &Function, args: &[Value]) -> TypeCheckResult<Vec<Type>> {
    let mut inferred: HashMap<String, Type> = HashMap::new();

    for (param, value) in func.params.iter().zip(args.iter()) {
        if let Some(annotation) = &param.type_annotation {
            unify(annotation, value, &mut inferred)?;
        }
    }

    func.type_params
        .iter()
        .map(|param| {
            inferred
                .get(&param.name)
                .cloned()
                .ok_or_else(|| TypeCheckError::UnboundTypeParam(param.name.clone()))
        })
        .collect()
}

fn unify(
    annotation: &Type,
    value: &Value,
    inferred: &mut HashMap<String, Type>,
) -> TypeCheckResult<()> {
    match annotation {
        Type::TypeParam(name) => {
            let Some(actual) = TypeChecker::runtime_type_of(value) else {
                return Ok(());
            };
            match inferred.get(name) {
                Some(existing) if existing != &actual => Err(TypeCheckError::ConflictingBindings {
                    name: name.clone(),
                    first: existing.to_string(),
                    second: actual.to_string(),
                }),
                Some(_) => Ok(()),
                None => {
                    inferred.insert(name.clone(), actual);
                    Ok(())
                }
            }
        }
        Type::Array(Some(elem)) => {
            if let Value::Array(items) = value {
                // The first element decides; later conflicts surface through
                // the conflicting-bindings check.
                let first = items.read().unwrap().first().cloned();
                if let Some(first) = first {
                    unify(elem, &first, inferred)?;
                }
            }
            Ok(())
        }
        Type::Optional(inner) => {
            if !value.is_nil() {
                unify(inner, value, inferred)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Produces a concrete callable from a generic definition and resolved type
/// arguments, without mutating the definition. Returns the instantiated
/// function together with the bindings to push for the call's duration.
pub fn instantiate_function(
    func: &Function,
    type_args: &[Type],
    scope: &TypeScope,
) -> TypeCheckResult<(Function, HashMap<String, Type>)> {
    if type_args.len() != func.type_params.len() {
        return Err(TypeCheckError::TypeArgArity {
            name: func.name.clone(),
            expected: func.type_params.len(),
            actual: type_args.len(),
        });
    }

    let mut bindings = HashMap::new();
    for (param, arg) in func.type_params.iter().zip(type_args.iter()) {
        if let Some(constraint) = &param.constraint {
            if !constraint_satisfied(arg, constraint) {
                return Err(TypeCheckError::ConstraintNotSatisfied {
                    argument: arg.to_string(),
                    constraint: constraint.to_string(),
                });
            }
        }
        bindings.insert(param.name.clone(), arg.clone());
    }

    let params = func
        .params
        .iter()
        .map(|param| Field {
            name: param.name.clone(),
            type_annotation: param
                .type_annotation
                .as_ref()
                .map(|t| substitute(t, &bindings, scope)),
            required: param.required,
            default: param.default.clone(),
        })
        .collect();

    let instantiated = Function {
        name: func.name.clone(),
        type_params: vec![],
        params,
        return_type: func
            .return_type
            .as_ref()
            .map(|t| substitute(t, &bindings, scope)),
        body: func.body.clone(),
    };

    Ok((instantiated, bindings))
}

/// Built-in type-parameter constraints.
pub fn constraint_satisfied(ty: &Type, constraint: &Type) -> bool {
    let Type::Named(name) = constraint else {
        return ty == constraint;
    };
    match name.as_str() {
        "Any" => true,
        "Comparable" => matches!(ty, Type::Int | Type::String | Type::Bool | Type::Float),
        "Numeric" => matches!(ty, Type::Int | Type::Float),
        "Hashable" => matches!(ty, Type::Int | Type::String | Type::Bool),
        _ => false,
    }
}
