mod generics;

pub use generics::{constraint_satisfied, infer_type_arguments, instantiate_function, TypeScope};

use dashmap::DashMap;
use thiserror::Error;

use crate::ast::{Type, TypeDef};
use crate::value::Value;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TypeCheckError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("field {field}: {source}")]
    Field {
        field: String,
        source: Box<TypeCheckError>,
    },
    #[error("array element {index}: {source}")]
    Element {
        index: usize,
        source: Box<TypeCheckError>,
    },
    #[error("undefined type: {0}")]
    UndefinedType(String),
    #[error("{name} expects {expected} type arguments, got {actual}")]
    TypeArgArity {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("could not infer type for type parameter {0}")]
    UnboundTypeParam(String),
    #[error("conflicting bindings for type parameter {name}: {first} vs {second}")]
    ConflictingBindings {
        name: String,
        first: String,
        second: String,
    },
    #[error("type argument {argument} does not satisfy constraint {constraint}")]
    ConstraintNotSatisfied {
        argument: String,
        constraint: String,
    },
}

pub type TypeCheckResult<T> = Result<T, TypeCheckError>;

/// Structural type checking against the module's type definitions.
///
/// The TypeDef registry is populated once at module load and read-only
/// afterwards; checks happen at function-call argument binding and at
/// returns. Values are validated, never coerced.
#[derive(Default)]
pub struct TypeChecker {
    type_defs: DashMap<String, TypeDef>,
}

impl TypeChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type_def(&self, def: TypeDef) {
        self.type_defs.insert(def.name.clone(), def);
    }

    pub fn type_def(&self, name: &str) -> Option<TypeDef> {
        self.type_defs.get(name).map(|entry| entry.clone())
    }

    /// Infers a type annotation from a runtime value. Aggregate element
    /// types are unknowable from the value alone; handlers, functions and
    /// futures carry no annotation vocabulary and yield `None`.
    pub fn runtime_type_of(value: &Value) -> Option<Type> {
        match value {
            Value::Int(_) => Some(Type::Int),
            Value::Float(_) => Some(Type::Float),
            Value::String(_) => Some(Type::String),
            Value::Bool(_) => Some(Type::Bool),
            Value::Array(_) => Some(Type::Array(None)),
            Value::Object(_) => Some(Type::named("object")),
            Value::Handler(_) => Some(Type::Database),
            _ => None,
        }
    }

    /// Structural compatibility of `actual` with `expected`.
    pub fn types_compatible(&self, actual: &Type, expected: &Type) -> bool {
        match (actual, expected) {
            (Type::Int, Type::Int)
            | (Type::String, Type::String)
            | (Type::Bool, Type::Bool)
            | (Type::Float, Type::Float)
            | (Type::Database, Type::Database)
            | (Type::Redis, Type::Redis) => true,
            // Int is accepted where Float is declared.
            (Type::Int, Type::Float) => true,
            (Type::Array(a), Type::Array(e)) => match (a, e) {
                (_, None) | (None, _) => true,
                (Some(a), Some(e)) => self.types_compatible(a, e),
            },
            (Type::Optional(a), Type::Optional(e)) => self.types_compatible(a, e),
            // Any T is compatible with Optional(T).
            (actual, Type::Optional(inner)) => self.types_compatible(actual, inner),
            (Type::Named(a), Type::Named(e)) => a == "object" || a == e,
            // A union member set is compatible when every member fits.
            (Type::Union(members), expected) => {
                members.iter().all(|m| self.types_compatible(m, expected))
            }
            (actual, Type::Union(members)) => {
                members.iter().any(|m| self.types_compatible(actual, m))
            }
            (Type::TypeParam(a), Type::TypeParam(e)) => a == e,
            (
                Type::Function {
                    params: ap,
                    return_type: ar,
                },
                Type::Function {
                    params: ep,
                    return_type: er,
                },
            ) => {
                ap.len() == ep.len()
                    && ap
                        .iter()
                        .zip(ep.iter())
                        .all(|(a, e)| self.types_compatible(a, e))
                    && self.types_compatible(ar, er)
            }
            _ => false,
        }
    }

    /// Validates a runtime value against a declared type, resolving type
    /// parameters through the active generic scope. Descriptive failure,
    /// never coercion.
    pub fn check_type(
        &self,
        value: &Value,
        expected: &Type,
        scope: &TypeScope,
    ) -> TypeCheckResult<()> {
        let expected = generics::resolve(expected, scope);
        self.check_resolved(value, &expected)
    }

    fn check_resolved(&self, value: &Value, expected: &Type) -> TypeCheckResult<()> {
        match expected {
            Type::Optional(inner) => {
                if value.is_nil() {
                    Ok(())
                } else {
                    self.check_resolved(value, inner)
                }
            }
            Type::Union(members) => {
                if members
                    .iter()
                    .any(|m| self.check_resolved(value, m).is_ok())
                {
                    Ok(())
                } else {
                    Err(self.mismatch(expected, value))
                }
            }
            Type::Array(elem) => match value {
                Value::Array(items) => {
                    if let Some(elem) = elem {
                        for (index, item) in items.read().unwrap().iter().enumerate() {
                            self.check_resolved(item, elem).map_err(|source| {
                                TypeCheckError::Element {
                                    index,
                                    source: Box::new(source),
                                }
                            })?;
                        }
                    }
                    Ok(())
                }
                _ => Err(self.mismatch(expected, value)),
            },
            Type::Named(name) => match value {
                Value::Object(_) => {
                    if let Some(def) = self.type_def(name) {
                        self.validate_object(value, &def)
                    } else {
                        // Unknown named types accept any object; structure
                        // validation requires a registered definition.
                        Ok(())
                    }
                }
                _ => Err(self.mismatch(expected, value)),
            },
            Type::Int => match value {
                Value::Int(_) => Ok(()),
                _ => Err(self.mismatch(expected, value)),
            },
            Type::Float => match value {
                // Declared floats accept ints (annotation-level coercion).
                Value::Float(_) | Value::Int(_) => Ok(()),
                _ => Err(self.mismatch(expected, value)),
            },
            Type::String => match value {
                Value::String(_) => Ok(()),
                _ => Err(self.mismatch(expected, value)),
            },
            Type::Bool => match value {
                Value::Bool(_) => Ok(()),
                _ => Err(self.mismatch(expected, value)),
            },
            Type::Database | Type::Redis => match value {
                Value::Handler(_) => Ok(()),
                _ => Err(self.mismatch(expected, value)),
            },
            Type::Function { .. } => match value {
                Value::Function(_) | Value::Closure(_) => Ok(()),
                _ => Err(self.mismatch(expected, value)),
            },
            // An unresolved type parameter constrains nothing.
            Type::TypeParam(_) => Ok(()),
        }
    }

    /// Validates an object value against a TypeDef: required fields must be
    /// present, declared fields must type-check, extra fields are allowed.
    pub fn validate_object(&self, value: &Value, def: &TypeDef) -> TypeCheckResult<()> {
        let entries = match value {
            Value::Object(entries) => entries.read().unwrap(),
            _ => {
                return Err(self.mismatch(&Type::named(&def.name), value));
            }
        };

        for field in &def.fields {
            if field.required && field.default.is_none() && !entries.contains_key(&field.name) {
                return Err(TypeCheckError::MissingField(field.name.clone()));
            }
        }

        for (name, field_value) in entries.iter() {
            let Some(field) = def.fields.iter().find(|f| &f.name == name) else {
                continue;
            };
            if let Some(annotation) = &field.type_annotation {
                self.check_resolved(field_value, annotation)
                    .map_err(|source| TypeCheckError::Field {
                        field: name.clone(),
                        source: Box::new(source),
                    })?;
            }
        }

        Ok(())
    }

    fn mismatch(&self, expected: &Type, value: &Value) -> TypeCheckError {
        TypeCheckError::Mismatch {
            expected: expected.to_string(),
            actual: value.type_name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Field;

    fn checker_with_user() -> TypeChecker {
        let checker = TypeChecker::new();
        checker.register_type_def(TypeDef {
            name: "User".to_string(),
            type_params: vec![],
            fields: vec![
                Field::required("name", Type::String),
                Field::required("age", Type::Int),
                Field::optional("email", Type::String, None),
            ],
        });
        checker
    }

    #[test]
    fn test_primitive_compatibility() {
        let checker = TypeChecker::new();
        assert!(checker.types_compatible(&Type::Int, &Type::Int));
        assert!(checker.types_compatible(&Type::Int, &Type::Float));
        assert!(!checker.types_compatible(&Type::Float, &Type::Int));
        assert!(!checker.types_compatible(&Type::String, &Type::Bool));
    }

    #[test]
    fn test_array_and_optional_compatibility() {
        let checker = TypeChecker::new();
        assert!(checker.types_compatible(
            &Type::array_of(Type::Int),
            &Type::array_of(Type::Float)
        ));
        assert!(checker.types_compatible(&Type::Array(None), &Type::array_of(Type::Int)));
        assert!(checker.types_compatible(&Type::Int, &Type::optional(Type::Int)));
        assert!(!checker.types_compatible(&Type::Bool, &Type::optional(Type::Int)));
    }

    #[test]
    fn test_union_compatibility() {
        let checker = TypeChecker::new();
        let union = Type::Union(vec![Type::Int, Type::String]);
        assert!(checker.types_compatible(&Type::Int, &union));
        assert!(checker.types_compatible(&Type::String, &union));
        assert!(!checker.types_compatible(&Type::Bool, &union));
        // Every member of an actual union must fit the expected type.
        assert!(checker.types_compatible(&union, &Type::Union(vec![Type::Int, Type::String, Type::Bool])));
        assert!(!checker.types_compatible(&union, &Type::Int));
    }

    #[test]
    fn test_check_type_primitives() {
        let checker = TypeChecker::new();
        let scope = TypeScope::new();

        assert!(checker.check_type(&Value::Int(1), &Type::Int, &scope).is_ok());
        assert!(checker.check_type(&Value::Int(1), &Type::Float, &scope).is_ok());
        let err = checker
            .check_type(&Value::string("x"), &Type::Int, &scope)
            .unwrap_err();
        assert_eq!(
            err,
            TypeCheckError::Mismatch {
                expected: "int".to_string(),
                actual: "string".to_string(),
            }
        );
    }

    #[test]
    fn test_check_type_nil_and_optional() {
        let checker = TypeChecker::new();
        let scope = TypeScope::new();
        assert!(checker
            .check_type(&Value::Nil, &Type::optional(Type::Int), &scope)
            .is_ok());
        assert!(checker.check_type(&Value::Nil, &Type::Int, &scope).is_err());
    }

    #[test]
    fn test_check_typed_array_elements() {
        let checker = TypeChecker::new();
        let scope = TypeScope::new();
        let ok = Value::array(vec![Value::Int(1), Value::Int(2)]);
        assert!(checker
            .check_type(&ok, &Type::array_of(Type::Int), &scope)
            .is_ok());

        let bad = Value::array(vec![Value::Int(1), Value::string("two")]);
        let err = checker
            .check_type(&bad, &Type::array_of(Type::Int), &scope)
            .unwrap_err();
        assert!(matches!(err, TypeCheckError::Element { index: 1, .. }));
    }

    #[test]
    fn test_validate_object_against_type_def() {
        let checker = checker_with_user();
        let scope = TypeScope::new();

        let ok = Value::object_from(vec![
            ("name", Value::string("ada")),
            ("age", Value::Int(36)),
            // Extra fields are allowed.
            ("nickname", Value::string("al")),
        ]);
        assert!(checker
            .check_type(&ok, &Type::named("User"), &scope)
            .is_ok());

        let missing = Value::object_from(vec![("name", Value::string("ada"))]);
        assert_eq!(
            checker
                .check_type(&missing, &Type::named("User"), &scope)
                .unwrap_err(),
            TypeCheckError::MissingField("age".to_string())
        );

        let wrong = Value::object_from(vec![
            ("name", Value::string("ada")),
            ("age", Value::string("old")),
        ]);
        assert!(matches!(
            checker
                .check_type(&wrong, &Type::named("User"), &scope)
                .unwrap_err(),
            TypeCheckError::Field { .. }
        ));
    }

    #[test]
    fn test_handler_types() {
        use crate::capability::Capability;
        use async_trait::async_trait;
        use std::sync::Arc;

        struct FakeDb;
        #[async_trait]
        impl Capability for FakeDb {
            async fn call(&self, _method: &str, _args: Vec<Value>) -> crate::error::EvalResult<Value> {
                Ok(Value::Nil)
            }
        }

        let checker = TypeChecker::new();
        let scope = TypeScope::new();
        let handler = Value::Handler(Arc::new(FakeDb));
        assert!(checker.check_type(&handler, &Type::Database, &scope).is_ok());
        assert!(checker.check_type(&Value::Int(1), &Type::Database, &scope).is_err());
    }
}
