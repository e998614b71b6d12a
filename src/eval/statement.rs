use std::sync::Arc;

use async_recursion::async_recursion;

use super::context::ExecutionContext;
use super::expression::ExpressionEvaluator;
use crate::ast::{CallExpr, Expr, Statement, SwitchCase};
use crate::env::Environment;
use crate::error::{EvalError, EvalResult};
use crate::value::Value;

/// Outcome of executing a statement.
///
/// `Return` is a control transfer, not an error: it unwinds through blocks
/// and loops until the owning function/route/task boundary absorbs it into
/// that unit's result. There are deliberately no other control variants.
#[derive(Debug, Clone)]
pub enum StatementResult {
    Value(Value),
    Control(ControlFlow),
}

#[derive(Debug, Clone)]
pub enum ControlFlow {
    Return(Value),
}

#[derive(Default)]
pub struct StatementExecutor {
    expressions: ExpressionEvaluator,
}

impl StatementExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes statements in order. The block's value is the last
    /// statement's value; a `Return` stops execution and propagates.
    pub async fn execute_block(
        &self,
        statements: &[Statement],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let mut last = Value::Nil;
        for statement in statements {
            match self.execute_statement(statement, env, ctx).await? {
                StatementResult::Value(value) => last = value,
                control @ StatementResult::Control(_) => return Ok(control),
            }
        }
        Ok(StatementResult::Value(last))
    }

    #[async_recursion]
    pub async fn execute_statement(
        &self,
        statement: &Statement,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        match statement {
            Statement::Assign { target, value } => self.execute_assign(target, value, env, ctx).await,
            Statement::Reassign { target, value } => {
                let value = self.expressions.eval_expression(value, env, ctx).await?;
                env.set(target, value)?;
                Ok(StatementResult::Value(Value::Nil))
            }
            Statement::IndexAssign {
                target,
                index,
                value,
            } => self.execute_index_assign(target, index, value, env, ctx).await,
            Statement::Return(expr) => {
                let value = self.expressions.eval_expression(expr, env, ctx).await?;
                Ok(StatementResult::Control(ControlFlow::Return(value)))
            }
            Statement::If {
                condition,
                then_block,
                else_block,
            } => self.execute_if(condition, then_block, else_block.as_deref(), env, ctx).await,
            Statement::While { condition, body } => {
                self.execute_while(condition, body, env, ctx).await
            }
            Statement::For {
                key_var,
                value_var,
                iterable,
                body,
            } => {
                self.execute_for(key_var.as_deref(), value_var, iterable, body, env, ctx)
                    .await
            }
            Statement::Switch {
                value,
                cases,
                default,
            } => self.execute_switch(value, cases, default.as_deref(), env, ctx).await,
            Statement::Validation(call) => self.execute_validation(call, env, ctx).await,
            Statement::Expression(expr) => Ok(StatementResult::Value(
                self.expressions.eval_expression(expr, env, ctx).await?,
            )),
        }
    }

    /// Declares a new binding, or updates an ancestor's binding when one
    /// exists. Redeclaring in the same frame is an error (never silently
    /// shadowed, never silently overwritten).
    async fn execute_assign(
        &self,
        target: &str,
        value: &Expr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let value = self.expressions.eval_expression(value, env, ctx).await?;
        if env.has_local(target) {
            return Err(EvalError::Env(crate::env::EnvError::Redeclared(
                target.to_string(),
            )));
        }
        if env.has(target) {
            env.set(target, value)?;
        } else {
            env.define(target, value)?;
        }
        Ok(StatementResult::Value(Value::Nil))
    }

    async fn execute_index_assign(
        &self,
        target: &Expr,
        index: &Expr,
        value: &Expr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let collection = self.expressions.eval_expression(target, env, ctx).await?;
        let index = self.expressions.eval_expression(index, env, ctx).await?;
        let value = self.expressions.eval_expression(value, env, ctx).await?;

        match (&collection, &index) {
            (Value::Array(items), Value::Int(i)) => {
                let mut items = items.write().unwrap();
                if *i < 0 || *i as usize >= items.len() {
                    return Err(EvalError::IndexOutOfBounds {
                        index: *i,
                        len: items.len(),
                    });
                }
                items[*i as usize] = value;
            }
            (Value::Array(_), other) => {
                return Err(EvalError::InvalidOperation(format!(
                    "array index must be an integer, got {}",
                    other.type_name()
                )));
            }
            (Value::Object(entries), Value::String(key)) => {
                entries.write().unwrap().insert(key.clone(), value);
            }
            (Value::Object(_), other) => {
                return Err(EvalError::InvalidOperation(format!(
                    "object key must be a string, got {}",
                    other.type_name()
                )));
            }
            (other, _) => {
                return Err(EvalError::InvalidOperation(format!(
                    "cannot index {}",
                    other.type_name()
                )));
            }
        }
        Ok(StatementResult::Value(Value::Nil))
    }

    async fn execute_if(
        &self,
        condition: &Expr,
        then_block: &[Statement],
        else_block: Option<&[Statement]>,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let condition = self.expressions.eval_expression(condition, env, ctx).await?;
        match condition {
            Value::Bool(true) => {
                let branch_env = Environment::child(env);
                self.execute_block(then_block, &branch_env, ctx).await
            }
            Value::Bool(false) => match else_block {
                Some(block) => {
                    let branch_env = Environment::child(env);
                    self.execute_block(block, &branch_env, ctx).await
                }
                None => Ok(StatementResult::Value(Value::Nil)),
            },
            other => Err(EvalError::InvalidOperation(format!(
                "if condition must be a boolean, got {}",
                other.type_name()
            ))),
        }
    }

    async fn execute_while(
        &self,
        condition: &Expr,
        body: &[Statement],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let mut last = Value::Nil;
        loop {
            let condition = self.expressions.eval_expression(condition, env, ctx).await?;
            match condition {
                Value::Bool(true) => {}
                Value::Bool(false) => break,
                other => {
                    return Err(EvalError::InvalidOperation(format!(
                        "while condition must be a boolean, got {}",
                        other.type_name()
                    )));
                }
            }

            let iteration_env = Environment::child(env);
            match self.execute_block(body, &iteration_env, ctx).await? {
                StatementResult::Value(value) => last = value,
                control @ StatementResult::Control(_) => return Ok(control),
            }
        }
        Ok(StatementResult::Value(last))
    }

    async fn execute_for(
        &self,
        key_var: Option<&str>,
        value_var: &str,
        iterable: &Expr,
        body: &[Statement],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let iterable = self.expressions.eval_expression(iterable, env, ctx).await?;
        let mut last = Value::Nil;

        match &iterable {
            Value::Array(items) => {
                let items = items.read().unwrap().clone();
                for (index, item) in items.into_iter().enumerate() {
                    let iteration_env = Environment::child(env);
                    if let Some(key_var) = key_var {
                        iteration_env.define(key_var, Value::Int(index as i64))?;
                    }
                    iteration_env.define(value_var, item)?;

                    match self.execute_block(body, &iteration_env, ctx).await? {
                        StatementResult::Value(value) => last = value,
                        control @ StatementResult::Control(_) => return Ok(control),
                    }
                }
            }
            Value::Object(entries) => {
                let entries: Vec<(String, Value)> = entries
                    .read()
                    .unwrap()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (key, item) in entries {
                    let iteration_env = Environment::child(env);
                    if let Some(key_var) = key_var {
                        iteration_env.define(key_var, Value::String(key))?;
                    }
                    iteration_env.define(value_var, item)?;

                    match self.execute_block(body, &iteration_env, ctx).await? {
                        StatementResult::Value(value) => last = value,
                        control @ StatementResult::Control(_) => return Ok(control),
                    }
                }
            }
            other => {
                return Err(EvalError::InvalidOperation(format!(
                    "for loop iterable must be an array or object, got {}",
                    other.type_name()
                )));
            }
        }

        Ok(StatementResult::Value(last))
    }

    async fn execute_switch(
        &self,
        value: &Expr,
        cases: &[SwitchCase],
        default: Option<&[Statement]>,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let discriminant = self.expressions.eval_expression(value, env, ctx).await?;

        for case in cases {
            let case_value = self.expressions.eval_expression(&case.value, env, ctx).await?;
            // Same coercion-tolerant equality as `==`; first match only,
            // no fallthrough.
            if discriminant.loose_equals(&case_value) {
                let case_env = Environment::child(env);
                return self.execute_block(&case.body, &case_env, ctx).await;
            }
        }

        match default {
            Some(block) => {
                let default_env = Environment::child(env);
                self.execute_block(block, &default_env, ctx).await
            }
            None => Ok(StatementResult::Value(Value::Nil)),
        }
    }

    /// A failed or non-boolean validation result becomes the distinguished
    /// validation error so dispatchers can render a client-facing error.
    async fn execute_validation(
        &self,
        call: &CallExpr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let result = self.expressions.eval_call(call, env, ctx).await;
        match result {
            Err(error) => Err(EvalError::Validation(error.to_string())),
            Ok(Value::Bool(true)) | Ok(Value::Ok(_)) | Ok(Value::Nil) => {
                Ok(StatementResult::Value(Value::Nil))
            }
            Ok(Value::Bool(false)) => Err(EvalError::Validation(format!(
                "validation failed: {}",
                call.name
            ))),
            Ok(Value::Err(inner)) => Err(EvalError::Validation(inner.to_string())),
            Ok(other) => Err(EvalError::Validation(format!(
                "validation function {} returned unexpected type {}",
                call.name,
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Field, Function, Literal, Type};
    use crate::config::EngineConfig;
    use crate::type_checker::TypeChecker;
    use pretty_assertions::assert_eq;

    fn setup() -> (StatementExecutor, Arc<Environment>, Arc<ExecutionContext>) {
        let ctx = Arc::new(ExecutionContext::new(
            Arc::new(TypeChecker::new()),
            EngineConfig::default(),
        ));
        (StatementExecutor::new(), Environment::new(), ctx)
    }

    fn assign(target: &str, value: Expr) -> Statement {
        Statement::Assign {
            target: target.to_string(),
            value,
        }
    }

    fn reassign(target: &str, value: Expr) -> Statement {
        Statement::Reassign {
            target: target.to_string(),
            value,
        }
    }

    async fn run(
        executor: &StatementExecutor,
        statements: &[Statement],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        executor.execute_block(statements, env, ctx).await
    }

    #[tokio::test]
    async fn test_assign_then_redeclare_fails() {
        let (executor, env, ctx) = setup();
        let block = vec![assign("x", Expr::int(1)), assign("x", Expr::int(2))];
        let err = run(&executor, &block, &env, &ctx).await.unwrap_err();
        assert_eq!(
            err,
            EvalError::Env(crate::env::EnvError::Redeclared("x".to_string()))
        );
    }

    #[tokio::test]
    async fn test_assign_updates_ancestor_binding() {
        let (executor, env, ctx) = setup();
        env.define("counter", Value::Int(0)).unwrap();

        let child = Environment::child(&env);
        run(&executor, &[assign("counter", Expr::int(5))], &child, &ctx)
            .await
            .unwrap();

        drop(child);
        assert_eq!(env.get("counter").unwrap(), Value::Int(5));
    }

    #[tokio::test]
    async fn test_reassign_requires_existing_binding() {
        let (executor, env, ctx) = setup();
        let err = run(&executor, &[reassign("ghost", Expr::int(1))], &env, &ctx)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EvalError::Env(crate::env::EnvError::Undefined("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_return_unwinds_through_blocks_and_loops() {
        let (executor, env, ctx) = setup();
        let block = vec![
            assign("x", Expr::int(0)),
            Statement::While {
                condition: Expr::bool(true),
                body: vec![Statement::Return(Expr::int(99))],
            },
            // Never reached.
            Statement::Expression(Expr::int(1)),
        ];
        let result = run(&executor, &block, &env, &ctx).await.unwrap();
        assert!(matches!(
            result,
            StatementResult::Control(ControlFlow::Return(Value::Int(99)))
        ));
    }

    #[tokio::test]
    async fn test_if_requires_boolean_and_scopes_branches() {
        let (executor, env, ctx) = setup();
        env.define("x", Value::Int(1)).unwrap();

        // The branch may read enclosing bindings and shadow them locally
        // without touching the parent.
        let block = vec![Statement::If {
            condition: Expr::binary(BinaryOp::Eq, Expr::var("x"), Expr::int(1)),
            then_block: vec![assign("y", Expr::int(10)), Statement::Expression(Expr::var("y"))],
            else_block: None,
        }];
        let result = run(&executor, &block, &env, &ctx).await.unwrap();
        assert!(matches!(result, StatementResult::Value(Value::Int(10))));
        assert!(!env.has("y"));

        let err = run(
            &executor,
            &[Statement::If {
                condition: Expr::int(1),
                then_block: vec![],
                else_block: None,
            }],
            &env,
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("if condition must be a boolean"));
    }

    #[tokio::test]
    async fn test_while_loop_counts() {
        let (executor, env, ctx) = setup();
        let block = vec![
            assign("i", Expr::int(0)),
            Statement::While {
                condition: Expr::binary(BinaryOp::Lt, Expr::var("i"), Expr::int(5)),
                body: vec![assign("i", Expr::binary(BinaryOp::Add, Expr::var("i"), Expr::int(1)))],
            },
        ];
        run(&executor, &block, &env, &ctx).await.unwrap();
        assert_eq!(env.get("i").unwrap(), Value::Int(5));
    }

    #[tokio::test]
    async fn test_for_over_array_sums_and_does_not_leak() {
        let (executor, env, ctx) = setup();
        let block = vec![
            assign("sum", Expr::int(0)),
            Statement::For {
                key_var: None,
                value_var: "n".to_string(),
                iterable: Expr::Array(vec![Expr::int(1), Expr::int(2), Expr::int(3)]),
                body: vec![assign(
                    "sum",
                    Expr::binary(BinaryOp::Add, Expr::var("sum"), Expr::var("n")),
                )],
            },
        ];
        run(&executor, &block, &env, &ctx).await.unwrap();
        assert_eq!(env.get("sum").unwrap(), Value::Int(6));
        // Loop bindings do not leak into the enclosing scope.
        assert!(!env.has("n"));
    }

    #[tokio::test]
    async fn test_for_key_sequence_over_array() {
        let (executor, env, ctx) = setup();
        let block = vec![
            assign("keys", Expr::Array(vec![])),
            Statement::For {
                key_var: Some("i".to_string()),
                value_var: "v".to_string(),
                iterable: Expr::Array(vec![Expr::int(10), Expr::int(20), Expr::int(30)]),
                body: vec![assign(
                    "keys",
                    Expr::Call(CallExpr::new("append", vec![Expr::var("keys"), Expr::var("i")])),
                )],
            },
        ];
        run(&executor, &block, &env, &ctx).await.unwrap();
        assert_eq!(
            env.get("keys").unwrap(),
            Value::array(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
    }

    #[tokio::test]
    async fn test_for_over_object_binds_keys_and_values() {
        let (executor, env, ctx) = setup();
        env.define(
            "obj",
            Value::object_from(vec![("a", Value::Int(1)), ("b", Value::Int(2))]),
        )
        .unwrap();
        let block = vec![
            assign("total", Expr::int(0)),
            assign("seen", Expr::Array(vec![])),
            Statement::For {
                key_var: Some("k".to_string()),
                value_var: "v".to_string(),
                iterable: Expr::var("obj"),
                body: vec![
                    assign(
                        "total",
                        Expr::binary(BinaryOp::Add, Expr::var("total"), Expr::var("v")),
                    ),
                    assign(
                        "seen",
                        Expr::Call(CallExpr::new(
                            "append",
                            vec![Expr::var("seen"), Expr::var("k")],
                        )),
                    ),
                ],
            },
        ];
        run(&executor, &block, &env, &ctx).await.unwrap();
        assert_eq!(env.get("total").unwrap(), Value::Int(3));
        if let Value::Array(items) = env.get("seen").unwrap() {
            assert_eq!(items.read().unwrap().len(), 2);
        } else {
            panic!("expected array of keys");
        }
    }

    #[tokio::test]
    async fn test_for_requires_iterable() {
        let (executor, env, ctx) = setup();
        let err = run(
            &executor,
            &[Statement::For {
                key_var: None,
                value_var: "v".to_string(),
                iterable: Expr::int(5),
                body: vec![],
            }],
            &env,
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("must be an array or object"));
    }

    #[tokio::test]
    async fn test_switch_executes_first_match_only() {
        let (executor, env, ctx) = setup();
        let block = vec![
            assign("hits", Expr::Array(vec![])),
            Statement::Switch {
                value: Expr::int(1),
                cases: vec![
                    SwitchCase {
                        value: Expr::int(1),
                        body: vec![assign(
                            "hits",
                            Expr::Call(CallExpr::new(
                                "append",
                                vec![Expr::var("hits"), Expr::string("first")],
                            )),
                        )],
                    },
                    // Identical case value: must not run (no fallthrough).
                    SwitchCase {
                        value: Expr::int(1),
                        body: vec![assign(
                            "hits",
                            Expr::Call(CallExpr::new(
                                "append",
                                vec![Expr::var("hits"), Expr::string("second")],
                            )),
                        )],
                    },
                ],
                default: None,
            },
        ];
        run(&executor, &block, &env, &ctx).await.unwrap();
        assert_eq!(
            env.get("hits").unwrap(),
            Value::array(vec![Value::string("first")])
        );
    }

    #[tokio::test]
    async fn test_switch_coercion_and_default() {
        let (executor, env, ctx) = setup();

        // Int discriminant matches a float case under loose equality.
        let block = vec![Statement::Switch {
            value: Expr::int(2),
            cases: vec![SwitchCase {
                value: Expr::float(2.0),
                body: vec![Statement::Expression(Expr::string("matched"))],
            }],
            default: None,
        }];
        let result = run(&executor, &block, &env, &ctx).await.unwrap();
        assert!(matches!(
            result,
            StatementResult::Value(Value::String(ref s)) if s == "matched"
        ));

        let block = vec![Statement::Switch {
            value: Expr::int(9),
            cases: vec![SwitchCase {
                value: Expr::int(1),
                body: vec![],
            }],
            default: Some(vec![Statement::Expression(Expr::string("fallback"))]),
        }];
        let result = run(&executor, &block, &env, &ctx).await.unwrap();
        assert!(matches!(
            result,
            StatementResult::Value(Value::String(ref s)) if s == "fallback"
        ));
    }

    #[tokio::test]
    async fn test_index_assign_array() {
        let (executor, env, ctx) = setup();
        env.define("arr", Value::array(vec![Value::Int(1), Value::Int(2)]))
            .unwrap();

        run(
            &executor,
            &[Statement::IndexAssign {
                target: Expr::var("arr"),
                index: Expr::int(1),
                value: Expr::int(42),
            }],
            &env,
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(
            env.get("arr").unwrap(),
            Value::array(vec![Value::Int(1), Value::Int(42)])
        );

        for bad_index in [Expr::int(-1), Expr::int(5)] {
            let err = run(
                &executor,
                &[Statement::IndexAssign {
                    target: Expr::var("arr"),
                    index: bad_index,
                    value: Expr::int(0),
                }],
                &env,
                &ctx,
            )
            .await
            .unwrap_err();
            assert!(matches!(err, EvalError::IndexOutOfBounds { .. }));
        }
    }

    #[tokio::test]
    async fn test_index_assign_nested_object() {
        let (executor, env, ctx) = setup();
        env.define(
            "user",
            Value::object_from(vec![(
                "scores",
                Value::array(vec![Value::Int(0), Value::Int(0)]),
            )]),
        )
        .unwrap();

        run(
            &executor,
            &[Statement::IndexAssign {
                target: Expr::field(Expr::var("user"), "scores"),
                index: Expr::int(0),
                value: Expr::int(7),
            }],
            &env,
            &ctx,
        )
        .await
        .unwrap();

        let expected = Value::object_from(vec![(
            "scores",
            Value::array(vec![Value::Int(7), Value::Int(0)]),
        )]);
        assert_eq!(env.get("user").unwrap(), expected);
    }

    #[tokio::test]
    async fn test_index_assign_object_key() {
        let (executor, env, ctx) = setup();
        env.define("obj", Value::object_from(vec![])).unwrap();

        run(
            &executor,
            &[Statement::IndexAssign {
                target: Expr::var("obj"),
                index: Expr::string("k"),
                value: Expr::string("v"),
            }],
            &env,
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(
            env.get("obj").unwrap(),
            Value::object_from(vec![("k", Value::string("v"))])
        );

        let err = run(
            &executor,
            &[Statement::IndexAssign {
                target: Expr::int(3),
                index: Expr::int(0),
                value: Expr::int(0),
            }],
            &env,
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cannot index"));
    }

    fn is_positive_fn() -> Function {
        Function {
            name: "isPositive".to_string(),
            type_params: vec![],
            params: vec![Field::required("n", Type::Int)],
            return_type: Some(Type::Bool),
            body: vec![Statement::Return(Expr::binary(
                BinaryOp::Gt,
                Expr::var("n"),
                Expr::int(0),
            ))],
        }
    }

    #[tokio::test]
    async fn test_validation_statement() {
        let (executor, env, ctx) = setup();
        env.define("isPositive", Value::Function(Arc::new(is_positive_fn())))
            .unwrap();

        // Passing validation is invisible.
        run(
            &executor,
            &[Statement::Validation(CallExpr::new(
                "isPositive",
                vec![Expr::int(5)],
            ))],
            &env,
            &ctx,
        )
        .await
        .unwrap();

        // A false result is the distinguished validation error.
        let err = run(
            &executor,
            &[Statement::Validation(CallExpr::new(
                "isPositive",
                vec![Expr::int(-5)],
            ))],
            &env,
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "validation failed: validation failed: isPositive");
    }

    #[tokio::test]
    async fn test_validation_wraps_call_errors() {
        let (executor, env, ctx) = setup();
        let err = run(
            &executor,
            &[Statement::Validation(CallExpr::new("missingFn", vec![]))],
            &env,
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_expression_statement_yields_value() {
        let (executor, env, ctx) = setup();
        let result = run(
            &executor,
            &[Statement::Expression(Expr::Literal(Literal::Int(5)))],
            &env,
            &ctx,
        )
        .await
        .unwrap();
        assert!(matches!(result, StatementResult::Value(Value::Int(5))));
    }
}
