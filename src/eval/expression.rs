use std::sync::Arc;

use async_recursion::async_recursion;
use tracing::debug;

use super::context::ExecutionContext;
use super::statement::{ControlFlow, StatementExecutor, StatementResult};
use crate::ast::{BinaryOp, CallExpr, Expr, Function, MatchCase, ObjectField, Statement, UnaryOp};
use crate::capability::method_allowed;
use crate::env::Environment;
use crate::error::{EvalError, EvalResult};
use crate::future::FutureValue;
use crate::pattern::match_pattern;
use crate::type_checker::{infer_type_arguments, instantiate_function};
use crate::value::{Closure, Value};

use super::builtins::Builtin;

#[derive(Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    #[async_recursion]
    pub async fn eval_expression(
        &self,
        expr: &Expr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let _depth = ctx.enter_depth()?;

        match expr {
            Expr::Literal(lit) => Ok(Value::from(lit)),
            Expr::Variable(name) => env.get(name).map_err(EvalError::from),
            Expr::Binary { op, left, right } => self.eval_binary_op(*op, left, right, env, ctx).await,
            Expr::Unary { op, operand } => self.eval_unary_op(*op, operand, env, ctx).await,
            Expr::FieldAccess { object, field } => {
                let object = self.eval_expression(object, env, ctx).await?;
                self.access_field(&object, field)
            }
            Expr::Index { object, index } => {
                let object = self.eval_expression(object, env, ctx).await?;
                let index = self.eval_expression(index, env, ctx).await?;
                self.eval_index(&object, &index)
            }
            Expr::Call(call) => self.eval_call(call, env, ctx).await,
            Expr::Object(fields) => self.eval_object(fields, env, ctx).await,
            Expr::Array(elements) => self.eval_array(elements, env, ctx).await,
            Expr::Lambda { params, body } => Ok(Value::Closure(Arc::new(Closure {
                params: params.clone(),
                body: body.clone(),
                env: env.clone(),
            }))),
            Expr::Async(body) => self.eval_async(body, env, ctx),
            Expr::Await(inner) => self.eval_await(inner, env, ctx).await,
            Expr::Match { value, cases } => self.eval_match(value, cases, env, ctx).await,
        }
    }

    pub async fn eval_args(
        &self,
        args: &[Expr],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval_expression(arg, env, ctx).await?);
        }
        Ok(values)
    }

    // Binary operators. The coercion policy is asymmetric on purpose and
    // preserved as observed behavior: + % == coerce mixed int/float, while
    // - * / and the orderings reject mixed numeric types.
    async fn eval_binary_op(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let left = self.eval_expression(left, env, ctx).await?;
        let right = self.eval_expression(right, env, ctx).await?;

        match op {
            BinaryOp::Add => self.eval_add(&left, &right),
            BinaryOp::Sub => self.eval_strict_arith(op, &left, &right),
            BinaryOp::Mul => self.eval_strict_arith(op, &left, &right),
            BinaryOp::Div => self.eval_strict_arith(op, &left, &right),
            BinaryOp::Mod => self.eval_mod(&left, &right),
            BinaryOp::Eq => Ok(Value::Bool(left.loose_equals(&right))),
            BinaryOp::Ne => Ok(Value::Bool(!left.loose_equals(&right))),
            BinaryOp::Lt => self.compare(op, &left, &right, |o| o.is_lt()),
            BinaryOp::Le => self.compare(op, &left, &right, |o| o.is_le()),
            BinaryOp::Gt => self.compare(op, &left, &right, |o| o.is_gt()),
            BinaryOp::Ge => self.compare(op, &left, &right, |o| o.is_ge()),
            BinaryOp::And => self.eval_logical(op, &left, &right),
            BinaryOp::Or => self.eval_logical(op, &left, &right),
        }
    }

    fn eval_add(&self, left: &Value, right: &Value) -> EvalResult<Value> {
        match (left, right) {
            (Value::String(l), Value::String(r)) => Ok(Value::String(format!("{}{}", l, r))),
            (Value::String(_), other) => Err(EvalError::InvalidOperation(format!(
                "cannot add string and {}",
                other.type_name()
            ))),
            (Value::Array(l), Value::Array(r)) => {
                // Non-mutating concatenation into a new array.
                let mut items = l.read().unwrap().clone();
                items.extend(r.read().unwrap().iter().cloned());
                Ok(Value::array(items))
            }
            (Value::Array(_), other) => Err(EvalError::InvalidOperation(format!(
                "cannot add array and {}",
                other.type_name()
            ))),
            (Value::Int(l), Value::Int(r)) => l
                .checked_add(*r)
                .map(Value::Int)
                .ok_or_else(|| EvalError::IntegerOverflow("addition".to_string())),
            (Value::Int(l), Value::Float(r)) => Ok(Value::Float(*l as f64 + r)),
            (Value::Float(l), Value::Int(r)) => Ok(Value::Float(l + *r as f64)),
            (Value::Float(l), Value::Float(r)) => Ok(Value::Float(l + r)),
            _ => Err(EvalError::InvalidOperation(format!(
                "cannot add {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    /// Subtraction, multiplication and division: both operands must already
    /// share one numeric type; a mixed int/float pair is an error, not a
    /// coercion.
    fn eval_strict_arith(&self, op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
        let verb = match op {
            BinaryOp::Sub => "subtract",
            BinaryOp::Mul => "multiply",
            _ => "divide",
        };

        match (left, right) {
            (Value::Int(l), Value::Int(r)) => match op {
                BinaryOp::Sub => l
                    .checked_sub(*r)
                    .map(Value::Int)
                    .ok_or_else(|| EvalError::IntegerOverflow("subtraction".to_string())),
                BinaryOp::Mul => l
                    .checked_mul(*r)
                    .map(Value::Int)
                    .ok_or_else(|| EvalError::IntegerOverflow("multiplication".to_string())),
                _ => {
                    if *r == 0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    l.checked_div(*r)
                        .map(Value::Int)
                        .ok_or_else(|| EvalError::IntegerOverflow("division".to_string()))
                }
            },
            (Value::Float(l), Value::Float(r)) => match op {
                BinaryOp::Sub => Ok(Value::Float(l - r)),
                BinaryOp::Mul => Ok(Value::Float(l * r)),
                _ => {
                    if *r == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    Ok(Value::Float(l / r))
                }
            },
            _ => Err(EvalError::InvalidOperation(format!(
                "cannot {} {} and {}",
                verb,
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    /// Modulo coerces mixed int/float like `+` does.
    fn eval_mod(&self, left: &Value, right: &Value) -> EvalResult<Value> {
        match (left, right) {
            (Value::Int(l), Value::Int(r)) => {
                if *r == 0 {
                    return Err(EvalError::ModuloByZero);
                }
                l.checked_rem(*r)
                    .map(Value::Int)
                    .ok_or_else(|| EvalError::IntegerOverflow("modulo".to_string()))
            }
            (Value::Int(l), Value::Float(r)) => self.float_mod(*l as f64, *r),
            (Value::Float(l), Value::Int(r)) => self.float_mod(*l, *r as f64),
            (Value::Float(l), Value::Float(r)) => self.float_mod(*l, *r),
            _ => Err(EvalError::InvalidOperation(format!(
                "cannot compute modulo of {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    fn float_mod(&self, left: f64, right: f64) -> EvalResult<Value> {
        if right == 0.0 {
            return Err(EvalError::ModuloByZero);
        }
        Ok(Value::Float(left % right))
    }

    /// Ordering comparisons are strict: int with int, float with float,
    /// string with string. Mixed numeric types are an error.
    fn compare(
        &self,
        op: BinaryOp,
        left: &Value,
        right: &Value,
        decide: impl Fn(std::cmp::Ordering) -> bool,
    ) -> EvalResult<Value> {
        let ordering = match (left, right) {
            (Value::Int(l), Value::Int(r)) => l.cmp(r),
            (Value::Float(l), Value::Float(r)) => {
                l.partial_cmp(r).ok_or_else(|| {
                    EvalError::InvalidOperation(format!("cannot order {} {} {}", l, op, r))
                })?
            }
            (Value::String(l), Value::String(r)) => l.cmp(r),
            _ => {
                return Err(EvalError::InvalidOperation(format!(
                    "cannot compare {} and {}",
                    left.type_name(),
                    right.type_name()
                )));
            }
        };
        Ok(Value::Bool(decide(ordering)))
    }

    fn eval_logical(&self, op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
        match (left, right) {
            (Value::Bool(l), Value::Bool(r)) => Ok(Value::Bool(match op {
                BinaryOp::And => *l && *r,
                _ => *l || *r,
            })),
            _ => Err(EvalError::InvalidOperation(format!(
                "logical {} requires boolean operands, got {} and {}",
                op,
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    async fn eval_unary_op(
        &self,
        op: UnaryOp,
        operand: &Expr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let value = self.eval_expression(operand, env, ctx).await?;
        match op {
            UnaryOp::Not => match value {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(EvalError::InvalidOperation(format!(
                    "logical NOT requires a boolean operand, got {}",
                    other.type_name()
                ))),
            },
            UnaryOp::Neg => match value {
                Value::Int(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| EvalError::IntegerOverflow("negation".to_string())),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(EvalError::InvalidOperation(format!(
                    "unary negation requires a numeric operand, got {}",
                    other.type_name()
                ))),
            },
        }
    }

    /// Field access: object entries by key, or a capability's named
    /// sub-handle (`db.users`). Anything else cannot be accessed.
    pub(super) fn access_field(&self, value: &Value, field: &str) -> EvalResult<Value> {
        match value {
            Value::Object(entries) => entries
                .read()
                .unwrap()
                .get(field)
                .cloned()
                .ok_or_else(|| EvalError::FieldNotFound(field.to_string())),
            Value::Handler(handler) => handler
                .table(field)
                .map(Value::Handler)
                .ok_or_else(|| EvalError::InvalidFieldAccess {
                    field: field.to_string(),
                    target: "handler".to_string(),
                }),
            other => Err(EvalError::InvalidFieldAccess {
                field: field.to_string(),
                target: other.type_name().to_string(),
            }),
        }
    }

    fn eval_index(&self, object: &Value, index: &Value) -> EvalResult<Value> {
        match (object, index) {
            (Value::Array(items), Value::Int(i)) => {
                let items = items.read().unwrap();
                if *i < 0 || *i as usize >= items.len() {
                    return Err(EvalError::IndexOutOfBounds {
                        index: *i,
                        len: items.len(),
                    });
                }
                Ok(items[*i as usize].clone())
            }
            (Value::Array(_), other) => Err(EvalError::InvalidOperation(format!(
                "array index must be an integer, got {}",
                other.type_name()
            ))),
            (Value::Object(entries), Value::String(key)) => entries
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| EvalError::KeyNotFound(key.clone())),
            (Value::Object(_), other) => Err(EvalError::InvalidOperation(format!(
                "object key must be a string, got {}",
                other.type_name()
            ))),
            (other, _) => Err(EvalError::InvalidOperation(format!(
                "cannot index {}",
                other.type_name()
            ))),
        }
    }

    async fn eval_object(
        &self,
        fields: &[ObjectField],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let mut entries = std::collections::HashMap::with_capacity(fields.len());
        for field in fields {
            let value = self.eval_expression(&field.value, env, ctx).await?;
            entries.insert(field.key.clone(), value);
        }
        Ok(Value::object(entries))
    }

    async fn eval_array(
        &self,
        elements: &[Expr],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let mut items = Vec::with_capacity(elements.len());
        for element in elements {
            items.push(self.eval_expression(element, env, ctx).await?);
        }
        Ok(Value::array(items))
    }

    /// `async { ... }` spawns the block on its own task and immediately
    /// returns a pending future. The block closes over the enclosing scope
    /// by reference (a child frame) and runs to completion unconditionally.
    fn eval_async(
        &self,
        body: &[Statement],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let future = FutureValue::pending();
        let handle = future.clone();
        let async_env = Environment::child(env);
        let async_ctx = Arc::new(ctx.fork());
        let body = body.to_vec();

        tokio::spawn(async move {
            let executor = StatementExecutor::new();
            match executor.execute_block(&body, &async_env, &async_ctx).await {
                Ok(StatementResult::Value(value)) => handle.resolve(value),
                Ok(StatementResult::Control(ControlFlow::Return(value))) => handle.resolve(value),
                Err(error) => {
                    debug!(%error, "async block rejected");
                    handle.reject(error);
                }
            }
        });

        Ok(Value::Future(future))
    }

    async fn eval_await(
        &self,
        inner: &Expr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let value = self.eval_expression(inner, env, ctx).await?;
        match value {
            Value::Future(future) => future.settled().await,
            other => Err(EvalError::AwaitTarget(other.type_name().to_string())),
        }
    }

    async fn eval_match(
        &self,
        value: &Expr,
        cases: &[MatchCase],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let value = self.eval_expression(value, env, ctx).await?;

        for case in cases {
            // Each case gets a fresh environment for its bindings.
            let case_env = Environment::child(env);
            if !match_pattern(&case.pattern, &value, &case_env)? {
                continue;
            }

            if let Some(guard) = &case.guard {
                match self.eval_expression(guard, &case_env, ctx).await? {
                    Value::Bool(true) => {}
                    // A false guard behaves as if the pattern had not matched.
                    Value::Bool(false) => continue,
                    other => {
                        return Err(EvalError::InvalidOperation(format!(
                            "match guard must evaluate to boolean, got {}",
                            other.type_name()
                        )));
                    }
                }
            }

            return self.eval_expression(&case.body, &case_env, ctx).await;
        }

        // Non-exhaustive matches are not an error.
        Ok(Value::Nil)
    }

    /// Call dispatch order: builtin registry, dotted paths, then plain
    /// user-defined functions and closures.
    pub async fn eval_call(
        &self,
        call: &CallExpr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        if let Ok(builtin) = call.name.parse::<Builtin>() {
            return self.eval_builtin(builtin, call, env, ctx).await;
        }

        if call.name.contains('.') {
            return self.eval_path_call(call, env, ctx).await;
        }

        let target = env
            .get(&call.name)
            .map_err(|_| EvalError::UnknownFunction(call.name.clone()))?;
        let args = self.eval_args(&call.args, env, ctx).await?;

        match target {
            Value::Function(func) => {
                if func.type_params.is_empty() {
                    if !call.type_args.is_empty() {
                        return Err(crate::type_checker::TypeCheckError::TypeArgArity {
                            name: func.name.clone(),
                            expected: 0,
                            actual: call.type_args.len(),
                        }
                        .into());
                    }
                    self.invoke_function(&func, args, env, ctx).await
                } else {
                    self.call_generic(&func, &call.type_args, args, env, ctx).await
                }
            }
            Value::Closure(closure) => self.invoke_closure(&closure, args, ctx).await,
            _ => Err(EvalError::NotCallable(call.name.clone())),
        }
    }

    /// Resolves `a.b.c(...)`: walks intermediate fields, then invokes the
    /// terminal segment — a function stored in an object namespace, or an
    /// allow-listed method on an injected handler.
    async fn eval_path_call(
        &self,
        call: &CallExpr,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let segments: Vec<&str> = call.name.split('.').collect();
        let root = env
            .get(segments[0])
            .map_err(|_| EvalError::Eval(format!("undefined object: {}", segments[0])))?;

        let mut current = root;
        for segment in &segments[1..segments.len() - 1] {
            current = self.access_field(&current, segment)?;
        }
        let method = segments[segments.len() - 1];

        // array.length() without arguments
        if method == "length" {
            if let Value::Array(items) = &current {
                if !call.args.is_empty() {
                    return Err(EvalError::Arity {
                        name: "length".to_string(),
                        expected: 0,
                        actual: call.args.len(),
                    });
                }
                let len = items.read().unwrap().len();
                return Ok(Value::Int(len as i64));
            }
        }

        match &current {
            Value::Object(entries) => {
                let callee = entries.read().unwrap().get(method).cloned();
                match callee {
                    Some(callee @ (Value::Function(_) | Value::Closure(_))) => {
                        let args = self.eval_args(&call.args, env, ctx).await?;
                        self.call_value(&callee, args, env, ctx).await
                    }
                    Some(_) => Err(EvalError::NotCallable(call.name.clone())),
                    None => Err(EvalError::FieldNotFound(method.to_string())),
                }
            }
            Value::Handler(handler) => {
                // The allow-list is the security boundary: arbitrary method
                // invocation on host objects is never permitted.
                if !method_allowed(method) {
                    return Err(EvalError::MethodNotAllowed(method.to_string()));
                }
                let args = self.eval_args(&call.args, env, ctx).await?;
                debug!(method, "dispatching handler method");
                handler.call(method, args).await
            }
            other => Err(EvalError::InvalidFieldAccess {
                field: method.to_string(),
                target: other.type_name().to_string(),
            }),
        }
    }

    /// Invokes any callable value with already-evaluated arguments. Used by
    /// higher-order builtins and namespace calls.
    pub(crate) async fn call_value(
        &self,
        callee: &Value,
        args: Vec<Value>,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        match callee {
            Value::Function(func) => {
                if func.type_params.is_empty() {
                    self.invoke_function(func, args, env, ctx).await
                } else {
                    self.call_generic(func, &[], args, env, ctx).await
                }
            }
            Value::Closure(closure) => self.invoke_closure(closure, args, ctx).await,
            other => Err(EvalError::NotCallable(other.type_name().to_string())),
        }
    }

    /// Executes a concrete (non-generic or already instantiated) function:
    /// arity check, per-argument type checks, fresh child environment,
    /// Return absorbed into the result, declared return type enforced.
    pub(crate) async fn invoke_function(
        &self,
        func: &Function,
        args: Vec<Value>,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        if args.len() != func.params.len() {
            return Err(EvalError::Arity {
                name: func.name.clone(),
                expected: func.params.len(),
                actual: args.len(),
            });
        }

        let fn_env = Environment::child(env);
        for (position, (param, value)) in func.params.iter().zip(args).enumerate() {
            if let Some(annotation) = &param.type_annotation {
                ctx.check_type(&value, annotation).map_err(|error| {
                    EvalError::Eval(format!(
                        "argument {} ({}): {}",
                        position + 1,
                        param.name,
                        error
                    ))
                })?;
            }
            fn_env.define(&param.name, value)?;
        }

        let executor = StatementExecutor::new();
        let result = match executor.execute_block(&func.body, &fn_env, ctx).await? {
            StatementResult::Value(value) => value,
            StatementResult::Control(ControlFlow::Return(value)) => value,
        };

        if let Some(return_type) = &func.return_type {
            ctx.check_type(&result, return_type).map_err(|error| {
                EvalError::Eval(format!(
                    "return type mismatch in function {}: {}",
                    func.name, error
                ))
            })?;
        }

        Ok(result)
    }

    /// Generic call path: resolve type arguments (explicit or inferred),
    /// instantiate, push the bindings for the call's duration, and pop them
    /// again on every exit path.
    async fn call_generic(
        &self,
        func: &Function,
        type_args: &[crate::ast::Type],
        args: Vec<Value>,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let resolved = if type_args.is_empty() {
            infer_type_arguments(func, &args).map_err(|error| {
                EvalError::Eval(format!(
                    "cannot infer type arguments for generic function {}: {}",
                    func.name, error
                ))
            })?
        } else {
            type_args.to_vec()
        };

        let (concrete, bindings) =
            ctx.with_type_scope(|scope| instantiate_function(func, &resolved, scope))?;

        ctx.push_type_scope(bindings);
        let result = self.invoke_function(&concrete, args, env, ctx).await;
        ctx.pop_type_scope();
        result
    }

    async fn invoke_closure(
        &self,
        closure: &Closure,
        args: Vec<Value>,
        ctx: &Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        if args.len() != closure.params.len() {
            return Err(EvalError::Arity {
                name: "closure".to_string(),
                expected: closure.params.len(),
                actual: args.len(),
            });
        }

        let fn_env = Environment::child(&closure.env);
        for (param, value) in closure.params.iter().zip(args) {
            if let Some(annotation) = &param.type_annotation {
                ctx.check_type(&value, annotation)?;
            }
            fn_env.define(&param.name, value)?;
        }

        let executor = StatementExecutor::new();
        match executor.execute_block(&closure.body, &fn_env, ctx).await? {
            StatementResult::Value(value) => Ok(value),
            StatementResult::Control(ControlFlow::Return(value)) => Ok(value),
        }
    }
}
