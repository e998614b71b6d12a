//! Property coverage for the numeric-coercion asymmetry: `+`, `%` and `==`
//! coerce mixed int/float operands, while `-`, `*`, `/` and the ordering
//! comparisons reject them. The asymmetry is a contract, not a bug.

use std::sync::Arc;

use proptest::prelude::*;

use rill::ast::{BinaryOp, Expr, Literal};
use rill::eval::{ExecutionContext, ExpressionEvaluator};
use rill::type_checker::TypeChecker;
use rill::{EngineConfig, Environment, Value};

fn eval_binary(op: BinaryOp, left: Literal, right: Literal) -> Result<Value, rill::EvalError> {
    let ctx = Arc::new(ExecutionContext::new(
        Arc::new(TypeChecker::new()),
        EngineConfig::default(),
    ));
    let env = Environment::new();
    let evaluator = ExpressionEvaluator::new();
    let expr = Expr::binary(op, Expr::Literal(left), Expr::Literal(right));
    futures::executor::block_on(evaluator.eval_expression(&expr, &env, &ctx))
}

proptest! {
    #[test]
    fn mixed_addition_always_succeeds_as_float(a in -1_000_000i64..1_000_000, b in -1.0e12f64..1.0e12) {
        let result = eval_binary(BinaryOp::Add, Literal::Int(a), Literal::Float(b)).unwrap();
        prop_assert_eq!(result, Value::Float(a as f64 + b));
    }

    #[test]
    fn mixed_strict_arithmetic_always_fails(a in any::<i64>(), b in any::<f64>()) {
        for op in [BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div] {
            prop_assert!(eval_binary(op, Literal::Int(a), Literal::Float(b)).is_err());
            prop_assert!(eval_binary(op, Literal::Float(b), Literal::Int(a)).is_err());
        }
    }

    #[test]
    fn mixed_ordering_always_fails(a in any::<i64>(), b in any::<f64>()) {
        for op in [BinaryOp::Lt, BinaryOp::Le, BinaryOp::Gt, BinaryOp::Ge] {
            prop_assert!(eval_binary(op, Literal::Int(a), Literal::Float(b)).is_err());
        }
    }

    #[test]
    fn division_and_modulo_by_zero_always_fail(a in any::<i64>()) {
        prop_assert!(eval_binary(BinaryOp::Div, Literal::Int(a), Literal::Int(0)).is_err());
        prop_assert!(eval_binary(BinaryOp::Mod, Literal::Int(a), Literal::Int(0)).is_err());
    }

    #[test]
    fn integer_division_truncates_toward_zero(a in any::<i64>(), b in any::<i64>()) {
        prop_assume!(b != 0);
        prop_assume!(!(a == i64::MIN && b == -1));
        let result = eval_binary(BinaryOp::Div, Literal::Int(a), Literal::Int(b)).unwrap();
        prop_assert_eq!(result, Value::Int(a / b));
        let result = eval_binary(BinaryOp::Mod, Literal::Int(a), Literal::Int(b)).unwrap();
        prop_assert_eq!(result, Value::Int(a % b));
    }

    #[test]
    fn equality_coerces_mixed_numbers(a in -1_000_000i64..1_000_000) {
        let result = eval_binary(BinaryOp::Eq, Literal::Int(a), Literal::Float(a as f64)).unwrap();
        prop_assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn string_concatenation_only_accepts_strings(a in ".*", b in any::<i64>()) {
        let ok = eval_binary(
            BinaryOp::Add,
            Literal::String(a.clone()),
            Literal::String(a.clone()),
        )
        .unwrap();
        prop_assert_eq!(ok, Value::String(format!("{}{}", a, a)));
        prop_assert!(eval_binary(BinaryOp::Add, Literal::String(a), Literal::Int(b)).is_err());
    }
}
