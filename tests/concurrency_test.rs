use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use rill::ast::*;
use rill::eval::{ExecutionContext, ExpressionEvaluator};
use rill::future::{all, race, run_async, FutureValue};
use rill::type_checker::TypeChecker;
use rill::{EngineConfig, Environment, EvalError, Value};

fn setup() -> (ExpressionEvaluator, Arc<Environment>, Arc<ExecutionContext>) {
    let ctx = Arc::new(ExecutionContext::new(
        Arc::new(TypeChecker::new()),
        EngineConfig::default(),
    ));
    (ExpressionEvaluator::new(), Environment::new(), ctx)
}

#[tokio::test]
async fn test_async_block_returns_future_immediately() {
    let (evaluator, env, ctx) = setup();

    let expr = Expr::Async(vec![Statement::Return(Expr::int(42))]);
    let value = evaluator.eval_expression(&expr, &env, &ctx).await.unwrap();

    // Pending or already resolved, depending on scheduling; never rejected.
    let Value::Future(future) = value else {
        panic!("async block must evaluate to a future");
    };
    assert!(!future.is_rejected());
    assert_eq!(future.settled().await.unwrap(), Value::Int(42));
}

#[tokio::test]
async fn test_await_yields_async_block_value() {
    let (evaluator, env, ctx) = setup();

    let expr = Expr::Await(Box::new(Expr::Async(vec![
        Statement::Assign {
            target: "x".to_string(),
            value: Expr::int(40),
        },
        Statement::Return(Expr::binary(BinaryOp::Add, Expr::var("x"), Expr::int(2))),
    ])));
    assert_eq!(
        evaluator.eval_expression(&expr, &env, &ctx).await.unwrap(),
        Value::Int(42)
    );
}

#[tokio::test]
async fn test_async_block_mutates_captured_aggregate() {
    let (evaluator, env, ctx) = setup();
    env.define("shared", Value::object_from(vec![])).unwrap();

    // The async block writes through the captured reference; after await,
    // the enclosing scope observes the mutation.
    let block = Expr::Async(vec![Statement::IndexAssign {
        target: Expr::var("shared"),
        index: Expr::string("from_task"),
        value: Expr::int(1),
    }]);
    let future = evaluator.eval_expression(&block, &env, &ctx).await.unwrap();
    env.define("f", future).unwrap();

    evaluator
        .eval_expression(&Expr::Await(Box::new(Expr::var("f"))), &env, &ctx)
        .await
        .unwrap();

    assert_eq!(
        env.get("shared").unwrap(),
        Value::object_from(vec![("from_task", Value::Int(1))])
    );
}

#[tokio::test]
async fn test_many_observers_of_one_future() {
    let (evaluator, env, ctx) = setup();

    let block = Expr::Async(vec![Statement::Return(Expr::string("payload"))]);
    let future = evaluator.eval_expression(&block, &env, &ctx).await.unwrap();
    env.define("f", future).unwrap();

    for _ in 0..4 {
        let value = evaluator
            .eval_expression(&Expr::Await(Box::new(Expr::var("f"))), &env, &ctx)
            .await
            .unwrap();
        assert_eq!(value, Value::string("payload"));
    }
}

#[tokio::test]
async fn test_rejection_reaches_every_awaiter() {
    let (evaluator, env, ctx) = setup();

    let block = Expr::Async(vec![Statement::Expression(Expr::binary(
        BinaryOp::Div,
        Expr::int(1),
        Expr::int(0),
    ))]);
    let future = evaluator.eval_expression(&block, &env, &ctx).await.unwrap();
    env.define("f", future).unwrap();

    for _ in 0..2 {
        let err = evaluator
            .eval_expression(&Expr::Await(Box::new(Expr::var("f"))), &env, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, EvalError::DivisionByZero);
    }
}

#[tokio::test]
async fn test_race_settles_with_the_fastest() {
    let slow = run_async(async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(Value::string("slow"))
    });
    let fast = run_async(async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Value::string("fast"))
    });

    let winner = race(vec![slow.clone(), fast]);
    assert_eq!(winner.settled().await.unwrap(), Value::string("fast"));

    // No cancellation: the loser still runs to completion.
    assert_eq!(slow.settled().await.unwrap(), Value::string("slow"));
}

#[tokio::test]
async fn test_all_returns_values_in_input_order() {
    let futures: Vec<FutureValue> = (0..3)
        .map(|i| {
            run_async(async move {
                // Later inputs settle earlier.
                tokio::time::sleep(Duration::from_millis(30 - i * 10)).await;
                Ok(Value::Int(i as i64))
            })
        })
        .collect();

    let combined = all(futures);
    assert_eq!(
        combined.settled().await.unwrap(),
        Value::array(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
    );
}

#[tokio::test]
async fn test_await_timeout_leaves_future_pending() {
    let future = FutureValue::pending();
    let outcome = future.settled_timeout(Duration::from_millis(10)).await;
    assert!(matches!(outcome, Err(EvalError::AwaitTimeout(_))));
    assert!(future.is_pending());
}

#[tokio::test]
async fn test_concurrent_async_blocks_share_depth_counter() {
    // The counter is shared across tasks, so concurrent blocks draw from
    // one budget; size it for 8 blocks of depth ~40 plus headroom.
    let ctx = Arc::new(ExecutionContext::new(
        Arc::new(TypeChecker::new()),
        EngineConfig {
            max_eval_depth: 4096,
        },
    ));
    let env = Environment::new();
    let evaluator = ExpressionEvaluator::new();

    // Deeply nested arithmetic inside several concurrent async blocks; the
    // shared counter must neither race nor leak depth.
    let mut nested = Expr::int(0);
    for _ in 0..40 {
        nested = Expr::binary(BinaryOp::Add, nested, Expr::int(1));
    }

    let mut futures = Vec::new();
    for _ in 0..8 {
        let block = Expr::Async(vec![Statement::Return(nested.clone())]);
        let value = evaluator.eval_expression(&block, &env, &ctx).await.unwrap();
        match value {
            Value::Future(f) => futures.push(f),
            other => panic!("expected future, got {:?}", other),
        }
    }
    for future in futures {
        assert_eq!(future.settled().await.unwrap(), Value::Int(40));
    }

    // All depth released: a fresh deep evaluation still fits the limit.
    assert_eq!(
        evaluator.eval_expression(&nested, &env, &ctx).await.unwrap(),
        Value::Int(40)
    );
}

#[tokio::test]
async fn test_nested_async_blocks() {
    let (evaluator, env, ctx) = setup();

    // async { await (async { 7 }) + 1 }
    let inner = Expr::Async(vec![Statement::Return(Expr::int(7))]);
    let outer = Expr::Async(vec![Statement::Return(Expr::binary(
        BinaryOp::Add,
        Expr::Await(Box::new(inner)),
        Expr::int(1),
    ))]);
    let expr = Expr::Await(Box::new(outer));
    assert_eq!(
        evaluator.eval_expression(&expr, &env, &ctx).await.unwrap(),
        Value::Int(8)
    );
}
