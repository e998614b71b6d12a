use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::ast::{
    Command, CronTask, EventHandler, HttpMethod, Injection, Item, Module, QueueWorker, Route,
    Statement, Type, TypeDef, WebSocketRoute, WsEventKind,
};
use crate::capability::Capability;
use crate::config::EngineConfig;
use crate::env::Environment;
use crate::error::{Error, EvalError, LoadError, RuntimeResult};
use crate::eval::{ControlFlow, ExecutionContext, ExpressionEvaluator, StatementExecutor, StatementResult};
use crate::type_checker::{TypeChecker, TypeScope};
use crate::value::Value;

/// An HTTP request as seen by the engine: the transport has already matched
/// the route, extracted path/query parameters and parsed the body.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub path: String,
    pub method: String,
    pub params: HashMap<String, String>,
    pub query: HashMap<String, Value>,
    pub body: Option<Value>,
    pub auth: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteResponse {
    pub status: u16,
    pub body: Value,
}

impl RouteResponse {
    pub fn body_json(&self) -> serde_json::Value {
        self.body.to_json()
    }
}

/// The engine façade: owns the registries populated by module load, the
/// global environment, and the injected handler capabilities; external
/// dispatchers (HTTP server, cron scheduler, queue consumer, CLI) look
/// units up here and hand them back for execution.
pub struct Runtime {
    checker: Arc<TypeChecker>,
    config: EngineConfig,
    global_env: Arc<Environment>,
    functions: DashMap<String, Arc<crate::ast::Function>>,
    routes: DashMap<String, Arc<Route>>,
    commands: DashMap<String, Arc<Command>>,
    cron_tasks: DashMap<String, Arc<CronTask>>,
    event_handlers: DashMap<String, Vec<Arc<EventHandler>>>,
    queue_workers: DashMap<String, Arc<QueueWorker>>,
    websocket_routes: DashMap<String, Arc<WebSocketRoute>>,
    database_handler: RwLock<Option<Arc<dyn Capability>>>,
    redis_handler: RwLock<Option<Arc<dyn Capability>>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Runtime {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            checker: Arc::new(TypeChecker::new()),
            config,
            global_env: Environment::new(),
            functions: DashMap::new(),
            routes: DashMap::new(),
            commands: DashMap::new(),
            cron_tasks: DashMap::new(),
            event_handlers: DashMap::new(),
            queue_workers: DashMap::new(),
            websocket_routes: DashMap::new(),
            database_handler: RwLock::new(None),
            redis_handler: RwLock::new(None),
        }
    }

    pub fn global_env(&self) -> &Arc<Environment> {
        &self.global_env
    }

    fn execution_context(&self) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(self.checker.clone(), self.config.clone()))
    }

    fn route_key(method: HttpMethod, path: &str) -> String {
        format!("{} {}", method, path)
    }

    /// Registers a module's items. Type definitions and functions go into
    /// the lookup tables (functions also into the global environment);
    /// dispatchable units are keyed for their external owners; constants
    /// are evaluated now.
    pub async fn load_module(&self, module: &Module) -> RuntimeResult<()> {
        for item in &module.items {
            match item {
                Item::TypeDef(def) => {
                    if self.checker.type_def(&def.name).is_some() {
                        return Err(duplicate("type", &def.name));
                    }
                    self.checker.register_type_def(def.clone());
                }
                Item::Function(func) => {
                    let func = Arc::new(func.clone());
                    let name = func.name.clone();
                    if self.functions.contains_key(&name) {
                        return Err(duplicate("function", &name));
                    }
                    self.functions.insert(name.clone(), func.clone());
                    self.global_env
                        .define(&name, Value::Function(func))
                        .map_err(|_| duplicate("function", &name))?;
                }
                Item::ConstDecl(decl) => self.load_const(decl).await?,
                Item::Route(route) => {
                    let key = Self::route_key(route.method, &route.path);
                    if self.routes.contains_key(&key) {
                        return Err(duplicate("route", &key));
                    }
                    self.routes.insert(key, Arc::new(route.clone()));
                }
                Item::Command(command) => {
                    if self.commands.contains_key(&command.name) {
                        return Err(duplicate("command", &command.name));
                    }
                    self.commands
                        .insert(command.name.clone(), Arc::new(command.clone()));
                }
                Item::CronTask(task) => {
                    if self.cron_tasks.contains_key(&task.name) {
                        return Err(duplicate("cron task", &task.name));
                    }
                    self.cron_tasks
                        .insert(task.name.clone(), Arc::new(task.clone()));
                }
                Item::EventHandler(handler) => {
                    // Multiple handlers per event type are expected.
                    self.event_handlers
                        .entry(handler.event_type.clone())
                        .or_default()
                        .push(Arc::new(handler.clone()));
                }
                Item::QueueWorker(worker) => {
                    if self.queue_workers.contains_key(&worker.queue_name) {
                        return Err(duplicate("queue worker", &worker.queue_name));
                    }
                    self.queue_workers
                        .insert(worker.queue_name.clone(), Arc::new(worker.clone()));
                }
                Item::WebSocketRoute(route) => {
                    if self.websocket_routes.contains_key(&route.path) {
                        return Err(duplicate("websocket route", &route.path));
                    }
                    self.websocket_routes
                        .insert(route.path.clone(), Arc::new(route.clone()));
                }
            }
        }
        Ok(())
    }

    async fn load_const(&self, decl: &crate::ast::ConstDecl) -> RuntimeResult<()> {
        let ctx = self.execution_context();
        let evaluator = ExpressionEvaluator::new();
        let value = evaluator
            .eval_expression(&decl.value, &self.global_env, &ctx)
            .await
            .map_err(|source| LoadError::Const {
                name: decl.name.clone(),
                source,
            })?;

        if let Some(annotation) = &decl.type_annotation {
            self.checker
                .check_type(&value, annotation, &TypeScope::new())
                .map_err(|source| LoadError::ConstType {
                    name: decl.name.clone(),
                    source,
                })?;
        }

        self.global_env
            .define(&decl.name, value)
            .map_err(|_| duplicate("constant", &decl.name))?;
        Ok(())
    }

    // Capability injection. The handler object is opaque; the engine only
    // ever reaches it through field access and the method allow-list.

    pub fn set_database_handler(&self, handler: Arc<dyn Capability>) {
        *self.database_handler.write().unwrap() = Some(handler);
    }

    pub fn set_redis_handler(&self, handler: Arc<dyn Capability>) {
        *self.redis_handler.write().unwrap() = Some(handler);
    }

    fn inject_dependency(&self, injection: &Injection, env: &Arc<Environment>) -> RuntimeResult<()> {
        let handler = match &injection.type_annotation {
            Type::Database => self.database_handler.read().unwrap().clone(),
            Type::Redis => self.redis_handler.read().unwrap().clone(),
            Type::Named(name) if name == "Database" => {
                self.database_handler.read().unwrap().clone()
            }
            Type::Named(name) if name == "Redis" => self.redis_handler.read().unwrap().clone(),
            _ => None,
        };
        if let Some(handler) = handler {
            env.define(&injection.name, Value::Handler(handler))
                .map_err(EvalError::from)
                .map_err(Error::from)?;
        } else {
            warn!(name = %injection.name, "no handler registered for injection");
        }
        Ok(())
    }

    /// Runs a unit body: executes the statements, absorbs the Return
    /// control transfer into the unit's result, and surfaces an `Err(..)`
    /// result as the distinguished validation error.
    async fn run_unit(
        &self,
        body: &[Statement],
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> RuntimeResult<Value> {
        let executor = StatementExecutor::new();
        let result = match executor.execute_block(body, env, ctx).await? {
            StatementResult::Value(value) => value,
            StatementResult::Control(ControlFlow::Return(value)) => value,
        };
        if let Value::Err(inner) = &result {
            return Err(EvalError::Validation(inner.to_string()).into());
        }
        Ok(result)
    }

    /// Fills missing object fields from the TypeDef's declared defaults,
    /// producing a new object; the caller's body value is left untouched.
    async fn apply_type_defaults(
        &self,
        input: &Value,
        def: &TypeDef,
        env: &Arc<Environment>,
        ctx: &Arc<ExecutionContext>,
    ) -> RuntimeResult<Value> {
        let Value::Object(entries) = input else {
            return Ok(input.clone());
        };
        let mut entries = entries.read().unwrap().clone();

        let evaluator = ExpressionEvaluator::new();
        for field in &def.fields {
            if entries.contains_key(&field.name) {
                continue;
            }
            if let Some(default) = &field.default {
                let value = evaluator
                    .eval_expression(default, env, ctx)
                    .await
                    .map_err(Error::from)?;
                entries.insert(field.name.clone(), value);
            }
        }
        Ok(Value::object(entries))
    }

    /// Executes a route body against a prepared request. Validation
    /// failures (including input TypeDef violations) surface as the
    /// distinguished validation error so the transport can answer 400
    /// instead of 500.
    #[tracing::instrument(skip(self, route, request), fields(method = %route.method, path = %route.path))]
    pub async fn execute_route(
        &self,
        route: &Route,
        request: RouteRequest,
    ) -> RuntimeResult<RouteResponse> {
        let ctx = self.execution_context();
        let env = Environment::child(&self.global_env);
        let evaluator = ExpressionEvaluator::new();

        for (name, value) in &request.params {
            env.define(name, Value::String(value.clone()))
                .map_err(EvalError::from)?;
        }

        // Declared query defaults fill in for parameters the transport did
        // not deliver; everything lands in the `query` object and the
        // declared names are also bound directly.
        let mut query = request.query.clone();
        for decl in &route.query_params {
            if !query.contains_key(&decl.name) {
                if let Some(default) = &decl.default {
                    let value = evaluator
                        .eval_expression(default, &env, &ctx)
                        .await
                        .map_err(Error::from)?;
                    query.insert(decl.name.clone(), value);
                }
            }
        }
        env.define("query", Value::object(query.clone()))
            .map_err(EvalError::from)?;
        for decl in &route.query_params {
            if let Some(value) = query.get(&decl.name) {
                env.define(&decl.name, value.clone())
                    .map_err(EvalError::from)?;
            }
        }

        // The request body is always bound as `input`, nil included.
        let mut input = request.body.clone().unwrap_or(Value::Nil);
        if !input.is_nil() {
            if let Some(Type::Named(type_name)) = &route.input_type {
                if let Some(def) = self.checker.type_def(type_name) {
                    input = self.apply_type_defaults(&input, &def, &env, &ctx).await?;
                    self.checker
                        .validate_object(&input, &def)
                        .map_err(|e| EvalError::Validation(format!("input validation failed: {}", e)))?;
                }
            }
        }
        env.define("input", input).map_err(EvalError::from)?;

        for injection in &route.injections {
            self.inject_dependency(injection, &env)?;
        }

        if route.auth.is_some() {
            let auth = request.auth.clone().unwrap_or_else(default_auth_data);
            env.define("auth", auth).map_err(EvalError::from)?;
        }

        let result = self.run_unit(&route.body, &env, &ctx).await?;

        if let Some(return_type) = &route.return_type {
            ctx.check_type(&result, return_type).map_err(|error| {
                EvalError::Eval(format!(
                    "return type mismatch in route {} {}: {}",
                    route.method, route.path, error
                ))
            })?;
        }

        debug!("route executed");
        Ok(RouteResponse {
            status: 200,
            body: result,
        })
    }

    /// Executes a CLI command with named arguments, applying declared
    /// defaults and failing on missing required parameters.
    #[tracing::instrument(skip(self, command, args), fields(command = %command.name))]
    pub async fn execute_command(
        &self,
        command: &Command,
        args: HashMap<String, Value>,
    ) -> RuntimeResult<Value> {
        let ctx = self.execution_context();
        let env = Environment::child(&self.global_env);
        let evaluator = ExpressionEvaluator::new();

        for param in &command.params {
            if let Some(value) = args.get(&param.name) {
                env.define(&param.name, value.clone())
                    .map_err(EvalError::from)?;
            } else if let Some(default) = &param.default {
                let value = evaluator
                    .eval_expression(default, &env, &ctx)
                    .await
                    .map_err(Error::from)?;
                env.define(&param.name, value).map_err(EvalError::from)?;
            } else if param.required {
                return Err(Error::MissingArgument(param.name.clone()));
            }
        }

        let result = self.run_unit(&command.body, &env, &ctx).await?;

        if let Some(return_type) = &command.return_type {
            ctx.check_type(&result, return_type).map_err(|error| {
                EvalError::Eval(format!(
                    "return type mismatch in command {}: {}",
                    command.name, error
                ))
            })?;
        }

        Ok(result)
    }

    #[tracing::instrument(skip(self, task), fields(task = %task.name))]
    pub async fn execute_cron_task(&self, task: &CronTask) -> RuntimeResult<Value> {
        let ctx = self.execution_context();
        let env = Environment::child(&self.global_env);
        for injection in &task.injections {
            self.inject_dependency(injection, &env)?;
        }
        self.run_unit(&task.body, &env, &ctx).await
    }

    /// Executes one event handler; the payload is bound as both `event`
    /// and `input`.
    #[tracing::instrument(skip(self, handler, payload), fields(event = %handler.event_type))]
    pub async fn execute_event_handler(
        &self,
        handler: &EventHandler,
        payload: Value,
    ) -> RuntimeResult<Value> {
        let ctx = self.execution_context();
        let env = Environment::child(&self.global_env);
        env.define("event", payload.clone()).map_err(EvalError::from)?;
        env.define("input", payload).map_err(EvalError::from)?;
        for injection in &handler.injections {
            self.inject_dependency(injection, &env)?;
        }
        self.run_unit(&handler.body, &env, &ctx).await
    }

    /// Executes a queue worker; the message is bound as both `message`
    /// and `input`.
    #[tracing::instrument(skip(self, worker, message), fields(queue = %worker.queue_name))]
    pub async fn execute_queue_worker(
        &self,
        worker: &QueueWorker,
        message: Value,
    ) -> RuntimeResult<Value> {
        let ctx = self.execution_context();
        let env = Environment::child(&self.global_env);
        env.define("message", message.clone())
            .map_err(EvalError::from)?;
        env.define("input", message).map_err(EvalError::from)?;
        for injection in &worker.injections {
            self.inject_dependency(injection, &env)?;
        }
        self.run_unit(&worker.body, &env, &ctx).await
    }

    /// Runs one of a WebSocket route's event blocks (connect/message/close)
    /// on behalf of the external socket server.
    pub async fn execute_websocket_event(
        &self,
        route: &WebSocketRoute,
        kind: WsEventKind,
        message: Option<Value>,
    ) -> RuntimeResult<Value> {
        let Some(event) = route.events.iter().find(|e| e.kind == kind) else {
            return Err(Error::UnknownUnit {
                kind: "websocket event",
                name: format!("{} {}", route.path, kind),
            });
        };

        let ctx = self.execution_context();
        let env = Environment::child(&self.global_env);
        if let Some(message) = message {
            env.define("message", message.clone())
                .map_err(EvalError::from)?;
            env.define("input", message).map_err(EvalError::from)?;
        }
        self.run_unit(&event.body, &env, &ctx).await
    }

    /// Emits a named event to every registered handler for that type; no
    /// handlers is not an error. Handlers marked async run on their own
    /// tasks; synchronous ones run in registration order and the first
    /// failure propagates.
    pub async fn emit_event(self: &Arc<Self>, event_type: &str, payload: Value) -> RuntimeResult<()> {
        let handlers = match self.event_handlers.get(event_type) {
            Some(entry) => entry.clone(),
            None => return Ok(()),
        };

        for handler in handlers {
            if handler.is_async {
                let runtime = self.clone();
                let payload = payload.clone();
                tokio::spawn(async move {
                    if let Err(error) = runtime.execute_event_handler(&handler, payload).await {
                        warn!(%error, event = %handler.event_type, "async event handler failed");
                    }
                });
            } else {
                self.execute_event_handler(&handler, payload.clone()).await?;
            }
        }
        Ok(())
    }

    // Registry lookups for external owners.

    pub fn route(&self, method: HttpMethod, path: &str) -> Option<Arc<Route>> {
        self.routes
            .get(&Self::route_key(method, path))
            .map(|r| r.clone())
    }

    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn command(&self, name: &str) -> Option<Arc<Command>> {
        self.commands.get(name).map(|c| c.clone())
    }

    pub fn cron_task(&self, name: &str) -> Option<Arc<CronTask>> {
        self.cron_tasks.get(name).map(|t| t.clone())
    }

    pub fn cron_tasks(&self) -> Vec<Arc<CronTask>> {
        self.cron_tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn event_handlers(&self, event_type: &str) -> Vec<Arc<EventHandler>> {
        self.event_handlers
            .get(event_type)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn queue_worker(&self, queue_name: &str) -> Option<Arc<QueueWorker>> {
        self.queue_workers.get(queue_name).map(|w| w.clone())
    }

    pub fn websocket_route(&self, path: &str) -> Option<Arc<WebSocketRoute>> {
        self.websocket_routes.get(path).map(|r| r.clone())
    }

    pub fn function(&self, name: &str) -> Option<Arc<crate::ast::Function>> {
        self.functions.get(name).map(|f| f.clone())
    }

    /// Calls a loaded function directly with already-evaluated arguments.
    pub async fn call_function(&self, name: &str, args: Vec<Value>) -> RuntimeResult<Value> {
        let func = self
            .function(name)
            .ok_or_else(|| Error::UnknownUnit {
                kind: "function",
                name: name.to_string(),
            })?;
        let ctx = self.execution_context();
        let evaluator = ExpressionEvaluator::new();
        if func.type_params.is_empty() {
            evaluator
                .invoke_function(&func, args, &self.global_env, &ctx)
                .await
                .map_err(Error::from)
        } else {
            // Route through the generic call path via a synthetic call so
            // inference and the type scope behave exactly as in programs.
            let value = Value::Function(func);
            evaluator
                .call_value(&value, args, &self.global_env, &ctx)
                .await
                .map_err(Error::from)
        }
    }
}

fn duplicate(kind: &'static str, name: &str) -> Error {
    Error::Load(LoadError::Duplicate {
        kind,
        name: name.to_string(),
    })
}

fn default_auth_data() -> Value {
    Value::object_from(vec![
        (
            "user",
            Value::object_from(vec![
                ("id", Value::Int(0)),
                ("username", Value::string("")),
                ("role", Value::string("")),
            ]),
        ),
        ("token", Value::string("")),
        ("expiresAt", Value::Int(0)),
    ])
}
