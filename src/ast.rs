use core::fmt;

use strum_macros::{Display as StrumDisplay, EnumString};

// Root AST definition. A Module is produced by the external parser and stays
// immutable while the engine evaluates it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub items: Vec<Item>,
}

impl Module {
    pub fn new(items: Vec<Item>) -> Self {
        Self { items }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    TypeDef(TypeDef),
    ConstDecl(ConstDecl),
    Function(Function),
    Route(Route),
    Command(Command),
    CronTask(CronTask),
    EventHandler(EventHandler),
    QueueWorker(QueueWorker),
    WebSocketRoute(WebSocketRoute),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub name: String,
    pub type_params: Vec<TypeParam>,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub type_annotation: Option<Type>,
    pub required: bool,
    pub default: Option<Expr>,
}

impl Field {
    pub fn required(name: &str, type_annotation: Type) -> Self {
        Self {
            name: name.to_string(),
            type_annotation: Some(type_annotation),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &str, type_annotation: Type, default: Option<Expr>) -> Self {
        Self {
            name: name.to_string(),
            type_annotation: Some(type_annotation),
            required: false,
            default,
        }
    }

    pub fn untyped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_annotation: None,
            required: true,
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstDecl {
    pub name: String,
    pub type_annotation: Option<Type>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub type_params: Vec<TypeParam>,
    pub params: Vec<Field>,
    pub return_type: Option<Type>,
    pub body: Vec<Statement>,
}

/// Generic type parameter. Constraints are the built-in bounds only
/// (Comparable, Numeric, Hashable, Any).
#[derive(Debug, Clone, PartialEq)]
pub struct TypeParam {
    pub name: String,
    pub constraint: Option<Type>,
}

impl TypeParam {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            constraint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub method: HttpMethod,
    pub path: String,
    pub input_type: Option<Type>,
    pub return_type: Option<Type>,
    pub query_params: Vec<QueryParamDecl>,
    pub injections: Vec<Injection>,
    pub auth: Option<AuthConfig>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuthConfig {
    pub roles: Vec<String>,
}

/// Query parameter declaration. Extraction and type conversion belong to the
/// transport; the engine only applies declared defaults and binds values.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParamDecl {
    pub name: String,
    pub type_annotation: Option<Type>,
    pub required: bool,
    pub default: Option<Expr>,
}

/// Declared injection of an external handler (Database, Redis). The handler
/// object itself is registered on the runtime by the host process.
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub name: String,
    pub type_annotation: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub description: Option<String>,
    pub params: Vec<Field>,
    pub return_type: Option<Type>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CronTask {
    pub name: String,
    pub schedule: String,
    pub injections: Vec<Injection>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventHandler {
    pub event_type: String,
    pub is_async: bool,
    pub injections: Vec<Injection>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueWorker {
    pub queue_name: String,
    pub injections: Vec<Injection>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketRoute {
    pub path: String,
    pub events: Vec<WebSocketEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum WsEventKind {
    Connect,
    Message,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketEvent {
    pub kind: WsEventKind,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Declares a binding; updates an ancestor binding when one exists.
    /// Redeclaring in the same frame is an error.
    Assign { target: String, value: Expr },
    /// Updates the nearest frame defining the name; errors when undefined.
    Reassign { target: String, value: Expr },
    /// In-place mutation of an array element or object entry.
    IndexAssign {
        target: Expr,
        index: Expr,
        value: Expr,
    },
    Return(Expr),
    If {
        condition: Expr,
        then_block: Vec<Statement>,
        else_block: Option<Vec<Statement>>,
    },
    While {
        condition: Expr,
        body: Vec<Statement>,
    },
    For {
        key_var: Option<String>,
        value_var: String,
        iterable: Expr,
        body: Vec<Statement>,
    },
    Switch {
        value: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Statement>>,
    },
    /// A predicate call whose falsy result raises a validation error
    /// rather than an internal fault.
    Validation(CallExpr),
    Expression(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub value: Expr,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Variable(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    FieldAccess {
        object: Box<Expr>,
        field: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call(CallExpr),
    Object(Vec<ObjectField>),
    Array(Vec<Expr>),
    Lambda {
        params: Vec<Field>,
        body: Vec<Statement>,
    },
    Async(Vec<Statement>),
    Await(Box<Expr>),
    Match {
        value: Box<Expr>,
        cases: Vec<MatchCase>,
    },
}

/// Function call. Dotted names resolve through intermediate field accesses
/// (module namespaces, capability tables) before the final invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub name: String,
    pub type_args: Vec<Type>,
    pub args: Vec<Expr>,
}

impl CallExpr {
    pub fn new(name: &str, args: Vec<Expr>) -> Self {
        Self {
            name: name.to_string(),
            type_args: vec![],
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub key: String,
    pub value: Expr,
}

impl ObjectField {
    pub fn new(key: &str, value: Expr) -> Self {
        Self {
            key: key.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Literal(Literal),
    Variable(String),
    Wildcard,
    Object(Vec<ObjectPatternField>),
    Array {
        elements: Vec<Pattern>,
        rest: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPatternField {
    pub key: String,
    pub pattern: Option<Pattern>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnaryOp::Not => write!(f, "!"),
            UnaryOp::Neg => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Int,
    String,
    Bool,
    Float,
    /// Element type may be absent for untyped arrays.
    Array(Option<Box<Type>>),
    Optional(Box<Type>),
    Named(String),
    Database,
    Redis,
    Union(Vec<Type>),
    TypeParam(String),
    Function {
        params: Vec<Type>,
        return_type: Box<Type>,
    },
}

impl Type {
    pub fn array_of(elem: Type) -> Self {
        Type::Array(Some(Box::new(elem)))
    }

    pub fn optional(inner: Type) -> Self {
        Type::Optional(Box::new(inner))
    }

    pub fn named(name: &str) -> Self {
        Type::Named(name.to_string())
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::String => write!(f, "string"),
            Type::Bool => write!(f, "bool"),
            Type::Float => write!(f, "float"),
            Type::Array(Some(elem)) => write!(f, "[{}]", elem),
            Type::Array(None) => write!(f, "[]"),
            Type::Optional(inner) => write!(f, "{}?", inner),
            Type::Named(name) => write!(f, "{}", name),
            Type::Database => write!(f, "Database"),
            Type::Redis => write!(f, "Redis"),
            Type::Union(members) => {
                let parts: Vec<String> = members.iter().map(|t| t.to_string()).collect();
                write!(f, "{}", parts.join(" | "))
            }
            Type::TypeParam(name) => write!(f, "{}", name),
            Type::Function {
                params,
                return_type,
            } => {
                let parts: Vec<String> = params.iter().map(|t| t.to_string()).collect();
                write!(f, "({}) -> {}", parts.join(", "), return_type)
            }
        }
    }
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Expr::Literal(Literal::Float(value))
    }

    pub fn string(value: &str) -> Self {
        Expr::Literal(Literal::String(value.to_string()))
    }

    pub fn bool(value: bool) -> Self {
        Expr::Literal(Literal::Bool(value))
    }

    pub fn var(name: &str) -> Self {
        Expr::Variable(name.to_string())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn field(object: Expr, field: &str) -> Self {
        Expr::FieldAccess {
            object: Box::new(object),
            field: field.to_string(),
        }
    }

    pub fn index(object: Expr, index: Expr) -> Self {
        Expr::Index {
            object: Box::new(object),
            index: Box::new(index),
        }
    }
}
