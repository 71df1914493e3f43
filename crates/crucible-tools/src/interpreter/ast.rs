#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Const,
    Let,
    Var,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Decl {
        kind: DeclKind,
        bindings: Vec<(String, Option<Expr>)>,
    },
    Block(Vec<Stmt>),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropKey {
    Ident(String),
    Str(String),
    Num(f64),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    KeyValue { key: PropKey, value: Expr },
    Shorthand(String),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayItem {
    Item(Expr),
    Spread(Expr),
    Hole,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Item(Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemberProp {
    Named(String),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Template {
        cooked: String,
        substitutions: usize,
    },
    Ident(String),
    Array(Vec<ArrayItem>),
    Object(Vec<Property>),
    Unary {
        op: &'static str,
        arg: Box<Expr>,
    },
    Update {
        op: &'static str,
        prefix: bool,
        arg: Box<Expr>,
    },
    Binary {
        op: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Assign {
        op: &'static str,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Sequence(Vec<Expr>),
    Await(Box<Expr>),
    Member {
        object: Box<Expr>,
        prop: MemberProp,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
        optional: bool,
        offset: usize,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Arg>,
        offset: usize,
    },
    TaggedTemplate {
        tag: Box<Expr>,
        offset: usize,
    },
}

impl Expr {
    /// Short human label for diagnostics, e.g. `process.env` or `foo(...)`.
    pub fn describe(&self) -> String {
        match self {
            Expr::Str(_) => "string literal".to_string(),
            Expr::Num(_) => "number literal".to_string(),
            Expr::Bool(_) => "boolean literal".to_string(),
            Expr::Null => "null".to_string(),
            Expr::Template { .. } => "template literal".to_string(),
            Expr::Ident(name) => name.clone(),
            Expr::Array(_) => "array".to_string(),
            Expr::Object(_) => "object".to_string(),
            Expr::Unary { op, arg } => format!("{op}{}", arg.describe()),
            Expr::Update { op, .. } => format!("`{op}` update"),
            Expr::Binary { op, .. } => format!("`{op}` expression"),
            Expr::Assign { .. } => "assignment".to_string(),
            Expr::Conditional { .. } => "conditional expression".to_string(),
            Expr::Sequence(_) => "comma expression".to_string(),
            Expr::Await(inner) => format!("await {}", inner.describe()),
            Expr::Member { object, prop, .. } => match prop {
                MemberProp::Named(name) => format!("{}.{name}", object.describe()),
                MemberProp::Computed(_) => format!("{}[...]", object.describe()),
            },
            Expr::Call { callee, .. } => format!("{}(...)", callee.describe()),
            Expr::New { callee, .. } => format!("new {}(...)", callee.describe()),
            Expr::TaggedTemplate { tag, .. } => format!("{}`...`", tag.describe()),
        }
    }
}
