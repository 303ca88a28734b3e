//! Syntax-tree input types for the execution core.
//!
//! The lexer/parser that produces these trees is an external collaborator;
//! the core only consumes them. Statements and expressions stay unevaluated
//! until the stepper lowers them into instructions, which is what lets the
//! scheduler discover variable dependencies without running anything.

use serde::{Deserialize, Serialize};

/// Position of a syntax node in the original source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceLoc {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

impl SourceLoc {
    /// Construct a location from line and column.
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Binary operators supported by the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Addition, with string concatenation when either operand is a string.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Mod,
    /// Equality on payloads.
    Eq,
    /// Inequality on payloads.
    Ne,
    /// Less-than.
    Lt,
    /// Less-than-or-equal.
    Le,
    /// Greater-than.
    Gt,
    /// Greater-than-or-equal.
    Ge,
    /// Logical conjunction on truthiness.
    And,
    /// Logical disjunction on truthiness.
    Or,
}

impl BinaryOp {
    /// Source-level symbol for error messages.
    pub fn symbol(&self) -> &'static str {
        match self {
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
        }
    }
}

/// Unary operators supported by the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Numeric negation.
    Neg,
    /// Logical negation on truthiness.
    Not,
}

/// One piece of a string template.
///
/// Templates carry two distinct placeholder modes: `Deferred` placeholders
/// are rendered back verbatim (the external collaborator sees the
/// placeholder text, e.g. inside a model prompt), while `Expand` placeholders
/// must resolve to a string at interpolation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TemplatePart {
    /// Literal text.
    Text(String),
    /// `{name}` placeholder left for the external collaborator.
    Deferred(String),
    /// `${name}` placeholder expanded immediately.
    Expand(String),
}

/// External long-latency operations that can appear inline in expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExternalExpr {
    /// Model call with a prompt expression and optional model/context.
    ModelCall {
        /// Prompt expression, usually a template with deferred placeholders.
        prompt: Box<Expr>,
        /// Optional model selector expression.
        model: Option<Box<Expr>>,
        /// Context value expressions passed alongside the prompt.
        context: Vec<Expr>,
    },
    /// Sandboxed code block with named parameter bindings from scope.
    CodeBlock {
        /// Source text of the block, executed by the collaborator.
        body: String,
        /// Names of scope variables bound into the sandbox.
        params: Vec<String>,
    },
    /// Tool invocation by name with argument expressions.
    ToolCall {
        /// Tool identifier.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
}

/// Expression tree produced by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// The null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Numeric literal.
    Number(f64),
    /// Plain string literal.
    Str(String),
    /// String template with interpolation placeholders.
    Template(Vec<TemplatePart>),
    /// Array literal.
    Array(Vec<Expr>),
    /// Object literal with ordered entries.
    Object(Vec<(String, Expr)>),
    /// Variable reference.
    Identifier(String),
    /// Property access `object.property`.
    Member {
        /// Receiver expression.
        object: Box<Expr>,
        /// Property name.
        property: String,
    },
    /// Index access `object[index]`.
    Index {
        /// Receiver expression.
        object: Box<Expr>,
        /// Index expression.
        index: Box<Expr>,
    },
    /// Slice access `object[start:end]` with optional bounds.
    Slice {
        /// Receiver expression.
        object: Box<Expr>,
        /// Optional inclusive start expression.
        start: Option<Box<Expr>>,
        /// Optional exclusive end expression.
        end: Option<Box<Expr>>,
    },
    /// Unary operator application.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand expression.
        operand: Box<Expr>,
    },
    /// Binary operator application.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Function call; a dotted callee (`mod.f`) targets an imported module.
    Call {
        /// Function name, possibly module-qualified.
        callee: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// External long-latency operation.
    External(ExternalExpr),
}

/// Binding pattern on the left of a declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    /// Bind a single name.
    Name(String),
    /// Destructure named fields out of an object value.
    Object(Vec<String>),
}

/// Statement with its source location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    /// Statement payload.
    pub kind: StmtKind,
    /// Location of the statement in source text.
    pub loc: SourceLoc,
}

impl Stmt {
    /// Construct a statement at the given location.
    pub fn new(kind: StmtKind, loc: SourceLoc) -> Self {
        Self { kind, loc }
    }
}

/// Statement forms produced by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    /// Variable declaration, possibly destructuring, possibly deferred.
    Declare {
        /// Binding pattern.
        pattern: Pattern,
        /// Declared type tag passed to the type validator.
        declared_type: Option<String>,
        /// Whether the binding is constant.
        constant: bool,
        /// Whether the declaration sits in an async context: its external
        /// operation is registered as deferred work instead of blocking.
        deferred: bool,
        /// Initializer expression.
        init: Expr,
    },
    /// Assignment to an existing variable.
    Assign {
        /// Target variable name.
        target: String,
        /// Value expression.
        expr: Expr,
    },
    /// Expression evaluated for its result/effects.
    Expr(Expr),
    /// Conditional with optional alternate branch.
    If {
        /// Condition expression.
        condition: Expr,
        /// Branch taken when the condition is truthy.
        consequent: Vec<Stmt>,
        /// Branch taken otherwise.
        alternate: Option<Vec<Stmt>>,
    },
    /// While loop.
    While {
        /// Loop condition, re-evaluated each iteration.
        condition: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// For-in loop over an array value.
    ForIn {
        /// Loop variable bound fresh each iteration.
        variable: String,
        /// Iterable expression, evaluated once.
        iterable: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// Return from the enclosing function.
    Return(Option<Expr>),
    /// Explicit block scope.
    Block(Vec<Stmt>),
    /// Import a module under an alias via the module provider.
    Import {
        /// Module path handed to the provider.
        path: String,
        /// Alias the module is referenced by.
        alias: String,
    },
}

/// Function parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Declared type tag passed to the type validator on bind.
    pub declared_type: Option<String>,
}

/// Function definition available to the program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Function name.
    pub name: String,
    /// Parameters in order.
    pub params: Vec<Param>,
    /// Declared return type passed to the type validator on return.
    pub return_type: Option<String>,
    /// Function body.
    pub body: Vec<Stmt>,
}

/// A parsed program: top-level statements plus its function table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    /// Statements executed in order.
    pub statements: Vec<Stmt>,
    /// Functions callable from the program.
    pub functions: Vec<FunctionDef>,
}
