//! Kernel IR: the analyzed method bodies a front-end hands to the compiler.
//!
//! The IR is a tree: statements own their nested bodies and expressions
//! own their operands. Every node is typed by construction except for
//! locals, whose types come from `Stmt::Let` and method parameters.
//!
//! Numeric promotion is explicit. Arithmetic, bitwise and comparison
//! operators only accept `int`, `long`, `float` and `double` operands of
//! one type (plus `boolean` for `&`, `|`, `^`, `==`, `!=`, `&&`, `||`).
//! Wherever the source language would silently widen or narrow a value,
//! the front-end inserts an `Expr::Cast { implicit: true, .. }` marker.

pub mod display;
mod value;

use serde::{Deserialize, Serialize};

use crate::atomic::AtomicOp;

pub use value::Value;

// ─── Types ─────────────────────────────────────────────────────────

/// Scalar element type of a local, parameter, field or array element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
}

impl ScalarType {
    /// OpenCL C spelling of the type.
    pub fn cl_name(self) -> &'static str {
        match self {
            ScalarType::Boolean | ScalarType::Byte => "char",
            ScalarType::Short => "short",
            ScalarType::Char => "unsigned short",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
        }
    }

    /// Source-level name, used in listings and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Boolean => "boolean",
            ScalarType::Byte => "byte",
            ScalarType::Short => "short",
            ScalarType::Char => "char",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
        }
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ScalarType::Byte
                | ScalarType::Short
                | ScalarType::Char
                | ScalarType::Int
                | ScalarType::Long
        )
    }

    pub fn is_floating(self) -> bool {
        matches!(self, ScalarType::Float | ScalarType::Double)
    }

    pub fn is_numeric(self) -> bool {
        self != ScalarType::Boolean
    }

    /// Types arithmetic operators accept after promotion.
    pub fn is_promoted(self) -> bool {
        matches!(
            self,
            ScalarType::Int | ScalarType::Long | ScalarType::Float | ScalarType::Double
        )
    }

    pub fn size_bytes(self) -> usize {
        match self {
            ScalarType::Boolean | ScalarType::Byte => 1,
            ScalarType::Short | ScalarType::Char => 2,
            ScalarType::Int | ScalarType::Float => 4,
            ScalarType::Long | ScalarType::Double => 8,
        }
    }
}

// ─── Operators ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    /// Unsigned (logical) right shift.
    UShr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Short-circuit `&&`.
    And,
    /// Short-circuit `||`.
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::UShr => ">>>",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr | BinOp::UShr)
    }

    pub fn is_short_circuit(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnOp {
    Neg,
    /// Logical `!` on booleans.
    Not,
    /// Bitwise `~` on integers.
    BitNot,
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
            UnOp::BitNot => "~",
        }
    }
}

/// Direction of an increment/decrement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Inc,
    Dec,
}

impl Step {
    pub fn symbol(self) -> &'static str {
        match self {
            Step::Inc => "++",
            Step::Dec => "--",
        }
    }
}

/// Work-item queries and math intrinsics callable from a kernel body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    GlobalId,
    LocalId,
    GroupId,
    GlobalSize,
    LocalSize,
    NumGroups,
    PassId,
    Abs,
    Min,
    Max,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Pow,
    Floor,
    Ceil,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::GlobalId => "getGlobalId",
            Builtin::LocalId => "getLocalId",
            Builtin::GroupId => "getGroupId",
            Builtin::GlobalSize => "getGlobalSize",
            Builtin::LocalSize => "getLocalSize",
            Builtin::NumGroups => "getNumGroups",
            Builtin::PassId => "getPassId",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sqrt => "sqrt",
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Exp => "exp",
            Builtin::Log => "log",
            Builtin::Pow => "pow",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
        }
    }

    /// Work-item queries take a dimension index.
    pub fn is_work_item_query(self) -> bool {
        matches!(
            self,
            Builtin::GlobalId
                | Builtin::LocalId
                | Builtin::GroupId
                | Builtin::GlobalSize
                | Builtin::LocalSize
                | Builtin::NumGroups
        )
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::PassId => 0,
            Builtin::Min | Builtin::Max | Builtin::Pow => 2,
            _ => 1,
        }
    }
}

// ─── Expressions ───────────────────────────────────────────────────

/// A storage location an assignment or increment can target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Place {
    Local(String),
    /// Scalar instance field.
    Field(String),
    /// Element of an array instance field.
    Index { array: String, index: Box<Expr> },
}

impl Place {
    pub fn local(name: &str) -> Self {
        Place::Local(name.to_string())
    }

    pub fn field(name: &str) -> Self {
        Place::Field(name.to_string())
    }

    pub fn index(array: &str, index: Expr) -> Self {
        Place::Index {
            array: array.to_string(),
            index: Box::new(index),
        }
    }
}

/// Reference to an atomic slot: a scalar atomic field or one element of
/// an atomic array field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotRef {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<Box<Expr>>,
}

impl SlotRef {
    pub fn scalar(field: &str) -> Self {
        Self {
            field: field.to_string(),
            index: None,
        }
    }

    pub fn element(field: &str, index: Expr) -> Self {
        Self {
            field: field.to_string(),
            index: Some(Box::new(index)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Literal(Value),
    Local(String),
    /// Read of a scalar instance field.
    Field(String),
    /// Read of an array element.
    Index {
        array: String,
        index: Box<Expr>,
    },
    /// Length of an array field.
    Length(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    /// Conversion. `implicit` marks casts the front-end inserted for
    /// numeric promotion; both kinds are emitted as explicit casts.
    Cast {
        to: ScalarType,
        value: Box<Expr>,
        #[serde(default)]
        implicit: bool,
    },
    /// `target = value`, or `target op= value` when `op` is set.
    Assign {
        target: Place,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op: Option<BinOp>,
        value: Box<Expr>,
    },
    /// Pre/post increment or decrement.
    Step {
        target: Place,
        step: Step,
        prefix: bool,
    },
    /// Call of a helper method on the same kernel instance.
    Call {
        method: String,
        args: Vec<Expr>,
    },
    Atomic {
        op: AtomicOp,
        slot: SlotRef,
        args: Vec<Expr>,
    },
    Builtin {
        func: Builtin,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn int(v: i32) -> Self {
        Expr::Literal(Value::Int(v))
    }

    pub fn long(v: i64) -> Self {
        Expr::Literal(Value::Long(v))
    }

    pub fn float(v: f32) -> Self {
        Expr::Literal(Value::Float(v))
    }

    pub fn double(v: f64) -> Self {
        Expr::Literal(Value::Double(v))
    }

    pub fn boolean(v: bool) -> Self {
        Expr::Literal(Value::Boolean(v))
    }

    pub fn local(name: &str) -> Self {
        Expr::Local(name.to_string())
    }

    pub fn field(name: &str) -> Self {
        Expr::Field(name.to_string())
    }

    pub fn index(array: &str, index: Expr) -> Self {
        Expr::Index {
            array: array.to_string(),
            index: Box::new(index),
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn cast(to: ScalarType, value: Expr) -> Self {
        Expr::Cast {
            to,
            value: Box::new(value),
            implicit: false,
        }
    }

    /// Promotion marker inserted by the front-end.
    pub fn promote(to: ScalarType, value: Expr) -> Self {
        Expr::Cast {
            to,
            value: Box::new(value),
            implicit: true,
        }
    }

    pub fn assign(target: Place, value: Expr) -> Self {
        Expr::Assign {
            target,
            op: None,
            value: Box::new(value),
        }
    }

    pub fn compound(target: Place, op: BinOp, value: Expr) -> Self {
        Expr::Assign {
            target,
            op: Some(op),
            value: Box::new(value),
        }
    }

    pub fn pre_inc(target: Place) -> Self {
        Expr::Step {
            target,
            step: Step::Inc,
            prefix: true,
        }
    }

    pub fn post_inc(target: Place) -> Self {
        Expr::Step {
            target,
            step: Step::Inc,
            prefix: false,
        }
    }

    pub fn pre_dec(target: Place) -> Self {
        Expr::Step {
            target,
            step: Step::Dec,
            prefix: true,
        }
    }

    pub fn post_dec(target: Place) -> Self {
        Expr::Step {
            target,
            step: Step::Dec,
            prefix: false,
        }
    }

    pub fn call(method: &str, args: Vec<Expr>) -> Self {
        Expr::Call {
            method: method.to_string(),
            args,
        }
    }

    pub fn atomic(op: AtomicOp, slot: SlotRef, args: Vec<Expr>) -> Self {
        Expr::Atomic { op, slot, args }
    }

    pub fn builtin(func: Builtin, args: Vec<Expr>) -> Self {
        Expr::Builtin { func, args }
    }

    pub fn global_id(dim: i32) -> Self {
        Expr::builtin(Builtin::GlobalId, vec![Expr::int(dim)])
    }

    /// True when evaluating the expression may write state or call out.
    pub fn has_side_effects(&self) -> bool {
        match self {
            Expr::Literal(_) | Expr::Local(_) | Expr::Field(_) | Expr::Length(_) => false,
            Expr::Index { index, .. } => index.has_side_effects(),
            Expr::Binary { lhs, rhs, .. } => lhs.has_side_effects() || rhs.has_side_effects(),
            Expr::Unary { operand, .. } => operand.has_side_effects(),
            Expr::Conditional {
                cond,
                then_value,
                else_value,
            } => {
                cond.has_side_effects()
                    || then_value.has_side_effects()
                    || else_value.has_side_effects()
            }
            Expr::Cast { value, .. } => value.has_side_effects(),
            Expr::Assign { .. } | Expr::Step { .. } | Expr::Call { .. } | Expr::Atomic { .. } => {
                true
            }
            Expr::Builtin { args, .. } => args.iter().any(Expr::has_side_effects),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }
}

// ─── Statements ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    Let {
        name: String,
        ty: ScalarType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        init: Option<Expr>,
    },
    Expr(Expr),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        #[serde(default)]
        else_body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    DoWhile {
        body: Vec<Stmt>,
        cond: Expr,
    },
    For {
        #[serde(default)]
        init: Vec<Stmt>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cond: Option<Expr>,
        #[serde(default)]
        update: Vec<Expr>,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Block(Vec<Stmt>),
}

impl Stmt {
    pub fn let_(name: &str, ty: ScalarType, init: Expr) -> Self {
        Stmt::Let {
            name: name.to_string(),
            ty,
            init: Some(init),
        }
    }

    pub fn expr(expr: Expr) -> Self {
        Stmt::Expr(expr)
    }
}

// ─── Methods ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: ScalarType,
}

/// One method of a kernel type: the entry point or a helper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    /// Return type; `None` for `void`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<ScalarType>,
    pub body: Vec<Stmt>,
}

impl Method {
    pub fn new(name: &str, body: Vec<Stmt>) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            ret: None,
            body,
        }
    }

    pub fn with_param(mut self, name: &str, ty: ScalarType) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            ty,
        });
        self
    }

    pub fn returning(mut self, ty: ScalarType) -> Self {
        self.ret = Some(ty);
        self
    }
}

// ─── Traversal ─────────────────────────────────────────────────────

/// Visit every statement in pre-order together with its ordinal, the
/// position compile errors report. `For` visits its `init` statements
/// before its body.
pub fn for_each_stmt<'a>(stmts: &'a [Stmt], f: &mut dyn FnMut(usize, &'a Stmt)) {
    let mut ordinal = 0;
    number_stmts(stmts, &mut ordinal, f);
}

fn number_stmts<'a>(stmts: &'a [Stmt], ordinal: &mut usize, f: &mut dyn FnMut(usize, &'a Stmt)) {
    for stmt in stmts {
        f(*ordinal, stmt);
        *ordinal += 1;
        match stmt {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                number_stmts(then_body, ordinal, f);
                number_stmts(else_body, ordinal, f);
            }
            Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::Block(body) => {
                number_stmts(body, ordinal, f);
            }
            Stmt::For { init, body, .. } => {
                number_stmts(init, ordinal, f);
                number_stmts(body, ordinal, f);
            }
            _ => {}
        }
    }
}

/// Expressions owned directly by `stmt`, excluding nested statements.
pub fn own_exprs(stmt: &Stmt) -> Vec<&Expr> {
    match stmt {
        Stmt::Let { init, .. } => init.iter().collect(),
        Stmt::Expr(e) => vec![e],
        Stmt::If { cond, .. } | Stmt::While { cond, .. } | Stmt::DoWhile { cond, .. } => {
            vec![cond]
        }
        Stmt::For { cond, update, .. } => cond.iter().chain(update.iter()).collect(),
        Stmt::Return(e) => e.iter().collect(),
        Stmt::Break | Stmt::Continue | Stmt::Block(_) => Vec::new(),
    }
}

/// Calls every expression reachable from `stmts`, outermost first.
pub fn visit_exprs<'a>(stmts: &'a [Stmt], f: &mut dyn FnMut(&'a Expr)) {
    for stmt in stmts {
        visit_stmt_exprs(stmt, f);
    }
}

fn visit_stmt_exprs<'a>(stmt: &'a Stmt, f: &mut dyn FnMut(&'a Expr)) {
    match stmt {
        Stmt::Let { init, .. } => {
            if let Some(e) = init {
                walk_expr(e, f);
            }
        }
        Stmt::Expr(e) => walk_expr(e, f),
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            walk_expr(cond, f);
            visit_exprs(then_body, f);
            visit_exprs(else_body, f);
        }
        Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
            walk_expr(cond, f);
            visit_exprs(body, f);
        }
        Stmt::For {
            init,
            cond,
            update,
            body,
        } => {
            visit_exprs(init, f);
            if let Some(c) = cond {
                walk_expr(c, f);
            }
            for u in update {
                walk_expr(u, f);
            }
            visit_exprs(body, f);
        }
        Stmt::Return(Some(e)) => walk_expr(e, f),
        Stmt::Block(body) => visit_exprs(body, f),
        Stmt::Break | Stmt::Continue | Stmt::Return(None) => {}
    }
}

/// Pre-order walk over an expression and all of its sub-expressions.
pub fn walk_expr<'a>(expr: &'a Expr, f: &mut dyn FnMut(&'a Expr)) {
    f(expr);
    match expr {
        Expr::Literal(_) | Expr::Local(_) | Expr::Field(_) | Expr::Length(_) => {}
        Expr::Index { index, .. } => walk_expr(index, f),
        Expr::Binary { lhs, rhs, .. } => {
            walk_expr(lhs, f);
            walk_expr(rhs, f);
        }
        Expr::Unary { operand, .. } => walk_expr(operand, f),
        Expr::Conditional {
            cond,
            then_value,
            else_value,
        } => {
            walk_expr(cond, f);
            walk_expr(then_value, f);
            walk_expr(else_value, f);
        }
        Expr::Cast { value, .. } => walk_expr(value, f),
        Expr::Assign { target, value, .. } => {
            if let Place::Index { index, .. } = target {
                walk_expr(index, f);
            }
            walk_expr(value, f);
        }
        Expr::Step { target, .. } => {
            if let Place::Index { index, .. } = target {
                walk_expr(index, f);
            }
        }
        Expr::Call { args, .. } | Expr::Builtin { args, .. } => {
            for a in args {
                walk_expr(a, f);
            }
        }
        Expr::Atomic { slot, args, .. } => {
            if let Some(index) = &slot.index {
                walk_expr(index, f);
            }
            for a in args {
                walk_expr(a, f);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_effect_detection() {
        assert!(!Expr::index("a", Expr::local("i")).has_side_effects());
        assert!(Expr::index("a", Expr::pre_inc(Place::local("i"))).has_side_effects());
        assert!(Expr::call("f", vec![]).has_side_effects());
        assert!(!Expr::global_id(0).has_side_effects());
    }

    #[test]
    fn test_walk_visits_nested_index() {
        let e = Expr::pre_inc(Place::index("array", Expr::pre_inc(Place::local("i"))));
        let mut steps = 0;
        walk_expr(&e, &mut |x| {
            if matches!(x, Expr::Step { .. }) {
                steps += 1;
            }
        });
        assert_eq!(steps, 2);
    }

    #[test]
    fn test_expr_json_shape() {
        let e = Expr::binary(BinOp::Add, Expr::local("x"), Expr::int(1));
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(
            json,
            r#"{"binary":{"op":"add","lhs":{"local":"x"},"rhs":{"literal":{"int":1}}}}"#
        );
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_cl_names() {
        assert_eq!(ScalarType::Boolean.cl_name(), "char");
        assert_eq!(ScalarType::Char.cl_name(), "unsigned short");
        assert!(ScalarType::Int.is_promoted());
        assert!(!ScalarType::Short.is_promoted());
    }
}
