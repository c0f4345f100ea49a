//! Type checking and subset validation of kernel IR.
//!
//! Runs over every reachable method of a descriptor before either
//! backend sees it. The translator and the fallback interpreter both
//! assume a checked descriptor, so they never re-validate.

use std::collections::HashMap;

use crate::atomic::AtomicWidth;
use crate::diagnostic::{CompileError, ErrorKind};
use crate::ir::{BinOp, Builtin, Expr, Method, Place, ScalarType, Stmt, UnOp};
use crate::schema::{ElementType, Field, KernelDescriptor};

/// Lexically scoped local variable types.
#[derive(Clone, Debug, Default)]
pub(crate) struct Scope {
    frames: Vec<HashMap<String, ScalarType>>,
}

impl Scope {
    /// A scope holding `method`'s parameters.
    pub(crate) fn for_method(method: &Method) -> Self {
        let mut scope = Scope {
            frames: vec![HashMap::new()],
        };
        for p in &method.params {
            scope.declare(&p.name, p.ty);
        }
        scope
    }

    pub(crate) fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub(crate) fn pop(&mut self) {
        self.frames.pop();
    }

    /// Returns false if `name` already exists in the innermost frame.
    pub(crate) fn declare(&mut self, name: &str, ty: ScalarType) -> bool {
        match self.frames.last_mut() {
            Some(frame) => frame.insert(name.to_string(), ty).is_none(),
            None => false,
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<ScalarType> {
        self.frames.iter().rev().find_map(|f| f.get(name).copied())
    }
}

/// A type error before method and position are attached.
#[derive(Debug)]
pub(crate) struct Fault {
    pub kind: ErrorKind,
    pub message: String,
}

fn fault<T>(kind: ErrorKind, message: String) -> Result<T, Fault> {
    Err(Fault { kind, message })
}

fn mismatch<T>(message: String) -> Result<T, Fault> {
    fault(ErrorKind::TypeMismatch, message)
}

fn width_type(width: AtomicWidth) -> ScalarType {
    match width {
        AtomicWidth::Int => ScalarType::Int,
        AtomicWidth::Long => ScalarType::Long,
    }
}

/// Identifiers a local may not use: OpenCL C keywords and names the
/// translator emits itself.
const RESERVED: &[&str] = &[
    "this", "passid", "char", "short", "int", "long", "float", "double", "unsigned", "void",
    "if", "else", "while", "do", "for", "break", "continue", "return", "switch", "case",
    "default", "goto", "struct", "typedef", "const", "volatile", "sizeof", "half", "bool",
    "uchar", "ushort", "uint", "ulong", "kernel", "global", "local", "constant", "private",
    "This", "This_s", "thisStruct", "abs", "fabs", "min", "max", "fmin", "fmax", "fmod", "sqrt",
    "sin", "cos", "tan", "exp", "log", "pow", "floor", "ceil", "NAN", "INFINITY",
];

/// Prefixes of built-in functions the translator calls.
const RESERVED_PREFIXES: &[&str] = &["_tmp", "get_", "atomic_", "atom_", "convert_"];

pub(crate) fn valid_local_name(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    head_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
        && !RESERVED.contains(&name)
}

/// Expression typing against one descriptor.
pub(crate) struct Typer<'d> {
    descriptor: &'d KernelDescriptor,
}

impl<'d> Typer<'d> {
    pub(crate) fn new(descriptor: &'d KernelDescriptor) -> Self {
        Self { descriptor }
    }

    fn field(&self, name: &str) -> Result<&'d Field, Fault> {
        match self.descriptor.field(name) {
            Some(f) => Ok(f),
            None => fault(ErrorKind::UnknownSymbol, format!("unknown field '{}'", name)),
        }
    }

    /// Element type of a plain (non-atomic) array field.
    fn data_array(&self, name: &str) -> Result<ScalarType, Fault> {
        let field = self.field(name)?;
        match (field.element, field.is_array()) {
            (ElementType::Atomic(_), _) => fault(
                ErrorKind::AtomicMisuse,
                format!("atomic field '{}' accessed without an atomic primitive", name),
            ),
            (ElementType::Scalar(t), true) => Ok(t),
            (ElementType::Scalar(_), false) => mismatch(format!("field '{}' is not an array", name)),
        }
    }

    fn data_scalar(&self, name: &str) -> Result<ScalarType, Fault> {
        let field = self.field(name)?;
        match (field.element, field.is_array()) {
            (ElementType::Atomic(_), _) => fault(
                ErrorKind::AtomicMisuse,
                format!("atomic field '{}' accessed without an atomic primitive", name),
            ),
            (ElementType::Scalar(t), false) => Ok(t),
            (ElementType::Scalar(_), true) => fault(
                ErrorKind::UnsupportedConstruct,
                format!("array field '{}' used as a value", name),
            ),
        }
    }

    fn expect(&self, scope: &Scope, expr: &Expr, want: ScalarType, what: &str) -> Result<(), Fault> {
        let got = self.value_type(scope, expr)?;
        if got != want {
            return mismatch(format!("{} must be {}, found {}", what, want.name(), got.name()));
        }
        Ok(())
    }

    fn expect_index(&self, scope: &Scope, index: &Expr) -> Result<(), Fault> {
        self.expect(scope, index, ScalarType::Int, "array index")
    }

    pub(crate) fn place_type(&self, scope: &Scope, place: &Place) -> Result<ScalarType, Fault> {
        match place {
            Place::Local(name) => match scope.lookup(name) {
                Some(t) => Ok(t),
                None => fault(ErrorKind::UnknownSymbol, format!("undeclared local '{}'", name)),
            },
            Place::Field(name) => self.data_scalar(name),
            Place::Index { array, index } => {
                self.expect_index(scope, index)?;
                self.data_array(array)
            }
        }
    }

    /// Type of an expression that must produce a value.
    pub(crate) fn value_type(&self, scope: &Scope, expr: &Expr) -> Result<ScalarType, Fault> {
        match self.type_of(scope, expr)? {
            Some(t) => Ok(t),
            None => mismatch(format!("void expression '{}' used as a value", expr)),
        }
    }

    /// Type of `expr`; `None` for a call of a void method.
    pub(crate) fn type_of(&self, scope: &Scope, expr: &Expr) -> Result<Option<ScalarType>, Fault> {
        let t = match expr {
            Expr::Literal(v) => v.ty(),
            Expr::Local(name) => match scope.lookup(name) {
                Some(t) => t,
                None => {
                    return fault(ErrorKind::UnknownSymbol, format!("undeclared local '{}'", name))
                }
            },
            Expr::Field(name) => self.data_scalar(name)?,
            Expr::Index { array, index } => {
                self.expect_index(scope, index)?;
                self.data_array(array)?
            }
            Expr::Length(name) => {
                if !self.field(name)?.is_array() {
                    return mismatch(format!("length of non-array field '{}'", name));
                }
                ScalarType::Int
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.value_type(scope, lhs)?;
                let r = self.value_type(scope, rhs)?;
                binary_type(*op, l, r)?
            }
            Expr::Unary { op, operand } => {
                let t = self.value_type(scope, operand)?;
                let ok = match op {
                    UnOp::Neg => t.is_promoted(),
                    UnOp::Not => t == ScalarType::Boolean,
                    UnOp::BitNot => matches!(t, ScalarType::Int | ScalarType::Long),
                };
                if !ok {
                    return mismatch(format!("operator '{}' not defined for {}", op.symbol(), t.name()));
                }
                t
            }
            Expr::Conditional {
                cond,
                then_value,
                else_value,
            } => {
                self.expect(scope, cond, ScalarType::Boolean, "condition")?;
                let a = self.value_type(scope, then_value)?;
                let b = self.value_type(scope, else_value)?;
                if a != b {
                    return mismatch(format!(
                        "conditional branches disagree: {} vs {}",
                        a.name(),
                        b.name()
                    ));
                }
                a
            }
            Expr::Cast { to, value, .. } => {
                let from = self.value_type(scope, value)?;
                if from != *to && (from == ScalarType::Boolean || *to == ScalarType::Boolean) {
                    return mismatch(format!("cannot cast {} to {}", from.name(), to.name()));
                }
                *to
            }
            Expr::Assign { target, op, value } => {
                let t = self.place_type(scope, target)?;
                let v = self.value_type(scope, value)?;
                match op {
                    None if v != t => {
                        return mismatch(format!(
                            "cannot assign {} to {} '{}'",
                            v.name(),
                            t.name(),
                            target
                        ))
                    }
                    None => {}
                    Some(op) => {
                        if op.is_comparison() || op.is_short_circuit() {
                            return fault(
                                ErrorKind::UnsupportedConstruct,
                                format!("'{}=' is not an assignment operator", op.symbol()),
                            );
                        }
                        if binary_type(*op, t, v)? != t {
                            return mismatch(format!(
                                "'{}=' changes the type of '{}'",
                                op.symbol(),
                                target
                            ));
                        }
                    }
                }
                t
            }
            Expr::Step { target, step, .. } => {
                let t = self.place_type(scope, target)?;
                if !t.is_numeric() {
                    return mismatch(format!("'{}' on {} '{}'", step.symbol(), t.name(), target));
                }
                t
            }
            Expr::Call { method, args } => {
                let Some(callee) = self.descriptor.method(method) else {
                    return fault(
                        ErrorKind::UnknownSymbol,
                        format!("call to undeclared method '{}'", method),
                    );
                };
                if callee.name == self.descriptor.entry() {
                    return fault(
                        ErrorKind::UnsupportedConstruct,
                        format!("the entry point '{}' cannot be called", method),
                    );
                }
                if args.len() != callee.params.len() {
                    return mismatch(format!(
                        "'{}' takes {} argument(s), {} given",
                        method,
                        callee.params.len(),
                        args.len()
                    ));
                }
                for (arg, param) in args.iter().zip(&callee.params) {
                    self.expect(scope, arg, param.ty, &format!("argument '{}'", param.name))?;
                }
                return Ok(callee.ret);
            }
            Expr::Atomic { op, slot, args } => {
                let field = self.field(&slot.field)?;
                let Some(width) = field.atomic_width() else {
                    return fault(
                        ErrorKind::AtomicMisuse,
                        format!("{} on non-atomic field '{}'", op.source_name(), slot.field),
                    );
                };
                match (&slot.index, field.is_array()) {
                    (Some(index), true) => self.expect_index(scope, index)?,
                    (None, false) => {}
                    (Some(_), false) => {
                        return fault(
                            ErrorKind::AtomicMisuse,
                            format!("atomic field '{}' is not an array", slot.field),
                        )
                    }
                    (None, true) => {
                        return fault(
                            ErrorKind::AtomicMisuse,
                            format!("atomic array '{}' used without an index", slot.field),
                        )
                    }
                }
                if args.len() != op.arity() {
                    return mismatch(format!(
                        "{} takes {} operand(s), {} given",
                        op.source_name(),
                        op.arity(),
                        args.len()
                    ));
                }
                let want = width_type(width);
                for arg in args {
                    let got = self.value_type(scope, arg)?;
                    if got != want {
                        return fault(
                            ErrorKind::AtomicMisuse,
                            format!(
                                "{} operand must be {} for a {}-bit slot, found {}",
                                op.source_name(),
                                want.name(),
                                width.bits(),
                                got.name()
                            ),
                        );
                    }
                }
                want
            }
            Expr::Builtin { func, args } => {
                if args.len() != func.arity() {
                    return mismatch(format!(
                        "{} takes {} argument(s), {} given",
                        func.name(),
                        func.arity(),
                        args.len()
                    ));
                }
                let types = args
                    .iter()
                    .map(|a| self.value_type(scope, a))
                    .collect::<Result<Vec<_>, _>>()?;
                builtin_type(*func, &types)?
            }
        };
        Ok(Some(t))
    }
}

fn binary_type(op: BinOp, l: ScalarType, r: ScalarType) -> Result<ScalarType, Fault> {
    use ScalarType::*;
    let bad = || {
        mismatch(format!(
            "operator '{}' not defined for {} and {}",
            op.symbol(),
            l.name(),
            r.name()
        ))
    };
    if op.is_shift() {
        return match (l, r) {
            (Int | Long, Int | Long) => Ok(l),
            _ => bad(),
        };
    }
    if l != r {
        return bad();
    }
    match op {
        BinOp::And | BinOp::Or if l == Boolean => Ok(Boolean),
        BinOp::Eq | BinOp::Ne if l == Boolean || l.is_promoted() => Ok(Boolean),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge if l.is_promoted() => Ok(Boolean),
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor if matches!(l, Boolean | Int | Long) => Ok(l),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem if l.is_promoted() => Ok(l),
        _ => bad(),
    }
}

fn builtin_type(func: Builtin, args: &[ScalarType]) -> Result<ScalarType, Fault> {
    let bad = || {
        let names: Vec<&str> = args.iter().map(|t| t.name()).collect();
        mismatch(format!("{}({}) is not defined", func.name(), names.join(", ")))
    };
    match func {
        Builtin::PassId => Ok(ScalarType::Int),
        f if f.is_work_item_query() => {
            if args[0] == ScalarType::Int {
                Ok(ScalarType::Int)
            } else {
                bad()
            }
        }
        Builtin::Abs if args[0].is_promoted() => Ok(args[0]),
        Builtin::Min | Builtin::Max if args[0] == args[1] && args[0].is_promoted() => Ok(args[0]),
        Builtin::Pow if args[0] == args[1] && args[0].is_floating() => Ok(args[0]),
        Builtin::Sqrt
        | Builtin::Sin
        | Builtin::Cos
        | Builtin::Tan
        | Builtin::Exp
        | Builtin::Log
        | Builtin::Floor
        | Builtin::Ceil
            if args[0].is_floating() =>
        {
            Ok(args[0])
        }
        _ => bad(),
    }
}

/// Whether control can never fall off the end of `stmts`.
fn always_returns(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|s| match s {
        Stmt::Return(_) => true,
        Stmt::If {
            then_body,
            else_body,
            ..
        } => always_returns(then_body) && always_returns(else_body),
        Stmt::Block(body) => always_returns(body),
        Stmt::While { cond, body } => {
            matches!(cond, Expr::Literal(v) if v.as_bool() == Some(true)) && !breaks(body)
        }
        _ => false,
    })
}

/// Whether `stmts` contain a `break` for the innermost enclosing loop.
fn breaks(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|s| match s {
        Stmt::Break => true,
        Stmt::If {
            then_body,
            else_body,
            ..
        } => breaks(then_body) || breaks(else_body),
        Stmt::Block(body) => breaks(body),
        _ => false,
    })
}

/// Checks the statements of one method, tracking the pre-order
/// statement position for diagnostics.
struct MethodChecker<'d, 'm> {
    typer: Typer<'d>,
    kernel: &'d str,
    method: &'m Method,
    scope: Scope,
    position: usize,
    loop_depth: usize,
}

impl<'d, 'm> MethodChecker<'d, 'm> {
    fn error(&self, position: usize, f: Fault) -> CompileError {
        CompileError::new(f.kind, self.kernel, f.message)
            .in_method(&self.method.name)
            .at(position)
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        self.scope.push();
        let result = stmts.iter().try_for_each(|s| self.stmt(s));
        self.scope.pop();
        result
    }

    fn value(&self, pos: usize, expr: &Expr) -> Result<ScalarType, CompileError> {
        self.typer
            .value_type(&self.scope, expr)
            .map_err(|f| self.error(pos, f))
    }

    fn condition(&self, pos: usize, cond: &Expr) -> Result<(), CompileError> {
        let t = self.value(pos, cond)?;
        if t != ScalarType::Boolean {
            return Err(self.error(
                pos,
                Fault {
                    kind: ErrorKind::TypeMismatch,
                    message: format!("condition must be boolean, found {}", t.name()),
                },
            ));
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        let pos = self.position;
        self.position += 1;
        match stmt {
            Stmt::Let { name, ty, init } => {
                if let Some(init) = init {
                    let t = self.value(pos, init)?;
                    if t != *ty {
                        return Err(self.error(
                            pos,
                            Fault {
                                kind: ErrorKind::TypeMismatch,
                                message: format!(
                                    "cannot initialize {} '{}' with {}",
                                    ty.name(),
                                    name,
                                    t.name()
                                ),
                            },
                        ));
                    }
                }
                if !valid_local_name(name) {
                    return Err(self.error(
                        pos,
                        Fault {
                            kind: ErrorKind::UnsupportedConstruct,
                            message: format!("'{}' cannot be used as a local name", name),
                        },
                    ));
                }
                if !self.scope.declare(name, *ty) {
                    return Err(self.error(
                        pos,
                        Fault {
                            kind: ErrorKind::UnsupportedConstruct,
                            message: format!("local '{}' declared twice in one scope", name),
                        },
                    ));
                }
            }
            Stmt::Expr(e) => {
                self.typer
                    .type_of(&self.scope, e)
                    .map_err(|f| self.error(pos, f))?;
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.condition(pos, cond)?;
                self.block(then_body)?;
                self.block(else_body)?;
            }
            Stmt::While { cond, body } => {
                self.condition(pos, cond)?;
                self.loop_body(body)?;
            }
            Stmt::DoWhile { body, cond } => {
                self.loop_body(body)?;
                self.condition(pos, cond)?;
            }
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => {
                self.scope.push();
                let result = self.for_parts(pos, init, cond.as_ref(), update, body);
                self.scope.pop();
                result?;
            }
            Stmt::Break | Stmt::Continue => {
                if self.loop_depth == 0 {
                    let word = if matches!(stmt, Stmt::Break) { "break" } else { "continue" };
                    return Err(self.error(
                        pos,
                        Fault {
                            kind: ErrorKind::UnsupportedConstruct,
                            message: format!("'{}' outside of a loop", word),
                        },
                    ));
                }
            }
            Stmt::Return(value) => {
                let got = match value {
                    Some(e) => Some(self.value(pos, e)?),
                    None => None,
                };
                if got != self.method.ret {
                    let name = |t: Option<ScalarType>| t.map_or("void", |t| t.name());
                    return Err(self.error(
                        pos,
                        Fault {
                            kind: ErrorKind::TypeMismatch,
                            message: format!(
                                "'{}' returns {}, found return of {}",
                                self.method.name,
                                name(self.method.ret),
                                name(got)
                            ),
                        },
                    ));
                }
            }
            Stmt::Block(body) => self.block(body)?,
        }
        Ok(())
    }

    fn loop_body(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        self.loop_depth += 1;
        let result = self.block(body);
        self.loop_depth -= 1;
        result
    }

    fn for_parts(
        &mut self,
        pos: usize,
        init: &[Stmt],
        cond: Option<&Expr>,
        update: &[Expr],
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        for s in init {
            if !matches!(s, Stmt::Let { .. } | Stmt::Expr(_)) {
                let p = self.position;
                return Err(self.error(
                    p,
                    Fault {
                        kind: ErrorKind::UnsupportedConstruct,
                        message: "for-loop initializers must be declarations or expressions"
                            .to_string(),
                    },
                ));
            }
            self.stmt(s)?;
        }
        if let Some(c) = cond {
            self.condition(pos, c)?;
        }
        for u in update {
            self.typer
                .type_of(&self.scope, u)
                .map_err(|f| self.error(pos, f))?;
        }
        self.loop_body(body)
    }
}

/// Check every method of `descriptor`.
pub fn check(descriptor: &KernelDescriptor) -> Result<(), CompileError> {
    for method in descriptor.methods() {
        let mut checker = MethodChecker {
            typer: Typer::new(descriptor),
            kernel: descriptor.name(),
            method,
            scope: Scope::for_method(method),
            position: 0,
            loop_depth: 0,
        };
        for p in &method.params {
            if !valid_local_name(&p.name) {
                return Err(CompileError::new(
                    ErrorKind::UnsupportedConstruct,
                    descriptor.name(),
                    format!("'{}' cannot be used as a parameter name", p.name),
                )
                .in_method(&method.name));
            }
        }
        for stmt in &method.body {
            checker.stmt(stmt)?;
        }
        if method.ret.is_some() && !always_returns(&method.body) {
            return Err(CompileError::new(
                ErrorKind::TypeMismatch,
                descriptor.name(),
                format!("'{}' can finish without returning a value", method.name),
            )
            .in_method(&method.name));
        }
    }
    Ok(())
}
