//! Tree-walking interpreter for one work-item.
//!
//! Runs a type-checked method body with the source language's semantics:
//! integer arithmetic wraps at its width, shift counts are masked, integer
//! division by zero traps, float `%` is `fmod`, and float-to-integer casts
//! saturate. Operands are evaluated left to right, each exactly once.

use crate::atomic::{AtomicOp, AtomicWidth};
use crate::ir::{BinOp, Builtin, Expr, Method, Place, SlotRef, Step, Stmt, UnOp, Value};
use crate::schema::KernelDescriptor;

use super::Bound;

/// A work-item fault. Ends the item and rolls the whole run back.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Trap {
    pub message: String,
}

type Eval<T> = Result<T, Trap>;

fn trap<T>(message: String) -> Eval<T> {
    Err(Trap { message })
}

/// Ids and sizes visible to one work-item.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WorkItem {
    pub global_id: [usize; 3],
    pub global_size: [usize; 3],
    pub local_size: [usize; 3],
    pub pass_id: i32,
}

impl WorkItem {
    fn query(&self, func: Builtin, dim: i64) -> i32 {
        let Some(d) = usize::try_from(dim).ok().filter(|d| *d < 3) else {
            // Out-of-range dimensions: ids read 0, sizes read 1.
            return if matches!(func, Builtin::GlobalId | Builtin::LocalId | Builtin::GroupId) {
                0
            } else {
                1
            };
        };
        let v = match func {
            Builtin::GlobalId => self.global_id[d],
            Builtin::LocalId => self.global_id[d] % self.local_size[d],
            Builtin::GroupId => self.global_id[d] / self.local_size[d],
            Builtin::GlobalSize => self.global_size[d],
            Builtin::LocalSize => self.local_size[d],
            Builtin::NumGroups => self.global_size[d] / self.local_size[d],
            _ => 0,
        };
        v as i32
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Option<Value>),
}

pub(crate) struct Interp<'a> {
    descriptor: &'a KernelDescriptor,
    bound: &'a [Bound],
    item: WorkItem,
    /// Work-item private writes to scalar fields.
    scalar_writes: Vec<(usize, Value)>,
    locals: Vec<(String, Value)>,
    /// Start of the current call frame in `locals`.
    frame: usize,
}

impl<'a> Interp<'a> {
    pub(crate) fn new(descriptor: &'a KernelDescriptor, bound: &'a [Bound], item: WorkItem) -> Self {
        Self {
            descriptor,
            bound,
            item,
            scalar_writes: Vec::new(),
            locals: Vec::new(),
            frame: 0,
        }
    }

    /// Run the entry point for this work-item.
    pub(crate) fn run(&mut self) -> Eval<()> {
        let descriptor = self.descriptor;
        self.invoke(descriptor.entry_method(), Vec::new()).map(|_| ())
    }

    fn invoke(&mut self, method: &Method, args: Vec<Value>) -> Eval<Option<Value>> {
        let saved = self.frame;
        self.frame = self.locals.len();
        for (p, v) in method.params.iter().zip(args) {
            self.locals.push((p.name.clone(), v));
        }
        let flow = self.block(&method.body);
        self.locals.truncate(self.frame);
        self.frame = saved;
        match flow? {
            Flow::Return(v) => Ok(v),
            _ => Ok(None),
        }
    }

    // ─── Storage ───────────────────────────────────────────────────

    fn local(&self, name: &str) -> Eval<Value> {
        match self.locals[self.frame..].iter().rev().find(|(n, _)| n == name) {
            Some((_, v)) => Ok(*v),
            None => trap(format!("unbound local '{}'", name)),
        }
    }

    fn set_local(&mut self, name: &str, value: Value) -> Eval<()> {
        let frame = self.frame;
        match self.locals[frame..].iter_mut().rev().find(|(n, _)| n == name) {
            Some(slot) => {
                slot.1 = value;
                Ok(())
            }
            None => trap(format!("unbound local '{}'", name)),
        }
    }

    fn bound(&self, name: &str) -> Eval<(usize, &'a Bound)> {
        let bound = self.bound;
        match self.descriptor.field_position(name) {
            Some(i) => Ok((i, &bound[i])),
            None => trap(format!("unknown field '{}'", name)),
        }
    }

    fn scalar_field(&self, name: &str) -> Eval<Value> {
        let (i, bound) = self.bound(name)?;
        if let Some((_, v)) = self.scalar_writes.iter().find(|(f, _)| *f == i) {
            return Ok(*v);
        }
        match bound {
            Bound::Scalar(v) => Ok(*v),
            _ => trap(format!("field '{}' is not a scalar", name)),
        }
    }

    fn array(&self, name: &str) -> Eval<&'a super::Buffer> {
        match self.bound(name)? {
            (_, Bound::Array(b)) => Ok(b),
            _ => trap(format!("field '{}' is not an array", name)),
        }
    }

    fn checked_index(name: &str, index: Value, len: usize) -> Eval<usize> {
        let i = index.as_i64().unwrap_or(-1);
        if i < 0 || i as usize >= len {
            return trap(format!(
                "index {} out of bounds for '{}' of length {}",
                i, name, len
            ));
        }
        Ok(i as usize)
    }

    /// A resolved store location: the index is evaluated once.
    fn resolve(&mut self, place: &Place) -> Eval<Slot> {
        Ok(match place {
            Place::Local(name) => Slot::Local(name.clone()),
            Place::Field(name) => Slot::Field(self.bound(name)?.0),
            Place::Index { array, index } => {
                let idx = self.eval(index)?;
                let buffer = self.array(array)?;
                Slot::Element(array.clone(), Self::checked_index(array, idx, buffer.len())?)
            }
        })
    }

    fn read(&self, slot: &Slot) -> Eval<Value> {
        match slot {
            Slot::Local(name) => self.local(name),
            Slot::Field(i) => self.scalar_field(&self.descriptor.fields()[*i].name),
            Slot::Element(array, i) => match self.array(array)?.load(*i) {
                Some(v) => Ok(v),
                None => trap(format!("index {} out of bounds for '{}'", i, array)),
            },
        }
    }

    fn write(&mut self, slot: &Slot, value: Value) -> Eval<()> {
        match slot {
            Slot::Local(name) => self.set_local(name, value),
            Slot::Field(i) => {
                match self.scalar_writes.iter_mut().find(|(f, _)| f == i) {
                    Some(entry) => entry.1 = value,
                    None => self.scalar_writes.push((*i, value)),
                }
                Ok(())
            }
            Slot::Element(array, i) => {
                if self.array(array)?.store(*i, value) {
                    Ok(())
                } else {
                    trap(format!("index {} out of bounds for '{}'", i, array))
                }
            }
        }
    }

    // ─── Statements ────────────────────────────────────────────────

    fn block(&mut self, stmts: &[Stmt]) -> Eval<Flow> {
        let mark = self.locals.len();
        let mut flow = Flow::Normal;
        for stmt in stmts {
            flow = self.stmt(stmt)?;
            if !matches!(flow, Flow::Normal) {
                break;
            }
        }
        self.locals.truncate(mark);
        Ok(flow)
    }

    fn truthy(&mut self, cond: &Expr) -> Eval<bool> {
        match self.eval(cond)? {
            Value::Boolean(b) => Ok(b),
            other => trap(format!("condition evaluated to {}", other)),
        }
    }

    fn stmt(&mut self, stmt: &Stmt) -> Eval<Flow> {
        match stmt {
            Stmt::Let { name, ty, init } => {
                let v = match init {
                    Some(e) => self.eval(e)?.cast(*ty),
                    None => Value::zero(*ty),
                };
                self.locals.push((name.clone(), v));
            }
            Stmt::Expr(Expr::Call { method, args }) => {
                self.call(method, args)?;
            }
            Stmt::Expr(e) => {
                self.eval(e)?;
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let branch = if self.truthy(cond)? { then_body } else { else_body };
                return self.block(branch);
            }
            Stmt::While { cond, body } => {
                while self.truthy(cond)? {
                    match self.block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            Stmt::DoWhile { body, cond } => loop {
                match self.block(body)? {
                    Flow::Break => break,
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    Flow::Normal | Flow::Continue => {}
                }
                if !self.truthy(cond)? {
                    break;
                }
            },
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => {
                let mark = self.locals.len();
                let flow = self.for_loop(init, cond.as_ref(), update, body);
                self.locals.truncate(mark);
                return flow;
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Return(value) => {
                let v = match value {
                    Some(e) => Some(self.eval(e)?),
                    None => None,
                };
                return Ok(Flow::Return(v));
            }
            Stmt::Block(body) => return self.block(body),
        }
        Ok(Flow::Normal)
    }

    fn for_loop(
        &mut self,
        init: &[Stmt],
        cond: Option<&Expr>,
        update: &[Expr],
        body: &[Stmt],
    ) -> Eval<Flow> {
        for s in init {
            self.stmt(s)?;
        }
        loop {
            if let Some(c) = cond {
                if !self.truthy(c)? {
                    break;
                }
            }
            match self.block(body)? {
                Flow::Break => break,
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Normal | Flow::Continue => {}
            }
            for u in update {
                self.eval(u)?;
            }
        }
        Ok(Flow::Normal)
    }

    // ─── Expressions ───────────────────────────────────────────────

    fn call(&mut self, name: &str, args: &[Expr]) -> Eval<Option<Value>> {
        let descriptor = self.descriptor;
        let Some(method) = descriptor.method(name) else {
            return trap(format!("unknown method '{}'", name));
        };
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(self.eval(a)?);
        }
        self.invoke(method, values)
    }

    fn eval(&mut self, expr: &Expr) -> Eval<Value> {
        match expr {
            Expr::Literal(v) => Ok(*v),
            Expr::Local(name) => self.local(name),
            Expr::Field(name) => self.scalar_field(name),
            Expr::Index { array, index } => {
                let i = self.eval(index)?;
                let buffer = self.array(array)?;
                let i = Self::checked_index(array, i, buffer.len())?;
                match buffer.load(i) {
                    Some(v) => Ok(v),
                    None => trap(format!("index {} out of bounds for '{}'", i, array)),
                }
            }
            Expr::Length(name) => match self.bound(name)? {
                (_, Bound::Array(b)) => Ok(Value::Int(b.len() as i32)),
                (_, Bound::Slots(s)) => Ok(Value::Int(s.len() as i32)),
                _ => trap(format!("field '{}' has no length", name)),
            },
            Expr::Binary { op, lhs, rhs } => match op {
                BinOp::And => Ok(Value::Boolean(self.truthy(lhs)? && self.truthy(rhs)?)),
                BinOp::Or => Ok(Value::Boolean(self.truthy(lhs)? || self.truthy(rhs)?)),
                _ => {
                    let l = self.eval(lhs)?;
                    let r = self.eval(rhs)?;
                    binary(*op, l, r)
                }
            },
            Expr::Unary { op, operand } => unary(*op, self.eval(operand)?),
            Expr::Conditional {
                cond,
                then_value,
                else_value,
            } => {
                if self.truthy(cond)? {
                    self.eval(then_value)
                } else {
                    self.eval(else_value)
                }
            }
            Expr::Cast { to, value, .. } => Ok(self.eval(value)?.cast(*to)),
            Expr::Assign {
                target,
                op: None,
                value,
            } => {
                let slot = self.resolve(target)?;
                let v = self.eval(value)?;
                self.write(&slot, v)?;
                Ok(v)
            }
            Expr::Assign {
                target,
                op: Some(op),
                value,
            } => {
                let slot = self.resolve(target)?;
                let old = self.read(&slot)?;
                let v = self.eval(value)?;
                let result = binary(*op, old, v)?.cast(old.ty());
                self.write(&slot, result)?;
                Ok(result)
            }
            Expr::Step {
                target,
                step,
                prefix,
            } => {
                let slot = self.resolve(target)?;
                let old = self.read(&slot)?;
                let new = stepped(old, *step);
                self.write(&slot, new)?;
                Ok(if *prefix { new } else { old })
            }
            Expr::Call { method, args } => match self.call(method, args)? {
                Some(v) => Ok(v),
                None => trap(format!("void method '{}' used as a value", method)),
            },
            Expr::Atomic { op, slot, args } => self.atomic(*op, slot, args),
            Expr::Builtin { func, args } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.eval(a)?);
                }
                self.builtin(*func, &values)
            }
        }
    }

    fn atomic(&mut self, op: AtomicOp, slot: &SlotRef, args: &[Expr]) -> Eval<Value> {
        let index = match &slot.index {
            Some(e) => Some(self.eval(e)?),
            None => None,
        };
        let mut operands = Vec::with_capacity(args.len());
        for a in args {
            match self.eval(a)?.as_i64() {
                Some(v) => operands.push(v),
                None => return trap(format!("non-integer operand to {}", op)),
            }
        }
        let slots = match self.bound(&slot.field)? {
            (_, Bound::Slots(s)) => s,
            _ => return trap(format!("field '{}' is not atomic", slot.field)),
        };
        let i = match index {
            Some(idx) => Self::checked_index(&slot.field, idx, slots.len())?,
            None => 0,
        };
        let Some(cell) = slots.slot(i) else {
            return trap(format!("atomic field '{}' has no slot {}", slot.field, i));
        };
        let result = cell.apply(op, &operands);
        Ok(match slots.width() {
            AtomicWidth::Int => Value::Int(result as i32),
            AtomicWidth::Long => Value::Long(result),
        })
    }

    fn builtin(&self, func: Builtin, args: &[Value]) -> Eval<Value> {
        if func == Builtin::PassId {
            return Ok(Value::Int(self.item.pass_id));
        }
        if func.is_work_item_query() {
            let dim = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
            return Ok(Value::Int(self.item.query(func, dim)));
        }
        math(func, args)
    }
}

/// A store location with its index already evaluated.
enum Slot {
    Local(String),
    Field(usize),
    Element(String, usize),
}

fn stepped(old: Value, step: Step) -> Value {
    let delta = if step == Step::Inc { 1 } else { -1 };
    match old {
        Value::Float(v) => Value::Float(v + delta as f32),
        Value::Double(v) => Value::Double(v + delta as f64),
        Value::Long(v) => Value::Long(v.wrapping_add(delta)),
        other => {
            let v = other.as_i64().unwrap_or(0);
            Value::Long(v + delta).cast(other.ty())
        }
    }
}

macro_rules! integral {
    ($op:expr, $a:expr, $b:expr, $ctor:path) => {{
        let (a, b) = ($a, $b);
        match $op {
            BinOp::Add => $ctor(a.wrapping_add(b)),
            BinOp::Sub => $ctor(a.wrapping_sub(b)),
            BinOp::Mul => $ctor(a.wrapping_mul(b)),
            BinOp::Div | BinOp::Rem if b == 0 => {
                return trap("integer division by zero".to_string())
            }
            BinOp::Div => $ctor(a.wrapping_div(b)),
            BinOp::Rem => $ctor(a.wrapping_rem(b)),
            BinOp::BitAnd => $ctor(a & b),
            BinOp::BitOr => $ctor(a | b),
            BinOp::BitXor => $ctor(a ^ b),
            BinOp::Eq => Value::Boolean(a == b),
            BinOp::Ne => Value::Boolean(a != b),
            BinOp::Lt => Value::Boolean(a < b),
            BinOp::Le => Value::Boolean(a <= b),
            BinOp::Gt => Value::Boolean(a > b),
            BinOp::Ge => Value::Boolean(a >= b),
            _ => return trap(format!("operator '{}' on integers", $op.symbol())),
        }
    }};
}

macro_rules! floating {
    ($op:expr, $a:expr, $b:expr, $ctor:path) => {{
        let (a, b) = ($a, $b);
        match $op {
            BinOp::Add => $ctor(a + b),
            BinOp::Sub => $ctor(a - b),
            BinOp::Mul => $ctor(a * b),
            BinOp::Div => $ctor(a / b),
            BinOp::Rem => $ctor(a % b),
            BinOp::Eq => Value::Boolean(a == b),
            BinOp::Ne => Value::Boolean(a != b),
            BinOp::Lt => Value::Boolean(a < b),
            BinOp::Le => Value::Boolean(a <= b),
            BinOp::Gt => Value::Boolean(a > b),
            BinOp::Ge => Value::Boolean(a >= b),
            _ => return trap(format!("operator '{}' on floating point", $op.symbol())),
        }
    }};
}

pub(crate) fn binary(op: BinOp, l: Value, r: Value) -> Eval<Value> {
    if op.is_shift() {
        return shift(op, l, r);
    }
    Ok(match (l, r) {
        (Value::Int(a), Value::Int(b)) => integral!(op, a, b, Value::Int),
        (Value::Long(a), Value::Long(b)) => integral!(op, a, b, Value::Long),
        (Value::Float(a), Value::Float(b)) => floating!(op, a, b, Value::Float),
        (Value::Double(a), Value::Double(b)) => floating!(op, a, b, Value::Double),
        (Value::Boolean(a), Value::Boolean(b)) => match op {
            BinOp::BitAnd | BinOp::And => Value::Boolean(a & b),
            BinOp::BitOr | BinOp::Or => Value::Boolean(a | b),
            BinOp::BitXor => Value::Boolean(a ^ b),
            BinOp::Eq => Value::Boolean(a == b),
            BinOp::Ne => Value::Boolean(a != b),
            _ => return trap(format!("operator '{}' on booleans", op.symbol())),
        },
        _ => {
            return trap(format!(
                "operator '{}' on {} and {}",
                op.symbol(),
                l.ty().name(),
                r.ty().name()
            ))
        }
    })
}

fn shift(op: BinOp, l: Value, r: Value) -> Eval<Value> {
    let Some(count) = r.as_i64() else {
        return trap(format!("shift count of type {}", r.ty().name()));
    };
    Ok(match l {
        Value::Int(a) => {
            let c = (count & 31) as u32;
            Value::Int(match op {
                BinOp::Shl => a.wrapping_shl(c),
                BinOp::Shr => a >> c,
                _ => ((a as u32) >> c) as i32,
            })
        }
        Value::Long(a) => {
            let c = (count & 63) as u32;
            Value::Long(match op {
                BinOp::Shl => a.wrapping_shl(c),
                BinOp::Shr => a >> c,
                _ => ((a as u64) >> c) as i64,
            })
        }
        other => return trap(format!("shift of {}", other.ty().name())),
    })
}

fn unary(op: UnOp, v: Value) -> Eval<Value> {
    Ok(match (op, v) {
        (UnOp::Neg, Value::Int(a)) => Value::Int(a.wrapping_neg()),
        (UnOp::Neg, Value::Long(a)) => Value::Long(a.wrapping_neg()),
        (UnOp::Neg, Value::Float(a)) => Value::Float(-a),
        (UnOp::Neg, Value::Double(a)) => Value::Double(-a),
        (UnOp::Not, Value::Boolean(b)) => Value::Boolean(!b),
        (UnOp::BitNot, Value::Int(a)) => Value::Int(!a),
        (UnOp::BitNot, Value::Long(a)) => Value::Long(!a),
        _ => return trap(format!("operator '{}' on {}", op.symbol(), v.ty().name())),
    })
}

fn math(func: Builtin, args: &[Value]) -> Eval<Value> {
    let unary_f64 = |f: fn(f64) -> f64| -> Eval<Value> {
        match args.first() {
            Some(Value::Float(a)) => Ok(Value::Float(f(*a as f64) as f32)),
            Some(Value::Double(a)) => Ok(Value::Double(f(*a))),
            _ => trap(format!("{} of a non-floating value", func.name())),
        }
    };
    let pair = || match (args.first(), args.get(1)) {
        (Some(a), Some(b)) => Ok((*a, *b)),
        _ => trap(format!("{} expects two arguments", func.name())),
    };
    match func {
        Builtin::Abs => Ok(match args.first() {
            Some(Value::Int(a)) => Value::Int(a.wrapping_abs()),
            Some(Value::Long(a)) => Value::Long(a.wrapping_abs()),
            Some(Value::Float(a)) => Value::Float(a.abs()),
            Some(Value::Double(a)) => Value::Double(a.abs()),
            _ => return trap("abs of a non-numeric value".to_string()),
        }),
        Builtin::Min | Builtin::Max => {
            let min = func == Builtin::Min;
            Ok(match pair()? {
                (Value::Int(a), Value::Int(b)) => Value::Int(if min { a.min(b) } else { a.max(b) }),
                (Value::Long(a), Value::Long(b)) => Value::Long(if min { a.min(b) } else { a.max(b) }),
                (Value::Float(a), Value::Float(b)) => {
                    Value::Float(if min { a.min(b) } else { a.max(b) })
                }
                (Value::Double(a), Value::Double(b)) => {
                    Value::Double(if min { a.min(b) } else { a.max(b) })
                }
                (a, b) => {
                    return trap(format!(
                        "{}({}, {}) is not defined",
                        func.name(),
                        a.ty().name(),
                        b.ty().name()
                    ))
                }
            })
        }
        Builtin::Pow => match pair()? {
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a.powf(b))),
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a.powf(b))),
            _ => trap("pow of non-floating values".to_string()),
        },
        Builtin::Sqrt => unary_f64(f64::sqrt),
        Builtin::Sin => unary_f64(f64::sin),
        Builtin::Cos => unary_f64(f64::cos),
        Builtin::Tan => unary_f64(f64::tan),
        Builtin::Exp => unary_f64(f64::exp),
        Builtin::Log => unary_f64(f64::ln),
        Builtin::Floor => unary_f64(f64::floor),
        Builtin::Ceil => unary_f64(f64::ceil),
        other => trap(format!("{} outside a work-item", other.name())),
    }
}
