//! Expression emission.
//!
//! Every expression is emitted as an [`Emitted`]: a list of sequenced
//! prefix expressions plus a final value. Prefixes must run, in order,
//! before the value is evaluated. At statement level they become
//! separate statements; inside conditions and short-circuit operands
//! they are joined with the comma operator.

use crate::atomic::{AtomicOp, AtomicWidth};
use crate::diagnostic::{CompileError, ErrorKind};
use crate::ir::{walk_expr, BinOp, Builtin, Expr, Place, ScalarType, Step, UnOp};
use crate::typeck::Fault;

use super::emitter::FnEmitter;

pub(crate) struct Emitted {
    pub pre: Vec<String>,
    pub value: String,
    /// True when `value` needs no parentheses as an operand.
    simple: bool,
}

impl Emitted {
    fn simple(value: String) -> Self {
        Self {
            pre: Vec::new(),
            value,
            simple: true,
        }
    }

    fn compound(value: String) -> Self {
        Self {
            pre: Vec::new(),
            value,
            simple: false,
        }
    }

    fn with_pre(mut self, pre: Vec<String>) -> Self {
        self.pre = pre;
        self
    }

    fn operand(&self) -> String {
        paren(&self.value, self.simple)
    }

    /// One C expression: the prefix sequenced before the value.
    pub(crate) fn inline(self) -> String {
        if self.pre.is_empty() {
            self.value
        } else {
            format!("({}, {})", self.pre.join(", "), self.value)
        }
    }

    fn inline_operand(self) -> String {
        if self.pre.is_empty() {
            self.operand()
        } else {
            self.inline()
        }
    }
}

fn paren(value: &str, simple: bool) -> String {
    if simple {
        value.to_string()
    } else {
        format!("({})", value)
    }
}

/// Whether evaluating `expr` stores to a location `hit` matches.
fn writes(expr: &Expr, hit: &dyn Fn(&Place) -> bool) -> bool {
    let mut found = false;
    walk_expr(expr, &mut |e| match e {
        Expr::Assign { target, .. } | Expr::Step { target, .. } if hit(target) => found = true,
        _ => {}
    });
    found
}

fn same_location(target: &Place) -> impl Fn(&Place) -> bool + '_ {
    move |p: &Place| match (target, p) {
        (Place::Local(a), Place::Local(b)) | (Place::Field(a), Place::Field(b)) => a == b,
        (Place::Index { array: a, .. }, Place::Index { array: b, .. }) => a == b,
        _ => false,
    }
}

/// `l op r` for operands of type `ty`, with Java semantics where C
/// differs.
fn combine(op: BinOp, ty: ScalarType, l: &str, r: &str) -> Emitted {
    match op {
        BinOp::Rem if ty.is_floating() => Emitted::simple(format!("fmod({}, {})", l, r)),
        BinOp::UShr => {
            let unsigned = if ty == ScalarType::Long { "ulong" } else { "unsigned int" };
            Emitted::compound(format!(
                "({})(({}){} >> {})",
                ty.cl_name(),
                unsigned,
                l,
                r
            ))
        }
        _ => Emitted::compound(format!("{} {} {}", l, op.symbol(), r)),
    }
}

/// Whether `target op= value` can be emitted as the C compound operator.
fn native_compound(op: BinOp, ty: ScalarType) -> bool {
    !(op == BinOp::UShr || (op == BinOp::Rem && ty.is_floating()))
}

impl FnEmitter<'_> {
    /// Emit operands left to right. If any operand has a side effect and
    /// at least two are non-literal, every non-literal operand but the
    /// last is hoisted into a temporary.
    fn sequence(&mut self, operands: &[&Expr]) -> Result<(Vec<String>, Vec<Emitted>), CompileError> {
        let hazard = operands.iter().any(|e| e.has_side_effects())
            && operands.iter().filter(|e| !e.is_literal()).count() >= 2;
        let last = operands.len().saturating_sub(1);
        let mut pre = Vec::new();
        let mut values = Vec::with_capacity(operands.len());
        for (i, operand) in operands.iter().enumerate() {
            let mut e = self.expr(operand)?;
            pre.append(&mut e.pre);
            if hazard && i < last && !operand.is_literal() {
                let t = self.temp(self.ty(operand)?);
                pre.push(format!("{} = {}", t, e.operand()));
                values.push(Emitted::simple(t));
            } else {
                values.push(e);
            }
        }
        Ok((pre, values))
    }

    /// [`Self::sequence`], keeping only the operand texts.
    fn sequence_text(&mut self, operands: &[&Expr]) -> Result<(Vec<String>, Vec<String>), CompileError> {
        let (pre, values) = self.sequence(operands)?;
        Ok((pre, values.into_iter().map(|e| e.value).collect()))
    }

    fn array_field(&self, name: &str) -> String {
        format!("this->{}", name)
    }

    pub(super) fn expr(&mut self, expr: &Expr) -> Result<Emitted, CompileError> {
        Ok(match expr {
            Expr::Literal(v) => {
                let text = v.to_cl();
                let simple = !text.starts_with('-');
                Emitted {
                    pre: Vec::new(),
                    value: text,
                    simple,
                }
            }
            Expr::Local(name) => Emitted::simple(name.clone()),
            Expr::Field(name) => Emitted::simple(format!("this->{}", name)),
            Expr::Index { array, index } => {
                let i = self.expr(index)?;
                Emitted::simple(format!("{}[{}]", self.array_field(array), i.value)).with_pre(i.pre)
            }
            Expr::Length(name) => Emitted::simple(format!("this->{}__length", name)),
            Expr::Binary { op, lhs, rhs } if op.is_short_circuit() => {
                let l = self.expr(lhs)?.inline_operand();
                let r = self.expr(rhs)?.inline_operand();
                Emitted::compound(format!("{} {} {}", l, op.symbol(), r))
            }
            Expr::Binary { op, lhs, rhs } => {
                let ty = self.ty(lhs)?;
                let (pre, v) = self.sequence(&[&**lhs, &**rhs])?;
                combine(*op, ty, &v[0].operand(), &v[1].operand()).with_pre(pre)
            }
            Expr::Unary { op, operand } => {
                let e = self.expr(operand)?;
                let symbol = match op {
                    UnOp::Neg => "-",
                    UnOp::Not => "!",
                    UnOp::BitNot => "~",
                };
                Emitted::compound(format!("{}{}", symbol, e.operand())).with_pre(e.pre)
            }
            Expr::Conditional {
                cond,
                then_value,
                else_value,
            } => {
                let c = self.expr(cond)?.inline_operand();
                let t = self.expr(then_value)?.inline_operand();
                let e = self.expr(else_value)?.inline_operand();
                Emitted::compound(format!("{} ? {} : {}", c, t, e))
            }
            Expr::Cast { to, value, .. } => {
                let from = self.ty(value)?;
                let e = self.expr(value)?;
                self.cast(from, *to, &e).with_pre(e.pre)
            }
            Expr::Assign {
                target,
                op: None,
                value,
            } => self.assign(target, value)?,
            Expr::Assign {
                target,
                op: Some(op),
                value,
            } => self.compound_assign(target, *op, value)?,
            Expr::Step {
                target,
                step,
                prefix,
            } => self.step(target, *step, *prefix)?,
            Expr::Call { method, args } => {
                let refs: Vec<&Expr> = args.iter().collect();
                let (pre, values) = self.sequence_text(&refs)?;
                let mut call = format!("{}__{}(this", self.prefix, method);
                for v in &values {
                    call.push_str(", ");
                    call.push_str(v);
                }
                call.push(')');
                Emitted::simple(call).with_pre(pre)
            }
            Expr::Atomic { op, slot, args } => {
                let width = self
                    .descriptor
                    .field(&slot.field)
                    .and_then(|f| f.atomic_width())
                    .ok_or_else(|| {
                        self.fail(Fault {
                            kind: ErrorKind::AtomicMisuse,
                            message: format!("'{}' is not an atomic field", slot.field),
                        })
                    })?;
                let mut operands: Vec<&Expr> = Vec::with_capacity(args.len() + 1);
                if let Some(index) = &slot.index {
                    operands.push(index);
                }
                operands.extend(args.iter());
                let (mut pre, values) = self.sequence_text(&operands)?;
                let (ptr, rest) = match &slot.index {
                    Some(_) => (
                        format!("&{}[{}]", self.array_field(&slot.field), values[0]),
                        &values[1..],
                    ),
                    None => (self.array_field(&slot.field), &values[..]),
                };
                let func = op.cl_function(width);
                match op {
                    AtomicOp::Set => {
                        let t = self.temp(match width {
                            AtomicWidth::Int => ScalarType::Int,
                            AtomicWidth::Long => ScalarType::Long,
                        });
                        pre.push(format!("{} = {}", t, rest[0]));
                        pre.push(format!("{}({}, {})", func, ptr, t));
                        Emitted::simple(t).with_pre(pre)
                    }
                    AtomicOp::Get => {
                        let zero = if width == AtomicWidth::Long { "0L" } else { "0" };
                        Emitted::simple(format!("{}({}, {})", func, ptr, zero)).with_pre(pre)
                    }
                    _ => {
                        let mut call = format!("{}({}", func, ptr);
                        for v in rest {
                            call.push_str(", ");
                            call.push_str(v);
                        }
                        call.push(')');
                        Emitted::simple(call).with_pre(pre)
                    }
                }
            }
            Expr::Builtin { func, args } => {
                let ty = match args.first() {
                    Some(a) => Some(self.ty(a)?),
                    None => None,
                };
                let refs: Vec<&Expr> = args.iter().collect();
                let (pre, v) = self.sequence_text(&refs)?;
                self.builtin(*func, ty, &v).with_pre(pre)
            }
        })
    }

    fn cast(&self, from: ScalarType, to: ScalarType, e: &Emitted) -> Emitted {
        if from.is_floating() && to.is_integral() {
            // Java float-to-integer conversion saturates and maps NaN to 0.
            return match to {
                ScalarType::Long => Emitted::simple(format!("convert_long_sat_rtz({})", e.value)),
                ScalarType::Int => Emitted::simple(format!("convert_int_sat_rtz({})", e.value)),
                _ => Emitted::compound(format!(
                    "({})convert_int_sat_rtz({})",
                    to.cl_name(),
                    e.value
                )),
            };
        }
        Emitted::compound(format!("({}){}", to.cl_name(), e.operand()))
    }

    fn place(&mut self, place: &Place) -> Result<(Vec<String>, String), CompileError> {
        Ok(match place {
            Place::Local(name) => (Vec::new(), name.clone()),
            Place::Field(name) => (Vec::new(), format!("this->{}", name)),
            Place::Index { array, index } => {
                let i = self.expr(index)?;
                (i.pre, format!("{}[{}]", self.array_field(array), i.value))
            }
        })
    }

    fn assign(&mut self, target: &Place, value: &Expr) -> Result<Emitted, CompileError> {
        let conflict = writes(value, &same_location(target));
        let (mut pre, lvalue, v) = match target {
            Place::Index { array, index } => {
                let (pre, values) = self.sequence_text(&[&**index, value])?;
                (pre, format!("{}[{}]", self.array_field(array), values[0]), values[1].clone())
            }
            _ => {
                let (mut pre, lvalue) = self.place(target)?;
                let e = self.expr(value)?;
                pre.extend(e.pre);
                (pre, lvalue, e.value)
            }
        };
        let v = if conflict {
            let t = self.temp(self.ty(value)?);
            pre.push(format!("{} = {}", t, v));
            t
        } else {
            v
        };
        Ok(Emitted::compound(format!("{} = {}", lvalue, v)).with_pre(pre))
    }

    /// `target op= value`. When `value` has side effects the target is
    /// read into a temporary first, then `value` is evaluated, then the
    /// combined result is stored.
    fn compound_assign(
        &mut self,
        target: &Place,
        op: BinOp,
        value: &Expr,
    ) -> Result<Emitted, CompileError> {
        let ty = self.typer.place_type(&self.scope, target).map_err(|f| self.fail(f))?;
        let split = value.has_side_effects();
        let mut pre = Vec::new();
        let lvalue = match target {
            Place::Index { array, index }
                if index.has_side_effects() || (split && !index.is_literal()) =>
            {
                let i = self.expr(index)?;
                let value_text = i.operand();
                pre.extend(i.pre);
                let t = self.temp(ScalarType::Int);
                pre.push(format!("{} = {}", t, value_text));
                format!("{}[{}]", self.array_field(array), t)
            }
            _ => {
                let (p, lvalue) = self.place(target)?;
                pre.extend(p);
                lvalue
            }
        };

        if split {
            let old = self.temp(ty);
            pre.push(format!("{} = {}", old, lvalue));
            let vty = self.ty(value)?;
            let e = self.expr(value)?;
            let v = e.operand();
            pre.extend(e.pre);
            let t = self.temp(vty);
            pre.push(format!("{} = {}", t, v));
            let combined = combine(op, ty, &old, &t);
            return Ok(Emitted::compound(format!("{} = {}", lvalue, combined.value)).with_pre(pre));
        }

        let e = self.expr(value)?;
        let v = e.operand();
        pre.extend(e.pre);
        let text = if native_compound(op, ty) {
            format!("{} {}= {}", lvalue, op.symbol(), v)
        } else {
            format!("{} = {}", lvalue, combine(op, ty, &lvalue, &v).value)
        };
        Ok(Emitted::compound(text).with_pre(pre))
    }

    /// Increment/decrement. An impure array index is evaluated exactly
    /// once into a temporary.
    fn step(&mut self, target: &Place, step: Step, prefix: bool) -> Result<Emitted, CompileError> {
        if let Place::Index { array, index } = target {
            if index.has_side_effects() {
                let elem = self.typer.place_type(&self.scope, target).map_err(|f| self.fail(f))?;
                let i = self.expr(index)?;
                let value_text = i.operand();
                let mut pre = i.pre;
                let t = self.temp(ScalarType::Int);
                pre.push(format!("{} = {}", t, value_text));
                let slot = format!("{}[{}]", self.array_field(array), t);
                let sign = if step == Step::Inc { '+' } else { '-' };
                if prefix {
                    return Ok(
                        Emitted::compound(format!("{} = {} {} 1", slot, slot, sign)).with_pre(pre)
                    );
                }
                let old = self.temp(elem);
                pre.push(format!("{} = {}", old, slot));
                pre.push(format!("{} = {} {} 1", slot, old, sign));
                return Ok(Emitted::simple(old).with_pre(pre));
            }
        }
        let (pre, lvalue) = self.place(target)?;
        let text = if prefix {
            format!("{}{}", step.symbol(), lvalue)
        } else {
            format!("{}{}", lvalue, step.symbol())
        };
        Ok(Emitted::compound(text).with_pre(pre))
    }

    fn builtin(&self, func: Builtin, ty: Option<ScalarType>, args: &[String]) -> Emitted {
        let query = |name: &str| Emitted::compound(format!("(int){}({})", name, args[0]));
        let call = |name: &str| Emitted::simple(format!("{}({})", name, args.join(", ")));
        let floating = ty.is_some_and(ScalarType::is_floating);
        match func {
            Builtin::GlobalId => query("get_global_id"),
            Builtin::LocalId => query("get_local_id"),
            Builtin::GroupId => query("get_group_id"),
            Builtin::GlobalSize => query("get_global_size"),
            Builtin::LocalSize => query("get_local_size"),
            Builtin::NumGroups => query("get_num_groups"),
            Builtin::PassId => Emitted::simple("get_pass_id(this)".to_string()),
            Builtin::Abs if floating => call("fabs"),
            Builtin::Abs => Emitted::compound(format!(
                "({})abs({})",
                ty.map_or("int", ScalarType::cl_name),
                args[0]
            )),
            Builtin::Min if floating => call("fmin"),
            Builtin::Max if floating => call("fmax"),
            Builtin::Min => call("min"),
            Builtin::Max => call("max"),
            Builtin::Sqrt => call("sqrt"),
            Builtin::Sin => call("sin"),
            Builtin::Cos => call("cos"),
            Builtin::Tan => call("tan"),
            Builtin::Exp => call("exp"),
            Builtin::Log => call("log"),
            Builtin::Pow => call("pow"),
            Builtin::Floor => call("floor"),
            Builtin::Ceil => call("ceil"),
        }
    }
}
