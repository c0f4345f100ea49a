//! Source-like rendering of the IR, for listings and diagnostics.

use std::fmt;
use std::ops::Range;

use super::{Expr, Method, Place, Stmt};

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Local(name) => write!(f, "{}", name),
            Place::Field(name) => write!(f, "this.{}", name),
            Place::Index { array, index } => write!(f, "this.{}[{}]", array, index),
        }
    }
}

fn comma_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Local(name) => write!(f, "{}", name),
            Expr::Field(name) => write!(f, "this.{}", name),
            Expr::Index { array, index } => write!(f, "this.{}[{}]", array, index),
            Expr::Length(array) => write!(f, "this.{}.length", array),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Unary { op, operand } => write!(f, "{}{}", op.symbol(), operand),
            Expr::Conditional {
                cond,
                then_value,
                else_value,
            } => write!(f, "({} ? {} : {})", cond, then_value, else_value),
            Expr::Cast { to, value, .. } => write!(f, "({}){}", to.name(), value),
            Expr::Assign { target, op, value } => match op {
                Some(op) => write!(f, "{} {}= {}", target, op.symbol(), value),
                None => write!(f, "{} = {}", target, value),
            },
            Expr::Step {
                target,
                step,
                prefix,
            } => {
                if *prefix {
                    write!(f, "{}{}", step.symbol(), target)
                } else {
                    write!(f, "{}{}", target, step.symbol())
                }
            }
            Expr::Call { method, args } => {
                write!(f, "{}(", method)?;
                comma_list(f, args)?;
                write!(f, ")")
            }
            Expr::Atomic { op, slot, args } => {
                write!(f, "{}(this.{}", op.source_name(), slot.field)?;
                if let Some(index) = &slot.index {
                    write!(f, "[{}]", index)?;
                }
                for a in args {
                    write!(f, ", {}", a)?;
                }
                write!(f, ")")
            }
            Expr::Builtin { func, args } => {
                write!(f, "{}(", func.name())?;
                comma_list(f, args)?;
                write!(f, ")")
            }
        }
    }
}

/// A method rendered one statement per line.
///
/// `spans[n]` is the byte range of the n-th statement in pre-order, the
/// same numbering compile errors use for positions.
pub struct Listing {
    pub text: String,
    pub spans: Vec<Range<usize>>,
}

impl Listing {
    pub fn of(method: &Method) -> Self {
        let mut listing = Listing {
            text: String::new(),
            spans: Vec::new(),
        };
        let params: Vec<String> = method
            .params
            .iter()
            .map(|p| format!("{} {}", p.ty.name(), p.name))
            .collect();
        let ret = method.ret.map(|t| t.name()).unwrap_or("void");
        listing.text.push_str(&format!(
            "{} {}({}) {{\n",
            ret,
            method.name,
            params.join(", ")
        ));
        listing.stmts(&method.body, 1);
        listing.text.push_str("}\n");
        listing
    }

    /// Span of the statement at `position`, if any.
    pub fn span(&self, position: usize) -> Option<Range<usize>> {
        self.spans.get(position).cloned()
    }

    fn line(&mut self, depth: usize, text: &str) -> usize {
        let start = self.text.len() + depth * 4;
        self.text.push_str(&"    ".repeat(depth));
        self.text.push_str(text);
        self.text.push('\n');
        start
    }

    fn stmts(&mut self, stmts: &[Stmt], depth: usize) {
        for stmt in stmts {
            self.stmt(stmt, depth);
        }
    }

    fn stmt(&mut self, stmt: &Stmt, depth: usize) {
        let slot = self.spans.len();
        self.spans.push(0..0);
        let head = match stmt {
            Stmt::Let { name, ty, init } => match init {
                Some(e) => format!("{} {} = {};", ty.name(), name, e),
                None => format!("{} {};", ty.name(), name),
            },
            Stmt::Expr(e) => format!("{};", e),
            Stmt::If { cond, .. } => format!("if ({}) {{", cond),
            Stmt::While { cond, .. } => format!("while ({}) {{", cond),
            Stmt::DoWhile { .. } => "do {".to_string(),
            Stmt::For { cond, update, .. } => {
                let cond = cond.as_ref().map(|c| c.to_string()).unwrap_or_default();
                let update: Vec<String> = update.iter().map(|u| u.to_string()).collect();
                format!("for (...; {}; {}) {{", cond, update.join(", "))
            }
            Stmt::Break => "break;".to_string(),
            Stmt::Continue => "continue;".to_string(),
            Stmt::Return(Some(e)) => format!("return {};", e),
            Stmt::Return(None) => "return;".to_string(),
            Stmt::Block(_) => "{".to_string(),
        };
        let start = self.line(depth, &head);
        self.spans[slot] = start..start + head.len();
        match stmt {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                self.stmts(then_body, depth + 1);
                if !else_body.is_empty() {
                    self.line(depth, "} else {");
                    self.stmts(else_body, depth + 1);
                }
                self.line(depth, "}");
            }
            Stmt::While { body, .. } | Stmt::Block(body) => {
                self.stmts(body, depth + 1);
                self.line(depth, "}");
            }
            Stmt::DoWhile { body, cond } => {
                self.stmts(body, depth + 1);
                self.line(depth, &format!("}} while ({});", cond));
            }
            Stmt::For { init, body, .. } => {
                self.stmts(init, depth + 1);
                self.stmts(body, depth + 1);
                self.line(depth, "}");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Expr, Place, ScalarType, Stmt};

    #[test]
    fn test_listing_spans_follow_preorder() {
        let method = Method::new(
            "run",
            vec![
                Stmt::let_("i", ScalarType::Int, Expr::int(0)),
                Stmt::expr(Expr::pre_inc(Place::index(
                    "array",
                    Expr::pre_inc(Place::local("i")),
                ))),
            ],
        );
        let listing = Listing::of(&method);
        assert_eq!(listing.spans.len(), 2);
        let second = listing.span(1).unwrap();
        assert_eq!(&listing.text[second], "++this.array[++i];");
        assert!(listing.text.starts_with("void run() {\n"));
    }
}
