use crate::diagnostic::CompileError;
use crate::ir::{Expr, Method, ScalarType, Stmt};
use crate::schema::KernelDescriptor;
use crate::typeck::{Fault, Scope, Typer};

const INDENT: &str = "   ";

/// Emits the body of one method as OpenCL C statements.
///
/// Temporaries are numbered per function (`_tmp0`, `_tmp1`, ...) and
/// declared at the top of the function body.
pub(crate) struct FnEmitter<'d> {
    pub(super) descriptor: &'d KernelDescriptor,
    pub(super) typer: Typer<'d>,
    /// Mangled kernel name, prefix of helper function names.
    pub(super) prefix: String,
    method: &'d Method,
    pub(super) scope: Scope,
    temps: Vec<ScalarType>,
    lines: Vec<String>,
    indent: usize,
    /// Next statement ordinal.
    position: usize,
    /// Ordinal of the statement being emitted.
    current: usize,
}

impl<'d> FnEmitter<'d> {
    pub(crate) fn new(descriptor: &'d KernelDescriptor, method: &'d Method, prefix: &str) -> Self {
        Self {
            descriptor,
            typer: Typer::new(descriptor),
            prefix: prefix.to_string(),
            method,
            scope: Scope::for_method(method),
            temps: Vec::new(),
            lines: Vec::new(),
            indent: 0,
            position: 0,
            current: 0,
        }
    }

    /// Emit the method body; returns temp declarations followed by the
    /// statements, each indented by `indent` levels.
    pub(crate) fn body(mut self, indent: usize) -> Result<Vec<String>, CompileError> {
        self.indent = indent;
        let method = self.method;
        for stmt in &method.body {
            self.stmt(stmt)?;
        }
        let pad = INDENT.repeat(indent);
        let mut out: Vec<String> = self
            .temps
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("{}{} _tmp{};", pad, ty.cl_name(), i))
            .collect();
        out.extend(self.lines);
        Ok(out)
    }

    pub(super) fn temp(&mut self, ty: ScalarType) -> String {
        self.temps.push(ty);
        format!("_tmp{}", self.temps.len() - 1)
    }

    pub(super) fn fail(&self, f: Fault) -> CompileError {
        CompileError::new(f.kind, self.descriptor.name(), f.message)
            .in_method(&self.method.name)
            .at(self.current)
    }

    pub(super) fn ty(&self, expr: &Expr) -> Result<ScalarType, CompileError> {
        self.typer
            .value_type(&self.scope, expr)
            .map_err(|f| self.fail(f))
    }

    fn line(&mut self, text: &str) {
        self.lines.push(format!("{}{}", INDENT.repeat(self.indent), text));
    }

    fn nested(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        self.indent += 1;
        self.scope.push();
        let result = stmts.iter().try_for_each(|s| self.stmt(s));
        self.scope.pop();
        self.indent -= 1;
        result
    }

    /// Emit `expr` with its sequencing prefix as separate statements,
    /// returning the final value.
    fn lifted(&mut self, expr: &Expr) -> Result<String, CompileError> {
        let e = self.expr(expr)?;
        for p in &e.pre {
            self.line(&format!("{};", p));
        }
        Ok(e.value)
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        let pos = self.position;
        self.position += 1;
        self.current = pos;
        match stmt {
            Stmt::Let { name, ty, init } => {
                match init {
                    Some(init) => {
                        let value = self.lifted(init)?;
                        self.line(&format!("{} {} = {};", ty.cl_name(), name, value));
                    }
                    None => self.line(&format!("{} {};", ty.cl_name(), name)),
                }
                self.scope.declare(name, *ty);
            }
            Stmt::Expr(e) => {
                let value = self.lifted(e)?;
                self.line(&format!("{};", value));
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let c = self.lifted(cond)?;
                self.line(&format!("if ({}){{", c));
                self.nested(then_body)?;
                if !else_body.is_empty() {
                    self.line("} else {");
                    self.nested(else_body)?;
                }
                self.line("}");
            }
            Stmt::While { cond, body } => {
                let c = self.expr(cond)?.inline();
                self.line(&format!("while ({}){{", c));
                self.nested(body)?;
                self.line("}");
            }
            Stmt::DoWhile { body, cond } => {
                self.line("do {");
                self.nested(body)?;
                self.current = pos;
                let c = self.expr(cond)?.inline();
                self.line(&format!("}} while ({});", c));
            }
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => {
                self.scope.push();
                let result = self.for_loop(pos, init, cond.as_ref(), update, body);
                self.scope.pop();
                result?;
            }
            Stmt::Break => self.line("break;"),
            Stmt::Continue => self.line("continue;"),
            Stmt::Return(None) => self.line("return;"),
            Stmt::Return(Some(e)) => {
                let value = self.lifted(e)?;
                self.line(&format!("return {};", value));
            }
            Stmt::Block(body) => {
                self.line("{");
                self.nested(body)?;
                self.line("}");
            }
        }
        Ok(())
    }

    /// A single initializer without a sequencing prefix goes into the
    /// loop header; anything else is emitted before the loop inside an
    /// enclosing block.
    fn for_loop(
        &mut self,
        pos: usize,
        init: &[Stmt],
        cond: Option<&Expr>,
        update: &[Expr],
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        let mark = self.lines.len();
        self.indent += 1;
        let emitted = init.iter().try_for_each(|s| self.stmt(s));
        self.indent -= 1;
        emitted?;

        let added = self.lines.len() - mark;
        let wrapped = added > 1 || (added == 1 && init.len() != 1);
        let header_init = if wrapped || added == 0 {
            String::new()
        } else {
            let line = self.lines.pop().unwrap_or_default();
            line.trim().trim_end_matches(';').to_string()
        };
        if wrapped {
            let pad = INDENT.repeat(self.indent);
            self.lines.insert(mark, format!("{}{{", pad));
            self.indent += 1;
        }

        self.current = pos;
        let c = match cond {
            Some(c) => self.expr(c)?.inline(),
            None => String::new(),
        };
        let mut steps = Vec::with_capacity(update.len());
        for u in update {
            steps.push(self.expr(u)?.inline());
        }
        self.line(&format!("for ({}; {}; {}){{", header_init, c, steps.join(", ")));
        self.nested(body)?;
        self.line("}");
        if wrapped {
            self.indent -= 1;
            self.line("}");
        }
        Ok(())
    }
}
