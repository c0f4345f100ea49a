//! Program layout.
//!
//! ```text
//! #pragma ...                          fp64 / int64 atomics / byte stores
//! typedef struct This_s{ fields..., int passid; }This;
//! int get_pass_id(This *this)
//! <helper prototypes, linearized order>
//! <helper definitions, same order>
//! __kernel void <entry>(fields..., int passid)
//! ```
//!
//! [`kernel_params`] is the single source of the kernel parameter
//! order; the struct, the `__kernel` signature and the dispatcher's
//! launch arguments are all derived from it.

use std::collections::HashSet;

use crate::atomic::AtomicWidth;
use crate::diagnostic::CompileError;
use crate::ir::{for_each_stmt, own_exprs, visit_exprs, walk_expr, Expr, Method, ScalarType, Stmt};
use crate::schema::{ElementType, Field, KernelDescriptor, Shape};

use super::emitter::FnEmitter;
use super::mangle;

/// One parameter of the `__kernel` function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelParam {
    /// Field at this descriptor index.
    Field(usize),
    /// `int <array>__length` for the array field at this index.
    Length(usize),
    PassId,
}

/// Names of array fields whose length is read somewhere.
fn length_uses(descriptor: &KernelDescriptor) -> HashSet<&str> {
    let mut used = HashSet::new();
    for method in descriptor.methods() {
        visit_exprs(&method.body, &mut |e| {
            if let Expr::Length(name) = e {
                used.insert(name.as_str());
            }
        });
    }
    used
}

/// Kernel parameters in order: fields in declaration order (each array
/// followed by its length when the kernel reads it), then `passid`.
pub fn kernel_params(descriptor: &KernelDescriptor) -> Vec<KernelParam> {
    let lengths = length_uses(descriptor);
    let mut params = Vec::with_capacity(descriptor.fields().len() + 1);
    for (i, field) in descriptor.fields().iter().enumerate() {
        params.push(KernelParam::Field(i));
        if field.is_array() && lengths.contains(field.name.as_str()) {
            params.push(KernelParam::Length(i));
        }
    }
    params.push(KernelParam::PassId);
    params
}

fn field_decl(field: &Field) -> String {
    match (field.element, field.shape) {
        (ElementType::Scalar(t), Shape::Scalar) => format!("{} {}", t.cl_name(), field.name),
        (ElementType::Scalar(t), Shape::Array) => format!(
            "{} {} *{}",
            field.space.cl_qualifier(),
            t.cl_name(),
            field.name
        ),
        (ElementType::Atomic(w), _) => format!(
            "volatile {} {} *{}",
            field.scope().cl_qualifier(),
            w.cl_name(),
            field.name
        ),
    }
}

fn param_decls(descriptor: &KernelDescriptor) -> Vec<(String, String)> {
    kernel_params(descriptor)
        .into_iter()
        .map(|p| match p {
            KernelParam::Field(i) => {
                let f = &descriptor.fields()[i];
                (field_decl(f), f.name.clone())
            }
            KernelParam::Length(i) => {
                let name = format!("{}__length", descriptor.fields()[i].name);
                (format!("int {}", name), name)
            }
            KernelParam::PassId => ("int passid".to_string(), "passid".to_string()),
        })
        .collect()
}

fn method_uses_double(method: &Method) -> bool {
    let mut found = method.ret == Some(ScalarType::Double)
        || method.params.iter().any(|p| p.ty == ScalarType::Double);
    for_each_stmt(&method.body, &mut |_, stmt| {
        if let Stmt::Let { ty, .. } = stmt {
            found |= *ty == ScalarType::Double;
        }
        for e in own_exprs(stmt) {
            walk_expr(e, &mut |x| match x {
                Expr::Literal(v) => found |= v.ty() == ScalarType::Double,
                Expr::Cast { to, .. } => found |= *to == ScalarType::Double,
                _ => {}
            });
        }
    });
    found
}

fn pragmas(descriptor: &KernelDescriptor) -> Vec<&'static str> {
    let fields = descriptor.fields();
    let mut out = Vec::new();
    let double = fields
        .iter()
        .any(|f| f.scalar_type() == Some(ScalarType::Double))
        || descriptor.methods().iter().any(method_uses_double);
    if double {
        out.push("#pragma OPENCL EXTENSION cl_khr_fp64 : enable");
    }
    if fields
        .iter()
        .any(|f| f.atomic_width() == Some(AtomicWidth::Long))
    {
        out.push("#pragma OPENCL EXTENSION cl_khr_int64_base_atomics : enable");
        out.push("#pragma OPENCL EXTENSION cl_khr_int64_extended_atomics : enable");
    }
    let narrow_store = fields.iter().any(|f| {
        f.is_array() && f.is_written() && f.scalar_type().is_some_and(|t| t.size_bytes() < 4)
    });
    if narrow_store {
        out.push("#pragma OPENCL EXTENSION cl_khr_byte_addressable_store : enable");
    }
    out
}

fn signature(prefix: &str, method: &Method) -> String {
    let mut sig = format!(
        "{} {}__{}(This *this",
        method.ret.map_or("void", ScalarType::cl_name),
        prefix,
        method.name
    );
    for p in &method.params {
        sig.push_str(&format!(", {} {}", p.ty.cl_name(), p.name));
    }
    sig.push(')');
    sig
}

pub(super) fn emit_program(descriptor: &KernelDescriptor) -> Result<String, CompileError> {
    let prefix = mangle(descriptor.name());
    let mut out: Vec<String> = Vec::new();

    let pragmas = pragmas(descriptor);
    if !pragmas.is_empty() {
        out.extend(pragmas.iter().map(|p| p.to_string()));
        out.push(String::new());
    }

    let params = param_decls(descriptor);
    out.push("typedef struct This_s{".to_string());
    for (decl, _) in &params {
        out.push(format!("   {};", decl));
    }
    out.push("}This;".to_string());
    out.push("int get_pass_id(This *this){".to_string());
    out.push("   return this->passid;".to_string());
    out.push("}".to_string());
    out.push(String::new());

    let helpers = descriptor.helpers();
    for method in helpers {
        out.push(format!("{};", signature(&prefix, method)));
    }
    if !helpers.is_empty() {
        out.push(String::new());
    }
    for method in helpers {
        out.push(format!("{}{{", signature(&prefix, method)));
        out.extend(FnEmitter::new(descriptor, method, &prefix).body(1)?);
        out.push("}".to_string());
        out.push(String::new());
    }

    out.push(format!("__kernel void {}(", descriptor.entry()));
    let last = params.len().saturating_sub(1);
    for (i, (decl, _)) in params.iter().enumerate() {
        let sep = if i == last { "" } else { "," };
        out.push(format!("   {}{}", decl, sep));
    }
    out.push("){".to_string());
    out.push("   This thisStruct;".to_string());
    out.push("   This* this=&thisStruct;".to_string());
    for (_, name) in &params {
        out.push(format!("   this->{} = {};", name, name));
    }
    out.push("   {".to_string());
    out.extend(FnEmitter::new(descriptor, descriptor.entry_method(), &prefix).body(2)?);
    out.push("      return;".to_string());
    out.push("   }".to_string());
    out.push("}".to_string());

    let mut text = out.join("\n");
    text.push('\n');
    Ok(text)
}
