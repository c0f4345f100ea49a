//! Instance-state descriptors.
//!
//! A kernel type declares its fields and methods through a
//! [`KernelSchema`]; [`KernelSchema::build`] validates the declaration,
//! linearizes the call graph and infers each field's access direction,
//! producing an immutable [`KernelDescriptor`] shared by the translator
//! and both execution backends.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::atomic::{AtomicWidth, MemoryScope};
use crate::callgraph;
use crate::diagnostic::{CompileError, ErrorKind};
use crate::ir::{visit_exprs, Expr, Method, Place, ScalarType};
use crate::typeck;

/// Declared type of a field, as the front-end reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Scalar(ScalarType),
    Atomic(AtomicWidth),
    /// Any other reference type. Never compiles.
    Object(String),
}

/// Validated element type of a descriptor field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Scalar(ScalarType),
    Atomic(AtomicWidth),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    #[default]
    Scalar,
    Array,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySpace {
    #[default]
    Global,
    Local,
    Constant,
}

impl MemorySpace {
    pub fn cl_qualifier(self) -> &'static str {
        match self {
            MemorySpace::Global => "__global",
            MemorySpace::Local => "__local",
            MemorySpace::Constant => "__constant",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ReadOnly,
    ReadWrite,
}

/// One field as declared.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty: FieldType,
    #[serde(default)]
    pub shape: Shape,
    #[serde(default)]
    pub space: MemorySpace,
}

/// One field of a built descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub element: ElementType,
    pub shape: Shape,
    pub space: MemorySpace,
    pub direction: Direction,
}

impl Field {
    pub fn is_array(&self) -> bool {
        self.shape == Shape::Array
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self.element, ElementType::Atomic(_))
    }

    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self.element {
            ElementType::Scalar(t) => Some(t),
            ElementType::Atomic(_) => None,
        }
    }

    pub fn atomic_width(&self) -> Option<AtomicWidth> {
        match self.element {
            ElementType::Atomic(w) => Some(w),
            ElementType::Scalar(_) => None,
        }
    }

    /// Scope of the slots an atomic field holds.
    pub fn scope(&self) -> MemoryScope {
        match self.space {
            MemorySpace::Local => MemoryScope::Local,
            _ => MemoryScope::Global,
        }
    }

    pub fn is_written(&self) -> bool {
        self.direction == Direction::ReadWrite
    }
}

fn default_entry() -> String {
    "run".to_string()
}

/// Builder for a kernel declaration. Also the JSON document format the
/// CLI reads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelSchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    #[serde(default)]
    pub methods: Vec<Method>,
    #[serde(default = "default_entry")]
    pub entry: String,
}

impl KernelSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            methods: Vec::new(),
            entry: default_entry(),
        }
    }

    pub fn field(mut self, decl: FieldDecl) -> Self {
        self.fields.push(decl);
        self
    }

    pub fn scalar(self, name: &str, ty: ScalarType) -> Self {
        self.declare(name, FieldType::Scalar(ty), Shape::Scalar)
    }

    pub fn array(self, name: &str, ty: ScalarType) -> Self {
        self.declare(name, FieldType::Scalar(ty), Shape::Array)
    }

    pub fn atomic(self, name: &str, width: AtomicWidth) -> Self {
        self.declare(name, FieldType::Atomic(width), Shape::Scalar)
    }

    pub fn atomic_array(self, name: &str, width: AtomicWidth) -> Self {
        self.declare(name, FieldType::Atomic(width), Shape::Array)
    }

    /// Place the most recently declared field in work-group local memory.
    pub fn local(self) -> Self {
        self.in_space(MemorySpace::Local)
    }

    /// Place the most recently declared field in constant memory.
    pub fn constant(self) -> Self {
        self.in_space(MemorySpace::Constant)
    }

    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn entry(mut self, name: &str) -> Self {
        self.entry = name.to_string();
        self
    }

    fn declare(self, name: &str, ty: FieldType, shape: Shape) -> Self {
        self.field(FieldDecl {
            name: name.to_string(),
            ty,
            shape,
            space: MemorySpace::Global,
        })
    }

    fn in_space(mut self, space: MemorySpace) -> Self {
        if let Some(last) = self.fields.last_mut() {
            last.space = space;
        }
        self
    }

    fn error(&self, kind: ErrorKind, message: String) -> CompileError {
        CompileError::new(kind, &self.name, message)
    }

    pub fn build(&self) -> Result<KernelDescriptor, CompileError> {
        let mut seen = HashSet::new();
        for decl in &self.fields {
            if !seen.insert(decl.name.as_str()) {
                return Err(self.error(
                    ErrorKind::InvalidDescriptor,
                    format!("field '{}' declared twice", decl.name),
                ));
            }
            // `<array>__length` parameters share the field namespace.
            if !typeck::valid_local_name(&decl.name) || decl.name.contains("__") {
                return Err(self.error(
                    ErrorKind::InvalidDescriptor,
                    format!("'{}' is not a valid field name", decl.name),
                ));
            }
        }
        let mut seen = HashSet::new();
        for method in &self.methods {
            if !seen.insert(method.name.as_str()) {
                return Err(self.error(
                    ErrorKind::InvalidDescriptor,
                    format!("method '{}' declared twice", method.name),
                ));
            }
        }

        let entry = self
            .methods
            .iter()
            .find(|m| m.name == self.entry)
            .ok_or_else(|| {
                self.error(
                    ErrorKind::InvalidDescriptor,
                    format!("entry point '{}' is not declared", self.entry),
                )
            })?;
        if !entry.params.is_empty() || entry.ret.is_some() {
            return Err(self
                .error(
                    ErrorKind::InvalidDescriptor,
                    format!("entry point '{}' must take no parameters and return void", entry.name),
                )
                .in_method(&entry.name));
        }

        let reachable: Vec<Method> = callgraph::linearize(&self.name, &self.methods, &self.entry)?
            .into_iter()
            .cloned()
            .collect();
        let written = written_fields(&reachable);

        let mut fields = Vec::with_capacity(self.fields.len());
        for decl in &self.fields {
            let element = match &decl.ty {
                FieldType::Scalar(t) => ElementType::Scalar(*t),
                FieldType::Atomic(w) => ElementType::Atomic(*w),
                FieldType::Object(class) => {
                    return Err(self
                        .error(
                            ErrorKind::UnsupportedFieldType,
                            format!("field '{}' has unsupported type '{}'", decl.name, class),
                        )
                        .with_help(
                            "fields must be primitives, primitive arrays or atomic integers"
                                .to_string(),
                        ));
                }
            };
            let atomic = matches!(element, ElementType::Atomic(_));
            match decl.space {
                MemorySpace::Constant if atomic => {
                    return Err(self.error(
                        ErrorKind::InvalidDescriptor,
                        format!("atomic field '{}' cannot live in constant memory", decl.name),
                    ));
                }
                MemorySpace::Constant | MemorySpace::Local
                    if decl.shape == Shape::Scalar && !atomic =>
                {
                    return Err(self.error(
                        ErrorKind::InvalidDescriptor,
                        format!("scalar field '{}' must live in global memory", decl.name),
                    ));
                }
                _ => {}
            }
            let direction = if written.contains(decl.name.as_str()) {
                Direction::ReadWrite
            } else {
                Direction::ReadOnly
            };
            if decl.space == MemorySpace::Constant && direction == Direction::ReadWrite {
                return Err(self.error(
                    ErrorKind::InvalidDescriptor,
                    format!("constant field '{}' is written", decl.name),
                ));
            }
            fields.push(Field {
                name: decl.name.clone(),
                element,
                shape: decl.shape,
                space: decl.space,
                direction,
            });
        }

        let field_index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Ok(KernelDescriptor {
            name: self.name.clone(),
            fields,
            methods: reachable,
            entry: self.entry.clone(),
            field_index,
        })
    }
}

/// Names of fields stored to anywhere in `methods`.
fn written_fields(methods: &[Method]) -> HashSet<&str> {
    let mut written = HashSet::new();
    for method in methods {
        visit_exprs(&method.body, &mut |e| match e {
            Expr::Assign { target, .. } | Expr::Step { target, .. } => match target {
                Place::Field(name) | Place::Index { array: name, .. } => {
                    written.insert(name.as_str());
                }
                Place::Local(_) => {}
            },
            Expr::Atomic { op, slot, .. } if op.writes() => {
                written.insert(slot.field.as_str());
            }
            _ => {}
        });
    }
    written
}

/// Immutable description of a kernel: fields in declaration order and
/// the methods reachable from the entry point, entry first.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KernelDescriptor {
    name: String,
    fields: Vec<Field>,
    methods: Vec<Method>,
    entry: String,
    #[serde(skip)]
    field_index: HashMap<String, usize>,
}

impl KernelDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.field_index.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.field_index.get(name).copied()
    }

    /// Reachable methods in first-reached order; the entry point is first.
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn entry_method(&self) -> &Method {
        &self.methods[0]
    }

    pub fn helpers(&self) -> &[Method] {
        &self.methods[1..]
    }
}

/// A kernel type. Implementors describe their state and code once;
/// [`descriptor_of`] turns that into a descriptor.
pub trait ComputeTask {
    fn name(&self) -> &str;

    fn describe(&self, schema: KernelSchema) -> KernelSchema;
}

pub fn descriptor_of<T: ComputeTask + ?Sized>(task: &T) -> Result<KernelDescriptor, CompileError> {
    task.describe(KernelSchema::new(task.name())).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicOp;
    use crate::ir::{SlotRef, Stmt};

    fn run(body: Vec<Stmt>) -> Method {
        Method::new("run", body)
    }

    #[test]
    fn test_direction_inference_across_helpers() {
        let schema = KernelSchema::new("Copy")
            .array("src", ScalarType::Float)
            .array("dst", ScalarType::Float)
            .atomic("counter", AtomicWidth::Int)
            .atomic("peek", AtomicWidth::Int)
            .method(run(vec![Stmt::expr(Expr::call("store", vec![]))]))
            .method(Method::new(
                "store",
                vec![
                    Stmt::expr(Expr::assign(
                        Place::index("dst", Expr::global_id(0)),
                        Expr::index("src", Expr::global_id(0)),
                    )),
                    Stmt::expr(Expr::atomic(AtomicOp::Inc, SlotRef::scalar("counter"), vec![])),
                    Stmt::expr(Expr::atomic(AtomicOp::Get, SlotRef::scalar("peek"), vec![])),
                ],
            ));
        let d = schema.build().unwrap();
        let dirs: Vec<_> = d.fields().iter().map(|f| (f.name.as_str(), f.direction)).collect();
        assert_eq!(
            dirs,
            vec![
                ("src", Direction::ReadOnly),
                ("dst", Direction::ReadWrite),
                ("counter", Direction::ReadWrite),
                ("peek", Direction::ReadOnly),
            ]
        );
        assert_eq!(d.entry_method().name, "run");
        assert_eq!(d.helpers().len(), 1);
    }

    #[test]
    fn test_object_field_rejected_by_name() {
        let err = KernelSchema::new("K")
            .field(FieldDecl {
                name: "list".to_string(),
                ty: FieldType::Object("java.util.List".to_string()),
                shape: Shape::Scalar,
                space: MemorySpace::Global,
            })
            .method(run(vec![]))
            .build()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedFieldType);
        assert!(err.message.contains("'list'"));
    }

    #[test]
    fn test_duplicate_and_entry_checks() {
        let dup = KernelSchema::new("K")
            .scalar("a", ScalarType::Int)
            .scalar("a", ScalarType::Int)
            .method(run(vec![]))
            .build();
        assert_eq!(dup.unwrap_err().kind, ErrorKind::InvalidDescriptor);

        let missing = KernelSchema::new("K").build();
        assert_eq!(missing.unwrap_err().kind, ErrorKind::InvalidDescriptor);

        let bad_entry = KernelSchema::new("K")
            .method(run(vec![]).with_param("x", ScalarType::Int))
            .build();
        assert_eq!(bad_entry.unwrap_err().kind, ErrorKind::InvalidDescriptor);

        for name in ["passid", "data__length", "2x"] {
            let bad_name = KernelSchema::new("K")
                .array(name, ScalarType::Int)
                .method(run(vec![]))
                .build();
            assert_eq!(bad_name.unwrap_err().kind, ErrorKind::InvalidDescriptor);
        }
    }

    #[test]
    fn test_memory_space_rules() {
        let atomic_const = KernelSchema::new("K")
            .atomic_array("slots", AtomicWidth::Int)
            .constant()
            .method(run(vec![]))
            .build();
        assert!(atomic_const.is_err());

        let written_const = KernelSchema::new("K")
            .array("table", ScalarType::Int)
            .constant()
            .method(run(vec![Stmt::expr(Expr::assign(
                Place::index("table", Expr::int(0)),
                Expr::int(1),
            ))]))
            .build();
        assert!(written_const.is_err());

        let d = KernelSchema::new("K")
            .atomic_array("slots", AtomicWidth::Int)
            .local()
            .method(run(vec![]))
            .build()
            .unwrap();
        assert_eq!(d.field("slots").unwrap().scope(), MemoryScope::Local);
    }

    #[test]
    fn test_field_order_is_declaration_order() {
        let build = || {
            KernelSchema::new("K")
                .scalar("z", ScalarType::Int)
                .array("a", ScalarType::Int)
                .scalar("m", ScalarType::Float)
                .method(run(vec![]))
                .build()
                .unwrap()
        };
        let names: Vec<_> = build().fields().iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
        assert_eq!(build(), build());
        assert_eq!(build().field_position("m"), Some(2));
    }

    struct Squares;

    impl ComputeTask for Squares {
        fn name(&self) -> &str {
            "Squares"
        }

        fn describe(&self, schema: KernelSchema) -> KernelSchema {
            schema.array("out", ScalarType::Int).method(run(vec![]))
        }
    }

    #[test]
    fn test_descriptor_of_task() {
        let d = descriptor_of(&Squares).unwrap();
        assert_eq!(d.name(), "Squares");
        assert_eq!(d.fields()[0].direction, Direction::ReadOnly);
    }

    #[test]
    fn test_schema_from_json() {
        let json = r#"{
            "name": "Fill",
            "fields": [{"name": "out", "ty": {"scalar": "int"}, "shape": "array"}],
            "methods": [{"name": "run", "body": []}]
        }"#;
        let schema: KernelSchema = serde_json::from_str(json).unwrap();
        assert_eq!(schema.entry, "run");
        let d = schema.build().unwrap();
        assert!(d.fields()[0].is_array());
    }
}
