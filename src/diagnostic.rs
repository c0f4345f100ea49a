use std::fmt;

use crate::ir::display::Listing;
use crate::ir::Method;

/// What class of construct made a kernel uncompilable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// IR node outside the supported subset.
    UnsupportedConstruct,
    /// Field whose declared type cannot live on the device.
    UnsupportedFieldType,
    /// Direct or mutual recursion in the call graph.
    Recursion,
    /// Reference to an undeclared local, field or method.
    UnknownSymbol,
    /// Operand or assignment types disagree.
    TypeMismatch,
    /// Atomic primitive on a non-atomic field, or plain access to an
    /// atomic field.
    AtomicMisuse,
    /// Descriptor-level inconsistency (duplicates, bad entry point).
    InvalidDescriptor,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::UnsupportedConstruct => "unsupported",
            ErrorKind::UnsupportedFieldType => "field-type",
            ErrorKind::Recursion => "recursion",
            ErrorKind::UnknownSymbol => "unknown-symbol",
            ErrorKind::TypeMismatch => "type-mismatch",
            ErrorKind::AtomicMisuse => "atomic-misuse",
            ErrorKind::InvalidDescriptor => "descriptor",
        }
    }
}

/// A kernel compilation failure.
///
/// `position` is the pre-order ordinal of the offending statement in
/// `method`, the same numbering [`Listing`] uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub kernel: String,
    pub method: Option<String>,
    pub position: Option<usize>,
    pub message: String,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

impl CompileError {
    pub fn new(kind: ErrorKind, kernel: &str, message: String) -> Self {
        Self {
            kind,
            kernel: kernel.to_string(),
            method: None,
            position: None,
            message,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn in_method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    /// Render the error with ariadne against a listing of `method`.
    pub fn render(&self, method: &Method, color: bool) -> String {
        use ariadne::{Color, Config, Label, Report, ReportKind, Source};

        let listing = Listing::of(method);
        let span = self
            .position
            .and_then(|p| listing.span(p))
            .unwrap_or(0..listing.text.find('\n').unwrap_or(0));
        let id = method.name.as_str();

        let mut report = Report::build(ReportKind::Error, id, span.start)
            .with_config(Config::default().with_color(color))
            .with_code(self.kind.code())
            .with_message(&self.message)
            .with_label(
                Label::new((id, span))
                    .with_message(&self.message)
                    .with_color(Color::Red),
            );
        for note in &self.notes {
            report = report.with_note(note);
        }
        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        let mut out = Vec::new();
        if report
            .finish()
            .write((id, Source::from(listing.text.as_str())), &mut out)
            .is_err()
        {
            return self.to_string();
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error[{}] in {}", self.kind.code(), self.kernel)?;
        if let Some(method) = &self.method {
            write!(f, "::{}", method)?;
        }
        if let Some(position) = self.position {
            write!(f, " at statement {}", position)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}
