use std::path::PathBuf;
use std::process;

use clap::Args;

use super::{build_descriptor, load_schema, report_compile_error};

#[derive(Args)]
pub struct CheckArgs {
    /// Kernel schema (JSON)
    pub input: PathBuf,
    /// Print the inferred field directions
    #[arg(long)]
    pub fields: bool,
}

pub fn cmd_check(args: CheckArgs) {
    let schema = load_schema(&args.input);
    let descriptor = build_descriptor(&schema);
    if let Err(e) = kernelc::typeck::check(&descriptor) {
        report_compile_error(&schema, &e);
        process::exit(1);
    }

    if args.fields {
        for field in descriptor.fields() {
            eprintln!(
                "  {:<16} {:?} {:?} {:?}",
                field.name, field.element, field.shape, field.direction
            );
        }
    }
    let helpers: Vec<&str> = descriptor.helpers().iter().map(|m| m.name.as_str()).collect();
    eprintln!(
        "OK: {} (entry '{}', helpers: [{}])",
        descriptor.name(),
        descriptor.entry(),
        helpers.join(", ")
    );
}
