use std::path::PathBuf;
use std::process;

use clap::Args;

use super::{build_descriptor, load_schema, report_compile_error};

#[derive(Args)]
pub struct CompileArgs {
    /// Kernel schema (JSON)
    pub input: PathBuf,
    /// Output .cl file (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub fn cmd_compile(args: CompileArgs) {
    let schema = load_schema(&args.input);
    let descriptor = build_descriptor(&schema);
    let source = match kernelc::compile_kernel(&descriptor) {
        Ok(s) => s,
        Err(e) => {
            report_compile_error(&schema, &e);
            process::exit(1);
        }
    };

    match &args.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &source.text) {
                eprintln!("error: cannot write '{}': {}", path.display(), e);
                process::exit(1);
            }
            eprintln!("Compiled -> {}", path.display());
        }
        None => print!("{}", source.text),
    }
    eprintln!("hash: {}", source.hash_hex());
}
