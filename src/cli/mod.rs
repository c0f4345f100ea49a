pub mod check;
pub mod compile;
pub mod run;

use std::io::IsTerminal;
use std::path::Path;
use std::process;

use kernelc::{CompileError, DeviceKind, DispatchConfig, FallbackPolicy, KernelDescriptor, KernelSchema};

/// Dispatcher settings given on the command line. They override the
/// `KERNELC_*` environment variables.
pub struct DeviceOverrides {
    pub devices: Vec<String>,
    pub threads: Option<usize>,
    pub fallback: bool,
}

/// Read a JSON kernel schema.
pub fn load_schema(path: &Path) -> KernelSchema {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", path.display(), e);
            process::exit(1);
        }
    };
    match serde_json::from_str(&text) {
        Ok(schema) => schema,
        Err(e) => {
            eprintln!("error: '{}' is not a kernel schema: {}", path.display(), e);
            process::exit(1);
        }
    }
}

/// Print `err` with a listing of the method it points into, when the
/// schema has one.
pub fn report_compile_error(schema: &KernelSchema, err: &CompileError) {
    let method = err
        .method
        .as_deref()
        .and_then(|name| schema.methods.iter().find(|m| m.name == name));
    match method {
        Some(m) => eprint!("{}", err.render(m, std::io::stderr().is_terminal())),
        None => eprintln!("{}", err),
    }
}

/// Build and check the descriptor, exiting on any compile error.
pub fn build_descriptor(schema: &KernelSchema) -> KernelDescriptor {
    match schema.build() {
        Ok(d) => d,
        Err(e) => {
            report_compile_error(schema, &e);
            process::exit(1);
        }
    }
}

pub fn dispatch_config(overrides: &DeviceOverrides) -> DispatchConfig {
    let mut config = match DispatchConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };
    if !overrides.devices.is_empty() {
        let parsed: Result<Vec<DeviceKind>, _> =
            overrides.devices.iter().map(|d| d.parse::<DeviceKind>()).collect();
        match parsed {
            Ok(devices) => config.devices = devices,
            Err(e) => {
                eprintln!("error: {}", e);
                process::exit(1);
            }
        }
    }
    if let Some(n) = overrides.threads {
        config.num_threads = Some(n);
    }
    if overrides.fallback {
        config.fallback = FallbackPolicy::FallBack;
    }
    if let Err(e) = config.validate() {
        eprintln!("error: {}", e);
        process::exit(1);
    }
    config
}
