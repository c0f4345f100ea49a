use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Args;
use serde_json::{json, Map};

use kernelc::{Buffer, Dispatcher, Kernel, Range, ScalarType, Value};

use super::{build_descriptor, dispatch_config, load_schema, report_compile_error, DeviceOverrides};

#[derive(Args)]
pub struct RunArgs {
    /// Kernel schema (JSON)
    pub input: PathBuf,
    /// Global sizes, one per dimension (e.g. `8,4`)
    #[arg(long, value_delimiter = ',', required = true)]
    pub global: Vec<usize>,
    /// Local sizes (default: chosen by the dispatcher)
    #[arg(long, value_delimiter = ',')]
    pub local: Vec<usize>,
    /// Array contents, `name=v1,v2,...` or `name=zeros:N`
    #[arg(long = "bind", value_name = "NAME=VALUES")]
    pub binds: Vec<String>,
    /// Scalar field value, `name=v`
    #[arg(long = "scalar", value_name = "NAME=VALUE")]
    pub scalars: Vec<String>,
    /// Atomic array length, `name=N`
    #[arg(long = "slots", value_name = "NAME=N")]
    pub slots: Vec<String>,
    /// Number of times to execute the kernel
    #[arg(long, default_value_t = 1)]
    pub passes: u32,
}

fn fail(msg: String) -> ! {
    eprintln!("error: {}", msg);
    process::exit(1);
}

fn split_assignment(arg: &str) -> Result<(&str, &str), String> {
    arg.split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", arg))
}

/// Parse `text` as a value of type `ty`.
pub(crate) fn parse_value(ty: ScalarType, text: &str) -> Result<Value, String> {
    let text = text.trim();
    let bad = || format!("'{}' is not a valid {}", text, ty.name());
    let value = match ty {
        ScalarType::Boolean => match text {
            "true" | "1" => Value::Boolean(true),
            "false" | "0" => Value::Boolean(false),
            _ => return Err(bad()),
        },
        ScalarType::Float | ScalarType::Double => {
            Value::Double(text.parse::<f64>().map_err(|_| bad())?).cast(ty)
        }
        _ => Value::Long(text.parse::<i64>().map_err(|_| bad())?).cast(ty),
    };
    Ok(value)
}

fn parse_buffer(ty: ScalarType, contents: &str) -> Result<Buffer, String> {
    if let Some(n) = contents.strip_prefix("zeros:") {
        let len = n
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("bad length in '{}'", contents))?;
        return Ok(Buffer::zeroed(ty, len));
    }
    let values = contents
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_value(ty, s))
        .collect::<Result<Vec<_>, _>>()?;
    Buffer::from_values(ty, &values).map_err(|e| e.to_string())
}

fn to_json(v: Value) -> serde_json::Value {
    match v {
        Value::Boolean(b) => json!(b),
        Value::Byte(x) => json!(x),
        Value::Short(x) => json!(x),
        Value::Char(x) => json!(x),
        Value::Int(x) => json!(x),
        Value::Long(x) => json!(x),
        Value::Float(x) => json!(x),
        Value::Double(x) => json!(x),
    }
}

pub fn cmd_run(args: RunArgs, overrides: &DeviceOverrides) {
    let schema = load_schema(&args.input);
    let descriptor = Arc::new(build_descriptor(&schema));
    let config = dispatch_config(overrides);
    let dispatcher = Dispatcher::new(config).unwrap_or_else(|e| fail(e.to_string()));
    let mut kernel = Kernel::new(descriptor.clone(), &dispatcher);

    let mut buffers = Vec::new();
    for arg in &args.binds {
        let (name, contents) = split_assignment(arg).unwrap_or_else(|e| fail(e));
        let ty = descriptor
            .field(name)
            .and_then(|f| f.scalar_type().filter(|_| f.is_array()))
            .unwrap_or_else(|| fail(format!("'{}' is not an array field", name)));
        let buffer = parse_buffer(ty, contents).unwrap_or_else(|e| fail(format!("{}: {}", name, e)));
        kernel
            .bind(name, buffer.clone())
            .unwrap_or_else(|e| fail(e.to_string()));
        buffers.push((name.to_string(), buffer));
    }
    for arg in &args.scalars {
        let (name, text) = split_assignment(arg).unwrap_or_else(|e| fail(e));
        let ty = descriptor
            .field(name)
            .and_then(|f| f.scalar_type().filter(|_| !f.is_array()))
            .unwrap_or_else(|| fail(format!("'{}' is not a scalar field", name)));
        let value = parse_value(ty, text).unwrap_or_else(|e| fail(format!("{}: {}", name, e)));
        kernel
            .bind_scalar(name, value)
            .unwrap_or_else(|e| fail(e.to_string()));
    }
    for arg in &args.slots {
        let (name, n) = split_assignment(arg).unwrap_or_else(|e| fail(e));
        let len = n
            .parse::<usize>()
            .unwrap_or_else(|_| fail(format!("{}: bad slot count '{}'", name, n)));
        kernel
            .bind_slots(name, len)
            .unwrap_or_else(|e| fail(e.to_string()));
    }

    let mut range = Range::from_sizes(&args.global).unwrap_or_else(|e| fail(e.to_string()));
    if !args.local.is_empty() {
        range = range.with_local(&args.local);
    }

    for _ in 0..args.passes {
        if let Err(e) = kernel.execute(&range) {
            match e {
                kernelc::KernelError::Compile(err) => {
                    report_compile_error(&schema, &err);
                    process::exit(1);
                }
                other => fail(other.to_string()),
            }
        }
    }

    let mut arrays = Map::new();
    for (name, buffer) in &buffers {
        let values = buffer.values().into_iter().map(to_json).collect();
        arrays.insert(name.clone(), serde_json::Value::Array(values));
    }
    let mut slots = Map::new();
    for field in descriptor.fields().iter().filter(|f| f.is_atomic()) {
        if let Some(s) = kernel.slots(&field.name) {
            slots.insert(field.name.clone(), json!(s.values()));
        }
    }
    let report = kernel.last_report();
    let out = json!({
        "kernel": descriptor.name(),
        "device": kernel.backend().map(|d| d.to_string()),
        "pass_id": kernel.pass_id(),
        "execute_us": report.map(|r| r.execute.as_micros() as u64),
        "arrays": arrays,
        "slots": slots,
    });
    match serde_json::to_string_pretty(&out) {
        Ok(text) => println!("{}", text),
        Err(e) => fail(e.to_string()),
    }
}
