//! kernelc: run method-body IR as a data-parallel kernel.
//!
//! A kernel is declared as a [`KernelSchema`]: instance fields plus the
//! methods reachable from an entry point. [`compile_kernel`] translates
//! it to OpenCL C; a [`Dispatcher`] runs it on an [`Accelerator`] or,
//! when none is usable, on a CPU fallback that gives the same results.

pub mod atomic;
pub mod callgraph;
pub mod codegen;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod ir;
pub mod runtime;
pub mod schema;
pub mod typeck;

pub use atomic::{AtomicOp, AtomicWidth, MemoryScope, SlotArray};
pub use codegen::{compile_kernel, KernelSource};
pub use config::{DeviceKind, DispatchConfig, FallbackPolicy, TransferMode};
pub use diagnostic::{CompileError, ErrorKind};
pub use error::{KernelError, Result};
pub use ir::{Expr, Method, Place, ScalarType, SlotRef, Stmt, Value};
pub use runtime::{
    Accelerator, Buffer, Dispatcher, Kernel, KernelState, LaunchArg, ProfileObserver,
    ProfileReport, Program, Range,
};
pub use schema::{descriptor_of, ComputeTask, KernelDescriptor, KernelSchema};
