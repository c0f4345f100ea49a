//! Backend execution dispatcher.
//!
//! A [`Dispatcher`] owns what is shared between kernels: the
//! configuration, the fallback worker pool, the optional accelerator,
//! the program cache (keyed by source hash) and the descriptor cache.
//! A [`Kernel`] is one instance of a descriptor with its bound fields
//! and atomic slots. Each instance moves through
//!
//! ```text
//! Uncompiled -> Compiled(device) -> Executing -> Idle(device)
//! ```
//!
//! and rejects a second `execute` while one is running.

mod buffer;
pub mod device;
mod fallback;
mod interp;
mod profile;
mod range;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::atomic::SlotArray;
use crate::codegen::{compile_kernel, KernelSource};
use crate::config::{DeviceKind, DispatchConfig, FallbackPolicy, TransferMode};
use crate::error::{KernelError, Result};
use crate::ir::Value;
use crate::schema::{ComputeTask, ElementType, KernelDescriptor, KernelSchema};
use crate::typeck;

pub use buffer::{Buffer, Element};
pub use device::{Accelerator, LaunchArg, Program};
pub use profile::{ProfileObserver, ProfileReport};
pub use range::Range;

use fallback::{Launch, Snapshot};

/// What a field is bound to for one kernel instance.
#[derive(Clone, Debug)]
pub(crate) enum Bound {
    Scalar(Value),
    Array(Buffer),
    Slots(Arc<SlotArray>),
}

pub struct Dispatcher {
    config: DispatchConfig,
    pool: rayon::ThreadPool,
    accelerator: Option<Arc<dyn Accelerator>>,
    programs: Mutex<HashMap<blake3::Hash, Arc<dyn Program>>>,
    descriptors: Mutex<HashMap<String, Vec<(KernelSchema, Arc<KernelDescriptor>)>>>,
    observers: Mutex<Vec<Arc<dyn ProfileObserver>>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        let prefix = config.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads())
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()
            .map_err(|e| KernelError::config(format!("worker pool: {}", e)))?;
        tracing::debug!(
            devices = ?config.devices,
            threads = pool.current_num_threads(),
            "dispatcher ready"
        );
        Ok(Self {
            config,
            pool,
            accelerator: None,
            programs: Mutex::new(HashMap::new()),
            descriptors: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn add_observer(&self, observer: Arc<dyn ProfileObserver>) {
        self.observers.lock().push(observer);
    }

    /// Descriptor for `task`, built on first request and reused after.
    /// Tasks sharing a name are told apart by their declarations.
    pub fn descriptor<T: ComputeTask + ?Sized>(&self, task: &T) -> Result<Arc<KernelDescriptor>> {
        let schema = task.describe(KernelSchema::new(task.name()));
        let cached = |entries: &[(KernelSchema, Arc<KernelDescriptor>)]| {
            entries.iter().find(|(s, _)| *s == schema).map(|(_, d)| d.clone())
        };
        if let Some(d) = self.descriptors.lock().get(task.name()).and_then(|e| cached(e.as_slice())) {
            return Ok(d);
        }
        let descriptor = Arc::new(schema.build()?);
        let mut descriptors = self.descriptors.lock();
        let entries = descriptors.entry(task.name().to_string()).or_default();
        if let Some(d) = cached(entries.as_slice()) {
            return Ok(d);
        }
        entries.push((schema.clone(), descriptor.clone()));
        Ok(descriptor)
    }

    /// Build `source` on the accelerator, reusing a cached program for
    /// identical source text.
    fn program(&self, source: &KernelSource) -> Result<Arc<dyn Program>> {
        let Some(acc) = &self.accelerator else {
            return Err(KernelError::execution(
                DeviceKind::Accelerator,
                "no accelerator is configured",
            ));
        };
        if let Some(p) = self.programs.lock().get(&source.hash) {
            tracing::debug!(kernel = %source.entry, hash = %source.hash_hex(), "program cache hit");
            return Ok(p.clone());
        }
        let program = acc
            .build(source)
            .map_err(|e| KernelError::execution(DeviceKind::Accelerator, e))?;
        self.programs.lock().insert(source.hash, program.clone());
        tracing::info!(device = acc.name(), hash = %source.hash_hex(), "built kernel program");
        Ok(program)
    }

    fn notify(&self, report: &ProfileReport) {
        for observer in self.observers.lock().iter() {
            observer.receive_report(report);
        }
    }
}

/// Where a compiled instance runs.
#[derive(Clone)]
enum Backend {
    Accelerator(Arc<dyn Program>),
    Fallback(DeviceKind),
}

impl Backend {
    fn device(&self) -> DeviceKind {
        match self {
            Backend::Accelerator(_) => DeviceKind::Accelerator,
            Backend::Fallback(d) => *d,
        }
    }
}

#[derive(Clone)]
enum State {
    Uncompiled,
    Compiled(Backend),
    Executing(Backend),
    Idle(Backend),
}

/// Observable lifecycle state of a [`Kernel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelState {
    Uncompiled,
    Compiled(DeviceKind),
    Executing(DeviceKind),
    Idle(DeviceKind),
}

pub struct Kernel<'d> {
    dispatcher: &'d Dispatcher,
    descriptor: Arc<KernelDescriptor>,
    bindings: Vec<Option<Bound>>,
    state: Mutex<State>,
    pass_id: Mutex<i32>,
    last_report: Mutex<Option<ProfileReport>>,
}

impl<'d> Kernel<'d> {
    /// A new instance. Scalar atomic fields get their slot immediately;
    /// atomic arrays are sized with [`Kernel::bind_slots`].
    pub fn new(descriptor: Arc<KernelDescriptor>, dispatcher: &'d Dispatcher) -> Self {
        let bindings = descriptor
            .fields()
            .iter()
            .map(|f| match f.atomic_width() {
                Some(width) if !f.is_array() => {
                    Some(Bound::Slots(Arc::new(SlotArray::new(width, f.scope(), 1))))
                }
                _ => None,
            })
            .collect();
        Self {
            dispatcher,
            descriptor,
            bindings,
            state: Mutex::new(State::Uncompiled),
            pass_id: Mutex::new(0),
            last_report: Mutex::new(None),
        }
    }

    /// Instance of a task's kernel, reusing the dispatcher's descriptor.
    pub fn for_task<T: ComputeTask + ?Sized>(task: &T, dispatcher: &'d Dispatcher) -> Result<Self> {
        Ok(Self::new(dispatcher.descriptor(task)?, dispatcher))
    }

    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.descriptor
    }

    fn field_index(&self, name: &str) -> Result<usize> {
        self.descriptor.field_position(name).ok_or_else(|| {
            KernelError::binding(format!(
                "kernel '{}' has no field '{}'",
                self.descriptor.name(),
                name
            ))
        })
    }

    /// Bind an array field to `buffer`, which is shared, not copied.
    pub fn bind(&mut self, name: &str, buffer: Buffer) -> Result<()> {
        let i = self.field_index(name)?;
        let field = &self.descriptor.fields()[i];
        match (field.element, field.is_array()) {
            (ElementType::Scalar(t), true) if t == buffer.element_type() => {}
            _ => {
                return Err(KernelError::binding(format!(
                    "field '{}' cannot hold a {} buffer",
                    name,
                    buffer.element_type().name()
                )))
            }
        }
        self.bindings[i] = Some(Bound::Array(buffer));
        Ok(())
    }

    /// Set a scalar field. The value is copied into each work-item.
    pub fn bind_scalar(&mut self, name: &str, value: Value) -> Result<()> {
        let i = self.field_index(name)?;
        let field = &self.descriptor.fields()[i];
        match (field.element, field.is_array()) {
            (ElementType::Scalar(t), false) if t == value.ty() => {}
            _ => {
                return Err(KernelError::binding(format!(
                    "field '{}' cannot hold a {} value",
                    name,
                    value.ty().name()
                )))
            }
        }
        self.bindings[i] = Some(Bound::Scalar(value));
        Ok(())
    }

    /// Create the slots of an atomic array field, all zero.
    pub fn bind_slots(&mut self, name: &str, len: usize) -> Result<Arc<SlotArray>> {
        let i = self.field_index(name)?;
        let field = &self.descriptor.fields()[i];
        let Some(width) = field.atomic_width().filter(|_| field.is_array()) else {
            return Err(KernelError::binding(format!(
                "field '{}' is not an atomic array",
                name
            )));
        };
        let slots = Arc::new(SlotArray::new(width, field.scope(), len));
        self.bindings[i] = Some(Bound::Slots(slots.clone()));
        Ok(slots)
    }

    /// The slots of an atomic field. They persist across `execute` calls.
    pub fn slots(&self, name: &str) -> Option<Arc<SlotArray>> {
        let i = self.descriptor.field_position(name)?;
        match &self.bindings[i] {
            Some(Bound::Slots(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn pass_id(&self) -> i32 {
        *self.pass_id.lock()
    }

    pub fn state(&self) -> KernelState {
        match &*self.state.lock() {
            State::Uncompiled => KernelState::Uncompiled,
            State::Compiled(b) => KernelState::Compiled(b.device()),
            State::Executing(b) => KernelState::Executing(b.device()),
            State::Idle(b) => KernelState::Idle(b.device()),
        }
    }

    /// Device of the compiled instance, if compiled.
    pub fn backend(&self) -> Option<DeviceKind> {
        match self.state() {
            KernelState::Uncompiled => None,
            KernelState::Compiled(d) | KernelState::Executing(d) | KernelState::Idle(d) => Some(d),
        }
    }

    pub fn last_report(&self) -> Option<ProfileReport> {
        self.last_report.lock().clone()
    }

    /// Compile for the most preferred device that accepts the kernel.
    /// Idempotent once compiled.
    pub fn compile(&self) -> Result<DeviceKind> {
        let mut state = self.state.lock();
        match &*state {
            State::Uncompiled => {}
            State::Executing(_) => return Err(KernelError::Busy(self.descriptor.name().to_string())),
            State::Compiled(b) | State::Idle(b) => return Ok(b.device()),
        }
        let backend = self.compile_from(0)?;
        let device = backend.device();
        *state = State::Compiled(backend);
        Ok(device)
    }

    /// Try devices from position `start` of the preference list.
    fn compile_from(&self, start: usize) -> Result<Backend> {
        typeck::check(&self.descriptor)?;
        let config = &self.dispatcher.config;
        let mut last_err = None;
        for &device in config.devices.iter().skip(start) {
            match device {
                DeviceKind::Accelerator => {
                    if self.dispatcher.accelerator.is_none() {
                        tracing::debug!(kernel = self.descriptor.name(), "no accelerator, skipping");
                        continue;
                    }
                    let source = compile_kernel(&self.descriptor)?;
                    match self.dispatcher.program(&source) {
                        Ok(program) => return Ok(Backend::Accelerator(program)),
                        Err(e) if config.fallback == FallbackPolicy::Strict => return Err(e),
                        Err(e) => {
                            tracing::warn!(
                                kernel = self.descriptor.name(),
                                error = %e,
                                "accelerator build failed, falling back"
                            );
                            last_err = Some(e);
                        }
                    }
                }
                fallback => {
                    tracing::debug!(kernel = self.descriptor.name(), device = %fallback, "using CPU fallback");
                    return Ok(Backend::Fallback(fallback));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            KernelError::config(format!(
                "no configured device can run kernel '{}'",
                self.descriptor.name()
            ))
        }))
    }

    /// Every field bound, in declaration order.
    fn bound(&self) -> Result<Vec<Bound>> {
        self.descriptor
            .fields()
            .iter()
            .zip(&self.bindings)
            .map(|(f, b)| {
                b.clone()
                    .ok_or_else(|| KernelError::binding(format!("field '{}' is not bound", f.name)))
            })
            .collect()
    }

    /// Run the entry point once per index of `range`, synchronously.
    pub fn execute(&self, range: &Range) -> Result<()> {
        let bound = self.bound()?;
        let local = range.local_sizes(self.dispatcher.config.max_work_group_size)?;

        let compile_started = Instant::now();
        let (mut backend, compile_time) = {
            let mut state = self.state.lock();
            let (backend, compiled) = match &*state {
                State::Executing(_) => {
                    return Err(KernelError::Busy(self.descriptor.name().to_string()))
                }
                State::Uncompiled => (self.compile_from(0)?, true),
                State::Compiled(b) | State::Idle(b) => (b.clone(), false),
            };
            *state = State::Executing(backend.clone());
            (backend, compiled.then(|| compile_started.elapsed()))
        };

        let pass_id = self.pass_id();
        let mut fell_back = false;
        let mut result = self.run(&backend, &bound, range, local, pass_id);
        if let Err(e) = &result {
            if e.is_retryable() && self.dispatcher.config.fallback == FallbackPolicy::FallBack {
                tracing::warn!(kernel = self.descriptor.name(), error = %e, "retrying on fallback device");
                let start = self
                    .dispatcher
                    .config
                    .devices
                    .iter()
                    .position(|d| *d == DeviceKind::Accelerator)
                    .map_or(0, |p| p + 1);
                match self.compile_from(start) {
                    Ok(next) => {
                        backend = next;
                        fell_back = true;
                        result = self.run(&backend, &bound, range, local, pass_id);
                    }
                    Err(e) => result = Err(e),
                }
            }
        }

        *self.state.lock() = State::Idle(backend.clone());
        let (transfer, execute) = result?;
        *self.pass_id.lock() += 1;

        let report = ProfileReport {
            kernel: self.descriptor.name().to_string(),
            device: backend.device(),
            pass_id,
            work_items: range.work_items(),
            compile: compile_time,
            transfer,
            execute,
            fell_back,
        };
        tracing::debug!(
            kernel = %report.kernel,
            device = %report.device,
            pass = pass_id,
            items = report.work_items,
            "executed"
        );
        self.dispatcher.notify(&report);
        *self.last_report.lock() = Some(report);
        Ok(())
    }

    fn run(
        &self,
        backend: &Backend,
        bound: &[Bound],
        range: &Range,
        local: [usize; 3],
        pass_id: i32,
    ) -> Result<(Duration, Duration)> {
        match backend {
            Backend::Accelerator(program) => {
                let snapshot = Snapshot::capture(&self.descriptor, bound);
                let outcome = self.run_accelerated(program.as_ref(), bound, range, local, pass_id);
                if outcome.is_err() {
                    snapshot.restore(bound);
                }
                outcome
            }
            Backend::Fallback(device) => {
                let launch = Launch {
                    descriptor: &self.descriptor,
                    bound,
                    range,
                    local,
                    pass_id,
                };
                let snapshot = Snapshot::capture(&self.descriptor, bound);
                let started = Instant::now();
                let outcome = match device {
                    DeviceKind::ThreadPool => launch.run_on(&self.dispatcher.pool),
                    _ => launch.run_sequential(),
                };
                match outcome {
                    Ok(()) => Ok((Duration::ZERO, started.elapsed())),
                    Err(fault) => {
                        snapshot.restore(bound);
                        tracing::warn!(
                            kernel = self.descriptor.name(),
                            %fault,
                            "work-item fault, state rolled back"
                        );
                        Err(KernelError::execution(*device, fault.to_string()))
                    }
                }
            }
        }
    }

    fn run_accelerated(
        &self,
        program: &dyn Program,
        bound: &[Bound],
        range: &Range,
        local: [usize; 3],
        pass_id: i32,
    ) -> Result<(Duration, Duration)> {
        let acc_err = |e: String| KernelError::execution(DeviceKind::Accelerator, e);
        let implicit = self.dispatcher.config.transfer_mode == TransferMode::Implicit;
        let args = device::launch_args(&self.descriptor, bound, pass_id);
        let mut transfer = Duration::ZERO;

        if implicit {
            let started = Instant::now();
            for (index, (arg, field)) in args.iter().enumerate() {
                if let (LaunchArg::Buffer { .. }, Some(f)) = (arg, field) {
                    program
                        .upload(index, &device_image(&bound[*f]))
                        .map_err(acc_err)?;
                }
            }
            transfer += started.elapsed();
        }

        let launch_args: Vec<LaunchArg> = args.iter().map(|(a, _)| a.clone()).collect();
        let started = Instant::now();
        program.launch(&launch_args, range, local).map_err(acc_err)?;
        let execute = started.elapsed();

        if implicit {
            let started = Instant::now();
            // Nothing reaches the host until every written image is back.
            let mut images = Vec::new();
            for (index, (arg, field)) in args.iter().enumerate() {
                let (LaunchArg::Buffer { .. }, Some(f)) = (arg, field) else {
                    continue;
                };
                if self.descriptor.fields()[*f].is_written() {
                    images.push((*f, program.download(index).map_err(acc_err)?));
                }
            }
            for (f, bytes) in &images {
                load_device_image(&bound[*f], bytes).map_err(acc_err)?;
            }
            transfer += started.elapsed();
        }
        Ok((transfer, execute))
    }

    /// The accelerator program in explicit mode, compiling first if
    /// needed so that transfers issued before `execute` reach the device.
    fn explicit_program(&self) -> Result<Option<Arc<dyn Program>>> {
        if self.dispatcher.config.transfer_mode != TransferMode::Explicit {
            return Ok(None);
        }
        self.compile()?;
        match &*self.state.lock() {
            State::Compiled(Backend::Accelerator(p)) | State::Idle(Backend::Accelerator(p)) => {
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    fn transfer_target(&self, name: &str) -> Result<Option<(Arc<dyn Program>, usize, Bound)>> {
        let f = self.field_index(name)?;
        let Some(program) = self.explicit_program()? else {
            return Ok(None);
        };
        if !device::is_transferred(&self.descriptor, f) {
            return Ok(None);
        }
        let Some(bound) = self.bindings[f].clone() else {
            return Err(KernelError::binding(format!("field '{}' is not bound", name)));
        };
        let index = device::arg_index(&self.descriptor, f)
            .ok_or_else(|| KernelError::binding(format!("field '{}' has no launch argument", name)))?;
        Ok(Some((program, index, bound)))
    }

    /// Copy a field's host contents to the device. Only has an effect in
    /// explicit transfer mode, where it compiles the kernel if needed.
    pub fn put(&self, name: &str) -> Result<()> {
        if let Some((program, index, bound)) = self.transfer_target(name)? {
            program
                .upload(index, &device_image(&bound))
                .map_err(|e| KernelError::execution(DeviceKind::Accelerator, e))?;
        }
        Ok(())
    }

    /// Copy a field's device contents back to the host. Only has an
    /// effect in explicit transfer mode on the accelerator.
    pub fn get(&self, name: &str) -> Result<()> {
        if let Some((program, index, bound)) = self.transfer_target(name)? {
            let acc_err = |e: String| KernelError::execution(DeviceKind::Accelerator, e);
            let bytes = program.download(index).map_err(acc_err)?;
            load_device_image(&bound, &bytes).map_err(acc_err)?;
        }
        Ok(())
    }
}

fn device_image(bound: &Bound) -> Vec<u8> {
    match bound {
        Bound::Array(b) => b.to_le_bytes(),
        Bound::Slots(s) => device::slots_to_le_bytes(s),
        Bound::Scalar(_) => Vec::new(),
    }
}

fn load_device_image(bound: &Bound, bytes: &[u8]) -> std::result::Result<(), String> {
    match bound {
        Bound::Array(b) => b.copy_from_le_bytes(bytes).map_err(|e| e.to_string()),
        Bound::Slots(s) => device::slots_from_le_bytes(s, bytes),
        Bound::Scalar(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests;
