use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use super::*;
use crate::atomic::AtomicWidth;
use crate::ir::{BinOp, Expr, Method, Place, ScalarType, Stmt};
use crate::schema::KernelSchema;

type Memory = Mutex<HashMap<usize, Vec<u8>>>;

/// Test double: keeps uploaded images, records launches, and on launch
/// overwrites every buffer argument with `0x01` bytes.
#[derive(Default)]
struct FakeProgram {
    memory: Memory,
    launches: Mutex<Vec<Vec<LaunchArg>>>,
    fail_launch: bool,
    fail_download: Option<usize>,
    gate: Option<(Mutex<mpsc::Sender<()>>, Mutex<mpsc::Receiver<()>>)>,
}

impl Program for FakeProgram {
    fn upload(&self, arg: usize, bytes: &[u8]) -> std::result::Result<(), String> {
        self.memory.lock().insert(arg, bytes.to_vec());
        Ok(())
    }

    fn download(&self, arg: usize) -> std::result::Result<Vec<u8>, String> {
        if self.fail_download == Some(arg) {
            return Err(format!("read of argument {} timed out", arg));
        }
        self.memory
            .lock()
            .get(&arg)
            .cloned()
            .ok_or_else(|| format!("argument {} was never uploaded", arg))
    }

    fn launch(&self, args: &[LaunchArg], _range: &Range, _local: [usize; 3]) -> std::result::Result<(), String> {
        if let Some((entered, release)) = &self.gate {
            let _ = entered.lock().send(());
            let _ = release.lock().recv();
        }
        if self.fail_launch {
            return Err("device lost".to_string());
        }
        self.launches.lock().push(args.to_vec());
        let mut memory = self.memory.lock();
        for (i, arg) in args.iter().enumerate() {
            if let LaunchArg::Buffer { bytes } = arg {
                memory.insert(i, vec![1; *bytes]);
            }
        }
        Ok(())
    }
}

struct FakeAccelerator {
    program: Arc<FakeProgram>,
    builds: AtomicUsize,
    fail_build: bool,
}

impl FakeAccelerator {
    fn new(program: FakeProgram) -> Arc<Self> {
        Arc::new(Self {
            program: Arc::new(program),
            builds: AtomicUsize::new(0),
            fail_build: false,
        })
    }
}

impl Accelerator for FakeAccelerator {
    fn name(&self) -> &str {
        "fake"
    }

    fn build(&self, _source: &KernelSource) -> std::result::Result<Arc<dyn Program>, String> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_build {
            return Err("compiler rejected the kernel".to_string());
        }
        Ok(self.program.clone())
    }
}

fn doubler() -> Arc<KernelDescriptor> {
    let gid = || Expr::global_id(0);
    Arc::new(
        KernelSchema::new("Doubler")
            .array("input", ScalarType::Int)
            .array("output", ScalarType::Int)
            .method(Method::new(
                "run",
                vec![Stmt::expr(Expr::assign(
                    Place::index("output", gid()),
                    Expr::binary(BinOp::Mul, Expr::index("input", gid()), Expr::int(2)),
                ))],
            ))
            .build()
            .unwrap(),
    )
}

fn config(devices: &[DeviceKind], policy: FallbackPolicy) -> DispatchConfig {
    DispatchConfig::builder()
        .devices(devices)
        .fallback(policy)
        .num_threads(2)
        .build()
        .unwrap()
}

fn bound_doubler<'d>(dispatcher: &'d Dispatcher) -> (Kernel<'d>, Buffer, Buffer) {
    let input = Buffer::from(vec![1i32, 2, 3, 4]);
    let output = Buffer::zeroed(ScalarType::Int, 4);
    let mut kernel = Kernel::new(doubler(), dispatcher);
    kernel.bind("input", input.clone()).unwrap();
    kernel.bind("output", output.clone()).unwrap();
    (kernel, input, output)
}

#[test]
fn test_lifecycle_on_fallback() {
    let dispatcher = Dispatcher::new(config(&[DeviceKind::ThreadPool], FallbackPolicy::Strict)).unwrap();
    let (kernel, _, output) = bound_doubler(&dispatcher);
    assert_eq!(kernel.state(), KernelState::Uncompiled);
    assert_eq!(kernel.backend(), None);
    assert_eq!(kernel.compile().unwrap(), DeviceKind::ThreadPool);
    assert_eq!(kernel.state(), KernelState::Compiled(DeviceKind::ThreadPool));
    kernel.execute(&Range::one_d(4)).unwrap();
    assert_eq!(kernel.state(), KernelState::Idle(DeviceKind::ThreadPool));
    assert_eq!(output.to_vec::<i32>().unwrap(), vec![2, 4, 6, 8]);
    assert_eq!(kernel.pass_id(), 1);
}

#[test]
fn test_binding_validation() {
    let dispatcher = Dispatcher::new(config(&[DeviceKind::Sequential], FallbackPolicy::Strict)).unwrap();
    let mut kernel = Kernel::new(doubler(), &dispatcher);
    assert!(kernel.bind("input", Buffer::from(vec![1.0f32])).is_err());
    assert!(kernel.bind("missing", Buffer::from(vec![1i32])).is_err());
    assert!(kernel.bind_scalar("input", Value::Int(1)).is_err());
    kernel.bind("input", Buffer::from(vec![1i32])).unwrap();
    let err = kernel.execute(&Range::one_d(1)).unwrap_err();
    assert!(matches!(err, KernelError::Binding(ref m) if m.contains("output")));
    assert_eq!(kernel.state(), KernelState::Uncompiled);
}

#[test]
fn test_invalid_range_rejected_before_running() {
    let dispatcher = Dispatcher::new(config(&[DeviceKind::Sequential], FallbackPolicy::Strict)).unwrap();
    let (kernel, _, output) = bound_doubler(&dispatcher);
    let err = kernel.execute(&Range::one_d(4).with_local(&[3])).unwrap_err();
    assert!(matches!(err, KernelError::InvalidRange(_)));
    assert_eq!(output.to_vec::<i32>().unwrap(), vec![0; 4]);
    assert_eq!(kernel.pass_id(), 0);
}

#[test]
fn test_accelerator_launch_args_and_implicit_transfer() {
    let acc = FakeAccelerator::new(FakeProgram::default());
    let dispatcher = Dispatcher::new(config(&[DeviceKind::Accelerator], FallbackPolicy::Strict))
        .unwrap()
        .with_accelerator(acc.clone());
    let (kernel, input, output) = bound_doubler(&dispatcher);
    kernel.execute(&Range::one_d(4)).unwrap();
    kernel.execute(&Range::one_d(4)).unwrap();

    assert_eq!(kernel.backend(), Some(DeviceKind::Accelerator));
    let launches = acc.program.launches.lock();
    assert_eq!(
        launches[1],
        vec![
            LaunchArg::Buffer { bytes: 16 },
            LaunchArg::Buffer { bytes: 16 },
            LaunchArg::Scalar(Value::Int(1)),
        ]
    );
    // Only the written array comes back.
    assert_eq!(input.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(output.to_vec::<i32>().unwrap(), vec![0x0101_0101; 4]);
    assert_eq!(acc.builds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_program_cache_is_shared_between_instances() {
    let acc = FakeAccelerator::new(FakeProgram::default());
    let dispatcher = Dispatcher::new(config(&[DeviceKind::Accelerator], FallbackPolicy::Strict))
        .unwrap()
        .with_accelerator(acc.clone());
    let (a, _, _) = bound_doubler(&dispatcher);
    let (b, _, _) = bound_doubler(&dispatcher);
    a.compile().unwrap();
    b.compile().unwrap();
    assert_eq!(acc.builds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_strict_policy_surfaces_accelerator_failure() {
    let acc = FakeAccelerator::new(FakeProgram {
        fail_launch: true,
        ..Default::default()
    });
    let dispatcher = Dispatcher::new(config(
        &[DeviceKind::Accelerator, DeviceKind::ThreadPool],
        FallbackPolicy::Strict,
    ))
    .unwrap()
    .with_accelerator(acc);
    let (kernel, _, output) = bound_doubler(&dispatcher);
    let err = kernel.execute(&Range::one_d(4)).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(output.to_vec::<i32>().unwrap(), vec![0; 4]);
    assert_eq!(kernel.pass_id(), 0);
}

#[test]
fn test_fallback_policy_retries_on_next_device() {
    let acc = FakeAccelerator::new(FakeProgram {
        fail_launch: true,
        ..Default::default()
    });
    let dispatcher = Dispatcher::new(config(
        &[DeviceKind::Accelerator, DeviceKind::ThreadPool],
        FallbackPolicy::FallBack,
    ))
    .unwrap()
    .with_accelerator(acc);
    let (kernel, _, output) = bound_doubler(&dispatcher);
    kernel.execute(&Range::one_d(4)).unwrap();
    assert_eq!(kernel.backend(), Some(DeviceKind::ThreadPool));
    assert_eq!(output.to_vec::<i32>().unwrap(), vec![2, 4, 6, 8]);
    let report = kernel.last_report().unwrap();
    assert!(report.fell_back);
    assert_eq!(report.device, DeviceKind::ThreadPool);
}

/// `a[gid] += 1; b[gid] += 1` over two zeroed arrays.
fn bump_both<'d>(dispatcher: &'d Dispatcher) -> (Kernel<'d>, Buffer, Buffer) {
    let gid = || Expr::global_id(0);
    let descriptor = KernelSchema::new("BumpBoth")
        .array("a", ScalarType::Int)
        .array("b", ScalarType::Int)
        .method(Method::new(
            "run",
            vec![
                Stmt::expr(Expr::compound(Place::index("a", gid()), BinOp::Add, Expr::int(1))),
                Stmt::expr(Expr::compound(Place::index("b", gid()), BinOp::Add, Expr::int(1))),
            ],
        ))
        .build()
        .unwrap();
    let a = Buffer::zeroed(ScalarType::Int, 4);
    let b = Buffer::zeroed(ScalarType::Int, 4);
    let mut kernel = Kernel::new(Arc::new(descriptor), dispatcher);
    kernel.bind("a", a.clone()).unwrap();
    kernel.bind("b", b.clone()).unwrap();
    (kernel, a, b)
}

#[test]
fn test_failed_download_leaves_host_untouched() {
    let acc = FakeAccelerator::new(FakeProgram {
        fail_download: Some(1),
        ..Default::default()
    });
    let dispatcher = Dispatcher::new(config(
        &[DeviceKind::Accelerator, DeviceKind::Sequential],
        FallbackPolicy::Strict,
    ))
    .unwrap()
    .with_accelerator(acc);
    let (kernel, a, b) = bump_both(&dispatcher);
    let err = kernel.execute(&Range::one_d(4)).unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert_eq!(a.to_vec::<i32>().unwrap(), vec![0; 4]);
    assert_eq!(b.to_vec::<i32>().unwrap(), vec![0; 4]);
    assert_eq!(kernel.pass_id(), 0);
    assert_eq!(kernel.state(), KernelState::Idle(DeviceKind::Accelerator));
}

#[test]
fn test_fallback_after_failed_download_applies_once() {
    let acc = FakeAccelerator::new(FakeProgram {
        fail_download: Some(1),
        ..Default::default()
    });
    let dispatcher = Dispatcher::new(config(
        &[DeviceKind::Accelerator, DeviceKind::Sequential],
        FallbackPolicy::FallBack,
    ))
    .unwrap()
    .with_accelerator(acc);
    let (kernel, a, b) = bump_both(&dispatcher);
    kernel.execute(&Range::one_d(4)).unwrap();
    assert_eq!(a.to_vec::<i32>().unwrap(), vec![1; 4]);
    assert_eq!(b.to_vec::<i32>().unwrap(), vec![1; 4]);
    assert_eq!(kernel.backend(), Some(DeviceKind::Sequential));
    assert!(kernel.last_report().unwrap().fell_back);
    assert_eq!(kernel.pass_id(), 1);
}

#[test]
fn test_build_failure_falls_back_at_compile() {
    let acc = Arc::new(FakeAccelerator {
        program: Arc::new(FakeProgram::default()),
        builds: AtomicUsize::new(0),
        fail_build: true,
    });
    let devices = [DeviceKind::Accelerator, DeviceKind::Sequential];
    let strict = Dispatcher::new(config(&devices, FallbackPolicy::Strict))
        .unwrap()
        .with_accelerator(acc.clone());
    let (kernel, _, _) = bound_doubler(&strict);
    assert!(kernel.compile().is_err());

    let lenient = Dispatcher::new(config(&devices, FallbackPolicy::FallBack))
        .unwrap()
        .with_accelerator(acc);
    let (kernel, _, _) = bound_doubler(&lenient);
    assert_eq!(kernel.compile().unwrap(), DeviceKind::Sequential);
}

#[test]
fn test_missing_accelerator_is_skipped() {
    let dispatcher = Dispatcher::new(config(
        &[DeviceKind::Accelerator, DeviceKind::Sequential],
        FallbackPolicy::Strict,
    ))
    .unwrap();
    let (kernel, _, _) = bound_doubler(&dispatcher);
    assert_eq!(kernel.compile().unwrap(), DeviceKind::Sequential);
}

#[test]
fn test_concurrent_execute_is_busy() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let acc = FakeAccelerator::new(FakeProgram {
        gate: Some((Mutex::new(entered_tx), Mutex::new(release_rx))),
        ..Default::default()
    });
    let dispatcher = Dispatcher::new(config(&[DeviceKind::Accelerator], FallbackPolicy::Strict))
        .unwrap()
        .with_accelerator(acc);
    let (kernel, _, _) = bound_doubler(&dispatcher);
    std::thread::scope(|s| {
        let first = s.spawn(|| kernel.execute(&Range::one_d(4)));
        entered_rx.recv().unwrap();
        assert_eq!(kernel.state(), KernelState::Executing(DeviceKind::Accelerator));
        let err = kernel.execute(&Range::one_d(4)).unwrap_err();
        assert!(matches!(err, KernelError::Busy(ref name) if name == "Doubler"));
        release_tx.send(()).unwrap();
        first.join().unwrap().unwrap();
    });
    assert_eq!(kernel.pass_id(), 1);
}

#[test]
fn test_explicit_transfers() {
    let acc = FakeAccelerator::new(FakeProgram::default());
    let cfg = DispatchConfig::builder()
        .devices(&[DeviceKind::Accelerator])
        .transfer_mode(TransferMode::Explicit)
        .build()
        .unwrap();
    let dispatcher = Dispatcher::new(cfg).unwrap().with_accelerator(acc.clone());
    let (kernel, _, output) = bound_doubler(&dispatcher);

    // The first transfer compiles the kernel so the upload is not lost.
    kernel.put("input").unwrap();
    assert_eq!(kernel.state(), KernelState::Compiled(DeviceKind::Accelerator));
    kernel.put("output").unwrap();
    assert_eq!(acc.program.memory.lock()[&0], vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0]);
    kernel.execute(&Range::one_d(4)).unwrap();
    assert_eq!(output.to_vec::<i32>().unwrap(), vec![0; 4]);
    kernel.get("output").unwrap();
    assert_eq!(output.to_vec::<i32>().unwrap(), vec![0x0101_0101; 4]);
    assert!(kernel.get("nope").is_err());
}

#[test]
fn test_atomic_slots_lifecycle() {
    let schema = KernelSchema::new("Counter")
        .atomic("hits", AtomicWidth::Int)
        .atomic_array("bins", AtomicWidth::Long)
        .method(Method::new(
            "run",
            vec![
                Stmt::expr(Expr::atomic(
                    crate::atomic::AtomicOp::Inc,
                    crate::ir::SlotRef::scalar("hits"),
                    vec![],
                )),
                Stmt::expr(Expr::atomic(
                    crate::atomic::AtomicOp::Add,
                    crate::ir::SlotRef::element(
                        "bins",
                        Expr::binary(BinOp::Rem, Expr::global_id(0), Expr::int(2)),
                    ),
                    vec![Expr::long(10)],
                )),
            ],
        ));
    let dispatcher = Dispatcher::new(config(&[DeviceKind::ThreadPool], FallbackPolicy::Strict)).unwrap();
    let mut kernel = Kernel::new(Arc::new(schema.build().unwrap()), &dispatcher);
    assert!(kernel.slots("bins").is_none());
    let bins = kernel.bind_slots("bins", 2).unwrap();
    let hits = kernel.slots("hits").unwrap();
    hits.set(0, 100);
    kernel.execute(&Range::one_d(64)).unwrap();
    kernel.execute(&Range::one_d(64)).unwrap();
    assert_eq!(hits.get(0), Some(228));
    assert_eq!(bins.values(), vec![640, 640]);
}

struct Collector(Mutex<Vec<ProfileReport>>);

impl ProfileObserver for Collector {
    fn receive_report(&self, report: &ProfileReport) {
        self.0.lock().push(report.clone());
    }
}

#[test]
fn test_profile_reports_delivered() {
    let dispatcher = Dispatcher::new(config(&[DeviceKind::Sequential], FallbackPolicy::Strict)).unwrap();
    let collector = Arc::new(Collector(Mutex::new(Vec::new())));
    dispatcher.add_observer(collector.clone());
    let (kernel, _, _) = bound_doubler(&dispatcher);
    kernel.execute(&Range::one_d(4)).unwrap();
    kernel.execute(&Range::one_d(4)).unwrap();
    let reports = collector.0.lock();
    assert_eq!(reports.len(), 2);
    assert!(reports[0].compile.is_some());
    assert!(reports[1].compile.is_none());
    assert_eq!(reports[1].pass_id, 1);
    assert_eq!(reports[1].work_items, 4);
    assert_eq!(reports[1].device, DeviceKind::Sequential);
}

struct Task;

impl ComputeTask for Task {
    fn name(&self) -> &str {
        "Task"
    }

    fn describe(&self, schema: KernelSchema) -> KernelSchema {
        schema.array("out", ScalarType::Int).method(Method::new(
            "run",
            vec![Stmt::expr(Expr::assign(
                Place::index("out", Expr::global_id(0)),
                Expr::builtin(crate::ir::Builtin::PassId, vec![]),
            ))],
        ))
    }
}

#[test]
fn test_descriptor_cache_and_pass_id() {
    let dispatcher = Dispatcher::new(config(&[DeviceKind::Sequential], FallbackPolicy::Strict)).unwrap();
    let a = dispatcher.descriptor(&Task).unwrap();
    let b = dispatcher.descriptor(&Task).unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let out = Buffer::zeroed(ScalarType::Int, 2);
    let mut kernel = Kernel::for_task(&Task, &dispatcher).unwrap();
    kernel.bind("out", out.clone()).unwrap();
    for expected in 0..3 {
        kernel.execute(&Range::one_d(2)).unwrap();
        assert_eq!(out.to_vec::<i32>().unwrap(), vec![expected, expected]);
    }
    assert_eq!(kernel.pass_id(), 3);
}

/// Same name as [`Task`], different declaration.
struct OtherTask;

impl ComputeTask for OtherTask {
    fn name(&self) -> &str {
        "Task"
    }

    fn describe(&self, schema: KernelSchema) -> KernelSchema {
        schema
            .array("out", ScalarType::Long)
            .method(Method::new(
                "run",
                vec![Stmt::expr(Expr::assign(
                    Place::index("out", Expr::global_id(0)),
                    Expr::long(7),
                ))],
            ))
    }
}

#[test]
fn test_descriptor_cache_separates_tasks_sharing_a_name() {
    let dispatcher = Dispatcher::new(config(&[DeviceKind::Sequential], FallbackPolicy::Strict)).unwrap();
    let first = dispatcher.descriptor(&Task).unwrap();
    let other = dispatcher.descriptor(&OtherTask).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(other.field("out").unwrap().scalar_type(), Some(ScalarType::Long));
    assert!(Arc::ptr_eq(&first, &dispatcher.descriptor(&Task).unwrap()));
    assert!(Arc::ptr_eq(&other, &dispatcher.descriptor(&OtherTask).unwrap()));
}
