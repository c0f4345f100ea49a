use std::sync::Arc;

use kernelc::atomic::{AtomicSlot, AtomicWidth, MemoryScope};
use kernelc::ir::{BinOp, Builtin, Expr, Method, Place, ScalarType, SlotRef, Stmt};
use kernelc::{
    compile_kernel, AtomicOp, Buffer, DeviceKind, DispatchConfig, Dispatcher, Kernel, KernelError,
    KernelSchema, Range, Value,
};

fn dispatcher(device: DeviceKind) -> Dispatcher {
    let config = DispatchConfig::builder()
        .devices(&[device])
        .num_threads(4)
        .build()
        .unwrap();
    Dispatcher::new(config).unwrap()
}

fn gid() -> Expr {
    Expr::global_id(0)
}

fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(op, lhs, rhs)
}

fn run(body: Vec<Stmt>) -> Method {
    Method::new("run", body)
}

// ── atomics ──

/// `gid % 2 == 0 ? gid * 3 - 50 : 5 - gid`, which equals the initial
/// slot value on even work-items only.
fn operand() -> Expr {
    Expr::Conditional {
        cond: Box::new(bin(
            BinOp::Eq,
            bin(BinOp::Rem, gid(), Expr::int(2)),
            Expr::int(0),
        )),
        then_value: Box::new(bin(
            BinOp::Sub,
            bin(BinOp::Mul, gid(), Expr::int(3)),
            Expr::int(50),
        )),
        else_value: Box::new(bin(BinOp::Sub, Expr::int(5), gid())),
    }
}

fn initial(i: usize) -> i64 {
    i as i64 * 3 - 50
}

fn operands_for(op: AtomicOp, i: usize) -> Vec<i64> {
    let i = i as i64;
    let a = if i % 2 == 0 { i * 3 - 50 } else { 5 - i };
    match op.arity() {
        0 => vec![],
        1 => vec![a],
        _ => vec![a, i * 100],
    }
}

fn run_atomic_kernel(op: AtomicOp, device: DeviceKind, n: usize) -> (Vec<i32>, Vec<i64>) {
    let args = match op.arity() {
        0 => vec![],
        1 => vec![operand()],
        _ => vec![operand(), bin(BinOp::Mul, gid(), Expr::int(100))],
    };
    let schema = KernelSchema::new("AtomicProbe")
        .atomic_array("cells", AtomicWidth::Int)
        .array("results", ScalarType::Int)
        .method(run(vec![Stmt::expr(Expr::assign(
            Place::index("results", gid()),
            Expr::atomic(op, SlotRef::element("cells", gid()), args),
        ))]));
    let d = dispatcher(device);
    let mut kernel = Kernel::new(Arc::new(schema.build().unwrap()), &d);
    let results = Buffer::zeroed(ScalarType::Int, n);
    kernel.bind("results", results.clone()).unwrap();
    let cells = kernel.bind_slots("cells", n).unwrap();
    for i in 0..n {
        cells.set(i, initial(i));
    }
    kernel.execute(&Range::one_d(n)).unwrap();
    (results.to_vec::<i32>().unwrap(), cells.values())
}

#[test]
fn test_every_atomic_op_matches_slot_semantics_on_both_cpu_devices() {
    let n = 64;
    for op in AtomicOp::ALL {
        let mut want_results = Vec::with_capacity(n);
        let mut want_cells = Vec::with_capacity(n);
        for i in 0..n {
            let slot = AtomicSlot::new(AtomicWidth::Int, MemoryScope::Global, initial(i));
            want_results.push(slot.apply(op, &operands_for(op, i)) as i32);
            want_cells.push(slot.load());
        }

        let seq = run_atomic_kernel(op, DeviceKind::Sequential, n);
        let pool = run_atomic_kernel(op, DeviceKind::ThreadPool, n);
        assert_eq!(seq.0, want_results, "{} results on seq", op);
        assert_eq!(seq.1, want_cells, "{} slots on seq", op);
        assert_eq!(pool, seq, "{} differs between devices", op);
    }
}

#[test]
fn test_atomic_return_values() {
    // slot 0 starts at -50, operand 0 on work-item 0 is -50
    let (results, cells) = run_atomic_kernel(AtomicOp::Add, DeviceKind::Sequential, 2);
    assert_eq!(results, vec![-50, -47]);
    assert_eq!(cells, vec![-100, -43]);

    let (results, cells) = run_atomic_kernel(AtomicOp::Set, DeviceKind::Sequential, 2);
    assert_eq!(results, vec![-50, 4]);
    assert_eq!(cells, vec![-50, 4]);

    let (results, cells) = run_atomic_kernel(AtomicOp::CmpXchg, DeviceKind::Sequential, 2);
    assert_eq!(results, vec![-50, -47]);
    assert_eq!(cells, vec![0, -47]);
}

#[test]
fn test_contended_atomics_lose_no_updates() {
    let n = 10_000usize;
    let schema = KernelSchema::new("Contention")
        .atomic("total", AtomicWidth::Long)
        .atomic("peak", AtomicWidth::Int)
        .atomic("count", AtomicWidth::Int)
        .method(run(vec![
            Stmt::expr(Expr::atomic(
                AtomicOp::Add,
                SlotRef::scalar("total"),
                vec![Expr::cast(ScalarType::Long, gid())],
            )),
            Stmt::expr(Expr::atomic(AtomicOp::Max, SlotRef::scalar("peak"), vec![gid()])),
            Stmt::expr(Expr::atomic(AtomicOp::Inc, SlotRef::scalar("count"), vec![])),
        ]));
    let d = dispatcher(DeviceKind::ThreadPool);
    let kernel = Kernel::new(Arc::new(schema.build().unwrap()), &d);
    kernel.execute(&Range::one_d(n)).unwrap();
    let n = n as i64;
    assert_eq!(kernel.slots("total").unwrap().get(0), Some(n * (n - 1) / 2));
    assert_eq!(kernel.slots("peak").unwrap().get(0), Some(n - 1));
    assert_eq!(kernel.slots("count").unwrap().get(0), Some(n));
}

// ── evaluation order ──

#[test]
fn test_nested_pre_increment_in_index() {
    let schema = KernelSchema::new("Bump")
        .array("array", ScalarType::Int)
        .array("seen", ScalarType::Int)
        .method(run(vec![
            Stmt::let_("i", ScalarType::Int, Expr::int(0)),
            Stmt::expr(Expr::pre_inc(Place::index(
                "array",
                Expr::pre_inc(Place::local("i")),
            ))),
            Stmt::expr(Expr::assign(Place::index("seen", Expr::int(0)), Expr::local("i"))),
        ]));
    let descriptor = Arc::new(schema.build().unwrap());
    let source = compile_kernel(&descriptor).unwrap();
    assert!(source.text.contains("__kernel void run("));

    for device in [DeviceKind::Sequential, DeviceKind::ThreadPool] {
        let d = dispatcher(device);
        let mut kernel = Kernel::new(descriptor.clone(), &d);
        let array = Buffer::from(vec![0i32; 4]);
        let seen = Buffer::from(vec![0i32; 1]);
        kernel.bind("array", array.clone()).unwrap();
        kernel.bind("seen", seen.clone()).unwrap();
        kernel.execute(&Range::one_d(1)).unwrap();
        assert_eq!(array.to_vec::<i32>().unwrap(), vec![0, 1, 0, 0]);
        assert_eq!(seen.to_vec::<i32>().unwrap(), vec![1]);
    }
}

#[test]
fn test_operands_evaluate_left_to_right() {
    // x = data[i++] * 10 + data[i++]
    let schema = KernelSchema::new("Order")
        .array("data", ScalarType::Int)
        .array("out", ScalarType::Int)
        .method(run(vec![
            Stmt::let_("i", ScalarType::Int, Expr::int(0)),
            Stmt::let_(
                "x",
                ScalarType::Int,
                bin(
                    BinOp::Add,
                    bin(
                        BinOp::Mul,
                        Expr::index("data", Expr::post_inc(Place::local("i"))),
                        Expr::int(10),
                    ),
                    Expr::index("data", Expr::post_inc(Place::local("i"))),
                ),
            ),
            Stmt::expr(Expr::assign(Place::index("out", Expr::int(0)), Expr::local("x"))),
            Stmt::expr(Expr::assign(Place::index("out", Expr::int(1)), Expr::local("i"))),
        ]));
    let d = dispatcher(DeviceKind::Sequential);
    let mut kernel = Kernel::new(Arc::new(schema.build().unwrap()), &d);
    let out = Buffer::from(vec![0i32; 2]);
    kernel.bind("data", Buffer::from(vec![1i32, 2, 3])).unwrap();
    kernel.bind("out", out.clone()).unwrap();
    kernel.execute(&Range::one_d(1)).unwrap();
    assert_eq!(out.to_vec::<i32>().unwrap(), vec![12, 2]);
}

// ── helpers, scalars and ranges ──

#[test]
fn test_float_helper_with_parameters() {
    let schema = KernelSchema::new("Scale")
        .array("input", ScalarType::Float)
        .array("output", ScalarType::Float)
        .scalar("factor", ScalarType::Float)
        .method(run(vec![Stmt::expr(Expr::assign(
            Place::index("output", gid()),
            Expr::call(
                "scale",
                vec![Expr::index("input", gid()), Expr::field("factor")],
            ),
        ))]))
        .method(
            Method::new(
                "scale",
                vec![Stmt::Return(Some(bin(
                    BinOp::Mul,
                    Expr::local("x"),
                    Expr::local("k"),
                )))],
            )
            .with_param("x", ScalarType::Float)
            .with_param("k", ScalarType::Float)
            .returning(ScalarType::Float),
        );
    let d = dispatcher(DeviceKind::ThreadPool);
    let mut kernel = Kernel::new(Arc::new(schema.build().unwrap()), &d);
    let output = Buffer::zeroed(ScalarType::Float, 4);
    kernel
        .bind("input", Buffer::from(vec![1.0f32, 2.0, -4.0, 0.5]))
        .unwrap();
    kernel.bind("output", output.clone()).unwrap();
    kernel.bind_scalar("factor", Value::Float(2.5)).unwrap();
    kernel.execute(&Range::one_d(4)).unwrap();
    assert_eq!(output.to_vec::<f32>().unwrap(), vec![2.5, 5.0, -10.0, 1.25]);
}

#[test]
fn test_two_dimensional_range() {
    let schema = KernelSchema::new("Grid")
        .array("grid", ScalarType::Int)
        .method(run(vec![
            Stmt::let_("x", ScalarType::Int, Expr::global_id(0)),
            Stmt::let_("y", ScalarType::Int, Expr::global_id(1)),
            Stmt::let_(
                "w",
                ScalarType::Int,
                Expr::builtin(Builtin::GlobalSize, vec![Expr::int(0)]),
            ),
            Stmt::expr(Expr::assign(
                Place::index(
                    "grid",
                    bin(
                        BinOp::Add,
                        bin(BinOp::Mul, Expr::local("y"), Expr::local("w")),
                        Expr::local("x"),
                    ),
                ),
                bin(
                    BinOp::Add,
                    Expr::local("x"),
                    bin(BinOp::Mul, Expr::int(10), Expr::local("y")),
                ),
            )),
        ]));
    let d = dispatcher(DeviceKind::ThreadPool);
    let mut kernel = Kernel::new(Arc::new(schema.build().unwrap()), &d);
    let grid = Buffer::zeroed(ScalarType::Int, 12);
    kernel.bind("grid", grid.clone()).unwrap();
    kernel.execute(&Range::two_d(4, 3).with_local(&[2, 1])).unwrap();
    let want: Vec<i32> = (0..3).flat_map(|y| (0..4).map(move |x| x + 10 * y)).collect();
    assert_eq!(grid.to_vec::<i32>().unwrap(), want);
}

#[test]
fn test_pass_id_advances_per_execute() {
    let schema = KernelSchema::new("Passes")
        .array("out", ScalarType::Int)
        .method(run(vec![Stmt::expr(Expr::assign(
            Place::index("out", gid()),
            Expr::builtin(Builtin::PassId, vec![]),
        ))]));
    let d = dispatcher(DeviceKind::Sequential);
    let mut kernel = Kernel::new(Arc::new(schema.build().unwrap()), &d);
    let out = Buffer::zeroed(ScalarType::Int, 3);
    kernel.bind("out", out.clone()).unwrap();
    for _ in 0..3 {
        kernel.execute(&Range::one_d(3)).unwrap();
    }
    assert_eq!(out.to_vec::<i32>().unwrap(), vec![2, 2, 2]);
    assert_eq!(kernel.pass_id(), 3);

    let bad = Range::one_d(3).with_local(&[2]);
    assert!(matches!(kernel.execute(&bad), Err(KernelError::InvalidRange(_))));
    assert_eq!(kernel.pass_id(), 3);
}

// ── faults ──

fn faulting_kernel() -> KernelSchema {
    // the last work-item reads past the end of `data`
    KernelSchema::new("Faulty")
        .array("data", ScalarType::Int)
        .atomic("hits", AtomicWidth::Int)
        .method(run(vec![
            Stmt::expr(Expr::atomic(AtomicOp::Inc, SlotRef::scalar("hits"), vec![])),
            Stmt::expr(Expr::compound(
                Place::index("data", gid()),
                BinOp::Add,
                Expr::int(100),
            )),
            Stmt::let_(
                "next",
                ScalarType::Int,
                Expr::index("data", bin(BinOp::Add, gid(), Expr::int(1))),
            ),
        ]))
}

#[test]
fn test_fault_rolls_back_shared_state() {
    let descriptor = Arc::new(faulting_kernel().build().unwrap());
    for device in [DeviceKind::Sequential, DeviceKind::ThreadPool] {
        let d = dispatcher(device);
        let mut kernel = Kernel::new(descriptor.clone(), &d);
        let data = Buffer::from(vec![1i32, 2, 3, 4]);
        kernel.bind("data", data.clone()).unwrap();

        let err = kernel.execute(&Range::one_d(4)).unwrap_err();
        match &err {
            KernelError::Execution { device: got, reason } => {
                assert_eq!(*got, device);
                assert!(reason.contains("work-item (3, 0, 0)"), "{}", reason);
                assert!(reason.contains("out of bounds"), "{}", reason);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(data.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(kernel.slots("hits").unwrap().get(0), Some(0));
        assert_eq!(kernel.pass_id(), 0);

        kernel.execute(&Range::one_d(3)).unwrap();
        assert_eq!(data.to_vec::<i32>().unwrap(), vec![101, 102, 103, 4]);
        assert_eq!(kernel.slots("hits").unwrap().get(0), Some(3));
        assert_eq!(kernel.pass_id(), 1);
    }
}

#[test]
fn test_integer_division_by_zero_faults() {
    let schema = KernelSchema::new("Divide")
        .array("out", ScalarType::Int)
        .method(run(vec![Stmt::expr(Expr::assign(
            Place::index("out", gid()),
            bin(BinOp::Div, Expr::int(10), gid()),
        ))]));
    let d = dispatcher(DeviceKind::Sequential);
    let mut kernel = Kernel::new(Arc::new(schema.build().unwrap()), &d);
    let out = Buffer::from(vec![7i32; 2]);
    kernel.bind("out", out.clone()).unwrap();
    let err = kernel.execute(&Range::one_d(2)).unwrap_err();
    assert!(err.to_string().contains("division by zero"), "{}", err);
    assert_eq!(out.to_vec::<i32>().unwrap(), vec![7, 7]);
}
