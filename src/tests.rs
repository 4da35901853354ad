use std::sync::Arc;

use crate::code::{Chunk, Constant, Unit};
use crate::instruction::{BinOp, Instr, LoadKind, Reg, UnaryOp};
use crate::runtime::closure::Closure;
use crate::runtime::value::{Table, Value};
use crate::vm::continuation::NativeFn;
use crate::vm::quota::{QuotaDef, QuotaStatus, Resource};
use crate::vm::thread::{yield_fn, Thread, ThreadStatus};
use crate::vm::{call_value, ExecutionError, Runtime};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn ints(values: &[Value]) -> Vec<i64> {
    values
        .iter()
        .map(|value| value.as_i64().expect("expected an integer result"))
        .collect()
}

/// `fn(a, b) { return a + b }`
fn add_unit() -> Unit {
    let mut main = Chunk::builder("add.coil", "main").registers(3);
    main.instr(Instr::Unary {
        op: UnaryOp::Recv,
        a: Reg::value(0),
        b: Reg::value(0),
    });
    main.instr(Instr::Unary {
        op: UnaryOp::Recv,
        a: Reg::value(1),
        b: Reg::value(1),
    });
    main.instr(Instr::Binary {
        op: BinOp::Add,
        dest: Reg::value(2),
        lhs: Reg::value(0),
        rhs: Reg::value(1),
    });
    main.instr(Instr::Unary {
        op: UnaryOp::Cc,
        a: Reg::value(0),
        b: Reg::value(0),
    });
    main.instr(Instr::Unary {
        op: UnaryOp::Push,
        a: Reg::value(0),
        b: Reg::value(2),
    });
    main.instr(Instr::Call {
        target: Reg::value(0),
        tail: true,
    });
    Unit::new(main.build())
}

#[test]
fn add_two_arguments() {
    let runtime = Runtime::new();
    let results = runtime
        .execute(&add_unit(), vec![Value::Int(3), Value::Int(4)])
        .unwrap();
    assert_eq!(ints(&results), [7]);
}

#[test]
fn missing_arguments_read_as_nil() {
    let runtime = Runtime::new();
    let error = runtime.execute(&add_unit(), vec![Value::Int(3)]).unwrap_err();
    let ExecutionError::Runtime(error) = error else {
        panic!("expected a runtime error, got {error}");
    };
    assert!(error.message().to_string().contains("arithmetic"));
    // The traceback names the failing chunk.
    assert!(error.traceback().iter().any(|frame| {
        frame.source == crate::runtime::symbol::Symbol::from("add.coil")
    }));
}

#[test]
fn marshaled_units_execute_identically() {
    let unit = add_unit();
    let reloaded = Unit::unmarshal(&unit.marshal()).unwrap();
    let runtime = Runtime::new();
    let args = vec![Value::Int(20), Value::Int(22)];
    let direct = runtime.execute(&unit, args.clone()).unwrap();
    let reloaded = runtime.execute(&reloaded, args).unwrap();
    assert_eq!(ints(&direct), ints(&reloaded));
    assert_eq!(ints(&direct), [42]);
}

#[test]
fn a_main_chunk_declaring_upvalues_is_rejected() {
    // Such a unit cannot come from the compiler, but it can come from
    // unmarshaled bytes, so it must fail as an error rather than a panic.
    let mut main = Chunk::builder("bad.coil", "main")
        .registers(1)
        .cells(1)
        .upvalues(["x"]);
    main.instr(Instr::Jump { offset: 0 });
    let unit = Unit::unmarshal(&Unit::new(main.build()).marshal()).unwrap();
    let runtime = Runtime::new();
    let error = runtime.execute(&unit, Vec::new()).unwrap_err();
    let ExecutionError::Runtime(error) = error else {
        panic!("expected a runtime error, got {error}");
    };
    assert!(error.message().to_string().contains("upvalues"));
}

/// Builds a counter: a cell shared by an incrementer and a reader closure.
///
/// ```text
/// var n = 0
/// fn incr() { n = n + 1; return n }
/// fn get() { return n }
/// return incr(), incr(), get()
/// ```
fn counter_unit() -> Unit {
    let mut incr = Chunk::builder("counter.coil", "incr")
        .registers(2)
        .cells(1)
        .upvalues(["n"]);
    incr.instr(Instr::LoadSmall {
        kind: LoadKind::Int,
        dest: Reg::value(0),
        literal: 1,
        push: false,
    });
    incr.instr(Instr::Binary {
        op: BinOp::Add,
        dest: Reg::cell(0),
        lhs: Reg::cell(0),
        rhs: Reg::value(0),
    });
    incr.instr(Instr::Unary {
        op: UnaryOp::Cc,
        a: Reg::value(1),
        b: Reg::value(1),
    });
    incr.instr(Instr::Unary {
        op: UnaryOp::Push,
        a: Reg::value(1),
        b: Reg::cell(0),
    });
    incr.instr(Instr::Call {
        target: Reg::value(1),
        tail: true,
    });
    let incr = incr.build();

    let mut get = Chunk::builder("counter.coil", "get")
        .registers(1)
        .cells(1)
        .upvalues(["n"]);
    get.instr(Instr::Unary {
        op: UnaryOp::Cc,
        a: Reg::value(0),
        b: Reg::value(0),
    });
    get.instr(Instr::Unary {
        op: UnaryOp::Push,
        a: Reg::value(0),
        b: Reg::cell(0),
    });
    get.instr(Instr::Call {
        target: Reg::value(0),
        tail: true,
    });
    let get = get.build();

    let mut main = Chunk::builder("counter.coil", "main").registers(4).cells(1);
    let k_incr = main.constant(Constant::Code(incr));
    let k_get = main.constant(Constant::Code(get));
    main.instr(Instr::LoadSmall {
        kind: LoadKind::Int,
        dest: Reg::cell(0),
        literal: 0,
        push: false,
    });
    for (register, constant) in [(0, k_incr), (1, k_get)] {
        main.instr(Instr::LoadConst {
            dest: Reg::value(register),
            index: constant,
            push: false,
        });
        main.instr(Instr::Unary {
            op: UnaryOp::Closure,
            a: Reg::value(register),
            b: Reg::value(register),
        });
        main.instr(Instr::Unary {
            op: UnaryOp::Upval,
            a: Reg::value(register),
            b: Reg::cell(0),
        });
    }
    for callee in [0, 0, 1] {
        main.instr(Instr::Unary {
            op: UnaryOp::Cont,
            a: Reg::value(2),
            b: Reg::value(callee),
        });
        main.instr(Instr::Call {
            target: Reg::value(2),
            tail: false,
        });
    }
    main.instr(Instr::Unary {
        op: UnaryOp::Cc,
        a: Reg::value(3),
        b: Reg::value(3),
    });
    for _ in 0..3 {
        main.instr(Instr::Unary {
            op: UnaryOp::Recv,
            a: Reg::value(2),
            b: Reg::value(2),
        });
        main.instr(Instr::Unary {
            op: UnaryOp::Push,
            a: Reg::value(3),
            b: Reg::value(2),
        });
    }
    main.instr(Instr::Call {
        target: Reg::value(3),
        tail: true,
    });
    Unit::new(main.build())
}

#[test]
fn closures_share_a_captured_cell() {
    let runtime = Runtime::new();
    let results = runtime.execute(&counter_unit(), Vec::new()).unwrap();
    // Both increments are visible through the reader closure.
    assert_eq!(ints(&results), [1, 2, 2]);
}

/// `fn f(n) { if n == 0 { return 0 }; return f(n - 1) }`, where the
/// recursive reference is an upvalue cell holding `f` itself.
fn countdown_unit(n: i64) -> Unit {
    let mut f = Chunk::builder("countdown.coil", "f")
        .registers(4)
        .cells(1)
        .upvalues(["f"]);
    f.instr(Instr::Unary {
        op: UnaryOp::Recv,
        a: Reg::value(0),
        b: Reg::value(0),
    });
    f.instr(Instr::LoadSmall {
        kind: LoadKind::Int,
        dest: Reg::value(1),
        literal: 0,
        push: false,
    });
    f.instr(Instr::Binary {
        op: BinOp::Eq,
        dest: Reg::value(2),
        lhs: Reg::value(0),
        rhs: Reg::value(1),
    });
    f.instr(Instr::JumpIf {
        test: Reg::value(2),
        offset: 6,
        negate: false,
    });
    f.instr(Instr::LoadSmall {
        kind: LoadKind::Int,
        dest: Reg::value(1),
        literal: 1,
        push: false,
    });
    f.instr(Instr::Binary {
        op: BinOp::Sub,
        dest: Reg::value(0),
        lhs: Reg::value(0),
        rhs: Reg::value(1),
    });
    f.instr(Instr::Unary {
        op: UnaryOp::TailCont,
        a: Reg::value(3),
        b: Reg::cell(0),
    });
    f.instr(Instr::Unary {
        op: UnaryOp::Push,
        a: Reg::value(3),
        b: Reg::value(0),
    });
    f.instr(Instr::Call {
        target: Reg::value(3),
        tail: true,
    });
    f.instr(Instr::Unary {
        op: UnaryOp::Cc,
        a: Reg::value(3),
        b: Reg::value(3),
    });
    f.instr(Instr::LoadSmall {
        kind: LoadKind::Int,
        dest: Reg::value(3),
        literal: 0,
        push: true,
    });
    f.instr(Instr::Call {
        target: Reg::value(3),
        tail: true,
    });
    let f = f.build();

    let mut main = Chunk::builder("countdown.coil", "main").registers(3).cells(1);
    let k_f = main.constant(Constant::Code(f));
    let k_n = main.constant(Constant::Int(n));
    main.instr(Instr::LoadConst {
        dest: Reg::value(0),
        index: k_f,
        push: false,
    });
    // The closure lands directly in the cell it captures, closing the
    // recursive knot.
    main.instr(Instr::Unary {
        op: UnaryOp::Closure,
        a: Reg::cell(0),
        b: Reg::value(0),
    });
    main.instr(Instr::Unary {
        op: UnaryOp::Upval,
        a: Reg::cell(0),
        b: Reg::cell(0),
    });
    main.instr(Instr::Unary {
        op: UnaryOp::Cont,
        a: Reg::value(1),
        b: Reg::cell(0),
    });
    main.instr(Instr::LoadConst {
        dest: Reg::value(1),
        index: k_n,
        push: true,
    });
    main.instr(Instr::Call {
        target: Reg::value(1),
        tail: false,
    });
    main.instr(Instr::Unary {
        op: UnaryOp::Cc,
        a: Reg::value(2),
        b: Reg::value(2),
    });
    main.instr(Instr::Unary {
        op: UnaryOp::Recv,
        a: Reg::value(0),
        b: Reg::value(0),
    });
    main.instr(Instr::Unary {
        op: UnaryOp::Push,
        a: Reg::value(2),
        b: Reg::value(0),
    });
    main.instr(Instr::Call {
        target: Reg::value(2),
        tail: true,
    });
    Unit::new(main.build())
}

#[test]
fn deep_tail_recursion_stays_flat() {
    const ITERATIONS: i64 = 1_000_000;

    let runtime = Runtime::new();
    // No tracing here: a trace event per instruction at this depth swamps
    // the test output.
    let results = runtime.execute(&countdown_unit(ITERATIONS), Vec::new()).unwrap();
    assert_eq!(ints(&results), [0]);
    // Every recursive call reused the single trampoline; nothing nested.
    assert_eq!(runtime.max_trampoline_depth(), 1);
}

#[test]
fn cpu_hard_limit_kills_a_tight_loop() {
    const LIMIT: u64 = 1_000;

    let mut spin = Chunk::builder("spin.coil", "main").registers(1);
    spin.instr(Instr::Jump { offset: 0 });
    let main = Value::Closure(Closure::new(spin.build()));

    let runtime = Runtime::new();
    let thread = runtime.root_thread();
    let outcome = thread
        .with_quota(
            &QuotaDef {
                cpu_hard: Some(LIMIT),
                ..QuotaDef::default()
            },
            |thread| call_value(thread, &main, Vec::new()),
        )
        .unwrap();
    assert_eq!(outcome.status, QuotaStatus::Killed);
    let breach = outcome.result.unwrap_err();
    assert_eq!(breach.resource, Resource::Cpu);
    assert_eq!(breach.used, LIMIT);
    assert_eq!(outcome.cpu_used, LIMIT);
}

#[test]
fn memory_hard_limit_kills_an_allocating_loop() {
    // Allocate an empty table every iteration, forever.
    let mut churn = Chunk::builder("churn.coil", "main").registers(1);
    churn.instr(Instr::LoadSmall {
        kind: LoadKind::EmptyTable,
        dest: Reg::value(0),
        literal: 0,
        push: false,
    });
    churn.instr(Instr::Jump { offset: -1 });
    let main = Value::Closure(Closure::new(churn.build()));

    let runtime = Runtime::new();
    let thread = runtime.root_thread();
    let outcome = thread
        .with_quota(
            &QuotaDef {
                mem_hard: Some(64 * 100),
                ..QuotaDef::default()
            },
            |thread| call_value(thread, &main, Vec::new()),
        )
        .unwrap();
    assert_eq!(outcome.status, QuotaStatus::Killed);
    assert_eq!(outcome.result.unwrap_err().resource, Resource::Memory);
}

#[test]
fn metamethods_resolve_binary_operators() {
    let runtime = Runtime::new();
    let thread = runtime.root_thread();

    let meta = Table::new();
    assert!(meta.set(
        Value::String("__add".into()),
        Value::Native(NativeFn::new("add_handler", 2, false, |_thread, args| {
            args.next.push(Value::Int(99))?;
            Ok(Some(args.next.clone()))
        })),
    ));
    let lhs = Table::new();
    lhs.set_meta(Some(meta));

    let main = Value::Closure(Closure::new(add_unit().main));
    let results = call_value(
        &thread,
        &main,
        vec![Value::Table(lhs), Value::Table(Table::new())],
    )
    .unwrap();
    assert_eq!(ints(&results), [99]);
}

#[test]
fn invalid_words_raise_catchable_errors() {
    let mut main = Chunk::builder("bad.coil", "main").registers(1);
    main.instr(Instr::Invalid(0xF000_0000));
    let runtime = Runtime::new();
    let error = runtime
        .execute(&Unit::new(main.build()), Vec::new())
        .unwrap_err();
    let ExecutionError::Runtime(error) = error else {
        panic!("expected a runtime error, got {error}");
    };
    assert!(error.message().to_string().contains("invalid instruction"));
}

/// A coroutine body: yields its argument, then returns the resumer's reply
/// plus the original argument.
fn echo_body() -> Arc<Chunk> {
    let mut body = Chunk::builder("echo.coil", "body").registers(4);
    body.instr(Instr::Unary {
        op: UnaryOp::Recv,
        a: Reg::value(0),
        b: Reg::value(0),
    });
    body.instr(Instr::Unary {
        op: UnaryOp::Recv,
        a: Reg::value(1),
        b: Reg::value(1),
    });
    body.instr(Instr::Unary {
        op: UnaryOp::Cont,
        a: Reg::value(2),
        b: Reg::value(0),
    });
    body.instr(Instr::Unary {
        op: UnaryOp::Push,
        a: Reg::value(2),
        b: Reg::value(1),
    });
    body.instr(Instr::Call {
        target: Reg::value(2),
        tail: false,
    });
    body.instr(Instr::Unary {
        op: UnaryOp::Recv,
        a: Reg::value(3),
        b: Reg::value(3),
    });
    body.instr(Instr::Binary {
        op: BinOp::Add,
        dest: Reg::value(0),
        lhs: Reg::value(3),
        rhs: Reg::value(1),
    });
    body.instr(Instr::Unary {
        op: UnaryOp::Cc,
        a: Reg::value(2),
        b: Reg::value(2),
    });
    body.instr(Instr::Unary {
        op: UnaryOp::Push,
        a: Reg::value(2),
        b: Reg::value(0),
    });
    body.instr(Instr::Call {
        target: Reg::value(2),
        tail: true,
    });
    body.build()
}

#[test]
fn coroutines_yield_and_resume_through_bytecode() {
    init_tracing();
    let runtime = Runtime::new();
    let root = runtime.root_thread();
    let body = Value::Closure(Closure::new(echo_body()));
    let thread = Thread::spawn(&runtime, body);

    // First resume passes the yield primitive and the value to echo.
    let yielded = thread
        .resume(&root, vec![Value::Native(yield_fn()), Value::Int(10)])
        .unwrap();
    assert_eq!(thread.status(), ThreadStatus::Suspended);
    assert_eq!(ints(&yielded), [10]);

    // Registers survive suspension: the reply is added to the original.
    let finished = thread.resume(&root, vec![Value::Int(5)]).unwrap();
    assert_eq!(thread.status(), ThreadStatus::Dead);
    assert_eq!(ints(&finished), [15]);
}

#[test]
fn errors_inside_a_coroutine_kill_it() {
    let runtime = Runtime::new();
    let root = runtime.root_thread();
    let mut bad = Chunk::builder("bad.coil", "body").registers(1);
    bad.instr(Instr::Invalid(0xF000_0000));
    let thread = Thread::spawn(&runtime, Value::Closure(Closure::new(bad.build())));

    assert!(thread.resume(&root, Vec::new()).is_err());
    assert_eq!(thread.status(), ThreadStatus::Dead);
    assert!(thread.resume(&root, Vec::new()).is_err());
}

#[test]
fn extra_results_to_a_bounded_receiver_are_dropped() {
    // main returns three values to a caller expecting two.
    let mut inner = Chunk::builder("multi.coil", "inner").registers(2);
    inner.instr(Instr::Unary {
        op: UnaryOp::Cc,
        a: Reg::value(0),
        b: Reg::value(0),
    });
    for literal in [1, 2, 3] {
        inner.instr(Instr::LoadSmall {
            kind: LoadKind::Int,
            dest: Reg::value(0),
            literal,
            push: true,
        });
    }
    inner.instr(Instr::Call {
        target: Reg::value(0),
        tail: true,
    });

    let runtime = Runtime::new();
    let thread = runtime.root_thread();
    let callee = Value::Closure(Closure::new(inner.build()));
    let sink = crate::vm::continuation::Continuation::termination(2, false);
    let call = crate::vm::continuation::Continuation::for_call(&thread, &callee, sink.clone())
        .unwrap();
    crate::vm::run(&thread, call).unwrap();
    assert_eq!(ints(&sink.termination_results().unwrap()), [1, 2]);
}
