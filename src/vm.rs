//! The execution engine: the runtime, the trampoline, and the error
//! taxonomy.
//!
//! There is no native call stack behind script execution. A source-level
//! call constructs a new continuation and returns it from `run_step`; the
//! [trampoline](run) swaps it in and keeps going. Tail calls therefore cost
//! no native depth, and coroutines suspend by unwinding a single `run_step`
//! frame.

use std::cell::{Cell as StdCell, RefCell};
use std::fmt::{self, Debug, Display};
use std::rc::Rc;

use ahash::AHashMap;
use tracing::trace;

use crate::code::Unit;
use crate::runtime::cell::Cell;
use crate::runtime::closure::Closure;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;
use crate::vm::continuation::{Continuation, DebugInfo};
use crate::vm::quota::QuotaBreach;
use crate::vm::thread::Thread;

pub mod continuation;
pub mod quota;
pub mod thread;

/// A catchable execution error: a message value plus the traceback
/// accumulated as it propagated through the continuation chain.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    message: Value,
    traceback: Vec<DebugInfo>,
}

impl RuntimeError {
    #[must_use]
    pub fn new(message: Value) -> Self {
        Self {
            message,
            traceback: Vec::new(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &Value {
        &self.message
    }

    #[must_use]
    pub fn traceback(&self) -> &[DebugInfo] {
        &self.traceback
    }

    pub(crate) fn push_frame(&mut self, frame: DebugInfo) {
        self.traceback.push(frame);
    }
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.traceback {
            write!(f, "\n\t{frame}")?;
        }
        Ok(())
    }
}

/// The values a suspending thread hands back, plus where to pick up again.
#[derive(Debug)]
pub struct YieldSignal {
    pub values: Vec<Value>,
    pub resume_at: Continuation,
}

/// The internal result channel of the dispatch loop.
///
/// `Error` is the ordinary, catchable kind. `Kill` is the unrecoverable
/// termination signal from the quota manager: it short-circuits every
/// `run_step` frame, and only a quota-context boundary may convert it back
/// into a value. `Yield` is a control signal recognized by the thread
/// resume loop, not an error at all.
#[derive(Debug)]
pub enum Fault {
    Error(RuntimeError),
    Kill(QuotaBreach),
    Yield(Box<YieldSignal>),
}

impl Fault {
    /// A catchable error with a string message.
    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::Error(RuntimeError::new(Value::String(Symbol::from(
            message.into(),
        ))))
    }
}

impl From<QuotaBreach> for Fault {
    fn from(breach: QuotaBreach) -> Self {
        Self::Kill(breach)
    }
}

/// An error surfaced at the public API boundary.
#[derive(Debug)]
pub enum ExecutionError {
    /// An uncaught catchable error, with its traceback.
    Runtime(RuntimeError),
    /// A resource limit was breached and nothing converted the termination
    /// signal before the top level.
    QuotaExceeded(QuotaBreach),
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime(error) => Display::fmt(error, f),
            Self::QuotaExceeded(breach) => Display::fmt(breach, f),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<Fault> for ExecutionError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Error(error) => Self::Runtime(error),
            Fault::Kill(breach) => Self::QuotaExceeded(breach),
            Fault::Yield(_) => Self::Runtime(RuntimeError::new(Value::String(Symbol::from(
                "attempt to yield from outside a coroutine",
            )))),
        }
    }
}

const POOL_BUCKET_CAPACITY: usize = 16;

#[derive(Default)]
struct Pools {
    values: AHashMap<usize, Vec<Vec<Value>>>,
    cells: AHashMap<usize, Vec<Vec<Cell>>>,
}

struct RuntimeState {
    pools: RefCell<Pools>,
    /// Live nested-trampoline count and its high-water mark. Nesting only
    /// grows for metamethod calls and coroutine resumes, never for script
    /// calls or tail calls.
    depth: StdCell<usize>,
    max_depth: StdCell<usize>,
}

/// An isolated execution environment.
///
/// Runtimes own the register and cell array pools, so independent runtimes
/// never share state. Threads created from one runtime must not be resumed
/// from another.
#[derive(Clone)]
pub struct Runtime {
    state: Rc<RuntimeState>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RuntimeState {
                pools: RefCell::new(Pools::default()),
                depth: StdCell::new(0),
                max_depth: StdCell::new(0),
            }),
        }
    }

    /// Creates the root thread for this runtime.
    #[must_use]
    pub fn root_thread(&self) -> Thread {
        Thread::root(self)
    }

    /// Loads `unit` and executes its main chunk with `args`, driving the
    /// trampoline to completion.
    ///
    /// A main chunk declaring upvalues is rejected as an error rather than a
    /// structural panic: units can arrive from unmarshaled external bytes.
    pub fn execute(&self, unit: &Unit, args: Vec<Value>) -> Result<Vec<Value>, ExecutionError> {
        if unit.main.upvalue_count != 0 {
            return Err(ExecutionError::Runtime(RuntimeError::new(Value::String(
                Symbol::from("a unit's main chunk cannot declare upvalues"),
            ))));
        }
        let thread = self.root_thread();
        let main = Value::Closure(Closure::new(unit.main.clone()));
        call_value(&thread, &main, args).map_err(ExecutionError::from)
    }

    /// The high-water mark of nested trampolines, a probe used to verify
    /// that deep and tail-recursive call chains stay flat.
    #[must_use]
    pub fn max_trampoline_depth(&self) -> usize {
        self.state.max_depth.get()
    }

    /// Takes a nil-filled value array of exactly `len` slots.
    pub(crate) fn acquire_values(&self, len: usize) -> Vec<Value> {
        let mut pools = self.state.pools.borrow_mut();
        match pools.values.get_mut(&len).and_then(Vec::pop) {
            Some(array) => array,
            None => vec![Value::Nil; len],
        }
    }

    /// Takes a cell array of exactly `len` fresh empty cells.
    pub(crate) fn acquire_cells(&self, len: usize) -> Vec<Cell> {
        let mut pools = self.state.pools.borrow_mut();
        match pools.cells.get_mut(&len).and_then(Vec::pop) {
            Some(array) => array,
            None => (0..len).map(|_| Cell::empty()).collect(),
        }
    }

    /// Returns a value array to the pool.
    ///
    /// The array is fully overwritten before reuse: a pooled array leaking a
    /// previous activation's values into a new one would cross isolation
    /// boundaries and keep dead values alive.
    pub(crate) fn release_values(&self, mut array: Vec<Value>) {
        let mut pools = self.state.pools.borrow_mut();
        let bucket = pools.values.entry(array.len()).or_default();
        if bucket.len() < POOL_BUCKET_CAPACITY {
            array.fill(Value::Nil);
            bucket.push(array);
        }
    }

    /// Returns a cell array to the pool, replacing every slot with a fresh
    /// empty cell. The old cells may still be captured by live closures.
    pub(crate) fn release_cells(&self, mut array: Vec<Cell>) {
        let mut pools = self.state.pools.borrow_mut();
        let bucket = pools.cells.entry(array.len()).or_default();
        if bucket.len() < POOL_BUCKET_CAPACITY {
            for cell in &mut array {
                *cell = Cell::empty();
            }
            bucket.push(array);
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    fn enter_trampoline(&self) -> TrampolineGuard<'_> {
        let depth = self.state.depth.get() + 1;
        self.state.depth.set(depth);
        self.state
            .max_depth
            .set(self.state.max_depth.get().max(depth));
        TrampolineGuard { runtime: self }
    }
}

impl Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("trampoline_depth", &self.state.depth.get())
            .finish_non_exhaustive()
    }
}

struct TrampolineGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for TrampolineGuard<'_> {
    fn drop(&mut self) {
        let state = &self.runtime.state;
        state.depth.set(state.depth.get() - 1);
    }
}

/// The trampoline: repeatedly runs one step of the current continuation and
/// replaces it with the step's result. This loop is the entire call
/// mechanism.
pub(crate) fn run(thread: &Thread, start: Continuation) -> Result<(), Fault> {
    let _guard = thread.runtime().enter_trampoline();
    let mut current = Some(start);
    while let Some(continuation) = current {
        match continuation.run_step(thread) {
            Ok(next) => current = next,
            Err(Fault::Error(mut error)) => {
                // The failing frame first, then the chain behind it.
                if let Some(frame) = continuation.debug_info() {
                    error.push_frame(frame);
                }
                let mut cursor = continuation.next();
                while let Some(frame) = cursor {
                    if let Some(info) = frame.debug_info() {
                        error.push_frame(info);
                    }
                    cursor = frame.next();
                }
                return Err(Fault::Error(error));
            }
            Err(other) => return Err(other),
        }
    }
    Ok(())
}

/// Calls `callee` with `args` and collects every result.
///
/// This is the engine's re-entry point, used for metamethod fallbacks and
/// by host functions; script-level calls never come through here.
pub fn call_value(thread: &Thread, callee: &Value, args: Vec<Value>) -> Result<Vec<Value>, Fault> {
    let results = Continuation::termination_all();
    let callee = Continuation::for_call(thread, callee, results.clone())?;
    callee.push_seq(args)?;
    trace!(target: "coil::vm", "entering nested trampoline");
    run(thread, callee)?;
    Ok(results
        .termination_results()
        .expect("termination sink survives the call"))
}

/// Formats an uncaught error the way the top-level driver reports it.
#[must_use]
pub fn report(error: &ExecutionError) -> String {
    match error {
        ExecutionError::Runtime(error) => format!("error: {error}"),
        ExecutionError::QuotaExceeded(breach) => format!("resource limit exceeded: {breach}"),
    }
}
