//! The three continuation kinds and the bytecode dispatch loop.
//!
//! A continuation is the unit of suspended execution: analogous to a stack
//! frame, but first-class and chained through a forward `next` reference
//! instead of implicitly nested. The kinds are a closed set, exhaustively
//! matched everywhere, so adding one is a compile-time event.

use std::cell::RefCell;
use std::fmt::{self, Debug, Display};
use std::rc::Rc;

use tracing::trace;

use crate::code::{Chunk, Constant};
use crate::instruction::{BinOp, Instr, LoadKind, Reg, RegKind, UnaryOp};
use crate::runtime::cell::RegisterFile;
use crate::runtime::closure::Closure;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{raw_binary, RawBinary, Value};
use crate::vm::quota::{CLOSURE_BYTES, CONTINUATION_BYTES, TABLE_BYTES, VALUE_BYTES};
use crate::vm::thread::Thread;
use crate::vm::{call_value, Fault};

/// How deep an `__index`/`__newindex` delegation chain may go before the
/// engine assumes a cycle.
const MAX_META_CHAIN: usize = 100;

/// The location answer for one continuation, used to build tracebacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub source: Symbol,
    pub name: Symbol,
    pub line: Option<u32>,
}

impl Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}: in {}", self.source, self.name),
            None => write!(f, "{}: in {}", self.source, self.name),
        }
    }
}

/// An activation of a closure mid-execution.
pub(crate) struct BytecodeActivation {
    closure: Closure,
    registers: RegisterFile,
    pc: usize,
    /// Values pushed at this continuation, drained by `Recv`/`RecvEtc`.
    incoming: Vec<Value>,
    cursor: usize,
    /// The variadic overflow captured by `RecvEtc`.
    etc: Vec<Value>,
    next: Continuation,
}

/// A pending invocation of a host function.
pub(crate) struct NativeCall {
    func: NativeFn,
    args: Vec<Value>,
    etc: Vec<Value>,
    next: Continuation,
}

/// The sink at the end of every chain: accumulates results and has no
/// further step.
pub(crate) struct Termination {
    capacity: usize,
    variadic: bool,
    results: Vec<Value>,
    etc: Vec<Value>,
}

pub(crate) enum ContinuationKind {
    Bytecode(BytecodeActivation),
    Native(NativeCall),
    Termination(Termination),
}

impl ContinuationKind {
    /// Appends one argument/result. Fixed slots fill left to right; extras
    /// spill into the overflow sequence when the receiver is variadic and
    /// are silently dropped otherwise, mirroring the language's
    /// multiple-return truncation semantics.
    fn push(&mut self, value: Value) {
        match self {
            Self::Bytecode(activation) => activation.incoming.push(value),
            Self::Native(call) => {
                if call.args.len() < usize::from(call.func.arity()) {
                    call.args.push(value);
                } else if call.func.variadic() {
                    call.etc.push(value);
                }
            }
            Self::Termination(termination) => {
                if termination.results.len() < termination.capacity {
                    termination.results.push(value);
                } else if termination.variadic {
                    termination.etc.push(value);
                }
            }
        }
    }

    /// The batch form of [`push`](Self::push): same semantics, one overflow
    /// growth.
    fn push_seq(&mut self, values: Vec<Value>) {
        match self {
            Self::Bytecode(activation) => activation.incoming.extend(values),
            Self::Native(call) => {
                let room = usize::from(call.func.arity()).saturating_sub(call.args.len());
                let mut values = values.into_iter();
                call.args.extend(values.by_ref().take(room));
                if call.func.variadic() {
                    call.etc.extend(values);
                }
            }
            Self::Termination(termination) => {
                let room = termination.capacity.saturating_sub(termination.results.len());
                let mut values = values.into_iter();
                termination.results.extend(values.by_ref().take(room));
                if termination.variadic {
                    termination.etc.extend(values);
                }
            }
        }
    }
}

/// A shared handle to a continuation.
///
/// Continuations are first-class: they sit in registers, get pushed as
/// arguments, and transfer control by being returned from
/// [`run_step`](Self::run_step).
#[derive(Clone)]
pub struct Continuation(Rc<RefCell<ContinuationKind>>);

impl Continuation {
    fn new(kind: ContinuationKind) -> Self {
        Self(Rc::new(RefCell::new(kind)))
    }

    /// A termination sink with `capacity` fixed result slots.
    #[must_use]
    pub fn termination(capacity: usize, variadic: bool) -> Self {
        Self::new(ContinuationKind::Termination(Termination {
            capacity,
            variadic,
            results: Vec::with_capacity(capacity),
            etc: Vec::new(),
        }))
    }

    /// A termination sink that keeps every pushed value.
    #[must_use]
    pub fn termination_all() -> Self {
        Self::termination(0, true)
    }

    /// Builds the continuation for calling `callee`, delivering its results
    /// to `next`.
    ///
    /// # Panics
    ///
    /// Panics when `callee` is a closure whose upvalue list is not fully
    /// populated; that is a bytecode invariant violation.
    pub fn for_call(thread: &Thread, callee: &Value, next: Continuation) -> Result<Self, Fault> {
        match callee {
            Value::Closure(closure) => {
                assert!(
                    closure.is_complete(),
                    "closure {} called before its upvalues were populated",
                    closure.name()
                );
                let chunk = closure.chunk().clone();
                let register_count = usize::from(chunk.register_count);
                let cell_count = usize::from(chunk.cell_count);
                thread.charge_mem(
                    CONTINUATION_BYTES + (register_count + cell_count) as u64 * VALUE_BYTES,
                )?;
                let runtime = thread.runtime();
                let values = runtime.acquire_values(register_count);
                let upvalues = closure.upvalues();
                let cells = if upvalues.len() == cell_count {
                    // No locally created cells; the captured set is the
                    // whole cell array.
                    upvalues
                } else {
                    let mut cells = runtime.acquire_cells(cell_count);
                    cells[..upvalues.len()].clone_from_slice(&upvalues);
                    cells
                };
                Ok(Self::new(ContinuationKind::Bytecode(BytecodeActivation {
                    closure: closure.clone(),
                    registers: RegisterFile::new(values, cells),
                    pc: 0,
                    incoming: Vec::new(),
                    cursor: 0,
                    etc: Vec::new(),
                    next,
                })))
            }
            Value::Native(func) => {
                thread.charge_mem(CONTINUATION_BYTES)?;
                Ok(Self::new(ContinuationKind::Native(NativeCall {
                    func: func.clone(),
                    args: Vec::with_capacity(usize::from(func.arity())),
                    etc: Vec::new(),
                    next,
                })))
            }
            other => Err(Fault::error(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
    }

    /// Appends one argument/result.
    ///
    /// Fails only when this continuation is mid-execution, which means the
    /// bytecode routed a value at itself.
    pub fn push(&self, value: Value) -> Result<(), Fault> {
        self.0
            .try_borrow_mut()
            .map_err(|_| Fault::error("attempt to push onto a running continuation"))?
            .push(value);
        Ok(())
    }

    /// Appends a batch of values in order.
    pub fn push_seq(&self, values: Vec<Value>) -> Result<(), Fault> {
        self.0
            .try_borrow_mut()
            .map_err(|_| Fault::error("attempt to push onto a running continuation"))?
            .push_seq(values);
        Ok(())
    }

    /// Executes one turn: runs until this continuation hands off to another
    /// (`Ok(Some(_))`), terminates (`Ok(None)`), or fails.
    pub fn run_step(&self, thread: &Thread) -> Result<Option<Continuation>, Fault> {
        let mut state = self
            .0
            .try_borrow_mut()
            .map_err(|_| Fault::error("attempt to run a continuation that is already running"))?;
        match &mut *state {
            ContinuationKind::Bytecode(activation) => run_bytecode(self, activation, thread),
            ContinuationKind::Native(call) => {
                thread.charge_cpu(1)?;
                let func = call.func.clone();
                trace!(target: "coil::vm", name = %func.name(), "native call");
                func.invoke(
                    thread,
                    NativeArgs {
                        args: &call.args,
                        etc: &call.etc,
                        next: &call.next,
                    },
                )
            }
            // A termination is a fixed point of the trampoline.
            ContinuationKind::Termination(_) => Ok(None),
        }
    }

    /// The continuation that receives this one's results. Used for
    /// tracebacks, never for control transfer.
    #[must_use]
    pub fn next(&self) -> Option<Continuation> {
        let state = self.0.try_borrow().ok()?;
        match &*state {
            ContinuationKind::Bytecode(activation) => Some(activation.next.clone()),
            ContinuationKind::Native(call) => Some(call.next.clone()),
            ContinuationKind::Termination(_) => None,
        }
    }

    /// Where this continuation currently is, for tracebacks.
    #[must_use]
    pub fn debug_info(&self) -> Option<DebugInfo> {
        let state = self.0.try_borrow().ok()?;
        match &*state {
            ContinuationKind::Bytecode(activation) => {
                let chunk = activation.closure.chunk();
                Some(DebugInfo {
                    source: chunk.source.clone(),
                    name: chunk.name.clone(),
                    line: chunk.line(activation.pc.saturating_sub(1)),
                })
            }
            ContinuationKind::Native(call) => Some(DebugInfo {
                source: Symbol::from("[native]"),
                name: call.func.name(),
                line: None,
            }),
            ContinuationKind::Termination(_) => None,
        }
    }

    /// Every result accumulated by a termination, in push order, or `None`
    /// for the other kinds.
    #[must_use]
    pub fn termination_results(&self) -> Option<Vec<Value>> {
        let state = self.0.try_borrow().ok()?;
        match &*state {
            ContinuationKind::Termination(termination) => {
                let mut results = termination.results.clone();
                results.extend(termination.etc.iter().cloned());
                Some(results)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.0.try_borrow() {
            Ok(state) => match &*state {
                ContinuationKind::Bytecode(activation) => {
                    return write!(
                        f,
                        "Continuation::Bytecode({} @ {})",
                        activation.closure.name(),
                        activation.pc
                    );
                }
                ContinuationKind::Native(call) => {
                    return write!(f, "Continuation::Native({})", call.func.name());
                }
                ContinuationKind::Termination(_) => "Termination",
            },
            Err(_) => "<running>",
        };
        write!(f, "Continuation::{kind}")
    }
}

/// The view of a native call handed to a host function.
pub struct NativeArgs<'a> {
    /// The fixed argument slots, filled left to right.
    pub args: &'a [Value],
    /// The variadic overflow, in push order.
    pub etc: &'a [Value],
    /// The continuation that should receive the function's results.
    pub next: &'a Continuation,
}

impl NativeArgs<'_> {
    /// Fixed and overflow arguments concatenated.
    #[must_use]
    pub fn all(&self) -> Vec<Value> {
        let mut all = self.args.to_vec();
        all.extend(self.etc.iter().cloned());
        all
    }

    /// The argument at `index`, nil when absent.
    #[must_use]
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Nil)
    }
}

type NativeImpl = dyn Fn(&Thread, NativeArgs<'_>) -> Result<Option<Continuation>, Fault>;

struct NativeFnState {
    name: Symbol,
    arity: u8,
    variadic: bool,
    func: Box<NativeImpl>,
}

/// A host function registered with the engine: the sole extension point for
/// library behavior.
///
/// The function receives its accumulated arguments and decides what happens
/// next, typically by pushing results onto [`NativeArgs::next`] and
/// returning it.
#[derive(Clone)]
pub struct NativeFn(Rc<NativeFnState>);

impl NativeFn {
    pub fn new(
        name: impl Into<Symbol>,
        arity: u8,
        variadic: bool,
        func: impl Fn(&Thread, NativeArgs<'_>) -> Result<Option<Continuation>, Fault> + 'static,
    ) -> Self {
        Self(Rc::new(NativeFnState {
            name: name.into(),
            arity,
            variadic,
            func: Box::new(func),
        }))
    }

    #[must_use]
    pub fn name(&self) -> Symbol {
        self.0.name.clone()
    }

    #[must_use]
    pub fn arity(&self) -> u8 {
        self.0.arity
    }

    #[must_use]
    pub fn variadic(&self) -> bool {
        self.0.variadic
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn invoke(
        &self,
        thread: &Thread,
        args: NativeArgs<'_>,
    ) -> Result<Option<Continuation>, Fault> {
        (self.0.func)(thread, args)
    }
}

impl Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({}/{})", self.0.name, self.0.arity)
    }
}

/// Executes bytecode until the activation hands off control or fails.
#[allow(clippy::too_many_lines)]
fn run_bytecode(
    handle: &Continuation,
    activation: &mut BytecodeActivation,
    thread: &Thread,
) -> Result<Option<Continuation>, Fault> {
    let chunk = activation.closure.chunk().clone();
    loop {
        let pc = activation.pc;
        let Some(&word) = chunk.words.get(pc) else {
            return Err(Fault::error(format!(
                "execution ran past the end of {}",
                chunk.name
            )));
        };
        // One tick per instruction: the quota manager is consulted on the
        // hot path so a breach aborts at an instruction boundary.
        thread.charge_cpu(1)?;
        activation.pc = pc + 1;
        match Instr::decode(word) {
            Instr::Binary { op, dest, lhs, rhs } => {
                let lhs = activation.registers.read(lhs);
                let rhs = activation.registers.read(rhs);
                let value = binary_op(thread, op, lhs, rhs)?;
                activation.registers.write(dest, value);
            }
            Instr::GetIndex { dest, table, key } => {
                let object = activation.registers.read(table);
                let key = activation.registers.read(key);
                let value = index_value(thread, object, &key)?;
                activation.registers.write(dest, value);
            }
            Instr::SetIndex { table, key, value } => {
                let object = activation.registers.read(table);
                let key = activation.registers.read(key);
                let value = activation.registers.read(value);
                set_index_value(thread, &object, key, value)?;
            }
            Instr::LoadConst { dest, index, push } => {
                let value = constant_value(&chunk, index)?;
                store_or_push(activation, dest, value, push)?;
            }
            Instr::LoadSmall {
                kind,
                dest,
                literal,
                push,
            } => {
                let value = match kind {
                    LoadKind::Int => Value::Int(i64::from(literal)),
                    LoadKind::Bool => Value::Bool(literal != 0),
                    LoadKind::EmptyTable => {
                        thread.charge_mem(TABLE_BYTES)?;
                        Value::Table(crate::runtime::value::Table::new())
                    }
                    LoadKind::Nil => Value::Nil,
                };
                store_or_push(activation, dest, value, push)?;
            }
            Instr::Unary { op, a, b } => match op {
                UnaryOp::Neg | UnaryOp::BitNot | UnaryOp::Len => {
                    let operand = activation.registers.read(b);
                    let value = unary_op(thread, op, operand)?;
                    activation.registers.write(a, value);
                }
                UnaryOp::Not => {
                    let operand = activation.registers.read(b);
                    activation.registers.write(a, Value::Bool(!operand.truthy()));
                }
                UnaryOp::Closure => {
                    let Value::Code(code) = activation.registers.read(b) else {
                        return Err(Fault::error(format!(
                            "attempt to build a closure from a {} value",
                            activation.registers.read(b).type_name()
                        )));
                    };
                    thread.charge_mem(
                        CLOSURE_BYTES + u64::from(code.upvalue_count) * VALUE_BYTES,
                    )?;
                    activation
                        .registers
                        .write(a, Value::Closure(Closure::new(code)));
                }
                UnaryOp::Cont => {
                    let callee = activation.registers.read(b);
                    let continuation = Continuation::for_call(thread, &callee, handle.clone())?;
                    activation
                        .registers
                        .write(a, Value::Continuation(continuation));
                }
                UnaryOp::TailCont => {
                    let callee = activation.registers.read(b);
                    let continuation =
                        Continuation::for_call(thread, &callee, activation.next.clone())?;
                    activation
                        .registers
                        .write(a, Value::Continuation(continuation));
                }
                UnaryOp::Upval => {
                    let Value::Closure(closure) = activation.registers.read(a) else {
                        return Err(Fault::error(format!(
                            "attempt to add an upvalue to a {} value",
                            activation.registers.read(a).type_name()
                        )));
                    };
                    if b.kind != RegKind::Cell {
                        return Err(Fault::error("upvalue source must be a cell register"));
                    }
                    closure.add_upvalue(activation.registers.cell(b.index));
                }
                UnaryOp::Push => {
                    let target = as_continuation(activation.registers.read(a))?;
                    let value = activation.registers.read(b);
                    target.push(value)?;
                }
                UnaryOp::PushEtc => {
                    let target = as_continuation(activation.registers.read(a))?;
                    target.push_seq(activation.etc.clone())?;
                }
                UnaryOp::Recv => {
                    let value = activation
                        .incoming
                        .get(activation.cursor)
                        .cloned()
                        .unwrap_or(Value::Nil);
                    activation.cursor += 1;
                    activation.registers.write(a, value);
                }
                UnaryOp::RecvEtc => {
                    let rest = activation.incoming[activation.cursor.min(activation.incoming.len())..]
                        .to_vec();
                    activation.cursor = activation.incoming.len();
                    thread.charge_mem(rest.len() as u64 * VALUE_BYTES)?;
                    activation.etc = rest;
                }
                UnaryOp::Clear => activation.registers.clear(a),
                UnaryOp::Cc => {
                    activation
                        .registers
                        .write(a, Value::Continuation(activation.next.clone()));
                }
            },
            Instr::Jump { offset } => activation.pc = offset_pc(pc, offset)?,
            Instr::JumpIf {
                test,
                offset,
                negate,
            } => {
                if activation.registers.read(test).truthy() != negate {
                    activation.pc = offset_pc(pc, offset)?;
                }
            }
            Instr::Call { target, tail } => {
                let next = as_continuation(activation.registers.read(target))?;
                if tail {
                    // The activation will never run again: hand its arrays
                    // back to the pool before transferring control.
                    let registers = std::mem::take(&mut activation.registers);
                    let runtime = thread.runtime();
                    runtime.release_values(registers.values);
                    runtime.release_cells(registers.cells);
                }
                trace!(target: "coil::vm", tail, "call");
                return Ok(Some(next));
            }
            Instr::EtcIndex { dest, index } => {
                let value = activation
                    .etc
                    .get(usize::from(index))
                    .cloned()
                    .unwrap_or(Value::Nil);
                activation.registers.write(dest, value);
            }
            Instr::EtcFill { table, start } => {
                let Value::Table(table) = activation.registers.read(table) else {
                    return Err(Fault::error("attempt to fill a non-table value"));
                };
                thread.charge_mem(activation.etc.len() as u64 * VALUE_BYTES)?;
                table.fill(start, &activation.etc);
            }
            Instr::Invalid(word) => {
                return Err(Fault::error(format!(
                    "invalid instruction {word:#010x} in {}",
                    chunk.name
                )));
            }
        }
    }
}

fn store_or_push(
    activation: &mut BytecodeActivation,
    dest: Reg,
    value: Value,
    push: bool,
) -> Result<(), Fault> {
    if push {
        // Fused load+push: the destination register holds the continuation
        // being supplied with arguments.
        let target = as_continuation(activation.registers.read(dest))?;
        target.push(value)
    } else {
        activation.registers.write(dest, value);
        Ok(())
    }
}

fn as_continuation(value: Value) -> Result<Continuation, Fault> {
    match value {
        Value::Continuation(continuation) => Ok(continuation),
        other => Err(Fault::error(format!(
            "attempt to call a {} value",
            other.type_name()
        ))),
    }
}

fn constant_value(chunk: &Chunk, index: u16) -> Result<Value, Fault> {
    match chunk.constants.get(usize::from(index)) {
        Some(Constant::Nil) => Ok(Value::Nil),
        Some(Constant::Bool(value)) => Ok(Value::Bool(*value)),
        Some(Constant::Int(value)) => Ok(Value::Int(*value)),
        Some(Constant::Float(value)) => Ok(Value::Float(*value)),
        Some(Constant::String(value)) => Ok(Value::String(value.clone())),
        Some(Constant::Code(code)) => Ok(Value::Code(code.clone())),
        None => Err(Fault::error(format!(
            "invalid constant index {index} in {}",
            chunk.name
        ))),
    }
}

fn offset_pc(pc: usize, offset: i16) -> Result<usize, Fault> {
    let target = i64::try_from(pc).expect("pc fits in i64") + i64::from(offset);
    usize::try_from(target).map_err(|_| Fault::error("jump target out of range"))
}

/// Performs a binary operation, consulting metamethod handlers before
/// surfacing a type error.
fn binary_op(thread: &Thread, op: BinOp, lhs: Value, rhs: Value) -> Result<Value, Fault> {
    if op == BinOp::Eq {
        return equality(thread, &lhs, &rhs);
    }
    match raw_binary(op, &lhs, &rhs) {
        Ok(RawBinary::Done(value)) => {
            if op == BinOp::Concat {
                if let Value::String(result) = &value {
                    thread.charge_mem(result.len() as u64)?;
                }
            }
            Ok(value)
        }
        Ok(RawBinary::NoBuiltin) => {
            let name = op.handler_name();
            match lhs.handler(name).or_else(|| rhs.handler(name)) {
                Some(handler) => {
                    let results = call_value(thread, &handler, vec![lhs, rhs])?;
                    Ok(results.into_iter().next().unwrap_or(Value::Nil))
                }
                None => Err(binary_type_error(op, &lhs, &rhs)),
            }
        }
        Err(raw) => Err(Fault::error(raw.message())),
    }
}

fn equality(thread: &Thread, lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    if lhs.equals(rhs) {
        return Ok(Value::Bool(true));
    }
    // Identity-distinct tables may still compare equal through __eq.
    if let (Value::Table(_), Value::Table(_)) = (lhs, rhs) {
        let name = BinOp::Eq.handler_name();
        if let Some(handler) = lhs.handler(name).or_else(|| rhs.handler(name)) {
            let results = call_value(thread, &handler, vec![lhs.clone(), rhs.clone()])?;
            let truthy = results.first().is_some_and(Value::truthy);
            return Ok(Value::Bool(truthy));
        }
    }
    Ok(Value::Bool(false))
}

fn binary_type_error(op: BinOp, lhs: &Value, rhs: &Value) -> Fault {
    match op {
        BinOp::Concat => {
            let offender = if matches!(lhs, Value::String(_) | Value::Int(_) | Value::Float(_)) {
                rhs
            } else {
                lhs
            };
            Fault::error(format!(
                "attempt to concatenate a {} value",
                offender.type_name()
            ))
        }
        BinOp::Lt | BinOp::Le => Fault::error(format!(
            "attempt to compare {} with {}",
            lhs.type_name(),
            rhs.type_name()
        )),
        _ => {
            let offender = if lhs.as_f64().is_none() { lhs } else { rhs };
            Fault::error(format!(
                "attempt to perform arithmetic ({op}) on a {} value",
                offender.type_name()
            ))
        }
    }
}

fn unary_op(thread: &Thread, op: UnaryOp, operand: Value) -> Result<Value, Fault> {
    let (result, handler_name, verb) = match op {
        UnaryOp::Neg => (
            match &operand {
                Value::Int(value) => Some(Value::Int(value.wrapping_neg())),
                Value::Float(value) => Some(Value::Float(-value)),
                _ => None,
            },
            "__unm",
            "negate",
        ),
        UnaryOp::BitNot => (
            match &operand {
                Value::Int(value) => Some(Value::Int(!value)),
                _ => None,
            },
            "__bnot",
            "bitwise-negate",
        ),
        UnaryOp::Len => (
            match &operand {
                Value::String(value) => Some(Value::Int(value.len() as i64)),
                Value::Table(table) => Some(Value::Int(table.len())),
                _ => None,
            },
            "__len",
            "take the length of",
        ),
        _ => unreachable!("only value-producing unary ops are routed here"),
    };
    match result {
        Some(value) => Ok(value),
        None => match operand.handler(handler_name) {
            Some(handler) => {
                let results = call_value(thread, &handler, vec![operand])?;
                Ok(results.into_iter().next().unwrap_or(Value::Nil))
            }
            None => Err(Fault::error(format!(
                "attempt to {verb} a {} value",
                operand.type_name()
            ))),
        },
    }
}

fn index_value(thread: &Thread, mut object: Value, key: &Value) -> Result<Value, Fault> {
    for _ in 0..MAX_META_CHAIN {
        let handler = match &object {
            Value::Table(table) => {
                let value = table.get(key);
                if !value.is_nil() {
                    return Ok(value);
                }
                let Some(handler) = table.handler("__index") else {
                    return Ok(Value::Nil);
                };
                handler
            }
            other => other.handler("__index").ok_or_else(|| {
                Fault::error(format!("attempt to index a {} value", other.type_name()))
            })?,
        };
        match handler {
            // A table handler redirects the lookup.
            Value::Table(_) => object = handler,
            callable => {
                let results = call_value(thread, &callable, vec![object, key.clone()])?;
                return Ok(results.into_iter().next().unwrap_or(Value::Nil));
            }
        }
    }
    Err(Fault::error("'__index' chain too long; possible loop"))
}

fn set_index_value(thread: &Thread, object: &Value, key: Value, value: Value) -> Result<(), Fault> {
    match object {
        Value::Table(table) => {
            if table.set(key, value) {
                Ok(())
            } else {
                Err(Fault::error("table index must be a scalar value"))
            }
        }
        other => match other.handler("__newindex") {
            Some(handler) => {
                call_value(thread, &handler, vec![object.clone(), key, value])?;
                Ok(())
            }
            None => Err(Fault::error(format!(
                "attempt to index a {} value",
                other.type_name()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Runtime;

    fn termination_with(capacity: usize, variadic: bool, values: &[i64]) -> Continuation {
        let sink = Continuation::termination(capacity, variadic);
        for value in values {
            sink.push(Value::Int(*value)).unwrap();
        }
        sink
    }

    #[test]
    fn push_fills_fixed_slots_then_overflows() {
        let sink = termination_with(2, true, &[1, 2, 3, 4, 5]);
        let results = sink.termination_results().unwrap();
        assert_eq!(results.len(), 5);
        for (index, value) in results.iter().enumerate() {
            assert!(value.equals(&Value::Int(index as i64 + 1)));
        }
    }

    #[test]
    fn push_past_a_bounded_continuation_silently_drops() {
        let sink = termination_with(2, false, &[1, 2, 3, 4]);
        let results = sink.termination_results().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].equals(&Value::Int(1)));
        assert!(results[1].equals(&Value::Int(2)));
    }

    #[test]
    fn push_seq_matches_repeated_push() {
        let one_by_one = Continuation::termination(1, true);
        let batched = Continuation::termination(1, true);
        for value in 0..4 {
            one_by_one.push(Value::Int(value)).unwrap();
        }
        batched
            .push_seq((0..4).map(Value::Int).collect())
            .unwrap();
        let lhs = one_by_one.termination_results().unwrap();
        let rhs = batched.termination_results().unwrap();
        assert_eq!(lhs.len(), rhs.len());
        for (a, b) in lhs.iter().zip(&rhs) {
            assert!(a.equals(b));
        }
    }

    #[test]
    fn termination_is_a_fixed_point() {
        let runtime = Runtime::new();
        let thread = runtime.root_thread();
        let sink = Continuation::termination_all();
        assert!(sink.run_step(&thread).unwrap().is_none());
        assert!(sink.next().is_none());
    }

    #[test]
    fn native_continuation_honors_arity_and_variadic_flag() {
        let runtime = Runtime::new();
        let thread = runtime.root_thread();
        let func = NativeFn::new("probe", 2, true, |_thread, args| {
            args.next.push(Value::Int(args.args.len() as i64))?;
            args.next.push(Value::Int(args.etc.len() as i64))?;
            Ok(Some(args.next.clone()))
        });
        let sink = Continuation::termination_all();
        let call =
            Continuation::for_call(&thread, &Value::Native(func), sink.clone()).unwrap();
        call.push_seq((0..5).map(Value::Int).collect()).unwrap();
        crate::vm::run(&thread, call).unwrap();
        let results = sink.termination_results().unwrap();
        assert!(results[0].equals(&Value::Int(2)));
        assert!(results[1].equals(&Value::Int(3)));
    }

    #[test]
    fn calling_a_non_callable_value_fails() {
        let runtime = Runtime::new();
        let thread = runtime.root_thread();
        let sink = Continuation::termination_all();
        let error = Continuation::for_call(&thread, &Value::Int(3), sink).unwrap_err();
        assert!(matches!(error, Fault::Error(_)));
    }
}
