//! The dynamic value type and the table collaborator.

use std::cell::RefCell;
use std::fmt::{self, Debug, Display};
use std::rc::Rc;
use std::sync::Arc;

use ahash::AHashMap;

use crate::code::Chunk;
use crate::instruction::BinOp;
use crate::runtime::closure::Closure;
use crate::runtime::symbol::Symbol;
use crate::vm::continuation::{Continuation, NativeFn};
use crate::vm::thread::Thread;

/// A first-class value.
///
/// Cloning is cheap: the heap-backed variants are reference-counted handles,
/// and handle identity is value identity for them.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Symbol),
    Table(Table),
    /// A compiled function body, not yet bound to upvalues.
    Code(Arc<Chunk>),
    Closure(Closure),
    Continuation(Continuation),
    Native(NativeFn),
    Thread(Thread),
}

impl Value {
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Nil and false are falsy; everything else is truthy.
    #[must_use]
    pub const fn truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// The name of this value's type, as surfaced in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::Float(_) => "number",
            Self::String(_) => "string",
            Self::Table(_) => "table",
            Self::Code(_) => "code",
            Self::Closure(_) => "closure",
            Self::Continuation(_) => "continuation",
            Self::Native(_) => "native function",
            Self::Thread(_) => "thread",
        }
    }

    /// Raw equality: numeric across int/float, contents for strings, handle
    /// identity for everything heap-backed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(lhs), Self::Bool(rhs)) => lhs == rhs,
            (Self::Int(lhs), Self::Int(rhs)) => lhs == rhs,
            (Self::Float(lhs), Self::Float(rhs)) => lhs == rhs,
            (Self::Int(lhs), Self::Float(rhs)) | (Self::Float(rhs), Self::Int(lhs)) => {
                *lhs as f64 == *rhs
            }
            (Self::String(lhs), Self::String(rhs)) => lhs == rhs,
            (Self::Table(lhs), Self::Table(rhs)) => lhs.ptr_eq(rhs),
            (Self::Code(lhs), Self::Code(rhs)) => Arc::ptr_eq(lhs, rhs),
            (Self::Closure(lhs), Self::Closure(rhs)) => lhs.ptr_eq(rhs),
            (Self::Continuation(lhs), Self::Continuation(rhs)) => lhs.ptr_eq(rhs),
            (Self::Native(lhs), Self::Native(rhs)) => lhs.ptr_eq(rhs),
            (Self::Thread(lhs), Self::Thread(rhs)) => lhs.ptr_eq(rhs),
            _ => false,
        }
    }

    /// Returns the metamethod registered for `name` on this value, if any.
    /// Only tables carry handlers.
    #[must_use]
    pub fn handler(&self, name: &str) -> Option<Value> {
        match self {
            Self::Table(table) => table.handler(name),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(value) => Display::fmt(value, f),
            Self::Int(value) => Display::fmt(value, f),
            Self::Float(value) => Display::fmt(value, f),
            Self::String(value) => Display::fmt(value, f),
            Self::Table(table) => write!(f, "table: {:p}", Rc::as_ptr(&table.0)),
            Self::Code(chunk) => write!(f, "code: {}", chunk.name),
            Self::Closure(closure) => write!(f, "closure: {}", closure.name()),
            Self::Continuation(_) => f.write_str("continuation"),
            Self::Native(native) => write!(f, "native function: {}", native.name()),
            Self::Thread(_) => f.write_str("thread"),
        }
    }
}

/// How a raw (metamethod-free) binary operation turned out.
pub(crate) enum RawBinary {
    Done(Value),
    /// The operand types have no built-in behavior for the operation; the
    /// caller should consult metamethod handlers before raising a type
    /// error.
    NoBuiltin,
}

/// A failure from a raw operation that is a genuine error rather than a
/// missing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawError {
    DivideByZero,
    ShiftOverflow,
}

impl RawError {
    pub(crate) const fn message(self) -> &'static str {
        match self {
            Self::DivideByZero => "attempt to divide by zero",
            Self::ShiftOverflow => "shift amount out of range",
        }
    }
}

/// Performs `lhs <op> rhs` using only built-in behavior.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn raw_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<RawBinary, RawError> {
    use RawBinary::{Done, NoBuiltin};
    let result = match op {
        BinOp::Add => raw_arith(lhs, rhs, i64::wrapping_add, |a, b| a + b),
        BinOp::Sub => raw_arith(lhs, rhs, i64::wrapping_sub, |a, b| a - b),
        BinOp::Mul => raw_arith(lhs, rhs, i64::wrapping_mul, |a, b| a * b),
        BinOp::Div => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(lhs), Some(rhs)) => Done(Value::Float(lhs / rhs)),
            _ => NoBuiltin,
        },
        BinOp::IntDiv => match (lhs, rhs) {
            (Value::Int(_), Value::Int(0)) => return Err(RawError::DivideByZero),
            (Value::Int(lhs), Value::Int(rhs)) => Done(Value::Int(lhs.div_euclid(*rhs))),
            _ => match (lhs.as_f64(), rhs.as_f64()) {
                (Some(lhs), Some(rhs)) => Done(Value::Float((lhs / rhs).floor())),
                _ => NoBuiltin,
            },
        },
        BinOp::Rem => match (lhs, rhs) {
            (Value::Int(_), Value::Int(0)) => return Err(RawError::DivideByZero),
            (Value::Int(lhs), Value::Int(rhs)) => Done(Value::Int(lhs.rem_euclid(*rhs))),
            _ => match (lhs.as_f64(), rhs.as_f64()) {
                (Some(lhs), Some(rhs)) => Done(Value::Float(lhs.rem_euclid(rhs))),
                _ => NoBuiltin,
            },
        },
        BinOp::Pow => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(lhs), Some(rhs)) => Done(Value::Float(lhs.powf(rhs))),
            _ => NoBuiltin,
        },
        BinOp::Concat => match (concat_fragment(lhs), concat_fragment(rhs)) {
            (Some(lhs), Some(rhs)) => Done(Value::String(Symbol::from(lhs + &rhs))),
            _ => NoBuiltin,
        },
        BinOp::BitAnd => raw_bitwise(lhs, rhs, |a, b| Ok(a & b))?,
        BinOp::BitOr => raw_bitwise(lhs, rhs, |a, b| Ok(a | b))?,
        BinOp::BitXor => raw_bitwise(lhs, rhs, |a, b| Ok(a ^ b))?,
        BinOp::Shl => raw_bitwise(lhs, rhs, shift(i64::checked_shl))?,
        BinOp::Shr => raw_bitwise(lhs, rhs, shift(i64::checked_shr))?,
        BinOp::Eq => Done(Value::Bool(lhs.equals(rhs))),
        BinOp::Lt => raw_compare(lhs, rhs, |ord| ord.is_lt()),
        BinOp::Le => raw_compare(lhs, rhs, |ord| ord.is_le()),
    };
    Ok(result)
}

fn raw_arith(
    lhs: &Value,
    rhs: &Value,
    int: impl FnOnce(i64, i64) -> i64,
    float: impl FnOnce(f64, f64) -> f64,
) -> RawBinary {
    match (lhs, rhs) {
        (Value::Int(lhs), Value::Int(rhs)) => RawBinary::Done(Value::Int(int(*lhs, *rhs))),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(lhs), Some(rhs)) => RawBinary::Done(Value::Float(float(lhs, rhs))),
            _ => RawBinary::NoBuiltin,
        },
    }
}

fn raw_bitwise(
    lhs: &Value,
    rhs: &Value,
    op: impl FnOnce(i64, i64) -> Result<i64, RawError>,
) -> Result<RawBinary, RawError> {
    match (lhs, rhs) {
        (Value::Int(lhs), Value::Int(rhs)) => op(*lhs, *rhs).map(Value::Int).map(RawBinary::Done),
        _ => Ok(RawBinary::NoBuiltin),
    }
}

fn shift(op: impl Fn(i64, u32) -> Option<i64>) -> impl Fn(i64, i64) -> Result<i64, RawError> {
    move |value, amount| {
        let amount = u32::try_from(amount).map_err(|_| RawError::ShiftOverflow)?;
        op(value, amount).ok_or(RawError::ShiftOverflow)
    }
}

#[allow(clippy::cast_precision_loss)]
fn raw_compare(
    lhs: &Value,
    rhs: &Value,
    test: impl FnOnce(std::cmp::Ordering) -> bool,
) -> RawBinary {
    let ordering = match (lhs, rhs) {
        (Value::Int(lhs), Value::Int(rhs)) => lhs.partial_cmp(rhs),
        (Value::String(lhs), Value::String(rhs)) => Some(lhs.cmp(rhs)),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(lhs), Some(rhs)) => lhs.partial_cmp(&rhs),
            _ => return RawBinary::NoBuiltin,
        },
    };
    match ordering {
        Some(ordering) => RawBinary::Done(Value::Bool(test(ordering))),
        // An incomparable float pair (NaN) compares false for every test.
        None => RawBinary::Done(Value::Bool(false)),
    }
}

fn concat_fragment(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.to_string()),
        Value::Int(value) => Some(value.to_string()),
        Value::Float(value) => Some(value.to_string()),
        _ => None,
    }
}

/// A hashable, normalized table key. Integral floats collapse onto their
/// integer key so `t[2]` and `t[2.0]` address the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    Int(i64),
    FloatBits(u64),
    String(Symbol),
    Bool(bool),
}

impl TableKey {
    /// Normalizes `value` into a key. Nil and heap-backed values are not
    /// valid keys.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(value) => Some(Self::Int(*value)),
            Value::Float(value) => match value_as_exact_int(*value) {
                Some(int) => Some(Self::Int(int)),
                None => Some(Self::FloatBits(value.to_bits())),
            },
            Value::String(value) => Some(Self::String(value.clone())),
            Value::Bool(value) => Some(Self::Bool(*value)),
            _ => None,
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn value_as_exact_int(value: f64) -> Option<i64> {
    let truncated = value as i64;
    (truncated as f64 == value).then_some(truncated)
}

#[derive(Debug, Default)]
struct TableData {
    /// Values stored at contiguous integer keys `1..=array.len()`.
    array: Vec<Value>,
    hash: AHashMap<TableKey, Value>,
    meta: Option<Table>,
}

/// The table value type: a hybrid array/hash map with an optional meta
/// table. The growth strategy of the hash part is the hasher's concern, not
/// the engine's.
#[derive(Debug, Clone, Default)]
pub struct Table(Rc<RefCell<TableData>>);

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Raw read. Missing keys and invalid keys read as nil.
    #[must_use]
    pub fn get(&self, key: &Value) -> Value {
        let data = self.0.borrow();
        if let Value::Int(index) = key {
            if let Some(value) = index
                .checked_sub(1)
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| data.array.get(i))
            {
                return value.clone();
            }
        }
        TableKey::from_value(key)
            .and_then(|key| data.hash.get(&key).cloned())
            .unwrap_or(Value::Nil)
    }

    /// Raw write. Returns `false` when `key` cannot be a table key.
    #[must_use]
    pub fn set(&self, key: Value, value: Value) -> bool {
        let mut data = self.0.borrow_mut();
        if let Value::Int(index) = key {
            if let Some(slot) = index
                .checked_sub(1)
                .and_then(|i| usize::try_from(i).ok())
                .filter(|i| *i < data.array.len())
            {
                data.array[slot] = value;
                return true;
            }
            if usize::try_from(index).ok() == Some(data.array.len() + 1) {
                if value.is_nil() {
                    return true;
                }
                data.array.push(value);
                // Adjacent keys may already live in the hash part; migrate
                // them so the border stays contiguous.
                loop {
                    let next = TableKey::Int(data.array.len() as i64 + 1);
                    match data.hash.remove(&next) {
                        Some(value) => data.array.push(value),
                        None => break,
                    }
                }
                return true;
            }
        }
        let Some(key) = TableKey::from_value(&key) else {
            return false;
        };
        if value.is_nil() {
            data.hash.remove(&key);
        } else {
            data.hash.insert(key, value);
        }
        true
    }

    /// The border length: the extent of the contiguous array part.
    #[must_use]
    pub fn len(&self) -> i64 {
        i64::try_from(self.0.borrow().array.len()).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let data = self.0.borrow();
        data.array.is_empty() && data.hash.is_empty()
    }

    /// Appends `values` starting at integer key `start + 1`.
    pub fn fill(&self, start: u16, values: &[Value]) {
        for (offset, value) in values.iter().enumerate() {
            let key = i64::from(start) + 1 + offset as i64;
            let _ = self.set(Value::Int(key), value.clone());
        }
    }

    #[must_use]
    pub fn meta(&self) -> Option<Table> {
        self.0.borrow().meta.clone()
    }

    pub fn set_meta(&self, meta: Option<Table>) {
        self.0.borrow_mut().meta = meta;
    }

    /// Looks up a metamethod by handler name on this table's meta table.
    #[must_use]
    pub fn handler(&self, name: &str) -> Option<Value> {
        let meta = self.meta()?;
        let handler = meta.get(&Value::String(Symbol::from(name)));
        (!handler.is_nil()).then_some(handler)
    }
}
