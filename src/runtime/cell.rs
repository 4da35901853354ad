//! Cells and the per-activation register file.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

use crate::instruction::{Reg, RegKind};
use crate::runtime::value::Value;

/// A single-value mutable box shared between the activation that created it
/// and every closure that captured it as an upvalue.
///
/// Cells are the only intentionally shared mutable state in the model; a
/// write through any holder is immediately visible to all holders.
#[derive(Clone, Default)]
pub struct Cell(Rc<RefCell<Value>>);

impl Cell {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    /// A fresh cell holding nil.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self) -> Value {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.borrow_mut() = value;
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell({:?})", self.0.borrow())
    }
}

/// The storage of one activation: a value array and a cell array, both
/// pooled by the owning runtime.
#[derive(Debug, Default)]
pub struct RegisterFile {
    pub(crate) values: Vec<Value>,
    pub(crate) cells: Vec<Cell>,
}

impl RegisterFile {
    pub(crate) fn new(values: Vec<Value>, cells: Vec<Cell>) -> Self {
        Self { values, cells }
    }

    /// Reads through `reg`, dereferencing the cell indirection for cell
    /// registers.
    ///
    /// # Panics
    ///
    /// Panics when the index is outside the activation's declared counts.
    /// That is a bytecode invariant violation, not a user-level error.
    #[must_use]
    pub fn read(&self, reg: Reg) -> Value {
        match reg.kind {
            RegKind::Value => self.values[self.index(reg)].clone(),
            RegKind::Cell => self.cells[self.index(reg)].get(),
        }
    }

    /// Writes through `reg`. A write through a cell register mutates the
    /// shared box, observable by every other holder immediately.
    pub fn write(&mut self, reg: Reg, value: Value) {
        match reg.kind {
            RegKind::Value => {
                let index = self.index(reg);
                self.values[index] = value;
            }
            RegKind::Cell => self.cells[self.index(reg)].set(value),
        }
    }

    /// Resets `reg`. For a cell register this *replaces* the cell with a
    /// fresh empty one rather than writing nil through the existing cell,
    /// deliberately breaking sharing: closures that captured the old cell
    /// keep observing the old value.
    pub fn clear(&mut self, reg: Reg) {
        let index = self.index(reg);
        match reg.kind {
            RegKind::Value => self.values[index] = Value::Nil,
            RegKind::Cell => self.cells[index] = Cell::empty(),
        }
    }

    /// The cell at `index`, for upvalue capture.
    #[must_use]
    pub fn cell(&self, index: u8) -> Cell {
        self.cells[usize::from(index)].clone()
    }

    fn index(&self, reg: Reg) -> usize {
        let (index, declared) = match reg.kind {
            RegKind::Value => (usize::from(reg.index), self.values.len()),
            RegKind::Cell => (usize::from(reg.index), self.cells.len()),
        };
        assert!(
            index < declared,
            "register {reg} out of range: activation declares {declared}"
        );
        index
    }
}
