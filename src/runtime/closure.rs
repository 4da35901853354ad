//! Closures: compiled code bound to captured cells.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;
use std::sync::Arc;

use crate::code::Chunk;
use crate::runtime::cell::Cell;
use crate::runtime::symbol::Symbol;

struct ClosureState {
    chunk: Arc<Chunk>,
    /// Filled incrementally by upvalue-wiring instructions after the closure
    /// value is constructed.
    upvalues: RefCell<Vec<Cell>>,
}

/// An immutable code template plus its captured upvalue cells.
///
/// A closure is not callable until its upvalue list has been fully populated
/// to the count its chunk declares; calling one early is a bytecode
/// invariant violation and aborts.
#[derive(Clone)]
pub struct Closure(Rc<ClosureState>);

impl Closure {
    #[must_use]
    pub fn new(chunk: Arc<Chunk>) -> Self {
        let capacity = usize::from(chunk.upvalue_count);
        Self(Rc::new(ClosureState {
            chunk,
            upvalues: RefCell::new(Vec::with_capacity(capacity)),
        }))
    }

    #[must_use]
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.0.chunk
    }

    #[must_use]
    pub fn name(&self) -> Symbol {
        self.0.chunk.name.clone()
    }

    /// Appends the next captured cell.
    ///
    /// # Panics
    ///
    /// Panics when the declared upvalue count is already reached.
    pub fn add_upvalue(&self, cell: Cell) {
        let mut upvalues = self.0.upvalues.borrow_mut();
        assert!(
            upvalues.len() < usize::from(self.0.chunk.upvalue_count),
            "closure {} already has all {} declared upvalues",
            self.0.chunk.name,
            self.0.chunk.upvalue_count
        );
        upvalues.push(cell);
    }

    /// Whether every declared upvalue has been wired in.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.0.upvalues.borrow().len() == usize::from(self.0.chunk.upvalue_count)
    }

    pub(crate) fn upvalues(&self) -> Vec<Cell> {
        self.0.upvalues.borrow().clone()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("name", &self.0.chunk.name)
            .field("upvalues", &self.0.upvalues.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Value;

    #[test]
    fn upvalue_wiring_completes_at_declared_count() {
        let chunk = Chunk::builder("test", "f").cells(2).upvalues(["a", "b"]).build();
        let closure = Closure::new(chunk);
        assert!(!closure.is_complete());
        closure.add_upvalue(Cell::new(Value::Int(1)));
        closure.add_upvalue(Cell::new(Value::Int(2)));
        assert!(closure.is_complete());
    }

    #[test]
    #[should_panic(expected = "already has all")]
    fn extra_upvalue_is_fatal() {
        let chunk = Chunk::builder("test", "f").build();
        let closure = Closure::new(chunk);
        closure.add_upvalue(Cell::empty());
    }
}
