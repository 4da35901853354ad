//! An embeddable register-machine interpreter with first-class
//! continuations, cooperative threads, and hierarchical resource quotas.
//!
//! Compiled code arrives as a [`code::Unit`], either built in process with
//! [`code::Chunk::builder`] or unmarshaled from bytes. A [`vm::Runtime`]
//! executes units on cooperative [threads](vm::thread::Thread); there is no
//! native call stack behind script execution, so tail calls are flat and
//! yielding never captures host stack.

pub mod code;
pub mod instruction;
pub mod runtime;
pub mod vm;

#[cfg(test)]
mod tests;

/// An error from loading or executing a unit.
#[derive(Debug)]
pub enum Error {
    /// The unit's bytes could not be unmarshaled.
    Unit(code::UnitError),
    /// Execution failed.
    Execution(vm::ExecutionError),
}

impl From<code::UnitError> for Error {
    fn from(value: code::UnitError) -> Self {
        Self::Unit(value)
    }
}

impl From<vm::ExecutionError> for Error {
    fn from(value: vm::ExecutionError) -> Self {
        Self::Execution(value)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit(error) => std::fmt::Display::fmt(error, f),
            Self::Execution(error) => std::fmt::Display::fmt(error, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unit(error) => Some(error),
            Self::Execution(error) => Some(error),
        }
    }
}
