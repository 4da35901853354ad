//! The value model: everything a register can hold.

pub mod cell;
pub mod closure;
pub mod symbol;
pub mod value;
