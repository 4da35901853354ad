//! The 32-bit instruction word format.
//!
//! Every instruction is a single `u32` whose top nibble selects one of seven
//! mutually exclusive *shapes*. Each shape overlays its own field layout on
//! the remaining bits: up to three 9-bit register operands (1 kind bit + 8
//! index bits), a 16-bit literal, a small sub-operation selector, and flag
//! bits. Decoding is a table lookup on the nibble followed by masking; it is
//! total over all `u32` values, with unassigned patterns decoding to
//! [`Instr::Invalid`].

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

const REG_BITS: u32 = 9;
const KIND_BIT: u32 = 0x100;
const INDEX_MASK: u32 = 0xFF;
const LITERAL_MASK: u32 = 0xFFFF;

/// Whether a register operand names a plain value slot or a shared cell.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RegKind {
    /// A slot in the activation's value array.
    Value,
    /// An indirection through the activation's cell array.
    Cell,
}

/// A register operand: a kind plus an index in `0..=255`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Reg {
    pub kind: RegKind,
    pub index: u8,
}

impl Reg {
    #[must_use]
    pub const fn value(index: u8) -> Self {
        Self {
            kind: RegKind::Value,
            index,
        }
    }

    #[must_use]
    pub const fn cell(index: u8) -> Self {
        Self {
            kind: RegKind::Cell,
            index,
        }
    }

    const fn to_bits(self) -> u32 {
        let kind = match self.kind {
            RegKind::Value => 0,
            RegKind::Cell => KIND_BIT,
        };
        kind | self.index as u32
    }

    const fn from_bits(bits: u32) -> Self {
        Self {
            kind: if bits & KIND_BIT == 0 {
                RegKind::Value
            } else {
                RegKind::Cell
            },
            index: (bits & INDEX_MASK) as u8,
        }
    }
}

impl Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RegKind::Value => write!(f, "r{}", self.index),
            RegKind::Cell => write!(f, "c{}", self.index),
        }
    }
}

/// The binary sub-operations of the [`Shape::Binary`] shape.
///
/// Exactly sixteen, so the 4-bit selector has no invalid encodings.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Rem,
    Pow,
    Concat,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Lt,
    Le,
}

impl BinOp {
    const ALL: [Self; 16] = [
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::IntDiv,
        Self::Rem,
        Self::Pow,
        Self::Concat,
        Self::BitAnd,
        Self::BitOr,
        Self::BitXor,
        Self::Shl,
        Self::Shr,
        Self::Eq,
        Self::Lt,
        Self::Le,
    ];

    const fn to_bits(self) -> u32 {
        self as u32
    }

    fn from_bits(bits: u32) -> Self {
        Self::ALL[bits as usize & 0xF]
    }

    /// The conventional metamethod key for this operation, if it has one.
    #[must_use]
    pub const fn handler_name(self) -> &'static str {
        match self {
            Self::Add => "__add",
            Self::Sub => "__sub",
            Self::Mul => "__mul",
            Self::Div => "__div",
            Self::IntDiv => "__idiv",
            Self::Rem => "__mod",
            Self::Pow => "__pow",
            Self::Concat => "__concat",
            Self::BitAnd => "__band",
            Self::BitOr => "__bor",
            Self::BitXor => "__bxor",
            Self::Shl => "__shl",
            Self::Shr => "__shr",
            Self::Eq => "__eq",
            Self::Lt => "__lt",
            Self::Le => "__le",
        }
    }
}

impl Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::IntDiv => "idiv",
            Self::Rem => "mod",
            Self::Pow => "pow",
            Self::Concat => "concat",
            Self::BitAnd => "band",
            Self::BitOr => "bor",
            Self::BitXor => "bxor",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::Eq => "eq",
            Self::Lt => "lt",
            Self::Le => "le",
        };
        f.write_str(name)
    }
}

/// The sub-operations of the [`Shape::Unary`] shape.
///
/// Alongside the ordinary unary operators this shape carries the
/// construction instructions for closures and continuations, upvalue wiring,
/// argument transfer, and cell clearing: everything that reads at most two
/// registers and a selector.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `a = -b`
    Neg,
    /// `a = ~b`
    BitNot,
    /// `a = not b` (boolean coercion)
    Not,
    /// `a = #b`
    Len,
    /// `a = closure(b)` where `b` holds a code object.
    Closure,
    /// `a = continuation(b)`, chained after the current continuation.
    Cont,
    /// `a = continuation(b)`, chained after the current continuation's own
    /// successor. Used for tail calls.
    TailCont,
    /// Append the cell at `b` as the next upvalue of the closure at `a`.
    Upval,
    /// Push the value at `b` onto the continuation at `a`.
    Push,
    /// Push every collected variadic value onto the continuation at `a`.
    PushEtc,
    /// Receive the next incoming argument into `a`.
    Recv,
    /// Capture every remaining incoming argument as the variadic overflow.
    RecvEtc,
    /// Reset register `a`. For a cell register this replaces the cell.
    Clear,
    /// `a = ` the continuation that receives this activation's results.
    Cc,
}

impl UnaryOp {
    const ALL: [Self; 14] = [
        Self::Neg,
        Self::BitNot,
        Self::Not,
        Self::Len,
        Self::Closure,
        Self::Cont,
        Self::TailCont,
        Self::Upval,
        Self::Push,
        Self::PushEtc,
        Self::Recv,
        Self::RecvEtc,
        Self::Clear,
        Self::Cc,
    ];

    const fn to_bits(self) -> u32 {
        self as u32
    }

    fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.get(bits as usize).copied()
    }
}

/// What a [`Shape::LoadSmall`] instruction materializes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LoadKind {
    /// The sign-extended 16-bit literal.
    Int,
    /// `true` when the literal is nonzero.
    Bool,
    /// A freshly allocated empty table.
    EmptyTable,
    /// Nil. The literal is ignored.
    Nil,
}

impl LoadKind {
    const ALL: [Self; 4] = [Self::Int, Self::Bool, Self::EmptyTable, Self::Nil];

    const fn to_bits(self) -> u32 {
        self as u32
    }

    fn from_bits(bits: u32) -> Self {
        Self::ALL[bits as usize & 0x3]
    }
}

/// The seven instruction shapes, selected by a word's top nibble.
///
/// [`Shape::JumpCall`] is the one shape that consults a fifth bit to split
/// into its jump and call sub-shapes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Shape {
    Binary,
    GetSet,
    LoadConst,
    LoadSmall,
    Unary,
    JumpCall,
    Etc,
    Invalid,
}

/// Shape lookup by nibble. The binary shape spans the lower eight nibbles so
/// its selector gains a fourth bit.
const SHAPES: [Shape; 16] = [
    Shape::Binary,
    Shape::Binary,
    Shape::Binary,
    Shape::Binary,
    Shape::Binary,
    Shape::Binary,
    Shape::Binary,
    Shape::Binary,
    Shape::GetSet,
    Shape::LoadConst,
    Shape::LoadSmall,
    Shape::Unary,
    Shape::JumpCall,
    Shape::Etc,
    Shape::Invalid,
    Shape::Invalid,
];

const NIBBLE_GETSET: u32 = 0x8 << 28;
const NIBBLE_LOADCONST: u32 = 0x9 << 28;
const NIBBLE_LOADSMALL: u32 = 0xA << 28;
const NIBBLE_UNARY: u32 = 0xB << 28;
const NIBBLE_JUMPCALL: u32 = 0xC << 28;
const NIBBLE_ETC: u32 = 0xD << 28;

const FLAG_BIT: u32 = 1 << 27;

/// A decoded instruction.
///
/// [`Instr::decode`] is total: every `u32` decodes to something, and corrupt
/// or hand-crafted words come back as [`Instr::Invalid`], which the engine
/// rejects at execution time rather than here.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Instr {
    /// `dest = lhs <op> rhs`
    Binary {
        op: BinOp,
        dest: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    /// `dest = table[key]`
    GetIndex { dest: Reg, table: Reg, key: Reg },
    /// `table[key] = value`
    SetIndex { table: Reg, key: Reg, value: Reg },
    /// Load constant `index` into `dest`, or push it onto the continuation
    /// at `dest` when `push` is set.
    LoadConst { dest: Reg, index: u16, push: bool },
    /// Materialize a small immediate into `dest`, or push it onto the
    /// continuation at `dest` when `push` is set.
    LoadSmall {
        kind: LoadKind,
        dest: Reg,
        literal: i16,
        push: bool,
    },
    /// A two-register instruction selected by [`UnaryOp`].
    Unary { op: UnaryOp, a: Reg, b: Reg },
    /// Unconditional relative jump.
    Jump { offset: i16 },
    /// Jump when `test` is truthy, or falsy when `negate` is set.
    JumpIf {
        test: Reg,
        offset: i16,
        negate: bool,
    },
    /// Transfer control to the continuation at `target`. A tail call
    /// additionally releases the current activation's registers.
    Call { target: Reg, tail: bool },
    /// `dest = etc[index]`, nil when out of range.
    EtcIndex { dest: Reg, index: u16 },
    /// Append every collected variadic value to the table at `table`,
    /// starting at integer key `start + 1`.
    EtcFill { table: Reg, start: u16 },
    /// An unassigned bit pattern, preserved verbatim.
    Invalid(u32),
}

impl Instr {
    /// Returns the shape of `word` without decoding its fields.
    #[must_use]
    pub fn shape(word: u32) -> Shape {
        SHAPES[(word >> 28) as usize]
    }

    /// Decodes `word`. Total over all 2^32 values.
    #[must_use]
    pub fn decode(word: u32) -> Self {
        match Self::shape(word) {
            Shape::Binary => Self::Binary {
                op: BinOp::from_bits(word >> 27),
                dest: Reg::from_bits(word >> (REG_BITS * 2)),
                lhs: Reg::from_bits(word >> REG_BITS),
                rhs: Reg::from_bits(word),
            },
            Shape::GetSet => {
                let a = Reg::from_bits(word >> (REG_BITS * 2));
                let b = Reg::from_bits(word >> REG_BITS);
                let c = Reg::from_bits(word);
                if word & FLAG_BIT == 0 {
                    Self::GetIndex {
                        dest: a,
                        table: b,
                        key: c,
                    }
                } else {
                    Self::SetIndex {
                        table: a,
                        key: b,
                        value: c,
                    }
                }
            }
            Shape::LoadConst => Self::LoadConst {
                dest: Reg::from_bits(word >> 16),
                index: (word & LITERAL_MASK) as u16,
                push: word & FLAG_BIT != 0,
            },
            Shape::LoadSmall => Self::LoadSmall {
                kind: LoadKind::from_bits(word >> 25),
                dest: Reg::from_bits(word >> 16),
                literal: (word & LITERAL_MASK) as u16 as i16,
                push: word & FLAG_BIT != 0,
            },
            Shape::Unary => match UnaryOp::from_bits((word >> 24) & 0xF) {
                Some(op) => Self::Unary {
                    op,
                    a: Reg::from_bits(word >> 15),
                    b: Reg::from_bits(word >> 6),
                },
                None => Self::Invalid(word),
            },
            Shape::JumpCall => {
                // The fifth bit splits this shape's two layouts.
                if word & FLAG_BIT == 0 {
                    let offset = (word & LITERAL_MASK) as u16 as i16;
                    if word & (1 << 26) == 0 {
                        Self::Jump { offset }
                    } else {
                        Self::JumpIf {
                            test: Reg::from_bits(word >> 16),
                            offset,
                            negate: word & (1 << 25) != 0,
                        }
                    }
                } else {
                    Self::Call {
                        target: Reg::from_bits(word >> 16),
                        tail: word & (1 << 26) != 0,
                    }
                }
            }
            Shape::Etc => {
                let a = Reg::from_bits(word >> 16);
                let n = (word & LITERAL_MASK) as u16;
                if word & (1 << 26) == 0 {
                    Self::EtcIndex { dest: a, index: n }
                } else {
                    Self::EtcFill { table: a, start: n }
                }
            }
            Shape::Invalid => Self::Invalid(word),
        }
    }

    /// Encodes this instruction into a word.
    ///
    /// Encoding is total: operand ranges are enforced by the field types, so
    /// any constructible `Instr` has an exact encoding and
    /// `decode(encode(i)) == i`.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn encode(self) -> u32 {
        match self {
            Self::Binary { op, dest, lhs, rhs } => {
                (op.to_bits() << 27)
                    | (dest.to_bits() << (REG_BITS * 2))
                    | (lhs.to_bits() << REG_BITS)
                    | rhs.to_bits()
            }
            Self::GetIndex { dest, table, key } => {
                NIBBLE_GETSET
                    | (dest.to_bits() << (REG_BITS * 2))
                    | (table.to_bits() << REG_BITS)
                    | key.to_bits()
            }
            Self::SetIndex { table, key, value } => {
                NIBBLE_GETSET
                    | FLAG_BIT
                    | (table.to_bits() << (REG_BITS * 2))
                    | (key.to_bits() << REG_BITS)
                    | value.to_bits()
            }
            Self::LoadConst { dest, index, push } => {
                NIBBLE_LOADCONST
                    | if push { FLAG_BIT } else { 0 }
                    | (dest.to_bits() << 16)
                    | u32::from(index)
            }
            Self::LoadSmall {
                kind,
                dest,
                literal,
                push,
            } => {
                NIBBLE_LOADSMALL
                    | if push { FLAG_BIT } else { 0 }
                    | (kind.to_bits() << 25)
                    | (dest.to_bits() << 16)
                    | u32::from(literal as u16)
            }
            Self::Unary { op, a, b } => {
                NIBBLE_UNARY | (op.to_bits() << 24) | (a.to_bits() << 15) | (b.to_bits() << 6)
            }
            Self::Jump { offset } => NIBBLE_JUMPCALL | u32::from(offset as u16),
            Self::JumpIf {
                test,
                offset,
                negate,
            } => {
                NIBBLE_JUMPCALL
                    | (1 << 26)
                    | if negate { 1 << 25 } else { 0 }
                    | (test.to_bits() << 16)
                    | u32::from(offset as u16)
            }
            Self::Call { target, tail } => {
                NIBBLE_JUMPCALL
                    | FLAG_BIT
                    | if tail { 1 << 26 } else { 0 }
                    | (target.to_bits() << 16)
            }
            Self::EtcIndex { dest, index } => {
                NIBBLE_ETC | (dest.to_bits() << 16) | u32::from(index)
            }
            Self::EtcFill { table, start } => {
                NIBBLE_ETC | (1 << 26) | (table.to_bits() << 16) | u32::from(start)
            }
            Self::Invalid(word) => word,
        }
    }
}

impl Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary { op, dest, lhs, rhs } => write!(f, "{op} {dest} {lhs} {rhs}"),
            Self::GetIndex { dest, table, key } => write!(f, "index {dest} {table}[{key}]"),
            Self::SetIndex { table, key, value } => write!(f, "setindex {table}[{key}] {value}"),
            Self::LoadConst { dest, index, push } => {
                let verb = if *push { "pushk" } else { "loadk" };
                write!(f, "{verb} {dest} k{index}")
            }
            Self::LoadSmall {
                kind,
                dest,
                literal,
                push,
            } => {
                let verb = if *push { "push" } else { "load" };
                match kind {
                    LoadKind::Int => write!(f, "{verb} {dest} {literal}"),
                    LoadKind::Bool => write!(f, "{verb} {dest} {}", *literal != 0),
                    LoadKind::EmptyTable => write!(f, "{verb} {dest} {{}}"),
                    LoadKind::Nil => write!(f, "{verb} {dest} nil"),
                }
            }
            Self::Unary { op, a, b } => write!(f, "{} {a} {b}", format!("{op:?}").to_lowercase()),
            Self::Jump { offset } => write!(f, "jump {offset:+}"),
            Self::JumpIf {
                test,
                offset,
                negate,
            } => {
                if *negate {
                    write!(f, "jumpifnot {test} {offset:+}")
                } else {
                    write!(f, "jumpif {test} {offset:+}")
                }
            }
            Self::Call { target, tail } => {
                if *tail {
                    write!(f, "tailcall {target}")
                } else {
                    write!(f, "call {target}")
                }
            }
            Self::EtcIndex { dest, index } => write!(f, "etc {dest} {index}"),
            Self::EtcFill { table, start } => write!(f, "etcfill {table} {start}"),
            Self::Invalid(word) => write!(f, "invalid {word:#010x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(instr: Instr) {
        assert_eq!(Instr::decode(instr.encode()), instr, "{instr}");
    }

    #[test]
    fn binary_roundtrip() {
        for op in BinOp::ALL {
            roundtrip(Instr::Binary {
                op,
                dest: Reg::value(0),
                lhs: Reg::cell(255),
                rhs: Reg::value(17),
            });
        }
    }

    #[test]
    fn getset_roundtrip() {
        roundtrip(Instr::GetIndex {
            dest: Reg::value(1),
            table: Reg::value(2),
            key: Reg::cell(3),
        });
        roundtrip(Instr::SetIndex {
            table: Reg::cell(4),
            key: Reg::value(5),
            value: Reg::value(6),
        });
    }

    #[test]
    fn load_roundtrip() {
        for push in [false, true] {
            roundtrip(Instr::LoadConst {
                dest: Reg::value(9),
                index: u16::MAX,
                push,
            });
            for kind in LoadKind::ALL {
                roundtrip(Instr::LoadSmall {
                    kind,
                    dest: Reg::cell(9),
                    literal: -1,
                    push,
                });
            }
        }
    }

    #[test]
    fn unary_roundtrip() {
        for op in UnaryOp::ALL {
            roundtrip(Instr::Unary {
                op,
                a: Reg::value(200),
                b: Reg::cell(100),
            });
        }
    }

    #[test]
    fn etc_roundtrip() {
        roundtrip(Instr::EtcIndex {
            dest: Reg::value(3),
            index: 1000,
        });
        roundtrip(Instr::EtcFill {
            table: Reg::value(3),
            start: 0,
        });
    }

    #[test]
    fn jump_offsets_roundtrip_for_every_i16() {
        for offset in i16::MIN..=i16::MAX {
            roundtrip(Instr::Jump { offset });
            roundtrip(Instr::JumpIf {
                test: Reg::value(0),
                offset,
                negate: offset & 1 == 0,
            });
        }
    }

    #[test]
    fn call_roundtrip() {
        for tail in [false, true] {
            roundtrip(Instr::Call {
                target: Reg::value(255),
                tail,
            });
        }
    }

    #[test]
    fn decode_is_total() {
        // Sweep the field-bearing high half exhaustively with a couple of
        // low-bit patterns; decode must classify every word without
        // panicking, and unassigned patterns must come back as Invalid.
        for hi in 0..=u16::MAX {
            for lo in [0x0000_u32, 0xFFFF, 0x5A5A] {
                let word = (u32::from(hi) << 16) | lo;
                let decoded = Instr::decode(word);
                if matches!(Instr::shape(word), Shape::Invalid) {
                    assert_eq!(decoded, Instr::Invalid(word));
                    assert_eq!(decoded.encode(), word);
                }
            }
        }
    }

    #[test]
    fn unassigned_unary_selector_is_invalid() {
        let word = NIBBLE_UNARY | (0xF << 24);
        assert_eq!(Instr::decode(word), Instr::Invalid(word));
    }
}
