//! Compiled bytecode units.
//!
//! A [`Unit`] is what the external compiler hands the engine: a tree of
//! [`Chunk`]s, each an immutable sequence of instruction words plus a
//! constant pool and an optional line table. Units support a stable binary
//! marshaled form for caching compiled output; the format is tag-prefixed
//! and little-endian, and `marshal -> unmarshal -> marshal` is
//! byte-identical.

use std::fmt::{self, Display};
use std::str;
use std::sync::Arc;

use crate::instruction::Instr;
use crate::runtime::symbol::Symbol;

/// One compiled function body.
///
/// Chunks are immutable once built and shared by reference between the
/// closures instantiated from them.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// The name of the source this chunk was compiled from.
    pub source: Symbol,
    /// The function's name, for tracebacks.
    pub name: Symbol,
    /// How many value registers an activation of this chunk needs.
    pub register_count: u16,
    /// How many cell registers an activation of this chunk needs, counting
    /// captured upvalues.
    pub cell_count: u16,
    /// How many of the cells are upvalues wired in from the enclosing scope.
    pub upvalue_count: u16,
    /// The source-level names of the upvalues, parallel to their indexes.
    pub upvalue_names: Vec<Symbol>,
    /// The constant pool.
    pub constants: Vec<Constant>,
    /// The encoded instruction words.
    pub words: Vec<u32>,
    /// Line numbers parallel to `words`, when the compiler kept them.
    pub lines: Option<Vec<u32>>,
}

impl Chunk {
    /// Returns a builder for hand-assembling a chunk.
    #[must_use]
    pub fn builder(source: impl Into<Symbol>, name: impl Into<Symbol>) -> ChunkBuilder {
        ChunkBuilder {
            chunk: Chunk {
                source: source.into(),
                name: name.into(),
                register_count: 0,
                cell_count: 0,
                upvalue_count: 0,
                upvalue_names: Vec::new(),
                constants: Vec::new(),
                words: Vec::new(),
                lines: None,
            },
        }
    }

    /// Returns the source line of the instruction at `pc`, if known.
    #[must_use]
    pub fn line(&self, pc: usize) -> Option<u32> {
        self.lines.as_ref().and_then(|lines| lines.get(pc).copied())
    }

    fn marshal_into(&self, out: &mut Vec<u8>) {
        marshal_str(&self.source, out);
        marshal_str(&self.name, out);
        out.extend_from_slice(&self.register_count.to_le_bytes());
        out.extend_from_slice(&self.cell_count.to_le_bytes());
        out.extend_from_slice(&self.upvalue_count.to_le_bytes());
        marshal_len(self.upvalue_names.len(), out);
        for name in &self.upvalue_names {
            marshal_str(name, out);
        }
        marshal_len(self.constants.len(), out);
        for constant in &self.constants {
            constant.marshal_into(out);
        }
        marshal_len(self.words.len(), out);
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        match &self.lines {
            None => out.push(0),
            Some(lines) => {
                out.push(1);
                marshal_len(lines.len(), out);
                for line in lines {
                    out.extend_from_slice(&line.to_le_bytes());
                }
            }
        }
    }

    fn unmarshal_from(input: &mut Reader<'_>) -> Result<Self, UnitError> {
        let source = input.str()?;
        let name = input.str()?;
        let register_count = input.u16()?;
        let cell_count = input.u16()?;
        let upvalue_count = input.u16()?;
        let upvalue_names = input.counted(Reader::str)?;
        let constants = input.counted(Constant::unmarshal_from)?;
        let words = input.counted(Reader::u32)?;
        let lines = match input.u8()? {
            0 => None,
            1 => Some(input.counted(Reader::u32)?),
            tag => return Err(UnitError::BadTag(tag)),
        };
        Ok(Self {
            source,
            name,
            register_count,
            cell_count,
            upvalue_count,
            upvalue_names,
            constants,
            words,
            lines,
        })
    }
}

impl Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function {} <{}> regs={} cells={} upvals={}",
            self.name, self.source, self.register_count, self.cell_count, self.upvalue_count
        )?;
        for (pc, word) in self.words.iter().enumerate() {
            write!(f, "  {pc:4}  {}", Instr::decode(*word))?;
            if let Some(line) = self.line(pc) {
                write!(f, "  ; line {line}")?;
            }
            writeln!(f)?;
        }
        for constant in &self.constants {
            if let Constant::Code(inner) = constant {
                Display::fmt(inner, f)?;
            }
        }
        Ok(())
    }
}

/// Incrementally assembles a [`Chunk`].
pub struct ChunkBuilder {
    chunk: Chunk,
}

impl ChunkBuilder {
    #[must_use]
    pub fn registers(mut self, count: u16) -> Self {
        self.chunk.register_count = count;
        self
    }

    #[must_use]
    pub fn cells(mut self, count: u16) -> Self {
        self.chunk.cell_count = count;
        self
    }

    #[must_use]
    pub fn upvalues<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.chunk.upvalue_names = names.into_iter().map(Symbol::from).collect();
        self.chunk.upvalue_count =
            u16::try_from(self.chunk.upvalue_names.len()).expect("too many upvalues");
        self
    }

    /// Adds `constant` to the pool, reusing an existing entry when one
    /// compares equal, and returns its index.
    pub fn constant(&mut self, constant: Constant) -> u16 {
        let index = self
            .chunk
            .constants
            .iter()
            .position(|existing| *existing == constant)
            .unwrap_or_else(|| {
                self.chunk.constants.push(constant);
                self.chunk.constants.len() - 1
            });
        u16::try_from(index).expect("constant pool overflow")
    }

    /// Encodes and appends `instr`, returning its index.
    pub fn instr(&mut self, instr: Instr) -> usize {
        self.chunk.words.push(instr.encode());
        self.chunk.words.len() - 1
    }

    /// Replaces the word at `pc`. Used to backpatch jump offsets.
    pub fn patch(&mut self, pc: usize, instr: Instr) {
        self.chunk.words[pc] = instr.encode();
    }

    /// Attaches a line table parallel to the instructions.
    #[must_use]
    pub fn lines(mut self, lines: Vec<u32>) -> Self {
        self.chunk.lines = Some(lines);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Chunk> {
        Arc::new(self.chunk)
    }
}

/// An entry in a chunk's constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Symbol),
    /// A nested function body.
    Code(Arc<Chunk>),
}

impl Constant {
    const TAG_NIL: u8 = 0;
    const TAG_BOOL: u8 = 1;
    const TAG_INT: u8 = 2;
    const TAG_FLOAT: u8 = 3;
    const TAG_STRING: u8 = 4;
    const TAG_CODE: u8 = 5;

    fn marshal_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Nil => out.push(Self::TAG_NIL),
            Self::Bool(value) => {
                out.push(Self::TAG_BOOL);
                out.push(u8::from(*value));
            }
            Self::Int(value) => {
                out.push(Self::TAG_INT);
                out.extend_from_slice(&value.to_le_bytes());
            }
            Self::Float(value) => {
                out.push(Self::TAG_FLOAT);
                out.extend_from_slice(&value.to_bits().to_le_bytes());
            }
            Self::String(value) => {
                out.push(Self::TAG_STRING);
                marshal_str(value, out);
            }
            Self::Code(chunk) => {
                out.push(Self::TAG_CODE);
                chunk.marshal_into(out);
            }
        }
    }

    fn unmarshal_from(input: &mut Reader<'_>) -> Result<Self, UnitError> {
        match input.u8()? {
            Self::TAG_NIL => Ok(Self::Nil),
            Self::TAG_BOOL => Ok(Self::Bool(input.u8()? != 0)),
            Self::TAG_INT => Ok(Self::Int(i64::from_le_bytes(input.array()?))),
            Self::TAG_FLOAT => Ok(Self::Float(f64::from_bits(u64::from_le_bytes(
                input.array()?,
            )))),
            Self::TAG_STRING => Ok(Self::String(input.str()?)),
            Self::TAG_CODE => Ok(Self::Code(Arc::new(Chunk::unmarshal_from(input)?))),
            tag => Err(UnitError::BadTag(tag)),
        }
    }
}

/// A complete compiled input: the top-level chunk of a script.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub main: Arc<Chunk>,
}

const MAGIC: &[u8; 4] = b"coil";
const VERSION: u8 = 1;

impl Unit {
    #[must_use]
    pub fn new(main: Arc<Chunk>) -> Self {
        Self { main }
    }

    /// Serializes this unit into its cacheable binary form.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.main.words.len() * 4);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        self.main.marshal_into(&mut out);
        out
    }

    /// Deserializes a unit produced by [`Unit::marshal`].
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, UnitError> {
        let mut input = Reader { bytes, pos: 0 };
        if input.bytes.len() < MAGIC.len() || &input.bytes[..MAGIC.len()] != MAGIC {
            return Err(UnitError::BadMagic);
        }
        input.pos = MAGIC.len();
        let version = input.u8()?;
        if version != VERSION {
            return Err(UnitError::UnsupportedVersion(version));
        }
        let main = Arc::new(Chunk::unmarshal_from(&mut input)?);
        if input.pos != input.bytes.len() {
            return Err(UnitError::TrailingBytes);
        }
        Ok(Self { main })
    }
}

impl Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.main, f)
    }
}

/// An error deserializing a marshaled [`Unit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitError {
    /// The input does not start with the unit magic bytes.
    BadMagic,
    /// The input was marshaled by an incompatible engine version.
    UnsupportedVersion(u8),
    /// The input ended in the middle of a structure.
    UnexpectedEof,
    /// An unrecognized tag byte.
    BadTag(u8),
    /// A string constant was not valid UTF-8.
    InvalidUtf8,
    /// Extra bytes after the unit's end.
    TrailingBytes,
}

impl Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => f.write_str("not a marshaled unit"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported unit version {version}")
            }
            Self::UnexpectedEof => f.write_str("unexpected end of input"),
            Self::BadTag(tag) => write!(f, "unrecognized tag byte {tag:#04x}"),
            Self::InvalidUtf8 => f.write_str("string constant is not valid utf-8"),
            Self::TrailingBytes => f.write_str("trailing bytes after unit"),
        }
    }
}

impl std::error::Error for UnitError {}

fn marshal_str(value: &Symbol, out: &mut Vec<u8>) {
    marshal_len(value.len(), out);
    out.extend_from_slice(value.as_bytes());
}

fn marshal_len(len: usize, out: &mut Vec<u8>) {
    let len = u32::try_from(len).expect("structure too large to marshal");
    out.extend_from_slice(&len.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8], UnitError> {
        let end = self.pos.checked_add(len).ok_or(UnitError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(UnitError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], UnitError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, UnitError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, UnitError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, UnitError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize, UnitError> {
        Ok(self.u32()? as usize)
    }

    fn str(&mut self) -> Result<Symbol, UnitError> {
        let len = self.len()?;
        let bytes = self.take(len)?;
        str::from_utf8(bytes)
            .map(Symbol::from)
            .map_err(|_| UnitError::InvalidUtf8)
    }

    fn counted<T>(
        &mut self,
        mut each: impl FnMut(&mut Self) -> Result<T, UnitError>,
    ) -> Result<Vec<T>, UnitError> {
        let count = self.len()?;
        // Guard against absurd counts in corrupt input before allocating.
        let mut out = Vec::with_capacity(count.min(self.bytes.len() - self.pos + 1));
        for _ in 0..count {
            out.push(each(self)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{BinOp, LoadKind, Reg};

    fn sample_unit() -> Unit {
        let mut inner = Chunk::builder("demo.coil", "inner")
            .registers(4)
            .cells(2)
            .upvalues(["x"]);
        inner.constant(Constant::Float(2.5));
        inner.instr(Instr::Jump { offset: -1 });
        let inner = inner.build();

        let mut main = Chunk::builder("demo.coil", "main")
            .registers(8)
            .lines(vec![1, 1, 2]);
        main.constant(Constant::Nil);
        main.constant(Constant::Bool(true));
        main.constant(Constant::Int(-42));
        main.constant(Constant::String(Symbol::from("hello")));
        main.constant(Constant::Code(inner));
        main.instr(Instr::LoadSmall {
            kind: LoadKind::Int,
            dest: Reg::value(0),
            literal: 7,
            push: false,
        });
        main.instr(Instr::Binary {
            op: BinOp::Add,
            dest: Reg::value(1),
            lhs: Reg::value(0),
            rhs: Reg::value(0),
        });
        main.instr(Instr::Jump { offset: 0 });
        Unit::new(main.build())
    }

    #[test]
    fn marshal_roundtrip_is_byte_identical() {
        let unit = sample_unit();
        let bytes = unit.marshal();
        let reloaded = Unit::unmarshal(&bytes).unwrap();
        assert_eq!(reloaded, unit);
        assert_eq!(reloaded.marshal(), bytes);
    }

    #[test]
    fn unmarshal_rejects_bad_magic() {
        assert_eq!(Unit::unmarshal(b"nope"), Err(UnitError::BadMagic));
        assert_eq!(Unit::unmarshal(b""), Err(UnitError::BadMagic));
    }

    #[test]
    fn unmarshal_rejects_bad_version() {
        let mut bytes = sample_unit().marshal();
        bytes[4] = 99;
        assert_eq!(Unit::unmarshal(&bytes), Err(UnitError::UnsupportedVersion(99)));
    }

    #[test]
    fn unmarshal_survives_any_truncation() {
        let bytes = sample_unit().marshal();
        for len in 0..bytes.len() {
            // Every prefix must fail cleanly, never panic.
            assert!(Unit::unmarshal(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn unmarshal_rejects_trailing_bytes() {
        let mut bytes = sample_unit().marshal();
        bytes.push(0);
        assert_eq!(Unit::unmarshal(&bytes), Err(UnitError::TrailingBytes));
    }
}
