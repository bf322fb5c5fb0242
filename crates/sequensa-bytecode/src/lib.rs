//! sequensa-bytecode — the tagged value model, opcode table, and the
//! `TokenReader`/`TokenWriter` codec that moves values in and out of a
//! Sequensa bytecode buffer.
//!
//! Every decoded value borrows from the buffer it was read out of: function
//! bodies, expression operands, flow-controller clauses and stream bodies
//! are all [`sequensa_core::ByteReader`] sub-views rather than copies, so
//! decoding a whole program is a handful of pointer-and-length splits, never
//! a deep clone.

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::vec::Vec;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use sequensa_core::{ByteReader, ByteWriter, CoreError};
use thiserror::Error;

pub mod opcode;

pub use opcode::Opcode;

/* ─────────────────────────── Errors ─────────────────────────── */

/// Errors raised while decoding a bytecode buffer into values — an
/// `InternalError` in spec terms: corrupted or impossible bytecode, never a
/// source-level problem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BytecodeError {
    /// Propagated low-level read failure (EOF, bad width nibble, ...).
    #[error(transparent)]
    Core(#[from] CoreError),
    /// An opcode byte outside `1..=15`.
    #[error("invalid opcode byte {0:#x}")]
    InvalidOpcode(u8),
    /// A `TYP` byte outside `1..=12`.
    #[error("invalid data type byte {0}")]
    InvalidDataType(u8),
    /// A `VMC` byte outside `1..=6`.
    #[error("invalid vm-call byte {0}")]
    InvalidVmCall(u8),
    /// An `EXP` operator byte outside the known operator table.
    #[error("invalid expression operator byte {0}")]
    InvalidOperator(u8),
    /// A name (`VAR`/`DEF`) longer than 128 bytes or containing an illegal character.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(&'static str),
    /// A `NUM` denominator of zero.
    #[error("zero denominator")]
    ZeroDenominator,
}

/// Convenience alias.
pub type BytecodeResult<T> = Result<T, BytecodeError>;

/* ─────────────────────────── Data type tags ─────────────────────────── */

/// The closed set of value variants, doubling as the `TYP` payload (`1..=12`)
/// and as cast/flow-controller targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum DataType {
    /// `Null`.
    Null = 1,
    /// `Bool`.
    Bool = 2,
    /// `Number`.
    Number = 3,
    /// `String`.
    String = 4,
    /// `Type`.
    Type = 5,
    /// `VmCall`.
    VmCall = 6,
    /// `Arg`.
    Arg = 7,
    /// `Name`.
    Name = 8,
    /// `Function`.
    Function = 9,
    /// `Expression`.
    Expression = 10,
    /// `Flowc`.
    Flowc = 11,
    /// `Stream`.
    Stream = 12,
}

impl DataType {
    /// Decode a `TYP` payload byte.
    pub fn from_byte(b: u8) -> BytecodeResult<Self> {
        Ok(match b {
            1 => Self::Null,
            2 => Self::Bool,
            3 => Self::Number,
            4 => Self::String,
            5 => Self::Type,
            6 => Self::VmCall,
            7 => Self::Arg,
            8 => Self::Name,
            9 => Self::Function,
            10 => Self::Expression,
            11 => Self::Flowc,
            12 => Self::Stream,
            other => return Err(BytecodeError::InvalidDataType(other)),
        })
    }
}

/// VM-call sentinels (`VMC`, payload `1..=6`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum VmCall {
    /// Append the accumulator to the output stream and keep iterating.
    Return = 1,
    /// Stop the function body, discarding further iterations.
    Break = 2,
    /// Unwind to the top-level `execute` call with the accumulator as the program result.
    Exit = 3,
    /// Splice the accumulator back into the input stream right after the current position.
    Again = 4,
    /// Ensure the accumulator is non-empty (insert `Null` if it is) and continue the scan.
    Emit = 5,
    /// Like `Break`, but append the current accumulator first.
    Final = 6,
}

impl VmCall {
    /// Decode a `VMC` payload byte.
    pub fn from_byte(b: u8) -> BytecodeResult<Self> {
        Ok(match b {
            1 => Self::Return,
            2 => Self::Break,
            3 => Self::Exit,
            4 => Self::Again,
            5 => Self::Emit,
            6 => Self::Final,
            other => return Err(BytecodeError::InvalidVmCall(other)),
        })
    }
}

/// Expression operator table. The byte payload of an `EXP` record.
///
/// Exactly 20 operators (spec §4.3 "`EXP=11`: one operator byte (1..20)"),
/// grounded on the original `ExprOperator` enum in `SeqAPI.hpp`: `<=`/`!>`
/// collapse into one `NotGreater` opcode and `>=`/`!<` collapse into one
/// `NotLess` opcode, rather than four separate comparison opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum ExprOperator {
    /// `!` — logical not (unary, right operand only).
    Not = 1,
    /// `~` — bitwise complement (unary, right operand only).
    BinaryNot = 2,
    /// `+`
    Add = 3,
    /// `-`
    Sub = 4,
    /// `*`
    Mul = 5,
    /// `/`
    Div = 6,
    /// `%`
    Mod = 7,
    /// `**`
    Pow = 8,
    /// `&`
    BitAnd = 9,
    /// `|`
    BitOr = 10,
    /// `^`
    BitXor = 11,
    /// `=`
    Eq = 12,
    /// `!=`
    NotEq = 13,
    /// `>`
    Gt = 14,
    /// `<`
    Lt = 15,
    /// `<=` or `!>` — not greater than.
    NotGreater = 16,
    /// `>=` or `!<` — not less than.
    NotLess = 17,
    /// `&&`
    And = 18,
    /// `||`
    Or = 19,
    /// `^^` — logical xor.
    Xor = 20,
}

impl ExprOperator {
    /// Decode an `EXP` operator byte.
    pub fn from_byte(b: u8) -> BytecodeResult<Self> {
        Ok(match b {
            1 => Self::Not,
            2 => Self::BinaryNot,
            3 => Self::Add,
            4 => Self::Sub,
            5 => Self::Mul,
            6 => Self::Div,
            7 => Self::Mod,
            8 => Self::Pow,
            9 => Self::BitAnd,
            10 => Self::BitOr,
            11 => Self::BitXor,
            12 => Self::Eq,
            13 => Self::NotEq,
            14 => Self::Gt,
            15 => Self::Lt,
            16 => Self::NotGreater,
            17 => Self::NotLess,
            18 => Self::And,
            19 => Self::Or,
            20 => Self::Xor,
            other => return Err(BytecodeError::InvalidOperator(other)),
        })
    }

    /// True for operators that only consult their right operand (`!`, `~`).
    #[must_use]
    pub const fn is_unary(self) -> bool { matches!(self, Self::Not | Self::BinaryNot) }

    /// True for the integer-truncating operators (`%`, `&`, `|`, `^`, `~`), per spec §4.7.
    #[must_use]
    pub const fn truncates_to_integer(self) -> bool {
        matches!(self, Self::Mod | Self::BitAnd | Self::BitOr | Self::BitXor | Self::BinaryNot)
    }
}

/* ─────────────────────────── Tags ─────────────────────────── */

bitflags::bitflags! {
    /// Scope-iteration tag bits attached to a stream record (`SSL`), and to
    /// the executor's notion of "where in the input are we right now".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct Tags: u8 {
        /// Runs only on the first input value.
        const FIRST = 0x01;
        /// Runs only on the last input value.
        const LAST  = 0x02;
        /// Runs only on the synthetic iteration past the end of the input.
        const END   = 0x04;
    }
}

impl Tags {
    /// Compute the active tags for position `pos` out of `end` total values
    /// (`end` is the input length; `pos == end` is the synthetic extra
    /// iteration). Ported from the original `packTags`.
    #[must_use]
    pub fn for_position(pos: usize, end: usize) -> Self {
        if pos == end {
            return Tags::END;
        }
        let mut t = Tags::empty();
        if pos == 0 {
            t |= Tags::FIRST;
        }
        if end > 0 && pos == end - 1 {
            t |= Tags::LAST;
        }
        t
    }

    /// Whether a stream record whose mask is `self` should run given the
    /// current active tags, per spec §4.7's tag-matching rule. Ported
    /// directly from the original `Stream::machesTags`: the *active*
    /// iteration's `END` bit is checked first and unconditionally gates out
    /// every non-`END` record, tagged or not.
    #[must_use]
    pub fn matches(self, active: Tags) -> bool {
        if active.contains(Tags::END) {
            return self.contains(Tags::END);
        }
        if self.is_empty() {
            return true;
        }
        if self.contains(Tags::FIRST) {
            return active.contains(Tags::FIRST);
        }
        if self.contains(Tags::LAST) {
            return active.contains(Tags::LAST);
        }
        // self.contains(Tags::END) here: waiting for the end tag, not there yet.
        false
    }
}

/* ─────────────────────────── Fraction ─────────────────────────── */

/// A `Number`'s exact rational representation: signed numerator over a
/// positive denominator, plus the double view used for arithmetic.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Fraction {
    /// Signed numerator.
    pub num: i64,
    /// Positive denominator (never zero).
    pub den: u64,
}

impl Fraction {
    /// Build a fraction, rejecting a zero denominator.
    pub fn new(num: i64, den: u64) -> BytecodeResult<Self> {
        if den == 0 {
            return Err(BytecodeError::ZeroDenominator);
        }
        Ok(Self { num, den }.reduced())
    }

    /// An integer-valued fraction (denominator 1).
    #[must_use]
    pub const fn integer(n: i64) -> Self { Self { num: n, den: 1 } }

    /// Reduce by the gcd of `|num|` and `den`.
    #[must_use]
    pub fn reduced(self) -> Self {
        let g = gcd(self.num.unsigned_abs(), self.den).max(1);
        Self { num: self.num / g as i64, den: self.den / g }
    }

    /// Whether this fraction is an exact integer (denominator 1).
    #[must_use]
    pub const fn is_integer(self) -> bool { self.den == 1 }

    /// Double view, for arithmetic and casts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 { self.num as f64 / self.den as f64 }

    /// Build from a double: an exact integer when the value is whole, else a
    /// fixed denominator of 1,000,000 (matching the original's decimal
    /// literal parse path for non-integral source numbers).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_f64(v: f64) -> Self {
        if v.is_finite() && v.fract() == 0.0 {
            Self::integer(v as i64)
        } else {
            Self { num: (v * 1_000_000.0).round() as i64, den: 1_000_000 }.reduced()
        }
    }
}

impl PartialEq for Fraction {
    fn eq(&self, other: &Self) -> bool { (self.as_f64() - other.as_f64()).abs() < f64::EPSILON }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/* ─────────────────────────── Value model ─────────────────────────── */

/// A decoded bytecode value together with its anchor bit (spec §3: "every
/// value additionally carries an anchor bit").
#[derive(Debug, Clone)]
pub struct Value<'a> {
    /// Whether this value acts on the accumulator to its right during stream evaluation.
    pub anchor: bool,
    /// The value's payload.
    pub kind: ValueKind<'a>,
}

impl<'a> Value<'a> {
    /// Build a value.
    #[must_use]
    pub const fn new(anchor: bool, kind: ValueKind<'a>) -> Self { Self { anchor, kind } }

    /// This value's [`DataType`].
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match &self.kind {
            ValueKind::Null => DataType::Null,
            ValueKind::Bool(_) => DataType::Bool,
            ValueKind::Number(_) => DataType::Number,
            ValueKind::String(_) => DataType::String,
            ValueKind::Type(_) => DataType::Type,
            ValueKind::VmCall(_) => DataType::VmCall,
            ValueKind::Arg(_) => DataType::Arg,
            ValueKind::Name { .. } => DataType::Name,
            ValueKind::Function(_) => DataType::Function,
            ValueKind::Expression { .. } => DataType::Expression,
            ValueKind::Flowc(_) => DataType::Flowc,
            ValueKind::Stream { .. } => DataType::Stream,
        }
    }

    /// Return a copy of this value with the anchor bit cleared.
    #[must_use]
    pub fn unanchored(&self) -> Self { Self { anchor: false, kind: self.kind.clone() } }

    /// Return a copy of this value with the anchor bit forced to `anchor`.
    #[must_use]
    pub fn with_anchor(&self, anchor: bool) -> Self { Self { anchor, kind: self.kind.clone() } }
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool { self.anchor == other.anchor && self.kind == other.kind }
}

/// The payload half of a [`Value`].
#[derive(Debug, Clone)]
pub enum ValueKind<'a> {
    /// `NIL`.
    Null,
    /// `BLT`/`BLF`.
    Bool(bool),
    /// `NUM`/`INT`.
    Number(Fraction),
    /// `STR`.
    String(Vec<u8>),
    /// `TYP`.
    Type(DataType),
    /// `VMC`.
    VmCall(VmCall),
    /// `ARG` — argument level.
    Arg(u8),
    /// `VAR`/`DEF`.
    Name {
        /// `true` for `DEF` (binding site), `false` for `VAR` (reference).
        define: bool,
        /// ASCII identifier, `[A-Za-z0-9_:]`, ≤128 bytes.
        name: Vec<u8>,
    },
    /// `FUN` — a lazily-held function body.
    Function(ByteReader<'a>),
    /// `EXP` — an operator plus its two one-value operand sub-readers.
    Expression {
        /// The operator.
        op: ExprOperator,
        /// Left operand sub-reader.
        left: ByteReader<'a>,
        /// Right operand sub-reader.
        right: ByteReader<'a>,
    },
    /// `FLC` — an ordered list of flow clauses; any clause matching admits the input.
    Flowc(Vec<FlowClause<'a>>),
    /// `SSL` — only appears inside function bodies.
    Stream {
        /// The tag mask selecting which scope iterations run this record.
        tags: Tags,
        /// The record's value-list body.
        body: ByteReader<'a>,
    },
}

impl PartialEq for ValueKind<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Type(a), Self::Type(b)) => a == b,
            (Self::VmCall(a), Self::VmCall(b)) => a == b,
            (Self::Arg(a), Self::Arg(b)) => a == b,
            (Self::Name { define: da, name: na }, Self::Name { define: db, name: nb }) => da == db && na == nb,
            (Self::Function(a), Self::Function(b)) => a.remaining() == b.remaining(),
            (Self::Expression { op: oa, .. }, Self::Expression { op: ob, .. }) => oa == ob,
            (Self::Flowc(a), Self::Flowc(b)) => a.len() == b.len(),
            (Self::Stream { tags: ta, .. }, Self::Stream { tags: tb, .. }) => ta == tb,
            _ => false,
        }
    }
}

/// One clause of a `Flowc` filter.
#[derive(Debug, Clone)]
pub enum FlowClause<'a> {
    /// Passes values equal to the held primitive.
    Value(Value<'a>),
    /// Passes values whose data type matches.
    Type(DataType),
    /// Passes `Number`s strictly between `lo` and `hi`.
    Range(Fraction, Fraction),
}

/* ─────────────────────────── Token reader ─────────────────────────── */

const MAX_NAME_LEN: usize = 128;

fn is_name_byte(b: u8) -> bool { b.is_ascii_alphanumeric() || b == b'_' || b == b':' }

fn read_name(bytes: &[u8]) -> BytecodeResult<Vec<u8>> {
    if bytes.len() > MAX_NAME_LEN {
        return Err(BytecodeError::InvalidIdentifier("longer than 128 bytes"));
    }
    if !bytes.iter().all(|&b| is_name_byte(b)) {
        return Err(BytecodeError::InvalidIdentifier("character outside [A-Za-z0-9_:]"));
    }
    Ok(bytes.to_vec())
}

fn read_signed_fraction(r: &mut ByteReader<'_>, wn: u8, wd: u8) -> BytecodeResult<Fraction> {
    let raw_num = r.take_len(wn)?;
    let num = if wn == 0 {
        0
    } else {
        let sign_bit = 1u64 << (u64::from(wn) * 8 - 1);
        if raw_num & sign_bit != 0 {
            -((raw_num & !sign_bit) as i64)
        } else {
            raw_num as i64
        }
    };
    let den = r.take_len(wd)?.max(1);
    Fraction::new(num, den)
}

/// Decode one value out of `r`. Nested bodies (function/expression
/// operands/flow clauses/stream records) become fresh sub-readers carved out
/// of `r` rather than copies — see spec §4.3.
pub fn read_value<'a>(r: &mut ByteReader<'a>) -> BytecodeResult<Value<'a>> {
    let (anchor, op) = r.take_opcode();
    let kind = match op {
        opcode::BLT => ValueKind::Bool(true),
        opcode::BLF => ValueKind::Bool(false),
        opcode::NIL => ValueKind::Null,
        opcode::NUM => {
            let (wn, wd) = r.take_head();
            ValueKind::Number(read_signed_fraction(r, wn, wd)?)
        }
        opcode::INT => {
            let b = r.take_byte() as i8;
            ValueKind::Number(Fraction::integer(i64::from(b)))
        }
        opcode::STR => ValueKind::String(r.take_cstr()?),
        opcode::TYP => ValueKind::Type(DataType::from_byte(r.take_byte())?),
        opcode::VMC => ValueKind::VmCall(VmCall::from_byte(r.take_byte())?),
        opcode::ARG => ValueKind::Arg(r.take_byte()),
        opcode::FUN => {
            let (w, _) = r.take_head();
            let len = r.take_len(w)? as usize;
            ValueKind::Function(r.take_block(len)?)
        }
        opcode::EXP => {
            let operator = ExprOperator::from_byte(r.take_byte())?;
            let (wl, wr) = r.take_head();
            let llen = r.take_len(wl)? as usize;
            let rlen = r.take_len(wr)? as usize;
            let left = r.take_block(llen)?;
            let right = r.take_block(rlen)?;
            ValueKind::Expression { op: operator, left, right }
        }
        opcode::VAR => ValueKind::Name { define: false, name: read_name(&r.take_cstr()?)? },
        opcode::DEF => ValueKind::Name { define: true, name: read_name(&r.take_cstr()?)? },
        opcode::FLC => {
            let count = r.take_byte();
            let mut clauses = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (w, _) = r.take_head();
                let len = r.take_len(w)? as usize;
                let mut block = r.take_block(len)?;
                clauses.push(read_flow_clause(&mut block)?);
            }
            ValueKind::Flowc(clauses)
        }
        opcode::SSL => {
            let tag_byte = r.take_byte();
            let tags = Tags::from_bits_truncate(tag_byte);
            let (w, _) = r.take_head();
            let len = r.take_len(w)? as usize;
            ValueKind::Stream { tags, body: r.take_block(len)? }
        }
        other => return Err(BytecodeError::InvalidOpcode(other)),
    };
    Ok(Value::new(anchor, kind))
}

fn read_flow_clause<'a>(r: &mut ByteReader<'a>) -> BytecodeResult<FlowClause<'a>> {
    let first = read_value(r)?;
    if r.has_next() {
        let second = read_value(r)?;
        let lo = as_number(&first)?;
        let hi = as_number(&second)?;
        Ok(FlowClause::Range(lo, hi))
    } else if let ValueKind::Type(t) = first.kind {
        Ok(FlowClause::Type(t))
    } else {
        Ok(FlowClause::Value(first))
    }
}

fn as_number(v: &Value<'_>) -> BytecodeResult<Fraction> {
    match v.kind {
        ValueKind::Number(f) => Ok(f),
        _ => Err(BytecodeError::InvalidIdentifier("range clause bound must be a Number")),
    }
}

/* ─────────────────────────── Token writer ─────────────────────────── */

/// Already-encoded bytes of a value's nested children, supplied by the
/// caller of [`write_value`] (the assembler encodes bottom-up, so a
/// function/expression/flowc/stream's children are always ready before the
/// parent opcode is written).
pub enum EncodedChildren<'a> {
    /// No children (leaf values).
    None,
    /// One nested body (`FUN`, `SSL`).
    One(&'a [u8]),
    /// Two nested bodies (`EXP`'s left/right operands).
    Two(&'a [u8], &'a [u8]),
    /// A list of nested bodies (`FLC`'s clauses).
    Many(&'a [&'a [u8]]),
}

impl<'a> EncodedChildren<'a> {
    fn single(&self) -> &'a [u8] {
        match self {
            Self::One(b) => b,
            _ => &[],
        }
    }
    fn pair(&self) -> (&'a [u8], &'a [u8]) {
        match self {
            Self::Two(l, r) => (l, r),
            _ => (&[], &[]),
        }
    }
    fn many(&self) -> &[&'a [u8]] {
        match self {
            Self::Many(m) => m,
            _ => &[],
        }
    }
}

/// Encode `value` onto `w`. The inverse of [`read_value`]; nested bodies
/// must already be fully-formed byte slices (produced by, e.g., the
/// assembler calling this function bottom-up).
pub fn write_value(w: &mut ByteWriter, value: &Value<'_>, children: EncodedChildren<'_>) {
    match &value.kind {
        ValueKind::Bool(true) => w.write_opcode(value.anchor, opcode::BLT),
        ValueKind::Bool(false) => w.write_opcode(value.anchor, opcode::BLF),
        ValueKind::Null => w.write_opcode(value.anchor, opcode::NIL),
        ValueKind::Number(f) if f.is_integer() && (-128..=127).contains(&f.num) => {
            w.write_opcode(value.anchor, opcode::INT);
            #[allow(clippy::cast_possible_truncation)]
            w.write_u8(f.num as i8 as u8);
        }
        ValueKind::Number(f) => {
            w.write_opcode(value.anchor, opcode::NUM);
            write_fraction(w, *f);
        }
        ValueKind::String(s) => {
            w.write_opcode(value.anchor, opcode::STR);
            w.write_cstr(s);
        }
        ValueKind::Type(t) => {
            w.write_opcode(value.anchor, opcode::TYP);
            w.write_u8(*t as u8);
        }
        ValueKind::VmCall(c) => {
            w.write_opcode(value.anchor, opcode::VMC);
            w.write_u8(*c as u8);
        }
        ValueKind::Arg(level) => {
            w.write_opcode(value.anchor, opcode::ARG);
            w.write_u8(*level);
        }
        ValueKind::Name { define, name } => {
            w.write_opcode(value.anchor, if *define { opcode::DEF } else { opcode::VAR });
            w.write_cstr(name);
        }
        ValueKind::Function(_) => {
            let body = children.single();
            w.write_opcode(value.anchor, opcode::FUN);
            let width = sequensa_core::width_for_value(body.len() as u64);
            w.write_head(width, 0);
            w.write_len(width, body.len() as u64);
            w.append_buffer(body);
        }
        ValueKind::Expression { op, .. } => {
            let (left, right) = children.pair();
            w.write_opcode(value.anchor, opcode::EXP);
            w.write_u8(*op as u8);
            let wl = sequensa_core::width_for_value(left.len() as u64);
            let wr = sequensa_core::width_for_value(right.len() as u64);
            w.write_head(wl, wr);
            w.write_len(wl, left.len() as u64);
            w.write_len(wr, right.len() as u64);
            w.append_buffer(left);
            w.append_buffer(right);
        }
        ValueKind::Flowc(_) => {
            let clauses = children.many();
            w.write_opcode(value.anchor, opcode::FLC);
            #[allow(clippy::cast_possible_truncation)]
            w.write_u8(clauses.len() as u8);
            for c in clauses {
                let width = sequensa_core::width_for_value(c.len() as u64);
                w.write_head(width, 0);
                w.write_len(width, c.len() as u64);
                w.append_buffer(c);
            }
        }
        ValueKind::Stream { tags, .. } => {
            let body = children.single();
            w.write_opcode(value.anchor, opcode::SSL);
            w.write_u8(tags.bits());
            let width = sequensa_core::width_for_value(body.len() as u64);
            w.write_head(width, 0);
            w.write_len(width, body.len() as u64);
            w.append_buffer(body);
        }
    }
}

fn write_fraction(w: &mut ByteWriter, f: Fraction) {
    let mag = f.num.unsigned_abs();
    let wn = signed_width(mag);
    let wd = sequensa_core::width_for_value(f.den).max(1);
    w.write_head(wn, wd);
    if wn > 0 {
        let sign_bit = 1u64 << (u64::from(wn) * 8 - 1);
        let encoded = if f.num < 0 { mag | sign_bit } else { mag };
        w.write_len(wn, encoded);
    }
    w.write_len(wd, f.den);
}

const fn signed_width(mag: u64) -> u8 {
    if mag == 0 {
        0
    } else if mag <= 0x7F {
        1
    } else if mag <= 0x7FFF {
        2
    } else if mag <= 0x7FFF_FFFF {
        4
    } else {
        8
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use proptest::prelude::*;

    #[test]
    fn bool_roundtrip() {
        let mut w = ByteWriter::new();
        write_value(&mut w, &Value::new(true, ValueKind::Bool(true)), EncodedChildren::None);
        write_value(&mut w, &Value::new(false, ValueKind::Bool(false)), EncodedChildren::None);
        let bytes = w.into_vec();
        let mut r = ByteReader::new(&bytes);
        pretty_assert_eq!(read_value(&mut r).unwrap(), Value::new(true, ValueKind::Bool(true)));
        pretty_assert_eq!(read_value(&mut r).unwrap(), Value::new(false, ValueKind::Bool(false)));
    }

    #[test]
    fn small_integer_uses_int_opcode() {
        let mut w = ByteWriter::new();
        write_value(&mut w, &Value::new(false, ValueKind::Number(Fraction::integer(42))), EncodedChildren::None);
        let bytes = w.into_vec();
        assert_eq!(bytes[0], opcode::INT);
    }

    #[test]
    fn negative_number_roundtrip() {
        let f = Fraction::new(-7, 3).unwrap();
        let mut w = ByteWriter::new();
        write_value(&mut w, &Value::new(false, ValueKind::Number(f)), EncodedChildren::None);
        let bytes = w.into_vec();
        let mut r = ByteReader::new(&bytes);
        let v = read_value(&mut r).unwrap();
        match v.kind {
            ValueKind::Number(got) => assert!((got.as_f64() - f.as_f64()).abs() < 1e-9),
            _ => panic!("expected Number"),
        }
    }

    #[test]
    fn string_roundtrip() {
        let mut w = ByteWriter::new();
        write_value(&mut w, &Value::new(false, ValueKind::String(b"hello world".to_vec())), EncodedChildren::None);
        let bytes = w.into_vec();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(
            read_value(&mut r).unwrap(),
            Value::new(false, ValueKind::String(b"hello world".to_vec()))
        );
    }

    #[test]
    fn function_body_is_a_sub_reader() {
        let mut inner = ByteWriter::new();
        write_value(&mut inner, &Value::new(false, ValueKind::Null), EncodedChildren::None);
        let inner_bytes = inner.into_vec();

        let mut w = ByteWriter::new();
        write_value(
            &mut w,
            &Value::new(true, ValueKind::Function(ByteReader::new(&inner_bytes))),
            EncodedChildren::One(&inner_bytes),
        );
        let bytes = w.into_vec();

        let mut r = ByteReader::new(&bytes);
        let v = read_value(&mut r).unwrap();
        assert!(v.anchor);
        match v.kind {
            ValueKind::Function(mut body) => {
                let inner_val = read_value(&mut body).unwrap();
                assert_eq!(inner_val.kind, ValueKind::Null);
            }
            _ => panic!("expected Function"),
        }
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn tags_for_position() {
        assert_eq!(Tags::for_position(0, 3), Tags::FIRST);
        assert_eq!(Tags::for_position(2, 3), Tags::LAST);
        assert_eq!(Tags::for_position(3, 3), Tags::END);
        assert_eq!(Tags::for_position(1, 3), Tags::empty());
    }

    #[test]
    fn tag_matching_rule() {
        let end_only = Tags::END;
        assert!(end_only.matches(Tags::END));
        assert!(!end_only.matches(Tags::FIRST));

        let untagged = Tags::empty();
        assert!(untagged.matches(Tags::FIRST));
        assert!(untagged.matches(Tags::empty()));

        let first_or_last = Tags::FIRST | Tags::LAST;
        assert!(first_or_last.matches(Tags::FIRST));
        assert!(!first_or_last.matches(Tags::END));
    }

    #[test]
    fn untagged_record_does_not_fire_on_the_end_iteration() {
        // The active iteration's END bit must gate out every non-END record,
        // tagged or not -- an untagged record is not an implicit END record.
        let untagged = Tags::empty();
        assert!(!untagged.matches(Tags::END));

        let first_or_last = Tags::FIRST | Tags::LAST;
        assert!(!first_or_last.matches(Tags::END));
    }

    #[test]
    fn zero_denominator_rejected() {
        assert_eq!(Fraction::new(1, 0), Err(BytecodeError::ZeroDenominator));
    }

    #[test]
    fn invalid_opcode_is_an_error() {
        let data = [0x7Fu8]; // opcode id 127, way past 15
        let mut r = ByteReader::new(&data);
        assert!(matches!(read_value(&mut r), Err(BytecodeError::InvalidOpcode(127))));
    }

    proptest! {
        #[test]
        fn fraction_from_f64_roundtrips_integers(n in -1_000_000i64..1_000_000) {
            let f = Fraction::from_f64(n as f64);
            prop_assert!(f.is_integer());
            prop_assert!((f.as_f64() - n as f64).abs() < 1e-9);
        }

        #[test]
        fn expr_operator_byte_roundtrips(b in 1u8..=20) {
            let op = ExprOperator::from_byte(b).unwrap();
            prop_assert_eq!(op as u8, b);
        }

        #[test]
        fn expr_operator_byte_outside_1_20_is_rejected(b in 21u8..=255) {
            prop_assert!(ExprOperator::from_byte(b).is_err());
        }
    }
}
