//! One-byte opcode ids (`1..=15`). The opcode byte itself also carries the
//! anchor flag in its high bit — see [`sequensa_core::ByteReader::take_opcode`].

/// `true`/`false` boolean literal (no payload; split into two ids so the
/// decoder never needs a second byte for booleans).
pub const BLT: u8 = 1;
/// See [`BLT`].
pub const BLF: u8 = 2;
/// Null literal (no payload).
pub const NIL: u8 = 3;
/// Rational number: head nibble pair + signed numerator + positive denominator.
pub const NUM: u8 = 4;
/// Single signed byte integer, denominator implicitly 1. Preferred encoding
/// whenever the value fits.
pub const INT: u8 = 5;
/// NUL-terminated byte string.
pub const STR: u8 = 6;
/// `DataType` tag, one byte in `1..=12`.
pub const TYP: u8 = 7;
/// VM-call sentinel, one byte in `1..=6`.
pub const VMC: u8 = 8;
/// Argument reference, one byte (scope level).
pub const ARG: u8 = 9;
/// Function body: length-prefixed nested buffer.
pub const FUN: u8 = 10;
/// Expression: operator byte + two length-prefixed operand buffers.
pub const EXP: u8 = 11;
/// Name reference (variable read).
pub const VAR: u8 = 12;
/// Name definition (variable binding site).
pub const DEF: u8 = 13;
/// Flow controller: clause count + length-prefixed clause bodies.
pub const FLC: u8 = 14;
/// Stream record: tag byte + length-prefixed value-list body.
pub const SSL: u8 = 15;

/// Typed view over the raw opcode id, for code that wants to `match` on
/// something named rather than a bare `u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// See [`BLT`].
    True = BLT,
    /// See [`BLF`].
    False = BLF,
    /// See [`NIL`].
    Null = NIL,
    /// See [`NUM`].
    Number = NUM,
    /// See [`INT`].
    Integer = INT,
    /// See [`STR`].
    String = STR,
    /// See [`TYP`].
    Type = TYP,
    /// See [`VMC`].
    VmCall = VMC,
    /// See [`ARG`].
    Arg = ARG,
    /// See [`FUN`].
    Function = FUN,
    /// See [`EXP`].
    Expression = EXP,
    /// See [`VAR`].
    Var = VAR,
    /// See [`DEF`].
    Def = DEF,
    /// See [`FLC`].
    Flowc = FLC,
    /// See [`SSL`].
    Stream = SSL,
}

impl Opcode {
    /// Map a raw opcode id to its typed form.
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            BLT => Self::True,
            BLF => Self::False,
            NIL => Self::Null,
            NUM => Self::Number,
            INT => Self::Integer,
            STR => Self::String,
            TYP => Self::Type,
            VMC => Self::VmCall,
            ARG => Self::Arg,
            FUN => Self::Function,
            EXP => Self::Expression,
            VAR => Self::Var,
            DEF => Self::Def,
            FLC => Self::Flowc,
            SSL => Self::Stream,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_id_is_in_range() {
        for id in [BLT, BLF, NIL, NUM, INT, STR, TYP, VMC, ARG, FUN, EXP, VAR, DEF, FLC, SSL] {
            assert!((1..=15).contains(&id));
            assert!(Opcode::from_id(id).is_some());
        }
    }

    #[test]
    fn out_of_range_id_has_no_opcode() {
        assert!(Opcode::from_id(0).is_none());
        assert!(Opcode::from_id(16).is_none());
    }
}
