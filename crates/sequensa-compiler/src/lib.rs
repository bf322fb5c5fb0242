//! sequensa-compiler — token classification and the recursive-descent
//! assembler that turns a classified token list into a Sequensa bytecode
//! buffer.
//!
//! `classify` assigns each raw lexeme a semantic category (keyword, data
//! type, VM-call, operator with precedence, ...); [`compile`] then drives
//! the assembler (`assemble_function` → `assemble_stream` →
//! `assemble_expression`/`assemble_flowc`/`assemble_primitive`) to emit a
//! bare sequence of stream records — no outer `FUN` wrapper, matching the
//! buffer shape the executor expects at the program's top level.

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::{string::String, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{format, string::String, vec::Vec};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use sequensa_bytecode::{
    self as bc, BytecodeError, DataType, EncodedChildren, ExprOperator, Fraction, Tags, Value, ValueKind, VmCall,
};
use sequensa_core::{ByteWriter, SourceId};
use sequensa_lexer::{tokenize, BracketKind, LexError, RawKind, Token};
use thiserror::Error;

mod classify;
pub use classify::{classify_all, Category, ClassifiedToken, Keyword, NameRole};

/* ─────────────────────────── Errors ─────────────────────────── */

/// A source-level compiler error. Fields mirror spec §7's `CompilerError`
/// shape: the formatted message concatenates whichever fields are present.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CompilerError {
    /// What was found, if relevant.
    pub unexpected: Option<String>,
    /// What was expected instead, if relevant.
    pub expected: Option<String>,
    /// The syntactic structure being assembled when the error occurred.
    pub structure: Option<String>,
    /// Source line.
    pub line: u32,
}

impl CompilerError {
    fn new(line: u32) -> Self { Self { line, ..Self::default() } }
    #[must_use]
    fn unexpected(mut self, what: impl Into<String>) -> Self { self.unexpected = Some(what.into()); self }
    #[must_use]
    fn expected(mut self, what: impl Into<String>) -> Self { self.expected = Some(what.into()); self }
    #[must_use]
    fn structure(mut self, what: impl Into<String>) -> Self { self.structure = Some(what.into()); self }
}

impl core::fmt::Display for CompilerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "line {}", self.line)?;
        if let Some(s) = &self.structure {
            write!(f, " in {s}")?;
        }
        if let Some(u) = &self.unexpected {
            write!(f, ": unexpected {u}")?;
        }
        if let Some(e) = &self.expected {
            write!(f, ", expected {e}")?;
        }
        Ok(())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CompilerError {}

/// Top-level error returned by [`compile`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A tokenizer failure.
    #[error(transparent)]
    Lex(#[from] LexError),
    /// A source-level assembly failure.
    #[error("{0}")]
    Compiler(CompilerError),
    /// An internal bytecode-encoding failure (should not occur for
    /// assembler-produced values; surfaced for completeness).
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
}

impl From<CompilerError> for CompileError {
    fn from(e: CompilerError) -> Self { CompileError::Compiler(e) }
}

/// Convenience alias.
pub type CompileResult<T> = Result<T, CompileError>;

/* ─────────────────────────── Assembler ─────────────────────────── */

/// Tokenize and assemble `src` into a bare bytecode buffer: a concatenation
/// of `SSL` stream records with no enclosing `FUN` header (the executor's
/// `execute` reads exactly this shape as a program's top-level body).
pub fn compile(src: &str) -> CompileResult<Vec<u8>> {
    let raw = tokenize(src, SourceId(0))?;
    let tokens = classify_all(&raw);
    assemble_function_body(&tokens, 0, tokens.len())
}

fn bracket_delta(cat: &Category) -> Option<(BracketKind, i32)> {
    match cat {
        Category::Open(k) => Some((*k, 1)),
        Category::Close(k) => Some((*k, -1)),
        _ => None,
    }
}

/// Assemble a run of stream records (a function body, or the whole
/// top-level program). Returns the concatenation of each stream's encoded
/// `SSL` record — no `FUN` wrapper.
fn assemble_function_body(tokens: &[ClassifiedToken], mut idx: usize, end: usize) -> CompileResult<Vec<u8>> {
    let mut out = Vec::new();
    while idx < end {
        let mut tags = Tags::empty();
        while idx + 1 < end {
            let is_tag = matches!(
                (&tokens[idx].category, &tokens[idx + 1].category),
                (Category::Name(NameRole::Tag(_)), Category::Semicolon)
            );
            if !is_tag {
                break;
            }
            if let Category::Name(NameRole::Tag(t)) = tokens[idx].category {
                tags |= t;
            }
            idx += 2;
        }
        if idx >= end {
            break;
        }
        let stream_start = idx;
        let stream_line = tokens[idx].line;
        let mut depth = [0i32; 3];
        let mut j = idx;
        while j < end {
            if tokens[j].line != stream_line && depth == [0, 0, 0] {
                break;
            }
            if let Some((kind, d)) = bracket_delta(&tokens[j].category) {
                let slot = match kind {
                    BracketKind::Paren => 0,
                    BracketKind::Brace => 1,
                    BracketKind::Bracket => 2,
                };
                depth[slot] += d;
            }
            j += 1;
        }
        let record = assemble_stream(tokens, stream_start, j, tags)?;
        out.extend_from_slice(&record);
        idx = j;
    }
    Ok(out)
}

/// Assemble one `SSL` stream record: atoms separated by top-level `<<`.
fn assemble_stream(tokens: &[ClassifiedToken], start: usize, end: usize, tags: Tags) -> CompileResult<Vec<u8>> {
    let mut body = Vec::new();
    let mut atom_start = start;
    let mut i = start;
    let mut depth = 0i32;
    let mut flush = |s: usize, e: usize, body: &mut Vec<u8>| -> CompileResult<()> {
        if s < e {
            body.extend_from_slice(&assemble_atom(tokens, s, e)?);
        }
        Ok(())
    };
    while i < end {
        match &tokens[i].category {
            Category::Open(_) => depth += 1,
            Category::Close(_) => depth -= 1,
            Category::StreamOp if depth == 0 => {
                flush(atom_start, i, &mut body)?;
                atom_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    flush(atom_start, end, &mut body)?;

    let mut w = ByteWriter::new();
    bc::write_value(
        &mut w,
        &Value::new(false, ValueKind::Stream { tags, body: sequensa_core::ByteReader::new(&body) }),
        EncodedChildren::One(&body),
    );
    Ok(w.into_vec())
}

/// Assemble one stream atom: `set name`, a bare name/primitive, or a
/// fully-bracketed `(expr)`/`{function}`/`[flowc]`.
fn assemble_atom(tokens: &[ClassifiedToken], start: usize, end: usize) -> CompileResult<Vec<u8>> {
    if end <= start {
        return Err(CompilerError::new(0).structure("stream atom").expected("a value").into());
    }
    if let Category::Name(NameRole::Keyword(Keyword::Set)) = &tokens[start].category {
        if end - start != 2 {
            return Err(CompilerError::new(tokens[start].line)
                .structure("set binding")
                .expected("a single identifier after 'set'")
                .into());
        }
        return match &tokens[start + 1].category {
            Category::Name(NameRole::Identifier(name)) => {
                encode_leaf(tokens[start + 1].anchor, ValueKind::Name { define: true, name: name.clone() })
            }
            other => Err(CompilerError::new(tokens[start + 1].line)
                .structure("set binding")
                .unexpected(format!("{other:?}"))
                .expected("an identifier")
                .into()),
        };
    }

    // A single bracketed group spanning the whole atom.
    if let (Category::Open(open_kind), Category::Close(close_kind)) =
        (&tokens[start].category, &tokens[end - 1].category)
    {
        if open_kind == close_kind && spans_one_group(tokens, start, end) {
            let anchor = tokens[start].anchor;
            let inner_start = start + 1;
            let inner_end = end - 1;
            return match open_kind {
                BracketKind::Paren => assemble_expression(tokens, inner_start, inner_end, anchor),
                BracketKind::Brace => assemble_function_value(tokens, inner_start, inner_end, anchor),
                BracketKind::Bracket => assemble_flowc(tokens, inner_start, inner_end, anchor),
            };
        }
    }

    if end - start == 1 {
        return assemble_primitive(&tokens[start]);
    }

    Err(CompilerError::new(tokens[start].line)
        .structure("stream atom")
        .unexpected("a multi-token sequence")
        .expected("a name, literal, (expr), {function}, or [flowc]")
        .into())
}

/// True if `tokens[start]`'s opening bracket is only closed by
/// `tokens[end - 1]`, i.e. the range is exactly one bracketed group.
fn spans_one_group(tokens: &[ClassifiedToken], start: usize, end: usize) -> bool {
    let mut depth = 0i32;
    for (k, tok) in tokens[start..end].iter().enumerate() {
        match &tok.category {
            Category::Open(_) => depth += 1,
            Category::Close(_) => {
                depth -= 1;
                if depth == 0 {
                    return k == end - start - 1;
                }
            }
            _ => {}
        }
    }
    false
}

/// Assemble a `{ ... }` function literal into a `FUN` value.
fn assemble_function_value(tokens: &[ClassifiedToken], start: usize, end: usize, anchor: bool) -> CompileResult<Vec<u8>> {
    let inner = assemble_function_body(tokens, start, end)?;
    let mut w = ByteWriter::new();
    bc::write_value(
        &mut w,
        &Value::new(anchor, ValueKind::Function(sequensa_core::ByteReader::new(&inner))),
        EncodedChildren::One(&inner),
    );
    Ok(w.into_vec())
}

/// Operator precedence weight: lower splits first (it becomes the
/// expression's root, i.e. the loosest-binding operator). This workspace's
/// own numbering — see `DESIGN.md` for why it reads lower-to-looser rather
/// than the `spec.md` prose's literal "lower weight = higher precedence",
/// which would invert the parse.
const fn weight(op: ExprOperator) -> u8 {
    match op {
        ExprOperator::Or | ExprOperator::Xor | ExprOperator::And => 1,
        ExprOperator::Eq
        | ExprOperator::NotEq
        | ExprOperator::Gt
        | ExprOperator::Lt
        | ExprOperator::NotGreater
        | ExprOperator::NotLess => 2,
        ExprOperator::BitOr | ExprOperator::BitXor | ExprOperator::BitAnd => 3,
        ExprOperator::Add | ExprOperator::Sub => 4,
        ExprOperator::Mul | ExprOperator::Div | ExprOperator::Mod => 5,
        ExprOperator::Pow => 6,
        ExprOperator::Not | ExprOperator::BinaryNot => 7,
    }
}

/// Assemble `tokens[start..end]` as an expression, producing an `EXP` value
/// (or degenerating to a bare primitive for a single token).
fn assemble_expression(tokens: &[ClassifiedToken], start: usize, end: usize, anchor: bool) -> CompileResult<Vec<u8>> {
    if end <= start {
        return Err(CompilerError::new(0).structure("expression").expected("an operand").into());
    }
    if end - start == 1 {
        return assemble_primitive(&tokens[start]);
    }
    // A single group fully wrapping the expression: unwrap and recurse.
    if let (Category::Open(BracketKind::Paren), Category::Close(BracketKind::Paren)) =
        (&tokens[start].category, &tokens[end - 1].category)
    {
        if spans_one_group(tokens, start, end) {
            return assemble_expression(tokens, start + 1, end - 1, anchor);
        }
    }

    let mut depth = 0i32;
    let mut split: Option<(usize, u8)> = None;
    for i in start..end {
        match &tokens[i].category {
            Category::Open(_) => depth += 1,
            Category::Close(_) => depth -= 1,
            Category::Op(op, w) if depth == 0 => {
                // Skip a leading/position-0-after-operator unary operator: it has no left operand.
                let is_unary_slot = i == start || matches!(tokens[i - 1].category, Category::Op(..));
                if is_unary_slot && op.is_unary() {
                    continue;
                }
                let better = match split {
                    None => true,
                    Some((_, best)) => *w <= best,
                };
                if better {
                    split = Some((i, *w));
                }
            }
            _ => {}
        }
    }

    let Some((op_idx, _)) = split else {
        // Only unary operators at top level: the very first token must be one.
        if let Category::Op(op, _) = &tokens[start].category {
            if op.is_unary() {
                let right = assemble_expression(tokens, start + 1, end, false)?;
                return assemble_expression_value(*op, &[], &right, anchor);
            }
        }
        return Err(CompilerError::new(tokens[start].line)
            .structure("expression")
            .expected("an operator between operands")
            .into());
    };

    let Category::Op(op, _) = tokens[op_idx].category else { unreachable!() };
    let left_tokens = start..op_idx;
    let right_tokens = (op_idx + 1)..end;

    let left = if left_tokens.is_empty() {
        Vec::new() // unary: Null placeholder written by assemble_expression_value
    } else {
        assemble_expression(tokens, left_tokens.start, left_tokens.end, false)?
    };
    let right = assemble_expression(tokens, right_tokens.start, right_tokens.end, false)?;
    assemble_expression_value(op, &left, &right, anchor)
}

fn assemble_expression_value(op: ExprOperator, left: &[u8], right: &[u8], anchor: bool) -> CompileResult<Vec<u8>> {
    let null_buf;
    let left = if left.is_empty() {
        let mut w = ByteWriter::new();
        bc::write_value(&mut w, &Value::new(false, ValueKind::Null), EncodedChildren::None);
        null_buf = w.into_vec();
        &null_buf[..]
    } else {
        left
    };
    let mut w = ByteWriter::new();
    bc::write_value(
        &mut w,
        &Value::new(
            anchor,
            ValueKind::Expression {
                op,
                left: sequensa_core::ByteReader::new(left),
                right: sequensa_core::ByteReader::new(right),
            },
        ),
        EncodedChildren::Two(left, right),
    );
    Ok(w.into_vec())
}

/// Assemble a `[ ... ]` flow controller into an `FLC` value.
fn assemble_flowc(tokens: &[ClassifiedToken], start: usize, end: usize, anchor: bool) -> CompileResult<Vec<u8>> {
    if tokens[start..end].iter().any(|t| t.anchor) {
        return Err(CompilerError::new(tokens[start].line)
            .structure("flow controller")
            .unexpected("an anchored value")
            .expected("no anchors inside [ ]")
            .into());
    }

    let mut clauses: Vec<Vec<u8>> = Vec::new();
    let mut depth = 0i32;
    let mut clause_start = start;
    let mut i = start;
    while i <= end {
        let at_boundary = i == end
            || (depth == 0 && matches!(tokens.get(i).map(|t| &t.category), Some(Category::Comma)));
        if let Some(tok) = tokens.get(i) {
            match &tok.category {
                Category::Open(_) => depth += 1,
                Category::Close(_) => depth -= 1,
                _ => {}
            }
        }
        if at_boundary {
            if clause_start < i {
                clauses.push(assemble_flow_clause(tokens, clause_start, i)?);
            }
            clause_start = i + 1;
        }
        i += 1;
    }

    let slices: Vec<&[u8]> = clauses.iter().map(Vec::as_slice).collect();
    let mut w = ByteWriter::new();
    bc::write_value(
        &mut w,
        &Value::new(anchor, ValueKind::Flowc(Vec::new())),
        EncodedChildren::Many(&slices),
    );
    Ok(w.into_vec())
}

/// Assemble one `Flowc` clause: either a single primitive (`Value`/`Type`)
/// or `number : number` (`Range`).
fn assemble_flow_clause(tokens: &[ClassifiedToken], start: usize, end: usize) -> CompileResult<Vec<u8>> {
    let colon_at = tokens[start..end].iter().position(|t| matches!(t.category, Category::Colon));
    if let Some(offset) = colon_at {
        let colon = start + offset;
        if end - start != 3 || colon != start + 1 {
            return Err(CompilerError::new(tokens[start].line)
                .structure("flow range clause")
                .expected("number : number")
                .into());
        }
        let mut out = assemble_primitive(&tokens[start])?;
        out.extend(assemble_primitive(&tokens[colon + 1])?);
        return Ok(out);
    }
    if end - start != 1 {
        return Err(CompilerError::new(tokens[start].line)
            .structure("flow clause")
            .expected("a single Value or Type")
            .into());
    }
    assemble_primitive(&tokens[start])
}

/// Assemble a single token as a primitive value (`NIL/BLT/BLF/INT/NUM/STR/TYP/VMC/ARG/VAR`).
fn assemble_primitive(tok: &ClassifiedToken) -> CompileResult<Vec<u8>> {
    let kind = match &tok.category {
        Category::Name(NameRole::Keyword(Keyword::True)) => ValueKind::Bool(true),
        Category::Name(NameRole::Keyword(Keyword::False)) => ValueKind::Bool(false),
        Category::Name(NameRole::Keyword(Keyword::Null)) => ValueKind::Null,
        Category::Name(NameRole::Keyword(Keyword::Set | Keyword::Load)) => {
            return Err(CompilerError::new(tok.line)
                .structure("primitive")
                .unexpected("a reserved keyword")
                .into());
        }
        Category::Name(NameRole::DataType(dt)) => ValueKind::Type(*dt),
        Category::Name(NameRole::VmCall(vc)) => ValueKind::VmCall(*vc),
        Category::Name(NameRole::Tag(_)) => {
            return Err(CompilerError::new(tok.line).structure("primitive").unexpected("a tag keyword").into());
        }
        Category::Name(NameRole::Identifier(name)) => {
            if name.len() > 128 {
                return Err(CompilerError::new(tok.line)
                    .structure("identifier")
                    .unexpected("a name longer than 128 bytes")
                    .into());
            }
            ValueKind::Name { define: false, name: name.clone() }
        }
        Category::Number(f) => ValueKind::Number(*f),
        Category::Str(s) => ValueKind::String(s.clone()),
        Category::Arg(level) => ValueKind::Arg(*level),
        other => {
            return Err(CompilerError::new(tok.line)
                .structure("primitive")
                .unexpected(format!("{other:?}"))
                .into());
        }
    };
    encode_leaf(tok.anchor, kind)
}

fn encode_leaf(anchor: bool, kind: ValueKind<'static>) -> CompileResult<Vec<u8>> {
    let mut w = ByteWriter::new();
    bc::write_value(&mut w, &Value::new(anchor, kind), EncodedChildren::None);
    Ok(w.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use proptest::prelude::*;
    use sequensa_bytecode::read_value;
    use sequensa_core::ByteReader;

    fn decode_all(bytes: &[u8]) -> Vec<Value<'_>> {
        decode_body(ByteReader::new(bytes))
    }

    fn decode_body(mut r: ByteReader<'_>) -> Vec<Value<'_>> {
        let mut out = Vec::new();
        while r.has_next() {
            out.push(read_value(&mut r).unwrap());
        }
        out
    }

    #[test]
    fn hello_world_exit() {
        let bytes = compile(r#"#exit << "Hello World!""#).unwrap();
        let values = decode_all(&bytes);
        assert_eq!(values.len(), 1);
        match &values[0].kind {
            ValueKind::Stream { body, .. } => {
                let atoms = decode_body(*body);
                assert_eq!(atoms.len(), 2);
            }
            other => panic!("expected Stream, got {other:?}"),
        }
    }

    #[test]
    fn set_binding_emits_define_name() {
        let bytes = compile("set x << 1").unwrap();
        let values = decode_all(&bytes);
        match &values[0].kind {
            ValueKind::Stream { body, .. } => {
                let mut b = *body;
                let first = read_value(&mut b).unwrap();
                match first.kind {
                    ValueKind::Name { define, name } => {
                        assert!(define);
                        assert_eq!(name, b"x");
                    }
                    other => panic!("expected Name, got {other:?}"),
                }
            }
            other => panic!("expected Stream, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_expression_precedence() {
        // 2 + 3 * 4 should parse as Add(2, Mul(3,4)) — root is the loosest operator.
        let bytes = compile("#exit << (2 + 3 * 4)").unwrap();
        let values = decode_all(&bytes);
        match &values[0].kind {
            ValueKind::Stream { body, .. } => {
                let mut b = *body;
                let _exit = read_value(&mut b).unwrap();
                let expr = read_value(&mut b).unwrap();
                match expr.kind {
                    ValueKind::Expression { op, .. } => assert_eq!(op, ExprOperator::Add),
                    other => panic!("expected Expression, got {other:?}"),
                }
            }
            other => panic!("expected Stream, got {other:?}"),
        }
    }

    #[test]
    fn flowc_range_clause() {
        let bytes = compile("#exit << #[1:5]").unwrap();
        let values = decode_all(&bytes);
        match &values[0].kind {
            ValueKind::Stream { body, .. } => {
                let mut b = *body;
                let _exit = read_value(&mut b).unwrap();
                let flc = read_value(&mut b).unwrap();
                assert!(flc.anchor);
                match flc.kind {
                    ValueKind::Flowc(clauses) => assert_eq!(clauses.len(), 1),
                    other => panic!("expected Flowc, got {other:?}"),
                }
            }
            other => panic!("expected Stream, got {other:?}"),
        }
    }

    #[test]
    fn empty_source_is_empty_buffer() {
        pretty_assert_eq!(compile("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn function_literal_roundtrips() {
        let bytes = compile("set f << { #return << @ }").unwrap();
        let values = decode_all(&bytes);
        match &values[0].kind {
            ValueKind::Stream { body, .. } => {
                let mut b = *body;
                let _name = read_value(&mut b).unwrap();
                let func = read_value(&mut b).unwrap();
                assert!(matches!(func.kind, ValueKind::Function(_)));
            }
            other => panic!("expected Stream, got {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn exit_of_integer_literal_roundtrips(n in 0i64..1_000_000) {
            let src = format!("#exit << {n}");
            let bytes = compile(&src).unwrap();
            let values = decode_all(&bytes);
            let ValueKind::Stream { body, .. } = &values[0].kind else {
                panic!("expected Stream");
            };
            let mut b = *body;
            let _exit = read_value(&mut b).unwrap();
            let literal = read_value(&mut b).unwrap();
            let ValueKind::Number(f) = literal.kind else {
                panic!("expected Number, got {:?}", literal.kind);
            };
            prop_assert!((f.as_f64() - n as f64).abs() < 1e-6);
        }
    }
}
