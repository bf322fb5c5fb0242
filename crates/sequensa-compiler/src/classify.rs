//! Token classification: assigns each raw lexeme a semantic [`Category`] —
//! keyword, reserved data-type name, VM-call name, tag keyword, or a plain
//! identifier — plus an operator's precedence [`weight`](crate::weight) for
//! lexemes the lexer only recognised as bare operator text.

#[cfg(feature = "std")]
use std::vec::Vec;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use sequensa_bytecode::{DataType, ExprOperator, Fraction, Tags, VmCall};
use sequensa_lexer::{BracketKind, RawKind, Token};

/// The reserved, non-tag keywords recognised by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    /// `set` — binds the next atom's value to a name.
    Set,
    /// `load` — pulls in a native library at the top of a source file.
    Load,
    /// `true`
    True,
    /// `false`
    False,
    /// `null`
    Null,
}

/// What role a `Name` lexeme plays once classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameRole {
    /// A reserved keyword.
    Keyword(Keyword),
    /// `first`/`last`/`end` — a scope-iteration tag.
    Tag(Tags),
    /// One of the twelve type names, usable as a cast target or `Flowc` clause.
    DataType(DataType),
    /// One of the six VM-call names.
    VmCall(VmCall),
    /// An ordinary identifier.
    Identifier(Vec<u8>),
}

/// The semantic category a raw lexeme falls into.
#[derive(Debug, Clone, PartialEq)]
pub enum Category {
    /// A `Name` lexeme, further classified by [`NameRole`].
    Name(NameRole),
    /// A parsed numeric literal.
    Number(Fraction),
    /// A string literal's decoded bytes.
    Str(Vec<u8>),
    /// An argument reference at the given level.
    Arg(u8),
    /// An operator, paired with its split-precedence weight (lower splits first).
    Op(ExprOperator, u8),
    /// An opening bracket.
    Open(BracketKind),
    /// A closing bracket.
    Close(BracketKind),
    /// `,`
    Comma,
    /// `:`
    Colon,
    /// `<<`
    StreamOp,
    /// `>>`
    ReverseStreamOp,
    /// `;`
    Semicolon,
}

/// A lexeme plus its assigned category.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedToken {
    /// The assigned category.
    pub category: Category,
    /// Whether the lexeme carried a `#` anchor prefix.
    pub anchor: bool,
    /// Source line.
    pub line: u32,
}

fn classify_name(text: &str) -> NameRole {
    match text {
        "set" => return NameRole::Keyword(Keyword::Set),
        "load" => return NameRole::Keyword(Keyword::Load),
        "true" => return NameRole::Keyword(Keyword::True),
        "false" => return NameRole::Keyword(Keyword::False),
        "null" => return NameRole::Keyword(Keyword::Null),
        "first" => return NameRole::Tag(Tags::FIRST),
        "last" => return NameRole::Tag(Tags::LAST),
        "end" => return NameRole::Tag(Tags::END),
        _ => {}
    }
    let data_type = match text {
        "Null" => Some(DataType::Null),
        "Bool" => Some(DataType::Bool),
        "Number" => Some(DataType::Number),
        "String" => Some(DataType::String),
        "Type" => Some(DataType::Type),
        "VmCall" => Some(DataType::VmCall),
        "Arg" => Some(DataType::Arg),
        "Name" => Some(DataType::Name),
        "Function" => Some(DataType::Function),
        "Expression" => Some(DataType::Expression),
        "Flowc" => Some(DataType::Flowc),
        "Stream" => Some(DataType::Stream),
        _ => None,
    };
    if let Some(dt) = data_type {
        return NameRole::DataType(dt);
    }
    let vm_call = match text {
        "return" => Some(VmCall::Return),
        "break" => Some(VmCall::Break),
        "exit" => Some(VmCall::Exit),
        "again" => Some(VmCall::Again),
        "emit" => Some(VmCall::Emit),
        "final" => Some(VmCall::Final),
        _ => None,
    };
    if let Some(vc) = vm_call {
        return NameRole::VmCall(vc);
    }
    NameRole::Identifier(text.as_bytes().to_vec())
}

fn classify_operator(text: &str) -> (ExprOperator, u8) {
    let op = match text {
        "!" => ExprOperator::Not,
        "~" => ExprOperator::BinaryNot,
        "+" => ExprOperator::Add,
        "-" => ExprOperator::Sub,
        "*" => ExprOperator::Mul,
        "/" => ExprOperator::Div,
        "%" => ExprOperator::Mod,
        "**" => ExprOperator::Pow,
        "&" => ExprOperator::BitAnd,
        "|" => ExprOperator::BitOr,
        "^" => ExprOperator::BitXor,
        "=" => ExprOperator::Eq,
        "!=" => ExprOperator::NotEq,
        ">" => ExprOperator::Gt,
        "<" => ExprOperator::Lt,
        ">=" => ExprOperator::NotLess,
        "<=" => ExprOperator::NotGreater,
        "!>" => ExprOperator::NotGreater,
        "!<" => ExprOperator::NotLess,
        "&&" => ExprOperator::And,
        "||" => ExprOperator::Or,
        "^^" => ExprOperator::Xor,
        other => unreachable!("lexer only ever emits known operator lexemes, got {other:?}"),
    };
    (op, crate::weight(op))
}

fn parse_number(text: &str) -> Fraction {
    text.parse::<f64>().map_or(Fraction::integer(0), Fraction::from_f64)
}

/// Classify one raw token.
#[must_use]
pub fn classify(tok: &Token) -> ClassifiedToken {
    let category = match &tok.kind {
        RawKind::Name(s) => Category::Name(classify_name(s)),
        RawKind::Number(s) => Category::Number(parse_number(s)),
        RawKind::String(bytes) => Category::Str(bytes.clone()),
        RawKind::Arg(level) => Category::Arg(*level),
        RawKind::Operator(s) => {
            let (op, w) = classify_operator(s);
            Category::Op(op, w)
        }
        RawKind::Open(k) => Category::Open(*k),
        RawKind::Close(k) => Category::Close(*k),
        RawKind::Comma => Category::Comma,
        RawKind::Colon => Category::Colon,
        RawKind::StreamOp => Category::StreamOp,
        RawKind::ReverseStreamOp => Category::ReverseStreamOp,
        RawKind::Semicolon => Category::Semicolon,
    };
    ClassifiedToken { category, anchor: tok.anchor, line: tok.line }
}

/// Classify a whole token stream.
#[must_use]
pub fn classify_all(tokens: &[Token]) -> Vec<ClassifiedToken> {
    tokens.iter().map(classify).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequensa_core::{SourceId, Span};

    fn tok(kind: RawKind) -> Token {
        Token { kind, anchor: false, line: 1, span: Span::new(SourceId(0), sequensa_core::Pos(0), sequensa_core::Pos(0)) }
    }

    #[test]
    fn keyword_names_classify() {
        assert_eq!(classify(&tok(RawKind::Name("set".into()))).category, Category::Name(NameRole::Keyword(Keyword::Set)));
        assert_eq!(classify(&tok(RawKind::Name("null".into()))).category, Category::Name(NameRole::Keyword(Keyword::Null)));
    }

    #[test]
    fn tag_names_classify() {
        assert_eq!(classify(&tok(RawKind::Name("first".into()))).category, Category::Name(NameRole::Tag(Tags::FIRST)));
        assert_eq!(classify(&tok(RawKind::Name("end".into()))).category, Category::Name(NameRole::Tag(Tags::END)));
    }

    #[test]
    fn data_type_names_classify() {
        assert_eq!(classify(&tok(RawKind::Name("Number".into()))).category, Category::Name(NameRole::DataType(DataType::Number)));
    }

    #[test]
    fn vm_call_names_classify() {
        assert_eq!(classify(&tok(RawKind::Name("exit".into()))).category, Category::Name(NameRole::VmCall(VmCall::Exit)));
    }

    #[test]
    fn plain_identifier_classifies_as_identifier() {
        assert_eq!(
            classify(&tok(RawKind::Name("counter".into()))).category,
            Category::Name(NameRole::Identifier(b"counter".to_vec()))
        );
    }

    #[test]
    fn operators_carry_a_weight() {
        let Category::Op(op, w) = classify(&tok(RawKind::Operator("*".into()))).category else {
            panic!("expected Op");
        };
        assert_eq!(op, ExprOperator::Mul);
        assert!(w > 0);
    }

    #[test]
    fn decimal_number_parses() {
        let Category::Number(f) = classify(&tok(RawKind::Number("3.5".into()))).category else {
            panic!("expected Number");
        };
        assert!((f.as_f64() - 3.5).abs() < 1e-9);
    }
}
