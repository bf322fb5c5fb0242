//! sequensa-lexer — the Sequensa tokenizer.
//!
//! A single-pass, byte-driven state machine (states: `Start, Comment,
//! String, Escape, Name, Number, Arg`) that turns source text into a flat
//! sequence of [`Token`]s, each carrying its source line and anchor flag.
//! No tree is built here — token *categorization* (operator precedence,
//! tag bits, VM-call/type keyword recognition) is `sequensa-compiler`'s job;
//! this crate only recognises lexeme shapes.

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::{string::String, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use sequensa_core::{Pos, SourceId, Span};
use thiserror::Error;

/* ─────────────────────────── Tokens ─────────────────────────── */

/// Which bracket family a `{`/`[`/`(` token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BracketKind {
    /// `(` `)` — expression grouping.
    Paren,
    /// `{` `}` — function body.
    Brace,
    /// `[` `]` — flow controller.
    Bracket,
}

/// The shape recognised for one lexeme. Semantic meaning (operator
/// precedence, keyword recognition, tag bits) is assigned downstream by the
/// classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RawKind {
    /// `[A-Za-z_][A-Za-z0-9_]*(:[A-Za-z_][A-Za-z0-9_]*)*` — identifier or keyword.
    Name(String),
    /// `[0-9]+(\.[0-9]+)?` — number literal text.
    Number(String),
    /// Decoded (escapes already resolved) string literal content.
    String(Vec<u8>),
    /// `@`, `@@`, ... — argument reference; payload is the level (`@`s minus one).
    Arg(u8),
    /// An operator lexeme (`+ - * / % ** & | ^ ~ ! = != > < >= <= !> !< && || ^^`).
    Operator(String),
    /// An opening bracket.
    Open(BracketKind),
    /// A closing bracket.
    Close(BracketKind),
    /// `,`
    Comma,
    /// `:` outside of a name (e.g. a range clause's separator).
    Colon,
    /// `<<` — the stream operator.
    StreamOp,
    /// `>>` — reserved reverse-stream operator.
    ReverseStreamOp,
    /// `;` — tag/stream terminator.
    Semicolon,
}

/// One recognised lexeme.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Token {
    /// The lexeme's shape and decoded payload.
    pub kind: RawKind,
    /// Set when the lexeme was prefixed with `#`.
    pub anchor: bool,
    /// 1-based source line the lexeme starts on.
    pub line: u32,
    /// Byte span of the lexeme in the source.
    pub span: Span,
}

/* ─────────────────────────── Errors ─────────────────────────── */

/// Tokenizer failures — all are `CompilerError`s in spec terms.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexError {
    /// A `"..."` string ran into a newline or end-of-input before its closing quote.
    #[error("unterminated string starting on line {line}")]
    UnterminatedString {
        /// Line the string began on.
        line: u32,
    },
    /// `\` followed by a character that isn't one of `n t r " \`.
    #[error("invalid escape '\\{ch}' on line {line}")]
    InvalidEscape {
        /// Offending character.
        ch: char,
        /// Line it occurred on.
        line: u32,
    },
    /// A closing bracket with no matching open of that kind, or leftover
    /// open brackets at end-of-input.
    #[error("unmatched bracket on line {line}")]
    UnmatchedBracket {
        /// Line the mismatch was detected on.
        line: u32,
    },
    /// A byte that starts none of the recognised lexeme shapes.
    #[error("unexpected character '{ch}' on line {line}")]
    UnexpectedChar {
        /// Offending character.
        ch: char,
        /// Line it occurred on.
        line: u32,
    },
}

/// Convenience alias.
pub type LexResult<T> = Result<T, LexError>;

/* ─────────────────────────── Tokenizer ─────────────────────────── */

fn is_name_start(b: u8) -> bool { b.is_ascii_alphabetic() || b == b'_' }
fn is_name_cont(b: u8) -> bool { b.is_ascii_alphanumeric() || b == b'_' }

const TWO_CHAR_OPS: &[&str] = &["!=", ">=", "!>", "<=", "!<", "&&", "||", "^^", "**"];
const SINGLE_CHAR_OPS: &[u8] = b"+-/%*><=&|^~";

/// Tokenize `src`, returning a flat token sequence or the first lex error
/// encountered.
pub fn tokenize(src: &str, source: SourceId) -> LexResult<Vec<Token>> {
    Lexer::new(src, source).collect()
}

/// A resumable, single-pass tokenizer. Implements `Iterator<Item =
/// LexResult<Token>>`; iteration stops (returns `None`) once the whole input
/// has been consumed.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    source: SourceId,
    paren_depth: i32,
    brace_depth: i32,
    bracket_depth: i32,
    /// One-token lookahead buffer, used to splice the synthetic `null` in
    /// front of a standalone `!` (spec §4.4: "`!` alone is rewritten as
    /// `null !`").
    pending: Option<Token>,
}

impl<'a> Lexer<'a> {
    /// Build a tokenizer over `src`.
    #[must_use]
    pub fn new(src: &'a str, source: SourceId) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            source,
            paren_depth: 0,
            brace_depth: 0,
            bracket_depth: 0,
            pending: None,
        }
    }

    fn peek(&self) -> Option<u8> { self.src.get(self.pos).copied() }
    fn peek_at(&self, offset: usize) -> Option<u8> { self.src.get(self.pos + offset).copied() }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn span(&self, start: usize) -> Span {
        Span::new(self.source, Pos(start as u32), Pos(self.pos as u32))
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    /// Finish at the current position with an `UnmatchedBracket` error if
    /// any bracket counter is still nonzero.
    fn check_balanced(&self) -> LexResult<()> {
        if self.paren_depth != 0 || self.brace_depth != 0 || self.bracket_depth != 0 {
            return Err(LexError::UnmatchedBracket { line: self.line });
        }
        Ok(())
    }

    fn read_name(&mut self, start: usize) -> Token {
        while matches!(self.peek(), Some(b) if is_name_cont(b)) {
            self.bump();
        }
        // Namespace segments: `:` followed immediately by another name start continues the name.
        while self.peek() == Some(b':') && matches!(self.peek_at(1), Some(b) if is_name_start(b)) {
            self.bump(); // ':'
            while matches!(self.peek(), Some(b) if is_name_cont(b)) {
                self.bump();
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        Token { kind: RawKind::Name(text), anchor: false, line: self.line, span: self.span(start) }
    }

    fn read_number(&mut self, start: usize) -> Token {
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b) if b.is_ascii_digit()) {
            self.bump(); // '.'
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        Token { kind: RawKind::Number(text), anchor: false, line: self.line, span: self.span(start) }
    }

    fn read_arg(&mut self, start: usize) -> Token {
        let mut count = 0u32;
        while self.peek() == Some(b'@') {
            self.bump();
            count += 1;
        }
        let level = u8::try_from(count.saturating_sub(1)).unwrap_or(u8::MAX);
        Token { kind: RawKind::Arg(level), anchor: false, line: self.line, span: self.span(start) }
    }

    fn read_string(&mut self, start: usize) -> LexResult<Token> {
        let start_line = self.line;
        self.bump(); // opening '"'
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(LexError::UnterminatedString { line: start_line }),
                Some(b'\n') => return Err(LexError::UnterminatedString { line: start_line }),
                Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    let escaped = self.bump().ok_or(LexError::UnterminatedString { line: start_line })?;
                    out.push(match escaped {
                        b'n' => b'\n',
                        b't' => b'\t',
                        b'r' => b'\r',
                        b'"' => b'"',
                        b'\\' => b'\\',
                        other => {
                            return Err(LexError::InvalidEscape { ch: other as char, line: self.line });
                        }
                    });
                }
                Some(b) => {
                    out.push(b);
                    self.bump();
                }
            }
        }
        Ok(Token { kind: RawKind::String(out), anchor: false, line: start_line, span: self.span(start) })
    }

    fn read_operator(&mut self, start: usize) -> Token {
        for two in TWO_CHAR_OPS {
            let bytes = two.as_bytes();
            if self.src[self.pos..].starts_with(bytes) {
                self.pos += 2;
                return Token {
                    kind: RawKind::Operator((*two).to_string()),
                    anchor: false,
                    line: self.line,
                    span: self.span(start),
                };
            }
        }
        let b = self.bump().expect("caller verified a byte is present");
        Token {
            kind: RawKind::Operator((b as char).to_string()),
            anchor: false,
            line: self.line,
            span: self.span(start),
        }
    }

    fn bracket_kind(b: u8) -> Option<(BracketKind, bool)> {
        match b {
            b'(' => Some((BracketKind::Paren, true)),
            b')' => Some((BracketKind::Paren, false)),
            b'{' => Some((BracketKind::Brace, true)),
            b'}' => Some((BracketKind::Brace, false)),
            b'[' => Some((BracketKind::Bracket, true)),
            b']' => Some((BracketKind::Bracket, false)),
            _ => None,
        }
    }

    fn depth_mut(&mut self, kind: BracketKind) -> &mut i32 {
        match kind {
            BracketKind::Paren => &mut self.paren_depth,
            BracketKind::Brace => &mut self.brace_depth,
            BracketKind::Bracket => &mut self.bracket_depth,
        }
    }

    fn next_token(&mut self) -> Option<LexResult<Token>> {
        self.skip_whitespace_and_comments();
        let start = self.pos;
        let b = self.peek()?;

        let (anchor, b, start) = if b == b'#' {
            self.bump();
            match self.peek() {
                Some(next) => (true, next, start),
                None => return Some(Err(LexError::UnexpectedChar { ch: '#', line: self.line })),
            }
        } else {
            (false, b, start)
        };

        let mut tok = match b {
            b'"' => match self.read_string(start) {
                Ok(t) => t,
                Err(e) => return Some(Err(e)),
            },
            b if is_name_start(b) => self.read_name(start),
            b if b.is_ascii_digit() => self.read_number(start),
            b'@' => self.read_arg(start),
            b',' => {
                self.bump();
                Token { kind: RawKind::Comma, anchor: false, line: self.line, span: self.span(start) }
            }
            b';' => {
                self.bump();
                Token { kind: RawKind::Semicolon, anchor: false, line: self.line, span: self.span(start) }
            }
            b'<' if self.peek_at(1) == Some(b'<') => {
                self.pos += 2;
                Token { kind: RawKind::StreamOp, anchor: false, line: self.line, span: self.span(start) }
            }
            b'>' if self.peek_at(1) == Some(b'>') => {
                self.pos += 2;
                Token { kind: RawKind::ReverseStreamOp, anchor: false, line: self.line, span: self.span(start) }
            }
            b':' => {
                self.bump();
                Token { kind: RawKind::Colon, anchor: false, line: self.line, span: self.span(start) }
            }
            b'!' if matches!(self.peek_at(1), Some(b'=' | b'>' | b'<')) => self.read_operator(start),
            b'!' => {
                self.bump();
                let bang = Token {
                    kind: RawKind::Operator("!".to_string()),
                    anchor: false,
                    line: self.line,
                    span: self.span(start),
                };
                self.pending = Some(bang);
                Token { kind: RawKind::Name("null".to_string()), anchor: false, line: self.line, span: self.span(start) }
            }
            b if Self::bracket_kind(b).is_some() => {
                self.bump();
                let (kind, is_open) = Self::bracket_kind(b).expect("checked above");
                if is_open {
                    *self.depth_mut(kind) += 1;
                    Token { kind: RawKind::Open(kind), anchor, line: self.line, span: self.span(start) }
                } else {
                    let depth = self.depth_mut(kind);
                    if *depth == 0 {
                        return Some(Err(LexError::UnmatchedBracket { line: self.line }));
                    }
                    *depth -= 1;
                    Token { kind: RawKind::Close(kind), anchor, line: self.line, span: self.span(start) }
                }
            }
            b if SINGLE_CHAR_OPS.contains(&b) => self.read_operator(start),
            other => {
                return Some(Err(LexError::UnexpectedChar { ch: other as char, line: self.line }));
            }
        };
        tok.anchor = anchor;
        Some(Ok(tok))
    }
}

impl Iterator for Lexer<'_> {
    type Item = LexResult<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(tok) = self.pending.take() {
            return Some(Ok(tok));
        }
        match self.next_token() {
            Some(item) => Some(item),
            None => match self.check_balanced() {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use proptest::prelude::*;

    fn toks(src: &str) -> Vec<RawKind> {
        tokenize(src, SourceId(0)).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn comment_runs_to_newline() {
        pretty_assert_eq!(toks("// hi\n1"), vec![RawKind::Number("1".into())]);
    }

    #[test]
    fn string_with_escapes() {
        pretty_assert_eq!(toks(r#""a\nb""#), vec![RawKind::String(b"a\nb".to_vec())]);
    }

    #[test]
    fn unterminated_string_errors() {
        let err = tokenize("\"abc", SourceId(0)).unwrap_err();
        assert!(matches!(err, LexError::UnterminatedString { line: 1 }));
    }

    #[test]
    fn namespaced_name() {
        assert_eq!(toks("foo:bar"), vec![RawKind::Name("foo:bar".into())]);
    }

    #[test]
    fn anchor_prefix_on_name_and_bracket() {
        let tokens = tokenize("#exit #{ }", SourceId(0)).unwrap();
        assert!(tokens[0].anchor);
        assert_eq!(tokens[0].kind, RawKind::Name("exit".into()));
        assert!(tokens[1].anchor);
        assert_eq!(tokens[1].kind, RawKind::Open(BracketKind::Brace));
        assert!(!tokens[2].anchor);
    }

    #[test]
    fn two_char_operators_greedy() {
        assert_eq!(toks("!="), vec![RawKind::Operator("!=".into())]);
        assert_eq!(toks(">="), vec![RawKind::Operator(">=".into())]);
        assert_eq!(toks("**"), vec![RawKind::Operator("**".into())]);
    }

    #[test]
    fn bare_bang_rewrites_to_null_bang() {
        assert_eq!(
            toks("!true"),
            vec![RawKind::Name("null".into()), RawKind::Operator("!".into()), RawKind::Name("true".into())]
        );
    }

    #[test]
    fn bang_equals_is_one_token() {
        assert_eq!(toks("!= true"), vec![RawKind::Operator("!=".into()), RawKind::Name("true".into())]);
    }

    #[test]
    fn stream_operator() {
        assert_eq!(toks("a << b"), vec![
            RawKind::Name("a".into()),
            RawKind::StreamOp,
            RawKind::Name("b".into()),
        ]);
    }

    #[test]
    fn arg_levels() {
        assert_eq!(toks("@"), vec![RawKind::Arg(0)]);
        assert_eq!(toks("@@"), vec![RawKind::Arg(1)]);
        assert_eq!(toks("@@@"), vec![RawKind::Arg(2)]);
    }

    #[test]
    fn unmatched_close_bracket_errors() {
        assert!(matches!(tokenize(")", SourceId(0)), Err(LexError::UnmatchedBracket { .. })));
    }

    #[test]
    fn unterminated_bracket_errors_at_eof() {
        assert!(matches!(tokenize("(", SourceId(0)), Err(LexError::UnmatchedBracket { .. })));
    }

    #[test]
    fn line_numbers_track_newlines() {
        let tokens = tokenize("a\nb\nc", SourceId(0)).unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].line, 3);
    }

    proptest! {
        #[test]
        fn arg_run_length_matches_at_sign_count(n in 1usize..32) {
            let src = "@".repeat(n);
            let tokens = toks(&src);
            prop_assert_eq!(tokens.len(), 1);
            prop_assert_eq!(tokens[0].clone(), RawKind::Arg((n - 1) as u8));
        }

        #[test]
        fn plain_integer_literal_tokenizes_as_number(n in 0i64..1_000_000) {
            let src = n.to_string();
            prop_assert_eq!(toks(&src), vec![RawKind::Number(src)]);
        }
    }
}
