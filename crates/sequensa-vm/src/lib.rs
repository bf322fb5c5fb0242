//! sequensa-vm — the stream-dataflow executor.
//!
//! An [`Executor`] walks a compiled bytecode buffer right-to-left within
//! each stream record, resolving `Arg`/`Expression` tokens, applying
//! anchored values to the accumulator built so far, and dispatching VM
//! calls (`return`/`break`/`final`/`again`/`emit`/`exit`) to control the
//! enclosing function's iteration. [`execute`] is the single entry point:
//! it runs a top-level buffer against a list of input values and an
//! [`ExecutorOptions`] (native functions, pre-bound globals, strictness).

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::{boxed::Box, string::String, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, format, string::String, vec::Vec};

use indexmap::IndexMap;
use sequensa_bytecode::{
    read_value, BytecodeError, DataType, ExprOperator, FlowClause, Fraction, Tags, Value, ValueKind, VmCall,
};
use sequensa_core::ByteReader;
use thiserror::Error;

/* ─────────────────────────── Errors ─────────────────────────── */

/// A failure in program semantics, as opposed to a malformed buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A `Name` lookup (non-strict-mode callers get an empty result instead).
    #[error("undefined variable {0:?}")]
    UndefinedVariable(Vec<u8>),
    /// `again` fired on the synthetic end-of-stream iteration.
    #[error("`again` is not valid on the end iteration")]
    AgainOnEnd,
    /// A cast whose target `Type` has no defined conversion.
    #[error("no cast defined for target type {0:?}")]
    InvalidCast(DataType),
    /// An operator applied to operands of incompatible kinds, in strict-math mode.
    #[error("operator {0:?} is not defined for these operand types")]
    OperatorMismatch(ExprOperator),
    /// Division or modulo by zero, in strict-math mode.
    #[error("division by zero")]
    DivisionByZero,
}

/// Errors surfaced while executing a buffer.
///
/// [`ExecError::Exit`] is not really a failure: it is how the `exit` VM call
/// unwinds every enclosing function call back to [`execute`], using `?`
/// propagation in place of a thrown exception.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecError<'a> {
    /// A malformed bytecode buffer.
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    /// A program semantics failure.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// A shape the decoder should never produce (e.g. a non-`Stream` value
    /// where a function body record was expected).
    #[error("internal executor error: {0}")]
    Internal(String),
    /// `exit` fired: carries the program's final result, unwinding to [`execute`].
    #[error("program exited")]
    Exit(Vec<Value<'a>>),
}

/// Convenience alias for executor results.
pub type ExecResult<'a, T> = Result<T, ExecError<'a>>;

/* ─────────────────────────── Options ─────────────────────────── */

/// A host-provided native function: takes the accumulator it was anchor-applied
/// to and returns its replacement.
pub type NativeFn<'a> = Box<dyn Fn(&[Value<'a>]) -> ExecResult<'a, Vec<Value<'a>>> + 'a>;

/// Configuration for an [`Executor`]: native functions, pre-bound globals,
/// and the strict-math toggle.
pub struct ExecutorOptions<'a> {
    strict_math: bool,
    natives: IndexMap<Vec<u8>, NativeFn<'a>>,
    globals: IndexMap<Vec<u8>, Vec<Value<'a>>>,
}

impl<'a> Default for ExecutorOptions<'a> {
    fn default() -> Self {
        Self { strict_math: false, natives: IndexMap::new(), globals: IndexMap::new() }
    }
}

impl<'a> ExecutorOptions<'a> {
    /// An empty option set: lenient arithmetic, no natives, no globals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// In strict mode, operator/cast mismatches and undefined variables are
    /// errors instead of falling back to `Null`/an empty result.
    #[must_use]
    pub fn with_strict_math(mut self, strict: bool) -> Self {
        self.strict_math = strict;
        self
    }

    /// Register a native function, callable by name like any bound variable.
    #[must_use]
    pub fn with_native(mut self, name: impl Into<Vec<u8>>, f: impl Fn(&[Value<'a>]) -> ExecResult<'a, Vec<Value<'a>>> + 'a) -> Self {
        self.natives.insert(name.into(), Box::new(f));
        self
    }

    /// Pre-bind a variable at the outermost stack level.
    #[must_use]
    pub fn with_global(mut self, name: impl Into<Vec<u8>>, values: Vec<Value<'a>>) -> Self {
        self.globals.insert(name.into(), values);
        self
    }
}

/* ─────────────────────────── Stack ─────────────────────────── */

struct StackLevel<'a> {
    arg: Value<'a>,
    vars: IndexMap<Vec<u8>, Vec<Value<'a>>>,
}

impl<'a> StackLevel<'a> {
    fn new() -> Self {
        Self { arg: Value::new(false, ValueKind::Null), vars: IndexMap::new() }
    }
}

/// What a stream record's scan decided, once it reaches the end of its
/// value list or fires a non-exiting VM call.
enum StreamOutcome<'a> {
    /// No VM call fired; the accumulator is discarded.
    None(Vec<Value<'a>>),
    /// `return`: append and keep iterating.
    Return(Vec<Value<'a>>),
    /// `break`: abandon the function, nothing appended.
    Break(Vec<Value<'a>>),
    /// `final`: append, then abandon the function.
    Final(Vec<Value<'a>>),
    /// `again`: splice back into the input right after the current position.
    Again(Vec<Value<'a>>),
}

impl<'a> StreamOutcome<'a> {
    fn from_call(call: VmCall, payload: Vec<Value<'a>>) -> ExecResult<'a, Self> {
        match call {
            VmCall::Return => Ok(Self::Return(payload)),
            VmCall::Break => Ok(Self::Break(payload)),
            VmCall::Final => Ok(Self::Final(payload)),
            VmCall::Again => Ok(Self::Again(payload)),
            VmCall::Exit => Err(ExecError::Exit(payload)),
            VmCall::Emit => unreachable!("emit is intercepted in run_stream before this dispatch"),
        }
    }
}

/* ─────────────────────────── Executor ─────────────────────────── */

/// Runs compiled Sequensa bytecode.
pub struct Executor<'a> {
    options: ExecutorOptions<'a>,
    stack: Vec<StackLevel<'a>>,
}

impl<'a> Executor<'a> {
    /// A fresh executor over the given options, with an empty call stack.
    #[must_use]
    pub fn new(options: ExecutorOptions<'a>) -> Self {
        Self { options, stack: Vec::new() }
    }

    /// Call a function body with `input` as its argument stream. Pushes a
    /// new stack level (seeded with the configured globals only at the
    /// outermost call) and always pops it again, even on error.
    ///
    /// Every invocation -- outermost or nested through anchor application --
    /// runs once per input value plus the synthetic `END`-tagged pass, per
    /// spec §4.7. An untagged record no longer fires on that synthetic pass
    /// (see [`Tags::matches`]), which is what keeps a recursive function's
    /// unconditional `return`/`final` records from running again on the
    /// `Null` end-argument; only a record explicitly tagged `end;` sees it.
    fn call_function(&mut self, body: ByteReader<'a>, input: Vec<Value<'a>>) -> ExecResult<'a, Vec<Value<'a>>> {
        let mut level = StackLevel::new();
        if self.stack.is_empty() {
            for (name, values) in &self.options.globals {
                level.vars.insert(name.clone(), values.clone());
            }
        }
        self.stack.push(level);
        let result = self.run_function(body, input);
        self.stack.pop();
        result
    }

    fn run_function(&mut self, body: ByteReader<'a>, mut input: Vec<Value<'a>>) -> ExecResult<'a, Vec<Value<'a>>> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        loop {
            let len = input.len();
            let active = Tags::for_position(pos, len);
            let arg = if pos < len { input[pos].clone() } else { Value::new(false, ValueKind::Null) };
            if let Some(top) = self.stack.last_mut() {
                top.arg = arg;
            }

            let mut reader = body;
            while reader.has_next() {
                let record = read_value(&mut reader)?;
                let ValueKind::Stream { tags, body: rec_body } = record.kind else {
                    return Err(ExecError::Internal("function body must contain only Stream records".into()));
                };
                if !tags.matches(active) {
                    continue;
                }
                match self.run_stream(rec_body)? {
                    StreamOutcome::None(_) => {}
                    StreamOutcome::Return(acc) => out.extend(acc),
                    StreamOutcome::Break(_) => return Ok(out),
                    StreamOutcome::Final(acc) => {
                        out.extend(acc);
                        return Ok(out);
                    }
                    StreamOutcome::Again(acc) => {
                        if pos >= len {
                            return Err(RuntimeError::AgainOnEnd.into());
                        }
                        for (i, v) in acc.into_iter().enumerate() {
                            input.insert(pos + 1 + i, v);
                        }
                    }
                }
            }

            if pos == len {
                break;
            }
            pos += 1;
        }
        Ok(out)
    }

    /// Scan one stream record's values right-to-left, maintaining the
    /// accumulator in true left-to-right order throughout (prepending via
    /// `insert` rather than pushing-then-reversing at anchor time).
    fn run_stream(&mut self, body: ByteReader<'a>) -> ExecResult<'a, StreamOutcome<'a>> {
        let mut values = Vec::new();
        let mut reader = body;
        while reader.has_next() {
            values.push(read_value(&mut reader)?);
        }

        let mut acc: Vec<Value<'a>> = Vec::new();
        for token in values.into_iter().rev() {
            let anchor = token.anchor;
            let v = self.eval(token)?;

            if anchor {
                if let ValueKind::VmCall(VmCall::Emit) = v.kind {
                    if acc.is_empty() {
                        acc.push(Value::new(false, ValueKind::Null));
                    }
                    continue;
                }
                if acc.is_empty() {
                    continue;
                }
                if let ValueKind::VmCall(call) = v.kind {
                    return StreamOutcome::from_call(call, acc);
                }
                acc = self.apply_anchor(v, acc)?;
                continue;
            }

            if let ValueKind::Name { define, name } = v.kind {
                if define {
                    self.bind(&name, acc.clone());
                    acc.clear();
                } else {
                    let resolved = self.lookup(&name)?;
                    for (i, rv) in resolved.into_iter().enumerate() {
                        acc.insert(i, rv);
                    }
                }
                continue;
            }

            acc.insert(0, v);
        }

        Ok(StreamOutcome::None(acc))
    }

    /// Resolve `Arg`/`Expression` tokens to concrete values; anything else
    /// passes through unchanged. The resolved value's anchor is forced to
    /// the original token's anchor (it propagates through resolution).
    fn eval(&mut self, v: Value<'a>) -> ExecResult<'a, Value<'a>> {
        let Value { anchor, kind } = v;
        match kind {
            ValueKind::Arg(level) => {
                let mut resolved = self.resolve_arg(level);
                resolved.anchor = anchor;
                Ok(resolved)
            }
            ValueKind::Expression { op, mut left, mut right } => {
                let lv = read_value(&mut left)?;
                let lv = self.eval(lv)?;
                let rv = read_value(&mut right)?;
                let rv = self.eval(rv)?;
                let mut result = self.apply_operator(op, lv, rv)?;
                result.anchor = anchor;
                Ok(result)
            }
            other => Ok(Value::new(anchor, other)),
        }
    }

    fn resolve_arg(&self, level: u8) -> Value<'a> {
        let top = self.stack.len();
        let idx = top.checked_sub(1).and_then(|t| t.checked_sub(level as usize));
        idx.and_then(|i| self.stack.get(i)).map_or_else(|| Value::new(false, ValueKind::Null), |lvl| lvl.arg.clone())
    }

    fn bind(&mut self, name: &[u8], values: Vec<Value<'a>>) {
        if let Some(top) = self.stack.last_mut() {
            top.vars.insert(name.to_vec(), values);
        }
    }

    fn lookup(&self, name: &[u8]) -> ExecResult<'a, Vec<Value<'a>>> {
        for level in self.stack.iter().rev() {
            if let Some(values) = level.vars.get(name) {
                return Ok(values.clone());
            }
        }
        if self.options.strict_math {
            Err(RuntimeError::UndefinedVariable(name.to_vec()).into())
        } else {
            Ok(Vec::new())
        }
    }

    /// Apply an anchored, already-resolved value to the accumulator built
    /// so far, per its kind.
    fn apply_anchor(&mut self, v: Value<'a>, stream: Vec<Value<'a>>) -> ExecResult<'a, Vec<Value<'a>>> {
        match v.kind {
            ValueKind::Name { define: false, name } => self.apply_name_anchor(&name, stream),
            ValueKind::Function(body) => self.call_function(body, stream),
            ValueKind::Flowc(clauses) => Ok(stream
                .into_iter()
                .filter(|x| clauses.iter().any(|c| clause_matches(c, x)))
                .collect()),
            other => stream.into_iter().map(|x| cast_one(&Value::new(v.anchor, other.clone()), &x)).collect(),
        }
    }

    /// `name:false` anchor-applied: native functions take priority; a
    /// bound variable's values are each anchor-applied in turn (right to
    /// left), a pragmatic reading of "execute the resolved stream followed
    /// by the input as a nested stream record" (see `DESIGN.md`).
    fn apply_name_anchor(&mut self, name: &[u8], stream: Vec<Value<'a>>) -> ExecResult<'a, Vec<Value<'a>>> {
        if let Some(native) = self.options.natives.get(name) {
            return native(&stream);
        }
        let bound = self.lookup(name)?;
        if bound.is_empty() {
            return Ok(stream);
        }
        let mut acc = stream;
        for bv in bound.into_iter().rev() {
            acc = self.apply_anchor(bv, acc)?;
        }
        Ok(acc)
    }

    fn apply_operator(&mut self, op: ExprOperator, left: Value<'a>, right: Value<'a>) -> ExecResult<'a, Value<'a>> {
        if op.is_unary() {
            return self.apply_unary(op, right);
        }

        match op {
            ExprOperator::And => return Ok(bool_val(truthy(&left) && truthy(&right))),
            ExprOperator::Or => return Ok(bool_val(truthy(&left) || truthy(&right))),
            ExprOperator::Xor => return Ok(bool_val(truthy(&left) != truthy(&right))),
            _ => {}
        }

        if let (Some(l), Some(r)) = (as_numeric(&left), as_numeric(&right)) {
            return self.numeric_op(op, l, r);
        }
        if let (ValueKind::String(l), ValueKind::String(r)) = (&left.kind, &right.kind) {
            return self.string_op(op, l, r);
        }
        if self.options.strict_math {
            Err(RuntimeError::OperatorMismatch(op).into())
        } else {
            Ok(Value::new(false, ValueKind::Null))
        }
    }

    fn apply_unary(&mut self, op: ExprOperator, right: Value<'a>) -> ExecResult<'a, Value<'a>> {
        match op {
            ExprOperator::Not => Ok(bool_val(!truthy(&right))),
            ExprOperator::BinaryNot => Ok(num(Fraction::from_f64(!to_i64(&right) as f64))),
            other => unreachable!("{other:?} is not unary"),
        }
    }

    fn numeric_op(&mut self, op: ExprOperator, l: Fraction, r: Fraction) -> ExecResult<'a, Value<'a>> {
        if op.truncates_to_integer() {
            let (li, ri) = (l.as_f64() as i64, r.as_f64() as i64);
            let result = match op {
                ExprOperator::Mod => {
                    if ri == 0 {
                        return self.div_by_zero();
                    }
                    li % ri
                }
                ExprOperator::BitAnd => li & ri,
                ExprOperator::BitOr => li | ri,
                ExprOperator::BitXor => li ^ ri,
                other => unreachable!("{other:?} does not truncate to integer"),
            };
            return Ok(num(Fraction::from_f64(result as f64)));
        }

        match op {
            ExprOperator::Add => Ok(num(Fraction::from_f64(l.as_f64() + r.as_f64()))),
            ExprOperator::Sub => Ok(num(Fraction::from_f64(l.as_f64() - r.as_f64()))),
            ExprOperator::Mul => Ok(num(Fraction::from_f64(l.as_f64() * r.as_f64()))),
            ExprOperator::Pow => Ok(num(Fraction::from_f64(l.as_f64().powf(r.as_f64())))),
            ExprOperator::Div => {
                if r.as_f64() == 0.0 {
                    return self.div_by_zero();
                }
                Ok(num(Fraction::from_f64(l.as_f64() / r.as_f64())))
            }
            ExprOperator::Eq => Ok(bool_val(l == r)),
            ExprOperator::NotEq => Ok(bool_val(l != r)),
            ExprOperator::Gt => Ok(bool_val(l.as_f64() > r.as_f64())),
            ExprOperator::Lt => Ok(bool_val(l.as_f64() < r.as_f64())),
            ExprOperator::NotGreater => Ok(bool_val(l.as_f64() <= r.as_f64())),
            ExprOperator::NotLess => Ok(bool_val(l.as_f64() >= r.as_f64())),
            other => unreachable!("{other:?} handled above or is not binary"),
        }
    }

    fn string_op(&mut self, op: ExprOperator, l: &[u8], r: &[u8]) -> ExecResult<'a, Value<'a>> {
        match op {
            ExprOperator::Add => {
                let mut s = l.to_vec();
                s.extend_from_slice(r);
                Ok(Value::new(false, ValueKind::String(s)))
            }
            ExprOperator::Eq => Ok(bool_val(l == r)),
            ExprOperator::NotEq => Ok(bool_val(l != r)),
            other => {
                if self.options.strict_math {
                    Err(RuntimeError::OperatorMismatch(other).into())
                } else {
                    Ok(Value::new(false, ValueKind::Null))
                }
            }
        }
    }

    fn div_by_zero(&self) -> ExecResult<'a, Value<'a>> {
        if self.options.strict_math {
            Err(RuntimeError::DivisionByZero.into())
        } else {
            Ok(Value::new(false, ValueKind::Null))
        }
    }
}

/* ─────────────────────────── Casts & coercion ─────────────────────────── */

fn num<'a>(f: Fraction) -> Value<'a> {
    Value::new(false, ValueKind::Number(f))
}

fn bool_val<'a>(b: bool) -> Value<'a> {
    Value::new(false, ValueKind::Bool(b))
}

fn as_numeric(v: &Value<'_>) -> Option<Fraction> {
    match &v.kind {
        ValueKind::Number(f) => Some(*f),
        ValueKind::Bool(b) => Some(Fraction::integer(i64::from(*b))),
        _ => None,
    }
}

fn to_number(v: &Value<'_>) -> Fraction {
    match &v.kind {
        ValueKind::Number(f) => *f,
        ValueKind::Bool(b) => Fraction::integer(i64::from(*b)),
        ValueKind::Null => Fraction::integer(0),
        ValueKind::String(s) => core::str::from_utf8(s)
            .ok()
            .and_then(|text| text.trim().parse::<f64>().ok())
            .map_or_else(|| Fraction::integer(0), Fraction::from_f64),
        ValueKind::VmCall(_) | ValueKind::Flowc(_) | ValueKind::Function(_) => Fraction::integer(1),
        _ => Fraction::integer(0),
    }
}

fn truthy(v: &Value<'_>) -> bool {
    to_number(v).as_f64() != 0.0
}

fn to_bool(v: &Value<'_>) -> bool {
    truthy(v)
}

fn to_i64(v: &Value<'_>) -> i64 {
    to_number(v).as_f64() as i64
}

fn to_string_bytes(v: &Value<'_>) -> Vec<u8> {
    match &v.kind {
        ValueKind::Bool(true) => b"true".to_vec(),
        ValueKind::Bool(false) => b"false".to_vec(),
        ValueKind::Null => b"null".to_vec(),
        ValueKind::Number(f) => {
            if f.is_integer() {
                format!("{}", f.as_f64() as i64)
            } else {
                format!("{}", f.as_f64())
            }
            .into_bytes()
        }
        ValueKind::String(s) => s.clone(),
        ValueKind::VmCall(_) | ValueKind::Function(_) => b"func".to_vec(),
        ValueKind::Flowc(_) => b"flowc".to_vec(),
        _ => Vec::new(),
    }
}

/// Cast `x` to `target`'s kind: `Type(dt)` dispatches on `dt`; any other
/// kind is a literal cast, which ignores `x` entirely and yields the
/// literal itself (unanchored).
fn cast_one<'a>(target: &Value<'a>, x: &Value<'a>) -> ExecResult<'a, Value<'a>> {
    let ValueKind::Type(dt) = &target.kind else {
        return Ok(target.clone().unanchored());
    };
    match dt {
        DataType::Bool => Ok(bool_val(to_bool(x))),
        DataType::Number => Ok(num(to_number(x))),
        DataType::String => Ok(Value::new(false, ValueKind::String(to_string_bytes(x)))),
        other => Err(RuntimeError::InvalidCast(*other).into()),
    }
}

fn clause_matches(clause: &FlowClause<'_>, x: &Value<'_>) -> bool {
    match clause {
        FlowClause::Type(t) => x.data_type() == *t,
        FlowClause::Value(v) => match (&v.kind, &x.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Bool(a), ValueKind::Bool(b)) => a == b,
            (ValueKind::Number(a), ValueKind::Number(b)) => a == b,
            _ => false,
        },
        FlowClause::Range(lo, hi) => match &x.kind {
            ValueKind::Number(n) => n.as_f64() > lo.as_f64() && n.as_f64() < hi.as_f64(),
            _ => false,
        },
    }
}

/* ─────────────────────────── Entry point ─────────────────────────── */

/// Execute a top-level bytecode buffer against `args`, returning the
/// program's final stream.
///
/// Defaults to `[Null]` when the top-level function returns nothing, and
/// unwraps an `exit`-triggered [`ExecError::Exit`] into the program's final
/// `Ok` result.
pub fn execute<'a>(buffer: &'a [u8], args: Vec<Value<'a>>, options: ExecutorOptions<'a>) -> ExecResult<'a, Vec<Value<'a>>> {
    let mut exec = Executor::new(options);
    let body = ByteReader::new(buffer);
    match exec.call_function(body, args) {
        Ok(out) if out.is_empty() => Ok(vec![Value::new(false, ValueKind::Null)]),
        Ok(out) => Ok(out),
        Err(ExecError::Exit(payload)) => Ok(payload),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use proptest::prelude::*;
    use sequensa_compiler::compile;

    fn run(src: &str, args: Vec<Value<'_>>, options: ExecutorOptions<'_>) -> Vec<Value<'_>> {
        let bytes = compile(src).unwrap();
        // Leak rather than borrow: keeps the buffer alive for the executor's lifetime in tests.
        let bytes: &'static [u8] = &*Vec::leak(bytes);
        execute(bytes, args, options).unwrap()
    }

    fn as_string(v: &Value<'_>) -> Vec<u8> {
        match &v.kind {
            ValueKind::String(s) => s.clone(),
            other => panic!("expected String, got {other:?}"),
        }
    }

    fn as_number(v: &Value<'_>) -> f64 {
        match &v.kind {
            ValueKind::Number(f) => f.as_f64(),
            other => panic!("expected Number, got {other:?}"),
        }
    }

    fn as_bool(v: &Value<'_>) -> bool {
        match &v.kind {
            ValueKind::Bool(b) => *b,
            other => panic!("expected Bool, got {other:?}"),
        }
    }

    #[test]
    fn hello_world_exit() {
        let out = run(r#"#exit << "Hello World!""#, Vec::new(), ExecutorOptions::default());
        assert_eq!(out.len(), 1);
        assert_eq!(as_string(&out[0]), b"Hello World!");
    }

    #[test]
    fn arithmetic_expression() {
        let src = "#exit << ( 8 ** 2 * 9 - 5 * (( 12 + 12 - 25 ) ** 2) / 5 )";
        let out = run(src, Vec::new(), ExecutorOptions::default());
        assert_eq!(out.len(), 1);
        assert!((as_number(&out[0]) - 575.0).abs() < 1e-6);
    }

    #[test]
    fn flowc_strict_range_filters_values() {
        let src = r#"#exit << #[1:5] << 1 << null << 2 << "hello" << 3 << true << 4 << 5 << null"#;
        let out = run(src, Vec::new(), ExecutorOptions::default());
        let nums: Vec<f64> = out.iter().map(as_number).collect();
        assert_eq!(nums, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn fibonacci_via_recursion_and_native_sum() {
        let src = "set fib << {\n    #final << #@ << #[true] << (@ <= 1)\n    #return << #sum << #fib << (@ - 1) << (@ - 2)\n}\n#exit << #fib << 9 << 11";
        let options = ExecutorOptions::default().with_native("sum", |args: &[Value<'_>]| {
            let total: f64 = args.iter().map(|v| to_number(v).as_f64()).sum();
            Ok(vec![num(Fraction::from_f64(total))])
        });
        let out = run(src, Vec::new(), options);
        let nums: Vec<f64> = out.iter().map(as_number).collect();
        assert_eq!(nums, vec![34.0, 89.0]);
    }

    #[test]
    fn again_loop_with_native_join() {
        let src = "set loopdown << {\n    #return << @\n    #again << #(@ - 1) << #[true] << (@ > 0)\n}\n#exit << #join << #String << #loopdown << 10";
        let options = ExecutorOptions::default().with_native("join", |args: &[Value<'_>]| {
            let mut s = Vec::new();
            for v in args {
                s.extend(to_string_bytes(v));
            }
            Ok(vec![Value::new(false, ValueKind::String(s))])
        });
        let out = run(src, Vec::new(), options);
        assert_eq!(out.len(), 1);
        assert_eq!(as_string(&out[0]), b"109876543210");
    }

    #[test]
    fn casts_to_bool() {
        let src = r#"#exit << #Bool << 1 << null << "hello""#;
        let out = run(src, Vec::new(), ExecutorOptions::default());
        let bools: Vec<bool> = out.iter().map(as_bool).collect();
        assert_eq!(bools, vec![true, false, false]);
    }

    #[test]
    fn tags_run_once_per_value_plus_one_end_iteration() {
        let src = "first; #return << \"F\"\nlast; #return << \"L\"\nend; #return << \"E\"";
        let args = vec![num(Fraction::integer(1)), num(Fraction::integer(2)), num(Fraction::integer(3))];
        let out = run(src, args, ExecutorOptions::default());
        let strs: Vec<Vec<u8>> = out.iter().map(as_string).collect();
        assert_eq!(strs, vec![b"F".to_vec(), b"L".to_vec(), b"E".to_vec()]);
    }

    #[test]
    fn nested_function_untagged_return_does_not_fire_on_its_own_end_pass() {
        // A nested call now always runs the synthetic END iteration (spec
        // section 4.7), same as the outermost call. An untagged `return`
        // must not fire on it, or a single-argument call would wrongly
        // produce two output values instead of one.
        let src = "set identity << { #return << @ }\n#exit << #identity << 5";
        let out = run(src, Vec::new(), ExecutorOptions::default());
        let nums: Vec<f64> = out.iter().map(as_number).collect();
        assert_eq!(nums, vec![5.0]);
    }

    #[test]
    fn nested_function_end_tagged_return_fires_once_on_its_own_end_pass() {
        // The counterpart: a record explicitly tagged `end;` inside a nested
        // call's body does see that call's own synthetic END iteration.
        let src = "set marker << { #return << @\nend; #return << \"done\" }\n#exit << #marker << 5";
        let out = run(src, Vec::new(), ExecutorOptions::default());
        assert_eq!(out.len(), 2);
        assert!((as_number(&out[0]) - 5.0).abs() < 1e-9);
        assert_eq!(as_string(&out[1]), b"done");
    }

    #[test]
    fn stream_order_is_left_to_right() {
        let out = run("#exit << 1 << 2 << 3", Vec::new(), ExecutorOptions::default());
        let nums: Vec<f64> = out.iter().map(as_number).collect();
        pretty_assert_eq!(nums, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn undefined_variable_is_lenient_empty_by_default() {
        let out = run("#exit << #undefined_name << 1", Vec::new(), ExecutorOptions::default());
        // an undefined anchor-applied name passes its stream through unchanged
        let nums: Vec<f64> = out.iter().map(as_number).collect();
        assert_eq!(nums, vec![1.0]);
    }

    #[test]
    fn undefined_variable_errors_in_strict_mode() {
        let bytes = compile("#exit << #undefined_name << 1").unwrap();
        let bytes: &'static [u8] = &*Vec::leak(bytes);
        let err = execute(bytes, Vec::new(), ExecutorOptions::default().with_strict_math(true)).unwrap_err();
        assert!(matches!(err, ExecError::Runtime(RuntimeError::UndefinedVariable(_))));
    }

    proptest! {
        #[test]
        fn stream_of_integers_passes_through_exit_unchanged(ns in prop::collection::vec(0i64..1000, 1..8)) {
            let src = format!(
                "#exit << {}",
                ns.iter().map(ToString::to_string).collect::<Vec<_>>().join(" << ")
            );
            let out = run(&src, Vec::new(), ExecutorOptions::default());
            let got: Vec<f64> = out.iter().map(as_number).collect();
            let want: Vec<f64> = ns.iter().map(|&n| n as f64).collect();
            prop_assert_eq!(got, want);
        }
    }
}
