//! cellscheme - a small Scheme interpreter runtime
//!
//! This crate evaluates Scheme-like expressions over a heap of cells. Every value and
//! every environment lives in a [`heap::Heap`] arena and is linked to the nodes it keeps
//! alive through explicit dependency edges. After each top-level evaluation the heap is
//! swept from the session's root environment, so garbage created by mutation cycles
//! (`set-cdr!` loops, closures capturing their own scope) is reclaimed.
//!
//! ```scheme
//! (define (fact n) (if (= n 0) 1 (* n (fact (- n 1)))))
//! (fact 5)                  ; 120
//! (define l '(1 2 3))
//! (set-car! l 10)           ; l is now (10 2 3)
//! ((lambda (x) (+ 1 x)) 5)  ; 6
//! ```
//!
//! ## Language
//!
//! - Integers (`i64`) with checked arithmetic
//! - Symbols, with `#t` and `#f` doubling as the booleans
//! - Pairs and lists, including dotted pairs
//! - `lambda` closures, `define`, `set!`, `set-car!`, `set-cdr!`
//! - Only `#f` is false; every other value (nil included) is truthy
//!
//! ## Modules
//!
//! - `ast`: value model and formatting
//! - `heap`: node arena, dependency graph, mark-and-sweep collector
//! - `evaluator`: environments, special forms, procedure calls, interpreter session
//! - `builtinops`: registry of builtin operations and special forms
//! - `scheme`: S-expression reader (feature `scheme`)

use std::fmt;

/// Maximum parsing depth to prevent stack overflow on deeply nested input
pub const MAX_PARSE_DEPTH: usize = 64;

/// Maximum evaluation depth to prevent stack overflow in recursive evaluation.
/// Every nested evaluation (argument, branch, body expression) counts as one level,
/// so a recursive procedure uses a handful of levels per call.
pub const MAX_EVAL_DEPTH: usize = 512;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete (unclosed parens, dangling quote)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// Extra input found after a complete, valid expression
    TrailingContent,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
    /// The problematic token or character encountered, if identifiable
    pub found: Option<String>,
}

impl ParseError {
    pub fn new(
        kind: ParseErrorKind,
        message: impl Into<String>,
        context: Option<String>,
        found: Option<String>,
    ) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
            found,
        }
    }

    /// Create a simple ParseError with a kind and message but no context
    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, None, None)
    }

    /// Create a ParseError with context extracted from input at a given byte offset
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        let context_start = error_offset.saturating_sub(20);
        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.len() < input.len() {
            display_context.push_str("[...]");
        }
        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        let found = input
            .get(error_offset..)
            .and_then(|rest| rest.chars().next())
            .map(String::from);

        Self::new(kind, message, Some(display_context), found)
    }
}

/// Error types for the interpreter
///
/// Syntax, name and runtime errors abort the current top-level evaluation only;
/// the interpreter session and its bindings stay usable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ParseError(ParseError),
    /// Malformed special form or combination shape
    SyntaxError(String),
    /// Unbound symbol
    NameError(String),
    /// Type mismatch, bad arity, out of bounds, uncallable or unprintable value
    RuntimeError(String),
}

impl Error {
    pub(crate) fn syntax(msg: impl Into<String>) -> Self {
        Error::SyntaxError(msg.into())
    }

    pub(crate) fn runtime(msg: impl Into<String>) -> Self {
        Error::RuntimeError(msg.into())
    }

    pub(crate) fn unbound(name: &str) -> Self {
        Error::NameError(format!("unbound variable: {name}"))
    }

    pub(crate) fn arity_error(name: &str, expected: impl fmt::Display, got: usize) -> Self {
        Error::RuntimeError(format!(
            "{name}: expected {expected} arguments, got {got}"
        ))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ParseError(e) => {
                write!(f, "ParseError: {}", e.message)?;
                if let Some(found) = &e.found {
                    write!(f, "\nFound: {found}")?;
                }
                if let Some(context) = &e.context {
                    write!(f, "\nContext: {context}")?;
                }
                Ok(())
            }
            Error::SyntaxError(msg) => write!(f, "SyntaxError: {msg}"),
            Error::NameError(msg) => write!(f, "NameError: {msg}"),
            Error::RuntimeError(msg) => write!(f, "RuntimeError: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod heap;

#[cfg(feature = "scheme")]
pub mod scheme;

pub use evaluator::{Interpreter, InterpreterConfig, SweepPolicy};
