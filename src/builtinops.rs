//! Built-in operations registry.
//!
//! Every name seeded into a fresh root environment is described here once, with its
//! kind and arity:
//!
//! ```scheme
//! (+ 1 2 3)              ; arithmetic
//! (< 1 2 3)              ; chained comparison
//! (car '(1 2 3))         ; list operations
//! (if (null? x) 0 1)     ; special form
//! ```
//!
//! ## Functions vs Special Forms
//!
//! - **Functions** receive their operands already evaluated by the shared operand
//!   protocol (see `evaluator::operands`), after which arity is checked; a mismatch is a
//!   `RuntimeError`.
//! - **Special forms** receive the unevaluated argument list together with the calling
//!   environment and validate their own shape (mostly `SyntaxError` on mismatch).
//!
//! ## Semantics worth knowing
//!
//! - `-` and `/` with a single operand return it unchanged; they do not negate or invert.
//! - Comparisons with fewer than two operands are vacuously `#t`.
//! - Arithmetic is checked: overflow and division by zero are `RuntimeError`s.
//! - `cdr` and `list-tail` return a freshly built spine, except that `cdr` of a dotted
//!   pair `(a . b)` returns `b` itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::Error;
use crate::ast::{FALSE, NumberType, TRUE, Value, walk_list};
use crate::evaluator::operands::{NumIter, number_arg, pair_arg, proper_list_arg};
use crate::evaluator::{
    eval_and, eval_define, eval_if, eval_lambda, eval_or, eval_quote, eval_set, eval_set_car,
    eval_set_cdr,
};
use crate::heap::{EnvId, Heap, ValueId};

pub(crate) const QUOTE: &str = "quote";
pub(crate) const LAMBDA: &str = "lambda";

/// Builtin function over evaluated operands
pub type BuiltinFn = fn(&mut Heap, &[Option<ValueId>]) -> Result<Option<ValueId>, Error>;

/// Special form over the unevaluated argument list, calling environment and current depth
pub type SpecialFormFn =
    fn(&mut Heap, Option<ValueId>, EnvId, usize) -> Result<Option<ValueId>, Error>;

/// Represents the implementation of a built-in expression (function or special form)
#[derive(Clone, Copy)]
pub enum OpKind {
    Function(BuiltinFn),
    SpecialForm(SpecialFormFn),
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Function(_) => write!(f, "Function(<fn>)"),
            OpKind::SpecialForm(_) => write!(f, "SpecialForm(<fn>)"),
        }
    }
}

/// Accepted operand counts of a builtin function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == *n,
            Arity::AtLeast(n) => count >= *n,
            Arity::Any => true,
        }
    }

    pub(crate) fn validate(&self, name: &str, count: usize) -> Result<(), Error> {
        if self.accepts(count) {
            Ok(())
        } else {
            Err(Error::arity_error(name, self, count))
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Any => write!(f, "any number of"),
        }
    }
}

/// Definition of a built-in operation
#[derive(Debug, Clone)]
pub struct BuiltinOp {
    /// The Scheme identifier for this operation
    pub scheme_id: &'static str,
    pub op_kind: OpKind,
    /// Operand count for functions; special forms check their own shape
    pub arity: Arity,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.scheme_id == other.scheme_id
    }
}

impl BuiltinOp {
    pub fn is_special_form(&self) -> bool {
        matches!(self.op_kind, OpKind::SpecialForm(_))
    }

    pub(crate) fn validate_arity(&self, arg_count: usize) -> Result<(), Error> {
        self.arity.validate(self.scheme_id, arg_count)
    }
}

//
// Builtin Function Implementations
//

fn number(heap: &mut Heap, n: NumberType) -> Result<Option<ValueId>, Error> {
    Ok(Some(heap.number(n)))
}

fn boolean(heap: &mut Heap, b: bool) -> Result<Option<ValueId>, Error> {
    Ok(Some(heap.boolean(b)))
}

// Chained comparison: every adjacent pair must satisfy the operator. Operands are
// checked as they are reached, so nothing after the first failing pair is inspected.
macro_rules! numeric_comparison {
    ($name:ident, $op:tt, $op_str:expr) => {
        fn $name(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
            let mut holds = true;
            if let [first, rest @ ..] = args {
                let mut prev = number_arg(heap, *first, $op_str)?;
                for arg in rest {
                    let current = number_arg(heap, *arg, $op_str)?;
                    if !(prev $op current) {
                        holds = false;
                        break;
                    }
                    prev = current;
                }
            }
            boolean(heap, holds)
        }
    };
}

numeric_comparison!(builtin_eq, ==, "=");
numeric_comparison!(builtin_lt, <, "<");
numeric_comparison!(builtin_gt, >, ">");
numeric_comparison!(builtin_le, <=, "<=");
numeric_comparison!(builtin_ge, >=, ">=");

fn builtin_add(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let mut sum: NumberType = 0;
    for n in NumIter::new(heap, args, "+")? {
        sum = sum
            .checked_add(n)
            .ok_or_else(|| Error::runtime("Integer overflow in addition"))?;
    }
    number(heap, sum)
}

fn builtin_mul(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let mut product: NumberType = 1;
    for n in NumIter::new(heap, args, "*")? {
        product = product
            .checked_mul(n)
            .ok_or_else(|| Error::runtime("Integer overflow in multiplication"))?;
    }
    number(heap, product)
}

// A single operand is returned as is, not negated
fn builtin_sub(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let mut nums = NumIter::new(heap, args, "-")?;
    let Some(mut result) = nums.next() else {
        return Err(Error::arity_error("-", Arity::AtLeast(1), 0));
    };
    for n in nums {
        result = result
            .checked_sub(n)
            .ok_or_else(|| Error::runtime("Integer overflow in subtraction"))?;
    }
    number(heap, result)
}

// A single operand is returned as is, not inverted
fn builtin_div(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let mut nums = NumIter::new(heap, args, "/")?;
    let Some(mut result) = nums.next() else {
        return Err(Error::arity_error("/", Arity::AtLeast(1), 0));
    };
    for n in nums {
        if n == 0 {
            return Err(Error::runtime("Division by zero"));
        }
        result = result
            .checked_div(n)
            .ok_or_else(|| Error::runtime("Integer overflow in division"))?;
    }
    number(heap, result)
}

fn builtin_max(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let result = NumIter::new(heap, args, "max")?.max();
    match result {
        Some(n) => number(heap, n),
        None => Err(Error::arity_error("max", Arity::AtLeast(1), 0)),
    }
}

fn builtin_min(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let result = NumIter::new(heap, args, "min")?.min();
    match result {
        Some(n) => number(heap, n),
        None => Err(Error::arity_error("min", Arity::AtLeast(1), 0)),
    }
}

fn builtin_abs(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let [value] = args else {
        return Err(Error::arity_error("abs", Arity::Exact(1), args.len()));
    };
    let n = number_arg(heap, *value, "abs")?
        .checked_abs()
        .ok_or_else(|| Error::runtime("Integer overflow in abs"))?;
    number(heap, n)
}

// Predicates over a single operand
macro_rules! type_predicate {
    ($name:ident, $op_str:expr, |$heap:ident, $value:ident| $test:expr) => {
        fn $name(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
            let [value] = args else {
                return Err(Error::arity_error($op_str, Arity::Exact(1), args.len()));
            };
            let holds = {
                let $heap: &Heap = heap;
                let $value: Option<&Value> = value.map(|id| $heap.get(id));
                $test
            };
            boolean(heap, holds)
        }
    };
}

type_predicate!(builtin_is_number, "number?", |_heap, value| matches!(
    value,
    Some(Value::Number(_))
));

type_predicate!(builtin_is_boolean, "boolean?", |_heap, value| matches!(
    value,
    Some(Value::Symbol(name)) if name == TRUE || name == FALSE
));

type_predicate!(builtin_is_symbol, "symbol?", |_heap, value| matches!(
    value,
    Some(Value::Symbol(_))
));

type_predicate!(builtin_is_null, "null?", |_heap, value| value.is_none());

type_predicate!(builtin_not, "not", |_heap, value| matches!(
    value,
    Some(Value::Symbol(name)) if name == FALSE
));

// A pair of exactly two cells, or a dotted pair with a non-nil tail
type_predicate!(builtin_is_pair, "pair?", |heap, value| match value
    .and_then(Value::as_pair)
{
    Some((_, Some(second))) => match heap.get(second).as_pair() {
        Some((_, rest)) => rest.is_none(),
        None => true,
    },
    _ => false,
});

fn builtin_is_list(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let [value] = args else {
        return Err(Error::arity_error("list?", Arity::Exact(1), args.len()));
    };
    let holds = match value {
        None => true,
        Some(id) => heap.get(*id).is_pair() && walk_list(heap, Some(*id)).is_proper(),
    };
    boolean(heap, holds)
}

fn builtin_cons(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let [first, second] = args else {
        return Err(Error::arity_error("cons", Arity::Exact(2), args.len()));
    };
    Ok(Some(heap.cons(*first, *second)))
}

fn builtin_car(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let [value] = args else {
        return Err(Error::arity_error("car", Arity::Exact(1), args.len()));
    };
    let (_, first, _) = pair_arg(heap, *value, "car")?;
    Ok(first)
}

fn builtin_cdr(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let [value] = args else {
        return Err(Error::arity_error("cdr", Arity::Exact(1), args.len()));
    };
    let (_, _, second) = pair_arg(heap, *value, "cdr")?;
    match second {
        Some(tail) if heap.get(tail).is_pair() => {
            let walk = walk_list(heap, Some(tail));
            Ok(heap.list_from(&walk.items, walk.tail))
        }
        other => Ok(other),
    }
}

fn builtin_list(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    Ok(heap.list_from(args, None))
}

fn list_index(
    heap: &Heap,
    list: Option<ValueId>,
    index: Option<ValueId>,
    op_name: &str,
) -> Result<(Vec<Option<ValueId>>, usize), Error> {
    let walk = proper_list_arg(heap, list, op_name)?;
    let index = number_arg(heap, index, op_name)?;
    match usize::try_from(index) {
        Ok(i) if i < walk.items.len() => Ok((walk.items, i)),
        _ => Err(Error::runtime(format!(
            "{op_name}: index {index} out of bounds for list of length {}",
            walk.items.len()
        ))),
    }
}

fn builtin_list_ref(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let [list, index] = args else {
        return Err(Error::arity_error("list-ref", Arity::Exact(2), args.len()));
    };
    let (items, i) = list_index(heap, *list, *index, "list-ref")?;
    Ok(items[i])
}

fn builtin_list_tail(heap: &mut Heap, args: &[Option<ValueId>]) -> Result<Option<ValueId>, Error> {
    let [list, index] = args else {
        return Err(Error::arity_error("list-tail", Arity::Exact(2), args.len()));
    };
    let (items, i) = list_index(heap, *list, *index, "list-tail")?;
    Ok(heap.list_from(&items[i..], None))
}

/// Global registry of all built-in operations, in the order they are seeded into a
/// fresh root environment.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    fn function(scheme_id: &'static str, f: BuiltinFn, arity: Arity) -> BuiltinOp {
        BuiltinOp {
            scheme_id,
            op_kind: OpKind::Function(f),
            arity,
        }
    }

    fn special_form(scheme_id: &'static str, f: SpecialFormFn) -> BuiltinOp {
        BuiltinOp {
            scheme_id,
            op_kind: OpKind::SpecialForm(f),
            arity: Arity::Any,
        }
    }

    vec![
        // Arithmetic operations
        function("+", builtin_add, Arity::Any),
        function("-", builtin_sub, Arity::AtLeast(1)),
        function("*", builtin_mul, Arity::Any),
        function("/", builtin_div, Arity::AtLeast(1)),
        // Comparison operations
        function("=", builtin_eq, Arity::Any),
        function(">", builtin_gt, Arity::Any),
        function("<", builtin_lt, Arity::Any),
        function("<=", builtin_le, Arity::Any),
        function(">=", builtin_ge, Arity::Any),
        // Math operations
        function("min", builtin_min, Arity::AtLeast(1)),
        function("max", builtin_max, Arity::AtLeast(1)),
        function("abs", builtin_abs, Arity::Exact(1)),
        // Predicates
        function("number?", builtin_is_number, Arity::Exact(1)),
        special_form(QUOTE, eval_quote),
        function("boolean?", builtin_is_boolean, Arity::Exact(1)),
        function("not", builtin_not, Arity::Exact(1)),
        // Logical operations
        special_form("and", eval_and),
        special_form("or", eval_or),
        // List operations
        function("pair?", builtin_is_pair, Arity::Exact(1)),
        function("null?", builtin_is_null, Arity::Exact(1)),
        function("list?", builtin_is_list, Arity::Exact(1)),
        function("cons", builtin_cons, Arity::Exact(2)),
        function("car", builtin_car, Arity::Exact(1)),
        function("cdr", builtin_cdr, Arity::Exact(1)),
        function("list", builtin_list, Arity::Any),
        function("list-ref", builtin_list_ref, Arity::Exact(2)),
        function("list-tail", builtin_list_tail, Arity::Exact(2)),
        // Special forms for language constructs
        special_form("define", eval_define),
        special_form(LAMBDA, eval_lambda),
        special_form("set!", eval_set),
        special_form("if", eval_if),
        function("symbol?", builtin_is_symbol, Arity::Exact(1)),
        special_form("set-car!", eval_set_car),
        special_form("set-cdr!", eval_set_cdr),
    ]
});

/// Lazy static map from scheme_id to BuiltinOp
static BUILTIN_SCHEME: LazyLock<HashMap<&'static str, &'static BuiltinOp>> = LazyLock::new(|| {
    let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
    ops.iter().map(|op| (op.scheme_id, op)).collect()
});

/// All builtin operations, in seeding order
pub fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin operation by its Scheme identifier
pub fn find_scheme_op(id: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_SCHEME.get(id).copied()
}
