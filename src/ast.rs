//! This module defines the runtime value model. Every [`Value`] lives in the
//! [`Heap`](crate::heap::Heap) and refers to other values through [`ValueId`] handles;
//! nil is represented by `None` rather than by a variant, so a value reference is always
//! an `Option<ValueId>`. The module also provides list walking helpers shared by the
//! evaluator and builtins, truthiness, and the textual formatting contract
//! ([`format_value`]) used to print evaluation results.

use std::collections::HashSet;

use crate::Error;
use crate::builtinops::BuiltinOp;
use crate::heap::{EnvId, Heap, NodeId, ValueId};

/// Type alias for number values in interpreter
pub type NumberType = i64;

/// Symbol used for boolean true
pub const TRUE: &str = "#t";
/// Symbol used for boolean false
pub const FALSE: &str = "#f";

/// Allowed non-alphanumeric characters in Scheme symbol names
pub(crate) const SYMBOL_SPECIAL_CHARS: &str = "+-*/<>=!?_$";

/// Check if a string is a valid symbol name
/// Valid: non-empty, no leading digit, no sign followed by a digit, alphanumeric + SYMBOL_SPECIAL_CHARS
pub(crate) fn is_valid_symbol(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        None => false,
        Some(first_char) => {
            if first_char.is_ascii_digit() {
                return false;
            }

            if (first_char == '-' || first_char == '+')
                && let Some(second_char) = chars.next()
                && second_char.is_ascii_digit()
            {
                return false;
            }

            name.chars()
                .all(|c| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c))
        }
    }
}

/// `#t` and `#f` evaluate to themselves; every other symbol is a variable reference
pub(crate) fn is_boolean_literal(name: &str) -> bool {
    name == TRUE || name == FALSE
}

/// User-defined procedure
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub params: Vec<String>,
    /// Body expressions, evaluated in order; the last one gives the result
    pub body: Vec<Option<ValueId>>,
    /// Defining environment, present when the closure captures its context
    pub scope: Option<EnvId>,
    pub name: Option<String>,
}

impl Closure {
    pub fn captures_context(&self) -> bool {
        self.scope.is_some()
    }

    pub(crate) fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("lambda")
    }
}

/// Core runtime value
#[derive(Debug, Clone)]
pub enum Value {
    /// Numbers (integers only)
    Number(NumberType),
    /// Symbols; `#t` and `#f` double as booleans
    Symbol(String),
    /// Cons cell. `name` caches the symbol a pair was bound to by `define`,
    /// so `set-car!`/`set-cdr!` can re-resolve it.
    Pair {
        first: Option<ValueId>,
        second: Option<ValueId>,
        name: Option<ValueId>,
    },
    Closure(Closure),
    /// Handle to an entry of the builtin registry
    Builtin(&'static BuiltinOp),
}

impl Value {
    pub fn as_number(&self) -> Option<NumberType> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Value::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// `(first, second)` of a pair
    pub fn as_pair(&self) -> Option<(Option<ValueId>, Option<ValueId>)> {
        match self {
            Value::Pair { first, second, .. } => Some((*first, *second)),
            _ => None,
        }
    }

    pub fn is_pair(&self) -> bool {
        matches!(self, Value::Pair { .. })
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Builtin(_))
    }

    pub(crate) fn pair_name(&self) -> Option<ValueId> {
        match self {
            Value::Pair { name, .. } => *name,
            _ => None,
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Symbol(_) => "symbol",
            Value::Pair { .. } => "pair",
            Value::Closure(_) => "procedure",
            Value::Builtin(_) => "builtin operation",
        }
    }

    /// Nodes this value keeps alive; mirrored by the heap's dependency edges
    /// Whether one of this value's structural references points at `target`
    pub(crate) fn refers_to(&self, target: NodeId) -> bool {
        let is_target = |id: &Option<ValueId>| id.map(NodeId::from) == Some(target);
        match self {
            Value::Number(_) | Value::Symbol(_) | Value::Builtin(_) => false,
            Value::Pair {
                first,
                second,
                name,
            } => [first, second, name].into_iter().any(is_target),
            Value::Closure(closure) => {
                closure.body.iter().any(is_target)
                    || closure.scope.map(NodeId::from) == Some(target)
            }
        }
    }

    pub(crate) fn children(&self) -> Vec<NodeId> {
        match self {
            Value::Number(_) | Value::Symbol(_) | Value::Builtin(_) => Vec::new(),
            Value::Pair {
                first,
                second,
                name,
            } => [*first, *second, *name]
                .into_iter()
                .flatten()
                .map(NodeId::from)
                .collect(),
            Value::Closure(closure) => closure
                .body
                .iter()
                .flatten()
                .map(|id| NodeId::from(*id))
                .chain(closure.scope.map(NodeId::from))
                .collect(),
        }
    }
}

/// Only the symbol `#f` is false; nil and every other value are truthy
pub fn is_truthy(heap: &Heap, value: Option<ValueId>) -> bool {
    !matches!(
        value.map(|id| heap.get(id)),
        Some(Value::Symbol(name)) if name == FALSE
    )
}

pub(crate) fn symbol_name(heap: &Heap, value: Option<ValueId>) -> Option<String> {
    value
        .and_then(|id| heap.get(id).as_symbol())
        .map(str::to_owned)
}

/// Elements of a list spine plus its terminator.
///
/// `tail` is `None` for a proper list. For an improper list it holds the final
/// non-pair value; for a cyclic spine it holds the first pair seen twice.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ListWalk {
    pub items: Vec<Option<ValueId>>,
    pub tail: Option<ValueId>,
}

impl ListWalk {
    pub(crate) fn is_proper(&self) -> bool {
        self.tail.is_none()
    }
}

pub(crate) fn walk_list(heap: &Heap, head: Option<ValueId>) -> ListWalk {
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut current = head;

    while let Some(id) = current {
        let Some((first, second)) = heap.get(id).as_pair() else {
            break;
        };
        if !seen.insert(id) {
            break;
        }
        items.push(first);
        current = second;
    }

    ListWalk {
        items,
        tail: current,
    }
}

/// Render a value as an S-expression. Nil renders as `()`.
///
/// Procedures and builtin handles have no textual form and fail with a
/// `RuntimeError`, as does a structure that contains itself.
pub fn format_value(heap: &Heap, value: Option<ValueId>) -> Result<String, Error> {
    let mut out = String::new();
    let mut active = HashSet::new();
    write_value(heap, value, &mut out, &mut active)?;
    Ok(out)
}

fn write_value(
    heap: &Heap,
    value: Option<ValueId>,
    out: &mut String,
    active: &mut HashSet<ValueId>,
) -> Result<(), Error> {
    let Some(id) = value else {
        out.push_str("()");
        return Ok(());
    };

    match heap.get(id) {
        Value::Number(n) => {
            out.push_str(&n.to_string());
            Ok(())
        }
        Value::Symbol(name) => {
            out.push_str(name);
            Ok(())
        }
        Value::Pair { .. } => write_list(heap, id, out, active),
        Value::Closure(closure) => Err(Error::runtime(format!(
            "cannot format procedure {}",
            closure.display_name()
        ))),
        Value::Builtin(op) => Err(Error::runtime(format!(
            "cannot format builtin operation {}",
            op.scheme_id
        ))),
    }
}

fn write_list(
    heap: &Heap,
    head: ValueId,
    out: &mut String,
    active: &mut HashSet<ValueId>,
) -> Result<(), Error> {
    let mut spine = Vec::new();
    let mut current = head;
    out.push('(');

    let result = loop {
        if !active.insert(current) {
            break Err(Error::runtime("cannot format a cyclic structure"));
        }
        spine.push(current);

        let Some((first, second)) = heap.get(current).as_pair() else {
            break Ok(());
        };
        if let Err(e) = write_value(heap, first, out, active) {
            break Err(e);
        }
        match second {
            None => break Ok(()),
            Some(next) if heap.get(next).is_pair() => {
                out.push(' ');
                current = next;
            }
            Some(tail) => {
                out.push_str(" . ");
                break write_value(heap, Some(tail), out, active);
            }
        }
    };

    for id in spine {
        active.remove(&id);
    }
    out.push(')');
    result
}

/// Infallible rendering for diagnostics: procedures and builtins show as `#<...>`
pub fn describe_value(heap: &Heap, value: Option<ValueId>) -> String {
    match value.map(|id| heap.get(id)) {
        Some(Value::Closure(closure)) => format!("#<procedure {}>", closure.display_name()),
        Some(Value::Builtin(op)) => format!("#<builtin {}>", op.scheme_id),
        _ => format_value(heap, value).unwrap_or_else(|_| "#<cyclic>".to_owned()),
    }
}
