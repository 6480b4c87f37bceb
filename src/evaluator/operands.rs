//! Operand evaluation shared by builtin functions and procedure calls, plus typed
//! views over evaluated arguments.

use crate::Error;
use crate::ast::{ListWalk, NumberType, Value, is_boolean_literal, walk_list};
use crate::builtinops::QUOTE;
use crate::heap::{EnvId, Heap, ValueId};

use super::eval_with_depth_tracking;

/// Evaluate an argument list left to right, one element at a time with [`next_operand`].
pub(crate) fn eval_operands(
    heap: &mut Heap,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Vec<Option<ValueId>>, Error> {
    let walk = walk_list(heap, args);
    if !walk.is_proper() {
        return Err(Error::runtime(
            "arguments of an operation must form a proper list",
        ));
    }

    let mut operands = Vec::with_capacity(walk.items.len());
    let mut items = walk.items.into_iter();
    while let Some(item) = items.next() {
        operands.push(next_operand(heap, item, &mut items, env, depth)?);
    }

    Ok(operands)
}

/// Value of one argument list element.
///
/// Nil stays nil, `#t`/`#f` stand for themselves, other symbols are looked up and
/// everything else is evaluated. A symbol that resolves to the `quote` handle takes the
/// next element from `rest` as an unevaluated datum instead.
pub(crate) fn next_operand(
    heap: &mut Heap,
    item: Option<ValueId>,
    rest: &mut impl Iterator<Item = Option<ValueId>>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    match item.map(|id| heap.get(id)) {
        None => Ok(None),
        Some(Value::Symbol(name)) if is_boolean_literal(name) => Ok(item),
        Some(Value::Symbol(name)) => {
            let resolved = heap.lookup(env, name)?;
            if is_op(heap, resolved, QUOTE) {
                rest.next()
                    .ok_or_else(|| Error::runtime("quote expects a datum after it"))
            } else {
                Ok(resolved)
            }
        }
        Some(_) => eval_with_depth_tracking(heap, item, env, depth + 1),
    }
}

/// Whether `value` is the handle of the builtin named `scheme_id`
pub(crate) fn is_op(heap: &Heap, value: Option<ValueId>, scheme_id: &str) -> bool {
    matches!(
        value.map(|id| heap.get(id)),
        Some(Value::Builtin(op)) if op.scheme_id == scheme_id
    )
}

/// Whether `expr` is a symbol bound in `env` to the builtin named `scheme_id`
pub(crate) fn names_op(heap: &Heap, expr: Option<ValueId>, env: EnvId, scheme_id: &str) -> bool {
    match expr.and_then(|id| heap.get(id).as_symbol()) {
        Some(name) => heap
            .lookup(env, name)
            .is_ok_and(|resolved| is_op(heap, resolved, scheme_id)),
        None => false,
    }
}

pub(crate) fn number_arg(
    heap: &Heap,
    value: Option<ValueId>,
    op_name: &str,
) -> Result<NumberType, Error> {
    match value.map(|id| heap.get(id)) {
        Some(Value::Number(n)) => Ok(*n),
        Some(other) => Err(Error::runtime(format!(
            "{op_name}: expected a number, got a {}",
            other.type_name()
        ))),
        None => Err(Error::runtime(format!(
            "{op_name}: expected a number, got ()"
        ))),
    }
}

/// `(id, first, second)` of a pair argument
pub(crate) fn pair_arg(
    heap: &Heap,
    value: Option<ValueId>,
    op_name: &str,
) -> Result<(ValueId, Option<ValueId>, Option<ValueId>), Error> {
    match value.and_then(|id| heap.get(id).as_pair().map(|(a, b)| (id, a, b))) {
        Some(parts) => Ok(parts),
        None => Err(Error::runtime(format!("{op_name}: expected a pair"))),
    }
}

/// Elements of a non-empty proper list argument
pub(crate) fn proper_list_arg(
    heap: &Heap,
    value: Option<ValueId>,
    op_name: &str,
) -> Result<ListWalk, Error> {
    let (id, _, _) = pair_arg(heap, value, op_name)?;
    let walk = walk_list(heap, Some(id));
    if walk.is_proper() {
        Ok(walk)
    } else {
        Err(Error::runtime(format!("{op_name}: expected a proper list")))
    }
}

/// Iterator over numeric arguments, validated up front
pub(crate) struct NumIter<'a> {
    heap: &'a Heap,
    inner: std::slice::Iter<'a, Option<ValueId>>,
}

impl<'a> NumIter<'a> {
    pub(crate) fn new(
        heap: &'a Heap,
        args: &'a [Option<ValueId>],
        op_name: &str,
    ) -> Result<Self, Error> {
        for arg in args {
            number_arg(heap, *arg, op_name)?;
        }
        Ok(NumIter {
            heap,
            inner: args.iter(),
        })
    }
}

impl Iterator for NumIter<'_> {
    type Item = NumberType;

    fn next(&mut self) -> Option<NumberType> {
        let heap = self.heap;
        self.inner
            .next()
            .and_then(|arg| arg.and_then(|id| heap.get(id).as_number()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
