use crate::Error;
use crate::MAX_EVAL_DEPTH;
use crate::ast::{Closure, Value, format_value, is_boolean_literal, is_truthy, symbol_name, walk_list};
use crate::builtinops::{BuiltinOp, LAMBDA, OpKind, QUOTE, get_builtin_ops};
use crate::heap::{EnvId, Heap, HeapStats, PairField, ValueId};

pub mod environment;
pub(crate) mod operands;

pub use environment::Environment;

use operands::{eval_operands, names_op, next_operand};

/// Evaluate an expression tree (public API)
pub fn eval(heap: &mut Heap, expr: Option<ValueId>, env: EnvId) -> Result<Option<ValueId>, Error> {
    eval_with_depth_tracking(heap, expr, env, 0)
}

/// Evaluate an expression with depth tracking to prevent stack overflow
pub(crate) fn eval_with_depth_tracking(
    heap: &mut Heap,
    expr: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    if depth >= MAX_EVAL_DEPTH {
        return Err(Error::runtime(format!(
            "Evaluation depth limit exceeded (max: {MAX_EVAL_DEPTH})"
        )));
    }
    ensure_sufficient_stack(|| eval_node(heap, expr, env, depth))
}

/// Grow the stack before recursing when little of it is left, so the depth limit and
/// not the thread's stack size bounds recursion.
#[inline]
#[cfg(not(target_arch = "wasm32"))]
fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    /// Minimum stack space to keep available
    const RED_ZONE: usize = 128 * 1024;

    /// Stack space to allocate when growing
    const STACK_PER_RECURSION: usize = 1024 * 1024;

    stacker::maybe_grow(RED_ZONE, STACK_PER_RECURSION, f)
}

#[inline]
#[cfg(target_arch = "wasm32")]
fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    f()
}

fn eval_node(
    heap: &mut Heap,
    expr: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    let Some(id) = expr else {
        return Ok(None);
    };

    match heap.get(id) {
        // Self-evaluating forms
        Value::Number(_) | Value::Closure(_) => Ok(expr),
        Value::Symbol(name) if is_boolean_literal(name) => Ok(expr),

        // Variable lookup
        Value::Symbol(name) => heap.lookup(env, name),

        Value::Builtin(op) => Err(Error::runtime(format!(
            "builtin operation {} can only be applied",
            op.scheme_id
        ))),

        Value::Pair { first, second, .. } => {
            let (head, args) = (*first, *second);
            eval_combination(heap, id, head, args, env, depth)
        }
    }
}

/// Evaluate `(head . args)`: resolve the operator, then apply it to the unevaluated arguments
fn eval_combination(
    heap: &mut Heap,
    expr: ValueId,
    head: Option<ValueId>,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    match head.map(|id| heap.get(id)) {
        Some(Value::Symbol(name)) => {
            let name = name.clone();
            if !walk_list(heap, Some(expr)).is_proper() {
                return Err(Error::syntax(format!(
                    "combination ({name} ...) must be a proper list"
                )));
            }
            match heap.lookup(env, &name)? {
                Some(operator) if heap.get(operator).is_callable() => {
                    apply(heap, operator, args, env, depth)
                }
                _ => Err(Error::syntax(format!(
                    "{name} is not a procedure or special form"
                ))),
            }
        }
        Some(Value::Pair { .. }) => match eval_with_depth_tracking(heap, head, env, depth + 1)? {
            Some(operator) if heap.get(operator).is_callable() => {
                apply(heap, operator, args, env, depth)
            }
            _ => Err(Error::syntax(
                "operator expression did not produce a procedure",
            )),
        },
        Some(other) => Err(Error::runtime(format!(
            "Cannot apply non-function: {}",
            other.type_name()
        ))),
        None => Err(Error::runtime("Cannot apply non-function: ()")),
    }
}

fn apply(
    heap: &mut Heap,
    operator: ValueId,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    match heap.get(operator) {
        Value::Builtin(op) => {
            let op: &'static BuiltinOp = *op;
            apply_builtin(heap, op, args, env, depth)
        }
        Value::Closure(closure) => {
            let closure = closure.clone();
            apply_closure(heap, &closure, args, env, depth)
        }
        other => Err(Error::runtime(format!(
            "Cannot apply non-function: {}",
            other.type_name()
        ))),
    }
}

fn apply_builtin(
    heap: &mut Heap,
    op: &'static BuiltinOp,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    match op.op_kind {
        // Special forms get the unevaluated argument list and check their own shape
        OpKind::SpecialForm(form) => form(heap, args, env, depth),
        OpKind::Function(func) => {
            let operands = eval_operands(heap, args, env, depth)?;
            op.validate_arity(operands.len())?;
            func(heap, &operands)
        }
    }
}

/// Call a user procedure. Arguments are evaluated in the caller's environment;
/// the body runs in a fresh frame whose parent is the captured scope, or the caller's
/// environment for a procedure that does not capture.
fn apply_closure(
    heap: &mut Heap,
    closure: &Closure,
    args: Option<ValueId>,
    caller: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    let frame = heap.alloc_env(Some(closure.scope.unwrap_or(caller)));
    let operands = eval_operands(heap, args, caller, depth)?;
    if operands.len() != closure.params.len() {
        return Err(Error::arity_error(
            closure.display_name(),
            closure.params.len(),
            operands.len(),
        ));
    }
    tracing::trace!(
        procedure = closure.display_name(),
        args = operands.len(),
        captures = closure.captures_context(),
        "apply closure"
    );

    for (param, value) in closure.params.iter().zip(operands) {
        heap.bind(frame, param.as_str(), value);
    }

    let mut result = None;
    for expr in &closure.body {
        result = eval_with_depth_tracking(heap, *expr, frame, depth + 1).map_err(|err| {
            match err {
                Error::RuntimeError(msg) if !msg.contains("\n  In procedure:") => {
                    Error::RuntimeError(format!(
                        "{msg}\n  In procedure: {}",
                        closure.display_name()
                    ))
                }
                other => other,
            }
        })?;
    }
    Ok(result)
}

/// Elements of a special form's argument list, which must be proper
fn form_operands(
    heap: &Heap,
    args: Option<ValueId>,
    form_name: &str,
) -> Result<Vec<Option<ValueId>>, Error> {
    let walk = walk_list(heap, args);
    if walk.is_proper() {
        Ok(walk.items)
    } else {
        Err(Error::syntax(format!(
            "{form_name}: arguments must form a proper list"
        )))
    }
}

/// A symbol usable as a variable name: not `#t`/`#f`
fn variable_name(heap: &Heap, expr: Option<ValueId>) -> Option<String> {
    symbol_name(heap, expr).filter(|name| !is_boolean_literal(name))
}

fn parse_params(heap: &Heap, params: Option<ValueId>) -> Result<Vec<String>, Error> {
    let walk = walk_list(heap, params);
    if !walk.is_proper() {
        return Err(Error::syntax("Lambda parameters must be a list"));
    }

    let mut names: Vec<String> = Vec::with_capacity(walk.items.len());
    for param in walk.items {
        let Some(name) = variable_name(heap, param) else {
            return Err(Error::syntax("Lambda parameters must be symbols"));
        };
        if names.contains(&name) {
            return Err(Error::syntax(format!("Duplicate parameter name: {name}")));
        }
        names.push(name);
    }
    Ok(names)
}

/// Build a closure from `(params body...)`, the operands of a `lambda` form
fn build_closure(
    heap: &mut Heap,
    operands: &[Option<ValueId>],
    scope: impl FnOnce(&[String]) -> Option<EnvId>,
    name: Option<String>,
) -> Result<Option<ValueId>, Error> {
    let [params, body @ ..] = operands else {
        return Err(Error::syntax("lambda requires a parameter list and a body"));
    };
    if body.is_empty() {
        return Err(Error::syntax("lambda body must not be empty"));
    }
    let params = parse_params(heap, *params)?;
    let scope = scope(&params);

    let closure = Closure {
        params,
        body: body.to_vec(),
        scope,
        name,
    };
    Ok(Some(heap.alloc(Value::Closure(closure))))
}

/// Procedures created by `define` capture their defining environment only when they
/// take no parameters
fn define_scope(env: EnvId) -> impl FnOnce(&[String]) -> Option<EnvId> {
    move |params| params.is_empty().then_some(env)
}

/// Evaluate quote special form
pub(crate) fn eval_quote(
    heap: &mut Heap,
    args: Option<ValueId>,
    _env: EnvId,
    _depth: usize,
) -> Result<Option<ValueId>, Error> {
    let walk = walk_list(heap, args);
    match walk.items[..] {
        [datum] if walk.is_proper() => Ok(datum),
        _ => Err(Error::runtime("quote expects exactly one datum")),
    }
}

/// Evaluate if special form
pub(crate) fn eval_if(
    heap: &mut Heap,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    let (condition, consequent, alternative) = match form_operands(heap, args, "if")?[..] {
        [condition, consequent] => (condition, consequent, None),
        [condition, consequent, alternative] => (condition, consequent, Some(alternative)),
        ref other => {
            return Err(Error::syntax(format!(
                "if expects a condition, a consequent and an optional alternative, got {} operands",
                other.len()
            )));
        }
    };

    let condition = eval_with_depth_tracking(heap, condition, env, depth + 1)?;
    if is_truthy(heap, condition) {
        eval_with_depth_tracking(heap, consequent, env, depth + 1)
    } else {
        match alternative {
            Some(alternative) => eval_with_depth_tracking(heap, alternative, env, depth + 1),
            None => Ok(None),
        }
    }
}

/// Evaluate lambda special form
pub(crate) fn eval_lambda(
    heap: &mut Heap,
    args: Option<ValueId>,
    env: EnvId,
    _depth: usize,
) -> Result<Option<ValueId>, Error> {
    let operands = form_operands(heap, args, LAMBDA)?;
    build_closure(heap, &operands, |_| Some(env), None)
}

/// Evaluate define special form
pub(crate) fn eval_define(
    heap: &mut Heap,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    let operands = form_operands(heap, args, "define")?;
    let Some((&header, rest)) = operands.split_first() else {
        return Err(Error::syntax("define requires a name and a value"));
    };

    if let Some(name) = variable_name(heap, header) {
        let value = define_value(heap, rest, env, depth, &name)?;
        return bind_named(heap, env, name, value);
    }

    // (define (name . params) body...)
    match header.and_then(|id| heap.get(id).as_pair()) {
        Some((target, params)) => {
            let Some(name) = variable_name(heap, target) else {
                return Err(Error::syntax("define requires a symbol as the procedure name"));
            };
            let mut lambda_operands = Vec::with_capacity(rest.len() + 1);
            lambda_operands.push(params);
            lambda_operands.extend_from_slice(rest);
            let value = build_closure(
                heap,
                &lambda_operands,
                define_scope(env),
                Some(name.clone()),
            )?;
            bind_named(heap, env, name, value)
        }
        None => Err(Error::syntax(
            "define requires a symbol or a (name params...) header",
        )),
    }
}

/// Value of `(define name ...)`: a literal lambda becomes a named procedure, a bare
/// `quote` takes the following datum as is, anything else is evaluated
fn define_value(
    heap: &mut Heap,
    rest: &[Option<ValueId>],
    env: EnvId,
    depth: usize,
    name: &str,
) -> Result<Option<ValueId>, Error> {
    match *rest {
        [expr] => {
            let lambda_form = expr
                .and_then(|id| heap.get(id).as_pair())
                .filter(|(head, _)| names_op(heap, *head, env, LAMBDA));
            match lambda_form {
                Some((_, lambda_args)) => {
                    let lambda_operands = form_operands(heap, lambda_args, LAMBDA)?;
                    build_closure(
                        heap,
                        &lambda_operands,
                        define_scope(env),
                        Some(name.to_owned()),
                    )
                }
                None => eval_with_depth_tracking(heap, expr, env, depth + 1),
            }
        }
        [quote, datum] if names_op(heap, quote, env, QUOTE) => Ok(datum),
        [] => Err(Error::syntax(format!("define {name}: missing value"))),
        _ => Err(Error::syntax(format!("define {name}: too many operands"))),
    }
}

/// Bind `name` in `env`, recording the name on a pair value so that `set-car!`/`set-cdr!`
/// can find it again
fn bind_named(
    heap: &mut Heap,
    env: EnvId,
    name: String,
    value: Option<ValueId>,
) -> Result<Option<ValueId>, Error> {
    if let Some(pair) = value.filter(|id| heap.get(*id).is_pair()) {
        let symbol = heap.symbol(name.as_str());
        heap.set_pair_name(pair, Some(symbol))?;
    }
    heap.bind(env, name, value);
    Ok(None)
}

/// Evaluate set! special form
pub(crate) fn eval_set(
    heap: &mut Heap,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    let operands = form_operands(heap, args, "set!")?;
    let [target, expr] = operands[..] else {
        return Err(Error::syntax("set! requires a name and a value"));
    };
    let Some(name) = variable_name(heap, target) else {
        return Err(Error::syntax("set! requires a symbol as its target"));
    };

    let value = eval_with_depth_tracking(heap, expr, env, depth + 1)?;
    let owner = heap.resolve_owner(env, &name)?;
    heap.bind(owner, name, value);
    Ok(None)
}

/// Evaluate set-car! special form
pub(crate) fn eval_set_car(
    heap: &mut Heap,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    mutate_pair(heap, args, env, depth, PairField::First, "set-car!")
}

/// Evaluate set-cdr! special form
pub(crate) fn eval_set_cdr(
    heap: &mut Heap,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
) -> Result<Option<ValueId>, Error> {
    mutate_pair(heap, args, env, depth, PairField::Second, "set-cdr!")
}

fn mutate_pair(
    heap: &mut Heap,
    args: Option<ValueId>,
    env: EnvId,
    depth: usize,
    field: PairField,
    form_name: &str,
) -> Result<Option<ValueId>, Error> {
    let operands = form_operands(heap, args, form_name)?;
    let [target, expr] = operands[..] else {
        return Err(Error::syntax(format!(
            "{form_name} requires a target and a value"
        )));
    };

    let pair = resolve_pair_target(heap, target, env, depth, form_name)?;
    let value = eval_with_depth_tracking(heap, expr, env, depth + 1)?;
    heap.set_pair_field(pair, field, value)?;
    Ok(None)
}

/// A symbol target is looked up. Any other target is evaluated, and a pair that
/// carries a name bound to a pair is re-resolved through that name.
fn resolve_pair_target(
    heap: &mut Heap,
    target: Option<ValueId>,
    env: EnvId,
    depth: usize,
    form_name: &str,
) -> Result<ValueId, Error> {
    let resolved = match variable_name(heap, target) {
        Some(name) => heap.lookup(env, &name)?,
        None => {
            let value = eval_with_depth_tracking(heap, target, env, depth + 1)?;
            let cached = value.and_then(|id| heap.get(id).pair_name());
            match symbol_name(heap, cached).map(|name| heap.lookup(env, &name)) {
                Some(Ok(Some(bound))) if heap.get(bound).is_pair() => Some(bound),
                _ => value,
            }
        }
    };

    match resolved {
        Some(id) if heap.get(id).is_pair() => Ok(id),
        _ => Err(Error::runtime(format!("{form_name}: target must be a pair"))),
    }
}

macro_rules! short_circuit_op {
    ($name:ident, $op_name:expr, $stop_on_truthy:literal, $default:literal) => {
        pub(crate) fn $name(
            heap: &mut Heap,
            args: Option<ValueId>,
            env: EnvId,
            depth: usize,
        ) -> Result<Option<ValueId>, Error> {
            let operands = form_operands(heap, args, $op_name)?;
            if operands.is_empty() {
                return Ok(Some(heap.boolean($default)));
            }

            let mut result = None;
            let mut items = operands.into_iter();
            while let Some(item) = items.next() {
                result = next_operand(heap, item, &mut items, env, depth)?;
                if is_truthy(heap, result) == $stop_on_truthy {
                    break;
                }
            }
            Ok(result)
        }
    };
}

// Generate short-circuit logic forms
short_circuit_op!(eval_and, "and", false, true);
short_circuit_op!(eval_or, "or", true, false);

/// Create a root environment holding one handle per builtin operation
pub fn create_global_env(heap: &mut Heap) -> EnvId {
    let env = heap.alloc_env(None);
    for builtin_op in get_builtin_ops() {
        let handle = heap.alloc(Value::Builtin(builtin_op));
        heap.bind(env, builtin_op.scheme_id, Some(handle));
    }
    env
}

/// When the heap is swept after a top-level evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepPolicy {
    /// Sweep after every evaluation, failed ones included
    #[default]
    Always,
    /// Sweep only after successful evaluations; garbage from a failure waits for the next one
    OnSuccess,
}

#[derive(Debug, Clone, Default)]
pub struct InterpreterConfig {
    pub sweep_policy: SweepPolicy,
}

/// An interpreter session: one heap and the root environment its collections start from.
///
/// Dropping the session releases every node regardless of reachability.
#[derive(Debug)]
pub struct Interpreter {
    heap: Heap,
    global: EnvId,
    config: InterpreterConfig,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_config(InterpreterConfig::default())
    }

    pub fn with_config(config: InterpreterConfig) -> Self {
        let mut heap = Heap::new();
        let global = create_global_env(&mut heap);
        Interpreter {
            heap,
            global,
            config,
        }
    }

    /// Evaluate an expression tree in the root environment and format the result.
    ///
    /// The tree must have been allocated in this session's heap. A sweep follows,
    /// according to the configured [`SweepPolicy`].
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn evaluate(&mut self, expr: Option<ValueId>) -> Result<String, Error> {
        let result = eval(&mut self.heap, expr, self.global)
            .and_then(|value| format_value(&self.heap, value));

        if result.is_ok() || self.config.sweep_policy == SweepPolicy::Always {
            self.collect();
        }
        result
    }

    /// Read one expression from source text and evaluate it
    #[cfg(feature = "scheme")]
    pub fn run(&mut self, source: &str) -> Result<String, Error> {
        let expr = crate::scheme::parse_scheme(source, &mut self.heap)?;
        self.evaluate(expr)
    }

    /// Sweep everything unreachable from the root environment; returns the number freed
    pub fn collect(&mut self) -> usize {
        self.heap.sweep(self.global)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn global_env(&self) -> EnvId {
        self.global
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn stats(&self) -> &HeapStats {
        self.heap.stats()
    }

    /// Root environment bindings, sorted by name
    pub fn global_bindings(&self) -> Vec<(&str, Option<ValueId>)> {
        self.heap.bindings(self.global)
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.heap.release_all();
    }
}

#[cfg(all(test, feature = "scheme"))]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::scheme::parse_scheme;

    /// Test result variants for comprehensive testing
    #[derive(Debug)]
    enum TestResult {
        EvalResult(&'static str),    // Evaluation should succeed and format as this text
        SpecificError(&'static str), // Evaluation should fail with error containing this string
        SyntaxErr,
        NameErr,
        RuntimeErr,
    }
    use TestResult::*;

    /// Test environment containing test cases that share state
    struct TestEnvironment(Vec<(&'static str, TestResult)>);

    /// Macro for setup expressions that return nil (like define)
    macro_rules! test_setup {
        ($expr:expr) => {
            ($expr, EvalResult("()"))
        };
    }

    /// Run tests in isolated sessions with shared state
    fn run_tests_in_environment(test_environments: Vec<TestEnvironment>) {
        for (env_idx, TestEnvironment(test_cases)) in test_environments.iter().enumerate() {
            let mut interp = Interpreter::new();

            for (test_idx, (input, expected)) in test_cases.iter().enumerate() {
                let test_id = format!("Environment #{} test #{}", env_idx + 1, test_idx + 1);
                execute_test_case(input, expected, &mut interp, &test_id);
            }
        }
    }

    /// Execute a single test case with detailed error reporting
    fn execute_test_case(input: &str, expected: &TestResult, interp: &mut Interpreter, test_id: &str) {
        let expr = match parse_scheme(input, interp.heap_mut()) {
            Ok(expr) => expr,
            Err(parse_err) => {
                panic!("{test_id}: unexpected parse error for '{input}': {parse_err:?}");
            }
        };

        match (interp.evaluate(expr), expected) {
            (Ok(actual), EvalResult(expected_text)) => {
                assert_eq!(actual, *expected_text, "{test_id}: '{input}'");
            }
            (Err(e), SpecificError(expected_text)) => {
                let error_msg = format!("{e}");
                assert!(
                    error_msg.contains(expected_text),
                    "{test_id}: error should contain '{expected_text}', got: {error_msg}"
                );
            }
            (Err(Error::SyntaxError(_)), SyntaxErr)
            | (Err(Error::NameError(_)), NameErr)
            | (Err(Error::RuntimeError(_)), RuntimeErr) => {}
            (actual, expected) => {
                panic!("{test_id}: '{input}' expected {expected:?}, got {actual:?}");
            }
        }

        interp.heap().check_consistency().unwrap();
    }

    /// Simplified test runner: every case in a fresh session
    fn run_comprehensive_tests(test_cases: Vec<(&str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let mut interp = Interpreter::new();
            let test_id = format!("#{}", i + 1);
            execute_test_case(input, expected, &mut interp, &test_id);
        }
    }

    #[test]
    #[expect(clippy::too_many_lines)] // Comprehensive test coverage is intentionally thorough
    fn test_comprehensive_operations_data_driven() {
        let test_cases = vec![
            // === SELF-EVALUATING FORMS ===
            ("42", EvalResult("42")),
            ("-271", EvalResult("-271")),
            ("9223372036854775807", EvalResult("9223372036854775807")),
            ("-9223372036854775808", EvalResult("-9223372036854775808")),
            ("#t", EvalResult("#t")),
            ("#f", EvalResult("#f")),
            ("()", EvalResult("()")), // nil evaluates to nil
            // === ARITHMETIC ===
            ("(+)", EvalResult("0")),
            ("(*)", EvalResult("1")),
            ("(- 5)", EvalResult("5")), // single operand is returned unchanged
            ("(/ 5)", EvalResult("5")),
            ("(+ 1 2 3)", EvalResult("6")),
            ("(- 10 3 2)", EvalResult("5")),
            ("(* 2 3 4)", EvalResult("24")),
            ("(/ 20 2 5)", EvalResult("2")),
            ("(+ (* 2 3) (- 8 2))", EvalResult("12")),
            ("(+ 9223372036854775807 1)", RuntimeErr),
            ("(* 4611686018427387904 2)", RuntimeErr),
            ("(/ 1 0)", SpecificError("Division by zero")),
            ("(-)", RuntimeErr),
            ("(+ 1 'a)", RuntimeErr),
            ("(abs -7)", EvalResult("7")),
            ("(max 1 5 3)", EvalResult("5")),
            ("(min 4 -2 9)", EvalResult("-2")),
            // === COMPARISON CHAINING ===
            ("(< 1 2 3)", EvalResult("#t")),
            ("(< 1 3 2)", EvalResult("#f")),
            ("(< 2 1 'a)", EvalResult("#f")),
            ("(< 1 2 'a)", RuntimeErr),
            ("(= 2 2 2)", EvalResult("#t")),
            ("(>= 3 3 1)", EvalResult("#t")),
            ("(<)", EvalResult("#t")),
            ("(< 1)", EvalResult("#t")),
            ("(= 1 #t)", RuntimeErr),
            // === QUOTE ===
            ("(quote hello)", EvalResult("hello")),
            ("'(1 2 3)", EvalResult("(1 2 3)")),
            ("'(+ 1 2)", EvalResult("(+ 1 2)")),
            ("'()", EvalResult("()")),
            ("'(1 . 2)", EvalResult("(1 . 2)")),
            ("'(1 2 . 3)", EvalResult("(1 2 . 3)")),
            ("''x", EvalResult("(quote x)")),
            ("(quote)", RuntimeErr),
            ("(quote a b)", RuntimeErr),
            // === CONTROL FLOW ===
            ("(if #t 0)", EvalResult("0")),
            ("(if #f 0)", EvalResult("()")),
            ("(if (= 2 2) (+ 1 10))", EvalResult("11")),
            ("(if (= 2 3) (+ 1 10) 5)", EvalResult("5")),
            ("(if 0 'yes 'no)", EvalResult("yes")),    // only #f is false
            ("(if '() 'yes 'no)", EvalResult("yes")),  // nil is truthy
            ("(if #f undefined-var 1)", EvalResult("1")), // untaken branch is not evaluated
            ("(if)", SyntaxErr),
            ("(if 1)", SyntaxErr),
            ("(if 1 2 3 4)", SyntaxErr),
            // === LOGIC ===
            ("(and)", EvalResult("#t")),
            ("(or)", EvalResult("#f")),
            ("(and 1 2)", EvalResult("2")),
            ("(and 1 #f 3)", EvalResult("#f")),
            ("(or #f 2)", EvalResult("2")),
            ("(or #f #f)", EvalResult("#f")),
            ("(and #f undefined-var)", EvalResult("#f")),
            ("(or #t undefined-var)", EvalResult("#t")),
            ("(and #t undefined-var)", NameErr),
            ("(or quote x)", EvalResult("x")),
            ("(and #t quote)", RuntimeErr),
            ("(and (< 1 2) (> 3 2))", EvalResult("#t")),
            ("(not #f)", EvalResult("#t")),
            ("(not 0)", EvalResult("#f")),
            // === CLOSURES ===
            ("((lambda (x) (+ 1 x)) 5)", EvalResult("6")),
            ("((lambda () 42))", EvalResult("42")),
            ("((lambda (x y) (+ x y)) 3 4)", EvalResult("7")),
            ("((lambda (x) 1 2 (* x 3)) 2)", EvalResult("6")), // last body expression wins
            ("((lambda (x) (* x x)) 4)", EvalResult("16")),
            ("(lambda)", SyntaxErr),
            ("(lambda x)", SyntaxErr),
            ("(lambda (x))", SyntaxErr),
            ("(lambda (x x) x)", SyntaxErr),
            ("(lambda (1) 1)", SyntaxErr),
            ("(lambda (x . y) x)", SyntaxErr),
            ("((lambda (x) x))", RuntimeErr),
            ("((lambda (x) x) 1 2)", SpecificError("expected 1 arguments, got 2")),
            ("(lambda (x) x)", SpecificError("cannot format procedure")),
            // === OPERATOR POSITION ===
            ("((if #t + *) 2 3)", EvalResult("5")),
            ("((if #f + *) 2 3)", EvalResult("6")),
            ("((if #t quote +) a)", EvalResult("a")), // special forms apply through pair heads too
            ("((quote 1) 2)", SyntaxErr),
            ("(1 2)", RuntimeErr),
            ("(() 2)", RuntimeErr),
            ("(undefined-fn 1)", NameErr),
            ("(+ 1 . 2)", SyntaxErr),
            ("car", SpecificError("cannot format builtin operation car")),
            // === OPERAND PROTOCOL ===
            ("(list quote x 1)", EvalResult("(x 1)")),
            ("(list '() #t #f)", EvalResult("(() #t #f)")),
            ("(car quote (a b))", EvalResult("a")),
            ("(list quote)", RuntimeErr),
            ("(list x)", NameErr),
            // === LISTS ===
            ("(cons 1 2)", EvalResult("(1 . 2)")),
            ("(cons 1 '(2 3))", EvalResult("(1 2 3)")),
            ("(car '(1 2 3))", EvalResult("1")),
            ("(cdr '(1 2 3))", EvalResult("(2 3)")),
            ("(cdr '(1 . 2))", EvalResult("2")),
            ("(car '())", RuntimeErr),
            ("(list)", EvalResult("()")),
            ("(list 1 (list 2 3) 4)", EvalResult("(1 (2 3) 4)")),
            ("(list-ref '(a b c) 1)", EvalResult("b")),
            ("(list-ref '(a b c) 3)", RuntimeErr),
            ("(list-ref '(a b . c) 0)", RuntimeErr),
            ("(list-tail '(a b c) 1)", EvalResult("(b c)")),
            ("(list-tail '(a b c) 3)", RuntimeErr),
            ("(list-tail 5 0)", RuntimeErr),
            // === PREDICATES ===
            ("(symbol? 'x)", EvalResult("#t")),
            ("(symbol? 1)", EvalResult("#f")),
            ("(symbol? #t)", EvalResult("#t")),
            ("(number? 1)", EvalResult("#t")),
            ("(boolean? #f)", EvalResult("#t")),
            ("(boolean? 'f)", EvalResult("#f")),
            ("(null? '())", EvalResult("#t")),
            ("(null? (list))", EvalResult("#t")),
            ("(null? 0)", EvalResult("#f")),
            ("(pair? '(1 2))", EvalResult("#t")),
            ("(pair? (cons 1 2))", EvalResult("#t")),
            ("(pair? '(1 2 3))", EvalResult("#f")),
            ("(list? '(1 2 3))", EvalResult("#t")),
            ("(list? '())", EvalResult("#t")),
            ("(list? (cons 1 2))", EvalResult("#f")),
            ("(number? 1 2)", RuntimeErr),
            // === MALFORMED DEFINE / SET! ===
            ("(define)", SyntaxErr),
            ("(define 1)", SyntaxErr),
            ("(define x)", SyntaxErr),
            ("(define x 1 2)", SyntaxErr),
            ("(define #t 1)", SyntaxErr),
            ("(define (1 x) x)", SyntaxErr),
            ("(define (f x))", SyntaxErr),
            ("(set!)", SyntaxErr),
            ("(set! 1)", SyntaxErr),
            ("(set! x)", SyntaxErr),
            ("(set! x 1 2)", SyntaxErr),
            ("(set! undefined-var 1)", NameErr),
            ("(set-car! 1)", SyntaxErr),
            ("(set-car! '(1 2) 5 6)", SyntaxErr),
            ("(set-car! 5 1)", RuntimeErr),
            ("(set-cdr! '() 1)", RuntimeErr),
        ];

        run_comprehensive_tests(test_cases);
    }

    #[test]
    fn test_define_and_mutation_scenarios() {
        let test_environments = vec![
            // Captured mutation: the procedure sees the later set!
            TestEnvironment(vec![
                test_setup!("(define x 1)"),
                test_setup!("(define f (lambda () x))"),
                test_setup!("(set! x 2)"),
                ("(f)", EvalResult("2")),
                ("x", EvalResult("2")),
            ]),
            // define shapes
            TestEnvironment(vec![
                test_setup!("(define a 5)"),
                test_setup!("(define b (+ a 1))"),
                test_setup!("(define (add x y) (+ x y))"),
                test_setup!("(define s quote sym)"),
                test_setup!("(define l '(1 2 3))"),
                ("(add a b)", EvalResult("11")),
                ("s", EvalResult("sym")),
                ("l", EvalResult("(1 2 3)")),
                test_setup!("(define a 7)"),
                ("a", EvalResult("7")),
                ("undefined-var", NameErr),
            ]),
            // set! rebinds in the owning frame, not in the calling frame
            TestEnvironment(vec![
                test_setup!("(define counter 0)"),
                test_setup!("(define (bump n) (set! counter (+ counter n)))"),
                ("(bump 2)", EvalResult("()")),
                ("(bump 3)", EvalResult("()")),
                ("counter", EvalResult("5")),
                ("n", NameErr),
            ]),
            // set-car!/set-cdr! through the binding name
            TestEnvironment(vec![
                test_setup!("(define l '(1 2 3))"),
                test_setup!("(set-car! l 10)"),
                ("l", EvalResult("(10 2 3)")),
                test_setup!("(set-cdr! l '(20))"),
                ("l", EvalResult("(10 20)")),
                test_setup!("(set-cdr! l 3)"),
                ("l", EvalResult("(10 . 3)")),
                // cdr copies the spine, so mutating its result leaves l alone
                test_setup!("(define m '(1 2 3))"),
                test_setup!("(set-car! (cdr m) 99)"),
                ("m", EvalResult("(1 2 3)")),
                // car returns the element itself; its cached name resolves back to it
                test_setup!("(define inner '(a b))"),
                test_setup!("(define outer (list inner))"),
                test_setup!("(set-car! (car outer) 'z)"),
                ("inner", EvalResult("(z b)")),
                ("outer", EvalResult("((z b))")),
            ]),
            // Any cons cell is a valid target, whatever the length of its list
            TestEnvironment(vec![
                test_setup!("(define one '(1))"),
                test_setup!("(set-car! one 'a)"),
                ("one", EvalResult("(a)")),
                test_setup!("(define three (list 1 2 3))"),
                test_setup!("(set-cdr! three '())"),
                ("three", EvalResult("(1)")),
                ("(set-cdr! (car '((1))) 2)", EvalResult("()")),
                test_setup!("(define n 5)"),
                ("(set-car! n 1)", RuntimeErr),
                ("(set-cdr! #t 1)", RuntimeErr),
            ]),
            // The quote handle works under any name, for functions and and/or alike
            TestEnvironment(vec![
                test_setup!("(define q quote)"),
                ("(list q x)", EvalResult("(x)")),
                ("(and q x)", EvalResult("x")),
                ("(or #f q (a b))", EvalResult("(a b)")),
                ("(and #t q)", RuntimeErr),
            ]),
            // Pairs built at runtime are shared, not copied, by bindings
            TestEnvironment(vec![
                test_setup!("(define p (cons 1 2))"),
                test_setup!("(define q p)"),
                test_setup!("(set-car! q 5)"),
                ("p", EvalResult("(5 . 2)")),
            ]),
            // A cycle cannot be printed, but the session survives
            TestEnvironment(vec![
                test_setup!("(define c (list 1 2))"),
                test_setup!("(set-cdr! c c)"),
                ("c", SpecificError("cyclic")),
                ("(car c)", EvalResult("1")),
                test_setup!("(define c 0)"),
                ("c", EvalResult("0")),
            ]),
        ];

        run_tests_in_environment(test_environments);
    }

    #[test]
    fn test_closures_and_scope() {
        let test_environments = vec![
            // lambda captures its defining frame
            TestEnvironment(vec![
                test_setup!("(define make-adder (lambda (n) (lambda (x) (+ x n))))"),
                test_setup!("(define add5 (make-adder 5))"),
                ("(add5 10)", EvalResult("15")),
                ("((make-adder 1) 1)", EvalResult("2")),
            ]),
            // Higher-order use of builtins and procedures
            TestEnvironment(vec![
                test_setup!("(define (apply-op op a b) (op a b))"),
                ("(apply-op + 2 3)", EvalResult("5")),
                ("(apply-op * 2 3)", EvalResult("6")),
                ("((lambda (op a b c) (op a b c)) > 9 6 2)", EvalResult("#t")),
                test_setup!("(define (sq x) (* x x))"),
                ("((lambda (fn) (fn 7)) sq)", EvalResult("49")),
            ]),
            // Procedures with parameters defined by define see the caller's frame
            TestEnvironment(vec![
                test_setup!("(define (get-y z) y)"),
                test_setup!("(define (with-y y) (get-y 0))"),
                ("(with-y 42)", EvalResult("42")),
                ("(get-y 0)", NameErr),
            ]),
            // Parameters shadow globals without touching them
            TestEnvironment(vec![
                test_setup!("(define x 10)"),
                ("((lambda (x) (* x 2)) 3)", EvalResult("6")),
                ("x", EvalResult("10")),
            ]),
            // Errors inside procedures name the procedure
            TestEnvironment(vec![
                test_setup!("(define (bad x) (car x))"),
                ("(bad 1)", SpecificError("In procedure: bad")),
                ("(bad '(1))", EvalResult("1")),
            ]),
        ];

        run_tests_in_environment(test_environments);
    }

    #[test]
    fn test_recursive_functions() {
        let test_environments = vec![
            TestEnvironment(vec![
                test_setup!("(define (fact n) (if (= n 0) 1 (* n (fact (- n 1)))))"),
                ("(fact 0)", EvalResult("1")),
                ("(fact 5)", EvalResult("120")),
                ("(fact 10)", EvalResult("3628800")),
            ]),
            TestEnvironment(vec![
                test_setup!("(define (fib n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2)))))"),
                ("(fib 10)", EvalResult("55")),
            ]),
            TestEnvironment(vec![
                test_setup!("(define (my-even? n) (if (= n 0) #t (my-odd? (- n 1))))"),
                test_setup!("(define (my-odd? n) (if (= n 0) #f (my-even? (- n 1))))"),
                ("(my-even? 10)", EvalResult("#t")),
                ("(my-odd? 7)", EvalResult("#t")),
                ("(my-even? 7)", EvalResult("#f")),
            ]),
            TestEnvironment(vec![
                test_setup!(
                    "(define (len l) (if (null? l) 0 (+ 1 (len (cdr l)))))"
                ),
                ("(len '(a b c d))", EvalResult("4")),
                ("(len '())", EvalResult("0")),
            ]),
        ];

        run_tests_in_environment(test_environments);
    }

    #[test]
    fn test_evaluation_depth_limit() {
        // Runs on the default test thread stack
        run_tests_in_environment(vec![TestEnvironment(vec![
            test_setup!("(define (forever n) (forever n))"),
            ("(forever 1)", SpecificError("Evaluation depth limit exceeded")),
            // the session is still usable afterwards
            ("(+ 1 2)", EvalResult("3")),
        ])]);
    }

    #[test]
    fn test_evaluation_depth_limit_on_small_stack() {
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(|| {
                let mut interp = Interpreter::new();
                interp.run("(define (down n) (if (= n 0) 0 (+ 1 (down (- n 1)))))").unwrap();
                assert_eq!(interp.run("(down 20)").unwrap(), "20");
                let err = interp.run("(down 100000)").unwrap_err();
                assert!(
                    err.to_string().contains("Evaluation depth limit exceeded"),
                    "{err}"
                );
            })
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_evaluate_collects_garbage() {
        let mut interp = Interpreter::new();
        let baseline = interp.heap().len();

        // The input tree and the result are reclaimed after formatting
        assert_eq!(interp.run("(list 1 2 3)").unwrap(), "(1 2 3)");
        assert_eq!(interp.heap().len(), baseline);

        // Bindings keep their values alive
        interp.run("(define a 0)").unwrap();
        let with_a = interp.heap().len();
        assert!(with_a > baseline);

        // An unreachable cycle built with set-cdr! is reclaimed
        interp.run("(define b (list 2 3))").unwrap();
        interp.run("(define a (cons 1 b))").unwrap();
        interp.run("(set-cdr! b a)").unwrap();
        interp.run("(define a 0)").unwrap();
        interp.run("(define b 0)").unwrap();
        assert_eq!(interp.heap().len(), with_a + 1);
        interp.heap().check_consistency().unwrap();

        // A closure capturing the frame it is bound in forms a cycle through the root only
        interp.run("(define f (lambda () f))").unwrap();
        assert_eq!(interp.run("(null? (f))").unwrap(), "#f");
        interp.run("(define f 0)").unwrap();
        interp.heap().check_consistency().unwrap();

        assert_eq!(interp.collect(), 0);
        assert!(interp.stats().collections > 0);
    }

    #[test]
    fn test_sweep_policy() {
        let mut always = Interpreter::new();
        let baseline = always.heap().len();
        assert!(always.run("(car (list 1 2 5 6))").is_ok());
        assert!(always.run("(car (+ 1 2 3 4 5))").is_err());
        assert_eq!(always.heap().len(), baseline);

        let mut on_success = Interpreter::with_config(InterpreterConfig {
            sweep_policy: SweepPolicy::OnSuccess,
        });
        let baseline = on_success.heap().len();
        assert!(on_success.run("(car (+ 1 2 3 4 5))").is_err());
        assert!(on_success.heap().len() > baseline);

        // the next successful evaluation reclaims the leftovers
        assert_eq!(on_success.run("1").unwrap(), "1");
        assert_eq!(on_success.heap().len(), baseline);
    }

    #[test]
    fn test_session_survives_errors() {
        let mut interp = Interpreter::new();
        interp.run("(define x 41)").unwrap();
        assert!(matches!(interp.run("(car x)"), Err(Error::RuntimeError(_))));
        assert!(matches!(interp.run("(y)"), Err(Error::NameError(_))));
        assert!(matches!(interp.run("(if)"), Err(Error::SyntaxError(_))));
        assert!(matches!(interp.run("(+ 1"), Err(Error::ParseError(_))));
        assert_eq!(interp.run("(+ x 1)").unwrap(), "42");
    }

    #[test]
    fn test_global_env_is_seeded_with_builtins() {
        let interp = Interpreter::new();
        let bindings = interp.global_bindings();
        assert_eq!(bindings.len(), get_builtin_ops().len());

        for (name, value) in bindings {
            let handle = value.unwrap();
            match interp.heap().get(handle) {
                Value::Builtin(op) => assert_eq!(op.scheme_id, name),
                other => panic!("{name} bound to {other:?}"),
            }
        }
    }

    #[test]
    fn test_eval_direct() {
        let mut heap = Heap::new();
        let env = create_global_env(&mut heap);

        assert_eq!(eval(&mut heap, None, env).unwrap(), None);

        let expr = parse_scheme("(+ 1 2)", &mut heap).unwrap();
        let result = eval(&mut heap, expr, env).unwrap();
        assert_eq!(result.map(|id| heap.get(id).as_number()), Some(Some(3)));

        // A builtin handle is not a self-evaluating value
        let handle = heap.lookup(env, "car").unwrap();
        assert!(matches!(
            eval(&mut heap, handle, env),
            Err(Error::RuntimeError(_))
        ));

        // Closures are
        let closure = parse_scheme("(lambda (x) x)", &mut heap).unwrap();
        let closure = eval(&mut heap, closure, env).unwrap();
        assert_eq!(eval(&mut heap, closure, env).unwrap(), closure);
        let Value::Closure(c) = heap.get(closure.unwrap()) else {
            panic!("expected a closure");
        };
        assert!(c.captures_context());
        assert_eq!(c.params, vec!["x".to_owned()]);
    }

    #[test]
    fn test_define_capture_rule() {
        let mut interp = Interpreter::new();
        interp.run("(define (two a b) a)").unwrap();
        interp.run("(define (none) 1)").unwrap();
        interp.run("(define zero (lambda () 1))").unwrap();
        interp.run("(define one (lambda (a) a))").unwrap();

        let captures = |interp: &Interpreter, name: &str| {
            let id = interp.heap().lookup(interp.global_env(), name).unwrap().unwrap();
            match interp.heap().get(id) {
                Value::Closure(closure) => {
                    assert_eq!(closure.name.as_deref(), Some(name));
                    closure.captures_context()
                }
                other => panic!("{name} bound to {other:?}"),
            }
        };
        assert!(!captures(&interp, "two"));
        assert!(captures(&interp, "none"));
        assert!(captures(&interp, "zero"));
        assert!(!captures(&interp, "one"));
    }
}
