use std::cell::RefCell;
use std::rc::Rc;

use rhai::{
    CallFnOptions, Dynamic, Engine, EvalAltResult, ImmutableString, ParseErrorType, Position,
    Scope,
};
use sandbox::{EngineLimits, FailureKind};

use crate::allowlist::{CapabilityDenied, allowlist};
use crate::capture::{LimitedSink, SharedSink};
use crate::input::InputEmulator;

/// Name of the optional zero-argument entry point.
const ENTRY_POINT: &str = "main";

/// What one evaluation produced, apart from its output.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub success: bool,
    /// Entry point return value; `None` when the script has no `main`.
    pub return_value: Option<serde_json::Value>,
    pub error: Option<String>,
    pub kind: Option<FailureKind>,
}

impl Evaluation {
    fn completed(return_value: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            return_value,
            error: None,
            kind: None,
        }
    }

    fn failed(kind: FailureKind, error: String) -> Self {
        Self {
            success: false,
            return_value: None,
            error: Some(error),
            kind: Some(kind),
        }
    }
}

/// Run `source` with `stdin` as its input, writing output to `sink`.
///
/// Never panics on script errors: every failure is reported in the returned
/// [`Evaluation`], with the error and its call trace appended to stderr.
pub fn evaluate(source: &str, stdin: &str, limits: &EngineLimits, sink: SharedSink) -> Evaluation {
    let limited: SharedSink = Rc::new(RefCell::new(LimitedSink::new(
        sink.clone(),
        limits.max_output_bytes,
    )));
    let engine = build_engine(limits, &limited, stdin);

    match run(&engine, source) {
        Ok(value) => Evaluation::completed(value),
        Err(err) => {
            let trace = format_trace(&err);
            let (kind, message) = classify(*err);
            // Outside the output budget, like the truncation marker.
            sink.borrow_mut()
                .stderr(&format!("Error: {message}\n{trace}"));
            tracing::debug!(kind = %kind, error = %message, "script failed");
            Evaluation::failed(kind, message)
        }
    }
}

fn build_engine(limits: &EngineLimits, sink: &SharedSink, stdin: &str) -> Engine {
    let mut engine = Engine::new_raw();

    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);

    allowlist().install(&mut engine);

    let out = sink.clone();
    engine.on_print(move |text| {
        let mut out = out.borrow_mut();
        out.stdout(text);
        out.stdout("\n");
    });
    let err = sink.clone();
    engine.on_debug(move |text, _source, _pos| {
        let mut err = err.borrow_mut();
        err.stderr(text);
        err.stderr("\n");
    });

    let input = Rc::new(RefCell::new(InputEmulator::new(stdin)));
    let (lines, out) = (input.clone(), sink.clone());
    engine.register_fn("input", move || read_line(&lines, &out, None));
    let (lines, out) = (input, sink.clone());
    engine.register_fn("input", move |prompt: ImmutableString| {
        read_line(&lines, &out, Some(prompt.as_str()))
    });

    engine
}

fn read_line(
    input: &RefCell<InputEmulator>,
    sink: &SharedSink,
    prompt: Option<&str>,
) -> Result<String, Box<EvalAltResult>> {
    let mut sink = sink.borrow_mut();
    input
        .borrow_mut()
        .next_line(prompt, &mut *sink)
        .map_err(|eof| EvalAltResult::ErrorRuntime(eof.to_string().into(), Position::NONE).into())
}

/// Compile, run top-level statements, then the entry point if one exists.
fn run(engine: &Engine, source: &str) -> Result<Option<serde_json::Value>, Box<EvalAltResult>> {
    let ast = engine.compile(source)?;
    allowlist().check_import_aliases(&ast)?;
    let mut scope = Scope::new();
    engine.run_ast_with_scope(&mut scope, &ast)?;

    let has_entry = ast
        .iter_functions()
        .any(|f| f.name == ENTRY_POINT && f.params.is_empty());
    if !has_entry {
        return Ok(None);
    }

    tracing::debug!("calling entry point");
    let options = CallFnOptions::new().eval_ast(false).rewind_scope(false);
    let value: Dynamic = engine.call_fn_with_options(options, &mut scope, &ast, ENTRY_POINT, ())?;
    Ok(Some(to_json(value)))
}

fn to_json(value: Dynamic) -> serde_json::Value {
    if value.is_unit() {
        return serde_json::Value::Null;
    }
    rhai::serde::from_dynamic::<serde_json::Value>(&value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}

/// Call chain, outermost first, one frame per line.
fn format_trace(err: &EvalAltResult) -> String {
    let mut trace = String::new();
    let mut current = err;
    loop {
        match current {
            EvalAltResult::ErrorInFunctionCall(name, _, inner, pos) => {
                trace.push_str(&format!("  in call to function '{name}'{}\n", at(*pos)));
                current = &**inner;
            }
            EvalAltResult::ErrorInModule(path, inner, pos) => {
                trace.push_str(&format!("  in module '{path}'{}\n", at(*pos)));
                current = &**inner;
            }
            other => {
                let pos = other.position();
                if !pos.is_none() {
                    trace.push_str(&format!("  at {pos}\n"));
                }
                return trace;
            }
        }
    }
}

fn at(pos: Position) -> String {
    if pos.is_none() {
        String::new()
    } else {
        format!(" ({pos})")
    }
}

/// Strip call wrappers and decide what kind of failure this was.
fn classify(err: EvalAltResult) -> (FailureKind, String) {
    let list = allowlist();
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => classify(*inner),
        EvalAltResult::ErrorRuntime(value, pos) => {
            match value.clone().try_cast::<CapabilityDenied>() {
                Some(denied) => (FailureKind::CapabilityDenied, denied.to_string()),
                None if value.is_string() => (FailureKind::RuntimeFault, value.to_string()),
                None => (
                    FailureKind::RuntimeFault,
                    message_of(EvalAltResult::ErrorRuntime(value, pos)),
                ),
            }
        }
        EvalAltResult::ErrorFunctionNotFound(ref signature, _) => {
            let denied = denied_name(signature).map(str::to_owned);
            match denied {
                Some(name) => (
                    FailureKind::CapabilityDenied,
                    CapabilityDenied::new(name).to_string(),
                ),
                None => (FailureKind::RuntimeFault, message_of(err)),
            }
        }
        EvalAltResult::ErrorModuleNotFound(ref name, _) if list.is_denied(name) => (
            FailureKind::CapabilityDenied,
            CapabilityDenied::new(name.as_str()).to_string(),
        ),
        EvalAltResult::ErrorParsing(ParseErrorType::Reserved(ref name), _)
            if list.is_denied(name) =>
        {
            (
                FailureKind::CapabilityDenied,
                CapabilityDenied::new(name.as_str()).to_string(),
            )
        }
        other => (FailureKind::RuntimeFault, message_of(other)),
    }
}

/// First deny-listed segment of a function signature such as
/// `os::system (&str | ImmutableString | String)`.
fn denied_name(signature: &str) -> Option<&str> {
    let path = signature.split([' ', '(']).next().unwrap_or_default();
    path.split("::").find(|segment| allowlist().is_denied(segment))
}

fn message_of(mut err: EvalAltResult) -> String {
    err.clear_position();
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BufferSink, TRUNCATION_MARKER};

    fn run_script(source: &str, stdin: &str) -> (Evaluation, BufferSink) {
        run_with_limits(source, stdin, &EngineLimits::default())
    }

    fn run_with_limits(source: &str, stdin: &str, limits: &EngineLimits) -> (Evaluation, BufferSink) {
        let buf = Rc::new(RefCell::new(BufferSink::default()));
        let eval = evaluate(source, stdin, limits, buf.clone());
        let out = buf.borrow().clone();
        (eval, out)
    }

    #[test]
    fn main_return_value_is_reported() {
        let (eval, out) = run_script(r#"fn main() { print("hi"); 42 }"#, "");
        assert!(eval.success, "{eval:?} {out:?}");
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(eval.return_value, Some(serde_json::json!(42)));
    }

    #[test]
    fn top_level_only_has_no_return_value() {
        let (eval, out) = run_script(r#"print("a"); print("b");"#, "");
        assert!(eval.success);
        assert_eq!(out.stdout, "a\nb\n");
        assert_eq!(eval.return_value, None);
    }

    #[test]
    fn main_without_value_returns_null() {
        let (eval, _) = run_script("fn main() { let x = 1; }", "");
        assert_eq!(eval.return_value, Some(serde_json::Value::Null));
    }

    #[test]
    fn main_with_params_is_not_an_entry_point() {
        let (eval, out) = run_script(r#"fn main(x) { print("no"); } print("top");"#, "");
        assert!(eval.success);
        assert_eq!(out.stdout, "top\n");
        assert_eq!(eval.return_value, None);
    }

    #[test]
    fn map_return_value_becomes_json_object() {
        let (eval, _) = run_script(r#"fn main() { #{ name: "x", tags: [1, 2] } }"#, "");
        assert_eq!(
            eval.return_value,
            Some(serde_json::json!({ "name": "x", "tags": [1, 2] }))
        );
    }

    #[test]
    fn debug_goes_to_stderr() {
        let (eval, out) = run_script(r#"debug("careful");"#, "");
        assert!(eval.success);
        assert!(out.stdout.is_empty());
        assert!(out.stderr.contains("careful"));
    }

    #[test]
    fn input_echoes_and_reads_lines() {
        let source = r#"
            fn main() {
                let name = input("Name? ");
                let age = int(input());
                `${name}:${age + 1}`
            }
        "#;
        let (eval, out) = run_script(source, "Ada\n36\n");
        assert!(eval.success, "{eval:?}");
        assert_eq!(out.stdout, "Name? Ada\n36\n");
        assert_eq!(eval.return_value, Some(serde_json::json!("Ada:37")));
    }

    #[test]
    fn reading_past_stdin_raises_eof() {
        let (eval, out) = run_script("let a = input(); let b = input();", "one\n");
        assert!(!eval.success);
        assert_eq!(eval.kind, Some(FailureKind::RuntimeFault));
        assert_eq!(
            eval.error.as_deref(),
            Some("EOFError: EOF when reading a line")
        );
        assert_eq!(out.stdout, "one\n");
        assert!(out.stderr.contains("EOFError"));
    }

    #[test]
    fn denied_import_keeps_earlier_output() {
        let (eval, out) = run_script(r#"print("before"); import "socket" as s;"#, "");
        assert!(!eval.success);
        assert_eq!(eval.kind, Some(FailureKind::CapabilityDenied));
        assert!(eval.error.as_deref().unwrap_or_default().contains("socket"));
        assert_eq!(out.stdout, "before\n");
    }

    #[test]
    fn denied_alias_is_refused_before_running() {
        let (eval, out) = run_script(
            r#"print("never"); import "math" as os; print(os::sqrt(16.0));"#,
            "",
        );
        assert!(!eval.success);
        assert_eq!(eval.kind, Some(FailureKind::CapabilityDenied));
        assert_eq!(eval.error.as_deref(), Some("use of 'os' is not allowed"));
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn unknown_import_is_denied() {
        let (eval, _) = run_script(r#"import "yaml" as y;"#, "");
        assert_eq!(eval.kind, Some(FailureKind::CapabilityDenied));
    }

    #[test]
    fn allowed_import_inside_main() {
        let source = r#"fn main() { import "math" as m; m::gcd(12, 18) }"#;
        let (eval, _) = run_script(source, "");
        assert!(eval.success, "{eval:?}");
        assert_eq!(eval.return_value, Some(serde_json::json!(6)));
    }

    #[test]
    fn denied_function_call_is_capability_denied() {
        let (eval, _) = run_script(r#"system("rm -rf /");"#, "");
        assert_eq!(eval.kind, Some(FailureKind::CapabilityDenied));
        assert_eq!(eval.error.as_deref(), Some("use of 'system' is not allowed"));
    }

    #[test]
    fn denied_variable_is_capability_denied() {
        let (eval, _) = run_script("let x = env;", "");
        assert_eq!(eval.kind, Some(FailureKind::CapabilityDenied));
    }

    #[test]
    fn eval_keyword_is_unavailable() {
        let (eval, _) = run_script(r#"eval("40 + 2")"#, "");
        assert!(!eval.success);
        assert!(eval.error.as_deref().unwrap_or_default().contains("eval"));
    }

    #[test]
    fn syntax_error_is_runtime_fault() {
        let (eval, out) = run_script("let = ;", "");
        assert_eq!(eval.kind, Some(FailureKind::RuntimeFault));
        assert!(out.stderr.starts_with("Error: "));
    }

    #[test]
    fn thrown_string_is_the_message() {
        let (eval, _) = run_script(r#"fn main() { throw "boom"; }"#, "");
        assert_eq!(eval.error.as_deref(), Some("boom"));
    }

    #[test]
    fn trace_names_the_call_chain() {
        let source = r#"
            fn inner() { throw "deep"; }
            fn outer() { inner() }
            fn main() { outer() }
        "#;
        let (eval, out) = run_script(source, "");
        assert_eq!(eval.error.as_deref(), Some("deep"));
        assert!(out.stderr.contains("in call to function 'outer'"));
        assert!(out.stderr.contains("in call to function 'inner'"));
    }

    #[test]
    fn operation_limit_stops_runaway_loops() {
        let limits = EngineLimits {
            max_operations: 10_000,
            ..EngineLimits::default()
        };
        let (eval, _) = run_with_limits("loop {}", "", &limits);
        assert_eq!(eval.kind, Some(FailureKind::RuntimeFault));
    }

    #[test]
    fn output_budget_truncates_once() {
        let limits = EngineLimits {
            max_output_bytes: 16,
            ..EngineLimits::default()
        };
        let (eval, out) = run_with_limits(r#"for i in 0..100 { print("0123456789"); }"#, "", &limits);
        assert!(eval.success);
        assert_eq!(out.stdout.len(), 16);
        assert_eq!(out.stderr.matches(TRUNCATION_MARKER).count(), 1);
    }

    #[test]
    fn failure_report_survives_exhausted_budget() {
        let limits = EngineLimits {
            max_output_bytes: 4,
            ..EngineLimits::default()
        };
        let source = r#"
            fn fail() { throw "boom"; }
            fn main() { print("0123456789"); fail() }
        "#;
        let (eval, out) = run_with_limits(source, "", &limits);
        assert_eq!(eval.error.as_deref(), Some("boom"));
        assert_eq!(out.stdout, "0123");
        assert!(out.stderr.starts_with(TRUNCATION_MARKER));
        assert!(out.stderr.contains("Error: boom\n"));
        assert!(out.stderr.contains("in call to function 'fail'"));
    }

    #[test]
    fn evaluations_do_not_share_state() {
        let source = "let counter = 0; counter += 1; fn main() { 7 }";
        let (first, _) = run_script(source, "");
        let (second, _) = run_script(source, "");
        assert_eq!(first, second);
    }
}
