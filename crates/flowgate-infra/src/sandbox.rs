//! Script sandbox for `code` nodes, built on the embedded rhai engine.
//!
//! Every call gets a fresh `Engine` with no module resolution, `eval`
//! disabled and hard size limits derived from the memory budget. A progress
//! callback enforces the wall-clock deadline on every operation, and the
//! blocking task is additionally wrapped in a tokio timeout in case the
//! engine never yields.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flowgate_core::workflow::condition::is_truthy;
use flowgate_core::workflow::nodes::ScriptSandbox;
use flowgate_types::sandbox::{
    CodeExecutionError, ExecutionMode, SandboxFailureReason, SandboxLimits, SandboxRequest,
    SandboxResult,
};
use futures_util::future::BoxFuture;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{AST, Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;

type Logs = Arc<Mutex<Vec<String>>>;

const MAX_CALL_LEVELS: usize = 64;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FN_EXPR_DEPTH: usize = 32;
/// Rough per-element cost used to turn a byte budget into collection sizes.
const BYTES_PER_ELEMENT: usize = 64;

/// `ScriptSandbox` backed by rhai.
#[derive(Debug, Clone)]
pub struct RhaiSandbox {
    /// Slack on top of the script deadline before the backstop fires.
    grace: Duration,
}

impl RhaiSandbox {
    pub fn new() -> Self {
        Self {
            grace: Duration::from_millis(250),
        }
    }

    async fn run(&self, request: SandboxRequest) -> SandboxResult {
        let started = Instant::now();
        let limits = request.limits.clamped();
        let budget = Duration::from_millis(limits.timeout_ms);
        let deadline = started + budget;
        let logs: Logs = Arc::default();

        let task_logs = logs.clone();
        let task = tokio::task::spawn_blocking(move || run_script(request, limits, deadline, task_logs));

        let outcome = match tokio::time::timeout(budget + self.grace, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(CodeExecutionError::new(
                SandboxFailureReason::Crash,
                format!("sandbox thread crashed: {e}"),
            )),
            Err(_) => Err(timeout_error(limits)),
        };

        let logs = take_logs(&logs);
        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok((data, item_errors)) => SandboxResult::ok(data, logs, item_errors),
            Err(error) => {
                tracing::debug!(reason = %error.reason, error = %error.message, "script failed");
                SandboxResult::err(error, logs)
            }
        };
        result.with_duration(duration_ms)
    }
}

impl Default for RhaiSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptSandbox for RhaiSandbox {
    fn execute<'a>(&'a self, request: SandboxRequest) -> BoxFuture<'a, SandboxResult> {
        Box::pin(self.run(request))
    }
}

// ---------------------------------------------------------------------------
// Engine setup
// ---------------------------------------------------------------------------

fn build_engine(limits: SandboxLimits, deadline: Instant, logs: &Logs) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");

    let bytes = limits.memory_limit_bytes();
    engine
        .set_max_string_size(bytes)
        .set_max_array_size(bytes / BYTES_PER_ELEMENT)
        .set_max_map_size(bytes / BYTES_PER_ELEMENT)
        .set_max_call_levels(MAX_CALL_LEVELS)
        .set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);

    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    let print_logs = logs.clone();
    engine.on_print(move |text| push_log(&print_logs, text.to_string()));
    let debug_logs = logs.clone();
    engine.on_debug(move |text, _source, pos| push_log(&debug_logs, format!("[debug {pos}] {text}")));

    engine
}

fn push_log(logs: &Logs, line: String) {
    if let Ok(mut logs) = logs.lock() {
        logs.push(line);
    }
}

fn take_logs(logs: &Logs) -> Vec<String> {
    logs.lock()
        .map(|mut logs| std::mem::take(&mut *logs))
        .unwrap_or_default()
}

fn timeout_error(limits: SandboxLimits) -> CodeExecutionError {
    CodeExecutionError::new(
        SandboxFailureReason::Timeout,
        format!("script exceeded its {}ms time limit", limits.timeout_ms),
    )
}

fn eval_error(err: &EvalAltResult, limits: SandboxLimits) -> CodeExecutionError {
    let reason = match err {
        EvalAltResult::ErrorTerminated(..) | EvalAltResult::ErrorTooManyOperations(..) => {
            return timeout_error(limits);
        }
        EvalAltResult::ErrorDataTooLarge(..) | EvalAltResult::ErrorStackOverflow(..) => {
            SandboxFailureReason::MemoryLimit
        }
        EvalAltResult::ErrorParsing(..) => SandboxFailureReason::Syntax,
        _ => SandboxFailureReason::Runtime,
    };
    CodeExecutionError::new(reason, err.to_string())
}

/// Failures that make the remaining items pointless to try.
fn is_fatal(error: &CodeExecutionError) -> bool {
    matches!(
        error.reason,
        SandboxFailureReason::Timeout | SandboxFailureReason::MemoryLimit | SandboxFailureReason::Crash
    )
}

fn to_dynamic(value: &Value) -> Result<Dynamic, CodeExecutionError> {
    rhai::serde::to_dynamic(value).map_err(|e| {
        CodeExecutionError::new(SandboxFailureReason::Runtime, format!("cannot expose value to script: {e}"))
    })
}

fn from_dynamic(value: &Dynamic) -> Result<Value, CodeExecutionError> {
    rhai::serde::from_dynamic::<Value>(value).map_err(|e| {
        CodeExecutionError::new(
            SandboxFailureReason::InvalidOutput,
            format!("script returned a value that is not JSON: {e}"),
        )
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

struct Script {
    engine: Engine,
    ast: AST,
    globals: Scope<'static>,
    limits: SandboxLimits,
}

impl Script {
    fn eval(&self, bindings: Vec<(&'static str, Dynamic)>) -> Result<Value, CodeExecutionError> {
        let mut scope = self.globals.clone();
        for (name, value) in bindings {
            scope.push_constant_dynamic(name, value);
        }
        let out = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|e| eval_error(&e, self.limits))?;
        from_dynamic(&out)
    }
}

fn check_input_size(request: &SandboxRequest, limits: SandboxLimits) -> Result<(), CodeExecutionError> {
    let size = serde_json::to_vec(&request.items).map(|v| v.len()).unwrap_or(0)
        + serde_json::to_vec(&request.context).map(|v| v.len()).unwrap_or(0);
    if size > limits.memory_limit_bytes() {
        return Err(CodeExecutionError::new(
            SandboxFailureReason::MemoryLimit,
            format!(
                "input of {size} bytes exceeds the {}MB memory limit",
                limits.memory_limit_mb
            ),
        ));
    }
    Ok(())
}

/// Runs on a blocking thread.
fn run_script(
    request: SandboxRequest,
    limits: SandboxLimits,
    deadline: Instant,
    logs: Logs,
) -> Result<(Value, Vec<CodeExecutionError>), CodeExecutionError> {
    check_input_size(&request, limits)?;

    let engine = build_engine(limits, deadline, &logs);
    let ast = engine
        .compile(&request.code)
        .map_err(|e| CodeExecutionError::new(SandboxFailureReason::Syntax, e.to_string()))?;

    let mut globals = Scope::new();
    if let Value::Object(map) = &request.context {
        for (key, value) in map {
            globals.push_constant_dynamic(key.clone(), to_dynamic(value)?);
        }
    }
    let script = Script {
        engine,
        ast,
        globals,
        limits,
    };

    let mode = request.mode;
    let items = request.items;
    let mut item_errors = Vec::new();

    let data = match mode {
        ExecutionMode::Expression if items.is_empty() => script.eval(Vec::new())?,
        mode if mode.is_per_item() => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let bindings = vec![("item", to_dynamic(&item)?), ("index", Dynamic::from(index as i64))];
                match script.eval(bindings) {
                    Ok(value) => match mode {
                        ExecutionMode::Filter => {
                            if is_truthy(&value) {
                                out.push(item);
                            }
                        }
                        ExecutionMode::Transform => match value {
                            Value::Array(many) => out.extend(many),
                            one => out.push(one),
                        },
                        _ => out.push(value),
                    },
                    Err(e) if request.continue_on_error && !is_fatal(&e) => {
                        item_errors.push(e.at_item(index));
                        out.push(item);
                    }
                    Err(e) => return Err(e.at_item(index)),
                }
            }
            Value::Array(out)
        }
        _ => {
            let all = to_dynamic(&Value::Array(items))?;
            let value = script.eval(vec![("items", all)])?;
            match (mode, value) {
                (ExecutionMode::RunOnce, Value::Array(many)) => Value::Array(many),
                (ExecutionMode::RunOnce, Value::Null) => Value::Array(Vec::new()),
                (ExecutionMode::RunOnce, one) => Value::Array(vec![one]),
                (_, value) => value,
            }
        }
    };

    Ok((data, item_errors))
}
