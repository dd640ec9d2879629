//! Registro tipado de patterns y funciones.
//!
//! El registro se arma una vez al arrancar el proceso (`Registry::with_builtins`
//! más lo que registre la aplicación) y se pasa por `Arc` al worker y a los
//! jobs. Un nombre desconocido es un `PatternMissing` de la tarea, no un
//! error del worker.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use tokio::process::Command;
use tracing::debug;

use crate::broker::Broker;
use crate::errors::{BrokerError, TaskFailure};
use crate::task::{Task, TaskStatus};

pub type TaskFn =
    Arc<dyn Fn(&[Value], &Map<String, Value>) -> Result<Value, TaskFailure> + Send + Sync>;

/// Todo lo que un pattern necesita para ejecutar una tarea.
#[derive(Clone)]
pub struct TaskContext {
    pub task: Task,
    pub broker: Arc<dyn Broker>,
    pub registry: Arc<Registry>,
}

impl TaskContext {
    pub async fn success(&self, value: Value) -> Result<(), BrokerError> {
        self.broker.mark_success(self.task.id, value).await
    }

    pub async fn error(&self, failure: TaskFailure) -> Result<(), BrokerError> {
        self.broker.mark_error(self.task.id, failure).await
    }

    /// La función nombrada en `func`.
    pub fn function(&self) -> Result<TaskFn, TaskFailure> {
        let name = self
            .task
            .func
            .as_deref()
            .ok_or_else(|| TaskFailure::pattern_missing("<no func>"))?;
        self.registry.resolve_fn(name)
    }

    /// Resultados de las dependencias, en el orden declarado.
    pub async fn dependency_results(&self) -> anyhow::Result<Vec<Value>> {
        let deps = &self.task.dependencies;
        let mut tasks = self.broker.fetch(deps).await?;
        let mut results = Vec::with_capacity(deps.len());
        for id in deps {
            let task = tasks
                .remove(id)
                .ok_or_else(|| TaskFailure::dependency_resolution(*id))?;
            if task.status != TaskStatus::Success {
                return Err(TaskFailure::dependency_failed(*id, task.status).into());
            }
            results.push(task.result.unwrap_or(Value::Null));
        }
        Ok(results)
    }
}

#[async_trait]
pub trait Pattern: Send + Sync {
    /// Debe terminar marcando la tarea (success o error). Un `Err` se guarda
    /// como error de la tarea.
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct Registry {
    patterns: HashMap<String, Arc<dyn Pattern>>,
    functions: HashMap<String, TaskFn>,
}

impl Registry {
    /// Registro vacío.
    pub fn new() -> Self {
        Self::default()
    }

    /// Patterns `generic`, `reduce`, `shell` y las funciones básicas.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register_pattern("generic", GenericPattern);
        reg.register_pattern("reduce", ReducePattern);
        reg.register_pattern("shell", ShellPattern);

        reg.register_fn("str", builtin_str);
        reg.register_fn("int", builtin_int);
        reg.register_fn("float", builtin_float);
        reg.register_fn("tuple", |args, _| Ok(Value::Array(args.to_vec())));
        reg.register_fn("sum", builtin_sum);
        reg.register_fn("add", |args, _| {
            let [a, b] = args else {
                return Err(arity("add", 2, args.len()));
            };
            add_values(a, b)
        });
        reg.register_fn("concat", builtin_concat);
        reg.register_fn("identity", |args, _| {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        });
        reg
    }

    pub fn register_pattern(&mut self, name: &str, pattern: impl Pattern + 'static) {
        self.patterns.insert(name.to_string(), Arc::new(pattern));
    }

    pub fn register_fn<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&[Value], &Map<String, Value>) -> Result<Value, TaskFailure> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
    }

    pub fn resolve_pattern(&self, name: &str) -> Result<Arc<dyn Pattern>, TaskFailure> {
        self.patterns
            .get(name)
            .cloned()
            .ok_or_else(|| TaskFailure::pattern_missing(name))
    }

    pub fn resolve_fn(&self, name: &str) -> Result<TaskFn, TaskFailure> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| TaskFailure::pattern_missing(name))
    }

    pub fn has_pattern(&self, name: &str) -> bool {
        self.patterns.contains_key(name)
    }
}

/* --------- patterns básicos --------- */

/// Llama a `func(*args, **kwargs)` en un hilo bloqueante.
pub struct GenericPattern;

#[async_trait]
impl Pattern for GenericPattern {
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let f = ctx.function()?;
        let args = ctx.task.args.clone();
        let kwargs = ctx.task.kwargs.clone();

        let value = tokio::task::spawn_blocking(move || f(&args, &kwargs))
            .await
            .context("la función de la tarea hizo panic")??;
        ctx.success(value).await?;
        Ok(())
    }
}

/// Pliega los resultados de las dependencias con `func`. Si `args` trae un
/// único valor se usa como acumulador inicial.
pub struct ReducePattern;

#[async_trait]
impl Pattern for ReducePattern {
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let f = ctx.function()?;
        let mut values = ctx.dependency_results().await?.into_iter();

        let initial = match ctx.task.args.as_slice() {
            [init] => Some(init.clone()),
            [] => values.next(),
            other => {
                return Err(TaskFailure::raised(
                    "TypeError",
                    format!("reduce takes at most 1 initial value, got {}", other.len()),
                )
                .into())
            }
        };
        let Some(mut acc) = initial else {
            return Err(TaskFailure::raised(
                "TypeError",
                "reduce of empty sequence with no initial value",
            )
            .into());
        };

        for value in values {
            acc = f(&[acc, value], &ctx.task.kwargs)?;
        }
        ctx.success(acc).await?;
        Ok(())
    }
}

/// Ejecuta `args` como comando; un código de salida distinto de cero es
/// `CalledProcessError`.
pub struct ShellPattern;

#[async_trait]
impl Pattern for ShellPattern {
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let argv: Vec<String> = ctx
            .task
            .args
            .iter()
            .map(|a| match a {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        let Some((program, rest)) = argv.split_first() else {
            return Err(TaskFailure::raised("ValueError", "shell task without command").into());
        };

        let mut cmd = Command::new(program);
        cmd.args(rest).envs(&ctx.task.environ);
        if let Some(cwd) = &ctx.task.cwd {
            cmd.current_dir(cwd);
        }

        debug!("tarea {}: ejecutando {:?}", ctx.task.id, argv);
        let status = cmd
            .status()
            .await
            .with_context(|| format!("no se pudo ejecutar {:?}", program))?;

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(TaskFailure::raised(
                "CalledProcessError",
                format!("Command {:?} returned non-zero exit status {}", argv, code),
            )
            .into());
        }
        ctx.success(Value::from(0)).await?;
        Ok(())
    }
}

/* --------- funciones básicas --------- */

fn arity(name: &str, expected: usize, got: usize) -> TaskFailure {
    TaskFailure::raised(
        "TypeError",
        format!("{}() takes {} arguments ({} given)", name, expected, got),
    )
}

fn single<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, TaskFailure> {
    match args {
        [one] => Ok(one),
        _ => Err(arity(name, 1, args.len())),
    }
}

fn builtin_str(args: &[Value], _: &Map<String, Value>) -> Result<Value, TaskFailure> {
    let text = match single("str", args)? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(Value::String(text))
}

fn builtin_int(args: &[Value], _: &Map<String, Value>) -> Result<Value, TaskFailure> {
    match single("int", args)? {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(Value::from(i)),
            (None, Some(f)) => Ok(Value::from(f.trunc() as i64)),
            _ => Err(TaskFailure::raised("OverflowError", format!("{} out of range", n))),
        },
        Value::Bool(b) => Ok(Value::from(*b as i64)),
        Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| {
            TaskFailure::raised(
                "ValueError",
                format!("invalid literal for int() with base 10: '{}'", s),
            )
        }),
        other => Err(TaskFailure::raised(
            "TypeError",
            format!("int() argument must be a string or a number, not {}", other),
        )),
    }
}

fn builtin_float(args: &[Value], _: &Map<String, Value>) -> Result<Value, TaskFailure> {
    let parsed = match single("float", args)? {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(*b as i64 as f64),
        Value::String(s) => Some(s.trim().parse::<f64>().map_err(|_| {
            TaskFailure::raised(
                "ValueError",
                format!("could not convert string to float: '{}'", s),
            )
        })?),
        other => {
            return Err(TaskFailure::raised(
                "TypeError",
                format!("float() argument must be a string or a number, not {}", other),
            ))
        }
    };
    parsed
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| TaskFailure::raised("ValueError", "float out of range"))
}

/// `sum([..])` o `sum(a, b, ...)`.
fn builtin_sum(args: &[Value], _: &Map<String, Value>) -> Result<Value, TaskFailure> {
    let items: &[Value] = match args {
        [Value::Array(items)] => items,
        _ => args,
    };
    items
        .iter()
        .try_fold(Value::from(0), |acc, item| add_values(&acc, item))
}

fn builtin_concat(args: &[Value], _: &Map<String, Value>) -> Result<Value, TaskFailure> {
    if args.iter().all(Value::is_string) {
        let joined: String = args.iter().filter_map(Value::as_str).collect();
        return Ok(Value::String(joined));
    }
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Value::Array(items) => out.extend(items.iter().cloned()),
            other => out.push(other.clone()),
        }
    }
    Ok(Value::Array(out))
}

fn add_values(a: &Value, b: &Value) -> Result<Value, TaskFailure> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                if let Some(sum) = x.checked_add(y) {
                    return Ok(Value::from(sum));
                }
            }
            let sum = x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0);
            Number::from_f64(sum)
                .map(Value::Number)
                .ok_or_else(|| TaskFailure::raised("OverflowError", "result out of range"))
        }
        (Value::String(x), Value::String(y)) => Ok(Value::String(format!("{}{}", x, y))),
        (Value::Array(x), Value::Array(y)) => {
            Ok(Value::Array(x.iter().chain(y.iter()).cloned().collect()))
        }
        (x, y) => Err(TaskFailure::raised(
            "TypeError",
            format!("unsupported operand types for +: {} and {}", x, y),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use serde_json::json;

    fn call(reg: &Registry, name: &str, args: Vec<Value>) -> Result<Value, TaskFailure> {
        let f = reg.resolve_fn(name).unwrap();
        f(&args, &Map::new())
    }

    #[test]
    fn builtins_basicos() {
        let reg = Registry::with_builtins();
        assert_eq!(call(&reg, "str", vec![json!(123)]).unwrap(), json!("123"));
        assert_eq!(call(&reg, "str", vec![json!("x")]).unwrap(), json!("x"));
        assert_eq!(call(&reg, "int", vec![json!(" 42 ")]).unwrap(), json!(42));
        assert_eq!(call(&reg, "int", vec![json!(3.9)]).unwrap(), json!(3));
        assert_eq!(call(&reg, "float", vec![json!("1.5")]).unwrap(), json!(1.5));
        assert_eq!(call(&reg, "sum", vec![json!([1, 2, 3])]).unwrap(), json!(6));
        assert_eq!(call(&reg, "sum", vec![json!(1), json!(2.5)]).unwrap(), json!(3.5));
        assert_eq!(call(&reg, "add", vec![json!("a"), json!("b")]).unwrap(), json!("ab"));
        assert_eq!(call(&reg, "concat", vec![json!([1]), json!([2, 3])]).unwrap(), json!([1, 2, 3]));
        assert_eq!(call(&reg, "tuple", vec![json!(1), json!("x")]).unwrap(), json!([1, "x"]));
        assert_eq!(call(&reg, "identity", vec![]).unwrap(), Value::Null);
    }

    #[test]
    fn int_de_texto_invalido_es_value_error() {
        let reg = Registry::with_builtins();
        let err = call(&reg, "int", vec![json!("not an int")]).unwrap_err();
        assert_eq!(err.kind, FailureKind::Raised("ValueError".into()));
        assert_eq!(err.message, "invalid literal for int() with base 10: 'not an int'");
    }

    #[test]
    fn add_con_aridad_incorrecta() {
        let reg = Registry::with_builtins();
        let err = call(&reg, "add", vec![json!(1)]).unwrap_err();
        assert_eq!(err.kind, FailureKind::Raised("TypeError".into()));
    }

    #[test]
    fn nombres_desconocidos_son_pattern_missing() {
        let reg = Registry::with_builtins();
        assert!(reg.has_pattern("generic"));
        assert!(reg.has_pattern("shell"));
        let err = reg.resolve_pattern("no-existe").err().unwrap();
        assert_eq!(err.kind, FailureKind::PatternMissing);
        let err = reg.resolve_fn("no-existe").err().unwrap();
        assert_eq!(err.kind, FailureKind::PatternMissing);
    }

    #[test]
    fn funciones_de_la_aplicacion() {
        let mut reg = Registry::new();
        reg.register_fn("doble", |args, _| {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n * 2))
        });
        assert_eq!(call(&reg, "doble", vec![json!(21)]).unwrap(), json!(42));
        assert!(!reg.has_pattern("generic"));
    }
}
