//! Named tasks: the registry, the command-line mini-language, and the
//! built-in operations exposed as tasks.
//!
//! A command line such as
//!
//! ```text
//! run 'echo hi' use_sudo=True  push:./dist,/srv/app
//! ```
//!
//! parses into two [`Task`]s. A first token that names no task implies `run`.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::{Arc, LazyLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use regex::Regex;
use tracing::{info, warn};

use crate::config::CommonConfig;
use crate::env::Env;
use crate::operations::{self, RunOptions, DEFAULT_PULL_DST, DEFAULT_PUSH_DST};
use crate::{AppError, Result};

/// Keyword arguments of a task, as given on the command line.
pub type Kwargs = BTreeMap<String, String>;

/// Type-erased task body.
pub type TaskFn = Arc<dyn Fn(Env, Vec<String>, Kwargs) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Task invoked for command lines that name no task.
pub const DEFAULT_TASK: &str = "run";

/// One scheduled operation: name, positional and keyword arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Registered task name.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<String>,
    /// Keyword arguments.
    pub kwargs: Kwargs,
}

impl Task {
    /// Task without keyword arguments.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
            kwargs: Kwargs::new(),
        }
    }

    /// Add one keyword argument.
    #[must_use]
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Mapping from task name to task body, built once before scheduling.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskFn>,
}

impl Debug for TaskRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under `name`, replacing any earlier task of that name.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(Env, Vec<String>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let body: TaskFn = Arc::new(move |env, args, kwargs| body(env, args, kwargs).boxed());
        self.tasks.insert(name.into(), body);
    }

    /// Whether a task named `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Run `task` in `env`.
    ///
    /// An unknown name is not fatal: it is logged, and the name and its
    /// positional arguments are joined into one command for [`DEFAULT_TASK`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Task` when neither the task nor the default task is
    /// registered, or whatever the task body returns.
    pub async fn invoke(&self, env: Env, task: &Task) -> Result<()> {
        if let Some(body) = self.tasks.get(&task.name) {
            return body(env, task.args.clone(), task.kwargs.clone()).await;
        }

        warn!(task = %task.name, "can not find task, executing built-in {DEFAULT_TASK}");
        let Some(fallback) = self.tasks.get(DEFAULT_TASK) else {
            return Err(AppError::Task(format!("unknown task: {}", task.name)));
        };
        let command = std::iter::once(task.name.as_str())
            .chain(task.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        fallback(env, vec![command], task.kwargs.clone()).await
    }

    /// Registry holding the built-in operations.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register("run", |env, args, kwargs| async move {
            let (command, options) = bind_run(&args, &kwargs, RUN_PARAMS)?;
            operations::run(&env, &command, &options).await.map(drop)
        });
        registry.register("sudo", |env, args, kwargs| async move {
            let (command, options) = bind_run(&args, &kwargs, SUDO_PARAMS)?;
            operations::sudo(&env, &command, &options).await.map(drop)
        });
        registry.register("local", |env, args, kwargs| async move {
            let (command, options) = bind_run(&args, &kwargs, RUN_PARAMS)?;
            operations::local(&env, &command, &options).await.map(drop)
        });
        registry.register("check_is_root", |env, _args, _kwargs| async move {
            let is_root = operations::check_is_root(&env).await?;
            info!(host = env.connection()?.logger.name(), is_root, "privilege check");
            Ok(())
        });

        registry.register("push", |env, args, kwargs| async move {
            let (src, dst) = bind_transfer(&args, &kwargs, DEFAULT_PUSH_DST)?;
            report_status("push", operations::push(&env, &src, &dst).await?);
            Ok(())
        });
        registry.register("put", |env, args, kwargs| async move {
            let (src, dst) = bind_transfer(&args, &kwargs, DEFAULT_PUSH_DST)?;
            report_status("put", operations::put(&env, &src, &dst).await?);
            Ok(())
        });
        registry.register("pull", |env, args, kwargs| async move {
            let (src, dst) = bind_transfer(&args, &kwargs, DEFAULT_PULL_DST)?;
            report_status("pull", operations::pull(&env, &src, &dst).await?);
            Ok(())
        });
        registry.register("get", |env, args, kwargs| async move {
            let (src, dst) = bind_transfer(&args, &kwargs, DEFAULT_PULL_DST)?;
            report_status("get", operations::get(&env, &src, &dst).await?);
            Ok(())
        });

        registry.register("run_script", |env, args, kwargs| async move {
            let mut bound = bind(&args, &kwargs, SCRIPT_PARAMS)?;
            let local_file = bound
                .remove("local_file")
                .ok_or_else(|| AppError::Task("run_script needs a local_file".into()))?;
            let binary = bound.remove("binary").filter(|binary| !binary.is_empty());
            let options = run_options(&bound)?;
            operations::run_script(&env, &local_file, binary.as_deref(), &options)
                .await
                .map(drop)
        });
        registry.register("open_shell", |env, args, kwargs| async move {
            let mut bound = bind(&args, &kwargs, SHELL_PARAMS)?;
            let input = bound.remove("command").into_iter().collect();
            let shell = bound.remove("shell");
            operations::open_shell(&env, input, shell.as_deref())
                .await
                .map(drop)
        });

        registry
    }
}

const RUN_PARAMS: &[&str] = &[
    "command",
    "use_sudo",
    "user",
    "group",
    "freturn",
    "err_to_out",
    "input",
];
const SUDO_PARAMS: &[&str] = &["command", "user", "group", "freturn", "err_to_out", "input"];
const SCRIPT_PARAMS: &[&str] = &["local_file", "binary", "freturn", "err_to_out", "input"];
const SHELL_PARAMS: &[&str] = &["command", "shell"];

/// Match positional then keyword arguments to `params`.
fn bind(args: &[String], kwargs: &Kwargs, params: &[&str]) -> Result<BTreeMap<String, String>> {
    if args.len() > params.len() {
        return Err(AppError::Task(format!(
            "too many arguments: expected at most {}, got {}",
            params.len(),
            args.len()
        )));
    }
    let mut bound: BTreeMap<String, String> = params
        .iter()
        .zip(args)
        .map(|(param, arg)| ((*param).to_owned(), arg.clone()))
        .collect();
    for (key, value) in kwargs {
        if !params.contains(&key.as_str()) {
            return Err(AppError::Task(format!("unexpected keyword argument: {key}")));
        }
        if bound.insert(key.clone(), value.clone()).is_some() {
            return Err(AppError::Task(format!("argument given twice: {key}")));
        }
    }
    Ok(bound)
}

fn bind_run(args: &[String], kwargs: &Kwargs, params: &[&str]) -> Result<(String, RunOptions)> {
    let mut bound = bind(args, kwargs, params)?;
    let command = bound
        .remove("command")
        .ok_or_else(|| AppError::Task("missing command".into()))?;
    Ok((command, run_options(&bound)?))
}

fn run_options(bound: &BTreeMap<String, String>) -> Result<RunOptions> {
    let flag = |key: &str| bound.get(key).map_or(Ok(false), |value| parse_bool(key, value));
    Ok(RunOptions {
        use_sudo: flag("use_sudo")?,
        user: bound.get("user").cloned().unwrap_or_default(),
        group: bound.get("group").cloned().unwrap_or_default(),
        freturn: flag("freturn")?,
        merge_stderr: flag("err_to_out")?,
        input: bound.get("input").cloned().into_iter().collect(),
    })
}

fn bind_transfer(args: &[String], kwargs: &Kwargs, default_dst: &str) -> Result<(String, String)> {
    let mut bound = bind(args, kwargs, &["src", "dst"])?;
    let src = bound
        .remove("src")
        .ok_or_else(|| AppError::Task("missing src".into()))?;
    let dst = bound.remove("dst").unwrap_or_else(|| default_dst.to_owned());
    Ok((src, dst))
}

fn report_status(task: &str, status: i32) {
    if status != 0 {
        warn!(task, status, "transfer finished with non-zero status");
    }
}

/// Parse a boolean keyword argument.
///
/// # Errors
///
/// Returns `AppError::Task` for anything but `True`/`true`/`1` and
/// `False`/`false`/`0`/empty.
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "True" | "true" | "1" => Ok(true),
        "False" | "false" | "0" | "" => Ok(false),
        other => Err(AppError::Task(format!("{key} expects a boolean, got {other:?}"))),
    }
}

/// Split command-line arguments into tasks.
///
/// Tokens naming a registered task start a new task, as does
/// `name<split_function>arg<split_args>arg`; any other token is an argument of
/// the current task. Trailing `key=value` arguments become keyword arguments
/// unless the character before `=` is one of `arithmetic_symbols`.
pub fn parse_tasks(arguments: &[String], registry: &TaskRegistry, common: &CommonConfig) -> Vec<Task> {
    let Some(first) = arguments.first() else {
        return Vec::new();
    };
    let split_function = common.split_function.as_str();
    let head = first.split(split_function).next().unwrap_or_default();

    let mut groups: Vec<Vec<String>> = Vec::new();
    if !registry.contains(head) {
        warn!(task = head, "can not find task, executing built-in {DEFAULT_TASK}");
        groups.push(vec![DEFAULT_TASK.to_owned()]);
    }

    for token in arguments {
        if registry.contains(token) {
            groups.push(vec![token.clone()]);
            continue;
        }
        if let Some((name, inline)) = token.split_once(split_function) {
            if registry.contains(name) {
                let mut group = vec![name.to_owned()];
                group.extend(inline.split(common.split_args.as_str()).map(str::to_owned));
                groups.push(group);
                continue;
            }
        }
        match groups.last_mut() {
            Some(group) => group.push(token.clone()),
            None => groups.push(vec![DEFAULT_TASK.to_owned(), token.clone()]),
        }
    }

    groups
        .into_iter()
        .filter_map(|mut group| {
            if group.is_empty() {
                return None;
            }
            let name = group.remove(0);
            let mut args = group;
            let mut kwargs = Kwargs::new();
            while let Some((key, value)) = args
                .last()
                .and_then(|arg| split_kwarg(arg, &common.arithmetic_symbols))
            {
                kwargs.insert(key, value);
                args.pop();
            }
            Some(Task { name, args, kwargs })
        })
        .collect()
}

#[allow(clippy::expect_used)]
static KEYWORD_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\w+)\s*=([^=]*)$").expect("keyword argument pattern"));

fn split_kwarg(arg: &str, arithmetic_symbols: &[String]) -> Option<(String, String)> {
    let eq = arg.find('=')?;
    if eq == 0 {
        return None;
    }
    let before = arg[..eq].chars().last()?;
    if arithmetic_symbols
        .iter()
        .any(|symbol| symbol.chars().eq(std::iter::once(before)))
    {
        return None;
    }
    let captures = KEYWORD_ARG.captures(arg)?;
    Some((captures[1].to_owned(), captures[2].trim().to_owned()))
}
