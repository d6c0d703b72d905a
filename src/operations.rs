//! Operations exposed to tasks: running commands, copying files, scripts
//! and interactive shells against the active target of an [`Env`].

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, error, info};

use crate::console::LinePrefix;
use crate::env::Env;
use crate::session::{transport_argv, ProcessSession, RunOutput, SessionOptions};
use crate::shaper::shape;
use crate::Result;

/// Default destination of [`push`] / [`put`].
pub const DEFAULT_PUSH_DST: &str = "~/";
/// Default destination of [`pull`] / [`get`].
pub const DEFAULT_PULL_DST: &str = ".";
/// Shell opened by [`open_shell`] when none is given.
pub const DEFAULT_SHELL: &str = "/bin/bash -i";
/// Interpreter for scripts without a `#!` line.
pub const DEFAULT_SCRIPT_BINARY: &str = "sh -s";
/// Status returned when a local source path does not exist (`ENOENT`).
pub const STATUS_NOT_FOUND: i32 = 2;

/// How [`run`] should execute a command and what it should return.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Prefix `sudo -S` unless the target is already privileged.
    pub use_sudo: bool,
    /// Run as this user through sudo.
    pub user: String,
    /// Run with this group through sudo.
    pub group: String,
    /// Return stdout, stderr and status instead of stdout only.
    pub freturn: bool,
    /// Send stderr into stdout.
    pub merge_stderr: bool,
    /// Lines written to stdin right after the command starts.
    pub input: Vec<String>,
}

impl RunOptions {
    /// Options that return the full [`RunOutput`].
    #[must_use]
    pub fn full() -> Self {
        Self {
            freturn: true,
            ..Self::default()
        }
    }
}

/// Result of [`run`], shaped by [`RunOptions::freturn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Returned {
    /// Captured stdout only.
    Stdout(String),
    /// Stdout, stderr and exit status.
    Full(RunOutput),
}

impl Returned {
    /// Captured stdout in either form.
    #[must_use]
    pub fn stdout(&self) -> &str {
        match self {
            Self::Stdout(stdout) => stdout,
            Self::Full(output) => &output.stdout,
        }
    }

    /// Exit status, when it was requested.
    #[must_use]
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::Stdout(_) => None,
            Self::Full(output) => Some(output.status),
        }
    }

    /// The full output, when it was requested.
    #[must_use]
    pub fn into_output(self) -> Option<RunOutput> {
        match self {
            Self::Stdout(_) => None,
            Self::Full(output) => Some(output),
        }
    }

    fn from_output(output: RunOutput, freturn: bool) -> Self {
        if freturn {
            Self::Full(output)
        } else {
            Self::Stdout(output.stdout)
        }
    }
}

/// Run `command` on the active target.
///
/// In dry-run mode the shaped command is only logged, and a `which` lookup of
/// each binary it names runs instead.
///
/// # Errors
///
/// Returns `AppError::Scope` outside a target scope and `AppError::Spawn` if
/// the command could not be started. A command that starts and fails is not
/// an error; its status and stderr carry the failure.
pub async fn run(env: &Env, command: &str, options: &RunOptions) -> Result<Returned> {
    let ctx = env.connection()?;
    let shaped = shape(
        command,
        options.use_sudo,
        &options.user,
        &options.group,
        ctx.is_root,
    );

    if env.common.dry_run {
        return dry_run(env, command, &shaped, options).await;
    }

    let output = execute(env, &shaped, session_options(env, options)).await?;
    Ok(Returned::from_output(output, options.freturn))
}

/// [`run`] with `use_sudo` set.
///
/// # Errors
///
/// Same as [`run`].
pub async fn sudo(env: &Env, command: &str, options: &RunOptions) -> Result<Returned> {
    let options = RunOptions {
        use_sudo: true,
        ..options.clone()
    };
    run(env, command, &options).await
}

/// [`run`] on `localhost`, keeping the current target's extra arguments.
///
/// # Errors
///
/// Same as [`run`].
pub async fn local(env: &Env, command: &str, options: &RunOptions) -> Result<Returned> {
    let con_args = env
        .connect
        .as_ref()
        .map(|ctx| ctx.con_args.clone())
        .unwrap_or_default();
    let mut local_env = env.snapshot();
    let scope = local_env.scoped_target("localhost", &con_args).await;
    run(&scope, command, options).await
}

/// Whether the active target's session already runs as uid 0.
///
/// Runs `id -u` quietly and outside dry-run mode.
///
/// # Errors
///
/// Returns `AppError::Spawn` if `id -u` cannot be started.
pub async fn check_is_root(env: &Env) -> Result<bool> {
    let mut quiet = env.snapshot();
    quiet.common.interactive = false;
    let output = execute(&quiet, "id -u", SessionOptions::from_env(&quiet)).await?;
    let is_root = output.success() && output.stdout.trim().parse::<u32>().is_ok_and(|uid| uid == 0);
    debug!(status = output.status, is_root, "privilege check finished");
    Ok(is_root)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Push,
    Pull,
}

/// Copy `src` on this machine to `dst` on the active target.
///
/// Returns 0 on success, [`STATUS_NOT_FOUND`] when a local source is missing,
/// the OS error code of a failed local copy, or the transfer binary's status.
///
/// # Errors
///
/// Returns `AppError::Scope` outside a target scope and `AppError::Spawn` if
/// the transfer binary could not be started.
pub async fn push(env: &Env, src: &str, dst: &str) -> Result<i32> {
    transfer(env, src, dst, Direction::Push).await
}

/// Copy `src` on the active target to `dst` on this machine.
///
/// # Errors
///
/// Same as [`push`].
pub async fn pull(env: &Env, src: &str, dst: &str) -> Result<i32> {
    transfer(env, src, dst, Direction::Pull).await
}

/// Alias for [`push`].
///
/// # Errors
///
/// Same as [`push`].
pub async fn put(env: &Env, src: &str, dst: &str) -> Result<i32> {
    push(env, src, dst).await
}

/// Alias for [`pull`].
///
/// # Errors
///
/// Same as [`push`].
pub async fn get(env: &Env, src: &str, dst: &str) -> Result<i32> {
    pull(env, src, dst).await
}

/// Feed `local_file` to an interpreter on the active target.
///
/// Without `binary` the interpreter comes from the script's `#!` line, or
/// [`DEFAULT_SCRIPT_BINARY`].
///
/// # Errors
///
/// Same as [`run`].
pub async fn run_script(
    env: &Env,
    local_file: &str,
    binary: Option<&str>,
    options: &RunOptions,
) -> Result<Returned> {
    let ctx = env.connection()?;
    let exists = Path::new(local_file).is_file();
    if env.common.dry_run {
        if exists {
            env.log_line(LinePrefix::DryOut, &format!("file '{local_file}' is exists"));
        } else {
            env.log_line(LinePrefix::DryOut, &format!("path '{local_file}' is not exists"));
        }
    }

    let binary = match binary {
        Some(binary) => binary.to_owned(),
        None => script_interpreter(local_file).await,
    };
    let mut command = format!("{binary} < {local_file}");
    if !env.common.is_local(&ctx.host) {
        let mut argv = transport_argv(&env.common, ctx, "");
        argv.pop();
        command = format!("{} {command}", quote_args(&argv));
    }
    debug!(host = ctx.logger.name(), command, "running script");

    let mut returned = local(env, &command, options).await?;
    if env.common.dry_run && !exists {
        if let Returned::Full(output) = &mut returned {
            output.status = STATUS_NOT_FOUND;
        }
    }
    Ok(returned)
}

/// Open `shell` on the active target with stderr merged into stdout.
///
/// `initial_input` is written to the shell's stdin first; further input comes
/// from the operator when the session is interactive.
///
/// # Errors
///
/// Same as [`run`].
pub async fn open_shell(env: &Env, initial_input: Vec<String>, shell: Option<&str>) -> Result<RunOutput> {
    let options = RunOptions {
        freturn: true,
        merge_stderr: true,
        input: initial_input,
        ..RunOptions::default()
    };
    let returned = run(env, shell.unwrap_or(DEFAULT_SHELL), &options).await?;
    Ok(returned.into_output().unwrap_or_default())
}

/// Spawn `command` as is, log it, and wait for it.
async fn execute(env: &Env, command: &str, options: SessionOptions) -> Result<RunOutput> {
    env.log_line(LinePrefix::In, command);
    let session = ProcessSession::open(env, command, options).await?;
    let output = session.join().await?;
    debug!(command, status = output.status, "command finished");
    Ok(output)
}

fn session_options(env: &Env, options: &RunOptions) -> SessionOptions {
    SessionOptions {
        merge_stderr: options.merge_stderr,
        input: options.input.clone(),
        ..SessionOptions::from_env(env)
    }
}

/// Log the shaped command and look up each binary it invokes with `which`.
async fn dry_run(env: &Env, original: &str, shaped: &str, options: &RunOptions) -> Result<Returned> {
    env.log_line(LinePrefix::DryIn, shaped);
    let lookup = which_command(&env.common.which_binary, original, shaped);
    let lookup_options = RunOptions {
        merge_stderr: options.merge_stderr,
        ..RunOptions::default()
    };
    let output = execute(env, &lookup, session_options(env, &lookup_options)).await?;
    Ok(Returned::from_output(output, options.freturn))
}

#[allow(clippy::expect_used)]
static SEGMENT_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[&|;]").expect("segment separator pattern"));

#[allow(clippy::expect_used)]
static SEGMENT_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\w']+").expect("segment word pattern"));

/// `<which> <binary>; ` for every `;`, `&` or `|` separated segment.
///
/// Privilege prefixes added by shaping count as their own segment.
pub fn which_command(which_binary: &str, original: &str, shaped: &str) -> String {

    let mut command = shaped.to_owned();
    if original != shaped {
        if let Some(at) = shaped.find(original) {
            command.insert(at, '|');
        }
    }

    SEGMENT_SEPARATORS
        .split(&command)
        .filter_map(|segment| SEGMENT_WORD.find(segment))
        .map(|binary| format!("{which_binary} {}; ", binary.as_str()))
        .collect()
}

async fn transfer(env: &Env, src: &str, dst: &str, direction: Direction) -> Result<i32> {
    let ctx = env.connection()?;
    let host_string = ctx.host_string();

    if env.common.is_local(&ctx.host) {
        if env.common.dry_run {
            report_path(env, src);
            report_path(env, dst);
            return Ok(if Path::new(src).exists() {
                0
            } else {
                STATUS_NOT_FOUND
            });
        }
        return Ok(copy_local(src, dst).await);
    }

    if env.common.dry_run {
        return dry_transfer(env, src, dst, direction).await;
    }

    let mut argv = vec![
        env.common.scp_binary.clone(),
        env.common.scp_port_option.clone(),
        ctx.port.clone(),
    ];
    argv.extend(env.common.scp_args.split_whitespace().map(str::to_owned));
    argv.extend(ctx.con_args.split_whitespace().map(str::to_owned));
    argv.push("-r".to_owned());
    match direction {
        Direction::Push => {
            argv.push(src.to_owned());
            argv.push(format!("{host_string}:{dst}"));
        }
        Direction::Pull => {
            argv.push(format!("{host_string}:{src}"));
            argv.push(dst.to_owned());
        }
    }

    let command = quote_args(&argv);
    debug!(host = ctx.logger.name(), command, "transferring");
    let returned = local(env, &command, &RunOptions::full()).await?;
    Ok(returned.status().unwrap_or(crate::session::UNKNOWN_STATUS))
}

/// Dry transfer against a remote target: test the remote path with
/// `test_binary`, report the local one.
async fn dry_transfer(env: &Env, src: &str, dst: &str, direction: Direction) -> Result<i32> {
    let test_binary = &env.common.test_binary;
    match direction {
        Direction::Pull => {
            let test = format!("{test_binary} {}", quote_arg(src));
            let output = execute(env, &test, SessionOptions::from_env(env)).await?;
            report_path(env, dst);
            Ok(output.status)
        }
        Direction::Push => {
            report_path(env, src);
            let test = format!("{test_binary} {}", quote_arg(dst));
            execute(env, &test, SessionOptions::from_env(env)).await?;
            Ok(if Path::new(src).exists() {
                0
            } else {
                STATUS_NOT_FOUND
            })
        }
    }
}

fn report_path(env: &Env, path: &str) {
    let target = Path::new(path);
    let line = if target.is_file() {
        format!("file '{path}' is exists")
    } else if target.is_dir() {
        format!("directory '{path}' is exists")
    } else {
        format!("path '{path}' is not exists")
    };
    env.log_line(LinePrefix::DryOut, &line);
}

async fn copy_local(src: &str, dst: &str) -> i32 {
    let source = PathBuf::from(src);
    if !source.exists() {
        error!(src, "path does not exist");
        return STATUS_NOT_FOUND;
    }
    let destination = expand_home(dst);
    let copied = tokio::task::spawn_blocking(move || {
        if source.is_file() {
            copy_file(&source, &destination)
        } else {
            copy_tree(&source, &destination)
        }
    })
    .await;

    match copied {
        Ok(Ok(())) => {
            debug!(src, dst, "copied");
            0
        }
        Ok(Err(err)) => {
            error!(src, dst, %err, "can't copy");
            err.raw_os_error().unwrap_or(1)
        }
        Err(err) => {
            error!(src, dst, %err, "copy task failed");
            1
        }
    }
}

/// Copy one file; into `dst` when it is a directory.
fn copy_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    let target = match src.file_name() {
        Some(name) if dst.is_dir() => dst.join(name),
        _ => dst.to_path_buf(),
    };
    std::fs::copy(src, target).map(|_| ())
}

/// Copy a directory tree to `dst`, which must not exist yet.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    if dst.exists() {
        // EEXIST
        return Err(std::io::Error::from_raw_os_error(17));
    }
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            PathBuf::from(home).join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(path),
    }
}

/// Interpreter named on the script's `#!` line.
async fn script_interpreter(local_file: &str) -> String {
    let first_line = match tokio::fs::read_to_string(local_file).await {
        Ok(content) => content.lines().next().map(str::to_owned),
        Err(err) => {
            info!(local_file, %err, "can't read script, using default interpreter");
            None
        }
    };
    first_line
        .as_deref()
        .and_then(|line| line.strip_prefix("#!"))
        .map_or_else(|| DEFAULT_SCRIPT_BINARY.to_owned(), |binary| binary.trim().to_owned())
}

/// Quote one argument for `sh -c` when it contains shell metacharacters.
#[must_use]
pub fn quote_arg(arg: &str) -> String {
    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#',
    ];

    if arg.is_empty() {
        return "''".to_owned();
    }
    if !arg.contains(SHELL_META) {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

fn quote_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}
