//! Process sessions: one spawned command and its three stream loops.
//!
//! A session spawns the command through the local shell, or through the
//! transport binary for remote targets, and then runs concurrently:
//!
//! - an **out loop** and an **err loop** that read one byte at a time, keep
//!   everything they read, and log each completed line. A partial line that
//!   stays unfinished for one poll interval is logged as is, or, when it looks
//!   like a password prompt and forwarding is enabled, answered through a
//!   [`SecretPrompt`](crate::prompt::SecretPrompt).
//! - an **in loop** that writes the initial input and, in interactive
//!   sessions, then forwards every entry of the shared [`StdinQueue`] to the
//!   process, starting from the first entry ever appended.
//!
//! [`ProcessSession::join`] waits for the loops, reads the exit status, and
//! terminates the process if it is somehow still alive.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::CommonConfig;
use crate::console::{LinePrefix, TargetLogger};
use crate::env::{ConnectionContext, Env};
use crate::prompt::{is_password_prompt, SecretPrompt};
use crate::stdin_queue::{Cursor, StdinQueue};
use crate::{AppError, Result};

/// How long a stream read waits before the loop checks on the process.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Status reported when no exit code is available.
pub const UNKNOWN_STATUS: i32 = -1;

type SharedChild = Arc<Mutex<Child>>;
type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;
type StreamReader = Box<dyn AsyncRead + Unpin + Send>;

/// Per-session switches.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Echo lines to the console and forward operator input.
    pub interactive: bool,
    /// Send stderr into the stdout pipe.
    pub merge_stderr: bool,
    /// Answer password prompts through the secret prompt.
    pub ask_passwd: bool,
    /// Lines written to stdin right after spawning.
    pub input: Vec<String>,
}

impl SessionOptions {
    /// Options taken from the live configuration of `env`.
    #[must_use]
    pub fn from_env(env: &Env) -> Self {
        Self {
            interactive: env.common.interactive,
            ask_passwd: env.common.ask_passwd,
            ..Self::default()
        }
    }
}

/// Everything a finished command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// All stdout bytes, decoded lossily.
    pub stdout: String,
    /// All stderr bytes; empty when stderr was merged into stdout.
    pub stderr: String,
    /// Exit status, or [`UNKNOWN_STATUS`].
    pub status: i32,
}

impl RunOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Transport invocation for running `command` on a remote target.
///
/// `[ssh_binary, ssh_port_option, port, user@host, ...ssh_args, ...con_args, command]`
#[must_use]
pub fn transport_argv(common: &CommonConfig, ctx: &ConnectionContext, command: &str) -> Vec<String> {
    let mut argv = vec![
        common.ssh_binary.clone(),
        common.ssh_port_option.clone(),
        ctx.port.clone(),
        ctx.host_string(),
    ];
    argv.extend(common.ssh_args.split_whitespace().map(str::to_owned));
    argv.extend(ctx.con_args.split_whitespace().map(str::to_owned));
    argv.push(command.to_owned());
    argv
}

/// State the stream loops need, copied out of the caller's environment.
#[derive(Debug, Clone)]
struct LoopContext {
    logger: TargetLogger,
    interactive: bool,
    ask_passwd: bool,
    prompt: Arc<dyn SecretPrompt>,
}

impl LoopContext {
    fn flush(&self, prefix: LinePrefix, line: &mut Vec<u8>) {
        if !line.is_empty() {
            self.logger
                .line(prefix, &String::from_utf8_lossy(line), self.interactive);
            line.clear();
        }
    }
}

/// A running command and its stream loops.
#[derive(Debug)]
pub struct ProcessSession {
    pid: Option<u32>,
    child: SharedChild,
    stdin: SharedStdin,
    out_loop: JoinHandle<Vec<u8>>,
    err_loop: Option<JoinHandle<Vec<u8>>>,
    in_loop: JoinHandle<()>,
}

impl ProcessSession {
    /// Spawn `command` on the active target of `env` and start its loops.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Scope` outside a target scope and `AppError::Spawn`
    /// if the local shell or the transport binary cannot be started.
    pub async fn open(env: &Env, command: &str, options: SessionOptions) -> Result<Self> {
        let ctx = env.connection()?;
        let common = &env.common;

        let (program, mut cmd) = if common.is_local(&ctx.host) {
            let mut cmd = Command::new(&common.default_shell);
            cmd.arg("-c").arg(command);
            (common.default_shell.clone(), cmd)
        } else {
            let argv = transport_argv(common, ctx, command);
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            (argv[0].clone(), cmd)
        };
        cmd.stdin(Stdio::piped()).kill_on_drop(true);

        let merged = if options.merge_stderr {
            Some(merge_output(&mut cmd)?)
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            None
        };

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Spawn(format!("failed to spawn {program}: {err}")))?;
        // Our copies of a merged pipe's write ends live in `cmd`.
        drop(cmd);

        let pid = child.id();
        debug!(host = ctx.logger.name(), pid, program, "process spawned");

        let stdout: StreamReader = match merged {
            Some(reader) => reader,
            None => Box::new(
                child
                    .stdout
                    .take()
                    .ok_or_else(|| AppError::Spawn("failed to capture stdout".into()))?,
            ),
        };
        let stderr: Option<StreamReader> = match child.stderr.take() {
            Some(pipe) => Some(Box::new(pipe)),
            None => None,
        };
        let stdin: SharedStdin = Arc::new(Mutex::new(child.stdin.take()));
        let child: SharedChild = Arc::new(Mutex::new(child));

        if common.parallel_targets || common.parallel_tasks {
            tokio::task::yield_now().await;
        }

        let loop_ctx = LoopContext {
            logger: ctx.logger.clone(),
            interactive: options.interactive,
            ask_passwd: options.ask_passwd,
            prompt: env.prompt(),
        };

        // The writer runs beside the out/err loops: a command echoing a large
        // input must have its output drained while the input is still going in.
        let feed = InputFeed {
            initial: options.input,
            queue: options.interactive.then(|| env.stdin().clone()),
            keep_open: options.interactive || options.ask_passwd,
            store: common.store_stdin,
        };
        let in_loop = tokio::spawn(input_loop(
            feed,
            Arc::clone(&stdin),
            Arc::clone(&child),
            ctx.logger.clone(),
        ));

        let out_loop = tokio::spawn(stream_loop(
            stdout,
            LinePrefix::Out,
            loop_ctx.clone(),
            Arc::clone(&child),
            Arc::clone(&stdin),
        ));
        let err_loop = stderr.map(|reader| {
            tokio::spawn(stream_loop(
                reader,
                LinePrefix::Err,
                loop_ctx,
                Arc::clone(&child),
                Arc::clone(&stdin),
            ))
        });

        Ok(Self {
            pid,
            child,
            stdin,
            out_loop,
            err_loop,
            in_loop,
        })
    }

    /// OS process id, if the process had one when spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for all loops and return what the command produced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Stream` if a loop task panicked.
    pub async fn join(self) -> Result<RunOutput> {
        let stdout = self
            .out_loop
            .await
            .map_err(|err| AppError::Stream(format!("stdout loop failed: {err}")))?;
        let stderr = match self.err_loop {
            Some(handle) => handle
                .await
                .map_err(|err| AppError::Stream(format!("stderr loop failed: {err}")))?,
            None => Vec::new(),
        };
        if let Err(err) = self.in_loop.await {
            warn!(%err, "stdin loop failed");
        }
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        let status = match child.try_wait() {
            Ok(Some(status)) => exit_code(status),
            Ok(None) => {
                terminate(&mut child).await;
                UNKNOWN_STATUS
            }
            Err(err) => {
                warn!(%err, "can't read exit status");
                UNKNOWN_STATUS
            }
        };
        debug!(pid = self.pid, status, "child process has terminated");

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            status,
        })
    }

    /// Stop the loops and the process without waiting for output.
    pub async fn kill(self) {
        self.out_loop.abort();
        if let Some(handle) = &self.err_loop {
            handle.abort();
        }
        self.in_loop.abort();
        self.stdin.lock().await.take();
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(None)) {
            terminate(&mut child).await;
        }
    }
}

/// Point both stdout and stderr of `cmd` at one pipe and return its read end.
#[cfg(unix)]
fn merge_output(cmd: &mut Command) -> Result<StreamReader> {
    let (read_end, write_end) = cloexec_pipe()
        .map_err(|err| AppError::Spawn(format!("failed to create pipe: {err}")))?;
    let write_dup = write_end
        .try_clone()
        .map_err(|err| AppError::Spawn(format!("failed to duplicate pipe: {err}")))?;
    cmd.stdout(Stdio::from(write_end))
        .stderr(Stdio::from(write_dup));

    let reader = tokio::net::unix::pipe::Receiver::from_owned_fd(read_end)
        .map_err(|err| AppError::Spawn(format!("failed to register pipe: {err}")))?;
    Ok(Box::new(reader))
}

/// A pipe neither end of which leaks into later children.
///
/// Spawning dups the write end onto the child's stdout and stderr, which
/// clears the flag on those two descriptors only.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn cloexec_pipe() -> nix::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

// TODO: set FD_CLOEXEC with fcntl on platforms without pipe2.
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android", target_os = "freebsd"))))]
fn cloexec_pipe() -> nix::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    nix::unistd::pipe()
}

/// Without unix pipes, stderr is appended to the stdout stream.
#[cfg(not(unix))]
fn merge_output(cmd: &mut Command) -> Result<StreamReader> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    Err(AppError::Spawn(
        "merging stderr into stdout is only supported on unix".into(),
    ))
}

async fn has_exited(child: &SharedChild) -> bool {
    match child.lock().await.try_wait() {
        Ok(status) => status.is_some(),
        Err(err) => {
            debug!(%err, "can't poll child process");
            true
        }
    }
}

async fn write_stdin(stdin: &SharedStdin, data: &[u8]) -> std::io::Result<()> {
    let mut guard = stdin.lock().await;
    let Some(pipe) = guard.as_mut() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "stdin is closed",
        ));
    };
    pipe.write_all(data).await?;
    pipe.flush().await
}

/// Read one stream byte by byte until it is drained and the process exited.
async fn stream_loop(
    reader: StreamReader,
    prefix: LinePrefix,
    ctx: LoopContext,
    child: SharedChild,
    stdin: SharedStdin,
) -> Vec<u8> {
    let mut reader = BufReader::new(reader);
    let mut captured = Vec::new();
    let mut line = Vec::new();
    let mut byte = [0_u8; 1];

    loop {
        match timeout(POLL_INTERVAL, reader.read(&mut byte)).await {
            Ok(Ok(0)) => {
                ctx.flush(prefix, &mut line);
                if has_exited(&child).await {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Ok(Ok(_)) => {
                captured.push(byte[0]);
                match byte[0] {
                    b'\n' | b'\r' => ctx.flush(prefix, &mut line),
                    other => line.push(other),
                }
            }
            Ok(Err(err)) => {
                let err = AppError::Stream(format!("can't process {}: {err}", prefix.stream_name()));
                error!(host = ctx.logger.name(), %err, "stream loop stopped early");
                ctx.flush(prefix, &mut line);
                return captured;
            }
            Err(_elapsed) => {
                if !line.is_empty() {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if ctx.ask_passwd && is_password_prompt(&text) {
                        answer_prompt(&ctx, prefix, &text, &stdin).await;
                        line.clear();
                    } else {
                        ctx.flush(prefix, &mut line);
                    }
                }
                if has_exited(&child).await {
                    break;
                }
            }
        }
    }

    captured
}

/// Ask the operator for a secret and write it, newline-terminated, to stdin.
async fn answer_prompt(ctx: &LoopContext, prefix: LinePrefix, line: &str, stdin: &SharedStdin) {
    let question = format!("{} {prefix}{line}", ctx.logger.name());
    let prompt = Arc::clone(&ctx.prompt);
    let answer = tokio::task::spawn_blocking(move || prompt.ask(&question)).await;

    let secret = match answer {
        Ok(Ok(secret)) => secret,
        Ok(Err(err)) => {
            warn!(host = ctx.logger.name(), %err, "password prompt failed");
            return;
        }
        Err(err) => {
            warn!(host = ctx.logger.name(), %err, "password prompt task failed");
            return;
        }
    };

    info!(host = ctx.logger.name(), "answering password prompt");
    let mut payload = secret.into_bytes();
    payload.push(b'\n');
    if let Err(err) = write_stdin(stdin, &payload).await {
        warn!(host = ctx.logger.name(), %err, "can't send password");
    }
}

/// What the stdin writer sends to one process.
#[derive(Debug)]
struct InputFeed {
    /// Lines written first, newline-terminated.
    initial: Vec<String>,
    /// Operator input to forward, replayed from the start of the queue.
    queue: Option<StdinQueue>,
    /// Leave stdin open after the initial lines (for forwarding or prompts).
    keep_open: bool,
    /// Record forwarded lines in the log.
    store: bool,
}

/// Write the initial lines, then forward queue entries until the process
/// exits.
async fn input_loop(feed: InputFeed, stdin: SharedStdin, child: SharedChild, logger: TargetLogger) {
    for mut line in feed.initial {
        if !line.ends_with(['\n', '\r']) {
            line.push('\n');
        }
        debug!(host = logger.name(), "flushing input");
        if let Err(err) = write_stdin(&stdin, line.as_bytes()).await {
            warn!(host = logger.name(), %err, "can't flush input");
            break;
        }
    }
    if !feed.keep_open {
        // Nobody will ever write again; let the command see EOF.
        stdin.lock().await.take();
        return;
    }
    let Some(queue) = feed.queue else {
        return;
    };

    let mut cursor = Cursor::START;
    while !has_exited(&child).await {
        let (lines, next) = queue.drain_since(cursor);
        for line in lines {
            if feed.store {
                debug!(host = logger.name(), line = line.trim_end(), "flush to stdin");
            }
            if let Err(err) = write_stdin(&stdin, line.as_bytes()).await {
                debug!(host = logger.name(), %err, "stdin loop stopped");
                return;
            }
        }
        cursor = next;
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(UNKNOWN_STATUS)
}

/// Ask the process to stop, then kill it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, %err, "SIGTERM failed");
        }
    }
    if let Err(err) = child.kill().await {
        debug!(%err, "kill failed");
    }
}
