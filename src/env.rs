//! Scoped execution environment.
//!
//! An [`Env`] is one thread of control's view of the configuration: the
//! [`CommonConfig`] values, the active [`ConnectionContext`] (if any), and a
//! stack of frames recording what each open scope replaced. Entering a scope
//! pushes a frame, exiting pops it and restores exactly what was there.
//!
//! Concurrently scheduled units never share an `Env`; each one receives a
//! [`Env::snapshot`] with its own empty stack, so a scope opened inside one
//! unit cannot leak into a sibling.

use std::fmt::{self, Display, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::CommonConfig;
use crate::console::{Console, LinePrefix, StdConsole, TargetLogger};
use crate::operations;
use crate::prompt::{SecretPrompt, TtyPrompt};
use crate::stdin_queue::StdinQueue;
use crate::{AppError, Result};

/// Per-target connection state, valid only inside a target scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Connection string as given, `[user@]host[:port]`.
    pub connect_string: String,
    /// Resolved login user.
    pub user: String,
    /// Resolved host name or address.
    pub host: String,
    /// Resolved port; not validated, the transport reports bad values.
    pub port: String,
    /// Extra whitespace-separated transport arguments for this target.
    pub con_args: String,
    /// Log sink bound to `user@host`.
    pub logger: TargetLogger,
    /// Whether commands on this target already run privileged.
    pub is_root: bool,
}

impl ConnectionContext {
    /// Resolve `connect_string` against the defaults in `common`.
    ///
    /// The user part is split off at the first user delimiter, the port at the
    /// first port delimiter of the remainder. Missing parts default to
    /// `common.user` and `common.ssh_port`.
    #[must_use]
    pub fn parse(
        connect_string: &str,
        con_args: &str,
        common: &CommonConfig,
        console: Arc<dyn Console>,
    ) -> Self {
        let (user, rest) = match connect_string.split_once(common.split_user.as_str()) {
            Some((user, rest)) => (user.to_owned(), rest),
            None => (common.user.clone(), connect_string),
        };
        let (host, port) = match rest.split_once(common.split_port.as_str()) {
            Some((host, port)) => (host.to_owned(), port.to_owned()),
            None => (rest.to_owned(), common.ssh_port.clone()),
        };
        let logger = TargetLogger::new(format!("{user}{}{host}", common.split_user), console);

        Self {
            connect_string: connect_string.to_owned(),
            user,
            host,
            port,
            con_args: con_args.to_owned(),
            logger,
            is_root: false,
        }
    }

    /// `user@host`, as passed to the transport.
    #[must_use]
    pub fn host_string(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Temporary configuration values applied by [`Env::enter`].
///
/// Keys are [`CommonConfig`] field names; unknown keys become extra settings
/// that disappear again when the scope exits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides(Map<String, Value>);

impl Overrides {
    /// No overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one override.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Stop echoing captured output to the console.
    #[must_use]
    pub fn quiet() -> Self {
        Self::new().set("interactive", false)
    }

    /// Keys this set of overrides touches.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// What one open scope replaced.
#[derive(Debug, Clone)]
enum Frame {
    /// Previous value per overridden key; `None` when the key did not exist.
    Settings(Vec<(String, Option<Value>)>),
    /// Connection context active before the target scope.
    Target(Option<ConnectionContext>),
}

/// Proof of an open scope, consumed by [`Env::exit`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a scope stays open until its handle is passed to Env::exit"]
pub struct ScopeHandle {
    depth: usize,
}

/// A rejected [`Env::exit`], carrying the handle back to the caller.
#[derive(Debug)]
pub struct ExitError {
    /// The scope that is still open.
    pub handle: ScopeHandle,
    /// Why it could not be closed.
    pub error: AppError,
}

impl Display for ExitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for ExitError {}

impl From<ExitError> for AppError {
    fn from(err: ExitError) -> Self {
        err.error
    }
}

/// One thread of control's configuration and scope stack.
#[derive(Debug, Clone)]
pub struct Env {
    /// Live configuration for this thread of control.
    pub common: CommonConfig,
    /// Active target, if a target scope is open.
    pub connect: Option<ConnectionContext>,
    console: Arc<dyn Console>,
    stdin: StdinQueue,
    prompt: Arc<dyn SecretPrompt>,
    frames: Vec<Frame>,
}

impl Env {
    /// Environment writing to the real terminal.
    #[must_use]
    pub fn new(common: CommonConfig) -> Self {
        Self {
            common,
            connect: None,
            console: Arc::new(StdConsole),
            stdin: StdinQueue::new(),
            prompt: Arc::new(TtyPrompt),
            frames: Vec::new(),
        }
    }

    /// Replace the console interactive lines are echoed to.
    #[must_use]
    pub fn with_console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = console;
        self
    }

    /// Replace the operator input queue.
    #[must_use]
    pub fn with_stdin(mut self, stdin: StdinQueue) -> Self {
        self.stdin = stdin;
        self
    }

    /// Replace the source of password answers.
    #[must_use]
    pub fn with_prompt(mut self, prompt: Arc<dyn SecretPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Console interactive lines are echoed to.
    #[must_use]
    pub fn console(&self) -> Arc<dyn Console> {
        Arc::clone(&self.console)
    }

    /// Shared operator input queue.
    #[must_use]
    pub fn stdin(&self) -> &StdinQueue {
        &self.stdin
    }

    /// Source of password answers.
    #[must_use]
    pub fn prompt(&self) -> Arc<dyn SecretPrompt> {
        Arc::clone(&self.prompt)
    }

    /// Independent copy of the current values for a concurrent unit.
    ///
    /// The copy starts with an empty scope stack: scopes it opens are its
    /// own, and the scopes open here are not its to close.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            frames: Vec::new(),
            ..self.clone()
        }
    }

    /// Number of open scopes.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The active target.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Scope` outside a target scope.
    pub fn connection(&self) -> Result<&ConnectionContext> {
        self.connect
            .as_ref()
            .ok_or_else(|| AppError::Scope("no target scope is active".into()))
    }

    /// Log a line for the active target, echoing it when interactive.
    pub fn log_line(&self, prefix: LinePrefix, text: &str) {
        match &self.connect {
            Some(ctx) => ctx.logger.line(prefix, text, self.common.interactive),
            None => debug!("{prefix}{text}"),
        }
    }

    /// Apply `overrides` on top of the current configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an override has the wrong type for the
    /// field it names; the configuration is left unchanged in that case.
    pub fn enter(&mut self, overrides: Overrides) -> Result<ScopeHandle> {
        let mut fields = config_fields(&self.common)?;
        let mut saved = Vec::new();
        for (key, value) in overrides.0 {
            let previous = fields.insert(key.clone(), value);
            saved.push((key, previous));
        }
        self.common = serde_json::from_value(Value::Object(fields))
            .map_err(|err| AppError::Config(format!("invalid override: {err}")))?;

        debug!(keys = saved.len(), depth = self.frames.len() + 1, "settings scope entered");
        self.frames.push(Frame::Settings(saved));
        Ok(ScopeHandle {
            depth: self.frames.len(),
        })
    }

    /// Make `connect_string` the active target without checking its privileges.
    pub fn enter_target(&mut self, connect_string: &str, con_args: &str) -> ScopeHandle {
        let ctx = ConnectionContext::parse(connect_string, con_args, &self.common, self.console());
        debug!(host = ctx.logger.name(), port = %ctx.port, "target scope entered");

        let previous = self.connect.replace(ctx);
        self.frames.push(Frame::Target(previous));
        ScopeHandle {
            depth: self.frames.len(),
        }
    }

    /// Enter a target scope and check whether the session is privileged.
    ///
    /// A failed check is logged and treated as unprivileged.
    pub async fn open_target(&mut self, connect_string: &str, con_args: &str) -> ScopeHandle {
        let handle = self.enter_target(connect_string, con_args);
        let is_root = match operations::check_is_root(self).await {
            Ok(is_root) => is_root,
            Err(err) => {
                warn!(host = connect_string, %err, "privilege check failed");
                false
            }
        };
        if let Some(ctx) = self.connect.as_mut() {
            ctx.is_root = is_root;
        }
        handle
    }

    /// Close the innermost scope, restoring what it replaced.
    ///
    /// # Errors
    ///
    /// Returns [`ExitError`] with `AppError::Scope` if `handle` is not the
    /// innermost open scope, or `AppError::Config` if restored settings no
    /// longer deserialize. The stack is unchanged and the handle comes back
    /// inside the error, so it can still be closed in order.
    pub fn exit(&mut self, handle: ScopeHandle) -> std::result::Result<(), ExitError> {
        if handle.depth != self.frames.len() {
            let error = AppError::Scope(format!(
                "scope exited out of order: handle depth {}, stack depth {}",
                handle.depth,
                self.frames.len()
            ));
            return Err(ExitError { handle, error });
        }
        if let Err(error) = self.pop_frame() {
            return Err(ExitError { handle, error });
        }
        debug!(depth = self.frames.len(), "scope exited");
        Ok(())
    }

    /// Restore what the top frame replaced, popping it only on success.
    fn pop_frame(&mut self) -> Result<()> {
        match self.frames.last() {
            None => return Err(AppError::Scope("no scope is open".into())),
            Some(Frame::Target(previous)) => {
                self.connect = previous.clone();
            }
            Some(Frame::Settings(saved)) => {
                let mut fields = config_fields(&self.common)?;
                for (key, previous) in saved.iter().rev() {
                    match previous {
                        Some(value) => fields.insert(key.clone(), value.clone()),
                        None => fields.remove(key),
                    };
                }
                self.common = serde_json::from_value(Value::Object(fields))?;
            }
        }
        self.frames.pop();
        Ok(())
    }

    /// Apply `overrides` until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Env::enter`].
    pub fn scoped(&mut self, overrides: Overrides) -> Result<Scoped<'_>> {
        let handle = self.enter(overrides)?;
        Ok(Scoped {
            env: self,
            handle: Some(handle),
        })
    }

    /// Make `connect_string` the active target until the guard is dropped.
    pub async fn scoped_target(&mut self, connect_string: &str, con_args: &str) -> Scoped<'_> {
        let handle = self.open_target(connect_string, con_args).await;
        Scoped {
            env: self,
            handle: Some(handle),
        }
    }
}

/// Guard that exits its scope when dropped.
#[derive(Debug)]
pub struct Scoped<'a> {
    env: &'a mut Env,
    handle: Option<ScopeHandle>,
}

impl Deref for Scoped<'_> {
    type Target = Env;

    fn deref(&self) -> &Env {
        self.env
    }
}

impl DerefMut for Scoped<'_> {
    fn deref_mut(&mut self) -> &mut Env {
        self.env
    }
}

impl Drop for Scoped<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.env.exit(handle) {
                warn!(%err, "failed to close scope");
            }
        }
    }
}

fn config_fields(common: &CommonConfig) -> Result<Map<String, Value>> {
    match serde_json::to_value(common)? {
        Value::Object(fields) => Ok(fields),
        other => Err(AppError::Config(format!(
            "config did not serialize to a map: {other}"
        ))),
    }
}
