//! Process-wide tunables, their defaults, and config-file loading.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error};

use crate::{AppError, Result};

/// Config files looked for in the working directory when none is given.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["factory.toml", "factory.json"];

/// Process-wide configuration shared by every scheduled unit.
///
/// Concurrent units never see the live value: each receives its own copy
/// when it is spawned (see [`crate::env::Env::snapshot`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct CommonConfig {
    /// Echo captured lines to the console and forward operator keystrokes.
    pub interactive: bool,
    /// Copy warnings and errors to stderr in addition to the log file.
    pub show_errors: bool,
    /// Run the per-target work for all targets concurrently.
    pub parallel_targets: bool,
    /// Within one target, run the task list concurrently.
    pub parallel_tasks: bool,
    /// Answer password prompts through a non-echoing terminal prompt.
    pub ask_passwd: bool,
    /// Host names that resolve to the local machine.
    pub localhost: Vec<String>,
    /// Separator between a task name and its inline arguments.
    pub split_function: String,
    /// Separator between inline task arguments.
    pub split_args: String,
    /// Characters that, directly before `=`, mark an argument as an expression.
    pub arithmetic_symbols: Vec<String>,
    /// Separator between connection strings in a host list.
    pub split_hosts: String,
    /// Separator between user and host in a connection string.
    pub split_user: String,
    /// Separator between host and port in a connection string.
    pub split_port: String,
    /// Shell used to run commands on the local machine.
    pub default_shell: String,
    /// Transport binary used to reach remote targets.
    pub ssh_binary: String,
    /// Port used when a connection string has none.
    #[serde(deserialize_with = "string_or_number")]
    pub ssh_port: String,
    /// Flag preceding the port in transport invocations.
    pub ssh_port_option: String,
    /// Extra whitespace-separated transport arguments.
    pub ssh_args: String,
    /// File-transfer binary used for remote push/pull.
    pub scp_binary: String,
    /// Flag preceding the port in file-transfer invocations.
    pub scp_port_option: String,
    /// Extra whitespace-separated file-transfer arguments.
    pub scp_args: String,
    /// User used when a connection string has none.
    pub user: String,
    /// Connection strings of the targets, `[user@]host[:port]`.
    pub hosts: Vec<String>,
    /// Record forwarded operator keystrokes in the log.
    pub store_stdin: bool,
    /// Look up binaries with `which` instead of executing commands.
    pub dry_run: bool,
    /// Binary used by dry-run mode to check that a command exists.
    pub which_binary: String,
    /// Command used by dry-run mode to check that a path exists.
    pub test_binary: String,
    /// Any other setting, typically introduced by a temporary scope.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for CommonConfig {
    fn default() -> Self {
        let mut localhost = vec!["localhost".to_owned(), "127.0.0.1".to_owned()];
        if let Some(name) = machine_hostname() {
            if !localhost.contains(&name) {
                localhost.push(name);
            }
        }

        Self {
            interactive: true,
            show_errors: false,
            parallel_targets: false,
            parallel_tasks: false,
            ask_passwd: false,
            localhost,
            split_function: ":".into(),
            split_args: ",".into(),
            arithmetic_symbols: ["=", "!", ">", "<", "+", "-", "*", "/", "%"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            split_hosts: ",".into(),
            split_user: "@".into(),
            split_port: ":".into(),
            default_shell: "sh".into(),
            ssh_binary: "ssh".into(),
            ssh_port: "22".into(),
            ssh_port_option: "-p".into(),
            ssh_args: "-tt".into(),
            scp_binary: "scp".into(),
            scp_port_option: "-P".into(),
            scp_args: String::new(),
            user: login_name(),
            hosts: vec!["localhost".into()],
            store_stdin: true,
            dry_run: false,
            which_binary: "which".into(),
            test_binary: "test -e".into(),
            extra: BTreeMap::new(),
        }
    }
}

impl CommonConfig {
    /// Load configuration from a `.toml` or `.json` file.
    ///
    /// Keys absent from the file keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("failed to read {}: {err}", path.display()))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("toml") => Self::from_toml_str(&raw),
            _ => Err(AppError::Config(format!(
                "can't determine file format for {}",
                path.display()
            ))),
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the text is not valid TOML for this schema.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the text is not valid JSON for this schema.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load `explicit` if given, else the first default config file present.
    ///
    /// A file that fails to load is logged and the defaults are kept.
    #[must_use]
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let candidate = explicit.map(Path::to_path_buf).or_else(|| {
            DEFAULT_CONFIG_FILES
                .iter()
                .map(Path::new)
                .find(|p| p.exists())
                .map(Path::to_path_buf)
        });

        let Some(path) = candidate else {
            debug!("no config file found, using defaults");
            return Self::default();
        };

        match Self::load_from_path(&path) {
            Ok(config) => {
                debug!(path = %path.display(), "config loaded");
                config
            }
            Err(err) => {
                error!(path = %path.display(), %err, "can't load config, using defaults");
                Self::default()
            }
        }
    }

    /// Whether `host` names the local machine.
    #[must_use]
    pub fn is_local(&self, host: &str) -> bool {
        self.localhost.iter().any(|name| name == host)
    }

    /// Concurrency knobs derived from this configuration.
    #[must_use]
    pub fn concurrency(&self) -> crate::scheduler::Concurrency {
        crate::scheduler::Concurrency {
            parallel_targets: self.parallel_targets,
            parallel_tasks: self.parallel_tasks,
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(text) => text,
        Port::Number(num) => num.to_string(),
    })
}

fn login_name() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "user".into())
}

#[cfg(unix)]
fn machine_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
}

#[cfg(not(unix))]
fn machine_hostname() -> Option<String> {
    env::var("COMPUTERNAME").ok()
}
