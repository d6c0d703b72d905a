//! Per-target log sink and the interactive console it echoes to.
//!
//! Every captured line goes to the `tracing` log with an `in: `, `out: ` or
//! `err: ` prefix. In interactive mode the same line is also written to a
//! [`Console`], prefixed by the acting `user@host`.

use std::fmt::{self, Debug, Display, Formatter};
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::info;

/// Standard stream a console line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Standard output.
    Out,
    /// Standard error.
    Err,
}

/// Destination for interactively echoed lines.
pub trait Console: Send + Sync + Debug {
    /// Write one complete line (without trailing newline).
    fn write_line(&self, channel: Channel, line: &str);
}

/// Console backed by the process's own stdout and stderr.
#[derive(Debug, Default)]
pub struct StdConsole;

impl Console for StdConsole {
    fn write_line(&self, channel: Channel, line: &str) {
        // A closed terminal is not worth failing a command over.
        let _ = match channel {
            Channel::Out => writeln!(std::io::stdout().lock(), "{line}"),
            Channel::Err => writeln!(std::io::stderr().lock(), "{line}"),
        };
    }
}

/// In-memory console that records lines in arrival order.
#[derive(Debug, Default)]
pub struct MemoryConsole {
    lines: Mutex<Vec<(Channel, String)>>,
}

impl MemoryConsole {
    /// Create an empty recording console.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded lines in arrival order.
    #[must_use]
    pub fn lines(&self) -> Vec<(Channel, String)> {
        self.lines
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Recorded lines of one channel joined with newlines.
    #[must_use]
    pub fn text(&self, channel: Channel) -> String {
        self.lines()
            .into_iter()
            .filter(|(ch, _)| *ch == channel)
            .map(|(_, line)| line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Console for MemoryConsole {
    fn write_line(&self, channel: Channel, line: &str) {
        if let Ok(mut guard) = self.lines.lock() {
            guard.push((channel, line.to_owned()));
        }
    }
}

/// Prefix marking where a logged line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinePrefix {
    /// A command sent to the target.
    In,
    /// A line read from the command's stdout.
    Out,
    /// A line read from the command's stderr.
    Err,
    /// A command that dry-run mode would have sent.
    DryIn,
    /// A dry-run observation.
    DryOut,
}

impl LinePrefix {
    /// Name of the process stream this prefix reads from.
    #[must_use]
    pub fn stream_name(self) -> &'static str {
        match self {
            Self::Err => "stderr",
            Self::In | Self::DryIn => "stdin",
            Self::Out | Self::DryOut => "stdout",
        }
    }

    fn channel(self) -> Channel {
        match self {
            Self::Err => Channel::Err,
            Self::In | Self::Out | Self::DryIn | Self::DryOut => Channel::Out,
        }
    }
}

impl Display for LinePrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::In => "in: ",
            Self::Out => "out: ",
            Self::Err => "err: ",
            Self::DryIn => "dry-in: ",
            Self::DryOut => "dry-out: ",
        })
    }
}

/// Log handle bound to one `user@host`.
///
/// Whether a line is echoed is decided per call, so a scope that turns
/// interactivity off takes effect immediately for an existing target.
#[derive(Clone)]
pub struct TargetLogger {
    name: String,
    console: Arc<dyn Console>,
}

impl TargetLogger {
    /// Bind a logger to `name`, echoing to `console`.
    #[must_use]
    pub fn new(name: impl Into<String>, console: Arc<dyn Console>) -> Self {
        Self {
            name: name.into(),
            console,
        }
    }

    /// The `user@host` this logger is bound to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emit one line to the log and, when `echo` is set, to the console.
    pub fn line(&self, prefix: LinePrefix, text: &str, echo: bool) {
        info!(target: "hostfact::target", host = %self.name, "{prefix}{text}");
        if echo {
            self.console
                .write_line(prefix.channel(), &format!("{} {prefix}{text}", self.name));
        }
    }
}

impl Debug for TargetLogger {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetLogger")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for TargetLogger {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TargetLogger {}
