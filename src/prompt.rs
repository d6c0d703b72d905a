//! Non-echoing password prompts.
//!
//! When a command asks for a password and prompt forwarding is enabled, the
//! stream loop asks a [`SecretPrompt`] for the answer and writes it to the
//! command's stdin. The answer never reaches the log.

use std::fmt::Debug;

use crate::{AppError, Result};

/// Substrings that mark a partially read line as a password prompt.
pub const PROMPT_MARKERS: &[&str] = &["[sudo]", "password", "Password"];

/// Whether `line` looks like a password prompt.
#[must_use]
pub fn is_password_prompt(line: &str) -> bool {
    PROMPT_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Source of secrets typed by the operator.
///
/// Implementations block; callers run them on the blocking pool.
pub trait SecretPrompt: Send + Sync + Debug {
    /// Show `prompt` and return the answer without its line terminator.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the answer cannot be read.
    fn ask(&self, prompt: &str) -> Result<String>;
}

/// Prompt on the controlling terminal with echo turned off.
#[derive(Debug, Default)]
pub struct TtyPrompt;

#[cfg(unix)]
impl SecretPrompt for TtyPrompt {
    fn ask(&self, prompt: &str) -> Result<String> {
        use std::fs::OpenOptions;
        use std::io::{BufRead, BufReader, Write};

        use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

        let mut tty = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/tty")
            .map_err(|err| AppError::Io(format!("can't open terminal: {err}")))?;

        let saved = tcgetattr(&tty).map_err(|err| AppError::Io(format!("tcgetattr: {err}")))?;
        let mut silent = saved.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&tty, SetArg::TCSANOW, &silent)
            .map_err(|err| AppError::Io(format!("tcsetattr: {err}")))?;

        let answer = (|| -> std::io::Result<String> {
            tty.write_all(prompt.as_bytes())?;
            tty.flush()?;
            let mut line = String::new();
            BufReader::new(&tty).read_line(&mut line)?;
            Ok(line)
        })();

        // Restore echo before reporting any read failure.
        let restored = tcsetattr(&tty, SetArg::TCSANOW, &saved);
        let _ = tty.write_all(b"\n");
        restored.map_err(|err| AppError::Io(format!("tcsetattr: {err}")))?;

        let line = answer?;
        Ok(line.trim_end_matches(['\n', '\r']).to_owned())
    }
}

#[cfg(not(unix))]
impl SecretPrompt for TtyPrompt {
    fn ask(&self, prompt: &str) -> Result<String> {
        use std::io::{BufRead, Write};

        let mut stderr = std::io::stderr().lock();
        stderr.write_all(prompt.as_bytes())?;
        stderr.flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\n', '\r']).to_owned())
    }
}

/// Prompt that always answers with the same secret.
#[derive(Debug, Clone)]
pub struct StaticPrompt {
    answer: String,
}

impl StaticPrompt {
    /// Answer every prompt with `answer`.
    #[must_use]
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
        }
    }
}

impl SecretPrompt for StaticPrompt {
    fn ask(&self, _prompt: &str) -> Result<String> {
        Ok(self.answer.clone())
    }
}
