//! Operator keystroke broadcast queue.
//!
//! One background reader appends lines from the controlling input; every
//! interactive process session pulls the entries it has not yet forwarded
//! using its own [`Cursor`]. Entries are never removed, so readers may join
//! and leave at any time without coordinating with each other.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Count of queue entries already delivered to one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor(usize);

impl Cursor {
    /// Cursor positioned before the first entry ever appended.
    pub const START: Self = Self(0);

    /// Number of entries this cursor has moved past.
    #[must_use]
    pub fn position(self) -> usize {
        self.0
    }
}

/// Append-only, shared sequence of operator input lines.
#[derive(Debug, Clone, Default)]
pub struct StdinQueue {
    entries: Arc<Mutex<Vec<String>>>,
}

impl StdinQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line, exactly as read (terminator included).
    pub fn append(&self, line: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.into());
    }

    /// Number of entries appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursor past every entry appended so far.
    ///
    /// A consumer starting here skips the backlog; [`Cursor::START`] replays it.
    #[must_use]
    pub fn consumer_state(&self) -> Cursor {
        Cursor(self.len())
    }

    /// Entries appended after `cursor`, and the cursor past them.
    #[must_use]
    pub fn drain_since(&self, cursor: Cursor) -> (Vec<String>, Cursor) {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let start = cursor.0.min(entries.len());
        (entries[start..].to_vec(), Cursor(entries.len()))
    }
}

/// Spawn the single background loop that feeds `queue` from `input`.
///
/// The loop ends on EOF, on a read error, or when `cancel` fires. With
/// `store` set, every line is also recorded in the log.
pub fn spawn_reader<R>(
    queue: StdinQueue,
    input: R,
    store: bool,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(input);
        loop {
            let mut line = Vec::new();
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("stdin reader: cancellation received, stopping");
                    break;
                }

                read = reader.read_until(b'\n', &mut line) => match read {
                    Ok(0) => {
                        debug!("stdin reader: EOF");
                        break;
                    }
                    Ok(_) => {
                        // Undecodable bytes are replaced; the line still goes out.
                        let line = String::from_utf8_lossy(&line).into_owned();
                        if store {
                            info!(line = line.trim_end(), "message from stdin");
                        }
                        queue.append(line);
                    }
                    Err(err) => {
                        error!(%err, "can't process stdin");
                        break;
                    }
                }
            }
        }
    })
}
