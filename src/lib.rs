#![forbid(unsafe_code)]

//! Run named tasks against local and remote hosts through a shell or an
//! external transport binary, multiplexing each command's output back to the
//! operator and forwarding operator keystrokes to it.

pub mod config;
pub mod console;
pub mod env;
pub mod errors;
pub mod operations;
pub mod prompt;
pub mod scheduler;
pub mod session;
pub mod shaper;
pub mod stdin_queue;
pub mod tasks;

pub use config::CommonConfig;
pub use env::Env;
pub use errors::{AppError, Result};
