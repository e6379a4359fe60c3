//! # shellspawn
//!
//! Spawn a child process from a command string and route each of its
//! standard streams independently:
//! - stdin from nothing, a list of lines, a string, a callback or an open file
//! - stdout and stderr to nowhere, a list of lines, a string, a callback or an
//!   open file
//!
//! The call blocks until the child has exited and every stream is drained,
//! then returns the exit code together with whatever was captured.
//!
//! ## Callbacks
//!
//! Streams are pumped by worker threads, but every callback runs on the
//! thread that made the call, one at a time, and receives the caller's
//! context by `&mut`. Callbacks need not be `Send` or re-entrant.
//!
//! ## Interactive children
//!
//! On unix a callback-driven stdin is a pseudo-terminal managed by a small
//! forked proxy. The proxy keeps the child in the background and asks the
//! caller for a line each time the child tries to read from its terminal, so
//! prompts that insist on a tty work.

mod accumulate;
pub mod command;
pub mod config;
pub mod error;
mod plumbing;
mod process;
#[cfg(unix)]
mod proxy;
mod rendezvous;
pub mod request;
mod session;
pub mod spawn;
mod worker;

pub use command::{ParsedCommand, parse_command, resolve_executable};
pub use config::{DEFAULT_CHUNK_SIZE, SpawnConfig};
pub use error::{Result, SpawnError, SpawnStatus};
pub use request::{
    Captured, ExistingStream, InputCallback, InputReply, InputSource, OutputCallback, OutputSink,
    SpawnOutput, StreamKind,
};
pub use spawn::{Spawn, spawn};
