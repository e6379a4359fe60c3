//! Terminal proxy for children whose stdin is driven by a callback.
//!
//! The proxy is a second forked process. It becomes a session leader, takes
//! the slave side of a pseudo-terminal as its controlling terminal, and runs
//! the real child in a separate process group of that session. The child is
//! kept in the background and moved to the foreground only around input
//! exchanges, which the proxy negotiates with the caller's stdin worker over
//! two pipes.

pub(crate) mod machine;
pub(crate) mod protocol;
mod terminal;

pub(crate) use terminal::{Pty, launch, open_pty};
