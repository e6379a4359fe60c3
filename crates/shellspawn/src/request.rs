//! Request and result types: where each standard stream of the child goes.

use std::fmt;
use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::fd::{AsFd, OwnedFd};
#[cfg(windows)]
use std::os::windows::io::{AsHandle, OwnedHandle};

/// Platform handle for one end of a child stream.
#[cfg(unix)]
pub(crate) type OwnedStream = OwnedFd;
#[cfg(windows)]
pub(crate) type OwnedStream = OwnedHandle;

/// Callback that supplies the child's input, one reply per request.
pub type InputCallback<'a, C> = Box<dyn FnMut(&mut C) -> InputReply + 'a>;

/// Callback that receives a chunk of the child's output.
pub type OutputCallback<'a, C> = Box<dyn FnMut(&mut C, &str) + 'a>;

/// One of the child's three standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an input callback hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputReply {
    /// Text to write to the child, verbatim. Include the line terminator.
    Line(String),
    /// No more input: the child's stdin is closed.
    Close,
}

/// Where the child's stdin comes from.
pub enum InputSource<'a, C> {
    /// Nothing; the child sees end-of-input immediately.
    None,
    /// Each line is written followed by a line-feed.
    Lines(Vec<String>),
    /// Written whole.
    Text(String),
    /// Asked for one reply at a time, on the invoking thread.
    ///
    /// On unix the child gets a pseudo-terminal as its stdin, so programs
    /// that insist on reading from a terminal work.
    Callback(InputCallback<'a, C>),
    /// An open file or terminal the caller already holds.
    Stream(ExistingStream),
}

impl<'a, C> InputSource<'a, C> {
    /// Wraps a closure as an input callback.
    pub fn callback(f: impl FnMut(&mut C) -> InputReply + 'a) -> Self {
        Self::Callback(Box::new(f))
    }

    /// Collects lines from any iterator of strings.
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Lines(lines.into_iter().map(Into::into).collect())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }

    pub(crate) fn mode_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lines(_) => "lines",
            Self::Text(_) => "text",
            Self::Callback(_) => "callback",
            Self::Stream(_) => "stream",
        }
    }
}

impl<C> Default for InputSource<'_, C> {
    fn default() -> Self {
        Self::None
    }
}

impl<C> fmt::Debug for InputSource<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Lines(lines) => f.debug_tuple("Lines").field(lines).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
            Self::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

/// Where the child's stdout or stderr goes.
pub enum OutputSink<'a, C> {
    /// Read and dropped.
    Discard,
    /// Captured as one entry per line.
    Lines,
    /// Captured as a single string.
    Text,
    /// Each chunk is passed to the callback on the invoking thread.
    Callback(OutputCallback<'a, C>),
    /// An open file or terminal the caller already holds.
    Stream(ExistingStream),
}

impl<'a, C> OutputSink<'a, C> {
    /// Wraps a closure as an output callback.
    pub fn callback(f: impl FnMut(&mut C, &str) + 'a) -> Self {
        Self::Callback(Box::new(f))
    }

    pub fn is_discard(&self) -> bool {
        matches!(self, Self::Discard)
    }

    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }

    pub(crate) fn mode_name(&self) -> &'static str {
        match self {
            Self::Discard => "discard",
            Self::Lines => "lines",
            Self::Text => "text",
            Self::Callback(_) => "callback",
            Self::Stream(_) => "stream",
        }
    }
}

impl<C> Default for OutputSink<'_, C> {
    fn default() -> Self {
        Self::Discard
    }
}

impl<C> fmt::Debug for OutputSink<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discard => f.write_str("Discard"),
            Self::Lines => f.write_str("Lines"),
            Self::Text => f.write_str("Text"),
            Self::Callback(_) => f.write_str("Callback(..)"),
            Self::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

/// A caller-held open file or terminal handed to the child.
///
/// Holds a duplicate of the caller's handle: the caller's own handle is never
/// closed, and the duplicate is released once the child has been launched.
#[derive(Debug)]
pub struct ExistingStream {
    handle: OwnedStream,
}

impl ExistingStream {
    pub fn from_file(file: &File) -> io::Result<Self> {
        let handle = file.try_clone()?;
        Ok(Self {
            handle: handle.into(),
        })
    }

    #[cfg(unix)]
    pub fn from_fd(fd: impl AsFd) -> io::Result<Self> {
        Ok(Self {
            handle: fd.as_fd().try_clone_to_owned()?,
        })
    }

    #[cfg(windows)]
    pub fn from_handle(handle: impl AsHandle) -> io::Result<Self> {
        Ok(Self {
            handle: handle.as_handle().try_clone_to_owned()?,
        })
    }

    /// This process's standard input.
    pub fn stdin() -> io::Result<Self> {
        Self::from_std(&io::stdin())
    }

    /// This process's standard output.
    pub fn stdout() -> io::Result<Self> {
        Self::from_std(&io::stdout())
    }

    /// This process's standard error.
    pub fn stderr() -> io::Result<Self> {
        Self::from_std(&io::stderr())
    }

    #[cfg(unix)]
    fn from_std(stream: &impl AsFd) -> io::Result<Self> {
        Self::from_fd(stream)
    }

    #[cfg(windows)]
    fn from_std(stream: &impl AsHandle) -> io::Result<Self> {
        Self::from_handle(stream)
    }

    pub(crate) fn into_owned(self) -> OwnedStream {
        self.handle
    }
}

/// Captured data for one output stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Captured {
    /// The stream was discarded, passed to a callback or to an existing stream.
    #[default]
    None,
    Lines(Vec<String>),
    Text(String),
}

impl Captured {
    pub fn lines(&self) -> Option<&[String]> {
        match self {
            Self::Lines(lines) => Some(lines),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_lines(self) -> Option<Vec<String>> {
        match self {
            Self::Lines(lines) => Some(lines),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Result of a successful spawn call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOutput {
    /// The child's exit code; `128 + signal` when it was killed by a signal.
    pub exit_code: i32,
    pub stdout: Captured,
    pub stderr: Captured,
}

impl SpawnOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_select_nothing() {
        let input: InputSource<'_, ()> = InputSource::default();
        let output: OutputSink<'_, ()> = OutputSink::default();
        assert!(input.is_none());
        assert!(output.is_discard());
    }

    #[test]
    fn test_lines_helper_converts_items() {
        let source: InputSource<'_, ()> = InputSource::lines(["a", "b"]);
        match source {
            InputSource::Lines(lines) => assert_eq!(lines, vec!["a", "b"]),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_callbacks_debug_without_contents() {
        let source: InputSource<'_, u32> = InputSource::callback(|_| InputReply::Close);
        let sink: OutputSink<'_, u32> = OutputSink::callback(|count, _| *count += 1);
        assert_eq!(format!("{source:?}"), "Callback(..)");
        assert_eq!(format!("{sink:?}"), "Callback(..)");
        assert_eq!(source.mode_name(), "callback");
        assert!(sink.is_callback());
    }

    #[test]
    fn test_captured_accessors() {
        let lines = Captured::Lines(vec!["x".into()]);
        assert_eq!(lines.lines(), Some(&["x".to_string()][..]));
        assert_eq!(lines.text(), None);
        assert_eq!(Captured::Text("t".into()).into_text().as_deref(), Some("t"));
        assert_eq!(Captured::None.into_lines(), None);
    }

    #[test]
    fn test_stream_kind_names() {
        assert_eq!(StreamKind::Stdin.to_string(), "stdin");
        assert_eq!(StreamKind::Stderr.as_str(), "stderr");
    }

    #[test]
    fn test_existing_stream_duplicates_the_file() {
        let file = tempfile::tempfile().expect("temp file");
        let stream = ExistingStream::from_file(&file).expect("duplicate");
        drop(stream);
        // the caller's handle is still usable
        file.metadata().expect("file still open");
    }
}
