//! Creates the OS endpoints for each of the child's streams.
//!
//! For every stream the child gets one end. The caller keeps the other end
//! only when a worker has to pump it; an existing stream is handed straight
//! to the child and needs no worker.

use crate::error::{Result, SpawnError};
use crate::request::{ExistingStream, OwnedStream, StreamKind};
use std::io::{self, PipeReader, PipeWriter};
use tracing::trace;

/// How the child's stdin is provided.
#[derive(Debug)]
pub(crate) enum StdinRoute {
    /// A pipe whose write end is closed at once.
    Closed,
    /// A pipe fed by the stdin worker.
    Fed,
    /// A pseudo-terminal fed by the stdin worker through the proxy.
    #[cfg(unix)]
    Terminal,
    Existing(ExistingStream),
}

/// Endpoints for stdin.
pub(crate) enum InputEnds {
    Pipe {
        child: OwnedStream,
        parent: Option<PipeWriter>,
    },
    #[cfg(unix)]
    Terminal(crate::proxy::Pty),
}

/// Endpoints for stdout or stderr.
#[derive(Debug)]
pub(crate) struct OutputEnds {
    pub(crate) child: OwnedStream,
    /// Read end for the worker; `None` for an existing stream.
    pub(crate) parent: Option<PipeReader>,
}

pub(crate) fn plumb_input(route: StdinRoute) -> Result<InputEnds> {
    match route {
        StdinRoute::Existing(stream) => Ok(InputEnds::Pipe {
            child: stream.into_owned(),
            parent: None,
        }),
        #[cfg(unix)]
        StdinRoute::Terminal => crate::proxy::open_pty().map(InputEnds::Terminal),
        StdinRoute::Fed => {
            let (reader, writer) = new_pipe(StreamKind::Stdin)?;
            Ok(InputEnds::Pipe {
                child: reader.into(),
                parent: Some(writer),
            })
        }
        StdinRoute::Closed => {
            // the write end is dropped here, so the child sees end-of-input
            let (reader, _) = new_pipe(StreamKind::Stdin)?;
            Ok(InputEnds::Pipe {
                child: reader.into(),
                parent: None,
            })
        }
    }
}

pub(crate) fn plumb_output(kind: StreamKind, existing: Option<ExistingStream>) -> Result<OutputEnds> {
    if let Some(stream) = existing {
        return Ok(OutputEnds {
            child: stream.into_owned(),
            parent: None,
        });
    }
    let (reader, writer) = new_pipe(kind)?;
    Ok(OutputEnds {
        child: writer.into(),
        parent: Some(reader),
    })
}

fn new_pipe(kind: StreamKind) -> Result<(PipeReader, PipeWriter)> {
    let step = match kind {
        StreamKind::Stdin => "pipe(stdin)",
        StreamKind::Stdout => "pipe(stdout)",
        StreamKind::Stderr => "pipe(stderr)",
    };
    let pipe = io::pipe().map_err(|e| SpawnError::os(step, &e))?;
    trace!(stream = %kind, "created pipe");
    Ok(pipe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn test_output_pipe_carries_child_writes_to_parent() {
        let ends = plumb_output(StreamKind::Stdout, None).expect("pipe");
        let mut child = File::from(ends.child);
        child.write_all(b"hello").expect("write");
        drop(child);
        let mut parent = ends.parent.expect("parent end");
        let mut got = String::new();
        parent.read_to_string(&mut got).expect("read");
        assert_eq!(got, "hello");
    }

    #[test]
    fn test_existing_output_stream_needs_no_worker() {
        let file = tempfile::tempfile().expect("temp file");
        let stream = ExistingStream::from_file(&file).expect("dup");
        let ends = plumb_output(StreamKind::Stderr, Some(stream)).expect("plumb");
        assert!(ends.parent.is_none());
    }

    #[test]
    fn test_closed_stdin_reads_end_of_input() {
        let ends = plumb_input(StdinRoute::Closed).expect("pipe");
        let InputEnds::Pipe { child, parent } = ends else {
            panic!("expected a pipe");
        };
        assert!(parent.is_none());
        let mut child = File::from(child);
        let mut buf = Vec::new();
        assert_eq!(child.read_to_end(&mut buf).expect("read"), 0);
    }

    #[test]
    fn test_fed_stdin_keeps_writer() {
        let ends = plumb_input(StdinRoute::Fed).expect("pipe");
        let InputEnds::Pipe { child, parent } = ends else {
            panic!("expected a pipe");
        };
        let mut writer = parent.expect("writer kept");
        writer.write_all(b"line\n").expect("write");
        drop(writer);
        let mut got = String::new();
        File::from(child).read_to_string(&mut got).expect("read");
        assert_eq!(got, "line\n");
    }
}
