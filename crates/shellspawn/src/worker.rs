//! Per-stream worker threads.
//!
//! An output worker reads its pipe in fixed-size chunks until end-of-stream
//! and feeds a sink. The input worker writes lines, a whole string, or
//! callback replies to the child's stdin and closes it when done. Errors are
//! recorded in the [`WorkerReport`] rather than raised, so the caller can
//! wait for the child and every other worker first.

use crate::accumulate::{ChunkDecoder, LineAccumulator, TextAccumulator};
use crate::error::{Result, SpawnError};
use crate::rendezvous::RendezvousClient;
use crate::request::{Captured, InputReply, StreamKind};
use std::io::{self, Read, Write};
use tracing::{debug, trace};

/// What one worker produced.
#[derive(Debug)]
pub(crate) struct WorkerReport {
    pub(crate) kind: StreamKind,
    pub(crate) captured: Captured,
    pub(crate) error: Option<SpawnError>,
}

impl WorkerReport {
    fn finished(kind: StreamKind, outcome: Result<Captured>) -> Self {
        match outcome {
            Ok(captured) => Self {
                kind,
                captured,
                error: None,
            },
            Err(error) => {
                debug!(stream = %kind, error = %error, "worker recorded an error");
                Self {
                    kind,
                    captured: Captured::None,
                    error: Some(error),
                }
            }
        }
    }
}

/// Any worker, as handed to a thread.
pub(crate) enum Job {
    Input(InputJob),
    #[cfg(unix)]
    Terminal(TerminalJob),
    Output(OutputJob),
}

impl Job {
    pub(crate) fn kind(&self) -> StreamKind {
        match self {
            Self::Output(job) => job.kind,
            _ => StreamKind::Stdin,
        }
    }

    pub(crate) fn thread_name(&self) -> &'static str {
        match self.kind() {
            StreamKind::Stdin => "shellspawn-stdin",
            StreamKind::Stdout => "shellspawn-stdout",
            StreamKind::Stderr => "shellspawn-stderr",
        }
    }

    pub(crate) fn run(self) -> WorkerReport {
        match self {
            Self::Input(job) => job.run(),
            #[cfg(unix)]
            Self::Terminal(job) => job.run(),
            Self::Output(job) => job.run(),
        }
    }
}

/// How an output worker disposes of what it reads.
#[derive(Debug)]
pub(crate) enum OutputMode {
    Discard,
    Lines,
    Text,
    Callback(RendezvousClient),
}

/// Pumps one of the child's output pipes.
pub(crate) struct OutputJob {
    pub(crate) kind: StreamKind,
    pub(crate) reader: Box<dyn Read + Send>,
    pub(crate) mode: OutputMode,
    pub(crate) chunk_size: usize,
}

impl OutputJob {
    pub(crate) fn run(self) -> WorkerReport {
        let kind = self.kind;
        WorkerReport::finished(kind, self.pump())
    }

    fn pump(self) -> Result<Captured> {
        let Self {
            kind,
            mut reader,
            mode,
            chunk_size,
        } = self;
        let step = match kind {
            StreamKind::Stderr => "read(stderr)",
            _ => "read(stdout)",
        };
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut sink = Sink::new(mode);
        let mut total = 0usize;

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    trace!(stream = %kind, bytes = n, "chunk");
                    sink.push(kind, &buf[..n])?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // a pipe whose writer vanished reads as end-of-stream
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
                Err(e) => return Err(SpawnError::os(step, &e)),
            }
        }

        debug!(stream = %kind, bytes = total, "output stream ended");
        sink.finish(kind)
    }
}

enum Sink {
    Discard,
    Lines(LineAccumulator),
    Text(TextAccumulator),
    Callback {
        client: RendezvousClient,
        decoder: ChunkDecoder,
    },
}

impl Sink {
    fn new(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Discard => Self::Discard,
            OutputMode::Lines => Self::Lines(LineAccumulator::new()),
            OutputMode::Text => Self::Text(TextAccumulator::new()),
            OutputMode::Callback(client) => Self::Callback {
                client,
                decoder: ChunkDecoder::new(),
            },
        }
    }

    fn push(&mut self, kind: StreamKind, chunk: &[u8]) -> Result<()> {
        match self {
            Self::Discard => {}
            Self::Lines(acc) => {
                acc.push(chunk);
            }
            Self::Text(acc) => acc.push(chunk),
            Self::Callback { client, decoder } => {
                let text = decoder.decode(chunk);
                if !text.is_empty() {
                    client.deliver_output(kind, text)?;
                }
            }
        }
        Ok(())
    }

    fn finish(self, kind: StreamKind) -> Result<Captured> {
        Ok(match self {
            Self::Discard => Captured::None,
            Self::Lines(acc) => Captured::Lines(acc.finish()),
            Self::Text(acc) => Captured::Text(acc.finish()),
            Self::Callback {
                client,
                mut decoder,
            } => {
                if let Some(rest) = decoder.finish() {
                    client.deliver_output(kind, rest)?;
                }
                Captured::None
            }
        })
    }
}

/// What the stdin worker writes.
#[derive(Debug)]
pub(crate) enum InputFeed {
    Lines(Vec<String>),
    Text(String),
    Callback(RendezvousClient),
}

/// Feeds the child's stdin through a plain pipe.
pub(crate) struct InputJob {
    pub(crate) writer: Box<dyn Write + Send>,
    pub(crate) feed: InputFeed,
}

impl InputJob {
    pub(crate) fn run(self) -> WorkerReport {
        block_sigpipe();
        let outcome = self.pump().map(|()| Captured::None);
        WorkerReport::finished(StreamKind::Stdin, outcome)
    }

    fn pump(self) -> Result<()> {
        let Self { mut writer, feed } = self;
        let written = match feed {
            InputFeed::Lines(lines) => {
                let mut written = Written::Open;
                for line in &lines {
                    written = write_input(&mut writer, line.as_bytes())?;
                    if written == Written::Gone {
                        break;
                    }
                    written = write_input(&mut writer, b"\n")?;
                    if written == Written::Gone {
                        break;
                    }
                }
                written
            }
            InputFeed::Text(text) => write_input(&mut writer, text.as_bytes())?,
            InputFeed::Callback(client) => loop {
                match client.request_input()? {
                    InputReply::Line(text) => {
                        if write_input(&mut writer, text.as_bytes())? == Written::Gone {
                            break Written::Gone;
                        }
                    }
                    InputReply::Close => break Written::Open,
                }
            },
        };
        if written == Written::Gone {
            debug!("child closed stdin before all input was written");
        }
        // dropping the writer closes the pipe; the child sees end-of-input
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Written {
    Open,
    /// The child closed its end; nothing more can be written.
    Gone,
}

fn write_input(writer: &mut dyn Write, bytes: &[u8]) -> Result<Written> {
    match writer.write_all(bytes).and_then(|()| writer.flush()) {
        Ok(()) => Ok(Written::Open),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(Written::Gone),
        Err(e) => Err(SpawnError::os("write(stdin)", &e)),
    }
}

/// Keeps a child that stops reading early from killing this process: the
/// write fails with `EPIPE` instead.
#[cfg(unix)]
fn block_sigpipe() {
    use nix::sys::signal::{SigSet, Signal};

    let mut set = SigSet::empty();
    set.add(Signal::SIGPIPE);
    if let Err(errno) = set.thread_block() {
        debug!(error = %errno, "could not block SIGPIPE in stdin worker");
    }
}

#[cfg(not(unix))]
fn block_sigpipe() {}

#[cfg(unix)]
pub(crate) use self::terminal::TerminalJob;

#[cfg(unix)]
mod terminal {
    use super::{WorkerReport, Written, block_sigpipe, write_input};
    use crate::error::{Result, SpawnError};
    use crate::proxy::protocol::{self, ProxyMessage, Reply};
    use crate::rendezvous::RendezvousClient;
    use crate::request::{Captured, InputReply, StreamKind};
    use std::io::{Read, Write};
    use tracing::{debug, trace};

    /// Feeds a child that reads from a pseudo-terminal run by the proxy.
    ///
    /// Input is only ever written after the proxy reported that the child
    /// is waiting for it.
    pub(crate) struct TerminalJob {
        pub(crate) terminal: Box<dyn Write + Send>,
        pub(crate) to_proxy: Box<dyn Write + Send>,
        pub(crate) from_proxy: Box<dyn Read + Send>,
        pub(crate) client: RendezvousClient,
    }

    impl TerminalJob {
        pub(crate) fn run(self) -> WorkerReport {
            block_sigpipe();
            let outcome = self.pump().map(|()| Captured::None);
            WorkerReport::finished(StreamKind::Stdin, outcome)
        }

        fn pump(self) -> Result<()> {
            let Self {
                terminal,
                mut to_proxy,
                mut from_proxy,
                client,
            } = self;
            let mut terminal = Some(terminal);
            let mut exchanges = 0usize;

            loop {
                let message = protocol::read_message(&mut from_proxy)
                    .map_err(|e| SpawnError::os("read(proxy)", &e))?;
                match message {
                    // the proxy exited along with the child
                    None => break,
                    Some(ProxyMessage::Fault) => {
                        return Err(SpawnError::internal(
                            "proxy",
                            "terminal proxy failed to switch the child's job state",
                        ));
                    }
                    Some(ProxyMessage::InputRequested) => {
                        exchanges += 1;
                        let reply = match terminal.as_mut() {
                            Some(tty) => deliver(&client, &mut **tty)?,
                            // already closed, every further request is answered the same
                            None => Reply::Closed,
                        };
                        if reply == Reply::Closed {
                            terminal = None;
                        }
                        trace!(exchanges, reply = ?reply, "answered proxy");
                        if protocol::send_reply(&mut to_proxy, reply).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(exchanges, "terminal input finished");
            Ok(())
        }
    }

    fn deliver(client: &RendezvousClient, tty: &mut dyn Write) -> Result<Reply> {
        match client.request_input()? {
            InputReply::Line(text) => match write_input(tty, text.as_bytes())? {
                Written::Open => Ok(Reply::Delivered),
                Written::Gone => Ok(Reply::Closed),
            },
            InputReply::Close => Ok(Reply::Closed),
        }
    }
}
