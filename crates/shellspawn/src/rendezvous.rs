//! Running caller callbacks on the invoking thread.
//!
//! Worker threads never call a caller callback themselves. They send a
//! [`Request`] to the invoking thread and block until it has been handled.
//! A lock shared by every worker of one call is held across the whole
//! request/reply exchange, so at most one callback request is in flight and
//! each request is answered before its worker continues.
//!
//! A [`Request::Finished`] message, sent once the child and every worker are
//! done, ends the invoking thread's wait loop.

use crate::error::{Result, SpawnError};
use crate::request::{InputCallback, InputReply, OutputCallback, StreamKind};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// A message from a worker (or the completion waiter) to the invoking thread.
#[derive(Debug)]
pub(crate) enum Request {
    /// The stdin worker needs the next reply from the input callback.
    Input { reply: oneshot::Sender<InputReply> },
    /// An output worker read a chunk for a callback sink.
    Output {
        kind: StreamKind,
        chunk: String,
        handled: oneshot::Sender<()>,
    },
    /// The child exited and every worker finished.
    Finished,
}

/// Worker-side handle. Cheap to clone, one per worker.
#[derive(Debug, Clone)]
pub(crate) struct RendezvousClient {
    in_flight: Arc<Mutex<()>>,
    requests: mpsc::UnboundedSender<Request>,
}

/// Invoking-thread side.
#[derive(Debug)]
pub(crate) struct RendezvousServer {
    requests: mpsc::UnboundedReceiver<Request>,
}

/// Creates a connected client/server pair for one call.
pub(crate) fn rendezvous() -> (RendezvousClient, RendezvousServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RendezvousClient {
            in_flight: Arc::new(Mutex::new(())),
            requests: tx,
        },
        RendezvousServer { requests: rx },
    )
}

impl RendezvousClient {
    /// Asks the invoking thread to run the input callback and waits for its reply.
    pub(crate) fn request_input(&self) -> Result<InputReply> {
        let _turn = self
            .in_flight
            .lock()
            .map_err(|_| SpawnError::internal("rendezvous(lock)", "callback lock poisoned"))?;
        let (reply, answer) = oneshot::channel();
        self.send(Request::Input { reply })?;
        answer.blocking_recv().map_err(|_| {
            SpawnError::internal("rendezvous(input)", "input request was dropped unanswered")
        })
    }

    /// Hands a chunk to the invoking thread and waits until its callback returned.
    pub(crate) fn deliver_output(&self, kind: StreamKind, chunk: String) -> Result<()> {
        let _turn = self
            .in_flight
            .lock()
            .map_err(|_| SpawnError::internal("rendezvous(lock)", "callback lock poisoned"))?;
        let (handled, done) = oneshot::channel();
        self.send(Request::Output {
            kind,
            chunk,
            handled,
        })?;
        done.blocking_recv().map_err(|_| {
            SpawnError::internal("rendezvous(output)", "output chunk was dropped unhandled")
        })
    }

    /// Ends the invoking thread's wait loop.
    ///
    /// Does not take the in-flight lock: by the time this is sent no worker
    /// is left to hold it.
    pub(crate) fn finish(&self) {
        // the server is gone only if the call is already unwinding
        let _ = self.requests.send(Request::Finished);
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests.send(request).map_err(|_| {
            SpawnError::internal("rendezvous(request)", "invoking thread stopped serving callbacks")
        })
    }
}

/// The caller's callbacks, only ever touched on the invoking thread.
pub(crate) struct Callbacks<'a, C> {
    pub(crate) input: Option<InputCallback<'a, C>>,
    pub(crate) stdout: Option<OutputCallback<'a, C>>,
    pub(crate) stderr: Option<OutputCallback<'a, C>>,
}

impl<C> Callbacks<'_, C> {
    pub(crate) fn is_empty(&self) -> bool {
        self.input.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

impl RendezvousServer {
    /// Serves callback requests until [`Request::Finished`] arrives.
    ///
    /// Returns an error when every client disconnected without finishing or a
    /// request names a stream that has no callback.
    pub(crate) fn serve<C>(mut self, context: &mut C, callbacks: &mut Callbacks<'_, C>) -> Result<()> {
        let mut served = 0usize;
        while let Some(request) = self.requests.blocking_recv() {
            match request {
                Request::Input { reply } => {
                    let callback = callbacks.input.as_mut().ok_or_else(|| {
                        SpawnError::internal("rendezvous(dispatch)", "input requested without a callback")
                    })?;
                    let answer = callback(context);
                    trace!(closes = matches!(answer, InputReply::Close), "input callback returned");
                    // a dropped receiver means the worker is already gone
                    let _ = reply.send(answer);
                }
                Request::Output {
                    kind,
                    chunk,
                    handled,
                } => {
                    let callback = match kind {
                        StreamKind::Stdout => callbacks.stdout.as_mut(),
                        StreamKind::Stderr => callbacks.stderr.as_mut(),
                        StreamKind::Stdin => None,
                    }
                    .ok_or_else(|| {
                        SpawnError::internal("rendezvous(dispatch)", "output chunk without a callback")
                    })?;
                    trace!(stream = %kind, bytes = chunk.len(), "output callback");
                    callback(context, &chunk);
                    let _ = handled.send(());
                }
                Request::Finished => {
                    trace!(served, "rendezvous finished");
                    return Ok(());
                }
            }
            served += 1;
        }
        Err(SpawnError::internal(
            "rendezvous(wait)",
            "workers disconnected before completion was signalled",
        ))
    }
}
