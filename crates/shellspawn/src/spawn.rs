//! Public entry points.

use crate::config::SpawnConfig;
use crate::error::{Result, SpawnError};
use crate::request::{ExistingStream, InputReply, InputSource, OutputSink, SpawnOutput};
use crate::session::Session;
use tracing::debug;

/// Runs `command` with the given stream routes and waits for it.
///
/// Callbacks run on the calling thread, one at a time, and receive `context`.
/// Uses [`SpawnConfig::default`]; see [`Spawn`] for other settings.
///
/// ```no_run
/// use shellspawn::{InputSource, OutputSink, spawn};
///
/// let output = spawn(
///     "sort",
///     InputSource::lines(["b", "a"]),
///     OutputSink::Lines,
///     OutputSink::Discard,
///     &mut (),
/// )?;
/// assert_eq!(output.stdout.lines(), Some(&["a".to_string(), "b".to_string()][..]));
/// # Ok::<(), shellspawn::SpawnError>(())
/// ```
pub fn spawn<'a, C>(
    command: &str,
    stdin: InputSource<'a, C>,
    stdout: OutputSink<'a, C>,
    stderr: OutputSink<'a, C>,
    context: &mut C,
) -> Result<SpawnOutput> {
    let config = SpawnConfig::default();
    Session::new(&config).run(command, stdin, stdout, stderr, context)
}

/// Builder for a spawn call.
///
/// Each direction takes at most one route. Choosing a second one for the same
/// direction is recorded and reported by [`Spawn::run`] before anything is
/// created.
pub struct Spawn<'a, C> {
    command: String,
    stdin: InputSource<'a, C>,
    stdout: OutputSink<'a, C>,
    stderr: OutputSink<'a, C>,
    stdin_set: bool,
    stdout_set: bool,
    stderr_set: bool,
    conflicts: Conflicts,
    config: SpawnConfig,
}

#[derive(Debug, Default, Clone, Copy)]
struct Conflicts {
    stdin: bool,
    stdout: bool,
    stderr: bool,
}

impl<'a, C> Spawn<'a, C> {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: InputSource::None,
            stdout: OutputSink::Discard,
            stderr: OutputSink::Discard,
            stdin_set: false,
            stdout_set: false,
            stderr_set: false,
            conflicts: Conflicts::default(),
            config: SpawnConfig::default(),
        }
    }

    /// Routes stdin. `InputSource::None` clears nothing and counts as no choice.
    pub fn stdin(mut self, source: InputSource<'a, C>) -> Self {
        if source.is_none() {
            return self;
        }
        if self.stdin_set {
            self.conflicts.stdin = true;
        }
        self.stdin_set = true;
        self.stdin = source;
        self
    }

    /// Routes stdout. `OutputSink::Discard` counts as no choice.
    pub fn stdout(mut self, sink: OutputSink<'a, C>) -> Self {
        if sink.is_discard() {
            return self;
        }
        if self.stdout_set {
            self.conflicts.stdout = true;
        }
        self.stdout_set = true;
        self.stdout = sink;
        self
    }

    /// Routes stderr. `OutputSink::Discard` counts as no choice.
    pub fn stderr(mut self, sink: OutputSink<'a, C>) -> Self {
        if sink.is_discard() {
            return self;
        }
        if self.stderr_set {
            self.conflicts.stderr = true;
        }
        self.stderr_set = true;
        self.stderr = sink;
        self
    }

    pub fn stdin_lines<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stdin(InputSource::lines(lines))
    }

    pub fn stdin_text(self, text: impl Into<String>) -> Self {
        self.stdin(InputSource::Text(text.into()))
    }

    pub fn stdin_callback(self, f: impl FnMut(&mut C) -> InputReply + 'a) -> Self {
        self.stdin(InputSource::callback(f))
    }

    pub fn stdin_stream(self, stream: ExistingStream) -> Self {
        self.stdin(InputSource::Stream(stream))
    }

    pub fn stdout_lines(self) -> Self {
        self.stdout(OutputSink::Lines)
    }

    pub fn stdout_text(self) -> Self {
        self.stdout(OutputSink::Text)
    }

    pub fn stdout_callback(self, f: impl FnMut(&mut C, &str) + 'a) -> Self {
        self.stdout(OutputSink::callback(f))
    }

    pub fn stdout_stream(self, stream: ExistingStream) -> Self {
        self.stdout(OutputSink::Stream(stream))
    }

    pub fn stderr_lines(self) -> Self {
        self.stderr(OutputSink::Lines)
    }

    pub fn stderr_text(self) -> Self {
        self.stderr(OutputSink::Text)
    }

    pub fn stderr_callback(self, f: impl FnMut(&mut C, &str) + 'a) -> Self {
        self.stderr(OutputSink::callback(f))
    }

    pub fn stderr_stream(self, stream: ExistingStream) -> Self {
        self.stderr(OutputSink::Stream(stream))
    }

    pub fn config(mut self, config: SpawnConfig) -> Self {
        self.config = config;
        self
    }

    /// Reports the first routing conflict, stdin before stdout before stderr.
    pub fn validate(&self) -> Result<()> {
        if self.conflicts.stdin {
            return Err(SpawnError::TooManyInputs);
        }
        if self.conflicts.stdout {
            return Err(SpawnError::TooManyOutputs);
        }
        if self.conflicts.stderr {
            return Err(SpawnError::TooManyErrors);
        }
        Ok(())
    }

    /// Runs the child and waits for it and for every stream to finish.
    ///
    /// # Panics
    ///
    /// Callbacks are served with blocking receives, so this must not be called
    /// from inside an async runtime; use [`Spawn::run_async`] there. A panic
    /// raised by a callback is propagated after the child has been killed.
    pub fn run(self, context: &mut C) -> Result<SpawnOutput> {
        if let Err(error) = self.validate() {
            debug!(command = %self.command, error = %error, "rejected spawn request");
            return Err(error);
        }
        Session::new(&self.config).run(&self.command, self.stdin, self.stdout, self.stderr, context)
    }
}

impl<C: Send + 'static> Spawn<'static, C> {
    /// Builds and runs a request on tokio's blocking pool.
    ///
    /// Callbacks are not `Send`, so the request is built by `build` on the
    /// blocking thread. Callbacks then run on that thread, one at a time. The
    /// context is handed back with the output.
    pub async fn run_async<F>(build: F, context: C) -> Result<(SpawnOutput, C)>
    where
        F: FnOnce() -> Spawn<'static, C> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(move || {
            let mut context = context;
            build().run(&mut context).map(|output| (output, context))
        });
        match task.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Err(join) => Err(SpawnError::internal("spawn_blocking", join.to_string())),
        }
    }
}

impl<C> std::fmt::Debug for Spawn<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawn")
            .field("command", &self.command)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
