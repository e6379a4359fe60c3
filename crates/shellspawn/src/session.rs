//! One spawn call from command resolution to the collected result.
//!
//! The session resolves the command, creates the stream endpoints, launches
//! the child (directly, or under the terminal proxy when stdin is a
//! callback), starts one worker thread per pumped stream and then either
//! serves callbacks on the invoking thread or simply waits. Every resource is
//! owned by a value that releases it on drop; a scope guard kills the child
//! if the call unwinds or fails before the child was reaped.

use crate::command::{ParsedCommand, parse_command, resolve_executable};
use crate::config::SpawnConfig;
use crate::error::{Result, SpawnError};
use crate::plumbing::{InputEnds, OutputEnds, StdinRoute, plumb_input, plumb_output};
use crate::process::{Launched, launch_direct};
use crate::rendezvous::{Callbacks, RendezvousClient, rendezvous};
use crate::request::{
    Captured, ExistingStream, InputCallback, InputSource, OutputCallback, OutputSink, OwnedStream,
    SpawnOutput, StreamKind,
};
use crate::worker::{InputFeed, InputJob, Job, OutputJob, OutputMode, WorkerReport};
use std::path::Path;
use std::thread::{self, Scope, ScopedJoinHandle};
use tracing::{debug, warn};

pub(crate) struct Session<'c> {
    config: &'c SpawnConfig,
}

/// Payload for the stdin worker, before the rendezvous exists.
enum StdinPayload {
    Lines(Vec<String>),
    Text(String),
    Callback,
}

/// What an output worker should do, before the rendezvous exists.
enum OutputPlan {
    Discard,
    Lines,
    Text,
    Callback,
}

impl<'c> Session<'c> {
    pub(crate) fn new(config: &'c SpawnConfig) -> Self {
        Self { config }
    }

    pub(crate) fn run<'a, C>(
        &self,
        command: &str,
        stdin: InputSource<'a, C>,
        stdout: OutputSink<'a, C>,
        stderr: OutputSink<'a, C>,
        context: &mut C,
    ) -> Result<SpawnOutput> {
        let not_found = || SpawnError::CommandNotFound {
            command: command.to_string(),
        };
        let parsed = parse_command(command).ok_or_else(not_found)?;
        let program = resolve_executable(&parsed.program, self.config.search_path.as_deref())
            .ok_or_else(not_found)?;
        debug!(
            command,
            program = %program.display(),
            stdin = stdin.mode_name(),
            stdout = stdout.mode_name(),
            stderr = stderr.mode_name(),
            "spawning"
        );

        let (stdin_route, stdin_payload, input_callback) = split_input(stdin);
        let (stdout_stream, stdout_plan, stdout_callback) = split_output(stdout);
        let (stderr_stream, stderr_plan, stderr_callback) = split_output(stderr);
        let mut callbacks = Callbacks {
            input: input_callback,
            stdout: stdout_callback,
            stderr: stderr_callback,
        };

        let stdin_ends = plumb_input(stdin_route)?;
        let OutputEnds {
            child: stdout_child,
            parent: stdout_reader,
        } = plumb_output(StreamKind::Stdout, stdout_stream)?;
        let OutputEnds {
            child: stderr_child,
            parent: stderr_reader,
        } = plumb_output(StreamKind::Stderr, stderr_stream)?;

        let (client, server) = rendezvous();
        let (launched, stdin_job) = self.launch(
            &program,
            &parsed,
            stdin_ends,
            stdout_child,
            stderr_child,
            stdin_payload,
            &client,
        )?;

        let chunk_size = self.config.effective_chunk_size();
        let mut jobs: Vec<Job> = stdin_job.into_iter().collect();
        for (kind, reader, plan) in [
            (StreamKind::Stdout, stdout_reader, stdout_plan),
            (StreamKind::Stderr, stderr_reader, stderr_plan),
        ] {
            if let Some(reader) = reader {
                jobs.push(Job::Output(OutputJob {
                    kind,
                    reader: Box::new(reader),
                    mode: plan.into_mode(&client),
                    chunk_size,
                }));
            }
        }

        let server = (!callbacks.is_empty()).then_some(server);
        let Launched { waiter, killer } = launched;

        let (status, reports) = thread::scope(|scope| -> Result<(Result<i32>, Vec<WorkerReport>)> {
            let _guard = scopeguard::guard(killer.clone(), |killer| killer.kill());

            let workers = match start_workers(scope, jobs) {
                Ok(workers) => workers,
                Err(error) => {
                    // started workers drain out once the child is gone
                    killer.kill();
                    let _ = waiter.wait(&killer);
                    return Err(error);
                }
            };

            match server {
                Some(server) => {
                    let finisher = client;
                    let wait_killer = killer.clone();
                    let waiting = thread::Builder::new()
                        .name("shellspawn-wait".into())
                        .spawn_scoped(scope, move || {
                            let status = waiter.wait(&wait_killer);
                            let reports = join_workers(workers);
                            finisher.finish();
                            (status, reports)
                        })
                        .map_err(|e| {
                            killer.kill();
                            SpawnError::os("thread(wait)", &e)
                        })?;

                    let served = server.serve(context, &mut callbacks);
                    if served.is_err() {
                        killer.kill();
                    }
                    let (status, reports) = waiting.join().map_err(|_| {
                        SpawnError::internal("thread(wait)", "completion waiter panicked")
                    })?;
                    served?;
                    Ok((status, reports))
                }
                None => {
                    drop(client);
                    let status = waiter.wait(&killer);
                    Ok((status, join_workers(workers)))
                }
            }
        })?;

        let exit_code = status?;
        let output = collect(exit_code, reports)?;
        debug!(exit_code, "spawn finished");
        Ok(output)
    }

    /// Launches the child and prepares the stdin worker that goes with it.
    fn launch(
        &self,
        program: &Path,
        parsed: &ParsedCommand,
        stdin_ends: InputEnds,
        stdout: OwnedStream,
        stderr: OwnedStream,
        payload: Option<StdinPayload>,
        client: &RendezvousClient,
    ) -> Result<(Launched, Option<Job>)> {
        match stdin_ends {
            #[cfg(unix)]
            InputEnds::Terminal(pty) => {
                let proxy = crate::proxy::launch(program, parsed, &pty, stdout, stderr, self.config)?;
                let launched = Launched::proxied(proxy.proxy, proxy.child);
                let job = crate::worker::TerminalJob {
                    terminal: Box::new(pty.master),
                    to_proxy: Box::new(proxy.to_proxy),
                    from_proxy: Box::new(proxy.from_proxy),
                    client: client.clone(),
                };
                Ok((launched, Some(Job::Terminal(job))))
            }
            InputEnds::Pipe { child, parent } => {
                let launched = launch_direct(program, parsed, child, stdout, stderr)?;
                let job = match (parent, payload) {
                    (Some(writer), Some(payload)) => Some(Job::Input(InputJob {
                        writer: Box::new(writer),
                        feed: payload.into_feed(client),
                    })),
                    _ => None,
                };
                Ok((launched, job))
            }
        }
    }
}

fn split_input<'a, C>(
    source: InputSource<'a, C>,
) -> (StdinRoute, Option<StdinPayload>, Option<InputCallback<'a, C>>) {
    match source {
        InputSource::None => (StdinRoute::Closed, None, None),
        InputSource::Lines(lines) => (StdinRoute::Fed, Some(StdinPayload::Lines(lines)), None),
        InputSource::Text(text) => (StdinRoute::Fed, Some(StdinPayload::Text(text)), None),
        InputSource::Callback(callback) => {
            #[cfg(unix)]
            let route = StdinRoute::Terminal;
            #[cfg(not(unix))]
            let route = StdinRoute::Fed;
            (route, Some(StdinPayload::Callback), Some(callback))
        }
        InputSource::Stream(stream) => (StdinRoute::Existing(stream), None, None),
    }
}

fn split_output<'a, C>(
    sink: OutputSink<'a, C>,
) -> (Option<ExistingStream>, OutputPlan, Option<OutputCallback<'a, C>>) {
    match sink {
        OutputSink::Discard => (None, OutputPlan::Discard, None),
        OutputSink::Lines => (None, OutputPlan::Lines, None),
        OutputSink::Text => (None, OutputPlan::Text, None),
        OutputSink::Callback(callback) => (None, OutputPlan::Callback, Some(callback)),
        OutputSink::Stream(stream) => (Some(stream), OutputPlan::Discard, None),
    }
}

impl StdinPayload {
    fn into_feed(self, client: &RendezvousClient) -> InputFeed {
        match self {
            Self::Lines(lines) => InputFeed::Lines(lines),
            Self::Text(text) => InputFeed::Text(text),
            Self::Callback => InputFeed::Callback(client.clone()),
        }
    }
}

impl OutputPlan {
    fn into_mode(self, client: &RendezvousClient) -> OutputMode {
        match self {
            Self::Discard => OutputMode::Discard,
            Self::Lines => OutputMode::Lines,
            Self::Text => OutputMode::Text,
            Self::Callback => OutputMode::Callback(client.clone()),
        }
    }
}

type Workers<'scope> = Vec<(StreamKind, ScopedJoinHandle<'scope, WorkerReport>)>;

fn start_workers<'scope>(scope: &'scope Scope<'scope, '_>, jobs: Vec<Job>) -> Result<Workers<'scope>> {
    let mut workers = Vec::with_capacity(jobs.len());
    for job in jobs {
        let kind = job.kind();
        let handle = thread::Builder::new()
            .name(job.thread_name().into())
            .spawn_scoped(scope, move || job.run())
            .map_err(|e| SpawnError::os("thread(worker)", &e))?;
        workers.push((kind, handle));
    }
    Ok(workers)
}

fn join_workers(workers: Workers<'_>) -> Vec<WorkerReport> {
    workers
        .into_iter()
        .map(|(kind, handle)| {
            handle.join().unwrap_or_else(|_| WorkerReport {
                kind,
                captured: Captured::None,
                error: Some(SpawnError::internal("thread(worker)", "worker thread panicked")),
            })
        })
        .collect()
}

/// Builds the result. Worker errors win over the exit code, the first one
/// in stdin, stdout, stderr order.
fn collect(exit_code: i32, reports: Vec<WorkerReport>) -> Result<SpawnOutput> {
    let mut output = SpawnOutput {
        exit_code,
        stdout: Captured::None,
        stderr: Captured::None,
    };
    let mut first_error = None;
    let mut reports = reports;
    reports.sort_by_key(|report| report.kind as u8);
    for report in reports {
        if let Some(error) = report.error {
            warn!(stream = %report.kind, error = %error, "worker failed");
            first_error.get_or_insert(error);
            continue;
        }
        match report.kind {
            StreamKind::Stdout => output.stdout = report.captured,
            StreamKind::Stderr => output.stderr = report.captured,
            StreamKind::Stdin => {}
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(output),
    }
}
