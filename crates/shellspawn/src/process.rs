//! Launching the child, collecting its exit code, and forced termination.

// Exit codes and PIDs are always within i32 range in practice
#![allow(clippy::cast_possible_wrap)]

use crate::command::ParsedCommand;
use crate::error::{Result, SpawnError};
use crate::request::OwnedStream;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{Signal, kill, killpg};
#[cfg(unix)]
use nix::unistd::Pid;

/// A launched child: one handle to wait on it, one to kill it from elsewhere.
#[derive(Debug)]
pub(crate) struct Launched {
    pub(crate) waiter: ChildWaiter,
    pub(crate) killer: ChildKiller,
}

impl Launched {
    /// A child started straight from the caller. It leads its own process
    /// group, so killing it also takes down anything it started that still
    /// holds one of its streams.
    fn direct(child: Child) -> Self {
        #[cfg(unix)]
        let killer = ChildKiller::new(vec![KillTarget::Group(Pid::from_raw(child.id() as i32))]);
        #[cfg(not(unix))]
        let killer = ChildKiller::new();
        Self {
            waiter: ChildWaiter::Direct(child),
            killer,
        }
    }

    /// A child running under the terminal proxy. Waiting on the proxy yields
    /// the child's exit code; killing takes down the child's process group
    /// and the proxy.
    #[cfg(unix)]
    pub(crate) fn proxied(proxy: Pid, child: Pid) -> Self {
        Self {
            waiter: ChildWaiter::Proxy(proxy),
            killer: ChildKiller::new(vec![KillTarget::Group(child), KillTarget::Process(proxy)]),
        }
    }
}

/// Starts the resolved program with the given stream ends.
///
/// The ends are released once the child has its own copies, so the caller
/// sees end-of-stream when the child exits.
pub(crate) fn launch_direct(
    program: &Path,
    parsed: &ParsedCommand,
    stdin: OwnedStream,
    stdout: OwnedStream,
    stderr: OwnedStream,
) -> Result<Launched> {
    let mut command = Command::new(program);
    command
        .args(&parsed.args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.arg0(parsed.arg0()).process_group(0);
    }

    let child = command.spawn().map_err(|e| SpawnError::os("spawn", &e))?;
    drop(command);
    debug!(pid = child.id(), program = %program.display(), "launched child");
    Ok(Launched::direct(child))
}

/// Waits for the child to finish.
#[derive(Debug)]
pub(crate) enum ChildWaiter {
    Direct(Child),
    #[cfg(unix)]
    Proxy(Pid),
}

impl ChildWaiter {
    /// Blocks until the child has exited and returns its exit code
    /// (`128 + signal` for a signalled child).
    pub(crate) fn wait(self, killer: &ChildKiller) -> Result<i32> {
        let code = match self {
            Self::Direct(child) => wait_direct(child, killer),
            #[cfg(unix)]
            Self::Proxy(proxy) => wait_proxy(proxy),
        };
        killer.mark_reaped();
        if let Ok(code) = code {
            debug!(exit_code = code, "child exited");
        }
        code
    }
}

#[cfg(unix)]
fn wait_direct(mut child: Child, _killer: &ChildKiller) -> Result<i32> {
    let status = child.wait().map_err(|e| SpawnError::os("wait", &e))?;
    Ok(exit_code(status))
}

#[cfg(not(unix))]
fn wait_direct(mut child: Child, killer: &ChildKiller) -> Result<i32> {
    use std::time::Duration;

    loop {
        if killer.kill_requested() {
            let _ = child.kill();
        }
        match child.try_wait() {
            Ok(Some(status)) => return Ok(exit_code(status)),
            Ok(None) => std::thread::sleep(Duration::from_millis(10)),
            Err(e) => return Err(SpawnError::os("wait", &e)),
        }
    }
}

#[cfg(unix)]
fn wait_proxy(proxy: Pid) -> Result<i32> {
    use nix::errno::Errno;
    use nix::sys::wait::{WaitStatus, waitpid};

    loop {
        match waitpid(proxy, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(errno) => return Err(SpawnError::errno("waitpid(proxy)", errno)),
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
enum KillTarget {
    Process(Pid),
    Group(Pid),
}

/// Kills the child from any thread, unless it was already reaped.
#[derive(Debug, Clone)]
pub(crate) struct ChildKiller {
    state: Arc<KillState>,
}

#[derive(Debug)]
struct KillState {
    reaped: AtomicBool,
    requested: AtomicBool,
    #[cfg(unix)]
    targets: Vec<KillTarget>,
}

impl ChildKiller {
    #[cfg(unix)]
    fn new(targets: Vec<KillTarget>) -> Self {
        Self {
            state: Arc::new(KillState {
                reaped: AtomicBool::new(false),
                requested: AtomicBool::new(false),
                targets,
            }),
        }
    }

    #[cfg(not(unix))]
    fn new() -> Self {
        Self {
            state: Arc::new(KillState {
                reaped: AtomicBool::new(false),
                requested: AtomicBool::new(false),
            }),
        }
    }

    /// Sends SIGKILL to every target (on Windows the waiter does the killing).
    pub(crate) fn kill(&self) {
        if self.state.reaped.load(Ordering::SeqCst) {
            return;
        }
        self.state.requested.store(true, Ordering::SeqCst);
        #[cfg(unix)]
        for target in &self.state.targets {
            let result = match *target {
                KillTarget::Process(pid) => kill(pid, Signal::SIGKILL),
                KillTarget::Group(pgid) => killpg(pgid, Signal::SIGKILL),
            };
            match result {
                Ok(()) => warn!(target = ?target, "sent SIGKILL"),
                Err(errno) => debug!(target = ?target, error = %errno, "SIGKILL not delivered"),
            }
        }
    }

    #[cfg_attr(unix, allow(dead_code))]
    pub(crate) fn kill_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    fn mark_reaped(&self) {
        self.state.reaped.store(true, Ordering::SeqCst);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::parse_command;
    use std::time::{Duration, Instant};

    fn launch_sh(script: &str) -> Launched {
        launch_sh_reading(script).0
    }

    /// Launches `sh -c script` and keeps the read end of its stdout.
    fn launch_sh_reading(script: &str) -> (Launched, std::io::PipeReader) {
        let parsed = ParsedCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        };
        let (stdin, _) = std::io::pipe().expect("pipe");
        let (reader, stdout) = std::io::pipe().expect("pipe");
        let (_, stderr) = std::io::pipe().expect("pipe");
        let launched = launch_direct(
            Path::new("/bin/sh"),
            &parsed,
            stdin.into(),
            stdout.into(),
            stderr.into(),
        )
        .expect("launch");
        (launched, reader)
    }

    #[test]
    fn test_exit_code_is_reported() {
        let launched = launch_sh("exit 42");
        assert_eq!(launched.waiter.wait(&launched.killer).expect("wait"), 42);
    }

    #[test]
    fn test_signalled_child_reports_128_plus_signal() {
        let launched = launch_sh("kill -TERM $$");
        assert_eq!(launched.waiter.wait(&launched.killer).expect("wait"), 128 + 15);
    }

    #[test]
    fn test_killer_stops_a_running_child() {
        let launched = launch_sh("sleep 30");
        let start = Instant::now();
        launched.killer.kill();
        assert!(launched.killer.kill_requested());
        assert_eq!(launched.waiter.wait(&launched.killer).expect("wait"), 128 + 9);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_killer_takes_down_grandchildren_holding_the_stream() {
        use std::io::Read;

        let (launched, mut reader) = launch_sh_reading("echo started; sleep 30; :");
        let mut first = [0u8; 8];
        reader.read_exact(&mut first).expect("read");
        assert_eq!(&first, b"started\n");

        let start = Instant::now();
        launched.killer.kill();
        assert_eq!(launched.waiter.wait(&launched.killer).expect("wait"), 128 + 9);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).expect("read to end");
        assert!(rest.is_empty());
        assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
    }

    #[test]
    fn test_direct_child_leads_its_own_process_group() {
        let launched = launch_sh("sleep 30");
        let ChildWaiter::Direct(ref child) = launched.waiter else {
            panic!("launched directly");
        };
        let pid = Pid::from_raw(child.id() as i32);
        let group = nix::unistd::getpgid(Some(pid)).expect("getpgid");
        assert_eq!(group, pid);
        assert_ne!(group, nix::unistd::getpgrp());
        launched.killer.kill();
        launched.waiter.wait(&launched.killer).expect("wait");
    }

    #[test]
    fn test_kill_after_reap_is_a_no_op() {
        let launched = launch_sh("exit 0");
        let killer = launched.killer.clone();
        launched.waiter.wait(&launched.killer).expect("wait");
        killer.kill();
        assert!(!killer.kill_requested());
    }

    #[test]
    fn test_arg0_is_the_program_basename() {
        let parsed = parse_command("/bin/sh -c 'test \"$0\" = sh'").expect("parse");
        let (stdin, _) = std::io::pipe().expect("pipe");
        let (_, stdout) = std::io::pipe().expect("pipe");
        let (_, stderr) = std::io::pipe().expect("pipe");
        let launched = launch_direct(
            Path::new("/bin/sh"),
            &parsed,
            stdin.into(),
            stdout.into(),
            stderr.into(),
        )
        .expect("launch");
        assert_eq!(launched.waiter.wait(&launched.killer).expect("wait"), 0);
    }
}
