//! Pseudo-terminal allocation and the forked proxy process.
//!
//! The proxy is forked from the (possibly multi-threaded) caller and never
//! execs, so everything it runs after the fork is restricted to raw system
//! calls: no allocation, no locks, no logging. Every buffer and C string it
//! needs is prepared before the fork.
//!
//! # Safety
//!
//! This module calls `fork`, `execv`, `dup2`, `poll` and the termios
//! functions directly. Each unsafe block states what it relies on.

#![allow(unsafe_code)]

use super::machine::{ChildEvent, Fault, JobControl, ProxyMachine};
use super::protocol::{self, ProxyMessage, Reply};
use crate::command::ParsedCommand;
use crate::config::SpawnConfig;
use crate::error::{Result, SpawnError};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::pty::{PtyMaster, grantpt, posix_openpt, unlockpt};
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal, kill, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid, setpgid, setsid};
use std::ffi::{CStr, CString};
use std::io::{self, PipeReader, PipeWriter};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Exit code of a proxy that could not set up the terminal or lost control
/// of the child.
const PROXY_FAILED: i32 = 125;

/// Exit code of a child whose exec failed.
const EXEC_FAILED: i32 = 127;

/// The caller's side of a pseudo-terminal.
pub(crate) struct Pty {
    pub(crate) master: PtyMaster,
    slave_path: CString,
}

/// Opens a pseudo-terminal. The slave side is opened later by the proxy so
/// that it becomes the proxy's controlling terminal.
pub(crate) fn open_pty() -> Result<Pty> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
        .map_err(|e| SpawnError::errno("posix_openpt", e))?;
    set_cloexec(master.as_raw_fd()).map_err(|e| SpawnError::os("fcntl(terminal)", &e))?;
    grantpt(&master).map_err(|e| SpawnError::errno("grantpt", e))?;
    unlockpt(&master).map_err(|e| SpawnError::errno("unlockpt", e))?;
    let name = slave_name(&master)?;
    let slave_path = CString::new(name)
        .map_err(|_| SpawnError::internal("ptsname", "terminal name contains a NUL byte"))?;
    debug!(terminal = ?slave_path, "opened pseudo-terminal");
    Ok(Pty { master, slave_path })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> Result<String> {
    nix::pty::ptsname_r(master).map_err(|e| SpawnError::errno("ptsname", e))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> Result<String> {
    // SAFETY: ptsname uses a static buffer; the name is copied out before
    // anything else can call it on this thread, and no other thread of ours
    // opens terminals concurrently with a spawn call.
    unsafe { nix::pty::ptsname(master) }.map_err(|e| SpawnError::errno("ptsname", e))
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// A running proxy and the child it launched.
#[derive(Debug)]
pub(crate) struct ProxyChild {
    pub(crate) proxy: Pid,
    pub(crate) child: Pid,
    pub(crate) to_proxy: PipeWriter,
    pub(crate) from_proxy: PipeReader,
}

/// Everything the proxy needs after the fork, prepared beforehand.
struct Prepared<'a> {
    program: &'a CStr,
    /// Null-terminated `argv` pointing into `argv_storage` of the caller.
    argv: &'a [*const libc::c_char],
    terminal: &'a CStr,
    fds: ProxyFds,
    /// Where the descriptor scan stops when `close_range` is unavailable.
    ceiling: RawFd,
    machine: ProxyMachine,
}

/// Descriptors the proxy keeps open besides its stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProxyFds {
    /// The child's ends of its output streams.
    stdout: RawFd,
    stderr: RawFd,
    from_caller: RawFd,
    to_caller: RawFd,
}

impl ProxyFds {
    const COUNT: RawFd = 4;

    fn to_array(self) -> [RawFd; 4] {
        [self.stdout, self.stderr, self.from_caller, self.to_caller]
    }

    /// The same descriptors after `close_inherited` moved them down.
    fn packed() -> Self {
        Self {
            stdout: FIRST_KEPT,
            stderr: FIRST_KEPT + 1,
            from_caller: FIRST_KEPT + 2,
            to_caller: FIRST_KEPT + 3,
        }
    }
}

/// Lowest slot of the descriptors the proxy keeps; 0 to 2 are its own.
const FIRST_KEPT: RawFd = 3;

/// Forks the proxy, which sets up the terminal and launches the child.
///
/// Returns once the proxy has reported the child's pid. `stdout` and
/// `stderr` are the child's ends of its output streams; they are closed in
/// this process before returning.
pub(crate) fn launch(
    program: &Path,
    parsed: &ParsedCommand,
    pty: &Pty,
    stdout: OwnedFd,
    stderr: OwnedFd,
    config: &SpawnConfig,
) -> Result<ProxyChild> {
    let program = CString::new(program.as_os_str().as_bytes())
        .map_err(|_| SpawnError::internal("exec", "program path contains a NUL byte"))?;
    let argv_storage = std::iter::once(parsed.arg0())
        .chain(parsed.args.iter().map(String::as_str))
        .map(CString::new)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| SpawnError::internal("exec", "argument contains a NUL byte"))?;
    let argv: Vec<*const libc::c_char> = argv_storage
        .iter()
        .map(|arg| arg.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let (proxy_reads, caller_writes) =
        io::pipe().map_err(|e| SpawnError::os("pipe(proxy)", &e))?;
    let (mut caller_reads, proxy_writes) =
        io::pipe().map_err(|e| SpawnError::os("pipe(proxy)", &e))?;

    let prepared = Prepared {
        program: &program,
        argv: &argv,
        terminal: &pty.slave_path,
        fds: ProxyFds {
            stdout: stdout.as_raw_fd(),
            stderr: stderr.as_raw_fd(),
            from_caller: proxy_reads.as_raw_fd(),
            to_caller: proxy_writes.as_raw_fd(),
        },
        ceiling: descriptor_ceiling(),
        machine: ProxyMachine::new(config.input_grace(), config.handoff_pause()),
    };

    // SAFETY: the child branch only runs `proxy_main`, which never returns
    // and restricts itself to async-signal-safe calls on prepared data.
    let proxy = match unsafe { fork() } {
        Ok(ForkResult::Child) => proxy_main(&prepared),
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => return Err(SpawnError::errno("fork(proxy)", e)),
    };

    drop(proxy_reads);
    drop(proxy_writes);
    drop(stdout);
    drop(stderr);

    let child = match protocol::read_pid(&mut caller_reads) {
        Ok(pid) => Pid::from_raw(pid),
        Err(e) => {
            // the proxy died or never got as far as launching the child
            let _ = kill(proxy, Signal::SIGKILL);
            let _ = waitpid(proxy, None);
            return Err(SpawnError::os("proxy(handshake)", &e));
        }
    };
    debug!(proxy = %proxy, pid = %child, "terminal proxy launched child");

    Ok(ProxyChild {
        proxy,
        child,
        to_proxy: caller_writes,
        from_proxy: caller_reads,
    })
}

/// Upper bound for descriptors inherited by the proxy. Taken from the open
/// descriptor list when available, leaving room for descriptors other
/// threads open before the fork.
fn descriptor_ceiling() -> RawFd {
    const HEADROOM: RawFd = 1024;
    const FALLBACK_LIMIT: RawFd = 65_536;

    let dir = if cfg!(any(target_os = "linux", target_os = "android")) {
        "/proc/self/fd"
    } else {
        "/dev/fd"
    };
    // SAFETY: sysconf only reads a system limit.
    let limit = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => RawFd::try_from(n).unwrap_or(RawFd::MAX),
        _ => FALLBACK_LIMIT,
    };
    let highest = std::fs::read_dir(dir).ok().and_then(|entries| {
        entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<RawFd>().ok())
            .max()
    });
    match highest {
        Some(fd) => fd.saturating_add(HEADROOM).min(limit),
        None => limit.min(FALLBACK_LIMIT),
    }
}

/// Body of the forked proxy process.
fn proxy_main(p: &Prepared<'_>) -> ! {
    for sig in [
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTSTP,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
        Signal::SIGHUP,
    ] {
        // SAFETY: installing SIG_IGN runs no handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigIgn) };
    }
    // SAFETY: as above, default disposition.
    let _ = unsafe { signal::signal(Signal::SIGCHLD, SigHandler::SigDfl) };

    let Some(fds) = close_inherited(p) else {
        fail(p.fds, "dup(kept descriptors)");
    };

    if setsid().is_err() {
        fail(fds, "setsid");
    }
    // SAFETY: `terminal` is a valid NUL-terminated path prepared before the fork.
    let tty = unsafe { libc::open(p.terminal.as_ptr(), libc::O_RDWR) };
    if tty < 0 {
        fail(fds, "open(terminal)");
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        // SAFETY: TIOCSCTTY takes no pointer argument.
        if unsafe { libc::ioctl(tty, libc::TIOCSCTTY as _, 0) } < 0 {
            fail(fds, "ioctl(TIOCSCTTY)");
        }
    }
    let me = getpid();
    // SAFETY: plain call on a descriptor we just opened.
    if unsafe { libc::tcsetpgrp(tty, me.as_raw()) } != 0 {
        fail(fds, "tcsetpgrp(proxy)");
    }
    if !quiet_terminal(tty) {
        fail(fds, "tcsetattr");
    }

    // SAFETY: the child branch only runs `exec_child`, which execs or exits.
    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => exec_child(p, fds, tty),
        Ok(ForkResult::Parent { child }) => child,
        Err(_) => fail(fds, "fork(child)"),
    };
    // also done by the child itself; whichever runs first wins
    let _ = setpgid(child, child);

    if !write_raw(fds.to_caller, &protocol::encode_pid(child.as_raw())) {
        let _ = kill(child, Signal::SIGKILL);
        fail(fds, "write(pid)");
    }

    let mut jobs = TerminalJobs {
        tty,
        child,
        proxy: me,
        from_caller: fds.from_caller,
        to_caller: fds.to_caller,
    };
    match p.machine.run(&mut jobs) {
        Ok(code) => exit_now(code),
        Err(Fault(step)) => {
            report(step);
            let _ = write_raw(fds.to_caller, &[ProxyMessage::Fault.as_byte()]);
            let _ = killpg(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            exit_now(PROXY_FAILED)
        }
    }
}

/// Closes the caller's descriptors in the proxy, keeping stderr and the
/// ones listed in `p.fds`, which end up packed from `FIRST_KEPT` upwards.
///
/// Nothing is scanned on Linux: once the kept descriptors sit just above
/// stderr, everything past them goes in one `close_range` call, including
/// descriptors other threads opened after `p.ceiling` was taken.
fn close_inherited(p: &Prepared<'_>) -> Option<ProxyFds> {
    let first_free = FIRST_KEPT + ProxyFds::COUNT;
    let packed = ProxyFds::packed();
    let mut copies = [0; ProxyFds::COUNT as usize];
    // SAFETY: descriptor calls in a process that never returns to Rust code
    // owning the descriptors involved. Copies land at `first_free` or above,
    // so moving them into the packed slots cannot clobber one another.
    unsafe {
        libc::close(libc::STDIN_FILENO);
        for (copy, fd) in copies.iter_mut().zip(p.fds.to_array()) {
            *copy = libc::fcntl(fd, libc::F_DUPFD, first_free);
            if *copy < 0 {
                return None;
            }
        }
        for (copy, slot) in copies.into_iter().zip(packed.to_array()) {
            if libc::dup2(copy, slot) < 0 || libc::fcntl(slot, libc::F_SETFD, libc::FD_CLOEXEC) < 0
            {
                return None;
            }
        }
    }
    close_from(first_free, p.ceiling.max(first_free));
    Some(packed)
}

/// Closes every descriptor from `first` on.
fn close_from(first: RawFd, ceiling: RawFd) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range takes plain integers; a kernel without it
        // returns ENOSYS and the scan below takes over.
        let closed = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                libc::c_uint::MAX,
                0 as libc::c_uint,
            )
        };
        if closed == 0 {
            return;
        }
    }
    for fd in first..ceiling {
        // SAFETY: as in `close_inherited`.
        unsafe { libc::close(fd) };
    }
}

/// Turns off echo and output newline translation on the terminal.
fn quiet_terminal(tty: RawFd) -> bool {
    let mut attrs = std::mem::MaybeUninit::<libc::termios>::uninit();
    // SAFETY: tcgetattr fills the whole struct on success.
    if unsafe { libc::tcgetattr(tty, attrs.as_mut_ptr()) } != 0 {
        return false;
    }
    // SAFETY: initialised by the successful tcgetattr above.
    let mut attrs = unsafe { attrs.assume_init() };
    attrs.c_lflag &= !(libc::ECHO | libc::ECHOE | libc::ECHOK | libc::ECHONL);
    attrs.c_oflag &= !libc::ONLCR;
    // SAFETY: passes a valid termios.
    unsafe { libc::tcsetattr(tty, libc::TCSANOW, &attrs) == 0 }
}

/// Body of the real child: own process group, terminal as stdin, default
/// signal handling, then exec.
fn exec_child(p: &Prepared<'_>, fds: ProxyFds, tty: RawFd) -> ! {
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));

    // SAFETY: dup2 on descriptors that are open in this process.
    let redirected = unsafe {
        libc::dup2(tty, libc::STDIN_FILENO) >= 0
            && libc::dup2(fds.stdout, libc::STDOUT_FILENO) >= 0
            && libc::dup2(fds.stderr, libc::STDERR_FILENO) >= 0
    };
    if !redirected {
        report("dup2");
        exit_now(EXEC_FAILED);
    }
    if tty > libc::STDERR_FILENO {
        // SAFETY: our own copy, already duplicated onto stdin.
        unsafe { libc::close(tty) };
    }

    for sig in [
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTSTP,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
        Signal::SIGCHLD,
        Signal::SIGPIPE,
        Signal::SIGHUP,
    ] {
        // SAFETY: restoring the default disposition runs no handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

    // SAFETY: program and argv are NUL-terminated and argv ends with a null
    // pointer; both outlive this call, which only returns on failure.
    unsafe { libc::execv(p.program.as_ptr(), p.argv.as_ptr()) };
    report("execv");
    exit_now(EXEC_FAILED)
}

/// Job control through the proxy's terminal and control pipes.
struct TerminalJobs {
    tty: RawFd,
    child: Pid,
    proxy: Pid,
    from_caller: RawFd,
    to_caller: RawFd,
}

impl JobControl for TerminalJobs {
    fn wait_child(&mut self) -> std::result::Result<ChildEvent, Fault> {
        let flags = WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        loop {
            let event = match waitpid(self.child, Some(flags)) {
                Ok(WaitStatus::Exited(_, code)) => ChildEvent::Exited(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => ChildEvent::Signaled(sig as i32),
                Ok(WaitStatus::Stopped(_, Signal::SIGTTIN)) => ChildEvent::StoppedForInput,
                Ok(WaitStatus::Stopped(_, Signal::SIGTTOU)) => ChildEvent::StoppedForOutput,
                Ok(_) => ChildEvent::Other,
                Err(Errno::EINTR) => continue,
                Err(_) => return Err(Fault("waitpid")),
            };
            return Ok(event);
        }
    }

    fn input_pending(&mut self) -> std::result::Result<bool, Fault> {
        let mut poll = libc::pollfd {
            fd: self.tty,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let rc = unsafe { libc::poll(&mut poll, 1, 0) };
        if rc < 0 {
            if Errno::last() == Errno::EINTR {
                return Ok(false);
            }
            return Err(Fault("poll(terminal)"));
        }
        Ok(rc > 0 && poll.revents & libc::POLLIN != 0)
    }

    fn foreground_child(&mut self) -> std::result::Result<(), Fault> {
        set_foreground(self.tty, self.child, "tcsetpgrp(child)")
    }

    fn background_child(&mut self) -> std::result::Result<(), Fault> {
        set_foreground(self.tty, self.proxy, "tcsetpgrp(proxy)")
    }

    fn resume_child(&mut self) -> std::result::Result<(), Fault> {
        killpg(self.child, Signal::SIGCONT).map_err(|_| Fault("kill(SIGCONT)"))
    }

    fn stop_child(&mut self) -> std::result::Result<(), Fault> {
        killpg(self.child, Signal::SIGSTOP).map_err(|_| Fault("kill(SIGSTOP)"))
    }

    fn request_input(&mut self) -> std::result::Result<(), Fault> {
        if write_raw(self.to_caller, &[ProxyMessage::InputRequested.as_byte()]) {
            Ok(())
        } else {
            Err(Fault("write(request)"))
        }
    }

    fn await_reply(&mut self) -> std::result::Result<Reply, Fault> {
        let mut byte = 0u8;
        loop {
            // SAFETY: reads one byte into a local.
            let n = unsafe { libc::read(self.from_caller, (&raw mut byte).cast(), 1) };
            match n {
                1 => return Ok(Reply::from_byte(Some(byte))),
                0 => return Ok(Reply::from_byte(None)),
                _ if Errno::last() == Errno::EINTR => {}
                _ => return Err(Fault("read(reply)")),
            }
        }
    }

    fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

fn set_foreground(tty: RawFd, group: Pid, step: &'static str) -> std::result::Result<(), Fault> {
    // SAFETY: plain call on the proxy's terminal descriptor.
    if unsafe { libc::tcsetpgrp(tty, group.as_raw()) } == 0 {
        Ok(())
    } else {
        Err(Fault(step))
    }
}

fn write_raw(fd: RawFd, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        // SAFETY: writes from a live slice.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n > 0 {
            bytes = &bytes[n as usize..];
        } else if n < 0 && Errno::last() == Errno::EINTR {
            continue;
        } else {
            return false;
        }
    }
    true
}

/// Writes a fixed diagnostic to stderr without allocating.
fn report(step: &str) {
    let _ = write_raw(libc::STDERR_FILENO, b"shellspawn terminal proxy: ");
    let _ = write_raw(libc::STDERR_FILENO, step.as_bytes());
    let _ = write_raw(libc::STDERR_FILENO, b" failed\n");
}

fn fail(fds: ProxyFds, step: &str) -> ! {
    report(step);
    let _ = write_raw(fds.to_caller, &[ProxyMessage::Fault.as_byte()]);
    exit_now(PROXY_FAILED)
}

fn exit_now(code: i32) -> ! {
    // SAFETY: terminates the process without running destructors or atexit
    // handlers belonging to the caller.
    unsafe { libc::_exit(code) }
}
