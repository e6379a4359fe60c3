//! Job-control state machine of the terminal proxy.
//!
//! The child runs in the background of the proxy's terminal. Whenever it
//! tries to read and is stopped for it, the machine decides whether to ask
//! the caller for a line or to let the child consume input already queued,
//! and moves the child into and out of the terminal foreground around that
//! exchange.
//!
//! All side effects go through [`JobControl`], so the machine runs unchanged
//! inside the forked proxy and against a scripted fake in tests. Nothing here
//! allocates.

use super::protocol::Reply;
use std::time::Duration;

/// A job-control step that failed. Names the step only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fault(pub(crate) &'static str);

/// What waiting on the child reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildEvent {
    Exited(i32),
    Signaled(i32),
    /// Stopped by SIGTTIN: a background read from the terminal.
    StoppedForInput,
    /// Stopped by SIGTTOU: a background write or mode change on the terminal.
    StoppedForOutput,
    /// Any other stop or a continue.
    Other,
}

/// The operations the proxy performs on its child and terminal.
pub(crate) trait JobControl {
    /// Blocks until the child changes state.
    fn wait_child(&mut self) -> Result<ChildEvent, Fault>;
    /// Check if a complete line is already queued on the terminal.
    fn input_pending(&mut self) -> Result<bool, Fault>;
    /// Makes the child's process group the terminal's foreground group.
    fn foreground_child(&mut self) -> Result<(), Fault>;
    /// Makes the proxy the terminal's foreground group again.
    fn background_child(&mut self) -> Result<(), Fault>;
    fn resume_child(&mut self) -> Result<(), Fault>;
    fn stop_child(&mut self) -> Result<(), Fault>;
    /// Tells the caller the child wants input.
    fn request_input(&mut self) -> Result<(), Fault>;
    /// Waits for the caller's answer to [`JobControl::request_input`].
    fn await_reply(&mut self) -> Result<Reply, Fault>;
    fn pause(&mut self, duration: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyState {
    Running,
    StoppedForInput,
    StoppedForOutput,
    Exited(i32),
}

/// Timings and platform behaviour of the proxy loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProxyMachine {
    /// How long a child with queued input keeps the foreground.
    pub(crate) grace: Duration,
    /// Pause between a delivered line and re-suspending the child.
    pub(crate) handoff: Duration,
    /// Suspend the child around moving it back to the background after a
    /// delivered line. Off on macOS.
    pub(crate) restop_after_reply: bool,
}

impl ProxyMachine {
    pub(crate) fn new(grace: Duration, handoff: Duration) -> Self {
        Self {
            grace,
            handoff,
            restop_after_reply: cfg!(not(target_os = "macos")),
        }
    }

    /// Drives the child until it ends. Returns its exit code, `128 + signal`
    /// for a signalled child.
    pub(crate) fn run(&self, job: &mut impl JobControl) -> Result<i32, Fault> {
        let mut state = ProxyState::Running;
        loop {
            state = match state {
                ProxyState::Running => match job.wait_child()? {
                    ChildEvent::Exited(code) => ProxyState::Exited(code),
                    ChildEvent::Signaled(signal) => ProxyState::Exited(128 + signal),
                    ChildEvent::StoppedForInput => ProxyState::StoppedForInput,
                    ChildEvent::StoppedForOutput => ProxyState::StoppedForOutput,
                    ChildEvent::Other => ProxyState::Running,
                },
                ProxyState::StoppedForInput => {
                    if job.input_pending()? {
                        self.lend_foreground(job)?;
                    } else {
                        self.exchange_line(job)?;
                    }
                    ProxyState::Running
                }
                ProxyState::StoppedForOutput => {
                    self.lend_foreground(job)?;
                    ProxyState::Running
                }
                ProxyState::Exited(code) => return Ok(code),
            };
        }
    }

    /// Nothing queued: hand the child the foreground, then ask the caller for
    /// a line while it waits there, then take the foreground back.
    ///
    /// The terminal must not be touched between the request and the reply:
    /// a caller that answers `Closed` hangs it up.
    fn exchange_line(&self, job: &mut impl JobControl) -> Result<(), Fault> {
        job.foreground_child()?;
        job.resume_child()?;
        job.request_input()?;
        let reply = job.await_reply()?;
        job.pause(self.handoff);
        if reply == Reply::Closed {
            // the terminal is going away, leave the child where it is
            return Ok(());
        }
        if self.restop_after_reply {
            job.stop_child()?;
        }
        job.background_child()?;
        if self.restop_after_reply {
            job.resume_child()?;
        }
        Ok(())
    }

    /// Lets the child run in the foreground for the grace period.
    fn lend_foreground(&self, job: &mut impl JobControl) -> Result<(), Fault> {
        job.foreground_child()?;
        job.resume_child()?;
        job.pause(self.grace);
        job.stop_child()?;
        job.background_child()?;
        job.resume_child()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Action {
        Wait,
        Poll,
        Foreground,
        Background,
        Resume,
        Stop,
        Request,
        Reply,
        Pause(Duration),
    }

    /// Scripted child and caller; records every action taken.
    #[derive(Debug, Default)]
    struct FakeJob {
        events: VecDeque<ChildEvent>,
        pending: VecDeque<bool>,
        replies: VecDeque<Reply>,
        fail_on: Option<Action>,
        actions: Vec<Action>,
    }

    impl FakeJob {
        fn new(events: Vec<ChildEvent>) -> Self {
            Self {
                events: events.into(),
                ..Self::default()
            }
        }

        fn record(&mut self, action: Action) -> Result<(), Fault> {
            self.actions.push(action);
            if self.fail_on == Some(action) {
                return Err(Fault("scripted"));
            }
            Ok(())
        }
    }

    impl JobControl for FakeJob {
        fn wait_child(&mut self) -> Result<ChildEvent, Fault> {
            self.record(Action::Wait)?;
            Ok(self.events.pop_front().unwrap_or(ChildEvent::Exited(0)))
        }
        fn input_pending(&mut self) -> Result<bool, Fault> {
            self.record(Action::Poll)?;
            Ok(self.pending.pop_front().unwrap_or(false))
        }
        fn foreground_child(&mut self) -> Result<(), Fault> {
            self.record(Action::Foreground)
        }
        fn background_child(&mut self) -> Result<(), Fault> {
            self.record(Action::Background)
        }
        fn resume_child(&mut self) -> Result<(), Fault> {
            self.record(Action::Resume)
        }
        fn stop_child(&mut self) -> Result<(), Fault> {
            self.record(Action::Stop)
        }
        fn request_input(&mut self) -> Result<(), Fault> {
            self.record(Action::Request)
        }
        fn await_reply(&mut self) -> Result<Reply, Fault> {
            self.record(Action::Reply)?;
            Ok(self.replies.pop_front().unwrap_or(Reply::Closed))
        }
        fn pause(&mut self, duration: Duration) {
            self.actions.push(Action::Pause(duration));
        }
    }

    fn machine() -> ProxyMachine {
        ProxyMachine {
            grace: Duration::from_millis(50),
            handoff: Duration::from_micros(100),
            restop_after_reply: true,
        }
    }

    #[test]
    fn test_child_that_never_reads_just_exits() {
        let mut job = FakeJob::new(vec![ChildEvent::Exited(7)]);
        assert_eq!(machine().run(&mut job), Ok(7));
        assert_eq!(job.actions, vec![Action::Wait]);
    }

    #[test]
    fn test_signalled_child_reports_shell_style_code() {
        let mut job = FakeJob::new(vec![ChildEvent::Signaled(9)]);
        assert_eq!(machine().run(&mut job), Ok(137));
    }

    #[test]
    fn test_continue_and_other_stops_are_ignored() {
        let mut job = FakeJob::new(vec![ChildEvent::Other, ChildEvent::Other, ChildEvent::Exited(0)]);
        assert_eq!(machine().run(&mut job), Ok(0));
        assert_eq!(job.actions, vec![Action::Wait; 3]);
    }

    #[test]
    fn test_read_with_empty_terminal_asks_the_caller() {
        let mut job = FakeJob::new(vec![ChildEvent::StoppedForInput, ChildEvent::Exited(123)]);
        job.replies.push_back(Reply::Delivered);
        assert_eq!(machine().run(&mut job), Ok(123));
        assert_eq!(
            job.actions,
            vec![
                Action::Wait,
                Action::Poll,
                Action::Foreground,
                Action::Resume,
                Action::Request,
                Action::Reply,
                Action::Pause(Duration::from_micros(100)),
                Action::Stop,
                Action::Background,
                Action::Resume,
                Action::Wait,
            ]
        );
    }

    #[test]
    fn test_closed_reply_leaves_child_in_foreground() {
        let mut job = FakeJob::new(vec![ChildEvent::StoppedForInput, ChildEvent::Exited(123)]);
        job.replies.push_back(Reply::Closed);
        assert_eq!(machine().run(&mut job), Ok(123));
        assert!(!job.actions.contains(&Action::Background));
        assert!(!job.actions.contains(&Action::Stop));
    }

    #[test]
    fn test_terminal_is_left_alone_between_request_and_reply() {
        let mut job = FakeJob::new(vec![ChildEvent::StoppedForInput, ChildEvent::Exited(0)]);
        job.replies.push_back(Reply::Closed);
        assert_eq!(machine().run(&mut job), Ok(0));
        let request = job
            .actions
            .iter()
            .position(|a| *a == Action::Request)
            .expect("request sent");
        assert_eq!(job.actions[request + 1], Action::Reply);
        assert!(
            job.actions[..request].ends_with(&[Action::Foreground, Action::Resume]),
            "{:?}",
            job.actions
        );
        // only waiting and pausing follow a closed reply
        assert!(job.actions[request + 1..].iter().all(|a| matches!(
            a,
            Action::Reply | Action::Pause(_) | Action::Wait
        )));
    }

    #[test]
    fn test_queued_input_gets_a_grace_period() {
        let mut job = FakeJob::new(vec![ChildEvent::StoppedForInput, ChildEvent::Exited(0)]);
        job.pending.push_back(true);
        assert_eq!(machine().run(&mut job), Ok(0));
        assert!(!job.actions.contains(&Action::Request));
        assert_eq!(
            &job.actions[1..8],
            &[
                Action::Poll,
                Action::Foreground,
                Action::Resume,
                Action::Pause(Duration::from_millis(50)),
                Action::Stop,
                Action::Background,
                Action::Resume,
            ]
        );
    }

    #[test]
    fn test_terminal_output_stop_lends_the_foreground() {
        let mut job = FakeJob::new(vec![ChildEvent::StoppedForOutput, ChildEvent::Exited(0)]);
        assert_eq!(machine().run(&mut job), Ok(0));
        assert!(job.actions.contains(&Action::Pause(Duration::from_millis(50))));
        assert!(!job.actions.contains(&Action::Poll));
    }

    #[test]
    fn test_without_restop_the_child_is_only_backgrounded() {
        let mut job = FakeJob::new(vec![ChildEvent::StoppedForInput, ChildEvent::Exited(0)]);
        job.replies.push_back(Reply::Delivered);
        let machine = ProxyMachine {
            restop_after_reply: false,
            ..machine()
        };
        assert_eq!(machine.run(&mut job), Ok(0));
        let after_reply: Vec<_> = job
            .actions
            .iter()
            .skip_while(|a| **a != Action::Reply)
            .copied()
            .collect();
        assert_eq!(
            after_reply,
            vec![
                Action::Reply,
                Action::Pause(Duration::from_micros(100)),
                Action::Background,
                Action::Wait,
            ]
        );
    }

    #[test]
    fn test_several_exchanges_in_a_row() {
        let mut job = FakeJob::new(vec![
            ChildEvent::StoppedForInput,
            ChildEvent::Other,
            ChildEvent::StoppedForInput,
            ChildEvent::Exited(0),
        ]);
        job.replies.extend([Reply::Delivered, Reply::Delivered]);
        assert_eq!(machine().run(&mut job), Ok(0));
        let requests = job.actions.iter().filter(|a| **a == Action::Request).count();
        assert_eq!(requests, 2);
    }

    #[test]
    fn test_failed_step_aborts_the_loop() {
        let mut job = FakeJob::new(vec![ChildEvent::StoppedForInput, ChildEvent::Exited(0)]);
        job.fail_on = Some(Action::Foreground);
        assert_eq!(machine().run(&mut job), Err(Fault("scripted")));
        assert_eq!(job.actions.last(), Some(&Action::Foreground));
    }
}
