use std::collections::HashMap;
use std::convert::TryInto;

use anyhow::{bail, Result};
use nix::sys::signal::{raise, Signal};
use nix::unistd::{fork, ForkResult};
use pretty_assertions::assert_eq;
use tether::trace::{self, Restart, TraceOptions};
use tether::{Event, Pid, Tracee};

#[allow(unused)]
macro_rules! pid {
    ($raw: expr) => {
        tether::Pid::from_raw($raw)
    };
}

/// Construct a `(pid, event)` pair with a readable, integration test-friendly syntax.
#[allow(unused)]
macro_rules! event {
    ($raw_pid: expr, $event: expr) => {{
        #[allow(unused)]
        use tether::Event::*;

        (tether::Pid::from_raw($raw_pid), $event)
    }};
}

/// Options requested for every forked tracee.
#[allow(unused)]
pub fn default_options() -> TraceOptions {
    TraceOptions::PTRACE_O_TRACESYSGOOD | TraceOptions::PTRACE_O_TRACEEXIT
}

/// Fork a child that becomes our tracee, stops itself, then exits with `body()`.
///
/// Returns once the child is in its initial `SIGSTOP` stop, with `options` set and a
/// fresh register snapshot. The child shares our memory layout, so addresses of statics
/// and pre-fork allocations are valid in it.
#[allow(unused)]
pub fn fork_tracee<F>(options: TraceOptions, body: F) -> Result<Tracee>
where
    F: FnOnce() -> i32,
{
    // Only async-signal-safe calls in the child: the test harness is multithreaded.
    match unsafe { fork() }? {
        ForkResult::Child => {
            if trace::traceme().is_err() || raise(Signal::SIGSTOP).is_err() {
                unsafe { libc::_exit(127) };
            }

            let code = body();

            unsafe { libc::_exit(code) };
        },
        ForkResult::Parent { child } => {
            let status = wait(child)?;
            let event = tether::event::classify(child, status)?;

            if event != (Event::GenuineSignal { signal: libc::SIGSTOP }) {
                bail!("unexpected initial stop for {}: {}", child, event);
            }

            trace::setup(child, options)?;

            let mut tracee = Tracee::new(child);
            tracee.refresh()?;

            Ok(tracee)
        },
    }
}

/// Wait on `pid` only. Never waits on any other task, so parallel tests don't steal
/// each other's statuses.
pub fn wait(pid: Pid) -> Result<i32> {
    match trace::wait_for(pid)? {
        Some(status) => Ok(status),
        None => bail!("nothing to wait on for {}", pid),
    }
}

/// Restart `tracee` until its next syscall-stop for `number`, then refresh it.
///
/// Signals seen on the way are delivered.
#[allow(unused)]
pub fn until_syscall(tracee: &mut Tracee, number: i64) -> Result<()> {
    let pid = tracee.pid();
    let mut pending = None;

    loop {
        tracee.restart(Restart::Syscall, pending.take())?;

        let event = tether::event::classify(pid, wait(pid)?)?;

        match event {
            Event::SyscallStop => {
                tracee.refresh()?;

                if tracee.read_syscall_number()? == number {
                    return Ok(());
                }
            },
            event if event.is_terminal() => bail!("tracee ended before syscall {}: {}", number, event),
            event => {
                pending = event.pending_signal();
            },
        }
    }
}

/// Continue `tracee` until it is gone, returning the events seen on the way.
#[allow(unused)]
pub fn until_exit(tracee: &mut Tracee) -> Result<Vec<Event>> {
    let pid = tracee.pid();
    let mut events = vec![];
    let mut pending = None;

    loop {
        tracee.restart(Restart::Continue, pending.take())?;

        let event = tether::event::classify(pid, wait(pid)?)?;
        events.push(event);

        if event.is_terminal() {
            return Ok(events);
        }

        pending = event.pending_signal();
    }
}

/// Assert that two event traces are equivalent modulo PID normalization.
#[allow(unused)]
pub fn assert_equivalent(left: &[(Pid, Event)], right: &[(Pid, Event)]) {
    let normed_left = Normalizer::normalize(left);
    let normed_right = Normalizer::normalize(right);
    assert_eq!(normed_left, normed_right)
}

/// Normalizes an event trace by substituting each concrete raw PID value with one that
/// matches its ordinal of appearance in the trace.
#[derive(Default)]
struct Normalizer {
    map: HashMap<Pid, Pid>,
}

impl Normalizer {
    pub fn normalize(trace: &[(Pid, Event)]) -> Vec<(Pid, Event)> {
        let mut normalizer = Normalizer::default();

        trace
            .iter()
            .map(|&(pid, event)| {
                let pid = normalizer.normalize_pid(pid);
                (pid, normalizer.normalize_event(event))
            })
            .collect()
    }

    fn normalize_event(&mut self, event: Event) -> Event {
        match event {
            Event::Forked { child } => Event::Forked { child: self.normalize_pid(child) },
            Event::VForked { child } => Event::VForked { child: self.normalize_pid(child) },
            Event::Cloned { child } => Event::Cloned { child: self.normalize_pid(child) },
            Event::VForkDone { child } => Event::VForkDone { child: self.normalize_pid(child) },
            Event::Execd { old } => Event::Execd { old: self.normalize_pid(old) },
            event => event,
        }
    }

    fn normalize_pid(&mut self, pid: Pid) -> Pid {
        let next_free = self.map.len();

        let entry = self.map.entry(pid).or_insert_with(|| {
            let raw: i32 = next_free.try_into().expect("exhausted free test PIDs");
            Pid::from_raw(raw)
        });

        *entry
    }
}
