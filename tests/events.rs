use std::cell::RefCell;
use std::process::Command;
use std::rc::Rc;

use anyhow::Result;
use nix::sys::signal::{self, Signal};
use ntest::timeout;
use pretty_assertions::assert_eq;
use tether::event::{self, Classifier, ExitStatus};
use tether::trace::{self, Restart, TraceOptions};
use tether::{Context, Error, Event, EventKind, Flow, Tracee};

#[macro_use]
mod support;
use support::*;

#[test]
#[timeout(2000)]
fn test_exit_intent_then_exit() -> Result<()> {
    let mut tracee = fork_tracee(default_options(), || 3)?;

    let events = until_exit(&mut tracee)?;

    assert_eq!(events, vec![
        Event::ExitIntent { status: ExitStatus::Code(3) },
        Event::Exited { code: 3 },
    ]);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_fork_event_names_child() -> Result<()> {
    let options = default_options() | TraceOptions::PTRACE_O_TRACEFORK;

    let mut tracee = fork_tracee(options, || {
        match unsafe { libc::fork() } {
            -1 => 1,
            0 => unsafe { libc::_exit(0) },
            _ => 0,
        }
    })?;

    let pid = tracee.pid();
    let mut trace = vec![];

    tracee.restart(Restart::Continue, None)?;
    let forked = event::classify(pid, wait(pid)?)?;
    trace.push((pid, forked));

    let child = match forked.child() {
        Some(child) => child,
        None => panic!("expected fork event, got {forked}"),
    };

    // The new task is auto-attached, and starts in a `SIGSTOP` stop.
    let stop = event::classify(child, wait(child)?)?;
    trace.push((child, stop));

    let mut child = Tracee::new(child);
    child.refresh()?;

    for event in until_exit(&mut child)? {
        trace.push((child.pid(), event));
    }

    for event in until_exit(&mut tracee)? {
        trace.push((pid, event));
    }

    assert_equivalent(&trace, &[
        event!(0, Forked { child: pid!(1) }),
        event!(1, GenuineSignal { signal: libc::SIGSTOP }),
        event!(1, ExitIntent { status: ExitStatus::Code(0) }),
        event!(1, Exited { code: 0 }),
        event!(0, GenuineSignal { signal: libc::SIGCHLD }),
        event!(0, ExitIntent { status: ExitStatus::Code(0) }),
        event!(0, Exited { code: 0 }),
    ]);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_exec_trap_is_not_delivered() -> Result<()> {
    let mut tracee = fork_tracee(default_options(), || {
        let path = b"/bin/true\0".as_ptr() as *const libc::c_char;
        let argv = [path, std::ptr::null()];

        unsafe { libc::execv(path, argv.as_ptr()) };

        127
    })?;

    let events = until_exit(&mut tracee)?;

    // Without `PTRACE_O_TRACEEXEC`, a successful `execve()` stops with a bare `SIGTRAP`.
    assert_eq!(events, vec![
        Event::GenuineTrap,
        Event::ExitIntent { status: ExitStatus::Code(0) },
        Event::Exited { code: 0 },
    ]);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_group_stop() -> Result<()> {
    let mut tracee = fork_tracee(default_options(), || 0)?;
    let pid = tracee.pid();

    // Deliver a `SIGSTOP`, which puts the tracee into a group-stop.
    tracee.restart(Restart::Continue, Some(libc::SIGSTOP))?;
    let status = wait(pid)?;

    let classifier = Classifier::new().detect_group_stop(true);
    assert_eq!(classifier.classify(pid, status)?, Event::GroupStop { signal: libc::SIGSTOP });

    // Indistinguishable from a signal-delivery-stop when detection is off.
    assert_eq!(event::classify(pid, status)?, Event::GenuineSignal { signal: libc::SIGSTOP });

    let events = until_exit(&mut tracee)?;

    assert_eq!(events, vec![
        Event::ExitIntent { status: ExitStatus::Code(0) },
        Event::Exited { code: 0 },
    ]);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_killed_tracee() -> Result<()> {
    // Without exit tracing, since older kernels stop `SIGKILL`ed tracees at exit.
    let mut tracee = fork_tracee(TraceOptions::PTRACE_O_TRACESYSGOOD, || 0)?;
    let pid = tracee.pid();
    let abi = tracee.abi()?;

    signal::kill(pid, Signal::SIGKILL)?;

    // Not stopped anymore, so register access fails, leaving the snapshot intact.
    let status = wait(pid)?;
    let err = tracee.refresh().unwrap_err();

    assert!(err.process_gone(), "{err:?}");
    assert_eq!(tracee.abi()?, abi);

    assert_eq!(
        event::classify(pid, status)?,
        Event::Terminated { signal: libc::SIGKILL, core_dumped: false },
    );

    let err = tracee.restart(Restart::Continue, None).unwrap_err();
    assert!(err.process_gone(), "{err:?}");

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_context_drives_spawned_command() -> Result<()> {
    let syscalls = Rc::new(RefCell::new(0));
    let exits = Rc::new(RefCell::new(vec![]));

    let mut ctx = Context::new();
    ctx.set_step(Restart::Syscall);
    {
        let syscalls = syscalls.clone();
        let exits = exits.clone();

        ctx.handlers_mut()
            .on(EventKind::SyscallStop, move |_, _| {
                *syscalls.borrow_mut() += 1;
                Ok(Flow::Continue)
            })?
            .on(EventKind::Exited, move |_, event| {
                exits.borrow_mut().push(*event);
                Ok(Flow::Detach)
            })?;
    }

    let child = trace::spawn(&mut Command::new("true"))?;
    let pid = tether::Pid::from_raw(child.id() as i32);
    ctx.set_eldest(pid, false);

    // Post-`execve()` trap, before any options are set.
    let (event, flow) = ctx.handle(pid, wait(pid)?)?;
    assert_eq!(event, Event::GenuineTrap);
    assert_eq!(flow, Flow::Continue);

    let options = trace::setup(pid, ctx.options())?;
    assert!(options.contains(TraceOptions::PTRACE_O_TRACESYSGOOD));

    let mut tracee = Tracee::new(pid);
    let mut pending = None;

    loop {
        tracee.restart(ctx.step(), pending.take())?;

        let (event, flow) = ctx.handle(pid, wait(pid)?)?;

        if flow != Flow::Continue {
            assert_eq!(flow, Flow::Detach);
            break;
        }

        if event == Event::SyscallStop {
            tracee.refresh()?;
            assert!(tracee.read_syscall_number()? >= 0);
        }

        pending = event.pending_signal();
    }

    assert!(*syscalls.borrow() > 0);
    assert_eq!(*exits.borrow(), vec![Event::Exited { code: 0 }]);
    assert!(ctx.take_error().is_none());
    assert_eq!(ctx.eldest(), Some(pid));
    assert!(!ctx.attached());

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_handler_failure_is_recorded() -> Result<()> {
    let mut ctx = Context::new();
    ctx.handlers_mut()
        .on(EventKind::ExitIntent, |_, _| Err("refusing exit".into()))?;

    let mut tracee = fork_tracee(ctx.options(), || 0)?;
    let pid = tracee.pid();

    tracee.restart(Restart::Continue, None)?;

    let (event, flow) = ctx.handle(pid, wait(pid)?)?;

    assert_eq!(event, Event::ExitIntent { status: ExitStatus::Code(0) });
    assert_eq!(flow, Flow::Abort);

    match ctx.take_error() {
        Some(Error::Callback { kind, source }) => {
            assert_eq!(kind, EventKind::ExitIntent);
            assert_eq!(source.to_string(), "refusing exit");
        },
        err => panic!("expected callback error, got {err:?}"),
    }

    // Dispatch never resumed the tracee, so it is still stopped and readable.
    tracee.refresh()?;

    until_exit(&mut tracee)?;

    Ok(())
}
