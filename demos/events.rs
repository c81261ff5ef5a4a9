use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::process::Command;
use std::rc::Rc;

use anyhow::{bail, Result};
use structopt::StructOpt;
use tether::trace::{self, Restart};
use tether::{Context, Event, EventKind, Flow, Pid};
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
struct Opt {
    /// Attach to a running process instead of spawning `cmd`.
    #[structopt(short, long)]
    pid: Option<i32>,

    /// Single-step instead of stopping at syscalls.
    #[structopt(long)]
    step: bool,

    /// Report job-control stops as group-stops.
    #[structopt(long)]
    group_stops: bool,

    cmd: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();

    let mut ctx = Context::new();
    ctx.set_detect_group_stop(opt.group_stops);

    if opt.step {
        ctx.set_step(Restart::Step);
    }

    let counts = Rc::new(RefCell::new(BTreeMap::new()));
    register_handlers(&mut ctx, &counts)?;

    let eldest = match opt.pid {
        Some(raw) => {
            let pid = Pid::from_raw(raw);
            trace::attach(pid)?;
            ctx.set_eldest(pid, true);
            pid
        },
        None => {
            if opt.cmd.is_empty() {
                bail!("expected a command or --pid");
            }

            let mut cmd = Command::new(&opt.cmd[0]);
            cmd.args(&opt.cmd[1..]);

            let child = trace::spawn(&mut cmd)?;
            let pid = Pid::from_raw(child.id() as i32);
            ctx.set_eldest(pid, false);
            pid
        },
    };

    // First stop: `SIGSTOP` for an attach, `SIGTRAP` after a spawned `execve()`.
    if let Some(status) = trace::wait_for(eldest)? {
        let options = trace::setup(eldest, ctx.options())?;
        println!("[{eldest}] first stop = {:#x}, options = {options:?}", status);
        trace::restart(eldest, ctx.step(), None)?;
    }

    let mut seen = HashSet::new();
    seen.insert(eldest);

    while let Some((pid, status)) = trace::wait_any()? {
        let (event, flow) = ctx.handle(pid, status)?;

        if let Some(err) = ctx.take_error() {
            eprintln!("[{pid}] handler error: {err}");
        }

        let is_new = seen.insert(pid);

        if event.is_terminal() {
            seen.remove(&pid);
            continue;
        }

        match flow {
            Flow::Continue => {
                // New tasks start with a `SIGSTOP` we must not deliver.
                let signal = match event {
                    Event::GenuineSignal { signal: libc::SIGSTOP } if is_new => None,
                    event => event.pending_signal(),
                };

                trace::restart(pid, ctx.step(), signal)?;
            },
            Flow::Detach => {
                trace::detach(pid, event.pending_signal())?;
            },
            Flow::Abort => {
                // Only stopped tracees can be detached, so this is best effort.
                for pid in seen {
                    let _ = trace::detach(pid, None);
                }

                break;
            },
        }
    }

    for (kind, count) in counts.borrow().iter() {
        println!("{kind:>12}: {count}");
    }

    Ok(())
}

fn register_handlers(ctx: &mut Context, counts: &Rc<RefCell<BTreeMap<String, usize>>>) -> Result<()> {
    let kinds = [
        EventKind::SyscallStop,
        EventKind::Forked,
        EventKind::VForked,
        EventKind::Cloned,
        EventKind::Execd,
        EventKind::VForkDone,
        EventKind::ExitIntent,
        EventKind::GroupStop,
        EventKind::GenuineSignal,
        EventKind::GenuineTrap,
        EventKind::Unknown,
        EventKind::Exited,
        EventKind::Terminated,
    ];

    for kind in kinds {
        let counts = counts.clone();

        ctx.handlers_mut().on(kind, move |pid, event| {
            *counts.borrow_mut().entry(kind.to_string()).or_insert(0) += 1;

            if kind != EventKind::SyscallStop {
                println!("[{pid}] {event}");
            }

            Ok(Flow::Continue)
        })?;
    }

    // Failures are reported from the loop via `take_error()`.
    ctx.handlers_mut().on_error(|_, _| Flow::Abort);

    Ok(())
}
