use std::collections::HashMap;
use std::process::Command;

use anyhow::Result;
use structopt::StructOpt;
use tether::trace::{self, Restart};
use tether::{Event, Pid, Tracee};
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
struct Opt {
    /// Print `execve()` argument vectors.
    #[structopt(short, long)]
    argv: bool,

    /// Longest string to copy out of a tracee.
    #[structopt(long, default_value = "256")]
    max_len: usize,

    #[structopt(min_values = 1)]
    cmd: Vec<String>,
}

struct State {
    tracee: Tracee,
    in_syscall: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();

    let mut cmd = Command::new(&opt.cmd[0]);
    cmd.args(&opt.cmd[1..]);

    let child = trace::spawn(&mut cmd)?;
    let eldest = Pid::from_raw(child.id() as i32);

    let mut tracees: HashMap<Pid, State> = HashMap::new();

    while let Some((pid, status)) = trace::wait_any()? {
        let event = tether::event::classify(pid, status)?;
        let is_new = !tracees.contains_key(&pid);

        let state = tracees.entry(pid).or_insert_with(|| State {
            tracee: Tracee::new(pid),
            in_syscall: false,
        });

        let mut signal = event.pending_signal();

        match event {
            Event::SyscallStop => {
                state.tracee.refresh()?;
                state.in_syscall = !state.in_syscall;

                if state.in_syscall {
                    print_entry(&state.tracee, &opt)?;
                } else {
                    print_exit(&state.tracee)?;
                }
            },
            Event::GenuineTrap if pid == eldest && is_new => {
                // Post-`execve()` trap of the spawned command.
                let options = trace::setup(pid, trace::supported_options())?;
                println!("[{pid}] options = {options:?}");
                signal = None;
            },
            Event::GenuineSignal { signal: libc::SIGSTOP } if is_new => {
                // Initial stop of an auto-attached task.
                signal = None;
            },
            event if event.is_terminal() => {
                println!("[{pid}] {event}");
                tracees.remove(&pid);
                continue;
            },
            event => {
                println!("[{pid}] {event}");
            },
        }

        if let Some(state) = tracees.get_mut(&pid) {
            state.tracee.restart(Restart::Syscall, signal)?;
        }
    }

    Ok(())
}

fn print_entry(tracee: &Tracee, opt: &Opt) -> Result<()> {
    let pid = tracee.pid();
    let number = tracee.read_syscall_number()?;
    let name = tracee.syscall_name()?;
    let args = tracee.read_arguments()?;

    let args: Vec<_> = args.iter().map(|arg| format!("{arg:#x}")).collect();

    match name {
        Some(name) => println!("[{pid}] {name}({})", args.join(", ")),
        None => println!("[{pid}] syscall_{number}({})", args.join(", ")),
    }

    if opt.argv && name == Some("execve") {
        let argv = tracee.read_argument(1)? as u64;

        for (i, arg) in tracee.read_strings(argv, 64, opt.max_len)?.iter().enumerate() {
            println!("[{pid}]     argv[{i}] = {:?}", arg.to_string_lossy());
        }
    }

    Ok(())
}

fn print_exit(tracee: &Tracee) -> Result<()> {
    let pid = tracee.pid();
    let ret = tracee.read_return()?;

    match ret.errno() {
        Some(errno) => println!("[{pid}]   = -1 {errno}"),
        None => println!("[{pid}]   = {:#x}", ret.value),
    }

    Ok(())
}
