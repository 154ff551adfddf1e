//! Fatal-signal handling.
//!
//! SIGINT and SIGTERM never kill the process outright. Their arrival is
//! remembered and surfaces as [`Error::FatalSignal`] at the next checkpoint:
//! before a child process is spawned, after it has been reaped, or wherever
//! the pipeline calls [`SignalCoordinator::checkpoint`]. Cleanup steps such
//! as failure hooks and the execution record footer therefore always run.
//!
//! Every child runs in a process group of its own. While children run, a
//! signal is forwarded to each of their groups, so a synchronizer and
//! whatever it started are terminated however this process was launched.
//!
//! A second signal arriving while the first is still unobserved and no
//! child runs terminates the process at once; a process blocked outside any
//! checkpoint stays killable.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use nix::libc::c_int;
use nix::sys::signal::{killpg, raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::debug;

const FATAL_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Children whose groups receive forwarded signals at the same time.
pub const MAX_TRACKED_CHILDREN: usize = 32;

// A signal handler cannot reach the coordinator, so the values it touches
// are process-wide. Only this module reads or writes them.
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);
static FORWARD_TO_CHILDREN: AtomicBool = AtomicBool::new(true);
static CHILD_GROUPS: [AtomicI32; MAX_TRACKED_CHILDREN] =
    [const { AtomicI32::new(0) }; MAX_TRACKED_CHILDREN];

extern "C" fn note_signal(signal: c_int) {
    let unobserved = LAST_SIGNAL.swap(signal, Ordering::SeqCst);
    let Ok(signal) = Signal::try_from(signal) else {
        return;
    };

    let mut forwarded = false;
    for slot in &CHILD_GROUPS {
        let group = slot.load(Ordering::SeqCst);
        if group > 0 {
            forwarded = true;
            if FORWARD_TO_CHILDREN.load(Ordering::SeqCst) {
                let _ = killpg(Pid::from_raw(group), signal);
            }
        }
    }

    if unobserved != 0 && !forwarded {
        // Delivered with the default disposition once the handler returns.
        let _ = unsafe { sigaction(signal, &action(SigHandler::SigDfl)) };
        let _ = raise(signal);
    }
}

/// Exit status of a reaped child, negative signal number if it was killed.
pub trait ChildStatus {
    fn child_status(&self) -> i32;
}

impl ChildStatus for i32 {
    fn child_status(&self) -> i32 {
        *self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Forwarding {
    ChildGroups,
    Disabled,
}

/// A running child whose process group receives forwarded signals until
/// this is dropped.
#[derive(Debug)]
pub struct TrackedChild {
    slot: Option<usize>,
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            CHILD_GROUPS[slot].store(0, Ordering::SeqCst);
        }
    }
}

#[derive(Debug)]
pub struct SignalCoordinator {
    handled: Vec<Signal>,
}

impl SignalCoordinator {
    pub fn install() -> Result<Self> {
        Self::install_with(Forwarding::ChildGroups)
    }

    /// Takes over SIGINT and SIGTERM, except those ignored at startup which
    /// stay ignored.
    pub fn install_with(forwarding: Forwarding) -> Result<Self> {
        FORWARD_TO_CHILDREN.store(forwarding == Forwarding::ChildGroups, Ordering::SeqCst);
        let mut handled = Vec::with_capacity(FATAL_SIGNALS.len());
        for signal in FATAL_SIGNALS {
            let previous =
                unsafe { sigaction(signal, &action(SigHandler::Handler(note_signal)))? };
            if previous.handler() == SigHandler::SigIgn {
                debug!("{signal} is ignored, leaving it ignored");
                unsafe { sigaction(signal, &previous)? };
                continue;
            }
            handled.push(signal);
        }
        Ok(Self { handled })
    }

    pub fn handles(&self, signal: Signal) -> bool {
        self.handled.contains(&signal)
    }

    /// Raises a signal that arrived since the last checkpoint. The arrival
    /// is consumed, so cleanup after this point runs undisturbed.
    pub fn checkpoint(&self) -> Result<()> {
        match LAST_SIGNAL.swap(0, Ordering::SeqCst) {
            0 => Ok(()),
            signal => Err(Error::FatalSignal {
                signal,
                child_status: None,
            }),
        }
    }

    /// `outcome`, unless a signal arrived while it was produced.
    pub fn observe<T>(&self, outcome: Result<T>) -> Result<T> {
        self.checkpoint()?;
        outcome
    }

    /// Forwards signals to the process group of `pid` until the returned
    /// guard is dropped. The child must lead its own group.
    pub fn track(&self, pid: u32) -> TrackedChild {
        let group = pid as i32;
        let slot = CHILD_GROUPS.iter().position(|slot| {
            slot.compare_exchange(0, group, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });
        match slot {
            None => debug!("Tracking {MAX_TRACKED_CHILDREN} children already, {pid} not forwarded to"),
            Some(_) => {
                // Arrived between spawning and tracking.
                let pending = LAST_SIGNAL.load(Ordering::SeqCst);
                if pending != 0 && FORWARD_TO_CHILDREN.load(Ordering::SeqCst) {
                    if let Ok(signal) = Signal::try_from(pending) {
                        let _ = killpg(Pid::from_raw(group), signal);
                    }
                }
            }
        }
        TrackedChild { slot }
    }

    /// Runs `call`, which spawns and reaps one child. A signal pending
    /// beforehand is raised without spawning; one arriving meanwhile is
    /// raised afterwards as [`Error::FatalSignal`] carrying the child's exit
    /// status.
    pub fn around_child<T, F>(&self, call: F) -> Result<T>
    where
        T: ChildStatus,
        F: FnOnce() -> Result<T>,
    {
        self.checkpoint()?;
        let outcome = call();
        match LAST_SIGNAL.swap(0, Ordering::SeqCst) {
            0 => outcome,
            signal => Err(Error::FatalSignal {
                signal,
                child_status: outcome.as_ref().ok().map(ChildStatus::child_status),
            }),
        }
    }

    /// Restores the default disposition of `signal` and re-raises it, so the
    /// exit status reports death by signal.
    pub fn terminate_with(&self, signal: i32) -> ! {
        if let Ok(signal) = Signal::try_from(signal) {
            let _ = unsafe { sigaction(signal, &action(SigHandler::SigDfl)) };
            let mut set = SigSet::empty();
            set.add(signal);
            let _ = set.thread_unblock();
            let _ = raise(signal);
        }
        std::process::exit(128 + signal)
    }
}

fn action(handler: SigHandler) -> SigAction {
    SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty())
}
