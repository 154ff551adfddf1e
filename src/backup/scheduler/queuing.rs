use crate::backup::exec_env::ExecEnvironment;
use crate::backup::options::OptionInfo;
use crate::backup::result_error::result::Result;
use crate::backup::rule::{Scheduling, SchedulingSet};
use crate::backup::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Collects `run` and `check` calls of a dispatch batch so the inner stages
/// see the whole batch in a single call on flush.
pub struct QueuingScheduler {
    inner: Box<dyn Scheduler>,
    pending_run: Mutex<Vec<Scheduling>>,
    pending_check: Mutex<Vec<Scheduling>>,
}

fn take(pending: &Mutex<Vec<Scheduling>>) -> Vec<Scheduling> {
    std::mem::take(&mut *pending.lock().unwrap_or_else(PoisonError::into_inner))
}

fn queue(pending: &Mutex<Vec<Scheduling>>, schedulings: SchedulingSet) {
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .extend(schedulings);
}

impl QueuingScheduler {
    pub fn new(inner: Box<dyn Scheduler>) -> Self {
        Self {
            inner,
            pending_run: Mutex::default(),
            pending_check: Mutex::default(),
        }
    }
}

impl Scheduler for QueuingScheduler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(&self, schedulings: SchedulingSet) -> Result<()> {
        queue(&self.pending_run, schedulings);
        Ok(())
    }

    fn check(&self, schedulings: SchedulingSet) -> Result<Vec<String>> {
        queue(&self.pending_check, schedulings);
        Ok(Vec::new())
    }

    fn execute(&self, env: &ExecEnvironment, scheduling: &Scheduling) -> Result<bool> {
        self.inner.execute(env, scheduling)
    }

    fn next_execution_time(&self, scheduling: &Scheduling) -> Result<Option<DateTime<Utc>>> {
        self.inner.next_execution_time(scheduling)
    }

    fn available_options(&self) -> Vec<OptionInfo> {
        self.inner.available_options()
    }

    fn available_shared_options(&self) -> Vec<OptionInfo> {
        self.inner.available_shared_options()
    }

    fn flush_run(&self) -> Result<()> {
        let pending = take(&self.pending_run);
        if pending.is_empty() {
            return Ok(());
        }
        debug!("Running {} queued schedulings on {}", pending.len(), self.name());
        self.inner.run(SchedulingSet::new(pending))
    }

    fn flush_check(&self) -> Result<Vec<String>> {
        let pending = take(&self.pending_check);
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        self.inner.check(SchedulingSet::new(pending))
    }
}
