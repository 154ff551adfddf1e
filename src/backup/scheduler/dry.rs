use crate::backup::exec_env::ExecEnvironment;
use crate::backup::options::OptionInfo;
use crate::backup::result_error::result::Result;
use crate::backup::rule::{Scheduling, SchedulingSet};
use crate::backup::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::sync::{Mutex, PoisonError};

/// Replaces `run` by printing what would be dispatched.
pub struct DryScheduler {
    inner: Box<dyn Scheduler>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl DryScheduler {
    pub fn new(inner: Box<dyn Scheduler>, out: Box<dyn Write + Send>) -> Self {
        Self {
            inner,
            out: Mutex::new(out),
        }
    }

    pub fn stdout(inner: Box<dyn Scheduler>) -> Self {
        Self::new(inner, Box::new(std::io::stdout()))
    }
}

impl Scheduler for DryScheduler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(&self, schedulings: SchedulingSet) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        for scheduling in schedulings.iter() {
            let next = match self.inner.next_execution_time(scheduling)? {
                Some(time) if time > Utc::now() => format!("next execution at {time}"),
                Some(_) => "due now".to_string(),
                None => "next execution unknown".to_string(),
            };
            writeln!(
                out,
                "Would schedule rule {} with scheduler {} ({next})",
                scheduling.rule_name(),
                self.inner.name()
            )?;
        }
        out.flush()?;
        Ok(())
    }

    fn check(&self, schedulings: SchedulingSet) -> Result<Vec<String>> {
        self.inner.check(schedulings)
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::scheduler::testing::{scheduling, Behavior, RecordingScheduler};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_run_only_prints() {
        let inner = RecordingScheduler::new(Behavior::Succeed);
        let buffer = SharedBuffer::default();
        let stage = DryScheduler::new(Box::new(inner.clone()), Box::new(buffer.clone()));

        stage
            .run(SchedulingSet::new(vec![scheduling("a", &[]), scheduling("b", &[])]))
            .unwrap();

        assert!(inner.runs.lock().unwrap().is_empty());
        let printed = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            printed,
            "Would schedule rule a with scheduler recording (next execution unknown)\n\
             Would schedule rule b with scheduler recording (next execution unknown)\n"
        );
    }
}
