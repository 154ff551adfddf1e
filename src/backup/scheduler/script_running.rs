use crate::backup::exec_env::ExecEnvironment;
use crate::backup::logger::Severity;
use crate::backup::options::OptionInfo;
use crate::backup::process::ProcessRunner;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::rule::{Scheduling, SchedulingSet};
use crate::backup::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use tracing::warn;

pub const EXEC_BEFORE: &str = "ExecBefore";
pub const EXEC_ON_SUCCESS: &str = "ExecOnSuccess";
pub const EXEC_ON_FAILURE: &str = "ExecOnFailure";

const SHELL: &str = "/bin/sh";

/// Runs the user's shell hooks around `execute`:
/// `ExecBefore`, the inner execution, then `ExecOnSuccess`. Whatever fails,
/// including a panic, `ExecOnFailure` runs once before the failure is passed
/// on.
pub struct ScriptRunningScheduler {
    inner: Box<dyn Scheduler>,
    runner: ProcessRunner,
}

impl ScriptRunningScheduler {
    pub fn new(inner: Box<dyn Scheduler>, runner: ProcessRunner) -> Self {
        Self { inner, runner }
    }

    fn run_hook(env: &ExecEnvironment, option: &str, script: &str) -> Result<bool> {
        let exit_code = env
            .log_subprocess(SHELL, &["-c", script])
            .add_msg(format!("Running {option} failed"))?;
        if exit_code != 0 {
            env.logger().log(
                Severity::Err,
                format!("{option} exited with code {exit_code}"),
            )?;
        }
        Ok(exit_code == 0)
    }

    fn execute_hooked(&self, env: &ExecEnvironment, scheduling: &Scheduling) -> Result<bool> {
        if let Some(script) = scheduling.option(EXEC_BEFORE) {
            if !Self::run_hook(env, EXEC_BEFORE, script)? {
                return Ok(false);
            }
        }
        if !self.inner.execute(env, scheduling)? {
            return Ok(false);
        }
        match scheduling.option(EXEC_ON_SUCCESS) {
            Some(script) => Self::run_hook(env, EXEC_ON_SUCCESS, script),
            None => Ok(true),
        }
    }

    fn syntax_errors(&self, scheduling: &Scheduling) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        for option in [EXEC_BEFORE, EXEC_ON_SUCCESS, EXEC_ON_FAILURE] {
            if let Some(script) = scheduling.option(option) {
                let exit_code = self.runner.run_inherited(SHELL, &["-n", "-c", script])?;
                if exit_code != 0 {
                    errors.push(format!(
                        "in rule {}: {option} is not a valid shell script",
                        scheduling.rule_name()
                    ));
                }
            }
        }
        Ok(errors)
    }
}

impl Scheduler for ScriptRunningScheduler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(&self, schedulings: SchedulingSet) -> Result<()> {
        self.inner.run(schedulings)
    }

    fn check(&self, schedulings: SchedulingSet) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        for scheduling in schedulings.iter() {
            errors.extend(self.syntax_errors(scheduling)?);
        }
        errors.extend(self.inner.check(schedulings)?);
        Ok(errors)
    }

    fn execute(&self, env: &ExecEnvironment, scheduling: &Scheduling) -> Result<bool> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let outcome = self.execute_hooked(env, scheduling);
            env.runner().signals().observe(outcome)
        }));
        if matches!(outcome, Ok(Ok(true))) {
            return Ok(true);
        }

        let on_failure = match scheduling.option(EXEC_ON_FAILURE) {
            Some(script) => Self::run_hook(env, EXEC_ON_FAILURE, script).map(|_| ()),
            None => Ok(()),
        };
        match (outcome, on_failure) {
            (Err(payload), on_failure) => {
                if let Err(e) = on_failure {
                    warn!("{e}");
                }
                resume_unwind(payload)
            }
            (Ok(Ok(_)), Ok(())) => Ok(false),
            (Ok(Ok(_)), Err(e)) => Err(e),
            (Ok(Err(e)), Ok(())) => Err(e),
            (Ok(Err(e)), Err(hook_error)) => Err(Error::from(vec![e, hook_error])),
        }
    }

    fn next_execution_time(&self, scheduling: &Scheduling) -> Result<Option<DateTime<Utc>>> {
        self.inner.next_execution_time(scheduling)
    }

    fn available_options(&self) -> Vec<OptionInfo> {
        let mut options = self.inner.available_options();
        options.extend(
            [EXEC_BEFORE, EXEC_ON_SUCCESS, EXEC_ON_FAILURE].map(OptionInfo::string),
        );
        options
    }

    fn available_shared_options(&self) -> Vec<OptionInfo> {
        self.inner.available_shared_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::logger::testing::RecordingTarget;
    use crate::backup::scheduler::testing::{
        environment, runner, scheduling, Behavior, RecordingScheduler,
    };
    use crate::backup::synchronizer::testing::FakeSynchronizer;
    use serial_test::serial;
    use std::sync::Arc;

    fn stage(behavior: Behavior) -> (Arc<RecordingScheduler>, ScriptRunningScheduler) {
        let inner = RecordingScheduler::new(behavior);
        let stage = ScriptRunningScheduler::new(Box::new(inner.clone()), runner());
        (inner, stage)
    }

    fn execute(
        stage: &ScriptRunningScheduler,
        options: &[(&str, &str)],
    ) -> (Result<bool>, RecordingTarget) {
        let target = RecordingTarget::default();
        let env = environment(target.clone(), &FakeSynchronizer::default());
        (stage.execute(&env, &scheduling("r", options)), target)
    }

    #[test]
    #[serial]
    fn test_failing_exec_before_skips_execution() {
        let (inner, stage) = stage(Behavior::Succeed);
        let (result, target) = execute(
            &stage,
            &[
                (EXEC_BEFORE, "echo before; exit 3"),
                (EXEC_ON_SUCCESS, "echo success"),
                (EXEC_ON_FAILURE, "echo failure"),
            ],
        );

        assert!(!result.unwrap());
        assert!(inner.executions.lock().unwrap().is_empty());
        assert_eq!(target.output(), "before\nfailure\n");
        assert_eq!(
            target.messages(Severity::Err),
            vec!["ExecBefore exited with code 3".to_string()]
        );
    }

    #[test]
    #[serial]
    fn test_success_runs_success_hook_only() {
        let (inner, stage) = stage(Behavior::Succeed);
        let (result, target) = execute(
            &stage,
            &[
                (EXEC_BEFORE, "echo before"),
                (EXEC_ON_SUCCESS, "echo success"),
                (EXEC_ON_FAILURE, "echo failure"),
            ],
        );

        assert!(result.unwrap());
        assert_eq!(inner.executions.lock().unwrap().len(), 1);
        assert_eq!(target.output(), "before\ninner output\nsuccess\n");
    }

    #[test]
    #[serial]
    fn test_inner_error_runs_failure_hook_and_propagates() {
        let (_, stage) = stage(Behavior::Error);
        let (result, target) = execute(&stage, &[(EXEC_ON_FAILURE, "echo failure")]);

        assert!(result.unwrap_err().to_string().contains("inner stage broke"));
        assert_eq!(target.output(), "inner output\nfailure\n");
    }

    #[test]
    #[serial]
    fn test_signal_between_children_runs_failure_hook() {
        let (_, stage) = stage(Behavior::Signaled);
        let (result, target) = execute(
            &stage,
            &[
                (EXEC_ON_SUCCESS, "echo success"),
                (EXEC_ON_FAILURE, "echo failure"),
            ],
        );

        assert_eq!(result.unwrap_err().signal_number(), Some(15));
        assert_eq!(target.output(), "inner output\nfailure\n");
    }

    #[test]
    #[serial]
    fn test_panic_runs_failure_hook_and_resumes() {
        let (_, stage) = stage(Behavior::Panic);
        let target = RecordingTarget::default();
        let env = environment(target.clone(), &FakeSynchronizer::default());
        let scheduling = scheduling("r", &[(EXEC_ON_FAILURE, "echo failure")]);

        let caught = catch_unwind(AssertUnwindSafe(|| stage.execute(&env, &scheduling)));
        assert!(caught.is_err());
        assert_eq!(target.output(), "inner output\nfailure\n");
    }

    #[test]
    #[serial]
    fn test_check_validates_script_syntax() {
        let (inner, stage) = stage(Behavior::Succeed);
        let errors = stage
            .check(SchedulingSet::new(vec![
                scheduling("good", &[(EXEC_BEFORE, "echo ok")]),
                scheduling("bad", &[(EXEC_ON_FAILURE, "if then fi (")]),
            ]))
            .unwrap();
        assert_eq!(
            errors,
            vec!["in rule bad: ExecOnFailure is not a valid shell script".to_string()]
        );
        assert_eq!(inner.checks.lock().unwrap().len(), 1);
    }
}
