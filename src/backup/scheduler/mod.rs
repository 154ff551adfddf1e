//! Schedulers decide when and how rules run.
//!
//! A plugin implements [`SchedulerPlugin`] and declares in its
//! [`PluginCapabilities`] which optional calls it really implements. The
//! plugin is then wrapped in a fixed pipeline of [`Scheduler`] stages, inner
//! first:
//!
//! 1. [`default_impl::DefaultImplScheduler`] supplies `execute` and
//!    `next_execution_time` where the plugin has none,
//! 2. [`script_running::ScriptRunningScheduler`] runs the `ExecBefore`,
//!    `ExecOnSuccess` and `ExecOnFailure` hooks,
//! 3. [`logging::LoggingScheduler`] fans execution output out to the sinks
//!    the rule selects,
//! 4. [`dry::DryScheduler`] (dry runs only) prints instead of running,
//! 5. [`queuing::QueuingScheduler`] collects a whole dispatch batch and hands
//!    it to the inner stages at once.

pub mod default_impl;
pub mod dry;
pub mod logging;
pub mod queuing;
pub mod script_running;
pub mod simple;

use crate::backup::exec_env::ExecEnvironment;
use crate::backup::logger::sinks::SinkFactory;
use crate::backup::options::OptionInfo;
use crate::backup::process::ProcessRunner;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::rule::{Scheduling, SchedulingSet};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One stage of a scheduler pipeline. Stages forward what they do not handle
/// to the stage they wrap.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, schedulings: SchedulingSet) -> Result<()>;

    fn check(&self, schedulings: SchedulingSet) -> Result<Vec<String>>;

    /// Performs one execution. `Ok(false)` is a failure reported without an
    /// error.
    fn execute(&self, env: &ExecEnvironment, scheduling: &Scheduling) -> Result<bool>;

    /// `None` when the time is unknown.
    fn next_execution_time(&self, scheduling: &Scheduling) -> Result<Option<DateTime<Utc>>>;

    fn available_options(&self) -> Vec<OptionInfo>;

    fn available_shared_options(&self) -> Vec<OptionInfo>;

    /// Hands everything collected by `run` to the inner stages.
    fn flush_run(&self) -> Result<()> {
        Ok(())
    }

    /// Hands everything collected by `check` to the inner stages.
    fn flush_check(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Optional calls a plugin actually implements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PluginCapabilities {
    pub execute: bool,
    pub next_execution_time: bool,
}

/// The contract for scheduler plugins. Only `run` is mandatory; `execute`
/// and `next_execution_time` are called only when declared in
/// [`SchedulerPlugin::capabilities`].
pub trait SchedulerPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities::default()
    }

    fn run(&self, schedulings: SchedulingSet) -> Result<()>;

    fn check(&self, _schedulings: &SchedulingSet) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn execute(&self, _env: &ExecEnvironment, _scheduling: &Scheduling) -> Result<bool> {
        Err(undeclared(self.name(), "execute"))
    }

    fn next_execution_time(&self, _scheduling: &Scheduling) -> Result<Option<DateTime<Utc>>> {
        Err(undeclared(self.name(), "next_execution_time"))
    }

    fn available_options(&self) -> Vec<OptionInfo> {
        Vec::new()
    }

    fn available_shared_options(&self) -> Vec<OptionInfo> {
        Vec::new()
    }
}

fn undeclared(plugin: &str, call: &str) -> Error {
    Error::invalid_config(format!(
        "scheduler {plugin:?} was asked for {call} it does not declare"
    ))
}

/// Wraps `plugin` in the standard stages, returning the outermost one.
pub fn build_pipeline(
    plugin: Arc<dyn SchedulerPlugin>,
    dry: bool,
    sinks: Arc<dyn SinkFactory>,
    runner: ProcessRunner,
) -> Arc<dyn Scheduler> {
    let stage: Box<dyn Scheduler> = Box::new(default_impl::DefaultImplScheduler::new(plugin));
    let stage = Box::new(script_running::ScriptRunningScheduler::new(stage, runner));
    let stage: Box<dyn Scheduler> = Box::new(logging::LoggingScheduler::new(stage, sinks));
    let stage: Box<dyn Scheduler> = if dry {
        Box::new(dry::DryScheduler::stdout(stage))
    } else {
        stage
    };
    Arc::new(queuing::QueuingScheduler::new(stage))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backup::logger::testing::RecordingTarget;
    use crate::backup::logger::Logger;
    use crate::backup::options::OptionMap;
    use crate::backup::signals::{Forwarding, SignalCoordinator};
    use crate::backup::synchronizer::testing::FakeSynchronizer;
    use std::sync::Mutex;

    pub fn runner() -> ProcessRunner {
        ProcessRunner::new(Arc::new(
            SignalCoordinator::install_with(Forwarding::Disabled).unwrap(),
        ))
    }

    /// Environment logging into `target`, bound to `synchronizer`.
    pub fn environment(target: RecordingTarget, synchronizer: &FakeSynchronizer) -> ExecEnvironment {
        ExecEnvironment::new(
            Logger::new(target),
            runner(),
            synchronizer.clone().load(),
            OptionMap::new(),
        )
    }

    pub fn scheduling(rule: &str, options: &[(&str, &str)]) -> Scheduling {
        Scheduling::new(
            rule,
            options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<OptionMap>(),
            None,
        )
    }

    /// What the innermost stage of a test pipeline does on `execute`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Behavior {
        Succeed,
        Fail,
        Error,
        ProcessFailure,
        Panic,
        /// Receives SIGTERM in-process, then succeeds.
        Signaled,
    }

    /// Scheduler stage recording the calls it receives.
    pub struct RecordingScheduler {
        pub behavior: Behavior,
        pub runs: Mutex<Vec<Vec<String>>>,
        pub checks: Mutex<Vec<Vec<String>>>,
        pub executions: Mutex<Vec<String>>,
    }

    impl RecordingScheduler {
        pub fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                runs: Mutex::default(),
                checks: Mutex::default(),
                executions: Mutex::default(),
            })
        }
    }

    fn names(schedulings: &SchedulingSet) -> Vec<String> {
        schedulings
            .rule_names()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    impl Scheduler for Arc<RecordingScheduler> {
        fn name(&self) -> &str {
            "recording"
        }

        fn run(&self, schedulings: SchedulingSet) -> Result<()> {
            self.runs.lock().unwrap().push(names(&schedulings));
            Ok(())
        }

        fn check(&self, schedulings: SchedulingSet) -> Result<Vec<String>> {
            self.checks.lock().unwrap().push(names(&schedulings));
            Ok(Vec::new())
        }

        fn execute(&self, env: &ExecEnvironment, scheduling: &Scheduling) -> Result<bool> {
            self.executions
                .lock()
                .unwrap()
                .push(scheduling.rule_name().clone());
            env.logger().write_output(b"inner output\n")?;
            match self.behavior {
                Behavior::Succeed => Ok(true),
                Behavior::Fail => Ok(false),
                Behavior::Error => Err(Error::invalid_config("inner stage broke")),
                Behavior::ProcessFailure => Err(Error::external_process_failure(
                    "sync-tool",
                    vec!["sync".to_string()],
                    2,
                )),
                Behavior::Panic => panic!("inner stage panicked"),
                Behavior::Signaled => {
                    nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM)?;
                    Ok(true)
                }
            }
        }

        fn next_execution_time(&self, _: &Scheduling) -> Result<Option<DateTime<Utc>>> {
            Ok(None)
        }

        fn available_options(&self) -> Vec<OptionInfo> {
            vec![OptionInfo::string("Inner")]
        }

        fn available_shared_options(&self) -> Vec<OptionInfo> {
            Vec::new()
        }
    }
}
