use crate::backup::exec_env::ExecEnvironment;
use crate::backup::logger::sinks::{SinkFactory, LOG_FILE_OPTION, LOG_STDERR_OPTION, SYSLOG_OPTION};
use crate::backup::logger::{FanOut, LineBuffered, LogTarget, Logger, Severity};
use crate::backup::options::{bool_option, OptionInfo, OptionType};
use crate::backup::result_error::panic_message;
use crate::backup::result_error::result::Result;
use crate::backup::rule::{Scheduling, SchedulingSet};
use crate::backup::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const LOG_SUCCESS_OPTION: &str = "LogSuccess";

/// Sends execution output to the execution record plus the sinks the rule's
/// options select, and reports how the execution ended.
pub struct LoggingScheduler {
    inner: Box<dyn Scheduler>,
    sinks: Arc<dyn SinkFactory>,
}

impl LoggingScheduler {
    pub fn new(inner: Box<dyn Scheduler>, sinks: Arc<dyn SinkFactory>) -> Self {
        Self { inner, sinks }
    }

    fn fan_out(&self, env: &ExecEnvironment, scheduling: &Scheduling) -> Result<Logger> {
        let mut targets: Vec<Box<dyn LogTarget>> = vec![Box::new(env.logger().clone())];
        targets.extend(self.sinks.sinks_for(scheduling)?);
        Ok(Logger::new(LineBuffered::new(FanOut::new(targets))))
    }
}

impl Scheduler for LoggingScheduler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(&self, schedulings: SchedulingSet) -> Result<()> {
        self.inner.run(schedulings)
    }

    fn check(&self, schedulings: SchedulingSet) -> Result<Vec<String>> {
        self.inner.check(schedulings)
    }

    fn execute(&self, env: &ExecEnvironment, scheduling: &Scheduling) -> Result<bool> {
        let rule = scheduling.rule_name();
        let log_success = bool_option(scheduling.options(), LOG_SUCCESS_OPTION, false)?;
        let logger = self.fan_out(env, scheduling)?;
        let env = env.with_logger(logger.clone());

        let outcome = catch_unwind(AssertUnwindSafe(|| self.inner.execute(&env, scheduling)));
        let reported = match &outcome {
            Ok(Ok(true)) => {
                info!("Execution of rule {rule:?} succeeded");
                if log_success {
                    logger.log(Severity::Notice, format!("Execution of rule {rule} succeeded"))
                } else {
                    Ok(())
                }
            }
            Ok(Ok(false)) => {
                error!("Execution of rule {rule:?} failed");
                logger.log(Severity::Err, format!("Execution of rule {rule} failed"))
            }
            Ok(Err(e)) if e.is_internal() => {
                error!("Internal error in rule {rule:?}: {e:?}");
                logger.log(
                    Severity::Err,
                    format!(
                        "Internal error in rule {rule}: {e}\nTrace:\n{}",
                        indent::indent_all_with("  ", format!("{e:#?}"))
                    ),
                )
            }
            Ok(Err(e)) => {
                error!("Execution of rule {rule:?} failed: {e}");
                logger.log(Severity::Err, format!("Execution of rule {rule} failed: {e}"))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Internal error in rule {rule:?}: {message}");
                logger.log(
                    Severity::Err,
                    format!("Internal error in rule {rule}: {message}"),
                )
            }
        }
        .and_then(|_| logger.flush());
        if let Err(e) = reported {
            warn!("Logging the end of rule {rule:?} failed: {e}");
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => resume_unwind(payload),
        }
    }

    fn next_execution_time(&self, scheduling: &Scheduling) -> Result<Option<DateTime<Utc>>> {
        self.inner.next_execution_time(scheduling)
    }

    fn available_options(&self) -> Vec<OptionInfo> {
        let mut options = self.inner.available_options();
        options.extend([
            OptionInfo::new(LOG_FILE_OPTION, OptionType::File),
            OptionInfo::bool(LOG_STDERR_OPTION),
            OptionInfo::bool(SYSLOG_OPTION),
            OptionInfo::bool(LOG_SUCCESS_OPTION),
        ]);
        options
    }

    fn available_shared_options(&self) -> Vec<OptionInfo> {
        self.inner.available_shared_options()
    }
}
