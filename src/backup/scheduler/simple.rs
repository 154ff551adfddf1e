use crate::backup::options::{parse_time_delta, OptionInfo, OptionType};
use crate::backup::process::ProcessRunner;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::rule::{Scheduling, SchedulingSet};
use crate::backup::scheduler::{PluginCapabilities, SchedulerPlugin};
use chrono::{DateTime, Utc};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const INTERVAL_OPTION: &str = "Interval";
pub const CRON_OPTION: &str = "Cron";

/// Exit code of `execute-rule` when the rule is already running.
pub const LOCK_HELD_EXIT_CODE: i32 = 4;

/// Command line that executes one rule in a process of its own.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    program: PathBuf,
    config: PathBuf,
}

impl Dispatcher {
    pub fn new<P: Into<PathBuf>, C: Into<PathBuf>>(program: P, config: C) -> Self {
        Self {
            program: program.into(),
            config: config.into(),
        }
    }

    /// Re-invokes the running binary with `config`.
    pub fn current_exe<C: Into<PathBuf>>(config: C) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config))
    }

    fn args(&self, rule: &str) -> Vec<OsString> {
        vec![
            "--config".into(),
            self.config.clone().into(),
            "execute-rule".into(),
            rule.into(),
        ]
    }
}

enum Timing<'a> {
    Interval(Duration),
    Cron(&'a str),
}

/// Built-in scheduler running each due rule in turn, where due means its
/// `Interval` has passed or its `Cron` expression matched since the last
/// execution.
pub struct SimpleScheduler {
    name: String,
    default_interval: Duration,
    dispatcher: Dispatcher,
    runner: ProcessRunner,
}

impl SimpleScheduler {
    pub fn new<S: Into<String>>(
        name: S,
        default_interval: Duration,
        dispatcher: Dispatcher,
        runner: ProcessRunner,
    ) -> Self {
        Self {
            name: name.into(),
            default_interval,
            dispatcher,
            runner,
        }
    }

    fn timing<'a>(&self, scheduling: &'a Scheduling) -> std::result::Result<Timing<'a>, String> {
        match (
            scheduling.option(INTERVAL_OPTION),
            scheduling.option(CRON_OPTION),
        ) {
            (Some(_), Some(_)) => Err(format!(
                "{INTERVAL_OPTION} and {CRON_OPTION} are mutually exclusive"
            )),
            (Some(interval), None) => parse_time_delta(interval)
                .map(Timing::Interval)
                .ok_or_else(|| format!("invalid {INTERVAL_OPTION} {interval:?}")),
            (None, Some(cron)) => cron_parser::parse(cron, &Utc::now())
                .map(|_| Timing::Cron(cron))
                .map_err(|e| format!("invalid {CRON_OPTION} {cron:?}: {e}")),
            (None, None) => Ok(Timing::Interval(self.default_interval)),
        }
    }

    fn is_due(&self, scheduling: &Scheduling, now: &DateTime<Utc>) -> Result<bool> {
        if scheduling.last_execution_time().is_none() {
            return Ok(true);
        }
        Ok(self
            .next_execution_time(scheduling)?
            .map_or(true, |next| next <= *now))
    }
}

impl SchedulerPlugin for SimpleScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            execute: false,
            next_execution_time: true,
        }
    }

    fn run(&self, schedulings: SchedulingSet) -> Result<()> {
        let now = Utc::now();
        let mut errors = Vec::new();
        for scheduling in schedulings.iter() {
            let rule = scheduling.rule_name();
            if !self.is_due(scheduling, &now)? {
                continue;
            }
            info!("Dispatching rule {rule:?}");
            let args = self.dispatcher.args(rule);
            match self.runner.run_inherited(&self.dispatcher.program, &args)? {
                0 => {}
                LOCK_HELD_EXIT_CODE => warn!("Rule {rule:?} is still running, skipped"),
                exit_code => errors.push(Error::external_process_failure(
                    self.dispatcher.program.to_string_lossy(),
                    args.iter()
                        .map(|a| a.to_string_lossy().into_owned())
                        .collect::<Vec<_>>(),
                    exit_code,
                )),
            }
        }
        convert_error_vec(errors)
    }

    fn check(&self, schedulings: &SchedulingSet) -> Result<Vec<String>> {
        Ok(schedulings
            .iter()
            .filter_map(|s| {
                self.timing(s)
                    .err()
                    .map(|e| format!("in rule {}: {e}", s.rule_name()))
            })
            .collect())
    }

    fn next_execution_time(&self, scheduling: &Scheduling) -> Result<Option<DateTime<Utc>>> {
        let Some(last) = scheduling.last_execution_time() else {
            return Ok(Some(Utc::now()));
        };
        match self.timing(scheduling).map_err(Error::invalid_config)? {
            Timing::Interval(interval) => {
                let interval = chrono::Duration::from_std(interval)
                    .map_err(|e| Error::invalid_config(e.to_string()))?;
                Ok(Some(*last + interval))
            }
            Timing::Cron(cron) => Ok(Some(
                cron_parser::parse(cron, last)
                    .map_err(|e| Error::invalid_config(e.to_string()))?,
            )),
        }
    }

    fn available_options(&self) -> Vec<OptionInfo> {
        vec![
            OptionInfo::new(INTERVAL_OPTION, OptionType::TimeDelta),
            OptionInfo::string(CRON_OPTION),
        ]
    }
}
