//! Dispatch of a batch of rules to their schedulers.
//!
//! Rules are grouped by the scheduler instance they are bound to. The whole
//! batch is validated before any scheduler is called; after that every
//! group is handled on its own, so a problem in one group does not keep the
//! others from running.

use crate::backup::execution_log::PersistentExecutionLog;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::AddMsg;
use crate::backup::rule::{Rule, Scheduling, SchedulingSet};
use crate::backup::scheduler::Scheduler;
use itertools::Itertools;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Validation of a whole batch of rules. Returns the problems found.
pub trait RuleSetValidator: Send + Sync {
    fn validate(&self, rules: &[&Rule]) -> Result<Vec<String>>;
}

struct SchedulerGroup {
    scheduler: Arc<dyn Scheduler>,
    rules: Vec<Rule>,
}

fn same_instance(a: &Arc<dyn Scheduler>, b: &Arc<dyn Scheduler>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

pub struct RuleSet {
    log_dir: PathBuf,
    groups: Vec<SchedulerGroup>,
}

impl RuleSet {
    /// Groups `rules` by scheduler instance, keeping first-seen order.
    pub fn new<P: Into<PathBuf>>(log_dir: P, rules: Vec<Rule>) -> Self {
        let mut groups: Vec<SchedulerGroup> = Vec::new();
        for rule in rules {
            match groups
                .iter_mut()
                .find(|g| same_instance(&g.scheduler, rule.scheduler()))
            {
                Some(group) => group.rules.push(rule),
                None => groups.push(SchedulerGroup {
                    scheduler: rule.scheduler().clone(),
                    rules: vec![rule],
                }),
            }
        }
        Self {
            log_dir: log_dir.into(),
            groups,
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.groups.iter().flat_map(|g| g.rules.iter())
    }

    fn log(&self, rule: &Rule) -> PersistentExecutionLog {
        PersistentExecutionLog::new(&self.log_dir, rule.name())
    }

    fn schedulings(&self, group: &SchedulerGroup) -> Result<SchedulingSet> {
        group
            .rules
            .iter()
            .map(|rule| -> Result<Scheduling> {
                Ok(rule.scheduling(self.log(rule).last_execution_time()?))
            })
            .try_collect()
    }

    pub fn validate(&self, validator: &dyn RuleSetValidator) -> Result<()> {
        let rules = self.rules().collect_vec();
        let errors = validator.validate(&rules)?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::validation_failure(errors))
        }
    }

    fn group_errors(&self, group: &SchedulerGroup) -> Result<Option<Error>> {
        let mut errors = group.scheduler.check(self.schedulings(group)?)?;
        errors.extend(group.scheduler.flush_check()?);
        Ok((!errors.is_empty())
            .then(|| Error::scheduler_plugin(group.scheduler.name(), errors)))
    }

    /// Problems the schedulers themselves report, one error per scheduler.
    pub fn scheduler_errors(&self) -> Result<Vec<Error>> {
        let mut errors = Vec::new();
        for group in &self.groups {
            errors.extend(self.group_errors(group)?);
        }
        Ok(errors)
    }

    pub fn check(&self, validator: &dyn RuleSetValidator) -> Result<()> {
        self.validate(validator)?;
        convert_error_vec(self.scheduler_errors()?)
    }

    fn dispatch(&self, group: &SchedulerGroup) -> Result<()> {
        if let Some(error) = self.group_errors(group)? {
            return Err(error);
        }
        let mut executing = Vec::new();
        for rule in &group.rules {
            if self.log(rule).is_executing()? {
                executing.push(Error::lock_held(rule.name().as_str()));
            }
        }
        convert_error_vec(executing)?;

        let schedulings = self.schedulings(group)?;
        info!(
            "Scheduling {} with {}",
            schedulings.rule_names().join(", "),
            group.scheduler.name()
        );
        group.scheduler.run(schedulings)?;
        group.scheduler.flush_run()
    }

    /// Validates the batch, then runs every group whose rules are all idle.
    pub fn schedule(&self, validator: &dyn RuleSetValidator) -> Result<()> {
        self.validate(validator)?;
        let mut errors = Vec::new();
        for group in &self.groups {
            debug!("Dispatching group of {}", group.scheduler.name());
            if let Err(e) = self.dispatch(group) {
                if e.signal_number().is_some() {
                    return Err(e);
                }
                errors.push(e.add_msg(format!(
                    "Scheduling with {} failed",
                    group.scheduler.name()
                )));
            }
        }
        convert_error_vec(errors)
    }
}
