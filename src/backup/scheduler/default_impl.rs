use crate::backup::exec_env::ExecEnvironment;
use crate::backup::options::OptionInfo;
use crate::backup::result_error::result::Result;
use crate::backup::rule::{Scheduling, SchedulingSet};
use crate::backup::scheduler::{PluginCapabilities, Scheduler, SchedulerPlugin};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Innermost stage: calls the plugin, or the documented default for calls
/// the plugin does not declare. Without `execute` the rule's synchronizer is
/// run; without `next_execution_time` the time is unknown.
pub struct DefaultImplScheduler {
    plugin: Arc<dyn SchedulerPlugin>,
    capabilities: PluginCapabilities,
}

impl DefaultImplScheduler {
    pub fn new(plugin: Arc<dyn SchedulerPlugin>) -> Self {
        let capabilities = plugin.capabilities();
        Self {
            plugin,
            capabilities,
        }
    }
}

impl Scheduler for DefaultImplScheduler {
    fn name(&self) -> &str {
        self.plugin.name()
    }

    fn run(&self, schedulings: SchedulingSet) -> Result<()> {
        self.plugin.run(schedulings)
    }

    fn check(&self, schedulings: SchedulingSet) -> Result<Vec<String>> {
        self.plugin.check(&schedulings)
    }

    fn execute(&self, env: &ExecEnvironment, scheduling: &Scheduling) -> Result<bool> {
        if self.capabilities.execute {
            self.plugin.execute(env, scheduling)
        } else {
            env.run_synchronizer().map(|_| true)
        }
    }

    fn next_execution_time(&self, scheduling: &Scheduling) -> Result<Option<DateTime<Utc>>> {
        if self.capabilities.next_execution_time {
            self.plugin.next_execution_time(scheduling)
        } else {
            Ok(None)
        }
    }

    fn available_options(&self) -> Vec<OptionInfo> {
        self.plugin.available_options()
    }

    fn available_shared_options(&self) -> Vec<OptionInfo> {
        self.plugin.available_shared_options()
    }
}
