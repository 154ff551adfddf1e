use crate::backup::location::Location;
use crate::backup::options::OptionMap;
use crate::backup::scheduler::Scheduler;
use crate::backup::synchronizer::Synchronizer;
use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::{Deref, From};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Named binding of one scheduler and one synchronizer to a list of
/// locations. Scheduler and synchronizer instances are shared between rules.
#[derive(Clone, Builder, Getters, CopyGetters)]
pub struct Rule {
    #[builder(into)]
    #[getset(get = "pub")]
    name: String,
    #[builder(default = true)]
    #[getset(get_copy = "pub")]
    enabled: bool,
    #[getset(get = "pub")]
    scheduler: Arc<dyn Scheduler>,
    #[getset(get = "pub")]
    synchronizer: Arc<Synchronizer>,
    #[builder(default)]
    #[getset(get = "pub")]
    locations: Vec<Location>,
    #[builder(default)]
    #[getset(get = "pub")]
    options: OptionMap,
    #[builder(default)]
    #[getset(get = "pub")]
    scheduler_options: OptionMap,
    #[builder(default)]
    #[getset(get = "pub")]
    synchronizer_options: OptionMap,
}

impl Debug for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("scheduler", &self.scheduler.name())
            .field("synchronizer", &self.synchronizer.name())
            .field("locations", &self.locations)
            .finish()
    }
}

impl Rule {
    /// Synchronizer options with every bound location spelled out as
    /// `LocN` options.
    pub fn resolved_synchronizer_options(&self) -> OptionMap {
        let mut options = self.synchronizer_options.clone();
        for (index, location) in self.locations.iter().enumerate() {
            options.extend(location.to_options(&format!("Loc{}", index + 1)));
        }
        options
    }

    /// Rule options overlaid with scheduler options.
    pub fn scheduling_options(&self) -> OptionMap {
        let mut options = self.options.clone();
        options.extend(
            self.scheduler_options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        options
    }

    pub fn scheduling(&self, last_execution_time: Option<DateTime<Utc>>) -> Scheduling {
        Scheduling::new(
            self.name.clone(),
            self.scheduling_options(),
            last_execution_time,
        )
    }

    pub fn written_locations(&self) -> Vec<&Location> {
        self.locations_where(true)
    }

    pub fn read_locations(&self) -> Vec<&Location> {
        self.locations_where(false)
    }

    fn locations_where(&self, written_to: bool) -> Vec<&Location> {
        self.locations
            .iter()
            .zip(self.synchronizer.ports().iter())
            .filter(|(_, port)| port.is_written_to() == written_to)
            .map(|(location, _)| location)
            .collect_vec()
    }
}

/// Per-dispatch view of a rule.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Scheduling {
    rule_name: String,
    options: OptionMap,
    last_execution_time: Option<DateTime<Utc>>,
}

impl Scheduling {
    pub fn new<S: Into<String>>(
        rule_name: S,
        options: OptionMap,
        last_execution_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            rule_name: rule_name.into(),
            options,
            last_execution_time,
        }
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }
}

/// Ordered group of schedulings routed to one scheduler instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deref, From)]
pub struct SchedulingSet(Vec<Scheduling>);

impl SchedulingSet {
    pub fn new(schedulings: Vec<Scheduling>) -> Self {
        Self(schedulings)
    }

    pub fn into_inner(self) -> Vec<Scheduling> {
        self.0
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.0.iter().map(|s| s.rule_name.as_str()).collect_vec()
    }

    /// Value of an option that every scheduling setting it must agree on.
    pub fn shared_option(&self, name: &str) -> std::result::Result<Option<&str>, String> {
        let values = self
            .0
            .iter()
            .filter_map(|s| s.option(name).map(|v| (s.rule_name.as_str(), v)))
            .collect_vec();
        match values.iter().map(|(_, v)| *v).unique().count() {
            0 => Ok(None),
            1 => Ok(Some(values[0].1)),
            _ => Err(format!(
                "shared option {name} has conflicting values: {}",
                values
                    .iter()
                    .map(|(rule, v)| format!("{rule}={v:?}"))
                    .join(", ")
            )),
        }
    }

    /// Runs `check` on every scheduling that sets `name`, returning error
    /// messages attributed to the rule.
    pub fn check_option<F>(&self, name: &str, check: F) -> Vec<String>
    where
        F: Fn(&str) -> std::result::Result<(), String>,
    {
        self.0
            .iter()
            .filter_map(|s| {
                s.option(name)
                    .and_then(|value| check(value).err())
                    .map(|e| format!("in rule {}: {e}", s.rule_name))
            })
            .collect_vec()
    }
}

impl IntoIterator for SchedulingSet {
    type Item = Scheduling;
    type IntoIter = std::vec::IntoIter<Scheduling>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Scheduling> for SchedulingSet {
    fn from_iter<T: IntoIterator<Item = Scheduling>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
