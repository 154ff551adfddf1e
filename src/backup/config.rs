//! YAML configuration: directories, scheduler and synchronizer instances,
//! and the rules binding them.

use crate::backup::function_path;
use crate::backup::location::Location;
use crate::backup::logger::sinks::{SinkFactory, StandardSinks};
use crate::backup::options::OptionMap;
use crate::backup::process::ProcessRunner;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::rule::Rule;
use crate::backup::scheduler::simple::{Dispatcher, SimpleScheduler};
use crate::backup::scheduler::{build_pipeline, Scheduler, SchedulerPlugin};
use crate::backup::synchronizer::executable::ExecutableSynchronizer;
use crate::backup::synchronizer::Synchronizer;
use crate::backup::validate::{validate_executable, validate_rule_name, validate_writable_dir};
use function_name::named;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use validator::{Validate, ValidationError, ValidationErrors};

fn default_syslog_ident() -> String {
    "k-dispatch".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_references))]
pub struct Settings {
    #[validate(custom(function = validate_writable_dir))]
    pub log_dir: PathBuf,
    #[validate(custom(function = validate_writable_dir))]
    pub lock_dir: PathBuf,
    #[serde(default = "default_syslog_ident")]
    pub syslog_ident: String,
    #[validate(nested)]
    pub schedulers: Vec<SchedulerConfig>,
    #[validate(nested)]
    pub synchronizers: Vec<SynchronizerConfig>,
    #[validate(nested)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum SchedulerConfig {
    Simple(SimpleSchedulerConfig),
}

impl Validate for SchedulerConfig {
    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        match self {
            SchedulerConfig::Simple(simple) => simple.validate(),
        }
    }
}

impl SchedulerConfig {
    pub fn name(&self) -> &str {
        match self {
            SchedulerConfig::Simple(simple) => &simple.name,
        }
    }

    fn build_plugin(
        &self,
        config_path: &Path,
        runner: &ProcessRunner,
    ) -> Result<Arc<dyn SchedulerPlugin>> {
        match self {
            SchedulerConfig::Simple(simple) => Ok(Arc::new(SimpleScheduler::new(
                simple.name.as_str(),
                simple.default_interval,
                Dispatcher::current_exe(config_path)?,
                runner.clone(),
            ))),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct SimpleSchedulerConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub default_interval: Duration,
}

#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct SynchronizerConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(custom(function = validate_executable))]
    pub executable: PathBuf,
}

#[serde_as]
#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    #[validate(custom(function = validate_rule_name))]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub scheduler: String,
    pub synchronizer: String,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub options: OptionMap,
    #[serde(default)]
    pub scheduler_options: OptionMap,
    #[serde(default)]
    pub synchronizer_options: OptionMap,
}

fn duplicates<'a, I: Iterator<Item = &'a str>>(names: I) -> Vec<&'a str> {
    names.duplicates().collect_vec()
}

fn validate_references(settings: &Settings) -> std::result::Result<(), ValidationError> {
    let mut problems = Vec::new();
    for (kind, dups) in [
        (
            "scheduler",
            duplicates(settings.schedulers.iter().map(SchedulerConfig::name)),
        ),
        (
            "synchronizer",
            duplicates(settings.synchronizers.iter().map(|s| s.name.as_str())),
        ),
        (
            "rule",
            duplicates(settings.rules.iter().map(|r| r.name.as_str())),
        ),
    ] {
        problems.extend(dups.into_iter().map(|name| format!("duplicate {kind} {name:?}")));
    }
    for rule in &settings.rules {
        if !settings.schedulers.iter().any(|s| s.name() == rule.scheduler) {
            problems.push(format!(
                "rule {:?} refers to unknown scheduler {:?}",
                rule.name, rule.scheduler
            ));
        }
        if !settings
            .synchronizers
            .iter()
            .any(|s| s.name == rule.synchronizer)
        {
            problems.push(format!(
                "rule {:?} refers to unknown synchronizer {:?}",
                rule.name, rule.synchronizer
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new("InvalidReference").with_message(problems.join("; ").into()))
    }
}

/// Binds location N to port N of `synchronizer`.
fn bind_locations(rule: &RuleConfig, synchronizer: &Synchronizer) -> Result<Vec<Location>> {
    let locations = rule.locations.clone();
    let ports = synchronizer.ports();
    if locations.len() != ports.len() {
        return Err(Error::invalid_config(format!(
            "rule {:?} has {} locations but synchronizer {:?} has {} ports",
            rule.name,
            locations.len(),
            synchronizer.name(),
            ports.len()
        )));
    }

    let errors = locations
        .iter()
        .zip(ports)
        .enumerate()
        .filter(|(_, (location, port))| !port.accepts(location))
        .map(|(index, (location, port))| {
            Error::invalid_config(format!(
                "location {location} of rule {:?} uses protocol {:?}, port {} accepts {:?}",
                rule.name,
                location.protocol(),
                index + 1,
                port.protocols()
            ))
        })
        .collect_vec();
    convert_error_vec(errors)?;
    Ok(locations)
}

impl Settings {
    #[named]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, Settings>(f).map_err(Error::from))
            .add_msg(format!("Parse YAML config failed: {path:?}"))?;
        settings
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {path:?}"))
            .add_fn_name(function_path!())?;
        Ok(settings)
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect_vec()
    }

    /// Builds the rules named in `names`. Schedulers and synchronizers are
    /// instantiated once and shared by the rules referring to them; only the
    /// ones actually referred to are loaded.
    #[named]
    pub fn build_rules(
        &self,
        names: &[&str],
        config_path: &Path,
        runner: &ProcessRunner,
        dry: bool,
    ) -> Result<Vec<Rule>> {
        let sinks: Arc<dyn SinkFactory> = Arc::new(StandardSinks::new(self.syslog_ident.as_str()));
        let mut schedulers: HashMap<&str, Arc<dyn Scheduler>> = HashMap::new();
        let mut synchronizers: HashMap<&str, Arc<Synchronizer>> = HashMap::new();

        let mut rules = Vec::new();
        for name in names {
            let config = self
                .rules
                .iter()
                .find(|r| r.name == *name)
                .ok_or_else(|| Error::no_such_rule(*name))?;

            let scheduler = match schedulers.get(config.scheduler.as_str()) {
                Some(scheduler) => scheduler.clone(),
                None => {
                    let scheduler_config = self
                        .schedulers
                        .iter()
                        .find(|s| s.name() == config.scheduler)
                        .ok_or_else(|| {
                            Error::invalid_config(format!(
                                "unknown scheduler {:?}",
                                config.scheduler
                            ))
                        })?;
                    let scheduler = build_pipeline(
                        scheduler_config.build_plugin(config_path, runner)?,
                        dry,
                        sinks.clone(),
                        runner.clone(),
                    );
                    schedulers.insert(scheduler_config.name(), scheduler.clone());
                    scheduler
                }
            };

            let synchronizer = match synchronizers.get(config.synchronizer.as_str()) {
                Some(synchronizer) => synchronizer.clone(),
                None => {
                    let synchronizer_config = self
                        .synchronizers
                        .iter()
                        .find(|s| s.name == config.synchronizer)
                        .ok_or_else(|| {
                            Error::invalid_config(format!(
                                "unknown synchronizer {:?}",
                                config.synchronizer
                            ))
                        })?;
                    let synchronizer = Arc::new(Synchronizer::load(
                        synchronizer_config.name.as_str(),
                        Box::new(ExecutableSynchronizer::new(
                            &synchronizer_config.executable,
                            runner.clone(),
                        )),
                    )?);
                    synchronizers.insert(synchronizer_config.name.as_str(), synchronizer.clone());
                    synchronizer
                }
            };

            let locations = bind_locations(config, &synchronizer)
                .add_msg(format!("Resolving locations of rule {name:?} failed"))
                .add_fn_name(function_path!())?;
            debug!("Built rule {name:?} with locations {locations:?}");
            rules.push(
                Rule::builder()
                    .name(config.name.as_str())
                    .enabled(config.enabled)
                    .scheduler(scheduler)
                    .synchronizer(synchronizer)
                    .locations(locations)
                    .options(config.options.clone())
                    .scheduler_options(config.scheduler_options.clone())
                    .synchronizer_options(config.synchronizer_options.clone())
                    .build(),
            );
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::scheduler::testing::runner;
    use crate::backup::synchronizer::testing::write_script;
    use serial_test::serial;
    use tempfile::TempDir;

    fn write_config(dir: &Path, rules: &str) -> PathBuf {
        let synchronizer = write_script(dir, "exit 200");
        let path = dir.join("k-dispatch.yaml");
        std::fs::write(
            &path,
            format!(
                r#"
log_dir: {log:?}
lock_dir: {lock:?}
schedulers:
  - type: simple
    name: daily
    default_interval: 1day
synchronizers:
  - name: sh
    executable: {synchronizer:?}
rules:
{rules}
"#,
                log = dir.join("logs"),
                lock = dir.join("locks"),
            ),
        )
        .unwrap();
        path
    }

    #[test]
    #[serial]
    fn test_load_and_build() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            dir.path(),
            r#"
  - name: home
    scheduler: daily
    synchronizer: sh
    locations: ["/home/user", "file:///backup/home"]
    scheduler_options: { Interval: 12h }
  - name: etc
    enabled: false
    scheduler: daily
    synchronizer: sh
    locations: ["/etc", "/backup/etc"]
"#,
        );

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.syslog_ident, "k-dispatch");
        assert!(dir.path().join("logs").is_dir());
        assert_eq!(settings.rule_names(), vec!["home", "etc"]);

        let rules = settings
            .build_rules(&["home", "etc"], &path, &runner(), false)
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert!(Arc::ptr_eq(rules[0].synchronizer(), rules[1].synchronizer()));
        assert!(!rules[1].enabled());
        assert_eq!(
            rules[0].written_locations(),
            vec![&Location::local("/backup/home")]
        );
        assert_eq!(
            rules[0].resolved_synchronizer_options().get("Loc1Path"),
            Some(&"/home/user".to_string())
        );
    }

    #[test]
    fn test_unknown_references_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            dir.path(),
            r#"
  - name: home
    scheduler: hourly
    synchronizer: rsync
"#,
        );
        let error = Settings::load(&path).unwrap_err().to_string();
        assert!(error.contains("unknown scheduler \"hourly\""));
        assert!(error.contains("unknown synchronizer \"rsync\""));
    }

    #[test]
    #[serial]
    fn test_location_count_must_match_ports() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            dir.path(),
            r#"
  - name: home
    scheduler: daily
    synchronizer: sh
    locations: ["/home/user"]
"#,
        );
        let settings = Settings::load(&path).unwrap();
        let error = settings
            .build_rules(&["home"], &path, &runner(), false)
            .unwrap_err();
        assert!(error.to_string().contains("has 1 locations but"));
    }

    #[test]
    #[serial]
    fn test_protocol_must_be_accepted() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            dir.path(),
            r#"
  - name: home
    scheduler: daily
    synchronizer: sh
    locations: ["/home/user", "ssh://backup@nas/srv"]
"#,
        );
        let settings = Settings::load(&path).unwrap();
        let error = settings
            .build_rules(&["home"], &path, &runner(), false)
            .unwrap_err();
        assert!(error.to_string().contains("uses protocol \"ssh\""));
    }
}
