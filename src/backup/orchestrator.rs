//! Wires configuration, locks, execution logs and schedulers together for
//! each command line action.

use crate::backup::config::Settings;
use crate::backup::exec_env::ExecEnvironment;
use crate::backup::execution::Execution;
use crate::backup::execution_log::PersistentExecutionLog;
use crate::backup::function_path;
use crate::backup::location::Location;
use crate::backup::logger::sinks::StderrSink;
use crate::backup::logger::{FanOut, LineBuffered, LogTarget, Logger};
use crate::backup::mutex::MutexManager;
use crate::backup::process::ProcessRunner;
use crate::backup::queries::{versions_of, PathMatch, RuleVersions};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::rule::Rule;
use crate::backup::rule_validation::DefaultValidator;
use crate::backup::rules_coordinator::RuleSet;
use chrono::{DateTime, Utc};
use function_name::named;
use globset::Glob;
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct Orchestrator {
    config_path: PathBuf,
    settings: Settings,
    runner: ProcessRunner,
    mutexes: MutexManager,
}

impl Orchestrator {
    pub fn new<P: Into<PathBuf>>(config_path: P, settings: Settings, runner: ProcessRunner) -> Self {
        let mutexes = MutexManager::new(&settings.lock_dir);
        Self {
            config_path: config_path.into(),
            settings,
            runner,
            mutexes,
        }
    }

    pub fn load<P: Into<PathBuf>>(config_path: P, runner: ProcessRunner) -> Result<Self> {
        let config_path = config_path.into();
        let settings = Settings::load(&config_path)?;
        Ok(Self::new(config_path, settings, runner))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn log(&self, rule: &str) -> PersistentExecutionLog {
        PersistentExecutionLog::new(&self.settings.log_dir, rule)
    }

    fn known_rule<'a>(&'a self, name: &str) -> Result<&'a str> {
        self.settings
            .rule_names()
            .into_iter()
            .find(|n| *n == name)
            .ok_or_else(|| Error::no_such_rule(name))
    }

    fn build(&self, names: &[&str], dry: bool) -> Result<Vec<Rule>> {
        self.settings
            .build_rules(names, &self.config_path, &self.runner, dry)
    }

    fn rule(&self, name: &str) -> Result<Rule> {
        let name = self.known_rule(name)?;
        self.build(&[name], false)?
            .pop()
            .ok_or_else(|| Error::no_such_rule(name))
    }

    /// Names of the configured rules matching any of `patterns`, in
    /// configuration order; all rules without patterns. Every pattern must
    /// match at least one rule.
    pub fn select(&self, patterns: &[String]) -> Result<Vec<&str>> {
        let names = self.settings.rule_names();
        if patterns.is_empty() {
            return Ok(names);
        }
        let matchers = patterns
            .iter()
            .map(|p| Glob::new(p).map(|g| g.compile_matcher()))
            .try_collect::<_, Vec<_>, _>()?;

        let unmatched = patterns
            .iter()
            .zip(&matchers)
            .filter(|(_, matcher)| !names.iter().any(|n| matcher.is_match(n)))
            .map(|(pattern, _)| Error::no_such_rule(pattern.as_str()))
            .collect_vec();
        convert_error_vec(unmatched)?;

        Ok(names
            .into_iter()
            .filter(|n| matchers.iter().any(|m| m.is_match(n)))
            .collect_vec())
    }

    /// Runs one execution of `name` through its scheduler pipeline. Returns
    /// [`Error::LockHeld`] at once if the rule is already running.
    #[named]
    pub fn execute_rule(&self, name: &str) -> Result<()> {
        let name = self.known_rule(name)?;
        let _lock = self.mutexes.lock(name)?;
        let rule = self.rule(name)?;
        let log = self.log(name);
        let scheduling = rule.scheduling(log.last_execution_time()?);
        info!("Executing rule {name:?}");

        let succeeded = log
            .write_execution(|logger| {
                let env = ExecEnvironment::new(
                    logger.clone(),
                    self.runner.clone(),
                    rule.synchronizer().clone(),
                    rule.resolved_synchronizer_options(),
                );
                let outcome = rule.scheduler().execute(&env, &scheduling);
                self.runner.signals().observe(outcome)
            })
            .add_msg(format!("Execution of rule {name:?} failed"))
            .add_fn_name(function_path!())?;
        if succeeded {
            Ok(())
        } else {
            Err(Error::execution_failed(name))
        }
    }

    /// Runs the synchronizer of `name` directly, mirroring its output to
    /// stderr. Still takes the rule's lock and writes an execution record.
    #[named]
    pub fn sync(&self, name: &str) -> Result<()> {
        let name = self.known_rule(name)?;
        let _lock = self.mutexes.lock(name)?;
        let rule = self.rule(name)?;
        info!("Synchronizing rule {name:?}");

        self.log(name)
            .write_execution(|logger| {
                let targets: Vec<Box<dyn LogTarget>> =
                    vec![Box::new(logger.clone()), Box::new(StderrSink)];
                let logger = Logger::new(LineBuffered::new(FanOut::new(targets)));
                let outcome = rule
                    .synchronizer()
                    .sync(&rule.resolved_synchronizer_options(), &logger);
                self.runner.signals().observe(outcome)?;
                logger.flush()?;
                Ok(true)
            })
            .add_msg(format!("Synchronizing rule {name:?} failed"))
            .add_fn_name(function_path!())?;
        Ok(())
    }

    pub fn schedule(&self, patterns: &[String], dry: bool) -> Result<()> {
        let names = self.select(patterns)?;
        RuleSet::new(&self.settings.log_dir, self.build(&names, dry)?).schedule(&DefaultValidator)
    }

    pub fn check(&self, patterns: &[String]) -> Result<()> {
        let names = self.select(patterns)?;
        RuleSet::new(&self.settings.log_dir, self.build(&names, false)?).check(&DefaultValidator)
    }

    pub fn versions_of(&self, location: &Location) -> Result<Vec<RuleVersions>> {
        let rules = self.build(&self.settings.rule_names(), false)?;
        versions_of(&rules, location)
    }

    pub fn restore(
        &self,
        name: &str,
        location: &Location,
        version: &DateTime<Utc>,
        destination: Option<&Path>,
    ) -> Result<()> {
        let rule = self.rule(name)?;
        let found = PathMatch::require(&rule, location)?;
        info!("Restoring {location} of rule {name:?} as of {version}");
        rule.synchronizer().restore(
            &rule.resolved_synchronizer_options(),
            found.relative_path(),
            found.port(),
            version,
            destination,
        )
    }

    pub fn list_files(
        &self,
        name: &str,
        location: &Location,
        version: &DateTime<Utc>,
        recursive: bool,
        visitor: &mut dyn FnMut(PathBuf),
    ) -> Result<()> {
        let rule = self.rule(name)?;
        let found = PathMatch::require(&rule, location)?;
        rule.synchronizer().list_files(
            &rule.resolved_synchronizer_options(),
            found.relative_path(),
            found.port(),
            version,
            recursive,
            visitor,
        )
    }

    /// Execution history of `name`, oldest first.
    pub fn executions(&self, name: &str) -> Result<Vec<Execution>> {
        let name = self.known_rule(name)?;
        self.log(name).executions()
    }
}
