//! Read-only questions about the backups of rules.

use crate::backup::location::Location;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::rule::Rule;
use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use tracing::debug;

pub const MAX_QUERY_THREADS: usize = 8;

/// Location of a rule containing a queried path.
#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct PathMatch<'a> {
    #[getset(get_copy = "pub")]
    rule: &'a Rule,
    /// 1-based port the location is bound to.
    #[getset(get_copy = "pub")]
    port: usize,
    #[getset(get = "pub")]
    relative_path: PathBuf,
}

impl PathMatch<'_> {
    /// Where `location` lies in `rule`, if any of its locations contains it.
    pub fn find<'a>(rule: &'a Rule, location: &Location) -> Option<PathMatch<'a>> {
        rule.locations()
            .iter()
            .enumerate()
            .find_map(|(index, candidate)| {
                candidate
                    .relative_path_of(location)
                    .map(|relative_path| PathMatch {
                        rule,
                        port: index + 1,
                        relative_path,
                    })
            })
    }

    /// Like [`PathMatch::find`] but failing when the rule has no such location.
    pub fn require<'a>(rule: &'a Rule, location: &Location) -> Result<PathMatch<'a>> {
        Self::find(rule, location).ok_or_else(|| {
            Error::invalid_config(format!(
                "{location} is not inside any location of rule {:?}",
                rule.name()
            ))
        })
    }
}

/// Versions one rule holds of a path. The error of a rule whose query
/// failed is kept until asked for.
#[derive(Debug)]
pub struct RuleVersions {
    rule: String,
    port: usize,
    versions: Result<Vec<DateTime<Utc>>>,
}

impl RuleVersions {
    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn port(&self) -> usize {
        self.port
    }

    pub fn versions(self) -> Result<Vec<DateTime<Utc>>> {
        self.versions
    }
}

/// Asks every rule with a location containing `location` for the versions
/// it holds, one worker per rule up to [`MAX_QUERY_THREADS`].
pub fn versions_of(rules: &[Rule], location: &Location) -> Result<Vec<RuleVersions>> {
    let matches = rules
        .iter()
        .filter_map(|rule| PathMatch::find(rule, location))
        .collect_vec();
    if matches.is_empty() {
        return Ok(Vec::new());
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(matches.len().min(MAX_QUERY_THREADS))
        .build()?;
    debug!("Querying versions of {location} in {} rules", matches.len());
    Ok(pool.install(|| {
        matches
            .par_iter()
            .map(|m| RuleVersions {
                rule: m.rule.name().clone(),
                port: m.port,
                versions: m
                    .rule
                    .synchronizer()
                    .versions_of(
                        &m.rule.resolved_synchronizer_options(),
                        &m.relative_path,
                        m.port,
                    )
                    .add_msg(format!("Querying versions in rule {:?} failed", m.rule.name())),
            })
            .collect::<Vec<_>>()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::scheduler::testing::{runner, Behavior, RecordingScheduler};
    use crate::backup::scheduler::Scheduler;
    use crate::backup::synchronizer::executable::ExecutableSynchronizer;
    use crate::backup::synchronizer::testing::write_script;
    use crate::backup::synchronizer::Synchronizer;
    use serial_test::serial;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn rule(name: &str, synchronizer: &Arc<Synchronizer>, locations: [&str; 2]) -> Rule {
        let scheduler: Arc<dyn Scheduler> = Arc::new(RecordingScheduler::new(Behavior::Succeed));
        Rule::builder()
            .name(name)
            .scheduler(scheduler)
            .synchronizer(synchronizer.clone())
            .locations(locations.map(Location::local).to_vec())
            .build()
    }

    #[test]
    fn test_path_match() {
        let synchronizer = crate::backup::synchronizer::testing::FakeSynchronizer::default().load();
        let home = rule("home", &synchronizer, ["/home/user", "/backup/home"]);

        let found = PathMatch::find(&home, &Location::local("/backup/home/docs/a.txt")).unwrap();
        assert_eq!(found.port(), 2);
        assert_eq!(found.relative_path(), &PathBuf::from("docs/a.txt"));
        assert!(PathMatch::find(&home, &Location::local("/etc")).is_none());
        assert!(PathMatch::require(&home, &Location::local("/etc")).is_err());
    }

    #[test]
    #[serial]
    fn test_versions_of_across_rules() {
        let dir = TempDir::new().unwrap();
        let program = write_script(
            dir.path(),
            r#"case "$1" in
  versions-of)
    case "$2" in
      docs) echo 1700000000; echo 1700086400 ;;
      *) exit 3 ;;
    esac ;;
  *) exit 200 ;;
esac"#,
        );
        let synchronizer = Arc::new(
            Synchronizer::load(
                "sh",
                Box::new(ExecutableSynchronizer::new(program, runner())),
            )
            .unwrap(),
        );
        let rules = vec![
            rule("home", &synchronizer, ["/home/user", "/backup/home"]),
            rule("etc", &synchronizer, ["/etc", "/backup/etc"]),
            rule("user", &synchronizer, ["/home/user/docs", "/backup/docs"]),
        ];

        let results = versions_of(&rules, &Location::local("/home/user/docs")).unwrap();
        assert_eq!(results.iter().map(RuleVersions::rule).collect_vec(), vec!["home", "user"]);

        let mut results = results.into_iter();
        let home = results.next().unwrap();
        assert_eq!(home.port(), 1);
        assert_eq!(home.versions().unwrap().len(), 2);
        assert!(results.next().unwrap().versions().is_err());

        assert!(versions_of(&rules, &Location::local("/var")).unwrap().is_empty());
    }
}
