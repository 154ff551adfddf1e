use crate::backup::options::{OptionInfo, OptionMap};
use crate::backup::result_error::result::Result;
use crate::backup::rule::Rule;
use crate::backup::rules_coordinator::RuleSetValidator;
use itertools::Itertools;

/// Checks applied to every batch before `schedule` or `check` goes ahead.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultValidator;

fn check_options(
    rule: &Rule,
    kind: &str,
    options: &OptionMap,
    known: &[&OptionInfo],
    errors: &mut Vec<String>,
) {
    for (name, value) in options {
        match known.iter().find(|info| info.name() == name) {
            None => errors.push(format!(
                "in rule {}: unknown {kind} option {name}",
                rule.name()
            )),
            Some(info) => {
                if let Err(e) = info.check_value(value) {
                    errors.push(format!("in rule {}: {e}", rule.name()));
                }
            }
        }
    }
}

fn option_errors(rule: &Rule) -> Vec<String> {
    let synchronizer_options = rule.synchronizer().available_options().iter().collect_vec();
    let scheduler = rule.scheduler();
    let scheduler_declared = scheduler.available_options();
    let shared_declared = scheduler.available_shared_options();
    let scheduler_options = scheduler_declared
        .iter()
        .chain(shared_declared.iter())
        .collect_vec();
    let all_options = synchronizer_options
        .iter()
        .chain(scheduler_options.iter())
        .copied()
        .collect_vec();

    let mut errors = Vec::new();
    check_options(
        rule,
        "synchronizer",
        rule.synchronizer_options(),
        &synchronizer_options,
        &mut errors,
    );
    check_options(
        rule,
        "scheduler",
        rule.scheduler_options(),
        &scheduler_options,
        &mut errors,
    );
    check_options(rule, "rule", rule.options(), &all_options, &mut errors);
    errors
}

fn self_overlap_errors(rule: &Rule) -> Vec<String> {
    let read = rule.read_locations();
    rule.written_locations()
        .into_iter()
        .cartesian_product(read)
        .filter(|(written, read)| written.overlaps(read))
        .map(|(written, read)| {
            format!(
                "in rule {}: written location {written} overlaps read location {read}",
                rule.name()
            )
        })
        .collect_vec()
}

fn cross_rule_overlap_errors(rules: &[&Rule]) -> Vec<String> {
    rules
        .iter()
        .tuple_combinations()
        .flat_map(|(first, second)| {
            first
                .written_locations()
                .into_iter()
                .cartesian_product(second.written_locations())
                .filter(|(a, b)| a.overlaps(b))
                .map(|(a, b)| {
                    format!(
                        "rules {} and {} write to overlapping locations {a} and {b}",
                        first.name(),
                        second.name()
                    )
                })
                .collect_vec()
        })
        .collect_vec()
}

impl RuleSetValidator for DefaultValidator {
    fn validate(&self, rules: &[&Rule]) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        for rule in rules {
            if !rule.enabled() {
                errors.push(format!("rule {} is disabled", rule.name()));
            }
            errors.extend(option_errors(rule));
            errors.extend(
                rule.synchronizer()
                    .check(&rule.resolved_synchronizer_options())?
                    .into_iter()
                    .map(|message| format!("in rule {}: {message}", rule.name())),
            );
            errors.extend(self_overlap_errors(rule));
        }
        errors.extend(cross_rule_overlap_errors(rules));
        Ok(errors)
    }
}
