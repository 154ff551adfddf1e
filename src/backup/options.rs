//! Typed option declarations shared by synchronizers and schedulers.
//!
//! Options travel as plain `Key=Value` strings; plugins declare the options
//! they understand as [`OptionInfo`] so values can be checked before anything
//! runs.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use derive_more::Display;
use getset::Getters;
use humantime_serde::re::humantime;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub type OptionMap = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, Display)]
pub enum OptionType {
    #[display("string")]
    String,
    #[display("bool")]
    Bool,
    #[display("time delta")]
    TimeDelta,
    #[display("file")]
    File,
    #[display("positive number")]
    Positive,
    #[display("one of {}", _0.join("|"))]
    Choice(Vec<String>),
}

impl FromStr for OptionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(OptionType::String),
            "b" => Ok(OptionType::Bool),
            "t" => Ok(OptionType::TimeDelta),
            "f" => Ok(OptionType::File),
            "p" => Ok(OptionType::Positive),
            choices if choices.contains('|') => Ok(OptionType::Choice(
                choices.split('|').map(str::to_owned).collect_vec(),
            )),
            other => Err(Error::invalid_config(format!(
                "unknown option type {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct OptionInfo {
    name: String,
    option_type: OptionType,
}

impl OptionInfo {
    pub fn new<S: Into<String>>(name: S, option_type: OptionType) -> Self {
        Self {
            name: name.into(),
            option_type,
        }
    }

    pub fn string<S: Into<String>>(name: S) -> Self {
        Self::new(name, OptionType::String)
    }

    pub fn bool<S: Into<String>>(name: S) -> Self {
        Self::new(name, OptionType::Bool)
    }

    /// Parses one `available-options` line: `[type ]Name`.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next()) {
            (None, _, _) => Ok(None),
            (Some(name), None, _) => Ok(Some(Self::string(name))),
            (Some(option_type), Some(name), None) => {
                Ok(Some(Self::new(name, option_type.parse()?)))
            }
            _ => Err(Error::invalid_config(format!(
                "malformed option declaration {line:?}"
            ))),
        }
    }

    pub fn check_value(&self, value: &str) -> std::result::Result<(), String> {
        let valid = match &self.option_type {
            OptionType::String => true,
            OptionType::Bool => parse_bool(value).is_some(),
            OptionType::TimeDelta => parse_time_delta(value).is_some(),
            OptionType::File => !value.is_empty() && Path::new(value).file_name().is_some(),
            OptionType::Positive => value.parse::<u64>().is_ok_and(|n| n > 0),
            OptionType::Choice(choices) => choices.iter().any(|c| c == value),
        };
        if valid {
            Ok(())
        } else {
            Err(format!(
                "value {value:?} of option {} is not a valid {}",
                self.name, self.option_type
            ))
        }
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

pub fn parse_time_delta(value: &str) -> Option<Duration> {
    humantime::parse_duration(value.trim()).ok()
}

/// Reads a boolean option, falling back to `default` when it is absent.
pub fn bool_option(options: &OptionMap, name: &str, default: bool) -> Result<bool> {
    match options.get(name) {
        None => Ok(default),
        Some(value) => parse_bool(value).ok_or_else(|| {
            Error::invalid_config(format!("option {name} has non-boolean value {value:?}"))
        }),
    }
}
