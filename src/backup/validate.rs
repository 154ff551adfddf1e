//! Validation functions for configuration values.
//!
//! Provides custom validation functions for rule names, directories,
//! cron expressions and intervals.

use chrono::Utc;
use humantime_serde::re::humantime;
use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

/// Rule names become directory and lock file names.
pub fn validate_rule_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() || name.starts_with('.') || !is_sanitized(name) {
        return Err(ValidationError::new("InvalidRuleName").with_message(
            format!(
                "Invalid rule name {name:?}, try sanitizing like {:?}",
                sanitize(name.trim_start_matches('.'))
            )
            .into(),
        ));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access directory {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}

pub fn validate_executable<P: AsRef<Path>>(path: P) -> Result<(), ValidationError> {
    use std::os::unix::fs::PermissionsExt;

    let path = path.as_ref();
    let md = std::fs::metadata(path).map_err(|e| {
        ValidationError::new("InvalidExecutable")
            .with_message(format!("cannot access {:?}: {}", path, e).into())
    })?;
    if !md.is_file() || md.permissions().mode() & 0o111 == 0 {
        return Err(ValidationError::new("InvalidExecutable")
            .with_message(format!("{:?} is not an executable file", path).into()));
    }

    Ok(())
}

pub fn validate_cron_str<S: AsRef<str>>(cron: S) -> Result<(), ValidationError> {
    let cron = cron.as_ref();
    if cron_parser::parse(cron, &Utc::now()).is_err() {
        return Err(ValidationError::new("InvalidCron")
            .with_message(format!("Invalid cron string: {cron:?}").into()));
    }

    Ok(())
}

pub fn validate_interval<S: AsRef<str>>(interval: S) -> Result<(), ValidationError> {
    let interval = interval.as_ref();
    match humantime::parse_duration(interval) {
        Ok(d) if !d.is_zero() => Ok(()),
        _ => Err(ValidationError::new("InvalidInterval")
            .with_message(format!("Invalid interval: {interval:?}").into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rule_name() {
        assert!(validate_rule_name("nightly-home").is_ok());
        assert!(validate_rule_name("").is_err());
        assert!(validate_rule_name("a/b").is_err());
        assert!(validate_rule_name(".hidden").is_err());
    }

    #[test]
    fn test_writable_dir_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("logs/rules");
        assert!(validate_writable_dir(&nested).is_ok());
        assert!(nested.is_dir());

        let file = dir.path().join("file");
        std::fs::write(&file, b"").unwrap();
        assert!(validate_writable_dir(&file).is_err());
    }

    #[test]
    fn test_executable() {
        assert!(validate_executable("/bin/sh").is_ok());
        assert!(validate_executable("/nonexistent/synchronizer").is_err());
        assert!(validate_executable("/").is_err());
    }

    #[test]
    fn test_cron_and_interval() {
        assert!(validate_cron_str("0 3 * * *").is_ok());
        assert!(validate_cron_str("at night").is_err());
        assert!(validate_interval("1day 2h").is_ok());
        assert!(validate_interval("0s").is_err());
        assert!(validate_interval("soon").is_err());
    }
}
