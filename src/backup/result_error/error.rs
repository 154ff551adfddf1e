use crate::backup::result_error::{AddFunctionName, AddMsg};
use itertools::Itertools;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug, thiserror_ext::Construct)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Nix(#[from] nix::errno::Errno),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    ChronoParse(#[from] chrono::ParseError),
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error("Execution of rule {rule:?} is already in progress")]
    LockHeld { rule: String },
    #[error("Synchronizer {program:?} does not implement {verb:?}")]
    SynchronizerNotImplemented { program: String, verb: String },
    #[error("Calling {program:?} with args {args:?} failed (exit code {exit_code})")]
    ExternalProcessFailure {
        program: String,
        args: Vec<String>,
        exit_code: i32,
    },
    #[error("Unexpected output of {program:?}: {reason}")]
    UnexpectedOutput { program: String, reason: String },
    #[error("Validation failed:\n{}", indent::indent_all_with("  ", .errors.iter().join("\n")))]
    ValidationFailure { errors: Vec<String> },
    #[error("Scheduler {scheduler:?} reported errors:\n{}", indent::indent_all_with("  ", .errors.iter().join("\n")))]
    SchedulerPlugin {
        scheduler: String,
        errors: Vec<String>,
    },
    #[error("Execution of rule {rule:?} failed")]
    ExecutionFailed { rule: String },
    #[error("Interrupted by signal {signal} (exit code -{signal}){}", child_status_suffix(.child_status))]
    FatalSignal {
        signal: i32,
        child_status: Option<i32>,
    },
    #[error("No rule matches {pattern:?}")]
    NoSuchRule { pattern: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFunctionName { fn_name: String, error: Box<Error> },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

fn child_status_suffix(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(", child process exited with {code}"),
        None => String::new(),
    }
}

impl AddMsg for Error {
    fn add_msg<S: Into<String>>(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl AddFunctionName for Error {
    fn add_fn_name<S: Into<String>>(self, fn_name: S) -> Self {
        Self::WithFunctionName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(Error::flatten).collect_vec())
    }
}

impl Error {
    pub fn flatten(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(Error::flatten)),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.flatten().chain(other.flatten()).collect_vec())
    }

    /// Strips message and function name context.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } | Error::WithFunctionName { error, .. } => error.root(),
            e => e,
        }
    }

    fn any<F: Fn(&Error) -> bool + Copy>(&self, predicate: F) -> bool {
        match self.root() {
            Error::LotsOfError(v) => v.iter().any(|e| e.any(predicate)),
            e => predicate(e),
        }
    }

    pub fn signal_number(&self) -> Option<i32> {
        match self.root() {
            Error::FatalSignal { signal, .. } => Some(*signal),
            Error::LotsOfError(v) => v.iter().find_map(Error::signal_number),
            _ => None,
        }
    }

    pub fn is_lock_held(&self) -> bool {
        self.any(|e| matches!(e, Error::LockHeld { .. }))
    }

    /// Whether this went wrong inside the pipeline itself rather than in a
    /// child process or through a signal.
    pub fn is_internal(&self) -> bool {
        self.any(|e| {
            !matches!(
                e,
                Error::LockHeld { .. }
                    | Error::SynchronizerNotImplemented { .. }
                    | Error::ExternalProcessFailure { .. }
                    | Error::UnexpectedOutput { .. }
                    | Error::ExecutionFailed { .. }
                    | Error::FatalSignal { .. }
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);

        match error {
            Error::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_add_msg_display() {
        let error = Error::lock_held("nightly").add_msg("Operation failed");
        let error_str = error.to_string();

        assert!(error_str.starts_with("Operation failed:\n"));
        assert!(error_str.contains("  Execution of rule \"nightly\" is already in progress"));
    }

    #[test]
    fn test_error_add_fn_name_display() {
        let error = Error::invalid_config("bad").add_fn_name("k_dispatch::load");
        let error_str = error.to_string();

        assert!(error_str.contains("k_dispatch::load failed"));
        assert!(error_str.contains("Invalid configuration: bad"));
    }

    #[test]
    fn test_error_from_vec_flattens() {
        let nested = Error::from(vec![Error::invalid_config("a"), Error::invalid_config("b")]);
        let combined = Error::from(vec![nested, Error::invalid_config("c")]);
        match combined {
            Error::LotsOfError(error_vec) => assert_eq!(error_vec.len(), 3),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    #[should_panic(expected = "Should not create lots of errors when error is empty")]
    fn test_error_from_empty_vec_panics() {
        let errors: Vec<Error> = vec![];
        let _error = Error::from(errors);
    }

    #[test]
    fn test_error_chain() {
        let chained = Error::invalid_config("a").chain(Error::invalid_config("b"));
        match chained {
            Error::LotsOfError(errors) => assert_eq!(errors.len(), 2),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    fn test_fatal_signal_found_through_context() {
        let error = Error::FatalSignal {
            signal: 15,
            child_status: Some(1),
        }
        .add_msg("Execution failed")
        .add_fn_name("execute");
        assert_eq!(error.signal_number(), Some(15));
        assert!(error.to_string().contains("-15"));
        assert!(error.to_string().contains("child process exited with 1"));

        let combined = Error::invalid_config("x").chain(Error::FatalSignal {
            signal: 2,
            child_status: None,
        });
        assert_eq!(combined.signal_number(), Some(2));
    }

    #[test]
    fn test_lock_held_detection() {
        assert!(Error::lock_held("r").add_msg("ctx").is_lock_held());
        assert!(!Error::invalid_config("x").is_lock_held());
    }

    #[test]
    fn test_internal_detection() {
        let failure = Error::external_process_failure("tool", vec!["sync".to_string()], 1);
        assert!(!failure.add_msg("Running ExecBefore failed").is_internal());
        assert!(!Error::execution_failed("r").is_internal());
        assert!(Error::invalid_config("x").add_msg("ctx").is_internal());
        assert!(Error::from(vec![
            Error::execution_failed("r"),
            Error::from(std::io::Error::other("disk full")),
        ])
        .is_internal());
    }
}
