use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};

#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct ExecutionResult {
    end_time: DateTime<Utc>,
    succeeded: bool,
}

impl ExecutionResult {
    pub fn new(end_time: DateTime<Utc>, succeeded: bool) -> Self {
        Self {
            end_time,
            succeeded,
        }
    }
}

/// One historical run of a rule. The result is attached once, when the run
/// ends; an execution without result is still running or crashed.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Execution {
    start_time: DateTime<Utc>,
    output: String,
    result: Option<ExecutionResult>,
}

impl Execution {
    pub fn new<S: Into<String>>(
        start_time: DateTime<Utc>,
        output: S,
        result: Option<ExecutionResult>,
    ) -> Self {
        Self {
            start_time,
            output: output.into(),
            result,
        }
    }

    pub fn finished(&self) -> bool {
        self.result.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.result.is_some_and(|r| r.succeeded())
    }
}
