pub mod config;
pub mod exec_env;
pub mod execution;
pub mod execution_log;
pub mod location;
pub mod logger;
pub mod mutex;
pub mod options;
pub mod orchestrator;
pub mod process;
pub mod queries;
pub mod result_error;
pub mod rule;
pub mod rule_validation;
pub mod rules_coordinator;
pub mod scheduler;
pub mod signals;
pub mod synchronizer;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
