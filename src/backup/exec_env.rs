use crate::backup::logger::Logger;
use crate::backup::options::OptionMap;
use crate::backup::process::ProcessRunner;
use crate::backup::result_error::result::Result;
use crate::backup::synchronizer::Synchronizer;
use std::ffi::OsStr;
use std::sync::Arc;

/// Handle given to a scheduler for one execution attempt of a rule.
#[derive(Clone, Debug)]
pub struct ExecEnvironment {
    logger: Logger,
    runner: ProcessRunner,
    synchronizer: Arc<Synchronizer>,
    sync_options: Arc<OptionMap>,
}

impl ExecEnvironment {
    pub fn new(
        logger: Logger,
        runner: ProcessRunner,
        synchronizer: Arc<Synchronizer>,
        sync_options: OptionMap,
    ) -> Self {
        Self {
            logger,
            runner,
            synchronizer,
            sync_options: Arc::new(sync_options),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Same environment writing to `logger`; `self` is left untouched.
    pub fn with_logger(&self, logger: Logger) -> Self {
        Self {
            logger,
            ..self.clone()
        }
    }

    /// Spawns `program`, streaming its merged output into the log.
    pub fn log_subprocess<P, S>(&self, program: P, args: &[S]) -> Result<i32>
    where
        P: AsRef<OsStr>,
        S: AsRef<OsStr>,
    {
        self.runner.run_logged(program, args, &self.logger)
    }

    pub fn run_synchronizer(&self) -> Result<()> {
        self.synchronizer.sync(&self.sync_options, &self.logger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::logger::testing::RecordingTarget;
    use crate::backup::signals::{Forwarding, SignalCoordinator};
    use crate::backup::synchronizer::testing::FakeSynchronizer;
    use serial_test::serial;

    fn environment(fake: &FakeSynchronizer, target: RecordingTarget) -> ExecEnvironment {
        ExecEnvironment::new(
            Logger::new(target),
            ProcessRunner::new(Arc::new(
                SignalCoordinator::install_with(Forwarding::Disabled).unwrap(),
            )),
            fake.clone().load(),
            OptionMap::from([("Loc1".to_string(), "/src".to_string())]),
        )
    }

    #[test]
    fn test_with_logger_leaves_original() {
        let fake = FakeSynchronizer::default();
        let first = RecordingTarget::default();
        let second = RecordingTarget::default();
        let env = environment(&fake, first.clone());

        let replaced = env.with_logger(Logger::new(second.clone()));
        replaced.run_synchronizer().unwrap();
        env.run_synchronizer().unwrap();

        assert_eq!(first.output(), "synchronized\n");
        assert_eq!(second.output(), "synchronized\n");
        assert_eq!(fake.sync_count(), 2);
        assert_eq!(fake.synced.lock().unwrap()[0]["Loc1"], "/src");
    }

    #[test]
    #[serial]
    fn test_log_subprocess() {
        let target = RecordingTarget::default();
        let env = environment(&FakeSynchronizer::default(), target.clone());
        assert_eq!(env.log_subprocess("sh", &["-c", "echo hi; exit 2"]).unwrap(), 2);
        assert_eq!(target.output(), "hi\n");
    }
}
