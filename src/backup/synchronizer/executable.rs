use crate::backup::function_path;
use crate::backup::location::Port;
use crate::backup::logger::Logger;
use crate::backup::options::{OptionInfo, OptionMap};
use crate::backup::process::{CapturedOutput, ProcessRunner};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use crate::backup::synchronizer::wire;
use crate::backup::synchronizer::{PortQuery, SynchronizerProtocol};
use chrono::{DateTime, Utc};
use function_name::named;
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exit code by which an executable says it does not implement a verb.
pub const NOT_IMPLEMENTED_EXIT_CODE: i32 = 200;

/// Synchronizer implemented by an external executable, called as
/// `<exe> <verb> <positional...> <Key=Value>...`.
#[derive(Debug)]
pub struct ExecutableSynchronizer {
    executable: PathBuf,
    runner: ProcessRunner,
}

impl ExecutableSynchronizer {
    pub fn new<P: Into<PathBuf>>(executable: P, runner: ProcessRunner) -> Self {
        Self {
            executable: executable.into(),
            runner,
        }
    }

    fn args(verb: &str, positional: &[String], options: &OptionMap) -> Vec<String> {
        std::iter::once(verb.to_string())
            .chain(positional.iter().cloned())
            .chain(options.iter().map(|(k, v)| format!("{k}={v}")))
            .collect_vec()
    }

    fn program(&self) -> String {
        self.executable.to_string_lossy().into_owned()
    }

    /// Maps an exit code to "done", "not implemented" or a hard failure.
    fn interpret(&self, args: Vec<String>, exit_code: i32) -> Result<Option<()>> {
        match exit_code {
            0 => Ok(Some(())),
            NOT_IMPLEMENTED_EXIT_CODE => {
                debug!("{} does not implement {}", self.program(), args[0]);
                Ok(None)
            }
            exit_code => Err(Error::external_process_failure(
                self.program(),
                args,
                exit_code,
            )),
        }
    }

    fn captured(
        &self,
        verb: &str,
        positional: &[String],
        options: &OptionMap,
    ) -> Result<Option<Vec<u8>>> {
        let args = Self::args(verb, positional, options);
        let CapturedOutput { exit_code, stdout } =
            self.runner.run_captured(&self.executable, &args)?;
        Ok(self.interpret(args, exit_code)?.map(|_| stdout))
    }

    fn path_arg(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }
}

impl SynchronizerProtocol for ExecutableSynchronizer {
    #[named]
    fn sync(&self, options: &OptionMap, logger: &Logger) -> Result<Option<()>> {
        let args = Self::args("sync", &[], options);
        let exit_code = self
            .runner
            .run_logged(&self.executable, &args, logger)
            .add_fn_name(function_path!())?;
        self.interpret(args, exit_code)
    }

    #[named]
    fn versions_of(
        &self,
        options: &OptionMap,
        path: &Path,
        port: usize,
    ) -> Result<Option<Vec<DateTime<Utc>>>> {
        self.captured(
            "versions-of",
            &[Self::path_arg(path), port.to_string()],
            options,
        )
        .and_then(|output| output.as_deref().map(wire::parse_versions).transpose())
        .add_fn_name(function_path!())
    }

    #[named]
    fn restore(
        &self,
        options: &OptionMap,
        path: &Path,
        port: usize,
        version: &DateTime<Utc>,
        destination: Option<&Path>,
    ) -> Result<Option<()>> {
        let [w3c, unix_seconds] = wire::version_args(version);
        let args = Self::args(
            "restore",
            &[
                Self::path_arg(path),
                port.to_string(),
                w3c,
                unix_seconds,
                destination.map(Self::path_arg).unwrap_or_default(),
            ],
            options,
        );
        let exit_code = self
            .runner
            .run_inherited(&self.executable, &args)
            .add_fn_name(function_path!())?;
        self.interpret(args, exit_code)
    }

    #[named]
    fn list_files(
        &self,
        options: &OptionMap,
        path: &Path,
        port: usize,
        version: &DateTime<Utc>,
        recursive: bool,
        visitor: &mut dyn FnMut(PathBuf),
    ) -> Result<Option<()>> {
        let [w3c, unix_seconds] = wire::version_args(version);
        let output = self
            .captured(
                "list-files",
                &[
                    Self::path_arg(path),
                    port.to_string(),
                    w3c,
                    unix_seconds,
                    if recursive { "1" } else { "0" }.to_string(),
                ],
                options,
            )
            .add_fn_name(function_path!())?;
        Ok(output.map(|output| wire::parse_file_list(&output).into_iter().for_each(visitor)))
    }

    #[named]
    fn check(&self, options: &OptionMap) -> Result<Option<Vec<String>>> {
        self.captured("check", &[], options)
            .map(|output| {
                output.map(|output| {
                    String::from_utf8_lossy(&output)
                        .lines()
                        .filter(|line| !line.trim().is_empty())
                        .map(str::to_owned)
                        .collect_vec()
                })
            })
            .add_fn_name(function_path!())
    }

    #[named]
    fn writes_to(&self) -> Result<Option<Vec<usize>>> {
        self.captured("writes-to", &[], &OptionMap::new())
            .and_then(|output| output.as_deref().map(wire::parse_port_indices).transpose())
            .add_fn_name(function_path!())
    }

    #[named]
    fn info_of_port(&self, port: PortQuery) -> Result<Option<Option<Port>>> {
        let argument = match port {
            PortQuery::Number(n) => n.to_string(),
            PortQuery::Specials => "specials".to_string(),
        };
        self.captured("info-of-port", &[argument], &OptionMap::new())
            .and_then(|output| {
                output
                    .map(|output| -> Result<Option<Port>> {
                        Ok(wire::parse_port_info(&output)?
                            .map(|(written_to, protocols)| Port::new(protocols, written_to)))
                    })
                    .transpose()
            })
            .add_fn_name(function_path!())
    }

    #[named]
    fn available_options(&self) -> Result<Option<Vec<OptionInfo>>> {
        self.captured("available-options", &[], &OptionMap::new())
            .and_then(|output| {
                output
                    .map(|output| -> Result<Vec<OptionInfo>> {
                        let parsed: Vec<Option<OptionInfo>> = String::from_utf8_lossy(&output)
                            .lines()
                            .map(OptionInfo::parse_line)
                            .try_collect()?;
                        Ok(parsed.into_iter().flatten().collect_vec())
                    })
                    .transpose()
            })
            .add_fn_name(function_path!())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::logger::testing::RecordingTarget;
    use crate::backup::signals::{Forwarding, SignalCoordinator};
    use chrono::TimeZone;
    use serial_test::serial;
    use crate::backup::synchronizer::testing::write_script;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn synchronizer(dir: &TempDir, body: &str) -> ExecutableSynchronizer {
        let runner = ProcessRunner::new(Arc::new(
            SignalCoordinator::install_with(Forwarding::Disabled).unwrap(),
        ));
        ExecutableSynchronizer::new(write_script(dir.path(), body), runner)
    }

    #[test]
    #[serial]
    fn test_sync_passes_options_and_logs_output() {
        let dir = TempDir::new().unwrap();
        let sync = synchronizer(&dir, r#"echo "$@""#);
        let recording = RecordingTarget::default();
        let options = OptionMap::from([("Loc1".to_string(), "/a".to_string())]);

        let done = sync
            .sync(&options, &Logger::new(recording.clone()))
            .unwrap();

        assert_eq!(done, Some(()));
        assert_eq!(recording.output(), "sync Loc1=/a\n");
    }

    #[test]
    #[serial]
    fn test_exit_200_is_not_implemented() {
        let dir = TempDir::new().unwrap();
        let sync = synchronizer(&dir, "exit 200");
        assert_eq!(sync.check(&OptionMap::new()).unwrap(), None);
        assert_eq!(sync.writes_to().unwrap(), None);
        assert_eq!(sync.info_of_port(PortQuery::Number(1)).unwrap(), None);
    }

    #[test]
    #[serial]
    fn test_other_exit_code_is_failure() {
        let dir = TempDir::new().unwrap();
        let sync = synchronizer(&dir, "exit 7");
        let error = sync.check(&OptionMap::new()).unwrap_err();
        match error.root() {
            Error::ExternalProcessFailure {
                args, exit_code, ..
            } => {
                assert_eq!(*exit_code, 7);
                assert_eq!(args, &vec!["check".to_string()]);
            }
            other => panic!("Expected ExternalProcessFailure, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_versions_and_files() {
        let dir = TempDir::new().unwrap();
        let sync = synchronizer(
            &dir,
            r#"case "$1" in
  versions-of) echo 1709294400; echo 2024-03-02T12:00:00+00:00 ;;
  list-files) [ "$6" = 1 ] && printf 'a\0b\nc\0' ;;
  *) exit 200 ;;
esac"#,
        );
        let versions = sync
            .versions_of(&OptionMap::new(), Path::new("/data"), 2)
            .unwrap()
            .unwrap();
        assert_eq!(versions.len(), 2);

        let mut files = Vec::new();
        let version = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        sync.list_files(
            &OptionMap::new(),
            Path::new("/data"),
            2,
            &version,
            true,
            &mut |p| files.push(p),
        )
        .unwrap();
        assert_eq!(files, vec![PathBuf::from("a"), PathBuf::from("b\nc")]);
    }

    #[test]
    #[serial]
    fn test_available_options() {
        let dir = TempDir::new().unwrap();
        let sync = synchronizer(&dir, r#"printf 'Excludes\nb Compress\nfast|slow Mode\n'"#);
        let options = sync.available_options().unwrap().unwrap();
        assert_eq!(
            options.iter().map(|o| o.name().as_str()).collect_vec(),
            vec!["Excludes", "Compress", "Mode"]
        );
    }
}
