//! Synchronizers are the backup engines rules delegate to.
//!
//! [`SynchronizerProtocol`] is the raw capability set: every verb answers
//! `None` when the engine does not implement it. [`Synchronizer`] wraps a
//! protocol, resolves its ports once at load time and supplies the defaults
//! for unimplemented verbs, so nothing downstream deals with missing verbs.

pub mod executable;
pub mod wire;

use crate::backup::function_path;
use crate::backup::location::{Port, LOCAL_PROTOCOL};
use crate::backup::logger::{Logger, Severity};
use crate::backup::options::{OptionInfo, OptionMap};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use chrono::{DateTime, Utc};
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Ports assumed when a synchronizer describes none.
pub const DEFAULT_PORT_COUNT: usize = 2;
const MAX_PORTS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortQuery {
    /// 1-based port number.
    Number(usize),
    /// Protocols accepted by every port.
    Specials,
}

pub trait SynchronizerProtocol: Send + Sync + Debug {
    fn sync(&self, options: &OptionMap, logger: &Logger) -> Result<Option<()>>;

    fn versions_of(
        &self,
        options: &OptionMap,
        path: &Path,
        port: usize,
    ) -> Result<Option<Vec<DateTime<Utc>>>>;

    fn restore(
        &self,
        options: &OptionMap,
        path: &Path,
        port: usize,
        version: &DateTime<Utc>,
        destination: Option<&Path>,
    ) -> Result<Option<()>>;

    fn list_files(
        &self,
        options: &OptionMap,
        path: &Path,
        port: usize,
        version: &DateTime<Utc>,
        recursive: bool,
        visitor: &mut dyn FnMut(PathBuf),
    ) -> Result<Option<()>>;

    fn check(&self, options: &OptionMap) -> Result<Option<Vec<String>>>;

    fn writes_to(&self) -> Result<Option<Vec<usize>>>;

    /// `Some(None)` means the port does not exist.
    fn info_of_port(&self, port: PortQuery) -> Result<Option<Option<Port>>>;

    fn available_options(&self) -> Result<Option<Vec<OptionInfo>>>;
}

/// A loaded synchronizer instance, shared by the rules using it.
#[derive(Getters)]
pub struct Synchronizer {
    #[getset(get = "pub")]
    name: String,
    protocol: Box<dyn SynchronizerProtocol>,
    #[getset(get = "pub")]
    ports: Vec<Port>,
    #[getset(get = "pub")]
    available_options: Vec<OptionInfo>,
}

impl Debug for Synchronizer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("name", &self.name)
            .field("ports", &self.ports)
            .finish()
    }
}

impl Synchronizer {
    #[named]
    pub fn load<S: Into<String>>(name: S, protocol: Box<dyn SynchronizerProtocol>) -> Result<Self> {
        let name = name.into();
        let ports = load_ports(protocol.as_ref())
            .add_msg(format!("Loading ports of synchronizer {name:?} failed"))
            .add_fn_name(function_path!())?;
        let available_options = protocol
            .available_options()
            .add_msg(format!("Loading options of synchronizer {name:?} failed"))
            .add_fn_name(function_path!())?
            .unwrap_or_default();
        debug!("Loaded synchronizer {name:?} with ports {ports:?}");
        Ok(Self {
            name,
            protocol,
            ports,
            available_options,
        })
    }

    fn not_implemented(&self, verb: &str) -> String {
        Error::synchronizer_not_implemented(self.name.as_str(), verb).to_string()
    }

    /// Runs a backup, streaming engine output into `logger`. An engine
    /// without `sync` only earns a warning.
    pub fn sync(&self, options: &OptionMap, logger: &Logger) -> Result<()> {
        if self.protocol.sync(options, logger)?.is_none() {
            let message = self.not_implemented("sync");
            warn!("{message}");
            logger.log(Severity::Warning, message)?;
        }
        Ok(())
    }

    pub fn versions_of(
        &self,
        options: &OptionMap,
        path: &Path,
        port: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        Ok(self
            .protocol
            .versions_of(options, path, port)?
            .unwrap_or_default())
    }

    pub fn restore(
        &self,
        options: &OptionMap,
        path: &Path,
        port: usize,
        version: &DateTime<Utc>,
        destination: Option<&Path>,
    ) -> Result<()> {
        if self
            .protocol
            .restore(options, path, port, version, destination)?
            .is_none()
        {
            warn!("{}", self.not_implemented("restore"));
        }
        Ok(())
    }

    pub fn list_files(
        &self,
        options: &OptionMap,
        path: &Path,
        port: usize,
        version: &DateTime<Utc>,
        recursive: bool,
        visitor: &mut dyn FnMut(PathBuf),
    ) -> Result<()> {
        self.protocol
            .list_files(options, path, port, version, recursive, visitor)?;
        Ok(())
    }

    pub fn check(&self, options: &OptionMap) -> Result<Vec<String>> {
        Ok(self.protocol.check(options)?.unwrap_or_default())
    }
}

/// Describes ports through `info-of-port`; without it falls back to
/// `DEFAULT_PORT_COUNT` file ports whose write flags come from `writes-to`,
/// or failing that, with only the last port written to.
fn load_ports(protocol: &dyn SynchronizerProtocol) -> Result<Vec<Port>> {
    let specials = match protocol.info_of_port(PortQuery::Specials)? {
        Some(Some(special)) => special.protocols().clone(),
        _ => Vec::new(),
    };

    let mut ports = Vec::new();
    for number in 1..=MAX_PORTS + 1 {
        if number > MAX_PORTS {
            return Err(Error::unexpected_output(
                "info-of-port",
                format!("more than {MAX_PORTS} ports described"),
            ));
        }
        match protocol.info_of_port(PortQuery::Number(number))? {
            Some(Some(port)) => ports.push(port),
            Some(None) => break,
            None => {
                ports = fallback_ports(protocol)?;
                break;
            }
        }
    }

    Ok(ports
        .into_iter()
        .map(|port| port.with_extra_protocols(&specials))
        .collect_vec())
}

fn fallback_ports(protocol: &dyn SynchronizerProtocol) -> Result<Vec<Port>> {
    let written = protocol.writes_to()?;
    let count = written
        .as_ref()
        .and_then(|w| w.iter().max().copied())
        .unwrap_or(0)
        .max(DEFAULT_PORT_COUNT);
    Ok((1..=count)
        .map(|number| {
            let written_to = match &written {
                Some(indices) => indices.contains(&number),
                None => number == count,
            };
            Port::new([LOCAL_PROTOCOL], written_to)
        })
        .collect_vec())
}


#[cfg(test)]
mod tests {
    use super::executable::ExecutableSynchronizer;
    use super::testing::{write_script, FakeSynchronizer};
    use super::*;
    use crate::backup::logger::testing::RecordingTarget;
    use crate::backup::process::ProcessRunner;
    use crate::backup::signals::{Forwarding, SignalCoordinator};
    use serial_test::serial;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn load_script(dir: &TempDir, body: &str) -> Synchronizer {
        let runner = ProcessRunner::new(Arc::new(
            SignalCoordinator::install_with(Forwarding::Disabled).unwrap(),
        ));
        let protocol = ExecutableSynchronizer::new(write_script(dir.path(), body), runner);
        Synchronizer::load("script", Box::new(protocol)).unwrap()
    }

    #[test]
    fn test_default_ports_without_port_verbs() {
        let sync = FakeSynchronizer::default().load();
        assert_eq!(
            sync.ports(),
            &vec![Port::new(["file"], false), Port::new(["file"], true)]
        );
    }

    #[test]
    #[serial]
    fn test_ports_from_writes_to() {
        let dir = TempDir::new().unwrap();
        let sync = load_script(
            &dir,
            r#"case "$1" in writes-to) echo 1; echo 3 ;; *) exit 200 ;; esac"#,
        );
        assert_eq!(
            sync.ports()
                .iter()
                .map(Port::is_written_to)
                .collect_vec(),
            vec![true, false, true]
        );
    }

    #[test]
    #[serial]
    fn test_ports_from_info_of_port_with_specials() {
        let dir = TempDir::new().unwrap();
        let sync = load_script(
            &dir,
            r#"[ "$1" = info-of-port ] || exit 200
case "$2" in
  specials) printf '0\nsftp\n' ;;
  1) printf '0\nfile\n' ;;
  2) printf '1\nfile\nssh\n' ;;
esac"#,
        );
        assert_eq!(
            sync.ports(),
            &vec![
                Port::new(["file", "sftp"], false),
                Port::new(["file", "ssh", "sftp"], true)
            ]
        );
    }

    #[test]
    #[serial]
    fn test_unimplemented_sync_warns() {
        let dir = TempDir::new().unwrap();
        let sync = load_script(&dir, "exit 200");
        let recording = RecordingTarget::default();
        sync.sync(&OptionMap::new(), &Logger::new(recording.clone()))
            .unwrap();
        let warnings = recording.messages(Severity::Warning);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("does not implement \"sync\""));
        assert!(sync.check(&OptionMap::new()).unwrap().is_empty());
        assert!(sync.available_options().is_empty());
    }
}
