use crate::backup::function_path;
use crate::backup::logger::Logger;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use crate::backup::signals::{ChildStatus, SignalCoordinator};
use function_name::named;
use std::ffi::OsStr;
use std::io::{ErrorKind, PipeReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use tracing::debug;

/// Size of the chunks child output is forwarded in.
pub const OUTPUT_CHUNK_SIZE: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
}

impl ChildStatus for CapturedOutput {
    fn child_status(&self) -> i32 {
        self.exit_code
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

fn command<P: AsRef<OsStr>, S: AsRef<OsStr>>(program: P, args: &[S]) -> Command {
    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).process_group(0);
    command
}

/// Spawns child processes, each leading a process group of its own, with
/// fatal signals forwarded to them.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    signals: Arc<SignalCoordinator>,
}

impl ProcessRunner {
    pub fn new(signals: Arc<SignalCoordinator>) -> Self {
        Self { signals }
    }

    pub fn signals(&self) -> &Arc<SignalCoordinator> {
        &self.signals
    }

    /// Runs a child with stdout and stderr merged into `logger`, chunk by
    /// chunk. Returns the exit code, negative signal number if killed.
    #[named]
    pub fn run_logged<P, S>(&self, program: P, args: &[S], logger: &Logger) -> Result<i32>
    where
        P: AsRef<OsStr>,
        S: AsRef<OsStr>,
    {
        debug!("Running {:?} with output logged", program.as_ref());
        self.signals
            .around_child(|| {
                let (reader, writer) = std::io::pipe()?;
                let mut child = command(program.as_ref(), args)
                    .stdout(writer.try_clone()?)
                    .stderr(writer)
                    .spawn()?;
                let _tracked = self.signals.track(child.id());
                let copied = copy_chunks(reader, logger);
                let status = child.wait()?;
                copied?;
                Ok(exit_code(status))
            })
            .add_fn_name(function_path!())
    }

    /// Runs a child capturing its stdout; stderr goes to our stderr.
    #[named]
    pub fn run_captured<P, S>(&self, program: P, args: &[S]) -> Result<CapturedOutput>
    where
        P: AsRef<OsStr>,
        S: AsRef<OsStr>,
    {
        debug!("Running {:?} with output captured", program.as_ref());
        self.signals
            .around_child(|| {
                let child = command(program.as_ref(), args)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()?;
                let _tracked = self.signals.track(child.id());
                let output = child.wait_with_output()?;
                Ok(CapturedOutput {
                    exit_code: exit_code(output.status),
                    stdout: output.stdout,
                })
            })
            .add_fn_name(function_path!())
    }

    /// Runs a child sharing our stdout and stderr.
    #[named]
    pub fn run_inherited<P, S>(&self, program: P, args: &[S]) -> Result<i32>
    where
        P: AsRef<OsStr>,
        S: AsRef<OsStr>,
    {
        debug!("Running {:?}", program.as_ref());
        self.signals
            .around_child(|| {
                let mut child = command(program.as_ref(), args).spawn()?;
                let _tracked = self.signals.track(child.id());
                let status = child.wait()?;
                Ok(exit_code(status))
            })
            .add_fn_name(function_path!())
    }
}

fn copy_chunks(mut reader: PipeReader, logger: &Logger) -> Result<()> {
    let mut buffer = [0u8; OUTPUT_CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(n) => logger.write_output(&buffer[..n])?,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
