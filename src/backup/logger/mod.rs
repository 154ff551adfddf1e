//! User-facing execution logs.
//!
//! A [`Logger`] is a cheap, cloneable handle on a [`LogTarget`]. Targets
//! receive raw subprocess output through [`LogTarget::write_output`] and
//! messages through [`LogTarget::log`]. Sinks that need whole lines sit
//! behind [`LineBuffered`].

pub mod sinks;

use crate::backup::result_error::result::Result;
use derive_more::Display;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Longest partial line kept back before it is forwarded anyway.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum Severity {
    #[display("debug")]
    Debug,
    #[display("info")]
    Info,
    #[display("notice")]
    Notice,
    #[display("warning")]
    Warning,
    #[display("err")]
    Err,
}

pub trait LogTarget: Send {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn log(&mut self, severity: Severity, message: &str) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct Logger(Arc<Mutex<dyn LogTarget>>);

impl Logger {
    pub fn new<T: LogTarget + 'static>(target: T) -> Self {
        Self(Arc::new(Mutex::new(target)))
    }

    fn lock(&self) -> MutexGuard<'_, dyn LogTarget + 'static> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write_output(&self, bytes: &[u8]) -> Result<()> {
        Ok(self.lock().write_output(bytes)?)
    }

    pub fn log<S: AsRef<str>>(&self, severity: Severity, message: S) -> Result<()> {
        Ok(self.lock().log(severity, message.as_ref())?)
    }

    pub fn flush(&self) -> Result<()> {
        Ok(self.lock().flush()?)
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Logger")
    }
}

impl LogTarget for Logger {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.lock().write_output(bytes)
    }

    fn log(&mut self, severity: Severity, message: &str) -> io::Result<()> {
        self.lock().log(severity, message)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

/// Splits arbitrary output chunks into whole lines for `inner`.
pub struct LineBuffered<T: LogTarget> {
    inner: T,
    pending: Vec<u8>,
}

impl<T: LogTarget> LineBuffered<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let partial = std::mem::take(&mut self.pending);
        self.inner.write_output(&partial)
    }
}

impl<T: LogTarget> LogTarget for LineBuffered<T> {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.pending.extend_from_slice(bytes);
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.inner.write_output(&line)?;
        }
        if self.pending.len() > MAX_PENDING_LINE {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn log(&mut self, severity: Severity, message: &str) -> io::Result<()> {
        self.flush_pending()?;
        self.inner.log(severity, message)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()?;
        self.inner.flush()
    }
}

/// Writes to every member; a failing member does not starve the others.
pub struct FanOut(Vec<Box<dyn LogTarget>>);

impl FanOut {
    pub fn new(targets: Vec<Box<dyn LogTarget>>) -> Self {
        Self(targets)
    }

    fn each<F: FnMut(&mut Box<dyn LogTarget>) -> io::Result<()>>(
        &mut self,
        mut f: F,
    ) -> io::Result<()> {
        let mut first_error = None;
        for target in &mut self.0 {
            if let Err(e) = f(target) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl LogTarget for FanOut {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.each(|t| t.write_output(bytes))
    }

    fn log(&mut self, severity: Severity, message: &str) -> io::Result<()> {
        self.each(|t| t.log(severity, message))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.each(|t| t.flush())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Entry, RecordingTarget};
    use super::*;

    #[test]
    fn test_line_buffered_emits_whole_lines() {
        let recording = RecordingTarget::default();
        let mut buffered = LineBuffered::new(recording.clone());

        buffered.write_output(b"first li").unwrap();
        buffered.write_output(b"ne\nsecond\nthi").unwrap();
        assert_eq!(
            recording.entries(),
            vec![
                Entry::Output("first line\n".into()),
                Entry::Output("second\n".into())
            ]
        );

        buffered.log(Severity::Notice, "done").unwrap();
        assert_eq!(
            &recording.entries()[2..],
            &[
                Entry::Output("thi".into()),
                Entry::Message(Severity::Notice, "done".into())
            ]
        );
    }

    #[test]
    fn test_line_buffered_bounds_pending_line() {
        let recording = RecordingTarget::default();
        let mut buffered = LineBuffered::new(recording.clone());
        buffered
            .write_output(&vec![b'x'; MAX_PENDING_LINE + 1])
            .unwrap();
        assert_eq!(recording.entries().len(), 1);
    }

    #[test]
    fn test_fan_out_reaches_every_target() {
        struct Failing;
        impl LogTarget for Failing {
            fn write_output(&mut self, _: &[u8]) -> io::Result<()> {
                Err(io::Error::other("broken sink"))
            }
            fn log(&mut self, _: Severity, _: &str) -> io::Result<()> {
                Err(io::Error::other("broken sink"))
            }
        }

        let a = RecordingTarget::default();
        let b = RecordingTarget::default();
        let mut fan_out = FanOut::new(vec![
            Box::new(a.clone()),
            Box::new(Failing),
            Box::new(b.clone()),
        ]);
        assert!(fan_out.log(Severity::Err, "boom").is_err());
        assert_eq!(a.messages(Severity::Err), vec!["boom".to_string()]);
        assert_eq!(b.messages(Severity::Err), vec!["boom".to_string()]);
    }

    #[test]
    fn test_logger_clones_share_target() {
        let recording = RecordingTarget::default();
        let logger = Logger::new(recording.clone());
        let clone = logger.clone();
        logger.write_output(b"a\n").unwrap();
        clone.log(Severity::Info, "b").unwrap();
        assert_eq!(recording.entries().len(), 2);
    }
}
