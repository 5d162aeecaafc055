//! Tracing setup: a terminal layer on stderr plus a per-instance log file.
//!
//! The subscriber is installed before we know whether the instance directory
//! exists, so the file layer starts out discarding and is pointed at
//! `<instance_dir>/ccvm.log` once there is somewhere to write.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type SharedFile = Arc<Mutex<Option<File>>>;

fn lock(inner: &SharedFile) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A `MakeWriter` that discards until [`LogFileHandle::set_file`] is called.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: SharedFile,
}

/// Activates the file layer of a [`DeferredFileWriter`].
#[derive(Clone)]
pub struct LogFileHandle {
    inner: SharedFile,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, LogFileHandle) {
        let inner: SharedFile = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            LogFileHandle { inner },
        )
    }
}

impl LogFileHandle {
    /// Start appending to `path`. The parent directory must already exist;
    /// the log never creates the instance directory itself.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }

    /// Like `set_file`, but a failure only costs us the log file.
    pub fn activate(&self, path: &Path) {
        if let Err(e) = self.set_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "cannot open log file");
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).is_some()
    }
}

pub struct DeferredWriter {
    inner: SharedFile,
}

impl Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Install the global subscriber. `verbose` shows debug output on stderr;
/// otherwise `RUST_LOG` applies on top of `ccvm=warn`.
pub fn init(verbose: bool) -> LogFileHandle {
    let terminal_filter = if verbose {
        EnvFilter::new("ccvm=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ccvm=warn"))
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(terminal_filter);

    let (file_writer, file_handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("ccvm=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    file_handle
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use super::*;

    #[test]
    fn discards_until_activated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccvm.log");
        let (writer, handle) = DeferredFileWriter::new();

        writer.make_writer().write_all(b"dropped\n").unwrap();
        assert!(!handle.is_active());
        assert!(!path.exists());

        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"kept\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "kept\n");
    }

    #[test]
    fn activate_into_missing_dir_stays_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let (_writer, handle) = DeferredFileWriter::new();
        handle.activate(&dir.path().join("missing").join("ccvm.log"));
        assert!(!handle.is_active());
        assert!(!dir.path().join("missing").exists());
    }
}
