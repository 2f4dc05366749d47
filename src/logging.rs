use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::paths;

pub const LOG_FILE: &str = "vmconverge.log";

// ── LogFileWriter ────────────────────────────────────────

/// A `MakeWriter` appending to the log file, or discarding writes when the
/// file could not be opened. Logging never fails a run.
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl LogFileWriter {
    /// Open `path` in append mode, creating parent directories.
    pub fn open(path: &Path) -> Self {
        let file = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(path))
            .ok();
        Self {
            inner: Arc::new(Mutex::new(file)),
        }
    }

    #[cfg(test)]
    fn is_active(&self) -> bool {
        lock(&self.inner).is_some()
    }
}

fn lock(inner: &Mutex<Option<File>>) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LogWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()), // discard
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── Subscriber ───────────────────────────────────────────

/// Install the global subscriber: a stderr layer (`warn`, or `debug` with
/// `verbose`; `RUST_LOG` wins when set) and a file layer that always
/// captures `vmconverge=debug`.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let terminal_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(terminal_filter);

    let file_writer = LogFileWriter::open(&paths::logs_dir().join(LOG_FILE));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("vmconverge=debug"));

    // A second init (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .try_init();
}
