use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{LazyLock, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub const LOG_ENV: &str = "CONVOY_LOG";

/// File receiving a copy of every log line while a run is in progress.
static RUN_LOG: LazyLock<Mutex<Option<File>>> = LazyLock::new(|| Mutex::new(None));

/// Install the global subscriber. `CONVOY_LOG` overrides the level.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(console::colors_enabled_stderr())
        .with_writer(RunLogMakeWriter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Start teeing log lines into `path` (created along with its parents).
pub fn attach_run_log(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if let Ok(mut slot) = RUN_LOG.lock() {
        *slot = Some(file);
    }
    Ok(())
}

pub fn detach_run_log() {
    if let Ok(mut slot) = RUN_LOG.lock() {
        *slot = None;
    }
}

#[derive(Clone, Copy)]
pub(crate) struct RunLogMakeWriter;

impl<'a> MakeWriter<'a> for RunLogMakeWriter {
    type Writer = RunLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter
    }
}

pub(crate) struct RunLogWriter;

impl Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        if let Ok(mut slot) = RUN_LOG.lock()
            && let Some(file) = slot.as_mut()
        {
            let line = String::from_utf8_lossy(buf);
            // A failing log file must not take stderr logging down with it.
            let _ = file.write_all(console::strip_ansi_codes(&line).as_bytes());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        if let Ok(mut slot) = RUN_LOG.lock()
            && let Some(file) = slot.as_mut()
        {
            let _ = file.flush();
        }
        Ok(())
    }
}
