use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Append-only log file that can be reopened in place after an external
/// rotation moved it aside.
pub struct ReopenableFile {
    path: PathBuf,
    file: parking_lot::Mutex<File>,
}

impl ReopenableFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: parking_lot::Mutex::new(append_handle(path)?),
        })
    }

    /// Reopens the file at the original path, picking up the fresh inode.
    pub fn reopen(&self) -> io::Result<()> {
        *self.file.lock() = append_handle(&self.path)?;
        Ok(())
    }
}

fn append_handle(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `MakeWriter` handle over a shared reopenable file.
#[derive(Clone)]
pub struct ReopenWriter(Arc<ReopenableFile>);

impl Write for ReopenWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.file.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for ReopenWriter {
    type Writer = ReopenWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initializes the global tracing subscriber.
///
/// With `log.path` configured, output goes to `path/file` through a
/// reopenable writer; otherwise to stderr. Returns the file handle needed
/// by the rotation listener, or None when logging to stderr.
pub fn init(cfg: &LogConfig) -> Result<Option<Arc<ReopenableFile>>> {
    let filter = EnvFilter::try_new(&cfg.level)
        .with_context(|| format!("invalid log level: {}", cfg.level))?;

    if cfg.path.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(true)
            .init();
        return Ok(None);
    }

    let path = Path::new(&cfg.path).join(&cfg.file);
    let file = Arc::new(
        ReopenableFile::open(&path)
            .with_context(|| format!("opening logfile {}", path.display()))?,
    );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(ReopenWriter(Arc::clone(&file)))
        .with_target(true)
        .with_ansi(false)
        .init();

    Ok(Some(file))
}

/// Reopens the log file whenever SIGUSR2 arrives. Spawned only when
/// `log.rotate` is enabled; lives for the process lifetime.
pub fn spawn_rotation_listener(file: Arc<ReopenableFile>) {
    tokio::spawn(async move {
        let mut usr2 = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined2()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to register SIGUSR2 handler");
                return;
            }
        };

        while usr2.recv().await.is_some() {
            match file.reopen() {
                Ok(()) => info!("logfile reopened"),
                Err(e) => warn!(error = %e, "logfile reopen failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopen_switches_to_fresh_inode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hurricane.log");

        let file = ReopenableFile::open(&path).expect("open");
        {
            let mut writer = ReopenWriter(Arc::new(file));
            writer.write_all(b"before\n").expect("write");

            // external rotation moves the file aside
            std::fs::rename(&path, dir.path().join("hurricane.log.1")).expect("rename");
            writer.0.reopen().expect("reopen");
            writer.write_all(b"after\n").expect("write");
        }

        let rotated = std::fs::read_to_string(dir.path().join("hurricane.log.1")).expect("read");
        let current = std::fs::read_to_string(&path).expect("read");
        assert_eq!(rotated, "before\n");
        assert_eq!(current, "after\n");
    }
}
