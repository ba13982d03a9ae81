//! `tracing`-based logging, with level mapped from `-T` and an optional
//! size-capped file sink for `-F`/`-S` (`spec.md §6`).

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// `-T` maps onto five levels (`0..4` inclusive), matching the range the CLI
/// documents rather than `tracing`'s own five-level scale one-for-one.
fn level_filter(log_level: u8) -> LevelFilter {
    match log_level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// A file writer that rolls the current log file to `<path>.1` once it
/// exceeds `cap` bytes, checked before each write. `cap == 0` disables
/// rotation (the file grows unbounded).
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<RotatingInner>,
}

struct RotatingInner {
    path: PathBuf,
    cap: u64,
    file: Mutex<File>,
}

impl RotatingWriter {
    pub fn open(path: PathBuf, cap: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Arc::new(RotatingInner { path, cap, file: Mutex::new(file) }),
        })
    }
}

fn rolled_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(".1");
    PathBuf::from(name)
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.inner.file.lock().unwrap();
        if self.inner.cap > 0 {
            let len = file.metadata()?.len();
            if len + buf.len() as u64 > self.inner.cap {
                // Renaming the currently-open file is safe on POSIX: this
                // handle keeps writing to the now-unlinked-by-name inode
                // until it is replaced below, so no in-flight write is lost.
                let _ = std::fs::rename(&self.inner.path, rolled_path(&self.inner.path));
                *file = OpenOptions::new().create(true).append(true).open(&self.inner.path)?;
            }
        }
        file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.file.lock().unwrap().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global `tracing` subscriber. `log_file` additionally tees
/// output, via a non-blocking `tracing-appender` worker, to a
/// [`RotatingWriter`] capped at `log_file_size` bytes; `stderr` always
/// receives output (subject to `level`).
///
/// The returned [`tracing_appender::non_blocking::WorkerGuard`] must be kept
/// alive for the process lifetime — dropping it stops the background
/// flusher, silently truncating any buffered-but-unwritten log lines.
pub fn init(
    log_level: u8,
    log_file: Option<&Path>,
    log_file_size: u64,
) -> io::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = level_filter(log_level);
    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false);

    match log_file {
        Some(path) => {
            let file_writer = RotatingWriter::open(path.to_path_buf(), log_file_size)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_writer);
            builder.with_writer(io::stderr.and(non_blocking)).init();
            Ok(Some(guard))
        }
        None => {
            builder.with_writer(io::stderr).init();
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_maps_the_documented_range() {
        assert_eq!(level_filter(0), LevelFilter::OFF);
        assert_eq!(level_filter(1), LevelFilter::ERROR);
        assert_eq!(level_filter(2), LevelFilter::INFO);
        assert_eq!(level_filter(3), LevelFilter::DEBUG);
        assert_eq!(level_filter(4), LevelFilter::TRACE);
        assert_eq!(level_filter(255), LevelFilter::TRACE);
    }

    #[test]
    fn rotates_once_the_cap_is_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jiufengd.log");
        let mut writer = RotatingWriter::open(path.clone(), 16).unwrap();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();

        let rolled = rolled_path(&path);
        assert!(rolled.exists(), "first 16+ bytes should have rolled to {rolled:?}");
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
    }

    #[test]
    fn zero_cap_never_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jiufengd.log");
        let mut writer = RotatingWriter::open(path.clone(), 0).unwrap();

        for _ in 0..5 {
            writer.write_all(b"0123456789").unwrap();
        }
        assert!(!rolled_path(&path).exists());
        assert_eq!(std::fs::read(&path).unwrap().len(), 50);
    }
}
