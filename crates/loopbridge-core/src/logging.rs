//! Rotating process-tagged log files.
//!
//! Failures and operational events are mirrored into
//! `loopbridge-<pid>-<seq>.log` segments inside a directory supplied by
//! the invoking process. One background loop services two timed wake-ups:
//! a rotation tick that swaps in a fresh segment (draining and closing the
//! retired writer before it is dropped) and a flush tick that pushes
//! buffered records to disk. The [`LogWriter`] handle plugs into a
//! `tracing_subscriber` fmt layer.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;
use tracing_subscriber::fmt::MakeWriter;

use crate::daemon::ShutdownSignal;

struct Sink {
    file: BufWriter<File>,
}

/// Cloneable writer handle for a [`RotatingLog`].
#[derive(Clone)]
pub struct LogWriter {
    shared: Arc<Mutex<Sink>>,
}

impl LogWriter {
    /// Push everything buffered so far to disk.
    pub fn flush_now(&self) -> io::Result<()> {
        self.shared
            .lock()
            .map_err(|_| io::Error::other("log sink poisoned"))?
            .file
            .flush()
    }
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared
            .lock()
            .map_err(|_| io::Error::other("log sink poisoned"))?
            .file
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_now()
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Owns the active log segment and its rotation/flush schedule.
pub struct RotatingLog {
    shared: Arc<Mutex<Sink>>,
    dir: PathBuf,
    rotate_every: Duration,
    flush_every: Duration,
    max_files: usize,
    seq: u64,
}

impl RotatingLog {
    /// Open the first segment in `dir` and return the rotator plus the
    /// writer handle to hand to the tracing layer.
    pub fn open(
        dir: &Path,
        rotate_every: Duration,
        flush_every: Duration,
        max_files: usize,
    ) -> io::Result<(Self, LogWriter)> {
        std::fs::create_dir_all(dir)?;
        let seq = 0;
        let file = open_segment(dir, seq)?;
        let shared = Arc::new(Mutex::new(Sink { file }));
        let writer = LogWriter {
            shared: Arc::clone(&shared),
        };
        Ok((
            Self {
                shared,
                dir: dir.to_path_buf(),
                rotate_every,
                flush_every,
                max_files,
                seq,
            },
            writer,
        ))
    }

    /// Service the rotate and flush timers until the shutdown signal, then
    /// flush one last time.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<ShutdownSignal>) {
        let start = tokio::time::Instant::now();
        let mut rotate = tokio::time::interval_at(start + self.rotate_every, self.rotate_every);
        let mut flush = tokio::time::interval_at(start + self.flush_every, self.flush_every);

        loop {
            tokio::select! {
                _ = rotate.tick() => {
                    if let Err(e) = self.rotate() {
                        warn!(error = %e, "log rotation failed");
                    }
                }
                _ = flush.tick() => {
                    self.flush();
                }
                _ = shutdown_rx.recv() => {
                    self.flush();
                    break;
                }
            }
        }
    }

    /// Swap in a fresh segment. The retired writer is drained and closed
    /// before being dropped, then segments beyond the retention count are
    /// pruned.
    fn rotate(&mut self) -> io::Result<()> {
        let next = open_segment(&self.dir, self.seq + 1)?;
        self.seq += 1;

        let mut retired = {
            let mut sink = self
                .shared
                .lock()
                .map_err(|_| io::Error::other("log sink poisoned"))?;
            std::mem::replace(&mut sink.file, next)
        };
        retired.flush()?;
        drop(retired);

        self.prune();
        Ok(())
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.shared.lock() {
            if let Err(e) = sink.file.flush() {
                warn!(error = %e, "log flush failed");
            }
        }
    }

    /// Remove this process's oldest segments beyond the retention count.
    fn prune(&self) {
        let prefix = segment_prefix();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut segments: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".log"))
            })
            .collect();
        segments.sort();

        while segments.len() > self.max_files {
            let oldest = segments.remove(0);
            if let Err(e) = std::fs::remove_file(&oldest) {
                warn!(path = %oldest.display(), error = %e, "failed to prune log segment");
            }
        }
    }
}

fn segment_prefix() -> String {
    format!("loopbridge-{}-", std::process::id())
}

fn open_segment(dir: &Path, seq: u64) -> io::Result<BufWriter<File>> {
    let path = dir.join(format!("{}{seq:04}.log", segment_prefix()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}
