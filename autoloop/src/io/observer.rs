//! Live observers for child-process output lines.
//!
//! Agent runs can last hours; observers give the operator visibility while the
//! full text is still being accumulated for the invocation result.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Receives each output line as soon as it is read.
///
/// Called concurrently from the stdout and stderr reader threads.
pub trait LineObserver: Send + Sync {
    fn on_line(&self, stream: StreamKind, line: &str);
}

/// Discards every line.
pub struct NoopObserver;

impl LineObserver for NoopObserver {
    fn on_line(&self, _stream: StreamKind, _line: &str) {}
}

/// Forwards lines to `tracing` under the `autoloop::agent` target.
pub struct TracingObserver;

impl LineObserver for TracingObserver {
    fn on_line(&self, stream: StreamKind, line: &str) {
        info!(target: "autoloop::agent", stream = stream.as_str(), "{line}");
    }
}

/// Appends lines to a file, flushing after each one.
pub struct FileTee {
    writer: Mutex<BufWriter<File>>,
}

impl FileTee {
    pub fn append(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create stream dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open stream file {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl LineObserver for FileTee {
    fn on_line(&self, stream: StreamKind, line: &str) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let written = match stream {
            StreamKind::Stdout => writeln!(writer, "{line}"),
            StreamKind::Stderr => writeln!(writer, "[stderr] {line}"),
        };
        if let Err(e) = written.and_then(|()| writer.flush()) {
            warn!(err = %e, "failed to write to stream file");
        }
    }
}

/// Sends every line to each inner observer in order.
pub struct FanOut(pub Vec<Arc<dyn LineObserver>>);

impl LineObserver for FanOut {
    fn on_line(&self, stream: StreamKind, line: &str) {
        for observer in &self.0 {
            observer.on_line(stream, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_tee_appends_and_marks_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs/stream.log");
        let tee = FileTee::append(&path).expect("open");
        tee.on_line(StreamKind::Stdout, "hello");
        tee.on_line(StreamKind::Stderr, "oops");
        drop(tee);

        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "hello\n[stderr] oops\n");
    }

    #[test]
    fn fan_out_reaches_every_observer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = temp.path().join("a.log");
        let b = temp.path().join("b.log");
        let fan = FanOut(vec![
            Arc::new(FileTee::append(&a).expect("a")),
            Arc::new(FileTee::append(&b).expect("b")),
        ]);
        fan.on_line(StreamKind::Stdout, "line");
        drop(fan);

        assert_eq!(std::fs::read_to_string(a).expect("read a"), "line\n");
        assert_eq!(std::fs::read_to_string(b).expect("read b"), "line\n");
    }
}
