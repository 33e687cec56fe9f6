use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, error};

/// Number of buffered lines that triggers a flush to disk.
const FLUSH_THRESHOLD: usize = 10_000;

/// The append-only log of observable events. Exactly two line kinds exist:
///
/// * `b <seq>` - this process broadcast (or enqueued for sending) seq
/// * `d <origin> <seq>` - this process delivered seq from origin
///
/// Lines are buffered in memory and flushed when the buffer fills up, on
/// explicit [`flush`](EventLog::flush), and on drop. The file is opened in
/// append mode for every flush, so a crash mid-run leaves a prefix of the
/// intended output on disk. All access is serialised on an internal lock.
pub struct EventLog {
    inner: Mutex<EventLogInner>,
}

struct EventLogInner {
    path: PathBuf,
    buffer: Vec<String>,
    flush_threshold: usize,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> EventLog {
        Self::with_flush_threshold(path, FLUSH_THRESHOLD)
    }

    pub fn with_flush_threshold(path: impl Into<PathBuf>, flush_threshold: usize) -> EventLog {
        EventLog {
            inner: Mutex::new(EventLogInner {
                path: path.into(),
                buffer: Vec::with_capacity(flush_threshold),
                flush_threshold,
            }),
        }
    }

    pub fn log_broadcast(&self, seq: u32) {
        let mut inner = self.inner.lock().expect("event log lock poisoned");
        inner.buffer.push(format!("b {}", seq));
        if inner.buffer.len() >= inner.flush_threshold {
            inner.flush();
        }
    }

    pub fn log_delivery(&self, origin: u32, seq: u32) {
        let mut inner = self.inner.lock().expect("event log lock poisoned");
        inner.buffer.push(format!("d {} {}", origin, seq));
        if inner.buffer.len() >= inner.flush_threshold {
            inner.flush();
        }
    }

    pub fn flush(&self) {
        self.inner.lock().expect("event log lock poisoned")
            .flush();
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.flush();
    }
}

impl EventLogInner {
    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path);
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                // flushing is best effort: keep the buffer and hope the next
                // attempt succeeds
                error!("failed to open event log {:?}: {}", self.path, e);
                return;
            }
        };

        let mut out = String::new();
        for line in &self.buffer {
            out.push_str(line);
            out.push('\n');
        }
        if let Err(e) = file.write_all(out.as_bytes()) {
            error!("failed to write event log {:?}: {}", self.path, e);
            return;
        }

        debug!("flushed {} event log lines to {:?}", self.buffer.len(), self.path);
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let log = EventLog::new(&path);
        log.log_broadcast(1);
        log.log_delivery(2, 7);
        log.log_broadcast(2);

        // nothing reaches the file before an explicit flush
        assert!(!path.exists());

        log.flush();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b 1\nd 2 7\nb 2\n");

        // flushing an empty buffer appends nothing
        log.flush();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b 1\nd 2 7\nb 2\n");
    }

    #[test]
    fn test_flush_on_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let log = EventLog::with_flush_threshold(&path, 3);
        log.log_broadcast(1);
        log.log_broadcast(2);
        assert!(!path.exists());

        log.log_broadcast(3);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b 1\nb 2\nb 3\n");
    }

    #[test]
    fn test_flush_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        {
            let log = EventLog::new(&path);
            log.log_broadcast(1);
            log.flush();
        }
        {
            let log = EventLog::new(&path);
            log.log_delivery(1, 1);
            // drop flushes the remainder
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b 1\nd 1 1\n");
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let log = std::sync::Arc::new(EventLog::new(&path));
        let handles = (0..4)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for seq in 1..=100u32 {
                        log.log_delivery(t, seq);
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        log.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 400);
        for t in 0..4 {
            for seq in 1..=100u32 {
                assert!(content.lines().any(|l| l == format!("d {} {}", t, seq)));
            }
        }
    }
}
