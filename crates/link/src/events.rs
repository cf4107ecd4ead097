//! Append-only record of link activity.
//!
//! Lifecycle and stop events go to one stream, outbound and inbound data to two others.
//! Every record carries the local wall-clock time in epoch milliseconds.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use tracing::{debug, warn};

/// First line written to every stream when a run starts.
pub const SESSION_MARKER: &str = "---NEW SESSION---";

pub const LOG_FILE: &str = "log.txt";
pub const SENT_FILE: &str = "sent_data.txt";
pub const RECEIVED_FILE: &str = "received_data.txt";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    ConnectFailed,
    /// The engaged peer showed its stop marker.
    PeerStop,
    /// The local stop indicator switched on.
    LocalStop,
    Sent(String),
    Received(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStream {
    Log,
    Sent,
    Received,
}

impl EventKind {
    pub fn stream(&self) -> EventStream {
        match self {
            EventKind::Sent(_) => EventStream::Sent,
            EventKind::Received(_) => EventStream::Received,
            _ => EventStream::Log,
        }
    }

    /// Tag of lifecycle records, or the payload of data records.
    pub fn label(&self) -> &str {
        match self {
            EventKind::Connecting => "BT_CONNECTING",
            EventKind::Connected => "BT_CONNECTED",
            EventKind::Disconnecting => "BT_DISCONNECTING",
            EventKind::Disconnected => "BT_DISCONNECTED",
            EventKind::ConnectFailed => "BT_CONNECT_FAILED",
            EventKind::PeerStop => "QR_STOP",
            EventKind::LocalStop => "LOCAL_STOP",
            EventKind::Sent(payload) | EventKind::Received(payload) => payload,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub at_ms: i64,
}

impl EventRecord {
    pub fn at(kind: EventKind, at_ms: i64) -> Self {
        Self { kind, at_ms }
    }

    pub fn now(kind: EventKind) -> Self {
        Self::at(kind, Utc::now().timestamp_millis())
    }

    pub fn line(&self) -> String {
        format!("{},{}", self.kind.label(), self.at_ms)
    }
}

pub trait EventSink: Send + Sync {
    fn append(&self, record: EventRecord);

    fn flush(&self) {}
}

struct SinkFiles {
    log: BufWriter<File>,
    sent: BufWriter<File>,
    received: BufWriter<File>,
}

impl SinkFiles {
    fn stream(&mut self, stream: EventStream) -> &mut BufWriter<File> {
        match stream {
            EventStream::Log => &mut self.log,
            EventStream::Sent => &mut self.sent,
            EventStream::Received => &mut self.received,
        }
    }

    fn flush_all(&mut self) -> io::Result<()> {
        self.log.flush()?;
        self.sent.flush()?;
        self.received.flush()
    }
}

/// Event sink writing `log.txt`, `sent_data.txt` and `received_data.txt` in one directory.
pub struct FileEventSink {
    dir: PathBuf,
    files: Mutex<SinkFiles>,
}

impl FileEventSink {
    /// Open (or create) the three streams in `dir` and mark the start of a new run in each.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let open = |name: &str| -> io::Result<BufWriter<File>> {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))?;
            let mut writer = BufWriter::new(file);
            writeln!(writer, "{SESSION_MARKER}")?;
            Ok(writer)
        };
        let mut files = SinkFiles {
            log: open(LOG_FILE)?,
            sent: open(SENT_FILE)?,
            received: open(RECEIVED_FILE)?,
        };
        files.flush_all()?;
        debug!(dir = %dir.display(), "event sink opened");
        Ok(Self {
            dir,
            files: Mutex::new(files),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn files(&self) -> MutexGuard<'_, SinkFiles> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for FileEventSink {
    fn append(&self, record: EventRecord) {
        let mut files = self.files();
        let writer = files.stream(record.kind.stream());
        if let Err(err) = writeln!(writer, "{}", record.line()) {
            warn!(error = %err, record = %record.line(), "failed to append event record");
        }
    }

    fn flush(&self) {
        if let Err(err) = self.files().flush_all() {
            warn!(error = %err, "failed to flush event sink");
        }
    }
}

impl Drop for FileEventSink {
    fn drop(&mut self) {
        let _ = self.files().flush_all();
    }
}

/// Event sink keeping records in memory.
#[derive(Default)]
pub struct MemoryEventSink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.records().into_iter().map(|record| record.kind).collect()
    }

    pub fn count(&self, kind: &EventKind) -> usize {
        self.records()
            .iter()
            .filter(|record| &record.kind == kind)
            .count()
    }
}

impl EventSink for MemoryEventSink {
    fn append(&self, record: EventRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
