//! Peer-to-peer session layer.
//!
//! Sessions run over a [`Transport`]: TCP between processes, or an in-process
//! [`MemoryNetwork`] for tests and single-process demos. The [`SessionManager`] owns the
//! inbound and outbound sessions, the [`MotionMonitor`] pushes motion telemetry over the
//! inbound one, and every lifecycle change and record lands in an [`EventSink`].

mod connection;
mod error;
mod events;
mod motion;
mod notify;
mod session;
pub mod transport;

pub use connection::{READ_BUFFER_LEN, STOP_RECORD, SessionHandle};
pub use error::LinkError;
pub use events::{
    EventKind, EventRecord, EventSink, EventStream, FileEventSink, LOG_FILE, MemoryEventSink,
    RECEIVED_FILE, SENT_FILE, SESSION_MARKER,
};
pub use motion::{
    DEFAULT_SAMPLE_INTERVAL, MotionMonitor, MotionOutcome, MotionSample, MotionSource,
    MotionSubscription, STOP_DISPLAY_MS, STOP_THRESHOLD, ScriptedMotion, StopIndicator,
    TelemetryChannel, subscribe,
};
pub use notify::{LogNotifier, Notifier, RecordingNotifier};
pub use session::{Role, SessionControl, SessionManager, SessionState, SessionStatus};
pub use transport::{
    Connection, JournalEntry, Listener, MemoryNetwork, MemoryTransport, TcpTransport, Transport,
};
