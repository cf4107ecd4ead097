//! Reader/writer thread pair bound to one live connection.
//!
//! Records are newline-delimited ASCII. Reads use a small fixed buffer; trailing NUL padding
//! from peers that send fixed-size frames is stripped.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use tracing::{Span, debug, trace, warn};

use crate::{
    error::LinkError,
    events::{EventKind, EventRecord, EventSink},
    session::Role,
    transport::Connection,
};

pub const READ_BUFFER_LEN: usize = 128;
/// Control record announcing an emergency stop.
pub const STOP_RECORD: &str = "BT_STOP";
const WRITE_QUEUE_DEPTH: usize = 32;

pub(crate) type StopCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Non-owning handle used to send records on a live session.
#[derive(Clone)]
pub struct SessionHandle {
    role: Role,
    peer: Arc<str>,
    tx: Sender<String>,
}

impl SessionHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue `record` for sending. Best effort: returns `false` when the record was dropped
    /// because the session is gone or its queue is full.
    pub fn send(&self, record: &str) -> bool {
        match self.tx.try_send(record.to_owned()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::counter!("v2v_records_dropped_total").increment(1);
                debug!(peer = %self.peer, "write queue full, dropping record");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                metrics::counter!("v2v_records_dropped_total").increment(1);
                trace!(peer = %self.peer, "session closed, dropping record");
                false
            }
        }
    }
}

/// Closes a live connection from outside its threads.
#[derive(Clone)]
pub(crate) struct ConnectionCloser {
    conn: Arc<dyn Connection>,
    closing: Arc<AtomicBool>,
}

impl ConnectionCloser {
    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.conn.close();
    }
}

pub(crate) struct LiveConnection {
    handle: SessionHandle,
    closer: ConnectionCloser,
    stop_writer: Option<Sender<()>>,
    reader: Option<thread::JoinHandle<()>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl LiveConnection {
    /// Spawn the reader and writer threads for `conn`.
    pub(crate) fn start(
        role: Role,
        conn: Arc<dyn Connection>,
        sink: Arc<dyn EventSink>,
        on_stop: StopCallback,
    ) -> Result<Self, LinkError> {
        let peer: Arc<str> = Arc::from(conn.peer());
        let closing = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded::<String>(WRITE_QUEUE_DEPTH);
        let (stop_writer, stop_rx) = bounded::<()>(0);
        let span = Span::current();

        let writer = {
            let conn = conn.clone();
            let sink = sink.clone();
            let span = span.clone();
            thread::Builder::new()
                .name("v2v-link-writer".into())
                .spawn(move || {
                    let _entered = span.enter();
                    write_loop(conn.as_ref(), sink.as_ref(), rx, stop_rx)
                })
                .map_err(LinkError::spawn("link writer"))?
        };

        let reader = {
            let reader_conn = conn.clone();
            let closing = closing.clone();
            let spawned = thread::Builder::new()
                .name("v2v-link-reader".into())
                .spawn(move || {
                    let _entered = span.enter();
                    read_loop(
                        reader_conn.as_ref(),
                        sink.as_ref(),
                        &closing,
                        on_stop.as_ref(),
                    )
                });
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    drop(stop_writer);
                    conn.close();
                    let _ = writer.join();
                    return Err(LinkError::spawn("link reader")(err));
                }
            }
        };

        Ok(Self {
            handle: SessionHandle { role, peer, tx },
            closer: ConnectionCloser { conn, closing },
            stop_writer: Some(stop_writer),
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub(crate) fn closer(&self) -> ConnectionCloser {
        self.closer.clone()
    }

    /// Block until the reader ends (remote close, read error or local close).
    pub(crate) fn wait_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("link reader thread panicked");
            }
        }
    }

    /// Close the connection and join both threads.
    pub(crate) fn finish(mut self) {
        self.closer.close();
        self.wait_reader();
        self.stop_writer.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("link writer thread panicked");
            }
        }
    }
}

fn write_loop(
    conn: &dyn Connection,
    sink: &dyn EventSink,
    records: Receiver<String>,
    stop: Receiver<()>,
) {
    loop {
        let record = select! {
            recv(records) -> record => match record {
                Ok(record) => record,
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        };
        let mut line = record.clone().into_bytes();
        line.push(b'\n');
        match conn.write(&line) {
            Ok(()) => {
                metrics::counter!("v2v_records_sent_total").increment(1);
                sink.append(EventRecord::now(EventKind::Sent(record)));
            }
            Err(err) => {
                warn!(peer = conn.peer(), error = %err, "write failed, closing session");
                conn.close();
                break;
            }
        }
    }
}

fn read_loop(
    conn: &dyn Connection,
    sink: &dyn EventSink,
    closing: &AtomicBool,
    on_stop: &(dyn Fn(&str) + Send + Sync),
) {
    let mut buf = [0u8; READ_BUFFER_LEN];
    let mut pending = Vec::with_capacity(READ_BUFFER_LEN);
    loop {
        match conn.read(&mut buf) {
            Ok(0) => {
                debug!(peer = conn.peer(), "peer closed the connection");
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(end) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=end).collect();
                    handle_record(conn.peer(), &line, sink, on_stop);
                }
            }
            Err(err) => {
                if closing.load(Ordering::SeqCst) {
                    debug!(peer = conn.peer(), "connection closed locally");
                } else {
                    warn!(peer = conn.peer(), error = %err, "read failed");
                }
                break;
            }
        }
    }
    if !pending.is_empty() {
        handle_record(conn.peer(), &pending, sink, on_stop);
    }
}

fn handle_record(
    peer: &str,
    raw: &[u8],
    sink: &dyn EventSink,
    on_stop: &(dyn Fn(&str) + Send + Sync),
) {
    let text = String::from_utf8_lossy(raw);
    let record = text.trim_matches(|c: char| c == '\0' || c == '\n' || c == '\r');
    if record.is_empty() {
        return;
    }
    metrics::counter!("v2v_records_received_total").increment(1);
    trace!(peer, record, "record received");
    sink.append(EventRecord::now(EventKind::Received(record.to_owned())));
    if record == STOP_RECORD {
        on_stop(peer);
    }
}
