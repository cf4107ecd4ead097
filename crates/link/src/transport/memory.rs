use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use tracing::trace;

use super::{Connection, Listener, Transport};
use crate::error::LinkError;

const DELAY_SLICE: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection lifecycle as observed by the in-process network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    Opened { id: u64, from: String, to: String },
    Closed { id: u64, by: String },
}

struct NetworkInner {
    endpoints: Mutex<HashMap<String, Sender<MemoryConnection>>>,
    journal: Mutex<Vec<JournalEntry>>,
    connect_delay: Mutex<Duration>,
    next_id: AtomicU64,
}

/// In-process network of named endpoints joined by record-preserving duplex pipes.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: Mutex::new(HashMap::new()),
                journal: Mutex::new(Vec::new()),
                connect_delay: Mutex::new(Duration::ZERO),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Transport for the device that owns `address`.
    pub fn transport(&self, address: &str) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: address.to_owned(),
        }
    }

    /// Delay applied to every connect, to model a slow radio handshake.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.inner.connect_delay) = delay;
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.inner.journal).clone()
    }

    fn record(&self, entry: JournalEntry) {
        trace!(?entry, "memory network");
        lock(&self.inner.journal).push(entry);
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local: String,
}

impl MemoryTransport {
    pub fn local_address(&self) -> &str {
        &self.local
    }
}

impl Transport for MemoryTransport {
    fn listen(&self) -> Result<Box<dyn Listener>, LinkError> {
        let (incoming_tx, incoming) = unbounded();
        let (closed_tx, closed_rx) = unbounded();
        lock(&self.network.inner.endpoints).insert(self.local.clone(), incoming_tx);
        Ok(Box::new(MemoryListener {
            network: self.network.clone(),
            address: self.local.clone(),
            incoming,
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx,
        }))
    }

    fn connect_cancellable(
        &self,
        peer: &str,
        cancelled: &AtomicBool,
    ) -> Result<Box<dyn Connection>, LinkError> {
        let delay = *lock(&self.network.inner.connect_delay);
        let ready_at = Instant::now() + delay;
        loop {
            if cancelled.load(Ordering::SeqCst) {
                trace!(peer, "memory connect cancelled");
                return Err(LinkError::Cancelled);
            }
            let now = Instant::now();
            if now >= ready_at {
                break;
            }
            thread::sleep(DELAY_SLICE.min(ready_at - now));
        }
        let endpoint = lock(&self.network.inner.endpoints)
            .get(peer)
            .cloned()
            .ok_or_else(|| LinkError::UnknownPeer(peer.to_owned()))?;

        let id = self.network.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (to_server, server_inbound) = unbounded();
        let (to_client, client_inbound) = unbounded();
        let client = MemoryConnection::new(
            id,
            self.network.clone(),
            self.local.clone(),
            peer.to_owned(),
            to_server,
            client_inbound,
        );
        let server = MemoryConnection::new(
            id,
            self.network.clone(),
            peer.to_owned(),
            self.local.clone(),
            to_client,
            server_inbound,
        );
        if endpoint.send(server).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{peer} is not listening"),
            )
            .into());
        }
        self.network.record(JournalEntry::Opened {
            id,
            from: self.local.clone(),
            to: peer.to_owned(),
        });
        Ok(Box::new(client))
    }
}

pub struct MemoryListener {
    network: MemoryNetwork,
    address: String,
    incoming: Receiver<MemoryConnection>,
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

impl Listener for MemoryListener {
    fn accept(&self) -> Result<Box<dyn Connection>, LinkError> {
        select! {
            recv(self.incoming) -> conn => match conn {
                Ok(conn) => Ok(Box::new(conn)),
                Err(_) => Err(LinkError::Cancelled),
            },
            recv(self.closed_rx) -> _ => Err(LinkError::Cancelled),
        }
    }

    fn close(&self) {
        lock(&self.network.inner.endpoints).remove(&self.address);
        lock(&self.closed_tx).take();
    }
}

pub struct MemoryConnection {
    id: u64,
    network: MemoryNetwork,
    local: String,
    peer: String,
    outbound: Mutex<Option<Sender<Vec<u8>>>>,
    inbound: Receiver<Vec<u8>>,
    leftover: Mutex<Vec<u8>>,
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

impl MemoryConnection {
    fn new(
        id: u64,
        network: MemoryNetwork,
        local: String,
        peer: String,
        outbound: Sender<Vec<u8>>,
        inbound: Receiver<Vec<u8>>,
    ) -> Self {
        let (closed_tx, closed_rx) = unbounded();
        Self {
            id,
            network,
            local,
            peer,
            outbound: Mutex::new(Some(outbound)),
            inbound,
            leftover: Mutex::new(Vec::new()),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn drain_into(pending: &mut Vec<u8>, buf: &mut [u8]) -> usize {
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.drain(..n);
        n
    }
}

impl Connection for MemoryConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut leftover = lock(&self.leftover);
            if !leftover.is_empty() {
                return Ok(Self::drain_into(&mut leftover, buf));
            }
        }
        select! {
            recv(self.inbound) -> record => match record {
                Ok(mut record) => {
                    let n = Self::drain_into(&mut record, buf);
                    if !record.is_empty() {
                        *lock(&self.leftover) = record;
                    }
                    Ok(n)
                }
                Err(_) => Ok(0),
            },
            recv(self.closed_rx) -> _ => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed locally",
            )),
        }
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        };
        tx.send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed the connection"))
    }

    fn close(&self) {
        let was_open = lock(&self.outbound).take().is_some();
        lock(&self.closed_tx).take();
        if was_open {
            self.network.record(JournalEntry::Closed {
                id: self.id,
                by: self.local.clone(),
            });
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_arrive_intact_and_close_reads_as_eof() {
        let network = MemoryNetwork::new();
        let server = network.transport("AA:BB:CC:DD:EE:FF");
        let client = network.transport("11:22:33:44:55:66");
        let listener = server.listen().expect("listen");

        let outbound = client.connect("AA:BB:CC:DD:EE:FF").expect("connect");
        let inbound = listener.accept().expect("accept");
        assert_eq!(inbound.peer(), "11:22:33:44:55:66");

        outbound.write(b"0.1,0.2,9.8\n").expect("write");
        let mut buf = [0u8; 128];
        let n = inbound.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"0.1,0.2,9.8\n");

        outbound.close();
        assert_eq!(inbound.read(&mut buf).expect("eof"), 0);

        let journal = network.journal();
        assert_eq!(journal.len(), 2);
        assert!(matches!(&journal[1], JournalEntry::Closed { by, .. } if by == "11:22:33:44:55:66"));
    }

    #[test]
    fn cancelling_a_delayed_connect_leaves_no_trace() {
        let network = MemoryNetwork::new();
        let listener = network.transport("AA:BB:CC:DD:EE:FF").listen().expect("listen");
        network.set_connect_delay(Duration::from_millis(500));
        let cancelled = Arc::new(AtomicBool::new(false));

        let attempt = {
            let client = network.transport("11:22:33:44:55:66");
            let cancelled = cancelled.clone();
            thread::spawn(move || {
                client
                    .connect_cancellable("AA:BB:CC:DD:EE:FF", &cancelled)
                    .map(|_| ())
            })
        };
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        cancelled.store(true, Ordering::SeqCst);
        let outcome = attempt.join().expect("connect thread");
        assert!(matches!(outcome, Err(LinkError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(network.journal().is_empty());
        listener.close();
        assert!(matches!(listener.accept(), Err(LinkError::Cancelled)));
    }

    #[test]
    fn oversized_records_are_split_across_reads() {
        let network = MemoryNetwork::new();
        let listener = network.transport("AA:BB:CC:DD:EE:FF").listen().expect("listen");
        let outbound = network
            .transport("11:22:33:44:55:66")
            .connect("AA:BB:CC:DD:EE:FF")
            .expect("connect");
        let inbound = listener.accept().expect("accept");

        outbound.write(b"abcdef").expect("write");
        let mut buf = [0u8; 4];
        assert_eq!(inbound.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(inbound.read(&mut buf).expect("read"), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn local_close_aborts_a_blocked_read_and_listener_close_aborts_accept() {
        let network = MemoryNetwork::new();
        let listener = network.transport("AA:BB:CC:DD:EE:FF").listen().expect("listen");
        let outbound = network
            .transport("11:22:33:44:55:66")
            .connect("AA:BB:CC:DD:EE:FF")
            .expect("connect");
        let _inbound = listener.accept().expect("accept");

        outbound.close();
        let mut buf = [0u8; 8];
        let err = outbound.read(&mut buf).expect_err("closed locally");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        listener.close();
        assert!(matches!(listener.accept(), Err(LinkError::Cancelled)));
        assert!(matches!(
            network.transport("11:22:33:44:55:66").connect("AA:BB:CC:DD:EE:FF"),
            Err(LinkError::UnknownPeer(_))
        ));
    }
}
