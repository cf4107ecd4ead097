use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use super::{Connection, Listener, Transport};
use crate::error::LinkError;

const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
/// Overall budget for an outbound connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Each connect attempt is bounded by this so a cancel is noticed promptly.
const CONNECT_POLL: Duration = Duration::from_millis(100);

/// TCP stand-in for the radio link.
///
/// Peers are addressed by their marker address and resolved to socket addresses through a
/// static directory.
pub struct TcpTransport {
    listen_addr: SocketAddr,
    directory: HashMap<String, SocketAddr>,
}

impl TcpTransport {
    pub fn new(listen_addr: SocketAddr, directory: HashMap<String, SocketAddr>) -> Self {
        Self {
            listen_addr,
            directory,
        }
    }

    pub fn resolve(&self, peer: &str) -> Option<SocketAddr> {
        self.directory.get(peer).copied()
    }

    /// Bind the listening socket, exposing the concrete listener type.
    pub fn bind(&self) -> Result<TcpEndpointListener, LinkError> {
        let listener = TcpListener::bind(self.listen_addr)?;
        let local = listener.local_addr()?;
        debug!(%local, "link listener bound");
        Ok(TcpEndpointListener {
            listener,
            local,
            closed: AtomicBool::new(false),
        })
    }
}

impl Transport for TcpTransport {
    fn listen(&self) -> Result<Box<dyn Listener>, LinkError> {
        Ok(Box::new(self.bind()?))
    }

    fn connect_cancellable(
        &self,
        peer: &str,
        cancelled: &AtomicBool,
    ) -> Result<Box<dyn Connection>, LinkError> {
        let addr = self
            .resolve(peer)
            .ok_or_else(|| LinkError::UnknownPeer(peer.to_owned()))?;
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let stream = loop {
            if cancelled.load(Ordering::SeqCst) {
                return Err(LinkError::Cancelled);
            }
            match TcpStream::connect_timeout(&addr, CONNECT_POLL) {
                Ok(stream) => break stream,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) && Instant::now() < deadline =>
                {
                    trace!(%addr, "connect attempt timed out, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        };
        if cancelled.load(Ordering::SeqCst) {
            debug!(%addr, "dropping connection established after cancel");
            let _ = stream.shutdown(Shutdown::Both);
            return Err(LinkError::Cancelled);
        }
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpConnection::new(stream, peer.to_owned())))
    }
}

pub struct TcpEndpointListener {
    listener: TcpListener,
    local: SocketAddr,
    closed: AtomicBool,
}

impl TcpEndpointListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn wake_addr(&self) -> SocketAddr {
        let ip = match self.local.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.local.port())
    }
}

impl Listener for TcpEndpointListener {
    fn accept(&self) -> Result<Box<dyn Connection>, LinkError> {
        match self.listener.accept() {
            Ok((stream, remote)) => {
                if self.closed.load(Ordering::SeqCst) {
                    trace!(%remote, "dropping connection accepted after close");
                    let _ = stream.shutdown(Shutdown::Both);
                    return Err(LinkError::Cancelled);
                }
                stream.set_nodelay(true)?;
                Ok(Box::new(TcpConnection::new(stream, remote.to_string())))
            }
            Err(_) if self.closed.load(Ordering::SeqCst) => Err(LinkError::Cancelled),
            Err(err) => Err(err.into()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // std offers no way to interrupt a blocking accept; a throwaway connection does.
        if let Err(err) = TcpStream::connect_timeout(&self.wake_addr(), WAKE_CONNECT_TIMEOUT) {
            debug!(error = %err, "listener wake-up connect failed");
        }
    }
}

pub struct TcpConnection {
    stream: TcpStream,
    peer: String,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Self { stream, peer }
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(bytes)
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
