//! Owner of the inbound (server) and outbound (client) sessions.
//!
//! The server role accepts one connection at a time and binds motion telemetry to it. The
//! client role holds at most one outbound connection; replacing or cancelling it always
//! closes and joins the previous one first.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use tracing::{debug, info, info_span, warn};

use crate::{
    connection::{ConnectionCloser, LiveConnection, StopCallback},
    error::LinkError,
    events::{EventKind, EventRecord, EventSink},
    motion::{StopIndicator, TelemetryChannel},
    notify::Notifier,
    transport::{Connection, Listener, Transport},
};

/// Pause before accepting again after a failed accept.
const ACCEPT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Closing,
}

/// Snapshot of one role's session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub role: Role,
    pub state: SessionState,
    pub peer: Option<String>,
}

/// Session decisions issued by the proximity tracker.
pub trait SessionControl: Send + Sync {
    /// Replace any outbound session with a new one to `peer`.
    fn open_outbound(&self, peer: &str) -> Result<(), LinkError>;

    fn cancel_outbound(&self);
}

struct LinkContext {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    notifier: Arc<dyn Notifier>,
    stop: Arc<StopIndicator>,
    telemetry: Arc<TelemetryChannel>,
    server_status: Mutex<SessionStatus>,
    client_status: Mutex<SessionStatus>,
}

impl LinkContext {
    fn record(&self, kind: EventKind) {
        self.sink.append(EventRecord::now(kind));
    }

    fn set_status(&self, role: Role, state: SessionState, peer: Option<&str>) {
        let slot = match role {
            Role::Server => &self.server_status,
            Role::Client => &self.client_status,
        };
        let mut status = lock(slot);
        status.state = state;
        status.peer = peer.map(str::to_owned);
    }

    fn stop_callback(self: &Arc<Self>) -> StopCallback {
        let ctx = Arc::downgrade(self);
        Arc::new(move |peer: &str| {
            if let Some(ctx) = ctx.upgrade() {
                warn!(peer, "emergency stop received");
                ctx.notifier.notify(&format!("Emergency stop from {peer}!"));
                ctx.stop.trigger(Utc::now().timestamp_millis());
            }
        })
    }
}

struct ServerRole {
    listener: Arc<dyn Listener>,
    shutdown: Arc<AtomicBool>,
    current: Arc<Mutex<Option<ConnectionCloser>>>,
    handle: thread::JoinHandle<()>,
}

struct ClientRole {
    peer: String,
    cancelled: Arc<AtomicBool>,
    current: Arc<Mutex<Option<ConnectionCloser>>>,
    handle: thread::JoinHandle<()>,
}

pub struct SessionManager {
    ctx: Arc<LinkContext>,
    server: Mutex<Option<ServerRole>>,
    client: Mutex<Option<ClientRole>>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        notifier: Arc<dyn Notifier>,
        stop: Arc<StopIndicator>,
    ) -> Self {
        let status = |role| {
            Mutex::new(SessionStatus {
                role,
                state: SessionState::Idle,
                peer: None,
            })
        };
        Self {
            ctx: Arc::new(LinkContext {
                transport,
                sink,
                notifier,
                stop,
                telemetry: Arc::new(TelemetryChannel::new()),
                server_status: status(Role::Server),
                client_status: status(Role::Client),
            }),
            server: Mutex::new(None),
            client: Mutex::new(None),
        }
    }

    /// Channel bound to the server-accepted session, for the motion monitor.
    pub fn telemetry_channel(&self) -> Arc<TelemetryChannel> {
        self.ctx.telemetry.clone()
    }

    pub fn server_status(&self) -> SessionStatus {
        lock(&self.ctx.server_status).clone()
    }

    pub fn client_status(&self) -> SessionStatus {
        lock(&self.ctx.client_status).clone()
    }

    pub fn is_serving(&self) -> bool {
        lock(&self.server)
            .as_ref()
            .is_some_and(|server| !server.handle.is_finished())
    }

    /// Start listening for inbound sessions. A second call while serving is a no-op.
    pub fn start_server(&self) -> Result<(), LinkError> {
        let mut server = lock(&self.server);
        if server
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            debug!("link server already running");
            return Ok(());
        }
        let listener: Arc<dyn Listener> = Arc::from(self.ctx.transport.listen()?);
        let shutdown = Arc::new(AtomicBool::new(false));
        let current = Arc::new(Mutex::new(None));
        let handle = {
            let ctx = self.ctx.clone();
            let listener = listener.clone();
            let shutdown = shutdown.clone();
            let current = current.clone();
            thread::Builder::new()
                .name("v2v-link-server".into())
                .spawn(move || serve(&ctx, listener.as_ref(), &shutdown, &current))
                .map_err(LinkError::spawn("link server"))?
        };
        info!("link server listening");
        *server = Some(ServerRole {
            listener,
            shutdown,
            current,
            handle,
        });
        Ok(())
    }

    pub fn stop_server(&self) {
        let Some(server) = lock(&self.server).take() else {
            return;
        };
        server.shutdown.store(true, Ordering::SeqCst);
        server.listener.close();
        if let Some(closer) = lock(&server.current).take() {
            closer.close();
        }
        if server.handle.join().is_err() {
            warn!("link server thread panicked");
        }
        self.ctx.telemetry.release();
        self.ctx.set_status(Role::Server, SessionState::Idle, None);
    }

    /// Replace the outbound session with a new attempt to `peer`.
    ///
    /// The previous client is cancelled and joined before the new attempt starts, so at most
    /// one outbound connection exists at any time.
    pub fn open_outbound(&self, peer: &str) -> Result<(), LinkError> {
        let mut client = lock(&self.client);
        if let Some(previous) = client.take() {
            self.stop_client(previous);
        }

        self.ctx
            .set_status(Role::Client, SessionState::Connecting, Some(peer));
        self.ctx.record(EventKind::Connecting);

        let cancelled = Arc::new(AtomicBool::new(false));
        let current = Arc::new(Mutex::new(None));
        let handle = {
            let ctx = self.ctx.clone();
            let peer = peer.to_owned();
            let cancelled = cancelled.clone();
            let current = current.clone();
            thread::Builder::new()
                .name("v2v-link-client".into())
                .spawn(move || connect(&ctx, &peer, &cancelled, &current))
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                self.ctx.set_status(Role::Client, SessionState::Idle, None);
                return Err(LinkError::spawn("link client")(err));
            }
        };
        *client = Some(ClientRole {
            peer: peer.to_owned(),
            cancelled,
            current,
            handle,
        });
        Ok(())
    }

    /// Cancel the outbound session, if any, and wait for it to wind down.
    pub fn cancel_outbound(&self) {
        let mut client = lock(&self.client);
        if let Some(previous) = client.take() {
            self.stop_client(previous);
        }
    }

    /// Close both roles.
    pub fn shutdown(&self) {
        self.cancel_outbound();
        self.stop_server();
    }

    /// Cancel a client and join its thread. A connect still in flight notices the flag
    /// within one poll interval, so once this returns no connection of `client` is open.
    fn stop_client(&self, client: ClientRole) {
        debug!(peer = %client.peer, "cancelling outbound session");
        client.cancelled.store(true, Ordering::SeqCst);
        if let Some(closer) = lock(&client.current).take() {
            self.ctx
                .set_status(Role::Client, SessionState::Closing, Some(&client.peer));
            self.ctx.record(EventKind::Disconnecting);
            closer.close();
        }
        if client.handle.join().is_err() {
            warn!(peer = %client.peer, "link client thread panicked");
        }
        self.ctx.set_status(Role::Client, SessionState::Idle, None);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SessionControl for SessionManager {
    fn open_outbound(&self, peer: &str) -> Result<(), LinkError> {
        SessionManager::open_outbound(self, peer)
    }

    fn cancel_outbound(&self) {
        SessionManager::cancel_outbound(self)
    }
}

fn serve(
    ctx: &Arc<LinkContext>,
    listener: &dyn Listener,
    shutdown: &AtomicBool,
    current: &Mutex<Option<ConnectionCloser>>,
) {
    loop {
        let conn: Arc<dyn Connection> = match listener.accept() {
            Ok(conn) => Arc::from(conn),
            Err(LinkError::Cancelled) => {
                debug!("link listener closed");
                break;
            }
            Err(_) if shutdown.load(Ordering::SeqCst) => break,
            Err(err) => {
                warn!(error = %err, "accept failed, retrying");
                metrics::counter!("v2v_accept_errors_total").increment(1);
                thread::sleep(ACCEPT_RETRY_BACKOFF);
                continue;
            }
        };
        let peer = conn.peer().to_owned();
        let span = info_span!("session", role = "server", peer = %peer);
        let _entered = span.enter();

        let started = LiveConnection::start(
            Role::Server,
            conn.clone(),
            ctx.sink.clone(),
            ctx.stop_callback(),
        );
        let mut live = match started {
            Ok(live) => live,
            Err(err) => {
                warn!(error = %err, "failed to start inbound session");
                conn.close();
                continue;
            }
        };
        {
            let mut slot = lock(current);
            if shutdown.load(Ordering::SeqCst) {
                drop(slot);
                live.finish();
                break;
            }
            *slot = Some(live.closer());
        }

        ctx.telemetry.bind(live.handle());
        info!("inbound session connected");
        metrics::counter!("v2v_sessions_opened_total", "role" => "server").increment(1);
        ctx.set_status(Role::Server, SessionState::Connected, Some(&peer));
        ctx.record(EventKind::Connected);
        ctx.notifier.notify("Received a connection!");

        live.wait_reader();

        ctx.telemetry.release();
        lock(current).take();
        live.finish();
        ctx.set_status(Role::Server, SessionState::Idle, None);
        ctx.record(EventKind::Disconnected);
        ctx.notifier.notify("Lost the connection!");
        info!("inbound session ended");

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }
}

fn connect(
    ctx: &Arc<LinkContext>,
    peer: &str,
    cancelled: &AtomicBool,
    current: &Mutex<Option<ConnectionCloser>>,
) {
    let span = info_span!("session", role = "client", peer = %peer);
    let _entered = span.enter();

    let conn: Arc<dyn Connection> = match ctx.transport.connect_cancellable(peer, cancelled) {
        Ok(conn) => Arc::from(conn),
        Err(LinkError::Cancelled) => {
            debug!("outbound connect cancelled");
            return;
        }
        Err(err) => {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            warn!(error = %err, "outbound connect failed");
            fail(ctx, peer);
            return;
        }
    };

    let started = LiveConnection::start(
        Role::Client,
        conn.clone(),
        ctx.sink.clone(),
        ctx.stop_callback(),
    );
    let mut live = match started {
        Ok(live) => live,
        Err(err) => {
            warn!(error = %err, "failed to start outbound session");
            conn.close();
            fail(ctx, peer);
            return;
        }
    };
    {
        let mut slot = lock(current);
        if cancelled.load(Ordering::SeqCst) {
            drop(slot);
            debug!("outbound session cancelled before it was announced");
            live.finish();
            return;
        }
        *slot = Some(live.closer());
    }

    info!("outbound session connected");
    metrics::counter!("v2v_sessions_opened_total", "role" => "client").increment(1);
    ctx.set_status(Role::Client, SessionState::Connected, Some(peer));
    ctx.record(EventKind::Connected);
    ctx.notifier.notify(&format!("Connected to {peer}!"));

    live.wait_reader();

    lock(current).take();
    live.finish();
    ctx.record(EventKind::Disconnected);
    ctx.notifier.notify("Disconnected!");
    if !cancelled.load(Ordering::SeqCst) {
        ctx.set_status(Role::Client, SessionState::Idle, None);
    }
    info!("outbound session ended");
}

fn fail(ctx: &LinkContext, peer: &str) {
    ctx.set_status(Role::Client, SessionState::Idle, None);
    ctx.record(EventKind::ConnectFailed);
    ctx.notifier.notify(&format!("Failed to connect to {peer}!"));
}
