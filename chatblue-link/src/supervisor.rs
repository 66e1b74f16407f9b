//! Connection supervisor: discovery, the accepting endpoint, outbound attempts
//! and the single live session, driven over any `Transport`.
//!
//! Commands are plain synchronous calls that may come from any thread. Long
//! work runs on spawned tasks; every task carries a generation number and its
//! results are dropped unless that generation is still current when it
//! reports back, so a cancelled or superseded worker can never install a
//! session or emit events for a scan that has already ended.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chatblue_core::{
    ConnectionState, DisconnectReason, DiscoveryTracker, Event,
    FrameKind, LinkError, LinkState, OpenPath, PeerRecord, RetryDecision, RoleIntent, ScanSignal,
    SessionId,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::lock;
use crate::session::DuplexSession;
use crate::sink::EventSink;
use crate::transport::{Connection, Transport};

/// Placeholder address some radios report in place of the real one.
const PLACEHOLDER_ADDRESS: &str = "02:00:00:00:00:00";

/// Host-reported facts that gate every radio operation.
#[derive(Debug, Clone, Copy)]
struct HostFacts {
    permission_granted: bool,
    radio_available: bool,
}

struct Worker {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Worker {
    fn abort(self) {
        self.handle.abort();
    }

    /// Abort, keeping the handle so a release can wait for the task to drop.
    fn retire(self) -> JoinHandle<()> {
        self.handle.abort();
        self.handle
    }
}

/// Transport call that undoes what a worker started.
#[derive(Debug, Clone, Copy)]
enum Release {
    StopListening,
    Close,
}

fn is_current(slot: &Option<Worker>, generation: u64) -> bool {
    slot.as_ref().map(|w| w.generation) == Some(generation)
}

struct Inner {
    link: LinkState,
    facts: HostFacts,
    discovery: Option<Worker>,
    server: Option<Worker>,
    attempt: Option<Worker>,
    session: Option<DuplexSession>,
    next_generation: u64,
    /// Releases queued so far. Workers spawned now wait for all of them.
    releases: u64,
}

impl Inner {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    events: Arc<EventSink>,
    runtime: Handle,
    /// Count of finished releases.
    released: Arc<watch::Sender<u64>>,
    // Lock order: `inner` before `tracker`.
    inner: Mutex<Inner>,
    tracker: Mutex<DiscoveryTracker>,
}

#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig) -> Self {
        Self::with_runtime(transport, config, Handle::current())
    }

    pub fn with_runtime(transport: Arc<dyn Transport>, config: LinkConfig, runtime: Handle) -> Self {
        let tracker = DiscoveryTracker::new(transport.confirmation());
        let link = LinkState::new(config.max_connect_attempts);
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                events: Arc::new(EventSink::new()),
                runtime,
                released: Arc::new(watch::channel(0).0),
                inner: Mutex::new(Inner {
                    link,
                    facts: HostFacts {
                        permission_granted: true,
                        radio_available: true,
                    },
                    discovery: None,
                    server: None,
                    attempt: None,
                    session: None,
                    next_generation: 0,
                    releases: 0,
                }),
                tracker: Mutex::new(tracker),
            }),
        }
    }

    /// Register the single event listener, replacing any previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .lock()
            .session
            .as_ref()
            .map_or(false, DuplexSession::is_active)
    }

    pub fn set_permission_granted(&self, granted: bool) {
        let mut inner = self.shared.lock();
        inner.facts.permission_granted = granted;
        if !granted {
            info!("permission revoked");
            self.shared.teardown(&mut inner, LinkError::PermissionDenied(self.missing_permission()));
        }
    }

    pub fn set_radio_available(&self, available: bool) {
        let mut inner = self.shared.lock();
        inner.facts.radio_available = available;
        if !available {
            info!("radio went away");
            self.shared.teardown(&mut inner, LinkError::RadioUnavailable(self.radio_off()));
        }
    }

    // ---- discovery ----

    pub fn start_discovery(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if let Err(e) = self.check_facts(&inner) {
            shared.events.emit(Event::scan_error(e));
            return;
        }
        if let Err(e) = inner.link.start_discovery() {
            shared.events.emit(Event::scan_error(e));
            return;
        }
        if let Some(previous) = inner.discovery.take() {
            debug!("restarting discovery");
            shared.release(&mut inner, vec![previous.retire()], Release::StopListening);
        }
        let generation = inner.generation();
        let handle = shared.runtime.spawn(run_discovery(
            shared.clone(),
            generation,
            inner.releases,
            shared.config.service_uuid,
        ));
        inner.discovery = Some(Worker { generation, handle });
    }

    pub fn stop_discovery(&self) {
        let mut inner = self.shared.lock();
        self.shared.cancel_discovery(&mut inner);
    }

    /// Confirmed peers from the current (or last) scan, ordered by id.
    pub fn known_peers(&self) -> Vec<PeerRecord> {
        lock(&self.shared.tracker).confirmed()
    }

    pub fn clear_peers(&self) {
        lock(&self.shared.tracker).clear();
    }

    // ---- server ----

    /// Open the accepting endpoint. A blank or malformed identity falls back to
    /// the configured service identity.
    pub fn start_server(&self, identity: Option<&str>) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if let Err(e) = self.check_facts(&inner) {
            shared.events.emit(Event::socket_error(e));
            return;
        }
        let identity = match identity.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Uuid::parse_str(raw).unwrap_or_else(|_| {
                warn!(raw, "malformed service identity, using the configured one");
                shared.config.service_uuid
            }),
            None => shared.config.service_uuid,
        };
        if let Some(replaced) = inner.link.start_server() {
            shared.close_session(&mut inner, replaced, DisconnectReason::Replaced);
        }
        if let Some(previous) = inner.server.take() {
            previous.abort();
        }
        let generation = inner.generation();
        let handle = shared
            .runtime
            .spawn(run_accept(shared.clone(), generation, inner.releases, identity));
        inner.server = Some(Worker { generation, handle });
        info!(%identity, "server started");
    }

    pub fn stop_server(&self) {
        let mut inner = self.shared.lock();
        self.shared.cancel_server(&mut inner);
    }

    // ---- connect / disconnect ----

    pub fn connect(&self, peer_id: &str) {
        let shared = &self.shared;
        let peer = peer_id.trim();
        if peer.is_empty() || peer.eq_ignore_ascii_case(PLACEHOLDER_ADDRESS) {
            shared
                .events
                .emit(Event::socket_error(LinkError::InvalidAddress(peer_id.to_string())));
            return;
        }
        let mut inner = shared.lock();
        if let Err(e) = self.check_facts(&inner) {
            shared.events.emit(Event::socket_error(e));
            return;
        }
        let plan = inner.link.begin_connect();
        if plan.cancel_discovery {
            shared.abort_discovery(&mut inner);
        }
        if let Some(previous) = inner.attempt.take() {
            debug!("superseding pending attempt");
            previous.abort();
        }
        if let Some(replaced) = plan.replace_session {
            shared.close_session(&mut inner, replaced, DisconnectReason::Replaced);
        }
        let generation = inner.generation();
        let handle = shared.runtime.spawn(run_attempt(
            shared.clone(),
            generation,
            inner.releases,
            peer.to_string(),
        ));
        inner.attempt = Some(Worker { generation, handle });
        info!(peer, "connecting");
    }

    /// Cancel a pending attempt and close the live session. The accepting
    /// endpoint, if open, stays open.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if inner.link.cancel_connect() {
            if let Some(attempt) = inner.attempt.take() {
                attempt.abort();
            }
            info!("pending attempt cancelled");
        }
        if let Some(id) = inner.link.begin_disconnect() {
            if let Some(session) = inner.session.take() {
                debug_assert_eq!(session.id(), id);
                session.cancel(DisconnectReason::Manual);
            }
            inner.link.finish_disconnect();
        }
    }

    // ---- messaging ----

    pub fn send_text(&self, text: &str) {
        self.send(FrameKind::Text, text.as_bytes().to_vec());
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        self.send(FrameKind::Binary, bytes);
    }

    fn send(&self, kind: FrameKind, payload: Vec<u8>) {
        // Enqueue under the lock so frames leave in call order.
        let inner = self.shared.lock();
        let result = match inner.session.as_ref() {
            Some(session) => session.send(kind, payload),
            None => Err(LinkError::NotConnected),
        };
        if let Err(e) = result {
            warn!("send failed: {e}");
            self.shared.events.emit(Event::socket_error(e));
        }
    }

    /// Cancel everything and release the transport. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        shared.cancel_discovery(&mut inner);
        let retired = inner
            .attempt
            .take()
            .into_iter()
            .chain(inner.server.take())
            .map(Worker::retire)
            .collect();
        if let Some(session) = inner.session.take() {
            session.cancel(DisconnectReason::Manual);
        }
        inner.link.reset();
        shared.release(&mut inner, retired, Release::Close);
        debug!("supervisor shut down");
    }

    fn check_facts(&self, inner: &Inner) -> Result<(), LinkError> {
        if !inner.facts.permission_granted {
            return Err(LinkError::PermissionDenied(self.missing_permission()));
        }
        if !inner.facts.radio_available {
            return Err(LinkError::RadioUnavailable(self.radio_off()));
        }
        Ok(())
    }

    fn missing_permission(&self) -> String {
        format!("{} access not granted", self.shared.transport.name())
    }

    fn radio_off(&self) -> String {
        format!("{} is off", self.shared.transport.name())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Stop the scan and report it finished. No-op if no scan is running.
    fn cancel_discovery(&self, inner: &mut Inner) {
        if inner.discovery.is_some() {
            self.abort_discovery(inner);
        }
    }

    fn abort_discovery(&self, inner: &mut Inner) {
        if let Some(worker) = inner.discovery.take() {
            let handle = worker.retire();
            inner.link.finish_discovery();
            let ev = lock(&self.tracker).on_scan_finished();
            self.events.emit(ev);
            self.release(inner, vec![handle], Release::StopListening);
            info!("discovery stopped");
        }
    }

    fn cancel_server(&self, inner: &mut Inner) {
        let retired: Vec<_> = inner.server.take().map(Worker::retire).into_iter().collect();
        if !retired.is_empty() {
            info!("server stopped");
        }
        inner.link.stop_server();
        self.release(inner, retired, Release::Close);
    }

    /// Queue a transport release behind every earlier one. It runs once the
    /// retired workers have dropped whatever they hold.
    fn release(&self, inner: &mut Inner, retired: Vec<JoinHandle<()>>, call: Release) {
        inner.releases += 1;
        let ticket = inner.releases;
        let transport = self.transport.clone();
        let released = self.released.clone();
        self.runtime.spawn(async move {
            for handle in retired {
                let _ = handle.await;
            }
            let mut done = released.subscribe();
            let _ = done.wait_for(|n| *n + 1 >= ticket).await;
            debug!(ticket, ?call, "releasing transport");
            match call {
                Release::StopListening => transport.stop_listening().await,
                Release::Close => transport.close().await,
            }
            released.send_replace(ticket);
        });
    }

    /// Wait until every release queued before `barrier` was taken has run.
    async fn settled(&self, barrier: u64) {
        let mut done = self.released.subscribe();
        let _ = done.wait_for(|n| *n >= barrier).await;
    }

    fn close_session(&self, inner: &mut Inner, id: SessionId, reason: DisconnectReason) {
        if let Some(session) = inner.session.take() {
            if session.id() == id {
                session.cancel(reason);
            } else {
                inner.session = Some(session);
            }
        }
    }

    /// Radio or permission loss: everything in flight stops.
    fn teardown(&self, inner: &mut Inner, cause: LinkError) {
        self.cancel_discovery(inner);
        if inner.link.cancel_connect() {
            if let Some(attempt) = inner.attempt.take() {
                attempt.abort();
            }
            self.events.emit(Event::socket_error(&cause));
        }
        if inner.server.is_some() {
            self.cancel_server(inner);
        }
        if let Some(id) = inner.link.session() {
            if let Some(session) = inner.session.take() {
                session.cancel(DisconnectReason::Io(cause.to_string()));
            }
            inner.link.session_closed(id);
        }
    }

    /// Make `conn` the live session if the worker that produced it is current.
    fn install(self: &Arc<Self>, generation: u64, path: OpenPath, conn: Connection) {
        let mut inner = self.lock();
        let current = match path {
            OpenPath::Attempt => is_current(&inner.attempt, generation),
            OpenPath::Accept => is_current(&inner.server, generation),
        };
        if !current {
            debug!(?path, "dropping stream from a superseded worker");
            return;
        }
        let id = match inner.link.open_session(path) {
            Ok(id) => id,
            Err(e) => {
                debug!(?path, "dropping stream: {e}");
                return;
            }
        };
        // The losing path is cancelled; the endpoint closes either way.
        let loser = match path {
            OpenPath::Attempt => {
                inner.attempt = None;
                inner.server.take()
            }
            OpenPath::Accept => {
                inner.server = None;
                inner.attempt.take()
            }
        };
        let retired = loser.map(Worker::retire).into_iter().collect();
        self.release(&mut inner, retired, Release::Close);
        self.abort_discovery(&mut inner);

        info!(session = %id, remote = ?conn.remote.address, owner = conn.remote.owner, "connected");
        self.events.emit(Event::Connected {
            remote: conn.remote.clone(),
        });
        let weak: Weak<Shared> = Arc::downgrade(self);
        let session = DuplexSession::spawn(
            id,
            conn,
            self.events.clone(),
            &self.config,
            &self.runtime,
            Box::new(move |id, reason| {
                if let Some(shared) = weak.upgrade() {
                    shared.session_ended(id, reason);
                }
            }),
        );
        inner.session = Some(session);
    }

    fn session_ended(&self, id: SessionId, reason: DisconnectReason) {
        let mut inner = self.lock();
        if inner.link.session_closed(id) {
            if inner.session.as_ref().map(DuplexSession::id) == Some(id) {
                inner.session = None;
            }
            debug!(session = %id, %reason, "session released");
        }
    }
}

async fn run_discovery(shared: Arc<Shared>, generation: u64, barrier: u64, identity: Uuid) {
    shared.settled(barrier).await;
    let mut signals = match shared.transport.start_listening(identity).await {
        Ok(rx) => rx,
        Err(e) => {
            let mut inner = shared.lock();
            if is_current(&inner.discovery, generation) {
                inner.discovery = None;
                inner.link.finish_discovery();
                warn!("discovery failed to start: {e}");
                shared.events.emit(Event::scan_error(e));
            }
            return;
        }
    };
    {
        let inner = shared.lock();
        if !is_current(&inner.discovery, generation) {
            return;
        }
        let ev = lock(&shared.tracker).on_scan_start();
        shared.events.emit(ev);
        info!("discovery started");
    }
    while let Some(signal) = signals.recv().await {
        let finished = matches!(signal, ScanSignal::Finished);
        let mut inner = shared.lock();
        if !is_current(&inner.discovery, generation) {
            return;
        }
        if let ScanSignal::Failed(msg) = &signal {
            warn!("discovery error: {msg}");
        }
        if let Some(ev) = lock(&shared.tracker).apply(signal) {
            shared.events.emit(ev);
        }
        if finished {
            inner.discovery = None;
            inner.link.finish_discovery();
            info!("discovery finished");
            return;
        }
    }
    // Transport dropped the scan without a terminal signal.
    let mut inner = shared.lock();
    if is_current(&inner.discovery, generation) {
        inner.discovery = None;
        inner.link.finish_discovery();
        let ev = lock(&shared.tracker).on_scan_finished();
        shared.events.emit(ev);
    }
}

async fn run_accept(shared: Arc<Shared>, generation: u64, barrier: u64, identity: Uuid) {
    shared.settled(barrier).await;
    match shared.transport.accept(identity).await {
        Ok(conn) => shared.install(generation, OpenPath::Accept, conn),
        Err(e) => {
            let mut inner = shared.lock();
            if is_current(&inner.server, generation) {
                inner.server = None;
                inner.link.stop_server();
                warn!("accept failed: {e}");
                shared
                    .events
                    .emit(Event::socket_error(format!("server accept failed: {e}")));
            }
        }
    }
}

async fn run_attempt(shared: Arc<Shared>, generation: u64, barrier: u64, peer: String) {
    shared.settled(barrier).await;
    shared.transport.release_role().await;
    let mut role = RoleIntent::default();
    loop {
        tokio::time::sleep(shared.config.pre_connect_delay).await;
        debug!(%peer, ?role, "opening connection");
        let err = match shared.transport.open_connection(&peer, role).await {
            Ok(conn) => {
                shared.install(generation, OpenPath::Attempt, conn);
                return;
            }
            Err(e) => e,
        };
        let decision = {
            let mut inner = shared.lock();
            if !is_current(&inner.attempt, generation) {
                return;
            }
            let decision = inner.link.connect_failed(err.is_retryable());
            if decision == RetryDecision::GiveUp {
                inner.attempt = None;
            }
            decision
        };
        match decision {
            RetryDecision::Retry { attempt, role: next } => {
                warn!(%peer, attempt, ?next, "connect busy, retrying with flipped role: {err}");
                role = next;
                shared.transport.refresh_peers().await;
                tokio::time::sleep(shared.config.retry_settle_delay).await;
            }
            RetryDecision::GiveUp => {
                let terminal = match err {
                    LinkError::ConnectRetryable(msg) => LinkError::ConnectFatal(msg),
                    other => other,
                };
                warn!(%peer, "connect failed: {terminal}");
                shared.events.emit(Event::socket_error(terminal));
                return;
            }
        }
    }
}
