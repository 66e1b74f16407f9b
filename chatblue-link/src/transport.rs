//! Transport capability: what a radio binding must provide to the supervisor.
//!
//! Implemented once per technology (Bluetooth RFCOMM, Wi-Fi Direct / LAN TCP).
//! The supervisor never knows which one it is driving.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chatblue_core::{Confirmation, LinkError, PeerDescriptor, RoleIntent, ScanSignal};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::lock;

/// An ordered duplex byte stream (RFCOMM socket, TCP socket, in-memory pipe).
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// An established stream and who is on the other end.
pub struct Connection {
    pub stream: Box<dyn LinkStream>,
    pub remote: PeerDescriptor,
}

impl Connection {
    pub fn new(stream: impl LinkStream + 'static, remote: PeerDescriptor) -> Self {
        Self {
            stream: Box::new(stream),
            remote,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

pub type ScanReceiver = mpsc::UnboundedReceiver<ScanSignal>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// How sightings become confirmed peers.
    fn confirmation(&self) -> Confirmation;

    /// Begin a scan. Signals stream until `Finished` or `stop_listening`.
    async fn start_listening(&self, identity: Uuid) -> Result<ScanReceiver, LinkError>;

    async fn stop_listening(&self);

    /// Wait for one inbound peer on the endpoint registered under `identity`.
    async fn accept(&self, identity: Uuid) -> Result<Connection, LinkError>;

    /// Reach `peer_id` with the given role intent. Busy/transient failures are
    /// `ConnectRetryable`, everything else `ConnectFatal`.
    async fn open_connection(&self, peer_id: &str, role: RoleIntent)
        -> Result<Connection, LinkError>;

    /// Leave any group/role membership from a previous connection.
    async fn release_role(&self) {}

    /// Refresh the transport's peer view before a retry.
    async fn refresh_peers(&self) {}

    /// Tear down any accepting endpoint. Idempotent.
    async fn close(&self);
}

/// Scripted result for one `open_connection` call.
pub enum ConnectOutcome {
    Open(Connection),
    Fail(LinkError),
    /// Never resolves; the stream is held until the call is cancelled.
    Hang(Connection),
}

/// Recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartListening(Uuid),
    StopListening,
    Accept(Uuid),
    Connect { peer: String, role: RoleIntent },
    ReleaseRole,
    RefreshPeers,
    Close,
}

/// In-memory transport. Scripted per test, or paired with a twin so one side's
/// `open_connection` lands on the other's `accept`.
pub struct MemoryTransport {
    name: &'static str,
    confirmation: Confirmation,
    outcomes: Mutex<HashMap<String, VecDeque<ConnectOutcome>>>,
    incoming_tx: mpsc::UnboundedSender<Connection>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>,
    twin: Option<mpsc::UnboundedSender<Connection>>,
    scan: Mutex<Option<mpsc::UnboundedSender<ScanSignal>>>,
    listen_error: Mutex<Option<String>>,
    calls: Mutex<Vec<(Instant, Call)>>,
}

const PIPE_CAPACITY: usize = 64 * 1024;

impl MemoryTransport {
    pub fn new(confirmation: Confirmation) -> Self {
        Self::build("memory", confirmation, None)
    }

    fn build(
        name: &'static str,
        confirmation: Confirmation,
        twin: Option<mpsc::UnboundedSender<Connection>>,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            name,
            confirmation,
            outcomes: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            twin,
            scan: Mutex::new(None),
            listen_error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Two transports wired back to back.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let mut a = Self::build("memory-a", Confirmation::Direct, Some(b_tx.clone()));
        let mut b = Self::build("memory-b", Confirmation::Direct, Some(a_tx.clone()));
        a.incoming_tx = a_tx;
        a.incoming_rx = tokio::sync::Mutex::new(a_rx);
        b.incoming_tx = b_tx;
        b.incoming_rx = tokio::sync::Mutex::new(b_rx);
        (a, b)
    }

    /// A connection plus the far end of its pipe, for tests to drive.
    pub fn pipe(remote: PeerDescriptor) -> (Connection, DuplexStream) {
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        (Connection::new(near, remote), far)
    }

    pub fn script_connect(&self, peer: &str, outcome: ConnectOutcome) {
        lock(&self.outcomes)
            .entry(peer.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Hand an inbound connection to the next `accept`.
    pub fn offer_incoming(&self, conn: Connection) {
        let _ = self.incoming_tx.send(conn);
    }

    pub fn fail_listening(&self, message: &str) {
        *lock(&self.listen_error) = Some(message.to_string());
    }

    /// Push a signal into the active scan. False if no scan is running.
    pub fn emit_scan(&self, signal: ScanSignal) -> bool {
        match lock(&self.scan).as_ref() {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        lock(&self.calls).clone()
    }

    pub fn connect_calls(&self) -> Vec<(String, RoleIntent)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Connect { peer, role } => Some((peer, role)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push((Instant::now(), call));
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn confirmation(&self) -> Confirmation {
        self.confirmation
    }

    async fn start_listening(&self, identity: Uuid) -> Result<ScanReceiver, LinkError> {
        self.record(Call::StartListening(identity));
        if let Some(msg) = lock(&self.listen_error).clone() {
            return Err(LinkError::DiscoveryFailed(msg));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.scan) = Some(tx);
        Ok(rx)
    }

    async fn stop_listening(&self) {
        self.record(Call::StopListening);
        lock(&self.scan).take();
    }

    async fn accept(&self, identity: Uuid) -> Result<Connection, LinkError> {
        self.record(Call::Accept(identity));
        let mut rx = self.incoming_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| LinkError::ConnectFatal("endpoint closed".into()))
    }

    async fn open_connection(
        &self,
        peer_id: &str,
        role: RoleIntent,
    ) -> Result<Connection, LinkError> {
        self.record(Call::Connect {
            peer: peer_id.to_string(),
            role,
        });
        let scripted = lock(&self.outcomes)
            .get_mut(peer_id)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(ConnectOutcome::Open(conn)) => Ok(conn),
            Some(ConnectOutcome::Fail(err)) => Err(err),
            Some(ConnectOutcome::Hang(conn)) => {
                let _held = conn;
                std::future::pending::<Result<Connection, LinkError>>().await
            }
            None => match &self.twin {
                Some(twin) => {
                    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
                    let inbound = Connection::new(
                        far,
                        PeerDescriptor {
                            address: Some(self.name.to_string()),
                            display_name: None,
                            owner: true,
                        },
                    );
                    twin.send(inbound)
                        .map_err(|_| LinkError::ConnectRetryable("peer not accepting".into()))?;
                    Ok(Connection::new(
                        near,
                        PeerDescriptor {
                            address: Some(peer_id.to_string()),
                            display_name: None,
                            owner: false,
                        },
                    ))
                }
                None => Err(LinkError::ConnectFatal(format!("no route to {peer_id}"))),
            },
        }
    }

    async fn release_role(&self) {
        self.record(Call::ReleaseRole);
    }

    async fn refresh_peers(&self) {
        self.record(Call::RefreshPeers);
    }

    async fn close(&self) {
        self.record(Call::Close);
    }
}
