//! LAN TCP transport: beacon discovery plus a group-owner/client role model.
//! The owner hosts the listening socket; the client dials it. While the
//! accepting endpoint is open a responder answers discovery beacons.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatblue_core::{Confirmation, LinkError, PeerDescriptor, RoleIntent};
use chatblue_link::transport::ScanReceiver;
use chatblue_link::{Connection, Transport};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::{BeaconResponder, BeaconScanner};

const ENETUNREACH: i32 = 101;
const EHOSTUNREACH: i32 = 113;

/// Physical connect policy for one logical attempt.
#[derive(Debug, Clone, Copy)]
pub struct DialPolicy {
    pub attempts: u32,
    /// Sleep between dials, multiplied by the attempt number.
    pub backoff: Duration,
    pub timeout: Duration,
    /// How long the owner role waits for the peer to dial in.
    pub owner_accept_timeout: Duration,
}

pub struct LanTransport {
    scanner: BeaconScanner,
    responder: BeaconResponder,
    bind_addr: SocketAddr,
    dial: DialPolicy,
    listener: Mutex<Option<Arc<TcpListener>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    responder_task: Mutex<Option<JoinHandle<()>>>,
}

impl LanTransport {
    pub fn new(cfg: &Config) -> Self {
        let scanner = BeaconScanner::lan(
            cfg.discovery_port,
            cfg.transport_port,
            cfg.display_name.clone(),
            cfg.scan_window(),
        );
        let responder = BeaconResponder::lan(cfg.discovery_port, &scanner);
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cfg.transport_port));
        Self::with_parts(scanner, responder, bind_addr, cfg.dial_policy())
    }

    pub fn with_parts(
        scanner: BeaconScanner,
        responder: BeaconResponder,
        bind_addr: SocketAddr,
        dial: DialPolicy,
    ) -> Self {
        Self {
            scanner,
            responder,
            bind_addr,
            dial,
            listener: Mutex::new(None),
            scan_task: Mutex::new(None),
            responder_task: Mutex::new(None),
        }
    }

    /// Address of the accepting endpoint, binding it if needed.
    #[cfg(test)]
    pub async fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.listener().await?.local_addr()?)
    }

    async fn listener(&self) -> Result<Arc<TcpListener>, LinkError> {
        let mut guard = self.listener.lock().await;
        if let Some(l) = guard.as_ref() {
            return Ok(l.clone());
        }
        let l = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| bind_error(self.bind_addr, e))?;
        let l = Arc::new(l);
        info!(addr = %l.local_addr()?, "transport listening");
        *guard = Some(l.clone());
        Ok(l)
    }

    async fn accept_one(&self) -> Result<Connection, LinkError> {
        let listener = self.listener().await?;
        self.accept_on(&listener).await
    }

    async fn accept_on(&self, listener: &TcpListener) -> Result<Connection, LinkError> {
        let (stream, from) = listener
            .accept()
            .await
            .map_err(|e| LinkError::ConnectRetryable(format!("accept failed: {e}")))?;
        let _ = stream.set_nodelay(true);
        info!(%from, "accepted peer");
        Ok(Connection::new(
            stream,
            PeerDescriptor {
                address: Some(from.to_string()),
                display_name: None,
                owner: true,
            },
        ))
    }

    /// Answer beacons for `identity`, replacing any running responder.
    async fn advertise(&self, identity: Uuid, listen_port: u16) {
        let mut slot = self.responder_task.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
            let _ = old.await;
        }
        match self.responder.spawn(identity, listen_port) {
            Ok((addr, task)) => {
                debug!(%addr, %identity, "answering discovery beacons");
                *slot = Some(task);
            }
            Err(e) => warn!("discovery responder unavailable: {e}"),
        }
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, LinkError> {
        let mut last = String::new();
        for attempt in 1..=self.dial.attempts {
            match tokio::time::timeout(self.dial.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) if is_transient(&e) => last = e.to_string(),
                Ok(Err(e)) => return Err(LinkError::ConnectFatal(format!("{addr}: {e}"))),
                Err(_) => last = "timed out".to_string(),
            }
            debug!(%addr, attempt, "dial failed: {last}");
            if attempt < self.dial.attempts {
                tokio::time::sleep(self.dial.backoff * attempt).await;
            }
        }
        Err(LinkError::ConnectRetryable(format!("{addr}: {last}")))
    }
}

fn bind_error(addr: SocketAddr, e: io::Error) -> LinkError {
    if e.kind() == io::ErrorKind::AddrInUse {
        LinkError::ConnectRetryable(format!("{addr} in use: {e}"))
    } else {
        LinkError::ConnectFatal(format!("cannot listen on {addr}: {e}"))
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) || matches!(e.raw_os_error(), Some(ENETUNREACH | EHOSTUNREACH))
}

#[async_trait]
impl Transport for LanTransport {
    fn name(&self) -> &'static str {
        "lan"
    }

    fn confirmation(&self) -> Confirmation {
        Confirmation::ServiceLookup
    }

    async fn start_listening(&self, identity: Uuid) -> Result<ScanReceiver, LinkError> {
        let mut slot = self.scan_task.lock().await;
        // The old scan's socket must be dropped before the new one binds.
        if let Some(old) = slot.take() {
            old.abort();
            let _ = old.await;
        }
        let (rx, handle) = self
            .scanner
            .scan(identity)
            .map_err(|e| LinkError::DiscoveryFailed(e.to_string()))?;
        *slot = Some(handle);
        Ok(rx)
    }

    async fn stop_listening(&self) {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }

    async fn accept(&self, identity: Uuid) -> Result<Connection, LinkError> {
        let listener = self.listener().await?;
        self.advertise(identity, listener.local_addr()?.port()).await;
        debug!(%identity, "waiting for inbound peer");
        self.accept_on(&listener).await
    }

    async fn open_connection(
        &self,
        peer_id: &str,
        role: RoleIntent,
    ) -> Result<Connection, LinkError> {
        let addr: SocketAddr = peer_id
            .parse()
            .map_err(|_| LinkError::ConnectFatal(format!("not a socket address: {peer_id}")))?;
        match role {
            RoleIntent::Client => {
                let stream = self.dial(addr).await?;
                Ok(Connection::new(
                    stream,
                    PeerDescriptor {
                        address: Some(addr.to_string()),
                        display_name: None,
                        owner: false,
                    },
                ))
            }
            RoleIntent::Owner => {
                info!(%addr, "hosting; waiting for peer to dial in");
                tokio::time::timeout(self.dial.owner_accept_timeout, self.accept_one())
                    .await
                    .map_err(|_| {
                        LinkError::ConnectRetryable(format!("{addr} did not dial in"))
                    })?
            }
        }
    }

    async fn close(&self) {
        if let Some(task) = self.responder_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        if self.listener.lock().await.take().is_some() {
            debug!("transport endpoint closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use chatblue_core::{Event, FrameKind, DEFAULT_SERVICE_UUID};
    use chatblue_link::{LinkConfig, Supervisor};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    use super::*;

    fn scanner(bind: &str, target: &str, window: Duration) -> BeaconScanner {
        BeaconScanner {
            bind_addr: bind.parse().unwrap(),
            target: target.parse().unwrap(),
            multicast: false,
            instance: Uuid::new_v4(),
            display_name: None,
            listen_port: 0,
            window,
        }
    }

    fn responder(bind: &str, scanner: &BeaconScanner) -> BeaconResponder {
        BeaconResponder {
            bind_addr: bind.parse().unwrap(),
            multicast: false,
            instance: scanner.instance,
            display_name: None,
        }
    }

    fn with_scanner(scanner: BeaconScanner, dial: DialPolicy) -> LanTransport {
        let responder = responder("127.0.0.1:0", &scanner);
        LanTransport::with_parts(scanner, responder, "127.0.0.1:0".parse().unwrap(), dial)
    }

    fn loopback(dial: DialPolicy) -> LanTransport {
        let scanner = scanner("127.0.0.1:0", "127.0.0.1:9", Duration::from_millis(100));
        with_scanner(scanner, dial)
    }

    fn free_udp_port() -> u16 {
        let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        s.local_addr().unwrap().port()
    }

    async fn wait_for(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
        pred: impl Fn(&Event) -> bool,
    ) -> Event {
        timeout(Duration::from_secs(3), async {
            loop {
                let ev = rx.recv().await.expect("sink closed");
                if pred(&ev) {
                    return ev;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn quick() -> DialPolicy {
        DialPolicy {
            attempts: 2,
            backoff: Duration::from_millis(10),
            timeout: Duration::from_millis(500),
            owner_accept_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn client_dials_owner_endpoint() {
        let owner = Arc::new(loopback(quick()));
        let client = loopback(quick());
        let addr = owner.local_addr().await.unwrap();

        let accepting = {
            let owner = owner.clone();
            tokio::spawn(async move { owner.accept(Uuid::nil()).await })
        };
        let mut out = client
            .open_connection(&addr.to_string(), RoleIntent::Client)
            .await
            .unwrap();
        let mut inbound = accepting.await.unwrap().unwrap();
        assert!(inbound.remote.owner);
        assert!(!out.remote.owner);

        out.stream.write_all(b"hey").await.unwrap();
        let mut buf = [0u8; 3];
        inbound.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hey");
    }

    #[tokio::test]
    async fn refused_dial_is_retryable_after_all_attempts() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let t = loopback(quick());
        let err = t
            .open_connection(&format!("127.0.0.1:{port}"), RoleIntent::Client)
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn owner_role_times_out_as_retryable() {
        let t = loopback(quick());
        let err = t
            .open_connection("127.0.0.1:1", RoleIntent::Owner)
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn malformed_peer_id_is_fatal() {
        let t = loopback(quick());
        let err = t
            .open_connection("AA:BB:CC:DD:EE:FF", RoleIntent::Client)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::ConnectFatal(_)));
    }

    #[tokio::test]
    async fn close_releases_the_port() {
        let t = loopback(quick());
        let addr = t.local_addr().await.unwrap();
        t.close().await;
        t.close().await;
        let rebound = std::net::TcpListener::bind(addr);
        assert!(rebound.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn supervisors_chat_over_loopback_tcp() {
        let bob_transport = Arc::new(loopback(quick()));
        let bob_addr = bob_transport.local_addr().await.unwrap();
        let bob = Supervisor::new(bob_transport, LinkConfig::immediate());
        let alice = Supervisor::new(Arc::new(loopback(quick())), LinkConfig::immediate());
        let mut bob_rx = bob.subscribe();
        let mut alice_rx = alice.subscribe();

        bob.start_server(None);
        alice.connect(&bob_addr.to_string());

        wait_for(&mut alice_rx, |e| matches!(e, Event::Connected { .. })).await;
        wait_for(&mut bob_rx, |e| matches!(e, Event::Connected { .. })).await;

        alice.send_text("over tcp");
        let ev = wait_for(&mut bob_rx, |e| matches!(e, Event::MessageReceived { .. })).await;
        assert_eq!(
            ev,
            Event::MessageReceived {
                kind: FrameKind::Text,
                bytes: b"over tcp".to_vec(),
                text: Some("over tcp".into()),
            }
        );
        alice.shutdown();
        bob.shutdown();
    }

    #[tokio::test]
    async fn restarted_scan_rebinds_a_fixed_port() {
        let bind = format!("127.0.0.1:{}", free_udp_port());
        let t = with_scanner(scanner(&bind, "127.0.0.1:9", Duration::from_secs(5)), quick());
        let _first = t.start_listening(DEFAULT_SERVICE_UUID).await.unwrap();
        let _second = t.start_listening(DEFAULT_SERVICE_UUID).await.unwrap();
        t.stop_listening().await;
        let _third = t.start_listening(DEFAULT_SERVICE_UUID).await.unwrap();
        t.stop_listening().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn supervisor_restarts_discovery_on_a_fixed_port() {
        let bind = format!("127.0.0.1:{}", free_udp_port());
        let t = with_scanner(scanner(&bind, "127.0.0.1:9", Duration::from_secs(5)), quick());
        let sup = Supervisor::new(Arc::new(t), LinkConfig::immediate());
        let mut rx = sup.subscribe();

        sup.start_discovery();
        assert_eq!(wait_for(&mut rx, |_| true).await, Event::ScanStarted);
        sup.start_discovery();
        assert_eq!(wait_for(&mut rx, |_| true).await, Event::ScanStarted);
        for _ in 0..5 {
            sup.stop_discovery();
            assert_eq!(wait_for(&mut rx, |_| true).await, Event::ScanFinished);
            sup.start_discovery();
            assert_eq!(wait_for(&mut rx, |_| true).await, Event::ScanStarted);
        }
        sup.shutdown();
    }

    #[tokio::test]
    async fn occupied_owner_port_is_retryable() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let scanner = scanner("127.0.0.1:0", "127.0.0.1:9", Duration::from_millis(100));
        let responder = responder("127.0.0.1:0", &scanner);
        let t = LanTransport::with_parts(scanner, responder, taken.local_addr().unwrap(), quick());
        let err = t
            .open_connection("127.0.0.1:1", RoleIntent::Owner)
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serving_peer_is_found_without_scanning() {
        let beacon_port = free_udp_port();
        let bob_scanner = scanner("127.0.0.1:0", "127.0.0.1:9", Duration::from_millis(100));
        let bob_responder = responder(&format!("127.0.0.1:{beacon_port}"), &bob_scanner);
        let bob_transport = Arc::new(LanTransport::with_parts(
            bob_scanner,
            bob_responder,
            "127.0.0.1:0".parse().unwrap(),
            quick(),
        ));
        let bob_addr = bob_transport.local_addr().await.unwrap();
        let bob = Supervisor::new(bob_transport, LinkConfig::immediate());
        bob.start_server(None);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let alice_scanner = scanner(
            "127.0.0.1:0",
            &format!("127.0.0.1:{beacon_port}"),
            Duration::from_secs(1),
        );
        let alice = Supervisor::new(
            Arc::new(with_scanner(alice_scanner, quick())),
            LinkConfig::immediate(),
        );
        let mut alice_rx = alice.subscribe();
        alice.start_discovery();
        let found = wait_for(&mut alice_rx, |e| matches!(e, Event::PeerFound { .. })).await;
        let Event::PeerFound { peer } = found else {
            unreachable!()
        };
        assert_eq!(peer.id, bob_addr.to_string());
        assert!(peer.service_confirmed);

        alice.connect(&peer.id);
        wait_for(&mut alice_rx, |e| matches!(e, Event::Connected { .. })).await;
        alice.shutdown();
        bob.shutdown();
    }
}
