//! LAN discovery. A scanner multicasts query beacons from an ephemeral socket
//! for one scan window; a serving host's responder answers each query with a
//! beacon naming its service and transport port.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use chatblue_core::{Beacon, PeerRecord, ScanSignal};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const MAX_DATAGRAM: usize = 2048;

/// Where query beacons go and what they say. The service identity is supplied per scan.
#[derive(Debug, Clone)]
pub struct BeaconScanner {
    pub bind_addr: SocketAddr,
    pub target: SocketAddr,
    /// `target` is `MULTICAST_GROUP`. Off for unicast loopback setups.
    pub multicast: bool,
    pub instance: Uuid,
    pub display_name: Option<String>,
    pub listen_port: u16,
    pub window: Duration,
}

impl BeaconScanner {
    pub fn lan(
        discovery_port: u16,
        listen_port: u16,
        display_name: Option<String>,
        window: Duration,
    ) -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            target: SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, discovery_port)),
            multicast: true,
            instance: Uuid::new_v4(),
            display_name,
            listen_port,
            window,
        }
    }

    /// Bind now (so bind errors surface to the caller), then beacon and listen
    /// on a background task until the window closes. The socket lives in the task.
    pub fn scan(
        &self,
        identity: Uuid,
    ) -> io::Result<(mpsc::UnboundedReceiver<ScanSignal>, JoinHandle<()>)> {
        let socket = scan_socket(self.bind_addr, self.multicast)?;
        let beacon = Beacon::new(
            identity,
            self.instance,
            self.display_name.clone(),
            self.listen_port,
        )
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let filter = ScanFilter::new(self.instance, identity);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(scan_loop(socket, self.target, beacon, filter, self.window, tx));
        Ok((rx, handle))
    }
}

/// Answers query beacons while the accepting endpoint is open.
#[derive(Debug, Clone)]
pub struct BeaconResponder {
    pub bind_addr: SocketAddr,
    /// Join `MULTICAST_GROUP` on bind.
    pub multicast: bool,
    /// Shared with the scanner so a host never answers itself.
    pub instance: Uuid,
    pub display_name: Option<String>,
}

impl BeaconResponder {
    pub fn lan(discovery_port: u16, scanner: &BeaconScanner) -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, discovery_port)),
            multicast: true,
            instance: scanner.instance,
            display_name: scanner.display_name.clone(),
        }
    }

    /// Bind, then answer every foreign beacon with one advertising `identity`
    /// and `listen_port`. Runs until the task is aborted.
    pub fn spawn(&self, identity: Uuid, listen_port: u16) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let socket = responder_socket(self.bind_addr, self.multicast)?;
        let addr = socket.local_addr()?;
        let reply = Beacon::new(identity, self.instance, self.display_name.clone(), listen_port)
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let handle = tokio::spawn(respond_loop(socket, self.instance, reply));
        Ok((addr, handle))
    }
}

fn scan_socket(bind: SocketAddr, multicast: bool) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(bind)?;
    if multicast {
        std_sock.set_multicast_ttl_v4(1)?;
        // Lets a responder on this host hear the query.
        std_sock.set_multicast_loop_v4(true)?;
    }
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn responder_socket(bind: SocketAddr, multicast: bool) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(bind)?;
    if multicast {
        std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    }
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn respond_loop(socket: UdpSocket, instance: Uuid, reply: Vec<u8>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("beacon responder stopped: {e}");
                return;
            }
        };
        match Beacon::decode(&buf[..n]) {
            Ok(query) if query.instance != instance => {
                if let Err(e) = socket.send_to(&reply, from).await {
                    debug!(%from, "beacon reply failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(%from, "ignoring datagram: {e}"),
        }
    }
}

async fn scan_loop(
    socket: UdpSocket,
    target: SocketAddr,
    beacon: Vec<u8>,
    mut filter: ScanFilter,
    window: Duration,
    tx: mpsc::UnboundedSender<ScanSignal>,
) {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&beacon, target).await {
                    warn!("beacon send failed: {e}");
                }
            }
            r = socket.recv_from(&mut buf) => match r {
                Ok((n, from)) => {
                    for signal in filter.on_datagram(&buf[..n], from) {
                        if tx.send(signal).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(ScanSignal::Failed(format!("discovery socket: {e}")));
                    return;
                }
            }
        }
    }
    let _ = tx.send(ScanSignal::Finished);
}

/// Turns datagrams into signals: own beacons and repeats within a scan are skipped.
#[derive(Debug)]
pub struct ScanFilter {
    instance: Uuid,
    identity: Uuid,
    seen: HashSet<String>,
}

impl ScanFilter {
    pub fn new(instance: Uuid, identity: Uuid) -> Self {
        Self {
            instance,
            identity,
            seen: HashSet::new(),
        }
    }

    pub fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Vec<ScanSignal> {
        let beacon = match Beacon::decode(bytes) {
            Ok(b) => b,
            Err(e) => {
                debug!(%from, "ignoring datagram: {e}");
                return Vec::new();
            }
        };
        if beacon.instance == self.instance {
            return Vec::new();
        }
        let id = SocketAddr::new(from.ip(), beacon.listen_port).to_string();
        if !self.seen.insert(id.clone()) {
            return Vec::new();
        }
        let mut record = PeerRecord::new(id.clone());
        record.display_name = beacon.display_name;
        vec![
            ScanSignal::PeerSeen(record),
            ScanSignal::ServiceMatch {
                id,
                matches: beacon.service == self.identity,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use chatblue_core::DEFAULT_SERVICE_UUID;

    use super::*;

    fn from() -> SocketAddr {
        "192.168.1.20:45688".parse().unwrap()
    }

    #[test]
    fn beacon_becomes_sighting_then_match() {
        let mut f = ScanFilter::new(Uuid::new_v4(), DEFAULT_SERVICE_UUID);
        let b = Beacon::new(DEFAULT_SERVICE_UUID, Uuid::new_v4(), Some("desk".into()), 8988)
            .encode()
            .unwrap();
        let signals = f.on_datagram(&b, from());
        assert_eq!(signals.len(), 2);
        match &signals[0] {
            ScanSignal::PeerSeen(p) => {
                assert_eq!(p.id, "192.168.1.20:8988");
                assert_eq!(p.display_name.as_deref(), Some("desk"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            signals[1],
            ScanSignal::ServiceMatch {
                id: "192.168.1.20:8988".into(),
                matches: true
            }
        );
        assert!(f.on_datagram(&b, from()).is_empty());
    }

    #[test]
    fn foreign_service_does_not_match() {
        let mut f = ScanFilter::new(Uuid::new_v4(), DEFAULT_SERVICE_UUID);
        let b = Beacon::new(Uuid::new_v4(), Uuid::new_v4(), None, 8988)
            .encode()
            .unwrap();
        let signals = f.on_datagram(&b, from());
        assert!(matches!(
            signals.last(),
            Some(ScanSignal::ServiceMatch { matches: false, .. })
        ));
    }

    #[test]
    fn own_beacon_and_garbage_are_ignored() {
        let me = Uuid::new_v4();
        let mut f = ScanFilter::new(me, DEFAULT_SERVICE_UUID);
        let own = Beacon::new(DEFAULT_SERVICE_UUID, me, None, 8988).encode().unwrap();
        assert!(f.on_datagram(&own, from()).is_empty());
        assert!(f.on_datagram(b"\x01\x02", from()).is_empty());
    }

    #[tokio::test]
    async fn loopback_scan_finds_peer_and_finishes() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let scanner = BeaconScanner {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            target: peer_addr,
            multicast: false,
            instance: Uuid::new_v4(),
            display_name: None,
            listen_port: 9000,
            window: Duration::from_millis(300),
        };
        let (mut rx, _task) = scanner.scan(DEFAULT_SERVICE_UUID).unwrap();

        // The scanner's first beacon tells us where to answer.
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, scanner_addr) = peer.recv_from(&mut buf).await.unwrap();
        let theirs = Beacon::decode(&buf[..n]).unwrap();
        assert_eq!(theirs.listen_port, 9000);
        let reply = Beacon::new(DEFAULT_SERVICE_UUID, Uuid::new_v4(), Some("peer".into()), 8988)
            .encode()
            .unwrap();
        peer.send_to(&reply, scanner_addr).await.unwrap();

        let mut signals = Vec::new();
        while let Some(s) = rx.recv().await {
            signals.push(s);
        }
        assert!(matches!(&signals[0], ScanSignal::PeerSeen(p) if p.id == "127.0.0.1:8988"));
        assert!(matches!(&signals[1], ScanSignal::ServiceMatch { matches: true, .. }));
        assert_eq!(signals.last(), Some(&ScanSignal::Finished));
    }

    fn loopback_scanner(target: SocketAddr, instance: Uuid) -> BeaconScanner {
        BeaconScanner {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            target,
            multicast: false,
            instance,
            display_name: None,
            listen_port: 0,
            window: Duration::from_millis(300),
        }
    }

    fn loopback_responder(instance: Uuid) -> BeaconResponder {
        BeaconResponder {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            multicast: false,
            instance,
            display_name: Some("server".into()),
        }
    }

    #[tokio::test]
    async fn responder_makes_a_quiet_host_discoverable() {
        let (addr, responder) = loopback_responder(Uuid::new_v4())
            .spawn(DEFAULT_SERVICE_UUID, 8988)
            .unwrap();
        let scanner = loopback_scanner(addr, Uuid::new_v4());
        let (mut rx, _task) = scanner.scan(DEFAULT_SERVICE_UUID).unwrap();

        let mut signals = Vec::new();
        while let Some(s) = rx.recv().await {
            signals.push(s);
        }
        responder.abort();
        match &signals[0] {
            ScanSignal::PeerSeen(p) => {
                assert_eq!(p.id, "127.0.0.1:8988");
                assert_eq!(p.display_name.as_deref(), Some("server"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&signals[1], ScanSignal::ServiceMatch { matches: true, .. }));
        assert_eq!(signals.len(), 3);
        assert_eq!(signals.last(), Some(&ScanSignal::Finished));
    }

    #[tokio::test]
    async fn responder_ignores_its_own_host() {
        let me = Uuid::new_v4();
        let (addr, responder) = loopback_responder(me).spawn(DEFAULT_SERVICE_UUID, 8988).unwrap();
        let (mut rx, _task) = loopback_scanner(addr, me).scan(DEFAULT_SERVICE_UUID).unwrap();
        assert_eq!(rx.recv().await, Some(ScanSignal::Finished));
        responder.abort();
    }
}
