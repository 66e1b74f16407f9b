//! Discovery tracker: candidate and confirmed peer sets fed by raw scan signals.
//! Host-driven like the rest of the core: callers pass signals, get events back.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// One discovered endpoint. Identity is `id` (transport-local address).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub id: String,
    pub display_name: Option<String>,
    pub signal_strength: Option<i32>,
    pub service_confirmed: bool,
    /// Unix time in milliseconds.
    pub last_seen: u64,
}

impl PeerRecord {
    pub fn new(id: impl Into<String>) -> Self {
        PeerRecord {
            id: id.into(),
            display_name: None,
            signal_strength: None,
            service_confirmed: false,
            last_seen: now_millis(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_signal(mut self, rssi: i32) -> Self {
        self.signal_strength = Some(rssi);
        self
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Raw signals a transport produces while listening for peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanSignal {
    PeerSeen(PeerRecord),
    /// Secondary service-identity lookup result (e.g. SDP).
    ServiceMatch { id: String, matches: bool },
    Finished,
    Failed(String),
}

/// Whether sightings need a service match before they count as found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Peer-list transports: every sighting is a valid counterpart.
    Direct,
    /// Sightings stay candidates until a matching service lookup.
    ServiceLookup,
}

#[derive(Debug)]
pub struct DiscoveryTracker {
    confirmation: Confirmation,
    candidates: HashMap<String, PeerRecord>,
    confirmed: HashMap<String, PeerRecord>,
}

impl DiscoveryTracker {
    pub fn new(confirmation: Confirmation) -> Self {
        Self {
            confirmation,
            candidates: HashMap::new(),
            confirmed: HashMap::new(),
        }
    }

    /// Fresh scan: both sets start empty.
    pub fn on_scan_start(&mut self) -> Event {
        self.candidates.clear();
        self.confirmed.clear();
        Event::ScanStarted
    }

    /// Last sighting wins. Direct transports confirm immediately.
    pub fn on_peer_seen(&mut self, mut record: PeerRecord) -> Option<Event> {
        match self.confirmation {
            Confirmation::Direct => {
                record.service_confirmed = true;
                self.confirmed.insert(record.id.clone(), record.clone());
                Some(Event::PeerFound { peer: record })
            }
            Confirmation::ServiceLookup => {
                record.service_confirmed = false;
                self.candidates.insert(record.id.clone(), record);
                None
            }
        }
    }

    /// Resolve a candidate. It leaves the candidate set either way.
    pub fn on_service_match(&mut self, id: &str, matches: bool) -> Option<Event> {
        let mut record = self.candidates.remove(id)?;
        if !matches {
            return None;
        }
        record.service_confirmed = true;
        self.confirmed.insert(record.id.clone(), record.clone());
        Some(Event::PeerFound { peer: record })
    }

    /// Unresolved candidates are dropped; confirmed peers survive.
    pub fn on_scan_finished(&mut self) -> Event {
        self.candidates.clear();
        Event::ScanFinished
    }

    /// Apply one raw signal.
    pub fn apply(&mut self, signal: ScanSignal) -> Option<Event> {
        match signal {
            ScanSignal::PeerSeen(record) => self.on_peer_seen(record),
            ScanSignal::ServiceMatch { id, matches } => self.on_service_match(&id, matches),
            ScanSignal::Finished => Some(self.on_scan_finished()),
            ScanSignal::Failed(msg) => Some(Event::ScanError { message: msg }),
        }
    }

    pub fn clear(&mut self) {
        self.confirmed.clear();
    }

    pub fn confirmed(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self.confirmed.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn is_candidate(&self, id: &str) -> bool {
        self.candidates.contains_key(id)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(events: &[Option<Event>]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Some(Event::PeerFound { .. })))
            .count()
    }

    #[test]
    fn duplicate_sighting_yields_one_candidate_and_one_found() {
        let mut t = DiscoveryTracker::new(Confirmation::ServiceLookup);
        t.on_scan_start();
        let events = vec![
            t.on_peer_seen(PeerRecord::new("AA:BB").with_signal(-70)),
            t.on_peer_seen(PeerRecord::new("AA:BB").with_signal(-40).with_name("phone")),
        ];
        assert_eq!(found(&events), 0);
        assert_eq!(t.candidate_count(), 1);

        let ev = t.on_service_match("AA:BB", true);
        match ev {
            Some(Event::PeerFound { peer }) => {
                assert_eq!(peer.signal_strength, Some(-40));
                assert_eq!(peer.display_name.as_deref(), Some("phone"));
                assert!(peer.service_confirmed);
            }
            other => panic!("expected PeerFound, got {other:?}"),
        }
        assert!(t.on_service_match("AA:BB", true).is_none());
        assert_eq!(t.confirmed().len(), 1);
    }

    #[test]
    fn non_matching_service_is_dropped() {
        let mut t = DiscoveryTracker::new(Confirmation::ServiceLookup);
        t.on_peer_seen(PeerRecord::new("X"));
        assert!(t.on_service_match("X", false).is_none());
        assert!(!t.is_candidate("X"));
        assert!(t.confirmed().is_empty());
    }

    #[test]
    fn match_for_unknown_id_is_ignored() {
        let mut t = DiscoveryTracker::new(Confirmation::ServiceLookup);
        assert!(t.on_service_match("ghost", true).is_none());
        assert!(t.confirmed().is_empty());
    }

    #[test]
    fn scan_finished_drops_candidates_keeps_confirmed() {
        let mut t = DiscoveryTracker::new(Confirmation::ServiceLookup);
        t.on_scan_start();
        t.on_peer_seen(PeerRecord::new("A"));
        t.on_peer_seen(PeerRecord::new("B"));
        t.on_service_match("A", true);
        assert_eq!(t.on_scan_finished(), Event::ScanFinished);
        let ids: Vec<String> = t.confirmed().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["A".to_string()]);
        assert!(!t.is_candidate("B"));

        // A late match for B after the sweep finds nothing to confirm.
        assert!(t.on_service_match("B", true).is_none());
    }

    #[test]
    fn direct_transport_confirms_on_sight() {
        let mut t = DiscoveryTracker::new(Confirmation::Direct);
        let ev = t.apply(ScanSignal::PeerSeen(PeerRecord::new("192.168.49.1:8988")));
        assert!(matches!(ev, Some(Event::PeerFound { .. })));
        let ev = t.apply(ScanSignal::PeerSeen(PeerRecord::new("192.168.49.1:8988")));
        assert!(matches!(ev, Some(Event::PeerFound { .. })));
        assert_eq!(t.confirmed().len(), 1);
        assert_eq!(t.candidate_count(), 0);
    }

    #[test]
    fn clear_and_restart() {
        let mut t = DiscoveryTracker::new(Confirmation::Direct);
        t.on_peer_seen(PeerRecord::new("A"));
        t.clear();
        assert!(t.confirmed().is_empty());
        t.on_peer_seen(PeerRecord::new("B"));
        assert_eq!(t.on_scan_start(), Event::ScanStarted);
        assert!(t.confirmed().is_empty());
    }

    #[test]
    fn failed_signal_maps_to_scan_error() {
        let mut t = DiscoveryTracker::new(Confirmation::Direct);
        assert_eq!(
            t.apply(ScanSignal::Failed("discoverPeers failed: 2".into())),
            Some(Event::ScanError {
                message: "discoverPeers failed: 2".into()
            })
        );
    }
}
