//! Single-listener event sink. Emitting without a listener drops the event.

use std::sync::Mutex;

use chatblue_core::Event;
use tokio::sync::mpsc;

use crate::lock;

#[derive(Debug, Default)]
pub struct EventSink {
    tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the listener, replacing any previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.tx) = Some(tx);
        rx
    }

    pub fn has_listener(&self) -> bool {
        lock(&self.tx).is_some()
    }

    pub fn emit(&self, event: Event) {
        let mut guard = lock(&self.tx);
        if let Some(tx) = guard.as_ref() {
            if tx.send(event).is_err() {
                // Receiver dropped.
                *guard = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_listener_is_dropped() {
        let sink = EventSink::new();
        sink.emit(Event::ScanStarted);
        let mut rx = sink.subscribe();
        sink.emit(Event::ScanFinished);
        assert_eq!(rx.try_recv().ok(), Some(Event::ScanFinished));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscribe_replaces_previous_listener() {
        let sink = EventSink::new();
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();
        sink.emit(Event::ScanStarted);
        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().ok(), Some(Event::ScanStarted));
    }

    #[test]
    fn dropped_receiver_clears_listener() {
        let sink = EventSink::new();
        drop(sink.subscribe());
        sink.emit(Event::ScanStarted);
        assert!(!sink.has_listener());
    }
}
