//! Typed event bus delivering `{log, progress, finished}` events, keyed by
//! port, to a single observer.
//!
//! The supervisor knows nothing about how events are rendered — it only
//! ever calls [`EventSink`] methods, which hide the channel underneath.

use std::sync::mpsc;

use crate::device::PortId;

/// A single thing that happened on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Log { port: PortId, message: String },
    Progress { port: PortId, pct: u8 },
    Finished { port: PortId, ok: bool },
}

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

/// Creates a fresh bus: clone the sender into every worker, keep the
/// receiver on the single observer thread.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel()
}

/// A per-device handle bound to one port, so plan code never has to repeat
/// the port id at every call site.
#[derive(Clone)]
pub struct EventSink {
    port: PortId,
    tx: EventSender,
}

impl EventSink {
    pub fn new(port: PortId, tx: EventSender) -> Self {
        Self { port, tx }
    }

    /// Emission is best-effort: a disconnected observer must never stall or
    /// panic a worker.
    pub fn log(&self, message: impl Into<String>) {
        let _ = self.tx.send(Event::Log {
            port: self.port.clone(),
            message: message.into(),
        });
    }

    pub fn progress(&self, pct: u8) {
        let _ = self.tx.send(Event::Progress {
            port: self.port.clone(),
            pct,
        });
    }

    pub fn finished(&self, ok: bool) {
        let _ = self.tx.send(Event::Finished {
            port: self.port.clone(),
            ok,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_the_originating_port_and_arrive_in_order() {
        let (tx, rx) = channel();
        let sink = EventSink::new("mock0".to_string(), tx);
        sink.log("starting");
        sink.progress(50);
        sink.finished(true);

        assert_eq!(
            rx.recv().unwrap(),
            Event::Log {
                port: "mock0".to_string(),
                message: "starting".to_string()
            }
        );
        assert_eq!(
            rx.recv().unwrap(),
            Event::Progress {
                port: "mock0".to_string(),
                pct: 50
            }
        );
        assert_eq!(
            rx.recv().unwrap(),
            Event::Finished {
                port: "mock0".to_string(),
                ok: true
            }
        );
    }

    #[test]
    fn emission_after_observer_drop_does_not_panic() {
        let (tx, rx) = channel();
        drop(rx);
        let sink = EventSink::new("mock0".to_string(), tx);
        sink.log("nobody is listening");
    }
}
