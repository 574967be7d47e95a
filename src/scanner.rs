//! Port scanner: polls for SuperChis devices every 2s and reports the
//! added/removed set since the last poll.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::PortId;
use crate::log::{info, warning};
use crate::transport::matching_ports;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The set of ports that appeared or disappeared between two polls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanDelta {
    pub added: Vec<PortId>,
    pub removed: Vec<PortId>,
}

/// Diffs a freshly observed port list against the previously known set,
/// without touching any I/O — the part of `DeviceScanner.run`'s callback
/// that decides which devices are new and which vanished.
pub fn diff(known: &HashSet<PortId>, observed: &[PortId]) -> ScanDelta {
    let observed_set: HashSet<PortId> = observed.iter().cloned().collect();
    let added = observed_set.difference(known).cloned().collect();
    let removed = known.difference(&observed_set).cloned().collect();
    ScanDelta { added, removed }
}

/// A background thread polling `transport::matching_ports` every 2s and
/// sending a [`ScanDelta`] whenever the attached set changes.
pub struct Scanner {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Scanner {
    /// Spawns the polling thread. `list_ports` is injected so tests can
    /// supply a canned sequence instead of enumerating real hardware.
    pub fn spawn<F>(tx: mpsc::Sender<ScanDelta>, mut list_ports: F) -> Self
    where
        F: FnMut() -> io::Result<Vec<PortId>> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = Arc::clone(&running);

        let thread = thread::spawn(move || {
            let mut known: HashSet<PortId> = HashSet::new();
            while running_thread.load(Ordering::Relaxed) {
                match list_ports() {
                    Ok(observed) => {
                        let delta = diff(&known, &observed);
                        if !delta.added.is_empty() || !delta.removed.is_empty() {
                            for port in &delta.added {
                                info!("discovered device on {}", port);
                                known.insert(port.clone());
                            }
                            for port in &delta.removed {
                                info!("lost device on {}", port);
                                known.remove(port);
                            }
                            if tx.send(delta).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => warning!("port enumeration failed: {}", e),
                }
                thread::sleep(POLL_INTERVAL);
            }
        });

        Self {
            running,
            thread: Some(thread),
        }
    }

    /// Spawns against the real system port list.
    pub fn spawn_system(tx: mpsc::Sender<ScanDelta>) -> Self {
        Self::spawn(tx, matching_ports)
    }

    /// Signals the poll loop to stop and joins it.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_reports_newly_attached_port() {
        let known = HashSet::new();
        let delta = diff(&known, &["com3".to_string()]);
        assert_eq!(delta.added, vec!["com3".to_string()]);
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn diff_reports_detached_port() {
        let mut known = HashSet::new();
        known.insert("com3".to_string());
        let delta = diff(&known, &[]);
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed, vec!["com3".to_string()]);
    }

    #[test]
    fn diff_is_empty_when_set_is_unchanged() {
        let mut known = HashSet::new();
        known.insert("com3".to_string());
        let delta = diff(&known, &["com3".to_string()]);
        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn scanner_reports_delta_from_injected_port_list() {
        let (tx, rx) = mpsc::channel();
        let calls = Arc::new(AtomicBool::new(false));
        let calls_thread = Arc::clone(&calls);
        let scanner = Scanner::spawn(tx, move || {
            if !calls_thread.swap(true, Ordering::SeqCst) {
                Ok(vec!["com3".to_string()])
            } else {
                Ok(vec!["com3".to_string()])
            }
        });

        let delta = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(delta.added, vec!["com3".to_string()]);
        scanner.stop();
    }
}
