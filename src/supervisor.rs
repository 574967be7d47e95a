//! Device supervisor: owns every known [`Device`], runs at most one job per
//! device on its own thread, and gives a caller cooperative control over
//! cancellation and shutdown.
//!
//! Rust has no safe way to force-kill a running thread. This supervisor
//! waits a grace period for a worker to notice its cancel flag, then gives
//! up waiting — the worker keeps running until it next polls that flag, it
//! just stops being this supervisor's problem.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::QaConfig;
use crate::device::{Device, PortId};
use crate::events::{EventSender, EventSink};
use crate::log::warning;
use crate::plan::{self, CancelFlag};
use crate::transport::Transport;

/// One long-running operation a device can be asked to perform.
pub enum Job {
    Qa(QaConfig),
    Production(Vec<u8>),
    ResetNor,
    Backup { size: u64, sink: Box<dyn Write + Send> },
}

/// Why [`Supervisor::start`] refused to start a job.
#[derive(Debug)]
pub enum StartError {
    NotConnected,
    Busy,
}

struct Worker {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<(Box<dyn Transport>, bool)>,
}

/// The busy-wait budget `start` gives a superseded worker to notice
/// cancellation before refusing to start the replacement job.
const RESTART_GRACE: Duration = Duration::from_millis(1000);
/// The same budget `shutdown` gives every worker before giving up on it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(5000);
const POLL_STEP: Duration = Duration::from_millis(10);

/// Owns the fleet of known devices and their in-flight jobs.
pub struct Supervisor {
    devices: HashMap<PortId, Device>,
    workers: HashMap<PortId, Worker>,
    tx: EventSender,
}

impl Supervisor {
    pub fn new(tx: EventSender) -> Self {
        Self {
            devices: HashMap::new(),
            workers: HashMap::new(),
            tx,
        }
    }

    pub fn add_device(&mut self, device: Device) {
        self.devices.insert(device.port_id.clone(), device);
    }

    pub fn remove_device(&mut self, port: &PortId) {
        self.devices.remove(port);
        self.workers.remove(port);
    }

    pub fn device(&self, port: &PortId) -> Option<&Device> {
        self.devices.get(port)
    }

    pub fn ports(&self) -> Vec<PortId> {
        self.devices.keys().cloned().collect()
    }

    /// Joins a finished worker's thread and puts its transport back on the
    /// device. Returns `true` if a worker was actually reaped.
    fn reap_if_finished(&mut self, port: &PortId) -> bool {
        let finished = matches!(self.workers.get(port), Some(w) if w.thread.is_finished());
        if !finished {
            return false;
        }
        if let Some(worker) = self.workers.remove(port) {
            if let Ok((transport, ok)) = worker.thread.join() {
                if let Some(device) = self.devices.get_mut(port) {
                    device.restore_transport(transport);
                    if ok {
                        device.mark_success();
                    } else {
                        device.mark_failed("job reported failure");
                    }
                }
            }
        }
        true
    }

    /// Cancels the running worker for `port`, if any, and waits up to
    /// [`RESTART_GRACE`] for it to finish. Returns `true` if the device is
    /// now idle (no worker holding its transport).
    fn cancel_and_wait(&mut self, port: &PortId) -> bool {
        if let Some(worker) = self.workers.get(port) {
            worker.cancel.store(true, Ordering::Relaxed);
        } else {
            return true;
        }

        let deadline = Instant::now() + RESTART_GRACE;
        while Instant::now() < deadline {
            if self.reap_if_finished(port) {
                return true;
            }
            thread::sleep(POLL_STEP);
        }
        self.reap_if_finished(port)
    }

    /// Starts `job` on `port`'s device. If a job is already running there,
    /// cancels it first and waits `RESTART_GRACE` for it to release the
    /// transport; if it hasn't by then, refuses with `StartError::Busy`
    /// rather than risk two workers racing the same transport.
    pub fn start(&mut self, port: &PortId, job: Job) -> Result<(), StartError> {
        if !self.cancel_and_wait(port) {
            return Err(StartError::Busy);
        }

        let device = self.devices.get_mut(port).ok_or(StartError::NotConnected)?;
        let transport = device.take_transport().ok_or(StartError::NotConnected)?;
        device.mark_working();

        let cancel = Arc::new(AtomicBool::new(false));
        let sink = EventSink::new(port.clone(), self.tx.clone());

        let thread_cancel = Arc::clone(&cancel);
        let thread = thread::spawn(move || run_job(transport, job, &thread_cancel, &sink));
        self.workers.insert(port.clone(), Worker { cancel, thread });
        Ok(())
    }

    /// Number of workers still running (or not yet reaped).
    pub fn active_job_count(&self) -> usize {
        self.workers.len()
    }

    /// Reconciles finished workers with their devices' recorded status.
    /// Call periodically (e.g. alongside the port scanner's poll) since
    /// there is no blocking "worker finished" notification besides the
    /// `Event::Finished` the caller already receives on the event bus.
    pub fn reap_finished(&mut self) {
        let ports: Vec<PortId> = self.workers.keys().cloned().collect();
        for port in ports {
            self.reap_if_finished(&port);
        }
    }

    /// Starts `job_for` on every currently connected device, staggering
    /// each start by a cumulative random 0.5-1.0s delay (mirrors the
    /// original tool's USB inrush-current mitigation).
    pub fn start_all<F, R>(&mut self, job_for: F, rng: &mut R)
    where
        F: Fn() -> Job,
        R: Rng,
    {
        let ports: Vec<PortId> = self
            .devices
            .iter()
            .filter(|(_, d)| d.is_connected())
            .map(|(p, _)| p.clone())
            .collect();

        let mut delay = Duration::ZERO;
        for port in ports {
            thread::sleep(delay);
            let _ = self.start(&port, job_for());
            let secs = rng.gen_range(0.5..1.0f64);
            delay = Duration::from_secs_f64(secs);
        }
    }

    /// Cancels every running worker, waits up to [`SHUTDOWN_GRACE`] total,
    /// and disconnects every device whose transport could be recovered.
    pub fn shutdown(&mut self) {
        for worker in self.workers.values() {
            worker.cancel.store(true, Ordering::Relaxed);
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline && !self.workers.is_empty() {
            self.reap_finished();
            if !self.workers.is_empty() {
                thread::sleep(POLL_STEP);
            }
        }

        if !self.workers.is_empty() {
            warning!(
                "{} worker(s) did not finish within the shutdown grace period",
                self.workers.len()
            );
        }

        for device in self.devices.values_mut() {
            if device.is_connected() {
                device.disconnect();
            }
        }
    }
}

fn run_job(
    mut transport: Box<dyn Transport>,
    job: Job,
    cancel: &CancelFlag,
    sink: &EventSink,
) -> (Box<dyn Transport>, bool) {
    let ok = match job {
        Job::Qa(config) => plan::qa::run(transport.as_mut(), cancel, sink, &config),
        Job::Production(image) => plan::production::run(transport.as_mut(), cancel, sink, &image),
        Job::ResetNor => plan::reset_nor::run(transport.as_mut(), cancel, sink),
        Job::Backup { size, sink: mut out } => {
            plan::backup::run(transport.as_mut(), cancel, sink, size, out.as_mut())
        }
    };
    (transport, ok)
}
