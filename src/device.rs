//! Data model for a single SuperChis cartridge endpoint.

use std::io;

use crate::transport::{SerialTransport, Transport};

/// Opaque string naming a serial endpoint. Unique per process.
pub type PortId = String;

/// The lifecycle state of a [`Device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Disconnected,
    Connected,
    Working,
    Success,
    Failed { reason: String },
}

/// Owns one serial endpoint and its state.
///
/// Invariant: at most one in-flight operation at any time. This struct does
/// not enforce that itself — the supervisor guarantees it by running
/// exactly one worker per device.
pub struct Device {
    pub port_id: PortId,
    transport: Option<Box<dyn Transport>>,
    pub status: DeviceStatus,
    pub error_count: u32,
    pub last_message: Option<String>,
}

impl Device {
    pub fn new(port_id: PortId) -> Self {
        Self {
            port_id,
            transport: None,
            status: DeviceStatus::Disconnected,
            error_count: 0,
            last_message: None,
        }
    }

    /// Opens the serial endpoint, pulsing DTR to reset the device.
    pub fn connect(&mut self) -> io::Result<()> {
        let transport = SerialTransport::open(&self.port_id)?;
        self.transport = Some(Box::new(transport));
        self.status = DeviceStatus::Connected;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.transport = None;
        self.status = DeviceStatus::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Exclusive access to the underlying transport, for a plan to drive.
    /// Returns `None` if the device isn't connected.
    pub fn transport_mut<'a>(&'a mut self) -> Option<&'a mut (dyn Transport + 'a)> {
        match &mut self.transport {
            Some(b) => Some(b.as_mut()),
            None => None,
        }
    }

    /// Hands ownership of the transport to a worker thread. The device
    /// keeps its `Connected`/`Working` status while the transport is out on
    /// loan; callers must `restore_transport` it when the worker finishes.
    pub fn take_transport(&mut self) -> Option<Box<dyn Transport>> {
        self.transport.take()
    }

    pub fn restore_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn mark_working(&mut self) {
        self.status = DeviceStatus::Working;
    }

    pub fn mark_success(&mut self) {
        self.status = DeviceStatus::Success;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.error_count += 1;
        self.status = DeviceStatus::Failed {
            reason: reason.into(),
        };
    }
}
