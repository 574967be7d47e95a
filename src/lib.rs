//! Host-side production programmer for the SuperChis cartridge device
//! family: frame codec, device driver, Flash engine, job plans, and the
//! multi-device supervisor that drives them.

#[macro_use]
mod log;

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod flash;
pub mod frame;
pub mod plan;
pub mod protocol;
pub mod scanner;
pub mod supervisor;
pub mod transport;

pub use config::QaConfig;
pub use device::{Device, DeviceStatus, PortId};
pub use error::{ChisError, Result};
pub use events::{Event, EventReceiver, EventSender, EventSink};
pub use scanner::{ScanDelta, Scanner};
pub use supervisor::{Job, StartError, Supervisor};
pub use transport::Transport;
