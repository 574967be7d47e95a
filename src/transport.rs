//! The byte-stream seam underneath the frame codec.
//!
//! `Transport` is something the device driver can write command bytes to
//! and read acknowledgement/response bytes from. Making it a trait (rather
//! than hard-coding `serialport::SerialPort`) keeps the frame codec, device
//! driver, and flash engine testable without a physical device.

use std::io::{self, Read, Write};
use std::time::Duration;

/// USB VID/PID the port scanner matches against.
pub const DEVICE_VID: u16 = 0x0483;
pub const DEVICE_PID: u16 = 0x0721;

const BAUD_RATE: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A full-duplex byte stream to a device.
///
/// No retry, no reconnect logic: no timeout handling beyond what the
/// implementation's own read timeout already provides.
pub trait Transport: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

/// A real serial port, opened 115200 8-N-1 with a 5s read timeout.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    /// Opens `path`, pulsing DTR high-then-low once to reset the device.
    pub fn open(path: &str) -> io::Result<Self> {
        let mut port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        port.write_data_terminal_ready(true)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        port.write_data_terminal_ready(false)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.port, buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        Read::read_exact(&mut self.port, buf)
    }
}

/// Returns the port identifiers of every attached device matching the
/// SuperChis USB VID/PID, as polled by the port scanner.
pub fn matching_ports() -> io::Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(ports
        .into_iter()
        .filter_map(|p| match p.port_type {
            serialport::SerialPortType::UsbPort(info)
                if info.vid == DEVICE_VID && info.pid == DEVICE_PID =>
            {
                Some(p.port_name)
            }
            _ => None,
        })
        .collect())
}

/// An in-memory `Transport` double, exposed outside unit tests (behind the
/// `test-util` feature) so the `tests/` integration suite can drive job
/// plans without a physical device.
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! An in-memory `Transport` double: a queue of canned responses and a
    //! log of everything written to it. Used by every other module's test
    //! suite instead of a physical SuperChis cartridge.
    use super::Transport;
    use std::collections::VecDeque;
    use std::io;

    #[derive(Default)]
    pub struct MockTransport {
        pub written: Vec<u8>,
        responses: VecDeque<u8>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues bytes to be handed back by future `read_exact` calls.
        pub fn push_response(&mut self, bytes: &[u8]) {
            self.responses.extend(bytes.iter().copied());
        }
    }

    impl Transport for MockTransport {
        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(buf);
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
            if self.responses.len() < buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "mock transport ran out of canned responses",
                ));
            }
            for slot in buf.iter_mut() {
                *slot = self.responses.pop_front().unwrap();
            }
            Ok(())
        }
    }
}
