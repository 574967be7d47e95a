//! Length-prefixed command framing.
//!
//! ```text
//! [size:u16 LE][opcode:u8][body:variable][crc:u16 LE, ZERO-FILLED]
//! ```
//!
//! `size` counts every byte of the frame, including itself and the trailing
//! CRC placeholder. The device never validates the CRC field, so it is
//! always transmitted as two zero bytes — this codec must never attempt to
//! compute a real one.

use crate::error::{ChisError, FrameError};
use crate::transport::Transport;

/// Builds a complete command frame for `opcode` with `body` as its payload.
pub fn encode(opcode: u8, body: &[u8]) -> Vec<u8> {
    let size = 2 + 1 + body.len() + 2;
    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&(size as u16).to_le_bytes());
    frame.push(opcode);
    frame.extend_from_slice(body);
    frame.extend_from_slice(&[0, 0]);
    frame
}

/// Sends a write-class command and returns its single acknowledgement byte.
///
/// Only `programRom` (opcode `0xF4`) has a documented success value; every
/// other write command's ack byte is read for flow control and otherwise
/// ignored by callers.
pub fn write_command(transport: &mut dyn Transport, opcode: u8, body: &[u8]) -> Result<u8, ChisError> {
    let frame = encode(opcode, body);
    transport.write_all(&frame)?;

    let mut ack = [0u8; 1];
    transport.read_exact(&mut ack).map_err(|_| FrameError::EmptyAck)?;
    Ok(ack[0])
}

/// Sends a read-class command and returns the `length`-byte payload, with
/// the 2-byte response header already stripped.
pub fn read_command(
    transport: &mut dyn Transport,
    opcode: u8,
    body: &[u8],
    length: usize,
) -> Result<Vec<u8>, ChisError> {
    let frame = encode(opcode, body);
    transport.write_all(&frame)?;

    let mut response = vec![0u8; length + 2];
    transport
        .read_exact(&mut response)
        .map_err(|_| FrameError::ShortRead {
            expected: length + 2,
            got: 0,
        })?;
    Ok(response.split_off(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn encode_size_prefix_matches_total_length() {
        let frame = encode(0xF8, &[1, 2, 3, 4]);
        let size = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(size, frame.len());
    }

    #[test]
    fn encode_crc_trailer_is_always_zero() {
        let frame = encode(0xF5, &[9, 9]);
        assert_eq!(&frame[frame.len() - 2..], &[0, 0]);
    }

    #[test]
    fn write_command_returns_raw_ack_byte() {
        let mut transport = MockTransport::new();
        transport.push_response(&[0xAA]);
        let ack = write_command(&mut transport, 0xF4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(ack, 0xAA);
    }

    #[test]
    fn read_command_strips_two_byte_header() {
        let mut transport = MockTransport::new();
        transport.push_response(&[0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF]);
        let payload = read_command(&mut transport, 0xF8, &[0; 6], 4).unwrap();
        assert_eq!(payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
