//! Flash engine: CFI-driven erase/program/verify, PPB unlock, and the
//! segment-windowed addressing that exposes more than 32 MiB of physical
//! Flash through the device's 8-entry mapping table.

use std::thread::sleep;
use std::time::Duration;

use rand::Rng;

use crate::error::ChisError;
use crate::protocol::{identity_mapping_for_segment, read_rom, set_flash_mapping, write_rom_u16};
use crate::transport::Transport;

/// Size of one logical mapping window.
pub const SEGMENT: u64 = 0x0200_0000;

const CMD_UNLOCK_1: u32 = 0x000555;
const CMD_UNLOCK_2: u32 = 0x0002AA;

fn amd_unlock_sequence(transport: &mut dyn Transport, third: u16) -> Result<(), ChisError> {
    write_rom_u16(transport, CMD_UNLOCK_1, 0xAA)?;
    write_rom_u16(transport, CMD_UNLOCK_2, 0x55)?;
    write_rom_u16(transport, CMD_UNLOCK_1, third)?;
    Ok(())
}

/// Erases the entire chip. Polls word `0x000000` every 500ms until it reads
/// `0xFFFF`, after an initial 100ms settle.
pub fn erase_chip(transport: &mut dyn Transport) -> Result<(), ChisError> {
    amd_unlock_sequence(transport, 0x80)?;
    amd_unlock_sequence(transport, 0x10)?;

    sleep(Duration::from_millis(100));
    loop {
        let data = read_rom(transport, 0x000000, 2)?;
        if u16::from_le_bytes([data[0], data[1]]) == 0xFFFF {
            break;
        }
        sleep(Duration::from_millis(500));
    }
    Ok(())
}

/// Erases one sector at word address `addr_word`. Polls the same address
/// every 100ms until it reads `0xFFFF`, after an initial 10ms settle.
pub fn erase_sector(transport: &mut dyn Transport, addr_word: u32) -> Result<(), ChisError> {
    write_rom_u16(transport, CMD_UNLOCK_1, 0xAA)?;
    write_rom_u16(transport, CMD_UNLOCK_2, 0x55)?;
    write_rom_u16(transport, CMD_UNLOCK_1, 0x80)?;
    write_rom_u16(transport, CMD_UNLOCK_1, 0xAA)?;
    write_rom_u16(transport, CMD_UNLOCK_2, 0x55)?;
    write_rom_u16(transport, addr_word, 0x30)?;

    sleep(Duration::from_millis(10));
    loop {
        let data = read_rom(transport, addr_word, 2)?;
        if u16::from_le_bytes([data[0], data[1]]) == 0xFFFF {
            break;
        }
        sleep(Duration::from_millis(100));
    }
    Ok(())
}

/// Unlocks (clears) the Persistent Protection Bit on every sector. Resets
/// the mapping to identity first, as the original firmware requires.
pub fn unlock_ppb(transport: &mut dyn Transport) -> Result<(), ChisError> {
    set_flash_mapping(transport, &identity_mapping_for_segment(0))?;

    write_rom_u16(transport, CMD_UNLOCK_1, 0xAA)?;
    write_rom_u16(transport, CMD_UNLOCK_2, 0x55)?;
    write_rom_u16(transport, CMD_UNLOCK_1, 0xC0)?;

    write_rom_u16(transport, 0, 0x80)?;
    write_rom_u16(transport, 0, 0x30)?;

    sleep(Duration::from_millis(100));
    loop {
        write_rom_u16(transport, CMD_UNLOCK_1, 0x70)?;
        let status = read_rom(transport, 0, 2)?;
        if u16::from_le_bytes([status[0], status[1]]) & 0x80 != 0 {
            break;
        }
        sleep(Duration::from_millis(100));
    }

    write_rom_u16(transport, 0, 0x90)?;
    write_rom_u16(transport, 0, 0x00)?;
    write_rom_u16(transport, 0, 0xF0)?;
    Ok(())
}

/// Diagnostic-only probe for whether PPB protection is currently locked
/// (supplemented from `device_adapter.py`'s `checkPPBLocked`; no job plan
/// calls this, they always unlock unconditionally).
pub fn ppb_locked(transport: &mut dyn Transport) -> Result<bool, ChisError> {
    write_rom_u16(transport, CMD_UNLOCK_1, 0xAA)?;
    write_rom_u16(transport, CMD_UNLOCK_2, 0x55)?;
    write_rom_u16(transport, CMD_UNLOCK_1, 0x50)?;

    let status = read_rom(transport, 0, 2)?;
    let locked = u16::from_le_bytes([status[0], status[1]]) != 0;

    write_rom_u16(transport, 0, 0x90)?;
    write_rom_u16(transport, 0, 0x00)?;
    write_rom_u16(transport, 0, 0xF0)?;
    Ok(locked)
}

/// Rough erase-time estimate in the device's own CFI timeout units
/// (supplemented from `device_adapter.py`'s `getRomEraseTime`; used only to
/// annotate log messages, never to drive control flow).
pub fn erase_time_estimate(
    transport: &mut dyn Transport,
    sector_count: u32,
) -> Result<u32, ChisError> {
    let (timeout_block, timeout_chip) = crate::protocol::cfi_timeouts(transport)?;
    if timeout_chip == 1 {
        Ok(timeout_block.saturating_mul(sector_count))
    } else {
        Ok(timeout_chip)
    }
}

/// Tracks which 32 MiB segment is currently exposed through the mapping
/// table, and retunes it on demand as logical offsets cross `SEGMENT`
/// boundaries.
pub struct SegmentTracker {
    current: Option<u8>,
}

impl SegmentTracker {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Segment number for a logical byte offset.
    pub fn segment_of(logical_offset: u64) -> u8 {
        (logical_offset / SEGMENT) as u8
    }

    /// Ensures the mapping active on `transport` matches `logical_offset`'s
    /// segment, reprogramming it if necessary, and returns the local offset
    /// within that segment.
    pub fn retune(&mut self, transport: &mut dyn Transport, logical_offset: u64) -> Result<u64, ChisError> {
        let seg = Self::segment_of(logical_offset);
        let local = logical_offset % SEGMENT;
        if self.current != Some(seg) {
            set_flash_mapping(transport, &identity_mapping_for_segment(seg))?;
            self.current = Some(seg);
        }
        Ok(local)
    }

    /// Forces the mapping back to segment 0's identity mapping, as plans do
    /// between their erase/program/verify phases.
    pub fn reset_identity(&mut self, transport: &mut dyn Transport) -> Result<(), ChisError> {
        set_flash_mapping(transport, &identity_mapping_for_segment(0))?;
        self.current = Some(0);
        Ok(())
    }
}

impl Default for SegmentTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The CFI-driven fast-QA region plan: the first 4 MiB, the last 4 MiB, and
/// four random sector-aligned 2 MiB windows drawn from
/// `[4 MiB, device_size - 6 MiB]`.
///
/// The RNG is injected so tests can supply a deterministic seed; production
/// callers seed it from wall-clock seconds.
pub fn fast_qa_regions<R: Rng>(
    device_size: u64,
    sector_size: u32,
    rng: &mut R,
) -> Vec<(u64, u64)> {
    const MIB: u64 = 1024 * 1024;
    let mut regions = Vec::with_capacity(6);

    regions.push((0, 4 * MIB));
    regions.push((device_size - 4 * MIB, device_size));

    let sector_size = sector_size as u64;
    let low = 4 * MIB;
    let high = device_size - 6 * MIB;
    for _ in 0..4 {
        let start = rng.gen_range(low..=high);
        let aligned = (start / sector_size) * sector_size;
        regions.push((aligned, aligned + 2 * MIB));
    }

    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use rand::SeedableRng;

    #[test]
    fn segment_tracker_retunes_only_on_boundary_crossing() {
        let mut transport = MockTransport::new();
        transport.push_response(&[0xAA; 32]); // first retune: 32 writes
        let mut tracker = SegmentTracker::new();
        let local = tracker.retune(&mut transport, 10).unwrap();
        assert_eq!(local, 10);
        assert_eq!(transport.written.len(), 11 * 32);

        // same segment again: no further writes
        let local2 = tracker.retune(&mut transport, SEGMENT - 1).unwrap();
        assert_eq!(local2, SEGMENT - 1);
        assert_eq!(transport.written.len(), 11 * 32);
    }

    #[test]
    fn segment_tracker_crosses_into_next_segment() {
        let mut transport = MockTransport::new();
        transport.push_response(&[0xAA; 64]);
        let mut tracker = SegmentTracker::new();
        tracker.retune(&mut transport, SEGMENT - 1).unwrap();
        let local = tracker.retune(&mut transport, SEGMENT).unwrap();
        assert_eq!(local, 0);
        assert_eq!(SegmentTracker::segment_of(SEGMENT), 1);
        assert_eq!(transport.written.len(), 11 * 64);
    }

    #[test]
    fn fast_qa_regions_cover_head_tail_and_four_random_windows() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let device_size = 64 * 1024 * 1024u64;
        let sector_size = 64 * 1024u32;
        let regions = fast_qa_regions(device_size, sector_size, &mut rng);
        assert_eq!(regions.len(), 6);
        assert_eq!(regions[0], (0, 4 * 1024 * 1024));
        assert_eq!(regions[1], (device_size - 4 * 1024 * 1024, device_size));
        for &(start, end) in &regions[2..] {
            assert_eq!(end - start, 2 * 1024 * 1024);
            assert_eq!(start % sector_size as u64, 0);
            assert!(start >= 4 * 1024 * 1024);
        }
    }
}
