//! Reset-NOR plan: blanks the 2 MiB metadata window at
//! `[0x0020_0000, 0x0040_0000)` and verifies its first 512 bytes read back
//! as `0xFF`.

use crate::error::ChisError;
use crate::events::EventSink;
use crate::flash::{erase_sector, unlock_ppb};
use crate::protocol::{cfi_query, read_rom, set_mode, set_flash_mapping, identity_mapping_for_segment, ModeFlags};
use crate::transport::Transport;

use super::{bail_if_cancelled, CancelFlag};

const WINDOW_START: u64 = 0x0020_0000;
const WINDOW_END: u64 = 0x0040_0000;

fn enter_write_mode(transport: &mut dyn Transport) -> Result<(), ChisError> {
    set_mode(
        transport,
        ModeFlags {
            sdram: false,
            sd_enable: false,
            write_enable: true,
            sram_bank: 0,
        },
        0x8,
    )
}

/// Runs the reset-NOR plan: unlock PPB, erase the metadata window
/// sector-by-sector, then confirm it reads back blank.
pub fn run(transport: &mut dyn Transport, cancel: &CancelFlag, sink: &EventSink) -> bool {
    sink.log("resetting NOR metadata window");
    sink.progress(10);

    if bail_if_cancelled(cancel, sink) {
        return false;
    }
    if !super::run_step(sink, || {
        enter_write_mode(transport)?;
        set_flash_mapping(transport, &identity_mapping_for_segment(0))
    }) {
        return false;
    }
    sink.progress(20);

    if bail_if_cancelled(cancel, sink) {
        return false;
    }
    if !super::run_step(sink, || unlock_ppb(transport)) {
        return false;
    }
    sink.log("PPB unlocked");
    sink.progress(30);

    let cfi = match super::run_result(sink, || cfi_query(transport)) {
        Some(c) => c,
        None => return false,
    };
    let sector_size = cfi.sector_size_bytes as u64;
    let sector_count = (WINDOW_END - WINDOW_START) / sector_size;

    for i in 0..sector_count {
        if bail_if_cancelled(cancel, sink) {
            return false;
        }
        let addr = WINDOW_START + i * sector_size;
        if !super::run_step(sink, || erase_sector(transport, (addr >> 1) as u32)) {
            return false;
        }
        sink.log(format!("erased sector {}/{}", i + 1, sector_count));
    }
    sink.progress(80);

    if bail_if_cancelled(cancel, sink) {
        return false;
    }
    let readback = match super::run_result(sink, || read_rom(transport, (WINDOW_START >> 1) as u32, 512)) {
        Some(r) => r,
        None => return false,
    };
    if let Some(pos) = readback.iter().position(|&b| b != 0xFF) {
        sink.log(format!("metadata window not blank at offset {:#06x}", pos));
        sink.finished(false);
        return false;
    }

    sink.log("NOR metadata window reset");
    sink.progress(100);
    sink.finished(true);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{channel, Event};
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn reset_succeeds_when_window_reads_blank() {
        let mut transport = MockTransport::new();
        // enter_write_mode (4) + set_flash_mapping identity (32)
        transport.push_response(&[0xAA; 4 + 32]);
        // unlock_ppb: set_flash_mapping(32) + 3 unlock writes + 2 writes + 1 poll write + poll read(2+2) + 3 exit writes
        transport.push_response(&[0xAA; 32 + 3 + 2 + 1]);
        transport.push_response(&[0, 0, 0x80, 0x00]);
        transport.push_response(&[0xAA; 3]);
        // cfi_query: write(1) + read(2+20) + write(1), sector_size=64KiB so 2MiB/64KiB=32 sectors
        transport.push_response(&[0xAA]);
        let mut cfi = vec![0u8; 20];
        cfi[16..18].copy_from_slice(&((64 * 1024u32 / 256) as u16).to_le_bytes());
        transport.push_response(&[0, 0]);
        transport.push_response(&cfi);
        transport.push_response(&[0xAA]);
        // 32 sectors, each erase_sector: 6 unlock writes + poll read(2+2) blank immediately
        for _ in 0..32 {
            transport.push_response(&[0xAA; 6]);
            transport.push_response(&[0, 0, 0xFF, 0xFF]);
        }
        // final readback: 512 bytes of 0xFF + 2 header bytes
        transport.push_response(&[0, 0]);
        transport.push_response(&[0xFFu8; 512]);

        let cancel = AtomicBool::new(false);
        let (tx, rx) = channel();
        let sink = EventSink::new("mock0".to_string(), tx);
        assert!(run(&mut transport, &cancel, &sink));
        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events.last(), Some(Event::Finished { ok: true, .. })));
    }

    #[test]
    fn cancelling_before_start_reports_failure() {
        let mut transport = MockTransport::new();
        let cancel = AtomicBool::new(true);
        let (tx, rx) = channel();
        let sink = EventSink::new("mock0".to_string(), tx);
        assert!(!run(&mut transport, &cancel, &sink));
        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events.last(), Some(Event::Finished { ok: false, .. })));
    }
}
