//! End-to-end coverage of the concrete scenarios a device worker can hit,
//! driven against the in-memory transport double rather than hardware.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use chisprog::events::{channel, Event};
use chisprog::plan::{backup, production, qa, reset_nor};
use chisprog::protocol::{MAGIC_ADDRESS, MAGIC_MAP_VALUE, OP_WRITE_ROM};
use chisprog::transport::mock::MockTransport;
use chisprog::transport::Transport;
use chisprog::{EventSink, QaConfig};

fn ack(n: usize) -> Vec<u8> {
    vec![0xAA; n]
}

fn push_cfi(transport: &mut MockTransport, device_size_bytes: u64, buffer_write_bytes: u32, sector_size: u32) {
    let log2 = |n: u64| (63 - n.leading_zeros()) as u16;
    let mut cfi = vec![0u8; 20];
    cfi[0..2].copy_from_slice(&log2(device_size_bytes.max(1)).to_le_bytes());
    cfi[6..8].copy_from_slice(&log2(buffer_write_bytes.max(1) as u64).to_le_bytes());
    let units = (sector_size / 256) as u16;
    cfi[16..18].copy_from_slice(&units.to_le_bytes());
    transport.push_response(&ack(1));
    transport.push_response(&[0, 0]);
    transport.push_response(&cfi);
    transport.push_response(&ack(1));
}

/// Walks `written`'s frame stream (length-prefixed, opcode at offset 2),
/// picks out `writeRom` frames addressed at the magic word, and counts how
/// many complete 8-entry mapping-set sequences program `seg`'s identity
/// mapping — i.e. how many times the wire was retuned onto that segment.
fn count_mapping_switches_to_segment(written: &[u8], seg: u8) -> usize {
    let magic_word_addr = MAGIC_ADDRESS >> 1;
    let mut magic_values = Vec::new();

    let mut i = 0;
    while i + 2 <= written.len() {
        let size = u16::from_le_bytes([written[i], written[i + 1]]) as usize;
        if size < 5 || i + size > written.len() {
            break;
        }
        let opcode = written[i + 2];
        let body = &written[i + 3..i + size - 2];
        if opcode == OP_WRITE_ROM && body.len() >= 6 {
            let addr_word = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            if addr_word == magic_word_addr {
                magic_values.push(u16::from_le_bytes([body[4], body[5]]));
            }
        }
        i += size;
    }

    let target_entry = (seg as u16) * 8;
    magic_values
        .chunks_exact(4)
        .filter(|group| group[0] == MAGIC_MAP_VALUE && group[1] == MAGIC_MAP_VALUE && group[2] == target_entry)
        .count()
}

/// A `Transport` that flips a shared cancel flag once a fixed number of
/// `write_all` calls have gone by, letting a test trigger cancellation at
/// an exact point mid-plan instead of racing a background thread.
struct CancelAfterWrites<'a> {
    inner: MockTransport,
    remaining: u32,
    cancel: &'a AtomicBool,
}

impl<'a> Transport for CancelAfterWrites<'a> {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.remaining == 0 {
            self.cancel.store(true, Ordering::Relaxed);
        } else {
            self.remaining -= 1;
        }
        self.inner.write_all(buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)
    }
}

#[test]
fn qa_with_two_steps_emits_quarter_progress_sequence() {
    // scenario 1: sram_basic + ppb_unlock only -> 2 steps, 25/50/75/100
    let mut transport = MockTransport::new();

    // sram_basic: sram_bank_select(0) = 5 acks, writeRam(1 ack), readRam(2+4 bytes)
    transport.push_response(&ack(5));
    transport.push_response(&ack(1));
    transport.push_response(&[0, 0]);
    transport.push_response(&[0xAA, 0x55, 0x12, 0x34]);

    // ppb_unlock: set_mode(4) + set_flash_mapping(32) + 3 unlock + 2 writes +
    // 1 poll write + poll read(4) + 3 exit writes
    transport.push_response(&ack(4 + 32 + 3 + 2 + 1));
    transport.push_response(&[0, 0, 0x80, 0x00]);
    transport.push_response(&ack(3));

    let mut cfg = QaConfig::new();
    cfg.set_sram_basic(true);
    cfg.set_ppb_unlock(true);

    let cancel = AtomicBool::new(false);
    let (tx, rx) = channel();
    let sink = EventSink::new("com3".to_string(), tx);
    assert!(qa::run(&mut transport, &cancel, &sink, &cfg));

    let progress: Vec<u8> = rx
        .try_iter()
        .filter_map(|e| match e {
            Event::Progress { pct, .. } => Some(pct),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![25, 50, 75, 100]);
}

#[test]
fn backup_of_eight_mebibytes_emits_spec_progress_sequence() {
    // scenario 5: 8 MiB backup, 2048 4 KiB reads, progress 12/25/37/50/62/75/87/100
    let mut transport = MockTransport::new();
    let device_size = 8 * 1024 * 1024u64;

    // enter_read_mode (4) + reset_identity (32)
    transport.push_response(&ack(4 + 32));
    // cfi_query reporting device_size exactly 8 MiB
    transport.push_response(&ack(1));
    let mut cfi = vec![0u8; 20];
    let log2 = |n: u64| (63 - n.leading_zeros()) as u16;
    cfi[0..2].copy_from_slice(&log2(device_size).to_le_bytes());
    transport.push_response(&[0, 0]);
    transport.push_response(&cfi);
    transport.push_response(&ack(1));

    // retune first touch (32), then 2048 reads of 4 KiB (header 2 + payload 4096)
    transport.push_response(&ack(32));
    for _ in 0..2048 {
        transport.push_response(&[0, 0]);
        transport.push_response(&vec![0u8; 4096]);
    }

    let cancel = AtomicBool::new(false);
    let (tx, rx) = channel();
    let sink = EventSink::new("com3".to_string(), tx);
    let mut out = Vec::new();
    assert!(backup::run(&mut transport, &cancel, &sink, device_size, &mut out));
    assert_eq!(out.len(), device_size as usize);

    let progress: Vec<u8> = rx
        .try_iter()
        .filter_map(|e| match e {
            Event::Progress { pct, .. } => Some(pct),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![12, 25, 37, 50, 62, 75, 87, 100]);
}

#[test]
fn reset_nor_reports_failure_when_window_stays_non_blank() {
    // scenario 4, failure branch: post-erase readback is not all 0xFF.
    let mut transport = MockTransport::new();
    transport.push_response(&ack(4 + 32));
    transport.push_response(&ack(32 + 3 + 2 + 1));
    transport.push_response(&[0, 0, 0x80, 0x00]);
    transport.push_response(&ack(3));

    transport.push_response(&ack(1));
    let mut cfi = vec![0u8; 20];
    cfi[16..18].copy_from_slice(&((64 * 1024u32 / 256) as u16).to_le_bytes());
    transport.push_response(&[0, 0]);
    transport.push_response(&cfi);
    transport.push_response(&ack(1));

    for _ in 0..32 {
        transport.push_response(&ack(6));
        transport.push_response(&[0, 0, 0xFF, 0xFF]);
    }

    transport.push_response(&[0, 0]);
    let mut readback = vec![0xFFu8; 512];
    readback[100] = 0x00;
    transport.push_response(&readback);

    let cancel = AtomicBool::new(false);
    let (tx, rx) = channel();
    let sink = EventSink::new("com3".to_string(), tx);
    assert!(!reset_nor::run(&mut transport, &cancel, &sink));
    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(events.last(), Some(Event::Finished { ok: false, .. })));
}

#[test]
fn cancelling_before_backup_starts_reports_failure_without_touching_wire() {
    let mut transport = MockTransport::new();
    let cancel = AtomicBool::new(true);
    let (tx, rx) = channel();
    let sink = EventSink::new("com3".to_string(), tx);
    let mut out = Vec::new();

    assert!(!backup::run(&mut transport, &cancel, &sink, 64 * 1024, &mut out));
    assert!(out.is_empty());
    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(events.last(), Some(Event::Finished { ok: false, .. })));
}

#[test]
fn crossing_32_mebibyte_boundary_switches_mapping_exactly_three_times() {
    // scenario 3: an image straddling the 32 MiB segment boundary by one
    // program chunk. Expect exactly one retune onto segment 1 in each of
    // erase, program, and verify, with identity restored between phases.
    const SEGMENT: u64 = 0x0200_0000;
    const SECTOR_SIZE: u32 = 4 * 1024 * 1024; // keeps CFI's 16-bit sector-size field exact
    const PROGRAM_CHUNK: usize = 2048;
    const VERIFY_CHUNK: usize = 4096;

    let image_len = SEGMENT as usize + PROGRAM_CHUNK;
    let image: Vec<u8> = (0..image_len).map(|i| (i % 256) as u8).collect();

    let mut transport = MockTransport::new();

    // enter_write_mode (4) + reset_identity (32)
    transport.push_response(&ack(4 + 32));
    push_cfi(&mut transport, 64 * 1024 * 1024, 2048, SECTOR_SIZE);

    let sector_count = ((image_len as u64 - 1) / SECTOR_SIZE as u64) + 1;
    for i in 0..sector_count {
        let addr = i * SECTOR_SIZE as u64;
        if addr != 0 && addr % SEGMENT == 0 {
            transport.push_response(&ack(32)); // retune crosses into segment 1
        }
        transport.push_response(&ack(6));
        transport.push_response(&[0, 0, 0xFF, 0xFF]); // blank on first poll
    }

    // re-enter write mode (4) + reset_identity (32), unconditional
    transport.push_response(&ack(4 + 32));

    let mut written = 0u64;
    while (written as usize) < image_len {
        if written != 0 && written % SEGMENT == 0 {
            transport.push_response(&ack(32));
        }
        transport.push_response(&ack(1)); // programRom ack
        written += PROGRAM_CHUNK as u64;
    }

    // verify phase: reset_identity (32, unconditional), then 4 KiB chunks
    transport.push_response(&ack(32));
    let mut verified = 0u64;
    while (verified as usize) < image_len {
        if verified != 0 && verified % SEGMENT == 0 {
            transport.push_response(&ack(32));
        }
        let chunk_len = std::cmp::min(VERIFY_CHUNK, image_len - verified as usize);
        transport.push_response(&[0, 0]);
        transport.push_response(&image[verified as usize..verified as usize + chunk_len]);
        verified += chunk_len as u64;
    }

    let cancel = AtomicBool::new(false);
    let (tx, rx) = channel();
    let sink = EventSink::new("com3".to_string(), tx);
    assert!(production::run(&mut transport, &cancel, &sink, &image));
    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(events.last(), Some(Event::Finished { ok: true, .. })));

    assert_eq!(count_mapping_switches_to_segment(&transport.written, 1), 3);
}

#[test]
fn cancelling_mid_erase_stops_before_the_next_sector() {
    let image = vec![0u8; 5000];
    const SECTOR_SIZE: u32 = 2048;

    let mut transport = MockTransport::new();
    transport.push_response(&ack(4 + 32)); // enter_write_mode + reset_identity
    push_cfi(&mut transport, 8 * 1024 * 1024, 2048, SECTOR_SIZE);
    // sector 0 only: 6 unlock writes + poll read, blank immediately
    transport.push_response(&ack(6));
    transport.push_response(&[0, 0, 0xFF, 0xFF]);

    let cancel = AtomicBool::new(false);
    // 45 writes precede sector 0's final (46th) write; the cancel flag flips
    // true during that write, so sector 1's loop-top check bails before any
    // further wire traffic.
    let mut wrapped = CancelAfterWrites {
        inner: transport,
        remaining: 45,
        cancel: &cancel,
    };

    let (tx, rx) = channel();
    let sink = EventSink::new("com3".to_string(), tx);
    assert!(!production::run(&mut wrapped, &cancel, &sink, &image));
    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(events.last(), Some(Event::Finished { ok: false, .. })));
}

#[test]
fn cancelling_mid_program_stops_before_the_next_chunk() {
    let image: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    const SECTOR_SIZE: u32 = 2048;

    let mut transport = MockTransport::new();
    transport.push_response(&ack(4 + 32)); // enter_write_mode + reset_identity
    push_cfi(&mut transport, 8 * 1024 * 1024, 2048, SECTOR_SIZE);
    for _ in 0..3 {
        transport.push_response(&ack(6));
        transport.push_response(&[0, 0, 0xFF, 0xFF]);
    }
    transport.push_response(&ack(4 + 32)); // re-enter write mode + reset_identity
    transport.push_response(&ack(1)); // chunk 0's programRom ack

    let cancel = AtomicBool::new(false);
    // 96 writes precede chunk 0's (97th) programRom write; cancel flips true
    // during it, so chunk 1's loop-top check bails before programming it.
    let mut wrapped = CancelAfterWrites {
        inner: transport,
        remaining: 96,
        cancel: &cancel,
    };

    let (tx, rx) = channel();
    let sink = EventSink::new("com3".to_string(), tx);
    assert!(!production::run(&mut wrapped, &cancel, &sink, &image));
    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(events.last(), Some(Event::Finished { ok: false, .. })));
}

#[test]
fn cancelling_mid_verify_stops_before_the_next_chunk() {
    let image: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    const SECTOR_SIZE: u32 = 2048;

    let mut transport = MockTransport::new();
    transport.push_response(&ack(4 + 32)); // enter_write_mode + reset_identity
    push_cfi(&mut transport, 8 * 1024 * 1024, 2048, SECTOR_SIZE);
    for _ in 0..3 {
        transport.push_response(&ack(6));
        transport.push_response(&[0, 0, 0xFF, 0xFF]);
    }
    transport.push_response(&ack(4 + 32)); // re-enter write mode + reset_identity
    transport.push_response(&ack(3)); // 3 programRom acks, one per chunk
    transport.push_response(&ack(32)); // reset_identity before verify
    // verify chunk 0 (4096 bytes), matching the image exactly
    transport.push_response(&[0, 0]);
    transport.push_response(&image[0..4096]);

    let cancel = AtomicBool::new(false);
    // 131 writes precede verify chunk 0's (132nd) read request; cancel flips
    // true during it, so chunk 1's loop-top check bails before reading it.
    let mut wrapped = CancelAfterWrites {
        inner: transport,
        remaining: 131,
        cancel: &cancel,
    };

    let (tx, rx) = channel();
    let sink = EventSink::new("com3".to_string(), tx);
    assert!(!production::run(&mut wrapped, &cancel, &sink, &image));
    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(events.last(), Some(Event::Finished { ok: false, .. })));
}
