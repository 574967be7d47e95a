//! Production plan: erase, buffered-program, and verify a full ROM image,
//! transparently retuning the segment mapping as the image crosses 32 MiB
//! boundaries.

use crate::error::ChisError;
use crate::events::EventSink;
use crate::flash::{erase_sector, SegmentTracker};
use crate::protocol::{cfi_query, program_rom, read_rom, set_mode, ModeFlags};
use crate::transport::Transport;

use super::{bail_if_cancelled, CancelFlag};

const PROGRAM_CHUNK: usize = 2048;
const VERIFY_CHUNK: usize = 4096;

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

/// Runs the production plan against `image`, padding it to an even length
/// first. Returns `true` iff erase, program, and verify all succeeded.
///
/// A single `SegmentTracker` is threaded through every phase so the mapping
/// table is only ever reprogrammed on an actual segment change: each
/// explicit `reset_identity` primes the very tracker the following retune
/// loop consults, instead of a second tracker that has forgotten it.
pub fn run(transport: &mut dyn Transport, cancel: &CancelFlag, sink: &EventSink, image: &[u8]) -> bool {
    let mut padded = image.to_vec();
    if padded.len() % 2 != 0 {
        padded.push(0x00);
    }
    let len = padded.len();

    sink.log(format!("ROM image: {} bytes", len));
    if len == 0 {
        sink.log("empty image, nothing to program");
        sink.finished(true);
        return true;
    }

    let mut tracker = SegmentTracker::new();
    if !super::run_step(sink, || {
        enter_write_mode(transport)?;
        tracker.reset_identity(transport)
    }) {
        return false;
    }

    let cfi = match super::run_result(sink, || cfi_query(transport)) {
        Some(cfi) => cfi,
        None => return false,
    };
    sink.log(format!(
        "sector size: {} bytes, buffer write size: {} bytes",
        cfi.sector_size_bytes, cfi.buffer_write_bytes
    ));

    if bail_if_cancelled(cancel, sink) {
        return false;
    }
    if !erase_phase(transport, cancel, sink, len, cfi.sector_size_bytes, &mut tracker) {
        return false;
    }

    if !super::run_step(sink, || {
        enter_write_mode(transport)?;
        tracker.reset_identity(transport)
    }) {
        return false;
    }

    if !program_phase(transport, cancel, sink, &padded, cfi.buffer_write_bytes as u16, &mut tracker) {
        return false;
    }

    if !verify_phase(transport, cancel, sink, &padded, &mut tracker) {
        return false;
    }

    sink.log("production complete");
    sink.finished(true);
    true
}

fn erase_phase(
    transport: &mut dyn Transport,
    cancel: &CancelFlag,
    sink: &EventSink,
    image_len: usize,
    sector_size: u32,
    tracker: &mut SegmentTracker,
) -> bool {
    let sector_count = ((image_len as u64 - 1) / sector_size as u64) + 1;
    sink.log(format!("erasing {} sectors", sector_count));

    for i in 0..sector_count {
        if bail_if_cancelled(cancel, sink) {
            return false;
        }
        let addr = i * sector_size as u64;
        let local = match super::run_result(sink, || tracker.retune(transport, addr)) {
            Some(l) => l,
            None => return false,
        };
        if !super::run_step(sink, || erase_sector(transport, (local >> 1) as u32)) {
            return false;
        }

        let progress = ((i + 1) as f64 / sector_count as f64 * 50.0).floor() as u8;
        sink.progress(progress);
        if (i + 1) % 10 == 0 || i + 1 == sector_count {
            sink.log(format!("erased {}/{} sectors", i + 1, sector_count));
        }
    }
    true
}

fn program_phase(
    transport: &mut dyn Transport,
    cancel: &CancelFlag,
    sink: &EventSink,
    image: &[u8],
    buffer_write_bytes: u16,
    tracker: &mut SegmentTracker,
) -> bool {
    sink.log("writing...");
    let len = image.len();
    let mut written = 0usize;

    while written < len {
        if bail_if_cancelled(cancel, sink) {
            return false;
        }
        let local = match super::run_result(sink, || tracker.retune(transport, written as u64)) {
            Some(l) => l,
            None => return false,
        };

        let end = std::cmp::min(written + PROGRAM_CHUNK, len);
        let mut chunk = image[written..end].to_vec();
        chunk.resize(PROGRAM_CHUNK, 0xFF);

        let ack_ok = match super::run_result(sink, || program_rom(transport, local as u32, buffer_write_bytes, &chunk)) {
            Some(ok) => ok,
            None => return false,
        };
        if !ack_ok {
            sink.log(format!("programRom rejected chunk at offset {:#010x}", written));
            sink.finished(false);
            return false;
        }

        written += PROGRAM_CHUNK;
        if written % (64 * 1024) == 0 || written >= len {
            sink.log(format!(
                "written {}/{} bytes ({}%)",
                written.min(len),
                len,
                (written.min(len) * 100 / len)
            ));
        }

        let progress = 50 + (written.min(len) as f64 / len as f64 * 50.0).floor() as u8;
        sink.progress(progress.min(100));
    }
    true
}

fn verify_phase(
    transport: &mut dyn Transport,
    cancel: &CancelFlag,
    sink: &EventSink,
    image: &[u8],
    tracker: &mut SegmentTracker,
) -> bool {
    sink.log("verifying...");
    if !super::run_step(sink, || tracker.reset_identity(transport)) {
        return false;
    }

    let len = image.len();
    let mut verified = 0usize;

    while verified < len {
        if bail_if_cancelled(cancel, sink) {
            return false;
        }
        let local = match super::run_result(sink, || tracker.retune(transport, verified as u64)) {
            Some(l) => l,
            None => return false,
        };

        let chunk_len = std::cmp::min(VERIFY_CHUNK, len - verified);
        let expected = &image[verified..verified + chunk_len];
        let actual = match super::run_result(sink, || read_rom(transport, (local >> 1) as u32, chunk_len as u16)) {
            Some(a) => a,
            None => return false,
        };

        if actual != expected {
            if let Some(pos) = actual.iter().zip(expected.iter()).position(|(a, b)| a != b) {
                sink.log(format!("verify failed at offset {:#010x}", verified + pos));
                sink.finished(false);
                return false;
            }
        }

        verified += chunk_len;
        if verified % (1024 * 1024) == 0 || verified >= len {
            sink.log(format!(
                "verified {} MiB / {} MiB",
                verified / (1024 * 1024),
                len / (1024 * 1024)
            ));
        }
    }
    true
}
