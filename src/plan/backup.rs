//! Backup plan: streams the ROM contents to a caller-supplied sink. The
//! plan knows nothing about files — it writes bytes to whatever
//! `std::io::Write` it is given, leaving "write to disk" to the caller.

use std::io::Write;

use crate::error::ChisError;
use crate::events::EventSink;
use crate::flash::SegmentTracker;
use crate::protocol::{cfi_query, read_rom, set_mode, ModeFlags};
use crate::transport::Transport;

use super::{bail_if_cancelled, CancelFlag};

const READ_CHUNK: usize = 4096;
const PROGRESS_EVERY: u64 = 1024 * 1024;

fn enter_read_mode(transport: &mut dyn Transport) -> Result<(), ChisError> {
    set_mode(
        transport,
        ModeFlags {
            sdram: false,
            sd_enable: false,
            write_enable: false,
            sram_bank: 0,
        },
        0x8,
    )
}

/// Reads up to `requested_size` bytes of ROM (clamped to the device's
/// reported CFI size) and writes them to `out`. Returns `true` on success;
/// a cancellation mid-read still flushes what was read so far but is
/// reported as a failed job.
///
/// The explicit `reset_identity` below primes the same `SegmentTracker`
/// the read loop retunes from, so the first `retune` call doesn't mistake
/// a just-set mapping for a stale one.
pub fn run(
    transport: &mut dyn Transport,
    cancel: &CancelFlag,
    sink: &EventSink,
    requested_size: u64,
    out: &mut dyn Write,
) -> bool {
    sink.log("starting backup");

    let mut tracker = SegmentTracker::new();
    if bail_if_cancelled(cancel, sink) {
        return false;
    }
    if !super::run_step(sink, || {
        enter_read_mode(transport)?;
        tracker.reset_identity(transport)
    }) {
        return false;
    }

    let cfi = match super::run_result(sink, || cfi_query(transport)) {
        Some(c) => c,
        None => return false,
    };
    let size = std::cmp::min(requested_size, cfi.device_size_bytes);
    if size < requested_size {
        sink.log(format!(
            "requested {} bytes but device reports only {}; clamping",
            requested_size, cfi.device_size_bytes
        ));
    }
    sink.log(format!("reading {} bytes", size));

    let mut read = 0u64;
    let mut since_progress = 0u64;

    while read < size {
        if super::is_cancelled(cancel) {
            sink.log("cancelled mid-backup");
            sink.finished(false);
            return false;
        }

        let local = match super::run_result(sink, || tracker.retune(transport, read)) {
            Some(l) => l,
            None => return false,
        };
        let chunk_len = std::cmp::min(READ_CHUNK as u64, size - read) as u16;
        let data = match super::run_result(sink, || read_rom(transport, (local >> 1) as u32, chunk_len)) {
            Some(d) => d,
            None => return false,
        };

        if out.write_all(&data).is_err() {
            sink.log("failed writing to backup sink");
            sink.finished(false);
            return false;
        }

        read += chunk_len as u64;
        since_progress += chunk_len as u64;
        if since_progress >= PROGRESS_EVERY || read >= size {
            sink.log(format!("read {}/{} bytes", read, size));
            sink.progress(((read as f64 / size.max(1) as f64) * 100.0).floor() as u8);
            since_progress = 0;
        }
    }

    sink.log("backup complete");
    sink.finished(true);
    true
}
