//! QA plan: a configurable suite of independent test steps run against
//! fresh hardware.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::QaConfig;
use crate::error::ChisError;
use crate::events::EventSink;
use crate::flash::{erase_chip, erase_sector, erase_time_estimate, fast_qa_regions, unlock_ppb};
use crate::protocol::{cfi_query, read_ram, read_rom, read_rom_id, set_mode, sram_bank_select, write_ram, ModeFlags};
use crate::transport::Transport;

use super::{bail_if_cancelled, progress_completed, progress_entering, CancelFlag};

const SRAM_TEST_PATTERN: [u8; 4] = [0xAA, 0x55, 0x12, 0x34];
const SRAM_FULL_SIZE: u32 = 128 * 1024;
const SRAM_CHUNK: u32 = 1024;
const SRAM_BANK_SIZE: u32 = 64 * 1024;

/// Runs the enabled QA steps against `transport` in a fixed order, emitting
/// `Log`/`Progress` events and finally `Finished`. Returns `true` on pass.
pub fn run(transport: &mut dyn Transport, cancel: &CancelFlag, sink: &EventSink, config: &QaConfig) -> bool {
    let total = config.enabled_step_count();
    if total == 0 {
        sink.log("no QA steps enabled");
        sink.finished(false);
        return false;
    }

    sink.log("starting QA");
    let mut k = 0usize;

    if config.sram_basic() {
        k += 1;
        sink.progress(progress_entering(k, total));
        sink.log(format!("{}/{} SRAM basic test", k, total));
        if bail_if_cancelled(cancel, sink) {
            return false;
        }
        if !super::run_step(sink, || sram_basic(transport)) {
            return false;
        }
        sink.log("SRAM basic test passed");
        sink.progress(progress_completed(k, total));
    }

    if config.sram_full() {
        k += 1;
        sink.progress(progress_entering(k, total));
        sink.log(format!("{}/{} SRAM full test (128 KiB)", k, total));
        if bail_if_cancelled(cancel, sink) {
            return false;
        }
        if !super::run_step(sink, || sram_full(transport, cancel, sink)) {
            return false;
        }
        if is_cancelled_mid_step(cancel) {
            sink.log("cancelled");
            sink.finished(false);
            return false;
        }
        sink.log("SRAM full test passed");
        sink.progress(progress_completed(k, total));
    }

    if config.ppb_unlock() {
        k += 1;
        sink.progress(progress_entering(k, total));
        sink.log(format!("{}/{} PPB unlock", k, total));
        if bail_if_cancelled(cancel, sink) {
            return false;
        }
        if !super::run_step(sink, || {
            set_mode(
                transport,
                ModeFlags {
                    sdram: false,
                    sd_enable: false,
                    write_enable: true,
                    sram_bank: 0,
                },
                0x8,
            )?;
            unlock_ppb(transport)
        }) {
            return false;
        }
        sink.log("PPB unlock complete");
        sink.progress(progress_completed(k, total));
    }

    if config.flash_erase_blank() || config.flash_fast() {
        k += 1;
        sink.progress(progress_entering(k, total));
        if !super::run_step(sink, || {
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
        }) {
            return false;
        }

        let step_ok = if config.flash_fast() {
            sink.log(format!(
                "{}/{} fast flash QA (first/last 4 MiB + 4x random 2 MiB)",
                k, total
            ));
            super::run_step(sink, || flash_fast(transport, cancel, sink))
        } else {
            sink.log(format!("{}/{} flash erase-blank check", k, total));
            super::run_step(sink, || flash_erase_blank(transport, sink))
        };
        if !step_ok {
            return false;
        }
        if config.flash_fast() && is_cancelled_mid_step(cancel) {
            sink.log("cancelled");
            sink.finished(false);
            return false;
        }
        sink.progress(progress_completed(k, total));
    }

    if config.backup_flash_probe() {
        k += 1;
        sink.progress(progress_entering(k, total));
        sink.log(format!("{}/{} backup flash probe", k, total));
        if bail_if_cancelled(cancel, sink) {
            return false;
        }
        if !super::run_step(sink, || backup_flash_probe(transport, sink)) {
            return false;
        }
        sink.progress(progress_completed(k, total));
    }

    if let Ok(id) = read_rom_id(transport) {
        sink.log(format!(
            "device ID: manufacturer={:#06x} device={:#06x},{:#06x},{:#06x}",
            id.manufacturer, id.device_id1, id.device_id2, id.device_id3
        ));
    }

    sink.log("QA complete");
    sink.finished(true);
    true
}

// Mid-step cancellation is checked at natural checkpoints (between SRAM
// banks); this flag lets the bank loop signal "stop without error" up to
// the caller without it looking like a protocol failure.
fn is_cancelled_mid_step(cancel: &CancelFlag) -> bool {
    super::is_cancelled(cancel)
}

fn sram_basic(transport: &mut dyn Transport) -> Result<(), ChisError> {
    sram_bank_select(transport, 0)?;
    write_ram(transport, 0x0000, &SRAM_TEST_PATTERN)?;
    let read_back = read_ram(transport, 0x0000, SRAM_TEST_PATTERN.len() as u16)?;
    if read_back != SRAM_TEST_PATTERN {
        return Err(ChisError::Verify {
            offset: 0,
            expected: SRAM_TEST_PATTERN[0],
            got: read_back.first().copied().unwrap_or(0),
        });
    }
    Ok(())
}

fn sram_full(transport: &mut dyn Transport, cancel: &CancelFlag, sink: &EventSink) -> Result<(), ChisError> {
    let mut offset = 0u32;
    while offset < SRAM_FULL_SIZE {
        if super::is_cancelled(cancel) {
            return Ok(());
        }
        if offset % SRAM_BANK_SIZE == 0 {
            sram_bank_select(transport, (offset / SRAM_BANK_SIZE) as u8)?;
            sink.log(format!("  switched to SRAM bank {}", offset / SRAM_BANK_SIZE));
        }

        let chunk: Vec<u8> = (0..SRAM_CHUNK).map(|i| ((offset + i) & 0xFF) as u8).collect();
        write_ram(transport, offset, &chunk)?;
        let read_back = read_ram(transport, offset, SRAM_CHUNK as u16)?;
        if read_back != chunk {
            return Err(ChisError::Verify {
                offset: offset as u64,
                expected: chunk[0],
                got: read_back.first().copied().unwrap_or(0),
            });
        }

        offset += SRAM_CHUNK;
    }
    Ok(())
}

fn flash_erase_blank(transport: &mut dyn Transport, sink: &EventSink) -> Result<(), ChisError> {
    let first = read_rom(transport, 0x000000, 512)?;
    if first.iter().all(|&b| b == 0xFF) {
        sink.log("flash already blank");
        return Ok(());
    }
    if let Ok(eta) = erase_time_estimate(transport, 1) {
        sink.log(format!("flash not blank, erasing chip (ETA {} us)", eta));
    } else {
        sink.log("flash not blank, erasing chip");
    }
    erase_chip(transport)
}

fn flash_fast(transport: &mut dyn Transport, cancel: &CancelFlag, sink: &EventSink) -> Result<(), ChisError> {
    let cfi = cfi_query(transport)?;
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);
    let regions = fast_qa_regions(cfi.device_size_bytes, cfi.sector_size_bytes, &mut rng);

    let total_sectors: u64 = regions
        .iter()
        .map(|&(start, end)| (end - start) / cfi.sector_size_bytes as u64)
        .sum();
    if let Ok(eta) = erase_time_estimate(transport, total_sectors as u32) {
        sink.log(format!("erasing {} sectors (ETA {} us)", total_sectors, eta));
    }
    let mut erased = 0u64;

    for &(start, end) in &regions {
        let sector_count = (end - start) / cfi.sector_size_bytes as u64;
        for i in 0..sector_count {
            if super::is_cancelled(cancel) {
                return Ok(());
            }
            let addr = start + i * cfi.sector_size_bytes as u64;
            erase_sector(transport, (addr >> 1) as u32)?;
            erased += 1;
            if erased % 10 == 0 {
                sink.log(format!("erased {}/{} sectors", erased, total_sectors));
            }
        }
    }

    for &(start, end) in &regions {
        let mut addr = start;
        while addr < end {
            if super::is_cancelled(cancel) {
                return Ok(());
            }
            let len = std::cmp::min(4096, end - addr) as u16;
            let data = read_rom(transport, (addr >> 1) as u32, len)?;
            if let Some(pos) = data.iter().position(|&b| b != 0xFF) {
                return Err(ChisError::Verify {
                    offset: addr + pos as u64,
                    expected: 0xFF,
                    got: data[pos],
                });
            }
            addr += len as u64;
        }
    }
    Ok(())
}

fn backup_flash_probe(transport: &mut dyn Transport, sink: &EventSink) -> Result<(), ChisError> {
    let patterns: [(u32, u8); 3] = [(0x5555, 0xAA), (0x2AAA, 0x55), (0x0000, 0x90)];
    for &(addr, value) in &patterns {
        write_ram(transport, addr, &[value])?;
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    let manufacturer = read_ram(transport, 0x0000, 2)?;
    let device_id = read_ram(transport, 0x0002, 2)?;
    write_ram(transport, 0x0000, &[0xF0])?;

    let mfr_blank = manufacturer == [0xFF, 0xFF];
    let id_blank = device_id == [0xFF, 0xFF];
    if mfr_blank || id_blank {
        return Err(ChisError::Verify {
            offset: 0,
            expected: 0x00,
            got: 0xFF,
        });
    }

    sink.log(format!(
        "backup flash probe ok (mfr {:02x?}, id {:02x?})",
        manufacturer, device_id
    ));
    Ok(())
}
