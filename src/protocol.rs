//! Fixed opcode table and body layout for the SuperChis wire protocol.
//! Every function here issues exactly one command frame and interprets
//! exactly one response; sequencing (magic unlock order, erase poll loops,
//! ...) lives in `flash`.

use crate::error::ChisError;
use crate::frame::{read_command, write_command};
use crate::transport::Transport;

pub const OP_PROGRAM_ROM: u8 = 0xF4;
pub const OP_WRITE_ROM: u8 = 0xF5;
pub const OP_READ_ROM: u8 = 0xF6;
pub const OP_WRITE_RAM: u8 = 0xF7;
pub const OP_READ_RAM: u8 = 0xF8;

/// Acknowledgement byte that means "success" for `programRom`. Every other
/// write opcode's ack is read for flow control only and never checked.
pub const PROGRAM_ROM_SUCCESS_ACK: u8 = 0xAA;

/// `MAGIC_ADDRESS` is a byte address; the driver always uses its word form.
pub const MAGIC_ADDRESS: u32 = 0x01FF_FFFE;
pub const MAGIC_MODE_VALUE: u16 = 0xA55A;
pub const MAGIC_MAP_VALUE: u16 = 0xA558;

fn magic_word_address() -> u32 {
    MAGIC_ADDRESS >> 1
}

/// `0xF4 programRom`: byte-addressed buffered program.
///
/// Returns `true` iff the device acknowledged with `0xAA`.
pub fn program_rom(
    transport: &mut dyn Transport,
    addr_byte: u32,
    buffer_write_bytes: u16,
    data: &[u8],
) -> Result<bool, ChisError> {
    let mut body = Vec::with_capacity(4 + 2 + data.len());
    body.extend_from_slice(&addr_byte.to_le_bytes());
    body.extend_from_slice(&buffer_write_bytes.to_le_bytes());
    body.extend_from_slice(data);

    let ack = write_command(transport, OP_PROGRAM_ROM, &body)?;
    Ok(ack == PROGRAM_ROM_SUCCESS_ACK)
}

/// `0xF5 writeRom`: word-addressed write. The ack byte is read for flow
/// control only; any value is treated as success.
pub fn write_rom(transport: &mut dyn Transport, addr_word: u32, data: &[u8]) -> Result<u8, ChisError> {
    let mut body = Vec::with_capacity(4 + data.len());
    body.extend_from_slice(&addr_word.to_le_bytes());
    body.extend_from_slice(data);
    write_command(transport, OP_WRITE_ROM, &body)
}

/// Convenience over `write_rom` for the common case of a single 16-bit word.
pub fn write_rom_u16(transport: &mut dyn Transport, addr_word: u32, value: u16) -> Result<u8, ChisError> {
    write_rom(transport, addr_word, &value.to_le_bytes())
}

/// `0xF6 readRom`: word-addressed read. `addr_word` is shifted left by one
/// to form the byte-address field the wire protocol actually carries.
pub fn read_rom(transport: &mut dyn Transport, addr_word: u32, length: u16) -> Result<Vec<u8>, ChisError> {
    let addr_byte = addr_word << 1;
    let mut body = Vec::with_capacity(6);
    body.extend_from_slice(&addr_byte.to_le_bytes());
    body.extend_from_slice(&length.to_le_bytes());
    read_command(transport, OP_READ_ROM, &body, length as usize)
}

/// `0xF7 writeRam`: byte-addressed write.
pub fn write_ram(transport: &mut dyn Transport, addr: u32, data: &[u8]) -> Result<u8, ChisError> {
    let mut body = Vec::with_capacity(4 + data.len());
    body.extend_from_slice(&addr.to_le_bytes());
    body.extend_from_slice(data);
    write_command(transport, OP_WRITE_RAM, &body)
}

/// `0xF8 readRam`: byte-addressed read.
pub fn read_ram(transport: &mut dyn Transport, addr: u32, length: u16) -> Result<Vec<u8>, ChisError> {
    let mut body = Vec::with_capacity(6);
    body.extend_from_slice(&addr.to_le_bytes());
    body.extend_from_slice(&length.to_le_bytes());
    read_command(transport, OP_READ_RAM, &body, length as usize)
}

/// Mode flags accepted by [`set_mode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeFlags {
    pub sdram: bool,
    pub sd_enable: bool,
    pub write_enable: bool,
    pub sram_bank: u8,
}

/// The "SuperChis unlock" sequence: writes `0xA55A` twice then the computed
/// config word twice, all to the magic word address.
pub fn set_mode(transport: &mut dyn Transport, flags: ModeFlags, ctrl: u8) -> Result<(), ChisError> {
    let addr = magic_word_address();
    let config = (ctrl as u16) << 4
        | (flags.sdram as u16)
        | (flags.sd_enable as u16) << 1
        | (flags.write_enable as u16) << 2
        | (flags.sram_bank as u16) << 3;

    write_rom_u16(transport, addr, MAGIC_MODE_VALUE)?;
    write_rom_u16(transport, addr, MAGIC_MODE_VALUE)?;
    write_rom_u16(transport, addr, config)?;
    write_rom_u16(transport, addr, config)?;
    Ok(())
}

/// Same as `set_mode` with the device's default `ctrl = 0x8`.
pub fn set_mode_default_ctrl(transport: &mut dyn Transport, flags: ModeFlags) -> Result<(), ChisError> {
    set_mode(transport, flags, 0x8)
}

/// An 8-entry segment mapping table: each entry names a 4 MiB physical bank
/// to expose in the next 32 MiB logical window.
pub type FlashMapping = [u8; 8];

/// The "Flash mapping set" sequence: for each of 8 entries, writes `0xA558`
/// twice then the entry twice, to the magic word address.
pub fn set_flash_mapping(transport: &mut dyn Transport, mapping: &FlashMapping) -> Result<(), ChisError> {
    let addr = magic_word_address();
    for &entry in mapping.iter() {
        write_rom_u16(transport, addr, MAGIC_MAP_VALUE)?;
        write_rom_u16(transport, addr, MAGIC_MAP_VALUE)?;
        write_rom_u16(transport, addr, entry as u16)?;
        write_rom_u16(transport, addr, entry as u16)?;
    }
    Ok(())
}

/// Builds the identity mapping `[seg*8, seg*8+1, ..., seg*8+7]` for segment
/// `seg`.
pub fn identity_mapping_for_segment(seg: u8) -> FlashMapping {
    let base = seg.wrapping_mul(8);
    let mut mapping = [0u8; 8];
    for (i, slot) in mapping.iter_mut().enumerate() {
        *slot = base.wrapping_add(i as u8);
    }
    mapping
}

/// SRAM bank select: writes the bank index to word `0x800000`, then issues
/// a mode-set with `ctrl = 0xF ^ (1<<3)`.
pub fn sram_bank_select(transport: &mut dyn Transport, bank: u8) -> Result<(), ChisError> {
    write_rom_u16(transport, 0x800000, bank as u16)?;
    set_mode(
        transport,
        ModeFlags {
            sdram: false,
            sd_enable: false,
            write_enable: false,
            sram_bank: bank,
        },
        0xF ^ (1 << 3),
    )
}

/// Parsed CFI (Common Flash Interface) geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfiInfo {
    pub device_size_bytes: u64,
    pub sector_count: u32,
    pub sector_size_bytes: u32,
    pub buffer_write_bytes: u32,
}

/// `0x98` CFI query: 20 bytes at word `0x27`, interpreted as ten
/// little-endian 16-bit values.
pub fn cfi_query(transport: &mut dyn Transport) -> Result<CfiInfo, ChisError> {
    write_rom_u16(transport, 0x55, 0x98)?;
    let raw = read_rom(transport, 0x27, 20)?;
    write_rom_u16(transport, 0x00, 0xF0)?;

    let v = |i: usize| u16::from_le_bytes([raw[2 * i], raw[2 * i + 1]]);

    let device_size_bytes = 1u64 << v(0);
    let buffer_write_bytes = if v(3) != 0 { 1u32 << v(3) } else { 0 };
    let sector_count = (((v(7) & 0xFF) << 8) | (v(6) & 0xFF)) as u32 + 1;
    let sector_size_bytes = ((((v(9) & 0xFF) << 8) | (v(8) & 0xFF)) as u32) * 256;

    Ok(CfiInfo {
        device_size_bytes,
        sector_count,
        sector_size_bytes,
        buffer_write_bytes,
    })
}

/// Timeout fields from the same CFI structure, read at word `0x1F` instead
/// of `0x27` (supplemented from `device_adapter.py`'s `getRomEraseTime`).
pub fn cfi_timeouts(transport: &mut dyn Transport) -> Result<(u32, u32), ChisError> {
    write_rom_u16(transport, 0x55, 0x98)?;
    let raw = read_rom(transport, 0x1F, 20)?;
    write_rom_u16(transport, 0x00, 0xF0)?;

    let v = |i: usize| u16::from_le_bytes([raw[2 * i], raw[2 * i + 1]]);
    let timeout_block_us = 1u32 << v(2);
    let timeout_chip_us = 1u32 << v(3);
    Ok((timeout_block_us, timeout_chip_us))
}

/// The ROM-ID read sequence (supplemented from `device_adapter.py`'s
/// `readRomID`): enters autoselect mode, reads manufacturer/device fields,
/// exits. Opportunistically logged by the QA plan's closing summary; no
/// job plan's control flow depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomId {
    pub manufacturer: u16,
    pub device_id1: u16,
    pub device_id2: u16,
    pub device_id3: u16,
}

pub fn read_rom_id(transport: &mut dyn Transport) -> Result<RomId, ChisError> {
    write_rom_u16(transport, 0x000555, 0xAA)?;
    write_rom_u16(transport, 0x0002AA, 0x55)?;
    write_rom_u16(transport, 0x000555, 0x90)?;

    let read_u16 = |t: &mut dyn Transport, addr: u32| -> Result<u16, ChisError> {
        let bytes = read_rom(t, addr, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    };

    let manufacturer = read_u16(transport, 0x00)?;
    let device_id1 = read_u16(transport, 0x01)?;
    let device_id2 = read_u16(transport, 0x0E)?;
    let device_id3 = read_u16(transport, 0x0F)?;

    write_rom_u16(transport, 0x000000, 0xF0)?;

    Ok(RomId {
        manufacturer,
        device_id1,
        device_id2,
        device_id3,
    })
}
