//! Guest memory bus.
//!
//! Addresses are masked down to physical through an 8-entry region table
//! indexed by the top three address bits, then matched against the physical
//! map: RAM, BIOS ROM, the expansion-1 window (reads as all-ones) and a set
//! of hardware register windows whose writes are accepted and dropped.
//! Anything outside the map is a fatal "unhandled access" condition.
//!
//! The bus also keeps a queue of masked write addresses. The driver drains
//! it before every block dispatch so the translation cache can drop blocks
//! whose guest bytes were overwritten.

use std::path::Path;

use log::debug;
use thiserror::Error;

/// Main RAM size: 2 MiB.
pub const RAM_SIZE: usize = 0x20_0000;
/// BIOS ROM size: 512 KiB.
pub const BIOS_SIZE: usize = 0x8_0000;
/// Physical base of the BIOS ROM.
pub const BIOS_START: u32 = 0x1fc0_0000;
/// Physical base of the expansion-1 region.
pub const EXPANSION1_START: u32 = 0x1f00_0000;
/// Expansion-1 region size.
pub const EXPANSION1_SIZE: u32 = 0x8_0000;

/// Per-region address masks, indexed by the top 3 address bits. KSEG0 and
/// KSEG1 fold onto physical; KUSEG and KSEG2 map through unchanged.
const REGION_MASK: [u32; 8] = [
    0xffff_ffff,
    0xffff_ffff,
    0xffff_ffff,
    0xffff_ffff,
    0x7fff_ffff,
    0x1fff_ffff,
    0xffff_ffff,
    0xffff_ffff,
];

/// Fold a guest address down to its physical address.
pub fn mask_region(addr: u32) -> u32 {
    addr & REGION_MASK[(addr >> 29) as usize]
}

/// Hardware register windows whose writes are accepted and discarded.
fn ignored_write(addr: u32) -> Option<&'static str> {
    match addr {
        0x1f80_1000..=0x1f80_1020 => Some("memory control"),
        0x1f80_1060 => Some("ram size"),
        0x1f80_1100..=0x1f80_112f => Some("timers"),
        0x1f80_1c00..=0x1f80_1fff => Some("spu"),
        0xfffe_0130 => Some("cache control"),
        0x1f80_2041 => Some("expansion 2 post"),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("couldn't read bios image: {0}")]
    Io(#[from] std::io::Error),
    #[error("bios is incorrect size ({0:#x} bytes)")]
    BiosSize(usize),
}

/// The memory bus: RAM, BIOS ROM and the write-notice queue.
pub struct Bus {
    ram: Box<[u8]>,
    bios: Box<[u8]>,
    written: Vec<u32>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            ram: vec![0; RAM_SIZE].into_boxed_slice(),
            bios: vec![0; BIOS_SIZE].into_boxed_slice(),
            written: Vec::new(),
        }
    }

    /// Load the BIOS ROM from a file.
    pub fn load_bios<P: AsRef<Path>>(&mut self, path: P) -> Result<(), BusError> {
        let image = std::fs::read(path)?;
        self.load_bios_image(&image)
    }

    /// Load the BIOS ROM from an in-memory image. The image must fill the
    /// whole ROM.
    pub fn load_bios_image(&mut self, image: &[u8]) -> Result<(), BusError> {
        if image.len() < BIOS_SIZE {
            return Err(BusError::BiosSize(image.len()));
        }
        self.bios.copy_from_slice(&image[..BIOS_SIZE]);
        Ok(())
    }

    /// Take the queued physical addresses of every write since the last
    /// drain.
    pub fn take_written(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.written)
    }

    fn read(&self, addr: u32, len: u32) -> u32 {
        let phys = mask_region(addr);
        if let Some(offset) = region_offset(phys, 0, RAM_SIZE, len) {
            return read_le(&self.ram, offset, len);
        }
        if let Some(offset) = region_offset(phys, BIOS_START, BIOS_SIZE, len) {
            return read_le(&self.bios, offset, len);
        }
        if region_offset(phys, EXPANSION1_START, EXPANSION1_SIZE as usize, len).is_some() {
            // Nothing connected: open bus reads as all-ones.
            return match len {
                1 => 0xff,
                2 => 0xffff,
                _ => 0xffff_ffff,
            };
        }
        panic!("unhandled {}-byte read at {addr:#010x}", len);
    }

    fn write(&mut self, addr: u32, value: u32, len: u32) {
        let phys = mask_region(addr);
        self.written.push(phys);
        if let Some(offset) = region_offset(phys, 0, RAM_SIZE, len) {
            write_le(&mut self.ram, offset, value, len);
            return;
        }
        if let Some(what) = ignored_write(phys) {
            debug!("ignored {len}-byte write to {what} register {addr:#010x}");
            return;
        }
        panic!("unhandled {}-byte write of {value:#010x} at {addr:#010x}", len);
    }

    pub fn read8(&self, addr: u32) -> u8 {
        self.read(addr, 1) as u8
    }

    pub fn read16(&self, addr: u32) -> u16 {
        self.read(addr, 2) as u16
    }

    pub fn read32(&self, addr: u32) -> u32 {
        self.read(addr, 4)
    }

    pub fn write8(&mut self, addr: u32, value: u8) {
        self.write(addr, value as u32, 1);
    }

    pub fn write16(&mut self, addr: u32, value: u16) {
        self.write(addr, value as u32, 2);
    }

    pub fn write32(&mut self, addr: u32, value: u32) {
        self.write(addr, value, 4);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset of a `len`-byte access into the region at `base`, or `None` when
/// any byte of the access falls outside it.
fn region_offset(phys: u32, base: u32, size: usize, len: u32) -> Option<usize> {
    let offset = phys.wrapping_sub(base) as usize;
    (offset + len as usize <= size).then_some(offset)
}

fn read_le(buf: &[u8], offset: usize, len: u32) -> u32 {
    match len {
        1 => buf[offset] as u32,
        2 => u16::from_le_bytes([buf[offset], buf[offset + 1]]) as u32,
        _ => u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]),
    }
}

fn write_le(buf: &mut [u8], offset: usize, value: u32, len: u32) {
    match len {
        1 => buf[offset] = value as u8,
        2 => buf[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        _ => buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_masking() {
        // KUSEG is identity.
        assert_eq!(mask_region(0x0001_0000), 0x0001_0000);
        // KSEG0 drops the top bit.
        assert_eq!(mask_region(0x8001_0000), 0x0001_0000);
        // KSEG1 drops the top three bits.
        assert_eq!(mask_region(0xa001_0000), 0x0001_0000);
        assert_eq!(mask_region(0xbfc0_0000), 0x1fc0_0000);
        // KSEG2 is identity.
        assert_eq!(mask_region(0xfffe_0130), 0xfffe_0130);
    }

    #[test]
    fn test_ram_round_trip_through_all_mirrors() {
        let mut bus = Bus::new();
        bus.write32(0x0000_1000, 0xdead_beef);
        assert_eq!(bus.read32(0x0000_1000), 0xdead_beef);
        assert_eq!(bus.read32(0x8000_1000), 0xdead_beef);
        assert_eq!(bus.read32(0xa000_1000), 0xdead_beef);
        assert_eq!(bus.read16(0x0000_1000), 0xbeef);
        assert_eq!(bus.read8(0x0000_1003), 0xde);
    }

    #[test]
    fn test_bios_reads() {
        let mut bus = Bus::new();
        let mut image = vec![0u8; BIOS_SIZE];
        image[..4].copy_from_slice(&0x3c08_1234u32.to_le_bytes());
        bus.load_bios_image(&image).unwrap();
        assert_eq!(bus.read32(0xbfc0_0000), 0x3c08_1234);
        assert_eq!(bus.read32(0x9fc0_0000), 0x3c08_1234);
        assert_eq!(bus.read8(0xbfc0_0003), 0x3c);
    }

    #[test]
    fn test_short_bios_rejected() {
        let mut bus = Bus::new();
        let err = bus.load_bios_image(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, BusError::BiosSize(16)));
    }

    #[test]
    fn test_expansion1_reads_open_bus() {
        let bus = Bus::new();
        assert_eq!(bus.read32(0x1f00_0000), 0xffff_ffff);
        assert_eq!(bus.read8(0x1f00_0084), 0xff);
    }

    #[test]
    fn test_ignored_write_windows() {
        let mut bus = Bus::new();
        bus.write32(0x1f80_1000, 0x1f00_0000); // memory control
        bus.write32(0x1f80_1060, 0x0000_0b88); // ram size
        bus.write16(0x1f80_1c00, 0); // spu
        bus.write32(0xfffe_0130, 0x0001_e988); // cache control
        bus.write8(0x1f80_2041, 0x01); // post
    }

    #[test]
    fn test_write_notices_are_masked_and_drained() {
        let mut bus = Bus::new();
        bus.write32(0x8000_1000, 1);
        bus.write8(0xa000_2000, 2);
        assert_eq!(bus.take_written(), vec![0x0000_1000, 0x0000_2000]);
        assert!(bus.take_written().is_empty());
    }

    #[test]
    #[should_panic(expected = "unhandled 4-byte read")]
    fn test_unmapped_read_is_fatal() {
        let bus = Bus::new();
        bus.read32(0x1f80_1070);
    }

    #[test]
    #[should_panic(expected = "unhandled 4-byte read")]
    fn test_read_straddling_ram_end_is_fatal() {
        let bus = Bus::new();
        bus.read32(RAM_SIZE as u32 - 2);
    }

    #[test]
    #[should_panic(expected = "unhandled 2-byte read")]
    fn test_read_straddling_bios_end_is_fatal() {
        let bus = Bus::new();
        bus.read16(0xbfc8_0000 - 1);
    }

    #[test]
    #[should_panic(expected = "unhandled 4-byte write")]
    fn test_write_straddling_ram_end_is_fatal() {
        let mut bus = Bus::new();
        bus.write32(RAM_SIZE as u32 - 1, 0);
    }

    #[test]
    fn test_full_width_access_at_region_edges() {
        let mut bus = Bus::new();
        bus.write32(RAM_SIZE as u32 - 4, 0x0102_0304);
        assert_eq!(bus.read32(RAM_SIZE as u32 - 4), 0x0102_0304);
        assert_eq!(bus.read32(0xbfc8_0000 - 4), 0);
    }

    #[test]
    #[should_panic(expected = "unhandled 4-byte write")]
    fn test_unmapped_write_is_fatal() {
        let mut bus = Bus::new();
        bus.write32(0x1f80_1074, 0xffff_ffff);
    }
}
