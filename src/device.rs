//! The block device contract. Per §1, the raw driver is an external
//! collaborator: production code implements [`BlockDevice`] against real
//! hardware, and this crate only depends on the trait. The
//! [`MemBlockDevice`] test double is what every test in this crate and
//! `tests/` runs against.

use crate::config::SECTOR_SIZE;
use std::sync::Mutex;

/// Synchronous read/write of fixed-size sectors. Implementations are
/// expected to block the caller until the transfer completes, matching the
/// "synchronous `read`/`write`" contract; they must not panic on in-range
/// sector numbers.
pub trait BlockDevice: Send + Sync {
    /// Total number of sectors this device exposes.
    fn sector_count(&self) -> u32;

    /// Read exactly `SECTOR_SIZE` bytes from `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);

    /// Write exactly `SECTOR_SIZE` bytes from `buf` to `sector`.
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
}

/// An in-memory block device used by tests in place of a real disk or swap
/// partition.
pub struct MemBlockDevice {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemBlockDevice {
    pub fn new(sector_count: u32) -> Self {
        MemBlockDevice {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[sector as usize]);
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock().unwrap();
        sectors[sector as usize].copy_from_slice(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_round_trips() {
        let dev = MemBlockDevice::new(4);
        let mut pattern = [0u8; SECTOR_SIZE];
        pattern.iter_mut().for_each(|b| *b = 0xAB);
        dev.write(2, &pattern);
        let mut out = [0u8; SECTOR_SIZE];
        dev.read(2, &mut out);
        assert_eq!(out, pattern);
    }

    #[test]
    fn fresh_device_reads_zero() {
        let dev = MemBlockDevice::new(1);
        let mut out = [0xFFu8; SECTOR_SIZE];
        dev.read(0, &mut out);
        assert_eq!(out, [0u8; SECTOR_SIZE]);
    }
}
