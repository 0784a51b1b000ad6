//! Swap backing for anonymous pages.
//!
//! `examples/original_source/pintos/vm/anon.c` leaves `anon_swap_in`,
//! `anon_swap_out` and `anon_destroy` as empty stubs — the distillation
//! calls this out explicitly and asks for swap behavior "by analogy": one
//! page occupies [`SECTORS_PER_PAGE`](super::constants::SECTORS_PER_PAGE)
//! consecutive sectors of a block device, a slot is either free or holds
//! exactly one page, and there is no admission control — running out of
//! slots is a fatal condition for the writer, not a recoverable one.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::constants::{SECTORS_PER_PAGE, SECTOR_SIZE};
use super::VmError;

/// A block device addressed in fixed-size sectors. The real kernel has no
/// driver for one (out of scope); [`NullBlockDevice`] is a RAM-backed stand-in
/// that still exercises every read/write path.
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> u64;
    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE as usize]);
    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE as usize]);
}

/// RAM-backed block device: `capacity_sectors` sectors of zeroed storage.
pub struct NullBlockDevice {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE as usize]>>,
}

impl NullBlockDevice {
    pub fn new(capacity_sectors: u64) -> Self {
        NullBlockDevice {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE as usize]; capacity_sectors as usize]),
        }
    }
}

impl BlockDevice for NullBlockDevice {
    fn sector_count(&self) -> u64 {
        self.sectors.lock().len() as u64
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE as usize]) {
        buf.copy_from_slice(&self.sectors.lock()[sector as usize]);
    }

    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE as usize]) {
        self.sectors.lock()[sector as usize] = *buf;
    }
}

/// Tracks which page-sized slots of the swap device are in use. Guarded by
/// its own lock, distinct from the filesystem's `fs_lock`.
pub struct SwapBitmap {
    used: Mutex<Vec<bool>>,
}

impl SwapBitmap {
    pub fn new(slot_count: usize) -> Self {
        SwapBitmap {
            used: Mutex::new(vec![false; slot_count]),
        }
    }

    /// Claims the first free slot. There is no eviction/admission control:
    /// callers that can't tolerate `SwapFull` have nowhere else to put the
    /// page, matching the original kernel's policy.
    pub fn alloc_slot(&self) -> Result<u64, VmError> {
        let mut used = self.used.lock();
        match used.iter().position(|b| !*b) {
            Some(i) => {
                used[i] = true;
                Ok(i as u64)
            }
            None => Err(VmError::SwapFull),
        }
    }

    pub fn free_slot(&self, slot: u64) {
        self.used.lock()[slot as usize] = false;
    }

    pub fn read_slot(&self, device: &dyn BlockDevice, slot: u64, page: &mut [u8]) {
        debug_assert_eq!(page.len(), 4096);
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE as usize];
            device.read_sector(slot * SECTORS_PER_PAGE + i, &mut sector);
            let start = (i * SECTOR_SIZE) as usize;
            page[start..start + SECTOR_SIZE as usize].copy_from_slice(&sector);
        }
    }

    pub fn write_slot(&self, device: &dyn BlockDevice, slot: u64, page: &[u8]) {
        debug_assert_eq!(page.len(), 4096);
        for i in 0..SECTORS_PER_PAGE {
            let start = (i * SECTOR_SIZE) as usize;
            let mut sector = [0u8; SECTOR_SIZE as usize];
            sector.copy_from_slice(&page[start..start + SECTOR_SIZE as usize]);
            device.write_sector(slot * SECTORS_PER_PAGE + i, &sector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_page_through_swap() {
        let device = NullBlockDevice::new(SECTORS_PER_PAGE * 4);
        let bitmap = SwapBitmap::new(4);

        let slot = bitmap.alloc_slot().unwrap();
        let mut page = [0u8; 4096];
        page[0] = 0xAB;
        page[4095] = 0xCD;
        bitmap.write_slot(&device, slot, &page);

        let mut readback = [0u8; 4096];
        bitmap.read_slot(&device, slot, &mut readback);
        assert_eq!(page, readback);
    }

    #[test]
    fn allocation_fails_once_full_with_no_admission_control() {
        let bitmap = SwapBitmap::new(2);
        bitmap.alloc_slot().unwrap();
        bitmap.alloc_slot().unwrap();
        assert_eq!(bitmap.alloc_slot(), Err(VmError::SwapFull));
    }

    #[test]
    fn freed_slot_can_be_reused() {
        let bitmap = SwapBitmap::new(1);
        let slot = bitmap.alloc_slot().unwrap();
        bitmap.free_slot(slot);
        assert_eq!(bitmap.alloc_slot(), Ok(slot));
    }
}
