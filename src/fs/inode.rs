//! On-disk inode layout and the index-tree walk/grow/shrink operations of
//! §4.5: direct/indirect/doubly-indirect sector addressing
//! (`NDIRECT`/`NINDIRECT`-style naming kept as [`crate::config::N_DIRECT`]/
//! [`crate::config::N_PER_INDIRECT`] here). Sector pointers are modeled as
//! `Option<u32>` in memory per §9's Design Notes and translated to/from the
//! on-disk all-ones sentinel only at the (de)serialization boundary.

use crate::cache::BufferCache;
use crate::config::{INODE_MAGIC, INVALID_SECTOR_RAW, N_DIRECT, N_PER_INDIRECT, SECTOR_SIZE};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use static_assertions::const_assert_eq;

/// File vs. directory, carried in the on-disk inode so `ISDIR`/`INUMBER`
/// can answer without consulting anything else, per §9 note (c).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File = 0,
    Directory = 1,
}

impl FileType {
    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(FileType::File),
            1 => Ok(FileType::Directory),
            _ => Err(Error::CorruptInode(0)),
        }
    }
}

/// Exactly one sector's worth of inode metadata, per §3/§6.
#[derive(Debug, Clone)]
pub struct OnDiskInode {
    pub length: u32,
    pub file_type: FileType,
    direct: [u32; N_DIRECT],
    indirect: u32,
    double_indirect: u32,
}

const HEADER_BYTES: usize = 4 /* length */ + 4 /* magic */ + 4 /* type */;
const POINTER_BYTES: usize = N_DIRECT * 4 + 4 /* indirect */ + 4 /* double_indirect */;
const_assert_eq!(HEADER_BYTES + POINTER_BYTES, SECTOR_SIZE);

fn sector_to_raw(sector: Option<u32>) -> u32 {
    sector.unwrap_or(INVALID_SECTOR_RAW)
}

fn raw_to_sector(raw: u32) -> Option<u32> {
    if raw == INVALID_SECTOR_RAW {
        None
    } else {
        Some(raw)
    }
}

impl OnDiskInode {
    pub fn new(file_type: FileType) -> Self {
        OnDiskInode {
            length: 0,
            file_type,
            direct: [INVALID_SECTOR_RAW; N_DIRECT],
            indirect: INVALID_SECTOR_RAW,
            double_indirect: INVALID_SECTOR_RAW,
        }
    }

    pub fn direct(&self, i: usize) -> Option<u32> {
        raw_to_sector(self.direct[i])
    }

    fn set_direct(&mut self, i: usize, sector: Option<u32>) {
        self.direct[i] = sector_to_raw(sector);
    }

    pub fn indirect(&self) -> Option<u32> {
        raw_to_sector(self.indirect)
    }

    fn set_indirect(&mut self, sector: Option<u32>) {
        self.indirect = sector_to_raw(sector);
    }

    pub fn double_indirect(&self) -> Option<u32> {
        raw_to_sector(self.double_indirect)
    }

    fn set_double_indirect(&mut self, sector: Option<u32>) {
        self.double_indirect = sector_to_raw(sector);
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        let mut offset = 0;
        buf[offset..offset + 4].copy_from_slice(&self.length.to_le_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&INODE_MAGIC.to_le_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&(self.file_type as u32).to_le_bytes());
        offset += 4;
        for raw in self.direct.iter() {
            buf[offset..offset + 4].copy_from_slice(&raw.to_le_bytes());
            offset += 4;
        }
        buf[offset..offset + 4].copy_from_slice(&self.indirect.to_le_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&self.double_indirect.to_le_bytes());
        buf
    }

    pub fn from_bytes(sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<Self> {
        let read_u32 = |offset: usize| -> u32 {
            u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
        };
        let length = read_u32(0);
        let magic = read_u32(4);
        if magic != INODE_MAGIC {
            return Err(Error::CorruptInode(sector));
        }
        let file_type = FileType::from_raw(read_u32(8)).map_err(|_| Error::CorruptInode(sector))?;
        let mut direct = [0u32; N_DIRECT];
        let mut offset = 12;
        for slot in direct.iter_mut() {
            *slot = read_u32(offset);
            offset += 4;
        }
        let indirect = read_u32(offset);
        offset += 4;
        let double_indirect = read_u32(offset);
        Ok(OnDiskInode {
            length,
            file_type,
            direct,
            indirect,
            double_indirect,
        })
    }
}

fn sector_count(length: u64) -> usize {
    ((length + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as usize
}

fn read_indirect_entry<D: BlockDevice>(cache: &BufferCache<D>, block: u32, slot: usize) -> Option<u32> {
    let mut entry = [0u8; 4];
    cache.read_partial(block, &mut entry, slot * 4, 4);
    raw_to_sector(u32::from_le_bytes(entry))
}

fn write_indirect_entry<D: BlockDevice>(
    cache: &BufferCache<D>,
    block: u32,
    slot: usize,
    sector: Option<u32>,
) {
    let raw = sector_to_raw(sector);
    cache.write_partial(block, Some(&raw.to_le_bytes()), slot * 4, 4);
}

/// Resolve the backing sector for sector-index `index` within the file (not
/// a byte offset). Returns `None` if unallocated or the chain is missing a
/// level.
fn index_to_sector<D: BlockDevice>(cache: &BufferCache<D>, inode: &OnDiskInode, index: usize) -> Option<u32> {
    if index < N_DIRECT {
        return inode.direct(index);
    }
    let index = index - N_DIRECT;
    if index < N_PER_INDIRECT {
        let block = inode.indirect()?;
        return read_indirect_entry(cache, block, index);
    }
    let index = index - N_PER_INDIRECT;
    if index < N_PER_INDIRECT * N_PER_INDIRECT {
        let double = inode.double_indirect()?;
        let outer = index / N_PER_INDIRECT;
        let inner = index % N_PER_INDIRECT;
        let block = read_indirect_entry(cache, double, outer)?;
        return read_indirect_entry(cache, block, inner);
    }
    None
}

/// §4.5 `byte_to_sector`: the backing sector for a byte offset, or `None`
/// (the on-disk `INVALID_SECTOR` sentinel) if `pos` is past the end of the
/// file.
pub fn byte_to_sector<D: BlockDevice>(cache: &BufferCache<D>, inode: &OnDiskInode, pos: u64) -> Option<u32> {
    if pos >= inode.length as u64 {
        return None;
    }
    index_to_sector(cache, inode, (pos / SECTOR_SIZE as u64) as usize)
}

enum Allocation {
    Data(u32),
    Indirect(u32),
    DoubleIndirect(u32),
    SecondLevel { sector: u32, double: u32, outer: usize },
}

fn allocate_one<D: BlockDevice>(
    cache: &BufferCache<D>,
    freemap: &super::freemap::FreeMap,
) -> Result<u32> {
    let sector = freemap.allocate_one().ok_or(Error::NoFreeSectors)?;
    cache.write(sector, None);
    Ok(sector)
}

/// Ensure sector-index `index` has a backing data sector, allocating index
/// blocks and the data sector itself as needed, and point the tree at
/// `data_sector`. Every sector freshly allocated along the way is recorded
/// in `trail` so a later failure can be unwound.
fn link_index<D: BlockDevice>(
    cache: &BufferCache<D>,
    freemap: &super::freemap::FreeMap,
    inode: &mut OnDiskInode,
    index: usize,
    data_sector: u32,
    trail: &mut Vec<Allocation>,
) -> Result<()> {
    if index < N_DIRECT {
        inode.set_direct(index, Some(data_sector));
        return Ok(());
    }
    let index = index - N_DIRECT;
    if index < N_PER_INDIRECT {
        let block = match inode.indirect() {
            Some(b) => b,
            None => {
                let b = allocate_one(cache, freemap)?;
                trail.push(Allocation::Indirect(b));
                inode.set_indirect(Some(b));
                b
            }
        };
        write_indirect_entry(cache, block, index, Some(data_sector));
        return Ok(());
    }
    let index = index - N_PER_INDIRECT;
    let outer = index / N_PER_INDIRECT;
    let inner = index % N_PER_INDIRECT;
    let double = match inode.double_indirect() {
        Some(b) => b,
        None => {
            let b = allocate_one(cache, freemap)?;
            trail.push(Allocation::DoubleIndirect(b));
            inode.set_double_indirect(Some(b));
            b
        }
    };
    let block = match read_indirect_entry(cache, double, outer) {
        Some(b) => b,
        None => {
            let b = allocate_one(cache, freemap)?;
            trail.push(Allocation::SecondLevel { sector: b, double, outer });
            write_indirect_entry(cache, double, outer, Some(b));
            b
        }
    };
    write_indirect_entry(cache, block, inner, Some(data_sector));
    Ok(())
}

fn unwind<D: BlockDevice>(cache: &BufferCache<D>, freemap: &super::freemap::FreeMap, inode: &mut OnDiskInode, trail: Vec<Allocation>) {
    for allocation in trail.into_iter().rev() {
        match allocation {
            Allocation::Data(sector) => freemap.release(sector),
            Allocation::Indirect(sector) => {
                freemap.release(sector);
                inode.set_indirect(None);
            }
            Allocation::DoubleIndirect(sector) => {
                freemap.release(sector);
                inode.set_double_indirect(None);
            }
            Allocation::SecondLevel { sector, double, outer } => {
                freemap.release(sector);
                write_indirect_entry(cache, double, outer, None);
            }
        }
    }
}

/// §4.5 `grow`: extend the file to `new_length`, zero-filling fresh data
/// sectors. On any allocation failure the entire call rolls back with no
/// effect, so the caller sees atomic success-or-no-effect.
pub fn grow<D: BlockDevice>(
    cache: &BufferCache<D>,
    freemap: &super::freemap::FreeMap,
    inode: &mut OnDiskInode,
    new_length: u64,
) -> Result<()> {
    if new_length as usize > crate::config::MAX_FILE_SECTORS * SECTOR_SIZE {
        return Err(Error::FileTooLarge);
    }
    let old_sectors = sector_count(inode.length as u64);
    let new_sectors = sector_count(new_length);
    if new_sectors <= old_sectors {
        inode.length = new_length as u32;
        return Ok(());
    }

    let mut trail = Vec::new();
    for index in old_sectors..new_sectors {
        let outcome = allocate_one(cache, freemap).and_then(|sector| {
            trail.push(Allocation::Data(sector));
            link_index(cache, freemap, inode, index, sector, &mut trail)
        });
        if let Err(e) = outcome {
            log::warn!("inode: grow to {} bytes failed ({}), rolling back", new_length, e);
            unwind(cache, freemap, inode, trail);
            return Err(e);
        }
    }
    inode.length = new_length as u32;
    Ok(())
}

/// §4.5 `shrink`: release sectors beyond `new_length` in reverse order,
/// releasing index sectors that become entirely unused.
pub fn shrink<D: BlockDevice>(
    cache: &BufferCache<D>,
    freemap: &super::freemap::FreeMap,
    inode: &mut OnDiskInode,
    new_length: u64,
) {
    let old_sectors = sector_count(inode.length as u64);
    let new_sectors = sector_count(new_length);
    for index in (new_sectors..old_sectors).rev() {
        unlink_index(cache, freemap, inode, index);
    }
    inode.length = new_length as u32;
}

fn unlink_index<D: BlockDevice>(cache: &BufferCache<D>, freemap: &super::freemap::FreeMap, inode: &mut OnDiskInode, index: usize) {
    if index < N_DIRECT {
        if let Some(sector) = inode.direct(index) {
            freemap.release(sector);
            inode.set_direct(index, None);
        }
        return;
    }
    let index = index - N_DIRECT;
    if index < N_PER_INDIRECT {
        let Some(block) = inode.indirect() else { return };
        if let Some(sector) = read_indirect_entry(cache, block, index) {
            freemap.release(sector);
            write_indirect_entry(cache, block, index, None);
        }
        if index == 0 {
            freemap.release(block);
            inode.set_indirect(None);
        }
        return;
    }
    let index = index - N_PER_INDIRECT;
    let outer = index / N_PER_INDIRECT;
    let inner = index % N_PER_INDIRECT;
    let Some(double) = inode.double_indirect() else { return };
    let Some(block) = read_indirect_entry(cache, double, outer) else { return };
    if let Some(sector) = read_indirect_entry(cache, block, inner) {
        freemap.release(sector);
        write_indirect_entry(cache, block, inner, None);
    }
    if inner == 0 {
        freemap.release(block);
        write_indirect_entry(cache, double, outer, None);
        if outer == 0 {
            freemap.release(double);
            inode.set_double_indirect(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::fs::freemap::FreeMap;
    use std::sync::Arc;

    fn setup() -> (Arc<BufferCache<MemBlockDevice>>, FreeMap) {
        let total_sectors = 40_000u32;
        let cache = BufferCache::new(Arc::new(MemBlockDevice::new(total_sectors)), 64);
        let freemap = FreeMap::new(total_sectors);
        (cache, freemap)
    }

    #[test]
    fn on_disk_inode_round_trips_through_bytes() {
        let mut inode = OnDiskInode::new(FileType::File);
        inode.length = 12345;
        inode.set_direct(0, Some(7));
        inode.set_indirect(Some(99));
        let bytes = inode.to_bytes();
        let back = OnDiskInode::from_bytes(0, &bytes).unwrap();
        assert_eq!(back.length, 12345);
        assert_eq!(back.direct(0), Some(7));
        assert_eq!(back.indirect(), Some(99));
        assert_eq!(back.double_indirect(), None);
    }

    #[test]
    fn grow_then_shrink_to_zero_frees_every_sector() {
        let (cache, freemap) = setup();
        let before = freemap.free_count();
        let mut inode = OnDiskInode::new(FileType::File);
        grow(&cache, &freemap, &mut inode, 300_001).unwrap();
        assert_eq!(inode.length, 300_001);
        shrink(&cache, &freemap, &mut inode, 0);
        assert_eq!(freemap.free_count(), before);
        cache.shutdown();
    }

    #[test]
    fn byte_to_sector_reaches_into_double_indirect() {
        let (cache, freemap) = setup();
        let mut inode = OnDiskInode::new(FileType::File);
        grow(&cache, &freemap, &mut inode, 300_001).unwrap();
        assert!(byte_to_sector(&cache, &inode, 300_000).is_some());
        assert_eq!(byte_to_sector(&cache, &inode, 300_001), None);
        cache.shutdown();
    }

    #[test]
    fn grow_past_capacity_fails_with_no_side_effects() {
        let (cache, freemap) = setup();
        let mut inode = OnDiskInode::new(FileType::File);
        let before = freemap.free_count();
        let too_big = (crate::config::MAX_FILE_SECTORS as u64 + 1) * SECTOR_SIZE as u64;
        assert!(grow(&cache, &freemap, &mut inode, too_big).is_err());
        assert_eq!(inode.length, 0);
        assert_eq!(freemap.free_count(), before);
        cache.shutdown();
    }

    #[test]
    fn grow_rolls_back_on_mid_allocation_exhaustion() {
        // Only enough sectors for a handful of data blocks plus indices.
        let cache = BufferCache::new(Arc::new(MemBlockDevice::new(20)), 8);
        let freemap = FreeMap::new(20);
        let mut inode = OnDiskInode::new(FileType::File);
        let before = freemap.free_count();
        // 20 sectors can't possibly hold 400 sectors worth of data+index.
        let result = grow(&cache, &freemap, &mut inode, 400 * SECTOR_SIZE as u64);
        assert!(result.is_err());
        assert_eq!(inode.length, 0);
        assert_eq!(freemap.free_count(), before);
        cache.shutdown();
    }
}
