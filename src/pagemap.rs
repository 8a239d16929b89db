//! Page offset index and zero-page bitmap.
//!
//! Both structures are built incrementally during save and read back
//! during load: the index maps compacted guest frame numbers to the file
//! offset of their saved data (bit 63 flags "stored compressed"), the
//! bitmap records which frames were entirely zero and therefore carry no
//! page-batch payload at all.
//!
//! Frame numbers are "compacted" by excluding the PCI/MMIO hole, which is
//! never RAM-backed and never indexed.

use std::io::{self, SeekFrom};

use lz4_flex::block;
use tracing::debug;

use crate::error::{Error, Result};
use crate::filebuf::FileBuf;
use crate::format::{FormatError, MARKER_PAGE_OFFSETS, MARKER_ZERO_BITMAP};

/// First frame of the PCI/MMIO hole.
pub const PCI_HOLE_START_PFN: u32 = 0xf0000;
/// First frame after the PCI/MMIO hole.
pub const PCI_HOLE_END_PFN: u32 = 0xfc000;

const PCI_HOLE_LEN: u32 = PCI_HOLE_END_PFN - PCI_HOLE_START_PFN;

/// Bit 63 of an index entry: payload stored compressed, entry points at
/// the page's u16 length prefix rather than its data.
pub const ENTRY_COMPRESSED: u64 = 1 << 63;

/// Mask selecting the file offset of an index entry.
pub const ENTRY_OFFSET_MASK: u64 = !ENTRY_COMPRESSED;

/// True when `pfn` falls inside the PCI/MMIO hole.
pub fn in_pci_hole(pfn: u32) -> bool {
    (PCI_HOLE_START_PFN..PCI_HOLE_END_PFN).contains(&pfn)
}

/// Compact a frame number by skipping the PCI hole.
pub fn compact_pfn(pfn: u32) -> u32 {
    if pfn < PCI_HOLE_END_PFN {
        pfn
    } else {
        pfn - PCI_HOLE_LEN
    }
}

/// Frame-to-file-offset table, indexed by compacted frame number.
#[derive(Debug)]
pub struct PageOffsetIndex {
    /// One past the highest indexable frame, hole included.
    max_gpfn: u32,
    entries: Vec<u64>,
}

impl PageOffsetIndex {
    /// Allocate an index sized for a guest with `mem_mb` MB of RAM.
    pub fn new(mem_mb: u32) -> Result<Self> {
        let count = mem_mb
            .checked_shl(8)
            .ok_or_else(|| Error::Resource(format!("page offset index for {mem_mb} MB")))?;
        let mut max_gpfn = count;
        // Guests large enough to straddle the hole address frames above it.
        if max_gpfn > PCI_HOLE_START_PFN {
            max_gpfn += PCI_HOLE_LEN;
        }
        Ok(Self {
            max_gpfn,
            entries: vec![0u64; count as usize],
        })
    }

    /// Rebuild from decoded record entries (lazy-load path).
    pub fn from_entries(entries: Vec<u64>) -> Self {
        let mut max_gpfn = entries.len() as u32;
        if max_gpfn > PCI_HOLE_START_PFN {
            max_gpfn += PCI_HOLE_LEN;
        }
        Self { max_gpfn, entries }
    }

    /// One past the highest indexable frame (hole included).
    pub fn max_gpfn(&self) -> u32 {
        self.max_gpfn
    }

    /// Whether `pfn` has a slot in the index.
    pub fn contains(&self, pfn: u32) -> bool {
        pfn < self.max_gpfn && !in_pci_hole(pfn)
    }

    /// Record the file offset of a page stored raw.
    pub fn record_raw(&mut self, pfn: u32, offset: u64) {
        if self.contains(pfn) {
            self.entries[compact_pfn(pfn) as usize] = offset & ENTRY_OFFSET_MASK;
        }
    }

    /// Record the file offset of a page's u16 length prefix.
    pub fn record_compressed(&mut self, pfn: u32, offset: u64) {
        if self.contains(pfn) {
            self.entries[compact_pfn(pfn) as usize] = offset | ENTRY_COMPRESSED;
        }
    }

    /// Raw entry for `pfn`; 0 means "no data recorded".
    pub fn entry(&self, pfn: u32) -> Option<u64> {
        if self.contains(pfn) {
            Some(self.entries[compact_pfn(pfn) as usize])
        } else {
            None
        }
    }

    /// Write the page-offsets record; returns the record's file offset for
    /// the trailer pointer.
    pub fn write_record(&self, f: &mut FileBuf) -> io::Result<u64> {
        let pos = f.tell()?;
        f.write_i32(MARKER_PAGE_OFFSETS)?;
        f.write_u32(self.entries.len() as u32)?;
        let mut buf = Vec::with_capacity(self.entries.len() * 8);
        for e in &self.entries {
            buf.extend_from_slice(&e.to_le_bytes());
        }
        f.write_all(&buf)?;
        debug!(
            offset = pos,
            count = self.entries.len(),
            "wrote page offset index"
        );
        Ok(pos)
    }

    /// Read the record body (marker already consumed).
    pub fn read_record(f: &mut FileBuf) -> Result<Self> {
        let count = f.read_u32()? as usize;
        let mut raw = vec![0u8; count * 8];
        f.read_exact(&mut raw)?;
        let entries = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Self::from_entries(entries))
    }

    /// Skip over the record body (marker already consumed), recording
    /// nothing.
    pub fn skip_record(f: &mut FileBuf) -> Result<()> {
        let count = f.read_u32()? as u64;
        f.seek(SeekFrom::Current(count as i64 * 8))?;
        Ok(())
    }
}

/// One bit per guest frame, set when the frame's content is all zero.
#[derive(Debug)]
pub struct ZeroBitmap {
    bits: Vec<u8>,
}

impl ZeroBitmap {
    /// Allocate a bitmap covering `p2m_size` frames.
    pub fn new(p2m_size: u32) -> Self {
        Self {
            bits: vec![0u8; (p2m_size as usize + 7) / 8],
        }
    }

    /// Mark `pfn` as zero.
    pub fn set(&mut self, pfn: u32) {
        self.bits[pfn as usize / 8] |= 1 << (pfn % 8);
    }

    /// Whether `pfn` is marked zero.
    pub fn test(&self, pfn: u32) -> bool {
        self.bits
            .get(pfn as usize / 8)
            .is_some_and(|b| b & (1 << (pfn % 8)) != 0)
    }

    /// Number of frames the bitmap covers.
    pub fn frame_count(&self) -> u32 {
        (self.bits.len() * 8) as u32
    }

    /// Number of set bits.
    pub fn set_count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Iterate over all set frame numbers in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter().enumerate().flat_map(|(byte, &b)| {
            (0..8)
                .filter(move |bit| b & (1 << bit) != 0)
                .map(move |bit| (byte * 8) as u32 + bit)
        })
    }

    /// Write the zero-bitmap record, LZ4-compressed with a raw fallback
    /// when compression does not shrink the bitmap.
    pub fn write_record(&self, f: &mut FileBuf) -> Result<u64> {
        let pos = f.tell()?;
        let mut compressed = vec![0u8; block::get_maximum_output_size(self.bits.len())];
        let csize = block::compress_into(&self.bits, &mut compressed)
            .map_err(|e| Error::Resource(format!("zero bitmap compression: {e}")))?;

        f.write_i32(MARKER_ZERO_BITMAP)?;
        if csize < self.bits.len() {
            f.write_u32(csize as u32)?;
            f.write_u32(self.bits.len() as u32)?;
            f.write_all(&compressed[..csize])?;
        } else {
            f.write_u32(self.bits.len() as u32)?;
            f.write_u32(self.bits.len() as u32)?;
            f.write_all(&self.bits)?;
        }
        debug!(
            compressed = csize.min(self.bits.len()),
            raw = self.bits.len(),
            "wrote zero bitmap"
        );
        Ok(pos)
    }

    /// Read the record body (marker already consumed). Equal sizes mean
    /// the bitmap was stored raw.
    pub fn read_record(f: &mut FileBuf) -> Result<Self> {
        let csize = f.read_u32()? as usize;
        let usize_ = f.read_u32()? as usize;
        if csize > usize_ {
            return Err(FormatError::InvalidSize {
                record: "zero-bitmap",
                size: csize as u64,
            }
            .into());
        }
        let mut bits = vec![0u8; usize_];
        if csize == usize_ {
            f.read_exact(&mut bits)?;
        } else {
            let mut compressed = vec![0u8; csize];
            f.read_exact(&mut compressed)?;
            let n = block::decompress_into(&compressed, &mut bits)
                .map_err(crate::error::DecompressError::Lz4)?;
            if n != usize_ {
                return Err(crate::error::DecompressError::SizeMismatch {
                    first_pfn: 0,
                    last_pfn: (usize_ * 8) as u32,
                    produced: n,
                    expected: usize_,
                }
                .into());
            }
        }
        Ok(Self { bits })
    }

    /// Skip over the record body (marker already consumed).
    pub fn skip_record(f: &mut FileBuf) -> Result<()> {
        let csize = f.read_u32()? as i64;
        let _usize = f.read_u32()?;
        f.seek(SeekFrom::Current(csize))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn compact_skips_hole() {
        assert_eq!(compact_pfn(0), 0);
        assert_eq!(compact_pfn(PCI_HOLE_START_PFN - 1), PCI_HOLE_START_PFN - 1);
        assert_eq!(compact_pfn(PCI_HOLE_END_PFN), PCI_HOLE_START_PFN);
        assert_eq!(compact_pfn(PCI_HOLE_END_PFN + 5), PCI_HOLE_START_PFN + 5);
    }

    #[test]
    fn hole_pfns_not_indexed() {
        // 4 GB guest: frames extend past the hole.
        let poi = PageOffsetIndex::new(4096).unwrap();
        assert!(poi.contains(0));
        assert!(!poi.contains(PCI_HOLE_START_PFN));
        assert!(!poi.contains(PCI_HOLE_END_PFN - 1));
        assert!(poi.contains(PCI_HOLE_END_PFN));
        assert_eq!(poi.max_gpfn(), (4096 << 8) + PCI_HOLE_LEN);
    }

    #[test]
    fn small_guest_has_no_hole_adjustment() {
        let poi = PageOffsetIndex::new(64).unwrap();
        assert_eq!(poi.max_gpfn(), 64 << 8);
    }

    #[test]
    fn record_and_flag_roundtrip() {
        let mut poi = PageOffsetIndex::new(64).unwrap();
        poi.record_raw(7, 0x1000);
        poi.record_compressed(9, 0x2002);
        assert_eq!(poi.entry(7), Some(0x1000));
        assert_eq!(poi.entry(9), Some(0x2002 | ENTRY_COMPRESSED));
        assert_eq!(poi.entry(8), Some(0));
    }

    #[test]
    fn index_record_roundtrip() {
        let dir = tempdir().unwrap();
        let mut f = FileBuf::create(dir.path().join("idx")).unwrap();

        let mut poi = PageOffsetIndex::new(16).unwrap();
        poi.record_raw(1, 0xaa00);
        poi.record_compressed(2, 0xbb00);
        let pos = poi.write_record(&mut f).unwrap();
        assert_eq!(pos, 0);

        f.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(f.read_i32().unwrap(), MARKER_PAGE_OFFSETS);
        let back = PageOffsetIndex::read_record(&mut f).unwrap();
        assert_eq!(back.entry(1), Some(0xaa00));
        assert_eq!(back.entry(2), Some(0xbb00 | ENTRY_COMPRESSED));
    }

    #[test]
    fn bitmap_set_and_iter() {
        let mut zb = ZeroBitmap::new(100);
        zb.set(0);
        zb.set(63);
        zb.set(99);
        assert!(zb.test(0) && zb.test(63) && zb.test(99));
        assert!(!zb.test(1));
        assert_eq!(zb.set_count(), 3);
        assert_eq!(zb.iter_set().collect::<Vec<_>>(), vec![0, 63, 99]);
    }

    #[test]
    fn bitmap_record_roundtrip() {
        let dir = tempdir().unwrap();
        let mut f = FileBuf::create(dir.path().join("zb")).unwrap();

        let mut zb = ZeroBitmap::new(4096 * 8);
        for pfn in (0..1000).step_by(3) {
            zb.set(pfn);
        }
        zb.write_record(&mut f).unwrap();

        f.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(f.read_i32().unwrap(), MARKER_ZERO_BITMAP);
        let back = ZeroBitmap::read_record(&mut f).unwrap();
        assert_eq!(back.set_count(), zb.set_count());
        for pfn in 0..1000 {
            assert_eq!(back.test(pfn), zb.test(pfn));
        }
    }

    #[test]
    fn bitmap_skip_record_lands_after_payload() {
        let dir = tempdir().unwrap();
        let mut f = FileBuf::create(dir.path().join("zb")).unwrap();

        let mut zb = ZeroBitmap::new(64);
        zb.set(1);
        zb.write_record(&mut f).unwrap();
        f.write_u32(0xfeed_f00d).unwrap();

        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_i32().unwrap();
        ZeroBitmap::skip_record(&mut f).unwrap();
        assert_eq!(f.read_u32().unwrap(), 0xfeed_f00d);
    }
}
