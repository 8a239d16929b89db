//! Lazy-load subsystem: on-demand single-page fetch from a save file.
//!
//! [`LazyLoadInfo`] locates the page-offset index by walking the file
//! trailer backward from EOF in [`IndexPtr`]-sized windows. The walk
//! stops either at the page-offsets pointer or at a window whose marker
//! field is the stream's own end marker, which means the file carries no
//! index (it predates indexing or was saved without one).
//!
//! The fetch path runs on the page-fault path of a running guest, so a
//! request for a frame that can never be in the index (PCI hole,
//! out of range) is a caller bug and panics rather than erroring.

use std::io::SeekFrom;
use std::path::Path;

use lz4_flex::block;
use tracing::debug;

use crate::error::{DecompressError, Result};
use crate::filebuf::FileBuf;
use crate::format::{
    FormatError, IndexPtr, MARKER_END, MARKER_PAGE_OFFSETS, PAGE_SIZE,
};
use crate::pagemap::{PageOffsetIndex, ENTRY_COMPRESSED, ENTRY_OFFSET_MASK};

/// Stored sizes above this are not worth returning compressed; the
/// caller-side inflate only pays off for clearly smaller pages.
const WANT_COMPRESSED_MAX: usize = PAGE_SIZE - 256;

/// Per-VM handle for demand-loading pages out of a save file.
pub struct LazyLoadInfo {
    index: PageOffsetIndex,
    file: FileBuf,
}

impl LazyLoadInfo {
    /// Locate and load the page-offset index from a completed save file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = FileBuf::open(path)?;
        let len = file.len()?;
        let mut pos = len;
        let index_offset = loop {
            if pos < IndexPtr::SIZE as u64 {
                return Err(FormatError::IndexCorrupt(pos).into());
            }
            pos -= IndexPtr::SIZE as u64;
            file.seek(SeekFrom::Start(pos))?;
            let mut buf = [0u8; IndexPtr::SIZE];
            file.read_exact(&mut buf)?;
            let ptr = IndexPtr::from_bytes(&buf)?;
            match ptr.marker {
                MARKER_PAGE_OFFSETS => break ptr.offset,
                // Walked past the pointer chain into the stream proper.
                MARKER_END => return Err(FormatError::IndexCorrupt(pos).into()),
                _ => continue,
            }
        };

        file.seek(SeekFrom::Start(index_offset))?;
        if file.read_i32()? != MARKER_PAGE_OFFSETS {
            return Err(FormatError::IndexCorrupt(index_offset).into());
        }
        let index = PageOffsetIndex::read_record(&mut file)?;
        debug!(
            index_offset,
            max_gpfn = index.max_gpfn(),
            "lazy load index ready"
        );
        Ok(Self { index, file })
    }

    /// One past the highest frame the index covers.
    pub fn max_gpfn(&self) -> u32 {
        self.index.max_gpfn()
    }

    /// Fetch one page into `dest`, returning the number of bytes written.
    ///
    /// Returns `PAGE_SIZE` bytes of page data, or — when `want_compressed`
    /// and the stored page is small enough — the still-compressed bytes
    /// for the caller to inflate. Returns 0 when the frame has no data in
    /// the file (it was zero or unpopulated at save time).
    ///
    /// # Panics
    ///
    /// Panics when `gpfn` is in the PCI hole or beyond the indexed range;
    /// such frames can never fault through this path.
    pub fn lazy_load_page(
        &mut self,
        gpfn: u32,
        dest: &mut [u8],
        want_compressed: bool,
    ) -> Result<usize> {
        let entry = self
            .index
            .entry(gpfn)
            .unwrap_or_else(|| panic!("lazy load of unindexable frame {gpfn:#x}"));
        if entry == 0 {
            return Ok(0);
        }
        let offset = entry & ENTRY_OFFSET_MASK;
        self.file.seek(SeekFrom::Start(offset))?;

        if entry & ENTRY_COMPRESSED == 0 {
            // Raw page data at the recorded offset.
            self.file.read_exact(&mut dest[..PAGE_SIZE])?;
            return Ok(PAGE_SIZE);
        }

        let csize = self.file.read_u16()? as usize;
        if csize > PAGE_SIZE {
            return Err(FormatError::InvalidSize {
                record: "lazy-page",
                size: csize as u64,
            }
            .into());
        }
        if csize == PAGE_SIZE {
            // Compressed in vain at save time: stored raw behind the
            // page-sized prefix.
            self.file.read_exact(&mut dest[..PAGE_SIZE])?;
            return Ok(PAGE_SIZE);
        }
        if want_compressed && csize <= WANT_COMPRESSED_MAX {
            self.file.read_exact(&mut dest[..csize])?;
            return Ok(csize);
        }
        let mut compressed = vec![0u8; csize];
        self.file.read_exact(&mut compressed)?;
        let n = block::decompress_into(&compressed, &mut dest[..PAGE_SIZE])
            .map_err(DecompressError::Lz4)?;
        if n != PAGE_SIZE {
            return Err(DecompressError::SizeMismatch {
                first_pfn: gpfn,
                last_pfn: gpfn,
                produced: n,
                expected: PAGE_SIZE,
            }
            .into());
        }
        Ok(PAGE_SIZE)
    }
}
