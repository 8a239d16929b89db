//! Save-file format definitions.
//!
//! # File format (version 4)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Record: MARKER: i32, payload shaped by the marker value  │
//! │   marker < 0   fixed-layout metadata record              │
//! │   marker == 0  end-of-stream sentinel                    │
//! │   marker > 0   page batch (count + mode in the marker)   │
//! ├──────────────────────────────────────────────────────────┤
//! │ ... repeated records, page batches in frame order ...    │
//! ├──────────────────────────────────────────────────────────┤
//! │ zero-bitmap record, page-offsets record                  │
//! ├──────────────────────────────────────────────────────────┤
//! │ END MARKER: i32 = 0                                      │
//! ├──────────────────────────────────────────────────────────┤
//! │ IndexPtr { offset: u64, marker: i32 } trailer entries    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian and fixed-width. The trailer is walked
//! backward from end-of-file in 12-byte windows; because the marker field
//! is last, the window preceding the first trailer entry ends in the
//! stream's own end marker, which terminates the walk.
//!
//! A page-batch marker encodes both the page count and the payload
//! encoding: `marker = count + k * MAX_BATCH` with `k = 0` raw pages,
//! `k = 1` one LZ4 blob for the whole batch, `k = 2` per-page LZ4 with a
//! 2-byte size prefix each. The magnitude trick stays inside this module;
//! everywhere else uses [`BatchMode`].

use thiserror::Error;
use uuid::Uuid;

/// Save format version; checked exactly once at stream start.
pub const SAVE_FORMAT_VERSION: u32 = 4;

/// Guest page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Maximum number of pages in one batch record.
pub const MAX_BATCH: u32 = 1023;

/// End-of-stream sentinel; also terminates the trailer index chain.
pub const MARKER_END: i32 = 0;
/// vCPU topology record.
pub const MARKER_VCPU_INFO: i32 = -2;
/// HVM identity page table parameter.
pub const MARKER_HVM_IDENT_PT: i32 = -3;
/// HVM vm86 TSS parameter.
pub const MARKER_HVM_VM86_TSS: i32 = -4;
/// TSC calibration record.
pub const MARKER_TSC_INFO: i32 = -7;
/// HVM console frame parameter.
pub const MARKER_HVM_CONSOLE_PFN: i32 = -8;
/// ACPI io-port location parameter.
pub const MARKER_HVM_ACPI_IOPORTS: i32 = -10;
/// Reserved magic frame numbers.
pub const MARKER_HVM_MAGIC_PFNS: i32 = -11;
/// CPU/device HVM context blob.
pub const MARKER_HVM_CONTEXT: i32 = -12;
/// Device-model state blob.
pub const MARKER_HVM_DM: i32 = -13;
/// VM identity UUID.
pub const MARKER_VM_UUID: i32 = -14;
/// Template identity UUID.
pub const MARKER_TEMPLATE_UUID: i32 = -15;
/// Format version record; must be first in the stream.
pub const MARKER_VERSION: i32 = -16;
/// Memory-map bounds for the mapcache.
pub const MARKER_MAPCACHE_PARAMS: i32 = -18;
/// Path of the backing template file.
pub const MARKER_TEMPLATE_FILE: i32 = -19;
/// Frame-to-file-offset table.
pub const MARKER_PAGE_OFFSETS: i32 = -20;
/// LZ4-compressed zero-page bitmap.
pub const MARKER_ZERO_BITMAP: i32 = -21;

/// Bulk-compressed batches store this in place of the compressed size when
/// compression did not shrink the batch and the pages follow raw.
pub const BULK_STORED_RAW: u32 = u32::MAX;

/// Format-related errors.
#[derive(Error, Debug)]
pub enum FormatError {
    /// The file ended inside a record.
    #[error("unexpected end of file in {0}")]
    UnexpectedEof(&'static str),

    /// The stream does not begin with a version record.
    #[error("version record missing at stream start (marker {0})")]
    MissingVersion(i32),

    /// The version record carries an unsupported version.
    #[error("version mismatch: {0} != {SAVE_FORMAT_VERSION}")]
    VersionMismatch(u32),

    /// A negative marker this implementation does not know.
    #[error("unknown marker {0}")]
    UnknownMarker(i32),

    /// A page-batch marker whose magnitude exceeds `3 * MAX_BATCH`.
    #[error("invalid batch marker {0:#x}")]
    InvalidBatchMarker(i32),

    /// A declared size field is impossible for its record.
    #[error("invalid size {size} in {record}")]
    InvalidSize {
        /// Record name.
        record: &'static str,
        /// The declared size.
        size: u64,
    },

    /// The trailer index chain does not point at a page-offsets record.
    #[error("page-offsets index corrupt at offset {0}")]
    IndexCorrupt(u64),
}

/// Payload encoding of a page batch, explicit in memory.
///
/// On the wire this lives in the marker magnitude; see
/// [`encode_batch_marker`] / [`decode_batch_marker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Raw page data, one page after another.
    Raw,
    /// One LZ4 blob covering the whole batch.
    BulkLz4,
    /// Each page LZ4-compressed individually with a u16 size prefix.
    PerPageLz4,
}

/// Encode a page count and mode into a batch marker.
///
/// # Panics
///
/// Panics when `count` is not in `1..=MAX_BATCH`; batch construction is
/// internal and never produces other counts.
pub fn encode_batch_marker(count: u32, mode: BatchMode) -> i32 {
    assert!(count >= 1 && count <= MAX_BATCH, "batch count {count} out of range");
    let k = match mode {
        BatchMode::Raw => 0,
        BatchMode::BulkLz4 => 1,
        BatchMode::PerPageLz4 => 2,
    };
    (count + k * MAX_BATCH) as i32
}

/// Decode a positive batch marker into page count and mode.
pub fn decode_batch_marker(marker: i32) -> Result<(u32, BatchMode), FormatError> {
    if marker <= 0 || marker as u32 > 3 * MAX_BATCH {
        return Err(FormatError::InvalidBatchMarker(marker));
    }
    let m = marker as u32;
    if m > 2 * MAX_BATCH {
        Ok((m - 2 * MAX_BATCH, BatchMode::PerPageLz4))
    } else if m > MAX_BATCH {
        Ok((m - MAX_BATCH, BatchMode::BulkLz4))
    } else {
        Ok((m, BatchMode::Raw))
    }
}

fn get<const N: usize>(buf: &[u8], at: usize, record: &'static str) -> Result<[u8; N], FormatError> {
    buf.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(FormatError::UnexpectedEof(record))
}

/// TSC calibration values.
///
/// Payload: u32 mode, u64 nsec, u32 khz, u32 incarnation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TscRecord {
    /// TSC mode.
    pub mode: u32,
    /// Elapsed nanoseconds at save time.
    pub nsec: u64,
    /// TSC frequency in kHz.
    pub khz: u32,
    /// Incarnation counter.
    pub incarnation: u32,
}

impl TscRecord {
    /// Serialized payload size.
    pub const SIZE: usize = 20;

    /// Serialize the payload.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..12].copy_from_slice(&self.nsec.to_le_bytes());
        buf[12..16].copy_from_slice(&self.khz.to_le_bytes());
        buf[16..20].copy_from_slice(&self.incarnation.to_le_bytes());
        buf
    }

    /// Parse the payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            mode: u32::from_le_bytes(get(buf, 0, "tsc-info")?),
            nsec: u64::from_le_bytes(get(buf, 4, "tsc-info")?),
            khz: u32::from_le_bytes(get(buf, 12, "tsc-info")?),
            incarnation: u32::from_le_bytes(get(buf, 16, "tsc-info")?),
        })
    }
}

/// vCPU topology.
///
/// Payload: i32 max vCPU id, u64 online bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VcpuRecord {
    /// Highest vCPU id.
    pub max_vcpu_id: i32,
    /// Bitmap of online vCPUs.
    pub online: u64,
}

impl VcpuRecord {
    /// Serialized payload size.
    pub const SIZE: usize = 12;

    /// Serialize the payload.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.max_vcpu_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.online.to_le_bytes());
        buf
    }

    /// Parse the payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            max_vcpu_id: i32::from_le_bytes(get(buf, 0, "vcpu-info")?),
            online: u64::from_le_bytes(get(buf, 4, "vcpu-info")?),
        })
    }
}

/// The five reserved magic frame numbers.
///
/// Payload: u64[5]: io-pfn-first, io-pfn-last, shared-info, dmreq,
/// dmreq-vcpu.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MagicPfnsRecord {
    /// First io-request frame.
    pub io_pfn_first: u64,
    /// Last io-request frame.
    pub io_pfn_last: u64,
    /// Shared-info frame.
    pub shared_info_pfn: u64,
    /// Device-model request frame.
    pub dmreq_pfn: u64,
    /// Per-vCPU device-model request frame.
    pub dmreq_vcpu_pfn: u64,
}

impl MagicPfnsRecord {
    /// Serialized payload size.
    pub const SIZE: usize = 40;

    /// Serialize the payload.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        for (i, v) in [
            self.io_pfn_first,
            self.io_pfn_last,
            self.shared_info_pfn,
            self.dmreq_pfn,
            self.dmreq_vcpu_pfn,
        ]
        .iter()
        .enumerate()
        {
            buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    /// Parse the payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            io_pfn_first: u64::from_le_bytes(get(buf, 0, "hvm-magic-pfns")?),
            io_pfn_last: u64::from_le_bytes(get(buf, 8, "hvm-magic-pfns")?),
            shared_info_pfn: u64::from_le_bytes(get(buf, 16, "hvm-magic-pfns")?),
            dmreq_pfn: u64::from_le_bytes(get(buf, 24, "hvm-magic-pfns")?),
            dmreq_vcpu_pfn: u64::from_le_bytes(get(buf, 32, "hvm-magic-pfns")?),
        })
    }
}

/// Mapcache memory-map bounds.
///
/// Payload: u32 end-low-pfn, u32 start-high-pfn, u32 end-high-pfn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapcacheRecord {
    /// End of the low memory range.
    pub end_low_pfn: u32,
    /// Start of the high memory range.
    pub start_high_pfn: u32,
    /// End of the high memory range.
    pub end_high_pfn: u32,
}

impl MapcacheRecord {
    /// Serialized payload size.
    pub const SIZE: usize = 12;

    /// Serialize the payload.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.end_low_pfn.to_le_bytes());
        buf[4..8].copy_from_slice(&self.start_high_pfn.to_le_bytes());
        buf[8..12].copy_from_slice(&self.end_high_pfn.to_le_bytes());
        buf
    }

    /// Parse the payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            end_low_pfn: u32::from_le_bytes(get(buf, 0, "mapcache-params")?),
            start_high_pfn: u32::from_le_bytes(get(buf, 4, "mapcache-params")?),
            end_high_pfn: u32::from_le_bytes(get(buf, 8, "mapcache-params")?),
        })
    }
}

/// A 16-byte UUID payload (vm-uuid and template-uuid records).
pub fn uuid_to_bytes(uuid: &Uuid) -> [u8; 16] {
    *uuid.as_bytes()
}

/// Parse a 16-byte UUID payload.
pub fn uuid_from_bytes(buf: &[u8]) -> Result<Uuid, FormatError> {
    let raw: [u8; 16] = get(buf, 0, "uuid")?;
    Ok(Uuid::from_bytes(raw))
}

/// Trailer entry pointing back at an index record.
///
/// Written after the end marker; the marker field is last so the 12-byte
/// backward walk from end-of-file terminates on the stream's end marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPtr {
    /// File offset of the record this entry points at.
    pub offset: u64,
    /// Marker of the record this entry points at.
    pub marker: i32,
}

impl IndexPtr {
    /// Serialized size.
    pub const SIZE: usize = 12;

    /// Serialize the entry.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.marker.to_le_bytes());
        buf
    }

    /// Parse an entry.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            offset: u64::from_le_bytes(get(buf, 0, "index pointer")?),
            marker: i32::from_le_bytes(get(buf, 8, "index pointer")?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_marker_roundtrip() {
        for mode in [BatchMode::Raw, BatchMode::BulkLz4, BatchMode::PerPageLz4] {
            for count in [1, 2, 511, 1022, MAX_BATCH] {
                let marker = encode_batch_marker(count, mode);
                assert!(marker > 0);
                assert_eq!(decode_batch_marker(marker).unwrap(), (count, mode));
            }
        }
    }

    #[test]
    fn batch_marker_boundaries() {
        assert_eq!(decode_batch_marker(1023).unwrap(), (1023, BatchMode::Raw));
        assert_eq!(decode_batch_marker(1024).unwrap(), (1, BatchMode::BulkLz4));
        assert_eq!(decode_batch_marker(2046).unwrap(), (1023, BatchMode::BulkLz4));
        assert_eq!(
            decode_batch_marker(2047).unwrap(),
            (1, BatchMode::PerPageLz4)
        );
        assert_eq!(
            decode_batch_marker(3069).unwrap(),
            (1023, BatchMode::PerPageLz4)
        );
    }

    #[test]
    fn batch_marker_rejects_out_of_range() {
        assert!(decode_batch_marker(0).is_err());
        assert!(decode_batch_marker(-2).is_err());
        assert!(decode_batch_marker(3070).is_err());
        assert!(decode_batch_marker(i32::MAX).is_err());
    }

    #[test]
    fn tsc_record_roundtrip() {
        let rec = TscRecord {
            mode: 1,
            nsec: 0x1122_3344_5566_7788,
            khz: 2_400_000,
            incarnation: 3,
        };
        assert_eq!(TscRecord::from_bytes(&rec.to_bytes()).unwrap(), rec);
    }

    #[test]
    fn vcpu_record_roundtrip() {
        let rec = VcpuRecord {
            max_vcpu_id: 3,
            online: 0b1011,
        };
        assert_eq!(VcpuRecord::from_bytes(&rec.to_bytes()).unwrap(), rec);
    }

    #[test]
    fn magic_pfns_roundtrip() {
        let rec = MagicPfnsRecord {
            io_pfn_first: 0xfeff0,
            io_pfn_last: 0xfeff4,
            shared_info_pfn: 0xfefff,
            dmreq_pfn: 0xfeffd,
            dmreq_vcpu_pfn: 0xfeffe,
        };
        assert_eq!(MagicPfnsRecord::from_bytes(&rec.to_bytes()).unwrap(), rec);
    }

    #[test]
    fn short_payload_is_eof() {
        assert!(matches!(
            TscRecord::from_bytes(&[0u8; 10]),
            Err(FormatError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn index_ptr_roundtrip() {
        let ptr = IndexPtr {
            offset: 0xdead_beef,
            marker: MARKER_PAGE_OFFSETS,
        };
        assert_eq!(IndexPtr::from_bytes(&ptr.to_bytes()).unwrap(), ptr);
    }
}
