//! Save pipeline: serialize a suspended VM to a save file.
//!
//! A [`VmSaveSession`] drives the whole operation: suspend the domain,
//! write the metadata records, then walk guest memory in batches of up to
//! [`MAX_BATCH`] frames. Captured pages are classified, all-zero pages are
//! handed back to the hypervisor as shared-zero frames, and the remaining
//! data pages are emitted raw or LZ4-compressed per the configured mode.
//! The trailer (zero bitmap, page-offset index, end marker, index
//! pointer) is written only by a completed save; an aborted save leaves
//! the file flagged for deletion and writes no trailer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lz4_flex::block;
use tracing::{debug, info, warn};

use crate::config::{CompressMode, SaveOptions, VmConfig};
use crate::decompress::decompress_batch;
use crate::error::{Error, Result};
use crate::filebuf::FileBuf;
use crate::format::{
    encode_batch_marker, uuid_to_bytes, BatchMode, FormatError, IndexPtr, MagicPfnsRecord,
    BULK_STORED_RAW, MARKER_END, MARKER_HVM_ACPI_IOPORTS, MARKER_HVM_CONSOLE_PFN,
    MARKER_HVM_CONTEXT, MARKER_HVM_DM, MARKER_HVM_IDENT_PT, MARKER_HVM_MAGIC_PFNS,
    MARKER_HVM_VM86_TSS, MARKER_MAPCACHE_PARAMS, MARKER_PAGE_OFFSETS, MARKER_TEMPLATE_FILE,
    MARKER_TEMPLATE_UUID, MARKER_TSC_INFO, MARKER_VCPU_INFO, MARKER_VERSION, MARKER_VM_UUID,
    MARKER_ZERO_BITMAP, MAX_BATCH, PAGE_SIZE, SAVE_FORMAT_VERSION,
};
use crate::hypercall::{DeviceModel, HvmParam, Hypercalls, PageKind};
use crate::pagemap::{
    in_pci_hole, PageOffsetIndex, ZeroBitmap, PCI_HOLE_END_PFN, PCI_HOLE_START_PFN,
};
use uuid::Uuid;

/// Conventional save-file name for a VM.
pub fn save_file_name(uuid: &Uuid) -> String {
    format!("vmsave-{uuid}.save")
}

/// Counters reported once a save completes.
#[derive(Debug, Default, Clone, Copy)]
struct SaveTotals {
    normal: u64,
    zero: u64,
    rezeroed: u64,
    pod: u64,
}

/// One in-progress (or completed, awaiting resume) save of a VM.
pub struct VmSaveSession {
    path: PathBuf,
    config: VmConfig,
    options: SaveOptions,
    abort: Arc<AtomicBool>,
    hc: Arc<dyn Hypercalls>,
    dm: Arc<dyn DeviceModel>,
    file: Option<FileBuf>,
    /// Offset of the first page-batch record; the resume pass replays
    /// the file from here.
    page_batch_offset: u64,
    /// Offset of the device-model blob's data bytes.
    dm_state_offset: u64,
}

impl VmSaveSession {
    pub fn new(
        path: impl Into<PathBuf>,
        config: VmConfig,
        options: SaveOptions,
        hc: Arc<dyn Hypercalls>,
        dm: Arc<dyn DeviceModel>,
    ) -> Self {
        Self {
            path: path.into(),
            config,
            options,
            abort: Arc::new(AtomicBool::new(false)),
            hc,
            dm,
            file: None,
            page_batch_offset: 0,
            dm_state_offset: 0,
        }
    }

    /// Handle the caller can flip to abort the save between batches.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Suspend the VM and write the complete save file.
    ///
    /// On any error (including abort) the partially written file stays
    /// flagged delete-on-close. On success the flag is cleared and the
    /// file stays open for [`resume`] and [`read_dm_state_at`].
    ///
    /// [`resume`]: VmSaveSession::resume
    /// [`read_dm_state_at`]: VmSaveSession::read_dm_state_at
    pub fn save(&mut self) -> Result<()> {
        info!(uuid = %self.config.uuid, path = %self.path.display(), "saving vm");
        self.hc.suspend()?;

        let mut file = FileBuf::create(&self.path)?;
        file.set_delete_on_close(true);
        match self.write_save(&mut file) {
            Ok(totals) => {
                file.flush()?;
                file.set_delete_on_close(false);
                let size = file.len()?;
                self.file = Some(file);
                info!(
                    uuid = %self.config.uuid,
                    normal = totals.normal,
                    zero = totals.zero,
                    rezeroed = totals.rezeroed,
                    cloned = totals.pod,
                    bytes = size,
                    "save complete"
                );
                Ok(())
            }
            Err(e) => {
                warn!(uuid = %self.config.uuid, error = %e, "save failed");
                Err(e)
            }
        }
    }

    fn write_save(&mut self, file: &mut FileBuf) -> Result<SaveTotals> {
        self.write_info(file)?;
        self.page_batch_offset = file.tell()?;
        self.write_pages(file)
    }

    /// Metadata records, version first.
    fn write_info(&mut self, f: &mut FileBuf) -> Result<()> {
        f.write_i32(MARKER_VERSION)?;
        f.write_u32(SAVE_FORMAT_VERSION)?;

        let tsc = self.hc.tsc_info()?;
        f.write_i32(MARKER_TSC_INFO)?;
        f.write_all(&tsc.to_bytes())?;
        debug!(mode = tsc.mode, khz = tsc.khz, incarnation = tsc.incarnation, "saved tsc info");

        let vcpus = self.hc.vcpu_info()?;
        f.write_i32(MARKER_VCPU_INFO)?;
        f.write_all(&vcpus.to_bytes())?;

        // Scalar params are omitted when unset.
        for (param, marker) in [
            (HvmParam::IdentPt, MARKER_HVM_IDENT_PT),
            (HvmParam::Vm86Tss, MARKER_HVM_VM86_TSS),
            (HvmParam::ConsolePfn, MARKER_HVM_CONSOLE_PFN),
            (HvmParam::AcpiIoports, MARKER_HVM_ACPI_IOPORTS),
        ] {
            let value = self.hc.hvm_param(param)?;
            if value != 0 {
                f.write_i32(marker)?;
                f.write_u64(value)?;
            }
        }

        let magic = MagicPfnsRecord {
            io_pfn_first: self.hc.hvm_param(HvmParam::IoPfnFirst)?,
            io_pfn_last: self.hc.hvm_param(HvmParam::IoPfnLast)?,
            shared_info_pfn: self.hc.hvm_param(HvmParam::SharedInfoPfn)?,
            dmreq_pfn: self.hc.hvm_param(HvmParam::DmreqPfn)?,
            dmreq_vcpu_pfn: self.hc.hvm_param(HvmParam::DmreqVcpuPfn)?,
        };
        f.write_i32(MARKER_HVM_MAGIC_PFNS)?;
        f.write_all(&magic.to_bytes())?;

        let context = self.hc.hvm_context()?;
        f.write_i32(MARKER_HVM_CONTEXT)?;
        f.write_u32(context.len() as u32)?;
        f.write_all(&context)?;

        let dm_state = self.dm.save_state()?;
        f.write_i32(MARKER_HVM_DM)?;
        f.write_u32(dm_state.len() as u32)?;
        self.dm_state_offset = f.tell()?;
        f.write_all(&dm_state)?;

        f.write_i32(MARKER_VM_UUID)?;
        f.write_all(&uuid_to_bytes(&self.config.uuid))?;

        if let Some(template_uuid) = &self.config.template_uuid {
            f.write_i32(MARKER_TEMPLATE_UUID)?;
            f.write_all(&uuid_to_bytes(template_uuid))?;
        }

        let mapcache = self.dm.mapcache_params();
        f.write_i32(MARKER_MAPCACHE_PARAMS)?;
        f.write_all(&mapcache.to_bytes())?;

        if let Some(template_file) = &self.config.template_file {
            let bytes = template_file.to_string_lossy();
            let bytes = bytes.as_bytes();
            f.write_i32(MARKER_TEMPLATE_FILE)?;
            f.write_u16(bytes.len() as u16)?;
            f.write_all(bytes)?;
        }
        Ok(())
    }

    /// Page loop plus trailer.
    fn write_pages(&mut self, f: &mut FileBuf) -> Result<SaveTotals> {
        let p2m_size = self.hc.p2m_size()?;
        let mut index = PageOffsetIndex::new(self.config.mem_mb)?;
        let mut zeros = ZeroBitmap::new(p2m_size);
        let mut totals = SaveTotals::default();

        let mut capture = vec![0u8; MAX_BATCH as usize * PAGE_SIZE];
        let mut batch_pfns: Vec<u32> = Vec::with_capacity(MAX_BATCH as usize);
        let mut batch_data: Vec<u8> = Vec::with_capacity(MAX_BATCH as usize * PAGE_SIZE);
        let mut rezero: Vec<u32> = Vec::with_capacity(MAX_BATCH as usize);

        let mut next_report = p2m_size / 10;
        let mut pfn = 0u32;
        while pfn < p2m_size {
            if self.abort.load(Ordering::SeqCst) {
                return Err(Error::Aborted);
            }
            if in_pci_hole(pfn) {
                pfn = PCI_HOLE_END_PFN;
                continue;
            }
            let mut count = (p2m_size - pfn).min(MAX_BATCH);
            // Batches never span the hole.
            if pfn < PCI_HOLE_START_PFN && pfn + count > PCI_HOLE_START_PFN {
                count = PCI_HOLE_START_PFN - pfn;
            }

            let kinds =
                self.hc
                    .capture_pages(pfn, count, self.options.free_mem, &mut capture)?;

            batch_pfns.clear();
            batch_data.clear();
            rezero.clear();
            for (i, kind) in kinds.iter().enumerate() {
                let this_pfn = pfn + i as u32;
                let page = &capture[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
                match kind {
                    PageKind::Normal => {
                        if page.iter().all(|&b| b == 0) {
                            zeros.set(this_pfn);
                            rezero.push(this_pfn);
                            totals.rezeroed += 1;
                        } else {
                            batch_pfns.push(this_pfn);
                            batch_data.extend_from_slice(page);
                            totals.normal += 1;
                        }
                    }
                    PageKind::Zero => {
                        zeros.set(this_pfn);
                        totals.zero += 1;
                    }
                    PageKind::Pod => totals.pod += 1,
                }
            }

            // Rezeroed pages go back to the hypervisor as shared-zero
            // frames; their data is never written. With free_mem the
            // capture already released them.
            if !self.options.free_mem && !rezero.is_empty() {
                self.hc.populate_on_demand(&rezero, false)?;
            }
            if !batch_pfns.is_empty() {
                self.write_batch(f, &mut index, &batch_pfns, &batch_data)?;
            }

            pfn += count;
            if pfn >= next_report {
                debug!(pfn, p2m_size, "save progress");
                next_report += p2m_size / 10;
            }
        }

        // Trailer: bitmap, index, end marker, then the page-offsets
        // pointer the lazy loader finds by walking backward from EOF.
        zeros.write_record(f)?;
        let index_offset = index.write_record(f)?;
        f.write_i32(MARKER_END)?;
        f.write_all(
            &IndexPtr {
                offset: index_offset,
                marker: MARKER_PAGE_OFFSETS,
            }
            .to_bytes(),
        )?;
        Ok(totals)
    }

    /// Emit one page batch in the configured compression mode, recording
    /// index entries for individually addressable pages.
    fn write_batch(
        &self,
        f: &mut FileBuf,
        index: &mut PageOffsetIndex,
        pfns: &[u32],
        data: &[u8],
    ) -> Result<()> {
        let count = pfns.len() as u32;
        match self.options.compress {
            CompressMode::None => {
                f.write_i32(encode_batch_marker(count, BatchMode::Raw))?;
                for &pfn in pfns {
                    f.write_u32(pfn)?;
                }
                let base = f.tell()?;
                for (i, &pfn) in pfns.iter().enumerate() {
                    index.record_raw(pfn, base + (i * PAGE_SIZE) as u64);
                }
                f.write_all(data)?;
            }
            CompressMode::Lz4Bulk => {
                let mut compressed = vec![0u8; block::get_maximum_output_size(data.len())];
                let csize = block::compress_into(data, &mut compressed)
                    .map_err(|e| Error::Resource(format!("batch compression: {e}")))?;
                if csize < data.len() {
                    // Bulk-compressed pages are not individually
                    // addressable; no index entries.
                    f.write_i32(encode_batch_marker(count, BatchMode::BulkLz4))?;
                    for &pfn in pfns {
                        f.write_u32(pfn)?;
                    }
                    f.write_u32(csize as u32)?;
                    f.write_all(&compressed[..csize])?;
                } else {
                    // Compressed in vain: stored raw behind the sentinel.
                    f.write_i32(encode_batch_marker(count, BatchMode::BulkLz4))?;
                    for &pfn in pfns {
                        f.write_u32(pfn)?;
                    }
                    f.write_u32(BULK_STORED_RAW)?;
                    let base = f.tell()?;
                    for (i, &pfn) in pfns.iter().enumerate() {
                        index.record_raw(pfn, base + (i * PAGE_SIZE) as u64);
                    }
                    f.write_all(data)?;
                }
            }
            CompressMode::Lz4PerPage => {
                let mut stream = Vec::with_capacity(data.len());
                // (relative offset of prefix, stored raw) per page
                let mut entries = Vec::with_capacity(pfns.len());
                let mut scratch = vec![0u8; block::get_maximum_output_size(PAGE_SIZE)];
                for i in 0..pfns.len() {
                    let page = &data[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
                    let csize = block::compress_into(page, &mut scratch)
                        .map_err(|e| Error::Resource(format!("page compression: {e}")))?;
                    entries.push((stream.len() as u64, csize >= PAGE_SIZE));
                    if csize < PAGE_SIZE {
                        stream.extend_from_slice(&(csize as u16).to_le_bytes());
                        stream.extend_from_slice(&scratch[..csize]);
                    } else {
                        // Compressed in vain: page-sized prefix, raw data.
                        stream.extend_from_slice(&(PAGE_SIZE as u16).to_le_bytes());
                        stream.extend_from_slice(page);
                    }
                }
                f.write_i32(encode_batch_marker(count, BatchMode::PerPageLz4))?;
                for &pfn in pfns {
                    f.write_u32(pfn)?;
                }
                f.write_u32(stream.len() as u32)?;
                let base = f.tell()?;
                for (i, &pfn) in pfns.iter().enumerate() {
                    let (rel, raw) = entries[i];
                    if raw {
                        index.record_raw(pfn, base + rel + 2);
                    } else {
                        index.record_compressed(pfn, base + rel);
                    }
                }
                f.write_all(&stream)?;
            }
        }
        Ok(())
    }

    /// Re-read a slice of the device-model blob from the open save file.
    pub fn read_dm_state_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let f = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Resource("no completed save file".into()))?;
        f.seek(std::io::SeekFrom::Start(self.dm_state_offset + offset))?;
        f.read_exact(buf)?;
        Ok(())
    }

    /// Resume the VM instead of tearing it down: repopulate any released
    /// memory from the save file, honor `delete_on_resume`, and unpause
    /// the domain.
    pub fn resume(&mut self) -> Result<()> {
        if self.options.free_mem {
            self.restore_memory()?;
        }
        if let Some(file) = self.file.take() {
            let mut file = file;
            file.set_delete_on_close(self.options.delete_on_resume);
            drop(file);
        }
        self.hc.resume()?;
        info!(uuid = %self.config.uuid, "vm resumed after save");
        Ok(())
    }

    /// Replay the page-batch section of the just-written file, restoring
    /// the frames the save released.
    fn restore_memory(&mut self) -> Result<()> {
        let offset = self.page_batch_offset;
        let f = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Resource("no completed save file".into()))?;
        f.seek(std::io::SeekFrom::Start(offset))?;
        let mut scratch = vec![0u8; MAX_BATCH as usize * PAGE_SIZE];
        let mut restored = 0u64;
        loop {
            let marker = f.read_i32()?;
            match marker {
                MARKER_END => break,
                MARKER_ZERO_BITMAP => {
                    // Zero frames were released along with the data
                    // frames; hand them back as shared-zero frames.
                    let zeros = ZeroBitmap::read_record(f)?;
                    let mut pfns = Vec::with_capacity(MAX_BATCH as usize);
                    for pfn in zeros.iter_set() {
                        pfns.push(pfn);
                        if pfns.len() == MAX_BATCH as usize {
                            self.hc.populate_on_demand(&pfns, false)?;
                            pfns.clear();
                        }
                    }
                    if !pfns.is_empty() {
                        self.hc.populate_on_demand(&pfns, false)?;
                    }
                }
                MARKER_PAGE_OFFSETS => PageOffsetIndex::skip_record(f)?,
                m if m > 0 => {
                    let (count, mode) = crate::format::decode_batch_marker(m)?;
                    let mut pfns = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        pfns.push(f.read_u32()?);
                    }
                    let (data, stored) = read_batch_payload(f, &pfns, mode)?;
                    let len = decompress_batch(&data, stored, &pfns, &mut scratch)?;
                    self.hc.copy_into_frames(&pfns, &scratch[..len])?;
                    restored += count as u64;
                }
                m => return Err(FormatError::UnknownMarker(m).into()),
            }
        }
        debug!(pages = restored, "memory restored from save file");
        Ok(())
    }
}

/// Read one batch payload; resolves the bulk "stored raw" sentinel to a
/// raw payload.
pub(crate) fn read_batch_payload(
    f: &mut FileBuf,
    pfns: &[u32],
    mode: BatchMode,
) -> Result<(Vec<u8>, BatchMode)> {
    match mode {
        BatchMode::Raw => {
            let mut data = vec![0u8; pfns.len() * PAGE_SIZE];
            f.read_exact(&mut data)?;
            Ok((data, BatchMode::Raw))
        }
        BatchMode::BulkLz4 => {
            let csize = f.read_u32()?;
            if csize == BULK_STORED_RAW {
                let mut data = vec![0u8; pfns.len() * PAGE_SIZE];
                f.read_exact(&mut data)?;
                Ok((data, BatchMode::Raw))
            } else {
                if csize as usize > block::get_maximum_output_size(pfns.len() * PAGE_SIZE) {
                    return Err(FormatError::InvalidSize {
                        record: "page-batch",
                        size: csize as u64,
                    }
                    .into());
                }
                let mut data = vec![0u8; csize as usize];
                f.read_exact(&mut data)?;
                Ok((data, BatchMode::BulkLz4))
            }
        }
        BatchMode::PerPageLz4 => {
            let size = f.read_u32()?;
            if size as usize > pfns.len() * (2 + PAGE_SIZE) {
                return Err(FormatError::InvalidSize {
                    record: "page-batch",
                    size: size as u64,
                }
                .into());
            }
            let mut data = vec![0u8; size as usize];
            f.read_exact(&mut data)?;
            Ok((data, BatchMode::PerPageLz4))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FrameState, MockDeviceModel, MockHypervisor};
    use tempfile::tempdir;

    fn session(
        dir: &std::path::Path,
        hv: &Arc<MockHypervisor>,
        mem_mb: u32,
        options: SaveOptions,
    ) -> VmSaveSession {
        let config = VmConfig::new(Uuid::new_v4(), mem_mb);
        let path = dir.join(save_file_name(&config.uuid));
        VmSaveSession::new(
            path,
            config,
            options,
            Arc::clone(hv) as Arc<dyn Hypercalls>,
            Arc::new(MockDeviceModel::new()) as Arc<dyn DeviceModel>,
        )
    }

    #[test]
    fn save_suspends_and_writes_file() {
        let dir = tempdir().unwrap();
        let hv = Arc::new(MockHypervisor::new(256));
        hv.fill_random(3, 42);
        let mut s = session(dir.path(), &hv, 1, SaveOptions::default());
        s.save().unwrap();
        assert!(hv.is_suspended());
        assert!(s.path().exists());
    }

    #[test]
    fn all_zero_normal_pages_are_rezeroed_when_memory_is_kept() {
        let dir = tempdir().unwrap();
        let hv = Arc::new(MockHypervisor::new(256));
        // Data frame that happens to contain only zeros.
        hv.set_page(5, &vec![0u8; PAGE_SIZE]);
        hv.fill_random(6, 7);
        let mut s = session(
            dir.path(),
            &hv,
            1,
            SaveOptions::default().with_free_mem(false),
        );
        s.save().unwrap();
        // The zero data frame was handed back as a shared-zero frame.
        assert_eq!(hv.frame_state(5), FrameState::Zero);
        // The data frame keeps its contents: nothing was released.
        assert!(matches!(hv.frame_state(6), FrameState::Data(_)));
    }

    #[test]
    fn freed_zero_frames_stay_released_until_resume() {
        let dir = tempdir().unwrap();
        let hv = Arc::new(MockHypervisor::new(256));
        hv.set_page(5, &vec![0u8; PAGE_SIZE]);
        hv.fill_random(6, 7);
        let expect = hv.read_page(6);
        let mut s = session(dir.path(), &hv, 1, SaveOptions::default());
        s.save().unwrap();
        // The capture released the frame; repopulating it now would undo
        // the memory the save just gave back.
        assert_eq!(hv.frame_state(5), FrameState::Pod);
        s.resume().unwrap();
        assert_eq!(hv.frame_state(5), FrameState::Zero);
        assert_eq!(hv.read_page(6), expect);
    }

    #[test]
    fn trailer_ends_with_a_single_index_pointer() {
        let dir = tempdir().unwrap();
        let hv = Arc::new(MockHypervisor::new(256));
        hv.fill_random(9, 17);
        let mut s = session(dir.path(), &hv, 1, SaveOptions::default());
        s.save().unwrap();

        let bytes = std::fs::read(s.path()).unwrap();
        let len = bytes.len();
        let ptr = IndexPtr::from_bytes(&bytes[len - IndexPtr::SIZE..]).unwrap();
        assert_eq!(ptr.marker, MARKER_PAGE_OFFSETS);
        // Exactly one pointer: the record before it is the end marker.
        let end = i32::from_le_bytes(
            bytes[len - IndexPtr::SIZE - 4..len - IndexPtr::SIZE]
                .try_into()
                .unwrap(),
        );
        assert_eq!(end, MARKER_END);
        let at = i32::from_le_bytes(
            bytes[ptr.offset as usize..ptr.offset as usize + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(at, MARKER_PAGE_OFFSETS);
    }

    #[test]
    fn index_covers_exactly_the_data_frames() {
        for compress in [CompressMode::None, CompressMode::Lz4PerPage] {
            let dir = tempdir().unwrap();
            let hv = Arc::new(MockHypervisor::new(256));
            for pfn in 20..40 {
                hv.fill_random(pfn, pfn * 7 + 3);
            }
            // A zero data frame gets rezeroed, not indexed.
            hv.set_page(50, &vec![0u8; PAGE_SIZE]);
            let expect: Vec<Vec<u8>> = (20..40).map(|p| hv.read_page(p)).collect();

            let mut s = session(
                dir.path(),
                &hv,
                1,
                SaveOptions::default()
                    .with_compress(compress)
                    .with_free_mem(false),
            );
            s.save().unwrap();

            let mut info = crate::lazy::LazyLoadInfo::from_file(s.path()).unwrap();
            let mut page = vec![0u8; PAGE_SIZE];
            for pfn in 0..256u32 {
                let n = info.lazy_load_page(pfn, &mut page, false).unwrap();
                if (20..40).contains(&pfn) {
                    assert_eq!(n, PAGE_SIZE, "pfn {pfn} missing from index");
                    assert_eq!(page, expect[(pfn - 20) as usize]);
                } else {
                    assert_eq!(n, 0, "pfn {pfn} unexpectedly indexed");
                }
            }
        }
    }

    #[test]
    fn abort_mid_loop_fails_save_and_deletes_file() {
        let dir = tempdir().unwrap();
        let hv = Arc::new(MockHypervisor::new(4096));
        for pfn in 0..64 {
            hv.fill_random(pfn, pfn);
        }
        let mut s = session(dir.path(), &hv, 16, SaveOptions::default());
        s.abort_handle().store(true, Ordering::SeqCst);
        let path = s.path().to_path_buf();
        assert!(matches!(s.save(), Err(Error::Aborted)));
        // delete-on-close: the partial file is gone once the session drops
        // its handle (save() drops it on the error path).
        assert!(!path.exists());
    }

    #[test]
    fn resume_restores_released_memory() {
        let dir = tempdir().unwrap();
        let hv = Arc::new(MockHypervisor::new(256));
        for pfn in 10..20 {
            hv.fill_random(pfn, pfn * 3 + 1);
        }
        let expect: Vec<Vec<u8>> = (10..20).map(|p| hv.read_page(p)).collect();

        let mut s = session(
            dir.path(),
            &hv,
            1,
            SaveOptions::default().with_delete_on_resume(true),
        );
        s.save().unwrap();
        for pfn in 10..20 {
            assert_eq!(hv.frame_state(pfn), FrameState::Pod);
        }
        let path = s.path().to_path_buf();
        s.resume().unwrap();
        assert!(hv.is_resumed());
        assert!(!path.exists());
        for (i, pfn) in (10..20).enumerate() {
            assert_eq!(hv.read_page(pfn), expect[i]);
        }
    }

    #[test]
    fn resume_keeps_file_when_asked() {
        let dir = tempdir().unwrap();
        let hv = Arc::new(MockHypervisor::new(256));
        hv.fill_random(1, 99);
        let mut s = session(
            dir.path(),
            &hv,
            1,
            SaveOptions::default().with_delete_on_resume(false),
        );
        s.save().unwrap();
        let path = s.path().to_path_buf();
        s.resume().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn dm_state_is_readable_from_open_file() {
        let dir = tempdir().unwrap();
        let hv = Arc::new(MockHypervisor::new(64));
        let dm = Arc::new(MockDeviceModel::new());
        dm.set_state(vec![0xaa, 0xbb, 0xcc, 0xdd]);
        let config = VmConfig::new(Uuid::new_v4(), 1);
        let mut s = VmSaveSession::new(
            dir.path().join("dm.save"),
            config,
            SaveOptions::default(),
            Arc::clone(&hv) as Arc<dyn Hypercalls>,
            Arc::clone(&dm) as Arc<dyn DeviceModel>,
        );
        s.save().unwrap();
        let mut buf = [0u8; 2];
        s.read_dm_state_at(1, &mut buf).unwrap();
        assert_eq!(buf, [0xbb, 0xcc]);
    }
}
