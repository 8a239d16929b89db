//! Load pipeline: reconstruct a VM from a save file.
//!
//! The record stream is consumed front to back. Metadata records are
//! buffered and applied in a fixed order only after every queued page
//! batch has drained, so partially restored memory is never visible to a
//! running guest. Page batches are populated by one of three strategies:
//! demand-populate and skip (lazy), map-and-copy (raw), or hand off to
//! the decompression pool which populates from its staging buffer.
//!
//! Template restores populate memory for future clones, set the identity
//! handle, and stop there. Clone restores attach to a template's physical
//! map on the first memory record; a first-generation clone (a file with
//! no template lineage of its own) needs no memory replay at all.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{RestoreOptions, VmConfig};
use crate::decompress::{
    decompress_batch, validate_per_page_stream, DecompressJob, DecompressPool,
};
use crate::error::{Error, Result};
use crate::filebuf::FileBuf;
use crate::format::{
    decode_batch_marker, uuid_from_bytes, BatchMode, FormatError, MagicPfnsRecord,
    MapcacheRecord, TscRecord, VcpuRecord, BULK_STORED_RAW, MARKER_END, MARKER_HVM_ACPI_IOPORTS,
    MARKER_HVM_CONSOLE_PFN, MARKER_HVM_CONTEXT, MARKER_HVM_DM, MARKER_HVM_IDENT_PT,
    MARKER_HVM_MAGIC_PFNS, MARKER_HVM_VM86_TSS, MARKER_MAPCACHE_PARAMS, MARKER_PAGE_OFFSETS,
    MARKER_TEMPLATE_FILE, MARKER_TEMPLATE_UUID, MARKER_TSC_INFO, MARKER_VCPU_INFO,
    MARKER_VERSION, MARKER_VM_UUID, MARKER_ZERO_BITMAP, MAX_BATCH, PAGE_SIZE,
    SAVE_FORMAT_VERSION,
};
use crate::hypercall::{DeviceModel, HvmParam, Hypercalls};
use crate::lazy::LazyLoadInfo;
use crate::pagemap::{in_pci_hole, PageOffsetIndex, ZeroBitmap};
use uuid::Uuid;

/// What kind of VM the file is being restored into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Ordinary restore of a saved VM.
    Normal,
    /// Load the file as a read-only template image backing future clones.
    Template,
    /// Restore a VM cloned from a template.
    Clone,
}

/// Metadata records buffered until the stream ends.
#[derive(Default)]
struct Pending {
    tsc: Option<TscRecord>,
    vcpus: Option<VcpuRecord>,
    ident_pt: Option<u64>,
    vm86_tss: Option<u64>,
    console_pfn: Option<u64>,
    acpi_ioports: Option<u64>,
    magic: Option<MagicPfnsRecord>,
    context: Option<Vec<u8>>,
    dm_state: Vec<u8>,
    vm_uuid: Option<Uuid>,
    template_uuid: Option<Uuid>,
    mapcache: Option<MapcacheRecord>,
    template_file: Option<PathBuf>,
}

/// One restore of a save file into a VM.
pub struct VmRestoreSession {
    path: PathBuf,
    mode: RestoreMode,
    config: VmConfig,
    options: RestoreOptions,
    hc: Arc<dyn Hypercalls>,
    dm: Arc<dyn DeviceModel>,
}

impl VmRestoreSession {
    pub fn new(
        path: impl Into<PathBuf>,
        mode: RestoreMode,
        config: VmConfig,
        options: RestoreOptions,
        hc: Arc<dyn Hypercalls>,
        dm: Arc<dyn DeviceModel>,
    ) -> Self {
        Self {
            path: path.into(),
            mode,
            config,
            options,
            hc,
            dm,
        }
    }

    /// Consume the record stream and restore memory and metadata.
    ///
    /// The returned [`LoadedVm`] still holds the device-model blob;
    /// [`LoadedVm::finish`] replays it once the caller is ready.
    pub fn load(self) -> Result<LoadedVm> {
        info!(
            path = %self.path.display(),
            mode = ?self.mode,
            lazy = self.options.lazy,
            "loading vm"
        );
        let mut f = FileBuf::open(&self.path)?;

        // The version record must come first and exactly once.
        let marker = f.read_i32()?;
        if marker != MARKER_VERSION {
            return Err(FormatError::MissingVersion(marker).into());
        }
        let version = f.read_u32()?;
        if version != SAVE_FORMAT_VERSION {
            return Err(FormatError::VersionMismatch(version).into());
        }

        let populate_compressed = self
            .options
            .populate_compressed
            .unwrap_or(self.mode == RestoreMode::Template);
        let pool = if self.options.threaded_decompress && !self.options.lazy {
            Some(DecompressPool::new(Arc::clone(&self.hc))?)
        } else {
            None
        };
        let mut restorer = PageRestorer {
            hc: Arc::clone(&self.hc),
            pool,
            scratch: vec![0u8; MAX_BATCH as usize * PAGE_SIZE],
            lazy_enabled: self.options.lazy,
            populate_compressed,
            skip_memory: false,
            memory_touched: false,
            pages_restored: 0,
        };
        let mut pending = Pending::default();

        loop {
            let marker = f.read_i32()?;
            match marker {
                MARKER_END => break,
                MARKER_TSC_INFO => {
                    let mut buf = [0u8; TscRecord::SIZE];
                    f.read_exact(&mut buf)?;
                    pending.tsc = Some(TscRecord::from_bytes(&buf)?);
                }
                MARKER_VCPU_INFO => {
                    let mut buf = [0u8; VcpuRecord::SIZE];
                    f.read_exact(&mut buf)?;
                    pending.vcpus = Some(VcpuRecord::from_bytes(&buf)?);
                }
                MARKER_HVM_IDENT_PT => pending.ident_pt = Some(f.read_u64()?),
                MARKER_HVM_VM86_TSS => pending.vm86_tss = Some(f.read_u64()?),
                MARKER_HVM_CONSOLE_PFN => pending.console_pfn = Some(f.read_u64()?),
                MARKER_HVM_ACPI_IOPORTS => pending.acpi_ioports = Some(f.read_u64()?),
                MARKER_HVM_MAGIC_PFNS => {
                    let mut buf = [0u8; MagicPfnsRecord::SIZE];
                    f.read_exact(&mut buf)?;
                    pending.magic = Some(MagicPfnsRecord::from_bytes(&buf)?);
                }
                MARKER_HVM_CONTEXT => {
                    pending.context = Some(read_sized_blob(&mut f, "hvm-context")?);
                }
                MARKER_HVM_DM => {
                    pending.dm_state = read_sized_blob(&mut f, "hvm-dm")?;
                }
                MARKER_VM_UUID => {
                    let mut buf = [0u8; 16];
                    f.read_exact(&mut buf)?;
                    pending.vm_uuid = Some(uuid_from_bytes(&buf)?);
                }
                MARKER_TEMPLATE_UUID => {
                    let mut buf = [0u8; 16];
                    f.read_exact(&mut buf)?;
                    pending.template_uuid = Some(uuid_from_bytes(&buf)?);
                }
                MARKER_MAPCACHE_PARAMS => {
                    let mut buf = [0u8; MapcacheRecord::SIZE];
                    f.read_exact(&mut buf)?;
                    pending.mapcache = Some(MapcacheRecord::from_bytes(&buf)?);
                }
                MARKER_TEMPLATE_FILE => {
                    let len = f.read_u16()? as usize;
                    let mut buf = vec![0u8; len];
                    f.read_exact(&mut buf)?;
                    pending.template_file =
                        Some(PathBuf::from(String::from_utf8_lossy(&buf).into_owned()));
                    // This file's pages sit on top of a template; demand
                    // loads must come from the template file, so batches
                    // here are replayed eagerly.
                    restorer.lazy_enabled = false;
                }
                MARKER_PAGE_OFFSETS => PageOffsetIndex::skip_record(&mut f)?,
                MARKER_ZERO_BITMAP => {
                    self.touch_memory(&mut restorer, &pending)?;
                    if restorer.skip_memory {
                        ZeroBitmap::skip_record(&mut f)?;
                    } else {
                        let bitmap = ZeroBitmap::read_record(&mut f)?;
                        restorer.populate_zero(&bitmap)?;
                    }
                }
                m if m > 0 => {
                    self.touch_memory(&mut restorer, &pending)?;
                    restorer.load_batch(&mut f, m)?;
                }
                m => return Err(FormatError::UnknownMarker(m).into()),
            }
        }

        // Every queued batch must land before metadata touches the guest.
        if let Some(pool) = &restorer.pool {
            pool.drain()?;
        }
        let pages_restored = restorer.pages_restored;

        if self.mode == RestoreMode::Template {
            let identity = pending.vm_uuid.unwrap_or(self.config.uuid);
            self.hc.set_identity(&identity)?;
            info!(uuid = %identity, pages = pages_restored, "template loaded");
            return Ok(LoadedVm {
                mode: self.mode,
                dm_state: pending.dm_state,
                lazy: None,
                template_file: pending.template_file,
                pages_restored,
                dm: self.dm,
            });
        }

        self.dm
            .init_mapcache(pending.mapcache.as_ref(), self.config.mem_mb)?;
        self.apply_metadata(&pending)?;

        // A file with template lineage serves demand loads from the
        // template image, not from itself.
        let lazy = if let Some(template_file) = &pending.template_file {
            Some(LazyLoadInfo::from_file(template_file)?)
        } else if self.options.lazy && restorer.lazy_enabled {
            Some(LazyLoadInfo::from_file(&self.path)?)
        } else {
            None
        };
        if let Some(vcpus) = &pending.vcpus {
            debug!(max_vcpu_id = vcpus.max_vcpu_id, online = vcpus.online, "vcpu info");
        }
        info!(pages = pages_restored, lazy = lazy.is_some(), "vm loaded");
        Ok(LoadedVm {
            mode: self.mode,
            dm_state: pending.dm_state,
            lazy,
            template_file: pending.template_file.or_else(|| {
                restorer.first_generation_template_file(&self.path)
            }),
            pages_restored,
            dm: self.dm,
        })
    }

    /// Clone restores attach to the template's physical map just before
    /// the first memory record.
    fn touch_memory(&self, restorer: &mut PageRestorer, pending: &Pending) -> Result<()> {
        if restorer.memory_touched {
            return Ok(());
        }
        restorer.memory_touched = true;
        if self.mode != RestoreMode::Clone {
            return Ok(());
        }
        match pending.template_uuid {
            Some(template_uuid) => {
                self.hc.clone_physmap(&template_uuid)?;
                debug!(template = %template_uuid, "cloned physical map");
            }
            None => {
                // First-generation clone: the file itself is the template;
                // every frame comes from it on demand.
                let template = pending.vm_uuid.unwrap_or(self.config.uuid);
                self.hc.clone_physmap(&template)?;
                restorer.skip_memory = true;
                debug!(template = %template, "first-generation clone, memory replay skipped");
            }
        }
        Ok(())
    }

    /// Deferred metadata application, fixed order.
    fn apply_metadata(&self, pending: &Pending) -> Result<()> {
        if let Some(tsc) = &pending.tsc {
            self.hc.set_tsc_info(tsc)?;
        }
        if let Some(ident_pt) = pending.ident_pt {
            self.hc.set_hvm_param(HvmParam::IdentPt, ident_pt)?;
        }
        if let Some(vm86_tss) = pending.vm86_tss {
            self.hc.set_hvm_param(HvmParam::Vm86Tss, vm86_tss)?;
        }
        if let Some(console_pfn) = pending.console_pfn {
            self.hc.clear_page(console_pfn)?;
            self.hc.set_hvm_param(HvmParam::ConsolePfn, console_pfn)?;
        }
        if let Some(acpi) = pending.acpi_ioports {
            self.hc.set_hvm_param(HvmParam::AcpiIoports, acpi)?;
        }
        if let Some(magic) = &pending.magic {
            self.hc.set_hvm_param(HvmParam::IoPfnFirst, magic.io_pfn_first)?;
            self.hc.set_hvm_param(HvmParam::IoPfnLast, magic.io_pfn_last)?;
            for pfn in magic.io_pfn_first..=magic.io_pfn_last {
                if pfn != 0 {
                    self.hc.clear_page(pfn)?;
                }
            }
            if magic.shared_info_pfn != 0 {
                self.hc.set_hvm_param(HvmParam::SharedInfoPfn, magic.shared_info_pfn)?;
                self.hc.map_shared_info(magic.shared_info_pfn)?;
            }
            if magic.dmreq_pfn != 0 {
                self.hc.clear_page(magic.dmreq_pfn)?;
                self.hc.set_hvm_param(HvmParam::DmreqPfn, magic.dmreq_pfn)?;
                self.hc
                    .set_hvm_param(HvmParam::DmreqVcpuPfn, magic.dmreq_vcpu_pfn)?;
                self.dm.init_dmreq()?;
            }
        }
        if let Some(context) = &pending.context {
            self.hc.set_hvm_context(context)?;
        }
        Ok(())
    }
}

/// A restored VM awaiting device-model replay.
pub struct LoadedVm {
    mode: RestoreMode,
    dm_state: Vec<u8>,
    lazy: Option<LazyLoadInfo>,
    template_file: Option<PathBuf>,
    pages_restored: u64,
    dm: Arc<dyn DeviceModel>,
}

impl LoadedVm {
    /// Replay the device-model state and resync the virtual clock. A
    /// template image has no device model to replay.
    pub fn finish(&self) -> Result<()> {
        if self.mode == RestoreMode::Template {
            return Ok(());
        }
        self.dm.load_state(&self.dm_state)?;
        self.dm.resync_clock()?;
        Ok(())
    }

    /// Lazy-load handle when the restore was lazy.
    pub fn lazy_info(&mut self) -> Option<&mut LazyLoadInfo> {
        self.lazy.as_mut()
    }

    /// Detach the lazy-load handle for the page-fault path to own.
    pub fn take_lazy_info(&mut self) -> Option<LazyLoadInfo> {
        self.lazy.take()
    }

    /// Template file recorded in (or implied by) the save file.
    pub fn template_file(&self) -> Option<&Path> {
        self.template_file.as_deref()
    }

    /// Pages materialized or demand-registered during the load.
    pub fn pages_restored(&self) -> u64 {
        self.pages_restored
    }
}

impl fmt::Debug for LoadedVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedVm")
            .field("mode", &self.mode)
            .field("dm_state_len", &self.dm_state.len())
            .field("lazy", &self.lazy.is_some())
            .field("template_file", &self.template_file)
            .field("pages_restored", &self.pages_restored)
            .finish()
    }
}

/// Page-batch population engine shared by the restore stream.
struct PageRestorer {
    hc: Arc<dyn Hypercalls>,
    pool: Option<DecompressPool>,
    scratch: Vec<u8>,
    lazy_enabled: bool,
    populate_compressed: bool,
    skip_memory: bool,
    memory_touched: bool,
    pages_restored: u64,
}

impl PageRestorer {
    /// Register every zero frame populate-on-demand, batched.
    fn populate_zero(&mut self, bitmap: &ZeroBitmap) -> Result<()> {
        let mut batch = Vec::with_capacity(MAX_BATCH as usize);
        for pfn in bitmap.iter_set() {
            batch.push(pfn);
            if batch.len() == MAX_BATCH as usize {
                self.hc.populate_on_demand(&batch, false)?;
                self.pages_restored += batch.len() as u64;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.hc.populate_on_demand(&batch, false)?;
            self.pages_restored += batch.len() as u64;
        }
        Ok(())
    }

    fn load_batch(&mut self, f: &mut FileBuf, marker: i32) -> Result<()> {
        let (count, mode) = decode_batch_marker(marker)?;
        let mut pfns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            pfns.push(f.read_u32()?);
        }

        if self.skip_memory {
            return skip_batch_payload(f, &pfns, mode);
        }

        // A batch touching the PCI hole cannot be demand-populated; once
        // seen, the rest of the load goes eager too.
        if self.lazy_enabled && pfns.iter().any(|&p| in_pci_hole(p)) {
            warn!(
                first_pfn = pfns[0],
                "batch intersects pci hole, lazy loading disabled"
            );
            self.lazy_enabled = false;
        }

        if self.lazy_enabled && matches!(mode, BatchMode::Raw | BatchMode::PerPageLz4) {
            self.hc.populate_on_demand(&pfns, true)?;
            skip_batch_payload(f, &pfns, mode)?;
            self.pages_restored += count as u64;
            return Ok(());
        }

        let (data, stored) = crate::save::read_batch_payload(f, &pfns, mode)?;
        match stored {
            BatchMode::Raw => {
                self.hc.copy_into_frames(&pfns, &data)?;
            }
            compressed => {
                if let Some(pool) = &self.pool {
                    pool.submit(DecompressJob {
                        pfns: pfns.clone(),
                        data,
                        mode: compressed,
                        populate_compressed: self.populate_compressed,
                    })?;
                } else if self.populate_compressed && compressed == BatchMode::PerPageLz4 {
                    validate_per_page_stream(&data, &pfns)?;
                    self.hc.populate_from_buffer(&pfns, &data, true)?;
                } else {
                    let len = decompress_batch(&data, compressed, &pfns, &mut self.scratch)?;
                    self.hc
                        .populate_from_buffer(&pfns, &self.scratch[..len], false)?;
                }
            }
        }
        self.pages_restored += count as u64;
        Ok(())
    }

    fn first_generation_template_file(&self, path: &Path) -> Option<PathBuf> {
        if self.skip_memory {
            Some(path.to_path_buf())
        } else {
            None
        }
    }
}

fn read_sized_blob(f: &mut FileBuf, record: &'static str) -> Result<Vec<u8>> {
    let size = f.read_u32()? as usize;
    // Metadata blobs are small; a huge size means a corrupt stream.
    if size > 64 << 20 {
        return Err(Error::from(FormatError::InvalidSize {
            record,
            size: size as u64,
        }));
    }
    let mut buf = vec![0u8; size];
    f.read_exact(&mut buf)?;
    Ok(buf)
}

/// Seek past a batch payload without reading it.
fn skip_batch_payload(f: &mut FileBuf, pfns: &[u32], mode: BatchMode) -> Result<()> {
    use std::io::SeekFrom;
    match mode {
        BatchMode::Raw => {
            f.seek(SeekFrom::Current((pfns.len() * PAGE_SIZE) as i64))?;
        }
        BatchMode::BulkLz4 => {
            let csize = f.read_u32()?;
            let len = if csize == BULK_STORED_RAW {
                (pfns.len() * PAGE_SIZE) as i64
            } else {
                csize as i64
            };
            f.seek(SeekFrom::Current(len))?;
        }
        BatchMode::PerPageLz4 => {
            let size = f.read_u32()?;
            f.seek(SeekFrom::Current(size as i64))?;
        }
    }
    Ok(())
}
