//! Consumed hypervisor and device-model primitives.
//!
//! The snapshot engine treats the hypervisor call layer and the device
//! model's own state serializer as opaque collaborators behind the
//! [`Hypercalls`] and [`DeviceModel`] traits. Production wires these to
//! the real call layer; tests use the in-memory implementations in
//! [`crate::testing`].

use uuid::Uuid;

use crate::error::HypercallError;
use crate::format::{MapcacheRecord, TscRecord, VcpuRecord};

/// Result of a consumed primitive.
pub type HcResult<T> = std::result::Result<T, HypercallError>;

/// TSC calibration values; same shape as the on-disk record.
pub type TscInfo = TscRecord;

/// vCPU topology; same shape as the on-disk record.
pub type VcpuInfo = VcpuRecord;

/// Mapcache memory-map bounds; same shape as the on-disk record.
pub type MapcacheParams = MapcacheRecord;

/// Scalar HVM parameters the engine saves and restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HvmParam {
    /// Identity page table address.
    IdentPt,
    /// vm86 TSS address.
    Vm86Tss,
    /// Console ring frame.
    ConsolePfn,
    /// ACPI io-port location.
    AcpiIoports,
    /// Shared-info frame.
    SharedInfoPfn,
    /// First io-request frame.
    IoPfnFirst,
    /// Last io-request frame.
    IoPfnLast,
    /// Device-model request frame.
    DmreqPfn,
    /// Per-vCPU device-model request frame.
    DmreqVcpuPfn,
}

/// Per-page classification returned by the capture primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Page holds data and was copied into the capture buffer.
    Normal,
    /// Page is a shared zero page; no data copied.
    Zero,
    /// Page is populate-on-demand / cloned from a template; no data copied.
    Pod,
}

/// The hypervisor call layer.
///
/// Page-data conventions: `capture_pages` classifies `count` consecutive
/// frames starting at `first_pfn` and copies each captured page into
/// `buf[i * PAGE_SIZE..]` for batch index `i` (slots of non-Normal pages
/// are left undefined). `populate_from_buffer` with `compressed` takes the
/// per-page stream of u16 size prefixes; otherwise whole raw pages.
pub trait Hypercalls: Send + Sync {
    /// Request the VM be suspended.
    fn suspend(&self) -> HcResult<()>;

    /// Resume the suspended VM.
    fn resume(&self) -> HcResult<()>;

    /// Number of guest frames in the physical map (max frame + 1).
    fn p2m_size(&self) -> HcResult<u32>;

    /// Read TSC calibration.
    fn tsc_info(&self) -> HcResult<TscInfo>;

    /// Restore TSC calibration.
    fn set_tsc_info(&self, info: &TscInfo) -> HcResult<()>;

    /// Read vCPU topology and online map.
    fn vcpu_info(&self) -> HcResult<VcpuInfo>;

    /// Read a scalar HVM parameter; 0 means unset.
    fn hvm_param(&self, param: HvmParam) -> HcResult<u64>;

    /// Restore a scalar HVM parameter.
    fn set_hvm_param(&self, param: HvmParam, value: u64) -> HcResult<()>;

    /// Capture the CPU/device HVM context blob.
    fn hvm_context(&self) -> HcResult<Vec<u8>>;

    /// Restore the CPU/device HVM context blob.
    fn set_hvm_context(&self, context: &[u8]) -> HcResult<()>;

    /// Capture and classify `count` frames starting at `first_pfn` into
    /// `buf`; `release` additionally returns the captured frames' backing
    /// memory to the host.
    fn capture_pages(
        &self,
        first_pfn: u32,
        count: u32,
        release: bool,
        buf: &mut [u8],
    ) -> HcResult<Vec<PageKind>>;

    /// Mark frames populate-on-demand; `lazy` additionally routes first
    /// touch to the device model for lazy file-backed fill.
    fn populate_on_demand(&self, pfns: &[u32], lazy: bool) -> HcResult<()>;

    /// Map frames writable and copy raw page data into them.
    fn copy_into_frames(&self, pfns: &[u32], data: &[u8]) -> HcResult<()>;

    /// Populate frames from a pinned buffer holding decompressed pages, or
    /// still-compressed pages when `compressed` (the hypervisor inflates).
    fn populate_from_buffer(&self, pfns: &[u32], buf: &[u8], compressed: bool) -> HcResult<()>;

    /// Clone the physical-memory map from a loaded template.
    fn clone_physmap(&self, template_uuid: &Uuid) -> HcResult<()>;

    /// Set the domain's identity handle (template load).
    fn set_identity(&self, uuid: &Uuid) -> HcResult<()>;

    /// Zero one guest frame.
    fn clear_page(&self, pfn: u64) -> HcResult<()>;

    /// Map the shared-info frame into the guest physical map.
    fn map_shared_info(&self, pfn: u64) -> HcResult<()>;
}

/// The device model's own serializer and restore hooks.
pub trait DeviceModel: Send + Sync {
    /// Capture CPU-independent device state as an opaque blob.
    fn save_state(&self) -> HcResult<Vec<u8>>;

    /// Replay a previously captured device-state blob.
    fn load_state(&self, state: &[u8]) -> HcResult<()>;

    /// Resynchronize the VM's virtual clock after restore.
    fn resync_clock(&self) -> HcResult<()>;

    /// Current mapcache bounds, for the mapcache-params record.
    fn mapcache_params(&self) -> MapcacheParams;

    /// Initialize the mapcache for restore; `params` is `None` when the
    /// save file predates the mapcache-params record, in which case the
    /// bounds derive from `mem_mb`.
    fn init_mapcache(&self, params: Option<&MapcacheParams>, mem_mb: u32) -> HcResult<()>;

    /// Initialize device-model request handling once the dmreq frames are
    /// in place.
    fn init_dmreq(&self) -> HcResult<()>;
}
