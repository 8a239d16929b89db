//! In-memory test doubles for the hypervisor call layer and the device
//! model.
//!
//! [`MockHypervisor`] models guest physical memory as a vector of frame
//! states with the same classification the real call layer reports
//! (normal, shared-zero, populate-on-demand), so save/restore round trips
//! can run entirely in memory. [`MockDeviceModel`] records everything the
//! engine asks of it for later assertion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use lz4_flex::block;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::HypercallError;
use crate::format::PAGE_SIZE;
use crate::hypercall::{
    DeviceModel, HcResult, Hypercalls, HvmParam, MapcacheParams, PageKind, TscInfo, VcpuInfo,
};

/// Backing state of one mock guest frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameState {
    /// Frame holds data.
    Data(Vec<u8>),
    /// Shared zero frame.
    Zero,
    /// Populate-on-demand (unpopulated or template-backed).
    Pod,
}

/// In-memory hypervisor.
pub struct MockHypervisor {
    frames: Mutex<Vec<FrameState>>,
    params: Mutex<HashMap<HvmParam, u64>>,
    context: Mutex<Vec<u8>>,
    tsc: Mutex<TscInfo>,
    vcpus: Mutex<VcpuInfo>,
    templates: Mutex<HashMap<Uuid, Vec<FrameState>>>,
    identity: Mutex<Option<Uuid>>,
    shared_info: Mutex<Option<u64>>,
    lazy_pfns: Mutex<Vec<u32>>,
    populate_delay: Mutex<Option<std::time::Duration>>,
    suspended: AtomicBool,
    resumed: AtomicBool,
}

impl MockHypervisor {
    /// A guest with `p2m_size` frames, all initially zero.
    pub fn new(p2m_size: u32) -> Self {
        Self {
            frames: Mutex::new(vec![FrameState::Zero; p2m_size as usize]),
            params: Mutex::new(HashMap::new()),
            context: Mutex::new(vec![0xc7; 64]),
            tsc: Mutex::new(TscInfo {
                mode: 1,
                nsec: 123_456_789,
                khz: 2_400_000,
                incarnation: 1,
            }),
            vcpus: Mutex::new(VcpuInfo {
                max_vcpu_id: 0,
                online: 0x1,
            }),
            templates: Mutex::new(HashMap::new()),
            identity: Mutex::new(None),
            shared_info: Mutex::new(None),
            lazy_pfns: Mutex::new(Vec::new()),
            populate_delay: Mutex::new(None),
            suspended: AtomicBool::new(false),
            resumed: AtomicBool::new(false),
        }
    }

    /// Write page data into a frame.
    pub fn set_page(&self, pfn: u32, data: &[u8]) {
        assert_eq!(data.len(), PAGE_SIZE);
        self.frames.lock()[pfn as usize] = FrameState::Data(data.to_vec());
    }

    /// Fill a frame with deterministic pseudo-random bytes.
    pub fn fill_random(&self, pfn: u32, seed: u32) {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut x = seed.wrapping_mul(2654435761).wrapping_add(1);
        for b in page.iter_mut() {
            x = x.wrapping_mul(1664525).wrapping_add(1013904223);
            *b = (x >> 24) as u8;
        }
        self.set_page(pfn, &page);
    }

    /// Current content of a frame; zero and POD frames read as zeros.
    pub fn read_page(&self, pfn: u32) -> Vec<u8> {
        match &self.frames.lock()[pfn as usize] {
            FrameState::Data(d) => d.clone(),
            FrameState::Zero | FrameState::Pod => vec![0u8; PAGE_SIZE],
        }
    }

    /// Backing state of a frame.
    pub fn frame_state(&self, pfn: u32) -> FrameState {
        self.frames.lock()[pfn as usize].clone()
    }

    /// Register a template the mock can clone from.
    pub fn register_template(&self, uuid: Uuid, frames: Vec<FrameState>) {
        self.templates.lock().insert(uuid, frames);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> Option<Uuid> {
        *self.identity.lock()
    }

    pub fn shared_info_pfn(&self) -> Option<u64> {
        *self.shared_info.lock()
    }

    /// Frames marked for lazy first-touch fill.
    pub fn lazy_pfns(&self) -> Vec<u32> {
        self.lazy_pfns.lock().clone()
    }

    /// Make `populate_from_buffer` sleep, to exercise backpressure.
    pub fn set_populate_delay(&self, delay: std::time::Duration) {
        *self.populate_delay.lock() = Some(delay);
    }

    pub fn set_tsc(&self, tsc: TscInfo) {
        *self.tsc.lock() = tsc;
    }

    pub fn set_vcpus(&self, vcpus: VcpuInfo) {
        *self.vcpus.lock() = vcpus;
    }

    pub fn set_context(&self, context: Vec<u8>) {
        *self.context.lock() = context;
    }
}

impl Hypercalls for MockHypervisor {
    fn suspend(&self) -> HcResult<()> {
        self.suspended.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> HcResult<()> {
        self.resumed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn p2m_size(&self) -> HcResult<u32> {
        Ok(self.frames.lock().len() as u32)
    }

    fn tsc_info(&self) -> HcResult<TscInfo> {
        Ok(self.tsc.lock().clone())
    }

    fn set_tsc_info(&self, info: &TscInfo) -> HcResult<()> {
        *self.tsc.lock() = info.clone();
        Ok(())
    }

    fn vcpu_info(&self) -> HcResult<VcpuInfo> {
        Ok(self.vcpus.lock().clone())
    }

    fn hvm_param(&self, param: HvmParam) -> HcResult<u64> {
        Ok(self.params.lock().get(&param).copied().unwrap_or(0))
    }

    fn set_hvm_param(&self, param: HvmParam, value: u64) -> HcResult<()> {
        self.params.lock().insert(param, value);
        Ok(())
    }

    fn hvm_context(&self) -> HcResult<Vec<u8>> {
        Ok(self.context.lock().clone())
    }

    fn set_hvm_context(&self, context: &[u8]) -> HcResult<()> {
        *self.context.lock() = context.to_vec();
        Ok(())
    }

    fn capture_pages(
        &self,
        first_pfn: u32,
        count: u32,
        release: bool,
        buf: &mut [u8],
    ) -> HcResult<Vec<PageKind>> {
        let mut frames = self.frames.lock();
        let mut kinds = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let pfn = first_pfn as usize + i;
            let frame = frames
                .get(pfn)
                .cloned()
                .ok_or_else(|| HypercallError::new("capture_pages", -14))?;
            match frame {
                FrameState::Data(d) => {
                    buf[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].copy_from_slice(&d);
                    kinds.push(PageKind::Normal);
                    if release {
                        frames[pfn] = FrameState::Pod;
                    }
                }
                FrameState::Zero => kinds.push(PageKind::Zero),
                FrameState::Pod => kinds.push(PageKind::Pod),
            }
        }
        Ok(kinds)
    }

    fn populate_on_demand(&self, pfns: &[u32], lazy: bool) -> HcResult<()> {
        let mut frames = self.frames.lock();
        for &pfn in pfns {
            if pfn as usize >= frames.len() {
                return Err(HypercallError::new("populate_on_demand", -14));
            }
            frames[pfn as usize] = FrameState::Zero;
        }
        if lazy {
            self.lazy_pfns.lock().extend_from_slice(pfns);
        }
        Ok(())
    }

    fn copy_into_frames(&self, pfns: &[u32], data: &[u8]) -> HcResult<()> {
        if data.len() != pfns.len() * PAGE_SIZE {
            return Err(HypercallError::new("copy_into_frames", -22));
        }
        let mut frames = self.frames.lock();
        for (i, &pfn) in pfns.iter().enumerate() {
            frames[pfn as usize] =
                FrameState::Data(data[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].to_vec());
        }
        Ok(())
    }

    fn populate_from_buffer(&self, pfns: &[u32], buf: &[u8], compressed: bool) -> HcResult<()> {
        if let Some(delay) = *self.populate_delay.lock() {
            std::thread::sleep(delay);
        }
        if !compressed {
            return self.copy_into_frames(pfns, buf);
        }
        // Per-page stream: u16 length prefix, page-sized means raw.
        let mut frames = self.frames.lock();
        let mut pos = 0usize;
        for &pfn in pfns {
            if buf.len() < pos + 2 {
                return Err(HypercallError::new("populate_from_buffer", -22));
            }
            let size = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
            pos += 2;
            if size > PAGE_SIZE || buf.len() < pos + size {
                return Err(HypercallError::new("populate_from_buffer", -22));
            }
            let page = if size == PAGE_SIZE {
                buf[pos..pos + size].to_vec()
            } else {
                let mut page = vec![0u8; PAGE_SIZE];
                let n = block::decompress_into(&buf[pos..pos + size], &mut page)
                    .map_err(|_| HypercallError::new("populate_from_buffer", -22))?;
                if n != PAGE_SIZE {
                    return Err(HypercallError::new("populate_from_buffer", -22));
                }
                page
            };
            frames[pfn as usize] = FrameState::Data(page);
            pos += size;
        }
        Ok(())
    }

    fn clone_physmap(&self, template_uuid: &Uuid) -> HcResult<()> {
        let templates = self.templates.lock();
        let template = templates
            .get(template_uuid)
            .ok_or_else(|| HypercallError::new("clone_physmap", -2))?;
        let mut frames = self.frames.lock();
        frames.clear();
        // Cloned frames start populate-on-demand regardless of template
        // content; data stays with the template.
        frames.extend(template.iter().map(|f| match f {
            FrameState::Zero => FrameState::Zero,
            _ => FrameState::Pod,
        }));
        Ok(())
    }

    fn set_identity(&self, uuid: &Uuid) -> HcResult<()> {
        *self.identity.lock() = Some(*uuid);
        Ok(())
    }

    fn clear_page(&self, pfn: u64) -> HcResult<()> {
        let mut frames = self.frames.lock();
        if pfn as usize >= frames.len() {
            return Err(HypercallError::new("clear_page", -14));
        }
        frames[pfn as usize] = FrameState::Zero;
        Ok(())
    }

    fn map_shared_info(&self, pfn: u64) -> HcResult<()> {
        *self.shared_info.lock() = Some(pfn);
        Ok(())
    }
}

/// Device-model double: serves a fixed state blob and records restore
/// calls.
pub struct MockDeviceModel {
    state: Mutex<Vec<u8>>,
    loaded_state: Mutex<Option<Vec<u8>>>,
    mapcache: Mutex<MapcacheParams>,
    init_mapcache_args: Mutex<Option<(Option<MapcacheParams>, u32)>>,
    clock_resynced: AtomicBool,
    dmreq_initialized: AtomicBool,
}

impl MockDeviceModel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(vec![0xd1; 48]),
            loaded_state: Mutex::new(None),
            mapcache: Mutex::new(MapcacheParams {
                end_low_pfn: 0x100,
                start_high_pfn: 0x200,
                end_high_pfn: 0x300,
            }),
            init_mapcache_args: Mutex::new(None),
            clock_resynced: AtomicBool::new(false),
            dmreq_initialized: AtomicBool::new(false),
        }
    }

    pub fn set_state(&self, state: Vec<u8>) {
        *self.state.lock() = state;
    }

    pub fn loaded_state(&self) -> Option<Vec<u8>> {
        self.loaded_state.lock().clone()
    }

    pub fn clock_resynced(&self) -> bool {
        self.clock_resynced.load(Ordering::SeqCst)
    }

    pub fn dmreq_initialized(&self) -> bool {
        self.dmreq_initialized.load(Ordering::SeqCst)
    }

    pub fn init_mapcache_args(&self) -> Option<(Option<MapcacheParams>, u32)> {
        self.init_mapcache_args.lock().clone()
    }
}

impl Default for MockDeviceModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceModel for MockDeviceModel {
    fn save_state(&self) -> HcResult<Vec<u8>> {
        Ok(self.state.lock().clone())
    }

    fn load_state(&self, state: &[u8]) -> HcResult<()> {
        *self.loaded_state.lock() = Some(state.to_vec());
        Ok(())
    }

    fn resync_clock(&self) -> HcResult<()> {
        self.clock_resynced.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn mapcache_params(&self) -> MapcacheParams {
        self.mapcache.lock().clone()
    }

    fn init_mapcache(&self, params: Option<&MapcacheParams>, mem_mb: u32) -> HcResult<()> {
        *self.init_mapcache_args.lock() = Some((params.cloned(), mem_mb));
        Ok(())
    }

    fn init_dmreq(&self) -> HcResult<()> {
        self.dmreq_initialized.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_classifies_and_releases() {
        let hv = MockHypervisor::new(8);
        hv.set_page(1, &vec![7u8; PAGE_SIZE]);
        let mut buf = vec![0u8; 3 * PAGE_SIZE];
        let kinds = hv.capture_pages(0, 3, true, &mut buf).unwrap();
        assert_eq!(kinds, vec![PageKind::Zero, PageKind::Normal, PageKind::Zero]);
        assert_eq!(&buf[PAGE_SIZE..2 * PAGE_SIZE], &vec![7u8; PAGE_SIZE][..]);
        // Released frame loses its backing.
        assert_eq!(hv.frame_state(1), FrameState::Pod);
    }

    #[test]
    fn compressed_populate_inflates() {
        let hv = MockHypervisor::new(4);
        let page = vec![9u8; PAGE_SIZE];
        let mut c = vec![0u8; block::get_maximum_output_size(PAGE_SIZE)];
        let n = block::compress_into(&page, &mut c).unwrap();
        let mut stream = Vec::new();
        stream.extend_from_slice(&(n as u16).to_le_bytes());
        stream.extend_from_slice(&c[..n]);
        hv.populate_from_buffer(&[2], &stream, true).unwrap();
        assert_eq!(hv.read_page(2), page);
    }

    #[test]
    fn clone_physmap_marks_template_data_pod() {
        let hv = MockHypervisor::new(4);
        let uuid = Uuid::new_v4();
        hv.register_template(
            uuid,
            vec![
                FrameState::Data(vec![1u8; PAGE_SIZE]),
                FrameState::Zero,
                FrameState::Pod,
            ],
        );
        hv.clone_physmap(&uuid).unwrap();
        assert_eq!(hv.frame_state(0), FrameState::Pod);
        assert_eq!(hv.frame_state(1), FrameState::Zero);
        assert_eq!(hv.frame_state(2), FrameState::Pod);
    }
}
