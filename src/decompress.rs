//! Batch decompression and the threaded decompression pool.
//!
//! The pool owns a fixed set of pinned staging buffers handed out as
//! exclusive leases. [`DecompressPool::submit`] blocks while every buffer
//! is leased, which bounds load-side memory no matter how fast the file
//! reader runs. Workers decompress into their leased buffer, populate the
//! target frames themselves, then return the lease. The first worker
//! error is kept and surfaced to the next `submit` or to [`drain`].
//!
//! [`drain`]: DecompressPool::drain

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use lz4_flex::block;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{DecompressError, Error, Result};
use crate::format::{BatchMode, MAX_BATCH, PAGE_SIZE};
use crate::hypercall::Hypercalls;

/// Number of pinned staging buffers.
pub const POOL_BUFFERS: usize = 2;
/// Number of worker threads.
pub const POOL_WORKERS: usize = 2;

/// Worst-case size of one batch's populate stream: every page raw behind
/// its length prefix.
const BUFFER_SIZE: usize = MAX_BATCH as usize * (2 + PAGE_SIZE);

/// Decompress one batch payload into `out`, returning the byte length
/// produced.
///
/// Per-page payloads are a walk of u16 length prefixes; a prefix equal to
/// the page size means that page is stored raw. Bulk payloads are a single
/// block covering the whole batch. Raw payloads copy through unchanged.
pub fn decompress_batch(
    data: &[u8],
    mode: BatchMode,
    pfns: &[u32],
    out: &mut [u8],
) -> std::result::Result<usize, DecompressError> {
    let expected = pfns.len() * PAGE_SIZE;
    match mode {
        BatchMode::Raw => {
            out[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
        BatchMode::BulkLz4 => {
            let produced = block::decompress_into(data, &mut out[..expected])?;
            if produced != expected {
                return Err(DecompressError::SizeMismatch {
                    first_pfn: pfns.first().copied().unwrap_or(0),
                    last_pfn: pfns.last().copied().unwrap_or(0),
                    produced,
                    expected,
                });
            }
            Ok(produced)
        }
        BatchMode::PerPageLz4 => {
            let mut pos = 0usize;
            for (i, &pfn) in pfns.iter().enumerate() {
                let (size, rest) = read_page_prefix(&data[pos..], pfn)?;
                pos += 2;
                let slot = &mut out[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
                if size == PAGE_SIZE {
                    slot.copy_from_slice(&rest[..PAGE_SIZE]);
                } else {
                    let produced = block::decompress_into(&rest[..size], slot)?;
                    if produced != PAGE_SIZE {
                        return Err(DecompressError::SizeMismatch {
                            first_pfn: pfn,
                            last_pfn: pfn,
                            produced,
                            expected: PAGE_SIZE,
                        });
                    }
                }
                pos += size;
            }
            if pos != data.len() {
                return Err(DecompressError::SizeMismatch {
                    first_pfn: pfns.first().copied().unwrap_or(0),
                    last_pfn: pfns.last().copied().unwrap_or(0),
                    produced: pos,
                    expected: data.len(),
                });
            }
            Ok(expected)
        }
    }
}

/// Walk a per-page stream without inflating it, checking every length
/// prefix. Returns the stream length consumed.
pub fn validate_per_page_stream(
    data: &[u8],
    pfns: &[u32],
) -> std::result::Result<usize, DecompressError> {
    let mut pos = 0usize;
    for &pfn in pfns {
        let (size, _) = read_page_prefix(&data[pos..], pfn)?;
        pos += 2 + size;
    }
    if pos != data.len() {
        return Err(DecompressError::SizeMismatch {
            first_pfn: pfns.first().copied().unwrap_or(0),
            last_pfn: pfns.last().copied().unwrap_or(0),
            produced: pos,
            expected: data.len(),
        });
    }
    Ok(pos)
}

fn read_page_prefix(data: &[u8], pfn: u32) -> std::result::Result<(usize, &[u8]), DecompressError> {
    if data.len() < 2 {
        return Err(DecompressError::Truncated {
            pfn,
            have: data.len(),
            need: 2,
        });
    }
    let size = u16::from_le_bytes([data[0], data[1]]) as usize;
    if size > PAGE_SIZE {
        return Err(DecompressError::InvalidPageSize {
            size: size as u16,
            pfn,
        });
    }
    let rest = &data[2..];
    if rest.len() < size {
        return Err(DecompressError::Truncated {
            pfn,
            have: rest.len(),
            need: size,
        });
    }
    Ok((size, rest))
}

/// One unit of work: a batch payload as read from the file.
pub struct DecompressJob {
    /// Frames the batch populates, in payload order.
    pub pfns: Vec<u32>,
    /// Compressed payload bytes.
    pub data: Vec<u8>,
    /// How `data` was compressed.
    pub mode: BatchMode,
    /// Hand the still-compressed per-page stream straight to the
    /// hypervisor instead of inflating here.
    pub populate_compressed: bool,
}

struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    available: Condvar,
    first_error: Mutex<Option<Error>>,
}

/// Bounded pool of decompression workers.
pub struct DecompressPool {
    shared: Arc<PoolShared>,
    tx: Option<mpsc::Sender<(DecompressJob, Vec<u8>)>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl DecompressPool {
    /// Spawn the worker threads and allocate the staging buffers.
    pub fn new(hc: Arc<dyn Hypercalls>) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            free: Mutex::new((0..POOL_BUFFERS).map(|_| vec![0u8; BUFFER_SIZE]).collect()),
            available: Condvar::new(),
            first_error: Mutex::new(None),
        });
        let (tx, rx) = mpsc::channel::<(DecompressJob, Vec<u8>)>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(POOL_WORKERS);
        for i in 0..POOL_WORKERS {
            let shared = Arc::clone(&shared);
            let rx = Arc::clone(&rx);
            let hc = Arc::clone(&hc);
            let handle = thread::Builder::new()
                .name(format!("decompress-{i}"))
                .spawn(move || loop {
                    let msg = rx.lock().recv();
                    let (job, mut buf) = match msg {
                        Ok(m) => m,
                        Err(_) => break,
                    };
                    if let Err(e) = run_job(hc.as_ref(), &job, &mut buf) {
                        warn!(
                            first_pfn = job.pfns.first().copied().unwrap_or(0),
                            count = job.pfns.len(),
                            error = %e,
                            "batch decompression failed"
                        );
                        let mut slot = shared.first_error.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                    shared.free.lock().push(buf);
                    shared.available.notify_one();
                })
                .map_err(|e| Error::Resource(format!("decompress worker spawn: {e}")))?;
            workers.push(handle);
        }
        debug!(
            buffers = POOL_BUFFERS,
            workers = POOL_WORKERS,
            "decompression pool started"
        );
        Ok(Self {
            shared,
            tx: Some(tx),
            workers,
        })
    }

    /// Queue a batch. Blocks while every staging buffer is leased. Returns
    /// the first worker error instead of queueing once one has occurred.
    pub fn submit(&self, job: DecompressJob) -> Result<()> {
        if let Some(e) = self.shared.first_error.lock().take() {
            return Err(e);
        }
        let buf = {
            let mut free = self.shared.free.lock();
            loop {
                if let Some(b) = free.pop() {
                    break b;
                }
                self.shared.available.wait(&mut free);
            }
        };
        if let Some(e) = self.shared.first_error.lock().take() {
            self.shared.free.lock().push(buf);
            self.shared.available.notify_one();
            return Err(e);
        }
        self.tx
            .as_ref()
            .and_then(|tx| tx.send((job, buf)).ok())
            .ok_or_else(|| Error::Resource("decompression pool shut down".into()))
    }

    /// Wait for every lease to come back, then surface the first worker
    /// error if any.
    pub fn drain(&self) -> Result<()> {
        {
            let mut free = self.shared.free.lock();
            while free.len() < POOL_BUFFERS {
                self.shared.available.wait(&mut free);
            }
        }
        match self.shared.first_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for DecompressPool {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_job(hc: &dyn Hypercalls, job: &DecompressJob, buf: &mut [u8]) -> Result<()> {
    if job.populate_compressed && job.mode == BatchMode::PerPageLz4 {
        let len = validate_per_page_stream(&job.data, &job.pfns)?;
        buf[..len].copy_from_slice(&job.data);
        hc.populate_from_buffer(&job.pfns, &buf[..len], true)?;
    } else {
        let len = decompress_batch(&job.data, job.mode, &job.pfns, buf)?;
        hc.populate_from_buffer(&job.pfns, &buf[..len], false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHypervisor;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    fn per_page_stream(pages: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in pages {
            let mut c = vec![0u8; block::get_maximum_output_size(PAGE_SIZE)];
            let n = block::compress_into(p, &mut c).unwrap();
            if n < PAGE_SIZE {
                out.extend_from_slice(&(n as u16).to_le_bytes());
                out.extend_from_slice(&c[..n]);
            } else {
                out.extend_from_slice(&(PAGE_SIZE as u16).to_le_bytes());
                out.extend_from_slice(p);
            }
        }
        out
    }

    #[test]
    fn per_page_roundtrip_with_raw_fallback() {
        // A compressible page and an incompressible one in the same batch.
        let mut noisy = page(0);
        let mut x = 0x12345678u32;
        for b in noisy.iter_mut() {
            x = x.wrapping_mul(1664525).wrapping_add(1013904223);
            *b = (x >> 24) as u8;
        }
        let pages = vec![page(0xab), noisy.clone()];
        let stream = per_page_stream(&pages);

        let mut out = vec![0u8; 2 * PAGE_SIZE];
        let n = decompress_batch(&stream, BatchMode::PerPageLz4, &[10, 11], &mut out).unwrap();
        assert_eq!(n, 2 * PAGE_SIZE);
        assert_eq!(&out[..PAGE_SIZE], &pages[0][..]);
        assert_eq!(&out[PAGE_SIZE..], &noisy[..]);
    }

    #[test]
    fn bulk_roundtrip() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&page(1));
        raw.extend_from_slice(&page(2));
        let mut c = vec![0u8; block::get_maximum_output_size(raw.len())];
        let n = block::compress_into(&raw, &mut c).unwrap();

        let mut out = vec![0u8; raw.len()];
        let produced =
            decompress_batch(&c[..n], BatchMode::BulkLz4, &[5, 6], &mut out).unwrap();
        assert_eq!(produced, raw.len());
        assert_eq!(out, raw);
    }

    #[test]
    fn oversized_prefix_rejected() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&((PAGE_SIZE as u16) + 1).to_le_bytes());
        stream.extend_from_slice(&page(0));
        let mut out = vec![0u8; PAGE_SIZE];
        let err = decompress_batch(&stream, BatchMode::PerPageLz4, &[3], &mut out).unwrap_err();
        assert!(matches!(
            err,
            DecompressError::InvalidPageSize { pfn: 3, .. }
        ));
    }

    #[test]
    fn truncated_stream_rejected() {
        let stream = [100u8, 0, 1, 2, 3]; // claims 100 bytes, has 3
        let mut out = vec![0u8; PAGE_SIZE];
        let err = decompress_batch(&stream, BatchMode::PerPageLz4, &[4], &mut out).unwrap_err();
        assert!(matches!(err, DecompressError::Truncated { pfn: 4, .. }));
    }

    #[test]
    fn pool_populates_frames_and_drains_clean() {
        let hv = Arc::new(MockHypervisor::new(64));
        let pool = DecompressPool::new(hv.clone() as Arc<dyn Hypercalls>).unwrap();

        for batch in 0..8u32 {
            let pfns: Vec<u32> = (batch * 4..batch * 4 + 4).collect();
            let pages: Vec<Vec<u8>> = pfns.iter().map(|&p| page(p as u8)).collect();
            pool.submit(DecompressJob {
                pfns: pfns.clone(),
                data: per_page_stream(&pages),
                mode: BatchMode::PerPageLz4,
                populate_compressed: false,
            })
            .unwrap();
        }
        pool.drain().unwrap();

        for pfn in 0..32u32 {
            assert_eq!(hv.read_page(pfn), page(pfn as u8));
        }
    }

    #[test]
    fn third_submission_blocks_until_a_buffer_frees() {
        use std::time::{Duration, Instant};

        let hv = Arc::new(MockHypervisor::new(16));
        hv.set_populate_delay(Duration::from_millis(150));
        let pool = DecompressPool::new(hv as Arc<dyn Hypercalls>).unwrap();

        let job = |pfn: u32| DecompressJob {
            pfns: vec![pfn],
            data: per_page_stream(&[page(pfn as u8)]),
            mode: BatchMode::PerPageLz4,
            populate_compressed: false,
        };
        // Two buffers: the first two submissions only queue.
        pool.submit(job(0)).unwrap();
        pool.submit(job(1)).unwrap();
        // The third has to wait for a worker to return its lease.
        let start = Instant::now();
        pool.submit(job(2)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        pool.drain().unwrap();
    }

    #[test]
    fn pool_surfaces_first_worker_error() {
        let hv = Arc::new(MockHypervisor::new(16));
        let pool = DecompressPool::new(hv as Arc<dyn Hypercalls>).unwrap();

        pool.submit(DecompressJob {
            pfns: vec![0],
            data: vec![0xff, 0xff, 1, 2], // prefix far beyond a page
            mode: BatchMode::PerPageLz4,
            populate_compressed: false,
        })
        .unwrap();
        assert!(pool.drain().is_err());
        // The error is consumed once; the pool is reusable afterwards.
        pool.drain().unwrap();
    }
}
