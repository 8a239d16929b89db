//! VM-state snapshot engine for a hypervisor device model.
//!
//! This crate serializes a suspended VM — guest memory plus device-model
//! state — to a self-describing save file and reconstructs VMs from such
//! files, including cloning new VMs from a shared read-only template
//! image.
//!
//! # Features
//!
//! - Signed-marker record stream with a trailing index pointer chain
//! - Page batches stored raw, bulk-LZ4, or per-page-LZ4
//! - Zero-page detection and re-zeroing during save
//! - Eager, lazy (demand-populated), and template/clone restores
//! - Bounded two-buffer decompression pool on the restore path
//!
//! # Example
//!
//! ```rust,ignore
//! use vmsave::{
//!     save_file_name, RestoreMode, RestoreOptions, SaveOptions, VmConfig,
//!     VmRestoreSession, VmSaveSession,
//! };
//! use std::sync::Arc;
//!
//! let config = VmConfig::new(vm_uuid, mem_mb);
//! let path = save_file_name(&config.uuid);
//!
//! // Suspend and save.
//! let mut session = VmSaveSession::new(
//!     &path, config.clone(), SaveOptions::default(), hypercalls.clone(), device_model.clone(),
//! );
//! session.save()?;
//!
//! // Later: restore into a fresh VM.
//! let loaded = VmRestoreSession::new(
//!     &path, RestoreMode::Normal, config, RestoreOptions::default(), hypercalls, device_model,
//! )
//! .load()?;
//! loaded.finish()?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          VmSaveSession / VmRestoreSession    │
//! │  save() / resume()      load() / finish()    │
//! └─────────────────────────────────────────────┘
//!            │                       │
//!            ▼                       ▼
//! ┌──────────────────┐   ┌──────────────────────┐
//! │  format codec    │   │  DecompressPool      │
//! │  pagemap (index, │   │  LazyLoadInfo        │
//! │  zero bitmap)    │   │                      │
//! └──────────────────┘   └──────────────────────┘
//!            │                       │
//!            ▼                       ▼
//! ┌─────────────────────────────────────────────┐
//! │     Hypercalls / DeviceModel (traits)        │
//! └─────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod decompress;
pub mod error;
pub mod filebuf;
pub mod format;
pub mod hypercall;
pub mod lazy;
pub mod load;
pub mod pagemap;
pub mod save;
pub mod testing;

// Re-export main types for convenience
pub use config::{CompressMode, RestoreOptions, SaveOptions, VmConfig};
pub use error::{DecompressError, Error, HypercallError, Result};
pub use format::{BatchMode, FormatError, MAX_BATCH, PAGE_SIZE, SAVE_FORMAT_VERSION};
pub use hypercall::{
    DeviceModel, HvmParam, Hypercalls, MapcacheParams, PageKind, TscInfo, VcpuInfo,
};
pub use lazy::LazyLoadInfo;
pub use load::{LoadedVm, RestoreMode, VmRestoreSession};
pub use save::{save_file_name, VmSaveSession};
