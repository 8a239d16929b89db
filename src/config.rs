//! Save and restore configuration.

use std::path::PathBuf;

use uuid::Uuid;

/// Identity and sizing of the VM being saved or restored.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// This VM's identity.
    pub uuid: Uuid,
    /// Identity of the template this VM was cloned from, if any.
    pub template_uuid: Option<Uuid>,
    /// Path to the template's save file, if any.
    pub template_file: Option<PathBuf>,
    /// Guest RAM in megabytes.
    pub mem_mb: u32,
}

impl VmConfig {
    pub fn new(uuid: Uuid, mem_mb: u32) -> Self {
        Self {
            uuid,
            template_uuid: None,
            template_file: None,
            mem_mb,
        }
    }

    pub fn with_template(mut self, uuid: Uuid, file: impl Into<PathBuf>) -> Self {
        self.template_uuid = Some(uuid);
        self.template_file = Some(file.into());
        self
    }
}

/// How page data is compressed on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressMode {
    /// Pages stored raw.
    None,
    /// Whole batches compressed as one LZ4 block.
    Lz4Bulk,
    /// Each page compressed as its own LZ4 block, length-prefixed.
    /// Required for lazy loading and compressed in-place population.
    Lz4PerPage,
}

/// Options controlling a save operation.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Page compression mode.
    pub compress: CompressMode,
    /// Release guest frames back to the hypervisor as they are captured.
    pub free_mem: bool,
    /// Spend more effort compressing (recorded for the reader; the block
    /// compressor has a single effort level).
    pub high_compress: bool,
    /// Delete the save file when the VM resumes instead of restoring.
    pub delete_on_resume: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            compress: CompressMode::Lz4PerPage,
            free_mem: true,
            high_compress: false,
            delete_on_resume: true,
        }
    }
}

impl SaveOptions {
    pub fn with_compress(mut self, mode: CompressMode) -> Self {
        self.compress = mode;
        self
    }

    pub fn with_free_mem(mut self, free: bool) -> Self {
        self.free_mem = free;
        self
    }

    pub fn with_high_compress(mut self, high: bool) -> Self {
        self.high_compress = high;
        self
    }

    pub fn with_delete_on_resume(mut self, delete: bool) -> Self {
        self.delete_on_resume = delete;
        self
    }
}

/// Options controlling a restore operation.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Demand-populate pages instead of loading them up front.
    pub lazy: bool,
    /// Decompress batches on worker threads.
    pub threaded_decompress: bool,
    /// Hand still-compressed pages to the hypervisor for in-place
    /// decompression. `None` picks the mode automatically: enabled for
    /// template restores, disabled otherwise.
    pub populate_compressed: Option<bool>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            lazy: false,
            threaded_decompress: true,
            populate_compressed: None,
        }
    }
}

impl RestoreOptions {
    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_threaded_decompress(mut self, threaded: bool) -> Self {
        self.threaded_decompress = threaded;
        self
    }

    pub fn with_populate_compressed(mut self, populate: bool) -> Self {
        self.populate_compressed = Some(populate);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_defaults() {
        let opts = SaveOptions::default();
        assert_eq!(opts.compress, CompressMode::Lz4PerPage);
        assert!(opts.free_mem);
        assert!(!opts.high_compress);
        assert!(opts.delete_on_resume);
    }

    #[test]
    fn builders_chain() {
        let opts = SaveOptions::default()
            .with_compress(CompressMode::Lz4Bulk)
            .with_free_mem(false);
        assert_eq!(opts.compress, CompressMode::Lz4Bulk);
        assert!(!opts.free_mem);

        let ropts = RestoreOptions::default()
            .with_lazy(true)
            .with_populate_compressed(true);
        assert!(ropts.lazy);
        assert_eq!(ropts.populate_compressed, Some(true));
    }
}
