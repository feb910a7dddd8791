//! Shared memory region implementation

use std::{
    fs::{File, OpenOptions},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    os::unix::fs::OpenOptionsExt,
    time::SystemTime,
};

use log::debug;
use memmap2::{MmapMut, MmapOptions};
#[cfg(target_os = "linux")]
use nix::{
    sys::memfd::{memfd_create, MemFdCreateFlag},
    unistd::ftruncate,
};

use crate::error::{Result, ShmSyncError};

use super::config::{BackingType, RegionConfig};

/// Descriptive data about a mapped region
#[derive(Debug, Clone)]
pub struct RegionMetadata {
    pub name: String,
    pub size: usize,
    pub backing_type: BackingType,
    pub created_at: SystemTime,
}

/// A shared memory mapping that object tables are laid out in
///
/// The mapping is `MAP_SHARED`, so every process that maps the same file
/// (or inherits the same memfd) sees the same bytes at its own address.
/// Everything placed inside is accessed through atomics or guarded cells,
/// never through `&mut` slices.
#[derive(Debug)]
pub struct SharedMemoryRegion {
    metadata: RegionMetadata,
    mmap: MmapMut,
    _file: Option<File>,
    _owned_fd: Option<OwnedFd>,
    fd: RawFd,
}

impl SharedMemoryRegion {
    /// Create or open a shared memory region
    pub fn new(config: RegionConfig) -> Result<Self> {
        config.validate()?;

        let (file, owned_fd, fd, size) = match config.backing_type {
            BackingType::FileBacked => Self::create_file_backing(&config)?,
            #[cfg(target_os = "linux")]
            BackingType::MemFd => Self::create_memfd_backing(&config)?,
        };

        if size == 0 {
            return Err(ShmSyncError::invalid_parameter(
                "size",
                format!("Region {} is empty", config.name),
            ));
        }

        let mmap = match (&file, &owned_fd) {
            (Some(f), _) => unsafe { MmapOptions::new().len(size).map_mut(f) },
            (None, Some(fd)) => unsafe { MmapOptions::new().len(size).map_mut(fd) },
            (None, None) => {
                return Err(ShmSyncError::platform(
                    "No file or owned fd available for mapping",
                ))
            }
        }
        .map_err(|e| ShmSyncError::from_io(e, "Failed to create memory mapping"))?;

        debug!(
            "mapped region {} ({} bytes, {}) at {:p}",
            config.name,
            size,
            config.backing_type.name(),
            mmap.as_ptr()
        );

        Ok(Self {
            metadata: RegionMetadata {
                name: config.name,
                size,
                backing_type: config.backing_type,
                created_at: SystemTime::now(),
            },
            mmap,
            _file: file,
            _owned_fd: owned_fd,
            fd,
        })
    }

    /// Create (or reopen read-write) file-backed storage
    fn create_file_backing(
        config: &RegionConfig,
    ) -> Result<(Option<File>, Option<OwnedFd>, RawFd, usize)> {
        let path = config.default_file_path();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(config.create)
            .truncate(false)
            .mode(config.permissions)
            .open(&path)
            .map_err(|e| {
                ShmSyncError::from_io(e, &format!("Failed to open {}", path.display()))
            })?;

        let current = file
            .metadata()
            .map_err(|e| ShmSyncError::from_io(e, "Failed to stat region file"))?
            .len() as usize;

        // Growing zero-fills, which is what fresh object slots expect
        let size = if config.size == 0 { current } else { config.size };
        if config.create && current < size {
            file.set_len(size as u64)
                .map_err(|e| ShmSyncError::from_io(e, "Failed to set file size"))?;
        } else if current < size {
            return Err(ShmSyncError::invalid_parameter(
                "size",
                format!("Existing region is {} bytes, {} requested", current, size),
            ));
        }

        let fd = file.as_raw_fd();
        Ok((Some(file), None, fd, size))
    }

    /// Create memfd-backed storage
    #[cfg(target_os = "linux")]
    fn create_memfd_backing(
        config: &RegionConfig,
    ) -> Result<(Option<File>, Option<OwnedFd>, RawFd, usize)> {
        use std::ffi::CString;

        let name_cstr = CString::new(config.name.clone())
            .map_err(|_| ShmSyncError::invalid_parameter("name", "Name contains null bytes"))?;

        let owned_fd = memfd_create(&name_cstr, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|e| ShmSyncError::platform(format!("Failed to create memfd: {}", e)))?;

        ftruncate(&owned_fd, config.size as i64)
            .map_err(|e| ShmSyncError::platform(format!("Failed to set memfd size: {}", e)))?;

        let raw_fd = owned_fd.as_raw_fd();
        Ok((None, Some(owned_fd), raw_fd, config.size))
    }

    /// Get the region metadata
    pub fn metadata(&self) -> &RegionMetadata {
        &self.metadata
    }

    /// Base address of the mapping
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Get the size of the region
    pub fn size(&self) -> usize {
        self.metadata.size
    }

    /// Get the name of the region
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Flush changes to persistent storage (for file-backed regions)
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| ShmSyncError::from_io(e, "Failed to flush memory mapping"))
    }

    /// Get the file descriptor
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Check if the region is file-backed
    pub fn is_file_backed(&self) -> bool {
        matches!(self.metadata.backing_type, BackingType::FileBacked)
    }
}

unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_backed_region_is_zeroed() {
        let temp_dir = TempDir::new().unwrap();
        let config = RegionConfig::new("zeroed", 8192)
            .with_file_path(temp_dir.path().join("zeroed.shm"));

        let region = SharedMemoryRegion::new(config).unwrap();
        assert_eq!(region.size(), 8192);
        assert!(region.is_file_backed());

        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_two_mappings_share_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shared.shm");

        let first = SharedMemoryRegion::new(
            RegionConfig::new("shared", 4096).with_file_path(&path),
        )
        .unwrap();
        let second = SharedMemoryRegion::new(RegionConfig::open("shared", &path)).unwrap();
        assert_eq!(second.size(), 4096);
        assert_ne!(first.as_ptr(), second.as_ptr());

        unsafe { *(first.as_ptr() as *mut u8).add(100) = 0xAB };
        let seen = unsafe { *second.as_ptr().add(100) };
        assert_eq!(seen, 0xAB);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config = RegionConfig::open("missing", temp_dir.path().join("missing.shm"));
        assert!(matches!(
            SharedMemoryRegion::new(config),
            Err(ShmSyncError::Io { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memfd_region() {
        let config = RegionConfig::new("memfd_objects", 4096)
            .with_backing_type(BackingType::MemFd);
        let region = SharedMemoryRegion::new(config).unwrap();
        assert_eq!(region.size(), 4096);
        assert!(!region.is_file_backed());
        assert!(region.fd() >= 0);
    }
}
