//! Configuration types for shared memory regions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Types of shared memory backing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingType {
    /// File-backed shared memory; any process can map the same path
    FileBacked,
    /// Anonymous memory file descriptor (Linux-specific); shared by fd
    /// inheritance or fd passing
    #[cfg(target_os = "linux")]
    MemFd,
}

impl Default for BackingType {
    fn default() -> Self {
        Self::FileBacked
    }
}

impl BackingType {
    /// Check if this backing type is supported on the current platform
    pub fn is_supported(&self) -> bool {
        match self {
            BackingType::FileBacked => cfg!(feature = "file-backed"),
            #[cfg(target_os = "linux")]
            BackingType::MemFd => cfg!(feature = "memfd"),
        }
    }

    /// Get a human-readable name for the backing type
    pub fn name(&self) -> &'static str {
        match self {
            BackingType::FileBacked => "file-backed",
            #[cfg(target_os = "linux")]
            BackingType::MemFd => "memfd",
        }
    }
}

/// Configuration for creating or opening a shared memory region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Name of the shared memory region
    pub name: String,
    /// Total size of the region in bytes; 0 when opening adopts the file size
    pub size: usize,
    /// Backing type for the shared memory
    pub backing_type: BackingType,
    /// Optional file path for file-backed regions
    pub file_path: Option<PathBuf>,
    /// Whether to create the region if it doesn't exist
    pub create: bool,
    /// Permissions for the backing file (Unix permissions)
    pub permissions: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 0,
            backing_type: BackingType::default(),
            file_path: None,
            create: true,
            permissions: 0o600,
        }
    }
}

impl RegionConfig {
    /// Create a new region configuration
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            ..Default::default()
        }
    }

    /// Configuration that maps an existing file-backed region
    pub fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, 0).with_file_path(path).with_create(false)
    }

    /// Set the backing type
    pub fn with_backing_type(mut self, backing_type: BackingType) -> Self {
        self.backing_type = backing_type;
        self
    }

    /// Set the file path for file-backed regions
    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Set whether to create the region if it doesn't exist
    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Set the permissions for the region
    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        use crate::error::ShmSyncError;

        if self.name.is_empty() {
            return Err(ShmSyncError::invalid_parameter(
                "name",
                "Region name cannot be empty",
            ));
        }

        if self.size == 0 && self.create {
            return Err(ShmSyncError::invalid_parameter(
                "size",
                "Region size must be greater than 0",
            ));
        }

        if !self.backing_type.is_supported() {
            return Err(ShmSyncError::invalid_parameter(
                "backing_type",
                format!(
                    "Backing type {} is not supported on this platform",
                    self.backing_type.name()
                ),
            ));
        }

        if self.backing_type == BackingType::FileBacked && !self.create && self.file_path.is_none()
        {
            return Err(ShmSyncError::invalid_parameter(
                "file_path",
                "File path must be specified for existing file-backed regions",
            ));
        }

        #[cfg(target_os = "linux")]
        if self.backing_type == BackingType::MemFd && !self.create {
            return Err(ShmSyncError::invalid_parameter(
                "create",
                "A memfd region can only be created, not opened by name",
            ));
        }

        Ok(())
    }

    /// Get the default file path for this region
    pub fn default_file_path(&self) -> PathBuf {
        self.file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/tmp/shmsync_{}", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_validate() {
        let config = RegionConfig::new("objects", 4096)
            .with_file_path("/tmp/objects.shm")
            .with_permissions(0o644);
        assert!(config.validate().is_ok());
        assert_eq!(config.default_file_path(), PathBuf::from("/tmp/objects.shm"));

        assert!(RegionConfig::new("", 4096).validate().is_err());
        assert!(RegionConfig::new("objects", 0).validate().is_err());
    }

    #[test]
    fn test_open_config_adopts_size() {
        let config = RegionConfig::open("objects", "/tmp/objects.shm");
        assert!(!config.create);
        assert_eq!(config.size, 0);
        assert!(config.validate().is_ok());

        let missing_path = RegionConfig::new("objects", 0).with_create(false);
        assert!(missing_path.validate().is_err());
    }

    #[test]
    fn test_default_path() {
        let config = RegionConfig::new("table", 64);
        assert_eq!(config.default_file_path(), PathBuf::from("/tmp/shmsync_table"));
        assert_eq!(config.backing_type, BackingType::FileBacked);
    }
}
