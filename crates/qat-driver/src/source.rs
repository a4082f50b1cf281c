//! Firmware blob sources
//!
//! The loader asks for firmware by name (`qat_c62x.bin`, the MMP file, ...)
//! and never touches the filesystem itself.

use crate::error::{QatError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use tracing::debug;

/// Environment variable overriding the firmware directory.
pub const FW_DIR_ENV: &str = "QAT_FW_DIR";

/// Default firmware directory.
pub const DEFAULT_FW_DIR: &str = "/lib/firmware";

/// Named firmware provider.
pub trait FirmwareSource: Debug + Send {
    /// Fetch firmware `name`.
    ///
    /// # Errors
    ///
    /// Returns `FirmwareNotFound` if no such firmware exists, or `Io` if it
    /// cannot be read.
    fn fetch(&self, name: &str) -> Result<Bytes>;
}

/// Firmware files under a directory.
#[derive(Debug, Clone)]
pub struct DirFirmwareSource {
    root: PathBuf,
}

impl DirFirmwareSource {
    /// Serve files from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Serve files from `$QAT_FW_DIR`, or `/lib/firmware` when unset.
    pub fn from_env() -> Self {
        let root = std::env::var_os(FW_DIR_ENV).map_or_else(|| PathBuf::from(DEFAULT_FW_DIR), PathBuf::from);
        Self::new(root)
    }

    /// Directory served.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

impl FirmwareSource for DirFirmwareSource {
    fn fetch(&self, name: &str) -> Result<Bytes> {
        if name.contains("..") || name.starts_with('/') {
            return Err(QatError::firmware_not_found(name));
        }
        let path = self.root.join(name);
        match std::fs::read(&path) {
            Ok(data) => {
                debug!("Read {} bytes of firmware from {}", data.len(), path.display());
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(QatError::firmware_not_found(name)),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory firmware, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct MemoryFirmwareSource {
    blobs: HashMap<String, Bytes>,
}

impl MemoryFirmwareSource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace firmware `name`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(name, data);
        self
    }

    /// Add or replace firmware `name`.
    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.blobs.insert(name.into(), data.into());
    }
}

impl FirmwareSource for MemoryFirmwareSource {
    fn fetch(&self, name: &str) -> Result<Bytes> {
        self.blobs
            .get(name)
            .cloned()
            .ok_or_else(|| QatError::firmware_not_found(name))
    }
}
