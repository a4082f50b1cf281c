//! Error types for engine and firmware operations

use thiserror::Error;

/// Result type alias for QAT operations
pub type Result<T> = std::result::Result<T, QatError>;

/// Errors that can occur while bringing up engines or loading firmware
#[derive(Debug, Error)]
pub enum QatError {
    /// A local CSR access stayed busy for the whole retry budget, or an
    /// engine stopped making progress
    #[error("CSR timeout on AE{ae} at offset {offset:#x}")]
    CsrTimeout {
        /// Engine number (`0xff` for the global space)
        ae: u8,
        /// CSR offset within the engine (or global) space
        offset: usize,
    },

    /// Engine (or its shared-ustore neighbour) is executing
    #[error("AE{ae} is busy")]
    Busy {
        /// Engine number
        ae: u8,
    },

    /// Register class or address cannot be resolved
    #[error("Invalid register: {reason}")]
    InvalidRegister {
        /// What was wrong
        reason: String,
    },

    /// Argument outside the range the hardware accepts
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// Firmware container failed a bounds, checksum, magic or version check
    #[error("Malformed firmware: {reason}")]
    MalformedFirmware {
        /// What was wrong
        reason: String,
    },

    /// Valid firmware or request that this loader does not implement, or
    /// firmware built for different hardware
    #[error("Unsupported: {reason}")]
    Unsupported {
        /// What is unsupported
        reason: String,
    },

    /// FCU never reported a verification result
    #[error("Firmware authentication timed out (FCU status {status:#x})")]
    FirmwareAuthTimeout {
        /// Last FCU status read
        status: u32,
    },

    /// FCU rejected the image signature
    #[error("Firmware authentication failed (FCU status {status:#x})")]
    FirmwareAuthFailed {
        /// FCU status read
        status: u32,
    },

    /// FCU never reported an image loaded into an engine
    #[error("Firmware load into AE{ae} timed out (FCU status {status:#x})")]
    FirmwareLoadTimeout {
        /// Target engine
        ae: u8,
        /// Last FCU status read
        status: u32,
    },

    /// FCU never reported the start command complete
    #[error("Firmware start timed out (FCU status {status:#x})")]
    FirmwareStartTimeout {
        /// Last FCU status read
        status: u32,
    },

    /// Firmware blob could not be fetched
    #[error("Firmware not found: {name}")]
    FirmwareNotFound {
        /// Requested firmware name
        name: String,
    },

    /// Operation needs firmware that has not been loaded
    #[error("No firmware loaded")]
    NoFirmware,

    /// DMA buffer allocation or mapping failed
    #[error("DMA error: {reason}")]
    Dma {
        /// Reason for failure
        reason: String,
    },

    /// I/O error while fetching firmware or mapping registers
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl QatError {
    /// Engine number used for timeouts in the global register space
    pub const GLOBAL: u8 = 0xff;

    /// Create a CSR timeout error
    pub const fn csr_timeout(ae: u8, offset: usize) -> Self {
        Self::CsrTimeout { ae, offset }
    }

    /// Create an invalid register error
    pub fn invalid_register(reason: impl Into<String>) -> Self {
        Self::InvalidRegister {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a malformed firmware error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFirmware {
            reason: reason.into(),
        }
    }

    /// Create an unsupported error
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// Create a firmware not found error
    pub fn firmware_not_found(name: impl Into<String>) -> Self {
        Self::FirmwareNotFound { name: name.into() }
    }

    /// Create a DMA error
    pub fn dma(reason: impl Into<String>) -> Self {
        Self::Dma {
            reason: reason.into(),
        }
    }

    /// Whether the error came from the firmware image itself rather than the
    /// device
    pub const fn is_firmware_defect(&self) -> bool {
        matches!(self, Self::MalformedFirmware { .. } | Self::Unsupported { .. })
    }
}
