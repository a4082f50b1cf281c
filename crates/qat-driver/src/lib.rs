//! Pure Rust acceleration-engine bring-up and firmware loader for QAT
//! devices (DH895xCC, C62x, C3xxx).
//!
//! Engines are driven entirely through their CSR window: microcode is
//! synthesized on the host and executed transiently to reach register files
//! and local memory, then the service firmware is paged into each
//! microstore (UOF) or handed to the firmware control unit for
//! authentication (SUOF).
//!
//! # Register backends
//!
//! ```text
//! Production:
//!   MmioCsrBus          sysfs-mapped CSR BAR (rustix mmap)
//!
//! Development / CI:
//!   SoftwareAccelerator in-process engine model with fault injection
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use qat_driver::Accelerator;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut acc = Accelerator::open("0000:3d:00.0")?;
//! acc.engine_init()?;
//! acc.firmware_load_default()?;
//! acc.engine_start()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`csr`] | `CsrBus` seam, bounded local/indirect CSR access |
//! | [`engine`] | transient execution, register access, lifecycle |
//! | [`firmware`] | MOF / UOF / SUOF parsers |
//! | [`loader`] | unsigned image pipeline |
//! | [`auth`] | FCU authenticated pipeline |
//! | [`accelerator`] | device controller |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod accelerator;
pub mod auth;
pub mod backends;
pub mod config;
pub mod csr;
pub mod dma;
mod error;
pub mod engine;
pub mod firmware;
pub mod loader;
pub mod mmio;
pub mod source;
pub mod testing;

pub use accelerator::{Accelerator, DeviceInfo};
pub use backends::{Fault, FcuCommand, SoftwareAccelerator};
pub use config::{AccelConfig, RetryBudget};
pub use csr::{AeCsr, CsrBus, Space};
pub use dma::{DmaAllocator, DmaRegion, HostDmaAllocator};
pub use engine::{Engine, EngineState, ExecOptions, LmWrite};
pub use error::{QatError, Result};
pub use firmware::{AeFirmware, Container, Mof, Suof, UofObject};
pub use mmio::MmioCsrBus;
pub use source::{DirFirmwareSource, FirmwareSource, MemoryFirmwareSource};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Accelerator, AccelConfig, AeCsr, AeFirmware, CsrBus, DeviceInfo, DirFirmwareSource,
        Engine, EngineState, FirmwareSource, MemoryFirmwareSource, QatError, Result,
        SoftwareAccelerator,
    };
    pub use qat_chip::{ChipVariant, HwVariant};
}
