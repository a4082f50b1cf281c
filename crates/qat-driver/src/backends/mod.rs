//! [`CsrBus`](crate::csr::CsrBus) implementations
//!
//! - [`MmioCsrBus`](crate::mmio::MmioCsrBus): mapped PCI BAR (production)
//! - [`SoftwareAccelerator`]: in-process model (CI, fault injection)

pub mod software;

pub use software::{FcuCommand, Fault, SoftwareAccelerator};
