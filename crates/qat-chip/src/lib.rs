//! Silicon model for QAT acceleration engines (DH895xCC, C62x, C3xxx).
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the silicon: CSR offsets, register-file addressing, the
//! microword format and the firmware container layouts.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`variant`] | PCI IDs, fuse decoding, per-generation parameters |
//! | [`regs`] | AE local, transfer and global CSR map with bit definitions |
//! | [`regfile`] | Register classes, 10-bit operand addresses, context modes |
//! | [`ucode`] | Microword ECC, synthesized instructions, LM templates |
//! | [`fwfmt`] | MOF / UOF / SUOF constants and record sizes |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod fwfmt;
pub mod regfile;
pub mod regs;
pub mod ucode;
pub mod variant;

pub use variant::{ChipVariant, HwVariant};
