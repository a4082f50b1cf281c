//! Firmware containers
//!
//! | Module | Format |
//! |--------|--------|
//! | [`mof`] | MOF: named UOF and SUOF objects bundled in one file |
//! | [`uof`] | UOF: unsigned images, loaded through microstore writes |
//! | [`suof`] | SUOF: signed images, loaded through the FCU |
//!
//! Every parser works on [`Bytes`] and hands out zero-copy slices of it.
//! Every offset is checked against its parent region before use, and every
//! failure is reported as `MalformedFirmware`.

pub mod checksum;
pub mod mof;
pub mod reader;
pub mod suof;
pub mod uof;

pub use mof::{Mof, MofObject, ObjectKind};
pub use suof::{AeMode, SignedImage, Suof, SuofImage};
pub use uof::{CodePage, InitMem, InitRegSym, UofImage, UofObject, UwordBlock};

use crate::error::{QatError, Result};
use bytes::Bytes;
use qat_chip::fwfmt;

/// Container kind, from the leading file id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// MOF wrapper
    Mof,
    /// Bare UOF
    Uof,
    /// Bare SUOF
    Suof,
}

impl Container {
    /// Identify `blob` by its file id.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if the blob is shorter than a file id or
    /// the id is unknown.
    pub fn identify(blob: &[u8]) -> Result<Self> {
        let fid = reader::Reader::new(blob).u32()?;
        match fid {
            fwfmt::mof::FID => Ok(Self::Mof),
            fwfmt::uof::FID => Ok(Self::Uof),
            fwfmt::suof::FID => Ok(Self::Suof),
            _ => Err(QatError::malformed(format!("unknown file id {fid:#x}"))),
        }
    }
}

/// Parsed AE firmware, signed or not.
#[derive(Debug, Clone)]
pub enum AeFirmware {
    /// Unsigned object for the microstore path
    Uof(UofObject),
    /// Signed images for the FCU path
    Suof(Suof),
}

impl AeFirmware {
    /// Parse the AE object from `blob`.
    ///
    /// A MOF is searched for `object_name` (UOF or SUOF alike); a bare UOF
    /// or SUOF is taken as is.
    ///
    /// # Errors
    ///
    /// Returns `FirmwareNotFound` if a MOF lacks `object_name`, or the
    /// parse error of the selected object.
    pub fn parse(blob: &Bytes, object_name: &str) -> Result<Self> {
        match Container::identify(blob)? {
            Container::Mof => {
                let mof = Mof::parse(blob)?;
                let obj = mof
                    .find(object_name)
                    .ok_or_else(|| QatError::firmware_not_found(object_name))?;
                match obj.kind {
                    ObjectKind::Uof => UofObject::parse(&obj.data).map(Self::Uof),
                    ObjectKind::Suof => Suof::parse(&obj.data).map(Self::Suof),
                }
            }
            Container::Uof => UofObject::parse(blob).map(Self::Uof),
            Container::Suof => Suof::parse(blob).map(Self::Suof),
        }
    }

    /// Whether the images go through the FCU.
    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Suof(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ImageSpec, MofBuilder, SuofBuilder, UofBuilder};
    use qat_chip::variant::prod_type;

    #[test]
    fn containers_are_identified_by_file_id() {
        let uof = UofBuilder::new(prod_type::DH895XCC).build();
        let suof = SuofBuilder::new(prod_type::C62X).image("a", 2, &[]).build();
        let mof = MofBuilder::new().uof("x.uof", uof.to_vec()).build();
        assert_eq!(Container::identify(&uof).unwrap(), Container::Uof);
        assert_eq!(Container::identify(&suof).unwrap(), Container::Suof);
        assert_eq!(Container::identify(&mof).unwrap(), Container::Mof);
        assert!(Container::identify(b"\x01\x02\x03\x04").is_err());
        assert!(Container::identify(b"\x01").is_err());
    }

    #[test]
    fn ae_object_is_selected_from_mof() {
        let uof = UofBuilder::new(prod_type::DH895XCC)
            .image(ImageSpec::new("main", 1, 0xff))
            .build();
        let suof = SuofBuilder::new(prod_type::C62X).image("signed", 2, &[]).build();
        let mof = MofBuilder::new()
            .uof("icp_qat_ae.uof", uof.to_vec())
            .suof("icp_qat_ae.suof", suof.to_vec())
            .build();

        let fw = AeFirmware::parse(&mof, "icp_qat_ae.uof").unwrap();
        assert!(!fw.is_signed());
        let fw = AeFirmware::parse(&mof, "icp_qat_ae.suof").unwrap();
        assert!(fw.is_signed());
        assert!(matches!(
            AeFirmware::parse(&mof, "nope").unwrap_err(),
            QatError::FirmwareNotFound { .. }
        ));
    }
}
