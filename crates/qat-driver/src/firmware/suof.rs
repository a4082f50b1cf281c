//! SUOF: signed engine images for the FCU authentication path

use super::checksum;
use super::reader::{checked_range, cstr_at, FromReader, Reader};
use crate::error::{QatError, Result};
use bytes::Bytes;
use qat_chip::fwfmt::{suof, CHUNK_ID_LEN};
use tracing::debug;

/// A signed image: CSS header, public key, signature and payload.
///
/// Also used for the MMP blob, which is a signed image with no AE-mode
/// metadata.
#[derive(Debug, Clone)]
pub struct SignedImage {
    data: Bytes,
}

impl SignedImage {
    const MODULUS: usize = suof::CSS_HDR_LEN;
    const EXPONENT: usize = Self::MODULUS + suof::CSS_MODULUS_LEN;
    const SIGNATURE: usize = Self::EXPONENT + suof::CSS_EXPONENT_LEN;

    /// Wrap a signed blob after checking its length.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if the blob cannot hold the metadata its
    /// CSS firmware type requires, or exceeds the largest image accepted.
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < suof::AE_IMG_OFFSET {
            return Err(QatError::malformed(format!(
                "signed image of {} bytes has no room for its CSS header",
                data.len()
            )));
        }
        let image = Self { data };
        let min = match image.fw_type() {
            suof::CSS_AE_FIRMWARE => suof::AE_IMG_OFFSET + suof::AE_MODE_LEN + suof::INIT_SEQ_LEN,
            _ => suof::AE_IMG_OFFSET,
        };
        let len = image.data.len();
        if len < min || len > suof::AE_IMG_OFFSET + suof::MAX_IMAGE_LEN {
            return Err(QatError::malformed(format!(
                "signed image of {len} bytes outside {min}..={}",
                suof::AE_IMG_OFFSET + suof::MAX_IMAGE_LEN
            )));
        }
        Ok(image)
    }

    /// Whole image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Total length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; construction rejects short images.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// CSS header.
    pub fn css_header(&self) -> &[u8] {
        &self.data[..Self::MODULUS]
    }

    /// RSA modulus.
    pub fn modulus(&self) -> &[u8] {
        &self.data[Self::MODULUS..Self::EXPONENT]
    }

    /// RSA exponent.
    pub fn exponent(&self) -> &[u8] {
        &self.data[Self::EXPONENT..Self::SIGNATURE]
    }

    /// Signature.
    pub fn signature(&self) -> &[u8] {
        &self.data[Self::SIGNATURE..suof::AE_IMG_OFFSET]
    }

    /// Signed payload: AE-mode metadata, init sequence and instructions
    /// for AE firmware; opaque for MMP firmware.
    pub fn payload(&self) -> &[u8] {
        &self.data[suof::AE_IMG_OFFSET..]
    }

    /// CSS firmware type.
    pub fn fw_type(&self) -> u32 {
        let off = suof::CSS_FW_TYPE_OFFSET;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[off..off + 4]);
        u32::from_le_bytes(raw)
    }

    /// Whether this is AE firmware (as opposed to MMP).
    pub fn is_ae_firmware(&self) -> bool {
        self.fw_type() == suof::CSS_AE_FIRMWARE
    }
}

/// AE-mode metadata at the front of a signed AE image's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeMode {
    /// File id
    pub file_id: u32,
    /// Major version
    pub maj_ver: u16,
    /// Minor version
    pub min_ver: u16,
    /// Product types the image is signed for
    pub dev_type: u32,
    /// Highest supported revision
    pub devmax_ver: u16,
    /// Lowest supported revision
    pub devmin_ver: u16,
    /// Engines the image targets
    pub ae_mask: u32,
    /// Context enables
    pub ctx_enables: u32,
    /// Firmware type
    pub fw_type: u8,
    /// Context mode
    pub ctx_mode: u8,
    /// NN mode
    pub nn_mode: u8,
    /// LM0 mode
    pub lm0_mode: u8,
    /// LM1 mode
    pub lm1_mode: u8,
    /// Shared control store mode
    pub cs_mode: u8,
    /// LM2 mode
    pub lm2_mode: u8,
    /// LM3 mode
    pub lm3_mode: u8,
    /// Thread index mode
    pub tindex_mode: u8,
}

impl FromReader for AeMode {
    const SIZE: usize = 33;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            file_id: r.u32()?,
            maj_ver: r.u16()?,
            min_ver: r.u16()?,
            dev_type: r.u32()?,
            devmax_ver: r.u16()?,
            devmin_ver: r.u16()?,
            ae_mask: r.u32()?,
            ctx_enables: r.u32()?,
            fw_type: r.u8()?,
            ctx_mode: r.u8()?,
            nn_mode: r.u8()?,
            lm0_mode: r.u8()?,
            lm1_mode: r.u8()?,
            cs_mode: r.u8()?,
            lm2_mode: r.u8()?,
            lm3_mode: r.u8()?,
            tindex_mode: r.u8()?,
        })
    }
}

/// One image of a SUOF.
#[derive(Debug, Clone)]
pub struct SuofImage {
    /// Signed bytes as handed to the FCU
    pub signed: SignedImage,
    /// AE-mode metadata
    pub ae_mode: AeMode,
    /// Image name
    pub name: String,
}

impl SuofImage {
    fn parse(signed: SignedImage) -> Result<Self> {
        if !signed.is_ae_firmware() {
            return Err(QatError::malformed(format!(
                "SUOF image has CSS firmware type {}",
                signed.fw_type()
            )));
        }
        let meta = &signed.payload()[..suof::AE_MODE_LEN];
        let ae_mode = Reader::new(meta).read::<AeMode>()?;
        let name = cstr_at(&meta[..suof::APP_META_OFFSET], suof::NAME_OFFSET)?.to_string();
        Ok(Self { signed, ae_mode, name })
    }
}

struct ChunkHdr {
    offset: u64,
    size: u64,
}

impl FromReader for ChunkHdr {
    const SIZE: usize = suof::CHUNK_HDR_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        r.skip(CHUNK_ID_LEN)?;
        Ok(Self {
            offset: r.u64()?,
            size: r.u64()?,
        })
    }
}

/// Parsed SUOF.
#[derive(Debug, Clone)]
pub struct Suof {
    /// Images in load order. The last image targeting engine 0 swaps places
    /// with the final image so that engine 0 is loaded after every other
    /// engine.
    pub images: Vec<SuofImage>,
    strings: Bytes,
}

impl Suof {
    /// Validate a SUOF file and split it into signed images.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` on a bad file id, version, firmware type
    /// or checksum, too few chunks, or any chunk or image out of bounds.
    pub fn parse(blob: &Bytes) -> Result<Self> {
        let mut r = Reader::new(blob);
        let fid = r.u32()?;
        if fid != suof::FID {
            return Err(QatError::malformed(format!("SUOF: bad file id {fid:#x}")));
        }
        let csum = r.u32()?;
        let min_ver = r.u8()?;
        let maj_ver = r.u8()?;
        let fw_type = r.u8()?;
        r.skip(1)?;
        let max_chunks = r.u16()?;
        let num_chunks = r.u16()?;

        if (maj_ver, min_ver) != (suof::MAJ_VER, suof::MIN_VER) {
            return Err(QatError::malformed(format!("SUOF: version {maj_ver}.{min_ver}")));
        }
        if fw_type != 0 {
            return Err(QatError::malformed(format!("SUOF: firmware type {fw_type}")));
        }
        checksum::verify("SUOF", csum, &blob[suof::CSUM_START..])?;
        if num_chunks <= 1 || num_chunks > max_chunks {
            return Err(QatError::malformed(format!(
                "SUOF: {num_chunks} chunks (max {max_chunks})"
            )));
        }

        let chunks = (0..num_chunks)
            .map(|_| {
                let c: ChunkHdr = r.read()?;
                checked_range(blob.len(), c.offset, c.size, "SUOF chunk")
            })
            .collect::<Result<Vec<_>>>()?;

        let strt = &chunks[0];
        let strt_len = Reader::at(blob, strt.start)?.u32()?;
        let body = checked_range(strt.len(), 4, u64::from(strt_len), "SUOF string table")?;
        let strings = blob.slice(strt.start + body.start..strt.start + body.end);

        let mut images = chunks[1..]
            .iter()
            .map(|range| {
                let mut r = Reader::at(blob, range.start)?;
                let img_len = r.u32()?;
                r.skip(4)?;
                let img = checked_range(
                    range.len(),
                    suof::OBJ_HDR_LEN as u64,
                    u64::from(img_len),
                    "SUOF image",
                )?;
                let signed = SignedImage::new(blob.slice(range.start + img.start..range.start + img.end))?;
                SuofImage::parse(signed)
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(pos) = images.iter().rposition(|i| i.ae_mode.ae_mask & 1 != 0) {
            let last = images.len() - 1;
            images.swap(pos, last);
        }
        for img in &images {
            debug!("SUOF: image {} ae_mask {:#x}", img.name, img.ae_mode.ae_mask);
        }
        Ok(Self { images, strings })
    }

    /// Check every image against the device.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` for an image not signed for `prod_type`
    /// or whose revision range excludes `revision`.
    pub fn check_images(&self, prod_type: u32, revision: u32) -> Result<()> {
        for img in &self.images {
            let m = &img.ae_mode;
            if m.dev_type & prod_type == 0 {
                return Err(QatError::malformed(format!(
                    "SUOF image {} signed for device type {:#x}, device is {prod_type:#x}",
                    img.name, m.dev_type
                )));
            }
            let range = u32::from(m.devmin_ver)..=u32::from(m.devmax_ver);
            if !range.contains(&revision) {
                return Err(QatError::malformed(format!(
                    "SUOF image {} supports revisions {range:?}, device is {revision}",
                    img.name
                )));
            }
        }
        Ok(())
    }

    /// String at `offset` of the SUOF string table.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` for an offset outside the table.
    pub fn string(&self, offset: u32) -> Result<&str> {
        cstr_at(&self.strings, offset as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{signed_blob, SuofBuilder};
    use qat_chip::variant::prod_type;

    #[test]
    fn engine_zero_image_is_loaded_last() {
        let blob = SuofBuilder::new(prod_type::C62X)
            .image("ae0", 0x1, &[0x11; 16])
            .image("rest", 0x3fe, &[0x22; 16])
            .build();
        let suof = Suof::parse(&blob).unwrap();
        let names: Vec<_> = suof.images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["rest", "ae0"]);
        assert_eq!(suof.images[1].ae_mode.ae_mask, 0x1);
    }

    #[test]
    fn last_engine_zero_image_takes_the_final_slot() {
        let blob = SuofBuilder::new(prod_type::C62X)
            .image("a", 0x1, &[0x11; 8])
            .image("b", 0x6, &[0x22; 8])
            .image("c", 0x3, &[0x33; 8])
            .image("d", 0x8, &[0x44; 8])
            .build();
        let suof = Suof::parse(&blob).unwrap();
        let names: Vec<_> = suof.images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "d", "c"]);
        assert_eq!(suof.images[3].ae_mode.ae_mask & 1, 1);
    }

    #[test]
    fn signed_image_regions() {
        let blob = SuofBuilder::new(prod_type::C62X).image("a", 0x2, &[0xab; 8]).build();
        let img = &Suof::parse(&blob).unwrap().images[0];
        let s = &img.signed;
        assert_eq!(s.css_header().len(), suof::CSS_HDR_LEN);
        assert_eq!(s.modulus().len(), suof::CSS_MODULUS_LEN);
        assert_eq!(s.signature().len(), suof::CSS_SIGNATURE_LEN);
        assert_eq!(s.len(), suof::AE_IMG_OFFSET + suof::AE_MODE_LEN + suof::INIT_SEQ_LEN + 8);
        assert_eq!(&s.payload()[suof::AE_MODE_LEN + suof::INIT_SEQ_LEN..], &[0xab; 8]);
        assert!(s.is_ae_firmware());
    }

    #[test]
    fn device_type_and_revision_are_checked() {
        let suof = Suof::parse(&SuofBuilder::new(prod_type::C62X).image("a", 0x2, &[]).build()).unwrap();
        assert!(suof.check_images(prod_type::C62X, 0).is_ok());
        assert!(matches!(
            suof.check_images(prod_type::C3XXX, 0).unwrap_err(),
            QatError::MalformedFirmware { .. }
        ));
        assert!(suof.check_images(prod_type::C62X, 0x1000).is_err());
    }

    #[test]
    fn short_mmp_is_rejected() {
        assert!(SignedImage::new(Bytes::from(vec![0u8; 100])).is_err());
        let mmp = SignedImage::new(signed_blob(suof::CSS_MMP_FIRMWARE, &[1, 2, 3])).unwrap();
        assert!(!mmp.is_ae_firmware());
        assert_eq!(mmp.payload(), &[1, 2, 3]);
    }

    #[test]
    fn checksum_and_fw_type_are_verified() {
        let blob = SuofBuilder::new(prod_type::C62X).image("a", 0x2, &[]).build();
        let mut bad = blob.to_vec();
        bad[10] = 1;
        assert!(Suof::parse(&Bytes::from(bad)).is_err());
        let mut bad = blob.to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert!(Suof::parse(&Bytes::from(bad)).is_err());
    }
}
