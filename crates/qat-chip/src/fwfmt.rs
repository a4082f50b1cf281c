//! Firmware container formats: MOF, UOF and SUOF.
//!
//! All three formats are little-endian and share one idea: a file header
//! carrying a checksum and a table of named chunks, each addressed by an
//! offset and size relative to a parent region.
//!
//! ```text
//! MOF  file header ─┬─ SYM_OBJS   string table naming the objects below
//!                   ├─ UOF_OBJS   object table ─→ UOF files
//!                   └─ SUF_OBJS   object table ─→ SUOF files
//!
//! UOF  file header ── UOF_OBJS ── object header ─┬─ UOF_STRT  strings
//!                                                ├─ UOF_IMEM  LM initializers
//!                                                ├─ UOF_MSEG  memory segments
//!                                                └─ UOF_IMAG  images (N)
//!
//! SUOF file header ─┬─ chunk 0    string table
//!                   └─ chunk 1..N signed images
//! ```
//!
//! Offsets inside a UOF object (tables, code areas, microword blocks) are
//! relative to the start of the `UOF_OBJS` chunk.

/// Length of a chunk identifier.
pub const CHUNK_ID_LEN: usize = 8;

/// Build a chunk identifier from its name, NUL padded.
#[must_use]
pub const fn chunk_id(name: &str) -> [u8; CHUNK_ID_LEN] {
    let bytes = name.as_bytes();
    let mut id = [0u8; CHUNK_ID_LEN];
    let mut i = 0;
    while i < bytes.len() && i < CHUNK_ID_LEN {
        id[i] = bytes[i];
        i += 1;
    }
    id
}

/// CRC-16 polynomial of the container checksums.
pub const CRC_POLY: u32 = 0x1021;

/// MOF container.
pub mod mof {
    use super::{chunk_id, CHUNK_ID_LEN};

    /// File id, `"mof\0"` little-endian.
    pub const FID: u32 = 0x0066_6f6d;
    /// Major version understood.
    pub const MAJ_VER: u8 = 0x1;
    /// Minor version understood.
    pub const MIN_VER: u8 = 0x1;
    /// File header: fid, checksum, min/maj version, reserved, max/num chunks.
    pub const FILE_HDR_LEN: usize = 16;
    /// Checksummed region starts at the version bytes.
    pub const CSUM_START: usize = 8;
    /// Chunk header: id, `u64` offset, `u64` size.
    pub const CHUNK_HDR_LEN: usize = CHUNK_ID_LEN + 16;
    /// Object table header: max/num chunks.
    pub const OBJ_HDR_LEN: usize = 4;
    /// Object table entry: id, offset, size, name, reserved.
    pub const OBJ_CHUNK_HDR_LEN: usize = CHUNK_ID_LEN + 24;

    /// Symbol (string) table chunk.
    pub const SYM_OBJS: [u8; CHUNK_ID_LEN] = chunk_id("SYM_OBJS");
    /// UOF object table chunk.
    pub const UOF_OBJS: [u8; CHUNK_ID_LEN] = chunk_id("UOF_OBJS");
    /// SUOF object table chunk.
    pub const SUOF_OBJS: [u8; CHUNK_ID_LEN] = chunk_id("SUF_OBJS");
}

/// UOF container.
pub mod uof {
    use super::{chunk_id, CHUNK_ID_LEN};

    /// File id.
    pub const FID: u32 = 0xc6c2;
    /// Major version understood.
    pub const MAJ_VER: u8 = 0x4;
    /// Minor version understood.
    pub const MIN_VER: u8 = 0x11;
    /// File header: id, checksum, min/maj version, reserved, max/num chunks.
    pub const FILE_HDR_LEN: usize = 16;
    /// File chunk header: id, checksum, offset, size.
    pub const FILE_CHUNK_HDR_LEN: usize = CHUNK_ID_LEN + 12;
    /// Object header: cpu type, min/max cpu version, max/num chunks, reserved.
    pub const OBJ_HDR_LEN: usize = 20;
    /// Object chunk header: id, offset, size.
    pub const OBJ_CHUNK_HDR_LEN: usize = CHUNK_ID_LEN + 8;

    /// Object chunk of a UOF file.
    pub const OBJS: [u8; CHUNK_ID_LEN] = chunk_id("UOF_OBJS");
    /// String table.
    pub const STRT: [u8; CHUNK_ID_LEN] = chunk_id("UOF_STRT");
    /// Memory initializers.
    pub const IMEM: [u8; CHUNK_ID_LEN] = chunk_id("UOF_IMEM");
    /// Variable memory segment.
    pub const MSEG: [u8; CHUNK_ID_LEN] = chunk_id("UOF_MSEG");
    /// Image.
    pub const IMAG: [u8; CHUNK_ID_LEN] = chunk_id("UOF_IMAG");

    /// `init_mem` record header before its value attributes.
    pub const INIT_MEM_LEN: usize = 20;
    /// One `(byte_offset, value)` attribute.
    pub const MEM_VAL_ATTR_LEN: usize = 8;
    /// Variable memory segment: base/size/align for SRAM, SDRAM, SDRAM1, scratch.
    pub const VAR_MEM_SEG_LEN: usize = 48;
    /// Image header.
    pub const IMAGE_LEN: usize = 64;
    /// Code page header.
    pub const CODE_PAGE_LEN: usize = 40;
    /// Code area: word count, block table offset.
    pub const CODE_AREA_LEN: usize = 8;
    /// Microword block: start address, word count, data offset, reserved.
    pub const UWORD_BLOCK_LEN: usize = 16;
    /// Register table entry.
    pub const AE_REG_LEN: usize = 24;
    /// Register initializer.
    pub const INIT_REG_SYM_LEN: usize = 16;
    /// Symbolic breakpoint.
    pub const SBREAK_LEN: usize = 20;
    /// Import variable / neighbour register / fixup entry.
    pub const IMPORT_VAR_LEN: usize = 8;
    /// Local-memory initializer symbol table limit.
    pub const MAX_LMEM_REG: usize = 1024;

    /// Local memory region of an `init_mem` record.
    pub const REGION_LMEM: u8 = 3;
    /// Global scope of an `init_mem` record.
    pub const SCOPE_GLOBAL: u8 = 0;
    /// Local scope of an `init_mem` record.
    pub const SCOPE_LOCAL: u8 = 1;

    /// Register initializer applied to every assigned context.
    pub const INIT_REG: u8 = 0;
    /// Register initializer applied to one context.
    pub const INIT_REG_CTX: u8 = 1;
    /// Expression initializer.
    pub const INIT_EXPR: u8 = 2;
    /// Expression initializer with endian swap.
    pub const INIT_EXPR_ENDIAN_SWAP: u8 = 3;
    /// Immediate value type.
    pub const VALUE_IMMEDIATE: u8 = 0;
    /// Expression value type.
    pub const VALUE_EXPRESSION: u8 = 1;

    /// Pages per image supported by the loader.
    pub const MAX_PAGES: usize = 1;
    /// Page regions per image supported by the loader.
    pub const MAX_REGIONS: usize = 1;
    /// Slices (images) per engine.
    pub const MAX_SLICES: usize = 8;

    /// Image mode word fields.
    pub mod ae_mode {
        /// Context count field (4 or 8).
        pub const CTX_MODE_MASK: u16 = 0xf;
        /// Next-neighbour mode field.
        pub const NN_MODE_SHIFT: u16 = 4;
        /// Next-neighbour mode field mask after shifting.
        pub const NN_MODE_MASK: u16 = 0xf;
        /// Next-neighbour mode "don't care".
        pub const NN_MODE_DONTCARE: u16 = 0xf;
        /// LM address 0 global.
        pub const LMEM0: u16 = 1 << 8;
        /// LM address 1 global.
        pub const LMEM1: u16 = 1 << 9;
        /// Microstore shared with the neighbour engine.
        pub const SHARED_USTORE: u16 = 1 << 11;
        /// Reloadable microstore shared between contexts.
        pub const RELOAD_CTX_SHARED: u16 = 1 << 12;

        /// Context count encoded in `mode`.
        #[must_use]
        pub const fn ctx_mode(mode: u16) -> u16 {
            mode & CTX_MODE_MASK
        }

        /// NN mode encoded in `mode`.
        #[must_use]
        pub const fn nn_mode(mode: u16) -> u16 {
            (mode >> NN_MODE_SHIFT) & NN_MODE_MASK
        }
    }

    /// `AE_MISC_CONTROL` reload field for a reloadable size in words.
    #[must_use]
    pub const fn cs_reload(reload_words: u32) -> Option<u32> {
        match reload_words {
            0 => Some(0),
            0x2000 => Some(1),
            0x4000 => Some(2),
            0x8000 => Some(3),
            _ => None,
        }
    }
}

/// SUOF container.
pub mod suof {
    use super::CHUNK_ID_LEN;

    /// File id, `"SUOF"`.
    pub const FID: u32 = 0x5355_4f46;
    /// Major version understood.
    pub const MAJ_VER: u8 = 0x0;
    /// Minor version understood.
    pub const MIN_VER: u8 = 0x1;
    /// File header: id, checksum, min/maj version, fw type, reserved,
    /// max/num chunks.
    pub const FILE_HDR_LEN: usize = 16;
    /// Checksummed region starts at the version bytes.
    pub const CSUM_START: usize = 8;
    /// Chunk header: id, `u64` offset, `u64` size.
    pub const CHUNK_HDR_LEN: usize = CHUNK_ID_LEN + 16;
    /// Object header before each signed image: image length, reserved.
    pub const OBJ_HDR_LEN: usize = 8;

    /// CSS header.
    pub const CSS_HDR_LEN: usize = 128;
    /// Offset of the `u32` firmware type inside the CSS header.
    pub const CSS_FW_TYPE_OFFSET: usize = 40;
    /// CSS firmware type of an AE image.
    pub const CSS_AE_FIRMWARE: u32 = 0;
    /// CSS firmware type of the MMP image.
    pub const CSS_MMP_FIRMWARE: u32 = 1;
    /// RSA modulus.
    pub const CSS_MODULUS_LEN: usize = 256;
    /// RSA exponent.
    pub const CSS_EXPONENT_LEN: usize = 4;
    /// Signature.
    pub const CSS_SIGNATURE_LEN: usize = 256;
    /// Padding between modulus and exponent in the FCU public key layout.
    pub const CSS_KEY_PAD_LEN: usize = 252;
    /// Public key as laid out for the FCU: modulus, padding, exponent.
    pub const CSS_PUB_LEN: usize = CSS_MODULUS_LEN + CSS_KEY_PAD_LEN + CSS_EXPONENT_LEN;
    /// Offset of the AE-mode metadata inside a signed image.
    pub const AE_IMG_OFFSET: usize =
        CSS_HDR_LEN + CSS_MODULUS_LEN + CSS_EXPONENT_LEN + CSS_SIGNATURE_LEN;
    /// Engine init sequence following the AE-mode metadata.
    pub const INIT_SEQ_LEN: usize = 50 * 8;
    /// Largest signed image accepted.
    pub const MAX_IMAGE_LEN: usize = 0x40000;
    /// Image name field inside the AE-mode metadata.
    pub const NAME_LEN: usize = 256;
    /// Offset of the image name inside the AE-mode metadata.
    pub const NAME_OFFSET: usize = 40;
    /// Offset of the application metadata inside the AE-mode metadata.
    pub const APP_META_OFFSET: usize = NAME_OFFSET + NAME_LEN;
    /// Application metadata field inside the AE-mode metadata.
    pub const APP_META_LEN: usize = 256;
    /// AE-mode metadata: ids, versions and masks (24), nine mode bytes,
    /// seven reserved, then the name and application metadata.
    pub const AE_MODE_LEN: usize = APP_META_OFFSET + APP_META_LEN;

    /// FCU authentication descriptor.
    pub const AUTH_DESC_LEN: usize = 64;
    /// Authentication chunk: descriptor, chunk size, chunk bus address,
    /// padded to a 64-byte boundary.
    pub const AUTH_CHUNK_LEN: usize = 128;
    /// Alignment of the authentication DMA buffer.
    pub const AUTH_DMA_ALIGN: usize = 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_nul_padded() {
        assert_eq!(&mof::SYM_OBJS, b"SYM_OBJS");
        assert_eq!(&chunk_id("ab"), b"ab\0\0\0\0\0\0");
        assert_eq!(&chunk_id("TOO_LONG_NAME"), b"TOO_LONG");
    }

    #[test]
    fn ae_mode_block_layout() {
        assert_eq!(suof::NAME_OFFSET, 24 + 9 + 7);
        assert_eq!(suof::APP_META_OFFSET, 296);
        assert_eq!(suof::AE_MODE_LEN, 552);
    }

    #[test]
    fn signed_image_offsets() {
        assert_eq!(suof::AE_IMG_OFFSET, 644);
        assert_eq!(suof::CSS_PUB_LEN, 512);
    }

    #[test]
    fn reload_sizes() {
        assert_eq!(uof::cs_reload(0x4000), Some(2));
        assert_eq!(uof::cs_reload(0x1000), None);
    }
}
