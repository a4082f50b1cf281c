//! PCIe identifiers and per-generation hardware parameters.
//!
//! | Variant | Device ID | AEs | Accels | Firmware | Auth |
//! |---------|-----------|-----|--------|----------|------|
//! | DH895xCC | `8086:0435` | 12 | 6 | UOF | no |
//! | C62x | `8086:37c8` | 10 | 5 | SUOF | FCU |
//! | C3xxx | `8086:19e2` | 6 | 3 | SUOF | FCU |

/// Intel vendor ID.
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// Device IDs of the supported physical functions.
pub mod device_id {
    /// DH895xCC physical function.
    pub const DH895XCC: u16 = 0x0435;
    /// C62x physical function.
    pub const C62X: u16 = 0x37c8;
    /// C3xxx physical function.
    pub const C3XXX: u16 = 0x19e2;
}

/// PCI configuration space offsets read at attach.
pub mod pci_config {
    /// Device ID (16 bits).
    pub const DEVICE_ID: usize = 0x02;
    /// Revision ID (8 bits).
    pub const REVISION_ID: usize = 0x08;
    /// `FUSECTL` word.
    pub const FUSECTL: usize = 0x40;
    /// `SOFTSTRAP` word (C62x, C3xxx).
    pub const SOFTSTRAP: usize = 0x2ec;
}

/// Product-type bits matched against firmware CPU-type / device-type masks.
pub mod prod_type {
    /// DH895xCC.
    pub const DH895XCC: u32 = 0x0040_0000;
    /// C62x.
    pub const C62X: u32 = 0x0100_0000;
    /// C3xxx.
    pub const C3XXX: u32 = 0x0200_0000;
}

/// Capability bits advertised to the crypto layer.
pub mod capability {
    /// Symmetric crypto.
    pub const CRYPTO_SYMMETRIC: u32 = 1 << 0;
    /// Asymmetric crypto.
    pub const CRYPTO_ASYMMETRIC: u32 = 1 << 1;
    /// Cipher.
    pub const CIPHER: u32 = 1 << 2;
    /// Authentication (hash).
    pub const AUTHENTICATION: u32 = 1 << 3;
    /// Compression.
    pub const COMPRESSION: u32 = 1 << 5;
    /// Large-number arithmetic offload.
    pub const LZS_COMPRESSION: u32 = 1 << 6;
    /// Random number generation.
    pub const RAND: u32 = 1 << 7;
    /// ZUC cipher.
    pub const ZUC: u32 = 1 << 8;
    /// SHA-3.
    pub const SHA3: u32 = 1 << 9;
}

/// Fuse and soft-strap words read from PCI config space at attach.
///
/// A set bit disables the corresponding accelerator or engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fuses {
    /// `FUSECTL` register.
    pub fusectl: u32,
    /// `SOFTSTRAP` register (zero on parts without one).
    pub softstrap: u32,
}

/// Offsets of the register spaces inside the CSR BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarLayout {
    /// PCI BAR holding the CSRs.
    pub bar: usize,
    /// Base of the global space (reset, clocks, FCU).
    pub global: usize,
    /// Base of the AE local CSR space.
    pub ae_local: usize,
    /// Base of the AE transfer register space.
    pub ae_xfer: usize,
}

/// Stock part configuration derived from enabled accelerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sku {
    /// One accelerator enabled.
    One,
    /// Two accelerators enabled.
    Two,
    /// Three or four accelerators enabled.
    Three,
    /// All accelerators enabled.
    Four,
    /// Fused in a way no stock part is.
    Unknown,
}

/// Per-generation hardware description, fixed once at attach.
pub trait HwVariant {
    /// Human-readable name.
    fn name(&self) -> &'static str;
    /// Product-type bit checked against firmware images.
    fn prod_type(&self) -> u32;
    /// Engines on a fully enabled part.
    fn max_engines(&self) -> u8;
    /// Accelerators on a fully enabled part.
    fn max_accels(&self) -> u8;
    /// Enabled accelerators.
    fn accel_mask(&self, fuses: Fuses) -> u32;
    /// Enabled engines.
    fn ae_mask(&self, fuses: Fuses) -> u32;
    /// Part SKU.
    fn sku(&self, fuses: Fuses) -> Sku;
    /// Capability bits.
    fn capabilities(&self) -> u32;
    /// Service-arbiter thread map, one word per engine.
    fn arb_map(&self) -> &'static [u32];
    /// Whether AE images go through the FCU authentication path.
    fn fw_auth(&self) -> bool;
    /// Microstore size in words.
    fn ustore_words(&self) -> u32;
    /// MOF firmware file name.
    fn mof_name(&self) -> &'static str;
    /// MMP firmware file name.
    fn mmp_name(&self) -> &'static str;
    /// Name of the AE object inside the MOF.
    fn ae_object_name(&self) -> &'static str;
    /// Register space layout.
    fn bar_layout(&self) -> BarLayout;
}

/// Supported chip generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipVariant {
    /// DH895xCC: unauthenticated UOF images.
    Dh895xcc,
    /// C62x: signed SUOF images through the FCU.
    C62x,
    /// C3xxx: signed SUOF images through the FCU.
    C3xxx,
}

const ARB_MAP_DH895XCC: [u32; 12] = [
    0x1222_2AAA, 0x1166_6666, 0x1222_2AAA, 0x1166_6666,
    0x1222_2AAA, 0x1122_2222, 0x1222_2AAA, 0x1122_2222,
    0x1222_2AAA, 0x1122_2222, 0x1222_2AAA, 0x1122_2222,
];

const ARB_MAP_C6XX: [u32; 10] = [
    0x1222_2AAA, 0x1122_2AAA, 0x1222_2AAA, 0x1122_2AAA, 0x1222_2AAA,
    0x1122_2AAA, 0x1222_2AAA, 0x1122_2AAA, 0x1222_2AAA, 0x1122_2AAA,
];

const ARB_MAP_C3XXX: [u32; 6] = [
    0x1222_2AAA, 0x1122_2AAA, 0x1222_2AAA, 0x1122_2AAA, 0x1222_2AAA, 0x1122_2AAA,
];

impl ChipVariant {
    /// Identify the variant from a PCI device ID.
    #[must_use]
    pub const fn from_device_id(id: u16) -> Option<Self> {
        match id {
            device_id::DH895XCC => Some(Self::Dh895xcc),
            device_id::C62X => Some(Self::C62x),
            device_id::C3XXX => Some(Self::C3xxx),
            _ => None,
        }
    }

    /// PCI device ID.
    #[must_use]
    pub const fn device_id(&self) -> u16 {
        match self {
            Self::Dh895xcc => device_id::DH895XCC,
            Self::C62x => device_id::C62X,
            Self::C3xxx => device_id::C3XXX,
        }
    }

    /// Parse a short name as used on the command line.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "dh895xcc" | "dh895" => Some(Self::Dh895xcc),
            "c62x" | "c6xx" => Some(Self::C62x),
            "c3xxx" | "c3" => Some(Self::C3xxx),
            _ => None,
        }
    }

    const fn accel_field(&self) -> (u32, u32) {
        // (shift, mask) of the accelerator field in the combined fuse word
        match self {
            Self::Dh895xcc => (0, 0x3f),
            Self::C62x => (13, 0x1f),
            Self::C3xxx => (13, 0x7),
        }
    }

    const fn ae_field(&self) -> (u32, u32) {
        match self {
            Self::Dh895xcc => (13, 0xfff),
            Self::C62x => (0, 0x3ff),
            Self::C3xxx => (0, 0x3f),
        }
    }

    const fn disabled(&self, fuses: Fuses) -> u32 {
        match self {
            Self::Dh895xcc => fuses.fusectl,
            Self::C62x | Self::C3xxx => fuses.fusectl | fuses.softstrap,
        }
    }
}

impl HwVariant for ChipVariant {
    fn name(&self) -> &'static str {
        match self {
            Self::Dh895xcc => "DH895xCC",
            Self::C62x => "C62x",
            Self::C3xxx => "C3xxx",
        }
    }

    fn prod_type(&self) -> u32 {
        match self {
            Self::Dh895xcc => prod_type::DH895XCC,
            Self::C62x => prod_type::C62X,
            Self::C3xxx => prod_type::C3XXX,
        }
    }

    fn max_engines(&self) -> u8 {
        match self {
            Self::Dh895xcc => 12,
            Self::C62x => 10,
            Self::C3xxx => 6,
        }
    }

    fn max_accels(&self) -> u8 {
        match self {
            Self::Dh895xcc => 6,
            Self::C62x => 5,
            Self::C3xxx => 3,
        }
    }

    fn accel_mask(&self, fuses: Fuses) -> u32 {
        let (shift, mask) = self.accel_field();
        (!self.disabled(fuses) >> shift) & mask
    }

    fn ae_mask(&self, fuses: Fuses) -> u32 {
        let (shift, mask) = self.ae_field();
        (!self.disabled(fuses) >> shift) & mask
    }

    fn sku(&self, fuses: Fuses) -> Sku {
        let accels = self.accel_mask(fuses).count_ones();
        let max = u32::from(self.max_accels());
        match accels {
            0 => Sku::Unknown,
            n if n == max => Sku::Four,
            1 => Sku::One,
            2 => Sku::Two,
            _ => Sku::Three,
        }
    }

    fn capabilities(&self) -> u32 {
        use capability::{
            AUTHENTICATION, CIPHER, COMPRESSION, CRYPTO_ASYMMETRIC, CRYPTO_SYMMETRIC,
            LZS_COMPRESSION, RAND, SHA3, ZUC,
        };
        let base = CRYPTO_SYMMETRIC | CRYPTO_ASYMMETRIC | CIPHER | AUTHENTICATION;
        match self {
            Self::Dh895xcc => base | COMPRESSION | LZS_COMPRESSION | RAND,
            Self::C62x | Self::C3xxx => base | COMPRESSION | ZUC | SHA3,
        }
    }

    fn arb_map(&self) -> &'static [u32] {
        match self {
            Self::Dh895xcc => &ARB_MAP_DH895XCC,
            Self::C62x => &ARB_MAP_C6XX,
            Self::C3xxx => &ARB_MAP_C3XXX,
        }
    }

    fn fw_auth(&self) -> bool {
        !matches!(self, Self::Dh895xcc)
    }

    fn ustore_words(&self) -> u32 {
        0x4000
    }

    fn mof_name(&self) -> &'static str {
        match self {
            Self::Dh895xcc => "qat_895xcc.bin",
            Self::C62x => "qat_c62x.bin",
            Self::C3xxx => "qat_c3xxx.bin",
        }
    }

    fn mmp_name(&self) -> &'static str {
        match self {
            Self::Dh895xcc => "qat_895xcc_mmp.bin",
            Self::C62x => "qat_c62x_mmp.bin",
            Self::C3xxx => "qat_c3xxx_mmp.bin",
        }
    }

    fn ae_object_name(&self) -> &'static str {
        if self.fw_auth() {
            "icp_qat_ae.suof"
        } else {
            "icp_qat_ae.uof"
        }
    }

    fn bar_layout(&self) -> BarLayout {
        match self {
            Self::Dh895xcc => BarLayout {
                bar: 0,
                global: 0x3a000,
                ae_local: 0x20000,
                ae_xfer: 0x00000,
            },
            Self::C62x | Self::C3xxx => BarLayout {
                bar: 0,
                global: 0x50000,
                ae_local: 0x60000,
                ae_xfer: 0x40000,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_round_trip() {
        for v in [ChipVariant::Dh895xcc, ChipVariant::C62x, ChipVariant::C3xxx] {
            assert_eq!(ChipVariant::from_device_id(v.device_id()), Some(v));
        }
        assert_eq!(ChipVariant::from_device_id(0xffff), None);
    }

    #[test]
    fn unfused_parts_enable_everything() {
        let fuses = Fuses::default();
        for v in [ChipVariant::Dh895xcc, ChipVariant::C62x, ChipVariant::C3xxx] {
            assert_eq!(v.ae_mask(fuses).count_ones(), u32::from(v.max_engines()));
            assert_eq!(v.accel_mask(fuses).count_ones(), u32::from(v.max_accels()));
            assert_eq!(v.sku(fuses), Sku::Four);
            assert_eq!(v.arb_map().len(), usize::from(v.max_engines()));
        }
    }

    #[test]
    fn fused_engines_drop_out_of_mask() {
        let fuses = Fuses { fusectl: 0b10_0001, softstrap: 0b100 };
        assert_eq!(ChipVariant::C3xxx.ae_mask(fuses), 0b01_1010);
    }

    #[test]
    fn only_dh895_loads_without_auth() {
        assert!(!ChipVariant::Dh895xcc.fw_auth());
        assert!(ChipVariant::C62x.fw_auth());
        assert_eq!(ChipVariant::C3xxx.ae_object_name(), "icp_qat_ae.suof");
    }
}
