//! Engine register files and their 10-bit instruction-operand addresses.
//!
//! Microwords name registers through a 10-bit operand field. The field
//! encodes the register class and, for relative classes, an index that the
//! engine combines with the executing context:
//!
//! ```text
//! 0x000-0x01f  GPR relative         0x180-0x19f  SRAM xfer relative
//! 0x080-0x0ff  GPR absolute         0x1c0-0x1df  DRAM xfer relative
//! 0x100-0x106  DRAM xfer index      0x200/0x220  LM index 0/1
//! 0x140-0x146  SRAM xfer index      0x241-0x247  NN index
//! 0x280-0x29f  NN relative          0x300-0x3ff  no destination (immediate)
//! ```
//!
//! Whether `0x000-0x0ff` refers to bank A or bank B depends on the operand
//! slot, not on the address.

/// Register classes as numbered in firmware register tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RegClass {
    /// Immediate operand, no register.
    NoDest = 0,
    /// GPR bank A, context relative.
    GpaRel = 1,
    /// GPR bank A, absolute.
    GpaAbs = 2,
    /// GPR bank B, context relative.
    GpbRel = 3,
    /// GPR bank B, absolute.
    GpbAbs = 4,
    /// SRAM transfer, context relative.
    SrRel = 5,
    /// SRAM read transfer, context relative.
    SrRdRel = 6,
    /// SRAM write transfer, context relative.
    SrWrRel = 7,
    /// SRAM transfer, absolute.
    SrAbs = 8,
    /// SRAM read transfer, absolute.
    SrRdAbs = 9,
    /// SRAM write transfer, absolute.
    SrWrAbs = 10,
    /// SRAM transfer, indexed.
    SrIndx = 11,
    /// DRAM transfer, context relative.
    DrRel = 12,
    /// DRAM read transfer, context relative.
    DrRdRel = 13,
    /// DRAM write transfer, context relative.
    DrWrRel = 14,
    /// DRAM transfer, absolute.
    DrAbs = 15,
    /// DRAM read transfer, absolute.
    DrRdAbs = 16,
    /// DRAM write transfer, absolute.
    DrWrAbs = 17,
    /// DRAM transfer, indexed.
    DrIndx = 18,
    /// Local memory through index 0.
    Lmem0 = 19,
    /// Local memory through index 1.
    Lmem1 = 20,
    /// Next-neighbour, context relative.
    NeighRel = 21,
    /// Next-neighbour, indexed.
    NeighIndx = 22,
    /// Next-neighbour, absolute.
    NeighAbs = 23,
}

impl RegClass {
    /// Decode the class number stored in firmware tables.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => Self::NoDest,
            1 => Self::GpaRel,
            2 => Self::GpaAbs,
            3 => Self::GpbRel,
            4 => Self::GpbAbs,
            5 => Self::SrRel,
            6 => Self::SrRdRel,
            7 => Self::SrWrRel,
            8 => Self::SrAbs,
            9 => Self::SrRdAbs,
            10 => Self::SrWrAbs,
            11 => Self::SrIndx,
            12 => Self::DrRel,
            13 => Self::DrRdRel,
            14 => Self::DrWrRel,
            15 => Self::DrAbs,
            16 => Self::DrRdAbs,
            17 => Self::DrWrAbs,
            18 => Self::DrIndx,
            19 => Self::Lmem0,
            20 => Self::Lmem1,
            21 => Self::NeighRel,
            22 => Self::NeighIndx,
            23 => Self::NeighAbs,
            _ => return None,
        })
    }

    /// Whether the class is addressed relative to a context.
    #[must_use]
    pub const fn is_relative(&self) -> bool {
        matches!(
            self,
            Self::GpaRel
                | Self::GpbRel
                | Self::SrRel
                | Self::SrRdRel
                | Self::SrWrRel
                | Self::DrRel
                | Self::DrRdRel
                | Self::DrWrRel
                | Self::NeighRel
        )
    }

    /// Relative counterpart of an absolute class.
    #[must_use]
    pub const fn to_relative(&self) -> Option<Self> {
        match self {
            Self::GpaAbs => Some(Self::GpaRel),
            Self::GpbAbs => Some(Self::GpbRel),
            Self::SrAbs => Some(Self::SrRel),
            Self::SrRdAbs => Some(Self::SrRdRel),
            Self::SrWrAbs => Some(Self::SrWrRel),
            Self::DrAbs => Some(Self::DrRel),
            Self::DrRdAbs => Some(Self::DrRdRel),
            Self::DrWrAbs => Some(Self::DrWrRel),
            Self::NeighAbs => Some(Self::NeighRel),
            _ => None,
        }
    }

    /// Whether operands of this class occupy the A slot of an instruction.
    #[must_use]
    pub const fn is_bank_a(&self) -> bool {
        matches!(self, Self::GpaRel | Self::GpaAbs)
    }
}

/// 10-bit operand address for `index` in `class`, or `None` when the class
/// cannot appear as an operand.
#[must_use]
pub const fn addr10(class: RegClass, index: u16) -> Option<u16> {
    let addr = match class {
        RegClass::GpaAbs | RegClass::GpbAbs => (index & 0x7f) | 0x80,
        RegClass::GpaRel | RegClass::GpbRel => index & 0x1f,
        RegClass::SrRel | RegClass::SrRdRel | RegClass::SrWrRel => 0x180 | (index & 0x1f),
        RegClass::SrIndx => 0x140 | ((index & 0x3) << 1),
        RegClass::DrRel | RegClass::DrRdRel | RegClass::DrWrRel => 0x1c0 | (index & 0x1f),
        RegClass::DrIndx => 0x100 | ((index & 0x3) << 1),
        RegClass::NeighIndx => 0x241 | ((index & 0x3) << 1),
        RegClass::NeighRel => 0x280 | (index & 0x1f),
        RegClass::Lmem0 => 0x200,
        RegClass::Lmem1 => 0x220,
        RegClass::NoDest => 0x300 | (index & 0xff),
        _ => return None,
    };
    Some(addr)
}

/// Operand address marking an immediate byte.
pub const NO_DEST_BASE: u16 = 0x300;
/// LM index 0 operand.
pub const LM_INDEX0: u16 = 0x200;
/// LM index 1 operand.
pub const LM_INDEX1: u16 = 0x220;

/// Absolute registers per bank.
pub const GPR_PER_BANK: u16 = 128;
/// Hardware contexts per engine.
pub const MAX_CTX: u8 = 8;
/// Transfer register slots per engine (both directions of SRAM and DRAM).
pub const XFER_SLOTS: usize = 256;
/// Local memory size in 32-bit words.
pub const LMEM_WORDS: usize = 1024;

/// Context mode of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Four contexts, even numbers only, 32 relative registers each.
    Four,
    /// Eight contexts, 16 relative registers each.
    Eight,
}

impl ContextMode {
    /// Mode encoded in a `CTX_ENABLES` value.
    #[must_use]
    pub const fn from_ctx_enables(value: u32) -> Self {
        if value & crate::regs::ctx_enables::INUSE_CONTEXTS != 0 {
            Self::Four
        } else {
            Self::Eight
        }
    }

    /// Mode from a firmware context count.
    #[must_use]
    pub const fn from_count(count: u32) -> Option<Self> {
        match count {
            4 => Some(Self::Four),
            8 => Some(Self::Eight),
            _ => None,
        }
    }

    /// Mask applied to relative register indices.
    #[must_use]
    pub const fn rel_mask(&self) -> u16 {
        match self {
            Self::Four => 0x1f,
            Self::Eight => 0x0f,
        }
    }

    /// Offset of the DRAM transfer registers within a context's slot.
    #[must_use]
    pub const fn dram_xfer_offset(&self) -> u16 {
        match self {
            Self::Four => 0x20,
            Self::Eight => 0x10,
        }
    }

    /// Contexts usable in this mode.
    #[must_use]
    pub const fn ctx_mask(&self) -> u8 {
        match self {
            Self::Four => 0x55,
            Self::Eight => 0xff,
        }
    }

    /// Whether `ctx` can execute in this mode.
    #[must_use]
    pub const fn valid_ctx(&self, ctx: u8) -> bool {
        ctx < MAX_CTX && (self.ctx_mask() >> ctx) & 1 != 0
    }
}

/// Split an absolute register number into `(relative index, context)`.
#[must_use]
pub const fn abs_to_rel(mode: ContextMode, abs: u16) -> (u16, u8) {
    match mode {
        ContextMode::Four => (abs & 0x1f, ((abs >> 4) & 0x6) as u8),
        ContextMode::Eight => (abs & 0x0f, ((abs >> 4) & 0x7) as u8),
    }
}

/// Absolute register number of relative index `rel` in context `ctx`.
#[must_use]
pub const fn rel_to_abs(mode: ContextMode, rel: u16, ctx: u8) -> u16 {
    ((ctx as u16) << 4) | (rel & mode.rel_mask())
}

/// Transfer-slot index of a relative transfer register.
///
/// Each context owns 32 slots: SRAM registers first, then DRAM registers at
/// [`ContextMode::dram_xfer_offset`].
#[must_use]
pub const fn xfer_slot(mode: ContextMode, dram: bool, rel: u16, ctx: u8) -> u16 {
    let base = (rel & mode.rel_mask()) + ((ctx as u16) << 5);
    if dram {
        base + mode.dram_xfer_offset()
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn operand_addresses() {
        assert_eq!(addr10(RegClass::GpaAbs, 5), Some(0x85));
        assert_eq!(addr10(RegClass::GpbRel, 0x23), Some(0x03));
        assert_eq!(addr10(RegClass::SrRdRel, 2), Some(0x182));
        assert_eq!(addr10(RegClass::DrIndx, 3), Some(0x106));
        assert_eq!(addr10(RegClass::NeighIndx, 1), Some(0x243));
        assert_eq!(addr10(RegClass::Lmem1, 9), Some(0x220));
        assert_eq!(addr10(RegClass::NoDest, 0x1ab), Some(0x3ab));
        assert_eq!(addr10(RegClass::SrAbs, 1), None);
        assert_eq!(addr10(RegClass::NeighAbs, 1), None);
    }

    #[test]
    fn raw_class_numbers_decode() {
        for raw in 0..=23 {
            let class = RegClass::from_raw(raw).unwrap();
            assert_eq!(class as u16, raw);
        }
        assert_eq!(RegClass::from_raw(24), None);
    }

    #[test]
    fn four_ctx_mode_uses_even_contexts() {
        let mode = ContextMode::Four;
        assert!(mode.valid_ctx(2));
        assert!(!mode.valid_ctx(3));
        assert!(!mode.valid_ctx(8));
        assert!(ContextMode::Eight.valid_ctx(7));
    }

    #[test]
    fn xfer_slots_do_not_overlap_between_contexts() {
        let m = ContextMode::Eight;
        assert_eq!(xfer_slot(m, false, 15, 0), 15);
        assert_eq!(xfer_slot(m, true, 0, 0), 16);
        assert_eq!(xfer_slot(m, true, 15, 7), 255);
        let m = ContextMode::Four;
        assert_eq!(xfer_slot(m, true, 31, 6), 255);
        assert_eq!(xfer_slot(m, false, 0, 2), 64);
    }

    proptest! {
        #[test]
        fn abs_rel_round_trip_eight(abs in 0u16..GPR_PER_BANK) {
            let (rel, ctx) = abs_to_rel(ContextMode::Eight, abs);
            prop_assert!(ctx < MAX_CTX);
            prop_assert_eq!(rel_to_abs(ContextMode::Eight, rel, ctx), abs);
        }

        #[test]
        fn abs_rel_round_trip_four(abs in 0u16..GPR_PER_BANK) {
            let (rel, ctx) = abs_to_rel(ContextMode::Four, abs);
            prop_assert!(ContextMode::Four.valid_ctx(ctx));
            prop_assert_eq!(rel_to_abs(ContextMode::Four, rel, ctx), abs);
        }
    }
}
