//! CSR map for the acceleration engines and the global control block.
//!
//! Three register spaces are reachable from the host:
//!
//! ```text
//! AE local    (ae << 12) + csr        per-engine control/status registers
//! AE transfer (ae << 10) + (reg << 2) per-engine read-transfer registers
//! Global      offset                  reset, clock gating, FCU
//! ```
//!
//! The base of each space inside the BAR is device specific and supplied by
//! the bus layer (see [`crate::variant::BarLayout`]).

// ── Address helpers ──────────────────────────────────────────────────────────

/// Byte offset of a local CSR of engine `ae` inside the AE local space.
#[must_use]
pub const fn ae_local(ae: u8, csr: usize) -> usize {
    ((ae as usize) << 12) + csr
}

/// Byte offset of read-transfer register `reg` of engine `ae` inside the
/// transfer space.
#[must_use]
pub const fn ae_xfer(ae: u8, reg: usize) -> usize {
    ((ae as usize) << 10) + (reg << 2)
}

// ── Microstore access ────────────────────────────────────────────────────────

/// Microstore address register. Writing sets the word pointer.
pub const USTORE_ADDRESS: usize = 0x000;
/// Low 32 bits of the microword at `USTORE_ADDRESS`.
pub const USTORE_DATA_LOWER: usize = 0x004;
/// High bits of the microword. Writing commits the word and post-increments
/// the address.
pub const USTORE_DATA_UPPER: usize = 0x008;
/// Result of the last ALU instruction issued through the ECS path.
pub const ALU_OUT: usize = 0x010;

pub mod ustore_address {
    /// Execute-from-control-store: the word at the address is issued directly.
    pub const ECS: u32 = 1 << 31;
}

// ── Context arbitration and enables ──────────────────────────────────────────

/// Context arbiter control.
pub const CTX_ARB_CNTL: usize = 0x014;
/// Context enables, context mode and W1C error bits.
pub const CTX_ENABLES: usize = 0x018;
/// Condition-code enable.
pub const CC_ENABLE: usize = 0x01c;
/// Selects the context addressed by the indirect CSRs.
pub const CSR_CTX_POINTER: usize = 0x020;

pub mod ctx_enables {
    /// Set: 4-context mode (even contexts only). Clear: 8-context mode.
    pub const INUSE_CONTEXTS: u32 = 1 << 31;
    /// Control-store parity error (write-one-to-clear).
    pub const CNTL_STORE_PARITY_ERROR: u32 = 1 << 29;
    /// Control-store parity checking.
    pub const CNTL_STORE_PARITY_ENABLE: u32 = 1 << 28;
    /// Breakpoint hit (write-one-to-clear).
    pub const BREAKPOINT: u32 = 1 << 27;
    /// Next-neighbour register mode.
    pub const NN_MODE: u32 = 1 << 20;
    /// LM address 1 is global rather than per context.
    pub const LMADDR_1_GLOBAL: u32 = 1 << 17;
    /// LM address 0 is global rather than per context.
    pub const LMADDR_0_GLOBAL: u32 = 1 << 16;
    /// Per-context enable bits.
    pub const ENABLE_SHIFT: u32 = 8;
    /// Mask of the enable field after shifting.
    pub const ENABLE_MASK: u32 = 0xff << ENABLE_SHIFT;
    /// Bits that must be masked out on read-modify-write so W1C state is
    /// not cleared by accident.
    pub const IGNORE_W1C_MASK: u32 = !(CNTL_STORE_PARITY_ERROR | BREAKPOINT);

    /// Enable-field value for a context mask.
    #[must_use]
    pub const fn enable(ctx_mask: u8) -> u32 {
        (ctx_mask as u32) << ENABLE_SHIFT
    }

    /// Context mask encoded in an enables value.
    #[must_use]
    pub const fn enabled(value: u32) -> u8 {
        ((value & ENABLE_MASK) >> ENABLE_SHIFT) as u8
    }
}

pub mod cc_enable {
    /// Condition-code update enable.
    pub const CCE: u32 = 1 << 13;
}

pub mod csr_ctx_pointer {
    /// Context number field.
    pub const CTX_MASK: u32 = 0x7;
}

// ── Indirect (per-context) CSRs ──────────────────────────────────────────────
// Accessed through CSR_CTX_POINTER.

/// Per-context status, low bits hold the micro program counter.
pub const CTX_STS_INDIRECT: usize = 0x040;
/// Active context status (not indirect).
pub const ACTIVE_CTX_STATUS: usize = 0x044;
/// Per-context signal events.
pub const CTX_SIG_EVENTS_INDIRECT: usize = 0x048;
/// Signal events of the active context.
pub const CTX_SIG_EVENTS_ACTIVE: usize = 0x04c;
/// Per-context wakeup events.
pub const CTX_WAKEUP_EVENTS_INDIRECT: usize = 0x050;
/// Per-context LM address 0.
pub const LM_ADDR_0_INDIRECT: usize = 0x060;
/// Per-context LM address 1.
pub const LM_ADDR_1_INDIRECT: usize = 0x068;
/// Per-context future count signal.
pub const FUTURE_COUNT_SIGNAL_INDIRECT: usize = 0x078;
/// Byte index shadow of LM address 0.
pub const INDIRECT_LM_ADDR_0_BYTE_INDEX: usize = 0x0e0;
/// Byte index shadow of LM address 1.
pub const INDIRECT_LM_ADDR_1_BYTE_INDEX: usize = 0x0e8;

/// All CSRs that must be accessed through the context pointer.
pub const INDIRECT_CSRS: [usize; 8] = [
    CTX_STS_INDIRECT,
    CTX_SIG_EVENTS_INDIRECT,
    CTX_WAKEUP_EVENTS_INDIRECT,
    LM_ADDR_0_INDIRECT,
    LM_ADDR_1_INDIRECT,
    FUTURE_COUNT_SIGNAL_INDIRECT,
    INDIRECT_LM_ADDR_0_BYTE_INDEX,
    INDIRECT_LM_ADDR_1_BYTE_INDEX,
];

/// Whether `csr` is one of the context-indirect registers.
#[must_use]
pub fn is_indirect(csr: usize) -> bool {
    INDIRECT_CSRS.contains(&csr)
}

pub mod ctx_sts {
    /// Micro program counter field.
    pub const UPC_MASK: u32 = 0x3fff;
}

pub mod active_ctx_status {
    /// Engine busy: some context is executing.
    pub const ABO: u32 = 1 << 31;
    /// Active context number.
    pub const ACNO_MASK: u32 = 0x7;
}

pub mod wakeup_events {
    /// Voluntary context swap.
    pub const VOLUNTARY: u32 = 0x1;
    /// Sleep until explicitly woken.
    pub const SLEEP: u32 = 0x10000;
}

// ── Miscellaneous AE control ─────────────────────────────────────────────────

/// Free-running cycle counter, low 16 bits significant.
pub const PROFILE_COUNT: usize = 0x144;
/// Signature enable. Bit 0 routes ALU results into `ALU_OUT`.
pub const SIGNATURE_ENABLE: usize = 0x150;
/// Shared control store, reload and parity configuration.
pub const AE_MISC_CONTROL: usize = 0x160;
/// Local CSR access status.
pub const LOCAL_CSR_STATUS: usize = 0x180;

pub mod profile_count {
    /// Significant counter bits.
    pub const MASK: u32 = 0xffff;
}

pub mod ae_misc_control {
    /// Control store shared with the neighbour engine.
    pub const SHARE_CS: u32 = 1 << 2;
    /// Control-store reload size field.
    pub const CS_RELOAD_SHIFT: u32 = 20;
    /// Mask of the reload size field.
    pub const CS_RELOAD_MASK: u32 = 0x3 << CS_RELOAD_SHIFT;
    /// Reload a single context at a time.
    pub const ONE_CTX_RELOAD: u32 = 1 << 26;
    /// Control-store parity generation.
    pub const PARITY_ENABLE: u32 = 1 << 24;
}

pub mod local_csr_status {
    /// Previous access has not completed.
    pub const STATUS: u32 = 1 << 0;
}

// ── Reset defaults ───────────────────────────────────────────────────────────

pub mod init {
    /// `CTX_ENABLES` after init.
    pub const CTX_ENABLES: u32 = 0;
    /// `ACTIVE_CTX_STATUS` after init.
    pub const ACTIVE_CTX_STATUS: u32 = 0;
    /// `CTX_ARB_CNTL` after init.
    pub const CTX_ARB_CNTL: u32 = 0;
    /// `CC_ENABLE` after init.
    pub const CC_ENABLE: u32 = 0x2000;
    /// Wakeup events after init (voluntary).
    pub const CTX_WAKEUP_EVENTS: u32 = 0x1;
    /// Signal events after init.
    pub const CTX_SIG_EVENTS: u32 = 0x1;
    /// Program counter after init.
    pub const PC: u32 = 0;
}

// ── Global: reset and clocks ─────────────────────────────────────────────────

/// Engine and accelerator reset register.
pub const GLOBAL_RESET: usize = 0xa0c;
/// Engine and accelerator clock enable register.
pub const GLOBAL_CLOCK_ENABLE: usize = 0xa50;

pub mod reset {
    /// Engine bits occupy `[15:0]`.
    pub const AE_SHIFT: u32 = 0;
    /// Accelerator bits occupy `[23:16]`.
    pub const ACCEL_SHIFT: u32 = 16;

    /// Combined reset/clock value for the given masks.
    #[must_use]
    pub const fn bits(ae_mask: u32, accel_mask: u32) -> u32 {
        ((ae_mask & 0xffff) << AE_SHIFT) | ((accel_mask & 0xff) << ACCEL_SHIFT)
    }
}

// ── Global: firmware control unit ────────────────────────────────────────────

/// FCU command register.
pub const FCU_CTRL: usize = 0x8c0;
/// FCU status register.
pub const FCU_STATUS: usize = 0x8c4;
/// High 32 bits of the DMA address handed to the FCU.
pub const FCU_DRAM_ADDR_HI: usize = 0x8cc;
/// Low 32 bits of the DMA address handed to the FCU.
pub const FCU_DRAM_ADDR_LO: usize = 0x8d0;

pub mod fcu_ctrl {
    /// No operation.
    pub const CMD_NOOP: u32 = 0;
    /// Authenticate the image at the programmed DMA address.
    pub const CMD_AUTH: u32 = 1;
    /// Load the authenticated image into one engine.
    pub const CMD_LOAD: u32 = 2;
    /// Start all loaded engines.
    pub const CMD_START: u32 = 3;
    /// Target engine field of a load command.
    pub const AE_SHIFT: u32 = 8;

    /// Load command for `ae`.
    #[must_use]
    pub const fn load(ae: u8) -> u32 {
        CMD_LOAD | ((ae as u32) << AE_SHIFT)
    }
}

pub mod fcu_status {
    /// Status code field.
    pub const STS_MASK: u32 = 0x7;
    /// No result.
    pub const STS_NO: u32 = 0;
    /// Image verification finished.
    pub const STS_VERI_DONE: u32 = 1;
    /// Image load finished.
    pub const STS_LOAD_DONE: u32 = 2;
    /// Image verification failed.
    pub const STS_VERI_FAIL: u32 = 3;
    /// Image load failed.
    pub const STS_LOAD_FAIL: u32 = 4;
    /// FCU busy.
    pub const STS_BUSY: u32 = 5;
    /// An authenticated image is staged.
    pub const AUTHFWLD: u32 = 1 << 8;
    /// Start command completed.
    pub const DONE: u32 = 1 << 9;
    /// Per-engine "loaded" bits start here.
    pub const LOADED_AE_SHIFT: u32 = 22;

    /// Status code of a raw status value.
    #[must_use]
    pub const fn code(status: u32) -> u32 {
        status & STS_MASK
    }

    /// Whether `ae` is reported loaded.
    #[must_use]
    pub const fn ae_loaded(status: u32, ae: u8) -> bool {
        (status >> (LOADED_AE_SHIFT + ae as u32)) & 1 != 0
    }
}

// ── Timing and retry budgets ─────────────────────────────────────────────────

pub mod timing {
    /// Local CSR access retries before giving up.
    pub const AE_CSR_RETRIES: u32 = 500;
    /// Profile counter reads while waiting for an engine.
    pub const AE_CHECK_RETRIES: u32 = 10_000;
    /// Reset de-assert polls.
    pub const RESET_RETRIES: u32 = 100;
    /// Cycles between an instruction being ready and executing.
    pub const CYCLES_FROM_READY2EXE: u32 = 8;
    /// Cycles allowed per synthesized instruction.
    pub const CYCLES_PER_INST: u32 = 5;
    /// FCU poll period in milliseconds.
    pub const FW_AUTH_WAIT_MS: u64 = 10;
    /// FCU polls before giving up.
    pub const FW_AUTH_RETRIES: u32 = 300;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ae_spaces_are_strided() {
        assert_eq!(ae_local(0, CTX_ENABLES), 0x018);
        assert_eq!(ae_local(3, CTX_ENABLES), 0x3018);
        assert_eq!(ae_xfer(2, 5), 0x814);
    }

    #[test]
    fn indirect_set_excludes_direct_csrs() {
        assert!(is_indirect(CTX_STS_INDIRECT));
        assert!(is_indirect(INDIRECT_LM_ADDR_1_BYTE_INDEX));
        assert!(!is_indirect(CTX_ENABLES));
        assert!(!is_indirect(ACTIVE_CTX_STATUS));
    }

    #[test]
    fn ctx_enable_field_round_trips() {
        let v = ctx_enables::enable(0xa5) | ctx_enables::INUSE_CONTEXTS;
        assert_eq!(ctx_enables::enabled(v), 0xa5);
        assert_eq!(v & ctx_enables::IGNORE_W1C_MASK, v);
        let w1c = ctx_enables::BREAKPOINT | ctx_enables::CNTL_STORE_PARITY_ERROR;
        assert_eq!(w1c & ctx_enables::IGNORE_W1C_MASK, 0);
    }

    #[test]
    fn fcu_status_decoding() {
        let s = fcu_status::STS_LOAD_DONE | (1 << (fcu_status::LOADED_AE_SHIFT + 3));
        assert_eq!(fcu_status::code(s), fcu_status::STS_LOAD_DONE);
        assert!(fcu_status::ae_loaded(s, 3));
        assert!(!fcu_status::ae_loaded(s, 2));
        assert_eq!(fcu_ctrl::load(5), 0x502);
    }
}
