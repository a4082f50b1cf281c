//! Engine reset, clocks, context enables and init-time clearing

use super::EngineState;
use crate::csr::{AeCsr, CsrBus};
use crate::error::{QatError, Result};
use qat_chip::fwfmt::uof::cs_reload;
use qat_chip::regfile::{ContextMode, RegClass, GPR_PER_BANK};
use qat_chip::regs::{
    self, active_ctx_status, ae_misc_control, ctx_enables, ctx_sts, init, profile_count, reset,
    wakeup_events,
};
use qat_chip::ucode::clear_gpr_program;
use tracing::{debug, info, warn};

/// Every context of an engine.
pub const ALL_CTX: u8 = 0xff;

/// Cycles granted to the GPR clear program.
const CLEAR_GPR_CYCLES: u32 = 20;

impl<B: CsrBus> AeCsr<B> {
    /// Current state of engine `ae`.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn state(&mut self, ae: u8) -> Result<EngineState> {
        if ctx_enables::enabled(self.read(ae, regs::CTX_ENABLES)?) != 0 {
            return Ok(EngineState::Enabled);
        }
        if self.read(ae, regs::ACTIVE_CTX_STATUS)? & active_ctx_status::ABO != 0 {
            return Ok(EngineState::Active);
        }
        Ok(EngineState::Disabled)
    }

    /// Set the enable bits of `ctx_mask`. In 4-context mode odd contexts
    /// are dropped from the mask.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn enable_ctx(&mut self, ae: u8, ctx_mask: u8) -> Result<()> {
        let mask = ctx_mask & self.ctx_mode(ae)?.ctx_mask();
        self.modify(ae, regs::CTX_ENABLES, |v| {
            (v & ctx_enables::IGNORE_W1C_MASK) | ctx_enables::enable(mask)
        })
    }

    /// Clear the enable bits of `ctx_mask`.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn disable_ctx(&mut self, ae: u8, ctx_mask: u8) -> Result<()> {
        self.modify(ae, regs::CTX_ENABLES, |v| {
            v & ctx_enables::IGNORE_W1C_MASK & !ctx_enables::enable(ctx_mask)
        })
    }

    // ── Reset and clocks ─────────────────────────────────────────────────────

    /// Put the engines of `ae_mask` and accelerators of `accel_mask` into
    /// reset.
    ///
    /// # Errors
    ///
    /// Propagates global CSR access errors.
    pub fn assert_reset(&mut self, ae_mask: u32, accel_mask: u32) -> Result<()> {
        let bits = reset::bits(ae_mask, accel_mask);
        let value = self.read_global(regs::GLOBAL_RESET)? | bits;
        debug!("asserting reset {bits:#x}");
        self.write_global(regs::GLOBAL_RESET, value)
    }

    /// Take the engines and accelerators out of reset and enable their
    /// clocks.
    ///
    /// # Errors
    ///
    /// Returns `CsrTimeout` on `GLOBAL_RESET` if the reset bits stay set for
    /// the whole reset budget.
    pub fn clear_reset(&mut self, ae_mask: u32, accel_mask: u32) -> Result<()> {
        let bits = reset::bits(ae_mask, accel_mask);
        let value = self.read_global(regs::GLOBAL_RESET)? & !bits;
        self.write_global(regs::GLOBAL_RESET, value)?;

        let mut cleared = false;
        for _ in 0..self.retries().reset.max(1) {
            if self.read_global(regs::GLOBAL_RESET)? & bits == 0 {
                cleared = true;
                break;
            }
        }
        if !cleared {
            warn!("reset bits {bits:#x} did not clear");
            return Err(QatError::csr_timeout(QatError::GLOBAL, regs::GLOBAL_RESET));
        }

        let clocks = self.read_global(regs::GLOBAL_CLOCK_ENABLE)? | bits;
        self.write_global(regs::GLOBAL_CLOCK_ENABLE, clocks)
    }

    /// Confirm every present engine is clocked by watching its profile
    /// counter move.
    ///
    /// # Errors
    ///
    /// Returns `CsrTimeout` on `PROFILE_COUNT` of the first engine whose
    /// counter never changes within the check budget.
    pub fn check_alive(&mut self) -> Result<()> {
        let engines: Vec<u8> = self.engines().collect();
        for ae in engines {
            let base = self.read(ae, regs::PROFILE_COUNT)? & profile_count::MASK;
            let mut alive = false;
            for _ in 0..self.retries().ae_check.max(1) {
                if self.read(ae, regs::PROFILE_COUNT)? & profile_count::MASK != base {
                    alive = true;
                    break;
                }
            }
            if !alive {
                warn!("AE{ae}: profile counter stuck at {base:#x}, engine not clocked");
                return Err(QatError::csr_timeout(ae, regs::PROFILE_COUNT));
            }
        }
        Ok(())
    }

    // ── Defaults and init-time clearing ──────────────────────────────────────

    /// Program the power-up defaults of every context of `ae`.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn set_defaults(&mut self, ae: u8) -> Result<()> {
        self.write(ae, regs::CTX_ENABLES, init::CTX_ENABLES)?;
        self.write(ae, regs::ACTIVE_CTX_STATUS, init::ACTIVE_CTX_STATUS)?;
        self.write_pc(ae, ALL_CTX, init::PC)?;
        self.write(ae, regs::CTX_ARB_CNTL, init::CTX_ARB_CNTL)?;
        self.write(ae, regs::CC_ENABLE, init::CC_ENABLE)?;
        self.indirect_write(ae, ALL_CTX, regs::CTX_WAKEUP_EVENTS_INDIRECT, init::CTX_WAKEUP_EVENTS)?;
        self.indirect_write(ae, ALL_CTX, regs::CTX_SIG_EVENTS_INDIRECT, init::CTX_SIG_EVENTS)
    }

    /// Route ALU results into `ALU_OUT`, needed by register reads.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn enable_alu_out(&mut self, ae: u8) -> Result<()> {
        self.modify(ae, regs::SIGNATURE_ENABLE, |v| v | 1)
    }

    /// Zero every SRAM and DRAM read-transfer register of `ae`.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn clear_xfer(&mut self, ae: u8) -> Result<()> {
        for reg in 0..GPR_PER_BANK {
            self.abs_data_write(ae, RegClass::SrRdAbs, reg, 0)?;
            self.abs_data_write(ae, RegClass::DrRdAbs, reg, 0)?;
        }
        Ok(())
    }

    /// Zero every GPR of every present engine by running the clear program
    /// on all contexts, then put the defaults back.
    ///
    /// # Errors
    ///
    /// Returns `CsrTimeout` if an engine stops making progress, or CSR
    /// access errors.
    pub fn clear_gprs(&mut self) -> Result<()> {
        let program = clear_gpr_program();
        let engines: Vec<u8> = self.engines().collect();

        for &ae in &engines {
            self.modify(ae, regs::AE_MISC_CONTROL, |v| v & !ae_misc_control::SHARE_CS)?;
            self.modify(ae, regs::CTX_ENABLES, |v| {
                (v & ctx_enables::IGNORE_W1C_MASK & !ctx_enables::CNTL_STORE_PARITY_ENABLE)
                    | ctx_enables::NN_MODE
            })?;
            self.ucode_write(ae, 0, &program)?;
            self.write_pc(ae, ALL_CTX, init::PC)?;
            self.write(ae, regs::ACTIVE_CTX_STATUS, 0)?;
            self.indirect_write(ae, ALL_CTX, regs::CTX_WAKEUP_EVENTS_INDIRECT, wakeup_events::VOLUNTARY)?;
            self.indirect_write(ae, ALL_CTX, regs::CTX_SIG_EVENTS_INDIRECT, 0)?;
            self.write(ae, regs::CTX_SIG_EVENTS_ACTIVE, 0)?;
            self.enable_ctx(ae, ALL_CTX)?;
        }

        for &ae in &engines {
            self.wait_num_cycles(ae, CLEAR_GPR_CYCLES, true)?;
            self.disable_ctx(ae, ALL_CTX)?;
            self.set_defaults(ae)?;
        }
        debug!("cleared GPRs of {} engines", engines.len());
        Ok(())
    }

    // ── Mode programming ─────────────────────────────────────────────────────

    /// Select 4- or 8-context mode.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn write_ctx_mode(&mut self, ae: u8, mode: ContextMode) -> Result<()> {
        self.modify(ae, regs::CTX_ENABLES, |v| {
            let v = v & ctx_enables::IGNORE_W1C_MASK;
            match mode {
                ContextMode::Four => v | ctx_enables::INUSE_CONTEXTS,
                ContextMode::Eight => v & !ctx_enables::INUSE_CONTEXTS,
            }
        })
    }

    /// Route next-neighbour writes to this engine (`true`) or the next one.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn write_nn_mode(&mut self, ae: u8, self_mode: bool) -> Result<()> {
        self.modify(ae, regs::CTX_ENABLES, |v| {
            let v = v & ctx_enables::IGNORE_W1C_MASK;
            if self_mode {
                v | ctx_enables::NN_MODE
            } else {
                v & !ctx_enables::NN_MODE
            }
        })
    }

    /// Make LM address register `lm` (`Lmem0` or `Lmem1`) global or per
    /// context.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegister` for other classes, or CSR access errors.
    pub fn write_lm_mode(&mut self, ae: u8, lm: RegClass, global: bool) -> Result<()> {
        let bit = match lm {
            RegClass::Lmem0 => ctx_enables::LMADDR_0_GLOBAL,
            RegClass::Lmem1 => ctx_enables::LMADDR_1_GLOBAL,
            other => {
                return Err(QatError::invalid_register(format!(
                    "{other:?} is not a local memory index"
                )))
            }
        };
        self.modify(ae, regs::CTX_ENABLES, |v| {
            let v = v & ctx_enables::IGNORE_W1C_MASK;
            if global {
                v | bit
            } else {
                v & !bit
            }
        })
    }

    /// Share (or stop sharing) the control store with the neighbour engine.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn write_shared_cs_mode(&mut self, ae: u8, shared: bool) -> Result<()> {
        self.modify(ae, regs::AE_MISC_CONTROL, |v| {
            if shared {
                v | ae_misc_control::SHARE_CS
            } else {
                v & !ae_misc_control::SHARE_CS
            }
        })
    }

    /// Program the reloadable microstore size (0, 8K, 16K or 32K words) and
    /// whether reloads are shared between contexts.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for any other size, or CSR access errors.
    pub fn set_reload_ustore(&mut self, ae: u8, reload_words: u32, shared: bool) -> Result<()> {
        let field = cs_reload(reload_words).ok_or_else(|| {
            QatError::invalid_argument(format!("AE{ae}: reload size {reload_words:#x} words"))
        })?;
        self.modify(ae, regs::AE_MISC_CONTROL, |v| {
            let v = v & !(ae_misc_control::ONE_CTX_RELOAD | ae_misc_control::CS_RELOAD_MASK);
            let one_ctx = if shared { ae_misc_control::ONE_CTX_RELOAD } else { 0 };
            v | (field << ae_misc_control::CS_RELOAD_SHIFT) | one_ctx
        })
    }

    // ── Starting contexts ────────────────────────────────────────────────────

    /// Set the program counter of every context in `ctx_mask`.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn write_pc(&mut self, ae: u8, ctx_mask: u8, pc: u32) -> Result<()> {
        self.indirect_write(ae, ctx_mask, regs::CTX_STS_INDIRECT, pc & ctx_sts::UPC_MASK)
    }

    /// Start the contexts of `ctx_mask`; every other context is put to
    /// sleep first.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn start_ctx(&mut self, ae: u8, ctx_mask: u8) -> Result<()> {
        self.indirect_write(ae, !ctx_mask, regs::CTX_WAKEUP_EVENTS_INDIRECT, wakeup_events::SLEEP)?;
        self.enable_ctx(ae, ctx_mask)?;
        info!("AE{ae}: started contexts {ctx_mask:#04x}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Fault, SoftwareAccelerator};
    use crate::config::RetryBudget;
    use qat_chip::ChipVariant;

    fn csr() -> AeCsr<SoftwareAccelerator> {
        let sim = SoftwareAccelerator::new(ChipVariant::C3xxx);
        let mask = sim.ae_mask();
        let retries = RetryBudget { csr: 4, ae_check: 32, reset: 4, fw_auth: 4 };
        AeCsr::new(sim, mask, retries)
    }

    #[test]
    fn enabled_engine_reports_state() {
        let mut c = csr();
        assert_eq!(c.state(1).unwrap(), EngineState::Disabled);
        // word 0 is not a synthesized instruction, so the context keeps running
        c.enable_ctx(1, 0x3).unwrap();
        assert_eq!(c.state(1).unwrap(), EngineState::Enabled);
        c.disable_ctx(1, 0x3).unwrap();
        assert_eq!(c.state(1).unwrap(), EngineState::Disabled);
    }

    #[test]
    fn four_context_mode_masks_odd_enables() {
        let mut c = csr();
        c.write_ctx_mode(0, ContextMode::Four).unwrap();
        c.enable_ctx(0, ALL_CTX).unwrap();
        let v = c.bus().peek(0, regs::CTX_ENABLES).unwrap();
        assert_eq!(ctx_enables::enabled(v), 0x55);
        assert_ne!(v & ctx_enables::INUSE_CONTEXTS, 0);
    }

    #[test]
    fn reset_cycle_enables_clocks() {
        let mut c = csr();
        let (ae_mask, accel_mask) = (c.ae_mask(), c.bus().accel_mask());
        c.assert_reset(ae_mask, accel_mask).unwrap();
        assert_eq!(c.bus().peek_global(regs::GLOBAL_RESET), reset::bits(ae_mask, accel_mask));
        c.clear_reset(ae_mask, accel_mask).unwrap();
        assert_eq!(c.bus().peek_global(regs::GLOBAL_RESET), 0);
        assert_eq!(
            c.bus().peek_global(regs::GLOBAL_CLOCK_ENABLE),
            reset::bits(ae_mask, accel_mask)
        );
    }

    #[test]
    fn stuck_reset_times_out() {
        let mut c = csr();
        c.bus_mut().inject(Fault::StuckReset);
        c.assert_reset(0x1, 0).unwrap();
        let err = c.clear_reset(0x1, 0).unwrap_err();
        assert!(matches!(
            err,
            QatError::CsrTimeout { ae: QatError::GLOBAL, offset: regs::GLOBAL_RESET }
        ));
        assert_eq!(c.bus().peek_global(regs::GLOBAL_CLOCK_ENABLE), 0);
    }

    #[test]
    fn heartbeat_names_the_frozen_engine() {
        let mut c = csr();
        c.check_alive().unwrap();
        c.bus_mut().inject(Fault::FrozenProfileCounter { ae: 4 });
        let err = c.check_alive().unwrap_err();
        assert!(matches!(err, QatError::CsrTimeout { ae: 4, offset: regs::PROFILE_COUNT }));
    }

    #[test]
    fn clear_gprs_zeroes_registers_and_restores_defaults() {
        let mut c = csr();
        for ae in 0..6 {
            c.set_defaults(ae).unwrap();
        }
        c.rel_data_write(2, 5, RegClass::GpaRel, 3, 0xffff_0001).unwrap();
        c.rel_data_write(2, 7, RegClass::GpbRel, 15, 0x1234).unwrap();
        assert_eq!(c.bus().gpr(2, true, 0x53), Some(0xffff_0001));

        c.clear_gprs().unwrap();
        assert_eq!(c.bus().gpr(2, true, 0x53), Some(0));
        assert_eq!(c.bus().gpr(2, false, 0x7f), Some(0));
        assert_eq!(c.state(2).unwrap(), EngineState::Disabled);
        assert_eq!(c.bus().peek(2, regs::CC_ENABLE), Some(init::CC_ENABLE));
        assert_eq!(c.bus().peek(2, regs::CTX_ENABLES), Some(init::CTX_ENABLES));
        assert_eq!(
            c.bus().peek_indirect(2, 6, regs::CTX_WAKEUP_EVENTS_INDIRECT),
            Some(init::CTX_WAKEUP_EVENTS)
        );
        assert_eq!(c.bus().peek_indirect(2, 6, regs::CTX_STS_INDIRECT), Some(0));
    }

    #[test]
    fn clear_xfer_zeroes_read_transfer_slots() {
        let mut c = csr();
        c.rel_data_write(3, 6, RegClass::DrRdRel, 9, 0xaa).unwrap();
        c.rel_data_write(3, 0, RegClass::SrRdRel, 0, 0xbb).unwrap();
        c.clear_xfer(3).unwrap();
        assert!((0..256).all(|slot| c.bus().xfer_rd(3, slot) == Some(0)));
    }

    #[test]
    fn reload_sizes_map_onto_misc_control() {
        let mut c = csr();
        c.set_reload_ustore(0, 0x4000, true).unwrap();
        let misc = c.bus().peek(0, regs::AE_MISC_CONTROL).unwrap();
        assert_eq!(misc & ae_misc_control::CS_RELOAD_MASK, 2 << ae_misc_control::CS_RELOAD_SHIFT);
        assert_ne!(misc & ae_misc_control::ONE_CTX_RELOAD, 0);
        assert!(matches!(
            c.set_reload_ustore(0, 0x1000, false).unwrap_err(),
            QatError::InvalidArgument { .. }
        ));
        c.set_reload_ustore(0, 0, false).unwrap();
        assert_eq!(c.bus().peek(0, regs::AE_MISC_CONTROL), Some(0));
    }

    #[test]
    fn lm_and_shared_modes() {
        let mut c = csr();
        c.write_lm_mode(1, RegClass::Lmem1, true).unwrap();
        c.write_nn_mode(1, true).unwrap();
        c.write_shared_cs_mode(1, true).unwrap();
        let ce = c.bus().peek(1, regs::CTX_ENABLES).unwrap();
        assert_eq!(ce, ctx_enables::LMADDR_1_GLOBAL | ctx_enables::NN_MODE);
        assert_eq!(c.bus().peek(1, regs::AE_MISC_CONTROL), Some(ae_misc_control::SHARE_CS));
        assert!(c.write_lm_mode(1, RegClass::GpaRel, true).is_err());
    }

    #[test]
    fn start_puts_other_contexts_to_sleep() {
        let mut c = csr();
        c.write_pc(5, 0x1, 0x40).unwrap();
        c.ucode_write(5, 0x40, &[0x0123_4567_89ab]).unwrap();
        c.start_ctx(5, 0x1).unwrap();
        assert_eq!(
            c.bus().peek_indirect(5, 3, regs::CTX_WAKEUP_EVENTS_INDIRECT),
            Some(wakeup_events::SLEEP)
        );
        assert_eq!(c.bus().peek_indirect(5, 0, regs::CTX_WAKEUP_EVENTS_INDIRECT), Some(0));
        assert_eq!(c.state(5).unwrap(), EngineState::Enabled);
    }
}
