//! Microstore access and transient microcode execution
//!
//! [`AeCsr::exec_ucode`] runs a short program on one context of an idle
//! engine. Every CSR the run touches is captured in an [`EngineSnapshot`]
//! first and written back afterwards, whether the run succeeded or not.

use super::shared_ustore_neighbour;
use crate::csr::{AeCsr, CsrBus};
use crate::error::{QatError, Result};
use qat_chip::regs::{
    self, active_ctx_status, ae_misc_control, cc_enable, ctx_enables, ctx_sts, profile_count,
    timing, ustore_address, wakeup_events,
};
use qat_chip::ucode::set_ecc;
use tracing::{trace, warn};

/// Microstore words addressable by the program counter.
pub const USTORE_ADDRESSABLE: usize = ctx_sts::UPC_MASK as usize + 1;

/// Parameters of one transient execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    /// Clear `CC_ENABLE.CCE` while the program runs
    pub cond_code_off: bool,
    /// Cycle budget before the run is abandoned
    pub max_cycles: u32,
}

impl ExecOptions {
    /// Options for a program of `len` instructions: condition codes off,
    /// five cycles per instruction.
    pub fn for_program(len: usize) -> Self {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        Self {
            cond_code_off: true,
            max_cycles: len.saturating_mul(timing::CYCLES_PER_INST),
        }
    }
}

/// Engine state overwritten by a transient execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    ae: u8,
    ctx: u8,
    misc_control: u32,
    lm_addr: [u32; 2],
    lm_byte_index: [u32; 2],
    wakeup_events: u32,
    pc: u32,
    ctx_enables: u32,
    cc_enable: u32,
    active_ctx: u32,
    arb_cntl: u32,
    future_count: u32,
    sig_events: u32,
    sig_events_active: u32,
    ustore: Vec<u64>,
}

impl EngineSnapshot {
    /// Read everything a run on `ctx` may change. Only reads; a failed
    /// capture leaves the engine untouched.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the engine shares its microstore with an active
    /// neighbour, or propagates CSR access errors.
    pub fn capture<B: CsrBus>(
        csr: &mut AeCsr<B>,
        ae: u8,
        ctx: u8,
        ustore_words: usize,
    ) -> Result<Self> {
        let misc_control = csr.read(ae, regs::AE_MISC_CONTROL)?;
        if misc_control & ae_misc_control::SHARE_CS != 0 {
            let nae = shared_ustore_neighbour(ae);
            if csr.is_present(nae) && csr.state(nae)?.is_busy() {
                warn!("AE{ae}: shared-ustore neighbour AE{nae} is active");
                return Err(QatError::Busy { ae: nae });
            }
        }

        let ustore = csr.ucode_read(ae, 0, ustore_words)?;

        Ok(Self {
            ae,
            ctx,
            misc_control,
            lm_addr: [
                csr.indirect_read(ae, ctx, regs::LM_ADDR_0_INDIRECT)?,
                csr.indirect_read(ae, ctx, regs::LM_ADDR_1_INDIRECT)?,
            ],
            lm_byte_index: [
                csr.indirect_read(ae, ctx, regs::INDIRECT_LM_ADDR_0_BYTE_INDEX)?,
                csr.indirect_read(ae, ctx, regs::INDIRECT_LM_ADDR_1_BYTE_INDEX)?,
            ],
            wakeup_events: csr.indirect_read(ae, ctx, regs::CTX_WAKEUP_EVENTS_INDIRECT)?,
            pc: csr.indirect_read(ae, ctx, regs::CTX_STS_INDIRECT)? & ctx_sts::UPC_MASK,
            ctx_enables: csr.read(ae, regs::CTX_ENABLES)? & ctx_enables::IGNORE_W1C_MASK,
            cc_enable: csr.read(ae, regs::CC_ENABLE)?,
            active_ctx: csr.read(ae, regs::ACTIVE_CTX_STATUS)?,
            arb_cntl: csr.read(ae, regs::CTX_ARB_CNTL)?,
            future_count: csr.indirect_read(ae, ctx, regs::FUTURE_COUNT_SIGNAL_INDIRECT)?,
            sig_events: csr.indirect_read(ae, ctx, regs::CTX_SIG_EVENTS_INDIRECT)?,
            sig_events_active: csr.read(ae, regs::CTX_SIG_EVENTS_ACTIVE)?,
            ustore,
        })
    }

    /// Saved `CTX_ENABLES`, write-1-to-clear bits masked.
    pub const fn ctx_enables(&self) -> u32 {
        self.ctx_enables
    }

    /// Saved `CC_ENABLE`.
    pub const fn cc_enable(&self) -> u32 {
        self.cc_enable
    }

    /// Write everything back and disable the context. Every step is
    /// attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first CSR access error.
    pub fn restore<B: CsrBus>(&self, csr: &mut AeCsr<B>) -> Result<()> {
        let (ae, ctx) = (self.ae, self.ctx);
        let one = 1u8 << ctx;
        let mut first = Ok(());
        let mut step = |r: Result<()>| {
            if let Err(e) = r {
                warn!("AE{ae}: restore after transient execution failed: {e}");
                if first.is_ok() {
                    first = Err(e);
                }
            }
        };

        step(csr.disable_ctx(ae, one));
        step(csr.ucode_write(ae, 0, &self.ustore));
        step(csr.indirect_write(ae, one, regs::CTX_STS_INDIRECT, self.pc));
        step(csr.write(ae, regs::AE_MISC_CONTROL, self.misc_control));
        step(csr.indirect_write(ae, one, regs::CTX_WAKEUP_EVENTS_INDIRECT, self.wakeup_events));
        step(csr.write(
            ae,
            regs::ACTIVE_CTX_STATUS,
            self.active_ctx & active_ctx_status::ACNO_MASK,
        ));
        step(csr.write(ae, regs::CTX_ARB_CNTL, self.arb_cntl));
        step(csr.write(ae, regs::CC_ENABLE, self.cc_enable));
        step(csr.indirect_write(ae, one, regs::FUTURE_COUNT_SIGNAL_INDIRECT, self.future_count));
        step(csr.indirect_write(ae, one, regs::CTX_SIG_EVENTS_INDIRECT, self.sig_events));
        step(csr.write(ae, regs::CTX_SIG_EVENTS_ACTIVE, self.sig_events_active));
        step(csr.indirect_write(ae, one, regs::LM_ADDR_0_INDIRECT, self.lm_addr[0]));
        step(csr.indirect_write(ae, one, regs::LM_ADDR_1_INDIRECT, self.lm_addr[1]));
        step(csr.indirect_write(
            ae,
            one,
            regs::INDIRECT_LM_ADDR_0_BYTE_INDEX,
            self.lm_byte_index[0],
        ));
        step(csr.indirect_write(
            ae,
            one,
            regs::INDIRECT_LM_ADDR_1_BYTE_INDEX,
            self.lm_byte_index[1],
        ));
        step(csr.write(ae, regs::CTX_ENABLES, self.ctx_enables));
        first
    }
}

impl<B: CsrBus> AeCsr<B> {
    fn check_ustore_range(ae: u8, addr: usize, len: usize) -> Result<()> {
        match addr.checked_add(len) {
            Some(end) if end <= USTORE_ADDRESSABLE => Ok(()),
            _ => Err(QatError::invalid_argument(format!(
                "AE{ae}: ustore range {addr:#x}+{len:#x} exceeds {USTORE_ADDRESSABLE:#x} words"
            ))),
        }
    }

    /// Write `words` into the microstore at `addr`, recomputing the ECC of
    /// every word.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the range leaves the microstore, or
    /// propagates CSR access errors.
    #[allow(clippy::cast_possible_truncation)]
    pub fn ucode_write(&mut self, ae: u8, addr: usize, words: &[u64]) -> Result<()> {
        Self::check_ustore_range(ae, addr, words.len())?;
        trace!("AE{ae}: writing {} ustore words at {addr:#x}", words.len());

        let uaddr = addr as u32;
        self.write(ae, regs::USTORE_ADDRESS, uaddr | ustore_address::ECS)?;
        for &word in words {
            let word = set_ecc(word);
            self.write(ae, regs::USTORE_DATA_LOWER, word as u32)?;
            self.write(ae, regs::USTORE_DATA_UPPER, (word >> 32) as u32)?;
        }
        self.write(ae, regs::USTORE_ADDRESS, uaddr)
    }

    /// Read `len` microstore words from `addr`, ECC included.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` while a reloadable microstore is configured,
    /// `Busy` if a shared-ustore neighbour is active, `InvalidArgument` for
    /// a range outside the microstore, or CSR access errors.
    #[allow(clippy::cast_possible_truncation)]
    pub fn ucode_read(&mut self, ae: u8, addr: usize, len: usize) -> Result<Vec<u64>> {
        Self::check_ustore_range(ae, addr, len)?;

        let misc = self.read(ae, regs::AE_MISC_CONTROL)?;
        if misc & ae_misc_control::CS_RELOAD_MASK != 0 {
            return Err(QatError::unsupported(format!(
                "AE{ae}: ustore read with a reloadable ustore configured"
            )));
        }
        let shared = misc & ae_misc_control::SHARE_CS != 0;
        if shared {
            let nae = shared_ustore_neighbour(ae);
            if self.is_present(nae) && self.state(nae)?.is_busy() {
                return Err(QatError::Busy { ae: nae });
            }
            self.write(ae, regs::AE_MISC_CONTROL, misc & !ae_misc_control::SHARE_CS)?;
        }

        let words = (addr..addr + len)
            .map(|a| {
                self.write(ae, regs::USTORE_ADDRESS, a as u32 | ustore_address::ECS)?;
                let lo = self.read(ae, regs::USTORE_DATA_LOWER)?;
                let hi = self.read(ae, regs::USTORE_DATA_UPPER)?;
                Ok((u64::from(hi) << 32) | u64::from(lo))
            })
            .collect::<Result<Vec<_>>>();

        let restored = if shared {
            self.write(ae, regs::AE_MISC_CONTROL, misc)
        } else {
            Ok(())
        };
        let words = words?;
        restored?;
        Ok(words)
    }

    /// Busy-wait `cycles` engine cycles measured on `PROFILE_COUNT`.
    ///
    /// With `check_idle`, returns as soon as at least
    /// [`timing::CYCLES_FROM_READY2EXE`] cycles have passed and the engine
    /// is no longer busy.
    ///
    /// # Errors
    ///
    /// Returns `CsrTimeout` on `PROFILE_COUNT` if the counter stops moving
    /// for the whole check budget.
    pub fn wait_num_cycles(&mut self, ae: u8, cycles: u32, check_idle: bool) -> Result<()> {
        let cycles = cycles.min(profile_count::MASK);
        let base = self.read(ae, regs::PROFILE_COUNT)? & profile_count::MASK;
        let mut budget = self.retries().ae_check;

        loop {
            let now = self.read(ae, regs::PROFILE_COUNT)? & profile_count::MASK;
            let elapsed = now.wrapping_sub(base) & profile_count::MASK;
            if elapsed == 0 {
                budget = budget.saturating_sub(1);
                if budget == 0 {
                    warn!("AE{ae}: profile counter stuck at {now:#x}");
                    return Err(QatError::csr_timeout(ae, regs::PROFILE_COUNT));
                }
            }
            if check_idle
                && elapsed >= timing::CYCLES_FROM_READY2EXE
                && !self.state(ae)?.is_busy()
            {
                return Ok(());
            }
            if elapsed >= cycles {
                return Ok(());
            }
        }
    }

    /// Run a closure between capture and restore of an [`EngineSnapshot`].
    ///
    /// The snapshot is restored on every exit path; an error from the
    /// closure takes precedence over a restore error.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, the capture error, or the first restore
    /// error.
    pub fn with_snapshot<T>(
        &mut self,
        ae: u8,
        ctx: u8,
        ustore_words: usize,
        f: impl FnOnce(&mut Self, &EngineSnapshot) -> Result<T>,
    ) -> Result<T> {
        let snapshot = EngineSnapshot::capture(self, ae, ctx, ustore_words)?;
        let result = f(self, &snapshot);
        let restored = snapshot.restore(self);
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Execute `insts` on context `ctx` of idle engine `ae` and return the
    /// program counter the context stopped at.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the engine (or its shared-ustore neighbour) is
    /// active, `InvalidArgument` for an empty program, a bad context or one
    /// longer than the microstore, `CsrTimeout` if the engine stops making
    /// progress, or CSR access errors. Engine state is restored in every
    /// case except `Busy` and argument errors, which touch nothing.
    pub fn exec_ucode(&mut self, ae: u8, ctx: u8, insts: &[u64], opts: ExecOptions) -> Result<u32> {
        if insts.is_empty() {
            return Err(QatError::invalid_argument("empty microcode program"));
        }
        if ctx >= qat_chip::regfile::MAX_CTX {
            return Err(QatError::invalid_argument(format!("context {ctx} out of range")));
        }
        Self::check_ustore_range(ae, 0, insts.len())?;
        if !self.ctx_mode(ae)?.valid_ctx(ctx) {
            return Err(QatError::invalid_argument(format!(
                "AE{ae}: context {ctx} not available in the current context mode"
            )));
        }
        if self.state(ae)?.is_busy() {
            warn!("AE{ae}: refusing transient execution on an active engine");
            return Err(QatError::Busy { ae });
        }

        trace!("AE{ae}: exec {} instructions on ctx {ctx}", insts.len());
        self.with_snapshot(ae, ctx, insts.len(), |csr, saved| {
            let one = 1u8 << ctx;
            csr.modify(ae, regs::AE_MISC_CONTROL, |v| v & !ae_misc_control::SHARE_CS)?;
            csr.write(
                ae,
                regs::CTX_ENABLES,
                saved.ctx_enables() & !ctx_enables::CNTL_STORE_PARITY_ENABLE,
            )?;
            csr.ucode_write(ae, 0, insts)?;
            csr.indirect_write(ae, one, regs::CTX_STS_INDIRECT, 0)?;
            csr.write(
                ae,
                regs::ACTIVE_CTX_STATUS,
                u32::from(ctx) & active_ctx_status::ACNO_MASK,
            )?;
            if opts.cond_code_off {
                csr.write(ae, regs::CC_ENABLE, saved.cc_enable() & !cc_enable::CCE)?;
            }
            csr.indirect_write(ae, one, regs::CTX_WAKEUP_EVENTS_INDIRECT, wakeup_events::VOLUNTARY)?;
            csr.indirect_write(ae, one, regs::CTX_SIG_EVENTS_INDIRECT, 0)?;
            csr.write(ae, regs::CTX_SIG_EVENTS_ACTIVE, 0)?;
            csr.enable_ctx(ae, one)?;
            csr.wait_num_cycles(ae, opts.max_cycles, true)?;
            Ok(csr.indirect_read(ae, ctx, regs::CTX_STS_INDIRECT)? & ctx_sts::UPC_MASK)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Fault, SoftwareAccelerator};
    use crate::config::RetryBudget;
    use crate::engine::EngineState;
    use qat_chip::ucode::{immed_w0, immed_w1, CTX_ARB_KILL, NOP};
    use qat_chip::ChipVariant;

    fn csr() -> AeCsr<SoftwareAccelerator> {
        let sim = SoftwareAccelerator::new(ChipVariant::C3xxx);
        let mask = sim.ae_mask();
        let retries = RetryBudget { csr: 4, ae_check: 32, ..RetryBudget::default() };
        AeCsr::new(sim, mask, retries)
    }

    #[test]
    fn ustore_round_trip_carries_ecc() {
        let mut c = csr();
        c.ucode_write(0, 0x10, &[NOP, CTX_ARB_KILL]).unwrap();
        let words = c.ucode_read(0, 0x10, 2).unwrap();
        assert_eq!(words, vec![set_ecc(NOP), set_ecc(CTX_ARB_KILL)]);
        assert_eq!(c.bus().ecc_errors(0), 0);
    }

    #[test]
    fn exec_runs_program_and_reports_end_pc() {
        let mut c = csr();
        let prog = [immed_w1(0x02, true, 0x1234_5678), immed_w0(0x02, true, 0x1234_5678), NOP, CTX_ARB_KILL];
        let end = c.exec_ucode(2, 1, &prog, ExecOptions::for_program(prog.len())).unwrap();
        assert_eq!(end, 3);
        // relative A2 of context 1 in 8-context mode
        assert_eq!(c.bus().gpr(2, true, 0x12), Some(0x1234_5678));
        assert_eq!(c.state(2).unwrap(), EngineState::Disabled);
    }

    #[test]
    fn exec_restores_overwritten_ustore() {
        let mut c = csr();
        let before: Vec<u64> = (0..4).map(|i| 0x0f0_0000_0000 | i).collect();
        c.ucode_write(1, 0, &before).unwrap();
        c.exec_ucode(1, 0, &[NOP, CTX_ARB_KILL], ExecOptions::for_program(2)).unwrap();
        let after = c.ucode_read(1, 0, 4).unwrap();
        let expected: Vec<u64> = before.iter().map(|&w| set_ecc(w)).collect();
        assert_eq!(after, expected);
    }

    #[test]
    fn busy_engine_is_refused_untouched() {
        let mut c = csr();
        c.ucode_write(0, 0, &[0x0123_4567_89ab]).unwrap();
        c.enable_ctx(0, 1).unwrap();
        let writes = c.bus().csr_writes();
        let err = c.exec_ucode(0, 1, &[CTX_ARB_KILL], ExecOptions::for_program(1)).unwrap_err();
        assert!(matches!(err, QatError::Busy { ae: 0 }));
        assert_eq!(c.bus().csr_writes(), writes);
    }

    #[test]
    fn stuck_counter_times_out() {
        let mut c = csr();
        c.bus_mut().inject(Fault::FrozenProfileCounter { ae: 3 });
        let err = c.wait_num_cycles(3, 100, false).unwrap_err();
        assert!(matches!(err, QatError::CsrTimeout { ae: 3, offset: regs::PROFILE_COUNT }));
    }

    #[test]
    fn wait_ends_after_requested_cycles() {
        let mut c = csr();
        c.wait_num_cycles(0, 40, false).unwrap();
        assert!(c.bus().peek(0, regs::PROFILE_COUNT).unwrap() >= 40);
    }
}
