//! Register and local-memory access through synthesized microcode
//!
//! | Target | Path |
//! |--------|------|
//! | GPR, LM index, NN, write transfer | `immed_w1`/`immed_w0` program |
//! | Read transfer | transfer window CSR |
//! | Local memory | byte-run program, optionally batched |
//! | Any operand (read) | single ALU instruction issued via ECS |

use super::exec::ExecOptions;
use super::regaddr::operand;
use super::shared_ustore_neighbour;
use crate::csr::{AeCsr, CsrBus};
use crate::error::{QatError, Result};
use qat_chip::regfile::{abs_to_rel, xfer_slot, RegClass, LMEM_WORDS};
use qat_chip::regs::{self, active_ctx_status, ae_misc_control, ctx_enables, timing, ustore_address};
use qat_chip::ucode::{
    alu_read, immed_w0, immed_w1, lm_program_len, push_lm_program, CTX_ARB_KILL, LM_SCRATCH_B, NOP,
};
use tracing::{debug, trace};

/// Local memory size in bytes.
pub const LMEM_BYTES: usize = LMEM_WORDS * 4;

/// One queued local-memory write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LmWrite {
    /// Byte address, word aligned
    pub addr: u16,
    /// Bytes to store, little-endian within each word
    pub bytes: Vec<u8>,
}

impl LmWrite {
    /// Write of one 32-bit value.
    pub fn word(addr: u16, value: u32) -> Self {
        Self {
            addr,
            bytes: value.to_le_bytes().to_vec(),
        }
    }

    fn validate(&self, ae: u8) -> Result<()> {
        if self.addr % 4 != 0 {
            return Err(QatError::invalid_argument(format!(
                "AE{ae}: local memory address {:#x} is not word aligned",
                self.addr
            )));
        }
        if usize::from(self.addr) + self.bytes.len() > LMEM_BYTES {
            return Err(QatError::invalid_argument(format!(
                "AE{ae}: local memory write {:#x}+{:#x} exceeds {LMEM_BYTES:#x} bytes",
                self.addr,
                self.bytes.len()
            )));
        }
        Ok(())
    }
}

impl<B: CsrBus> AeCsr<B> {
    /// Write `value` to relative register `rel` of `class` in context `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegister` for classes without a write path,
    /// `InvalidArgument` for a bad index or context, `Busy` if the engine is
    /// running, or execution errors.
    pub fn rel_data_write(
        &mut self,
        ae: u8,
        ctx: u8,
        class: RegClass,
        rel: u16,
        value: u32,
    ) -> Result<()> {
        trace!("AE{ae}: ctx {ctx} {class:?}[{rel}] := {value:#x}");
        match class {
            RegClass::GpaRel
            | RegClass::GpbRel
            | RegClass::SrWrRel
            | RegClass::DrWrRel
            | RegClass::NeighRel => {
                let (dest, _) = self.resolve_rel(ae, ctx, class, rel)?;
                self.immed_write(ae, ctx, dest, class.is_bank_a(), value)
            }
            RegClass::Lmem0 | RegClass::Lmem1 => {
                if !self.ctx_mode(ae)?.valid_ctx(ctx) {
                    return Err(QatError::invalid_argument(format!(
                        "AE{ae}: context {ctx} not available"
                    )));
                }
                self.immed_write(ae, ctx, operand(class, 0)?, false, value)
            }
            RegClass::SrRel | RegClass::SrRdRel | RegClass::DrRel | RegClass::DrRdRel => {
                let (_, mode) = self.resolve_rel(ae, ctx, class, rel)?;
                let dram = matches!(class, RegClass::DrRel | RegClass::DrRdRel);
                self.write_xfer(ae, xfer_slot(mode, dram, rel, ctx), value)
            }
            _ => Err(QatError::invalid_register(format!(
                "{class:?} cannot be written as a relative register"
            ))),
        }
    }

    fn immed_write(&mut self, ae: u8, ctx: u8, dest: u16, bank_a: bool, value: u32) -> Result<()> {
        let prog = [
            immed_w1(dest, bank_a, value),
            immed_w0(dest, bank_a, value),
            NOP,
            CTX_ARB_KILL,
        ];
        self.exec_ucode(ae, ctx, &prog, ExecOptions::for_program(prog.len()))
            .map(|_| ())
    }

    /// Write `value` to absolute register `abs` of an absolute `class`.
    ///
    /// The register is split into a relative index and context according to
    /// the engine's context mode and written through
    /// [`Self::rel_data_write`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegister` for non-absolute classes, or the errors of
    /// the relative write.
    pub fn abs_data_write(&mut self, ae: u8, class: RegClass, abs: u16, value: u32) -> Result<()> {
        let rel_class = class.to_relative().ok_or_else(|| {
            QatError::invalid_register(format!("{class:?} is not an absolute register class"))
        })?;
        let mode = self.ctx_mode(ae)?;
        let (rel, ctx) = abs_to_rel(mode, abs);
        self.rel_data_write(ae, ctx, rel_class, rel, value)
    }

    /// Read relative register `rel` of `class` in context `ctx` through
    /// `ALU_OUT`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegister`/`InvalidArgument` for a bad reference,
    /// `Busy` if the engine or its shared-ustore neighbour is running, or
    /// CSR access errors.
    pub fn rel_data_read(&mut self, ae: u8, ctx: u8, class: RegClass, rel: u16) -> Result<u32> {
        let (src, _) = self.resolve_rel(ae, ctx, class, rel)?;
        if self.state(ae)?.is_busy() {
            return Err(QatError::Busy { ae });
        }

        let misc = self.read(ae, regs::AE_MISC_CONTROL)?;
        if misc & ae_misc_control::SHARE_CS != 0 {
            let nae = shared_ustore_neighbour(ae);
            if self.is_present(nae) && self.state(nae)?.is_busy() {
                return Err(QatError::Busy { ae: nae });
            }
        }

        let saved_actx = self.read(ae, regs::ACTIVE_CTX_STATUS)?;
        let saved_uaddr = self.read(ae, regs::USTORE_ADDRESS)?;
        let saved_word = self.ucode_read(ae, 0, 1)?;
        let saved_ctxen = self.read(ae, regs::CTX_ENABLES)? & ctx_enables::IGNORE_W1C_MASK;

        let value = (|| -> Result<u32> {
            self.write(ae, regs::AE_MISC_CONTROL, misc & !ae_misc_control::SHARE_CS)?;
            self.write(ae, regs::ACTIVE_CTX_STATUS, u32::from(ctx) & active_ctx_status::ACNO_MASK)?;
            self.write(
                ae,
                regs::CTX_ENABLES,
                saved_ctxen & !ctx_enables::CNTL_STORE_PARITY_ENABLE,
            )?;
            self.ucode_write(ae, 0, &[alu_read(src, class.is_bank_a())])?;
            self.write(ae, regs::USTORE_ADDRESS, ustore_address::ECS)?;
            self.wait_num_cycles(ae, timing::CYCLES_FROM_READY2EXE, false)?;
            self.read(ae, regs::ALU_OUT)
        })();

        let mut restored = Ok(());
        for r in [
            self.ucode_write(ae, 0, &saved_word),
            self.write(ae, regs::USTORE_ADDRESS, saved_uaddr),
            self.write(ae, regs::CTX_ENABLES, saved_ctxen),
            self.write(ae, regs::ACTIVE_CTX_STATUS, saved_actx & active_ctx_status::ACNO_MASK),
            self.write(ae, regs::AE_MISC_CONTROL, misc),
        ] {
            restored = restored.and(r);
        }

        let value = value?;
        restored?;
        trace!("AE{ae}: ctx {ctx} {class:?}[{rel}] = {value:#x}");
        Ok(value)
    }

    /// Store `bytes` at local-memory byte address `addr` with one transient
    /// execution on context 0.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unaligned or out-of-range write, or
    /// the errors of [`Self::put_lm_batch`].
    pub fn write_local_memory(&mut self, ae: u8, addr: u16, bytes: &[u8]) -> Result<()> {
        let write = LmWrite {
            addr,
            bytes: bytes.to_vec(),
        };
        self.put_lm_batch(ae, std::slice::from_ref(&write), usize::MAX)
    }

    /// Replay local-memory writes, coalescing them into as few transient
    /// executions as fit in `flush_words` microwords each (terminator
    /// included).
    ///
    /// The scratch register the programs use (relative B0 of context 0) is
    /// saved first and restored after the last flush.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad write or one whose program alone
    /// exceeds `flush_words`, or execution errors.
    pub fn put_lm_batch(&mut self, ae: u8, writes: &[LmWrite], flush_words: usize) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let flush_words = flush_words.min(super::exec::USTORE_ADDRESSABLE);
        for w in writes {
            w.validate(ae)?;
            if lm_program_len(w.bytes.len()) + 1 > flush_words {
                return Err(QatError::invalid_argument(format!(
                    "AE{ae}: local memory write of {} bytes does not fit a {flush_words}-word flush",
                    w.bytes.len()
                )));
            }
        }

        let scratch = self.rel_data_read(ae, 0, RegClass::GpbRel, LM_SCRATCH_B)?;

        let mut flushes = 0usize;
        let result = (|| -> Result<()> {
            let mut prog: Vec<u64> = Vec::new();
            for w in writes.iter().filter(|w| !w.bytes.is_empty()) {
                if prog.len() + lm_program_len(w.bytes.len()) + 1 > flush_words {
                    self.flush_lm(ae, &mut prog)?;
                    flushes += 1;
                }
                push_lm_program(&mut prog, w.addr, &w.bytes);
            }
            if !prog.is_empty() {
                self.flush_lm(ae, &mut prog)?;
                flushes += 1;
            }
            Ok(())
        })();

        let restored = self.rel_data_write(ae, 0, RegClass::GpbRel, LM_SCRATCH_B, scratch);
        result?;
        restored?;
        debug!("AE{ae}: {} local memory writes in {flushes} executions", writes.len());
        Ok(())
    }

    fn flush_lm(&mut self, ae: u8, prog: &mut Vec<u64>) -> Result<()> {
        prog.push(CTX_ARB_KILL);
        self.exec_ucode(ae, 0, prog, ExecOptions::for_program(prog.len()))?;
        prog.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SoftwareAccelerator;
    use crate::config::RetryBudget;
    use qat_chip::ChipVariant;

    fn csr() -> AeCsr<SoftwareAccelerator> {
        let sim = SoftwareAccelerator::new(ChipVariant::Dh895xcc);
        let mask = sim.ae_mask();
        AeCsr::new(sim, mask, RetryBudget::default())
    }

    #[test]
    fn gpr_write_then_read() {
        let mut c = csr();
        c.rel_data_write(4, 3, RegClass::GpbRel, 7, 0xcafe_f00d).unwrap();
        assert_eq!(c.bus().gpr(4, false, 0x37), Some(0xcafe_f00d));
        assert_eq!(c.rel_data_read(4, 3, RegClass::GpbRel, 7).unwrap(), 0xcafe_f00d);
    }

    #[test]
    fn read_transfer_goes_through_window() {
        let mut c = csr();
        let before = c.bus().ustore_word(0, 0);
        c.rel_data_write(0, 2, RegClass::DrRdRel, 1, 0x55).unwrap();
        // 8-context mode: slot = 1 + 2*32 + 16
        assert_eq!(c.bus().xfer_rd(0, 81), Some(0x55));
        assert_eq!(c.bus().ustore_word(0, 0), before);
    }

    #[test]
    fn write_transfer_and_neighbour_use_microcode() {
        let mut c = csr();
        c.rel_data_write(1, 1, RegClass::SrWrRel, 2, 0x77).unwrap();
        assert_eq!(c.bus().xfer_wr(1, 34), Some(0x77));
        c.abs_data_write(1, RegClass::NeighAbs, 0x25, 0x99).unwrap();
        assert_eq!(c.bus().nn(1, 0x25), Some(0x99));
    }

    #[test]
    fn absolute_gpr_lands_in_owning_context() {
        let mut c = csr();
        c.abs_data_write(2, RegClass::GpaAbs, 0x4b, 0x1111).unwrap();
        assert_eq!(c.bus().gpr(2, true, 0x4b), Some(0x1111));
        assert!(matches!(
            c.abs_data_write(2, RegClass::GpaRel, 1, 0).unwrap_err(),
            QatError::InvalidRegister { .. }
        ));
    }

    #[test]
    fn local_memory_byte_runs() {
        let mut c = csr();
        let bytes: Vec<u8> = (1..=11).collect();
        c.write_local_memory(5, 0x40, &bytes).unwrap();
        let lm = c.bus().local_memory(5).unwrap();
        assert_eq!(&lm[0x40..0x4b], &bytes[..]);
        assert_eq!(lm[0x4b], 0);
    }

    #[test]
    fn scratch_register_survives_lm_writes() {
        let mut c = csr();
        c.rel_data_write(0, 0, RegClass::GpbRel, 0, 0xabcd).unwrap();
        c.write_local_memory(0, 0, &[9, 9, 9, 9, 9]).unwrap();
        assert_eq!(c.bus().gpr(0, false, 0), Some(0xabcd));
    }

    #[test]
    fn lm_bounds_checked() {
        let mut c = csr();
        assert!(c.write_local_memory(0, 2, &[1]).is_err());
        assert!(c.write_local_memory(0, 0xffc, &[1, 2, 3, 4, 5]).is_err());
        assert!(c.write_local_memory(0, 0xffc, &[1, 2, 3, 4]).is_ok());
    }
}
