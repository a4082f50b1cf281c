// SPDX-License-Identifier: AGPL-3.0-only

//! Software (virtual accelerator) backend
//!
//! Implements [`CsrBus`] over an in-process model of the engine register
//! spaces. This enables:
//!
//! 1. **CI without hardware**: the whole bring-up and firmware pipeline runs
//!    against the model, including transient microcode execution.
//!
//! 2. **Fault injection**: busy CSRs, a frozen profile counter, a stuck
//!    reset and FCU failures can be switched on per test.
//!
//! 3. **Inspection**: register files, local memory, microstore and the FCU
//!    command log are readable after the fact.
//!
//! ## Execution model
//!
//! Enabling a context in `CTX_ENABLES` runs it immediately from its PC in
//! `CTX_STS_INDIRECT`. The synthesized instruction subset of
//! [`qat_chip::ucode`] executes; `ctx_arb[kill]` disables the context and
//! idles it. Any other opcode leaves the context enabled and busy, which is
//! how loaded firmware looks from the host.
//!
//! Writing `USTORE_ADDRESS` with the ECS bit issues the word at that address
//! directly, which is how register reads reach `ALU_OUT`.

use crate::csr::{CsrBus, Space};
use crate::error::{QatError, Result};
use qat_chip::regfile::{
    rel_to_abs, xfer_slot, ContextMode, GPR_PER_BANK, LMEM_WORDS, LM_INDEX0, LM_INDEX1, MAX_CTX,
    XFER_SLOTS,
};
use qat_chip::regs::{
    self, active_ctx_status, ctx_enables, ctx_sts, fcu_ctrl, fcu_status, reset, ustore_address,
};
use qat_chip::ucode::{self, Insn};
use qat_chip::variant::{Fuses, HwVariant};
use qat_chip::ChipVariant;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Size of each engine's local CSR window.
const AE_LOCAL_STRIDE: usize = 1 << 12;
/// Size of each engine's transfer window.
const AE_XFER_STRIDE: usize = 1 << 10;
/// Size of the global window.
const GLOBAL_SIZE: usize = 0x1000;
/// Profile counter advance per read.
const PROFILE_STEP: u32 = 4;

/// Injectable device misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `LOCAL_CSR_STATUS` of `ae` always reports busy.
    CsrBusy {
        /// Affected engine
        ae: u8,
    },
    /// `PROFILE_COUNT` of `ae` never advances.
    FrozenProfileCounter {
        /// Affected engine
        ae: u8,
    },
    /// Reset bits cannot be cleared.
    StuckReset,
    /// FCU rejects every image signature.
    FcuVerifyFail,
    /// FCU accepts commands but never reports completion.
    FcuSilent,
}

/// One FCU command as seen by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcuCommand {
    /// Authenticate the image at the programmed bus address.
    Auth {
        /// Bus address from `FCU_DRAM_ADDR_HI/LO`
        bus_addr: u64,
    },
    /// Load the staged image into an engine.
    Load {
        /// Target engine
        ae: u8,
    },
    /// Start all loaded engines.
    Start,
}

#[derive(Debug)]
struct SimEngine {
    csrs: HashMap<usize, u32>,
    indirect: [[u32; regs::INDIRECT_CSRS.len()]; MAX_CTX as usize],
    ustore: Vec<u64>,
    ustore_addr: u32,
    data_lower: u32,
    alu_out: u32,
    ctx_enables: u32,
    acno: u32,
    running: u8,
    profile: u32,
    gpr_a: [u32; GPR_PER_BANK as usize],
    gpr_b: [u32; GPR_PER_BANK as usize],
    nn: [u32; GPR_PER_BANK as usize],
    xfer_rd: [u32; XFER_SLOTS],
    xfer_wr: [u32; XFER_SLOTS],
    lm: Vec<u32>,
    ecc_errors: u32,
}

impl SimEngine {
    fn new(ustore_words: usize) -> Self {
        Self {
            csrs: HashMap::new(),
            indirect: [[0; regs::INDIRECT_CSRS.len()]; MAX_CTX as usize],
            ustore: vec![0; ustore_words],
            ustore_addr: 0,
            data_lower: 0,
            alu_out: 0,
            ctx_enables: 0,
            acno: 0,
            running: 0,
            profile: 0,
            gpr_a: [0; GPR_PER_BANK as usize],
            gpr_b: [0; GPR_PER_BANK as usize],
            nn: [0; GPR_PER_BANK as usize],
            xfer_rd: [0; XFER_SLOTS],
            xfer_wr: [0; XFER_SLOTS],
            lm: vec![0; LMEM_WORDS],
            ecc_errors: 0,
        }
    }

    fn reset(&mut self) {
        self.ctx_enables = 0;
        self.running = 0;
        self.acno = 0;
    }

    fn mode(&self) -> ContextMode {
        ContextMode::from_ctx_enables(self.ctx_enables)
    }

    fn ctx_pointer(&self) -> usize {
        (self.csrs.get(&regs::CSR_CTX_POINTER).copied().unwrap_or(0) & 0x7) as usize
    }

    fn indirect_slot(csr: usize) -> Option<usize> {
        regs::INDIRECT_CSRS.iter().position(|&c| c == csr)
    }

    fn indirect_of(&self, ctx: u8, csr: usize) -> u32 {
        Self::indirect_slot(csr).map_or(0, |slot| self.indirect[ctx as usize][slot])
    }

    fn set_indirect(&mut self, ctx: u8, csr: usize, value: u32) {
        if let Some(slot) = Self::indirect_slot(csr) {
            self.indirect[ctx as usize][slot] = value;
        }
    }

    fn lm_addr_csr(addr: u16) -> usize {
        if addr == LM_INDEX1 {
            regs::LM_ADDR_1_INDIRECT
        } else {
            regs::LM_ADDR_0_INDIRECT
        }
    }

    fn read_operand(&self, ctx: u8, addr: u16, bank_a: bool) -> u32 {
        let mode = self.mode();
        match addr {
            0x000..=0x01f => {
                let abs = rel_to_abs(mode, addr, ctx) as usize;
                if bank_a { self.gpr_a[abs] } else { self.gpr_b[abs] }
            }
            0x080..=0x0ff => {
                let abs = (addr & 0x7f) as usize;
                if bank_a { self.gpr_a[abs] } else { self.gpr_b[abs] }
            }
            0x180..=0x19f => self.xfer_rd[xfer_slot(mode, false, addr & 0x1f, ctx) as usize],
            0x1c0..=0x1df => self.xfer_rd[xfer_slot(mode, true, addr & 0x1f, ctx) as usize],
            LM_INDEX0 | LM_INDEX1 => self.indirect_of(ctx, Self::lm_addr_csr(addr)),
            0x280..=0x29f => self.nn[rel_to_abs(mode, addr & 0x1f, ctx) as usize],
            0x300..=0x3ff => u32::from(addr & 0xff),
            _ => 0,
        }
    }

    fn write_operand(&mut self, ctx: u8, addr: u16, bank_a: bool, f: impl FnOnce(u32) -> u32) {
        let mode = self.mode();
        let slot: Option<&mut u32> = match addr {
            0x000..=0x01f => {
                let abs = rel_to_abs(mode, addr, ctx) as usize;
                Some(if bank_a { &mut self.gpr_a[abs] } else { &mut self.gpr_b[abs] })
            }
            0x080..=0x0ff => {
                let abs = (addr & 0x7f) as usize;
                Some(if bank_a { &mut self.gpr_a[abs] } else { &mut self.gpr_b[abs] })
            }
            0x180..=0x19f => Some(&mut self.xfer_wr[xfer_slot(mode, false, addr & 0x1f, ctx) as usize]),
            0x1c0..=0x1df => Some(&mut self.xfer_wr[xfer_slot(mode, true, addr & 0x1f, ctx) as usize]),
            0x280..=0x29f => Some(&mut self.nn[rel_to_abs(mode, addr & 0x1f, ctx) as usize]),
            LM_INDEX0 | LM_INDEX1 => {
                let csr = Self::lm_addr_csr(addr);
                let value = f(self.indirect_of(ctx, csr));
                self.set_indirect(ctx, csr, value);
                return;
            }
            _ => None,
        };
        if let Some(slot) = slot {
            *slot = f(*slot);
        }
    }

    fn lm_index(&self, ctx: u8) -> usize {
        ((self.indirect_of(ctx, regs::LM_ADDR_0_INDIRECT) >> 2) as usize) % LMEM_WORDS
    }

    /// Execute one instruction.
    fn step(&mut self, ctx: u8, word: u64) -> Step {
        match ucode::decode(word) {
            Insn::ImmedW0 { dest, bank_a, half } => {
                self.write_operand(ctx, dest, bank_a, |v| (v & 0xffff_0000) | u32::from(half));
            }
            Insn::ImmedW1 { dest, bank_a, half } => {
                self.write_operand(ctx, dest, bank_a, |v| (v & 0xffff) | (u32::from(half) << 16));
            }
            Insn::Nop => {}
            Insn::Kill => return Step::Killed,
            Insn::AluRead { src, bank_a } => self.alu_out = self.read_operand(ctx, src, bank_a),
            Insn::LmStore { src } => {
                let idx = self.lm_index(ctx);
                self.lm[idx] = self.read_operand(ctx, src, false);
                let next = self.indirect_of(ctx, regs::LM_ADDR_0_INDIRECT).wrapping_add(4);
                self.set_indirect(ctx, regs::LM_ADDR_0_INDIRECT, next);
            }
            Insn::LmField { src, byte_mask } => {
                let idx = self.lm_index(ctx);
                let value = self.read_operand(ctx, src, false);
                let lanes = (0..4).filter(|b| byte_mask & (1 << b) != 0);
                let mask = lanes.fold(0u32, |m, b| m | (0xff << (b * 8)));
                self.lm[idx] = (self.lm[idx] & !mask) | (value & mask);
            }
            Insn::Other(_) => return Step::Running,
        }
        Step::Continue
    }

    fn run(&mut self, ctx: u8) {
        let mut pc = self.indirect_of(ctx, regs::CTX_STS_INDIRECT) & ctx_sts::UPC_MASK;
        let limit = self.ustore.len();
        let mut outcome = Step::Running;
        for _ in 0..limit {
            let Some(&word) = self.ustore.get(pc as usize) else {
                break;
            };
            outcome = self.step(ctx, word);
            if outcome != Step::Continue {
                break;
            }
            pc = (pc + 1) & ctx_sts::UPC_MASK;
        }
        self.set_indirect(ctx, regs::CTX_STS_INDIRECT, pc);
        if outcome == Step::Killed {
            self.ctx_enables &= !ctx_enables::enable(1 << ctx);
            self.running &= !(1 << ctx);
        } else {
            self.running |= 1 << ctx;
            self.acno = u32::from(ctx);
        }
        trace!("ctx {ctx} stopped at pc {pc:#x} ({outcome:?})");
    }

    fn write_ctx_enables(&mut self, value: u32) {
        let before = ctx_enables::enabled(self.ctx_enables);
        self.ctx_enables = value & ctx_enables::IGNORE_W1C_MASK;
        let mut after = ctx_enables::enabled(self.ctx_enables);
        if self.mode() == ContextMode::Four {
            after &= ContextMode::Four.ctx_mask();
        }
        self.running &= after;
        for ctx in (0..MAX_CTX).filter(|c| (after & !before) & (1 << c) != 0) {
            self.run(ctx);
        }
    }

    fn issue_ecs(&mut self) {
        let pc = (self.ustore_addr & ctx_sts::UPC_MASK) as usize;
        if let Some(&word) = self.ustore.get(pc) {
            if let Insn::AluRead { src, bank_a } = ucode::decode(word) {
                let ctx = (self.acno & active_ctx_status::ACNO_MASK) as u8;
                self.alu_out = self.read_operand(ctx, src, bank_a);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Killed,
    Running,
}

/// Software model of a QAT accelerator's engine and global CSR spaces.
#[derive(Debug)]
pub struct SoftwareAccelerator {
    variant: ChipVariant,
    fuses: Fuses,
    engines: Vec<SimEngine>,
    global: HashMap<usize, u32>,
    faults: HashSet<Fault>,
    fcu_log: Vec<FcuCommand>,
    csr_writes: u64,
}

impl SoftwareAccelerator {
    /// Model a fully enabled part of `variant`.
    pub fn new(variant: ChipVariant) -> Self {
        Self::with_fuses(variant, Fuses::default())
    }

    /// Model a part with some engines or accelerators fused off.
    pub fn with_fuses(variant: ChipVariant, fuses: Fuses) -> Self {
        let ustore = variant.ustore_words() as usize;
        let engines = (0..variant.max_engines()).map(|_| SimEngine::new(ustore)).collect();
        debug!("SoftwareAccelerator: {} with {} engines", variant.name(), variant.max_engines());
        Self {
            variant,
            fuses,
            engines,
            global: HashMap::new(),
            faults: HashSet::new(),
            fcu_log: Vec::new(),
            csr_writes: 0,
        }
    }

    /// Modelled chip.
    pub const fn variant(&self) -> ChipVariant {
        self.variant
    }

    /// Fuse words the bus layer would report.
    pub const fn fuses(&self) -> Fuses {
        self.fuses
    }

    /// Enabled engines.
    pub fn ae_mask(&self) -> u32 {
        self.variant.ae_mask(self.fuses)
    }

    /// Enabled accelerators.
    pub fn accel_mask(&self) -> u32 {
        self.variant.accel_mask(self.fuses)
    }

    /// Switch a fault on.
    pub fn inject(&mut self, fault: Fault) {
        debug!("SoftwareAccelerator: injecting {fault:?}");
        self.faults.insert(fault);
    }

    /// Switch a fault off.
    pub fn clear(&mut self, fault: Fault) {
        self.faults.remove(&fault);
    }

    /// Number of CSR writes performed so far, in any space.
    pub const fn csr_writes(&self) -> u64 {
        self.csr_writes
    }

    /// FCU commands received so far.
    pub fn fcu_log(&self) -> &[FcuCommand] {
        &self.fcu_log
    }

    fn engine(&self, ae: u8) -> Option<&SimEngine> {
        self.engines.get(ae as usize)
    }

    /// Absolute GPR of bank A (`bank_a`) or B.
    pub fn gpr(&self, ae: u8, bank_a: bool, abs: u16) -> Option<u32> {
        let e = self.engine(ae)?;
        let bank = if bank_a { &e.gpr_a } else { &e.gpr_b };
        bank.get(abs as usize).copied()
    }

    /// Read-transfer register slot.
    pub fn xfer_rd(&self, ae: u8, slot: u16) -> Option<u32> {
        self.engine(ae)?.xfer_rd.get(slot as usize).copied()
    }

    /// Write-transfer register slot.
    pub fn xfer_wr(&self, ae: u8, slot: u16) -> Option<u32> {
        self.engine(ae)?.xfer_wr.get(slot as usize).copied()
    }

    /// Next-neighbour register.
    pub fn nn(&self, ae: u8, abs: u16) -> Option<u32> {
        self.engine(ae)?.nn.get(abs as usize).copied()
    }

    /// Local memory as bytes (little-endian words).
    pub fn local_memory(&self, ae: u8) -> Option<Vec<u8>> {
        Some(self.engine(ae)?.lm.iter().flat_map(|w| w.to_le_bytes()).collect())
    }

    /// Microstore word, ECC included.
    pub fn ustore_word(&self, ae: u8, addr: usize) -> Option<u64> {
        self.engine(ae)?.ustore.get(addr).copied()
    }

    /// Microstore words committed with a wrong ECC field.
    pub fn ecc_errors(&self, ae: u8) -> u32 {
        self.engine(ae).map_or(0, |e| e.ecc_errors)
    }

    /// Current value of a local CSR without read side effects.
    pub fn peek(&self, ae: u8, csr: usize) -> Option<u32> {
        let e = self.engine(ae)?;
        Some(match csr {
            regs::CTX_ENABLES => e.ctx_enables,
            regs::ACTIVE_CTX_STATUS => Self::active_status(e),
            regs::PROFILE_COUNT => e.profile,
            regs::ALU_OUT => e.alu_out,
            _ if regs::is_indirect(csr) => e.indirect_of(e.ctx_pointer() as u8, csr),
            _ => e.csrs.get(&csr).copied().unwrap_or(0),
        })
    }

    /// Per-context CSR of `ctx` without touching the context pointer.
    pub fn peek_indirect(&self, ae: u8, ctx: u8, csr: usize) -> Option<u32> {
        Some(self.engine(ae)?.indirect_of(ctx, csr))
    }

    /// Global CSR without side effects.
    pub fn peek_global(&self, offset: usize) -> u32 {
        self.global.get(&offset).copied().unwrap_or(0)
    }

    fn active_status(e: &SimEngine) -> u32 {
        let abo = if e.running != 0 { active_ctx_status::ABO } else { 0 };
        abo | (e.acno & active_ctx_status::ACNO_MASK)
    }

    fn split_local(&self, offset: usize) -> Result<(u8, usize)> {
        let ae = offset / AE_LOCAL_STRIDE;
        if ae >= self.engines.len() {
            return Err(QatError::invalid_argument(format!(
                "AE local offset {offset:#x} outside {} engines",
                self.engines.len()
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let ae = ae as u8;
        Ok((ae, offset % AE_LOCAL_STRIDE))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_local(&mut self, ae: u8, csr: usize) -> u32 {
        let frozen = self.faults.contains(&Fault::FrozenProfileCounter { ae });
        let busy = self.faults.contains(&Fault::CsrBusy { ae });
        let e = &mut self.engines[ae as usize];
        match csr {
            regs::LOCAL_CSR_STATUS => u32::from(busy),
            regs::PROFILE_COUNT => {
                if !frozen {
                    e.profile = (e.profile + PROFILE_STEP) & regs::profile_count::MASK;
                }
                e.profile
            }
            regs::CTX_ENABLES => e.ctx_enables,
            regs::ACTIVE_CTX_STATUS => Self::active_status(e),
            regs::ALU_OUT => e.alu_out,
            regs::USTORE_ADDRESS => e.ustore_addr,
            regs::USTORE_DATA_LOWER | regs::USTORE_DATA_UPPER => {
                let pc = (e.ustore_addr & ctx_sts::UPC_MASK) as usize;
                let word = e.ustore.get(pc).copied().unwrap_or(0);
                if csr == regs::USTORE_DATA_LOWER {
                    word as u32
                } else {
                    (word >> 32) as u32
                }
            }
            _ if regs::is_indirect(csr) => {
                let ctx = e.ctx_pointer() as u8;
                e.indirect_of(ctx, csr)
            }
            _ => e.csrs.get(&csr).copied().unwrap_or(0),
        }
    }

    fn write_local(&mut self, ae: u8, csr: usize, value: u32) {
        let e = &mut self.engines[ae as usize];
        match csr {
            regs::CTX_ENABLES => e.write_ctx_enables(value),
            regs::ACTIVE_CTX_STATUS => e.acno = value & active_ctx_status::ACNO_MASK,
            regs::PROFILE_COUNT | regs::LOCAL_CSR_STATUS | regs::ALU_OUT => {}
            regs::USTORE_ADDRESS => {
                e.ustore_addr = value;
                if value & ustore_address::ECS != 0 {
                    e.issue_ecs();
                }
            }
            regs::USTORE_DATA_LOWER => e.data_lower = value,
            regs::USTORE_DATA_UPPER => {
                let word = (u64::from(value) << 32) | u64::from(e.data_lower);
                if !ucode::ecc_ok(word) {
                    e.ecc_errors += 1;
                }
                let pc = (e.ustore_addr & ctx_sts::UPC_MASK) as usize;
                if let Some(slot) = e.ustore.get_mut(pc) {
                    *slot = word;
                }
                let next = (e.ustore_addr & ctx_sts::UPC_MASK) + 1;
                e.ustore_addr = (e.ustore_addr & !ctx_sts::UPC_MASK) | (next & ctx_sts::UPC_MASK);
            }
            _ if regs::is_indirect(csr) => {
                let ctx = e.ctx_pointer() as u8;
                e.set_indirect(ctx, csr, value);
            }
            _ => {
                e.csrs.insert(csr, value);
            }
        }
    }

    fn write_global_reg(&mut self, offset: usize, value: u32) {
        match offset {
            regs::GLOBAL_RESET => {
                let old = self.peek_global(offset);
                let asserted = value & !old;
                for ae in 0..self.engines.len() {
                    if (asserted >> (reset::AE_SHIFT as usize + ae)) & 1 != 0 {
                        self.engines[ae].reset();
                    }
                }
                let value = if self.faults.contains(&Fault::StuckReset) { value | old } else { value };
                self.global.insert(offset, value);
            }
            regs::FCU_CTRL => {
                self.global.insert(offset, value);
                self.fcu_command(value);
            }
            _ => {
                self.global.insert(offset, value);
            }
        }
    }

    fn fcu_command(&mut self, ctrl: u32) {
        let status = self.peek_global(regs::FCU_STATUS);
        let loaded = status & !((1 << fcu_status::LOADED_AE_SHIFT) - 1);
        let silent = self.faults.contains(&Fault::FcuSilent);
        let next = match ctrl & 0xff {
            fcu_ctrl::CMD_AUTH => {
                let hi = u64::from(self.peek_global(regs::FCU_DRAM_ADDR_HI));
                let lo = u64::from(self.peek_global(regs::FCU_DRAM_ADDR_LO));
                self.fcu_log.push(FcuCommand::Auth { bus_addr: (hi << 32) | lo });
                if self.faults.contains(&Fault::FcuVerifyFail) {
                    loaded | fcu_status::STS_VERI_FAIL
                } else {
                    loaded | fcu_status::AUTHFWLD | fcu_status::STS_VERI_DONE
                }
            }
            fcu_ctrl::CMD_LOAD => {
                #[allow(clippy::cast_possible_truncation)]
                let ae = ((ctrl >> fcu_ctrl::AE_SHIFT) & 0x1f) as u8;
                self.fcu_log.push(FcuCommand::Load { ae });
                loaded
                    | (1 << (fcu_status::LOADED_AE_SHIFT + u32::from(ae)))
                    | fcu_status::AUTHFWLD
                    | fcu_status::STS_LOAD_DONE
            }
            fcu_ctrl::CMD_START => {
                self.fcu_log.push(FcuCommand::Start);
                status | fcu_status::DONE
            }
            _ => status,
        };
        let next = if silent { fcu_status::STS_BUSY } else { next };
        self.global.insert(regs::FCU_STATUS, next);
    }
}

impl CsrBus for SoftwareAccelerator {
    fn read32(&mut self, space: Space, offset: usize) -> Result<u32> {
        let value = match space {
            Space::AeLocal => {
                let (ae, csr) = self.split_local(offset)?;
                self.read_local(ae, csr)
            }
            Space::AeXfer => {
                let ae = offset / AE_XFER_STRIDE;
                let slot = (offset % AE_XFER_STRIDE) >> 2;
                self.engines
                    .get(ae)
                    .and_then(|e| e.xfer_rd.get(slot).copied())
                    .ok_or_else(|| QatError::invalid_argument(format!("xfer offset {offset:#x}")))?
            }
            Space::Global => {
                if offset >= GLOBAL_SIZE {
                    return Err(QatError::invalid_argument(format!("global offset {offset:#x}")));
                }
                self.peek_global(offset)
            }
        };
        trace!("sim read {space:?} @ {offset:#x} = {value:#x}");
        Ok(value)
    }

    fn write32(&mut self, space: Space, offset: usize, value: u32) -> Result<()> {
        trace!("sim write {space:?} @ {offset:#x} = {value:#x}");
        self.csr_writes += 1;
        match space {
            Space::AeLocal => {
                let (ae, csr) = self.split_local(offset)?;
                self.write_local(ae, csr, value);
            }
            Space::AeXfer => {
                let ae = offset / AE_XFER_STRIDE;
                let slot = (offset % AE_XFER_STRIDE) >> 2;
                let reg = self
                    .engines
                    .get_mut(ae)
                    .and_then(|e| e.xfer_rd.get_mut(slot))
                    .ok_or_else(|| QatError::invalid_argument(format!("xfer offset {offset:#x}")))?;
                *reg = value;
            }
            Space::Global => {
                if offset >= GLOBAL_SIZE {
                    return Err(QatError::invalid_argument(format!("global offset {offset:#x}")));
                }
                self.write_global_reg(offset, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qat_chip::ucode::{immed_w0, immed_w1, set_ecc, CTX_ARB_KILL};

    fn load(sim: &mut SoftwareAccelerator, ae: u8, words: &[u64]) {
        let base = regs::ae_local(ae, 0);
        sim.write32(Space::AeLocal, base + regs::USTORE_ADDRESS, 0).unwrap();
        for &w in words {
            let w = set_ecc(w);
            sim.write32(Space::AeLocal, base + regs::USTORE_DATA_LOWER, w as u32).unwrap();
            sim.write32(Space::AeLocal, base + regs::USTORE_DATA_UPPER, (w >> 32) as u32)
                .unwrap();
        }
    }

    #[test]
    fn enabled_context_runs_until_kill() {
        let mut sim = SoftwareAccelerator::new(ChipVariant::C3xxx);
        load(&mut sim, 1, &[immed_w1(0x85, true, 0xdead_beef), immed_w0(0x85, true, 0xdead_beef), CTX_ARB_KILL]);
        let base = regs::ae_local(1, 0);
        sim.write32(Space::AeLocal, base + regs::CTX_ENABLES, ctx_enables::enable(1)).unwrap();

        assert_eq!(sim.gpr(1, true, 5), Some(0xdead_beef));
        assert_eq!(sim.peek(1, regs::CTX_ENABLES), Some(0));
        assert_eq!(sim.peek(1, regs::ACTIVE_CTX_STATUS).unwrap() & active_ctx_status::ABO, 0);
        assert_eq!(sim.peek_indirect(1, 0, regs::CTX_STS_INDIRECT), Some(2));
        assert_eq!(sim.ecc_errors(1), 0);
    }

    #[test]
    fn unknown_opcode_keeps_context_busy() {
        let mut sim = SoftwareAccelerator::new(ChipVariant::C3xxx);
        load(&mut sim, 0, &[0x0123_4567_89ab]);
        let base = regs::ae_local(0, 0);
        sim.write32(Space::AeLocal, base + regs::CTX_ENABLES, ctx_enables::enable(0x1)).unwrap();
        assert_ne!(sim.peek(0, regs::ACTIVE_CTX_STATUS).unwrap() & active_ctx_status::ABO, 0);
        assert_eq!(ctx_enables::enabled(sim.peek(0, regs::CTX_ENABLES).unwrap()), 1);
    }

    #[test]
    fn words_without_ecc_are_counted() {
        let mut sim = SoftwareAccelerator::new(ChipVariant::C3xxx);
        let base = regs::ae_local(0, 0);
        sim.write32(Space::AeLocal, base + regs::USTORE_DATA_LOWER, 0x1).unwrap();
        sim.write32(Space::AeLocal, base + regs::USTORE_DATA_UPPER, 0).unwrap();
        assert_eq!(sim.ecc_errors(0), 1);
    }

    #[test]
    fn fcu_reports_per_engine_loads() {
        let mut sim = SoftwareAccelerator::new(ChipVariant::C62x);
        sim.write32(Space::Global, regs::FCU_CTRL, fcu_ctrl::CMD_AUTH).unwrap();
        let s = sim.read32(Space::Global, regs::FCU_STATUS).unwrap();
        assert_eq!(fcu_status::code(s), fcu_status::STS_VERI_DONE);
        sim.write32(Space::Global, regs::FCU_CTRL, fcu_ctrl::load(4)).unwrap();
        let s = sim.read32(Space::Global, regs::FCU_STATUS).unwrap();
        assert!(fcu_status::ae_loaded(s, 4));
        assert_eq!(sim.fcu_log().len(), 2);
    }

    #[test]
    fn frozen_counter_never_moves() {
        let mut sim = SoftwareAccelerator::new(ChipVariant::C3xxx);
        sim.inject(Fault::FrozenProfileCounter { ae: 0 });
        let off = regs::ae_local(0, regs::PROFILE_COUNT);
        let a = sim.read32(Space::AeLocal, off).unwrap();
        let b = sim.read32(Space::AeLocal, off).unwrap();
        assert_eq!(a, b);
        let off = regs::ae_local(1, regs::PROFILE_COUNT);
        assert_ne!(sim.read32(Space::AeLocal, off).unwrap(), sim.read32(Space::AeLocal, off).unwrap());
    }
}
