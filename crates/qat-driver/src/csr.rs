//! Register access layer
//!
//! [`CsrBus`] is the raw 32-bit window onto the three register spaces; it is
//! implemented by the mapped BAR ([`crate::mmio::MmioCsrBus`]) and by the
//! software model ([`crate::backends::SoftwareAccelerator`]).
//!
//! [`AeCsr`] layers the engine protocol on top:
//!
//! - every local CSR access is confirmed against `LOCAL_CSR_STATUS` and
//!   retried within a fixed budget
//! - per-context ("indirect") CSRs are reached by swapping `CSR_CTX_POINTER`
//!   and always restoring it afterwards

use crate::config::RetryBudget;
use crate::error::{QatError, Result};
use qat_chip::regfile::MAX_CTX;
use qat_chip::regs::{self, csr_ctx_pointer, local_csr_status};
use std::fmt::Debug;
use tracing::warn;

/// Register space addressed by a [`CsrBus`] access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    /// Per-engine local CSRs, offsets from [`regs::ae_local`].
    AeLocal,
    /// Per-engine read-transfer registers, offsets from [`regs::ae_xfer`].
    AeXfer,
    /// Global CSRs (reset, clocks, FCU).
    Global,
}

/// Raw CSR window.
///
/// Offsets are byte offsets within `space`. Implementations only check that
/// the access lies inside the mapping; busy handling belongs to [`AeCsr`].
pub trait CsrBus: Debug + Send {
    /// Read one register.
    ///
    /// # Errors
    ///
    /// Returns error if the offset lies outside the mapped window.
    fn read32(&mut self, space: Space, offset: usize) -> Result<u32>;

    /// Write one register.
    ///
    /// # Errors
    ///
    /// Returns error if the offset lies outside the mapped window.
    fn write32(&mut self, space: Space, offset: usize, value: u32) -> Result<()>;
}

impl<B: CsrBus + ?Sized> CsrBus for Box<B> {
    fn read32(&mut self, space: Space, offset: usize) -> Result<u32> {
        (**self).read32(space, offset)
    }

    fn write32(&mut self, space: Space, offset: usize, value: u32) -> Result<()> {
        (**self).write32(space, offset, value)
    }
}

/// Engine-aware register access with busy retry and context-pointer
/// management.
#[derive(Debug)]
pub struct AeCsr<B> {
    bus: B,
    ae_mask: u32,
    retries: RetryBudget,
}

impl<B: CsrBus> AeCsr<B> {
    /// Wrap `bus` for the engines in `ae_mask`.
    pub const fn new(bus: B, ae_mask: u32, retries: RetryBudget) -> Self {
        Self {
            bus,
            ae_mask,
            retries,
        }
    }

    /// Poll budgets.
    pub const fn retries(&self) -> RetryBudget {
        self.retries
    }

    /// Enabled engines.
    pub const fn ae_mask(&self) -> u32 {
        self.ae_mask
    }

    /// Whether engine `ae` is present.
    pub const fn is_present(&self, ae: u8) -> bool {
        ae < 32 && (self.ae_mask >> ae) & 1 != 0
    }

    /// Present engines in ascending order.
    pub fn engines(&self) -> impl Iterator<Item = u8> + '_ {
        (0..32u8).filter(move |&ae| self.is_present(ae))
    }

    /// Underlying bus.
    pub const fn bus(&self) -> &B {
        &self.bus
    }

    /// Underlying bus, mutably.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Release the bus.
    pub fn into_inner(self) -> B {
        self.bus
    }

    pub(crate) fn check_ae(&self, ae: u8) -> Result<()> {
        if self.is_present(ae) {
            Ok(())
        } else {
            Err(QatError::invalid_argument(format!(
                "AE{ae} not present (mask {:#x})",
                self.ae_mask
            )))
        }
    }

    fn local_busy(&mut self, ae: u8) -> Result<bool> {
        let status = self
            .bus
            .read32(Space::AeLocal, regs::ae_local(ae, regs::LOCAL_CSR_STATUS))?;
        Ok(status & local_csr_status::STATUS != 0)
    }

    /// Read local CSR `csr` of engine `ae`.
    ///
    /// # Errors
    ///
    /// Returns `CsrTimeout` if the access stays busy for the whole retry
    /// budget, or `InvalidArgument` if `ae` is not present.
    pub fn read(&mut self, ae: u8, csr: usize) -> Result<u32> {
        self.check_ae(ae)?;
        let offset = regs::ae_local(ae, csr);
        for _ in 0..=self.retries.csr {
            let value = self.bus.read32(Space::AeLocal, offset)?;
            if !self.local_busy(ae)? {
                return Ok(value);
            }
        }
        warn!("AE{ae}: local CSR read of {csr:#x} stayed busy");
        Err(QatError::csr_timeout(ae, csr))
    }

    /// Write local CSR `csr` of engine `ae`.
    ///
    /// # Errors
    ///
    /// Returns `CsrTimeout` if the access stays busy for the whole retry
    /// budget, or `InvalidArgument` if `ae` is not present.
    pub fn write(&mut self, ae: u8, csr: usize, value: u32) -> Result<()> {
        self.check_ae(ae)?;
        let offset = regs::ae_local(ae, csr);
        for _ in 0..=self.retries.csr {
            self.bus.write32(Space::AeLocal, offset, value)?;
            if !self.local_busy(ae)? {
                return Ok(());
            }
        }
        warn!("AE{ae}: local CSR write of {csr:#x} = {value:#x} stayed busy");
        Err(QatError::csr_timeout(ae, csr))
    }

    /// Read-modify-write of a local CSR.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Self::read`] and [`Self::write`].
    pub fn modify(&mut self, ae: u8, csr: usize, f: impl FnOnce(u32) -> u32) -> Result<()> {
        let value = self.read(ae, csr)?;
        self.write(ae, csr, f(value))
    }

    /// Write read-transfer register slot `reg` of engine `ae`.
    ///
    /// # Errors
    ///
    /// Returns error if `ae` is not present or the bus rejects the access.
    pub fn write_xfer(&mut self, ae: u8, reg: u16, value: u32) -> Result<()> {
        self.check_ae(ae)?;
        self.bus
            .write32(Space::AeXfer, regs::ae_xfer(ae, usize::from(reg)), value)
    }

    /// Read a global CSR.
    ///
    /// # Errors
    ///
    /// Returns error if the bus rejects the access.
    pub fn read_global(&mut self, offset: usize) -> Result<u32> {
        self.bus.read32(Space::Global, offset)
    }

    /// Write a global CSR.
    ///
    /// # Errors
    ///
    /// Returns error if the bus rejects the access.
    pub fn write_global(&mut self, offset: usize, value: u32) -> Result<()> {
        self.bus.write32(Space::Global, offset, value)
    }

    fn check_indirect(csr: usize) -> Result<()> {
        if regs::is_indirect(csr) {
            Ok(())
        } else {
            Err(QatError::invalid_argument(format!(
                "CSR {csr:#x} is not context indirect"
            )))
        }
    }

    /// Read per-context CSR `csr` of context `ctx`.
    ///
    /// The context pointer is only rewritten when it differs from `ctx`, and
    /// is restored even if the access fails.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad context or a direct CSR, or the
    /// first access error.
    pub fn indirect_read(&mut self, ae: u8, ctx: u8, csr: usize) -> Result<u32> {
        if ctx >= MAX_CTX {
            return Err(QatError::invalid_argument(format!("context {ctx} out of range")));
        }
        Self::check_indirect(csr)?;

        let saved = self.read(ae, regs::CSR_CTX_POINTER)?;
        let swap = saved & csr_ctx_pointer::CTX_MASK != u32::from(ctx);
        if swap {
            self.write(ae, regs::CSR_CTX_POINTER, u32::from(ctx))?;
        }
        let value = self.read(ae, csr);
        if swap {
            let restored = self.write(ae, regs::CSR_CTX_POINTER, saved);
            let value = value?;
            restored?;
            return Ok(value);
        }
        value
    }

    /// Write `value` to per-context CSR `csr` of every context in
    /// `ctx_mask`.
    ///
    /// The context pointer is restored once at the end, even on failure.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a direct CSR, or the first access error.
    pub fn indirect_write(&mut self, ae: u8, ctx_mask: u8, csr: usize, value: u32) -> Result<()> {
        Self::check_indirect(csr)?;

        let saved = self.read(ae, regs::CSR_CTX_POINTER)?;
        let mut result = Ok(());
        for ctx in (0..MAX_CTX).filter(|c| ctx_mask & (1 << c) != 0) {
            result = self
                .write(ae, regs::CSR_CTX_POINTER, u32::from(ctx))
                .and_then(|()| self.write(ae, csr, value));
            if result.is_err() {
                break;
            }
        }
        let restored = self.write(ae, regs::CSR_CTX_POINTER, saved);
        result.and(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Fault, SoftwareAccelerator};
    use qat_chip::ChipVariant;

    fn csr() -> AeCsr<SoftwareAccelerator> {
        let sim = SoftwareAccelerator::new(ChipVariant::C3xxx);
        let mask = sim.ae_mask();
        let retries = RetryBudget { csr: 8, ..RetryBudget::default() };
        AeCsr::new(sim, mask, retries)
    }

    #[test]
    fn busy_status_exhausts_retry_budget() {
        let mut c = csr();
        c.bus_mut().inject(Fault::CsrBusy { ae: 2 });
        let err = c.read(2, regs::CTX_ENABLES).unwrap_err();
        assert!(matches!(err, QatError::CsrTimeout { ae: 2, offset: regs::CTX_ENABLES }));
        assert!(matches!(
            c.write(2, regs::CC_ENABLE, 0).unwrap_err(),
            QatError::CsrTimeout { ae: 2, .. }
        ));
        assert!(c.read(1, regs::CTX_ENABLES).is_ok());
    }

    #[test]
    fn absent_engine_is_rejected() {
        let mut c = csr();
        assert!(matches!(
            c.read(20, regs::CTX_ENABLES).unwrap_err(),
            QatError::InvalidArgument { .. }
        ));
    }

    #[test]
    fn indirect_access_restores_context_pointer() {
        let mut c = csr();
        c.write(0, regs::CSR_CTX_POINTER, 3).unwrap();
        c.indirect_write(0, 0b0101_0000, regs::CTX_STS_INDIRECT, 0x42).unwrap();
        assert_eq!(c.read(0, regs::CSR_CTX_POINTER).unwrap(), 3);
        assert_eq!(c.indirect_read(0, 4, regs::CTX_STS_INDIRECT).unwrap(), 0x42);
        assert_eq!(c.indirect_read(0, 6, regs::CTX_STS_INDIRECT).unwrap(), 0x42);
        assert_eq!(c.indirect_read(0, 5, regs::CTX_STS_INDIRECT).unwrap(), 0);
        assert_eq!(c.read(0, regs::CSR_CTX_POINTER).unwrap(), 3);
    }

    #[test]
    fn direct_csr_rejected_by_indirect_path() {
        let mut c = csr();
        assert!(c.indirect_read(0, 0, regs::CTX_ENABLES).is_err());
        assert!(c.indirect_read(0, 8, regs::CTX_STS_INDIRECT).is_err());
    }
}
