//! Register address resolution against the live context mode

use crate::csr::{AeCsr, CsrBus};
use crate::error::{QatError, Result};
use qat_chip::regfile::{addr10, ContextMode, RegClass, MAX_CTX};
use qat_chip::regs;

/// 10-bit operand address of `index` in `class`.
///
/// # Errors
///
/// Returns `InvalidRegister` for classes that cannot appear as an operand.
pub fn operand(class: RegClass, index: u16) -> Result<u16> {
    addr10(class, index)
        .ok_or_else(|| QatError::invalid_register(format!("{class:?}[{index}] has no operand address")))
}

impl<B: CsrBus> AeCsr<B> {
    /// Context mode currently programmed in `CTX_ENABLES`.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn ctx_mode(&mut self, ae: u8) -> Result<ContextMode> {
        Ok(ContextMode::from_ctx_enables(self.read(ae, regs::CTX_ENABLES)?))
    }

    /// Validate a relative register reference and return its operand address
    /// along with the engine's context mode.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegister` for a non-relative class and
    /// `InvalidArgument` for an index beyond the mode's mask or a context the
    /// mode does not run (odd contexts in 4-context mode).
    pub fn resolve_rel(
        &mut self,
        ae: u8,
        ctx: u8,
        class: RegClass,
        rel: u16,
    ) -> Result<(u16, ContextMode)> {
        if !class.is_relative() {
            return Err(QatError::invalid_register(format!("{class:?} is not context relative")));
        }
        if ctx >= MAX_CTX {
            return Err(QatError::invalid_argument(format!("context {ctx} out of range")));
        }

        let mode = self.ctx_mode(ae)?;
        if !mode.valid_ctx(ctx) {
            return Err(QatError::invalid_argument(format!(
                "AE{ae}: context {ctx} not available in {mode:?}-context mode"
            )));
        }
        if rel & !mode.rel_mask() != 0 {
            return Err(QatError::invalid_argument(format!(
                "AE{ae}: relative register {rel} exceeds mask {:#x}",
                mode.rel_mask()
            )));
        }
        Ok((operand(class, rel)?, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SoftwareAccelerator;
    use crate::config::RetryBudget;
    use qat_chip::regs::ctx_enables;
    use qat_chip::ChipVariant;

    fn csr() -> AeCsr<SoftwareAccelerator> {
        let sim = SoftwareAccelerator::new(ChipVariant::C62x);
        let mask = sim.ae_mask();
        AeCsr::new(sim, mask, RetryBudget::default())
    }

    #[test]
    fn odd_context_rejected_in_four_context_mode() {
        let mut c = csr();
        c.write(1, regs::CTX_ENABLES, ctx_enables::INUSE_CONTEXTS).unwrap();
        let err = c.resolve_rel(1, 3, RegClass::GpaRel, 2).unwrap_err();
        assert!(matches!(err, QatError::InvalidArgument { .. }));
        assert_eq!(c.resolve_rel(1, 2, RegClass::GpaRel, 0x1f).unwrap(), (0x1f, ContextMode::Four));
    }

    #[test]
    fn index_mask_follows_mode() {
        let mut c = csr();
        assert!(matches!(
            c.resolve_rel(0, 1, RegClass::GpbRel, 0x10).unwrap_err(),
            QatError::InvalidArgument { .. }
        ));
        assert_eq!(c.resolve_rel(0, 1, RegClass::DrRdRel, 3).unwrap().0, 0x1c3);
    }

    #[test]
    fn absolute_class_is_not_relative() {
        let mut c = csr();
        assert!(matches!(
            c.resolve_rel(0, 0, RegClass::GpaAbs, 1).unwrap_err(),
            QatError::InvalidRegister { .. }
        ));
        assert!(matches!(operand(RegClass::SrAbs, 1).unwrap_err(), QatError::InvalidRegister { .. }));
    }
}
