//! Accelerator configuration
//!
//! All parameters are derived from the chip variant; callers override
//! individual fields with the `with_*` builders.

use qat_chip::regs::timing;
use qat_chip::HwVariant;
use std::time::Duration;
use tracing::debug;

/// Bounded-poll budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Retries of a local CSR access while `LOCAL_CSR_STATUS` is busy
    pub csr: u32,
    /// Profile-counter reads while waiting for an engine
    pub ae_check: u32,
    /// Reset de-assert polls
    pub reset: u32,
    /// FCU status polls per command
    pub fw_auth: u32,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            csr: timing::AE_CSR_RETRIES,
            ae_check: timing::AE_CHECK_RETRIES,
            reset: timing::RESET_RETRIES,
            fw_auth: timing::FW_AUTH_RETRIES,
        }
    }
}

/// Accelerator configuration
#[derive(Debug, Clone)]
pub struct AccelConfig {
    /// Poll budgets
    pub retries: RetryBudget,

    /// Delay between FCU status polls
    pub fw_auth_wait: Duration,

    /// Largest transient program (in microwords, kill included) used when
    /// batching local-memory initialisation
    pub batch_flush_words: usize,

    /// Microstore words per engine
    pub ustore_words: u32,

    /// MOF firmware name
    pub mof_name: String,

    /// MMP firmware name
    pub mmp_name: String,

    /// Name of the AE object inside the MOF
    pub ae_object_name: String,
}

impl AccelConfig {
    /// Create configuration for a chip variant
    pub fn for_variant(variant: &impl HwVariant) -> Self {
        let ustore_words = variant.ustore_words();
        debug!(
            "{}: ustore {} words, fw auth {}",
            variant.name(),
            ustore_words,
            variant.fw_auth()
        );

        Self {
            retries: RetryBudget::default(),
            fw_auth_wait: Duration::from_millis(timing::FW_AUTH_WAIT_MS),
            batch_flush_words: ustore_words as usize,
            ustore_words,
            mof_name: variant.mof_name().to_string(),
            mmp_name: variant.mmp_name().to_string(),
            ae_object_name: variant.ae_object_name().to_string(),
        }
    }

    /// Override poll budgets
    #[must_use]
    pub const fn with_retries(mut self, retries: RetryBudget) -> Self {
        self.retries = retries;
        self
    }

    /// Override the FCU poll delay
    #[must_use]
    pub const fn with_fw_auth_wait(mut self, wait: Duration) -> Self {
        self.fw_auth_wait = wait;
        self
    }

    /// Override the batch flush size, clamped to the microstore
    #[must_use]
    pub fn with_batch_flush_words(mut self, words: usize) -> Self {
        self.batch_flush_words = words.min(self.ustore_words as usize);
        self
    }

    /// Override the MOF name
    #[must_use]
    pub fn with_mof_name(mut self, name: impl Into<String>) -> Self {
        self.mof_name = name.into();
        self
    }

    /// Override the AE object name looked up inside the MOF
    #[must_use]
    pub fn with_ae_object_name(mut self, name: impl Into<String>) -> Self {
        self.ae_object_name = name.into();
        self
    }

    /// Configuration for the software accelerator: no FCU delay and short
    /// poll budgets so that fault-injection tests fail fast
    pub fn for_simulation(variant: &impl HwVariant) -> Self {
        Self::for_variant(variant)
            .with_fw_auth_wait(Duration::ZERO)
            .with_retries(RetryBudget {
                csr: 8,
                ae_check: 64,
                reset: 8,
                fw_auth: 8,
            })
    }
}
