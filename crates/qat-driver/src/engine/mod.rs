//! Acceleration engine operations
//!
//! Everything here is an `impl` block on [`AeCsr`](crate::csr::AeCsr), split
//! by concern:
//!
//! | Module | Concern |
//! |--------|---------|
//! | [`regaddr`] | context mode and relative register validation |
//! | [`exec`] | microstore access and transient execution |
//! | [`access`] | register and local-memory reads/writes through microcode |
//! | [`lifecycle`] | reset, clocks, context enables, init-time clearing |
//!
//! Per-engine bookkeeping owned by the controller lives in [`Engine`].

pub mod access;
pub mod exec;
pub mod lifecycle;
pub mod regaddr;

pub use access::LmWrite;
pub use exec::{EngineSnapshot, ExecOptions};

/// Engine state derived from `CTX_ENABLES` and `ACTIVE_CTX_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No context enabled and nothing executing
    Disabled,
    /// A context is executing but none is enabled
    Active,
    /// At least one context is enabled
    Enabled,
}

impl EngineState {
    /// Whether the engine must be left alone by transient execution.
    pub const fn is_busy(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// One page of an image bound to a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBinding {
    /// Page index within the image
    pub page: usize,
    /// Region the page belongs to
    pub region: u32,
    /// Default page loaded at start
    pub default: bool,
}

/// Binding of one image to a set of contexts on one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    /// Index of the image in the loaded object
    pub image: usize,
    /// Contexts the image runs on
    pub ctx_mask: u8,
    /// Page to region table
    pub pages: Vec<PageBinding>,
}

/// Controller-side state of one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Engine {
    /// Engine number
    pub ae: u8,
    /// Microstore words
    pub ustore_size: u32,
    /// First free microstore word
    pub free_addr: u32,
    /// Free microstore words from `free_addr`
    pub free_size: u32,
    /// Contexts running loaded code
    pub live_ctx_mask: u8,
    /// Reloadable microstore words
    pub reload_size: u32,
    /// DRAM shadow of the reloadable microstore
    pub ustore_dram_addr: Option<u64>,
    /// Microstore shared with the neighbour engine
    pub shared_ustore: bool,
    /// Images bound to this engine
    pub slices: Vec<Slice>,
}

impl Engine {
    /// Fresh bookkeeping for engine `ae`.
    pub const fn new(ae: u8, ustore_size: u32) -> Self {
        Self {
            ae,
            ustore_size,
            free_addr: 0,
            free_size: ustore_size,
            live_ctx_mask: 0,
            reload_size: 0,
            ustore_dram_addr: None,
            shared_ustore: false,
            slices: Vec::new(),
        }
    }

    /// Forget everything learned since init.
    pub fn reset(&mut self) {
        *self = Self::new(self.ae, self.ustore_size);
    }

    /// Contexts bound by any slice.
    pub fn assigned_ctx_mask(&self) -> u8 {
        self.slices.iter().fold(0, |m, s| m | s.ctx_mask)
    }
}

/// Engine sharing a microstore with `ae`.
pub const fn shared_ustore_neighbour(ae: u8) -> u8 {
    ae ^ 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_bookkeeping() {
        let mut e = Engine::new(3, 0x4000);
        e.free_addr = 0x100;
        e.free_size = 0x3f00;
        e.live_ctx_mask = 0xff;
        e.reload_size = 0x2000;
        e.slices.push(Slice { image: 0, ctx_mask: 0x55, pages: Vec::new() });
        e.reset();
        assert_eq!(e, Engine::new(3, 0x4000));
    }

    #[test]
    fn neighbours_pair_up() {
        assert_eq!(shared_ustore_neighbour(0), 1);
        assert_eq!(shared_ustore_neighbour(7), 6);
    }
}
