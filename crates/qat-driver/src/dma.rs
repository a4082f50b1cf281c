//! DMA memory for FCU image authentication
//!
//! The FCU reads signed images from host memory by bus address.
//! [`DmaAllocator`] hands out zeroed, aligned regions; [`HostDmaAllocator`]
//! backs them with heap pages and reports the virtual address as the bus
//! address, which is what the software accelerator and identity-mapped
//! IOMMUs expect.

use crate::error::{QatError, Result};
use std::alloc::Layout;
use std::fmt::Debug;
use tracing::debug;

/// Alignment of host DMA regions.
pub const DMA_PAGE: usize = 4096;

/// Device-visible memory region.
pub trait DmaRegion: Debug + Send {
    /// Address the device uses for the first byte.
    fn bus_addr(&self) -> u64;

    /// Contents.
    fn as_slice(&self) -> &[u8];

    /// Contents, mutably.
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Make host writes visible to the device. Coherent memory needs no
    /// action.
    fn sync_for_device(&mut self) {}

    /// Make device writes visible to the host.
    fn sync_for_cpu(&mut self) {}
}

/// Source of DMA regions.
pub trait DmaAllocator: Debug + Send {
    /// Allocate `size` zeroed bytes aligned to at least `align`.
    ///
    /// # Errors
    ///
    /// Returns `Dma` if the layout is invalid or memory is exhausted.
    fn alloc(&mut self, size: usize, align: usize) -> Result<Box<dyn DmaRegion>>;
}

/// Heap-backed DMA region.
#[derive(Debug)]
pub struct HostDmaBuffer {
    vaddr: *mut u8,
    layout: Layout,
}

impl HostDmaBuffer {
    fn new(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(QatError::dma("zero-sized DMA buffer"));
        }
        if !align.is_power_of_two() {
            return Err(QatError::dma(format!("DMA alignment {align} is not a power of two")));
        }
        let layout = Layout::from_size_align(size, align.max(DMA_PAGE))
            .map_err(|e| QatError::dma(format!("invalid DMA buffer layout: {e}")))?;

        // SAFETY: layout has non-zero size (checked above) and a power-of-two
        // alignment from from_size_align. Null is handled below; the same
        // layout is used to dealloc in Drop.
        let vaddr = unsafe { std::alloc::alloc_zeroed(layout) };
        if vaddr.is_null() {
            return Err(QatError::dma(format!("failed to allocate {size} bytes")));
        }
        debug!("DMA buffer: {size:#x} bytes at {vaddr:p}");
        Ok(Self { vaddr, layout })
    }
}

impl DmaRegion for HostDmaBuffer {
    fn bus_addr(&self) -> u64 {
        self.vaddr as u64
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: vaddr is valid for layout.size() initialised (zeroed) bytes
        // for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.vaddr, self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.vaddr, self.layout.size()) }
    }

    fn sync_for_device(&mut self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn sync_for_cpu(&mut self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for HostDmaBuffer {
    fn drop(&mut self) {
        // SAFETY: vaddr came from alloc_zeroed with this exact layout and is
        // not referenced after drop.
        unsafe { std::alloc::dealloc(self.vaddr, self.layout) };
    }
}

// SAFETY: HostDmaBuffer owns its allocation exclusively
unsafe impl Send for HostDmaBuffer {}

// SAFETY: shared access only reads; writes need &mut self
unsafe impl Sync for HostDmaBuffer {}

/// Allocator returning [`HostDmaBuffer`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDmaAllocator;

impl DmaAllocator for HostDmaAllocator {
    fn alloc(&mut self, size: usize, align: usize) -> Result<Box<dyn DmaRegion>> {
        Ok(Box::new(HostDmaBuffer::new(size, align)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_zeroed_and_aligned() {
        let mut buf = HostDmaAllocator.alloc(1000, 64).unwrap();
        assert_eq!(buf.bus_addr() % DMA_PAGE as u64, 0);
        assert_eq!(buf.as_slice().len(), 1000);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.as_mut_slice()[999] = 7;
        buf.sync_for_device();
        buf.sync_for_cpu();
        assert_eq!(buf.as_slice()[999], 7);
    }

    #[test]
    fn bad_requests_fail() {
        assert!(matches!(HostDmaAllocator.alloc(0, 64).unwrap_err(), QatError::Dma { .. }));
        assert!(HostDmaAllocator.alloc(16, 3).is_err());
    }
}
