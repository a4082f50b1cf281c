//! Memory-mapped CSR BAR access
//!
//! Maps `/sys/bus/pci/devices/{addr}/resource{bar}` with rustix and exposes
//! it as a [`CsrBus`]. Every access is bounds checked against the mapping;
//! the only unsafe code is the mapping itself and the volatile accesses.

use crate::csr::{CsrBus, Space};
use crate::error::{QatError, Result};
use qat_chip::variant::BarLayout;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::ptr::NonNull;

/// Memory-mapped PCIe BAR region
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    pcie_address: String,
    bar_index: usize,
}

impl MmapRegion {
    /// Map BAR `bar_index` of the device at `pcie_address`.
    ///
    /// # Errors
    ///
    /// Returns error if the resource file cannot be opened, is empty, or
    /// mmap fails.
    pub fn new(pcie_address: &str, bar_index: usize) -> Result<Self> {
        let path = format!("/sys/bus/pci/devices/{pcie_address}/resource{bar_index}");

        tracing::debug!("Mapping CSR BAR: {path}");

        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        // BAR sizes fit in usize on 64-bit targets
        #[allow(clippy::cast_possible_truncation)]
        let size = file.metadata()?.len() as usize;

        if size == 0 {
            return Err(QatError::invalid_argument(format!(
                "{path} has size 0 (device not enabled?)"
            )));
        }

        // SAFETY: the fd was just opened read/write and is kept alive in
        // `_file` for the lifetime of the mapping; size is non-zero; the
        // mapping is released in Drop with the same length.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| QatError::Io { source: e.into() })?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| QatError::invalid_argument("mmap returned a null mapping"))?;

        tracing::info!(
            "Mapped BAR{bar_index} for {pcie_address} ({} KB at {ptr:p})",
            size / 1024,
        );

        Ok(Self {
            ptr,
            size,
            _file: file,
            pcie_address: pcie_address.to_string(),
            bar_index,
        })
    }

    fn check(&self, offset: usize) -> Result<()> {
        match offset.checked_add(4) {
            Some(end) if end <= self.size && offset % 4 == 0 => Ok(()),
            _ => Err(QatError::invalid_argument(format!(
                "CSR access at {offset:#x} outside BAR{} ({:#x} bytes)",
                self.bar_index, self.size
            ))),
        }
    }

    /// Read 32-bit register at offset
    ///
    /// # Errors
    ///
    /// Returns error if offset is out of bounds or unaligned
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset)?;

        // SAFETY: offset + 4 <= size and offset is 4-byte aligned, so the
        // pointer stays inside the live mapping. Volatile because CSR reads
        // have side effects.
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };

        tracing::trace!("Read u32 @ {offset:#x} = {value:#x}");
        Ok(value)
    }

    /// Write 32-bit register at offset
    ///
    /// # Errors
    ///
    /// Returns error if offset is out of bounds or unaligned
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.check(offset)?;

        tracing::trace!("Write u32 @ {offset:#x} = {value:#x}");

        // SAFETY: same bounds and alignment argument as `read_u32`.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }

        Ok(())
    }

    /// Get region size
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Get PCIe address
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        tracing::debug!("Unmapping BAR{} for {}", self.bar_index, self.pcie_address);

        // SAFETY: ptr and size are exactly what mmap returned in `new`, and
        // no references into the mapping outlive `self`.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: the region owns its mapping exclusively; writes require &mut self.
unsafe impl Send for MmapRegion {}

/// [`CsrBus`] over a mapped CSR BAR.
#[derive(Debug)]
pub struct MmioCsrBus {
    region: MmapRegion,
    layout: BarLayout,
}

impl MmioCsrBus {
    /// Map the CSR BAR of `pcie_address` with the given register layout.
    ///
    /// # Errors
    ///
    /// Returns error if the BAR cannot be mapped.
    pub fn open(pcie_address: &str, layout: BarLayout) -> Result<Self> {
        let region = MmapRegion::new(pcie_address, layout.bar)?;
        Ok(Self { region, layout })
    }

    const fn base(&self, space: Space) -> usize {
        match space {
            Space::AeLocal => self.layout.ae_local,
            Space::AeXfer => self.layout.ae_xfer,
            Space::Global => self.layout.global,
        }
    }

    /// Mapped region.
    pub const fn region(&self) -> &MmapRegion {
        &self.region
    }
}

impl CsrBus for MmioCsrBus {
    fn read32(&mut self, space: Space, offset: usize) -> Result<u32> {
        self.region.read_u32(self.base(space) + offset)
    }

    fn write32(&mut self, space: Space, offset: usize, value: u32) -> Result<()> {
        let base = self.base(space);
        self.region.write_u32(base + offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires hardware
    fn map_csr_bar() {
        let layout = qat_chip::variant::BarLayout { bar: 0, global: 0x50000, ae_local: 0x60000, ae_xfer: 0x40000 };
        let mut bus = MmioCsrBus::open("0000:3d:00.0", layout).expect("map BAR");
        let status = bus
            .read32(Space::AeLocal, qat_chip::regs::ACTIVE_CTX_STATUS)
            .expect("read AE0 status");
        println!("AE0 ACTIVE_CTX_STATUS = {status:#x}");
    }

    #[test]
    fn missing_device_is_io_error() {
        let err = MmapRegion::new("ffff:ff:ff.7", 0).unwrap_err();
        assert!(matches!(err, QatError::Io { .. }));
    }
}
