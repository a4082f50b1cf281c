//! Signed (SUOF) load path through the firmware control unit
//!
//! Each signed image is copied into a DMA region laid out for the FCU:
//!
//! ```text
//! 0x000  auth chunk   descriptor (64) + chunk size + chunk bus address
//! 0x080  CSS header
//! 0x100  public key   modulus, zero padding, exponent
//! 0x300  signature
//! 0x400  payload      AE mode, init sequence, instructions (AE firmware)
//!                     or the opaque MMP image
//! ```
//!
//! The FCU is given the bus address of the chunk, authenticates the image,
//! and then loads it into each target engine on command. One start command
//! releases every loaded engine.

use crate::config::AccelConfig;
use crate::csr::{AeCsr, CsrBus};
use crate::dma::{DmaAllocator, DmaRegion};
use crate::error::{QatError, Result};
use crate::firmware::{SignedImage, Suof};
use qat_chip::fwfmt::suof;
use qat_chip::regs::{self, fcu_ctrl, fcu_status};
use std::time::Duration;
use tracing::{debug, error, info};

/// Offset of the CSS header in the DMA layout.
pub const CSS_OFFSET: usize = suof::AUTH_CHUNK_LEN;
/// Offset of the public key.
pub const PUB_OFFSET: usize = CSS_OFFSET + suof::CSS_HDR_LEN;
/// Offset of the signature.
pub const SIG_OFFSET: usize = PUB_OFFSET + suof::CSS_PUB_LEN;
/// Offset of the payload.
pub const IMG_OFFSET: usize = SIG_OFFSET + suof::CSS_SIGNATURE_LEN;

/// FCU authentication descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthDesc {
    /// Payload length
    pub img_len: u32,
    /// Engines the image may be loaded into
    pub ae_mask: u32,
    /// Bus address of the CSS header
    pub css_hdr: u64,
    /// Bus address of the payload
    pub img: u64,
    /// Bus address of the signature
    pub signature: u64,
    /// Bus address of the public key
    pub public_key: u64,
    /// Bus address of the AE-mode metadata (AE firmware only)
    pub ae_mode: u64,
    /// Bus address of the init sequence (AE firmware only)
    pub init_seq: u64,
    /// Bus address of the instructions
    pub insts: u64,
}

impl AuthDesc {
    /// Descriptor for `image` placed in a region at `base`.
    ///
    /// `target_ae_mask` limits the engines an AE image is loaded into; MMP
    /// images target no engine.
    pub fn new(image: &SignedImage, target_ae_mask: u32, base: u64) -> Self {
        let img = base + IMG_OFFSET as u64;
        let (ae_mask, ae_mode, init_seq, insts) = if image.is_ae_firmware() {
            let init = img + suof::AE_MODE_LEN as u64;
            (target_ae_mask, img, init, init + suof::INIT_SEQ_LEN as u64)
        } else {
            (0, 0, 0, img)
        };
        #[allow(clippy::cast_possible_truncation)]
        let img_len = image.payload().len() as u32;
        Self {
            img_len,
            ae_mask,
            css_hdr: base + CSS_OFFSET as u64,
            img,
            signature: base + SIG_OFFSET as u64,
            public_key: base + PUB_OFFSET as u64,
            ae_mode,
            init_seq,
            insts,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode(&self, out: &mut [u8]) {
        let words = [
            self.img_len,
            self.ae_mask,
            (self.css_hdr >> 32) as u32,
            self.css_hdr as u32,
            (self.img >> 32) as u32,
            self.img as u32,
            (self.signature >> 32) as u32,
            self.signature as u32,
            (self.public_key >> 32) as u32,
            self.public_key as u32,
            (self.ae_mode >> 32) as u32,
            self.ae_mode as u32,
            (self.init_seq >> 32) as u32,
            self.init_seq as u32,
            (self.insts >> 32) as u32,
            self.insts as u32,
        ];
        for (chunk, w) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
    }
}

/// A signed image staged in DMA memory.
///
/// The region is synced for the device once staged and handed back to the
/// CPU when dropped, after the FCU is done with it.
#[derive(Debug)]
pub struct AuthImage {
    region: Box<dyn DmaRegion>,
    desc: AuthDesc,
}

impl AuthImage {
    /// Copy `image` into a fresh DMA region in the FCU layout.
    ///
    /// # Errors
    ///
    /// Returns `Dma` if the region cannot be allocated.
    pub fn stage(image: &SignedImage, target_ae_mask: u32, alloc: &mut dyn DmaAllocator) -> Result<Self> {
        let size = IMG_OFFSET + image.payload().len();
        let mut region = alloc.alloc(size, suof::AUTH_DMA_ALIGN)?;
        let base = region.bus_addr();
        let desc = AuthDesc::new(image, target_ae_mask, base);

        let buf = region.as_mut_slice();
        desc.encode(&mut buf[..suof::AUTH_DESC_LEN]);
        buf[suof::AUTH_DESC_LEN..suof::AUTH_DESC_LEN + 8].copy_from_slice(&(size as u64).to_le_bytes());
        buf[suof::AUTH_DESC_LEN + 8..suof::AUTH_DESC_LEN + 16].copy_from_slice(&base.to_le_bytes());
        buf[CSS_OFFSET..PUB_OFFSET].copy_from_slice(image.css_header());
        let exp_at = PUB_OFFSET + suof::CSS_MODULUS_LEN + suof::CSS_KEY_PAD_LEN;
        buf[PUB_OFFSET..PUB_OFFSET + suof::CSS_MODULUS_LEN].copy_from_slice(image.modulus());
        buf[exp_at..exp_at + suof::CSS_EXPONENT_LEN].copy_from_slice(image.exponent());
        buf[SIG_OFFSET..IMG_OFFSET].copy_from_slice(image.signature());
        buf[IMG_OFFSET..].copy_from_slice(image.payload());
        region.sync_for_device();

        debug!("Staged {} byte signed image at {base:#x}, ae_mask {:#x}", size, desc.ae_mask);
        Ok(Self { region, desc })
    }

    /// Bus address handed to the FCU.
    pub fn bus_addr(&self) -> u64 {
        self.region.bus_addr()
    }

    /// Descriptor written at the front of the region.
    pub const fn desc(&self) -> &AuthDesc {
        &self.desc
    }

    /// Staged bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.region.as_slice()
    }
}

impl Drop for AuthImage {
    fn drop(&mut self) {
        self.region.sync_for_cpu();
    }
}

/// FCU command sequencer.
#[derive(Debug)]
pub struct Fcu<'a, B> {
    csr: &'a mut AeCsr<B>,
    wait: Duration,
}

impl<'a, B: CsrBus> Fcu<'a, B> {
    /// Drive the FCU behind `csr`, sleeping `wait` between status polls.
    pub fn new(csr: &'a mut AeCsr<B>, wait: Duration) -> Self {
        Self { csr, wait }
    }

    /// Poll `FCU_STATUS` until `done` accepts it. The inner `Err` carries
    /// the last status seen when the budget runs out.
    fn poll(&mut self, mut done: impl FnMut(u32) -> bool) -> Result<std::result::Result<u32, u32>> {
        let mut status = 0;
        for _ in 0..self.csr.retries().fw_auth.max(1) {
            if !self.wait.is_zero() {
                std::thread::sleep(self.wait);
            }
            status = self.csr.read_global(regs::FCU_STATUS)?;
            if done(status) {
                return Ok(Ok(status));
            }
        }
        Ok(Err(status))
    }

    /// Authenticate the image staged at `bus_addr`.
    ///
    /// # Errors
    ///
    /// Returns `FirmwareAuthFailed` if the FCU rejects the signature or
    /// `FirmwareAuthTimeout` if it never answers.
    #[allow(clippy::cast_possible_truncation)]
    pub fn authenticate(&mut self, bus_addr: u64) -> Result<()> {
        self.csr.write_global(regs::FCU_DRAM_ADDR_HI, (bus_addr >> 32) as u32)?;
        self.csr.write_global(regs::FCU_DRAM_ADDR_LO, bus_addr as u32)?;
        self.csr.write_global(regs::FCU_CTRL, fcu_ctrl::CMD_AUTH)?;

        let outcome = self.poll(|s| match fcu_status::code(s) {
            fcu_status::STS_VERI_FAIL => true,
            fcu_status::STS_VERI_DONE => s & fcu_status::AUTHFWLD != 0,
            _ => false,
        })?;
        match outcome {
            Ok(status) if fcu_status::code(status) == fcu_status::STS_VERI_FAIL => {
                error!("FCU rejected image at {bus_addr:#x}, status {status:#x}");
                Err(QatError::FirmwareAuthFailed { status })
            }
            Ok(_) => {
                info!("FCU authenticated image at {bus_addr:#x}");
                Ok(())
            }
            Err(status) => {
                error!("FCU authentication timed out, status {status:#x}");
                Err(QatError::FirmwareAuthTimeout { status })
            }
        }
    }

    /// Load the authenticated image into every engine of `ae_mask`.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a target engine is running, or
    /// `FirmwareLoadTimeout` naming the engine that never reported loaded.
    pub fn load(&mut self, ae_mask: u32) -> Result<()> {
        let targets: Vec<u8> = self.csr.engines().filter(|ae| ae_mask & (1 << ae) != 0).collect();
        for ae in targets {
            if self.csr.state(ae)?.is_busy() {
                return Err(QatError::Busy { ae });
            }
            self.csr.write_global(regs::FCU_CTRL, fcu_ctrl::load(ae))?;
            let outcome = self.poll(|s| {
                fcu_status::code(s) == fcu_status::STS_LOAD_DONE && fcu_status::ae_loaded(s, ae)
            })?;
            if let Err(status) = outcome {
                error!("AE{ae}: FCU load timed out, status {status:#x}");
                return Err(QatError::FirmwareLoadTimeout { ae, status });
            }
            debug!("AE{ae}: FCU load done");
        }
        Ok(())
    }

    /// Start every loaded engine.
    ///
    /// # Errors
    ///
    /// Returns `FirmwareStartTimeout` if the FCU never reports done.
    pub fn start(&mut self) -> Result<()> {
        self.csr.write_global(regs::FCU_CTRL, fcu_ctrl::CMD_START)?;
        match self.poll(|s| s & fcu_status::DONE != 0)? {
            Ok(_) => Ok(()),
            Err(status) => {
                error!("FCU start timed out, status {status:#x}");
                Err(QatError::FirmwareStartTimeout { status })
            }
        }
    }
}

/// Authenticate `mmp` (when given) and then authenticate and load every
/// image of `suof`. Returns the engines loaded.
///
/// Images are checked against the device before any register is written.
///
/// # Errors
///
/// Returns `MalformedFirmware` for images signed for other hardware, or the
/// first DMA or FCU error.
pub fn load_suof<B: CsrBus>(
    csr: &mut AeCsr<B>,
    suof: &Suof,
    mmp: Option<&SignedImage>,
    alloc: &mut dyn DmaAllocator,
    cfg: &AccelConfig,
    prod_type: u32,
    revision: u32,
) -> Result<u32> {
    suof.check_images(prod_type, revision)?;
    if let Some(mmp) = mmp {
        if mmp.is_ae_firmware() {
            return Err(QatError::malformed("MMP image carries the AE firmware type"));
        }
    }

    let device_mask = csr.ae_mask();
    let mut fcu = Fcu::new(csr, cfg.fw_auth_wait);
    if let Some(mmp) = mmp {
        let staged = AuthImage::stage(mmp, 0, alloc)?;
        fcu.authenticate(staged.bus_addr())?;
    }

    let mut loaded = 0;
    for img in &suof.images {
        let staged = AuthImage::stage(&img.signed, img.ae_mode.ae_mask & device_mask, alloc)?;
        fcu.authenticate(staged.bus_addr())?;
        fcu.load(staged.desc().ae_mask)?;
        loaded |= staged.desc().ae_mask;
        info!("Loaded signed image {} onto AEs {:#x}", img.name, staged.desc().ae_mask);
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Fault, FcuCommand, SoftwareAccelerator};
    use crate::config::RetryBudget;
    use crate::dma::HostDmaAllocator;
    use crate::testing::{signed_blob, SuofBuilder};
    use bytes::Bytes;
    use qat_chip::variant::prod_type;
    use qat_chip::ChipVariant;
    use std::sync::{Arc, Mutex};

    type SyncLog = Arc<Mutex<Vec<(u64, &'static str)>>>;

    #[derive(Debug)]
    struct Recorded {
        inner: Box<dyn DmaRegion>,
        log: SyncLog,
    }

    impl DmaRegion for Recorded {
        fn bus_addr(&self) -> u64 {
            self.inner.bus_addr()
        }

        fn as_slice(&self) -> &[u8] {
            self.inner.as_slice()
        }

        fn as_mut_slice(&mut self) -> &mut [u8] {
            self.inner.as_mut_slice()
        }

        fn sync_for_device(&mut self) {
            self.log.lock().unwrap().push((self.bus_addr(), "device"));
        }

        fn sync_for_cpu(&mut self) {
            self.log.lock().unwrap().push((self.bus_addr(), "cpu"));
        }
    }

    #[derive(Debug, Default)]
    struct RecordingAllocator {
        log: SyncLog,
    }

    impl DmaAllocator for RecordingAllocator {
        fn alloc(&mut self, size: usize, align: usize) -> Result<Box<dyn DmaRegion>> {
            let inner = HostDmaAllocator.alloc(size, align)?;
            Ok(Box::new(Recorded { inner, log: Arc::clone(&self.log) }))
        }
    }

    fn csr() -> AeCsr<SoftwareAccelerator> {
        let sim = SoftwareAccelerator::new(ChipVariant::C62x);
        let mask = sim.ae_mask();
        AeCsr::new(sim, mask, RetryBudget { csr: 4, ae_check: 32, reset: 4, fw_auth: 4 })
    }

    fn cfg() -> AccelConfig {
        AccelConfig::for_simulation(&ChipVariant::C62x)
    }

    #[test]
    fn staged_layout_matches_descriptor() {
        let suof = Suof::parse(&SuofBuilder::new(prod_type::C62X).image("a", 0x6, &[9; 12]).build()).unwrap();
        let signed = &suof.images[0].signed;
        let staged = AuthImage::stage(signed, 0x2, &mut HostDmaAllocator).unwrap();
        let base = staged.bus_addr();
        let d = *staged.desc();
        let bytes = staged.as_bytes();

        assert_eq!(d.ae_mask, 0x2);
        assert_eq!(d.img, base + 0x400);
        assert_eq!(d.init_seq, d.img + suof::AE_MODE_LEN as u64);
        assert_eq!(d.insts, d.init_seq + suof::INIT_SEQ_LEN as u64);
        assert_eq!(d.img_len as usize, signed.payload().len());
        assert_eq!(&bytes[0..4], &d.img_len.to_le_bytes());
        assert_eq!(&bytes[72..80], &base.to_le_bytes());
        assert_eq!(&bytes[CSS_OFFSET..PUB_OFFSET], signed.css_header());
        assert_eq!(&bytes[PUB_OFFSET..PUB_OFFSET + 256], signed.modulus());
        assert!(bytes[PUB_OFFSET + 256..PUB_OFFSET + 508].iter().all(|&b| b == 0));
        assert_eq!(&bytes[PUB_OFFSET + 508..SIG_OFFSET], signed.exponent());
        assert_eq!(&bytes[bytes.len() - 12..], &[9; 12]);
    }

    #[test]
    fn mmp_descriptor_targets_no_engine() {
        let mmp = SignedImage::new(signed_blob(suof::CSS_MMP_FIRMWARE, &[1; 32])).unwrap();
        let d = AuthDesc::new(&mmp, 0xff, 0x1000);
        assert_eq!(d.ae_mask, 0);
        assert_eq!(d.insts, d.img);
        assert_eq!(d.ae_mode, 0);
    }

    #[test]
    fn mmp_then_images_then_loads() {
        let mut c = csr();
        let suof = Suof::parse(
            &SuofBuilder::new(prod_type::C62X)
                .image("ae0", 0x1, &[])
                .image("rest", 0x6, &[])
                .build(),
        )
        .unwrap();
        let mmp = SignedImage::new(Bytes::from(signed_blob(suof::CSS_MMP_FIRMWARE, &[0; 8]))).unwrap();
        let loaded = load_suof(&mut c, &suof, Some(&mmp), &mut HostDmaAllocator, &cfg(), prod_type::C62X, 0).unwrap();
        assert_eq!(loaded, 0x7);

        let log = c.bus().fcu_log();
        assert!(matches!(log[0], FcuCommand::Auth { .. }));
        assert!(matches!(log[1], FcuCommand::Auth { .. }));
        assert_eq!(&log[2..4], &[FcuCommand::Load { ae: 1 }, FcuCommand::Load { ae: 2 }]);
        assert!(matches!(log[4], FcuCommand::Auth { .. }));
        assert_eq!(log[5], FcuCommand::Load { ae: 0 });
        assert_eq!(log.len(), 6);
    }

    #[test]
    fn staged_regions_return_to_cpu_after_fcu() {
        let mut c = csr();
        let suof = Suof::parse(&SuofBuilder::new(prod_type::C62X).image("a", 0x6, &[3; 8]).build()).unwrap();
        let mmp = SignedImage::new(Bytes::from(signed_blob(suof::CSS_MMP_FIRMWARE, &[0; 8]))).unwrap();
        let mut alloc = RecordingAllocator::default();
        load_suof(&mut c, &suof, Some(&mmp), &mut alloc, &cfg(), prod_type::C62X, 0).unwrap();

        let log = alloc.log.lock().unwrap().clone();
        assert_eq!(log.len(), 4);
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!((pair[0].1, pair[1].1), ("device", "cpu"));
        }
    }

    #[test]
    fn failed_authentication_still_returns_region() {
        let mut c = csr();
        c.bus_mut().inject(Fault::FcuVerifyFail);
        let suof = Suof::parse(&SuofBuilder::new(prod_type::C62X).image("a", 0x1, &[]).build()).unwrap();
        let mut alloc = RecordingAllocator::default();
        assert!(load_suof(&mut c, &suof, None, &mut alloc, &cfg(), prod_type::C62X, 0).is_err());
        let log = alloc.log.lock().unwrap();
        assert_eq!(log.iter().map(|e| e.1).collect::<Vec<_>>(), ["device", "cpu"]);
    }

    #[test]
    fn verify_failure_and_silence() {
        let suof = Suof::parse(&SuofBuilder::new(prod_type::C62X).image("a", 0x1, &[]).build()).unwrap();

        let mut c = csr();
        c.bus_mut().inject(Fault::FcuVerifyFail);
        assert!(matches!(
            load_suof(&mut c, &suof, None, &mut HostDmaAllocator, &cfg(), prod_type::C62X, 0).unwrap_err(),
            QatError::FirmwareAuthFailed { .. }
        ));

        let mut c = csr();
        c.bus_mut().inject(Fault::FcuSilent);
        assert!(matches!(
            load_suof(&mut c, &suof, None, &mut HostDmaAllocator, &cfg(), prod_type::C62X, 0).unwrap_err(),
            QatError::FirmwareAuthTimeout { .. }
        ));
        assert!(matches!(
            Fcu::new(&mut c, Duration::ZERO).start().unwrap_err(),
            QatError::FirmwareStartTimeout { .. }
        ));
    }

    #[test]
    fn wrong_device_writes_nothing() {
        let mut c = csr();
        let suof = Suof::parse(&SuofBuilder::new(prod_type::C3XXX).image("a", 0x1, &[]).build()).unwrap();
        let before = c.bus().csr_writes();
        assert!(matches!(
            load_suof(&mut c, &suof, None, &mut HostDmaAllocator, &cfg(), prod_type::C62X, 0).unwrap_err(),
            QatError::MalformedFirmware { .. }
        ));
        assert_eq!(c.bus().csr_writes(), before);
        assert!(c.bus().fcu_log().is_empty());
    }

    #[test]
    fn start_completes() {
        let mut c = csr();
        Fcu::new(&mut c, Duration::ZERO).start().unwrap();
        assert_eq!(c.bus().fcu_log(), &[FcuCommand::Start]);
    }
}
