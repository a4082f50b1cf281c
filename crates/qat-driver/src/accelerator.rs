//! Accelerator controller
//!
//! [`Accelerator`] owns the register window, the per-engine bookkeeping and
//! the loaded firmware of one device, and exposes the bring-up sequence:
//!
//! ```text
//! engine_init()  ->  firmware_load(name)  ->  engine_start()
//!                          |
//!                 firmware_unload()  (back to initialised)
//! ```
//!
//! Every operation takes `&mut self`; callers sharing a device wrap it in a
//! lock.

use crate::auth::{self, Fcu};
use crate::backends::SoftwareAccelerator;
use crate::config::AccelConfig;
use crate::csr::{AeCsr, CsrBus};
use crate::dma::{DmaAllocator, HostDmaAllocator};
use crate::engine::{Engine, EngineState};
use crate::engine::lifecycle::ALL_CTX;
use crate::error::{QatError, Result};
use crate::firmware::{AeFirmware, SignedImage};
use crate::loader;
use crate::mmio::MmioCsrBus;
use crate::source::{DirFirmwareSource, FirmwareSource};
use bytes::Bytes;
use qat_chip::regfile::RegClass;
use qat_chip::variant::{pci_config, Fuses};
use qat_chip::{ChipVariant, HwVariant};
use tracing::{debug, info, warn};

/// What the bus layer knows about a device at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Chip generation
    pub variant: ChipVariant,
    /// Fuse words
    pub fuses: Fuses,
    /// PCI revision ID, matched against firmware revision ranges
    pub revision: u32,
}

impl DeviceInfo {
    /// Device of `variant` with the given fuses and revision.
    pub const fn new(variant: ChipVariant, fuses: Fuses, revision: u32) -> Self {
        Self { variant, fuses, revision }
    }

    /// Read identity, revision and fuses from the PCI config space of
    /// `pcie_address` in sysfs.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the config file cannot be read, or `Unsupported` for
    /// an unknown device ID.
    pub fn from_sysfs(pcie_address: &str) -> Result<Self> {
        let path = format!("/sys/bus/pci/devices/{pcie_address}/config");
        let config = std::fs::read(&path)?;
        debug!("Read {} bytes of PCI config from {path}", config.len());

        let field = |at: usize, len: usize| -> Result<u32> {
            config
                .get(at..at + len)
                .map(|b| b.iter().rev().fold(0u32, |v, &x| v << 8 | u32::from(x)))
                .ok_or_else(|| QatError::invalid_argument(format!("{path}: config space ends before {at:#x}")))
        };
        let device_id = field(pci_config::DEVICE_ID, 2)?;
        #[allow(clippy::cast_possible_truncation)]
        let variant = ChipVariant::from_device_id(device_id as u16)
            .ok_or_else(|| QatError::unsupported(format!("device ID {device_id:#06x} at {pcie_address}")))?;
        let revision = field(pci_config::REVISION_ID, 1)?;
        let fusectl = field(pci_config::FUSECTL, 4)?;
        let softstrap = if variant.fw_auth() { field(pci_config::SOFTSTRAP, 4)? } else { 0 };

        Ok(Self::new(variant, Fuses { fusectl, softstrap }, revision))
    }

    /// Enabled engines.
    pub fn ae_mask(&self) -> u32 {
        self.variant.ae_mask(self.fuses)
    }

    /// Enabled accelerators.
    pub fn accel_mask(&self) -> u32 {
        self.variant.accel_mask(self.fuses)
    }
}

#[derive(Debug)]
struct LoadedFirmware {
    name: String,
    blob: Bytes,
    image: AeFirmware,
    ae_mask: u32,
}

/// Controller of one QAT device.
#[derive(Debug)]
pub struct Accelerator<B> {
    csr: AeCsr<B>,
    info: DeviceInfo,
    cfg: AccelConfig,
    engines: Vec<Engine>,
    source: Box<dyn FirmwareSource>,
    dma: Box<dyn DmaAllocator>,
    firmware: Option<LoadedFirmware>,
}

impl Accelerator<MmioCsrBus> {
    /// Attach to the device at `pcie_address`, with firmware from
    /// `$QAT_FW_DIR` and host DMA memory.
    ///
    /// # Errors
    ///
    /// Returns error if the config space cannot be read or the CSR BAR
    /// cannot be mapped.
    pub fn open(pcie_address: &str) -> Result<Self> {
        let info = DeviceInfo::from_sysfs(pcie_address)?;
        let bus = MmioCsrBus::open(pcie_address, info.variant.bar_layout())?;
        info!(
            "Attached {} at {pcie_address}: rev {:#x}, AEs {:#x}, accels {:#x}",
            info.variant.name(),
            info.revision,
            info.ae_mask(),
            info.accel_mask()
        );
        Ok(Self::new(
            bus,
            info,
            AccelConfig::for_variant(&info.variant),
            Box::new(DirFirmwareSource::from_env()),
            Box::new(HostDmaAllocator),
        ))
    }
}

impl Accelerator<SoftwareAccelerator> {
    /// Controller over a fully enabled software model of `variant`.
    pub fn simulated(variant: ChipVariant, source: Box<dyn FirmwareSource>) -> Self {
        let sim = SoftwareAccelerator::new(variant);
        let info = DeviceInfo::new(variant, sim.fuses(), 0);
        Self::new(sim, info, AccelConfig::for_simulation(&variant), source, Box::new(HostDmaAllocator))
    }
}

impl<B: CsrBus> Accelerator<B> {
    /// Controller over `bus`.
    pub fn new(
        bus: B,
        info: DeviceInfo,
        cfg: AccelConfig,
        source: Box<dyn FirmwareSource>,
        dma: Box<dyn DmaAllocator>,
    ) -> Self {
        let csr = AeCsr::new(bus, info.ae_mask(), cfg.retries);
        let engines = csr.engines().map(|ae| Engine::new(ae, cfg.ustore_words)).collect();
        Self { csr, info, cfg, engines, source, dma, firmware: None }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Device identity.
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Active configuration.
    pub const fn config(&self) -> &AccelConfig {
        &self.cfg
    }

    /// Per-engine bookkeeping, one entry per present engine.
    pub fn engines(&self) -> &[Engine] {
        &self.engines
    }

    /// Register window.
    pub const fn csr(&self) -> &AeCsr<B> {
        &self.csr
    }

    /// Register window, mutably.
    pub fn csr_mut(&mut self) -> &mut AeCsr<B> {
        &mut self.csr
    }

    /// Name of the loaded firmware.
    pub fn firmware_name(&self) -> Option<&str> {
        self.firmware.as_ref().map(|f| f.name.as_str())
    }

    /// Loaded firmware.
    pub fn firmware(&self) -> Option<&AeFirmware> {
        self.firmware.as_ref().map(|f| &f.image)
    }

    /// Size of the loaded firmware blob.
    pub fn firmware_len(&self) -> Option<usize> {
        self.firmware.as_ref().map(|f| f.blob.len())
    }

    /// Engines holding loaded firmware.
    pub fn loaded_ae_mask(&self) -> u32 {
        self.firmware.as_ref().map_or(0, |f| f.ae_mask)
    }

    /// Current state of every present engine.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn engine_states(&mut self) -> Result<Vec<(u8, EngineState)>> {
        let aes: Vec<u8> = self.csr.engines().collect();
        aes.into_iter().map(|ae| Ok((ae, self.csr.state(ae)?))).collect()
    }

    // ── Bring-up ─────────────────────────────────────────────────────────────

    /// Reset and initialise every present engine.
    ///
    /// Engines are taken through reset, checked for a running clock and set
    /// to their power-up defaults. On unauthenticated parts every GPR is
    /// cleared as well.
    ///
    /// # Errors
    ///
    /// Returns `CsrTimeout` if reset does not clear or an engine is not
    /// clocked, or CSR access errors.
    pub fn engine_init(&mut self) -> Result<()> {
        self.firmware = None;
        self.engines.iter_mut().for_each(Engine::reset);

        let ae_mask = self.csr.ae_mask();
        let accel_mask = self.info.accel_mask();
        self.csr.assert_reset(ae_mask, accel_mask)?;
        self.csr.clear_reset(ae_mask, accel_mask)?;
        self.csr.check_alive()?;

        let aes: Vec<u8> = self.csr.engines().collect();
        for &ae in &aes {
            self.csr.set_defaults(ae)?;
            self.csr.enable_alu_out(ae)?;
            self.csr.clear_xfer(ae)?;
        }
        if !self.info.variant.fw_auth() {
            self.csr.clear_gprs()?;
        }
        info!("{}: initialised {} engines", self.info.variant.name(), aes.len());
        Ok(())
    }

    /// Fetch firmware `name`, parse its AE object and load it.
    ///
    /// Previously loaded firmware is unloaded first. Unsigned objects go
    /// through the microstore pipeline; signed ones are authenticated by the
    /// FCU after the MMP image.
    ///
    /// # Errors
    ///
    /// Returns `FirmwareNotFound`, `MalformedFirmware` or `Unsupported` for
    /// unusable firmware, or the first load error. Nothing is left loaded on
    /// error.
    pub fn firmware_load(&mut self, name: &str) -> Result<()> {
        self.firmware_unload()?;

        let blob = self.source.fetch(name)?;
        let image = AeFirmware::parse(&blob, &self.cfg.ae_object_name)?;
        let variant = self.info.variant;
        if image.is_signed() != variant.fw_auth() {
            return Err(QatError::unsupported(format!(
                "{name}: {} firmware on {} which {} authentication",
                if image.is_signed() { "signed" } else { "unsigned" },
                variant.name(),
                if variant.fw_auth() { "requires" } else { "does not support" },
            )));
        }

        let prod_type = variant.prod_type();
        let ae_mask = match &image {
            AeFirmware::Uof(obj) => {
                loader::load_uof(&mut self.csr, &mut self.engines, obj, &self.cfg, prod_type, self.info.revision)?;
                self.engines
                    .iter()
                    .filter(|e| !e.slices.is_empty())
                    .fold(0, |m, e| m | 1 << e.ae)
            }
            AeFirmware::Suof(suof) => {
                let mmp = SignedImage::new(self.source.fetch(&self.cfg.mmp_name)?)?;
                auth::load_suof(
                    &mut self.csr,
                    suof,
                    Some(&mmp),
                    self.dma.as_mut(),
                    &self.cfg,
                    prod_type,
                    self.info.revision,
                )?
            }
        };

        info!("Loaded {name} ({} bytes) onto AEs {ae_mask:#x}", blob.len());
        self.firmware = Some(LoadedFirmware { name: name.to_string(), blob, image, ae_mask });
        Ok(())
    }

    /// Load the variant's default MOF.
    ///
    /// # Errors
    ///
    /// As [`firmware_load`](Self::firmware_load).
    pub fn firmware_load_default(&mut self) -> Result<()> {
        let name = self.cfg.mof_name.clone();
        self.firmware_load(&name)
    }

    /// Stop loaded engines and forget the firmware.
    ///
    /// Does nothing when no firmware is loaded.
    ///
    /// # Errors
    ///
    /// Propagates CSR access errors.
    pub fn firmware_unload(&mut self) -> Result<()> {
        let Some(fw) = self.firmware.take() else {
            return Ok(());
        };
        for e in &mut self.engines {
            if fw.ae_mask & (1 << e.ae) != 0 {
                self.csr.disable_ctx(e.ae, ALL_CTX)?;
            }
            e.reset();
        }
        info!("Unloaded {}", fw.name);
        Ok(())
    }

    /// Start contexts `ctx_mask` of engine `ae`.
    ///
    /// On authenticated parts the FCU starts all loaded engines at once and
    /// `ctx_mask` is not used.
    ///
    /// # Errors
    ///
    /// Returns `NoFirmware` before a load, `InvalidArgument` for an absent
    /// engine, or the start error.
    pub fn firmware_start(&mut self, ae: u8, ctx_mask: u8) -> Result<()> {
        if self.firmware.is_none() {
            return Err(QatError::NoFirmware);
        }
        if !self.csr.is_present(ae) {
            return Err(QatError::invalid_argument(format!("AE{ae} is not present")));
        }
        if self.info.variant.fw_auth() {
            Fcu::new(&mut self.csr, self.cfg.fw_auth_wait).start()
        } else {
            self.csr.start_ctx(ae, ctx_mask)
        }
    }

    /// Start every engine holding loaded code.
    ///
    /// # Errors
    ///
    /// Returns `NoFirmware` before a load, or the start error.
    pub fn engine_start(&mut self) -> Result<()> {
        let Some(fw) = &self.firmware else {
            return Err(QatError::NoFirmware);
        };
        if self.info.variant.fw_auth() {
            Fcu::new(&mut self.csr, self.cfg.fw_auth_wait).start()?;
            info!("FCU started AEs {:#x}", fw.ae_mask);
            return Ok(());
        }

        let live: Vec<(u8, u8)> = self
            .engines
            .iter()
            .filter(|e| e.live_ctx_mask != 0)
            .map(|e| (e.ae, e.live_ctx_mask))
            .collect();
        if live.is_empty() {
            warn!("{}: no engine has live contexts", fw.name);
        }
        for (ae, ctx_mask) in live {
            self.csr.start_ctx(ae, ctx_mask)?;
        }
        Ok(())
    }

    /// Read relative register `rel` of `class` in context `ctx` of `ae`.
    ///
    /// # Errors
    ///
    /// As [`AeCsr::rel_data_read`].
    pub fn read_register(&mut self, ae: u8, ctx: u8, class: RegClass, rel: u16) -> Result<u32> {
        self.csr.rel_data_read(ae, ctx, class, rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::FcuCommand;
    use crate::source::MemoryFirmwareSource;
    use crate::testing::{signed_blob, ImageSpec, MofBuilder, SuofBuilder, UofBuilder};
    use qat_chip::fwfmt::suof;
    use qat_chip::variant::prod_type;

    fn dh895(fw: Bytes) -> Accelerator<SoftwareAccelerator> {
        let src = MemoryFirmwareSource::new().with("qat_895xcc.bin", fw);
        Accelerator::simulated(ChipVariant::Dh895xcc, Box::new(src))
    }

    #[test]
    fn operations_need_firmware() {
        let mut acc = dh895(Bytes::new());
        acc.engine_init().unwrap();
        assert!(matches!(acc.engine_start().unwrap_err(), QatError::NoFirmware));
        assert!(matches!(acc.firmware_start(0, 1).unwrap_err(), QatError::NoFirmware));
        acc.firmware_unload().unwrap();
    }

    #[test]
    fn uof_load_start_unload() {
        let uof = UofBuilder::new(prod_type::DH895XCC)
            .image(ImageSpec::new("svc", 0b11, 0xff).words(0, vec![0x0123_4567_89ab, 0x0123_4567_89ab]))
            .build();
        let mof = MofBuilder::new().uof("icp_qat_ae.uof", uof.to_vec()).build();
        let mut acc = dh895(mof);
        acc.engine_init().unwrap();
        acc.firmware_load_default().unwrap();
        assert_eq!(acc.firmware_name(), Some("qat_895xcc.bin"));
        assert_eq!(acc.loaded_ae_mask(), 0b11);
        assert_eq!(acc.engines()[0].live_ctx_mask, 0xff);

        acc.engine_start().unwrap();
        let states = acc.engine_states().unwrap();
        assert_eq!(states[0].1, EngineState::Enabled);
        assert_eq!(states[2].1, EngineState::Disabled);

        acc.firmware_unload().unwrap();
        assert_eq!(acc.engine_states().unwrap()[0].1, EngineState::Disabled);
        assert!(acc.engines().iter().all(|e| e.slices.is_empty()));
        assert!(acc.firmware().is_none());
    }

    #[test]
    fn signed_firmware_is_refused_without_fcu() {
        let suof = SuofBuilder::new(prod_type::DH895XCC).image("a", 1, &[]).build();
        let mut acc = dh895(suof);
        acc.engine_init().unwrap();
        assert!(matches!(
            acc.firmware_load("qat_895xcc.bin").unwrap_err(),
            QatError::Unsupported { .. }
        ));
        assert!(acc.firmware().is_none());
    }

    #[test]
    fn suof_load_goes_through_fcu() {
        let suof = SuofBuilder::new(prod_type::C62X).image("svc", 0x3ff, &[1, 2, 3, 4]).build();
        let mof = MofBuilder::new().suof("icp_qat_ae.suof", suof.to_vec()).build();
        let src = MemoryFirmwareSource::new()
            .with("qat_c62x.bin", mof)
            .with("qat_c62x_mmp.bin", signed_blob(suof::CSS_MMP_FIRMWARE, &[0; 64]));
        let mut acc = Accelerator::simulated(ChipVariant::C62x, Box::new(src));
        acc.engine_init().unwrap();
        acc.firmware_load_default().unwrap();
        assert_eq!(acc.loaded_ae_mask(), 0x3ff);
        acc.engine_start().unwrap();

        let log = acc.csr().bus().fcu_log();
        assert_eq!(log.iter().filter(|c| matches!(c, FcuCommand::Auth { .. })).count(), 2);
        assert_eq!(log.iter().filter(|c| matches!(c, FcuCommand::Load { .. })).count(), 10);
        assert_eq!(log.last(), Some(&FcuCommand::Start));
    }

    #[test]
    fn missing_mmp_fails_the_load() {
        let suof = SuofBuilder::new(prod_type::C62X).image("svc", 0x1, &[]).build();
        let src = MemoryFirmwareSource::new().with("qat_c62x.bin", suof);
        let mut acc = Accelerator::simulated(ChipVariant::C62x, Box::new(src));
        acc.engine_init().unwrap();
        assert!(matches!(
            acc.firmware_load_default().unwrap_err(),
            QatError::FirmwareNotFound { .. }
        ));
        assert!(acc.csr().bus().fcu_log().is_empty());
    }

    #[test]
    fn start_rejects_absent_engine() {
        let uof = UofBuilder::new(prod_type::DH895XCC).build();
        let mut acc = dh895(uof);
        acc.engine_init().unwrap();
        acc.firmware_load_default().unwrap();
        assert!(matches!(acc.firmware_start(31, 1).unwrap_err(), QatError::InvalidArgument { .. }));
        acc.firmware_start(0, 0x1).unwrap();
    }

    #[test]
    #[ignore] // Requires hardware
    fn open_real_device() {
        let mut acc = Accelerator::open("0000:3d:00.0").expect("attach");
        acc.engine_init().expect("engine init");
        for (ae, state) in acc.engine_states().expect("states") {
            println!("AE{ae}: {state:?}");
        }
    }
}
