//! Unsigned (UOF) load pipeline
//!
//! Loading is split into a pure planning step and the CSR stages that
//! apply the plan, so that every firmware defect is found before the first
//! register write:
//!
//! 1. [`plan`]: compatibility, memory segments, image to engine
//!    assignment, mode words, local-memory records
//! 2. [`program_modes`]: context, NN and LM modes per engine
//! 3. [`init_local_memory`]: batched local-memory writes
//! 4. [`fill_ustore`]: fill pattern into every word no block covers
//! 5. [`init_registers`]: immediate register initializers
//! 6. [`page_in`]: default pages, entry PCs, reload size

use crate::config::AccelConfig;
use crate::csr::{AeCsr, CsrBus};
use crate::engine::access::LMEM_BYTES;
use crate::engine::{Engine, LmWrite, PageBinding, Slice};
use crate::error::{QatError, Result};
use crate::firmware::{UofImage, UofObject};
use qat_chip::fwfmt::uof::{self, ae_mode};
use qat_chip::regfile::{ContextMode, RegClass};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Modes an engine is programmed with, taken from the images bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineModes {
    /// Engine number
    pub ae: u8,
    /// 4 or 8 contexts
    pub ctx_mode: ContextMode,
    /// NN routing to self, or `None` to leave it untouched
    pub nn_self: Option<bool>,
    /// LM index 0 is global
    pub lm0_global: bool,
    /// LM index 1 is global
    pub lm1_global: bool,
    /// Reloadable microstore words
    pub reload_words: u32,
}

impl EngineModes {
    fn from_image(ae: u8, img: &UofImage) -> Result<Self> {
        let mode = img.ae_mode;
        if mode & (ae_mode::SHARED_USTORE | ae_mode::RELOAD_CTX_SHARED) != 0 {
            return Err(QatError::unsupported(format!(
                "image {}: shared ustore or shared reload mode {mode:#x}",
                img.name
            )));
        }
        let count = u32::from(ae_mode::ctx_mode(mode));
        let ctx_mode = ContextMode::from_count(count).ok_or_else(|| {
            QatError::malformed(format!("image {}: {count} contexts", img.name))
        })?;
        if uof::cs_reload(img.reloadable_size).is_none() {
            return Err(QatError::unsupported(format!(
                "image {}: reloadable size {:#x} words",
                img.name, img.reloadable_size
            )));
        }
        let nn = ae_mode::nn_mode(mode);
        Ok(Self {
            ae,
            ctx_mode,
            nn_self: (nn != ae_mode::NN_MODE_DONTCARE).then_some(nn != 0),
            lm0_global: mode & ae_mode::LMEM0 != 0,
            lm1_global: mode & ae_mode::LMEM1 != 0,
            reload_words: img.reloadable_size,
        })
    }
}

/// Everything a UOF load writes, validated up front.
#[derive(Debug, Clone)]
pub struct UofPlan {
    /// Per-engine modes, one entry per engine with at least one slice
    pub modes: Vec<EngineModes>,
    /// Local-memory writes per engine
    pub lm_writes: BTreeMap<u8, Vec<LmWrite>>,
    slices: BTreeMap<u8, Vec<Slice>>,
}

/// Validate `obj` against the device and derive the load plan.
///
/// Engines of an image's `ae_assigned` mask that are not present are
/// skipped. Nothing is written; `engines` is untouched.
///
/// # Errors
///
/// Returns `Unsupported` for firmware built for other hardware, memory
/// segments, shared-ustore or shared-reload images, more pages, regions or
/// slices than supported, or memory initializers outside local memory;
/// `MalformedFirmware` for inconsistent records.
pub fn plan(obj: &UofObject, engines: &[Engine], prod_type: u32, revision: u32) -> Result<UofPlan> {
    obj.check_compatible(prod_type, revision)?;
    if let Some(seg) = obj.var_mem_seg.filter(|s| !s.is_empty()) {
        return Err(QatError::unsupported(format!(
            "memory segments are not loadable: {seg:?}"
        )));
    }

    let mut slices: BTreeMap<u8, Vec<Slice>> = BTreeMap::new();
    let mut modes: BTreeMap<u8, EngineModes> = BTreeMap::new();
    for (index, img) in obj.images.iter().enumerate() {
        check_image_shape(img)?;
        for engine in engines.iter().filter(|e| img.ae_assigned & (1 << e.ae) != 0) {
            check_image_fits(img, engine)?;
            let m = EngineModes::from_image(engine.ae, img)?;
            if let Some(prev) = modes.get(&engine.ae) {
                if *prev != m {
                    return Err(QatError::unsupported(format!(
                        "AE{}: image {} disagrees with earlier images on engine modes",
                        engine.ae, img.name
                    )));
                }
            }
            modes.insert(engine.ae, m);

            let list = slices.entry(engine.ae).or_default();
            if list.len() >= uof::MAX_SLICES {
                return Err(QatError::unsupported(format!(
                    "AE{}: more than {} images",
                    engine.ae,
                    uof::MAX_SLICES
                )));
            }
            list.push(Slice {
                image: index,
                ctx_mask: img.ctx_assigned & m.ctx_mode.ctx_mask(),
                pages: img
                    .pages
                    .iter()
                    .enumerate()
                    .map(|(page, p)| PageBinding {
                        page,
                        region: p.region,
                        default: p.default_page,
                    })
                    .collect(),
            });
        }
    }

    let lm_writes = plan_local_memory(obj, engines)?;
    for img in &obj.images {
        for r in &img.init_regs {
            check_init_reg(img, r)?;
        }
    }

    debug!(
        "UOF plan: {} engines, {} with local memory init",
        modes.len(),
        lm_writes.len()
    );
    Ok(UofPlan {
        modes: modes.into_values().collect(),
        lm_writes,
        slices,
    })
}

fn check_image_shape(img: &UofImage) -> Result<()> {
    if img.pages.len() > uof::MAX_PAGES {
        return Err(QatError::unsupported(format!(
            "image {}: {} pages",
            img.name,
            img.pages.len()
        )));
    }
    if usize::from(img.page_regions) > uof::MAX_REGIONS {
        return Err(QatError::unsupported(format!(
            "image {}: {} page regions",
            img.name, img.page_regions
        )));
    }
    Ok(())
}

fn check_image_fits(img: &UofImage, engine: &Engine) -> Result<()> {
    let size = u64::from(engine.ustore_size);
    if u64::from(img.entry) >= size {
        return Err(QatError::malformed(format!(
            "image {}: entry {:#x} outside {size:#x}-word ustore",
            img.name, img.entry
        )));
    }
    for block in img.pages.iter().flat_map(|p| &p.blocks) {
        if block.end() > size {
            return Err(QatError::malformed(format!(
                "image {}: block {:#x}..{:#x} outside {size:#x}-word ustore",
                img.name,
                block.start,
                block.end()
            )));
        }
    }
    Ok(())
}

fn check_init_reg(img: &UofImage, r: &crate::firmware::InitRegSym) -> Result<()> {
    if r.value_type != uof::VALUE_IMMEDIATE
        || !matches!(r.init_type, uof::INIT_REG | uof::INIT_REG_CTX)
    {
        return Err(QatError::unsupported(format!(
            "image {}: expression-valued register initializer (type {}, value type {})",
            img.name, r.init_type, r.value_type
        )));
    }
    if RegClass::from_raw(u16::from(r.reg_type)).is_none() {
        return Err(QatError::malformed(format!(
            "image {}: register class {}",
            img.name, r.reg_type
        )));
    }
    if u16::try_from(r.reg_addr).is_err() {
        return Err(QatError::malformed(format!(
            "image {}: register address {:#x}",
            img.name, r.reg_addr
        )));
    }
    Ok(())
}

fn plan_local_memory(obj: &UofObject, engines: &[Engine]) -> Result<BTreeMap<u8, Vec<LmWrite>>> {
    let mut out: BTreeMap<u8, Vec<LmWrite>> = BTreeMap::new();
    for m in &obj.init_mem {
        if m.region != uof::REGION_LMEM {
            return Err(QatError::unsupported(format!(
                "memory initializer for region {}",
                m.region
            )));
        }
        if m.scope != uof::SCOPE_LOCAL {
            return Err(QatError::malformed(format!(
                "local memory initializer with scope {}",
                m.scope
            )));
        }
        let sym = obj.string(m.sym_name)?;
        let ae: u8 = sym
            .parse()
            .map_err(|_| QatError::malformed(format!("local memory symbol {sym:?} is not an engine")))?;
        if !engines.iter().any(|e| e.ae == ae) {
            debug!("skipping local memory init of absent AE{ae}");
            continue;
        }
        let end = u64::from(m.addr) + u64::from(m.num_bytes);
        if end > LMEM_BYTES as u64 {
            return Err(QatError::malformed(format!(
                "AE{ae}: local memory init {:#x}+{:#x} exceeds {LMEM_BYTES:#x} bytes",
                m.addr, m.num_bytes
            )));
        }
        let writes = out.entry(ae).or_default();
        for v in &m.values {
            if u64::from(v.byte_offset) + 4 > u64::from(m.num_bytes) {
                return Err(QatError::malformed(format!(
                    "AE{ae}: value at +{:#x} outside {:#x}-byte initializer",
                    v.byte_offset, m.num_bytes
                )));
            }
            // bounded by LMEM_BYTES above
            #[allow(clippy::cast_possible_truncation)]
            let addr = (m.addr + v.byte_offset) as u16;
            if addr % 4 != 0 {
                return Err(QatError::malformed(format!(
                    "AE{ae}: local memory value at unaligned address {addr:#x}"
                )));
            }
            writes.push(LmWrite::word(addr, v.value));
        }
    }
    Ok(out)
}

impl UofPlan {
    /// Record the slices in the engines' bookkeeping.
    pub fn bind(&self, engines: &mut [Engine]) {
        for engine in engines.iter_mut() {
            if let Some(slices) = self.slices.get(&engine.ae) {
                engine.slices.clone_from(slices);
            }
            if let Some(m) = self.modes.iter().find(|m| m.ae == engine.ae) {
                engine.reload_size = m.reload_words;
            }
        }
    }
}

/// Program context, NN and LM modes of every planned engine.
///
/// # Errors
///
/// Propagates CSR access errors.
pub fn program_modes<B: CsrBus>(csr: &mut AeCsr<B>, plan: &UofPlan) -> Result<()> {
    for m in &plan.modes {
        csr.write_ctx_mode(m.ae, m.ctx_mode)?;
        if let Some(self_mode) = m.nn_self {
            csr.write_nn_mode(m.ae, self_mode)?;
        }
        csr.write_lm_mode(m.ae, RegClass::Lmem0, m.lm0_global)?;
        csr.write_lm_mode(m.ae, RegClass::Lmem1, m.lm1_global)?;
        csr.write_shared_cs_mode(m.ae, false)?;
        debug!("AE{}: {:?}", m.ae, m);
    }
    Ok(())
}

/// Replay the planned local-memory writes, one batch per engine.
///
/// # Errors
///
/// Propagates execution errors.
pub fn init_local_memory<B: CsrBus>(csr: &mut AeCsr<B>, plan: &UofPlan, cfg: &AccelConfig) -> Result<()> {
    for (&ae, writes) in &plan.lm_writes {
        csr.put_lm_batch(ae, writes, cfg.batch_flush_words)?;
    }
    Ok(())
}

/// Microstore ranges covered by the default page of `img`.
fn covered_ranges(img: &UofImage) -> Vec<(u64, u64)> {
    let mut ranges: Vec<(u64, u64)> = img
        .default_page()
        .map(|p| p.blocks.iter().map(|b| (u64::from(b.start), b.end())).collect())
        .unwrap_or_default();
    ranges.sort_unstable();
    ranges
}

/// Write each slice's fill pattern into every microstore word its image's
/// default page does not cover, in contiguous runs.
///
/// Slices are filled in order, so where several images leave the same word
/// uncovered the last one's pattern stays. Code is paged in afterwards.
///
/// # Errors
///
/// Propagates CSR access errors.
pub fn fill_ustore<B: CsrBus>(csr: &mut AeCsr<B>, engines: &[Engine], obj: &UofObject) -> Result<()> {
    for engine in engines {
        let size = u64::from(engine.ustore_size);
        let mut runs = 0usize;
        for img in engine.slices.iter().filter_map(|s| obj.images.get(s.image)) {
            let mut next = 0u64;
            let gaps = covered_ranges(img).into_iter().chain(std::iter::once((size, size)));
            for (start, end) in gaps {
                let start = start.min(size);
                if start > next {
                    #[allow(clippy::cast_possible_truncation)]
                    let run = vec![img.fill_pattern; (start - next) as usize];
                    #[allow(clippy::cast_possible_truncation)]
                    csr.ucode_write(engine.ae, next as usize, &run)?;
                    runs += 1;
                }
                next = next.max(end);
            }
        }
        if runs > 0 {
            debug!("AE{}: filled ustore in {runs} runs", engine.ae);
        }
    }
    Ok(())
}

/// Apply every image's immediate register initializers.
///
/// # Errors
///
/// Returns `MalformedFirmware` for a per-context initializer naming a
/// context the engine's mode does not run, or execution errors.
pub fn init_registers<B: CsrBus>(csr: &mut AeCsr<B>, engines: &[Engine], obj: &UofObject) -> Result<()> {
    for engine in engines {
        let ae = engine.ae;
        for slice in &engine.slices {
            let Some(img) = obj.images.get(slice.image) else {
                continue;
            };
            for r in &img.init_regs {
                let class = RegClass::from_raw(u16::from(r.reg_type))
                    .ok_or_else(|| QatError::malformed(format!("register class {}", r.reg_type)))?;
                let addr = u16::try_from(r.reg_addr)
                    .map_err(|_| QatError::malformed(format!("register address {:#x}", r.reg_addr)))?;

                if class.to_relative().is_some() {
                    csr.abs_data_write(ae, class, addr, r.value)?;
                    continue;
                }
                let mode = csr.ctx_mode(ae)?;
                let mask = if r.init_type == uof::INIT_REG_CTX {
                    if !mode.valid_ctx(r.ctx) {
                        return Err(QatError::malformed(format!(
                            "image {}: initializer for context {} in {mode:?}-context mode",
                            img.name, r.ctx
                        )));
                    }
                    1 << r.ctx
                } else {
                    mode.ctx_mask()
                };
                for ctx in (0..8u8).filter(|c| mask & (1 << c) != 0) {
                    csr.rel_data_write(ae, ctx, class, addr, r.value)?;
                }
            }
        }
    }
    Ok(())
}

/// Write the default pages, point the assigned contexts at the entry
/// address and program the reload size.
///
/// # Errors
///
/// Propagates CSR access errors.
pub fn page_in<B: CsrBus>(csr: &mut AeCsr<B>, engines: &mut [Engine], obj: &UofObject) -> Result<()> {
    for engine in engines.iter_mut().filter(|e| !e.slices.is_empty()) {
        let ae = engine.ae;
        let mut top = 0u64;
        for slice in &engine.slices {
            let Some(img) = obj.images.get(slice.image) else {
                continue;
            };
            if let Some(page) = img.default_page() {
                for block in &page.blocks {
                    csr.ucode_write(ae, block.start as usize, &block.words)?;
                    top = top.max(block.end());
                }
            }
            csr.write_pc(ae, slice.ctx_mask, img.entry)?;
            engine.live_ctx_mask |= slice.ctx_mask;
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            engine.free_addr = top as u32;
        }
        engine.free_size = engine.ustore_size.saturating_sub(engine.free_addr);
        csr.set_reload_ustore(ae, engine.reload_size, false)?;
        debug!(
            "AE{ae}: paged in {} images, live contexts {:#04x}",
            engine.slices.len(),
            engine.live_ctx_mask
        );
    }
    Ok(())
}

/// Run the whole unsigned pipeline.
///
/// `engines` must be freshly reset; on error they are left reset.
///
/// # Errors
///
/// Returns the first planning or CSR error.
pub fn load_uof<B: CsrBus>(
    csr: &mut AeCsr<B>,
    engines: &mut [Engine],
    obj: &UofObject,
    cfg: &AccelConfig,
    prod_type: u32,
    revision: u32,
) -> Result<()> {
    let plan = plan(obj, engines, prod_type, revision)?;
    plan.bind(engines);

    let result = (|| -> Result<()> {
        program_modes(csr, &plan)?;
        init_local_memory(csr, &plan, cfg)?;
        fill_ustore(csr, engines, obj)?;
        init_registers(csr, engines, obj)?;
        page_in(csr, engines, obj)
    })();
    if result.is_err() {
        engines.iter_mut().for_each(Engine::reset);
        return result;
    }
    info!("Loaded {} UOF images onto {} engines", obj.images.len(), plan.modes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ImageSpec, UofBuilder};
    use qat_chip::variant::prod_type;

    fn engines(mask: u32) -> Vec<Engine> {
        (0..32u8).filter(|ae| mask & (1 << ae) != 0).map(|ae| Engine::new(ae, 0x4000)).collect()
    }

    fn object(builder: UofBuilder) -> UofObject {
        UofObject::parse(&builder.build()).unwrap()
    }

    #[test]
    fn images_are_bound_to_present_engines() {
        let obj = object(
            UofBuilder::new(prod_type::DH895XCC)
                .image(ImageSpec::new("a", 0b1011, 0xff))
                .image(ImageSpec::new("b", 0b0100, 0x0f)),
        );
        let mut es = engines(0b0111);
        let p = plan(&obj, &es, prod_type::DH895XCC, 0).unwrap();
        p.bind(&mut es);
        assert_eq!(p.modes.len(), 3);
        assert_eq!(es[0].slices[0].image, 0);
        assert_eq!(es[2].slices[0].image, 1);
        assert_eq!(es[2].slices[0].ctx_mask, 0x0f);
        assert_eq!(es[0].slices[0].pages[0], PageBinding { page: 0, region: 0, default: true });
    }

    #[test]
    fn four_context_images_mask_odd_contexts() {
        let obj = object(UofBuilder::new(prod_type::DH895XCC).image(ImageSpec::new("a", 1, 0xff).ae_mode(0xf4)));
        let p = plan(&obj, &engines(1), prod_type::DH895XCC, 0).unwrap();
        assert_eq!(p.modes[0].ctx_mode, ContextMode::Four);
        assert_eq!(p.modes[0].nn_self, None);
        assert_eq!(p.slices[&0][0].ctx_mask, 0x55);
    }

    #[test]
    fn unsupported_shapes_are_rejected() {
        let es = engines(1);
        for spec in [
            ImageSpec::new("s", 1, 0xff).ae_mode(0xf8 | ae_mode::SHARED_USTORE),
            ImageSpec::new("r", 1, 0xff).ae_mode(0xf8 | ae_mode::RELOAD_CTX_SHARED),
            ImageSpec::new("p", 1, 0xff).extra_page(),
            ImageSpec::new("g", 1, 0xff).regions(2),
            ImageSpec::new("e", 1, 0xff).init_reg(uof::INIT_EXPR, 1, 0, 0),
            ImageSpec::new("z", 1, 0xff).reloadable(0x1000),
        ] {
            let obj = object(UofBuilder::new(prod_type::DH895XCC).image(spec));
            let err = plan(&obj, &es, prod_type::DH895XCC, 0).unwrap_err();
            assert!(matches!(err, QatError::Unsupported { .. }), "{err}");
        }
    }

    #[test]
    fn too_many_slices_are_rejected() {
        let mut b = UofBuilder::new(prod_type::DH895XCC);
        for i in 0..=uof::MAX_SLICES {
            b = b.image(ImageSpec::new(&format!("i{i}"), 1, 0x01));
        }
        assert!(matches!(
            plan(&object(b), &engines(1), prod_type::DH895XCC, 0).unwrap_err(),
            QatError::Unsupported { .. }
        ));
    }

    #[test]
    fn memory_segments_and_foreign_regions_are_rejected() {
        let es = engines(1);
        let obj = object(UofBuilder::new(prod_type::DH895XCC).sram_segment(0x100));
        assert!(matches!(
            plan(&obj, &es, prod_type::DH895XCC, 0).unwrap_err(),
            QatError::Unsupported { .. }
        ));
        let obj = object(UofBuilder::new(prod_type::DH895XCC).init_mem("0", 1, uof::SCOPE_LOCAL, 0, 4, &[(0, 1)]));
        assert!(matches!(
            plan(&obj, &es, prod_type::DH895XCC, 0).unwrap_err(),
            QatError::Unsupported { .. }
        ));
    }

    #[test]
    fn local_memory_records_are_checked() {
        let es = engines(0b11);
        let obj = object(UofBuilder::new(prod_type::DH895XCC).lm_init(1, 0x10, &[(0, 5), (8, 6)]).lm_init(7, 0, &[(0, 1)]));
        let p = plan(&obj, &es, prod_type::DH895XCC, 0).unwrap();
        assert_eq!(p.lm_writes.len(), 1);
        assert_eq!(p.lm_writes[&1], vec![LmWrite::word(0x10, 5), LmWrite::word(0x18, 6)]);

        let obj = object(UofBuilder::new(prod_type::DH895XCC).lm_init(0, 0xffc, &[(0, 1), (4, 2)]));
        assert!(matches!(
            plan(&obj, &es, prod_type::DH895XCC, 0).unwrap_err(),
            QatError::MalformedFirmware { .. }
        ));
        let obj = object(UofBuilder::new(prod_type::DH895XCC).init_mem("x", uof::REGION_LMEM, uof::SCOPE_LOCAL, 0, 4, &[(0, 1)]));
        assert!(plan(&obj, &es, prod_type::DH895XCC, 0).is_err());
    }

    #[test]
    fn blocks_must_fit_the_ustore() {
        let obj = object(
            UofBuilder::new(prod_type::DH895XCC).image(ImageSpec::new("big", 1, 0xff).words(0x3fff, vec![1, 2])),
        );
        assert!(matches!(
            plan(&obj, &engines(1), prod_type::DH895XCC, 0).unwrap_err(),
            QatError::MalformedFirmware { .. }
        ));
    }
}
