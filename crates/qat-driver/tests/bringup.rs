//! End-to-end bring-up against the software accelerator.

use bytes::Bytes;
use qat_chip::fwfmt::{mof, suof, uof};
use qat_chip::regfile::{ContextMode, RegClass};
use qat_chip::regs;
use qat_chip::ucode::{immed_w0, immed_w1, CTX_ARB_KILL, NOP};
use qat_chip::variant::{prod_type, Fuses};
use qat_chip::ChipVariant;
use qat_driver::testing::{reseal, signed_blob, ImageSpec, MofBuilder, SuofBuilder, UofBuilder};
use qat_driver::{
    AccelConfig, Accelerator, DeviceInfo, EngineState, ExecOptions, Fault, FcuCommand,
    HostDmaAllocator, LmWrite, MemoryFirmwareSource, QatError, SoftwareAccelerator,
};

const DH895_FW: &str = "qat_895xcc.bin";

/// Offset of the `u64` size in a MOF chunk header.
const CHUNK_SIZE_OFFSET: usize = qat_chip::fwfmt::CHUNK_ID_LEN + 8;

fn dh895(fw: impl Into<Bytes>) -> Accelerator<SoftwareAccelerator> {
    let src = MemoryFirmwareSource::new().with(DH895_FW, fw);
    let mut acc = Accelerator::simulated(ChipVariant::Dh895xcc, Box::new(src));
    acc.engine_init().expect("engine init");
    acc
}

fn uof_mof(builder: UofBuilder) -> Bytes {
    MofBuilder::new().uof("icp_qat_ae.uof", builder.build().to_vec()).build()
}

#[derive(Debug, PartialEq, Eq)]
struct Observed {
    ctx_enables: u32,
    cc_enable: u32,
    active: u32,
    lm_addr: (Option<u32>, Option<u32>),
    ustore: Vec<Option<u64>>,
}

fn observe(sim: &SoftwareAccelerator, ae: u8, ctx: u8) -> Observed {
    Observed {
        ctx_enables: sim.peek(ae, regs::CTX_ENABLES).unwrap_or_default(),
        cc_enable: sim.peek(ae, regs::CC_ENABLE).unwrap_or_default(),
        active: sim.peek(ae, regs::ACTIVE_CTX_STATUS).unwrap_or_default(),
        lm_addr: (
            sim.peek_indirect(ae, ctx, regs::LM_ADDR_0_INDIRECT),
            sim.peek_indirect(ae, ctx, regs::LM_ADDR_1_INDIRECT),
        ),
        ustore: (0..4).map(|a| sim.ustore_word(ae, a)).collect(),
    }
}

#[test]
fn transient_execution_restores_engine_state() {
    let mut acc = dh895(Bytes::new());
    let (ae, ctx) = (3, 2);
    let csr = acc.csr_mut();
    csr.ucode_write(ae, 0, &[0x0f0_0000_0001, 0x0f0_0000_0002, 0x0f0_0000_0003, 0x0f0_0000_0004])
        .unwrap();
    csr.write(ae, regs::CC_ENABLE, regs::cc_enable::CCE).unwrap();
    csr.indirect_write(ae, 1 << ctx, regs::LM_ADDR_0_INDIRECT, 0x40).unwrap();
    csr.indirect_write(ae, 1 << ctx, regs::LM_ADDR_1_INDIRECT, 0x80).unwrap();
    let before = observe(csr.bus(), ae, ctx);

    let prog = [immed_w1(0x04, true, 0xfeed_f00d), immed_w0(0x04, true, 0xfeed_f00d), NOP, CTX_ARB_KILL];
    csr.exec_ucode(ae, ctx, &prog, ExecOptions::for_program(prog.len())).unwrap();
    assert_eq!(observe(csr.bus(), ae, ctx), before);

    csr.bus_mut().inject(Fault::FrozenProfileCounter { ae });
    let err = csr.exec_ucode(ae, ctx, &prog, ExecOptions::for_program(prog.len())).unwrap_err();
    assert!(matches!(err, QatError::CsrTimeout { offset: regs::PROFILE_COUNT, .. }));
    assert_eq!(observe(csr.bus(), ae, ctx), before);
    assert_eq!(csr.state(ae).unwrap(), EngineState::Disabled);
}

#[test]
fn foreign_cpu_type_is_refused_before_any_write() {
    let mut acc = dh895(uof_mof(UofBuilder::new(prod_type::C62X)));
    let writes = acc.csr().bus().csr_writes();
    let err = acc.firmware_load(DH895_FW).unwrap_err();
    assert!(matches!(err, QatError::Unsupported { .. }));
    assert_eq!(acc.csr().bus().csr_writes(), writes);
    assert!(acc.firmware().is_none());
}

#[test]
fn odd_context_in_four_context_mode() {
    let mut acc = dh895(Bytes::new());
    acc.csr_mut().write_ctx_mode(5, ContextMode::Four).unwrap();
    let err = acc.read_register(5, 1, RegClass::GpaRel, 0).unwrap_err();
    assert!(matches!(err, QatError::InvalidArgument { .. }));
    acc.read_register(5, 2, RegClass::GpaRel, 0).unwrap();
}

#[test]
fn frozen_heartbeat_fails_init_with_no_context_enabled() {
    let src = MemoryFirmwareSource::new();
    let mut acc = Accelerator::simulated(ChipVariant::C3xxx, Box::new(src));
    acc.csr_mut().bus_mut().inject(Fault::FrozenProfileCounter { ae: 2 });
    let err = acc.engine_init().unwrap_err();
    assert!(matches!(err, QatError::CsrTimeout { ae: 2, offset: regs::PROFILE_COUNT }));
    let states = acc.engine_states().unwrap();
    assert!(states.iter().all(|&(_, s)| s == EngineState::Disabled));
}

#[test]
fn batched_local_memory_matches_unbatched_write() {
    let writes: Vec<LmWrite> = (0..6u16)
        .map(|i| LmWrite {
            addr: 0x100 + i * 8,
            bytes: (0..8u8).map(|b| b.wrapping_mul(17).wrapping_add(i as u8)).collect(),
        })
        .collect();
    let flat: Vec<u8> = writes.iter().flat_map(|w| w.bytes.iter().copied()).collect();

    let mut batched = dh895(Bytes::new());
    batched.csr_mut().put_lm_batch(1, &writes, 24).unwrap();
    let mut direct = dh895(Bytes::new());
    direct.csr_mut().write_local_memory(1, 0x100, &flat).unwrap();

    let a = batched.csr().bus().local_memory(1).unwrap();
    let b = direct.csr().bus().local_memory(1).unwrap();
    assert_eq!(&a[0x100..0x130], flat.as_slice());
    assert_eq!(a, b);
}

#[test]
fn truncated_chunk_with_valid_checksum_is_malformed() {
    let mut blob = uof_mof(UofBuilder::new(prod_type::DH895XCC)).to_vec();
    let size_at = mof::FILE_HDR_LEN + CHUNK_SIZE_OFFSET;
    let huge = (blob.len() as u64).to_le_bytes();
    blob[size_at..size_at + 8].copy_from_slice(&huge);
    reseal(&mut blob);

    let mut acc = dh895(blob);
    let err = acc.firmware_load(DH895_FW).unwrap_err();
    assert!(matches!(err, QatError::MalformedFirmware { .. }), "{err}");
}

#[test]
fn uof_initialises_memory_registers_and_microstore() {
    let words = vec![0x0123_4567_89ab, 0x0123_4567_89ac];
    let fw = uof_mof(
        UofBuilder::new(prod_type::DH895XCC)
            .lm_init(0, 0x40, &[(0, 0xdead_beef), (4, 0x1234_5678)])
            .image(
                ImageSpec::new("svc", 0b1, 0xff)
                    .words(0x10, words.clone())
                    .entry(0x10)
                    .init_reg(uof::INIT_REG, RegClass::GpaRel as u8, 3, 0xabcd)
                    .init_reg_ctx(2, RegClass::GpbRel as u8, 1, 0x77),
            ),
    );
    let mut acc = dh895(fw);
    acc.firmware_load(DH895_FW).unwrap();

    let lm = acc.csr().bus().local_memory(0).unwrap();
    assert_eq!(&lm[0x40..0x48], &[0xef, 0xbe, 0xad, 0xde, 0x78, 0x56, 0x34, 0x12]);
    for ctx in 0..8 {
        assert_eq!(acc.read_register(0, ctx, RegClass::GpaRel, 3).unwrap(), 0xabcd);
    }
    assert_eq!(acc.read_register(0, 2, RegClass::GpbRel, 1).unwrap(), 0x77);
    assert_eq!(acc.read_register(0, 3, RegClass::GpbRel, 1).unwrap(), 0);

    let stored = acc.csr_mut().ucode_read(0, 0x10, 2).unwrap();
    assert_eq!(stored, words.iter().map(|&w| qat_chip::ucode::set_ecc(w)).collect::<Vec<_>>());
    assert_eq!(acc.csr().bus().peek_indirect(0, 7, regs::CTX_STS_INDIRECT), Some(0x10));

    acc.engine_start().unwrap();
    assert_eq!(acc.engine_states().unwrap()[0].1, EngineState::Enabled);
    assert!(matches!(acc.read_register(0, 0, RegClass::GpaRel, 3).unwrap_err(), QatError::Busy { ae: 0 }));
}

#[test]
fn shared_engine_takes_each_image_fill_and_every_block() {
    use qat_chip::ucode::set_ecc;

    let (fill_a, fill_b) = (0x0aaa_0000_0001, 0x0bbb_0000_0002);
    let fw = uof_mof(
        UofBuilder::new(prod_type::DH895XCC)
            .image(ImageSpec::new("a", 0b1, 0x0f).fill(fill_a).words(0x000, vec![0x0123_4567_0001; 2]))
            .image(
                ImageSpec::new("b", 0b1, 0xf0)
                    .fill(fill_b)
                    .words(0x100, vec![0x0123_4567_0002; 2])
                    .words(0x200, vec![0x0123_4567_0003; 3])
                    .entry(0x100),
            ),
    );
    let mut acc = dh895(fw);
    acc.firmware_load(DH895_FW).unwrap();
    let csr = acc.csr_mut();

    // code from both images, including b's second block
    assert_eq!(csr.ucode_read(0, 0x000, 2).unwrap(), vec![set_ecc(0x0123_4567_0001); 2]);
    assert_eq!(csr.ucode_read(0, 0x100, 2).unwrap(), vec![set_ecc(0x0123_4567_0002); 2]);
    assert_eq!(csr.ucode_read(0, 0x200, 3).unwrap(), vec![set_ecc(0x0123_4567_0003); 3]);
    // holes left by both images carry the later image's pattern
    assert_eq!(csr.ucode_read(0, 0x002, 1).unwrap(), vec![set_ecc(fill_b)]);
    assert_eq!(csr.ucode_read(0, 0x203, 1).unwrap(), vec![set_ecc(fill_b)]);
    assert_eq!(csr.ucode_read(0, 0x3fff, 1).unwrap(), vec![set_ecc(fill_b)]);
    assert_eq!(csr.bus().peek_indirect(0, 4, regs::CTX_STS_INDIRECT), Some(0x100));
}

#[test]
fn suof_skips_fused_engines() {
    let fuses = Fuses { fusectl: 0b10, softstrap: 0 };
    let sim = SoftwareAccelerator::with_fuses(ChipVariant::C62x, fuses);
    let info = DeviceInfo::new(ChipVariant::C62x, fuses, 0);
    let fw = MofBuilder::new()
        .suof("icp_qat_ae.suof", SuofBuilder::new(prod_type::C62X).image("svc", 0x3ff, &[7; 16]).build().to_vec())
        .build();
    let src = MemoryFirmwareSource::new()
        .with("qat_c62x.bin", fw)
        .with("qat_c62x_mmp.bin", signed_blob(suof::CSS_MMP_FIRMWARE, &[0; 32]));
    let mut acc = Accelerator::new(
        sim,
        info,
        AccelConfig::for_simulation(&ChipVariant::C62x),
        Box::new(src),
        Box::new(HostDmaAllocator),
    );
    acc.engine_init().unwrap();
    acc.firmware_load_default().unwrap();
    acc.firmware_start(0, 0xff).unwrap();

    let loads: Vec<u8> = acc
        .csr()
        .bus()
        .fcu_log()
        .iter()
        .filter_map(|c| match c {
            FcuCommand::Load { ae } => Some(*ae),
            _ => None,
        })
        .collect();
    assert_eq!(loads, vec![0, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(acc.loaded_ae_mask(), 0x3fd);
}

#[test]
fn fcu_rejection_leaves_nothing_loaded() {
    let fw = SuofBuilder::new(prod_type::C3XXX).image("svc", 0x3f, &[]).build();
    let src = MemoryFirmwareSource::new()
        .with("qat_c3xxx.bin", fw)
        .with("qat_c3xxx_mmp.bin", signed_blob(suof::CSS_MMP_FIRMWARE, &[0; 32]));
    let mut acc = Accelerator::simulated(ChipVariant::C3xxx, Box::new(src));
    acc.engine_init().unwrap();
    acc.csr_mut().bus_mut().inject(Fault::FcuVerifyFail);
    let err = acc.firmware_load_default().unwrap_err();
    assert!(matches!(err, QatError::FirmwareAuthFailed { .. }));
    assert!(acc.firmware().is_none());
    assert!(matches!(acc.engine_start().unwrap_err(), QatError::NoFirmware));
}

#[test]
fn device_masks_follow_fuses() {
    let info = DeviceInfo::new(ChipVariant::C3xxx, Fuses::default(), 0);
    assert_eq!(info.ae_mask(), 0x3f);
    assert_eq!(info.accel_mask(), 0x7);
    let fused = DeviceInfo::new(ChipVariant::C3xxx, Fuses { fusectl: 0, softstrap: 0b1000 }, 0);
    assert_eq!(fused.ae_mask(), 0x37);
}

#[test]
#[ignore] // Requires hardware
fn hardware_bring_up() {
    let addr = std::env::var("QAT_TEST_DEVICE").unwrap_or_else(|_| "0000:3d:00.0".to_string());
    let mut acc = Accelerator::open(&addr).expect("attach");
    acc.engine_init().expect("engine init");
    acc.firmware_load_default().expect("firmware load");
    acc.engine_start().expect("engine start");
    for (ae, state) in acc.engine_states().expect("engine states") {
        println!("AE{ae}: {state:?}");
    }
}
