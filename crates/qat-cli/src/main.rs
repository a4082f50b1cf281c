//! `qat`: command-line interface for QAT acceleration-engine firmware.
//!
//! ```text
//! USAGE:
//!   qat inspect <file>               Dump a MOF, UOF or SUOF container
//!   qat simulate [--variant V]       Init, load and start on the software model
//!   qat probe <pcie-addr>            Map the CSR BAR and print engine states
//! ```

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use qat_chip::fwfmt::suof::CSS_MMP_FIRMWARE;
use qat_chip::{ChipVariant, HwVariant};
use qat_driver::firmware::{Container, Mof, Suof, UofObject};
use qat_driver::testing::{signed_blob, ImageSpec, MofBuilder, SuofBuilder, UofBuilder};
use qat_driver::{Accelerator, CsrBus, FcuCommand, MemoryFirmwareSource};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qat", about = "QAT acceleration-engine firmware CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Dump the contents of a firmware container.
    Inspect {
        /// MOF, UOF or SUOF file.
        file: PathBuf,
    },
    /// Run init, firmware load and start against the software accelerator.
    Simulate {
        /// Chip variant (dh895xcc, c62x, c3xxx).
        #[arg(long, default_value = "c62x")]
        variant: String,
        /// Firmware to load instead of a generated fixture.
        #[arg(long)]
        firmware: Option<PathBuf>,
        /// MMP image for authenticated variants.
        #[arg(long)]
        mmp: Option<PathBuf>,
    },
    /// Attach to a device and print its engine states.
    Probe {
        /// PCIe address (e.g. 0000:3d:00.0).
        pcie_addr: String,
        /// Also run engine init.
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Inspect { file } => cmd_inspect(&file)?,
        Cmd::Simulate { variant, firmware, mmp } => {
            cmd_simulate(&variant, firmware.as_deref(), mmp.as_deref())?;
        }
        Cmd::Probe { pcie_addr, init } => cmd_probe(&pcie_addr, init)?,
    }

    Ok(())
}

fn read(path: &Path) -> Result<Bytes> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Bytes::from(data))
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let blob = read(path)?;
    println!("{}: {} bytes", path.display(), blob.len());

    match Container::identify(&blob)? {
        Container::Mof => {
            let mof = Mof::parse(&blob)?;
            println!("MOF with {} objects", mof.objects().len());
            for obj in mof.objects() {
                println!();
                println!("== {} ({:?}, {} bytes)", obj.name, obj.kind, obj.data.len());
                match obj.kind {
                    qat_driver::firmware::ObjectKind::Uof => print_uof(&UofObject::parse(&obj.data)?),
                    qat_driver::firmware::ObjectKind::Suof => print_suof(&Suof::parse(&obj.data)?),
                }
            }
        }
        Container::Uof => print_uof(&UofObject::parse(&blob)?),
        Container::Suof => print_suof(&Suof::parse(&blob)?),
    }
    Ok(())
}

fn print_uof(obj: &UofObject) {
    println!(
        "UOF  cpu {:#010x}  revisions {:#x}..={:#x}  {} memory initializers",
        obj.cpu_type,
        obj.min_cpu_ver,
        obj.max_cpu_ver,
        obj.init_mem.len()
    );
    for img in &obj.images {
        let words: u32 = img.pages.iter().map(|p| p.num_words).sum();
        println!(
            "  {:<24} AEs {:#06x}  ctx {:#04x}  mode {:#04x}  entry {:#06x}  {} pages / {} words  {} reg inits",
            img.name,
            img.ae_assigned,
            img.ctx_assigned,
            img.ae_mode,
            img.entry,
            img.pages.len(),
            words,
            img.init_regs.len()
        );
    }
}

fn print_suof(suof: &Suof) {
    println!("SUOF with {} signed images", suof.images.len());
    for img in &suof.images {
        println!(
            "  {:<24} AEs {:#06x}  dev {:#010x}  ctx_enables {:#06x}  {} bytes",
            img.name,
            img.ae_mode.ae_mask,
            img.ae_mode.dev_type,
            img.ae_mode.ctx_enables,
            img.signed.len()
        );
    }
}

/// Firmware for the software model when none is given on the command line.
fn fixture(variant: ChipVariant) -> (Bytes, Bytes) {
    let ae_mask = variant.ae_mask(qat_chip::variant::Fuses::default());
    let mmp = signed_blob(CSS_MMP_FIRMWARE, &[0; 256]);
    let mof = if variant.fw_auth() {
        let suof = SuofBuilder::new(variant.prod_type())
            .image("qat_svc", ae_mask & !1, &[0; 64])
            .image("qat_admin", 1, &[0; 64])
            .build();
        MofBuilder::new().suof(variant.ae_object_name(), suof.to_vec()).build()
    } else {
        let uof = UofBuilder::new(variant.prod_type())
            .lm_init(0, 0, &[(0, 0x5a5a_5a5a)])
            .image(ImageSpec::new("qat_svc", ae_mask, 0xff).words(0, vec![0x0123_4567_89ab; 16]))
            .build();
        MofBuilder::new().uof(variant.ae_object_name(), uof.to_vec()).build()
    };
    (mof, mmp)
}

fn cmd_simulate(variant: &str, firmware: Option<&Path>, mmp: Option<&Path>) -> Result<()> {
    let variant = ChipVariant::from_name(variant)
        .ok_or_else(|| anyhow::anyhow!("Unknown variant: {variant}"))?;
    let (default_fw, default_mmp) = fixture(variant);
    let fw = firmware.map(read).transpose()?.unwrap_or(default_fw);
    let mmp = mmp.map(read).transpose()?.unwrap_or(default_mmp);

    let src = MemoryFirmwareSource::new()
        .with(variant.mof_name(), fw)
        .with(variant.mmp_name(), mmp);
    let mut acc = Accelerator::simulated(variant, Box::new(src));

    println!("Simulating {} ({} engines)", variant.name(), acc.engines().len());
    acc.engine_init().context("engine init")?;
    acc.firmware_load_default().context("firmware load")?;
    acc.engine_start().context("engine start")?;
    println!("Loaded {} onto AEs {:#x}", variant.mof_name(), acc.loaded_ae_mask());

    print_states(&mut acc)?;

    let log = acc.csr().bus().fcu_log();
    if !log.is_empty() {
        println!("FCU commands:");
        for cmd in log {
            match cmd {
                FcuCommand::Auth { bus_addr } => println!("  auth  {bus_addr:#x}"),
                FcuCommand::Load { ae } => println!("  load  AE{ae}"),
                FcuCommand::Start => println!("  start"),
            }
        }
    }
    println!("CSR writes: {}", acc.csr().bus().csr_writes());
    Ok(())
}

fn cmd_probe(pcie_addr: &str, init: bool) -> Result<()> {
    let mut acc = Accelerator::open(pcie_addr).with_context(|| format!("attaching {pcie_addr}"))?;
    let info = *acc.info();
    println!("Device       : {} @ {pcie_addr}", info.variant.name());
    println!("Revision     : {:#x}", info.revision);
    println!("AE mask      : {:#x}", info.ae_mask());
    println!("Accel mask   : {:#x}", info.accel_mask());
    println!("SKU          : {:?}", info.variant.sku(info.fuses));
    println!("FW auth      : {}", info.variant.fw_auth());

    if init {
        acc.engine_init().context("engine init")?;
        println!("Engines initialised");
    }
    print_states(&mut acc)
}

fn print_states<B: CsrBus>(acc: &mut Accelerator<B>) -> Result<()> {
    for (ae, state) in acc.engine_states()? {
        println!("  AE{ae:<2} {state:?}");
    }
    Ok(())
}
