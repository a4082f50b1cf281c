//! UOF: unsigned engine object
//!
//! A UOF file wraps one object chunk (`UOF_OBJS`). Inside it, the object
//! header is followed by a chunk table naming the string table, memory
//! initializers, the variable memory segment and one chunk per image. All
//! offsets below the file level, including image tables and microword
//! blocks, are relative to the start of `UOF_OBJS`.

use super::checksum;
use super::reader::{checked_range, cstr_at, read_table, FromReader, Reader};
use crate::error::{QatError, Result};
use bytes::Bytes;
use qat_chip::fwfmt::{uof, CHUNK_ID_LEN};
use qat_chip::ucode::{unpack_word, PACKED_WORD_BYTES};
use tracing::debug;

// ── Records ──────────────────────────────────────────────────────────────────

/// One `(byte_offset, value)` pair of a memory initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemValAttr {
    /// Byte offset from the initializer's base address
    pub byte_offset: u32,
    /// Value stored there
    pub value: u32,
}

impl FromReader for MemValAttr {
    const SIZE: usize = uof::MEM_VAL_ATTR_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            byte_offset: r.u32()?,
            value: r.u32()?,
        })
    }
}

/// Memory initializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMem {
    /// String-table offset of the symbol; for local memory the engine number
    pub sym_name: u32,
    /// Memory region (only [`uof::REGION_LMEM`] is loadable)
    pub region: u8,
    /// Global or local scope
    pub scope: u8,
    /// Base byte address
    pub addr: u32,
    /// Bytes covered
    pub num_bytes: u32,
    /// Values to store
    pub values: Vec<MemValAttr>,
}

impl InitMem {
    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let sym_name = r.u32()?;
        let region = r.u8()?;
        let scope = r.u8()?;
        r.skip(2)?;
        let addr = r.u32()?;
        let num_bytes = r.u32()?;
        let num = r.u32()? as usize;
        if num.saturating_mul(MemValAttr::SIZE) > r.remaining() {
            return Err(QatError::malformed(format!(
                "UOF: init_mem with {num} values exceeds chunk"
            )));
        }
        let values = (0..num).map(|_| r.read()).collect::<Result<_>>()?;
        Ok(Self {
            sym_name,
            region,
            scope,
            addr,
            num_bytes,
            values,
        })
    }
}

/// Base, size and alignment of one memory region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemRegion {
    /// Base address
    pub base: u32,
    /// Size in bytes
    pub size: u32,
    /// Alignment
    pub align: u32,
}

/// Variable memory segment: external memory the object expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VarMemSeg {
    /// SRAM
    pub sram: MemRegion,
    /// SDRAM
    pub sdram: MemRegion,
    /// Second SDRAM channel
    pub sdram1: MemRegion,
    /// Scratch
    pub scratch: MemRegion,
}

impl VarMemSeg {
    /// Whether any region is requested.
    pub const fn is_empty(&self) -> bool {
        self.sram.size == 0 && self.sdram.size == 0 && self.sdram1.size == 0 && self.scratch.size == 0
    }
}

impl FromReader for VarMemSeg {
    const SIZE: usize = uof::VAR_MEM_SEG_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let mut region = || -> Result<MemRegion> {
            Ok(MemRegion {
                base: r.u32()?,
                size: r.u32()?,
                align: r.u32()?,
            })
        };
        Ok(Self {
            sram: region()?,
            sdram: region()?,
            sdram1: region()?,
            scratch: region()?,
        })
    }
}

/// Register table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AeReg {
    /// String-table offset of the name
    pub name: u32,
    /// String-table offset of the visible name
    pub vis_name: u32,
    /// Register class number
    pub reg_type: u16,
    /// Register address
    pub addr: u16,
    /// Access mode
    pub access_mode: u16,
    /// Visible to debuggers
    pub visible: u8,
    /// Reference count
    pub ref_count: u16,
    /// Cross-object id
    pub xo_id: u32,
}

impl FromReader for AeReg {
    const SIZE: usize = uof::AE_REG_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let name = r.u32()?;
        let vis_name = r.u32()?;
        let reg_type = r.u16()?;
        let addr = r.u16()?;
        let access_mode = r.u16()?;
        let visible = r.u8()?;
        r.skip(1)?;
        let ref_count = r.u16()?;
        r.skip(2)?;
        let xo_id = r.u32()?;
        Ok(Self {
            name,
            vis_name,
            reg_type,
            addr,
            access_mode,
            visible,
            ref_count,
            xo_id,
        })
    }
}

/// Register initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitRegSym {
    /// String-table offset of the symbol
    pub sym_name: u32,
    /// [`uof::INIT_REG`], [`uof::INIT_REG_CTX`] or an expression type
    pub init_type: u8,
    /// [`uof::VALUE_IMMEDIATE`] or [`uof::VALUE_EXPRESSION`]
    pub value_type: u8,
    /// Register class number
    pub reg_type: u8,
    /// Context for [`uof::INIT_REG_CTX`]
    pub ctx: u8,
    /// Register address (relative or absolute per class)
    pub reg_addr: u32,
    /// Immediate value
    pub value: u32,
}

impl FromReader for InitRegSym {
    const SIZE: usize = uof::INIT_REG_SYM_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            sym_name: r.u32()?,
            init_type: r.u8()?,
            value_type: r.u8()?,
            reg_type: r.u8()?,
            ctx: r.u8()?,
            reg_addr: r.u32()?,
            value: r.u32()?,
        })
    }
}

/// Symbolic breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sbreak {
    /// Page number
    pub page_num: u32,
    /// Virtual microaddress
    pub virt_uaddr: u32,
    /// Breakpoint type
    pub sbreak_type: u8,
    /// Register class number
    pub reg_type: u8,
    /// Address offset
    pub addr_offset: u32,
    /// Register address
    pub reg_addr: u32,
}

impl FromReader for Sbreak {
    const SIZE: usize = uof::SBREAK_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let page_num = r.u32()?;
        let virt_uaddr = r.u32()?;
        let sbreak_type = r.u8()?;
        let reg_type = r.u8()?;
        r.skip(2)?;
        Ok(Self {
            page_num,
            virt_uaddr,
            sbreak_type,
            reg_type,
            addr_offset: r.u32()?,
            reg_addr: r.u32()?,
        })
    }
}

/// Import variable, neighbour register or fixup entry of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportVar {
    /// String-table offset of the name
    pub name: u32,
    /// Value
    pub value: u32,
}

impl FromReader for ImportVar {
    const SIZE: usize = uof::IMPORT_VAR_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            name: r.u32()?,
            value: r.u32()?,
        })
    }
}

struct BlockHdr {
    start_addr: u32,
    words_num: u32,
    uword_offset: u32,
}

impl FromReader for BlockHdr {
    const SIZE: usize = uof::UWORD_BLOCK_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let block = Self {
            start_addr: r.u32()?,
            words_num: r.u32()?,
            uword_offset: r.u32()?,
        };
        r.skip(4)?;
        Ok(block)
    }
}

/// Contiguous run of microwords.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UwordBlock {
    /// First microstore address
    pub start: u32,
    /// Unpacked words, masked to the file word width
    pub words: Vec<u64>,
}

impl UwordBlock {
    /// One past the last address covered.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + self.words.len() as u64
    }
}

/// Code page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodePage {
    /// Region the page belongs to
    pub region: u32,
    /// Page number
    pub page_num: u32,
    /// Loaded when the image starts
    pub default_page: bool,
    /// First virtual address
    pub beg_vaddr: u32,
    /// First physical address
    pub beg_paddr: u32,
    /// Neighbour register table
    pub neigh_regs: Vec<ImportVar>,
    /// Microcode variable table
    pub uc_vars: Vec<ImportVar>,
    /// Import variable table
    pub imp_vars: Vec<ImportVar>,
    /// Import expression table
    pub imp_exprs: Vec<ImportVar>,
    /// Microwords in the page
    pub num_words: u32,
    /// Microword blocks
    pub blocks: Vec<UwordBlock>,
}

impl CodePage {
    fn read(r: &mut Reader<'_>, objs: &[u8]) -> Result<Self> {
        let region = r.u32()?;
        let page_num = r.u32()?;
        let default_page = r.u8()? != 0;
        r.skip(3)?;
        let beg_vaddr = r.u32()?;
        let beg_paddr = r.u32()?;
        let neigh_regs = read_table(objs, r.u32()? as usize)?;
        let uc_vars = read_table(objs, r.u32()? as usize)?;
        let imp_vars = read_table(objs, r.u32()? as usize)?;
        let imp_exprs = read_table(objs, r.u32()? as usize)?;
        let code_area = r.u32()? as usize;

        let mut ca = Reader::at(objs, code_area)?;
        let num_words = ca.u32()?;
        let block_tab = ca.u32()? as usize;
        let blocks = read_table::<BlockHdr>(objs, block_tab)?
            .into_iter()
            .map(|b| {
                let len = u64::from(b.words_num) * PACKED_WORD_BYTES as u64;
                let range = checked_range(objs.len(), u64::from(b.uword_offset), len, "UOF microword block")?;
                let words = objs[range]
                    .chunks_exact(PACKED_WORD_BYTES)
                    .map(|c| unpack_word([c[0], c[1], c[2], c[3], c[4], c[5]]))
                    .collect();
                Ok(UwordBlock { start: b.start_addr, words })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            region,
            page_num,
            default_page,
            beg_vaddr,
            beg_paddr,
            neigh_regs,
            uc_vars,
            imp_vars,
            imp_exprs,
            num_words,
            blocks,
        })
    }
}

/// Image: code and initializers for a set of engines and contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UofImage {
    /// Image name
    pub name: String,
    /// Engines the image is assigned to
    pub ae_assigned: u32,
    /// Contexts the image runs on
    pub ctx_assigned: u8,
    /// CPU types the image was built for
    pub cpu_type: u32,
    /// Entry microaddress
    pub entry: u32,
    /// Pattern written to microstore words no page covers
    pub fill_pattern: u64,
    /// Reloadable microstore words
    pub reloadable_size: u32,
    /// Sensitivity
    pub sensitivity: u8,
    /// Mode word, see [`uof::ae_mode`]
    pub ae_mode: u16,
    /// Highest supported hardware version
    pub max_ver: u16,
    /// Lowest supported hardware version
    pub min_ver: u16,
    /// Attributes
    pub attrib: u16,
    /// Page regions
    pub page_regions: u16,
    /// Code pages
    pub pages: Vec<CodePage>,
    /// Register table
    pub regs: Vec<AeReg>,
    /// Register initializers
    pub init_regs: Vec<InitRegSym>,
    /// Symbolic breakpoints
    pub sbreaks: Vec<Sbreak>,
    /// String-table offset of the application metadata
    pub app_meta: u32,
}

impl UofImage {
    fn parse(chunk: &[u8], objs: &[u8], strings: &[u8]) -> Result<Self> {
        let mut r = Reader::new(chunk);
        let name = r.u32()?;
        let ae_assigned = r.u32()?;
        let ctx_assigned = r.u32()?;
        let cpu_type = r.u32()?;
        let entry = r.u32()?;
        let fill_lo = r.u32()?;
        let fill_hi = r.u32()?;
        let reloadable_size = r.u32()?;
        let sensitivity = r.u8()?;
        r.skip(1)?;
        let ae_mode = r.u16()?;
        let max_ver = r.u16()?;
        let min_ver = r.u16()?;
        let attrib = r.u16()?;
        r.skip(2)?;
        let page_regions = r.u16()?;
        let num_pages = r.u16()?;
        let regs = read_table(objs, r.u32()? as usize)?;
        let init_regs = read_table(objs, r.u32()? as usize)?;
        let sbreaks = read_table(objs, r.u32()? as usize)?;
        let app_meta = r.u32()?;

        let pages = (0..num_pages)
            .map(|_| CodePage::read(&mut r, objs))
            .collect::<Result<Vec<_>>>()?;

        let ctx_assigned = u8::try_from(ctx_assigned).map_err(|_| {
            QatError::malformed(format!("UOF image: context mask {ctx_assigned:#x}"))
        })?;

        Ok(Self {
            name: cstr_at(strings, name as usize)?.to_string(),
            ae_assigned,
            ctx_assigned,
            cpu_type,
            entry,
            fill_pattern: (u64::from(fill_hi) << 32) | u64::from(fill_lo),
            reloadable_size,
            sensitivity,
            ae_mode,
            max_ver,
            min_ver,
            attrib,
            page_regions,
            pages,
            regs,
            init_regs,
            sbreaks,
            app_meta,
        })
    }

    /// Default page, if any.
    pub fn default_page(&self) -> Option<&CodePage> {
        self.pages.iter().find(|p| p.default_page)
    }
}

// ── Object ───────────────────────────────────────────────────────────────────

struct FileChunkHdr {
    id: [u8; CHUNK_ID_LEN],
    checksum: u32,
    offset: u32,
    size: u32,
}

impl FromReader for FileChunkHdr {
    const SIZE: usize = uof::FILE_CHUNK_HDR_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.array()?,
            checksum: r.u32()?,
            offset: r.u32()?,
            size: r.u32()?,
        })
    }
}

struct ObjChunkHdr {
    id: [u8; CHUNK_ID_LEN],
    offset: u32,
    size: u32,
}

impl FromReader for ObjChunkHdr {
    const SIZE: usize = uof::OBJ_CHUNK_HDR_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.array()?,
            offset: r.u32()?,
            size: r.u32()?,
        })
    }
}

/// Parsed UOF object.
#[derive(Debug, Clone)]
pub struct UofObject {
    /// CPU types the object was built for
    pub cpu_type: u32,
    /// Lowest supported hardware revision
    pub min_cpu_ver: u16,
    /// Highest supported hardware revision
    pub max_cpu_ver: u16,
    /// Memory initializers
    pub init_mem: Vec<InitMem>,
    /// External memory requirements
    pub var_mem_seg: Option<VarMemSeg>,
    /// Images in file order
    pub images: Vec<UofImage>,
    strings: Bytes,
}

impl UofObject {
    /// Validate a UOF file and parse its object.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` on a bad file id, version or chunk
    /// checksum, a missing chunk, or any record outside its parent.
    pub fn parse(blob: &Bytes) -> Result<Self> {
        let mut r = Reader::new(blob);
        let fid = r.u32()?;
        if fid != uof::FID {
            return Err(QatError::malformed(format!("UOF: bad file id {fid:#x}")));
        }
        r.skip(4)?;
        let min_ver = r.u8()?;
        let maj_ver = r.u8()?;
        r.skip(2)?;
        let max_chunks = r.u16()?;
        let num_chunks = r.u16()?;
        if (maj_ver, min_ver) != (uof::MAJ_VER, uof::MIN_VER) {
            return Err(QatError::malformed(format!("UOF: version {maj_ver}.{min_ver:#x}")));
        }
        if num_chunks > max_chunks {
            return Err(QatError::malformed(format!(
                "UOF: {num_chunks} chunks (max {max_chunks})"
            )));
        }

        let mut objs = None;
        for _ in 0..num_chunks {
            let chunk: FileChunkHdr = r.read()?;
            let range = checked_range(
                blob.len(),
                u64::from(chunk.offset),
                u64::from(chunk.size),
                "UOF file chunk",
            )?;
            if chunk.id == uof::OBJS && objs.is_none() {
                checksum::verify("UOF_OBJS", chunk.checksum, &blob[range.clone()])?;
                objs = Some(range);
            }
        }
        let objs = objs.ok_or_else(|| QatError::malformed("UOF: no UOF_OBJS chunk"))?;
        Self::parse_objs(&blob.slice(objs))
    }

    fn parse_objs(objs: &Bytes) -> Result<Self> {
        let mut r = Reader::new(objs);
        let cpu_type = r.u32()?;
        let min_cpu_ver = r.u16()?;
        let max_cpu_ver = r.u16()?;
        let max_chunks = r.u16()?;
        let num_chunks = r.u16()?;
        r.skip(8)?;
        if num_chunks > max_chunks {
            return Err(QatError::malformed(format!(
                "UOF object: {num_chunks} chunks (max {max_chunks})"
            )));
        }

        let mut strt = None;
        let mut imem = None;
        let mut mseg = None;
        let mut imag = Vec::new();
        for _ in 0..num_chunks {
            let chunk: ObjChunkHdr = r.read()?;
            let range = checked_range(
                objs.len(),
                u64::from(chunk.offset),
                u64::from(chunk.size),
                "UOF object chunk",
            )?;
            match chunk.id {
                uof::STRT => strt = strt.or(Some(range)),
                uof::IMEM => imem = imem.or(Some(range)),
                uof::MSEG => mseg = mseg.or(Some(range)),
                uof::IMAG => imag.push(range),
                other => debug!("UOF: skipping chunk {:?}", String::from_utf8_lossy(&other)),
            }
        }

        let strt = strt.ok_or_else(|| QatError::malformed("UOF: no string table"))?;
        let strt_len = Reader::at(objs, strt.start)?.u32()?;
        let strt_body = checked_range(strt.len(), 4, u64::from(strt_len), "UOF string table")?;
        let strings = objs.slice(strt.start + strt_body.start..strt.start + strt_body.end);

        let init_mem = match imem {
            Some(range) => {
                let mut r = Reader::new(&objs[range]);
                let count = r.u32()? as usize;
                if count >= uof::MAX_LMEM_REG {
                    return Err(QatError::malformed(format!("UOF: {count} memory initializers")));
                }
                (0..count).map(|_| InitMem::read(&mut r)).collect::<Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };

        let var_mem_seg = match mseg {
            Some(range) => Some(Reader::new(&objs[range]).read::<VarMemSeg>()?),
            None => None,
        };

        if imag.is_empty() {
            return Err(QatError::malformed("UOF: no images"));
        }
        let images = imag
            .into_iter()
            .map(|range| UofImage::parse(&objs[range], objs, &strings))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "UOF: cpu type {cpu_type:#x}, {} images, {} memory initializers",
            images.len(),
            init_mem.len()
        );
        Ok(Self {
            cpu_type,
            min_cpu_ver,
            max_cpu_ver,
            init_mem,
            var_mem_seg,
            images,
            strings,
        })
    }

    /// Reject objects built for other hardware.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if `prod_type` is not among the object's CPU
    /// types or `revision` lies outside its version range.
    pub fn check_compatible(&self, prod_type: u32, revision: u32) -> Result<()> {
        if self.cpu_type & prod_type == 0 {
            return Err(QatError::unsupported(format!(
                "UOF built for cpu type {:#x}, device is {prod_type:#x}",
                self.cpu_type
            )));
        }
        let range = u32::from(self.min_cpu_ver)..=u32::from(self.max_cpu_ver);
        if !range.contains(&revision) {
            return Err(QatError::unsupported(format!(
                "UOF supports revisions {range:?}, device is {revision}"
            )));
        }
        Ok(())
    }

    /// String at `offset` of the object's string table.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` for an offset outside the table.
    pub fn string(&self, offset: u32) -> Result<&str> {
        cstr_at(&self.strings, offset as usize)
    }
}
