//! Firmware fixture builders
//!
//! Produce well-formed MOF, UOF and SUOF blobs with correct checksums, for
//! tests and for driving the software accelerator from the CLI. Each
//! builder emits exactly the layout the parsers in [`crate::firmware`]
//! read, so fixtures can be corrupted byte by byte and then re-sealed with
//! [`reseal`] to get past the checksum.

use crate::firmware::checksum::crc16;
use crate::firmware::Container;
use bytes::Bytes;
use qat_chip::fwfmt::{mof, suof, uof, CHUNK_ID_LEN};
use qat_chip::ucode::PACKED_WORD_BYTES;

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn set_u32(out: &mut [u8], at: usize, v: u32) {
    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[allow(clippy::cast_possible_truncation)]
fn len32(n: usize) -> u32 {
    n as u32
}

/// String table with a leading empty string at offset 0.
#[derive(Debug, Clone)]
struct Strings(Vec<u8>);

impl Strings {
    fn new() -> Self {
        Self(vec![0])
    }

    fn add(&mut self, s: &str) -> u32 {
        let off = len32(self.0.len());
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(0);
        off
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.0.len());
        put_u32(&mut out, len32(self.0.len()));
        out.extend_from_slice(&self.0);
        out
    }
}

/// Recompute the checksum of a fixture after it was modified.
///
/// MOF and SUOF checksums cover the file from the version bytes; a UOF's
/// covers its `UOF_OBJS` chunk. Blobs with an unknown file id are left
/// alone.
pub fn reseal(blob: &mut [u8]) {
    match Container::identify(blob) {
        Ok(Container::Mof | Container::Suof) => {
            let crc = crc16(&blob[mof::CSUM_START..]);
            set_u32(blob, 4, u32::from(crc));
        }
        Ok(Container::Uof) => {
            let hdr = uof::FILE_HDR_LEN;
            let field = |b: &[u8], at: usize| {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&b[at..at + 4]);
                u32::from_le_bytes(raw) as usize
            };
            let off = field(blob, hdr + CHUNK_ID_LEN + 4);
            let size = field(blob, hdr + CHUNK_ID_LEN + 8);
            let end = (off + size).min(blob.len());
            let crc = crc16(&blob[off.min(end)..end]);
            set_u32(blob, hdr + CHUNK_ID_LEN, u32::from(crc));
        }
        Err(_) => {}
    }
}

// ── MOF ──────────────────────────────────────────────────────────────────────

/// MOF fixture.
#[derive(Debug, Clone, Default)]
pub struct MofBuilder {
    uofs: Vec<(String, Vec<u8>)>,
    suofs: Vec<(String, Vec<u8>)>,
}

impl MofBuilder {
    /// Empty MOF.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a UOF object.
    #[must_use]
    pub fn uof(mut self, name: &str, data: Vec<u8>) -> Self {
        self.uofs.push((name.to_string(), data));
        self
    }

    /// Add a SUOF object.
    #[must_use]
    pub fn suof(mut self, name: &str, data: Vec<u8>) -> Self {
        self.suofs.push((name.to_string(), data));
        self
    }

    fn object_table(objs: &[(String, Vec<u8>)], names: &[u32], id: [u8; CHUNK_ID_LEN]) -> Vec<u8> {
        let mut out = Vec::new();
        #[allow(clippy::cast_possible_truncation)]
        let n = objs.len() as u16;
        put_u16(&mut out, n);
        put_u16(&mut out, n);
        let mut data_off = mof::OBJ_HDR_LEN + objs.len() * mof::OBJ_CHUNK_HDR_LEN;
        for ((_, data), &name) in objs.iter().zip(names) {
            out.extend_from_slice(&id);
            put_u64(&mut out, data_off as u64);
            put_u64(&mut out, data.len() as u64);
            put_u32(&mut out, name);
            put_u32(&mut out, 0);
            data_off += data.len();
        }
        for (_, data) in objs {
            out.extend_from_slice(data);
        }
        out
    }

    /// Encode.
    pub fn build(self) -> Bytes {
        let mut strings = Strings::new();
        let uof_names: Vec<_> = self.uofs.iter().map(|(n, _)| strings.add(n)).collect();
        let suof_names: Vec<_> = self.suofs.iter().map(|(n, _)| strings.add(n)).collect();

        let mut chunks = vec![(mof::SYM_OBJS, strings.encode())];
        if !self.uofs.is_empty() {
            chunks.push((mof::UOF_OBJS, Self::object_table(&self.uofs, &uof_names, uof::OBJS)));
        }
        if !self.suofs.is_empty() {
            chunks.push((mof::SUOF_OBJS, Self::object_table(&self.suofs, &suof_names, mof::SUOF_OBJS)));
        }
        encode_chunked(mof::FID, [mof::MIN_VER, mof::MAJ_VER, 0, 0], &chunks)
    }
}

/// Header plus `u64`-addressed chunk table shared by MOF and SUOF.
fn encode_chunked(fid: u32, ver: [u8; 4], chunks: &[([u8; CHUNK_ID_LEN], Vec<u8>)]) -> Bytes {
    let mut out = Vec::new();
    put_u32(&mut out, fid);
    put_u32(&mut out, 0);
    out.extend_from_slice(&ver);
    #[allow(clippy::cast_possible_truncation)]
    let n = chunks.len() as u16;
    put_u16(&mut out, n);
    put_u16(&mut out, n);

    let mut off = mof::FILE_HDR_LEN + chunks.len() * mof::CHUNK_HDR_LEN;
    for (id, body) in chunks {
        out.extend_from_slice(id);
        put_u64(&mut out, off as u64);
        put_u64(&mut out, body.len() as u64);
        off += body.len();
    }
    for (_, body) in chunks {
        out.extend_from_slice(body);
    }
    let crc = crc16(&out[mof::CSUM_START..]);
    set_u32(&mut out, 4, u32::from(crc));
    Bytes::from(out)
}

// ── UOF ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemInit {
    sym: String,
    region: u8,
    scope: u8,
    addr: u32,
    num_bytes: u32,
    values: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Copy)]
struct RegInit {
    init_type: u8,
    value_type: u8,
    reg_type: u8,
    ctx: u8,
    reg_addr: u32,
    value: u32,
}

/// One image of a [`UofBuilder`].
#[derive(Debug, Clone)]
pub struct ImageSpec {
    name: String,
    ae_assigned: u32,
    ctx_assigned: u8,
    entry: u32,
    fill: u64,
    ae_mode: u16,
    reloadable: u32,
    blocks: Vec<(u32, Vec<u64>)>,
    extra_pages: u16,
    regions: u16,
    init_regs: Vec<RegInit>,
}

impl ImageSpec {
    /// Image on the engines of `ae_assigned`, running on `ctx_assigned`,
    /// in 8-context mode with no code.
    pub fn new(name: &str, ae_assigned: u32, ctx_assigned: u8) -> Self {
        Self {
            name: name.to_string(),
            ae_assigned,
            ctx_assigned,
            entry: 0,
            fill: 0,
            ae_mode: 8 | (uof::ae_mode::NN_MODE_DONTCARE << uof::ae_mode::NN_MODE_SHIFT),
            reloadable: 0,
            blocks: Vec::new(),
            extra_pages: 0,
            regions: 1,
            init_regs: Vec::new(),
        }
    }

    /// Add a block of microwords at `start` to the default page.
    #[must_use]
    pub fn words(mut self, start: u32, words: Vec<u64>) -> Self {
        self.blocks.push((start, words));
        self
    }

    /// Entry microaddress.
    #[must_use]
    pub const fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    /// Fill pattern for uncovered microstore words.
    #[must_use]
    pub const fn fill(mut self, fill: u64) -> Self {
        self.fill = fill;
        self
    }

    /// Raw mode word.
    #[must_use]
    pub const fn ae_mode(mut self, mode: u16) -> Self {
        self.ae_mode = mode;
        self
    }

    /// Reloadable microstore size.
    #[must_use]
    pub const fn reloadable(mut self, words: u32) -> Self {
        self.reloadable = words;
        self
    }

    /// Add an empty non-default page.
    #[must_use]
    pub const fn extra_page(mut self) -> Self {
        self.extra_pages += 1;
        self
    }

    /// Page region count.
    #[must_use]
    pub const fn regions(mut self, n: u16) -> Self {
        self.regions = n;
        self
    }

    /// Immediate register initializer.
    #[must_use]
    pub fn init_reg(mut self, init_type: u8, reg_type: u8, reg_addr: u32, value: u32) -> Self {
        self.init_regs.push(RegInit {
            init_type,
            value_type: uof::VALUE_IMMEDIATE,
            reg_type,
            ctx: 0,
            reg_addr,
            value,
        });
        self
    }

    /// Immediate register initializer for one context.
    #[must_use]
    pub fn init_reg_ctx(mut self, ctx: u8, reg_type: u8, reg_addr: u32, value: u32) -> Self {
        self.init_regs.push(RegInit {
            init_type: uof::INIT_REG_CTX,
            value_type: uof::VALUE_IMMEDIATE,
            reg_type,
            ctx,
            reg_addr,
            value,
        });
        self
    }
}

/// UOF fixture.
#[derive(Debug, Clone)]
pub struct UofBuilder {
    cpu_type: u32,
    min_ver: u16,
    max_ver: u16,
    mem: Vec<MemInit>,
    sram_segment: u32,
    images: Vec<ImageSpec>,
}

impl UofBuilder {
    /// Object for `cpu_type`, revisions 0 to 0xff.
    ///
    /// An object built with no images gets one empty image on engine 0.
    pub fn new(cpu_type: u32) -> Self {
        Self {
            cpu_type,
            min_ver: 0,
            max_ver: 0xff,
            mem: Vec::new(),
            sram_segment: 0,
            images: Vec::new(),
        }
    }

    /// Supported revision range.
    #[must_use]
    pub const fn revisions(mut self, min: u16, max: u16) -> Self {
        self.min_ver = min;
        self.max_ver = max;
        self
    }

    /// Local-memory initializer for engine `ae`.
    #[must_use]
    pub fn lm_init(self, ae: u8, addr: u32, values: &[(u32, u32)]) -> Self {
        let num_bytes = values.iter().map(|&(off, _)| off + 4).max().unwrap_or(0);
        self.init_mem(&ae.to_string(), uof::REGION_LMEM, uof::SCOPE_LOCAL, addr, num_bytes, values)
    }

    /// Arbitrary memory initializer.
    #[must_use]
    pub fn init_mem(
        mut self,
        sym: &str,
        region: u8,
        scope: u8,
        addr: u32,
        num_bytes: u32,
        values: &[(u32, u32)],
    ) -> Self {
        self.mem.push(MemInit {
            sym: sym.to_string(),
            region,
            scope,
            addr,
            num_bytes,
            values: values.to_vec(),
        });
        self
    }

    /// Request an SRAM segment of `size` bytes.
    #[must_use]
    pub const fn sram_segment(mut self, size: u32) -> Self {
        self.sram_segment = size;
        self
    }

    /// Add an image.
    #[must_use]
    pub fn image(mut self, image: ImageSpec) -> Self {
        self.images.push(image);
        self
    }

    /// Encode.
    pub fn build(mut self) -> Bytes {
        if self.images.is_empty() {
            self.images.push(ImageSpec::new("default", 0x1, 0xff));
        }
        let objs = self.encode_objs();

        let mut out = Vec::new();
        put_u32(&mut out, uof::FID);
        put_u32(&mut out, 0);
        out.extend_from_slice(&[uof::MIN_VER, uof::MAJ_VER, 0, 0]);
        put_u16(&mut out, 1);
        put_u16(&mut out, 1);
        out.extend_from_slice(&uof::OBJS);
        put_u32(&mut out, u32::from(crc16(&objs)));
        put_u32(&mut out, len32(uof::FILE_HDR_LEN + uof::FILE_CHUNK_HDR_LEN));
        put_u32(&mut out, len32(objs.len()));
        out.extend_from_slice(&objs);
        Bytes::from(out)
    }

    fn encode_objs(&self) -> Vec<u8> {
        let mut strings = Strings::new();
        let mem_syms: Vec<_> = self.mem.iter().map(|m| strings.add(&m.sym)).collect();
        let img_names: Vec<_> = self.images.iter().map(|i| strings.add(&i.name)).collect();

        let num_chunks = 2 + usize::from(self.sram_segment != 0) + self.images.len();
        let mut objs = vec![0u8; uof::OBJ_HDR_LEN + num_chunks * uof::OBJ_CHUNK_HDR_LEN];
        let mut chunks: Vec<([u8; CHUNK_ID_LEN], usize, usize)> = Vec::new();

        let mut push_chunk = |objs: &mut Vec<u8>, id, body: &[u8]| {
            chunks.push((id, objs.len(), body.len()));
            objs.extend_from_slice(body);
        };

        push_chunk(&mut objs, uof::STRT, &strings.encode());

        let mut imem = Vec::new();
        put_u32(&mut imem, len32(self.mem.len()));
        for (m, &sym) in self.mem.iter().zip(&mem_syms) {
            put_u32(&mut imem, sym);
            imem.extend_from_slice(&[m.region, m.scope, 0, 0]);
            put_u32(&mut imem, m.addr);
            put_u32(&mut imem, m.num_bytes);
            put_u32(&mut imem, len32(m.values.len()));
            for &(off, val) in &m.values {
                put_u32(&mut imem, off);
                put_u32(&mut imem, val);
            }
        }
        push_chunk(&mut objs, uof::IMEM, &imem);

        if self.sram_segment != 0 {
            let mut mseg = Vec::new();
            for v in [0, self.sram_segment, 4] {
                put_u32(&mut mseg, v);
            }
            mseg.resize(uof::VAR_MEM_SEG_LEN, 0);
            push_chunk(&mut objs, uof::MSEG, &mseg);
        }

        for (img, &name) in self.images.iter().zip(&img_names) {
            let body = Self::encode_image(&mut objs, img, name);
            push_chunk(&mut objs, uof::IMAG, &body);
        }

        let mut hdr = Vec::new();
        put_u32(&mut hdr, self.cpu_type);
        put_u16(&mut hdr, self.min_ver);
        put_u16(&mut hdr, self.max_ver);
        #[allow(clippy::cast_possible_truncation)]
        let n = chunks.len() as u16;
        put_u16(&mut hdr, n);
        put_u16(&mut hdr, n);
        put_u32(&mut hdr, 0);
        put_u32(&mut hdr, 0);
        for (id, off, size) in &chunks {
            hdr.extend_from_slice(id);
            put_u32(&mut hdr, len32(*off));
            put_u32(&mut hdr, len32(*size));
        }
        objs[..hdr.len()].copy_from_slice(&hdr);
        objs
    }

    /// Append an empty `[u32 0]` table and return its offset.
    fn empty_table(objs: &mut Vec<u8>) -> u32 {
        let off = len32(objs.len());
        put_u32(objs, 0);
        off
    }

    /// Append the image's tables and code to `objs`, then return the image
    /// chunk body referencing them.
    fn encode_image(objs: &mut Vec<u8>, img: &ImageSpec, name: u32) -> Vec<u8> {
        let reg_tab = Self::empty_table(objs);
        let sbreak_tab = Self::empty_table(objs);
        let init_reg_tab = len32(objs.len());
        put_u32(objs, len32(img.init_regs.len()));
        for r in &img.init_regs {
            put_u32(objs, 0);
            objs.extend_from_slice(&[r.init_type, r.value_type, r.reg_type, r.ctx]);
            put_u32(objs, r.reg_addr);
            put_u32(objs, r.value);
        }

        let mut data_offs = Vec::new();
        for (_, words) in &img.blocks {
            data_offs.push(len32(objs.len()));
            for w in words {
                objs.extend_from_slice(&w.to_le_bytes()[..PACKED_WORD_BYTES]);
            }
        }
        let block_tab = len32(objs.len());
        put_u32(objs, len32(img.blocks.len()));
        for ((start, words), data) in img.blocks.iter().zip(&data_offs) {
            put_u32(objs, *start);
            put_u32(objs, len32(words.len()));
            put_u32(objs, *data);
            put_u32(objs, 0);
        }
        let code_area = len32(objs.len());
        put_u32(objs, len32(img.blocks.iter().map(|(_, w)| w.len()).sum()));
        put_u32(objs, block_tab);
        let empty_blocks = Self::empty_table(objs);
        let empty_code = len32(objs.len());
        put_u32(objs, 0);
        put_u32(objs, empty_blocks);
        let empty_tab = Self::empty_table(objs);

        let mut out = Vec::new();
        put_u32(&mut out, name);
        put_u32(&mut out, img.ae_assigned);
        put_u32(&mut out, u32::from(img.ctx_assigned));
        put_u32(&mut out, 0);
        put_u32(&mut out, img.entry);
        #[allow(clippy::cast_possible_truncation)]
        {
            put_u32(&mut out, img.fill as u32);
            put_u32(&mut out, (img.fill >> 32) as u32);
        }
        put_u32(&mut out, img.reloadable);
        out.extend_from_slice(&[0, 0]);
        put_u16(&mut out, img.ae_mode);
        put_u16(&mut out, 0xff);
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);
        put_u16(&mut out, img.regions);
        put_u16(&mut out, 1 + img.extra_pages);
        put_u32(&mut out, reg_tab);
        put_u32(&mut out, init_reg_tab);
        put_u32(&mut out, sbreak_tab);
        put_u32(&mut out, 0);

        for page in 0..=img.extra_pages {
            let default = page == 0;
            put_u32(&mut out, 0);
            put_u32(&mut out, u32::from(page));
            out.extend_from_slice(&[u8::from(default), 0, 0, 0]);
            put_u32(&mut out, 0);
            put_u32(&mut out, 0);
            for _ in 0..4 {
                put_u32(&mut out, empty_tab);
            }
            put_u32(&mut out, if default { code_area } else { empty_code });
        }
        out
    }
}

// ── SUOF ─────────────────────────────────────────────────────────────────────

/// Signed blob of CSS firmware type `fw_type` around `payload`. The key
/// and signature are fixed patterns; only the FCU judges them.
pub fn signed_blob(fw_type: u32, payload: &[u8]) -> Bytes {
    let mut out = vec![0u8; suof::CSS_HDR_LEN];
    set_u32(&mut out, suof::CSS_FW_TYPE_OFFSET, fw_type);
    out.resize(out.len() + suof::CSS_MODULUS_LEN, 0xa5);
    out.extend_from_slice(&[1, 0, 1, 0]);
    out.resize(out.len() + suof::CSS_SIGNATURE_LEN, 0x5a);
    out.extend_from_slice(payload);
    Bytes::from(out)
}

/// SUOF fixture.
#[derive(Debug, Clone)]
pub struct SuofBuilder {
    dev_type: u32,
    images: Vec<(String, u32, Vec<u8>)>,
}

impl SuofBuilder {
    /// SUOF signed for `dev_type`, revisions 0 to 0xff.
    pub const fn new(dev_type: u32) -> Self {
        Self {
            dev_type,
            images: Vec::new(),
        }
    }

    /// Add an AE image for the engines in `ae_mask`.
    #[must_use]
    pub fn image(mut self, name: &str, ae_mask: u32, insts: &[u8]) -> Self {
        self.images.push((name.to_string(), ae_mask, insts.to_vec()));
        self
    }

    fn ae_payload(&self, name: &str, ae_mask: u32, insts: &[u8]) -> Vec<u8> {
        let mut meta = Vec::new();
        put_u32(&mut meta, 0);
        put_u16(&mut meta, 1);
        put_u16(&mut meta, 0);
        put_u32(&mut meta, self.dev_type);
        put_u16(&mut meta, 0xff);
        put_u16(&mut meta, 0);
        put_u32(&mut meta, ae_mask);
        put_u32(&mut meta, 0xff << 8);
        meta.extend_from_slice(&[0, 8, 0xf, 0, 0, 0, 0, 0, 0]);
        meta.resize(suof::NAME_OFFSET, 0);
        let name = &name.as_bytes()[..name.len().min(suof::NAME_LEN - 1)];
        meta.extend_from_slice(name);
        meta.resize(suof::AE_MODE_LEN, 0);
        meta.resize(suof::AE_MODE_LEN + suof::INIT_SEQ_LEN, 0);
        meta.extend_from_slice(insts);
        meta
    }

    /// Encode.
    pub fn build(self) -> Bytes {
        let mut strings = Strings::new();
        for (name, _, _) in &self.images {
            strings.add(name);
        }
        let mut chunks = vec![([0u8; CHUNK_ID_LEN], strings.encode())];
        for (name, ae_mask, insts) in &self.images {
            let signed = signed_blob(suof::CSS_AE_FIRMWARE, &self.ae_payload(name, *ae_mask, insts));
            let mut body = Vec::new();
            put_u32(&mut body, len32(signed.len()));
            put_u32(&mut body, 0);
            body.extend_from_slice(&signed);
            chunks.push((*b"SUOF_IMG", body));
        }
        encode_chunked(suof::FID, [suof::MIN_VER, suof::MAJ_VER, 0, 0], &chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{Mof, Suof, UofObject};
    use qat_chip::variant::prod_type;

    #[test]
    fn reseal_restores_valid_checksums() {
        let mut uof = UofBuilder::new(prod_type::C62X).build().to_vec();
        let last = uof.len() - 1;
        uof[last] ^= 0x10;
        assert!(UofObject::parse(&Bytes::from(uof.clone())).is_err());
        reseal(&mut uof);
        assert!(UofObject::parse(&Bytes::from(uof)).is_ok());

        let mut mof = MofBuilder::new().uof("a", vec![1; 4]).build().to_vec();
        let last = mof.len() - 1;
        mof[last] = 9;
        reseal(&mut mof);
        assert!(Mof::parse(&Bytes::from(mof)).is_ok());

        let mut s = SuofBuilder::new(prod_type::C62X).image("x", 2, &[7]).build().to_vec();
        let last = s.len() - 1;
        s[last] = 8;
        reseal(&mut s);
        assert!(Suof::parse(&Bytes::from(s)).is_ok());
    }

    #[test]
    fn extra_pages_are_encoded() {
        let blob = UofBuilder::new(prod_type::C62X)
            .image(ImageSpec::new("p", 1, 0xff).words(0, vec![1]).extra_page())
            .build();
        let img = &UofObject::parse(&blob).unwrap().images[0];
        assert_eq!(img.pages.len(), 2);
        assert!(img.pages[1].blocks.is_empty());
        assert_eq!(img.default_page().unwrap().num_words, 1);
    }
}
