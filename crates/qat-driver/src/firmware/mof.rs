//! MOF: the outer container bundling named UOF and SUOF objects

use super::checksum;
use super::reader::{checked_range, cstr_at, FromReader, Reader};
use crate::error::{QatError, Result};
use bytes::Bytes;
use qat_chip::fwfmt::{mof, CHUNK_ID_LEN};
use tracing::debug;

/// Kind of object carried in a MOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Unsigned UOF
    Uof,
    /// Signed SUOF
    Suof,
}

/// One named object of a MOF.
#[derive(Debug, Clone)]
pub struct MofObject {
    /// Name from the symbol table
    pub name: String,
    /// Object kind, from the table it was listed in
    pub kind: ObjectKind,
    /// Object bytes, sharing the MOF allocation
    pub data: Bytes,
}

struct ChunkHdr {
    id: [u8; CHUNK_ID_LEN],
    offset: u64,
    size: u64,
}

impl FromReader for ChunkHdr {
    const SIZE: usize = mof::CHUNK_HDR_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.array()?,
            offset: r.u64()?,
            size: r.u64()?,
        })
    }
}

struct ObjEntry {
    offset: u64,
    size: u64,
    name: u32,
}

impl FromReader for ObjEntry {
    const SIZE: usize = mof::OBJ_CHUNK_HDR_LEN;

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        r.skip(CHUNK_ID_LEN)?;
        let offset = r.u64()?;
        let size = r.u64()?;
        let name = r.u32()?;
        r.skip(4)?;
        Ok(Self { offset, size, name })
    }
}

/// Parsed MOF.
#[derive(Debug, Clone)]
pub struct Mof {
    objects: Vec<MofObject>,
}

impl Mof {
    /// Validate `blob` and index its objects.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` on a bad file id, version or checksum,
    /// a missing or duplicated chunk, or any chunk or object outside its
    /// parent.
    pub fn parse(blob: &Bytes) -> Result<Self> {
        let mut r = Reader::new(blob);
        let fid = r.u32()?;
        if fid != mof::FID {
            return Err(QatError::malformed(format!("MOF: bad file id {fid:#x}")));
        }
        let csum = r.u32()?;
        let min_ver = r.u8()?;
        let maj_ver = r.u8()?;
        r.skip(2)?;
        let max_chunks = r.u16()?;
        let num_chunks = r.u16()?;

        if (maj_ver, min_ver) != (mof::MAJ_VER, mof::MIN_VER) {
            return Err(QatError::malformed(format!("MOF: version {maj_ver}.{min_ver}")));
        }
        checksum::verify("MOF", csum, &blob[mof::CSUM_START..])?;
        if num_chunks <= 1 || num_chunks > max_chunks {
            return Err(QatError::malformed(format!(
                "MOF: {num_chunks} chunks (max {max_chunks})"
            )));
        }

        let mut sym = None;
        let mut uof = None;
        let mut suof = None;
        for _ in 0..num_chunks {
            let chunk: ChunkHdr = r.read()?;
            let range = checked_range(blob.len(), chunk.offset, chunk.size, "MOF chunk")?;
            let slot = match chunk.id {
                mof::SYM_OBJS => &mut sym,
                mof::UOF_OBJS => &mut uof,
                mof::SUOF_OBJS => &mut suof,
                other => {
                    debug!("MOF: skipping chunk {:?}", String::from_utf8_lossy(&other));
                    continue;
                }
            };
            if slot.replace(range).is_some() {
                return Err(QatError::malformed(format!(
                    "MOF: duplicate {} chunk",
                    String::from_utf8_lossy(&chunk.id)
                )));
            }
        }

        let sym = sym.ok_or_else(|| QatError::malformed("MOF: no SYM_OBJS chunk"))?;
        if uof.is_none() && suof.is_none() {
            return Err(QatError::malformed("MOF: no object chunk"));
        }

        let sym_chunk = &blob[sym];
        let sym_len = Reader::new(sym_chunk).u32()?;
        let strings = &sym_chunk[checked_range(sym_chunk.len(), 4, u64::from(sym_len), "MOF symbols")?];

        let mut objects = Vec::new();
        for (kind, range) in [(ObjectKind::Uof, uof), (ObjectKind::Suof, suof)] {
            let Some(range) = range else { continue };
            let table = &blob[range.clone()];
            let mut r = Reader::new(table);
            let _max = r.u16()?;
            let num = r.u16()?;
            for _ in 0..num {
                let entry: ObjEntry = r.read()?;
                let obj = checked_range(table.len(), entry.offset, entry.size, "MOF object")?;
                let name = cstr_at(strings, entry.name as usize)?.to_string();
                debug!("MOF: {kind:?} object {name} ({} bytes)", obj.len());
                objects.push(MofObject {
                    name,
                    kind,
                    data: blob.slice(range.start + obj.start..range.start + obj.end),
                });
            }
        }
        Ok(Self { objects })
    }

    /// All objects, UOFs first.
    pub fn objects(&self) -> &[MofObject] {
        &self.objects
    }

    /// Object named `name`.
    pub fn find(&self, name: &str) -> Option<&MofObject> {
        self.objects.iter().find(|o| o.name == name)
    }
}
