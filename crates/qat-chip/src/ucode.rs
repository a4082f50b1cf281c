//! Microword format, ECC and the instruction subset the host synthesizes.
//!
//! ## Word layout
//!
//! ```text
//! 50      44 43      40 39        28 27      20 19      10 9        0
//! +---------+----------+------------+----------+----------+----------+
//! |   ECC   |    --    |   opcode   |  imm hi  | B operand| A operand|
//! +---------+----------+------------+----------+----------+----------+
//! ```
//!
//! The ECC field holds seven parity bits, each the parity of the payload
//! under one fixed mask. Every word written to the microstore carries
//! freshly computed ECC.
//!
//! ## Synthesized instructions
//!
//! | Opcode | Mnemonic | Effect |
//! |--------|----------|--------|
//! | `0xf44` | `immed_w1[r, imm16]` | `r[31:16] = imm16` |
//! | `0xf04` | `immed_w0[r, imm16]` | `r[15:0] = imm16` |
//! | `0xf00` | `nop` | |
//! | `0xe00` | `ctx_arb[kill]` | context disables itself |
//! | `0xa07` | `alu[--, --, b, a]` (A slot) | `ALU_OUT = a` |
//! | `0xa03` | `alu[--, --, b, b]` (B slot) | `ALU_OUT = b` |
//! | `0xfc0` | `alu[*l$index0++, --, b, r]` | store word, post-increment |
//! | `0xfd0` | `ld_field[*l$index0, mask, r]` | store byte lanes |
//!
//! Immediates carry their low byte in the source operand slot as a
//! no-destination address (`0x300 | byte`) and their high byte in bits
//! `[27:20]`.

use crate::regfile::{LM_INDEX0, NO_DEST_BASE};

// ── Word layout ──────────────────────────────────────────────────────────────

/// Payload bits of a microword.
pub const PAYLOAD_MASK: u64 = 0x0fff_ffff_ffff;
/// First ECC bit.
pub const ECC_SHIFT: u32 = 44;
/// ECC field.
pub const ECC_MASK: u64 = 0x7f << ECC_SHIFT;
/// Mask applied to words unpacked from firmware images.
pub const FILE_WORD_MASK: u64 = 0x0bff_ffff_ffff;
/// Bytes per packed microword in firmware images.
pub const PACKED_WORD_BYTES: usize = 6;
/// Sentinel for "no word".
pub const INVALID_WORD: u64 = u64::MAX;

const ECC_PARITY_MASKS: [u64; 7] = [
    0x0ff8_0000_7fff,
    0x01f8_01ff_801f,
    0x0e38_7e07_81e1,
    0x07cb_8e38_8e22,
    0x0af5_b2c9_3244,
    0x0f56_d552_5488,
    0x0daf_69a4_6910,
];

/// Recompute the ECC field of `word`.
#[must_use]
pub const fn set_ecc(word: u64) -> u64 {
    let payload = word & !ECC_MASK;
    let mut ecc = 0u64;
    let mut bit = 0;
    while bit < ECC_PARITY_MASKS.len() {
        let parity = ((payload & ECC_PARITY_MASKS[bit]).count_ones() & 1) as u64;
        ecc |= parity << bit;
        bit += 1;
    }
    payload | (ecc << ECC_SHIFT)
}

/// Whether the ECC field of `word` matches its payload.
#[must_use]
pub const fn ecc_ok(word: u64) -> bool {
    set_ecc(word) == word
}

/// Unpack one 6-byte little-endian microword from a firmware image.
#[must_use]
pub fn unpack_word(bytes: [u8; PACKED_WORD_BYTES]) -> u64 {
    let mut raw = [0u8; 8];
    raw[..PACKED_WORD_BYTES].copy_from_slice(&bytes);
    u64::from_le_bytes(raw) & FILE_WORD_MASK
}

// ── Opcodes ──────────────────────────────────────────────────────────────────

/// Opcode values of the synthesized subset.
pub mod op {
    /// `immed_w0`.
    pub const IMMED_W0: u16 = 0xf04;
    /// `immed_w1`.
    pub const IMMED_W1: u16 = 0xf44;
    /// `nop`.
    pub const NOP: u16 = 0xf00;
    /// `ctx_arb`.
    pub const CTX_ARB: u16 = 0xe00;
    /// ALU pass-through of the A operand.
    pub const ALU_READ_A: u16 = 0xa07;
    /// ALU pass-through of the B operand.
    pub const ALU_READ_B: u16 = 0xa03;
    /// Word store through LM index 0 with post-increment.
    pub const LM_STORE: u16 = 0xfc0;
    /// Byte-lane store through LM index 0.
    pub const LM_FIELD: u16 = 0xfd0;
}

const OPCODE_SHIFT: u32 = 28;
const IMM_HI_SHIFT: u32 = 20;
const B_SHIFT: u32 = 10;
const OPERAND_MASK: u64 = 0x3ff;

const fn opcode_bits(op: u16) -> u64 {
    (op as u64) << OPCODE_SHIFT
}

/// `nop`.
pub const NOP: u64 = 0x0f0_000c_0300;
/// `ctx_arb[kill]`.
pub const CTX_ARB_KILL: u64 = 0x0e0_0001_0000;

/// Opcode of `word`.
#[must_use]
pub const fn opcode(word: u64) -> u16 {
    ((word >> OPCODE_SHIFT) & 0xfff) as u16
}

// ── Builders ─────────────────────────────────────────────────────────────────

const fn immed(op: u16, dest: u16, bank_a: bool, half: u16) -> u64 {
    let src = (NO_DEST_BASE | (half & 0xff)) as u64;
    let hi = ((half >> 8) as u64) << IMM_HI_SHIFT;
    let dest = dest as u64 & OPERAND_MASK;
    if bank_a {
        opcode_bits(op) | hi | (src << B_SHIFT) | dest
    } else {
        opcode_bits(op) | hi | (dest << B_SHIFT) | src
    }
}

/// `immed_w0[dest, value & 0xffff]`.
///
/// `bank_a` places the destination in the A slot; every other class uses
/// the B slot.
#[must_use]
pub const fn immed_w0(dest: u16, bank_a: bool, value: u32) -> u64 {
    immed(op::IMMED_W0, dest, bank_a, (value & 0xffff) as u16)
}

/// `immed_w1[dest, value >> 16]`.
#[must_use]
pub const fn immed_w1(dest: u16, bank_a: bool, value: u32) -> u64 {
    immed(op::IMMED_W1, dest, bank_a, (value >> 16) as u16)
}

/// Replace the 16-bit immediate of a B-slot `immed_w*` word.
#[must_use]
pub const fn with_immediate(word: u64, half: u16) -> u64 {
    let cleared = word & !((0xff << IMM_HI_SHIFT) | 0xff);
    cleared | (((half >> 8) as u64) << IMM_HI_SHIFT) | (half & 0xff) as u64
}

/// ALU pass-through that latches register `addr` into `ALU_OUT`.
#[must_use]
pub const fn alu_read(addr: u16, bank_a: bool) -> u64 {
    let addr = addr as u64 & OPERAND_MASK;
    if bank_a {
        opcode_bits(op::ALU_READ_A) | addr
    } else {
        opcode_bits(op::ALU_READ_B) | (addr << B_SHIFT)
    }
}

/// `alu[*l$index0++, --, b, src]`.
#[must_use]
pub const fn lm_store(src_b: u16) -> u64 {
    opcode_bits(op::LM_STORE) | (0x66 << IMM_HI_SHIFT) | ((src_b as u64 & OPERAND_MASK) << B_SHIFT)
}

/// `ld_field[*l$index0, byte_mask, src]`.
#[must_use]
pub const fn lm_field(src_b: u16, byte_mask: u8) -> u64 {
    opcode_bits(op::LM_FIELD)
        | (((byte_mask & 0xf) as u64) << IMM_HI_SHIFT)
        | ((src_b as u64 & OPERAND_MASK) << B_SHIFT)
}

// ── Local-memory templates ───────────────────────────────────────────────────
// Scratch value register is relative GPR B0. Slots 0/1 take the value,
// slots 2/3 the byte address, slot 7 performs the store.

/// Scratch register used by the local-memory templates (relative B0).
pub const LM_SCRATCH_B: u16 = 0x000;

const fn lm_template(store: u64) -> [u64; 8] {
    [
        immed_w1(LM_SCRATCH_B, false, 0),
        immed_w0(LM_SCRATCH_B, false, 0),
        immed_w1(LM_INDEX0, false, 0),
        immed_w0(LM_INDEX0, false, 0),
        NOP,
        NOP,
        NOP,
        store,
    ]
}

/// Stores one full word and leaves the index on the next word.
pub const LM_TEMPLATE_4B: [u64; 8] = lm_template(lm_store(LM_SCRATCH_B));
/// Stores byte lane 0.
pub const LM_TEMPLATE_1B: [u64; 8] = lm_template(lm_field(LM_SCRATCH_B, 0x1));
/// Stores byte lanes 0-1.
pub const LM_TEMPLATE_2B: [u64; 8] = lm_template(lm_field(LM_SCRATCH_B, 0x3));
/// Stores byte lanes 0-2.
pub const LM_TEMPLATE_3B: [u64; 8] = lm_template(lm_field(LM_SCRATCH_B, 0x7));

/// Template for a run of `len` bytes, `1..=4`.
#[must_use]
pub fn lm_template_for(len: usize) -> Option<&'static [u64; 8]> {
    match len {
        1 => Some(&LM_TEMPLATE_1B),
        2 => Some(&LM_TEMPLATE_2B),
        3 => Some(&LM_TEMPLATE_3B),
        4 => Some(&LM_TEMPLATE_4B),
        _ => None,
    }
}

/// Instructions needed to write `len` bytes of local memory.
#[must_use]
pub const fn lm_program_len(len: usize) -> usize {
    let words = len / 4;
    let rem = len % 4;
    let mut n = 0;
    if words > 0 {
        n += 8 + (words - 1) * 3;
    }
    if rem > 0 {
        n += 8;
    }
    n
}

/// Append the program writing `bytes` at local-memory byte address `addr`.
///
/// Whole words use the 4-byte template once and three instructions per
/// following word; a trailing partial word gets its own template. No
/// terminating `ctx_arb[kill]` is appended.
pub fn push_lm_program(out: &mut Vec<u64>, addr: u16, bytes: &[u8]) {
    let whole = bytes.len() / 4 * 4;
    for (i, chunk) in bytes[..whole].chunks_exact(4).enumerate() {
        let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if i == 0 {
            let mut t = LM_TEMPLATE_4B;
            t[0] = with_immediate(t[0], (value >> 16) as u16);
            t[1] = with_immediate(t[1], (value & 0xffff) as u16);
            t[2] = with_immediate(t[2], 0);
            t[3] = with_immediate(t[3], addr);
            out.extend_from_slice(&t);
        } else {
            out.push(immed_w1(LM_SCRATCH_B, false, value));
            out.push(immed_w0(LM_SCRATCH_B, false, value));
            out.push(lm_store(LM_SCRATCH_B));
        }
    }

    let rest = &bytes[whole..];
    if let Some(template) = lm_template_for(rest.len()) {
        let mut lanes = [0u8; 4];
        lanes[..rest.len()].copy_from_slice(rest);
        let value = u32::from_le_bytes(lanes);
        #[allow(clippy::cast_possible_truncation)]
        let rest_addr = addr.wrapping_add(whole as u16);
        let mut t = *template;
        t[0] = with_immediate(t[0], (value >> 16) as u16);
        t[1] = with_immediate(t[1], (value & 0xffff) as u16);
        t[2] = with_immediate(t[2], 0);
        t[3] = with_immediate(t[3], rest_addr);
        out.extend_from_slice(&t);
    }
}

/// Program that zeroes every relative GPR of the executing context in
/// 8-context mode, then kills the context.
#[must_use]
pub fn clear_gpr_program() -> Vec<u64> {
    let mut prog = Vec::with_capacity(16 * 4 + 1);
    for rel in 0..16u16 {
        prog.push(immed_w1(rel, true, 0));
        prog.push(immed_w0(rel, true, 0));
        prog.push(immed_w1(rel, false, 0));
        prog.push(immed_w0(rel, false, 0));
    }
    prog.push(CTX_ARB_KILL);
    prog
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Decoded form of a synthesized instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// `immed_w0`: write the low half of `dest`.
    ImmedW0 {
        /// Destination operand address.
        dest: u16,
        /// Destination sits in the A slot.
        bank_a: bool,
        /// Immediate value.
        half: u16,
    },
    /// `immed_w1`: write the high half of `dest`.
    ImmedW1 {
        /// Destination operand address.
        dest: u16,
        /// Destination sits in the A slot.
        bank_a: bool,
        /// Immediate value.
        half: u16,
    },
    /// `nop`.
    Nop,
    /// `ctx_arb[kill]`.
    Kill,
    /// ALU pass-through into `ALU_OUT`.
    AluRead {
        /// Source operand address.
        src: u16,
        /// Source sits in the A slot.
        bank_a: bool,
    },
    /// Word store through LM index 0.
    LmStore {
        /// Source operand (B slot).
        src: u16,
    },
    /// Byte-lane store through LM index 0.
    LmField {
        /// Source operand (B slot).
        src: u16,
        /// Byte lanes written.
        byte_mask: u8,
    },
    /// Anything outside the synthesized subset.
    Other(u16),
}

/// Decode `word`, ignoring ECC.
#[must_use]
pub const fn decode(word: u64) -> Insn {
    let word = word & PAYLOAD_MASK;
    let a = (word & OPERAND_MASK) as u16;
    let b = ((word >> B_SHIFT) & OPERAND_MASK) as u16;
    let hi = ((word >> IMM_HI_SHIFT) & 0xff) as u16;
    match opcode(word) {
        op::IMMED_W0 | op::IMMED_W1 => {
            // The immediate byte always sits in a no-destination operand.
            let b_slot_dest = a & NO_DEST_BASE == NO_DEST_BASE;
            let (dest, src) = if b_slot_dest { (b, a) } else { (a, b) };
            let half = (hi << 8) | (src & 0xff);
            if opcode(word) == op::IMMED_W0 {
                Insn::ImmedW0 { dest, bank_a: !b_slot_dest, half }
            } else {
                Insn::ImmedW1 { dest, bank_a: !b_slot_dest, half }
            }
        }
        op::NOP => Insn::Nop,
        op::CTX_ARB => Insn::Kill,
        op::ALU_READ_A => Insn::AluRead { src: a, bank_a: true },
        op::ALU_READ_B => Insn::AluRead { src: b, bank_a: false },
        op::LM_STORE => Insn::LmStore { src: b },
        op::LM_FIELD => Insn::LmField { src: b, byte_mask: (hi & 0xf) as u8 },
        other => Insn::Other(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixed_words_decode() {
        assert_eq!(decode(NOP), Insn::Nop);
        assert_eq!(decode(CTX_ARB_KILL), Insn::Kill);
        assert_eq!(decode(set_ecc(CTX_ARB_KILL)), Insn::Kill);
        assert_eq!(decode(0), Insn::Other(0));
    }

    #[test]
    fn immediates_decode_in_both_slots() {
        assert_eq!(
            decode(immed_w0(0x85, true, 0x1234_abcd)),
            Insn::ImmedW0 { dest: 0x85, bank_a: true, half: 0xabcd }
        );
        assert_eq!(
            decode(immed_w1(LM_INDEX0, false, 0x1234_abcd)),
            Insn::ImmedW1 { dest: LM_INDEX0, bank_a: false, half: 0x1234 }
        );
        let w = with_immediate(LM_TEMPLATE_4B[3], 0x0ff0);
        assert_eq!(decode(w), Insn::ImmedW0 { dest: LM_INDEX0, bank_a: false, half: 0x0ff0 });
    }

    #[test]
    fn alu_reads_and_stores_decode() {
        assert_eq!(alu_read(0x05, true), 0xa0_7000_0005);
        assert_eq!(alu_read(0x05, false), 0xa0_3000_1400);
        assert_eq!(decode(alu_read(0x182, false)), Insn::AluRead { src: 0x182, bank_a: false });
        assert_eq!(decode(LM_TEMPLATE_4B[7]), Insn::LmStore { src: LM_SCRATCH_B });
        assert_eq!(
            decode(LM_TEMPLATE_3B[7]),
            Insn::LmField { src: LM_SCRATCH_B, byte_mask: 0x7 }
        );
    }

    #[test]
    fn lm_program_length_matches_formula() {
        for len in [0usize, 1, 3, 4, 5, 8, 11, 64] {
            let mut prog = Vec::new();
            push_lm_program(&mut prog, 0, &vec![0xa5; len]);
            assert_eq!(prog.len(), lm_program_len(len), "len {len}");
        }
        assert_eq!(lm_program_len(4), 8);
        assert_eq!(lm_program_len(12), 14);
        assert_eq!(lm_program_len(6), 16);
    }

    #[test]
    fn clear_program_ends_in_kill() {
        let prog = clear_gpr_program();
        assert_eq!(prog.len(), 65);
        assert_eq!(prog.last(), Some(&CTX_ARB_KILL));
    }

    #[test]
    fn packed_words_are_masked() {
        let w = unpack_word([0xff; 6]);
        assert_eq!(w, FILE_WORD_MASK);
    }

    proptest! {
        #[test]
        fn ecc_is_idempotent(word in any::<u64>()) {
            let once = set_ecc(word);
            prop_assert_eq!(set_ecc(once), once);
            prop_assert!(ecc_ok(once));
        }

        #[test]
        fn single_bit_flip_changes_ecc(word in 0u64..=PAYLOAD_MASK, bit in 0u32..44) {
            let good = set_ecc(word);
            let flipped = set_ecc(word ^ (1 << bit));
            prop_assert_ne!(good & ECC_MASK, flipped & ECC_MASK);
        }
    }
}
