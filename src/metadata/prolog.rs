//! AArch64 prologue decoding.
//!
//! Only the handful of instructions JIT prologues use to build a frame are
//! recognised: `sub sp, sp, #imm`, 64-bit `stp` pairs addressed off `sp` and
//! `add x29, sp, #imm` (`mov x29, sp` included) establishing the frame pointer.

/// Upper bound on instructions examined per prologue
pub const MAX_PROLOG_INSTRUCTIONS: usize = 32;

const WORD: i32 = 8;
const SP: u32 = 31;
const FP: u32 = 29;
const LR: u32 = 30;

/// A decoded `stp rt, rt2, [rn, #offset]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePair {
    pub rt: u32,
    pub rt2: u32,
    pub rn: u32,
    pub offset: i32,
}

/// Frame layout recovered from a prologue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrologSummary {
    pub frame_size: u32,
    pub saved_fp_offset: Option<i32>,
    pub saved_lr_offset: Option<i32>,
    /// Bit `n` set when `x(19 + n)` is saved
    pub callee_saved_mask: u32,
    /// `(register, offset from sp)` for every other saved register
    pub saved_registers: Vec<(u8, i32)>,
}

/// Signed 7-bit immediate in bits 21..15, scaled by 8.
#[inline]
fn signed_offset_scale8(instruction: u32) -> i32 {
    (((instruction as i32) << 10) >> 25) * WORD
}

/// `sub sp, sp, #imm{, lsl #12}` on 64-bit registers.
pub fn decode_sub_sp(instruction: u32) -> Option<u32> {
    if (instruction >> 24) & 0x1f != 0x11 {
        return None;
    }

    let sf = (instruction >> 31) & 1;
    let op = (instruction >> 30) & 1;
    let set_flags = (instruction >> 29) & 1;
    let rn = (instruction >> 5) & 0x1f;
    let rd = instruction & 0x1f;
    if sf != 1 || op != 1 || set_flags != 0 || rn != SP || rd != SP {
        return None;
    }

    let shift = (instruction >> 22) & 0x3;
    if shift > 1 {
        return None;
    }

    let imm12 = (instruction >> 10) & 0xfff;
    let amount = if shift == 0 { imm12 } else { imm12 << 12 };
    (amount != 0).then_some(amount)
}

/// `add x29, sp, #imm{, lsl #12}`. `mov x29, sp` decodes as zero.
pub fn decode_set_fp(instruction: u32) -> Option<u32> {
    if (instruction >> 24) & 0x1f != 0x11 {
        return None;
    }

    let sf = (instruction >> 31) & 1;
    let op = (instruction >> 30) & 1;
    let set_flags = (instruction >> 29) & 1;
    let rn = (instruction >> 5) & 0x1f;
    let rd = instruction & 0x1f;
    if sf != 1 || op != 0 || set_flags != 0 || rn != SP || rd != FP {
        return None;
    }

    let shift = (instruction >> 22) & 0x3;
    if shift > 1 {
        return None;
    }

    let imm12 = (instruction >> 10) & 0xfff;
    Some(if shift == 0 { imm12 } else { imm12 << 12 })
}

/// 64-bit store pair, any addressing mode.
pub fn decode_store_pair(instruction: u32) -> Option<StorePair> {
    if (instruction >> 30) & 0x3 != 0x2 || (instruction >> 27) & 0x7 != 0x5 {
        return None;
    }
    // Load variants set bit 22
    if instruction & (1 << 22) != 0 {
        return None;
    }

    Some(StorePair {
        rt: instruction & 0x1f,
        rt2: (instruction >> 10) & 0x1f,
        rn: (instruction >> 5) & 0x1f,
        offset: signed_offset_scale8(instruction),
    })
}

/// Walk the prologue instructions in `code` and summarise the frame they build.
pub fn analyze(code: &[u8]) -> PrologSummary {
    let mut summary = PrologSummary::default();
    let mut frame_captured = false;
    let mut sub_amount = 0u32;
    // Distance from sp to fp, once fp is set after an sp-relative frame record
    let mut fp_above_sp = None;

    let instructions = code
        .chunks_exact(4)
        .take(MAX_PROLOG_INSTRUCTIONS)
        .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));

    for instruction in instructions {
        if let Some(amount) = decode_set_fp(instruction) {
            if fp_above_sp.is_none() && summary.saved_fp_offset.is_some_and(|o| o != 0) {
                fp_above_sp = Some(amount as i32);
            }
            continue;
        }

        if let Some(amount) = decode_sub_sp(instruction) {
            sub_amount = sub_amount.max(amount);
            summary.frame_size = summary.frame_size.max(amount);
            continue;
        }

        let Some(pair) = decode_store_pair(instruction) else {
            continue;
        };
        if pair.rn != SP {
            continue;
        }

        if !frame_captured && pair.rt == FP && pair.rt2 == LR {
            if pair.offset < 0 {
                // Pre-indexed push: fp ends up pointing at the pair
                summary.frame_size = summary.frame_size.max(pair.offset.unsigned_abs());
                summary.saved_fp_offset = Some(0);
                summary.saved_lr_offset = Some(WORD);
            } else {
                if summary.frame_size == 0 {
                    summary.frame_size = sub_amount;
                }
                summary.frame_size = summary.frame_size.max((pair.offset + 2 * WORD) as u32);
                summary.saved_fp_offset = Some(pair.offset);
                summary.saved_lr_offset = Some(pair.offset + WORD);
            }
            frame_captured = true;
            continue;
        }

        if pair.offset >= 0 {
            record_register(&mut summary, pair.rt, pair.offset);
            record_register(&mut summary, pair.rt2, pair.offset + WORD);
            summary.frame_size = summary.frame_size.max((pair.offset + 2 * WORD) as u32);
        } else {
            summary.frame_size = summary.frame_size.max(pair.offset.unsigned_abs());
        }
    }

    // The walker reads the frame record relative to fp, not sp
    if let Some(delta) = fp_above_sp {
        summary.saved_fp_offset = summary.saved_fp_offset.map(|o| o - delta);
        summary.saved_lr_offset = summary.saved_lr_offset.map(|o| o - delta);
    }

    if summary.frame_size == 0 {
        summary.frame_size = sub_amount;
    }
    summary.frame_size = summary.frame_size.next_multiple_of(16);
    summary
}

fn record_register(summary: &mut PrologSummary, reg: u32, offset: i32) {
    if summary.saved_registers.len() >= super::MAX_SAVED_REGISTERS {
        return;
    }
    summary.saved_registers.push((reg as u8, offset));
    if (19..=28).contains(&reg) {
        summary.callee_saved_mask |= 1 << (reg - 19);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STP_FP_LR_PRE: u32 = 0xa9bf7bfd; // stp x29, x30, [sp, #-16]!
    const MOV_FP_SP: u32 = 0x910003fd; // mov x29, sp
    const SUB_SP_32: u32 = 0xd10083ff; // sub sp, sp, #0x20
    const STP_X19_X20: u32 = 0xa90153f3; // stp x19, x20, [sp, #16]

    fn encode(instructions: &[u32]) -> Vec<u8> {
        instructions.iter().flat_map(|i| i.to_le_bytes()).collect()
    }

    #[test]
    fn test_decode_sub_sp() {
        assert_eq!(decode_sub_sp(SUB_SP_32), Some(32));
        assert_eq!(decode_sub_sp(MOV_FP_SP), None);
        assert_eq!(decode_sub_sp(STP_FP_LR_PRE), None);
    }

    #[test]
    fn test_decode_store_pair() {
        let pair = decode_store_pair(STP_FP_LR_PRE).unwrap();
        assert_eq!(pair, StorePair { rt: 29, rt2: 30, rn: 31, offset: -16 });

        let pair = decode_store_pair(STP_X19_X20).unwrap();
        assert_eq!((pair.rt, pair.rt2, pair.offset), (19, 20, 16));

        // ldp x29, x30, [sp], #16
        assert_eq!(decode_store_pair(0xa8c17bfd), None);
    }

    #[test]
    fn test_analyze_standard_prologue() {
        let code = encode(&[STP_FP_LR_PRE, MOV_FP_SP, SUB_SP_32, STP_X19_X20]);
        let summary = analyze(&code);

        assert_eq!(summary.saved_fp_offset, Some(0));
        assert_eq!(summary.saved_lr_offset, Some(8));
        assert_eq!(summary.frame_size, 32);
        assert_eq!(summary.callee_saved_mask, 0b11);
        assert_eq!(summary.saved_registers, vec![(19, 16), (20, 24)]);
    }

    #[test]
    fn test_frame_record_rebased_onto_fp() {
        // sub sp, sp, #0x30; stp x29, x30, [sp, #32]; add x29, sp, #32
        let summary = analyze(&encode(&[0xd100c3ff, 0xa9027bfd, 0x910083fd]));
        assert_eq!(decode_set_fp(0x910083fd), Some(32));
        assert_eq!(decode_set_fp(MOV_FP_SP), Some(0));
        assert_eq!(summary.saved_fp_offset, Some(0));
        assert_eq!(summary.saved_lr_offset, Some(8));
        assert_eq!(summary.frame_size, 48);
    }

    #[test]
    fn test_analyze_without_frame_record() {
        let summary = analyze(&encode(&[SUB_SP_32]));
        assert_eq!(summary.saved_fp_offset, None);
        assert_eq!(summary.frame_size, 32);
    }

    #[test]
    fn test_frame_size_rounded_to_16() {
        // sub sp, sp, #0x18
        let summary = analyze(&encode(&[0xd10063ff]));
        assert_eq!(summary.frame_size, 32);
    }

    #[test]
    fn test_analyze_ignores_trailing_bytes() {
        let mut code = encode(&[STP_FP_LR_PRE]);
        code.extend_from_slice(&[0xff, 0xff]);
        assert_eq!(analyze(&code).saved_lr_offset, Some(8));
        assert_eq!(analyze(&[]), PrologSummary::default());
    }
}
