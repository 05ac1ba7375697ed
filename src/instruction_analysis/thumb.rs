use super::{thumb_expand_imm, DisasmData, Step};

/// Whether `hw1` is the first halfword of a 32-bit Thumb-2 instruction.
#[inline]
pub(crate) fn is_32bit(hw1: u16) -> bool {
    hw1 & 0xe000 == 0xe000 && hw1 & 0x1800 != 0
}

/// Decode one 16-bit Thumb instruction.
pub(crate) fn decode_16(qd: &mut DisasmData, hw: u16) -> Step {
    let hw = u32::from(hw);

    // push {reglist[, lr]}
    if hw & 0xfe00 == 0xb400 {
        qd.push_regs((hw & 0xff) | ((hw & 0x100) << 6));
        return Step::Continue;
    }

    // sub sp, #imm7*4
    if hw & 0xff80 == 0xb080 {
        qd.alloc_stack((hw & 0x7f) << 2);
        return Step::Continue;
    }

    // add sp, #imm7*4
    if hw & 0xff80 == 0xb000 {
        qd.free_stack((hw & 0x7f) << 2);
        return Step::Continue;
    }

    // add Rd, sp, #imm8*4
    if hw & 0xf800 == 0xa800 {
        qd.copy_sp(((hw >> 8) & 0x7) as u8, (hw & 0xff) << 2);
        return Step::Continue;
    }

    // mov Rd, sp
    if hw & 0xff78 == 0x4668 {
        let rd = ((hw >> 4) & 0x8) | (hw & 0x7);
        qd.copy_sp(rd as u8, 0);
        return Step::Continue;
    }

    // pop {reglist[, pc]}
    if hw & 0xfe00 == 0xbc00 {
        return Step::Stop;
    }
    // b<cond>, b
    if hw & 0xf000 == 0xd000 || hw & 0xf800 == 0xe000 {
        return Step::Stop;
    }
    // bx Rm, blx Rm
    if hw & 0xff00 == 0x4700 {
        return Step::Stop;
    }

    Step::Continue
}

/// Decode one 32-bit Thumb-2 instruction.
pub(crate) fn decode_32(qd: &mut DisasmData, hw1: u16, hw2: u16) -> Step {
    let (hw1, hw2) = (u32::from(hw1), u32::from(hw2));

    // stmdb sp!, {reglist} (push.w)
    if hw1 == 0xe92d {
        qd.push_regs(hw2 & 0x5fff);
        return Step::Continue;
    }

    // str.w Rt, [sp, #-4]!
    if hw1 == 0xf84d && hw2 & 0x0fff == 0x0d04 {
        qd.push_regs(1 << (hw2 >> 12));
        return Step::Continue;
    }

    // vpush {d<first>-d<last>}
    if hw1 & 0xffbf == 0xed2d && hw2 & 0x0f00 == 0x0b00 {
        let first = ((hw1 >> 2) & 0x10) | ((hw2 >> 12) & 0xf);
        qd.push_vfp(first, (hw2 & 0xff) / 2);
        return Step::Continue;
    }

    // The i:imm3:imm8 immediate of the data processing forms.
    let imm12 = ((hw1 & 0x0400) << 1) | ((hw2 >> 4) & 0x0700) | (hw2 & 0xff);
    let rd = ((hw2 >> 8) & 0xf) as u8;

    // sub.w sp, sp, #imm
    if hw1 & 0xfbff == 0xf1ad && hw2 & 0x8f00 == 0x0d00 {
        qd.alloc_stack(thumb_expand_imm(imm12));
        return Step::Continue;
    }

    // subw sp, sp, #imm12
    if hw1 & 0xfbff == 0xf2ad && hw2 & 0x8f00 == 0x0d00 {
        qd.alloc_stack(imm12);
        return Step::Continue;
    }

    // add.w Rd, sp, #imm
    if hw1 & 0xfbef == 0xf10d && hw2 & 0x8000 == 0 {
        qd.copy_sp(rd, thumb_expand_imm(imm12));
        return Step::Continue;
    }

    // addw Rd, sp, #imm12
    if hw1 & 0xfbff == 0xf20d && hw2 & 0x8000 == 0 {
        qd.copy_sp(rd, imm12);
        return Step::Continue;
    }

    // mov.w Rd, sp
    if hw1 & 0xffef == 0xea4f && hw2 & 0xf0ff == 0x000d {
        qd.copy_sp(rd, 0);
        return Step::Continue;
    }

    // ldmia sp!, {reglist} (pop.w), ldr.w Rt, [sp], #4
    if hw1 == 0xe8bd || (hw1 == 0xf85d && hw2 & 0x0fff == 0x0b04) {
        return Step::Stop;
    }

    // b.w, bl, blx and the other branch and misc control forms
    if hw1 & 0xf800 == 0xf000 && hw2 & 0x8000 == 0x8000 {
        return Step::Stop;
    }

    Step::Continue
}

#[cfg(test)]
mod test {
    use super::*;

    enum Insn {
        T16(u16),
        T32(u16, u16),
    }

    fn run(insns: &[Insn]) -> DisasmData {
        let mut qd = DisasmData::new(0x10001, 0x10100, true);
        for insn in insns {
            let step = match insn {
                Insn::T16(hw) => decode_16(&mut qd, *hw),
                Insn::T32(hw1, hw2) => {
                    assert!(is_32bit(*hw1));
                    decode_32(&mut qd, *hw1, *hw2)
                }
            };
            if step == Step::Stop {
                break;
            }
        }
        qd
    }

    #[test]
    fn narrow_prologue() {
        // push {r4-r7, lr}; add r7, sp, #12; sub sp, #16
        let qd = run(&[Insn::T16(0xb5f0), Insn::T16(0xaf03), Insn::T16(0xb084)]);
        assert_eq!(qd.r_regset, 0x40f0);
        assert_eq!(qd.stackreg, 7);
        assert_eq!(qd.stackoff, 12);
        assert_eq!(qd.stacksize, 16);
    }

    #[test]
    fn wide_prologue() {
        // push.w {r4-r11, lr}; vpush {d8}; sub.w sp, sp, #0x100
        let qd = run(&[
            Insn::T32(0xe92d, 0x4ff0),
            Insn::T32(0xed2d, 0x8b02),
            Insn::T32(0xf5ad, 0x7d80),
        ]);
        assert_eq!(qd.r_regset, 0x4ff0);
        assert_eq!(qd.d_regset, 0x100);
        assert_eq!(qd.stacksize, 0x100);
    }

    #[test]
    fn subw_and_mov() {
        // subw sp, sp, #0x404; mov r7, sp
        let qd = run(&[Insn::T32(0xf2ad, 0x4d04), Insn::T16(0x466f)]);
        assert_eq!(qd.stacksize, 0x404);
        assert_eq!(qd.stackreg, 7);
        assert_eq!(qd.stackoff, 0);
    }

    #[test]
    fn stops_at_call() {
        // push {r4, lr}; bl <x>; sub sp, #8
        let qd = run(&[
            Insn::T16(0xb510),
            Insn::T32(0xf000, 0xf810),
            Insn::T16(0xb082),
        ]);
        assert_eq!(qd.r_regset, 0x4010);
        assert_eq!(qd.stacksize, 0);
    }

    #[test]
    fn width_detection() {
        assert!(!is_32bit(0xb5f0));
        assert!(!is_32bit(0xe7fe));
        assert!(is_32bit(0xe92d));
        assert!(is_32bit(0xf000));
    }
}
