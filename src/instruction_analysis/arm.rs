use super::{arm_expand_imm, DisasmData, Step};

/// Decode one A32 instruction of a prologue.
pub(crate) fn decode(qd: &mut DisasmData, insn: u32) -> Step {
    let cond = insn >> 28;
    if cond == 0xf {
        // Unconditional space. Only BLX <imm> is relevant here.
        return if insn & 0xfe00_0000 == 0xfa00_0000 {
            Step::Stop
        } else {
            Step::Continue
        };
    }

    let rd = ((insn >> 12) & 0xf) as u8;

    // stmdb sp!, {reglist} (push)
    if insn & 0x0fff_0000 == 0x092d_0000 {
        qd.push_regs(insn & 0xffff);
        return Step::Continue;
    }

    // str Rt, [sp, #-4]! (single register push)
    if insn & 0x0fff_0fff == 0x052d_0004 {
        qd.push_regs(1 << rd);
        return Step::Continue;
    }

    // vstmdb sp!, {d<first>-d<last>} (vpush), both the FSTMD and FSTMX forms
    if insn & 0x0fbf_0f00 == 0x0d2d_0b00 {
        let first = ((insn >> 18) & 0x10) | u32::from(rd);
        let count = (insn & 0xff) / 2;
        qd.push_vfp(first, count);
        return Step::Continue;
    }

    // sub sp, sp, #imm
    if insn & 0x0fff_f000 == 0x024d_d000 {
        qd.alloc_stack(arm_expand_imm(insn & 0xfff));
        return Step::Continue;
    }

    // add Rd, sp, #imm (add sp, sp, #imm frees stack)
    if insn & 0x0fff_0000 == 0x028d_0000 {
        qd.copy_sp(rd, arm_expand_imm(insn & 0xfff));
        return Step::Continue;
    }

    // mov Rd, sp
    if insn & 0x0fff_0fff == 0x01a0_000d {
        qd.copy_sp(rd, 0);
        return Step::Continue;
    }

    if is_block_end(insn) {
        return Step::Stop;
    }

    Step::Continue
}

fn is_block_end(insn: u32) -> bool {
    // b, bl
    insn & 0x0e00_0000 == 0x0a00_0000
        // bx Rm, blx Rm
        || insn & 0x0fff_ffd0 == 0x012f_ff10
        // ldmia sp!, {reglist} (pop)
        || insn & 0x0fff_0000 == 0x08bd_0000
        // ldr Rt, [sp], #4 (single register pop)
        || insn & 0x0fff_0fff == 0x049d_0004
        // mov pc, Rm
        || insn & 0x0fff_fff0 == 0x01a0_f000
}

#[cfg(test)]
mod test {
    use super::*;

    fn run(insns: &[u32]) -> DisasmData {
        let mut qd = DisasmData::new(0x10000, 0x10000 + insns.len() as u64 * 4, false);
        for insn in insns {
            if decode(&mut qd, *insn) == Step::Stop {
                break;
            }
        }
        qd
    }

    #[test]
    fn push_and_sub() {
        // push {r4, r5, r6, lr}; sub sp, sp, #16
        let qd = run(&[0xe92d4070, 0xe24dd010]);
        assert_eq!(qd.r_regset, 0x4070);
        assert_eq!(qd.stacksize, 16);
        assert_eq!(qd.stackreg, 13);
    }

    #[test]
    fn frame_register_setup() {
        // push {r11, lr}; add r11, sp, #4; sub sp, sp, #0x200
        let qd = run(&[0xe92d4800, 0xe28db004, 0xe24ddc02]);
        assert_eq!(qd.r_regset, 0x4800);
        assert_eq!(qd.stackreg, 11);
        assert_eq!(qd.stackoff, 4);
        assert_eq!(qd.stacksize, 0x200);
    }

    #[test]
    fn single_push_and_vpush() {
        // str lr, [sp, #-4]!; vpush {d8-d9}
        let qd = run(&[0xe52de004, 0xed2d8b04]);
        assert_eq!(qd.r_regset, 1 << 14);
        assert_eq!(qd.d_regset, 0x300);
    }

    #[test]
    fn stops_at_branch() {
        // push {r4, lr}; bl <x>; sub sp, sp, #8
        let qd = run(&[0xe92d4010, 0xeb000010, 0xe24dd008]);
        assert_eq!(qd.r_regset, 0x4010);
        assert_eq!(qd.stacksize, 0);

        // pop {r4, pc}; push {r5}
        let qd = run(&[0xe8bd8010, 0xe92d0020]);
        assert_eq!(qd.r_regset, 0);
    }

    #[test]
    fn unrelated_instructions_are_skipped() {
        // mov r0, r1; push {r4, lr}
        let qd = run(&[0xe1a00001, 0xe92d4010]);
        assert_eq!(qd.r_regset, 0x4010);
    }
}
