//! Prologue disassembly, used to double-check what the exception table
//! claims a function saved on the stack.
//!
//! The disassembler walks forward from the function start and records which
//! registers the prologue pushed and how far it moved sp. The exception table
//! unwinder then "consumes" these records as its opcodes pop registers and
//! move the virtual sp. If the table and the code agree, nothing is left over.

mod arm;
mod thumb;

use std::fmt::Debug;

use crate::display_utils::{BinNum, HexNum};
use crate::error::UnwindError;
use crate::memory::{read_user_u16, read_user_u32, AddressSpace};

pub(crate) const SP: u8 = 13;

/// What the prologue of a function did to the stack.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DisasmData {
    pub min: u64,
    pub max: u64,
    pub thumb: bool,
    /// Core registers pushed, and not yet popped by the unwind program.
    pub r_regset: u32,
    /// VFP double registers pushed, and not yet popped by the unwind program.
    pub d_regset: u32,
    /// Bytes allocated by sp adjustments, minus what the unwind program freed.
    pub stacksize: i64,
    /// The register which holds a copy of sp, as set up by the prologue.
    pub stackreg: u8,
    /// The offset of `stackreg` from sp after the register pushes.
    pub stackoff: i64,
    /// The register the unwind program restored sp from.
    pub ustackreg: u8,
}

/// Whether the scan should go on after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    /// A branch, call or return. Later instructions belong to other code paths.
    Stop,
}

impl DisasmData {
    pub fn new(min: u64, max: u64, thumb: bool) -> Self {
        Self {
            min,
            max,
            thumb,
            r_regset: 0,
            d_regset: 0,
            stacksize: 0,
            stackreg: SP,
            stackoff: 0,
            ustackreg: SP,
        }
    }

    pub(crate) fn push_regs(&mut self, mask: u32) {
        self.r_regset |= mask;
    }

    pub(crate) fn push_vfp(&mut self, first: u32, count: u32) {
        self.d_regset |= vfp_mask(first, count);
    }

    pub(crate) fn alloc_stack(&mut self, bytes: u32) {
        self.stacksize += i64::from(bytes);
    }

    pub(crate) fn free_stack(&mut self, bytes: u32) {
        self.stacksize -= i64::from(bytes);
    }

    /// `Rd = sp + offset`.
    pub(crate) fn copy_sp(&mut self, rd: u8, offset: u32) {
        if rd == SP {
            self.free_stack(offset);
        } else {
            self.stackreg = rd;
            self.stackoff = i64::from(offset);
        }
    }

    /// The unwind program popped `reg` off the stack.
    pub(crate) fn pop_reg(&mut self, reg: u32) {
        self.r_regset &= !(1 << reg);
    }

    pub(crate) fn pop_vfp(&mut self, first: u32, count: u32) {
        self.d_regset &= !vfp_mask(first, count);
    }

    /// The unwind program moved vsp up by `bytes` without popping registers.
    pub(crate) fn unwind_vsp_up(&mut self, bytes: u32) {
        self.stacksize -= i64::from(bytes);
    }

    /// The unwind program moved vsp down by `bytes`.
    pub(crate) fn unwind_vsp_down(&mut self, bytes: u32) {
        self.stackoff -= i64::from(bytes);
    }

    /// The unwind program set vsp from a register.
    pub(crate) fn unwind_vsp_from(&mut self, reg: u8) {
        self.ustackreg = reg;
    }
}

impl Debug for DisasmData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisasmData")
            .field("min", &HexNum(self.min))
            .field("max", &HexNum(self.max))
            .field("thumb", &self.thumb)
            .field("r_regset", &BinNum(self.r_regset))
            .field("d_regset", &BinNum(self.d_regset))
            .field("stacksize", &self.stacksize)
            .field("stackreg", &self.stackreg)
            .field("stackoff", &self.stackoff)
            .field("ustackreg", &self.ustackreg)
            .finish()
    }
}

fn vfp_mask(first: u32, count: u32) -> u32 {
    (first..first.saturating_add(count))
        .filter(|r| *r < 32)
        .fold(0, |mask, r| mask | (1 << r))
}

/// Disassemble `[min, max)` as ARM or Thumb code, up to the first branch or
/// return.
pub fn disassemble<M: AddressSpace + ?Sized>(
    mm: &M,
    min: u64,
    max: u64,
    thumb: bool,
) -> Result<DisasmData, UnwindError> {
    let mut qd = DisasmData::new(min, max, thumb);

    if thumb {
        let mut addr = min & !1;
        while addr + 2 <= max {
            let hw1 = read_user_u16(mm, addr)?;
            let step = if thumb::is_32bit(hw1) {
                if addr + 4 > max {
                    break;
                }
                let hw2 = read_user_u16(mm, addr + 2)?;
                addr += 4;
                thumb::decode_32(&mut qd, hw1, hw2)
            } else {
                addr += 2;
                thumb::decode_16(&mut qd, hw1)
            };
            if step == Step::Stop {
                break;
            }
        }
    } else {
        let mut addr = min & !3;
        while addr + 4 <= max {
            let insn = read_user_u32(mm, addr)?;
            addr += 4;
            if arm::decode(&mut qd, insn) == Step::Stop {
                break;
            }
        }
    }

    tracing::trace!("disassembled prologue: {:?}", qd);
    Ok(qd)
}

/// Check that the unwind program undid exactly what the prologue did.
pub fn check_unwind_result(pc: u64, qd: &DisasmData) -> Result<(), UnwindError> {
    let sp_restored = if qd.stackreg == SP {
        qd.ustackreg == SP && qd.stacksize == 0
    } else {
        // sp comes back from the frame register; local allocations made after
        // it was set up do not need to be undone one by one.
        qd.ustackreg == qd.stackreg && qd.stackoff == 0
    };

    if qd.r_regset != 0 || qd.d_regset != 0 || !sp_restored {
        tracing::debug!("unwind mismatch at {:#x}: {:?}", pc, qd);
        return Err(UnwindError::UnwindMismatch);
    }
    Ok(())
}

/// ARMExpandImm: an 8-bit value rotated right by twice the 4-bit rotation.
pub(crate) fn arm_expand_imm(imm12: u32) -> u32 {
    let rot = (imm12 >> 8) * 2;
    (imm12 & 0xff).rotate_right(rot)
}

/// ThumbExpandImm for the 12-bit `i:imm3:imm8` field.
pub(crate) fn thumb_expand_imm(imm12: u32) -> u32 {
    let imm8 = imm12 & 0xff;
    if imm12 >> 10 == 0 {
        match (imm12 >> 8) & 0x3 {
            0 => imm8,
            1 => (imm8 << 16) | imm8,
            2 => (imm8 << 24) | (imm8 << 8),
            _ => imm8 * 0x0101_0101,
        }
    } else {
        let unrotated = 0x80 | (imm12 & 0x7f);
        unrotated.rotate_right(imm12 >> 7)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modified_immediates() {
        assert_eq!(arm_expand_imm(0x010), 0x10);
        assert_eq!(arm_expand_imm(0xf01), 0x4);
        assert_eq!(arm_expand_imm(0x102), 0x8000_0000);
        assert_eq!(thumb_expand_imm(0x020), 0x20);
        assert_eq!(thumb_expand_imm(0x1ab), 0x00ab_00ab);
        assert_eq!(thumb_expand_imm(0x3ab), 0xabab_abab);
        // i:imm3 = 0b1000, a = 0 -> 0x80 ror 16
        assert_eq!(thumb_expand_imm(0x800), 0x0080_0000);
    }

    #[test]
    fn balanced_result_passes() {
        let mut qd = DisasmData::new(0x10000, 0x10010, false);
        qd.push_regs(0x4070);
        qd.alloc_stack(16);
        qd.unwind_vsp_up(16);
        for reg in [4, 5, 6, 14] {
            qd.pop_reg(reg);
        }
        assert_eq!(check_unwind_result(0x10008, &qd), Ok(()));
    }

    #[test]
    fn leftover_register_fails() {
        let mut qd = DisasmData::new(0x10000, 0x10010, false);
        qd.push_regs(0x4010);
        qd.pop_reg(14);
        assert_eq!(
            check_unwind_result(0x10008, &qd),
            Err(UnwindError::UnwindMismatch)
        );
    }

    #[test]
    fn frame_register_must_match() {
        let mut qd = DisasmData::new(0x10000, 0x10010, true);
        qd.push_regs(0x4080);
        qd.copy_sp(7, 0);
        qd.alloc_stack(8);
        qd.pop_reg(7);
        qd.pop_reg(14);
        assert!(check_unwind_result(0x10008, &qd).is_err());
        qd.unwind_vsp_from(7);
        assert_eq!(check_unwind_result(0x10008, &qd), Ok(()));
    }
}
