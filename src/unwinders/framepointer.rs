use std::ops::Deref;

use crate::callchain::{Callchain, ResumeState, UnwindType};
use crate::error::{ResultCode, UnwindError};
use crate::memory::{is_vma_addr, read_user_word, validate_stack_addr, AddressSpace, Vma};
use crate::unwinder::UnwindCtx;
use crate::unwindregs::Mode;

use super::{dwarf, ehabi};

// Frame pointer stack walk.
//
// aarch64 functions that keep a frame record store the caller's fp and lr as
// a pair, and point fp at the pair:
//
//     stp  x29, x30, [sp, #-0x10]!
//     mov  x29, sp
//
//   [... locals]  [caller's frame pointer]  [return address]  [... rest of the stack]
//   ^ sp          ^ fp
//
// So: *fp is the caller's frame pointer, and *(fp + 8) is the return address.
//
// 32-bit code comes in two shapes. Clang, and GCC for Thumb, build the same
// pair with r7 or r11:
//
//     push {r7, lr}
//     add  r7, sp, #0
//
//   [... locals]  [caller's frame pointer]  [return address]  [... rest of the stack]
//                 ^ fp
//
// GCC for ARM pushes a larger block and points fp at the saved lr:
//
//     push {fp, lr}
//     add  fp, sp, #4
//
//   [... locals]  [caller's frame pointer]  [return address]  [... rest of the stack]
//                                           ^ fp
//
// The two are told apart by the word at fp: a caller's frame pointer is an
// address on the stack, a return address is not.

/// Check the frame at `fp` in ARM code for a function which only saved the
/// caller's fp. Returns the caller's fp if so; the return address is then
/// still in lr.
fn short_frame<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    pc: u64,
    vma_sp: &Vma,
    fp: u64,
) -> Result<Option<u64>, UnwindError> {
    let value = read_user_word(ctx.mm, fp, 4)?;
    if value <= fp || !is_vma_addr(value, vma_sp, 4) {
        return Ok(None);
    }

    let Some(vma_pc) = ctx.mm.find_vma(pc) else {
        return Ok(None);
    };
    let next = read_user_word(ctx.mm, fp + 4, 4)?;
    if is_vma_addr(next, &vma_pc, 4) {
        return Ok(None);
    }
    Ok(Some(value))
}

/// Unwind the frame whose record is at `tail`. Returns the next record, or
/// `None` if the walk should stop without an error.
fn unwind_frame<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    cc: &mut Callchain,
    vma_sp: &Vma,
    tail: u64,
) -> Result<Option<u64>, UnwindError> {
    let mm = ctx.mm;
    let mode = ctx.regs.mode();
    let size = mode.reg_size();

    if tail & (size - 1) != 0 || !is_vma_addr(tail, vma_sp, size) {
        return Err(UnwindError::FpIncorrect(tail));
    }

    let value = read_user_word(mm, tail, size)?;
    let (fp_prev, lr, sp) = match mode {
        Mode::Arm64 => (value, read_user_word(mm, tail + 8, 8)?, tail + 16),
        Mode::Arm32 if is_vma_addr(value, vma_sp, 4) => {
            if !is_vma_addr(tail + 4, vma_sp, 4) {
                return Err(UnwindError::FpIncorrect(tail));
            }
            (value, read_user_word(mm, tail + 4, 4)?, tail + 8)
        }
        Mode::Arm32 => {
            let fp_prev = read_user_word(mm, tail.wrapping_sub(4), 4)?;
            (fp_prev, value, tail + 4)
        }
    };

    if lr < ctx.config.low_addr {
        return Err(UnwindError::PcIncorrect(lr));
    }

    tracing::debug!("fp: frame at {:#x}, return address {:#x}", tail, lr);

    cc.curr = ResumeState {
        sp,
        fp: fp_prev,
        fp_thumb: if mode == Mode::Arm32 { fp_prev } else { 0 },
        pc: lr,
        lr: 0,
    };
    if !cc.store(lr, UnwindType::Fp) {
        return Ok(None);
    }

    // Hand over to the tables if they know the caller.
    let methods = ctx.methods;
    let covered = (methods.ut
        && mode == Mode::Arm32
        && ehabi::is_ex_entry_exist(ctx.registry, mm, lr))
        || (methods.dwarf && dwarf::is_ex_entry_exist(ctx.registry, mm, mode, lr));
    if covered {
        tracing::debug!("fp: {:#x} is covered by an unwind table", lr);
        cc.urc_fp = ResultCode::Success;
        return Ok(None);
    }

    if fp_prev <= tail || !is_vma_addr(fp_prev, vma_sp, size) {
        return Err(UnwindError::FpIncorrect(fp_prev));
    }
    Ok(Some(fp_prev))
}

/// Extend the call chain by walking frame records, starting at the sampled
/// registers or where the chain currently ends. Returns the chain length.
pub(crate) fn get_user_cc_fp<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    cc: &mut Callchain,
) -> usize {
    if cc.urc_fp == ResultCode::LevelTooDeep {
        return cc.nr();
    }
    cc.urc_fp = ResultCode::Failure;

    let regs = ctx.regs;
    let mode = regs.mode();
    let resumed = cc.nr() > 0;
    let (pc, sp, fp, thumb) = if resumed {
        let curr = cc.curr;
        let thumb = mode == Mode::Arm32 && curr.pc & 1 != 0;
        let fp = if thumb { curr.fp_thumb } else { curr.fp };
        (curr.pc, curr.sp, fp, thumb)
    } else {
        (regs.pc(), regs.sp(), regs.frame_pointer(), regs.is_thumb())
    };

    let Some(vma_sp) = ctx.mm.find_vma(sp) else {
        cc.urc_fp = ResultCode::SpIncorrect;
        return cc.nr();
    };

    if fp == 0 || fp < sp || !validate_stack_addr(fp, &vma_sp, mode.reg_size()) {
        cc.urc_fp = ResultCode::FpIncorrect;
        return cc.nr();
    }

    let mut tail = fp;
    if mode == Mode::Arm32 && !resumed && !thumb {
        match short_frame(ctx, pc, &vma_sp, fp) {
            Ok(Some(next)) => {
                tracing::debug!("fp: short frame at {:#x}, lr {:#x}", fp, regs.lr());
                if !cc.store(regs.lr(), UnwindType::LrFp) {
                    return cc.nr();
                }
                tail = next;
            }
            Ok(None) => {}
            Err(e) => {
                cc.urc_fp = e.code();
                return cc.nr();
            }
        }
    }

    loop {
        match unwind_frame(ctx, cc, &vma_sp, tail) {
            Ok(Some(next)) => tail = next,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("fp: stopped at {:#x}: {}", tail, e);
                cc.urc_fp = e.code();
                break;
            }
        }
    }
    cc.nr()
}
