//! The ARM exception table unwinder, for AArch32 tasks.
//!
//! `.ARM.exidx` maps function starts to unwind programs, either inline in the
//! index or in `.ARM.extab`. Only the compact personality routines 0 and 1 are
//! understood.

mod index;
mod opcodes;

use std::ops::Deref;

use fallible_iterator::FallibleIterator;

use crate::callchain::{Callchain, ResumeState, UnwindType};
use crate::error::{ResultCode, UnwindError};
use crate::instruction_analysis::{check_unwind_result, disassemble, DisasmData};
use crate::memory::{is_vma_addr, validate_pc_addr, validate_stack_addr, AddressSpace, Vma};
use crate::registry::{RegionRef, Registry, SectionKind};
use crate::unwinder::UnwindCtx;

use index::{find_idx, prel31_to_addr, EXIDX_CANTUNWIND};
use opcodes::{exec_insn, Opcodes, FP_ARM, FP_THUMB, LR, PC, SP};

/// The registers which the unwind programs of the compact models restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Frame {
    fp_thumb: u32,
    fp_arm: u32,
    sp: u32,
    lr: u32,
    pc: u32,
}

impl Frame {
    fn resume_state(&self) -> ResumeState {
        ResumeState {
            sp: self.sp.into(),
            fp: self.fp_arm.into(),
            fp_thumb: self.fp_thumb.into(),
            pc: self.pc.into(),
            lr: self.lr.into(),
        }
    }
}

/// Find the unwind program of the function containing `pc`, and the start of
/// that function.
fn find_program<'r, D: Deref<Target = [u8]>>(
    region: &'r RegionRef<D>,
    pc: u64,
) -> Result<(Opcodes<'r>, u64), UnwindError> {
    let exidx = region.require_section(SectionKind::Exidx)?;
    let idx = find_idx(&exidx, pc)?.ok_or(UnwindError::IdxNotFound(pc))?;
    tracing::trace!("ehabi: index entry {:#x} for pc {:#x}", idx.addr, pc);

    if idx.insn == EXIDX_CANTUNWIND {
        return Err(UnwindError::CantUnwind);
    }

    let (section, addr) = if idx.insn & 0x8000_0000 == 0 {
        let target = prel31_to_addr(&exidx, idx.insn_addr())?;
        match region.section(SectionKind::Extab) {
            Some(extab) if extab.contains(target, 4) => (extab, target),
            _ => return Err(UnwindError::TableLinkIncorrect(target)),
        }
    } else if idx.insn & 0xff00_0000 == 0x8000_0000 {
        // Personality routine 0, inline in the index.
        (exidx, idx.insn_addr())
    } else {
        return Err(UnwindError::UnsupportedPersonality(idx.insn));
    };

    let word = section.read_word(addr)?;
    let ops = match word & 0xff00_0000 {
        0x8000_0000 => Opcodes::new(section, addr, 2, 1),
        0x8100_0000 => Opcodes::new(section, addr, 1, 1 + ((word >> 16) & 0xff)),
        _ => return Err(UnwindError::UnsupportedPersonality(word)),
    };
    Ok((ops, idx.fn_start))
}

fn unwind_frame<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    region: &RegionRef<D>,
    frame: &mut Frame,
    vma_sp: &Vma,
    thumb: bool,
) -> Result<(), UnwindError> {
    if !validate_stack_addr(frame.sp.into(), vma_sp, 4) {
        return Err(UnwindError::SpIncorrect(frame.sp.into()));
    }

    // Only go to a higher address on the stack.
    let low = u64::from(frame.sp);
    let high = vma_sp.end;

    tracing::trace!(
        "ehabi: pc {:#x}, lr {:#x}, sp {:#x}, stack {:#x}-{:#x}, thumb {}",
        frame.pc,
        frame.lr,
        frame.sp,
        low,
        high,
        thumb
    );

    let pc = u64::from(frame.pc);
    let (mut ops, fn_start) = find_program(region, pc)?;

    let mut vrs = [0u32; 16];
    vrs[FP_THUMB] = frame.fp_thumb;
    vrs[FP_ARM] = frame.fp_arm;
    vrs[SP] = frame.sp;
    vrs[LR] = frame.lr;
    vrs[PC] = 0;

    let check = ctx.methods.ut_ce;
    let mut qd = if check {
        let config = ctx.config;
        let offset = pc - fn_start;
        let max = if offset < config.disasm_min {
            fn_start + config.disasm_min
        } else if offset < config.disasm_max {
            pc
        } else {
            fn_start + config.disasm_max
        };
        disassemble(ctx.mm, fn_start, max, thumb)?
    } else {
        DisasmData::new(fn_start, fn_start, thumb)
    };

    let stack = Vma::new(low, high);
    while let Some(insn) = ops.next()? {
        exec_insn(ctx.mm, &stack, &mut ops, insn, &mut vrs, &mut qd)?;

        let sp = u64::from(vrs[SP]);
        if sp & 0x03 != 0 || sp < low || sp >= high {
            return Err(UnwindError::SpIncorrect(sp));
        }
    }

    if check {
        check_unwind_result(pc, &qd)?;
    }

    if vrs[PC] == 0 {
        vrs[PC] = vrs[LR];
    }
    if !validate_pc_addr(vrs[PC].into(), 4, ctx.task_size()) {
        return Err(UnwindError::PcIncorrect(vrs[PC].into()));
    }

    *frame = Frame {
        fp_thumb: vrs[FP_THUMB],
        fp_arm: vrs[FP_ARM],
        sp: vrs[SP],
        lr: vrs[LR],
        pc: vrs[PC],
    };
    Ok(())
}

fn unwind_backtrace<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    cc: &mut Callchain,
    mut region: RegionRef<D>,
    frame: &mut Frame,
    vma_sp: &Vma,
    mut thumb: bool,
) {
    cc.urc_ut = ResultCode::Failure;

    loop {
        let pc = u64::from(frame.pc);

        if !validate_stack_addr(frame.sp.into(), vma_sp, 4) {
            cc.urc_ut = ResultCode::SpIncorrect;
            break;
        }

        let Some(vma_pc) = ctx.mm.find_vma(pc) else {
            break;
        };

        if !is_vma_addr(region.info(SectionKind::Exidx).addr, &vma_pc, 4) {
            region = match ctx.registry.get_extabs_ehabi(vma_pc.start) {
                Ok(region) => region,
                Err(_) => {
                    cc.urc_ut = ResultCode::TblNotExist;
                    break;
                }
            };
        }

        if let Err(e) = unwind_frame(ctx, &region, frame, vma_sp, thumb) {
            tracing::debug!("ehabi: stopped at {:#x}: {}", pc, e);
            cc.urc_ut = e.code();
            break;
        }

        // Whether the caller is ARM or Thumb code.
        thumb = frame.lr & 1 != 0;

        tracing::debug!("ehabi: function at {:#x} from {:#x}", pc, frame.pc);

        cc.curr = frame.resume_state();
        if !cc.store(frame.pc.into(), UnwindType::Ut) {
            break;
        }
    }
}

/// Extend the call chain with the exception tables, starting at the sampled
/// registers or where the chain currently ends. Returns the chain length.
pub(crate) fn get_user_cc_arm32_ehabi<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    cc: &mut Callchain,
) -> usize {
    let regs = ctx.regs;
    if !regs.is_compat() {
        return cc.nr();
    }

    if cc.urc_ut == ResultCode::LevelTooDeep {
        return cc.nr();
    }
    cc.urc_ut = ResultCode::Failure;

    // The registers are 32 bits wide in this mode.
    let (mut frame, thumb) = if cc.nr() > 0 {
        let curr = cc.curr;
        let frame = Frame {
            fp_thumb: curr.fp_thumb as u32,
            fp_arm: curr.fp as u32,
            sp: curr.sp as u32,
            lr: curr.lr as u32,
            pc: curr.pc as u32,
        };
        (frame, curr.lr & 1 != 0)
    } else {
        let frame = Frame {
            fp_thumb: regs.fp_thumb() as u32,
            fp_arm: regs.fp() as u32,
            sp: regs.sp() as u32,
            lr: regs.lr() as u32,
            pc: regs.pc() as u32,
        };
        (frame, regs.is_thumb())
    };

    let Some(vma) = ctx.mm.find_vma(frame.pc.into()) else {
        return cc.nr();
    };
    let Some(vma_sp) = ctx.mm.find_vma(frame.sp.into()) else {
        return cc.nr();
    };

    let region = match ctx.registry.get_extabs_ehabi(vma.start) {
        Ok(region) => region,
        Err(_) => {
            cc.urc_ut = ResultCode::TblNotExist;
            return cc.nr();
        }
    };

    unwind_backtrace(ctx, cc, region, &mut frame, &vma_sp, thumb);
    cc.nr()
}

/// Whether `addr` is covered by an index entry which can be unwound.
pub(crate) fn is_ex_entry_exist<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    registry: &Registry<D>,
    mm: &M,
    addr: u64,
) -> bool {
    let Some(vma) = mm.find_vma(addr) else {
        return false;
    };
    let Ok(region) = registry.get_extabs_ehabi(vma.start) else {
        return false;
    };
    let Some(exidx) = region.section(SectionKind::Exidx) else {
        return false;
    };
    matches!(find_idx(&exidx, addr), Ok(Some(idx)) if idx.insn != EXIDX_CANTUNWIND)
}
