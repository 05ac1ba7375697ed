//! The DWARF CFI unwinder, for `.eh_frame` and `.debug_frame`.
//!
//! Works for AArch32 compat tasks and native AArch64 tasks alike; the virtual
//! register file is indexed by DWARF register number in both modes.

mod cfa;
mod cfi;
mod eh_frame_hdr;
mod encoding;

pub use cfa::{Expression, RegRule, RegsState, StackFrame, MAX_RS_STACK_DEPTH, NUM_REGS};

use std::ops::Deref;

use arrayvec::ArrayVec;
use gimli::{EndianSlice, EvaluationResult, LittleEndian, Location, Value};

use crate::cache::Cache;
use crate::callchain::{Callchain, ResumeState, UnwindType};
use crate::error::{ResultCode, UnwindError};
use crate::memory::{
    is_vma_addr, read_user_word, validate_pc_addr, validate_stack_addr, AddressSpace,
    SectionReader, Vma,
};
use crate::registry::{is_frame_present, RegionRef, Registry, SectionKind};
use crate::unwinder::UnwindCtx;
use crate::unwindregs::{Mode, ARM32_FP_THUMB};

use cfa::CfaVm;
use cfi::{decode_fde_cie, Cie, Fde};
use eh_frame_hdr::{find_fde, TailInfo};
use encoding::PointerContext;

fn ptr_size(mode: Mode) -> u8 {
    mode.reg_size() as u8
}

fn regnum(reg: u64, mode: Mode) -> Option<usize> {
    usize::try_from(reg).ok().filter(|r| *r < mode.num_regs())
}

fn fde_covers<D: Deref<Target = [u8]>>(
    ctx: &PointerContext<D>,
    pc: u64,
    is_eh: bool,
    tail: Option<&TailInfo<D>>,
) -> Result<bool, UnwindError> {
    let Some(fde_addr) = find_fde(ctx, pc, is_eh, tail)? else {
        return Ok(false);
    };
    let region = ctx.region;
    let frame = region.require_section(SectionKind::frame(is_eh))?;
    let (_, fde) = decode_fde_cie(&frame, fde_addr, is_eh, region.vm_start(), ctx)?;
    Ok(fde.contains(pc))
}

/// Whether an FDE covering `pc` exists in `.eh_frame` and in `.debug_frame`.
fn is_fde_entry_exist<D: Deref<Target = [u8]>>(
    ctx: &PointerContext<D>,
    pc: u64,
    tail: Option<&TailInfo<D>>,
) -> (bool, bool) {
    let covers = |is_eh| {
        is_frame_present(ctx.region, is_eh) && fde_covers(ctx, pc, is_eh, tail).unwrap_or(false)
    };
    (covers(true), covers(false))
}

/// Find and decode the FDE which covers `pc`, together with its CIE.
fn dwarf_decode<'r, D: Deref<Target = [u8]>>(
    region: &'r RegionRef<D>,
    ctx: &PointerContext<D>,
    pc: u64,
    is_eh: bool,
    tail: Option<&TailInfo<D>>,
) -> Result<(SectionReader<'r>, Cie<'r>, Fde<'r>), UnwindError> {
    let fde_addr = find_fde(ctx, pc, is_eh, tail)?.ok_or(UnwindError::IdxNotFound(pc))?;
    let frame = region.require_section(SectionKind::frame(is_eh))?;
    let (cie, fde) = decode_fde_cie(&frame, fde_addr, is_eh, region.vm_start(), ctx)?;
    if !fde.contains(pc) {
        return Err(UnwindError::IdxNotFound(pc));
    }
    Ok((frame, cie, fde))
}

/// Evaluate a DWARF expression of the frame section.
///
/// `DW_OP_breg*` reads the virtual registers and `DW_OP_deref*` reads the
/// task's memory. The result is the address or value of the first piece.
pub(crate) fn evaluate_expression<M: AddressSpace + ?Sized>(
    frame: &SectionReader,
    expr: Expression,
    initial_value: Option<u64>,
    vregs: &[u64; NUM_REGS],
    mm: &M,
    mode: Mode,
) -> Result<u64, UnwindError> {
    let end = expr
        .addr
        .checked_add(expr.len)
        .ok_or(UnwindError::TableIsCorrupt)?;
    let bytes: EndianSlice<LittleEndian> = frame.cursor_range(expr.addr, end)?.input();
    let encoding = gimli::Encoding {
        address_size: ptr_size(mode),
        format: gimli::Format::Dwarf32,
        version: 4,
    };
    let unsupported = |_| UnwindError::UnsupportedExpression(expr.addr);

    let mut eval = gimli::Expression(bytes).evaluation(encoding);
    if let Some(value) = initial_value {
        eval.set_initial_value(value);
    }

    let mut result = eval.evaluate().map_err(unsupported)?;
    loop {
        result = match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let mut buf = [0; 8];
                let size = usize::from(size).min(buf.len());
                mm.read_bytes(address, &mut buf[..size])
                    .map_err(|_| UnwindError::Access(address))?;
                let value = Value::Generic(u64::from_le_bytes(buf));
                eval.resume_with_memory(value).map_err(unsupported)?
            }
            EvaluationResult::RequiresRegister { register, .. } => {
                let r = regnum(register.0.into(), mode)
                    .ok_or(UnwindError::UnsupportedExpression(expr.addr))?;
                eval.resume_with_register(Value::Generic(vregs[r]))
                    .map_err(unsupported)?
            }
            _ => return Err(UnwindError::UnsupportedExpression(expr.addr)),
        };
    }

    let addr_mask = if mode == Mode::Arm32 { 0xffff_ffff } else { u64::MAX };
    match eval.result().first().map(|piece| &piece.location) {
        Some(Location::Address { address }) => Ok(*address & addr_mask),
        Some(Location::Value { value }) => value.to_u64(addr_mask).map_err(unsupported),
        _ => Err(UnwindError::UnsupportedExpression(expr.addr)),
    }
}

/// Unwind one frame: compute the CFA and the caller's registers from the
/// rules at `sf.pc`. The frame is only updated if the whole frame could be
/// resolved.
fn unwind_frame<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    region: &RegionRef<D>,
    sf: &mut StackFrame,
    stack: &mut ArrayVec<RegsState, MAX_RS_STACK_DEPTH>,
    vma_sp: &Vma,
    is_eh: bool,
    tail: Option<&TailInfo<D>>,
) -> Result<(), UnwindError> {
    let mode = sf.mode;
    let reg_size = mode.reg_size();
    let pctx = PointerContext::new(region, ptr_size(mode));
    let (frame, cie, fde) = dwarf_decode(region, &pctx, sf.pc, is_eh, tail)?;

    tracing::debug!(
        "dwarf ({}): function at {:#x} from {:#x}",
        if is_eh { "eh" } else { "debug" },
        fde.initial_location,
        sf.pc
    );

    let mut vm = CfaVm {
        cie: &cie,
        ctx: &pctx,
        pc: sf.pc,
        loc: fde.initial_location,
    };
    sf.rs = RegsState::default();
    sf.rs_initial = RegsState::default();
    vm.exec(cie.initial_instructions, &mut sf.rs, &sf.rs_initial, stack)?;
    sf.rs_initial = sf.rs;
    vm.exec(fde.instructions, &mut sf.rs, &sf.rs_initial, stack)?;

    let rs = &sf.rs;
    let mm = ctx.mm;

    let mut cfa = match rs.cfa_expr {
        Some(expr) => evaluate_expression(&frame, expr, None, &sf.vregs, mm, mode).map_err(|e| {
            tracing::warn!("cfa expression at {:#x}: {}", expr.addr, e);
            UnwindError::TableIsCorrupt
        })?,
        None => {
            let base = match rs.cfa_register {
                Some(reg) => sf.vregs[regnum(reg, mode).ok_or(UnwindError::TableIsCorrupt)?],
                None => 0,
            };
            base.wrapping_add_signed(rs.cfa_offset)
        }
    };
    if mode == Mode::Arm32 {
        cfa &= 0xffff_ffff;
    }

    let mut vregs = sf.vregs;
    for (i, rule) in rs.regs.iter().enumerate().take(mode.num_regs()) {
        match *rule {
            RegRule::Undef | RegRule::Same => {}
            RegRule::CfaRel(off) => {
                let addr = cfa.wrapping_add_signed(off);
                if !validate_stack_addr(addr, vma_sp, reg_size) {
                    return Err(UnwindError::SpIncorrect(addr));
                }
                vregs[i] = read_user_word(mm, addr, reg_size)?;
            }
            RegRule::Reg(r) => match regnum(r, mode) {
                Some(r) => vregs[i] = sf.vregs[r],
                None => tracing::warn!("r{}: value in unknown register {}", i, r),
            },
            RegRule::ValOffset(off) => vregs[i] = cfa.wrapping_add_signed(off),
            RegRule::Expr(expr) => {
                match evaluate_expression(&frame, expr, Some(cfa), &sf.vregs, mm, mode) {
                    Ok(addr) => vregs[i] = read_user_word(mm, addr, reg_size)?,
                    Err(e) => tracing::warn!("r{}: {}", i, e),
                }
            }
            RegRule::ValExpr(expr) => {
                match evaluate_expression(&frame, expr, Some(cfa), &sf.vregs, mm, mode) {
                    Ok(value) => vregs[i] = value,
                    Err(e) => tracing::warn!("r{}: {}", i, e),
                }
            }
        }
    }

    let ra_reg = regnum(cie.retaddr_reg, mode).ok_or(UnwindError::TableIsCorrupt)?;
    let ra = vregs[ra_reg];
    if !validate_pc_addr(ra, reg_size, ctx.task_size()) {
        return Err(UnwindError::PcIncorrect(ra));
    }

    vregs[mode.sp_regnum()] = cfa;
    sf.vregs = vregs;
    sf.pc = ra;
    sf.cfa = cfa;

    tracing::trace!("dwarf: unwound to {:?}", sf);
    Ok(())
}

fn unwind_backtrace<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    cc: &mut Callchain,
    cache: &mut Cache,
    mut region: RegionRef<D>,
    vma_sp: &Vma,
) {
    let mode = cache.sf.mode;
    let reg_size = mode.reg_size();
    let (sp_reg, fp_reg, lr_reg) = (mode.sp_regnum(), mode.fp_regnum(), mode.lr_regnum());
    let tail = TailInfo {
        registry: ctx.registry,
        is_sched: ctx.is_sched,
    };
    // The table the previous frame was unwound with is tried first.
    let mut is_eh = true;

    loop {
        let sp = cache.sf.vregs[sp_reg];
        if !validate_stack_addr(sp, vma_sp, reg_size) {
            cc.urc_dwarf = ResultCode::SpIncorrect;
            break;
        }

        let pc = cache.sf.pc;
        let Some(vma_pc) = ctx.mm.find_vma(pc) else {
            break;
        };

        if !is_vma_addr(region.vm_start(), &vma_pc, reg_size) {
            region = match ctx.registry.get_dw_frames(vma_pc.start) {
                Ok(region) => region,
                Err(_) => {
                    cc.urc_dwarf = ResultCode::TblNotExist;
                    break;
                }
            };
        }

        let pctx = PointerContext::new(&region, ptr_size(mode));
        let (has_eh, has_debug) = is_fde_entry_exist(&pctx, pc, Some(&tail));
        if !has_eh && !has_debug {
            cc.urc_dwarf = ResultCode::IdxNotFound;
            break;
        }

        if is_eh && !has_eh {
            is_eh = false;
        } else if !is_eh && !has_debug {
            is_eh = true;
        }
        let Cache { sf, rs_stack } = &mut *cache;
        let mut res = unwind_frame(ctx, &region, sf, rs_stack, vma_sp, is_eh, Some(&tail));
        if res.is_err() && has_eh && has_debug {
            is_eh = !is_eh;
            res = unwind_frame(ctx, &region, sf, rs_stack, vma_sp, is_eh, Some(&tail));
        }
        if let Err(e) = res {
            tracing::debug!("dwarf: stopped at {:#x}: {}", pc, e);
            cc.urc_dwarf = e.code();
            break;
        }

        let ty = if is_eh {
            UnwindType::DwarfEh
        } else {
            UnwindType::DwarfDf
        };

        cc.curr = ResumeState {
            sp: sf.vregs[sp_reg],
            fp: sf.vregs[fp_reg],
            fp_thumb: if mode == Mode::Arm32 {
                sf.vregs[ARM32_FP_THUMB]
            } else {
                0
            },
            pc: sf.pc,
            lr: sf.vregs[lr_reg],
        };

        if !cc.store(sf.pc, ty) {
            break;
        }
    }
}

/// Extend the call chain with the DWARF unwinder, starting at the sampled
/// registers or where the chain currently ends. Returns the chain length.
pub(crate) fn get_user_cc_dwarf<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    cc: &mut Callchain,
    cache: &mut Cache,
) -> usize {
    if cc.urc_dwarf == ResultCode::LevelTooDeep {
        return cc.nr();
    }
    cc.urc_dwarf = ResultCode::Failure;

    let regs = ctx.regs;
    let mode = regs.mode();
    let (pc, sp, fp, fp_thumb, lr) = if cc.nr() > 0 {
        let curr = cc.curr;
        (curr.pc, curr.sp, curr.fp, curr.fp_thumb, curr.lr)
    } else {
        (regs.pc(), regs.sp(), regs.fp(), regs.fp_thumb(), regs.lr())
    };

    let sf = &mut cache.sf;
    sf.vregs = [0; NUM_REGS];
    sf.vregs[mode.lr_regnum()] = lr;
    sf.vregs[mode.sp_regnum()] = sp;
    sf.vregs[mode.fp_regnum()] = fp;
    if mode == Mode::Arm32 {
        sf.vregs[ARM32_FP_THUMB] = fp_thumb;
    }
    sf.pc = pc;
    sf.cfa = 0;
    sf.mode = mode;
    sf.is_sched = ctx.is_sched;

    let Some(vma_pc) = ctx.mm.find_vma(pc) else {
        return cc.nr();
    };
    let Some(vma_sp) = ctx.mm.find_vma(sp) else {
        return cc.nr();
    };

    let region = match ctx.registry.get_dw_frames(vma_pc.start) {
        Ok(region) => region,
        Err(_) => {
            cc.urc_dwarf = ResultCode::TblNotExist;
            return cc.nr();
        }
    };

    unwind_backtrace(ctx, cc, cache, region, &vma_sp);
    cc.nr()
}

/// Whether an `.eh_frame` or `.debug_frame` FDE covers `addr`.
pub(crate) fn is_ex_entry_exist<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    registry: &Registry<D>,
    mm: &M,
    mode: Mode,
    addr: u64,
) -> bool {
    let Some(vma) = mm.find_vma(addr) else {
        return false;
    };
    let Ok(region) = registry.get_dw_frames(vma.start) else {
        return false;
    };
    let pctx = PointerContext::new(&region, ptr_size(mode));
    let (has_eh, has_debug) = is_fde_entry_exist(&pctx, addr, None);
    has_eh || has_debug
}
