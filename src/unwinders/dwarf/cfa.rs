use std::fmt::Debug;
use std::ops::Deref;

use arrayvec::ArrayVec;
use gimli::constants::{self, DwCfa};

use crate::display_utils::HexNum;
use crate::error::UnwindError;
use crate::memory::Cursor;
use crate::unwindregs::Mode;

use super::cfi::Cie;
use super::encoding::{read_encoded_value, PointerContext};

/// The depth of the `DW_CFA_remember_state` stack.
pub const MAX_RS_STACK_DEPTH: usize = 8;

/// The number of DWARF registers which can carry a rule.
pub const NUM_REGS: usize = 32;

/// A DWARF expression inside the frame section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expression {
    pub addr: u64,
    pub len: u64,
}

/// How to recover a register of the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RegRule {
    /// The register is not restored.
    #[default]
    Undef,
    /// The register keeps its value.
    Same,
    /// The value is saved at `CFA + offset`.
    CfaRel(i64),
    /// The value is in another register.
    Reg(u64),
    /// The value is saved at the address the expression computes.
    Expr(Expression),
    /// The value is `CFA + offset`.
    ValOffset(i64),
    /// The value is what the expression computes.
    ValExpr(Expression),
}

/// The rule table at one location: the rule for every register and how to
/// compute the CFA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegsState {
    pub regs: [RegRule; NUM_REGS],
    pub cfa_register: Option<u64>,
    pub cfa_offset: i64,
    pub cfa_expr: Option<Expression>,
}

impl Default for RegsState {
    fn default() -> Self {
        Self {
            regs: [RegRule::Undef; NUM_REGS],
            cfa_register: None,
            cfa_offset: 0,
            cfa_expr: None,
        }
    }
}

impl RegsState {
    fn set(&mut self, reg: u64, rule: RegRule) {
        match usize::try_from(reg).ok().filter(|r| *r < NUM_REGS) {
            Some(r) => self.regs[r] = rule,
            None => tracing::warn!("rule for register {} ignored", reg),
        }
    }

    fn restore(&mut self, reg: u64, initial: &RegsState) {
        match usize::try_from(reg).ok().filter(|r| *r < NUM_REGS) {
            Some(r) => self.regs[r] = initial.regs[r],
            None => tracing::warn!("restore of register {} ignored", reg),
        }
    }
}

/// The frame being unwound by the DWARF unwinder.
#[derive(Clone)]
pub struct StackFrame {
    pub pc: u64,
    /// The virtual register file, indexed by DWARF register number.
    pub vregs: [u64; NUM_REGS],
    pub cfa: u64,
    pub mode: Mode,
    pub is_sched: bool,
    /// The rules at `pc`.
    pub rs: RegsState,
    /// The rules after the CIE's initial instructions, for `DW_CFA_restore`.
    pub rs_initial: RegsState,
}

impl Default for StackFrame {
    fn default() -> Self {
        Self {
            pc: 0,
            vregs: [0; NUM_REGS],
            cfa: 0,
            mode: Mode::Arm32,
            is_sched: false,
            rs: RegsState::default(),
            rs_initial: RegsState::default(),
        }
    }
}

impl Debug for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sp = self.mode.sp_regnum();
        let lr = self.mode.lr_regnum();
        f.debug_struct("StackFrame")
            .field("pc", &HexNum(self.pc))
            .field("sp", &HexNum(self.vregs[sp]))
            .field("lr", &HexNum(self.vregs[lr]))
            .field("cfa", &HexNum(self.cfa))
            .field("mode", &self.mode)
            .finish()
    }
}

/// Runs CFA programs for one CIE/FDE pair, building the rule table at `pc`.
pub(crate) struct CfaVm<'c, D: Deref<Target = [u8]>> {
    pub cie: &'c Cie<'c>,
    pub ctx: &'c PointerContext<'c, D>,
    pub pc: u64,
    /// The location the rules currently apply to.
    pub loc: u64,
}

impl<'c, D: Deref<Target = [u8]>> CfaVm<'c, D> {
    /// Execute `insns` until the location passes `pc` or the program ends.
    ///
    /// Unknown opcodes, rules for registers which are not tracked and misuse
    /// of the state stack are logged and do not make the table unusable; only
    /// reads past the end of the section do.
    pub fn exec(
        &mut self,
        mut insns: Cursor,
        rs: &mut RegsState,
        rs_initial: &RegsState,
        stack: &mut ArrayVec<RegsState, MAX_RS_STACK_DEPTH>,
    ) -> Result<(), UnwindError> {
        let caf = self.cie.code_align_factor;
        let daf = self.cie.data_align_factor;
        let factored = |v: u64| (v as i64).wrapping_mul(daf);

        stack.clear();

        while !insns.is_empty() && self.loc <= self.pc {
            let insn = insns.read_u8()?;
            let operand = u64::from(insn & 0x3f);

            match insn & 0xc0 {
                0x40 => {
                    self.advance(operand, caf);
                    continue;
                }
                0x80 => {
                    let off = factored(insns.read_uleb128()?);
                    rs.set(operand, RegRule::CfaRel(off));
                    continue;
                }
                0xc0 => {
                    rs.restore(operand, rs_initial);
                    continue;
                }
                _ => {}
            }

            match DwCfa(insn) {
                constants::DW_CFA_nop => {}
                constants::DW_CFA_set_loc => {
                    let mut loc = read_encoded_value(&mut insns, self.cie.fde_encoding, self.ctx)?;
                    let vm_start = self.ctx.region.vm_start();
                    if loc < vm_start {
                        loc = loc.wrapping_add(vm_start);
                    }
                    self.loc = loc;
                }
                constants::DW_CFA_advance_loc1 => {
                    let delta = insns.read_u8()?;
                    self.advance(delta.into(), caf);
                }
                constants::DW_CFA_advance_loc2 => {
                    let delta = insns.read_u16()?;
                    self.advance(delta.into(), caf);
                }
                constants::DW_CFA_advance_loc4 => {
                    let delta = insns.read_u32()?;
                    self.advance(delta.into(), caf);
                }
                constants::DW_CFA_offset_extended => {
                    let reg = insns.read_uleb128()?;
                    let off = factored(insns.read_uleb128()?);
                    rs.set(reg, RegRule::CfaRel(off));
                }
                constants::DW_CFA_restore_extended => {
                    let reg = insns.read_uleb128()?;
                    rs.restore(reg, rs_initial);
                }
                constants::DW_CFA_undefined => {
                    let reg = insns.read_uleb128()?;
                    rs.set(reg, RegRule::Undef);
                }
                constants::DW_CFA_same_value => {
                    let reg = insns.read_uleb128()?;
                    rs.set(reg, RegRule::Same);
                }
                constants::DW_CFA_register => {
                    let reg = insns.read_uleb128()?;
                    let reg2 = insns.read_uleb128()?;
                    rs.set(reg, RegRule::Reg(reg2));
                }
                constants::DW_CFA_remember_state => {
                    if stack.try_push(*rs).is_err() {
                        tracing::warn!("remember_state: stack overflow at {:#x}", self.loc);
                        return Ok(());
                    }
                }
                constants::DW_CFA_restore_state => match stack.pop() {
                    Some(saved) => *rs = saved,
                    None => {
                        tracing::warn!("restore_state: stack underflow at {:#x}", self.loc);
                        return Ok(());
                    }
                },
                constants::DW_CFA_def_cfa => {
                    rs.cfa_register = Some(insns.read_uleb128()?);
                    rs.cfa_offset = insns.read_uleb128()? as i64;
                    rs.cfa_expr = None;
                }
                constants::DW_CFA_def_cfa_sf => {
                    rs.cfa_register = Some(insns.read_uleb128()?);
                    rs.cfa_offset = insns.read_sleb128()?.wrapping_mul(daf);
                    rs.cfa_expr = None;
                }
                constants::DW_CFA_def_cfa_register => {
                    rs.cfa_register = Some(insns.read_uleb128()?);
                    rs.cfa_expr = None;
                }
                constants::DW_CFA_def_cfa_offset => {
                    rs.cfa_offset = insns.read_uleb128()? as i64;
                }
                constants::DW_CFA_def_cfa_offset_sf => {
                    rs.cfa_offset = insns.read_sleb128()?.wrapping_mul(daf);
                }
                constants::DW_CFA_def_cfa_expression => {
                    rs.cfa_expr = Some(read_expression(&mut insns)?);
                }
                constants::DW_CFA_expression => {
                    let reg = insns.read_uleb128()?;
                    rs.set(reg, RegRule::Expr(read_expression(&mut insns)?));
                }
                constants::DW_CFA_val_expression => {
                    let reg = insns.read_uleb128()?;
                    rs.set(reg, RegRule::ValExpr(read_expression(&mut insns)?));
                }
                constants::DW_CFA_offset_extended_sf => {
                    let reg = insns.read_uleb128()?;
                    let off = insns.read_sleb128()?.wrapping_mul(daf);
                    rs.set(reg, RegRule::CfaRel(off));
                }
                constants::DW_CFA_val_offset => {
                    let reg = insns.read_uleb128()?;
                    let off = factored(insns.read_uleb128()?);
                    rs.set(reg, RegRule::ValOffset(off));
                }
                constants::DW_CFA_val_offset_sf => {
                    let reg = insns.read_uleb128()?;
                    let off = insns.read_sleb128()?.wrapping_mul(daf);
                    rs.set(reg, RegRule::ValOffset(off));
                }
                constants::DW_CFA_GNU_args_size => {
                    insns.read_uleb128()?;
                }
                constants::DW_CFA_GNU_negative_offset_extended => {
                    let reg = insns.read_uleb128()?;
                    let off = factored(insns.read_uleb128()?);
                    rs.set(reg, RegRule::CfaRel(off.wrapping_neg()));
                }
                // Also DW_CFA_AARCH64_negate_ra_state. Return addresses are not
                // signed in the profiled tasks.
                constants::DW_CFA_GNU_window_save => {}
                _ => {
                    tracing::warn!("unhandled cfa instruction {:#04x}", insn);
                }
            }
        }

        Ok(())
    }

    fn advance(&mut self, delta: u64, caf: u64) {
        self.loc = self.loc.wrapping_add(delta.wrapping_mul(caf));
    }
}

fn read_expression(insns: &mut Cursor) -> Result<Expression, UnwindError> {
    let len = insns.read_uleb128()?;
    let addr = insns.addr();
    insns.skip(len)?;
    Ok(Expression { addr, len })
}
