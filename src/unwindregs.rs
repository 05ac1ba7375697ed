use std::fmt::Debug;

use crate::display_utils::HexNum;

/// The execution state of the sampled user thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// AArch32, either a native ARM kernel or a compat task on AArch64.
    Arm32,
    /// Native AArch64.
    Arm64,
}

impl Mode {
    /// The size of a general purpose register, in bytes.
    #[inline]
    pub fn reg_size(self) -> u64 {
        match self {
            Mode::Arm32 => 4,
            Mode::Arm64 => 8,
        }
    }

    /// The number of DWARF registers which are tracked in this mode.
    #[inline]
    pub fn num_regs(self) -> usize {
        match self {
            Mode::Arm32 => 16,
            Mode::Arm64 => 32,
        }
    }

    pub fn sp_regnum(self) -> usize {
        match self {
            Mode::Arm32 => 13,
            Mode::Arm64 => 31,
        }
    }

    pub fn lr_regnum(self) -> usize {
        match self {
            Mode::Arm32 => 14,
            Mode::Arm64 => 30,
        }
    }

    pub fn fp_regnum(self) -> usize {
        match self {
            Mode::Arm32 => 11,
            Mode::Arm64 => 29,
        }
    }
}

/// The frame pointer used by Thumb code on AArch32 (r7).
pub const ARM32_FP_THUMB: usize = 7;

/// The user registers at the sample point. This is the only register state
/// the unwinders need: pc, sp, lr and the frame pointers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UserRegs {
    pc: u64,
    sp: u64,
    lr: u64,
    fp: u64,
    fp_thumb: u64,
    mode: Mode,
    thumb: bool,
}

impl UserRegs {
    /// Create a register snapshot for an AArch32 task. `fp_arm` is r11 and
    /// `fp_thumb` is r7. `thumb` is the T bit of the CPSR.
    pub fn new_arm32(pc: u32, sp: u32, lr: u32, fp_arm: u32, fp_thumb: u32, thumb: bool) -> Self {
        Self {
            pc: pc.into(),
            sp: sp.into(),
            lr: lr.into(),
            fp: fp_arm.into(),
            fp_thumb: fp_thumb.into(),
            mode: Mode::Arm32,
            thumb,
        }
    }

    /// Create a register snapshot for a native AArch64 task. `fp` is x29 and
    /// `lr` is x30.
    pub fn new_aarch64(pc: u64, sp: u64, lr: u64, fp: u64) -> Self {
        Self {
            pc,
            sp,
            lr,
            fp,
            fp_thumb: 0,
            mode: Mode::Arm64,
            thumb: false,
        }
    }

    #[inline(always)]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.sp
    }

    #[inline(always)]
    pub fn lr(&self) -> u64 {
        self.lr
    }

    /// Get the ARM frame pointer value (r11, or x29 on AArch64).
    #[inline(always)]
    pub fn fp(&self) -> u64 {
        self.fp
    }

    /// Get the Thumb frame pointer value (r7). Always zero on AArch64.
    #[inline(always)]
    pub fn fp_thumb(&self) -> u64 {
        self.fp_thumb
    }

    #[inline(always)]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether the task runs in 32-bit mode.
    #[inline(always)]
    pub fn is_compat(&self) -> bool {
        self.mode == Mode::Arm32
    }

    #[inline(always)]
    pub fn is_thumb(&self) -> bool {
        self.thumb
    }

    /// The frame pointer for the current instruction set: r7 in Thumb mode,
    /// r11 in ARM mode and x29 on AArch64.
    pub fn frame_pointer(&self) -> u64 {
        if self.thumb {
            self.fp_thumb
        } else {
            self.fp
        }
    }
}

impl Debug for UserRegs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRegs")
            .field("pc", &HexNum(self.pc))
            .field("sp", &HexNum(self.sp))
            .field("lr", &HexNum(self.lr))
            .field("fp", &HexNum(self.fp))
            .field("fp_thumb", &HexNum(self.fp_thumb))
            .field("mode", &self.mode)
            .field("thumb", &self.thumb)
            .finish()
    }
}
