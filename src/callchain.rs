use std::fmt::Debug;

use arrayvec::ArrayVec;

use crate::display_utils::HexNum;
use crate::error::ResultCode;
use crate::memory::validate_pc_addr;

/// The maximum number of return addresses in one call chain.
pub const MAX_STACK_DEPTH: usize = 64;

/// The number of 4-bit type tags packed into one word of [`Callchain::packed_types`].
const TYPES_PER_WORD: usize = 8;

/// A return address, stored at the width of the sampled task.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    A32(u32),
    A64(u64),
}

impl Address {
    #[inline]
    pub fn get(self) -> u64 {
        match self {
            Address::A32(a) => a.into(),
            Address::A64(a) => a,
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::A32(a) => write!(f, "A32({:#010x})", a),
            Address::A64(a) => write!(f, "A64({:#018x})", a),
        }
    }
}

/// Which unwinding method produced a call chain entry.
///
/// The discriminants are part of the wire format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnwindType {
    /// Frame pointer walk.
    Fp = 0,
    /// ARM exception tables.
    Ut = 1,
    /// The link register, stored by the frame pointer walk.
    LrFp = 2,
    /// The link register, stored by the exception table unwinder.
    LrUt = 3,
    /// Kernel context.
    Kctx = 4,
    /// DWARF CFI from `.eh_frame`.
    DwarfEh = 5,
    /// DWARF CFI from `.debug_frame`.
    DwarfDf = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallchainEntry {
    pub ip: Address,
    pub ty: UnwindType,
}

/// The register state at the outermost frame found so far. It lets one method
/// continue where another one stopped.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct ResumeState {
    pub sp: u64,
    pub fp: u64,
    pub fp_thumb: u64,
    pub pc: u64,
    pub lr: u64,
}

impl Debug for ResumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeState")
            .field("sp", &HexNum(self.sp))
            .field("fp", &HexNum(self.fp))
            .field("fp_thumb", &HexNum(self.fp_thumb))
            .field("pc", &HexNum(self.pc))
            .field("lr", &HexNum(self.lr))
            .finish()
    }
}

/// The result of unwinding one sample: return addresses, innermost first,
/// and the reason each method stopped.
///
/// A callchain is meant to be reused across samples; [`Callchain::reset`]
/// clears it without allocating.
#[derive(Debug, Clone)]
pub struct Callchain {
    entries: ArrayVec<CallchainEntry, MAX_STACK_DEPTH>,
    cs_64: bool,
    pub urc_fp: ResultCode,
    pub urc_ut: ResultCode,
    pub urc_dwarf: ResultCode,
    pub(crate) curr: ResumeState,
    low_addr: u64,
    user_space_top: u64,
}

impl Default for Callchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Callchain {
    pub fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
            cs_64: false,
            urc_fp: ResultCode::None,
            urc_ut: ResultCode::None,
            urc_dwarf: ResultCode::None,
            curr: ResumeState::default(),
            low_addr: 0,
            user_space_top: u64::MAX,
        }
    }

    /// Prepare for a new sample. `low_addr` is the lowest address which may be
    /// stored; `user_space_top` the first address which may not.
    pub fn reset(&mut self, cs_64: bool, low_addr: u64, user_space_top: u64) {
        self.entries.clear();
        self.cs_64 = cs_64;
        self.urc_fp = ResultCode::None;
        self.urc_ut = ResultCode::None;
        self.urc_dwarf = ResultCode::None;
        self.curr = ResumeState::default();
        self.low_addr = low_addr;
        self.user_space_top = user_space_top;
    }

    /// The number of stored entries.
    #[inline]
    pub fn nr(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether addresses are stored as 64-bit values.
    #[inline]
    pub fn cs_64(&self) -> bool {
        self.cs_64
    }

    pub fn entries(&self) -> &[CallchainEntry] {
        &self.entries
    }

    pub fn ips(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.ip.get())
    }

    pub fn types(&self) -> impl Iterator<Item = UnwindType> + '_ {
        self.entries.iter().map(|e| e.ty)
    }

    pub fn resume_state(&self) -> &ResumeState {
        &self.curr
    }

    fn set_urc(&mut self, ty: UnwindType, urc: ResultCode) {
        match ty {
            UnwindType::Fp | UnwindType::LrFp => self.urc_fp = urc,
            UnwindType::Ut | UnwindType::LrUt => self.urc_ut = urc,
            UnwindType::DwarfEh | UnwindType::DwarfDf => self.urc_dwarf = urc,
            UnwindType::Kctx => {}
        }
    }

    /// Append a return address. Returns false, and records why in the status
    /// of the method which produced it, if the address is not a plausible user
    /// code address or if the chain is full.
    pub fn store(&mut self, ip: u64, ty: UnwindType) -> bool {
        let nbytes = if self.cs_64 { 8 } else { 4 };
        if ip < self.low_addr || !validate_pc_addr(ip, nbytes, self.user_space_top) {
            self.set_urc(ty, ResultCode::PcIncorrect);
            return false;
        }

        let ip = if self.cs_64 {
            Address::A64(ip)
        } else {
            match u32::try_from(ip) {
                Ok(ip) => Address::A32(ip),
                Err(_) => {
                    self.set_urc(ty, ResultCode::PcIncorrect);
                    return false;
                }
            }
        };

        if self.entries.try_push(CallchainEntry { ip, ty }).is_err() {
            self.set_urc(ty, ResultCode::LevelTooDeep);
            return false;
        }
        true
    }

    /// The type tags, 4 bits per entry and 8 entries per word, entry `i` in
    /// bits `4 * (i % 8)` of word `i / 8`.
    pub fn packed_types(&self) -> ArrayVec<u32, { MAX_STACK_DEPTH / TYPES_PER_WORD }> {
        let mut words = ArrayVec::new();
        for chunk in self.entries.chunks(TYPES_PER_WORD) {
            let word = chunk
                .iter()
                .enumerate()
                .fold(0u32, |word, (i, e)| word | (e.ty as u32) << (i * 4));
            words.push(word);
        }
        words
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_validates() {
        let mut cc = Callchain::new();
        cc.reset(false, 0x8000, 0xbf00_0000);
        assert!(!cc.store(0x7ffc, UnwindType::Fp));
        assert_eq!(cc.urc_fp, ResultCode::PcIncorrect);
        assert!(!cc.store(0xc000_0000, UnwindType::Ut));
        assert_eq!(cc.urc_ut, ResultCode::PcIncorrect);
        assert!(cc.store(0x10000, UnwindType::DwarfEh));
        assert_eq!(cc.entries()[0].ip, Address::A32(0x10000));
        assert_eq!(cc.urc_dwarf, ResultCode::None);
    }

    #[test]
    fn depth_cap() {
        let mut cc = Callchain::new();
        cc.reset(true, 0x8000, 1 << 48);
        for i in 0..MAX_STACK_DEPTH as u64 {
            assert!(cc.store(0x40_0000 + i * 4, UnwindType::DwarfDf));
        }
        assert!(!cc.store(0x50_0000, UnwindType::DwarfDf));
        assert_eq!(cc.nr(), MAX_STACK_DEPTH);
        assert_eq!(cc.urc_dwarf, ResultCode::LevelTooDeep);
        assert_eq!(cc.entries()[3].ip, Address::A64(0x40_000c));
    }

    #[test]
    fn packed_types_layout() {
        let mut cc = Callchain::new();
        cc.reset(false, 0x8000, 0xbf00_0000);
        let types = [
            UnwindType::LrFp,
            UnwindType::Fp,
            UnwindType::Ut,
            UnwindType::DwarfEh,
            UnwindType::DwarfDf,
            UnwindType::Ut,
            UnwindType::Ut,
            UnwindType::Fp,
            UnwindType::DwarfDf,
        ];
        for (i, ty) in types.iter().enumerate() {
            assert!(cc.store(0x10000 + i as u64 * 4, *ty));
        }
        let packed = cc.packed_types();
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[0], 0x0116_5102);
        assert_eq!(packed[1], 0x6);
    }
}
