use crate::error::UnwindError;
use crate::memory::SectionReader;

/// The index entry value of a function which cannot be unwound.
pub(crate) const EXIDX_CANTUNWIND: u32 = 1;

const ENTRY_SIZE: u64 = 8;

/// Resolve the prel31 offset stored in the word at `addr`: a 31-bit signed
/// offset relative to the word's own address.
pub(crate) fn prel31_to_addr(section: &SectionReader, addr: u64) -> Result<u64, UnwindError> {
    let value = section.read_word(addr)?;
    let offset = ((value as i32) << 1) >> 1;
    Ok(u64::from((addr as u32).wrapping_add_signed(offset)))
}

/// One `.ARM.exidx` entry: the function start and the second word, which is
/// either `EXIDX_CANTUNWIND`, a prel31 link into `.ARM.extab`, or an inline
/// compact table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    /// The ex address of the entry.
    pub addr: u64,
    pub fn_start: u64,
    pub insn: u32,
}

impl IndexEntry {
    /// The ex address of the second word.
    #[inline]
    pub fn insn_addr(&self) -> u64 {
        self.addr + 4
    }
}

/// The number of entries in the index section.
pub(crate) fn entry_count(exidx: &SectionReader) -> u64 {
    exidx.len() / ENTRY_SIZE
}

fn entry_start(exidx: &SectionReader, i: u64) -> Result<u64, UnwindError> {
    prel31_to_addr(exidx, exidx.addr() + i * ENTRY_SIZE)
}

/// Find the index entry of the function containing `pc`.
///
/// The last entry only bounds the one before it: linkers terminate the index
/// with an entry for the end of the text section. An entry resolving to a
/// function start of zero is treated as a hole in the table.
pub(crate) fn find_idx(exidx: &SectionReader, pc: u64) -> Result<Option<IndexEntry>, UnwindError> {
    let length = entry_count(exidx);
    if length == 0 {
        return Ok(None);
    }

    let mut start = 0;
    let mut stop = length - 1;

    let value = entry_start(exidx, start)?;
    if value == 0 || pc < value {
        return Ok(None);
    }

    let value = entry_start(exidx, stop)?;
    if value == 0 || pc >= value {
        return Ok(None);
    }

    while start + 1 < stop {
        let mid = start + ((stop - start) >> 1);
        let value = entry_start(exidx, mid)?;
        if value == 0 {
            return Ok(None);
        }
        if pc < value {
            stop = mid;
        } else {
            start = mid;
        }
    }

    let addr = exidx.addr() + start * ENTRY_SIZE;
    Ok(Some(IndexEntry {
        addr,
        fn_start: entry_start(exidx, start)?,
        insn: exidx.read_word(addr + 4)?,
    }))
}
