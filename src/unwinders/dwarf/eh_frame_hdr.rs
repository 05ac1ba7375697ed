//! The binary search table which indexes a frame section.
//!
//! `.eh_frame_hdr` is what the linker emits; `.debug_frame_hdr` is built by the
//! profiling daemon in the same layout for `.debug_frame`:
//!
//! ```text
//! u8      version           (1)
//! u8      eh_frame_ptr_enc
//! u8      fde_count_enc
//! u8      table_enc         (DW_EH_PE_datarel | DW_EH_PE_sdata4)
//! enc     eh_frame_ptr
//! enc     fde_count
//! [(s32 initial_loc, s32 fde); fde_count], both relative to the header
//! ```

use std::ops::Deref;

use gimli::constants;

use crate::error::UnwindError;
use crate::memory::SectionReader;
use crate::registry::{Registry, SectionKind};

use super::cfi::decode_fde_cie;
use super::encoding::{read_encoded_value, PointerContext};

const HDR_VERSION: u8 = 1;
const TABLE_ENTRY_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy)]
pub(crate) struct FdeTable<'a> {
    hdr: SectionReader<'a>,
    table_addr: u64,
    fde_count: u64,
}

impl<'a> FdeTable<'a> {
    pub fn parse<D: Deref<Target = [u8]>>(
        hdr: SectionReader<'a>,
        ctx: &PointerContext<D>,
    ) -> Result<Self, UnwindError> {
        if hdr.len() <= 4 {
            return Err(UnwindError::TableIsCorrupt);
        }

        let mut c = hdr.cursor_at(hdr.addr())?;
        let version = c.read_u8()?;
        let eh_frame_ptr_enc = c.read_u8()?;
        let fde_count_enc = c.read_u8()?;
        let table_enc = c.read_u8()?;

        if version != HDR_VERSION {
            tracing::warn!("unknown frame hdr version {}", version);
            return Err(UnwindError::TableIsCorrupt);
        }

        let ctx = PointerContext::new(ctx.region, ctx.ptr_size).with_data_base(hdr.addr());

        if eh_frame_ptr_enc != constants::DW_EH_PE_omit.0 {
            read_encoded_value(&mut c, eh_frame_ptr_enc, &ctx)?;
        }

        if fde_count_enc == constants::DW_EH_PE_omit.0 {
            return Err(UnwindError::TableIsCorrupt);
        }
        let fde_count = read_encoded_value(&mut c, fde_count_enc, &ctx)?;

        if c.is_empty() {
            return Err(UnwindError::TableIsCorrupt);
        }
        if fde_count.checked_mul(TABLE_ENTRY_SIZE) != Some(c.len()) {
            return Err(UnwindError::TableIsCorrupt);
        }
        if table_enc != (constants::DW_EH_PE_datarel.0 | constants::DW_EH_PE_sdata4.0) {
            tracing::warn!("unknown frame hdr table encoding {:#x}", table_enc);
            return Err(UnwindError::TableIsCorrupt);
        }

        Ok(Self {
            hdr,
            table_addr: c.addr(),
            fde_count,
        })
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.fde_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fde_count == 0
    }

    /// The initial location and the FDE address of entry `i`.
    pub fn entry(&self, i: u64) -> Result<(u64, u64), UnwindError> {
        let addr = self.table_addr + i * TABLE_ENTRY_SIZE;
        let base = self.hdr.addr();
        let initial_loc = base.wrapping_add_signed(self.hdr.read_i32(addr)?.into());
        let fde = base.wrapping_add_signed(self.hdr.read_i32(addr + 4)?.into());
        Ok((initial_loc, fde))
    }

    /// Binary search for the entry whose initial location is the greatest one
    /// not above `pc`. Addresses before the first entry, and at or past the
    /// last one, are not found.
    pub fn find_idx(&self, pc: u64) -> Result<Option<u64>, UnwindError> {
        if self.is_empty() {
            return Ok(None);
        }

        let mut start = 0;
        let mut stop = self.fde_count - 1;

        if pc < self.entry(start)?.0 {
            return Ok(None);
        }
        if pc >= self.entry(stop)?.0 {
            return Ok(None);
        }

        while start + 1 < stop {
            let mid = start + ((stop - start) >> 1);
            if pc < self.entry(mid)?.0 {
                stop = mid;
            } else {
                start = mid;
            }
        }

        Ok(Some(start))
    }
}

/// What [`find_fde`] may do with the range of the last table entry.
pub(crate) struct TailInfo<'r, D: Deref<Target = [u8]>> {
    pub registry: &'r Registry<D>,
    /// Whether the sample was taken from the scheduler path. The cache is not
    /// updated from there.
    pub is_sched: bool,
}

/// Find the FDE which may cover `pc`, using the search table. The table only
/// gives a candidate; the caller still needs to check the FDE's range.
///
/// The last table entry has no successor to bound it, so its range comes from
/// the FDE itself. That range is cached in the registry ("tail info").
pub(crate) fn find_fde<D: Deref<Target = [u8]>>(
    ctx: &PointerContext<D>,
    pc: u64,
    is_eh: bool,
    tail: Option<&TailInfo<D>>,
) -> Result<Option<u64>, UnwindError> {
    let region = ctx.region;
    let hdr = region.require_section(SectionKind::frame_hdr(is_eh))?;
    let table = FdeTable::parse(hdr, ctx)?;
    if table.is_empty() {
        tracing::warn!("empty fde search table in {:#x}", region.vm_start());
        return Ok(None);
    }

    let last = table.len() - 1;
    let (init_loc, fde_addr) = table.entry(last)?;

    if pc >= init_loc {
        if pc == init_loc {
            return Ok(Some(fde_addr));
        }

        let frame_kind = SectionKind::frame(is_eh);
        let ti = region.info(frame_kind);
        let (start, end) = if ti.tf_end > 0 {
            (ti.tf_start, ti.tf_end)
        } else {
            let frame = region.require_section(frame_kind)?;
            let (_, fde) = decode_fde_cie(&frame, fde_addr, is_eh, region.vm_start(), ctx)?;
            let start = fde.initial_location;
            let end = start.wrapping_add(fde.address_range);
            if let Some(tail) = tail {
                if !tail.is_sched {
                    tail.registry
                        .set_tail_info(region.vm_start(), frame_kind, start, end);
                }
            }
            (start, end)
        };

        tracing::trace!("pc {:#x}, last fde: {:#x} - {:#x}", pc, start, end);
        return Ok((pc >= start && pc < end).then_some(fde_addr));
    }

    match table.find_idx(pc)? {
        Some(i) => Ok(Some(table.entry(i)?.1)),
        None => Ok(None),
    }
}
