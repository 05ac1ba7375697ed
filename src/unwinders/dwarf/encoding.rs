use std::ops::Deref;

use gimli::constants::{self, DwEhPe};

use crate::error::UnwindError;
use crate::memory::Cursor;
use crate::registry::RegionRef;

/// Everything needed to decode a `DW_EH_PE_*` encoded pointer.
pub(crate) struct PointerContext<'r, D: Deref<Target = [u8]>> {
    /// 4 in 32-bit mode, 8 in 64-bit mode.
    pub ptr_size: u8,
    /// The base for `DW_EH_PE_datarel`. Only the search table header has one.
    pub data_base: Option<u64>,
    /// Indirect pointers are read from whichever section of the region
    /// contains them.
    pub region: &'r RegionRef<D>,
}

impl<'r, D: Deref<Target = [u8]>> PointerContext<'r, D> {
    pub fn new(region: &'r RegionRef<D>, ptr_size: u8) -> Self {
        Self {
            ptr_size,
            data_base: None,
            region,
        }
    }

    pub fn with_data_base(mut self, data_base: u64) -> Self {
        self.data_base = Some(data_base);
        self
    }
}

fn read_pointer(cursor: &mut Cursor, ptr_size: u8) -> Result<u64, UnwindError> {
    match ptr_size {
        4 => cursor.read_u32().map(u64::from),
        8 => cursor.read_u64(),
        _ => Err(UnwindError::TableIsCorrupt),
    }
}

/// Read an encoded pointer at the cursor and advance past it.
///
/// The sized formats are read sign-extended whether they are declared signed
/// or not. A pointer which is omitted reads as zero, and so does an indirect
/// pointer into a section which was not uploaded.
pub(crate) fn read_encoded_value<D: Deref<Target = [u8]>>(
    cursor: &mut Cursor,
    encoding: u8,
    ctx: &PointerContext<D>,
) -> Result<u64, UnwindError> {
    let enc = DwEhPe(encoding);

    if enc == constants::DW_EH_PE_omit {
        return Ok(0);
    }

    if enc == constants::DW_EH_PE_aligned {
        let size = u64::from(ctx.ptr_size);
        let aligned = cursor
            .addr()
            .checked_next_multiple_of(size)
            .ok_or(UnwindError::TableIsCorrupt)?;
        cursor.seek(aligned)?;
        return read_pointer(cursor, ctx.ptr_size);
    }

    let field_addr = cursor.addr();
    let value = match enc.format() {
        constants::DW_EH_PE_absptr => read_pointer(cursor, ctx.ptr_size)?,
        constants::DW_EH_PE_udata2 | constants::DW_EH_PE_sdata2 => cursor.read_i16()? as u64,
        constants::DW_EH_PE_udata4 | constants::DW_EH_PE_sdata4 => cursor.read_i32()? as u64,
        constants::DW_EH_PE_udata8 | constants::DW_EH_PE_sdata8 => cursor.read_i64()? as u64,
        constants::DW_EH_PE_uleb128 => cursor.read_uleb128()?,
        constants::DW_EH_PE_sleb128 => cursor.read_sleb128()? as u64,
        _ => {
            tracing::warn!("unsupported pointer format {:#x}", encoding);
            return Err(UnwindError::UnsupportedEncoding(encoding));
        }
    };

    let value = match enc.application() {
        constants::DW_EH_PE_absptr => value,
        constants::DW_EH_PE_pcrel => field_addr.wrapping_add(value),
        constants::DW_EH_PE_datarel => match ctx.data_base {
            Some(base) => base.wrapping_add(value),
            None => return Err(UnwindError::UnsupportedEncoding(encoding)),
        },
        _ => {
            tracing::warn!("unsupported pointer application {:#x}", encoding);
            return Err(UnwindError::UnsupportedEncoding(encoding));
        }
    };

    if value != 0 && enc.is_indirect() {
        return match ctx.region.section_containing(value) {
            Some(section) => section.read_pointer(value, ctx.ptr_size),
            // Links to sections which were not uploaded are ignored.
            None => Ok(0),
        };
    }

    Ok(value)
}

/// Read a value in the format part (the low nibble) of `encoding`, without
/// applying a base.
pub(crate) fn read_encoded_length<D: Deref<Target = [u8]>>(
    cursor: &mut Cursor,
    encoding: u8,
    ctx: &PointerContext<D>,
) -> Result<u64, UnwindError> {
    read_encoded_value(cursor, encoding & 0x0f, ctx)
}
