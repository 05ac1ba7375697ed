use std::fmt::Debug;
use std::ops::Deref;

use crate::display_utils::HexNum;
use crate::error::UnwindError;
use crate::memory::{Cursor, SectionReader};

use super::encoding::{read_encoded_length, read_encoded_value, PointerContext};

const DW_CIE_ID_EH: u32 = 0;
const DW_CIE_ID_DEBUG: u32 = 0xffff_ffff;
const DW_LENGTH_64: u32 = 0xffff_ffff;

/// A decoded Common Information Entry.
#[derive(Clone)]
pub(crate) struct Cie<'a> {
    /// The ex address of the length field.
    pub addr: u64,
    pub aug_string: &'a [u8],
    pub code_align_factor: u64,
    pub data_align_factor: i64,
    pub retaddr_reg: u64,
    pub fde_encoding: u8,
    pub lsda_encoding: u8,
    pub personality: u64,
    pub z_aug: bool,
    pub signal_frame: bool,
    pub initial_instructions: Cursor<'a>,
}

/// A decoded Frame Description Entry.
#[derive(Clone)]
pub(crate) struct Fde<'a> {
    /// The ex address of the length field.
    pub addr: u64,
    pub initial_location: u64,
    pub address_range: u64,
    pub instructions: Cursor<'a>,
}

impl<'a> Fde<'a> {
    #[inline]
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.initial_location
            && pc < self.initial_location.wrapping_add(self.address_range)
    }
}

impl<'a> Debug for Cie<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cie")
            .field("addr", &HexNum(self.addr))
            .field("aug_string", &String::from_utf8_lossy(self.aug_string))
            .field("code_align_factor", &self.code_align_factor)
            .field("data_align_factor", &self.data_align_factor)
            .field("retaddr_reg", &self.retaddr_reg)
            .field("fde_encoding", &HexNum(self.fde_encoding))
            .finish()
    }
}

impl<'a> Debug for Fde<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fde")
            .field("addr", &HexNum(self.addr))
            .field("initial_location", &HexNum(self.initial_location))
            .field("address_range", &HexNum(self.address_range))
            .field("insn_length", &self.instructions.len())
            .finish()
    }
}

/// Every read while decoding an entry stays inside the frame section, so a
/// read which runs off its end means the entry is truncated.
fn truncated(e: UnwindError) -> UnwindError {
    match e {
        UnwindError::Access(_) => UnwindError::TableIsCorrupt,
        e => e,
    }
}

/// Read the length field of an entry and return a cursor over the entry's
/// contents, which follow the length field.
fn entry_body<'a>(frame: &SectionReader<'a>, addr: u64) -> Result<Cursor<'a>, UnwindError> {
    let mut c = frame.cursor_at(addr)?;
    let length = c.read_u32()?;
    if length == DW_LENGTH_64 {
        tracing::warn!("64-bit frame entry at {:#x}", addr);
        return Err(UnwindError::Dwarf64);
    }
    let start = c.addr();
    let end = start
        .checked_add(u64::from(length))
        .ok_or(UnwindError::TableIsCorrupt)?;
    frame.cursor_range(start, end)
}

pub(crate) fn decode_cie<'a, D: Deref<Target = [u8]>>(
    frame: &SectionReader<'a>,
    addr: u64,
    is_eh: bool,
    ctx: &PointerContext<D>,
) -> Result<Cie<'a>, UnwindError> {
    parse_cie(frame, addr, is_eh, ctx).map_err(truncated)
}

fn parse_cie<'a, D: Deref<Target = [u8]>>(
    frame: &SectionReader<'a>,
    addr: u64,
    is_eh: bool,
    ctx: &PointerContext<D>,
) -> Result<Cie<'a>, UnwindError> {
    let mut c = entry_body(frame, addr)?;
    let end = c.end();

    let id = c.read_u32()?;
    let expected_id = if is_eh { DW_CIE_ID_EH } else { DW_CIE_ID_DEBUG };
    if id != expected_id {
        tracing::debug!("incorrect cie id {:#x} at {:#x}", id, addr);
        return Err(UnwindError::TableIsCorrupt);
    }

    let version = c.read_u8()?;
    if version != 1 && version != 3 {
        tracing::debug!("wrong cie version {} at {:#x}", version, addr);
        return Err(UnwindError::TableIsCorrupt);
    }

    let aug_string = c.read_null_terminated()?;
    let code_align_factor = c.read_uleb128()?;
    let data_align_factor = c.read_sleb128()?;
    let retaddr_reg = if version == 1 {
        u64::from(c.read_u8()?)
    } else {
        c.read_uleb128()?
    };

    let mut cie = Cie {
        addr,
        aug_string,
        code_align_factor,
        data_align_factor,
        retaddr_reg,
        fde_encoding: 0,
        lsda_encoding: gimli::constants::DW_EH_PE_omit.0,
        personality: 0,
        z_aug: false,
        signal_frame: false,
        initial_instructions: c,
    };

    let mut aug = aug_string;
    let mut initial_insn = None;
    if let Some((&b'z', rest)) = aug.split_first() {
        let aug_size = c.read_uleb128()?;
        initial_insn = Some(c.addr().checked_add(aug_size).ok_or(UnwindError::TableIsCorrupt)?);
        cie.z_aug = true;
        aug = rest;
    }

    for &ch in aug {
        if c.is_empty() {
            return Err(UnwindError::TableIsCorrupt);
        }
        match ch {
            b'L' => cie.lsda_encoding = c.read_u8()?,
            b'R' => cie.fde_encoding = c.read_u8()?,
            b'P' => {
                let handler_encoding = c.read_u8()?;
                cie.personality = read_encoded_value(&mut c, handler_encoding, ctx)?;
            }
            b'S' => cie.signal_frame = true,
            _ => {
                tracing::warn!("unknown augmentation {:?}", char::from(ch));
                return Err(UnwindError::UnknownAugmentation(ch));
            }
        }
    }

    let insn_start = initial_insn.unwrap_or(c.addr());
    if insn_start > end || c.addr() > end {
        return Err(UnwindError::TableIsCorrupt);
    }
    cie.initial_instructions = frame.cursor_range(insn_start, end)?;

    Ok(cie)
}

/// Decode the FDE at `fde_addr` together with its CIE. Locations below
/// `vm_start` are module-relative and get relocated by `vm_start`.
pub(crate) fn decode_fde_cie<'a, D: Deref<Target = [u8]>>(
    frame: &SectionReader<'a>,
    fde_addr: u64,
    is_eh: bool,
    vm_start: u64,
    ctx: &PointerContext<D>,
) -> Result<(Cie<'a>, Fde<'a>), UnwindError> {
    parse_fde_cie(frame, fde_addr, is_eh, vm_start, ctx).map_err(truncated)
}

fn parse_fde_cie<'a, D: Deref<Target = [u8]>>(
    frame: &SectionReader<'a>,
    fde_addr: u64,
    is_eh: bool,
    vm_start: u64,
    ctx: &PointerContext<D>,
) -> Result<(Cie<'a>, Fde<'a>), UnwindError> {
    let mut c = entry_body(frame, fde_addr)?;

    let cie_pointer_addr = c.addr();
    let cie_pointer = c.read_u32()?;
    let cie_addr = if is_eh {
        if cie_pointer == DW_CIE_ID_EH {
            return Err(UnwindError::TableIsCorrupt);
        }
        cie_pointer_addr.checked_sub(u64::from(cie_pointer))
    } else {
        if cie_pointer == DW_CIE_ID_DEBUG {
            return Err(UnwindError::TableIsCorrupt);
        }
        frame.addr().checked_add(u64::from(cie_pointer))
    }
    .ok_or(UnwindError::TableIsCorrupt)?;

    let cie = parse_cie(frame, cie_addr, is_eh, ctx)?;

    let mut initial_location = read_encoded_value(&mut c, cie.fde_encoding, ctx)?;
    let address_range = read_encoded_length(&mut c, cie.fde_encoding, ctx)?;

    if initial_location < vm_start {
        initial_location = initial_location.wrapping_add(vm_start);
    }

    if cie.z_aug {
        let aug_len = c.read_uleb128()?;
        c.skip(aug_len)?;
    }

    let fde = Fde {
        addr: fde_addr,
        initial_location,
        address_range,
        instructions: c,
    };
    tracing::trace!("{:?} {:?}", cie, fde);

    Ok((cie, fde))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::registry::{ExceptionTableUpload, MmapArea, Registry, SectionInfo, SectionKind};

    const EH_FRAME: u64 = 0x1_8000;

    /// A CIE "zR" with pcrel|sdata4 FDE pointers, followed by one FDE for
    /// [0x11000, 0x11100) with three instruction bytes.
    fn eh_frame() -> Vec<u8> {
        let mut v = Vec::new();
        // CIE
        v.extend_from_slice(&16u32.to_le_bytes());
        v.extend_from_slice(&0u32.to_le_bytes());
        v.push(1); // version
        v.extend_from_slice(b"zR\0");
        v.push(2); // code align
        v.push(0x7c); // data align -4
        v.push(14); // return address register
        v.push(1); // augmentation size
        v.push(0x1b); // FDE encoding
        v.extend_from_slice(&[0x0c, 0x0d, 0x00]); // def_cfa r13, 0
        assert_eq!(v.len(), 20);
        // FDE at 0x18014
        v.extend_from_slice(&16u32.to_le_bytes());
        v.extend_from_slice(&0x18u32.to_le_bytes()); // back to the CIE
        let field = EH_FRAME + v.len() as u64;
        v.extend_from_slice(&((0x11000 - field as i64) as i32).to_le_bytes());
        v.extend_from_slice(&0x100u32.to_le_bytes());
        v.push(0); // augmentation size
        v.extend_from_slice(&[0x42, 0x0e, 0x08]); // advance_loc 2, def_cfa_offset 8
        v
    }

    fn with_region<F: FnOnce(&SectionReader, &PointerContext<Vec<u8>>)>(bytes: Vec<u8>, f: F) {
        let len = bytes.len() as u64;
        let registry = Registry::new();
        let mmap = Arc::new(MmapArea::new(bytes));
        let upload = ExceptionTableUpload::new(0x10000, 0x20000).with_section(
            SectionKind::EhFrame,
            SectionInfo {
                addr: EH_FRAME,
                length: len,
                mmap_offset: 0,
            },
        );
        registry.set_extab(&upload, &mmap).unwrap();
        let region = registry.search(0x10000).unwrap();
        let frame = region.section(SectionKind::EhFrame).unwrap();
        let ctx = PointerContext::new(&region, 4);
        f(&frame, &ctx);
    }

    #[test]
    fn decode_pair() {
        with_region(eh_frame(), |frame, ctx| {
            let (cie, fde) = decode_fde_cie(frame, EH_FRAME + 20, true, 0x10000, ctx).unwrap();
            assert_eq!(cie.aug_string, b"zR");
            assert_eq!(cie.code_align_factor, 2);
            assert_eq!(cie.data_align_factor, -4);
            assert_eq!(cie.retaddr_reg, 14);
            assert_eq!(cie.fde_encoding, 0x1b);
            assert_eq!(cie.initial_instructions.addr(), EH_FRAME + 17);
            assert_eq!(cie.initial_instructions.len(), 3);
            assert_eq!(fde.initial_location, 0x11000);
            assert_eq!(fde.address_range, 0x100);
            assert_eq!(fde.instructions.len(), 3);
            assert!(fde.contains(0x110ff));
            assert!(!fde.contains(0x11100));
        });
    }

    #[test]
    fn corrupt_entries() {
        let mut bytes = eh_frame();
        bytes[8] = 2; // CIE version
        with_region(bytes, |frame, ctx| {
            assert_eq!(
                decode_fde_cie(frame, EH_FRAME + 20, true, 0x10000, ctx).err(),
                Some(UnwindError::TableIsCorrupt)
            );
        });

        let mut bytes = eh_frame();
        bytes[10] = b'Q';
        with_region(bytes, |frame, ctx| {
            assert_eq!(
                decode_cie(frame, EH_FRAME, true, ctx).err(),
                Some(UnwindError::UnknownAugmentation(b'Q'))
            );
        });

        let mut bytes = eh_frame();
        bytes[20..24].copy_from_slice(&DW_LENGTH_64.to_le_bytes());
        with_region(bytes, |frame, ctx| {
            assert_eq!(
                decode_fde_cie(frame, EH_FRAME + 20, true, 0x10000, ctx).err(),
                Some(UnwindError::Dwarf64)
            );
        });

        // The FDE claims more bytes than the section holds.
        let mut bytes = eh_frame();
        bytes[20..24].copy_from_slice(&0x40u32.to_le_bytes());
        with_region(bytes, |frame, ctx| {
            assert_eq!(
                decode_fde_cie(frame, EH_FRAME + 20, true, 0x10000, ctx).err(),
                Some(UnwindError::TableIsCorrupt)
            );
        });

        // The CIE ends inside its augmentation data.
        let mut bytes = eh_frame();
        bytes[0..4].copy_from_slice(&9u32.to_le_bytes());
        with_region(bytes, |frame, ctx| {
            assert_eq!(
                decode_cie(frame, EH_FRAME, true, ctx).err(),
                Some(UnwindError::TableIsCorrupt)
            );
        });

        // A .debug_frame CIE must carry the 0xffffffff id.
        with_region(eh_frame(), |frame, ctx| {
            assert_eq!(
                decode_cie(frame, EH_FRAME, false, ctx).err(),
                Some(UnwindError::TableIsCorrupt)
            );
        });
    }
}
