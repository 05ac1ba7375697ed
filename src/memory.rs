use gimli::{EndianSlice, LittleEndian, Reader};

use crate::error::UnwindError;

/// A virtual memory area of the sampled task, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
}

impl Vma {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// The address space of the sampled task.
///
/// Reads must never block and never fault: an address which is not mapped,
/// or not resident, is reported as an error.
pub trait AddressSpace {
    /// Find the mapping which contains `addr`.
    fn find_vma(&self, addr: u64) -> Option<Vma>;

    /// Fill `buf` with the bytes at `addr`.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ()>;
}

/// The sampled task. A task without an address space (a kernel thread, or a
/// task which is exiting) cannot be unwound.
pub trait Task {
    type Mm: AddressSpace;

    fn mm(&self) -> Option<&Self::Mm>;
}

pub(crate) fn read_user_u16<M: AddressSpace + ?Sized>(mm: &M, addr: u64) -> Result<u16, UnwindError> {
    let mut buf = [0; 2];
    mm.read_bytes(addr, &mut buf)
        .map_err(|_| UnwindError::Access(addr))?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_user_u32<M: AddressSpace + ?Sized>(mm: &M, addr: u64) -> Result<u32, UnwindError> {
    let mut buf = [0; 4];
    mm.read_bytes(addr, &mut buf)
        .map_err(|_| UnwindError::Access(addr))?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_user_u64<M: AddressSpace + ?Sized>(mm: &M, addr: u64) -> Result<u64, UnwindError> {
    let mut buf = [0; 8];
    mm.read_bytes(addr, &mut buf)
        .map_err(|_| UnwindError::Access(addr))?;
    Ok(u64::from_le_bytes(buf))
}

/// Read one register-sized word: 4 bytes in 32-bit mode, 8 bytes otherwise.
pub(crate) fn read_user_word<M: AddressSpace + ?Sized>(
    mm: &M,
    addr: u64,
    size: u64,
) -> Result<u64, UnwindError> {
    if size == 4 {
        read_user_u32(mm, addr).map(u64::from)
    } else {
        read_user_u64(mm, addr)
    }
}

/// Whether `[addr, addr + nbytes]` lies inside `vma`.
#[inline]
pub fn is_vma_addr(addr: u64, vma: &Vma, nbytes: u64) -> bool {
    addr >= vma.start && addr < vma.end.saturating_sub(nbytes)
}

/// A stack address must be word aligned and inside the stack mapping.
#[inline]
pub fn validate_stack_addr(addr: u64, vma: &Vma, nbytes: u64) -> bool {
    addr & 0x03 == 0 && is_vma_addr(addr, vma, nbytes)
}

/// A code address must be non-null and below the top of user space.
#[inline]
pub fn validate_pc_addr(addr: u64, nbytes: u64, user_space_top: u64) -> bool {
    addr != 0 && addr < user_space_top.saturating_sub(nbytes)
}

/// Bounds-checked access to one section mirrored into an in-kernel buffer.
///
/// Addresses are the section's original virtual addresses ("ex addresses");
/// `data` holds exactly the section's bytes.
#[derive(Debug, Clone, Copy)]
pub struct SectionReader<'a> {
    data: &'a [u8],
    addr: u64,
}

impl<'a> SectionReader<'a> {
    pub fn new(data: &'a [u8], addr: u64) -> Self {
        Self { data, addr }
    }

    /// The ex address of the first byte of the section.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The ex address one past the last byte of the section, or `u64::MAX`
    /// for a section which runs up to the top of the address space.
    #[inline]
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.len())
    }

    /// Whether `nbytes` bytes can be read at `addr`.
    #[inline]
    pub fn contains(&self, addr: u64, nbytes: u64) -> bool {
        match addr.checked_sub(self.addr) {
            Some(offset) => offset
                .checked_add(nbytes)
                .map_or(false, |end| end <= self.len()),
            None => false,
        }
    }

    /// The offset of `addr` inside the section buffer.
    pub fn ex_addr_to_offset(&self, addr: u64) -> Option<usize> {
        if self.contains(addr, 0) {
            usize::try_from(addr - self.addr).ok()
        } else {
            None
        }
    }

    /// The inverse of [`SectionReader::ex_addr_to_offset`].
    #[inline]
    pub fn offset_to_ex_addr(&self, offset: usize) -> Option<u64> {
        self.addr.checked_add(offset as u64)
    }

    fn bytes<const N: usize>(&self, addr: u64) -> Result<[u8; N], UnwindError> {
        if !self.contains(addr, N as u64) {
            return Err(UnwindError::Access(addr));
        }
        let start = (addr - self.addr) as usize;
        let mut buf = [0; N];
        buf.copy_from_slice(&self.data[start..start + N]);
        Ok(buf)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, UnwindError> {
        self.bytes::<1>(addr).map(|b| b[0])
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, UnwindError> {
        self.bytes(addr).map(u32::from_le_bytes)
    }

    pub fn read_i32(&self, addr: u64) -> Result<i32, UnwindError> {
        self.bytes(addr).map(i32::from_le_bytes)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, UnwindError> {
        self.bytes(addr).map(u64::from_le_bytes)
    }

    /// Read a table word. Exception index and table words are always 4-byte
    /// aligned; an unaligned word means the table is unusable.
    pub fn read_word(&self, addr: u64) -> Result<u32, UnwindError> {
        if addr & 0x03 != 0 {
            return Err(UnwindError::Access(addr));
        }
        self.read_u32(addr)
    }

    /// Read a pointer-sized value.
    pub fn read_pointer(&self, addr: u64, ptr_size: u8) -> Result<u64, UnwindError> {
        match ptr_size {
            4 => self.read_u32(addr).map(u64::from),
            8 => self.read_u64(addr),
            _ => Err(UnwindError::TableIsCorrupt),
        }
    }

    /// A cursor positioned at `addr` which can read up to the end of the section.
    pub fn cursor_at(&self, addr: u64) -> Result<Cursor<'a>, UnwindError> {
        let offset = self
            .ex_addr_to_offset(addr)
            .ok_or(UnwindError::Access(addr))?;
        Ok(Cursor {
            input: EndianSlice::new(&self.data[offset..], LittleEndian),
            addr,
        })
    }

    /// A cursor over `[start, end)`, which must lie inside the section.
    pub fn cursor_range(&self, start: u64, end: u64) -> Result<Cursor<'a>, UnwindError> {
        let len = end.checked_sub(start).ok_or(UnwindError::TableIsCorrupt)?;
        if !self.contains(start, len) {
            return Err(UnwindError::Access(start));
        }
        let mut cursor = self.cursor_at(start)?;
        cursor.truncate(len)?;
        Ok(cursor)
    }
}

/// A little-endian read cursor over part of a mirrored section which keeps
/// track of the ex address it is positioned at.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    input: EndianSlice<'a, LittleEndian>,
    addr: u64,
}

macro_rules! cursor_read {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, UnwindError> {
            let addr = self.addr;
            let before = self.input.len();
            let value = self.input.$name().map_err(|e| Self::convert_err(e, addr))?;
            self.advance((before - self.input.len()) as u64)?;
            Ok(value)
        }
    };
}

impl<'a> Cursor<'a> {
    fn advance(&mut self, len: u64) -> Result<(), UnwindError> {
        self.addr = self
            .addr
            .checked_add(len)
            .ok_or(UnwindError::TableIsCorrupt)?;
        Ok(())
    }

    fn convert_err(e: gimli::Error, addr: u64) -> UnwindError {
        match e {
            gimli::Error::UnexpectedEof(_) => UnwindError::Access(addr),
            _ => UnwindError::TableIsCorrupt,
        }
    }

    /// The ex address of the next byte.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// The ex address one past the last readable byte, saturated like
    /// [`SectionReader::end`].
    #[inline]
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.input.len() as u64)
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.input.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// The unread bytes, for handing to gimli.
    #[inline]
    pub fn input(&self) -> EndianSlice<'a, LittleEndian> {
        self.input
    }

    cursor_read!(read_u8, u8);
    cursor_read!(read_u16, u16);
    cursor_read!(read_i16, i16);
    cursor_read!(read_u32, u32);
    cursor_read!(read_i32, i32);
    cursor_read!(read_u64, u64);
    cursor_read!(read_i64, i64);
    cursor_read!(read_uleb128, u64);
    cursor_read!(read_sleb128, i64);

    /// Read a NUL-terminated string and return it without its terminator.
    pub fn read_null_terminated(&mut self) -> Result<&'a [u8], UnwindError> {
        let s = self
            .input
            .read_null_terminated_slice()
            .map_err(|_| UnwindError::TableIsCorrupt)?;
        self.advance(s.len() as u64 + 1)?;
        Ok(s.slice())
    }

    pub fn skip(&mut self, len: u64) -> Result<(), UnwindError> {
        let n = usize::try_from(len).map_err(|_| UnwindError::TableIsCorrupt)?;
        self.input
            .skip(n)
            .map_err(|e| Self::convert_err(e, self.addr))?;
        self.advance(len)
    }

    /// Move forward to `addr`, which must not be behind the cursor.
    pub fn seek(&mut self, addr: u64) -> Result<(), UnwindError> {
        let len = addr.checked_sub(self.addr).ok_or(UnwindError::TableIsCorrupt)?;
        self.skip(len)
    }

    /// Limit the cursor to `len` more bytes.
    pub fn truncate(&mut self, len: u64) -> Result<(), UnwindError> {
        let n = usize::try_from(len).map_err(|_| UnwindError::TableIsCorrupt)?;
        self.input
            .truncate(n)
            .map_err(|e| Self::convert_err(e, self.addr))
    }

    /// Split off the next `len` bytes into their own cursor.
    pub fn split(&mut self, len: u64) -> Result<Cursor<'a>, UnwindError> {
        let mut head = *self;
        head.truncate(len)?;
        self.skip(len)?;
        Ok(head)
    }
}
