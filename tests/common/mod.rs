#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use quadd_unwind::*;

/// A synthetic task address space: a set of mappings with their contents.
#[derive(Default)]
pub struct Memory {
    maps: BTreeMap<u64, Vec<u8>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `len` zero bytes at `start`.
    pub fn map(&mut self, start: u64, len: usize) -> &mut Self {
        self.maps.insert(start, vec![0; len]);
        self
    }

    fn slot(&mut self, addr: u64, len: usize) -> &mut [u8] {
        let (start, bytes) = self
            .maps
            .range_mut(..=addr)
            .next_back()
            .expect("address is not mapped");
        let off = (addr - start) as usize;
        &mut bytes[off..off + len]
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> &mut Self {
        self.slot(addr, data.len()).copy_from_slice(data);
        self
    }

    pub fn write32(&mut self, addr: u64, value: u32) -> &mut Self {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write64(&mut self, addr: u64, value: u64) -> &mut Self {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write consecutive 32-bit words.
    pub fn words32(&mut self, addr: u64, words: &[u32]) -> &mut Self {
        for (i, w) in words.iter().enumerate() {
            self.write32(addr + i as u64 * 4, *w);
        }
        self
    }
}

impl AddressSpace for Memory {
    fn find_vma(&self, addr: u64) -> Option<Vma> {
        let (start, bytes) = self.maps.range(..=addr).next_back()?;
        let vma = Vma::new(*start, start + bytes.len() as u64);
        vma.contains(addr).then_some(vma)
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ()> {
        let (start, bytes) = self.maps.range(..=addr).next_back().ok_or(())?;
        let off = (addr - start) as usize;
        let src = bytes.get(off..off + buf.len()).ok_or(())?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

pub struct Process(pub Option<Memory>);

impl Task for Process {
    type Mm = Memory;

    fn mm(&self) -> Option<&Memory> {
        self.0.as_ref()
    }
}

/// Register snapshot of an ARM mode 32-bit task with r11 as frame pointer.
pub fn arm_regs(pc: u64, sp: u64, lr: u64, fp: u64) -> UserRegs {
    UserRegs::new_arm32(pc as u32, sp as u32, lr as u32, fp as u32, 0, false)
}

/// Register snapshot of a Thumb mode 32-bit task with r7 as frame pointer.
pub fn thumb_regs(pc: u64, sp: u64, lr: u64, fp: u64) -> UserRegs {
    UserRegs::new_arm32(pc as u32, sp as u32, lr as u32, 0, fp as u32, true)
}

pub fn a64_regs(pc: u64, sp: u64, lr: u64, fp: u64) -> UserRegs {
    UserRegs::new_aarch64(pc, sp, lr, fp)
}

/// The sections uploaded for one mapping, all mirrored in one buffer.
pub struct Tables {
    upload: ExceptionTableUpload,
    data: Vec<u8>,
}

impl Tables {
    pub fn new(vm_start: u64, vm_end: u64) -> Self {
        Self {
            upload: ExceptionTableUpload::new(vm_start, vm_end),
            data: Vec::new(),
        }
    }

    pub fn section(mut self, kind: SectionKind, addr: u64, bytes: &[u8]) -> Self {
        let info = SectionInfo {
            addr,
            length: bytes.len() as u64,
            mmap_offset: self.data.len() as u64,
        };
        self.data.extend_from_slice(bytes);
        self.upload = self.upload.with_section(kind, info);
        self
    }

    /// Register the tables. The registry only holds on to the buffer weakly,
    /// so the caller keeps the returned `Arc` alive.
    pub fn register(self, registry: &Registry<Vec<u8>>) -> Arc<MmapArea<Vec<u8>>> {
        let mmap = Arc::new(MmapArea::new(self.data));
        registry.set_extab(&self.upload, &mmap).unwrap();
        mmap
    }
}

pub fn prel31(from: u64, to: u64) -> u32 {
    (to.wrapping_sub(from) as u32) & 0x7fff_ffff
}

/// How an index entry describes its function.
pub enum Unwind {
    CantUnwind,
    /// A personality routine 0 program inside the index word.
    Inline(u32),
    /// Words in `.ARM.extab`.
    Extab(Vec<u32>),
}

/// Build `.ARM.exidx` and `.ARM.extab` for sorted `(fn_start, unwind)` pairs.
/// The caller adds the terminating entry.
pub fn ehabi_sections(exidx_addr: u64, extab_addr: u64, entries: &[(u64, Unwind)]) -> (Vec<u8>, Vec<u8>) {
    let mut exidx = Vec::new();
    let mut extab = Vec::new();
    for (i, (fn_start, unwind)) in entries.iter().enumerate() {
        let addr = exidx_addr + i as u64 * 8;
        exidx.extend_from_slice(&prel31(addr, *fn_start).to_le_bytes());
        let insn = match unwind {
            Unwind::CantUnwind => 1,
            Unwind::Inline(word) => *word,
            Unwind::Extab(words) => {
                let target = extab_addr + extab.len() as u64;
                for w in words {
                    extab.extend_from_slice(&w.to_le_bytes());
                }
                prel31(addr + 4, target)
            }
        };
        exidx.extend_from_slice(&insn.to_le_bytes());
    }
    (exidx, extab)
}

/// Register EHABI tables for the text mapping `[vm_start, vm_end)`. The
/// tables are placed at the end of the mapping.
pub fn register_ehabi(
    registry: &Registry<Vec<u8>>,
    vm_start: u64,
    vm_end: u64,
    entries: &[(u64, Unwind)],
) -> Arc<MmapArea<Vec<u8>>> {
    let exidx_addr = vm_end - 0x800;
    let extab_addr = vm_end - 0x400;
    let (exidx, extab) = ehabi_sections(exidx_addr, extab_addr, entries);
    Tables::new(vm_start, vm_end)
        .section(SectionKind::Exidx, exidx_addr, &exidx)
        .section(SectionKind::Extab, extab_addr, &extab)
        .register(registry)
}

fn pad4(v: &mut Vec<u8>, start: usize) {
    // DW_CFA_nop
    while (v.len() - start) % 4 != 0 {
        v.push(0);
    }
}

fn uleb(v: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            v.push(byte);
            return;
        }
        v.push(byte | 0x80);
    }
}

fn sleb(v: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            v.push(byte);
            return;
        }
        v.push(byte | 0x80);
    }
}

/// Builds a `.eh_frame` or `.debug_frame` section with one CIE.
///
/// `.eh_frame` uses augmentation "zR" with pc-relative sdata4 locations;
/// `.debug_frame` has no augmentation and absolute pointer-sized locations.
pub struct FrameBuilder {
    addr: u64,
    is_eh: bool,
    ptr_size: u8,
    bytes: Vec<u8>,
    table: Vec<(u64, u64)>,
}

impl FrameBuilder {
    pub fn new(
        addr: u64,
        is_eh: bool,
        ptr_size: u8,
        code_align: u64,
        data_align: i64,
        ra_reg: u8,
        initial_instructions: &[u8],
    ) -> Self {
        let mut body = Vec::new();
        let id: u32 = if is_eh { 0 } else { 0xffff_ffff };
        body.extend_from_slice(&id.to_le_bytes());
        body.push(1);
        if is_eh {
            body.extend_from_slice(b"zR\0");
        } else {
            body.push(0);
        }
        uleb(&mut body, code_align);
        sleb(&mut body, data_align);
        body.push(ra_reg);
        if is_eh {
            uleb(&mut body, 1);
            // DW_EH_PE_pcrel | DW_EH_PE_sdata4
            body.push(0x1b);
        }
        body.extend_from_slice(initial_instructions);
        pad4(&mut body, 0);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&body);
        Self {
            addr,
            is_eh,
            ptr_size,
            bytes,
            table: Vec::new(),
        }
    }

    /// Add an FDE for `[start, start + len)`.
    pub fn fde(mut self, start: u64, len: u64, instructions: &[u8]) -> Self {
        let fde_addr = self.addr + self.bytes.len() as u64;
        let mut body = Vec::new();
        if self.is_eh {
            // The distance back to the CIE, from the CIE pointer field.
            body.extend_from_slice(&((fde_addr + 4 - self.addr) as u32).to_le_bytes());
            let loc_field = fde_addr + 8;
            body.extend_from_slice(&(start.wrapping_sub(loc_field) as u32).to_le_bytes());
            body.extend_from_slice(&(len as u32).to_le_bytes());
            uleb(&mut body, 0);
        } else {
            body.extend_from_slice(&0u32.to_le_bytes());
            if self.ptr_size == 4 {
                body.extend_from_slice(&(start as u32).to_le_bytes());
                body.extend_from_slice(&(len as u32).to_le_bytes());
            } else {
                body.extend_from_slice(&start.to_le_bytes());
                body.extend_from_slice(&len.to_le_bytes());
            }
        }
        body.extend_from_slice(instructions);
        pad4(&mut body, 0);

        self.bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&body);
        self.table.push((start, fde_addr));
        self
    }

    /// The section bytes and the `(initial location, FDE address)` pairs.
    pub fn finish(self) -> (Vec<u8>, Vec<(u64, u64)>) {
        (self.bytes, self.table)
    }
}

/// Build a search table header for `entries`, which are sorted by location.
pub fn frame_hdr(hdr_addr: u64, frame_addr: u64, entries: &[(u64, u64)]) -> Vec<u8> {
    // version, eh_frame_ptr pcrel|sdata4, fde_count udata4, table datarel|sdata4
    let mut v = vec![1, 0x1b, 0x03, 0x3b];
    v.extend_from_slice(&(frame_addr.wrapping_sub(hdr_addr + 4) as u32).to_le_bytes());
    v.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (loc, fde) in entries {
        v.extend_from_slice(&(loc.wrapping_sub(hdr_addr) as u32).to_le_bytes());
        v.extend_from_slice(&(fde.wrapping_sub(hdr_addr) as u32).to_le_bytes());
    }
    v
}

/// Register a frame section and its search table for `[vm_start, vm_end)`.
pub fn register_frame(
    registry: &Registry<Vec<u8>>,
    vm_start: u64,
    vm_end: u64,
    is_eh: bool,
    frame: FrameBuilder,
) -> Arc<MmapArea<Vec<u8>>> {
    let frame_addr = frame.addr;
    let (bytes, table) = frame.finish();
    let hdr_addr = frame_addr + bytes.len() as u64 + 0x10;
    let hdr = frame_hdr(hdr_addr, frame_addr, &table);
    Tables::new(vm_start, vm_end)
        .section(SectionKind::frame(is_eh), frame_addr, &bytes)
        .section(SectionKind::frame_hdr(is_eh), hdr_addr, &hdr)
        .register(registry)
}

pub fn setup(methods: UnwindMethods) -> (Arc<Registry<Vec<u8>>>, Unwinder<Vec<u8>>) {
    let registry = Arc::new(Registry::new());
    let unwinder = Unwinder::new(registry.clone(), methods, UnwindConfig::default());
    (registry, unwinder)
}

pub fn only(fp: bool, ut: bool, dwarf: bool) -> UnwindMethods {
    UnwindMethods {
        fp,
        ut,
        ut_ce: false,
        dwarf,
    }
}
