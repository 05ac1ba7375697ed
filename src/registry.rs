//! The exception table registry.
//!
//! The profiling daemon uploads, per mapped executable file, the unwind sections
//! of that file into an mmap area. Every upload becomes an [`ExceptionRegion`],
//! keyed by the start address of the file's mapping in the sampled task.
//!
//! The table of regions is shared between the control path, which adds and
//! removes regions, and the sampling path, which only ever looks regions up.
//! Mutations never touch a published table: they copy it, modify the copy and
//! publish the copy. A reader holds on to the snapshot it looked up for as long
//! as it needs it; the old table is freed once the last reader drops it.

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::error::{RegistryError, UnwindError};
use crate::memory::SectionReader;

/// The initial capacity of the region table.
pub const EXTABS_SIZE: usize = 0x100;

/// The kinds of unwind sections which can be uploaded for a region.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Extab = 0,
    Exidx = 1,
    EhFrame = 2,
    EhFrameHdr = 3,
    DebugFrame = 4,
    DebugFrameHdr = 5,
}

impl SectionKind {
    pub const COUNT: usize = 6;

    pub const ALL: [SectionKind; Self::COUNT] = [
        SectionKind::Extab,
        SectionKind::Exidx,
        SectionKind::EhFrame,
        SectionKind::EhFrameHdr,
        SectionKind::DebugFrame,
        SectionKind::DebugFrameHdr,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The frame section for `.eh_frame` (`is_eh`) or `.debug_frame`.
    pub fn frame(is_eh: bool) -> Self {
        if is_eh {
            SectionKind::EhFrame
        } else {
            SectionKind::DebugFrame
        }
    }

    /// The binary search table section which indexes [`SectionKind::frame`].
    pub fn frame_hdr(is_eh: bool) -> Self {
        if is_eh {
            SectionKind::EhFrameHdr
        } else {
            SectionKind::DebugFrameHdr
        }
    }
}

/// Where one uploaded section lives, both in the sampled task and in the
/// mmap area which mirrors it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo {
    /// The section's virtual address in the sampled task. Zero if absent.
    pub addr: u64,
    pub length: u64,
    /// The offset of the section's bytes inside the mmap area.
    pub mmap_offset: u64,
}

/// A [`SectionInfo`] plus the cached PC range of the last FDE of the
/// section's search table ("tail info").
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtabInfo {
    pub addr: u64,
    pub length: u64,
    pub mmap_offset: u64,
    pub tf_start: u64,
    pub tf_end: u64,
}

impl ExtabInfo {
    fn from_upload(info: &SectionInfo) -> Self {
        if info.addr == 0 {
            return Self::default();
        }
        Self {
            addr: info.addr,
            length: info.length,
            mmap_offset: info.mmap_offset,
            tf_start: 0,
            tf_end: 0,
        }
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.length > 0
    }
}

/// The section descriptions for one mapped file, as uploaded by the daemon.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExceptionTableUpload {
    pub vm_start: u64,
    pub vm_end: u64,
    pub sections: [SectionInfo; SectionKind::COUNT],
}

impl ExceptionTableUpload {
    pub fn new(vm_start: u64, vm_end: u64) -> Self {
        Self {
            vm_start,
            vm_end,
            sections: Default::default(),
        }
    }

    pub fn with_section(mut self, kind: SectionKind, info: SectionInfo) -> Self {
        self.sections[kind.index()] = info;
        self
    }
}

/// A buffer owned by the profiling session which mirrors uploaded sections.
pub struct MmapArea<D: Deref<Target = [u8]>> {
    data: D,
    /// The `vm_start` keys of the regions which point into this buffer.
    ex_entries: Mutex<Vec<u64>>,
}

impl<D: Deref<Target = [u8]>> MmapArea<D> {
    pub fn new(data: D) -> Self {
        Self {
            data,
            ex_entries: Mutex::new(Vec::new()),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The regions registered from this buffer.
    pub fn ex_entries(&self) -> Vec<u64> {
        self.ex_entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One mapped executable file and its unwind sections.
pub struct ExceptionRegion<D: Deref<Target = [u8]>> {
    pub vm_start: u64,
    pub vm_end: u64,
    pub sections: [ExtabInfo; SectionKind::COUNT],
    /// The buffer holding the section bytes. The region does not keep it alive.
    mmap: Weak<MmapArea<D>>,
}

impl<D: Deref<Target = [u8]>> Clone for ExceptionRegion<D> {
    fn clone(&self) -> Self {
        Self {
            vm_start: self.vm_start,
            vm_end: self.vm_end,
            sections: self.sections,
            mmap: self.mmap.clone(),
        }
    }
}

impl<D: Deref<Target = [u8]>> std::fmt::Debug for ExceptionRegion<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionRegion")
            .field("vm_start", &crate::display_utils::HexNum(self.vm_start))
            .field("vm_end", &crate::display_utils::HexNum(self.vm_end))
            .field("sections", &self.sections)
            .finish()
    }
}

impl<D: Deref<Target = [u8]>> ExceptionRegion<D> {
    #[inline]
    pub fn section(&self, kind: SectionKind) -> &ExtabInfo {
        &self.sections[kind.index()]
    }

    fn is_backed_by(&self, mmap: &Arc<MmapArea<D>>) -> bool {
        std::ptr::eq(self.mmap.as_ptr(), Arc::as_ptr(mmap))
    }
}

/// A region looked up for unwinding, together with a strong reference to its
/// buffer so that the section bytes stay valid while they are being read.
pub struct RegionRef<D: Deref<Target = [u8]>> {
    pub region: ExceptionRegion<D>,
    mmap: Arc<MmapArea<D>>,
}

impl<D: Deref<Target = [u8]>> RegionRef<D> {
    #[inline]
    pub fn vm_start(&self) -> u64 {
        self.region.vm_start
    }

    #[inline]
    pub fn info(&self, kind: SectionKind) -> &ExtabInfo {
        self.region.section(kind)
    }

    /// A bounds-checked reader for one section. Absent sections, sections
    /// which wrap the address space and sections which claim to extend past
    /// the end of the buffer have no reader.
    pub fn section(&self, kind: SectionKind) -> Option<SectionReader<'_>> {
        let info = self.region.section(kind);
        if !info.is_present() {
            return None;
        }
        info.addr.checked_add(info.length)?;
        let start = usize::try_from(info.mmap_offset).ok()?;
        let len = usize::try_from(info.length).ok()?;
        let data = self.mmap.data().get(start..start.checked_add(len)?)?;
        Some(SectionReader::new(data, info.addr))
    }

    /// Require a section, reporting its absence as an unusable table.
    pub fn require_section(&self, kind: SectionKind) -> Result<SectionReader<'_>, UnwindError> {
        self.section(kind)
            .ok_or(UnwindError::TableNotExist(self.region.vm_start))
    }

    /// The section which contains `addr`, if any.
    pub fn section_containing(&self, addr: u64) -> Option<SectionReader<'_>> {
        SectionKind::ALL
            .iter()
            .filter_map(|kind| self.section(*kind))
            .find(|section| section.contains(addr, 0) && addr < section.end())
    }
}

/// One published generation of the region table.
pub struct RegionsData<D: Deref<Target = [u8]>> {
    /// Sorted by `vm_start`, no duplicates.
    entries: Vec<ExceptionRegion<D>>,
    size: usize,
}

impl<D: Deref<Target = [u8]>> RegionsData<D> {
    fn with_capacity(size: usize) -> Self {
        Self {
            entries: Vec::with_capacity(size),
            size,
        }
    }

    fn copy_with_capacity(&self, size: usize) -> Self {
        let mut entries = Vec::with_capacity(size.max(self.entries.len()));
        entries.extend(self.entries.iter().cloned());
        Self { entries, size }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of regions this generation was sized for.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn entries(&self) -> &[ExceptionRegion<D>] {
        &self.entries
    }

    pub fn search(&self, vm_start: u64) -> Option<&ExceptionRegion<D>> {
        let i = self
            .entries
            .binary_search_by_key(&vm_start, |r| r.vm_start)
            .ok()?;
        Some(&self.entries[i])
    }

    fn search_mut(&mut self, vm_start: u64) -> Option<&mut ExceptionRegion<D>> {
        let i = self
            .entries
            .binary_search_by_key(&vm_start, |r| r.vm_start)
            .ok()?;
        Some(&mut self.entries[i])
    }

    /// Insert keeping the table sorted. Returns false for a duplicate key.
    fn add(&mut self, region: ExceptionRegion<D>) -> bool {
        match self
            .entries
            .binary_search_by_key(&region.vm_start, |r| r.vm_start)
        {
            Ok(_) => false,
            Err(i) => {
                self.entries.insert(i, region);
                true
            }
        }
    }

    fn remove(&mut self, vm_start: u64) -> bool {
        match self.entries.binary_search_by_key(&vm_start, |r| r.vm_start) {
            Ok(i) => {
                self.entries.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    /// Whether the table is strictly sorted by `vm_start`.
    pub fn is_sorted(&self) -> bool {
        self.entries
            .windows(2)
            .all(|w| w[0].vm_start < w[1].vm_start)
    }
}

/// The registry of exception regions.
pub struct Registry<D: Deref<Target = [u8]>> {
    published: RwLock<Arc<RegionsData<D>>>,
    /// Serializes mutators. Readers never take it.
    writer: Mutex<()>,
}

impl<D: Deref<Target = [u8]>> Default for Registry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Deref<Target = [u8]>> Registry<D> {
    pub fn new() -> Self {
        Self {
            published: RwLock::new(Arc::new(RegionsData::with_capacity(EXTABS_SIZE))),
            writer: Mutex::new(()),
        }
    }

    /// The current generation of the table.
    pub fn snapshot(&self) -> Arc<RegionsData<D>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, rd: RegionsData<D>) {
        let old = std::mem::replace(
            &mut *self.published.write().unwrap_or_else(PoisonError::into_inner),
            Arc::new(rd),
        );
        // Readers which still hold `old` keep it alive; it is freed when the
        // last of them drops it.
        drop(old);
    }

    /// Reset the table, dropping every region.
    pub fn start(&self) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.publish(RegionsData::with_capacity(EXTABS_SIZE));
    }

    pub fn stop(&self) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.publish(RegionsData::with_capacity(0));
    }

    /// Register the sections of one mapped file, mirrored in `mmap`.
    pub fn set_extab(
        &self,
        upload: &ExceptionTableUpload,
        mmap: &Arc<MmapArea<D>>,
    ) -> Result<(), RegistryError> {
        if upload.vm_end <= upload.vm_start {
            return Err(RegistryError::EmptyRegion(upload.vm_start, upload.vm_end));
        }
        if let Some(si) = upload
            .sections
            .iter()
            .find(|si| si.addr != 0 && si.addr.checked_add(si.length).is_none())
        {
            return Err(RegistryError::SectionOverflow(si.addr, si.length));
        }

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let rd = self.snapshot();

        let mut new_size = rd.capacity().max(EXTABS_SIZE);
        if rd.len() >= new_size {
            new_size += new_size >> 1;
        }
        let mut rd_new = rd.copy_with_capacity(new_size);

        let mut sections = [ExtabInfo::default(); SectionKind::COUNT];
        for (ti, si) in sections.iter_mut().zip(upload.sections.iter()) {
            *ti = ExtabInfo::from_upload(si);
        }
        let region = ExceptionRegion {
            vm_start: upload.vm_start,
            vm_end: upload.vm_end,
            sections,
            mmap: Arc::downgrade(mmap),
        };

        if !rd_new.add(region) {
            return Err(RegistryError::AlreadyExists(upload.vm_start));
        }

        mmap.ex_entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(upload.vm_start);

        tracing::debug!(
            "registered exception region {:#x}-{:#x} ({} regions)",
            upload.vm_start,
            upload.vm_end,
            rd_new.len()
        );
        self.publish(rd_new);
        Ok(())
    }

    /// Remove one region by key. Returns whether it was registered.
    pub fn remove_region(&self, vm_start: u64) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let rd = self.snapshot();
        let Some(region) = rd.search(vm_start) else {
            return false;
        };
        if let Some(mmap) = region.mmap.upgrade() {
            mmap.ex_entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|key| *key != vm_start);
        }
        let mut rd_new = rd.copy_with_capacity(rd.capacity());
        rd_new.remove(vm_start);
        self.publish(rd_new);
        true
    }

    /// Remove every region which points into `mmap`. This must happen before
    /// the buffer is released. Returns the number of removed regions.
    pub fn delete_mmap(&self, mmap: &Arc<MmapArea<D>>) -> usize {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let keys = std::mem::take(
            &mut *mmap
                .ex_entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let rd = self.snapshot();
        if rd.is_empty() {
            return 0;
        }

        let new_size = rd.capacity().min(rd.len());
        let mut rd_new = rd.copy_with_capacity(new_size);
        let mut nr_removed = 0;
        for key in keys {
            let owned = rd_new
                .search(key)
                .map_or(false, |region| region.is_backed_by(mmap));
            if owned && rd_new.remove(key) {
                nr_removed += 1;
            }
        }

        tracing::debug!("removed {} exception regions of an mmap area", nr_removed);
        self.publish(rd_new);
        nr_removed
    }

    /// Cache the PC range of the last FDE of a section's search table.
    pub fn set_tail_info(&self, vm_start: u64, kind: SectionKind, tf_start: u64, tf_end: u64) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let rd = self.snapshot();
        if rd.is_empty() {
            return;
        }

        let mut rd_new = rd.copy_with_capacity(rd.capacity());
        let Some(region) = rd_new.search_mut(vm_start) else {
            return;
        };
        let ti = &mut region.sections[kind.index()];
        ti.tf_start = tf_start;
        ti.tf_end = tf_end;
        self.publish(rd_new);
    }

    /// Look up a region by the start of its mapping.
    pub fn search(&self, vm_start: u64) -> Option<RegionRef<D>> {
        let rd = self.snapshot();
        let region = rd.search(vm_start)?.clone();
        let mmap = region.mmap.upgrade()?;
        Some(RegionRef { region, mmap })
    }

    /// Look up a region which can be unwound with the ARM exception tables.
    pub fn get_extabs_ehabi(&self, vm_start: u64) -> Result<RegionRef<D>, UnwindError> {
        let r = self
            .search(vm_start)
            .ok_or(UnwindError::TableNotExist(vm_start))?;
        if !r.info(SectionKind::Exidx).is_present() {
            return Err(UnwindError::TableNotExist(vm_start));
        }
        Ok(r)
    }

    /// Look up a region which has a DWARF frame section together with its
    /// search table.
    pub fn get_dw_frames(&self, vm_start: u64) -> Result<RegionRef<D>, UnwindError> {
        let r = self
            .search(vm_start)
            .ok_or(UnwindError::TableNotExist(vm_start))?;
        if !is_frame_present(&r, true) && !is_frame_present(&r, false) {
            return Err(UnwindError::TableNotExist(vm_start));
        }
        Ok(r)
    }
}

/// Whether both the frame section and its search table are present.
pub(crate) fn is_frame_present<D: Deref<Target = [u8]>>(r: &RegionRef<D>, is_eh: bool) -> bool {
    r.info(SectionKind::frame(is_eh)).is_present()
        && r.info(SectionKind::frame_hdr(is_eh)).is_present()
}
