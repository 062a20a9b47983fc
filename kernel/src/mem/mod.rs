pub mod loader;
pub mod page_replacement;
pub mod swap;

use crate::tlb::TlbManager;
use bitbybit::bitfield;
use core::fmt;
use marrowos_shared::mem::PAGE_SIZE;
use std::collections::HashMap;
use swap::SwapSpace;
use thiserror::Error;

pub type Pid = u16;
pub type AtomicPid = core::sync::atomic::AtomicU16;

/// Virtual page number.
pub type Vpn = usize;
/// Physical frame number.
pub type Ppn = usize;

/// Uniquely names one page of one process's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub pid: Pid,
    pub vpn: Vpn,
}

impl PageId {
    pub fn new(pid: Pid, vpn: Vpn) -> Self {
        Self { pid, vpn }
    }
}

#[bitfield(u8, default = 0)]
pub struct PageFlags {
    #[bit(0, rw)]
    valid: bool,
    #[bit(1, rw)]
    read_only: bool,
    #[bit(2, rw)]
    used: bool,
    #[bit(3, rw)]
    dirty: bool,
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFlags")
            .field("valid", &self.valid())
            .field("read_only", &self.read_only())
            .field("used", &self.used())
            .field("dirty", &self.dirty())
            .finish()
    }
}

/// A virtual-to-physical mapping plus its status bits.
#[derive(Debug, Clone, Copy)]
pub struct TranslationEntry {
    pub vpn: Vpn,
    pub ppn: Ppn,
    pub flags: PageFlags,
}

impl TranslationEntry {
    /// A fresh, valid, clean and unreferenced mapping.
    pub fn new(vpn: Vpn, ppn: Ppn, read_only: bool) -> Self {
        Self {
            vpn,
            ppn,
            flags: PageFlags::DEFAULT.with_valid(true).with_read_only(read_only),
        }
    }
}

/// One core-map slot: the page a physical frame currently holds.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub id: PageId,
    pub entry: TranslationEntry,
}

/// Ground truth for what occupies each physical frame.
pub struct CoreMap {
    frames: Box<[Option<Page>]>,
}

impl CoreMap {
    pub fn new(num_frames: usize) -> Self {
        Self {
            frames: vec![None; num_frames].into_boxed_slice(),
        }
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn get(&self, ppn: Ppn) -> Option<&Page> {
        self.frames[ppn].as_ref()
    }

    pub fn get_mut(&mut self, ppn: Ppn) -> Option<&mut Page> {
        self.frames[ppn].as_mut()
    }

    /// Record that `entry.ppn` now holds `id`. The frame must not currently
    /// hold a valid page; violating this means two pages alias one frame,
    /// which is a kernel bug.
    pub fn install(&mut self, id: PageId, entry: TranslationEntry) {
        let ppn = entry.ppn;
        if let Some(existing) = &self.frames[ppn] {
            assert!(
                !existing.entry.flags.valid(),
                "frame {ppn} already holds a valid page"
            );
        }
        self.frames[ppn] = Some(Page { id, entry });
    }

    /// Clear the valid bit of whatever occupies `ppn`, if anything.
    pub fn mark_invalid(&mut self, ppn: Ppn) {
        if let Some(page) = &mut self.frames[ppn] {
            page.entry.flags = page.entry.flags.with_valid(false);
        }
    }
}

/// Maps page identity to the physical frame holding it. An entry is present
/// iff that frame's translation is currently valid.
#[derive(Default)]
pub struct InvertedPageTable {
    map: HashMap<PageId, Ppn>,
}

impl InvertedPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: PageId, ppn: Ppn) {
        let prev = self.map.insert(id, ppn);
        debug_assert!(prev.is_none(), "page {id:?} was already mapped");
    }

    pub fn lookup(&self, id: PageId) -> Option<Ppn> {
        self.map.get(&id).copied()
    }

    pub fn remove(&mut self, id: &PageId) -> Option<Ppn> {
        self.map.remove(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PageId, &Ppn)> {
        self.map.iter()
    }
}

/// The simulated machine's physical memory, one contiguous run of frames.
pub struct PhysMemory {
    mem: Box<[u8]>,
}

impl PhysMemory {
    pub fn new(num_frames: usize) -> Self {
        Self {
            mem: vec![0; num_frames * PAGE_SIZE].into_boxed_slice(),
        }
    }

    pub fn num_frames(&self) -> usize {
        self.mem.len() / PAGE_SIZE
    }

    pub fn frame(&self, ppn: Ppn) -> &[u8] {
        &self.mem[ppn * PAGE_SIZE..(ppn + 1) * PAGE_SIZE]
    }

    pub fn frame_mut(&mut self, ppn: Ppn) -> &mut [u8] {
        &mut self.mem[ppn * PAGE_SIZE..(ppn + 1) * PAGE_SIZE]
    }
}

/// The process-wide paging state, mutated only under the fault lock.
pub struct VmContext {
    pub core_map: CoreMap,
    pub page_table: InvertedPageTable,
    pub tlb: TlbManager,
    pub swap: SwapSpace,
    pub phys: PhysMemory,
}

impl VmContext {
    /// Look up the live translation for a page, if it is resident.
    pub fn page_entry(&self, id: PageId) -> Option<TranslationEntry> {
        let ppn = self.page_table.lookup(id)?;
        let page = self.core_map.get(ppn)?;
        if !page.entry.flags.valid() {
            return None;
        }
        Some(page.entry)
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    /// The swap file transferred less than a full page. The simulated disk
    /// has no transient-failure model, so this is fatal to the faulting
    /// process.
    #[error("swap file I/O error")]
    SwapIo,
    /// An address with no policy to resolve it: outside every image section,
    /// not a stack page, no swap slot.
    #[error("no translation possible for virtual page {0}")]
    InvalidAccess(Vpn),
    /// A write to a read-only page that the fault path could not fix up.
    #[error("write to read-only virtual page {0}")]
    ProtectionViolation(Vpn),
    #[error("file system error: {0}")]
    Fs(#[from] crate::vfs::Error),
}
