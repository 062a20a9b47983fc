use crate::mem::{PageId, TranslationEntry, VmError};
use crate::vfs::{FileHandle, FileSystem};
use marrowos_shared::mem::PAGE_SIZE;
use std::collections::HashMap;

pub const SWAP_FILE_NAME: &str = "SWAP";
/// Slots the swap file starts out with; it grows one slot at a time beyond
/// this.
pub const INITIAL_SWAP_PAGES: u32 = 32;

/// A page's persisted content: the saved translation it had when it was
/// first written out, and the slot holding its bytes. The slot stays pinned
/// to the page until the page is destroyed.
#[derive(Debug, Clone, Copy)]
pub struct SwapSlot {
    pub entry: TranslationEntry,
    pub index: u32,
}

/// Allocator for fixed-size slots in the backing swap file. Knows nothing of
/// paging policy; callers serialize access under the fault lock.
pub struct SwapSpace {
    fs: Box<dyn FileSystem + Send>,
    file: Option<FileHandle>,
    slots: HashMap<PageId, SwapSlot>,
    free_slots: Vec<u32>,
    /// high-water slot count; slots past it have never been allocated
    size: u32,
    pages_written: u64,
}

impl SwapSpace {
    /// Open (creating) the swap file and zero its initial slots.
    pub fn new(mut fs: Box<dyn FileSystem + Send>) -> Result<Self, VmError> {
        let file = fs.open(SWAP_FILE_NAME, true)?;
        let zeroes = [0u8; PAGE_SIZE];
        for index in 0..INITIAL_SWAP_PAGES {
            let written = fs.write(file, u64::from(index) * PAGE_SIZE as u64, &zeroes)?;
            if written != PAGE_SIZE {
                return Err(VmError::SwapIo);
            }
        }
        Ok(Self {
            fs,
            file: Some(file),
            slots: HashMap::new(),
            free_slots: Vec::new(),
            size: 0,
            pages_written: 0,
        })
    }

    /// Hand out a slot index: a reused one if any has been freed, otherwise
    /// the next never-used slot (the file grows on write).
    fn allocate_index(&mut self) -> u32 {
        if let Some(index) = self.free_slots.pop() {
            return index;
        }
        let index = self.size;
        self.size += 1;
        if index >= INITIAL_SWAP_PAGES {
            log::debug!("swap: growing past initial size, slot {index}");
        }
        index
    }

    /// Get-or-create the slot record for a page. An existing record is
    /// returned untouched: slot index and saved entry are stable for the
    /// page's lifetime.
    pub fn record(&mut self, id: PageId, entry: TranslationEntry) -> u32 {
        if let Some(slot) = self.slots.get(&id) {
            return slot.index;
        }
        let index = self.allocate_index();
        self.slots.insert(id, SwapSlot { entry, index });
        index
    }

    pub fn slot(&self, id: &PageId) -> Option<SwapSlot> {
        self.slots.get(id).copied()
    }

    /// Release a page's slot for reuse. Returns false if the page was never
    /// swapped.
    pub fn delete(&mut self, id: &PageId) -> bool {
        match self.slots.remove(id) {
            Some(slot) => {
                self.free_slots.push(slot.index);
                true
            }
            None => false,
        }
    }

    /// Read exactly one page from `index` into `buf`.
    pub fn read_slot(&mut self, index: u32, buf: &mut [u8]) -> Result<(), VmError> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let file = self.file.ok_or(VmError::SwapIo)?;
        let read = self
            .fs
            .read(file, u64::from(index) * PAGE_SIZE as u64, buf)?;
        if read != PAGE_SIZE {
            return Err(VmError::SwapIo);
        }
        Ok(())
    }

    /// Write exactly one page from `buf` to `index`.
    pub fn write_slot(&mut self, index: u32, buf: &[u8]) -> Result<(), VmError> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let file = self.file.ok_or(VmError::SwapIo)?;
        let written = self
            .fs
            .write(file, u64::from(index) * PAGE_SIZE as u64, buf)?;
        if written != PAGE_SIZE {
            return Err(VmError::SwapIo);
        }
        self.pages_written += 1;
        Ok(())
    }

    /// Total pages ever written out, for write-back accounting.
    pub fn pages_written(&self) -> u64 {
        self.pages_written
    }

    /// Number of pages currently holding a swap slot.
    pub fn live_slots(&self) -> usize {
        self.slots.len()
    }

    /// Close and delete the backing file. Idempotent; called once at kernel
    /// shutdown.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            self.fs.close(file);
            if self.fs.remove(SWAP_FILE_NAME).is_err() {
                log::debug!("swap: {SWAP_FILE_NAME} already removed");
            }
        }
    }
}
