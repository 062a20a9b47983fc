use crate::mem::page_replacement::{ClockMemoryManager, MemoryManager};
use crate::mem::swap::SwapSpace;
use crate::mem::{
    AtomicPid, CoreMap, InvertedPageTable, PageId, PhysMemory, Pid, VmContext, VmError,
};
use crate::tlb::TlbManager;
use crate::vfs::FileSystem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Everything the fault lock protects: the paging policy and the state it
/// drives. Holding the two together lets a fault borrow the policy and the
/// context at once.
pub struct VmState {
    pub manager: Box<dyn MemoryManager + Send>,
    pub ctx: VmContext,
}

impl VmState {
    /// Release every resource an exiting process holds: its resident frames,
    /// its page-table entries, and its swap slots.
    pub fn destroy_process(&mut self, pid: Pid, num_pages: usize) {
        self.ctx.tlb.flush(&mut self.ctx.core_map);
        for vpn in 0..num_pages {
            let id = PageId::new(pid, vpn);
            if let Some(ppn) = self.ctx.page_table.remove(&id) {
                self.ctx.core_map.mark_invalid(ppn);
                self.manager.release_frame(ppn);
            }
            self.ctx.swap.delete(&id);
        }
        log::debug!("destroyed address space of process {pid}");
    }
}

/// The machine-wide kernel state, owned by whoever boots the kernel and
/// passed by reference to every process.
pub struct Kernel {
    state: Mutex<VmState>,
    next_pid: AtomicPid,
    page_faults: AtomicU64,
}

impl Kernel {
    /// Boot with clock replacement over `num_frames` physical frames, backing
    /// swap on `fs`.
    pub fn new(num_frames: usize, fs: Box<dyn FileSystem + Send>) -> Result<Self, VmError> {
        Self::with_manager(num_frames, fs, Box::new(ClockMemoryManager::new(num_frames)))
    }

    /// Boot with an explicit paging policy.
    pub fn with_manager(
        num_frames: usize,
        fs: Box<dyn FileSystem + Send>,
        manager: Box<dyn MemoryManager + Send>,
    ) -> Result<Self, VmError> {
        let ctx = VmContext {
            core_map: CoreMap::new(num_frames),
            page_table: InvertedPageTable::new(),
            tlb: TlbManager::new(),
            swap: SwapSpace::new(fs)?,
            phys: PhysMemory::new(num_frames),
        };
        Ok(Self {
            state: Mutex::new(VmState { manager, ctx }),
            next_pid: AtomicPid::new(1),
            page_faults: AtomicU64::new(0),
        })
    }

    /// Take the fault lock. Every fault, eviction, and teardown runs entirely
    /// under one acquisition of it.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, VmState> {
        self.state.lock().expect("fault lock poisoned")
    }

    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        // Pid 0 is reserved, so wrapping back around to it means exhaustion.
        assert!(pid != 0, "out of pids");
        pid
    }

    pub(crate) fn count_page_fault(&self) {
        self.page_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Hard faults serviced since boot.
    pub fn page_faults(&self) -> u64 {
        self.page_faults.load(Ordering::Relaxed)
    }

    /// Shut the machine down, deleting the swap file.
    pub fn shutdown(self) {
        let mut state = self
            .state
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        log::info!(
            "kernel shutdown: {} page faults serviced",
            self.page_faults.load(Ordering::Relaxed)
        );
        state.ctx.swap.close();
    }
}
