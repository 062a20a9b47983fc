use crate::mem::loader::LazyLoader;
use crate::mem::{PageId, Ppn, TranslationEntry, VmContext, VmError};
use std::collections::VecDeque;

/// The paging policy seam: decides which frame services a fault. One
/// production implementation (the clock sweep below); tests substitute
/// deterministic doubles.
pub trait MemoryManager {
    /// Service a hard fault: free the TLB, obtain a frame, evict its
    /// occupant, load the faulting page, and install it in the core map and
    /// inverted page table. Returns the fresh translation for TLB insertion.
    fn swap_in(
        &mut self,
        id: PageId,
        loader: &LazyLoader,
        ctx: &mut VmContext,
    ) -> Result<TranslationEntry, VmError>;

    /// Return a frame to the free pool (address-space teardown path).
    fn release_frame(&mut self, ppn: Ppn);

    /// Evict whatever valid page occupies `ppn`: invalidate it, drop it from
    /// the inverted page table and the TLB, and persist it to swap if dirty.
    /// The eviction protocol is shared by every policy.
    fn swap_out(&mut self, ppn: Ppn, ctx: &mut VmContext) -> Result<(), VmError> {
        evict(ppn, ctx)
    }
}

fn evict(ppn: Ppn, ctx: &mut VmContext) -> Result<(), VmError> {
    let Some(page) = ctx.core_map.get(ppn).copied() else {
        return Ok(());
    };
    if !page.entry.flags.valid() {
        return Ok(());
    }
    // Publish the TLB line's used/dirty bits before reading them below.
    if let Some(index) = ctx.tlb.seek(page.entry.vpn) {
        ctx.tlb.invalidate_line(index, &mut ctx.core_map);
    }
    let page = *ctx.core_map.get(ppn).expect("frame emptied during eviction");
    ctx.page_table.remove(&page.id);
    ctx.core_map.mark_invalid(ppn);
    if page.entry.flags.dirty() {
        let index = ctx.swap.record(page.id, page.entry);
        ctx.swap.write_slot(index, ctx.phys.frame(ppn))?;
        log::debug!(
            "evicted dirty page {:?} from frame {ppn} to swap slot {index}",
            page.id
        );
    }
    Ok(())
}

/// Clock (second-chance) replacement. Frames never yet assigned are handed
/// out first; after that a circular hand sweeps the core map, clearing used
/// bits as it passes and taking the first un-used frame it finds.
pub struct ClockMemoryManager {
    free_frames: VecDeque<Ppn>,
    hand: Ppn,
}

impl ClockMemoryManager {
    pub fn new(num_frames: usize) -> Self {
        Self {
            free_frames: (0..num_frames).collect(),
            hand: 0,
        }
    }

    fn next_frame(&mut self, ctx: &mut VmContext) -> Ppn {
        if let Some(ppn) = self.free_frames.pop_front() {
            return ppn;
        }
        let num_frames = ctx.core_map.num_frames();
        // The first full pass clears every used bit, so a victim must
        // surface within two sweeps.
        for _ in 0..=2 * num_frames {
            let ppn = self.hand % num_frames;
            self.hand = (ppn + 1) % num_frames;
            match ctx.core_map.get_mut(ppn) {
                Some(page) if page.entry.flags.valid() => {
                    if page.entry.flags.used() {
                        page.entry.flags = page.entry.flags.with_used(false);
                    } else {
                        return ppn;
                    }
                }
                // invalid or empty frames are free for the taking
                _ => return ppn,
            }
        }
        panic!("clock sweep failed to find a victim frame");
    }
}

impl MemoryManager for ClockMemoryManager {
    fn swap_in(
        &mut self,
        id: PageId,
        loader: &LazyLoader,
        ctx: &mut VmContext,
    ) -> Result<TranslationEntry, VmError> {
        // Full flush before any frame changes hands: no stale mapping may
        // survive, and it publishes current used/dirty bits for the sweep.
        ctx.tlb.flush(&mut ctx.core_map);
        let ppn = self.next_frame(ctx);
        self.swap_out(ppn, ctx)?;
        let entry = loader.load(id, ppn, ctx)?;
        ctx.page_table.insert(id, ppn);
        ctx.core_map.install(id, entry);
        log::debug!("swapped in page {id:?} at frame {ppn}");
        Ok(entry)
    }

    fn release_frame(&mut self, ppn: Ppn) {
        if !self.free_frames.contains(&ppn) {
            self.free_frames.push_back(ppn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::swap::SwapSpace;
    use crate::mem::{CoreMap, InvertedPageTable, PhysMemory};
    use crate::tlb::TlbManager;
    use crate::user_program::image::Image;
    use crate::vfs::tempfs::TempFs;

    fn context(num_frames: usize) -> VmContext {
        VmContext {
            core_map: CoreMap::new(num_frames),
            page_table: InvertedPageTable::new(),
            tlb: TlbManager::new(),
            swap: SwapSpace::new(Box::new(TempFs::new())).unwrap(),
            phys: PhysMemory::new(num_frames),
        }
    }

    fn stack_loader() -> LazyLoader {
        LazyLoader::new(Image::from_sections(vec![]))
    }

    fn fill(
        manager: &mut ClockMemoryManager,
        ctx: &mut VmContext,
        loader: &LazyLoader,
        pages: usize,
    ) {
        for vpn in 0..pages {
            manager.swap_in(PageId::new(1, vpn), loader, ctx).unwrap();
        }
    }

    #[test]
    fn free_frames_are_used_in_order() {
        let mut ctx = context(3);
        let mut manager = ClockMemoryManager::new(3);
        let loader = stack_loader();
        for vpn in 0..3 {
            let entry = manager
                .swap_in(PageId::new(1, vpn), &loader, &mut ctx)
                .unwrap();
            assert_eq!(entry.ppn, vpn);
        }
        assert_eq!(ctx.page_table.len(), 3);
    }

    #[test]
    fn sweep_clears_used_bits_then_picks_first_unused() {
        let mut ctx = context(4);
        let mut manager = ClockMemoryManager::new(4);
        let loader = stack_loader();
        fill(&mut manager, &mut ctx, &loader, 4);
        for ppn in 0..4 {
            let page = ctx.core_map.get_mut(ppn).unwrap();
            page.entry.flags = page.entry.flags.with_used(true);
        }

        let victim = manager.next_frame(&mut ctx);
        // first pass cleared everything, second pass picks frame 0
        assert_eq!(victim, 0);
        for ppn in 1..4 {
            assert!(!ctx.core_map.get(ppn).unwrap().entry.flags.used());
        }
    }

    #[test]
    fn sweep_terminates_within_two_passes() {
        let mut ctx = context(4);
        let mut manager = ClockMemoryManager::new(4);
        let loader = stack_loader();
        fill(&mut manager, &mut ctx, &loader, 4);
        for _ in 0..10 {
            for ppn in 0..4 {
                let page = ctx.core_map.get_mut(ppn).unwrap();
                page.entry.flags = page.entry.flags.with_used(true);
            }
            // never panics, whatever the prior hand position
            manager.next_frame(&mut ctx);
        }
    }

    #[test]
    fn hand_advances_past_victim() {
        let mut ctx = context(4);
        let mut manager = ClockMemoryManager::new(4);
        let loader = stack_loader();
        fill(&mut manager, &mut ctx, &loader, 4);

        // every frame unreferenced: victims come out in circular order
        let first = manager.next_frame(&mut ctx);
        ctx.core_map.mark_invalid(first);
        let entry = loader
            .load(PageId::new(2, 0), first, &mut ctx)
            .unwrap();
        ctx.core_map.install(PageId::new(2, 0), entry);
        let second = manager.next_frame(&mut ctx);
        assert_eq!(first, 0);
        assert_eq!(second, 1);
    }

    #[test]
    fn eviction_writes_back_only_dirty_pages() {
        let mut ctx = context(2);
        let mut manager = ClockMemoryManager::new(2);
        let loader = stack_loader();
        fill(&mut manager, &mut ctx, &loader, 2);

        let page = ctx.core_map.get_mut(0).unwrap();
        page.entry.flags = page.entry.flags.with_dirty(true);
        let dirty_id = page.id;

        manager.swap_out(0, &mut ctx).unwrap();
        manager.swap_out(1, &mut ctx).unwrap();

        assert_eq!(ctx.swap.pages_written(), 1);
        assert!(ctx.swap.slot(&dirty_id).is_some());
        assert!(ctx.swap.slot(&PageId::new(1, 1)).is_none());
        assert!(ctx.page_table.is_empty());
    }

    #[test]
    fn swap_out_of_empty_frame_is_noop() {
        let mut ctx = context(2);
        let mut manager = ClockMemoryManager::new(2);
        manager.swap_out(0, &mut ctx).unwrap();
        assert_eq!(ctx.swap.pages_written(), 0);
    }

    #[test]
    fn faulting_past_capacity_evicts_exactly_one_frame() {
        let mut ctx = context(4);
        let mut manager = ClockMemoryManager::new(4);
        let loader = stack_loader();
        fill(&mut manager, &mut ctx, &loader, 4);

        let entry = manager
            .swap_in(PageId::new(1, 4), &loader, &mut ctx)
            .unwrap();
        // clock picked frame 0, the first unreferenced frame after the hand
        assert_eq!(entry.ppn, 0);
        assert!(ctx.page_table.lookup(PageId::new(1, 0)).is_none());
        for vpn in 1..5 {
            assert!(ctx.page_table.lookup(PageId::new(1, vpn)).is_some());
        }
    }
}
