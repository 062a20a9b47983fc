use crate::mem::{PageId, Ppn, TranslationEntry, VmContext, VmError, Vpn};
use crate::user_program::image::Image;

/// Where a code page lives inside the executable image.
#[derive(Debug, Clone, Copy)]
struct CodePage {
    section: usize,
    offset: usize,
}

/// Materializes page content on first fault: swap slot, image section, or
/// zero fill. Built once per process; the vpn → section table is a fixed
/// lookup, not a per-fault scan.
pub struct LazyLoader {
    image: Image,
    code_pages: Box<[Option<CodePage>]>,
}

impl LazyLoader {
    pub fn new(image: Image) -> Self {
        let mut code_pages = vec![None; image.num_pages()].into_boxed_slice();
        for section_index in 0..image.num_sections() {
            let section = image.section(section_index);
            for offset in 0..section.page_count() {
                code_pages[section.first_vpn() + offset] = Some(CodePage {
                    section: section_index,
                    offset,
                });
            }
        }
        Self { image, code_pages }
    }

    /// Number of virtual pages covered by the image's sections.
    pub fn image_pages(&self) -> usize {
        self.code_pages.len()
    }

    pub fn is_code_page(&self, vpn: Vpn) -> bool {
        self.code_pages.get(vpn).copied().flatten().is_some()
    }

    /// Fill frame `ppn` with the content of `id` and return its fresh
    /// translation. Resolution order: swap slot, image section, zero fill.
    pub fn load(
        &self,
        id: PageId,
        ppn: Ppn,
        ctx: &mut VmContext,
    ) -> Result<TranslationEntry, VmError> {
        if let Some(slot) = ctx.swap.slot(&id) {
            let mut entry = slot.entry;
            entry.ppn = ppn;
            entry.flags = entry
                .flags
                .with_valid(true)
                .with_used(false)
                .with_dirty(false);
            ctx.swap.read_slot(slot.index, ctx.phys.frame_mut(ppn))?;
            log::debug!("loader: restored page {id:?} from swap slot {}", slot.index);
            return Ok(entry);
        }
        match self.code_pages.get(id.vpn).copied().flatten() {
            Some(code) => {
                let section = self.image.section(code.section);
                section.load_page(code.offset, ctx.phys.frame_mut(ppn));
                Ok(TranslationEntry::new(id.vpn, ppn, section.read_only()))
            }
            None => {
                // never-touched stack or heap page
                ctx.phys.frame_mut(ppn).fill(0);
                Ok(TranslationEntry::new(id.vpn, ppn, false))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{CoreMap, InvertedPageTable, PhysMemory};
    use crate::mem::swap::SwapSpace;
    use crate::tlb::TlbManager;
    use crate::user_program::image::Section;
    use crate::vfs::tempfs::TempFs;
    use marrowos_shared::mem::PAGE_SIZE;

    fn context(num_frames: usize) -> VmContext {
        VmContext {
            core_map: CoreMap::new(num_frames),
            page_table: InvertedPageTable::new(),
            tlb: TlbManager::new(),
            swap: SwapSpace::new(Box::new(TempFs::new())).unwrap(),
            phys: PhysMemory::new(num_frames),
        }
    }

    fn two_section_image() -> Image {
        Image::from_sections(vec![
            Section::new(0, 2, true, vec![0x11; 2 * PAGE_SIZE]),
            Section::new(2, 1, false, vec![0x22; 100]),
        ])
    }

    #[test]
    fn section_table_is_prebuilt() {
        let loader = LazyLoader::new(two_section_image());
        assert_eq!(loader.image_pages(), 3);
        assert!(loader.is_code_page(0));
        assert!(loader.is_code_page(2));
        assert!(!loader.is_code_page(3));
    }

    #[test]
    fn code_page_load_honors_read_only() {
        let mut ctx = context(2);
        let loader = LazyLoader::new(two_section_image());

        let entry = loader.load(PageId::new(1, 1), 0, &mut ctx).unwrap();
        assert!(entry.flags.read_only());
        assert!(ctx.phys.frame(0).iter().all(|&b| b == 0x11));

        let entry = loader.load(PageId::new(1, 2), 1, &mut ctx).unwrap();
        assert!(!entry.flags.read_only());
        // short section data is zero-padded to a full page
        assert!(ctx.phys.frame(1)[..100].iter().all(|&b| b == 0x22));
        assert!(ctx.phys.frame(1)[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stack_page_is_zero_filled() {
        let mut ctx = context(1);
        ctx.phys.frame_mut(0).fill(0xDE);
        let loader = LazyLoader::new(Image::from_sections(vec![]));

        let entry = loader.load(PageId::new(1, 5), 0, &mut ctx).unwrap();
        assert!(entry.flags.valid());
        assert!(!entry.flags.read_only());
        assert!(ctx.phys.frame(0).iter().all(|&b| b == 0));
    }

    #[test]
    fn swap_slot_takes_precedence_over_section() {
        let mut ctx = context(1);
        let loader = LazyLoader::new(two_section_image());
        let id = PageId::new(1, 0);

        // pretend vpn 0 was dirtied and written out earlier
        let mut saved = TranslationEntry::new(0, 9, false);
        saved.flags = saved.flags.with_dirty(true).with_used(true);
        let index = ctx.swap.record(id, saved);
        ctx.swap.write_slot(index, &vec![0x77; PAGE_SIZE]).unwrap();

        let entry = loader.load(id, 0, &mut ctx).unwrap();
        assert_eq!(entry.ppn, 0);
        assert!(entry.flags.valid());
        assert!(!entry.flags.used());
        assert!(!entry.flags.dirty());
        assert!(ctx.phys.frame(0).iter().all(|&b| b == 0x77));
        // the slot stays pinned to the page
        assert!(ctx.swap.slot(&id).is_some());
    }
}
