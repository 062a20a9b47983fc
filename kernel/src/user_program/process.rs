use crate::mem::{PageId, Pid, TranslationEntry, VmError, Vpn};
use crate::mem::loader::LazyLoader;
use crate::system::{Kernel, VmState};
use crate::user_program::image::Image;
use marrowos_shared::mem::{offset_from_address, page_from_address, PAGE_SIZE, STACK_PAGES};

/// One user address space: a contiguous run of virtual pages covering the
/// executable image followed by the stack. Pages are materialized on first
/// touch by the process's [`LazyLoader`].
pub struct UserProcess {
    pid: Pid,
    num_pages: usize,
    loader: LazyLoader,
}

impl UserProcess {
    pub fn new(kernel: &Kernel, image: Image) -> Self {
        let pid = kernel.allocate_pid();
        let loader = LazyLoader::new(image);
        let num_pages = loader.image_pages() + STACK_PAGES;
        log::debug!("process {pid}: {num_pages} virtual pages");
        Self {
            pid,
            num_pages,
            loader,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Service a translation miss for `vpn`: bring the page into memory if it
    /// is not resident and cache its translation. The whole sequence runs
    /// under the fault lock.
    pub fn handle_translation_miss(
        &self,
        kernel: &Kernel,
        vpn: Vpn,
    ) -> Result<TranslationEntry, VmError> {
        if vpn >= self.num_pages {
            return Err(VmError::InvalidAccess(vpn));
        }
        let mut state = kernel.lock_state();
        let VmState { manager, ctx } = &mut *state;
        let id = PageId::new(self.pid, vpn);
        let entry = match ctx.page_entry(id) {
            Some(entry) => entry,
            None => {
                kernel.count_page_fault();
                manager.swap_in(id, &self.loader, ctx)?
            }
        };
        ctx.tlb.insert(entry, &mut ctx.core_map);
        Ok(entry)
    }

    /// Translate `vpn` for an access, faulting the page in on a miss. A write
    /// that still misses after the fault is a protection violation.
    pub fn translate(
        &self,
        kernel: &Kernel,
        vpn: Vpn,
        is_write: bool,
    ) -> Result<TranslationEntry, VmError> {
        {
            let mut state = kernel.lock_state();
            if let Some(entry) = state.ctx.tlb.find(vpn, is_write) {
                return Ok(entry);
            }
        }
        self.handle_translation_miss(kernel, vpn)?;
        let mut state = kernel.lock_state();
        state
            .ctx
            .tlb
            .find(vpn, is_write)
            .ok_or(VmError::ProtectionViolation(vpn))
    }

    /// Copy from this address space into `buf`, faulting pages in as needed.
    pub fn read_virtual_memory(
        &self,
        kernel: &Kernel,
        vaddr: usize,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        let mut copied = 0;
        while copied < buf.len() {
            let addr = vaddr + copied;
            let offset = offset_from_address(addr);
            let len = (PAGE_SIZE - offset).min(buf.len() - copied);
            let entry = self.translate(kernel, page_from_address(addr), false)?;
            let state = kernel.lock_state();
            let frame = state.ctx.phys.frame(entry.ppn);
            buf[copied..copied + len].copy_from_slice(&frame[offset..offset + len]);
            copied += len;
        }
        Ok(())
    }

    /// Copy `buf` into this address space, faulting pages in as needed.
    pub fn write_virtual_memory(
        &self,
        kernel: &Kernel,
        vaddr: usize,
        buf: &[u8],
    ) -> Result<(), VmError> {
        let mut copied = 0;
        while copied < buf.len() {
            let addr = vaddr + copied;
            let offset = offset_from_address(addr);
            let len = (PAGE_SIZE - offset).min(buf.len() - copied);
            let entry = self.translate(kernel, page_from_address(addr), true)?;
            let mut state = kernel.lock_state();
            let frame = state.ctx.phys.frame_mut(entry.ppn);
            frame[offset..offset + len].copy_from_slice(&buf[copied..copied + len]);
            copied += len;
        }
        Ok(())
    }

    /// Context-switch hook: drop the translation cache so the next thread
    /// starts from a clean one, publishing this thread's status bits.
    pub fn save_state(&self, kernel: &Kernel) {
        let mut state = kernel.lock_state();
        let VmState { ctx, .. } = &mut *state;
        ctx.tlb.flush(&mut ctx.core_map);
    }

    /// Tear down the address space: free its frames and swap slots.
    pub fn unload(&self, kernel: &Kernel) {
        let mut state = kernel.lock_state();
        state.destroy_process(self.pid, self.num_pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_program::image::Section;
    use crate::vfs::tempfs::TempFs;
    use marrowos_shared::mem::make_address;

    fn test_kernel(num_frames: usize) -> Kernel {
        Kernel::new(num_frames, Box::new(TempFs::new())).unwrap()
    }

    fn stack_only(kernel: &Kernel) -> UserProcess {
        UserProcess::new(kernel, Image::from_sections(vec![]))
    }

    #[test]
    fn pids_are_unique() {
        let kernel = test_kernel(2);
        let a = stack_only(&kernel);
        let b = stack_only(&kernel);
        assert_ne!(a.pid(), b.pid());
        assert_eq!(a.num_pages(), STACK_PAGES);
    }

    #[test]
    fn access_past_address_space_is_rejected() {
        let kernel = test_kernel(2);
        let process = stack_only(&kernel);
        assert!(matches!(
            process.translate(&kernel, STACK_PAGES, false),
            Err(VmError::InvalidAccess(vpn)) if vpn == STACK_PAGES
        ));
        let mut buf = [0u8; 16];
        assert!(matches!(
            process.read_virtual_memory(&kernel, make_address(STACK_PAGES, 0), &mut buf),
            Err(VmError::InvalidAccess(_))
        ));
    }

    #[test]
    fn write_to_read_only_section_is_rejected() {
        let kernel = test_kernel(2);
        let image = Image::from_sections(vec![Section::new(0, 1, true, vec![0x5A; PAGE_SIZE])]);
        let process = UserProcess::new(&kernel, image);

        let mut buf = [0u8; 4];
        process.read_virtual_memory(&kernel, 0, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; 4]);

        assert!(matches!(
            process.write_virtual_memory(&kernel, 0, &[1, 2, 3]),
            Err(VmError::ProtectionViolation(0))
        ));
    }

    #[test]
    fn copies_spanning_a_page_boundary() {
        let kernel = test_kernel(4);
        let process = stack_only(&kernel);
        let data: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        let vaddr = make_address(1, PAGE_SIZE - 100);

        process.write_virtual_memory(&kernel, vaddr, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        process.read_virtual_memory(&kernel, vaddr, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn repeated_access_hits_the_translation_cache() {
        let kernel = test_kernel(2);
        let process = stack_only(&kernel);
        let mut buf = [0u8; 1];
        process.read_virtual_memory(&kernel, 0, &mut buf).unwrap();
        process.read_virtual_memory(&kernel, 1, &mut buf).unwrap();
        process.read_virtual_memory(&kernel, 2, &mut buf).unwrap();
        assert_eq!(kernel.page_faults(), 1);
    }

    #[test]
    fn save_state_survives_reload() {
        let kernel = test_kernel(2);
        let process = stack_only(&kernel);
        process.write_virtual_memory(&kernel, 0, &[9, 9]).unwrap();
        process.save_state(&kernel);
        // the next access misses the cache but the page is still resident
        let faults = kernel.page_faults();
        let mut buf = [0u8; 2];
        process.read_virtual_memory(&kernel, 0, &mut buf).unwrap();
        assert_eq!(buf, [9, 9]);
        assert_eq!(kernel.page_faults(), faults);
    }
}
