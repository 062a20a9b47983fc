use crate::sizes::KB;

// Page size is 1KB. This is a property of the simulated processor.
pub const PAGE_SIZE: usize = KB;

/// Number of stack pages allotted to a process above its executable image.
pub const STACK_PAGES: usize = 8;

#[inline]
pub fn page_from_address(addr: usize) -> usize {
    addr / PAGE_SIZE
}

#[inline]
pub fn offset_from_address(addr: usize) -> usize {
    addr % PAGE_SIZE
}

/// Compose a byte address from a page number and an offset within the page.
#[inline]
pub fn make_address(page: usize, offset: usize) -> usize {
    debug_assert!(offset < PAGE_SIZE);
    page * PAGE_SIZE + offset
}
