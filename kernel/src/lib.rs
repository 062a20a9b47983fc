//! Demand-paged virtual memory for a simulated machine: core map, inverted
//! page table, clock replacement, lazy loading, and a software-managed TLB.

pub mod mem;
pub mod system;
pub mod tlb;
pub mod user_program;
pub mod vfs;
