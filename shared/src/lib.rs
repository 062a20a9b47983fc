pub mod mem;
pub mod sizes;
