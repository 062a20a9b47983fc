pub mod image;
pub mod process;
