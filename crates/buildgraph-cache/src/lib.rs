pub mod cache;
pub mod file;
pub mod hub;
pub mod keydata;
pub mod memory;

pub use cache::*;
pub use file::*;
pub use hub::*;
pub use keydata::*;
pub use memory::*;
