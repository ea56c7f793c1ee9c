pub mod context;
pub mod error;
pub mod hasher;
pub mod iface;
pub mod invocation;
pub mod paths;
pub mod state;
pub mod tool;
pub mod transform;
pub mod value;

pub use context::*;
pub use error::*;
pub use hasher::*;
pub use iface::*;
pub use invocation::*;
pub use state::*;
pub use tool::*;
pub use transform::*;
pub use value::*;
