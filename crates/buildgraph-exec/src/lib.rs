pub mod run;
pub mod runtime;
pub mod sandbox;
pub mod stream;
pub mod subprocess;

pub use run::*;
pub use runtime::*;
pub use sandbox::*;
pub use stream::*;
pub use subprocess::*;
