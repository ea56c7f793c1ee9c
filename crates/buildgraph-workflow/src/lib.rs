pub mod bridge;
pub mod run;

pub use bridge::*;
pub use run::*;
