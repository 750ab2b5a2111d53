//! Runtime components for process supervision

pub mod dependency;
pub mod launcher;
pub mod output;
pub mod plan;
pub mod policy;
pub mod process;
pub mod shutdown;
pub mod supervisor;

pub use dependency::*;
pub use launcher::*;
pub use output::*;
pub use plan::*;
pub use policy::*;
pub use process::*;
pub use shutdown::*;
pub use supervisor::*;
