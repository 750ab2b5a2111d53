//! Services file parsing and substitution

mod services_file;
mod substitution;

pub use services_file::*;
pub use substitution::*;
