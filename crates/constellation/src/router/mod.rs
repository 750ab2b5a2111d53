//! Queue Router for worker pool processes
//!
//! A pool binds to an ordered list of queues and runs independent pull-loops
//! against a [`Broker`]. Earlier queues take priority over later ones.

pub mod broker;
pub mod handler;
pub mod memory;
pub mod pool;
pub mod spool;

pub use broker::*;
pub use handler::*;
pub use memory::*;
pub use pool::*;
pub use spool::*;
