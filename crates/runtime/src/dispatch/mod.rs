//! Dispatch loop: the single consumer of the admission queue.
//!
//! Split into focused submodules:
//! - `core`: Dispatcher struct, constructor, and shared-state accessors
//! - `execution`: the polling loop, per-request execution, and shutdown drain

mod core;
mod execution;

pub use self::core::{Dispatcher, SharedTopology};
