//! Host-side bridge for a linear-memory wasm guest evaluator.
//!
//! The guest exposes only numeric pointers and integers across its call
//! boundary; this crate encodes strings into the guest's linear memory,
//! tracks host objects referenced by integer handles, and exposes a single
//! operation: [`Bridge::evaluate`].

mod bridge;
mod codec;
mod error;
mod host;
mod memory;
mod slab;

pub use bridge::{Bridge, BridgeStats};
pub use error::{BridgeError, BridgeErrorKind};
pub use slab::{Handle, HeapSlab, HostValue, SlabStats};

pub const TOOL_NAME: &str = "gangway";
pub const VERSION: &str = "0.1";
