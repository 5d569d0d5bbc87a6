#![forbid(unsafe_code)]
//! RimeFS public API facade.
//!
//! Re-exports the mapping and snapshot engine from `rime-core` through a
//! stable external interface. This is the crate downstream consumers
//! depend on.

pub use rime_core::*;
