//! Workspace facade crate.
//!
//! This crate exists so host applications can depend on `amp-workspace` and
//! reach the individual workspace crates (`amp-runtime`, `amp-player`) through
//! a single dependency without wiring each crate individually.

pub use amp_player as player;
pub use amp_runtime as runtime;
