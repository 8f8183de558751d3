//! # Runtime Module
//!
//! Provides foundational runtime infrastructure for the playback engine:
//! - Logging and tracing initialization
//! - Typed event bus for playback notifications
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the engine crate depends on.
//! It establishes the logging conventions and the event broadcasting
//! mechanism used to surface state changes to a host application.

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
pub use events::{EventBus, EventStream, PlayerEvent};
