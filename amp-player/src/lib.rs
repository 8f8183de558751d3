//! # Playback Engine
//!
//! Asynchronous media-playback controller: a playback state machine in
//! front of a frame-delivery pipeline.
//!
//! ## Overview
//!
//! This crate handles:
//! - The public [`Player`] control surface and its serialized command loop
//! - Demuxing coordination and per-track decode pipelines
//! - Bounded, generation-counted frame queues
//! - Clock-paced frame delivery with audio as the master clock
//!
//! Demuxing and decoding themselves are pluggable through the
//! [`traits::MediaBackend`] seam; the engine ships no codec code.

pub mod config;
pub mod demux;
pub mod error;
pub mod pipeline;
pub mod player;
pub mod queue;
pub mod select;
pub mod sync;
pub mod traits;

pub use config::{PlaybackStats, PlayerConfig};
pub use error::{PlayerError, Result};
pub use player::Player;
pub use traits::{
    ChannelSink, Frame, FrameSink, MediaBackend, MediaSource, NullSink, Packet,
};

pub use amp_runtime::events::{
    ErrorKind, EventStream, MediaKind, MediaStatus, PlaybackState, PlayerEvent, StreamInfo,
};
