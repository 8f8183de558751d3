//! # Player Error Types
//!
//! Error types for playback operations, with a mapping onto the two
//! public error categories surfaced to hosts through `ErrorOccurred`
//! notifications.

use amp_runtime::events::ErrorKind;
use thiserror::Error;

/// Errors that can occur during playback operations.
#[derive(Error, Debug)]
pub enum PlayerError {
    // ========================================================================
    // Source Errors
    // ========================================================================
    /// Failed to open or read the media source.
    #[error("Failed to open media source: {0}")]
    Resource(String),

    /// Operation requires a loaded source but none is loaded.
    #[error("No media loaded")]
    NoMedia,

    // ========================================================================
    // Filter Errors
    // ========================================================================
    /// Filter-graph description is invalid.
    #[error("Invalid filter description: {0}")]
    Filter(String),

    // ========================================================================
    // Decoding Errors
    // ========================================================================
    /// Error occurred while decoding a packet.
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Decoder could not be initialized for a stream.
    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    // ========================================================================
    // Playback Control Errors
    // ========================================================================
    /// Seek failed or seeking is not supported by this source.
    #[error("Seek failed: {0}")]
    Seek(String),

    /// Requested stream does not exist in the current source.
    #[error("Unknown stream: {0}")]
    InvalidStream(String),

    /// Playback rate must be positive and finite.
    #[error("Invalid playback rate: {0}")]
    InvalidSpeed(f64),

    /// The player control task has shut down.
    #[error("Player is closed")]
    Closed,

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    Config(String),

    // ========================================================================
    // Generic Errors
    // ========================================================================
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlayerError {
    /// Returns `true` if this error is fatal for the whole playback session.
    ///
    /// Session-fatal errors flip `MediaStatus` to `Invalid` and require a
    /// new `set_source` to recover.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, PlayerError::Resource(_) | PlayerError::Io(_))
    }

    /// Returns `true` if this error is fatal for a single track only.
    pub fn is_track_fatal(&self) -> bool {
        matches!(self, PlayerError::Filter(_) | PlayerError::DecoderInit(_))
    }

    /// Maps this error onto the public notification category.
    ///
    /// Returns `None` for errors recovered locally (per-packet decode
    /// failures) or rejected commands, which are never surfaced as
    /// `ErrorOccurred`.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PlayerError::Resource(_) | PlayerError::Io(_) => Some(ErrorKind::Resource),
            PlayerError::Filter(_) => Some(ErrorKind::Filter),
            _ => None,
        }
    }
}

/// Result type for playback operations.
pub type Result<T> = std::result::Result<T, PlayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_fatal_classification() {
        assert!(PlayerError::Resource("gone".into()).is_session_fatal());
        assert!(!PlayerError::Decode("bad packet".into()).is_session_fatal());
        assert!(!PlayerError::Filter("bad graph".into()).is_session_fatal());
    }

    #[test]
    fn track_fatal_classification() {
        assert!(PlayerError::Filter("bad graph".into()).is_track_fatal());
        assert!(PlayerError::DecoderInit("no codec".into()).is_track_fatal());
        assert!(!PlayerError::Resource("gone".into()).is_track_fatal());
    }

    #[test]
    fn public_kind_mapping() {
        assert_eq!(
            PlayerError::Resource("x".into()).kind(),
            Some(ErrorKind::Resource)
        );
        assert_eq!(
            PlayerError::Filter("x".into()).kind(),
            Some(ErrorKind::Filter)
        );
        // Recovered locally, never surfaced
        assert_eq!(PlayerError::Decode("x".into()).kind(), None);
        assert_eq!(PlayerError::InvalidSpeed(-1.0).kind(), None);
    }
}
