//! # Event Bus System
//!
//! Provides the notification surface of the playback engine using
//! `tokio::sync::broadcast`. The engine publishes typed [`PlayerEvent`]s;
//! any number of host subscribers drain them independently.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     emit      ┌───────────┐
//! │ Control task ├──────────────>│           │
//! └──────────────┘               │ EventBus  │     subscribe    ┌────────────┐
//! ┌──────────────┐     emit      │ (broadcast├─────────────────>│ Subscriber │
//! │ Sync task    ├──────────────>│  channel) │                  └────────────┘
//! └──────────────┘               └───────────┘
//! ```
//!
//! Decoded frames are deliberately *not* published here: frame delivery
//! transfers ownership and must exert backpressure, so it goes through the
//! engine's `FrameSink` instead. The bus carries discrete notifications only.
//!
//! ## Usage
//!
//! ```rust
//! use amp_runtime::events::{EventBus, PlayerEvent, PlaybackState};
//! use tokio::sync::broadcast::error::RecvError;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut stream = bus.subscribe();
//!
//! tokio::spawn(async move {
//!     loop {
//!         match stream.recv().await {
//!             Ok(event) => println!("Received: {:?}", event),
//!             Err(RecvError::Lagged(n)) => eprintln!("Missed {} events", n),
//!             Err(RecvError::Closed) => break,
//!         }
//!     }
//! });
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: subscriber was too slow and missed `n`
//!   events. Non-fatal; the subscriber keeps receiving new events.
//! - **`RecvError::Closed`**: all senders dropped, the player shut down.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that fall behind by more than this receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Notification Payload Types
// ============================================================================

/// Playback state of the engine.
///
/// Exactly one value at any time, owned exclusively by the control task.
/// Observers receive copies through [`PlayerEvent::StateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PlaybackState {
    /// No playback session is running. Initial state.
    #[default]
    Stopped,
    /// Frames are being decoded and delivered.
    Playing,
    /// Delivery is suspended; decode may keep buffering up to queue capacity.
    Paused,
}

/// Media status of the current source.
///
/// Independent axis from [`PlaybackState`]: `EndOfMedia` can co-occur
/// with `Paused` or `Playing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MediaStatus {
    /// No source set, or a source is still loading.
    #[default]
    NoMedia,
    /// Source opened successfully; streams are populated.
    Loaded,
    /// The last frame of the source has been decoded.
    EndOfMedia,
    /// Source could not be opened or is corrupt. Never auto-recovers;
    /// a new `set_source` is required.
    Invalid,
}

/// Public error categories surfaced through [`PlayerEvent::ErrorOccurred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Source cannot be opened or read. Fatal for the current session.
    Resource,
    /// Filter description invalid. Fatal for the affected track only.
    Filter,
}

/// Media kind of an elementary track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
}

impl MediaKind {
    /// All kinds, in routing order.
    pub const ALL: [MediaKind; 3] = [MediaKind::Video, MediaKind::Audio, MediaKind::Subtitle];
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// Describes one elementary track discovered in a source.
///
/// Streams are discovered once per source and are immutable; which stream
/// is *active* per kind is owned by the engine's stream selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Track index within the container.
    pub index: u32,
    /// Media kind of this track.
    pub kind: MediaKind,
    /// Codec name as reported by the backend (e.g., "h264", "aac").
    pub codec: String,
    /// Language tag, if the container carries one.
    pub language: Option<String>,
    /// Nominal frame rate for video tracks.
    pub frame_rate: Option<f64>,
    /// Sample rate for audio tracks.
    pub sample_rate: Option<u32>,
    /// Channel count for audio tracks.
    pub channels: Option<u16>,
}

impl StreamInfo {
    /// Create a descriptor with only index, kind and codec set.
    pub fn new(index: u32, kind: MediaKind, codec: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            codec: codec.into(),
            language: None,
            frame_rate: None,
            sample_rate: None,
            channels: None,
        }
    }

    /// Set the language tag.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Set the nominal video frame rate.
    pub fn with_frame_rate(mut self, rate: f64) -> Self {
        self.frame_rate = Some(rate);
        self
    }

    /// Set audio parameters.
    pub fn with_audio_params(mut self, sample_rate: u32, channels: u16) -> Self {
        self.sample_rate = Some(sample_rate);
        self.channels = Some(channels);
        self
    }
}

// ============================================================================
// Player Events
// ============================================================================

/// Notifications published by the playback engine.
///
/// One variant per discrete notification of the control surface. Every
/// accepted state transition emits exactly one corresponding event;
/// rejected commands emit nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum PlayerEvent {
    /// A new source was set.
    SourceChanged {
        /// Locator of the new source.
        url: String,
    },
    /// The playback state changed.
    StateChanged {
        /// The new state.
        state: PlaybackState,
    },
    /// The media status changed.
    MediaStatusChanged {
        /// The new status.
        status: MediaStatus,
    },
    /// A session- or track-fatal error occurred.
    ErrorOccurred {
        /// Error category.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
    /// The source duration became known or changed.
    DurationChanged {
        /// Duration in milliseconds.
        duration_ms: u64,
    },
    /// Seekability of the source became known or changed.
    SeekableChanged {
        /// Whether the source supports seeking.
        seekable: bool,
    },
    /// The playback rate changed.
    SpeedChanged {
        /// New rate (positive).
        rate: f64,
    },
    /// The nominal video frame rate became known or changed.
    VideoFrameRateChanged {
        /// Frames per second.
        rate: f64,
    },
    /// The active video stream changed (or the track was deactivated).
    VideoStreamChanged {
        /// New active stream, `None` when deactivated.
        stream: Option<StreamInfo>,
    },
    /// The active audio stream changed (or the track was deactivated).
    AudioStreamChanged {
        /// New active stream, `None` when deactivated.
        stream: Option<StreamInfo>,
    },
    /// The active subtitle stream changed (or the track was deactivated).
    SubtitleStreamChanged {
        /// New active stream, `None` when deactivated.
        stream: Option<StreamInfo>,
    },
    /// Playback started or resumed.
    Played {
        /// Position at which playback resumed (milliseconds).
        position_ms: u64,
    },
    /// Playback paused.
    Paused {
        /// Position when paused (milliseconds).
        position_ms: u64,
    },
    /// Playback stopped.
    Stopped {
        /// Position when stopped, always 0 after the reset (milliseconds).
        position_ms: u64,
    },
    /// A single-frame step completed.
    Stepped {
        /// Position of the stepped frame (milliseconds).
        position_ms: u64,
    },
    /// A seek resolved.
    Seeked {
        /// Achieved position (may differ from the requested target due to
        /// keyframe granularity), in milliseconds.
        position_ms: u64,
    },
    /// The frame filter description changed.
    FilterChanged {
        /// New filter description.
        desc: String,
    },
    /// The bitstream filter description changed.
    BitstreamFilterChanged {
        /// New bitstream filter description.
        desc: String,
    },
    /// Synchronized delivery was enabled or disabled.
    SyncedChanged {
        /// Whether pacing is now enabled.
        synced: bool,
    },
}

impl PlayerEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            PlayerEvent::SourceChanged { .. } => "Source changed",
            PlayerEvent::StateChanged { .. } => "Playback state changed",
            PlayerEvent::MediaStatusChanged { .. } => "Media status changed",
            PlayerEvent::ErrorOccurred { .. } => "Playback error",
            PlayerEvent::DurationChanged { .. } => "Duration changed",
            PlayerEvent::SeekableChanged { .. } => "Seekability changed",
            PlayerEvent::SpeedChanged { .. } => "Playback rate changed",
            PlayerEvent::VideoFrameRateChanged { .. } => "Video frame rate changed",
            PlayerEvent::VideoStreamChanged { .. } => "Video stream changed",
            PlayerEvent::AudioStreamChanged { .. } => "Audio stream changed",
            PlayerEvent::SubtitleStreamChanged { .. } => "Subtitle stream changed",
            PlayerEvent::Played { .. } => "Playback started",
            PlayerEvent::Paused { .. } => "Playback paused",
            PlayerEvent::Stopped { .. } => "Playback stopped",
            PlayerEvent::Stepped { .. } => "Stepped one frame",
            PlayerEvent::Seeked { .. } => "Seek resolved",
            PlayerEvent::FilterChanged { .. } => "Filter changed",
            PlayerEvent::BitstreamFilterChanged { .. } => "Bitstream filter changed",
            PlayerEvent::SyncedChanged { .. } => "Synchronization toggled",
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            PlayerEvent::ErrorOccurred { .. } => EventSeverity::Error,
            PlayerEvent::StateChanged { .. }
            | PlayerEvent::MediaStatusChanged { .. }
            | PlayerEvent::SourceChanged { .. } => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to player events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PlayerEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// When a subscriber falls behind by more than `capacity` events it
    /// receives a `RecvError::Lagged` error.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error when there are no active subscribers. A no-subscriber send is
    /// not a fault: the engine emits unconditionally and ignores the result.
    pub fn emit(&self, event: PlayerEvent) -> Result<usize, SendError<PlayerEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Each call creates an independent receiver that will receive all
    /// future events. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&PlayerEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with additional filtering.
///
/// Provides a more ergonomic API for consuming events with optional
/// filtering by event type or severity.
///
/// # Example
///
/// ```rust
/// use amp_runtime::events::{EventBus, EventStream, PlayerEvent};
///
/// let bus = EventBus::new(100);
/// let stream = EventStream::new(bus.subscribe())
///     .filter(|event| matches!(event, PlayerEvent::StateChanged { .. }));
/// ```
pub struct EventStream {
    receiver: Receiver<PlayerEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<PlayerEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Adds a filter function to this stream.
    ///
    /// Only events that match the filter will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PlayerEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n`
    /// events. Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<PlayerEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<PlayerEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_creation() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        let event = PlayerEvent::Stopped { position_ms: 0 };

        // Should error when no subscribers
        assert!(bus.emit(event).is_err());
    }

    #[tokio::test]
    async fn test_event_emission_with_subscribers() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe();

        let event = PlayerEvent::StateChanged {
            state: PlaybackState::Playing,
        };

        let result = bus.emit(event.clone());
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 1);

        let received = sub.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = PlayerEvent::MediaStatusChanged {
            status: MediaStatus::Loaded,
        };

        bus.emit(event.clone()).ok();

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, PlayerEvent::ErrorOccurred { .. }));

        // Filtered out
        bus.emit(PlayerEvent::Played { position_ms: 0 }).ok();

        // Passes through
        let error_event = PlayerEvent::ErrorOccurred {
            kind: ErrorKind::Resource,
            message: "cannot open".to_string(),
        };
        bus.emit(error_event.clone()).ok();

        let received = stream.recv().await.unwrap();
        assert_eq!(received, error_event);
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2); // Very small buffer
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(PlayerEvent::Seeked {
                position_ms: i * 1000,
            })
            .ok();
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn test_event_severity() {
        let error_event = PlayerEvent::ErrorOccurred {
            kind: ErrorKind::Filter,
            message: "bad graph".to_string(),
        };
        assert_eq!(error_event.severity(), EventSeverity::Error);

        let info_event = PlayerEvent::StateChanged {
            state: PlaybackState::Paused,
        };
        assert_eq!(info_event.severity(), EventSeverity::Info);

        let debug_event = PlayerEvent::Seeked { position_ms: 5000 };
        assert_eq!(debug_event.severity(), EventSeverity::Debug);
    }

    #[tokio::test]
    async fn test_event_serialization() {
        let event = PlayerEvent::VideoStreamChanged {
            stream: Some(
                StreamInfo::new(0, MediaKind::Video, "h264").with_frame_rate(25.0),
            ),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("h264"));

        let deserialized: PlayerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[test]
    fn test_stream_info_builder() {
        let stream = StreamInfo::new(1, MediaKind::Audio, "aac")
            .with_language("en")
            .with_audio_params(48000, 2);

        assert_eq!(stream.index, 1);
        assert_eq!(stream.kind, MediaKind::Audio);
        assert_eq!(stream.language.as_deref(), Some("en"));
        assert_eq!(stream.sample_rate, Some(48000));
        assert_eq!(stream.channels, Some(2));
        assert!(stream.frame_rate.is_none());
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe());

        assert!(stream.try_recv().is_none());
    }
}
