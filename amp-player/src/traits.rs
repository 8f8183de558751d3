//! # Core Playback Traits
//!
//! Defines the data model of the playback engine and the abstractions for
//! its external collaborators: the media backend (container demuxing and
//! codec decoding), optional frame/packet filters, and the frame consumer.
//!
//! ## Architecture
//!
//! The engine uses a **producer-consumer model**:
//!
//! - **Producers**: the demux coordinator pulls [`Packet`]s from a
//!   [`Demuxer`] and routes them to per-track pipelines, which decode them
//!   through a [`FrameDecoder`] into bounded frame queues.
//! - **Consumer**: the sync controller pops queued [`Frame`]s and hands
//!   them to the host through a [`FrameSink`], paced against the reference
//!   clock when synchronization is enabled.
//!
//! The engine itself ships no demuxer or codec implementation; hosts plug
//! in a [`MediaBackend`] (typically wrapping a media-codec library).
//!
//! ## Threading Model
//!
//! All traits are `Send` so their implementations can move onto the
//! engine's background tasks. Decoder and demuxer methods take `&mut self`
//! because each instance is owned by exactly one task.

use crate::error::{PlayerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncSeek};

pub use amp_runtime::events::{MediaKind, StreamInfo};

// ============================================================================
// Media Source
// ============================================================================

/// Caller-supplied readable/seekable byte stream.
///
/// Supplied in place of a URL when the host owns the I/O (custom
/// protocols, in-memory containers, encrypted storage).
pub trait ByteReader: AsyncRead + AsyncSeek + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Sync + Unpin> ByteReader for T {}

/// Source of media data for demuxing and playback.
///
/// Immutable once playback has started; changing the source requires a
/// full pipeline reset through `set_source`.
pub enum MediaSource {
    /// Media located by a URL (file path, http(s), rtsp, ...).
    Url {
        /// Full locator of the media resource.
        url: String,
        /// Headers the backend should send for network sources
        /// (cookies and user-agent land here).
        headers: HashMap<String, String>,
    },

    /// Complete media container held in memory.
    Buffer {
        /// Raw container bytes.
        data: Bytes,
        /// Optional hint about the container format.
        format_hint: Option<String>,
    },

    /// Caller-supplied byte provider.
    Reader {
        /// Label used for notifications and logging.
        url: String,
        /// The readable/seekable stream.
        reader: Box<dyn ByteReader>,
    },
}

impl MediaSource {
    /// Create a URL source without headers.
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    /// Create an in-memory source.
    pub fn buffer(data: Bytes) -> Self {
        Self::Buffer {
            data,
            format_hint: None,
        }
    }

    /// Create a source backed by a caller-supplied byte provider.
    pub fn reader(url: impl Into<String>, reader: Box<dyn ByteReader>) -> Self {
        Self::Reader {
            url: url.into(),
            reader,
        }
    }

    /// Locator string used for notifications.
    pub fn location(&self) -> &str {
        match self {
            MediaSource::Url { url, .. } | MediaSource::Reader { url, .. } => url,
            MediaSource::Buffer { .. } => "<buffer>",
        }
    }

    /// Returns `true` if this source requires network access.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            MediaSource::Url { url, .. }
                if url.starts_with("http://")
                    || url.starts_with("https://")
                    || url.starts_with("rtsp://")
        )
    }

    /// Add a header for URL sources; no-op for other variants.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let MediaSource::Url { headers, .. } = &mut self {
            headers.insert(name.into(), value.into());
        }
        self
    }
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Url { url, headers } => f
                .debug_struct("Url")
                .field("url", url)
                .field("headers", &headers.len())
                .finish(),
            MediaSource::Buffer { data, format_hint } => f
                .debug_struct("Buffer")
                .field("len", &data.len())
                .field("format_hint", format_hint)
                .finish(),
            MediaSource::Reader { url, .. } => {
                f.debug_struct("Reader").field("url", url).finish()
            }
        }
    }
}

// ============================================================================
// Packets and Frames
// ============================================================================

/// A demuxed, still-encoded unit belonging to one track.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Track index within the container.
    pub track_index: u32,
    /// Media kind of the owning track.
    pub kind: MediaKind,
    /// Presentation timestamp relative to source start.
    pub pts: Duration,
    /// Whether this packet starts a keyframe.
    pub keyframe: bool,
    /// Encoded payload.
    pub data: Bytes,
}

impl Packet {
    /// Create a packet with the given coordinates and payload.
    pub fn new(track_index: u32, kind: MediaKind, pts: Duration, data: Bytes) -> Self {
        Self {
            track_index,
            kind,
            pts,
            keyframe: false,
            data,
        }
    }

    /// Mark this packet as a keyframe.
    pub fn keyframe(mut self) -> Self {
        self.keyframe = true;
        self
    }
}

/// A decoded video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    /// Presentation timestamp.
    pub pts: Duration,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel data in the backend's output format.
    pub data: Bytes,
}

/// A decoded chunk of audio.
///
/// Samples are interleaved f32 normalized to `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Presentation timestamp of the first sample.
    pub pts: Duration,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Interleaved PCM samples.
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Duration covered by this chunk.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() / self.channels as usize;
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }
}

/// A decoded subtitle cue.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleFrame {
    /// Presentation timestamp.
    pub pts: Duration,
    /// How long the cue stays visible.
    pub duration: Duration,
    /// Cue text.
    pub text: String,
}

/// A decoded unit produced by exactly one track pipeline.
///
/// Ownership transfers to the frame queue on push, then to the external
/// consumer on delivery; frames are never shared for mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Video(VideoFrame),
    Audio(AudioFrame),
    Subtitle(SubtitleFrame),
}

impl Frame {
    /// Presentation timestamp of this frame.
    pub fn pts(&self) -> Duration {
        match self {
            Frame::Video(f) => f.pts,
            Frame::Audio(f) => f.pts,
            Frame::Subtitle(f) => f.pts,
        }
    }

    /// Media kind of this frame.
    pub fn kind(&self) -> MediaKind {
        match self {
            Frame::Video(_) => MediaKind::Video,
            Frame::Audio(_) => MediaKind::Audio,
            Frame::Subtitle(_) => MediaKind::Subtitle,
        }
    }
}

// ============================================================================
// Media Info
// ============================================================================

/// Container-level metadata discovered when opening a source.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    /// All elementary tracks found in the source.
    pub streams: Vec<StreamInfo>,
    /// Total duration, if the container reports one.
    pub duration: Option<Duration>,
    /// Whether the source supports seeking.
    pub seekable: bool,
}

impl MediaInfo {
    /// Streams of the given kind, in container order.
    pub fn streams_of(&self, kind: MediaKind) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(move |s| s.kind == kind)
    }

    /// First stream of the given kind, the default selection.
    pub fn default_stream(&self, kind: MediaKind) -> Option<&StreamInfo> {
        self.streams_of(kind).next()
    }
}

/// An opened source: the demuxer plus what was discovered in it.
pub struct OpenedMedia {
    /// Demuxer positioned at the start of the source.
    pub demuxer: Box<dyn Demuxer>,
    /// Discovered container metadata.
    pub info: MediaInfo,
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Factory for demuxers, decoders and filters — the seam to the external
/// media-codec library.
///
/// `open` failures are session-fatal (`MediaStatus::Invalid`);
/// `create_decoder` failures deactivate the affected track only;
/// `create_filter`/`create_bitstream_filter` failures surface as filter
/// errors without touching playback state.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Open a source: probe the container and return its demuxer plus
    /// discovered streams, duration and seekability.
    async fn open(&self, source: MediaSource) -> Result<OpenedMedia>;

    /// Create a decoder for one elementary stream.
    fn create_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn FrameDecoder>>;

    /// Parse a filter-graph description into a frame filter.
    ///
    /// The default implementation rejects every description.
    fn create_filter(&self, desc: &str) -> Result<Box<dyn FrameFilter>> {
        Err(PlayerError::Filter(format!(
            "backend does not support frame filters: {desc:?}"
        )))
    }

    /// Parse a bitstream-filter description into a packet filter.
    ///
    /// The default implementation rejects every description.
    fn create_bitstream_filter(&self, desc: &str) -> Result<Box<dyn PacketFilter>> {
        Err(PlayerError::Filter(format!(
            "backend does not support bitstream filters: {desc:?}"
        )))
    }
}

/// Reads container packets in file order.
#[async_trait]
pub trait Demuxer: Send {
    /// Read the next packet. `Ok(None)` signals end of stream.
    ///
    /// # Errors
    ///
    /// A read error is fatal for the current source and surfaces as
    /// `MediaStatus::Invalid` plus a resource error notification.
    async fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Seek so that reading resumes from the nearest keyframe at or before
    /// `target`. Returns the achieved position, which may differ from the
    /// requested one due to keyframe granularity.
    async fn seek(&mut self, target: Duration) -> Result<Duration>;
}

/// Decodes packets of one elementary stream into frames.
#[async_trait]
pub trait FrameDecoder: Send {
    /// Decode one packet. A packet may yield zero or more frames
    /// (decoder delay, packed frames).
    async fn decode(&mut self, packet: Packet) -> Result<Vec<Frame>>;

    /// Discard buffered data and reset internal state. Required on seek
    /// and stream switch to avoid stale frames.
    fn flush(&mut self);
}

/// Transforms decoded frames (scaling, deinterlacing, overlays, ...).
pub trait FrameFilter: Send {
    /// Apply the filter. May absorb or multiply frames.
    fn apply(&mut self, frame: Frame) -> Result<Vec<Frame>>;
}

/// Transforms demuxed packets before decode.
pub trait PacketFilter: Send {
    /// Apply the filter. May absorb or multiply packets.
    fn apply(&mut self, packet: Packet) -> Result<Vec<Packet>>;
}

// ============================================================================
// Frame Sink
// ============================================================================

/// Receives delivered frames.
///
/// `deliver` is awaited by the sync controller: a slow sink backpressures
/// the whole pipeline instead of dropping frames. Implementations must not
/// block the thread.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Accept ownership of one delivered frame.
    async fn deliver(&self, frame: Frame);
}

/// [`FrameSink`] delivering into a bounded mpsc channel.
pub struct ChannelSink {
    sender: tokio::sync::mpsc::Sender<Frame>,
}

impl ChannelSink {
    /// Create a sink and the receiver the host drains.
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<Frame>) {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn deliver(&self, frame: Frame) {
        // Receiver dropped means the host stopped listening; discard.
        let _ = self.sender.send(frame).await;
    }
}

/// [`FrameSink`] that discards every frame. Useful for probing and tests.
pub struct NullSink;

#[async_trait]
impl FrameSink for NullSink {
    async fn deliver(&self, _frame: Frame) {}
}

// ============================================================================
// Tests
// ============================================================================
