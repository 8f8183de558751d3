//! # Player Configuration
//!
//! Configuration types for the playback engine: queue capacities, pacing
//! tolerances, and delivery statistics.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Playback engine configuration.
///
/// Controls frame queue depths, pacing tolerances, and notification
/// buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Capacity of the video frame queue, in frames.
    ///
    /// Default: 16 (~0.6s at 25 fps).
    #[serde(default = "default_video_queue_frames")]
    pub video_queue_frames: usize,

    /// Capacity of the audio frame queue, in decoded chunks.
    ///
    /// Default: 32.
    #[serde(default = "default_audio_queue_frames")]
    pub audio_queue_frames: usize,

    /// Capacity of the subtitle frame queue.
    ///
    /// Default: 8.
    #[serde(default = "default_subtitle_queue_frames")]
    pub subtitle_queue_frames: usize,

    /// How late a frame may arrive (past its presentation time) and still
    /// be paced normally. Frames later than this are delivered immediately
    /// rather than dropped, to avoid stalling.
    ///
    /// Default: 80 ms.
    #[serde(default = "default_late_tolerance")]
    pub late_tolerance: Duration,

    /// Assumed video frame interval for stepping when the source does not
    /// report a frame rate.
    ///
    /// Default: 40 ms (25 fps).
    #[serde(default = "default_step_frame_interval")]
    pub step_frame_interval: Duration,

    /// Capacity of the per-track packet channel between the demux
    /// coordinator and a track pipeline.
    ///
    /// Default: 64 packets.
    #[serde(default = "default_packet_channel_capacity")]
    pub packet_channel_capacity: usize,

    /// Buffer size of the notification event bus.
    ///
    /// Default: 100 events.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            video_queue_frames: default_video_queue_frames(),
            audio_queue_frames: default_audio_queue_frames(),
            subtitle_queue_frames: default_subtitle_queue_frames(),
            late_tolerance: default_late_tolerance(),
            step_frame_interval: default_step_frame_interval(),
            packet_channel_capacity: default_packet_channel_capacity(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

impl PlayerConfig {
    /// Configuration optimized for low latency.
    ///
    /// - Shallow queues so control operations take effect quickly
    /// - Tight late tolerance
    pub fn low_latency() -> Self {
        Self {
            video_queue_frames: 4,
            audio_queue_frames: 8,
            subtitle_queue_frames: 4,
            late_tolerance: Duration::from_millis(20),
            packet_channel_capacity: 16,
            ..Default::default()
        }
    }

    /// Configuration optimized for smooth delivery over slow sources.
    ///
    /// - Deep queues to absorb decode jitter
    /// - Generous late tolerance
    pub fn smooth() -> Self {
        Self {
            video_queue_frames: 64,
            audio_queue_frames: 128,
            subtitle_queue_frames: 16,
            late_tolerance: Duration::from_millis(200),
            packet_channel_capacity: 256,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.video_queue_frames == 0 {
            return Err("video_queue_frames must be > 0".to_string());
        }

        if self.audio_queue_frames == 0 {
            return Err("audio_queue_frames must be > 0".to_string());
        }

        if self.subtitle_queue_frames == 0 {
            return Err("subtitle_queue_frames must be > 0".to_string());
        }

        if self.step_frame_interval.is_zero() {
            return Err("step_frame_interval must be > 0".to_string());
        }

        if self.packet_channel_capacity == 0 {
            return Err("packet_channel_capacity must be > 0".to_string());
        }

        if self.event_buffer_size == 0 {
            return Err("event_buffer_size must be > 0".to_string());
        }

        Ok(())
    }

    /// Queue capacity for the given media kind.
    pub fn queue_capacity(&self, kind: amp_runtime::events::MediaKind) -> usize {
        use amp_runtime::events::MediaKind;
        match kind {
            MediaKind::Video => self.video_queue_frames,
            MediaKind::Audio => self.audio_queue_frames,
            MediaKind::Subtitle => self.subtitle_queue_frames,
        }
    }
}

// ============================================================================
// Default Functions (for serde)
// ============================================================================

fn default_video_queue_frames() -> usize {
    16
}

fn default_audio_queue_frames() -> usize {
    32
}

fn default_subtitle_queue_frames() -> usize {
    8
}

fn default_late_tolerance() -> Duration {
    Duration::from_millis(80)
}

fn default_step_frame_interval() -> Duration {
    Duration::from_millis(40)
}

fn default_packet_channel_capacity() -> usize {
    64
}

fn default_event_buffer_size() -> usize {
    100
}

// ============================================================================
// Playback Statistics
// ============================================================================

/// Statistics about pipeline activity.
#[derive(Debug, Clone, Default)]
pub struct PlaybackStats {
    /// Packets routed by the demux coordinator.
    pub packets_routed: u64,
    /// Frames pushed into queues by track pipelines.
    pub frames_decoded: u64,
    /// Frames delivered to the consumer.
    pub frames_delivered: u64,
    /// Frames dropped because their generation was stale on arrival.
    pub frames_dropped_stale: u64,
    /// Frames delivered past their presentation time plus tolerance.
    pub late_deliveries: u64,
    /// Packets whose decode failed and was skipped.
    pub decode_errors: u64,
}

/// Shared statistics cell updated by the engine tasks and snapshotted by
/// `Player::stats()`.
pub type SharedStats = std::sync::Arc<parking_lot::Mutex<PlaybackStats>>;

impl PlaybackStats {
    /// Delivery ratio: delivered frames relative to decoded frames.
    pub fn delivery_ratio(&self) -> f64 {
        if self.frames_decoded == 0 {
            return 0.0;
        }
        self.frames_delivered as f64 / self.frames_decoded as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_runtime::events::MediaKind;

    #[test]
    fn test_default_config() {
        let config = PlayerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.video_queue_frames, 16);
        assert_eq!(config.late_tolerance, Duration::from_millis(80));
    }

    #[test]
    fn test_low_latency_config() {
        let config = PlayerConfig::low_latency();
        assert!(config.validate().is_ok());
        assert!(config.video_queue_frames < PlayerConfig::default().video_queue_frames);
        assert!(config.late_tolerance < PlayerConfig::default().late_tolerance);
    }

    #[test]
    fn test_smooth_config() {
        let config = PlayerConfig::smooth();
        assert!(config.validate().is_ok());
        assert!(config.video_queue_frames > PlayerConfig::default().video_queue_frames);
        assert!(config.late_tolerance > PlayerConfig::default().late_tolerance);
    }

    #[test]
    fn test_config_validation() {
        let mut config = PlayerConfig::default();
        assert!(config.validate().is_ok());

        config.video_queue_frames = 0;
        assert!(config.validate().is_err());
        config.video_queue_frames = 16;

        config.step_frame_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.step_frame_interval = Duration::from_millis(40);

        config.packet_channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_capacity_per_kind() {
        let config = PlayerConfig::default();
        assert_eq!(config.queue_capacity(MediaKind::Video), 16);
        assert_eq!(config.queue_capacity(MediaKind::Audio), 32);
        assert_eq!(config.queue_capacity(MediaKind::Subtitle), 8);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: PlayerConfig =
            serde_json::from_str(r#"{"video_queue_frames": 4}"#).unwrap();
        assert_eq!(config.video_queue_frames, 4);
        assert_eq!(config.audio_queue_frames, 32);
        assert_eq!(config.late_tolerance, Duration::from_millis(80));
    }

    #[test]
    fn test_delivery_ratio() {
        let stats = PlaybackStats {
            frames_decoded: 100,
            frames_delivered: 80,
            ..Default::default()
        };
        assert!((stats.delivery_ratio() - 0.8).abs() < f64::EPSILON);

        let empty = PlaybackStats::default();
        assert_eq!(empty.delivery_ratio(), 0.0);
    }
}
