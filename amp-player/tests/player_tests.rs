//! End-to-end playback tests against a scripted in-memory backend.

use amp_player::traits::{
    AudioFrame, Demuxer, Frame, FrameDecoder, FrameFilter, MediaInfo, OpenedMedia,
    SubtitleFrame, VideoFrame,
};
use amp_player::{
    ChannelSink, ErrorKind, EventStream, MediaBackend, MediaKind, MediaSource, MediaStatus,
    Packet, PlaybackState, Player, PlayerConfig, PlayerError, PlayerEvent, StreamInfo,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const FRAME_MS: u64 = 40;

// ============================================================================
// Scripted backend
// ============================================================================

/// Demuxer replaying an interleaved packet script. Seeks snap to the
/// nearest keyframe at or before the target.
struct ScriptedDemuxer {
    packets: Vec<Packet>,
    cursor: usize,
    reads: usize,
    fail_read_after: Option<usize>,
    seek_delay: Option<Duration>,
}

#[async_trait]
impl Demuxer for ScriptedDemuxer {
    async fn read_packet(&mut self) -> amp_player::Result<Option<Packet>> {
        self.reads += 1;
        if let Some(limit) = self.fail_read_after {
            if self.reads > limit {
                return Err(PlayerError::Resource("stream interrupted".into()));
            }
        }
        match self.packets.get(self.cursor) {
            Some(p) => {
                self.cursor += 1;
                Ok(Some(p.clone()))
            }
            None => Ok(None),
        }
    }

    async fn seek(&mut self, target: Duration) -> amp_player::Result<Duration> {
        if let Some(delay) = self.seek_delay {
            tokio::time::sleep(delay).await;
        }
        let idx = self
            .packets
            .iter()
            .rposition(|p| p.keyframe && p.pts <= target)
            .unwrap_or(0);
        self.cursor = idx;
        Ok(self.packets[idx].pts)
    }
}

/// Decoder producing exactly one frame of the packet's kind per packet.
struct KindDecoder;

#[async_trait]
impl FrameDecoder for KindDecoder {
    async fn decode(&mut self, packet: Packet) -> amp_player::Result<Vec<Frame>> {
        let frame = match packet.kind {
            MediaKind::Video => Frame::Video(VideoFrame {
                pts: packet.pts,
                width: 320,
                height: 240,
                data: Bytes::new(),
            }),
            MediaKind::Audio => Frame::Audio(AudioFrame {
                pts: packet.pts,
                sample_rate: 48000,
                channels: 2,
                samples: vec![0.0; 3840], // 40 ms stereo
            }),
            MediaKind::Subtitle => Frame::Subtitle(SubtitleFrame {
                pts: packet.pts,
                duration: Duration::from_millis(FRAME_MS),
                text: String::new(),
            }),
        };
        Ok(vec![frame])
    }

    fn flush(&mut self) {}
}

struct PassFilter;

impl FrameFilter for PassFilter {
    fn apply(&mut self, frame: Frame) -> amp_player::Result<Vec<Frame>> {
        Ok(vec![frame])
    }
}

struct MockBackend {
    packets: Vec<Packet>,
    info: MediaInfo,
    fail_open: bool,
    fail_decode_kind: Option<MediaKind>,
    accept_filters: bool,
    fail_read_after: Option<usize>,
    seek_delay: Option<Duration>,
}

impl MockBackend {
    /// `ticks` video+audio packet pairs, 40 ms apart, video keyframes
    /// every fifth frame. A second (packet-less) audio stream exists for
    /// switching tests.
    fn new(ticks: u64) -> Self {
        let mut packets = Vec::new();
        for i in 0..ticks {
            let pts = Duration::from_millis(i * FRAME_MS);
            let mut video = Packet::new(0, MediaKind::Video, pts, Bytes::new());
            if i % 5 == 0 {
                video = video.keyframe();
            }
            packets.push(video);
            packets.push(Packet::new(1, MediaKind::Audio, pts, Bytes::new()));
        }
        let info = MediaInfo {
            streams: vec![
                StreamInfo::new(0, MediaKind::Video, "h264").with_frame_rate(25.0),
                StreamInfo::new(1, MediaKind::Audio, "aac").with_language("eng"),
                StreamInfo::new(2, MediaKind::Audio, "aac").with_language("fra"),
            ],
            duration: Some(Duration::from_millis(ticks * FRAME_MS)),
            seekable: true,
        };
        Self {
            packets,
            info,
            fail_open: false,
            fail_decode_kind: None,
            accept_filters: false,
            fail_read_after: None,
            seek_delay: None,
        }
    }
}

#[async_trait]
impl MediaBackend for MockBackend {
    async fn open(&self, _source: MediaSource) -> amp_player::Result<OpenedMedia> {
        if self.fail_open {
            return Err(PlayerError::Resource("no such file".into()));
        }
        Ok(OpenedMedia {
            demuxer: Box::new(ScriptedDemuxer {
                packets: self.packets.clone(),
                cursor: 0,
                reads: 0,
                fail_read_after: self.fail_read_after,
                seek_delay: self.seek_delay,
            }),
            info: self.info.clone(),
        })
    }

    fn create_decoder(
        &self,
        stream: &StreamInfo,
    ) -> amp_player::Result<Box<dyn FrameDecoder>> {
        if self.fail_decode_kind == Some(stream.kind) {
            return Err(PlayerError::DecoderInit("no codec".into()));
        }
        Ok(Box::new(KindDecoder))
    }

    fn create_filter(&self, desc: &str) -> amp_player::Result<Box<dyn FrameFilter>> {
        if self.accept_filters {
            Ok(Box::new(PassFilter))
        } else {
            Err(PlayerError::Filter(format!("unknown filter: {desc}")))
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn fixture(backend: MockBackend) -> (Player, mpsc::Receiver<Frame>, EventStream) {
    let (sink, frames) = ChannelSink::new(512);
    let player = Player::new(
        Arc::new(backend),
        Arc::new(sink),
        PlayerConfig::default(),
    )
    .expect("default config is valid");
    let events = player.events();
    (player, frames, events)
}

async fn wait_for<F>(events: &mut EventStream, pred: F) -> PlayerEvent
where
    F: Fn(&PlayerEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(e) if pred(&e) => return e,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn load(player: &Player, events: &mut EventStream) {
    player
        .set_source(Some(MediaSource::url("file:///clip.mp4")))
        .await
        .unwrap();
    wait_for(events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::Loaded
            }
        )
    })
    .await;
}

async fn next_frame(frames: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("sink closed")
}

async fn assert_no_frames(frames: &mut mpsc::Receiver<Frame>, quiet: Duration) {
    assert!(
        timeout(quiet, frames.recv()).await.is_err(),
        "expected no frame deliveries"
    );
}

// ============================================================================
// Loading
// ============================================================================

#[tokio::test]
async fn test_load_reports_streams_duration_and_seekability() {
    let (player, _frames, mut events) = fixture(MockBackend::new(10));

    player
        .set_source(Some(MediaSource::url("file:///clip.mp4")))
        .await
        .unwrap();

    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::SourceChanged { url } if url.as_str() == "file:///clip.mp4")
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::DurationChanged { duration_ms: 400 })
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::SeekableChanged { seekable: true })
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::VideoFrameRateChanged { rate } if *rate == 25.0)
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::Loaded
            }
        )
    })
    .await;

    assert_eq!(player.state(), PlaybackState::Stopped);
    assert_eq!(player.duration(), Some(Duration::from_millis(400)));
    assert!(player.seekable());
    assert_eq!(player.available_streams(MediaKind::Audio).len(), 2);
    assert_eq!(
        player.current_stream(MediaKind::Video).map(|s| s.index),
        Some(0)
    );
    assert_eq!(
        player.current_stream(MediaKind::Audio).map(|s| s.index),
        Some(1)
    );
    assert!(player.current_stream(MediaKind::Subtitle).is_none());
}

#[tokio::test]
async fn test_open_failure_marks_source_invalid() {
    let mut backend = MockBackend::new(10);
    backend.fail_open = true;
    let (player, _frames, mut events) = fixture(backend);

    player
        .set_source(Some(MediaSource::url("file:///missing.mp4")))
        .await
        .unwrap();

    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::Invalid
            }
        )
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::ErrorOccurred {
                kind: ErrorKind::Resource,
                ..
            }
        )
    })
    .await;

    // Playback commands on invalid media are ignored.
    player.play().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(player.state(), PlaybackState::Stopped);
}

#[tokio::test]
async fn test_unloading_resets_to_no_media() {
    let (player, _frames, mut events) = fixture(MockBackend::new(10));
    load(&player, &mut events).await;

    player.set_source(None).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::NoMedia
            }
        )
    })
    .await;

    assert!(player.source().is_none());
    assert!(player.duration().is_none());
    assert!(player.available_streams(MediaKind::Video).is_empty());
    assert_eq!(player.position(), Duration::ZERO);
}

// ============================================================================
// Transport
// ============================================================================

#[tokio::test]
async fn test_play_delivers_ordered_frames_until_end_of_media() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(6));
    load(&player, &mut events).await;

    player.set_synced(false).await.unwrap();
    player.play().await.unwrap();

    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::StateChanged {
                state: PlaybackState::Playing
            }
        )
    })
    .await;

    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::EndOfMedia
            }
        )
    })
    .await;

    // 6 video + 6 audio frames, monotonic timestamps per kind.
    let mut video_pts = Vec::new();
    let mut audio_pts = Vec::new();
    while let Ok(Some(frame)) = timeout(Duration::from_millis(200), frames.recv()).await {
        match frame {
            Frame::Video(f) => video_pts.push(f.pts),
            Frame::Audio(f) => audio_pts.push(f.pts),
            Frame::Subtitle(_) => panic!("no subtitle track in fixture"),
        }
    }
    assert_eq!(video_pts.len(), 6);
    assert_eq!(audio_pts.len(), 6);
    assert!(video_pts.windows(2).all(|w| w[0] < w[1]));
    assert!(audio_pts.windows(2).all(|w| w[0] < w[1]));

    // Reaching the end changes the media status only; the transport
    // stays in Playing until told otherwise.
    assert_eq!(player.media_status(), MediaStatus::EndOfMedia);
    assert_eq!(player.state(), PlaybackState::Playing);
}

#[tokio::test]
async fn test_end_of_media_keeps_playing_state_until_stop() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(4));
    load(&player, &mut events).await;
    player.set_synced(false).await.unwrap();

    player.play().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::EndOfMedia
            }
        )
    })
    .await;
    while timeout(Duration::from_millis(100), frames.recv())
        .await
        .is_ok()
    {}

    assert_eq!(player.state(), PlaybackState::Playing);
    // No Stopped transition may follow from the end alone.
    assert!(
        timeout(Duration::from_millis(200), async {
            loop {
                if let Ok(PlayerEvent::StateChanged {
                    state: PlaybackState::Stopped,
                }) = events.recv().await
                {
                    return;
                }
            }
        })
        .await
        .is_err(),
        "end of media must not stop the transport"
    );

    // An explicit stop transitions the state but leaves the media
    // status at EndOfMedia.
    player.stop().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::StateChanged {
                state: PlaybackState::Stopped
            }
        )
    })
    .await;
    assert_eq!(player.state(), PlaybackState::Stopped);
    assert_eq!(player.media_status(), MediaStatus::EndOfMedia);
}

#[tokio::test]
async fn test_play_after_end_of_media_restarts_from_zero() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(4));
    load(&player, &mut events).await;
    player.set_synced(false).await.unwrap();

    player.play().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::EndOfMedia
            }
        )
    })
    .await;
    while timeout(Duration::from_millis(100), frames.recv())
        .await
        .is_ok()
    {}

    player.play().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::Loaded
            }
        )
    })
    .await;

    let first = next_frame(&mut frames).await;
    assert_eq!(first.pts(), Duration::ZERO);
}

#[tokio::test]
async fn test_pause_halts_delivery_and_play_resumes() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(100));
    load(&player, &mut events).await;

    player.play().await.unwrap();
    let _ = next_frame(&mut frames).await;

    player.pause().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::StateChanged {
                state: PlaybackState::Paused
            }
        )
    })
    .await;
    assert_eq!(player.state(), PlaybackState::Paused);

    // Drain frames delivered before the pause landed, then silence.
    while timeout(Duration::from_millis(150), frames.recv())
        .await
        .is_ok()
    {}
    assert_no_frames(&mut frames, Duration::from_millis(200)).await;

    player.play().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::StateChanged {
                state: PlaybackState::Playing
            }
        )
    })
    .await;
    let _ = next_frame(&mut frames).await;
}

#[tokio::test]
async fn test_pause_without_playing_is_ignored() {
    let (player, _frames, mut events) = fixture(MockBackend::new(10));
    load(&player, &mut events).await;

    // Loaded but never played: pause has nothing to halt.
    player.pause().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(player.state(), PlaybackState::Stopped);
    assert!(
        timeout(Duration::from_millis(100), async {
            loop {
                if let Ok(PlayerEvent::StateChanged {
                    state: PlaybackState::Paused,
                }) = events.recv().await
                {
                    return;
                }
            }
        })
        .await
        .is_err(),
        "pause from Stopped must not transition"
    );
}

#[tokio::test]
async fn test_stop_resets_position_to_zero() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(100));
    load(&player, &mut events).await;

    player.play().await.unwrap();
    let _ = next_frame(&mut frames).await;

    player.stop().await.unwrap();
    let stopped = wait_for(&mut events, |e| matches!(e, PlayerEvent::Stopped { .. })).await;
    assert!(matches!(stopped, PlayerEvent::Stopped { position_ms: 0 }));
    assert_eq!(player.state(), PlaybackState::Stopped);
    assert_eq!(player.position(), Duration::ZERO);
}

#[tokio::test]
async fn test_speed_is_validated_and_observable() {
    let (player, _frames, mut events) = fixture(MockBackend::new(10));
    load(&player, &mut events).await;

    assert!(matches!(
        player.set_speed(0.0).await,
        Err(PlayerError::InvalidSpeed(_))
    ));
    assert!(matches!(
        player.set_speed(f64::NAN).await,
        Err(PlayerError::InvalidSpeed(_))
    ));

    player.set_speed(2.0).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::SpeedChanged { rate } if *rate == 2.0)
    })
    .await;
    assert_eq!(player.speed(), 2.0);
}

#[tokio::test]
async fn test_synced_toggle_is_observable() {
    let (player, _frames, mut events) = fixture(MockBackend::new(10));
    load(&player, &mut events).await;

    assert!(player.synced());
    player.set_synced(false).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::SyncedChanged { synced: false })
    })
    .await;
    assert!(!player.synced());
}

// ============================================================================
// Seeking and stepping
// ============================================================================

#[tokio::test]
async fn test_seek_snaps_to_keyframe_and_resumes_there() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(20));
    load(&player, &mut events).await;

    player.seek(Duration::from_millis(450)).await.unwrap();
    // Video keyframes sit at multiples of 200 ms.
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::Seeked { position_ms: 400 })
    })
    .await;
    assert_eq!(player.position(), Duration::from_millis(400));

    player.set_synced(false).await.unwrap();
    player.play().await.unwrap();
    let first = next_frame(&mut frames).await;
    assert_eq!(first.pts(), Duration::from_millis(400));
}

#[tokio::test]
async fn test_latest_queued_seek_wins() {
    let (player, _frames, mut events) = fixture(MockBackend::new(20));
    load(&player, &mut events).await;

    for target_ms in [100u64, 250, 450] {
        player.seek(Duration::from_millis(target_ms)).await.unwrap();
    }

    // Whatever got coalesced, the last resolved seek must be the last
    // requested target (450 snaps to the 400 ms keyframe).
    let mut last = wait_for(&mut events, |e| matches!(e, PlayerEvent::Seeked { .. })).await;
    loop {
        match timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(e @ PlayerEvent::Seeked { .. })) => last = e,
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(matches!(last, PlayerEvent::Seeked { position_ms: 400 }));
    assert_eq!(player.position(), Duration::from_millis(400));
}

#[tokio::test]
async fn test_queued_source_change_abandons_pending_seek() {
    let mut backend = MockBackend::new(20);
    backend.seek_delay = Some(Duration::from_millis(150));
    let (player, _frames, mut events) = fixture(backend);
    load(&player, &mut events).await;

    // Park the control task inside the slow demuxer seek, then queue a
    // second seek and a source change behind it.
    player.seek(Duration::from_millis(50)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    player.seek(Duration::from_millis(300)).await.unwrap();
    player.set_source(None).await.unwrap();

    // The in-flight seek resolves (50 snaps to the keyframe at 0), the
    // queued one is abandoned by the source change.
    let mut saw_first_seek = false;
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(PlayerEvent::Seeked { position_ms: 0 }) => saw_first_seek = true,
                Ok(PlayerEvent::Seeked { position_ms }) => {
                    panic!("abandoned seek resolved at {position_ms} ms")
                }
                Ok(PlayerEvent::MediaStatusChanged {
                    status: MediaStatus::NoMedia,
                }) => return,
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for the source change");
    assert!(saw_first_seek);
    assert!(player.source().is_none());
}

#[tokio::test]
async fn test_step_forward_delivers_one_frame_without_changing_state() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(20));
    load(&player, &mut events).await;

    player.step_forward().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::Stepped { position_ms: 0 })
    })
    .await;
    // Stepping moves the picture, not the transport.
    assert_eq!(player.state(), PlaybackState::Stopped);

    let frame = next_frame(&mut frames).await;
    assert_eq!(frame.kind(), MediaKind::Video);
    assert_eq!(frame.pts(), Duration::ZERO);
    assert_no_frames(&mut frames, Duration::from_millis(200)).await;

    player.step_forward().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::Stepped { position_ms } if *position_ms == FRAME_MS)
    })
    .await;
    let frame = next_frame(&mut frames).await;
    assert_eq!(frame.pts(), Duration::from_millis(FRAME_MS));
}

#[tokio::test]
async fn test_step_backward_returns_to_earlier_frame() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(20));
    load(&player, &mut events).await;

    player.step_forward().await.unwrap();
    player.step_forward().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::Stepped { position_ms } if *position_ms == FRAME_MS)
    })
    .await;
    let _ = next_frame(&mut frames).await;
    let _ = next_frame(&mut frames).await;

    player.step_backward().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::Stepped { position_ms: 0 })
    })
    .await;
    let frame = next_frame(&mut frames).await;
    assert_eq!(frame.pts(), Duration::ZERO);
    assert_eq!(player.position(), Duration::ZERO);
}

#[tokio::test]
async fn test_step_backward_lands_one_interval_back() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(20));
    load(&player, &mut events).await;

    // Walk forward to 320 ms, past the keyframe at 200 ms.
    for i in 0..9u64 {
        player.step_forward().await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, PlayerEvent::Stepped { position_ms } if *position_ms == i * FRAME_MS)
        })
        .await;
        let _ = next_frame(&mut frames).await;
    }
    assert_eq!(player.position(), Duration::from_millis(320));

    // The demuxer rewinds to the keyframe at 200 ms; the frames up to
    // the step target must not reach the sink.
    player.step_backward().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::Stepped { position_ms: 280 })
    })
    .await;
    let frame = next_frame(&mut frames).await;
    assert_eq!(frame.pts(), Duration::from_millis(280));
    assert_eq!(player.position(), Duration::from_millis(280));
}

#[tokio::test]
async fn test_step_is_ignored_while_playing() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(100));
    load(&player, &mut events).await;

    player.play().await.unwrap();
    let _ = next_frame(&mut frames).await;

    player.step_forward().await.unwrap();
    player.step_backward().await.unwrap();
    assert!(
        timeout(Duration::from_millis(200), async {
            loop {
                if let Ok(PlayerEvent::Stepped { .. }) = events.recv().await {
                    return;
                }
            }
        })
        .await
        .is_err(),
        "steps must be rejected during playback"
    );
    assert_eq!(player.state(), PlaybackState::Playing);
}

// ============================================================================
// Stream selection
// ============================================================================

#[tokio::test]
async fn test_audio_stream_switch_is_announced() {
    let (player, _frames, mut events) = fixture(MockBackend::new(10));
    load(&player, &mut events).await;

    player.set_audio_stream(Some(2)).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::AudioStreamChanged { stream: Some(s) } if s.index == 2
        )
    })
    .await;
    assert_eq!(
        player
            .current_stream(MediaKind::Audio)
            .and_then(|s| s.language),
        Some("fra".to_string())
    );
}

#[tokio::test]
async fn test_audio_switch_while_playing_keeps_video_contiguous() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(200));
    load(&player, &mut events).await;

    player.play().await.unwrap();
    let mut video_pts = Vec::new();
    while video_pts.len() < 5 {
        if let Frame::Video(f) = next_frame(&mut frames).await {
            video_pts.push(f.pts);
        }
    }

    // Switching audio mid-playback must not cost the video track any
    // frame it already pulled from its queue.
    player.set_audio_stream(Some(2)).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::AudioStreamChanged { stream: Some(s) } if s.index == 2
        )
    })
    .await;

    while video_pts.len() < 10 {
        if let Frame::Video(f) = next_frame(&mut frames).await {
            video_pts.push(f.pts);
        }
    }
    for pair in video_pts.windows(2) {
        assert_eq!(
            pair[1] - pair[0],
            Duration::from_millis(FRAME_MS),
            "video gap around the audio switch: {video_pts:?}"
        );
    }
}

#[tokio::test]
async fn test_invalid_stream_selection_is_ignored() {
    let (player, _frames, mut events) = fixture(MockBackend::new(10));
    load(&player, &mut events).await;

    player.set_audio_stream(Some(9)).await.unwrap();
    player.set_video_stream(Some(1)).await.unwrap(); // audio index
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        player.current_stream(MediaKind::Audio).map(|s| s.index),
        Some(1)
    );
    assert_eq!(
        player.current_stream(MediaKind::Video).map(|s| s.index),
        Some(0)
    );
}

#[tokio::test]
async fn test_deactivating_video_leaves_audio_playing() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(50));
    load(&player, &mut events).await;

    player.set_video_stream(None).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::VideoStreamChanged { stream: None })
    })
    .await;
    assert!(player.current_stream(MediaKind::Video).is_none());

    player.set_synced(false).await.unwrap();
    player.play().await.unwrap();
    for _ in 0..5 {
        let frame = next_frame(&mut frames).await;
        assert_eq!(frame.kind(), MediaKind::Audio);
    }
}

#[tokio::test]
async fn test_decoder_init_failure_deactivates_only_that_track() {
    let mut backend = MockBackend::new(10);
    backend.fail_decode_kind = Some(MediaKind::Audio);
    let (player, mut frames, mut events) = fixture(backend);
    load(&player, &mut events).await;

    assert!(player.current_stream(MediaKind::Audio).is_none());
    assert!(player.current_stream(MediaKind::Video).is_some());

    player.set_synced(false).await.unwrap();
    player.play().await.unwrap();
    let frame = next_frame(&mut frames).await;
    assert_eq!(frame.kind(), MediaKind::Video);
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test]
async fn test_rejected_filter_reports_error_without_touching_state() {
    let (player, mut frames, mut events) = fixture(MockBackend::new(100));
    load(&player, &mut events).await;
    player.play().await.unwrap();
    let _ = next_frame(&mut frames).await;

    player.set_filter(Some("bogus=graph".into())).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::ErrorOccurred {
                kind: ErrorKind::Filter,
                ..
            }
        )
    })
    .await;

    assert_eq!(player.state(), PlaybackState::Playing);
    assert!(player.filter().is_none());
    // Frames keep flowing.
    let _ = next_frame(&mut frames).await;
}

#[tokio::test]
async fn test_accepted_filter_is_announced_and_stored() {
    let mut backend = MockBackend::new(10);
    backend.accept_filters = true;
    let (player, _frames, mut events) = fixture(backend);
    load(&player, &mut events).await;

    player.set_filter(Some("scale=320:240".into())).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::FilterChanged { desc } if desc.as_str() == "scale=320:240")
    })
    .await;
    assert_eq!(player.filter().as_deref(), Some("scale=320:240"));

    player.set_filter(None).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::FilterChanged { desc } if desc.is_empty())
    })
    .await;
    assert!(player.filter().is_none());
}

// ============================================================================
// Failures mid-playback
// ============================================================================

#[tokio::test]
async fn test_demux_read_error_invalidates_session() {
    let mut backend = MockBackend::new(100);
    backend.fail_read_after = Some(4);
    let (player, _frames, mut events) = fixture(backend);
    load(&player, &mut events).await;

    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::Invalid
            }
        )
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::ErrorOccurred {
                kind: ErrorKind::Resource,
                ..
            }
        )
    })
    .await;
    assert_eq!(player.state(), PlaybackState::Stopped);

    // A new source recovers.
    player.set_source(None).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::MediaStatusChanged {
                status: MediaStatus::NoMedia
            }
        )
    })
    .await;
}
