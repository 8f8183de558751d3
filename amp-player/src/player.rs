//! # Player
//!
//! Public control surface of the playback engine plus the control task
//! behind it.
//!
//! A [`Player`] is a cheap handle: commands go over a channel to a
//! single control task, which owns the playback session (demux
//! coordinator, track pipelines, sync controller) and serializes every
//! state transition. Queries read a shared snapshot the control task
//! keeps current, so they never wait on playback work.
//!
//! Discrete notifications are broadcast on an [`EventBus`]; decoded
//! frames take the separate [`FrameSink`] path so frame payloads are
//! never cloned per subscriber.

use crate::config::{PlaybackStats, PlayerConfig, SharedStats};
use crate::demux::{DemuxCommand, DemuxCoordinator, DemuxNotice};
use crate::error::{PlayerError, Result};
use crate::pipeline::{TrackMsg, TrackPipeline};
use crate::queue::FrameQueue;
use crate::select::StreamSelector;
use crate::sync::{SyncCommand, SyncController, SyncNotice, SyncSettings, TrackFeed};
use crate::traits::{FrameSink, MediaBackend, MediaInfo, MediaSource, OpenedMedia};
use amp_runtime::events::{
    ErrorKind, EventBus, EventStream, MediaKind, MediaStatus, PlaybackState, PlayerEvent,
    StreamInfo,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Shared snapshot
// ============================================================================

/// State snapshot readable from any thread. Written only by the control
/// task; position lives in a separate atomic because the sync task
/// advances it per delivered frame.
#[derive(Debug, Clone)]
struct Shared {
    state: PlaybackState,
    media_status: MediaStatus,
    source: Option<String>,
    duration: Option<Duration>,
    seekable: bool,
    speed: f64,
    synced: bool,
    streams: Vec<StreamInfo>,
    active_video: Option<StreamInfo>,
    active_audio: Option<StreamInfo>,
    active_subtitle: Option<StreamInfo>,
    video_frame_rate: Option<f64>,
    filter_desc: Option<String>,
    bitstream_filter_desc: Option<String>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            state: PlaybackState::Stopped,
            media_status: MediaStatus::NoMedia,
            source: None,
            duration: None,
            seekable: false,
            speed: 1.0,
            synced: true,
            streams: Vec::new(),
            active_video: None,
            active_audio: None,
            active_subtitle: None,
            video_frame_rate: None,
            filter_desc: None,
            bitstream_filter_desc: None,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    SetSource(Option<MediaSource>),
    Play,
    Pause,
    Stop,
    Seek(Duration),
    SetSpeed(f64),
    StepForward,
    StepBackward,
    SetStream {
        kind: MediaKind,
        index: Option<u32>,
    },
    SetFilter(Option<String>),
    SetBitstreamFilter(Option<String>),
    SetSynced(bool),
    SetCookies(Option<String>),
    SetUserAgent(Option<String>),
}

// ============================================================================
// Player handle
// ============================================================================

/// Asynchronous media player.
///
/// Construct with a [`MediaBackend`] (demuxing and decoding) and a
/// [`FrameSink`] (frame consumption); drive it with the `set_source` /
/// `play` / `pause` / `stop` family and observe it through [`Player::events`]
/// and the query methods.
pub struct Player {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<RwLock<Shared>>,
    position_ms: Arc<AtomicU64>,
    events: EventBus,
    stats: SharedStats,
    cancel: CancellationToken,
}

impl Player {
    /// Create a player and spawn its control task on the current runtime.
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        sink: Arc<dyn FrameSink>,
        config: PlayerConfig,
    ) -> Result<Self> {
        config.validate().map_err(PlayerError::Config)?;

        let events = EventBus::new(config.event_buffer_size);
        let shared = Arc::new(RwLock::new(Shared::default()));
        let position_ms = Arc::new(AtomicU64::new(0));
        let stats: SharedStats = Arc::new(parking_lot::Mutex::new(PlaybackStats::default()));
        let cancel = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let task = ControlTask {
            backend,
            sink,
            config,
            events: events.clone(),
            shared: shared.clone(),
            position_ms: position_ms.clone(),
            stats: stats.clone(),
            cmd_rx,
            cancel: cancel.clone(),
            cookies: None,
            user_agent: None,
            session: None,
        };
        tokio::spawn(task.run());

        Ok(Self {
            cmd_tx,
            shared,
            position_ms,
            events,
            stats,
            cancel,
        })
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| PlayerError::Closed)
    }

    // ------------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------------

    /// Replace the media source. `None` unloads the current source.
    ///
    /// Loading happens asynchronously; watch for `MediaStatusChanged`.
    pub async fn set_source(&self, source: Option<MediaSource>) -> Result<()> {
        self.send(Command::SetSource(source)).await
    }

    /// Start or resume playback. Ignored without loaded media; restarts
    /// from the beginning after end of media.
    pub async fn play(&self) -> Result<()> {
        self.send(Command::Play).await
    }

    /// Suspend frame delivery, keeping the position.
    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    /// Stop playback and reset the position to zero.
    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// Jump to `position`. When several seeks queue up, the latest one
    /// wins and the earlier targets are skipped.
    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.send(Command::Seek(position)).await
    }

    /// Change the playback rate. Must be positive and finite.
    pub async fn set_speed(&self, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(PlayerError::InvalidSpeed(rate));
        }
        self.send(Command::SetSpeed(rate)).await
    }

    /// Deliver the next video frame and pause.
    pub async fn step_forward(&self) -> Result<()> {
        self.send(Command::StepForward).await
    }

    /// Move one step_frame_interval back, deliver one video frame, pause.
    pub async fn step_backward(&self) -> Result<()> {
        self.send(Command::StepBackward).await
    }

    /// Switch the active video stream, or deactivate video with `None`.
    pub async fn set_video_stream(&self, index: Option<u32>) -> Result<()> {
        self.send(Command::SetStream {
            kind: MediaKind::Video,
            index,
        })
        .await
    }

    /// Switch the active audio stream, or deactivate audio with `None`.
    pub async fn set_audio_stream(&self, index: Option<u32>) -> Result<()> {
        self.send(Command::SetStream {
            kind: MediaKind::Audio,
            index,
        })
        .await
    }

    /// Switch the active subtitle stream, or deactivate subtitles with
    /// `None`.
    pub async fn set_subtitle_stream(&self, index: Option<u32>) -> Result<()> {
        self.send(Command::SetStream {
            kind: MediaKind::Subtitle,
            index,
        })
        .await
    }

    /// Install (or clear) the frame filter on the video track.
    ///
    /// An unparsable description raises a filter error notification and
    /// leaves playback untouched.
    pub async fn set_filter(&self, desc: Option<String>) -> Result<()> {
        self.send(Command::SetFilter(desc)).await
    }

    /// Install (or clear) the bitstream filter applied to demuxed packets.
    pub async fn set_bitstream_filter(&self, desc: Option<String>) -> Result<()> {
        self.send(Command::SetBitstreamFilter(desc)).await
    }

    /// Enable or disable clock-paced delivery. Disabled means frames
    /// leave as fast as they are decoded.
    pub async fn set_synced(&self, synced: bool) -> Result<()> {
        self.send(Command::SetSynced(synced)).await
    }

    /// Cookies sent with network sources opened after this call.
    pub async fn set_cookies(&self, cookies: Option<String>) -> Result<()> {
        self.send(Command::SetCookies(cookies)).await
    }

    /// User-agent sent with network sources opened after this call.
    pub async fn set_user_agent(&self, user_agent: Option<String>) -> Result<()> {
        self.send(Command::SetUserAgent(user_agent)).await
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn state(&self) -> PlaybackState {
        self.shared.read().state
    }

    pub fn media_status(&self) -> MediaStatus {
        self.shared.read().media_status
    }

    /// Current playback position, advanced per delivered frame.
    pub fn position(&self) -> Duration {
        Duration::from_millis(self.position_ms.load(Ordering::Acquire))
    }

    pub fn duration(&self) -> Option<Duration> {
        self.shared.read().duration
    }

    pub fn seekable(&self) -> bool {
        self.shared.read().seekable
    }

    pub fn speed(&self) -> f64 {
        self.shared.read().speed
    }

    pub fn synced(&self) -> bool {
        self.shared.read().synced
    }

    /// Locator of the current source, if one is set.
    pub fn source(&self) -> Option<String> {
        self.shared.read().source.clone()
    }

    /// Nominal frame rate of the active video stream.
    pub fn video_frame_rate(&self) -> Option<f64> {
        self.shared.read().video_frame_rate
    }

    /// All discovered streams of `kind`, in container order.
    pub fn available_streams(&self, kind: MediaKind) -> Vec<StreamInfo> {
        self.shared
            .read()
            .streams
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }

    /// The active stream of `kind`, if any.
    pub fn current_stream(&self, kind: MediaKind) -> Option<StreamInfo> {
        let shared = self.shared.read();
        match kind {
            MediaKind::Video => shared.active_video.clone(),
            MediaKind::Audio => shared.active_audio.clone(),
            MediaKind::Subtitle => shared.active_subtitle.clone(),
        }
    }

    pub fn filter(&self) -> Option<String> {
        self.shared.read().filter_desc.clone()
    }

    pub fn bitstream_filter(&self) -> Option<String> {
        self.shared.read().bitstream_filter_desc.clone()
    }

    /// Snapshot of the pipeline counters.
    pub fn stats(&self) -> PlaybackStats {
        self.stats.lock().clone()
    }

    /// Subscribe to playback notifications.
    pub fn events(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    /// Shut the player down, cancelling every background task.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Control task
// ============================================================================

/// Per-source plumbing owned by the control task.
struct Session {
    generation: Arc<AtomicU64>,
    selector: StreamSelector,
    info: MediaInfo,
    demux_tx: mpsc::Sender<DemuxCommand>,
    demux_notice_rx: mpsc::Receiver<DemuxNotice>,
    sync_tx: mpsc::Sender<SyncCommand>,
    sync_notice_rx: mpsc::Receiver<SyncNotice>,
    settings_tx: watch::Sender<SyncSettings>,
    queues: HashMap<u32, FrameQueue>,
    pipes: HashMap<u32, mpsc::Sender<TrackMsg>>,
    cancel: CancellationToken,
}

struct ControlTask {
    backend: Arc<dyn MediaBackend>,
    sink: Arc<dyn FrameSink>,
    config: PlayerConfig,
    events: EventBus,
    shared: Arc<RwLock<Shared>>,
    position_ms: Arc<AtomicU64>,
    stats: SharedStats,
    cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    cookies: Option<String>,
    user_agent: Option<String>,
    session: Option<Session>,
}

enum Notice {
    Demux(DemuxNotice),
    Sync(SyncNotice),
}

/// Await the next out-of-band report from the session's background
/// tasks; pends forever while no session exists.
async fn recv_notice(session: &mut Option<Session>) -> Notice {
    let Some(s) = session else {
        return std::future::pending().await;
    };
    tokio::select! {
        notice = s.demux_notice_rx.recv() => match notice {
            Some(n) => Notice::Demux(n),
            None => std::future::pending().await,
        },
        notice = s.sync_notice_rx.recv() => match notice {
            Some(n) => Notice::Sync(n),
            None => std::future::pending().await,
        },
    }
}

fn track_feeds(session: &Session) -> Vec<TrackFeed> {
    session
        .selector
        .active_indices()
        .into_iter()
        .filter_map(|index| {
            let queue = session.queues.get(&index)?.clone();
            let kind = session.info.streams.iter().find(|s| s.index == index)?.kind;
            Some(TrackFeed {
                track_index: index,
                kind,
                queue,
            })
        })
        .collect()
}

fn stream_event(kind: MediaKind, stream: Option<StreamInfo>) -> PlayerEvent {
    match kind {
        MediaKind::Video => PlayerEvent::VideoStreamChanged { stream },
        MediaKind::Audio => PlayerEvent::AudioStreamChanged { stream },
        MediaKind::Subtitle => PlayerEvent::SubtitleStreamChanged { stream },
    }
}

impl ControlTask {
    async fn run(mut self) {
        info!("player control task started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                notice = recv_notice(&mut self.session) => match notice {
                    Notice::Demux(n) => self.on_demux_notice(n),
                    Notice::Sync(n) => self.on_sync_notice(n),
                },
            }
        }
        self.teardown_session();
        info!("player control task stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetSource(source) => self.cmd_set_source(source).await,
            Command::Play => self.cmd_play().await,
            Command::Pause => self.cmd_pause(),
            Command::Stop => self.cmd_stop().await,
            Command::Seek(target) => self.cmd_seek(target).await,
            Command::SetSpeed(rate) => self.cmd_set_speed(rate),
            Command::StepForward => self.cmd_step(false).await,
            Command::StepBackward => self.cmd_step(true).await,
            Command::SetStream { kind, index } => self.cmd_set_stream(kind, index).await,
            Command::SetFilter(desc) => self.cmd_set_filter(desc).await,
            Command::SetBitstreamFilter(desc) => self.cmd_set_bitstream_filter(desc).await,
            Command::SetSynced(synced) => self.cmd_set_synced(synced),
            Command::SetCookies(cookies) => self.cookies = cookies,
            Command::SetUserAgent(user_agent) => self.user_agent = user_agent,
        }
    }

    // ------------------------------------------------------------------------
    // Event helpers
    // ------------------------------------------------------------------------

    fn emit(&self, event: PlayerEvent) {
        // A no-subscriber send is not a fault.
        let _ = self.events.emit(event);
    }

    /// Change the playback state, emitting only on a real transition.
    fn transition(&mut self, next: PlaybackState) -> bool {
        let changed = {
            let mut shared = self.shared.write();
            if shared.state == next {
                false
            } else {
                shared.state = next;
                true
            }
        };
        if changed {
            debug!(state = ?next, "state changed");
            self.emit(PlayerEvent::StateChanged { state: next });
        }
        changed
    }

    fn set_status(&mut self, next: MediaStatus) {
        let changed = {
            let mut shared = self.shared.write();
            if shared.media_status == next {
                false
            } else {
                shared.media_status = next;
                true
            }
        };
        if changed {
            debug!(status = ?next, "media status changed");
            self.emit(PlayerEvent::MediaStatusChanged { status: next });
        }
    }

    /// Push the current state/speed/synced triple to the sync controller.
    fn push_settings(&self) {
        if let Some(session) = &self.session {
            let shared = self.shared.read();
            let _ = session.settings_tx.send(SyncSettings {
                playing: shared.state == PlaybackState::Playing,
                speed: shared.speed,
                synced: shared.synced,
            });
        }
    }

    fn position_now_ms(&self) -> u64 {
        self.position_ms.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Source lifecycle
    // ------------------------------------------------------------------------

    async fn cmd_set_source(&mut self, source: Option<MediaSource>) {
        self.teardown_session();
        self.transition(PlaybackState::Stopped);
        {
            let mut shared = self.shared.write();
            shared.duration = None;
            shared.seekable = false;
            shared.streams.clear();
            shared.active_video = None;
            shared.active_audio = None;
            shared.active_subtitle = None;
            shared.video_frame_rate = None;
            shared.source = source.as_ref().map(|s| s.location().to_string());
        }
        self.set_status(MediaStatus::NoMedia);

        let Some(mut source) = source else {
            self.emit(PlayerEvent::SourceChanged { url: String::new() });
            return;
        };
        let url = source.location().to_string();
        self.emit(PlayerEvent::SourceChanged { url: url.clone() });

        if source.is_remote() {
            if let Some(cookies) = &self.cookies {
                source = source.with_header("Cookie", cookies.clone());
            }
            if let Some(user_agent) = &self.user_agent {
                source = source.with_header("User-Agent", user_agent.clone());
            }
        }

        debug!(%url, "opening source");
        match self.backend.open(source).await {
            Ok(opened) => self.start_session(opened).await,
            Err(e) => {
                warn!(%url, error = %e, "failed to open source");
                self.set_status(MediaStatus::Invalid);
                self.emit(PlayerEvent::ErrorOccurred {
                    kind: ErrorKind::Resource,
                    message: e.to_string(),
                });
            }
        }
    }

    async fn start_session(&mut self, opened: OpenedMedia) {
        let OpenedMedia { demuxer, info } = opened;
        let selector = StreamSelector::from_info(&info);
        let generation = Arc::new(AtomicU64::new(0));
        let cancel = self.cancel.child_token();
        let (demux_tx, demux_cmd_rx) = mpsc::channel(16);
        let (demux_notice_tx, demux_notice_rx) = mpsc::channel(8);
        let (sync_tx, sync_cmd_rx) = mpsc::channel(16);
        let (sync_notice_tx, sync_notice_rx) = mpsc::channel(8);
        let initial = {
            let shared = self.shared.read();
            SyncSettings {
                playing: false,
                speed: shared.speed,
                synced: shared.synced,
            }
        };
        let (settings_tx, settings_rx) = watch::channel(initial);

        let mut session = Session {
            generation: generation.clone(),
            selector,
            info: info.clone(),
            demux_tx,
            demux_notice_rx,
            sync_tx,
            sync_notice_rx,
            settings_tx,
            queues: HashMap::new(),
            pipes: HashMap::new(),
            cancel: cancel.clone(),
        };

        for kind in MediaKind::ALL {
            let Some(stream) = session.selector.active(kind).cloned() else {
                continue;
            };
            if let Err(e) = self.spawn_track(&mut session, &stream) {
                warn!(
                    track = stream.index,
                    error = %e,
                    "decoder init failed, track deactivated"
                );
                session.selector.deselect(kind);
            }
        }

        // Routes queued before spawn are drained when the coordinator
        // starts, so no packet is read unrouted.
        for (index, pipe) in &session.pipes {
            let _ = session
                .demux_tx
                .send(DemuxCommand::SetRoute {
                    track_index: *index,
                    sender: pipe.clone(),
                })
                .await;
        }

        let bsf_desc = self.shared.read().bitstream_filter_desc.clone();
        if let Some(desc) = bsf_desc {
            match self.backend.create_bitstream_filter(&desc) {
                Ok(filter) => {
                    let _ = session
                        .demux_tx
                        .send(DemuxCommand::SetBitstreamFilter(Some(filter)))
                        .await;
                }
                Err(e) => self.emit(PlayerEvent::ErrorOccurred {
                    kind: ErrorKind::Filter,
                    message: e.to_string(),
                }),
            }
        }

        tokio::spawn(
            DemuxCoordinator::new(
                demuxer,
                generation,
                demux_cmd_rx,
                demux_notice_tx,
                cancel.clone(),
                self.stats.clone(),
            )
            .run(),
        );
        tokio::spawn(
            SyncController::new(
                self.sink.clone(),
                settings_rx,
                sync_cmd_rx,
                sync_notice_tx,
                self.position_ms.clone(),
                cancel,
                self.stats.clone(),
                &self.config,
            )
            .run(),
        );

        let _ = session
            .sync_tx
            .send(SyncCommand::SetTracks(track_feeds(&session)))
            .await;

        let (active_video, active_audio, active_subtitle) = (
            session.selector.active(MediaKind::Video).cloned(),
            session.selector.active(MediaKind::Audio).cloned(),
            session.selector.active(MediaKind::Subtitle).cloned(),
        );
        {
            let mut shared = self.shared.write();
            shared.duration = info.duration;
            shared.seekable = info.seekable;
            shared.streams = info.streams.clone();
            shared.active_video = active_video.clone();
            shared.active_audio = active_audio.clone();
            shared.active_subtitle = active_subtitle.clone();
            shared.video_frame_rate = active_video.as_ref().and_then(|s| s.frame_rate);
        }

        self.emit(PlayerEvent::DurationChanged {
            duration_ms: info.duration.map(|d| d.as_millis() as u64).unwrap_or(0),
        });
        self.emit(PlayerEvent::SeekableChanged {
            seekable: info.seekable,
        });
        if let Some(rate) = active_video.as_ref().and_then(|s| s.frame_rate) {
            self.emit(PlayerEvent::VideoFrameRateChanged { rate });
        }
        self.emit(stream_event(MediaKind::Video, active_video));
        self.emit(stream_event(MediaKind::Audio, active_audio));
        self.emit(stream_event(MediaKind::Subtitle, active_subtitle));

        info!(streams = info.streams.len(), "source loaded");
        self.session = Some(session);
        self.set_status(MediaStatus::Loaded);
    }

    /// Create the decoder and spawn the pipeline for one stream.
    fn spawn_track(&self, session: &mut Session, stream: &StreamInfo) -> Result<()> {
        let decoder = self.backend.create_decoder(stream)?;

        let filter = if stream.kind == MediaKind::Video {
            match self.shared.read().filter_desc.clone() {
                Some(desc) => match self.backend.create_filter(&desc) {
                    Ok(filter) => Some(filter),
                    Err(e) => {
                        self.emit(PlayerEvent::ErrorOccurred {
                            kind: ErrorKind::Filter,
                            message: e.to_string(),
                        });
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let queue = FrameQueue::new(self.config.queue_capacity(stream.kind));
        let (pipe_tx, pipe_rx) = mpsc::channel(self.config.packet_channel_capacity);
        tokio::spawn(
            TrackPipeline::new(
                stream.clone(),
                decoder,
                filter,
                queue.clone(),
                pipe_rx,
                session.cancel.clone(),
                self.stats.clone(),
            )
            .run(),
        );
        session.queues.insert(stream.index, queue);
        session.pipes.insert(stream.index, pipe_tx);
        Ok(())
    }

    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("tearing down playback session");
            session.cancel.cancel();
        }
        self.position_ms.store(0, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Transport commands
    // ------------------------------------------------------------------------

    async fn cmd_play(&mut self) {
        let (status, state) = {
            let shared = self.shared.read();
            (shared.media_status, shared.state)
        };
        if self.session.is_none()
            || matches!(status, MediaStatus::NoMedia | MediaStatus::Invalid)
        {
            debug!("play ignored: no loaded media");
            return;
        }
        if status == MediaStatus::EndOfMedia {
            // Restart from the beginning.
            if let Err(e) = self.run_seek(Duration::ZERO).await {
                warn!(error = %e, "restart seek failed");
                return;
            }
            self.set_status(MediaStatus::Loaded);
        }
        if state == PlaybackState::Playing {
            return;
        }
        self.transition(PlaybackState::Playing);
        self.push_settings();
        self.emit(PlayerEvent::Played {
            position_ms: self.position_now_ms(),
        });
    }

    fn cmd_pause(&mut self) {
        if self.shared.read().state != PlaybackState::Playing {
            debug!("pause ignored: not playing");
            return;
        }
        if self.transition(PlaybackState::Paused) {
            self.push_settings();
            self.emit(PlayerEvent::Paused {
                position_ms: self.position_now_ms(),
            });
        }
    }

    async fn cmd_stop(&mut self) {
        if self.shared.read().state == PlaybackState::Stopped {
            return;
        }
        self.transition(PlaybackState::Stopped);
        self.push_settings();
        if self.session.is_some() {
            if let Err(e) = self.run_seek(Duration::ZERO).await {
                warn!(error = %e, "rewind on stop failed");
            }
        }
        self.position_ms.store(0, Ordering::Release);
        self.emit(PlayerEvent::Stopped { position_ms: 0 });
    }

    async fn cmd_seek(&mut self, target: Duration) {
        // The latest queued seek supersedes earlier ones, and a queued
        // source change abandons the seek outright; other queued
        // commands keep their order and run afterwards.
        let mut pending = Some(target);
        let mut superseded = false;
        let mut deferred = Vec::new();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Seek(t) if !superseded => pending = Some(t),
                Command::SetSource(source) => {
                    superseded = true;
                    pending = None;
                    deferred.push(Command::SetSource(source));
                }
                other => deferred.push(other),
            }
        }

        if let Some(target) = pending {
            self.do_seek(target).await;
        }

        for cmd in deferred {
            Box::pin(self.handle_command(cmd)).await;
        }
    }

    async fn do_seek(&mut self, target: Duration) {
        if self.session.is_none() {
            debug!("seek ignored: no loaded media");
            return;
        }
        let (seekable, duration, status) = {
            let shared = self.shared.read();
            (shared.seekable, shared.duration, shared.media_status)
        };
        if !seekable {
            warn!("seek ignored: source is not seekable");
            return;
        }
        let target = match duration {
            Some(d) => target.min(d),
            None => target,
        };
        match self.run_seek(target).await {
            Ok(achieved) => {
                if status == MediaStatus::EndOfMedia {
                    self.set_status(MediaStatus::Loaded);
                }
                self.emit(PlayerEvent::Seeked {
                    position_ms: achieved.as_millis() as u64,
                });
            }
            Err(e) => warn!(error = %e, "seek failed"),
        }
    }

    /// Flush protocol: invalidate queued output, then reposition the
    /// demuxer and rebase the delivery clock.
    async fn run_seek(&mut self, target: Duration) -> Result<Duration> {
        let session = self.session.as_mut().ok_or(PlayerError::NoMedia)?;

        // The coordinator bumps the shared counter when it processes the
        // seek; flushing the queues to the upcoming value first means
        // every frame and packet still in flight is already stale.
        let upcoming = session.generation.load(Ordering::Acquire) + 1;
        for queue in session.queues.values() {
            queue.flush(upcoming);
        }
        for pipe in session.pipes.values() {
            let _ = pipe.send(TrackMsg::Flush { generation: upcoming }).await;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        session
            .demux_tx
            .send(DemuxCommand::Seek {
                target,
                ack: ack_tx,
            })
            .await
            .map_err(|_| PlayerError::Closed)?;
        let achieved = ack_rx.await.map_err(|_| PlayerError::Closed)??;

        // Publish immediately; the sync controller repeats this when it
        // processes the rebase.
        self.position_ms
            .store(achieved.as_millis() as u64, Ordering::Release);
        let session = self.session.as_mut().ok_or(PlayerError::NoMedia)?;
        let _ = session
            .sync_tx
            .send(SyncCommand::Rebase { position: achieved })
            .await;
        Ok(achieved)
    }

    fn cmd_set_speed(&mut self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            warn!(rate, "ignoring invalid playback rate");
            return;
        }
        let changed = {
            let mut shared = self.shared.write();
            if (shared.speed - rate).abs() < f64::EPSILON {
                false
            } else {
                shared.speed = rate;
                true
            }
        };
        if changed {
            self.push_settings();
            self.emit(PlayerEvent::SpeedChanged { rate });
        }
    }

    fn cmd_set_synced(&mut self, synced: bool) {
        let changed = {
            let mut shared = self.shared.write();
            if shared.synced == synced {
                false
            } else {
                shared.synced = synced;
                true
            }
        };
        if changed {
            self.push_settings();
            self.emit(PlayerEvent::SyncedChanged { synced });
        }
    }

    async fn cmd_step(&mut self, backward: bool) {
        let (status, state) = {
            let shared = self.shared.read();
            (shared.media_status, shared.state)
        };
        if self.session.is_none()
            || matches!(status, MediaStatus::NoMedia | MediaStatus::Invalid)
        {
            debug!("step ignored: no loaded media");
            return;
        }
        // Stepping requires halted delivery; the state is left untouched.
        if state == PlaybackState::Playing {
            debug!("step ignored: playing");
            return;
        }
        if !backward && status == MediaStatus::EndOfMedia {
            debug!("step ignored: at end of media");
            return;
        }

        // A backward seek snaps to the preceding keyframe, so frames
        // before the step target are skipped on release.
        let mut min_pts = None;
        if backward {
            let current = Duration::from_millis(self.position_now_ms());
            let target = current.saturating_sub(self.config.step_frame_interval);
            if let Err(e) = self.run_seek(target).await {
                warn!(error = %e, "step seek failed");
                return;
            }
            if status == MediaStatus::EndOfMedia {
                self.set_status(MediaStatus::Loaded);
            }
            min_pts = Some(target);
        }

        let Some(session) = &self.session else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if session
            .sync_tx
            .send(SyncCommand::Step {
                min_pts,
                ack: ack_tx,
            })
            .await
            .is_err()
        {
            return;
        }
        let stepped = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = ack_rx => res,
        };
        match stepped {
            Ok(Some(pts)) => self.emit(PlayerEvent::Stepped {
                position_ms: pts.as_millis() as u64,
            }),
            _ => debug!("step produced no frame"),
        }
    }

    // ------------------------------------------------------------------------
    // Stream selection and filters
    // ------------------------------------------------------------------------

    async fn cmd_set_stream(&mut self, kind: MediaKind, index: Option<u32>) {
        let Some(mut session) = self.session.take() else {
            debug!("stream selection ignored: no loaded media");
            return;
        };
        let previous = session.selector.active(kind).map(|s| s.index);

        match index {
            Some(idx) if previous == Some(idx) => {}
            Some(idx) => {
                let stream = match session.selector.select(kind, idx) {
                    Ok(_) => session.selector.active(kind).cloned(),
                    Err(e) => {
                        warn!(error = %e, "stream selection rejected");
                        self.session = Some(session);
                        return;
                    }
                };
                let Some(stream) = stream else {
                    self.session = Some(session);
                    return;
                };

                if let Some(prev_idx) = previous {
                    let _ = session
                        .demux_tx
                        .send(DemuxCommand::ClearRoute {
                            track_index: prev_idx,
                        })
                        .await;
                    // Dropping the channel ends the old pipeline.
                    session.pipes.remove(&prev_idx);
                    session.queues.remove(&prev_idx);
                }

                match self.spawn_track(&mut session, &stream) {
                    Ok(()) => {
                        if let Some(pipe) = session.pipes.get(&stream.index) {
                            let _ = session
                                .demux_tx
                                .send(DemuxCommand::SetRoute {
                                    track_index: stream.index,
                                    sender: pipe.clone(),
                                })
                                .await;
                        }
                        let _ = session
                            .sync_tx
                            .send(SyncCommand::SetTracks(track_feeds(&session)))
                            .await;
                        self.set_active_stream(kind, Some(stream.clone()));
                        self.emit(stream_event(kind, Some(stream)));
                    }
                    Err(e) => {
                        warn!(
                            track = stream.index,
                            error = %e,
                            "decoder init failed, track deactivated"
                        );
                        session.selector.deselect(kind);
                        let _ = session
                            .sync_tx
                            .send(SyncCommand::SetTracks(track_feeds(&session)))
                            .await;
                        self.set_active_stream(kind, None);
                        self.emit(stream_event(kind, None));
                    }
                }
            }
            None => {
                if let Some(prev_idx) = previous {
                    session.selector.deselect(kind);
                    let _ = session
                        .demux_tx
                        .send(DemuxCommand::ClearRoute {
                            track_index: prev_idx,
                        })
                        .await;
                    session.pipes.remove(&prev_idx);
                    session.queues.remove(&prev_idx);
                    let _ = session
                        .sync_tx
                        .send(SyncCommand::SetTracks(track_feeds(&session)))
                        .await;
                    self.set_active_stream(kind, None);
                    self.emit(stream_event(kind, None));
                }
            }
        }

        self.session = Some(session);
    }

    /// Update the shared snapshot for one kind, including the derived
    /// video frame rate.
    fn set_active_stream(&self, kind: MediaKind, stream: Option<StreamInfo>) {
        let rate_event = {
            let mut shared = self.shared.write();
            match kind {
                MediaKind::Video => {
                    let rate = stream.as_ref().and_then(|s| s.frame_rate);
                    let changed = rate.is_some() && rate != shared.video_frame_rate;
                    shared.video_frame_rate = rate;
                    shared.active_video = stream;
                    changed.then_some(rate).flatten()
                }
                MediaKind::Audio => {
                    shared.active_audio = stream;
                    None
                }
                MediaKind::Subtitle => {
                    shared.active_subtitle = stream;
                    None
                }
            }
        };
        if let Some(rate) = rate_event {
            self.emit(PlayerEvent::VideoFrameRateChanged { rate });
        }
    }

    async fn cmd_set_filter(&mut self, desc: Option<String>) {
        let parsed = match &desc {
            Some(d) => match self.backend.create_filter(d) {
                Ok(filter) => Some(filter),
                Err(e) => {
                    warn!(desc = %d, error = %e, "filter rejected");
                    self.emit(PlayerEvent::ErrorOccurred {
                        kind: ErrorKind::Filter,
                        message: e.to_string(),
                    });
                    return;
                }
            },
            None => None,
        };

        self.shared.write().filter_desc = desc.clone();
        if let Some(session) = &self.session {
            if let Some(video) = session.selector.active(MediaKind::Video) {
                if let Some(pipe) = session.pipes.get(&video.index) {
                    let _ = pipe.send(TrackMsg::SetFilter(parsed)).await;
                }
            }
        }
        self.emit(PlayerEvent::FilterChanged {
            desc: desc.unwrap_or_default(),
        });
    }

    async fn cmd_set_bitstream_filter(&mut self, desc: Option<String>) {
        let parsed = match &desc {
            Some(d) => match self.backend.create_bitstream_filter(d) {
                Ok(filter) => Some(filter),
                Err(e) => {
                    warn!(desc = %d, error = %e, "bitstream filter rejected");
                    self.emit(PlayerEvent::ErrorOccurred {
                        kind: ErrorKind::Filter,
                        message: e.to_string(),
                    });
                    return;
                }
            },
            None => None,
        };

        self.shared.write().bitstream_filter_desc = desc.clone();
        if let Some(session) = &self.session {
            let _ = session
                .demux_tx
                .send(DemuxCommand::SetBitstreamFilter(parsed))
                .await;
        }
        self.emit(PlayerEvent::BitstreamFilterChanged {
            desc: desc.unwrap_or_default(),
        });
    }

    // ------------------------------------------------------------------------
    // Background notices
    // ------------------------------------------------------------------------

    fn on_demux_notice(&mut self, notice: DemuxNotice) {
        match notice {
            DemuxNotice::EndOfStream => debug!("demuxer drained"),
            DemuxNotice::Fatal(message) => {
                warn!(%message, "playback session failed");
                self.teardown_session();
                if self.transition(PlaybackState::Stopped) {
                    self.emit(PlayerEvent::Stopped { position_ms: 0 });
                }
                self.set_status(MediaStatus::Invalid);
                self.emit(PlayerEvent::ErrorOccurred {
                    kind: ErrorKind::Resource,
                    message,
                });
            }
        }
    }

    fn on_sync_notice(&mut self, notice: SyncNotice) {
        match notice {
            SyncNotice::EndOfMedia => {
                // Emission stops after the last frame, but the state
                // stays Playing; play() from here restarts at zero.
                info!("end of media");
                self.set_status(MediaStatus::EndOfMedia);
            }
        }
    }
}
