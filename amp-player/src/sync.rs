//! # Sync Controller
//!
//! Single task draining the per-track frame queues and handing frames
//! to the [`FrameSink`] at presentation time. The clock is wall time
//! scaled by the playback rate, rebased onto every delivered audio
//! frame so audio remains the master when present. With sync disabled
//! frames leave as fast as they are decoded.
//!
//! Position is published through a shared atomic (milliseconds) so the
//! player handle can answer queries without a round trip.

use crate::config::{PlayerConfig, SharedStats};
use crate::queue::{FrameQueue, QueueItem};
use crate::traits::{Frame, FrameSink, MediaKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Live playback parameters pushed from the control task.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub playing: bool,
    pub speed: f64,
    pub synced: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            playing: false,
            speed: 1.0,
            synced: true,
        }
    }
}

/// One queue the controller drains.
pub struct TrackFeed {
    pub track_index: u32,
    pub kind: MediaKind,
    pub queue: FrameQueue,
}

/// Command accepted by the sync controller.
pub enum SyncCommand {
    /// Replace the set of drained queues (load or stream switch).
    SetTracks(Vec<TrackFeed>),
    /// Reset the clock to `position` and discard held frames (seek).
    Rebase { position: Duration },
    /// Deliver exactly one video frame while halted, replying with its
    /// presentation timestamp (`None` when no video track exists).
    /// Frames before `min_pts` are discarded first, so a backward step
    /// lands on the step target rather than the keyframe the demuxer
    /// snapped to.
    Step {
        min_pts: Option<Duration>,
        ack: oneshot::Sender<Option<Duration>>,
    },
}

/// Out-of-band report to the control task.
#[derive(Debug)]
pub enum SyncNotice {
    /// Every active track delivered its final frame.
    EndOfMedia,
}

struct TrackState {
    track_index: u32,
    kind: MediaKind,
    queue: FrameQueue,
    pending: Option<Frame>,
    ended: bool,
}

/// Paces frame delivery against the playback clock.
pub struct SyncController {
    tracks: Vec<TrackState>,
    sink: Arc<dyn FrameSink>,
    settings_rx: watch::Receiver<SyncSettings>,
    settings: SyncSettings,
    cmd_rx: mpsc::Receiver<SyncCommand>,
    notice_tx: mpsc::Sender<SyncNotice>,
    position_ms: Arc<AtomicU64>,
    cancel: CancellationToken,
    stats: SharedStats,
    late_tolerance: Duration,
    // Clock base: media time at `base_wall`, advanced by wall time
    // scaled with the playback rate.
    base_media: Duration,
    base_wall: Instant,
    eom_sent: bool,
}

impl SyncController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sink: Arc<dyn FrameSink>,
        settings_rx: watch::Receiver<SyncSettings>,
        cmd_rx: mpsc::Receiver<SyncCommand>,
        notice_tx: mpsc::Sender<SyncNotice>,
        position_ms: Arc<AtomicU64>,
        cancel: CancellationToken,
        stats: SharedStats,
        config: &PlayerConfig,
    ) -> Self {
        let settings = settings_rx.borrow().clone();
        Self {
            tracks: Vec::new(),
            sink,
            settings_rx,
            settings,
            cmd_rx,
            notice_tx,
            position_ms,
            cancel,
            stats,
            late_tolerance: config.late_tolerance,
            base_media: Duration::ZERO,
            base_wall: Instant::now(),
            eom_sent: false,
        }
    }

    pub async fn run(mut self) {
        info!("sync controller started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if !self.settings.playing {
                if !self.idle().await {
                    break;
                }
                continue;
            }

            self.fill_pending();

            if self.tracks.iter().all(|t| t.ended && t.pending.is_none()) {
                if !self.tracks.is_empty() && !self.eom_sent {
                    debug!("all tracks ended");
                    self.eom_sent = true;
                    let _ = self.notice_tx.send(SyncNotice::EndOfMedia).await;
                }
                if !self.idle().await {
                    break;
                }
                continue;
            }

            match self.earliest_pending() {
                None => {
                    // Queues empty but not ended: wait for decode output.
                    if !self.wait_for_arrival().await {
                        break;
                    }
                }
                Some(slot) => {
                    let due_in = self.due_in(slot);
                    if due_in > Duration::ZERO {
                        if !self.sleep_until_due(due_in).await {
                            break;
                        }
                        continue;
                    }
                    if !self.deliver(slot).await {
                        break;
                    }
                }
            }
        }
        info!("sync controller stopped");
    }

    /// Non-blocking refill of every empty pending slot.
    fn fill_pending(&mut self) {
        for track in &mut self.tracks {
            if track.ended || track.pending.is_some() {
                continue;
            }
            match track.queue.try_pop() {
                Some(QueueItem::Frame(frame)) => track.pending = Some(frame),
                Some(QueueItem::EndOfStream) => {
                    debug!(track = track.track_index, "track ended");
                    track.ended = true;
                }
                None => {}
            }
        }
    }

    /// Slot of the pending frame with the smallest timestamp.
    fn earliest_pending(&self) -> Option<usize> {
        self.tracks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.pending.as_ref().map(|f| (i, f.pts())))
            .min_by_key(|(_, pts)| *pts)
            .map(|(i, _)| i)
    }

    /// Media time implied by the clock base at this instant.
    fn media_now(&self) -> Duration {
        let elapsed = self.base_wall.elapsed();
        self.base_media + elapsed.mul_f64(self.settings.speed.max(0.0))
    }

    fn rebase(&mut self, position: Duration) {
        self.base_media = position;
        self.base_wall = Instant::now();
    }

    /// Wall-clock wait before the pending frame in `slot` is due.
    fn due_in(&self, slot: usize) -> Duration {
        if !self.settings.synced {
            return Duration::ZERO;
        }
        let Some(pts) = self.tracks[slot].pending.as_ref().map(|f| f.pts()) else {
            return Duration::ZERO;
        };
        let now = self.media_now();
        if pts <= now {
            return Duration::ZERO;
        }
        let speed = self.settings.speed;
        if speed <= 0.0 {
            return Duration::ZERO;
        }
        (pts - now).div_f64(speed)
    }

    /// Hand the pending frame of `slot` to the sink. Returns `false` on
    /// shutdown.
    async fn deliver(&mut self, slot: usize) -> bool {
        let Some(frame) = self.tracks[slot].pending.take() else {
            return true;
        };
        let pts = frame.pts();

        if self.settings.synced {
            let now = self.media_now();
            if pts + self.late_tolerance < now {
                // Late frames still leave; dropping is the queue's job.
                trace!(
                    pts_ms = pts.as_millis() as u64,
                    clock_ms = now.as_millis() as u64,
                    "late delivery"
                );
                self.stats.lock().late_deliveries += 1;
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            _ = self.sink.deliver(frame) => {}
        }

        self.stats.lock().frames_delivered += 1;
        self.position_ms.store(pts.as_millis() as u64, Ordering::Release);
        if self.tracks[slot].kind == MediaKind::Audio {
            // Audio is the master clock while it flows.
            self.rebase(pts);
        }
        true
    }

    /// Idle until a command or settings change. Returns `false` on
    /// shutdown.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => self.handle_command(cmd).await,
                None => false,
            },
            changed = self.settings_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
                self.apply_settings();
                true
            }
        }
    }

    async fn sleep_until_due(&mut self, due_in: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => self.handle_command(cmd).await,
                None => false,
            },
            changed = self.settings_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
                self.apply_settings();
                true
            }
            _ = tokio::time::sleep(due_in) => true,
        }
    }

    /// Block until any drained queue produces an item, staying
    /// responsive to commands. Returns `false` on shutdown.
    async fn wait_for_arrival(&mut self) -> bool {
        let waiters: Vec<(usize, FrameQueue)> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.ended && t.pending.is_none())
            .map(|(i, t)| (i, t.queue.clone()))
            .collect();
        if waiters.is_empty() {
            return true;
        }

        let pops = waiters
            .iter()
            .map(|(i, q)| Box::pin(async move { (*i, q.pop().await) }));

        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            cmd = self.cmd_rx.recv() => return match cmd {
                Some(cmd) => self.handle_command(cmd).await,
                None => false,
            },
            changed = self.settings_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
                self.apply_settings();
                return true;
            }
            (slot, item) = async {
                futures::future::select_all(pops).await.0
            } => {
                match item {
                    QueueItem::Frame(frame) => self.tracks[slot].pending = Some(frame),
                    QueueItem::EndOfStream => self.tracks[slot].ended = true,
                }
            }
        }
        true
    }

    fn apply_settings(&mut self) {
        let next = self.settings_rx.borrow_and_update().clone();
        let resumed = next.playing && !self.settings.playing;
        let speed_changed = (next.speed - self.settings.speed).abs() > f64::EPSILON;

        if resumed || speed_changed {
            // Keep the clock continuous across resume and rate changes.
            let position =
                Duration::from_millis(self.position_ms.load(Ordering::Acquire));
            self.settings = next;
            self.rebase(position);
        } else {
            self.settings = next;
        }
    }

    /// Handle one command. Returns `false` on shutdown.
    async fn handle_command(&mut self, cmd: SyncCommand) -> bool {
        match cmd {
            SyncCommand::SetTracks(feeds) => {
                debug!(tracks = feeds.len(), "track feeds replaced");
                // A switch on one track must not disturb the others:
                // tracks that keep their queue also keep any frame
                // already popped and their end-of-stream mark.
                let mut previous = std::mem::take(&mut self.tracks);
                self.tracks = feeds
                    .into_iter()
                    .map(|f| {
                        let carried = previous.iter_mut().find(|t| {
                            t.track_index == f.track_index && t.queue.ptr_eq(&f.queue)
                        });
                        let (pending, ended) = match carried {
                            Some(t) => (t.pending.take(), t.ended),
                            None => (None, false),
                        };
                        TrackState {
                            track_index: f.track_index,
                            kind: f.kind,
                            queue: f.queue,
                            pending,
                            ended,
                        }
                    })
                    .collect();
                self.eom_sent = false;
                true
            }
            SyncCommand::Rebase { position } => {
                debug!(position_ms = position.as_millis() as u64, "clock rebased");
                for track in &mut self.tracks {
                    track.pending = None;
                    track.ended = false;
                }
                self.eom_sent = false;
                self.position_ms
                    .store(position.as_millis() as u64, Ordering::Release);
                self.rebase(position);
                true
            }
            SyncCommand::Step { min_pts, ack } => {
                let pts = self.step_video(min_pts).await;
                let _ = ack.send(pts);
                !self.cancel.is_cancelled()
            }
        }
    }

    /// Pop and deliver the next video frame at or past `min_pts`,
    /// regardless of the clock. Frames before `min_pts` are discarded.
    async fn step_video(&mut self, min_pts: Option<Duration>) -> Option<Duration> {
        let slot = self.tracks.iter().position(|t| t.kind == MediaKind::Video)?;

        let frame = loop {
            let candidate = match self.tracks[slot].pending.take() {
                Some(frame) => frame,
                None => {
                    if self.tracks[slot].ended {
                        return None;
                    }
                    let queue = self.tracks[slot].queue.clone();
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        item = queue.pop() => match item {
                            QueueItem::Frame(frame) => frame,
                            QueueItem::EndOfStream => {
                                self.tracks[slot].ended = true;
                                return None;
                            }
                        },
                    }
                }
            };
            match min_pts {
                Some(min) if candidate.pts() < min => continue,
                _ => break candidate,
            }
        };

        let pts = frame.pts();
        tokio::select! {
            _ = self.cancel.cancelled() => return None,
            _ = self.sink.deliver(frame) => {}
        }
        self.stats.lock().frames_delivered += 1;
        self.position_ms.store(pts.as_millis() as u64, Ordering::Release);
        Some(pts)
    }
}
