//! # Demux Coordinator
//!
//! Single task owning the [`Demuxer`]: reads container packets in file
//! order, stamps them with the current session generation, and routes
//! them to the matching track pipeline over bounded channels (a full
//! channel backpressures the read loop instead of dropping packets).
//!
//! Control commands are drained between reads and — crucially — while a
//! routing send is parked on a full channel, so a seek issued during
//! paused playback takes effect immediately.

use crate::config::SharedStats;
use crate::error::{PlayerError, Result};
use crate::pipeline::TrackMsg;
use crate::traits::{Demuxer, Packet, PacketFilter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Command accepted by the demux coordinator.
pub enum DemuxCommand {
    /// Discard buffered packets and resume reading from the nearest
    /// keyframe at or before `target`. Responds with the achieved
    /// position.
    Seek {
        target: Duration,
        ack: oneshot::Sender<Result<Duration>>,
    },
    /// Route packets of `track_index` to `sender`.
    SetRoute {
        track_index: u32,
        sender: mpsc::Sender<TrackMsg>,
    },
    /// Stop routing packets of `track_index`.
    ClearRoute { track_index: u32 },
    /// Replace the bitstream filter applied to packets before routing.
    SetBitstreamFilter(Option<Box<dyn PacketFilter>>),
}

/// Out-of-band report from the demux coordinator to the control task.
#[derive(Debug)]
pub enum DemuxNotice {
    /// End of stream reached; `Eos` was forwarded to every route.
    EndOfStream,
    /// Fatal read error; the current source is unusable.
    Fatal(String),
}

/// Reads the active source and feeds the track pipelines.
pub struct DemuxCoordinator {
    demuxer: Box<dyn Demuxer>,
    bitstream_filter: Option<Box<dyn PacketFilter>>,
    routes: HashMap<u32, mpsc::Sender<TrackMsg>>,
    generation: Arc<AtomicU64>,
    cmd_rx: mpsc::Receiver<DemuxCommand>,
    notice_tx: mpsc::Sender<DemuxNotice>,
    cancel: CancellationToken,
    stats: SharedStats,
}

impl DemuxCoordinator {
    pub fn new(
        demuxer: Box<dyn Demuxer>,
        generation: Arc<AtomicU64>,
        cmd_rx: mpsc::Receiver<DemuxCommand>,
        notice_tx: mpsc::Sender<DemuxNotice>,
        cancel: CancellationToken,
        stats: SharedStats,
    ) -> Self {
        Self {
            demuxer,
            bitstream_filter: None,
            routes: HashMap::new(),
            generation,
            cmd_rx,
            notice_tx,
            cancel,
            stats,
        }
    }

    /// Run the coordinator until cancelled or the command channel closes.
    pub async fn run(mut self) {
        info!("demux coordinator started");
        let mut at_eof = false;

        loop {
            // Drain pending commands without blocking.
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                if self.handle_command(cmd).await {
                    at_eof = false;
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            if at_eof {
                // Idle until a seek arrives; the source is exhausted.
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                at_eof = false;
                            }
                        }
                        None => break,
                    },
                }
                continue;
            }

            match self.demuxer.read_packet().await {
                Ok(Some(packet)) => {
                    if !self.dispatch(packet).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("demuxer reached end of stream");
                    self.forward_eos().await;
                    let _ = self.notice_tx.send(DemuxNotice::EndOfStream).await;
                    at_eof = true;
                }
                Err(e) => {
                    error!(error = %e, "fatal demux read error");
                    let _ = self.notice_tx.send(DemuxNotice::Fatal(e.to_string())).await;
                    break;
                }
            }
        }

        info!("demux coordinator stopped");
    }

    /// Apply the bitstream filter and route the resulting packets.
    /// Returns `false` when the coordinator should shut down.
    async fn dispatch(&mut self, packet: Packet) -> bool {
        let packets = match &mut self.bitstream_filter {
            Some(filter) => match filter.apply(packet.clone()) {
                Ok(packets) => packets,
                Err(e) => {
                    // Filter trouble never stalls demux; pass through.
                    tracing::warn!(error = %e, "bitstream filter failed, passing packet through");
                    vec![packet]
                }
            },
            None => vec![packet],
        };

        for packet in packets {
            if !self.route_packet(packet).await {
                return false;
            }
        }
        true
    }

    /// Route one packet, keeping the command channel responsive while the
    /// destination is full. Returns `false` on shutdown.
    async fn route_packet(&mut self, packet: Packet) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        let track_index = packet.track_index;
        let Some(sender) = self.routes.get(&track_index).cloned() else {
            trace!(track = track_index, "no route, dropping packet");
            return true;
        };

        let msg = TrackMsg::Packet { packet, generation };
        let send = sender.send(msg);
        tokio::pin!(send);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        self.handle_command(cmd).await;
                        // A flush-class command makes this packet stale.
                        if self.generation.load(Ordering::Acquire) != generation {
                            return true;
                        }
                    }
                    None => return false,
                },
                res = &mut send => {
                    if res.is_err() {
                        // Pipeline went away; the route is dead.
                        self.routes.remove(&track_index);
                    } else {
                        self.stats.lock().packets_routed += 1;
                    }
                    return true;
                }
            }
        }
    }

    /// Handle one command. Returns `true` when it resumes reading after
    /// EOF (a successful seek).
    async fn handle_command(&mut self, cmd: DemuxCommand) -> bool {
        match cmd {
            DemuxCommand::Seek { target, ack } => {
                debug!(target_ms = target.as_millis() as u64, "demux seek");
                // Bump first: packets already read but not yet routed keep
                // the old stamp and get dropped at the queues.
                self.generation.fetch_add(1, Ordering::AcqRel);
                let result = self.demuxer.seek(target).await;
                let resumed = result.is_ok();
                let _ = ack.send(result);
                resumed
            }
            DemuxCommand::SetRoute {
                track_index,
                sender,
            } => {
                debug!(track = track_index, "route set");
                self.routes.insert(track_index, sender);
                false
            }
            DemuxCommand::ClearRoute { track_index } => {
                debug!(track = track_index, "route cleared");
                self.routes.remove(&track_index);
                false
            }
            DemuxCommand::SetBitstreamFilter(filter) => {
                self.bitstream_filter = filter;
                false
            }
        }
    }

    /// Forward end-of-stream to every active route.
    async fn forward_eos(&mut self) {
        let generation = self.generation.load(Ordering::Acquire);
        for sender in self.routes.values() {
            let _ = sender.send(TrackMsg::Eos { generation }).await;
        }
    }
}
