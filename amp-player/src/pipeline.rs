//! # Track Pipeline
//!
//! Per-track decode stage: receives demuxed packets over a bounded
//! channel, decodes them, runs the optional frame filter, and pushes the
//! resulting frames into the track's frame queue.
//!
//! One pipeline task exists per active stream. Per-packet decode errors
//! are logged and skipped (best effort); only decoder *initialization*
//! failures are fatal for a track, and those are handled by the control
//! task before a pipeline is ever spawned.

use crate::config::SharedStats;
use crate::queue::{FrameQueue, PushOutcome, QueueItem};
use crate::traits::{Frame, FrameDecoder, FrameFilter, Packet, StreamInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Message consumed by a track pipeline.
pub enum TrackMsg {
    /// A demuxed packet stamped with the session generation current when
    /// the demux coordinator routed it.
    Packet { packet: Packet, generation: u64 },
    /// Reset decoder state and flush the frame queue up to `generation`.
    Flush { generation: u64 },
    /// The demuxer reached end of stream; after draining, the pipeline
    /// enqueues `QueueItem::EndOfStream`.
    Eos { generation: u64 },
    /// Replace the frame filter without restarting the pipeline.
    SetFilter(Option<Box<dyn FrameFilter>>),
}

/// Decode stage for one elementary stream.
pub struct TrackPipeline {
    stream: StreamInfo,
    decoder: Box<dyn FrameDecoder>,
    filter: Option<Box<dyn FrameFilter>>,
    queue: FrameQueue,
    rx: mpsc::Receiver<TrackMsg>,
    cancel: CancellationToken,
    stats: SharedStats,
}

impl TrackPipeline {
    pub fn new(
        stream: StreamInfo,
        decoder: Box<dyn FrameDecoder>,
        filter: Option<Box<dyn FrameFilter>>,
        queue: FrameQueue,
        rx: mpsc::Receiver<TrackMsg>,
        cancel: CancellationToken,
        stats: SharedStats,
    ) -> Self {
        Self {
            stream,
            decoder,
            filter,
            queue,
            rx,
            cancel,
            stats,
        }
    }

    /// Run the pipeline until cancelled or the packet channel closes.
    pub async fn run(mut self) {
        debug!(
            track = self.stream.index,
            kind = %self.stream.kind,
            "track pipeline started"
        );

        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match msg {
                TrackMsg::Packet { packet, generation } => {
                    self.handle_packet(packet, generation).await;
                }
                TrackMsg::Flush { generation } => {
                    self.decoder.flush();
                    self.queue.flush(generation);
                    trace!(
                        track = self.stream.index,
                        generation,
                        "pipeline flushed"
                    );
                }
                TrackMsg::Eos { generation } => {
                    self.queue.push(QueueItem::EndOfStream, generation).await;
                    debug!(track = self.stream.index, "end of stream reached");
                }
                TrackMsg::SetFilter(filter) => {
                    debug!(
                        track = self.stream.index,
                        installed = filter.is_some(),
                        "frame filter replaced"
                    );
                    self.filter = filter;
                }
            }
        }

        debug!(track = self.stream.index, "track pipeline stopped");
    }

    async fn handle_packet(&mut self, packet: Packet, generation: u64) {
        // A flush already superseded this packet; skip the decode work.
        if generation < self.queue.generation() {
            return;
        }

        let pts = packet.pts;
        let frames = match self.decoder.decode(packet).await {
            Ok(frames) => frames,
            Err(e) => {
                // Best effort: single-packet decode failures are skipped.
                warn!(
                    track = self.stream.index,
                    pts_ms = pts.as_millis() as u64,
                    error = %e,
                    "decode failed, skipping packet"
                );
                self.stats.lock().decode_errors += 1;
                return;
            }
        };

        for frame in frames {
            for out in self.apply_filter(frame) {
                self.stats.lock().frames_decoded += 1;
                if self.queue.push(QueueItem::Frame(out), generation).await
                    == PushOutcome::DroppedStale
                {
                    self.stats.lock().frames_dropped_stale += 1;
                }
            }
        }
    }

    fn apply_filter(&mut self, frame: Frame) -> Vec<Frame> {
        let Some(filter) = &mut self.filter else {
            return vec![frame];
        };

        match filter.apply(frame.clone()) {
            Ok(out) => out,
            Err(e) => {
                warn!(
                    track = self.stream.index,
                    error = %e,
                    "frame filter failed, passing frame through"
                );
                vec![frame]
            }
        }
    }
}
