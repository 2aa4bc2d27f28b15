//! The video track encoder.
//!
//! There is no capture thread: the renderer pushes frame-ready events and
//! writing to the codec's input surface *is* submission. The worker here
//! reacts to events, forwards frames to the surface, and drains whatever
//! compressed output is available. Stop has no input-buffer path to carry an
//! end-of-stream flag, so it uses the codec's dedicated signal and then
//! drains until the device reports end-of-stream on its output.

use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;

use flume::Receiver;
use tracing::{debug, info};

use super::{notify_limit_reached, spawn_worker, DrainOutcome, EncoderCore, TrackSignals};
use crate::codec::{VideoCodec, VideoFrame};
use crate::pool::Lease;
use crate::EncodingError;

/// The container rejects a stream whose leading run carries no sync point;
/// always render the first few frames so one shows up early.
const ALWAYS_RENDER_FRAMES: u64 = 10;

/// Beyond this many queued frame events the worker is falling behind and new
/// frames are dropped rather than queued deeper.
const MAX_PENDING_FRAMES: usize = 2;

pub(crate) enum VideoEvent {
    Frame(Lease<VideoFrame>),
    Filter(Box<dyn Any + Send>),
    Stop,
    Abort,
}

pub(crate) struct VideoEncoder {
    pub join: JoinHandle<()>,
}

pub(crate) fn spawn(
    codec: Box<dyn VideoCodec>,
    core: EncoderCore,
    events: Receiver<VideoEvent>,
    signals: Arc<TrackSignals>,
) -> VideoEncoder {
    let worker = Worker {
        codec,
        events,
        core,
        signals,
        frame_number: 0,
        first_pts_us: None,
    };
    VideoEncoder {
        join: spawn_worker("video-encode", move || worker.run()),
    }
}

struct Worker {
    codec: Box<dyn VideoCodec>,
    events: Receiver<VideoEvent>,
    core: EncoderCore,
    signals: Arc<TrackSignals>,
    frame_number: u64,
    first_pts_us: Option<i64>,
}

impl Worker {
    fn run(mut self) {
        info!("video encoder running");
        if let Err(error) = self.process() {
            self.core.abandon(self.codec.as_mut(), error);
        }
        info!("video encoder exiting");
    }

    fn process(&mut self) -> Result<(), EncodingError> {
        self.codec.start()?;

        while let Ok(event) = self.events.recv() {
            match event {
                VideoEvent::Filter(filter) => {
                    debug!("applying live filter change");
                    self.codec.apply_filter(filter);
                }
                VideoEvent::Frame(frame) => {
                    if let DrainOutcome::Eos = self.on_frame(frame)? {
                        return Ok(());
                    }
                }
                VideoEvent::Stop => {
                    debug!("stop event, signaling end of input stream");
                    self.codec.signal_end_of_input()?;
                    self.core.drain(self.codec.as_mut(), true)?;
                    return Ok(());
                }
                VideoEvent::Abort => {
                    self.codec.release();
                    return Ok(());
                }
            }
        }

        // Event channel gone without a stop; release without flushing.
        self.codec.release();
        Ok(())
    }

    fn on_frame(&mut self, frame: Lease<VideoFrame>) -> Result<DrainOutcome, EncodingError> {
        let pts_us = frame.timestamp_us();
        if !self.should_render(pts_us) {
            // The lease recycles into the frame pool on drop.
            return Ok(DrainOutcome::Idle);
        }
        self.frame_number += 1;

        let first = *self.first_pts_us.get_or_insert(pts_us);
        if let Some(max) = self.core.max_length_us()
            && pts_us - first > max
        {
            notify_limit_reached(&self.signals, self.core.controller());
        }

        self.codec.render_frame(&frame)?;
        drop(frame);
        self.core.drain(self.codec.as_mut(), false)
    }

    fn should_render(&self, pts_us: i64) -> bool {
        if pts_us == 0 {
            // Not a real capture timestamp.
            return false;
        }
        if self.signals.stop_requested() || self.signals.limit_reached() {
            return false;
        }
        if self.frame_number < ALWAYS_RENDER_FRAMES {
            return true;
        }
        if self.events.len() > MAX_PENDING_FRAMES {
            debug!(pending = self.events.len(), "dropping frame, worker is behind");
            return false;
        }
        true
    }
}
