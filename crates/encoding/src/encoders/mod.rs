//! The two track encoders and the drain machinery they share.

pub(crate) mod audio;
pub(crate) mod video;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec::{Codec, CodecPoll};
use crate::engine::Controller;
use crate::pool::Pool;
use crate::EncodingError;

/// Pause between polls while draining to end-of-stream with nothing ready.
const DRAIN_BACKOFF: Duration = Duration::from_micros(500);

/// Cross-thread flags for one track. The capture and encode sides of the
/// audio encoder share one of these; the video encoder keeps its own.
pub(crate) struct TrackSignals {
    stop: AtomicBool,
    abort: AtomicBool,
    limit_notified: AtomicBool,
    track: AtomicI64,
}

impl TrackSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            limit_notified: AtomicBool::new(false),
            track: AtomicI64::new(-1),
        })
    }

    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn signal_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn limit_reached(&self) -> bool {
        self.limit_notified.load(Ordering::SeqCst)
    }

    /// Muxer track index, once the format has been registered.
    pub fn track(&self) -> Option<usize> {
        let track = self.track.load(Ordering::SeqCst);
        (track >= 0).then_some(track as usize)
    }

    fn set_track(&self, track: usize) {
        self.track.store(track as i64, Ordering::SeqCst);
    }
}

/// Tell the controller this track hit its duration limit. Callable from
/// either of a track's threads; only the first call after the track has
/// registered goes through.
pub(crate) fn notify_limit_reached(signals: &TrackSignals, controller: &Controller) {
    let Some(track) = signals.track() else {
        return;
    };
    if !signals.limit_notified.swap(true, Ordering::SeqCst) {
        warn!(track, "max length reached, requesting stop");
        controller.request_stop(track);
    }
}

pub(crate) enum DrainOutcome {
    /// No more output available right now.
    Idle,
    /// The end-of-stream chunk was drained; the codec has been released.
    Eos,
}

/// Drain-side state shared by both encoder kinds: format registration,
/// presentation-time tracking, the duration limit, and the hand-off of
/// compressed chunks to the controller.
pub(crate) struct EncoderCore {
    name: &'static str,
    controller: Controller,
    signals: Arc<TrackSignals>,
    out_pool: Pool<Vec<u8>>,
    max_length_us: Option<i64>,
    require_key_frame: bool,
    key_frame_found: bool,
    first_pts_us: Option<i64>,
    last_pts_us: i64,
}

impl EncoderCore {
    pub fn new(
        name: &'static str,
        controller: Controller,
        signals: Arc<TrackSignals>,
        max_length_us: Option<i64>,
        require_key_frame: bool,
    ) -> Self {
        Self {
            name,
            controller,
            signals,
            out_pool: Pool::unbounded(Vec::new),
            max_length_us,
            require_key_frame,
            key_frame_found: false,
            first_pts_us: None,
            last_pts_us: 0,
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn max_length_us(&self) -> Option<i64> {
        self.max_length_us
    }

    /// Pull compressed output out of the codec and hand it to the controller.
    ///
    /// With `drain_all` unset this returns as soon as the device has nothing
    /// ready. With it set (the final flush) it polls until the end-of-stream
    /// chunk appears, releasing the codec before returning.
    pub fn drain<C>(&mut self, codec: &mut C, drain_all: bool) -> Result<DrainOutcome, EncodingError>
    where
        C: Codec + ?Sized,
    {
        loop {
            let mut buf = self
                .out_pool
                .acquire()
                .expect("output record pool is unbounded");
            buf.clear();

            match codec.poll_output(&mut buf)? {
                CodecPoll::Pending => {
                    drop(buf);
                    if !drain_all {
                        return Ok(DrainOutcome::Idle);
                    }
                    thread::sleep(DRAIN_BACKOFF);
                }
                CodecPoll::FormatChanged(format) => {
                    drop(buf);
                    if self.controller.is_started() {
                        return Err(EncodingError::FormatChangedTwice);
                    }
                    let track = self.controller.notify_started(&format)?;
                    self.signals.set_track(track);
                    info!(name = self.name, track, "registered output format");
                }
                CodecPoll::Chunk(info) => {
                    if !info.codec_config && !buf.is_empty() && self.controller.is_started() {
                        if self.first_pts_us.is_none() {
                            debug!(name = self.name, pts_us = info.pts_us, "first output chunk");
                            self.first_pts_us = Some(info.pts_us);
                        }
                        self.last_pts_us = info.pts_us;
                        self.write_chunk(codec, &info, &buf)?;
                    }
                    drop(buf);

                    if info.end_of_stream {
                        self.release(codec);
                        return Ok(DrainOutcome::Eos);
                    }

                    // The limit is also watched at capture time; this is the
                    // catch-all for tracks that produce no capture-side hint.
                    if !drain_all
                        && !self.signals.limit_reached()
                        && let Some(first) = self.first_pts_us
                        && let Some(max) = self.max_length_us
                        && self.last_pts_us - first > max
                    {
                        notify_limit_reached(&self.signals, &self.controller);
                        return Ok(DrainOutcome::Idle);
                    }
                }
            }
        }
    }

    fn write_chunk<C>(
        &mut self,
        codec: &mut C,
        info: &crate::codec::ChunkInfo,
        data: &[u8],
    ) -> Result<(), EncodingError>
    where
        C: Codec + ?Sized,
    {
        if self.require_key_frame && !self.key_frame_found {
            if !info.key_frame {
                warn!(name = self.name, "dropping output before the first key frame");
                codec.request_key_frame();
                return Ok(());
            }
            self.key_frame_found = true;
        }

        if let Some(track) = self.signals.track() {
            self.controller.write(track, info, data)?;
        }
        Ok(())
    }

    fn release<C>(&mut self, codec: &mut C)
    where
        C: Codec + ?Sized,
    {
        info!(name = self.name, "drained to end of stream, releasing codec");
        codec.release();
        self.out_pool.clear();
        self.controller.notify_released(self.signals.track());
    }

    /// A fatal error took this track out: record it, release the device, and
    /// still count the track as released so the session can end.
    pub fn abandon<C>(&mut self, codec: &mut C, error: EncodingError)
    where
        C: Codec + ?Sized,
    {
        error!(name = self.name, %error, "track failed, abandoning");
        self.controller.fatal(error);
        codec.release();
        self.out_pool.clear();
        self.controller.notify_released(self.signals.track());
    }
}

/// Spawn a named worker thread with the caller's tracing dispatcher
/// installed, so log lines from encoder threads land in the same subscriber.
pub(crate) fn spawn_worker(
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    let dispatcher = tracing::dispatcher::get_default(|d| d.clone());
    let span = tracing::error_span!("encoder", task = name);
    thread::spawn(move || tracing::dispatcher::with_default(&dispatcher, || span.in_scope(f)))
}
