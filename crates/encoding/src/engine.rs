//! The engine façade and the controller the track encoders report to.
//!
//! Lifecycle of a session:
//!
//! 1. [`EncoderEngine::new`] computes the effective duration limit (size
//!    bounds are converted to duration bounds up front) and decides which
//!    end reason would fire.
//! 2. [`EncoderEngine::start`] spawns the per-track workers. Each codec
//!    settles on a real output format and registers it through
//!    [`Controller::notify_started`]; when the last track registers, the
//!    muxer starts and the listener hears `on_encoding_start`.
//! 3. Tracks hand compressed records to [`Controller::write`], serialized
//!    under the controller lock. No track writes before every track has
//!    registered.
//! 4. A stop (from the caller, from every track hitting the limit, or from
//!    a fatal error) fans out once; each encoder flushes, releases, and
//!    calls [`Controller::notify_released`]. The last release finishes the
//!    muxer and fires `on_encoding_end` exactly once.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::Sender;
use reel_media_info::{AudioInfo, TrackFormat, VideoInfo};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{AudioCodec, ChunkInfo, VideoCodec, VideoFrame};
use crate::encoders::audio::{self, AudioSource};
use crate::encoders::video::{self, VideoEvent};
use crate::encoders::{EncoderCore, TrackSignals};
use crate::muxer::{Muxer, Sample};
use crate::pool::{Lease, Pool};
use crate::EncodingError;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The caller asked for the stop.
    User,
    /// The duration limit was reached.
    MaxDuration,
    /// The size limit (converted to a duration bound) was reached.
    MaxSize,
}

/// Receives session lifecycle events. Callbacks fire on encoder threads and
/// must not block for long.
pub trait EngineListener: Send + Sync {
    /// Every track registered its format and the muxer is running.
    fn on_encoding_start(&self) {}

    /// A stop was dispatched; encoders are still draining, the terminal
    /// callback follows shortly.
    fn on_encoding_stop(&self) {}

    /// The session is over. Fires exactly once. A non-`None` error means the
    /// output must be discarded, whatever the reason says.
    fn on_encoding_end(&self, reason: EndReason, error: Option<EncodingError>);
}

/// Events the caller pushes into a running engine.
pub enum EngineEvent {
    /// A new video frame is ready on the input surface.
    Frame(Lease<VideoFrame>),
    /// Swap the live filter the surface renders through.
    Filter(Box<dyn Any + Send>),
}

/// Recording bounds. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub max_duration: Option<Duration>,
    pub max_size_bytes: Option<u64>,
}

impl Limits {
    /// Convert the size bound into a duration bound and pick the effective
    /// limit. Checking size per sample would be expensive and container
    /// overhead is unpredictable, so the estimate
    /// `max_size / (total_bit_rate / 8)` is computed once and the end reason
    /// that would fire is decided ahead of time.
    fn resolve(&self, total_bit_rate: u32) -> (Option<i64>, EndReason) {
        let byte_rate = u64::from(total_bit_rate / 8);
        let size_us = self
            .max_size_bytes
            .filter(|_| byte_rate > 0)
            .map(|size| (size.saturating_mul(1_000_000) / byte_rate) as i64);
        let duration_us = self.max_duration.map(|d| d.as_micros() as i64);

        match (size_us, duration_us) {
            (Some(s), Some(d)) if s < d => (Some(s), EndReason::MaxSize),
            (Some(_), Some(d)) => (Some(d), EndReason::MaxDuration),
            (Some(s), None) => (Some(s), EndReason::MaxSize),
            (None, Some(d)) => (Some(d), EndReason::MaxDuration),
            (None, None) => (None, EndReason::User),
        }
    }
}

/// The video track: its parameters and the surface-fed codec device.
pub struct VideoTrack {
    pub info: VideoInfo,
    pub codec: Box<dyn VideoCodec>,
}

/// The audio track: parameters, buffer-fed codec device, and the raw source.
pub struct AudioTrack {
    pub info: AudioInfo,
    pub codec: Box<dyn AudioCodec>,
    pub source: Box<dyn AudioSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Preparing,
    Muxing,
    Draining,
    Ended,
}

enum StopHandle {
    Video {
        signals: Arc<TrackSignals>,
        events: Sender<VideoEvent>,
    },
    Audio {
        signals: Arc<TrackSignals>,
    },
}

impl StopHandle {
    fn dispatch(&self) {
        match self {
            StopHandle::Video { signals, events } => {
                signals.signal_stop();
                let _ = events.send(VideoEvent::Stop);
            }
            StopHandle::Audio { signals } => signals.signal_stop(),
        }
    }
}

struct ControllerState {
    session: SessionState,
    muxer: Option<Box<dyn Muxer>>,
    total_tracks: usize,
    registered_tracks: usize,
    /// Tracks that registered and have not requested a stop yet.
    active_tracks: usize,
    released_tracks: usize,
    muxer_started: bool,
    failed: bool,
    end_reason: EndReason,
    possible_end_reason: EndReason,
    first_error: Option<EncodingError>,
    stop_handles: Vec<StopHandle>,
    stop_dispatched: bool,
}

struct ControllerShared {
    listener: Box<dyn EngineListener>,
    state: Mutex<ControllerState>,
}

/// Handle the track encoders use to report into the session. All methods are
/// callable from any thread; listener callbacks are invoked with the state
/// lock released.
#[derive(Clone)]
pub(crate) struct Controller {
    shared: Arc<ControllerShared>,
}

impl Controller {
    fn new(
        muxer: Box<dyn Muxer>,
        total_tracks: usize,
        possible_end_reason: EndReason,
        listener: Box<dyn EngineListener>,
    ) -> Self {
        Self {
            shared: Arc::new(ControllerShared {
                listener,
                state: Mutex::new(ControllerState {
                    session: SessionState::Preparing,
                    muxer: Some(muxer),
                    total_tracks,
                    registered_tracks: 0,
                    active_tracks: 0,
                    released_tracks: 0,
                    muxer_started: false,
                    failed: false,
                    end_reason: EndReason::User,
                    possible_end_reason,
                    first_error: None,
                    stop_handles: Vec::new(),
                    stop_dispatched: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.shared.state.lock().unwrap()
    }

    fn add_stop_handle(&self, handle: StopHandle) {
        self.lock().stop_handles.push(handle);
    }

    /// Whether the muxer has started. Tracks must not hand over output until
    /// this is true; anything drained earlier is dropped.
    pub fn is_started(&self) -> bool {
        let state = self.lock();
        state.muxer_started && !state.failed
    }

    pub fn is_ended(&self) -> bool {
        self.lock().session == SessionState::Ended
    }

    /// Register one track's output format. When the last expected track
    /// registers, the muxer starts and the listener is told, strictly
    /// before any write goes through.
    pub fn notify_started(&self, format: &TrackFormat) -> Result<usize, EncodingError> {
        let track;
        let all_registered;
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.session == SessionState::Ended {
                return Err(EncodingError::Aborted);
            }
            if state.muxer_started || state.registered_tracks == state.total_tracks {
                return Err(EncodingError::FormatChangedTwice);
            }
            let Some(muxer) = state.muxer.as_mut() else {
                return Err(EncodingError::Aborted);
            };
            track = muxer.add_track(format)?;
            state.registered_tracks += 1;
            state.active_tracks += 1;
            all_registered = state.registered_tracks == state.total_tracks;
            info!(track, mime = format.mime(), "track registered with the muxer");

            if all_registered
                && let Err(e) = muxer.start()
            {
                drop(guard);
                return Err(self.fatal(EncodingError::Muxer(e)));
            }
        }

        if all_registered {
            info!("all tracks registered, muxer started");
            self.shared.listener.on_encoding_start();
            let mut state = self.lock();
            state.muxer_started = true;
            if state.session == SessionState::Preparing {
                state.session = SessionState::Muxing;
            }
        }
        Ok(track)
    }

    /// Write one compressed sample. Serialized under the controller lock;
    /// per-track order is the caller's drain order, nothing is reordered.
    pub fn write(
        &self,
        track: usize,
        info: &ChunkInfo,
        data: &[u8],
    ) -> Result<(), EncodingError> {
        let result = {
            let mut state = self.lock();
            if !state.muxer_started || state.failed {
                return Ok(());
            }
            let Some(muxer) = state.muxer.as_mut() else {
                return Ok(());
            };
            trace!(track, pts_us = info.pts_us, len = data.len(), "writing sample");
            muxer.write_sample(
                track,
                Sample {
                    data,
                    pts_us: info.pts_us,
                    key_frame: info.key_frame,
                },
            )
        };
        result.map_err(|e| self.fatal(EncodingError::Muxer(e)))
    }

    /// A track's own policy (the duration limit) wants the session to stop.
    /// Once every active track has asked, the precomputed end reason is
    /// recorded and a real stop fans out.
    pub fn request_stop(&self, track: usize) {
        let dispatch;
        {
            let mut state = self.lock();
            if state.stop_dispatched || state.session == SessionState::Ended {
                return;
            }
            debug!(track, "track requested a stop");
            state.active_tracks = state.active_tracks.saturating_sub(1);
            dispatch = state.active_tracks == 0;
            if dispatch {
                state.end_reason = state.possible_end_reason;
            }
        }
        if dispatch {
            info!("every track has requested a stop");
            self.dispatch_stop();
        }
    }

    /// Fan the stop out to every track, once.
    pub fn dispatch_stop(&self) {
        let handles;
        {
            let mut state = self.lock();
            if state.stop_dispatched || state.session == SessionState::Ended {
                return;
            }
            state.stop_dispatched = true;
            state.session = SessionState::Draining;
            handles = std::mem::take(&mut state.stop_handles);
        }
        info!("stopping all tracks");
        self.shared.listener.on_encoding_stop();
        for handle in &handles {
            handle.dispatch();
        }
    }

    /// A track finished draining and released its codec. The last release
    /// finishes the muxer and fires the terminal callback.
    pub fn notify_released(&self, track: Option<usize>) {
        let (muxer, reason, error) = {
            let mut state = self.lock();
            if state.session == SessionState::Ended {
                return;
            }
            state.released_tracks += 1;
            info!(
                ?track,
                released = state.released_tracks,
                total = state.total_tracks,
                "track released"
            );
            if state.released_tracks < state.total_tracks {
                return;
            }
            state.session = SessionState::Ended;
            (
                state.muxer.take(),
                state.end_reason,
                state.first_error.take(),
            )
        };
        self.finish(muxer, reason, error, None);
    }

    /// Record a session-fatal error (first error wins) and stop everything.
    /// Returns the error for propagation at the failure site.
    pub fn fatal(&self, error: EncodingError) -> EncodingError {
        error!(%error, "session-fatal error");
        {
            let mut state = self.lock();
            state.failed = true;
            if state.first_error.is_none() {
                state.first_error = Some(error.clone());
            }
        }
        self.dispatch_stop();
        error
    }

    /// End the session immediately, without waiting for track releases. Used
    /// for stop-before-start and for the hard-stop path.
    fn end_now(&self, default_error: Option<EncodingError>) {
        let (muxer, reason, error) = {
            let mut state = self.lock();
            if state.session == SessionState::Ended {
                return;
            }
            state.session = SessionState::Ended;
            (
                state.muxer.take(),
                state.end_reason,
                state.first_error.take(),
            )
        };
        self.finish(muxer, reason, error, default_error);
    }

    fn finish(
        &self,
        muxer: Option<Box<dyn Muxer>>,
        reason: EndReason,
        mut error: Option<EncodingError>,
        default_error: Option<EncodingError>,
    ) {
        if let Some(mut muxer) = muxer {
            info!("finishing the muxer");
            // A muxer that was never fed data is allowed to fail here; that
            // failure is the signal that something went wrong earlier.
            if let Err(e) = muxer.finish() {
                error!("muxer finish failed: {e}");
                error.get_or_insert(EncodingError::Muxer(e));
            }
        }
        if error.is_none() {
            error = default_error;
        }
        info!(?reason, failed = error.is_some(), "encoding ended");
        self.shared.listener.on_encoding_end(reason, error);
    }
}

struct PendingTracks {
    video: VideoTrack,
    audio: Option<AudioTrack>,
    video_events_rx: flume::Receiver<VideoEvent>,
}

/// The entry point for recording sessions. One instance per session; never
/// reused.
pub struct EncoderEngine {
    controller: Controller,
    origin: Instant,
    max_length_us: Option<i64>,
    frame_pool: Pool<VideoFrame>,
    video_events: Sender<VideoEvent>,
    pending: Option<PendingTracks>,
    signals: Vec<Arc<TrackSignals>>,
    joins: Vec<JoinHandle<()>>,
    aborted: bool,
}

impl EncoderEngine {
    /// Build an engine for one video track and zero or one audio track,
    /// writing through the given muxer. Nothing runs until
    /// [`EncoderEngine::start`].
    pub fn new(
        muxer: Box<dyn Muxer>,
        video: VideoTrack,
        audio: Option<AudioTrack>,
        limits: Limits,
        listener: impl EngineListener + 'static,
    ) -> Self {
        let total_tracks = 1 + usize::from(audio.is_some());
        let total_bit_rate =
            video.info.bit_rate + audio.as_ref().map_or(0, |a| a.info.bit_rate);
        let (max_length_us, possible_end_reason) = limits.resolve(total_bit_rate);
        if let Some(us) = max_length_us {
            info!(
                max_length_ms = us / 1000,
                would_end_by = ?possible_end_reason,
                "computed effective duration limit"
            );
        }

        let (video_events, video_events_rx) = flume::unbounded();

        Self {
            controller: Controller::new(
                muxer,
                total_tracks,
                possible_end_reason,
                Box::new(listener),
            ),
            origin: Instant::now(),
            max_length_us,
            frame_pool: Pool::unbounded(VideoFrame::default),
            video_events,
            pending: Some(PendingTracks {
                video,
                audio,
                video_events_rx,
            }),
            signals: Vec::new(),
            joins: Vec::new(),
            aborted: false,
        }
    }

    /// Spawn the per-track workers. Events pushed before this call were
    /// queued and are processed once the video worker comes up.
    pub fn start(&mut self) {
        let Some(pending) = self.pending.take() else {
            warn!("start() called on a running engine, ignoring");
            return;
        };
        info!("starting encoders");

        // Every stop handle is registered before any worker runs, so a track
        // that fails during bring-up fans the stop out to all of them.
        let video_signals = TrackSignals::new();
        let audio_signals = pending.audio.as_ref().map(|_| TrackSignals::new());
        self.controller.add_stop_handle(StopHandle::Video {
            signals: video_signals.clone(),
            events: self.video_events.clone(),
        });
        if let Some(signals) = &audio_signals {
            self.controller.add_stop_handle(StopHandle::Audio {
                signals: signals.clone(),
            });
        }

        let video_core = EncoderCore::new(
            "video",
            self.controller.clone(),
            video_signals.clone(),
            self.max_length_us,
            true,
        );
        let video = video::spawn(
            pending.video.codec,
            video_core,
            pending.video_events_rx,
            video_signals.clone(),
        );
        self.signals.push(video_signals);
        self.joins.push(video.join);

        if let (Some(audio_track), Some(audio_signals)) = (pending.audio, audio_signals) {
            let audio_core = EncoderCore::new(
                "audio",
                self.controller.clone(),
                audio_signals.clone(),
                self.max_length_us,
                false,
            );
            let encoder = audio::spawn(
                audio_track,
                audio_core,
                self.controller.clone(),
                audio_signals.clone(),
                self.origin,
                self.max_length_us,
            );
            self.signals.push(audio_signals);
            self.joins.push(encoder.capture);
            self.joins.push(encoder.encode);
        }
    }

    /// Lease a frame from the pool, to be filled and handed back through
    /// [`EngineEvent::Frame`].
    pub fn acquire_frame(&self) -> Lease<VideoFrame> {
        self.frame_pool.acquire().expect("frame pool is unbounded")
    }

    /// Timestamps are measured relative to this instant.
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Push an event to the encoders.
    pub fn notify(&self, event: EngineEvent) {
        let send = match event {
            EngineEvent::Frame(frame) => self.video_events.send(VideoEvent::Frame(frame)),
            EngineEvent::Filter(filter) => self.video_events.send(VideoEvent::Filter(filter)),
        };
        if send.is_err() {
            debug!("event dropped, the video worker is gone");
        }
    }

    /// Cooperative stop: every encoder flushes what it already accepted,
    /// then the muxer finishes and the terminal callback fires. Idempotent.
    pub fn stop(&mut self) {
        if self.pending.take().is_some() {
            info!("stop before start, ending the session directly");
            self.controller.end_now(None);
            return;
        }
        self.controller.dispatch_stop();
    }

    /// Hard stop for abrupt external shutdown: skips the final flush,
    /// releases what can be released, and reports a discarded result through
    /// the terminal callback. The workers are left to exit on their own so a
    /// blocked capture read cannot stall the caller.
    pub fn abort(&mut self) {
        info!("abort requested");
        self.aborted = true;
        if self.pending.take().is_some() {
            self.controller.end_now(Some(EncodingError::Aborted));
            return;
        }
        for signals in &self.signals {
            signals.signal_abort();
        }
        let _ = self.video_events.send(VideoEvent::Abort);
        self.controller.end_now(Some(EncodingError::Aborted));
        self.joins.clear();
    }
}

impl Drop for EncoderEngine {
    fn drop(&mut self) {
        if self.aborted {
            return;
        }
        if self.pending.is_none() && !self.controller.is_ended() {
            self.controller.dispatch_stop();
        }
        for handle in self.joins.drain(..) {
            let _ = handle.join();
        }
    }
}
