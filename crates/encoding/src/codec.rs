//! Seams to the codec devices.
//!
//! The engine never talks to a concrete encoder implementation; it drives
//! whatever the caller injects through these traits. The protocol mirrors a
//! hardware codec: input is submitted into device-owned slots (audio) or by
//! presenting frames to an input surface (video), and compressed output is
//! polled out together with a descriptor.

use std::any::Any;
use std::time::Duration;

use reel_media_info::TrackFormat;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("Codec failed to start: {0}")]
    Start(String),

    #[error("Codec rejected input: {0}")]
    Input(String),

    #[error("Codec output failed: {0}")]
    Output(String),
}

/// Descriptor for one compressed buffer drained out of a codec.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo {
    /// Presentation timestamp in microseconds.
    pub pts_us: i64,
    /// The chunk starts a sync point; the container may seek to it.
    pub key_frame: bool,
    /// Configuration data, already conveyed by the track format. Not written.
    pub codec_config: bool,
    /// No further output will follow.
    pub end_of_stream: bool,
}

/// Result of one non-blocking drain step.
pub enum CodecPoll {
    /// Nothing to drain right now.
    Pending,
    /// The device settled on its real output format. Happens once, before any
    /// chunk, and carries what the muxer needs to register the track.
    FormatChanged(TrackFormat),
    /// A compressed chunk; its bytes were appended to the caller's buffer.
    Chunk(ChunkInfo),
}

/// A free input slot handed out by an audio codec.
#[derive(Debug, Clone, Copy)]
pub struct InputSlot(pub usize);

/// Behavior shared by both codec kinds: bring-up, draining, teardown.
pub trait Codec: Send {
    /// Bring the device up. Runs on the owning encoder thread so a slow or
    /// failing configure call never blocks the caller.
    fn start(&mut self) -> Result<(), CodecError>;

    /// One non-blocking drain step. On [`CodecPoll::Chunk`] the compressed
    /// bytes have been appended to `buf`.
    fn poll_output(&mut self, buf: &mut Vec<u8>) -> Result<CodecPoll, CodecError>;

    /// Ask the device to produce a sync point at the earliest opportunity.
    fn request_key_frame(&mut self) {}

    /// Tear the device down. Called exactly once, after the final drain (or
    /// on abandonment); no other method is called afterwards.
    fn release(&mut self);
}

/// A buffer-fed codec: raw samples are copied into device slots.
pub trait AudioCodec: Codec {
    /// Try to dequeue a free input slot without blocking.
    fn try_input_slot(&mut self) -> Result<Option<InputSlot>, CodecError>;

    /// Submit `data` with its presentation timestamp into a previously
    /// dequeued slot. With `end_of_stream` set, `data` is ignored and the
    /// device is told no further input will arrive.
    fn queue_input(
        &mut self,
        slot: InputSlot,
        data: &[u8],
        pts_us: i64,
        end_of_stream: bool,
    ) -> Result<(), CodecError>;
}

/// A surface-fed codec: presenting a frame *is* submission, so there is no
/// input-slot step and end-of-stream needs a dedicated signal.
pub trait VideoCodec: Codec {
    /// Transform, position and present one frame on the input surface.
    fn render_frame(&mut self, frame: &VideoFrame) -> Result<(), CodecError>;

    /// Swap the live filter the surface renders through. The payload is
    /// opaque to the engine.
    fn apply_filter(&mut self, filter: Box<dyn Any + Send>);

    /// Tell the device no further frames will be presented.
    fn signal_end_of_input(&mut self) -> Result<(), CodecError>;
}

/// One video frame queued for the input surface.
///
/// The pixel data itself lives surface-side; this is the capture timestamp
/// plus the texture transform the renderer should apply.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Capture time relative to the session origin.
    pub timestamp: Duration,
    /// Column-major 4x4 texture transform.
    pub transform: [f32; 16],
}

impl VideoFrame {
    #[rustfmt::skip]
    pub const IDENTITY: [f32; 16] = [
        1.0, 0.0, 0.0, 0.0,
        0.0, 1.0, 0.0, 0.0,
        0.0, 0.0, 1.0, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ];

    pub fn timestamp_us(&self) -> i64 {
        self.timestamp.as_micros() as i64
    }
}

impl Default for VideoFrame {
    fn default() -> Self {
        Self {
            timestamp: Duration::ZERO,
            transform: Self::IDENTITY,
        }
    }
}
