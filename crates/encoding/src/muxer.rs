//! Seam to the container writer.
//!
//! The writer is a black box that accepts track registrations followed by
//! timestamped compressed samples. The engine guarantees the call order:
//! every `add_track` happens before `start`, every `write_sample` after it,
//! and `finish` exactly once at the end; within one track, samples arrive in
//! presentation order.

use reel_media_info::TrackFormat;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MuxerError {
    #[error("Track could not be added: {0}")]
    AddTrack(String),

    #[error("Muxer failed to start: {0}")]
    Start(String),

    #[error("Sample write failed: {0}")]
    Write(String),

    #[error("Muxer failed to finish: {0}")]
    Finish(String),
}

/// One compressed sample headed for the container.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub data: &'a [u8],
    /// Presentation timestamp in microseconds.
    pub pts_us: i64,
    pub key_frame: bool,
}

pub trait Muxer: Send {
    /// Register a track and return its index. Only valid before [`Muxer::start`].
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, MuxerError>;

    /// All tracks are registered; begin accepting samples.
    fn start(&mut self) -> Result<(), MuxerError>;

    /// Write one compressed sample to the given track.
    fn write_sample(&mut self, track: usize, sample: Sample<'_>) -> Result<(), MuxerError>;

    /// Finalize and close the container.
    fn finish(&mut self) -> Result<(), MuxerError>;
}
