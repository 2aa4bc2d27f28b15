//! A real-time multi-track encoding and muxing engine.
//!
//! The engine feeds raw video frames and raw audio samples to independent
//! codec devices running on their own threads, reconciles their timestamps,
//! and hands the compressed output to a container writer while honoring
//! duration/size limits and producing a deterministic shutdown.
//!
//! Frame/sample acquisition, rendering, the codec devices and the container
//! writer itself are collaborators: they live behind the [`codec`] and
//! [`muxer`] traits and are injected at construction.

pub mod codec;
pub mod muxer;
pub mod pool;

mod encoders;
mod engine;
mod noise;
mod timestamp;

pub use codec::{AudioCodec, ChunkInfo, Codec, CodecError, CodecPoll, InputSlot, VideoCodec, VideoFrame};
pub use encoders::audio::{AudioSource, AudioSourceError};
pub use engine::{
    AudioTrack, EncoderEngine, EndReason, EngineEvent, EngineListener, Limits, VideoTrack,
};
pub use muxer::{Muxer, MuxerError, Sample};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EncodingError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Muxer error: {0}")]
    Muxer(#[from] MuxerError),

    #[error("Track tried to register a second output format")]
    FormatChangedTwice,

    #[error("Encoding was aborted before it could complete")]
    Aborted,
}
