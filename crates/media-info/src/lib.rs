//! Plain-data descriptions of the tracks a recording session produces.
//!
//! These types carry no behavior beyond derived arithmetic; the encoding
//! engine, the codec devices and the container writer all agree on them.

use thiserror::Error;

/// Mime type for H.264/AVC video tracks.
pub const VIDEO_AVC: &str = "video/avc";
/// Mime type for AAC LC audio tracks.
pub const AUDIO_AAC: &str = "audio/mp4a-latm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Error)]
pub enum AudioInfoError {
    #[error("Unsupported number of channels: {0}")]
    Channels(u16),
}

/// Parameters of the raw audio stream and its encoded counterpart.
///
/// Raw samples are always 16-bit interleaved PCM; the capture device hands
/// them over in fixed-size chunks of [`AudioInfo::chunk_size`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioInfo {
    pub mime: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Encoded bit rate, bits/sec.
    pub bit_rate: u32,
}

impl AudioInfo {
    /// Bytes per sample per channel (16-bit PCM).
    pub const SAMPLE_SIZE: usize = 2;
    /// Bytes per chunk per channel.
    pub const CHUNK_BYTES_PER_CHANNEL: usize = 1024;

    pub fn new(
        mime: impl Into<String>,
        sample_rate: u32,
        channels: u16,
        bit_rate: u32,
    ) -> Result<Self, AudioInfoError> {
        if channels == 0 || channels > 2 {
            return Err(AudioInfoError::Channels(channels));
        }

        Ok(Self {
            mime: mime.into(),
            sample_rate,
            channels,
            bit_rate,
        })
    }

    /// Raw byte rate, bytes/sec across all channels.
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * Self::SAMPLE_SIZE as u32 * u32::from(self.channels)
    }

    /// Size in bytes of one capture chunk.
    pub fn chunk_size(&self) -> usize {
        Self::CHUNK_BYTES_PER_CHANNEL * usize::from(self.channels)
    }

    /// Nominal duration of `bytes` of raw audio, in microseconds.
    pub fn bytes_to_us(&self, bytes: u64) -> i64 {
        ((1_000_000 * bytes) / u64::from(self.byte_rate())) as i64
    }

    /// Nominal duration of one capture chunk, in microseconds.
    pub fn chunk_duration_us(&self) -> i64 {
        self.bytes_to_us(self.chunk_size() as u64)
    }

    pub fn format(&self) -> TrackFormat {
        TrackFormat::Audio {
            mime: self.mime.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Parameters of the encoded video stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    /// Target frames/sec.
    pub frame_rate: u32,
    /// Encoded bit rate, bits/sec.
    pub bit_rate: u32,
    /// Rotation hint in degrees, written to the container as metadata.
    pub rotation: u32,
}

impl VideoInfo {
    pub fn new(
        mime: impl Into<String>,
        width: u32,
        height: u32,
        frame_rate: u32,
        bit_rate: u32,
    ) -> Self {
        Self {
            mime: mime.into(),
            width,
            height,
            frame_rate,
            bit_rate,
            rotation: 0,
        }
    }

    pub fn with_rotation(mut self, rotation: u32) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn format(&self) -> TrackFormat {
        TrackFormat::Video {
            mime: self.mime.clone(),
            width: self.width,
            height: self.height,
            rotation: self.rotation,
        }
    }
}

/// The output format a codec settles on once it has seen real input.
///
/// Registered with the container writer to obtain a track index. Mirrors the
/// shape of the corresponding info struct but is produced by the codec, which
/// may legitimately differ from what was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackFormat {
    Video {
        mime: String,
        width: u32,
        height: u32,
        rotation: u32,
    },
    Audio {
        mime: String,
        sample_rate: u32,
        channels: u16,
    },
}

impl TrackFormat {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackFormat::Video { .. } => TrackKind::Video,
            TrackFormat::Audio { .. } => TrackKind::Audio,
        }
    }

    pub fn mime(&self) -> &str {
        match self {
            TrackFormat::Video { mime, .. } | TrackFormat::Audio { mime, .. } => mime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cd_quality_mono() -> AudioInfo {
        AudioInfo::new(AUDIO_AAC, 44_100, 1, 64_000).unwrap()
    }

    #[test]
    fn audio_byte_rate_accounts_for_channels() {
        let mono = cd_quality_mono();
        assert_eq!(mono.byte_rate(), 88_200);
        assert_eq!(mono.chunk_size(), 1024);

        let stereo = AudioInfo::new(AUDIO_AAC, 44_100, 2, 128_000).unwrap();
        assert_eq!(stereo.byte_rate(), 176_400);
        assert_eq!(stereo.chunk_size(), 2048);
    }

    #[test]
    fn audio_chunk_duration_matches_byte_rate() {
        let info = cd_quality_mono();
        // 1024 bytes at 88200 B/s ~= 11.6ms
        assert_eq!(info.chunk_duration_us(), 11_609);
        assert_eq!(info.bytes_to_us(info.byte_rate() as u64), 1_000_000);
    }

    #[test]
    fn audio_rejects_unsupported_channel_counts() {
        assert!(matches!(
            AudioInfo::new(AUDIO_AAC, 44_100, 0, 64_000),
            Err(AudioInfoError::Channels(0))
        ));
        assert!(matches!(
            AudioInfo::new(AUDIO_AAC, 44_100, 3, 64_000),
            Err(AudioInfoError::Channels(3))
        ));
    }

    #[test]
    fn formats_carry_the_track_kind() {
        let video = VideoInfo::new(VIDEO_AVC, 1280, 720, 30, 936_000).with_rotation(90);
        assert_eq!(video.format().kind(), TrackKind::Video);
        assert_eq!(cd_quality_mono().format().kind(), TrackKind::Audio);
        assert_eq!(video.format().mime(), VIDEO_AVC);
    }
}
