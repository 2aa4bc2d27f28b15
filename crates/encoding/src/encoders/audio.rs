//! The audio track encoder.
//!
//! Two cooperating threads: the capture thread performs the blocking raw
//! reads, timestamps each chunk and bridges stalls with filler; the encode
//! thread copies records into codec input slots and drains the compressed
//! output. They are connected by a single-producer/single-consumer record
//! channel, with backpressure applied through the bounded chunk pool rather
//! than the channel itself.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use reel_media_info::AudioInfo;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{notify_limit_reached, spawn_worker, EncoderCore, TrackSignals};
use crate::codec::AudioCodec;
use crate::engine::{AudioTrack, Controller};
use crate::noise::AudioNoise;
use crate::pool::{Lease, Pool};
use crate::timestamp::AudioTimestamp;
use crate::EncodingError;

/// Cap on raw chunks alive at once. This is how far the encode thread may
/// fall behind the capture thread before reads start being dropped; letting
/// it grow much further means encoding long after recording stopped.
const CHUNK_POOL_SIZE: usize = 500;

/// Most filler chunks written per detected gap. Generating more would eat
/// into the time budget before the next real read.
const MAX_GAP_CHUNKS: usize = 8;

/// Backoff while waiting on a codec input slot or a free chunk.
const INPUT_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Error)]
#[error("Audio source read failed: {0}")]
pub struct AudioSourceError(pub String);

/// The raw sample producer, typically a microphone device. Reads block until
/// a full chunk (or whatever is available) has been captured.
pub trait AudioSource: Send {
    /// Blocking read of raw interleaved PCM into `buf`. Returns bytes read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioSourceError>;
}

/// One captured chunk on its way to the encode thread.
struct InputRecord {
    chunk: Lease<Vec<u8>>,
    pts_us: i64,
    len: usize,
    end_of_stream: bool,
}

pub(crate) struct AudioEncoder {
    pub capture: JoinHandle<()>,
    pub encode: JoinHandle<()>,
}

pub(crate) fn spawn(
    track: AudioTrack,
    core: EncoderCore,
    controller: Controller,
    signals: Arc<TrackSignals>,
    origin: Instant,
    max_length_us: Option<i64>,
) -> AudioEncoder {
    let AudioTrack {
        info,
        codec,
        source,
    } = track;

    let chunk_size = info.chunk_size();
    let pool = Pool::bounded(CHUNK_POOL_SIZE, move || vec![0u8; chunk_size]);
    let (records_tx, records_rx) = flume::unbounded();

    let capture = {
        let capture = Capture {
            timestamps: AudioTimestamp::new(info.byte_rate()),
            noise: AudioNoise::new(&info),
            info,
            source,
            pool,
            records: records_tx,
            signals: signals.clone(),
            controller,
            origin,
            max_length_us,
            first_pts_us: None,
        };
        spawn_worker("audio-capture", move || capture.run())
    };

    let encode = spawn_worker("audio-encode", move || encode_loop(codec, records_rx, core, signals));

    AudioEncoder { capture, encode }
}

struct Capture {
    info: AudioInfo,
    source: Box<dyn AudioSource>,
    pool: Pool<Vec<u8>>,
    records: Sender<InputRecord>,
    signals: Arc<TrackSignals>,
    controller: Controller,
    origin: Instant,
    max_length_us: Option<i64>,
    timestamps: AudioTimestamp,
    noise: AudioNoise,
    first_pts_us: Option<i64>,
}

impl Capture {
    fn run(mut self) {
        info!("audio capture running");
        while !self.signals.stop_requested() {
            self.read(false);
        }
        if !self.signals.aborted() {
            debug!("stop requested, performing the end-of-stream read");
            self.read(true);
        }
        info!("audio capture exiting");
    }

    fn read(&mut self, end_of_stream: bool) {
        let mut chunk = loop {
            match self.pool.acquire() {
                Some(chunk) => break chunk,
                None if end_of_stream => {
                    // The final record must go out; wait for the encode
                    // thread to recycle a chunk.
                    if self.signals.aborted() {
                        return;
                    }
                    thread::sleep(INPUT_BACKOFF);
                }
                None => {
                    warn!("no free chunk, dropping an audio read; encoding is too slow");
                    thread::sleep(INPUT_BACKOFF);
                    return;
                }
            }
        };

        let read = match self.source.read(&mut chunk) {
            Ok(read) => read,
            Err(error) if end_of_stream => {
                warn!(%error, "final read failed, sending bare end-of-stream");
                0
            }
            Err(error) => {
                warn!(%error, "audio read failed, skipping this cycle");
                return;
            }
        };
        if read == 0 && !end_of_stream {
            return;
        }

        let now_us = self.origin.elapsed().as_micros() as i64;
        let pts_us = if read > 0 {
            self.timestamps.advance(read, now_us)
        } else {
            now_us
        };

        if end_of_stream {
            let record = InputRecord {
                chunk,
                pts_us,
                len: 0,
                end_of_stream: true,
            };
            let _ = self.records.send(record);
            return;
        }

        let first = *self.first_pts_us.get_or_insert(pts_us);
        if let Some(max) = self.max_length_us
            && pts_us - first > max
        {
            notify_limit_reached(&self.signals, &self.controller);
        }

        self.bridge_gaps();

        let record = InputRecord {
            chunk,
            pts_us,
            len: read,
            end_of_stream: false,
        };
        if self.records.send(record).is_err() {
            // The encode thread is gone; there is nobody left to read for.
            self.signals.signal_stop();
        }
    }

    /// The tracker found a stall: enqueue filler chunks covering the hole,
    /// ahead of the chunk that exposed it.
    fn bridge_gaps(&mut self) {
        let chunk_size = self.info.chunk_size();
        let gaps = self.timestamps.gap_count(chunk_size);
        if gaps == 0 {
            return;
        }
        let fill = gaps.min(MAX_GAP_CHUNKS);
        warn!(gaps, fill, "audio stalled, bridging the gap with filler");

        let mut pts_us = self.timestamps.gap_start_us();
        let duration_us = self.info.chunk_duration_us();
        for _ in 0..fill {
            let Some(mut chunk) = self.pool.acquire() else {
                warn!("no free chunk for filler, leaving the rest of the gap");
                return;
            };
            self.noise.fill(&mut chunk);
            let record = InputRecord {
                chunk,
                pts_us,
                len: chunk_size,
                end_of_stream: false,
            };
            if self.records.send(record).is_err() {
                return;
            }
            pts_us += duration_us;
        }
    }
}

enum EncodeExit {
    /// The end-of-stream record was flushed and the codec released.
    Flushed,
    /// The channel closed (abort or producer death) before end-of-stream.
    Interrupted,
}

fn encode_loop(
    mut codec: Box<dyn AudioCodec>,
    records: Receiver<InputRecord>,
    mut core: EncoderCore,
    signals: Arc<TrackSignals>,
) {
    info!("audio encoder running");
    match encode_records(codec.as_mut(), &records, &mut core, &signals) {
        Ok(EncodeExit::Flushed) => {}
        Ok(EncodeExit::Interrupted) => {
            codec.release();
            core.controller().notify_released(signals.track());
        }
        Err(error) => core.abandon(codec.as_mut(), error),
    }
    info!("audio encoder exiting");
}

fn encode_records(
    codec: &mut dyn AudioCodec,
    records: &Receiver<InputRecord>,
    core: &mut EncoderCore,
    signals: &TrackSignals,
) -> Result<EncodeExit, EncodingError> {
    codec.start()?;

    while let Ok(record) = records.recv() {
        if signals.aborted() {
            return Ok(EncodeExit::Interrupted);
        }

        // A record is never dropped once captured; back off until the device
        // frees a slot. The end-of-stream record must go through no matter
        // how long that takes.
        let slot = loop {
            if let Some(slot) = codec.try_input_slot()? {
                break slot;
            }
            if signals.aborted() {
                return Ok(EncodeExit::Interrupted);
            }
            thread::sleep(INPUT_BACKOFF);
        };

        if record.end_of_stream {
            codec.queue_input(slot, &[], record.pts_us, true)?;
            drop(record);
            core.drain(codec, true)?;
            return Ok(EncodeExit::Flushed);
        }

        codec.queue_input(slot, &record.chunk[..record.len], record.pts_us, false)?;
        // Recycles the chunk back to the capture thread.
        drop(record);
        core.drain(codec, false)?;
    }

    Ok(EncodeExit::Interrupted)
}
