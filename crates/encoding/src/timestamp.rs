//! Presentation timestamps for captured audio chunks.
//!
//! Video frames carry their own capture timestamps; audio has to derive them.
//! Pure wall-clock stamping makes the track the wrong total length whenever
//! capture stalls, and a pure byte-rate clock hides real stalls and drifts
//! away from the video track. This tracker runs on the byte-rate clock and
//! resets it only when the observed drift is large enough to be a stall
//! rather than scheduling jitter.

/// Nominal duration of `bytes` of raw audio at `byte_rate` bytes/sec.
pub(crate) fn bytes_to_us(bytes: u64, byte_rate: u32) -> i64 {
    ((1_000_000 * bytes) / u64::from(byte_rate)) as i64
}

pub(crate) struct AudioTimestamp {
    byte_rate: u32,
    base_us: i64,
    bytes_since_base: u64,
    gap_us: i64,
    gap_start_us: i64,
}

impl AudioTimestamp {
    pub fn new(byte_rate: u32) -> Self {
        Self {
            byte_rate,
            base_us: 0,
            bytes_since_base: 0,
            gap_us: 0,
            gap_start_us: 0,
        }
    }

    /// Timestamp for a chunk of `read_bytes` whose blocking read completed at
    /// `now_us` (microseconds since the session origin).
    ///
    /// Timestamps advance by exactly the byte-derived duration unless the
    /// chunk started more than two chunk-durations after where the byte clock
    /// says it should have; then the base resets to the observed start and
    /// the missed span is recorded as a gap.
    pub fn advance(&mut self, read_bytes: usize, now_us: i64) -> i64 {
        let duration_us = bytes_to_us(read_bytes as u64, self.byte_rate);
        let start_us = now_us - duration_us;

        if self.bytes_since_base == 0 {
            self.base_us = start_us;
        }

        let expected_us = self.base_us + bytes_to_us(self.bytes_since_base, self.byte_rate);
        let drift_us = start_us - expected_us;

        if drift_us >= 2 * duration_us {
            self.gap_us = drift_us;
            self.gap_start_us = expected_us;
            self.base_us = start_us;
            self.bytes_since_base = read_bytes as u64;
            self.base_us
        } else {
            self.gap_us = 0;
            self.bytes_since_base += read_bytes as u64;
            expected_us
        }
    }

    /// How many whole chunks of `chunk_bytes` fit in the gap recorded by the
    /// last [`AudioTimestamp::advance`]. Zero when no gap was detected.
    /// Callers clamp this to their filler budget.
    pub fn gap_count(&self, chunk_bytes: usize) -> usize {
        if self.gap_us <= 0 {
            return 0;
        }
        (self.gap_us / bytes_to_us(chunk_bytes as u64, self.byte_rate)) as usize
    }

    /// Where the last recorded gap begins: the timestamp the byte clock
    /// expected before it was reset. Filler chunks start here.
    pub fn gap_start_us(&self) -> i64 {
        self.gap_start_us
    }
}
