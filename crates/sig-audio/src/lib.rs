//! Per-session PCM ring buffer (spec.md §4.2).
//!
//! The buffer is append-only from the session task's point of view; a
//! flush is an atomic snapshot-and-advance that the caller turns into a
//! WAV blob via [`to_wav`]. Because each session is driven by a single
//! actor, append and snapshot never race each other in practice, but the
//! API still models them as the distinct single-producer/single-consumer
//! operations spec.md §4.2 describes so the flush boundary stays explicit.

use std::io::Cursor;

const BYTES_PER_SAMPLE: usize = 2; // 16-bit PCM

/// Cursor position (in bytes) past which `snapshot_and_advance` compacts
/// eagerly, so long-lived sessions don't carry every flushed byte forever.
const COMPACT_THRESHOLD_BYTES: usize = 16_000 * BYTES_PER_SAMPLE;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("failed to encode WAV: {0}")]
    WavEncode(#[from] hound::Error),
}

/// A snapshot of buffered PCM taken at flush time.
pub struct AudioSnapshot {
    pub pcm: Vec<u8>,
    pub duration_seconds: f64,
}

pub struct AudioBuffer {
    sample_rate: u32,
    data: Vec<u8>,
    cursor: usize,
    /// Monotone counter of every sample byte ever appended; used to verify
    /// the "buffered duration = sample_count / sample_rate" invariant
    /// independent of how much has been compacted away already.
    total_appended_bytes: u64,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            data: Vec::new(),
            cursor: 0,
            total_appended_bytes: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Append raw PCM16LE mono bytes to the tail of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.total_appended_bytes += bytes.len() as u64;
    }

    /// Duration, in seconds, of the unflushed tail `[cursor, len)`.
    pub fn buffered_duration_seconds(&self) -> f64 {
        bytes_to_duration(self.unflushed_len(), self.sample_rate)
    }

    fn unflushed_len(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Atomically snapshot `[cursor, tail)` (or, if `max_seconds` is set
    /// and the tail is longer, just the first `max_seconds` of it),
    /// advance `cursor`, and return the snapshot. Returns `None` if there
    /// is nothing buffered.
    pub fn snapshot_and_advance(&mut self, max_seconds: Option<f64>) -> Option<AudioSnapshot> {
        let unflushed = self.unflushed_len();
        if unflushed == 0 {
            return None;
        }

        let take_len = match max_seconds {
            Some(secs) => duration_to_bytes(secs, self.sample_rate).min(unflushed),
            None => unflushed,
        };
        if take_len == 0 {
            return None;
        }

        let start = self.cursor;
        let end = start + take_len;
        let pcm = self.data[start..end].to_vec();
        self.cursor = end;

        // Lazy compaction: reclaiming on every flush would mean an O(n)
        // `drain` per batch, so only pay that cost once the flushed prefix
        // has actually grown large (spec.md §5, memory O(buffered_duration)).
        if self.cursor >= COMPACT_THRESHOLD_BYTES {
            self.compact();
        }

        Some(AudioSnapshot {
            duration_seconds: bytes_to_duration(pcm.len(), self.sample_rate),
            pcm,
        })
    }

    /// Drop already-flushed bytes from the front of the buffer so memory
    /// usage stays proportional to unflushed audio only.
    pub fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.data.drain(0..self.cursor);
        self.cursor = 0;
    }
}

fn bytes_to_duration(bytes: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    (bytes / BYTES_PER_SAMPLE) as f64 / sample_rate as f64
}

fn duration_to_bytes(seconds: f64, sample_rate: u32) -> usize {
    let samples = (seconds.max(0.0) * sample_rate as f64).round() as usize;
    samples * BYTES_PER_SAMPLE
}

/// Wrap mono 16-bit PCM in a canonical WAV (RIFF) container.
pub fn to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buf, spec)?;
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(buf.into_inner())
}
