//! Single-producer single-consumer PCM transport between the feeding thread
//! and the processing thread.
//!
//! The writer half stays with the user-facing `Session`; the reader half is
//! handed to the model's processing thread. A `push` either accepts the whole
//! chunk or rejects it without writing anything, which the session surfaces
//! as a `CantKeepUp` result.

use rtrb::chunks::ChunkError;
use rtrb::{Consumer, Producer, RingBuffer};

/// Fixed ring capacity in samples (3 seconds at 16 kHz).
pub const AUDIO_RING_CAPACITY: usize = 48_000;

/// Producer half, owned by the user thread.
pub struct AudioRingWriter {
    producer: Producer<i16>,
}

/// Consumer half, owned by the processing thread.
pub struct AudioRingReader {
    consumer: Consumer<i16>,
}

/// Creates a connected writer/reader pair with the fixed capacity.
pub fn audio_ring() -> (AudioRingWriter, AudioRingReader) {
    let (producer, consumer) = RingBuffer::new(AUDIO_RING_CAPACITY);
    (AudioRingWriter { producer }, AudioRingReader { consumer })
}

impl AudioRingWriter {
    /// Writes `samples` into the ring. Returns false without writing anything
    /// if the free window cannot hold the whole chunk. Never blocks.
    pub fn push(&mut self, samples: &[i16]) -> bool {
        if samples.len() > AUDIO_RING_CAPACITY / 2 {
            log::warn!(
                "audio ring is being given a lot of audio ({} samples), please reduce",
                samples.len()
            );
        }

        let chunk = match self.producer.write_chunk_uninit(samples.len()) {
            Ok(chunk) => chunk,
            Err(ChunkError::TooFewSlots(free)) => {
                log::warn!(
                    "can't keep up: attempted to write {} samples, {} free",
                    samples.len(),
                    free
                );
                return false;
            }
        };

        chunk.fill_from_iter(samples.iter().copied());
        true
    }
}

impl AudioRingReader {
    /// Borrows up to `max` pending samples as one contiguous slice (stopping
    /// at the wrap boundary). May be empty. Call [`AudioChunk::finish`] with
    /// the number of samples actually consumed.
    pub fn pull(&mut self, max: usize) -> AudioChunk<'_> {
        let wanted = self.consumer.slots().min(max);
        match self.consumer.read_chunk(wanted) {
            Ok(chunk) => AudioChunk { chunk: Some(chunk) },
            Err(ChunkError::TooFewSlots(_)) => AudioChunk { chunk: None },
        }
    }

    /// Number of samples currently buffered.
    pub fn pending(&self) -> usize {
        self.consumer.slots()
    }
}

/// A borrowed view of pending samples. Dropping the chunk without calling
/// [`finish`](AudioChunk::finish) consumes nothing.
pub struct AudioChunk<'a> {
    chunk: Option<rtrb::chunks::ReadChunk<'a, i16>>,
}

impl AudioChunk<'_> {
    /// The contiguous run of samples up to the wrap boundary.
    pub fn samples(&self) -> &[i16] {
        match &self.chunk {
            Some(chunk) => chunk.as_slices().0,
            None => &[],
        }
    }

    /// Marks `consumed` leading samples as read.
    pub fn finish(self, consumed: usize) {
        if let Some(chunk) = self.chunk {
            debug_assert!(consumed <= chunk.as_slices().0.len());
            chunk.commit(consumed);
        }
    }
}
