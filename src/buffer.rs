use std::collections::{vec_deque, VecDeque};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Writeback target for lines leaving a [`DirtyLineBuffer`].
///
/// The buffer hands each line over by reference and drops it once `write`
/// returns `Ok`. A sink that needs to keep the line clones it.
pub trait Sink<L> {
    type Error;

    fn write(&mut self, line: &L) -> Result<(), Self::Error>;
}

impl<L, E, F> Sink<L> for F
where
    F: FnMut(&L) -> Result<(), E>,
{
    type Error = E;

    fn write(&mut self, line: &L) -> Result<(), E> {
        self(line)
    }
}

#[derive(Debug, Error)]
pub enum BufferError<L, E> {
    #[error(
        "invalid dirty line buffer: capacity {capacity}, watermark {watermark} \
         (need 0 <= watermark < capacity)"
    )]
    InvalidConfig { capacity: usize, watermark: usize },

    /// The sink rejected `line`. The line has already left the queue.
    #[error("writeback of dirty line failed: {source}")]
    SinkFailure {
        line: L,
        #[source]
        source: E,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub inserted: u64,
    pub drains: u64,
    pub written_back: u64,
    pub failed: u64,
    pub peak_len: usize,
}

/// Bounded FIFO of dirty lines in front of a slower backing store.
///
/// An insert that brings the queue up to `capacity` synchronously drains the
/// oldest lines into the sink until at most `watermark` remain. The buffer
/// does no locking; callers serialize access to a given instance.
#[derive(Debug)]
pub struct DirtyLineBuffer<L, S> {
    capacity: usize,
    watermark: usize,
    queue: VecDeque<L>,
    sink: S,
    stats: BufferStats,
}

impl<L, S: Sink<L>> DirtyLineBuffer<L, S> {
    pub fn new(
        capacity: usize,
        watermark: usize,
        sink: S,
    ) -> Result<Self, BufferError<L, S::Error>> {
        if capacity == 0 || watermark >= capacity {
            return Err(BufferError::InvalidConfig {
                capacity,
                watermark,
            });
        }
        Ok(DirtyLineBuffer {
            capacity,
            watermark,
            queue: VecDeque::with_capacity(capacity),
            sink,
            stats: BufferStats::default(),
        })
    }

    /// Queues `line` at the back, draining to the watermark if the queue is
    /// now full. Duplicates are not detected.
    ///
    /// A sink failure during the induced drain is returned as-is; lines
    /// committed before it stay committed.
    pub fn insert(&mut self, line: L) -> Result<(), BufferError<L, S::Error>> {
        self.queue.push_back(line);
        self.stats.inserted += 1;
        self.stats.peak_len = self.stats.peak_len.max(self.queue.len());

        if self.queue.len() >= self.capacity {
            debug!(
                len = self.queue.len(),
                capacity = self.capacity,
                watermark = self.watermark,
                "dirty line buffer full, draining"
            );
            self.drain()?;
        }
        Ok(())
    }

    /// Writes back the oldest lines until at most `watermark` remain.
    ///
    /// Returns the number of lines committed. Stops at the first sink
    /// failure; the failing line is not requeued.
    pub fn drain(&mut self) -> Result<usize, BufferError<L, S::Error>> {
        self.drain_to(self.watermark)
    }

    /// Like [`drain`](Self::drain) but empties the queue.
    pub fn drain_all(&mut self) -> Result<usize, BufferError<L, S::Error>> {
        self.drain_to(0)
    }

    fn drain_to(&mut self, target: usize) -> Result<usize, BufferError<L, S::Error>> {
        if self.queue.len() <= target {
            return Ok(0);
        }
        self.stats.drains += 1;

        let mut committed = 0;
        while self.queue.len() > target {
            let Some(line) = self.queue.pop_front() else {
                break;
            };
            if let Err(source) = self.sink.write(&line) {
                self.stats.failed += 1;
                debug!(
                    committed,
                    remaining = self.queue.len(),
                    "writeback failed, stopping drain"
                );
                return Err(BufferError::SinkFailure { line, source });
            }
            self.stats.written_back += 1;
            committed += 1;
        }
        Ok(committed)
    }
}

impl<L, S> DirtyLineBuffer<L, S> {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Queued lines, oldest first.
    pub fn iter(&self) -> vec_deque::Iter<'_, L> {
        self.queue.iter()
    }

    pub fn contains(&self, line: &L) -> bool
    where
        L: PartialEq,
    {
        self.queue.contains(line)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Drops any still-queued lines.
    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Resets counters. Peak occupancy restarts from the current length.
    pub fn clear_stats(&mut self) {
        self.stats = BufferStats {
            peak_len: self.queue.len(),
            ..BufferStats::default()
        };
    }
}
