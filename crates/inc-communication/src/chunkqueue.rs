use crate::queue::{ConsumerBare, Producer, Queue, QueueType};
use crate::error::ReadError;

/// Max bytes carried by a single queued chunk; larger writes are split by the
/// caller into multiple `push` calls sharing the same `pos`-derived framing.
pub const CHUNK_CAPACITY: usize = 4096;

#[derive(Clone, Copy)]
pub struct Chunk {
    pub pos: u64,
    pub len: u32,
    pub data: [u8; CHUNK_CAPACITY],
}

impl Default for Chunk {
    fn default() -> Self {
        Self { pos: 0, len: 0, data: [0u8; CHUNK_CAPACITY] }
    }
}

/// Stream's incoming-chunk FIFO. In-process only: a single producer (the I/O
/// thread reassembling `BINARY_DATA` frames) feeds a single consumer (the
/// application thread calling `Stream::read`).
pub struct ChunkQueue {
    producer: Producer<Chunk>,
    consumer: ConsumerBare<Chunk>,
}

impl ChunkQueue {
    pub fn with_capacity(slots: usize) -> Self {
        let queue = Queue::new(slots.next_power_of_two().max(2), QueueType::SPMC);
        Self { producer: Producer::from(queue), consumer: ConsumerBare::from(queue) }
    }

    /// Enqueues one chunk. `data.len()` must be `<= CHUNK_CAPACITY`; longer
    /// payloads are the caller's responsibility to split before pushing.
    pub fn push(&mut self, pos: u64, data: &[u8]) {
        debug_assert!(data.len() <= CHUNK_CAPACITY);
        let mut chunk = Chunk { pos, len: data.len() as u32, data: [0u8; CHUNK_CAPACITY] };
        chunk.data[..data.len()].copy_from_slice(data);
        self.producer.produce(&chunk);
    }

    /// Pops the next chunk, or `None` if the queue is empty. A consumer that
    /// falls behind the producer's wraparound recovers by skipping forward
    /// rather than panicking, since binary streams tolerate gaps better than
    /// stalling the reader.
    pub fn pop(&mut self) -> Option<(u64, Vec<u8>)> {
        let mut chunk = Chunk::default();
        loop {
            match self.consumer.try_consume(&mut chunk) {
                Ok(()) => return Some((chunk.pos, chunk.data[..chunk.len as usize].to_vec())),
                Err(ReadError::Empty) => return None,
                Err(ReadError::SpedPast) => self.consumer.recover_after_error(),
            }
        }
    }
}

unsafe impl Send for ChunkQueue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_preserves_order_and_bytes() {
        let mut q = ChunkQueue::with_capacity(8);
        q.push(0, b"hello");
        q.push(5, b"world");

        let (pos, data) = q.pop().expect("first chunk");
        assert_eq!(pos, 0);
        assert_eq!(data, b"hello");

        let (pos, data) = q.pop().expect("second chunk");
        assert_eq!(pos, 5);
        assert_eq!(data, b"world");

        assert!(q.pop().is_none());
    }
}
