mod chunkqueue;
mod error;
mod importexport;
mod mempool;
pub mod queue;
mod seqlock;
mod tagstruct;

pub use chunkqueue::{CHUNK_CAPACITY, ChunkQueue};
pub use error::{EmptyError, PoolError, QueueError, ReadError, TagError};
pub use importexport::{MemExport, MemImport};
pub use mempool::{BlockGuard, BlockKind, MemBlock, MemPool, MemPoolConfig, StorageKind};
pub use seqlock::Seqlock;
pub use tagstruct::{Tag, TagStruct};
