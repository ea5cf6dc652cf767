use shared_memory::ShmemError;
use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq)]
pub enum EmptyError {
    #[error("Lock empty")]
    Empty,
}

#[derive(Error, Debug, Copy, Clone, PartialEq)]
#[repr(u8)]
pub enum ReadError {
    #[error("Got sped past")]
    SpedPast,
    #[error("Lock empty")]
    Empty,
}

#[derive(Error, Debug)]
#[repr(u8)]
pub enum QueueError {
    #[error("Queue not initialized")]
    UnInitialized,
    #[error("Queue length not power of two")]
    LengthNotPowerOfTwo,
    #[error(
        "Element size changed from {0} to {1}. Need to reinit the queue after detaching processes"
    )]
    ElementSizeChanged(usize, usize),
    #[error("Element at {0} poisoned. Need to reinit the queue after detaching processes")]
    ElementPoisoned(usize),
    #[error("Shared memory file does not exist")]
    NonExistingFile,
    #[error("Preexisting shared memory too small")]
    TooSmall,
    #[error("Shmem error")]
    ShmemError(#[from] ShmemError),
}

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("tag mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch { expected: crate::tagstruct::Tag, found: crate::tagstruct::Tag },
    #[error("not enough bytes remaining in tagstruct")]
    Underflow,
    #[error("string payload was not valid utf-8")]
    InvalidUtf8,
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no free slots in pool")]
    PoolFull,
    #[error("requested block size {0} exceeds the pool's maximum direct allocation")]
    TooLarge(usize),
    #[error("block import table is full")]
    ImportTableFull,
    #[error("block export table is full")]
    ExportTableFull,
    #[error("unknown remote block id {0}")]
    UnknownRemoteId(u32),
    #[error("shared memory error: {0}")]
    Shmem(#[from] ShmemError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
