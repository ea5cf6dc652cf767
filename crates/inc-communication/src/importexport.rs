//! Per-connection tables that make `MemBlock`s usable across a connection
//! boundary. An `Export` hands out local-origin blocks under remote-visible
//! IDs; the peer's `Import` reconstructs a `MemBlock` from the wire
//! reference and the matching shared-memory segment.

use std::collections::HashMap;
use std::sync::Mutex;

use inc_utils::directories::shmem_dir_data;
use shared_memory::{Shmem, ShmemConf};

use crate::error::PoolError;
use crate::mempool::MemBlock;

const MAX_TABLE_ENTRIES: usize = 128;

struct ExportSegment {
    #[allow(dead_code)]
    shmem: Shmem,
}

unsafe impl Send for ExportSegment {}

struct ExportEntry {
    block: MemBlock,
    #[allow(dead_code)]
    segment: Option<ExportSegment>,
}

/// Holds blocks this side has handed out to the peer, keyed by the ID we
/// assigned them. Entries are removed on `MEM_RELEASE` from the importer, or
/// all at once if the connection is torn down (the peer can no longer send
/// `MEM_RELEASE`, so the exporter just drops its references).
#[derive(Default)]
pub struct MemExport {
    next_id: Mutex<u32>,
    entries: Mutex<HashMap<u32, ExportEntry>>,
}

impl MemExport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `block` under a fresh ID, incrementing its reference count
    /// for the duration the remote side holds it. Inline path: the bytes
    /// travel in the message body, no `HAS_SHM_REF` flag.
    pub fn put(&self, block: MemBlock) -> Result<u32, PoolError> {
        let id = self.reserve_id()?;
        self.insert(id, block, None);
        Ok(id)
    }

    /// Like `put`, but also copies the block's bytes into a freshly created
    /// shared-memory segment under `app_name`'s directory so the peer can
    /// map it directly instead of receiving a copy inline. Returns the
    /// assigned ID and the segment's flink name to carry in the
    /// `HAS_SHM_REF` reference on the wire.
    pub fn put_shared(&self, app_name: &str, block: MemBlock) -> Result<(u32, String), PoolError> {
        let id = self.reserve_id()?;
        let segment_path = shmem_dir_data(app_name).join(format!("export-{id}"));
        if let Some(parent) = segment_path.parent() {
            std::fs::create_dir_all(parent).map_err(PoolError::Io)?;
        }
        let segment_name = segment_path.to_string_lossy().into_owned();
        let shmem = ShmemConf::new()
            .size(block.len().max(1))
            .flink(&segment_name)
            .create()
            .map_err(PoolError::Shmem)?;
        unsafe {
            let dst = std::slice::from_raw_parts_mut(shmem.as_ptr(), block.len());
            dst.copy_from_slice(&block.acquire());
        }
        self.insert(id, block, Some(ExportSegment { shmem }));
        Ok((id, segment_name))
    }

    fn reserve_id(&self) -> Result<u32, PoolError> {
        if self.entries.lock().expect("export table mutex poisoned").len() >= MAX_TABLE_ENTRIES {
            return Err(PoolError::ExportTableFull);
        }
        let mut next_id = self.next_id.lock().expect("export id counter mutex poisoned");
        let id = *next_id;
        *next_id = next_id.wrapping_add(1);
        Ok(id)
    }

    fn insert(&self, id: u32, block: MemBlock, segment: Option<ExportSegment>) {
        self.entries
            .lock()
            .expect("export table mutex poisoned")
            .insert(id, ExportEntry { block, segment });
    }

    /// Handles an inbound `MEM_RELEASE(id)`: the importer is done, drop our
    /// reference.
    pub fn release(&self, id: u32) -> Result<(), PoolError> {
        let mut entries = self.entries.lock().expect("export table mutex poisoned");
        entries.remove(&id).map(|_| ()).ok_or(PoolError::UnknownRemoteId(id))
    }

    /// Forces every entry to be dropped, as if the peer had sent
    /// `MEM_RELEASE` for each — used when the underlying block must be
    /// invalidated before the peer asks to release it (`MEM_REVOKE` flow).
    pub fn revoke_all(&self) {
        self.entries.lock().expect("export table mutex poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("export table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ImportSegment {
    #[allow(dead_code)]
    shmem: Shmem,
}

unsafe impl Send for ImportSegment {}

/// Holds blocks reconstructed from the peer's exports, keyed by the remote
/// ID the peer assigned. Dropping the last local reference to an imported
/// block is the importer's cue to send `MEM_RELEASE` back to the exporter.
#[derive(Default)]
pub struct MemImport {
    entries: Mutex<HashMap<u32, MemBlock>>,
    segments: Mutex<HashMap<String, ImportSegment>>,
}

impl MemImport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstructs (or reuses an already-mapped) shared-memory segment and
    /// records a block for `remote_id`. Returns `Err` rather than panicking
    /// if the table is full or the segment can't be mapped, so the caller can
    /// fail the inbound frame without taking the connection down.
    pub fn put_from_segment(
        &self,
        remote_id: u32,
        segment_name: &str,
        offset: usize,
        size: usize,
    ) -> Result<MemBlock, PoolError> {
        let mut entries = self.entries.lock().expect("import table mutex poisoned");
        if entries.len() >= MAX_TABLE_ENTRIES {
            return Err(PoolError::ImportTableFull);
        }

        let mut segments = self.segments.lock().expect("import segment mutex poisoned");
        if !segments.contains_key(segment_name) {
            let shmem = ShmemConf::new().flink(segment_name).open().map_err(PoolError::Shmem)?;
            segments.insert(segment_name.to_string(), ImportSegment { shmem });
        }

        let segment = segments.get(segment_name).expect("just inserted");
        let data = unsafe {
            std::slice::from_raw_parts(segment.shmem.as_ptr().add(offset), size).to_vec()
        };

        let block = MemBlock::from_imported(data);
        entries.insert(remote_id, block.clone());
        Ok(block)
    }

    /// Non-shm path: the exporter sent raw bytes inline (no `HAS_SHM_REF`).
    pub fn put_inline(&self, remote_id: u32, data: Vec<u8>) -> Result<MemBlock, PoolError> {
        let mut entries = self.entries.lock().expect("import table mutex poisoned");
        if entries.len() >= MAX_TABLE_ENTRIES {
            return Err(PoolError::ImportTableFull);
        }
        let block = MemBlock::from_imported(data);
        entries.insert(remote_id, block.clone());
        Ok(block)
    }

    pub fn get(&self, remote_id: u32) -> Option<MemBlock> {
        self.entries.lock().expect("import table mutex poisoned").get(&remote_id).cloned()
    }

    /// Handles an inbound `MEM_REVOKE(id)`: makes the block local (it is
    /// already a plain owned copy in this implementation) and drops it from
    /// the table so the pending `MEM_RELEASE` we are about to send is the
    /// last word on it.
    pub fn revoke(&self, remote_id: u32) -> Result<(), PoolError> {
        self.entries
            .lock()
            .expect("import table mutex poisoned")
            .remove(&remote_id)
            .map(|_| ())
            .ok_or(PoolError::UnknownRemoteId(remote_id))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("import table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::{MemPool, MemPoolConfig};

    #[test]
    fn export_assigns_increasing_ids_and_releases_by_id() {
        let pool = MemPool::new(MemPoolConfig::default());
        let export = MemExport::new();
        let block = pool.allocate(16).unwrap();

        let id = export.put(block).unwrap();
        assert_eq!(export.len(), 1);
        export.release(id).unwrap();
        assert!(export.is_empty());
    }

    #[test]
    fn releasing_unknown_id_is_an_error() {
        let export = MemExport::new();
        assert!(matches!(export.release(7), Err(PoolError::UnknownRemoteId(7))));
    }

    #[test]
    fn put_shared_creates_a_segment_the_peer_can_map() {
        let pool = MemPool::new(MemPoolConfig::default());
        let export = MemExport::new();
        let block = pool.allocate(16).unwrap();

        let app_name = format!("inc-test-{}", std::process::id());
        let (id, segment_name) = export.put_shared(&app_name, block).unwrap();
        assert_eq!(export.len(), 1);

        let import = MemImport::new();
        let imported = import.put_from_segment(id, &segment_name, 0, 16).unwrap();
        assert_eq!(imported.len(), 16);

        export.release(id).unwrap();
        let _ = std::fs::remove_file(&segment_name);
    }

    #[test]
    fn import_inline_round_trips_bytes() {
        let import = MemImport::new();
        let block = import.put_inline(3, b"payload".to_vec()).unwrap();
        assert_eq!(&*block.acquire(), b"payload");
        assert_eq!(import.get(3).unwrap().len(), 7);
        import.revoke(3).unwrap();
        assert!(import.get(3).is_none());
    }
}
