//! Byte storage beneath the journal.

use crate::error::StoreResult;

/// An append-only byte store.
///
/// Backends do not interpret what they hold; the journal owns framing
/// and recovery.
///
/// # Invariants
///
/// - `append` returns the offset where the data starts
/// - `read_at` returns exactly the bytes previously appended there
/// - after `sync` returns, appended data survives process termination
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the range extends past the end or on I/O errors.
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>>;

    /// Appends data, returning its offset.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Makes all appended data durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> StoreResult<u64>;

    /// Discards everything after `new_size`. Used to drop a torn tail.
    fn truncate(&mut self, new_size: u64) -> StoreResult<()>;
}
