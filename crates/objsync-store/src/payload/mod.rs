//! Chunked large-blob storage keyed by object identifier.
//!
//! Two interchangeable backends: files under the persistence root and
//! chunked blobs inside the metadata database. Writes go to a staging
//! area and become visible to readers only when the final chunk (or a
//! single-shot store) publishes them.

mod file;
mod grid;

pub use file::FileStore;
pub use grid::GridStore;

use objsync_common::Result;
use std::io::Read;

/// Read exactly `length` bytes from `reader`, or everything up to EOF when
/// `length` is zero
pub(crate) fn read_chunk(reader: &mut dyn Read, length: u32) -> Result<Vec<u8>> {
    if length == 0 {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(data)
    } else {
        let mut data = vec![0u8; length as usize];
        reader.read_exact(&mut data)?;
        Ok(data)
    }
}

/// Capability set every payload backend provides
pub trait PayloadStore: Send + Sync {
    /// Write `length` bytes from `reader` at byte `offset` of the staging
    /// blob for `key`; `first_chunk` starts a fresh staging blob and
    /// `last_chunk` publishes it. Callers are responsible for delivering
    /// offsets in sequence.
    #[allow(clippy::too_many_arguments)]
    fn append(
        &self,
        key: &str,
        reader: &mut dyn Read,
        length: u32,
        offset: i64,
        total: i64,
        first_chunk: bool,
        last_chunk: bool,
    ) -> Result<()>;

    /// Single-shot write-and-publish; returns the number of bytes written.
    /// A declared `length` of zero accepts any size, otherwise a shortfall
    /// is an error.
    fn store(&self, key: &str, reader: &mut dyn Read, length: i64) -> Result<i64>;

    /// Open a sequential reader over the published blob; backend resources
    /// are released when the reader is dropped
    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Random-access read of up to `size` bytes at `offset`. Returns the
    /// bytes, whether the read reached the end of the blob, and the number
    /// of bytes produced. An `offset` at or past the end yields an empty
    /// buffer with `eof` set.
    fn get_chunk(&self, key: &str, size: usize, offset: i64) -> Result<(Vec<u8>, bool, usize)>;

    /// Remove the published blob and any staging state; missing blobs are
    /// not an error
    fn delete(&self, key: &str) -> Result<()>;
}
