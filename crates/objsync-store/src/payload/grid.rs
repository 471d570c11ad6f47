//! Database-backed payload store.
//!
//! Blobs are chunked into fixed-size documents in `payloads.chunks`,
//! addressed by a per-upload blob id. `payloads.files` maps an object key
//! to its published blob; flipping that mapping is the publish step, after
//! which the chunks of the previous blob are removed. Staging handles
//! (sequence offset plus a partial-chunk buffer) are kept per key; their
//! map lock is never held across backend I/O.

use super::{read_chunk, PayloadStore};
use crate::docstore::{collections, DocStore};
use crate::documents::{PayloadChunkDoc, PayloadFileDoc};
use bson::doc;
use objsync_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Payload store keeping blobs inside the metadata database
pub struct GridStore {
    docs: Arc<dyn DocStore>,
    handles: Mutex<HashMap<String, GridHandle>>,
    chunk_size: usize,
}

struct GridHandle {
    blob_id: String,
    length: i64,
    next_chunk: i64,
    buf: Vec<u8>,
}

impl GridHandle {
    fn new() -> Self {
        Self {
            blob_id: Uuid::new_v4().to_string(),
            length: 0,
            next_chunk: 0,
            buf: Vec::new(),
        }
    }
}

impl GridStore {
    #[must_use]
    pub fn new(docs: Arc<dyn DocStore>) -> Self {
        Self::with_chunk_size(docs, DEFAULT_CHUNK_SIZE)
    }

    #[must_use]
    pub fn with_chunk_size(docs: Arc<dyn DocStore>, chunk_size: usize) -> Self {
        Self {
            docs,
            handles: Mutex::new(HashMap::new()),
            chunk_size: chunk_size.max(1),
        }
    }

    fn write_chunk(&self, blob_id: &str, n: i64, data: &[u8]) -> Result<()> {
        let chunk = PayloadChunkDoc {
            id: format!("{blob_id}:{n}"),
            blob_id: blob_id.to_string(),
            n,
            data: data.to_vec(),
        };
        self.docs.upsert(
            collections::PAYLOAD_CHUNKS,
            doc! {"_id": &chunk.id},
            bson::to_document(&chunk)?,
        )
    }

    /// Buffer `data` into the handle, flushing every full chunk
    fn push_bytes(&self, handle: &mut GridHandle, data: &[u8]) -> Result<()> {
        handle.buf.extend_from_slice(data);
        handle.length += data.len() as i64;
        while handle.buf.len() >= self.chunk_size {
            let rest = handle.buf.split_off(self.chunk_size);
            self.write_chunk(&handle.blob_id, handle.next_chunk, &handle.buf)?;
            handle.next_chunk += 1;
            handle.buf = rest;
        }
        Ok(())
    }

    /// Flush the partial chunk and flip the key's file document onto this
    /// blob, then drop the chunks of the blob it replaced
    fn publish(&self, key: &str, mut handle: GridHandle) -> Result<()> {
        if !handle.buf.is_empty() {
            let tail = std::mem::take(&mut handle.buf);
            self.write_chunk(&handle.blob_id, handle.next_chunk, &tail)?;
            handle.next_chunk += 1;
        }
        let previous = match self.fetch_file_doc(key) {
            Ok(existing) => Some(existing.blob_id),
            Err(Error::NotFound) => None,
            Err(err) => return Err(err),
        };
        let file = PayloadFileDoc {
            id: key.to_string(),
            blob_id: handle.blob_id.clone(),
            length: handle.length,
            chunk_size: self.chunk_size as i64,
        };
        self.docs.upsert(
            collections::PAYLOAD_FILES,
            doc! {"_id": key},
            bson::to_document(&file)?,
        )?;
        if let Some(previous) = previous.filter(|prev| *prev != handle.blob_id) {
            self.docs
                .remove_all(collections::PAYLOAD_CHUNKS, doc! {"blob-id": previous})?;
        }
        debug!(key, length = handle.length, "published payload blob");
        Ok(())
    }

    fn fetch_file_doc(&self, key: &str) -> Result<PayloadFileDoc> {
        let doc = self
            .docs
            .fetch_one(collections::PAYLOAD_FILES, doc! {"_id": key}, None)?;
        Ok(bson::from_document(doc)?)
    }

    /// Drop any staging state for `key`, including its staged chunks
    fn discard_staging(&self, key: &str) -> Result<()> {
        let stale = self.handles.lock().remove(key);
        if let Some(stale) = stale {
            self.docs
                .remove_all(collections::PAYLOAD_CHUNKS, doc! {"blob-id": stale.blob_id})?;
        }
        Ok(())
    }
}

impl PayloadStore for GridStore {
    fn append(
        &self,
        key: &str,
        reader: &mut dyn Read,
        length: u32,
        offset: i64,
        _total: i64,
        first_chunk: bool,
        last_chunk: bool,
    ) -> Result<()> {
        let mut handle = if first_chunk {
            self.discard_staging(key)?;
            GridHandle::new()
        } else {
            let taken = self.handles.lock().remove(key);
            match taken {
                Some(handle) => handle,
                None => {
                    return Err(Error::storage(format!(
                        "no staging blob open for {key} at offset {offset}"
                    )))
                }
            }
        };

        let outcome = (|| -> Result<()> {
            if offset != handle.length {
                return Err(Error::storage(format!(
                    "staging blob for {key} is at offset {}, got chunk at {offset}",
                    handle.length
                )));
            }
            let data = read_chunk(reader, length)?;
            self.push_bytes(&mut handle, &data)
        })();

        match outcome {
            Ok(()) if last_chunk => self.publish(key, handle),
            outcome => {
                // keep the staging state so the transport can retry
                self.handles.lock().insert(key.to_string(), handle);
                outcome
            }
        }
    }

    fn store(&self, key: &str, reader: &mut dyn Read, length: i64) -> Result<i64> {
        self.discard_staging(key)?;
        let mut handle = GridHandle::new();
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        if length > 0 && data.len() as i64 != length {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("wrote {} of {length} bytes", data.len()),
            )));
        }
        self.push_bytes(&mut handle, &data)?;
        let written = handle.length;
        self.publish(key, handle)?;
        Ok(written)
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let file = self.fetch_file_doc(key)?;
        Ok(Box::new(GridReader {
            docs: Arc::clone(&self.docs),
            blob_id: file.blob_id,
            length: file.length,
            chunk_size: file.chunk_size.max(1) as usize,
            pos: 0,
        }))
    }

    fn get_chunk(&self, key: &str, size: usize, offset: i64) -> Result<(Vec<u8>, bool, usize)> {
        let file = self.fetch_file_doc(key)?;
        if offset >= file.length {
            return Ok((Vec::new(), true, 0));
        }
        let want = size.min((file.length - offset) as usize);
        let mut reader = GridReader {
            docs: Arc::clone(&self.docs),
            blob_id: file.blob_id,
            length: file.length,
            chunk_size: file.chunk_size.max(1) as usize,
            pos: offset.max(0),
        };
        let mut buf = vec![0u8; want];
        reader.read_exact(&mut buf)?;
        let eof = offset + want as i64 >= file.length;
        Ok((buf, eof, want))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.discard_staging(key)?;
        let file = match self.fetch_file_doc(key) {
            Ok(file) => file,
            Err(Error::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.docs
            .remove_all(collections::PAYLOAD_CHUNKS, doc! {"blob-id": file.blob_id})?;
        self.docs
            .remove_all(collections::PAYLOAD_FILES, doc! {"_id": key})
    }
}

/// Sequential reader over a published blob
struct GridReader {
    docs: Arc<dyn DocStore>,
    blob_id: String,
    length: i64,
    chunk_size: usize,
    pos: i64,
}

impl Read for GridReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let chunk_index = self.pos / self.chunk_size as i64;
        let doc = self
            .docs
            .fetch_one(
                collections::PAYLOAD_CHUNKS,
                doc! {"_id": format!("{}:{chunk_index}", self.blob_id)},
                None,
            )
            .map_err(|e| io::Error::other(format!("missing payload chunk {chunk_index}: {e}")))?;
        let chunk: PayloadChunkDoc =
            bson::from_document(doc).map_err(|e| io::Error::other(e.to_string()))?;
        let offset_in = (self.pos % self.chunk_size as i64) as usize;
        if offset_in >= chunk.data.len() {
            return Err(io::Error::other(format!(
                "payload chunk {chunk_index} shorter than expected"
            )));
        }
        let n = (chunk.data.len() - offset_in).min(buf.len());
        buf[..n].copy_from_slice(&chunk.data[offset_in..offset_in + n]);
        self.pos += n as i64;
        Ok(n)
    }
}
