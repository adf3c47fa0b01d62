//! Per-rank memory-mapped append log
//!
//! Each rank owns two mapped files under the shared buffer folder:
//!
//! * `metadata-log.<rank>`: an array of [`M_CHUNK_COUNT`] [`ChunkRecord`]s
//!   threaded into a circular free ring by index,
//! * `data-log.<rank>`: raw bytes handed out by a bump cursor.
//!
//! Chunks are never released and the data cursor never wraps.

use crate::chunk::{ChunkRecord, LogItem, CHUNK_ITEM_COUNT, METADATA_LOG_SIZE, M_CHUNK_COUNT};
use crate::mapped::MappedFile;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Path of the metadata log for `rank`
pub fn metadata_log_path(folder: &Path, rank: i32) -> PathBuf {
    folder.join(format!("metadata-log.{:04}", rank))
}

/// Path of the data log for `rank`
pub fn data_log_path(folder: &Path, rank: i32) -> PathBuf {
    folder.join(format!("data-log.{:04}", rank))
}

/// Chunked metadata log plus data log for one rank
pub struct LogBuffer {
    metadata: MappedFile,
    data: MappedFile,
    /// Head of the free ring
    current_chunk: u32,
    /// Next unreserved byte of the data log
    cur_data_offset: usize,
}

impl LogBuffer {
    /// Create both log files for `rank`, truncating any previous contents
    pub fn create(folder: &Path, rank: i32, data_buffer_size: usize) -> Result<Self> {
        let metadata = MappedFile::create(&metadata_log_path(folder, rank), METADATA_LOG_SIZE)?;
        let data = MappedFile::create(&data_log_path(folder, rank), data_buffer_size)?;

        let mut log = Self {
            metadata,
            data,
            current_chunk: 0,
            cur_data_offset: 0,
        };

        let last = M_CHUNK_COUNT - 1;
        for (i, chunk) in log.chunks_mut().iter_mut().enumerate() {
            let next = if i == last { 0 } else { i + 1 };
            chunk.reset(next as u32);
        }

        debug!(
            rank,
            folder = %folder.display(),
            data_buffer_size,
            "created log buffer"
        );
        Ok(log)
    }

    /// Map existing log files for `rank` without reinitialising them
    ///
    /// The chunk cursor is placed on the first free chunk of the ring and the
    /// data cursor just past the furthest byte any recorded item covers.
    pub fn open(folder: &Path, rank: i32) -> Result<Self> {
        let metadata = MappedFile::open(&metadata_log_path(folder, rank))?;
        if metadata.size() < METADATA_LOG_SIZE {
            return Err(Error::LogBuffer(format!(
                "metadata log too small: expected {} bytes, got {}",
                METADATA_LOG_SIZE,
                metadata.size()
            )));
        }
        let data = MappedFile::open(&data_log_path(folder, rank))?;

        let mut log = Self {
            metadata,
            data,
            current_chunk: 0,
            cur_data_offset: 0,
        };

        if let Some(bad) = log
            .chunks()
            .iter()
            .position(|c| c.next_chunk as usize >= M_CHUNK_COUNT)
        {
            return Err(Error::LogBuffer(format!("chunk {} has a dangling link", bad)));
        }

        log.current_chunk = log
            .chunk_ring()
            .find(|&i| log.chunks()[i as usize].is_free())
            .unwrap_or(0);
        let mut end = 0u64;
        for (index, chunk) in log.chunks().iter().enumerate().filter(|(_, c)| !c.is_free()) {
            for item in &chunk.items[..(chunk.item_count as usize).min(CHUNK_ITEM_COUNT)] {
                let item_end = item
                    .data_offset
                    .checked_add(item.length)
                    .filter(|&e| e <= log.data.size() as u64)
                    .ok_or_else(|| {
                        Error::LogBuffer(format!(
                            "chunk {} has an item past the data log: {}+{} > {}",
                            index,
                            item.data_offset,
                            item.length,
                            log.data.size()
                        ))
                    })?;
                end = end.max(item_end);
            }
        }
        log.cur_data_offset = end as usize;

        Ok(log)
    }

    /// All chunk records
    pub fn chunks(&self) -> &[ChunkRecord] {
        // Safety: the mapping is page aligned and at least METADATA_LOG_SIZE
        // bytes long, checked on create and open.
        unsafe {
            std::slice::from_raw_parts(self.metadata.as_ptr() as *const ChunkRecord, M_CHUNK_COUNT)
        }
    }

    fn chunks_mut(&mut self) -> &mut [ChunkRecord] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.metadata.as_mut_ptr() as *mut ChunkRecord,
                M_CHUNK_COUNT,
            )
        }
    }

    /// Get chunk by index
    pub fn chunk(&self, index: u32) -> Result<&ChunkRecord> {
        self.chunks()
            .get(index as usize)
            .ok_or(Error::ChunkNotFound(index))
    }

    /// Index of the chunk the next acquire returns
    pub fn current_chunk(&self) -> u32 {
        self.current_chunk
    }

    /// Data-log write cursor
    pub fn cur_data_offset(&self) -> usize {
        self.cur_data_offset
    }

    /// Capacity of the data log in bytes
    pub fn data_capacity(&self) -> usize {
        self.data.size()
    }

    pub fn metadata_path(&self) -> &Path {
        self.metadata.path()
    }

    pub fn data_path(&self) -> &Path {
        self.data.path()
    }

    /// Take the chunk at the head of the free ring
    ///
    /// Returns its index, marks it in use and moves the head along its link.
    pub fn acquire_chunk(&mut self) -> Result<u32> {
        let index = self.current_chunk;
        let chunk = self
            .chunks_mut()
            .get_mut(index as usize)
            .ok_or(Error::ChunkNotFound(index))?;

        if !chunk.is_free() {
            return Err(Error::LogBuffer("no free chunk left".to_string()));
        }

        chunk.free = 0;
        let next = chunk.next_chunk;
        self.current_chunk = next;
        Ok(index)
    }

    /// Record an item in an acquired chunk
    pub fn push_item(&mut self, index: u32, item: LogItem) -> Result<()> {
        let chunk = self
            .chunks_mut()
            .get_mut(index as usize)
            .ok_or(Error::ChunkNotFound(index))?;

        if chunk.is_free() {
            return Err(Error::LogBuffer(format!("chunk {} is not acquired", index)));
        }
        let slot = chunk.item_count as usize;
        if slot >= CHUNK_ITEM_COUNT {
            return Err(Error::LogBuffer(format!("chunk {} is full", index)));
        }

        chunk.items[slot] = item;
        chunk.item_count += 1;
        Ok(())
    }

    /// Reserve `n` bytes of the data log, returning their offset
    pub fn reserve_data(&mut self, n: usize) -> Result<usize> {
        let available = self.data_capacity().saturating_sub(self.cur_data_offset);
        if n > available {
            return Err(Error::LogExhausted {
                requested: n,
                available,
            });
        }

        let offset = self.cur_data_offset;
        self.cur_data_offset += n;
        Ok(offset)
    }

    /// Mutable view of an already reserved range of the data log
    pub fn data_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.cur_data_offset)
            .ok_or_else(|| {
                Error::LogBuffer(format!(
                    "range {}+{} is outside the reserved data log",
                    offset, len
                ))
            })?;
        Ok(&mut self.data.as_mut_slice()[offset..end])
    }

    /// Indices reached by following `next_chunk` from chunk 0 until the ring
    /// closes, bounded by the chunk count. Acquired chunks are included.
    pub fn chunk_ring(&self) -> RingWalk<'_> {
        RingWalk {
            chunks: self.chunks(),
            next: Some(0),
            steps: 0,
        }
    }

    /// Flush both mappings to their files
    pub fn flush(&self) -> Result<()> {
        self.metadata.flush()?;
        self.data.flush()
    }
}

/// Iterator over the chunk ring, see [`LogBuffer::chunk_ring`]
pub struct RingWalk<'a> {
    chunks: &'a [ChunkRecord],
    next: Option<u32>,
    steps: usize,
}

impl Iterator for RingWalk<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let index = self.next?;
        if self.steps >= self.chunks.len() {
            return None;
        }
        self.steps += 1;

        let link = self.chunks.get(index as usize)?.next_chunk;
        self.next = if link == 0 { None } else { Some(link) };
        Some(index)
    }
}
