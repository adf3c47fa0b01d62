//! Metadata-log chunk records

/// Number of chunk records in a metadata log
pub const M_CHUNK_COUNT: usize = 1024;

/// Number of item slots in one chunk
pub const CHUNK_ITEM_COUNT: usize = 32;

/// One buffered write described in the metadata log
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogItem {
    /// Offset in the target file
    pub file_offset: u64,
    /// Offset in the data log
    pub data_offset: u64,
    /// Length in bytes
    pub length: u64,
}

/// Chunk record stored in the metadata log
///
/// Chunks are linked by index, never by address, so the array stays valid
/// wherever the log file is mapped.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ChunkRecord {
    /// 1 while the chunk sits on the free ring
    pub free: u32,
    /// Number of occupied item slots
    pub item_count: u32,
    /// Index of the next chunk on the ring
    pub next_chunk: u32,
    /// Padding, keeps `items` 8-byte aligned
    pub reserved: u32,
    /// Item slots
    pub items: [LogItem; CHUNK_ITEM_COUNT],
}

impl ChunkRecord {
    /// Size of ChunkRecord in bytes
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Reset to a free, empty chunk linked to `next`
    pub fn reset(&mut self, next: u32) {
        self.free = 1;
        self.item_count = 0;
        self.next_chunk = next;
        self.reserved = 0;
    }

    /// Whether the chunk is on the free ring
    pub fn is_free(&self) -> bool {
        self.free != 0
    }
}

/// Size in bytes of the metadata log
pub const METADATA_LOG_SIZE: usize = ChunkRecord::SIZE * M_CHUNK_COUNT;
