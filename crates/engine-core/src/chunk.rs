//! Bounded first-fit chunk allocator.
//!
//! Partitions one or more backing chunks into aligned regions. Chunks are
//! searched in creation order; inside a chunk the offset-sorted free list is
//! scanned first-fit. Releases coalesce with touching neighbors.

use engine_common::{EngineError, Result};

/// Upper bound on backing chunks.
pub const MAX_CHUNKS: usize = 16;
/// Upper bound on free blocks tracked per chunk.
pub const MAX_FREE_BLOCKS: usize = 256;
/// Configuration sentinel for "effectively unbounded" chunk size.
pub const UNBOUNDED_CHUNK_SIZE: u64 = u64::MAX;
/// Ceiling the unbounded sentinel is clamped to.
pub const CHUNK_SIZE_CEILING: u64 = u64::MAX / 2;

pub const DEFAULT_ALIGNMENT: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
struct Chunk {
    max_size: u64,
    free: Vec<FreeBlock>,
}

impl Chunk {
    fn new(max_size: u64) -> Self {
        Self { max_size, free: vec![FreeBlock { offset: 0, size: max_size }] }
    }
}

/// Result of a successful `allocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRegion {
    pub chunk: usize,
    pub offset: u64,
    pub aligned_size: u64,
}

#[derive(Debug, Clone)]
pub struct ChunkAllocator {
    alignment: u64,
    max_chunk_size: u64,
    chunks: Vec<Chunk>,
}

impl Default for ChunkAllocator {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            max_chunk_size: CHUNK_SIZE_CEILING - CHUNK_SIZE_CEILING % DEFAULT_ALIGNMENT,
            chunks: Vec::new(),
        }
    }
}

fn align_up(value: u64, alignment: u64) -> Result<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
        .ok_or(EngineError::InvalidArgument("size overflows alignment"))
}

impl ChunkAllocator {
    /// `alignment` must be a power of two; `max_chunk_size` must be a
    /// positive multiple of it. The unbounded sentinel is clamped to
    /// `CHUNK_SIZE_CEILING`. Reconfiguring drops all chunks.
    pub fn configure(&mut self, alignment: u64, max_chunk_size: u64) -> Result<()> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(EngineError::InvalidArgument("alignment must be a power of two"));
        }
        if max_chunk_size == 0 {
            return Err(EngineError::InvalidArgument("max chunk size must be positive"));
        }
        let max_chunk_size = if max_chunk_size == UNBOUNDED_CHUNK_SIZE {
            CHUNK_SIZE_CEILING - CHUNK_SIZE_CEILING % alignment
        } else {
            if max_chunk_size % alignment != 0 {
                return Err(EngineError::InvalidArgument(
                    "max chunk size must be a multiple of alignment",
                ));
            }
            max_chunk_size
        };
        self.alignment = alignment;
        self.max_chunk_size = max_chunk_size;
        self.chunks.clear();
        Ok(())
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_max_size(&self, chunk: usize) -> u64 {
        self.chunks.get(chunk).map(|c| c.max_size).unwrap_or(0)
    }

    pub fn free_blocks(&self, chunk: usize) -> &[FreeBlock] {
        self.chunks.get(chunk).map(|c| c.free.as_slice()).unwrap_or(&[])
    }

    /// First-fit allocation. A new chunk is created when no existing chunk
    /// has a fitting block; its size is `max(max_chunk_size, aligned_size)`.
    pub fn allocate(&mut self, size: u64) -> Result<ChunkRegion> {
        if size == 0 {
            return Err(EngineError::InvalidArgument("allocate of zero bytes"));
        }
        let aligned = align_up(size, self.alignment)?;

        for (ci, chunk) in self.chunks.iter_mut().enumerate() {
            if let Some(bi) = chunk.free.iter().position(|b| b.size >= aligned) {
                let offset = chunk.free[bi].offset;
                if chunk.free[bi].size == aligned {
                    chunk.free.remove(bi);
                } else {
                    chunk.free[bi].offset += aligned;
                    chunk.free[bi].size -= aligned;
                }
                return Ok(ChunkRegion { chunk: ci, offset, aligned_size: aligned });
            }
        }

        if self.chunks.len() >= MAX_CHUNKS {
            return Err(EngineError::Backend("chunk limit exceeded"));
        }
        let max_size = self.max_chunk_size.max(aligned);
        let mut chunk = Chunk::new(max_size);
        tracing::debug!(target: "chunk", chunk = self.chunks.len(), max_size, "new chunk");
        if max_size == aligned {
            chunk.free.clear();
        } else {
            chunk.free[0] = FreeBlock { offset: aligned, size: max_size - aligned };
        }
        self.chunks.push(chunk);
        Ok(ChunkRegion { chunk: self.chunks.len() - 1, offset: 0, aligned_size: aligned })
    }

    /// Returns a region to its chunk's free list, merging with touching
    /// neighbors. Ranges overlapping existing free space are rejected.
    pub fn release(&mut self, chunk: usize, offset: u64, size: u64) -> Result<()> {
        if chunk >= self.chunks.len() {
            return Err(EngineError::InvalidArgument("chunk id out of range"));
        }
        if size == 0 {
            return Err(EngineError::InvalidArgument("release of zero bytes"));
        }
        let aligned = align_up(size, self.alignment)?;
        let c = &mut self.chunks[chunk];
        let end = offset
            .checked_add(aligned)
            .ok_or(EngineError::InvalidArgument("release range overflows"))?;
        if end > c.max_size {
            return Err(EngineError::InvalidArgument("release past end of chunk"));
        }
        let insert_at = c.free.partition_point(|b| b.offset < offset);
        if insert_at > 0 {
            let prev = c.free[insert_at - 1];
            if prev.offset + prev.size > offset {
                return Err(EngineError::InvalidArgument("release overlaps free block"));
            }
        }
        if insert_at < c.free.len() && end > c.free[insert_at].offset {
            return Err(EngineError::InvalidArgument("release overlaps free block"));
        }

        let merges_prev =
            insert_at > 0 && c.free[insert_at - 1].offset + c.free[insert_at - 1].size == offset;
        let merges_next = insert_at < c.free.len() && end == c.free[insert_at].offset;
        match (merges_prev, merges_next) {
            (true, true) => {
                c.free[insert_at - 1].size += aligned + c.free[insert_at].size;
                c.free.remove(insert_at);
            }
            (true, false) => c.free[insert_at - 1].size += aligned,
            (false, true) => {
                c.free[insert_at].offset = offset;
                c.free[insert_at].size += aligned;
            }
            (false, false) => {
                if c.free.len() >= MAX_FREE_BLOCKS {
                    return Err(EngineError::Backend("free block table full"));
                }
                c.free.insert(insert_at, FreeBlock { offset, size: aligned });
            }
        }
        Ok(())
    }

    /// Returns every chunk to a single free block covering its full range.
    /// The chunk count is unchanged.
    pub fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.free.clear();
            chunk.free.push(FreeBlock { offset: 0, size: chunk.max_size });
        }
    }

    /// Total free bytes in one chunk.
    pub fn free_bytes(&self, chunk: usize) -> u64 {
        self.chunks
            .get(chunk)
            .map(|c| c.free.iter().map(|b| b.size).sum())
            .unwrap_or(0)
    }
}
