//! Chunked suballocation for upload staging and build scratch memory.
//!
//! Chunks are recycled through a pool keyed by version token: a chunk whose
//! recorded version has finished on its queue goes back to the pool instead
//! of being freed. Allocation never blocks on the GPU.

use crate::error::Result;
use crate::types::{QueueKind, MAX_QUEUES};
use crate::versioning::{make_version, version_available};
use std::collections::VecDeque;

/// One backing allocation handed out in bump-pointer fashion.
pub struct BufferChunk<B> {
    pub buffer: B,
    pub capacity: u64,
    pub write_pointer: u64,
    pub version: u64,
}

impl<B> BufferChunk<B> {
    pub const ALIGNMENT: u64 = 4096;

    pub fn new(buffer: B, capacity: u64) -> Self {
        Self {
            buffer,
            capacity,
            write_pointer: 0,
            version: 0,
        }
    }
}

/// A successful suballocation: which chunk and where inside it.
pub struct Suballocation<'a, B> {
    pub buffer: &'a mut B,
    pub offset: u64,
}

/// Creates backing buffers for chunks. The device side implements this with
/// mapped staging buffers; tests implement it with plain byte vectors.
pub trait ChunkAllocator {
    type Buffer;

    fn create_chunk(&mut self, size: u64) -> Result<BufferChunk<Self::Buffer>>;
}

pub struct UploadManager<A: ChunkAllocator> {
    allocator: A,
    default_chunk_size: u64,
    max_memory: u64,
    allocated_memory: u64,
    chunk_pool: VecDeque<BufferChunk<A::Buffer>>,
    current_chunk: Option<BufferChunk<A::Buffer>>,
}

impl<A: ChunkAllocator> UploadManager<A> {
    /// `max_memory` of zero means unlimited.
    pub fn new(allocator: A, default_chunk_size: u64, max_memory: u64) -> Self {
        Self {
            allocator,
            default_chunk_size,
            max_memory,
            allocated_memory: 0,
            chunk_pool: VecDeque::new(),
            current_chunk: None,
        }
    }

    /// Sub-allocates `size` bytes at `align` from the current chunk, opening
    /// a pooled or fresh chunk when the current one cannot fit the request.
    ///
    /// `current_version` is the unsubmitted token of the recording command
    /// list; it is stamped on every chunk touched so [`submit_chunks`] can
    /// promote them later.
    ///
    /// [`submit_chunks`]: UploadManager::submit_chunks
    pub fn suballocate(
        &mut self,
        size: u64,
        align: u64,
        current_version: u64,
        last_finished: &[u64; MAX_QUEUES],
    ) -> Result<Option<Suballocation<'_, A::Buffer>>> {
        let fits = |chunk: &BufferChunk<A::Buffer>| {
            let offset = align_up(chunk.write_pointer, align);
            offset + size <= chunk.capacity
        };

        if !self.current_chunk.as_ref().map_or(false, fits) {
            if let Some(retired) = self.current_chunk.take() {
                self.chunk_pool.push_back(retired);
            }

            // Prefer a pooled chunk whose version has drained.
            let reusable = self.chunk_pool.iter().position(|chunk| {
                chunk.capacity >= size && version_available(chunk.version, last_finished)
            });
            if let Some(index) = reusable {
                let mut chunk = self.chunk_pool.remove(index).unwrap();
                chunk.write_pointer = 0;
                chunk.version = 0;
                self.current_chunk = Some(chunk);
            } else {
                let chunk_size = align_up(
                    size.max(self.default_chunk_size),
                    BufferChunk::<A::Buffer>::ALIGNMENT,
                );
                if self.max_memory != 0 && self.allocated_memory + chunk_size > self.max_memory {
                    return Ok(None);
                }
                let chunk = self.allocator.create_chunk(chunk_size)?;
                self.allocated_memory += chunk.capacity;
                self.current_chunk = Some(chunk);
            }
        }

        let chunk = self.current_chunk.as_mut().unwrap();
        let offset = align_up(chunk.write_pointer, align);
        chunk.write_pointer = offset + size;
        chunk.version = current_version;
        Ok(Some(Suballocation {
            buffer: &mut chunk.buffer,
            offset,
        }))
    }

    /// Rewrites every chunk carrying the recording token to the submitted
    /// token and retires the current chunk to the pool.
    pub fn submit_chunks(&mut self, queue: QueueKind, recording_id: u64, submission_id: u64) {
        let pending = make_version(recording_id, queue, false);
        let submitted = make_version(submission_id, queue, true);
        if let Some(chunk) = self.current_chunk.take() {
            self.chunk_pool.push_back(chunk);
        }
        for chunk in &mut self.chunk_pool {
            if chunk.version == pending {
                chunk.version = submitted;
            }
        }
    }

    pub fn allocated_memory(&self) -> u64 {
        self.allocated_memory
    }
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecAllocator {
        chunks_created: u32,
    }

    impl ChunkAllocator for VecAllocator {
        type Buffer = Vec<u8>;

        fn create_chunk(&mut self, size: u64) -> Result<BufferChunk<Vec<u8>>> {
            self.chunks_created += 1;
            Ok(BufferChunk::new(vec![0; size as usize], size))
        }
    }

    fn manager(chunk_size: u64, max_memory: u64) -> UploadManager<VecAllocator> {
        UploadManager::new(VecAllocator { chunks_created: 0 }, chunk_size, max_memory)
    }

    const IDLE: [u64; MAX_QUEUES] = [0; MAX_QUEUES];

    #[test]
    fn packs_allocations_with_alignment() {
        let mut m = manager(1024, 0);
        let v = make_version(1, QueueKind::Graphics, false);

        let a = m.suballocate(10, 4, v, &IDLE).unwrap().unwrap().offset;
        let b = m.suballocate(10, 256, v, &IDLE).unwrap().unwrap().offset;
        assert_eq!(a, 0);
        assert_eq!(b, 256);
        assert_eq!(m.allocator.chunks_created, 1);
    }

    #[test]
    fn oversized_request_gets_dedicated_chunk() {
        let mut m = manager(1024, 0);
        let v = make_version(1, QueueKind::Graphics, false);

        let s = m.suballocate(4096, 4, v, &IDLE).unwrap().unwrap();
        assert_eq!(s.offset, 0);
        assert_eq!(m.allocated_memory(), 4096);
    }

    #[test]
    fn scratch_limit_returns_none_instead_of_growing() {
        let mut m = manager(4096, 8192);
        let v = make_version(1, QueueKind::Graphics, false);

        assert!(m.suballocate(4096, 4, v, &IDLE).unwrap().is_some());
        assert!(m.suballocate(4096, 4, v, &IDLE).unwrap().is_some());
        assert!(m.suballocate(4096, 4, v, &IDLE).unwrap().is_none());
    }

    #[test]
    fn chunks_recycle_after_submission_finishes() {
        let mut m = manager(1024, 0);
        let v = make_version(1, QueueKind::Graphics, false);

        m.suballocate(1024, 4, v, &IDLE).unwrap().unwrap();
        m.submit_chunks(QueueKind::Graphics, 1, 10);

        // Not finished yet; a new chunk must be created.
        let v2 = make_version(2, QueueKind::Graphics, false);
        m.suballocate(1024, 4, v2, &IDLE).unwrap().unwrap();
        assert_eq!(m.allocator.chunks_created, 2);
        m.submit_chunks(QueueKind::Graphics, 2, 11);

        let mut finished = IDLE;
        finished[QueueKind::Graphics.index()] = 11;
        let v3 = make_version(3, QueueKind::Graphics, false);
        m.suballocate(1024, 4, v3, &finished).unwrap().unwrap();
        assert_eq!(m.allocator.chunks_created, 2);
    }

    #[test]
    fn unsubmitted_chunks_are_not_recycled() {
        let mut m = manager(4096, 0);
        let v = make_version(1, QueueKind::Graphics, false);

        m.suballocate(4096, 4, v, &IDLE).unwrap().unwrap();
        // submit_chunks never ran; even a drained queue cannot reclaim it.
        let mut finished = IDLE;
        finished[QueueKind::Graphics.index()] = u32::MAX as u64;
        let v2 = make_version(2, QueueKind::Graphics, false);
        m.suballocate(4096, 4, v2, &finished).unwrap().unwrap();
        assert_eq!(m.allocator.chunks_created, 2);
    }

    #[test]
    fn fresh_chunks_round_up_to_page_alignment() {
        let mut m = manager(1000, 0);
        let v = make_version(1, QueueKind::Graphics, false);

        m.suballocate(10, 4, v, &IDLE).unwrap().unwrap();
        assert_eq!(m.allocated_memory(), BufferChunk::<Vec<u8>>::ALIGNMENT);

        // An oversized request rounds up as well.
        let s = m.suballocate(5000, 4, v, &IDLE).unwrap().unwrap();
        assert_eq!(s.offset, 0);
        assert_eq!(m.allocated_memory(), 4096 + 8192);
    }
}
