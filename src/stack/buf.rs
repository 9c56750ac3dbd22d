//
// Copyright 2024 Jeff Bush
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

// Packet storage. A PacketBuffer is one contiguous region with headroom at
// the front, so protocol layers can prepend their headers (innermost first)
// after the payload has been written, and strip them again on receive
// without copying.

use crate::error::{NetError, Result};
use crate::sync::SpinMutex;
use crate::util::Statistics;
use std::fmt;
use std::sync::Arc;

pub struct PacketBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
    pool: Option<BufferPool>,
}

impl PacketBuffer {
    /// Allocate a stand-alone buffer that is freed (not pooled) on drop.
    pub fn new(capacity: usize, headroom: usize) -> Self {
        let headroom = headroom.min(capacity);
        PacketBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: headroom,
            end: headroom,
            pool: None,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn headroom(&self) -> usize {
        self.start
    }

    pub fn tailroom(&self) -> usize {
        self.data.len() - self.end
    }

    /// Discard the contents and leave `headroom` bytes free at the front.
    pub fn reset(&mut self, headroom: usize) {
        let headroom = headroom.min(self.data.len());
        self.start = headroom;
        self.end = headroom;
    }

    /// The valid bytes, starting with the outermost header.
    pub fn header(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.end]
    }

    /// Grow the valid region towards the front by `size` bytes, for a new
    /// header that the caller then fills in through `header_mut`.
    pub fn alloc_header(&mut self, size: usize) -> Result<()> {
        if size > self.start {
            return Err(NetError::CapacityExceeded {
                needed: size,
                available: self.start,
            });
        }

        self.start -= size;
        for byte in &mut self.data[self.start..self.start + size] {
            *byte = 0;
        }

        Ok(())
    }

    /// Remove `size` bytes from the front (a consumed header).
    pub fn trim_head(&mut self, size: usize) {
        self.start = std::cmp::min(self.start + size, self.end);
    }

    /// Remove `size` bytes from the end (link layer padding).
    pub fn trim_tail(&mut self, size: usize) {
        self.end = std::cmp::max(self.end.saturating_sub(size), self.start);
    }

    pub fn append_from_slice(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.tailroom() {
            return Err(NetError::CapacityExceeded {
                needed: data.len(),
                available: self.tailroom(),
            });
        }

        self.data[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
        Ok(())
    }

    /// Copy as much of the contents as fits into `dest`, returning the
    /// number of bytes copied.
    pub fn copy_to_slice(&self, dest: &mut [u8]) -> usize {
        let copy_len = std::cmp::min(self.len(), dest.len());
        dest[..copy_len].copy_from_slice(&self.data[self.start..self.start + copy_len]);
        copy_len
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct FreeList {
    buffers: Vec<Box<[u8]>>,
    created: usize,
}

struct PoolInner {
    free: SpinMutex<FreeList>,
    buffer_size: usize,
    limit: usize,
    stats: Arc<Statistics>,
}

/// Fixed-size buffers that are recycled instead of returned to the heap.
///
/// `preallocate` buffers are created up front. Beyond that, the pool grows
/// on demand until `limit` buffers exist; after that allocation fails until
/// a buffer is dropped, so the receive path never allocates without bound.
#[derive(Clone)]
pub struct BufferPool(Arc<PoolInner>);

impl BufferPool {
    pub fn new(buffer_size: usize, preallocate: usize, limit: usize, stats: Arc<Statistics>) -> Self {
        let limit = std::cmp::max(limit, preallocate);
        let mut buffers = Vec::with_capacity(limit);
        for _ in 0..preallocate {
            buffers.push(vec![0u8; buffer_size].into_boxed_slice());
        }

        stats.buffers_created.add(preallocate as u32);
        BufferPool(Arc::new(PoolInner {
            free: SpinMutex::new(FreeList {
                buffers,
                created: preallocate,
            }),
            buffer_size,
            limit,
            stats,
        }))
    }

    pub fn buffer_size(&self) -> usize {
        self.0.buffer_size
    }

    pub fn free_count(&self) -> usize {
        self.0.free.lock().buffers.len()
    }

    /// Take a buffer with `headroom` bytes reserved in front of the
    /// (initially empty) contents.
    pub fn alloc(&self, headroom: usize) -> Result<PacketBuffer> {
        let data = {
            let mut free = self.0.free.lock();
            match free.buffers.pop() {
                Some(data) => data,
                None if free.created < self.0.limit => {
                    free.created += 1;
                    self.0.stats.buffers_created.inc();
                    vec![0u8; self.0.buffer_size].into_boxed_slice()
                }
                None => {
                    tracing::warn!(limit = self.0.limit, "packet buffer pool exhausted");
                    return Err(NetError::BuffersExhausted);
                }
            }
        };

        self.0.stats.buffers_allocated.inc();
        let headroom = headroom.min(data.len());
        Ok(PacketBuffer {
            data,
            start: headroom,
            end: headroom,
            pool: Some(self.clone()),
        })
    }

    fn release(&self, data: Box<[u8]>) {
        self.0.stats.buffers_freed.inc();
        self.0.free.lock().buffers.push(data);
    }
}
