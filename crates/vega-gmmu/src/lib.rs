//! Guest GPU virtual address space management.
//!
//! The GPU MMU maps a large sparse virtual address space onto host-visible
//! guest memory. The whole space is modelled as an ordered list of chunks with
//! uniform state; every mutation (reserve/map/unmap) is expressed as inserting
//! a new chunk over the affected range, splitting and trimming neighbours as
//! needed. The list is sorted, gap-free and non-overlapping at all times, so
//! lookups are binary searches and reads can walk physically-discontiguous
//! mappings chunk by chunk.
//!
//! Callers mutating the address space must synchronize externally (the channel
//! owning the space serializes its own mutations); concurrent `read`s over a
//! stable mapping need no lock.

use tracing::trace;


/// The page size of the GPU address space.
pub const GPU_PAGE_SIZE: u64 = 1 << 16;

/// Default span of the GPU virtual address space.
pub const DEFAULT_ADDRESS_SPACE_SIZE: u64 = 1 << 40;

/// Default base of the GPU virtual address space, must be non-zero so that a
/// zero return value can act as the "no space" sentinel.
pub const DEFAULT_ADDRESS_SPACE_BASE: u64 = 0x10_0000;

/// Host-visible backing memory that mapped chunks point into.
///
/// This is the seam to the emulator's guest memory; offsets are opaque to the
/// address space manager beyond the arithmetic needed to slice chunks.
pub trait HostMemory {
    fn read_bytes(&self, host_offset: u64, dst: &mut [u8]);
    fn write_bytes(&mut self, host_offset: u64, src: &[u8]);
}

impl<T: HostMemory + ?Sized> HostMemory for &mut T {
    fn read_bytes(&self, host_offset: u64, dst: &mut [u8]) {
        <T as HostMemory>::read_bytes(&**self, host_offset, dst)
    }

    fn write_bytes(&mut self, host_offset: u64, src: &[u8]) {
        <T as HostMemory>::write_bytes(&mut **self, host_offset, src)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressSpaceError {
    /// The requested range cannot be reconciled with existing coverage. The
    /// chunk list always covers the full space, so hitting this indicates
    /// desynchronization with the guest and is unrecoverable.
    #[error("failed to insert chunk into GPU address space: address=0x{address:X} size=0x{size:X}")]
    InsertFailed { address: u64, size: u64 },
    /// A read or write touched a chunk that is not in the Mapped state.
    #[error("unmapped GPU address space access: address=0x{address:X} size=0x{size:X}")]
    UnmappedAccess { address: u64, size: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Not backed by anything; candidate for automatic placement.
    Unmapped,
    /// Reserved so automatic placement will not choose it, but not yet backed.
    Reserved,
    /// Backed by host-visible memory at `host_offset`.
    Mapped,
}

/// A contiguous range of the GPU virtual address space with uniform state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub address: u64,
    pub size: u64,
    /// Offset into the backing [`HostMemory`]; only meaningful when `state`
    /// is [`ChunkState::Mapped`].
    pub host_offset: u64,
    pub state: ChunkState,
}

impl ChunkDescriptor {
    pub fn new(address: u64, size: u64, host_offset: u64, state: ChunkState) -> Self {
        Self {
            address,
            size,
            host_offset,
            state,
        }
    }

    /// Whether `other` fits wholly within this chunk.
    fn can_contain(&self, other: &ChunkDescriptor) -> bool {
        other.address >= self.address
            && (self.address + self.size) >= (other.address + other.size)
    }

    fn end(&self) -> u64 {
        self.address + self.size
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

fn is_aligned(value: u64, alignment: u64) -> bool {
    debug_assert!(alignment.is_power_of_two());
    value & (alignment - 1) == 0
}

/// Manages mappings between the guest GPU's virtual address space and
/// host-visible guest memory.
#[derive(Debug)]
pub struct AddressSpace {
    base: u64,
    size: u64,
    chunks: Vec<ChunkDescriptor>,
}

impl AddressSpace {
    pub fn new(base: u64, size: u64) -> Self {
        assert!(base != 0, "address space base must be non-zero");
        // The space starts out as one big unmapped chunk that gets split up by
        // insertions.
        Self {
            base,
            size,
            chunks: vec![ChunkDescriptor::new(base, size, 0, ChunkState::Unmapped)],
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    /// Finds the first chunk in `state` strictly larger than `size`, starting
    /// at an address satisfying `alignment` when one is given.
    ///
    /// Only the chunk's own start address is tested against `alignment`: a
    /// chunk starting at an unaligned address is passed over even when an
    /// aligned region of the requested size would fit inside it, so callers
    /// may see the no-space sentinel while such a region exists.
    fn find_chunk(
        &self,
        state: ChunkState,
        size: u64,
        alignment: Option<u64>,
    ) -> Option<ChunkDescriptor> {
        self.chunks
            .iter()
            .find(|chunk| {
                alignment.map_or(true, |alignment| is_aligned(chunk.address, alignment))
                    && chunk.size > size
                    && chunk.state == state
            })
            .copied()
    }

    /// Inserts a chunk over its range, splitting or trimming existing chunks
    /// so coverage stays exact.
    ///
    /// Returns the base address of the inserted chunk. A range reaching
    /// outside the space fails before any chunk is touched, so the list is
    /// left intact.
    fn insert_chunk(&mut self, new: ChunkDescriptor) -> Result<u64, AddressSpaceError> {
        if new.address < self.base || new.end() > self.base + self.size {
            return Err(AddressSpaceError::InsertFailed {
                address: new.address,
                size: new.size,
            });
        }

        trace!(
            address = format_args!("0x{:X}", new.address),
            size = format_args!("0x{:X}", new.size),
            state = ?new.state,
            "inserting chunk"
        );

        let mut index = 0;
        while index < self.chunks.len() {
            let chunk = self.chunks[index];

            if chunk.can_contain(&new) {
                // Split the containing chunk into up to three pieces: the head
                // remainder, the new chunk and the tail remainder.
                let head_size = new.address - chunk.address;
                let tail_size = chunk.size - head_size - new.size;

                if head_size == 0 {
                    self.chunks[index] = new;
                } else {
                    self.chunks[index].size = head_size;
                    index += 1;
                    self.chunks.insert(index, new);
                }

                if tail_size != 0 {
                    let tail_host_offset = match chunk.state {
                        ChunkState::Mapped => chunk.host_offset + head_size + new.size,
                        _ => 0,
                    };
                    self.chunks.insert(
                        index + 1,
                        ChunkDescriptor::new(new.end(), tail_size, tail_host_offset, chunk.state),
                    );
                }

                return Ok(new.address);
            } else if chunk.end() > new.address {
                if chunk.address > new.address {
                    // The new chunk starts below the covered space.
                    break;
                }

                // The new chunk straddles chunk boundaries: truncate the first
                // overlapping chunk, drop every chunk fully covered by the new
                // range and trim the front off the final overlapping one.
                self.chunks[index].size = new.address - chunk.address;

                let tail = index + 1;
                while tail < self.chunks.len() && self.chunks[tail].end() <= new.end() {
                    self.chunks.remove(tail);
                }

                if let Some(tail_chunk) = self.chunks.get_mut(tail) {
                    if tail_chunk.address < new.end() {
                        let slice = new.end() - tail_chunk.address;
                        tail_chunk.address += slice;
                        tail_chunk.size -= slice;
                        if tail_chunk.state == ChunkState::Mapped {
                            tail_chunk.host_offset += slice;
                        }
                    }
                }

                // A zero-sized head can be replaced outright instead of
                // inserting after it.
                if self.chunks[index].size == 0 {
                    self.chunks[index] = new;
                } else {
                    self.chunks.insert(index + 1, new);
                }

                return Ok(new.address);
            }

            index += 1;
        }

        Err(AddressSpaceError::InsertFailed {
            address: new.address,
            size: new.size,
        })
    }

    /// Reserves a region so automatic placement will not choose it.
    ///
    /// Returns the base address of the reservation, or 0 if no free region of
    /// the requested size and alignment exists.
    pub fn reserve_space(&mut self, size: u64, alignment: u64) -> Result<u64, AddressSpaceError> {
        let size = align_up(size, GPU_PAGE_SIZE);

        let Some(mut chunk) = self.find_chunk(ChunkState::Unmapped, size, Some(alignment)) else {
            return Ok(0);
        };
        chunk.size = size;
        chunk.state = ChunkState::Reserved;

        self.insert_chunk(chunk)
    }

    /// Reserves the fixed region `[address, address + size)`.
    pub fn reserve_fixed(&mut self, address: u64, size: u64) -> Result<u64, AddressSpaceError> {
        if !is_aligned(address, GPU_PAGE_SIZE) {
            return Ok(0);
        }

        let size = align_up(size, GPU_PAGE_SIZE);
        self.insert_chunk(ChunkDescriptor::new(address, size, 0, ChunkState::Reserved))
    }

    /// Maps backing memory into an automatically chosen free region.
    pub fn map_allocate(&mut self, host_offset: u64, size: u64) -> Result<u64, AddressSpaceError> {
        let size = align_up(size, GPU_PAGE_SIZE);

        let Some(mut chunk) = self.find_chunk(ChunkState::Unmapped, size, None) else {
            return Ok(0);
        };
        chunk.host_offset = host_offset;
        chunk.size = size;
        chunk.state = ChunkState::Mapped;

        self.insert_chunk(chunk)
    }

    /// Maps backing memory at a fixed virtual address.
    pub fn map_fixed(
        &mut self,
        address: u64,
        host_offset: u64,
        size: u64,
    ) -> Result<u64, AddressSpaceError> {
        if !is_aligned(address, GPU_PAGE_SIZE) {
            return Ok(0);
        }

        let size = align_up(size, GPU_PAGE_SIZE);
        self.insert_chunk(ChunkDescriptor::new(
            address,
            size,
            host_offset,
            ChunkState::Mapped,
        ))
    }

    /// Unmaps all chunks overlapping the given region.
    pub fn unmap(&mut self, address: u64, size: u64) -> bool {
        if !is_aligned(address, GPU_PAGE_SIZE) {
            return false;
        }

        let size = align_up(size, GPU_PAGE_SIZE);
        self.insert_chunk(ChunkDescriptor::new(address, size, 0, ChunkState::Unmapped))
            .is_ok()
    }

    /// Index of the chunk containing `address`: upper-bound by address, then
    /// step back.
    fn containing_chunk(&self, address: u64) -> usize {
        let upper = self.chunks.partition_point(|chunk| chunk.address <= address);
        upper.saturating_sub(1)
    }

    /// Reads `dst.len()` bytes starting at the virtual address.
    ///
    /// A contiguous virtual range may be backed by several discontiguous host
    /// regions, so the copy advances chunk by chunk. Fails if any chunk
    /// touched is not mapped.
    pub fn read<M: HostMemory>(
        &self,
        mem: &M,
        address: u64,
        dst: &mut [u8],
    ) -> Result<(), AddressSpaceError> {
        let total = dst.len() as u64;
        let unmapped = |remaining: u64| AddressSpaceError::UnmappedAccess {
            address,
            size: remaining,
        };

        let mut index = self.containing_chunk(address);
        let chunk = &self.chunks[index];
        if chunk.state != ChunkState::Mapped || address < chunk.address || address >= chunk.end() {
            return Err(unmapped(total));
        }

        let chunk_offset = address - chunk.address;
        let mut source = chunk.host_offset + chunk_offset;
        let mut source_size = (chunk.size - chunk_offset).min(total);

        let mut remaining = total;
        while remaining != 0 {
            let cursor = (total - remaining) as usize;
            mem.read_bytes(source, &mut dst[cursor..cursor + source_size as usize]);

            remaining -= source_size;
            if remaining != 0 {
                index += 1;
                let chunk = self
                    .chunks
                    .get(index)
                    .filter(|chunk| chunk.state == ChunkState::Mapped)
                    .ok_or_else(|| unmapped(remaining))?;

                source = chunk.host_offset;
                source_size = chunk.size.min(remaining);
            }
        }

        Ok(())
    }

    /// Writes `src.len()` bytes starting at the virtual address, with the same
    /// chunk-walking semantics as [`AddressSpace::read`].
    pub fn write<M: HostMemory>(
        &self,
        mem: &mut M,
        address: u64,
        src: &[u8],
    ) -> Result<(), AddressSpaceError> {
        let total = src.len() as u64;
        let unmapped = |remaining: u64| AddressSpaceError::UnmappedAccess {
            address,
            size: remaining,
        };

        let mut index = self.containing_chunk(address);
        let chunk = &self.chunks[index];
        if chunk.state != ChunkState::Mapped || address < chunk.address || address >= chunk.end() {
            return Err(unmapped(total));
        }

        let chunk_offset = address - chunk.address;
        let mut destination = chunk.host_offset + chunk_offset;
        let mut destination_size = (chunk.size - chunk_offset).min(total);

        let mut remaining = total;
        while remaining != 0 {
            let cursor = (total - remaining) as usize;
            mem.write_bytes(destination, &src[cursor..cursor + destination_size as usize]);

            remaining -= destination_size;
            if remaining != 0 {
                index += 1;
                let chunk = self
                    .chunks
                    .get(index)
                    .filter(|chunk| chunk.state == ChunkState::Mapped)
                    .ok_or_else(|| unmapped(remaining))?;

                destination = chunk.host_offset;
                destination_size = chunk.size.min(remaining);
            }
        }

        Ok(())
    }

    /// Reads a little-endian `u32` slice out of the virtual address space.
    pub fn read_words<M: HostMemory>(
        &self,
        mem: &M,
        address: u64,
        dst: &mut [u32],
    ) -> Result<(), AddressSpaceError> {
        let mut bytes = vec![0u8; dst.len() * 4];
        self.read(mem, address, &mut bytes)?;
        for (word, chunk) in dst.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(())
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS_SPACE_BASE, DEFAULT_ADDRESS_SPACE_SIZE)
    }
}
