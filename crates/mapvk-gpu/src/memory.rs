//! Device memory sub-allocation.
//!
//! Device memory is requested in blocks, one set of blocks per resource
//! category and batcher hash, and carved up with a bump pointer. Blocks whose
//! last allocation is released are recycled through a size-sorted free list
//! until the category's running total exceeds its budget, after which they are
//! returned to the driver.

use crate::config::MemoryBudgets;
use crate::device::VulkanDevice;
use crate::error::Result;
use crate::pretty::PrettySize;
use ash::vk;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Memory category. Categories never share a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Vertex and index buffers.
    Geometry,
    /// Uniform buffers.
    Uniform,
    /// Host-visible transfer sources.
    Staging,
    /// Textures and attachments.
    Image,
}

impl ResourceType {
    /// Number of categories.
    pub const COUNT: usize = 4;

    /// All categories in index order.
    pub const ALL: [Self; Self::COUNT] = [Self::Geometry, Self::Uniform, Self::Staging, Self::Image];

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    /// Preferred memory properties, then the fallback if none match.
    fn memory_flags(self) -> (vk::MemoryPropertyFlags, Option<vk::MemoryPropertyFlags>) {
        use vk::MemoryPropertyFlags as F;
        match self {
            Self::Geometry => (
                F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
                Some(F::HOST_VISIBLE | F::HOST_COHERENT),
            ),
            Self::Uniform | Self::Staging => (F::HOST_VISIBLE | F::HOST_COHERENT, None),
            Self::Image => (F::DEVICE_LOCAL | F::LAZILY_ALLOCATED, Some(F::DEVICE_LOCAL)),
        }
    }
}

/// One `vkAllocateMemory` allocation.
///
/// Owned by the [`MemoryManager`]; allocations only hold weak references.
/// Counters are only modified by the owning manager.
pub struct MemoryBlock {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    is_coherent: bool,
    free_offset: AtomicU64,
    allocation_counter: AtomicU32,
    is_blocked: AtomicBool,
}

impl MemoryBlock {
    fn new(memory: vk::DeviceMemory, size: vk::DeviceSize, is_coherent: bool) -> Self {
        Self {
            memory,
            size,
            is_coherent,
            free_offset: AtomicU64::new(0),
            allocation_counter: AtomicU32::new(0),
            is_blocked: AtomicBool::new(false),
        }
    }

    /// Device memory handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Block size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Whether host writes are visible without flushing.
    pub fn is_coherent(&self) -> bool {
        self.is_coherent
    }

    /// Whether the block is mapped. A mapped block is not bump-allocated from.
    pub fn is_blocked(&self) -> bool {
        self.is_blocked.load(Ordering::Acquire)
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.is_blocked.store(blocked, Ordering::Release);
    }

    fn free_offset(&self) -> vk::DeviceSize {
        self.free_offset.load(Ordering::Relaxed)
    }

    fn allocation_counter(&self) -> u32 {
        self.allocation_counter.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("memory", &self.memory)
            .field("size", &PrettySize(self.size))
            .field("free_offset", &self.free_offset())
            .field("allocation_counter", &self.allocation_counter())
            .field("is_coherent", &self.is_coherent)
            .field("is_blocked", &self.is_blocked())
            .finish()
    }
}

/// A sub-allocation of a [`MemoryBlock`].
///
/// Released explicitly with [`MemoryManager::deallocate`].
pub struct Allocation {
    resource_type: ResourceType,
    block_hash: u64,
    aligned_offset: vk::DeviceSize,
    aligned_size: vk::DeviceSize,
    block: Weak<MemoryBlock>,
}

impl Allocation {
    fn new(
        resource_type: ResourceType,
        block_hash: u64,
        aligned_offset: vk::DeviceSize,
        aligned_size: vk::DeviceSize,
        block: &Arc<MemoryBlock>,
    ) -> Self {
        Self {
            resource_type,
            block_hash,
            aligned_offset,
            aligned_size,
            block: Arc::downgrade(block),
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn block_hash(&self) -> u64 {
        self.block_hash
    }

    /// Offset inside the block.
    pub fn offset(&self) -> vk::DeviceSize {
        self.aligned_offset
    }

    /// Size rounded up to the size alignment.
    pub fn size(&self) -> vk::DeviceSize {
        self.aligned_size
    }

    /// The owning block, if it still exists.
    pub fn block(&self) -> Option<Arc<MemoryBlock>> {
        self.block.upgrade()
    }

    /// Device memory of the owning block, or null if the block is gone.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.block
            .upgrade()
            .map_or(vk::DeviceMemory::null(), |block| block.memory)
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("resource_type", &self.resource_type)
            .field("block_hash", &self.block_hash)
            .field("offset", &self.aligned_offset)
            .field("size", &self.aligned_size)
            .field("memory", &self.memory())
            .finish()
    }
}

/// Round `value` up to a multiple of `alignment`.
pub fn aligned(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value.next_multiple_of(alignment)
    }
}

/// Block sub-allocator.
pub struct MemoryManager {
    device: Arc<dyn VulkanDevice>,
    limits: vk::PhysicalDeviceLimits,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    budgets: MemoryBudgets,
    offset_alignments: [vk::DeviceSize; ResourceType::COUNT],
    blocks: [HashMap<u64, Vec<Arc<MemoryBlock>>>; ResourceType::COUNT],
    free_blocks: [Vec<Arc<MemoryBlock>>; ResourceType::COUNT],
    sizes: [vk::DeviceSize; ResourceType::COUNT],
    total_allocations: u32,
    in_deallocation_session: bool,
    deallocation_session_mask: u8,
}

impl MemoryManager {
    /// Create a manager for a device.
    pub fn new(
        device: Arc<dyn VulkanDevice>,
        limits: vk::PhysicalDeviceLimits,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        budgets: MemoryBudgets,
    ) -> Self {
        let atom = limits.non_coherent_atom_size.max(1);
        let offset_alignments = ResourceType::ALL.map(|resource_type| {
            let base = match resource_type {
                ResourceType::Uniform => limits.min_uniform_buffer_offset_alignment,
                _ => limits.min_memory_map_alignment as vk::DeviceSize,
            };
            num::integer::lcm(base.max(1), atom)
        });

        Self {
            device,
            limits,
            memory_properties,
            budgets,
            offset_alignments,
            blocks: Default::default(),
            free_blocks: Default::default(),
            sizes: [0; ResourceType::COUNT],
            total_allocations: 0,
            in_deallocation_session: false,
            deallocation_session_mask: 0,
        }
    }

    /// Device limits the alignments were computed from.
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    /// Offset alignment of a category.
    pub fn offset_alignment(&self, resource_type: ResourceType) -> vk::DeviceSize {
        self.offset_alignments[resource_type.index()]
    }

    /// Size alignment for a memory requirement.
    pub fn size_alignment(&self, requirements: &vk::MemoryRequirements) -> vk::DeviceSize {
        num::integer::lcm(
            requirements.alignment.max(1),
            self.limits.non_coherent_atom_size.max(1),
        )
    }

    /// Bytes of device memory currently held for a category.
    pub fn allocated_size(&self, resource_type: ResourceType) -> vk::DeviceSize {
        self.sizes[resource_type.index()]
    }

    /// Number of live device-memory allocations.
    pub fn total_allocations(&self) -> u32 {
        self.total_allocations
    }

    /// Number of drained blocks waiting for reuse.
    pub fn free_block_count(&self, resource_type: ResourceType) -> usize {
        self.free_blocks[resource_type.index()].len()
    }

    /// Sub-allocate memory for a resource.
    ///
    /// Tries the most recent block of `(resource_type, block_hash)`, then the
    /// smallest free block that fits, then allocates a new block.
    ///
    /// # Panics
    /// If no memory type is compatible or the device allocation limit would be
    /// exceeded.
    pub fn allocate(
        &mut self,
        resource_type: ResourceType,
        requirements: vk::MemoryRequirements,
        block_hash: u64,
    ) -> Result<Allocation> {
        let index = resource_type.index();
        let aligned_size = aligned(requirements.size, self.size_alignment(&requirements));
        let offset_alignment = self.offset_alignments[index];

        if let Some(block) = self.blocks[index]
            .get(&block_hash)
            .and_then(|blocks| blocks.last())
        {
            let aligned_offset = aligned(block.free_offset(), offset_alignment);
            if !block.is_blocked() && aligned_offset + aligned_size <= block.size {
                block
                    .free_offset
                    .store(aligned_offset + aligned_size, Ordering::Relaxed);
                block.allocation_counter.fetch_add(1, Ordering::Relaxed);
                return Ok(Allocation::new(
                    resource_type,
                    block_hash,
                    aligned_offset,
                    aligned_size,
                    block,
                ));
            }
        }

        let free_blocks = &mut self.free_blocks[index];
        let position = free_blocks.partition_point(|block| block.size < aligned_size);
        if position < free_blocks.len() {
            let block = free_blocks.remove(position);
            debug_assert_eq!(block.allocation_counter(), 0);
            debug_assert!(!block.is_blocked());
            block.free_offset.store(aligned_size, Ordering::Relaxed);
            block.allocation_counter.store(1, Ordering::Relaxed);
            tracing::trace!(
                ?resource_type,
                size = ?PrettySize(block.size),
                "Reusing free memory block"
            );
            let allocation = Allocation::new(resource_type, block_hash, 0, aligned_size, &block);
            self.blocks[index].entry(block_hash).or_default().push(block);
            return Ok(allocation);
        }

        let (preferred, fallback) = resource_type.memory_flags();
        let memory_type_index = self
            .find_memory_type(requirements.memory_type_bits, preferred)
            .or_else(|| {
                fallback.and_then(|flags| {
                    self.find_memory_type(requirements.memory_type_bits, flags)
                })
            })
            .unwrap_or_else(|| {
                panic!("Unsupported memory allocation configuration for {resource_type:?}")
            });

        let block_size = self
            .budgets
            .get(resource_type)
            .min_block_size
            .max(aligned_size);
        self.increment_total_allocations();
        let memory = match self.device.allocate_memory(block_size, memory_type_index) {
            Ok(memory) => memory,
            Err(e) => {
                self.total_allocations -= 1;
                tracing::error!(
                    ?resource_type,
                    size = ?PrettySize(block_size),
                    "vkAllocateMemory failed: {e}"
                );
                return Err(e.into());
            }
        };
        self.sizes[index] += block_size;

        let is_coherent = self.memory_properties.memory_types[memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        let block = Arc::new(MemoryBlock::new(memory, block_size, is_coherent));
        block.free_offset.store(aligned_size, Ordering::Relaxed);
        block.allocation_counter.store(1, Ordering::Relaxed);

        tracing::debug!(
            ?resource_type,
            size = ?PrettySize(block_size),
            total = ?PrettySize(self.sizes[index]),
            memory_type_index,
            "Allocated memory block"
        );

        let allocation = Allocation::new(resource_type, block_hash, 0, aligned_size, &block);
        self.blocks[index].entry(block_hash).or_default().push(block);
        Ok(allocation)
    }

    /// Release a sub-allocation.
    ///
    /// A drained block is freed if its category is over budget and recycled
    /// otherwise. Inside a deallocation session that decision is deferred to
    /// [`end_deallocation_session`](Self::end_deallocation_session).
    ///
    /// # Panics
    /// On a double free, or if the block is mapped.
    pub fn deallocate(&mut self, allocation: Allocation) {
        let Some(block) = allocation.block.upgrade() else {
            panic!("Double free: memory block of {allocation:?} is already released");
        };
        assert!(
            !block.is_blocked(),
            "Deallocating from a mapped memory block: {block:?}"
        );

        let index = allocation.resource_type.index();
        let Some(blocks) = self.blocks[index].get_mut(&allocation.block_hash) else {
            panic!("Double free: {allocation:?} is not owned by this manager");
        };
        let Some(position) = blocks.iter().position(|b| Arc::ptr_eq(b, &block)) else {
            panic!("Double free: {allocation:?} is not owned by this manager");
        };

        let counter = block.allocation_counter();
        assert!(counter > 0, "Double free: {allocation:?} has no live allocations");
        block.allocation_counter.store(counter - 1, Ordering::Relaxed);
        if counter > 1 {
            return;
        }

        if self.in_deallocation_session {
            self.deallocation_session_mask |= 1 << index;
            return;
        }

        let drained = blocks.remove(position);
        if blocks.is_empty() {
            self.blocks[index].remove(&allocation.block_hash);
        }
        self.release_block(allocation.resource_type, drained);
        self.free_blocks[index].sort_by_key(|b| b.size);
    }

    /// Start batching block releases.
    pub fn begin_deallocation_session(&mut self) {
        self.in_deallocation_session = true;
        self.deallocation_session_mask = 0;
    }

    /// Release every block drained during the session.
    pub fn end_deallocation_session(&mut self) {
        if !self.in_deallocation_session {
            return;
        }
        self.in_deallocation_session = false;

        for resource_type in ResourceType::ALL {
            let index = resource_type.index();
            if (self.deallocation_session_mask >> index) & 1 == 0 {
                continue;
            }

            let mut drained = Vec::new();
            self.blocks[index].retain(|_, blocks| {
                blocks.retain(|block| {
                    if block.allocation_counter() == 0 {
                        drained.push(Arc::clone(block));
                        false
                    } else {
                        true
                    }
                });
                !blocks.is_empty()
            });

            for block in drained {
                self.release_block(resource_type, block);
            }
            self.free_blocks[index].sort_by_key(|b| b.size);
        }

        self.deallocation_session_mask = 0;
    }

    fn release_block(&mut self, resource_type: ResourceType, block: Arc<MemoryBlock>) {
        let index = resource_type.index();
        if self.sizes[index] > self.budgets.get(resource_type).desired_size {
            assert!(block.size <= self.sizes[index]);
            self.sizes[index] -= block.size;
            self.decrement_total_allocations();
            self.device.free_memory(block.memory);
            tracing::debug!(
                ?resource_type,
                size = ?PrettySize(block.size),
                total = ?PrettySize(self.sizes[index]),
                "Freed memory block"
            );
        } else {
            block.free_offset.store(0, Ordering::Relaxed);
            self.free_blocks[index].push(block);
        }
    }

    fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            (type_bits >> i) & 1 == 1
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
        })
    }

    fn increment_total_allocations(&mut self) {
        assert!(
            self.total_allocations < self.limits.max_memory_allocation_count,
            "Device memory allocation limit ({}) reached",
            self.limits.max_memory_allocation_count
        );
        self.total_allocations += 1;
    }

    fn decrement_total_allocations(&mut self) {
        assert!(self.total_allocations > 0);
        self.total_allocations -= 1;
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        for blocks in &mut self.blocks {
            for block in blocks.drain().flat_map(|(_, blocks)| blocks) {
                self.device.free_memory(block.memory);
            }
        }
        for free_blocks in &mut self.free_blocks {
            for block in free_blocks.drain(..) {
                self.device.free_memory(block.memory);
            }
        }
    }
}
