//! Persistently mapped upload buffers.

use crate::error::Result;
use crate::memory::{aligned, ResourceType};
use crate::object::{ObjectManager, VulkanObject};
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

/// A reserved range of a staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingData {
    pub staging_buffer: vk::Buffer,
    pub offset: u32,
    pub size: u32,
}

/// Bump allocator over one mapped `TRANSFER_SRC` buffer.
///
/// Used by one thread at a time and reset once per frame after the owning
/// slot's fence signaled.
pub struct StagingBuffer {
    object_manager: Arc<ObjectManager>,
    object: VulkanObject,
    mapped: NonNull<u8>,
    size_in_bytes: u32,
    offset_alignment: u32,
    size_alignment: u32,
    offset: u32,
    reservations: Vec<StagingData>,
}

// SAFETY: the mapping is owned by this value and only touched through
// `&mut self`.
unsafe impl Send for StagingBuffer {}

impl StagingBuffer {
    /// Create, map and bind a staging buffer of at least `size_in_bytes`.
    pub fn new(object_manager: Arc<ObjectManager>, size_in_bytes: u32) -> Result<Self> {
        let offset_alignment = object_manager.offset_alignment(ResourceType::Staging);
        let size = aligned(vk::DeviceSize::from(size_in_bytes), offset_alignment);
        let size_in_bytes = u32::try_from(size).unwrap_or(u32::MAX);

        let object = object_manager.create_buffer(ResourceType::Staging, size_in_bytes, 0)?;
        let requirements = object_manager
            .device()
            .buffer_memory_requirements(object.buffer);
        let size_alignment = object_manager.size_alignment(&requirements);

        // SAFETY: the buffer was just created; nothing else can reach its
        // memory block, which stays blocked while mapped.
        let mapped = match unsafe { object_manager.map_unsafe(&object) } {
            Ok(ptr) => ptr,
            Err(e) => {
                object_manager.destroy_object(object);
                return Err(e);
            }
        };
        let Some(mapped) = NonNull::new(mapped) else {
            // SAFETY: mapped just above.
            unsafe { object_manager.unmap_unsafe(&object) };
            object_manager.destroy_object(object);
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED.into());
        };

        let mut staging = Self {
            object_manager,
            object,
            mapped,
            size_in_bytes,
            offset_alignment: offset_alignment as u32,
            size_alignment: size_alignment as u32,
            offset: 0,
            reservations: Vec::new(),
        };
        staging.object_manager.bind_buffer(&staging.object)?;

        tracing::trace!(size = size_in_bytes, "Created staging buffer");
        Ok(staging)
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.object.buffer
    }

    pub fn size(&self) -> u32 {
        self.size_in_bytes
    }

    /// Bytes reserved since the last reset.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Whether `size_in_bytes` more bytes can be reserved.
    pub fn has_enough_space(&self, size_in_bytes: u32) -> bool {
        let size = aligned(
            vk::DeviceSize::from(size_in_bytes),
            vk::DeviceSize::from(self.size_alignment),
        );
        vk::DeviceSize::from(self.offset) + size <= vk::DeviceSize::from(self.size_in_bytes)
    }

    /// Reserve `size_in_bytes` bytes.
    ///
    /// # Panics
    /// If the reservation does not fit, see
    /// [`has_enough_space`](Self::has_enough_space).
    pub fn reserve(&mut self, size_in_bytes: u32) -> StagingData {
        assert_eq!(self.offset % self.offset_alignment.max(1), 0);
        assert!(
            self.has_enough_space(size_in_bytes),
            "Staging buffer has no room for {size_in_bytes} bytes ({} of {} used)",
            self.offset,
            self.size_in_bytes
        );

        let aligned_size = aligned(
            vk::DeviceSize::from(size_in_bytes),
            vk::DeviceSize::from(self.size_alignment),
        );
        let base_offset = self.offset;
        let next_offset = aligned(
            vk::DeviceSize::from(base_offset) + aligned_size,
            vk::DeviceSize::from(self.offset_alignment),
        )
        .min(vk::DeviceSize::from(self.size_in_bytes));
        self.offset = next_offset as u32;

        StagingData {
            staging_buffer: self.object.buffer,
            offset: base_offset,
            size: size_in_bytes,
        }
    }

    /// Reserve and remember the reservation under the returned id.
    pub fn reserve_with_id(&mut self, size_in_bytes: u32) -> (u32, StagingData) {
        let data = self.reserve(size_in_bytes);
        self.reservations.push(data);
        ((self.reservations.len() - 1) as u32, data)
    }

    /// # Panics
    /// If `id` was not returned by [`reserve_with_id`](Self::reserve_with_id)
    /// since the last reset.
    pub fn get_reservation_by_id(&self, id: u32) -> &StagingData {
        let index = id as usize;
        assert!(
            index < self.reservations.len(),
            "Unknown staging reservation {id}"
        );
        &self.reservations[index]
    }

    /// Copy `bytes` into a reservation of this buffer.
    pub fn write(&mut self, data: &StagingData, bytes: &[u8]) {
        assert_eq!(data.staging_buffer, self.object.buffer);
        assert!(bytes.len() <= data.size as usize);
        assert!(data.offset as usize + bytes.len() <= self.size_in_bytes as usize);
        // SAFETY: the range lies inside the mapped buffer, checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mapped.as_ptr().add(data.offset as usize),
                bytes.len(),
            );
        }
    }

    /// Make reserved bytes visible to the device.
    pub fn flush(&mut self) -> Result<()> {
        if self.offset == 0 {
            return Ok(());
        }
        // SAFETY: the block is exclusively ours while mapped.
        unsafe {
            self.object_manager
                .flush_unsafe(&self.object, 0, vk::DeviceSize::from(self.offset))
        }
    }

    /// Forget every reservation.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.reservations.clear();
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        // SAFETY: mapped in `new`, exclusively ours.
        unsafe { self.object_manager.unmap_unsafe(&self.object) };
        self.object_manager
            .destroy_object(std::mem::take(&mut self.object));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::testing::{fake_capabilities, Call, FakeDevice};

    fn staging(size: u32) -> (Arc<FakeDevice>, Arc<ObjectManager>, StagingBuffer) {
        let fake = Arc::new(FakeDevice::default());
        let manager = Arc::new(ObjectManager::new(
            fake.clone(),
            &fake_capabilities(),
            &ContextConfig::default(),
        ));
        let staging = StagingBuffer::new(manager.clone(), size).unwrap();
        (fake, manager, staging)
    }

    #[test]
    fn reservations_are_aligned() {
        let (_fake, _manager, mut staging) = staging(1000);
        assert_eq!(staging.size(), 1024);

        let a = staging.reserve(10);
        let b = staging.reserve(100);
        let c = staging.reserve(1);
        assert_eq!((a.offset, a.size), (0, 10));
        assert_eq!((b.offset, b.size), (64, 100));
        assert_eq!(c.offset, 192);
        assert_eq!(staging.offset(), 256);
        assert_eq!(a.staging_buffer, staging.buffer());
    }

    #[test]
    fn space_check_is_exact() {
        let (_fake, _manager, mut staging) = staging(256);
        assert!(staging.has_enough_space(256));
        assert!(!staging.has_enough_space(257));
        staging.reserve(200);
        assert!(!staging.has_enough_space(1));
        staging.reset();
        assert_eq!(staging.offset(), 0);
        assert!(staging.has_enough_space(256));
    }

    #[test]
    #[should_panic(expected = "no room")]
    fn reserving_without_space_is_fatal() {
        let (_fake, _manager, mut staging) = staging(128);
        staging.reserve(64);
        staging.reserve(65);
    }

    #[test]
    fn write_lands_in_the_buffer() {
        let (fake, _manager, mut staging) = staging(512);
        staging.reserve(32);
        let data = staging.reserve(5);
        staging.write(&data, b"hello");
        staging.flush().unwrap();
        assert_eq!(
            fake.read_buffer(staging.buffer(), data.offset as usize, 5),
            b"hello"
        );
        // Staging memory is host coherent.
        assert_eq!(
            fake.count_calls(|c| matches!(c, Call::FlushMappedRange(_))),
            0
        );
    }

    #[test]
    fn named_reservations() {
        let (_fake, _manager, mut staging) = staging(512);
        let (first, data) = staging.reserve_with_id(16);
        let (second, _) = staging.reserve_with_id(16);
        assert_eq!((first, second), (0, 1));
        assert_eq!(staging.get_reservation_by_id(first), &data);
    }

    #[test]
    #[should_panic(expected = "Unknown staging reservation")]
    fn reset_forgets_named_reservations() {
        let (_fake, _manager, mut staging) = staging(512);
        let (id, _) = staging.reserve_with_id(16);
        staging.reset();
        staging.get_reservation_by_id(id);
    }

    #[test]
    fn drop_unmaps_and_defers_destruction() {
        let (fake, manager, staging) = staging(512);
        let buffer = staging.buffer();
        drop(staging);
        assert!(fake
            .calls()
            .iter()
            .any(|c| matches!(c, Call::UnmapMemory(_))));
        assert_eq!(manager.pending_object_count(), 1);
        assert!(!fake.calls().contains(&Call::DestroyBuffer(buffer)));
        manager.collect_objects(0);
        assert!(fake.calls().contains(&Call::DestroyBuffer(buffer)));
    }
}
