//! Vulkan resource and frame lifecycle management for the mapvk renderer.
//!
//! This crate provides:
//! - Pooled device memory with per-category budgets ([`MemoryManager`])
//! - Buffer, image, descriptor set and sampler lifetimes with deferred
//!   destruction across frames in flight ([`ObjectManager`])
//! - Mapped staging buffers for uploads ([`StagingBuffer`])
//! - The acquire / record / submit / present cycle, render pass and
//!   framebuffer caching ([`BaseContext`])
//! - Instance, device and window surface bootstrap ([`GpuContextBuilder`],
//!   [`SurfaceContext`])

pub mod attachment;
pub mod base_context;
pub mod capabilities;
pub mod command;
pub mod config;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod instance;
pub mod memory;
pub mod object;
pub mod pipeline;
pub mod pretty;
pub mod sampler;
pub mod staging;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod testing;

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_INFLIGHT_FRAMES: usize = 2;

pub use attachment::AttachmentImage;
pub use base_context::{BaseContext, ContextHandler, FrameState, HandlerType};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use config::{ContextConfig, MemoryBudget, MemoryBudgets};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorSetGroup, ParamDescriptor};
pub use device::{AshDevice, VulkanDevice};
pub use error::{GpuError, Result};
pub use framebuffer::{ClearBits, FramebufferId, OffscreenFramebuffer};
pub use memory::{Allocation, MemoryManager, ResourceType};
pub use object::{ObjectManager, ThreadType, VulkanObject};
pub use pipeline::{
    BindingInfo, PipelineCache, PipelineKey, ProgramLayout, StencilAction, StencilFace,
    TestFunction, VertexAttribute,
};
pub use sampler::{SamplerKey, TextureFilter, TextureWrapping};
pub use staging::{StagingBuffer, StagingData};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{SurfaceDescription, Swapchain};
