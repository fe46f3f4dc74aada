//! Pipeline state keys and the pipeline cache seam.
//!
//! Pipelines themselves are built by the renderer that owns shader programs.
//! The frame context only tracks the state a draw needs and asks a
//! [`PipelineCache`] for the matching pipeline.

use crate::error::Result;
use ash::vk;

/// Layouts of a linked shader program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramLayout {
    /// Program identity, stable for the lifetime of the program.
    pub id: u32,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
}

/// Comparison used by depth and stencil tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TestFunction {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl TestFunction {
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            Self::Never => vk::CompareOp::NEVER,
            Self::Less => vk::CompareOp::LESS,
            Self::Equal => vk::CompareOp::EQUAL,
            Self::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            Self::Greater => vk::CompareOp::GREATER,
            Self::NotEqual => vk::CompareOp::NOT_EQUAL,
            Self::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            Self::Always => vk::CompareOp::ALWAYS,
        }
    }
}

/// What the stencil test does with the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilAction {
    #[default]
    Keep,
    Zero,
    Replace,
    Increment,
    IncrementWrap,
    Decrement,
    DecrementWrap,
    Invert,
}

impl StencilAction {
    pub fn to_vk(self) -> vk::StencilOp {
        match self {
            Self::Keep => vk::StencilOp::KEEP,
            Self::Zero => vk::StencilOp::ZERO,
            Self::Replace => vk::StencilOp::REPLACE,
            Self::Increment => vk::StencilOp::INCREMENT_AND_CLAMP,
            Self::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
            Self::Decrement => vk::StencilOp::DECREMENT_AND_CLAMP,
            Self::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
            Self::Invert => vk::StencilOp::INVERT,
        }
    }
}

/// Which polygon faces a stencil setting applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StencilFace {
    Front,
    Back,
    FrontAndBack,
}

/// Stencil state of one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFaceKey {
    pub function: TestFunction,
    pub stencil_fail: StencilAction,
    pub depth_fail: StencilAction,
    pub pass: StencilAction,
}

impl Default for StencilFaceKey {
    fn default() -> Self {
        Self {
            function: TestFunction::Always,
            stencil_fail: StencilAction::Keep,
            depth_fail: StencilAction::Keep,
            pass: StencilAction::Keep,
        }
    }
}

impl StencilFaceKey {
    fn to_vk(self) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.stencil_fail.to_vk(),
            pass_op: self.pass.to_vk(),
            depth_fail_op: self.depth_fail.to_vk(),
            compare_op: self.function.to_vk(),
            compare_mask: 0xFF,
            write_mask: 0xFF,
            // Dynamic state.
            reference: 0,
        }
    }
}

/// Depth and stencil test state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthStencilKey {
    pub depth_enabled: bool,
    pub depth_function: TestFunction,
    pub stencil_enabled: bool,
    pub front: StencilFaceKey,
    pub back: StencilFaceKey,
}

impl DepthStencilKey {
    pub fn set_depth_test_enabled(&mut self, enabled: bool) {
        self.depth_enabled = enabled;
    }

    pub fn set_depth_test_function(&mut self, function: TestFunction) {
        self.depth_function = function;
    }

    pub fn set_stencil_test_enabled(&mut self, enabled: bool) {
        self.stencil_enabled = enabled;
    }

    pub fn set_stencil_function(&mut self, face: StencilFace, function: TestFunction) {
        self.faces_mut(face, |key| key.function = function);
    }

    pub fn set_stencil_actions(
        &mut self,
        face: StencilFace,
        stencil_fail: StencilAction,
        depth_fail: StencilAction,
        pass: StencilAction,
    ) {
        self.faces_mut(face, |key| {
            key.stencil_fail = stencil_fail;
            key.depth_fail = depth_fail;
            key.pass = pass;
        });
    }

    fn faces_mut(&mut self, face: StencilFace, f: impl Fn(&mut StencilFaceKey)) {
        if matches!(face, StencilFace::Front | StencilFace::FrontAndBack) {
            f(&mut self.front);
        }
        if matches!(face, StencilFace::Back | StencilFace::FrontAndBack) {
            f(&mut self.back);
        }
    }

    /// Depth/stencil create info for a pipeline built from this key.
    pub fn depth_stencil_state(&self) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_enabled)
            .depth_write_enable(self.depth_enabled)
            .depth_compare_op(if self.depth_enabled {
                self.depth_function.to_vk()
            } else {
                vk::CompareOp::ALWAYS
            })
            .stencil_test_enable(self.stencil_enabled)
            .front(self.front.to_vk())
            .back(self.back.to_vk())
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
    }
}

/// One vertex attribute inside a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Layout of one vertex buffer binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BindingInfo {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// Everything that selects a graphics pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub render_pass: vk::RenderPass,
    pub program: Option<ProgramLayout>,
    pub depth_stencil: DepthStencilKey,
    pub binding_info: Vec<BindingInfo>,
    pub primitive_topology: vk::PrimitiveTopology,
    pub blending_enabled: bool,
    pub culling_enabled: bool,
}

impl Default for PipelineKey {
    fn default() -> Self {
        Self {
            render_pass: vk::RenderPass::null(),
            program: None,
            depth_stencil: DepthStencilKey::default(),
            binding_info: Vec::new(),
            primitive_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            blending_enabled: false,
            culling_enabled: true,
        }
    }
}

/// Source of graphics pipelines, owned by the renderer.
pub trait PipelineCache: Send {
    /// Get or build the pipeline for a key.
    fn get_pipeline(&mut self, key: &PipelineKey) -> Result<vk::Pipeline>;

    /// Destroy every cached pipeline.
    fn reset_cache(&mut self);

    /// Destroy pipelines built against a render pass that is going away.
    fn reset_cache_for_render_pass(&mut self, render_pass: vk::RenderPass);

    /// Persist the driver pipeline cache, if the implementation keeps one.
    fn dump(&mut self) {}

    /// Release everything. The device is idle.
    fn destroy(&mut self);
}
