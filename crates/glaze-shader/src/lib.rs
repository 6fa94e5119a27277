//! Shader translation and pipeline caching for the glaze Vulkan renderer.
//!
//! Takes shader programs written against the implicit, OpenGL-style binding
//! model (no descriptor sets, loose uniforms, name-matched stage interfaces)
//! and turns them into fully-bound Vulkan shader modules with a matching
//! descriptor-set/pipeline layout, then caches the resulting native pipeline
//! objects per render pass:
//! - Source normalization (defines, built-in renames, upstream shader fixups)
//! - Vertex/fragment interface linking with dense location assignment
//! - Loose-uniform classification into push constants and synthesized UBOs
//! - Runtime GLSL -> SPIR-V compilation via shaderc, targeting Vulkan 1.3
//! - SPIR-V reflection and in-place decoration patching
//! - Descriptor binding allocation validated against the pipeline contract
//! - Async pipeline-base builds with a lazy per-render-pass pipeline cache

pub mod glsl;
pub mod normalize;
pub mod link;
pub mod classify;
pub mod compile;
pub mod spirv;
pub mod layout;
pub mod device;
pub mod pipeline;
pub mod cache;

pub use cache::{CacheOptions, CachedPipeline, PipelineCache};
pub use device::{AshDevice, ShaderDevice};
pub use pipeline::{
    BindingModel, BlendMode, GraphicsState, PipelineBase, PipelineDescriptor, RenderPassTarget,
    UniformKind, UniformSpec, VertexElement, VertexFormat,
};

/// Shader stages supported by the translation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    /// Vulkan stage flag for this stage.
    pub fn vk_flags(self) -> ash::vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => ash::vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => ash::vk::ShaderStageFlags::FRAGMENT,
        }
    }

    /// shaderc shader kind for this stage.
    pub fn shaderc_kind(self) -> shaderc::ShaderKind {
        match self {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
        }
    }

    /// Short tag used in diagnostics.
    pub fn tag(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Errors that can occur while translating shaders or building pipelines.
///
/// Every variant aborts the pipeline build that raised it; nothing is caught
/// and retried internally. Variants carry enough context (pipeline name,
/// stage, offending variable or resource) to locate the authoring error.
#[derive(Debug, Clone)]
pub enum ShaderError {
    /// The external shader compiler rejected the source.
    Compile(String),
    /// Type or arity disagreement between linked stage variables, or between
    /// same-named uniforms declared in both stages.
    InterfaceMismatch(String),
    /// A shader resource is absent from the pipeline's declared contract.
    UndeclaredResource(String),
    /// A source construct the translator does not support.
    Unsupported(String),
    /// A decoration word no longer matches its previously-reflected value.
    InternalConsistency(String),
    /// A Vulkan device call failed.
    Vulkan(String),
}

impl std::fmt::Display for ShaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderError::Compile(msg) => write!(f, "Shader compilation error: {}", msg),
            ShaderError::InterfaceMismatch(msg) => write!(f, "Interface mismatch: {}", msg),
            ShaderError::UndeclaredResource(msg) => write!(f, "Undeclared resource: {}", msg),
            ShaderError::Unsupported(msg) => write!(f, "Unsupported shader feature: {}", msg),
            ShaderError::InternalConsistency(msg) => write!(f, "Internal consistency error: {}", msg),
            ShaderError::Vulkan(msg) => write!(f, "Vulkan error: {}", msg),
        }
    }
}

impl std::error::Error for ShaderError {}
