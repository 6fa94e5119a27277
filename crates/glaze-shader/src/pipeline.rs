//! Pipeline descriptors and pipeline-base construction.
//!
//! `PipelineDescriptor` is the contract a pipeline author supplies: shader
//! sources, the declared resource lists, the vertex format and the
//! fixed-function state. `build_pipeline_base` runs the whole translation
//! chain (normalize, link, classify, compile, reflect, layout) and creates
//! the render-pass-independent native objects.

use std::collections::HashMap;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::classify::{classify_uniforms, ClassifiedResources, CATCH_ALL_BLOCK};
use crate::compile::{CompileProfile, ShaderCompiler};
use crate::device::{ReleaseGuard, ShaderDevice, VariantRequest};
use crate::glsl::TranslationUnit;
use crate::layout::{
    build_legacy_layout, build_native_layout, PipelineLayoutInfo, ResourceContract,
};
use crate::link::{link_stage_interfaces, LinkedInterface};
use crate::normalize::{normalize_source, NormalizeOptions};
use crate::spirv::reflect::{reflect, BlockMember, StageReflection};
use crate::spirv::SpirvModule;
use crate::{ShaderError, ShaderStage};

/// Which binding model the shader sources were authored against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingModel {
    /// OpenGL-style source: loose uniforms, no sets/bindings. The full
    /// translation chain runs and bindings are assigned here.
    Legacy,
    /// Vulkan GLSL with explicit set/binding decorations, taken as authored.
    Native,
}

/// Kind of a declared uniform resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniformKind {
    /// Plain uniform that ends up as a member of a synthesized UBO (or the
    /// push-constant block).
    UboMember,
    /// Texel buffer, with its buffer-view format when known.
    TexelBuffer { format: Option<vk::Format> },
    /// Storage buffer.
    StorageBuffer,
}

/// One declared uniform resource.
#[derive(Debug, Clone)]
pub struct UniformSpec {
    pub name: String,
    pub kind: UniformKind,
}

impl UniformSpec {
    pub fn ubo_member(name: &str) -> UniformSpec {
        UniformSpec { name: name.to_string(), kind: UniformKind::UboMember }
    }
}

/// One named vertex attribute.
#[derive(Debug, Clone)]
pub struct VertexElement {
    pub name: String,
    pub format: vk::Format,
    pub offset: u32,
    /// Shader location; resolved from reflection when `None`.
    pub location: Option<u32>,
}

impl VertexElement {
    /// Byte size of the element's format. Covers the attribute formats the
    /// renderer feeds; anything exotic reports 0.
    pub fn byte_size(&self) -> u32 {
        match self.format {
            vk::Format::R32_SFLOAT | vk::Format::R32_SINT | vk::Format::R32_UINT => 4,
            vk::Format::R32G32_SFLOAT => 8,
            vk::Format::R32G32B32_SFLOAT => 12,
            vk::Format::R32G32B32A32_SFLOAT => 16,
            vk::Format::R8G8B8A8_UNORM
            | vk::Format::R8G8B8A8_UINT
            | vk::Format::B8G8R8A8_UNORM => 4,
            vk::Format::R16G16_SFLOAT | vk::Format::R16G16_SINT => 4,
            vk::Format::R16G16B16A16_SFLOAT => 8,
            vk::Format::R16G16B16A16_SINT | vk::Format::R16G16B16A16_UINT => 8,
            _ => 0,
        }
    }
}

/// The vertex buffer layout of a pipeline.
#[derive(Debug, Clone, Default)]
pub struct VertexFormat {
    pub elements: Vec<VertexElement>,
    pub stride: u32,
}

impl VertexFormat {
    /// Stride implied by packing the elements back to back. Useful when the
    /// caller supplies elements without an explicit stride.
    pub fn packed_stride(&self) -> u32 {
        self.elements.iter().map(|e| e.offset + e.byte_size()).max().unwrap_or(0)
    }
}

/// Blend presets baked into the pipeline.
///
/// In GL these were dynamic state changes; under Vulkan they are part of
/// the pipeline object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    None,
    Alpha,
    PremultipliedAlpha,
    Additive,
}

/// Fixed-function state baked into every variant of a pipeline.
#[derive(Debug, Clone)]
pub struct GraphicsState {
    pub blend: BlendMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub cull_mode: vk::CullModeFlags,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
}

impl Default for GraphicsState {
    fn default() -> Self {
        GraphicsState {
            blend: BlendMode::None,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            cull_mode: vk::CullModeFlags::BACK,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
        }
    }
}

/// A render pass plus the attachment description a variant is built against.
/// Used both as a cache key and as pipeline-creation input.
#[derive(Debug, Clone)]
pub struct RenderPassTarget {
    pub raw: vk::RenderPass,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
}

impl RenderPassTarget {
    /// Identity used by the per-base variant cache.
    pub fn key(&self) -> u64 {
        self.raw.as_raw()
    }
}

/// Everything a pipeline author supplies.
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    /// Logical name, used for caching diagnostics and the patch table.
    pub name: String,
    pub vertex_source: String,
    pub fragment_source: String,
    pub binding_model: BindingModel,
    pub defines: Vec<(String, String)>,
    /// Declared uniform resources (UBO members, texel buffers, storage).
    pub uniforms: Vec<UniformSpec>,
    /// Declared sampler names.
    pub samplers: Vec<String>,
    /// Uniform names routed into the push-constant block.
    pub push_constants: Vec<String>,
    /// Named dedicated-UBO member groups.
    pub dedicated_ubos: Vec<(String, Vec<String>)>,
    pub vertex_format: VertexFormat,
    pub state: GraphicsState,
}

impl PipelineDescriptor {
    pub fn new(name: &str, vertex_source: &str, fragment_source: &str) -> PipelineDescriptor {
        PipelineDescriptor {
            name: name.to_string(),
            vertex_source: vertex_source.to_string(),
            fragment_source: fragment_source.to_string(),
            binding_model: BindingModel::Legacy,
            defines: Vec::new(),
            uniforms: Vec::new(),
            samplers: Vec::new(),
            push_constants: Vec::new(),
            dedicated_ubos: Vec::new(),
            vertex_format: VertexFormat::default(),
            state: GraphicsState::default(),
        }
    }

    /// Cache identity: the exact source pairing.
    pub fn cache_key(&self) -> (String, String) {
        (self.vertex_source.clone(), self.fragment_source.clone())
    }

    fn resource_contract(&self, classified: &ClassifiedResources) -> ResourceContract {
        let mut implicit_blocks = classified.block_names();
        if !implicit_blocks.iter().any(|n| n == CATCH_ALL_BLOCK) {
            implicit_blocks.push(CATCH_ALL_BLOCK.to_string());
        }
        for (name, _) in &self.dedicated_ubos {
            if !implicit_blocks.contains(name) {
                implicit_blocks.push(name.clone());
            }
        }
        ResourceContract {
            pipeline_name: self.name.clone(),
            uniform_members: self
                .uniforms
                .iter()
                .filter(|u| u.kind == UniformKind::UboMember)
                .map(|u| u.name.clone())
                .collect(),
            texel_buffers: self
                .uniforms
                .iter()
                .filter(|u| matches!(u.kind, UniformKind::TexelBuffer { .. }))
                .map(|u| u.name.clone())
                .collect(),
            storage_buffers: self
                .uniforms
                .iter()
                .filter(|u| u.kind == UniformKind::StorageBuffer)
                .map(|u| u.name.clone())
                .collect(),
            samplers: self.samplers.clone(),
            implicit_blocks,
        }
    }
}

// ============================================================================
// Pipeline base
// ============================================================================

/// The render-pass-independent part of a pipeline: shader modules, layouts,
/// and the lazily-filled per-render-pass variant cache. Immutable after
/// construction apart from the variant map.
pub struct PipelineBase {
    name: String,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    pipeline_layout: vk::PipelineLayout,
    layout_info: PipelineLayoutInfo,
    /// Vertex attribute name -> shader location.
    attributes: HashMap<String, u32>,
    /// Render-pass identity -> native pipeline.
    variants: Mutex<HashMap<u64, vk::Pipeline>>,
}

impl PipelineBase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn descriptor_set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.set_layouts
    }

    pub fn layout_info(&self) -> &PipelineLayoutInfo {
        &self.layout_info
    }

    /// Push-constant member layout (empty when no block was generated).
    pub fn push_constant_members(&self) -> &[BlockMember] {
        &self.layout_info.push_members
    }

    /// Shader location of a named vertex attribute.
    pub fn attribute_location(&self, name: &str) -> Option<u32> {
        self.attributes.get(name).copied()
    }

    /// Look up or synchronously build the native pipeline for a render
    /// pass. Runs on the calling thread; the first caller for a given pass
    /// pays the build.
    pub fn pipeline_for(
        &self,
        device: &dyn ShaderDevice,
        vertex_format: &VertexFormat,
        state: &GraphicsState,
        render_pass: &RenderPassTarget,
    ) -> Result<vk::Pipeline, ShaderError> {
        let mut variants = self.variants.lock();
        if let Some(&pipeline) = variants.get(&render_pass.key()) {
            return Ok(pipeline);
        }
        let resolved = self.resolve_vertex_format(vertex_format);
        let pipeline = device.create_graphics_pipeline(&VariantRequest {
            pipeline_name: &self.name,
            layout: self.pipeline_layout,
            vertex_module: self.vertex_module,
            fragment_module: self.fragment_module,
            vertex_format: &resolved,
            state,
            render_pass,
        })?;
        variants.insert(render_pass.key(), pipeline);
        Ok(pipeline)
    }

    /// Fill element locations from the reflected attribute map.
    fn resolve_vertex_format(&self, format: &VertexFormat) -> VertexFormat {
        let mut resolved = format.clone();
        for element in &mut resolved.elements {
            if element.location.is_none() {
                element.location = self.attribute_location(&element.name);
            }
        }
        resolved
    }

    /// Destroy every native object owned by the base: variants first, then
    /// the pipeline layout, the set layouts, and the shader modules.
    pub fn destroy(&self, device: &dyn ShaderDevice) {
        let mut variants = self.variants.lock();
        for (_, pipeline) in variants.drain() {
            device.destroy_pipeline(pipeline);
        }
        device.destroy_pipeline_layout(self.pipeline_layout);
        for &layout in &self.set_layouts {
            device.destroy_descriptor_set_layout(layout);
        }
        device.destroy_shader_module(self.vertex_module);
        device.destroy_shader_module(self.fragment_module);
    }
}

// ============================================================================
// Base construction
// ============================================================================

/// Run the translation chain for one descriptor and create the native
/// objects of its pipeline base.
pub fn build_pipeline_base(
    compiler: &ShaderCompiler,
    device: &dyn ShaderDevice,
    descriptor: &PipelineDescriptor,
    ubo_offset_alignment: u32,
) -> Result<PipelineBase, ShaderError> {
    let (vertex_module, fragment_module, vertex_refl, layout_info) =
        match descriptor.binding_model {
            BindingModel::Legacy => {
                build_legacy_stages(compiler, descriptor, ubo_offset_alignment)?
            }
            BindingModel::Native => build_native_stages(compiler, descriptor)?,
        };

    let attributes: HashMap<String, u32> = vertex_refl
        .inputs
        .iter()
        .map(|input| (input.name.clone(), input.location))
        .collect();

    let mut guard = ReleaseGuard::new(device);

    let vertex_shader = device.create_shader_module(vertex_module.words())?;
    guard.track_module(vertex_shader);
    let fragment_shader = device.create_shader_module(fragment_module.words())?;
    guard.track_module(fragment_shader);

    let mut set_layouts = Vec::with_capacity(layout_info.sets.len());
    for set_info in &layout_info.sets {
        let layout = device.create_descriptor_set_layout(set_info)?;
        guard.track_set_layout(layout);
        set_layouts.push(layout);
    }

    let pipeline_layout = device.create_pipeline_layout(&set_layouts, &layout_info.push_ranges)?;
    guard.track_pipeline_layout(pipeline_layout);

    guard.disarm();

    Ok(PipelineBase {
        name: descriptor.name.clone(),
        vertex_module: vertex_shader,
        fragment_module: fragment_shader,
        set_layouts,
        pipeline_layout,
        layout_info,
        attributes,
        variants: Mutex::new(HashMap::new()),
    })
}

type BuiltStages = (SpirvModule, SpirvModule, StageReflection, PipelineLayoutInfo);

fn build_legacy_stages(
    compiler: &ShaderCompiler,
    descriptor: &PipelineDescriptor,
    ubo_offset_alignment: u32,
) -> Result<BuiltStages, ShaderError> {
    let options = NormalizeOptions { defines: &descriptor.defines, ubo_offset_alignment };
    let vertex_text = normalize_source(
        &descriptor.name,
        ShaderStage::Vertex,
        &descriptor.vertex_source,
        &options,
    );
    let fragment_text = normalize_source(
        &descriptor.name,
        ShaderStage::Fragment,
        &descriptor.fragment_source,
        &options,
    );

    let mut vertex_unit = TranslationUnit::parse(ShaderStage::Vertex, &vertex_text);
    let mut fragment_unit = TranslationUnit::parse(ShaderStage::Fragment, &fragment_text);

    let linked = link_stage_interfaces(&mut vertex_unit, &mut fragment_unit)?;
    let classified = classify_uniforms(
        &mut vertex_unit,
        &mut fragment_unit,
        &descriptor.push_constants,
        &descriptor.dedicated_ubos,
    )?;

    let vertex_glsl = vertex_unit.serialize();
    let fragment_glsl = fragment_unit.serialize();

    let vertex_words =
        compiler.compile(&descriptor.name, ShaderStage::Vertex, &vertex_glsl, CompileProfile::Legacy)?;
    let fragment_words = compiler.compile(
        &descriptor.name,
        ShaderStage::Fragment,
        &fragment_glsl,
        CompileProfile::Legacy,
    )?;

    let mut vertex_module = SpirvModule::parse(vertex_words)?;
    let mut fragment_module = SpirvModule::parse(fragment_words)?;
    let vertex_refl = reflect(&vertex_module)?;
    let fragment_refl = reflect(&fragment_module)?;

    cross_check_interface(&linked, &vertex_refl, &fragment_refl)?;

    let contract = descriptor.resource_contract(&classified);
    let layout_info = build_legacy_layout(
        (&mut vertex_module, &vertex_refl),
        (&mut fragment_module, &fragment_refl),
        &classified.samplers,
        &contract,
    )?;

    Ok((vertex_module, fragment_module, vertex_refl, layout_info))
}

fn build_native_stages(
    compiler: &ShaderCompiler,
    descriptor: &PipelineDescriptor,
) -> Result<BuiltStages, ShaderError> {
    let vertex_words = compiler.compile(
        &descriptor.name,
        ShaderStage::Vertex,
        &descriptor.vertex_source,
        CompileProfile::Native,
    )?;
    let fragment_words = compiler.compile(
        &descriptor.name,
        ShaderStage::Fragment,
        &descriptor.fragment_source,
        CompileProfile::Native,
    )?;

    let vertex_module = SpirvModule::parse(vertex_words)?;
    let fragment_module = SpirvModule::parse(fragment_words)?;
    let vertex_refl = reflect(&vertex_module)?;
    let fragment_refl = reflect(&fragment_module)?;

    let layout_info = build_native_layout(
        (&vertex_module, &vertex_refl),
        (&fragment_module, &fragment_refl),
    )?;

    Ok((vertex_module, fragment_module, vertex_refl, layout_info))
}

/// Verify the reflected binaries carry the locations the linker assigned.
/// Variables the compiler eliminated are skipped.
fn cross_check_interface(
    linked: &LinkedInterface,
    vertex: &StageReflection,
    fragment: &StageReflection,
) -> Result<(), ShaderError> {
    let check = |vars: &[crate::link::InterfaceVariable],
                 reflected: &[crate::spirv::reflect::ReflectedVar]|
     -> Result<(), ShaderError> {
        for var in vars {
            if let Some(found) = reflected.iter().find(|r| r.name == var.name) {
                if found.location != var.location {
                    return Err(ShaderError::InternalConsistency(format!(
                        "interface variable '{}' linked at location {} but compiled at {}",
                        var.name, var.location, found.location
                    )));
                }
            }
        }
        Ok(())
    };
    check(&linked.vertex_outputs, &vertex.outputs)?;
    check(&linked.fragment_inputs, &fragment.inputs)?;
    Ok(())
}
