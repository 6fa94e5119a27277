//! Device seam.
//!
//! `ShaderDevice` is the narrow interface the pipeline layer needs from the
//! externally-owned Vulkan device: creating and destroying shader modules,
//! descriptor-set layouts, pipeline layouts, and graphics pipelines.
//! `AshDevice` implements it against a real `ash::Device`; tests substitute
//! a counting double.

use std::ffi::CString;

use ash::vk;

use crate::layout::{vk_descriptor_type, DescriptorSetLayoutInfo, PushConstantRangeInfo};
use crate::pipeline::{BlendMode, GraphicsState, RenderPassTarget, VertexFormat};
use crate::ShaderError;

/// Everything needed to create one render-pass-specific pipeline.
pub struct VariantRequest<'a> {
    pub pipeline_name: &'a str,
    pub layout: vk::PipelineLayout,
    pub vertex_module: vk::ShaderModule,
    pub fragment_module: vk::ShaderModule,
    pub vertex_format: &'a VertexFormat,
    pub state: &'a GraphicsState,
    pub render_pass: &'a RenderPassTarget,
}

/// Native-object operations the pipeline layer performs on the device.
pub trait ShaderDevice: Send + Sync {
    fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule, ShaderError>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_descriptor_set_layout(
        &self,
        info: &DescriptorSetLayoutInfo,
    ) -> Result<vk::DescriptorSetLayout, ShaderError>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_ranges: &[PushConstantRangeInfo],
    ) -> Result<vk::PipelineLayout, ShaderError>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_graphics_pipeline(
        &self,
        request: &VariantRequest<'_>,
    ) -> Result<vk::Pipeline, ShaderError>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}

// ============================================================================
// Scope-guarded release
// ============================================================================

/// Collects native objects created during a build and destroys them in
/// reverse creation order unless the build completes and disarms the guard.
/// Keeps a failed build from leaking whatever was created before the
/// failing step.
pub struct ReleaseGuard<'a> {
    device: &'a dyn ShaderDevice,
    modules: Vec<vk::ShaderModule>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    pipeline_layouts: Vec<vk::PipelineLayout>,
    armed: bool,
}

impl<'a> ReleaseGuard<'a> {
    pub fn new(device: &'a dyn ShaderDevice) -> Self {
        ReleaseGuard {
            device,
            modules: Vec::new(),
            set_layouts: Vec::new(),
            pipeline_layouts: Vec::new(),
            armed: true,
        }
    }

    pub fn track_module(&mut self, module: vk::ShaderModule) {
        self.modules.push(module);
    }

    pub fn track_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        self.set_layouts.push(layout);
    }

    pub fn track_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        self.pipeline_layouts.push(layout);
    }

    /// The build succeeded; ownership moved into the pipeline base.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for layout in self.pipeline_layouts.drain(..).rev() {
            self.device.destroy_pipeline_layout(layout);
        }
        for layout in self.set_layouts.drain(..).rev() {
            self.device.destroy_descriptor_set_layout(layout);
        }
        for module in self.modules.drain(..).rev() {
            self.device.destroy_shader_module(module);
        }
    }
}

// ============================================================================
// ash implementation
// ============================================================================

/// `ShaderDevice` over a real Vulkan device.
pub struct AshDevice {
    device: ash::Device,
}

impl AshDevice {
    /// The caller keeps the device alive for at least as long as every
    /// object created through this wrapper.
    pub fn new(device: ash::Device) -> Self {
        AshDevice { device }
    }
}

impl ShaderDevice for AshDevice {
    fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule, ShaderError> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(spirv);
        // SAFETY: device is valid, create_info carries validated SPIR-V.
        unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| ShaderError::Vulkan(format!("failed to create shader module: {:?}", e)))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: the module is no longer referenced by any pipeline.
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        info: &DescriptorSetLayoutInfo,
    ) -> Result<vk::DescriptorSetLayout, ShaderError> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = info
            .bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(vk_descriptor_type(binding.kind))
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        // SAFETY: device is valid and bindings outlive the call.
        unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }.map_err(|e| {
            ShaderError::Vulkan(format!("failed to create descriptor set layout: {:?}", e))
        })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: the layout is no longer referenced by any pipeline layout.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_ranges: &[PushConstantRangeInfo],
    ) -> Result<vk::PipelineLayout, ShaderError> {
        let ranges: Vec<vk::PushConstantRange> = push_ranges
            .iter()
            .map(|range| {
                vk::PushConstantRange::default()
                    .stage_flags(range.stages)
                    .offset(range.offset)
                    .size(range.size)
            })
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(&ranges);

        // SAFETY: device is valid, set layouts are live handles.
        unsafe { self.device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| ShaderError::Vulkan(format!("failed to create pipeline layout: {:?}", e)))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: the layout is no longer referenced by any pipeline.
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(
        &self,
        request: &VariantRequest<'_>,
    ) -> Result<vk::Pipeline, ShaderError> {
        let entry_name = CString::new("main").unwrap();

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(request.vertex_module)
                .name(&entry_name),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(request.fragment_module)
                .name(&entry_name),
        ];

        let binding_desc = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(request.vertex_format.stride)
            .input_rate(vk::VertexInputRate::VERTEX)];

        let attr_descs: Vec<vk::VertexInputAttributeDescription> = request
            .vertex_format
            .elements
            .iter()
            .enumerate()
            .map(|(location, element)| {
                vk::VertexInputAttributeDescription::default()
                    .binding(0)
                    .location(element.location.unwrap_or(location as u32))
                    .format(element.format)
                    .offset(element.offset)
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_desc)
            .vertex_attribute_descriptions(&attr_descs);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(request.state.topology)
            .primitive_restart_enable(false);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(request.state.polygon_mode)
            .line_width(1.0)
            .cull_mode(request.state.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(request.render_pass.samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(request.state.depth_test)
            .depth_write_enable(request.state.depth_write)
            .depth_compare_op(request.state.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = blend_attachment(request.state.blend);
        let color_blend_attachments =
            vec![color_blend_attachment; request.render_pass.color_formats.len().max(1)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(request.layout)
            .render_pass(request.render_pass.raw)
            .subpass(0);

        // SAFETY: device is valid; all referenced handles are live.
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|e| {
            ShaderError::Vulkan(format!(
                "failed to create pipeline '{}': {:?}",
                request.pipeline_name, e.1
            ))
        })?;

        Ok(pipelines[0])
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: the pipeline is not referenced by any in-flight command buffer.
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }
}

/// Blend state presets baked into the pipeline.
fn blend_attachment(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    match mode {
        BlendMode::None => vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false),
        BlendMode::Alpha => vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::PremultipliedAlpha => vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::Additive => vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Counting device double used by pipeline and cache tests.

    use std::sync::atomic::{AtomicU64, Ordering};

    use ash::vk::{self, Handle};

    use super::{ShaderDevice, VariantRequest};
    use crate::layout::{DescriptorSetLayoutInfo, PushConstantRangeInfo};
    use crate::ShaderError;

    #[derive(Default)]
    pub struct NullDevice {
        next_handle: AtomicU64,
        pub modules_created: AtomicU64,
        pub modules_destroyed: AtomicU64,
        pub set_layouts_created: AtomicU64,
        pub set_layouts_destroyed: AtomicU64,
        pub pipeline_layouts_created: AtomicU64,
        pub pipeline_layouts_destroyed: AtomicU64,
        pub pipelines_created: AtomicU64,
        pub pipelines_destroyed: AtomicU64,
        /// When set, pipeline-layout creation fails (exercises the guard).
        pub fail_pipeline_layout: bool,
    }

    impl NullDevice {
        fn mint(&self) -> u64 {
            self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    impl ShaderDevice for NullDevice {
        fn create_shader_module(&self, _spirv: &[u32]) -> Result<vk::ShaderModule, ShaderError> {
            self.modules_created.fetch_add(1, Ordering::Relaxed);
            Ok(vk::ShaderModule::from_raw(self.mint()))
        }

        fn destroy_shader_module(&self, _module: vk::ShaderModule) {
            self.modules_destroyed.fetch_add(1, Ordering::Relaxed);
        }

        fn create_descriptor_set_layout(
            &self,
            _info: &DescriptorSetLayoutInfo,
        ) -> Result<vk::DescriptorSetLayout, ShaderError> {
            self.set_layouts_created.fetch_add(1, Ordering::Relaxed);
            Ok(vk::DescriptorSetLayout::from_raw(self.mint()))
        }

        fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
            self.set_layouts_destroyed.fetch_add(1, Ordering::Relaxed);
        }

        fn create_pipeline_layout(
            &self,
            _set_layouts: &[vk::DescriptorSetLayout],
            _push_ranges: &[PushConstantRangeInfo],
        ) -> Result<vk::PipelineLayout, ShaderError> {
            if self.fail_pipeline_layout {
                return Err(ShaderError::Vulkan("pipeline layout creation failed".to_string()));
            }
            self.pipeline_layouts_created.fetch_add(1, Ordering::Relaxed);
            Ok(vk::PipelineLayout::from_raw(self.mint()))
        }

        fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
            self.pipeline_layouts_destroyed.fetch_add(1, Ordering::Relaxed);
        }

        fn create_graphics_pipeline(
            &self,
            _request: &VariantRequest<'_>,
        ) -> Result<vk::Pipeline, ShaderError> {
            self.pipelines_created.fetch_add(1, Ordering::Relaxed);
            Ok(vk::Pipeline::from_raw(self.mint()))
        }

        fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
            self.pipelines_destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::NullDevice;
    use super::*;
    use std::sync::atomic::Ordering;

    // ============================================================
    // ReleaseGuard
    // ============================================================

    #[test]
    fn test_guard_releases_on_drop() {
        let device = NullDevice::default();
        {
            let mut guard = ReleaseGuard::new(&device);
            let module = device.create_shader_module(&[]).unwrap();
            guard.track_module(module);
            let layout = device
                .create_descriptor_set_layout(&DescriptorSetLayoutInfo {
                    set: 0,
                    bindings: Vec::new(),
                })
                .unwrap();
            guard.track_set_layout(layout);
        }
        assert_eq!(device.modules_destroyed.load(Ordering::Relaxed), 1);
        assert_eq!(device.set_layouts_destroyed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_disarmed_guard_releases_nothing() {
        let device = NullDevice::default();
        let mut guard = ReleaseGuard::new(&device);
        let module = device.create_shader_module(&[]).unwrap();
        guard.track_module(module);
        guard.disarm();
        assert_eq!(device.modules_destroyed.load(Ordering::Relaxed), 0);
    }
}
