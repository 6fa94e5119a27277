//! Descriptor-set and pipeline-layout building.
//!
//! De-duplicates reflected resources by name across the two stages, assigns
//! binding indices (legacy path) or groups them by their authored sets
//! (native path), patches the stage binaries to match, validates every
//! resource against the pipeline's declared contract, and derives the
//! push-constant ranges.

use std::collections::BTreeMap;

use ash::vk;
use log::debug;

use crate::classify::SamplerDeclaration;
use crate::spirv::reflect::{BlockMember, ResourceKind, StageReflection};
use crate::spirv::{DecorationRef, SpirvModule};
use crate::{ShaderError, ShaderStage};

/// One allocated descriptor binding.
#[derive(Debug, Clone)]
pub struct DescriptorBindingInfo {
    pub name: String,
    pub binding: u32,
    pub kind: ResourceKind,
    /// Declared struct size for buffer-like resources.
    pub byte_size: Option<u32>,
    /// Trailing runtime-array stride, if any.
    pub stride: Option<u32>,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// One descriptor set layout.
#[derive(Debug, Clone)]
pub struct DescriptorSetLayoutInfo {
    pub set: u32,
    pub bindings: Vec<DescriptorBindingInfo>,
}

/// One push-constant range; start and end are 4-byte aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRangeInfo {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// The device-independent pipeline layout description.
#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutInfo {
    pub sets: Vec<DescriptorSetLayoutInfo>,
    pub push_ranges: Vec<PushConstantRangeInfo>,
    /// Push-constant member layout exposed to the draw layer.
    pub push_members: Vec<BlockMember>,
}

/// Map a resource kind onto its Vulkan descriptor type.
pub fn vk_descriptor_type(kind: ResourceKind) -> vk::DescriptorType {
    match kind {
        ResourceKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        ResourceKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        ResourceKind::TexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        ResourceKind::SeparateImage => vk::DescriptorType::SAMPLED_IMAGE,
        ResourceKind::CombinedSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

/// The pipeline's declared resource contract, checked on the legacy path.
#[derive(Debug, Clone, Default)]
pub struct ResourceContract {
    pub pipeline_name: String,
    /// Names of declared UBO-member uniforms.
    pub uniform_members: Vec<String>,
    /// Names of declared texel buffers.
    pub texel_buffers: Vec<String>,
    /// Names of declared storage buffers.
    pub storage_buffers: Vec<String>,
    /// Names of declared samplers.
    pub samplers: Vec<String>,
    /// Synthesized block names that are implicitly bound and validated
    /// member-by-member instead of by block name.
    pub implicit_blocks: Vec<String>,
}

struct MergedResource {
    name: String,
    kind: ResourceKind,
    byte_size: Option<u32>,
    stride: Option<u32>,
    count: u32,
    stages: vk::ShaderStageFlags,
    members: Vec<BlockMember>,
    set: u32,
    binding: u32,
    /// Per-stage (stage index, set ref, binding ref) decoration locations.
    refs: Vec<(usize, DecorationRef, DecorationRef)>,
    first_seen: usize,
}

fn merge_resources(
    stages: [&StageReflection; 2],
) -> Result<Vec<MergedResource>, ShaderError> {
    let mut merged: Vec<MergedResource> = Vec::new();
    for (stage_index, reflection) in stages.into_iter().enumerate() {
        let stage_flags = if stage_index == 0 {
            vk::ShaderStageFlags::VERTEX
        } else {
            vk::ShaderStageFlags::FRAGMENT
        };
        for resource in &reflection.resources {
            match merged.iter_mut().find(|m| m.name == resource.name) {
                Some(existing) => {
                    // A resource referenced by both stages is one binding.
                    if existing.kind != resource.kind {
                        return Err(ShaderError::InterfaceMismatch(format!(
                            "resource '{}' is a {} in one stage and a {} in the other",
                            resource.name,
                            existing.kind.label(),
                            resource.kind.label()
                        )));
                    }
                    existing.stages |= stage_flags;
                    existing.byte_size = existing.byte_size.max(resource.byte_size);
                    existing.refs.push((stage_index, resource.set_ref, resource.binding_ref));
                }
                None => {
                    let first_seen = merged.len();
                    merged.push(MergedResource {
                        name: resource.name.clone(),
                        kind: resource.kind,
                        byte_size: resource.byte_size,
                        stride: resource.stride,
                        count: resource.count,
                        stages: stage_flags,
                        members: resource.members.clone(),
                        set: resource.set,
                        binding: resource.binding,
                        refs: vec![(stage_index, resource.set_ref, resource.binding_ref)],
                        first_seen,
                    });
                }
            }
        }
    }
    Ok(merged)
}

fn validate_contract(
    resource: &MergedResource,
    contract: &ResourceContract,
) -> Result<(), ShaderError> {
    let declared = |list: &[String]| list.iter().any(|n| n == &resource.name);
    match resource.kind {
        ResourceKind::UniformBuffer => {
            if contract.implicit_blocks.iter().any(|n| n == &resource.name) {
                for member in &resource.members {
                    if !contract.uniform_members.iter().any(|n| n == &member.name) {
                        return Err(ShaderError::UndeclaredResource(format!(
                            "uniform '{}' is not declared by pipeline '{}'",
                            member.name, contract.pipeline_name
                        )));
                    }
                }
                Ok(())
            } else {
                Err(ShaderError::UndeclaredResource(format!(
                    "uniform block '{}' is not declared by pipeline '{}'",
                    resource.name, contract.pipeline_name
                )))
            }
        }
        ResourceKind::StorageBuffer => {
            if declared(&contract.storage_buffers) {
                Ok(())
            } else {
                Err(ShaderError::UndeclaredResource(format!(
                    "storage buffer '{}' is not declared by pipeline '{}'",
                    resource.name, contract.pipeline_name
                )))
            }
        }
        ResourceKind::TexelBuffer => {
            if declared(&contract.texel_buffers) {
                Ok(())
            } else {
                Err(ShaderError::UndeclaredResource(format!(
                    "texel buffer '{}' is not declared by pipeline '{}'",
                    resource.name, contract.pipeline_name
                )))
            }
        }
        ResourceKind::SeparateImage | ResourceKind::CombinedSampler => {
            if declared(&contract.samplers) {
                Ok(())
            } else {
                Err(ShaderError::UndeclaredResource(format!(
                    "sampler '{}' is not declared by pipeline '{}'",
                    resource.name, contract.pipeline_name
                )))
            }
        }
    }
}

fn binding_info(resource: &MergedResource, binding: u32) -> DescriptorBindingInfo {
    DescriptorBindingInfo {
        name: resource.name.clone(),
        binding,
        kind: resource.kind,
        byte_size: resource.byte_size,
        stride: resource.stride,
        count: resource.count,
        stages: resource.stages,
    }
}

fn push_range(stage: ShaderStage, members: &[BlockMember]) -> Option<PushConstantRangeInfo> {
    let start = members.iter().map(|m| m.offset).min()?;
    let end = members.iter().map(|m| m.offset + m.size).max()?;
    let start = start & !3;
    let end = (end + 3) & !3;
    Some(PushConstantRangeInfo { stages: stage.vk_flags(), offset: start, size: end - start })
}

fn push_constant_parts(
    vertex: &StageReflection,
    fragment: &StageReflection,
) -> (Vec<PushConstantRangeInfo>, Vec<BlockMember>) {
    let mut ranges = Vec::new();
    let mut members: Vec<BlockMember> = Vec::new();
    for (stage, reflection) in
        [(ShaderStage::Vertex, vertex), (ShaderStage::Fragment, fragment)]
    {
        if let Some(block) = &reflection.push_constants {
            if let Some(range) = push_range(stage, &block.members) {
                ranges.push(range);
            }
            for member in &block.members {
                if !members.iter().any(|m| m.name == member.name) {
                    members.push(member.clone());
                }
            }
        }
    }
    (ranges, members)
}

/// Build the layout for normalized legacy-source shaders.
///
/// All resources land in descriptor set 0 with binding indices assigned by
/// kind tier and first-seen order; the stage binaries are patched in place
/// to carry the assigned indices.
pub fn build_legacy_layout(
    vertex: (&mut SpirvModule, &StageReflection),
    fragment: (&mut SpirvModule, &StageReflection),
    samplers: &[SamplerDeclaration],
    contract: &ResourceContract,
) -> Result<PipelineLayoutInfo, ShaderError> {
    let (vertex_module, vertex_refl) = vertex;
    let (fragment_module, fragment_refl) = fragment;

    // Samplers must be bindingless in legacy source so the builder can
    // assign them.
    for sampler in samplers {
        if sampler.explicit_binding.is_some() || sampler.explicit_location.is_some() {
            return Err(ShaderError::Unsupported(format!(
                "sampler '{}' declares an explicit binding or location",
                sampler.name
            )));
        }
    }

    let mut merged = merge_resources([vertex_refl, fragment_refl])?;
    merged.sort_by_key(|r| (r.kind.binding_tier(), r.first_seen));

    let mut bindings = Vec::with_capacity(merged.len());
    for (index, resource) in merged.iter().enumerate() {
        let index = index as u32;
        validate_contract(resource, contract)?;
        for (stage_index, set_ref, binding_ref) in &resource.refs {
            let module: &mut SpirvModule =
                if *stage_index == 0 { &mut *vertex_module } else { &mut *fragment_module };
            module.patch(set_ref, 0)?;
            module.patch(binding_ref, index)?;
        }
        debug!(
            "pipeline '{}': {} '{}' -> binding {}",
            contract.pipeline_name,
            resource.kind.label(),
            resource.name,
            index
        );
        bindings.push(binding_info(resource, index));
    }

    let (push_ranges, push_members) = push_constant_parts(vertex_refl, fragment_refl);

    Ok(PipelineLayoutInfo {
        sets: vec![DescriptorSetLayoutInfo { set: 0, bindings }],
        push_ranges,
        push_members,
    })
}

/// Build the layout for natively-authored shaders.
///
/// Bindings are taken as authored and grouped by their declared set; the
/// decoration words are re-verified against the reflected values but never
/// patched.
pub fn build_native_layout(
    vertex: (&SpirvModule, &StageReflection),
    fragment: (&SpirvModule, &StageReflection),
) -> Result<PipelineLayoutInfo, ShaderError> {
    let (vertex_module, vertex_refl) = vertex;
    let (fragment_module, fragment_refl) = fragment;

    let merged = merge_resources([vertex_refl, fragment_refl])?;

    let mut sets: BTreeMap<u32, Vec<DescriptorBindingInfo>> = BTreeMap::new();
    for resource in &merged {
        for (stage_index, set_ref, binding_ref) in &resource.refs {
            let module: &SpirvModule =
                if *stage_index == 0 { vertex_module } else { fragment_module };
            module.verify(set_ref)?;
            module.verify(binding_ref)?;
            if set_ref.expected != resource.set || binding_ref.expected != resource.binding {
                return Err(ShaderError::InterfaceMismatch(format!(
                    "resource '{}' is bound at (set {}, binding {}) in one stage and (set {}, binding {}) in the other",
                    resource.name, resource.set, resource.binding, set_ref.expected, binding_ref.expected
                )));
            }
        }
        let entries = sets.entry(resource.set).or_default();
        if entries.iter().any(|b| b.binding == resource.binding) {
            return Err(ShaderError::InterfaceMismatch(format!(
                "set {} binding {} is declared by more than one resource",
                resource.set, resource.binding
            )));
        }
        entries.push(binding_info(resource, resource.binding));
    }

    let sets = sets
        .into_iter()
        .map(|(set, mut bindings)| {
            bindings.sort_by_key(|b| b.binding);
            DescriptorSetLayoutInfo { set, bindings }
        })
        .collect();

    let (push_ranges, push_members) = push_constant_parts(vertex_refl, fragment_refl);

    Ok(PipelineLayoutInfo { sets, push_ranges, push_members })
}
