//! Loose-uniform classification.
//!
//! Partitions non-block uniforms from both stages into the push-constant
//! group, zero or more dedicated UBO groups, and a single catch-all UBO,
//! then replaces the loose declarations with synthesized block declarations.
//! Samplers (including texel buffers) are split out untouched; the layout
//! builder assigns their bindings directly.

use std::collections::HashMap;

use crate::glsl::{is_sampler_type, is_texel_buffer_type, DeclQualifier, TranslationUnit};
use crate::ShaderError;

/// Block name of the synthesized catch-all UBO.
pub const CATCH_ALL_BLOCK: &str = "GeneratedUniforms";
/// Block name of the synthesized push-constant block.
pub const PUSH_CONSTANT_BLOCK: &str = "PushConstants";

/// A sampler declaration left in place for the layout builder.
#[derive(Debug, Clone)]
pub struct SamplerDeclaration {
    pub name: String,
    pub type_name: String,
    pub texel_buffer: bool,
    /// Explicit `layout(binding = ...)`, rejected later on the legacy path.
    pub explicit_binding: Option<u32>,
    /// Explicit `layout(location = ...)`, rejected later on the legacy path.
    pub explicit_location: Option<u32>,
}

/// An ordered name -> type mapping destined for one synthesized block.
#[derive(Debug, Clone)]
pub struct UniformGroup {
    pub block_name: String,
    pub push_constant: bool,
    /// Member (name, GLSL type) pairs in block order.
    pub members: Vec<(String, String)>,
}

impl UniformGroup {
    /// Render the synthesized block declaration.
    fn block_text(&self) -> String {
        let mut out = String::new();
        if self.push_constant {
            out.push_str("layout(push_constant) uniform ");
        } else {
            out.push_str("layout(std140) uniform ");
        }
        out.push_str(&self.block_name);
        out.push_str(" {\n");
        for (name, type_name) in &self.members {
            out.push_str(&format!("    {} {};\n", type_name, name));
        }
        // No instance name: members stay at global scope, so existing
        // references in the function bodies keep compiling.
        out.push_str("};");
        out
    }
}

/// Classifier output.
#[derive(Debug, Default)]
pub struct ClassifiedResources {
    /// Non-empty groups, push constants first.
    pub groups: Vec<UniformGroup>,
    pub samplers: Vec<SamplerDeclaration>,
}

impl ClassifiedResources {
    /// Names of every synthesized (implicitly-declared) block.
    pub fn block_names(&self) -> Vec<String> {
        self.groups.iter().filter(|g| !g.push_constant).map(|g| g.block_name.clone()).collect()
    }
}

struct LooseUniform {
    type_name: String,
    declared_in: [bool; 2],
}

/// Classify loose uniforms from both stages and rewrite the units in place.
///
/// `push_members` is the pipeline's push-constant member-name list;
/// `dedicated` is its list of named dedicated-UBO groups.
pub fn classify_uniforms(
    vertex: &mut TranslationUnit,
    fragment: &mut TranslationUnit,
    push_members: &[String],
    dedicated: &[(String, Vec<String>)],
) -> Result<ClassifiedResources, ShaderError> {
    let mut uniforms: HashMap<String, LooseUniform> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut samplers: Vec<SamplerDeclaration> = Vec::new();

    for (stage_index, unit) in [&*vertex, &*fragment].into_iter().enumerate() {
        for decl in unit.declarations() {
            if decl.qualifier != DeclQualifier::Uniform {
                continue;
            }
            if is_sampler_type(&decl.type_name) {
                if let Some(existing) = samplers.iter_mut().find(|s| s.name == decl.name) {
                    if existing.type_name != decl.type_name {
                        return Err(ShaderError::InterfaceMismatch(format!(
                            "sampler '{}' is {} in one stage and {} in the other",
                            decl.name, existing.type_name, decl.type_name
                        )));
                    }
                    existing.explicit_binding = existing.explicit_binding.or(decl.layout.binding);
                    existing.explicit_location = existing.explicit_location.or(decl.layout.location);
                } else {
                    samplers.push(SamplerDeclaration {
                        name: decl.name.clone(),
                        type_name: decl.type_name.clone(),
                        texel_buffer: is_texel_buffer_type(&decl.type_name),
                        explicit_binding: decl.layout.binding,
                        explicit_location: decl.layout.location,
                    });
                }
                continue;
            }
            if decl.initializer.is_some() {
                return Err(ShaderError::Unsupported(format!(
                    "uniform '{}' has an initializer",
                    decl.name
                )));
            }
            let type_name = match &decl.array {
                Some(array) => format!("{}{}", decl.type_name, array),
                None => decl.type_name.clone(),
            };
            match uniforms.get_mut(&decl.name) {
                Some(existing) => {
                    if existing.type_name != type_name {
                        return Err(ShaderError::InterfaceMismatch(format!(
                            "uniform '{}' is {} in one stage and {} in the other",
                            decl.name, existing.type_name, type_name
                        )));
                    }
                    existing.declared_in[stage_index] = true;
                }
                None => {
                    let mut declared_in = [false; 2];
                    declared_in[stage_index] = true;
                    uniforms.insert(decl.name.clone(), LooseUniform { type_name, declared_in });
                    order.push(decl.name.clone());
                }
            }
        }
    }

    // Push constants claim names first, then dedicated groups; everything
    // left falls into the catch-all.
    let mut remaining: Vec<String> = order.clone();
    let mut groups: Vec<UniformGroup> = Vec::new();
    let mut group_stages: Vec<[bool; 2]> = Vec::new();

    let take_members = |remaining: &mut Vec<String>, wanted: &[String]| -> Vec<String> {
        let mut taken = Vec::new();
        for name in wanted {
            if let Some(pos) = remaining.iter().position(|n| n == name) {
                remaining.remove(pos);
                taken.push(name.clone());
            }
        }
        taken
    };

    let push_taken = take_members(&mut remaining, push_members);
    if !push_taken.is_empty() {
        let (members, stages) = collect_group(&push_taken, &uniforms);
        groups.push(UniformGroup {
            block_name: PUSH_CONSTANT_BLOCK.to_string(),
            push_constant: true,
            members,
        });
        group_stages.push(stages);
    }

    for (block_name, wanted) in dedicated {
        let taken = take_members(&mut remaining, wanted);
        if taken.is_empty() {
            continue;
        }
        let (members, stages) = collect_group(&taken, &uniforms);
        groups.push(UniformGroup {
            block_name: block_name.clone(),
            push_constant: false,
            members,
        });
        group_stages.push(stages);
    }

    if !remaining.is_empty() {
        // Catch-all keeps first-declaration order.
        let (members, stages) = collect_group(&remaining, &uniforms);
        groups.push(UniformGroup {
            block_name: CATCH_ALL_BLOCK.to_string(),
            push_constant: false,
            members,
        });
        group_stages.push(stages);
    }

    for (group, stages) in groups.iter().zip(group_stages.iter()) {
        for (name, _) in &group.members {
            vertex.remove_declaration(name);
            fragment.remove_declaration(name);
        }
        if stages[0] {
            vertex.inject_declaration(group.block_text());
        }
        if stages[1] {
            fragment.inject_declaration(group.block_text());
        }
    }

    Ok(ClassifiedResources { groups, samplers })
}

fn collect_group(
    names: &[String],
    uniforms: &HashMap<String, LooseUniform>,
) -> (Vec<(String, String)>, [bool; 2]) {
    let mut members = Vec::with_capacity(names.len());
    let mut stages = [false; 2];
    for name in names {
        let uniform = &uniforms[name];
        members.push((name.clone(), uniform.type_name.clone()));
        stages[0] |= uniform.declared_in[0];
        stages[1] |= uniform.declared_in[1];
    }
    (members, stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShaderStage;

    fn units(vertex: &str, fragment: &str) -> (TranslationUnit, TranslationUnit) {
        (
            TranslationUnit::parse(ShaderStage::Vertex, vertex),
            TranslationUnit::parse(ShaderStage::Fragment, fragment),
        )
    }

    // ============================================================
    // group partitioning
    // ============================================================

    #[test]
    fn test_push_constants_never_reach_a_ubo() {
        let (mut v, mut f) = units(
            "uniform mat4 ModelViewMat;\nuniform mat4 ProjMat;\nvoid main() {}\n",
            "uniform vec4 ColorModulator;\nvoid main() {}\n",
        );
        let push = vec!["ModelViewMat".to_string()];
        let classified = classify_uniforms(&mut v, &mut f, &push, &[]).unwrap();

        assert_eq!(classified.groups.len(), 2);
        let push_group = &classified.groups[0];
        assert!(push_group.push_constant);
        assert_eq!(push_group.members, vec![("ModelViewMat".to_string(), "mat4".to_string())]);

        let catch_all = &classified.groups[1];
        assert_eq!(catch_all.block_name, CATCH_ALL_BLOCK);
        assert!(!catch_all.members.iter().any(|(n, _)| n == "ModelViewMat"));
        assert!(catch_all.members.iter().any(|(n, _)| n == "ProjMat"));
        assert!(catch_all.members.iter().any(|(n, _)| n == "ColorModulator"));
    }

    #[test]
    fn test_dedicated_group_claims_members() {
        let (mut v, mut f) = units(
            "uniform vec3 Light0_Direction;\nuniform vec3 Light1_Direction;\nuniform mat4 ProjMat;\nvoid main() {}\n",
            "void main() {}\n",
        );
        let dedicated = vec![(
            "Lighting".to_string(),
            vec!["Light0_Direction".to_string(), "Light1_Direction".to_string()],
        )];
        let classified = classify_uniforms(&mut v, &mut f, &[], &dedicated).unwrap();
        assert_eq!(classified.groups.len(), 2);
        assert_eq!(classified.groups[0].block_name, "Lighting");
        assert_eq!(classified.groups[0].members.len(), 2);
        assert_eq!(classified.groups[1].members.len(), 1);
    }

    #[test]
    fn test_blocks_injected_only_into_referencing_stages() {
        let (mut v, mut f) = units(
            "uniform mat4 ProjMat;\nvoid main() {}\n",
            "uniform sampler2D Sampler0;\nvoid main() {}\n",
        );
        let classified = classify_uniforms(&mut v, &mut f, &[], &[]).unwrap();
        assert_eq!(classified.groups.len(), 1);

        let vs = v.serialize();
        let fs = f.serialize();
        assert!(vs.contains("layout(std140) uniform GeneratedUniforms {"));
        assert!(vs.contains("    mat4 ProjMat;"));
        assert!(!vs.contains("uniform mat4 ProjMat;"));
        assert!(!fs.contains("GeneratedUniforms"));
        assert!(fs.contains("uniform sampler2D Sampler0;"));
    }

    #[test]
    fn test_shared_uniform_injects_identical_block_into_both_stages() {
        let (mut v, mut f) = units(
            "uniform vec4 FogColor;\nuniform mat4 ProjMat;\nvoid main() {}\n",
            "uniform vec4 FogColor;\nvoid main() {}\n",
        );
        let classified = classify_uniforms(&mut v, &mut f, &[], &[]).unwrap();
        assert_eq!(classified.groups.len(), 1);
        let block = "layout(std140) uniform GeneratedUniforms {";
        assert!(v.serialize().contains(block));
        assert!(f.serialize().contains(block));
    }

    // ============================================================
    // samplers
    // ============================================================

    #[test]
    fn test_samplers_split_out_and_left_in_source() {
        let (mut v, mut f) = units(
            "void main() {}\n",
            "uniform sampler2D Sampler0;\nuniform samplerBuffer PartBuffer;\nvoid main() {}\n",
        );
        let classified = classify_uniforms(&mut v, &mut f, &[], &[]).unwrap();
        assert!(classified.groups.is_empty());
        assert_eq!(classified.samplers.len(), 2);
        assert!(!classified.samplers[0].texel_buffer);
        assert!(classified.samplers[1].texel_buffer);
        assert!(f.serialize().contains("uniform sampler2D Sampler0;"));
    }

    #[test]
    fn test_explicit_sampler_binding_recorded() {
        let (mut v, mut f) = units(
            "void main() {}\n",
            "layout(binding = 3) uniform sampler2D Sampler0;\nvoid main() {}\n",
        );
        let classified = classify_uniforms(&mut v, &mut f, &[], &[]).unwrap();
        assert_eq!(classified.samplers[0].explicit_binding, Some(3));
    }

    // ============================================================
    // failures
    // ============================================================

    #[test]
    fn test_cross_stage_type_conflict() {
        let (mut v, mut f) = units(
            "uniform vec4 Tint;\nvoid main() {}\n",
            "uniform float Tint;\nvoid main() {}\n",
        );
        match classify_uniforms(&mut v, &mut f, &[], &[]) {
            Err(ShaderError::InterfaceMismatch(msg)) => assert!(msg.contains("Tint")),
            other => panic!("expected InterfaceMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_uniform_initializer_rejected() {
        let (mut v, mut f) = units(
            "uniform float FogStart = 0.0;\nvoid main() {}\n",
            "void main() {}\n",
        );
        match classify_uniforms(&mut v, &mut f, &[], &[]) {
            Err(ShaderError::Unsupported(msg)) => assert!(msg.contains("FogStart")),
            other => panic!("expected Unsupported, got {:?}", other),
        }
    }
}
