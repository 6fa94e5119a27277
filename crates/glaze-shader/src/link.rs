//! Stage interface linking.
//!
//! Matches vertex `out` variables to fragment `in` variables, assigns dense
//! interface locations starting at 0 in vertex-output declaration order,
//! and rewrites the declarations on both sides. Fragment inputs with no
//! matching vertex output are dropped; a vertex output that matches nothing
//! still gets a location so the value is produced (and simply unread).

use log::warn;

use crate::glsl::{DeclQualifier, Declaration, GlslType, LayoutQualifiers, TranslationUnit};
use crate::ShaderError;

/// One linked interface variable, as assigned by the linker.
///
/// Consumed later to cross-check the reflected SPIR-V against what the
/// linker produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceVariable {
    pub name: String,
    pub ty: Option<GlslType>,
    pub flat: bool,
    pub location: u32,
}

/// Result of linking the vertex/fragment interface.
#[derive(Debug, Default)]
pub struct LinkedInterface {
    /// Every emitted vertex output, matched or not.
    pub vertex_outputs: Vec<InterfaceVariable>,
    /// Fragment inputs that matched a vertex output.
    pub fragment_inputs: Vec<InterfaceVariable>,
}

/// Tracks assigned interface locations; dense from 0, skipping locations
/// claimed by explicit-location matches.
struct LocationAllocator {
    used: std::collections::HashSet<u32>,
    next: u32,
}

impl LocationAllocator {
    fn new() -> Self {
        LocationAllocator { used: std::collections::HashSet::new(), next: 0 }
    }

    fn claim(&mut self, location: u32) {
        self.used.insert(location);
    }

    fn allocate(&mut self) -> u32 {
        while self.used.contains(&self.next) {
            self.next += 1;
        }
        let location = self.next;
        self.used.insert(location);
        location
    }
}

/// Link the stage interface, mutating both translation units in place.
///
/// No other pass may touch the units while this runs; the caller serializes
/// passes within a single pipeline build.
pub fn link_stage_interfaces(
    vertex: &mut TranslationUnit,
    fragment: &mut TranslationUnit,
) -> Result<LinkedInterface, ShaderError> {
    let vertex_outs: Vec<Declaration> = vertex
        .declarations()
        .filter(|d| d.qualifier == DeclQualifier::Out)
        .cloned()
        .collect();
    let fragment_ins: Vec<Declaration> = fragment
        .declarations()
        .filter(|d| d.qualifier == DeclQualifier::In)
        .cloned()
        .collect();

    for decl in vertex_outs.iter().chain(fragment_ins.iter()) {
        if decl.layout.component.is_some() {
            return Err(ShaderError::Unsupported(format!(
                "interface variable '{}' uses the 'component' qualifier",
                decl.name
            )));
        }
    }

    let mut linked = LinkedInterface::default();
    let mut allocator = LocationAllocator::new();
    // Explicit locations are reserved up front so dense assignment never
    // collides with a later explicit-location match.
    for decl in vertex_outs.iter().chain(fragment_ins.iter()) {
        if let Some(location) = decl.layout.location {
            allocator.claim(location);
        }
    }
    let mut consumed = vec![false; fragment_ins.len()];

    for out_decl in &vertex_outs {
        // Name match first; explicit locations only break ties when the
        // names disagree.
        let by_name = fragment_ins
            .iter()
            .enumerate()
            .find(|(i, d)| !consumed[*i] && d.name == out_decl.name);

        let matched = match by_name {
            Some((index, in_decl)) => {
                check_types(out_decl, in_decl)?;
                Some((index, allocator.allocate()))
            }
            None => match out_decl.layout.location {
                Some(explicit) => {
                    let by_location = fragment_ins.iter().enumerate().find(|(i, d)| {
                        !consumed[*i] && d.layout.location == Some(explicit)
                    });
                    match by_location {
                        Some((index, in_decl)) => {
                            check_types(out_decl, in_decl)?;
                            allocator.claim(explicit);
                            Some((index, explicit))
                        }
                        None => None,
                    }
                }
                None => None,
            },
        };

        match matched {
            Some((index, location)) => {
                let in_decl = &fragment_ins[index];
                consumed[index] = true;
                let flat = out_decl.flat || in_decl.flat;

                vertex.remove_declaration(&out_decl.name);
                fragment.remove_declaration(&in_decl.name);
                vertex.inject_declaration(
                    interface_declaration(out_decl, DeclQualifier::Out, location, flat).serialize(),
                );
                fragment.inject_declaration(
                    interface_declaration(in_decl, DeclQualifier::In, location, flat).serialize(),
                );

                linked.vertex_outputs.push(InterfaceVariable {
                    name: out_decl.name.clone(),
                    ty: GlslType::parse(&out_decl.type_name),
                    flat,
                    location,
                });
                linked.fragment_inputs.push(InterfaceVariable {
                    name: in_decl.name.clone(),
                    ty: GlslType::parse(&in_decl.type_name),
                    flat,
                    location,
                });
            }
            None => {
                // Unmatched output: produced but unread. Keep it so the
                // vertex shader still compiles and writes the value.
                let location = allocator.allocate();
                vertex.remove_declaration(&out_decl.name);
                vertex.inject_declaration(
                    interface_declaration(out_decl, DeclQualifier::Out, location, out_decl.flat)
                        .serialize(),
                );
                linked.vertex_outputs.push(InterfaceVariable {
                    name: out_decl.name.clone(),
                    ty: GlslType::parse(&out_decl.type_name),
                    flat: out_decl.flat,
                    location,
                });
            }
        }
    }

    for (index, in_decl) in fragment_ins.iter().enumerate() {
        if !consumed[index] {
            // A fragment input with no producer is invalid to bind.
            fragment.remove_declaration(&in_decl.name);
            warn!(
                "dropping fragment input '{}' ({}): no matching vertex output",
                in_decl.name, in_decl.type_name
            );
        }
    }

    Ok(linked)
}

fn check_types(out_decl: &Declaration, in_decl: &Declaration) -> Result<(), ShaderError> {
    let same = out_decl.type_name == in_decl.type_name && out_decl.array == in_decl.array;
    if !same {
        return Err(ShaderError::InterfaceMismatch(format!(
            "vertex output '{}' is {} but fragment input is {}",
            out_decl.name, out_decl.type_name, in_decl.type_name
        )));
    }
    Ok(())
}

fn interface_declaration(
    original: &Declaration,
    qualifier: DeclQualifier,
    location: u32,
    flat: bool,
) -> Declaration {
    Declaration {
        qualifier,
        type_name: original.type_name.clone(),
        name: original.name.clone(),
        array: original.array.clone(),
        layout: LayoutQualifiers { location: Some(location), ..Default::default() },
        flat,
        initializer: None,
    }
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
    // name matching and dense locations
    // ============================================================

    #[test]
    fn test_full_match_assigns_dense_locations() {
        let (mut v, mut f) = units(
            "out vec2 texCoord0;\nout vec4 vertexColor;\nvoid main() {}\n",
            "in vec2 texCoord0;\nin vec4 vertexColor;\nvoid main() {}\n",
        );
        let linked = link_stage_interfaces(&mut v, &mut f).unwrap();
        assert_eq!(linked.vertex_outputs.len(), 2);
        assert_eq!(linked.fragment_inputs.len(), 2);
        assert_eq!(linked.vertex_outputs[0].location, 0);
        assert_eq!(linked.vertex_outputs[1].location, 1);

        let vs = v.serialize();
        let fs = f.serialize();
        assert!(vs.contains("layout(location = 0) out vec2 texCoord0;"));
        assert!(fs.contains("layout(location = 1) in vec4 vertexColor;"));
    }

    #[test]
    fn test_flat_propagates_from_either_side() {
        let (mut v, mut f) = units(
            "out int Layer;\nvoid main() {}\n",
            "flat in int Layer;\nvoid main() {}\n",
        );
        link_stage_interfaces(&mut v, &mut f).unwrap();
        assert!(v.serialize().contains("layout(location = 0) flat out int Layer;"));
        assert!(f.serialize().contains("layout(location = 0) flat in int Layer;"));
    }

    // ============================================================
    // unmatched sides
    // ============================================================

    #[test]
    fn test_unmatched_vertex_output_still_emitted() {
        let (mut v, mut f) = units(
            "out vec3 Normal;\nout vec2 texCoord0;\nvoid main() {}\n",
            "in vec2 texCoord0;\nvoid main() {}\n",
        );
        let linked = link_stage_interfaces(&mut v, &mut f).unwrap();
        assert_eq!(linked.vertex_outputs.len(), 2);
        assert_eq!(linked.fragment_inputs.len(), 1);
        assert!(v.serialize().contains("layout(location = 0) out vec3 Normal;"));
    }

    #[test]
    fn test_unconsumed_fragment_input_dropped() {
        let (mut v, mut f) = units(
            "out vec2 texCoord0;\nvoid main() {}\n",
            "in vec2 texCoord0;\nin vec4 overlayColor;\nvoid main() {}\n",
        );
        link_stage_interfaces(&mut v, &mut f).unwrap();
        let fs = f.serialize();
        assert!(!fs.contains("overlayColor"));
        assert!(fs.contains("layout(location = 0) in vec2 texCoord0;"));
    }

    // ============================================================
    // explicit-location fallback
    // ============================================================

    #[test]
    fn test_explicit_location_match_ignores_names() {
        let (mut v, mut f) = units(
            "layout(location = 5) out vec4 fogColor;\nvoid main() {}\n",
            "layout(location = 5) in vec4 fog;\nvoid main() {}\n",
        );
        let linked = link_stage_interfaces(&mut v, &mut f).unwrap();
        assert_eq!(linked.vertex_outputs[0].location, 5);
        assert!(f.serialize().contains("layout(location = 5) in vec4 fog;"));
    }

    #[test]
    fn test_dense_allocation_skips_claimed_explicit_location() {
        let (mut v, mut f) = units(
            "layout(location = 0) out vec4 a;\nout vec2 b;\nvoid main() {}\n",
            "layout(location = 0) in vec4 aa;\nin vec2 b;\nvoid main() {}\n",
        );
        let linked = link_stage_interfaces(&mut v, &mut f).unwrap();
        assert_eq!(linked.vertex_outputs[0].location, 0);
        assert_eq!(linked.vertex_outputs[1].location, 1);
    }

    // ============================================================
    // failures
    // ============================================================

    #[test]
    fn test_type_mismatch_is_hard_error() {
        let (mut v, mut f) = units(
            "out vec3 Normal;\nvoid main() {}\n",
            "in vec4 Normal;\nvoid main() {}\n",
        );
        match link_stage_interfaces(&mut v, &mut f) {
            Err(ShaderError::InterfaceMismatch(msg)) => assert!(msg.contains("Normal")),
            other => panic!("expected InterfaceMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_component_qualifier_rejected() {
        let (mut v, mut f) = units(
            "layout(location = 0, component = 2) out float z;\nvoid main() {}\n",
            "void main() {}\n",
        );
        match link_stage_interfaces(&mut v, &mut f) {
            Err(ShaderError::Unsupported(msg)) => assert!(msg.contains("component")),
            other => panic!("expected Unsupported, got {:?}", other),
        }
    }
}
