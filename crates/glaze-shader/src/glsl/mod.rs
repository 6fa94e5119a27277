//! Editable GLSL source model.
//!
//! A shader is held as an ordered list of items: top-level `in`/`out`/
//! `uniform` declarations are parsed into a mutable table, everything else
//! (preprocessor lines, blocks, functions) is kept verbatim. The linker and
//! classifier rewrite the table by name; a final serialization pass emits
//! the regenerated source handed to the SPIR-V compiler.

mod parse;

use crate::ShaderStage;

/// Scalar base type of an interface variable or uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Float,
    Int,
    UInt,
    Bool,
}

/// Parsed scalar/vector type, e.g. `vec3` = (Float, 3), `int` = (Int, 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlslType {
    pub scalar: ScalarType,
    pub width: u32,
}

impl GlslType {
    /// Parse a GLSL type name into scalar base + vector width.
    ///
    /// Returns `None` for matrices, samplers, and anything else that is not
    /// a plain scalar or vector.
    pub fn parse(type_name: &str) -> Option<GlslType> {
        let (scalar, rest) = match type_name {
            "float" => return Some(GlslType { scalar: ScalarType::Float, width: 1 }),
            "int" => return Some(GlslType { scalar: ScalarType::Int, width: 1 }),
            "uint" => return Some(GlslType { scalar: ScalarType::UInt, width: 1 }),
            "bool" => return Some(GlslType { scalar: ScalarType::Bool, width: 1 }),
            _ if type_name.starts_with("vec") => (ScalarType::Float, &type_name[3..]),
            _ if type_name.starts_with("ivec") => (ScalarType::Int, &type_name[4..]),
            _ if type_name.starts_with("uvec") => (ScalarType::UInt, &type_name[4..]),
            _ if type_name.starts_with("bvec") => (ScalarType::Bool, &type_name[4..]),
            _ => return None,
        };
        match rest {
            "2" => Some(GlslType { scalar, width: 2 }),
            "3" => Some(GlslType { scalar, width: 3 }),
            "4" => Some(GlslType { scalar, width: 4 }),
            _ => None,
        }
    }
}

/// Whether a type name is any flavor of sampler (combined image sampler or
/// texel buffer).
pub fn is_sampler_type(type_name: &str) -> bool {
    let base = type_name
        .strip_prefix('i')
        .or_else(|| type_name.strip_prefix('u'))
        .unwrap_or(type_name);
    base.starts_with("sampler") || base.starts_with("texture") || base.starts_with("image")
}

/// Whether a type name is a texel-buffer sampler (`samplerBuffer` family).
pub fn is_texel_buffer_type(type_name: &str) -> bool {
    let base = type_name
        .strip_prefix('i')
        .or_else(|| type_name.strip_prefix('u'))
        .unwrap_or(type_name);
    base == "samplerBuffer" || base == "textureBuffer" || base == "imageBuffer"
}

/// Storage qualifier of a tracked declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclQualifier {
    In,
    Out,
    Uniform,
}

impl DeclQualifier {
    fn keyword(self) -> &'static str {
        match self {
            DeclQualifier::In => "in",
            DeclQualifier::Out => "out",
            DeclQualifier::Uniform => "uniform",
        }
    }
}

/// Layout qualifiers recognized on a tracked declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutQualifiers {
    pub location: Option<u32>,
    pub binding: Option<u32>,
    pub set: Option<u32>,
    pub component: Option<u32>,
}

impl LayoutQualifiers {
    pub fn is_empty(&self) -> bool {
        self.location.is_none()
            && self.binding.is_none()
            && self.set.is_none()
            && self.component.is_none()
    }
}

/// One top-level `in`/`out`/`uniform` declaration.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub qualifier: DeclQualifier,
    pub type_name: String,
    pub name: String,
    /// Raw array suffix including brackets, e.g. `[4]`.
    pub array: Option<String>,
    pub layout: LayoutQualifiers,
    pub flat: bool,
    /// Raw initializer expression after `=`, if any.
    pub initializer: Option<String>,
}

impl Declaration {
    /// Render the declaration back to GLSL.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if !self.layout.is_empty() {
            let mut quals: Vec<String> = Vec::new();
            if let Some(set) = self.layout.set {
                quals.push(format!("set = {}", set));
            }
            if let Some(binding) = self.layout.binding {
                quals.push(format!("binding = {}", binding));
            }
            if let Some(location) = self.layout.location {
                quals.push(format!("location = {}", location));
            }
            if let Some(component) = self.layout.component {
                quals.push(format!("component = {}", component));
            }
            out.push_str(&format!("layout({}) ", quals.join(", ")));
        }
        if self.flat {
            out.push_str("flat ");
        }
        out.push_str(self.qualifier.keyword());
        out.push(' ');
        out.push_str(&self.type_name);
        out.push(' ');
        out.push_str(&self.name);
        if let Some(array) = &self.array {
            out.push_str(array);
        }
        if let Some(init) = &self.initializer {
            out.push_str(" = ");
            out.push_str(init);
        }
        out.push(';');
        out
    }
}

/// One serialization unit: a tracked declaration or a verbatim chunk.
#[derive(Debug, Clone)]
pub enum Item {
    Decl(Declaration),
    Verbatim(String),
}

/// An editable parse of one shader stage.
///
/// Owned exclusively by the pipeline build that produced it and discarded
/// after [`TranslationUnit::serialize`].
#[derive(Debug)]
pub struct TranslationUnit {
    pub stage: ShaderStage,
    /// The `#version` line, kept first in the output.
    version: Option<String>,
    /// Declarations injected by the linker/classifier, emitted right after
    /// the prologue so they precede every use site.
    injected: Vec<String>,
    items: Vec<Item>,
}

impl TranslationUnit {
    /// Parse a stage source into the declaration table.
    pub fn parse(stage: ShaderStage, source: &str) -> TranslationUnit {
        let (version, items) = parse::scan(source);
        TranslationUnit { stage, version, injected: Vec::new(), items }
    }

    /// Iterate tracked declarations in source order.
    pub fn declarations(&self) -> impl Iterator<Item = &Declaration> {
        self.items.iter().filter_map(|item| match item {
            Item::Decl(decl) => Some(decl),
            Item::Verbatim(_) => None,
        })
    }

    /// Remove a tracked declaration by name. Returns whether one was removed.
    pub fn remove_declaration(&mut self, name: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| match item {
            Item::Decl(decl) => decl.name != name,
            Item::Verbatim(_) => true,
        });
        self.items.len() != before
    }

    /// Inject declaration text near the top of the unit (after the
    /// `#version` prologue, before all original items).
    pub fn inject_declaration(&mut self, text: String) {
        self.injected.push(text);
    }

    /// Regenerate source text from the table.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(version) = &self.version {
            out.push_str(version);
            out.push('\n');
        }
        // Leading preprocessor lines stay ahead of the injected
        // declarations; extension pragmas must precede any other token.
        let mut index = 0;
        while index < self.items.len() {
            match &self.items[index] {
                Item::Verbatim(text)
                    if text.trim().is_empty() || text.trim_start().starts_with('#') =>
                {
                    out.push_str(text);
                    out.push('\n');
                    index += 1;
                }
                _ => break,
            }
        }
        for text in &self.injected {
            out.push_str(text);
            out.push('\n');
        }
        for item in &self.items[index..] {
            match item {
                Item::Decl(decl) => out.push_str(&decl.serialize()),
                Item::Verbatim(text) => out.push_str(text),
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // GlslType::parse
    // ============================================================

    #[test]
    fn test_parse_scalar_types() {
        assert_eq!(
            GlslType::parse("float"),
            Some(GlslType { scalar: ScalarType::Float, width: 1 })
        );
        assert_eq!(
            GlslType::parse("uint"),
            Some(GlslType { scalar: ScalarType::UInt, width: 1 })
        );
    }

    #[test]
    fn test_parse_vector_types() {
        assert_eq!(
            GlslType::parse("vec3"),
            Some(GlslType { scalar: ScalarType::Float, width: 3 })
        );
        assert_eq!(
            GlslType::parse("ivec2"),
            Some(GlslType { scalar: ScalarType::Int, width: 2 })
        );
        assert_eq!(
            GlslType::parse("bvec4"),
            Some(GlslType { scalar: ScalarType::Bool, width: 4 })
        );
    }

    #[test]
    fn test_parse_rejects_non_vectors() {
        assert_eq!(GlslType::parse("mat4"), None);
        assert_eq!(GlslType::parse("sampler2D"), None);
        assert_eq!(GlslType::parse("vec5"), None);
    }

    // ============================================================
    // sampler classification
    // ============================================================

    #[test]
    fn test_sampler_type_detection() {
        assert!(is_sampler_type("sampler2D"));
        assert!(is_sampler_type("usampler3D"));
        assert!(is_sampler_type("samplerBuffer"));
        assert!(!is_sampler_type("vec4"));
        assert!(!is_sampler_type("mat4"));
    }

    #[test]
    fn test_texel_buffer_type_detection() {
        assert!(is_texel_buffer_type("samplerBuffer"));
        assert!(is_texel_buffer_type("usamplerBuffer"));
        assert!(!is_texel_buffer_type("sampler2D"));
    }

    // ============================================================
    // Declaration::serialize
    // ============================================================

    #[test]
    fn test_serialize_plain_uniform() {
        let decl = Declaration {
            qualifier: DeclQualifier::Uniform,
            type_name: "mat4".to_string(),
            name: "ModelViewMat".to_string(),
            array: None,
            layout: LayoutQualifiers::default(),
            flat: false,
            initializer: None,
        };
        assert_eq!(decl.serialize(), "uniform mat4 ModelViewMat;");
    }

    #[test]
    fn test_serialize_located_flat_output() {
        let decl = Declaration {
            qualifier: DeclQualifier::Out,
            type_name: "ivec2".to_string(),
            name: "CellIndex".to_string(),
            array: None,
            layout: LayoutQualifiers { location: Some(3), ..Default::default() },
            flat: true,
            initializer: None,
        };
        assert_eq!(decl.serialize(), "layout(location = 3) flat out ivec2 CellIndex;");
    }

    // ============================================================
    // TranslationUnit editing
    // ============================================================

    #[test]
    fn test_remove_and_inject_round_trip() {
        let source = "#version 150\nuniform vec4 ColorModulator;\nvoid main() {\n}\n";
        let mut unit = TranslationUnit::parse(ShaderStage::Fragment, source);
        assert_eq!(unit.declarations().count(), 1);

        assert!(unit.remove_declaration("ColorModulator"));
        assert!(!unit.remove_declaration("ColorModulator"));
        unit.inject_declaration("layout(std140) uniform Tints {\n    vec4 ColorModulator;\n};".to_string());

        let out = unit.serialize();
        assert!(out.starts_with("#version 150\n"));
        assert!(out.contains("uniform Tints"));
        assert!(!out.contains("uniform vec4 ColorModulator"));
        assert!(out.contains("void main()"));
    }
}
