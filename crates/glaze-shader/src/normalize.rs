//! Source normalization.
//!
//! Rewrites raw shader text before parsing: injects target-specific defines,
//! renames GL built-ins that do not exist under Vulkan GLSL, and patches
//! known-broken upstream shaders by logical name. Pure text rewriting with
//! no failure path.

use crate::ShaderStage;

/// Inputs for one normalization pass.
pub struct NormalizeOptions<'a> {
    /// Caller-supplied preprocessor defines, injected in order.
    pub defines: &'a [(String, String)],
    /// Device minimum uniform-buffer offset alignment, exposed to shaders
    /// as `UBO_OFFSET_ALIGNMENT`.
    pub ubo_offset_alignment: u32,
}

/// GL built-ins renamed to their Vulkan GLSL equivalents.
const BUILTIN_RENAMES: &[(&str, &str)] = &[
    ("gl_VertexID", "gl_VertexIndex"),
    ("gl_InstanceID", "gl_InstanceIndex"),
];

/// Literal fixups for shaders that ship broken upstream, keyed on the
/// logical shader name. Each entry is applied as a plain find -> replace.
const SHADER_PATCHES: &[(&str, &[(&str, &str)])] = &[
    // Samples a texel outside the atlas when the sprite sits on the last row.
    (
        "entity_overlay",
        &[(
            "texture(Sampler0, texCoord0 + vec2(0.0, 1.0 / 64.0))",
            "texture(Sampler0, texCoord0)",
        )],
    ),
    // Divides by a vector component that is zero for orthographic projections.
    (
        "glint_scroll",
        &[("/ gl_Position.w", "/ max(gl_Position.w, 0.0001)")],
    ),
];

/// Normalize one stage source. `name` is the logical shader name used for
/// the patch-table lookup and diagnostics.
pub fn normalize_source(
    name: &str,
    stage: ShaderStage,
    source: &str,
    options: &NormalizeOptions<'_>,
) -> String {
    let mut text = source.to_string();

    for (from, to) in BUILTIN_RENAMES {
        text = replace_word(&text, from, to);
    }

    for (shader, patches) in SHADER_PATCHES {
        if *shader == name {
            for (from, to) in *patches {
                text = text.replace(from, to);
            }
        }
    }

    inject_defines(&text, stage, options)
}

/// Build the define block and splice it in right after the `#version` line
/// (or at the very top when the source has none).
fn inject_defines(source: &str, stage: ShaderStage, options: &NormalizeOptions<'_>) -> String {
    let mut block = String::new();
    let marker = match stage {
        ShaderStage::Vertex => "VERTEX_SHADER",
        ShaderStage::Fragment => "FRAGMENT_SHADER",
    };
    block.push_str(&format!("#define {}\n", marker));
    block.push_str(&format!(
        "#define UBO_OFFSET_ALIGNMENT {}\n",
        options.ubo_offset_alignment
    ));
    for (key, value) in options.defines {
        if value.is_empty() {
            block.push_str(&format!("#define {}\n", key));
        } else {
            block.push_str(&format!("#define {} {}\n", key, value));
        }
    }

    let mut out = String::with_capacity(source.len() + block.len());
    let mut injected = false;
    for line in source.lines() {
        out.push_str(line);
        out.push('\n');
        if !injected && line.trim_start().starts_with("#version") {
            out.push_str(&block);
            injected = true;
        }
    }
    if !injected {
        return format!("{}{}", block, out);
    }
    out
}

/// Replace whole-word occurrences only; identifiers that merely contain the
/// needle are left alone.
fn replace_word(text: &str, from: &str, to: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(from) {
        let before_ok = pos == 0
            || !rest[..pos]
                .chars()
                .next_back()
                .map(|c| c.is_ascii_alphanumeric() || c == '_')
                .unwrap_or(false);
        let after = &rest[pos + from.len()..];
        let after_ok = !after
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric() || c == '_')
            .unwrap_or(false);
        out.push_str(&rest[..pos]);
        if before_ok && after_ok {
            out.push_str(to);
        } else {
            out.push_str(from);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options<'a>(defines: &'a [(String, String)]) -> NormalizeOptions<'a> {
        NormalizeOptions { defines, ubo_offset_alignment: 256 }
    }

    // ============================================================
    // define injection
    // ============================================================

    #[test]
    fn test_defines_injected_after_version() {
        let defines = vec![("USE_FOG".to_string(), "1".to_string())];
        let out = normalize_source(
            "terrain",
            ShaderStage::Vertex,
            "#version 150\nvoid main() {}\n",
            &options(&defines),
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "#version 150");
        assert_eq!(lines[1], "#define VERTEX_SHADER");
        assert_eq!(lines[2], "#define UBO_OFFSET_ALIGNMENT 256");
        assert_eq!(lines[3], "#define USE_FOG 1");
    }

    #[test]
    fn test_defines_prepended_without_version() {
        let out = normalize_source("terrain", ShaderStage::Fragment, "void main() {}\n", &options(&[]));
        assert!(out.starts_with("#define FRAGMENT_SHADER\n"));
    }

    #[test]
    fn test_valueless_define() {
        let defines = vec![("NO_OVERLAY".to_string(), String::new())];
        let out = normalize_source("terrain", ShaderStage::Vertex, "#version 150\n", &options(&defines));
        assert!(out.contains("#define NO_OVERLAY\n"));
    }

    // ============================================================
    // built-in renames
    // ============================================================

    #[test]
    fn test_builtin_renamed() {
        let out = normalize_source(
            "text",
            ShaderStage::Vertex,
            "#version 150\nint i = gl_VertexID;\n",
            &options(&[]),
        );
        assert!(out.contains("gl_VertexIndex"));
        assert!(!out.contains("gl_VertexID;"));
    }

    #[test]
    fn test_rename_respects_word_boundaries() {
        let out = normalize_source(
            "text",
            ShaderStage::Vertex,
            "#version 150\nint gl_VertexID_copy = gl_VertexID;\n",
            &options(&[]),
        );
        assert!(out.contains("gl_VertexID_copy"));
        assert!(out.contains("= gl_VertexIndex;"));
    }

    // ============================================================
    // patch table
    // ============================================================

    #[test]
    fn test_patch_applied_for_matching_name() {
        let source = "#version 150\nvec4 c = texture(Sampler0, texCoord0 + vec2(0.0, 1.0 / 64.0));\n";
        let out = normalize_source("entity_overlay", ShaderStage::Fragment, source, &options(&[]));
        assert!(out.contains("texture(Sampler0, texCoord0);"));
    }

    #[test]
    fn test_patch_skipped_for_other_names() {
        let source = "#version 150\nvec4 c = texture(Sampler0, texCoord0 + vec2(0.0, 1.0 / 64.0));\n";
        let out = normalize_source("terrain", ShaderStage::Fragment, source, &options(&[]));
        assert!(out.contains("1.0 / 64.0"));
    }
}
