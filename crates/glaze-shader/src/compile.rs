//! GLSL -> SPIR-V compilation via shaderc.
//!
//! A `ShaderCompiler` wraps one `shaderc::Compiler` instance. The shaderc
//! context is not safe for concurrent invocation, so each cache worker
//! constructs its own compiler; instances are never shared between threads.

use crate::{ShaderError, ShaderStage};

/// How the source was authored, selecting the compile options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileProfile {
    /// OpenGL-style source that went through normalization, linking and
    /// classification. Forces the version/profile and auto-maps anything
    /// the rewrite passes left implicit.
    Legacy,
    /// Source already authored against Vulkan GLSL with explicit
    /// set/binding decorations.
    Native,
}

/// One shaderc compiler context plus the target configuration.
pub struct ShaderCompiler {
    compiler: shaderc::Compiler,
}

impl ShaderCompiler {
    pub fn new() -> Result<Self, ShaderError> {
        let compiler = shaderc::Compiler::new()
            .ok_or_else(|| ShaderError::Compile("failed to initialize shaderc".to_string()))?;
        Ok(ShaderCompiler { compiler })
    }

    /// Compile one stage to SPIR-V words.
    ///
    /// Optimization stays off so unread interface variables survive and the
    /// reflected decoration layout stays stable; debug info keeps the
    /// OpName strings reflection depends on.
    pub fn compile(
        &self,
        name: &str,
        stage: ShaderStage,
        source: &str,
        profile: CompileProfile,
    ) -> Result<Vec<u32>, ShaderError> {
        let mut options = shaderc::CompileOptions::new().ok_or_else(|| {
            ShaderError::Compile("failed to create shaderc compile options".to_string())
        })?;

        options.set_source_language(shaderc::SourceLanguage::GLSL);
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_3 as u32,
        );
        options.set_target_spirv(shaderc::SpirvVersion::V1_6);
        options.set_optimization_level(shaderc::OptimizationLevel::Zero);
        options.set_generate_debug_info();

        if profile == CompileProfile::Legacy {
            options.set_forced_version_profile(450, shaderc::GlslProfile::None);
            options.set_auto_map_locations(true);
            options.set_auto_bind_uniforms(true);
        }

        let artifact = self
            .compiler
            .compile_into_spirv(source, stage.shaderc_kind(), name, "main", Some(&options))
            .map_err(|e| {
                ShaderError::Compile(format!("'{}' ({} stage): {}", name, stage.tag(), e))
            })?;

        Ok(artifact.as_binary().to_vec())
    }
}
