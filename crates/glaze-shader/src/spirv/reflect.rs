//! SPIR-V reflection.
//!
//! Recovers, per stage: input/output interface variables with their
//! decorated locations, buffer and image resources with set/binding
//! decorations and byte sizes/strides, and the push-constant block member
//! layout. For every set/binding/location decoration the word offset of the
//! operand is recorded alongside its value so the layout builder can patch
//! the binary in place.

use std::collections::HashMap;

use super::{dec, op, read_literal_string, storage, DecorationRef, Instruction, SpirvModule, DIM_BUFFER};
use crate::glsl::ScalarType;
use crate::ShaderError;

/// Descriptor-visible resource classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    UniformBuffer,
    StorageBuffer,
    TexelBuffer,
    SeparateImage,
    CombinedSampler,
}

impl ResourceKind {
    /// Tier used when assigning binding indices on the legacy path:
    /// uniform buffers first, then buffer-like resources, then images,
    /// then combined samplers.
    pub fn binding_tier(self) -> u32 {
        match self {
            ResourceKind::UniformBuffer => 0,
            ResourceKind::StorageBuffer | ResourceKind::TexelBuffer => 1,
            ResourceKind::SeparateImage => 2,
            ResourceKind::CombinedSampler => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::UniformBuffer => "uniform buffer",
            ResourceKind::StorageBuffer => "storage buffer",
            ResourceKind::TexelBuffer => "texel buffer",
            ResourceKind::SeparateImage => "image",
            ResourceKind::CombinedSampler => "sampler",
        }
    }
}

/// One reflected stage input or output.
#[derive(Debug, Clone)]
pub struct ReflectedVar {
    pub name: String,
    pub location: u32,
    pub location_ref: DecorationRef,
    /// Scalar base + vector width when the type is a plain scalar/vector.
    pub shape: Option<(ScalarType, u32)>,
}

/// One member of a reflected block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMember {
    pub name: String,
    pub type_name: String,
    pub offset: u32,
    pub size: u32,
}

/// One reflected descriptor resource.
#[derive(Debug, Clone)]
pub struct ReflectedResource {
    pub name: String,
    pub kind: ResourceKind,
    pub set: u32,
    pub set_ref: DecorationRef,
    pub binding: u32,
    pub binding_ref: DecorationRef,
    /// Declared struct size for buffer-like resources.
    pub byte_size: Option<u32>,
    /// Array stride of a trailing runtime array, if any.
    pub stride: Option<u32>,
    /// Descriptor count (>1 for arrayed resources).
    pub count: u32,
    /// Block members for buffer resources.
    pub members: Vec<BlockMember>,
}

/// The push-constant block of one stage.
#[derive(Debug, Clone)]
pub struct PushConstantBlock {
    pub name: String,
    pub members: Vec<BlockMember>,
}

/// Everything reflected from one stage binary.
#[derive(Debug, Default)]
pub struct StageReflection {
    pub inputs: Vec<ReflectedVar>,
    pub outputs: Vec<ReflectedVar>,
    pub resources: Vec<ReflectedResource>,
    pub push_constants: Option<PushConstantBlock>,
}

/// Reflect one stage binary.
pub fn reflect(module: &SpirvModule) -> Result<StageReflection, ShaderError> {
    let tables = Tables::build(module);
    let mut reflection = StageReflection::default();

    for &(id, pointer_type, storage_class) in &tables.variables {
        match storage_class {
            storage::INPUT | storage::OUTPUT => {
                if let Some(var) = tables.interface_var(id, pointer_type)? {
                    if storage_class == storage::INPUT {
                        reflection.inputs.push(var);
                    } else {
                        reflection.outputs.push(var);
                    }
                }
            }
            storage::UNIFORM | storage::STORAGE_BUFFER => {
                if let Some(resource) =
                    tables.buffer_resource(id, pointer_type, storage_class)?
                {
                    reflection.resources.push(resource);
                }
            }
            storage::UNIFORM_CONSTANT => {
                if let Some(resource) = tables.opaque_resource(id, pointer_type)? {
                    reflection.resources.push(resource);
                }
            }
            storage::PUSH_CONSTANT => {
                reflection.push_constants = Some(tables.push_block(id, pointer_type)?);
            }
            _ => {}
        }
    }

    Ok(reflection)
}

// ============================================================================
// Internal tables
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct DecEntry {
    value: u32,
    word_index: usize,
}

impl DecEntry {
    fn reference(&self) -> DecorationRef {
        DecorationRef { word_index: self.word_index, expected: self.value }
    }
}

#[derive(Debug, Clone)]
enum Ty {
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { elem: u32, count: u32 },
    Matrix { column: u32, columns: u32 },
    Image { dim: u32 },
    Sampler,
    SampledImage { image: u32 },
    Array { elem: u32, length_id: u32 },
    RuntimeArray { elem: u32 },
    Struct { members: Vec<u32> },
    Pointer { pointee: u32 },
}

#[derive(Default)]
struct Tables {
    names: HashMap<u32, String>,
    member_names: HashMap<(u32, u32), String>,
    decorations: HashMap<(u32, u32), DecEntry>,
    member_decorations: HashMap<(u32, u32, u32), DecEntry>,
    types: HashMap<u32, Ty>,
    constants: HashMap<u32, u32>,
    variables: Vec<(u32, u32, u32)>,
}

impl Tables {
    fn build(module: &SpirvModule) -> Tables {
        let mut t = Tables::default();
        for inst in module.instructions() {
            t.record(&inst);
        }
        t
    }

    fn record(&mut self, inst: &Instruction<'_>) {
        let ops = inst.operands;
        // Arity guards keep a structurally valid but semantically malformed
        // binary from panicking the reflector.
        match inst.opcode {
            op::NAME if ops.len() >= 1 => {
                let (name, _) = read_literal_string(&ops[1..]);
                self.names.insert(ops[0], name);
            }
            op::MEMBER_NAME if ops.len() >= 2 => {
                let (name, _) = read_literal_string(&ops[2..]);
                self.member_names.insert((ops[0], ops[1]), name);
            }
            op::DECORATE if ops.len() >= 2 => {
                let value = ops.get(2).copied().unwrap_or(0);
                self.decorations.insert(
                    (ops[0], ops[1]),
                    DecEntry { value, word_index: inst.operand_index(2) },
                );
            }
            op::MEMBER_DECORATE if ops.len() >= 3 => {
                let value = ops.get(3).copied().unwrap_or(0);
                self.member_decorations.insert(
                    (ops[0], ops[1], ops[2]),
                    DecEntry { value, word_index: inst.operand_index(3) },
                );
            }
            op::TYPE_BOOL if ops.len() >= 1 => {
                self.types.insert(ops[0], Ty::Bool);
            }
            op::TYPE_INT if ops.len() >= 3 => {
                self.types.insert(ops[0], Ty::Int { width: ops[1], signed: ops[2] != 0 });
            }
            op::TYPE_FLOAT if ops.len() >= 2 => {
                self.types.insert(ops[0], Ty::Float { width: ops[1] });
            }
            op::TYPE_VECTOR if ops.len() >= 3 => {
                self.types.insert(ops[0], Ty::Vector { elem: ops[1], count: ops[2] });
            }
            op::TYPE_MATRIX if ops.len() >= 3 => {
                self.types.insert(ops[0], Ty::Matrix { column: ops[1], columns: ops[2] });
            }
            op::TYPE_IMAGE if ops.len() >= 3 => {
                self.types.insert(ops[0], Ty::Image { dim: ops[2] });
            }
            op::TYPE_SAMPLER if ops.len() >= 1 => {
                self.types.insert(ops[0], Ty::Sampler);
            }
            op::TYPE_SAMPLED_IMAGE if ops.len() >= 2 => {
                self.types.insert(ops[0], Ty::SampledImage { image: ops[1] });
            }
            op::TYPE_ARRAY if ops.len() >= 3 => {
                self.types.insert(ops[0], Ty::Array { elem: ops[1], length_id: ops[2] });
            }
            op::TYPE_RUNTIME_ARRAY if ops.len() >= 2 => {
                self.types.insert(ops[0], Ty::RuntimeArray { elem: ops[1] });
            }
            op::TYPE_STRUCT if ops.len() >= 1 => {
                self.types.insert(ops[0], Ty::Struct { members: ops[1..].to_vec() });
            }
            op::TYPE_POINTER if ops.len() >= 3 => {
                self.types.insert(ops[0], Ty::Pointer { pointee: ops[2] });
            }
            op::CONSTANT if ops.len() >= 3 => {
                self.constants.insert(ops[1], ops[2]);
            }
            op::VARIABLE if ops.len() >= 3 => {
                self.variables.push((ops[1], ops[0], ops[2]));
            }
            _ => {}
        }
    }

    fn ty(&self, id: u32) -> Result<&Ty, ShaderError> {
        self.types.get(&id).ok_or_else(|| {
            ShaderError::InternalConsistency(format!("SPIR-V references unknown type id {}", id))
        })
    }

    fn pointee(&self, pointer_type: u32) -> Result<u32, ShaderError> {
        match self.ty(pointer_type)? {
            Ty::Pointer { pointee } => Ok(*pointee),
            _ => Err(ShaderError::InternalConsistency(format!(
                "variable type id {} is not a pointer",
                pointer_type
            ))),
        }
    }

    fn decoration(&self, id: u32, decoration: u32) -> Option<DecEntry> {
        self.decorations.get(&(id, decoration)).copied()
    }

    fn required_decoration(
        &self,
        id: u32,
        decoration: u32,
        what: &str,
        name: &str,
    ) -> Result<DecEntry, ShaderError> {
        self.decoration(id, decoration).ok_or_else(|| {
            ShaderError::InternalConsistency(format!(
                "resource '{}' has no {} decoration",
                name, what
            ))
        })
    }

    fn name_of(&self, id: u32) -> String {
        self.names.get(&id).cloned().unwrap_or_default()
    }

    fn has_builtin(&self, id: u32, pointee: u32) -> bool {
        if self.decoration(id, dec::BUILT_IN).is_some()
            || self.decoration(pointee, dec::BUILT_IN).is_some()
        {
            return true;
        }
        if let Some(Ty::Struct { members }) = self.types.get(&pointee) {
            return (0..members.len() as u32)
                .any(|i| self.member_decorations.contains_key(&(pointee, i, dec::BUILT_IN)));
        }
        false
    }

    // ------------------------------------------------------------------
    // interface variables
    // ------------------------------------------------------------------

    fn interface_var(
        &self,
        id: u32,
        pointer_type: u32,
    ) -> Result<Option<ReflectedVar>, ShaderError> {
        let pointee = self.pointee(pointer_type)?;
        if self.has_builtin(id, pointee) {
            return Ok(None);
        }
        let location = match self.decoration(id, dec::LOCATION) {
            Some(entry) => entry,
            // No location and no builtin: not part of the user interface.
            None => return Ok(None),
        };
        Ok(Some(ReflectedVar {
            name: self.name_of(id),
            location: location.value,
            location_ref: location.reference(),
            shape: self.scalar_shape(pointee),
        }))
    }

    fn scalar_shape(&self, type_id: u32) -> Option<(ScalarType, u32)> {
        match self.types.get(&type_id)? {
            Ty::Vector { elem, count } => Some((self.scalar_of(*elem)?, *count)),
            Ty::Array { elem, .. } => self.scalar_shape(*elem),
            other => Some((self.scalar_of_ty(other)?, 1)),
        }
    }

    fn scalar_of(&self, type_id: u32) -> Option<ScalarType> {
        self.scalar_of_ty(self.types.get(&type_id)?)
    }

    fn scalar_of_ty(&self, ty: &Ty) -> Option<ScalarType> {
        match ty {
            Ty::Bool => Some(ScalarType::Bool),
            Ty::Int { signed: true, .. } => Some(ScalarType::Int),
            Ty::Int { signed: false, .. } => Some(ScalarType::UInt),
            Ty::Float { .. } => Some(ScalarType::Float),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // buffer resources
    // ------------------------------------------------------------------

    fn buffer_resource(
        &self,
        id: u32,
        pointer_type: u32,
        storage_class: u32,
    ) -> Result<Option<ReflectedResource>, ShaderError> {
        let pointee = self.pointee(pointer_type)?;
        let members = match self.ty(pointee)? {
            Ty::Struct { members } => members.clone(),
            _ => return Ok(None),
        };

        let is_storage = storage_class == storage::STORAGE_BUFFER
            || self.decoration(pointee, dec::BUFFER_BLOCK).is_some();
        if !is_storage && self.decoration(pointee, dec::BLOCK).is_none() {
            return Ok(None);
        }
        let kind = if is_storage {
            ResourceKind::StorageBuffer
        } else {
            ResourceKind::UniformBuffer
        };

        // Blocks carry the GLSL block name on the struct type; the variable
        // name is the (often empty) instance name.
        let mut name = self.name_of(pointee);
        if name.is_empty() {
            name = self.name_of(id);
        }

        let set = self.required_decoration(id, dec::DESCRIPTOR_SET, "descriptor-set", &name)?;
        let binding = self.required_decoration(id, dec::BINDING, "binding", &name)?;

        let stride = match members.last() {
            Some(&last) => match self.ty(last)? {
                Ty::RuntimeArray { .. } => {
                    self.decoration(last, dec::ARRAY_STRIDE).map(|e| e.value)
                }
                _ => None,
            },
            None => None,
        };

        Ok(Some(ReflectedResource {
            byte_size: Some(self.struct_size(pointee)?),
            members: self.block_members(pointee)?,
            name,
            kind,
            set: set.value,
            set_ref: set.reference(),
            binding: binding.value,
            binding_ref: binding.reference(),
            stride,
            count: 1,
        }))
    }

    // ------------------------------------------------------------------
    // opaque resources (samplers, images, texel buffers)
    // ------------------------------------------------------------------

    fn opaque_resource(
        &self,
        id: u32,
        pointer_type: u32,
    ) -> Result<Option<ReflectedResource>, ShaderError> {
        let mut pointee = self.pointee(pointer_type)?;
        let mut count = 1;
        loop {
            match self.ty(pointee)? {
                Ty::Array { elem, length_id } => {
                    count = self.constants.get(length_id).copied().unwrap_or(1);
                    pointee = *elem;
                }
                _ => break,
            }
        }

        let name = self.name_of(id);
        let kind = match self.ty(pointee)? {
            Ty::SampledImage { image } => match self.ty(*image)? {
                Ty::Image { dim } if *dim == DIM_BUFFER => ResourceKind::TexelBuffer,
                _ => ResourceKind::CombinedSampler,
            },
            Ty::Image { dim } if *dim == DIM_BUFFER => ResourceKind::TexelBuffer,
            Ty::Image { .. } => ResourceKind::SeparateImage,
            Ty::Sampler => {
                return Err(ShaderError::Unsupported(format!(
                    "separate sampler object '{}'",
                    name
                )))
            }
            _ => return Ok(None),
        };

        let set = self.required_decoration(id, dec::DESCRIPTOR_SET, "descriptor-set", &name)?;
        let binding = self.required_decoration(id, dec::BINDING, "binding", &name)?;

        Ok(Some(ReflectedResource {
            name,
            kind,
            set: set.value,
            set_ref: set.reference(),
            binding: binding.value,
            binding_ref: binding.reference(),
            byte_size: None,
            stride: None,
            count,
            members: Vec::new(),
        }))
    }

    // ------------------------------------------------------------------
    // push constants
    // ------------------------------------------------------------------

    fn push_block(&self, id: u32, pointer_type: u32) -> Result<PushConstantBlock, ShaderError> {
        let pointee = self.pointee(pointer_type)?;
        let mut name = self.name_of(pointee);
        if name.is_empty() {
            name = self.name_of(id);
        }
        Ok(PushConstantBlock { members: self.block_members(pointee)?, name })
    }

    // ------------------------------------------------------------------
    // sizes
    // ------------------------------------------------------------------

    fn block_members(&self, struct_id: u32) -> Result<Vec<BlockMember>, ShaderError> {
        let member_types = match self.ty(struct_id)? {
            Ty::Struct { members } => members.clone(),
            _ => {
                return Err(ShaderError::InternalConsistency(format!(
                    "block type id {} is not a struct",
                    struct_id
                )))
            }
        };

        let mut members = Vec::with_capacity(member_types.len());
        for (index, &member_type) in member_types.iter().enumerate() {
            let index = index as u32;
            let name = self
                .member_names
                .get(&(struct_id, index))
                .cloned()
                .unwrap_or_else(|| format!("member{}", index));
            let offset = self
                .member_decorations
                .get(&(struct_id, index, dec::OFFSET))
                .map(|e| e.value)
                .ok_or_else(|| {
                    ShaderError::InternalConsistency(format!(
                        "block member '{}' has no offset decoration",
                        name
                    ))
                })?;
            let matrix_stride = self
                .member_decorations
                .get(&(struct_id, index, dec::MATRIX_STRIDE))
                .map(|e| e.value);
            members.push(BlockMember {
                type_name: self.type_label(member_type),
                size: self.type_size(member_type, matrix_stride)?,
                name,
                offset,
            });
        }
        Ok(members)
    }

    fn struct_size(&self, struct_id: u32) -> Result<u32, ShaderError> {
        let members = self.block_members(struct_id)?;
        Ok(members.iter().map(|m| m.offset + m.size).max().unwrap_or(0))
    }

    fn type_size(&self, type_id: u32, matrix_stride: Option<u32>) -> Result<u32, ShaderError> {
        Ok(match self.ty(type_id)? {
            Ty::Bool => 4,
            Ty::Int { width, .. } | Ty::Float { width } => width / 8,
            Ty::Vector { elem, count } => count * self.type_size(*elem, None)?,
            Ty::Matrix { column, columns } => match matrix_stride {
                Some(stride) => stride * columns,
                None => columns * self.type_size(*column, None)?,
            },
            Ty::Array { elem, length_id } => {
                let length = self.constants.get(length_id).copied().unwrap_or(0);
                match self.decoration(type_id, dec::ARRAY_STRIDE) {
                    Some(stride) => stride.value * length,
                    None => length * self.type_size(*elem, None)?,
                }
            }
            Ty::RuntimeArray { .. } => 0,
            Ty::Struct { .. } => self.struct_size(type_id)?,
            _ => 0,
        })
    }

    fn type_label(&self, type_id: u32) -> String {
        let Some(ty) = self.types.get(&type_id) else {
            return "unknown".to_string();
        };
        match ty {
            Ty::Bool => "bool".to_string(),
            Ty::Int { signed: true, .. } => "int".to_string(),
            Ty::Int { signed: false, .. } => "uint".to_string(),
            Ty::Float { width: 64 } => "double".to_string(),
            Ty::Float { .. } => "float".to_string(),
            Ty::Vector { elem, count } => {
                let prefix = match self.types.get(elem) {
                    Some(Ty::Int { signed: true, .. }) => "ivec",
                    Some(Ty::Int { signed: false, .. }) => "uvec",
                    Some(Ty::Bool) => "bvec",
                    _ => "vec",
                };
                format!("{}{}", prefix, count)
            }
            Ty::Matrix { column, columns } => {
                let rows = match self.types.get(column) {
                    Some(Ty::Vector { count, .. }) => *count,
                    _ => 0,
                };
                if rows == *columns {
                    format!("mat{}", columns)
                } else {
                    format!("mat{}x{}", columns, rows)
                }
            }
            Ty::Array { elem, length_id } => {
                let length = self.constants.get(length_id).copied().unwrap_or(0);
                format!("{}[{}]", self.type_label(*elem), length)
            }
            Ty::Struct { .. } => {
                let name = self.name_of(type_id);
                if name.is_empty() {
                    "struct".to_string()
                } else {
                    name
                }
            }
            _ => "opaque".to_string(),
        }
    }
}
