//! Typed SPIR-V word-stream model.
//!
//! Parses a compiled binary into an instruction view and supports patching
//! single decoration operands in place, which is substantially cheaper than
//! recompiling when the layout builder renumbers bindings. Every patch
//! re-reads the target word and compares it against the value recorded at
//! reflection time before writing.

pub mod reflect;

use crate::ShaderError;

/// SPIR-V magic number (little-endian).
pub const MAGIC: u32 = 0x0723_0203;

/// Size of the module header in words.
pub const HEADER_WORDS: usize = 5;

/// Opcodes the reflector cares about.
pub(crate) mod op {
    pub const NAME: u16 = 5;
    pub const MEMBER_NAME: u16 = 6;
    pub const TYPE_BOOL: u16 = 20;
    pub const TYPE_INT: u16 = 21;
    pub const TYPE_FLOAT: u16 = 22;
    pub const TYPE_VECTOR: u16 = 23;
    pub const TYPE_MATRIX: u16 = 24;
    pub const TYPE_IMAGE: u16 = 25;
    pub const TYPE_SAMPLER: u16 = 26;
    pub const TYPE_SAMPLED_IMAGE: u16 = 27;
    pub const TYPE_ARRAY: u16 = 28;
    pub const TYPE_RUNTIME_ARRAY: u16 = 29;
    pub const TYPE_STRUCT: u16 = 30;
    pub const TYPE_POINTER: u16 = 32;
    pub const CONSTANT: u16 = 43;
    pub const VARIABLE: u16 = 59;
    pub const DECORATE: u16 = 71;
    pub const MEMBER_DECORATE: u16 = 72;
}

/// Decoration kinds.
pub(crate) mod dec {
    pub const BLOCK: u32 = 2;
    pub const BUFFER_BLOCK: u32 = 3;
    pub const ARRAY_STRIDE: u32 = 6;
    pub const MATRIX_STRIDE: u32 = 7;
    pub const BUILT_IN: u32 = 11;
    pub const LOCATION: u32 = 30;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
    pub const OFFSET: u32 = 35;
}

/// Storage classes.
pub(crate) mod storage {
    pub const UNIFORM_CONSTANT: u32 = 0;
    pub const INPUT: u32 = 1;
    pub const UNIFORM: u32 = 2;
    pub const OUTPUT: u32 = 3;
    pub const PUSH_CONSTANT: u32 = 9;
    pub const STORAGE_BUFFER: u32 = 12;
}

/// `Dim` operand of `OpTypeImage` for buffer textures.
pub(crate) const DIM_BUFFER: u32 = 5;

/// Location of one decoration operand inside the word stream, together with
/// the value read there at reflection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecorationRef {
    pub word_index: usize,
    pub expected: u32,
}

/// One decoded instruction; `index` is the word offset of its first word.
#[derive(Debug, Clone, Copy)]
pub struct Instruction<'a> {
    pub opcode: u16,
    pub index: usize,
    pub operands: &'a [u32],
}

impl Instruction<'_> {
    /// Word index of the given operand within the module.
    pub fn operand_index(&self, operand: usize) -> usize {
        self.index + 1 + operand
    }
}

/// A parsed SPIR-V binary.
#[derive(Debug, Clone)]
pub struct SpirvModule {
    words: Vec<u32>,
}

impl SpirvModule {
    /// Validate the header and instruction framing.
    pub fn parse(words: Vec<u32>) -> Result<SpirvModule, ShaderError> {
        if words.len() < HEADER_WORDS {
            return Err(ShaderError::InternalConsistency(
                "SPIR-V binary shorter than its header".to_string(),
            ));
        }
        if words[0] != MAGIC {
            return Err(ShaderError::InternalConsistency(format!(
                "bad SPIR-V magic {:#010x}",
                words[0]
            )));
        }
        let mut index = HEADER_WORDS;
        while index < words.len() {
            let count = (words[index] >> 16) as usize;
            if count == 0 || index + count > words.len() {
                return Err(ShaderError::InternalConsistency(format!(
                    "malformed SPIR-V instruction at word {}",
                    index
                )));
            }
            index += count;
        }
        Ok(SpirvModule { words })
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn into_words(self) -> Vec<u32> {
        self.words
    }

    /// Iterate instructions after the header.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions { words: &self.words, index: HEADER_WORDS }
    }

    /// Check that a previously-recorded decoration operand still holds the
    /// value read at reflection time.
    pub fn verify(&self, reference: &DecorationRef) -> Result<(), ShaderError> {
        match self.words.get(reference.word_index) {
            Some(&word) if word == reference.expected => Ok(()),
            Some(&word) => Err(ShaderError::InternalConsistency(format!(
                "decoration word {} is {} but {} was reflected",
                reference.word_index, word, reference.expected
            ))),
            None => Err(ShaderError::InternalConsistency(format!(
                "decoration word {} out of bounds",
                reference.word_index
            ))),
        }
    }

    /// Overwrite a decoration operand in place, verifying it first.
    pub fn patch(&mut self, reference: &DecorationRef, value: u32) -> Result<(), ShaderError> {
        self.verify(reference)?;
        self.words[reference.word_index] = value;
        Ok(())
    }
}

/// Instruction iterator; framing was validated by [`SpirvModule::parse`].
pub struct Instructions<'a> {
    words: &'a [u32],
    index: usize,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Instruction<'a>> {
        if self.index >= self.words.len() {
            return None;
        }
        let word = self.words[self.index];
        let count = (word >> 16) as usize;
        let inst = Instruction {
            opcode: (word & 0xffff) as u16,
            index: self.index,
            operands: &self.words[self.index + 1..self.index + count],
        };
        self.index += count;
        Some(inst)
    }
}

/// Decode a null-terminated literal string from instruction operands.
/// Returns the string and the number of words consumed.
pub(crate) fn read_literal_string(operands: &[u32]) -> (String, usize) {
    let mut bytes = Vec::new();
    let mut consumed = 0;
    'outer: for &word in operands {
        consumed += 1;
        for byte in word.to_le_bytes() {
            if byte == 0 {
                break 'outer;
            }
            bytes.push(byte);
        }
    }
    (String::from_utf8_lossy(&bytes).into_owned(), consumed)
}


#[cfg(test)]
mod tests {
    use super::testutil::{header, inst, string_operands};
    use super::*;

    // ============================================================
    // parsing
    // ============================================================

    #[test]
    fn test_parse_rejects_bad_magic() {
        let words = vec![0xdead_beef, 0, 0, 10, 0];
        assert!(SpirvModule::parse(words).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_instruction() {
        let mut words = header(10);
        words.push((4 << 16) | op::DECORATE as u32);
        words.push(1);
        assert!(SpirvModule::parse(words).is_err());
    }

    #[test]
    fn test_instruction_iteration() {
        let mut words = header(10);
        inst(&mut words, op::DECORATE, &[3, dec::BINDING, 7]);
        let mut name_ops = vec![3];
        name_ops.extend(string_operands("Sampler0"));
        inst(&mut words, op::NAME, &name_ops);

        let module = SpirvModule::parse(words).unwrap();
        let decoded: Vec<u16> = module.instructions().map(|i| i.opcode).collect();
        assert_eq!(decoded, vec![op::DECORATE, op::NAME]);
    }

    #[test]
    fn test_read_literal_string() {
        let operands = string_operands("GeneratedUniforms");
        let (s, consumed) = read_literal_string(&operands);
        assert_eq!(s, "GeneratedUniforms");
        assert_eq!(consumed, operands.len());
    }

    // ============================================================
    // patching
    // ============================================================

    #[test]
    fn test_patch_rewrites_matching_word() {
        let mut words = header(10);
        inst(&mut words, op::DECORATE, &[3, dec::BINDING, 7]);
        let mut module = SpirvModule::parse(words).unwrap();

        let binding_index = HEADER_WORDS + 3;
        let reference = DecorationRef { word_index: binding_index, expected: 7 };
        module.patch(&reference, 1).unwrap();
        assert_eq!(module.words()[binding_index], 1);
    }

    #[test]
    fn test_patch_detects_offset_drift() {
        let mut words = header(10);
        inst(&mut words, op::DECORATE, &[3, dec::BINDING, 7]);
        let mut module = SpirvModule::parse(words).unwrap();

        let reference = DecorationRef { word_index: HEADER_WORDS + 3, expected: 9 };
        match module.patch(&reference, 1) {
            Err(ShaderError::InternalConsistency(_)) => {}
            other => panic!("expected InternalConsistency, got {:?}", other),
        }
    }
}
