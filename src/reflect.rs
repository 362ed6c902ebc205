//! SPIR-V interface reflection
//!
//! Walks the module once and pulls out what the pipeline layout needs:
//! the compute entry point and its local size, every descriptor binding
//! (storage buffers, uniform buffers, storage images), and the members of
//! the push-constant block with their offsets and sizes. Nothing here
//! validates semantics; the driver does that when the pipeline is built.

use std::collections::HashMap;

use crate::error::{ComputeError, Result};
use crate::image::{ImageDim, ImageFormat};

mod op {
    pub const NAME: u32 = 5;
    pub const MEMBER_NAME: u32 = 6;
    pub const ENTRY_POINT: u32 = 15;
    pub const EXECUTION_MODE: u32 = 16;
    pub const TYPE_INT: u32 = 21;
    pub const TYPE_FLOAT: u32 = 22;
    pub const TYPE_VECTOR: u32 = 23;
    pub const TYPE_MATRIX: u32 = 24;
    pub const TYPE_IMAGE: u32 = 25;
    pub const TYPE_ARRAY: u32 = 28;
    pub const TYPE_STRUCT: u32 = 30;
    pub const TYPE_POINTER: u32 = 32;
    pub const CONSTANT: u32 = 43;
    pub const SPEC_CONSTANT: u32 = 50;
    pub const VARIABLE: u32 = 59;
    pub const DECORATE: u32 = 71;
    pub const MEMBER_DECORATE: u32 = 72;
    pub const EXECUTION_MODE_ID: u32 = 331;
}

const EXEC_MODEL_GL_COMPUTE: u32 = 5;
const EXEC_MODE_LOCAL_SIZE: u32 = 17;
const EXEC_MODE_LOCAL_SIZE_ID: u32 = 38;

const DECORATION_BLOCK: u32 = 2;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_ARRAY_STRIDE: u32 = 6;
const DECORATION_MATRIX_STRIDE: u32 = 7;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;
const DECORATION_OFFSET: u32 = 35;

const STORAGE_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_UNIFORM: u32 = 2;
const STORAGE_PUSH_CONSTANT: u32 = 9;
const STORAGE_STORAGE_BUFFER: u32 = 12;

/// What kind of resource a binding expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    StorageBuffer,
    UniformBuffer,
    StorageImage {
        dim: ImageDim,
        /// `None` when the shader leaves the format unknown
        format: Option<ImageFormat>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub kind: BindingKind,
}

/// One member of the push-constant block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMember {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// Everything the pipeline layout and dispatch validation need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInterface {
    pub entry_point: String,
    pub local_size: [u32; 3],
    pub bindings: Vec<ReflectedBinding>,
    pub push_constants: Vec<PushMember>,
    pub push_constant_size: u32,
}

impl ProgramInterface {
    pub fn push_member(&self, name: &str) -> Option<&PushMember> {
        self.push_constants.iter().find(|m| m.name == name)
    }

    pub fn bindings_in_set(&self, set: u32) -> impl Iterator<Item = &ReflectedBinding> {
        self.bindings.iter().filter(move |b| b.set == set)
    }
}

#[derive(Debug, Clone)]
enum Type {
    Scalar { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, count: u32 },
    Array { element: u32, length_id: u32 },
    Struct { members: Vec<u32> },
    Image { dim: u32, sampled: u32, format: u32 },
    Pointer { pointee: u32 },
}

#[derive(Default)]
struct Module {
    names: HashMap<u32, String>,
    member_names: HashMap<(u32, u32), String>,
    decorations: HashMap<(u32, u32), u32>,
    flags: HashMap<u32, Vec<u32>>,
    member_offsets: HashMap<(u32, u32), u32>,
    matrix_strides: HashMap<(u32, u32), u32>,
    types: HashMap<u32, Type>,
    constants: HashMap<u32, u32>,
    // (pointer type, id, storage class)
    variables: Vec<(u32, u32, u32)>,
    entry: Option<(u32, String)>,
    local_size: HashMap<u32, ([u32; 3], bool)>,
}

fn read_string(words: &[u32]) -> (String, usize) {
    let mut bytes = Vec::new();
    for (i, word) in words.iter().enumerate() {
        for b in word.to_le_bytes() {
            if b == 0 {
                return (String::from_utf8_lossy(&bytes).into_owned(), i + 1);
            }
            bytes.push(b);
        }
    }
    (String::from_utf8_lossy(&bytes).into_owned(), words.len())
}

fn truncated(opcode: u32) -> ComputeError {
    ComputeError::Link(format!("Truncated SPIR-V instruction (opcode {})", opcode))
}

impl Module {
    fn parse(words: &[u32]) -> Result<Self> {
        let mut module = Module::default();
        let mut i = 5;

        while i < words.len() {
            let opcode = words[i] & 0xFFFF;
            let count = (words[i] >> 16) as usize;
            if count == 0 || i + count > words.len() {
                return Err(truncated(opcode));
            }
            let ops = &words[i + 1..i + count];
            module.instruction(opcode, ops)?;
            i += count;
        }

        Ok(module)
    }

    fn instruction(&mut self, opcode: u32, ops: &[u32]) -> Result<()> {
        let need = |n: usize| if ops.len() < n { Err(truncated(opcode)) } else { Ok(()) };

        match opcode {
            op::NAME => {
                need(1)?;
                self.names.insert(ops[0], read_string(&ops[1..]).0);
            }
            op::MEMBER_NAME => {
                need(2)?;
                self.member_names
                    .insert((ops[0], ops[1]), read_string(&ops[2..]).0);
            }
            op::ENTRY_POINT => {
                need(3)?;
                if ops[0] == EXEC_MODEL_GL_COMPUTE && self.entry.is_none() {
                    self.entry = Some((ops[1], read_string(&ops[2..]).0));
                }
            }
            op::EXECUTION_MODE => {
                need(2)?;
                if ops[1] == EXEC_MODE_LOCAL_SIZE {
                    need(5)?;
                    self.local_size.insert(ops[0], ([ops[2], ops[3], ops[4]], false));
                }
            }
            // LocalSizeId operands are constant ids, only legal here
            op::EXECUTION_MODE_ID => {
                need(2)?;
                if ops[1] == EXEC_MODE_LOCAL_SIZE_ID {
                    need(5)?;
                    self.local_size.insert(ops[0], ([ops[2], ops[3], ops[4]], true));
                }
            }
            op::TYPE_INT | op::TYPE_FLOAT => {
                need(2)?;
                self.types.insert(ops[0], Type::Scalar { width: ops[1] });
            }
            op::TYPE_VECTOR => {
                need(3)?;
                self.types.insert(ops[0], Type::Vector { component: ops[1], count: ops[2] });
            }
            op::TYPE_MATRIX => {
                need(3)?;
                self.types.insert(ops[0], Type::Matrix { column: ops[1], count: ops[2] });
            }
            op::TYPE_IMAGE => {
                need(8)?;
                self.types.insert(
                    ops[0],
                    Type::Image { dim: ops[2], sampled: ops[6], format: ops[7] },
                );
            }
            op::TYPE_ARRAY => {
                need(3)?;
                self.types.insert(ops[0], Type::Array { element: ops[1], length_id: ops[2] });
            }
            op::TYPE_STRUCT => {
                need(1)?;
                self.types.insert(ops[0], Type::Struct { members: ops[1..].to_vec() });
            }
            op::TYPE_POINTER => {
                need(3)?;
                self.types.insert(ops[0], Type::Pointer { pointee: ops[2] });
            }
            op::CONSTANT | op::SPEC_CONSTANT => {
                need(3)?;
                self.constants.insert(ops[1], ops[2]);
            }
            op::VARIABLE => {
                need(3)?;
                self.variables.push((ops[0], ops[1], ops[2]));
            }
            op::DECORATE => {
                need(2)?;
                match ops[1] {
                    DECORATION_BINDING | DECORATION_DESCRIPTOR_SET | DECORATION_ARRAY_STRIDE => {
                        need(3)?;
                        self.decorations.insert((ops[0], ops[1]), ops[2]);
                    }
                    flag => self.flags.entry(ops[0]).or_default().push(flag),
                }
            }
            op::MEMBER_DECORATE => {
                need(3)?;
                match ops[2] {
                    DECORATION_OFFSET => {
                        need(4)?;
                        self.member_offsets.insert((ops[0], ops[1]), ops[3]);
                    }
                    DECORATION_MATRIX_STRIDE => {
                        need(4)?;
                        self.matrix_strides.insert((ops[0], ops[1]), ops[3]);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn has_flag(&self, id: u32, flag: u32) -> bool {
        self.flags.get(&id).is_some_and(|f| f.contains(&flag))
    }

    /// Byte size of a type inside an explicitly laid out block
    fn size_of(&self, id: u32, matrix_stride: Option<u32>) -> Result<u32> {
        let ty = self
            .types
            .get(&id)
            .ok_or_else(|| ComputeError::Link(format!("Unknown SPIR-V type id {}", id)))?;

        Ok(match ty {
            Type::Scalar { width } => width / 8,
            Type::Vector { component, count } => self.size_of(*component, None)? * count,
            Type::Matrix { column, count } => match matrix_stride {
                Some(stride) => stride * count,
                None => self.size_of(*column, None)? * count,
            },
            Type::Array { element, length_id } => {
                let length = self.constants.get(length_id).copied().unwrap_or(0);
                match self.decorations.get(&(id, DECORATION_ARRAY_STRIDE)) {
                    Some(stride) => stride * length,
                    None => self.size_of(*element, None)? * length,
                }
            }
            Type::Struct { members } => {
                let mut end = 0;
                for (index, member) in members.iter().enumerate() {
                    let key = (id, index as u32);
                    let offset = self.member_offsets.get(&key).copied().unwrap_or(end);
                    let size = self.size_of(*member, self.matrix_strides.get(&key).copied())?;
                    end = end.max(offset + size);
                }
                end
            }
            Type::Image { .. } | Type::Pointer { .. } => 0,
        })
    }

    fn pointee(&self, pointer: u32) -> Option<u32> {
        match self.types.get(&pointer) {
            Some(Type::Pointer { pointee }) => Some(*pointee),
            _ => None,
        }
    }

    fn binding_kind(&self, storage: u32, pointee: u32) -> Option<BindingKind> {
        match (storage, self.types.get(&pointee)) {
            (STORAGE_STORAGE_BUFFER, _) => Some(BindingKind::StorageBuffer),
            (STORAGE_UNIFORM, _) if self.has_flag(pointee, DECORATION_BUFFER_BLOCK) => {
                Some(BindingKind::StorageBuffer)
            }
            (STORAGE_UNIFORM, _) if self.has_flag(pointee, DECORATION_BLOCK) => {
                Some(BindingKind::UniformBuffer)
            }
            (STORAGE_UNIFORM_CONSTANT, Some(Type::Image { dim, sampled: 2, format })) => {
                let dim = match dim {
                    1 => ImageDim::D2,
                    2 => ImageDim::D3,
                    _ => return None,
                };
                Some(BindingKind::StorageImage {
                    dim,
                    format: ImageFormat::from_spirv(*format),
                })
            }
            _ => None,
        }
    }

    fn interface(&self) -> Result<ProgramInterface> {
        let (entry_id, entry_point) = self
            .entry
            .clone()
            .ok_or_else(|| ComputeError::Link("No GLCompute entry point in module".to_string()))?;

        let local_size = match self.local_size.get(&entry_id) {
            Some((size, false)) => *size,
            Some((ids, true)) => {
                let mut size = [1u32; 3];
                for (slot, id) in size.iter_mut().zip(ids) {
                    *slot = self.constants.get(id).copied().unwrap_or(1);
                }
                size
            }
            None => [1, 1, 1],
        };

        let mut bindings = Vec::new();
        let mut push_constants = Vec::new();
        let mut push_constant_size = 0;

        for &(pointer, id, storage) in &self.variables {
            let Some(pointee) = self.pointee(pointer) else {
                continue;
            };

            if storage == STORAGE_PUSH_CONSTANT {
                if let Some(Type::Struct { members }) = self.types.get(&pointee) {
                    for (index, member) in members.iter().enumerate() {
                        let key = (pointee, index as u32);
                        let size = self.size_of(*member, self.matrix_strides.get(&key).copied())?;
                        let offset = self.member_offsets.get(&key).copied().unwrap_or(0);
                        let name = self
                            .member_names
                            .get(&key)
                            .cloned()
                            .unwrap_or_default();
                        push_constants.push(PushMember { name, offset, size });
                    }
                    push_constant_size = self.size_of(pointee, None)?;
                }
                continue;
            }

            if let Some(kind) = self.binding_kind(storage, pointee) {
                bindings.push(ReflectedBinding {
                    set: self
                        .decorations
                        .get(&(id, DECORATION_DESCRIPTOR_SET))
                        .copied()
                        .unwrap_or(0),
                    binding: self
                        .decorations
                        .get(&(id, DECORATION_BINDING))
                        .copied()
                        .unwrap_or(0),
                    kind,
                });
            }
        }

        bindings.sort_by_key(|b| (b.set, b.binding));

        if let Some(name) = self.names.get(&entry_id) {
            log::debug!("Reflected entry '{}' ({} bindings)", name, bindings.len());
        }

        Ok(ProgramInterface {
            entry_point,
            local_size,
            bindings,
            push_constants,
            push_constant_size,
        })
    }
}

/// Reflect a validated SPIR-V module.
pub fn reflect(words: &[u32]) -> Result<ProgramInterface> {
    if words.len() < 5 {
        return Err(ComputeError::Link("SPIR-V module has no header".to_string()));
    }
    Module::parse(words)?.interface()
}
