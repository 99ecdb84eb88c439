//! Interned instruction and constant pools

use crate::error::{RegistrationError, RuntimeError};
use crate::storage::ValueStorage;
use crate::value::Value;

use script_asm::{Instruction, RawInstruction};

/// Append-only instruction and constant pools of a virtual machine.
///
/// Capacities are fixed at construction; `insert_*` return offsets that are
/// stable for the VM's lifetime. Lookups during interpretation require no
/// locking because the pools are only appended to from the host thread.
pub struct ProgramPool {
    instructions: Vec<RawInstruction>,
    constants: Vec<ValueStorage>,
    instruction_capacity: usize,
    constant_capacity: usize,
}

impl ProgramPool {
    /// Creates empty pools with the given fixed capacities.
    pub fn new(instruction_capacity: usize, constant_capacity: usize) -> Self {
        Self {
            instructions: Vec::with_capacity(instruction_capacity),
            constants: Vec::with_capacity(constant_capacity),
            instruction_capacity,
            constant_capacity,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Interns the instructions and returns the offset of the first.
    pub fn insert_instructions(
        &mut self,
        instructions: &[Instruction],
    ) -> Result<usize, RegistrationError> {
        if self.instructions.len() + instructions.len() > self.instruction_capacity {
            return Err(RegistrationError::InstructionPoolExhausted {
                capacity: self.instruction_capacity,
            });
        }
        let offset = self.instructions.len();
        self.instructions
            .extend(instructions.iter().map(|instruction| instruction.encode()));
        Ok(offset)
    }

    /// Interns the constants and returns the offset of the first.
    ///
    /// The values' storages are moved into the pool; destruction happens when
    /// the owning virtual machine is dropped.
    pub fn insert_constants(
        &mut self,
        constants: Vec<Value>,
    ) -> Result<usize, RegistrationError> {
        if self.constants.len() + constants.len() > self.constant_capacity {
            return Err(RegistrationError::ConstantPoolExhausted {
                capacity: self.constant_capacity,
            });
        }
        let offset = self.constants.len();
        self.constants
            .extend(constants.into_iter().map(Value::take_storage));
        Ok(offset)
    }

    /// Reads one instruction word.
    pub fn instruction(&self, offset: usize) -> Result<RawInstruction, RuntimeError> {
        self.instructions
            .get(offset)
            .copied()
            .ok_or(RuntimeError::InvalidInstructionOffset { offset })
    }

    /// Reads one constant storage.
    pub fn constant(&self, index: usize) -> Result<&ValueStorage, RuntimeError> {
        self.constants
            .get(index)
            .ok_or(RuntimeError::InvalidConstant { index })
    }

    /// Number of interned instruction words.
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Number of interned constants.
    pub fn constant_count(&self) -> usize {
        self.constants.len()
    }

    pub(crate) fn take_constants(&mut self) -> Vec<ValueStorage> {
        core::mem::take(&mut self.constants)
    }
}
