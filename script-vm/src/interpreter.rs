//! Bytecode interpret loop

use crate::context::ExecutionContext;
use crate::error::RuntimeError;
use crate::handle::{FunctionHandle, FunctionKind};
use crate::pool::ProgramPool;
use crate::storage::ValueStorage;

use script_asm::Instruction;

use core::mem;

impl ExecutionContext {
    /// Interprets instructions starting at `offset` until a `Halt`, or until
    /// a `Return` pops a frame with no recorded return pc.
    ///
    /// Failures propagate out through the call chain; the caller is
    /// responsible for unwinding (see [`ExecutionContext::call`]).
    pub fn execute(&mut self, pool: &ProgramPool, offset: usize) -> Result<(), RuntimeError> {
        let mut pc = offset;
        loop {
            let instruction = Instruction::decode(pool.instruction(pc)?)?;
            tracing::trace!(pc, ?instruction, "execute");
            pc += 1;

            match instruction {
                Instruction::Halt => return Ok(()),
                Instruction::Push { count } => {
                    self.push_uninitialized_values(count as usize)?;
                }
                Instruction::Pop { count } => {
                    self.pop_values(count as usize, pool)?;
                }
                Instruction::PopTrivial { count } => {
                    self.pop_trivial_values(count as usize)?;
                }
                Instruction::PushTrivialConstant { constant } => {
                    let index = self.constant_base_offset() + constant as usize;
                    self.push_uninitialized_value()?;
                    let source = pool.constant(index)?;
                    ValueStorage::copy_trivially(self.top_mut(0)?, source);
                }
                Instruction::PushTrivialStackValue { stack_index } => {
                    let source = self.frame_register_index(stack_index as usize)?;
                    self.push_uninitialized_value()?;
                    self.copy_register_trivially(source, self.used_register_count() - 1);
                }
                Instruction::AssignTrivialStackValue { stack_index } => {
                    let destination = self.frame_register_index(stack_index as usize)?;
                    let source = self
                        .used_register_count()
                        .checked_sub(1)
                        .ok_or(RuntimeError::StackUnderflow)?;
                    if destination != source {
                        self.copy_register_trivially(source, destination);
                    }
                    self.pop_trivial_values(1)?;
                }
                Instruction::OffsetAddress { register, offset } => {
                    let index = self.frame_register_index(register as usize)?;
                    // Safety: the register holds a pointer pushed for
                    // property or layout-function access.
                    let pointer = unsafe { self.register_mut(index).as_mut::<*mut u8>() };
                    *pointer = pointer.wrapping_add(offset as usize);
                }
                Instruction::CallNativeFunction { input_count } => {
                    // Safety: the compiler pushes the callee handle last.
                    let handle = unsafe { self.pop_value::<FunctionHandle>() }?;
                    let function = match handle.kind() {
                        FunctionKind::Native(function) => function,
                        FunctionKind::Null => return Err(RuntimeError::NullFunctionCall),
                        FunctionKind::Bytecode(_) => {
                            return Err(RuntimeError::ExpectedNativeFunction)
                        }
                    };
                    if (input_count as usize) > self.used_register_count() {
                        return Err(RuntimeError::StackUnderflow);
                    }
                    function(self)?;
                }
                Instruction::CallScriptFunction {
                    input_count,
                    output_count,
                } => {
                    // Safety: the compiler pushes the callee handle last.
                    let handle = unsafe { self.pop_value::<FunctionHandle>() }?;
                    let target = match handle.kind() {
                        FunctionKind::Bytecode(target) => target,
                        FunctionKind::Null => return Err(RuntimeError::NullFunctionCall),
                        FunctionKind::Native(_) => {
                            return Err(RuntimeError::ExpectedScriptFunction)
                        }
                    };
                    let register_offset = self
                        .used_register_count()
                        .checked_sub(input_count as usize + output_count as usize)
                        .ok_or(RuntimeError::StackUnderflow)?;
                    self.push_stack_frame_at(register_offset, Some(pc));
                    pc = target;
                }
                Instruction::SubtractNumbers {
                    result,
                    first,
                    second,
                } => self.number_operation(result, first, second, |a, b| a - b)?,
                Instruction::MultiplyNumbers {
                    result,
                    first,
                    second,
                } => self.number_operation(result, first, second, |a, b| a * b)?,
                Instruction::IsNumberGreater {
                    result,
                    first,
                    second,
                } => self.number_comparison(result, first, second, |a, b| a > b)?,
                Instruction::Jump { offset } => {
                    pc = relative_jump(pc, offset)?;
                }
                Instruction::JumpIfTrue { offset } => {
                    if self.pop_boolean()? {
                        pc = relative_jump(pc, offset)?;
                    }
                }
                Instruction::JumpIfFalse { offset } => {
                    if !self.pop_boolean()? {
                        pc = relative_jump(pc, offset)?;
                    }
                }
                Instruction::ConstructInlineValue => {
                    self.construct_top(pool, None)?;
                }
                Instruction::ConstructValue { alignment, size } => {
                    self.construct_top(pool, Some((alignment as usize, size as usize)))?;
                }
                Instruction::PushExecutionState => {
                    self.push_stack_frame();
                }
                Instruction::SetConstantBaseOffset { base_offset } => {
                    self.set_constant_base_offset(base_offset as usize);
                }
                Instruction::Return { output_count } => {
                    match self.return_from_frame(pool, output_count as usize)? {
                        Some(return_pc) => pc = return_pc,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Pops the current frame, destructing every register above its first
    /// `output_count` registers, and restores the caller's state.
    fn return_from_frame(
        &mut self,
        pool: &ProgramPool,
        output_count: usize,
    ) -> Result<Option<usize>, RuntimeError> {
        if self.frame_depth() == 1 {
            return Err(RuntimeError::BaseFramePop);
        }
        let keep = self.current_frame().register_offset + output_count;
        let excess = self
            .used_register_count()
            .checked_sub(keep)
            .ok_or(RuntimeError::StackUnderflow)?;
        self.pop_values(excess, pool)?;
        let frame = self.pop_frame()?;
        self.set_constant_base_offset(frame.saved_constant_base);
        Ok(frame.return_pc)
    }

    /// Pops two handle constants and constructs the register below them.
    ///
    /// Stack on entry: `[..., target, destruct handle, construct handle]`.
    /// With a layout operand the target allocates heap storage first.
    fn construct_top(
        &mut self,
        pool: &ProgramPool,
        heap_layout: Option<(usize, usize)>,
    ) -> Result<(), RuntimeError> {
        // Safety: the compiler pushes the two layout handles on top.
        let construct = unsafe { self.pop_value::<FunctionHandle>() }?;
        let destruct = unsafe { self.pop_value::<FunctionHandle>() }?;

        let target = self
            .used_register_count()
            .checked_sub(1)
            .ok_or(RuntimeError::StackUnderflow)?;
        let mut storage = mem::take(self.register_mut(target));
        let pointer = match heap_layout {
            Some((alignment, size)) => storage.allocate(alignment, size),
            None => storage.data_mut(),
        };

        let result = self
            .push_value(pointer)
            .and_then(|()| self.invoke_pushed(pool, construct, 1, 0));
        match result {
            Ok(()) => {
                storage.set_destruct_function(destruct);
                *self.register_mut(target) = storage;
                Ok(())
            }
            Err(error) => {
                if storage.has_allocated_storage() {
                    storage.deallocate();
                }
                *self.register_mut(target) = storage;
                Err(error)
            }
        }
    }

    fn number_operation(
        &mut self,
        result: u8,
        first: u8,
        second: u8,
        operation: fn(f64, f64) -> f64,
    ) -> Result<(), RuntimeError> {
        let (a, b) = self.number_operands(first, second)?;
        let destination = self.frame_register_index(result as usize)?;
        self.register_mut(destination).write_trivial(operation(a, b));
        Ok(())
    }

    fn number_comparison(
        &mut self,
        result: u8,
        first: u8,
        second: u8,
        comparison: fn(f64, f64) -> bool,
    ) -> Result<(), RuntimeError> {
        let (a, b) = self.number_operands(first, second)?;
        let destination = self.frame_register_index(result as usize)?;
        self.register_mut(destination)
            .write_trivial(comparison(a, b));
        Ok(())
    }

    fn number_operands(&self, first: u8, second: u8) -> Result<(f64, f64), RuntimeError> {
        let first = self.frame_register_index(first as usize)?;
        let second = self.frame_register_index(second as usize)?;
        // Safety: number instructions are only emitted for number registers.
        let a = unsafe { *self.register(first).as_ref::<f64>() };
        let b = unsafe { *self.register(second).as_ref::<f64>() };
        Ok((a, b))
    }

    fn pop_boolean(&mut self) -> Result<bool, RuntimeError> {
        // Safety: conditions are compiled with a boolean result type.
        unsafe { self.pop_value::<bool>() }
    }

    fn copy_register_trivially(&mut self, source: usize, destination: usize) {
        debug_assert_ne!(source, destination);
        let registers = self.registers_mut();
        if source < destination {
            let (low, high) = registers.split_at_mut(destination);
            ValueStorage::copy_trivially(&mut high[0], &low[source]);
        } else {
            let (low, high) = registers.split_at_mut(source);
            ValueStorage::copy_trivially(&mut low[destination], &high[0]);
        }
    }
}

fn relative_jump(pc: usize, offset: i32) -> Result<usize, RuntimeError> {
    pc.checked_add_signed(offset as isize)
        .ok_or(RuntimeError::InvalidInstructionOffset { offset: pc })
}

#[cfg(test)]
mod tests {
    use crate::value::Value;
    use crate::vm::VirtualMachine;

    use script_asm::Instruction;

    fn run(vm: &mut VirtualMachine, instructions: &[Instruction]) {
        let offset = vm.insert_instructions(instructions).unwrap();
        vm.execute(offset).unwrap();
    }

    fn number_register(vm: &VirtualMachine, index: usize) -> f64 {
        // Safety: the test program left a number in this register.
        unsafe { *vm.main_execution_context().registers()[index].as_ref::<f64>() }
    }

    #[test]
    fn arithmetic_operates_on_frame_registers() {
        let mut vm = VirtualMachine::new();
        let constants = vec![
            Value::from_native(&mut vm, 10.0f64),
            Value::from_native(&mut vm, 4.0f64),
        ];
        let base = vm.insert_constants(constants).unwrap();

        run(
            &mut vm,
            &[
                Instruction::SetConstantBaseOffset {
                    base_offset: base as u32,
                },
                Instruction::PushTrivialConstant { constant: 0 },
                Instruction::PushTrivialConstant { constant: 1 },
                Instruction::Push { count: 2 },
                Instruction::SubtractNumbers {
                    result: 2,
                    first: 0,
                    second: 1,
                },
                Instruction::MultiplyNumbers {
                    result: 3,
                    first: 2,
                    second: 2,
                },
                Instruction::Halt,
            ],
        );

        assert_eq!(number_register(&vm, 2), 6.0);
        assert_eq!(number_register(&vm, 3), 36.0);
    }

    #[test]
    fn comparisons_write_booleans() {
        let mut vm = VirtualMachine::new();
        let constants = vec![
            Value::from_native(&mut vm, 2.0f64),
            Value::from_native(&mut vm, 3.0f64),
        ];
        let base = vm.insert_constants(constants).unwrap();

        run(
            &mut vm,
            &[
                Instruction::SetConstantBaseOffset {
                    base_offset: base as u32,
                },
                Instruction::PushTrivialConstant { constant: 0 },
                Instruction::PushTrivialConstant { constant: 1 },
                Instruction::Push { count: 1 },
                Instruction::IsNumberGreater {
                    result: 2,
                    first: 1,
                    second: 0,
                },
                Instruction::Halt,
            ],
        );

        let greater = unsafe {
            *vm.main_execution_context().registers()[2].as_ref::<bool>()
        };
        assert!(greater);
    }

    #[test]
    fn conditional_jumps_pop_their_condition() {
        let mut vm = VirtualMachine::new();
        let constants = vec![
            Value::from_native(&mut vm, true),
            Value::from_native(&mut vm, 1.0f64),
            Value::from_native(&mut vm, 2.0f64),
        ];
        let base = vm.insert_constants(constants).unwrap();

        run(
            &mut vm,
            &[
                Instruction::SetConstantBaseOffset {
                    base_offset: base as u32,
                },
                Instruction::PushTrivialConstant { constant: 0 },
                Instruction::JumpIfTrue { offset: 2 },
                Instruction::PushTrivialConstant { constant: 1 },
                Instruction::Halt,
                Instruction::PushTrivialConstant { constant: 2 },
                Instruction::Halt,
            ],
        );

        assert_eq!(vm.main_execution_context().used_register_count(), 1);
        assert_eq!(number_register(&vm, 0), 2.0);
    }

    #[test]
    fn backward_jumps_loop() {
        let mut vm = VirtualMachine::new();
        let constants = vec![
            Value::from_native(&mut vm, 3.0f64),
            Value::from_native(&mut vm, 1.0f64),
            Value::from_native(&mut vm, 0.0f64),
        ];
        let base = vm.insert_constants(constants).unwrap();

        // Counts register 0 down to zero with a header-checked loop.
        run(
            &mut vm,
            &[
                Instruction::SetConstantBaseOffset {
                    base_offset: base as u32,
                },
                Instruction::PushTrivialConstant { constant: 0 },
                Instruction::PushTrivialConstant { constant: 1 },
                Instruction::PushTrivialConstant { constant: 2 },
                // header
                Instruction::Push { count: 1 },
                Instruction::IsNumberGreater {
                    result: 3,
                    first: 0,
                    second: 2,
                },
                Instruction::JumpIfFalse { offset: 2 },
                Instruction::SubtractNumbers {
                    result: 0,
                    first: 0,
                    second: 1,
                },
                Instruction::Jump { offset: -5 },
                Instruction::Halt,
            ],
        );

        assert_eq!(number_register(&vm, 0), 0.0);
    }

    #[test]
    fn push_execution_state_frames_are_popped_by_return() {
        let mut vm = VirtualMachine::new();

        run(
            &mut vm,
            &[
                Instruction::PushExecutionState,
                Instruction::Push { count: 3 },
                Instruction::Return { output_count: 0 },
            ],
        );

        assert_eq!(vm.main_execution_context().used_register_count(), 0);
        assert_eq!(vm.main_execution_context().current_frame().register_offset, 0);
    }

    #[test]
    fn halt_terminates_without_unwinding() {
        let mut vm = VirtualMachine::new();

        run(
            &mut vm,
            &[
                Instruction::Push { count: 2 },
                Instruction::PopTrivial { count: 1 },
                Instruction::Halt,
                Instruction::Push { count: 5 },
            ],
        );

        assert_eq!(vm.main_execution_context().used_register_count(), 1);
    }
}
