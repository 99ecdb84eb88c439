use strum::{EnumCount, FromRepr};

/// Opcode byte of a packed instruction word.
///
/// Every opcode occupies the most significant byte of its word; the remaining
/// 24 bits carry the opcode-specific fields documented on
/// [`Instruction`](crate::Instruction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, FromRepr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Opcode {
    /// Terminates the current interpret loop.
    Halt = 0x00,
    /// Pushes uninitialized registers.
    Push = 0x01,
    /// Destructs and removes registers from the top of the stack.
    Pop = 0x02,
    /// Removes destructor-free registers from the top of the stack.
    PopTrivial = 0x03,
    /// Pushes a trivial copy of a constant.
    PushTrivialConstant = 0x04,
    /// Pushes a trivial copy of a frame-relative register.
    PushTrivialStackValue = 0x05,
    /// Pops the top register into a frame-relative register.
    AssignTrivialStackValue = 0x06,
    /// Adjusts the pointer stored in a frame-relative register.
    OffsetAddress = 0x07,
    /// Pops a native function handle and invokes it.
    CallNativeFunction = 0x08,
    /// Pops a bytecode handle, pushes a stack frame and jumps to it.
    CallScriptFunction = 0x09,
    /// Subtracts two number registers.
    SubtractNumbers = 0x0a,
    /// Multiplies two number registers.
    MultiplyNumbers = 0x0b,
    /// Compares two number registers.
    IsNumberGreater = 0x0c,
    /// Unconditional relative jump.
    Jump = 0x0d,
    /// Pops a boolean and jumps if it is true.
    JumpIfTrue = 0x0e,
    /// Pops a boolean and jumps if it is false.
    JumpIfFalse = 0x0f,
    /// Constructs the top register's inline storage.
    ConstructInlineValue = 0x10,
    /// Allocates storage for the top register and constructs it.
    ConstructValue = 0x11,
    /// Pushes a stack frame marker at the current stack top.
    PushExecutionState = 0x12,
    /// Sets the constant pool base offset.
    SetConstantBaseOffset = 0x13,
    /// Pops the current stack frame, preserving its output registers.
    Return = 0x14,
}

impl Opcode {
    /// Byte representation of the opcode.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}
