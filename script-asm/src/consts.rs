//! Bit widths and masks of the packed instruction fields.

/// Bits reserved for the opcode.
pub const OPCODE_BITS: u32 = 8;

/// Bit position of the opcode within a raw word.
pub const OPCODE_OFFSET: u32 = 32 - OPCODE_BITS;

/// Bits available for opcode-specific fields.
pub const PAYLOAD_BITS: u32 = 32 - OPCODE_BITS;

/// Mask covering the payload field.
pub const PAYLOAD_MASK: u32 = (1 << PAYLOAD_BITS) - 1;

/// Bits of a register-count or stack/constant-index operand.
pub const COUNT_BITS: u32 = 24;

/// Bits of a frame-relative register index in three-register operations.
pub const REGISTER_INDEX_BITS: u32 = 8;

/// Bits of the byte offset of an `OffsetAddress` instruction.
pub const ADDRESS_OFFSET_BITS: u32 = 16;

/// Bits of the alignment operand of a `ConstructValue` instruction.
pub const TYPE_ALIGNMENT_BITS: u32 = 8;

/// Bits of the size operand of a `ConstructValue` instruction.
pub const TYPE_SIZE_BITS: u32 = 16;

/// Bits of a signed jump offset.
pub const JUMP_OFFSET_BITS: u32 = 24;

/// Bits of the input count of a `CallScriptFunction` instruction.
pub const CALL_INPUT_BITS: u32 = 12;

/// Bits of the output count of a `CallScriptFunction` instruction.
pub const CALL_OUTPUT_BITS: u32 = 12;

/// Bits of the output count of a `Return` instruction.
pub const OUTPUT_COUNT_BITS: u32 = 8;
