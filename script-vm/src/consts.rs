//! VM parameters

/// Default capacity of the constant pool, in value storages.
pub const DEFAULT_CONSTANT_CAPACITY: usize = 1024;

/// Default capacity of the instruction pool, in instruction words.
pub const DEFAULT_INSTRUCTION_CAPACITY: usize = 1024 * 1024;

/// Default register count of an execution context.
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// Name of the module registered by every virtual machine at construction.
pub const CORE_MODULE: &str = "Core";
