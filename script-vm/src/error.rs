//! Runtime, registration and parse error implementations

use crate::types::TypeId;

use thiserror::Error;

/// Runtime error variants surfaced by calls and the interpreter loop.
///
/// The interpreter returns the first failure immediately; the caller unwinds
/// the aborted frame and runs destructors for the registers introduced in it.
#[derive(Debug, Error, PartialEq)]
pub enum RuntimeError {
    /// The register stack is exhausted.
    #[error("register stack overflow")]
    StackOverflow,
    /// An operation required more registers than the stack holds.
    #[error("register stack underflow")]
    StackUnderflow,
    /// A frame-relative register index points outside the used stack.
    #[error("invalid register index {index}")]
    InvalidRegister {
        /// Absolute register index.
        index: usize,
    },
    /// A constant index points outside the constant pool.
    #[error("invalid constant index {index}")]
    InvalidConstant {
        /// Absolute constant pool index.
        index: usize,
    },
    /// The instruction pointer left the instruction pool.
    #[error("invalid instruction offset {offset}")]
    InvalidInstructionOffset {
        /// Offending instruction offset.
        offset: usize,
    },
    /// A pool word failed to decode.
    #[error(transparent)]
    InvalidInstruction(#[from] script_asm::InvalidInstruction),
    /// A null function handle was dispatched.
    #[error("called a null function handle")]
    NullFunctionCall,
    /// A native call popped a handle that is not a native function.
    #[error("expected a native function handle")]
    ExpectedNativeFunction,
    /// A script call popped a handle that is not a bytecode offset.
    #[error("expected a script function handle")]
    ExpectedScriptFunction,
    /// The base stack frame cannot be popped.
    #[error("attempted to pop the base stack frame")]
    BaseFramePop,
    /// A call supplied the wrong number of arguments or results.
    #[error("expected {expected} values, got {actual}")]
    ArityMismatch {
        /// Declared count.
        expected: usize,
        /// Supplied count.
        actual: usize,
    },
    /// A call argument does not match the declared input type.
    #[error("argument {index} has type {actual:?}, expected {expected:?}")]
    InvalidArgumentType {
        /// Zero-based argument index.
        index: usize,
        /// Declared input type.
        expected: TypeId,
        /// Supplied argument type.
        actual: TypeId,
    },
    /// The requested result type does not match the declared output type.
    #[error("result has type {actual:?}, expected {expected:?}")]
    InvalidResultType {
        /// Declared output type.
        expected: TypeId,
        /// Requested result type.
        actual: TypeId,
    },
    /// A property access named a property the type does not have.
    #[error("unknown property {name}")]
    UnknownProperty {
        /// Requested property name.
        name: String,
    },
    /// A property write supplied a value of the wrong type.
    #[error("property value has type {actual:?}, expected {expected:?}")]
    PropertyTypeMismatch {
        /// Declared property type.
        expected: TypeId,
        /// Supplied value type.
        actual: TypeId,
    },
    /// A type id failed lookup (stale or never registered).
    #[error("unknown type {0:?}")]
    UnknownType(TypeId),
    /// The type's memory layout has no construct function.
    #[error("type is not constructible")]
    NotConstructible,
    /// The type's memory layout has no copy function and is not trivial.
    #[error("type is not copyable")]
    NotCopyable,
    /// The operation requires a reference type.
    #[error("type is not a reference type")]
    NotAReferenceType,
    /// A destructor failed. This is fatal: the current execution is aborted.
    #[error("destructor failed: {0}")]
    DestructorFailed(#[source] Box<RuntimeError>),
}

/// Errors raised while registering modules, types and functions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// A module with the same name is already registered.
    #[error("module {0} is already registered")]
    DuplicateModule(String),
    /// The named module is not registered.
    #[error("unknown module {0}")]
    UnknownModule(String),
    /// The module already owns a function with this name.
    #[error("module {module} already has a function named {name}")]
    DuplicateFunction {
        /// Owning module.
        module: String,
        /// Colliding function name.
        name: String,
    },
    /// The module already owns a type with this name.
    #[error("module {module} already has a type named {name}")]
    DuplicateType {
        /// Owning module.
        module: String,
        /// Colliding type name.
        name: String,
    },
    /// A re-registration tried to change an immutable part of a description.
    #[error("incompatible redefinition of type {name}")]
    IncompatibleRedefinition {
        /// Name of the redefined type.
        name: String,
    },
    /// A type id failed lookup (stale or never registered).
    #[error("unknown type {0:?}")]
    UnknownType(TypeId),
    /// The instruction pool is full.
    #[error("instruction pool exhausted (capacity {capacity})")]
    InstructionPoolExhausted {
        /// Pool capacity in instruction words.
        capacity: usize,
    },
    /// The constant pool is full.
    #[error("constant pool exhausted (capacity {capacity})")]
    ConstantPoolExhausted {
        /// Pool capacity in value storages.
        capacity: usize,
    },
    /// The type registry ran out of ids.
    #[error("type id space exhausted")]
    TypeIdExhausted,
}

/// A single script parse error with a JSON-pointer path into the script.
///
/// Parsing never stops at the first error; the full list is returned so a
/// front-end can surface them all.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("{path}: {message}")]
pub struct ParseError {
    /// JSON-pointer path of the offending node.
    pub path: String,
    /// Human-readable message.
    pub message: String,
}

impl ParseError {
    /// Creates a parse error at `path`.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}
