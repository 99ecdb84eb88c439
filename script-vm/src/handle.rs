//! Tagged function handles

use crate::context::ExecutionContext;
use crate::error::RuntimeError;

use core::fmt;

/// Signature of a native function.
///
/// A native function pops its declared inputs from the top of the stack in
/// reverse order and pushes its outputs.
pub type NativeFunction = fn(&mut ExecutionContext) -> Result<(), RuntimeError>;

const TAG_MASK: usize = 0b11;
const BYTECODE_TAG: usize = 0b10;

/// A compact, one-word function handle.
///
/// The word is either all zero (null, "no function"), a native function
/// pointer (low two bits zero by pointer alignment), or a bytecode offset
/// shifted left by two with the bytecode tag in bit 1. Bit 0 is always zero;
/// value storages reuse it as their allocated-storage flag. The bit layout is
/// internal; [`FunctionHandle::kind`] exposes the handle as a sum type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle {
    bits: usize,
}

/// Decoded view of a [`FunctionHandle`].
#[derive(Clone, Copy)]
pub enum FunctionKind {
    /// No function.
    Null,
    /// A host function pointer.
    Native(NativeFunction),
    /// An offset into the VM instruction pool.
    Bytecode(usize),
}

impl FunctionHandle {
    /// The null handle, used as "no destructor".
    pub const NULL: Self = Self { bits: 0 };

    /// Wraps a native function pointer.
    pub fn from_native(function: NativeFunction) -> Self {
        let bits = function as usize;
        // Bit 0 is the storage allocated flag, bit 1 the bytecode tag.
        assert_eq!(
            bits & TAG_MASK,
            0,
            "native function pointers must be four-byte aligned"
        );
        Self { bits }
    }

    /// Wraps an offset into the VM instruction pool.
    pub const fn from_bytecode_offset(offset: usize) -> Self {
        Self {
            bits: (offset << 2) | BYTECODE_TAG,
        }
    }

    /// Returns true for the null handle.
    pub const fn is_null(self) -> bool {
        self.bits == 0
    }

    /// Decodes the handle tag.
    pub fn kind(self) -> FunctionKind {
        if self.bits == 0 {
            FunctionKind::Null
        } else if self.bits & TAG_MASK == BYTECODE_TAG {
            FunctionKind::Bytecode(self.bits >> 2)
        } else {
            // Safety: the bits were produced by `from_native`; function and
            // data pointers share representation on supported targets.
            FunctionKind::Native(unsafe {
                core::mem::transmute::<usize, NativeFunction>(self.bits)
            })
        }
    }

    pub(crate) const fn to_bits(self) -> usize {
        self.bits
    }

    pub(crate) const fn from_bits(bits: usize) -> Self {
        Self { bits }
    }
}

impl Default for FunctionHandle {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            FunctionKind::Null => write!(f, "FunctionHandle::Null"),
            FunctionKind::Native(function) => {
                write!(f, "FunctionHandle::Native({:p})", function as *const ())
            }
            FunctionKind::Bytecode(offset) => {
                write!(f, "FunctionHandle::Bytecode({offset})")
            }
        }
    }
}
