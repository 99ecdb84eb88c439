//! Named callables

use crate::error::RuntimeError;
use crate::handle::{FunctionHandle, NativeFunction};
use crate::native::{IntoNativeFunction, NativeArguments, NativeResult};
use crate::types::TypeId;
use crate::value::Value;
use crate::vm::VirtualMachine;

use itertools::Itertools;
use script_asm::Instruction;

/// A named, typed input or output of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDeclaration {
    /// Declared name.
    pub name: String,
    /// Declared type.
    pub type_id: TypeId,
}

/// Body of a function description: a host function pointer or compiled
/// bytecode with its constants.
#[derive(Debug)]
pub enum FunctionDefinition {
    /// A native function.
    Native(NativeFunction),
    /// A script function awaiting interning.
    Script(ScriptFunctionDefinition),
}

/// Compiled body of a script function.
///
/// The instructions and constants are interned into the VM pools when the
/// description is registered; a `SetConstantBaseOffset` pointing at the
/// interned constants is prepended to the body.
#[derive(Debug)]
pub struct ScriptFunctionDefinition {
    /// Compiled body.
    pub instructions: Vec<Instruction>,
    /// Constants referenced by the body, in index order.
    pub constants: Vec<Value>,
}

/// Everything needed to register a function with a module.
#[derive(Debug)]
pub struct FunctionDescription {
    /// Function name, unique within the owning module.
    pub name: String,
    /// Declared inputs, in call order.
    pub inputs: Vec<ValueDeclaration>,
    /// Declared outputs, in result order.
    pub outputs: Vec<ValueDeclaration>,
    /// The callable body.
    pub definition: FunctionDefinition,
}

impl FunctionDescription {
    /// Describes a native function, deriving the input and output types from
    /// the callable's signature.
    ///
    /// `input_names` and `output_names` must match the signature's arity;
    /// the callable must be zero-sized (a `fn` item or non-capturing
    /// closure).
    pub fn for_native<F, Args, Output>(
        vm: &mut VirtualMachine,
        name: impl Into<String>,
        function: F,
        input_names: &[&str],
        output_names: &[&str],
    ) -> Self
    where
        F: IntoNativeFunction<Args, Output>,
    {
        let inputs = input_names
            .iter()
            .zip_eq(F::input_type_ids(vm))
            .map(|(name, type_id)| ValueDeclaration {
                name: (*name).to_owned(),
                type_id,
            })
            .collect();
        let outputs = output_names
            .iter()
            .zip_eq(F::output_type_ids(vm))
            .map(|(name, type_id)| ValueDeclaration {
                name: (*name).to_owned(),
                type_id,
            })
            .collect();

        Self {
            name: name.into(),
            inputs,
            outputs,
            definition: FunctionDefinition::Native(function.into_native_function()),
        }
    }
}

/// A registered function: name, declarations and the callable handle.
///
/// Functions are cheap to clone; clients clone them out of a module and call
/// them with the owning virtual machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    name: String,
    inputs: Vec<ValueDeclaration>,
    outputs: Vec<ValueDeclaration>,
    handle: FunctionHandle,
}

impl Function {
    pub(crate) fn new(
        name: String,
        inputs: Vec<ValueDeclaration>,
        outputs: Vec<ValueDeclaration>,
        handle: FunctionHandle,
    ) -> Self {
        Self {
            name,
            inputs,
            outputs,
            handle,
        }
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared inputs, in call order.
    pub fn inputs(&self) -> &[ValueDeclaration] {
        &self.inputs
    }

    /// Declared outputs, in result order.
    pub fn outputs(&self) -> &[ValueDeclaration] {
        &self.outputs
    }

    /// The dispatchable handle.
    pub const fn handle(&self) -> FunctionHandle {
        self.handle
    }

    /// Structural check: exact arity and type-id match, no coercions.
    pub fn is_callable_with(&self, type_ids: &[TypeId]) -> bool {
        self.inputs.len() == type_ids.len()
            && self
                .inputs
                .iter()
                .zip(type_ids)
                .all(|(input, type_id)| input.type_id == *type_id)
    }

    /// Calls the function on the VM's main execution context.
    ///
    /// Arguments and the requested result are checked against the declared
    /// inputs and outputs before dispatch. On failure the context is unwound
    /// to its state at entry.
    pub fn call<Args, R>(&self, vm: &mut VirtualMachine, arguments: Args) -> Result<R, RuntimeError>
    where
        Args: NativeArguments,
        R: NativeResult,
    {
        let argument_types = Args::type_ids(vm);
        if argument_types.len() != self.inputs.len() {
            return Err(RuntimeError::ArityMismatch {
                expected: self.inputs.len(),
                actual: argument_types.len(),
            });
        }
        for (index, (input, actual)) in
            self.inputs.iter().zip_eq(&argument_types).enumerate()
        {
            if input.type_id != *actual {
                return Err(RuntimeError::InvalidArgumentType {
                    index,
                    expected: input.type_id,
                    actual: *actual,
                });
            }
        }

        let result_types = R::type_ids(vm);
        if result_types.len() != self.outputs.len() {
            return Err(RuntimeError::ArityMismatch {
                expected: self.outputs.len(),
                actual: result_types.len(),
            });
        }
        if let (Some(output), Some(actual)) = (self.outputs.first(), result_types.first()) {
            if output.type_id != *actual {
                return Err(RuntimeError::InvalidResultType {
                    expected: output.type_id,
                    actual: *actual,
                });
            }
        }

        tracing::debug!(function = %self.name, "call");
        vm.call_handle::<Args, R>(self.handle, arguments)
    }
}
