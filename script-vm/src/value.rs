//! Typed values

use crate::context::ExecutionContext;
use crate::error::RuntimeError;
use crate::native::NativeValue;
use crate::pool::ProgramPool;
use crate::storage::ValueStorage;
use crate::types::{PropertyAccess, TypeId, TypeMemoryLayout};
use crate::vm::VirtualMachine;

use core::mem;

/// A typed value at the script boundary: a type id, a reference bit and the
/// storage carrying the payload.
///
/// Construction, copying and destruction go through the owning virtual
/// machine so that script-defined layout functions can run and fail; see
/// the drop notes on each method. A value is always left in a valid
/// (possibly empty) state after a failed operation.
#[derive(Debug)]
pub struct Value {
    type_id: TypeId,
    is_reference: bool,
    storage: ValueStorage,
}

impl Value {
    /// Creates an empty value.
    pub fn empty() -> Self {
        Self {
            type_id: TypeId::NONE,
            is_reference: false,
            storage: ValueStorage::new(),
        }
    }

    /// Constructs a value of the registered type in place.
    pub fn new(vm: &mut VirtualMachine, type_id: TypeId) -> Result<Self, RuntimeError> {
        let layout = vm
            .ty(type_id)
            .ok_or(RuntimeError::UnknownType(type_id))?
            .memory_layout()
            .clone();
        let mut storage = ValueStorage::new();
        let (_, pool, context) = vm.split();
        storage.construct(context, pool, &layout)?;
        Ok(Self {
            type_id,
            is_reference: false,
            storage,
        })
    }

    /// Wraps a native value, registering its type lazily if necessary.
    pub fn from_native<T: NativeValue>(vm: &mut VirtualMachine, value: T) -> Self {
        let type_id = vm.get_type_id::<T>();
        let mut storage = ValueStorage::new();
        storage.store(value);
        Self {
            type_id,
            is_reference: false,
            storage,
        }
    }

    /// Type id of the stored value; `TypeId::NONE` when empty.
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Whether the storage holds a reference representation instead of the
    /// value itself.
    pub const fn is_reference(&self) -> bool {
        self.is_reference
    }

    /// Whether the value is non-empty.
    pub const fn has_value(&self) -> bool {
        !self.type_id.is_none()
    }

    /// The underlying storage.
    pub fn storage(&self) -> &ValueStorage {
        &self.storage
    }

    pub(crate) fn take_storage(mut self) -> ValueStorage {
        mem::take(&mut self.storage)
    }

    pub(crate) fn from_parts(
        type_id: TypeId,
        is_reference: bool,
        storage: ValueStorage,
    ) -> Self {
        Self {
            type_id,
            is_reference,
            storage,
        }
    }

    /// Destroys the stored value, leaving the value empty.
    pub fn reset(&mut self, vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
        if self.has_value() {
            self.type_id = TypeId::NONE;
            self.is_reference = false;
            let (_, pool, context) = vm.split();
            self.storage.reset(context, pool)?;
        }
        Ok(())
    }

    /// Memory layout governing this value's storage: the reference
    /// representation's layout for reference values, the type's layout
    /// otherwise.
    fn storage_layout(&self, vm: &VirtualMachine) -> Result<TypeMemoryLayout, RuntimeError> {
        let ty = vm
            .ty(self.type_id)
            .ok_or(RuntimeError::UnknownType(self.type_id))?;
        if self.is_reference {
            let reference = ty
                .description()
                .reference
                .as_ref()
                .ok_or(RuntimeError::NotAReferenceType)?;
            Ok(reference.memory_layout.clone())
        } else {
            Ok(ty.memory_layout().clone())
        }
    }

    /// Copies this value into `other`.
    ///
    /// A destination of a different type (or reference-ness) is reset and
    /// reconstructed first.
    pub fn copy_to(&self, vm: &mut VirtualMachine, other: &mut Value) -> Result<(), RuntimeError> {
        let layout = self.storage_layout(vm)?;
        if other.type_id != self.type_id || other.is_reference != self.is_reference {
            other.reset(vm)?;
            let (_, pool, context) = vm.split();
            other.storage.construct(context, pool, &layout)?;
            other.type_id = self.type_id;
            other.is_reference = self.is_reference;
        }
        let (_, pool, context) = vm.split();
        ValueStorage::copy(context, pool, &layout, &mut other.storage, &self.storage)
    }

    /// Clones the value through its type's copy function.
    pub fn try_clone(&self, vm: &mut VirtualMachine) -> Result<Value, RuntimeError> {
        let mut clone = Value::empty();
        self.copy_to(vm, &mut clone)?;
        Ok(clone)
    }

    /// Pointer to the underlying object.
    ///
    /// For value types this is the storage's payload; for reference values
    /// the pointer is read through the reference descriptor's `get_pointer`.
    pub fn object_pointer(&self, vm: &mut VirtualMachine) -> Result<*mut u8, RuntimeError> {
        if !self.is_reference {
            return Ok(self.storage.value_pointer() as *mut u8);
        }
        let get_pointer = vm
            .ty(self.type_id)
            .ok_or(RuntimeError::UnknownType(self.type_id))?
            .description()
            .reference
            .as_ref()
            .ok_or(RuntimeError::NotAReferenceType)?
            .get_pointer;
        let representation = self.storage.value_pointer() as *mut u8;
        let (_, pool, context) = vm.split();
        context.call::<(*mut u8,), *mut u8>(pool, get_pointer, (representation,))
    }

    /// Reads the value as a native `T`.
    ///
    /// Fails unless `T`'s registered type id matches the value's.
    pub fn get<T: NativeValue + Clone>(&self, vm: &mut VirtualMachine) -> Result<T, RuntimeError> {
        let expected = vm.get_type_id::<T>();
        if self.type_id != expected {
            return Err(RuntimeError::InvalidResultType {
                expected,
                actual: self.type_id,
            });
        }
        let pointer = self.object_pointer(vm)?;
        // Safety: the type id check above guarantees the payload is a T.
        Ok(unsafe { (*pointer.cast::<T>()).clone() })
    }

    /// Creates a reference value aliasing this value's payload.
    ///
    /// Valid only for reference types.
    pub fn create_reference(&self, vm: &mut VirtualMachine) -> Result<Value, RuntimeError> {
        let reference = vm
            .ty(self.type_id)
            .ok_or(RuntimeError::UnknownType(self.type_id))?
            .description()
            .reference
            .clone()
            .ok_or(RuntimeError::NotAReferenceType)?;

        let payload = self.object_pointer(vm)?;
        let mut storage = ValueStorage::new();
        let (_, pool, context) = vm.split();
        storage.construct(context, pool, &reference.memory_layout)?;
        let representation = storage.value_pointer_mut();
        context.call::<(*mut u8, *mut u8), ()>(
            pool,
            reference.set_pointer,
            (representation, payload),
        )?;

        Ok(Self {
            type_id: self.type_id,
            is_reference: true,
            storage,
        })
    }

    /// Reads a property into a new value.
    pub fn get_property(
        &self,
        vm: &mut VirtualMachine,
        name: &str,
    ) -> Result<Value, RuntimeError> {
        let property = vm
            .ty(self.type_id)
            .ok_or(RuntimeError::UnknownType(self.type_id))?
            .property(name)
            .ok_or_else(|| RuntimeError::UnknownProperty {
                name: name.to_owned(),
            })?
            .clone();

        match property.access {
            PropertyAccess::Offset(offset) => {
                let object = self.object_pointer(vm)?;
                let layout = vm
                    .ty(property.type_id)
                    .ok_or(RuntimeError::UnknownType(property.type_id))?
                    .memory_layout()
                    .clone();
                let mut out = Value::new(vm, property.type_id)?;
                let source = object.wrapping_add(offset);
                if layout.is_trivial() {
                    // Safety: the property lives at `offset` inside the
                    // object and has `layout`'s size.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            source,
                            out.storage.value_pointer_mut(),
                            layout.size_in_bytes,
                        );
                    }
                } else {
                    let (_, pool, context) = vm.split();
                    let destination = out.storage.value_pointer_mut();
                    context.call::<(*mut u8, *mut u8), ()>(
                        pool,
                        layout.copy,
                        (destination, source),
                    )?;
                }
                Ok(out)
            }
            PropertyAccess::Functions { getter, .. } => {
                let object = self.object_pointer(vm)?;
                let (_, pool, context) = vm.split();
                context.call_dynamic(pool, getter, 1, 1, |context| {
                    context.push_value(object)
                })?;
                let storage = context.take_top_storage()?;
                Ok(Value::from_parts(property.type_id, false, storage))
            }
        }
    }

    /// Writes a property from another value.
    pub fn set_property(
        &mut self,
        vm: &mut VirtualMachine,
        name: &str,
        value: &Value,
    ) -> Result<(), RuntimeError> {
        let property = vm
            .ty(self.type_id)
            .ok_or(RuntimeError::UnknownType(self.type_id))?
            .property(name)
            .ok_or_else(|| RuntimeError::UnknownProperty {
                name: name.to_owned(),
            })?
            .clone();

        if value.type_id != property.type_id {
            return Err(RuntimeError::PropertyTypeMismatch {
                expected: property.type_id,
                actual: value.type_id,
            });
        }

        match property.access {
            PropertyAccess::Offset(offset) => {
                let object = self.object_pointer(vm)?;
                let layout = vm
                    .ty(property.type_id)
                    .ok_or(RuntimeError::UnknownType(property.type_id))?
                    .memory_layout()
                    .clone();
                let destination = object.wrapping_add(offset);
                if layout.is_trivial() {
                    // Safety: the property lives at `offset` inside the
                    // object and has `layout`'s size.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            value.storage.value_pointer(),
                            destination,
                            layout.size_in_bytes,
                        );
                    }
                    Ok(())
                } else {
                    let (_, pool, context) = vm.split();
                    let source = value.storage.value_pointer() as *mut u8;
                    context.call::<(*mut u8, *mut u8), ()>(
                        pool,
                        layout.copy,
                        (destination, source),
                    )
                }
            }
            PropertyAccess::Functions { setter, .. } => {
                let object = self.object_pointer(vm)?;
                let layout = vm
                    .ty(property.type_id)
                    .ok_or(RuntimeError::UnknownType(property.type_id))?
                    .memory_layout()
                    .clone();
                let (_, pool, context) = vm.split();
                context.call_dynamic(pool, setter, 2, 0, |context| {
                    context.push_value(object)?;
                    push_storage_copy(context, pool, &layout, &value.storage)
                })
            }
        }
    }
}

/// Pushes a copy of `source` onto the stack.
fn push_storage_copy(
    context: &mut ExecutionContext,
    pool: &ProgramPool,
    layout: &TypeMemoryLayout,
    source: &ValueStorage,
) -> Result<(), RuntimeError> {
    if layout.is_trivial() && layout.is_stored_inline() {
        context.push_uninitialized_value()?;
        ValueStorage::copy_trivially(context.top_mut(0)?, source);
        Ok(())
    } else {
        let mut storage = ValueStorage::new();
        storage.construct(context, pool, layout)?;
        if let Err(error) = ValueStorage::copy(context, pool, layout, &mut storage, source) {
            storage.reset(context, pool)?;
            return Err(error);
        }
        context.push_storage(storage)
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        use crate::handle::FunctionKind;

        match self.storage.destruct_function().kind() {
            // The storage's own drop frees any remaining allocation.
            FunctionKind::Null => {}
            FunctionKind::Native(_) => {
                let mut context = ExecutionContext::scratch();
                let pool = ProgramPool::empty();
                if let Err(error) = self.storage.reset(&mut context, &pool) {
                    tracing::error!(%error, "value destructor failed during drop");
                    self.storage.abandon();
                }
            }
            FunctionKind::Bytecode(_) => {
                tracing::error!(
                    "leaking a value with a script destructor; reset it through \
                     the virtual machine before dropping"
                );
                self.storage.abandon();
            }
        }
    }
}
