//! Native type and function binding
//!
//! Host callables become [`NativeFunction`]s through [`IntoNativeFunction`]:
//! a monomorphized trampoline pops the declared inputs from the stack in
//! declared order, invokes the callable and pushes the result. The callable
//! must be zero-sized (a `fn` item or a non-capturing closure) so the
//! trampoline can reconstruct it instead of capturing it.

use crate::context::ExecutionContext;
use crate::error::RuntimeError;
use crate::handle::{FunctionHandle, NativeFunction};
use crate::types::{TypeId, TypeMemoryLayout};
use crate::vm::VirtualMachine;

use core::any::TypeId as NativeTypeId;
use core::mem;

/// Marker for types that cross the native boundary through stack registers.
///
/// Implement it for host types that should be usable as native function
/// arguments and results; the blanket impls cover raw pointers.
pub trait NativeValue: Sized + 'static {}

impl NativeValue for bool {}
impl NativeValue for f32 {}
impl NativeValue for f64 {}
impl NativeValue for i32 {}
impl NativeValue for i64 {}
impl NativeValue for u32 {}
impl NativeValue for u64 {}
impl NativeValue for usize {}
impl NativeValue for String {}
impl NativeValue for FunctionHandle {}
impl<T: 'static> NativeValue for *const T {}
impl<T: 'static> NativeValue for *mut T {}

/// Result of a native function: either `()` or a single stack value.
pub trait NativeResult: Sized + 'static {
    /// Number of stack values the result occupies.
    const COUNT: usize;

    /// Pushes the result onto the stack.
    fn push_results(self, context: &mut ExecutionContext) -> Result<(), RuntimeError>;

    /// Pops the result off the stack.
    fn take_results(context: &mut ExecutionContext) -> Result<Self, RuntimeError>;

    /// Type ids of the result values.
    fn type_ids(vm: &mut VirtualMachine) -> Vec<TypeId>;
}

impl NativeResult for () {
    const COUNT: usize = 0;

    fn push_results(self, _context: &mut ExecutionContext) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn take_results(_context: &mut ExecutionContext) -> Result<Self, RuntimeError> {
        Ok(())
    }

    fn type_ids(_vm: &mut VirtualMachine) -> Vec<TypeId> {
        Vec::new()
    }
}

impl<T: NativeValue> NativeResult for T {
    const COUNT: usize = 1;

    fn push_results(self, context: &mut ExecutionContext) -> Result<(), RuntimeError> {
        context.push_value(self)
    }

    fn take_results(context: &mut ExecutionContext) -> Result<Self, RuntimeError> {
        // Safety: the callee left a value of this declared type on top.
        unsafe { context.pop_value::<T>() }
    }

    fn type_ids(vm: &mut VirtualMachine) -> Vec<TypeId> {
        vec![vm.get_type_id::<T>()]
    }
}

/// A tuple of native call arguments, pushed in declared order.
pub trait NativeArguments: 'static {
    /// Number of arguments in the tuple.
    const COUNT: usize;

    /// Pushes the arguments onto the stack in declared order.
    fn push_arguments(self, context: &mut ExecutionContext) -> Result<(), RuntimeError>;

    /// Type ids of the arguments in declared order.
    fn type_ids(vm: &mut VirtualMachine) -> Vec<TypeId>;
}

/// Adapter turning a zero-sized host callable into a [`NativeFunction`].
pub trait IntoNativeFunction<Args, Output> {
    /// Number of inputs the produced function pops.
    const INPUT_COUNT: usize;

    /// Number of outputs the produced function pushes.
    const OUTPUT_COUNT: usize;

    /// Produces the trampoline function pointer.
    ///
    /// Panics if the callable is not zero-sized (it captures state).
    fn into_native_function(self) -> NativeFunction;

    /// Type ids of the inputs in declared order.
    fn input_type_ids(vm: &mut VirtualMachine) -> Vec<TypeId>;

    /// Type ids of the outputs.
    fn output_type_ids(vm: &mut VirtualMachine) -> Vec<TypeId>;
}

/// Materializes a zero-sized callable.
///
/// # Safety
///
/// `F` must be zero-sized and inhabited; such a type has exactly one value
/// and no bytes, so reading it out of uninitialized memory is sound.
unsafe fn conjure<F>() -> F {
    debug_assert_eq!(mem::size_of::<F>(), 0);
    unsafe { mem::MaybeUninit::<F>::uninit().assume_init() }
}

/// Pops values in reverse declared order so the last argument comes off the
/// top of the stack first.
macro_rules! pop_in_reverse {
    ($context:expr;) => {};
    ($context:expr; $head_ty:ident $head:ident $(, $tail_ty:ident $tail:ident)*) => {
        pop_in_reverse!($context; $($tail_ty $tail),*);
        // Safety: the caller pushed a value of this declared type.
        let $head = unsafe { $context.pop_value::<$head_ty>() }?;
    };
}

macro_rules! impl_native_call {
    ($($arg_ty:ident $arg:ident),*) => {
        impl<$($arg_ty: NativeValue),*> NativeArguments for ($($arg_ty,)*) {
            const COUNT: usize = impl_native_call!(@count $($arg_ty)*);

            #[allow(unused_variables, non_snake_case)]
            fn push_arguments(
                self,
                context: &mut ExecutionContext,
            ) -> Result<(), RuntimeError> {
                let ($($arg,)*) = self;
                $(context.push_value($arg)?;)*
                Ok(())
            }

            #[allow(unused_variables)]
            fn type_ids(vm: &mut VirtualMachine) -> Vec<TypeId> {
                vec![$(vm.get_type_id::<$arg_ty>()),*]
            }
        }

        impl<F, $($arg_ty,)* R> IntoNativeFunction<($($arg_ty,)*), R> for F
        where
            F: Fn($($arg_ty),*) -> R + Copy + 'static,
            $($arg_ty: NativeValue,)*
            R: NativeResult,
        {
            const INPUT_COUNT: usize = impl_native_call!(@count $($arg_ty)*);
            const OUTPUT_COUNT: usize = R::COUNT;

            fn into_native_function(self) -> NativeFunction {
                assert_eq!(
                    mem::size_of::<F>(),
                    0,
                    "native functions must not capture state"
                );
                mem::forget(self);

                |context: &mut ExecutionContext| -> Result<(), RuntimeError> {
                    // Safety: `F` is zero-sized (checked above) and inhabited.
                    let function = unsafe { conjure::<F>() };
                    pop_in_reverse!(context; $($arg_ty $arg),*);
                    function($($arg),*).push_results(context)
                }
            }

            fn input_type_ids(vm: &mut VirtualMachine) -> Vec<TypeId> {
                <($($arg_ty,)*) as NativeArguments>::type_ids(vm)
            }

            fn output_type_ids(vm: &mut VirtualMachine) -> Vec<TypeId> {
                R::type_ids(vm)
            }
        }
    };
    (@count) => { 0 };
    (@count $head:ident $($tail:ident)*) => { 1 + impl_native_call!(@count $($tail)*) };
}

impl_native_call!();
impl_native_call!(A1 a1);
impl_native_call!(A1 a1, A2 a2);
impl_native_call!(A1 a1, A2 a2, A3 a3);
impl_native_call!(A1 a1, A2 a2, A3 a3, A4 a4);
impl_native_call!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
impl_native_call!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);
impl_native_call!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7);
impl_native_call!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7, A8 a8);

/// Construct function of a native type: default-constructs `T` into the
/// popped pointer.
pub(crate) fn construct_native<T: Default + 'static>(
    context: &mut ExecutionContext,
) -> Result<(), RuntimeError> {
    // Safety: construct functions are called with a pointer argument.
    let pointer = unsafe { context.pop_value::<*mut u8>() }?;
    // Safety: the pointer addresses uninitialized memory of T's layout.
    unsafe { pointer.cast::<T>().write(T::default()) };
    Ok(())
}

/// Copy function of a native type: clones the source into the destination,
/// both initialized.
pub(crate) fn copy_native<T: Clone + 'static>(
    context: &mut ExecutionContext,
) -> Result<(), RuntimeError> {
    // Safety: copy functions are called with (destination, source) pointers.
    let source = unsafe { context.pop_value::<*mut u8>() }?;
    let destination = unsafe { context.pop_value::<*mut u8>() }?;
    // Safety: both pointers address initialized values of T.
    unsafe { *destination.cast::<T>() = (*source.cast::<T>()).clone() };
    Ok(())
}

/// Destruct function of a native type.
pub(crate) fn destruct_native<T: 'static>(
    context: &mut ExecutionContext,
) -> Result<(), RuntimeError> {
    // Safety: destruct functions are called with a pointer argument.
    let pointer = unsafe { context.pop_value::<*mut u8>() }?;
    // Safety: the pointer addresses an initialized value of T.
    unsafe { pointer.cast::<T>().drop_in_place() };
    Ok(())
}

fn destruct_handle<T: 'static>() -> FunctionHandle {
    if mem::needs_drop::<T>() {
        FunctionHandle::from_native(destruct_native::<T>)
    } else {
        FunctionHandle::NULL
    }
}

/// Full memory layout of a native type: constructible, copyable, with a
/// destruct function when `T` needs drop.
pub fn memory_layout<T: Default + Clone + 'static>() -> TypeMemoryLayout {
    TypeMemoryLayout {
        native_type_id: Some(NativeTypeId::of::<T>()),
        is_constructible: true,
        is_copyable: true,
        alignment_in_bytes: mem::align_of::<T>(),
        size_in_bytes: mem::size_of::<T>(),
        construct: FunctionHandle::from_native(construct_native::<T>),
        copy: FunctionHandle::from_native(copy_native::<T>),
        destruct: destruct_handle::<T>(),
    }
}

/// Minimal layout of a native type whose construct and copy behavior is
/// unknown; used for lazily registered anonymous entries.
pub fn minimal_memory_layout<T: 'static>() -> TypeMemoryLayout {
    TypeMemoryLayout {
        native_type_id: Some(NativeTypeId::of::<T>()),
        is_constructible: false,
        is_copyable: !mem::needs_drop::<T>(),
        alignment_in_bytes: mem::align_of::<T>(),
        size_in_bytes: mem::size_of::<T>(),
        construct: FunctionHandle::NULL,
        copy: FunctionHandle::NULL,
        destruct: destruct_handle::<T>(),
    }
}
