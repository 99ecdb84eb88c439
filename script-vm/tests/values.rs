use script_vm::native::{self, IntoNativeFunction, NativeValue};
use script_vm::prelude::*;

use quickcheck_macros::quickcheck;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
struct Vector3 {
    x: f64,
    y: f64,
    z: f64,
}

impl NativeValue for Vector3 {}

fn register_vector3(vm: &mut VirtualMachine) -> TypeId {
    vm.register_module("Game").unwrap();
    let number = vm.get_type_id::<f64>();
    let description = TypeDescription {
        name: "Vector3".to_owned(),
        module: None,
        base: TypeId::NONE,
        to_base: FunctionHandle::NULL,
        memory_layout: native::memory_layout::<Vector3>(),
        reference: None,
        properties: Vec::new(),
    }
    .with_offset_property("x", number, 0)
    .with_offset_property("y", number, 8)
    .with_offset_property("z", number, 16);

    vm.register_type_description(Some("Game"), description)
        .unwrap()
}

#[test]
fn property_reads_and_writes_go_through_offsets() {
    let mut vm = VirtualMachine::new();
    register_vector3(&mut vm);

    let mut vector = Value::from_native(
        &mut vm,
        Vector3 {
            x: 1.0,
            y: 2.0,
            z: 3.0,
        },
    );

    let y: f64 = vector.get_property(&mut vm, "y").unwrap().get(&mut vm).unwrap();
    assert_eq!(y, 2.0);

    let five = Value::from_native(&mut vm, 5.0f64);
    vector.set_property(&mut vm, "y", &five).unwrap();

    let y: f64 = vector.get_property(&mut vm, "y").unwrap().get(&mut vm).unwrap();
    assert_eq!(y, 5.0);

    let unknown = vector.get_property(&mut vm, "w");
    assert!(matches!(unknown, Err(RuntimeError::UnknownProperty { .. })));
}

#[test]
fn computed_properties_go_through_getter_and_setter() {
    let mut vm = VirtualMachine::new();
    vm.register_module("Game").unwrap();
    let number = vm.get_type_id::<f64>();

    let getter = (|object: *mut u8| -> f64 {
        // Safety: the property belongs to a Vector3 object.
        unsafe { (*object.cast::<Vector3>()).x * 10.0 }
    })
    .into_native_function();
    let setter = (|object: *mut u8, value: f64| {
        // Safety: the property belongs to a Vector3 object.
        unsafe { (*object.cast::<Vector3>()).x = value / 10.0 };
    })
    .into_native_function();

    let description = TypeDescription {
        name: "Vector3".to_owned(),
        module: None,
        base: TypeId::NONE,
        to_base: FunctionHandle::NULL,
        memory_layout: native::memory_layout::<Vector3>(),
        reference: None,
        properties: Vec::new(),
    }
    .with_computed_property(
        "scaled_x",
        number,
        FunctionHandle::from_native(getter),
        FunctionHandle::from_native(setter),
    );
    vm.register_type_description(Some("Game"), description)
        .unwrap();

    let mut vector = Value::from_native(
        &mut vm,
        Vector3 {
            x: 4.0,
            y: 0.0,
            z: 0.0,
        },
    );

    let scaled: f64 = vector
        .get_property(&mut vm, "scaled_x")
        .unwrap()
        .get(&mut vm)
        .unwrap();
    assert_eq!(scaled, 40.0);

    let replacement = Value::from_native(&mut vm, 90.0f64);
    vector.set_property(&mut vm, "scaled_x", &replacement).unwrap();
    let x: f64 = vector.get(&mut vm).map(|v: Vector3| v.x).unwrap();
    assert_eq!(x, 9.0);
}

#[test]
fn values_round_trip_through_copies() {
    let mut vm = VirtualMachine::new();
    register_vector3(&mut vm);

    let original = Vector3 {
        x: 1.5,
        y: -2.5,
        z: 1e9,
    };
    let value = Value::from_native(&mut vm, original);
    let clone = value.try_clone(&mut vm).unwrap();
    drop(value);

    assert_eq!(clone.get::<Vector3>(&mut vm).unwrap(), original);
}

#[test]
fn inline_and_heap_values_behave_identically() {
    let mut vm = VirtualMachine::new();

    // f64 fits the storage slot; String does not and needs drop.
    let number = Value::from_native(&mut vm, 42.0f64);
    assert!(!number.storage().has_allocated_storage());
    let number_clone = number.try_clone(&mut vm).unwrap();
    assert_eq!(number_clone.get::<f64>(&mut vm).unwrap(), 42.0);

    let text = Value::from_native(&mut vm, String::from("forty-two"));
    assert!(text.storage().has_allocated_storage());
    let text_clone = text.try_clone(&mut vm).unwrap();
    assert_eq!(text_clone.get::<String>(&mut vm).unwrap(), "forty-two");
}

#[test]
fn reset_clears_destructor_and_allocation() {
    let mut vm = VirtualMachine::new();

    let mut value = Value::from_native(&mut vm, String::from("transient"));
    assert!(!value.storage().destruct_function().is_null());
    assert!(value.storage().has_allocated_storage());

    value.reset(&mut vm).unwrap();
    assert!(value.storage().destruct_function().is_null());
    assert!(!value.storage().has_allocated_storage());
    assert!(!value.has_value());
}

#[derive(Debug, Clone, Default, PartialEq)]
#[repr(C)]
struct Counter {
    value: f64,
}

impl NativeValue for Counter {}

#[derive(Clone, Copy)]
struct CounterRef(*mut Counter);

impl Default for CounterRef {
    fn default() -> Self {
        Self(core::ptr::null_mut())
    }
}

fn register_counter(vm: &mut VirtualMachine) -> TypeId {
    vm.register_module("Game").unwrap();
    let number = vm.get_type_id::<f64>();

    let get_pointer = (|representation: *mut u8| -> *mut u8 {
        // Safety: the representation storage holds a CounterRef.
        unsafe { (*representation.cast::<CounterRef>()).0.cast() }
    })
    .into_native_function();
    let set_pointer = (|representation: *mut u8, payload: *mut u8| {
        // Safety: the representation storage holds a CounterRef.
        unsafe { (*representation.cast::<CounterRef>()).0 = payload.cast() };
    })
    .into_native_function();

    let description = TypeDescription {
        name: "Counter".to_owned(),
        module: None,
        base: TypeId::NONE,
        to_base: FunctionHandle::NULL,
        memory_layout: native::memory_layout::<Counter>(),
        reference: Some(ReferenceDescription {
            memory_layout: native::memory_layout::<CounterRef>(),
            get_pointer: FunctionHandle::from_native(get_pointer),
            set_pointer: FunctionHandle::from_native(set_pointer),
        }),
        properties: Vec::new(),
    }
    .with_offset_property("value", number, 0);

    vm.register_type_description(Some("Game"), description)
        .unwrap()
}

#[test]
fn references_observe_mutations_of_the_referenced_value() {
    let mut vm = VirtualMachine::new();
    register_counter(&mut vm);

    let mut counter = Value::from_native(&mut vm, Counter { value: 1.0 });
    let reference = counter.create_reference(&mut vm).unwrap();
    assert!(reference.is_reference());

    let seven = Value::from_native(&mut vm, 7.0f64);
    counter.set_property(&mut vm, "value", &seven).unwrap();

    let observed: f64 = reference
        .get_property(&mut vm, "value")
        .unwrap()
        .get(&mut vm)
        .unwrap();
    assert_eq!(observed, 7.0);
}

#[test]
fn storage_reset_leaves_no_destructor_behind() {
    let mut context = ExecutionContext::new(8);
    let pool = ProgramPool::new(0, 0);

    let mut storage = ValueStorage::new();
    storage.store(String::from("reset me"));
    assert!(!storage.destruct_function().is_null());

    storage.reset(&mut context, &pool).unwrap();
    assert!(storage.destruct_function().is_null());
    assert!(!storage.has_allocated_storage());
}

#[quickcheck]
fn number_values_round_trip(value: f64) -> bool {
    let mut vm = VirtualMachine::new();
    let wrapped = Value::from_native(&mut vm, value);
    let read = wrapped.get::<f64>(&mut vm).unwrap();
    read == value || (read.is_nan() && value.is_nan())
}

#[quickcheck]
fn string_values_round_trip(value: String) -> bool {
    let mut vm = VirtualMachine::new();
    let wrapped = Value::from_native(&mut vm, value.clone());
    let clone = wrapped.try_clone(&mut vm).unwrap();
    clone.get::<String>(&mut vm).unwrap() == value
}
