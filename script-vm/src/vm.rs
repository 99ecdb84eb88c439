//! Virtual machine root

use crate::consts::*;
use crate::context::ExecutionContext;
use crate::error::{RegistrationError, RuntimeError};
use crate::function::{Function, FunctionDefinition, FunctionDescription};
use crate::handle::FunctionHandle;
use crate::module::Module;
use crate::native::{self, IntoNativeFunction, NativeArguments, NativeResult};
use crate::parser::{ParsedTypeDefinition, SynthesizedFunction};
use crate::pool::ProgramPool;
use crate::registry::TypeRegistry;
use crate::types::{Type, TypeDescription, TypeId};
use crate::value::Value;

use script_asm::Instruction;

use core::any::TypeId as NativeTypeId;

/// Construction parameters of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmParameters {
    /// Capacity of the constant pool, in value storages.
    pub constant_capacity: usize,
    /// Capacity of the instruction pool, in instruction words.
    pub instruction_capacity: usize,
    /// Register count of the main execution context.
    pub stack_size: usize,
}

impl Default for VmParameters {
    fn default() -> Self {
        Self {
            constant_capacity: DEFAULT_CONSTANT_CAPACITY,
            instruction_capacity: DEFAULT_INSTRUCTION_CAPACITY,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Root of the scripting runtime.
///
/// Owns the type registry, the interned instruction and constant pools, the
/// registered modules and the main execution context. Pools and registry are
/// append-only during interpretation; modules are mutated only from the host
/// thread.
pub struct VirtualMachine {
    registry: TypeRegistry,
    pool: ProgramPool,
    modules: Vec<Module>,
    main_context: ExecutionContext,
}

impl VirtualMachine {
    /// Creates a virtual machine with default parameters and the `Core`
    /// module (`Number`, `Boolean`, `String`, number intrinsics) registered.
    pub fn new() -> Self {
        Self::with_parameters(VmParameters::default())
    }

    /// Creates a virtual machine with explicit parameters.
    pub fn with_parameters(parameters: VmParameters) -> Self {
        let mut vm = Self {
            registry: TypeRegistry::new(),
            pool: ProgramPool::new(parameters.instruction_capacity, parameters.constant_capacity),
            modules: Vec::new(),
            main_context: ExecutionContext::new(parameters.stack_size),
        };
        vm.register_core()
            .expect("failed to register the core module");
        vm
    }

    fn register_core(&mut self) -> Result<(), RegistrationError> {
        self.register_module(CORE_MODULE)?;
        self.register_type::<f64>("Number", CORE_MODULE)?;
        self.register_type::<bool>("Boolean", CORE_MODULE)?;
        self.register_type::<String>("String", CORE_MODULE)?;

        let multiply = FunctionDescription::for_native(
            self,
            "Multiply",
            |first: f64, second: f64| first * second,
            &["first", "second"],
            &["product"],
        );
        self.register_function(CORE_MODULE, multiply)?;

        let subtract = FunctionDescription::for_native(
            self,
            "Subtract",
            |first: f64, second: f64| first - second,
            &["first", "second"],
            &["difference"],
        );
        self.register_function(CORE_MODULE, subtract)?;

        let is_greater = FunctionDescription::for_native(
            self,
            "IsGreater",
            |first: f64, second: f64| first > second,
            &["first", "second"],
            &["result"],
        );
        self.register_function(CORE_MODULE, is_greater)?;

        Ok(())
    }

    /// Registers an empty module.
    pub fn register_module(&mut self, name: &str) -> Result<&Module, RegistrationError> {
        if self.get_module(name).is_some() {
            return Err(RegistrationError::DuplicateModule(name.to_owned()));
        }
        tracing::debug!(module = name, "registered module");
        self.modules.push(Module::new(name.to_owned()));
        Ok(self.modules.last().expect("just pushed"))
    }

    /// Removes a module and deregisters all types it introduced.
    ///
    /// Instructions and constants interned for the module's functions remain
    /// in the append-only pools.
    pub fn deregister_module(&mut self, name: &str) -> Result<(), RegistrationError> {
        let index = self
            .module_index(name)
            .ok_or_else(|| RegistrationError::UnknownModule(name.to_owned()))?;
        let module = self.modules.remove(index);
        for type_id in module.types() {
            if let Err(error) = self.registry.deregister(*type_id) {
                tracing::warn!(%error, "stale type while deregistering module");
            }
        }
        Ok(())
    }

    /// Looks up a module by name.
    pub fn get_module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|module| module.name() == name)
    }

    fn module_index(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|module| module.name() == name)
    }

    /// Id of the native type `T`, registering an anonymous entry on first
    /// use. Idempotent: repeated calls return the same id.
    pub fn get_type_id<T: 'static>(&mut self) -> TypeId {
        if let Some(id) = self.registry.get_id_for_native(NativeTypeId::of::<T>()) {
            return id;
        }
        let description = TypeDescription {
            name: String::new(),
            module: None,
            base: TypeId::NONE,
            to_base: FunctionHandle::NULL,
            memory_layout: native::minimal_memory_layout::<T>(),
            reference: None,
            properties: Vec::new(),
        };
        self.registry
            .register(description)
            .expect("type registry exhausted")
    }

    /// Registers a native type with a composed layout: constructible via
    /// `T::default`, copyable via `T::clone`, destructible when `T` needs
    /// drop.
    pub fn register_type<T: Default + Clone + 'static>(
        &mut self,
        name: &str,
        module: &str,
    ) -> Result<TypeId, RegistrationError> {
        self.register_type_description(Some(module), native_description::<T>(name))
    }

    /// Registers a native type derived from `Base`.
    ///
    /// `to_base` adjusts a `T` pointer to a `Base` pointer; pass the identity
    /// when the base shares the address.
    pub fn register_type_with_base<T, Base, F>(
        &mut self,
        name: &str,
        module: &str,
        to_base: F,
    ) -> Result<TypeId, RegistrationError>
    where
        T: Default + Clone + 'static,
        Base: 'static,
        F: IntoNativeFunction<(*mut u8,), *mut u8>,
    {
        let base = self.get_type_id::<Base>();
        let mut description = native_description::<T>(name);
        description.base = base;
        description.to_base = FunctionHandle::from_native(to_base.into_native_function());
        self.register_type_description(Some(module), description)
    }

    /// Registers a full type description, attributing it to a module.
    pub fn register_type_description(
        &mut self,
        module: Option<&str>,
        mut description: TypeDescription,
    ) -> Result<TypeId, RegistrationError> {
        if let Some(module_name) = module {
            let module_ref = self
                .get_module(module_name)
                .ok_or_else(|| RegistrationError::UnknownModule(module_name.to_owned()))?;
            if !description.name.is_empty() {
                let duplicate = module_ref
                    .types()
                    .iter()
                    .filter_map(|id| self.registry.get(*id))
                    .any(|ty| ty.name() == description.name);
                if duplicate {
                    return Err(RegistrationError::DuplicateType {
                        module: module_name.to_owned(),
                        name: description.name,
                    });
                }
            }
            description.module = Some(module_name.to_owned());
        }

        let name = description.name.clone();
        let id = self.registry.register(description)?;
        tracing::debug!(?id, %name, "registered type");
        if let Some(module_name) = module {
            let index = self.module_index(module_name).expect("checked above");
            if !self.modules[index].owns_type(id) {
                self.modules[index].add_type(id);
            }
        }
        Ok(id)
    }

    /// Deregisters a type; its registry slot is recycled under a new version
    /// so outstanding ids fail lookup.
    ///
    /// Deregistering a type referenced by a live value is not checked;
    /// clients must drain such values first.
    pub fn deregister_type(&mut self, type_id: TypeId) -> Result<(), RegistrationError> {
        let module_name = self
            .registry
            .get(type_id)
            .and_then(|ty| ty.module().map(str::to_owned));
        self.registry.deregister(type_id)?;
        if let Some(name) = module_name {
            if let Some(index) = self.module_index(&name) {
                self.modules[index].remove_type(type_id);
            }
        }
        Ok(())
    }

    /// Looks up a type by id. Stale ids (deregistered, possibly recycled)
    /// return `None`.
    pub fn ty(&self, id: TypeId) -> Option<&Type> {
        self.registry.get(id)
    }

    /// Resolves a `"Module.Name"` or bare `"Name"` type reference.
    pub fn find_type(&self, reference: &str) -> Option<&Type> {
        match reference.split_once('.') {
            Some((module, name)) => {
                let module = self.get_module(module)?;
                module
                    .types()
                    .iter()
                    .filter_map(|id| self.registry.get(*id))
                    .find(|ty| ty.name() == name)
            }
            None => self.registry.iter().find(|ty| ty.name() == reference),
        }
    }

    /// Resolves a `"Module.Name"` or bare `"Name"` function reference.
    pub fn find_function(&self, reference: &str) -> Option<&Function> {
        match reference.split_once('.') {
            Some((module, name)) => self.get_module(module)?.function(name),
            None => self
                .modules
                .iter()
                .find_map(|module| module.function(reference)),
        }
    }

    /// Walks the base chain; reflexive and transitive.
    pub fn is_derived_from(&self, derived: TypeId, base: TypeId) -> bool {
        self.registry.is_derived_from(derived, base)
    }

    /// Composes `to_base` adjustments along the chain from `derived` to
    /// `base`. Returns `None` when the chain does not reach `base` or an
    /// adjustment fails.
    pub fn cast_to_base(
        &mut self,
        derived: TypeId,
        base: TypeId,
        pointer: *mut u8,
    ) -> Option<*mut u8> {
        let mut pointer = pointer;
        let mut current = derived;
        loop {
            if current == base {
                return Some(pointer);
            }
            let ty = self.ty(current)?;
            let to_base = ty.description().to_base;
            let next = ty.base();
            if next.is_none() {
                return None;
            }
            if !to_base.is_null() {
                let (_, pool, context) = self.split();
                pointer = context
                    .call::<(*mut u8,), *mut u8>(pool, to_base, (pointer,))
                    .ok()?;
            }
            current = next;
        }
    }

    /// Registers a function with a module.
    ///
    /// Script definitions are interned: the constants move into the constant
    /// pool, a `SetConstantBaseOffset` is prepended and the body moves into
    /// the instruction pool.
    pub fn register_function(
        &mut self,
        module: &str,
        description: FunctionDescription,
    ) -> Result<Function, RegistrationError> {
        let index = self
            .module_index(module)
            .ok_or_else(|| RegistrationError::UnknownModule(module.to_owned()))?;
        if self.modules[index].function(&description.name).is_some() {
            return Err(RegistrationError::DuplicateFunction {
                module: module.to_owned(),
                name: description.name,
            });
        }

        let handle = match description.definition {
            FunctionDefinition::Native(function) => FunctionHandle::from_native(function),
            FunctionDefinition::Script(definition) => {
                self.intern_script_body(definition.instructions, definition.constants)?
            }
        };

        let function = Function::new(
            description.name,
            description.inputs,
            description.outputs,
            handle,
        );
        tracing::debug!(module, function = %function.name(), ?handle, "registered function");
        self.modules[index].add_function(function.clone());
        Ok(function)
    }

    /// Registers a parsed script type: interns its synthesized construct,
    /// copy and destruct functions and registers the composed description.
    pub fn register_script_type(
        &mut self,
        module: &str,
        parsed: ParsedTypeDefinition,
    ) -> Result<TypeId, RegistrationError> {
        let construct = self.intern_synthesized(Some(parsed.construct))?;
        let copy = self.intern_synthesized(parsed.copy)?;
        let destruct = self.intern_synthesized(parsed.destruct)?;

        let description = TypeDescription {
            name: parsed.name,
            module: None,
            base: TypeId::NONE,
            to_base: FunctionHandle::NULL,
            memory_layout: crate::types::TypeMemoryLayout {
                native_type_id: None,
                is_constructible: !construct.is_null(),
                is_copyable: parsed.is_copyable,
                alignment_in_bytes: parsed.alignment_in_bytes,
                size_in_bytes: parsed.size_in_bytes,
                construct,
                copy,
                destruct,
            },
            reference: None,
            properties: parsed.properties,
        };
        self.register_type_description(Some(module), description)
    }

    fn intern_synthesized(
        &mut self,
        function: Option<SynthesizedFunction>,
    ) -> Result<FunctionHandle, RegistrationError> {
        match function {
            Some(function) => {
                self.intern_script_body(function.instructions, function.constants)
            }
            None => Ok(FunctionHandle::NULL),
        }
    }

    fn intern_script_body(
        &mut self,
        body: Vec<Instruction>,
        constants: Vec<Value>,
    ) -> Result<FunctionHandle, RegistrationError> {
        let constants_offset = self.pool.insert_constants(constants)?;
        let mut instructions = Vec::with_capacity(body.len() + 1);
        instructions.push(Instruction::SetConstantBaseOffset {
            base_offset: constants_offset as u32,
        });
        instructions.extend(body);
        let offset = self.pool.insert_instructions(&instructions)?;
        Ok(FunctionHandle::from_bytecode_offset(offset))
    }

    /// Interns instructions; returns the offset of the first word.
    pub fn insert_instructions(
        &mut self,
        instructions: &[Instruction],
    ) -> Result<usize, RegistrationError> {
        self.pool.insert_instructions(instructions)
    }

    /// Interns constants; returns the offset of the first storage.
    pub fn insert_constants(&mut self, constants: Vec<Value>) -> Result<usize, RegistrationError> {
        self.pool.insert_constants(constants)
    }

    /// The instruction and constant pools.
    pub fn pool(&self) -> &ProgramPool {
        &self.pool
    }

    /// The main execution context.
    pub fn main_execution_context(&self) -> &ExecutionContext {
        &self.main_context
    }

    /// Runs the interpret loop at `offset` on the main execution context.
    pub fn execute(&mut self, offset: usize) -> Result<(), RuntimeError> {
        let (_, pool, context) = self.split();
        context.execute(pool, offset)
    }

    /// Calls a handle on the main execution context.
    pub(crate) fn call_handle<Args, R>(
        &mut self,
        handle: FunctionHandle,
        arguments: Args,
    ) -> Result<R, RuntimeError>
    where
        Args: NativeArguments,
        R: NativeResult,
    {
        let (_, pool, context) = self.split();
        context.call::<Args, R>(pool, handle, arguments)
    }

    pub(crate) fn split(&mut self) -> (&TypeRegistry, &ProgramPool, &mut ExecutionContext) {
        (&self.registry, &self.pool, &mut self.main_context)
    }
}

fn native_description<T: Default + Clone + 'static>(name: &str) -> TypeDescription {
    TypeDescription {
        name: name.to_owned(),
        module: None,
        base: TypeId::NONE,
        to_base: FunctionHandle::NULL,
        memory_layout: native::memory_layout::<T>(),
        reference: None,
        properties: Vec::new(),
    }
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_core_module_is_registered_at_construction() {
        let vm = VirtualMachine::new();
        let core = vm.get_module(CORE_MODULE).expect("core module exists");

        assert!(core.function("Multiply").is_some());
        assert!(core.function("Subtract").is_some());
        assert!(core.function("IsGreater").is_some());
        assert!(vm.find_type("Core.Number").is_some());
        assert!(vm.find_type("Core.Boolean").is_some());
        assert!(vm.find_type("Core.String").is_some());
    }

    #[test]
    fn module_names_are_unique() {
        let mut vm = VirtualMachine::new();
        vm.register_module("Game").unwrap();

        assert_eq!(
            vm.register_module("Game"),
            Err(RegistrationError::DuplicateModule("Game".to_owned()))
        );
    }

    #[test]
    fn function_names_are_unique_per_module() {
        let mut vm = VirtualMachine::new();
        vm.register_module("Game").unwrap();

        let first =
            FunctionDescription::for_native(&mut vm, "Id", |x: f64| x, &["x"], &["x"]);
        vm.register_function("Game", first).unwrap();

        let second =
            FunctionDescription::for_native(&mut vm, "Id", |x: f64| x, &["x"], &["x"]);
        assert!(matches!(
            vm.register_function("Game", second),
            Err(RegistrationError::DuplicateFunction { .. })
        ));
    }

    #[test]
    fn type_ids_are_stable_per_native_type() {
        let mut vm = VirtualMachine::new();

        assert_eq!(vm.get_type_id::<f64>(), vm.get_type_id::<f64>());
        assert_ne!(vm.get_type_id::<f64>(), vm.get_type_id::<u32>());
    }

    #[test]
    fn named_registration_upgrades_a_lazy_entry() {
        let mut vm = VirtualMachine::new();
        vm.register_module("Game").unwrap();

        #[derive(Debug, Clone, Default)]
        struct Marker;

        let anonymous = vm.get_type_id::<Marker>();
        let named = vm.register_type::<Marker>("Marker", "Game").unwrap();

        assert_eq!(anonymous, named);
        assert_eq!(vm.ty(named).unwrap().reference_string(), "Game.Marker");
    }

    #[test]
    fn deregistering_a_module_invalidates_its_type_ids() {
        let mut vm = VirtualMachine::new();
        vm.register_module("Game").unwrap();

        #[derive(Debug, Clone, Default)]
        struct Transient;

        let type_id = vm.register_type::<Transient>("Transient", "Game").unwrap();
        assert!(vm.ty(type_id).is_some());

        vm.deregister_module("Game").unwrap();
        assert!(vm.ty(type_id).is_none());
        assert!(vm.find_type("Game.Transient").is_none());
    }

    #[test]
    fn base_chains_compose_pointer_adjustments() {
        #[derive(Debug, Clone, Copy, Default)]
        #[repr(C)]
        struct Base {
            tag: u64,
        }

        #[derive(Debug, Clone, Copy, Default)]
        #[repr(C)]
        struct Derived {
            padding: u64,
            base: Base,
        }

        let mut vm = VirtualMachine::new();
        vm.register_module("Game").unwrap();

        let base = vm.register_type::<Base>("Base", "Game").unwrap();
        let derived = vm
            .register_type_with_base::<Derived, Base, _>("Derived", "Game", |pointer: *mut u8| {
                pointer.wrapping_add(core::mem::offset_of!(Derived, base))
            })
            .unwrap();

        assert!(vm.is_derived_from(derived, base));
        assert!(vm.is_derived_from(derived, derived));
        assert!(!vm.is_derived_from(base, derived));

        let mut object = Derived {
            padding: 0,
            base: Base { tag: 7 },
        };
        let pointer = (&mut object as *mut Derived).cast::<u8>();
        let adjusted = vm.cast_to_base(derived, base, pointer).unwrap();
        let tag = unsafe { (*adjusted.cast::<Base>()).tag };
        assert_eq!(tag, 7);
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        let used = self.main_context.used_register_count();
        if used > 0 {
            let (_, pool, context) = (&self.registry, &self.pool, &mut self.main_context);
            if let Err(error) = context.pop_values(used, pool) {
                tracing::error!(%error, "failed to drain the register stack");
            }
        }

        // Constants are detached first so their destructors can still read
        // the instruction pool.
        let mut constants = self.pool.take_constants();
        for storage in &mut constants {
            let (_, pool, context) = (&self.registry, &self.pool, &mut self.main_context);
            if let Err(error) = storage.reset(context, pool) {
                tracing::error!(%error, "failed to destruct a constant");
                storage.abandon();
            }
        }
    }
}
