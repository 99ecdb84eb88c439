//! Sparse, versioned type registry

use crate::error::RegistrationError;
use crate::handle::FunctionHandle;
use crate::types::{Type, TypeDescription, TypeId, TypeMemoryLayout};

use core::any::TypeId as NativeTypeId;
use std::collections::HashMap;

struct TypeSlot {
    version: u32,
    ty: Option<Type>,
}

/// Registry of all types known to a virtual machine.
///
/// Slots are reusable: deregistering a type bumps the slot version, so ids
/// issued before the reuse fail lookup. Slot 0 is reserved for the *none*
/// type.
pub(crate) struct TypeRegistry {
    slots: Vec<TypeSlot>,
    free: Vec<u32>,
    native: HashMap<NativeTypeId, TypeId>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let none = Type::new(
            TypeId::NONE,
            TypeDescription {
                name: "None".to_owned(),
                module: None,
                base: TypeId::NONE,
                to_base: FunctionHandle::NULL,
                memory_layout: TypeMemoryLayout {
                    native_type_id: Some(NativeTypeId::of::<()>()),
                    is_constructible: false,
                    is_copyable: false,
                    alignment_in_bytes: 1,
                    size_in_bytes: 0,
                    construct: FunctionHandle::NULL,
                    copy: FunctionHandle::NULL,
                    destruct: FunctionHandle::NULL,
                },
                reference: None,
                properties: Vec::new(),
            },
        );

        let mut native = HashMap::new();
        native.insert(NativeTypeId::of::<()>(), TypeId::NONE);

        Self {
            slots: vec![TypeSlot {
                version: 0,
                ty: Some(none),
            }],
            free: Vec::new(),
            native,
        }
    }

    pub fn get(&self, id: TypeId) -> Option<&Type> {
        let slot = self.slots.get(id.index())?;
        (slot.version == id.version()).then(|| slot.ty.as_ref()).flatten()
    }

    pub fn get_mut(&mut self, id: TypeId) -> Option<&mut Type> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.version == id.version() {
            slot.ty.as_mut()
        } else {
            None
        }
    }

    pub fn get_id_for_native(&self, native_type_id: NativeTypeId) -> Option<TypeId> {
        self.native.get(&native_type_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Type> {
        self.slots.iter().filter_map(|slot| slot.ty.as_ref())
    }

    /// Registers a description, reusing the entry of a previously registered
    /// type with the same native fingerprint.
    pub fn register(
        &mut self,
        description: TypeDescription,
    ) -> Result<TypeId, RegistrationError> {
        if let Some(id) = description
            .memory_layout
            .native_type_id
            .and_then(|native| self.get_id_for_native(native))
        {
            let ty = self
                .get_mut(id)
                .ok_or(RegistrationError::UnknownType(id))?;
            ty.update_description(description)?;
            return Ok(id);
        }

        let native_type_id = description.memory_layout.native_type_id;
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let id = TypeId::new(index, slot.version);
                slot.ty = Some(Type::new(id, description));
                id
            }
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| RegistrationError::TypeIdExhausted)?;
                let id = TypeId::new(index, 0);
                self.slots.push(TypeSlot {
                    version: 0,
                    ty: Some(Type::new(id, description)),
                });
                id
            }
        };
        if let Some(native_type_id) = native_type_id {
            self.native.insert(native_type_id, id);
        }
        Ok(id)
    }

    /// Removes a type and recycles its slot under a new version.
    pub fn deregister(&mut self, id: TypeId) -> Result<(), RegistrationError> {
        if id.is_none() {
            return Err(RegistrationError::UnknownType(id));
        }
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.version == id.version() && slot.ty.is_some())
            .ok_or(RegistrationError::UnknownType(id))?;

        let ty = slot.ty.take().expect("slot checked above");
        slot.version = slot.version.wrapping_add(1);
        self.free.push(id.index() as u32);
        if let Some(native_type_id) = ty.memory_layout().native_type_id {
            self.native.remove(&native_type_id);
        }
        Ok(())
    }

    /// Walks the base chain; reflexive and transitive.
    pub fn is_derived_from(&self, derived: TypeId, base: TypeId) -> bool {
        let mut current = derived;
        loop {
            if current == base {
                return true;
            }
            match self.get(current) {
                Some(ty) if !ty.base().is_none() => current = ty.base(),
                _ => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native;

    fn description(name: &str) -> TypeDescription {
        TypeDescription {
            name: name.to_owned(),
            module: None,
            base: TypeId::NONE,
            to_base: FunctionHandle::NULL,
            memory_layout: native::memory_layout::<f64>(),
            reference: None,
            properties: Vec::new(),
        }
    }

    fn anonymous_description<T: 'static>() -> TypeDescription {
        TypeDescription {
            name: String::new(),
            module: None,
            base: TypeId::NONE,
            to_base: FunctionHandle::NULL,
            memory_layout: native::minimal_memory_layout::<T>(),
            reference: None,
            properties: Vec::new(),
        }
    }

    #[test]
    fn native_fingerprints_are_idempotent() {
        let mut registry = TypeRegistry::new();
        let first = registry.register(description("Number")).unwrap();
        let second = registry.register(description("Number")).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn recycled_slots_invalidate_stale_ids() {
        let mut registry = TypeRegistry::new();
        let first = registry.register(anonymous_description::<u32>()).unwrap();
        registry.deregister(first).unwrap();
        let second = registry.register(anonymous_description::<u64>()).unwrap();

        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(registry.get(first).is_none());
        assert!(registry.get(second).is_some());
    }

    #[test]
    fn anonymous_entries_upgrade_in_place() {
        let mut registry = TypeRegistry::new();
        let anonymous = registry.register(anonymous_description::<f64>()).unwrap();
        let named = registry.register(description("Number")).unwrap();

        assert_eq!(anonymous, named);
        assert_eq!(registry.get(named).unwrap().name(), "Number");
    }

    #[test]
    fn base_chains_are_reflexive_and_transitive() {
        let mut registry = TypeRegistry::new();
        let grandparent = registry.register(anonymous_description::<u8>()).unwrap();
        let mut parent_description = anonymous_description::<u16>();
        parent_description.base = grandparent;
        let parent = registry.register(parent_description).unwrap();
        let mut child_description = anonymous_description::<u32>();
        child_description.base = parent;
        let child = registry.register(child_description).unwrap();

        assert!(registry.is_derived_from(child, child));
        assert!(registry.is_derived_from(child, parent));
        assert!(registry.is_derived_from(child, grandparent));
        assert!(!registry.is_derived_from(grandparent, child));
    }
}
