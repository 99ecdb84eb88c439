//! Runtime type descriptions

use crate::error::RegistrationError;
use crate::handle::FunctionHandle;
use crate::storage::ValueStorage;

use core::any::TypeId as NativeTypeId;

/// Opaque id of a registered type.
///
/// Ids key into the VM's sparse, recyclable registry. Equality is identity:
/// a slot reused after deregistration carries a new version, so stale ids
/// fail lookup instead of aliasing the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId {
    index: u32,
    version: u32,
}

impl TypeId {
    /// Reserved id of the *none / void* type.
    pub const NONE: Self = Self {
        index: 0,
        version: 0,
    };

    pub(crate) const fn new(index: u32, version: u32) -> Self {
        Self { index, version }
    }

    /// Registry slot index.
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Registry slot version at the time the id was issued.
    pub const fn version(self) -> u32 {
        self.version
    }

    /// Whether this is the reserved none id.
    pub const fn is_none(self) -> bool {
        self.index == 0
    }
}

/// Memory contract of a registered type.
///
/// The three function handles, when present, obey: construct pops a pointer
/// to uninitialized memory; copy pops (destination, source), both
/// initialized; destruct pops an initialized pointer. A trivial layout has a
/// null destruct handle; copies for such layouts are byte copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMemoryLayout {
    /// Fingerprint of the backing native type, if any.
    pub native_type_id: Option<NativeTypeId>,
    /// Whether values of the type can be constructed.
    pub is_constructible: bool,
    /// Whether values of the type can be copied.
    pub is_copyable: bool,
    /// Alignment in bytes.
    pub alignment_in_bytes: usize,
    /// Size in bytes.
    pub size_in_bytes: usize,
    /// Construct function; null when not constructible.
    pub construct: FunctionHandle,
    /// Copy function; null for trivial layouts.
    pub copy: FunctionHandle,
    /// Destruct function; null for trivial layouts.
    pub destruct: FunctionHandle,
}

impl TypeMemoryLayout {
    /// A trivial layout has no destruct function.
    pub fn is_trivial(&self) -> bool {
        self.destruct.is_null()
    }

    /// Whether values of this layout live in the inline storage slot.
    pub fn is_stored_inline(&self) -> bool {
        ValueStorage::is_stored_inline(self.alignment_in_bytes, self.size_in_bytes)
    }
}

/// Memory layout and accessors of a reference type's representation.
///
/// Values of a reference type live indirectly: the storage holds the
/// representation described here, and payload access goes through
/// `get_pointer` / `set_pointer`.
#[derive(Debug, Clone)]
pub struct ReferenceDescription {
    /// Layout of the reference representation itself.
    pub memory_layout: TypeMemoryLayout,
    /// Pops a pointer to the representation, pushes the payload pointer.
    pub get_pointer: FunctionHandle,
    /// Pops (representation pointer, payload pointer); stores the payload
    /// pointer in the representation.
    pub set_pointer: FunctionHandle,
}

/// How a property is accessed.
#[derive(Debug, Clone)]
pub enum PropertyAccess {
    /// Primitive access at a byte offset within the value.
    Offset(usize),
    /// Computed access through getter/setter functions.
    Functions {
        /// Pops the object pointer, pushes the property value.
        getter: FunctionHandle,
        /// Pops (object pointer, property value).
        setter: FunctionHandle,
    },
}

/// A named, typed property of a registered type.
#[derive(Debug, Clone)]
pub struct TypePropertyDescription {
    /// Property name.
    pub name: String,
    /// Type of the property value.
    pub type_id: TypeId,
    /// Access path.
    pub access: PropertyAccess,
}

/// Full description of a registered type.
#[derive(Debug, Clone)]
pub struct TypeDescription {
    /// Type name; empty for anonymous (lazily registered) native types.
    pub name: String,
    /// Owning module, if any. May be added once after registration, never
    /// changed.
    pub module: Option<String>,
    /// Base type forming a single-inheritance chain; `TypeId::NONE` ends it.
    pub base: TypeId,
    /// Adjusts a value pointer to a base pointer; null when the base pointer
    /// is identical.
    pub to_base: FunctionHandle,
    /// Memory contract; immutable after registration.
    pub memory_layout: TypeMemoryLayout,
    /// Present iff the type is a reference type.
    pub reference: Option<ReferenceDescription>,
    /// Property descriptors.
    pub properties: Vec<TypePropertyDescription>,
}

impl TypeDescription {
    /// Adds a primitive property at a byte offset.
    pub fn with_offset_property(
        mut self,
        name: impl Into<String>,
        type_id: TypeId,
        offset: usize,
    ) -> Self {
        self.properties.push(TypePropertyDescription {
            name: name.into(),
            type_id,
            access: PropertyAccess::Offset(offset),
        });
        self
    }

    /// Adds a computed property with getter/setter functions.
    pub fn with_computed_property(
        mut self,
        name: impl Into<String>,
        type_id: TypeId,
        getter: FunctionHandle,
        setter: FunctionHandle,
    ) -> Self {
        self.properties.push(TypePropertyDescription {
            name: name.into(),
            type_id,
            access: PropertyAccess::Functions { getter, setter },
        });
        self
    }
}

/// A registered type: its id plus its description.
#[derive(Debug, Clone)]
pub struct Type {
    id: TypeId,
    description: TypeDescription,
}

impl Type {
    pub(crate) fn new(id: TypeId, description: TypeDescription) -> Self {
        Self { id, description }
    }

    /// Id of the type.
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// Type name; empty for anonymous native types.
    pub fn name(&self) -> &str {
        &self.description.name
    }

    /// Owning module name, if any.
    pub fn module(&self) -> Option<&str> {
        self.description.module.as_deref()
    }

    /// Base type id; `TypeId::NONE` when the type has no base.
    pub const fn base(&self) -> TypeId {
        self.description.base
    }

    /// Full description.
    pub fn description(&self) -> &TypeDescription {
        &self.description
    }

    /// Memory contract.
    pub fn memory_layout(&self) -> &TypeMemoryLayout {
        &self.description.memory_layout
    }

    /// Whether values of the type are indirect handles.
    pub fn is_reference_type(&self) -> bool {
        self.description.reference.is_some()
    }

    /// Looks up a property by name.
    pub fn property(&self, name: &str) -> Option<&TypePropertyDescription> {
        self.description
            .properties
            .iter()
            .find(|property| property.name == name)
    }

    /// Renders `"Module.Name"`, a bare name without a module, or
    /// `"Unknown"` for anonymous types.
    pub fn reference_string(&self) -> String {
        if self.description.name.is_empty() {
            "Unknown".to_owned()
        } else if let Some(module) = &self.description.module {
            format!("{}.{}", module, self.description.name)
        } else {
            self.description.name.clone()
        }
    }

    /// Replaces the description.
    ///
    /// The memory layout must not change; the only permitted mutation beyond
    /// equal fields is adding a module reference once. An anonymous entry
    /// (empty name) may be upgraded to a full description as long as the
    /// alignment, size and native fingerprint match.
    pub(crate) fn update_description(
        &mut self,
        description: TypeDescription,
    ) -> Result<(), RegistrationError> {
        let old = &self.description;
        let layout_compatible = if old.name.is_empty() {
            old.memory_layout.alignment_in_bytes == description.memory_layout.alignment_in_bytes
                && old.memory_layout.size_in_bytes == description.memory_layout.size_in_bytes
                && old.memory_layout.native_type_id == description.memory_layout.native_type_id
        } else {
            old.memory_layout == description.memory_layout
        };
        let module_compatible = match (&old.module, &description.module) {
            (Some(old_module), Some(new_module)) => old_module == new_module,
            (Some(_), None) => false,
            (None, _) => true,
        };
        if !layout_compatible || !module_compatible {
            return Err(RegistrationError::IncompatibleRedefinition {
                name: description.name,
            });
        }
        self.description = description;
        Ok(())
    }
}
