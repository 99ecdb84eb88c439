//! Script type parsing and layout synthesis

use crate::error::ParseError;
use crate::handle::{FunctionHandle, FunctionKind};
use crate::parser::resolve_type_reference;
use crate::storage::ValueStorage;
use crate::types::{PropertyAccess, TypeMemoryLayout, TypePropertyDescription};
use crate::value::Value;
use crate::vm::VirtualMachine;

use script_asm::Instruction;
use serde_json::Value as Json;

/// A synthesized layout function awaiting interning.
#[derive(Debug)]
pub struct SynthesizedFunction {
    /// Compiled body; expects its pointer arguments as frame registers.
    pub instructions: Vec<Instruction>,
    /// Constants referenced by the body.
    pub constants: Vec<Value>,
}

/// A parsed script type: the packed layout, the property descriptors and
/// the synthesized layout functions.
///
/// Register it with [`VirtualMachine::register_script_type`].
#[derive(Debug)]
pub struct ParsedTypeDefinition {
    /// Declared type name.
    pub name: String,
    /// Computed alignment: the maximum of the property alignments, at least
    /// the storage slot alignment.
    pub alignment_in_bytes: usize,
    /// Computed size: properties packed in declaration order, each aligned
    /// to its type, the total rounded up to the alignment.
    pub size_in_bytes: usize,
    /// Whether every property is copyable.
    pub is_copyable: bool,
    /// Property descriptors with primitive-offset access.
    pub properties: Vec<TypePropertyDescription>,
    /// Constructs every property in declaration order.
    pub construct: SynthesizedFunction,
    /// Copies every property in declaration order; absent when not copyable.
    pub copy: Option<SynthesizedFunction>,
    /// Destructs the non-trivial properties in declaration order; absent
    /// when the composed type is trivial.
    pub destruct: Option<SynthesizedFunction>,
}

struct PropertyLayout {
    offset: usize,
    layout: TypeMemoryLayout,
}

/// Parses a `definitionType: "type"` declaration: computes the packed
/// layout and synthesizes construct/copy/destruct bytecode iterating the
/// properties in declaration order.
pub fn parse_script_type(
    vm: &mut VirtualMachine,
    definition: &Json,
    path: &str,
) -> Result<ParsedTypeDefinition, Vec<ParseError>> {
    let mut errors = Vec::new();

    let name = match definition.get("name").and_then(Json::as_str) {
        Some(name) => name.to_owned(),
        None => {
            errors.push(ParseError::new(path, "type requires a name"));
            String::new()
        }
    };

    let mut alignment = ValueStorage::ALIGNMENT;
    let mut size = 0usize;
    let mut properties = Vec::new();
    let mut property_layouts = Vec::new();

    if let Some(map) = definition.get("properties").and_then(Json::as_object) {
        for (property_name, property_definition) in map {
            let property_path = format!("{path}/properties/{property_name}");
            let Some(type_reference) = property_definition.get("type") else {
                errors.push(ParseError::new(property_path, "property requires a type"));
                continue;
            };
            let layout = match resolve_type_reference(type_reference)
                .and_then(|reference| {
                    vm.find_type(&reference)
                        .map(|ty| (ty.id(), ty.memory_layout().clone()))
                        .ok_or(format!("unknown type {reference}"))
                }) {
                Ok(resolved) => resolved,
                Err(message) => {
                    errors.push(ParseError::new(format!("{property_path}/type"), message));
                    continue;
                }
            };
            let (type_id, layout) = layout;

            if !layout.is_constructible || layout.construct.is_null() {
                errors.push(ParseError::new(
                    property_path.clone(),
                    format!("property type of {property_name} is not constructible"),
                ));
                continue;
            }

            if layout.alignment_in_bytes > alignment {
                alignment = layout.alignment_in_bytes;
            }
            size = round_up(size, layout.alignment_in_bytes);

            if size > u16::MAX as usize {
                errors.push(ParseError::new(
                    property_path.clone(),
                    format!("property {property_name} exceeds the addressable size"),
                ));
                continue;
            }

            properties.push(TypePropertyDescription {
                name: property_name.clone(),
                type_id,
                access: PropertyAccess::Offset(size),
            });
            property_layouts.push(PropertyLayout {
                offset: size,
                layout: layout.clone(),
            });
            size += layout.size_in_bytes;
        }
    } else if definition.get("properties").is_some() {
        errors.push(ParseError::new(
            format!("{path}/properties"),
            "properties must be an object",
        ));
    }

    size = round_up(size, alignment);

    if !errors.is_empty() {
        return Err(errors);
    }

    let is_copyable = property_layouts
        .iter()
        .all(|property| property.layout.is_copyable && !property.layout.copy.is_null());
    let needs_destruct = property_layouts
        .iter()
        .any(|property| !property.layout.is_trivial());

    let construct = synthesize_unary(vm, &property_layouts, |layout| Some(layout.construct));
    let copy = is_copyable.then(|| synthesize_copy(vm, &property_layouts));
    let destruct = needs_destruct.then(|| {
        synthesize_unary(vm, &property_layouts, |layout| {
            (!layout.destruct.is_null()).then_some(layout.destruct)
        })
    });

    Ok(ParsedTypeDefinition {
        name,
        alignment_in_bytes: alignment,
        size_in_bytes: size,
        is_copyable,
        properties,
        construct,
        copy,
        destruct,
    })
}

/// Emits one pointer-argument call per property: push a copy of the object
/// pointer, offset it to the property, call the selected layout function.
fn synthesize_unary(
    vm: &mut VirtualMachine,
    property_layouts: &[PropertyLayout],
    select: fn(&TypeMemoryLayout) -> Option<FunctionHandle>,
) -> SynthesizedFunction {
    let mut instructions = Vec::new();
    let mut constants = Vec::new();

    for property in property_layouts {
        let Some(handle) = select(&property.layout) else {
            continue;
        };
        let constant = constants.len() as u32;
        constants.push(Value::from_native(vm, handle));

        instructions.push(Instruction::PushTrivialStackValue { stack_index: 0 });
        instructions.push(Instruction::OffsetAddress {
            register: 1,
            offset: property.offset as u16,
        });
        instructions.push(Instruction::PushTrivialConstant { constant });
        instructions.push(call_instruction(handle, 1));
    }
    instructions.push(Instruction::Return { output_count: 0 });

    SynthesizedFunction {
        instructions,
        constants,
    }
}

/// Emits one (destination, source) call per property.
fn synthesize_copy(
    vm: &mut VirtualMachine,
    property_layouts: &[PropertyLayout],
) -> SynthesizedFunction {
    let mut instructions = Vec::new();
    let mut constants = Vec::new();

    for property in property_layouts {
        let handle = property.layout.copy;
        let constant = constants.len() as u32;
        constants.push(Value::from_native(vm, handle));

        instructions.push(Instruction::PushTrivialStackValue { stack_index: 0 });
        instructions.push(Instruction::OffsetAddress {
            register: 2,
            offset: property.offset as u16,
        });
        instructions.push(Instruction::PushTrivialStackValue { stack_index: 1 });
        instructions.push(Instruction::OffsetAddress {
            register: 3,
            offset: property.offset as u16,
        });
        instructions.push(Instruction::PushTrivialConstant { constant });
        instructions.push(call_instruction(handle, 2));
    }
    instructions.push(Instruction::Return { output_count: 0 });

    SynthesizedFunction {
        instructions,
        constants,
    }
}

fn call_instruction(handle: FunctionHandle, input_count: u16) -> Instruction {
    match handle.kind() {
        FunctionKind::Bytecode(_) => Instruction::CallScriptFunction {
            input_count,
            output_count: 0,
        },
        _ => Instruction::CallNativeFunction {
            input_count: input_count as u32,
        },
    }
}

fn round_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment > 0);
    (value + alignment - 1) / alignment * alignment
}
