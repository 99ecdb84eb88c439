//! Script parser
//!
//! Turns a tree-shaped script description (a JSON array of tagged
//! declarations) into function descriptions with compiled bytecode and type
//! definitions with packed layouts, or a list of [`ParseError`]s. Parsing
//! never stops at the first error; the full list is accumulated so a
//! front-end can surface them all.

mod function;
mod types;

pub use function::parse_script_function;
pub use types::{parse_script_type, ParsedTypeDefinition, SynthesizedFunction};

use crate::error::ParseError;
use crate::function::FunctionDescription;
use crate::vm::VirtualMachine;

use serde_json::Value as Json;

/// Successfully parsed script: function descriptions awaiting registration
/// and type definitions awaiting [`VirtualMachine::register_script_type`].
#[derive(Default, Debug)]
pub struct ParsedScript {
    /// Parsed function declarations.
    pub functions: Vec<FunctionDescription>,
    /// Parsed type declarations.
    pub types: Vec<ParsedTypeDefinition>,
}

/// Parses a script: a top-level array of declarations tagged with
/// `definitionType`.
///
/// Returns the parsed bundle, or every accumulated error with JSON-pointer
/// paths. A script with errors produces no partial result.
pub fn parse_script(
    vm: &mut VirtualMachine,
    script: &Json,
) -> Result<ParsedScript, Vec<ParseError>> {
    let Some(definitions) = script.as_array() else {
        return Err(vec![ParseError::new("", "script must be an array")]);
    };

    let mut result = ParsedScript::default();
    let mut errors = Vec::new();
    let mut declared_names = std::collections::HashSet::new();

    for (index, definition) in definitions.iter().enumerate() {
        let path = format!("/{index}");
        let Some(definition_type) = definition.get("definitionType").and_then(Json::as_str)
        else {
            errors.push(ParseError::new(path, "missing definitionType"));
            continue;
        };
        if let Some(name) = definition.get("name").and_then(Json::as_str) {
            if !declared_names.insert(name.to_owned()) {
                errors.push(ParseError::new(
                    format!("{path}/name"),
                    format!("duplicate declaration {name}"),
                ));
                continue;
            }
        }
        match definition_type {
            "function" => match parse_script_function(vm, definition, &path) {
                Ok(function) => result.functions.push(function),
                Err(function_errors) => errors.extend(function_errors),
            },
            "type" => match parse_script_type(vm, definition, &path) {
                Ok(ty) => result.types.push(ty),
                Err(type_errors) => errors.extend(type_errors),
            },
            other => {
                errors.push(ParseError::new(
                    path,
                    format!("invalid definition type {other}"),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(result)
    } else {
        Err(errors)
    }
}

pub(crate) fn resolve_type_reference(value: &Json) -> Result<String, String> {
    match value {
        Json::String(reference) => Ok(reference.clone()),
        Json::Object(map) => {
            let module = map
                .get("module")
                .and_then(Json::as_str)
                .ok_or("type reference requires a module")?;
            let name = map
                .get("name")
                .and_then(Json::as_str)
                .ok_or("type reference requires a name")?;
            Ok(format!("{module}.{name}"))
        }
        _ => Err("invalid type reference".to_owned()),
    }
}
