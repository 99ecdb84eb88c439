//! Script function parsing

use crate::error::ParseError;
use crate::function::{
    Function, FunctionDefinition, FunctionDescription, ScriptFunctionDefinition,
    ValueDeclaration,
};
use crate::handle::FunctionKind;
use crate::parser::resolve_type_reference;
use crate::types::TypeId;
use crate::value::Value;
use crate::vm::VirtualMachine;

use script_asm::Instruction;
use serde_json::Value as Json;

/// Parses a `definitionType: "function"` declaration into a registrable
/// description with compiled bytecode and constants.
///
/// On any error the full accumulated list is returned and no description is
/// produced.
pub fn parse_script_function(
    vm: &mut VirtualMachine,
    definition: &Json,
    path: &str,
) -> Result<FunctionDescription, Vec<ParseError>> {
    let mut parser = ScriptFunctionParser::new(vm, path);

    let name = match definition.get("name").and_then(Json::as_str) {
        Some(name) => name.to_owned(),
        None => {
            parser.error(path, "function requires a name");
            String::new()
        }
    };

    parser.parse_declarations(definition.get("inputs"), "inputs");
    parser.parse_declarations(definition.get("outputs"), "outputs");
    parser.stack_height = parser.outputs.len() + parser.inputs.len();
    parser.scopes.push(Scope::default());

    match definition.get("actions") {
        Some(actions) => parser.parse_actions(actions, &format!("{path}/actions")),
        None => parser.error(path, "function requires an actions array"),
    }

    // Falling off the end returns the current output-slot contents.
    let output_count = parser.outputs.len() as u8;
    parser.instructions.push(Instruction::Return { output_count });

    let ScriptFunctionParser {
        inputs,
        outputs,
        instructions,
        constants,
        errors,
        ..
    } = parser;

    if errors.is_empty() {
        Ok(FunctionDescription {
            name,
            inputs,
            outputs,
            definition: FunctionDefinition::Script(ScriptFunctionDefinition {
                instructions,
                constants,
            }),
        })
    } else {
        Err(errors)
    }
}

#[derive(Default)]
struct Scope {
    variables: Vec<ScopeVariable>,
}

struct ScopeVariable {
    name: Option<String>,
    type_id: TypeId,
    position: usize,
    trivial: bool,
}

struct ScriptFunctionParser<'a> {
    vm: &'a mut VirtualMachine,
    path: String,
    number_type: TypeId,
    boolean_type: TypeId,
    inputs: Vec<ValueDeclaration>,
    outputs: Vec<ValueDeclaration>,
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    errors: Vec<ParseError>,
    scopes: Vec<Scope>,
    /// Frame-relative stack height: outputs, inputs, locals and pending
    /// temporaries.
    stack_height: usize,
}

impl<'a> ScriptFunctionParser<'a> {
    fn new(vm: &'a mut VirtualMachine, path: &str) -> Self {
        let number_type = vm.get_type_id::<f64>();
        let boolean_type = vm.get_type_id::<bool>();
        Self {
            vm,
            path: path.to_owned(),
            number_type,
            boolean_type,
            inputs: Vec::new(),
            outputs: Vec::new(),
            instructions: Vec::new(),
            constants: Vec::new(),
            errors: Vec::new(),
            scopes: Vec::new(),
            stack_height: 0,
        }
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ParseError::new(path, message));
    }

    fn type_name(&self, type_id: TypeId) -> String {
        self.vm
            .ty(type_id)
            .map(|ty| ty.reference_string())
            .unwrap_or_else(|| "Unknown".to_owned())
    }

    fn add_constant(&mut self, value: Value) -> u32 {
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    fn parse_declarations(&mut self, declarations: Option<&Json>, kind: &str) {
        let path = format!("{}/{kind}", self.path);
        let Some(declarations) = declarations else {
            return;
        };
        let Some(declarations) = declarations.as_array() else {
            self.error(path, format!("{kind} must be an array"));
            return;
        };
        for (index, declaration) in declarations.iter().enumerate() {
            let declaration_path = format!("{path}/{index}");
            let Some(name) = declaration.get("name").and_then(Json::as_str) else {
                self.error(declaration_path, "declaration requires a name");
                continue;
            };
            let Some(type_reference) = declaration.get("type") else {
                self.error(declaration_path, "declaration requires a type");
                continue;
            };
            let Some(type_id) =
                self.resolve_type(type_reference, &format!("{declaration_path}/type"))
            else {
                continue;
            };
            let declaration = ValueDeclaration {
                name: name.to_owned(),
                type_id,
            };
            if kind == "inputs" {
                self.inputs.push(declaration);
            } else {
                self.outputs.push(declaration);
            }
        }
    }

    fn resolve_type(&mut self, reference: &Json, path: &str) -> Option<TypeId> {
        match resolve_type_reference(reference)
            .and_then(|reference| {
                self.vm
                    .find_type(&reference)
                    .map(|ty| ty.id())
                    .ok_or(format!("unknown type {reference}"))
            }) {
            Ok(type_id) => Some(type_id),
            Err(message) => {
                self.error(path, message);
                None
            }
        }
    }

    fn parse_actions(&mut self, actions: &Json, path: &str) {
        let Some(actions) = actions.as_array() else {
            self.error(path, "actions must be an array");
            return;
        };
        for (index, action) in actions.iter().enumerate() {
            self.parse_action(action, &format!("{path}/{index}"));
        }
    }

    fn parse_action(&mut self, action: &Json, path: &str) {
        let Some(id) = action.get("id").and_then(Json::as_str) else {
            self.error(path, "action requires an id");
            return;
        };
        match id {
            "variable_declaration" => self.parse_variable_declaration(action, path),
            "push" => self.parse_push_action(action, path),
            "function_call" => self.parse_function_call_action(action, path),
            "if" => self.parse_if(action, path),
            "while" => self.parse_while(action, path),
            "return" => self.parse_return(action, path),
            other => self.error(path, format!("invalid action id {other}")),
        }
    }

    fn parse_variable_declaration(&mut self, action: &Json, path: &str) {
        let Some(type_reference) = action.get("type") else {
            self.error(path, "variable declaration requires a type");
            return;
        };
        let Some(type_id) = self.resolve_type(type_reference, &format!("{path}/type")) else {
            return;
        };
        let name = action
            .get("name")
            .and_then(Json::as_str)
            .map(str::to_owned);

        let Some(layout) = self.vm.ty(type_id).map(|ty| ty.memory_layout().clone()) else {
            self.error(path, "unknown variable type");
            return;
        };
        if !layout.is_constructible || layout.construct.is_null() {
            self.error(
                format!("{path}/type"),
                format!("type {} is not constructible", self.type_name(type_id)),
            );
            return;
        }
        if layout.size_in_bytes > u16::MAX as usize || layout.alignment_in_bytes > u8::MAX as usize
        {
            self.error(format!("{path}/type"), "type exceeds the addressable size");
            return;
        }

        let position = self.stack_height;
        let destruct = Value::from_native(self.vm, layout.destruct);
        let destruct = self.add_constant(destruct);
        let construct = Value::from_native(self.vm, layout.construct);
        let construct = self.add_constant(construct);

        self.instructions.push(Instruction::Push { count: 1 });
        self.instructions
            .push(Instruction::PushTrivialConstant { constant: destruct });
        self.instructions
            .push(Instruction::PushTrivialConstant { constant: construct });
        if layout.is_stored_inline() {
            self.instructions.push(Instruction::ConstructInlineValue);
        } else {
            self.instructions.push(Instruction::ConstructValue {
                alignment: layout.alignment_in_bytes as u8,
                size: layout.size_in_bytes as u16,
            });
        }
        self.stack_height += 1;

        self.current_scope().variables.push(ScopeVariable {
            name,
            type_id,
            position,
            trivial: layout.is_trivial(),
        });
    }

    fn parse_push_action(&mut self, action: &Json, path: &str) {
        let Some(value) = action.get("value") else {
            self.error(path, "push requires a value");
            return;
        };
        let position = self.stack_height;
        let type_id = self.parse_push(value, &format!("{path}/value"), None);
        let trivial = type_id
            .and_then(|id| self.vm.ty(id))
            .map(|ty| ty.memory_layout().is_trivial())
            .unwrap_or(true);
        self.current_scope().variables.push(ScopeVariable {
            name: None,
            type_id: type_id.unwrap_or(TypeId::NONE),
            position,
            trivial,
        });
    }

    fn parse_function_call_action(&mut self, action: &Json, path: &str) {
        let Some(function) = self.compile_call(action, path) else {
            return;
        };

        let bindings = action.get("outputs").and_then(Json::as_array);
        match bindings {
            Some(bindings) if !bindings.is_empty() => {
                if bindings.len() != function.outputs().len() {
                    self.error(
                        format!("{path}/outputs"),
                        format!(
                            "expected {} output bindings, got {}",
                            function.outputs().len(),
                            bindings.len()
                        ),
                    );
                    return;
                }
                for index in (0..bindings.len()).rev() {
                    let binding_path = format!("{path}/outputs/{index}");
                    let Some(target) = bindings[index].as_str() else {
                        self.error(binding_path, "output binding must be an identifier");
                        self.stack_height -= 1;
                        continue;
                    };
                    let declared = function.outputs()[index].type_id;
                    if let Some(position) =
                        self.resolve_assign_target(target, declared, &binding_path)
                    {
                        self.instructions.push(Instruction::AssignTrivialStackValue {
                            stack_index: position as u32,
                        });
                    }
                    self.stack_height -= 1;
                }
            }
            _ => {
                // Unbound call results stay on the stack as anonymous scope
                // values and are cleaned up when the scope closes.
                let base = self.stack_height - function.outputs().len();
                for (index, output) in function.outputs().iter().enumerate() {
                    let trivial = self
                        .vm
                        .ty(output.type_id)
                        .map(|ty| ty.memory_layout().is_trivial())
                        .unwrap_or(true);
                    self.scopes
                        .last_mut()
                        .expect("base scope always exists")
                        .variables
                        .push(ScopeVariable {
                            name: None,
                            type_id: output.type_id,
                            position: base + index,
                            trivial,
                        });
                }
            }
        }
    }

    /// Resolves the target of an output binding: a named local first, then a
    /// declared function output.
    fn resolve_assign_target(
        &mut self,
        name: &str,
        value_type: TypeId,
        path: &str,
    ) -> Option<usize> {
        let target = self.lookup_local(name).or_else(|| {
            self.outputs
                .iter()
                .position(|output| output.name == name)
                .map(|index| (index, self.outputs[index].type_id))
        });
        let Some((position, target_type)) = target else {
            self.error(path, format!("undefined identifier {name}"));
            return None;
        };
        if target_type != value_type {
            self.error(
                path,
                format!(
                    "expected type {}, found {}",
                    self.type_name(target_type),
                    self.type_name(value_type)
                ),
            );
            return None;
        }
        if !self.is_trivially_copyable(target_type) {
            self.error(
                path,
                format!(
                    "values of type {} cannot be copied trivially",
                    self.type_name(target_type)
                ),
            );
            return None;
        }
        Some(position)
    }

    fn is_trivially_copyable(&self, type_id: TypeId) -> bool {
        self.vm
            .ty(type_id)
            .map(|ty| {
                let layout = ty.memory_layout();
                layout.is_trivial() && layout.is_stored_inline()
            })
            .unwrap_or(false)
    }

    /// Compiles a call's argument pushes and the call itself, leaving the
    /// callee's outputs on the stack. Returns the resolved callee.
    fn compile_call(&mut self, action: &Json, path: &str) -> Option<Function> {
        let Some(function_reference) = action.get("function") else {
            self.error(path, "function call requires a function");
            return None;
        };
        let function = match resolve_type_reference(function_reference)
            .and_then(|reference| {
                self.vm
                    .find_function(&reference)
                    .cloned()
                    .ok_or(format!("unknown function {reference}"))
            }) {
            Ok(function) => function,
            Err(message) => {
                self.error(format!("{path}/function"), message);
                return None;
            }
        };

        let arguments = action
            .get("inputs")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();
        if arguments.len() != function.inputs().len() {
            self.error(
                format!("{path}/inputs"),
                format!(
                    "{} expects {} inputs, got {}",
                    function.name(),
                    function.inputs().len(),
                    arguments.len()
                ),
            );
            return None;
        }

        let input_count = function.inputs().len();
        let output_count = function.outputs().len();
        let is_script = matches!(function.handle().kind(), FunctionKind::Bytecode(_));

        if is_script {
            self.instructions.push(Instruction::Push {
                count: output_count as u32,
            });
            self.stack_height += output_count;
        }

        let input_types: Vec<TypeId> = function
            .inputs()
            .iter()
            .map(|input| input.type_id)
            .collect();
        for (index, (argument, expected)) in
            arguments.iter().zip(input_types).enumerate()
        {
            self.parse_push(argument, &format!("{path}/inputs/{index}"), Some(expected));
        }

        let handle = Value::from_native(self.vm, function.handle());
        let constant = self.add_constant(handle);
        self.instructions
            .push(Instruction::PushTrivialConstant { constant });
        self.stack_height += 1;

        if is_script {
            self.instructions.push(Instruction::CallScriptFunction {
                input_count: input_count as u16,
                output_count: output_count as u16,
            });
            // The call pops the handle and consumes the arguments.
            self.stack_height -= 1 + input_count;
        } else {
            self.instructions.push(Instruction::CallNativeFunction {
                input_count: input_count as u32,
            });
            self.stack_height -= 1 + input_count;
            self.stack_height += output_count;
        }

        Some(function)
    }

    fn parse_if(&mut self, action: &Json, path: &str) {
        let Some(condition) = action.get("condition") else {
            self.error(path, "if requires a condition");
            return;
        };
        self.parse_push(
            condition,
            &format!("{path}/condition"),
            Some(self.boolean_type),
        );
        let exit_jump = self.push_jump_placeholder(JumpKind::IfFalse);
        self.stack_height -= 1;

        match action.get("then") {
            Some(then_actions) => self.parse_scope(then_actions, &format!("{path}/then")),
            None => self.error(path, "if requires a then branch"),
        }

        if let Some(else_actions) = action.get("else") {
            let end_jump = self.push_jump_placeholder(JumpKind::Unconditional);
            self.patch_jump(exit_jump);
            self.parse_scope(else_actions, &format!("{path}/else"));
            self.patch_jump(end_jump);
        } else {
            self.patch_jump(exit_jump);
        }
    }

    fn parse_while(&mut self, action: &Json, path: &str) {
        let Some(condition) = action.get("condition") else {
            self.error(path, "while requires a condition");
            return;
        };
        let header = self.instructions.len();
        self.parse_push(
            condition,
            &format!("{path}/condition"),
            Some(self.boolean_type),
        );
        let exit_jump = self.push_jump_placeholder(JumpKind::IfFalse);
        self.stack_height -= 1;

        match action.get("body") {
            Some(body) => self.parse_scope(body, &format!("{path}/body")),
            None => self.error(path, "while requires a body"),
        }

        let back_jump = self.instructions.len();
        self.instructions.push(Instruction::Jump {
            offset: header as i32 - (back_jump as i32 + 1),
        });
        self.patch_jump(exit_jump);
    }

    fn parse_return(&mut self, action: &Json, path: &str) {
        let values = action
            .get("outputs")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();
        if values.len() != self.outputs.len() {
            self.error(
                format!("{path}/outputs"),
                format!(
                    "expected {} return values, got {}",
                    self.outputs.len(),
                    values.len()
                ),
            );
        } else {
            for (index, value) in values.iter().enumerate() {
                let value_path = format!("{path}/outputs/{index}");
                let expected = self.outputs[index].type_id;
                if !self.is_trivially_copyable(expected) {
                    self.error(
                        value_path.clone(),
                        format!(
                            "values of type {} cannot be copied trivially",
                            self.type_name(expected)
                        ),
                    );
                }
                self.parse_push(value, &value_path, Some(expected));
                self.instructions.push(Instruction::AssignTrivialStackValue {
                    stack_index: index as u32,
                });
                self.stack_height -= 1;
            }
        }
        self.instructions.push(Instruction::Return {
            output_count: self.outputs.len() as u8,
        });
    }

    /// Compiles a value expression, leaving exactly one value on the stack.
    /// Returns its type when known; records an error on a type mismatch.
    fn parse_push(
        &mut self,
        expression: &Json,
        path: &str,
        expected: Option<TypeId>,
    ) -> Option<TypeId> {
        let actual = match expression {
            Json::Number(number) => {
                let Some(value) = number.as_f64() else {
                    self.error(path, "number literal out of range");
                    self.stack_height += 1;
                    return None;
                };
                let constant = Value::from_native(self.vm, value);
                let constant = self.add_constant(constant);
                self.instructions
                    .push(Instruction::PushTrivialConstant { constant });
                self.stack_height += 1;
                Some(self.number_type)
            }
            Json::Bool(value) => {
                let constant = Value::from_native(self.vm, *value);
                let constant = self.add_constant(constant);
                self.instructions
                    .push(Instruction::PushTrivialConstant { constant });
                self.stack_height += 1;
                Some(self.boolean_type)
            }
            Json::Object(map) if map.contains_key("local") => {
                self.push_variable_reference(map.get("local").unwrap(), path, true)
            }
            Json::Object(map) if map.contains_key("input") => {
                self.push_variable_reference(map.get("input").unwrap(), path, false)
            }
            Json::Object(map)
                if map.get("id").and_then(Json::as_str) == Some("function_call") =>
            {
                let function = self.compile_call(expression, path)?;
                if function.outputs().len() != 1 {
                    self.error(
                        path,
                        format!(
                            "{} must produce exactly one value in an expression",
                            function.name()
                        ),
                    );
                    None
                } else {
                    Some(function.outputs()[0].type_id)
                }
            }
            _ => {
                self.error(path, "invalid value expression");
                self.stack_height += 1;
                None
            }
        };

        if let (Some(expected), Some(actual)) = (expected, actual) {
            if expected != actual {
                self.error(
                    path,
                    format!(
                        "expected type {}, found {}",
                        self.type_name(expected),
                        self.type_name(actual)
                    ),
                );
            }
        }
        actual
    }

    /// Pushes a trivial copy of a named stack value. `include_locals` is
    /// false for explicit `{"input": ...}` references.
    fn push_variable_reference(
        &mut self,
        name: &Json,
        path: &str,
        include_locals: bool,
    ) -> Option<TypeId> {
        self.stack_height += 1;
        let Some(name) = name.as_str() else {
            self.error(path, "variable reference must be an identifier");
            return None;
        };

        let resolved = if include_locals {
            self.lookup_local(name)
                .or_else(|| self.lookup_input(name))
                .or_else(|| self.lookup_output(name))
        } else {
            self.lookup_input(name)
        };
        let Some((position, type_id)) = resolved else {
            self.error(path, format!("undefined identifier {name}"));
            return None;
        };

        if !self.is_trivially_copyable(type_id) {
            self.error(
                path,
                format!(
                    "values of type {} cannot be copied trivially",
                    self.type_name(type_id)
                ),
            );
            return None;
        }

        self.instructions.push(Instruction::PushTrivialStackValue {
            stack_index: position as u32,
        });
        Some(type_id)
    }

    fn lookup_local(&self, name: &str) -> Option<(usize, TypeId)> {
        self.scopes.iter().rev().find_map(|scope| {
            scope.variables.iter().rev().find_map(|variable| {
                (variable.name.as_deref() == Some(name))
                    .then_some((variable.position, variable.type_id))
            })
        })
    }

    fn lookup_input(&self, name: &str) -> Option<(usize, TypeId)> {
        self.inputs
            .iter()
            .position(|input| input.name == name)
            .map(|index| (self.outputs.len() + index, self.inputs[index].type_id))
    }

    fn lookup_output(&self, name: &str) -> Option<(usize, TypeId)> {
        self.outputs
            .iter()
            .position(|output| output.name == name)
            .map(|index| (index, self.outputs[index].type_id))
    }

    fn current_scope(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("base scope always exists")
    }

    /// Parses a compound body in a fresh scope; leaving the scope pops its
    /// values, running destructors for the non-trivial ones.
    fn parse_scope(&mut self, actions: &Json, path: &str) {
        self.scopes.push(Scope::default());
        self.parse_actions(actions, path);
        let scope = self.scopes.pop().expect("scope pushed above");
        let count = scope.variables.len();
        if count > 0 {
            if scope.variables.iter().all(|variable| variable.trivial) {
                self.instructions.push(Instruction::PopTrivial {
                    count: count as u32,
                });
            } else {
                self.instructions.push(Instruction::Pop {
                    count: count as u32,
                });
            }
            self.stack_height -= count;
        }
    }

    fn push_jump_placeholder(&mut self, kind: JumpKind) -> usize {
        let index = self.instructions.len();
        self.instructions.push(match kind {
            JumpKind::Unconditional => Instruction::Jump { offset: 0 },
            JumpKind::IfFalse => Instruction::JumpIfFalse { offset: 0 },
        });
        index
    }

    /// Points the placeholder at the next emitted instruction.
    fn patch_jump(&mut self, index: usize) {
        let offset = self.instructions.len() as i32 - (index as i32 + 1);
        self.instructions[index] = match self.instructions[index] {
            Instruction::Jump { .. } => Instruction::Jump { offset },
            Instruction::JumpIfFalse { .. } => Instruction::JumpIfFalse { offset },
            other => other,
        };
    }
}

enum JumpKind {
    Unconditional,
    IfFalse,
}
