use script_vm::prelude::*;

use serde_json::json;

fn register_script_function(vm: &mut VirtualMachine, script: &serde_json::Value) -> Function {
    let parsed = match parse_script(vm, script) {
        Ok(parsed) => parsed,
        Err(errors) => panic!("failed to parse script: {errors:?}"),
    };
    let function = parsed
        .functions
        .into_iter()
        .next()
        .expect("script defines a function");
    vm.register_function("Scripts", function)
        .expect("failed to register script function")
}

#[test]
fn if_branches_select_the_maximum() {
    let mut vm = VirtualMachine::new();
    vm.register_module("Scripts").unwrap();

    let script = json!([{
        "definitionType": "function",
        "name": "max",
        "inputs": [
            { "name": "a", "type": "Core.Number" },
            { "name": "b", "type": "Core.Number" }
        ],
        "outputs": [{ "name": "result", "type": "Core.Number" }],
        "actions": [
            {
                "id": "if",
                "condition": {
                    "id": "function_call",
                    "function": "Core.IsGreater",
                    "inputs": [{ "input": "a" }, { "input": "b" }]
                },
                "then": [
                    { "id": "return", "outputs": [{ "input": "a" }] }
                ],
                "else": [
                    { "id": "return", "outputs": [{ "input": "b" }] }
                ]
            }
        ]
    }]);
    let max = register_script_function(&mut vm, &script);

    let result: f64 = max.call(&mut vm, (3.0f64, 2.0f64)).unwrap();
    assert_eq!(result, 3.0);

    let result: f64 = max.call(&mut vm, (2.0f64, 5.0f64)).unwrap();
    assert_eq!(result, 5.0);

    assert_eq!(vm.main_execution_context().used_register_count(), 0);
}

#[test]
fn if_without_else_falls_through() {
    let mut vm = VirtualMachine::new();
    vm.register_module("Scripts").unwrap();

    let script = json!([{
        "definitionType": "function",
        "name": "clamp_to_ten",
        "inputs": [{ "name": "x", "type": "Core.Number" }],
        "outputs": [{ "name": "result", "type": "Core.Number" }],
        "actions": [
            {
                "id": "function_call",
                "function": "Core.Multiply",
                "inputs": [{ "input": "x" }, 1.0],
                "outputs": ["result"]
            },
            {
                "id": "if",
                "condition": {
                    "id": "function_call",
                    "function": "Core.IsGreater",
                    "inputs": [{ "input": "x" }, 10.0]
                },
                "then": [
                    { "id": "return", "outputs": [10.0] }
                ]
            }
        ]
    }]);
    let clamp = register_script_function(&mut vm, &script);

    let result: f64 = clamp.call(&mut vm, (4.0f64,)).unwrap();
    assert_eq!(result, 4.0);

    let result: f64 = clamp.call(&mut vm, (25.0f64,)).unwrap();
    assert_eq!(result, 10.0);
}

#[test]
fn while_loops_count_down_to_zero() {
    let mut vm = VirtualMachine::new();
    vm.register_module("Scripts").unwrap();

    // Counts the subtractions needed to bring x down to zero.
    let script = json!([{
        "definitionType": "function",
        "name": "countdown",
        "inputs": [{ "name": "x", "type": "Core.Number" }],
        "outputs": [{ "name": "steps", "type": "Core.Number" }],
        "actions": [
            { "id": "variable_declaration", "type": "Core.Number", "name": "n" },
            {
                "id": "function_call",
                "function": "Core.Multiply",
                "inputs": [{ "input": "x" }, 1.0],
                "outputs": ["n"]
            },
            {
                "id": "function_call",
                "function": "Core.Multiply",
                "inputs": [0.0, 0.0],
                "outputs": ["steps"]
            },
            {
                "id": "while",
                "condition": {
                    "id": "function_call",
                    "function": "Core.IsGreater",
                    "inputs": [{ "local": "n" }, 0.0]
                },
                "body": [
                    {
                        "id": "function_call",
                        "function": "Core.Subtract",
                        "inputs": [{ "local": "n" }, 1.0],
                        "outputs": ["n"]
                    },
                    {
                        "id": "function_call",
                        "function": "Core.Subtract",
                        "inputs": [{ "local": "steps" }, -1.0],
                        "outputs": ["steps"]
                    }
                ]
            }
        ]
    }]);
    let countdown = register_script_function(&mut vm, &script);

    let result: f64 = countdown.call(&mut vm, (3.0f64,)).unwrap();
    assert_eq!(result, 3.0);

    let result: f64 = countdown.call(&mut vm, (0.0f64,)).unwrap();
    assert_eq!(result, 0.0);

    assert_eq!(vm.main_execution_context().used_register_count(), 0);
}
