use crate::{Instruction, Opcode};

use rstest::rstest;

#[rstest]
#[case(Instruction::Halt)]
#[case(Instruction::Push { count: 0 })]
#[case(Instruction::Push { count: 3 })]
#[case(Instruction::Pop { count: 0xff_ffff })]
#[case(Instruction::PopTrivial { count: 2 })]
#[case(Instruction::PushTrivialConstant { constant: 17 })]
#[case(Instruction::PushTrivialStackValue { stack_index: 0 })]
#[case(Instruction::AssignTrivialStackValue { stack_index: 5 })]
#[case(Instruction::OffsetAddress { register: 3, offset: 0x1234 })]
#[case(Instruction::OffsetAddress { register: 0xff, offset: 0xffff })]
#[case(Instruction::CallNativeFunction { input_count: 2 })]
#[case(Instruction::CallScriptFunction { input_count: 2, output_count: 1 })]
#[case(Instruction::CallScriptFunction { input_count: 0xfff, output_count: 0xfff })]
#[case(Instruction::SubtractNumbers { result: 0, first: 1, second: 2 })]
#[case(Instruction::MultiplyNumbers { result: 0xff, first: 0, second: 0xff })]
#[case(Instruction::IsNumberGreater { result: 7, first: 8, second: 9 })]
#[case(Instruction::Jump { offset: 0 })]
#[case(Instruction::Jump { offset: -1 })]
#[case(Instruction::Jump { offset: -(1 << 23) })]
#[case(Instruction::Jump { offset: (1 << 23) - 1 })]
#[case(Instruction::JumpIfTrue { offset: -42 })]
#[case(Instruction::JumpIfFalse { offset: 42 })]
#[case(Instruction::ConstructInlineValue)]
#[case(Instruction::ConstructValue { alignment: 16, size: 48 })]
#[case(Instruction::ConstructValue { alignment: 0xff, size: 0xffff })]
#[case(Instruction::PushExecutionState)]
#[case(Instruction::SetConstantBaseOffset { base_offset: 1024 })]
#[case(Instruction::Return { output_count: 0 })]
#[case(Instruction::Return { output_count: 0xff })]
fn encode_decode_round_trip(#[case] instruction: Instruction) {
    let raw = instruction.encode();
    let decoded = Instruction::decode(raw).expect("failed to decode instruction");

    assert_eq!(instruction, decoded);
    assert_eq!(instruction.opcode(), decoded.opcode());
}

#[test]
fn opcode_occupies_the_top_byte() {
    let raw = Instruction::Return { output_count: 1 }.encode();

    assert_eq!((raw >> 24) as u8, Opcode::Return.to_u8());
    assert_eq!(raw & 0x00ff_ffff, 1);
}

#[test]
fn negative_jump_offsets_sign_extend() {
    let raw = Instruction::Jump { offset: -3 }.encode();

    match Instruction::decode(raw) {
        Ok(Instruction::Jump { offset }) => assert_eq!(offset, -3),
        other => panic!("unexpected decode result: {:?}", other),
    }
}

#[test]
fn unknown_opcode_is_rejected() {
    let raw = 0xff00_0000u32;

    assert!(Instruction::decode(raw).is_err());
}
