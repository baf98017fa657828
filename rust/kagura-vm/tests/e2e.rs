//! End-to-end tests: assemble programs by hand and execute them on a machine.

use kagura_vm::values::ValueError;
use kagura_vm::{
    ArithOp, Block, BlockId, BlockKind, Callee, CompareOp, MachineConfig, MachineError,
    MachineState, NativeFunction, NativeId, Op, Program, ScriptMachine, StackFrame, TickOutcome,
    TypeRegistry, Value, VarRef,
};
use std::rc::Rc;

/// Program under construction plus a `record(x)` native that appends `x` to
/// the machine's `Vec<f64>` host data.
struct Fixture {
    program: Program,
    registry: Rc<TypeRegistry>,
    record: NativeId,
}

fn fixture() -> Fixture {
    let registry = Rc::new(TypeRegistry::new());
    let mut program = Program::new(Rc::clone(&registry));
    let record = program.add_native(NativeFunction::new("record", Some(1), |m, args| {
        let x = args[0].as_real()?;
        if let Some(log) = m.data_mut::<Vec<f64>>() {
            log.push(x);
        }
        Ok(Value::empty())
    }));
    Fixture {
        program,
        registry,
        record,
    }
}

impl Fixture {
    fn real(&self, x: f64) -> Op {
        Op::PushValue(Value::new_real(&self.registry, x))
    }

    fn record(&self) -> Op {
        Op::Call {
            callee: Callee::Native(self.record),
            args: 1,
        }
    }

    fn start(self, main: Block) -> ScriptMachine {
        self.start_with(main, MachineConfig::default())
    }

    fn start_with(mut self, main: Block, config: MachineConfig) -> ScriptMachine {
        let id = self.program.add_block(main);
        self.program.set_main(id);
        let mut machine = ScriptMachine::with_config(Rc::new(self.program), config);
        machine.set_data(Vec::<f64>::new());
        machine
    }
}

fn g(slot: u32) -> VarRef {
    VarRef::new(0, slot)
}

fn call(block: BlockId, args: usize) -> Op {
    Op::Call {
        callee: Callee::Block(block),
        args,
    }
}

fn call_result(block: BlockId, args: usize) -> Op {
    Op::CallAndPushResult {
        callee: Callee::Block(block),
        args,
    }
}

fn main_block(slots: usize) -> Block {
    Block::new(BlockKind::Normal, 0).named("main").with_slots(slots)
}

fn recorded(machine: &ScriptMachine) -> Vec<f64> {
    machine.data::<Vec<f64>>().cloned().unwrap_or_default()
}

fn global_real(machine: &ScriptMachine, slot: usize) -> f64 {
    machine.global(slot).unwrap().as_real().unwrap()
}

// ─── Expressions ───

#[test]
fn e2e_arithmetic_into_global() {
    let f = fixture();
    let main = main_block(1)
        .code(1, f.real(2.0))
        .code(1, f.real(3.0))
        .code(1, Op::Arith(ArithOp::Add))
        .code(1, f.real(4.0))
        .code(1, Op::Arith(ArithOp::Mul))
        .code(1, Op::Assign(g(0)));
    let mut m = f.start(main);
    assert_eq!(m.run().unwrap(), TickOutcome::Finished);
    assert_eq!(global_real(&m, 0), 20.0);
    assert!(m.is_finished());
    assert!(!m.get_error());
}

#[test]
fn e2e_compare_and_logic() {
    let f = fixture();
    let t = Value::new_boolean(&f.registry, true);
    let fls = Value::new_boolean(&f.registry, false);
    let main = main_block(2)
        .code(1, f.real(1.0))
        .code(1, f.real(2.0))
        .code(1, Op::Compare(CompareOp::Lt))
        .code(1, Op::PushValue(fls.clone()))
        .code(1, Op::LogicAnd)
        .code(1, Op::Assign(g(0)))
        .code(2, Op::PushValue(t))
        .code(2, Op::JumpIfNoPop(9))
        .code(2, Op::PushValue(fls))
        .code(3, Op::Assign(g(1)));
    let mut m = f.start(main);
    m.run().unwrap();
    assert!(!m.global(0).unwrap().as_boolean().unwrap());
    // the condition stays on the stack
    assert!(m.global(1).unwrap().as_boolean().unwrap());
}

#[test]
fn e2e_string_concat_and_append() {
    let f = fixture();
    let main = main_block(1)
        .code(1, Op::PushValue(Value::new_string(&f.registry, "ab")))
        .code(1, Op::PushValue(Value::new_string(&f.registry, "cd")))
        .code(1, Op::Concatenate)
        .code(1, Op::PushValue(Value::new_char(&f.registry, 'e')))
        .code(1, Op::Append)
        .code(1, Op::Assign(g(0)));
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(m.global(0).unwrap().as_string().unwrap(), "abcde");
}

#[test]
fn e2e_empty_array_literal_adopts_element_type() {
    let f = fixture();
    let real_array = f.registry.array_type(&f.registry.real_type());
    let main = main_block(1)
        .code(1, Op::ConstructArray(0))
        .code(1, f.real(1.0))
        .code(1, Op::Append)
        .code(1, f.real(2.0))
        .code(1, Op::Append)
        .code(1, Op::Assign(g(0)));
    let mut m = f.start(main);
    m.run().unwrap();
    let array = m.global(0).unwrap();
    assert_eq!(array.to_string(), "[1, 2]");
    assert_eq!(array.get_type(), Some(real_array));
}

#[test]
fn e2e_inline_char_increment() {
    let f = fixture();
    let main = main_block(1)
        .code(1, Op::PushValue(Value::new_char(&f.registry, 'a')))
        .code(1, Op::Assign(g(0)))
        .code(2, Op::InlineInc(g(0)))
        .code(2, Op::InlineInc(g(0)));
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(m.global(0).unwrap().as_char().unwrap(), 'c');
}

// ─── Copy-on-write through the machine ───

#[test]
fn e2e_uniquified_write_leaves_original() {
    let f = fixture();
    let literal = Value::new_real_array(&f.registry, &[1.0, 2.0, 3.0]);
    let main = main_block(2)
        .code(1, Op::PushValue(literal.clone()))
        .code(1, Op::Assign(g(0)))
        .code(2, Op::PushVariable(g(0)))
        .code(2, Op::Assign(g(1)))
        .code(3, Op::PushVariableWritable(g(1)))
        .code(3, f.real(0.0))
        .code(3, Op::IndexWritable)
        .code(3, f.real(9.0))
        .code(3, Op::AssignWritable);
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(m.global(0).unwrap().to_string(), "[1, 2, 3]");
    assert_eq!(m.global(1).unwrap().to_string(), "[9, 2, 3]");
    assert_eq!(literal.to_string(), "[1, 2, 3]");
}

#[test]
fn e2e_aliased_write_is_shared() {
    let f = fixture();
    let main = main_block(2)
        .code(1, Op::PushValue(Value::new_real_array(&f.registry, &[1.0, 2.0, 3.0])))
        .code(1, Op::Assign(g(0)))
        .code(2, Op::PushVariable(g(0)))
        .code(2, Op::Assign(g(1)))
        .code(3, Op::PushVariable(g(1)))
        .code(3, f.real(0.0))
        .code(3, Op::IndexWritable)
        .code(3, f.real(9.0))
        .code(3, Op::AssignWritable);
    let mut m = f.start(main);
    m.run().unwrap();
    let a = m.global(0).unwrap();
    let b = m.global(1).unwrap();
    assert_eq!(a.to_string(), "[9, 2, 3]");
    assert_eq!(b.to_string(), "[9, 2, 3]");
    assert!(Value::same_body(&a, &b));
}

#[test]
fn e2e_element_write_keeps_array_type() {
    let f = fixture();
    let main = main_block(1)
        .code(1, Op::PushValue(Value::new_real_array(&f.registry, &[1.0, 2.0])))
        .code(1, Op::Assign(g(0)))
        .code(4, Op::PushVariableWritable(g(0)))
        .code(4, f.real(0.0))
        .code(4, Op::IndexWritable)
        .code(4, Op::PushValue(Value::new_string(&f.registry, "oops")))
        .code(4, Op::AssignWritable);
    let mut m = f.start(main);
    assert!(matches!(m.run(), Err(MachineError::TypeMismatch(_))));
    assert!(m.get_error());
    assert_eq!(m.get_error_line(), Some(4));
    assert_eq!(m.global(0).unwrap().to_string(), "[1, 2]");
}

#[test]
fn e2e_empty_array_accepts_any_array_write() {
    let f = fixture();
    let main = main_block(1)
        .code(1, Op::ConstructArray(0))
        .code(1, Op::Assign(g(0)))
        .code(2, Op::PushVariableWritable(g(0)))
        .code(2, Op::PushValue(Value::new_real_array(&f.registry, &[3.0])))
        .code(2, Op::AssignWritable);
    let registry = Rc::clone(&f.registry);
    let mut m = f.start(main);
    m.run().unwrap();
    let value = m.global(0).unwrap();
    assert_eq!(value.to_string(), "[3]");
    assert_eq!(
        value.get_type(),
        Some(registry.array_type(&registry.real_type()))
    );
}

#[test]
fn e2e_element_write_leaves_program_literal() {
    let mut f = fixture();
    let literal = Value::new_real_array(&f.registry, &[1.0, 2.0]);
    let main = main_block(1)
        .code(1, Op::PushValue(literal.clone()))
        .code(1, Op::Assign(g(0)))
        .code(2, Op::PushVariable(g(0)))
        .code(2, f.real(0.0))
        .code(2, Op::IndexWritable)
        .code(2, f.real(9.0))
        .code(2, Op::AssignWritable);
    let id = f.program.add_block(main);
    f.program.set_main(id);
    let program = Rc::new(f.program);

    let mut first = ScriptMachine::new(Rc::clone(&program));
    first.run().unwrap();
    assert_eq!(first.global(0).unwrap().to_string(), "[9, 2]");
    assert_eq!(literal.to_string(), "[1, 2]");

    let mut second = ScriptMachine::new(program);
    second.run().unwrap();
    assert_eq!(second.global(0).unwrap().to_string(), "[9, 2]");
    assert!(!Value::same_body(
        &first.global(0).unwrap(),
        &second.global(0).unwrap()
    ));
}

// ─── Calls ───

#[test]
fn e2e_arguments_bound_to_first_slots() {
    let mut f = fixture();
    let record = f.record();
    let sub = f.program.add_block(
        Block::new(BlockKind::Sub, 1)
            .with_arguments(2)
            .code(10, Op::PushVariable(VarRef::new(1, 0)))
            .code(10, record.clone())
            .code(11, Op::PushVariable(VarRef::new(1, 1)))
            .code(11, record),
    );
    let main = main_block(0)
        .code(1, f.real(7.0))
        .code(1, f.real(8.0))
        .code(1, call(sub, 2));
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(recorded(&m), vec![7.0, 8.0]);
}

#[test]
fn e2e_function_result_pushed() {
    let mut f = fixture();
    let diff = f.program.add_block(
        Block::new(BlockKind::Function, 1)
            .named("diff")
            .with_arguments(2)
            .code(10, Op::PushVariable(VarRef::new(1, 0)))
            .code(10, Op::PushVariable(VarRef::new(1, 1)))
            .code(10, Op::Arith(ArithOp::Sub))
            .code(10, Op::SetResult),
    );
    let main = main_block(1)
        .code(1, f.real(10.0))
        .code(1, f.real(4.0))
        .code(1, call_result(diff, 2))
        .code(1, Op::Assign(g(0)));
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(global_real(&m, 0), 6.0);
}

#[test]
fn e2e_function_early_return() {
    let mut f = fixture();
    let zero = f.real(0.0);
    let minus_one = f.real(-1.0);
    let clamp = f.program.add_block(
        Block::new(BlockKind::Function, 1)
            .named("clamp")
            .with_arguments(1)
            .code(10, Op::PushVariable(VarRef::new(1, 0)))
            .code(10, zero)
            .code(10, Op::Compare(CompareOp::Lt))
            .code(10, Op::JumpIfNot(7))
            .code(11, minus_one)
            .code(11, Op::SetResult)
            .code(11, Op::BreakRoutine)
            .code(12, Op::PushVariable(VarRef::new(1, 0)))
            .code(12, Op::SetResult),
    );
    let main = main_block(2)
        .code(1, f.real(-5.0))
        .code(1, call_result(clamp, 1))
        .code(1, Op::Assign(g(0)))
        .code(2, f.real(5.0))
        .code(2, call_result(clamp, 1))
        .code(2, Op::Assign(g(1)));
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(global_real(&m, 0), -1.0);
    assert_eq!(global_real(&m, 1), 5.0);
}

#[test]
fn e2e_break_routine_skips_rest_of_sub() {
    let mut f = fixture();
    let (one, two, record) = (f.real(1.0), f.real(2.0), f.record());
    let sub = f.program.add_block(
        Block::new(BlockKind::Sub, 1)
            .code(10, one)
            .code(10, record.clone())
            .code(11, Op::BreakRoutine)
            .code(12, two)
            .code(12, record),
    );
    let main = main_block(0)
        .code(1, call(sub, 0))
        .code(2, f.real(3.0))
        .code(2, f.record());
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(recorded(&m), vec![1.0, 3.0]);
}

#[test]
fn e2e_result_requested_from_sub_is_error() {
    let mut f = fixture();
    let sub = f.program.add_block(Block::new(BlockKind::Sub, 1).named("side_effect"));
    let main = main_block(0).code(3, call_result(sub, 0));
    let mut m = f.start(main);
    assert!(matches!(m.run(), Err(MachineError::TypeMismatch(_))));
    assert_eq!(m.get_error_line(), Some(3));
}

#[test]
fn e2e_argument_count_mismatch() {
    let mut f = fixture();
    let sub = f.program.add_block(Block::new(BlockKind::Sub, 1).named("pair").with_arguments(2));
    let main = main_block(0).code(1, f.real(1.0)).code(1, call(sub, 1));
    let mut m = f.start(main);
    match m.run() {
        Err(MachineError::ArgumentCount {
            name,
            expected,
            got,
        }) => {
            assert_eq!(name, "pair");
            assert_eq!(expected, 2);
            assert_eq!(got, 1);
        }
        other => panic!("expected ArgumentCount, got {:?}", other),
    }
}

#[test]
fn e2e_native_arity_checked() {
    let f = fixture();
    let main = main_block(0).code(1, Op::Call {
        callee: Callee::Native(f.record),
        args: 0,
    });
    let mut m = f.start(main);
    assert!(matches!(m.run(), Err(MachineError::ArgumentCount { .. })));
}

#[test]
fn e2e_recursion_limit() {
    let mut f = fixture();
    let id = BlockId(f.program.blocks().len() as u32);
    let recurse = f
        .program
        .add_block(Block::new(BlockKind::Sub, 1).named("recurse").code(5, call(id, 0)));
    assert_eq!(recurse, id);
    let main = main_block(0).code(1, call(recurse, 0));
    let mut m = f.start_with(main, MachineConfig::default().with_max_call_depth(16));
    assert_eq!(m.run(), Err(MachineError::StackOverflow(16)));
    assert_eq!(m.get_error_line(), Some(5));
}

#[test]
fn e2e_microthread_reads_spawner_locals_after_return() {
    let mut f = fixture();
    let record = f.record();
    let worker = f.program.add_block(
        Block::new(BlockKind::Microthread, 2)
            .named("worker")
            .code(20, Op::Yield)
            .code(21, Op::PushVariable(VarRef::new(1, 0)))
            .code(21, record),
    );
    let five = f.real(5.0);
    let spawner = f.program.add_block(
        Block::new(BlockKind::Sub, 1)
            .named("spawner")
            .with_slots(1)
            .code(10, five)
            .code(10, Op::Assign(VarRef::new(1, 0)))
            .code(11, call(worker, 0)),
    );
    let main = main_block(0).code(1, call(spawner, 0));
    let mut m = f.start(main);
    assert_eq!(m.run().unwrap(), TickOutcome::Finished);
    assert_eq!(recorded(&m), vec![5.0]);
    // only the pinned globals remain
    assert_eq!(m.frame_count(), 1);
}

// ─── Loops ───

#[test]
fn e2e_loop_count() {
    let mut f = fixture();
    let body = f
        .program
        .add_block(Block::new(BlockKind::Loop, 1).code(2, Op::InlineInc(g(0))));
    let main = main_block(1)
        .code(1, f.real(0.0))
        .code(1, Op::Assign(g(0)))
        .code(2, f.real(3.0))
        .code(2, Op::LoopCount)
        .code(2, Op::JumpIfNot(7))
        .code(2, call(body, 0))
        .code(2, Op::LoopBack(3))
        .code(2, Op::Pop);
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(global_real(&m, 0), 3.0);
}

#[test]
fn e2e_foreach_sums_elements() {
    let mut f = fixture();
    let body = f.program.add_block(
        Block::new(BlockKind::Loop, 1)
            .with_arguments(1)
            .code(2, Op::PushVariable(VarRef::new(1, 0)))
            .code(
                2,
                Op::InlineAssign {
                    op: ArithOp::Add,
                    var: g(0),
                },
            ),
    );
    let main = main_block(1)
        .code(1, f.real(0.0))
        .code(1, Op::Assign(g(0)))
        .code(2, Op::PushValue(Value::new_real_array(&f.registry, &[1.0, 2.0, 3.5])))
        .code(2, f.real(0.0))
        .code(2, Op::LoopForEach)
        .code(2, Op::JumpIfNot(8))
        .code(2, call(body, 1))
        .code(2, Op::LoopBack(4))
        .code(2, Op::Pop)
        .code(2, Op::Pop);
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(global_real(&m, 0), 6.5);
}

/// loop(10) { ++counter; if counter >= 3 { <exit> } } then `after = 100`.
fn counted_loop_with_exit(f: &mut Fixture, exit: Block) -> Block {
    let three = f.real(3.0);
    let exit = f.program.add_block(exit);
    let body = f.program.add_block(
        Block::new(BlockKind::Loop, 1)
            .code(3, Op::InlineInc(g(0)))
            .code(4, Op::PushVariable(g(0)))
            .code(4, three)
            .code(4, Op::Compare(CompareOp::Ge))
            .code(4, Op::JumpIfNot(6))
            .code(5, call(exit, 0)),
    );
    main_block(2)
        .code(1, f.real(0.0))
        .code(1, Op::Assign(g(0)))
        .code(2, f.real(10.0))
        .code(2, Op::LoopCount)
        .code(2, Op::JumpIfNot(7))
        .code(2, call(body, 0))
        .code(2, Op::LoopBack(3))
        .code(2, Op::Pop)
        .code(6, f.real(100.0))
        .code(6, Op::Assign(g(1)))
}

#[test]
fn e2e_break_loop_from_nested_block() {
    let mut f = fixture();
    let nine = f.real(999.0);
    let exit = Block::new(BlockKind::Normal, 2)
        .code(5, Op::BreakLoop)
        .code(5, nine)
        .code(5, Op::Assign(g(1)));
    let main = counted_loop_with_exit(&mut f, exit);
    let mut m = f.start(main);
    m.run().unwrap();
    assert_eq!(global_real(&m, 0), 3.0);
    assert_eq!(global_real(&m, 1), 100.0);
}

#[test]
fn e2e_break_loop_from_sub_is_error() {
    let mut f = fixture();
    let exit = Block::new(BlockKind::Sub, 2).code(5, Op::BreakLoop);
    let main = counted_loop_with_exit(&mut f, exit);
    let mut m = f.start(main);
    assert_eq!(m.run(), Err(MachineError::BreakOutsideLoop));
    assert_eq!(global_real(&m, 0), 3.0);
    assert_eq!(m.get_error_line(), Some(5));
}

#[test]
fn e2e_break_outside_loop() {
    let f = fixture();
    let main = main_block(0).code(5, Op::BreakLoop);
    let mut m = f.start(main);
    assert_eq!(m.run(), Err(MachineError::BreakOutsideLoop));
    assert_eq!(m.get_error_line(), Some(5));
}

// ─── Errors ───

#[test]
fn e2e_index_out_of_range_records_line() {
    let f = fixture();
    let main = main_block(0)
        .code(1, Op::PushValue(Value::new_real_array(&f.registry, &[1.0, 2.0])))
        .code(2, f.real(5.0))
        .code(7, Op::Index);
    let mut m = f.start(main);
    let err = m.run().unwrap_err();
    assert_eq!(
        err,
        MachineError::Value(ValueError::IndexOutOfRange {
            index: 5,
            length: 2
        })
    );
    assert!(m.get_error());
    assert!(m.is_finished());
    assert!(m.get_stopped());
    assert_eq!(m.state(), MachineState::Finished);
    assert_eq!(m.get_error_line(), Some(7));
    assert!(m.get_error_message().unwrap().contains("out of range"));
}

#[test]
fn e2e_raise_error_from_native() {
    let mut f = fixture();
    let fail = f.program.add_native(NativeFunction::new("fail", Some(0), |m, _| {
        m.raise_error("boom");
        Ok(Value::empty())
    }));
    let main = main_block(0)
        .code(4, Op::Call {
            callee: Callee::Native(fail),
            args: 0,
        })
        .code(5, f.real(1.0))
        .code(5, f.record());
    let mut m = f.start(main);
    assert_eq!(m.run(), Err(MachineError::Script("boom".to_string())));
    assert_eq!(m.get_error_message().as_deref(), Some("boom"));
    assert_eq!(m.get_error_line(), Some(4));
    assert!(recorded(&m).is_empty());
    assert!(!m.is_terminated());
}

#[test]
fn e2e_native_error_result_stops_machine() {
    let mut f = fixture();
    let check = f.program.add_native(NativeFunction::new("check", None, |_, args| {
        if args.is_empty() {
            return Err(MachineError::Script("check needs an argument".to_string()));
        }
        Ok(Value::empty())
    }));
    let main = main_block(0).code(9, Op::Call {
        callee: Callee::Native(check),
        args: 0,
    });
    let mut m = f.start(main);
    assert!(m.run().is_err());
    assert_eq!(m.get_error_message().as_deref(), Some("check needs an argument"));
    assert_eq!(m.get_error_line(), Some(9));
}

#[test]
fn e2e_unknown_level_and_slot() {
    let f = fixture();
    let main = main_block(1).code(1, Op::PushVariable(VarRef::new(3, 0)));
    let mut m = f.start(main);
    assert_eq!(m.run(), Err(MachineError::UnknownLevel(3)));

    let f = fixture();
    let main = main_block(1).code(1, Op::PushVariable(g(4)));
    let mut m = f.start(main);
    assert_eq!(
        m.run(),
        Err(MachineError::SlotOutOfRange { level: 0, slot: 4 })
    );
}

#[test]
fn e2e_invalid_jump() {
    let f = fixture();
    let main = main_block(0).code(1, Op::Jump(99));
    let mut m = f.start(main);
    assert_eq!(
        m.run(),
        Err(MachineError::InvalidJump { target: 99, len: 1 })
    );
}

#[test]
fn e2e_stack_underflow() {
    let f = fixture();
    let main = main_block(0).code(1, Op::Pop);
    let mut m = f.start(main);
    assert_eq!(m.run(), Err(MachineError::StackUnderflow));
}

#[test]
fn e2e_instruction_limit() {
    let f = fixture();
    let main = main_block(0).code(1, Op::Jump(0));
    let mut m = f.start_with(main, MachineConfig::default().with_instruction_limit(1000));
    assert_eq!(m.run(), Err(MachineError::InstructionLimitExceeded(1000)));
    assert!(m.is_finished());
}

#[test]
fn e2e_no_entry_block() {
    let f = fixture();
    let mut m = ScriptMachine::new(Rc::new(f.program));
    assert_eq!(m.run(), Err(MachineError::NoEntryBlock));
    assert_eq!(m.state(), MachineState::Idle);
}

// ─── Host interface ───

#[test]
fn e2e_stack_trace_from_native() {
    let mut f = fixture();
    let trace = f.program.add_native(NativeFunction::new("trace", Some(0), |m, _| {
        let frames = m.capture_stack_trace();
        m.set_data(frames);
        Ok(Value::empty())
    }));
    let inner = f.program.add_block(
        Block::new(BlockKind::Sub, 1)
            .named("inner")
            .code(20, Op::Nop)
            .code(
                21,
                Op::Call {
                    callee: Callee::Native(trace),
                    args: 0,
                },
            ),
    );
    let main = main_block(0).code(1, call(inner, 0));
    let mut m = f.start(main);
    m.run().unwrap();

    let frames = m.data::<Vec<StackFrame>>().cloned().unwrap();
    assert_eq!(
        frames,
        vec![
            StackFrame {
                block: "main".to_string(),
                ip: 1,
                line: 1
            },
            StackFrame {
                block: "inner".to_string(),
                ip: 2,
                line: 21
            },
        ]
    );
    assert_eq!(
        serde_json::to_value(&frames[1]).unwrap(),
        serde_json::json!({ "block": "inner", "ip": 2, "line": 21 })
    );
    assert!(StackFrame::format_trace(&frames).contains("#0: inner (line 21"));
    assert!(m.data::<Vec<f64>>().is_none());
    assert!(m.capture_stack_trace().is_empty());
}

#[test]
fn e2e_current_line_tracks_execution() {
    let f = fixture();
    let main = main_block(0).code(3, Op::Nop).code(8, Op::Nop);
    let mut m = f.start(main);
    assert_eq!(m.get_current_line(), 0);
    m.run().unwrap();
    assert_eq!(m.get_current_line(), 8);
}

#[test]
fn e2e_host_data_is_typed() {
    let f = fixture();
    let mut m = f.start(main_block(0));
    m.set_data(String::from("stage 1"));
    assert_eq!(m.data::<String>().map(String::as_str), Some("stage 1"));
    assert!(m.data::<u32>().is_none());
    m.data_mut::<String>().unwrap().push('!');
    let taken = m.take_data().unwrap();
    assert_eq!(taken.downcast_ref::<String>().unwrap(), "stage 1!");
    assert!(m.data::<String>().is_none());
}
