use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kagura_vm::{
    ArithOp, Block, BlockKind, Callee, Op, Program, ScriptMachine, TypeRegistry, Value, VarRef,
};
use std::rc::Rc;

/// `sum = 0; loop(n) { sum += 1.5 }`
fn counted_loop(n: f64) -> Rc<Program> {
    let registry = Rc::new(TypeRegistry::new());
    let mut program = Program::new(Rc::clone(&registry));
    let sum = VarRef::new(0, 0);
    let body = program.add_block(
        Block::new(BlockKind::Loop, 1)
            .code(2, Op::PushValue(Value::new_real(&registry, 1.5)))
            .code(2, Op::InlineAssign { op: ArithOp::Add, var: sum }),
    );
    let main = program.add_block(
        Block::new(BlockKind::Normal, 0)
            .with_slots(1)
            .code(1, Op::PushValue(Value::new_real(&registry, 0.0)))
            .code(1, Op::Assign(sum))
            .code(2, Op::PushValue(Value::new_real(&registry, n)))
            .code(2, Op::LoopCount)
            .code(2, Op::JumpIfNot(7))
            .code(2, Op::Call { callee: Callee::Block(body), args: 0 })
            .code(2, Op::LoopBack(3))
            .code(2, Op::Pop),
    );
    program.set_main(main);
    Rc::new(program)
}

/// `threads` microthreads, each running `loop { wait(1) }`.
fn waiting_threads(threads: usize) -> Rc<Program> {
    let registry = Rc::new(TypeRegistry::new());
    let mut program = Program::new(Rc::clone(&registry));
    let worker = program.add_block(
        Block::new(BlockKind::Microthread, 1)
            .code(1, Op::PushValue(Value::new_real(&registry, 1.0)))
            .code(1, Op::Wait)
            .code(1, Op::Jump(0)),
    );
    let mut main = Block::new(BlockKind::Normal, 0);
    for _ in 0..threads {
        main = main.code(1, Op::Call { callee: Callee::Block(worker), args: 0 });
    }
    let main = program.add_block(main);
    program.set_main(main);
    Rc::new(program)
}

fn loop_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    for n in [100.0, 10_000.0] {
        let program = counted_loop(n);
        group.bench_with_input(BenchmarkId::new("counted_loop", n), &program, |b, program| {
            b.iter(|| {
                let mut machine = ScriptMachine::new(Rc::clone(program));
                black_box(machine.run().unwrap())
            });
        });
    }
    group.finish();
}

fn tick_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    for threads in [10, 1000] {
        let program = waiting_threads(threads);
        let mut machine = ScriptMachine::new(program);
        machine.run().unwrap();
        group.bench_function(BenchmarkId::new("resume", threads), |b| {
            b.iter(|| black_box(machine.resume().unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, loop_benchmark, tick_benchmark);
criterion_main!(benches);
