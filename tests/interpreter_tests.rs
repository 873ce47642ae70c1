mod common;
use common::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sieve_engine::binary::BLOCK_MAIN_PROGRAM;
use sieve_engine::ext::foreverypart;
use sieve_engine::extension::Extension;
use sieve_engine::ops::Operation;
use sieve_engine::runtime::RunResult;

fn message_with_parts(count: usize) -> MessageData {
    let mut msg = sample_message();
    for index in 0..count {
        msg.parts.push(MessagePart {
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: format!("part {index}").into_bytes(),
        });
    }
    msg
}

/// Test-only extension contributing a counting operation and a cooperative
/// interrupt operation.
struct ProbeExt {
    ops: Vec<&'static dyn Operation>,
}

impl ProbeExt {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        let tick: &'static TickOp = Box::leak(Box::new(TickOp { counter }));
        let interrupt: &'static InterruptOp = Box::leak(Box::new(InterruptOp));
        Self { ops: vec![tick, interrupt] }
    }
}

impl Extension for ProbeExt {
    fn name(&self) -> &'static str {
        "vnd.test.probe"
    }

    fn operations(&self) -> &[&'static dyn Operation] {
        &self.ops
    }
}

struct TickOp {
    counter: Arc<AtomicUsize>,
}

impl Operation for TickOp {
    fn mnemonic(&self) -> &'static str {
        "TICK"
    }

    fn execute(&self, _it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct InterruptOp;

impl Operation for InterruptOp {
    fn mnemonic(&self) -> &'static str {
        "INTERRUPT"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        it.interrupt();
        Ok(())
    }
}

fn probe_registry(counter: Arc<AtomicUsize>) -> Arc<ExtensionRegistry> {
    let mut registry = ExtensionRegistry::new();
    registry
        .register(Arc::new(sieve_engine::ext::foreverypart::ExtForEveryPart))
        .expect("fresh registry accepts registrations");
    registry
        .register(Arc::new(ProbeExt::new(counter)))
        .expect("fresh registry accepts registrations");
    Arc::new(registry)
}

#[test]
fn stop_halts_before_later_operations() {
    let engine = SieveEngine::new();
    let mut pb = builder(&engine, "stop");
    pb.op_stop();
    pb.op_keep(2);
    let binary = pb.finish().expect("program should assemble");

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    let outcome = it.run(&mut result).expect("program should run");
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(result.action_count(), 0);
}

#[test]
fn conditional_jumps_follow_the_test_result_register() {
    let engine = SieveEngine::new();
    let mut pb = builder(&engine, "cond");
    pb.test_exists(&["Subject"]);
    pb.op_jmp_true("has_subject");
    pb.op_discard(2);
    pb.op_stop();
    pb.label("has_subject").unwrap();
    pb.op_keep(4);
    let binary = pb.finish().expect("program should assemble");

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    it.run(&mut result).expect("program should run");
    assert!(it.test_result());
    assert_eq!(result.action_count(), 1);

    let mut out = Vec::new();
    result.print(&env, &mut out).unwrap();
    let plan = String::from_utf8(out).unwrap();
    assert!(plan.contains("store message in folder: INBOX"), "plan was: {plan}");
}

fn raw_program(bytes: &[u8]) -> Binary {
    let mut binary = Binary::new(None);
    binary.emit_integer(0);
    binary.emit_data(bytes);
    binary
}

#[test]
fn jump_beyond_block_end_is_binary_corrupt() {
    let engine = SieveEngine::new();
    let mut binary = Binary::new(None);
    binary.emit_integer(0);
    binary.emit_byte(0x00);
    binary.emit_offset(10_000);

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    let err = it.run(&mut result).expect_err("jump must be rejected");
    assert!(matches!(err, RuntimeError::CorruptBinary(_)));
    assert_eq!(err.status(), RunStatus::BinCorrupt);
}

#[test]
fn jump_to_nonpositive_target_is_binary_corrupt() {
    let engine = SieveEngine::new();
    let mut binary = Binary::new(None);
    binary.emit_integer(0);
    binary.emit_byte(0x00);
    binary.emit_offset(-100);

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    let err = it.run(&mut result).expect_err("jump must be rejected");
    assert!(matches!(err, RuntimeError::CorruptBinary(_)));
}

#[test]
fn unknown_opcode_is_binary_corrupt() {
    let engine = SieveEngine::new();
    let binary = raw_program(&[0x3f]);

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    let err = it.run(&mut result).expect_err("invalid opcode must be rejected");
    assert!(matches!(err, RuntimeError::CorruptBinary(_)));
}

#[test]
fn corrupt_operand_varint_is_binary_corrupt() {
    let engine = SieveEngine::new();
    // keep opcode followed by an unterminated source-line varint.
    let binary = raw_program(&[0x04, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    let err = it.run(&mut result).expect_err("corrupt varint must abort");
    assert_eq!(err.status(), RunStatus::BinCorrupt);
}

#[test]
fn prologue_with_invalid_extension_index_is_rejected() {
    let engine = SieveEngine::new();
    let mut binary = Binary::new(None);
    binary.emit_integer(1);
    binary.emit_integer(9);

    let msg = sample_message();
    let env = ScriptEnv::default();
    let err = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .err()
        .expect("prologue must be rejected");
    assert!(matches!(err, RuntimeError::CorruptBinary(_)));
}

#[test]
fn part_loop_runs_body_once_per_part() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let registry = probe_registry(ticks.clone());

    let mut pb = ProgramBuilder::new(registry.clone(), Some("loop"));
    pb.require("foreverypart").unwrap();
    pb.require("vnd.test.probe").unwrap();
    foreverypart::emit_begin(&mut pb, "end").unwrap();
    pb.label("body").unwrap();
    pb.emit_ext_op("vnd.test.probe", 0).unwrap();
    foreverypart::emit_end(&mut pb, "body").unwrap();
    pb.label("end").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let msg = message_with_parts(3);
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it =
        Interpreter::new(&registry, &binary, &msg, &env).expect("interpreter should initialise");
    let outcome = it.run(&mut result).expect("loop should run");

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
    assert_eq!(it.loop_depth(), 0);
    assert_eq!(it.loop_limit(), 0);
}

#[test]
fn part_loop_skips_body_for_messages_without_parts() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let registry = probe_registry(ticks.clone());

    let mut pb = ProgramBuilder::new(registry.clone(), Some("empty-loop"));
    pb.require("foreverypart").unwrap();
    pb.require("vnd.test.probe").unwrap();
    foreverypart::emit_begin(&mut pb, "end").unwrap();
    pb.label("body").unwrap();
    pb.emit_ext_op("vnd.test.probe", 0).unwrap();
    foreverypart::emit_end(&mut pb, "body").unwrap();
    pb.label("end").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it =
        Interpreter::new(&registry, &binary, &msg, &env).expect("interpreter should initialise");
    it.run(&mut result).expect("loop should be skipped");
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
}

#[test]
fn break_jump_unwinds_nested_loop_frames() {
    let engine = SieveEngine::new();
    let mut pb = builder(&engine, "break");
    pb.require("foreverypart").unwrap();
    foreverypart::emit_begin(&mut pb, "outer_end").unwrap();
    pb.label("outer_body").unwrap();
    foreverypart::emit_begin(&mut pb, "inner_end").unwrap();
    pb.label("inner_body").unwrap();
    foreverypart::emit_break(&mut pb, "outer_end").unwrap();
    foreverypart::emit_end(&mut pb, "inner_body").unwrap();
    pb.label("inner_end").unwrap();
    foreverypart::emit_end(&mut pb, "outer_body").unwrap();
    pb.label("outer_end").unwrap();
    pb.op_keep(9);
    let binary = pb.finish().expect("program should assemble");

    let msg = message_with_parts(2);
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    let outcome = it.run(&mut result).expect("break should unwind cleanly");

    assert_eq!(outcome, RunOutcome::Completed);
    // Both frames are gone and execution resumed after the outer loop.
    assert_eq!(it.loop_depth(), 0);
    assert_eq!(it.loop_limit(), 0);
    assert_eq!(it.pc(), binary.block(BLOCK_MAIN_PROGRAM).unwrap().len());
    assert_eq!(result.action_count(), 1);
}

#[test]
fn plain_jump_may_not_cross_the_loop_boundary() {
    let engine = SieveEngine::new();
    let mut pb = builder(&engine, "cross");
    pb.require("foreverypart").unwrap();
    foreverypart::emit_begin(&mut pb, "end").unwrap();
    pb.label("body").unwrap();
    pb.op_jmp("after");
    foreverypart::emit_end(&mut pb, "body").unwrap();
    pb.label("end").unwrap();
    pb.label("after").unwrap();
    pb.op_stop();
    let binary = pb.finish().expect("program should assemble");

    let msg = message_with_parts(1);
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    let err = it.run(&mut result).expect_err("loop-crossing jump must be rejected");
    assert!(matches!(err, RuntimeError::CorruptBinary(_)));
    assert_eq!(err.status(), RunStatus::BinCorrupt);
}

#[test]
fn address_test_extracts_the_requested_part() {
    let engine = SieveEngine::new();
    let mut pb = builder(&engine, "addr");
    pb.test_address(
        &MatchSpec::Is,
        &ComparatorSpec::AsciiCasemap,
        AddressPart::Domain,
        &["From"],
        &["EXAMPLE.ORG"],
    )
    .unwrap();
    pb.op_jmp_false("end");
    pb.op_keep(2);
    pb.label("end").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    it.run(&mut result).expect("program should run");

    // "Alice <alice@example.org>" resolves to the bare domain.
    assert!(it.test_result());
    assert_eq!(result.action_count(), 1);
}

#[test]
fn size_tests_compare_against_the_body_size() {
    let engine = SieveEngine::new();
    let mut pb = builder(&engine, "size");
    pb.test_size_over(4);
    pb.op_jmp_false("small");
    pb.test_size_under(1_000_000);
    pb.op_stop();
    pb.label("small").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    it.run(&mut result).expect("program should run");
    assert!(it.test_result(), "the sample body is between 4 bytes and 1MB");
}

#[test]
fn trace_stream_records_operations_without_changing_semantics() {
    use std::sync::{Arc, Mutex};

    use sieve_engine::{TraceConfig, TraceLevel};

    let engine = SieveEngine::new();
    let mut pb = builder(&engine, "traced");
    pb.test_exists(&["Subject"]);
    pb.op_jmp_false("end");
    pb.op_keep(2);
    pb.label("end").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let sink: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let env = ScriptEnv {
        trace_stream: Some(sink.clone()),
        trace_config: TraceConfig { level: TraceLevel::Commands, addresses: true },
        ..ScriptEnv::default()
    };

    let msg = sample_message();
    let mut result = SieveResult::new(32, 4);
    let mut it = Interpreter::new(engine.registry(), &binary, &msg, &env)
        .expect("interpreter should initialise");
    it.run(&mut result).expect("program should run");

    assert_eq!(result.action_count(), 1, "tracing must not change the outcome");
    let trace = String::from_utf8(sink.lock().unwrap().clone()).unwrap();
    assert!(trace.contains("OP: EXISTS"), "trace was: {trace}");
    assert!(trace.contains("OP: KEEP"), "trace was: {trace}");
}

#[test]
fn interrupt_yields_and_resumes_at_the_next_operation() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let registry = probe_registry(ticks.clone());

    let mut pb = ProgramBuilder::new(registry.clone(), Some("interrupt"));
    pb.require("vnd.test.probe").unwrap();
    pb.emit_ext_op("vnd.test.probe", 0).unwrap();
    pb.emit_ext_op("vnd.test.probe", 1).unwrap();
    pb.emit_ext_op("vnd.test.probe", 0).unwrap();
    let binary = pb.finish().expect("program should assemble");

    let msg = sample_message();
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    let mut it =
        Interpreter::new(&registry, &binary, &msg, &env).expect("interpreter should initialise");

    let outcome = it.run(&mut result).expect("first leg should run");
    assert_eq!(outcome, RunOutcome::Interrupted);
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    let outcome = it.continue_run(&mut result).expect("second leg should run");
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}
