//! The `foreverypart` extension: iterate the message's parts with a real
//! program loop. `begin` pushes a loop frame whose end address comes from a
//! jump offset, `end` loops back to the recorded body start or unwinds the
//! frame, and `break` is a loop-crossing jump.

use crate::assemble::{AssembleError, ProgramBuilder};
use crate::extension::{Extension, ExtensionId};
use crate::interpreter::Interpreter;
use crate::ops::Operation;
use crate::result::SieveResult;
use crate::runtime::{RunResult, RuntimeError, TraceLevel};

pub const NAME: &str = "foreverypart";

pub const OP_BEGIN: u64 = 0;
pub const OP_END: u64 = 1;
pub const OP_BREAK: u64 = 2;

pub struct ExtForEveryPart;

impl Extension for ExtForEveryPart {
    fn name(&self) -> &'static str {
        NAME
    }

    fn operations(&self) -> &[&'static dyn Operation] {
        static OPS: [&'static dyn Operation; 3] = [&BEGIN_OP, &END_OP, &BREAK_OP];
        &OPS
    }
}

struct PartLoopContext {
    index: usize,
}

fn extension_id(it: &Interpreter<'_>) -> RunResult<ExtensionId> {
    it.registry()
        .by_name(NAME)
        .ok_or_else(|| RuntimeError::corrupt("foreverypart extension not registered"))
}

/// The part index the innermost part loop currently visits.
pub fn current_part_index(it: &Interpreter<'_>) -> Option<usize> {
    it.loop_innermost()
        .and_then(|frame| frame.context::<PartLoopContext>())
        .map(|ctx| ctx.index)
}

struct BeginOp;

static BEGIN_OP: BeginOp = BeginOp;

impl Operation for BeginOp {
    fn mnemonic(&self) -> &'static str {
        "PART_BEGIN"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let start = it.pc() as i64;
        let offset = i64::from(it.next_offset()?);
        let end = start + offset;
        if end <= 0 || end as usize > it.block_len() {
            return Err(RuntimeError::corrupt("loop end offset out of range"));
        }
        let end = end as usize;

        let id = extension_id(it)?;
        let parts = it.message().parts.len();
        it.loop_start(end, Some(id), Some(Box::new(PartLoopContext { index: 0 })))?;
        if parts == 0 {
            // Zero iterations: unwind immediately and continue after the
            // loop.
            it.trace(TraceLevel::Commands, "message has no parts, skipping loop");
            return it.loop_break_innermost();
        }
        it.trace(TraceLevel::Commands, &format!("iterating {parts} message parts"));
        Ok(())
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        crate::ops::dump_jump(it, out)
    }
}

struct EndOp;

static END_OP: EndOp = EndOp;

impl Operation for EndOp {
    fn mnemonic(&self) -> &'static str {
        "PART_END"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let start = it.pc() as i64;
        let offset = i64::from(it.next_offset()?);
        let begin = start + offset;
        if begin <= 0 || begin as usize > it.block_len() {
            return Err(RuntimeError::corrupt("loop begin offset out of range"));
        }

        let parts = it.message().parts.len();
        let frame = it
            .loop_innermost_mut()
            .ok_or_else(|| RuntimeError::corrupt("loop end without active loop"))?;
        let ctx = frame
            .context_mut::<PartLoopContext>()
            .ok_or_else(|| RuntimeError::corrupt("loop frame belongs to another extension"))?;
        ctx.index += 1;
        if ctx.index < parts {
            it.loop_next(begin as usize)
        } else {
            it.loop_break_innermost()
        }
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        crate::ops::dump_jump(it, out)
    }
}

struct BreakOp;

static BREAK_OP: BreakOp = BreakOp;

impl Operation for BreakOp {
    fn mnemonic(&self) -> &'static str {
        "PART_BREAK"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        it.program_jump(true, true)
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        crate::ops::dump_jump(it, out)
    }
}

/// Emits the loop opener; jumps to `end_label` when the message has no
/// parts. Place a label for the body directly after this call.
pub fn emit_begin(pb: &mut ProgramBuilder, end_label: &str) -> Result<(), AssembleError> {
    pb.emit_ext_op(NAME, OP_BEGIN)?;
    pb.emit_jump_to(end_label);
    Ok(())
}

/// Emits the loop closer looping back to `body_label`.
pub fn emit_end(pb: &mut ProgramBuilder, body_label: &str) -> Result<(), AssembleError> {
    pb.emit_ext_op(NAME, OP_END)?;
    pb.emit_jump_to(body_label);
    Ok(())
}

/// Emits a loop-crossing break jump to `target_label`.
pub fn emit_break(pb: &mut ProgramBuilder, target_label: &str) -> Result<(), AssembleError> {
    pb.emit_ext_op(NAME, OP_BREAK)?;
    pb.emit_jump_to(target_label);
    Ok(())
}
