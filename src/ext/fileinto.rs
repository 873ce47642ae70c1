//! The `fileinto` extension: file the message into a named mailbox. The
//! action itself is the core store action; this extension contributes the
//! operation that queues it.

use crate::actions::StoreAction;
use crate::assemble::{AssembleError, ProgramBuilder};
use crate::extension::Extension;
use crate::interpreter::Interpreter;
use crate::ops::Operation;
use crate::result::SieveResult;
use crate::runtime::{RunResult, RuntimeError, TraceLevel};

pub const NAME: &str = "fileinto";

pub struct ExtFileinto;

impl Extension for ExtFileinto {
    fn name(&self) -> &'static str {
        NAME
    }

    fn operations(&self) -> &[&'static dyn Operation] {
        static OPS: [&'static dyn Operation; 1] = [&FILEINTO_OP];
        &OPS
    }
}

struct FileintoOp;

static FILEINTO_OP: FileintoOp = FileintoOp;

impl Operation for FileintoOp {
    fn mnemonic(&self) -> &'static str {
        "FILEINTO"
    }

    fn execute(&self, it: &mut Interpreter<'_>, result: &mut SieveResult) -> RunResult<()> {
        let line = it.next_integer()? as u32;
        let side_effects = it.read_side_effects()?;
        let mailbox = String::from_utf8(it.read_operand_string()?).map_err(|_| {
            RuntimeError::Script { line, message: "invalid mailbox name".to_string() }
        })?;
        if mailbox.is_empty() {
            return Err(RuntimeError::Script {
                line,
                message: "mailbox name is empty".to_string(),
            });
        }
        it.trace(TraceLevel::Actions, &format!("fileinto \"{mailbox}\""));
        result.add_action(it.env(), Box::new(StoreAction::new(mailbox)), side_effects, line)
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        use std::fmt::Write as _;

        let line = it.next_integer()?;
        let side_effects = it.read_side_effects()?;
        let mailbox = it.read_operand_string()?;
        let _ = writeln!(out, "      line {line} \"{}\"", String::from_utf8_lossy(&mailbox));
        for effect in &side_effects {
            let _ = writeln!(out, "      + {}", effect.describe());
        }
        Ok(())
    }
}

/// Emits a `fileinto` with a side-effect list: the caller emits
/// `effect_count` side-effect operands, then the mailbox string operand.
pub fn emit_start(
    pb: &mut ProgramBuilder,
    line: u32,
    effect_count: u64,
) -> Result<(), AssembleError> {
    pb.emit_ext_op(NAME, 0)?;
    pb.raw_integer(u64::from(line));
    pb.raw_integer(effect_count);
    Ok(())
}

/// Emits a plain `fileinto "mailbox"`.
pub fn emit(pb: &mut ProgramBuilder, line: u32, mailbox: &str) -> Result<(), AssembleError> {
    emit_start(pb, line, 0)?;
    pb.emit_string(mailbox.as_bytes());
    Ok(())
}
