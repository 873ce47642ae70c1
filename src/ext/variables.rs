//! The `variables` extension: named variable storage, the `set` operation,
//! and the substituted-string operand that splices `${n}` match values and
//! variable contents into string operands. Linking this extension enables
//! match-value capture in the interpreter.

use crate::assemble::{AssembleError, ProgramBuilder};
use crate::extension::{Extension, ExtensionId};
use crate::interpreter::Interpreter;
use crate::operand::StringOperandDef;
use crate::ops::Operation;
use crate::result::SieveResult;
use crate::runtime::{RunResult, RuntimeError, TraceLevel};

pub const NAME: &str = "variables";

/// Cap on distinct variables per script.
pub const MAX_VARIABLES: usize = 256;

pub struct ExtVariables;

impl Extension for ExtVariables {
    fn name(&self) -> &'static str {
        NAME
    }

    fn interpreter_load(&self, it: &mut Interpreter<'_>, id: ExtensionId) -> RunResult<()> {
        it.enable_match_values();
        it.set_extension_context(id, Box::new(VariablesContext::default()));
        Ok(())
    }

    fn operations(&self) -> &[&'static dyn Operation] {
        static OPS: [&'static dyn Operation; 1] = [&SET_OP];
        &OPS
    }

    fn string_operands(&self) -> &[&'static dyn StringOperandDef] {
        static OPERANDS: [&'static dyn StringOperandDef; 1] = [&SUBSTITUTED_STRING];
        &OPERANDS
    }
}

#[derive(Default)]
struct VariablesContext {
    storage: Vec<Vec<u8>>,
}

fn context_id(it: &Interpreter<'_>) -> RunResult<ExtensionId> {
    it.registry()
        .by_name(NAME)
        .ok_or_else(|| RuntimeError::corrupt("variables extension not registered"))
}

/// `set` operation: `[variable index, value string]`.
struct SetOp;

static SET_OP: SetOp = SetOp;

impl Operation for SetOp {
    fn mnemonic(&self) -> &'static str {
        "SET"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let index = it.next_integer()? as usize;
        if index >= MAX_VARIABLES {
            return Err(RuntimeError::corrupt("variable index out of range"));
        }
        let value = it.read_operand_string()?;
        it.trace(TraceLevel::Commands, &format!("set variable {index}"));

        let id = context_id(it)?;
        let ctx = it
            .extension_context_mut::<VariablesContext>(id)
            .ok_or_else(|| RuntimeError::corrupt("variables context missing"))?;
        if ctx.storage.len() <= index {
            ctx.storage.resize(index + 1, Vec::new());
        }
        ctx.storage[index] = value;
        Ok(())
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        use std::fmt::Write as _;

        let index = it.next_integer()?;
        let value = it.read_operand_string()?;
        let _ = writeln!(out, "      var {index} = \"{}\"", String::from_utf8_lossy(&value));
        Ok(())
    }
}

/// Segment tags of the substituted-string operand payload.
const SEG_LITERAL: u8 = 0;
const SEG_MATCH_VALUE: u8 = 1;
const SEG_VARIABLE: u8 = 2;

/// A string assembled at read time from literal runs, `${n}` match values,
/// and variable contents. Unset references splice in the empty string.
struct SubstitutedString;

static SUBSTITUTED_STRING: SubstitutedString = SubstitutedString;

impl StringOperandDef for SubstitutedString {
    fn name(&self) -> &'static str {
        "substituted-string"
    }

    fn read(&self, it: &mut Interpreter<'_>) -> RunResult<Vec<u8>> {
        let segments = it.next_integer()? as usize;
        if segments > it.block_len() {
            return Err(RuntimeError::corrupt("segment count exceeds block size"));
        }
        let mut out = Vec::new();
        for _ in 0..segments {
            match it.next_byte()? {
                SEG_LITERAL => {
                    let literal = it.next_string_raw()?;
                    out.extend_from_slice(literal);
                }
                SEG_MATCH_VALUE => {
                    let index = it.next_integer()? as usize;
                    if let Some(value) = it.match_value(index) {
                        out.extend_from_slice(value);
                    }
                }
                SEG_VARIABLE => {
                    let index = it.next_integer()? as usize;
                    let id = context_id(it)?;
                    if let Some(ctx) = it.extension_context::<VariablesContext>(id)
                        && let Some(value) = ctx.storage.get(index)
                    {
                        out.extend_from_slice(value);
                    }
                }
                _ => return Err(RuntimeError::corrupt("unknown string segment tag")),
            }
        }
        Ok(out)
    }
}

/// One piece of a substituted string, for emitters.
pub enum StringSegment<'a> {
    Literal(&'a [u8]),
    MatchValue(u64),
    Variable(u64),
}

/// Emits a substituted-string operand usable anywhere a string operand is
/// expected.
pub fn emit_substituted_string(
    pb: &mut ProgramBuilder,
    segments: &[StringSegment<'_>],
) -> Result<(), AssembleError> {
    pb.emit_ext_string_operand(NAME, 0)?;
    pb.raw_integer(segments.len() as u64);
    for segment in segments {
        match segment {
            StringSegment::Literal(bytes) => {
                pb.raw_byte(SEG_LITERAL);
                pb.raw_string(bytes);
            }
            StringSegment::MatchValue(index) => {
                pb.raw_byte(SEG_MATCH_VALUE);
                pb.raw_integer(*index);
            }
            StringSegment::Variable(index) => {
                pb.raw_byte(SEG_VARIABLE);
                pb.raw_integer(*index);
            }
        }
    }
    Ok(())
}

/// Emits a `set` operation storing a literal value.
pub fn emit_set(pb: &mut ProgramBuilder, index: u64, value: &[u8]) -> Result<(), AssembleError> {
    pb.emit_ext_op(NAME, 0)?;
    pb.raw_integer(index);
    pb.emit_string(value);
    Ok(())
}
