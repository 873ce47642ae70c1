use std::any::Any;

use crate::binary::{BLOCK_MAIN_PROGRAM, Binary, BinaryError, Block};
use crate::comparator::{Comparator, core_comparators};
use crate::extension::{Extension, ExtensionId, ExtensionRegistry};
use crate::matching::{MatchType, core_match_types};
use crate::operand::{AddressPart, CUSTOM_CODE_BASE, SideEffect, codes};
use crate::ops::{Operation, core_operations};
use crate::result::SieveResult;
use crate::runtime::{MessageData, RunResult, RuntimeError, ScriptEnv, TraceLevel};

/// Maximum loop nesting, shared across nested interpreters.
pub const MAX_LOOP_DEPTH: usize = 4;

/// How a run of the interpreter ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
}

/// One live program loop. The frame context dies when the frame unwinds.
pub struct LoopFrame {
    level: usize,
    begin: usize,
    end: usize,
    ext_id: Option<ExtensionId>,
    context: Option<Box<dyn Any>>,
}

impl LoopFrame {
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn ext_id(&self) -> Option<ExtensionId> {
        self.ext_id
    }

    pub fn set_context(&mut self, context: Box<dyn Any>) {
        self.context = Some(context);
    }

    pub fn context<T: 'static>(&self) -> Option<&T> {
        self.context.as_ref()?.downcast_ref::<T>()
    }

    pub fn context_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.context.as_mut()?.downcast_mut::<T>()
    }
}

enum ObjectRef<'r> {
    Core(u8),
    Ext(&'r dyn Extension, usize),
}

/// Stack-less, address-driven interpreter over one program block. Operation
/// handlers consume their own operands and advance the program counter.
pub struct Interpreter<'r> {
    registry: &'r ExtensionRegistry,
    binary: &'r Binary,
    block: &'r Block,
    msg: &'r MessageData,
    env: &'r ScriptEnv,
    pc: usize,
    reset_vector: usize,
    test_result: bool,
    interrupted: bool,
    stopped: bool,
    loop_stack: Vec<LoopFrame>,
    loop_limit: usize,
    parent_loop_level: usize,
    contexts: Vec<Option<Box<dyn Any>>>,
    match_values: Vec<Vec<u8>>,
    match_values_enabled: bool,
    current_op_address: usize,
}

impl<'r> Interpreter<'r> {
    pub fn new(
        registry: &'r ExtensionRegistry,
        binary: &'r Binary,
        msg: &'r MessageData,
        env: &'r ScriptEnv,
    ) -> RunResult<Self> {
        Self::with_parent_loop_level(registry, binary, msg, env, 0)
    }

    /// A nested interpreter inherits the parent's loop level so the nesting
    /// cap applies across the whole chain.
    pub fn with_parent_loop_level(
        registry: &'r ExtensionRegistry,
        binary: &'r Binary,
        msg: &'r MessageData,
        env: &'r ScriptEnv,
        parent_loop_level: usize,
    ) -> RunResult<Self> {
        let block = binary
            .block(BLOCK_MAIN_PROGRAM)
            .ok_or_else(|| RuntimeError::corrupt("missing main program block"))?;
        let mut it = Self {
            registry,
            binary,
            block,
            msg,
            env,
            pc: 0,
            reset_vector: 0,
            test_result: false,
            interrupted: false,
            stopped: false,
            loop_stack: Vec::new(),
            loop_limit: 0,
            parent_loop_level,
            contexts: Vec::new(),
            match_values: Vec::new(),
            match_values_enabled: false,
            current_op_address: 0,
        };
        it.load_prologue()?;
        Ok(it)
    }

    /// Runs preloaded extension hooks, then the extension list emitted at
    /// the start of the program block. The address after the prologue is
    /// the reset vector.
    fn load_prologue(&mut self) -> RunResult<()> {
        let preloaded: Vec<(ExtensionId, &'r dyn Extension)> =
            self.registry.preloaded().map(|(id, ext)| (id, &**ext)).collect();
        for (id, ext) in preloaded {
            ext.interpreter_load(self, id)?;
        }

        let count = self.next_integer()?;
        for _ in 0..count {
            let index = self.next_integer()?;
            let (id, ext) = self.linked_ext(index as u32)?;
            ext.interpreter_load(self, id)?;
        }
        self.reset_vector = self.pc;
        Ok(())
    }

    fn linked_ext(&self, index: u32) -> RunResult<(ExtensionId, &'r dyn Extension)> {
        let entry = self
            .binary
            .linked_extension(index)
            .ok_or_else(|| RuntimeError::corrupt(format!("invalid extension index {index}")))?;
        let ext = self
            .registry
            .get(entry.ext_id)
            .ok_or_else(|| RuntimeError::corrupt(format!("unlinked extension index {index}")))?;
        Ok((entry.ext_id, &**ext))
    }

    /* Accessors */

    pub fn message(&self) -> &'r MessageData {
        self.msg
    }

    pub fn env(&self) -> &'r ScriptEnv {
        self.env
    }

    pub fn binary(&self) -> &'r Binary {
        self.binary
    }

    pub fn registry(&self) -> &'r ExtensionRegistry {
        self.registry
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn block_len(&self) -> usize {
        self.block.len()
    }

    /// Address of the opcode byte of the operation currently executing.
    pub fn current_op_address(&self) -> usize {
        self.current_op_address
    }

    pub fn test_result(&self) -> bool {
        self.test_result
    }

    pub fn set_test_result(&mut self, result: bool) {
        self.test_result = result;
    }

    /* Primitive reads off the program block */

    fn bin_err(err: BinaryError) -> RuntimeError {
        RuntimeError::corrupt(err.to_string())
    }

    pub fn next_byte(&mut self) -> RunResult<u8> {
        self.block.read_byte(&mut self.pc).map_err(Self::bin_err)
    }

    pub fn next_integer(&mut self) -> RunResult<u64> {
        self.block.read_integer(&mut self.pc).map_err(Self::bin_err)
    }

    pub fn next_offset(&mut self) -> RunResult<i32> {
        self.block.read_offset(&mut self.pc).map_err(Self::bin_err)
    }

    pub fn next_string_raw(&mut self) -> RunResult<&'r [u8]> {
        self.block.read_string(&mut self.pc).map_err(Self::bin_err)
    }

    /* Typed operand reads */

    pub fn read_operand_number(&mut self) -> RunResult<u64> {
        let code = self.next_byte()?;
        if code != codes::NUMBER {
            return Err(RuntimeError::corrupt("expected number operand"));
        }
        self.next_integer()
    }

    pub fn read_operand_string(&mut self) -> RunResult<Vec<u8>> {
        let code = self.next_byte()?;
        self.read_string_with_code(code)
    }

    fn read_string_with_code(&mut self, code: u8) -> RunResult<Vec<u8>> {
        if code == codes::STRING {
            return Ok(self.next_string_raw()?.to_vec());
        }
        if code >= CUSTOM_CODE_BASE {
            let (_, ext) = self.linked_ext((code - CUSTOM_CODE_BASE) as u32)?;
            let sub = self.next_integer()? as usize;
            let def = ext
                .string_operands()
                .get(sub)
                .copied()
                .ok_or_else(|| RuntimeError::corrupt("unknown extension string operand"))?;
            return def.read(self);
        }
        Err(RuntimeError::corrupt("expected string operand"))
    }

    /// A string list, or a single string operand treated as a one-element
    /// list.
    pub fn read_operand_string_list(&mut self) -> RunResult<Vec<Vec<u8>>> {
        let code = self.next_byte()?;
        if code != codes::STRING_LIST {
            return Ok(vec![self.read_string_with_code(code)?]);
        }
        let count = self.next_integer()? as usize;
        if count > self.block.len() {
            return Err(RuntimeError::corrupt("string list count exceeds block size"));
        }
        let mut items = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            items.push(self.read_operand_string()?);
        }
        Ok(items)
    }

    fn read_object_code(&mut self, class: u8) -> RunResult<ObjectRef<'r>> {
        let tag = self.next_byte()?;
        if tag != class {
            return Err(RuntimeError::corrupt("operand class mismatch"));
        }
        let code = self.next_byte()?;
        if code < CUSTOM_CODE_BASE {
            return Ok(ObjectRef::Core(code));
        }
        let (_, ext) = self.linked_ext((code - CUSTOM_CODE_BASE) as u32)?;
        let sub = self.next_integer()? as usize;
        Ok(ObjectRef::Ext(ext, sub))
    }

    pub fn read_operand_match_type(&mut self) -> RunResult<&'r dyn MatchType> {
        match self.read_object_code(codes::MATCH_TYPE)? {
            ObjectRef::Core(code) => core_match_types()
                .get(code as usize)
                .copied()
                .ok_or_else(|| RuntimeError::corrupt("unknown match type")),
            ObjectRef::Ext(ext, sub) => ext
                .match_types()
                .get(sub)
                .copied()
                .ok_or_else(|| RuntimeError::corrupt("unknown extension match type")),
        }
    }

    pub fn read_operand_comparator(&mut self) -> RunResult<&'r dyn Comparator> {
        match self.read_object_code(codes::COMPARATOR)? {
            ObjectRef::Core(code) => core_comparators()
                .get(code as usize)
                .copied()
                .ok_or_else(|| RuntimeError::corrupt("unknown comparator")),
            ObjectRef::Ext(ext, sub) => ext
                .comparators()
                .get(sub)
                .copied()
                .ok_or_else(|| RuntimeError::corrupt("unknown extension comparator")),
        }
    }

    pub fn read_operand_address_part(&mut self) -> RunResult<AddressPart> {
        match self.read_object_code(codes::ADDRESS_PART)? {
            ObjectRef::Core(code) => AddressPart::from_code(code)
                .ok_or_else(|| RuntimeError::corrupt("unknown address part")),
            ObjectRef::Ext(..) => Err(RuntimeError::corrupt("unknown extension address part")),
        }
    }

    /// Reads a side-effect list: a varint count followed by that many
    /// side-effect operands.
    pub fn read_side_effects(&mut self) -> RunResult<Vec<Box<dyn SideEffect>>> {
        let count = self.next_integer()? as usize;
        if count > self.block.len() {
            return Err(RuntimeError::corrupt("side effect count exceeds block size"));
        }
        let mut effects = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            match self.read_object_code(codes::SIDE_EFFECT)? {
                ObjectRef::Core(_) => {
                    return Err(RuntimeError::corrupt("unknown core side effect"));
                }
                ObjectRef::Ext(ext, sub) => {
                    let def = ext
                        .side_effects()
                        .get(sub)
                        .copied()
                        .ok_or_else(|| RuntimeError::corrupt("unknown extension side effect"))?;
                    effects.push(def.read(self)?);
                }
            }
        }
        Ok(effects)
    }

    /* Extension context slots, indexed by global extension id */

    pub fn set_extension_context(&mut self, id: ExtensionId, context: Box<dyn Any>) {
        if self.contexts.len() <= id.0 {
            self.contexts.resize_with(id.0 + 1, || None);
        }
        self.contexts[id.0] = Some(context);
    }

    pub fn extension_context<T: 'static>(&self, id: ExtensionId) -> Option<&T> {
        self.contexts.get(id.0)?.as_ref()?.downcast_ref::<T>()
    }

    pub fn extension_context_mut<T: 'static>(&mut self, id: ExtensionId) -> Option<&mut T> {
        self.contexts.get_mut(id.0)?.as_mut()?.downcast_mut::<T>()
    }

    /* Match values */

    pub fn enable_match_values(&mut self) {
        self.match_values_enabled = true;
    }

    pub fn match_values_enabled(&self) -> bool {
        self.match_values_enabled
    }

    /// Atomically replaces the current match-value set.
    pub fn set_match_values(&mut self, values: Vec<Vec<u8>>) {
        self.match_values = values;
    }

    pub fn match_value(&self, index: usize) -> Option<&[u8]> {
        self.match_values.get(index).map(|v| v.as_slice())
    }

    pub fn match_values(&self) -> &[Vec<u8>] {
        &self.match_values
    }

    /* Loop handling */

    pub fn loop_depth(&self) -> usize {
        self.loop_stack.len()
    }

    /// The end address of the innermost live frame, 0 when none is active.
    pub fn loop_limit(&self) -> usize {
        self.loop_limit
    }

    pub fn loop_start(
        &mut self,
        end: usize,
        ext_id: Option<ExtensionId>,
        context: Option<Box<dyn Any>>,
    ) -> RunResult<()> {
        if end <= self.pc {
            return Err(RuntimeError::corrupt("loop end offset precedes loop body"));
        }
        if end > self.block.len() {
            return Err(RuntimeError::corrupt("loop end offset out of range"));
        }
        if self.parent_loop_level + self.loop_stack.len() >= MAX_LOOP_DEPTH {
            return Err(RuntimeError::Script {
                line: 0,
                message: format!(
                    "new program loop exceeds the nesting limit (<= {MAX_LOOP_DEPTH} levels)"
                ),
            });
        }
        let level = self.loop_stack.len();
        self.loop_stack.push(LoopFrame {
            level,
            begin: self.pc,
            end,
            ext_id,
            context,
        });
        self.loop_limit = end;
        self.trace(TraceLevel::Commands, &format!("loop ends at {end:08x}"));
        Ok(())
    }

    pub fn loop_innermost(&self) -> Option<&LoopFrame> {
        self.loop_stack.last()
    }

    pub fn loop_innermost_mut(&mut self) -> Option<&mut LoopFrame> {
        self.loop_stack.last_mut()
    }

    /// Returns to the recorded beginning of the innermost frame.
    pub fn loop_next(&mut self, begin: usize) -> RunResult<()> {
        let frame = self
            .loop_stack
            .last()
            .ok_or_else(|| RuntimeError::corrupt("loop continue without active loop"))?;
        if frame.begin != begin {
            return Err(RuntimeError::corrupt("loop begin offset invalid"));
        }
        self.trace(TraceLevel::Commands, &format!("looping back to {begin:08x}"));
        self.pc = begin;
        Ok(())
    }

    /// Unwinds the frame at `level` and every frame inside it, restores the
    /// loop limit and continues after the broken loop.
    pub fn loop_break(&mut self, level: usize) -> RunResult<()> {
        if level >= self.loop_stack.len() {
            return Err(RuntimeError::corrupt("loop break level invalid"));
        }
        let end = self.loop_stack[level].end;
        self.loop_stack.truncate(level);
        self.loop_limit = self.loop_stack.last().map(|frame| frame.end).unwrap_or(0);
        self.trace(TraceLevel::Commands, &format!("exiting loops at {end:08x}"));
        self.pc = end;
        Ok(())
    }

    pub fn loop_break_innermost(&mut self) -> RunResult<()> {
        if self.loop_stack.is_empty() {
            return Err(RuntimeError::corrupt("loop break without active loop"));
        }
        self.loop_break(self.loop_stack.len() - 1)
    }

    /// Unwinds every loop whose end lies at or before the jump target.
    fn loop_break_out(&mut self, target: usize) {
        while let Some(frame) = self.loop_stack.last() {
            if frame.end <= target {
                self.loop_stack.pop();
            } else {
                break;
            }
        }
        self.loop_limit = self.loop_stack.last().map(|frame| frame.end).unwrap_or(0);
    }

    /* Program flow */

    /// Consumes a 4-byte offset relative to the offset's own address and,
    /// when `jump` holds, transfers control there. With `break_loops` the
    /// jump may leave loops, transparently unwinding their frames;
    /// otherwise the target must stay inside the innermost frame.
    pub fn program_jump(&mut self, jump: bool, break_loops: bool) -> RunResult<()> {
        let jmp_start = self.pc as i64;
        let offset = i64::from(self.next_offset()?);
        let target = jmp_start + offset;
        let loop_limit = if break_loops { 0 } else { self.loop_limit };

        if target > 0
            && target as usize <= self.block.len()
            && (loop_limit == 0 || (target as usize) < loop_limit)
        {
            let target = target as usize;
            if jump {
                self.trace(TraceLevel::Commands, &format!("jumping to {target:08x}"));
                if break_loops {
                    self.loop_break_out(target);
                }
                self.pc = target;
            } else {
                self.trace(TraceLevel::Commands, "not jumping");
            }
            return Ok(());
        }

        if self.loop_limit != 0 {
            Err(RuntimeError::corrupt("jump offset crosses loop boundary"))
        } else {
            Err(RuntimeError::corrupt("jump offset out of range"))
        }
    }

    /// Requests a cooperative yield at the next operation boundary.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Ends the program as if the end of the block had been reached.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn reset(&mut self) {
        self.pc = self.reset_vector;
        self.interrupted = false;
        self.stopped = false;
        self.test_result = false;
        self.loop_stack.clear();
        self.loop_limit = 0;
        self.match_values.clear();
    }

    /// Starts interpretation: signals extension run hooks, then executes
    /// operations until the block ends, an error occurs, or the program is
    /// interrupted.
    pub fn run(&mut self, result: &mut SieveResult) -> RunResult<RunOutcome> {
        let hooks: Vec<(ExtensionId, &'r dyn Extension)> = self
            .registry
            .preloaded()
            .map(|(id, ext)| (id, &**ext))
            .chain(
                self.binary
                    .linked_extensions()
                    .filter_map(|entry| {
                        self.registry.get(entry.ext_id).map(|ext| (entry.ext_id, &**ext))
                    }),
            )
            .collect();
        for (id, ext) in hooks {
            ext.interpreter_run(self, id)?;
        }
        self.continue_run(result)
    }

    /// Resumes after an interrupt; also the main operation loop.
    pub fn continue_run(&mut self, result: &mut SieveResult) -> RunResult<RunOutcome> {
        self.interrupted = false;
        while !self.interrupted && !self.stopped && self.pc < self.block.len() {
            if self.loop_limit != 0 && self.pc > self.loop_limit {
                return Err(RuntimeError::corrupt("program crossed loop boundary"));
            }
            self.execute_operation(result)?;
        }
        Ok(if self.interrupted { RunOutcome::Interrupted } else { RunOutcome::Completed })
    }

    /// Reads the next opcode and resolves it against the core table or a
    /// linked extension's table. Shared by execution and dumping.
    pub fn fetch_operation(&mut self) -> RunResult<&'r dyn Operation> {
        self.current_op_address = self.pc;
        let opcode = self.next_byte()?;
        if opcode < CUSTOM_CODE_BASE {
            return core_operations()
                .get(opcode as usize)
                .copied()
                .ok_or_else(|| RuntimeError::corrupt(format!("invalid opcode {opcode:#04x}")));
        }
        let (_, ext) = self.linked_ext((opcode - CUSTOM_CODE_BASE) as u32)?;
        let sub = self.next_integer()? as usize;
        ext.operations()
            .get(sub)
            .copied()
            .ok_or_else(|| RuntimeError::corrupt("invalid extension opcode"))
    }

    fn execute_operation(&mut self, result: &mut SieveResult) -> RunResult<()> {
        let op = self.fetch_operation()?;
        self.trace(TraceLevel::Commands, &format!("OP: {}", op.mnemonic()));
        op.execute(self, result)
    }

    /// Emits one line to the configured trace sink. Tracing never changes
    /// execution semantics.
    pub fn trace(&self, level: TraceLevel, message: &str) {
        if level == TraceLevel::None || self.env.trace_config.level < level {
            return;
        }
        if let Some(sink) = &self.env.trace_stream
            && let Ok(mut writer) = sink.lock()
        {
            if self.env.trace_config.addresses {
                let _ = writeln!(writer, "[{:08x}] {message}", self.current_op_address);
            } else {
                let _ = writeln!(writer, "{message}");
            }
        }
    }
}
