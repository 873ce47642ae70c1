//! The `imap4flags` extension: the `:flags` side effect carrying IMAP flag
//! and keyword adjustments for store-class actions. Flag lists union when
//! duplicate actions merge.

use std::any::Any;

use crate::actions::{ActionError, ActionExecEnv, ActionTransaction};
use crate::assemble::{AssembleError, ProgramBuilder};
use crate::extension::Extension;
use crate::interpreter::Interpreter;
use crate::operand::{SideEffect, SideEffectDef};
use crate::runtime::{FlagsUpdate, RunResult};

pub const NAME: &str = "imap4flags";

pub struct ExtImap4Flags;

impl Extension for ExtImap4Flags {
    fn name(&self) -> &'static str {
        NAME
    }

    fn side_effects(&self) -> &[&'static dyn SideEffectDef] {
        static DEFS: [&'static dyn SideEffectDef; 1] = [&FLAGS_DEF];
        &DEFS
    }
}

struct FlagsEffectDef;

static FLAGS_DEF: FlagsEffectDef = FlagsEffectDef;

impl SideEffectDef for FlagsEffectDef {
    fn name(&self) -> &'static str {
        "flags"
    }

    fn read(&self, it: &mut Interpreter<'_>) -> RunResult<Box<dyn SideEffect>> {
        let items = it.read_operand_string_list()?;
        let mut update = FlagsUpdate::default();
        for item in items {
            let text = String::from_utf8_lossy(&item).into_owned();
            if text.is_empty() {
                continue;
            }
            // System flags carry a backslash prefix; everything else is an
            // IMAP keyword.
            if text.starts_with('\\') {
                if !update.flags.contains(&text) {
                    update.flags.push(text);
                }
            } else if !update.keywords.contains(&text) {
                update.keywords.push(text);
            }
        }
        Ok(Box::new(FlagsSideEffect { update }))
    }
}

pub struct FlagsSideEffect {
    pub update: FlagsUpdate,
}

impl SideEffect for FlagsSideEffect {
    fn name(&self) -> &'static str {
        "flags"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn merge(&mut self, other: &dyn SideEffect) -> bool {
        match other.as_any().downcast_ref::<FlagsSideEffect>() {
            Some(other) => {
                self.update.merge(&other.update);
                true
            }
            None => false,
        }
    }

    fn pre_execute(
        &self,
        _aenv: &mut ActionExecEnv<'_>,
        transaction: &mut dyn ActionTransaction,
    ) -> Result<(), ActionError> {
        transaction.add_flags(&self.update.flags, &self.update.keywords);
        Ok(())
    }

    fn describe(&self) -> String {
        let mut all: Vec<&str> = self.update.flags.iter().map(|f| f.as_str()).collect();
        all.extend(self.update.keywords.iter().map(|k| k.as_str()));
        format!("add IMAP flags: {}", all.join(" "))
    }
}

/// Emits a `:flags` side-effect operand with the given flag list.
pub fn emit_flags_effect(pb: &mut ProgramBuilder, flags: &[&str]) -> Result<(), AssembleError> {
    pb.emit_side_effect(NAME, 0)?;
    let items: Vec<&[u8]> = flags.iter().map(|f| f.as_bytes()).collect();
    pb.emit_string_list(&items);
    Ok(())
}
