use std::io::Write;

use tracing::warn;

use crate::actions::{
    Action, ActionError, ActionExecEnv, ActionTransaction, DuplicateCheck, RedirectAction,
    StoreAction,
};
use crate::operand::SideEffect;
use crate::runtime::{ExecStatus, MessageData, RunResult, RunStatus, RuntimeError, ScriptEnv};

struct ResultEntry {
    action: Box<dyn Action>,
    side_effects: Vec<Box<dyn SideEffect>>,
    source_line: u32,
    is_keep: bool,
}

enum Phase {
    Started,
    Executed,
    ExecFailed,
}

struct Running {
    entry: ResultEntry,
    transaction: Box<dyn ActionTransaction>,
    phase: Phase,
}

/// The ordered plan of actions built by a script and committed through the
/// two-phase protocol. Appended to only while a script interprets, never
/// during commit.
pub struct SieveResult {
    entries: Vec<ResultEntry>,
    exec_status: ExecStatus,
    implicit_keep_enabled: bool,
    executed: bool,
    executed_count: usize,
    failed_count: usize,
    max_actions: usize,
    max_redirects: usize,
}

impl SieveResult {
    pub fn new(max_actions: usize, max_redirects: usize) -> Self {
        Self {
            entries: Vec::new(),
            exec_status: ExecStatus::default(),
            implicit_keep_enabled: true,
            executed: false,
            executed_count: 0,
            failed_count: 0,
            max_actions,
            max_redirects,
        }
    }

    pub fn action_count(&self) -> usize {
        self.entries.len()
    }

    pub fn redirect_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.action.as_any().downcast_ref::<RedirectAction>().is_some())
            .count()
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Whether part of this result has already been committed (multiscript).
    pub fn executed(&self) -> bool {
        self.executed
    }

    pub fn mark_executed(&mut self) {
        self.executed = true;
    }

    pub fn executed_count(&self) -> usize {
        self.executed_count
    }

    pub fn failed_count(&self) -> usize {
        self.failed_count
    }

    pub fn exec_status(&self) -> &ExecStatus {
        &self.exec_status
    }

    pub fn set_implicit_keep(&mut self, enabled: bool) {
        self.implicit_keep_enabled = enabled;
    }

    pub fn implicit_keep_enabled(&self) -> bool {
        self.implicit_keep_enabled
    }

    pub fn add_keep(
        &mut self,
        env: &ScriptEnv,
        side_effects: Vec<Box<dyn SideEffect>>,
        source_line: u32,
    ) -> RunResult<()> {
        let action = Box::new(StoreAction::new(env.default_mailbox()));
        self.add_action_entry(env, action, side_effects, source_line, true)
    }

    pub fn add_action(
        &mut self,
        env: &ScriptEnv,
        action: Box<dyn Action>,
        side_effects: Vec<Box<dyn SideEffect>>,
        source_line: u32,
    ) -> RunResult<()> {
        self.add_action_entry(env, action, side_effects, source_line, false)
    }

    /// Appends an action unless it collapses into an existing duplicate.
    /// Duplicates merge side-effect lists by set union; conflicts raise a
    /// runtime error at the new action's source line.
    fn add_action_entry(
        &mut self,
        env: &ScriptEnv,
        action: Box<dyn Action>,
        side_effects: Vec<Box<dyn SideEffect>>,
        source_line: u32,
        is_keep: bool,
    ) -> RunResult<()> {
        let mut duplicate = None;
        for (index, entry) in self.entries.iter().enumerate() {
            match action.check_duplicate(env, entry.action.as_ref()) {
                DuplicateCheck::Duplicate => {
                    duplicate = Some(index);
                    break;
                }
                DuplicateCheck::Conflict => {
                    return Err(RuntimeError::Script {
                        line: source_line,
                        message: format!(
                            "implementation of {} action conflicts with earlier {} action",
                            action.name(),
                            entry.action.name()
                        ),
                    });
                }
                DuplicateCheck::Distinct => {}
            }
        }

        if let Some(index) = duplicate {
            let entry = &mut self.entries[index];
            for effect in side_effects {
                let merged = entry
                    .side_effects
                    .iter_mut()
                    .any(|existing| existing.merge(effect.as_ref()));
                if !merged {
                    entry.side_effects.push(effect);
                }
            }
            entry.is_keep |= is_keep;
            return Ok(());
        }

        if self.entries.len() >= self.max_actions {
            return Err(RuntimeError::Script {
                line: source_line,
                message: format!(
                    "total number of actions exceeds policy limit (max {} actions)",
                    self.max_actions
                ),
            });
        }
        self.entries.push(ResultEntry { action, side_effects, source_line, is_keep });
        Ok(())
    }

    /// Commits the accumulated plan: start every action in order, execute
    /// those that started, then commit in insertion order with per-action
    /// rollback on failure. Returns the overall status and whether the
    /// message ended up kept in the default location.
    pub fn execute(&mut self, msg: &MessageData, env: &ScriptEnv) -> (RunStatus, bool) {
        let entries = std::mem::take(&mut self.entries);
        let mut running: Vec<Running> = Vec::with_capacity(entries.len());
        let mut start_error: Option<ActionError> = None;
        let mut exec_error: Option<ActionError> = None;

        {
            let mut aenv = ActionExecEnv { msg, env, exec_status: &mut self.exec_status };

            // Phase 1: acquire resources.
            for entry in entries {
                match entry.action.start(&mut aenv) {
                    Ok(transaction) => {
                        running.push(Running { entry, transaction, phase: Phase::Started });
                    }
                    Err(err) => {
                        warn!(
                            "{}: failed to initiate {} action: {err}",
                            aenv.location(),
                            entry.action.name()
                        );
                        start_error = Some(err);
                        break;
                    }
                }
            }

            if let Some(err) = &start_error {
                for run in running.drain(..) {
                    run.transaction.rollback(&mut aenv, false);
                    self.failed_count += 1;
                }
                let status =
                    if err.temporary { RunStatus::TempFailure } else { RunStatus::Failure };
                drop(aenv);
                return self.fall_back_to_keep(status, msg, env);
            }

            // Phase 2: perform the work.
            for run in &mut running {
                let mut failed = None;
                for effect in &run.entry.side_effects {
                    if let Err(err) = effect.pre_execute(&mut aenv, run.transaction.as_mut()) {
                        failed = Some(err);
                        break;
                    }
                }
                if failed.is_none() {
                    failed = run.transaction.execute(&mut aenv).err();
                }
                run.phase = match failed {
                    None => Phase::Executed,
                    Some(err) => {
                        warn!(
                            "{}: failed to execute {} action at line {}: {err}",
                            aenv.location(),
                            run.entry.action.name(),
                            run.entry.source_line
                        );
                        exec_error = Some(err);
                        Phase::ExecFailed
                    }
                };
            }
        }

        // Phase 3: commit successfully executed actions in insertion order;
        // everything else, and everything after the first commit failure,
        // rolls back. Exactly one terminal hook runs per transaction.
        let mut worst: Option<ActionError> = exec_error;
        let mut keep_pending = true;
        let mut kept = false;
        let mut commit_failed = false;
        {
            let mut aenv = ActionExecEnv { msg, env, exec_status: &mut self.exec_status };
            for run in running {
                match run.phase {
                    Phase::Executed if !commit_failed => {
                        let mut action_keep = true;
                        match run.transaction.commit(&mut aenv, &mut action_keep) {
                            Ok(()) => {
                                self.executed_count += 1;
                                self.executed = true;
                                if !action_keep {
                                    keep_pending = false;
                                }
                                if run.entry.is_keep {
                                    kept = true;
                                }
                            }
                            Err(err) => {
                                self.failed_count += 1;
                                commit_failed = true;
                                worst = Some(err);
                            }
                        }
                    }
                    Phase::Executed => {
                        run.transaction.rollback(&mut aenv, true);
                        self.failed_count += 1;
                    }
                    Phase::Started | Phase::ExecFailed => {
                        run.transaction.rollback(&mut aenv, false);
                        self.failed_count += 1;
                    }
                }
            }
        }

        let status = match &worst {
            None => RunStatus::Ok,
            Some(err) if err.temporary => RunStatus::TempFailure,
            Some(_) => RunStatus::Failure,
        };

        if keep_pending {
            if self.implicit_keep_enabled {
                return match self.perform_implicit_keep(msg, env) {
                    Ok(()) => (status, true),
                    Err(err) if err.temporary => (RunStatus::TempFailure, false),
                    Err(_) => (RunStatus::KeepFailed, false),
                };
            }
            // Keep deferred (multiscript); the message stays in flow.
            return (status, true);
        }

        (status, kept)
    }

    fn fall_back_to_keep(
        &mut self,
        status: RunStatus,
        msg: &MessageData,
        env: &ScriptEnv,
    ) -> (RunStatus, bool) {
        if !self.implicit_keep_enabled {
            return (status, false);
        }
        match self.perform_implicit_keep(msg, env) {
            Ok(()) => (status, true),
            Err(err) if err.temporary => (RunStatus::TempFailure, false),
            Err(_) => (RunStatus::KeepFailed, false),
        }
    }

    /// The fallback store into the default mailbox, run through the same
    /// transaction protocol as any other action.
    pub fn perform_implicit_keep(
        &mut self,
        msg: &MessageData,
        env: &ScriptEnv,
    ) -> Result<(), ActionError> {
        let action = StoreAction::new(env.default_mailbox());
        let mut aenv = ActionExecEnv { msg, env, exec_status: &mut self.exec_status };
        let mut transaction = action.start(&mut aenv)?;
        if let Err(err) = transaction.execute(&mut aenv) {
            transaction.rollback(&mut aenv, false);
            return Err(err);
        }
        let mut keep = true;
        transaction.commit(&mut aenv, &mut keep)?;
        self.executed_count += 1;
        self.executed = true;
        Ok(())
    }

    /// Dry-run rendering of the plan; nothing is committed. Returns whether
    /// an implicit keep would still apply.
    pub fn print(&self, env: &ScriptEnv, out: &mut dyn Write) -> std::io::Result<bool> {
        let mut keep = true;
        writeln!(out)?;
        writeln!(out, "Performed actions:")?;
        writeln!(out)?;
        if self.entries.is_empty() {
            writeln!(out, "  (none)")?;
        }
        for entry in &self.entries {
            let mut action_keep = true;
            entry.action.print(env, out, &mut action_keep)?;
            for effect in &entry.side_effects {
                writeln!(out, "        + {}", effect.describe())?;
            }
            if !action_keep {
                keep = false;
            }
        }
        writeln!(out)?;
        writeln!(out, "Implicit keep:")?;
        writeln!(out)?;
        if keep && self.implicit_keep_enabled {
            writeln!(out, " * store message in folder: {}", env.default_mailbox())?;
        } else {
            writeln!(out, "  (none)")?;
        }
        Ok(keep)
    }
}
