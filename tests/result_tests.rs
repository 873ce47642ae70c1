mod common;
use common::*;

use std::any::Any;
use std::io::Write;
use std::sync::Arc;

use sieve_engine::actions::{
    Action, ActionError, ActionExecEnv, ActionTransaction, DuplicateCheck,
};
use sieve_engine::ext::{fileinto, imap4flags};

fn engine() -> SieveEngine {
    SieveEngine::new()
}

#[test]
fn duplicate_stores_merge_their_side_effects() {
    let engine = engine();
    let mut pb = builder(&engine, "dup");
    pb.require("fileinto").unwrap();
    pb.require("imap4flags").unwrap();
    fileinto::emit_start(&mut pb, 1, 1).unwrap();
    imap4flags::emit_flags_effect(&mut pb, &["\\Seen"]).unwrap();
    pb.emit_string(b"Work");
    fileinto::emit_start(&mut pb, 2, 1).unwrap();
    imap4flags::emit_flags_effect(&mut pb, &["\\Flagged", "\\Seen"]).unwrap();
    pb.emit_string(b"Work");
    let binary = pb.finish().expect("program should assemble");

    let store = FakeMailStore::new();
    let log = store.log();
    let env = env_with_store(store);
    let outcome = engine.execute(&binary, &sample_message(), &env);

    assert_eq!(outcome.status, RunStatus::Ok);
    let log = log.lock().unwrap();
    // One store, carrying the union of both flag lists.
    assert_eq!(log.committed, vec!["Work".to_string()]);
    assert_eq!(log.copied.len(), 1);
    assert_eq!(
        log.copied[0].1.flags,
        vec!["\\Seen".to_string(), "\\Flagged".to_string()]
    );
}

struct ConflictingAction;

impl Action for ConflictingAction {
    fn name(&self) -> &'static str {
        "conflicting"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, _env: &ScriptEnv, _other: &dyn Action) -> bool {
        false
    }

    fn check_duplicate(&self, _env: &ScriptEnv, _other: &dyn Action) -> DuplicateCheck {
        DuplicateCheck::Conflict
    }

    fn print(&self, _env: &ScriptEnv, out: &mut dyn Write, _keep: &mut bool) -> std::io::Result<()> {
        writeln!(out, " * conflicting")
    }

    fn start(
        &self,
        _aenv: &mut ActionExecEnv<'_>,
    ) -> Result<Box<dyn ActionTransaction>, ActionError> {
        Err(ActionError::permanent("never started"))
    }
}

#[test]
fn conflicting_action_raises_a_runtime_error_at_its_source_line() {
    let env = ScriptEnv::default();
    let mut result = SieveResult::new(32, 4);
    result
        .add_action(&env, Box::new(sieve_engine::actions::DiscardAction), Vec::new(), 1)
        .expect("first action is accepted");
    let err = result
        .add_action(&env, Box::new(ConflictingAction), Vec::new(), 7)
        .expect_err("conflict must be reported");
    assert!(matches!(err, RuntimeError::Script { line: 7, .. }));
}

#[test]
fn action_limit_is_enforced() {
    let engine = SieveEngine::with_config(EngineConfig { max_actions: 1, max_redirects: 4 });
    let mut pb = builder(&engine, "limit");
    pb.require("fileinto").unwrap();
    fileinto::emit(&mut pb, 1, "A").unwrap();
    fileinto::emit(&mut pb, 2, "B").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let store = FakeMailStore::new();
    let log = store.log();
    let env = env_with_store(store);
    let outcome = engine.execute(&binary, &sample_message(), &env);

    // The script aborts, and the implicit keep saves the message instead.
    assert_eq!(outcome.status, RunStatus::Failure);
    assert!(outcome.keep);
    assert_eq!(log.lock().unwrap().committed, vec!["INBOX".to_string()]);
}

#[test]
fn commit_failure_rolls_back_the_remaining_actions() {
    let engine = engine();
    let mut pb = builder(&engine, "rollback");
    pb.require("fileinto").unwrap();
    fileinto::emit(&mut pb, 1, "A").unwrap();
    fileinto::emit(&mut pb, 2, "B").unwrap();
    fileinto::emit(&mut pb, 3, "C").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let mut store = FakeMailStore::new();
    store.fail_commit = vec!["B".to_string()];
    let log = store.log();
    let env = env_with_store(store);
    let outcome = engine.execute(&binary, &sample_message(), &env);

    assert_eq!(outcome.status, RunStatus::Failure);
    let log = log.lock().unwrap();
    // Insertion order: A commits, B fails its commit, C rolls back.
    assert_eq!(log.committed, vec!["A".to_string()]);
    assert_eq!(log.rolled_back, vec!["C".to_string()]);
}

#[test]
fn failed_execute_rolls_back_only_that_action() {
    let engine = engine();
    let mut pb = builder(&engine, "partial");
    pb.require("fileinto").unwrap();
    fileinto::emit(&mut pb, 1, "Broken").unwrap();
    fileinto::emit(&mut pb, 2, "Good").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let mut store = FakeMailStore::new();
    store.fail_copy = vec!["Broken".to_string()];
    let log = store.log();
    let env = env_with_store(store);
    let outcome = engine.execute(&binary, &sample_message(), &env);

    assert_eq!(outcome.status, RunStatus::Failure);
    let log = log.lock().unwrap();
    assert_eq!(log.committed, vec!["Good".to_string()]);
    assert_eq!(log.rolled_back, vec!["Broken".to_string()]);
}

#[test]
fn implicit_keep_recovers_a_fully_failed_delivery() {
    let engine = engine();
    let mut pb = builder(&engine, "recover");
    pb.require("fileinto").unwrap();
    fileinto::emit(&mut pb, 1, "Broken").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let mut store = FakeMailStore::new();
    store.fail_copy = vec!["Broken".to_string()];
    let log = store.log();
    let env = env_with_store(store);
    let outcome = engine.execute(&binary, &sample_message(), &env);

    assert_eq!(outcome.status, RunStatus::Failure);
    assert!(outcome.keep, "the message must fall back to the implicit keep");
    assert!(outcome.exec_status.message_saved);
    assert_eq!(log.lock().unwrap().committed, vec!["INBOX".to_string()]);
}

#[test]
fn keep_failed_when_neither_delivery_nor_keep_succeeds() {
    let engine = engine();
    let mut pb = builder(&engine, "lost");
    pb.require("fileinto").unwrap();
    fileinto::emit(&mut pb, 1, "Missing").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let mut store = FakeMailStore::new();
    store.missing = vec!["Missing".to_string()];
    store.denied = vec!["INBOX".to_string()];
    let env = env_with_store(store);
    let outcome = engine.execute(&binary, &sample_message(), &env);

    assert_eq!(outcome.status, RunStatus::KeepFailed);
    assert!(!outcome.keep);
    assert!(!outcome.exec_status.message_saved);
}

#[test]
fn temporary_storage_failure_surfaces_as_temp_fail() {
    let engine = engine();
    let mut pb = builder(&engine, "tempfail");
    pb.require("fileinto").unwrap();
    fileinto::emit(&mut pb, 1, "Flaky").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let mut store = FakeMailStore::new();
    store.unavailable = vec!["Flaky".to_string(), "INBOX".to_string()];
    let env = env_with_store(store);
    let outcome = engine.execute(&binary, &sample_message(), &env);

    assert_eq!(outcome.status, RunStatus::TempFailure);
}

#[test]
fn dry_run_without_namespaces_skips_stores_but_succeeds() {
    let engine = engine();
    let mut pb = builder(&engine, "dry");
    pb.require("fileinto").unwrap();
    fileinto::emit(&mut pb, 1, "Work").unwrap();
    let binary = pb.finish().expect("program should assemble");

    let env = ScriptEnv::default();
    let outcome = engine.execute(&binary, &sample_message(), &env);

    assert_eq!(outcome.status, RunStatus::Ok);
    assert!(!outcome.exec_status.message_saved);
}

// Scenario: fileinto into the mailbox the message already lives in.
#[test]
fn redundant_store_updates_flags_in_place() {
    let engine = engine();
    let mut pb = builder(&engine, "redundant");
    pb.require("fileinto").unwrap();
    pb.require("imap4flags").unwrap();
    fileinto::emit_start(&mut pb, 1, 1).unwrap();
    imap4flags::emit_flags_effect(&mut pb, &["\\Seen"]).unwrap();
    pb.emit_string(b"Work");
    let binary = pb.finish().expect("program should assemble");

    let store = FakeMailStore::new();
    let log = store.log();
    let env = env_with_store(store);
    let mut msg = sample_message();
    msg.origin_mailbox = Some("Work".to_string());

    let outcome = engine.execute(&binary, &msg, &env);

    assert_eq!(outcome.status, RunStatus::Ok);
    assert!(outcome.exec_status.keep_original);
    assert!(outcome.exec_status.message_saved);
    let log = log.lock().unwrap();
    assert!(log.copied.is_empty(), "no copy may take place");
    assert_eq!(log.origin_flag_updates.len(), 1);
    assert_eq!(log.origin_flag_updates[0].flags, vec!["\\Seen".to_string()]);
}

// Scenario: duplicate redirects within one script and across deliveries.
#[test]
fn redirects_collapse_in_script_and_suppress_across_runs() {
    let engine = engine();
    let mut pb = builder(&engine, "fwd");
    pb.op_redirect(1, "a@b");
    pb.op_redirect(2, "a@b");
    let binary = pb.finish().expect("program should assemble");

    let tracker = Arc::new(FakeTracker::default());
    let sender = Arc::new(FakeRedirect::default());
    let env = ScriptEnv {
        duplicates: Some(tracker.clone()),
        redirect: Some(sender.clone()),
        username: "user".to_string(),
        ..ScriptEnv::default()
    };

    let outcome = engine.execute(&binary, &sample_message(), &env);
    assert_eq!(outcome.status, RunStatus::Ok);
    // Two identical redirects collapse into one send.
    assert_eq!(*sender.sent.lock().unwrap(), vec!["a@b".to_string()]);
    assert_eq!(tracker.marked.lock().unwrap().len(), 1);

    // Second delivery of the same message: the tracker suppresses the
    // forward entirely and the implicit keep applies instead.
    let outcome = engine.execute(&binary, &sample_message(), &env);
    assert_eq!(outcome.status, RunStatus::Ok);
    assert!(outcome.keep);
    assert_eq!(sender.sent.lock().unwrap().len(), 1, "no duplicate forward is sent");
}

#[test]
fn redirect_limit_is_enforced() {
    let engine = SieveEngine::with_config(EngineConfig { max_actions: 32, max_redirects: 1 });
    let mut pb = builder(&engine, "fwd-limit");
    pb.op_redirect(1, "a@b");
    pb.op_redirect(2, "c@d");
    let binary = pb.finish().expect("program should assemble");

    let sender = Arc::new(FakeRedirect::default());
    let env = ScriptEnv { redirect: Some(sender), ..ScriptEnv::default() };
    let outcome = engine.execute(&binary, &sample_message(), &env);

    assert_eq!(outcome.status, RunStatus::Failure);
    assert!(outcome.keep, "over-limit script falls back to keep");
}

#[test]
fn discard_cancels_the_implicit_keep() {
    let engine = engine();
    let mut pb = builder(&engine, "discard");
    pb.op_discard(1);
    let binary = pb.finish().expect("program should assemble");

    let store = FakeMailStore::new();
    let log = store.log();
    let env = env_with_store(store);
    let outcome = engine.execute(&binary, &sample_message(), &env);

    assert_eq!(outcome.status, RunStatus::Ok);
    assert!(!outcome.keep);
    assert!(log.lock().unwrap().committed.is_empty());
}
