#![allow(dead_code, unused_imports)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

pub use sieve_engine::{
    AddressPart, Binary, BinaryError, ComparatorSpec, DuplicateTracker, EngineConfig, ExecStatus,
    ExtensionRegistry, FlagsUpdate, Interpreter, MailErrorKind, MailNamespaces, Mailbox,
    MailboxError, MailboxOpenOptions, MatchSpec, MessageData, MessagePart, ProgramBuilder,
    RedirectSender, RunOutcome, RunStatus, RuntimeError, Script, ScriptEnv, SieveEngine,
    SieveResult,
};

/// Everything the fake mail store observed, for assertions.
#[derive(Default)]
pub struct MailStoreLog {
    pub opened: Vec<String>,
    pub copied: Vec<(String, FlagsUpdate)>,
    pub committed: Vec<String>,
    pub rolled_back: Vec<String>,
    pub origin_flag_updates: Vec<FlagsUpdate>,
}

/// In-memory mail store standing in for the host backend. Mailboxes listed
/// in the failure sets misbehave in the corresponding phase.
#[derive(Default)]
pub struct FakeMailStore {
    pub log: Arc<Mutex<MailStoreLog>>,
    pub missing: Vec<String>,
    pub denied: Vec<String>,
    pub unavailable: Vec<String>,
    pub fail_copy: Vec<String>,
    pub fail_commit: Vec<String>,
}

impl FakeMailStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<Mutex<MailStoreLog>> {
        self.log.clone()
    }
}

impl MailNamespaces for FakeMailStore {
    fn open_mailbox(
        &self,
        name: &str,
        options: &MailboxOpenOptions,
    ) -> Result<Box<dyn Mailbox>, MailboxError> {
        if self.denied.iter().any(|m| m == name) {
            return Err(MailboxError::new(MailErrorKind::NoPermission, "permission denied"));
        }
        if self.unavailable.iter().any(|m| m == name) {
            return Err(MailboxError::temporary("mail storage unavailable"));
        }
        if self.missing.iter().any(|m| m == name) && !options.autocreate {
            return Err(MailboxError::not_found(format!("mailbox '{name}' does not exist")));
        }
        self.log.lock().unwrap().opened.push(name.to_string());
        Ok(Box::new(FakeMailbox {
            name: name.to_string(),
            log: self.log.clone(),
            fail_copy: self.fail_copy.iter().any(|m| m == name),
            fail_commit: self.fail_commit.iter().any(|m| m == name),
        }))
    }

    fn update_message_flags(
        &self,
        _msg: &MessageData,
        flags: &FlagsUpdate,
    ) -> Result<(), MailboxError> {
        self.log.lock().unwrap().origin_flag_updates.push(flags.clone());
        Ok(())
    }
}

struct FakeMailbox {
    name: String,
    log: Arc<Mutex<MailStoreLog>>,
    fail_copy: bool,
    fail_commit: bool,
}

impl Mailbox for FakeMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    fn copy_message(&mut self, _msg: &MessageData, flags: &FlagsUpdate) -> Result<(), MailboxError> {
        if self.fail_copy {
            return Err(MailboxError::new(MailErrorKind::NotPossible, "copy failed"));
        }
        self.log.lock().unwrap().copied.push((self.name.clone(), flags.clone()));
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), MailboxError> {
        if self.fail_commit {
            return Err(MailboxError::new(MailErrorKind::NotPossible, "commit failed"));
        }
        self.log.lock().unwrap().committed.push(self.name.clone());
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        self.log.lock().unwrap().rolled_back.push(self.name.clone());
    }
}

#[derive(Default)]
pub struct FakeTracker {
    pub seen: Mutex<HashSet<Vec<u8>>>,
    pub marked: Mutex<Vec<Vec<u8>>>,
}

impl FakeTracker {
    pub fn preloaded(ids: &[&[u8]]) -> Self {
        let tracker = Self::default();
        {
            let mut seen = tracker.seen.lock().unwrap();
            for id in ids {
                seen.insert(id.to_vec());
            }
        }
        tracker
    }
}

impl DuplicateTracker for FakeTracker {
    fn check(&self, id: &[u8], _user: &str) -> bool {
        self.seen.lock().unwrap().contains(id)
    }

    fn mark(&self, id: &[u8], _user: &str, _time: SystemTime) {
        self.seen.lock().unwrap().insert(id.to_vec());
        self.marked.lock().unwrap().push(id.to_vec());
    }
}

#[derive(Default)]
pub struct FakeRedirect {
    pub sent: Mutex<Vec<String>>,
    pub fail: bool,
}

impl RedirectSender for FakeRedirect {
    fn send(&self, _msg: &MessageData, address: &str) -> Result<(), MailboxError> {
        if self.fail {
            return Err(MailboxError::temporary("smtp unavailable"));
        }
        self.sent.lock().unwrap().push(address.to_string());
        Ok(())
    }
}

/// A plain test message with a few headers and a body.
pub fn sample_message() -> MessageData {
    MessageData {
        id: Some("<a@example.org>".to_string()),
        sender: Some("sender@example.org".to_string()),
        recipient: Some("user@example.net".to_string()),
        headers: vec![
            ("From".to_string(), "Alice <alice@example.org>".to_string()),
            ("To".to_string(), "user@example.net".to_string()),
            ("Subject".to_string(), "[sieve] hi".to_string()),
            ("X-Priority".to_string(), "3".to_string()),
        ],
        body: b"hello there\n".to_vec(),
        parts: Vec::new(),
        origin_mailbox: None,
    }
}

pub fn env_with_store(store: FakeMailStore) -> ScriptEnv {
    ScriptEnv {
        namespaces: Some(Arc::new(store)),
        username: "user".to_string(),
        ..ScriptEnv::default()
    }
}

/// A builder over a fresh engine's registry.
pub fn builder(engine: &SieveEngine, name: &str) -> ProgramBuilder {
    ProgramBuilder::new(engine.registry().clone(), Some(name))
}
