use std::any::Any;
use std::io::Write;
use std::time::SystemTime;

use tracing::{info, warn};

use crate::runtime::{
    ExecStatus, FlagsUpdate, MailErrorKind, MailboxError, MailboxOpenOptions, MessageData,
    ScriptEnv,
};

/// Outcome of comparing a new action against one already in the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateCheck {
    Distinct,
    Duplicate,
    Conflict,
}

/// Failure of one action phase. Temporary errors surface as `TEMP_FAIL` so
/// the caller can retry delivery later.
#[derive(Clone, Debug)]
pub struct ActionError {
    pub temporary: bool,
    pub message: String,
}

impl ActionError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { temporary: false, message: message.into() }
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self { temporary: true, message: message.into() }
    }
}

impl From<MailboxError> for ActionError {
    fn from(err: MailboxError) -> Self {
        Self {
            temporary: err.kind == MailErrorKind::Temporary,
            message: err.message,
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionError {}

/// Execution environment shared by all phases of one commit run.
pub struct ActionExecEnv<'a> {
    pub msg: &'a MessageData,
    pub env: &'a ScriptEnv,
    pub exec_status: &'a mut ExecStatus,
}

impl ActionExecEnv<'_> {
    pub fn location(&self) -> String {
        self.msg.location()
    }
}

/// A deferred, committable effect accumulated in the result. The object
/// carries both the definition (hooks, flags) and its per-instance context.
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this action counts as a delivery attempt for the implicit
    /// keep computation.
    fn tries_deliver(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;

    /// Structural equality for duplicate detection.
    fn equals(&self, env: &ScriptEnv, other: &dyn Action) -> bool;

    /// Authoritative duplicate policy; never inferred from `equals` alone.
    fn check_duplicate(&self, env: &ScriptEnv, other: &dyn Action) -> DuplicateCheck;

    /// One line of dry-run output; clears `keep` when this action would
    /// satisfy delivery.
    fn print(&self, env: &ScriptEnv, out: &mut dyn Write, keep: &mut bool) -> std::io::Result<()>;

    /// Phase one of the commit protocol: acquire resources. A recoverable
    /// problem returns a transaction that will fail at `execute`; an
    /// unrecoverable one fails the whole result.
    fn start(&self, aenv: &mut ActionExecEnv<'_>) -> Result<Box<dyn ActionTransaction>, ActionError>;
}

/// Per-action transaction context. After a successful `start`, exactly one
/// of `commit` or `rollback` consumes it.
pub trait ActionTransaction: Send {
    fn execute(&mut self, aenv: &mut ActionExecEnv<'_>) -> Result<(), ActionError>;

    /// `keep` may be cleared to cancel the implicit keep.
    fn commit(
        self: Box<Self>,
        aenv: &mut ActionExecEnv<'_>,
        keep: &mut bool,
    ) -> Result<(), ActionError>;

    /// `success` tells whether the execute phase had succeeded.
    fn rollback(self: Box<Self>, aenv: &mut ActionExecEnv<'_>, success: bool);

    /// Flag/keyword adjustments contributed by side effects; only
    /// meaningful for store-class transactions.
    fn add_flags(&mut self, flags: &[String], keywords: &[String]) {
        let _ = (flags, keywords);
    }
}

/// Mailbox names compare case-sensitively except for `INBOX`.
pub fn mailbox_equals(a: &str, b: &str) -> bool {
    a == b || (a.eq_ignore_ascii_case("INBOX") && b.eq_ignore_ascii_case("INBOX"))
}

/*
 * Store action
 */

/// The canonical delivery action: file the message into a mailbox. Both
/// the explicit `keep`/`fileinto` commands and the implicit keep resolve to
/// a store.
pub struct StoreAction {
    pub mailbox: String,
}

impl StoreAction {
    pub fn new(mailbox: impl Into<String>) -> Self {
        Self { mailbox: mailbox.into() }
    }
}

impl Action for StoreAction {
    fn name(&self) -> &'static str {
        "store"
    }

    fn tries_deliver(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, _env: &ScriptEnv, other: &dyn Action) -> bool {
        match other.as_any().downcast_ref::<StoreAction>() {
            Some(other) => mailbox_equals(&self.mailbox, &other.mailbox),
            None => false,
        }
    }

    fn check_duplicate(&self, env: &ScriptEnv, other: &dyn Action) -> DuplicateCheck {
        if self.equals(env, other) { DuplicateCheck::Duplicate } else { DuplicateCheck::Distinct }
    }

    fn print(&self, _env: &ScriptEnv, out: &mut dyn Write, keep: &mut bool) -> std::io::Result<()> {
        writeln!(out, " * store message in folder: {}", self.mailbox)?;
        *keep = false;
        Ok(())
    }

    fn start(&self, aenv: &mut ActionExecEnv<'_>) -> Result<Box<dyn ActionTransaction>, ActionError> {
        let senv = aenv.env;

        // The host may leave namespaces unset; the store is then disabled
        // and only reported.
        let Some(namespaces) = senv.namespaces.as_ref() else {
            return Ok(Box::new(StoreTransaction {
                mailbox: self.mailbox.clone(),
                mailbox_open: None,
                error: None,
                flags: FlagsUpdate::default(),
                flags_altered: false,
                disabled: true,
                redundant: false,
            }));
        };

        let options = MailboxOpenOptions {
            autocreate: senv.mailbox_autocreate,
            autosubscribe: senv.mailbox_autosubscribe,
        };
        let mut mailbox_open = None;
        let mut error = None;
        let mut redundant = false;

        match namespaces.open_mailbox(&self.mailbox, &options) {
            Ok(open) => {
                // Storing into the folder the message originates from is
                // redundant; only the flag update path runs.
                if let Some(origin) = &aenv.msg.origin_mailbox
                    && mailbox_equals(origin, &self.mailbox)
                {
                    open.rollback();
                    redundant = true;
                } else {
                    mailbox_open = Some(open);
                }
            }
            Err(err) if err.kind == MailErrorKind::NotFound => {
                aenv.exec_status.last_storage = Some(self.mailbox.clone());
                error = Some(err);
            }
            Err(err) => {
                aenv.exec_status.last_storage = Some(self.mailbox.clone());
                return Err(err.into());
            }
        }

        Ok(Box::new(StoreTransaction {
            mailbox: self.mailbox.clone(),
            mailbox_open,
            error,
            flags: FlagsUpdate::default(),
            flags_altered: false,
            disabled: false,
            redundant,
        }))
    }
}

pub struct StoreTransaction {
    mailbox: String,
    mailbox_open: Option<Box<dyn crate::runtime::Mailbox>>,
    error: Option<MailboxError>,
    flags: FlagsUpdate,
    flags_altered: bool,
    disabled: bool,
    redundant: bool,
}

impl ActionTransaction for StoreTransaction {
    fn add_flags(&mut self, flags: &[String], keywords: &[String]) {
        for flag in flags {
            if !self.flags.flags.contains(flag) {
                self.flags.flags.push(flag.clone());
            }
        }
        for keyword in keywords {
            if !self.flags.keywords.contains(keyword) {
                self.flags.keywords.push(keyword.clone());
            }
        }
        self.flags_altered = true;
    }

    fn execute(&mut self, aenv: &mut ActionExecEnv<'_>) -> Result<(), ActionError> {
        if self.disabled {
            return Ok(());
        }

        if self.redundant {
            // Message stays where it is; only flags and keywords change.
            if self.flags_altered
                && let Some(namespaces) = aenv.env.namespaces.as_ref()
            {
                namespaces
                    .update_message_flags(aenv.msg, &self.flags)
                    .map_err(ActionError::from)?;
            }
            return Ok(());
        }

        let Some(mailbox) = self.mailbox_open.as_mut() else {
            let message = match &self.error {
                Some(err) => err.message.clone(),
                None => "mailbox unavailable".to_string(),
            };
            return Err(ActionError::permanent(message));
        };

        if self.mailbox == aenv.env.default_mailbox() {
            aenv.exec_status.tried_default_save = true;
        }
        aenv.exec_status.last_storage = Some(self.mailbox.clone());

        mailbox.copy_message(aenv.msg, &self.flags).map_err(ActionError::from)
    }

    fn commit(
        self: Box<Self>,
        aenv: &mut ActionExecEnv<'_>,
        keep: &mut bool,
    ) -> Result<(), ActionError> {
        let location = aenv.location();

        if self.disabled {
            info!("{location}: store into mailbox '{}' skipped", self.mailbox);
            *keep = false;
            return Ok(());
        }

        if self.redundant {
            info!("{location}: left message in mailbox '{}'", self.mailbox);
            aenv.exec_status.keep_original = true;
            aenv.exec_status.message_saved = true;
            *keep = false;
            return Ok(());
        }

        let Some(mailbox) = self.mailbox_open else {
            return Err(ActionError::permanent(format!(
                "failed to store into mailbox '{}': mailbox unavailable",
                self.mailbox
            )));
        };

        aenv.exec_status.last_storage = Some(self.mailbox.clone());
        match mailbox.commit() {
            Ok(()) => {
                aenv.exec_status.message_saved = true;
                info!("{location}: stored mail into mailbox '{}'", self.mailbox);
                *keep = false;
                Ok(())
            }
            Err(err) => {
                warn!("{location}: failed to store into mailbox '{}': {err}", self.mailbox);
                *keep = true;
                Err(err.into())
            }
        }
    }

    fn rollback(self: Box<Self>, aenv: &mut ActionExecEnv<'_>, success: bool) {
        if success {
            info!("{}: store into mailbox '{}' aborted", aenv.location(), self.mailbox);
        } else {
            let message = match &self.error {
                Some(err) => err.message.clone(),
                None => "unknown error".to_string(),
            };
            warn!(
                "{}: failed to store into mailbox '{}': {message}",
                aenv.location(),
                self.mailbox
            );
        }
        if let Some(mailbox) = self.mailbox_open {
            mailbox.rollback();
        }
    }
}

/*
 * Redirect action
 */

/// Identity under which a redirect registers with the duplicate tracker.
pub fn redirect_duplicate_id(msg: &MessageData, address: &str) -> Option<Vec<u8>> {
    let id = msg.id.as_ref()?;
    Some(format!("{id}-{address}").into_bytes())
}

pub struct RedirectAction {
    pub address: String,
}

impl RedirectAction {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

impl Action for RedirectAction {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn tries_deliver(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, _env: &ScriptEnv, other: &dyn Action) -> bool {
        match other.as_any().downcast_ref::<RedirectAction>() {
            Some(other) => self.address == other.address,
            None => false,
        }
    }

    fn check_duplicate(&self, env: &ScriptEnv, other: &dyn Action) -> DuplicateCheck {
        if self.equals(env, other) { DuplicateCheck::Duplicate } else { DuplicateCheck::Distinct }
    }

    fn print(&self, _env: &ScriptEnv, out: &mut dyn Write, keep: &mut bool) -> std::io::Result<()> {
        writeln!(out, " * redirect message to: {}", self.address)?;
        *keep = false;
        Ok(())
    }

    fn start(&self, _aenv: &mut ActionExecEnv<'_>) -> Result<Box<dyn ActionTransaction>, ActionError> {
        Ok(Box::new(RedirectTransaction { address: self.address.clone() }))
    }
}

pub struct RedirectTransaction {
    address: String,
}

impl ActionTransaction for RedirectTransaction {
    fn execute(&mut self, aenv: &mut ActionExecEnv<'_>) -> Result<(), ActionError> {
        let Some(sender) = aenv.env.redirect.as_ref() else {
            return Err(ActionError::permanent(format!(
                "failed to redirect to <{}>: no redirect transport available",
                self.address
            )));
        };
        sender.send(aenv.msg, &self.address).map_err(ActionError::from)
    }

    fn commit(
        self: Box<Self>,
        aenv: &mut ActionExecEnv<'_>,
        keep: &mut bool,
    ) -> Result<(), ActionError> {
        if let Some(tracker) = aenv.env.duplicates.as_ref()
            && let Some(id) = redirect_duplicate_id(aenv.msg, &self.address)
        {
            tracker.mark(&id, &aenv.env.username, SystemTime::now());
        }
        info!("{}: forwarded to <{}>", aenv.location(), self.address);
        *keep = false;
        Ok(())
    }

    fn rollback(self: Box<Self>, aenv: &mut ActionExecEnv<'_>, _success: bool) {
        info!("{}: redirect to <{}> aborted", aenv.location(), self.address);
    }
}

/*
 * Discard action
 */

/// Cancels the implicit keep without attempting any delivery.
pub struct DiscardAction;

impl Action for DiscardAction {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, _env: &ScriptEnv, other: &dyn Action) -> bool {
        other.as_any().downcast_ref::<DiscardAction>().is_some()
    }

    fn check_duplicate(&self, env: &ScriptEnv, other: &dyn Action) -> DuplicateCheck {
        // Discard is idempotent.
        if self.equals(env, other) { DuplicateCheck::Duplicate } else { DuplicateCheck::Distinct }
    }

    fn print(&self, _env: &ScriptEnv, out: &mut dyn Write, keep: &mut bool) -> std::io::Result<()> {
        writeln!(out, " * discard")?;
        *keep = false;
        Ok(())
    }

    fn start(&self, _aenv: &mut ActionExecEnv<'_>) -> Result<Box<dyn ActionTransaction>, ActionError> {
        Ok(Box::new(DiscardTransaction))
    }
}

pub struct DiscardTransaction;

impl ActionTransaction for DiscardTransaction {
    fn execute(&mut self, _aenv: &mut ActionExecEnv<'_>) -> Result<(), ActionError> {
        Ok(())
    }

    fn commit(
        self: Box<Self>,
        aenv: &mut ActionExecEnv<'_>,
        keep: &mut bool,
    ) -> Result<(), ActionError> {
        info!(
            "{}: marked message to be discarded if not explicitly delivered",
            aenv.location()
        );
        *keep = false;
        Ok(())
    }

    fn rollback(self: Box<Self>, _aenv: &mut ActionExecEnv<'_>, _success: bool) {}
}
