use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Status classes an execution run can end in. Everything except `Ok` aborts
/// the script; `BinCorrupt` additionally tells the caller to discard the
/// binary and recompile from source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Failure,
    TempFailure,
    BinCorrupt,
    KeepFailed,
}

impl RunStatus {
    /// Exit code mapping for host wrappers (sysexits-style).
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Ok => 0,
            RunStatus::TempFailure => 75,
            RunStatus::Failure | RunStatus::BinCorrupt | RunStatus::KeepFailed => 1,
        }
    }
}

/// Error raised while interpreting bytecode.
#[derive(Clone, Debug)]
pub enum RuntimeError {
    /// The bytecode is malformed: unknown opcode, out-of-range jump,
    /// over-long varint, operand class mismatch.
    CorruptBinary(String),
    /// A normal runtime error raised by script semantics, attributed to a
    /// source line of the script.
    Script { line: u32, message: String },
    /// A retryable failure, e.g. the mail store being unavailable.
    Temporary(String),
}

impl RuntimeError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        RuntimeError::CorruptBinary(message.into())
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RuntimeError::CorruptBinary(_) => RunStatus::BinCorrupt,
            RuntimeError::Script { .. } => RunStatus::Failure,
            RuntimeError::Temporary(_) => RunStatus::TempFailure,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::CorruptBinary(message) => write!(f, "binary corrupt: {message}"),
            RuntimeError::Script { line, message } => {
                write!(f, "runtime error at line {line}: {message}")
            }
            RuntimeError::Temporary(message) => write!(f, "temporary failure: {message}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

pub type RunResult<T> = Result<T, RuntimeError>;

/// Orchestrator-level error codes surfaced to the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SieveError {
    TempFail(String),
    NoPerm(String),
    NoQuota(String),
    NotFound(String),
    NotPossible(String),
    NotValid(String),
    NotReplied(String),
}

impl SieveError {
    /// Exit code mapping for host wrappers: 0 = success, 75 = temporary
    /// failure, 67 = script not found, 78 = configuration error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SieveError::TempFail(_) => 75,
            SieveError::NotFound(_) => 67,
            SieveError::NotValid(_) => 78,
            _ => 1,
        }
    }
}

impl fmt::Display for SieveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SieveError::TempFail(message) => write!(f, "temporary failure: {message}"),
            SieveError::NoPerm(message) => write!(f, "permission denied: {message}"),
            SieveError::NoQuota(message) => write!(f, "quota exceeded: {message}"),
            SieveError::NotFound(message) => write!(f, "not found: {message}"),
            SieveError::NotPossible(message) => write!(f, "not possible: {message}"),
            SieveError::NotValid(message) => write!(f, "not valid: {message}"),
            SieveError::NotReplied(message) => write!(f, "not replied: {message}"),
        }
    }
}

impl std::error::Error for SieveError {}

/// A single MIME-ish part of the message, iterated by the foreverypart loop.
#[derive(Clone, Debug, Default)]
pub struct MessagePart {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The message a script is evaluated against. The engine never parses raw
/// RFC 5322 text; the host hands over the already-split pieces it cares
/// about.
#[derive(Clone, Debug, Default)]
pub struct MessageData {
    /// Message-ID, used for duplicate tracking and log locations.
    pub id: Option<String>,
    /// Envelope sender and final recipient.
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub parts: Vec<MessagePart>,
    /// Mailbox the message already lives in, if any. A store targeting this
    /// mailbox is redundant and only updates flags.
    pub origin_mailbox: Option<String>,
}

impl MessageData {
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// All values of the named header, in order of appearance. Header names
    /// compare case-insensitively.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Log location tag for action messages.
    pub fn location(&self) -> String {
        match &self.id {
            Some(id) => format!("msgid={id}"),
            None => "msgid=unspecified".to_string(),
        }
    }
}

/// Flag and keyword adjustments attached to a store by side effects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagsUpdate {
    pub flags: Vec<String>,
    pub keywords: Vec<String>,
}

impl FlagsUpdate {
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.keywords.is_empty()
    }

    /// Set-union merge, preserving first-seen order.
    pub fn merge(&mut self, other: &FlagsUpdate) {
        for flag in &other.flags {
            if !self.flags.contains(flag) {
                self.flags.push(flag.clone());
            }
        }
        for keyword in &other.keywords {
            if !self.keywords.contains(keyword) {
                self.keywords.push(keyword.clone());
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailErrorKind {
    NotFound,
    NoPermission,
    NoQuota,
    NotPossible,
    Temporary,
}

/// Error reported by the host mail store.
#[derive(Clone, Debug)]
pub struct MailboxError {
    pub kind: MailErrorKind,
    pub message: String,
}

impl MailboxError {
    pub fn new(kind: MailErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::NotFound, message)
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::Temporary, message)
    }
}

impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MailboxError {}

#[derive(Clone, Copy, Debug, Default)]
pub struct MailboxOpenOptions {
    pub autocreate: bool,
    pub autosubscribe: bool,
}

/// An open mailbox with a pending save transaction. Exactly one of
/// `commit` or `rollback` consumes it.
pub trait Mailbox: Send {
    fn name(&self) -> &str;

    /// Copy the message into this mailbox, applying flag adjustments.
    fn copy_message(&mut self, msg: &MessageData, flags: &FlagsUpdate) -> Result<(), MailboxError>;

    fn commit(self: Box<Self>) -> Result<(), MailboxError>;

    fn rollback(self: Box<Self>);
}

/// The host's mailbox namespace handle. `None` in the script environment
/// means a dry run: store actions are disabled and report success.
pub trait MailNamespaces: Send + Sync {
    fn open_mailbox(
        &self,
        name: &str,
        options: &MailboxOpenOptions,
    ) -> Result<Box<dyn Mailbox>, MailboxError>;

    /// Update flags on the message in its origin mailbox; used when a store
    /// turns out to be redundant.
    fn update_message_flags(
        &self,
        msg: &MessageData,
        flags: &FlagsUpdate,
    ) -> Result<(), MailboxError>;
}

/// Transport for redirect actions; the host typically wires this to an SMTP
/// client.
pub trait RedirectSender: Send + Sync {
    fn send(&self, msg: &MessageData, address: &str) -> Result<(), MailboxError>;
}

/// Duplicate-delivery tracking. Check and mark always travel together; a
/// host that cannot mark must not offer checking.
pub trait DuplicateTracker: Send + Sync {
    fn check(&self, id: &[u8], user: &str) -> bool;
    fn mark(&self, id: &[u8], user: &str, time: SystemTime);
}

/// Verbosity of the runtime trace stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TraceLevel {
    #[default]
    None,
    Actions,
    Commands,
    Tests,
    Matching,
}

#[derive(Clone, Default)]
pub struct TraceConfig {
    pub level: TraceLevel,
    /// Include code addresses in trace output.
    pub addresses: bool,
}

pub type TraceSink = Arc<Mutex<dyn Write + Send>>;

/// Host-provided environment for one script run.
#[derive(Clone, Default)]
pub struct ScriptEnv {
    pub namespaces: Option<Arc<dyn MailNamespaces>>,
    pub default_mailbox: Option<String>,
    pub username: String,
    pub mailbox_autocreate: bool,
    pub mailbox_autosubscribe: bool,
    pub duplicates: Option<Arc<dyn DuplicateTracker>>,
    pub redirect: Option<Arc<dyn RedirectSender>>,
    pub trace_stream: Option<TraceSink>,
    pub trace_config: TraceConfig,
}

impl ScriptEnv {
    pub fn default_mailbox(&self) -> &str {
        self.default_mailbox.as_deref().unwrap_or("INBOX")
    }
}

/// Per-run execution status reported back to the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecStatus {
    pub message_saved: bool,
    pub tried_default_save: bool,
    pub last_storage: Option<String>,
    pub keep_original: bool,
}
