//! Compiles and executes Sieve mail-filtering bytecode against a single
//! message, producing a transactional plan of actions (store, redirect,
//! discard) and side effects for a host delivery agent to apply.
//!
//! The pipeline: a [`binary::Binary`] holds versioned bytecode blocks and
//! an extension link table; the [`interpreter::Interpreter`] executes the
//! main program block, dispatching operations through the
//! [`extension::ExtensionRegistry`] and evaluating tests with the match
//! engine; tests and commands accumulate actions in a
//! [`result::SieveResult`], which the [`engine::SieveEngine`] commits
//! through a two-phase transaction with duplicate collapsing and an
//! implicit keep fallback.

pub mod actions;
pub mod assemble;
pub mod binary;
pub mod comparator;
pub mod dump;
pub mod engine;
pub mod ext;
pub mod extension;
pub mod interpreter;
pub mod matching;
pub mod operand;
pub mod ops;
pub mod result;
pub mod runtime;
pub mod wire;

pub use assemble::{AssembleError, ComparatorSpec, MatchSpec, ProgramBuilder};
pub use binary::{BINARY_MAGIC, BLOCK_EXTENSIONS, BLOCK_MAIN_PROGRAM, Binary, BinaryError, Block};
pub use engine::{EngineConfig, ExecOutcome, Multiscript, Script, ScriptCompiler, SieveEngine};
pub use extension::{Extension, ExtensionId, ExtensionRegistry, RegistryError};
pub use interpreter::{Interpreter, LoopFrame, MAX_LOOP_DEPTH, RunOutcome};
pub use matching::{MAX_MATCH_VALUES, MatchSession, MatchType, MatchValuesBuilder};
pub use operand::{AddressPart, SideEffect, SideEffectDef, StringOperandDef};
pub use ops::Operation;
pub use result::SieveResult;
pub use runtime::{
    DuplicateTracker, ExecStatus, FlagsUpdate, MailErrorKind, MailNamespaces, Mailbox,
    MailboxError, MailboxOpenOptions, MessageData, MessagePart, RedirectSender, RunResult,
    RunStatus, RuntimeError, ScriptEnv, SieveError, TraceConfig, TraceLevel,
};
