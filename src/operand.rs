use std::any::Any;

use crate::actions::{ActionError, ActionExecEnv, ActionTransaction};
use crate::interpreter::Interpreter;
use crate::runtime::RunResult;

/// Operand codes below this value index the fixed core table for their
/// class; higher values select a binary-local extension whose own table is
/// indexed by a further varint code. The same split applies to opcodes.
pub const CUSTOM_CODE_BASE: u8 = 0x40;

/// Core operand codes. The code byte doubles as the class tag for the core
/// carriers; object operands (comparator, match type, address part, side
/// effect) are followed by a secondary code byte.
pub mod codes {
    pub const NUMBER: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const STRING_LIST: u8 = 0x03;
    pub const COMPARATOR: u8 = 0x04;
    pub const MATCH_TYPE: u8 = 0x05;
    pub const ADDRESS_PART: u8 = 0x06;
    pub const SIDE_EFFECT: u8 = 0x07;
}

/// Which part of an address an address test inspects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressPart {
    All,
    LocalPart,
    Domain,
}

impl AddressPart {
    pub fn code(self) -> u8 {
        match self {
            AddressPart::All => 0,
            AddressPart::LocalPart => 1,
            AddressPart::Domain => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AddressPart::All),
            1 => Some(AddressPart::LocalPart),
            2 => Some(AddressPart::Domain),
            _ => None,
        }
    }

    /// Extracts this part from a single addr-spec.
    pub fn extract<'a>(self, address: &'a str) -> &'a str {
        match self {
            AddressPart::All => address,
            AddressPart::LocalPart => match address.rsplit_once('@') {
                Some((local, _)) => local,
                None => address,
            },
            AddressPart::Domain => match address.rsplit_once('@') {
                Some((_, domain)) => domain,
                None => "",
            },
        }
    }
}

/// Splits a header value into bare addr-specs: comma-separated mailboxes,
/// angle-bracket form preferred over display names.
pub fn parse_addresses(header_value: &str) -> Vec<String> {
    header_value
        .split(',')
        .filter_map(|mailbox| {
            let mailbox = mailbox.trim();
            if mailbox.is_empty() {
                return None;
            }
            let addr = match (mailbox.find('<'), mailbox.rfind('>')) {
                (Some(open), Some(close)) if open < close => &mailbox[open + 1..close],
                _ => mailbox,
            };
            let addr = addr.trim();
            if addr.is_empty() { None } else { Some(addr.to_string()) }
        })
        .collect()
}

/// A side-effect definition owned by an extension; `read` parses the
/// operand payload into an instance.
pub trait SideEffectDef: Send + Sync {
    fn name(&self) -> &'static str;

    fn read(&self, it: &mut Interpreter<'_>) -> RunResult<Box<dyn SideEffect>>;
}

/// A side effect attached to an action instance. Applied in insertion
/// order; merged by set union when actions collapse as duplicates.
pub trait SideEffect: Send + Sync {
    fn name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Folds `other` into `self` when two duplicate actions merge. Returns
    /// false when the side effects are unrelated kinds.
    fn merge(&mut self, other: &dyn SideEffect) -> bool;

    /// Invoked before the owning action's execute phase.
    fn pre_execute(
        &self,
        _aenv: &mut ActionExecEnv<'_>,
        _transaction: &mut dyn ActionTransaction,
    ) -> Result<(), ActionError> {
        Ok(())
    }

    /// One-line description for dry-run output.
    fn describe(&self) -> String {
        self.name().to_string()
    }
}

/// An extension-provided string operand variant (e.g. the variables
/// extension's substituted string).
pub trait StringOperandDef: Send + Sync {
    fn name(&self) -> &'static str;

    fn read(&self, it: &mut Interpreter<'_>) -> RunResult<Vec<u8>>;
}
