use std::fmt::Write as _;

use crate::actions::{DiscardAction, RedirectAction, redirect_duplicate_id};
use crate::interpreter::Interpreter;
use crate::matching::MatchSession;
use crate::operand::parse_addresses;
use crate::result::SieveResult;
use crate::runtime::{RunResult, RuntimeError, TraceLevel};

/// An executable operation. Handlers consume their own operands off the
/// program block and advance the program counter.
pub trait Operation: Send + Sync {
    fn mnemonic(&self) -> &'static str;

    fn execute(&self, it: &mut Interpreter<'_>, result: &mut SieveResult) -> RunResult<()>;

    /// Renders this operation's operands for the binary dumper, consuming
    /// them from the block exactly as `execute` would.
    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        let _ = (it, out);
        Ok(())
    }
}

/// Core opcode assignments. Opcodes at `CUSTOM_CODE_BASE` and above select
/// a linked extension instead.
pub mod opcodes {
    pub const JMP: u8 = 0x00;
    pub const JMP_TRUE: u8 = 0x01;
    pub const JMP_FALSE: u8 = 0x02;
    pub const STOP: u8 = 0x03;
    pub const KEEP: u8 = 0x04;
    pub const DISCARD: u8 = 0x05;
    pub const REDIRECT: u8 = 0x06;
    pub const TEST_HEADER: u8 = 0x07;
    pub const TEST_ADDRESS: u8 = 0x08;
    pub const TEST_EXISTS: u8 = 0x09;
    pub const TEST_SIZE_OVER: u8 = 0x0a;
    pub const TEST_SIZE_UNDER: u8 = 0x0b;
}

pub(crate) fn dump_jump(it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
    let start = it.pc() as i64;
    let offset = i64::from(it.next_offset()?);
    let _ = writeln!(out, "      -> {:08x}", start + offset);
    Ok(())
}

fn lossy_list(items: &[Vec<u8>]) -> String {
    items
        .iter()
        .map(|item| format!("\"{}\"", String::from_utf8_lossy(item)))
        .collect::<Vec<_>>()
        .join(", ")
}

struct JmpOp;

impl Operation for JmpOp {
    fn mnemonic(&self) -> &'static str {
        "JMP"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        it.program_jump(true, false)
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        dump_jump(it, out)
    }
}

struct JmpTrueOp;

impl Operation for JmpTrueOp {
    fn mnemonic(&self) -> &'static str {
        "JMPTRUE"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let jump = it.test_result();
        it.program_jump(jump, false)
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        dump_jump(it, out)
    }
}

struct JmpFalseOp;

impl Operation for JmpFalseOp {
    fn mnemonic(&self) -> &'static str {
        "JMPFALSE"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let jump = !it.test_result();
        it.program_jump(jump, false)
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        dump_jump(it, out)
    }
}

struct StopOp;

impl Operation for StopOp {
    fn mnemonic(&self) -> &'static str {
        "STOP"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        it.trace(TraceLevel::Commands, "stop");
        it.stop();
        Ok(())
    }
}

struct KeepOp;

impl Operation for KeepOp {
    fn mnemonic(&self) -> &'static str {
        "KEEP"
    }

    fn execute(&self, it: &mut Interpreter<'_>, result: &mut SieveResult) -> RunResult<()> {
        let line = it.next_integer()? as u32;
        let side_effects = it.read_side_effects()?;
        it.trace(TraceLevel::Actions, "keep");
        result.add_keep(it.env(), side_effects, line)
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        let line = it.next_integer()?;
        let side_effects = it.read_side_effects()?;
        let _ = writeln!(out, "      line {line}");
        for effect in &side_effects {
            let _ = writeln!(out, "      + {}", effect.describe());
        }
        Ok(())
    }
}

struct DiscardOp;

impl Operation for DiscardOp {
    fn mnemonic(&self) -> &'static str {
        "DISCARD"
    }

    fn execute(&self, it: &mut Interpreter<'_>, result: &mut SieveResult) -> RunResult<()> {
        let line = it.next_integer()? as u32;
        it.trace(TraceLevel::Actions, "discard");
        result.add_action(it.env(), Box::new(DiscardAction), Vec::new(), line)
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        let line = it.next_integer()?;
        let _ = writeln!(out, "      line {line}");
        Ok(())
    }
}

struct RedirectOp;

impl Operation for RedirectOp {
    fn mnemonic(&self) -> &'static str {
        "REDIRECT"
    }

    fn execute(&self, it: &mut Interpreter<'_>, result: &mut SieveResult) -> RunResult<()> {
        let line = it.next_integer()? as u32;
        let address = String::from_utf8(it.read_operand_string()?).map_err(|_| {
            RuntimeError::Script { line, message: "invalid redirect address".to_string() }
        })?;
        if address.is_empty() {
            return Err(RuntimeError::Script {
                line,
                message: "redirect address is empty".to_string(),
            });
        }

        if result.redirect_count() >= result.max_redirects() {
            return Err(RuntimeError::Script {
                line,
                message: format!(
                    "number of redirect actions exceeds policy limit (max {} actions)",
                    result.max_redirects()
                ),
            });
        }

        // Suppress forwards this host already delivered for this message.
        let env = it.env();
        if let Some(tracker) = env.duplicates.as_ref()
            && let Some(id) = redirect_duplicate_id(it.message(), &address)
            && tracker.check(&id, &env.username)
        {
            it.trace(
                TraceLevel::Actions,
                &format!("redirect to <{address}> suppressed as duplicate"),
            );
            return Ok(());
        }

        it.trace(TraceLevel::Actions, &format!("redirect to <{address}>"));
        result.add_action(env, Box::new(RedirectAction::new(address)), Vec::new(), line)
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        let line = it.next_integer()?;
        let address = it.read_operand_string()?;
        let _ = writeln!(out, "      line {line} to <{}>", String::from_utf8_lossy(&address));
        Ok(())
    }
}

struct TestHeaderOp;

impl Operation for TestHeaderOp {
    fn mnemonic(&self) -> &'static str {
        "HEADER"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let match_type = it.read_operand_match_type()?;
        let comparator = it.read_operand_comparator()?;
        let headers = it.read_operand_string_list()?;
        let keys = it.read_operand_string_list()?;

        let mut session = MatchSession::new(match_type, comparator, keys, it.match_values_enabled())?;
        let msg = it.message();
        'search: for name in &headers {
            let name = String::from_utf8_lossy(name);
            for value in msg.header_values(&name) {
                if session.match_value(value.as_bytes())? {
                    break 'search;
                }
            }
        }

        let (matched, values) = session.finish();
        if let Some(values) = values {
            it.set_match_values(values);
        }
        it.trace(TraceLevel::Tests, &format!("header test => {matched}"));
        it.set_test_result(matched);
        Ok(())
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        let match_type = it.read_operand_match_type()?;
        let comparator = it.read_operand_comparator()?;
        let headers = it.read_operand_string_list()?;
        let keys = it.read_operand_string_list()?;
        let _ = writeln!(
            out,
            "      :{} {} [{}] [{}]",
            match_type.identifier(),
            comparator.identifier(),
            lossy_list(&headers),
            lossy_list(&keys)
        );
        Ok(())
    }
}

struct TestAddressOp;

impl Operation for TestAddressOp {
    fn mnemonic(&self) -> &'static str {
        "ADDRESS"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let match_type = it.read_operand_match_type()?;
        let comparator = it.read_operand_comparator()?;
        let part = it.read_operand_address_part()?;
        let headers = it.read_operand_string_list()?;
        let keys = it.read_operand_string_list()?;

        let mut session = MatchSession::new(match_type, comparator, keys, it.match_values_enabled())?;
        let msg = it.message();
        'search: for name in &headers {
            let name = String::from_utf8_lossy(name);
            for value in msg.header_values(&name) {
                for address in parse_addresses(value) {
                    let tested = part.extract(&address);
                    if session.match_value(tested.as_bytes())? {
                        break 'search;
                    }
                }
            }
        }

        let (matched, values) = session.finish();
        if let Some(values) = values {
            it.set_match_values(values);
        }
        it.trace(TraceLevel::Tests, &format!("address test => {matched}"));
        it.set_test_result(matched);
        Ok(())
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        let match_type = it.read_operand_match_type()?;
        let comparator = it.read_operand_comparator()?;
        let part = it.read_operand_address_part()?;
        let headers = it.read_operand_string_list()?;
        let keys = it.read_operand_string_list()?;
        let _ = writeln!(
            out,
            "      :{} {} {:?} [{}] [{}]",
            match_type.identifier(),
            comparator.identifier(),
            part,
            lossy_list(&headers),
            lossy_list(&keys)
        );
        Ok(())
    }
}

struct TestExistsOp;

impl Operation for TestExistsOp {
    fn mnemonic(&self) -> &'static str {
        "EXISTS"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let headers = it.read_operand_string_list()?;
        let msg = it.message();
        let matched = headers.iter().all(|name| {
            let name = String::from_utf8_lossy(name);
            msg.has_header(&name)
        });
        it.trace(TraceLevel::Tests, &format!("exists test => {matched}"));
        it.set_test_result(matched);
        Ok(())
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        let headers = it.read_operand_string_list()?;
        let _ = writeln!(out, "      [{}]", lossy_list(&headers));
        Ok(())
    }
}

struct TestSizeOverOp;

impl Operation for TestSizeOverOp {
    fn mnemonic(&self) -> &'static str {
        "SIZEOVER"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let limit = it.read_operand_number()?;
        let matched = it.message().size() as u64 > limit;
        it.trace(TraceLevel::Tests, &format!("size :over {limit} => {matched}"));
        it.set_test_result(matched);
        Ok(())
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        let limit = it.read_operand_number()?;
        let _ = writeln!(out, "      limit {limit}");
        Ok(())
    }
}

struct TestSizeUnderOp;

impl Operation for TestSizeUnderOp {
    fn mnemonic(&self) -> &'static str {
        "SIZEUNDER"
    }

    fn execute(&self, it: &mut Interpreter<'_>, _result: &mut SieveResult) -> RunResult<()> {
        let limit = it.read_operand_number()?;
        let matched = (it.message().size() as u64) < limit;
        it.trace(TraceLevel::Tests, &format!("size :under {limit} => {matched}"));
        it.set_test_result(matched);
        Ok(())
    }

    fn dump(&self, it: &mut Interpreter<'_>, out: &mut String) -> RunResult<()> {
        let limit = it.read_operand_number()?;
        let _ = writeln!(out, "      limit {limit}");
        Ok(())
    }
}

static JMP: JmpOp = JmpOp;
static JMP_TRUE: JmpTrueOp = JmpTrueOp;
static JMP_FALSE: JmpFalseOp = JmpFalseOp;
static STOP: StopOp = StopOp;
static KEEP: KeepOp = KeepOp;
static DISCARD: DiscardOp = DiscardOp;
static REDIRECT: RedirectOp = RedirectOp;
static TEST_HEADER: TestHeaderOp = TestHeaderOp;
static TEST_ADDRESS: TestAddressOp = TestAddressOp;
static TEST_EXISTS: TestExistsOp = TestExistsOp;
static TEST_SIZE_OVER: TestSizeOverOp = TestSizeOverOp;
static TEST_SIZE_UNDER: TestSizeUnderOp = TestSizeUnderOp;

/// The fixed core operation table; the opcode byte indexes it.
pub fn core_operations() -> &'static [&'static dyn Operation] {
    static TABLE: [&'static dyn Operation; 12] = [
        &JMP,
        &JMP_TRUE,
        &JMP_FALSE,
        &STOP,
        &KEEP,
        &DISCARD,
        &REDIRECT,
        &TEST_HEADER,
        &TEST_ADDRESS,
        &TEST_EXISTS,
        &TEST_SIZE_OVER,
        &TEST_SIZE_UNDER,
    ];
    &TABLE
}
