use std::collections::HashMap;
use std::sync::Arc;

use crate::binary::Binary;
use crate::extension::ExtensionRegistry;
use crate::operand::{AddressPart, CUSTOM_CODE_BASE, codes};
use crate::ops::opcodes;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssembleError {
    UnknownExtension(String),
    NotRequired(String),
    RequireAfterCode(String),
    DuplicateLabel(String),
    UnknownLabel(String),
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::UnknownExtension(name) => write!(f, "unknown extension '{name}'"),
            AssembleError::NotRequired(name) => {
                write!(f, "extension '{name}' used without being required")
            }
            AssembleError::RequireAfterCode(name) => {
                write!(f, "extension '{name}' required after code emission started")
            }
            AssembleError::DuplicateLabel(name) => write!(f, "duplicate label '{name}'"),
            AssembleError::UnknownLabel(name) => write!(f, "unknown label '{name}'"),
        }
    }
}

impl std::error::Error for AssembleError {}

/// Match-type selector for test emitters.
pub enum MatchSpec<'a> {
    Is,
    Contains,
    Matches,
    Ext(&'a str, u64),
}

/// Comparator selector for test emitters.
pub enum ComparatorSpec<'a> {
    Octet,
    AsciiCasemap,
    Ext(&'a str, u64),
}

/// Generator-facing builder over a fresh binary: links required extensions,
/// emits the program prologue, and provides typed operand emitters with
/// label/fixup jump resolution.
///
/// This is the emit half of the pipeline; parsing and validation of script
/// source stay with the host front-end.
pub struct ProgramBuilder {
    registry: Arc<ExtensionRegistry>,
    binary: Binary,
    required: Vec<u32>,
    prologue_done: bool,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String)>,
}

impl ProgramBuilder {
    pub fn new(registry: Arc<ExtensionRegistry>, script_name: Option<&str>) -> Self {
        Self {
            registry,
            binary: Binary::new(script_name.map(String::from)),
            required: Vec::new(),
            prologue_done: false,
            labels: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    /// Links an extension into the program, as a `require` statement would.
    /// Must precede any emitted code.
    pub fn require(&mut self, name: &str) -> Result<u32, AssembleError> {
        if self.prologue_done {
            return Err(AssembleError::RequireAfterCode(name.to_string()));
        }
        let ext_id = self
            .registry
            .by_name(name)
            .ok_or_else(|| AssembleError::UnknownExtension(name.to_string()))?;
        let index = self
            .binary
            .link_extension(&self.registry, ext_id)
            .map_err(|_| AssembleError::UnknownExtension(name.to_string()))?;
        if !self.required.contains(&index) {
            self.required.push(index);
        }
        Ok(index)
    }

    fn ensure_prologue(&mut self) {
        if self.prologue_done {
            return;
        }
        self.prologue_done = true;
        let required = std::mem::take(&mut self.required);
        self.binary.emit_integer(required.len() as u64);
        for index in &required {
            self.binary.emit_integer(u64::from(*index));
        }
        self.required = required;
    }

    /// Current code address, after the prologue.
    pub fn here(&mut self) -> usize {
        self.ensure_prologue();
        self.binary.code_size()
    }

    pub fn label(&mut self, name: &str) -> Result<(), AssembleError> {
        self.ensure_prologue();
        let address = self.binary.code_size();
        if self.labels.insert(name.to_string(), address).is_some() {
            return Err(AssembleError::DuplicateLabel(name.to_string()));
        }
        Ok(())
    }

    fn ext_code(&self, name: &str) -> Result<u8, AssembleError> {
        let ext_id = self
            .registry
            .by_name(name)
            .ok_or_else(|| AssembleError::UnknownExtension(name.to_string()))?;
        let index = self
            .binary
            .extension_index(ext_id)
            .ok_or_else(|| AssembleError::NotRequired(name.to_string()))?;
        Ok(CUSTOM_CODE_BASE + index as u8)
    }

    /* Raw emitters, used by extension emit helpers. */

    pub fn raw_byte(&mut self, byte: u8) {
        self.ensure_prologue();
        self.binary.emit_byte(byte);
    }

    pub fn raw_integer(&mut self, value: u64) {
        self.ensure_prologue();
        self.binary.emit_integer(value);
    }

    pub fn raw_string(&mut self, bytes: &[u8]) {
        self.ensure_prologue();
        self.binary.emit_string(bytes);
    }

    /* Operand emitters */

    pub fn emit_number(&mut self, value: u64) {
        self.raw_byte(codes::NUMBER);
        self.binary.emit_integer(value);
    }

    pub fn emit_string(&mut self, bytes: &[u8]) {
        self.raw_byte(codes::STRING);
        self.binary.emit_string(bytes);
    }

    pub fn emit_string_list(&mut self, items: &[&[u8]]) {
        self.raw_byte(codes::STRING_LIST);
        self.binary.emit_integer(items.len() as u64);
        for item in items {
            self.emit_string(item);
        }
    }

    /// Emits the operand header for an extension-provided string operand;
    /// the caller emits the payload.
    pub fn emit_ext_string_operand(&mut self, ext: &str, sub: u64) -> Result<(), AssembleError> {
        let code = self.ext_code(ext)?;
        self.raw_byte(code);
        self.binary.emit_integer(sub);
        Ok(())
    }

    pub fn emit_match_type(&mut self, spec: &MatchSpec<'_>) -> Result<(), AssembleError> {
        self.raw_byte(codes::MATCH_TYPE);
        match spec {
            MatchSpec::Is => self.binary.emit_byte(0),
            MatchSpec::Contains => self.binary.emit_byte(1),
            MatchSpec::Matches => self.binary.emit_byte(2),
            MatchSpec::Ext(name, sub) => {
                let code = self.ext_code(name)?;
                self.binary.emit_byte(code);
                self.binary.emit_integer(*sub)
            }
        };
        Ok(())
    }

    pub fn emit_comparator(&mut self, spec: &ComparatorSpec<'_>) -> Result<(), AssembleError> {
        self.raw_byte(codes::COMPARATOR);
        match spec {
            ComparatorSpec::Octet => self.binary.emit_byte(0),
            ComparatorSpec::AsciiCasemap => self.binary.emit_byte(1),
            ComparatorSpec::Ext(name, sub) => {
                let code = self.ext_code(name)?;
                self.binary.emit_byte(code);
                self.binary.emit_integer(*sub)
            }
        };
        Ok(())
    }

    pub fn emit_address_part(&mut self, part: AddressPart) {
        self.raw_byte(codes::ADDRESS_PART);
        self.binary.emit_byte(part.code());
    }

    /// Emits the operand header for one side effect; the definition's
    /// payload follows, emitted by the extension helper.
    pub fn emit_side_effect(&mut self, ext: &str, sub: u64) -> Result<(), AssembleError> {
        let code = self.ext_code(ext)?;
        self.raw_byte(codes::SIDE_EFFECT);
        self.binary.emit_byte(code);
        self.binary.emit_integer(sub);
        Ok(())
    }

    /* Opcode emitters */

    pub fn emit_opcode(&mut self, opcode: u8) {
        self.raw_byte(opcode);
    }

    /// Emits the opcode selecting an extension operation.
    pub fn emit_ext_op(&mut self, ext: &str, op: u64) -> Result<(), AssembleError> {
        let code = self.ext_code(ext)?;
        self.raw_byte(code);
        self.binary.emit_integer(op);
        Ok(())
    }

    /// Emits a 4-byte offset slot resolved against `label` at finish time.
    pub fn emit_jump_to(&mut self, label: &str) {
        self.ensure_prologue();
        let slot = self.binary.code_size();
        self.binary.emit_offset(0);
        self.fixups.push((slot, label.to_string()));
    }

    pub fn op_jmp(&mut self, label: &str) {
        self.emit_opcode(opcodes::JMP);
        self.emit_jump_to(label);
    }

    pub fn op_jmp_true(&mut self, label: &str) {
        self.emit_opcode(opcodes::JMP_TRUE);
        self.emit_jump_to(label);
    }

    pub fn op_jmp_false(&mut self, label: &str) {
        self.emit_opcode(opcodes::JMP_FALSE);
        self.emit_jump_to(label);
    }

    pub fn op_stop(&mut self) {
        self.emit_opcode(opcodes::STOP);
    }

    /// `keep` with a side-effect list: the caller emits `effect_count`
    /// side-effect operands directly after this call.
    pub fn op_keep_with_effects(&mut self, line: u32, effect_count: u64) {
        self.emit_opcode(opcodes::KEEP);
        self.binary.emit_integer(u64::from(line));
        self.binary.emit_integer(effect_count);
    }

    pub fn op_keep(&mut self, line: u32) {
        self.op_keep_with_effects(line, 0);
    }

    pub fn op_discard(&mut self, line: u32) {
        self.emit_opcode(opcodes::DISCARD);
        self.binary.emit_integer(u64::from(line));
    }

    pub fn op_redirect(&mut self, line: u32, address: &str) {
        self.emit_opcode(opcodes::REDIRECT);
        self.binary.emit_integer(u64::from(line));
        self.emit_string(address.as_bytes());
    }

    pub fn test_header(
        &mut self,
        match_type: &MatchSpec<'_>,
        comparator: &ComparatorSpec<'_>,
        headers: &[&str],
        keys: &[&str],
    ) -> Result<(), AssembleError> {
        self.emit_opcode(opcodes::TEST_HEADER);
        self.emit_match_type(match_type)?;
        self.emit_comparator(comparator)?;
        let headers: Vec<&[u8]> = headers.iter().map(|h| h.as_bytes()).collect();
        self.emit_string_list(&headers);
        let keys: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
        self.emit_string_list(&keys);
        Ok(())
    }

    pub fn test_address(
        &mut self,
        match_type: &MatchSpec<'_>,
        comparator: &ComparatorSpec<'_>,
        part: AddressPart,
        headers: &[&str],
        keys: &[&str],
    ) -> Result<(), AssembleError> {
        self.emit_opcode(opcodes::TEST_ADDRESS);
        self.emit_match_type(match_type)?;
        self.emit_comparator(comparator)?;
        self.emit_address_part(part);
        let headers: Vec<&[u8]> = headers.iter().map(|h| h.as_bytes()).collect();
        self.emit_string_list(&headers);
        let keys: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
        self.emit_string_list(&keys);
        Ok(())
    }

    pub fn test_exists(&mut self, headers: &[&str]) {
        self.emit_opcode(opcodes::TEST_EXISTS);
        let headers: Vec<&[u8]> = headers.iter().map(|h| h.as_bytes()).collect();
        self.emit_string_list(&headers);
    }

    pub fn test_size_over(&mut self, limit: u64) {
        self.emit_opcode(opcodes::TEST_SIZE_OVER);
        self.emit_number(limit);
    }

    pub fn test_size_under(&mut self, limit: u64) {
        self.emit_opcode(opcodes::TEST_SIZE_UNDER);
        self.emit_number(limit);
    }

    /// Resolves all pending jumps and returns the finished binary.
    pub fn finish(mut self) -> Result<Binary, AssembleError> {
        self.ensure_prologue();
        for (slot, label) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&label)
                .ok_or_else(|| AssembleError::UnknownLabel(label.clone()))?;
            let offset = target as i64 - slot as i64;
            self.binary.patch_data(slot, &(offset as i32).to_be_bytes());
        }
        Ok(self.binary)
    }
}
