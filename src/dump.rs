//! Human-readable rendering of a compiled binary, for `sievec -d`-style
//! tooling and debugging. Dumping shares the operation dispatch with the
//! interpreter, so corrupt code is reported instead of misread.

use std::fmt::Write as _;

use crate::binary::Binary;
use crate::extension::ExtensionRegistry;
use crate::interpreter::Interpreter;
use crate::runtime::{MessageData, ScriptEnv};

/// Renders the binary's structure and a listing of the main program.
pub fn dump_binary(registry: &ExtensionRegistry, binary: &Binary) -> String {
    let mut out = String::new();
    match binary.script_name() {
        Some(name) => {
            let _ = writeln!(out, "binary for script '{name}' ({} blocks):", binary.block_count());
        }
        None => {
            let _ = writeln!(out, "binary ({} blocks):", binary.block_count());
        }
    }
    let _ = writeln!(out, "extensions ({}):", binary.extension_count());
    for ext in binary.linked_extensions() {
        match ext.block_id {
            Some(block) => {
                let _ = writeln!(out, "  [{:02}] {} (block {block})", ext.index, ext.name);
            }
            None => {
                let _ = writeln!(out, "  [{:02}] {}", ext.index, ext.name);
            }
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "main program:");

    let msg = MessageData::default();
    let env = ScriptEnv::default();
    let mut it = match Interpreter::new(registry, binary, &msg, &env) {
        Ok(it) => it,
        Err(err) => {
            let _ = writeln!(out, "  ; {err}");
            return out;
        }
    };

    while it.pc() < it.block_len() {
        let address = it.pc();
        let op = match it.fetch_operation() {
            Ok(op) => op,
            Err(err) => {
                let _ = writeln!(out, "{address:08x}: ; {err}");
                return out;
            }
        };
        let _ = writeln!(out, "{address:08x}: {}", op.mnemonic());
        if let Err(err) = op.dump(&mut it, &mut out) {
            let _ = writeln!(out, "      ; {err}");
            return out;
        }
    }
    out
}
