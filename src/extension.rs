use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::binary::{Binary, BinaryError};
use crate::comparator::Comparator;
use crate::interpreter::Interpreter;
use crate::matching::MatchType;
use crate::operand::{SideEffectDef, StringOperandDef};
use crate::ops::Operation;
use crate::runtime::RunResult;

/// Stable identity of an extension for the lifetime of the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExtensionId(pub(crate) usize);

impl ExtensionId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A named bundle of operations, match types, comparators, operands and
/// side effects, together with lifecycle hooks bracketing binary and
/// interpreter lifetimes.
///
/// Preloaded extensions model core language features (match types,
/// comparators, address parts) and are available to every binary without a
/// link-table entry; regular extensions are linked only when a script
/// requires them.
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    fn preloaded(&self) -> bool {
        false
    }

    /// Capability string advertised to the host, if different from `name`.
    fn capability(&self) -> Option<&'static str> {
        None
    }

    /// Invoked when a binary this extension is linked into is (re)loaded.
    fn binary_load(&self, _binary: &mut Binary, _id: ExtensionId) -> Result<(), BinaryError> {
        Ok(())
    }

    /// Invoked before a binary is serialised so deferred data can be
    /// flushed into extension blocks.
    fn binary_save(&self, _binary: &mut Binary, _id: ExtensionId) -> Result<(), BinaryError> {
        Ok(())
    }

    /// Invoked from the program prologue; may consume further operands.
    fn interpreter_load(&self, _it: &mut Interpreter<'_>, _id: ExtensionId) -> RunResult<()> {
        Ok(())
    }

    /// Invoked when interpretation starts.
    fn interpreter_run(&self, _it: &mut Interpreter<'_>, _id: ExtensionId) -> RunResult<()> {
        Ok(())
    }

    /// Operation table, indexed by the varint code following the extension
    /// opcode.
    fn operations(&self) -> &[&'static dyn Operation] {
        &[]
    }

    fn match_types(&self) -> &[&'static dyn MatchType] {
        &[]
    }

    fn comparators(&self) -> &[&'static dyn Comparator] {
        &[]
    }

    fn side_effects(&self) -> &[&'static dyn SideEffectDef] {
        &[]
    }

    fn string_operands(&self) -> &[&'static dyn StringOperandDef] {
        &[]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    Frozen(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Frozen(name) => {
                write!(f, "cannot register extension '{name}': registry is frozen")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Append-only catalogue of extensions, addressable by name and by the
/// integer id allocated at registration. Registration is idempotent by
/// name and forbidden once the first binary has been loaded.
pub struct ExtensionRegistry {
    extensions: Vec<Arc<dyn Extension>>,
    by_name: HashMap<&'static str, ExtensionId>,
    frozen: AtomicBool,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self {
            extensions: Vec::new(),
            by_name: HashMap::new(),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn register(&mut self, ext: Arc<dyn Extension>) -> Result<ExtensionId, RegistryError> {
        let name = ext.name();
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        if self.frozen.load(Ordering::Acquire) {
            return Err(RegistryError::Frozen(name.to_string()));
        }
        let id = ExtensionId(self.extensions.len());
        self.extensions.push(ext);
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Called on the first binary load; registrations after this fail.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn get(&self, id: ExtensionId) -> Option<&Arc<dyn Extension>> {
        self.extensions.get(id.0)
    }

    pub fn by_name(&self, name: &str) -> Option<ExtensionId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExtensionId, &Arc<dyn Extension>)> {
        self.extensions.iter().enumerate().map(|(i, e)| (ExtensionId(i), e))
    }

    pub fn preloaded(&self) -> impl Iterator<Item = (ExtensionId, &Arc<dyn Extension>)> {
        self.iter().filter(|(_, e)| e.preloaded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    impl Extension for Dummy {
        fn name(&self) -> &'static str {
            "vnd.test.dummy"
        }
    }

    #[test]
    fn registration_is_idempotent_by_name() {
        let mut registry = ExtensionRegistry::new();
        let first = registry.register(Arc::new(Dummy)).unwrap();
        let second = registry.register(Arc::new(Dummy)).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_name("vnd.test.dummy"), Some(first));
    }

    #[test]
    fn frozen_registry_rejects_new_extensions() {
        let mut registry = ExtensionRegistry::new();
        let id = registry.register(Arc::new(Dummy)).unwrap();
        registry.freeze();

        // Re-registration of a known name still resolves...
        assert_eq!(registry.register(Arc::new(Dummy)).unwrap(), id);

        // ...but genuinely new extensions are refused.
        struct Late;
        impl Extension for Late {
            fn name(&self) -> &'static str {
                "vnd.test.late"
            }
        }
        assert!(matches!(
            registry.register(Arc::new(Late)),
            Err(RegistryError::Frozen(_))
        ));
    }
}
